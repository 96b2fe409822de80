// Clippy allows for the whole crate
#![allow(clippy::too_many_arguments)]
#![allow(clippy::type_complexity)]

//! chromsweep: streaming relation testing of sorted interval streams.
//!
//! Given any number of sorted interval sources, the sweep produces a single
//! sorted stream in which each record carries the set of records it relates
//! to (by overlap, proximity, or any monotone predicate) from the other
//! sources.
//!
//! # Features
//!
//! - **Streaming**: memory is bounded by local interval density, not file
//!   size; a k-way merge feeds a sweep line with a small active cache
//! - **Parallel mode**: the query stream is chunked by coordinate range and
//!   swept concurrently against indexed databases, with output reassembled
//!   in order
//! - **Format-agnostic**: anything implementing [`position::Positioned`]
//!   flows through; parsers and indexes stay outside the crate
//!
//! # Example
//!
//! ```rust
//! use chromsweep::prelude::*;
//!
//! let a = SliceStream::new(vec![Interval::new("chr1", 100, 200)]);
//! let b = SliceStream::new(vec![Interval::new("chr1", 150, 250)]);
//! let streams: Vec<BoxedStream<Interval>> = vec![Box::new(a), Box::new(b)];
//!
//! let sweep = Sweep::new(check_related_by_overlap, None, less, streams).unwrap();
//! for result in sweep {
//!     let record = result.unwrap();
//!     println!(
//!         "{}\t{}\t{}\t{}",
//!         record.chrom(),
//!         record.start(),
//!         record.end(),
//!         record.related().len()
//!     );
//! }
//! ```

pub mod ci;
pub mod compare;
pub mod error;
pub mod interval;
pub mod merger;
pub mod parallel;
pub mod position;
pub mod queue;
pub mod relatable;
pub mod stream;
pub mod sweep;

// Re-export commonly used types
pub use error::{RelateError, Result};
pub use interval::Interval;
pub use merger::Merger;
pub use parallel::ParallelRelater;
pub use relatable::Relatable;
pub use stream::{BoxedStream, Queryable, RecordStream, Region};
pub use sweep::Sweep;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::ci::CiExtended;
    pub use crate::compare::{less, less_prefix, natural_less_prefix};
    pub use crate::error::{RelateError, Result};
    pub use crate::interval::Interval;
    pub use crate::merger::Merger;
    pub use crate::parallel::{ParallelRelater, RelateFn, RelatedStream};
    pub use crate::position::{
        overlaps_position, same_chrom, same_position, same_variant, strip_chr, ConfidenceBounds,
        Positioned, RefAlt,
    };
    pub use crate::queue::RelatableQueue;
    pub use crate::relatable::Relatable;
    pub use crate::stream::{
        BoxedStream, MemoryQueryable, Queryable, RecordStream, Region, SharedQueryable,
        SliceStream,
    };
    pub use crate::sweep::{check_knn, check_overlap_prefix, check_related_by_overlap, Sweep};
}

#[cfg(test)]
mod tests {
    use crate::prelude::*;

    #[test]
    fn test_basic_workflow() {
        let a = SliceStream::new(vec![
            Interval::new("chr1", 100, 200),
            Interval::new("chr1", 300, 400),
        ]);
        let b = SliceStream::new(vec![Interval::new("chr1", 150, 250)]);
        let streams: Vec<BoxedStream<Interval>> = vec![Box::new(a), Box::new(b)];

        let sweep = Sweep::new(check_related_by_overlap, Some(0), less, streams).unwrap();
        let out: Vec<Relatable<Interval>> = sweep.map(|r| r.unwrap()).collect();

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].related().len(), 1);
        assert!(out[1].related().is_empty());
    }
}
