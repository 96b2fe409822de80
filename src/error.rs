//! Error types shared by the merge, sweep and parallel pipelines.

use std::io;
use thiserror::Error;

/// Errors surfaced while merging, sweeping or querying interval streams.
///
/// Nothing is retried internally: on any error the affected pipeline closes
/// its streams and channels, and the output already emitted remains a valid
/// sorted prefix.
#[derive(Error, Debug)]
pub enum RelateError {
    /// A source yielded a record with a smaller start than its predecessor on
    /// the same chromosome. Fatal to the current sweep.
    #[error("intervals out of order within source {source_idx}: starts at {prev_start} then {new_start}")]
    InputNotSorted {
        source_idx: u32,
        prev_start: u32,
        new_start: u32,
    },

    /// A parse or I/O failure from an upstream record stream.
    #[error("record stream failed: {0}")]
    Iterator(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// A region query against a database failed. The affected chunk is
    /// abandoned and no further chunks are submitted.
    #[error("region query failed: {0}")]
    Query(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// A region string could not be parsed as `chrom` or `chrom:start-end`.
    #[error("unable to parse region: {0}")]
    BadRegion(String),

    /// The read-order restoration buffer grew past its cap, meaning a
    /// confidence interval was wider than its surrounding chunk.
    #[error("reorder buffer exceeded {pending} pending records")]
    ReorderOverflow { pending: usize },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl RelateError {
    /// Wrap an upstream iterator failure.
    pub fn iterator<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        RelateError::Iterator(Box::new(err))
    }

    /// Wrap a failed region query.
    pub fn query<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        RelateError::Query(Box::new(err))
    }
}

pub type Result<T> = std::result::Result<T, RelateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_sorted_message() {
        let err = RelateError::InputNotSorted {
            source_idx: 2,
            prev_start: 200,
            new_start: 100,
        };
        let msg = err.to_string();
        assert!(msg.contains("source 2"));
        assert!(msg.contains("200"));
        assert!(msg.contains("100"));
    }

    #[test]
    fn test_wrapped_io_error() {
        let io_err = io::Error::new(io::ErrorKind::UnexpectedEof, "truncated");
        let err = RelateError::iterator(io_err);
        assert!(err.to_string().contains("record stream failed"));
    }
}
