//! K-way streaming merge of sorted record streams.
//!
//! Pulls from N sorted streams through a min-heap and emits a single stream
//! ordered by the chosen comparator, tagging each record with the index of
//! the stream it came from. Input sort order is validated as records are
//! pulled; disagreement between files on chromosome order is logged and
//! tolerated, since the merge cannot repair it.

use std::collections::HashSet;

use log::{debug, warn};

use crate::error::{RelateError, Result};
use crate::position::{same_chrom, strip_chr, Positioned};
use crate::queue::RelatableQueue;
use crate::relatable::Relatable;
use crate::stream::BoxedStream;

/// How many records to keep pulling after the `relative_to` stream is
/// exhausted. Database records far beyond the last query record cannot
/// relate to anything, so the merge stops early rather than draining every
/// database to EOF.
pub const DEFAULT_STOP_AFTER: usize = 200_000;

/// A k-way merge over sorted record streams.
///
/// Yields `Relatable<T>` in `less` order. Each stream slot is dropped as
/// soon as it reports EOF, releasing its resources.
pub struct Merger<T, L> {
    streams: Vec<Option<BoxedStream<T>>>,
    q: RelatableQueue<Relatable<T>, L>,
    relative_to: Option<u32>,
    stop_after: usize,
    countdown: Option<usize>,
    seen: HashSet<String>,
    last_chrom: String,
    failed: bool,
}

impl<T, L> Merger<T, L>
where
    T: Positioned,
    L: Fn(&Relatable<T>, &Relatable<T>) -> bool,
{
    /// Prime the merge by pulling one record from every stream.
    ///
    /// Source indices are assigned here, in stream order. Empty streams are
    /// closed immediately. The first record of a failing stream surfaces
    /// the failure from the constructor.
    pub fn new(
        less: L,
        relative_to: Option<u32>,
        streams: Vec<BoxedStream<T>>,
    ) -> Result<Self> {
        let mut q = RelatableQueue::with_capacity(streams.len(), less);
        let mut slots = Vec::with_capacity(streams.len());

        for (i, mut stream) in streams.into_iter().enumerate() {
            match stream.next_record()? {
                Some(rec) => {
                    q.push(Relatable::new(rec, i as u32));
                    slots.push(Some(stream));
                }
                None => slots.push(None),
            }
        }

        Ok(Self {
            streams: slots,
            q,
            relative_to,
            stop_after: DEFAULT_STOP_AFTER,
            countdown: None,
            seen: HashSet::new(),
            last_chrom: String::new(),
            failed: false,
        })
    }

    /// Override the early-stop record count. `usize::MAX` disables the
    /// heuristic entirely.
    pub fn stop_after(mut self, n: usize) -> Self {
        self.stop_after = n;
        self
    }

    fn close_all(&mut self) {
        self.streams.clear();
        self.q.clear();
    }

    fn track_chrom(&mut self, chrom: &str, source: u32) {
        if same_chrom(chrom, &self.last_chrom) {
            return;
        }
        self.last_chrom = strip_chr(chrom).to_string();
        if self.seen.contains(&self.last_chrom) {
            warn!(
                "chromosome {} reappeared from source {}: files disagree on \
                 chromosome order or the sort order is not as expected",
                self.last_chrom, source
            );
            warn!(
                "overlaps will likely be missed after chromosome {}",
                self.last_chrom
            );
        }
        self.seen.insert(self.last_chrom.clone());
        debug!("on chromosome {}", self.last_chrom);
    }
}

impl<T, L> Iterator for Merger<T, L>
where
    T: Positioned,
    L: Fn(&Relatable<T>, &Relatable<T>) -> bool,
{
    type Item = Result<Relatable<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if self.countdown == Some(0) {
            self.close_all();
            return None;
        }
        let interval = self.q.pop()?;
        let source = interval.source();
        self.track_chrom(interval.chrom(), source);

        // Replace the emitted record with the next from the same stream.
        if let Some(slot) = self.streams.get_mut(source as usize) {
            if let Some(stream) = slot {
                match stream.next_record() {
                    Ok(Some(rec)) => {
                        if rec.start() < interval.start()
                            && same_chrom(rec.chrom(), interval.chrom())
                        {
                            self.failed = true;
                            let err = RelateError::InputNotSorted {
                                source_idx: source,
                                prev_start: interval.start(),
                                new_start: rec.start(),
                            };
                            self.close_all();
                            return Some(Err(err));
                        }
                        self.q.push(Relatable::new(rec, source));
                    }
                    Ok(None) => {
                        *slot = None;
                        if self.relative_to == Some(source) {
                            self.countdown = Some(self.stop_after);
                        }
                    }
                    Err(e) => {
                        self.failed = true;
                        self.close_all();
                        return Some(Err(e));
                    }
                }
            }
        }

        if let Some(n) = self.countdown.as_mut() {
            *n = n.saturating_sub(1);
        }
        Some(Ok(interval))
    }
}
