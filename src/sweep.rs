//! The chrom-sweep: streaming relation testing over a merged sorted stream.
//!
//! The sweep pulls records from a k-way merge in sorted order and keeps an
//! active cache of records that may still relate to something arriving
//! later. When a newly arrived record fails `check_related` against a
//! cached record, the cached record can never relate to anything else (the
//! predicate is monotone in sort order), so it moves to the send queue and
//! is emitted as soon as it provably precedes everything still cached.
//!
//! Memory is bounded by the local interval density, not by input size.

use crate::error::Result;
use crate::merger::Merger;
use crate::position::{same_chrom, Positioned};
use crate::queue::RelatableQueue;
use crate::relatable::Relatable;
use crate::stream::BoxedStream;

/// The canonical relation predicate: half-open overlap on the same
/// chromosome. `b` is always at or after `a` in sort order, so one side of
/// the intersection test suffices.
#[inline]
pub fn check_related_by_overlap<T: Positioned>(a: &Relatable<T>, b: &Relatable<T>) -> bool {
    b.start() < a.end() && b.chrom() == a.chrom()
}

/// Overlap with `chr`-prefix-insensitive chromosome comparison, for inputs
/// that mix `chr1` and `1` naming.
#[inline]
pub fn check_overlap_prefix<T: Positioned>(a: &Relatable<T>, b: &Relatable<T>) -> bool {
    b.start() < a.end() && same_chrom(a.chrom(), b.chrom())
}

/// Experimental k-nearest-neighbor predicate.
///
/// Returns true until `a` has accumulated at least k relations, then only
/// for candidates closer than the most recently attached one. This
/// guarantees *at least* k neighbors are attached; the consumer filters
/// ties and extras.
pub fn check_knn<T: Positioned>(a: &Relatable<T>, b: &Relatable<T>) -> bool {
    const K: usize = 4;
    let related = a.related();
    if related.len() < K {
        return true;
    }
    let a_end = a.end() as i64;
    let farthest = related[related.len() - 1].start() as i64 - a_end;
    b.start() as i64 - a_end < farthest
}

/// True when `relative_to` lets records from `source` through to the
/// output.
#[inline]
fn passes(relative_to: Option<u32>, source: u32) -> bool {
    relative_to.map_or(true, |k| k == source)
}

/// Attach the relation between two records according to `relative_to`.
///
/// With `relative_to = None` both sides gain a handle to the other; with
/// `Some(k)` only records from stream `k` collect relations. Records from
/// the same source are never related.
fn relate<T: Positioned>(a: &mut Relatable<T>, b: &mut Relatable<T>, relative_to: Option<u32>) {
    if a.source() == b.source() {
        return;
    }
    match relative_to {
        None => {
            let (ha, hb) = (a.share(), b.share());
            a.add_related(hb);
            b.add_related(ha);
        }
        Some(k) => {
            if a.source() == k {
                a.add_related(b.share());
            }
            if b.source() == k {
                b.add_related(a.share());
            }
        }
    }
}

/// A streaming sweep over any number of sorted streams.
///
/// Yields records in `less` order; each record that passes the
/// `relative_to` filter is emitted exactly once, carrying every relation it
/// will ever acquire. The `check_related` predicate must be monotone with
/// respect to `less`: once it returns false for some later record, it must
/// return false for everything after that record.
pub struct Sweep<T, F, L> {
    check_related: F,
    relative_to: Option<u32>,
    less: L,
    merge: Merger<T, L>,
    cache: Vec<Relatable<T>>,
    scratch: Vec<Relatable<T>>,
    send_q: RelatableQueue<Relatable<T>, L>,
    drained: bool,
    failed: bool,
}

impl<T, F, L> Sweep<T, F, L>
where
    T: Positioned,
    F: Fn(&Relatable<T>, &Relatable<T>) -> bool,
    L: Fn(&Relatable<T>, &Relatable<T>) -> bool + Clone,
{
    /// Build the sweep over `streams`, merging them internally.
    ///
    /// `less` must agree with the sort order of every stream.
    pub fn new(
        check_related: F,
        relative_to: Option<u32>,
        less: L,
        streams: Vec<BoxedStream<T>>,
    ) -> Result<Self> {
        let merge = Merger::new(less.clone(), relative_to, streams)?;
        Ok(Self::over(check_related, relative_to, less, merge))
    }

    /// Build the sweep over an existing merge, e.g. one with a custom
    /// early-stop threshold.
    pub fn over(check_related: F, relative_to: Option<u32>, less: L, merge: Merger<T, L>) -> Self {
        Self {
            check_related,
            relative_to,
            less: less.clone(),
            merge,
            cache: Vec::with_capacity(1024),
            scratch: Vec::with_capacity(1024),
            send_q: RelatableQueue::with_capacity(1024, less),
            drained: false,
            failed: false,
        }
    }

    /// Run one arriving record against the cache, evicting everything it
    /// proves finished.
    fn admit(&mut self, mut interval: Relatable<T>) {
        std::mem::swap(&mut self.cache, &mut self.scratch);
        for mut cached in self.scratch.drain(..) {
            if (self.check_related)(&cached, &interval) {
                relate(&mut cached, &mut interval, self.relative_to);
                self.cache.push(cached);
            } else if passes(self.relative_to, cached.source()) {
                self.send_q.push(cached);
            }
        }
        self.cache.push(interval);
    }

    /// The queue head may be emitted once it sorts before everything still
    /// cached; nothing that arrives later can relate to it.
    fn ready_to_emit(&self) -> bool {
        match (self.send_q.peek(), self.cache.first()) {
            (Some(top), Some(front)) => (self.less)(top, front),
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    fn fail(&mut self) {
        self.failed = true;
        self.cache.clear();
        self.scratch.clear();
        self.send_q.clear();
    }
}

impl<T, F, L> Iterator for Sweep<T, F, L>
where
    T: Positioned,
    F: Fn(&Relatable<T>, &Relatable<T>) -> bool,
    L: Fn(&Relatable<T>, &Relatable<T>) -> bool + Clone,
{
    type Item = Result<Relatable<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if self.ready_to_emit() {
                return self.send_q.pop().map(Ok);
            }
            if self.drained {
                return self.send_q.pop().map(Ok);
            }
            match self.merge.next() {
                Some(Ok(interval)) => self.admit(interval),
                Some(Err(e)) => {
                    self.fail();
                    return Some(Err(e));
                }
                None => {
                    self.drained = true;
                    let relative_to = self.relative_to;
                    for cached in self.cache.drain(..) {
                        if passes(relative_to, cached.source()) {
                            self.send_q.push(cached);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compare::less;
    use crate::interval::Interval;
    use crate::stream::SliceStream;

    fn boxed(items: Vec<Interval>) -> BoxedStream<Interval> {
        Box::new(SliceStream::new(items))
    }

    fn sweep_all(
        relative_to: Option<u32>,
        streams: Vec<BoxedStream<Interval>>,
    ) -> Vec<Relatable<Interval>> {
        Sweep::new(check_related_by_overlap, relative_to, less, streams)
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
    }

    #[test]
    fn test_relate_both_directions() {
        let mut a = Relatable::new(Interval::new("chr1", 1234, 5678), 1);
        let mut b = Relatable::new(Interval::new("chr1", 9234, 9678), 0);

        relate(&mut a, &mut b, None);
        assert_eq!(a.related().len(), 1);
        assert_eq!(b.related().len(), 1);
        assert_eq!(a.related()[0].start(), 9234);
        assert_eq!(b.related()[0].start(), 1234);
    }

    #[test]
    fn test_relate_relative_to_one_side() {
        let mut a = Relatable::new(Interval::new("chr1", 1234, 5678), 1);
        let mut b = Relatable::new(Interval::new("chr1", 9234, 9678), 0);

        relate(&mut a, &mut b, Some(1));
        assert_eq!(a.related().len(), 1);
        assert_eq!(b.related().len(), 0);

        relate(&mut a, &mut b, Some(0));
        assert_eq!(a.related().len(), 1);
        assert_eq!(b.related().len(), 1);
    }

    #[test]
    fn test_relate_same_source_is_skipped() {
        let mut a = Relatable::new(Interval::new("chr1", 100, 200), 0);
        let mut b = Relatable::new(Interval::new("chr1", 150, 250), 0);
        relate(&mut a, &mut b, None);
        assert!(a.related().is_empty());
        assert!(b.related().is_empty());
    }

    #[test]
    fn test_non_overlapping_records_have_empty_related() {
        let out = sweep_all(
            None,
            vec![
                boxed(vec![Interval::new("chr1", 9234, 9678)]),
                boxed(vec![Interval::new("chr1", 1234, 5678)]),
            ],
        );
        assert_eq!(out.len(), 2);
        for rec in &out {
            assert!(rec.related().is_empty(), "9234 >= 5678 means no overlap");
        }
    }

    #[test]
    fn test_overlapping_records_relate_across_sources() {
        let out = sweep_all(
            None,
            vec![
                boxed(vec![Interval::new("chr1", 100, 200)]),
                boxed(vec![Interval::new("chr1", 150, 250)]),
            ],
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].related().len(), 1);
        assert_eq!(out[1].related().len(), 1);
    }

    #[test]
    fn test_relative_to_filters_output() {
        let out = sweep_all(
            Some(0),
            vec![
                boxed(vec![Interval::new("chr1", 100, 200)]),
                boxed(vec![
                    Interval::new("chr1", 150, 250),
                    Interval::new("chr1", 400, 500),
                ]),
            ],
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].source(), 0);
        assert_eq!(out[0].related().len(), 1);
    }

    #[test]
    fn test_empty_input() {
        let out = sweep_all(None, vec![boxed(vec![]), boxed(vec![])]);
        assert!(out.is_empty());
    }

    #[test]
    fn test_single_record() {
        let out = sweep_all(None, vec![boxed(vec![Interval::new("chr1", 5, 10)])]);
        assert_eq!(out.len(), 1);
        assert!(out[0].related().is_empty());
    }

    #[test]
    fn test_chromosome_change_flushes_cache() {
        // the chr1 record must be emitted before chr2 is admitted, and the
        // two never relate
        let out = sweep_all(
            None,
            vec![
                boxed(vec![Interval::new("chr1", 100, 200)]),
                boxed(vec![Interval::new("chr2", 100, 200)]),
            ],
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].chrom(), "chr1");
        assert_eq!(out[1].chrom(), "chr2");
        assert!(out[0].related().is_empty());
        assert!(out[1].related().is_empty());
    }

    #[test]
    fn test_output_is_sorted() {
        let mk = || {
            boxed(vec![
                Interval::new("chr1", 10, 20),
                Interval::new("chr1", 15, 300),
                Interval::new("chr1", 200, 250),
                Interval::new("chr2", 5, 6),
            ])
        };
        let out = sweep_all(None, vec![mk(), mk()]);
        assert_eq!(out.len(), 8);
        for w in out.windows(2) {
            assert!(!less(&w[1], &w[0]), "output must be non-decreasing");
        }
    }

    #[test]
    fn test_self_sweep_is_idempotent_on_cardinality() {
        // a stream against itself: related counts are stable across runs
        let mk = || {
            boxed(vec![
                Interval::new("chr1", 10, 100),
                Interval::new("chr1", 50, 150),
                Interval::new("chr1", 400, 500),
            ])
        };
        let run = || -> Vec<usize> {
            sweep_all(None, vec![mk(), mk()])
                .iter()
                .map(|r| r.related().len())
                .collect()
        };
        let first = run();
        assert_eq!(first, run());
        // five overlapping cross-source pairs, each related in both
        // directions
        assert_eq!(first.iter().sum::<usize>(), 10);
    }

    #[test]
    fn test_sweep_over_custom_merge() {
        use crate::merger::Merger;

        let query = boxed(vec![Interval::new("chr1", 100, 200)]);
        let db = boxed(vec![
            Interval::new("chr1", 150, 250),
            Interval::new("chr1", 300, 400),
        ]);
        let merge = Merger::new(less, Some(0), vec![query, db])
            .unwrap()
            .stop_after(usize::MAX);
        let out: Vec<Relatable<Interval>> =
            Sweep::over(check_related_by_overlap, Some(0), less, merge)
                .map(|r| r.unwrap())
                .collect();

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].related().len(), 1);
    }

    #[test]
    fn test_check_knn_caps_after_k() {
        let mut a = Relatable::new(Interval::new("chr1", 100, 200), 0);
        let near = Relatable::new(Interval::new("chr1", 210, 220), 1);
        let far = Relatable::new(Interval::new("chr1", 900, 910), 1);

        for _ in 0..4 {
            assert!(check_knn(&a, &far));
            a.add_related(far.share());
        }
        // at capacity: only closer candidates still pass
        assert!(check_knn(&a, &near));
        assert!(!check_knn(&a, &far));
    }
}
