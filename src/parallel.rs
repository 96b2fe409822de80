//! Parallel chrom-sweep over a query stream and indexed databases.
//!
//! The query stream is cut into coordinate-bounded chunks; each chunk is
//! swept against database records fetched by region query, on its own
//! worker; chunk outputs are stitched back together in submission order.
//! Chunks never overlap in coordinate space, so concatenating their outputs
//! preserves sort order. When confidence-interval widening has re-sorted a
//! chunk, the read-order index carried by every record restores the
//! original order instead.
//!
//! All inter-stage communication runs over bounded channels: a slow
//! consumer stalls the reorder stage, which stalls the workers, which
//! stalls partitioning. Dropping the output stream disconnects the
//! channels and every stage unwinds on its next send or receive.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{bounded, Receiver, Sender};
use log::debug;
use rayon::prelude::*;

use crate::ci::CiExtended;
use crate::error::{RelateError, Result};
use crate::position::{ConfidenceBounds, Positioned};
use crate::relatable::Relatable;
use crate::stream::{BoxedStream, Region, SharedQueryable, SliceStream};
use crate::sweep::Sweep;

/// Records flowing from a sweep worker to the reorder stage, tagged with
/// their query read-order index.
type Batch<T> = Vec<(u64, Relatable<T>)>;

/// Per-record callback applied on the worker thread before reassembly. If
/// it touches shared state, the caller synchronizes.
pub type RelateFn<T> = Arc<dyn Fn(&mut Relatable<T>) + Send + Sync>;

/// Pending-record cap for read-order restoration. The buffer only holds
/// records displaced by confidence-interval sorting, so in practice it
/// stays tiny; blowing past this means a CI wider than its chunk.
const REORDER_MAX_PENDING: usize = 1 << 16;

/// One chunk of query records plus the channel its output travels on.
struct ChunkJob<T> {
    records: Vec<CiExtended<T>>,
    chrom: String,
    min_start: u32,
    max_end: u32,
    must_sort: bool,
    batches: Sender<Result<Batch<T>>>,
}

/// Configuration for the parallel sweep.
///
/// `run` starts the pipeline and returns immediately; results arrive on the
/// returned [`RelatedStream`] as chunks complete.
#[derive(Clone)]
pub struct ParallelRelater {
    /// Target records per chunk. Chunks end early on chromosome changes and
    /// large gaps, and run at most 200 records over.
    pub chunk_size: usize,
    /// Gap between adjacent query starts that ends an oversized chunk.
    pub max_gap: u32,
    /// Concurrent sweep workers.
    pub workers: usize,
    /// Records per batch handed from a worker to the reorder stage.
    pub batch_size: usize,
    /// Capacity of the final output channel.
    pub output_buffer: usize,
}

impl Default for ParallelRelater {
    fn default() -> Self {
        Self::new()
    }
}

impl ParallelRelater {
    pub fn new() -> Self {
        Self {
            chunk_size: 1000,
            max_gap: 10_000,
            workers: (num_cpus::get() / 2).max(1),
            batch_size: 400,
            output_buffer: 2048,
        }
    }

    /// Sweep `query` against `dbs`, emitting each query record with its
    /// relations in sort order.
    pub fn run<T>(
        &self,
        query: BoxedStream<T>,
        dbs: Vec<SharedQueryable<T>>,
        callback: Option<RelateFn<T>>,
    ) -> RelatedStream<T>
    where
        T: Positioned + Send + Sync + 'static,
    {
        self.launch(query, dbs, callback, CiExtended::passthrough, false)
    }

    /// Like [`run`](Self::run), but overlap testing uses
    /// confidence-interval widened bounds and the output comes back in
    /// query read order.
    pub fn run_ci_extended<T>(
        &self,
        query: BoxedStream<T>,
        dbs: Vec<SharedQueryable<T>>,
        callback: Option<RelateFn<T>>,
    ) -> RelatedStream<T>
    where
        T: Positioned + ConfidenceBounds + Send + Sync + 'static,
    {
        self.launch(query, dbs, callback, CiExtended::widened, true)
    }

    fn launch<T>(
        &self,
        query: BoxedStream<T>,
        dbs: Vec<SharedQueryable<T>>,
        callback: Option<RelateFn<T>>,
        wrap: fn(Arc<T>, u64) -> CiExtended<T>,
        ci_extend: bool,
    ) -> RelatedStream<T>
    where
        T: Positioned + Send + Sync + 'static,
    {
        let workers = self.workers.max(1);
        let (job_tx, job_rx) = bounded::<ChunkJob<T>>(1);
        let (order_tx, order_rx) = bounded::<Receiver<Result<Batch<T>>>>(2 + workers);
        let (out_tx, out_rx) = bounded::<Result<Relatable<T>>>(self.output_buffer.max(1));

        for _ in 0..workers {
            let job_rx = job_rx.clone();
            let dbs = dbs.clone();
            let callback = callback.clone();
            let batch_size = self.batch_size.max(1);
            thread::spawn(move || {
                for job in job_rx.iter() {
                    run_chunk(job, &dbs, callback.as_ref(), batch_size);
                }
            });
        }
        drop(job_rx);

        let chunk_size = self.chunk_size.max(1);
        let max_gap = self.max_gap as i64;
        thread::spawn(move || {
            partition(query, wrap, ci_extend, chunk_size, max_gap, job_tx, order_tx);
        });

        thread::spawn(move || reorder(order_rx, out_tx, ci_extend));

        RelatedStream { output: out_rx }
    }
}

/// Cut the query stream into sweep-safe chunks and submit them.
///
/// A chunk ends on a chromosome change, on large gaps between adjacent
/// query starts, or when it reaches the configured size; the thresholds
/// trade chunk-tracking overhead against parallelism on dense data.
fn partition<T>(
    mut query: BoxedStream<T>,
    wrap: fn(Arc<T>, u64) -> CiExtended<T>,
    must_sort: bool,
    chunk_size: usize,
    max_gap: i64,
    jobs: Sender<ChunkJob<T>>,
    order: Sender<Receiver<Result<Batch<T>>>>,
) where
    T: Positioned + Send + Sync + 'static,
{
    let mut buf: Vec<CiExtended<T>> = Vec::with_capacity(chunk_size / 2);
    let mut last_chrom = String::new();
    let mut last_start: i64 = -10;
    let mut min_start = u32::MAX;
    let mut max_end = 0u32;
    let mut index = 0u64;

    loop {
        let rec = match query.next_record() {
            Ok(Some(rec)) => rec,
            Ok(None) => break,
            Err(e) => {
                // surface the failure in submission order, then stop
                let (tx, rx) = bounded(1);
                let _ = tx.send(Err(e));
                let _ = order.send(rx);
                return;
            }
        };
        let v = wrap(Arc::new(rec), index);
        index += 1;

        let s = v.start() as i64;
        let gap = s - last_start;
        let boundary = v.chrom() != last_chrom
            || (buf.len() > 2048 && gap > max_gap)
            || (gap > 25 && buf.len() >= chunk_size)
            || buf.len() >= chunk_size + 200
            || gap > 10 * max_gap;

        if boundary {
            if !buf.is_empty() {
                debug!(
                    "chunk {}:{}-{} with {} records (gap {})",
                    last_chrom,
                    min_start,
                    max_end,
                    buf.len(),
                    gap
                );
                if !submit(
                    &mut buf, &last_chrom, min_start, max_end, must_sort, chunk_size, &jobs,
                    &order,
                ) {
                    return;
                }
            }
            last_chrom = v.chrom().to_string();
            min_start = v.start();
            max_end = v.end();
        } else {
            min_start = min_start.min(v.start());
            max_end = max_end.max(v.end());
        }
        last_start = s;
        buf.push(v);
    }

    if !buf.is_empty() {
        submit(
            &mut buf, &last_chrom, min_start, max_end, must_sort, chunk_size, &jobs, &order,
        );
    }
    // dropping the senders closes the pipeline behind the last chunk
}

/// Enqueue one chunk: its output channel goes into the order queue first so
/// reassembly follows submission order no matter which worker finishes
/// first. Returns false when the pipeline has shut down.
fn submit<T>(
    buf: &mut Vec<CiExtended<T>>,
    chrom: &str,
    min_start: u32,
    max_end: u32,
    must_sort: bool,
    chunk_size: usize,
    jobs: &Sender<ChunkJob<T>>,
    order: &Sender<Receiver<Result<Batch<T>>>>,
) -> bool
where
    T: Positioned,
{
    let records = std::mem::replace(buf, Vec::with_capacity(chunk_size / 2));
    let (batch_tx, batch_rx) = bounded(8);
    if order.send(batch_rx).is_err() {
        return false;
    }
    jobs.send(ChunkJob {
        records,
        chrom: chrom.to_string(),
        min_start,
        max_end,
        must_sort,
        batches: batch_tx,
    })
    .is_ok()
}

/// Comparator for the per-chunk sweep: everything in a chunk shares a
/// chromosome, so only coordinates matter.
fn chunk_less<T: Positioned>(
    a: &Relatable<CiExtended<T>>,
    b: &Relatable<CiExtended<T>>,
) -> bool {
    a.start() < b.start() || (a.start() == b.start() && a.end() < b.end())
}

/// Overlap predicate for the per-chunk sweep.
fn chunk_overlap<T: Positioned>(
    a: &Relatable<CiExtended<T>>,
    b: &Relatable<CiExtended<T>>,
) -> bool {
    b.start() < a.end()
}

/// Sweep one chunk against the databases and stream batches downstream.
fn run_chunk<T>(
    job: ChunkJob<T>,
    dbs: &[SharedQueryable<T>],
    callback: Option<&RelateFn<T>>,
    batch_size: usize,
) where
    T: Positioned + Send + Sync + 'static,
{
    let ChunkJob {
        mut records,
        chrom,
        min_start,
        max_end,
        must_sort,
        batches,
    } = job;

    if must_sort {
        records.par_sort_unstable_by(|a, b| {
            (a.start(), a.end()).cmp(&(b.start(), b.end()))
        });
    }

    let region = Region::new(chrom, min_start, max_end);
    let mut streams: Vec<BoxedStream<CiExtended<T>>> = Vec::with_capacity(dbs.len() + 1);
    streams.push(Box::new(SliceStream::new(records)));
    for db in dbs {
        match db.query(&region) {
            Ok(stream) => streams.push(Box::new(PassthroughStream { inner: stream })),
            Err(e) => {
                let _ = batches.send(Err(e));
                return;
            }
        }
    }

    // the in-memory query chunk is always source 0
    let sweep = match Sweep::new(chunk_overlap, Some(0), chunk_less, streams) {
        Ok(sweep) => sweep,
        Err(e) => {
            let _ = batches.send(Err(e));
            return;
        }
    };

    let mut batch: Batch<T> = Vec::with_capacity(batch_size);
    for item in sweep {
        match item {
            Ok(rec) => {
                let (index, mut unwrapped) = unwrap_record(rec);
                if let Some(f) = callback {
                    f(&mut unwrapped);
                }
                batch.push((index, unwrapped));
                if batch.len() == batch_size {
                    let full = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
                    if batches.send(Ok(full)).is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                let _ = batches.send(Err(e));
                return;
            }
        }
    }
    if !batch.is_empty() {
        let _ = batches.send(Ok(batch));
    }
}

/// Strip the chunk wrapper off an emitted record, keeping its read-order
/// index for the reorder stage.
fn unwrap_record<T: Positioned>(rec: Relatable<CiExtended<T>>) -> (u64, Relatable<T>) {
    let (core, source, related) = rec.into_parts();
    let mut out = Relatable::from_arc(Arc::clone(core.inner()), source);
    for r in related {
        out.add_related(Arc::clone(r.inner()));
    }
    (core.index(), out)
}

/// Consume chunk outputs in submission order and forward records: directly
/// in plain mode, or through the index buffer that restores read order when
/// chunks were re-sorted on widened bounds.
fn reorder<T>(
    order: Receiver<Receiver<Result<Batch<T>>>>,
    out: Sender<Result<Relatable<T>>>,
    restore_order: bool,
) where
    T: Positioned,
{
    let mut next_print = 0u64;
    let mut pending: HashMap<u64, Relatable<T>> = HashMap::new();

    for chunk_rx in order.iter() {
        for batch in chunk_rx.iter() {
            let batch = match batch {
                Ok(batch) => batch,
                Err(e) => {
                    let _ = out.send(Err(e));
                    return;
                }
            };
            if !restore_order {
                for (_, rec) in batch {
                    if out.send(Ok(rec)).is_err() {
                        return;
                    }
                }
                continue;
            }
            for (index, rec) in batch {
                if index == next_print {
                    if out.send(Ok(rec)).is_err() {
                        return;
                    }
                    next_print += 1;
                } else {
                    pending.insert(index, rec);
                    if pending.len() > REORDER_MAX_PENDING {
                        let _ = out.send(Err(RelateError::ReorderOverflow {
                            pending: pending.len(),
                        }));
                        return;
                    }
                }
                while let Some(ready) = pending.remove(&next_print) {
                    if out.send(Ok(ready)).is_err() {
                        return;
                    }
                    next_print += 1;
                }
            }
        }
    }
    while let Some(ready) = pending.remove(&next_print) {
        if out.send(Ok(ready)).is_err() {
            return;
        }
        next_print += 1;
    }
}

/// Adapts a database stream to the chunk's wrapped record type. Database
/// records are never widened; only the query side carries uncertainty into
/// the overlap test.
struct PassthroughStream<T> {
    inner: BoxedStream<T>,
}

impl<T: Positioned> Iterator for PassthroughStream<T> {
    type Item = Result<CiExtended<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.inner.next_record() {
            Ok(Some(rec)) => Some(Ok(CiExtended::passthrough(Arc::new(rec), 0))),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

/// The output side of the parallel sweep. Dropping it shuts the pipeline
/// down.
pub struct RelatedStream<T> {
    output: Receiver<Result<Relatable<T>>>,
}

impl<T: Positioned> Iterator for RelatedStream<T> {
    type Item = Result<Relatable<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.output.recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interval::Interval;
    use crate::stream::MemoryQueryable;

    fn query_stream(items: Vec<Interval>) -> BoxedStream<Interval> {
        Box::new(SliceStream::new(items))
    }

    #[test]
    fn test_small_end_to_end() {
        let query = vec![
            Interval::new("chr1", 100, 200),
            Interval::new("chr1", 300, 400),
            Interval::new("chr2", 100, 200),
        ];
        let db = Arc::new(MemoryQueryable::new(vec![
            Interval::new("chr1", 150, 250),
            Interval::new("chr2", 500, 600),
        ]));

        let relater = ParallelRelater {
            chunk_size: 2,
            ..ParallelRelater::new()
        };
        let out: Vec<Relatable<Interval>> = relater
            .run(query_stream(query), vec![db], None)
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(out.len(), 3);
        assert_eq!(out[0].related().len(), 1);
        assert!(out[1].related().is_empty());
        assert!(out[2].related().is_empty());
        // every output record is a query record
        assert!(out.iter().all(|r| r.source() == 0));
    }

    #[test]
    fn test_empty_query() {
        let db = Arc::new(MemoryQueryable::new(vec![Interval::new("chr1", 1, 2)]));
        let relater = ParallelRelater::new();
        let out: Vec<_> = relater
            .run(query_stream(vec![]), vec![db], None)
            .collect();
        assert!(out.is_empty());
    }

    struct FailingDb;

    impl crate::stream::Queryable for FailingDb {
        type Record = Interval;

        fn query(&self, _region: &Region) -> Result<BoxedStream<Interval>> {
            Err(RelateError::query(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "index missing",
            )))
        }
    }

    #[test]
    fn test_query_failure_surfaces() {
        let relater = ParallelRelater::new();
        let results: Vec<_> = relater
            .run(
                query_stream(vec![Interval::new("chr1", 100, 200)]),
                vec![Arc::new(FailingDb)],
                None,
            )
            .collect();
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(RelateError::Query(_))));
    }
}
