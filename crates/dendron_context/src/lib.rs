#![forbid(unsafe_code)]

use std::ops::Range;
use std::sync::Arc;

use dendron_core::{make_index, validate_partition, CellGid, Spike, TimeMs};
use dendron_labels::CellLabelsAndGids;
use rayon::prelude::*;

/// The concatenation of every rank's local vector, together with the
/// partition that recovers each rank's slab.
#[derive(Debug, Clone, PartialEq)]
pub struct GatheredVector<T> {
    values: Vec<T>,
    partition: Vec<usize>,
}

impl<T> GatheredVector<T> {
    pub fn new(values: Vec<T>, partition: Vec<usize>) -> Self {
        validate_partition(&partition, values.len()).expect("gathered partition must be valid");
        Self { values, partition }
    }

    pub fn values(&self) -> &[T] {
        &self.values
    }

    pub fn partition(&self) -> &[usize] {
        &self.partition
    }

    pub fn size(&self) -> usize {
        self.values.len()
    }

    pub fn num_domains(&self) -> usize {
        self.partition.len() - 1
    }

    /// The slab contributed by `domain`.
    pub fn values_for_domain(&self, domain: usize) -> &[T] {
        &self.values[self.partition[domain]..self.partition[domain + 1]]
    }
}

/// Collective operations over the process group. Collective failure is not
/// recoverable, so the operations return values directly; a distributed
/// implementation aborts the run on communication errors.
pub trait DistributedContext: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    fn min_time(&self, value: TimeMs) -> TimeMs;

    fn max_time(&self, value: TimeMs) -> TimeMs;

    fn sum(&self, value: u64) -> u64;

    fn gather_spikes(&self, local: Vec<Spike>) -> GatheredVector<Spike>;

    fn gather_gids(&self, local: Vec<CellGid>) -> GatheredVector<CellGid>;

    fn gather_cell_labels_and_gids(&self, local: CellLabelsAndGids) -> CellLabelsAndGids;

    fn barrier(&self);
}

/// Single-process context: one rank that owns every cell.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalContext;

impl DistributedContext for LocalContext {
    fn name(&self) -> &'static str {
        "local"
    }

    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn min_time(&self, value: TimeMs) -> TimeMs {
        value
    }

    fn max_time(&self, value: TimeMs) -> TimeMs {
        value
    }

    fn sum(&self, value: u64) -> u64 {
        value
    }

    fn gather_spikes(&self, local: Vec<Spike>) -> GatheredVector<Spike> {
        let len = local.len();
        GatheredVector::new(local, vec![0, len])
    }

    fn gather_gids(&self, local: Vec<CellGid>) -> GatheredVector<CellGid> {
        let len = local.len();
        GatheredVector::new(local, vec![0, len])
    }

    fn gather_cell_labels_and_gids(&self, local: CellLabelsAndGids) -> CellLabelsAndGids {
        local
    }

    fn barrier(&self) {}
}

/// Emulates `num_ranks` identical ranks inside one process. Rank 0 owns the
/// real cells; gathers replicate the local contribution into every simulated
/// slab with gids shifted by `cells_per_rank`. Used to exercise the exchange
/// and delivery paths without a network.
#[derive(Debug, Clone, Copy)]
pub struct DryRunContext {
    pub num_ranks: usize,
    pub cells_per_rank: u32,
}

impl DryRunContext {
    pub fn new(num_ranks: usize, cells_per_rank: u32) -> Self {
        assert!(num_ranks > 0, "dry run needs at least one rank");
        Self {
            num_ranks,
            cells_per_rank,
        }
    }
}

impl DistributedContext for DryRunContext {
    fn name(&self) -> &'static str {
        "dryrun"
    }

    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        self.num_ranks
    }

    fn min_time(&self, value: TimeMs) -> TimeMs {
        value
    }

    fn max_time(&self, value: TimeMs) -> TimeMs {
        value
    }

    fn sum(&self, value: u64) -> u64 {
        value * self.num_ranks as u64
    }

    fn gather_spikes(&self, local: Vec<Spike>) -> GatheredVector<Spike> {
        let mut values = Vec::with_capacity(local.len() * self.num_ranks);
        let mut counts = Vec::with_capacity(self.num_ranks);
        for rank in 0..self.num_ranks {
            let shift = self.cells_per_rank * rank as u32;
            for spike in &local {
                let mut shifted = *spike;
                shifted.source.gid = CellGid(spike.source.gid.0 + shift);
                values.push(shifted);
            }
            counts.push(local.len());
        }
        GatheredVector::new(values, make_index(&counts))
    }

    fn gather_gids(&self, local: Vec<CellGid>) -> GatheredVector<CellGid> {
        let mut values = Vec::with_capacity(local.len() * self.num_ranks);
        let mut counts = Vec::with_capacity(self.num_ranks);
        for rank in 0..self.num_ranks {
            let shift = self.cells_per_rank * rank as u32;
            values.extend(local.iter().map(|gid| CellGid(gid.0 + shift)));
            counts.push(local.len());
        }
        GatheredVector::new(values, make_index(&counts))
    }

    fn gather_cell_labels_and_gids(&self, local: CellLabelsAndGids) -> CellLabelsAndGids {
        let mut gathered = CellLabelsAndGids::default();
        for rank in 0..self.num_ranks {
            let shift = self.cells_per_rank * rank as u32;
            let mut tile = local.clone();
            for gid in tile.gids.iter_mut() {
                *gid = CellGid(gid.0 + shift);
            }
            gathered.append(tile);
        }
        gathered
    }

    fn barrier(&self) {}
}

/// Intra-rank worker pool; cell groups and construction loops are the unit
/// of parallel work.
pub struct ThreadPool {
    pool: rayon::ThreadPool,
    num_threads: usize,
}

impl ThreadPool {
    pub fn new(num_threads: usize) -> Self {
        let num_threads = num_threads.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build()
            .expect("thread pool construction cannot fail with positive thread count");
        Self { pool, num_threads }
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    pub fn parallel_for<F>(&self, range: Range<usize>, body: F)
    where
        F: Fn(usize) + Send + Sync,
    {
        self.pool.install(|| range.into_par_iter().for_each(body));
    }

    pub fn install<R, F>(&self, op: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        self.pool.install(op)
    }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("num_threads", &self.num_threads)
            .finish()
    }
}

/// Everything construction and integration need to know about where they
/// run. Passed explicitly; there is no process-global context.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub distributed: Arc<dyn DistributedContext>,
    pub thread_pool: Arc<ThreadPool>,
    pub gpu_available: bool,
}

impl ExecutionContext {
    pub fn local(num_threads: usize) -> Self {
        Self {
            distributed: Arc::new(LocalContext),
            thread_pool: Arc::new(ThreadPool::new(num_threads)),
            gpu_available: false,
        }
    }

    pub fn with_distributed(distributed: Arc<dyn DistributedContext>, num_threads: usize) -> Self {
        Self {
            distributed,
            thread_pool: Arc::new(ThreadPool::new(num_threads)),
            gpu_available: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dendron_core::CellAddress;

    #[test]
    fn local_gather_is_identity_with_partition() {
        let ctx = LocalContext;
        let spikes = vec![
            Spike::new(CellAddress::new(0, 0), 0.5),
            Spike::new(CellAddress::new(1, 0), 0.75),
        ];
        let gathered = ctx.gather_spikes(spikes.clone());
        assert_eq!(gathered.values(), &spikes[..]);
        assert_eq!(gathered.partition(), &[0, 2]);
        assert_eq!(gathered.num_domains(), 1);
    }

    #[test]
    fn dry_run_replicates_with_shifted_gids() {
        let ctx = DryRunContext::new(3, 10);
        let gathered = ctx.gather_spikes(vec![Spike::new(CellAddress::new(2, 0), 1.0)]);
        assert_eq!(gathered.size(), 3);
        assert_eq!(gathered.partition(), &[0, 1, 2, 3]);
        let gids: Vec<u32> = gathered.values().iter().map(|s| s.source.gid.0).collect();
        assert_eq!(gids, vec![2, 12, 22]);
    }

    #[test]
    fn thread_pool_runs_whole_range() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let pool = ThreadPool::new(4);
        let hits = AtomicUsize::new(0);
        pool.parallel_for(0..100, |_| {
            hits.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(hits.load(Ordering::Relaxed), 100);
    }
}
