use std::sync::Arc;

use dendron_context::{DistributedContext, ExecutionContext, GatheredVector, ThreadPool};
use dendron_core::{CellGid, CellKind, Spike};
use dendron_decomp::partition_load_balance;
use dendron_labels::CellLabelsAndGids;
use dendron_recipe::{
    CellDescription, CellGlobalLabel, CellLocalLabel, GapJunctionDesc, LifCell, Recipe,
};

/// Pretends to be one rank of a fixed-size group; reductions return the
/// globally correct value supplied by the test.
#[derive(Debug)]
struct FixedRankContext {
    rank: usize,
    size: usize,
    global_cells: u64,
}

impl DistributedContext for FixedRankContext {
    fn name(&self) -> &'static str {
        "test-fixed-rank"
    }
    fn rank(&self) -> usize {
        self.rank
    }
    fn size(&self) -> usize {
        self.size
    }
    fn min_time(&self, value: f64) -> f64 {
        value
    }
    fn max_time(&self, value: f64) -> f64 {
        value
    }
    fn sum(&self, _value: u64) -> u64 {
        self.global_cells
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

fn four_rank_ctx(rank: usize) -> ExecutionContext {
    ExecutionContext {
        distributed: Arc::new(FixedRankContext {
            rank,
            size: 4,
            global_cells: 4,
        }),
        thread_pool: Arc::new(ThreadPool::new(1)),
        gpu_available: false,
    }
}

/// Four cells with gap junctions forming two disjoint pairs.
struct TwoPairs;

impl Recipe for TwoPairs {
    fn num_cells(&self) -> usize {
        4
    }
    fn cell_kind(&self, _gid: CellGid) -> CellKind {
        CellKind::Lif
    }
    fn cell_description(&self, _gid: CellGid) -> CellDescription {
        CellDescription::Lif(LifCell::default())
    }
    fn gap_junctions_on(&self, gid: CellGid) -> Vec<GapJunctionDesc> {
        let peer = match gid.0 {
            0 => 1,
            1 => 0,
            2 => 3,
            3 => 2,
            _ => unreachable!(),
        };
        vec![GapJunctionDesc {
            peer: CellGlobalLabel::new(peer, CellLocalLabel::univalent("gj")),
            local: CellLocalLabel::univalent("gj"),
            conductance_us: 0.1,
        }]
    }
}

#[test]
fn two_pairs_on_four_ranks_make_two_whole_groups() {
    let mut groups_total = 0;
    let mut ranks_with_cells = Vec::new();
    for rank in 0..4 {
        let ctx = four_rank_ctx(rank);
        let decomposition = partition_load_balance(&TwoPairs, &ctx).unwrap();
        assert_eq!(decomposition.num_domains, 4);
        for group in &decomposition.groups {
            assert_eq!(group.gids.len(), 2, "pairs must stay whole");
            groups_total += 1;
        }
        if decomposition.num_local_cells > 0 {
            ranks_with_cells.push(rank);
        }
        // The gid -> domain map is identical on every rank.
        assert_eq!(decomposition.gid_domain(CellGid(0)), 0);
        assert_eq!(decomposition.gid_domain(CellGid(1)), 0);
        assert_eq!(decomposition.gid_domain(CellGid(2)), 1);
        assert_eq!(decomposition.gid_domain(CellGid(3)), 1);
    }
    assert_eq!(groups_total, 2);
    assert!(ranks_with_cells.len() <= 2);
}

#[test]
fn independent_cells_round_robin_over_ranks() {
    struct Plain;
    impl Recipe for Plain {
        fn num_cells(&self) -> usize {
            4
        }
        fn cell_kind(&self, _gid: CellGid) -> CellKind {
            CellKind::Lif
        }
        fn cell_description(&self, _gid: CellGid) -> CellDescription {
            CellDescription::Lif(LifCell::default())
        }
    }

    for rank in 0..4 {
        let ctx = four_rank_ctx(rank);
        let decomposition = partition_load_balance(&Plain, &ctx).unwrap();
        assert_eq!(decomposition.num_local_cells, 1);
        assert_eq!(decomposition.groups.len(), 1);
        assert_eq!(decomposition.groups[0].gids, vec![CellGid(rank as u32)]);
    }
}
