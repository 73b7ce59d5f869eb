use dendron_comm::Communicator;
use dendron_context::{DistributedContext, ExecutionContext, GatheredVector};
use dendron_core::{
    make_index, validate_partition, CellAddress, CellGid, CellKind, Spike, SpikeEvent,
};
use dendron_decomp::partition_load_balance;
use dendron_labels::{CellLabelsAndGids, LabelResolutionMap};
use dendron_recipe::{
    CellDescription, CellGlobalLabel, CellLocalLabel, ConnectionDesc, LifCell, Recipe,
};

struct RingRecipe {
    n: u32,
    weight: f32,
    delay: f64,
}

impl Recipe for RingRecipe {
    fn num_cells(&self) -> usize {
        self.n as usize
    }

    fn cell_kind(&self, _gid: CellGid) -> CellKind {
        CellKind::Lif
    }

    fn cell_description(&self, _gid: CellGid) -> CellDescription {
        CellDescription::Lif(LifCell::default())
    }

    fn connections_on(&self, gid: CellGid) -> Vec<ConnectionDesc> {
        let prev = (gid.0 + self.n - 1) % self.n;
        vec![ConnectionDesc::new(
            CellGlobalLabel::new(prev, CellLocalLabel::univalent("src")),
            CellLocalLabel::univalent("tgt"),
            self.weight,
            self.delay,
        )]
    }
}

struct FanOutRecipe;

impl Recipe for FanOutRecipe {
    fn num_cells(&self) -> usize {
        4
    }

    fn cell_kind(&self, _gid: CellGid) -> CellKind {
        CellKind::Lif
    }

    fn cell_description(&self, _gid: CellGid) -> CellDescription {
        CellDescription::Lif(LifCell::default())
    }

    fn connections_on(&self, gid: CellGid) -> Vec<ConnectionDesc> {
        if gid.0 == 0 {
            return Vec::new();
        }
        vec![ConnectionDesc::new(
            CellGlobalLabel::new(0, CellLocalLabel::univalent("src")),
            CellLocalLabel::univalent("tgt"),
            gid.0 as f32,
            1.0,
        )]
    }
}

fn build_communicator(
    recipe: &dyn Recipe,
    ctx: &ExecutionContext,
) -> (Communicator, dendron_decomp::DomainDecomposition) {
    let decomposition = partition_load_balance(recipe, ctx).unwrap();
    let mut labels = CellLabelsAndGids::default();
    for description in &decomposition.groups {
        let (_, group_labels) =
            dendron_group::make_cell_group(recipe, description.kind, &description.gids).unwrap();
        labels.append(group_labels);
    }
    let gathered = ctx.distributed.gather_cell_labels_and_gids(labels);
    let map = LabelResolutionMap::build(&gathered).unwrap();
    let communicator = Communicator::new(recipe, &decomposition, &map, ctx).unwrap();
    (communicator, decomposition)
}

#[test]
fn ring_table_is_source_sorted_with_unit_min_delay() {
    let ctx = ExecutionContext::local(1);
    let recipe = RingRecipe {
        n: 20,
        weight: 1.0,
        delay: 1.0,
    };
    let (comm, _) = build_communicator(&recipe, &ctx);

    assert_eq!(comm.connections().len(), 20);
    assert_eq!(comm.connection_part(), &[0, 20]);
    for pair in comm.connections().windows(2) {
        assert!(pair[0].source <= pair[1].source);
    }
    assert_eq!(comm.min_delay(&ctx), 1.0);

    // Shuffle-and-rebuild yields the identical table.
    let (rebuilt, _) = build_communicator(&recipe, &ctx);
    assert_eq!(comm.config_digest(), rebuilt.config_digest());
}

#[test]
fn ring_spike_is_delivered_to_the_next_cell_only() {
    let ctx = ExecutionContext::local(1);
    let recipe = RingRecipe {
        n: 20,
        weight: 1.0,
        delay: 1.0,
    };
    let (mut comm, decomposition) = build_communicator(&recipe, &ctx);

    let spike = Spike::new(CellAddress::new(0, 0), 0.0);
    let gathered = comm.exchange(vec![spike], &ctx);
    let mut queues = vec![Vec::new(); decomposition.num_local_cells];
    comm.make_event_queues(&gathered, &mut queues);

    for (cell, queue) in queues.iter().enumerate() {
        if cell == 1 {
            assert_eq!(queue, &vec![SpikeEvent::new(dendron_core::CellLid(0), 1.0, 1.0)]);
        } else {
            assert!(queue.is_empty(), "cell {cell} must receive nothing");
        }
    }
}

#[test]
fn fan_out_weights_reach_each_target_once() {
    let ctx = ExecutionContext::local(1);
    let (mut comm, decomposition) = build_communicator(&FanOutRecipe, &ctx);

    let gathered = comm.exchange(vec![Spike::new(CellAddress::new(0, 0), 0.0)], &ctx);
    let mut queues = vec![Vec::new(); decomposition.num_local_cells];
    comm.make_event_queues(&gathered, &mut queues);

    assert!(queues[0].is_empty());
    for target in 1..4usize {
        assert_eq!(queues[target].len(), 1);
        let event = queues[target][0];
        assert_eq!(event.target.0, 0);
        assert_eq!(event.time, 1.0);
        assert_eq!(event.weight, target as f32);
    }
}

#[test]
fn delivered_event_count_matches_source_products() {
    // Two spikes of one source against a fan-out of three connections:
    // the queues must hold exactly 2 x 3 events.
    let ctx = ExecutionContext::local(1);
    let (mut comm, decomposition) = build_communicator(&FanOutRecipe, &ctx);

    let gathered = comm.exchange(
        vec![
            Spike::new(CellAddress::new(0, 0), 0.0),
            Spike::new(CellAddress::new(0, 0), 0.5),
        ],
        &ctx,
    );
    let mut queues = vec![Vec::new(); decomposition.num_local_cells];
    comm.make_event_queues(&gathered, &mut queues);
    let total: usize = queues.iter().map(Vec::len).sum();
    assert_eq!(total, 6);
}

/// A context that pretends to be rank 0 of four, with fixed remote spike
/// slabs appended by the gather.
#[derive(Debug)]
struct FourRankContext {
    remote_counts: [usize; 3],
}

impl DistributedContext for FourRankContext {
    fn name(&self) -> &'static str {
        "test-four-rank"
    }
    fn rank(&self) -> usize {
        0
    }
    fn size(&self) -> usize {
        4
    }
    fn min_time(&self, value: f64) -> f64 {
        value
    }
    fn max_time(&self, value: f64) -> f64 {
        value
    }
    fn sum(&self, value: u64) -> u64 {
        value
    }
    fn gather_spikes(&self, local: Vec<Spike>) -> GatheredVector<Spike> {
        let mut values = local;
        let mut counts = vec![values.len()];
        for (rank, &count) in self.remote_counts.iter().enumerate() {
            for i in 0..count {
                values.push(Spike::new(
                    CellAddress::new((rank as u32 + 1) * 1000 + i as u32, 0),
                    0.25,
                ));
            }
            counts.push(count);
        }
        GatheredVector::new(values, make_index(&counts))
    }
    fn gather_gids(&self, local: Vec<CellGid>) -> GatheredVector<CellGid> {
        let len = local.len();
        GatheredVector::new(local, vec![0, len, len, len, len])
    }
    fn gather_cell_labels_and_gids(&self, local: CellLabelsAndGids) -> CellLabelsAndGids {
        local
    }
    fn barrier(&self) {}
}

#[test]
fn gather_with_variant_rank_sizes_partitions_contiguously() {
    let ctx = FourRankContext {
        remote_counts: [10, 20, 30],
    };
    let gathered = ctx.gather_spikes(Vec::new());

    assert_eq!(gathered.size(), 60);
    assert_eq!(gathered.partition(), &[0, 0, 10, 30, 60]);
    validate_partition(gathered.partition(), gathered.size()).unwrap();
    for domain in 0..4 {
        let slab = gathered.values_for_domain(domain);
        let expected = [0usize, 10, 20, 30][domain];
        assert_eq!(slab.len(), expected);
    }
}
