use std::sync::Arc;

use dendron_comm::Communicator;
use dendron_context::{DryRunContext, ExecutionContext, ThreadPool};
use dendron_core::{CellAddress, CellGid, CellKind, Spike};
use dendron_decomp::{check_decomposition, BackendKind, DomainDecomposition, GroupDescription};
use dendron_labels::{CellLabelsAndGids, LabelResolutionMap};
use dendron_recipe::{
    CellDescription, CellGlobalLabel, CellLocalLabel, ConnectionDesc, LifCell, Recipe,
};

const TILE: u32 = 10;

/// A 20-cell ring split into two tiles of ten; the dry-run context stands in
/// for the second rank by replaying the first tile with shifted gids.
struct TiledRing;

impl Recipe for TiledRing {
    fn num_cells(&self) -> usize {
        2 * TILE as usize
    }

    fn cell_kind(&self, _gid: CellGid) -> CellKind {
        CellKind::Lif
    }

    fn cell_description(&self, _gid: CellGid) -> CellDescription {
        CellDescription::Lif(LifCell::default())
    }

    fn connections_on(&self, gid: CellGid) -> Vec<ConnectionDesc> {
        let n = 2 * TILE;
        let prev = (gid.0 + n - 1) % n;
        vec![ConnectionDesc::new(
            CellGlobalLabel::new(prev, CellLocalLabel::univalent("src")),
            CellLocalLabel::univalent("tgt"),
            1.0,
            1.0,
        )]
    }
}

fn tile_decomposition() -> DomainDecomposition {
    let gids: Vec<CellGid> = (0..TILE).map(CellGid).collect();
    let gid_domain = (0..2 * TILE).map(|g| (g / TILE) as usize).collect();
    DomainDecomposition::new(
        2,
        0,
        2 * TILE as usize,
        vec![GroupDescription {
            kind: CellKind::Lif,
            gids,
            backend: BackendKind::Multicore,
        }],
        gid_domain,
    )
}

#[test]
fn dry_run_ring_delivers_across_the_tile_boundary() {
    let ctx = ExecutionContext {
        distributed: Arc::new(DryRunContext::new(2, TILE)),
        thread_pool: Arc::new(ThreadPool::new(1)),
        gpu_available: false,
    };
    let recipe = TiledRing;
    let decomposition = tile_decomposition();
    check_decomposition(&recipe, &ctx, &decomposition).unwrap();

    let mut labels = CellLabelsAndGids::default();
    for description in &decomposition.groups {
        let (_, group_labels) =
            dendron_group::make_cell_group(&recipe, description.kind, &description.gids).unwrap();
        labels.append(group_labels);
    }
    // The gather shifts the tile's labels onto the simulated second rank.
    let gathered = ctx.distributed.gather_cell_labels_and_gids(labels);
    assert_eq!(gathered.gids.len(), 2 * TILE as usize);
    let map = LabelResolutionMap::build(&gathered).unwrap();

    let mut comm = Communicator::new(&recipe, &decomposition, &map, &ctx).unwrap();
    assert_eq!(comm.connections().len(), TILE as usize);
    // Local targets split their sources between the two domains: cell 0
    // listens to cell 19 on the remote tile, everyone else is tile-local.
    assert_eq!(comm.connection_part(), &[0, 9, 10]);
    assert_eq!(comm.min_delay(&ctx), 1.0);

    // Cell 9 fires; the dry run mirrors it as cell 19 on the remote tile,
    // which is exactly the source cell 0 listens to.
    let gathered_spikes = comm.exchange(vec![Spike::new(CellAddress::new(9, 0), 0.25)], &ctx);
    assert_eq!(gathered_spikes.size(), 2);
    assert_eq!(gathered_spikes.partition(), &[0, 1, 2]);
    assert_eq!(gathered_spikes.values()[1].source.gid, CellGid(19));

    let mut queues = vec![Vec::new(); decomposition.num_local_cells];
    comm.make_event_queues(&gathered_spikes, &mut queues);

    // Cell 9's successor lives on the other tile, so the only local
    // delivery is the mirrored remote spike into cell 0.
    assert_eq!(queues[0].len(), 1);
    assert_eq!(queues[0][0].time, 1.25);
    for cell in 1..TILE as usize {
        assert!(queues[cell].is_empty(), "cell {cell} must stay silent");
    }
}
