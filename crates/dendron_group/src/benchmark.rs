use dendron_core::{CellAddress, CellGid, CellKind, CellLid, Epoch, Spike, TimeMs};
use dendron_labels::{CellLabelRange, CellLabelsAndGids};
use dendron_recipe::{BenchmarkCell, CellDescription, Recipe};

use crate::{expect_kind, point_cell_labels, CellGroup, EventLane, GroupError};

/// Synthetic cells for scale and overhead measurements: spikes come from a
/// schedule, incoming events are counted and dropped, and `realtime_ratio`
/// records the advertised cost of integration per unit simulated time.
#[derive(Debug)]
pub struct BenchmarkCellGroup {
    gids: Vec<CellGid>,
    cells: Vec<BenchmarkCell>,
    spikes: Vec<Spike>,
    events_received: u64,
}

impl BenchmarkCellGroup {
    pub fn new(
        recipe: &dyn Recipe,
        gids: &[CellGid],
    ) -> Result<(Self, CellLabelsAndGids), GroupError> {
        let mut cells = Vec::with_capacity(gids.len());
        let mut labels = CellLabelRange::new();
        for &gid in gids {
            let description = recipe.cell_description(gid);
            expect_kind(gid, CellKind::Benchmark, &description)?;
            let CellDescription::Benchmark(cell) = description else {
                unreachable!("kind checked above");
            };
            point_cell_labels(&mut labels, &cell.source, Some(&cell.target));
            cells.push(cell);
        }
        let group = Self {
            gids: gids.to_vec(),
            cells,
            spikes: Vec::new(),
            events_received: 0,
        };
        Ok((group, CellLabelsAndGids::new(labels, gids.to_vec())))
    }

    pub fn events_received(&self) -> u64 {
        self.events_received
    }
}

impl CellGroup for BenchmarkCellGroup {
    fn kind(&self) -> CellKind {
        CellKind::Benchmark
    }

    fn gids(&self) -> &[CellGid] {
        &self.gids
    }

    fn advance(&mut self, epoch: Epoch, _dt: TimeMs, lanes: &mut [EventLane]) {
        assert_eq!(lanes.len(), self.gids.len(), "one event lane per cell");
        for (index, cell) in self.cells.iter_mut().enumerate() {
            self.events_received += lanes[index].take_due(epoch.t1).len() as u64;
            for time in cell.schedule.events(epoch.t0, epoch.t1) {
                self.spikes.push(Spike::new(
                    CellAddress {
                        gid: self.gids[index],
                        lid: CellLid(0),
                    },
                    time,
                ));
            }
        }
    }

    fn spikes(&self) -> &[Spike] {
        &self.spikes
    }

    fn clear_spikes(&mut self) {
        self.spikes.clear();
    }

    fn reset(&mut self) {
        for cell in self.cells.iter_mut() {
            cell.schedule.reset();
        }
        self.spikes.clear();
        self.events_received = 0;
    }
}
