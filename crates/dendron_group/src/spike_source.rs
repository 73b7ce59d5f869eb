use dendron_core::{CellAddress, CellGid, CellKind, CellLid, Epoch, Spike, TimeMs};
use dendron_labels::{CellLabelRange, CellLabelsAndGids};
use dendron_recipe::{CellDescription, Recipe, Schedule};

use crate::{expect_kind, point_cell_labels, CellGroup, EventLane, GroupError};

/// Cells that fire on a schedule and integrate nothing. One source, lid 0.
#[derive(Debug)]
pub struct SpikeSourceCellGroup {
    gids: Vec<CellGid>,
    schedules: Vec<Schedule>,
    spikes: Vec<Spike>,
}

impl SpikeSourceCellGroup {
    pub fn new(
        recipe: &dyn Recipe,
        gids: &[CellGid],
    ) -> Result<(Self, CellLabelsAndGids), GroupError> {
        let mut schedules = Vec::with_capacity(gids.len());
        let mut labels = CellLabelRange::new();
        for &gid in gids {
            let description = recipe.cell_description(gid);
            expect_kind(gid, CellKind::SpikeSource, &description)?;
            let CellDescription::SpikeSource(cell) = description else {
                unreachable!("kind checked above");
            };
            point_cell_labels(&mut labels, &cell.source, None);
            schedules.push(cell.schedule);
        }
        let group = Self {
            gids: gids.to_vec(),
            schedules,
            spikes: Vec::new(),
        };
        Ok((group, CellLabelsAndGids::new(labels, gids.to_vec())))
    }
}

impl CellGroup for SpikeSourceCellGroup {
    fn kind(&self) -> CellKind {
        CellKind::SpikeSource
    }

    fn gids(&self) -> &[CellGid] {
        &self.gids
    }

    fn advance(&mut self, epoch: Epoch, _dt: TimeMs, lanes: &mut [EventLane]) {
        assert_eq!(lanes.len(), self.gids.len(), "one event lane per cell");
        for (index, schedule) in self.schedules.iter_mut().enumerate() {
            // Incoming events are meaningless for a source-only cell.
            lanes[index].take_due(epoch.t1);
            for time in schedule.events(epoch.t0, epoch.t1) {
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
        for schedule in self.schedules.iter_mut() {
            schedule.reset();
        }
        self.spikes.clear();
    }
}
