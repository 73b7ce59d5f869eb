use dendron_core::{CellAddress, CellGid, CellKind, CellLid, Epoch, Spike, SpikeEvent, TimeMs};
use dendron_labels::{CellLabelRange, CellLabelsAndGids};
use dendron_recipe::{CellDescription, EventGenerator, LifCell, Recipe};

use crate::{expect_kind, point_cell_labels, CellGroup, EventLane, GroupError};

/// Leaky integrate-and-fire cells, integrated exactly between events.
///
/// Each cell has one source (lid 0) and one target (lid 0). Synaptic
/// weights add directly to the membrane voltage in mV; inputs arriving
/// during the refractory period are discarded.
#[derive(Debug)]
pub struct LifCellGroup {
    gids: Vec<CellGid>,
    cells: Vec<LifCell>,
    generators: Vec<Vec<EventGenerator>>,
    v: Vec<f64>,
    refractory_until: Vec<TimeMs>,
    spikes: Vec<Spike>,
}

impl LifCellGroup {
    pub fn new(
        recipe: &dyn Recipe,
        gids: &[CellGid],
    ) -> Result<(Self, CellLabelsAndGids), GroupError> {
        let mut cells = Vec::with_capacity(gids.len());
        let mut generators = Vec::with_capacity(gids.len());
        let mut labels = CellLabelRange::new();
        for &gid in gids {
            let description = recipe.cell_description(gid);
            expect_kind(gid, CellKind::Lif, &description)?;
            let CellDescription::Lif(cell) = description else {
                unreachable!("kind checked above");
            };
            point_cell_labels(&mut labels, &cell.source, Some(&cell.target));
            generators.push(recipe.event_generators(gid));
            cells.push(cell);
        }
        let v = cells.iter().map(|c| c.v_rest_mv).collect();
        let group = Self {
            gids: gids.to_vec(),
            cells,
            generators,
            v,
            refractory_until: vec![f64::NEG_INFINITY; gids.len()],
            spikes: Vec::new(),
        };
        let labels = CellLabelsAndGids::new(labels, gids.to_vec());
        Ok((group, labels))
    }

    fn decay(cell: &LifCell, v: f64, refractory_until: TimeMs, from: TimeMs, to: TimeMs) -> f64 {
        if to <= refractory_until {
            return v;
        }
        let start = from.max(refractory_until);
        cell.v_rest_mv + (v - cell.v_rest_mv) * (-(to - start) / cell.tau_m_ms).exp()
    }

    pub fn voltage(&self, index: usize) -> f64 {
        self.v[index]
    }
}

impl CellGroup for LifCellGroup {
    fn kind(&self) -> CellKind {
        CellKind::Lif
    }

    fn gids(&self) -> &[CellGid] {
        &self.gids
    }

    fn advance(&mut self, epoch: Epoch, _dt: TimeMs, lanes: &mut [EventLane]) {
        assert_eq!(lanes.len(), self.gids.len(), "one event lane per cell");
        for (index, lane) in lanes.iter_mut().enumerate() {
            let cell = &self.cells[index];
            let mut events = lane.take_due(epoch.t1);
            for generator in &mut self.generators[index] {
                for time in generator.schedule.events(epoch.t0, epoch.t1) {
                    events.push(SpikeEvent::new(CellLid(0), time, generator.weight));
                }
            }
            events.sort_by(dendron_core::event_order);

            let mut t = epoch.t0;
            for event in events {
                let te = event.time.max(t);
                self.v[index] =
                    Self::decay(cell, self.v[index], self.refractory_until[index], t, te);
                t = te;
                if te < self.refractory_until[index] {
                    continue;
                }
                self.v[index] += event.weight as f64;
                if self.v[index] >= cell.v_thresh_mv {
                    self.spikes.push(Spike::new(
                        CellAddress {
                            gid: self.gids[index],
                            lid: CellLid(0),
                        },
                        te,
                    ));
                    self.v[index] = cell.v_reset_mv;
                    self.refractory_until[index] = te + cell.t_ref_ms;
                }
            }
            self.v[index] =
                Self::decay(cell, self.v[index], self.refractory_until[index], t, epoch.t1);
        }
    }

    fn spikes(&self) -> &[Spike] {
        &self.spikes
    }

    fn clear_spikes(&mut self) {
        self.spikes.clear();
    }

    fn reset(&mut self) {
        for (index, cell) in self.cells.iter().enumerate() {
            self.v[index] = cell.v_rest_mv;
            self.refractory_until[index] = f64::NEG_INFINITY;
        }
        for generators in self.generators.iter_mut() {
            for generator in generators.iter_mut() {
                generator.schedule.reset();
            }
        }
        self.spikes.clear();
    }
}
