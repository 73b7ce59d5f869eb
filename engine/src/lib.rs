#![forbid(unsafe_code)]

use dendron_comm::{CommError, Communicator};
use dendron_context::ExecutionContext;
use dendron_core::{Epoch, Spike, SpikeEvent, TimeMs};
use dendron_decomp::{partition_load_balance_with_hint, DecompError, DomainDecomposition};
pub use dendron_decomp::PartitionHint;
use dendron_group::{
    make_cell_group, CellGroup, EventLane, GroupError, ProbeId, SamplerFn, SamplerId,
};
use dendron_labels::{CellLabelsAndGids, LabelError, LabelResolutionMap};
use dendron_recipe::{check_recipe, Recipe, RecipeError, Schedule};
use log::{debug, info};
use rayon::prelude::*;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimulationError {
    #[error(transparent)]
    Recipe(#[from] RecipeError),
    #[error(transparent)]
    Decomposition(#[from] DecompError),
    #[error(transparent)]
    Label(#[from] LabelError),
    #[error(transparent)]
    Communication(#[from] CommError),
    #[error(transparent)]
    Group(#[from] GroupError),
}

pub type SpikeCallback = Box<dyn FnMut(&[Spike]) + Send>;

/// The epoch-loop driver: owns the cell groups, the connection table and the
/// per-cell event queues, and coordinates integration with spike exchange.
///
/// The simulation proceeds in half-epochs of `min_delay / 2`. Spikes
/// produced in half-epoch `k` are exchanged at its end and, because every
/// connection delay is at least `min_delay`, the events they generate are
/// never due before half-epoch `k + 2`.
pub struct Simulation {
    ctx: ExecutionContext,
    decomposition: DomainDecomposition,
    communicator: Communicator,
    groups: Vec<Box<dyn CellGroup>>,
    lanes: Vec<EventLane>,
    queue_scratch: Vec<Vec<SpikeEvent>>,
    epoch_length: TimeMs,
    time: TimeMs,
    epoch_id: u64,
    next_sampler: SamplerId,
    spike_callback: Option<SpikeCallback>,
}

impl Simulation {
    pub fn new(recipe: &dyn Recipe, ctx: ExecutionContext) -> Result<Self, SimulationError> {
        Self::new_with_hint(recipe, ctx, PartitionHint::default())
    }

    pub fn new_with_hint(
        recipe: &dyn Recipe,
        ctx: ExecutionContext,
        hint: PartitionHint,
    ) -> Result<Self, SimulationError> {
        check_recipe(recipe)?;
        let decomposition = partition_load_balance_with_hint(recipe, &ctx, hint)?;
        info!(
            "domain {} of {}: {} cells in {} groups",
            decomposition.domain_id,
            decomposition.num_domains,
            decomposition.num_local_cells,
            decomposition.groups.len()
        );

        let mut groups: Vec<Box<dyn CellGroup>> = Vec::with_capacity(decomposition.groups.len());
        let mut local_labels = CellLabelsAndGids::default();
        for description in &decomposition.groups {
            let (group, labels) = make_cell_group(recipe, description.kind, &description.gids)?;
            local_labels.append(labels);
            groups.push(group);
        }

        let gathered = ctx.distributed.gather_cell_labels_and_gids(local_labels);
        let label_map = LabelResolutionMap::build(&gathered)?;
        let communicator = Communicator::new(recipe, &decomposition, &label_map, &ctx)?;

        let min_delay = communicator.min_delay(&ctx);
        let epoch_length = if min_delay.is_finite() {
            min_delay / 2.0
        } else {
            f64::INFINITY
        };
        info!("min connection delay {min_delay} ms, half-epoch {epoch_length} ms");

        let num_local_cells = decomposition.num_local_cells;
        Ok(Self {
            ctx,
            decomposition,
            communicator,
            groups,
            lanes: vec![EventLane::new(); num_local_cells],
            queue_scratch: vec![Vec::new(); num_local_cells],
            epoch_length,
            time: 0.0,
            epoch_id: 0,
            next_sampler: 0,
            spike_callback: None,
        })
    }

    pub fn time(&self) -> TimeMs {
        self.time
    }

    pub fn num_spikes(&self) -> u64 {
        self.communicator.num_spikes()
    }

    pub fn decomposition(&self) -> &DomainDecomposition {
        &self.decomposition
    }

    pub fn communicator(&self) -> &Communicator {
        &self.communicator
    }

    /// Called after every exchange with the gathered global spikes of the
    /// finished half-epoch.
    pub fn set_global_spike_callback(&mut self, callback: SpikeCallback) {
        self.spike_callback = Some(callback);
    }

    /// Registers a sampler against a probe; the id is unique per simulation.
    pub fn add_sampler(
        &mut self,
        probe: ProbeId,
        schedule: Schedule,
        callback: SamplerFn,
    ) -> SamplerId {
        let id = self.next_sampler;
        self.next_sampler += 1;
        if let Some(group) = self
            .groups
            .iter_mut()
            .find(|group| group.gids().contains(&probe.gid))
        {
            group.add_sampler(id, probe, schedule, callback);
        }
        id
    }

    pub fn remove_sampler(&mut self, id: SamplerId) {
        for group in &mut self.groups {
            group.remove_sampler(id);
        }
    }

    /// Integrates up to `t_end`, exchanging spikes at every half-epoch
    /// boundary. Returns the simulated time reached.
    pub fn run(&mut self, t_end: TimeMs, dt: TimeMs) -> TimeMs {
        assert!(dt > 0.0, "integration step must be positive");
        while self.time < t_end {
            let t1 = (self.time + self.epoch_length).min(t_end);
            let epoch = Epoch::new(self.epoch_id, self.time, t1);
            debug!("epoch {}: [{}, {}) ms", epoch.id, epoch.t0, epoch.t1);

            // Advance every group in parallel over its slice of event lanes.
            let group_ranges: Vec<(usize, usize)> = (0..self.groups.len())
                .map(|i| self.communicator.group_queue_range(i))
                .collect();
            let lane_chunks = split_ranges(&mut self.lanes, &group_ranges);
            let groups = &mut self.groups;
            self.ctx.thread_pool.install(|| {
                groups
                    .par_iter_mut()
                    .zip(lane_chunks)
                    .for_each(|(group, lanes)| group.advance(epoch, dt, lanes));
            });

            // Gather this half-epoch's spikes and queue the events they
            // produce; min_delay keeps them out of the next half-epoch.
            let mut local_spikes = Vec::new();
            for group in self.groups.iter_mut() {
                local_spikes.extend_from_slice(group.spikes());
                group.clear_spikes();
            }
            let gathered = self.communicator.exchange(local_spikes, &self.ctx);
            if let Some(callback) = self.spike_callback.as_mut() {
                callback(gathered.values());
            }
            self.communicator
                .make_event_queues(&gathered, &mut self.queue_scratch);
            for (lane, queue) in self.lanes.iter_mut().zip(self.queue_scratch.iter_mut()) {
                for event in queue.drain(..) {
                    lane.push(event);
                }
            }

            self.time = t1;
            self.epoch_id += 1;
        }
        self.time
    }

    /// Restores the state of a freshly constructed simulation: groups back
    /// to their initial state, queues empty, time zero.
    pub fn reset(&mut self) {
        for group in self.groups.iter_mut() {
            group.reset();
            group.clear_spikes();
        }
        for lane in self.lanes.iter_mut() {
            lane.clear();
        }
        for queue in self.queue_scratch.iter_mut() {
            queue.clear();
        }
        self.communicator.reset();
        self.time = 0.0;
        self.epoch_id = 0;
        // Keep ranks aligned before anyone re-enters the epoch loop.
        self.ctx.distributed.barrier();
    }
}

/// Splits a slice into the disjoint mutable sub-slices given by contiguous
/// `(begin, end)` ranges.
fn split_ranges<'a, T>(mut slice: &'a mut [T], ranges: &[(usize, usize)]) -> Vec<&'a mut [T]> {
    let mut out = Vec::with_capacity(ranges.len());
    let mut consumed = 0;
    for &(begin, end) in ranges {
        debug_assert_eq!(begin, consumed);
        let (head, tail) = slice.split_at_mut(end - begin);
        out.push(head);
        slice = tail;
        consumed = end;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_ranges_covers_the_slice() {
        let mut data = [0u32, 1, 2, 3, 4];
        let chunks = split_ranges(&mut data, &[(0, 2), (2, 2), (2, 5)]);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0], &[0, 1]);
        assert!(chunks[1].is_empty());
        assert_eq!(chunks[2], &[2, 3, 4]);
    }
}
