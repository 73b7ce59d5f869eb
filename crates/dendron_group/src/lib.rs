#![forbid(unsafe_code)]

use dendron_core::{event_order, CellGid, CellKind, Epoch, Spike, SpikeEvent, TimeMs};
use dendron_labels::{CellLabelRange, CellLabelsAndGids, LidRange};
use dendron_recipe::{CellDescription, Recipe, Schedule};
use thiserror::Error;

pub mod benchmark;
pub mod cable;
pub mod lif;
pub mod spike_source;

pub use benchmark::BenchmarkCellGroup;
pub use cable::CableCellGroup;
pub use lif::LifCellGroup;
pub use spike_source::SpikeSourceCellGroup;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GroupError {
    #[error("cell {gid} was described as {expected:?} but the recipe delivered {got:?}")]
    WrongDescription {
        gid: CellGid,
        expected: CellKind,
        got: CellKind,
    },
    #[error(transparent)]
    Fvm(#[from] dendron_fvm::FvmError),
    #[error(transparent)]
    Label(#[from] dendron_labels::LabelError),
    #[error("gap junction on cell {gid} references peer {peer} outside this group")]
    GjPeerNotInGroup { gid: CellGid, peer: CellGid },
    #[error("gap junction label '{label}' on cell {gid} uses an unsupported lid selection policy")]
    GjUnsupportedLidSelectionPolicy { gid: CellGid, label: String },
}

/// The driver-owned event queue of one cell. Events accumulate unsorted
/// during delivery construction; the owning group takes the due prefix in
/// delivery order at each advance.
#[derive(Debug, Clone, Default)]
pub struct EventLane {
    events: Vec<SpikeEvent>,
}

impl EventLane {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: SpikeEvent) {
        self.events.push(event);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn events(&self) -> &[SpikeEvent] {
        &self.events
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    /// Removes and returns every event due strictly before `t1`, sorted by
    /// `(time, target, weight)`. Later events stay queued.
    pub fn take_due(&mut self, t1: TimeMs) -> Vec<SpikeEvent> {
        let mut due = Vec::new();
        let mut keep = Vec::with_capacity(self.events.len());
        for event in self.events.drain(..) {
            if event.time < t1 {
                due.push(event);
            } else {
                keep.push(event);
            }
        }
        self.events = keep;
        due.sort_by(event_order);
        due
    }
}

pub type SamplerId = u64;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub time: TimeMs,
    pub value: f64,
}

/// Selects one probe on one cell by the tag the recipe gave it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeId {
    pub gid: CellGid,
    pub tag: String,
}

pub type SamplerFn = Box<dyn FnMut(SamplerId, &[Sample]) + Send>;

/// A set of cells of one kind, integrated together on one domain.
///
/// `advance` must honor the epoch as a hard horizon and never integrate past
/// it; spikes produced during the call accumulate until `clear_spikes`.
pub trait CellGroup: Send {
    fn kind(&self) -> CellKind;

    fn gids(&self) -> &[CellGid];

    fn advance(&mut self, epoch: Epoch, dt: TimeMs, lanes: &mut [EventLane]);

    fn spikes(&self) -> &[Spike];

    fn clear_spikes(&mut self);

    fn reset(&mut self);

    fn add_sampler(
        &mut self,
        _id: SamplerId,
        _probe: ProbeId,
        _schedule: Schedule,
        _callback: SamplerFn,
    ) {
    }

    fn remove_sampler(&mut self, _id: SamplerId) {}

    fn remove_all_samplers(&mut self) {}
}

/// Builds the group for a set of gids of one kind, dispatching on the kind
/// tag. Returns the group alongside the label ranges its constructors
/// assigned, for the global resolution map.
pub fn make_cell_group(
    recipe: &dyn Recipe,
    kind: CellKind,
    gids: &[CellGid],
) -> Result<(Box<dyn CellGroup>, CellLabelsAndGids), GroupError> {
    match kind {
        CellKind::Cable => {
            let (group, labels) = CableCellGroup::new(recipe, gids)?;
            Ok((Box::new(group), labels))
        }
        CellKind::Lif => {
            let (group, labels) = LifCellGroup::new(recipe, gids)?;
            Ok((Box::new(group), labels))
        }
        CellKind::SpikeSource => {
            let (group, labels) = SpikeSourceCellGroup::new(recipe, gids)?;
            Ok((Box::new(group), labels))
        }
        CellKind::Benchmark => {
            let (group, labels) = BenchmarkCellGroup::new(recipe, gids)?;
            Ok((Box::new(group), labels))
        }
    }
}

fn expect_kind(
    gid: CellGid,
    expected: CellKind,
    description: &CellDescription,
) -> Result<(), GroupError> {
    let got = description.kind();
    if got != expected {
        return Err(GroupError::WrongDescription {
            gid,
            expected,
            got,
        });
    }
    Ok(())
}

/// Label ranges for the fixed-layout cell kinds: one source lid and, where
/// present, one target lid.
fn point_cell_labels(
    labels: &mut CellLabelRange,
    source: &str,
    target: Option<&str>,
) {
    labels.add_cell();
    labels.add_label(source, LidRange::new(0, 1));
    if let Some(target) = target {
        labels.add_label(target, LidRange::new(0, 1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dendron_core::CellLid;

    #[test]
    fn lane_takes_due_prefix_in_delivery_order() {
        let mut lane = EventLane::new();
        lane.push(SpikeEvent::new(CellLid(1), 2.0, 0.5));
        lane.push(SpikeEvent::new(CellLid(0), 1.0, 0.5));
        lane.push(SpikeEvent::new(CellLid(0), 2.0, 0.25));
        lane.push(SpikeEvent::new(CellLid(0), 9.0, 1.0));

        let due = lane.take_due(3.0);
        assert_eq!(
            due,
            vec![
                SpikeEvent::new(CellLid(0), 1.0, 0.5),
                SpikeEvent::new(CellLid(0), 2.0, 0.25),
                SpikeEvent::new(CellLid(1), 2.0, 0.5),
            ]
        );
        assert_eq!(lane.len(), 1);
        assert_eq!(lane.events()[0].time, 9.0);
    }

    #[test]
    fn ties_order_by_target_then_weight() {
        let mut lane = EventLane::new();
        lane.push(SpikeEvent::new(CellLid(1), 1.0, 0.5));
        lane.push(SpikeEvent::new(CellLid(0), 1.0, 0.75));
        lane.push(SpikeEvent::new(CellLid(0), 1.0, 0.25));
        let due = lane.take_due(2.0);
        assert_eq!(
            due,
            vec![
                SpikeEvent::new(CellLid(0), 1.0, 0.25),
                SpikeEvent::new(CellLid(0), 1.0, 0.75),
                SpikeEvent::new(CellLid(1), 1.0, 0.5),
            ]
        );
    }
}
