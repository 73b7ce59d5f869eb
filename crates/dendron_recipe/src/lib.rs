#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use dendron_core::{CellGid, CellKind, TimeMs, MAX_SOURCE_GID};
use dendron_labels::LidSelectionPolicy;
use dendron_mech::{builtin_catalogue, Catalogue};
use dendron_morph::{CableCellDescription, Mlocation};
use thiserror::Error;

pub mod schedule;

pub use schedule::Schedule;

/// A symbolic endpoint on a cell, resolved to a lid during construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellLocalLabel {
    pub tag: String,
    pub policy: LidSelectionPolicy,
}

impl CellLocalLabel {
    pub fn univalent(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            policy: LidSelectionPolicy::AssertUnivalent,
        }
    }

    pub fn round_robin(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            policy: LidSelectionPolicy::RoundRobin,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellGlobalLabel {
    pub gid: CellGid,
    pub label: CellLocalLabel,
}

impl CellGlobalLabel {
    pub fn new(gid: u32, label: CellLocalLabel) -> Self {
        Self {
            gid: CellGid(gid),
            label,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RecipeError {
    #[error("cell {gid} reports kind {kind:?} but its description is of a different kind")]
    BadCellDescription { gid: CellGid, kind: CellKind },
    #[error("connection on cell {gid} names source gid {source_gid} outside [0, {num_cells})")]
    BadConnectionSourceGid {
        gid: CellGid,
        source_gid: u32,
        num_cells: usize,
    },
    #[error("connection on cell {gid} names source gid {source_gid} above the external-source bound {bound}")]
    SourceGidExceedsLimit {
        gid: CellGid,
        source_gid: u32,
        bound: u32,
    },
    #[error("connection on cell {gid} has non-finite weight {weight}")]
    NonFiniteWeight { gid: CellGid, weight: f32 },
    #[error("connection on cell {gid} has negative or non-finite delay {delay} ms")]
    BadDelay { gid: CellGid, delay: f64 },
    #[error("gap junction on cell {gid} has non-finite conductance {weight}")]
    NonFiniteConductance { gid: CellGid, weight: f64 },
}

/// A connection whose target is the cell it was reported on. Delay must be
/// non-negative and finite here; strict positivity of the global minimum is
/// enforced when the connection table is built.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionDesc {
    pub source: CellGlobalLabel,
    pub target: CellLocalLabel,
    pub weight: f32,
    pub delay_ms: TimeMs,
}

impl ConnectionDesc {
    pub fn new(
        source: CellGlobalLabel,
        target: CellLocalLabel,
        weight: f32,
        delay_ms: TimeMs,
    ) -> Self {
        Self {
            source,
            target,
            weight,
            delay_ms,
        }
    }
}

/// Symmetric coupling; the recipe must report the edge from both endpoints.
#[derive(Debug, Clone, PartialEq)]
pub struct GapJunctionDesc {
    pub peer: CellGlobalLabel,
    pub local: CellLocalLabel,
    pub conductance_us: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LifCell {
    pub source: String,
    pub target: String,
    pub tau_m_ms: f64,
    pub v_rest_mv: f64,
    pub v_reset_mv: f64,
    pub v_thresh_mv: f64,
    pub t_ref_ms: f64,
}

impl Default for LifCell {
    fn default() -> Self {
        Self {
            source: "src".to_string(),
            target: "tgt".to_string(),
            tau_m_ms: 10.0,
            v_rest_mv: -65.0,
            v_reset_mv: -65.0,
            v_thresh_mv: -50.0,
            t_ref_ms: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpikeSourceCell {
    pub source: String,
    pub schedule: Schedule,
}

impl SpikeSourceCell {
    pub fn new(source: impl Into<String>, schedule: Schedule) -> Self {
        Self {
            source: source.into(),
            schedule,
        }
    }
}

/// Produces spikes at a fixed rate irrespective of input; used to measure
/// the overhead of everything that is not cell integration.
#[derive(Debug, Clone, PartialEq)]
pub struct BenchmarkCell {
    pub source: String,
    pub target: String,
    pub schedule: Schedule,
    pub realtime_ratio: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CellDescription {
    Cable(Box<CableCellDescription>),
    Lif(LifCell),
    SpikeSource(SpikeSourceCell),
    Benchmark(BenchmarkCell),
}

impl CellDescription {
    pub fn kind(&self) -> CellKind {
        match self {
            CellDescription::Cable(_) => CellKind::Cable,
            CellDescription::Lif(_) => CellKind::Lif,
            CellDescription::SpikeSource(_) => CellKind::SpikeSource,
            CellDescription::Benchmark(_) => CellKind::Benchmark,
        }
    }
}

/// An injected stream of events against one target on the owning cell.
#[derive(Debug, Clone, PartialEq)]
pub struct EventGenerator {
    pub target: CellLocalLabel,
    pub weight: f32,
    pub schedule: Schedule,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProbeAddress {
    MembraneVoltage { location: Mlocation },
    TotalIonCurrent { location: Mlocation },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeInfo {
    pub tag: String,
    pub address: ProbeAddress,
}

/// How cable cells are chopped into control volumes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CvPolicy {
    /// Every branch becomes exactly `n` CVs of equal relative extent.
    FixedPerBranch(u32),
    /// CVs no longer than the given span in µm.
    MaxExtent(f64),
}

impl Default for CvPolicy {
    fn default() -> Self {
        CvPolicy::FixedPerBranch(1)
    }
}

/// Defaults and ion bookkeeping shared by every cable cell.
#[derive(Debug, Clone, PartialEq)]
pub struct CableGlobalProperties {
    pub catalogue: Catalogue,
    pub cv_policy: CvPolicy,
    /// µF/cm²
    pub membrane_capacitance: f64,
    /// Ω·cm
    pub axial_resistivity: f64,
    /// mV
    pub init_membrane_potential: f64,
    /// K
    pub temperature_k: f64,
    pub ion_data: BTreeMap<String, IonData>,
    pub coalesce_synapses: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IonData {
    pub charge: i32,
    pub init_reversal_potential_mv: f64,
    /// m²/s; zero means the ion does not diffuse.
    pub diffusivity: f64,
}

impl Default for CableGlobalProperties {
    fn default() -> Self {
        let mut ion_data = BTreeMap::new();
        ion_data.insert(
            "na".to_string(),
            IonData {
                charge: 1,
                init_reversal_potential_mv: 50.0,
                diffusivity: 0.0,
            },
        );
        ion_data.insert(
            "k".to_string(),
            IonData {
                charge: 1,
                init_reversal_potential_mv: -77.0,
                diffusivity: 0.0,
            },
        );
        ion_data.insert(
            "ca".to_string(),
            IonData {
                charge: 2,
                init_reversal_potential_mv: 132.5,
                diffusivity: 0.0,
            },
        );
        Self {
            catalogue: builtin_catalogue(),
            cv_policy: CvPolicy::default(),
            membrane_capacitance: 1.0,
            axial_resistivity: 35.4,
            init_membrane_potential: -65.0,
            temperature_k: 279.45,
            ion_data,
            coalesce_synapses: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GlobalProperties {
    Cable(CableGlobalProperties),
    Default,
}

impl GlobalProperties {
    pub fn cable(&self) -> CableGlobalProperties {
        match self {
            GlobalProperties::Cable(props) => props.clone(),
            GlobalProperties::Default => CableGlobalProperties::default(),
        }
    }
}

/// The user-supplied, cell-indexed network description. Immutable for the
/// duration of a run; operations may be called concurrently for distinct
/// gids.
pub trait Recipe: Send + Sync {
    fn num_cells(&self) -> usize;

    fn cell_kind(&self, gid: CellGid) -> CellKind;

    fn cell_description(&self, gid: CellGid) -> CellDescription;

    fn connections_on(&self, _gid: CellGid) -> Vec<ConnectionDesc> {
        Vec::new()
    }

    fn gap_junctions_on(&self, _gid: CellGid) -> Vec<GapJunctionDesc> {
        Vec::new()
    }

    fn probes(&self, _gid: CellGid) -> Vec<ProbeInfo> {
        Vec::new()
    }

    fn event_generators(&self, _gid: CellGid) -> Vec<EventGenerator> {
        Vec::new()
    }

    fn global_properties(&self, _kind: CellKind) -> GlobalProperties {
        GlobalProperties::Default
    }
}

/// Validates the per-cell reports of a recipe against the invariants the
/// construction phases rely on.
pub fn check_recipe(recipe: &dyn Recipe) -> Result<(), RecipeError> {
    let num_cells = recipe.num_cells();
    for raw in 0..num_cells as u32 {
        let gid = CellGid(raw);
        let kind = recipe.cell_kind(gid);
        let description = recipe.cell_description(gid);
        if description.kind() != kind {
            return Err(RecipeError::BadCellDescription { gid, kind });
        }
        for connection in recipe.connections_on(gid) {
            let source = connection.source.gid.0;
            if source >= MAX_SOURCE_GID {
                return Err(RecipeError::SourceGidExceedsLimit {
                    gid,
                    source_gid: source,
                    bound: MAX_SOURCE_GID,
                });
            }
            if source as usize >= num_cells {
                return Err(RecipeError::BadConnectionSourceGid {
                    gid,
                    source_gid: source,
                    num_cells,
                });
            }
            if !connection.weight.is_finite() {
                return Err(RecipeError::NonFiniteWeight {
                    gid,
                    weight: connection.weight,
                });
            }
            if !connection.delay_ms.is_finite() || connection.delay_ms < 0.0 {
                return Err(RecipeError::BadDelay {
                    gid,
                    delay: connection.delay_ms,
                });
            }
        }
        for junction in recipe.gap_junctions_on(gid) {
            if !junction.conductance_us.is_finite() {
                return Err(RecipeError::NonFiniteConductance {
                    gid,
                    weight: junction.conductance_us,
                });
            }
        }
    }
    Ok(())
}
