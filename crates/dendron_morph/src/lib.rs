#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod embedding;

pub use embedding::Embedding;

pub const PI: f64 = std::f64::consts::PI;

/// A point on the morphology: relative position along a branch, 0 at the
/// proximal end, 1 at the distal end.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Mlocation {
    pub branch: u32,
    pub pos: f64,
}

impl Mlocation {
    pub fn new(branch: u32, pos: f64) -> Self {
        Self { branch, pos }
    }
}

/// An unbranched interval `[prox_pos, dist_pos]` of one branch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Mcable {
    pub branch: u32,
    pub prox_pos: f64,
    pub dist_pos: f64,
}

impl Mcable {
    pub fn new(branch: u32, prox_pos: f64, dist_pos: f64) -> Self {
        Self {
            branch,
            prox_pos,
            dist_pos,
        }
    }

    pub fn whole(branch: u32) -> Self {
        Self::new(branch, 0.0, 1.0)
    }

    pub fn is_point(&self) -> bool {
        self.prox_pos == self.dist_pos
    }

    pub fn contains(&self, loc: Mlocation) -> bool {
        self.branch == loc.branch && self.prox_pos <= loc.pos && loc.pos <= self.dist_pos
    }

    /// Overlap with another cable on the same branch, if non-empty.
    pub fn intersect(&self, other: &Mcable) -> Option<Mcable> {
        if self.branch != other.branch {
            return None;
        }
        let prox = self.prox_pos.max(other.prox_pos);
        let dist = self.dist_pos.min(other.dist_pos);
        (prox < dist).then(|| Mcable::new(self.branch, prox, dist))
    }
}

/// A set of cables; `canonical` sorts and merges overlapping intervals.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Region {
    pub cables: Vec<Mcable>,
}

impl Region {
    pub fn from_cables(cables: Vec<Mcable>) -> Self {
        Self { cables }.canonical()
    }

    pub fn whole_branch(branch: u32) -> Self {
        Self::from_cables(vec![Mcable::whole(branch)])
    }

    pub fn all(morphology: &Morphology) -> Self {
        Self::from_cables(
            (0..morphology.num_branches() as u32)
                .map(Mcable::whole)
                .collect(),
        )
    }

    pub fn canonical(mut self) -> Self {
        self.cables.sort_by(|a, b| {
            (a.branch, a.prox_pos, a.dist_pos)
                .partial_cmp(&(b.branch, b.prox_pos, b.dist_pos))
                .expect("cable positions are finite")
        });
        let mut merged: Vec<Mcable> = Vec::with_capacity(self.cables.len());
        for cable in self.cables {
            match merged.last_mut() {
                Some(last) if last.branch == cable.branch && cable.prox_pos <= last.dist_pos => {
                    last.dist_pos = last.dist_pos.max(cable.dist_pos);
                }
                _ => merged.push(cable),
            }
        }
        Self { cables: merged }
    }

    pub fn intersects(&self, other: &Region) -> bool {
        self.cables
            .iter()
            .any(|a| other.cables.iter().any(|b| a.intersect(b).is_some()))
    }
}

/// A set of points.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Locset {
    pub locations: Vec<Mlocation>,
}

impl Locset {
    pub fn single(loc: Mlocation) -> Self {
        Self {
            locations: vec![loc],
        }
    }

    pub fn from_locations(locations: Vec<Mlocation>) -> Self {
        Self { locations }
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }
}

/// One tapered cylindrical piece of a branch. Lengths and radii in µm.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub length_um: f64,
    pub radius_prox_um: f64,
    pub radius_dist_um: f64,
}

impl Segment {
    pub fn cylinder(length_um: f64, radius_um: f64) -> Self {
        Self {
            length_um,
            radius_prox_um: radius_um,
            radius_dist_um: radius_um,
        }
    }
}

/// A maximal unbranched run of segments. `parent` is the branch whose distal
/// end this branch attaches to; `None` for the root branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub parent: Option<u32>,
    pub segments: Vec<Segment>,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MorphologyError {
    #[error("morphology has no branches")]
    Empty,
    #[error("branch {0} has no segments")]
    EmptyBranch(u32),
    #[error("branch {branch} has non-positive segment length {length}")]
    NonPositiveLength { branch: u32, length: f64 },
    #[error("branch {branch} has non-positive segment radius {radius}")]
    NonPositiveRadius { branch: u32, radius: f64 },
    #[error("branch {branch} names parent {parent} which is not an earlier branch")]
    BadParent { branch: u32, parent: u32 },
    #[error("branch {0} other than the first has no parent")]
    DetachedBranch(u32),
}

/// A cell morphology: a rooted tree of branches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Morphology {
    branches: Vec<Branch>,
}

impl Morphology {
    pub fn new(branches: Vec<Branch>) -> Result<Self, MorphologyError> {
        if branches.is_empty() {
            return Err(MorphologyError::Empty);
        }
        for (index, branch) in branches.iter().enumerate() {
            let id = index as u32;
            if branch.segments.is_empty() {
                return Err(MorphologyError::EmptyBranch(id));
            }
            for segment in &branch.segments {
                if segment.length_um <= 0.0 || !segment.length_um.is_finite() {
                    return Err(MorphologyError::NonPositiveLength {
                        branch: id,
                        length: segment.length_um,
                    });
                }
                let min_radius = segment.radius_prox_um.min(segment.radius_dist_um);
                if min_radius <= 0.0 || !min_radius.is_finite() {
                    return Err(MorphologyError::NonPositiveRadius {
                        branch: id,
                        radius: min_radius,
                    });
                }
            }
            match branch.parent {
                Some(parent) if parent >= id => {
                    return Err(MorphologyError::BadParent { branch: id, parent })
                }
                None if index != 0 => return Err(MorphologyError::DetachedBranch(id)),
                _ => {}
            }
        }
        Ok(Self { branches })
    }

    /// A single unbranched cell: one branch of one cylinder.
    pub fn soma(length_um: f64, radius_um: f64) -> Self {
        Self::new(vec![Branch {
            parent: None,
            segments: vec![Segment::cylinder(length_um, radius_um)],
        }])
        .expect("soma parameters are validated by the caller")
    }

    pub fn num_branches(&self) -> usize {
        self.branches.len()
    }

    pub fn branch(&self, id: u32) -> &Branch {
        &self.branches[id as usize]
    }

    pub fn branch_parent(&self, id: u32) -> Option<u32> {
        self.branches[id as usize].parent
    }

    pub fn branch_children(&self, id: u32) -> Vec<u32> {
        self.branches
            .iter()
            .enumerate()
            .filter(|(_, b)| b.parent == Some(id))
            .map(|(i, _)| i as u32)
            .collect()
    }
}

/// What a painting assigns over a region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Paint {
    Density(MechanismDesc),
    MembraneCapacitance(f64),
    AxialResistivity(f64),
    InitMembranePotential(f64),
    TemperatureK(f64),
    IonDiffusivity { ion: String, value: f64 },
}

/// What a placing puts on each location of a locset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Place {
    Synapse(MechanismDesc),
    Junction(MechanismDesc),
    CurrentClamp {
        amplitude_na: f64,
        from_ms: f64,
        duration_ms: f64,
    },
    ThresholdDetector {
        threshold_mv: f64,
    },
}

/// A mechanism name plus parameter overrides, resolved against the
/// catalogue during discretization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MechanismDesc {
    pub name: String,
    pub values: Vec<(String, f64)>,
}

impl MechanismDesc {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: Vec::new(),
        }
    }

    pub fn set(mut self, key: impl Into<String>, value: f64) -> Self {
        self.values.push((key.into(), value));
        self
    }

    pub fn value(&self, key: &str) -> Option<f64> {
        self.values
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| *v)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Painting {
    pub region: Region,
    pub paint: Paint,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Placing {
    pub label: String,
    pub locset: Locset,
    pub place: Place,
}

/// Per-cell overrides of the global cable parameters.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CableParamOverrides {
    pub membrane_capacitance: Option<f64>,
    pub axial_resistivity: Option<f64>,
    pub init_membrane_potential: Option<f64>,
    pub temperature_k: Option<f64>,
}

/// The full description of a cable cell: geometry plus decor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CableCellDescription {
    pub morphology: Morphology,
    pub paintings: Vec<Painting>,
    pub placings: Vec<Placing>,
    pub defaults: CableParamOverrides,
}

impl CableCellDescription {
    pub fn new(morphology: Morphology) -> Self {
        Self {
            morphology,
            paintings: Vec::new(),
            placings: Vec::new(),
            defaults: CableParamOverrides::default(),
        }
    }

    pub fn paint(mut self, region: Region, paint: Paint) -> Self {
        self.paintings.push(Painting { region, paint });
        self
    }

    pub fn place(mut self, label: impl Into<String>, locset: Locset, place: Place) -> Self {
        self.placings.push(Placing {
            label: label.into(),
            locset,
            place,
        });
        self
    }
}
