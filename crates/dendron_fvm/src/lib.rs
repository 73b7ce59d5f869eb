#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use dendron_morph::{CableCellDescription, Embedding, Mcable, Mlocation, Morphology, Paint, PI};
use dendron_recipe::CableGlobalProperties;
pub use dendron_recipe::CvPolicy;
use thiserror::Error;

pub mod mechdata;

pub use mechdata::{
    build_mechanism_data, CellMechData, DensityConfig, DetectorConfig, IonConfig, JunctionSite,
    StimulusConfig, SynapseConfig,
};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum FvmError {
    #[error("cable cell error: {0}")]
    CableCell(String),
    #[error("illegal diffusivity {value} for ion '{ion}'")]
    IllegalDiffusiveMechanism { ion: String, value: f64 },
    #[error(transparent)]
    Mechanism(#[from] dendron_mech::MechanismError),
    #[error("discretization produced a zero-area CV {cv} with a placed mechanism")]
    ZeroAreaCv { cv: usize },
}

/// The CV tree of one or more packed cells. Parents precede children, so
/// `cv_parent[i] < i` whenever `i` is not a root.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CvGeometry {
    pub cv_parent: Vec<Option<usize>>,
    pub cv_cables: Vec<Mcable>,
}

impl CvGeometry {
    pub fn size(&self) -> usize {
        self.cv_parent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cv_parent.is_empty()
    }

    pub fn children(&self, cv: usize) -> Vec<usize> {
        (0..self.size())
            .filter(|&i| self.cv_parent[i] == Some(cv))
            .collect()
    }

    fn build(morphology: &Morphology, embedding: &Embedding, policy: CvPolicy) -> Self {
        let mut cv_parent = Vec::new();
        let mut cv_cables = Vec::new();
        let mut branch_tail: Vec<usize> = Vec::with_capacity(morphology.num_branches());
        for branch in 0..morphology.num_branches() as u32 {
            let n_cv = match policy {
                CvPolicy::FixedPerBranch(n) => n.max(1) as usize,
                CvPolicy::MaxExtent(extent) => {
                    let length = embedding.branch_length(branch);
                    ((length / extent).ceil() as usize).max(1)
                }
            };
            for i in 0..n_cv {
                let prox = i as f64 / n_cv as f64;
                let dist = (i + 1) as f64 / n_cv as f64;
                let parent = if i > 0 {
                    Some(cv_parent.len() - 1)
                } else {
                    morphology
                        .branch_parent(branch)
                        .map(|p| branch_tail[p as usize])
                };
                cv_parent.push(parent);
                cv_cables.push(Mcable::new(branch, prox, dist));
            }
            branch_tail.push(cv_parent.len() - 1);
        }
        Self {
            cv_parent,
            cv_cables,
        }
    }
}

/// The FVM quantities of one or more packed cells, ready to feed the Hines
/// backend.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Discretization {
    pub geometry: CvGeometry,
    pub cell_cv_divs: Vec<usize>,
    /// µS, face to the parent CV; zero on roots.
    pub face_conductance: Vec<f64>,
    /// µm²
    pub cv_area: Vec<f64>,
    /// pF
    pub cv_capacitance: Vec<f64>,
    /// mV
    pub init_membrane_potential: Vec<f64>,
    /// K
    pub temperature_k: Vec<f64>,
    pub diam_um: Vec<f64>,
    /// Per diffusive ion, the face diffusivity analogue of face_conductance.
    pub face_diffusivity: BTreeMap<String, Vec<f64>>,
}

impl Discretization {
    pub fn empty() -> Self {
        Self {
            cell_cv_divs: vec![0],
            ..Default::default()
        }
    }

    pub fn size(&self) -> usize {
        self.geometry.size()
    }

    pub fn num_cells(&self) -> usize {
        self.cell_cv_divs.len().saturating_sub(1)
    }

    /// Packs another cell's discretization behind this one, renumbering its
    /// CV tree into the combined index space. Appending an empty
    /// discretization is the identity.
    pub fn append(&mut self, other: &Discretization) {
        let offset = self.size();
        self.geometry.cv_parent.extend(
            other
                .geometry
                .cv_parent
                .iter()
                .map(|p| p.map(|i| i + offset)),
        );
        self.geometry
            .cv_cables
            .extend(other.geometry.cv_cables.iter().copied());
        let base = *self.cell_cv_divs.last().expect("divs start at zero");
        self.cell_cv_divs
            .extend(other.cell_cv_divs.iter().skip(1).map(|d| d + base));
        self.face_conductance
            .extend(other.face_conductance.iter().copied());
        self.cv_area.extend(other.cv_area.iter().copied());
        self.cv_capacitance
            .extend(other.cv_capacitance.iter().copied());
        self.init_membrane_potential
            .extend(other.init_membrane_potential.iter().copied());
        self.temperature_k.extend(other.temperature_k.iter().copied());
        self.diam_um.extend(other.diam_um.iter().copied());
        for (ion, values) in &other.face_diffusivity {
            let entry = self
                .face_diffusivity
                .entry(ion.clone())
                .or_insert_with(|| vec![0.0; offset]);
            entry.extend(values.iter().copied());
        }
        let size = self.size();
        for values in self.face_diffusivity.values_mut() {
            if values.len() < size {
                values.resize(size, 0.0);
            }
        }
    }

    /// The CV whose cable contains the location; the distal-most match when
    /// the location falls on a CV boundary.
    pub fn cv_at(&self, cell: usize, loc: Mlocation) -> Option<usize> {
        let begin = self.cell_cv_divs[cell];
        let end = self.cell_cv_divs[cell + 1];
        (begin..end)
            .filter(|&i| self.geometry.cv_cables[i].contains(loc))
            .last()
    }
}

/// The per-branch piecewise-constant value of one painted parameter: paint
/// order decides overlaps, later paintings win; `default` fills the gaps.
struct PaintMap {
    by_branch: BTreeMap<u32, Vec<(Mcable, f64)>>,
    default: f64,
}

impl PaintMap {
    fn new(default: f64) -> Self {
        Self {
            by_branch: BTreeMap::new(),
            default,
        }
    }

    fn add(&mut self, cable: Mcable, value: f64) {
        self.by_branch
            .entry(cable.branch)
            .or_default()
            .push((cable, value));
    }

    /// Splits `span` into elementary intervals of constant value.
    fn pieces(&self, span: &Mcable) -> Vec<(Mcable, f64)> {
        let paints = match self.by_branch.get(&span.branch) {
            Some(paints) => paints.as_slice(),
            None => return vec![(*span, self.default)],
        };
        let mut cuts = vec![span.prox_pos, span.dist_pos];
        for (cable, _) in paints {
            for cut in [cable.prox_pos, cable.dist_pos] {
                if cut > span.prox_pos && cut < span.dist_pos {
                    cuts.push(cut);
                }
            }
        }
        cuts.sort_by(|a, b| a.partial_cmp(b).expect("positions are finite"));
        cuts.dedup();
        let mut out = Vec::with_capacity(cuts.len() - 1);
        for window in cuts.windows(2) {
            let piece = Mcable::new(span.branch, window[0], window[1]);
            let mid = 0.5 * (piece.prox_pos + piece.dist_pos);
            let value = paints
                .iter()
                .rev()
                .find(|(cable, _)| cable.prox_pos <= mid && mid <= cable.dist_pos)
                .map(|(_, v)| *v)
                .unwrap_or(self.default);
            out.push((piece, value));
        }
        out
    }
}

fn collect_paint_map(
    cell: &CableCellDescription,
    default: f64,
    select: impl Fn(&Paint) -> Option<f64>,
) -> PaintMap {
    let mut map = PaintMap::new(default);
    for painting in &cell.paintings {
        if let Some(value) = select(&painting.paint) {
            for cable in &painting.region.cables {
                map.add(*cable, value);
            }
        }
    }
    map
}

/// Discretizes one cable cell under the given policy and global defaults.
///
/// Face conductance between a CV and its parent integrates the axial
/// resistivity over the span between the two reference points (CV midpoints
/// on a shared branch, the fork point for a parent on another branch):
/// `g = 100 / ∫ r_L dx / (π r(x)²)` in µS with `r_L` in Ω·cm and geometry
/// in µm. Area-weighted averages give the per-CV capacitance, initial
/// potential and temperature.
pub fn discretize(
    cell: &CableCellDescription,
    gprops: &CableGlobalProperties,
    policy: CvPolicy,
) -> Result<Discretization, FvmError> {
    let morphology = &cell.morphology;
    let embedding = Embedding::new(morphology);
    let geometry = CvGeometry::build(morphology, &embedding, policy);
    let n_cv = geometry.size();

    let dflt_resistivity = cell
        .defaults
        .axial_resistivity
        .unwrap_or(gprops.axial_resistivity);
    let dflt_capacitance = cell
        .defaults
        .membrane_capacitance
        .unwrap_or(gprops.membrane_capacitance);
    let dflt_potential = cell
        .defaults
        .init_membrane_potential
        .unwrap_or(gprops.init_membrane_potential);
    let dflt_temperature = cell.defaults.temperature_k.unwrap_or(gprops.temperature_k);

    let resistivity = collect_paint_map(cell, dflt_resistivity, |p| match p {
        Paint::AxialResistivity(v) => Some(*v),
        _ => None,
    });
    let capacitance = collect_paint_map(cell, dflt_capacitance, |p| match p {
        Paint::MembraneCapacitance(v) => Some(*v),
        _ => None,
    });
    let potential = collect_paint_map(cell, dflt_potential, |p| match p {
        Paint::InitMembranePotential(v) => Some(*v),
        _ => None,
    });
    let temperature = collect_paint_map(cell, dflt_temperature, |p| match p {
        Paint::TemperatureK(v) => Some(*v),
        _ => None,
    });

    // Diffusive ions: any ion with a positive painted or global diffusivity.
    // Painted or defaulted non-positive values where diffusion is requested
    // are construction errors.
    let mut inverse_diffusivity: BTreeMap<String, PaintMap> = BTreeMap::new();
    let mut painted_diffusive: BTreeMap<String, Vec<(Mcable, f64)>> = BTreeMap::new();
    for painting in &cell.paintings {
        if let Paint::IonDiffusivity { ion, value } = &painting.paint {
            for cable in &painting.region.cables {
                painted_diffusive
                    .entry(ion.clone())
                    .or_default()
                    .push((*cable, *value));
            }
        }
    }
    let mut diffusive_ions: Vec<String> = gprops
        .ion_data
        .iter()
        .filter(|(_, data)| data.diffusivity != 0.0)
        .map(|(ion, _)| ion.clone())
        .collect();
    for ion in painted_diffusive.keys() {
        if !diffusive_ions.contains(ion) {
            diffusive_ions.push(ion.clone());
        }
    }
    for ion in &diffusive_ions {
        let default = gprops
            .ion_data
            .get(ion)
            .map(|data| data.diffusivity)
            .unwrap_or(0.0);
        // A diffusive ion needs a positive global default even when every
        // cable in sight paints its own value.
        if default <= 0.0 {
            return Err(FvmError::IllegalDiffusiveMechanism {
                ion: ion.clone(),
                value: default,
            });
        }
        let mut map = PaintMap::new(1.0 / default);
        if let Some(paints) = painted_diffusive.get(ion) {
            for (cable, value) in paints {
                if *value <= 0.0 {
                    return Err(FvmError::IllegalDiffusiveMechanism {
                        ion: ion.clone(),
                        value: *value,
                    });
                }
                map.add(*cable, 1.0 / value);
            }
        }
        inverse_diffusivity.insert(ion.clone(), map);
    }

    let mut d = Discretization {
        cell_cv_divs: vec![0, n_cv],
        face_conductance: vec![0.0; n_cv],
        cv_area: vec![0.0; n_cv],
        cv_capacitance: vec![0.0; n_cv],
        init_membrane_potential: vec![0.0; n_cv],
        temperature_k: vec![0.0; n_cv],
        diam_um: vec![0.0; n_cv],
        face_diffusivity: diffusive_ions
            .iter()
            .map(|ion| (ion.clone(), vec![0.0; n_cv]))
            .collect(),
        geometry,
    };

    for i in 0..n_cv {
        let cv_cable = d.geometry.cv_cables[i];

        if let Some(p) = d.geometry.cv_parent[i] {
            let parent_cable = d.geometry.cv_cables[p];
            let branch = cv_cable.branch;
            let cv_refpt = 0.5 * (cv_cable.prox_pos + cv_cable.dist_pos);
            let parent_refpt = if parent_cable.branch == branch {
                0.5 * (parent_cable.prox_pos + parent_cable.dist_pos)
            } else {
                // The parent CV ends at the fork; the span starts there.
                0.0
            };
            let span = Mcable::new(branch, parent_refpt, cv_refpt);
            let mut resistance = 0.0;
            for (piece, rho) in resistivity.pieces(&span) {
                resistance += rho * embedding.integrate_ixa(morphology, &piece);
            }
            d.face_conductance[i] = 100.0 / resistance;

            for (ion, map) in &inverse_diffusivity {
                let mut diff_resistance = 0.0;
                for (piece, inv_d) in map.pieces(&span) {
                    diff_resistance += inv_d * embedding.integrate_ixa(morphology, &piece);
                }
                d.face_diffusivity.get_mut(ion).expect("ion present")[i] = 1.0 / diff_resistance;
            }
        }

        let mut area = 0.0;
        let mut cap = 0.0;
        let mut pot = 0.0;
        let mut temp = 0.0;
        for (piece, cm) in capacitance.pieces(&cv_cable) {
            let piece_area = embedding.integrate_area(morphology, &piece);
            area += piece_area;
            // µF/cm² × µm² → pF with the factor 1e-2.
            cap += cm * piece_area * 1e-2;
        }
        for (piece, v0) in potential.pieces(&cv_cable) {
            pot += v0 * embedding.integrate_area(morphology, &piece);
        }
        for (piece, t) in temperature.pieces(&cv_cable) {
            temp += t * embedding.integrate_area(morphology, &piece);
        }
        let length = embedding.integrate_length(&cv_cable);
        d.cv_area[i] = area;
        d.cv_capacitance[i] = cap;
        if area > 0.0 {
            d.init_membrane_potential[i] = pot / area;
            d.temperature_k[i] = temp / area;
            for values in d.face_diffusivity.values_mut() {
                values[i] /= area;
            }
        } else if let Some(p) = d.geometry.cv_parent[i] {
            d.init_membrane_potential[i] = d.init_membrane_potential[p];
            d.temperature_k[i] = d.temperature_k[p];
        }
        if length > 0.0 {
            d.diam_um[i] = area / (length * PI);
        }
    }

    log::debug!(
        "discretized cell: {} CVs over {} branches, {} diffusive ions",
        n_cv,
        morphology.num_branches(),
        d.face_diffusivity.len()
    );
    Ok(d)
}

/// Voltage interpolation at an arbitrary site from two reference points
/// whose coefficients are proportional to the axial resistance between the
/// site and the opposite reference.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoltageInterpolant {
    pub cv_a: usize,
    pub cv_b: usize,
    pub coef_a: f64,
    pub coef_b: f64,
}

pub fn interpolate_voltage(
    d: &Discretization,
    morphology: &Morphology,
    cell: usize,
    site: Mlocation,
) -> Option<VoltageInterpolant> {
    let embedding = Embedding::new(morphology);
    let cv = d.cv_at(cell, site)?;
    let cable = d.geometry.cv_cables[cv];
    let midpoint = 0.5 * (cable.prox_pos + cable.dist_pos);

    // Pick the adjacent reference so the pair spans the site: the parent
    // when the site is proximal of this CV's reference point, otherwise the
    // child on the same branch.
    let neighbor = if site.pos <= midpoint {
        d.geometry.cv_parent[cv].filter(|&p| d.geometry.cv_cables[p].branch == cable.branch)
    } else {
        d.geometry
            .children(cv)
            .into_iter()
            .find(|&c| d.geometry.cv_cables[c].branch == cable.branch)
    };
    let Some(other) = neighbor else {
        return Some(VoltageInterpolant {
            cv_a: cv,
            cv_b: cv,
            coef_a: 1.0,
            coef_b: 0.0,
        });
    };

    let other_cable = d.geometry.cv_cables[other];
    let other_mid = 0.5 * (other_cable.prox_pos + other_cable.dist_pos);
    let (lo, hi) = if midpoint <= other_mid {
        (midpoint, other_mid)
    } else {
        (other_mid, midpoint)
    };
    let r_total = embedding.integrate_ixa(morphology, &Mcable::new(cable.branch, lo, hi));
    if r_total <= 0.0 {
        return Some(VoltageInterpolant {
            cv_a: cv,
            cv_b: cv,
            coef_a: 1.0,
            coef_b: 0.0,
        });
    }
    let pos = site.pos.clamp(lo, hi);
    let r_to_site = embedding.integrate_ixa(morphology, &Mcable::new(cable.branch, lo, pos));
    let t = r_to_site / r_total;
    let (cv_a, cv_b) = if midpoint <= other_mid {
        (cv, other)
    } else {
        (other, cv)
    };
    Some(VoltageInterpolant {
        cv_a,
        cv_b,
        coef_a: 1.0 - t,
        coef_b: t,
    })
}
