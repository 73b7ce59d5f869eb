#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use dendron_core::{update_u32, update_u8};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MechanismKind {
    Density,
    Point,
    Junction,
}

fn mechanism_kind_code(kind: MechanismKind) -> u8 {
    match kind {
        MechanismKind::Density => 0,
        MechanismKind::Point => 1,
        MechanismKind::Junction => 2,
    }
}

/// How a mechanism touches one ion species.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IonDep {
    pub ion: String,
    pub read_reversal_potential: bool,
    pub write_int_concentration: bool,
}

/// Static description of a catalogue entry. The fingerprint is a structural
/// hash; a mismatch between builder and integrator catalogues is detected by
/// comparing fingerprints, not names.
#[derive(Debug, Clone, PartialEq)]
pub struct MechanismInfo {
    pub name: String,
    pub kind: MechanismKind,
    pub parameters: Vec<(String, f64)>,
    pub state_vars: Vec<String>,
    pub ions: Vec<IonDep>,
    pub linear: bool,
}

impl MechanismInfo {
    pub fn parameter_default(&self, key: &str) -> Option<f64> {
        self.parameters
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| *value)
    }

    pub fn fingerprint(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"DENDRON:MECH:FP");
        hasher.update(self.name.as_bytes());
        update_u8(&mut hasher, mechanism_kind_code(self.kind));
        update_u32(&mut hasher, self.parameters.len() as u32);
        for (name, _) in &self.parameters {
            hasher.update(name.as_bytes());
            hasher.update(b";");
        }
        update_u32(&mut hasher, self.state_vars.len() as u32);
        for name in &self.state_vars {
            hasher.update(name.as_bytes());
            hasher.update(b";");
        }
        update_u32(&mut hasher, self.ions.len() as u32);
        for dep in &self.ions {
            hasher.update(dep.ion.as_bytes());
            update_u8(&mut hasher, dep.read_reversal_potential as u8);
            update_u8(&mut hasher, dep.write_int_concentration as u8);
        }
        update_u8(&mut hasher, self.linear as u8);
        *hasher.finalize().as_bytes()
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MechanismError {
    #[error("unknown mechanism '{0}'")]
    UnknownMechanism(String),
    #[error("mechanism '{mechanism}' has no parameter '{parameter}'")]
    UnknownParameter {
        mechanism: String,
        parameter: String,
    },
    #[error("mechanism '{mechanism}' parameter '{parameter}' has invalid value {value}")]
    InvalidParameter {
        mechanism: String,
        parameter: String,
        value: f64,
    },
    #[error("ion '{ion}' not present in global properties")]
    UnknownIon { ion: String },
    #[error("ion '{ion}' charge {got} does not match required {expected}")]
    IonChargeMismatch { ion: String, got: i32, expected: i32 },
}

/// The compiled-in catalogue. Closed set; there is no loadable ABI.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Catalogue {
    entries: BTreeMap<String, MechanismInfo>,
}

impl Catalogue {
    pub fn insert(&mut self, info: MechanismInfo) {
        self.entries.insert(info.name.clone(), info);
    }

    pub fn get(&self, name: &str) -> Result<&MechanismInfo, MechanismError> {
        self.entries
            .get(name)
            .ok_or_else(|| MechanismError::UnknownMechanism(name.to_string()))
    }

    pub fn has(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

/// Charge numbers of the ion species the catalogue knows about.
pub fn ion_charge(ion: &str) -> Option<i32> {
    match ion {
        "na" => Some(1),
        "k" => Some(1),
        "ca" => Some(2),
        "cl" => Some(-1),
        _ => None,
    }
}

/// The default catalogue: passive leak, Hodgkin-Huxley, single-exponential
/// synapse and the linear gap-junction mechanism.
pub fn builtin_catalogue() -> Catalogue {
    let mut catalogue = Catalogue::default();
    catalogue.insert(MechanismInfo {
        name: "pas".to_string(),
        kind: MechanismKind::Density,
        parameters: vec![("g".to_string(), 0.001), ("e".to_string(), -70.0)],
        state_vars: vec![],
        ions: vec![],
        linear: true,
    });
    // Reversal potentials for na and k come from the ion configuration, not
    // from parameters; only the leak reversal is mechanism-local.
    catalogue.insert(MechanismInfo {
        name: "hh".to_string(),
        kind: MechanismKind::Density,
        parameters: vec![
            ("gnabar".to_string(), 0.12),
            ("gkbar".to_string(), 0.036),
            ("gl".to_string(), 0.0003),
            ("el".to_string(), -54.3),
        ],
        state_vars: vec!["m".to_string(), "h".to_string(), "n".to_string()],
        ions: vec![
            IonDep {
                ion: "na".to_string(),
                read_reversal_potential: true,
                write_int_concentration: false,
            },
            IonDep {
                ion: "k".to_string(),
                read_reversal_potential: true,
                write_int_concentration: false,
            },
        ],
        linear: false,
    });
    catalogue.insert(MechanismInfo {
        name: "expsyn".to_string(),
        kind: MechanismKind::Point,
        parameters: vec![("tau".to_string(), 2.0), ("e".to_string(), 0.0)],
        state_vars: vec!["g".to_string()],
        ions: vec![],
        linear: true,
    });
    catalogue.insert(MechanismInfo {
        name: "gj".to_string(),
        kind: MechanismKind::Junction,
        parameters: vec![("g".to_string(), 1.0)],
        state_vars: vec![],
        ions: vec![],
        linear: true,
    });
    catalogue
}

/// Converts a density conductance in S/cm² over an area in µm² to µS.
pub fn density_to_us(g_per_cm2: f64, area_um2: f64) -> f64 {
    g_per_cm2 * area_um2 * 1e-2
}

/// Per-CV passive leak. `g_us` is the absolute conductance of the painted
/// membrane assigned to each CV.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PasState {
    pub node_index: Vec<usize>,
    pub g_us: Vec<f64>,
    pub e_mv: Vec<f64>,
}

impl PasState {
    pub fn accumulate_current(&self, voltage: &[f64], current: &mut [f64], conductance: &mut [f64]) {
        for (slot, &cv) in self.node_index.iter().enumerate() {
            let g = self.g_us[slot];
            current[cv] += g * (voltage[cv] - self.e_mv[slot]);
            conductance[cv] += g;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct HhState {
    pub node_index: Vec<usize>,
    pub gna_us: Vec<f64>,
    pub gk_us: Vec<f64>,
    pub gl_us: Vec<f64>,
    pub ena_mv: Vec<f64>,
    pub ek_mv: Vec<f64>,
    pub el_mv: Vec<f64>,
    pub m: Vec<f64>,
    pub h: Vec<f64>,
    pub n: Vec<f64>,
}

impl HhState {
    pub fn init(&mut self, voltage: &[f64]) {
        self.m.clear();
        self.h.clear();
        self.n.clear();
        for &cv in &self.node_index {
            let v = voltage[cv];
            self.m.push(gate_inf(m_alpha(v), m_beta(v)));
            self.h.push(gate_inf(h_alpha(v), h_beta(v)));
            self.n.push(gate_inf(n_alpha(v), n_beta(v)));
        }
    }

    pub fn accumulate_current(&self, voltage: &[f64], current: &mut [f64], conductance: &mut [f64]) {
        for (slot, &cv) in self.node_index.iter().enumerate() {
            let v = voltage[cv];
            let m = self.m[slot];
            let n = self.n[slot];
            let g_na = self.gna_us[slot] * m * m * m * self.h[slot];
            let g_k = self.gk_us[slot] * n * n * n * n;
            let g_l = self.gl_us[slot];
            current[cv] += g_na * (v - self.ena_mv[slot])
                + g_k * (v - self.ek_mv[slot])
                + g_l * (v - self.el_mv[slot]);
            conductance[cv] += g_na + g_k + g_l;
        }
    }

    pub fn advance_state(&mut self, voltage: &[f64], dt_ms: f64) {
        for (slot, &cv) in self.node_index.iter().enumerate() {
            let v = voltage[cv];
            self.m[slot] = gate_step(self.m[slot], m_alpha(v), m_beta(v), dt_ms);
            self.h[slot] = gate_step(self.h[slot], h_alpha(v), h_beta(v), dt_ms);
            self.n[slot] = gate_step(self.n[slot], n_alpha(v), n_beta(v), dt_ms);
        }
    }
}

// Classic squid-axon rates, voltages in mV, rates in 1/ms.
fn m_alpha(v: f64) -> f64 {
    exprelr(-(v + 40.0) / 10.0)
}

fn m_beta(v: f64) -> f64 {
    4.0 * (-(v + 65.0) / 18.0).exp()
}

fn h_alpha(v: f64) -> f64 {
    0.07 * (-(v + 65.0) / 20.0).exp()
}

fn h_beta(v: f64) -> f64 {
    1.0 / (1.0 + (-(v + 35.0) / 10.0).exp())
}

fn n_alpha(v: f64) -> f64 {
    0.1 * exprelr(-(v + 55.0) / 10.0)
}

fn n_beta(v: f64) -> f64 {
    0.125 * (-(v + 65.0) / 80.0).exp()
}

/// `x / (exp(x) - 1)` with the removable singularity at zero filled in.
fn exprelr(x: f64) -> f64 {
    if x.abs() < 1e-9 {
        1.0 - x / 2.0
    } else {
        x / x.exp_m1()
    }
}

fn gate_inf(alpha: f64, beta: f64) -> f64 {
    alpha / (alpha + beta)
}

// Exact exponential relaxation towards the voltage-clamped steady state.
fn gate_step(x: f64, alpha: f64, beta: f64, dt_ms: f64) -> f64 {
    let sum = alpha + beta;
    let x_inf = alpha / sum;
    x_inf + (x - x_inf) * (-dt_ms * sum).exp()
}

/// Single-exponential conductance synapse. One slot per placed instance
/// (or per coalesced set, with the multiplicity folded into delivery).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExpSynState {
    pub node_index: Vec<usize>,
    pub tau_ms: Vec<f64>,
    pub e_mv: Vec<f64>,
    pub multiplicity: Vec<u32>,
    pub g_us: Vec<f64>,
}

impl ExpSynState {
    pub fn init(&mut self) {
        self.g_us = vec![0.0; self.node_index.len()];
    }

    pub fn accumulate_current(&self, voltage: &[f64], current: &mut [f64], conductance: &mut [f64]) {
        for (slot, &cv) in self.node_index.iter().enumerate() {
            let g = self.g_us[slot];
            current[cv] += g * (voltage[cv] - self.e_mv[slot]);
            conductance[cv] += g;
        }
    }

    pub fn advance_state(&mut self, dt_ms: f64) {
        for (slot, g) in self.g_us.iter_mut().enumerate() {
            *g *= (-dt_ms / self.tau_ms[slot]).exp();
        }
    }

    pub fn net_receive(&mut self, slot: usize, weight: f32) {
        self.g_us[slot] += weight as f64 * self.multiplicity[slot] as f64;
    }
}

/// Linear gap-junction coupling; the peer voltage enters the current, only
/// the local conductance enters the diagonal.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct JunctionState {
    pub local_cv: Vec<usize>,
    pub peer_cv: Vec<usize>,
    pub g_us: Vec<f64>,
}

impl JunctionState {
    pub fn accumulate_current(&self, voltage: &[f64], current: &mut [f64], conductance: &mut [f64]) {
        for slot in 0..self.local_cv.len() {
            let local = self.local_cv[slot];
            let peer = self.peer_cv[slot];
            let g = self.g_us[slot];
            current[local] += g * (voltage[local] - voltage[peer]);
            conductance[local] += g;
        }
    }
}
