use std::collections::BTreeMap;

use dendron_core::CellLid;
use dendron_labels::LidRange;
use dendron_mech::{ion_charge, MechanismError, MechanismKind};
use dendron_morph::{CableCellDescription, Embedding, Place};
use dendron_recipe::CableGlobalProperties;

use crate::{Discretization, FvmError};

/// One density mechanism, instantiated on the union of CVs its paintings
/// touch. `area_um2` is the painted membrane area per CV; parameters are
/// area-weighted averages over the paint pieces.
#[derive(Debug, Clone, PartialEq)]
pub struct DensityConfig {
    pub name: String,
    pub cv: Vec<usize>,
    pub area_um2: Vec<f64>,
    pub params: BTreeMap<String, Vec<f64>>,
}

/// One point-mechanism type with one slot per (possibly coalesced) instance.
/// `targets` maps each placed lid to its slot; coalesced instances share a
/// slot and carry a multiplicity.
#[derive(Debug, Clone, PartialEq)]
pub struct SynapseConfig {
    pub name: String,
    pub cv: Vec<usize>,
    pub multiplicity: Vec<u32>,
    pub params: BTreeMap<String, Vec<f64>>,
    pub targets: Vec<(CellLid, usize)>,
}

/// A placed gap-junction site; peers are resolved against the connection
/// list when the owning group is built.
#[derive(Debug, Clone, PartialEq)]
pub struct JunctionSite {
    pub lid: CellLid,
    pub cv: usize,
    pub g_us: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StimulusConfig {
    pub cv: usize,
    pub amplitude_na: f64,
    pub from_ms: f64,
    pub duration_ms: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectorConfig {
    pub lid: CellLid,
    pub cv: usize,
    pub threshold_mv: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IonConfig {
    pub cv_support: Vec<usize>,
    pub init_reversal_potential_mv: f64,
    pub diffusive: bool,
}

/// Everything the cable integrator needs about one cell's mechanisms, in
/// cell-local CV indices.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CellMechData {
    pub densities: Vec<DensityConfig>,
    pub synapses: Vec<SynapseConfig>,
    pub junctions: Vec<JunctionSite>,
    pub stimuli: Vec<StimulusConfig>,
    pub detectors: Vec<DetectorConfig>,
    pub ions: BTreeMap<String, IonConfig>,
    /// Label ranges in placement order. Sources (detectors), targets
    /// (synapses) and junction sites live in separate lid spaces; junction
    /// labels never enter the global resolution map.
    pub source_labels: Vec<(String, LidRange)>,
    pub target_labels: Vec<(String, LidRange)>,
    pub junction_labels: Vec<(String, LidRange)>,
    pub num_sources: u32,
    pub num_targets: u32,
}

/// Builds the mechanism configuration for one cell against its
/// discretization.
///
/// Ions are handled in two passes: first every mechanism's ion dependencies
/// are scanned to compute per-ion CV support (and to reject two writers of
/// the same ion concentration on one CV), then ion configs are built from
/// that support. Diffusive ions are present on every CV.
pub fn build_mechanism_data(
    gprops: &CableGlobalProperties,
    cell: &CableCellDescription,
    d: &Discretization,
) -> Result<CellMechData, FvmError> {
    let catalogue = &gprops.catalogue;
    let embedding = Embedding::new(&cell.morphology);
    let mut out = CellMechData::default();

    // Painted density mechanisms, merged by name over the CVs they touch.
    struct DensityAcc {
        area: Vec<f64>,
        weighted: BTreeMap<String, Vec<f64>>,
    }
    let mut densities: BTreeMap<String, DensityAcc> = BTreeMap::new();
    // (ion, cv) -> name of the mechanism that writes its concentration.
    let mut concentration_writers: BTreeMap<(String, usize), String> = BTreeMap::new();
    let mut ion_support: BTreeMap<String, Vec<usize>> = BTreeMap::new();

    let n_cv = d.size();
    for painting in &cell.paintings {
        let desc = match &painting.paint {
            dendron_morph::Paint::Density(desc) => desc,
            _ => continue,
        };
        let info = catalogue.get(&desc.name)?;
        if info.kind != MechanismKind::Density {
            return Err(FvmError::CableCell(format!(
                "mechanism '{}' is not a density mechanism and cannot be painted",
                desc.name
            )));
        }
        for (key, _) in &desc.values {
            if info.parameter_default(key).is_none() {
                return Err(FvmError::Mechanism(MechanismError::UnknownParameter {
                    mechanism: desc.name.clone(),
                    parameter: key.clone(),
                }));
            }
        }

        let acc = densities.entry(desc.name.clone()).or_insert_with(|| {
            let weighted = info
                .parameters
                .iter()
                .map(|(key, _)| (key.clone(), vec![0.0; n_cv]))
                .collect();
            DensityAcc {
                area: vec![0.0; n_cv],
                weighted,
            }
        });

        for cv in 0..n_cv {
            let cv_cable = d.geometry.cv_cables[cv];
            let mut painted_area = 0.0;
            for region_cable in &painting.region.cables {
                if let Some(piece) = cv_cable.intersect(region_cable) {
                    painted_area += embedding.integrate_area(&cell.morphology, &piece);
                }
            }
            if painted_area <= 0.0 {
                continue;
            }
            acc.area[cv] += painted_area;
            for (key, default) in &info.parameters {
                let value = desc.value(key).unwrap_or(*default);
                acc.weighted.get_mut(key).expect("parameter key exists")[cv] +=
                    value * painted_area;
            }
            for dep in &info.ions {
                ion_support.entry(dep.ion.clone()).or_default().push(cv);
                if dep.write_int_concentration {
                    let slot = (dep.ion.clone(), cv);
                    if let Some(other) = concentration_writers.get(&slot) {
                        if other != &desc.name {
                            return Err(FvmError::CableCell(format!(
                                "mechanisms '{}' and '{}' both write the concentration of ion '{}' on an overlapping region",
                                other, desc.name, dep.ion
                            )));
                        }
                    } else {
                        concentration_writers.insert(slot, desc.name.clone());
                    }
                }
            }
        }
    }

    for (name, acc) in densities {
        let cv: Vec<usize> = (0..n_cv).filter(|&i| acc.area[i] > 0.0).collect();
        let mut params: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for (key, weighted) in acc.weighted {
            params.insert(
                key,
                cv.iter().map(|&i| weighted[i] / acc.area[i]).collect(),
            );
        }
        let area_um2 = cv.iter().map(|&i| acc.area[i]).collect();
        out.densities.push(DensityConfig {
            name,
            cv,
            area_um2,
            params,
        });
    }

    // Placements, in order; each lid space is assigned sequentially.
    let mut next_target = 0u32;
    let mut next_source = 0u32;
    let mut next_junction = 0u32;
    // Coalescing key: (name, cv, parameter overrides as bits).
    let mut slot_of: BTreeMap<(String, usize, Vec<(String, u64)>), (usize, usize)> =
        BTreeMap::new();
    let mut synapse_index: BTreeMap<String, usize> = BTreeMap::new();

    for placing in &cell.placings {
        match &placing.place {
            Place::Synapse(desc) => {
                let info = catalogue.get(&desc.name)?;
                if info.kind != MechanismKind::Point {
                    return Err(FvmError::CableCell(format!(
                        "mechanism '{}' is not a point mechanism and cannot be placed as a synapse",
                        desc.name
                    )));
                }
                let coalesce = gprops.coalesce_synapses && info.linear;
                let begin = next_target;
                for &loc in &placing.locset.locations {
                    let cv = d.cv_at(0, loc).ok_or_else(|| {
                        FvmError::CableCell(format!(
                            "no CV at location ({}, {}) on synapse '{}'",
                            loc.branch, loc.pos, placing.label
                        ))
                    })?;
                    if d.cv_area[cv] <= 0.0 {
                        return Err(FvmError::ZeroAreaCv { cv });
                    }
                    let lid = CellLid(next_target);
                    next_target += 1;

                    let mech = *synapse_index.entry(desc.name.clone()).or_insert_with(|| {
                        out.synapses.push(SynapseConfig {
                            name: desc.name.clone(),
                            cv: Vec::new(),
                            multiplicity: Vec::new(),
                            params: info
                                .parameters
                                .iter()
                                .map(|(key, _)| (key.clone(), Vec::new()))
                                .collect(),
                            targets: Vec::new(),
                        });
                        out.synapses.len() - 1
                    });

                    let mut override_key: Vec<(String, u64)> = desc
                        .values
                        .iter()
                        .map(|(key, value)| (key.clone(), value.to_bits()))
                        .collect();
                    override_key.sort();
                    let key = (desc.name.clone(), cv, override_key);
                    let existing = if coalesce {
                        slot_of.get(&key).copied()
                    } else {
                        None
                    };
                    let config = &mut out.synapses[mech];
                    match existing {
                        Some((mech_index, slot)) => {
                            debug_assert_eq!(mech_index, mech);
                            config.multiplicity[slot] += 1;
                            config.targets.push((lid, slot));
                        }
                        None => {
                            let slot = config.cv.len();
                            config.cv.push(cv);
                            config.multiplicity.push(1);
                            for (pkey, default) in &info.parameters {
                                let value = desc.value(pkey).unwrap_or(*default);
                                config.params.get_mut(pkey).expect("param key exists").push(value);
                            }
                            config.targets.push((lid, slot));
                            if coalesce {
                                slot_of.insert(key, (mech, slot));
                            }
                        }
                    }
                }
                out.target_labels
                    .push((placing.label.clone(), LidRange::new(begin, next_target)));
            }
            Place::Junction(desc) => {
                let info = catalogue.get(&desc.name)?;
                if info.kind != MechanismKind::Junction {
                    return Err(FvmError::CableCell(format!(
                        "mechanism '{}' is not a junction mechanism",
                        desc.name
                    )));
                }
                let begin = next_junction;
                for &loc in &placing.locset.locations {
                    let cv = d.cv_at(0, loc).ok_or_else(|| {
                        FvmError::CableCell(format!(
                            "no CV at location ({}, {}) on junction '{}'",
                            loc.branch, loc.pos, placing.label
                        ))
                    })?;
                    let g = desc
                        .value("g")
                        .or_else(|| info.parameter_default("g"))
                        .unwrap_or(1.0);
                    out.junctions.push(JunctionSite {
                        lid: CellLid(next_junction),
                        cv,
                        g_us: g,
                    });
                    next_junction += 1;
                }
                out.junction_labels
                    .push((placing.label.clone(), LidRange::new(begin, next_junction)));
            }
            Place::CurrentClamp {
                amplitude_na,
                from_ms,
                duration_ms,
            } => {
                for &loc in &placing.locset.locations {
                    let cv = d.cv_at(0, loc).ok_or_else(|| {
                        FvmError::CableCell(format!(
                            "no CV at location ({}, {}) on clamp '{}'",
                            loc.branch, loc.pos, placing.label
                        ))
                    })?;
                    out.stimuli.push(StimulusConfig {
                        cv,
                        amplitude_na: *amplitude_na,
                        from_ms: *from_ms,
                        duration_ms: *duration_ms,
                    });
                }
            }
            Place::ThresholdDetector { threshold_mv } => {
                let begin = next_source;
                for &loc in &placing.locset.locations {
                    let cv = d.cv_at(0, loc).ok_or_else(|| {
                        FvmError::CableCell(format!(
                            "no CV at location ({}, {}) on detector '{}'",
                            loc.branch, loc.pos, placing.label
                        ))
                    })?;
                    out.detectors.push(DetectorConfig {
                        lid: CellLid(next_source),
                        cv,
                        threshold_mv: *threshold_mv,
                    });
                    next_source += 1;
                }
                out.source_labels
                    .push((placing.label.clone(), LidRange::new(begin, next_source)));
            }
        }
    }

    // Second ion pass: configs from the scanned support. Diffusive ions are
    // instantiated everywhere.
    for (ion, mut support) in ion_support {
        let data = gprops
            .ion_data
            .get(&ion)
            .ok_or(MechanismError::UnknownIon { ion: ion.clone() })?;
        if let Some(expected) = ion_charge(&ion) {
            if data.charge != expected {
                return Err(FvmError::Mechanism(MechanismError::IonChargeMismatch {
                    ion: ion.clone(),
                    got: data.charge,
                    expected,
                }));
            }
        }
        let diffusive = d.face_diffusivity.contains_key(&ion);
        let cv_support = if diffusive {
            (0..n_cv).collect()
        } else {
            support.sort_unstable();
            support.dedup();
            support
        };
        out.ions.insert(
            ion,
            IonConfig {
                cv_support,
                init_reversal_potential_mv: data.init_reversal_potential_mv,
                diffusive,
            },
        );
    }

    out.num_sources = next_source;
    out.num_targets = next_target;
    Ok(out)
}
