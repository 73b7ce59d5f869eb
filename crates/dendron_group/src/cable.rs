use std::collections::BTreeMap;

use dendron_core::{
    update_f64, update_u64, CellAddress, CellGid, CellKind, CellLid, Epoch, Spike, SpikeEvent,
    TimeMs,
};
use dendron_fvm::{
    build_mechanism_data, discretize, interpolate_voltage, CellMechData, Discretization,
    StimulusConfig, VoltageInterpolant,
};
use dendron_labels::{CellLabelRange, CellLabelsAndGids, LidRange};
use dendron_mech::{density_to_us, ExpSynState, HhState, JunctionState, PasState};
use dendron_morph::Morphology;
use dendron_recipe::{CellDescription, ProbeAddress, Recipe, Schedule};
use dendron_solver::{HinesMatrix, SolverBackend};

use crate::{
    expect_kind, CellGroup, EventLane, GroupError, ProbeId, Sample, SamplerFn, SamplerId,
};

#[derive(Debug, Clone, Copy)]
struct Detector {
    cell: usize,
    cv: usize,
    threshold_mv: f64,
    lid: CellLid,
}

struct SamplerAssoc {
    id: SamplerId,
    what: SampledQuantity,
    schedule: Schedule,
    callback: SamplerFn,
}

enum SampledQuantity {
    Voltage(VoltageInterpolant),
    CvCurrent(usize),
}

/// A resolved event generator: a schedule against one target lid of one
/// local cell.
struct ResolvedGenerator {
    cell: usize,
    target: CellLid,
    weight: f32,
    schedule: Schedule,
}

/// Cable cells integrated together over one packed Hines system.
///
/// Each sub-step delivers due events, accumulates mechanism and stimulus
/// currents, assembles and solves the matrix, updates gating state, runs
/// threshold detection against the voltage crossing within the step, and
/// samples whatever is due.
pub struct CableCellGroup {
    gids: Vec<CellGid>,
    d: Discretization,
    matrix: HinesMatrix,
    morphologies: Vec<Morphology>,
    probes: Vec<Vec<dendron_recipe::ProbeInfo>>,

    pas: PasState,
    hh: HhState,
    expsyn: ExpSynState,
    junctions: JunctionState,
    stimuli: Vec<StimulusConfig>,
    detectors: Vec<Detector>,
    generators: Vec<ResolvedGenerator>,
    /// Per cell: target lid -> expsyn slot.
    target_handles: Vec<BTreeMap<CellLid, usize>>,

    voltage: Vec<f64>,
    voltage_next: Vec<f64>,
    current: Vec<f64>,
    conductance: Vec<f64>,
    dt_cells: Vec<f64>,

    spikes: Vec<Spike>,
    samplers: Vec<SamplerAssoc>,
}

impl CableCellGroup {
    pub fn new(
        recipe: &dyn Recipe,
        gids: &[CellGid],
    ) -> Result<(Self, CellLabelsAndGids), GroupError> {
        let gprops = recipe
            .global_properties(CellKind::Cable)
            .cable();

        let mut packed = Discretization::empty();
        let mut mechdata: Vec<CellMechData> = Vec::with_capacity(gids.len());
        let mut morphologies = Vec::with_capacity(gids.len());
        let mut probes = Vec::with_capacity(gids.len());
        for &gid in gids {
            let description = recipe.cell_description(gid);
            expect_kind(gid, CellKind::Cable, &description)?;
            let CellDescription::Cable(cell) = description else {
                unreachable!("kind checked above");
            };
            let d = discretize(&cell, &gprops, gprops.cv_policy)?;
            let data = build_mechanism_data(&gprops, &cell, &d)?;
            packed.append(&d);
            mechdata.push(data);
            morphologies.push(cell.morphology.clone());
            probes.push(recipe.probes(gid));
        }

        let offsets: Vec<usize> = packed.cell_cv_divs.clone();
        let n_cv = packed.size();

        // Mechanism state over the packed CV space, merged across cells.
        let mut pas = PasState::default();
        let mut hh = HhState::default();
        let mut expsyn = ExpSynState::default();
        let mut target_handles: Vec<BTreeMap<CellLid, usize>> = vec![BTreeMap::new(); gids.len()];
        let mut stimuli = Vec::new();
        let mut detectors = Vec::new();
        // Junction site lookup for peer resolution: (gid, lid) -> packed cv
        // and the site's conductance scale.
        let mut junction_sites: BTreeMap<(CellGid, CellLid), (usize, f64)> = BTreeMap::new();
        let mut junction_label_ranges: Vec<BTreeMap<String, LidRange>> =
            vec![BTreeMap::new(); gids.len()];

        for (cell, data) in mechdata.iter().enumerate() {
            let offset = offsets[cell];
            for density in &data.densities {
                match density.name.as_str() {
                    "pas" => {
                        for (slot, &cv) in density.cv.iter().enumerate() {
                            pas.node_index.push(cv + offset);
                            pas.g_us
                                .push(density_to_us(density.params["g"][slot], density.area_um2[slot]));
                            pas.e_mv.push(density.params["e"][slot]);
                        }
                    }
                    "hh" => {
                        let ena = data
                            .ions
                            .get("na")
                            .map(|ion| ion.init_reversal_potential_mv)
                            .unwrap_or(50.0);
                        let ek = data
                            .ions
                            .get("k")
                            .map(|ion| ion.init_reversal_potential_mv)
                            .unwrap_or(-77.0);
                        for (slot, &cv) in density.cv.iter().enumerate() {
                            let area = density.area_um2[slot];
                            hh.node_index.push(cv + offset);
                            hh.gna_us
                                .push(density_to_us(density.params["gnabar"][slot], area));
                            hh.gk_us
                                .push(density_to_us(density.params["gkbar"][slot], area));
                            hh.gl_us.push(density_to_us(density.params["gl"][slot], area));
                            hh.ena_mv.push(ena);
                            hh.ek_mv.push(ek);
                            hh.el_mv.push(density.params["el"][slot]);
                        }
                    }
                    other => {
                        return Err(GroupError::Fvm(dendron_fvm::FvmError::CableCell(format!(
                            "density mechanism '{other}' has no multicore implementation"
                        ))));
                    }
                }
            }
            for synapse in &data.synapses {
                debug_assert_eq!(synapse.name, "expsyn", "catalogue has one point mechanism");
                let base = expsyn.node_index.len();
                for (slot, &cv) in synapse.cv.iter().enumerate() {
                    expsyn.node_index.push(cv + offset);
                    expsyn.tau_ms.push(synapse.params["tau"][slot]);
                    expsyn.e_mv.push(synapse.params["e"][slot]);
                    expsyn.multiplicity.push(synapse.multiplicity[slot]);
                }
                for &(lid, slot) in &synapse.targets {
                    target_handles[cell].insert(lid, base + slot);
                }
            }
            for site in &data.junctions {
                junction_sites.insert((gids[cell], site.lid), (site.cv + offset, site.g_us));
            }
            for (label, range) in &data.junction_labels {
                junction_label_ranges[cell].insert(label.clone(), *range);
            }
            for stimulus in &data.stimuli {
                stimuli.push(StimulusConfig {
                    cv: stimulus.cv + offset,
                    ..*stimulus
                });
            }
            for detector in &data.detectors {
                detectors.push(Detector {
                    cell,
                    cv: detector.cv + offset,
                    threshold_mv: detector.threshold_mv,
                    lid: detector.lid,
                });
            }
        }

        // Gap junctions: both endpoints are guaranteed to live in this
        // group, so peers resolve against the local site table.
        let gid_to_cell: BTreeMap<CellGid, usize> =
            gids.iter().enumerate().map(|(i, &g)| (g, i)).collect();
        let mut junctions = JunctionState::default();
        for (cell, &gid) in gids.iter().enumerate() {
            for desc in recipe.gap_junctions_on(gid) {
                let local_lid = resolve_junction_label(
                    gid,
                    &desc.local.tag,
                    desc.local.policy,
                    &junction_label_ranges[cell],
                )?;
                let peer_cell = gid_to_cell
                    .get(&desc.peer.gid)
                    .copied()
                    .ok_or(GroupError::GjPeerNotInGroup {
                        gid,
                        peer: desc.peer.gid,
                    })?;
                let peer_lid = resolve_junction_label(
                    desc.peer.gid,
                    &desc.peer.label.tag,
                    desc.peer.label.policy,
                    &junction_label_ranges[peer_cell],
                )?;
                let &(local_cv, local_g) = junction_sites
                    .get(&(gid, local_lid))
                    .expect("junction lid resolved from its own label ranges");
                let &(peer_cv, _) = junction_sites
                    .get(&(desc.peer.gid, peer_lid))
                    .expect("peer junction lid resolved from its own label ranges");
                junctions.local_cv.push(local_cv);
                junctions.peer_cv.push(peer_cv);
                junctions.g_us.push(desc.conductance_us * local_g);
            }
        }

        // Event generators, resolved against this cell's target labels with
        // a construction-time round-robin cursor.
        let mut generators = Vec::new();
        let mut cursors: BTreeMap<(usize, String), u32> = BTreeMap::new();
        for (cell, &gid) in gids.iter().enumerate() {
            for generator in recipe.event_generators(gid) {
                let target = resolve_target_label(
                    gid,
                    &generator.target.tag,
                    generator.target.policy,
                    &mechdata[cell].target_labels,
                    &mut cursors,
                    cell,
                )?;
                generators.push(ResolvedGenerator {
                    cell,
                    target,
                    weight: generator.weight,
                    schedule: generator.schedule,
                });
            }
        }

        // Labels for the global resolution map: sources and targets only.
        let mut labels = CellLabelRange::new();
        for data in &mechdata {
            labels.add_cell();
            for (label, range) in &data.source_labels {
                labels.add_label(label.clone(), *range);
            }
            for (label, range) in &data.target_labels {
                labels.add_label(label.clone(), *range);
            }
        }

        let parent_index: Vec<usize> = packed
            .geometry
            .cv_parent
            .iter()
            .enumerate()
            .map(|(i, p)| p.unwrap_or(i))
            .collect();
        let matrix = HinesMatrix::new(
            parent_index,
            packed.cell_cv_divs.clone(),
            packed.cv_capacitance.clone(),
            packed.face_conductance.clone(),
            packed.cv_area.clone(),
        );

        let voltage = packed.init_membrane_potential.clone();
        hh.init(&voltage);
        expsyn.init();
        log::debug!(
            "cable group: {} cells, {} CVs, {} synapse slots, {} detectors",
            gids.len(),
            n_cv,
            expsyn.node_index.len(),
            detectors.len()
        );

        let group = Self {
            gids: gids.to_vec(),
            matrix,
            morphologies,
            probes,
            pas,
            hh,
            expsyn,
            junctions,
            stimuli,
            detectors,
            generators,
            target_handles,
            voltage_next: vec![0.0; n_cv],
            current: vec![0.0; n_cv],
            conductance: vec![0.0; n_cv],
            dt_cells: vec![0.0; gids.len()],
            voltage,
            spikes: Vec::new(),
            samplers: Vec::new(),
            d: packed,
        };
        Ok((group, CellLabelsAndGids::new(labels, gids.to_vec())))
    }

    pub fn discretization(&self) -> &Discretization {
        &self.d
    }

    pub fn voltage(&self) -> &[f64] {
        &self.voltage
    }

    pub fn snapshot_digest(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"DENDRON:CABLE:SNAP");
        update_u64(&mut hasher, self.voltage.len() as u64);
        for &v in &self.voltage {
            update_f64(&mut hasher, v);
        }
        for gate in [&self.hh.m, &self.hh.h, &self.hh.n] {
            for &x in gate.iter() {
                update_f64(&mut hasher, x);
            }
        }
        for &g in &self.expsyn.g_us {
            update_f64(&mut hasher, g);
        }
        *hasher.finalize().as_bytes()
    }

    fn deliver(&mut self, events: &[SpikeEvent], cell: usize) {
        for event in events {
            if let Some(&slot) = self.target_handles[cell].get(&event.target) {
                self.expsyn.net_receive(slot, event.weight);
            } else {
                debug_assert!(false, "event targets a lid with no handle");
            }
        }
    }
}

fn resolve_junction_label(
    gid: CellGid,
    label: &str,
    policy: dendron_labels::LidSelectionPolicy,
    ranges: &BTreeMap<String, LidRange>,
) -> Result<CellLid, GroupError> {
    let range = ranges
        .get(label)
        .ok_or_else(|| dendron_labels::LabelError::LabelNotFound {
            gid,
            label: label.to_string(),
        })?;
    if policy != dendron_labels::LidSelectionPolicy::AssertUnivalent {
        return Err(GroupError::GjUnsupportedLidSelectionPolicy {
            gid,
            label: label.to_string(),
        });
    }
    if range.len() != 1 {
        return Err(GroupError::Label(
            dendron_labels::LabelError::NonUnivalentLabel {
                gid,
                label: label.to_string(),
                size: range.len(),
            },
        ));
    }
    Ok(CellLid(range.begin))
}

fn resolve_target_label(
    gid: CellGid,
    label: &str,
    policy: dendron_labels::LidSelectionPolicy,
    ranges: &[(String, LidRange)],
    cursors: &mut BTreeMap<(usize, String), u32>,
    cell: usize,
) -> Result<CellLid, GroupError> {
    let range = ranges
        .iter()
        .find(|(name, _)| name == label)
        .map(|(_, range)| *range)
        .ok_or_else(|| dendron_labels::LabelError::LabelNotFound {
            gid,
            label: label.to_string(),
        })?;
    match policy {
        dendron_labels::LidSelectionPolicy::AssertUnivalent => {
            if range.len() != 1 {
                return Err(GroupError::Label(
                    dendron_labels::LabelError::NonUnivalentLabel {
                        gid,
                        label: label.to_string(),
                        size: range.len(),
                    },
                ));
            }
            Ok(CellLid(range.begin))
        }
        dendron_labels::LidSelectionPolicy::RoundRobin => {
            if range.is_empty() {
                return Err(GroupError::Label(
                    dendron_labels::LabelError::NonUnivalentLabel {
                        gid,
                        label: label.to_string(),
                        size: 0,
                    },
                ));
            }
            let cursor = cursors
                .entry((cell, label.to_string()))
                .or_insert(range.begin);
            let lid = *cursor;
            *cursor += 1;
            if *cursor == range.end {
                *cursor = range.begin;
            }
            Ok(CellLid(lid))
        }
    }
}

impl CellGroup for CableCellGroup {
    fn kind(&self) -> CellKind {
        CellKind::Cable
    }

    fn gids(&self) -> &[CellGid] {
        &self.gids
    }

    fn advance(&mut self, epoch: Epoch, dt: TimeMs, lanes: &mut [EventLane]) {
        assert_eq!(lanes.len(), self.gids.len(), "one event lane per cell");
        assert!(dt > 0.0, "integration step must be positive");

        // Due events per cell, merged with generator events for the epoch.
        let mut pending: Vec<Vec<SpikeEvent>> = lanes
            .iter_mut()
            .map(|lane| lane.take_due(epoch.t1))
            .collect();
        for generator in &mut self.generators {
            for time in generator.schedule.events(epoch.t0, epoch.t1) {
                pending[generator.cell].push(SpikeEvent::new(generator.target, time, generator.weight));
            }
        }
        for events in pending.iter_mut() {
            events.sort_by(dendron_core::event_order);
        }
        let mut cursors = vec![0usize; pending.len()];

        let mut samples: Vec<(usize, Vec<Sample>)> =
            (0..self.samplers.len()).map(|i| (i, Vec::new())).collect();

        let n_steps = ((epoch.duration() / dt).ceil() as u64).max(1);
        for step in 0..n_steps {
            let t = epoch.t0 + step as f64 * dt;
            let t_next = (epoch.t0 + (step + 1) as f64 * dt).min(epoch.t1);
            let dt_step = t_next - t;
            if dt_step <= 0.0 {
                break;
            }

            // Deliver everything due before the end of this sub-step.
            for cell in 0..self.gids.len() {
                let begin = cursors[cell];
                while cursors[cell] < pending[cell].len()
                    && pending[cell][cursors[cell]].time < t_next
                {
                    cursors[cell] += 1;
                }
                let due = &pending[cell][begin..cursors[cell]];
                self.deliver(due, cell);
            }

            // Membrane and point currents.
            self.current.iter_mut().for_each(|i| *i = 0.0);
            self.conductance.iter_mut().for_each(|g| *g = 0.0);
            self.pas
                .accumulate_current(&self.voltage, &mut self.current, &mut self.conductance);
            self.hh
                .accumulate_current(&self.voltage, &mut self.current, &mut self.conductance);
            self.expsyn
                .accumulate_current(&self.voltage, &mut self.current, &mut self.conductance);
            self.junctions
                .accumulate_current(&self.voltage, &mut self.current, &mut self.conductance);
            for stimulus in &self.stimuli {
                let active = t < stimulus.from_ms + stimulus.duration_ms
                    && t_next > stimulus.from_ms;
                if active {
                    self.current[stimulus.cv] -= stimulus.amplitude_na;
                }
            }

            self.dt_cells.iter_mut().for_each(|d| *d = dt_step);
            self.matrix.assemble(
                &self.dt_cells,
                &self.voltage,
                &self.current,
                &self.conductance,
            );
            self.matrix.solve(&mut self.voltage_next);

            // Threshold detection against the crossing inside the step.
            for detector in &self.detectors {
                let before = self.voltage[detector.cv];
                let after = self.voltage_next[detector.cv];
                if before < detector.threshold_mv && after >= detector.threshold_mv {
                    let frac = (detector.threshold_mv - before) / (after - before);
                    let t_cross = t + frac * dt_step;
                    self.spikes.push(Spike::new(
                        CellAddress {
                            gid: self.gids[detector.cell],
                            lid: detector.lid,
                        },
                        t_cross,
                    ));
                }
            }

            self.hh.advance_state(&self.voltage_next, dt_step);
            self.expsyn.advance_state(dt_step);
            std::mem::swap(&mut self.voltage, &mut self.voltage_next);

            // Sampling at the post-step state.
            for (index, sampler) in self.samplers.iter_mut().enumerate() {
                for time in sampler.schedule.events(t, t_next) {
                    let value = match &sampler.what {
                        SampledQuantity::Voltage(interp) => {
                            interp.coef_a * self.voltage[interp.cv_a]
                                + interp.coef_b * self.voltage[interp.cv_b]
                        }
                        SampledQuantity::CvCurrent(cv) => self.current[*cv],
                    };
                    samples[index].1.push(Sample { time, value });
                }
            }
        }

        for (index, batch) in samples {
            if !batch.is_empty() {
                let sampler = &mut self.samplers[index];
                (sampler.callback)(sampler.id, &batch);
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
        self.voltage.copy_from_slice(&self.d.init_membrane_potential);
        self.hh.init(&self.voltage);
        self.expsyn.init();
        for generator in self.generators.iter_mut() {
            generator.schedule.reset();
        }
        for sampler in self.samplers.iter_mut() {
            sampler.schedule.reset();
        }
        self.spikes.clear();
    }

    fn add_sampler(
        &mut self,
        id: SamplerId,
        probe: ProbeId,
        schedule: Schedule,
        callback: SamplerFn,
    ) {
        let Some(cell) = self.gids.iter().position(|&g| g == probe.gid) else {
            return;
        };
        let Some(info) = self.probes[cell].iter().find(|p| p.tag == probe.tag) else {
            return;
        };
        let what = match &info.address {
            ProbeAddress::MembraneVoltage { location } => {
                match interpolate_voltage(&self.d, &self.morphologies[cell], cell, *location) {
                    Some(interp) => SampledQuantity::Voltage(interp),
                    None => return,
                }
            }
            ProbeAddress::TotalIonCurrent { location } => match self.d.cv_at(cell, *location) {
                Some(cv) => SampledQuantity::CvCurrent(cv),
                None => return,
            },
        };
        self.samplers.push(SamplerAssoc {
            id,
            what,
            schedule,
            callback,
        });
    }

    fn remove_sampler(&mut self, id: SamplerId) {
        self.samplers.retain(|s| s.id != id);
    }

    fn remove_all_samplers(&mut self) {
        self.samplers.clear();
    }
}
