use dendron_core::{CellGid, CellKind, Epoch};
use dendron_group::{CellGroup, CableCellGroup, EventLane};
use dendron_morph::{
    CableCellDescription, Locset, MechanismDesc, Mlocation, Morphology, Paint, Place, Region,
};
use dendron_recipe::{
    CellDescription, CellLocalLabel, EventGenerator, Recipe, Schedule,
};

const SOMA_AREA_UM2: f64 = 100.0;

fn soma_morphology() -> Morphology {
    // Lateral area of 100 µm² so the default 1 µF/cm² gives 1 pF.
    Morphology::soma(SOMA_AREA_UM2 / (2.0 * std::f64::consts::PI), 1.0)
}

struct CableRecipe {
    cells: Vec<CableCellDescription>,
    generators: Vec<Vec<EventGenerator>>,
}

impl CableRecipe {
    fn new(cells: Vec<CableCellDescription>) -> Self {
        let generators = cells.iter().map(|_| Vec::new()).collect();
        Self { cells, generators }
    }
}

impl Recipe for CableRecipe {
    fn num_cells(&self) -> usize {
        self.cells.len()
    }

    fn cell_kind(&self, _gid: CellGid) -> CellKind {
        CellKind::Cable
    }

    fn cell_description(&self, gid: CellGid) -> CellDescription {
        CellDescription::Cable(Box::new(self.cells[gid.0 as usize].clone()))
    }

    fn event_generators(&self, gid: CellGid) -> Vec<EventGenerator> {
        self.generators[gid.0 as usize].clone()
    }
}

fn advance_group(group: &mut CableCellGroup, t_end: f64, dt: f64) {
    let mut lanes: Vec<EventLane> = group.gids().iter().map(|_| EventLane::new()).collect();
    group.advance(Epoch::new(0, 0.0, t_end), dt, &mut lanes);
}

#[test]
fn passive_soma_holds_resting_potential() {
    // One CV, 1 pF, no conductances, no input: the voltage must not move.
    let recipe = CableRecipe::new(vec![CableCellDescription::new(soma_morphology())]);
    let (mut group, _) = CableCellGroup::new(&recipe, &[CellGid(0)]).unwrap();
    assert_eq!(group.discretization().size(), 1);
    assert!((group.discretization().cv_capacitance[0] - 1.0).abs() < 1e-9);

    advance_group(&mut group, 10.0, 0.025);
    assert!((group.voltage()[0] - (-65.0)).abs() < 1e-9);
    assert!(group.spikes().is_empty());
}

#[test]
fn leaky_soma_stays_at_leak_reversal() {
    let cell = CableCellDescription::new(soma_morphology()).paint(
        Region::whole_branch(0),
        Paint::Density(MechanismDesc::new("pas").set("e", -65.0)),
    );
    let recipe = CableRecipe::new(vec![cell]);
    let (mut group, _) = CableCellGroup::new(&recipe, &[CellGid(0)]).unwrap();
    advance_group(&mut group, 10.0, 0.025);
    assert!((group.voltage()[0] - (-65.0)).abs() < 1e-9);
}

#[test]
fn clamped_hh_soma_fires_through_its_detector() {
    let cell = CableCellDescription::new(soma_morphology())
        .paint(
            Region::whole_branch(0),
            Paint::Density(MechanismDesc::new("hh")),
        )
        .place(
            "detector",
            Locset::single(Mlocation::new(0, 0.5)),
            Place::ThresholdDetector { threshold_mv: -10.0 },
        )
        .place(
            "clamp",
            Locset::single(Mlocation::new(0, 0.5)),
            Place::CurrentClamp {
                amplitude_na: 0.5,
                from_ms: 1.0,
                duration_ms: 3.0,
            },
        );
    let recipe = CableRecipe::new(vec![cell]);
    let (mut group, labels) = CableCellGroup::new(&recipe, &[CellGid(0)]).unwrap();
    assert_eq!(labels.gids, vec![CellGid(0)]);

    advance_group(&mut group, 20.0, 0.025);
    assert!(
        !group.spikes().is_empty(),
        "0.5 nA into 1 pF of hh membrane must fire"
    );
    let spike = group.spikes()[0];
    assert_eq!(spike.source.gid, CellGid(0));
    assert_eq!(spike.source.lid.0, 0);
    assert!(spike.time > 1.0 && spike.time < 10.0);
    // The membrane must repolarise after the clamp ends.
    assert!(group.voltage()[0] < 0.0);
}

#[test]
fn synaptic_event_depolarises_target_cv() {
    let cell = CableCellDescription::new(soma_morphology())
        .paint(
            Region::whole_branch(0),
            Paint::Density(MechanismDesc::new("pas")),
        )
        .place(
            "syn",
            Locset::single(Mlocation::new(0, 0.5)),
            Place::Synapse(MechanismDesc::new("expsyn")),
        );
    let mut recipe = CableRecipe::new(vec![cell]);
    recipe.generators[0].push(EventGenerator {
        target: CellLocalLabel::univalent("syn"),
        weight: 0.01,
        schedule: Schedule::explicit(vec![1.0]),
    });
    let (mut group, _) = CableCellGroup::new(&recipe, &[CellGid(0)]).unwrap();
    advance_group(&mut group, 5.0, 0.025);
    assert!(
        group.voltage()[0] > -65.0 + 0.1,
        "synaptic conductance towards 0 mV must depolarise"
    );
}

#[test]
fn reset_reproduces_the_same_trajectory() {
    let cell = CableCellDescription::new(soma_morphology())
        .paint(
            Region::whole_branch(0),
            Paint::Density(MechanismDesc::new("hh")),
        )
        .place(
            "det",
            Locset::single(Mlocation::new(0, 0.5)),
            Place::ThresholdDetector { threshold_mv: 0.0 },
        )
        .place(
            "clamp",
            Locset::single(Mlocation::new(0, 0.5)),
            Place::CurrentClamp {
                amplitude_na: 0.5,
                from_ms: 0.5,
                duration_ms: 2.0,
            },
        );
    let recipe = CableRecipe::new(vec![cell]);
    let (mut group, _) = CableCellGroup::new(&recipe, &[CellGid(0)]).unwrap();

    advance_group(&mut group, 15.0, 0.025);
    let first_spikes: Vec<(u32, i64)> = group
        .spikes()
        .iter()
        .map(|s| (s.source.gid.0, (s.time * 1e9) as i64))
        .collect();
    let first_digest = group.snapshot_digest();

    group.reset();
    group.clear_spikes();
    advance_group(&mut group, 15.0, 0.025);
    let second_spikes: Vec<(u32, i64)> = group
        .spikes()
        .iter()
        .map(|s| (s.source.gid.0, (s.time * 1e9) as i64))
        .collect();

    assert_eq!(first_spikes, second_spikes);
    assert_eq!(first_digest, group.snapshot_digest());
}

#[test]
fn gap_junction_pair_equilibrates() {
    use dendron_recipe::{CellGlobalLabel, GapJunctionDesc};

    fn gj_cell(init_mv: f64) -> CableCellDescription {
        let mut cell = CableCellDescription::new(soma_morphology()).place(
            "gj",
            Locset::single(Mlocation::new(0, 0.5)),
            Place::Junction(MechanismDesc::new("gj")),
        );
        cell.defaults.init_membrane_potential = Some(init_mv);
        cell
    }

    struct GjRecipe {
        cells: Vec<CableCellDescription>,
    }

    impl Recipe for GjRecipe {
        fn num_cells(&self) -> usize {
            2
        }
        fn cell_kind(&self, _gid: CellGid) -> CellKind {
            CellKind::Cable
        }
        fn cell_description(&self, gid: CellGid) -> CellDescription {
            CellDescription::Cable(Box::new(self.cells[gid.0 as usize].clone()))
        }
        fn gap_junctions_on(&self, gid: CellGid) -> Vec<dendron_recipe::GapJunctionDesc> {
            let peer = 1 - gid.0;
            vec![GapJunctionDesc {
                peer: CellGlobalLabel::new(peer, CellLocalLabel::univalent("gj")),
                local: CellLocalLabel::univalent("gj"),
                conductance_us: 1.0,
            }]
        }
    }

    let recipe = GjRecipe {
        cells: vec![gj_cell(-55.0), gj_cell(-65.0)],
    };
    let (mut group, _) = CableCellGroup::new(&recipe, &[CellGid(0), CellGid(1)]).unwrap();
    assert!((group.voltage()[0] - (-55.0)).abs() < 1e-12);
    assert!((group.voltage()[1] - (-65.0)).abs() < 1e-12);

    advance_group(&mut group, 10.0, 0.0125);
    let v0 = group.voltage()[0];
    let v1 = group.voltage()[1];
    // Pure capacitive pair coupled by 1 µS: both sides settle at the mean.
    assert!((v0 - v1).abs() < 1e-6, "coupled somata must equilibrate");
    assert!((0.5 * (v0 + v1) - (-60.0)).abs() < 1e-6, "charge is conserved");
}
