use dendron_context::ExecutionContext;
use dendron_core::{CellGid, CellKind};
use dendron_recipe::{
    CellDescription, CellGlobalLabel, CellLocalLabel, ConnectionDesc, EventGenerator, LifCell,
    Recipe, Schedule, SpikeSourceCell,
};
use engine::Simulation;

/// A ring of excitable cells: each fires as soon as it receives one event.
/// Cell 0 is kicked at t = 0 by a local generator, so cell k fires at
/// t = k x delay.
struct Ring {
    n: u32,
    weight: f32,
    delay: f64,
}

fn eager_lif() -> LifCell {
    LifCell {
        // Any incoming weight >= 0.5 mV fires the cell immediately.
        v_thresh_mv: -64.5,
        ..LifCell::default()
    }
}

impl Recipe for Ring {
    fn num_cells(&self) -> usize {
        self.n as usize
    }

    fn cell_kind(&self, _gid: CellGid) -> CellKind {
        CellKind::Lif
    }

    fn cell_description(&self, _gid: CellGid) -> CellDescription {
        CellDescription::Lif(eager_lif())
    }

    fn connections_on(&self, gid: CellGid) -> Vec<ConnectionDesc> {
        let prev = (gid.0 + self.n - 1) % self.n;
        vec![ConnectionDesc::new(
            CellGlobalLabel::new(prev, CellLocalLabel::univalent("src")),
            CellLocalLabel::univalent("tgt"),
            self.weight,
            self.delay,
        )]
    }

    fn event_generators(&self, gid: CellGid) -> Vec<EventGenerator> {
        if gid.0 == 0 {
            vec![EventGenerator {
                target: CellLocalLabel::univalent("tgt"),
                weight: 10.0,
                schedule: Schedule::explicit(vec![0.0]),
            }]
        } else {
            Vec::new()
        }
    }
}

fn spike_times(simulation: &mut Simulation, t_end: f64, dt: f64) -> Vec<(u32, i64)> {
    let collected = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = collected.clone();
    simulation.set_global_spike_callback(Box::new(move |spikes| {
        let mut out = sink.lock().unwrap();
        for spike in spikes {
            out.push((spike.source.gid.0, (spike.time * 1e6).round() as i64));
        }
    }));
    simulation.run(t_end, dt);
    let mut spikes = collected.lock().unwrap().clone();
    spikes.sort_unstable();
    spikes
}

#[test]
fn ring_of_twenty_propagates_one_cell_per_millisecond() {
    let recipe = Ring {
        n: 20,
        weight: 1.0,
        delay: 1.0,
    };
    let ctx = ExecutionContext::local(1);
    let mut simulation = Simulation::new(&recipe, ctx).unwrap();
    let spikes = spike_times(&mut simulation, 25.0, 0.025);

    // Cell k fires at t = k ms; the wave re-enters cell 0 at t = 20 and
    // walks on to cell 4 before the horizon.
    for k in 0..20u32 {
        assert!(
            spikes.contains(&(k, (k as i64) * 1_000_000)),
            "cell {k} must fire at {k} ms"
        );
    }
    for k in 0..5u32 {
        assert!(spikes.contains(&(k, (k as i64 + 20) * 1_000_000)));
    }
    assert_eq!(spikes.len(), 25);
    assert_eq!(simulation.num_spikes(), 25);
}

#[test]
fn reset_then_rerun_reproduces_the_spike_train() {
    let recipe = Ring {
        n: 10,
        weight: 1.0,
        delay: 1.0,
    };
    let ctx = ExecutionContext::local(1);
    let mut simulation = Simulation::new(&recipe, ctx).unwrap();
    let first = spike_times(&mut simulation, 15.0, 0.025);
    assert!(!first.is_empty());

    simulation.reset();
    let second = spike_times(&mut simulation, 15.0, 0.025);
    assert_eq!(first, second);
}

#[test]
fn spike_multiset_is_invariant_under_thread_count() {
    use engine::PartitionHint;

    let recipe = Ring {
        n: 16,
        weight: 1.0,
        delay: 2.0,
    };
    // Four groups of four cells, so the parallel advance has real work to
    // schedule and the ring crosses group boundaries.
    let hint = PartitionHint { group_size: 4 };
    let mut reference = None;
    for threads in [1usize, 2, 4] {
        let ctx = ExecutionContext::local(threads);
        let mut simulation = Simulation::new_with_hint(&recipe, ctx, hint).unwrap();
        assert_eq!(simulation.decomposition().groups.len(), 4);
        let spikes = spike_times(&mut simulation, 40.0, 0.025);
        match &reference {
            None => reference = Some(spikes),
            Some(expected) => assert_eq!(&spikes, expected, "threads = {threads}"),
        }
    }
}

/// Mixed-kind network: a spike source driving a lif cell; decomposition
/// must split them into one group per kind.
struct SourceAndLif;

impl Recipe for SourceAndLif {
    fn num_cells(&self) -> usize {
        2
    }

    fn cell_kind(&self, gid: CellGid) -> CellKind {
        if gid.0 == 0 {
            CellKind::SpikeSource
        } else {
            CellKind::Lif
        }
    }

    fn cell_description(&self, gid: CellGid) -> CellDescription {
        if gid.0 == 0 {
            CellDescription::SpikeSource(SpikeSourceCell::new(
                "src",
                Schedule::regular(0.0, 5.0, 20.0),
            ))
        } else {
            CellDescription::Lif(eager_lif())
        }
    }

    fn connections_on(&self, gid: CellGid) -> Vec<ConnectionDesc> {
        if gid.0 == 1 {
            vec![ConnectionDesc::new(
                CellGlobalLabel::new(0, CellLocalLabel::univalent("src")),
                CellLocalLabel::univalent("tgt"),
                1.0,
                1.0,
            )]
        } else {
            Vec::new()
        }
    }
}

#[test]
fn spike_source_drives_lif_across_kind_groups() {
    let ctx = ExecutionContext::local(1);
    let mut simulation = Simulation::new(&SourceAndLif, ctx).unwrap();
    assert_eq!(simulation.decomposition().groups.len(), 2);

    let spikes = spike_times(&mut simulation, 30.0, 0.025);
    // Source fires at 0, 5, 10, 15; the lif echoes 1 ms later each time.
    for t in [0i64, 5_000_000, 10_000_000, 15_000_000] {
        assert!(spikes.contains(&(0, t)));
    }
    for t in [1_000_000i64, 6_000_000, 11_000_000, 16_000_000] {
        assert!(spikes.contains(&(1, t)));
    }
    assert_eq!(spikes.len(), 8);
}
