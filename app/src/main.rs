#![forbid(unsafe_code)]

use std::env;

use dendron_context::ExecutionContext;
use dendron_core::{CellGid, CellKind, Spike};
use dendron_recipe::{
    CellDescription, CellGlobalLabel, CellLocalLabel, ConnectionDesc, EventGenerator, LifCell,
    Recipe, Schedule,
};
use engine::{PartitionHint, Simulation};
use log::info;
use log4rs::append::console::ConsoleAppender;
use log4rs::config::{Appender, Config, Root};
use profiles::RunProfile;

fn main() {
    init_logging();
    let mut args = env::args();
    let _binary = args.next();
    match args.next().as_deref() {
        Some("ring") => run_ring(args.next()),
        _ => {
            eprintln!("usage: dendron ring [profile.yaml]");
            std::process::exit(1);
        }
    }
}

fn init_logging() {
    let stdout = ConsoleAppender::builder().build();
    let config = Config::builder()
        .appender(Appender::builder().build("stdout", Box::new(stdout)))
        .build(Root::builder().appender("stdout").build(log::LevelFilter::Info))
        .expect("static logging config is valid");
    log4rs::init_config(config).expect("logging initialised once");
}

fn run_ring(profile_path: Option<String>) {
    let profile = match profile_path {
        Some(path) => match RunProfile::load_from_file(&path) {
            Ok(profile) => profile,
            Err(err) => {
                eprintln!("failed to load profile: {err}");
                std::process::exit(1);
            }
        },
        None => RunProfile::fallback(),
    };
    info!(
        "profile '{}': dt = {} ms, t_end = {} ms, {} threads, groups of {}",
        profile.name, profile.dt_ms, profile.t_end_ms, profile.threads, profile.group_size_hint
    );

    let recipe = RingRecipe { n: 100 };
    let ctx = ExecutionContext::local(profile.threads);
    let hint = PartitionHint {
        group_size: profile.group_size_hint,
    };
    let mut simulation = match Simulation::new_with_hint(&recipe, ctx, hint) {
        Ok(simulation) => simulation,
        Err(err) => {
            eprintln!("failed to build simulation: {err}");
            std::process::exit(1);
        }
    };

    if profile.log_spikes {
        simulation.set_global_spike_callback(Box::new(|spikes: &[Spike]| {
            for spike in spikes {
                info!("spike gid {} at {:.3} ms", spike.source.gid, spike.time);
            }
        }));
    }

    let reached = simulation.run(profile.t_end_ms, profile.dt_ms);
    println!(
        "ring of {} cells: {} spikes in {} ms simulated",
        recipe.n,
        simulation.num_spikes(),
        reached
    );
}

/// A ring of eagerly firing lif cells, kicked once at t = 0.
struct RingRecipe {
    n: u32,
}

impl Recipe for RingRecipe {
    fn num_cells(&self) -> usize {
        self.n as usize
    }

    fn cell_kind(&self, _gid: CellGid) -> CellKind {
        CellKind::Lif
    }

    fn cell_description(&self, _gid: CellGid) -> CellDescription {
        CellDescription::Lif(LifCell {
            v_thresh_mv: -64.5,
            ..LifCell::default()
        })
    }

    fn connections_on(&self, gid: CellGid) -> Vec<ConnectionDesc> {
        let prev = (gid.0 + self.n - 1) % self.n;
        vec![ConnectionDesc::new(
            CellGlobalLabel::new(prev, CellLocalLabel::univalent("src")),
            CellLocalLabel::univalent("tgt"),
            1.0,
            1.0,
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
