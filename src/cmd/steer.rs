use super::{run_tuning, TuningJob};
use beamforge::config::{SearchParams, SimulatorParams};
use beamforge::error::BfResult;
use beamforge::lattice::{KnobKind, DEFAULT_SECTION_MARKER};
use beamforge::simulator::Observable;
use clap::Args;
use std::path::PathBuf;

/// Zero the beam orbit with a steering magnet.
#[derive(Args, Debug, Clone)]
pub struct SteerArgs {
    /// Lattice file (*.inp)
    pub input: PathBuf,

    /// Seed offset applied to each axis
    #[arg(allow_negative_numbers = true)]
    pub step: f64,

    /// Steerer index (first section with --sections)
    pub sect: usize,

    /// Iteration cap per axis
    pub iterations: usize,

    /// Tune every marked section in turn, starting at `sect`
    #[arg(long, default_value_t = false)]
    pub sections: bool,

    /// Comment prefix that opens a section
    #[arg(long, default_value = DEFAULT_SECTION_MARKER)]
    pub marker: String,

    #[command(flatten)]
    pub search: SearchParams,

    #[command(flatten)]
    pub sim: SimulatorParams,
}

pub fn run(args: SteerArgs) -> BfResult<()> {
    println!("\n🧲 === ORBIT CORRECTION === 🧲");
    run_tuning(TuningJob {
        input: &args.input,
        step: args.step,
        sect: args.sect,
        iterations: args.iterations,
        sections: args.sections.then_some(args.marker.as_str()),
        knob: KnobKind::Steerer,
        observable: Observable::Orbit,
        search: &args.search,
        sim: &args.sim,
    })
}
