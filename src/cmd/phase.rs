use super::{run_tuning, TuningJob};
use beamforge::config::{SearchParams, SimulatorParams};
use beamforge::error::BfResult;
use beamforge::lattice::KnobKind;
use beamforge::simulator::Observable;
use clap::Args;
use std::path::PathBuf;

/// Minimize the energy spread with the phase of a traveling-wave section.
#[derive(Args, Debug, Clone)]
pub struct PhaseArgs {
    /// Lattice file (*.inp)
    pub input: PathBuf,

    /// Phase offset of the seed points, in degrees
    #[arg(allow_negative_numbers = true)]
    pub step: f64,

    /// Traveling-wave section index
    pub sect: usize,

    /// Iteration cap
    pub iterations: usize,

    #[command(flatten)]
    pub search: SearchParams,

    #[command(flatten)]
    pub sim: SimulatorParams,
}

pub fn run(args: PhaseArgs) -> BfResult<()> {
    println!("\n📡 === RF PHASE SCAN === 📡");
    run_tuning(TuningJob {
        input: &args.input,
        step: args.step,
        sect: args.sect,
        iterations: args.iterations,
        sections: None,
        knob: KnobKind::RfPhase,
        observable: Observable::EnergySpread,
        search: &args.search,
        sim: &args.sim,
    })
}
