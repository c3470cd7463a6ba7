use super::check_input;
use crate::reports;
use beamforge::config::{ErrorModel, SimulatorParams};
use beamforge::error::BfResult;
use beamforge::montecarlo::{BatchPlan, MonteCarlo};
use clap::Args;
use std::path::PathBuf;
use tracing::info;

/// Monte-Carlo error analysis over randomly perturbed lattices.
#[derive(Args, Debug, Clone)]
pub struct ErrorsArgs {
    /// Clean lattice file (*.inp)
    pub input: PathBuf,

    /// Perturbation parameters (YAML or JSON)
    pub params: PathBuf,

    /// Base seed; trial `i` draws from `seed + i`
    #[arg(short = 'S', long)]
    pub seed: Option<u64>,

    /// Override the trial count of the parameter file
    #[arg(short = 'n', long)]
    pub runs: Option<usize>,

    #[command(flatten)]
    pub sim: SimulatorParams,
}

pub fn run(args: ErrorsArgs) -> BfResult<()> {
    println!("\n🎲 === ERROR ANALYSIS === 🎲");
    check_input(&args.input)?;

    let mut model = ErrorModel::load_from_file(&args.params)?;
    if let Some(seed) = args.seed {
        model.seed = Some(seed);
    }
    if let Some(runs) = args.runs {
        model.runs = runs;
    }
    model.validate()?;
    info!("⚙️  Loaded parameters from {:?}", args.params);

    let invoker = args.sim.batch_invoker();
    let plan = BatchPlan {
        template: args.input.clone(),
        table: args.sim.table.clone(),
        jobs: args.sim.worker_count(),
        params_file: Some(args.params.clone()),
    };
    let report = MonteCarlo::new(&invoker, plan, model)?.run()?;
    reports::print_batch_report(&report);
    Ok(())
}
