use super::{check_input, working_copy};
use crate::reports;
use beamforge::config::SimulatorParams;
use beamforge::error::BfResult;
use beamforge::lattice::LatticeDocument;
use beamforge::scan::nested::{
    run_nested_scan, write_nested, Directives, NestedPlan, DEFAULT_SWEEP_COLUMN,
};
use beamforge::simulator::Evaluator;
use clap::Args;
use std::path::PathBuf;
use tracing::info;

/// Nested scan over the `!@var` variables substituted by `!@subs` directives.
#[derive(Args, Debug, Clone)]
pub struct SweepArgs {
    /// Lattice file (*.inp) carrying the directives
    pub input: PathBuf,

    /// Variable swept on the inner loop; its best value is kept per outer step
    pub inner: String,

    /// Variables stepped together on the outer loop
    #[arg(long, required = true, num_args = 1..)]
    pub outer: Vec<String>,

    /// Output table column minimized over all rows of each run
    #[arg(long, default_value = DEFAULT_SWEEP_COLUMN)]
    pub column: String,

    /// Where to write the CSV summary (default `<stem>_sweep.csv`)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    #[command(flatten)]
    pub sim: SimulatorParams,
}

pub fn run(args: SweepArgs) -> BfResult<()> {
    println!("\n🌀 === NESTED SCAN === 🌀");
    check_input(&args.input)?;

    let working = working_copy(&args.input)?;
    let mut doc = LatticeDocument::load(&working)?;
    let directives = Directives::parse(&doc)?;
    info!(
        "Found {} variables and {} substitutions",
        directives.variables().len(),
        directives.substitutions().len()
    );
    let invoker = args.sim.invoker();
    let evaluator = Evaluator::new(&invoker, &working, &args.sim.table);

    let plan = NestedPlan {
        outer: args.outer.clone(),
        inner: args.inner.clone(),
        column: args.column.clone(),
    };
    let steps = run_nested_scan(&evaluator, &mut doc, &directives, &plan)?;
    reports::print_sweep_report(&plan, &steps);

    let output = args.output.clone().unwrap_or_else(|| {
        let stem = args
            .input
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("sweep");
        args.input.with_file_name(format!("{}_sweep.csv", stem))
    });
    write_nested(&output, &plan, &steps)?;
    doc.save(&working)?;
    info!("💾 Sweep written to {:?}", output);
    Ok(())
}
