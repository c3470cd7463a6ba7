use super::{check_input, working_copy};
use crate::reports;
use beamforge::config::SimulatorParams;
use beamforge::error::{BeamError, BfResult};
use beamforge::lattice::{ElementKind, LatticeDocument, LatticeIndex};
use beamforge::scan::{run_scan, write_scan, ScanPlan};
use beamforge::simulator::Evaluator;
use clap::Args;
use std::path::PathBuf;
use tracing::info;

/// Sweep one field of one record and record an output row per value.
#[derive(Args, Debug, Clone)]
pub struct ScanArgs {
    /// Lattice file (*.inp)
    pub input: PathBuf,

    /// Element keyword (steerer, quad, solenoid, cell, trwave, bend, drift)
    pub kind: ElementKind,

    /// Which record of that kind (0-based)
    pub index: usize,

    /// Field to sweep (0-based, keyword is field 0)
    pub field: usize,

    #[arg(allow_negative_numbers = true)]
    pub start: f64,

    #[arg(allow_negative_numbers = true)]
    pub step: f64,

    pub steps: usize,

    /// Output row to record, counted from the end of the table
    #[arg(long, default_value_t = 2)]
    pub row: usize,

    /// Where to write `value<TAB>row` lines (default `<stem>_scan.txt`)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    #[command(flatten)]
    pub sim: SimulatorParams,
}

pub fn run(args: ScanArgs) -> BfResult<()> {
    println!("\n📈 === PARAMETER SCAN === 📈");
    check_input(&args.input)?;
    if args.field == 0 {
        return Err(BeamError::Config("field 0 is the element keyword".to_string()));
    }

    let working = working_copy(&args.input)?;
    let mut doc = LatticeDocument::load(&working)?;
    let index = LatticeIndex::build(&doc);
    let invoker = args.sim.invoker();
    let evaluator = Evaluator::new(&invoker, &working, &args.sim.table);

    let plan = ScanPlan {
        kind: args.kind,
        index: args.index,
        field: args.field,
        start: args.start,
        step: args.step,
        steps: args.steps,
        row_from_end: args.row,
    };
    let points = run_scan(&evaluator, &mut doc, &index, &plan)?;
    reports::print_scan_report(&points);

    let output = args.output.clone().unwrap_or_else(|| {
        let stem = args
            .input
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("scan");
        args.input.with_file_name(format!("{}_scan.txt", stem))
    });
    write_scan(&output, &points)?;
    info!("💾 Scan written to {:?}", output);
    Ok(())
}
