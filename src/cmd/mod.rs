pub mod errors;
pub mod phase;
pub mod scan;
pub mod steer;
pub mod sweep;

use crate::reports;
use beamforge::config::{SearchParams, SimulatorParams};
use beamforge::error::{BeamError, BfResult};
use beamforge::lattice::{KnobKind, LatticeDocument, LatticeIndex};
use beamforge::optimizer::SectionDriver;
use beamforge::simulator::{Evaluator, Observable};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const INPUT_EXTENSION: &str = "inp";

/// Rejects anything but an existing `*.inp` file.
pub fn check_input(path: &Path) -> BfResult<()> {
    let ok = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(INPUT_EXTENSION));
    if !ok {
        return Err(BeamError::Config(format!(
            "Input file {:?} must have a .{} extension",
            path, INPUT_EXTENSION
        )));
    }
    if !path.is_file() {
        return Err(BeamError::Config(format!("Input file {:?} not found", path)));
    }
    Ok(())
}

/// Fresh `<stem>_temp.inp` next to `input`; the source file is never modified.
pub fn working_copy(input: &Path) -> BfResult<PathBuf> {
    let stem = input
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| BeamError::Config(format!("Invalid file name {:?}", input)))?;
    let copy = input.with_file_name(format!("{}_temp.{}", stem, INPUT_EXTENSION));
    fs::copy(input, &copy)?;
    info!("📂 Working copy: {:?}", copy);
    Ok(copy)
}

/// Everything a steering or phasing command needs.
pub struct TuningJob<'a> {
    pub input: &'a Path,
    pub step: f64,
    pub sect: usize,
    pub iterations: usize,
    /// Section marker prefix; `Some` switches to multi-section mode.
    pub sections: Option<&'a str>,
    pub knob: KnobKind,
    pub observable: Observable,
    pub search: &'a SearchParams,
    pub sim: &'a SimulatorParams,
}

pub fn run_tuning(job: TuningJob<'_>) -> BfResult<()> {
    check_input(job.input)?;
    if job.iterations == 0 {
        return Err(BeamError::Config("iterations must be at least 1".to_string()));
    }
    let strategy = job.search.strategy(job.observable, job.step, job.iterations)?;

    let working = working_copy(job.input)?;
    let doc = LatticeDocument::load(&working)?;
    let index = match job.sections {
        Some(marker) => LatticeIndex::build_with_marker(&doc, marker),
        None => LatticeIndex::build(&doc),
    };
    for (kind, count) in index.summary() {
        debug!("   {:<9} {}", kind, count);
    }

    let invoker = job.sim.invoker();
    let evaluator = Evaluator::new(&invoker, &working, &job.sim.table);
    let mut driver = SectionDriver::new(evaluator, doc, job.observable, strategy).with_index(index);

    if job.sections.is_some() {
        let report = driver.run_sections(job.knob, job.sect)?;
        reports::print_sequence_report(&report);
    } else {
        let report = driver.run_single(job.knob, job.sect)?;
        reports::print_tuning_report(std::slice::from_ref(&report));
    }

    driver.into_document().save(&working)?;
    info!("💾 Tuned lattice written to {:?}", working);
    Ok(())
}
