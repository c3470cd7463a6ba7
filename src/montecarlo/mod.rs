//! Monte-Carlo error analysis.
//!
//! A batch prepares one isolated workspace per trial (sequentially, so the
//! random draws are reproducible), runs the simulator in every workspace on a
//! bounded worker pool, and then aggregates the outputs in trial order.

pub mod aggregate;
pub mod sampler;
pub mod workspace;

pub use self::aggregate::{ColumnStats, ResultRow, AGGREGATE_HEADER};
pub use self::sampler::{PerturbationSample, TruncatedNormal};

use crate::config::ErrorModel;
use crate::error::{BeamError, BfResult};
use crate::lattice::{LatticeDocument, LatticeIndex};
use crate::simulator::table::locate_table;
use crate::simulator::Simulator;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{error, info, warn};

/// Suffix of the perturbed lattice written into each workspace.
pub const PERTURBED_SUFFIX: &str = "_erranaly.inp";

#[derive(Debug, Clone)]
pub struct BatchPlan {
    /// Clean lattice file. Its directory holds the auxiliary inputs and
    /// receives the workspaces and result files.
    pub template: PathBuf,
    pub table: String,
    pub jobs: usize,
    /// Parameter file copied next to the results for provenance.
    pub params_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct Trial {
    /// 1-based.
    pub index: usize,
    pub seed: u64,
    pub workspace: PathBuf,
    /// Perturbed lattice file name, relative to `workspace`.
    pub input: PathBuf,
    pub lines_changed: usize,
}

#[derive(Debug, Clone)]
pub struct BatchReport {
    pub run_id: String,
    pub base_seed: u64,
    pub trials: Vec<Trial>,
    /// Output table of each trial, `None` where the run failed.
    pub outputs: Vec<Option<PathBuf>>,
    pub rows: Vec<Option<ResultRow>>,
    pub results_path: PathBuf,
    pub orbit_path: Option<PathBuf>,
    pub params_copy: Option<PathBuf>,
    pub stats: Vec<ColumnStats>,
}

impl BatchReport {
    pub fn completed(&self) -> usize {
        self.rows.iter().flatten().count()
    }
}

pub struct MonteCarlo<'a> {
    simulator: &'a dyn Simulator,
    plan: BatchPlan,
    model: ErrorModel,
    dir: PathBuf,
    stem: String,
}

impl<'a> MonteCarlo<'a> {
    pub fn new(simulator: &'a dyn Simulator, plan: BatchPlan, model: ErrorModel) -> BfResult<Self> {
        let dir = match plan.template.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let stem = plan
            .template
            .file_stem()
            .and_then(|s| s.to_str())
            .map(str::to_string)
            .ok_or_else(|| {
                BeamError::Config(format!("Invalid lattice file name {:?}", plan.template))
            })?;
        Ok(Self {
            simulator,
            plan,
            model,
            dir,
            stem,
        })
    }

    pub fn run(&self) -> BfResult<BatchReport> {
        let run_id = format!("{:08x}", fastrand::u32(..));
        let base_seed = self.model.seed.unwrap_or_else(|| fastrand::u64(..));
        info!(
            "🎲 Batch {}: {} trials, seed {}, {} workers",
            run_id, self.model.runs, base_seed, self.plan.jobs
        );

        let stale = workspace::cleanup_workspaces(&self.dir, &self.stem)?;
        if stale > 0 {
            info!("🧹 Removed {} workspaces from a previous batch", stale);
        }

        let params_copy = self.copy_params(&run_id)?;
        let trials = self.prepare(base_seed)?;
        let outputs = self.execute(&trials)?;

        let rows = aggregate::collect_rows(&outputs);
        let results_path = self.dir.join(format!("error_analysis_dat_{}.txt", run_id));
        aggregate::write_results(&results_path, &rows)?;

        let orbit_file = self.dir.join(format!("orbit_error_{}.txt", run_id));
        let orbit_path = match aggregate::write_orbit_traces(&orbit_file, &outputs)? {
            0 => {
                warn!("No trial produced orbit columns; {:?} not written", orbit_file);
                None
            }
            _ => Some(orbit_file),
        };

        let stats = aggregate::column_stats(&rows);
        Ok(BatchReport {
            run_id,
            base_seed,
            trials,
            outputs,
            rows,
            results_path,
            orbit_path,
            params_copy,
            stats,
        })
    }

    /// Creates every workspace and writes its perturbed lattice.
    pub fn prepare(&self, base_seed: u64) -> BfResult<Vec<Trial>> {
        let template = LatticeDocument::load(&self.plan.template)?;
        let index = LatticeIndex::build(&template);
        let input = PathBuf::from(format!("{}{}", self.stem, PERTURBED_SUFFIX));

        (1..=self.model.runs)
            .map(|i| {
                let ws = workspace::workspace_dir(&self.dir, &self.stem, i);
                workspace::populate(&self.dir, &ws, workspace::AUX_PATTERNS)?;

                let seed = base_seed.wrapping_add(i as u64);
                let mut rng = StdRng::seed_from_u64(seed);
                let samples = sampler::sample(&index, &self.model, &mut rng);
                let mut doc = template.clone();
                let lines_changed = sampler::apply(&mut doc, &index, &samples)?;
                doc.save(ws.join(&input))?;

                Ok(Trial {
                    index: i,
                    seed,
                    workspace: ws,
                    input: input.clone(),
                    lines_changed,
                })
            })
            .collect()
    }

    /// Runs all trials on the worker pool. Results keep trial order.
    pub fn execute(&self, trials: &[Trial]) -> BfResult<Vec<Option<PathBuf>>> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.plan.jobs.max(1))
            .build()
            .map_err(|e| BeamError::Config(format!("Cannot start worker pool: {}", e)))?;

        let done = AtomicUsize::new(0);
        let total = trials.len();
        Ok(pool.install(|| {
            trials
                .par_iter()
                .map(|t| {
                    let out = self.run_trial(t);
                    let n = done.fetch_add(1, Ordering::Relaxed) + 1;
                    info!("   Trial {} finished ({}/{})", t.index, n, total);
                    out
                })
                .collect()
        }))
    }

    fn run_trial(&self, trial: &Trial) -> Option<PathBuf> {
        let result = self.simulator.run(&trial.workspace, &trial.input);
        workspace::remove_scratch(&trial.workspace, workspace::SCRATCH_PATTERNS);
        if let Err(e) = result {
            error!("Trial {} failed: {}", trial.index, e);
            return None;
        }
        let table = locate_table(&trial.workspace, &self.plan.table);
        if table.is_none() {
            warn!(
                "Trial {}: no output table in {:?}",
                trial.index, trial.workspace
            );
        }
        table
    }

    fn copy_params(&self, run_id: &str) -> BfResult<Option<PathBuf>> {
        let Some(src) = &self.plan.params_file else {
            return Ok(None);
        };
        let ext = src
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("yaml");
        let dest = self.dir.join(format!("error_{}.{}", run_id, ext));
        fs::copy(src, &dest)?;
        Ok(Some(dest))
    }
}
