use crate::error::{BeamError, BfResult};
use crate::montecarlo::sampler::TruncatedNormal;
use crate::optimizer::{FinderOptions, FitMode, GradientOptions, SearchStrategy};
use crate::simulator::{Observable, ParmelaInvoker, DEFAULT_PROGRAM, DEFAULT_TABLE};
use clap::{Args, ValueEnum};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Per-run limit applied to batch runs when `--timeout-secs` is not given.
pub const BATCH_TIMEOUT_SECS: u64 = 3600;

/// Orbit values beyond this (in magnet units) are never trusted from a parabola.
pub const STEERER_VERTEX_GUARD: f64 = 20.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Parabola,
    Linear,
    Gradient,
}

#[derive(Args, Debug, Clone, Serialize, Deserialize)]
pub struct SearchParams {
    #[arg(long, value_enum, default_value_t = Method::Parabola)]
    pub method: Method,

    /// Convergence threshold between the two best metrics (observable default if unset).
    #[arg(long)]
    pub tolerance: Option<f64>,

    /// Largest trusted parabola vertex (observable default if unset).
    #[arg(long)]
    pub vertex_guard: Option<f64>,

    /// Offset seeds by `start * step` instead of `step`.
    #[arg(long, default_value_t = false)]
    pub relative_step: bool,

    #[arg(long, default_value_t = 1.0)]
    pub learning_rate: f64,

    #[arg(long, default_value_t = 0.9)]
    pub momentum: f64,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            method: Method::Parabola,
            tolerance: None,
            vertex_guard: None,
            relative_step: false,
            learning_rate: 1.0,
            momentum: 0.9,
        }
    }
}

impl SearchParams {
    /// Gradient descent lowers the metric itself, so it only applies to
    /// observables whose optimum is their minimum (energy spread). The signed
    /// orbit has its optimum at zero and is rejected.
    pub fn strategy(
        &self,
        observable: Observable,
        step: f64,
        iterations: usize,
    ) -> BfResult<SearchStrategy> {
        let tolerance = self.tolerance.unwrap_or_else(|| observable.tolerance());
        let mode = match self.method {
            Method::Gradient if observable == Observable::Orbit => {
                return Err(BeamError::Config(
                    "gradient method cannot zero a signed orbit; use parabola or linear"
                        .to_string(),
                ))
            }
            Method::Gradient => {
                return Ok(SearchStrategy::Gradient(GradientOptions {
                    step,
                    iterations,
                    learning_rate: self.learning_rate,
                    momentum: self.momentum,
                    tolerance,
                    ..GradientOptions::default()
                }))
            }
            Method::Parabola => FitMode::Parabola,
            Method::Linear => FitMode::Linear,
        };
        let vertex_guard = self.vertex_guard.or(match observable {
            Observable::Orbit => Some(STEERER_VERTEX_GUARD),
            Observable::EnergySpread => None,
        });
        Ok(SearchStrategy::Fit(FinderOptions {
            mode,
            step,
            relative_step: self.relative_step,
            iterations,
            tolerance,
            vertex_guard,
        }))
    }
}

#[derive(Args, Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorParams {
    #[arg(long, default_value = DEFAULT_PROGRAM)]
    pub simulator: String,

    /// Output table read after every run.
    #[arg(long, default_value = DEFAULT_TABLE)]
    pub table: String,

    /// Kill a simulator run after this many seconds; 0 waits forever.
    /// Batch runs default to 3600.
    #[arg(long)]
    pub timeout_secs: Option<u64>,

    /// Worker threads for batch runs (defaults to available parallelism).
    #[arg(short = 'j', long)]
    pub jobs: Option<usize>,

    /// Let the simulator write to the terminal.
    #[arg(long, default_value_t = false)]
    pub show_output: bool,
}

impl Default for SimulatorParams {
    fn default() -> Self {
        Self {
            simulator: DEFAULT_PROGRAM.to_string(),
            table: DEFAULT_TABLE.to_string(),
            timeout_secs: None,
            jobs: None,
            show_output: false,
        }
    }
}

impl SimulatorParams {
    /// Invoker for interactive tuning; unlimited unless `--timeout-secs` is set.
    pub fn invoker(&self) -> ParmelaInvoker {
        self.build_invoker(self.timeout_secs)
    }

    /// Invoker for Monte-Carlo batches. A hung trial is killed after
    /// [`BATCH_TIMEOUT_SECS`] unless the user picks another limit.
    pub fn batch_invoker(&self) -> ParmelaInvoker {
        self.build_invoker(Some(self.timeout_secs.unwrap_or(BATCH_TIMEOUT_SECS)))
    }

    fn build_invoker(&self, timeout_secs: Option<u64>) -> ParmelaInvoker {
        // Runs start in the working copy's directory, not ours.
        let program = PathBuf::from(&self.simulator);
        let program = if program.components().count() > 1 {
            fs::canonicalize(&program).unwrap_or(program)
        } else {
            program
        };
        let timeout = timeout_secs.filter(|&s| s > 0).map(Duration::from_secs);
        ParmelaInvoker::new(program)
            .with_timeout(timeout)
            .with_output(self.show_output)
    }

    pub fn worker_count(&self) -> usize {
        self.jobs.filter(|&n| n > 0).unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        })
    }
}

/// Perturbation parameters of a Monte-Carlo batch.
///
/// Keys are flat (`ps_amp_mean`, `ps_amp_sig`, `ps_amp_bound`, ...). Any
/// missing distribution key is zero, which disables that error source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ErrorModel {
    pub runs: usize,
    pub seed: Option<u64>,

    // Power supplies: quad, solenoid and steerer amplitudes.
    pub ps_amp_mean: f64,
    pub ps_amp_sig: f64,
    pub ps_amp_bound: f64,

    pub cell_rf_phase_mean: f64,
    pub cell_rf_phase_sig: f64,
    pub cell_rf_phase_bound: f64,
    pub cell_rf_amp_mean: f64,
    pub cell_rf_amp_sig: f64,
    pub cell_rf_amp_bound: f64,

    pub trwave_rf_phase_mean: f64,
    pub trwave_rf_phase_sig: f64,
    pub trwave_rf_phase_bound: f64,
    pub trwave_rf_amp_mean: f64,
    pub trwave_rf_amp_sig: f64,
    pub trwave_rf_amp_bound: f64,

    pub bend_amp_mean: f64,
    pub bend_amp_sig: f64,
    pub bend_amp_bound: f64,
}

impl Default for ErrorModel {
    fn default() -> Self {
        Self {
            runs: 1,
            seed: None,
            ps_amp_mean: 0.0,
            ps_amp_sig: 0.0,
            ps_amp_bound: 0.0,
            cell_rf_phase_mean: 0.0,
            cell_rf_phase_sig: 0.0,
            cell_rf_phase_bound: 0.0,
            cell_rf_amp_mean: 0.0,
            cell_rf_amp_sig: 0.0,
            cell_rf_amp_bound: 0.0,
            trwave_rf_phase_mean: 0.0,
            trwave_rf_phase_sig: 0.0,
            trwave_rf_phase_bound: 0.0,
            trwave_rf_amp_mean: 0.0,
            trwave_rf_amp_sig: 0.0,
            trwave_rf_amp_bound: 0.0,
            bend_amp_mean: 0.0,
            bend_amp_sig: 0.0,
            bend_amp_bound: 0.0,
        }
    }
}

impl ErrorModel {
    /// Reads a YAML (`.yaml`/`.yml`) or JSON (`.json`) parameter file and validates it.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> BfResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            BeamError::Config(format!("Failed to read parameter file {:?}: {}", path, e))
        })?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        let model: Self = match ext.as_str() {
            "yaml" | "yml" => serde_yaml::from_str(&content)?,
            "json" => serde_json::from_str(&content)?,
            other => {
                return Err(BeamError::Config(format!(
                    "Unsupported parameter file extension '{}' (expected yaml, yml or json)",
                    other
                )))
            }
        };
        model.validate()?;
        Ok(model)
    }

    pub fn validate(&self) -> BfResult<()> {
        if self.runs == 0 {
            return Err(BeamError::Config("'runs' must be at least 1".to_string()));
        }
        for (name, d) in self.distributions() {
            if !(d.mean.is_finite() && d.sigma.is_finite() && d.bound.is_finite()) {
                return Err(BeamError::Config(format!("{}: values must be finite", name)));
            }
            if d.sigma < 0.0 {
                return Err(BeamError::Config(format!("{}: sigma must be >= 0", name)));
            }
            if d.bound < 0.0 {
                return Err(BeamError::Config(format!("{}: bound must be >= 0", name)));
            }
        }
        Ok(())
    }

    pub fn distributions(&self) -> [(&'static str, TruncatedNormal); 6] {
        [
            ("ps_amp", self.power_supply()),
            ("cell_rf_phase", self.cell_phase()),
            ("cell_rf_amp", self.cell_amplitude()),
            ("trwave_rf_phase", self.trwave_phase()),
            ("trwave_rf_amp", self.trwave_amplitude()),
            ("bend_amp", self.bend_amplitude()),
        ]
    }

    pub fn power_supply(&self) -> TruncatedNormal {
        TruncatedNormal::new(self.ps_amp_mean, self.ps_amp_sig, self.ps_amp_bound)
    }

    pub fn cell_phase(&self) -> TruncatedNormal {
        TruncatedNormal::new(
            self.cell_rf_phase_mean,
            self.cell_rf_phase_sig,
            self.cell_rf_phase_bound,
        )
    }

    pub fn cell_amplitude(&self) -> TruncatedNormal {
        TruncatedNormal::new(self.cell_rf_amp_mean, self.cell_rf_amp_sig, self.cell_rf_amp_bound)
    }

    pub fn trwave_phase(&self) -> TruncatedNormal {
        TruncatedNormal::new(
            self.trwave_rf_phase_mean,
            self.trwave_rf_phase_sig,
            self.trwave_rf_phase_bound,
        )
    }

    pub fn trwave_amplitude(&self) -> TruncatedNormal {
        TruncatedNormal::new(
            self.trwave_rf_amp_mean,
            self.trwave_rf_amp_sig,
            self.trwave_rf_amp_bound,
        )
    }

    pub fn bend_amplitude(&self) -> TruncatedNormal {
        TruncatedNormal::new(self.bend_amp_mean, self.bend_amp_sig, self.bend_amp_bound)
    }
}
