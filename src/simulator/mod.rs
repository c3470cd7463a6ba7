//! Invocation of the external beam-dynamics simulator.
//!
//! The simulator has no API: it reads an input file from its working directory
//! and rewrites its output tables there. [`Simulator`] captures that contract
//! with an explicit working directory so that callers never change the
//! process-wide current directory.

pub mod table;

use crate::error::{BeamError, BfResult};
use crate::lattice::LatticeDocument;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

pub use self::table::{TableProbe, TitledTable};

pub const DEFAULT_PROGRAM: &str = "parmela";
pub const DEFAULT_TABLE: &str = "TIMESTEPEMITTANCE.TBL";

/// Runs the simulator once, blocking until it exits.
pub trait Simulator: Send + Sync {
    /// `input` is resolved relative to `workdir`.
    fn run(&self, workdir: &Path, input: &Path) -> BfResult<()>;
}

#[derive(Debug, Clone)]
pub struct ParmelaInvoker {
    program: PathBuf,
    timeout: Option<Duration>,
    quiet: bool,
}

impl ParmelaInvoker {
    pub fn new<P: Into<PathBuf>>(program: P) -> Self {
        Self {
            program: program.into(),
            timeout: None,
            quiet: true,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_output(mut self, show: bool) -> Self {
        self.quiet = !show;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn wait(&self, child: &mut Child) -> BfResult<ExitStatus> {
        let Some(limit) = self.timeout else {
            return Ok(child.wait()?);
        };

        let started = Instant::now();
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(status);
            }
            if started.elapsed() >= limit {
                let _ = child.kill();
                let _ = child.wait();
                return Err(BeamError::Simulator(format!(
                    "{:?} did not finish within {:?}",
                    self.program, limit
                )));
            }
            thread::sleep(Duration::from_millis(50));
        }
    }
}

impl Default for ParmelaInvoker {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRAM)
    }
}

impl Simulator for ParmelaInvoker {
    fn run(&self, workdir: &Path, input: &Path) -> BfResult<()> {
        let mut cmd = Command::new(&self.program);
        cmd.arg(input).current_dir(workdir);
        if self.quiet {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }

        debug!("Running {:?} {:?} in {:?}", self.program, input, workdir);
        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            ErrorKind::NotFound => BeamError::Simulator(format!(
                "Executable {:?} not found. Please ensure it is in your PATH.",
                self.program
            )),
            _ => BeamError::Simulator(format!("Failed to start {:?}: {}", self.program, e)),
        })?;

        let status = self.wait(&mut child)?;
        if !status.success() {
            return Err(BeamError::Simulator(format!(
                "{:?} exited with {} on {:?}",
                self.program, status, input
            )));
        }
        Ok(())
    }
}

/// Which beam observable a search drives to zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observable {
    /// Transverse centroid `<X>`, `<Y>` in the second-to-last table row.
    Orbit,
    /// Energy spread in the third-to-last table row.
    EnergySpread,
}

impl Observable {
    pub fn probe(&self) -> TableProbe {
        match self {
            Observable::Orbit => TableProbe {
                row_from_end: 2,
                columns: &[13, 15],
            },
            Observable::EnergySpread => TableProbe {
                row_from_end: 3,
                columns: &[12],
            },
        }
    }

    /// Convergence tolerance between the two best points.
    pub fn tolerance(&self) -> f64 {
        match self {
            Observable::Orbit => 2e-4,
            Observable::EnergySpread => 2e-7,
        }
    }

    pub fn labels(&self) -> &'static [&'static str] {
        match self {
            Observable::Orbit => &["x-orbit", "y-orbit"],
            Observable::EnergySpread => &["dE"],
        }
    }
}

/// Persist, run, parse: one objective evaluation against a working copy.
pub struct Evaluator<'a> {
    simulator: &'a dyn Simulator,
    workdir: PathBuf,
    input: PathBuf,
    table: String,
}

impl<'a> Evaluator<'a> {
    /// `input_path` is the working copy the document is written to; the
    /// simulator runs in its parent directory.
    pub fn new(simulator: &'a dyn Simulator, input_path: &Path, table: &str) -> Self {
        let workdir = match input_path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let input = input_path
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| input_path.to_path_buf());
        Self {
            simulator,
            workdir,
            input,
            table: table.to_string(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn input_path(&self) -> PathBuf {
        self.workdir.join(&self.input)
    }

    pub fn table_path(&self) -> PathBuf {
        self.workdir.join(&self.table)
    }

    /// Runs the simulator on `doc` without reading any output.
    pub fn run(&self, doc: &LatticeDocument) -> BfResult<()> {
        doc.save(self.input_path())?;
        let table = self.table_path();
        if table.exists() {
            fs::remove_file(&table)?;
        }
        self.simulator.run(&self.workdir, &self.input)
    }

    pub fn evaluate(&self, doc: &LatticeDocument, observable: Observable) -> BfResult<Vec<f64>> {
        self.run(doc)?;
        observable.probe().read(self.table_path())
    }
}
