#![allow(dead_code)]

use beamforge::error::{BeamError, BfResult};
use beamforge::montecarlo::AGGREGATE_HEADER;
use beamforge::simulator::{Simulator, DEFAULT_TABLE};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

/// An active (unmasked, before any `end`) line of the lattice.
#[derive(Debug, Clone)]
pub struct Record {
    pub keyword: String,
    pub fields: Vec<f64>,
}

impl Record {
    pub fn field(&self, i: usize) -> f64 {
        self.fields.get(i).copied().unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Beam {
    pub x: f64,
    pub y: f64,
    pub de: f64,
}

#[derive(Debug, Clone)]
pub struct RunRecord {
    pub workdir: PathBuf,
    pub input: String,
}

pub type Physics = fn(&[Record]) -> Beam;

/// In-process stand-in for the simulator.
///
/// Reads the lattice the way the real program would (comments skipped,
/// `end` halts), computes a beam from `physics`, and writes a titled table
/// whose summary rows sit where the real ones do. Column 0 carries a checksum
/// of the input so tables can be traced back to the lattice that made them.
pub struct FakeParmela {
    physics: Physics,
    fail_if: Option<fn(&str) -> bool>,
    delay: Duration,
    runs: Mutex<Vec<RunRecord>>,
}

impl FakeParmela {
    pub fn new(physics: Physics) -> Self {
        Self {
            physics,
            fail_if: None,
            delay: Duration::ZERO,
            runs: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_when(mut self, predicate: fn(&str) -> bool) -> Self {
        self.fail_if = Some(predicate);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn runs(&self) -> Vec<RunRecord> {
        self.runs.lock().unwrap().clone()
    }

    pub fn run_count(&self) -> usize {
        self.runs.lock().unwrap().len()
    }
}

impl Simulator for FakeParmela {
    fn run(&self, workdir: &Path, input: &Path) -> BfResult<()> {
        let text = fs::read_to_string(workdir.join(input))
            .map_err(|e| BeamError::Simulator(format!("cannot open input: {}", e)))?;
        self.runs.lock().unwrap().push(RunRecord {
            workdir: workdir.to_path_buf(),
            input: text.clone(),
        });
        if self.fail_if.is_some_and(|f| f(&text)) {
            return Err(BeamError::Simulator("fake simulator crashed".to_string()));
        }

        let records = active_records(&text);
        let beam = (self.physics)(&records);
        thread::sleep(self.delay);

        fs::write(workdir.join("OUTPAR.T2"), "scratch").map_err(BeamError::Io)?;
        fs::write(workdir.join(DEFAULT_TABLE), render_table(checksum(&records), beam))
            .map_err(BeamError::Io)?;
        Ok(())
    }
}

pub fn active_records(text: &str) -> Vec<Record> {
    let mut out = Vec::new();
    for line in text.lines() {
        let t = line.trim();
        if t.eq_ignore_ascii_case("end") {
            break;
        }
        if t.is_empty() || t.starts_with('!') {
            continue;
        }
        let mut tokens = t.split_whitespace();
        let keyword = tokens.next().unwrap_or_default().to_ascii_lowercase();
        let fields = std::iter::once(0.0)
            .chain(tokens.map(|v| v.parse::<f64>().unwrap_or(0.0)))
            .collect();
        out.push(Record { keyword, fields });
    }
    out
}

pub fn checksum(records: &[Record]) -> f64 {
    records
        .iter()
        .flat_map(|r| r.fields.iter())
        .enumerate()
        .map(|(i, v)| v * (1.0 + (i % 7) as f64))
        .sum()
}

/// Twenty columns, four data rows; row -3 and row -2 hold the beam.
pub fn render_table(checksum: f64, beam: Beam) -> String {
    let mut out = String::from("TITLES\n");
    for title in AGGREGATE_HEADER.split_whitespace() {
        out.push_str(title);
        out.push('\n');
    }
    out.push_str("ENDTITLES\nDATA\n");
    for z in 0..4 {
        let mut row = vec![0.0; 20];
        row[0] = checksum;
        row[1] = z as f64;
        row[12] = beam.de;
        row[13] = beam.x;
        row[15] = beam.y;
        let line: Vec<String> = row.iter().map(|v| format!("{:.10e}", v)).collect();
        out.push_str(&line.join(" "));
        out.push('\n');
    }
    out
}

/// Steerer `steerer a b c X Y tx ty` pulls the orbit by `0.01 * (X - tx)`.
pub fn linear_orbit(records: &[Record]) -> Beam {
    let mut beam = Beam::default();
    for r in records.iter().filter(|r| r.keyword == "steerer") {
        beam.x += 0.01 * (r.field(4) - r.field(6));
        beam.y += 0.01 * (r.field(5) - r.field(7));
    }
    beam
}

/// Same targets as [`linear_orbit`], but the offset grows quadratically.
pub fn quadratic_orbit(records: &[Record]) -> Beam {
    let mut beam = Beam::default();
    for r in records.iter().filter(|r| r.keyword == "steerer") {
        beam.x += 0.001 * (r.field(4) - r.field(6)).powi(2);
        beam.y += 0.002 * (r.field(5) - r.field(7)).powi(2);
    }
    beam
}

/// Energy spread is a bowl around the target phase in field 6 of each
/// traveling-wave header; sub-records must agree with their header.
pub fn phase_bowl(records: &[Record]) -> Beam {
    let mut beam = Beam::default();
    let mut current: Option<f64> = None;
    for r in records {
        match r.keyword.as_str() {
            "cell" => {
                let phase = r.field(4) - 90.0;
                beam.de += 1e-5 * (phase - r.field(6)).powi(2);
                current = Some(phase);
            }
            "trwave" => {
                if let Some(p) = current {
                    beam.de += 1e-3 * (r.field(4) - p).abs();
                }
            }
            _ => current = None,
        }
    }
    beam
}

/// Anything with a solenoid contributes to the orbit; used for batch runs.
pub fn solenoid_orbit(records: &[Record]) -> Beam {
    let mut beam = Beam::default();
    for r in records {
        match r.keyword.as_str() {
            "solenoid" | "quad" => beam.x += 1e-4 * r.field(4),
            "steerer" => beam.y += 1e-3 * r.field(5),
            _ => {}
        }
    }
    beam.de = 1e-6 * checksum(records);
    beam
}

pub fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, content).unwrap();
    path
}
