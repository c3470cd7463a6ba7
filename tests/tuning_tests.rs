mod common;

use beamforge::config::{Method, SearchParams};
use beamforge::error::{BeamError, BfResult};
use beamforge::lattice::{KnobKind, LatticeDocument};
use beamforge::optimizer::SectionDriver;
use beamforge::simulator::{Evaluator, Observable, Simulator, DEFAULT_TABLE};
use common::{linear_orbit, phase_bowl, quadratic_orbit, write_file, FakeParmela};
use std::path::Path;
use tempfile::TempDir;

const SINGLE: &str = "title\n\
run 1 1 2856.0 1 1\n\
drift 10 2 0\n\
steerer 5 2 0 1.5 -0.5 3.0 -1.5\n\
quad 10 2 0 300\n\
zout\n";

const PHASED: &str = "title\n\
cell 3.5 1.0 1 120.0 30.0 42.0\n\
trwave 3.5 1.0 1 30.0 30.0\n\
trwave 3.5 1.0 1 30.0 30.0\n\
drift 10 2 0\n";

const SECTIONED: &str = "title\n\
run 1 1 2856.0 1 1\n\
!cor 0\n\
drift 10 2 0\n\
steerer 5 2 0 0.0 0.0 1.0 2.0\n\
quad 10 2 0 300\n\
!cor 1\n\
drift 10 2 0\n\
steerer 5 2 0 0.0 0.0 -1.0 0.5\n\
zout\n\
!cor 2\n\
solenoid 5 3 0 1200\n\
steerer 5 2 0 0.0 0.0 3.0 -2.0\n";

struct Session {
    _dir: TempDir,
    working: std::path::PathBuf,
    doc: LatticeDocument,
}

fn session(lattice: &str) -> Session {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let working = write_file(dir.path(), "rr6_temp.inp", lattice);
    let doc = LatticeDocument::load(&working).unwrap();
    Session {
        _dir: dir,
        working,
        doc,
    }
}

fn driver<'a>(
    sim: &'a dyn Simulator,
    s: &Session,
    observable: Observable,
    params: &SearchParams,
    step: f64,
) -> SectionDriver<'a> {
    let evaluator = Evaluator::new(sim, &s.working, DEFAULT_TABLE);
    let strategy = params.strategy(observable, step, 10).unwrap();
    SectionDriver::new(evaluator, s.doc.clone(), observable, strategy)
}

#[test]
fn test_single_steerer_zeroes_both_axes() {
    let s = session(SINGLE);
    let sim = FakeParmela::new(quadratic_orbit);
    let mut d = driver(&sim, &s, Observable::Orbit, &SearchParams::default(), 1.0);

    let report = d.run_single(KnobKind::Steerer, 0).unwrap();

    assert_eq!(report.axes.len(), 2);
    assert!((report.axes[0].value - 3.0).abs() < 1e-6);
    assert!((report.axes[1].value + 1.5).abs() < 1e-6);
    let finals = report.final_metrics.unwrap();
    assert!(finals.iter().all(|m| m.abs() < 1e-9));

    let doc = d.document();
    assert!((doc.field_value(3, 4).unwrap() - 3.0).abs() < 1e-6);
    assert!((doc.field_value(3, 5).unwrap() + 1.5).abs() < 1e-6);
    assert!(sim.runs().iter().all(|r| !r.input.contains("\nend\n")));
}

#[test]
fn test_phase_knob_moves_header_and_sub_records() {
    let s = session(PHASED);
    let sim = FakeParmela::new(phase_bowl);
    let mut d = driver(&sim, &s, Observable::EnergySpread, &SearchParams::default(), 5.0);

    let report = d.run_single(KnobKind::RfPhase, 0).unwrap();

    assert!((report.axes[0].value - 42.0).abs() < 1e-6);
    let doc = d.document();
    assert!((doc.field_value(1, 4).unwrap() - 132.0).abs() < 1e-6);
    assert!((doc.field_value(2, 4).unwrap() - 42.0).abs() < 1e-6);
    assert!((doc.field_value(3, 4).unwrap() - 42.0).abs() < 1e-6);
    assert_eq!(doc.field_value(2, 5).unwrap(), 30.0);
}

#[test]
fn test_gradient_phases_towards_spread_minimum() {
    let s = session(PHASED);
    let sim = FakeParmela::new(phase_bowl);
    let params = SearchParams {
        method: Method::Gradient,
        tolerance: Some(0.0),
        learning_rate: 2e4,
        momentum: 0.5,
        ..SearchParams::default()
    };
    let strategy = params.strategy(Observable::EnergySpread, 5.0, 80).unwrap();
    let evaluator = Evaluator::new(&sim, &s.working, DEFAULT_TABLE);
    let mut d = SectionDriver::new(evaluator, s.doc.clone(), Observable::EnergySpread, strategy);

    let report = d.run_single(KnobKind::RfPhase, 0).unwrap();

    let axis = &report.axes[0];
    assert!((axis.value - 42.0).abs() < 1e-2, "ended at {}", axis.value);
    assert!(axis.metric.unwrap() < 1e-5 * 144.0);
    assert!((d.document().field_value(1, 4).unwrap() - 132.0).abs() < 1e-2);
}

#[test]
fn test_sections_are_solved_in_order() {
    let s = session(SECTIONED);
    let sim = FakeParmela::new(linear_orbit);
    let params = SearchParams {
        method: Method::Linear,
        ..SearchParams::default()
    };
    let mut d = driver(&sim, &s, Observable::Orbit, &params, 0.5);

    let report = d.run_sections(KnobKind::Steerer, 0).unwrap();

    let found: Vec<(f64, f64)> = report
        .sections
        .iter()
        .map(|r| (r.axes[0].value, r.axes[1].value))
        .collect();
    let expected = [(1.0, 2.0), (-1.0, 0.5), (3.0, -2.0)];
    assert_eq!(found.len(), expected.len());
    for ((x, y), (ex, ey)) in found.iter().zip(expected) {
        assert!((x - ex).abs() < 1e-6, "x {} != {}", x, ex);
        assert!((y - ey).abs() < 1e-6, "y {} != {}", y, ey);
    }

    let finals = report.final_metrics.unwrap();
    assert!(finals.iter().all(|m| m.abs() < 1e-8));
    assert_eq!(d.document().masked_count(), 0);
    assert!(d.document().stop_markers().is_empty());

    let runs = sim.runs();
    // Section 0 is truncated after its own span.
    assert_eq!(runs[0].input.lines().filter(|l| *l == "end").count(), 1);
    assert!(runs[0].input.contains("quad 10 2 0 300\nend\n!cor 1"));
    // Later sections see the previous span masked, its steerer kept.
    assert!(runs.iter().any(|r| r.input.contains("!quad 10 2 0 300")));
    assert!(runs.iter().any(|r| r.input.contains("!zout")));
    assert!(runs.iter().all(|r| !r.input.contains("!steerer")));
    // The final run is the complete, unmasked lattice.
    let last = &runs.last().unwrap().input;
    assert!(!last.contains("!drift") && !last.contains("!zout") && !last.contains("\nend\n"));
}

#[test]
fn test_start_section_out_of_range() {
    let s = session(SECTIONED);
    let sim = FakeParmela::new(linear_orbit);
    let mut d = driver(&sim, &s, Observable::Orbit, &SearchParams::default(), 0.5);
    let err = d.run_sections(KnobKind::Steerer, 3).unwrap_err();
    assert!(matches!(err, BeamError::Lattice(_)));
    assert_eq!(sim.run_count(), 0);
}

#[test]
fn test_missing_knob_fails_before_any_run() {
    let s = session("title\ndrift 10 2 0\n");
    let sim = FakeParmela::new(linear_orbit);
    let mut d = driver(&sim, &s, Observable::Orbit, &SearchParams::default(), 1.0);
    assert!(matches!(
        d.run_single(KnobKind::Steerer, 0),
        Err(BeamError::Lattice(_))
    ));
    assert!(d.run_sections(KnobKind::Steerer, 0).is_err());
    assert_eq!(sim.run_count(), 0);
}

#[test]
fn test_simulator_failure_aborts_tuning() {
    let s = session(SINGLE);
    let sim = FakeParmela::new(quadratic_orbit).failing_when(|_| true);
    let mut d = driver(&sim, &s, Observable::Orbit, &SearchParams::default(), 1.0);
    let err = d.run_single(KnobKind::Steerer, 0).unwrap_err();
    assert!(matches!(err, BeamError::Simulator(_)));
    assert_eq!(sim.run_count(), 1);
}

struct SilentSimulator;

impl Simulator for SilentSimulator {
    fn run(&self, _workdir: &Path, _input: &Path) -> BfResult<()> {
        Ok(())
    }
}

#[test]
fn test_missing_tables_keep_original_values() {
    let s = session(SINGLE);
    let sim = SilentSimulator;
    let mut d = driver(&sim, &s, Observable::Orbit, &SearchParams::default(), 1.0);

    let report = d.run_single(KnobKind::Steerer, 0).unwrap();

    assert_eq!(report.axes[0].value, 1.5);
    assert_eq!(report.axes[1].value, -0.5);
    assert!(report.axes.iter().all(|a| a.metric.is_none()));
    assert!(report.final_metrics.is_none());
}
