use beamforge::config::{
    ErrorModel, Method, SearchParams, SimulatorParams, BATCH_TIMEOUT_SECS, STEERER_VERTEX_GUARD,
};
use beamforge::error::BeamError;
use beamforge::optimizer::{FitMode, SearchStrategy};
use beamforge::simulator::{Observable, DEFAULT_TABLE};
use rstest::rstest;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;

fn write(dir: &TempDir, name: &str, content: &str) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, content).unwrap();
    path
}

const YAML: &str = "runs: 25\n\
seed: 1234\n\
ps_amp_mean: 0.0\n\
ps_amp_sig: 0.001\n\
ps_amp_bound: 0.003\n\
cell_rf_phase_sig: 0.5\n\
cell_rf_phase_bound: 1.0\n\
trwave_rf_amp_sig: 0.002\n\
trwave_rf_amp_bound: 0.004\n";

#[test]
fn test_yaml_parameter_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = write(&dir, "errors.yaml", YAML);
    let model = ErrorModel::load_from_file(&path).unwrap();

    assert_eq!(model.runs, 25);
    assert_eq!(model.seed, Some(1234));
    assert_eq!(model.ps_amp_sig, 0.001);
    assert_eq!(model.cell_rf_phase_bound, 1.0);
    // Keys left out disable their error source.
    assert_eq!(model.bend_amp_sig, 0.0);
    assert!(model.bend_amplitude().is_deterministic());
    assert!(!model.power_supply().is_deterministic());
}

#[test]
fn test_json_matches_yaml() {
    let dir = tempfile::tempdir().unwrap();
    let yaml = ErrorModel::load_from_file(write(&dir, "e.yml", YAML)).unwrap();
    let json = serde_json::to_string(&yaml).unwrap();
    let back = ErrorModel::load_from_file(write(&dir, "e.json", &json)).unwrap();
    assert_eq!(yaml, back);
}

#[test]
fn test_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let model = ErrorModel::load_from_file(write(&dir, "empty.yaml", "{}\n")).unwrap();
    assert_eq!(model, ErrorModel::default());
    assert_eq!(model.runs, 1);
    assert!(model.seed.is_none());
    assert!(model
        .distributions()
        .iter()
        .all(|(_, d)| d.is_deterministic()));
}

#[rstest]
#[case("runs: 0\n")]
#[case("ps_amp_sig: -0.1\n")]
#[case("bend_amp_bound: -1\n")]
#[case("cell_rf_amp_mean: .nan\n")]
fn test_invalid_models_are_rejected(#[case] content: &str) {
    let dir = tempfile::tempdir().unwrap();
    let err = ErrorModel::load_from_file(write(&dir, "bad.yaml", content)).unwrap_err();
    assert!(matches!(err, BeamError::Config(_)), "{:?}", err);
}

#[test]
fn test_malformed_and_unsupported_files() {
    let dir = tempfile::tempdir().unwrap();
    let err = ErrorModel::load_from_file(write(&dir, "bad.yaml", "runs: [1, 2\n")).unwrap_err();
    assert!(matches!(err, BeamError::Yaml(_)));

    let err = ErrorModel::load_from_file(write(&dir, "bad.json", "{\"runs\": }")).unwrap_err();
    assert!(matches!(err, BeamError::Json(_)));

    let err = ErrorModel::load_from_file(write(&dir, "e.toml", "runs = 3")).unwrap_err();
    assert!(matches!(err, BeamError::Config(_)));

    let err = ErrorModel::load_from_file(dir.path().join("missing.yaml")).unwrap_err();
    assert!(matches!(err, BeamError::Config(_)));
}

#[test]
fn test_orbit_strategy_gets_vertex_guard() {
    let params = SearchParams::default();
    match params.strategy(Observable::Orbit, 0.5, 12).unwrap() {
        SearchStrategy::Fit(opts) => {
            assert_eq!(opts.mode, FitMode::Parabola);
            assert_eq!(opts.vertex_guard, Some(STEERER_VERTEX_GUARD));
            assert_eq!(opts.tolerance, Observable::Orbit.tolerance());
            assert_eq!(opts.iterations, 12);
            assert_eq!(opts.step, 0.5);
        }
        other => panic!("unexpected strategy {:?}", other),
    }
    match params.strategy(Observable::EnergySpread, 5.0, 10).unwrap() {
        SearchStrategy::Fit(opts) => {
            assert_eq!(opts.vertex_guard, None);
            assert_eq!(opts.tolerance, 2e-7);
        }
        other => panic!("unexpected strategy {:?}", other),
    }
}

#[test]
fn test_explicit_overrides_win() {
    let params = SearchParams {
        method: Method::Gradient,
        tolerance: Some(1e-3),
        learning_rate: 0.25,
        ..SearchParams::default()
    };
    match params.strategy(Observable::EnergySpread, 0.1, 7).unwrap() {
        SearchStrategy::Gradient(opts) => {
            assert_eq!(opts.tolerance, 1e-3);
            assert_eq!(opts.learning_rate, 0.25);
            assert_eq!(opts.iterations, 7);
        }
        other => panic!("unexpected strategy {:?}", other),
    }
}

#[test]
fn test_gradient_rejected_for_orbit() {
    let params = SearchParams {
        method: Method::Gradient,
        ..SearchParams::default()
    };
    let err = params.strategy(Observable::Orbit, 0.1, 7).unwrap_err();
    assert!(matches!(err, BeamError::Config(_)));
    assert!(err.to_string().contains("gradient"));
}

#[test]
fn test_simulator_defaults() {
    let sim = SimulatorParams::default();
    assert_eq!(sim.table, DEFAULT_TABLE);
    assert!(sim.worker_count() >= 1);

    let pinned = SimulatorParams {
        jobs: Some(3),
        ..SimulatorParams::default()
    };
    assert_eq!(pinned.worker_count(), 3);
}

#[test]
fn test_batch_runs_are_time_limited_by_default() {
    let sim = SimulatorParams::default();
    assert_eq!(sim.invoker().timeout(), None);
    assert_eq!(
        sim.batch_invoker().timeout(),
        Some(Duration::from_secs(BATCH_TIMEOUT_SECS))
    );

    let custom = SimulatorParams {
        timeout_secs: Some(90),
        ..SimulatorParams::default()
    };
    assert_eq!(custom.invoker().timeout(), Some(Duration::from_secs(90)));
    assert_eq!(custom.batch_invoker().timeout(), Some(Duration::from_secs(90)));

    let unlimited = SimulatorParams {
        timeout_secs: Some(0),
        ..SimulatorParams::default()
    };
    assert_eq!(unlimited.batch_invoker().timeout(), None);
}
