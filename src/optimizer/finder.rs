use super::{fit_line, fit_parabola, FitWindow, OptimizationPoint, SearchOutcome, Termination};
use crate::error::BfResult;
use serde::{Deserialize, Serialize};
use strum_macros::Display;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FitMode {
    /// Vertex of a parabola through `|metric|` of the three best points.
    Parabola,
    /// Zero crossing of a line through the signed metric of the two best points.
    Linear,
}

impl FitMode {
    pub fn window(&self) -> usize {
        match self {
            FitMode::Parabola => 3,
            FitMode::Linear => 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinderOptions {
    pub mode: FitMode,
    pub step: f64,
    /// Seeds are offset by `start * step` instead of `step` (when `start != 0`).
    pub relative_step: bool,
    pub iterations: usize,
    pub tolerance: f64,
    /// Vertices farther than this from zero are replaced by a linear estimate.
    pub vertex_guard: Option<f64>,
}

impl Default for FinderOptions {
    fn default() -> Self {
        Self {
            mode: FitMode::Parabola,
            step: 1.0,
            relative_step: false,
            iterations: 10,
            tolerance: 2e-4,
            vertex_guard: None,
        }
    }
}

/// Local root/minimum finder for a single parameter.
pub struct LocalFinder {
    options: FinderOptions,
}

impl LocalFinder {
    pub fn new(options: FinderOptions) -> Self {
        Self { options }
    }

    /// Initial probe values around `start`.
    pub fn seeds(&self, start: f64) -> Vec<f64> {
        let opts = &self.options;
        let offset = if opts.relative_step && start != 0.0 {
            start * opts.step
        } else {
            opts.step
        };
        match opts.mode {
            FitMode::Parabola => vec![start, start + offset, start - offset],
            FitMode::Linear => vec![start, start + offset],
        }
    }

    /// Drives `objective` towards zero starting from `start`.
    ///
    /// Recoverable evaluation failures are logged and the point is skipped;
    /// any other error aborts the search.
    pub fn search<F>(&self, start: f64, mut objective: F) -> BfResult<SearchOutcome>
    where
        F: FnMut(f64) -> BfResult<f64>,
    {
        let opts = &self.options;
        let mut window = FitWindow::new(opts.mode.window());
        let mut history = Vec::new();
        let mut evaluations = 0;

        let mut probe = |value: f64, window: &mut FitWindow| -> BfResult<()> {
            evaluations += 1;
            match objective(value) {
                Ok(metric) => {
                    debug!("  f({:.6}) = {:.6e}", value, metric);
                    let point = OptimizationPoint::new(value, metric);
                    history.push(point);
                    if !window.insert(point) {
                        warn!("Discarding non-finite evaluation at {}", value);
                    }
                    Ok(())
                }
                Err(e) if e.is_recoverable() => {
                    warn!("Evaluation at {} skipped: {}", value, e);
                    Ok(())
                }
                Err(e) => Err(e),
            }
        };

        for seed in self.seeds(start) {
            probe(seed, &mut window)?;
        }

        let mut termination = Termination::Exhausted;
        let mut iterations = 0;
        for iteration in 1..=opts.iterations {
            if window.converged(opts.tolerance) {
                termination = Termination::Converged;
                break;
            }
            if !window.is_full() {
                termination = Termination::TooFewPoints;
                break;
            }

            let next = match self.next_candidate(&window) {
                Ok(v) => v,
                Err(reason) => {
                    termination = reason;
                    break;
                }
            };

            iterations = iteration;
            info!("   Iteration {}: trying {:.6}", iteration, next);
            probe(next, &mut window)?;
        }

        if termination == Termination::Exhausted && window.converged(opts.tolerance) {
            termination = Termination::Converged;
        }

        Ok(SearchOutcome {
            best: window.best(),
            iterations,
            evaluations,
            termination,
            history,
        })
    }

    fn next_candidate(&self, window: &FitWindow) -> Result<f64, Termination> {
        let xs = window.values();
        match self.options.mode {
            FitMode::Parabola => {
                let ys: Vec<f64> = window.points().iter().map(|p| p.metric.abs()).collect();
                let vertex = fit_parabola(&xs, &ys)
                    .and_then(|fit| fit.vertex())
                    .ok_or(Termination::FlatCurvature)?;
                match self.options.vertex_guard {
                    Some(guard) if vertex.abs() > guard => {
                        warn!(
                            "Vertex {:.4} beyond ±{}; using linear estimate",
                            vertex, guard
                        );
                        signed_crossing(window, &xs)
                    }
                    _ => Ok(vertex),
                }
            }
            FitMode::Linear => signed_crossing(window, &xs),
        }
    }
}

fn signed_crossing(window: &FitWindow, xs: &[f64]) -> Result<f64, Termination> {
    let ys: Vec<f64> = window.points().iter().map(|p| p.metric).collect();
    fit_line(xs, &ys)
        .and_then(|fit| fit.zero_crossing())
        .ok_or(Termination::FlatSlope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BeamError;
    use rstest::rstest;

    fn linear(step: f64) -> LocalFinder {
        LocalFinder::new(FinderOptions {
            mode: FitMode::Linear,
            step,
            iterations: 10,
            ..FinderOptions::default()
        })
    }

    #[test]
    fn test_linear_converges_on_root() {
        let finder = linear(1.0);
        let outcome = finder.search(0.0, |v| Ok(2.0 * v - 10.0)).unwrap();
        let best = outcome.best.unwrap();
        assert!((best.value - 5.0).abs() < 1e-9);
        assert_eq!(outcome.termination, Termination::Converged);
        assert!(outcome.iterations <= 3);
    }

    #[test]
    fn test_parabola_finds_minimum() {
        let finder = LocalFinder::new(FinderOptions::default());
        let outcome = finder
            .search(1.5, |v| Ok(0.001 * (v - 3.0) * (v - 3.0)))
            .unwrap();
        assert!((outcome.best.unwrap().value - 3.0).abs() < 1e-6);
        assert_eq!(outcome.termination, Termination::Converged);
    }

    #[rstest]
    #[case(FitMode::Parabola, false, 2.0, vec![2.0, 3.0, 1.0])]
    #[case(FitMode::Parabola, true, 2.0, vec![2.0, 4.0, 0.0])]
    #[case(FitMode::Linear, true, 0.0, vec![0.0, 1.0])]
    #[case(FitMode::Linear, true, 4.0, vec![4.0, 8.0])]
    fn test_seeds(
        #[case] mode: FitMode,
        #[case] relative_step: bool,
        #[case] start: f64,
        #[case] expected: Vec<f64>,
    ) {
        let finder = LocalFinder::new(FinderOptions {
            mode,
            step: 1.0,
            relative_step,
            ..FinderOptions::default()
        });
        assert_eq!(finder.seeds(start), expected);
    }

    #[test]
    fn test_constant_objective_converges_on_seeds() {
        let finder = LocalFinder::new(FinderOptions::default());
        let outcome = finder.search(0.0, |_| Ok(1.0)).unwrap();
        assert_eq!(outcome.evaluations, 3);
        assert_eq!(outcome.iterations, 0);
        assert_eq!(outcome.termination, Termination::Converged);

        let outcome = linear(1.0).search(0.0, |_| Ok(3.0)).unwrap();
        assert_eq!(outcome.evaluations, 2);
        assert_eq!(outcome.termination, Termination::Converged);
    }

    #[test]
    fn test_collinear_parabola_is_degenerate() {
        let finder = LocalFinder::new(FinderOptions {
            tolerance: 1e-12,
            ..FinderOptions::default()
        });
        // |v + 10| is linear over the seeds, so the quadratic model is flat.
        let outcome = finder.search(0.0, |v| Ok(v + 10.0)).unwrap();
        assert_eq!(outcome.termination, Termination::FlatCurvature);
        assert_eq!(outcome.evaluations, 3);
        assert_eq!(outcome.best.unwrap().value, -1.0);
    }

    #[test]
    fn test_vertex_guard_falls_back_to_linear() {
        let finder = LocalFinder::new(FinderOptions {
            vertex_guard: Some(20.0),
            iterations: 1,
            tolerance: 1e-12,
            ..FinderOptions::default()
        });
        // |f| bends so little that its vertex lands near -5000; the signed
        // line through the same points crosses zero close to 2.
        let mut tried = Vec::new();
        finder
            .search(0.0, |v| {
                tried.push(v);
                Ok((v - 2.0) + 1e-4 * v * v)
            })
            .unwrap();
        assert_eq!(tried.len(), 4);
        assert!((tried[3] - 2.0).abs() < 1e-3);
    }

    #[test]
    fn test_recoverable_failures_are_skipped() {
        let finder = linear(1.0);
        let mut calls = 0;
        let outcome = finder
            .search(0.0, |v| {
                calls += 1;
                if calls == 3 {
                    Err(BeamError::TableParse("empty table".into()))
                } else {
                    Ok(2.0 * v - 10.0)
                }
            })
            .unwrap();
        assert!((outcome.best.unwrap().value - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_fatal_failures_abort() {
        let finder = linear(1.0);
        let err = finder
            .search(0.0, |_| Err(BeamError::Simulator("crashed".into())))
            .unwrap_err();
        assert!(matches!(err, BeamError::Simulator(_)));
    }
}
