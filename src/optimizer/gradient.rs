use super::{OptimizationPoint, SearchOutcome, Termination};
use crate::error::BfResult;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradientOptions {
    /// Initial finite-difference half-width.
    pub step: f64,
    pub iterations: usize,
    pub learning_rate: f64,
    pub momentum: f64,
    pub step_up: f64,
    pub step_down: f64,
    pub tolerance: f64,
}

impl Default for GradientOptions {
    fn default() -> Self {
        Self {
            step: 1.0,
            iterations: 10,
            learning_rate: 1.0,
            momentum: 0.9,
            step_up: 1.2,
            step_down: 0.5,
            tolerance: 2e-7,
        }
    }
}

/// Momentum descent on the metric using a central difference. Only meaningful
/// for metrics whose optimum is their minimum.
///
/// The difference width grows after an improving step and shrinks otherwise.
/// Stops when two successive metrics differ by less than `tolerance`.
pub fn search<F>(start: f64, opts: &GradientOptions, mut objective: F) -> BfResult<SearchOutcome>
where
    F: FnMut(f64) -> BfResult<f64>,
{
    let mut value = start;
    let mut h = opts.step;
    let mut velocity = 0.0;
    let mut previous: Option<f64> = None;
    let mut history: Vec<OptimizationPoint> = Vec::new();
    let mut evaluations = 0;
    let mut iterations = 0;
    let mut termination = Termination::Exhausted;

    let mut eval = |v: f64| -> BfResult<Option<f64>> {
        evaluations += 1;
        match objective(v) {
            Ok(m) if m.is_finite() => Ok(Some(m)),
            Ok(m) => {
                warn!("Discarding non-finite evaluation {} at {}", m, v);
                Ok(None)
            }
            Err(e) if e.is_recoverable() => {
                warn!("Evaluation at {} skipped: {}", v, e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    };

    for it in 1..=opts.iterations {
        iterations = it;
        let (Some(plus), Some(minus)) = (eval(value + h)?, eval(value - h)?) else {
            continue;
        };
        let grad = (plus - minus) / (2.0 * h);
        velocity = opts.momentum * velocity - opts.learning_rate * grad;
        value += velocity;

        let Some(metric) = eval(value)? else {
            continue;
        };
        history.push(OptimizationPoint::new(value, metric));
        info!(
            "   Gradient it {}: value={:.6}, metric={:.6e}, grad={:.4e}, step={:.4}",
            it, value, metric, grad, h
        );

        if let Some(prev) = previous {
            h *= if metric < prev { opts.step_up } else { opts.step_down };
            if (prev - metric).abs() < opts.tolerance {
                termination = Termination::Converged;
                break;
            }
        }
        previous = Some(metric);
    }

    if history.is_empty() {
        termination = Termination::TooFewPoints;
    }

    Ok(SearchOutcome {
        best: history.last().copied(),
        iterations,
        evaluations,
        termination,
        history,
    })
}
