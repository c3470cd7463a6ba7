//! One-dimensional searches over an expensive black-box objective.

pub mod finder;
pub mod gradient;
pub mod section;

pub use self::finder::{FinderOptions, FitMode, LocalFinder};
pub use self::gradient::GradientOptions;
pub use self::section::{SectionDriver, SectionReport, SectionState, SequenceReport};

use crate::error::BfResult;
use std::cmp::Ordering;

/// One evaluated parameter value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptimizationPoint {
    pub value: f64,
    pub metric: f64,
}

impl OptimizationPoint {
    pub fn new(value: f64, metric: f64) -> Self {
        Self { value, metric }
    }

    fn cmp_magnitude(&self, other: &Self) -> Ordering {
        self.metric.abs().total_cmp(&other.metric.abs())
    }
}

/// The best `capacity` points seen so far, ranked by `|metric|`.
#[derive(Debug, Clone)]
pub struct FitWindow {
    capacity: usize,
    points: Vec<OptimizationPoint>,
}

impl FitWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            points: Vec::with_capacity(capacity + 1),
        }
    }

    /// Inserts a point, re-ranks, and evicts the worst one beyond capacity.
    /// Non-finite points are refused.
    pub fn insert(&mut self, point: OptimizationPoint) -> bool {
        if !point.value.is_finite() || !point.metric.is_finite() {
            return false;
        }
        self.points.push(point);
        self.points.sort_by(|a, b| a.cmp_magnitude(b));
        self.points.truncate(self.capacity);
        true
    }

    pub fn points(&self) -> &[OptimizationPoint] {
        &self.points
    }

    pub fn best(&self) -> Option<OptimizationPoint> {
        self.points.first().copied()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.points.len() >= self.capacity
    }

    /// True when the two best metrics differ by less than `tolerance`.
    pub fn converged(&self, tolerance: f64) -> bool {
        match self.points.as_slice() {
            [a, b, ..] => (a.metric - b.metric).abs() < tolerance,
            _ => false,
        }
    }

    fn values(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.value).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineFit {
    pub slope: f64,
    pub intercept: f64,
}

impl LineFit {
    pub fn zero_crossing(&self) -> Option<f64> {
        if self.slope == 0.0 {
            return None;
        }
        let x = -self.intercept / self.slope;
        x.is_finite().then_some(x)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParabolaFit {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    center: f64,
    scale: f64,
    centered: [f64; 3],
}

impl ParabolaFit {
    /// `-b / 2a`, evaluated in centered coordinates. `None` when flat.
    pub fn vertex(&self) -> Option<f64> {
        let [_, p1, p2] = self.centered;
        if p2 == 0.0 {
            return None;
        }
        let x = self.center + self.scale * (-p1 / (2.0 * p2));
        x.is_finite().then_some(x)
    }
}

/// Least-squares straight line through `(xs, ys)`.
pub fn fit_line(xs: &[f64], ys: &[f64]) -> Option<LineFit> {
    let (center, scale) = centering(xs)?;
    let p = solve_centered(xs, ys, center, scale, 1)?;
    if negligible(p[1], &p) {
        return Some(LineFit {
            slope: 0.0,
            intercept: p[0],
        });
    }
    Some(LineFit {
        slope: p[1] / scale,
        intercept: p[0] - p[1] * center / scale,
    })
}

/// Least-squares parabola `a x^2 + b x + c` through `(xs, ys)`.
pub fn fit_parabola(xs: &[f64], ys: &[f64]) -> Option<ParabolaFit> {
    let (center, scale) = centering(xs)?;
    let mut p = solve_centered(xs, ys, center, scale, 2)?;
    if negligible(p[2], &p) {
        p[2] = 0.0;
    }
    let (m, s) = (center, scale);
    Some(ParabolaFit {
        a: p[2] / (s * s),
        b: p[1] / s - 2.0 * p[2] * m / (s * s),
        c: p[0] - p[1] * m / s + p[2] * m * m / (s * s),
        center,
        scale,
        centered: [p[0], p[1], p[2]],
    })
}

fn negligible(coef: f64, all: &[f64]) -> bool {
    let magnitude: f64 = all.iter().map(|c| c.abs()).sum();
    coef.abs() <= 64.0 * f64::EPSILON * magnitude
}

fn centering(xs: &[f64]) -> Option<(f64, f64)> {
    if xs.is_empty() {
        return None;
    }
    let center = xs.iter().sum::<f64>() / xs.len() as f64;
    let scale = xs.iter().map(|x| (x - center).abs()).fold(0.0, f64::max);
    (scale > 0.0 && scale.is_finite()).then_some((center, scale))
}

/// Solves the normal equations of a degree-`deg` fit in `t = (x - center) / scale`.
fn solve_centered(xs: &[f64], ys: &[f64], center: f64, scale: f64, deg: usize) -> Option<Vec<f64>> {
    let n = deg + 1;
    if xs.len() != ys.len() || xs.len() < n {
        return None;
    }

    let mut m = vec![vec![0.0; n + 1]; n];
    for (&x, &y) in xs.iter().zip(ys) {
        let t = (x - center) / scale;
        let powers: Vec<f64> = (0..=2 * deg).map(|k| t.powi(k as i32)).collect();
        for r in 0..n {
            for c in 0..n {
                m[r][c] += powers[r + c];
            }
            m[r][n] += y * powers[r];
        }
    }

    for col in 0..n {
        let pivot = (col..n).max_by(|&a, &b| m[a][col].abs().total_cmp(&m[b][col].abs()))?;
        if m[pivot][col].abs() < 1e-12 {
            return None;
        }
        m.swap(col, pivot);
        for r in 0..n {
            if r != col {
                let factor = m[r][col] / m[col][col];
                for c in col..=n {
                    m[r][c] -= factor * m[col][c];
                }
            }
        }
    }

    let p: Vec<f64> = (0..n).map(|i| m[i][n] / m[i][i]).collect();
    p.iter().all(|v| v.is_finite()).then_some(p)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Converged,
    /// The quadratic model has no curvature.
    FlatCurvature,
    /// The linear model has no zero crossing.
    FlatSlope,
    /// Too few valid evaluations to build a model.
    TooFewPoints,
    /// The iteration cap was reached.
    Exhausted,
}

#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub best: Option<OptimizationPoint>,
    pub iterations: usize,
    pub evaluations: usize,
    pub termination: Termination,
    pub history: Vec<OptimizationPoint>,
}

/// The search method applied to each axis of a knob.
#[derive(Debug, Clone)]
pub enum SearchStrategy {
    Fit(FinderOptions),
    Gradient(GradientOptions),
}

impl SearchStrategy {
    pub fn search<F>(&self, start: f64, objective: F) -> BfResult<SearchOutcome>
    where
        F: FnMut(f64) -> BfResult<f64>,
    {
        match self {
            SearchStrategy::Fit(opts) => LocalFinder::new(opts.clone()).search(start, objective),
            SearchStrategy::Gradient(opts) => gradient::search(start, opts, objective),
        }
    }
}
