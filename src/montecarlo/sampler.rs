//! Truncated-normal perturbations and how they are written into a lattice.

use crate::config::ErrorModel;
use crate::error::BfResult;
use crate::lattice::{
    ElementKind, LatticeDocument, LatticeIndex, AMPLITUDE_FIELD, PHASE_FIELD,
};
use rand::Rng;
use rand_distr::{Distribution as _, Normal};
use serde::{Deserialize, Serialize};
use tracing::warn;

const MAX_REJECTIONS: usize = 1000;

/// Normal distribution truncated to `[mean - bound, mean + bound]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TruncatedNormal {
    pub mean: f64,
    pub sigma: f64,
    pub bound: f64,
}

impl TruncatedNormal {
    pub fn new(mean: f64, sigma: f64, bound: f64) -> Self {
        Self { mean, sigma, bound }
    }

    pub fn is_deterministic(&self) -> bool {
        self.sigma == 0.0 || self.bound == 0.0
    }

    pub fn low(&self) -> f64 {
        self.mean - self.bound
    }

    pub fn high(&self) -> f64 {
        self.mean + self.bound
    }

    pub fn draw<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        if self.is_deterministic() {
            return self.mean;
        }
        let Ok(normal) = Normal::new(self.mean, self.sigma) else {
            return self.mean;
        };
        for _ in 0..MAX_REJECTIONS {
            let x = normal.sample(rng);
            if x >= self.low() && x <= self.high() {
                return x;
            }
        }
        normal.sample(rng).clamp(self.low(), self.high())
    }

    pub fn draw_n<R: Rng + ?Sized>(&self, rng: &mut R, n: usize) -> Vec<f64> {
        (0..n).map(|_| self.draw(rng)).collect()
    }
}

/// The deviation drawn for one element record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerturbationSample {
    pub kind: ElementKind,
    /// Header line of the record (or record group).
    pub line: usize,
    /// Additive phase offset in degrees (RF kinds only).
    pub phase_delta: Option<f64>,
    pub amplitude_fraction: f64,
}

/// One draw for every perturbable record in the index.
///
/// Draw order is fixed (quad, solenoid, steerer, cell, trwave, bend) so that a
/// seeded generator always yields the same perturbation for the same lattice.
pub fn sample<R: Rng + ?Sized>(
    index: &LatticeIndex,
    model: &ErrorModel,
    rng: &mut R,
) -> Vec<PerturbationSample> {
    let mut out = Vec::new();

    for kind in [ElementKind::Quad, ElementKind::Solenoid, ElementKind::Steerer] {
        let lines = index.positions(kind);
        let amps = model.power_supply().draw_n(rng, lines.len());
        out.extend(lines.iter().zip(amps).map(|(&line, a)| PerturbationSample {
            kind,
            line,
            phase_delta: None,
            amplitude_fraction: a,
        }));
    }

    let rf = [
        (ElementKind::Cell, model.cell_phase(), model.cell_amplitude()),
        (ElementKind::Trwave, model.trwave_phase(), model.trwave_amplitude()),
    ];
    for (kind, phase, amp) in rf {
        let lines = index.positions(kind);
        let phases = phase.draw_n(rng, lines.len());
        let amps = amp.draw_n(rng, lines.len());
        out.extend(
            lines
                .iter()
                .zip(phases.into_iter().zip(amps))
                .map(|(&line, (p, a))| PerturbationSample {
                    kind,
                    line,
                    phase_delta: Some(p),
                    amplitude_fraction: a,
                }),
        );
    }

    let lines = index.positions(ElementKind::Bend);
    let amps = model.bend_amplitude().draw_n(rng, lines.len());
    out.extend(lines.iter().zip(amps).map(|(&line, a)| PerturbationSample {
        kind: ElementKind::Bend,
        line,
        phase_delta: None,
        amplitude_fraction: a,
    }));

    out
}

/// Writes `samples` into `doc`. Returns the number of lines changed.
///
/// Zero deltas leave a line untouched. Records too short (or non-numeric)
/// for their policy are skipped with a warning.
pub fn apply(
    doc: &mut LatticeDocument,
    index: &LatticeIndex,
    samples: &[PerturbationSample],
) -> BfResult<usize> {
    let mut changed = 0;
    for s in samples {
        let scale = 1.0 + s.amplitude_fraction;
        let phase = s.phase_delta.unwrap_or(0.0);
        match s.kind {
            ElementKind::Trwave => {
                let group: Vec<usize> = index
                    .traveling_waves()
                    .iter()
                    .find(|tw| tw.header == s.line)
                    .map(|tw| std::iter::once(tw.header).chain(tw.sub_records.clone()).collect())
                    .unwrap_or_else(|| vec![s.line]);
                for line in group {
                    changed += perturb_rf(doc, line, phase, s.amplitude_fraction)?;
                }
            }
            ElementKind::Cell => changed += perturb_rf(doc, s.line, phase, s.amplitude_fraction)?,
            ElementKind::Steerer => {
                changed += scale_fields(doc, s.line, &[PHASE_FIELD, AMPLITUDE_FIELD], scale, s)?
            }
            ElementKind::Quad | ElementKind::Solenoid | ElementKind::Bend => {
                changed += scale_fields(doc, s.line, &[PHASE_FIELD], scale, s)?
            }
            ElementKind::Drift => {}
        }
    }
    Ok(changed)
}

fn perturb_rf(doc: &mut LatticeDocument, line: usize, phase: f64, fraction: f64) -> BfResult<usize> {
    let mut updates = Vec::with_capacity(2);
    let (Ok(p), Ok(a)) = (
        doc.field_value(line, PHASE_FIELD),
        doc.field_value(line, AMPLITUDE_FIELD),
    ) else {
        warn!("Line {}: RF record lacks numeric phase/amplitude, not perturbed", line + 1);
        return Ok(0);
    };
    if phase != 0.0 {
        updates.push((PHASE_FIELD, p + phase));
    }
    if fraction != 0.0 {
        updates.push((AMPLITUDE_FIELD, a * (1.0 + fraction)));
    }
    if updates.is_empty() {
        return Ok(0);
    }
    doc.write_fields(line, &updates)?;
    Ok(1)
}

fn scale_fields(
    doc: &mut LatticeDocument,
    line: usize,
    fields: &[usize],
    scale: f64,
    sample: &PerturbationSample,
) -> BfResult<usize> {
    if sample.amplitude_fraction == 0.0 {
        return Ok(0);
    }
    let mut updates = Vec::with_capacity(fields.len());
    for &f in fields {
        match doc.field_value(line, f) {
            Ok(v) => updates.push((f, v * scale)),
            Err(e) => {
                warn!("{} not perturbed: {}", sample.kind, e);
                return Ok(0);
            }
        }
    }
    doc.write_fields(line, &updates)?;
    Ok(1)
}
