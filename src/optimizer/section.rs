//! Sequential per-section tuning.
//!
//! Each knob walks `Seed -> Search` for every axis in order, then a
//! `FinalCheck` evaluation with all found values, then `Committed`. In
//! multi-section mode the previously solved section is masked out (all but
//! its own knob) and the lattice is truncated right after the current span.

use super::{SearchStrategy, Termination};
use crate::error::{BeamError, BfResult};
use crate::lattice::{Axis, Knob, KnobKind, LatticeDocument, LatticeIndex, MaskCategory, Section};
use crate::simulator::{Evaluator, Observable};
use std::collections::BTreeSet;
use std::fmt;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionState {
    Seed(Axis),
    Search(Axis),
    FinalCheck,
    Committed,
}

impl fmt::Display for SectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SectionState::Seed(axis) => write!(f, "Seed{}", axis),
            SectionState::Search(axis) => write!(f, "Search{}", axis),
            SectionState::FinalCheck => write!(f, "FinalCheck"),
            SectionState::Committed => write!(f, "Committed"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AxisResult {
    pub axis: Axis,
    pub original: f64,
    pub value: f64,
    pub metric: Option<f64>,
    pub evaluations: usize,
    pub termination: Termination,
}

#[derive(Debug, Clone)]
pub struct SectionReport {
    pub section: usize,
    pub knob: Knob,
    pub axes: Vec<AxisResult>,
    /// Observable after `FinalCheck`; `None` if that run produced no table.
    pub final_metrics: Option<Vec<f64>>,
}

#[derive(Debug, Clone)]
pub struct SequenceReport {
    pub sections: Vec<SectionReport>,
    /// Observable of the last full, unmasked run.
    pub final_metrics: Option<Vec<f64>>,
}

/// Owns the working copy of the lattice for one tuning session.
pub struct SectionDriver<'a> {
    evaluator: Evaluator<'a>,
    doc: LatticeDocument,
    index: LatticeIndex,
    observable: Observable,
    strategy: SearchStrategy,
}

impl<'a> SectionDriver<'a> {
    pub fn new(
        evaluator: Evaluator<'a>,
        doc: LatticeDocument,
        observable: Observable,
        strategy: SearchStrategy,
    ) -> Self {
        let index = LatticeIndex::build(&doc);
        Self {
            evaluator,
            doc,
            index,
            observable,
            strategy,
        }
    }

    pub fn with_index(mut self, index: LatticeIndex) -> Self {
        self.index = index;
        self
    }

    pub fn index(&self) -> &LatticeIndex {
        &self.index
    }

    pub fn document(&self) -> &LatticeDocument {
        &self.doc
    }

    pub fn into_document(self) -> LatticeDocument {
        self.doc
    }

    /// Tunes knob number `sect` of `kind` against the full lattice.
    pub fn run_single(&mut self, kind: KnobKind, sect: usize) -> BfResult<SectionReport> {
        let knob = self.index.knob(kind, sect)?;
        info!("🎯 Tuning {:?} #{} (line {})", kind, sect, knob.line() + 1);
        self.tune(sect, &knob)
    }

    /// Tunes every section from `start` onwards, then restores the full
    /// lattice and runs it once more.
    pub fn run_sections(&mut self, kind: KnobKind, start: usize) -> BfResult<SequenceReport> {
        let sections = self.index.sections(kind)?;
        if start >= sections.len() {
            return Err(BeamError::Lattice(format!(
                "Start section {} out of range ({} sections)",
                start,
                sections.len()
            )));
        }

        let mut reports = Vec::with_capacity(sections.len() - start);
        for k in start..sections.len() {
            self.isolate(&sections, start, k);
            let section = &sections[k];
            info!(
                "🎯 Section {} (lines {}..{}), knob at line {}",
                k,
                section.span.start + 1,
                section.span.end,
                section.knob.line() + 1
            );
            reports.push(self.tune(k, &section.knob)?);
        }

        self.doc.remove_stop_markers();
        let restored = self.doc.unmask(&MaskCategory::ALL);
        debug!("Restored {} masked lines", restored);

        info!("🏁 Final run on the complete lattice");
        let final_metrics = self.evaluate_tolerant()?;
        Ok(SequenceReport {
            sections: reports,
            final_metrics,
        })
    }

    /// Masks section `k - 1` (except its knob) and truncates after section `k`.
    fn isolate(&mut self, sections: &[Section], start: usize, k: usize) {
        self.doc.remove_stop_markers();
        if k > start {
            let prev = &sections[k - 1];
            let keep: BTreeSet<usize> = prev.knob.lines().into_iter().collect();
            let masked = self.doc.mask_range(prev.span.start, prev.span.end, &keep);
            debug!("Masked {} lines of section {}", masked, k - 1);
        }
        if k + 1 < sections.len() {
            self.doc.insert_stop_marker(sections[k].span.end - 1);
        }
    }

    /// Runs the per-axis state machine for one knob.
    pub fn tune(&mut self, section: usize, knob: &Knob) -> BfResult<SectionReport> {
        let axes = knob.axes();
        let originals = axes
            .iter()
            .map(|&a| knob.read(&self.doc, a))
            .collect::<BfResult<Vec<f64>>>()?;
        let mut found = originals.clone();
        let mut results: Vec<AxisResult> = Vec::with_capacity(axes.len());
        let mut final_metrics = None;

        let mut state = SectionState::Seed(axes[0]);
        loop {
            debug!("Section {}: {}", section, state);
            state = match state {
                SectionState::Seed(axis) => {
                    let slot = axis_slot(axes, axis);
                    // Later axes stay at their original values while this one is searched.
                    for (i, &other) in axes.iter().enumerate().skip(slot) {
                        knob.write(&mut self.doc, other, originals[i])?;
                    }
                    SectionState::Search(axis)
                }
                SectionState::Search(axis) => {
                    let slot = axis_slot(axes, axis);
                    let result = self.search_axis(knob, axis, slot, originals[slot])?;
                    found[slot] = result.value;
                    knob.write(&mut self.doc, axis, result.value)?;
                    results.push(result);
                    match axes.get(slot + 1) {
                        Some(&next) => SectionState::Seed(next),
                        None => SectionState::FinalCheck,
                    }
                }
                SectionState::FinalCheck => {
                    for (&axis, &value) in axes.iter().zip(&found) {
                        knob.write(&mut self.doc, axis, value)?;
                    }
                    final_metrics = self.evaluate_tolerant()?;
                    SectionState::Committed
                }
                SectionState::Committed => {
                    for line in knob.lines() {
                        self.doc.unmask_line(line);
                    }
                    break;
                }
            };
        }

        for r in &results {
            info!(
                "   ✅ {} = {:.6} (was {:.6}), metric {:?}",
                r.axis, r.value, r.original, r.metric
            );
        }

        Ok(SectionReport {
            section,
            knob: knob.clone(),
            axes: results,
            final_metrics,
        })
    }

    fn search_axis(
        &mut self,
        knob: &Knob,
        axis: Axis,
        slot: usize,
        original: f64,
    ) -> BfResult<AxisResult> {
        let doc = &mut self.doc;
        let evaluator = &self.evaluator;
        let observable = self.observable;

        info!("   Searching {} from {:.6}", axis, original);
        let outcome = self.strategy.search(original, |value| {
            knob.write(doc, axis, value)?;
            let metrics = evaluator.evaluate(doc, observable)?;
            metrics.get(slot).copied().ok_or_else(|| {
                BeamError::TableParse(format!("No {} metric in output", axis))
            })
        })?;

        let (value, metric) = match outcome.best {
            Some(p) => (p.value, Some(p.metric)),
            None => {
                warn!("No usable evaluation for {}; keeping {}", axis, original);
                (original, None)
            }
        };

        Ok(AxisResult {
            axis,
            original,
            value,
            metric,
            evaluations: outcome.evaluations,
            termination: outcome.termination,
        })
    }

    fn evaluate_tolerant(&self) -> BfResult<Option<Vec<f64>>> {
        match self.evaluator.evaluate(&self.doc, self.observable) {
            Ok(m) => Ok(Some(m)),
            Err(e) if e.is_recoverable() => {
                warn!("Final check produced no metrics: {}", e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

fn axis_slot(axes: &[Axis], axis: Axis) -> usize {
    axes.iter().position(|&a| a == axis).unwrap_or(0)
}
