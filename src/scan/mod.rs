//! Parameter sweeps: a one-dimensional field scan, and a nested scan driven by
//! directives embedded in the lattice ([`nested`]).

pub mod nested;

use crate::error::{BeamError, BfResult};
use crate::lattice::{ElementKind, LatticeDocument, LatticeIndex};
use crate::simulator::table::read_tail_line;
use crate::simulator::Evaluator;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct ScanPlan {
    pub kind: ElementKind,
    /// Which record of `kind` (0-based).
    pub index: usize,
    pub field: usize,
    pub start: f64,
    pub step: f64,
    pub steps: usize,
    /// Output row to record, counted from the end of the table.
    pub row_from_end: usize,
}

impl ScanPlan {
    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        (0..self.steps).map(move |i| self.start + i as f64 * self.step)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScanPoint {
    pub value: f64,
    /// `None` when the run produced no readable table.
    pub row: Option<String>,
}

pub fn run_scan(
    evaluator: &Evaluator<'_>,
    doc: &mut LatticeDocument,
    index: &LatticeIndex,
    plan: &ScanPlan,
) -> BfResult<Vec<ScanPoint>> {
    let records = index.find(plan.kind)?;
    let line = *records.get(plan.index).ok_or_else(|| {
        BeamError::Lattice(format!(
            "{} record {} not found ({} available)",
            plan.kind,
            plan.index,
            records.len()
        ))
    })?;
    // Fail before the first run if the field cannot be written.
    doc.field_value(line, plan.field)?;

    let mut points = Vec::with_capacity(plan.steps);
    for (i, value) in plan.values().enumerate() {
        doc.write_fields(line, &[(plan.field, value)])?;
        evaluator.run(doc)?;
        let row = match read_tail_line(evaluator.table_path(), plan.row_from_end) {
            Ok(r) => Some(r),
            Err(e) => {
                warn!("Scan point {} ({}): {}", i, value, e);
                None
            }
        };
        info!("   [{}/{}] {} = {}", i + 1, plan.steps, plan.kind, value);
        points.push(ScanPoint { value, row });
    }
    Ok(points)
}

/// `value<TAB>row` per point; failed points are omitted.
pub fn write_scan(path: &Path, points: &[ScanPoint]) -> BfResult<()> {
    let mut out = String::new();
    for p in points {
        if let Some(row) = &p.row {
            let _ = writeln!(out, "{}\t{}", p.value, row);
        }
    }
    fs::write(path, out)?;
    Ok(())
}
