//! Combining per-trial output tables into batch-level files.

use crate::error::{BeamError, BfResult};
use crate::simulator::table::{read_tail_line, TitledTable};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

pub const AGGREGATE_HEADER: &str = "T(deg) Z(cm) Xun(mm-mrad) Yun(mm-mrad) Zun(mm-mrad) \
Xn(mm-mrad) Yn(mm-mrad) Zn(mm-mrad) Xrms(mm) Yrms(mm) Zrmz(mm) <kE>(MeV) Del-Erms \
<X>(mm) <Xpn>(mrad) <Y>(mm) <Ypn>(mrad) <Z>(cm) <Zpn>(rad) EZref(MV/m)";

/// Summary row of each trial, counted from the end of its table.
pub const RESULT_ROW_FROM_END: usize = 3;

const TRACE_Z: &str = "Z(cm)";
const TRACE_X: &str = "<X>(mm)";
const TRACE_Y: &str = "<Y>(mm)";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultRow {
    /// 1-based trial number.
    pub trial: usize,
    pub line: String,
    pub values: Vec<f64>,
}

impl ResultRow {
    pub fn read(trial: usize, table: &Path) -> BfResult<Self> {
        let line = read_tail_line(table, RESULT_ROW_FROM_END)?;
        let values = line
            .split_whitespace()
            .map(|t| t.parse::<f64>())
            .collect::<Result<Vec<f64>, _>>()
            .map_err(|e| {
                BeamError::TableParse(format!(
                    "{:?}: summary row is not numeric ({})",
                    table, e
                ))
            })?;
        Ok(Self {
            trial,
            line,
            values,
        })
    }
}

/// Reads the summary row of every trial that produced a table.
/// Index `i` of the result belongs to trial `i + 1`.
pub fn collect_rows(outputs: &[Option<PathBuf>]) -> Vec<Option<ResultRow>> {
    outputs
        .iter()
        .enumerate()
        .map(|(i, out)| {
            let path = out.as_ref()?;
            match ResultRow::read(i + 1, path) {
                Ok(row) => Some(row),
                Err(e) => {
                    warn!("Trial {}: {}", i + 1, e);
                    None
                }
            }
        })
        .collect()
}

/// Header line followed by one line per completed trial, in trial order.
pub fn write_results(path: &Path, rows: &[Option<ResultRow>]) -> BfResult<()> {
    let mut out = String::with_capacity(AGGREGATE_HEADER.len() + 1);
    out.push_str(AGGREGATE_HEADER);
    out.push('\n');
    for row in rows.iter().flatten() {
        out.push_str(&row.line);
        out.push('\n');
    }
    fs::write(path, out)?;
    Ok(())
}

/// Wide tab-separated table: `Z`, `<X>`, `<Y>` of the first readable trial,
/// then `<X>`, `<Y>` of every other one. Returns the number of trials included.
pub fn write_orbit_traces(path: &Path, outputs: &[Option<PathBuf>]) -> BfResult<usize> {
    let mut headers: Vec<String> = Vec::new();
    let mut columns: Vec<Vec<f64>> = Vec::new();
    let mut included = 0;

    for (i, out) in outputs.iter().enumerate() {
        let Some(table_path) = out else { continue };
        let trial = i + 1;
        let table = match TitledTable::load(table_path) {
            Ok(t) => t,
            Err(e) => {
                warn!("Trial {}: orbit trace skipped: {}", trial, e);
                continue;
            }
        };
        let (Some(x), Some(y)) = (table.column(TRACE_X), table.column(TRACE_Y)) else {
            warn!("Trial {}: table lacks {} / {} columns", trial, TRACE_X, TRACE_Y);
            continue;
        };
        if columns.is_empty() {
            let Some(z) = table.column(TRACE_Z) else {
                warn!("Trial {}: table lacks a {} column", trial, TRACE_Z);
                continue;
            };
            headers.push(format!("{}_{}", TRACE_Z, trial));
            columns.push(z);
        }
        headers.push(format!("{}_{}", TRACE_X, trial));
        headers.push(format!("{}_{}", TRACE_Y, trial));
        columns.push(x);
        columns.push(y);
        included += 1;
    }

    if included == 0 {
        return Ok(0);
    }

    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(path)?;
    writer.write_record(&headers)?;
    let rows = columns.iter().map(Vec::len).max().unwrap_or(0);
    for r in 0..rows {
        let record: Vec<String> = columns
            .iter()
            .map(|c| c.get(r).map(|v| v.to_string()).unwrap_or_default())
            .collect();
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(included)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnStats {
    pub name: String,
    pub count: usize,
    pub mean: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
}

/// Per-column mean and sample standard deviation over the completed rows.
pub fn column_stats(rows: &[Option<ResultRow>]) -> Vec<ColumnStats> {
    AGGREGATE_HEADER
        .split_whitespace()
        .enumerate()
        .filter_map(|(c, name)| {
            let values: Vec<f64> = rows
                .iter()
                .flatten()
                .filter_map(|r| r.values.get(c).copied())
                .collect();
            if values.is_empty() {
                return None;
            }
            let n = values.len() as f64;
            let mean = values.iter().sum::<f64>() / n;
            let var = if values.len() > 1 {
                values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)
            } else {
                0.0
            };
            Some(ColumnStats {
                name: name.to_string(),
                count: values.len(),
                mean,
                std_dev: var.sqrt(),
                min: values.iter().copied().fold(f64::INFINITY, f64::min),
                max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            })
        })
        .collect()
}
