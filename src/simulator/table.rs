//! Readers for the simulator's output tables.
//!
//! Two layouts are supported: the plain time-step table whose summary rows sit
//! at fixed offsets from the end of the file, and the titled layout
//! (`TITLES` ... `ENDTITLES`, then `DATA`) whose rows must match the header.

use crate::error::{BeamError, BfResult};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// A fixed row (counted from the end of the file) and the columns to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableProbe {
    pub row_from_end: usize,
    pub columns: &'static [usize],
}

impl TableProbe {
    pub fn read<P: AsRef<Path>>(&self, path: P) -> BfResult<Vec<f64>> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            BeamError::TableParse(format!("Cannot read output table {:?}: {}", path, e))
        })?;
        self.parse(&text)
            .map_err(|e| BeamError::TableParse(format!("{:?}: {}", path, e)))
    }

    pub fn parse(&self, text: &str) -> Result<Vec<f64>, String> {
        let line = tail_line(text, self.row_from_end).ok_or_else(|| {
            format!("table has fewer than {} lines", self.row_from_end)
        })?;
        let cols: Vec<&str> = line.split_whitespace().collect();
        self.columns
            .iter()
            .map(|&c| {
                let token = cols
                    .get(c)
                    .ok_or_else(|| format!("row has {} columns, need column {}", cols.len(), c))?;
                token
                    .parse::<f64>()
                    .map_err(|_| format!("column {} ('{}') is not numeric", c, token))
            })
            .collect()
    }
}

/// The `n`-th line counted from the end (1 = last line).
pub fn tail_line(text: &str, n: usize) -> Option<&str> {
    if n == 0 {
        return None;
    }
    let lines: Vec<&str> = text.lines().collect();
    lines.len().checked_sub(n).map(|i| lines[i])
}

pub fn read_tail_line<P: AsRef<Path>>(path: P, n: usize) -> BfResult<String> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)
        .map_err(|e| BeamError::TableParse(format!("Cannot read {:?}: {}", path, e)))?;
    tail_line(&text, n)
        .map(|l| l.trim().to_string())
        .ok_or_else(|| BeamError::TableParse(format!("{:?} has fewer than {} lines", path, n)))
}

/// The preferred table inside `dir`, or else the first `*.tbl` file.
pub fn locate_table(dir: &Path, preferred: &str) -> Option<PathBuf> {
    let direct = dir.join(preferred);
    if direct.is_file() {
        return Some(direct);
    }

    let mut candidates: Vec<PathBuf> = fs::read_dir(dir)
        .ok()?
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "tbl"))
        .collect();
    candidates.sort();

    let fallback = candidates.into_iter().next()?;
    warn!(
        "{} not found in {:?}. Using {:?} instead.",
        preferred,
        dir,
        fallback.file_name().unwrap_or_default()
    );
    Some(fallback)
}

#[derive(Debug, Clone, Default)]
pub struct TitledTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<f64>>,
    pub rejected: usize,
}

impl TitledTable {
    pub fn load<P: AsRef<Path>>(path: P) -> BfResult<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| BeamError::TableParse(format!("Cannot read {:?}: {}", path, e)))?;
        Self::parse(&text).map_err(|e| match e {
            BeamError::TableParse(msg) => BeamError::TableParse(format!("{:?}: {}", path, msg)),
            other => other,
        })
    }

    pub fn parse(text: &str) -> BfResult<Self> {
        let mut headers = Vec::new();
        let mut in_titles = false;
        let mut lines = text.lines();

        let mut found_data = false;
        for line in lines.by_ref() {
            let clean = line.trim();
            match clean {
                "TITLES" => in_titles = true,
                "ENDTITLES" => in_titles = false,
                "DATA" => {
                    found_data = true;
                    break;
                }
                _ if in_titles => headers.push(clean.to_string()),
                _ => {}
            }
        }

        if !found_data {
            return Err(BeamError::TableParse("'DATA' keyword not found".to_string()));
        }

        if headers.is_empty() {
            let header_line = lines.next().unwrap_or_default();
            headers = header_line
                .trim()
                .trim_start_matches(';')
                .split_whitespace()
                .map(str::to_string)
                .collect();
        }

        if headers.is_empty() {
            return Err(BeamError::TableParse("table declares no columns".to_string()));
        }

        let mut rows = Vec::new();
        let mut rejected = 0;
        for line in lines {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.is_empty() {
                continue;
            }
            let parsed: Option<Vec<f64>> = if parts.len() == headers.len() {
                parts.iter().map(|p| p.parse::<f64>().ok()).collect()
            } else {
                None
            };
            match parsed {
                Some(row) => rows.push(row),
                None => rejected += 1,
            }
        }

        Ok(Self {
            headers,
            rows,
            rejected,
        })
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    pub fn column(&self, name: &str) -> Option<Vec<f64>> {
        let idx = self.column_index(name)?;
        Some(self.rows.iter().map(|r| r[idx]).collect())
    }
}
