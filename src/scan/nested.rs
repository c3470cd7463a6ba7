//! Two-level sweep driven by directives embedded in the lattice.
//!
//! ```text
//! !@var 1 <name> <step> <from> <to>
//! !@subs <count> <field> <name> [<field> <name>] [element <n>]
//! ```
//!
//! `!@var` declares a variable; a second token other than `1` disables it.
//! `!@subs` writes a variable into `field` of the next `count` records. A name
//! written `-<name>` receives the negated value. The trailing `element <n>`
//! pair is informational.
//!
//! For every outer step the inner variable sweeps its whole range and the
//! value with the smallest column minimum is written back before the next
//! outer step.

use crate::error::{BeamError, BfResult};
use crate::lattice::LatticeDocument;
use crate::simulator::table::TitledTable;
use crate::simulator::Evaluator;
use std::path::Path;
use tracing::{info, warn};

pub const VAR_DIRECTIVE: &str = "!@var";
pub const SUBS_DIRECTIVE: &str = "!@subs";

/// Column minimized when none is given.
pub const DEFAULT_SWEEP_COLUMN: &str = "Xn(mm-mrad)";

#[derive(Debug, Clone, PartialEq)]
pub struct ScanVariable {
    pub name: String,
    pub step: f64,
    pub from: f64,
    pub to: f64,
}

impl ScanVariable {
    /// `from, from + step, ...` up to and including `to`.
    pub fn values(&self) -> Vec<f64> {
        let n = ((self.to - self.from) / self.step + 1e-9).floor() as usize;
        (0..=n).map(|i| self.from + i as f64 * self.step).collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Target {
    field: usize,
    name: String,
    negate: bool,
}

/// One `!@subs` directive and the record lines it rewrites.
#[derive(Debug, Clone, PartialEq)]
pub struct Substitution {
    pub line: usize,
    pub records: Vec<usize>,
    targets: Vec<Target>,
}

#[derive(Debug, Clone, Default)]
pub struct Directives {
    variables: Vec<ScanVariable>,
    substitutions: Vec<Substitution>,
}

fn number(tokens: &[&str], i: usize, pos: usize) -> BfResult<f64> {
    tokens
        .get(i)
        .and_then(|t| t.parse::<f64>().ok())
        .ok_or_else(|| {
            BeamError::Lattice(format!(
                "Line {}: directive field {} is missing or not numeric",
                pos + 1,
                i
            ))
        })
}

fn index(tokens: &[&str], i: usize, pos: usize) -> BfResult<usize> {
    tokens
        .get(i)
        .and_then(|t| t.parse::<usize>().ok())
        .ok_or_else(|| {
            BeamError::Lattice(format!(
                "Line {}: directive field {} is missing or not a count",
                pos + 1,
                i
            ))
        })
}

impl Directives {
    pub fn parse(doc: &LatticeDocument) -> BfResult<Self> {
        let mut out = Self::default();
        let lines = doc.lines();
        for (pos, line) in lines.iter().enumerate() {
            let tokens: Vec<&str> = line.raw().split_whitespace().collect();
            match tokens.first().copied() {
                Some(VAR_DIRECTIVE) => {
                    if tokens.get(1) != Some(&"1") {
                        continue;
                    }
                    let name = tokens.get(2).ok_or_else(|| {
                        BeamError::Lattice(format!("Line {}: variable has no name", pos + 1))
                    })?;
                    let var = ScanVariable {
                        name: name.to_string(),
                        step: number(&tokens, 3, pos)?,
                        from: number(&tokens, 4, pos)?,
                        to: number(&tokens, 5, pos)?,
                    };
                    if var.step.is_nan() || var.step <= 0.0 || var.to < var.from {
                        return Err(BeamError::Lattice(format!(
                            "Line {}: variable '{}' needs step > 0 and from <= to",
                            pos + 1,
                            var.name
                        )));
                    }
                    out.variables.push(var);
                }
                Some(SUBS_DIRECTIVE) => {
                    let count = index(&tokens, 1, pos)?;
                    let mut targets = Vec::new();
                    let mut i = 2;
                    while i + 1 < tokens.len() && tokens[i] != "element" {
                        let field = index(&tokens, i, pos)?;
                        let raw = tokens[i + 1];
                        let (name, negate) = match raw.strip_prefix('-') {
                            Some(n) => (n, true),
                            None => (raw, false),
                        };
                        targets.push(Target {
                            field,
                            name: name.to_string(),
                            negate,
                        });
                        i += 2;
                    }
                    if targets.is_empty() {
                        return Err(BeamError::Lattice(format!(
                            "Line {}: substitution names no variable",
                            pos + 1
                        )));
                    }

                    let records: Vec<usize> = (pos + 1..lines.len())
                        .filter(|&p| !lines[p].is_blank() && !lines[p].is_comment())
                        .take(count)
                        .collect();
                    if records.len() < count {
                        return Err(BeamError::Lattice(format!(
                            "Line {}: substitution expects {} records, {} follow",
                            pos + 1,
                            count,
                            records.len()
                        )));
                    }
                    for t in &targets {
                        for &r in &records {
                            if t.field == 0 || t.field >= lines[r].fields().len() {
                                return Err(BeamError::Lattice(format!(
                                    "Line {}: cannot substitute field {} of \"{}\"",
                                    r + 1,
                                    t.field,
                                    lines[r].raw().trim()
                                )));
                            }
                        }
                    }
                    out.substitutions.push(Substitution {
                        line: pos,
                        records,
                        targets,
                    });
                }
                _ => {}
            }
        }
        Ok(out)
    }

    pub fn variables(&self) -> &[ScanVariable] {
        &self.variables
    }

    pub fn substitutions(&self) -> &[Substitution] {
        &self.substitutions
    }

    pub fn variable(&self, name: &str) -> BfResult<&ScanVariable> {
        self.variables
            .iter()
            .find(|v| v.name == name)
            .ok_or_else(|| {
                BeamError::Config(format!("No enabled '{}' {} directive", name, VAR_DIRECTIVE))
            })
    }

    pub fn is_substituted(&self, name: &str) -> bool {
        self.substitutions
            .iter()
            .any(|s| s.targets.iter().any(|t| t.name == name))
    }

    /// Writes `value` everywhere `name` is substituted; returns the number of
    /// fields written.
    pub fn apply(&self, doc: &mut LatticeDocument, name: &str, value: f64) -> BfResult<usize> {
        let mut written = 0;
        for sub in &self.substitutions {
            for t in sub.targets.iter().filter(|t| t.name == name) {
                let v = if t.negate { -value } else { value };
                for &r in &sub.records {
                    doc.write_fields(r, &[(t.field, v)])?;
                    written += 1;
                }
            }
        }
        Ok(written)
    }
}

#[derive(Debug, Clone)]
pub struct NestedPlan {
    /// Variables stepped together on the outer loop.
    pub outer: Vec<String>,
    pub inner: String,
    /// Table column whose minimum over all rows scores a run.
    pub column: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NestedStep {
    pub outer: Vec<f64>,
    /// Inner value with the smallest column minimum and that minimum;
    /// `None` when no inner run produced a readable table.
    pub best: Option<(f64, f64)>,
    pub runs: usize,
}

fn column_minimum(path: &Path, column: &str) -> BfResult<f64> {
    let table = TitledTable::load(path)?;
    let values = table.column(column).ok_or_else(|| {
        BeamError::Config(format!("Column '{}' not found in {:?}", column, path))
    })?;
    values
        .into_iter()
        .filter(|v| v.is_finite())
        .min_by(f64::total_cmp)
        .ok_or_else(|| BeamError::TableParse(format!("{:?} has no rows", path)))
}

pub fn run_nested_scan(
    evaluator: &Evaluator<'_>,
    doc: &mut LatticeDocument,
    directives: &Directives,
    plan: &NestedPlan,
) -> BfResult<Vec<NestedStep>> {
    if plan.outer.is_empty() {
        return Err(BeamError::Config("nested scan needs an outer variable".to_string()));
    }
    let inner = directives.variable(&plan.inner)?;
    let inner_values = inner.values();
    let outer: Vec<(&str, Vec<f64>)> = plan
        .outer
        .iter()
        .map(|name| Ok((name.as_str(), directives.variable(name)?.values())))
        .collect::<BfResult<_>>()?;
    let steps = outer[0].1.len();
    if let Some((name, values)) = outer.iter().find(|(_, v)| v.len() != steps) {
        return Err(BeamError::Config(format!(
            "outer variable '{}' has {} steps, '{}' has {}",
            name,
            values.len(),
            outer[0].0,
            steps
        )));
    }
    for name in plan.outer.iter().chain(std::iter::once(&plan.inner)) {
        if !directives.is_substituted(name) {
            return Err(BeamError::Config(format!(
                "variable '{}' is not substituted anywhere",
                name
            )));
        }
    }

    let mut results = Vec::with_capacity(steps);
    for k in 0..steps {
        let mut outer_values = Vec::with_capacity(outer.len());
        for (name, values) in &outer {
            directives.apply(doc, name, values[k])?;
            outer_values.push(values[k]);
        }
        info!("🔁 Outer step {}/{}: {:?}", k + 1, steps, outer_values);

        let mut best: Option<(f64, f64)> = None;
        for &value in &inner_values {
            directives.apply(doc, &plan.inner, value)?;
            evaluator.run(doc)?;
            match column_minimum(&evaluator.table_path(), &plan.column) {
                Ok(m) => {
                    info!("   {} = {} -> {} = {:.6e}", plan.inner, value, plan.column, m);
                    if best.map_or(true, |(_, b)| m < b) {
                        best = Some((value, m));
                    }
                }
                Err(e) if e.is_recoverable() => warn!("   {} = {}: {}", plan.inner, value, e),
                Err(e) => return Err(e),
            }
        }

        match best {
            Some((value, metric)) => {
                info!("   Best {} = {} ({} = {:.6e})", plan.inner, value, plan.column, metric);
                directives.apply(doc, &plan.inner, value)?;
            }
            None => warn!("   No readable table for outer step {}", k + 1),
        }
        results.push(NestedStep {
            outer: outer_values,
            best,
            runs: inner_values.len(),
        });
    }
    Ok(results)
}

/// Comma-separated: outer values, best inner value, column minimum.
pub fn write_nested(path: &Path, plan: &NestedPlan, steps: &[NestedStep]) -> BfResult<()> {
    let mut writer = csv::Writer::from_path(path)?;
    let mut header: Vec<&str> = plan.outer.iter().map(String::as_str).collect();
    header.push(&plan.inner);
    header.push(&plan.column);
    writer.write_record(&header)?;
    for step in steps {
        let mut record: Vec<String> = step.outer.iter().map(|v| v.to_string()).collect();
        match step.best {
            Some((value, metric)) => {
                record.push(value.to_string());
                record.push(metric.to_string());
            }
            None => {
                record.push(String::new());
                record.push(String::new());
            }
        }
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIRECTIVES: &str = "title\n\
!@var 1 len 1.0 1.0 3.0\n\
!@var 1 field 100.0 1000.0 1200.0\n\
!@var 0 unused 1.0 0.0 1.0\n\
!@subs 1 4 len 5 -len element 1\n\
cell 3.5 1.0 1 120.0 30.0 0.0\n\
!@subs 2 4 field\n\
solenoid 5 3 0 1000\n\
\n\
solenoid 5 3 0 1000\n\
zout\n";

    #[test]
    fn test_parse_reads_enabled_variables_and_targets() {
        let doc = LatticeDocument::parse(DIRECTIVES);
        let d = Directives::parse(&doc).unwrap();

        let names: Vec<&str> = d.variables().iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["len", "field"]);
        assert_eq!(d.variable("field").unwrap().values(), vec![1000.0, 1100.0, 1200.0]);
        assert!(matches!(d.variable("unused"), Err(BeamError::Config(_))));

        assert_eq!(d.substitutions().len(), 2);
        assert_eq!(d.substitutions()[0].records, vec![5]);
        // The blank line between the solenoids is not a record.
        assert_eq!(d.substitutions()[1].records, vec![7, 9]);
    }

    #[test]
    fn test_apply_negates_prefixed_targets() {
        let mut doc = LatticeDocument::parse(DIRECTIVES);
        let d = Directives::parse(&doc).unwrap();

        assert_eq!(d.apply(&mut doc, "len", 2.5).unwrap(), 2);
        assert_eq!(doc.field_value(5, 4).unwrap(), 2.5);
        assert_eq!(doc.field_value(5, 5).unwrap(), -2.5);

        assert_eq!(d.apply(&mut doc, "field", 1150.0).unwrap(), 2);
        assert_eq!(doc.field_value(7, 4).unwrap(), 1150.0);
        assert_eq!(doc.field_value(9, 4).unwrap(), 1150.0);
        assert_eq!(d.apply(&mut doc, "nothing", 1.0).unwrap(), 0);
    }

    #[test]
    fn test_parse_rejects_short_or_bad_directives() {
        let missing = LatticeDocument::parse("!@subs 3 4 x\nquad 10 2 0 300\n");
        assert!(matches!(Directives::parse(&missing), Err(BeamError::Lattice(_))));

        let wide = LatticeDocument::parse("!@subs 1 9 x\nquad 10 2 0 300\n");
        assert!(Directives::parse(&wide).is_err());

        let backwards = LatticeDocument::parse("!@var 1 x 1.0 5.0 2.0\n");
        assert!(Directives::parse(&backwards).is_err());
    }

    #[test]
    fn test_values_tolerate_rounding() {
        let v = ScanVariable {
            name: "x".into(),
            step: 0.1,
            from: 0.0,
            to: 0.3,
        };
        assert_eq!(v.values().len(), 4);
    }
}
