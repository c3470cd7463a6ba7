//! Line-oriented lattice model.
//!
//! A lattice file is kept as an ordered list of parsed lines. Element records
//! carry typed fields and are re-serialized only when touched, so untouched
//! lines round-trip byte for byte. Line positions never shift during a session:
//! masking is a per-line flag and inserted stop markers are rendered at save
//! time instead of being spliced into the line list.

pub mod mask;

use crate::error::{BeamError, BfResult};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::ops::Range;
use std::path::Path;
use std::str::FromStr;
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter, EnumString};

pub use self::mask::MaskCategory;

/// Field index holding the phase (RF) or first amplitude (magnets).
pub const PHASE_FIELD: usize = 4;
/// Field index holding the amplitude (RF) or second amplitude (steerers).
pub const AMPLITUDE_FIELD: usize = 5;
/// RF cell headers store the phase shifted by this many degrees.
pub const CELL_PHASE_OFFSET: f64 = 90.0;
pub const COMMENT_PREFIX: char = '!';
pub const DEFAULT_SECTION_MARKER: &str = "!cor";
pub const STOP_DIRECTIVE: &str = "end";

#[derive(Debug, Clone, Copy, EnumIter, EnumString, Display, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ElementKind {
    Steerer,
    Quad,
    Solenoid,
    Cell,
    Trwave,
    Bend,
    Drift,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub text: String,
    pub value: Option<f64>,
}

impl Field {
    fn parse(token: &str) -> Self {
        Self {
            text: token.to_string(),
            value: token.parse::<f64>().ok(),
        }
    }

    fn number(value: f64) -> Self {
        Self {
            text: format_value(value),
            value: Some(value),
        }
    }
}

/// Shortest representation that still reads back as a float (`1.0`, not `1`).
pub fn format_value(value: f64) -> String {
    format!("{:?}", value)
}

#[derive(Debug, Clone)]
pub struct LatticeLine {
    raw: String,
    fields: Vec<Field>,
    kind: Option<ElementKind>,
    category: Option<MaskCategory>,
    masked: bool,
    dirty: bool,
}

impl LatticeLine {
    fn parse(raw: &str) -> Self {
        let raw = raw.trim_end_matches(['\r', '\n']).to_string();
        let trimmed = raw.trim_start();
        let (fields, kind, category) = if trimmed.is_empty() || trimmed.starts_with(COMMENT_PREFIX) {
            (Vec::new(), None, None)
        } else {
            let fields: Vec<Field> = trimmed.split_whitespace().map(Field::parse).collect();
            let keyword = fields[0].text.as_str();
            let kind = ElementKind::from_str(keyword).ok();
            let category = Some(MaskCategory::of_keyword(keyword));
            (fields, kind, category)
        };

        Self {
            raw,
            fields,
            kind,
            category,
            masked: false,
            dirty: false,
        }
    }

    pub fn kind(&self) -> Option<ElementKind> {
        self.kind
    }

    pub fn category(&self) -> Option<MaskCategory> {
        self.category
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// The line as read, without its line ending.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn is_masked(&self) -> bool {
        self.masked
    }

    pub fn is_blank(&self) -> bool {
        self.raw.trim().is_empty()
    }

    /// Comment lines written by the author (not lines masked by us).
    pub fn is_comment(&self) -> bool {
        self.raw.trim_start().starts_with(COMMENT_PREFIX)
    }

    pub fn starts_with_ignore_case(&self, prefix: &str) -> bool {
        let trimmed = self.raw.trim_start();
        trimmed.len() >= prefix.len()
            && trimmed.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
    }

    fn body(&self) -> String {
        if self.dirty {
            self.fields
                .iter()
                .map(|f| f.text.as_str())
                .collect::<Vec<_>>()
                .join(" ")
        } else {
            self.raw.clone()
        }
    }

    fn render(&self) -> String {
        if self.masked {
            format!("{}{}", COMMENT_PREFIX, self.body())
        } else {
            self.body()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LatticeDocument {
    lines: Vec<LatticeLine>,
    stop_markers: Vec<usize>,
}

impl LatticeDocument {
    pub fn parse(text: &str) -> Self {
        Self {
            lines: text.lines().map(LatticeLine::parse).collect(),
            stop_markers: Vec::new(),
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> BfResult<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            BeamError::Config(format!("Cannot read lattice file {:?}: {}", path, e))
        })?;
        Ok(Self::parse(&text))
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> BfResult<()> {
        fs::write(path, self.render())?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn line(&self, pos: usize) -> BfResult<&LatticeLine> {
        self.lines.get(pos).ok_or_else(|| {
            BeamError::Lattice(format!(
                "Line {} out of range (document has {} lines)",
                pos,
                self.lines.len()
            ))
        })
    }

    pub fn lines(&self) -> &[LatticeLine] {
        &self.lines
    }

    /// Whole document, one trailing newline per line, stop markers included.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (i, line) in self.lines.iter().enumerate() {
            let _ = writeln!(out, "{}", line.render());
            for _ in self.stop_markers.iter().filter(|&&m| m == i) {
                let _ = writeln!(out, "{}", STOP_DIRECTIVE);
            }
        }
        out
    }

    /// Ordered line positions of every active record whose keyword is `kind`.
    /// Masked records are skipped.
    pub fn find(&self, kind: ElementKind) -> Vec<usize> {
        self.lines
            .iter()
            .enumerate()
            .filter(|(_, l)| l.kind == Some(kind) && !l.masked)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn read_fields(&self, pos: usize) -> BfResult<&[Field]> {
        Ok(self.line(pos)?.fields())
    }

    pub fn field_value(&self, pos: usize, index: usize) -> BfResult<f64> {
        let line = self.line(pos)?;
        let field = line.fields.get(index).ok_or_else(|| malformed(pos, line, index))?;
        field.value.ok_or_else(|| {
            BeamError::Lattice(format!(
                "Line {}: field {} ('{}') is not numeric in \"{}\"",
                pos + 1,
                index,
                field.text,
                line.raw.trim()
            ))
        })
    }

    /// Replaces the given fields and marks the line for re-serialization.
    pub fn write_fields(&mut self, pos: usize, updates: &[(usize, f64)]) -> BfResult<()> {
        let len = self.lines.len();
        let line = self.lines.get_mut(pos).ok_or_else(|| {
            BeamError::Lattice(format!("Line {} out of range (document has {} lines)", pos, len))
        })?;
        if let Some(&(index, _)) = updates.iter().find(|(i, _)| *i >= line.fields.len()) {
            return Err(malformed(pos, line, index));
        }
        for &(index, value) in updates {
            line.fields[index] = Field::number(value);
        }
        if !updates.is_empty() {
            line.dirty = true;
        }
        Ok(())
    }
}

fn malformed(pos: usize, line: &LatticeLine, index: usize) -> BeamError {
    BeamError::Lattice(format!(
        "Line {}: record has {} fields, field {} required: \"{}\"",
        pos + 1,
        line.fields.len(),
        index,
        line.raw.trim()
    ))
}

/// A `cell` header followed by its contiguous `trwave` sub-records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TravelingWave {
    pub header: usize,
    pub sub_records: Range<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnobKind {
    Steerer,
    RfPhase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Axis {
    #[strum(serialize = "X")]
    X,
    #[strum(serialize = "Y")]
    Y,
    #[strum(serialize = "phase")]
    Phase,
}

/// The record (or record group) a tuning pass adjusts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Knob {
    Steerer { line: usize },
    RfPhase(TravelingWave),
}

impl Knob {
    pub fn axes(&self) -> &'static [Axis] {
        match self {
            Knob::Steerer { .. } => &[Axis::X, Axis::Y],
            Knob::RfPhase(_) => &[Axis::Phase],
        }
    }

    pub fn line(&self) -> usize {
        match self {
            Knob::Steerer { line } => *line,
            Knob::RfPhase(tw) => tw.header,
        }
    }

    /// Every line the knob writes to.
    pub fn lines(&self) -> Vec<usize> {
        match self {
            Knob::Steerer { line } => vec![*line],
            Knob::RfPhase(tw) => std::iter::once(tw.header)
                .chain(tw.sub_records.clone())
                .collect(),
        }
    }

    pub fn read(&self, doc: &LatticeDocument, axis: Axis) -> BfResult<f64> {
        match (self, axis) {
            (Knob::Steerer { line }, Axis::X) => doc.field_value(*line, PHASE_FIELD),
            (Knob::Steerer { line }, Axis::Y) => doc.field_value(*line, AMPLITUDE_FIELD),
            (Knob::RfPhase(tw), Axis::Phase) => {
                Ok(doc.field_value(tw.header, PHASE_FIELD)? - CELL_PHASE_OFFSET)
            }
            _ => Err(axis_mismatch(self, axis)),
        }
    }

    pub fn write(&self, doc: &mut LatticeDocument, axis: Axis, value: f64) -> BfResult<()> {
        match (self, axis) {
            (Knob::Steerer { line }, Axis::X) => doc.write_fields(*line, &[(PHASE_FIELD, value)]),
            (Knob::Steerer { line }, Axis::Y) => {
                doc.write_fields(*line, &[(AMPLITUDE_FIELD, value)])
            }
            (Knob::RfPhase(tw), Axis::Phase) => {
                doc.write_fields(tw.header, &[(PHASE_FIELD, value + CELL_PHASE_OFFSET)])?;
                for sub in tw.sub_records.clone() {
                    doc.write_fields(sub, &[(PHASE_FIELD, value)])?;
                }
                Ok(())
            }
            _ => Err(axis_mismatch(self, axis)),
        }
    }
}

fn axis_mismatch(knob: &Knob, axis: Axis) -> BeamError {
    BeamError::Lattice(format!("Axis {} does not apply to {:?}", axis, knob))
}

/// A beamline subdivision delimited by two section markers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub index: usize,
    pub span: Range<usize>,
    pub knob: Knob,
}

/// Immutable element index computed once from the clean lattice file.
#[derive(Debug, Clone)]
pub struct LatticeIndex {
    records: BTreeMap<ElementKind, Vec<usize>>,
    traveling_waves: Vec<TravelingWave>,
    markers: Vec<usize>,
    line_count: usize,
}

impl LatticeIndex {
    pub fn build(doc: &LatticeDocument) -> Self {
        Self::build_with_marker(doc, DEFAULT_SECTION_MARKER)
    }

    pub fn build_with_marker(doc: &LatticeDocument, marker: &str) -> Self {
        let mut records: BTreeMap<ElementKind, Vec<usize>> = BTreeMap::new();
        let mut traveling_waves = Vec::new();
        let mut markers = Vec::new();
        let lines = doc.lines();

        let mut i = 0;
        while i < lines.len() {
            let line = &lines[i];
            if line.is_comment() && line.starts_with_ignore_case(marker) {
                markers.push(i);
            }
            match line.kind() {
                Some(ElementKind::Cell) => {
                    let mut end = i + 1;
                    while end < lines.len() && lines[end].kind() == Some(ElementKind::Trwave) {
                        end += 1;
                    }
                    if end > i + 1 {
                        records.entry(ElementKind::Trwave).or_default().push(i);
                        traveling_waves.push(TravelingWave {
                            header: i,
                            sub_records: i + 1..end,
                        });
                        i = end;
                        continue;
                    }
                    records.entry(ElementKind::Cell).or_default().push(i);
                }
                Some(ElementKind::Trwave) => {}
                Some(kind) => records.entry(kind).or_default().push(i),
                None => {}
            }
            i += 1;
        }

        Self {
            records,
            traveling_waves,
            markers,
            line_count: doc.len(),
        }
    }

    /// Line positions for `kind`. `Cell` lists standalone cells only and
    /// `Trwave` lists the header line of every traveling-wave section.
    pub fn positions(&self, kind: ElementKind) -> &[usize] {
        self.records.get(&kind).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Like [`positions`](Self::positions), but an empty result is an error.
    pub fn find(&self, kind: ElementKind) -> BfResult<&[usize]> {
        let found = self.positions(kind);
        if found.is_empty() {
            return Err(BeamError::Lattice(format!("No '{}' records found", kind)));
        }
        Ok(found)
    }

    pub fn traveling_waves(&self) -> &[TravelingWave] {
        &self.traveling_waves
    }

    pub fn markers(&self) -> &[usize] {
        &self.markers
    }

    /// Record count per element kind, in declaration order, zeros omitted.
    pub fn summary(&self) -> Vec<(ElementKind, usize)> {
        ElementKind::iter()
            .map(|kind| (kind, self.positions(kind).len()))
            .filter(|&(_, n)| n > 0)
            .collect()
    }

    pub fn knob(&self, kind: KnobKind, sect: usize) -> BfResult<Knob> {
        match kind {
            KnobKind::Steerer => {
                let steerers = self.find(ElementKind::Steerer)?;
                steerers
                    .get(sect)
                    .map(|&line| Knob::Steerer { line })
                    .ok_or_else(|| out_of_range("steerer", sect, steerers.len()))
            }
            KnobKind::RfPhase => {
                if self.traveling_waves.is_empty() {
                    return Err(BeamError::Lattice(
                        "No cell/trwave sections found".to_string(),
                    ));
                }
                self.traveling_waves
                    .get(sect)
                    .cloned()
                    .map(Knob::RfPhase)
                    .ok_or_else(|| out_of_range("cell/trwave", sect, self.traveling_waves.len()))
            }
        }
    }

    /// Sections delimited by consecutive markers; the last one runs to the end
    /// of the file. Each section owns the first knob of `kind` inside its span.
    pub fn sections(&self, kind: KnobKind) -> BfResult<Vec<Section>> {
        if self.markers.is_empty() {
            return Err(BeamError::Lattice(
                "No section markers found in lattice file".to_string(),
            ));
        }

        let mut sections = Vec::with_capacity(self.markers.len());
        for (index, &start) in self.markers.iter().enumerate() {
            let end = self
                .markers
                .get(index + 1)
                .copied()
                .unwrap_or(self.line_count);
            let span = start..end;
            let knob = match kind {
                KnobKind::Steerer => self
                    .positions(ElementKind::Steerer)
                    .iter()
                    .find(|l| span.contains(l))
                    .map(|&line| Knob::Steerer { line }),
                KnobKind::RfPhase => self
                    .traveling_waves
                    .iter()
                    .find(|tw| span.contains(&tw.header))
                    .cloned()
                    .map(Knob::RfPhase),
            }
            .ok_or_else(|| {
                BeamError::Lattice(format!(
                    "Section {} (lines {}..{}) has no tunable record",
                    index,
                    start + 1,
                    end
                ))
            })?;
            sections.push(Section { index, span, knob });
        }
        Ok(sections)
    }
}

fn out_of_range(what: &str, sect: usize, count: usize) -> BeamError {
    BeamError::Lattice(format!(
        "{} section {} not found ({} available)",
        what, sect, count
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    const SAMPLE: &str = "title\n\
run 1 1 2856.0 1 1\n\
!cor 0\n\
drift 10 2 0\n\
steerer 5 2 0 1.5 -0.5\n\
quad 10 2 0 300\n\
!cor 1\n\
cell 3.5 1.0 1 120.0 30.0\n\
trwave 3.5 1.0 1 30.0 30.0\n\
trwave 3.5 1.0 1 30.0 30.0\n\
Steerer 5 2 0 0.0 0.0\n\
cell 2.0 1.0 1 10.0 5.0\n\
zout\n";

    #[test]
    fn test_index_groups_traveling_waves() {
        let doc = LatticeDocument::parse(SAMPLE);
        let index = LatticeIndex::build(&doc);

        assert_eq!(index.positions(ElementKind::Steerer), &[4, 10]);
        assert_eq!(index.positions(ElementKind::Trwave), &[7]);
        assert_eq!(index.positions(ElementKind::Cell), &[11]);
        assert_eq!(index.traveling_waves()[0].sub_records, 8..10);
        assert_eq!(index.markers(), &[2, 6]);
        assert_eq!(
            index.summary(),
            vec![
                (ElementKind::Steerer, 2),
                (ElementKind::Quad, 1),
                (ElementKind::Cell, 1),
                (ElementKind::Trwave, 1),
                (ElementKind::Drift, 1),
            ]
        );
    }

    #[test]
    fn test_find_skips_masked_records() {
        let mut doc = LatticeDocument::parse(SAMPLE);
        assert_eq!(doc.find(ElementKind::Steerer), vec![4, 10]);

        doc.mask_range(3, 6, &BTreeSet::new());
        assert_eq!(doc.find(ElementKind::Steerer), vec![10]);
        assert_eq!(doc.find(ElementKind::Quad), Vec::<usize>::new());

        doc.unmask_line(4);
        assert_eq!(doc.find(ElementKind::Steerer), vec![4, 10]);
    }

    #[test]
    fn test_untouched_lines_round_trip() {
        let text = "title  \n  drift   10 2 0\n! note\n\nsteerer 5 2 0 1.5 -0.5\n";
        let doc = LatticeDocument::parse(text);
        assert_eq!(doc.render(), text);
    }

    #[test]
    fn test_write_fields_preserves_other_fields() {
        let mut doc = LatticeDocument::parse(SAMPLE);
        doc.write_fields(4, &[(PHASE_FIELD, 2.25)]).unwrap();
        let rendered = doc.render();
        let line = rendered.lines().nth(4).unwrap();
        assert_eq!(line, "steerer 5 2 0 2.25 -0.5");
        assert!(rendered.ends_with("zout\n"));
        assert!(!rendered.ends_with("\n\n"));
    }

    #[test]
    fn test_short_record_is_malformed() {
        let mut doc = LatticeDocument::parse("steerer 5 2 0\n");
        assert!(doc.field_value(0, PHASE_FIELD).is_err());
        assert!(doc.write_fields(0, &[(AMPLITUDE_FIELD, 1.0)]).is_err());
    }

    #[test]
    fn test_rf_phase_knob_offsets_header() {
        let mut doc = LatticeDocument::parse(SAMPLE);
        let index = LatticeIndex::build(&doc);
        let knob = index.knob(KnobKind::RfPhase, 0).unwrap();

        assert_eq!(knob.read(&doc, Axis::Phase).unwrap(), 30.0);
        knob.write(&mut doc, Axis::Phase, 12.5).unwrap();
        assert_eq!(doc.field_value(7, PHASE_FIELD).unwrap(), 102.5);
        assert_eq!(doc.field_value(8, PHASE_FIELD).unwrap(), 12.5);
        assert_eq!(doc.field_value(9, PHASE_FIELD).unwrap(), 12.5);
    }

    #[test]
    fn test_missing_kind_and_bad_index_are_errors() {
        let doc = LatticeDocument::parse("drift 1 2 3\n");
        let index = LatticeIndex::build(&doc);
        assert!(index.knob(KnobKind::Steerer, 0).is_err());
        assert!(index.knob(KnobKind::RfPhase, 0).is_err());

        let doc = LatticeDocument::parse(SAMPLE);
        let index = LatticeIndex::build(&doc);
        assert!(index.knob(KnobKind::Steerer, 2).is_err());
    }

    #[test]
    fn test_sections_bind_first_knob_in_span() {
        let doc = LatticeDocument::parse(SAMPLE);
        let index = LatticeIndex::build(&doc);
        let sections = index.sections(KnobKind::Steerer).unwrap();

        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].span, 2..6);
        assert_eq!(sections[0].knob, Knob::Steerer { line: 4 });
        assert_eq!(sections[1].span, 6..13);
        assert_eq!(sections[1].knob, Knob::Steerer { line: 10 });
    }
}
