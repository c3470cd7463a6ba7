use super::{ElementKind, LatticeDocument, STOP_DIRECTIVE};
use std::collections::BTreeSet;
use std::str::FromStr;
use strum_macros::Display;
use tracing::debug;

const DIAGNOSTIC_KEYWORDS: &[&str] = &["output", "zout", "screen", "print", "emit"];
const CONTROL_KEYWORDS: &[&str] = &[
    "title", "run", "input", "scheff", "start", "continue", "end", "error", "random", "zlimit",
];

/// Closed vocabulary of line categories that masking can touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
#[strum(serialize_all = "lowercase")]
pub enum MaskCategory {
    Element,
    Diagnostic,
    Control,
    Other,
}

impl MaskCategory {
    pub fn of_keyword(keyword: &str) -> Self {
        let lower = keyword.to_ascii_lowercase();
        if ElementKind::from_str(&lower).is_ok() {
            MaskCategory::Element
        } else if DIAGNOSTIC_KEYWORDS.contains(&lower.as_str()) {
            MaskCategory::Diagnostic
        } else if CONTROL_KEYWORDS.contains(&lower.as_str()) {
            MaskCategory::Control
        } else {
            MaskCategory::Other
        }
    }

    pub const ALL: [MaskCategory; 4] = [
        MaskCategory::Element,
        MaskCategory::Diagnostic,
        MaskCategory::Control,
        MaskCategory::Other,
    ];
}

impl LatticeDocument {
    /// Comments out every active line in `from..to` except `except`.
    /// Blank lines, author comments and already-masked lines are left alone.
    /// Returns the number of lines newly masked.
    pub fn mask_range(&mut self, from: usize, to: usize, except: &BTreeSet<usize>) -> usize {
        let to = to.min(self.lines.len());
        let mut masked = 0;
        for pos in from..to {
            if except.contains(&pos) {
                continue;
            }
            let line = &mut self.lines[pos];
            if line.masked || line.is_blank() || line.is_comment() {
                continue;
            }
            line.masked = true;
            masked += 1;
        }
        debug!("Masked {} lines in {}..{}", masked, from, to);
        masked
    }

    /// Re-enables masked lines whose keyword falls in one of `categories`.
    pub fn unmask(&mut self, categories: &[MaskCategory]) -> usize {
        let mut restored = 0;
        for line in self.lines.iter_mut().filter(|l| l.masked) {
            if line.category.is_some_and(|c| categories.contains(&c)) {
                line.masked = false;
                restored += 1;
            }
        }
        restored
    }

    /// Forces a single line active regardless of earlier masking.
    pub fn unmask_line(&mut self, pos: usize) {
        if let Some(line) = self.lines.get_mut(pos) {
            line.masked = false;
        }
    }

    pub fn masked_count(&self) -> usize {
        self.lines.iter().filter(|l| l.masked).count()
    }

    /// Emits a halt directive right after line `after_line`, clamped to the
    /// last line of the document.
    pub fn insert_stop_marker(&mut self, after_line: usize) {
        if self.lines.is_empty() {
            return;
        }
        let pos = after_line.min(self.lines.len() - 1);
        debug!("Inserting '{}' after line {}", STOP_DIRECTIVE, pos + 1);
        self.stop_markers.push(pos);
    }

    /// Drops every halt directive inserted by [`insert_stop_marker`](Self::insert_stop_marker).
    pub fn remove_stop_markers(&mut self) -> usize {
        let removed = self.stop_markers.len();
        self.stop_markers.clear();
        removed
    }

    pub fn stop_markers(&self) -> &[usize] {
        &self.stop_markers
    }
}
