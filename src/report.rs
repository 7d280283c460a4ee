//! # Diagnostics accumulator
//!
//! Findings are keyed by label and kept in the order the checker
//! produced them. A program passes verification iff no warning or error
//! was recorded.

use crate::insn::Label;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum CheckKind {
    Error,
    Warning,
    Redundant,
    Unreachable,
}

/// Per-verification database of check results. Local to one run to keep
/// the verifier reentrant.
#[derive(Clone, Debug, Default)]
pub struct ChecksDb {
    db: BTreeMap<Label, Vec<(CheckKind, String)>>,
    totals: BTreeMap<CheckKind, usize>,
    maybe_nonterminating: BTreeSet<Label>,
}

impl ChecksDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, label: Label, kind: CheckKind, msg: String) {
        self.db.entry(label).or_default().push((kind, msg));
        *self.totals.entry(kind).or_default() += 1;
    }

    pub fn add_warning(&mut self, label: Label, msg: String) {
        self.add(label, CheckKind::Warning, msg);
    }

    pub fn add_unreachable(&mut self, label: Label, msg: String) {
        self.add(label, CheckKind::Unreachable, msg);
    }

    pub fn add_nontermination(&mut self, label: Label) {
        self.maybe_nonterminating.insert(label);
        *self.totals.entry(CheckKind::Warning).or_default() += 1;
    }

    pub fn total(&self, kind: CheckKind) -> usize {
        self.totals.get(&kind).copied().unwrap_or(0)
    }

    pub fn total_warnings(&self) -> usize {
        self.total(CheckKind::Warning)
    }

    pub fn total_errors(&self) -> usize {
        self.total(CheckKind::Error)
    }

    /// Did the program pass? Redundant and unreachable findings are
    /// informational only.
    pub fn passed(&self) -> bool {
        self.total_warnings() + self.total_errors() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Label, &Vec<(CheckKind, String)>)> {
        self.db.iter()
    }

    pub fn messages_at(&self, label: &Label) -> impl Iterator<Item = &str> {
        self.db
            .get(label)
            .into_iter()
            .flat_map(|v| v.iter().map(|(_, m)| m.as_str()))
    }

    pub fn nonterminating(&self) -> impl Iterator<Item = &Label> {
        self.maybe_nonterminating.iter()
    }
}

impl fmt::Display for ChecksDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (label, reports) in &self.db {
            writeln!(f, "{}:", label)?;
            for (_, msg) in reports {
                writeln!(f, "  {}", msg)?;
            }
        }
        writeln!(f)?;
        if !self.maybe_nonterminating.is_empty() {
            let labels: Vec<String> = self
                .maybe_nonterminating
                .iter()
                .map(|l| l.to_string())
                .collect();
            writeln!(
                f,
                "Could not prove termination on join into: {}",
                labels.join(", ")
            )?;
        }
        writeln!(f, "{} warnings", self.total_warnings() + self.total_errors())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_gate_the_verdict() {
        let mut db = ChecksDb::new();
        assert!(db.passed());
        db.add(Label::new(2), CheckKind::Redundant, "fine".into());
        assert!(db.passed());
        db.add_warning(Label::new(2), "suspicious".into());
        assert!(!db.passed());
        assert_eq!(db.total_warnings(), 1);
    }

    #[test]
    fn renders_by_label_with_summary() {
        let mut db = ChecksDb::new();
        db.add_warning(Label::new(4), "first".into());
        db.add_warning(Label::edge(4, 7), "second".into());
        let text = db.to_string();
        assert!(text.contains("4:\n  first"));
        assert!(text.contains("4:7:\n  second"));
        assert!(text.trim_end().ends_with("2 warnings"));
    }
}
