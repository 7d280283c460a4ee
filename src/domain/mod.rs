//! # Abstract domain
//!
//! The verifier tracks, per register, three integer-valued coordinates
//! (`type`, `value`, `offset`) inside one relational numerical domain,
//! plus byte-addressed expansions of the stack and a few scalar ghosts.
//! Type tags are encoded numerically so that type groups become interval
//! constraints and joins keep relations like `r1.type = r2.type`.

pub mod ebpf;
pub mod interval;
pub mod split_dbm;

pub use ebpf::EbpfDomain;
pub use interval::{Bound, Interval};
pub use split_dbm::SplitDbm;

use std::fmt;

/// The three parallel views of a register or stack slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DataKind {
    Types,
    Values,
    Offsets,
}

/// A named coordinate of the numerical domain.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Var {
    /// Type tag of register `i`.
    Type(u8),
    /// Numeric value (or pointer address) of register `i`.
    Value(u8),
    /// Offset of register `i` into its region.
    Offset(u8),
    /// Stack cell contents, keyed by the base byte of the cell.
    StackType(u16),
    StackValue(u16),
    StackOffset(u16),
    /// Ghost: total packet length.
    PacketSize,
    /// Ghost: signed offset of packet data from its metadata area.
    MetaOffset,
    /// Ghosts: key/value sizes of the map last named by a map-fd operand.
    MapKeySize,
    MapValueSize,
    /// Ghost: monotonic per-block step counter for the termination check.
    LoopCount,
}

impl Var {
    pub fn reg(kind: DataKind, i: u8) -> Self {
        match kind {
            DataKind::Types => Var::Type(i),
            DataKind::Values => Var::Value(i),
            DataKind::Offsets => Var::Offset(i),
        }
    }

    pub fn stack(kind: DataKind, base: u16) -> Self {
        match kind {
            DataKind::Types => Var::StackType(base),
            DataKind::Values => Var::StackValue(base),
            DataKind::Offsets => Var::StackOffset(base),
        }
    }
}

impl fmt::Display for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Var::Type(i) => write!(f, "r{}.type", i),
            Var::Value(i) => write!(f, "r{}.value", i),
            Var::Offset(i) => write!(f, "r{}.offset", i),
            Var::StackType(a) => write!(f, "stack_type[{}]", a),
            Var::StackValue(a) => write!(f, "stack_value[{}]", a),
            Var::StackOffset(a) => write!(f, "stack_offset[{}]", a),
            Var::PacketSize => write!(f, "packet_size"),
            Var::MetaOffset => write!(f, "meta_offset"),
            Var::MapKeySize => write!(f, "map_key_size"),
            Var::MapValueSize => write!(f, "map_value_size"),
            Var::LoopCount => write!(f, "loop_count"),
        }
    }
}

/// A linear expression `Σ cᵢ·vᵢ + k` over domain variables.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LinExpr {
    pub terms: Vec<(i64, Var)>,
    pub constant: i64,
}

impl LinExpr {
    pub fn constant(k: i64) -> Self {
        Self {
            terms: vec![],
            constant: k,
        }
    }

    pub fn var(v: Var) -> Self {
        Self {
            terms: vec![(1, v)],
            constant: 0,
        }
    }

    pub fn add(mut self, other: impl Into<LinExpr>) -> Self {
        let other = other.into();
        self.constant = self.constant.wrapping_add(other.constant);
        self.terms.extend(other.terms);
        self.normalized()
    }

    pub fn sub(self, other: impl Into<LinExpr>) -> Self {
        self.add(other.into().negate())
    }

    pub fn negate(mut self) -> Self {
        self.constant = self.constant.wrapping_neg();
        for (c, _) in &mut self.terms {
            *c = c.wrapping_neg();
        }
        self
    }

    /// Merge duplicate variables and drop zero coefficients.
    fn normalized(mut self) -> Self {
        self.terms.sort_by_key(|(_, v)| *v);
        let mut merged: Vec<(i64, Var)> = Vec::with_capacity(self.terms.len());
        for (c, v) in self.terms.drain(..) {
            match merged.last_mut() {
                Some((mc, mv)) if *mv == v => *mc = mc.wrapping_add(c),
                _ => merged.push((c, v)),
            }
        }
        merged.retain(|(c, _)| *c != 0);
        self.terms = merged;
        self
    }
}

impl From<Var> for LinExpr {
    fn from(v: Var) -> Self {
        LinExpr::var(v)
    }
}

impl From<i64> for LinExpr {
    fn from(k: i64) -> Self {
        LinExpr::constant(k)
    }
}

impl fmt::Display for LinExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (c, v) in &self.terms {
            match (*c, first) {
                (1, true) => write!(f, "{}", v)?,
                (1, false) => write!(f, " + {}", v)?,
                (-1, _) => write!(f, "{}-{}", if first { "" } else { " " }, v)?,
                (c, true) => write!(f, "{}*{}", c, v)?,
                (c, false) if c > 0 => write!(f, " + {}*{}", c, v)?,
                (c, false) => write!(f, " - {}*{}", -c, v)?,
            }
            first = false;
        }
        if self.constant != 0 || first {
            if first {
                write!(f, "{}", self.constant)?;
            } else if self.constant > 0 {
                write!(f, " + {}", self.constant)?;
            } else {
                write!(f, " - {}", -self.constant)?;
            }
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CstKind {
    /// `expr ≤ 0`
    LeqZero,
    /// `expr = 0`
    EqZero,
    /// `expr ≠ 0`
    NeqZero,
}

/// A linear constraint in the normal form `expr OP 0`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinCst {
    pub expr: LinExpr,
    pub kind: CstKind,
}

impl LinCst {
    /// `a ≤ b`
    pub fn le(a: impl Into<LinExpr>, b: impl Into<LinExpr>) -> Self {
        Self {
            expr: a.into().sub(b),
            kind: CstKind::LeqZero,
        }
    }

    /// `a < b`
    pub fn lt(a: impl Into<LinExpr>, b: impl Into<LinExpr>) -> Self {
        Self {
            expr: a.into().sub(b).add(1),
            kind: CstKind::LeqZero,
        }
    }

    /// `a ≥ b`
    pub fn ge(a: impl Into<LinExpr>, b: impl Into<LinExpr>) -> Self {
        Self::le(b, a)
    }

    /// `a > b`
    pub fn gt(a: impl Into<LinExpr>, b: impl Into<LinExpr>) -> Self {
        Self::lt(b, a)
    }

    /// `a = b`
    pub fn eq(a: impl Into<LinExpr>, b: impl Into<LinExpr>) -> Self {
        Self {
            expr: a.into().sub(b),
            kind: CstKind::EqZero,
        }
    }

    /// `a ≠ b`
    pub fn ne(a: impl Into<LinExpr>, b: impl Into<LinExpr>) -> Self {
        Self {
            expr: a.into().sub(b),
            kind: CstKind::NeqZero,
        }
    }

    /// Holds in no state at all, e.g. `1 ≤ 0`.
    pub fn is_contradiction(&self) -> bool {
        if !self.expr.terms.is_empty() {
            return false;
        }
        match self.kind {
            CstKind::LeqZero => self.expr.constant > 0,
            CstKind::EqZero => self.expr.constant != 0,
            CstKind::NeqZero => self.expr.constant == 0,
        }
    }

    /// Holds in every state, e.g. `0 ≤ 0`.
    pub fn is_tautology(&self) -> bool {
        if !self.expr.terms.is_empty() {
            return false;
        }
        !self.is_contradiction()
    }
}

impl fmt::Display for LinCst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self.kind {
            CstKind::LeqZero => "<=",
            CstKind::EqZero => "=",
            CstKind::NeqZero => "!=",
        };
        write!(f, "{} {} 0", self.expr, op)
    }
}
