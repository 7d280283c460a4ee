//! # The eBPF product domain
//!
//! One [`SplitDbm`] carries all register coordinates, ghosts, and the
//! expanded stack cells; this wrapper adds the stack cell bookkeeping
//! (which byte ranges currently hold a live cell of which width) and
//! the eBPF-specific vocabulary: type tags, type groups, the entry
//! state, and the termination ghost.
//!
//! Type tags are ordered so that groups are intervals: `t ≥ T_NUM` iff
//! initialized, `t ≥ T_CTX` iff pointer, `t > T_SHARED` iff pointer to
//! shared memory of known size (the tag then carries the size).

use super::interval::{Bound, Interval};
use super::split_dbm::{ArithOp, Operand, SplitDbm};
use super::{CstKind, DataKind, LinCst, LinExpr, Var};
use crate::insn::{Reg, TypeGroup};
use crate::program::ProgramInfo;
use std::fmt;

pub const T_UNINIT: i64 = -6;
pub const T_MAP: i64 = -5;
pub const T_NUM: i64 = -4;
pub const T_CTX: i64 = -3;
pub const T_STACK: i64 = -2;
pub const T_PACKET: i64 = -1;
pub const T_SHARED: i64 = 0;

pub const STACK_SIZE: i64 = 512;
pub const MAX_PACKET_OFF: i64 = 0xffff;
pub const PTR_MAX: i64 = i32::MAX as i64 - MAX_PACKET_OFF;

pub fn reg_type(r: Reg) -> Var {
    Var::Type(r.0)
}

pub fn reg_value(r: Reg) -> Var {
    Var::Value(r.0)
}

pub fn reg_offset(r: Reg) -> Var {
    Var::Offset(r.0)
}

const KINDS: [DataKind; 3] = [DataKind::Types, DataKind::Values, DataKind::Offsets];

fn kind_index(kind: DataKind) -> usize {
    match kind {
        DataKind::Types => 0,
        DataKind::Values => 1,
        DataKind::Offsets => 2,
    }
}

#[derive(Clone, Debug, Default)]
pub struct EbpfDomain {
    dbm: SplitDbm,
    /// Live stack cells per kind: base byte → cell width.
    cells: [std::collections::BTreeMap<u16, u16>; 3],
}

impl EbpfDomain {
    pub fn top() -> Self {
        Self {
            dbm: SplitDbm::top(),
            cells: Default::default(),
        }
    }

    pub fn bottom() -> Self {
        Self {
            dbm: SplitDbm::bottom(),
            cells: Default::default(),
        }
    }

    pub fn is_bottom(&mut self) -> bool {
        self.dbm.normalize();
        self.dbm.is_bottom()
    }

    /// The state holding at program entry: r10 points to the top of the
    /// stack, r1 to the context, everything else is uninitialized, and
    /// the packet ghosts are constrained by the context layout.
    pub fn setup_entry(info: &ProgramInfo) -> Self {
        let mut inv = Self::top();

        inv.assign(reg_type(Reg(10)), T_STACK);
        inv.assign(reg_offset(Reg(10)), STACK_SIZE);
        inv.assume(LinCst::ge(reg_value(Reg(10)), STACK_SIZE));

        inv.assign(reg_type(Reg(1)), T_CTX);
        inv.assign(reg_offset(Reg(1)), 0);
        inv.assume_pointer_range(reg_value(Reg(1)));

        for i in [0, 2, 3, 4, 5, 6, 7, 8, 9] {
            inv.assign(reg_type(Reg(i)), T_UNINIT);
        }

        inv.assume(LinCst::ge(Var::PacketSize, 0));
        inv.assume(LinCst::lt(Var::PacketSize, MAX_PACKET_OFF));
        if info.ctx.meta >= 0 {
            inv.assume(LinCst::le(Var::MetaOffset, 0));
            inv.assume(LinCst::ge(Var::MetaOffset, -4098));
        } else {
            inv.assign(Var::MetaOffset, 0);
        }

        inv.assign(Var::LoopCount, 0);
        inv
    }

    /// Pointers live well away from small numeric values.
    pub fn assume_pointer_range(&mut self, value: Var) {
        self.assume(LinCst::ge(value, 4098));
        self.assume(LinCst::le(value, PTR_MAX));
    }

    pub fn assume(&mut self, cst: LinCst) {
        self.dbm.add_constraint(&cst);
    }

    pub fn assign(&mut self, v: Var, e: impl Into<LinExpr>) {
        self.dbm.assign(v, e);
    }

    pub fn havoc(&mut self, v: Var) {
        self.dbm.forget(v);
    }

    pub fn havoc_reg(&mut self, r: Reg) {
        self.havoc(reg_type(r));
        self.havoc(reg_value(r));
        self.havoc(reg_offset(r));
    }

    pub fn apply(&mut self, op: ArithOp, x: Var, y: Var, z: impl Into<Operand>) {
        self.dbm.apply(op, x, y, z.into());
    }

    pub fn project(&mut self, v: Var) -> Interval {
        self.dbm.project(v)
    }

    pub fn eval(&mut self, e: &LinExpr) -> Interval {
        self.dbm.eval(e)
    }

    /// Havoc a variable whose value may have wrapped around.
    pub fn overflow(&mut self, v: Var) {
        let iv = self.project(v);
        let max = Bound::Finite(i64::MAX / 2);
        let min = Bound::Finite(i64::MIN / 2);
        if iv.lb <= min || iv.ub >= max {
            self.havoc(v);
        }
    }

    /// Type tag of the register, if the analysis pinned it down.
    pub fn type_of(&mut self, r: Reg) -> Option<i64> {
        self.project(reg_type(r)).singleton()
    }

    /// Constraints a type group imposes on a type variable.
    pub fn group_constraints(t: Var, group: TypeGroup) -> Vec<LinCst> {
        match group {
            TypeGroup::Num => vec![LinCst::eq(t, T_NUM)],
            TypeGroup::MapFd => vec![LinCst::eq(t, T_MAP)],
            TypeGroup::Ctx => vec![LinCst::eq(t, T_CTX)],
            TypeGroup::Packet => vec![LinCst::eq(t, T_PACKET)],
            TypeGroup::Stack => vec![LinCst::eq(t, T_STACK)],
            TypeGroup::Shared => vec![LinCst::gt(t, T_SHARED)],
            TypeGroup::NonMapFd => vec![LinCst::ge(t, T_NUM)],
            TypeGroup::Mem => vec![LinCst::ge(t, T_STACK)],
            TypeGroup::MemOrNum => vec![LinCst::ge(t, T_NUM), LinCst::ne(t, T_CTX)],
            TypeGroup::Ptr => vec![LinCst::ge(t, T_CTX)],
            TypeGroup::PtrOrNum => vec![LinCst::ge(t, T_NUM)],
            TypeGroup::StackOrPacket => {
                vec![LinCst::ge(t, T_STACK), LinCst::le(t, T_PACKET)]
            }
        }
    }

    pub fn is_pointer(r: Reg) -> LinCst {
        LinCst::ge(reg_type(r), T_CTX)
    }

    /// Fork a copy constrained by `cst`.
    pub fn when(&self, cst: LinCst) -> Self {
        let mut copy = self.clone();
        copy.assume(cst);
        copy
    }

    /// Does the state entail the constraint? Checked by refutation.
    pub fn entails(&self, cst: &LinCst) -> bool {
        match cst.kind {
            CstKind::EqZero => {
                let le = LinCst {
                    expr: cst.expr.clone(),
                    kind: CstKind::LeqZero,
                };
                let ge = LinCst {
                    expr: cst.expr.clone().negate(),
                    kind: CstKind::LeqZero,
                };
                self.entails(&le) && self.entails(&ge)
            }
            CstKind::LeqZero => {
                // refute: expr ≥ 1
                let mut copy = self.clone();
                copy.assume(LinCst {
                    expr: cst.expr.clone().negate().add(1),
                    kind: CstKind::LeqZero,
                });
                copy.is_bottom()
            }
            CstKind::NeqZero => {
                let mut copy = self.clone();
                copy.assume(LinCst {
                    expr: cst.expr.clone(),
                    kind: CstKind::EqZero,
                });
                copy.is_bottom()
            }
        }
    }

    /// Is the constraint satisfiable together with the state?
    pub fn intersects(&self, cst: &LinCst) -> bool {
        let mut copy = self.clone();
        copy.assume(cst.clone());
        !copy.is_bottom()
    }

    fn kill_cells(&mut self, kind: DataKind, from: i64, to: i64) {
        let idx = kind_index(kind);
        let doomed: Vec<u16> = self.cells[idx]
            .iter()
            .filter(|(base, width)| {
                let lo = **base as i64;
                let hi = lo + **width as i64;
                lo < to && from < hi
            })
            .map(|(base, _)| *base)
            .collect();
        for base in doomed {
            self.cells[idx].remove(&base);
            self.dbm.forget(Var::stack(kind, base));
        }
    }

    /// Store into the expanded stack array. Overlapping cells are
    /// killed; a precisely addressed store creates a fresh cell.
    pub fn array_store(&mut self, kind: DataKind, addr: &Interval, width: u16, val: Operand) {
        if self.dbm.is_bottom() {
            return;
        }
        match addr.singleton() {
            Some(a) if a >= 0 && a + width as i64 <= STACK_SIZE => {
                let base = a as u16;
                self.kill_cells(kind, a, a + width as i64);
                self.cells[kind_index(kind)].insert(base, width);
                let cell = Var::stack(kind, base);
                match val {
                    Operand::Var(v) => self.dbm.assign(cell, LinExpr::var(v)),
                    Operand::Const(k) => self.dbm.assign(cell, k),
                }
            }
            _ => self.array_havoc(kind, addr, width),
        }
    }

    /// Load from the expanded stack array: precise hit on a matching
    /// cell copies it, anything else havocs the target. Type cells are
    /// written uniformly, so a narrower load inside a covering type
    /// cell may still read it.
    pub fn array_load(&mut self, kind: DataKind, dst: Var, addr: &Interval, width: u16) {
        let cell = match addr.singleton() {
            Some(a) if (0..STACK_SIZE).contains(&a) => {
                let idx = kind_index(kind);
                if self.cells[idx].get(&(a as u16)) == Some(&width) {
                    Some(a as u16)
                } else if kind == DataKind::Types {
                    self.cells[idx]
                        .range(..=a as u16)
                        .next_back()
                        .filter(|(base, w)| {
                            **base as i64 <= a && a + width as i64 <= **base as i64 + **w as i64
                        })
                        .map(|(base, _)| *base)
                } else {
                    None
                }
            }
            _ => None,
        };
        match cell {
            Some(base) => self.dbm.assign(dst, LinExpr::var(Var::stack(kind, base))),
            None => self.dbm.forget(dst),
        }
    }

    /// Erase every cell that may overlap `[addr, addr + width)`.
    pub fn array_havoc(&mut self, kind: DataKind, addr: &Interval, width: u16) {
        let lo = addr.lb.finite().unwrap_or(0).max(0);
        let hi = addr
            .ub
            .finite()
            .map_or(STACK_SIZE, |ub| (ub + width as i64).min(STACK_SIZE));
        self.kill_cells(kind, lo, hi);
    }

    /// Mark a byte range as holding numbers of unknown value, the
    /// effect of a helper writing through a stack pointer.
    pub fn store_numbers(&mut self, addr: &Interval, width: &Interval) {
        let precise = match (addr.singleton(), width.singleton()) {
            (Some(a), Some(w)) if a >= 0 && w > 0 && a + w <= STACK_SIZE => Some((a, w)),
            _ => None,
        };
        match precise {
            Some((a, w)) => {
                for kind in KINDS {
                    self.kill_cells(kind, a, a + w);
                }
                self.cells[kind_index(DataKind::Types)].insert(a as u16, w as u16);
                self.dbm.assign(Var::stack(DataKind::Types, a as u16), T_NUM);
            }
            None => {
                let max_width = width.ub.finite().unwrap_or(STACK_SIZE).max(0) as u16;
                for kind in KINDS {
                    self.array_havoc(kind, addr, max_width.min(STACK_SIZE as u16));
                }
            }
        }
    }

    /// Reconcile cell maps before a lattice operation: any base whose
    /// width disagrees is dropped from both sides.
    fn reconcile_cells(&mut self, other: &mut Self) {
        for kind in KINDS {
            let idx = kind_index(kind);
            let mine: Vec<(u16, u16)> = self.cells[idx].iter().map(|(b, w)| (*b, *w)).collect();
            for (base, width) in mine {
                if other.cells[idx].get(&base) != Some(&width) {
                    self.cells[idx].remove(&base);
                    self.dbm.forget(Var::stack(kind, base));
                }
            }
            let theirs: Vec<u16> = other.cells[idx].keys().copied().collect();
            for base in theirs {
                if !self.cells[idx].contains_key(&base) {
                    other.cells[idx].remove(&base);
                    other.dbm.forget(Var::stack(kind, base));
                }
            }
        }
    }

    pub fn join(mut self, mut other: Self) -> Self {
        if self.dbm.is_bottom() {
            return other;
        }
        if other.dbm.is_bottom() {
            return self;
        }
        self.reconcile_cells(&mut other);
        Self {
            dbm: self.dbm.join(&mut other.dbm),
            cells: self.cells,
        }
    }

    pub fn widen(mut self, mut next: Self) -> Self {
        if self.dbm.is_bottom() {
            return next;
        }
        self.reconcile_cells(&mut next);
        Self {
            dbm: self.dbm.widen(&mut next.dbm),
            cells: self.cells,
        }
    }

    pub fn narrow(mut self, mut other: Self) -> Self {
        if self.dbm.is_bottom() || other.dbm.is_bottom() {
            return Self::bottom();
        }
        self.reconcile_cells(&mut other);
        Self {
            dbm: self.dbm.narrow(&mut other.dbm),
            cells: self.cells,
        }
    }

    pub fn leq(&mut self, other: &mut Self) -> bool {
        if self.is_bottom() {
            return true;
        }
        if other.is_bottom() {
            return false;
        }
        // cell maps must agree where the right side holds information
        for kind in KINDS {
            let idx = kind_index(kind);
            for (base, width) in &other.cells[idx] {
                if self.cells[idx].get(base) != Some(width) {
                    return false;
                }
            }
        }
        self.dbm.leq(&other.dbm)
    }

    /// One more block executed; drives the termination sub-analysis.
    pub fn tick(&mut self) {
        self.dbm
            .assign(Var::LoopCount, LinExpr::var(Var::LoopCount).add(1));
    }

    /// The step counter stayed bounded, so every path through this
    /// state executes finitely many blocks.
    pub fn terminates(&mut self) -> bool {
        if self.is_bottom() {
            return true;
        }
        self.project(Var::LoopCount).ub != Bound::PosInf
    }

    /// Render the invariant as a constraint list.
    pub fn constraints(&mut self) -> Vec<String> {
        self.dbm.normalize();
        self.dbm.constraints()
    }
}

impl fmt::Display for EbpfDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut copy = self.clone();
        copy.dbm.normalize();
        if copy.dbm.is_bottom() {
            return write!(f, "_|_");
        }
        write!(f, "{}", copy.dbm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::BpfProgType;

    fn entry() -> EbpfDomain {
        EbpfDomain::setup_entry(&ProgramInfo::new(BpfProgType::Xdp, vec![]))
    }

    #[test]
    fn entry_state_types() {
        let mut inv = entry();
        assert_eq!(inv.type_of(Reg(10)), Some(T_STACK));
        assert_eq!(inv.type_of(Reg(1)), Some(T_CTX));
        assert_eq!(inv.type_of(Reg(0)), Some(T_UNINIT));
        assert_eq!(inv.project(reg_offset(Reg(10))).singleton(), Some(STACK_SIZE));
    }

    #[test]
    fn type_groups_are_intervals() {
        // every group must be expressible as bounds on the tag
        for (group, members) in [
            (TypeGroup::Num, vec![T_NUM]),
            (TypeGroup::Ptr, vec![T_CTX, T_STACK, T_PACKET, 1]),
            (TypeGroup::Mem, vec![T_STACK, T_PACKET, 1]),
            (TypeGroup::NonMapFd, vec![T_NUM, T_CTX, T_STACK, T_PACKET, 1]),
            (TypeGroup::StackOrPacket, vec![T_STACK, T_PACKET]),
        ] {
            let all = [T_UNINIT, T_MAP, T_NUM, T_CTX, T_STACK, T_PACKET, 1];
            for tag in all {
                let mut inv = EbpfDomain::top();
                inv.assign(reg_type(Reg(1)), tag);
                for cst in EbpfDomain::group_constraints(reg_type(Reg(1)), group) {
                    inv.assume(cst);
                }
                assert_eq!(
                    !inv.is_bottom(),
                    members.contains(&tag),
                    "group {:?} tag {}",
                    group,
                    tag
                );
            }
        }
    }

    #[test]
    fn stack_cell_round_trip() {
        let mut inv = EbpfDomain::top();
        inv.assign(reg_value(Reg(1)), 42);
        let addr = Interval::singleton_of(504);
        inv.array_store(DataKind::Values, &addr, 8, Operand::Var(reg_value(Reg(1))));
        inv.array_load(DataKind::Values, reg_value(Reg(2)), &addr, 8);
        assert_eq!(inv.project(reg_value(Reg(2))).singleton(), Some(42));
    }

    #[test]
    fn overlapping_store_kills_cell() {
        let mut inv = EbpfDomain::top();
        let addr = Interval::singleton_of(504);
        inv.array_store(DataKind::Values, &addr, 8, Operand::Const(7));
        // a one-byte write into the middle clobbers the wide cell
        inv.array_store(
            DataKind::Values,
            &Interval::singleton_of(507),
            1,
            Operand::Const(0),
        );
        inv.array_load(DataKind::Values, reg_value(Reg(2)), &addr, 8);
        assert!(inv.project(reg_value(Reg(2))).is_top());
    }

    #[test]
    fn adjacent_cells_are_preserved() {
        let mut inv = EbpfDomain::top();
        inv.array_store(
            DataKind::Values,
            &Interval::singleton_of(496),
            8,
            Operand::Const(1),
        );
        inv.array_store(
            DataKind::Values,
            &Interval::singleton_of(504),
            8,
            Operand::Const(2),
        );
        inv.array_load(
            DataKind::Values,
            reg_value(Reg(2)),
            &Interval::singleton_of(496),
            8,
        );
        assert_eq!(inv.project(reg_value(Reg(2))).singleton(), Some(1));
    }

    #[test]
    fn imprecise_store_havocs_the_range() {
        let mut inv = EbpfDomain::top();
        inv.array_store(
            DataKind::Values,
            &Interval::singleton_of(480),
            8,
            Operand::Const(3),
        );
        inv.array_store(
            DataKind::Values,
            &Interval::range(470, 500),
            8,
            Operand::Const(9),
        );
        inv.array_load(
            DataKind::Values,
            reg_value(Reg(2)),
            &Interval::singleton_of(480),
            8,
        );
        assert!(inv.project(reg_value(Reg(2))).is_top());
    }

    #[test]
    fn join_drops_disagreeing_cells() {
        let mut a = EbpfDomain::top();
        a.array_store(
            DataKind::Values,
            &Interval::singleton_of(504),
            8,
            Operand::Const(1),
        );
        let mut b = EbpfDomain::top();
        b.array_store(
            DataKind::Values,
            &Interval::singleton_of(504),
            4,
            Operand::Const(1),
        );
        let mut joined = a.join(b);
        joined.array_load(
            DataKind::Values,
            reg_value(Reg(2)),
            &Interval::singleton_of(504),
            8,
        );
        assert!(joined.project(reg_value(Reg(2))).is_top());
    }

    #[test]
    fn termination_counter_counts() {
        let mut inv = entry();
        assert!(inv.terminates());
        inv.tick();
        assert_eq!(inv.project(Var::LoopCount).singleton(), Some(1));
        inv.havoc(Var::LoopCount);
        assert!(!inv.terminates());
    }
}
