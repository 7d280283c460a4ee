//! # Register liveness
//!
//! A backward dataflow pass over the CFG computing which registers may
//! still be read at each block entry. The fixpoint engine forgets the
//! coordinates of dead registers between blocks, which keeps the
//! constraint graphs small. Forgetting only ever loses precision, so
//! the trimming is always sound.

use crate::cfg::Cfg;
use crate::insn::*;
use std::collections::HashMap;

/// Bitmask over registers r0..r10.
pub type RegSet = u16;

pub const ALL_REGS: RegSet = (1 << 11) - 1;

fn bit(r: Reg) -> RegSet {
    1 << r.0
}

fn value_bit(v: &Value) -> RegSet {
    match v {
        Value::Reg(r) => bit(*r),
        Value::Imm(_) => 0,
    }
}

/// Registers an instruction may read. Assertions read the registers
/// they constrain, which keeps checked registers alive.
fn uses(ins: &Instruction) -> RegSet {
    match ins {
        Instruction::Undefined(_) => 0,
        Instruction::Bin(b) => {
            let dst = if b.op == BinOp::Mov { 0 } else { bit(b.dst) };
            dst | value_bit(&b.v)
        }
        Instruction::Un(u) => bit(u.dst),
        Instruction::LoadMapFd(_) => 0,
        Instruction::Call(c) => {
            let singles = c.singles.iter().fold(0, |m, a| m | bit(a.reg));
            let pairs = c
                .pairs
                .iter()
                .fold(0, |m, a| m | bit(a.mem) | bit(a.size));
            singles | pairs
        }
        Instruction::Exit => bit(Reg(0)),
        Instruction::Jmp(j) => match &j.cond {
            Some(c) => bit(c.left) | value_bit(&c.right),
            None => 0,
        },
        Instruction::Mem(m) => {
            let base = bit(m.access.basereg);
            if m.is_load {
                base
            } else {
                base | value_bit(&m.value)
            }
        }
        Instruction::Packet(p) => bit(Reg(6)) | p.regoffset.map_or(0, bit),
        Instruction::LockAdd(l) => bit(l.access.basereg) | bit(l.valreg),
        Instruction::Assume(c) => bit(c.left) | value_bit(&c.right),
        Instruction::Assert(a) => match a {
            Assert::TypeConstraint { reg, .. } => bit(*reg),
            Assert::ValidAccess { reg, width, .. } => bit(*reg) | value_bit(width),
            Assert::ValidStore { mem, val } => bit(*mem) | bit(*val),
            Assert::ValidSize { reg, .. } => bit(*reg),
            Assert::ValidMapKeyValue { access, map_fd, .. } => bit(*access) | bit(*map_fd),
            Assert::Comparable { r1, r2 } => bit(*r1) | bit(*r2),
            Assert::Addable { ptr, num } => bit(*ptr) | bit(*num),
        },
    }
}

/// Registers an instruction overwrites.
fn defs(ins: &Instruction) -> RegSet {
    match ins {
        Instruction::Bin(b) => bit(b.dst),
        Instruction::Un(u) => bit(u.dst),
        Instruction::LoadMapFd(l) => bit(l.dst),
        // calls scratch r0..r5
        Instruction::Call(_) => (1 << 6) - 1,
        Instruction::Packet(_) => (1 << 6) - 1,
        Instruction::Mem(m) if m.is_load => value_bit(&m.value),
        _ => 0,
    }
}

#[derive(Clone, Debug)]
pub struct Liveness {
    live_in: HashMap<Label, RegSet>,
}

impl Liveness {
    /// Registers that may be read from this block onward. The frame
    /// pointer is pinned live.
    pub fn live_in(&self, label: &Label) -> RegSet {
        self.live_in.get(label).copied().unwrap_or(ALL_REGS) | bit(Reg(10))
    }

    /// Registers dead at entry of `label`.
    pub fn dead_in(&self, label: &Label) -> impl Iterator<Item = Reg> + '_ {
        let live = self.live_in(label);
        (0u8..11).filter(move |i| live & (1 << i) == 0).map(Reg)
    }
}

fn block_transfer(cfg: &Cfg, label: &Label, live_out: RegSet) -> RegSet {
    let mut live = live_out;
    for ins in cfg.get(label).unwrap().insts.iter().rev() {
        live = (live & !defs(ins)) | uses(ins);
    }
    live
}

/// Backward fixpoint over the CFG.
pub fn compute(cfg: &Cfg) -> Liveness {
    let mut live_in: HashMap<Label, RegSet> = HashMap::new();
    let mut worklist: Vec<Label> = cfg.labels().copied().collect();
    while let Some(label) = worklist.pop() {
        let live_out = cfg
            .get(&label)
            .unwrap()
            .succs
            .iter()
            .fold(0, |m, s| m | live_in.get(s).copied().unwrap_or(0));
        let new_in = block_transfer(cfg, &label, live_out);
        if live_in.get(&label) != Some(&new_in) {
            live_in.insert(label, new_in);
            for pred in &cfg.get(&label).unwrap().preds {
                worklist.push(*pred);
            }
        }
    }
    Liveness { live_in }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::build_cfg;

    #[test]
    fn dead_registers_are_found() {
        // r3 is written but never read; r1 is read at pc 1
        let prog = vec![
            (
                0,
                Instruction::Bin(Bin {
                    op: BinOp::Mov,
                    dst: Reg(3),
                    v: Value::Imm(Imm(1)),
                    is64: true,
                    lddw: false,
                }),
            ),
            (
                1,
                Instruction::Bin(Bin {
                    op: BinOp::Mov,
                    dst: Reg(0),
                    v: Value::Reg(Reg(1)),
                    is64: true,
                    lddw: false,
                }),
            ),
            (2, Instruction::Exit),
        ];
        let cfg = build_cfg(&prog).unwrap();
        let live = compute(&cfg);
        let entry = live.live_in(&Label::new(0));
        assert_ne!(entry & (1 << 1), 0, "r1 must be live");
        assert_eq!(entry & (1 << 3), 0, "r3 must be dead");
        assert_ne!(entry & (1 << 10), 0, "r10 is pinned live");
    }
}
