//! # Abstract transfer functions
//!
//! Maps each typed instruction to a sequence of domain operations.
//! Pointer-vs-number ambiguity is handled disjunctively: the state is
//! forked per region, each fork constrained, and the forks rejoined.
//!
//! The same transformer runs in two modes. During fixpoint iteration it
//! only transforms; during the reporting pass it additionally
//! classifies each assertion against the current invariant (entailed,
//! merely satisfiable, or unsatisfiable) before assuming it, so that
//! downstream checks may rely on the asserted fact either way.

use crate::cfg::BasicBlock;
use crate::domain::ebpf::*;
use crate::domain::split_dbm::{ArithOp, Operand};
use crate::domain::{DataKind, EbpfDomain, Interval, LinCst, LinExpr, Var};
use crate::insn::*;
use crate::program::ProgramInfo;
use crate::report::ChecksDb;
use log::trace;

struct CheckSink<'a> {
    db: &'a mut ChecksDb,
    label: Label,
}

pub struct Transformer<'a> {
    pub inv: EbpfDomain,
    info: &'a ProgramInfo,
    check: Option<CheckSink<'a>>,
}

/// Compute the post-state of a block.
pub fn transfer_block(
    block: &BasicBlock,
    pre: &EbpfDomain,
    info: &ProgramInfo,
    count_steps: bool,
) -> EbpfDomain {
    let mut t = Transformer {
        inv: pre.clone(),
        info,
        check: None,
    };
    t.run(block, count_steps);
    t.inv
}

/// Re-run a block from its pre-invariant, classifying every assertion
/// into the checks database.
pub fn check_block(
    block: &BasicBlock,
    pre: &EbpfDomain,
    info: &ProgramInfo,
    count_steps: bool,
    db: &mut ChecksDb,
) -> EbpfDomain {
    let mut t = Transformer {
        inv: pre.clone(),
        info,
        check: Some(CheckSink {
            db,
            label: block.label,
        }),
    };
    t.run(block, count_steps);
    t.inv
}

impl<'a> Transformer<'a> {
    fn run(&mut self, block: &BasicBlock, count_steps: bool) {
        // Synthetic assume blocks do not advance the program; ticking
        // them would break the unit-stride relation between the step
        // counter and loop induction variables.
        if count_steps && block.label.to.is_none() {
            self.inv.tick();
        }
        for ins in &block.insts {
            trace!("{}: {}", block.label, ins);
            self.exec(ins);
        }
    }

    /// Check a constraint against an invariant (reporting mode only),
    /// then assume it so later transfers may rely on it.
    fn require(check: &mut Option<CheckSink<'_>>, inv: &mut EbpfDomain, cst: LinCst, msg: String) {
        if let Some(sink) = check {
            if inv.is_bottom() {
                // nothing reaches this point
            } else if cst.is_contradiction() {
                sink.db
                    .add_warning(sink.label, format!("Contradiction: {}", msg));
            } else if inv.entails(&cst) {
                // redundant; satisfied on every path
            } else {
                // cannot be discharged, whether satisfiable or not
                sink.db.add_warning(sink.label, msg);
            }
        }
        inv.assume(cst);
    }

    fn require_here(&mut self, cst: LinCst, msg: String) {
        Self::require(&mut self.check, &mut self.inv, cst, msg);
    }

    fn warn(&mut self, msg: String) {
        if let Some(sink) = &mut self.check {
            sink.db.add_warning(sink.label, msg);
        }
    }

    fn no_pointer(&mut self, r: Reg) {
        self.inv.assign(reg_type(r), T_NUM);
        self.inv.havoc(reg_offset(r));
    }

    fn scratch_caller_saved_registers(&mut self) {
        for i in 1..=5 {
            self.inv.havoc_reg(Reg(i));
        }
    }

    fn exec(&mut self, ins: &Instruction) {
        match ins {
            Instruction::Undefined(u) => {
                self.warn(format!("bad instruction op {:#04x}", u.opcode));
            }
            Instruction::Bin(bin) => self.exec_bin(bin),
            Instruction::Un(un) => self.exec_un(un),
            Instruction::LoadMapFd(l) => {
                self.inv.assign(reg_type(l.dst), T_MAP);
                self.inv.assign(reg_value(l.dst), l.mapfd as i64);
                self.inv.havoc(reg_offset(l.dst));
            }
            Instruction::Call(call) => self.exec_call(call),
            Instruction::Exit => {}
            Instruction::Jmp(_) => {} // edges carry the semantics
            Instruction::Mem(mem) => self.exec_mem(mem),
            Instruction::Packet(_) => {
                self.inv.assign(reg_type(Reg(0)), T_NUM);
                self.inv.havoc(reg_value(Reg(0)));
                self.inv.havoc(reg_offset(Reg(0)));
                self.scratch_caller_saved_registers();
            }
            Instruction::LockAdd(_) => {
                // the shared cell keeps holding a number; the assertions
                // already validated the access
            }
            Instruction::Assume(cond) => self.exec_assume(cond),
            Instruction::Assert(a) => self.exec_assert(a),
        }
    }

    // ---- conditions ---------------------------------------------------

    /// Constraint on pointer offsets for a same-region comparison.
    fn offsets_cst(op: CondOp, dst: Var, src: Var) -> Option<LinCst> {
        // pointer comparison is unsigned
        match op {
            CondOp::Eq => Some(LinCst::eq(dst, src)),
            CondOp::Ne => Some(LinCst::ne(dst, src)),
            CondOp::Ge | CondOp::Sge => Some(LinCst::ge(dst, src)),
            CondOp::Le | CondOp::Sle => Some(LinCst::le(dst, src)),
            CondOp::Gt | CondOp::Sgt => Some(LinCst::gt(dst, src)),
            CondOp::Lt | CondOp::Slt => Some(LinCst::lt(dst, src)),
            CondOp::Set | CondOp::Nset => None,
        }
    }

    /// Numeric constraints for a comparison with an immediate.
    fn num_csts_imm(op: CondOp, dst: Var, imm: i64) -> Vec<LinCst> {
        let unsigned = imm as u32 as i64;
        match op {
            CondOp::Eq => vec![LinCst::eq(dst, imm)],
            CondOp::Ne => vec![LinCst::ne(dst, imm)],
            CondOp::Sge => vec![LinCst::ge(dst, imm)],
            CondOp::Sle => vec![LinCst::le(dst, imm)],
            CondOp::Sgt => vec![LinCst::gt(dst, imm)],
            CondOp::Slt => vec![LinCst::lt(dst, imm)],
            CondOp::Ge => vec![LinCst::ge(dst, unsigned)],
            CondOp::Le => vec![LinCst::le(dst, unsigned), LinCst::ge(dst, 0)],
            CondOp::Gt => vec![LinCst::gt(dst, unsigned)],
            CondOp::Lt => vec![LinCst::lt(dst, unsigned), LinCst::ge(dst, 0)],
            CondOp::Set | CondOp::Nset => vec![],
        }
    }

    /// Numeric constraints for a register comparison. The unsigned
    /// forms only translate when both operands are known non-negative.
    fn num_csts_reg(inv: &mut EbpfDomain, op: CondOp, dst: Var, src: Var) -> Vec<LinCst> {
        if op.is_unsigned() {
            let nonneg = |iv: Interval| iv.lb >= crate::domain::Bound::Finite(0);
            if !(nonneg(inv.project(dst)) && nonneg(inv.project(src))) {
                return vec![];
            }
        }
        match op {
            CondOp::Eq => vec![LinCst::eq(dst, src)],
            CondOp::Ne => vec![LinCst::ne(dst, src)],
            CondOp::Ge | CondOp::Sge => vec![LinCst::ge(dst, src)],
            CondOp::Le | CondOp::Sle => vec![LinCst::le(dst, src)],
            CondOp::Gt | CondOp::Sgt => vec![LinCst::gt(dst, src)],
            CondOp::Lt | CondOp::Slt => vec![LinCst::lt(dst, src)],
            CondOp::Set | CondOp::Nset => vec![],
        }
    }

    fn exec_assume(&mut self, cond: &Condition) {
        let dst = cond.left;
        match cond.right {
            Value::Imm(imm) => {
                for cst in Self::num_csts_imm(cond.op, reg_value(dst), imm.0) {
                    self.inv.assume(cst);
                }
            }
            Value::Reg(src) => {
                // registers of different types only compare as
                // null-checks of the pointer side
                let different = self
                    .inv
                    .when(LinCst::ne(reg_type(dst), reg_type(src)));
                let null_src = different.when(EbpfDomain::is_pointer(dst));
                let null_dst = different.when(EbpfDomain::is_pointer(src));

                self.inv.assume(LinCst::eq(reg_type(dst), reg_type(src)));

                let mut numbers = self.inv.when(LinCst::eq(reg_type(dst), T_NUM));
                for cst in
                    Self::num_csts_reg(&mut numbers, cond.op, reg_value(dst), reg_value(src))
                {
                    numbers.assume(cst);
                }

                self.inv.assume(EbpfDomain::is_pointer(dst));
                if let Some(cst) = Self::offsets_cst(cond.op, reg_offset(dst), reg_offset(src)) {
                    self.inv.assume(cst);
                }

                let inv = std::mem::take(&mut self.inv);
                self.inv = inv.join(numbers).join(null_src).join(null_dst);
            }
        }
    }

    // ---- assertions ---------------------------------------------------

    fn exec_assert(&mut self, a: &Assert) {
        let msg = a.to_string();
        match a {
            Assert::TypeConstraint { reg, group } => {
                for cst in EbpfDomain::group_constraints(reg_type(*reg), *group) {
                    self.require_here(cst, msg.clone());
                }
            }
            Assert::Comparable { r1, r2 } => {
                self.require_here(LinCst::eq(reg_type(*r1), reg_type(*r2)), msg);
            }
            Assert::Addable { ptr, num } => {
                let cond = LinCst::gt(reg_type(*ptr), T_NUM);
                let mut is_ptr = self.inv.when(cond);
                Self::require(
                    &mut self.check,
                    &mut is_ptr,
                    LinCst::eq(reg_type(*num), T_NUM),
                    format!("only numbers can be added to pointers ({})", msg),
                );
                self.inv.assume(LinCst::le(reg_type(*ptr), T_NUM));
                let inv = std::mem::take(&mut self.inv);
                self.inv = inv.join(is_ptr);
            }
            Assert::ValidSize { reg, can_be_zero } => {
                let v = reg_value(*reg);
                let cst = if *can_be_zero {
                    LinCst::ge(v, 0)
                } else {
                    LinCst::gt(v, 0)
                };
                self.require_here(cst, msg);
            }
            Assert::ValidStore { mem, val } => {
                let cond = LinCst::ne(reg_type(*mem), T_STACK);
                let mut non_stack = self.inv.when(cond);
                Self::require(
                    &mut self.check,
                    &mut non_stack,
                    LinCst::eq(reg_type(*val), T_NUM),
                    "Only numbers can be stored to externally-visible regions".to_string(),
                );
                self.inv.assume(LinCst::eq(reg_type(*mem), T_STACK));
                let inv = std::mem::take(&mut self.inv);
                self.inv = inv.join(non_stack);
            }
            Assert::ValidMapKeyValue {
                access,
                map_fd,
                is_key,
            } => self.check_map_key_value(*access, *map_fd, *is_key, msg),
            Assert::ValidAccess {
                reg,
                offset,
                width,
                or_null,
            } => self.check_valid_access(*reg, *offset, *width, *or_null, msg),
        }
    }

    fn check_access_packet(
        check: &mut Option<CheckSink<'_>>,
        mut inv: EbpfDomain,
        lb: LinExpr,
        ub: LinExpr,
        msg: &str,
        is_comparison_check: bool,
    ) -> EbpfDomain {
        Self::require(
            check,
            &mut inv,
            LinCst::ge(lb, Var::MetaOffset),
            format!("Lower bound must be at least meta_offset ({})", msg),
        );
        let upper: LinCst = if is_comparison_check {
            LinCst::le(ub, MAX_PACKET_OFF)
        } else {
            LinCst::le(ub, Var::PacketSize)
        };
        Self::require(
            check,
            &mut inv,
            upper,
            format!("Upper bound must be at most packet_size ({})", msg),
        );
        inv
    }

    fn check_access_stack(
        check: &mut Option<CheckSink<'_>>,
        mut inv: EbpfDomain,
        lb: LinExpr,
        ub: LinExpr,
        msg: &str,
    ) -> EbpfDomain {
        Self::require(
            check,
            &mut inv,
            LinCst::ge(lb, 0),
            format!("Lower bound must be at least 0 ({})", msg),
        );
        Self::require(
            check,
            &mut inv,
            LinCst::le(ub, STACK_SIZE),
            format!("Upper bound must be at most {} ({})", STACK_SIZE, msg),
        );
        inv
    }

    fn check_access_shared(
        check: &mut Option<CheckSink<'_>>,
        mut inv: EbpfDomain,
        lb: LinExpr,
        ub: LinExpr,
        size_tag: Var,
        msg: &str,
    ) -> EbpfDomain {
        Self::require(
            check,
            &mut inv,
            LinCst::ge(lb, 0),
            format!("Lower bound must be at least 0 ({})", msg),
        );
        // the type tag of shared memory carries its size
        Self::require(
            check,
            &mut inv,
            LinCst::le(ub, size_tag),
            format!("Upper bound must be at most the region size ({})", msg),
        );
        inv
    }

    fn check_access_context(
        check: &mut Option<CheckSink<'_>>,
        mut inv: EbpfDomain,
        lb: LinExpr,
        ub: LinExpr,
        ctx_size: i64,
        msg: &str,
    ) -> EbpfDomain {
        Self::require(
            check,
            &mut inv,
            LinCst::ge(lb, 0),
            format!("Lower bound must be at least 0 ({})", msg),
        );
        Self::require(
            check,
            &mut inv,
            LinCst::le(ub, ctx_size),
            format!("Upper bound must be at most {} ({})", ctx_size, msg),
        );
        inv
    }

    fn check_valid_access(
        &mut self,
        reg: Reg,
        offset: i32,
        width: Value,
        or_null: bool,
        msg: String,
    ) {
        let is_comparison_check = width == Value::Imm(Imm(0));

        let lb = LinExpr::var(reg_offset(reg)).add(offset as i64);
        let ub = match width {
            Value::Imm(imm) => lb.clone().add(imm.0),
            Value::Reg(r) => lb.clone().add(LinExpr::var(reg_value(r))),
        };
        let t = reg_type(reg);

        let assume_ptr = {
            let packet = Self::check_access_packet(
                &mut self.check,
                self.inv.when(LinCst::eq(t, T_PACKET)),
                lb.clone(),
                ub.clone(),
                &msg,
                is_comparison_check,
            );
            let stack = Self::check_access_stack(
                &mut self.check,
                self.inv.when(LinCst::eq(t, T_STACK)),
                lb.clone(),
                ub.clone(),
                &msg,
            );
            let shared = Self::check_access_shared(
                &mut self.check,
                self.inv.when(LinCst::gt(t, T_SHARED)),
                lb.clone(),
                ub.clone(),
                t,
                &msg,
            );
            let ctx = Self::check_access_context(
                &mut self.check,
                self.inv.when(LinCst::eq(t, T_CTX)),
                lb,
                ub,
                self.info.ctx.size as i64,
                &msg,
            );
            packet.join(stack).join(shared).join(ctx)
        };

        if is_comparison_check {
            let inv = std::mem::take(&mut self.inv);
            self.inv = inv.join(assume_ptr);
        } else if or_null {
            self.inv.assume(LinCst::eq(t, T_NUM));
            self.require_here(
                LinCst::eq(reg_value(reg), 0),
                "Pointers may be compared only to the number 0".to_string(),
            );
            let inv = std::mem::take(&mut self.inv);
            self.inv = inv.join(assume_ptr);
        } else {
            self.require_here(
                LinCst::gt(t, T_NUM),
                "Only pointers can be dereferenced".to_string(),
            );
            // zero is how a failed map lookup comes back
            self.require_here(
                LinCst::gt(reg_value(reg), 0),
                format!("Possibly null pointer dereference ({})", msg),
            );
            self.inv = assume_ptr;
            self.inv.assume(LinCst::gt(reg_value(reg), 0));
        }
    }

    fn check_map_key_value(&mut self, access: Reg, map_fd: Reg, is_key: bool, msg: String) {
        // Pin the key/value size ghosts from the map named by the fd.
        let fd = self.inv.project(reg_value(map_fd)).singleton();
        let desc = fd.and_then(|fd| {
            usize::try_from(fd)
                .ok()
                .and_then(|idx| self.info.maps.get(idx))
        });
        match desc {
            Some(desc) => {
                self.inv.assign(Var::MapKeySize, desc.key_size as i64);
                self.inv.assign(Var::MapValueSize, desc.value_size as i64);
            }
            None => {
                self.inv.havoc(Var::MapKeySize);
                self.inv.havoc(Var::MapValueSize);
                self.inv.assume(LinCst::gt(Var::MapKeySize, 0));
                self.inv.assume(LinCst::gt(Var::MapValueSize, 0));
            }
        }

        let t = reg_type(access);
        self.require_here(
            LinCst::ge(t, T_STACK),
            format!("Only stack or packet can be used as a parameter ({})", msg),
        );
        self.require_here(
            LinCst::le(t, T_PACKET),
            format!("Only stack or packet can be used as a parameter ({})", msg),
        );

        let width = if is_key {
            Var::MapKeySize
        } else {
            Var::MapValueSize
        };
        let lb = LinExpr::var(reg_offset(access));
        let ub = lb.clone().add(LinExpr::var(width));

        let packet = Self::check_access_packet(
            &mut self.check,
            self.inv.when(LinCst::eq(t, T_PACKET)),
            lb.clone(),
            ub.clone(),
            &msg,
            false,
        );
        let stack = Self::check_access_stack(
            &mut self.check,
            self.inv.when(LinCst::eq(t, T_STACK)),
            lb,
            ub,
            &msg,
        );
        self.inv = packet.join(stack);
    }

    // ---- ALU ----------------------------------------------------------

    fn exec_un(&mut self, un: &Un) {
        let dst = un.dst;
        match un.op {
            UnOp::Neg => {
                self.inv
                    .apply(ArithOp::Mul, reg_value(dst), reg_value(dst), -1i64);
                self.inv.overflow(reg_value(dst));
                self.no_pointer(dst);
            }
            _ => {
                // byte swaps lose all value information
                self.inv.havoc(reg_value(dst));
                self.no_pointer(dst);
            }
        }
    }

    fn exec_bin(&mut self, bin: &Bin) {
        let dst = bin.dst;
        let (dst_v, dst_o, dst_t) = (reg_value(dst), reg_offset(dst), reg_type(dst));

        match bin.v {
            Value::Imm(Imm(imm)) => match bin.op {
                BinOp::Mov => {
                    self.inv.assign(dst_v, imm);
                    self.no_pointer(dst);
                }
                BinOp::Add => {
                    if imm == 0 {
                        return;
                    }
                    self.inv.apply(ArithOp::Add, dst_v, dst_v, imm);
                    self.inv.overflow(dst_v);
                    self.inv.apply(ArithOp::Add, dst_o, dst_o, imm);
                }
                BinOp::Sub => {
                    if imm == 0 {
                        return;
                    }
                    self.inv.apply(ArithOp::Sub, dst_v, dst_v, imm);
                    self.inv.overflow(dst_v);
                    self.inv.apply(ArithOp::Sub, dst_o, dst_o, imm);
                }
                BinOp::Mul => {
                    self.inv.apply(ArithOp::Mul, dst_v, dst_v, imm);
                    self.inv.overflow(dst_v);
                    self.no_pointer(dst);
                }
                BinOp::Div => {
                    self.inv.apply(ArithOp::Div, dst_v, dst_v, imm);
                    self.no_pointer(dst);
                }
                BinOp::Mod => {
                    self.inv.apply(ArithOp::Rem, dst_v, dst_v, imm);
                    self.no_pointer(dst);
                }
                BinOp::Or => {
                    self.inv.havoc(dst_v);
                    self.no_pointer(dst);
                }
                BinOp::And => {
                    self.inv.apply(ArithOp::And, dst_v, dst_v, imm);
                    if imm as i32 > 0 {
                        self.inv.assume(LinCst::le(dst_v, imm));
                        self.inv.assume(LinCst::ge(dst_v, 0));
                    }
                    self.no_pointer(dst);
                }
                BinOp::Lsh => {
                    self.inv.apply(ArithOp::Shl, dst_v, dst_v, imm);
                    self.inv.overflow(dst_v);
                    self.no_pointer(dst);
                }
                BinOp::Rsh => {
                    self.inv.apply(ArithOp::Lshr, dst_v, dst_v, imm);
                    self.no_pointer(dst);
                }
                BinOp::Arsh => {
                    self.inv.apply(ArithOp::Ashr, dst_v, dst_v, imm);
                    self.no_pointer(dst);
                }
                BinOp::Xor => {
                    self.inv.havoc(dst_v);
                    self.no_pointer(dst);
                }
            },
            Value::Reg(src) => {
                let (src_v, src_o, src_t) = (reg_value(src), reg_offset(src), reg_type(src));
                match bin.op {
                    BinOp::Mov => {
                        self.inv.assign(dst_v, LinExpr::var(src_v));
                        self.inv.assign(dst_o, LinExpr::var(src_o));
                        self.inv.assign(dst_t, LinExpr::var(src_t));
                    }
                    BinOp::Add => {
                        // dst is the pointer
                        let mut ptr_dst = self.inv.when(EbpfDomain::is_pointer(dst));
                        ptr_dst.apply(ArithOp::Add, dst_v, dst_v, src_v);
                        ptr_dst.overflow(dst_v);
                        ptr_dst.apply(ArithOp::Add, dst_o, dst_o, src_v);

                        // src is the pointer; the result takes its type
                        let mut ptr_src = self.inv.when(EbpfDomain::is_pointer(src));
                        ptr_src.apply(ArithOp::Add, dst_v, src_v, dst_v);
                        ptr_src.overflow(dst_v);
                        ptr_src.apply(ArithOp::Add, dst_o, src_o, dst_v);
                        ptr_src.assign(dst_t, LinExpr::var(src_t));

                        // both numeric
                        self.inv.assume(LinCst::eq(dst_t, T_NUM));
                        self.inv.assume(LinCst::eq(src_t, T_NUM));
                        self.inv.apply(ArithOp::Add, dst_v, dst_v, src_v);
                        self.inv.overflow(dst_v);

                        let inv = std::mem::take(&mut self.inv);
                        self.inv = inv.join(ptr_dst).join(ptr_src);
                    }
                    BinOp::Sub => {
                        // pointer − number
                        let mut ptr_dst = self.inv.when(LinCst::eq(src_t, T_NUM));
                        ptr_dst.assume(EbpfDomain::is_pointer(dst));
                        ptr_dst.apply(ArithOp::Sub, dst_v, dst_v, src_v);
                        ptr_dst.overflow(dst_v);
                        ptr_dst.apply(ArithOp::Sub, dst_o, dst_o, src_v);

                        // number − number
                        let mut both_num = self.inv.when(LinCst::eq(src_t, T_NUM));
                        both_num.assume(LinCst::eq(dst_t, T_NUM));
                        both_num.apply(ArithOp::Sub, dst_v, dst_v, src_v);
                        both_num.overflow(dst_v);

                        // pointer − pointer of the same non-shared region
                        self.inv.assume(EbpfDomain::is_pointer(src));
                        self.inv.assume(LinCst::lt(src_t, T_SHARED));
                        self.inv.assume(LinCst::eq(src_t, dst_t));
                        self.inv.assign(
                            dst_v,
                            LinExpr::var(dst_o).sub(LinExpr::var(src_o)),
                        );
                        self.inv.assign(dst_t, T_NUM);
                        self.inv.havoc(dst_o);

                        let inv = std::mem::take(&mut self.inv);
                        self.inv = inv.join(both_num).join(ptr_dst);
                    }
                    BinOp::Mul => {
                        self.inv.apply(ArithOp::Mul, dst_v, dst_v, src_v);
                        self.inv.overflow(dst_v);
                        self.no_pointer(dst);
                    }
                    BinOp::Div => {
                        // division by zero yields zero at runtime, so no
                        // separate zero check here
                        self.inv.havoc(dst_v);
                        self.no_pointer(dst);
                    }
                    BinOp::Mod => {
                        self.inv.havoc(dst_v);
                        self.no_pointer(dst);
                    }
                    BinOp::Lsh | BinOp::Rsh | BinOp::Arsh | BinOp::Or | BinOp::And
                    | BinOp::Xor => {
                        self.inv.havoc(dst_v);
                        self.no_pointer(dst);
                    }
                }
            }
        }
        if !bin.is64 {
            self.inv
                .apply(ArithOp::And, reg_value(dst), reg_value(dst), 0xffff_ffffi64);
        }
    }

    // ---- memory -------------------------------------------------------

    fn exec_mem(&mut self, mem: &Mem) {
        if mem.is_load {
            match mem.value {
                Value::Reg(target) => self.do_load(mem, target),
                Value::Imm(_) => {} // decoder never produces this
            }
        } else {
            match mem.value {
                Value::Reg(data) => self.do_store(
                    mem,
                    Operand::Var(reg_type(data)),
                    Operand::Var(reg_value(data)),
                    Some(reg_offset(data)),
                ),
                Value::Imm(Imm(k)) => {
                    self.do_store(mem, Operand::Const(T_NUM), Operand::Const(k), None)
                }
            }
        }
    }

    fn addr_interval(&mut self, basereg: Reg, offset: i32) -> Interval {
        let expr = LinExpr::var(reg_offset(basereg)).add(offset as i64);
        self.inv.eval(&expr)
    }

    fn do_load_stack(inv: &mut EbpfDomain, target: Reg, addr: &Interval, width: u16) {
        if width == 8 {
            inv.array_load(DataKind::Types, reg_type(target), addr, width);
            inv.array_load(DataKind::Values, reg_value(target), addr, width);
            inv.array_load(DataKind::Offsets, reg_offset(target), addr, width);
        } else {
            inv.array_load(DataKind::Types, reg_type(target), addr, width);
            inv.havoc(reg_value(target));
            inv.havoc(reg_offset(target));
        }
    }

    fn do_load_ctx(&self, mut inv: EbpfDomain, target: Reg, addr: &Interval) -> EbpfDomain {
        let desc = self.info.ctx;
        let (t_t, t_v, t_o) = (reg_type(target), reg_value(target), reg_offset(target));

        inv.havoc(t_v);

        if desc.end < 0 {
            inv.havoc(t_o);
            inv.assign(t_t, T_NUM);
            return inv;
        }

        let may_touch_ptr = [desc.data, desc.end, desc.meta]
            .iter()
            .any(|slot| *slot >= 0 && addr.contains(*slot as i64));

        let slot = match addr.singleton() {
            Some(a) => a,
            None => {
                inv.havoc(t_o);
                if may_touch_ptr {
                    inv.havoc(t_t);
                } else {
                    inv.assign(t_t, T_NUM);
                }
                return inv;
            }
        };

        if slot == desc.data as i64 {
            inv.assign(t_o, 0);
        } else if slot == desc.end as i64 {
            inv.assign(t_o, LinExpr::var(Var::PacketSize));
        } else if desc.meta >= 0 && slot == desc.meta as i64 {
            inv.assign(t_o, LinExpr::var(Var::MetaOffset));
        } else {
            inv.havoc(t_o);
            if may_touch_ptr {
                inv.havoc(t_t);
            } else {
                inv.assign(t_t, T_NUM);
            }
            return inv;
        }
        inv.assign(t_t, T_PACKET);
        inv.assume_pointer_range(t_v);
        inv
    }

    fn do_load_packet_or_shared(mut inv: EbpfDomain, target: Reg) -> EbpfDomain {
        inv.assign(reg_type(target), T_NUM);
        inv.havoc(reg_value(target));
        inv.havoc(reg_offset(target));
        inv
    }

    fn do_load(&mut self, mem: &Mem, target: Reg) {
        let basereg = mem.access.basereg;
        let width = mem.access.width.bytes() as u16;
        let addr = self.addr_interval(basereg, mem.access.offset);

        if basereg.0 == 10 {
            Self::do_load_stack(&mut self.inv, target, &addr, width);
            return;
        }

        match self.inv.type_of(basereg) {
            Some(T_CTX) => {
                let inv = std::mem::take(&mut self.inv);
                self.inv = self.do_load_ctx(inv, target, &addr);
            }
            Some(T_STACK) => Self::do_load_stack(&mut self.inv, target, &addr, width),
            Some(_) => {
                let inv = std::mem::take(&mut self.inv);
                self.inv = Self::do_load_packet_or_shared(inv, target);
            }
            None => {
                let t = reg_type(basereg);
                let ctx = self.do_load_ctx(self.inv.when(LinCst::eq(t, T_CTX)), target, &addr);
                let other = Self::do_load_packet_or_shared(
                    self.inv.when(LinCst::ge(t, T_PACKET)),
                    target,
                );
                let mut stack = self.inv.when(LinCst::eq(t, T_STACK));
                Self::do_load_stack(&mut stack, target, &addr, width);
                self.inv = ctx.join(other).join(stack);
            }
        }
    }

    fn do_store_stack(
        inv: &mut EbpfDomain,
        addr: &Interval,
        width: u16,
        val_type: Operand,
        val_value: Operand,
        val_offset: Option<Var>,
    ) {
        inv.array_store(DataKind::Types, addr, width, val_type);
        if width == 8 {
            inv.array_store(DataKind::Values, addr, width, val_value);
            let stored_type = match val_type {
                Operand::Const(t) => Some(t),
                Operand::Var(v) => inv.project(v).singleton(),
            };
            match val_offset {
                Some(off) if stored_type != Some(T_NUM) => {
                    inv.array_store(DataKind::Offsets, addr, width, Operand::Var(off));
                }
                _ => inv.array_havoc(DataKind::Offsets, addr, width),
            }
        } else {
            inv.array_havoc(DataKind::Values, addr, width);
            inv.array_havoc(DataKind::Offsets, addr, width);
        }
    }

    fn do_store(
        &mut self,
        mem: &Mem,
        val_type: Operand,
        val_value: Operand,
        val_offset: Option<Var>,
    ) {
        let basereg = mem.access.basereg;
        let width = mem.access.width.bytes() as u16;
        let addr = self.addr_interval(basereg, mem.access.offset);

        if basereg.0 == 10 || self.inv.type_of(basereg) == Some(T_STACK) {
            Self::do_store_stack(&mut self.inv, &addr, width, val_type, val_value, val_offset);
            return;
        }

        // split on stack vs elsewhere; only the stack is modeled as an
        // array
        let t = reg_type(basereg);
        let not_stack = self.inv.when(LinCst::ne(t, T_STACK));
        self.inv.assume(LinCst::eq(t, T_STACK));
        if !self.inv.is_bottom() {
            Self::do_store_stack(&mut self.inv, &addr, width, val_type, val_value, val_offset);
        }
        let inv = std::mem::take(&mut self.inv);
        self.inv = inv.join(not_stack);
    }

    // ---- calls --------------------------------------------------------

    fn exec_call(&mut self, call: &Call) {
        for pair in &call.pairs {
            if pair.kind != ArgPairKind::UninitMem {
                continue;
            }
            // a helper writing through a stack pointer makes that
            // region numeric
            let t = reg_type(pair.mem);
            let mut stack = self.inv.when(LinCst::eq(t, T_STACK));
            if !stack.is_bottom() {
                let addr = stack.project(reg_offset(pair.mem));
                let width = stack.project(reg_value(pair.size));
                stack.store_numbers(&addr, &width);
            }
            self.inv.assume(LinCst::eq(t, T_PACKET));
            let inv = std::mem::take(&mut self.inv);
            self.inv = inv.join(stack);
        }

        self.scratch_caller_saved_registers();

        let r0 = Reg(0);
        self.inv.havoc(reg_value(r0));
        if call.returns_map {
            // zero encodes null; this is the only source of null
            // pointers
            self.inv.assume(LinCst::ge(reg_value(r0), 0));
            self.inv.assume(LinCst::le(reg_value(r0), PTR_MAX));
            self.inv.assign(reg_offset(r0), 0);
            self.inv
                .assign(reg_type(r0), LinExpr::var(Var::MapValueSize));
        } else {
            self.inv.havoc(reg_offset(r0));
            self.inv.assign(reg_type(r0), T_NUM);
        }
    }
}
