//! # Assertion explication
//!
//! Walks every block and prepends, before each instruction, the
//! assertions encoding its kernel-level preconditions: pointer typing,
//! bounds, and helper-argument validity. The fixpoint treats the
//! program as unsafe unless it can discharge every one of them.

use crate::cfg::Cfg;
use crate::insn::*;
use crate::program::ProgramInfo;

struct AssertExtractor {
    privileged: bool,
}

impl AssertExtractor {
    fn new(info: &ProgramInfo) -> Self {
        Self {
            privileged: info.prog_type.is_privileged(),
        }
    }

    fn extract(&self, ins: &Instruction) -> Vec<Assert> {
        match ins {
            // Packet access implicitly reads the skb through r6.
            Instruction::Packet(_) => vec![Assert::TypeConstraint {
                reg: Reg(6),
                group: TypeGroup::Ctx,
            }],
            Instruction::Exit => vec![Assert::TypeConstraint {
                reg: Reg(0),
                group: TypeGroup::Num,
            }],
            Instruction::Call(call) => self.extract_call(call),
            Instruction::Assume(cond) => self.explicate(cond),
            Instruction::Jmp(jmp) => match &jmp.cond {
                Some(cond) => self.explicate(cond),
                None => vec![],
            },
            Instruction::Mem(mem) => self.extract_mem(mem),
            Instruction::LockAdd(l) => vec![
                Assert::TypeConstraint {
                    reg: l.access.basereg,
                    group: TypeGroup::Shared,
                },
                Assert::ValidAccess {
                    reg: l.access.basereg,
                    offset: l.access.offset,
                    width: Value::Imm(Imm(l.access.width.bytes() as i64)),
                    or_null: false,
                },
            ],
            Instruction::Bin(bin) => self.extract_bin(bin),
            _ => vec![],
        }
    }

    fn extract_call(&self, call: &Call) -> Vec<Assert> {
        let mut res = Vec::new();
        let mut map_fd_reg = None;
        for arg in &call.singles {
            match arg.kind {
                ArgSingleKind::Anything => {
                    // avoid pointer leakage:
                    if !self.privileged {
                        res.push(Assert::TypeConstraint {
                            reg: arg.reg,
                            group: TypeGroup::Num,
                        });
                    }
                }
                ArgSingleKind::MapFd => {
                    res.push(Assert::TypeConstraint {
                        reg: arg.reg,
                        group: TypeGroup::MapFd,
                    });
                    map_fd_reg = Some(arg.reg);
                }
                ArgSingleKind::PtrToMapKey | ArgSingleKind::PtrToMapValue => {
                    res.push(Assert::TypeConstraint {
                        reg: arg.reg,
                        group: TypeGroup::StackOrPacket,
                    });
                    if let Some(map_fd) = map_fd_reg {
                        res.push(Assert::ValidMapKeyValue {
                            access: arg.reg,
                            map_fd,
                            is_key: arg.kind == ArgSingleKind::PtrToMapKey,
                        });
                    }
                }
                ArgSingleKind::PtrToCtx => {
                    res.push(Assert::TypeConstraint {
                        reg: arg.reg,
                        group: TypeGroup::Ctx,
                    });
                }
            }
        }
        for arg in &call.pairs {
            match arg.kind {
                ArgPairKind::MemOrNull => res.push(Assert::TypeConstraint {
                    reg: arg.mem,
                    group: TypeGroup::MemOrNum,
                }),
                ArgPairKind::Mem | ArgPairKind::UninitMem => res.push(Assert::TypeConstraint {
                    reg: arg.mem,
                    group: TypeGroup::Mem,
                }),
            }
            res.push(Assert::TypeConstraint {
                reg: arg.size,
                group: TypeGroup::Num,
            });
            res.push(Assert::ValidSize {
                reg: arg.size,
                can_be_zero: arg.can_be_zero,
            });
            res.push(Assert::ValidAccess {
                reg: arg.mem,
                offset: 0,
                width: Value::Reg(arg.size),
                or_null: arg.kind == ArgPairKind::MemOrNull,
            });
        }
        res
    }

    fn explicate(&self, cond: &Condition) -> Vec<Assert> {
        if self.privileged {
            return vec![];
        }
        let mut res = vec![Assert::ValidAccess {
            reg: cond.left,
            offset: 0,
            width: Value::Imm(Imm(0)),
            or_null: false,
        }];
        match cond.right {
            Value::Imm(imm) => {
                if imm.0 != 0 {
                    res.push(Assert::TypeConstraint {
                        reg: cond.left,
                        group: TypeGroup::Num,
                    });
                }
                // comparing against zero is fine for any pointer,
                // map_fd included
            }
            Value::Reg(right) => {
                res.push(Assert::ValidAccess {
                    reg: right,
                    offset: 0,
                    width: Value::Imm(Imm(0)),
                    or_null: false,
                });
                if cond.op != CondOp::Eq && cond.op != CondOp::Ne {
                    res.push(Assert::TypeConstraint {
                        reg: cond.left,
                        group: TypeGroup::NonMapFd,
                    });
                }
                res.push(Assert::Comparable {
                    r1: cond.left,
                    r2: right,
                });
            }
        }
        res
    }

    fn extract_mem(&self, mem: &Mem) -> Vec<Assert> {
        let basereg = mem.access.basereg;
        let width = Value::Imm(Imm(mem.access.width.bytes() as i64));
        let offset = mem.access.offset;
        let mut res = Vec::new();
        if basereg.0 == 10 {
            // the access is known to stay on the stack
            res.push(Assert::ValidAccess {
                reg: basereg,
                offset,
                width,
                or_null: false,
            });
        } else {
            res.push(Assert::TypeConstraint {
                reg: basereg,
                group: TypeGroup::Ptr,
            });
            res.push(Assert::ValidAccess {
                reg: basereg,
                offset,
                width,
                or_null: false,
            });
            if !self.privileged && !mem.is_load {
                if let Value::Reg(val) = mem.value {
                    if mem.access.width != Width::DW {
                        res.push(Assert::TypeConstraint {
                            reg: val,
                            group: TypeGroup::Num,
                        });
                    } else {
                        res.push(Assert::ValidStore { mem: basereg, val });
                    }
                }
            }
        }
        res
    }

    fn extract_bin(&self, bin: &Bin) -> Vec<Assert> {
        match bin.op {
            BinOp::Mov => vec![],
            BinOp::Add => match bin.v {
                Value::Reg(v) => vec![
                    Assert::Addable { ptr: v, num: bin.dst },
                    Assert::Addable { ptr: bin.dst, num: v },
                ],
                Value::Imm(_) => vec![],
            },
            BinOp::Sub => match bin.v {
                Value::Reg(v) => vec![
                    // disallow map-map: same type does not mean same map
                    Assert::TypeConstraint {
                        reg: bin.dst,
                        group: TypeGroup::PtrOrNum,
                    },
                    Assert::Comparable { r1: v, r2: bin.dst },
                ],
                Value::Imm(_) => vec![],
            },
            _ => vec![Assert::TypeConstraint {
                reg: bin.dst,
                group: TypeGroup::Num,
            }],
        }
    }
}

/// Annotate the CFG with explicit assertions for the preconditions of
/// every instruction, preserving instruction order.
pub fn explicate_assertions(cfg: &mut Cfg, info: &ProgramInfo) {
    let extractor = AssertExtractor::new(info);
    let labels: Vec<Label> = cfg.labels().copied().collect();
    for label in labels {
        let block = cfg.get_mut(&label).unwrap();
        let mut insts = Vec::with_capacity(block.insts.len());
        for ins in block.insts.drain(..) {
            for a in extractor.extract(&ins) {
                insts.push(Instruction::Assert(a));
            }
            insts.push(ins);
        }
        block.insts = insts;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::BpfProgType;

    fn extractor(t: BpfProgType) -> AssertExtractor {
        AssertExtractor::new(&ProgramInfo::new(t, vec![]))
    }

    #[test]
    fn exit_requires_numeric_r0() {
        let asserts = extractor(BpfProgType::SocketFilter).extract(&Instruction::Exit);
        assert_eq!(
            asserts,
            vec![Assert::TypeConstraint {
                reg: Reg(0),
                group: TypeGroup::Num
            }]
        );
    }

    #[test]
    fn stack_access_skips_the_type_check() {
        let mem = Instruction::Mem(Mem {
            access: Deref {
                width: Width::DW,
                basereg: Reg(10),
                offset: -8,
            },
            value: Value::Reg(Reg(1)),
            is_load: false,
        });
        let asserts = extractor(BpfProgType::SocketFilter).extract(&mem);
        assert_eq!(asserts.len(), 1);
        assert!(matches!(asserts[0], Assert::ValidAccess { .. }));
    }

    #[test]
    fn privileged_programs_skip_condition_checks() {
        let cond = Condition {
            op: CondOp::Gt,
            left: Reg(1),
            right: Value::Reg(Reg(2)),
        };
        assert!(extractor(BpfProgType::Kprobe)
            .extract(&Instruction::Assume(cond))
            .is_empty());
        let checked = extractor(BpfProgType::SocketFilter).extract(&Instruction::Assume(cond));
        assert!(checked
            .iter()
            .any(|a| matches!(a, Assert::Comparable { .. })));
        assert!(checked.iter().any(|a| matches!(
            a,
            Assert::TypeConstraint {
                group: TypeGroup::NonMapFd,
                ..
            }
        )));
    }

    #[test]
    fn wide_store_of_register_requires_valid_store() {
        let mem = Instruction::Mem(Mem {
            access: Deref {
                width: Width::DW,
                basereg: Reg(2),
                offset: 0,
            },
            value: Value::Reg(Reg(3)),
            is_load: false,
        });
        let asserts = extractor(BpfProgType::SocketFilter).extract(&mem);
        assert!(asserts
            .iter()
            .any(|a| matches!(a, Assert::ValidStore { .. })));
    }
}
