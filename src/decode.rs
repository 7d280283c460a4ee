//! # Decoding raw programs into the typed IR
//!
//! Lowers 8-byte instruction words into [`Instruction`]s paired with
//! their pc. Wide immediates are stitched from two consecutive words,
//! map-fd relocations rewrite the matching `LDDW` into a
//! [`LoadMapFd`], and jump offsets are resolved into labels. Decode
//! failures are fatal: the caller receives an error before any CFG is
//! built. Unknown opcodes are not errors; they decode into
//! [`Instruction::Undefined`] and fail verification later.

use crate::ebpf::{self, EbpfInst};
use crate::helpers;
use crate::insn::*;
use log::trace;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("program length {0} is not a multiple of the instruction size")]
    TruncatedInstruction(usize),

    #[error("wide immediate at pc {0} misses its second word")]
    TruncatedWideImm(Pc),

    #[error("invalid opcode {opcode:#04x} at pc {pc}")]
    InvalidOpcode { pc: Pc, opcode: u8 },

    #[error("register r{reg} at pc {pc} is out of range or not writable")]
    BadRegister { pc: Pc, reg: u8 },

    #[error("jump at pc {pc} targets pc {target}, outside the program")]
    JumpOutOfRange { pc: Pc, target: i64 },

    #[error("unknown helper function {id} at pc {pc}")]
    UnknownHelper { pc: Pc, id: i32 },
}

fn undefined(word: EbpfInst) -> Instruction {
    Instruction::Undefined(Undefined {
        opcode: word.opcode,
        dst: word.dst,
        src: word.src,
        offset: word.offset,
        imm: word.imm,
    })
}

fn width_of(size: u8) -> Option<Width> {
    match size {
        ebpf::EBPF_SIZE_B => Some(Width::B),
        ebpf::EBPF_SIZE_H => Some(Width::H),
        ebpf::EBPF_SIZE_W => Some(Width::W),
        ebpf::EBPF_SIZE_DW => Some(Width::DW),
        _ => None,
    }
}

fn readable_reg(pc: Pc, reg: u8) -> Result<Reg, DecodeError> {
    if reg >= ebpf::NREGS {
        Err(DecodeError::BadRegister { pc, reg })
    } else {
        Ok(Reg(reg))
    }
}

fn writable_reg(pc: Pc, reg: u8) -> Result<Reg, DecodeError> {
    if reg >= ebpf::R10_STACK_POINTER {
        Err(DecodeError::BadRegister { pc, reg })
    } else {
        Ok(Reg(reg))
    }
}

fn alu_source(pc: Pc, word: EbpfInst) -> Result<Value, DecodeError> {
    if word.is_reg_source() {
        Ok(Value::Reg(readable_reg(pc, word.src)?))
    } else {
        Ok(Value::Imm(Imm(word.imm as i64)))
    }
}

fn decode_alu(pc: Pc, word: EbpfInst) -> Result<Instruction, DecodeError> {
    let is64 = word.class() == ebpf::EBPF_CLS_ALU64;
    let op = match word.alu_op() {
        ebpf::EBPF_ALU_ADD => BinOp::Add,
        ebpf::EBPF_ALU_SUB => BinOp::Sub,
        ebpf::EBPF_ALU_MUL => BinOp::Mul,
        ebpf::EBPF_ALU_DIV => BinOp::Div,
        ebpf::EBPF_ALU_OR => BinOp::Or,
        ebpf::EBPF_ALU_AND => BinOp::And,
        ebpf::EBPF_ALU_LSH => BinOp::Lsh,
        ebpf::EBPF_ALU_RSH => BinOp::Rsh,
        ebpf::EBPF_ALU_MOD => BinOp::Mod,
        ebpf::EBPF_ALU_XOR => BinOp::Xor,
        ebpf::EBPF_ALU_MOV => BinOp::Mov,
        ebpf::EBPF_ALU_ARSH => BinOp::Arsh,
        ebpf::EBPF_ALU_NEG => {
            return Ok(Instruction::Un(Un {
                op: UnOp::Neg,
                dst: writable_reg(pc, word.dst)?,
            }));
        }
        ebpf::EBPF_ALU_END => {
            let to_be = word.is_reg_source();
            let op = match (word.imm, to_be) {
                (16, false) => UnOp::Le16,
                (32, false) => UnOp::Le32,
                (64, false) => UnOp::Le64,
                (16, true) => UnOp::Be16,
                (32, true) => UnOp::Be32,
                (64, true) => UnOp::Be64,
                _ => {
                    return Err(DecodeError::InvalidOpcode {
                        pc,
                        opcode: word.opcode,
                    })
                }
            };
            return Ok(Instruction::Un(Un {
                op,
                dst: writable_reg(pc, word.dst)?,
            }));
        }
        _ => return Ok(undefined(word)),
    };
    Ok(Instruction::Bin(Bin {
        op,
        dst: writable_reg(pc, word.dst)?,
        v: alu_source(pc, word)?,
        is64,
        lddw: false,
    }))
}

fn decode_jmp(
    pc: Pc,
    word: EbpfInst,
    ninsts: usize,
    starts: &[bool],
) -> Result<Instruction, DecodeError> {
    let jump_target = |pc: Pc, offset: i16| -> Result<Label, DecodeError> {
        let target = pc as i64 + 1 + offset as i64;
        if target < 0 || target as usize >= ninsts || !starts[target as usize] {
            return Err(DecodeError::JumpOutOfRange { pc, target });
        }
        Ok(Label::new(target as Pc))
    };

    let op = match word.alu_op() {
        ebpf::EBPF_JMP_JA => {
            return Ok(Instruction::Jmp(Jmp {
                cond: None,
                target: jump_target(pc, word.offset)?,
            }));
        }
        ebpf::EBPF_JMP_CALL => {
            return helpers::classify_call(word.imm)
                .map(Instruction::Call)
                .ok_or(DecodeError::UnknownHelper { pc, id: word.imm });
        }
        ebpf::EBPF_JMP_EXIT => return Ok(Instruction::Exit),
        ebpf::EBPF_JMP_JEQ => CondOp::Eq,
        ebpf::EBPF_JMP_JNE => CondOp::Ne,
        ebpf::EBPF_JMP_JSET => CondOp::Set,
        ebpf::EBPF_JMP_JGT => CondOp::Gt,
        ebpf::EBPF_JMP_JGE => CondOp::Ge,
        ebpf::EBPF_JMP_JLT => CondOp::Lt,
        ebpf::EBPF_JMP_JLE => CondOp::Le,
        ebpf::EBPF_JMP_JSGT => CondOp::Sgt,
        ebpf::EBPF_JMP_JSGE => CondOp::Sge,
        ebpf::EBPF_JMP_JSLT => CondOp::Slt,
        ebpf::EBPF_JMP_JSLE => CondOp::Sle,
        _ => return Ok(undefined(word)),
    };
    Ok(Instruction::Jmp(Jmp {
        cond: Some(Condition {
            op,
            left: readable_reg(pc, word.dst)?,
            right: alu_source(pc, word)?,
        }),
        target: jump_target(pc, word.offset)?,
    }))
}

fn decode_load_store(pc: Pc, word: EbpfInst) -> Result<Instruction, DecodeError> {
    let width = match width_of(word.size()) {
        Some(w) => w,
        None => return Ok(undefined(word)),
    };
    match (word.class(), word.mode()) {
        (ebpf::EBPF_CLS_LD, ebpf::EBPF_MODE_ABS) => Ok(Instruction::Packet(Packet {
            width,
            offset: word.imm,
            regoffset: None,
        })),
        (ebpf::EBPF_CLS_LD, ebpf::EBPF_MODE_IND) => Ok(Instruction::Packet(Packet {
            width,
            offset: word.imm,
            regoffset: Some(readable_reg(pc, word.src)?),
        })),
        (ebpf::EBPF_CLS_LDX, ebpf::EBPF_MODE_MEM) => Ok(Instruction::Mem(Mem {
            access: Deref {
                width,
                basereg: readable_reg(pc, word.src)?,
                offset: word.offset as i32,
            },
            value: Value::Reg(writable_reg(pc, word.dst)?),
            is_load: true,
        })),
        (ebpf::EBPF_CLS_ST, ebpf::EBPF_MODE_MEM) => Ok(Instruction::Mem(Mem {
            access: Deref {
                width,
                basereg: readable_reg(pc, word.dst)?,
                offset: word.offset as i32,
            },
            value: Value::Imm(Imm(word.imm as i64)),
            is_load: false,
        })),
        (ebpf::EBPF_CLS_STX, ebpf::EBPF_MODE_MEM) => Ok(Instruction::Mem(Mem {
            access: Deref {
                width,
                basereg: readable_reg(pc, word.dst)?,
                offset: word.offset as i32,
            },
            value: Value::Reg(readable_reg(pc, word.src)?),
            is_load: false,
        })),
        (ebpf::EBPF_CLS_STX, ebpf::EBPF_MODE_XADD) if matches!(width, Width::W | Width::DW) => {
            Ok(Instruction::LockAdd(LockAdd {
                access: Deref {
                    width,
                    basereg: readable_reg(pc, word.dst)?,
                    offset: word.offset as i32,
                },
                valreg: readable_reg(pc, word.src)?,
            }))
        }
        _ => Ok(undefined(word)),
    }
}

/// Decode a raw byte program into `(pc, instruction)` pairs.
///
/// `relocations` maps the pc of a `LDDW` to the index of the map it
/// loads; the matching instruction is rewritten to [`LoadMapFd`]. The
/// same rewrite applies when the word itself carries the pseudo map-fd
/// marker in its source register field.
pub fn decode_program(
    bytes: &[u8],
    relocations: &[(Pc, usize)],
) -> Result<Vec<(Pc, Instruction)>, DecodeError> {
    let words = ebpf::parse_words(bytes)
        .ok_or(DecodeError::TruncatedInstruction(bytes.len()))?;
    let relocs: BTreeMap<Pc, usize> = relocations.iter().copied().collect();

    // Record which pcs start an instruction, so that jumps into the
    // second word of a wide immediate are rejected.
    let mut starts = vec![false; words.len()];
    let mut pc = 0;
    while pc < words.len() {
        starts[pc] = true;
        pc += if words[pc].opcode == ebpf::EBPF_OP_LDDW {
            2
        } else {
            1
        };
    }

    let mut prog = Vec::with_capacity(words.len());
    let mut pc = 0;
    while pc < words.len() {
        let word = words[pc];
        let ins = match word.class() {
            ebpf::EBPF_CLS_ALU | ebpf::EBPF_CLS_ALU64 => decode_alu(pc, word)?,
            ebpf::EBPF_CLS_JMP => decode_jmp(pc, word, words.len(), &starts)?,
            ebpf::EBPF_CLS_LD if word.opcode == ebpf::EBPF_OP_LDDW => {
                let next = match words.get(pc + 1) {
                    Some(next) => *next,
                    None => return Err(DecodeError::TruncatedWideImm(pc)),
                };
                if next.opcode != 0 || next.dst != 0 || next.src != 0 || next.offset != 0 {
                    return Err(DecodeError::InvalidOpcode {
                        pc: pc + 1,
                        opcode: next.opcode,
                    });
                }
                let dst = writable_reg(pc, word.dst)?;
                let ins = if let Some(&idx) = relocs.get(&pc) {
                    Instruction::LoadMapFd(LoadMapFd {
                        dst,
                        mapfd: idx as i32,
                    })
                } else if word.src == ebpf::EBPF_PSEUDO_MAP_FD {
                    Instruction::LoadMapFd(LoadMapFd {
                        dst,
                        mapfd: word.imm,
                    })
                } else {
                    let imm = (word.imm as u32 as u64 | ((next.imm as u64) << 32)) as i64;
                    Instruction::Bin(Bin {
                        op: BinOp::Mov,
                        dst,
                        v: Value::Imm(Imm(imm)),
                        is64: true,
                        lddw: true,
                    })
                };
                trace!("{:4}: {}", pc, ins);
                prog.push((pc, ins));
                pc += 2;
                continue;
            }
            ebpf::EBPF_CLS_LD | ebpf::EBPF_CLS_LDX | ebpf::EBPF_CLS_ST | ebpf::EBPF_CLS_STX => {
                decode_load_store(pc, word)?
            }
            _ => undefined(word),
        };
        trace!("{:4}: {}", pc, ins);
        prog.push((pc, ins));
        pc += 1;
    }
    Ok(prog)
}

/// Re-encode a decoded instruction into raw words. Together with
/// [`decode_program`] this forms a round trip on canonical encodings.
pub fn encode(ins: &Instruction, pc: Pc) -> Vec<EbpfInst> {
    match ins {
        Instruction::Undefined(u) => {
            vec![EbpfInst::new(u.opcode, u.dst, u.src, u.offset, u.imm)]
        }
        Instruction::Bin(b) if b.lddw => {
            let imm = match b.v {
                Value::Imm(Imm(v)) => v,
                Value::Reg(_) => unreachable!("wide immediates carry literals"),
            };
            vec![
                EbpfInst::new(ebpf::EBPF_OP_LDDW, b.dst.0, 0, 0, imm as u32 as i32),
                EbpfInst::new(0, 0, 0, 0, ((imm as u64) >> 32) as u32 as i32),
            ]
        }
        Instruction::Bin(b) => {
            let class = if b.is64 {
                ebpf::EBPF_CLS_ALU64
            } else {
                ebpf::EBPF_CLS_ALU
            };
            let op = match b.op {
                BinOp::Add => ebpf::EBPF_ALU_ADD,
                BinOp::Sub => ebpf::EBPF_ALU_SUB,
                BinOp::Mul => ebpf::EBPF_ALU_MUL,
                BinOp::Div => ebpf::EBPF_ALU_DIV,
                BinOp::Or => ebpf::EBPF_ALU_OR,
                BinOp::And => ebpf::EBPF_ALU_AND,
                BinOp::Lsh => ebpf::EBPF_ALU_LSH,
                BinOp::Rsh => ebpf::EBPF_ALU_RSH,
                BinOp::Mod => ebpf::EBPF_ALU_MOD,
                BinOp::Xor => ebpf::EBPF_ALU_XOR,
                BinOp::Mov => ebpf::EBPF_ALU_MOV,
                BinOp::Arsh => ebpf::EBPF_ALU_ARSH,
            };
            match b.v {
                Value::Reg(r) => vec![EbpfInst::new(
                    class | ebpf::EBPF_SRC_REG | op,
                    b.dst.0,
                    r.0,
                    0,
                    0,
                )],
                Value::Imm(Imm(v)) => vec![EbpfInst::new(class | op, b.dst.0, 0, 0, v as i32)],
            }
        }
        Instruction::Un(u) => {
            let (opcode, src, imm) = match u.op {
                UnOp::Neg => (ebpf::EBPF_CLS_ALU64 | ebpf::EBPF_ALU_NEG, 0, 0),
                UnOp::Le16 => (ebpf::EBPF_CLS_ALU | ebpf::EBPF_ALU_END, 0, 16),
                UnOp::Le32 => (ebpf::EBPF_CLS_ALU | ebpf::EBPF_ALU_END, 0, 32),
                UnOp::Le64 => (ebpf::EBPF_CLS_ALU | ebpf::EBPF_ALU_END, 0, 64),
                UnOp::Be16 => (ebpf::EBPF_CLS_ALU | ebpf::EBPF_ALU_END | ebpf::EBPF_SRC_REG, 0, 16),
                UnOp::Be32 => (ebpf::EBPF_CLS_ALU | ebpf::EBPF_ALU_END | ebpf::EBPF_SRC_REG, 0, 32),
                UnOp::Be64 => (ebpf::EBPF_CLS_ALU | ebpf::EBPF_ALU_END | ebpf::EBPF_SRC_REG, 0, 64),
            };
            vec![EbpfInst::new(opcode, u.dst.0, src, 0, imm)]
        }
        Instruction::LoadMapFd(l) => vec![
            EbpfInst::new(
                ebpf::EBPF_OP_LDDW,
                l.dst.0,
                ebpf::EBPF_PSEUDO_MAP_FD,
                0,
                l.mapfd,
            ),
            EbpfInst::new(0, 0, 0, 0, 0),
        ],
        Instruction::Call(c) => vec![EbpfInst::new(
            ebpf::EBPF_CLS_JMP | ebpf::EBPF_JMP_CALL,
            0,
            0,
            0,
            c.func,
        )],
        Instruction::Exit => vec![EbpfInst::new(ebpf::EBPF_CLS_JMP | ebpf::EBPF_JMP_EXIT, 0, 0, 0, 0)],
        Instruction::Jmp(j) => {
            let offset = (j.target.from as i64 - pc as i64 - 1) as i16;
            match &j.cond {
                None => vec![EbpfInst::new(
                    ebpf::EBPF_CLS_JMP | ebpf::EBPF_JMP_JA,
                    0,
                    0,
                    offset,
                    0,
                )],
                Some(cond) => {
                    let op = match cond.op {
                        CondOp::Eq => ebpf::EBPF_JMP_JEQ,
                        CondOp::Ne => ebpf::EBPF_JMP_JNE,
                        CondOp::Set | CondOp::Nset => ebpf::EBPF_JMP_JSET,
                        CondOp::Gt => ebpf::EBPF_JMP_JGT,
                        CondOp::Ge => ebpf::EBPF_JMP_JGE,
                        CondOp::Lt => ebpf::EBPF_JMP_JLT,
                        CondOp::Le => ebpf::EBPF_JMP_JLE,
                        CondOp::Sgt => ebpf::EBPF_JMP_JSGT,
                        CondOp::Sge => ebpf::EBPF_JMP_JSGE,
                        CondOp::Slt => ebpf::EBPF_JMP_JSLT,
                        CondOp::Sle => ebpf::EBPF_JMP_JSLE,
                    };
                    match cond.right {
                        Value::Reg(r) => vec![EbpfInst::new(
                            ebpf::EBPF_CLS_JMP | ebpf::EBPF_SRC_REG | op,
                            cond.left.0,
                            r.0,
                            offset,
                            0,
                        )],
                        Value::Imm(Imm(v)) => vec![EbpfInst::new(
                            ebpf::EBPF_CLS_JMP | op,
                            cond.left.0,
                            0,
                            offset,
                            v as i32,
                        )],
                    }
                }
            }
        }
        Instruction::Mem(m) => {
            let size = match m.access.width {
                Width::B => ebpf::EBPF_SIZE_B,
                Width::H => ebpf::EBPF_SIZE_H,
                Width::W => ebpf::EBPF_SIZE_W,
                Width::DW => ebpf::EBPF_SIZE_DW,
            };
            let offset = m.access.offset as i16;
            if m.is_load {
                let dst = match m.value {
                    Value::Reg(r) => r,
                    Value::Imm(_) => unreachable!("loads target registers"),
                };
                vec![EbpfInst::new(
                    ebpf::EBPF_CLS_LDX | ebpf::EBPF_MODE_MEM | size,
                    dst.0,
                    m.access.basereg.0,
                    offset,
                    0,
                )]
            } else {
                match m.value {
                    Value::Reg(r) => vec![EbpfInst::new(
                        ebpf::EBPF_CLS_STX | ebpf::EBPF_MODE_MEM | size,
                        m.access.basereg.0,
                        r.0,
                        offset,
                        0,
                    )],
                    Value::Imm(Imm(v)) => vec![EbpfInst::new(
                        ebpf::EBPF_CLS_ST | ebpf::EBPF_MODE_MEM | size,
                        m.access.basereg.0,
                        0,
                        offset,
                        v as i32,
                    )],
                }
            }
        }
        Instruction::Packet(p) => {
            let size = match p.width {
                Width::B => ebpf::EBPF_SIZE_B,
                Width::H => ebpf::EBPF_SIZE_H,
                Width::W => ebpf::EBPF_SIZE_W,
                Width::DW => ebpf::EBPF_SIZE_DW,
            };
            match p.regoffset {
                None => vec![EbpfInst::new(
                    ebpf::EBPF_CLS_LD | ebpf::EBPF_MODE_ABS | size,
                    0,
                    0,
                    0,
                    p.offset,
                )],
                Some(r) => vec![EbpfInst::new(
                    ebpf::EBPF_CLS_LD | ebpf::EBPF_MODE_IND | size,
                    0,
                    r.0,
                    0,
                    p.offset,
                )],
            }
        }
        Instruction::LockAdd(l) => {
            let size = match l.access.width {
                Width::W => ebpf::EBPF_SIZE_W,
                _ => ebpf::EBPF_SIZE_DW,
            };
            vec![EbpfInst::new(
                ebpf::EBPF_CLS_STX | ebpf::EBPF_MODE_XADD | size,
                l.access.basereg.0,
                l.valreg.0,
                l.access.offset as i16,
                0,
            )]
        }
        Instruction::Assume(_) | Instruction::Assert(_) => {
            unreachable!("synthetic instructions have no encoding")
        }
    }
}

/// Marshal a decoded program back into its byte representation.
pub fn encode_program(prog: &[(Pc, Instruction)]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(prog.len() * ebpf::INSN_SIZE);
    for (pc, ins) in prog {
        for word in encode(ins, *pc) {
            bytes.extend_from_slice(&word.to_wire());
        }
    }
    bytes
}
