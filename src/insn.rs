//! # Typed instruction representation
//!
//! The decoder lowers raw instruction words into this IR. Conditional
//! control flow is reified during CFG construction: branch edges begin
//! with an [`Instruction::Assume`] of the (negated) condition, and the
//! assertion pass prepends [`Instruction::Assert`] statements carrying
//! the kernel-mandated preconditions of each instruction.

use std::fmt;

/// Instruction index into the decoded program (byte offset / 8).
pub type Pc = usize;

/// A register index in `0..=10`; `r10` is the frame pointer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Reg(pub u8);

/// A 64-bit signed literal.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Imm(pub i64);

/// Register-or-immediate operand.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Value {
    Reg(Reg),
    Imm(Imm),
}

/// Memory access width in bytes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Width {
    B = 1,
    H = 2,
    W = 4,
    DW = 8,
}

impl Width {
    pub fn bytes(self) -> i32 {
        self as i32
    }
}

/// Identifies a basic block. Plain program labels carry the pc of their
/// first instruction; branch labels `p:q` name the edge from the
/// conditional jump at `p` to its successor at `q`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Label {
    pub from: Pc,
    pub to: Option<Pc>,
}

impl Label {
    pub fn new(pc: Pc) -> Self {
        Self { from: pc, to: None }
    }

    pub fn edge(from: Pc, to: Pc) -> Self {
        Self {
            from,
            to: Some(to),
        }
    }

    pub fn entry() -> Self {
        Self::new(0)
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to {
            None => write!(f, "{}", self.from),
            Some(to) => write!(f, "{}:{}", self.from, to),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BinOp {
    Mov,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Or,
    And,
    Lsh,
    Rsh,
    Arsh,
    Xor,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum UnOp {
    Le16,
    Le32,
    Le64,
    Be16,
    Be32,
    Be64,
    Neg,
}

/// `dst op= v`, on the full register or on the low 32 bits.
#[derive(Clone, Debug, PartialEq)]
pub struct Bin {
    pub op: BinOp,
    pub dst: Reg,
    pub v: Value,
    pub is64: bool,
    /// Came from a two-word wide immediate; re-encodes as such.
    pub lddw: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Un {
    pub op: UnOp,
    pub dst: Reg,
}

/// `dst = fd`, the result of a map-fd relocation applied to a `LDDW`.
#[derive(Clone, Debug, PartialEq)]
pub struct LoadMapFd {
    pub dst: Reg,
    pub mapfd: i32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CondOp {
    Eq,
    Ne,
    Set,
    /// The negation of `Set`; only produced by branch reification.
    Nset,
    Lt,
    Le,
    Gt,
    Ge,
    Slt,
    Sle,
    Sgt,
    Sge,
}

impl CondOp {
    pub fn negate(self) -> Self {
        use CondOp::*;
        match self {
            Eq => Ne,
            Ne => Eq,
            Set => Nset,
            Nset => Set,
            Lt => Ge,
            Ge => Lt,
            Le => Gt,
            Gt => Le,
            Slt => Sge,
            Sge => Slt,
            Sle => Sgt,
            Sgt => Sle,
        }
    }

    pub fn is_unsigned(self) -> bool {
        matches!(self, CondOp::Lt | CondOp::Le | CondOp::Gt | CondOp::Ge)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Condition {
    pub op: CondOp,
    pub left: Reg,
    pub right: Value,
}

impl Condition {
    pub fn negate(self) -> Self {
        Self {
            op: self.op.negate(),
            ..self
        }
    }
}

/// Conditional or unconditional jump. The target pc is materialized as a
/// label by the decoder.
#[derive(Clone, Debug, PartialEq)]
pub struct Jmp {
    pub cond: Option<Condition>,
    pub target: Label,
}

/// A dereference through `basereg`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Deref {
    pub width: Width,
    pub basereg: Reg,
    pub offset: i32,
}

/// Load or store through a register.
#[derive(Clone, Debug, PartialEq)]
pub struct Mem {
    pub access: Deref,
    pub value: Value,
    pub is_load: bool,
}

/// Legacy socket-filter packet access; implicitly reads the skb in `r6`
/// and writes `r0`.
#[derive(Clone, Debug, PartialEq)]
pub struct Packet {
    pub width: Width,
    pub offset: i32,
    pub regoffset: Option<Reg>,
}

/// Atomic add to a shared memory region.
#[derive(Clone, Debug, PartialEq)]
pub struct LockAdd {
    pub access: Deref,
    pub valreg: Reg,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ArgSingleKind {
    Anything,
    MapFd,
    PtrToMapKey,
    PtrToMapValue,
    PtrToCtx,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ArgSingle {
    pub kind: ArgSingleKind,
    pub reg: Reg,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ArgPairKind {
    Mem,
    MemOrNull,
    UninitMem,
}

/// A pointer argument together with the register holding its size.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ArgPair {
    pub kind: ArgPairKind,
    pub mem: Reg,
    pub size: Reg,
    pub can_be_zero: bool,
}

/// Call to a kernel helper by numeric id, with its arguments already
/// classified against the helper prototype.
#[derive(Clone, Debug, PartialEq)]
pub struct Call {
    pub func: i32,
    pub name: &'static str,
    pub singles: Vec<ArgSingle>,
    pub pairs: Vec<ArgPair>,
    pub returns_map: bool,
}

/// An unrecognized instruction word. Decoding it is not an error; the
/// full word is preserved so the program still round-trips, and the
/// checker reports the opcode when the instruction is reached.
#[derive(Clone, Debug, PartialEq)]
pub struct Undefined {
    pub opcode: u8,
    pub dst: u8,
    pub src: u8,
    pub offset: i16,
    pub imm: i32,
}

/// Register type groups referenced by assertions; each group denotes an
/// interval in the numeric encoding of type tags.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TypeGroup {
    Num,
    MapFd,
    Ctx,
    Packet,
    Stack,
    Shared,
    NonMapFd,
    Mem,
    MemOrNum,
    Ptr,
    PtrOrNum,
    StackOrPacket,
}

/// A kernel-mandated precondition, checked and then assumed.
#[derive(Clone, Debug, PartialEq)]
pub enum Assert {
    TypeConstraint {
        reg: Reg,
        group: TypeGroup,
    },
    /// `width` is `Imm(0)` for comparison checks and a register for
    /// variable-size helper arguments.
    ValidAccess {
        reg: Reg,
        offset: i32,
        width: Value,
        or_null: bool,
    },
    ValidStore {
        mem: Reg,
        val: Reg,
    },
    ValidSize {
        reg: Reg,
        can_be_zero: bool,
    },
    ValidMapKeyValue {
        access: Reg,
        map_fd: Reg,
        is_key: bool,
    },
    Comparable {
        r1: Reg,
        r2: Reg,
    },
    Addable {
        ptr: Reg,
        num: Reg,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub enum Instruction {
    Undefined(Undefined),
    Bin(Bin),
    Un(Un),
    LoadMapFd(LoadMapFd),
    Call(Call),
    Exit,
    Jmp(Jmp),
    Mem(Mem),
    Packet(Packet),
    LockAdd(LockAdd),
    Assume(Condition),
    Assert(Assert),
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

impl fmt::Display for Imm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= 0xffff_ffff {
            write!(f, "{} ll", self.0)
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Reg(r) => write!(f, "{}", r),
            Value::Imm(imm) => write!(f, "{}", imm),
        }
    }
}

impl fmt::Display for Width {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Width::B => "u8",
            Width::H => "u16",
            Width::W => "u32",
            Width::DW => "u64",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for BinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinOp::Mov => "",
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Or => "|",
            BinOp::And => "&",
            BinOp::Lsh => "<<",
            BinOp::Rsh => ">>",
            BinOp::Arsh => ">>>",
            BinOp::Xor => "^",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for CondOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CondOp::Eq => "==",
            CondOp::Ne => "!=",
            CondOp::Set => "&==",
            CondOp::Nset => "&!=",
            CondOp::Lt => "<",
            CondOp::Le => "<=",
            CondOp::Gt => ">",
            CondOp::Ge => ">=",
            CondOp::Slt => "s<",
            CondOp::Sle => "s<=",
            CondOp::Sgt => "s>",
            CondOp::Sge => "s>=",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.left, self.op, self.right)
    }
}

impl fmt::Display for TypeGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TypeGroup::Num => "number",
            TypeGroup::MapFd => "map_fd",
            TypeGroup::Ctx => "ctx",
            TypeGroup::Packet => "packet",
            TypeGroup::Stack => "stack",
            TypeGroup::Shared => "shared",
            TypeGroup::NonMapFd => "non_map_fd",
            TypeGroup::Mem => "memory",
            TypeGroup::MemOrNum => "memory or number",
            TypeGroup::Ptr => "pointer",
            TypeGroup::PtrOrNum => "pointer or number",
            TypeGroup::StackOrPacket => "stack or packet",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for Assert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Assert::TypeConstraint { reg, group } => write!(f, "{} is {}", reg, group),
            Assert::ValidAccess {
                reg,
                offset,
                width,
                or_null,
            } => {
                write!(f, "valid_access({}, {}, {})", reg, offset, width)?;
                if *or_null {
                    write!(f, " or null")?;
                }
                Ok(())
            }
            Assert::ValidStore { mem, val } => write!(f, "valid_store({}, {})", mem, val),
            Assert::ValidSize { reg, can_be_zero } => {
                write!(f, "{} {} 0", reg, if *can_be_zero { ">=" } else { ">" })
            }
            Assert::ValidMapKeyValue {
                access,
                map_fd,
                is_key,
            } => write!(
                f,
                "valid_map_{}({}, {})",
                if *is_key { "key" } else { "value" },
                access,
                map_fd
            ),
            Assert::Comparable { r1, r2 } => write!(f, "comparable({}, {})", r1, r2),
            Assert::Addable { ptr, num } => write!(f, "addable({}, {})", ptr, num),
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Undefined(u) => write!(f, "Undefined{{{:#04x}}}", u.opcode),
            Instruction::Bin(b) => {
                write!(f, "{} {}= {}", b.dst, b.op, b.v)?;
                if !b.is64 {
                    write!(f, " & 0xFFFFFFFF")?;
                }
                Ok(())
            }
            Instruction::Un(u) => match u.op {
                UnOp::Neg => write!(f, "{} = -{}", u.dst, u.dst),
                UnOp::Le16 => write!(f, "{} = le16 {}", u.dst, u.dst),
                UnOp::Le32 => write!(f, "{} = le32 {}", u.dst, u.dst),
                UnOp::Le64 => write!(f, "{} = le64 {}", u.dst, u.dst),
                UnOp::Be16 => write!(f, "{} = be16 {}", u.dst, u.dst),
                UnOp::Be32 => write!(f, "{} = be32 {}", u.dst, u.dst),
                UnOp::Be64 => write!(f, "{} = be64 {}", u.dst, u.dst),
            },
            Instruction::LoadMapFd(l) => write!(f, "{} = map_fd {}", l.dst, l.mapfd),
            Instruction::Call(c) => write!(f, "call {} ({})", c.func, c.name),
            Instruction::Exit => write!(f, "return r0"),
            Instruction::Jmp(j) => match &j.cond {
                Some(cond) => write!(f, "if {} goto {}", cond, j.target),
                None => write!(f, "goto {}", j.target),
            },
            Instruction::Mem(m) => {
                if m.is_load {
                    write!(f, "{} = ", m.value)?;
                    write!(
                        f,
                        "*({} *)({} + {})",
                        m.access.width, m.access.basereg, m.access.offset
                    )
                } else {
                    write!(
                        f,
                        "*({} *)({} + {}) = {}",
                        m.access.width, m.access.basereg, m.access.offset, m.value
                    )
                }
            }
            Instruction::Packet(p) => {
                write!(f, "r0 = *({} *)skb[", p.width)?;
                if let Some(r) = p.regoffset {
                    write!(f, "{}", r)?;
                    if p.offset != 0 {
                        write!(f, " + ")?;
                    }
                }
                if p.offset != 0 || p.regoffset.is_none() {
                    write!(f, "{}", p.offset)?;
                }
                write!(f, "]")
            }
            Instruction::LockAdd(l) => write!(
                f,
                "lock *({} *)({} + {}) += {}",
                l.access.width, l.access.basereg, l.access.offset, l.valreg
            ),
            Instruction::Assume(cond) => write!(f, "assume {}", cond),
            Instruction::Assert(a) => write!(f, "assert {}", a),
        }
    }
}
