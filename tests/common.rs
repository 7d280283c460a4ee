use bpfcheck::ebpf::*;
use bpfcheck::program::{BpfProgType, MapDescriptor, ProgramInfo, RawProgram};
use bpfcheck::verifier::{analyze_program, Analysis, VerifierOptions};

pub fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn bytes_of(insts: &[EbpfInst]) -> Vec<u8> {
    insts.iter().flat_map(|i| i.to_wire()).collect()
}

pub fn raw_program(
    insts: &[EbpfInst],
    prog_type: BpfProgType,
    maps: Vec<MapDescriptor>,
) -> RawProgram {
    RawProgram {
        filename: "<test>".to_string(),
        section: String::new(),
        bytes: bytes_of(insts),
        relocations: vec![],
        info: ProgramInfo::new(prog_type, maps),
    }
}

pub fn analyze(insts: &[EbpfInst], prog_type: BpfProgType, maps: Vec<MapDescriptor>) -> Analysis {
    init();
    let raw = raw_program(insts, prog_type, maps);
    analyze_program(&raw, &VerifierOptions::quiet()).expect("analysis must complete")
}

pub fn warnings(analysis: &Analysis) -> Vec<String> {
    analysis
        .db
        .iter()
        .flat_map(|(label, reports)| {
            reports
                .iter()
                .map(move |(_, msg)| format!("{}: {}", label, msg))
        })
        .collect()
}

// instruction builders, in kernel opcode vocabulary

pub fn mov64_imm(dst: u8, imm: i32) -> EbpfInst {
    EbpfInst::new(EBPF_CLS_ALU64 | EBPF_ALU_MOV, dst, 0, 0, imm)
}

pub fn mov64_reg(dst: u8, src: u8) -> EbpfInst {
    EbpfInst::new(EBPF_CLS_ALU64 | EBPF_ALU_MOV | EBPF_SRC_REG, dst, src, 0, 0)
}

pub fn alu64_imm(op: u8, dst: u8, imm: i32) -> EbpfInst {
    EbpfInst::new(EBPF_CLS_ALU64 | op, dst, 0, 0, imm)
}

pub fn alu64_reg(op: u8, dst: u8, src: u8) -> EbpfInst {
    EbpfInst::new(EBPF_CLS_ALU64 | op | EBPF_SRC_REG, dst, src, 0, 0)
}

pub fn jmp_imm(op: u8, dst: u8, imm: i32, off: i16) -> EbpfInst {
    EbpfInst::new(EBPF_CLS_JMP | op, dst, 0, off, imm)
}

pub fn jmp_reg(op: u8, dst: u8, src: u8, off: i16) -> EbpfInst {
    EbpfInst::new(EBPF_CLS_JMP | op | EBPF_SRC_REG, dst, src, off, 0)
}

pub fn ja(off: i16) -> EbpfInst {
    EbpfInst::new(EBPF_CLS_JMP | EBPF_JMP_JA, 0, 0, off, 0)
}

pub fn ldx(size: u8, dst: u8, src: u8, off: i16) -> EbpfInst {
    EbpfInst::new(EBPF_CLS_LDX | EBPF_MODE_MEM | size, dst, src, off, 0)
}

pub fn stx(size: u8, dst: u8, src: u8, off: i16) -> EbpfInst {
    EbpfInst::new(EBPF_CLS_STX | EBPF_MODE_MEM | size, dst, src, off, 0)
}

pub fn st_imm(size: u8, dst: u8, off: i16, imm: i32) -> EbpfInst {
    EbpfInst::new(EBPF_CLS_ST | EBPF_MODE_MEM | size, dst, 0, off, imm)
}

pub fn ld_abs(size: u8, imm: i32) -> EbpfInst {
    EbpfInst::new(EBPF_CLS_LD | EBPF_MODE_ABS | size, 0, 0, 0, imm)
}

pub fn lock_add(size: u8, dst: u8, src: u8, off: i16) -> EbpfInst {
    EbpfInst::new(EBPF_CLS_STX | EBPF_MODE_XADD | size, dst, src, off, 0)
}

pub fn call(helper: i32) -> EbpfInst {
    EbpfInst::new(EBPF_CLS_JMP | EBPF_JMP_CALL, 0, 0, 0, helper)
}

pub fn exit() -> EbpfInst {
    EbpfInst::new(EBPF_CLS_JMP | EBPF_JMP_EXIT, 0, 0, 0, 0)
}

pub fn load_map_fd(dst: u8, fd: i32) -> [EbpfInst; 2] {
    [
        EbpfInst::new(EBPF_OP_LDDW, dst, EBPF_PSEUDO_MAP_FD, 0, fd),
        EbpfInst::new(0, 0, 0, 0, 0),
    ]
}

pub fn lddw(dst: u8, imm: i64) -> [EbpfInst; 2] {
    [
        EbpfInst::new(EBPF_OP_LDDW, dst, 0, 0, imm as u32 as i32),
        EbpfInst::new(0, 0, 0, 0, ((imm as u64) >> 32) as u32 as i32),
    ]
}
