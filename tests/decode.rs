mod common;

use bpfcheck::decode::{decode_program, encode_program, DecodeError};
use bpfcheck::ebpf::*;
use bpfcheck::insn::*;
use common::*;

#[test]
fn round_trip_canonical_program() {
    init();
    let mut insts = vec![
        mov64_imm(0, 0),
        mov64_reg(2, 10),
        alu64_imm(EBPF_ALU_ADD, 2, -8),
        stx(EBPF_SIZE_DW, 2, 1, 0),
        ldx(EBPF_SIZE_W, 3, 2, 0),
        jmp_imm(EBPF_JMP_JEQ, 3, 0, 1),
        alu64_reg(EBPF_ALU_ADD, 0, 3),
        exit(),
    ];
    insts.extend(lddw(4, 0x1234_5678_9abc_def0u64 as i64));
    insts.push(exit());

    let bytes = bytes_of(&insts);
    let prog = decode_program(&bytes, &[]).unwrap();
    assert_eq!(encode_program(&prog), bytes);
}

#[test]
fn wide_immediate_is_stitched() {
    init();
    let mut insts = lddw(3, -2i64).to_vec();
    insts.push(exit());
    let prog = decode_program(&bytes_of(&insts), &[]).unwrap();
    assert_eq!(prog.len(), 2);
    match &prog[0] {
        (0, Instruction::Bin(bin)) => {
            assert_eq!(bin.dst, Reg(3));
            assert!(bin.is64 && bin.lddw);
            assert_eq!(bin.v, Value::Imm(Imm(-2)));
        }
        other => panic!("unexpected {:?}", other),
    }
    // the decoder advanced past both words
    assert_eq!(prog[1].0, 2);
}

#[test]
fn truncated_wide_immediate_fails() {
    init();
    let only_half = [EbpfInst::new(EBPF_OP_LDDW, 1, 0, 0, 7)];
    assert_eq!(
        decode_program(&bytes_of(&only_half), &[]),
        Err(DecodeError::TruncatedWideImm(0))
    );
}

#[test]
fn partial_word_fails() {
    init();
    let mut bytes = bytes_of(&[exit()]);
    bytes.pop();
    assert!(matches!(
        decode_program(&bytes, &[]),
        Err(DecodeError::TruncatedInstruction(_))
    ));
}

#[test]
fn relocation_rewrites_the_wide_load() {
    init();
    let mut insts = lddw(1, 0).to_vec();
    insts.push(exit());
    let prog = decode_program(&bytes_of(&insts), &[(0, 3)]).unwrap();
    assert_eq!(
        prog[0].1,
        Instruction::LoadMapFd(LoadMapFd {
            dst: Reg(1),
            mapfd: 3
        })
    );
}

#[test]
fn pseudo_map_fd_marker_is_honored() {
    init();
    let mut insts = load_map_fd(2, 5).to_vec();
    insts.push(exit());
    let prog = decode_program(&bytes_of(&insts), &[]).unwrap();
    assert_eq!(
        prog[0].1,
        Instruction::LoadMapFd(LoadMapFd {
            dst: Reg(2),
            mapfd: 5
        })
    );
}

#[test]
fn jump_out_of_range_fails() {
    init();
    let insts = [jmp_imm(EBPF_JMP_JEQ, 1, 0, 5), exit()];
    assert_eq!(
        decode_program(&bytes_of(&insts), &[]),
        Err(DecodeError::JumpOutOfRange { pc: 0, target: 6 })
    );
}

#[test]
fn jump_into_wide_immediate_fails() {
    init();
    let mut insts = vec![jmp_imm(EBPF_JMP_JNE, 1, 0, 1)];
    insts.extend(lddw(2, 1));
    insts.push(exit());
    // target pc 2 is the second word of the lddw
    assert_eq!(
        decode_program(&bytes_of(&insts), &[]),
        Err(DecodeError::JumpOutOfRange { pc: 0, target: 2 })
    );
}

#[test]
fn unknown_opcode_decodes_to_undefined() {
    init();
    let insts = [EbpfInst::new(0xf7, 0, 0, 0, 0), exit()];
    let prog = decode_program(&bytes_of(&insts), &[]).unwrap();
    assert_eq!(
        prog[0].1,
        Instruction::Undefined(Undefined {
            opcode: 0xf7,
            dst: 0,
            src: 0,
            offset: 0,
            imm: 0,
        })
    );
}

#[test]
fn unrecognized_words_round_trip_with_their_fields() {
    init();
    // class 0x06 carries no meaning here; every field must survive
    let insts = [EbpfInst::new(0x16, 3, 2, -4, 99), exit()];
    let bytes = bytes_of(&insts);
    let prog = decode_program(&bytes, &[]).unwrap();
    assert_eq!(
        prog[0].1,
        Instruction::Undefined(Undefined {
            opcode: 0x16,
            dst: 3,
            src: 2,
            offset: -4,
            imm: 99,
        })
    );
    assert_eq!(encode_program(&prog), bytes);
}

#[test]
fn unknown_helper_fails() {
    init();
    let insts = [call(4242), exit()];
    assert_eq!(
        decode_program(&bytes_of(&insts), &[]),
        Err(DecodeError::UnknownHelper { pc: 0, id: 4242 })
    );
}

#[test]
fn writes_to_the_frame_pointer_are_rejected() {
    init();
    let insts = [mov64_imm(10, 0), exit()];
    assert_eq!(
        decode_program(&bytes_of(&insts), &[]),
        Err(DecodeError::BadRegister { pc: 0, reg: 10 })
    );
}

#[test]
fn call_arguments_are_classified() {
    init();
    let insts = [call(1), exit()];
    let prog = decode_program(&bytes_of(&insts), &[]).unwrap();
    match &prog[0].1 {
        Instruction::Call(c) => {
            assert_eq!(c.name, "bpf_map_lookup_elem");
            assert!(c.returns_map);
            assert_eq!(c.singles.len(), 2);
        }
        other => panic!("unexpected {:?}", other),
    }
}
