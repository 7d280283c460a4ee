mod common;

use bpfcheck::cfg::build_cfg;
use bpfcheck::decode::decode_program;
use bpfcheck::ebpf::*;
use bpfcheck::insn::*;
use common::*;

fn cfg_of(insts: &[EbpfInst]) -> bpfcheck::cfg::Cfg {
    init();
    let prog = decode_program(&bytes_of(insts), &[]).unwrap();
    build_cfg(&prog).unwrap()
}

#[test]
fn straight_line_is_one_block() {
    let cfg = cfg_of(&[mov64_imm(0, 0), exit()]);
    assert_eq!(cfg.len(), 1);
    assert_eq!(cfg.entry, Label::new(0));
    assert!(cfg.get(&cfg.entry).unwrap().succs.is_empty());
    cfg.validate().unwrap();
}

#[test]
fn conditional_branch_reifies_dual_assumes() {
    // 0: if r1 == 0 goto 2
    // 1: r0 = 1
    // 2: exit
    let cfg = cfg_of(&[jmp_imm(EBPF_JMP_JEQ, 1, 0, 1), mov64_imm(0, 1), exit()]);
    cfg.validate().unwrap();

    let entry = cfg.get(&Label::new(0)).unwrap();
    assert_eq!(entry.succs, vec![Label::edge(0, 2), Label::edge(0, 1)]);

    let taken = cfg.get(&Label::edge(0, 2)).unwrap();
    let fall = cfg.get(&Label::edge(0, 1)).unwrap();
    let cond = Condition {
        op: CondOp::Eq,
        left: Reg(1),
        right: Value::Imm(Imm(0)),
    };
    assert_eq!(taken.insts, vec![Instruction::Assume(cond)]);
    assert_eq!(fall.insts, vec![Instruction::Assume(cond.negate())]);
    assert_eq!(taken.succs, vec![Label::new(2)]);
    assert_eq!(fall.succs, vec![Label::new(1)]);
}

#[test]
fn zero_offset_branch_still_forks() {
    // 0: if r1 == 0 goto 1
    // 1: exit
    // both edges land on pc 1, but the branch must still reify dual
    // assumes
    let cfg = cfg_of(&[jmp_imm(EBPF_JMP_JEQ, 1, 0, 0), exit()]);
    cfg.validate().unwrap();

    let entry = cfg.get(&Label::new(0)).unwrap();
    assert_eq!(entry.succs, vec![Label::edge(0, 1), Label::edge(0, 0)]);

    let taken = cfg.get(&entry.succs[0]).unwrap();
    let fall = cfg.get(&entry.succs[1]).unwrap();
    assert_eq!(taken.succs, vec![Label::new(1)]);
    assert_eq!(fall.succs, vec![Label::new(1)]);
    match (&taken.insts[..], &fall.insts[..]) {
        ([Instruction::Assume(a)], [Instruction::Assume(b)]) => {
            assert_eq!(a.negate(), *b);
        }
        other => panic!("expected dual assumes, got {:?}", other),
    }
}

#[test]
fn unconditional_jump_collapses_to_an_edge() {
    // 0: goto 2
    // 1: exit        (dead)
    // 2: exit
    let cfg = cfg_of(&[ja(1), exit(), exit()]);
    cfg.validate().unwrap();
    let entry = cfg.get(&Label::new(0)).unwrap();
    assert_eq!(entry.succs, vec![Label::new(2)]);
    // no synthetic edge labels were created
    assert!(cfg.labels().all(|l| l.to.is_none()));
}

#[test]
fn every_successor_exists() {
    let cfg = cfg_of(&[
        jmp_reg(EBPF_JMP_JGT, 1, 2, 2),
        mov64_imm(0, 0),
        exit(),
        mov64_imm(0, 1),
        exit(),
    ]);
    cfg.validate().unwrap();
    for block in cfg.blocks() {
        for succ in &block.succs {
            assert!(cfg.get(succ).is_some(), "missing {}", succ);
        }
    }
}

#[test]
fn exit_blocks_have_no_successors() {
    let cfg = cfg_of(&[
        jmp_imm(EBPF_JMP_JNE, 1, 7, 1),
        exit(),
        mov64_imm(0, 0),
        exit(),
    ]);
    for block in cfg.blocks() {
        if matches!(block.insts.last(), Some(Instruction::Exit)) {
            assert!(block.succs.is_empty());
        }
    }
}

#[test]
fn simplify_merges_chains() {
    init();
    let prog = decode_program(
        &bytes_of(&[mov64_imm(0, 0), ja(0), mov64_imm(1, 1), exit()]),
        &[],
    )
    .unwrap();
    let mut cfg = build_cfg(&prog).unwrap();
    let before = cfg.len();
    cfg.simplify();
    cfg.validate().unwrap();
    assert!(cfg.len() < before);
    assert_eq!(cfg.entry, Label::new(0));
}

#[test]
fn falling_off_the_end_is_rejected() {
    init();
    let prog = decode_program(&bytes_of(&[mov64_imm(0, 0)]), &[]).unwrap();
    assert!(build_cfg(&prog).is_err());
}
