mod common;

use bpfcheck::domain::ebpf::{T_CTX, T_NUM};
use bpfcheck::domain::{Var};
use bpfcheck::ebpf::*;
use bpfcheck::insn::Label;
use bpfcheck::program::{BpfProgType, MapDescriptor};
use common::*;

#[test]
fn trivial_program_passes() {
    // r0 = 0; exit
    let analysis = analyze(
        &[mov64_imm(0, 0), exit()],
        BpfProgType::SocketFilter,
        vec![],
    );
    assert!(analysis.passed(), "warnings: {:?}", warnings(&analysis));
    assert_eq!(analysis.db.total_warnings(), 0);
}

#[test]
fn uninitialized_stack_read_taints_the_result() {
    // r1 = *(u8 *)(r10 - 1); exit
    // the access is in bounds, but r0 is never provably numeric
    let analysis = analyze(
        &[ldx(EBPF_SIZE_B, 1, 10, -1), exit()],
        BpfProgType::SocketFilter,
        vec![],
    );
    assert!(!analysis.passed());
    let msgs = warnings(&analysis);
    assert!(
        msgs.iter().any(|m| m.contains("r0 is number")),
        "got {:?}",
        msgs
    );
}

#[test]
fn context_pointer_survives_a_stack_round_trip() {
    // r2 = r10; r2 -= 8; *(u64 *)(r2 + 0) = r1; r3 = *(u64 *)(r2 + 0);
    // r0 = 0; exit
    let analysis = analyze(
        &[
            mov64_reg(2, 10),
            alu64_imm(EBPF_ALU_SUB, 2, 8),
            stx(EBPF_SIZE_DW, 2, 1, 0),
            ldx(EBPF_SIZE_DW, 3, 2, 0),
            mov64_imm(0, 0),
            exit(),
        ],
        BpfProgType::SocketFilter,
        vec![],
    );
    assert!(analysis.passed(), "warnings: {:?}", warnings(&analysis));

    // the loaded register is again a context pointer
    let mut post = analysis.post.get(&Label::new(0)).unwrap().clone();
    assert_eq!(post.project(Var::Type(3)).singleton(), Some(T_CTX));
    assert_eq!(post.project(Var::Type(2)).singleton(), Some(bpfcheck::domain::ebpf::T_STACK));
}

#[test]
fn same_region_pointers_are_comparable() {
    // r2 = r1; r2 += 4; if r1 > r2 goto +1; r0 = 0; r0 = 0; exit
    let analysis = analyze(
        &[
            mov64_reg(2, 1),
            alu64_imm(EBPF_ALU_ADD, 2, 4),
            jmp_reg(EBPF_JMP_JGT, 1, 2, 1),
            mov64_imm(0, 0),
            mov64_imm(0, 0),
            exit(),
        ],
        BpfProgType::SocketFilter,
        vec![],
    );
    assert!(analysis.passed(), "warnings: {:?}", warnings(&analysis));
}

#[test]
fn adding_two_pointers_is_flagged() {
    // r2 = ctx->data (a packet pointer); r1 += r2
    let analysis = analyze(
        &[
            ldx(EBPF_SIZE_W, 2, 1, 0),
            alu64_reg(EBPF_ALU_ADD, 1, 2),
            mov64_imm(0, 0),
            exit(),
        ],
        BpfProgType::Xdp,
        vec![],
    );
    assert!(!analysis.passed());
    let msgs = warnings(&analysis);
    assert!(
        msgs.iter()
            .any(|m| m.contains("only numbers can be added to pointers")),
        "got {:?}",
        msgs
    );
}

#[test]
fn bounded_loop_converges_and_terminates() {
    // r1 = 0; L: r1 += 1; if r1 s< 10 goto L; r0 = 0; exit
    let analysis = analyze(
        &[
            mov64_imm(1, 0),
            alu64_imm(EBPF_ALU_ADD, 1, 1),
            jmp_imm(EBPF_JMP_JSLT, 1, 10, -2),
            mov64_imm(0, 0),
            exit(),
        ],
        BpfProgType::SocketFilter,
        vec![],
    );
    assert!(analysis.passed(), "warnings: {:?}", warnings(&analysis));
    assert_eq!(analysis.db.nonterminating().count(), 0);

    // widening plus narrowing discovers the exit bound
    let mut pre_exit = analysis.pre.get(&Label::new(3)).unwrap().clone();
    let iv = pre_exit.project(Var::Value(1));
    assert!(iv.lb >= bpfcheck::domain::Bound::Finite(10), "r1 at exit: {}", iv);
}

#[test]
fn converged_invariants_form_a_post_fixpoint() {
    // transferring any block from its converged pre-invariant lands
    // inside every successor's pre-invariant
    let analysis = analyze(
        &[
            mov64_imm(1, 0),
            alu64_imm(EBPF_ALU_ADD, 1, 1),
            jmp_imm(EBPF_JMP_JSLT, 1, 10, -2),
            mov64_imm(0, 0),
            exit(),
        ],
        BpfProgType::SocketFilter,
        vec![],
    );
    let info = bpfcheck::program::ProgramInfo::new(BpfProgType::SocketFilter, vec![]);
    for (label, pre) in &analysis.pre {
        let block = analysis.cfg.get(label).unwrap();
        let mut post = bpfcheck::transfer::transfer_block(block, pre, &info, true);
        for succ in &block.succs {
            let mut succ_pre = analysis.pre.get(succ).expect("reachable successor").clone();
            assert!(
                post.leq(&mut succ_pre),
                "post of {} escapes the pre of {}",
                label,
                succ
            );
        }
    }
}

#[test]
fn infinite_loop_is_flagged_as_nonterminating() {
    // r1 = 0; L: r1 += 0; goto L
    let analysis = analyze(
        &[mov64_imm(1, 0), alu64_imm(EBPF_ALU_ADD, 1, 0), ja(-2)],
        BpfProgType::SocketFilter,
        vec![],
    );
    assert!(!analysis.passed());
    assert!(analysis.db.nonterminating().count() > 0);
}

#[test]
fn out_of_bounds_stack_access_is_flagged() {
    // *(u64 *)(r10 - 520) = 0
    let analysis = analyze(
        &[
            st_imm(EBPF_SIZE_DW, 10, -520, 0),
            mov64_imm(0, 0),
            exit(),
        ],
        BpfProgType::SocketFilter,
        vec![],
    );
    assert!(!analysis.passed());
    let msgs = warnings(&analysis);
    assert!(
        msgs.iter().any(|m| m.contains("Lower bound")),
        "got {:?}",
        msgs
    );
}

#[test]
fn packet_access_requires_a_bounds_check() {
    // r2 = data; r3 = data_end; read without any check
    let analysis = analyze(
        &[
            ldx(EBPF_SIZE_W, 2, 1, 0),
            ldx(EBPF_SIZE_DW, 0, 2, 0),
            mov64_imm(0, 0),
            exit(),
        ],
        BpfProgType::Xdp,
        vec![],
    );
    assert!(!analysis.passed());
    let msgs = warnings(&analysis);
    assert!(
        msgs.iter().any(|m| m.contains("Upper bound")),
        "got {:?}",
        msgs
    );
}

#[test]
fn checked_packet_access_passes() {
    // r2 = data; r3 = data_end; r4 = r2; r4 += 8;
    // if r4 > r3 goto drop; r0 = *(u64 *)(r2 + 0);
    // drop: r0 = 0; exit
    let analysis = analyze(
        &[
            ldx(EBPF_SIZE_W, 2, 1, 0),
            ldx(EBPF_SIZE_W, 3, 1, 4),
            mov64_reg(4, 2),
            alu64_imm(EBPF_ALU_ADD, 4, 8),
            jmp_reg(EBPF_JMP_JGT, 4, 3, 1),
            ldx(EBPF_SIZE_DW, 0, 2, 0),
            mov64_imm(0, 0),
            exit(),
        ],
        BpfProgType::Xdp,
        vec![],
    );
    assert!(analysis.passed(), "warnings: {:?}", warnings(&analysis));
}

#[test]
fn map_lookup_null_check_flow_passes() {
    // r1 = map_fd 0; r2 = r10 - 8; *(u32 *)(r2 + 0) = 0;
    // r0 = lookup(r1, r2); if r0 == 0 goto out;
    // r1 = *(u64 *)(r0 + 0); out: r0 = 0; exit
    let mut insts = load_map_fd(1, 0).to_vec();
    insts.extend([
        mov64_reg(2, 10),
        alu64_imm(EBPF_ALU_ADD, 2, -8),
        st_imm(EBPF_SIZE_W, 2, 0, 0),
        call(1),
        jmp_imm(EBPF_JMP_JEQ, 0, 0, 1),
        ldx(EBPF_SIZE_DW, 1, 0, 0),
        mov64_imm(0, 0),
        exit(),
    ]);
    let maps = vec![MapDescriptor {
        value_size: 8,
        ..MapDescriptor::array_of(8)
    }];
    let analysis = analyze(&insts, BpfProgType::SocketFilter, maps);
    assert!(analysis.passed(), "warnings: {:?}", warnings(&analysis));
}

#[test]
fn map_value_access_without_null_check_is_flagged() {
    let mut insts = load_map_fd(1, 0).to_vec();
    insts.extend([
        mov64_reg(2, 10),
        alu64_imm(EBPF_ALU_ADD, 2, -8),
        st_imm(EBPF_SIZE_W, 2, 0, 0),
        call(1),
        ldx(EBPF_SIZE_DW, 1, 0, 0),
        mov64_imm(0, 0),
        exit(),
    ]);
    let analysis = analyze(
        &insts,
        BpfProgType::SocketFilter,
        vec![MapDescriptor::array_of(8)],
    );
    assert!(!analysis.passed());
}

#[test]
fn storing_a_pointer_to_the_packet_is_flagged() {
    // r2 = data; ...; *(u64 *)(r2 + 0) = r1   (leaks a ctx pointer)
    let analysis = analyze(
        &[
            ldx(EBPF_SIZE_W, 2, 1, 0),
            ldx(EBPF_SIZE_W, 3, 1, 4),
            mov64_reg(4, 2),
            alu64_imm(EBPF_ALU_ADD, 4, 8),
            jmp_reg(EBPF_JMP_JGT, 4, 3, 1),
            stx(EBPF_SIZE_DW, 2, 1, 0),
            mov64_imm(0, 0),
            exit(),
        ],
        BpfProgType::Xdp,
        vec![],
    );
    assert!(!analysis.passed());
    let msgs = warnings(&analysis);
    assert!(
        msgs.iter()
            .any(|m| m.contains("externally-visible")),
        "got {:?}",
        msgs
    );
}

#[test]
fn comparing_pointer_and_number_is_flagged() {
    // r2 = 5; if r1 > r2 goto L  (r1 is the ctx pointer)
    let analysis = analyze(
        &[
            mov64_imm(2, 5),
            jmp_reg(EBPF_JMP_JGT, 1, 2, 1),
            mov64_imm(0, 0),
            mov64_imm(0, 0),
            exit(),
        ],
        BpfProgType::SocketFilter,
        vec![],
    );
    assert!(!analysis.passed());
    let msgs = warnings(&analysis);
    assert!(
        msgs.iter().any(|m| m.contains("comparable")),
        "got {:?}",
        msgs
    );
}

#[test]
fn undefined_opcode_fails_deterministically() {
    let analysis = analyze(
        &[EbpfInst::new(0xf7, 0, 0, 0, 0), mov64_imm(0, 0), exit()],
        BpfProgType::SocketFilter,
        vec![],
    );
    assert!(!analysis.passed());
    let msgs = warnings(&analysis);
    assert!(
        msgs.iter().any(|m| m.contains("bad instruction")),
        "got {:?}",
        msgs
    );
}

#[test]
fn truncated_program_still_gets_a_verdict() {
    init();
    let mut raw = raw_program(
        &[EbpfInst::new(EBPF_OP_LDDW, 1, 0, 0, 7)],
        BpfProgType::SocketFilter,
        vec![],
    );
    raw.bytes.truncate(8);
    let analysis =
        bpfcheck::analyze_program(&raw, &bpfcheck::VerifierOptions::quiet()).unwrap();
    assert!(!analysis.passed());
    assert_eq!(analysis.db.total_warnings(), 1);
    assert_eq!(analysis.cfg.len(), 1);
}

#[test]
fn exit_with_pointer_in_r0_is_flagged() {
    // r0 = r1; exit  (would leak a pointer to user space)
    let analysis = analyze(
        &[mov64_reg(0, 1), exit()],
        BpfProgType::SocketFilter,
        vec![],
    );
    assert!(!analysis.passed());
}

#[test]
fn privileged_programs_may_pass_pointers_around() {
    // bpf_redirect takes two Anything arguments; under kprobe the
    // pointer-leak check on them is suppressed
    let prog = [call(23), exit()];
    let privileged = analyze(&prog, BpfProgType::Kprobe, vec![]);
    assert!(
        privileged.passed(),
        "warnings: {:?}",
        warnings(&privileged)
    );

    // the same call from an unprivileged type flags the ctx pointer
    // (and the uninitialized r2) handed to the helper
    let unprivileged = analyze(&prog, BpfProgType::SocketFilter, vec![]);
    assert!(!unprivileged.passed());
}

#[test]
fn legacy_packet_access_needs_the_skb_in_r6() {
    // the implicit skb register must hold the context
    let good = analyze(
        &[mov64_reg(6, 1), ld_abs(EBPF_SIZE_W, 0), exit()],
        BpfProgType::SocketFilter,
        vec![],
    );
    assert!(good.passed(), "warnings: {:?}", warnings(&good));

    let bad = analyze(
        &[ld_abs(EBPF_SIZE_W, 0), exit()],
        BpfProgType::SocketFilter,
        vec![],
    );
    assert!(!bad.passed());
}

#[test]
fn lock_add_requires_shared_memory() {
    // atomically add to a map value after the null check
    let mut insts = load_map_fd(1, 0).to_vec();
    insts.extend([
        mov64_reg(2, 10),
        alu64_imm(EBPF_ALU_ADD, 2, -8),
        st_imm(EBPF_SIZE_W, 2, 0, 0),
        call(1),
        jmp_imm(EBPF_JMP_JEQ, 0, 0, 2),
        mov64_imm(3, 1),
        lock_add(EBPF_SIZE_DW, 0, 3, 0),
        mov64_imm(0, 0),
        exit(),
    ]);
    let analysis = analyze(
        &insts,
        BpfProgType::SocketFilter,
        vec![MapDescriptor::array_of(8)],
    );
    assert!(analysis.passed(), "warnings: {:?}", warnings(&analysis));

    // the same atomic against the stack is not shared memory
    let on_stack = analyze(
        &[
            mov64_imm(3, 1),
            stx(EBPF_SIZE_DW, 10, 3, -8),
            lock_add(EBPF_SIZE_DW, 10, 3, -8),
            mov64_imm(0, 0),
            exit(),
        ],
        BpfProgType::SocketFilter,
        vec![],
    );
    assert!(!on_stack.passed());
}

#[test]
fn thirty_two_bit_mov_stays_numeric() {
    let analysis = analyze(
        &[
            EbpfInst::new(EBPF_CLS_ALU | EBPF_ALU_MOV, 0, 0, 0, -1),
            exit(),
        ],
        BpfProgType::SocketFilter,
        vec![],
    );
    assert!(analysis.passed(), "warnings: {:?}", warnings(&analysis));
    let mut post = analysis.post.get(&Label::new(0)).unwrap().clone();
    assert_eq!(post.project(Var::Type(0)).singleton(), Some(T_NUM));
    // the 32-bit mov wraps to an unsigned range
    let iv = post.project(Var::Value(0));
    assert!(iv.lb >= bpfcheck::domain::Bound::Finite(0), "r0: {}", iv);
}
