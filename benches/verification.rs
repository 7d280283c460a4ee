use bpfcheck::ebpf::*;
use bpfcheck::program::{BpfProgType, ProgramInfo, RawProgram};
use bpfcheck::verifier::{analyze_program, VerifierOptions};
use criterion::{criterion_group, criterion_main, Criterion};

fn raw(insts: &[EbpfInst], prog_type: BpfProgType) -> RawProgram {
    RawProgram {
        filename: "<bench>".to_string(),
        section: String::new(),
        bytes: insts.iter().flat_map(|i| i.to_wire()).collect(),
        relocations: vec![],
        info: ProgramInfo::new(prog_type, vec![]),
    }
}

fn bench_trivial(c: &mut Criterion) {
    let prog = raw(
        &[
            EbpfInst::new(EBPF_CLS_ALU64 | EBPF_ALU_MOV, 0, 0, 0, 0),
            EbpfInst::new(EBPF_CLS_JMP | EBPF_JMP_EXIT, 0, 0, 0, 0),
        ],
        BpfProgType::SocketFilter,
    );
    let options = VerifierOptions::quiet();
    c.bench_function("trivial", |b| {
        b.iter(|| analyze_program(&prog, &options).unwrap())
    });
}

fn bench_bounded_loop(c: &mut Criterion) {
    let prog = raw(
        &[
            EbpfInst::new(EBPF_CLS_ALU64 | EBPF_ALU_MOV, 1, 0, 0, 0),
            EbpfInst::new(EBPF_CLS_ALU64 | EBPF_ALU_ADD, 1, 0, 0, 1),
            EbpfInst::new(EBPF_CLS_JMP | EBPF_JMP_JSLT, 1, 0, -2, 1000),
            EbpfInst::new(EBPF_CLS_ALU64 | EBPF_ALU_MOV, 0, 0, 0, 0),
            EbpfInst::new(EBPF_CLS_JMP | EBPF_JMP_EXIT, 0, 0, 0, 0),
        ],
        BpfProgType::SocketFilter,
    );
    let options = VerifierOptions::quiet();
    c.bench_function("bounded_loop", |b| {
        b.iter(|| analyze_program(&prog, &options).unwrap())
    });
}

criterion_group!(benches, bench_trivial, bench_bounded_loop);
criterion_main!(benches);
