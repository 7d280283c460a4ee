#[macro_use]
pub mod util;

pub mod assertions;
pub mod cfg;
pub mod decode;
pub mod domain;
pub mod ebpf;
pub mod fixpoint;
pub mod helpers;
pub mod insn;
pub mod liveness;
pub mod program;
pub mod report;
pub mod transfer;
pub mod verifier;

pub use verifier::{analyze_program, run_verification, VerifierOptions};
