//! # Verification driver
//!
//! Wires the pipeline together: decode → CFG → assertion explication →
//! fixpoint → report. Every input produces an answer; a program that
//! fails to decode is replaced by a single-block program whose sole
//! instruction is undefined, yielding one deterministic warning.

use crate::assertions::explicate_assertions;
use crate::cfg::{self, Cfg, CfgError};
use crate::decode::decode_program;
use crate::domain::EbpfDomain;
use crate::fixpoint::{run_forward, InvariantTable};
use crate::insn::Label;
use crate::liveness;
use crate::program::RawProgram;
use crate::report::ChecksDb;
use crate::transfer::check_block;
use log::{debug, info};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VerificationError {
    #[error("verification aborted by the host")]
    Aborted,

    #[error("fixpoint iteration failed to stabilize")]
    FixpointDiverged,

    #[error(transparent)]
    Cfg(#[from] CfgError),

    #[error("failed to write the report")]
    Io(#[from] std::io::Error),
}

/// The abstract domains this build can analyze with.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DomainChoice {
    /// Split difference-bound matrix with stack array expansion.
    SdbmArr,
    /// Build the CFG only; skip the analysis.
    None,
}

/// Names and descriptions for the CLI.
pub fn domain_descriptions() -> Vec<(&'static str, &'static str)> {
    vec![
        ("sdbm-arr", "mem: split dbm with array expansion (default)"),
        ("none", "build CFG only, don't perform analysis"),
    ]
}

pub fn parse_domain(name: &str) -> Option<DomainChoice> {
    match name {
        "sdbm-arr" => Some(DomainChoice::SdbmArr),
        "none" => Some(DomainChoice::None),
        _ => None,
    }
}

#[derive(Clone, Debug)]
pub struct VerifierOptions {
    pub domain: DomainChoice,
    pub print_invariants: bool,
    pub print_failures: bool,
    pub check_termination: bool,
    pub check_semantic_reachability: bool,
    pub simplify: bool,
    pub liveness: bool,
    pub narrow: bool,
    pub stats: bool,
    /// Set by the host to stop the analysis; polled between block
    /// transfers.
    pub cancel: Option<Arc<AtomicBool>>,
}

impl Default for VerifierOptions {
    fn default() -> Self {
        Self {
            domain: DomainChoice::SdbmArr,
            print_invariants: true,
            print_failures: true,
            check_termination: true,
            check_semantic_reachability: false,
            simplify: false,
            liveness: true,
            narrow: true,
            stats: false,
            cancel: None,
        }
    }
}

impl VerifierOptions {
    /// Quiet configuration for library callers and tests.
    pub fn quiet() -> Self {
        Self {
            print_invariants: false,
            print_failures: false,
            ..Self::default()
        }
    }

    pub fn poll_cancellation(&self) -> Result<(), VerificationError> {
        match &self.cancel {
            Some(flag) if flag.load(Ordering::Relaxed) => Err(VerificationError::Aborted),
            _ => Ok(()),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Stats {
    pub blocks: usize,
    pub instructions: usize,
    pub seconds: f64,
}

/// Everything one verification produced.
pub struct Analysis {
    pub cfg: Cfg,
    pub pre: InvariantTable,
    pub post: InvariantTable,
    pub db: ChecksDb,
    pub stats: Stats,
}

impl Analysis {
    pub fn passed(&self) -> bool {
        self.db.passed()
    }
}

/// Analyze a raw program. Decode failures degrade into a one-warning
/// report instead of an error, so every input gets a verdict.
pub fn analyze_program(
    raw: &RawProgram,
    options: &VerifierOptions,
) -> Result<Analysis, VerificationError> {
    let start = Instant::now();

    let prog = match decode_program(&raw.bytes, &raw.relocations) {
        Ok(prog) => prog,
        Err(err) => return Ok(trivial_failure(err, start)),
    };

    let mut cfg = match cfg::build_cfg(&prog) {
        Ok(cfg) => cfg,
        Err(err) => {
            debug!("cfg construction failed: {}", err);
            return Ok(trivial_failure(err, start));
        }
    };
    if options.simplify {
        cfg.simplify();
    }
    explicate_assertions(&mut cfg, &raw.info);

    let stats = Stats {
        blocks: cfg.len(),
        instructions: cfg.instruction_count(),
        seconds: 0.0,
    };

    if options.domain == DomainChoice::None {
        return Ok(Analysis {
            cfg,
            pre: InvariantTable::new(),
            post: InvariantTable::new(),
            db: ChecksDb::new(),
            stats: Stats {
                seconds: start.elapsed().as_secs_f64(),
                ..stats
            },
        });
    }

    let live = options.liveness.then(|| liveness::compute(&cfg));
    let (pre, post) = time_phase!(debug, "fixpoint", {
        run_forward(&cfg, &raw.info, options, live.as_ref())?
    });

    let db = generate_report(&cfg, raw, options, &pre)?;

    Ok(Analysis {
        cfg,
        pre,
        post,
        db,
        stats: Stats {
            seconds: start.elapsed().as_secs_f64(),
            ..stats
        },
    })
}

fn trivial_failure(err: impl std::fmt::Display, start: Instant) -> Analysis {
    let cfg = cfg::undefined_cfg();
    let mut db = ChecksDb::new();
    db.add_warning(Label::entry(), format!("bad instruction: {}", err));
    Analysis {
        stats: Stats {
            blocks: cfg.len(),
            instructions: cfg.instruction_count(),
            seconds: start.elapsed().as_secs_f64(),
        },
        cfg,
        pre: InvariantTable::new(),
        post: InvariantTable::new(),
        db,
    }
}

/// Replay every block from its pre-invariant with checking enabled,
/// collecting warnings, unreachability, and the termination verdict.
fn generate_report(
    cfg: &Cfg,
    raw: &RawProgram,
    options: &VerifierOptions,
    pre: &InvariantTable,
) -> Result<ChecksDb, VerificationError> {
    let mut db = ChecksDb::new();
    for label in cfg.sorted_labels() {
        options.poll_cancellation()?;
        let block = cfg.get(&label).unwrap();
        let mut from_inv = match pre.get(&label) {
            Some(inv) => inv.clone(),
            None => EbpfDomain::bottom(),
        };

        if options.check_termination {
            let mut pre_join_terminates = false;
            for prev in &block.preds {
                let mut prev_inv = match pre.get(prev) {
                    Some(inv) => inv.clone(),
                    None => EbpfDomain::bottom(),
                };
                pre_join_terminates |= prev_inv.terminates();
            }
            if pre_join_terminates && !from_inv.terminates() {
                db.add_nontermination(label);
            }
        }

        let pre_bot = from_inv.is_bottom();
        let mut post =
            check_block(block, &from_inv, &raw.info, options.check_termination, &mut db);
        let post_bot = post.is_bottom();

        if !pre_bot && post_bot {
            db.add_unreachable(label, format!("Code becomes unreachable after {}", label));
        }
        if options.check_semantic_reachability && post_bot && label.to.is_none() {
            db.add_warning(label, "unreachable".to_string());
        }
    }
    Ok(db)
}

/// Run one verification and render its output. Returns whether the
/// program passed.
pub fn run_verification(
    raw: &RawProgram,
    options: &VerifierOptions,
    out: &mut dyn Write,
) -> Result<bool, VerificationError> {
    info!(
        "verifying {} ({}, {} maps)",
        raw.filename,
        raw.info.prog_type,
        raw.info.maps.len()
    );

    let analysis = time_phase!(info, format!("verification of {}", raw.filename).as_str(), {
        analyze_program(raw, options)?
    });

    if options.print_invariants && options.domain != DomainChoice::None {
        for label in analysis.cfg.sorted_labels() {
            let block = analysis.cfg.get(&label).unwrap();
            writeln!(out)?;
            match analysis.pre.get(&label) {
                Some(inv) => writeln!(out, "{}", inv)?,
                None => writeln!(out, "_|_")?,
            }
            writeln!(out, "{}:", label)?;
            for ins in &block.insts {
                writeln!(out, "    {}", ins)?;
            }
            match analysis.post.get(&label) {
                Some(inv) => writeln!(out, "{}", inv)?,
                None => writeln!(out, "_|_")?,
            }
        }
        writeln!(out)?;
    }

    if options.print_failures {
        write!(out, "{}", analysis.db)?;
    }
    if options.stats {
        writeln!(
            out,
            "{} blocks, {} instructions",
            analysis.stats.blocks, analysis.stats.instructions
        )?;
        writeln!(out, "seconds:{}", analysis.stats.seconds)?;
    }

    Ok(analysis.passed())
}
