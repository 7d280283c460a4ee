//! # Forward fixpoint engine
//!
//! Worklist iteration over the CFG in weak topological order, widening
//! at loop heads once a block has been revisited enough times, followed
//! by one narrowing pass. Produces the pre- and post-invariant tables
//! the reporting stage consumes.

use crate::cfg::Cfg;
use crate::domain::EbpfDomain;
use crate::insn::Label;
use crate::liveness::Liveness;
use crate::program::ProgramInfo;
use crate::transfer::transfer_block;
use crate::verifier::{VerificationError, VerifierOptions};
use log::{debug, trace};
use petgraph::graph::{Graph, NodeIndex};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

pub type InvariantTable = BTreeMap<Label, EbpfDomain>;

/// Ascending visits of a loop head before the first widening.
const WIDENING_DELAY: usize = 2;

/// Hard cap on worklist pops, far above anything widening should need.
const MAX_ITERATIONS_PER_BLOCK: usize = 200;

/// A weak topological order: a recursive-component ordering of the CFG
/// with the component heads marked as widening points.
pub struct Wto {
    pub order: Vec<Label>,
    pub heads: HashSet<Label>,
}

/// Bourdoncle's linear-time hierarchical-ordering algorithm over the
/// petgraph projection of the CFG.
pub fn compute_wto(cfg: &Cfg) -> Wto {
    struct State<'g> {
        graph: &'g Graph<Label, ()>,
        dfn: HashMap<NodeIndex, usize>,
        num: usize,
        stack: Vec<NodeIndex>,
        order: Vec<Label>,
        heads: HashSet<Label>,
    }

    impl<'g> State<'g> {
        fn component(&mut self, v: NodeIndex) {
            let succs: Vec<NodeIndex> = self.graph.neighbors(v).collect();
            for w in succs {
                if self.dfn.get(&w) == Some(&0) {
                    self.visit(w);
                }
            }
        }

        fn visit(&mut self, v: NodeIndex) -> usize {
            self.stack.push(v);
            self.num += 1;
            let this = self.num;
            self.dfn.insert(v, this);
            let mut head = this;
            let mut loops = false;

            let succs: Vec<NodeIndex> = self.graph.neighbors(v).collect();
            for w in succs {
                let min = match self.dfn.get(&w) {
                    Some(0) | None => self.visit(w),
                    Some(n) => *n,
                };
                if min <= head {
                    head = min;
                    loops = true;
                }
            }

            if head == this {
                self.dfn.insert(v, usize::MAX);
                let mut element = self.stack.pop().unwrap();
                if loops {
                    while element != v {
                        self.dfn.insert(element, 0);
                        element = self.stack.pop().unwrap();
                    }
                    // members first: the order is built back-to-front,
                    // so the head must land before its component
                    self.component(v);
                    self.heads.insert(self.graph[v]);
                }
                self.order.push(self.graph[v]);
            }
            head
        }
    }

    let (graph, nodes) = cfg.to_graph();
    let mut state = State {
        graph: &graph,
        dfn: graph.node_indices().map(|n| (n, 0)).collect(),
        num: 0,
        stack: Vec::new(),
        order: Vec::new(),
        heads: HashSet::new(),
    };
    state.visit(nodes[&cfg.entry]);

    // visit() appends on component exit: reverse into execution order
    let mut order = state.order;
    order.reverse();

    // anything unreachable from the entry goes last, untouched by the
    // analysis
    let seen: HashSet<Label> = order.iter().copied().collect();
    for label in cfg.labels() {
        if !seen.contains(label) {
            order.push(*label);
        }
    }

    debug!("wto: {} blocks, {} loop heads", order.len(), state.heads.len());
    Wto {
        order,
        heads: state.heads,
    }
}

fn trimmed_for(
    mut state: EbpfDomain,
    succ: &Label,
    liveness: Option<&Liveness>,
) -> EbpfDomain {
    if let Some(live) = liveness {
        for reg in live.dead_in(succ) {
            state.havoc_reg(reg);
        }
    }
    state
}

/// Run the forward analyzer to a post-fixpoint and return the pre- and
/// post-invariant tables.
pub fn run_forward(
    cfg: &Cfg,
    info: &ProgramInfo,
    options: &VerifierOptions,
    liveness: Option<&Liveness>,
) -> Result<(InvariantTable, InvariantTable), VerificationError> {
    let wto = compute_wto(cfg);
    let position: HashMap<Label, usize> = wto
        .order
        .iter()
        .enumerate()
        .map(|(i, l)| (*l, i))
        .collect();

    let mut pre: InvariantTable = BTreeMap::new();
    pre.insert(cfg.entry, EbpfDomain::setup_entry(info));

    let mut visits: HashMap<Label, usize> = HashMap::new();
    let mut worklist: BTreeSet<usize> = BTreeSet::new();
    worklist.insert(position[&cfg.entry]);

    let max_pops = cfg.len().max(1) * MAX_ITERATIONS_PER_BLOCK;
    let mut pops = 0;

    while let Some(&idx) = worklist.iter().next() {
        worklist.remove(&idx);
        options.poll_cancellation()?;

        pops += 1;
        if pops > max_pops {
            return Err(VerificationError::FixpointDiverged);
        }

        let label = wto.order[idx];
        *visits.entry(label).or_default() += 1;
        let pre_l = match pre.get(&label) {
            Some(inv) => inv.clone(),
            None => continue, // still unreachable
        };

        let block = cfg.get(&label).expect("wto order stays within the cfg");
        let mut post = transfer_block(block, &pre_l, info, options.check_termination);
        if post.is_bottom() {
            continue;
        }

        for succ in block.succs.clone() {
            let incoming = trimmed_for(post.clone(), &succ, liveness);
            let widen_here =
                wto.heads.contains(&succ) && visits.get(&succ).copied().unwrap_or(0) >= WIDENING_DELAY;

            let updated = match pre.get(&succ) {
                None => incoming,
                Some(old) => {
                    let joined = old.clone().join(incoming);
                    if widen_here {
                        trace!("widening at {}", succ);
                        old.clone().widen(joined)
                    } else {
                        joined
                    }
                }
            };

            let changed = match pre.get(&succ) {
                None => true,
                Some(old) => !updated.clone().leq(&mut old.clone()),
            };
            if changed {
                pre.insert(succ, updated);
                worklist.insert(position[&succ]);
            }
        }
    }

    if options.narrow {
        narrowing_pass(cfg, info, options, liveness, &wto, &mut pre)?;
    }

    let mut post: InvariantTable = BTreeMap::new();
    for (label, inv) in &pre {
        let block = cfg.get(label).expect("invariant tables index the cfg");
        post.insert(
            *label,
            transfer_block(block, inv, info, options.check_termination),
        );
    }

    debug!("fixpoint converged after {} block transfers", pops);
    Ok((pre, post))
}

/// One descending pass: refine each pre-state with the join of its
/// predecessors' posts, only tightening bounds that widening lost.
fn narrowing_pass(
    cfg: &Cfg,
    info: &ProgramInfo,
    options: &VerifierOptions,
    liveness: Option<&Liveness>,
    wto: &Wto,
    pre: &mut InvariantTable,
) -> Result<(), VerificationError> {
    let mut post: InvariantTable = BTreeMap::new();
    for label in &wto.order {
        options.poll_cancellation()?;
        if let Some(inv) = pre.get(label) {
            let block = cfg.get(label).unwrap();
            post.insert(
                *label,
                transfer_block(block, inv, info, options.check_termination),
            );
        }
    }

    for label in &wto.order {
        if *label == cfg.entry {
            continue;
        }
        let block = cfg.get(label).unwrap();
        let mut candidate = EbpfDomain::bottom();
        for p in &block.preds {
            if let Some(p_post) = post.get(p) {
                candidate = candidate.join(trimmed_for(p_post.clone(), label, liveness));
            }
        }
        if let Some(old) = pre.get(label) {
            let refined = old.clone().narrow(candidate);
            let new_post = transfer_block(block, &refined, info, options.check_termination);
            post.insert(*label, new_post);
            pre.insert(*label, refined);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::build_cfg;
    use crate::insn::*;

    fn jmp(cond: Option<Condition>, target: Pc) -> Instruction {
        Instruction::Jmp(Jmp {
            cond,
            target: Label::new(target),
        })
    }

    fn mov(dst: u8, imm: i64) -> Instruction {
        Instruction::Bin(Bin {
            op: BinOp::Mov,
            dst: Reg(dst),
            v: Value::Imm(Imm(imm)),
            is64: true,
            lddw: false,
        })
    }

    #[test]
    fn loop_head_is_detected() {
        // 0: r1 = 0
        // 1: r1 += 1
        // 2: if r1 < 10 goto 1
        // 3: exit
        let prog = vec![
            (0, mov(1, 0)),
            (
                1,
                Instruction::Bin(Bin {
                    op: BinOp::Add,
                    dst: Reg(1),
                    v: Value::Imm(Imm(1)),
                    is64: true,
                    lddw: false,
                }),
            ),
            (
                2,
                jmp(
                    Some(Condition {
                        op: CondOp::Slt,
                        left: Reg(1),
                        right: Value::Imm(Imm(10)),
                    }),
                    1,
                ),
            ),
            (3, Instruction::Exit),
        ];
        let cfg = build_cfg(&prog).unwrap();
        let wto = compute_wto(&cfg);
        assert!(wto.heads.contains(&Label::new(1)), "heads: {:?}", wto.heads);
        assert_eq!(wto.order.len(), cfg.len());
        assert_eq!(wto.order[0], Label::new(0));
    }

    #[test]
    fn straight_line_has_no_heads() {
        let prog = vec![(0, mov(0, 0)), (1, Instruction::Exit)];
        let cfg = build_cfg(&prog).unwrap();
        let wto = compute_wto(&cfg);
        assert!(wto.heads.is_empty());
    }
}
