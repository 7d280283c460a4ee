//! # Control flow graph construction
//!
//! Blocks are keyed by [`Label`]s synthesized from pcs. Conditional
//! jumps are reified into nondeterministic choice: the jump block gets
//! two successors, each a synthetic edge block whose first instruction
//! is an `Assume` of the condition or of its negation. Unconditional
//! jumps collapse into plain edges.

use crate::insn::*;
use indexmap::IndexMap;
use log::debug;
use petgraph::graph::{Graph, NodeIndex};
use std::collections::{BTreeSet, HashMap};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CfgError {
    #[error("program is empty")]
    EmptyProgram,

    #[error("control falls through the end of the program after pc {0}")]
    FallthroughExit(Pc),

    #[error("label {0} is referenced but does not exist")]
    MissingLabel(Label),

    #[error("block {0} ends in neither an exit nor a jump")]
    OpenBlock(Label),
}

/// A basic block: straight-line instructions plus an ordered successor
/// list.
#[derive(Clone, Debug)]
pub struct BasicBlock {
    pub label: Label,
    pub insts: Vec<Instruction>,
    pub succs: Vec<Label>,
    pub preds: Vec<Label>,
}

impl BasicBlock {
    fn new(label: Label) -> Self {
        Self {
            label,
            insts: Vec::new(),
            succs: Vec::new(),
            preds: Vec::new(),
        }
    }
}

/// The control flow graph of one program. Owns its blocks; blocks own
/// their instructions. Insertion order follows program order.
#[derive(Clone, Debug)]
pub struct Cfg {
    pub entry: Label,
    blocks: IndexMap<Label, BasicBlock>,
}

impl Cfg {
    pub fn get(&self, label: &Label) -> Option<&BasicBlock> {
        self.blocks.get(label)
    }

    pub fn get_mut(&mut self, label: &Label) -> Option<&mut BasicBlock> {
        self.blocks.get_mut(label)
    }

    pub fn labels(&self) -> impl Iterator<Item = &Label> {
        self.blocks.keys()
    }

    pub fn blocks(&self) -> impl Iterator<Item = &BasicBlock> {
        self.blocks.values()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Labels in ascending pc order, the order reports are rendered in.
    pub fn sorted_labels(&self) -> Vec<Label> {
        let mut labels: Vec<Label> = self.blocks.keys().copied().collect();
        labels.sort();
        labels
    }

    /// Number of instructions across all blocks.
    pub fn instruction_count(&self) -> usize {
        self.blocks.values().map(|b| b.insts.len()).sum()
    }

    /// Check the structural invariants: the entry exists, every
    /// successor resolves, and every block is properly terminated.
    pub fn validate(&self) -> Result<(), CfgError> {
        if !self.blocks.contains_key(&self.entry) {
            return Err(CfgError::MissingLabel(self.entry));
        }
        for block in self.blocks.values() {
            for succ in &block.succs {
                if !self.blocks.contains_key(succ) {
                    return Err(CfgError::MissingLabel(*succ));
                }
            }
            if block.succs.is_empty() {
                let exits = matches!(
                    block.insts.last(),
                    Some(Instruction::Exit) | Some(Instruction::Undefined(_))
                );
                if !exits {
                    return Err(CfgError::OpenBlock(block.label));
                }
            }
        }
        Ok(())
    }

    /// Project onto a petgraph graph for order and loop computations.
    pub fn to_graph(&self) -> (Graph<Label, ()>, HashMap<Label, NodeIndex>) {
        let mut graph = Graph::new();
        let mut nodes = HashMap::new();
        for label in self.blocks.keys() {
            nodes.insert(*label, graph.add_node(*label));
        }
        for block in self.blocks.values() {
            for succ in &block.succs {
                graph.add_edge(nodes[&block.label], nodes[succ], ());
            }
        }
        (graph, nodes)
    }

    /// Merge single-successor blocks into their single-predecessor
    /// successor. Keeps the entry label stable.
    pub fn simplify(&mut self) {
        loop {
            let candidate = self.blocks.values().find_map(|b| {
                if b.succs.len() != 1 {
                    return None;
                }
                let succ = b.succs[0];
                if succ == self.entry || succ == b.label {
                    return None;
                }
                if self.blocks[&succ].preds.len() != 1 {
                    return None;
                }
                Some((b.label, succ))
            });
            let (from, into) = match candidate {
                Some(pair) => pair,
                None => break,
            };
            let absorbed = self.blocks.shift_remove(&into).unwrap();
            let block = self.blocks.get_mut(&from).unwrap();
            block.insts.extend(absorbed.insts);
            block.succs = absorbed.succs.clone();
            for succ in &absorbed.succs {
                let preds = &mut self.blocks.get_mut(succ).unwrap().preds;
                for p in preds.iter_mut() {
                    if *p == into {
                        *p = from;
                    }
                }
            }
            debug!("simplify: merged {} into {}", into, from);
        }
    }
}

/// Build the nondeterministic CFG of a decoded program.
pub fn build_cfg(prog: &[(Pc, Instruction)]) -> Result<Cfg, CfgError> {
    if prog.is_empty() {
        return Err(CfgError::EmptyProgram);
    }

    // A block starts at the entry, at every jump target, and after
    // every jump.
    let mut starts: BTreeSet<Pc> = BTreeSet::new();
    starts.insert(prog[0].0);
    for (i, (_, ins)) in prog.iter().enumerate() {
        match ins {
            Instruction::Jmp(jmp) => {
                starts.insert(jmp.target.from);
                if let Some((next_pc, _)) = prog.get(i + 1) {
                    starts.insert(*next_pc);
                }
            }
            Instruction::Exit => {
                if let Some((next_pc, _)) = prog.get(i + 1) {
                    starts.insert(*next_pc);
                }
            }
            _ => {}
        }
    }

    let index_of: HashMap<Pc, usize> = prog.iter().enumerate().map(|(i, (pc, _))| (*pc, i)).collect();

    let mut cfg = Cfg {
        entry: Label::new(prog[0].0),
        blocks: IndexMap::new(),
    };
    let mut edge_blocks: Vec<(Label, Condition, Label)> = Vec::new();

    let mut starts_iter = starts.iter().peekable();
    while let Some(&start) = starts_iter.next() {
        let label = Label::new(start);
        let mut block = BasicBlock::new(label);
        let end = starts_iter.peek().map(|&&pc| pc);

        let mut i = index_of[&start];
        loop {
            let (pc, ins) = &prog[i];
            block.insts.push(ins.clone());

            let next_pc = prog.get(i + 1).map(|(pc, _)| *pc);
            let is_last_of_block = match next_pc {
                Some(next) => Some(next) == end,
                None => true,
            };

            match ins {
                Instruction::Exit => {}
                Instruction::Jmp(jmp) => match &jmp.cond {
                    None => block.succs.push(jmp.target),
                    Some(cond) => {
                        let fall = next_pc.ok_or(CfgError::FallthroughExit(*pc))?;
                        let taken = Label::edge(*pc, jmp.target.from);
                        // A branch targeting its own fall-through still
                        // gets dual assume edges; its fall-through edge
                        // is keyed by the branch pc so the labels stay
                        // distinct.
                        let not_taken = if jmp.target.from == fall {
                            Label::edge(*pc, *pc)
                        } else {
                            Label::edge(*pc, fall)
                        };
                        edge_blocks.push((taken, *cond, jmp.target));
                        edge_blocks.push((not_taken, cond.negate(), Label::new(fall)));
                        block.succs.push(taken);
                        block.succs.push(not_taken);
                    }
                },
                _ if is_last_of_block => {
                    let fall = next_pc.ok_or(CfgError::FallthroughExit(*pc))?;
                    block.succs.push(Label::new(fall));
                }
                _ => {
                    i += 1;
                    continue;
                }
            }
            break;
        }
        cfg.blocks.insert(label, block);
    }

    for (label, cond, target) in edge_blocks {
        let mut block = BasicBlock::new(label);
        block.insts.push(Instruction::Assume(cond));
        block.succs.push(target);
        cfg.blocks.insert(label, block);
    }

    let edges: Vec<(Label, Label)> = cfg
        .blocks
        .values()
        .flat_map(|b| b.succs.iter().map(move |s| (b.label, *s)))
        .collect();
    for (from, to) in edges {
        match cfg.blocks.get_mut(&to) {
            Some(block) => block.preds.push(from),
            None => return Err(CfgError::MissingLabel(to)),
        }
    }

    cfg.validate()?;
    debug!(
        "built CFG with {} blocks over {} instructions",
        cfg.len(),
        prog.len()
    );
    Ok(cfg)
}

/// A CFG standing in for a program that failed to decode: one block
/// holding a single `Undefined` instruction.
pub fn undefined_cfg() -> Cfg {
    let label = Label::entry();
    let mut block = BasicBlock::new(label);
    block.insts.push(Instruction::Undefined(Undefined {
        opcode: 0,
        dst: 0,
        src: 0,
        offset: 0,
        imm: 0,
    }));
    let mut blocks = IndexMap::new();
    blocks.insert(label, block);
    Cfg {
        entry: label,
        blocks,
    }
}
