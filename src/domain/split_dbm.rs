//! # Difference-bound matrix domain
//!
//! Maintains a sparse graph of difference constraints `y − x ≤ k`
//! between named variables, with unary bounds attached through a
//! designated zero vertex. Satisfiability and the interval projection
//! are recovered by shortest-path closure; widening drops the edges
//! that did not stabilize, and narrowing restores bounds that widening
//! pushed to infinity.

use super::interval::{Bound, Interval};
use super::{CstKind, LinCst, LinExpr, Var};
use itertools::Itertools;
use log::trace;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Graph node: the zero vertex or a named variable.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum Node {
    Zero,
    Var(Var),
}

/// Operand of an arithmetic transfer.
#[derive(Copy, Clone, Debug)]
pub enum Operand {
    Var(Var),
    Const(i64),
}

impl From<Var> for Operand {
    fn from(v: Var) -> Self {
        Operand::Var(v)
    }
}

impl From<i64> for Operand {
    fn from(k: i64) -> Self {
        Operand::Const(k)
    }
}

/// Arithmetic and bitwise operations the transfer functions reduce to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Lshr,
    Ashr,
}

#[derive(Clone, Debug, Default)]
pub struct SplitDbm {
    /// `edges[(u, v)] = k` encodes `x_v − x_u ≤ k`.
    edges: BTreeMap<(Node, Node), i64>,
    closed: bool,
    bottom: bool,
}

impl SplitDbm {
    pub fn top() -> Self {
        Self {
            edges: BTreeMap::new(),
            closed: true,
            bottom: false,
        }
    }

    pub fn bottom() -> Self {
        Self {
            edges: BTreeMap::new(),
            closed: true,
            bottom: true,
        }
    }

    pub fn is_bottom(&self) -> bool {
        self.bottom
    }

    pub fn is_top(&self) -> bool {
        !self.bottom && self.edges.is_empty()
    }

    pub fn set_to_bottom(&mut self) {
        self.edges.clear();
        self.closed = true;
        self.bottom = true;
    }

    fn nodes(&self) -> BTreeSet<Node> {
        let mut nodes: BTreeSet<Node> = BTreeSet::new();
        nodes.insert(Node::Zero);
        for (u, v) in self.edges.keys() {
            nodes.insert(*u);
            nodes.insert(*v);
        }
        nodes
    }

    fn add_edge(&mut self, u: Node, v: Node, k: i64) {
        if self.bottom {
            return;
        }
        if u == v {
            if k < 0 {
                self.set_to_bottom();
            }
            return;
        }
        let entry = self.edges.entry((u, v)).or_insert(k);
        if k < *entry {
            *entry = k;
        } else if k > *entry {
            return; // no new information
        }
        self.closed = false;
    }

    /// Re-close the constraint graph: all-pairs shortest paths, with a
    /// negative cycle collapsing the state to bottom.
    pub fn normalize(&mut self) {
        if self.bottom || self.closed {
            return;
        }
        let nodes: Vec<Node> = self.nodes().into_iter().collect();
        let n = nodes.len();
        let idx: BTreeMap<Node, usize> = nodes.iter().copied().zip(0..).collect();

        let mut dist = vec![vec![None::<i64>; n]; n];
        for ((u, v), k) in &self.edges {
            let (i, j) = (idx[u], idx[v]);
            dist[i][j] = Some(match dist[i][j] {
                Some(old) => old.min(*k),
                None => *k,
            });
        }

        for k in 0..n {
            for i in 0..n {
                let via = match dist[i][k] {
                    Some(d) => d,
                    None => continue,
                };
                for j in 0..n {
                    if let Some(rest) = dist[k][j] {
                        if let Some(total) = via.checked_add(rest) {
                            if dist[i][j].map_or(true, |d| total < d) {
                                dist[i][j] = Some(total);
                            }
                        }
                    }
                }
            }
        }

        for (i, row) in dist.iter().enumerate() {
            if row[i].map_or(false, |d| d < 0) {
                trace!("negative cycle through {:?}", nodes[i]);
                self.set_to_bottom();
                return;
            }
        }

        self.edges.clear();
        for (i, row) in dist.iter().enumerate() {
            for (j, d) in row.iter().enumerate() {
                if i != j {
                    if let Some(d) = d {
                        self.edges.insert((nodes[i], nodes[j]), *d);
                    }
                }
            }
        }
        self.closed = true;
    }

    /// Interval of a variable in the closed graph.
    pub fn project(&mut self, v: Var) -> Interval {
        self.normalize();
        if self.bottom {
            return Interval::bottom();
        }
        let node = Node::Var(v);
        let ub = self
            .edges
            .get(&(Node::Zero, node))
            .map_or(Bound::PosInf, |k| Bound::Finite(*k));
        let lb = self
            .edges
            .get(&(node, Node::Zero))
            .map_or(Bound::NegInf, |k| match k.checked_neg() {
                Some(n) => Bound::Finite(n),
                None => Bound::NegInf,
            });
        Interval::new(lb, ub)
    }

    /// Interval of a linear expression.
    pub fn eval(&mut self, e: &LinExpr) -> Interval {
        let mut iv = Interval::singleton_of(e.constant);
        for (c, v) in &e.terms {
            iv = iv.add(self.project(*v).mul_const(*c));
        }
        iv
    }

    /// Drop every constraint mentioning `v`.
    pub fn forget(&mut self, v: Var) {
        if self.bottom {
            return;
        }
        // close first so information through v survives its removal
        self.normalize();
        let node = Node::Var(v);
        self.edges.retain(|(u, w), _| *u != node && *w != node);
    }

    pub fn rename(&mut self, from: Var, to: Var) {
        if self.bottom || from == to {
            return;
        }
        self.forget(to);
        let (f, t) = (Node::Var(from), Node::Var(to));
        self.edges = self
            .edges
            .iter()
            .map(|((u, v), k)| {
                let u = if *u == f { t } else { *u };
                let v = if *v == f { t } else { *v };
                ((u, v), *k)
            })
            .collect();
    }

    pub fn set(&mut self, v: Var, iv: Interval) {
        if self.bottom {
            return;
        }
        if iv.is_bottom() {
            self.set_to_bottom();
            return;
        }
        self.forget(v);
        let node = Node::Var(v);
        if let Bound::Finite(ub) = iv.ub {
            self.add_edge(Node::Zero, node, ub);
        }
        if let Bound::Finite(lb) = iv.lb {
            if let Some(neg) = lb.checked_neg() {
                self.add_edge(node, Node::Zero, neg);
            }
        }
    }

    /// `x := e`. Keeps difference relations with the unit-coefficient
    /// variables of `e`; everything else degrades to interval bounds.
    pub fn assign(&mut self, x: Var, e: impl Into<LinExpr>) {
        if self.bottom {
            return;
        }
        let e: LinExpr = e.into();

        // x := k
        if e.terms.is_empty() {
            self.set(x, Interval::singleton_of(e.constant));
            return;
        }
        // x := x + k
        if e.terms.len() == 1 && e.terms[0] == (1, x) {
            self.shift(x, e.constant);
            return;
        }
        // x := y + k
        if e.terms.len() == 1 && e.terms[0].0 == 1 {
            let y = e.terms[0].1;
            let k = e.constant;
            self.forget(x);
            let (nx, ny) = (Node::Var(x), Node::Var(y));
            // x − y ≤ k and y − x ≤ −k
            self.add_edge(ny, nx, k);
            if let Some(neg) = k.checked_neg() {
                self.add_edge(nx, ny, neg);
            }
            return;
        }

        // General case: extract difference constraints against each
        // unit-coefficient variable, then the interval of the whole
        // expression, all prior to havocking x (e may mention x).
        self.normalize();
        let value = self.eval(&e);
        let mut diffs: Vec<(Var, Option<i64>, Option<i64>)> = Vec::new();
        for (c, v) in &e.terms {
            if *c != 1 || *v == x {
                continue;
            }
            let residual = self.eval(&e.clone().sub(LinExpr::var(*v)));
            diffs.push((*v, residual.ub.finite(), residual.lb.finite()));
        }

        self.forget(x);
        let nx = Node::Var(x);
        for (v, ub, lb) in diffs {
            let nv = Node::Var(v);
            if let Some(ub) = ub {
                self.add_edge(nv, nx, ub); // x − v ≤ ub(e − v)
            }
            if let Some(lb) = lb {
                if let Some(neg) = lb.checked_neg() {
                    self.add_edge(nx, nv, neg); // v − x ≤ −lb(e − v)
                }
            }
        }
        if let Bound::Finite(ub) = value.ub {
            self.add_edge(Node::Zero, nx, ub);
        }
        if let Bound::Finite(lb) = value.lb {
            if let Some(neg) = lb.checked_neg() {
                self.add_edge(nx, Node::Zero, neg);
            }
        }
    }

    /// `x := x + k` shifts every edge incident to x.
    fn shift(&mut self, x: Var, k: i64) {
        if k == 0 {
            return;
        }
        let node = Node::Var(x);
        let mut edges = BTreeMap::new();
        for ((u, v), w) in &self.edges {
            let w = if *v == node {
                // x' − u ≤ w + k
                match w.checked_add(k) {
                    Some(w) => w,
                    None => continue,
                }
            } else if *u == node {
                // v − x' ≤ w − k
                match w.checked_sub(k) {
                    Some(w) => w,
                    None => continue,
                }
            } else {
                *w
            };
            edges.insert((*u, *v), w);
        }
        self.edges = edges;
        // shifting preserves closure
    }

    /// `x := y op z` via the strongest transfer available for the
    /// operation: relational for addition and subtraction, interval
    /// arithmetic otherwise.
    pub fn apply(&mut self, op: ArithOp, x: Var, y: Var, z: Operand) {
        if self.bottom {
            return;
        }
        match (op, z) {
            (ArithOp::Add, Operand::Const(k)) => self.assign(x, LinExpr::var(y).add(k)),
            (ArithOp::Add, Operand::Var(z)) => self.assign(x, LinExpr::var(y).add(LinExpr::var(z))),
            (ArithOp::Sub, Operand::Const(k)) => self.assign(x, LinExpr::var(y).sub(k)),
            (ArithOp::Sub, Operand::Var(z)) => self.assign(x, LinExpr::var(y).sub(LinExpr::var(z))),
            _ => {
                let iy = self.project(y);
                let iv = match (op, z) {
                    (ArithOp::Mul, Operand::Const(k)) => iy.mul_const(k),
                    (ArithOp::Mul, Operand::Var(z)) => {
                        let iz = self.project(z);
                        iy.mul(iz)
                    }
                    (ArithOp::Div, Operand::Const(k)) => iy.div_const(k),
                    (ArithOp::Rem, Operand::Const(k)) => iy.rem_const(k),
                    (ArithOp::And, Operand::Const(k)) => iy.and_const(k),
                    (ArithOp::Shl, Operand::Const(k)) => iy.shl_const(k),
                    (ArithOp::Ashr, Operand::Const(k)) => iy.ashr_const(k),
                    (ArithOp::Lshr, Operand::Const(k)) if iy.lb >= Bound::Finite(0) => {
                        iy.ashr_const(k)
                    }
                    _ => Interval::top(),
                };
                self.set(x, iv);
            }
        }
    }

    /// Conjoin a linear constraint.
    pub fn add_constraint(&mut self, cst: &LinCst) {
        if self.bottom {
            return;
        }
        if cst.is_tautology() {
            return;
        }
        if cst.is_contradiction() {
            self.set_to_bottom();
            return;
        }
        match cst.kind {
            CstKind::LeqZero => self.add_leq(&cst.expr),
            CstKind::EqZero => {
                self.add_leq(&cst.expr);
                self.add_leq(&cst.expr.clone().negate());
            }
            CstKind::NeqZero => self.add_disequation(&cst.expr),
        }
    }

    /// `e ≤ 0`.
    fn add_leq(&mut self, e: &LinExpr) {
        match e.terms.as_slice() {
            [] => {
                if e.constant > 0 {
                    self.set_to_bottom();
                }
            }
            [(1, v)] => {
                // v ≤ −k
                if let Some(ub) = e.constant.checked_neg() {
                    self.add_edge(Node::Zero, Node::Var(*v), ub);
                }
            }
            [(-1, v)] => {
                // −v + k ≤ 0 ⇔ v ≥ k ⇔ 0 − v ≤ −k
                if let Some(w) = e.constant.checked_neg() {
                    self.add_edge(Node::Var(*v), Node::Zero, w);
                }
            }
            [(1, a), (-1, b)] | [(-1, b), (1, a)] => {
                // a − b ≤ −k
                if let Some(w) = e.constant.checked_neg() {
                    self.add_edge(Node::Var(*b), Node::Var(*a), w);
                }
            }
            _ => self.add_leq_general(e),
        }
    }

    /// Decompose a general inequality into pairwise difference and
    /// unary residual bounds.
    fn add_leq_general(&mut self, e: &LinExpr) {
        self.normalize();

        let pos: Vec<Var> = e
            .terms
            .iter()
            .filter(|(c, _)| *c == 1)
            .map(|(_, v)| *v)
            .collect();
        let neg: Vec<Var> = e
            .terms
            .iter()
            .filter(|(c, _)| *c == -1)
            .map(|(_, v)| *v)
            .collect();

        // vi − vj ≤ −lb(rest) for every positive/negative pair
        let mut edges = Vec::new();
        for (vi, vj) in pos.iter().cartesian_product(neg.iter()) {
            let rest = e
                .clone()
                .sub(LinExpr::var(*vi))
                .add(LinExpr::var(*vj));
            if let Some(lb) = self.eval(&rest).lb.finite() {
                if let Some(w) = lb.checked_neg() {
                    edges.push((Node::Var(*vj), Node::Var(*vi), w));
                }
            }
        }

        // unary residual bound for every term
        let mut bounds = Vec::new();
        for (c, v) in &e.terms {
            let rest = e.clone().sub(LinExpr {
                terms: vec![(*c, *v)],
                constant: 0,
            });
            let residual = self.eval(&rest).negate().div_const(*c);
            if *c > 0 {
                if let Some(ub) = residual.ub.finite() {
                    bounds.push((Node::Zero, Node::Var(*v), ub));
                }
            } else if let Some(lb) = residual.lb.finite() {
                if let Some(w) = lb.checked_neg() {
                    bounds.push((Node::Var(*v), Node::Zero, w));
                }
            }
        }

        for (u, v, w) in edges.into_iter().chain(bounds) {
            self.add_edge(u, v, w);
        }
    }

    /// `e ≠ 0`: refine intervals whose endpoint would make `e` zero.
    fn add_disequation(&mut self, e: &LinExpr) {
        for (c, v) in e.terms.clone() {
            let residual = self
                .eval(&e.clone().sub(LinExpr {
                    terms: vec![(c, v)],
                    constant: 0,
                }))
                .negate()
                .div_const(c);
            if let Some(k) = residual.singleton() {
                let iv = self.project(v);
                if iv.singleton() == Some(k) {
                    self.set_to_bottom();
                    return;
                }
                if iv.lb == Bound::Finite(k) {
                    self.add_edge(Node::Var(v), Node::Zero, -(k + 1));
                }
                if iv.ub == Bound::Finite(k) {
                    self.add_edge(Node::Zero, Node::Var(v), k - 1);
                }
            }
        }
    }

    /// Inclusion test: does every constraint of `other` hold here?
    pub fn leq(&mut self, other: &SplitDbm) -> bool {
        if self.bottom {
            return true;
        }
        if other.bottom {
            return false;
        }
        self.normalize();
        if self.bottom {
            return true;
        }
        other
            .edges
            .iter()
            .all(|(key, k2)| self.edges.get(key).map_or(false, |k1| k1 <= k2))
    }

    /// Least upper bound: the pointwise-weakest constraints implied by
    /// both closed operands.
    pub fn join(&mut self, other: &mut SplitDbm) -> SplitDbm {
        if self.bottom {
            return other.clone();
        }
        if other.bottom {
            return self.clone();
        }
        self.normalize();
        other.normalize();
        if self.bottom {
            return other.clone();
        }
        if other.bottom {
            return self.clone();
        }
        let mut edges = BTreeMap::new();
        for (key, k1) in &self.edges {
            if let Some(k2) = other.edges.get(key) {
                edges.insert(*key, *k1.max(k2));
            }
        }
        SplitDbm {
            edges,
            closed: true,
            bottom: false,
        }
    }

    /// Greatest lower bound.
    pub fn meet(&mut self, other: &SplitDbm) -> SplitDbm {
        if self.bottom || other.bottom {
            return SplitDbm::bottom();
        }
        let mut result = self.clone();
        for ((u, v), k) in &other.edges {
            result.add_edge(*u, *v, *k);
        }
        result.normalize();
        result
    }

    /// Widening: keep only the edges of `self` that stayed stable in
    /// `next`. The result is deliberately left unclosed so that dropped
    /// bounds are not rederived.
    pub fn widen(&self, next: &mut SplitDbm) -> SplitDbm {
        if self.bottom {
            let mut n = next.clone();
            n.normalize();
            return n;
        }
        if next.bottom {
            return self.clone();
        }
        next.normalize();
        let mut edges = BTreeMap::new();
        for (key, k1) in &self.edges {
            if let Some(k2) = next.edges.get(key) {
                if k2 <= k1 {
                    edges.insert(*key, *k1);
                }
            }
        }
        SplitDbm {
            edges,
            closed: false,
            bottom: false,
        }
    }

    /// Narrowing: refine only the bounds that widening sent to
    /// infinity.
    pub fn narrow(&self, other: &mut SplitDbm) -> SplitDbm {
        if self.bottom || other.is_bottom() {
            return SplitDbm::bottom();
        }
        other.normalize();
        if other.is_bottom() {
            return SplitDbm::bottom();
        }
        let mut edges = self.edges.clone();
        for (key, k) in &other.edges {
            edges.entry(*key).or_insert(*k);
        }
        let mut result = SplitDbm {
            edges,
            closed: false,
            bottom: false,
        };
        result.normalize();
        result
    }

    /// Constraints in display form, bounds first.
    pub fn constraints(&self) -> Vec<String> {
        let mut out = Vec::new();
        for ((u, v), k) in &self.edges {
            match (u, v) {
                (Node::Zero, Node::Var(v)) => out.push(format!("{} <= {}", v, k)),
                (Node::Var(v), Node::Zero) => out.push(format!("{} >= {}", v, -k)),
                (Node::Var(u), Node::Var(v)) => out.push(format!("{} - {} <= {}", v, u, k)),
                _ => {}
            }
        }
        out
    }
}

impl fmt::Display for SplitDbm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.bottom {
            return write!(f, "_|_");
        }
        if self.edges.is_empty() {
            return write!(f, "{{}}");
        }
        write!(f, "{{{}}}", self.constraints().join(", "))
    }
}
