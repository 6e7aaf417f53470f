//! Strategy graphs: selection, scheduling, and chain emission.
//!
//! Nodes live in a flat arena and refer to each other by id. Parameter
//! resolution follows the param-edge topological order (producers
//! first); execution order follows the strategy edges plus interference
//! edges discovered during scheduling. Selection walks candidates
//! best-first with backtracking, recording constraint failures into the
//! caller's [`FailRecord`].

use super::node::{
    BranchReq, GadgetType, Node, NodeCheck, NodeId, Param, ParamId, ParamValue,
};
use crate::arch::Arch;
use crate::chain::RopChain;
use crate::constraint::{Constraint, FailRecord};
use crate::db::{BaseDb, GadgetDb};
use crate::expr::{Binop, RegId};
use crate::gadget::{BranchKind, Gadget, GadgetId};
use std::collections::HashMap;
use tracing::trace;

/// Rewrite guards: maximum rule-application depth and node count.
pub const MAX_RULE_DEPTH: usize = 8;
pub const MAX_GRAPH_WIDTH: usize = 12;

/// A selection candidate: free-parameter bindings plus a gadget.
#[derive(Debug, Clone)]
struct Candidate {
    bindings: Vec<(ParamId, ParamValue)>,
    gadget: GadgetId,
}

#[derive(Debug, Clone, Copy)]
enum KeyKind {
    Reg,
    Cst,
    Op,
}

/// A chain plus the item indices whose value is the address of the
/// *next* emitted chain (jmp data links, resolved across IL
/// instructions).
#[derive(Debug, Clone)]
pub struct ChainDraft {
    pub chain: RopChain,
    pub data_links: Vec<usize>,
}

/// Shared selection context.
pub struct SelectCtx<'a> {
    pub db: &'a GadgetDb,
    pub arch: &'a Arch,
    pub constraint: &'a Constraint,
    pub fail: &'a mut FailRecord,
    /// Cooperative cancellation, checked between DFS siblings.
    pub cancel: Option<&'a crate::compiler::CancelFlag>,
    pub cancelled: bool,
}

impl SelectCtx<'_> {
    fn check_cancel(&mut self) -> bool {
        if let Some(flag) = self.cancel {
            if flag.is_cancelled() {
                self.cancelled = true;
            }
        }
        self.cancelled
    }
}

/// An abstract plan for realising one IL instruction.
#[derive(Debug, Clone, Default)]
pub struct StrategyGraph {
    pub nodes: Vec<Node>,
    /// Number of rewrite rules applied on the way to this graph.
    pub rule_depth: usize,
}

impl StrategyGraph {
    pub fn new() -> Self {
        StrategyGraph::default()
    }

    pub fn new_node(&mut self, kind: GadgetType) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(Node::new(id, kind));
        id
    }

    pub fn add_strategy_edge(&mut self, from: NodeId, to: NodeId) {
        self.nodes[from].strategy_edges.add_outgoing(to);
        self.nodes[to].strategy_edges.add_incoming(from);
    }

    pub fn add_param_edge(&mut self, from: NodeId, to: NodeId) {
        self.nodes[from].param_edges.add_outgoing(to);
        self.nodes[to].param_edges.add_incoming(from);
    }

    /// Recompute param edges from the declared dependencies.
    pub fn update_param_edges(&mut self) {
        for n in &mut self.nodes {
            n.param_edges = Default::default();
        }
        let deps: Vec<(NodeId, NodeId)> = self
            .nodes
            .iter()
            .flat_map(|n| {
                n.params
                    .iter()
                    .flat_map(|p| p.deps.iter().map(|d| (d.node, n.id)))
                    .collect::<Vec<_>>()
            })
            .collect();
        for (from, to) in deps {
            if from != to {
                self.add_param_edge(from, to);
            }
        }
    }

    /// Redirect every dependency on `(node, param)` to a new producer.
    pub fn redirect_deps(&mut self, from: (NodeId, ParamId), to: (NodeId, ParamId)) {
        for n in &mut self.nodes {
            if n.id == to.0 {
                continue;
            }
            for p in &mut n.params {
                for d in &mut p.deps {
                    if d.node == from.0 && d.param == from.1 {
                        d.node = to.0;
                        d.param = to.1;
                    }
                }
            }
        }
    }

    /// Remap dependencies after a node's parameter layout changed.
    pub fn remap_deps_of(&mut self, node: NodeId, mapping: &[(ParamId, ParamId)]) {
        for n in &mut self.nodes {
            for p in &mut n.params {
                for d in &mut p.deps {
                    if d.node == node {
                        if let Some((_, new)) = mapping.iter().find(|(old, _)| *old == d.param) {
                            d.param = *new;
                        }
                    }
                }
            }
        }
    }

    fn enabled(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| !n.is_disabled)
    }

    /// Topological order over param edges (producers first).
    fn param_order(&self) -> Option<Vec<NodeId>> {
        self.topo_order(|n| n.param_edges.incoming.clone(), |n| !n.is_disabled)
    }

    fn topo_order(
        &self,
        incoming: impl Fn(&Node) -> Vec<NodeId>,
        include: impl Fn(&Node) -> bool,
    ) -> Option<Vec<NodeId>> {
        let mut order = Vec::new();
        let mut pending: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|n| include(n))
            .map(|n| n.id)
            .collect();
        let mut placed = vec![false; self.nodes.len()];
        while !pending.is_empty() {
            // Deterministic: smallest ready id first.
            let next = pending
                .iter()
                .copied()
                .find(|&id| {
                    incoming(&self.nodes[id])
                        .iter()
                        .all(|&p| placed[p] || self.nodes[p].is_disabled)
                })?;
            placed[next] = true;
            order.push(next);
            pending.retain(|&id| id != next);
        }
        Some(order)
    }

    /// Copy producers' values into dependent params.
    fn resolve_params(&mut self, id: NodeId) {
        for i in 0..self.nodes[id].params.len() {
            if !self.nodes[id].params[i].is_dependent() {
                continue;
            }
            let dep = self.nodes[id].params[i].deps[0];
            let produced = self.nodes[dep.node].params[dep.param].value;
            let transform = self.nodes[id].params[i].transform;
            let value = match (produced, transform) {
                (ParamValue::Cst(v), Some((mul, add))) => {
                    ParamValue::Cst(mul.wrapping_mul(v).wrapping_add(add))
                }
                (v, _) => v,
            };
            self.nodes[id].params[i].value = value;
        }
    }

    /// Resolve a param that may depend on this node's own params
    /// (special paddings).
    fn resolve_local(&self, node: &Node, p: &Param) -> ParamValue {
        if p.is_dependent() {
            let dep = p.deps[0];
            let produced = if dep.node == node.id {
                node.params[dep.param].value
            } else {
                self.nodes[dep.node].params[dep.param].value
            };
            match (produced, p.transform) {
                (ParamValue::Cst(v), Some((mul, add))) => {
                    ParamValue::Cst(mul.wrapping_mul(v).wrapping_add(add))
                }
                (v, _) => v,
            }
        } else {
            p.value
        }
    }

    /// Try to assign a gadget to every node. Returns true on success;
    /// constraint failures are recorded in the context.
    pub fn select(&mut self, ctx: &mut SelectCtx<'_>) -> bool {
        self.update_param_edges();
        let Some(order) = self.param_order() else {
            return false;
        };
        self.select_rec(&order, 0, ctx)
    }

    fn select_rec(&mut self, order: &[NodeId], idx: usize, ctx: &mut SelectCtx<'_>) -> bool {
        if ctx.check_cancel() {
            return false;
        }
        let Some(&nid) = order.get(idx) else {
            return true;
        };
        if self.nodes[nid].is_disabled || self.nodes[nid].kind == GadgetType::Nop {
            return self.select_rec(order, idx + 1, ctx);
        }

        let db = ctx.db;
        let arch = ctx.arch;
        let constraint = ctx.constraint;
        self.resolve_params(nid);
        let saved = self.nodes[nid].clone();
        let candidates = self.candidates_for(db, &self.nodes[nid]);
        trace!(node = nid, n = candidates.len(), "selection candidates");

        for cand in candidates {
            if ctx.check_cancel() {
                break;
            }
            self.nodes[nid] = saved.clone();
            for (pid, value) in &cand.bindings {
                self.nodes[nid].params[*pid].value = *value;
            }
            let gadget = db.get(cand.gadget);
            if !branch_ok(self.nodes[nid].branch_req, gadget) {
                continue;
            }
            if !self.node_checks_ok(&self.nodes[nid], gadget, arch) {
                continue;
            }
            if !constraint.keep_regs.check(gadget) {
                ctx.fail.record_keep_fail(&constraint.keep_regs, gadget);
                continue;
            }
            if !constraint.mem_safety.check(gadget, arch) {
                continue;
            }
            let octets = arch.octets();
            let Some(addr) = constraint.bad_bytes.valid_address_of(gadget, octets)
            else {
                ctx.fail
                    .record_bad_byte_fail(&constraint.bad_bytes, gadget, octets);
                continue;
            };
            if !self.paddings_ok(nid, constraint, octets) {
                continue;
            }

            // Assign.
            let node = &mut self.nodes[nid];
            node.assigned_gadget = Some(cand.gadget);
            node.assigned_addr = Some(addr);
            let addr_p = node.gadget_addr_param();
            let sp_p = node.gadget_sp_inc_param();
            let jmp_p = node.gadget_jmp_reg_param();
            node.params[addr_p] = Param::fixed_cst(addr as i64, "gadget_addr");
            node.params[sp_p] = Param::fixed_cst(gadget.sp_inc, "gadget_sp_inc");
            node.params[jmp_p] = match gadget.branch_kind {
                BranchKind::Jmp(r) | BranchKind::Call(r) => Param::fixed_reg(r),
                _ => Param::none(),
            };

            if self.select_rec(order, idx + 1, ctx) {
                return true;
            }
        }
        self.nodes[nid] = saved;
        false
    }

    fn node_checks_ok(&self, node: &Node, gadget: &Gadget, arch: &Arch) -> bool {
        let word = arch.octets() as i64;
        node.checks.iter().all(|check| match check {
            NodeCheck::PopOffset => {
                let Some(off_p) = node.kind.offset_param() else {
                    return false;
                };
                let Some(off) = node.params[off_p].value.as_cst() else {
                    return false;
                };
                off >= 0
                    && off % word == 0
                    && off + word <= gadget.sp_inc
                    && (gadget.branch_kind != BranchKind::Ret || off != gadget.sp_inc - word)
            }
        })
    }

    fn paddings_ok(&self, nid: NodeId, constraint: &Constraint, octets: u64) -> bool {
        let node = &self.nodes[nid];
        node.special_paddings.iter().all(|pad| {
            if pad.value.data_link_after.is_some() {
                // Resolved at emission; address bytes get checked there.
                return true;
            }
            match self.resolve_local(node, &pad.value) {
                ParamValue::Cst(v) => constraint.bad_bytes.is_valid_word(v as u64, octets),
                _ => true,
            }
        })
    }

    fn candidates_for(&self, db: &GadgetDb, node: &Node) -> Vec<Candidate> {
        use super::node::param::*;
        match node.kind {
            GadgetType::MovCst => {
                if node.params[MOVCST_SRC_CST].data_link_after.is_some() {
                    // A data-link constant is only realisable through the
                    // pop rewrite.
                    return Vec::new();
                }
                collect(
                    &db.mov_cst,
                    &db.all,
                    &[(MOVCST_DST_REG, KeyKind::Reg), (MOVCST_SRC_CST, KeyKind::Cst)],
                    node,
                )
            }
            GadgetType::MovReg => collect(
                &db.mov_reg,
                &db.all,
                &[(MOVREG_DST_REG, KeyKind::Reg), (MOVREG_SRC_REG, KeyKind::Reg)],
                node,
            ),
            GadgetType::AmovCst => collect(
                &db.amov_cst,
                &db.all,
                &[
                    (AMOVCST_DST_REG, KeyKind::Reg),
                    (AMOVCST_SRC_REG, KeyKind::Reg),
                    (AMOVCST_OP, KeyKind::Op),
                    (AMOVCST_SRC_CST, KeyKind::Cst),
                ],
                node,
            ),
            GadgetType::AmovReg => collect(
                &db.amov_reg,
                &db.all,
                &[
                    (AMOVREG_DST_REG, KeyKind::Reg),
                    (AMOVREG_SRC_REG1, KeyKind::Reg),
                    (AMOVREG_OP, KeyKind::Op),
                    (AMOVREG_SRC_REG2, KeyKind::Reg),
                ],
                node,
            ),
            GadgetType::Load => collect(
                &db.load,
                &db.all,
                &[
                    (LOAD_DST_REG, KeyKind::Reg),
                    (LOAD_ADDR_REG, KeyKind::Reg),
                    (LOAD_OFFSET, KeyKind::Cst),
                ],
                node,
            ),
            GadgetType::Aload => collect(
                &db.aload,
                &db.all,
                &[
                    (ALOAD_DST_REG, KeyKind::Reg),
                    (ALOAD_OP, KeyKind::Op),
                    (ALOAD_ADDR_REG, KeyKind::Reg),
                    (ALOAD_OFFSET, KeyKind::Cst),
                ],
                node,
            ),
            GadgetType::Store => collect(
                &db.store,
                &db.all,
                &[
                    (STORE_ADDR_REG, KeyKind::Reg),
                    (STORE_OFFSET, KeyKind::Cst),
                    (STORE_SRC_REG, KeyKind::Reg),
                ],
                node,
            ),
            GadgetType::Astore => collect(
                &db.astore,
                &db.all,
                &[
                    (ASTORE_ADDR_REG, KeyKind::Reg),
                    (ASTORE_OFFSET, KeyKind::Cst),
                    (ASTORE_OP, KeyKind::Op),
                    (ASTORE_SRC_REG, KeyKind::Reg),
                ],
                node,
            ),
            GadgetType::Jmp => collect(
                &db.jmp,
                &db.all,
                &[(JMP_REG, KeyKind::Reg)],
                node,
            ),
            GadgetType::Syscall => db
                .get_syscall()
                .iter()
                .map(|&g| Candidate { bindings: Vec::new(), gadget: g })
                .collect(),
            GadgetType::Int80 => db
                .get_int80()
                .iter()
                .map(|&g| Candidate { bindings: Vec::new(), gadget: g })
                .collect(),
            GadgetType::Nop => Vec::new(),
        }
    }

    /// Compute a valid execution order: topological on strategy edges,
    /// mandatory-following nodes kept adjacent, interference points
    /// resolved by edge insertion with backtracking.
    pub fn schedule(&self, db: &GadgetDb) -> Option<Vec<NodeId>> {
        let units = self.schedule_units();
        let unit_of = unit_index(&units, self.nodes.len());

        // Base edges from strategy order plus writer-before-reader.
        let mut edges: Vec<(usize, usize)> = Vec::new();
        for n in self.enabled() {
            for &succ in &n.strategy_edges.outgoing {
                if self.nodes[succ].is_disabled {
                    continue;
                }
                let (a, b) = (unit_of[n.id], unit_of[succ]);
                if a != b {
                    edges.push((a, b));
                }
            }
        }
        let points = self.interference_points(db);
        for p in &points {
            let (w, r) = (unit_of[p.writer], unit_of[p.reader]);
            if w != r {
                edges.push((w, r));
            }
        }

        let order = self.resolve_interference(&units, &unit_of, edges, &points, 0)?;
        Some(order)
    }

    fn schedule_units(&self) -> Vec<Vec<NodeId>> {
        let mut units = Vec::new();
        let mut used = vec![false; self.nodes.len()];
        let followed: Vec<Option<NodeId>> = self
            .nodes
            .iter()
            .map(|n| n.mandatory_following_node)
            .collect();
        let is_follower: Vec<bool> = (0..self.nodes.len())
            .map(|id| followed.iter().any(|f| *f == Some(id)))
            .collect();
        for n in self.enabled() {
            if used[n.id] || is_follower[n.id] {
                continue;
            }
            let mut unit = vec![n.id];
            used[n.id] = true;
            let mut cur = n.id;
            while let Some(next) = self.nodes[cur].mandatory_following_node {
                if self.nodes[next].is_disabled || used[next] {
                    break;
                }
                unit.push(next);
                used[next] = true;
                cur = next;
            }
            units.push(unit);
        }
        // Followers whose leader is disabled still need a unit.
        for n in self.enabled() {
            if !used[n.id] {
                units.push(vec![n.id]);
            }
        }
        units
    }

    fn interference_points(&self, db: &GadgetDb) -> Vec<InterferencePoint> {
        let mut points = Vec::new();
        for consumer in self.enabled() {
            for p in &consumer.params {
                if !p.is_dependent() {
                    continue;
                }
                let ParamValue::Reg(r) = p.value else { continue };
                let dep = p.deps[0];
                if self.nodes[dep.node].is_disabled || dep.node == consumer.id {
                    continue;
                }
                // The runtime writer is whichever side holds `r` as its
                // destination register.
                let producer = &self.nodes[dep.node];
                let (writer, reader) = if producer
                    .kind
                    .dst_reg_param()
                    .is_some_and(|d| d == dep.param)
                {
                    (producer.id, consumer.id)
                } else if consumer
                    .kind
                    .dst_reg_param()
                    .is_some_and(|d| consumer.params[d].value == ParamValue::Reg(r))
                {
                    (consumer.id, producer.id)
                } else {
                    continue;
                };
                for other in self.enabled() {
                    if other.id == writer || other.id == reader {
                        continue;
                    }
                    let Some(g) = other.assigned_gadget else { continue };
                    if db.get(g).modifies(r) {
                        points.push(InterferencePoint {
                            interfering: other.id,
                            writer,
                            reader,
                        });
                    }
                }
            }
        }
        points
    }

    fn resolve_interference(
        &self,
        units: &[Vec<NodeId>],
        unit_of: &[usize],
        edges: Vec<(usize, usize)>,
        points: &[InterferencePoint],
        depth: usize,
    ) -> Option<Vec<NodeId>> {
        if depth > 2 * points.len() + 2 {
            return None;
        }
        let order_units = topo_units(units.len(), &edges)?;
        let flat: Vec<NodeId> = order_units
            .iter()
            .flat_map(|&u| units[u].iter().copied())
            .collect();
        let pos: HashMap<NodeId, usize> =
            flat.iter().enumerate().map(|(i, &n)| (n, i)).collect();

        for p in points {
            let (i, w, r) = (pos[&p.interfering], pos[&p.writer], pos[&p.reader]);
            if i > w && i < r {
                // Violated: force the interfering unit outside the
                // window, trying both sides.
                let before = {
                    let mut e = edges.clone();
                    e.push((unit_of[p.interfering], unit_of[p.writer]));
                    self.resolve_interference(units, unit_of, e, points, depth + 1)
                };
                if before.is_some() {
                    return before;
                }
                let mut e = edges;
                e.push((unit_of[p.reader], unit_of[p.interfering]));
                return self.resolve_interference(units, unit_of, e, points, depth + 1);
            }
        }
        Some(flat)
    }

    /// Emit the chain for a scheduled, fully selected graph.
    pub fn emit(
        &self,
        db: &GadgetDb,
        arch: &Arch,
        constraint: &Constraint,
        order: &[NodeId],
    ) -> Option<ChainDraft> {
        let word = arch.octets();
        let mut chain = RopChain::new(arch);
        let mut data_links = Vec::new();
        // (item index, node whose successor's address goes there)
        let mut pending_links: Vec<(usize, NodeId)> = Vec::new();
        let mut arrived_by_jmp = false;

        for &nid in order {
            let node = &self.nodes[nid];
            if node.is_disabled || node.kind == GadgetType::Nop {
                continue;
            }
            let gadget = db.get(node.assigned_gadget?);
            let addr = node.assigned_addr?;

            if !arrived_by_jmp {
                chain.push_gadget(addr, gadget.id, gadget.asm_str.clone());
            }

            let is_ret = gadget.branch_kind == BranchKind::Ret;
            let total_slots = (gadget.sp_inc / word as i64) as usize;
            let ret_slot = if is_ret && total_slots > 0 {
                Some(total_slots - 1)
            } else {
                None
            };

            // Resolve the special paddings into slot positions.
            let mut specials: HashMap<usize, (Option<u64>, String, Option<NodeId>)> =
                HashMap::new();
            for pad in &node.special_paddings {
                let off = match self.resolve_local(node, &pad.offset) {
                    ParamValue::Cst(v) => v,
                    _ => return None,
                };
                let slot = (off / word as i64) as usize;
                if let Some(after) = pad.value.data_link_after {
                    specials.insert(slot, (None, pad.value.name.clone(), Some(after)));
                } else {
                    let value = match self.resolve_local(node, &pad.value) {
                        ParamValue::Cst(v) => v as u64,
                        _ => return None,
                    };
                    specials.insert(slot, (Some(value), pad.value.name.clone(), None));
                }
            }

            for slot in 0..total_slots {
                if Some(slot) == ret_slot {
                    continue;
                }
                match specials.remove(&slot) {
                    Some((Some(value), name, _)) => {
                        chain.push_padding(value, name);
                    }
                    Some((None, name, Some(after))) => {
                        pending_links.push((chain.items.len(), after));
                        chain.push_padding(0, name);
                    }
                    Some((None, name, None)) => {
                        chain.push_padding(0, name);
                    }
                    None => {
                        let value = constraint.bad_bytes.valid_padding(word)?;
                        chain.push_padding(value, "padding");
                    }
                }
            }

            arrived_by_jmp = matches!(gadget.branch_kind, BranchKind::Jmp(_));
        }

        // Resolve within-chain data links; the rest point at the next
        // IL instruction's chain.
        for (item_idx, after) in pending_links {
            let pos = order.iter().position(|&n| n == after)?;
            let next = order[pos + 1..]
                .iter()
                .find(|&&n| !self.nodes[n].is_disabled && self.nodes[n].kind != GadgetType::Nop);
            match next {
                Some(&n) => {
                    let addr = self.nodes[n].assigned_addr?;
                    if let crate::chain::ChainItem::Padding { value, .. } =
                        &mut chain.items[item_idx]
                    {
                        *value = addr;
                    }
                }
                None => data_links.push(item_idx),
            }
        }

        Some(ChainDraft { chain, data_links })
    }
}

#[derive(Debug, Clone, Copy)]
struct InterferencePoint {
    interfering: NodeId,
    writer: NodeId,
    reader: NodeId,
}

fn unit_index(units: &[Vec<NodeId>], nb_nodes: usize) -> Vec<usize> {
    let mut unit_of = vec![0usize; nb_nodes];
    for (i, unit) in units.iter().enumerate() {
        for &n in unit {
            unit_of[n] = i;
        }
    }
    unit_of
}

fn topo_units(n: usize, edges: &[(usize, usize)]) -> Option<Vec<usize>> {
    let mut order = Vec::new();
    let mut placed = vec![false; n];
    while order.len() < n {
        let next = (0..n).find(|&u| {
            !placed[u]
                && edges
                    .iter()
                    .all(|&(from, to)| to != u || placed[from])
        })?;
        placed[next] = true;
        order.push(next);
    }
    Some(order)
}

fn branch_ok(req: BranchReq, gadget: &Gadget) -> bool {
    match req {
        BranchReq::Ret => gadget.branch_kind == BranchKind::Ret,
        BranchReq::Jmp => matches!(gadget.branch_kind, BranchKind::Jmp(_)),
        BranchReq::Any => {
            matches!(gadget.branch_kind, BranchKind::Ret | BranchKind::Jmp(_))
        }
        BranchReq::Syscall => gadget.branch_kind == BranchKind::Syscall,
        BranchReq::Int80 => gadget.branch_kind == BranchKind::Int80,
    }
}

fn collect<const N: usize>(
    db: &BaseDb<N>,
    all: &[Gadget],
    spec: &[(ParamId, KeyKind)],
    node: &Node,
) -> Vec<Candidate> {
    debug_assert_eq!(spec.len(), N);
    let mut key = [0i64; N];
    let mut free = [false; N];
    for (i, (pid, _)) in spec.iter().enumerate() {
        let p = &node.params[*pid];
        if p.is_free() {
            free[i] = true;
        } else {
            key[i] = match p.value {
                ParamValue::Cst(v) => v,
                ParamValue::Reg(r) => i64::from(r),
                ParamValue::Op(o) => o as i64,
                ParamValue::None => return Vec::new(),
            };
        }
    }

    if free.iter().any(|f| *f) {
        let mut out = Vec::new();
        for (k, ids) in db.get_possible(&key, &free, all) {
            let bindings: Vec<(ParamId, ParamValue)> = spec
                .iter()
                .enumerate()
                .filter(|(i, _)| free[*i])
                .map(|(i, (pid, kind))| (*pid, decode_key(*kind, k[i])))
                .collect();
            for g in ids {
                out.push(Candidate { bindings: bindings.clone(), gadget: g });
            }
        }
        out
    } else {
        db.get(&key)
            .iter()
            .map(|&g| Candidate { bindings: Vec::new(), gadget: g })
            .collect()
    }
}

fn decode_key(kind: KeyKind, v: i64) -> ParamValue {
    match kind {
        KeyKind::Reg => ParamValue::Reg(v as RegId),
        KeyKind::Cst => ParamValue::Cst(v),
        KeyKind::Op => ParamValue::Op(Binop::from_index(v as u8).unwrap_or(Binop::Add)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::decode::BuiltinDecoder;
    use crate::arch::{reg, ArchKind};
    use crate::compiler::node::{param, RopPadding};
    use crate::gadget::RawGadget;

    fn x64_db(gadgets: &[(u64, &[u8])]) -> (Arch, GadgetDb) {
        let arch = Arch::new(ArchKind::X64);
        let mut db = GadgetDb::new();
        let raws: Vec<RawGadget> = gadgets
            .iter()
            .map(|(addr, bytes)| RawGadget {
                addr: *addr,
                bytes: bytes.to_vec(),
                bin_num: 0,
            })
            .collect();
        db.analyse_raw_gadgets(&arch, &BuiltinDecoder, &raws);
        (arch, db)
    }

    fn select(g: &mut StrategyGraph, arch: &Arch, db: &GadgetDb) -> (bool, FailRecord) {
        let constraint = Constraint::new();
        let mut fail = FailRecord::default();
        let ok = {
            let mut ctx = SelectCtx {
                db,
                arch,
                constraint: &constraint,
                fail: &mut fail,
                cancel: None,
                cancelled: false,
            };
            g.select(&mut ctx)
        };
        (ok, fail)
    }

    #[test]
    fn test_select_direct_mov_reg() {
        // mov rax, rbx ; ret
        let (arch, db) = x64_db(&[(0x400100, &[0x48, 0x89, 0xd8, 0xc3])]);
        let mut g = StrategyGraph::new();
        let n = g.new_node(GadgetType::MovReg);
        g.nodes[n].params[param::MOVREG_DST_REG] = Param::fixed_reg(reg::AX);
        g.nodes[n].params[param::MOVREG_SRC_REG] = Param::fixed_reg(reg::BX);

        let (ok, _) = select(&mut g, &arch, &db);
        assert!(ok);
        let node = &g.nodes[n];
        assert_eq!(node.assigned_gadget, Some(0));
        assert_eq!(node.assigned_addr, Some(0x400100));
        // Gadget params are filled on assignment.
        assert_eq!(
            node.params[node.gadget_addr_param()].value,
            ParamValue::Cst(0x400100)
        );
        assert_eq!(
            node.params[node.gadget_sp_inc_param()].value,
            ParamValue::Cst(8)
        );
    }

    #[test]
    fn test_select_backtracks_to_failure() {
        let (arch, db) = x64_db(&[(0x400100, &[0x48, 0x89, 0xd8, 0xc3])]);
        let mut g = StrategyGraph::new();
        let n = g.new_node(GadgetType::MovReg);
        g.nodes[n].params[param::MOVREG_DST_REG] = Param::fixed_reg(reg::CX);
        g.nodes[n].params[param::MOVREG_SRC_REG] = Param::fixed_reg(reg::BX);

        let (ok, _) = select(&mut g, &arch, &db);
        assert!(!ok);
        assert_eq!(g.nodes[n].assigned_gadget, None);
    }

    #[test]
    fn test_candidates_for_free_dst() {
        let (_, db) = x64_db(&[(0x400100, &[0x48, 0x89, 0xd8, 0xc3])]);
        let mut g = StrategyGraph::new();
        let n = g.new_node(GadgetType::MovReg);
        g.nodes[n].params[param::MOVREG_DST_REG] = Param::free_reg();
        g.nodes[n].params[param::MOVREG_SRC_REG] = Param::fixed_reg(reg::BX);

        let cands = g.candidates_for(&db, &g.nodes[n]);
        assert_eq!(cands.len(), 1);
        assert_eq!(
            cands[0].bindings,
            vec![(param::MOVREG_DST_REG, ParamValue::Reg(reg::AX))]
        );
        assert_eq!(cands[0].gadget, 0);
    }

    #[test]
    fn test_candidates_for_data_link_blocks_direct_match() {
        // xor eax, eax ; ret realises rax = 0, but a data-link constant
        // must never match a concrete mov_cst bucket.
        let (_, db) = x64_db(&[(0x400200, &[0x31, 0xc0, 0xc3])]);
        let mut g = StrategyGraph::new();
        let n = g.new_node(GadgetType::MovCst);
        g.nodes[n].params[param::MOVCST_DST_REG] = Param::fixed_reg(reg::AX);
        let mut link = Param::free_cst("return_addr");
        link.data_link_after = Some(n);
        g.nodes[n].params[param::MOVCST_SRC_CST] = link;

        assert!(g.candidates_for(&db, &g.nodes[n]).is_empty());
    }

    #[test]
    fn test_syscall_candidates_dispatch() {
        let (_, db) = x64_db(&[(0x400700, &[0x0f, 0x05])]);
        let mut g = StrategyGraph::new();
        let n = g.new_node(GadgetType::Syscall);
        let cands = g.candidates_for(&db, &g.nodes[n]);
        assert_eq!(cands.len(), 1);
        assert!(cands[0].bindings.is_empty());
    }

    #[test]
    fn test_node_checks_pop_offset() {
        // pop rax ; ret: sp_inc 16, return slot at offset 8.
        let (arch, db) = x64_db(&[(0x400410, &[0x58, 0xc3])]);
        let gadget = db.get(0);
        let mut g = StrategyGraph::new();
        let n = g.new_node(GadgetType::Load);
        g.nodes[n].checks.push(NodeCheck::PopOffset);

        let mut with_offset = |off: i64| {
            g.nodes[n].params[param::LOAD_OFFSET] = Param::fixed_cst(off, "off");
            g.node_checks_ok(&g.nodes[n], gadget, &arch)
        };
        assert!(with_offset(0));
        // The return slot itself is not a pop slot.
        assert!(!with_offset(8));
        // Outside the gadget's stack frame.
        assert!(!with_offset(16));
        assert!(!with_offset(-8));
        // Unaligned.
        assert!(!with_offset(3));
    }

    #[test]
    fn test_paddings_ok_checks_bad_bytes() {
        let mut g = StrategyGraph::new();
        let n = g.new_node(GadgetType::Load);
        g.nodes[n].special_paddings.push(RopPadding {
            offset: Param::fixed_cst(0, "off"),
            value: Param::fixed_cst(0x0a, "value"),
        });

        let clean = Constraint::new();
        assert!(g.paddings_ok(n, &clean, 8));

        let mut constrained = Constraint::new();
        constrained.bad_bytes.add(0x0a);
        assert!(!g.paddings_ok(n, &constrained, 8));
    }

    #[test]
    fn test_param_order_follows_dependencies() {
        let mut g = StrategyGraph::new();
        let a = g.new_node(GadgetType::MovCst);
        let b = g.new_node(GadgetType::MovCst);
        // a's destination copies b's: b resolves first.
        g.nodes[a].params[param::MOVCST_DST_REG] =
            Param::dep_reg(b, param::MOVCST_DST_REG);
        g.update_param_edges();
        assert_eq!(g.param_order(), Some(vec![b, a]));
    }

    #[test]
    fn test_schedule_units_mandatory_adjacency() {
        let mut g = StrategyGraph::new();
        let a = g.new_node(GadgetType::MovReg);
        let b = g.new_node(GadgetType::MovReg);
        let c = g.new_node(GadgetType::MovReg);
        g.nodes[a].mandatory_following_node = Some(c);
        assert_eq!(g.schedule_units(), vec![vec![a, c], vec![b]]);
    }

    #[test]
    fn test_schedule_moves_interfering_node_out_of_window() {
        // Writer and interferer both produce rax; the reader consumes
        // it. A naive id-order schedule puts the interferer between the
        // two, so scheduling must move it outside the window.
        let (_, db) = x64_db(&[
            (0x400410, &[0x58, 0xc3]),             // pop rax; ret
            (0x400520, &[0x48, 0x89, 0x07, 0xc3]), // mov [rdi], rax; ret
        ]);
        let mut g = StrategyGraph::new();
        let writer = g.new_node(GadgetType::MovCst);
        let interferer = g.new_node(GadgetType::MovCst);
        let reader = g.new_node(GadgetType::Store);
        g.nodes[writer].params[param::MOVCST_DST_REG] = Param::fixed_reg(reg::AX);
        g.nodes[interferer].params[param::MOVCST_DST_REG] = Param::fixed_reg(reg::AX);
        let mut src = Param::dep_reg(writer, param::MOVCST_DST_REG);
        src.value = ParamValue::Reg(reg::AX);
        g.nodes[reader].params[param::STORE_SRC_REG] = src;
        g.add_strategy_edge(writer, reader);
        for (nid, gid, addr) in [
            (writer, 0, 0x400410u64),
            (interferer, 0, 0x400410),
            (reader, 1, 0x400520),
        ] {
            g.nodes[nid].assigned_gadget = Some(gid);
            g.nodes[nid].assigned_addr = Some(addr);
        }

        let order = g.schedule(&db).unwrap();
        let pos = |n: NodeId| order.iter().position(|&x| x == n).unwrap();
        assert!(pos(writer) < pos(reader));
        assert!(
            pos(interferer) < pos(writer) || pos(interferer) > pos(reader),
            "interferer sits inside the window: {order:?}"
        );
    }

    #[test]
    fn test_emit_special_padding_and_ret_slot() {
        let (arch, db) = x64_db(&[(0x400410, &[0x58, 0xc3])]);
        let mut g = StrategyGraph::new();
        let n = g.new_node(GadgetType::Load);
        g.nodes[n].params[param::LOAD_DST_REG] = Param::fixed_reg(reg::AX);
        g.nodes[n].params[param::LOAD_ADDR_REG] = Param::fixed_reg(reg::SP);
        g.nodes[n].params[param::LOAD_OFFSET] = Param::fixed_cst(0, "pop_offset");
        g.nodes[n].special_paddings.push(RopPadding {
            offset: Param::dep_cst(n, param::LOAD_OFFSET, 1, 0, "pop_offset"),
            value: Param::fixed_cst(0x42, "value"),
        });
        g.nodes[n].assigned_gadget = Some(0);
        g.nodes[n].assigned_addr = Some(0x400410);

        let draft = g.emit(&db, &arch, &Constraint::new(), &[n]).unwrap();
        // Address, pop slot, and the return slot left for the next
        // gadget address.
        assert_eq!(draft.chain.words(), vec![0x400410, 0x42]);
        assert!(draft.data_links.is_empty());
    }

    #[test]
    fn test_emit_records_cross_chain_data_link() {
        // pop rcx ; jmp rax: the popped slot must receive the address
        // of whatever the next chain starts with.
        let (arch, db) = x64_db(&[(0x400600, &[0x59, 0xff, 0xe0])]);
        let mut g = StrategyGraph::new();
        let n = g.new_node(GadgetType::Load);
        g.nodes[n].params[param::LOAD_DST_REG] = Param::fixed_reg(reg::CX);
        g.nodes[n].params[param::LOAD_ADDR_REG] = Param::fixed_reg(reg::SP);
        g.nodes[n].params[param::LOAD_OFFSET] = Param::fixed_cst(0, "pop_offset");
        let mut link = Param::free_cst("return_addr");
        link.data_link_after = Some(n);
        g.nodes[n].special_paddings.push(RopPadding {
            offset: Param::dep_cst(n, param::LOAD_OFFSET, 1, 0, "pop_offset"),
            value: link,
        });
        g.nodes[n].assigned_gadget = Some(0);
        g.nodes[n].assigned_addr = Some(0x400600);

        let draft = g.emit(&db, &arch, &Constraint::new(), &[n]).unwrap();
        // A jmp exit consumes no return slot; the single pop slot is a
        // placeholder for the next chain's first word.
        assert_eq!(draft.chain.len(), 2);
        assert_eq!(draft.data_links, vec![1]);
    }

    #[test]
    fn test_branch_ok() {
        let (_, db) = x64_db(&[
            (0x400410, &[0x58, 0xc3]), // ret-terminated
            (0x400600, &[0xff, 0xe0]), // jmp rax
        ]);
        let ret = db.get(0);
        let jmp = db.get(1);
        assert!(branch_ok(BranchReq::Ret, ret));
        assert!(!branch_ok(BranchReq::Ret, jmp));
        assert!(branch_ok(BranchReq::Jmp, jmp));
        assert!(branch_ok(BranchReq::Any, ret));
        assert!(branch_ok(BranchReq::Any, jmp));
        assert!(!branch_ok(BranchReq::Syscall, ret));
    }
}
