//! Strategy rewrite rules.
//!
//! When a graph has no direct gadget selection, each applicable rule
//! produces a rewritten copy that realises the same IL effect through a
//! different gadget shape. Rewrites are guarded by depth and width
//! limits so the work queue cannot expand without bound.

use super::graph::{StrategyGraph, MAX_GRAPH_WIDTH, MAX_RULE_DEPTH};
use super::node::{param, GadgetType, BranchReq, NodeCheck, NodeId, Param, RopPadding};
use crate::arch::Arch;
use tracing::trace;

/// Apply every applicable rule to every node, returning the rewritten
/// graphs to enqueue.
pub fn apply_all(graph: &StrategyGraph, arch: &Arch) -> Vec<StrategyGraph> {
    if graph.rule_depth >= MAX_RULE_DEPTH || graph.nodes.len() >= MAX_GRAPH_WIDTH {
        return Vec::new();
    }
    let mut out = Vec::new();
    for id in 0..graph.nodes.len() {
        if graph.nodes[id].is_disabled {
            continue;
        }
        let rules: [(&str, Option<StrategyGraph>); 6] = [
            ("mov_cst_pop", rule_mov_cst_pop(graph, id, arch)),
            ("generic_transitivity", rule_generic_transitivity(graph, id)),
            ("generic_src_transitivity", rule_generic_src_transitivity(graph, id)),
            ("generic_adjust_jmp", rule_generic_adjust_jmp(graph, id)),
            ("adjust_load", rule_adjust_load(graph, id)),
            ("adjust_store", rule_adjust_store(graph, id)),
        ];
        for (name, rewritten) in rules {
            if let Some(mut g) = rewritten {
                trace!(rule = name, node = id, "rule applied");
                g.rule_depth = graph.rule_depth + 1;
                out.push(g);
            }
        }
    }
    out
}

/// `MovCst(dst, K)` becomes a load from a popped stack slot: the node
/// turns into `Load(dst, SP, free offset)` with a special padding
/// binding the slot at that offset to `K`.
fn rule_mov_cst_pop(graph: &StrategyGraph, id: NodeId, arch: &Arch) -> Option<StrategyGraph> {
    let node = &graph.nodes[id];
    if node.kind != GadgetType::MovCst {
        return None;
    }
    // Free constants have no value to pop.
    if node.params[param::MOVCST_SRC_CST].is_free()
        && node.params[param::MOVCST_SRC_CST].data_link_after.is_none()
    {
        return None;
    }

    let mut g = graph.clone();
    let cst = g.nodes[id].params[param::MOVCST_SRC_CST].clone();
    let dst = g.nodes[id].params[param::MOVCST_DST_REG].clone();

    let n = &mut g.nodes[id];
    n.kind = GadgetType::Load;
    n.params = vec![Param::none(); GadgetType::Load.nb_params()];
    n.params[param::LOAD_DST_REG] = dst;
    n.params[param::LOAD_ADDR_REG] = Param::fixed_reg(arch.sp());
    n.params[param::LOAD_OFFSET] = Param::free_cst("pop_offset");
    n.checks.push(NodeCheck::PopOffset);
    let offset_ref = Param::dep_cst(id, param::LOAD_OFFSET, 1, 0, "pop_offset");
    n.special_paddings.push(RopPadding { offset: offset_ref, value: cst });

    // The gadget params moved from slots 2.. to 3..; follow them.
    g.remap_deps_of(id, &[(2, 3), (3, 4), (4, 5)]);
    Some(g)
}

/// `X(dst, ...)` becomes `X(tmp, ...)` followed by `MovReg(dst, tmp)`
/// over a free intermediate register.
fn rule_generic_transitivity(graph: &StrategyGraph, id: NodeId) -> Option<StrategyGraph> {
    let node = &graph.nodes[id];
    let dst_idx = node.kind.dst_reg_param()?;
    if !node.params[dst_idx].is_fixed {
        return None;
    }

    let mut g = graph.clone();
    let original_dst = g.nodes[id].params[dst_idx].clone();
    let m = g.new_node(GadgetType::MovReg);
    g.nodes[m].comment = g.nodes[id].comment.clone();
    g.nodes[m].params[param::MOVREG_DST_REG] = original_dst;
    g.nodes[m].params[param::MOVREG_SRC_REG] = Param::dep_reg(id, dst_idx);

    // Consumers of the old destination now read the final move.
    g.redirect_deps((id, dst_idx), (m, param::MOVREG_DST_REG));
    // The new source dependency was redirected with the rest; restore it.
    g.nodes[m].params[param::MOVREG_SRC_REG] = Param::dep_reg(id, dst_idx);

    g.nodes[id].params[dst_idx] = Param::free_reg();
    let succs = g.nodes[id].strategy_edges.outgoing.clone();
    for s in succs {
        g.add_strategy_edge(m, s);
    }
    g.add_strategy_edge(id, m);
    g.nodes[id].mandatory_following_node = Some(m);
    Some(g)
}

/// `X(..., src)` becomes `MovReg(tmp, src)` followed by `X(..., tmp)`.
fn rule_generic_src_transitivity(graph: &StrategyGraph, id: NodeId) -> Option<StrategyGraph> {
    let node = &graph.nodes[id];
    let src_idx = node.kind.src_reg_param()?;
    if !node.params[src_idx].is_fixed {
        return None;
    }

    let mut g = graph.clone();
    let original_src = g.nodes[id].params[src_idx].clone();
    let m = g.new_node(GadgetType::MovReg);
    g.nodes[m].comment = g.nodes[id].comment.clone();
    g.nodes[m].params[param::MOVREG_DST_REG] = Param::dep_reg(id, src_idx);
    g.nodes[m].params[param::MOVREG_SRC_REG] = original_src;
    g.nodes[id].params[src_idx] = Param::free_reg();
    g.add_strategy_edge(m, id);
    Some(g)
}

/// Allow a jmp-terminated gadget by prepending a `MovCst` that loads the
/// follow-up address into the jump register.
fn rule_generic_adjust_jmp(graph: &StrategyGraph, id: NodeId) -> Option<StrategyGraph> {
    let node = &graph.nodes[id];
    if node.branch_req != BranchReq::Ret {
        return None;
    }
    if matches!(
        node.kind,
        GadgetType::Syscall | GadgetType::Int80 | GadgetType::Jmp | GadgetType::Nop
    ) {
        return None;
    }

    let mut g = graph.clone();
    g.nodes[id].branch_req = BranchReq::Jmp;
    let jmp_reg_idx = g.nodes[id].gadget_jmp_reg_param();
    let m = g.new_node(GadgetType::MovCst);
    g.nodes[m].comment = g.nodes[id].comment.clone();
    g.nodes[m].params[param::MOVCST_DST_REG] = Param::dep_reg(id, jmp_reg_idx);
    let mut link = Param::free_cst("return_addr");
    link.data_link_after = Some(id);
    g.nodes[m].params[param::MOVCST_SRC_CST] = link;
    g.add_strategy_edge(m, id);
    Some(g)
}

/// Decompose a load whose fixed address register cannot be set directly:
/// an `AmovCst` produces the required address register first.
fn rule_adjust_load(graph: &StrategyGraph, id: NodeId) -> Option<StrategyGraph> {
    adjust_memory(graph, id, GadgetType::Load, param::LOAD_ADDR_REG, param::LOAD_OFFSET)
        .or_else(|| {
            adjust_memory(graph, id, GadgetType::Aload, param::ALOAD_ADDR_REG, param::ALOAD_OFFSET)
        })
}

/// Same decomposition for stores.
fn rule_adjust_store(graph: &StrategyGraph, id: NodeId) -> Option<StrategyGraph> {
    adjust_memory(graph, id, GadgetType::Store, param::STORE_ADDR_REG, param::STORE_OFFSET)
        .or_else(|| {
            adjust_memory(
                graph,
                id,
                GadgetType::Astore,
                param::ASTORE_ADDR_REG,
                param::ASTORE_OFFSET,
            )
        })
}

fn adjust_memory(
    graph: &StrategyGraph,
    id: NodeId,
    kind: GadgetType,
    addr_idx: usize,
    off_idx: usize,
) -> Option<StrategyGraph> {
    let node = &graph.nodes[id];
    if node.kind != kind {
        return None;
    }
    if !node.params[addr_idx].is_fixed || !node.params[off_idx].is_fixed {
        return None;
    }
    let target_reg = node.params[addr_idx].value.as_reg()?;
    let target_off = node.params[off_idx].value.as_cst()?;

    let mut g = graph.clone();
    g.nodes[id].params[addr_idx] = Param::free_reg();
    g.nodes[id].params[off_idx] = Param::free_cst("mem_offset");
    let m = g.new_node(GadgetType::AmovCst);
    g.nodes[m].comment = g.nodes[id].comment.clone();
    g.nodes[m].params[param::AMOVCST_DST_REG] = Param::dep_reg(id, addr_idx);
    g.nodes[m].params[param::AMOVCST_SRC_REG] = Param::fixed_reg(target_reg);
    g.nodes[m].params[param::AMOVCST_OP] = Param::op(crate::expr::Binop::Add);
    // new_addr_reg = target + (target_off - chosen_offset)
    g.nodes[m].params[param::AMOVCST_SRC_CST] =
        Param::dep_cst(id, off_idx, -1, target_off, "addr_adjust");
    g.add_strategy_edge(m, id);
    Some(g)
}
