//! Strategy-graph nodes and parameters.
//!
//! A node is an abstract gadget slot: a gadget kind, a fixed-length
//! parameter array, and edge sets. Parameters are fixed, free, or
//! dependent on another node's parameter (optionally through an affine
//! transform, which is how constant-address stores express
//! `addr - offset`). Nodes live in a flat arena inside the graph and
//! refer to each other by integer id.

use crate::expr::{Binop, RegId};
use crate::gadget::GadgetId;

/// Index of a node in its graph's arena.
pub type NodeId = usize;
/// Index of a parameter inside a node.
pub type ParamId = usize;

/// The gadget kinds a node can require.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GadgetType {
    Nop,
    /// `dst <- cst`
    MovCst,
    /// `dst <- src`
    MovReg,
    /// `dst <- src op cst`
    AmovCst,
    /// `dst <- src1 op src2`
    AmovReg,
    /// `dst <- mem(addr + offset)`
    Load,
    /// `dst <- dst op mem(addr + offset)`
    Aload,
    /// `mem(addr + offset) <- src`
    Store,
    /// `mem(addr + offset) <- mem(addr + offset) op src`
    Astore,
    /// `pc <- reg`
    Jmp,
    Syscall,
    Int80,
}

/// Named parameter positions, by gadget type.
///
/// Every type also carries three trailing gadget parameters (address,
/// sp increment, jmp register) at `nb_domain_params() ..`.
pub mod param {
    use super::ParamId;

    pub const MOVCST_DST_REG: ParamId = 0;
    pub const MOVCST_SRC_CST: ParamId = 1;

    pub const MOVREG_DST_REG: ParamId = 0;
    pub const MOVREG_SRC_REG: ParamId = 1;

    pub const AMOVCST_DST_REG: ParamId = 0;
    pub const AMOVCST_SRC_REG: ParamId = 1;
    pub const AMOVCST_OP: ParamId = 2;
    pub const AMOVCST_SRC_CST: ParamId = 3;

    pub const AMOVREG_DST_REG: ParamId = 0;
    pub const AMOVREG_SRC_REG1: ParamId = 1;
    pub const AMOVREG_OP: ParamId = 2;
    pub const AMOVREG_SRC_REG2: ParamId = 3;

    pub const LOAD_DST_REG: ParamId = 0;
    pub const LOAD_ADDR_REG: ParamId = 1;
    pub const LOAD_OFFSET: ParamId = 2;

    pub const ALOAD_DST_REG: ParamId = 0;
    pub const ALOAD_OP: ParamId = 1;
    pub const ALOAD_ADDR_REG: ParamId = 2;
    pub const ALOAD_OFFSET: ParamId = 3;

    pub const STORE_ADDR_REG: ParamId = 0;
    pub const STORE_OFFSET: ParamId = 1;
    pub const STORE_SRC_REG: ParamId = 2;

    pub const ASTORE_ADDR_REG: ParamId = 0;
    pub const ASTORE_OFFSET: ParamId = 1;
    pub const ASTORE_OP: ParamId = 2;
    pub const ASTORE_SRC_REG: ParamId = 3;

    pub const JMP_REG: ParamId = 0;
}

impl GadgetType {
    /// Number of domain parameters (before the gadget parameters).
    pub fn nb_domain_params(self) -> usize {
        match self {
            GadgetType::Nop | GadgetType::Syscall | GadgetType::Int80 => 0,
            GadgetType::Jmp => 1,
            GadgetType::MovCst | GadgetType::MovReg => 2,
            GadgetType::Load => 3,
            GadgetType::Store => 3,
            GadgetType::AmovCst | GadgetType::AmovReg => 4,
            GadgetType::Aload | GadgetType::Astore => 4,
        }
    }

    /// Total parameter count including the gadget parameters.
    pub fn nb_params(self) -> usize {
        self.nb_domain_params() + 3
    }

    /// Index of the destination-register parameter, if the kind has one.
    pub fn dst_reg_param(self) -> Option<ParamId> {
        match self {
            GadgetType::MovCst
            | GadgetType::MovReg
            | GadgetType::AmovCst
            | GadgetType::AmovReg
            | GadgetType::Load
            | GadgetType::Aload => Some(0),
            _ => None,
        }
    }

    /// Index of the source-register parameter used by transitivity.
    pub fn src_reg_param(self) -> Option<ParamId> {
        match self {
            GadgetType::MovReg => Some(param::MOVREG_SRC_REG),
            GadgetType::AmovCst => Some(param::AMOVCST_SRC_REG),
            GadgetType::AmovReg => Some(param::AMOVREG_SRC_REG1),
            GadgetType::Store => Some(param::STORE_SRC_REG),
            GadgetType::Astore => Some(param::ASTORE_SRC_REG),
            _ => None,
        }
    }

    /// Index of the memory address register, for load/store kinds.
    pub fn addr_reg_param(self) -> Option<ParamId> {
        match self {
            GadgetType::Load => Some(param::LOAD_ADDR_REG),
            GadgetType::Aload => Some(param::ALOAD_ADDR_REG),
            GadgetType::Store => Some(param::STORE_ADDR_REG),
            GadgetType::Astore => Some(param::ASTORE_ADDR_REG),
            _ => None,
        }
    }

    /// Index of the memory offset, for load/store kinds.
    pub fn offset_param(self) -> Option<ParamId> {
        match self {
            GadgetType::Load => Some(param::LOAD_OFFSET),
            GadgetType::Aload => Some(param::ALOAD_OFFSET),
            GadgetType::Store => Some(param::STORE_OFFSET),
            GadgetType::Astore => Some(param::ASTORE_OFFSET),
            _ => None,
        }
    }
}

/// Dependency of one parameter on another node's parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamDep {
    pub node: NodeId,
    pub param: ParamId,
}

/// Resolved value of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamValue {
    Cst(i64),
    Reg(RegId),
    Op(Binop),
    None,
}

impl ParamValue {
    pub fn as_cst(self) -> Option<i64> {
        match self {
            ParamValue::Cst(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_reg(self) -> Option<RegId> {
        match self {
            ParamValue::Reg(r) => Some(r),
            _ => None,
        }
    }
}

/// A node parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    pub value: ParamValue,
    /// Display name, used for free constants in comments.
    pub name: String,
    pub is_fixed: bool,
    pub deps: Vec<ParamDep>,
    /// For dependent constants: `value = mul * producer + add`.
    pub transform: Option<(i64, i64)>,
    /// The value is the address of whatever gadget follows this node in
    /// the final schedule (jmp adjustment); resolved at emission.
    pub data_link_after: Option<NodeId>,
}

impl Param {
    pub fn none() -> Self {
        Param {
            value: ParamValue::None,
            name: String::new(),
            is_fixed: true,
            deps: Vec::new(),
            transform: None,
            data_link_after: None,
        }
    }

    pub fn fixed_cst(v: i64, name: impl Into<String>) -> Self {
        Param {
            value: ParamValue::Cst(v),
            name: name.into(),
            is_fixed: true,
            ..Param::none()
        }
    }

    pub fn free_cst(name: impl Into<String>) -> Self {
        Param {
            value: ParamValue::Cst(0),
            name: name.into(),
            is_fixed: false,
            ..Param::none()
        }
    }

    pub fn fixed_reg(r: RegId) -> Self {
        Param {
            value: ParamValue::Reg(r),
            is_fixed: true,
            ..Param::none()
        }
    }

    pub fn free_reg() -> Self {
        Param {
            value: ParamValue::Reg(0),
            is_fixed: false,
            ..Param::none()
        }
    }

    pub fn dep_reg(node: NodeId, param: ParamId) -> Self {
        Param {
            value: ParamValue::Reg(0),
            is_fixed: false,
            deps: vec![ParamDep { node, param }],
            ..Param::none()
        }
    }

    /// Dependent constant: `mul * producer + add`.
    pub fn dep_cst(
        node: NodeId,
        param: ParamId,
        mul: i64,
        add: i64,
        name: impl Into<String>,
    ) -> Self {
        Param {
            value: ParamValue::Cst(0),
            name: name.into(),
            is_fixed: false,
            deps: vec![ParamDep { node, param }],
            transform: Some((mul, add)),
            ..Param::none()
        }
    }

    pub fn op(op: Binop) -> Self {
        Param {
            value: ParamValue::Op(op),
            is_fixed: true,
            ..Param::none()
        }
    }

    pub fn is_dependent(&self) -> bool {
        !self.is_fixed && !self.deps.is_empty()
    }

    pub fn is_free(&self) -> bool {
        !self.is_fixed && self.deps.is_empty()
    }
}

/// Branch kind a node requires of its gadget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchReq {
    /// Must return through the stack.
    Ret,
    /// Must jump through a register (created by the jmp adjustment).
    Jmp,
    /// Any of ret or register jump (the IL `jmp` node).
    Any,
    Syscall,
    Int80,
}

/// Node-level selection checks beyond the database key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeCheck {
    /// The load offset must denote a stack slot inside the gadget's
    /// frame, distinct from the return slot (the pop rewrite).
    PopOffset,
}

/// Extra stack slot written below the gadget address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RopPadding {
    pub offset: Param,
    pub value: Param,
}

/// Incoming/outgoing edge lists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EdgeSet {
    pub incoming: Vec<NodeId>,
    pub outgoing: Vec<NodeId>,
}

impl EdgeSet {
    fn add(list: &mut Vec<NodeId>, n: NodeId) {
        if !list.contains(&n) {
            list.push(n);
        }
    }

    pub fn add_incoming(&mut self, n: NodeId) {
        Self::add(&mut self.incoming, n);
    }

    pub fn add_outgoing(&mut self, n: NodeId) {
        Self::add(&mut self.outgoing, n);
    }
}

/// One abstract gadget slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: NodeId,
    pub kind: GadgetType,
    pub params: Vec<Param>,
    pub strategy_edges: EdgeSet,
    pub param_edges: EdgeSet,
    pub branch_req: BranchReq,
    pub checks: Vec<NodeCheck>,
    pub special_paddings: Vec<RopPadding>,
    pub assigned_gadget: Option<GadgetId>,
    /// Address chosen from the gadget's list under the bad-byte filter.
    pub assigned_addr: Option<u64>,
    pub is_indirect: bool,
    pub is_disabled: bool,
    pub mandatory_following_node: Option<NodeId>,
    /// Source IL text, carried into chain comments.
    pub comment: String,
}

impl Node {
    pub fn new(id: NodeId, kind: GadgetType) -> Self {
        let branch_req = match kind {
            GadgetType::Syscall => BranchReq::Syscall,
            GadgetType::Int80 => BranchReq::Int80,
            GadgetType::Jmp => BranchReq::Any,
            _ => BranchReq::Ret,
        };
        Node {
            id,
            kind,
            params: vec![Param::none(); kind.nb_params()],
            strategy_edges: EdgeSet::default(),
            param_edges: EdgeSet::default(),
            branch_req,
            checks: Vec::new(),
            special_paddings: Vec::new(),
            assigned_gadget: None,
            assigned_addr: None,
            is_indirect: false,
            is_disabled: false,
            mandatory_following_node: None,
            comment: String::new(),
        }
    }

    /// Index of the gadget-address parameter.
    pub fn gadget_addr_param(&self) -> ParamId {
        self.kind.nb_domain_params()
    }

    /// Index of the gadget sp-increment parameter.
    pub fn gadget_sp_inc_param(&self) -> ParamId {
        self.kind.nb_domain_params() + 1
    }

    /// Index of the gadget jmp-register parameter.
    pub fn gadget_jmp_reg_param(&self) -> ParamId {
        self.kind.nb_domain_params() + 2
    }

    pub fn has_free_param(&self) -> bool {
        self.params[..self.kind.nb_domain_params()]
            .iter()
            .any(Param::is_free)
    }
}
