//! The ROP compiler: IL lowering, the strategy work queue, and chain
//! assembly.
//!
//! A compile takes an IL program, lowers calls and syscalls into
//! register/memory moves per the ABI and OS tables, builds seed strategy
//! graphs per instruction, and runs a work queue per instruction: try a
//! direct selection, otherwise rewrite and enqueue. Successful chains
//! are linked (jmp data links resolve to the next chain's start) and
//! concatenated.

pub mod graph;
pub mod node;
pub mod rules;

pub use graph::{ChainDraft, SelectCtx, StrategyGraph};
pub use node::{BranchReq, GadgetType, Node, NodeId, Param, ParamValue};

use crate::arch::{reg, Arch, ArchKind};
use crate::chain::{ChainItem, RopChain};
use crate::constraint::{Constraint, FailRecord};
use crate::db::{key_cst, GadgetDb};
use crate::error::{Result, RopError};
use crate::expr::RegId;
use crate::il::{IlArg, IlInstruction, IlKind};
use crate::systems::{get_syscall_def, System};
use node::param;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Calling conventions for the function-call IL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Abi {
    X86Cdecl,
    X86Stdcall,
    X64SystemV,
    X64Ms,
    None,
}

impl Abi {
    /// Reject ABI/architecture mismatches early.
    pub fn validate(self, arch: &Arch) -> Result<()> {
        let ok = match self {
            Abi::X86Cdecl | Abi::X86Stdcall => arch.kind() == ArchKind::X86,
            Abi::X64SystemV | Abi::X64Ms => arch.kind() == ArchKind::X64,
            Abi::None => true,
        };
        if ok {
            Ok(())
        } else {
            Err(RopError::AbiMismatch {
                abi: format!("{self:?}"),
                arch: arch.kind().to_string(),
            })
        }
    }
}

/// Cooperative cancellation flag, settable from another thread.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        CancelFlag::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-compile options.
#[derive(Debug, Clone)]
pub struct CompileOptions {
    pub abi: Abi,
    pub os: System,
    /// Writable address range for materialised string literals.
    pub scratch: Option<u64>,
    /// Work-queue budget per IL instruction.
    pub max_graphs: usize,
    pub cancel: Option<CancelFlag>,
    pub deadline: Option<Instant>,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            abi: Abi::None,
            os: System::Linux,
            scratch: None,
            max_graphs: 3000,
            cancel: None,
            deadline: None,
        }
    }
}

/// Result of a compile: a chain, a typed failure, or cancellation.
/// Compile failure is a value, never an error.
#[derive(Debug, Clone)]
pub enum CompileOutcome {
    Chain(RopChain),
    Failed(FailRecord),
    Cancelled,
}

impl CompileOutcome {
    pub fn chain(self) -> Option<RopChain> {
        match self {
            CompileOutcome::Chain(c) => Some(c),
            _ => None,
        }
    }
}

#[derive(Debug)]
enum Unit {
    Graphs(Vec<StrategyGraph>),
}

enum TaskOutcome {
    Chain(ChainDraft),
    Failed,
    Cancelled,
}

enum Trap {
    Syscall,
    Int80,
}

/// The ROP compiler over one architecture and gadget database.
pub struct RopCompiler<'a> {
    arch: &'a Arch,
    db: &'a GadgetDb,
}

impl<'a> RopCompiler<'a> {
    pub fn new(arch: &'a Arch, db: &'a GadgetDb) -> Self {
        RopCompiler { arch, db }
    }

    /// Compile an IL program text into a ROP chain.
    pub fn compile(
        &self,
        program: &str,
        constraint: &Constraint,
        options: &CompileOptions,
    ) -> Result<CompileOutcome> {
        let instrs = crate::il::parse_program(self.arch, program)?;
        self.process(&instrs, constraint, options)
    }

    /// Compile parsed IL instructions.
    pub fn process(
        &self,
        instrs: &[IlInstruction],
        constraint: &Constraint,
        options: &CompileOptions,
    ) -> Result<CompileOutcome> {
        let units = self.lower(instrs, options)?;
        let mut fail = FailRecord::default();
        let mut pieces: Vec<(Vec<ChainItem>, Vec<usize>)> = Vec::new();

        for unit in units {
            let Unit::Graphs(seeds) = unit;
            match self.run_task(seeds, constraint, options, &mut fail) {
                TaskOutcome::Chain(draft) => {
                    pieces.push((draft.chain.items, draft.data_links));
                }
                TaskOutcome::Cancelled => return Ok(CompileOutcome::Cancelled),
                TaskOutcome::Failed => return Ok(CompileOutcome::Failed(fail)),
            }
        }

        // Resolve jmp data links against the next piece's first word.
        for i in 0..pieces.len() {
            if pieces[i].1.is_empty() {
                continue;
            }
            let next_value = pieces[i + 1..]
                .iter()
                .find_map(|p| p.0.first().map(ChainItem::value));
            let Some(value) = next_value else {
                // A jmp-terminated chain with nothing to return to.
                return Ok(CompileOutcome::Failed(fail));
            };
            let links = pieces[i].1.clone();
            for idx in links {
                if let ChainItem::Padding { value: v, .. } = &mut pieces[i].0[idx] {
                    *v = value;
                }
            }
        }

        let mut chain = RopChain::new(self.arch);
        for (items, _) in pieces {
            chain.items.extend(items);
        }
        // Either the emitted chain is verified against the constraints
        // or nothing is emitted.
        if !chain.validate(constraint) {
            return Ok(CompileOutcome::Failed(fail));
        }
        Ok(CompileOutcome::Chain(chain))
    }

    fn cancelled(&self, options: &CompileOptions) -> bool {
        if let Some(flag) = &options.cancel {
            if flag.is_cancelled() {
                return true;
            }
        }
        if let Some(deadline) = options.deadline {
            if Instant::now() >= deadline {
                return true;
            }
        }
        false
    }

    fn run_task(
        &self,
        seeds: Vec<StrategyGraph>,
        constraint: &Constraint,
        options: &CompileOptions,
        fail: &mut FailRecord,
    ) -> TaskOutcome {
        let mut queue: VecDeque<StrategyGraph> = seeds.into();
        let mut tries = 0usize;
        while let Some(mut g) = queue.pop_front() {
            if self.cancelled(options) {
                return TaskOutcome::Cancelled;
            }
            tries += 1;
            if tries > options.max_graphs {
                fail.max_len = true;
                break;
            }
            let mut ctx = SelectCtx {
                db: self.db,
                arch: self.arch,
                constraint,
                fail: &mut *fail,
                cancel: options.cancel.as_ref(),
                cancelled: false,
            };
            let selected = g.select(&mut ctx);
            if ctx.cancelled {
                return TaskOutcome::Cancelled;
            }
            if selected {
                if let Some(order) = g.schedule(self.db) {
                    if let Some(draft) = g.emit(self.db, self.arch, constraint, &order) {
                        debug!(tries, nodes = g.nodes.len(), "strategy satisfied");
                        return TaskOutcome::Chain(draft);
                    }
                }
            }
            for rewritten in rules::apply_all(&g, self.arch) {
                queue.push_back(rewritten);
            }
        }
        TaskOutcome::Failed
    }

    /// Flatten calls, syscalls, and string stores into plain units.
    fn lower(&self, instrs: &[IlInstruction], options: &CompileOptions) -> Result<Vec<Unit>> {
        let mut scratch = options.scratch;
        let mut out = Vec::new();
        for instr in instrs {
            match &instr.kind {
                IlKind::Function { name, args } => {
                    options.abi.validate(self.arch)?;
                    self.lower_call(name, args, options, &mut scratch, &mut out)?;
                }
                IlKind::Syscall { name, args } => {
                    let trap = match self.arch.kind() {
                        ArchKind::X64 => Trap::Syscall,
                        ArchKind::X86 => Trap::Int80,
                    };
                    self.lower_syscall(name, args, trap, options, &mut scratch, &mut out)?;
                }
                IlKind::Int80 { name, args } => {
                    if self.arch.kind() != ArchKind::X86 {
                        return Err(RopError::AbiMismatch {
                            abi: "int80".into(),
                            arch: self.arch.kind().to_string(),
                        });
                    }
                    self.lower_syscall(name, args, Trap::Int80, options, &mut scratch, &mut out)?;
                }
                IlKind::CstStoreString { addr, bytes } => {
                    self.push_string_store(*addr as u64, bytes, &mut out)?;
                }
                other => {
                    out.push(Unit::Graphs(vec![self.seed_graph(other, &instr.text)?]));
                }
            }
        }
        Ok(out)
    }

    /// Function calls resolve through the target OS syscall table; a
    /// richer symbol source is a front-end concern.
    fn lower_call(
        &self,
        name: &str,
        args: &[IlArg],
        options: &CompileOptions,
        scratch: &mut Option<u64>,
        out: &mut Vec<Unit>,
    ) -> Result<()> {
        if get_syscall_def(self.arch.kind(), options.os, name).is_none() {
            return Err(RopError::UnknownSyscall { name: name.to_string() });
        }
        let trap = match self.arch.kind() {
            ArchKind::X64 => Trap::Syscall,
            ArchKind::X86 => Trap::Int80,
        };
        self.lower_syscall(name, args, trap, options, scratch, out)
    }

    fn lower_syscall(
        &self,
        name: &str,
        args: &[IlArg],
        trap: Trap,
        options: &CompileOptions,
        scratch: &mut Option<u64>,
        out: &mut Vec<Unit>,
    ) -> Result<()> {
        let def = get_syscall_def(self.arch.kind(), options.os, name).ok_or_else(|| {
            RopError::UnknownSyscall { name: name.to_string() }
        })?;
        if args.len() != def.nb_args {
            return Err(RopError::BadArity {
                name: name.to_string(),
                expected: def.nb_args,
                actual: args.len(),
            });
        }
        let arg_regs: &[RegId] = match self.arch.kind() {
            ArchKind::X64 => &[reg::DI, reg::SI, reg::DX, reg::R10, reg::R8, reg::R9],
            ArchKind::X86 => &[reg::BX, reg::CX, reg::DX, reg::SI, reg::DI, reg::BP],
        };

        // Materialise string arguments first so their stores precede
        // the register setup.
        let mut resolved: Vec<(RegId, IlArg)> = Vec::new();
        for (arg, &dst) in args.iter().zip(arg_regs) {
            match arg {
                IlArg::Str(bytes) => {
                    let base = scratch.ok_or(RopError::MissingScratch)?;
                    let mut data = bytes.clone();
                    // Guarantee NUL termination for the callee.
                    data.push(0);
                    let used = self.push_string_store(base, &data, out)?;
                    *scratch = Some(base + used);
                    resolved.push((dst, IlArg::Cst(base as i64)));
                }
                other => resolved.push((dst, other.clone())),
            }
        }

        for (dst, arg) in resolved {
            let kind = match arg {
                IlArg::Cst(v) => IlKind::MovCst { dst, cst: v },
                IlArg::Reg(src) => {
                    if src == dst {
                        continue;
                    }
                    IlKind::MovReg { dst, src }
                }
                IlArg::Str(_) => unreachable!("strings resolved above"),
            };
            let text = format!("{} = arg ({name})", self.arch.reg_name(dst));
            out.push(Unit::Graphs(vec![self.seed_graph(&kind, &text)?]));
        }

        let num_kind = IlKind::MovCst { dst: reg::AX, cst: def.num };
        let text = format!("{} = {} ({name})", self.arch.reg_name(reg::AX), def.num);
        out.push(Unit::Graphs(vec![self.seed_graph(&num_kind, &text)?]));

        let mut g = StrategyGraph::new();
        let kind = match trap {
            Trap::Syscall => GadgetType::Syscall,
            Trap::Int80 => GadgetType::Int80,
        };
        let n = g.new_node(kind);
        g.nodes[n].comment = name.to_string();
        out.push(Unit::Graphs(vec![g]));
        Ok(())
    }

    /// Store a byte string word by word at a fixed address. Returns the
    /// number of bytes consumed (padded to a word multiple).
    fn push_string_store(&self, base: u64, bytes: &[u8], out: &mut Vec<Unit>) -> Result<u64> {
        let word = self.arch.octets() as usize;
        let mut padded = bytes.to_vec();
        while padded.len() % word != 0 {
            padded.push(0);
        }
        for (i, chunk) in padded.chunks(word).enumerate() {
            let mut value = 0u64;
            for (j, b) in chunk.iter().enumerate() {
                value |= u64::from(*b) << (8 * j);
            }
            let addr = base + (i * word) as u64;
            let kind = IlKind::CstStoreCst { addr: addr as i64, cst: value as i64 };
            let text = format!("[0x{addr:x}] = {:?}", String::from_utf8_lossy(chunk));
            out.push(Unit::Graphs(vec![self.seed_graph(&kind, &text)?]));
        }
        Ok(padded.len() as u64)
    }

    /// Build the seed strategy graph for one plain IL instruction.
    fn seed_graph(&self, kind: &IlKind, text: &str) -> Result<StrategyGraph> {
        let kc = |v: i64| key_cst(v as u64, self.arch);
        let mut g = StrategyGraph::new();
        match *kind {
            IlKind::MovCst { dst, cst } => {
                let n = g.new_node(GadgetType::MovCst);
                g.nodes[n].params[param::MOVCST_DST_REG] = Param::fixed_reg(dst);
                g.nodes[n].params[param::MOVCST_SRC_CST] = Param::fixed_cst(kc(cst), text);
            }
            IlKind::MovReg { dst, src } => {
                let n = g.new_node(GadgetType::MovReg);
                g.nodes[n].params[param::MOVREG_DST_REG] = Param::fixed_reg(dst);
                g.nodes[n].params[param::MOVREG_SRC_REG] = Param::fixed_reg(src);
            }
            IlKind::AmovCst { dst, src, op, cst } => {
                let n = g.new_node(GadgetType::AmovCst);
                g.nodes[n].params[param::AMOVCST_DST_REG] = Param::fixed_reg(dst);
                g.nodes[n].params[param::AMOVCST_SRC_REG] = Param::fixed_reg(src);
                g.nodes[n].params[param::AMOVCST_OP] = Param::op(op);
                g.nodes[n].params[param::AMOVCST_SRC_CST] = Param::fixed_cst(kc(cst), text);
            }
            IlKind::AmovReg { dst, src1, op, src2 } => {
                let n = g.new_node(GadgetType::AmovReg);
                g.nodes[n].params[param::AMOVREG_DST_REG] = Param::fixed_reg(dst);
                g.nodes[n].params[param::AMOVREG_SRC_REG1] = Param::fixed_reg(src1);
                g.nodes[n].params[param::AMOVREG_OP] = Param::op(op);
                g.nodes[n].params[param::AMOVREG_SRC_REG2] = Param::fixed_reg(src2);
            }
            IlKind::Load { dst, addr_reg, offset } => {
                let n = g.new_node(GadgetType::Load);
                g.nodes[n].params[param::LOAD_DST_REG] = Param::fixed_reg(dst);
                g.nodes[n].params[param::LOAD_ADDR_REG] = Param::fixed_reg(addr_reg);
                g.nodes[n].params[param::LOAD_OFFSET] = Param::fixed_cst(kc(offset), "offset");
            }
            IlKind::Aload { dst, op, addr_reg, offset } => {
                let n = g.new_node(GadgetType::Aload);
                g.nodes[n].params[param::ALOAD_DST_REG] = Param::fixed_reg(dst);
                g.nodes[n].params[param::ALOAD_OP] = Param::op(op);
                g.nodes[n].params[param::ALOAD_ADDR_REG] = Param::fixed_reg(addr_reg);
                g.nodes[n].params[param::ALOAD_OFFSET] = Param::fixed_cst(kc(offset), "offset");
            }
            IlKind::LoadCst { dst, addr } => {
                let n = g.new_node(GadgetType::Load);
                g.nodes[n].params[param::LOAD_DST_REG] = Param::fixed_reg(dst);
                g.nodes[n].params[param::LOAD_ADDR_REG] = Param::free_reg();
                g.nodes[n].params[param::LOAD_OFFSET] = Param::free_cst("offset");
                self.feed_addr(&mut g, n, param::LOAD_ADDR_REG, param::LOAD_OFFSET, kc(addr), text);
            }
            IlKind::AloadCst { dst, op, addr } => {
                let n = g.new_node(GadgetType::Aload);
                g.nodes[n].params[param::ALOAD_DST_REG] = Param::fixed_reg(dst);
                g.nodes[n].params[param::ALOAD_OP] = Param::op(op);
                g.nodes[n].params[param::ALOAD_ADDR_REG] = Param::free_reg();
                g.nodes[n].params[param::ALOAD_OFFSET] = Param::free_cst("offset");
                self.feed_addr(&mut g, n, param::ALOAD_ADDR_REG, param::ALOAD_OFFSET, kc(addr), text);
            }
            IlKind::Store { addr_reg, offset, src } => {
                let n = g.new_node(GadgetType::Store);
                g.nodes[n].params[param::STORE_ADDR_REG] = Param::fixed_reg(addr_reg);
                g.nodes[n].params[param::STORE_OFFSET] = Param::fixed_cst(kc(offset), "offset");
                g.nodes[n].params[param::STORE_SRC_REG] = Param::fixed_reg(src);
            }
            IlKind::Astore { addr_reg, offset, op, src } => {
                let n = g.new_node(GadgetType::Astore);
                g.nodes[n].params[param::ASTORE_ADDR_REG] = Param::fixed_reg(addr_reg);
                g.nodes[n].params[param::ASTORE_OFFSET] = Param::fixed_cst(kc(offset), "offset");
                g.nodes[n].params[param::ASTORE_OP] = Param::op(op);
                g.nodes[n].params[param::ASTORE_SRC_REG] = Param::fixed_reg(src);
            }
            IlKind::CstStore { addr, src } => {
                let n = g.new_node(GadgetType::Store);
                g.nodes[n].params[param::STORE_ADDR_REG] = Param::free_reg();
                g.nodes[n].params[param::STORE_OFFSET] = Param::free_cst("offset");
                g.nodes[n].params[param::STORE_SRC_REG] = Param::fixed_reg(src);
                self.feed_addr(&mut g, n, param::STORE_ADDR_REG, param::STORE_OFFSET, kc(addr), text);
            }
            IlKind::CstAstore { addr, op, src } => {
                let n = g.new_node(GadgetType::Astore);
                g.nodes[n].params[param::ASTORE_ADDR_REG] = Param::free_reg();
                g.nodes[n].params[param::ASTORE_OFFSET] = Param::free_cst("offset");
                g.nodes[n].params[param::ASTORE_OP] = Param::op(op);
                g.nodes[n].params[param::ASTORE_SRC_REG] = Param::fixed_reg(src);
                self.feed_addr(&mut g, n, param::ASTORE_ADDR_REG, param::ASTORE_OFFSET, kc(addr), text);
            }
            IlKind::StoreCst { addr_reg, offset, cst } => {
                let n = g.new_node(GadgetType::Store);
                g.nodes[n].params[param::STORE_ADDR_REG] = Param::fixed_reg(addr_reg);
                g.nodes[n].params[param::STORE_OFFSET] = Param::fixed_cst(kc(offset), "offset");
                g.nodes[n].params[param::STORE_SRC_REG] = Param::free_reg();
                self.feed_src_cst(&mut g, n, param::STORE_SRC_REG, kc(cst), text);
            }
            IlKind::AstoreCst { addr_reg, offset, op, cst } => {
                let n = g.new_node(GadgetType::Astore);
                g.nodes[n].params[param::ASTORE_ADDR_REG] = Param::fixed_reg(addr_reg);
                g.nodes[n].params[param::ASTORE_OFFSET] = Param::fixed_cst(kc(offset), "offset");
                g.nodes[n].params[param::ASTORE_OP] = Param::op(op);
                g.nodes[n].params[param::ASTORE_SRC_REG] = Param::free_reg();
                self.feed_src_cst(&mut g, n, param::ASTORE_SRC_REG, kc(cst), text);
            }
            IlKind::CstStoreCst { addr, cst } => {
                let n = g.new_node(GadgetType::Store);
                g.nodes[n].params[param::STORE_ADDR_REG] = Param::free_reg();
                g.nodes[n].params[param::STORE_OFFSET] = Param::free_cst("offset");
                g.nodes[n].params[param::STORE_SRC_REG] = Param::free_reg();
                self.feed_addr(&mut g, n, param::STORE_ADDR_REG, param::STORE_OFFSET, kc(addr), text);
                self.feed_src_cst(&mut g, n, param::STORE_SRC_REG, kc(cst), text);
            }
            IlKind::CstAstoreCst { addr, op, cst } => {
                let n = g.new_node(GadgetType::Astore);
                g.nodes[n].params[param::ASTORE_ADDR_REG] = Param::free_reg();
                g.nodes[n].params[param::ASTORE_OFFSET] = Param::free_cst("offset");
                g.nodes[n].params[param::ASTORE_OP] = Param::op(op);
                g.nodes[n].params[param::ASTORE_SRC_REG] = Param::free_reg();
                self.feed_addr(&mut g, n, param::ASTORE_ADDR_REG, param::ASTORE_OFFSET, kc(addr), text);
                self.feed_src_cst(&mut g, n, param::ASTORE_SRC_REG, kc(cst), text);
            }
            IlKind::Jmp { reg: r } => {
                let n = g.new_node(GadgetType::Jmp);
                g.nodes[n].params[param::JMP_REG] = Param::fixed_reg(r);
            }
            IlKind::CstStoreString { .. }
            | IlKind::Function { .. }
            | IlKind::Syscall { .. }
            | IlKind::Int80 { .. } => {
                unreachable!("flattened before seeding")
            }
        }
        for n in &mut g.nodes {
            if n.comment.is_empty() {
                n.comment = text.to_string();
            }
        }
        Ok(g)
    }

    /// Add a `MovCst` producing the memory node's address register:
    /// `addr_reg <- target_addr - chosen_offset`.
    fn feed_addr(
        &self,
        g: &mut StrategyGraph,
        mem_node: NodeId,
        addr_param: usize,
        off_param: usize,
        addr: i64,
        text: &str,
    ) {
        let m = g.new_node(GadgetType::MovCst);
        g.nodes[m].comment = text.to_string();
        g.nodes[m].params[param::MOVCST_DST_REG] = Param::dep_reg(mem_node, addr_param);
        g.nodes[m].params[param::MOVCST_SRC_CST] =
            Param::dep_cst(mem_node, off_param, -1, addr, format!("0x{addr:x}"));
        g.add_strategy_edge(m, mem_node);
    }

    /// Add a `MovCst` producing the memory node's source register.
    fn feed_src_cst(
        &self,
        g: &mut StrategyGraph,
        mem_node: NodeId,
        src_param: usize,
        cst: i64,
        text: &str,
    ) {
        let m = g.new_node(GadgetType::MovCst);
        g.nodes[m].comment = text.to_string();
        g.nodes[m].params[param::MOVCST_DST_REG] = Param::dep_reg(mem_node, src_param);
        g.nodes[m].params[param::MOVCST_SRC_CST] =
            Param::fixed_cst(cst, format!("0x{:x}", cst as u64));
        g.add_strategy_edge(m, mem_node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::node::ParamDep;
    use crate::expr::Binop;

    fn x64() -> Arch {
        Arch::new(ArchKind::X64)
    }

    #[test]
    fn test_seed_graph_mov_cst() {
        let arch = x64();
        let db = GadgetDb::new();
        let c = RopCompiler::new(&arch, &db);
        let g = c
            .seed_graph(&IlKind::MovCst { dst: reg::AX, cst: 0x42 }, "rax = 0x42")
            .unwrap();
        assert_eq!(g.nodes.len(), 1);
        assert_eq!(g.nodes[0].kind, GadgetType::MovCst);
        assert_eq!(
            g.nodes[0].params[param::MOVCST_DST_REG].value,
            ParamValue::Reg(reg::AX)
        );
        assert_eq!(
            g.nodes[0].params[param::MOVCST_SRC_CST].value,
            ParamValue::Cst(0x42)
        );
        assert_eq!(g.nodes[0].comment, "rax = 0x42");
    }

    #[test]
    fn test_seed_graph_amov_reg_op_param() {
        let arch = x64();
        let db = GadgetDb::new();
        let c = RopCompiler::new(&arch, &db);
        let kind = IlKind::AmovReg {
            dst: reg::AX,
            src1: reg::AX,
            op: Binop::Add,
            src2: reg::BX,
        };
        let g = c.seed_graph(&kind, "rax += rbx").unwrap();
        assert_eq!(
            g.nodes[0].params[param::AMOVREG_OP].value,
            ParamValue::Op(Binop::Add)
        );
    }

    #[test]
    fn test_seed_graph_cst_store_cst_shape() {
        // [0x600600] = 0xdeadbeef: a free store fed by two movs.
        let arch = x64();
        let db = GadgetDb::new();
        let c = RopCompiler::new(&arch, &db);
        let kind = IlKind::CstStoreCst { addr: 0x600600, cst: 0xdeadbeef };
        let g = c.seed_graph(&kind, "[0x600600] = 0xdeadbeef").unwrap();

        assert_eq!(g.nodes.len(), 3);
        let store = &g.nodes[0];
        assert_eq!(store.kind, GadgetType::Store);
        assert!(store.params[param::STORE_ADDR_REG].is_free());
        assert!(store.params[param::STORE_OFFSET].is_free());
        assert!(store.params[param::STORE_SRC_REG].is_free());

        // The address feeder copies the store's chosen address register
        // and computes `addr - offset`.
        let m_addr = &g.nodes[1];
        assert_eq!(m_addr.kind, GadgetType::MovCst);
        assert_eq!(
            m_addr.params[param::MOVCST_DST_REG].deps,
            vec![ParamDep { node: 0, param: param::STORE_ADDR_REG }]
        );
        assert_eq!(
            m_addr.params[param::MOVCST_SRC_CST].transform,
            Some((-1, 0x600600))
        );
        assert!(m_addr.strategy_edges.outgoing.contains(&0));

        let m_src = &g.nodes[2];
        assert_eq!(
            m_src.params[param::MOVCST_DST_REG].deps,
            vec![ParamDep { node: 0, param: param::STORE_SRC_REG }]
        );
        assert_eq!(
            m_src.params[param::MOVCST_SRC_CST].value,
            ParamValue::Cst(0xdeadbeef)
        );
    }

    #[test]
    fn test_feed_addr_transform() {
        // reg = [cst] decomposes the constant address the same way.
        let arch = x64();
        let db = GadgetDb::new();
        let c = RopCompiler::new(&arch, &db);
        let g = c
            .seed_graph(
                &IlKind::LoadCst { dst: reg::AX, addr: 0x1000 },
                "rax = [0x1000]",
            )
            .unwrap();
        assert_eq!(g.nodes.len(), 2);
        assert_eq!(
            g.nodes[1].params[param::MOVCST_SRC_CST].transform,
            Some((-1, 0x1000))
        );
        assert_eq!(
            g.nodes[1].params[param::MOVCST_SRC_CST].deps,
            vec![ParamDep { node: 0, param: param::LOAD_OFFSET }]
        );
    }

    #[test]
    fn test_push_string_store_chunking() {
        let arch = x64();
        let db = GadgetDb::new();
        let c = RopCompiler::new(&arch, &db);

        let mut out = Vec::new();
        let used = c.push_string_store(0x600800, b"/bin/sh\0", &mut out).unwrap();
        assert_eq!(used, 8);
        assert_eq!(out.len(), 1);
        let Unit::Graphs(seeds) = &out[0];
        // The source feeder carries the chunk packed little-endian.
        assert_eq!(
            seeds[0].nodes[2].params[param::MOVCST_SRC_CST].value,
            ParamValue::Cst(i64::from_le_bytes(*b"/bin/sh\0"))
        );

        // A 9-byte string pads to two words.
        let mut out = Vec::new();
        let used = c.push_string_store(0x600800, b"/bin/cat\0", &mut out).unwrap();
        assert_eq!(used, 16);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_lower_syscall_units() {
        let arch = x64();
        let db = GadgetDb::new();
        let c = RopCompiler::new(&arch, &db);
        let options = CompileOptions::default();

        let mut out = Vec::new();
        let mut scratch = None;
        c.lower_syscall(
            "exit",
            &[IlArg::Cst(42)],
            Trap::Syscall,
            &options,
            &mut scratch,
            &mut out,
        )
        .unwrap();

        // Argument move, syscall number, trap node.
        assert_eq!(out.len(), 3);
        let Unit::Graphs(arg) = &out[0];
        assert_eq!(
            arg[0].nodes[0].params[param::MOVCST_DST_REG].value,
            ParamValue::Reg(reg::DI)
        );
        let Unit::Graphs(num) = &out[1];
        assert_eq!(
            num[0].nodes[0].params[param::MOVCST_SRC_CST].value,
            ParamValue::Cst(60)
        );
        let Unit::Graphs(trap) = &out[2];
        assert_eq!(trap[0].nodes[0].kind, GadgetType::Syscall);
    }

    #[test]
    fn test_lower_syscall_errors() {
        let arch = x64();
        let db = GadgetDb::new();
        let c = RopCompiler::new(&arch, &db);
        let options = CompileOptions::default();
        let mut out = Vec::new();
        let mut scratch = None;

        let err = c
            .lower_syscall("exit", &[], Trap::Syscall, &options, &mut scratch, &mut out)
            .unwrap_err();
        assert!(matches!(err, RopError::BadArity { expected: 1, actual: 0, .. }));

        let err = c
            .lower_syscall(
                "frobnicate",
                &[],
                Trap::Syscall,
                &options,
                &mut scratch,
                &mut out,
            )
            .unwrap_err();
        assert!(matches!(err, RopError::UnknownSyscall { .. }));
    }

    #[test]
    fn test_lower_call_resolves_through_syscall_table() {
        let arch = x64();
        let db = GadgetDb::new();
        let c = RopCompiler::new(&arch, &db);
        let options = CompileOptions { scratch: Some(0x600800), ..Default::default() };

        let mut out = Vec::new();
        let mut scratch = options.scratch;
        c.lower_call(
            "execve",
            &[IlArg::Cst(0x600800), IlArg::Cst(0), IlArg::Cst(0)],
            &options,
            &mut scratch,
            &mut out,
        )
        .unwrap();
        // Three argument moves, the number, the trap.
        assert_eq!(out.len(), 5);

        let mut out = Vec::new();
        let err = c
            .lower_call("frobnicate", &[], &options, &mut scratch, &mut out)
            .unwrap_err();
        assert!(matches!(err, RopError::UnknownSyscall { .. }));
    }

    #[test]
    fn test_string_arg_requires_scratch() {
        let arch = x64();
        let db = GadgetDb::new();
        let c = RopCompiler::new(&arch, &db);
        let options = CompileOptions::default();

        let mut out = Vec::new();
        let mut scratch = None;
        let err = c
            .lower_syscall(
                "execve",
                &[IlArg::Str(b"/bin/sh".to_vec()), IlArg::Cst(0), IlArg::Cst(0)],
                Trap::Syscall,
                &options,
                &mut scratch,
                &mut out,
            )
            .unwrap_err();
        assert!(matches!(err, RopError::MissingScratch));
    }

    #[test]
    fn test_string_arg_advances_scratch_cursor() {
        let arch = x64();
        let db = GadgetDb::new();
        let c = RopCompiler::new(&arch, &db);
        let options = CompileOptions::default();

        let mut out = Vec::new();
        let mut scratch = Some(0x600800);
        c.lower_syscall(
            "execve",
            &[IlArg::Str(b"/bin/sh".to_vec()), IlArg::Cst(0), IlArg::Cst(0)],
            Trap::Syscall,
            &options,
            &mut scratch,
            &mut out,
        )
        .unwrap();
        // "/bin/sh" plus the forced terminator occupies one word.
        assert_eq!(scratch, Some(0x600808));
    }

    #[test]
    fn test_lower_rejects_int80_on_x64() {
        let arch = x64();
        let db = GadgetDb::new();
        let c = RopCompiler::new(&arch, &db);
        let instr = IlInstruction {
            kind: IlKind::Int80 { name: "exit".into(), args: vec![IlArg::Cst(0)] },
            text: "int80 exit(0)".into(),
        };
        let err = c.lower(&[instr], &CompileOptions::default()).unwrap_err();
        assert!(matches!(err, RopError::AbiMismatch { .. }));
    }

    #[test]
    fn test_abi_validation() {
        let x86 = Arch::new(ArchKind::X86);
        assert!(Abi::X64SystemV.validate(&x86).is_err());
        assert!(Abi::X86Cdecl.validate(&x86).is_ok());
        assert!(Abi::None.validate(&x86).is_ok());
        let x64 = x64();
        assert!(Abi::X86Stdcall.validate(&x64).is_err());
        assert!(Abi::X64Ms.validate(&x64).is_ok());
    }

    #[test]
    fn test_run_task_budget_marks_max_len() {
        // An unsatisfiable seed with a tiny budget: the queue is cut off
        // and the failure record says so.
        let arch = x64();
        let db = GadgetDb::new();
        let c = RopCompiler::new(&arch, &db);
        let seeds = vec![c
            .seed_graph(&IlKind::MovReg { dst: reg::CX, src: reg::BX }, "rcx = rbx")
            .unwrap()];
        let options = CompileOptions { max_graphs: 3, ..Default::default() };
        let constraint = Constraint::new();
        let mut fail = FailRecord::default();

        let outcome = c.run_task(seeds, &constraint, &options, &mut fail);
        assert!(matches!(outcome, TaskOutcome::Failed));
        assert!(fail.max_len);
    }

    #[test]
    fn test_run_task_cancellation() {
        let arch = x64();
        let db = GadgetDb::new();
        let c = RopCompiler::new(&arch, &db);
        let seeds = vec![c
            .seed_graph(&IlKind::MovCst { dst: reg::AX, cst: 1 }, "rax = 1")
            .unwrap()];
        let cancel = CancelFlag::new();
        cancel.cancel();
        let options = CompileOptions { cancel: Some(cancel), ..Default::default() };
        let mut fail = FailRecord::default();

        let outcome = c.run_task(seeds, &Constraint::new(), &options, &mut fail);
        assert!(matches!(outcome, TaskOutcome::Cancelled));
    }
}
