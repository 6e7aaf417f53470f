//! Symbolic execution of IR blocks.
//!
//! The executor maintains, per register and temporary, a list of
//! `(expression, guard)` pairs describing the value as a disjoint
//! conditional sum. Memory stores are kept in issue order; loads consult
//! the store history in reverse with polynomial disjointness deciding
//! reuse. Gadgets whose state grows past the per-operand pair limit are
//! not errors for the caller: they are dropped from the candidate set.

use super::{IrBlock, IrInstr, IrOp, IrOperand, NB_MEM_MAX};
use crate::arch::{reg, Arch, ArchKind};
use crate::expr::cond::ranges_disjoint;
use crate::expr::{Binop, Cond, Expr, RegId, Truth, Unop, Width};
use std::collections::BTreeMap;

/// Empirical cap on a single value list; gadgets exceeding it are "too
/// complex" and dropped.
pub const VALUE_LIMIT: usize = 30;
/// Cap on simultaneously live execution paths (forked by `Bcc`).
const PATH_LIMIT: usize = 16;

/// A register or temporary value as a disjoint conditional sum.
pub type ValueSet = Vec<(Expr, Cond)>;

/// One memory store in issue order.
#[derive(Debug, Clone, PartialEq)]
pub struct MemWrite {
    /// Store address (simplified).
    pub addr: Expr,
    /// Stored value(s) with guards.
    pub values: ValueSet,
}

/// Post-state of a gadget: register expression map plus ordered stores.
///
/// A register absent from `regs` is unchanged. A register present is
/// modified, even if some branch symbolically yields its own pre-value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Semantics {
    pub regs: BTreeMap<RegId, ValueSet>,
    pub mem: Vec<MemWrite>,
}

impl Semantics {
    /// Post value list for a register, if it was modified.
    pub fn reg_value(&self, r: RegId) -> Option<&ValueSet> {
        self.regs.get(&r)
    }

    /// The register's single unconditional post value, if its list has
    /// exactly one pair guarded by a decidably-true condition.
    pub fn single_value(&self, r: RegId) -> Option<&Expr> {
        match self.regs.get(&r)?.as_slice() {
            [(e, c)] if c.eval() == Truth::True => Some(e),
            _ => None,
        }
    }

    /// Simplify every expression, decide every decidable guard, and
    /// split the result into clean per-branch pairs (the "tweak" pass).
    pub fn simplify(&mut self) {
        for list in self.regs.values_mut() {
            tweak_list(list);
        }
        for write in &mut self.mem {
            write.addr = write.addr.simplify();
            tweak_list(&mut write.values);
        }
        self.mem.retain(|w| !w.values.is_empty());
    }

    pub fn is_empty(&self) -> bool {
        self.regs.is_empty() && self.mem.is_empty()
    }
}

fn tweak_list(list: &mut ValueSet) {
    for (e, c) in list.iter_mut() {
        *e = e.simplify();
        match c.eval() {
            Truth::True => *c = Cond::True,
            Truth::False => *c = Cond::False,
            Truth::Unknown => {}
        }
    }
    list.retain(|(_, c)| !matches!(c, Cond::False));
}

/// How the executed block left the CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Fell off the end; the branch kind comes from the PC semantics.
    Fall,
    /// Ended in a software interrupt with this vector.
    Int(u8),
    /// Ended in `syscall` / `sysenter`.
    Syscall,
}

/// Result of executing a block.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecOutput {
    pub semantics: Semantics,
    /// Highest byte offset above the initial SP read during execution.
    pub max_sp_read: i64,
    pub exit: ExitKind,
}

/// Why execution gave up on a gadget. Non-fatal: the analyser drops it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecError {
    /// A value list outgrew [`VALUE_LIMIT`].
    TooManyValues,
    /// More pending stores than [`NB_MEM_MAX`].
    TooManyStores,
    /// `Bcc` forking outgrew the path budget.
    TooManyPaths,
    /// Malformed operand combination from the lifter.
    BadOperand,
}

struct Store {
    addr: Expr,
    values: ValueSet,
}

struct Path {
    guard: Cond,
    regs: Vec<Option<ValueSet>>,
    tmps: Vec<Option<ValueSet>>,
    stores: Vec<Store>,
    bblock: usize,
    index: usize,
    exit: ExitKind,
    max_sp_read: i64,
}

impl Path {
    fn initial(arch: &Arch) -> Self {
        Path {
            guard: Cond::True,
            regs: vec![None; arch.nb_regs()],
            tmps: Vec::new(),
            stores: Vec::new(),
            bblock: 0,
            index: 0,
            exit: ExitKind::Fall,
            max_sp_read: 0,
        }
    }

    fn fork(&self, extra_guard: Cond, bblock: usize) -> Self {
        Path {
            guard: Cond::and(self.guard.clone(), extra_guard),
            regs: self.regs.clone(),
            tmps: self.tmps.clone(),
            stores: self
                .stores
                .iter()
                .map(|s| Store {
                    addr: s.addr.clone(),
                    values: s.values.clone(),
                })
                .collect(),
            bblock,
            index: 0,
            exit: self.exit,
            max_sp_read: self.max_sp_read,
        }
    }
}

/// Width of a register's full symbolic value.
fn reg_width(arch: &Arch, r: RegId) -> Width {
    if arch.is_flag(r) {
        arch.flag_width()
    } else {
        arch.bits()
    }
}

/// Stack/heap no-overlap assumption: an SP-relative access and an
/// access through any other register base never alias. In a ROP context
/// SP points into the controlled stack while other bases point at
/// target memory; without this the terminating `ret` of every store
/// gadget would alias the store and the gadget would be unusable.
fn stack_disjoint(arch: &Arch, a: &Expr, b: &Expr) -> bool {
    let (Some(pa), Some(pb)) = (a.as_polynom(), b.as_polynom()) else {
        return false;
    };
    if pa.coeffs == pb.coeffs {
        return false;
    }
    let sp = arch.sp();
    let is_stack = |p: &crate::expr::Polynom| {
        p.coeffs.len() == 1 && p.coeffs.get(&sp) == Some(&1)
    };
    is_stack(&pa) || is_stack(&pb)
}

/// Execute a lifted block into gadget semantics.
pub fn execute(arch: &Arch, block: &IrBlock) -> Result<ExecOutput, ExecError> {
    let keep = liveness(arch, block);
    let mut done: Vec<Path> = Vec::new();
    let mut work = vec![Path::initial(arch)];

    while let Some(mut path) = work.pop() {
        loop {
            let instrs = match block.bblocks.get(path.bblock) {
                Some(i) => i,
                None => return Err(ExecError::BadOperand),
            };
            if path.index >= instrs.len() {
                done.push(path);
                break;
            }
            let i = path.index;
            path.index += 1;
            if !keep[path.bblock][i] {
                continue;
            }
            let instr = &instrs[i];
            match instr.op {
                IrOp::Nop => {}
                IrOp::Mov => {
                    let v = read(arch, &mut path, &instr.src1)?;
                    write(arch, &mut path, &instr.dst, v)?;
                }
                IrOp::Unknown => {
                    let w = instr.dst.width();
                    write(
                        arch,
                        &mut path,
                        &instr.dst,
                        vec![(Expr::unknown(w), Cond::True)],
                    )?;
                }
                IrOp::Bisz => {
                    let src = read(arch, &mut path, &instr.src1)?;
                    let mut out: ValueSet = Vec::new();
                    for (e, c) in src {
                        let e = e.simplify();
                        if let Some(v) = e.as_cst() {
                            out.push((Expr::cst(u64::from(v == 0), 1), c));
                        } else {
                            let zero = Expr::cst(0, e.width());
                            out.push((
                                Expr::cst(1, 1),
                                Cond::and(c.clone(), Cond::Eq(e.clone(), zero.clone())),
                            ));
                            out.push((
                                Expr::cst(0, 1),
                                Cond::and(c, Cond::Neq(e, zero)),
                            ));
                        }
                        if out.len() > VALUE_LIMIT {
                            return Err(ExecError::TooManyValues);
                        }
                    }
                    write(arch, &mut path, &instr.dst, out)?;
                }
                IrOp::Not | IrOp::Neg => {
                    let op = if instr.op == IrOp::Not {
                        Unop::Not
                    } else {
                        Unop::Neg
                    };
                    let src = read(arch, &mut path, &instr.src1)?;
                    let out: ValueSet = src
                        .into_iter()
                        .map(|(e, c)| (Expr::unop(op, e), c))
                        .collect();
                    write(arch, &mut path, &instr.dst, out)?;
                }
                op if op.is_arith() => {
                    let binop = arith_to_binop(op);
                    let a = read(arch, &mut path, &instr.src1)?;
                    let b = read(arch, &mut path, &instr.src2)?;
                    let mut out: ValueSet = Vec::new();
                    for (ea, ca) in &a {
                        for (eb, cb) in &b {
                            out.push((
                                Expr::binop(binop, ea.clone(), eb.clone()),
                                Cond::and(ca.clone(), cb.clone()),
                            ));
                            if out.len() > VALUE_LIMIT {
                                return Err(ExecError::TooManyValues);
                            }
                        }
                    }
                    write(arch, &mut path, &instr.dst, out)?;
                }
                IrOp::Ldm => {
                    let addrs = read(arch, &mut path, &instr.src1)?;
                    let w = instr.dst.width();
                    let mut out: ValueSet = Vec::new();
                    for (a, ga) in &addrs {
                        load_from(arch, &mut path, a, ga, w, &mut out)?;
                    }
                    if out.len() > VALUE_LIMIT {
                        return Err(ExecError::TooManyValues);
                    }
                    write(arch, &mut path, &instr.dst, out)?;
                }
                IrOp::Stm => {
                    let addrs = read(arch, &mut path, &instr.dst)?;
                    let vals = read(arch, &mut path, &instr.src1)?;
                    for (a, ga) in &addrs {
                        store_to(arch, &mut path, a, ga, &vals)?;
                    }
                }
                IrOp::Bcc => {
                    let conds = read(arch, &mut path, &instr.dst)?;
                    let (IrOperand::Cst { value: t_nz, .. }, IrOperand::Cst { value: t_z, .. }) =
                        (instr.src1, instr.src2)
                    else {
                        return Err(ExecError::BadOperand);
                    };
                    for (e, g) in conds {
                        let e = e.simplify();
                        if let Some(v) = e.as_cst() {
                            let target = if v != 0 { t_nz } else { t_z };
                            work.push(path.fork(g, target as usize));
                        } else {
                            let zero = Expr::cst(0, e.width());
                            work.push(path.fork(
                                Cond::and(g.clone(), Cond::Neq(e.clone(), zero.clone())),
                                t_nz as usize,
                            ));
                            work.push(
                                path.fork(Cond::and(g, Cond::Eq(e, zero)), t_z as usize),
                            );
                        }
                        if work.len() + done.len() > PATH_LIMIT {
                            return Err(ExecError::TooManyPaths);
                        }
                    }
                    break;
                }
                IrOp::Int => {
                    let IrOperand::Cst { value, .. } = instr.src1 else {
                        return Err(ExecError::BadOperand);
                    };
                    path.exit = ExitKind::Int(value as u8);
                    done.push(path);
                    break;
                }
                IrOp::Syscall => {
                    path.exit = ExitKind::Syscall;
                    done.push(path);
                    break;
                }
                _ => return Err(ExecError::BadOperand),
            }
        }
    }

    Ok(merge_paths(arch, done))
}

fn arith_to_binop(op: IrOp) -> Binop {
    match op {
        IrOp::Add => Binop::Add,
        IrOp::Sub => Binop::Sub,
        IrOp::Mul => Binop::Mul,
        IrOp::Div => Binop::Div,
        IrOp::Mod => Binop::Mod,
        IrOp::And => Binop::And,
        IrOp::Or => Binop::Or,
        IrOp::Xor => Binop::Xor,
        IrOp::Shl => Binop::Shl,
        IrOp::Shr => Binop::Shr,
        _ => unreachable!("not an arithmetic op"),
    }
}

/// Read an operand's value list, slicing partial bit ranges.
fn read(arch: &Arch, path: &mut Path, op: &IrOperand) -> Result<ValueSet, ExecError> {
    match *op {
        IrOperand::Cst { value, width } => Ok(vec![(Expr::cst(value, width), Cond::True)]),
        IrOperand::Var { reg, high, low } => {
            let full = reg_width(arch, reg);
            let base = match &path.regs[usize::from(reg)] {
                Some(list) => list.clone(),
                None => vec![(Expr::reg(reg, full), Cond::True)],
            };
            Ok(slice_list(base, full, high, low))
        }
        IrOperand::Tmp { index, high, low } => {
            let slot = path.tmps.get(usize::from(index)).and_then(|s| s.clone());
            let base = match slot {
                Some(list) => list,
                // A read-before-write temporary is opaque.
                None => vec![(Expr::unknown(high - low + 1), Cond::True)],
            };
            let full = base[0].0.width();
            Ok(slice_list(base, full, high, low))
        }
        IrOperand::None => Err(ExecError::BadOperand),
    }
}

fn slice_list(base: ValueSet, full: Width, high: u16, low: u16) -> ValueSet {
    if low == 0 && high + 1 == full {
        return base;
    }
    base.into_iter()
        .map(|(e, c)| {
            let e = if e.width() > high {
                Expr::extract(e, high, low)
            } else {
                Expr::unknown(high - low + 1)
            };
            (e, c)
        })
        .collect()
}

/// Write a value list to an operand, splicing partial bit ranges into
/// the preserved bits. On X64, a write to the low 32-bit half of a GPR
/// clears the upper half; this rule is applied here, uniformly.
fn write(
    arch: &Arch,
    path: &mut Path,
    dst: &IrOperand,
    values: ValueSet,
) -> Result<(), ExecError> {
    match *dst {
        IrOperand::Var { reg, high, low } => {
            let full = reg_width(arch, reg);
            let spliced = if low == 0 && high + 1 == full {
                values
            } else if arch.kind() == ArchKind::X64
                && arch.is_gpr(reg)
                && low == 0
                && high == 31
            {
                values
                    .into_iter()
                    .map(|(e, c)| (Expr::concat(Expr::cst(0, 32), e), c))
                    .collect()
            } else {
                let old = match &path.regs[usize::from(reg)] {
                    Some(list) => list.clone(),
                    None => vec![(Expr::reg(reg, full), Cond::True)],
                };
                splice(old, values, full, high, low)?
            };
            if spliced.len() > VALUE_LIMIT {
                return Err(ExecError::TooManyValues);
            }
            path.regs[usize::from(reg)] = Some(spliced);
            Ok(())
        }
        IrOperand::Tmp { index, high, low } => {
            let idx = usize::from(index);
            if path.tmps.len() <= idx {
                path.tmps.resize(idx + 1, None);
            }
            let full = high + 1; // Temporaries are written from bit 0 up.
            let spliced = if low == 0 {
                values
            } else {
                let old = match &path.tmps[idx] {
                    Some(list) => list.clone(),
                    None => vec![(Expr::unknown(full), Cond::True)],
                };
                splice(old, values, full, high, low)?
            };
            if spliced.len() > VALUE_LIMIT {
                return Err(ExecError::TooManyValues);
            }
            path.tmps[idx] = Some(spliced);
            Ok(())
        }
        _ => Err(ExecError::BadOperand),
    }
}

/// Concat the preserved old bits around the new range.
fn splice(
    old: ValueSet,
    new: ValueSet,
    full: Width,
    high: u16,
    low: u16,
) -> Result<ValueSet, ExecError> {
    let mut out: ValueSet = Vec::new();
    for (n, cn) in &new {
        for (o, co) in &old {
            let mut e = n.clone();
            if low > 0 {
                e = Expr::concat(e, Expr::extract(o.clone(), low - 1, 0));
            }
            if high + 1 < full {
                e = Expr::concat(Expr::extract(o.clone(), full - 1, high + 1), e);
            }
            out.push((e, Cond::and(cn.clone(), co.clone())));
            if out.len() > VALUE_LIMIT {
                return Err(ExecError::TooManyValues);
            }
        }
    }
    Ok(out)
}

/// Resolve a load against the store history, newest first.
fn load_from(
    arch: &Arch,
    path: &mut Path,
    addr: &Expr,
    guard: &Cond,
    width: Width,
    out: &mut ValueSet,
) -> Result<(), ExecError> {
    let addr = addr.simplify();
    let load_bytes = u64::from(width) / 8;

    // Stack-read bookkeeping for max_sp_inc.
    if let Some(p) = addr.as_polynom() {
        if p.coeffs.len() == 1 && p.coeffs.get(&arch.sp()) == Some(&1) {
            path.max_sp_read = path.max_sp_read.max(p.cst + load_bytes as i64);
        }
    }

    let mut covered = false;
    let mut disjoint_clause = Cond::True;
    for store in path.stores.iter().rev() {
        let store_bytes = u64::from(store.values[0].0.width()) / 8;
        match ranges_disjoint(&addr, load_bytes, &store.addr, store_bytes) {
            Truth::True => continue,
            _ => {}
        }
        if stack_disjoint(arch, &addr, &store.addr) {
            continue;
        }
        let eq = Cond::Eq(addr.clone(), store.addr.clone());
        let same_width = store_bytes == load_bytes;
        match eq.eval() {
            Truth::True if same_width => {
                for (v, gv) in &store.values {
                    out.push((v.clone(), Cond::and(guard.clone(), gv.clone())));
                }
                covered = true;
                break;
            }
            Truth::False => continue,
            _ => {
                if same_width {
                    for (v, gv) in &store.values {
                        out.push((
                            v.clone(),
                            Cond::and(
                                guard.clone(),
                                Cond::and(gv.clone(), eq.clone()),
                            ),
                        ));
                    }
                    disjoint_clause =
                        Cond::and(disjoint_clause, Cond::negate(eq.clone()));
                } else {
                    // Partial overlap with a different access width: the
                    // loaded bytes are opaque under that overlap.
                    out.push((Expr::unknown(width), Cond::Unknown));
                    disjoint_clause = Cond::and(disjoint_clause, Cond::Unknown);
                }
            }
        }
    }
    if !covered {
        out.push((
            Expr::mem(addr, width),
            Cond::and(guard.clone(), disjoint_clause),
        ));
    }
    Ok(())
}

/// Push a store, weakening prior stores it may overwrite.
fn store_to(
    arch: &Arch,
    path: &mut Path,
    addr: &Expr,
    guard: &Cond,
    values: &ValueSet,
) -> Result<(), ExecError> {
    let addr = addr.simplify();
    let new_bytes = u64::from(values[0].0.width()) / 8;
    let definite = guard.eval() == Truth::True;

    for store in path.stores.iter_mut() {
        let store_bytes = u64::from(store.values[0].0.width()) / 8;
        match ranges_disjoint(&addr, new_bytes, &store.addr, store_bytes) {
            Truth::True => continue,
            _ => {}
        }
        if stack_disjoint(arch, &addr, &store.addr) {
            continue;
        }
        let eq = Cond::Eq(addr.clone(), store.addr.clone());
        if definite && eq.eval() == Truth::True && new_bytes == store_bytes {
            // Fully shadowed.
            store.values.clear();
        } else {
            let not_overwritten = Cond::negate(eq);
            for (_, c) in store.values.iter_mut() {
                *c = Cond::and(c.clone(), not_overwritten.clone());
            }
        }
    }
    path.stores.retain(|s| !s.values.is_empty());

    let stored: ValueSet = values
        .iter()
        .map(|(v, c)| (v.clone(), Cond::and(guard.clone(), c.clone())))
        .collect();
    path.stores.push(Store { addr, values: stored });
    if path.stores.len() > NB_MEM_MAX {
        return Err(ExecError::TooManyStores);
    }
    Ok(())
}

fn merge_paths(arch: &Arch, paths: Vec<Path>) -> ExecOutput {
    let mut regs: BTreeMap<RegId, ValueSet> = BTreeMap::new();
    let mut mem: Vec<MemWrite> = Vec::new();
    let mut exit = ExitKind::Fall;
    let mut max_sp_read = 0i64;

    // Union of registers modified anywhere.
    let mut modified: Vec<RegId> = Vec::new();
    for path in &paths {
        for (i, slot) in path.regs.iter().enumerate() {
            if slot.is_some() && !modified.contains(&(i as RegId)) {
                modified.push(i as RegId);
            }
        }
    }

    for path in &paths {
        if path.exit != ExitKind::Fall {
            exit = path.exit;
        }
        max_sp_read = max_sp_read.max(path.max_sp_read);
        for &r in &modified {
            let entry = regs.entry(r).or_default();
            match &path.regs[usize::from(r)] {
                Some(list) => {
                    for (e, c) in list {
                        entry.push((e.clone(), Cond::and(path.guard.clone(), c.clone())));
                    }
                }
                None => entry.push((
                    Expr::reg(r, reg_width(arch, r)),
                    path.guard.clone(),
                )),
            }
        }
        for store in &path.stores {
            mem.push(MemWrite {
                addr: store.addr.clone(),
                values: store
                    .values
                    .iter()
                    .map(|(v, c)| (v.clone(), Cond::and(path.guard.clone(), c.clone())))
                    .collect(),
            });
        }
    }

    ExecOutput {
        semantics: Semantics { regs, mem },
        max_sp_read,
        exit,
    }
}

/// Backward liveness over the whole block: instructions whose result
/// flows only into ignored registers (the CPU flags) are skipped, so the
/// executor does not spend state space on flag arithmetic.
fn liveness(arch: &Arch, block: &IrBlock) -> Vec<Vec<bool>> {
    let mut keep: Vec<Vec<bool>> = block
        .bblocks
        .iter()
        .map(|b| vec![false; b.len()])
        .collect();
    let mut needed_regs = vec![false; arch.nb_regs()];
    let mut needed_tmps = vec![false; usize::from(block.nb_tmps)];

    let mut changed = true;
    while changed {
        changed = false;
        for (bi, bblock) in block.bblocks.iter().enumerate() {
            for (ii, instr) in bblock.iter().enumerate().rev() {
                if keep[bi][ii] {
                    continue;
                }
                let must = match instr.op {
                    IrOp::Stm | IrOp::Bcc | IrOp::Int | IrOp::Syscall => true,
                    IrOp::Nop => false,
                    _ => match instr.dst {
                        IrOperand::Var { reg, .. } => {
                            !arch.ignored_regs().contains(&reg)
                                || needed_regs[usize::from(reg)]
                        }
                        IrOperand::Tmp { index, .. } => needed_tmps[usize::from(index)],
                        _ => false,
                    },
                };
                if must {
                    keep[bi][ii] = true;
                    changed = true;
                    for op in reads_of(instr) {
                        match op {
                            IrOperand::Var { reg, .. } => {
                                needed_regs[usize::from(reg)] = true;
                            }
                            IrOperand::Tmp { index, .. } => {
                                needed_tmps[usize::from(index)] = true;
                            }
                            _ => {}
                        }
                    }
                }
            }
        }
    }
    keep
}

fn reads_of(instr: &IrInstr) -> Vec<IrOperand> {
    let mut out = Vec::new();
    match instr.op {
        IrOp::Stm => {
            out.push(instr.dst);
            out.push(instr.src1);
        }
        IrOp::Bcc => out.push(instr.dst),
        _ => {
            if !instr.src1.is_none() {
                out.push(instr.src1);
            }
            if !instr.src2.is_none() {
                out.push(instr.src2);
            }
            // A destination spliced above bit 0 also reads its
            // preserved low bits.
            if let IrOperand::Var { low, .. } | IrOperand::Tmp { low, .. } = instr.dst {
                if low != 0 {
                    out.push(instr.dst);
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::reg;

    fn x64() -> Arch {
        Arch::new(ArchKind::X64)
    }

    fn var(r: RegId) -> IrOperand {
        IrOperand::var(r, 64)
    }

    #[test]
    fn test_mov_cst() {
        let arch = x64();
        let mut blk = IrBlock::new();
        blk.push(0, IrInstr::mov(var(reg::AX), IrOperand::cst(42, 64)));
        let out = execute(&arch, &blk).unwrap();
        let mut sem = out.semantics;
        sem.simplify();
        assert_eq!(sem.single_value(reg::AX), Some(&Expr::cst(42, 64)));
        assert!(sem.reg_value(reg::BX).is_none());
    }

    #[test]
    fn test_pop_semantics() {
        // pop rax: rax = mem[rsp]; rsp = rsp + 8
        let arch = x64();
        let mut blk = IrBlock::new();
        blk.push(0, IrInstr::ldm(var(reg::AX), var(reg::SP)));
        blk.push(
            0,
            IrInstr::arith(
                IrOp::Add,
                var(reg::SP),
                var(reg::SP),
                IrOperand::cst(8, 64),
            ),
        );
        let out = execute(&arch, &blk).unwrap();
        let mut sem = out.semantics;
        sem.simplify();
        assert_eq!(
            sem.single_value(reg::AX),
            Some(&Expr::mem(Expr::reg(reg::SP, 64), 64))
        );
        assert_eq!(
            sem.single_value(reg::SP),
            Some(&Expr::cst(8, 64).add(Expr::reg(reg::SP, 64)).simplify())
        );
        assert_eq!(out.max_sp_read, 8);
    }

    #[test]
    fn test_store_forwarding() {
        // mem[rbx] = rcx; rax = mem[rbx]  →  rax = rcx
        let arch = x64();
        let mut blk = IrBlock::new();
        blk.push(0, IrInstr::stm(var(reg::BX), var(reg::CX)));
        blk.push(0, IrInstr::ldm(var(reg::AX), var(reg::BX)));
        let out = execute(&arch, &blk).unwrap();
        let mut sem = out.semantics;
        sem.simplify();
        assert_eq!(sem.single_value(reg::AX), Some(&Expr::reg(reg::CX, 64)));
        assert_eq!(sem.mem.len(), 1);
    }

    #[test]
    fn test_load_disjoint_from_store() {
        // mem[rbx] = rcx; rax = mem[rbx + 8]: forwarding must not apply.
        let arch = x64();
        let mut blk = IrBlock::new();
        let t = blk.new_tmp(64);
        blk.push(0, IrInstr::stm(var(reg::BX), var(reg::CX)));
        blk.push(
            0,
            IrInstr::arith(IrOp::Add, t, var(reg::BX), IrOperand::cst(8, 64)),
        );
        blk.push(0, IrInstr::ldm(var(reg::AX), t));
        let out = execute(&arch, &blk).unwrap();
        let mut sem = out.semantics;
        sem.simplify();
        let expected = Expr::mem(
            Expr::cst(8, 64).add(Expr::reg(reg::BX, 64)),
            64,
        )
        .simplify();
        assert_eq!(sem.single_value(reg::AX), Some(&expected));
    }

    #[test]
    fn test_x64_low_half_write_zero_extends() {
        // A 32-bit write to a GPR clears the upper half.
        let arch = x64();
        let mut blk = IrBlock::new();
        blk.push(
            0,
            IrInstr::mov(
                IrOperand::Var { reg: reg::AX, high: 31, low: 0 },
                IrOperand::cst(7, 32),
            ),
        );
        let out = execute(&arch, &blk).unwrap();
        let mut sem = out.semantics;
        sem.simplify();
        assert_eq!(sem.single_value(reg::AX), Some(&Expr::cst(7, 64)));
    }

    #[test]
    fn test_flag_arithmetic_is_skipped() {
        // A flag write whose value feeds nothing must not execute.
        let arch = x64();
        let mut blk = IrBlock::new();
        let t = blk.new_tmp(64);
        blk.push(
            0,
            IrInstr::arith(IrOp::Add, t, var(reg::AX), var(reg::BX)),
        );
        blk.push(0, IrInstr::mov(var(reg::AX), t));
        // Dead flag computation over a second temporary.
        let t2 = blk.new_tmp(1);
        blk.push(
            0,
            IrInstr::arith(
                IrOp::Xor,
                t2,
                IrOperand::cst(1, 1),
                IrOperand::cst(0, 1),
            ),
        );
        blk.push(0, IrInstr::mov(IrOperand::var(reg::ZF, 1), t2));
        let keep = liveness(&arch, &blk);
        assert!(keep[0][0] && keep[0][1]);
        assert!(!keep[0][2] && !keep[0][3]);
        let out = execute(&arch, &blk).unwrap();
        assert!(out.semantics.reg_value(reg::ZF).is_none());
    }

    #[test]
    fn test_bcc_produces_branch_pairs() {
        // if zf != 0 { rax = 1 } else { rax = 2 }
        let arch = x64();
        let mut blk = IrBlock::new();
        let taken = blk.new_bblock();
        let fall = blk.new_bblock();
        blk.push(
            0,
            IrInstr::new(
                IrOp::Bcc,
                IrOperand::var(reg::ZF, 1),
                IrOperand::cst(taken as u64, 64),
                IrOperand::cst(fall as u64, 64),
            ),
        );
        blk.push(taken, IrInstr::mov(var(reg::AX), IrOperand::cst(1, 64)));
        blk.push(fall, IrInstr::mov(var(reg::AX), IrOperand::cst(2, 64)));
        let out = execute(&arch, &blk).unwrap();
        let mut sem = out.semantics;
        sem.simplify();
        let list = sem.reg_value(reg::AX).unwrap();
        assert_eq!(list.len(), 2);
        assert!(list.iter().all(|(_, c)| c.eval() == Truth::Unknown));
    }

    #[test]
    fn test_store_count_limit() {
        let arch = x64();
        let mut blk = IrBlock::new();
        for i in 0..=NB_MEM_MAX as u64 {
            let t = blk.new_tmp(64);
            blk.push(
                0,
                IrInstr::arith(
                    IrOp::Add,
                    t,
                    var(reg::BX),
                    IrOperand::cst(i * 8, 64),
                ),
            );
            blk.push(0, IrInstr::stm(t, var(reg::CX)));
        }
        assert!(matches!(
            execute(&arch, &blk),
            Err(ExecError::TooManyStores)
        ));
    }
}
