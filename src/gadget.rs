//! Gadget records and the raw-gadget analysis pipeline.
//!
//! A [`Gadget`] is immutable once built: raw bytes are decoded, lifted,
//! symbolically executed, and classified into stack-increment, branch
//! kind, and register-set metadata. Per-gadget failures are
//! [`DropReason`]s, logged and swallowed; they never surface to the
//! caller.

use crate::arch::decode::{decode_gadget, Decode, DecodeError};
use crate::arch::lift::{lift_gadget, LiftError};
use crate::arch::{reg, Arch};
use crate::expr::{Expr, ExprKind, RegId, Truth};
use crate::ir::exec::{execute, ExecError, ExitKind, Semantics};
use serde::Serialize;
use std::cmp::Ordering;
use std::fmt;

/// Index of a gadget inside its database.
pub type GadgetId = usize;

/// A raw gadget handed in by the byte-extraction collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawGadget {
    pub addr: u64,
    pub bytes: Vec<u8>,
    /// Identifies the binary or library the bytes come from.
    pub bin_num: i32,
}

/// How control leaves the gadget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchKind {
    /// PC comes from the top of the (post-increment) stack.
    Ret,
    /// PC comes from a register.
    Jmp(RegId),
    /// Like `Jmp` but a return address was pushed.
    Call(RegId),
    /// `syscall` / `sysenter`.
    Syscall,
    /// `int 0x80`.
    Int80,
    /// AArch-class supervisor call; reserved for additional lifters.
    Svc,
    /// Not classified.
    Unknown,
}

/// Compact register bitset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct RegSet(u64);

impl RegSet {
    pub fn new() -> Self {
        RegSet(0)
    }

    pub fn insert(&mut self, r: RegId) {
        self.0 |= 1u64 << r;
    }

    pub fn contains(&self, r: RegId) -> bool {
        self.0 & (1u64 << r) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = RegId> + '_ {
        (0..64).filter(|r| self.contains(*r))
    }

    pub fn intersects(&self, other: &RegSet) -> bool {
        self.0 & other.0 != 0
    }
}

impl FromIterator<RegId> for RegSet {
    fn from_iter<T: IntoIterator<Item = RegId>>(iter: T) -> Self {
        let mut s = RegSet::new();
        for r in iter {
            s.insert(r);
        }
        s
    }
}

/// A classified gadget.
#[derive(Debug, Clone)]
pub struct Gadget {
    /// Database index, set on insertion.
    pub id: GadgetId,
    pub bin_num: i32,
    /// Disassembly, e.g. `pop rax; ret`.
    pub asm_str: String,
    /// Raw bytes in hex.
    pub hex_str: String,
    /// Every address at which these exact bytes occur.
    pub addresses: Vec<u64>,
    /// Simplified per-branch semantics.
    pub semantics: Semantics,
    pub nb_instr: usize,
    pub nb_instr_ir: usize,
    /// Stack increment on exit, in bytes. Always a non-negative
    /// multiple of the word size for classified gadgets.
    pub sp_inc: i64,
    /// Upper bound on stack-relative reads during execution.
    pub max_sp_inc: i64,
    pub branch_kind: BranchKind,
    pub modified_regs: RegSet,
    pub dereferenced_regs: RegSet,
}

impl Gadget {
    /// "Best first" total preorder: smaller `sp_inc`, then fewer machine
    /// instructions, then fewer IR instructions.
    pub fn cmp_quality(&self, other: &Gadget) -> Ordering {
        self.sp_inc
            .cmp(&other.sp_inc)
            .then(self.nb_instr.cmp(&other.nb_instr))
            .then(self.nb_instr_ir.cmp(&other.nb_instr_ir))
    }

    pub fn lthan(&self, other: &Gadget) -> bool {
        self.cmp_quality(other) == Ordering::Less
    }

    /// True if the gadget writes the register.
    pub fn modifies(&self, r: RegId) -> bool {
        self.modified_regs.contains(r)
    }
}

impl fmt::Display for Gadget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.asm_str, self.addresses[0])
    }
}

/// Why a raw gadget was excluded from the database. Non-fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    Decode(DecodeError),
    Lift(LiftError),
    Exec(ExecError),
    /// Execution produced no usable post-state.
    EmptySemantics,
    /// SP does not end at `SP + k` with `k` a non-negative multiple of
    /// the word size.
    SpInc,
    /// PC does not resolve to a supported branch kind.
    BranchKind,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::Decode(e) => write!(f, "decode: {e}"),
            DropReason::Lift(e) => write!(f, "lift: {e}"),
            DropReason::Exec(e) => write!(f, "execute: {e:?}"),
            DropReason::EmptySemantics => write!(f, "empty semantics"),
            DropReason::SpInc => write!(f, "unusable sp increment"),
            DropReason::BranchKind => write!(f, "unclassifiable branch"),
        }
    }
}

/// Analyse one raw gadget into a classified [`Gadget`].
///
/// Deduplication on bytes is the database's job; this is the pure
/// per-gadget pipeline.
pub fn analyse_raw(
    arch: &Arch,
    decoder: &dyn Decode,
    raw: &RawGadget,
) -> Result<Gadget, DropReason> {
    let instrs =
        decode_gadget(decoder, arch, &raw.bytes).map_err(DropReason::Decode)?;
    let asm_str = instrs
        .iter()
        .map(|i| i.text.clone())
        .collect::<Vec<_>>()
        .join("; ");

    let block = lift_gadget(arch, &instrs).map_err(DropReason::Lift)?;
    let out = execute(arch, &block).map_err(DropReason::Exec)?;
    let mut semantics = out.semantics;
    semantics.simplify();
    if semantics.is_empty() {
        return Err(DropReason::EmptySemantics);
    }

    let sp_inc = classify_sp_inc(arch, &semantics)?;
    let branch_kind = classify_branch(arch, &semantics, out.exit, block.ends_with_call, sp_inc)?;

    let mut modified_regs = RegSet::new();
    for (&r, list) in &semantics.regs {
        let unchanged = matches!(
            list.as_slice(),
            [(e, _)] if e.as_reg() == Some(r)
        );
        if !unchanged {
            modified_regs.insert(r);
        }
    }

    let mut deref = Vec::new();
    for list in semantics.regs.values() {
        for (e, _) in list {
            e.collect_deref_regs(&mut deref);
        }
    }
    for write in &semantics.mem {
        write.addr.collect_regs(&mut deref);
        write.addr.collect_deref_regs(&mut deref);
        for (v, _) in &write.values {
            v.collect_deref_regs(&mut deref);
        }
    }
    let dereferenced_regs: RegSet = deref.into_iter().collect();

    Ok(Gadget {
        id: 0,
        bin_num: raw.bin_num,
        asm_str,
        hex_str: hex::encode(&raw.bytes),
        addresses: vec![raw.addr],
        semantics,
        nb_instr: block.nb_instr,
        nb_instr_ir: block.nb_instr_ir,
        sp_inc,
        max_sp_inc: out.max_sp_read.max(sp_inc),
        branch_kind,
        modified_regs,
        dereferenced_regs,
    })
}

/// SP must end at `SP + k`, `k` a non-negative word multiple.
fn classify_sp_inc(arch: &Arch, sem: &Semantics) -> Result<i64, DropReason> {
    let sp = arch.sp();
    match sem.single_value(sp) {
        None => {
            if sem.reg_value(sp).is_some() {
                // Conditional SP is unusable.
                Err(DropReason::SpInc)
            } else {
                Ok(0)
            }
        }
        Some(e) => {
            let p = e.as_polynom().ok_or(DropReason::SpInc)?;
            if p.coeffs.len() != 1 || p.coeffs.get(&sp) != Some(&1) {
                return Err(DropReason::SpInc);
            }
            let k = p.cst;
            if k < 0 || k % arch.octets() as i64 != 0 {
                return Err(DropReason::SpInc);
            }
            Ok(k)
        }
    }
}

fn classify_branch(
    arch: &Arch,
    sem: &Semantics,
    exit: ExitKind,
    ends_with_call: bool,
    sp_inc: i64,
) -> Result<BranchKind, DropReason> {
    match exit {
        ExitKind::Syscall => return Ok(BranchKind::Syscall),
        ExitKind::Int(0x80) => return Ok(BranchKind::Int80),
        ExitKind::Int(_) => return Err(DropReason::BranchKind),
        ExitKind::Fall => {}
    }

    let word = arch.octets() as i64;
    let pc = sem.single_value(arch.pc()).ok_or(DropReason::BranchKind)?;
    match pc.kind() {
        // pc = mem[sp + (sp_inc - word)]  →  RET
        ExprKind::Mem { addr, .. } => {
            let p = addr.as_polynom().ok_or(DropReason::BranchKind)?;
            let sp = arch.sp();
            if p.coeffs.len() == 1
                && p.coeffs.get(&sp) == Some(&1)
                && sp_inc >= word
                && p.cst == sp_inc - word
            {
                Ok(BranchKind::Ret)
            } else {
                Err(DropReason::BranchKind)
            }
        }
        ExprKind::Reg { index, .. } => {
            if ends_with_call {
                Ok(BranchKind::Call(*index))
            } else {
                Ok(BranchKind::Jmp(*index))
            }
        }
        _ => Err(DropReason::BranchKind),
    }
}

/// True when at least one pair of the list is unconditionally valid.
pub fn has_true_pair(list: &[(Expr, crate::expr::Cond)]) -> bool {
    list.iter().any(|(_, c)| c.eval() == Truth::True)
}

/// Exclude SP and PC as classification destinations.
pub fn is_classifiable_dst(arch: &Arch, r: RegId) -> bool {
    arch.is_gpr(r) && r != reg::SP
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::decode::BuiltinDecoder;
    use crate::arch::ArchKind;

    fn analyse(arch: &Arch, addr: u64, bytes: &[u8]) -> Result<Gadget, DropReason> {
        analyse_raw(
            arch,
            &BuiltinDecoder,
            &RawGadget { addr, bytes: bytes.to_vec(), bin_num: 0 },
        )
    }

    #[test]
    fn test_pop_rax_ret() {
        let arch = Arch::new(ArchKind::X64);
        let g = analyse(&arch, 0x400410, &[0x58, 0xc3]).unwrap();
        assert_eq!(g.asm_str, "pop rax; ret");
        assert_eq!(g.sp_inc, 16);
        assert_eq!(g.max_sp_inc, 16);
        assert_eq!(g.branch_kind, BranchKind::Ret);
        assert!(g.modified_regs.contains(reg::AX));
        assert!(g.modified_regs.contains(reg::SP));
        assert!(g.dereferenced_regs.contains(reg::SP));
        assert_eq!(g.nb_instr, 2);
    }

    #[test]
    fn test_mov_reg_ret() {
        let arch = Arch::new(ArchKind::X86);
        // mov eax, ebx ; ret
        let g = analyse(&arch, 0x08048100, &[0x89, 0xd8, 0xc3]).unwrap();
        assert_eq!(g.sp_inc, 4);
        assert_eq!(g.branch_kind, BranchKind::Ret);
        assert!(g.modified_regs.contains(reg::AX));
        assert!(!g.modified_regs.contains(reg::BX));
    }

    #[test]
    fn test_jmp_reg_gadget() {
        let arch = Arch::new(ArchKind::X64);
        let g = analyse(&arch, 0x400000, &[0xff, 0xe1]).unwrap();
        assert_eq!(g.branch_kind, BranchKind::Jmp(reg::CX));
        assert_eq!(g.sp_inc, 0);
    }

    #[test]
    fn test_call_reg_is_dropped_for_sp() {
        // call rax decreases SP; the classifier rejects it.
        let arch = Arch::new(ArchKind::X64);
        let res = analyse(&arch, 0x400000, &[0xff, 0xd0]);
        assert!(matches!(res, Err(DropReason::SpInc)));
    }

    #[test]
    fn test_int80_gadget() {
        let arch = Arch::new(ArchKind::X86);
        let g = analyse(&arch, 0x08048200, &[0xcd, 0x80]).unwrap();
        assert_eq!(g.branch_kind, BranchKind::Int80);
    }

    #[test]
    fn test_syscall_gadget() {
        let arch = Arch::new(ArchKind::X64);
        let g = analyse(&arch, 0x400300, &[0x0f, 0x05]).unwrap();
        assert_eq!(g.branch_kind, BranchKind::Syscall);
    }

    #[test]
    fn test_store_gadget_metadata() {
        // mov [rdi], rax ; ret
        let arch = Arch::new(ArchKind::X64);
        let g = analyse(&arch, 0x400520, &[0x48, 0x89, 0x07, 0xc3]).unwrap();
        assert_eq!(g.branch_kind, BranchKind::Ret);
        assert!(g.dereferenced_regs.contains(reg::DI));
        assert_eq!(g.semantics.mem.len(), 1);
    }

    #[test]
    fn test_undecodable_gadget_dropped() {
        let arch = Arch::new(ArchKind::X64);
        let res = analyse(&arch, 0x400000, &[0xf4, 0xc3]);
        assert!(matches!(res, Err(DropReason::Decode(_))));
    }

    #[test]
    fn test_ordering() {
        let arch = Arch::new(ArchKind::X64);
        // pop rax; ret (sp_inc 16) vs xor eax,eax; ret (sp_inc 8)
        let a = analyse(&arch, 0x1000, &[0x58, 0xc3]).unwrap();
        let b = analyse(&arch, 0x2000, &[0x31, 0xc0, 0xc3]).unwrap();
        assert!(b.lthan(&a));
    }
}
