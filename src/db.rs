//! Gadget database.
//!
//! An append-only vector of gadgets plus typed multi-key indices. Keys
//! are small integer tuples (registers, operations, constants); buckets
//! keep gadget ids sorted best-first under the gadget quality order.
//! `get` answers exact queries; `get_possible` answers queries where
//! some key positions are free.

use crate::arch::Arch;
use crate::expr::{polynom, Binop, Expr, ExprKind, RegId, Truth};
use crate::gadget::{
    analyse_raw, has_true_pair, is_classifiable_dst, BranchKind, Gadget, GadgetId, RawGadget,
};
use std::collections::HashMap;
use tracing::{debug, info};

/// Encode a constant for use as a key field: canonical signed residue at
/// the architecture width.
pub fn key_cst(value: u64, arch: &Arch) -> i64 {
    polynom::to_signed(value & crate::expr::width_mask(arch.bits()), arch.bits())
}

/// One typed index: key tuple → sorted gadget-id bucket.
#[derive(Debug, Clone, Default)]
pub struct BaseDb<const N: usize> {
    buckets: HashMap<[i64; N], Vec<GadgetId>>,
}

impl<const N: usize> BaseDb<N> {
    fn add(&mut self, key: [i64; N], id: GadgetId, all: &[Gadget]) {
        let bucket = self.buckets.entry(key).or_default();
        if bucket.contains(&id) {
            return;
        }
        let pos = bucket.partition_point(|&g| all[g].lthan(&all[id]));
        bucket.insert(pos, id);
    }

    /// Exact lookup, best gadget first.
    pub fn get(&self, key: &[i64; N]) -> &[GadgetId] {
        self.buckets.get(key).map_or(&[], |b| b.as_slice())
    }

    /// Lookup with free positions: every bucket whose fixed positions
    /// match, ordered by each bucket's best gadget.
    pub fn get_possible(
        &self,
        key: &[i64; N],
        free: &[bool; N],
        all: &[Gadget],
    ) -> Vec<([i64; N], Vec<GadgetId>)> {
        let mut out: Vec<([i64; N], Vec<GadgetId>)> = Vec::new();
        for (k, bucket) in &self.buckets {
            if bucket.is_empty() {
                continue;
            }
            let matches = (0..N).all(|i| free[i] || k[i] == key[i]);
            if matches {
                out.push((*k, bucket.clone()));
            }
        }
        out.sort_by(|a, b| {
            all[a.1[0]]
                .cmp_quality(&all[b.1[0]])
                .then_with(|| a.0.cmp(&b.0))
        });
        out
    }
}

/// The big gadget database.
#[derive(Debug, Clone, Default)]
pub struct GadgetDb {
    /// All gadgets, owned; ids index into this vector.
    pub all: Vec<Gadget>,
    /// Raw bytes already analysed, for address merging.
    seen: HashMap<Vec<u8>, GadgetId>,
    /// `(dst_reg, cst)`
    pub mov_cst: BaseDb<2>,
    /// `(dst_reg, src_reg)`
    pub mov_reg: BaseDb<2>,
    /// `(dst_reg, src_reg, op, cst)`
    pub amov_cst: BaseDb<4>,
    /// `(dst_reg, src_reg1, op, src_reg2)`
    pub amov_reg: BaseDb<4>,
    /// `(dst_reg, addr_reg, offset)`
    pub load: BaseDb<3>,
    /// `(dst_reg, op, addr_reg, offset)`
    pub aload: BaseDb<4>,
    /// `(addr_reg, offset, src_reg)`
    pub store: BaseDb<3>,
    /// `(addr_reg, offset, op, src_reg)`
    pub astore: BaseDb<4>,
    /// `(jmp_reg)`
    pub jmp: BaseDb<1>,
    /// Unit key.
    pub syscall: BaseDb<1>,
    /// Unit key.
    pub int80: BaseDb<1>,
}

enum IndexEntry {
    MovCst([i64; 2]),
    MovReg([i64; 2]),
    AmovCst([i64; 4]),
    AmovReg([i64; 4]),
    Load([i64; 3]),
    Aload([i64; 4]),
    Store([i64; 3]),
    Astore([i64; 4]),
    Jmp([i64; 1]),
    Syscall,
    Int80,
}

impl GadgetDb {
    pub fn new() -> Self {
        GadgetDb::default()
    }

    /// Gadget by id.
    pub fn get(&self, id: GadgetId) -> &Gadget {
        &self.all[id]
    }

    pub fn len(&self) -> usize {
        self.all.len()
    }

    pub fn is_empty(&self) -> bool {
        self.all.is_empty()
    }

    /// Analyse a batch of raw gadgets, merging duplicates by bytes.
    /// Returns the number successfully added.
    pub fn analyse_raw_gadgets(
        &mut self,
        arch: &Arch,
        decoder: &dyn crate::arch::decode::Decode,
        raws: &[RawGadget],
    ) -> usize {
        let mut added = 0;
        for raw in raws {
            if let Some(&id) = self.seen.get(&raw.bytes) {
                if !self.all[id].addresses.contains(&raw.addr) {
                    self.all[id].addresses.push(raw.addr);
                }
                continue;
            }
            match analyse_raw(arch, decoder, raw) {
                Ok(gadget) => {
                    let id = self.add(arch, gadget);
                    self.seen.insert(raw.bytes.clone(), id);
                    added += 1;
                }
                Err(reason) => {
                    debug!(addr = raw.addr, %reason, "gadget dropped");
                }
            }
        }
        info!(
            total = self.all.len(),
            added, "gadget batch analysed"
        );
        added
    }

    /// Insert a classified gadget and populate every index it realises.
    pub fn add(&mut self, arch: &Arch, mut gadget: Gadget) -> GadgetId {
        let id = self.all.len();
        gadget.id = id;
        let entries = classify(arch, &gadget);
        self.all.push(gadget);
        for entry in entries {
            match entry {
                IndexEntry::MovCst(k) => self.mov_cst.add(k, id, &self.all),
                IndexEntry::MovReg(k) => self.mov_reg.add(k, id, &self.all),
                IndexEntry::AmovCst(k) => self.amov_cst.add(k, id, &self.all),
                IndexEntry::AmovReg(k) => self.amov_reg.add(k, id, &self.all),
                IndexEntry::Load(k) => self.load.add(k, id, &self.all),
                IndexEntry::Aload(k) => self.aload.add(k, id, &self.all),
                IndexEntry::Store(k) => self.store.add(k, id, &self.all),
                IndexEntry::Astore(k) => self.astore.add(k, id, &self.all),
                IndexEntry::Jmp(k) => self.jmp.add(k, id, &self.all),
                IndexEntry::Syscall => self.syscall.add([0], id, &self.all),
                IndexEntry::Int80 => self.int80.add([0], id, &self.all),
            }
        }
        id
    }

    pub fn get_mov_cst(&self, dst: RegId, cst: i64) -> &[GadgetId] {
        self.mov_cst.get(&[i64::from(dst), cst])
    }

    pub fn get_mov_reg(&self, dst: RegId, src: RegId) -> &[GadgetId] {
        self.mov_reg.get(&[i64::from(dst), i64::from(src)])
    }

    pub fn get_amov_cst(&self, dst: RegId, src: RegId, op: Binop, cst: i64) -> &[GadgetId] {
        self.amov_cst
            .get(&[i64::from(dst), i64::from(src), op as i64, cst])
    }

    pub fn get_amov_reg(
        &self,
        dst: RegId,
        src1: RegId,
        op: Binop,
        src2: RegId,
    ) -> &[GadgetId] {
        self.amov_reg
            .get(&[i64::from(dst), i64::from(src1), op as i64, i64::from(src2)])
    }

    pub fn get_load(&self, dst: RegId, addr_reg: RegId, offset: i64) -> &[GadgetId] {
        self.load.get(&[i64::from(dst), i64::from(addr_reg), offset])
    }

    pub fn get_aload(
        &self,
        dst: RegId,
        op: Binop,
        addr_reg: RegId,
        offset: i64,
    ) -> &[GadgetId] {
        self.aload
            .get(&[i64::from(dst), op as i64, i64::from(addr_reg), offset])
    }

    pub fn get_store(&self, addr_reg: RegId, offset: i64, src: RegId) -> &[GadgetId] {
        self.store
            .get(&[i64::from(addr_reg), offset, i64::from(src)])
    }

    pub fn get_astore(
        &self,
        addr_reg: RegId,
        offset: i64,
        op: Binop,
        src: RegId,
    ) -> &[GadgetId] {
        self.astore
            .get(&[i64::from(addr_reg), offset, op as i64, i64::from(src)])
    }

    pub fn get_jmp(&self, jmp_reg: RegId) -> &[GadgetId] {
        self.jmp.get(&[i64::from(jmp_reg)])
    }

    pub fn get_syscall(&self) -> &[GadgetId] {
        self.syscall.get(&[0])
    }

    pub fn get_int80(&self) -> &[GadgetId] {
        self.int80.get(&[0])
    }
}

/// Decide which index keys a gadget realises.
fn classify(arch: &Arch, gadget: &Gadget) -> Vec<IndexEntry> {
    let mut out = Vec::new();
    let sem = &gadget.semantics;

    for (&r, list) in &sem.regs {
        if !is_classifiable_dst(arch, r) {
            continue;
        }
        for (e, c) in list {
            if c.eval() != Truth::True {
                continue;
            }
            classify_reg_value(arch, r, e, &mut out);
        }
    }

    for write in &sem.mem {
        let Some((base, off)) = addr_base_offset(arch, &write.addr) else {
            continue;
        };
        if !has_true_pair(&write.values) {
            continue;
        }
        for (v, c) in &write.values {
            if c.eval() != Truth::True {
                continue;
            }
            classify_store_value(arch, base, off, &write.addr, v, &mut out);
        }
    }

    match gadget.branch_kind {
        BranchKind::Jmp(r) => out.push(IndexEntry::Jmp([i64::from(r)])),
        BranchKind::Syscall => out.push(IndexEntry::Syscall),
        BranchKind::Int80 => out.push(IndexEntry::Int80),
        _ => {}
    }

    out
}

fn classify_reg_value(arch: &Arch, r: RegId, e: &Expr, out: &mut Vec<IndexEntry>) {
    let rd = i64::from(r);
    match e.kind() {
        ExprKind::Cst { value, .. } => {
            out.push(IndexEntry::MovCst([rd, key_cst(*value, arch)]));
        }
        ExprKind::Reg { index, .. } if *index != r && arch.is_gpr(*index) => {
            out.push(IndexEntry::MovReg([rd, i64::from(*index)]));
        }
        ExprKind::Binop { op, left, right } => match (left.kind(), right.kind()) {
            (ExprKind::Cst { value, .. }, ExprKind::Reg { index, .. })
                if arch.is_gpr(*index) =>
            {
                out.push(IndexEntry::AmovCst([
                    rd,
                    i64::from(*index),
                    *op as i64,
                    key_cst(*value, arch),
                ]));
            }
            (ExprKind::Reg { index, .. }, ExprKind::Cst { value, .. })
                if arch.is_gpr(*index) =>
            {
                out.push(IndexEntry::AmovCst([
                    rd,
                    i64::from(*index),
                    *op as i64,
                    key_cst(*value, arch),
                ]));
            }
            (ExprKind::Reg { index: s1, .. }, ExprKind::Reg { index: s2, .. })
                if arch.is_gpr(*s1) && arch.is_gpr(*s2) =>
            {
                out.push(IndexEntry::AmovReg([
                    rd,
                    i64::from(*s1),
                    *op as i64,
                    i64::from(*s2),
                ]));
                if op.is_commutative() && s1 != s2 {
                    out.push(IndexEntry::AmovReg([
                        rd,
                        i64::from(*s2),
                        *op as i64,
                        i64::from(*s1),
                    ]));
                }
            }
            // dst = dst OP mem(base + off)
            (ExprKind::Reg { index, .. }, ExprKind::Mem { addr, .. }) if *index == r => {
                if let Some((base, off)) = addr_base_offset(arch, addr) {
                    out.push(IndexEntry::Aload([
                        rd,
                        *op as i64,
                        i64::from(base),
                        off,
                    ]));
                }
            }
            (ExprKind::Mem { addr, .. }, ExprKind::Reg { index, .. }) if *index == r => {
                if let Some((base, off)) = addr_base_offset(arch, addr) {
                    out.push(IndexEntry::Aload([
                        rd,
                        *op as i64,
                        i64::from(base),
                        off,
                    ]));
                }
            }
            _ => {}
        },
        ExprKind::Mem { addr, .. } => {
            if let Some((base, off)) = addr_base_offset(arch, addr) {
                out.push(IndexEntry::Load([rd, i64::from(base), off]));
            }
        }
        _ => {}
    }
}

fn classify_store_value(
    arch: &Arch,
    base: RegId,
    off: i64,
    store_addr: &Expr,
    v: &Expr,
    out: &mut Vec<IndexEntry>,
) {
    let kb = i64::from(base);
    match v.kind() {
        ExprKind::Reg { index, .. } if arch.is_gpr(*index) => {
            out.push(IndexEntry::Store([kb, off, i64::from(*index)]));
        }
        ExprKind::Binop { op, left, right } => {
            let (reg_part, mem_part) = match (left.kind(), right.kind()) {
                (ExprKind::Reg { index, .. }, ExprKind::Mem { addr, .. }) => {
                    (Some(*index), Some(addr))
                }
                (ExprKind::Mem { addr, .. }, ExprKind::Reg { index, .. }) => {
                    (Some(*index), Some(addr))
                }
                _ => (None, None),
            };
            if let (Some(s), Some(mem_addr)) = (reg_part, mem_part) {
                if arch.is_gpr(s) && same_address(store_addr, mem_addr) {
                    out.push(IndexEntry::Astore([kb, off, *op as i64, i64::from(s)]));
                }
            }
        }
        _ => {}
    }
}

/// `base + offset` shape of an address, with a GPR base (SP included:
/// `pop reg` is a load from SP).
pub fn addr_base_offset(arch: &Arch, addr: &Expr) -> Option<(RegId, i64)> {
    let p = addr.as_polynom()?;
    if p.coeffs.len() != 1 {
        return None;
    }
    let (&base, &coeff) = p.coeffs.iter().next()?;
    if coeff != 1 || !arch.is_gpr(base) {
        return None;
    }
    Some((base, p.cst))
}

fn same_address(a: &Expr, b: &Expr) -> bool {
    match (a.as_polynom(), b.as_polynom()) {
        (Some(pa), Some(pb)) => pa == pb,
        _ => a.simplify() == b.simplify(),
    }
}
