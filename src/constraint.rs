//! User constraints and failure reporting.
//!
//! Constraints filter gadget selection: forbidden address/padding bytes,
//! registers that must survive the chain, and memory-dereference safety.
//! When compilation fails, the engine hands back a [`FailRecord`] the
//! caller can use to decide which constraint to relax.

use crate::arch::Arch;
use crate::expr::RegId;
use crate::gadget::{Gadget, GadgetId, RegSet};
use serde::Serialize;
use std::collections::BTreeMap;

/// Bytes that must not appear in any chain address or padding.
#[derive(Debug, Clone, Default)]
pub struct BadBytes {
    bad: Vec<u8>,
}

impl BadBytes {
    pub fn add(&mut self, byte: u8) {
        if !self.bad.contains(&byte) {
            self.bad.push(byte);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bad.is_empty()
    }

    pub fn is_valid_byte(&self, byte: u8) -> bool {
        !self.bad.contains(&byte)
    }

    /// Some byte outside the bad set, highest first.
    pub fn valid_byte(&self) -> Option<u8> {
        (0..=0xffu8).rev().find(|b| self.is_valid_byte(*b))
    }

    /// A word-sized padding value made of one valid byte.
    pub fn valid_padding(&self, octets: u64) -> Option<u64> {
        let byte = u64::from(self.valid_byte()?);
        let mut v = 0u64;
        for _ in 0..octets {
            v = (v << 8) | byte;
        }
        Some(v)
    }

    /// True when every encoded byte of `value` is allowed.
    pub fn is_valid_word(&self, value: u64, octets: u64) -> bool {
        let bytes = value.to_le_bytes();
        let slice = &bytes[..octets as usize];
        self.bad.iter().all(|&b| memchr::memchr(b, slice).is_none())
    }

    /// First address of the gadget whose bytes are all allowed.
    pub fn valid_address_of(&self, gadget: &Gadget, octets: u64) -> Option<u64> {
        gadget
            .addresses
            .iter()
            .copied()
            .find(|&a| self.is_valid_word(a, octets))
    }

    /// True when some usable address exists for the gadget.
    pub fn check(&self, gadget: &Gadget, octets: u64) -> bool {
        self.valid_address_of(gadget, octets).is_some()
    }
}

/// Registers the chain must not modify.
#[derive(Debug, Clone, Default)]
pub struct KeepRegs {
    keep: RegSet,
}

impl KeepRegs {
    pub fn add(&mut self, reg: RegId) {
        self.keep.insert(reg);
    }

    pub fn contains(&self, reg: RegId) -> bool {
        self.keep.contains(reg)
    }

    pub fn is_empty(&self) -> bool {
        self.keep.is_empty()
    }

    /// True when the gadget leaves every kept register alone.
    pub fn check(&self, gadget: &Gadget) -> bool {
        !gadget.modified_regs.intersects(&self.keep)
    }

    pub fn violations(&self, gadget: &Gadget) -> RegSet {
        gadget
            .modified_regs
            .iter()
            .filter(|r| self.keep.contains(*r))
            .collect()
    }
}

/// Memory-dereference safety policy.
#[derive(Debug, Clone, Default)]
pub struct MemSafety {
    /// When set, a gadget may only dereference registers from the safe
    /// set.
    pub enforced: bool,
    safe: RegSet,
}

impl MemSafety {
    pub fn add_safe_reg(&mut self, reg: RegId) {
        self.safe.insert(reg);
    }

    pub fn check(&self, gadget: &Gadget, arch: &Arch) -> bool {
        if !self.enforced {
            return true;
        }
        gadget
            .dereferenced_regs
            .iter()
            // The stack pointer is always a valid pointer in a ROP
            // context.
            .all(|r| r == arch.sp() || self.safe.contains(r))
    }
}

/// The full user constraint object.
#[derive(Debug, Clone, Default)]
pub struct Constraint {
    pub bad_bytes: BadBytes,
    pub keep_regs: KeepRegs,
    pub mem_safety: MemSafety,
}

impl Constraint {
    pub fn new() -> Self {
        Constraint::default()
    }

    /// Whole-constraint check for one gadget.
    pub fn check(&self, gadget: &Gadget, arch: &Arch) -> bool {
        self.bad_bytes.check(gadget, arch.octets())
            && self.keep_regs.check(gadget)
            && self.mem_safety.check(gadget, arch)
    }
}

/// Why the most recent compile attempt failed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FailRecord {
    /// A graph exceeded the rewrite depth/width budget.
    pub max_len: bool,
    /// Registers the engine would have had to modify but could not
    /// (kept registers).
    pub modified_regs: RegSet,
    /// Bad byte → a gadget id that would have been selected had that
    /// byte been permitted.
    pub bad_bytes: BTreeMap<u8, GadgetId>,
}

impl FailRecord {
    pub fn record_keep_fail(&mut self, keep: &KeepRegs, gadget: &Gadget) {
        for r in keep.violations(gadget).iter() {
            self.modified_regs.insert(r);
        }
    }

    pub fn record_bad_byte_fail(&mut self, bad: &BadBytes, gadget: &Gadget, octets: u64) {
        for &addr in &gadget.addresses {
            for (i, b) in addr.to_le_bytes().iter().enumerate() {
                if i as u64 >= octets {
                    break;
                }
                if !bad.is_valid_byte(*b) {
                    self.bad_bytes.entry(*b).or_insert(gadget.id);
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.max_len && self.modified_regs.is_empty() && self.bad_bytes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::decode::BuiltinDecoder;
    use crate::arch::{reg, ArchKind};
    use crate::gadget::{analyse_raw, RawGadget};

    fn gadget(arch: &Arch, addr: u64, bytes: &[u8]) -> Gadget {
        analyse_raw(
            arch,
            &BuiltinDecoder,
            &RawGadget { addr, bytes: bytes.to_vec(), bin_num: 0 },
        )
        .unwrap()
    }

    #[test]
    fn test_bad_bytes_address_filter() {
        let arch = Arch::new(ArchKind::X64);
        let mut g = gadget(&arch, 0x400000, &[0x5f, 0xc3]); // pop rdi; ret
        g.addresses.push(0x400a0b);
        let mut bad = BadBytes::default();
        bad.add(0x00);
        // 0x400000 has zero bytes beyond the low ones... both addresses
        // contain 0x00 in their high bytes on 64-bit words.
        assert!(!bad.is_valid_word(0x400000, 8));
        assert!(bad.is_valid_word(0x0102030405060708, 8));
        assert_eq!(bad.valid_byte(), Some(0xff));
        assert_eq!(bad.valid_padding(8), Some(0xffff_ffff_ffff_ffff));
    }

    #[test]
    fn test_keep_regs() {
        let arch = Arch::new(ArchKind::X64);
        // pop rax; pop rbx; ret
        let g = gadget(&arch, 0x400000, &[0x58, 0x5b, 0xc3]);
        let mut keep = KeepRegs::default();
        keep.add(reg::BX);
        assert!(!keep.check(&g));
        assert!(keep.violations(&g).contains(reg::BX));

        let g2 = gadget(&arch, 0x400010, &[0x58, 0xc3]);
        assert!(keep.check(&g2));
    }

    #[test]
    fn test_mem_safety() {
        let arch = Arch::new(ArchKind::X64);
        // mov rax, [rdi+0x10]; ret dereferences rdi.
        let g = gadget(&arch, 0x400000, &[0x48, 0x8b, 0x47, 0x10, 0xc3]);
        let mut ms = MemSafety::default();
        assert!(ms.check(&g, &arch));
        ms.enforced = true;
        assert!(!ms.check(&g, &arch));
        ms.add_safe_reg(reg::DI);
        assert!(ms.check(&g, &arch));
        // SP dereferences (pop) stay allowed under enforcement.
        let pop = gadget(&arch, 0x400010, &[0x58, 0xc3]);
        assert!(ms.check(&pop, &arch));
    }

    #[test]
    fn test_fail_record() {
        let arch = Arch::new(ArchKind::X64);
        let g = gadget(&arch, 0x400000, &[0x58, 0x5b, 0xc3]);
        let mut keep = KeepRegs::default();
        keep.add(reg::BX);
        let mut rec = FailRecord::default();
        rec.record_keep_fail(&keep, &g);
        assert!(rec.modified_regs.contains(reg::BX));
        assert!(!rec.modified_regs.contains(reg::AX));

        let mut bad = BadBytes::default();
        bad.add(0x40);
        rec.record_bad_byte_fail(&bad, &g, 8);
        assert_eq!(rec.bad_bytes.get(&0x40), Some(&g.id));
    }
}
