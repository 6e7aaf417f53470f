//! Architecture context.
//!
//! An [`Arch`] value carries everything the rest of the compiler needs to
//! know about the target: register file, word size, stack pointer,
//! program counter, and which registers are CPU flags. It is passed
//! explicitly wherever needed; the crate has no process-wide current
//! architecture.

pub mod decode;
pub mod lift;

use crate::expr::{RegId, Width};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Supported instruction set architectures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchKind {
    /// 32-bit x86 (i386).
    X86,
    /// 64-bit x86-64 (AMD64).
    X64,
}

/// General-purpose register ids, shared across both architectures.
///
/// On X86 the ids map to the E-registers and only `0..=8` plus the flags
/// are valid; on X64 the full set applies.
pub mod reg {
    use crate::expr::RegId;

    pub const AX: RegId = 0;
    pub const BX: RegId = 1;
    pub const CX: RegId = 2;
    pub const DX: RegId = 3;
    pub const SI: RegId = 4;
    pub const DI: RegId = 5;
    pub const SP: RegId = 6;
    pub const BP: RegId = 7;
    pub const R8: RegId = 8;
    pub const R9: RegId = 9;
    pub const R10: RegId = 10;
    pub const R11: RegId = 11;
    pub const R12: RegId = 12;
    pub const R13: RegId = 13;
    pub const R14: RegId = 14;
    pub const R15: RegId = 15;
    pub const IP: RegId = 16;
    pub const CF: RegId = 17;
    pub const PF: RegId = 18;
    pub const AF: RegId = 19;
    pub const ZF: RegId = 20;
    pub const SF: RegId = 21;
    pub const TF: RegId = 22;
    pub const IF: RegId = 23;
    pub const DF: RegId = 24;
    pub const OF: RegId = 25;

    /// Total register slots, both architectures.
    pub const COUNT: usize = 26;
}

/// Architecture context object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arch {
    kind: ArchKind,
}

impl Arch {
    /// Build the context for one architecture.
    pub fn new(kind: ArchKind) -> Self {
        Arch { kind }
    }

    /// Which architecture this is.
    pub fn kind(&self) -> ArchKind {
        self.kind
    }

    /// Register width in bits.
    pub fn bits(&self) -> Width {
        match self.kind {
            ArchKind::X86 => 32,
            ArchKind::X64 => 64,
        }
    }

    /// Machine word size in bytes.
    pub fn octets(&self) -> u64 {
        u64::from(self.bits()) / 8
    }

    /// Number of register slots (GPRs + IP + flags).
    pub fn nb_regs(&self) -> usize {
        reg::COUNT
    }

    /// Stack pointer register.
    pub fn sp(&self) -> RegId {
        reg::SP
    }

    /// Program counter register.
    pub fn pc(&self) -> RegId {
        reg::IP
    }

    /// True for the CPU flag registers.
    pub fn is_flag(&self, r: RegId) -> bool {
        (reg::CF..=reg::OF).contains(&r)
    }

    /// Registers the executor may treat as dead sinks (the flags).
    pub fn ignored_regs(&self) -> std::ops::RangeInclusive<RegId> {
        reg::CF..=reg::OF
    }

    /// True if `r` is addressable as a general-purpose register here.
    pub fn is_gpr(&self, r: RegId) -> bool {
        match self.kind {
            ArchKind::X86 => r <= reg::BP,
            ArchKind::X64 => r <= reg::R15,
        }
    }

    /// Width of one flag register (modelled as a single bit).
    pub fn flag_width(&self) -> Width {
        1
    }

    /// Architectural name of a register.
    pub fn reg_name(&self, r: RegId) -> &'static str {
        match self.kind {
            ArchKind::X86 => match r {
                reg::AX => "eax",
                reg::BX => "ebx",
                reg::CX => "ecx",
                reg::DX => "edx",
                reg::SI => "esi",
                reg::DI => "edi",
                reg::SP => "esp",
                reg::BP => "ebp",
                reg::IP => "eip",
                _ => flag_name(r),
            },
            ArchKind::X64 => match r {
                reg::AX => "rax",
                reg::BX => "rbx",
                reg::CX => "rcx",
                reg::DX => "rdx",
                reg::SI => "rsi",
                reg::DI => "rdi",
                reg::SP => "rsp",
                reg::BP => "rbp",
                reg::R8 => "r8",
                reg::R9 => "r9",
                reg::R10 => "r10",
                reg::R11 => "r11",
                reg::R12 => "r12",
                reg::R13 => "r13",
                reg::R14 => "r14",
                reg::R15 => "r15",
                reg::IP => "rip",
                _ => flag_name(r),
            },
        }
    }

    /// Parse an architectural register name. The 32-bit aliases of the
    /// x64 registers (`eax` for the low half of `rax`) resolve to the
    /// same id; callers that care about sub-register widths use the
    /// decoder's operand widths instead.
    pub fn reg_from_name(&self, name: &str) -> Option<RegId> {
        let lower = name.to_ascii_lowercase();
        let gpr = |s: &str| -> Option<RegId> {
            Some(match s {
                "ax" => reg::AX,
                "bx" => reg::BX,
                "cx" => reg::CX,
                "dx" => reg::DX,
                "si" => reg::SI,
                "di" => reg::DI,
                "sp" => reg::SP,
                "bp" => reg::BP,
                "ip" => reg::IP,
                _ => return None,
            })
        };
        match self.kind {
            ArchKind::X86 => lower.strip_prefix('e').and_then(gpr),
            ArchKind::X64 => {
                if let Some(rest) = lower.strip_prefix('r') {
                    if let Some(id) = gpr(rest) {
                        return Some(id);
                    }
                    if let Ok(n) = rest.parse::<u16>() {
                        if (8..=15).contains(&n) {
                            return Some(n);
                        }
                    }
                    None
                } else {
                    // 32-bit alias of the low half.
                    lower.strip_prefix('e').and_then(gpr)
                }
            }
        }
    }

    /// ModRM register-field encoding (0..=7, plus REX extension on X64)
    /// to our register id.
    pub fn reg_from_encoding(&self, code: u8) -> Option<RegId> {
        let base = match code & 0x7 {
            0 => reg::AX,
            1 => reg::CX,
            2 => reg::DX,
            3 => reg::BX,
            4 => reg::SP,
            5 => reg::BP,
            6 => reg::SI,
            7 => reg::DI,
            _ => unreachable!(),
        };
        if code < 8 {
            Some(base)
        } else if self.kind == ArchKind::X64 && code < 16 {
            Some(reg::R8 + RegId::from(code - 8))
        } else {
            None
        }
    }
}

fn flag_name(r: RegId) -> &'static str {
    match r {
        reg::CF => "cf",
        reg::PF => "pf",
        reg::AF => "af",
        reg::ZF => "zf",
        reg::SF => "sf",
        reg::TF => "tf",
        reg::IF => "if",
        reg::DF => "df",
        reg::OF => "of",
        _ => "?",
    }
}

impl fmt::Display for ArchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArchKind::X86 => write!(f, "x86"),
            ArchKind::X64 => write!(f, "x64"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_sizes() {
        assert_eq!(Arch::new(ArchKind::X86).octets(), 4);
        assert_eq!(Arch::new(ArchKind::X64).octets(), 8);
        assert_eq!(Arch::new(ArchKind::X64).bits(), 64);
    }

    #[test]
    fn test_reg_names_roundtrip() {
        let x64 = Arch::new(ArchKind::X64);
        for r in 0..=reg::IP {
            let name = x64.reg_name(r);
            assert_eq!(x64.reg_from_name(name), Some(r), "{name}");
        }
        let x86 = Arch::new(ArchKind::X86);
        for r in 0..=reg::BP {
            let name = x86.reg_name(r);
            assert_eq!(x86.reg_from_name(name), Some(r), "{name}");
        }
    }

    #[test]
    fn test_x64_low_half_alias() {
        let x64 = Arch::new(ArchKind::X64);
        assert_eq!(x64.reg_from_name("eax"), Some(reg::AX));
        assert_eq!(x64.reg_from_name("rax"), Some(reg::AX));
    }

    #[test]
    fn test_unknown_names() {
        let x86 = Arch::new(ArchKind::X86);
        assert_eq!(x86.reg_from_name("rax"), None);
        assert_eq!(x86.reg_from_name("r8"), None);
        assert_eq!(x86.reg_from_name("xyz"), None);
    }

    #[test]
    fn test_modrm_encoding() {
        let x64 = Arch::new(ArchKind::X64);
        assert_eq!(x64.reg_from_encoding(0), Some(reg::AX));
        assert_eq!(x64.reg_from_encoding(4), Some(reg::SP));
        assert_eq!(x64.reg_from_encoding(12), Some(reg::R12));
        let x86 = Arch::new(ArchKind::X86);
        assert_eq!(x86.reg_from_encoding(9), None);
    }

    #[test]
    fn test_flags() {
        let a = Arch::new(ArchKind::X64);
        assert!(a.is_flag(reg::ZF));
        assert!(!a.is_flag(reg::AX));
        assert!(a.ignored_regs().contains(&reg::OF));
    }
}
