//! Emitted ROP chains and their dump formats.
//!
//! A chain is an ordered list of word-sized items: gadget addresses,
//! stack paddings, and plain constants, each with a comment carried from
//! the IL for pretty-printing. Three dump formats exist: `pretty` for
//! humans, `code` for pasting into an exploit script, and `raw` bytes.

use crate::arch::{Arch, ArchKind};
use crate::constraint::Constraint;
use crate::gadget::GadgetId;
use byteorder::{ByteOrder, LittleEndian};
use serde::Serialize;
use std::fmt::Write as _;

/// One word-sized chain entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChainItem {
    /// Address of a selected gadget.
    GadgetAddress {
        addr: u64,
        gadget: GadgetId,
        comment: String,
    },
    /// Stack filler consumed by a gadget's sp increment.
    Padding { value: u64, comment: String },
    /// A constant the chain feeds to the target (function argument,
    /// stored literal chunk).
    Constant { value: u64, comment: String },
}

impl ChainItem {
    /// The word value this item contributes to the stack.
    pub fn value(&self) -> u64 {
        match self {
            ChainItem::GadgetAddress { addr, .. } => *addr,
            ChainItem::Padding { value, .. } | ChainItem::Constant { value, .. } => *value,
        }
    }

    pub fn comment(&self) -> &str {
        match self {
            ChainItem::GadgetAddress { comment, .. }
            | ChainItem::Padding { comment, .. }
            | ChainItem::Constant { comment, .. } => comment,
        }
    }
}

/// An emitted ROP chain.
#[derive(Debug, Clone, Serialize)]
pub struct RopChain {
    /// Architecture the chain targets.
    pub arch: ArchKind,
    pub items: Vec<ChainItem>,
}

impl RopChain {
    pub fn new(arch: &Arch) -> Self {
        RopChain {
            arch: arch.kind(),
            items: Vec::new(),
        }
    }

    fn word_bytes(&self) -> usize {
        match self.arch {
            ArchKind::X86 => 4,
            ArchKind::X64 => 8,
        }
    }

    /// Number of machine-word entries.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn push_gadget(&mut self, addr: u64, gadget: GadgetId, comment: impl Into<String>) {
        self.items.push(ChainItem::GadgetAddress {
            addr,
            gadget,
            comment: comment.into(),
        });
    }

    pub fn push_padding(&mut self, value: u64, comment: impl Into<String>) {
        self.items.push(ChainItem::Padding {
            value,
            comment: comment.into(),
        });
    }

    pub fn push_constant(&mut self, value: u64, comment: impl Into<String>) {
        self.items.push(ChainItem::Constant {
            value,
            comment: comment.into(),
        });
    }

    /// Append another chain's items.
    pub fn extend(&mut self, other: RopChain) {
        self.items.extend(other.items);
    }

    /// The item words in order.
    pub fn words(&self) -> Vec<u64> {
        self.items.iter().map(ChainItem::value).collect()
    }

    /// One line per item, hex at the word width, comment at the end.
    pub fn dump_pretty(&self) -> String {
        let width = self.word_bytes() * 2;
        let mut out = String::new();
        for item in &self.items {
            let tag = match item {
                ChainItem::GadgetAddress { .. } => "",
                ChainItem::Padding { .. } => " (padding)",
                ChainItem::Constant { .. } => " (constant)",
            };
            let _ = writeln!(
                out,
                "0x{value:0width$x}{tag} # {comment}",
                value = item.value(),
                comment = item.comment(),
            );
        }
        out
    }

    /// Paste-friendly packed byte literals, one item per line.
    pub fn dump_code(&self) -> String {
        let mut out = String::from("chain = b\"\"\n");
        for item in &self.items {
            let mut line = String::from("chain += b\"");
            for b in self.encode_word(item.value()) {
                let _ = write!(line, "\\x{b:02x}");
            }
            let _ = writeln!(out, "{line}\"  # {}", item.comment());
        }
        out
    }

    /// Items concatenated in architecture endianness.
    pub fn dump_raw(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.items.len() * self.word_bytes());
        for item in &self.items {
            out.extend_from_slice(&self.encode_word(item.value()));
        }
        out
    }

    // Both supported ISAs are little-endian.
    fn encode_word(&self, value: u64) -> Vec<u8> {
        let mut buf = vec![0u8; self.word_bytes()];
        match self.arch {
            ArchKind::X86 => LittleEndian::write_u32(&mut buf, value as u32),
            ArchKind::X64 => LittleEndian::write_u64(&mut buf, value),
        }
        buf
    }

    /// Re-parse a raw dump into its word sequence.
    pub fn words_from_raw(arch: ArchKind, bytes: &[u8]) -> Vec<u64> {
        let n = match arch {
            ArchKind::X86 => 4,
            ArchKind::X64 => 8,
        };
        bytes
            .chunks_exact(n)
            .map(|c| match arch {
                ArchKind::X86 => u64::from(LittleEndian::read_u32(c)),
                ArchKind::X64 => LittleEndian::read_u64(c),
            })
            .collect()
    }

    /// Constraint check over the finished chain: no gadget address or
    /// padding word may contain a bad byte. Plain constants are user
    /// data and exempt.
    pub fn validate(&self, constraint: &Constraint) -> bool {
        let octets = self.word_bytes() as u64;
        self.items.iter().all(|i| match i {
            ChainItem::Constant { .. } => true,
            _ => constraint.bad_bytes.is_valid_word(i.value(), octets),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::ArchKind;

    fn sample() -> RopChain {
        let mut chain = RopChain {
            arch: ArchKind::X64,
            items: Vec::new(),
        };
        chain.push_gadget(0x400410, 0, "pop rax; ret (0x400410)");
        chain.push_padding(0x4142434445464748, "rax value");
        chain
    }

    #[test]
    fn test_words_and_len() {
        let chain = sample();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.words(), vec![0x400410, 0x4142434445464748]);
    }

    #[test]
    fn test_pretty_dump() {
        let chain = sample();
        let text = chain.dump_pretty();
        assert!(text.contains("0x0000000000400410"));
        assert!(text.contains("# pop rax; ret"));
        assert!(text.contains("(padding)"));
    }

    #[test]
    fn test_code_dump() {
        let chain = sample();
        let text = chain.dump_code();
        assert!(text.contains("\\x10\\x04\\x40\\x00"));
        assert!(text.contains("\\x48\\x47\\x46\\x45"));
    }

    #[test]
    fn test_raw_roundtrip() {
        let chain = sample();
        let raw = chain.dump_raw();
        assert_eq!(raw.len(), 16);
        let words = RopChain::words_from_raw(ArchKind::X64, &raw);
        assert_eq!(words, chain.words());
    }

    #[test]
    fn test_x86_word_width() {
        let mut chain = RopChain {
            arch: ArchKind::X86,
            items: Vec::new(),
        };
        chain.push_gadget(0x08048100, 0, "g");
        assert_eq!(chain.dump_raw(), vec![0x00, 0x81, 0x04, 0x08]);
        assert!(chain.dump_pretty().contains("0x08048100"));
    }

    #[test]
    fn test_validate_bad_bytes() {
        let chain = sample();
        let mut constraint = Constraint::new();
        assert!(chain.validate(&constraint));
        constraint.bad_bytes.add(0x47);
        assert!(!chain.validate(&constraint));
    }
}
