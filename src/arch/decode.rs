//! Built-in x86/x86-64 instruction decoder.
//!
//! Decoding is an external-collaborator contract ([`Decode`]): per
//! instruction it yields a mnemonic plus typed operands with register
//! ids, immediates, and base+displacement memory references. The
//! [`BuiltinDecoder`] implements the subset that actually occurs in
//! usable gadgets; anything outside it returns an error and the gadget
//! is dropped by the analyser.

use super::{Arch, ArchKind};
use crate::expr::{RegId, Width};
use bitflags::bitflags;
use byteorder::{ByteOrder, LittleEndian};
use std::fmt;

bitflags! {
    /// Instruction prefixes recognised by the decoder.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Prefixes: u8 {
        const REX   = 0b0000_0001;
        const REX_W = 0b0000_0010;
        const REX_R = 0b0000_0100;
        const REX_X = 0b0000_1000;
        const REX_B = 0b0001_0000;
    }
}

/// x86 condition codes, by encoding nibble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CondCode {
    O,
    No,
    B,
    Ae,
    E,
    Ne,
    Be,
    A,
    S,
    Ns,
    P,
    Np,
    L,
    Ge,
    Le,
    G,
}

impl CondCode {
    fn from_nibble(n: u8) -> CondCode {
        match n & 0xf {
            0x0 => CondCode::O,
            0x1 => CondCode::No,
            0x2 => CondCode::B,
            0x3 => CondCode::Ae,
            0x4 => CondCode::E,
            0x5 => CondCode::Ne,
            0x6 => CondCode::Be,
            0x7 => CondCode::A,
            0x8 => CondCode::S,
            0x9 => CondCode::Ns,
            0xa => CondCode::P,
            0xb => CondCode::Np,
            0xc => CondCode::L,
            0xd => CondCode::Ge,
            0xe => CondCode::Le,
            _ => CondCode::G,
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            CondCode::O => "o",
            CondCode::No => "no",
            CondCode::B => "b",
            CondCode::Ae => "ae",
            CondCode::E => "e",
            CondCode::Ne => "ne",
            CondCode::Be => "be",
            CondCode::A => "a",
            CondCode::S => "s",
            CondCode::Ns => "ns",
            CondCode::P => "p",
            CondCode::Np => "np",
            CondCode::L => "l",
            CondCode::Ge => "ge",
            CondCode::Le => "le",
            CondCode::G => "g",
        }
    }
}

/// Decoded mnemonics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mnemonic {
    Mov,
    Lea,
    Add,
    Sub,
    And,
    Or,
    Xor,
    Cmp,
    Test,
    Inc,
    Dec,
    Neg,
    Not,
    Push,
    Pop,
    Xchg,
    Ret,
    Call,
    Jmp,
    Int,
    Syscall,
    Sysenter,
    Nop,
    Leave,
    Cmov(CondCode),
}

impl Mnemonic {
    /// True for instructions that terminate a gadget block.
    pub fn is_terminator(self) -> bool {
        matches!(
            self,
            Mnemonic::Ret
                | Mnemonic::Call
                | Mnemonic::Jmp
                | Mnemonic::Int
                | Mnemonic::Syscall
                | Mnemonic::Sysenter
        )
    }
}

/// A decoded operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    /// Register with its access width (32-bit accesses to 64-bit
    /// registers keep the register id and a 32-bit width).
    Reg { reg: RegId, width: Width },
    /// Immediate, sign-extended into an `i64`.
    Imm { value: i64, width: Width },
    /// Memory reference `[base + disp]` with the access width.
    Mem {
        base: Option<RegId>,
        disp: i64,
        width: Width,
    },
}

impl Operand {
    pub fn width(&self) -> Width {
        match self {
            Operand::Reg { width, .. }
            | Operand::Imm { width, .. }
            | Operand::Mem { width, .. } => *width,
        }
    }
}

/// One decoded machine instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedInstr {
    pub mnemonic: Mnemonic,
    pub operands: Vec<Operand>,
    /// Encoded length in bytes.
    pub len: usize,
    /// Human-readable form, e.g. `pop rax`.
    pub text: String,
}

/// Decode failure; the gadget containing the instruction is dropped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("unsupported opcode 0x{opcode:02x} at offset {offset}")]
    Unsupported { opcode: u8, offset: usize },
    #[error("truncated instruction at offset {offset}")]
    Truncated { offset: usize },
    #[error("no terminating branch in gadget bytes")]
    NoTerminator,
    #[error("trailing bytes after the terminating branch")]
    TrailingBytes,
}

/// Instruction decoding contract.
pub trait Decode {
    /// Decode the instruction at the start of `code`.
    fn decode_one(&self, arch: &Arch, code: &[u8]) -> Result<DecodedInstr, DecodeError>;
}

/// The built-in decoder for the gadget-relevant x86/x64 subset.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinDecoder;

/// Decode a whole gadget: instructions up to and including the first
/// terminator. Trailing bytes or a missing terminator fail the gadget.
pub fn decode_gadget(
    decoder: &dyn Decode,
    arch: &Arch,
    bytes: &[u8],
) -> Result<Vec<DecodedInstr>, DecodeError> {
    let mut out = Vec::new();
    let mut offset = 0;
    while offset < bytes.len() {
        let instr = decoder.decode_one(arch, &bytes[offset..]).map_err(|e| {
            // Re-anchor offsets to the start of the gadget.
            match e {
                DecodeError::Unsupported { opcode, offset: o } => DecodeError::Unsupported {
                    opcode,
                    offset: offset + o,
                },
                DecodeError::Truncated { offset: o } => {
                    DecodeError::Truncated { offset: offset + o }
                }
                other => other,
            }
        })?;
        offset += instr.len;
        let terminator = instr.mnemonic.is_terminator();
        out.push(instr);
        if terminator {
            if offset != bytes.len() {
                return Err(DecodeError::TrailingBytes);
            }
            return Ok(out);
        }
    }
    Err(DecodeError::NoTerminator)
}

struct Cursor<'a> {
    code: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn u8(&mut self) -> Result<u8, DecodeError> {
        let b = *self
            .code
            .get(self.pos)
            .ok_or(DecodeError::Truncated { offset: self.pos })?;
        self.pos += 1;
        Ok(b)
    }

    fn i8(&mut self) -> Result<i64, DecodeError> {
        Ok(self.u8()? as i8 as i64)
    }

    fn u16(&mut self) -> Result<u64, DecodeError> {
        if self.pos + 2 > self.code.len() {
            return Err(DecodeError::Truncated { offset: self.pos });
        }
        let v = LittleEndian::read_u16(&self.code[self.pos..]);
        self.pos += 2;
        Ok(u64::from(v))
    }

    fn i32(&mut self) -> Result<i64, DecodeError> {
        if self.pos + 4 > self.code.len() {
            return Err(DecodeError::Truncated { offset: self.pos });
        }
        let v = LittleEndian::read_i32(&self.code[self.pos..]);
        self.pos += 4;
        Ok(i64::from(v))
    }

    fn i64(&mut self) -> Result<i64, DecodeError> {
        if self.pos + 8 > self.code.len() {
            return Err(DecodeError::Truncated { offset: self.pos });
        }
        let v = LittleEndian::read_i64(&self.code[self.pos..]);
        self.pos += 8;
        Ok(v)
    }
}

impl Decode for BuiltinDecoder {
    fn decode_one(&self, arch: &Arch, code: &[u8]) -> Result<DecodedInstr, DecodeError> {
        let mut cur = Cursor { code, pos: 0 };
        let mut prefixes = Prefixes::default();

        let mut opcode = cur.u8()?;
        // REX prefixes exist on x64 only; on x86 0x40..=0x4F are inc/dec.
        if arch.kind() == ArchKind::X64 && (0x40..=0x4f).contains(&opcode) {
            prefixes |= Prefixes::REX;
            if opcode & 0x8 != 0 {
                prefixes |= Prefixes::REX_W;
            }
            if opcode & 0x4 != 0 {
                prefixes |= Prefixes::REX_R;
            }
            if opcode & 0x2 != 0 {
                prefixes |= Prefixes::REX_X;
            }
            if opcode & 0x1 != 0 {
                prefixes |= Prefixes::REX_B;
            }
            opcode = cur.u8()?;
        }

        let op_width: Width = if prefixes.contains(Prefixes::REX_W) {
            64
        } else {
            32
        };
        let word: Width = arch.bits();

        let instr = match opcode {
            // push / pop reg
            0x50..=0x57 => {
                let r = plus_r(arch, opcode - 0x50, prefixes)?;
                mk(Mnemonic::Push, vec![reg_op(r, word)], &cur, arch)
            }
            0x58..=0x5f => {
                let r = plus_r(arch, opcode - 0x58, prefixes)?;
                mk(Mnemonic::Pop, vec![reg_op(r, word)], &cur, arch)
            }
            // push imm
            0x68 => {
                let v = cur.i32()?;
                mk(Mnemonic::Push, vec![imm_op(v, word)], &cur, arch)
            }
            0x6a => {
                let v = cur.i8()?;
                mk(Mnemonic::Push, vec![imm_op(v, word)], &cur, arch)
            }
            // binop r/m, r  and  r, r/m
            0x01 | 0x09 | 0x21 | 0x29 | 0x31 | 0x39 => {
                let m = binop_of(opcode);
                let (reg_field, rm) = modrm(arch, &mut cur, prefixes, op_width)?;
                mk(m, vec![rm, reg_op(reg_field, op_width)], &cur, arch)
            }
            0x03 | 0x0b | 0x23 | 0x2b | 0x33 | 0x3b => {
                let m = binop_of(opcode - 2);
                let (reg_field, rm) = modrm(arch, &mut cur, prefixes, op_width)?;
                mk(m, vec![reg_op(reg_field, op_width), rm], &cur, arch)
            }
            // group 1: binop r/m, imm
            0x83 | 0x81 => {
                let (digit, rm) = modrm_digit(arch, &mut cur, prefixes, op_width)?;
                let m = match digit {
                    0 => Mnemonic::Add,
                    1 => Mnemonic::Or,
                    4 => Mnemonic::And,
                    5 => Mnemonic::Sub,
                    6 => Mnemonic::Xor,
                    7 => Mnemonic::Cmp,
                    _ => {
                        return Err(DecodeError::Unsupported {
                            opcode,
                            offset: 0,
                        })
                    }
                };
                let v = if opcode == 0x83 { cur.i8()? } else { cur.i32()? };
                mk(m, vec![rm, imm_op(v, op_width)], &cur, arch)
            }
            // test r/m, r
            0x85 => {
                let (reg_field, rm) = modrm(arch, &mut cur, prefixes, op_width)?;
                mk(
                    Mnemonic::Test,
                    vec![rm, reg_op(reg_field, op_width)],
                    &cur,
                    arch,
                )
            }
            // xchg r/m, r
            0x87 => {
                let (reg_field, rm) = modrm(arch, &mut cur, prefixes, op_width)?;
                mk(
                    Mnemonic::Xchg,
                    vec![rm, reg_op(reg_field, op_width)],
                    &cur,
                    arch,
                )
            }
            // mov
            0x89 => {
                let (reg_field, rm) = modrm(arch, &mut cur, prefixes, op_width)?;
                mk(Mnemonic::Mov, vec![rm, reg_op(reg_field, op_width)], &cur, arch)
            }
            0x8b => {
                let (reg_field, rm) = modrm(arch, &mut cur, prefixes, op_width)?;
                mk(Mnemonic::Mov, vec![reg_op(reg_field, op_width), rm], &cur, arch)
            }
            // lea r, m
            0x8d => {
                let (reg_field, rm) = modrm(arch, &mut cur, prefixes, op_width)?;
                if !matches!(rm, Operand::Mem { .. }) {
                    return Err(DecodeError::Unsupported { opcode, offset: 0 });
                }
                mk(Mnemonic::Lea, vec![reg_op(reg_field, op_width), rm], &cur, arch)
            }
            // nop / xchg ax, r
            0x90 => mk(Mnemonic::Nop, vec![], &cur, arch),
            0x91..=0x97 => {
                let r = plus_r(arch, opcode - 0x90, prefixes)?;
                mk(
                    Mnemonic::Xchg,
                    vec![
                        reg_op(super::reg::AX, op_width),
                        reg_op(r, op_width),
                    ],
                    &cur,
                    arch,
                )
            }
            // mov r, imm
            0xb8..=0xbf => {
                let r = plus_r(arch, opcode - 0xb8, prefixes)?;
                let (v, w) = if prefixes.contains(Prefixes::REX_W) {
                    (cur.i64()?, 64)
                } else {
                    (cur.i32()?, op_width)
                };
                mk(Mnemonic::Mov, vec![reg_op(r, w), imm_op(v, w)], &cur, arch)
            }
            // ret / ret imm16
            0xc2 => {
                let n = cur.u16()?;
                mk(
                    Mnemonic::Ret,
                    vec![imm_op(n as i64, 16)],
                    &cur,
                    arch,
                )
            }
            0xc3 => mk(Mnemonic::Ret, vec![], &cur, arch),
            // mov r/m, imm32
            0xc7 => {
                let (digit, rm) = modrm_digit(arch, &mut cur, prefixes, op_width)?;
                if digit != 0 {
                    return Err(DecodeError::Unsupported { opcode, offset: 0 });
                }
                let v = cur.i32()?;
                mk(Mnemonic::Mov, vec![rm, imm_op(v, op_width)], &cur, arch)
            }
            // leave
            0xc9 => mk(Mnemonic::Leave, vec![], &cur, arch),
            // int imm8
            0xcd => {
                let v = cur.u8()?;
                mk(Mnemonic::Int, vec![imm_op(i64::from(v), 8)], &cur, arch)
            }
            // group 3
            0xf7 => {
                let (digit, rm) = modrm_digit(arch, &mut cur, prefixes, op_width)?;
                let m = match digit {
                    2 => Mnemonic::Not,
                    3 => Mnemonic::Neg,
                    _ => {
                        return Err(DecodeError::Unsupported { opcode, offset: 0 })
                    }
                };
                mk(m, vec![rm], &cur, arch)
            }
            // group 5
            0xff => {
                let (digit, rm) = modrm_digit(arch, &mut cur, prefixes, op_width)?;
                match digit {
                    0 => mk(Mnemonic::Inc, vec![rm], &cur, arch),
                    1 => mk(Mnemonic::Dec, vec![rm], &cur, arch),
                    2 => match rm {
                        Operand::Reg { reg, .. } => {
                            mk(Mnemonic::Call, vec![reg_op(reg, word)], &cur, arch)
                        }
                        _ => return Err(DecodeError::Unsupported { opcode, offset: 0 }),
                    },
                    4 => match rm {
                        Operand::Reg { reg, .. } => {
                            mk(Mnemonic::Jmp, vec![reg_op(reg, word)], &cur, arch)
                        }
                        _ => return Err(DecodeError::Unsupported { opcode, offset: 0 }),
                    },
                    6 => match rm {
                        Operand::Reg { reg, .. } => {
                            mk(Mnemonic::Push, vec![reg_op(reg, word)], &cur, arch)
                        }
                        _ => return Err(DecodeError::Unsupported { opcode, offset: 0 }),
                    },
                    _ => return Err(DecodeError::Unsupported { opcode, offset: 0 }),
                }
            }
            // inc/dec r (x86 only; on x64 these were eaten as REX)
            0x40..=0x47 => {
                let r = plus_r(arch, opcode - 0x40, prefixes)?;
                mk(Mnemonic::Inc, vec![reg_op(r, 32)], &cur, arch)
            }
            0x48..=0x4f => {
                let r = plus_r(arch, opcode - 0x48, prefixes)?;
                mk(Mnemonic::Dec, vec![reg_op(r, 32)], &cur, arch)
            }
            // two-byte escape
            0x0f => {
                let second = cur.u8()?;
                match second {
                    0x05 => {
                        if arch.kind() != ArchKind::X64 {
                            return Err(DecodeError::Unsupported {
                                opcode: second,
                                offset: 1,
                            });
                        }
                        mk(Mnemonic::Syscall, vec![], &cur, arch)
                    }
                    0x34 => mk(Mnemonic::Sysenter, vec![], &cur, arch),
                    0x1f => {
                        // Multi-byte NOP consumes a ModRM form.
                        let (_, _) = modrm_digit(arch, &mut cur, prefixes, op_width)?;
                        mk(Mnemonic::Nop, vec![], &cur, arch)
                    }
                    0x40..=0x4f => {
                        let cc = CondCode::from_nibble(second);
                        let (reg_field, rm) = modrm(arch, &mut cur, prefixes, op_width)?;
                        mk(
                            Mnemonic::Cmov(cc),
                            vec![reg_op(reg_field, op_width), rm],
                            &cur,
                            arch,
                        )
                    }
                    _ => {
                        return Err(DecodeError::Unsupported {
                            opcode: second,
                            offset: 1,
                        })
                    }
                }
            }
            _ => return Err(DecodeError::Unsupported { opcode, offset: 0 }),
        };
        instr
    }
}

fn binop_of(opcode: u8) -> Mnemonic {
    match opcode {
        0x01 => Mnemonic::Add,
        0x09 => Mnemonic::Or,
        0x21 => Mnemonic::And,
        0x29 => Mnemonic::Sub,
        0x31 => Mnemonic::Xor,
        0x39 => Mnemonic::Cmp,
        _ => unreachable!(),
    }
}

fn plus_r(arch: &Arch, low: u8, prefixes: Prefixes) -> Result<RegId, DecodeError> {
    let code = low + if prefixes.contains(Prefixes::REX_B) { 8 } else { 0 };
    arch.reg_from_encoding(code)
        .ok_or(DecodeError::Unsupported { opcode: low, offset: 0 })
}

fn reg_op(reg: RegId, width: Width) -> Operand {
    Operand::Reg { reg, width }
}

fn imm_op(value: i64, width: Width) -> Operand {
    Operand::Imm { value, width }
}

/// Parse a ModRM byte; returns the register-field id and the r/m operand.
fn modrm(
    arch: &Arch,
    cur: &mut Cursor<'_>,
    prefixes: Prefixes,
    width: Width,
) -> Result<(RegId, Operand), DecodeError> {
    let (reg_code, rm) = modrm_inner(arch, cur, prefixes, width)?;
    let reg = arch
        .reg_from_encoding(reg_code)
        .ok_or(DecodeError::Unsupported { opcode: 0, offset: cur.pos })?;
    Ok((reg, rm))
}

/// Parse a ModRM byte where the register field is an opcode digit.
fn modrm_digit(
    arch: &Arch,
    cur: &mut Cursor<'_>,
    prefixes: Prefixes,
    width: Width,
) -> Result<(u8, Operand), DecodeError> {
    let (reg_code, rm) = modrm_inner(arch, cur, prefixes, width)?;
    Ok((reg_code & 0x7, rm))
}

fn modrm_inner(
    arch: &Arch,
    cur: &mut Cursor<'_>,
    prefixes: Prefixes,
    width: Width,
) -> Result<(u8, Operand), DecodeError> {
    let byte = cur.u8()?;
    let mode = byte >> 6;
    let mut reg_code = (byte >> 3) & 0x7;
    let mut rm_code = byte & 0x7;
    if prefixes.contains(Prefixes::REX_R) {
        reg_code += 8;
    }

    if mode == 3 {
        if prefixes.contains(Prefixes::REX_B) {
            rm_code += 8;
        }
        let reg = arch
            .reg_from_encoding(rm_code)
            .ok_or(DecodeError::Unsupported { opcode: byte, offset: cur.pos })?;
        return Ok((reg_code, Operand::Reg { reg, width }));
    }

    // Memory forms. SIB only in its index-less shape.
    let base: Option<RegId>;
    if rm_code == 4 {
        let sib = cur.u8()?;
        let index = (sib >> 3) & 0x7;
        let has_rex_index = prefixes.contains(Prefixes::REX_X);
        if index != 4 || has_rex_index {
            return Err(DecodeError::Unsupported { opcode: sib, offset: cur.pos });
        }
        let mut base_code = sib & 0x7;
        if prefixes.contains(Prefixes::REX_B) {
            base_code += 8;
        }
        if mode == 0 && (base_code & 0x7) == 5 {
            // disp32 with no base
            let disp = cur.i32()?;
            return Ok((reg_code, Operand::Mem { base: None, disp, width }));
        }
        base = Some(
            arch.reg_from_encoding(base_code)
                .ok_or(DecodeError::Unsupported { opcode: sib, offset: cur.pos })?,
        );
    } else if mode == 0 && rm_code == 5 {
        // x86: absolute disp32. x64: RIP-relative, which a gadget cannot
        // use position-independently; reject.
        if arch.kind() == ArchKind::X64 {
            return Err(DecodeError::Unsupported { opcode: byte, offset: cur.pos });
        }
        let disp = cur.i32()?;
        return Ok((reg_code, Operand::Mem { base: None, disp, width }));
    } else {
        let mut code = rm_code;
        if prefixes.contains(Prefixes::REX_B) {
            code += 8;
        }
        base = Some(
            arch.reg_from_encoding(code)
                .ok_or(DecodeError::Unsupported { opcode: byte, offset: cur.pos })?,
        );
    }

    let disp = match mode {
        0 => 0,
        1 => cur.i8()?,
        2 => cur.i32()?,
        _ => unreachable!(),
    };
    Ok((reg_code, Operand::Mem { base, disp, width }))
}

fn mk(
    mnemonic: Mnemonic,
    operands: Vec<Operand>,
    cur: &Cursor<'_>,
    arch: &Arch,
) -> Result<DecodedInstr, DecodeError> {
    let text = render(arch, mnemonic, &operands);
    Ok(DecodedInstr {
        mnemonic,
        operands,
        len: cur.pos,
        text,
    })
}

fn render(arch: &Arch, mnemonic: Mnemonic, operands: &[Operand]) -> String {
    let name = match mnemonic {
        Mnemonic::Mov => "mov".to_string(),
        Mnemonic::Lea => "lea".to_string(),
        Mnemonic::Add => "add".to_string(),
        Mnemonic::Sub => "sub".to_string(),
        Mnemonic::And => "and".to_string(),
        Mnemonic::Or => "or".to_string(),
        Mnemonic::Xor => "xor".to_string(),
        Mnemonic::Cmp => "cmp".to_string(),
        Mnemonic::Test => "test".to_string(),
        Mnemonic::Inc => "inc".to_string(),
        Mnemonic::Dec => "dec".to_string(),
        Mnemonic::Neg => "neg".to_string(),
        Mnemonic::Not => "not".to_string(),
        Mnemonic::Push => "push".to_string(),
        Mnemonic::Pop => "pop".to_string(),
        Mnemonic::Xchg => "xchg".to_string(),
        Mnemonic::Ret => "ret".to_string(),
        Mnemonic::Call => "call".to_string(),
        Mnemonic::Jmp => "jmp".to_string(),
        Mnemonic::Int => "int".to_string(),
        Mnemonic::Syscall => "syscall".to_string(),
        Mnemonic::Sysenter => "sysenter".to_string(),
        Mnemonic::Nop => "nop".to_string(),
        Mnemonic::Leave => "leave".to_string(),
        Mnemonic::Cmov(cc) => format!("cmov{}", cc.suffix()),
    };
    if operands.is_empty() {
        return name;
    }
    let rendered: Vec<String> = operands.iter().map(|o| render_op(arch, o)).collect();
    format!("{} {}", name, rendered.join(", "))
}

fn render_op(arch: &Arch, op: &Operand) -> String {
    match op {
        Operand::Reg { reg, width } => {
            let name = arch.reg_name(*reg);
            if arch.kind() == ArchKind::X64 && *width == 32 && arch.is_gpr(*reg) {
                // 32-bit alias.
                if *reg < 8 {
                    format!("e{}", &name[1..])
                } else {
                    format!("{name}d")
                }
            } else {
                name.to_string()
            }
        }
        Operand::Imm { value, .. } => {
            if *value < 0 {
                format!("-0x{:x}", -value)
            } else {
                format!("0x{value:x}")
            }
        }
        Operand::Mem { base, disp, .. } => match (base, disp) {
            (Some(b), 0) => format!("[{}]", arch.reg_name(*b)),
            (Some(b), d) if *d < 0 => format!("[{}-0x{:x}]", arch.reg_name(*b), -d),
            (Some(b), d) => format!("[{}+0x{:x}]", arch.reg_name(*b), d),
            (None, d) => format!("[0x{d:x}]"),
        },
    }
}

impl fmt::Display for DecodedInstr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::reg;

    fn x64() -> Arch {
        Arch::new(ArchKind::X64)
    }
    fn x86() -> Arch {
        Arch::new(ArchKind::X86)
    }

    #[test]
    fn test_pop_rax_ret() {
        let arch = x64();
        let instrs = decode_gadget(&BuiltinDecoder, &arch, &[0x58, 0xc3]).unwrap();
        assert_eq!(instrs.len(), 2);
        assert_eq!(instrs[0].mnemonic, Mnemonic::Pop);
        assert_eq!(
            instrs[0].operands[0],
            Operand::Reg { reg: reg::AX, width: 64 }
        );
        assert_eq!(instrs[0].text, "pop rax");
        assert_eq!(instrs[1].mnemonic, Mnemonic::Ret);
    }

    #[test]
    fn test_pop_extended_reg() {
        // 41 5f = pop r15
        let arch = x64();
        let i = BuiltinDecoder.decode_one(&arch, &[0x41, 0x5f]).unwrap();
        assert_eq!(i.operands[0], Operand::Reg { reg: reg::R15, width: 64 });
        assert_eq!(i.text, "pop r15");
    }

    #[test]
    fn test_mov_reg_reg() {
        // 48 89 d8 = mov rax, rbx
        let arch = x64();
        let i = BuiltinDecoder.decode_one(&arch, &[0x48, 0x89, 0xd8]).unwrap();
        assert_eq!(i.mnemonic, Mnemonic::Mov);
        assert_eq!(i.operands[0], Operand::Reg { reg: reg::AX, width: 64 });
        assert_eq!(i.operands[1], Operand::Reg { reg: reg::BX, width: 64 });
        assert_eq!(i.text, "mov rax, rbx");
        // 89 d8 = mov eax, ebx (x86)
        let arch = x86();
        let i = BuiltinDecoder.decode_one(&arch, &[0x89, 0xd8]).unwrap();
        assert_eq!(i.text, "mov eax, ebx");
    }

    #[test]
    fn test_mov_store() {
        // 48 89 07 = mov [rdi], rax
        let arch = x64();
        let i = BuiltinDecoder.decode_one(&arch, &[0x48, 0x89, 0x07]).unwrap();
        assert_eq!(
            i.operands[0],
            Operand::Mem { base: Some(reg::DI), disp: 0, width: 64 }
        );
        assert_eq!(i.operands[1], Operand::Reg { reg: reg::AX, width: 64 });
        assert_eq!(i.text, "mov [rdi], rax");
    }

    #[test]
    fn test_mov_load_disp() {
        // 48 8b 47 10 = mov rax, [rdi+0x10]
        let arch = x64();
        let i = BuiltinDecoder
            .decode_one(&arch, &[0x48, 0x8b, 0x47, 0x10])
            .unwrap();
        assert_eq!(i.operands[0], Operand::Reg { reg: reg::AX, width: 64 });
        assert_eq!(
            i.operands[1],
            Operand::Mem { base: Some(reg::DI), disp: 0x10, width: 64 }
        );
    }

    #[test]
    fn test_mov_imm64() {
        // 48 b8 imm64 = movabs rax, imm
        let arch = x64();
        let mut bytes = vec![0x48, 0xb8];
        bytes.extend_from_slice(&0x4142434445464748u64.to_le_bytes());
        let i = BuiltinDecoder.decode_one(&arch, &bytes).unwrap();
        assert_eq!(i.mnemonic, Mnemonic::Mov);
        assert_eq!(
            i.operands[1],
            Operand::Imm { value: 0x4142434445464748, width: 64 }
        );
        assert_eq!(i.len, 10);
    }

    #[test]
    fn test_xor_self() {
        // 31 c0 = xor eax, eax
        let arch = x86();
        let i = BuiltinDecoder.decode_one(&arch, &[0x31, 0xc0]).unwrap();
        assert_eq!(i.mnemonic, Mnemonic::Xor);
        assert_eq!(i.text, "xor eax, eax");
    }

    #[test]
    fn test_int80_and_syscall() {
        let arch = x86();
        let i = BuiltinDecoder.decode_one(&arch, &[0xcd, 0x80]).unwrap();
        assert_eq!(i.mnemonic, Mnemonic::Int);
        assert_eq!(i.operands[0], Operand::Imm { value: 0x80, width: 8 });

        let arch = x64();
        let i = BuiltinDecoder.decode_one(&arch, &[0x0f, 0x05]).unwrap();
        assert_eq!(i.mnemonic, Mnemonic::Syscall);
    }

    #[test]
    fn test_jmp_call_reg() {
        // ff e0 = jmp rax ; ff d3 = call rbx
        let arch = x64();
        let i = BuiltinDecoder.decode_one(&arch, &[0xff, 0xe0]).unwrap();
        assert_eq!(i.mnemonic, Mnemonic::Jmp);
        assert_eq!(i.text, "jmp rax");
        let i = BuiltinDecoder.decode_one(&arch, &[0xff, 0xd3]).unwrap();
        assert_eq!(i.mnemonic, Mnemonic::Call);
    }

    #[test]
    fn test_x86_inc_dec() {
        let arch = x86();
        let i = BuiltinDecoder.decode_one(&arch, &[0x40]).unwrap();
        assert_eq!(i.mnemonic, Mnemonic::Inc);
        let i = BuiltinDecoder.decode_one(&arch, &[0x4b]).unwrap();
        assert_eq!(i.mnemonic, Mnemonic::Dec);
        assert_eq!(i.operands[0], Operand::Reg { reg: reg::BX, width: 32 });
    }

    #[test]
    fn test_gadget_requires_terminator() {
        let arch = x64();
        assert_eq!(
            decode_gadget(&BuiltinDecoder, &arch, &[0x58]),
            Err(DecodeError::NoTerminator)
        );
        assert_eq!(
            decode_gadget(&BuiltinDecoder, &arch, &[0xc3, 0x58]),
            Err(DecodeError::TrailingBytes)
        );
    }

    #[test]
    fn test_unsupported_opcode() {
        let arch = x64();
        let err = BuiltinDecoder.decode_one(&arch, &[0xf4]).unwrap_err();
        assert!(matches!(err, DecodeError::Unsupported { opcode: 0xf4, .. }));
    }

    #[test]
    fn test_cmov() {
        // 48 0f 44 c3 = cmove rax, rbx
        let arch = x64();
        let i = BuiltinDecoder
            .decode_one(&arch, &[0x48, 0x0f, 0x44, 0xc3])
            .unwrap();
        assert_eq!(i.mnemonic, Mnemonic::Cmov(CondCode::E));
        assert_eq!(i.text, "cmove rax, rbx");
    }

    #[test]
    fn test_ret_imm() {
        let arch = x86();
        let i = BuiltinDecoder.decode_one(&arch, &[0xc2, 0x08, 0x00]).unwrap();
        assert_eq!(i.mnemonic, Mnemonic::Ret);
        assert_eq!(i.operands[0], Operand::Imm { value: 8, width: 16 });
    }
}
