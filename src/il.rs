//! The intermediate language (IL) front-end.
//!
//! IL programs are small line-oriented texts describing what the ROP
//! chain must do, one instruction per line, `#` starting a comment.
//! The instruction set mirrors the database's gadget kinds plus the
//! convenience addressing combinations and the call/syscall forms that
//! the compiler lowers per ABI.

use crate::arch::Arch;
use crate::error::{Result, RopError};
use crate::expr::{Binop, RegId};

/// Argument of a function or syscall IL line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IlArg {
    Cst(i64),
    Reg(RegId),
    /// A string literal, materialised into caller-provided scratch
    /// memory before the call.
    Str(Vec<u8>),
}

/// The IL instruction kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IlKind {
    /// `reg = cst`
    MovCst { dst: RegId, cst: i64 },
    /// `reg = reg`
    MovReg { dst: RegId, src: RegId },
    /// `reg = reg op cst` (including the compound `reg op= cst`)
    AmovCst { dst: RegId, src: RegId, op: Binop, cst: i64 },
    /// `reg = reg op reg`
    AmovReg { dst: RegId, src1: RegId, op: Binop, src2: RegId },
    /// `reg = [reg + cst]`
    Load { dst: RegId, addr_reg: RegId, offset: i64 },
    /// `reg op= [reg + cst]`
    Aload { dst: RegId, op: Binop, addr_reg: RegId, offset: i64 },
    /// `reg = [cst]`
    LoadCst { dst: RegId, addr: i64 },
    /// `reg op= [cst]`
    AloadCst { dst: RegId, op: Binop, addr: i64 },
    /// `[reg + cst] = reg`
    Store { addr_reg: RegId, offset: i64, src: RegId },
    /// `[reg + cst] op= reg`
    Astore { addr_reg: RegId, offset: i64, op: Binop, src: RegId },
    /// `[cst] = reg`
    CstStore { addr: i64, src: RegId },
    /// `[cst] op= reg`
    CstAstore { addr: i64, op: Binop, src: RegId },
    /// `[reg + cst] = cst`
    StoreCst { addr_reg: RegId, offset: i64, cst: i64 },
    /// `[reg + cst] op= cst`
    AstoreCst { addr_reg: RegId, offset: i64, op: Binop, cst: i64 },
    /// `[cst] = cst`
    CstStoreCst { addr: i64, cst: i64 },
    /// `[cst] op= cst`
    CstAstoreCst { addr: i64, op: Binop, cst: i64 },
    /// `[cst] = "bytes"` — also used with a compiler-provided scratch
    /// address when the destination is omitted at lowering time.
    CstStoreString { addr: i64, bytes: Vec<u8> },
    /// `jmp reg`
    Jmp { reg: RegId },
    /// `name(arg, ...)`
    Function { name: String, args: Vec<IlArg> },
    /// `syscall name(arg, ...)`
    Syscall { name: String, args: Vec<IlArg> },
    /// `int80 name(arg, ...)`
    Int80 { name: String, args: Vec<IlArg> },
}

/// One parsed IL instruction with its source text (carried through the
/// strategy graph into chain comments).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IlInstruction {
    pub kind: IlKind,
    pub text: String,
}

/// Parse a whole IL program. Errors carry the byte offset of the
/// offending token within `program`.
pub fn parse_program(arch: &Arch, program: &str) -> Result<Vec<IlInstruction>> {
    let mut out = Vec::new();
    let mut offset = 0;
    for line in program.split('\n') {
        if let Some(instr) = parse_line(arch, line, offset)? {
            out.push(instr);
        }
        offset += line.len() + 1;
    }
    Ok(out)
}

/// Parse one IL line; comments and blank lines yield `None`.
pub fn parse_line(arch: &Arch, line: &str, base: usize) -> Result<Option<IlInstruction>> {
    let code = match line.find('#') {
        Some(i) => &line[..i],
        None => line,
    };
    if code.trim().is_empty() {
        return Ok(None);
    }
    let mut lx = Lexer { s: code, pos: 0, base, arch };
    let kind = lx.instruction()?;
    lx.skip_ws();
    if !lx.at_end() {
        return Err(lx.err("trailing input"));
    }
    Ok(Some(IlInstruction {
        kind,
        text: code.trim().to_string(),
    }))
}

struct Lexer<'a> {
    s: &'a str,
    pos: usize,
    base: usize,
    arch: &'a Arch,
}

impl Lexer<'_> {
    fn err(&self, message: &str) -> RopError {
        let token: String = self.s[self.pos.min(self.s.len())..]
            .chars()
            .take(12)
            .collect();
        RopError::IlParse {
            offset: self.base + self.pos,
            token,
            message: message.to_string(),
        }
    }

    fn skip_ws(&mut self) {
        while self.s[self.pos..].starts_with(|c: char| c.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.s.len()
    }

    fn peek(&self) -> Option<char> {
        self.s[self.pos..].chars().next()
    }

    fn eat(&mut self, c: char) -> bool {
        self.skip_ws();
        if self.peek() == Some(c) {
            self.pos += c.len_utf8();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, c: char) -> Result<()> {
        if self.eat(c) {
            Ok(())
        } else {
            Err(self.err(&format!("expected {c:?}")))
        }
    }

    fn ident(&mut self) -> Option<String> {
        self.skip_ws();
        let start = self.pos;
        let rest = &self.s[self.pos..];
        let len = rest
            .find(|c: char| !c.is_ascii_alphanumeric() && c != '_')
            .unwrap_or(rest.len());
        // Identifiers start with a letter or underscore.
        if len == 0 || rest.starts_with(|c: char| c.is_ascii_digit()) {
            return None;
        }
        self.pos += len;
        Some(self.s[start..start + len].to_string())
    }

    fn register(&mut self) -> Result<RegId> {
        self.skip_ws();
        let start = self.pos;
        let Some(name) = self.ident() else {
            return Err(self.err("expected register"));
        };
        self.arch.reg_from_name(&name).ok_or(RopError::UnknownRegister {
            name,
            offset: self.base + start,
        })
    }

    /// True when the next token starts like an identifier.
    fn at_ident(&mut self) -> bool {
        self.skip_ws();
        self.peek()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
    }

    fn number(&mut self) -> Result<i64> {
        self.skip_ws();
        let neg = self.eat('-');
        self.skip_ws();
        let rest = &self.s[self.pos..];
        let (digits, radix) = if let Some(hex) = rest.strip_prefix("0x") {
            self.pos += 2;
            (hex, 16)
        } else {
            (rest, 10)
        };
        let len = digits
            .find(|c: char| !c.is_ascii_hexdigit())
            .unwrap_or(digits.len());
        let text = &digits[..len];
        if text.is_empty() {
            return Err(self.err("expected number"));
        }
        let value = u64::from_str_radix(text, radix)
            .map_err(|_| self.err("number out of range"))?;
        self.pos += len;
        let v = value as i64;
        Ok(if neg { v.wrapping_neg() } else { v })
    }

    fn binop(&mut self) -> Option<Binop> {
        self.skip_ws();
        let op = match self.peek()? {
            '+' => Binop::Add,
            '-' => Binop::Sub,
            '*' => Binop::Mul,
            '/' => Binop::Div,
            '%' => Binop::Mod,
            '&' => Binop::And,
            '|' => Binop::Or,
            '^' => Binop::Xor,
            _ => return None,
        };
        self.pos += 1;
        Some(op)
    }

    fn string_lit(&mut self) -> Result<Vec<u8>> {
        self.expect('"')?;
        let mut bytes = Vec::new();
        loop {
            let Some(c) = self.peek() else {
                return Err(self.err("unterminated string"));
            };
            self.pos += c.len_utf8();
            match c {
                '"' => return Ok(bytes),
                '\\' => {
                    let Some(esc) = self.peek() else {
                        return Err(self.err("unterminated escape"));
                    };
                    self.pos += esc.len_utf8();
                    match esc {
                        'n' => bytes.push(b'\n'),
                        't' => bytes.push(b'\t'),
                        '0' => bytes.push(0),
                        '\\' => bytes.push(b'\\'),
                        '"' => bytes.push(b'"'),
                        'x' => {
                            let hex = self.s.get(self.pos..self.pos + 2);
                            let v = hex
                                .and_then(|h| u8::from_str_radix(h, 16).ok())
                                .ok_or_else(|| self.err("bad \\x escape"))?;
                            self.pos += 2;
                            bytes.push(v);
                        }
                        _ => return Err(self.err("unknown escape")),
                    }
                }
                _ => bytes.extend_from_slice(c.to_string().as_bytes()),
            }
        }
    }

    /// `[reg +/- cst]` or `[cst]`; returns `(Some(reg), offset)` or
    /// `(None, address)`.
    fn mem_ref(&mut self) -> Result<(Option<RegId>, i64)> {
        self.expect('[')?;
        if self.at_ident() {
            let r = self.register()?;
            let mut offset = 0;
            self.skip_ws();
            match self.peek() {
                Some('+') => {
                    self.pos += 1;
                    offset = self.number()?;
                }
                Some('-') => {
                    self.pos += 1;
                    offset = -self.number()?;
                }
                _ => {}
            }
            self.expect(']')?;
            Ok((Some(r), offset))
        } else {
            let addr = self.number()?;
            self.expect(']')?;
            Ok((None, addr))
        }
    }

    /// Optional `op` directly before `=` (the compound-assign forms).
    fn compound_eq(&mut self) -> Result<Option<Binop>> {
        self.skip_ws();
        if self.eat('=') {
            return Ok(None);
        }
        let Some(op) = self.binop() else {
            return Err(self.err("expected '=' or compound assignment"));
        };
        self.expect('=')?;
        Ok(Some(op))
    }

    fn call_args(&mut self) -> Result<Vec<IlArg>> {
        self.expect('(')?;
        let mut args = Vec::new();
        if self.eat(')') {
            return Ok(args);
        }
        loop {
            self.skip_ws();
            if self.peek() == Some('"') {
                args.push(IlArg::Str(self.string_lit()?));
            } else if self.at_ident() {
                args.push(IlArg::Reg(self.register()?));
            } else {
                args.push(IlArg::Cst(self.number()?));
            }
            if self.eat(')') {
                return Ok(args);
            }
            self.expect(',')?;
        }
    }

    fn instruction(&mut self) -> Result<IlKind> {
        self.skip_ws();
        if self.peek() == Some('[') {
            return self.mem_dst();
        }

        let save = self.pos;
        let Some(word) = self.ident() else {
            return Err(self.err("expected instruction"));
        };

        match word.as_str() {
            "jmp" => {
                let reg = self.register()?;
                return Ok(IlKind::Jmp { reg });
            }
            "syscall" => {
                let Some(name) = self.ident() else {
                    return Err(self.err("expected syscall name"));
                };
                let args = self.call_args()?;
                return Ok(IlKind::Syscall { name, args });
            }
            "int80" => {
                let Some(name) = self.ident() else {
                    return Err(self.err("expected syscall name"));
                };
                let args = self.call_args()?;
                return Ok(IlKind::Int80 { name, args });
            }
            _ => {}
        }

        self.skip_ws();
        if self.peek() == Some('(') {
            let args = self.call_args()?;
            return Ok(IlKind::Function { name: word, args });
        }

        // Register assignment forms.
        self.pos = save;
        let dst = self.register()?;
        let op = self.compound_eq()?;
        match op {
            Some(op) => self.compound_rhs(dst, op),
            None => self.plain_rhs(dst),
        }
    }

    /// RHS of `reg = ...`.
    fn plain_rhs(&mut self, dst: RegId) -> Result<IlKind> {
        self.skip_ws();
        if self.peek() == Some('[') {
            let (reg, off) = self.mem_ref()?;
            return Ok(match reg {
                Some(addr_reg) => IlKind::Load { dst, addr_reg, offset: off },
                None => IlKind::LoadCst { dst, addr: off },
            });
        }
        if self.at_ident() {
            let src = self.register()?;
            // Maybe `reg op cst` or `reg op reg`.
            if let Some(op) = self.binop() {
                if self.at_ident() {
                    let src2 = self.register()?;
                    return Ok(IlKind::AmovReg { dst, src1: src, op, src2 });
                }
                let cst = self.number()?;
                return Ok(IlKind::AmovCst { dst, src, op, cst });
            }
            return Ok(IlKind::MovReg { dst, src });
        }
        let cst = self.number()?;
        Ok(IlKind::MovCst { dst, cst })
    }

    /// RHS of `reg op= ...`.
    fn compound_rhs(&mut self, dst: RegId, op: Binop) -> Result<IlKind> {
        self.skip_ws();
        if self.peek() == Some('[') {
            let (reg, off) = self.mem_ref()?;
            return Ok(match reg {
                Some(addr_reg) => IlKind::Aload { dst, op, addr_reg, offset: off },
                None => IlKind::AloadCst { dst, op, addr: off },
            });
        }
        if self.at_ident() {
            let src2 = self.register()?;
            return Ok(IlKind::AmovReg { dst, src1: dst, op, src2 });
        }
        let cst = self.number()?;
        Ok(IlKind::AmovCst { dst, src: dst, op, cst })
    }

    /// Forms with a memory destination.
    fn mem_dst(&mut self) -> Result<IlKind> {
        let (reg, off) = self.mem_ref()?;
        let op = self.compound_eq()?;
        self.skip_ws();

        if self.peek() == Some('"') {
            if reg.is_some() || op.is_some() {
                return Err(self.err("string stores need a constant address"));
            }
            let bytes = self.string_lit()?;
            return Ok(IlKind::CstStoreString { addr: off, bytes });
        }

        if self.at_ident() {
            let src = self.register()?;
            return Ok(match (reg, op) {
                (Some(addr_reg), None) => IlKind::Store { addr_reg, offset: off, src },
                (Some(addr_reg), Some(op)) => {
                    IlKind::Astore { addr_reg, offset: off, op, src }
                }
                (None, None) => IlKind::CstStore { addr: off, src },
                (None, Some(op)) => IlKind::CstAstore { addr: off, op, src },
            });
        }

        let cst = self.number()?;
        Ok(match (reg, op) {
            (Some(addr_reg), None) => IlKind::StoreCst { addr_reg, offset: off, cst },
            (Some(addr_reg), Some(op)) => {
                IlKind::AstoreCst { addr_reg, offset: off, op, cst }
            }
            (None, None) => IlKind::CstStoreCst { addr: off, cst },
            (None, Some(op)) => IlKind::CstAstoreCst { addr: off, op, cst },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{reg, ArchKind};

    fn x64() -> Arch {
        Arch::new(ArchKind::X64)
    }
    fn x86() -> Arch {
        Arch::new(ArchKind::X86)
    }

    fn one(arch: &Arch, line: &str) -> IlKind {
        parse_line(arch, line, 0).unwrap().unwrap().kind
    }

    #[test]
    fn test_mov_cst() {
        assert_eq!(
            one(&x64(), "rax = 0x4142434445464748"),
            IlKind::MovCst { dst: reg::AX, cst: 0x4142434445464748 }
        );
        assert_eq!(
            one(&x86(), "ecx = 678"),
            IlKind::MovCst { dst: reg::CX, cst: 678 }
        );
    }

    #[test]
    fn test_mov_reg_and_arith() {
        assert_eq!(
            one(&x86(), "eax = ebx"),
            IlKind::MovReg { dst: reg::AX, src: reg::BX }
        );
        assert_eq!(
            one(&x86(), "esi = ebx ^ 0xdead"),
            IlKind::AmovCst { dst: reg::SI, src: reg::BX, op: Binop::Xor, cst: 0xdead }
        );
        assert_eq!(
            one(&x86(), "eax = ebx + ecx"),
            IlKind::AmovReg {
                dst: reg::AX,
                src1: reg::BX,
                op: Binop::Add,
                src2: reg::CX
            }
        );
    }

    #[test]
    fn test_compound_forms() {
        assert_eq!(
            one(&x86(), "eax += ebx"),
            IlKind::AmovReg {
                dst: reg::AX,
                src1: reg::AX,
                op: Binop::Add,
                src2: reg::BX
            }
        );
        assert_eq!(
            one(&x64(), "rdi -= 8"),
            IlKind::AmovCst { dst: reg::DI, src: reg::DI, op: Binop::Sub, cst: 8 }
        );
    }

    #[test]
    fn test_memory_forms() {
        assert_eq!(
            one(&x64(), "rdx = [rcx]"),
            IlKind::Load { dst: reg::DX, addr_reg: reg::CX, offset: 0 }
        );
        assert_eq!(
            one(&x64(), "rdx = [rcx + 8]"),
            IlKind::Load { dst: reg::DX, addr_reg: reg::CX, offset: 8 }
        );
        assert_eq!(
            one(&x64(), "rax = [0x600600]"),
            IlKind::LoadCst { dst: reg::AX, addr: 0x600600 }
        );
        assert_eq!(
            one(&x86(), "[edx+8] *= 2"),
            IlKind::AstoreCst {
                addr_reg: reg::DX,
                offset: 8,
                op: Binop::Mul,
                cst: 2
            }
        );
        assert_eq!(
            one(&x64(), "[rdi] = rax"),
            IlKind::Store { addr_reg: reg::DI, offset: 0, src: reg::AX }
        );
        assert_eq!(
            one(&x64(), "[0x600600] = 0xdeadbeef"),
            IlKind::CstStoreCst { addr: 0x600600, cst: 0xdeadbeef }
        );
        assert_eq!(
            one(&x64(), "[0x600600] = rsi"),
            IlKind::CstStore { addr: 0x600600, src: reg::SI }
        );
    }

    #[test]
    fn test_string_store() {
        assert_eq!(
            one(&x64(), "[0x600800] = \"/bin/sh\\0\""),
            IlKind::CstStoreString {
                addr: 0x600800,
                bytes: b"/bin/sh\0".to_vec()
            }
        );
    }

    #[test]
    fn test_jmp_and_calls() {
        assert_eq!(one(&x64(), "jmp rbx"), IlKind::Jmp { reg: reg::BX });
        assert_eq!(
            one(&x64(), "execve(0x600800, 0, 0)"),
            IlKind::Function {
                name: "execve".into(),
                args: vec![IlArg::Cst(0x600800), IlArg::Cst(0), IlArg::Cst(0)]
            }
        );
        assert_eq!(
            one(&x64(), "syscall exit(42)"),
            IlKind::Syscall { name: "exit".into(), args: vec![IlArg::Cst(42)] }
        );
        assert_eq!(
            one(&x86(), "int80 exit(rax)"),
            IlKind::Int80 { name: "exit".into(), args: vec![IlArg::Reg(reg::AX)] }
        );
    }

    #[test]
    fn test_comments_and_blanks() {
        let arch = x64();
        assert!(parse_line(&arch, "  # just a comment", 0).unwrap().is_none());
        assert!(parse_line(&arch, "", 0).unwrap().is_none());
        let instr = parse_line(&arch, "rax = 1 # set rax", 0).unwrap().unwrap();
        assert_eq!(instr.kind, IlKind::MovCst { dst: reg::AX, cst: 1 });
        assert_eq!(instr.text, "rax = 1");
    }

    #[test]
    fn test_parse_errors_carry_offsets() {
        let arch = x64();
        let err = parse_line(&arch, "rax = rbx +", 0).unwrap_err();
        assert!(matches!(err, RopError::IlParse { .. }));

        let err = parse_line(&arch, "xyz = 1", 0).unwrap_err();
        match err {
            RopError::UnknownRegister { name, offset } => {
                assert_eq!(name, "xyz");
                assert_eq!(offset, 0);
            }
            other => panic!("unexpected error {other:?}"),
        }

        let program = "rax = 1\nrbx = zz";
        let err = parse_program(&arch, program).unwrap_err();
        match err {
            RopError::UnknownRegister { offset, .. } => assert_eq!(offset, 14),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_program_parsing() {
        let arch = x64();
        let program = "# chain\nrdi = 0x600800\nrsi = 0\nsyscall execve(rdi, rsi, 0)\n";
        let instrs = parse_program(&arch, program).unwrap();
        assert_eq!(instrs.len(), 3);
    }
}
