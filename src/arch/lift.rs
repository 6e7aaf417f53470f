//! Instruction lifter.
//!
//! Translates decoded machine instructions into IR fragments that model
//! their effect on general-purpose registers, the stack pointer, the
//! program counter, and the flag registers. Flag semantics follow the
//! architecture manual: ZF is the zero test, SF the result MSB, PF the
//! XOR-parity of the low byte, CF and OF come from the carry/borrow
//! chain, AF is the same chain at bit 3. Conditional moves split the
//! fragment into basic blocks joined by `Bcc`.

use super::decode::{CondCode, DecodedInstr, Mnemonic, Operand};
use super::{reg, Arch};
use crate::expr::{RegId, Width};
use crate::ir::{BasicBlockId, IrBlock, IrInstr, IrOp, IrOperand};

/// Lift failure; the gadget is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LiftError {
    #[error("instruction shape not liftable")]
    Unsupported,
    #[error("lifted block exceeds IR limits")]
    OverLimits,
}

/// Lift a decoded gadget (terminator included) into an IR block.
pub fn lift_gadget(arch: &Arch, instrs: &[DecodedInstr]) -> Result<IrBlock, LiftError> {
    let mut lifter = Lifter {
        arch,
        blk: IrBlock::new(),
        bb: 0,
    };
    for instr in instrs {
        lifter.blk.nb_instr += 1;
        lifter.lift(instr)?;
        if lifter.blk.over_limits() {
            return Err(LiftError::OverLimits);
        }
        if instr.mnemonic.is_terminator() {
            break;
        }
    }
    Ok(lifter.blk)
}

struct Lifter<'a> {
    arch: &'a Arch,
    blk: IrBlock,
    bb: BasicBlockId,
}

impl Lifter<'_> {
    fn push(&mut self, instr: IrInstr) {
        self.blk.push(self.bb, instr);
    }

    fn word(&self) -> Width {
        self.arch.bits()
    }

    fn sp(&self) -> IrOperand {
        IrOperand::var(reg::SP, self.word())
    }

    fn pc(&self) -> IrOperand {
        IrOperand::var(reg::IP, self.word())
    }

    fn flag(&self, f: RegId) -> IrOperand {
        IrOperand::var(f, 1)
    }

    /// Word-width operand for a memory reference's address.
    fn address_of(&mut self, base: Option<RegId>, disp: i64) -> IrOperand {
        let w = self.word();
        let disp_cst = IrOperand::cst(disp as u64 & crate::expr::width_mask(w), w);
        match base {
            None => disp_cst,
            Some(b) if disp == 0 => IrOperand::var(b, w),
            Some(b) => {
                let t = self.blk.new_tmp(w);
                self.push(IrInstr::arith(IrOp::Add, t, IrOperand::var(b, w), disp_cst));
                t
            }
        }
    }

    /// Readable IR operand for a decoded operand; memory loads go
    /// through a temporary.
    fn read_operand(&mut self, op: &Operand) -> IrOperand {
        match *op {
            Operand::Reg { reg, width } => IrOperand::Var {
                reg,
                high: width - 1,
                low: 0,
            },
            Operand::Imm { value, width } => {
                IrOperand::cst(value as u64 & crate::expr::width_mask(width), width)
            }
            Operand::Mem { base, disp, width } => {
                let addr = self.address_of(base, disp);
                let t = self.blk.new_tmp(width);
                self.push(IrInstr::ldm(t, addr));
                t
            }
        }
    }

    /// Write a value to a decoded operand.
    fn write_operand(&mut self, op: &Operand, value: IrOperand) -> Result<(), LiftError> {
        match *op {
            Operand::Reg { reg, width } => {
                self.push(IrInstr::mov(
                    IrOperand::Var { reg, high: width - 1, low: 0 },
                    value,
                ));
                Ok(())
            }
            Operand::Mem { base, disp, .. } => {
                let addr = self.address_of(base, disp);
                self.push(IrInstr::stm(addr, value));
                Ok(())
            }
            Operand::Imm { .. } => Err(LiftError::Unsupported),
        }
    }

    fn lift(&mut self, instr: &DecodedInstr) -> Result<(), LiftError> {
        let word = self.word();
        match instr.mnemonic {
            Mnemonic::Nop => self.push(IrInstr::new(
                IrOp::Nop,
                IrOperand::None,
                IrOperand::None,
                IrOperand::None,
            )),
            Mnemonic::Mov => {
                let [dst, src] = two(instr)?;
                let v = self.read_operand(&src);
                self.write_operand(&dst, v)?;
            }
            Mnemonic::Lea => {
                let [dst, src] = two(instr)?;
                let Operand::Mem { base, disp, .. } = src else {
                    return Err(LiftError::Unsupported);
                };
                let addr = self.address_of(base, disp);
                let sliced = slice_to(addr, dst.width());
                self.write_operand(&dst, sliced)?;
            }
            Mnemonic::Add
            | Mnemonic::Sub
            | Mnemonic::And
            | Mnemonic::Or
            | Mnemonic::Xor => {
                let [dst, src] = two(instr)?;
                let a = self.read_operand(&dst);
                let b = self.read_operand(&src);
                let w = dst.width();
                let t = self.blk.new_tmp(w);
                let (op, kind) = match instr.mnemonic {
                    Mnemonic::Add => (IrOp::Add, FlagKind::Add),
                    Mnemonic::Sub => (IrOp::Sub, FlagKind::Sub),
                    Mnemonic::And => (IrOp::And, FlagKind::Logic),
                    Mnemonic::Or => (IrOp::Or, FlagKind::Logic),
                    Mnemonic::Xor => (IrOp::Xor, FlagKind::Logic),
                    _ => unreachable!(),
                };
                self.push(IrInstr::arith(op, t, a, b));
                self.arith_flags(kind, a, b, t, w);
                self.write_operand(&dst, t)?;
            }
            Mnemonic::Cmp => {
                let [a_op, b_op] = two(instr)?;
                let a = self.read_operand(&a_op);
                let b = self.read_operand(&b_op);
                let w = a_op.width();
                let t = self.blk.new_tmp(w);
                self.push(IrInstr::arith(IrOp::Sub, t, a, b));
                self.arith_flags(FlagKind::Sub, a, b, t, w);
            }
            Mnemonic::Test => {
                let [a_op, b_op] = two(instr)?;
                let a = self.read_operand(&a_op);
                let b = self.read_operand(&b_op);
                let w = a_op.width();
                let t = self.blk.new_tmp(w);
                self.push(IrInstr::arith(IrOp::And, t, a, b));
                self.arith_flags(FlagKind::Logic, a, b, t, w);
            }
            Mnemonic::Inc | Mnemonic::Dec => {
                let [dst] = one(instr)?;
                let a = self.read_operand(&dst);
                let w = dst.width();
                let one_c = IrOperand::cst(1, w);
                let t = self.blk.new_tmp(w);
                let (op, kind) = if instr.mnemonic == Mnemonic::Inc {
                    (IrOp::Add, FlagKind::IncDec(true))
                } else {
                    (IrOp::Sub, FlagKind::IncDec(false))
                };
                self.push(IrInstr::arith(op, t, a, one_c));
                self.arith_flags(kind, a, one_c, t, w);
                self.write_operand(&dst, t)?;
            }
            Mnemonic::Neg => {
                let [dst] = one(instr)?;
                let a = self.read_operand(&dst);
                let w = dst.width();
                let t = self.blk.new_tmp(w);
                self.push(IrInstr::new(IrOp::Neg, t, a, IrOperand::None));
                self.arith_flags(FlagKind::Sub, IrOperand::cst(0, w), a, t, w);
                self.write_operand(&dst, t)?;
            }
            Mnemonic::Not => {
                let [dst] = one(instr)?;
                let a = self.read_operand(&dst);
                let t = self.blk.new_tmp(dst.width());
                self.push(IrInstr::new(IrOp::Not, t, a, IrOperand::None));
                self.write_operand(&dst, t)?;
            }
            Mnemonic::Xchg => {
                let [a_op, b_op] = two(instr)?;
                let a = self.read_operand(&a_op);
                let b = self.read_operand(&b_op);
                let t = self.blk.new_tmp(a_op.width());
                self.push(IrInstr::mov(t, a));
                self.write_operand(&a_op, b)?;
                self.write_operand(&b_op, t)?;
            }
            Mnemonic::Push => {
                let [src] = one(instr)?;
                let v = self.read_operand(&src);
                let t_addr = self.blk.new_tmp(word);
                self.push(IrInstr::arith(
                    IrOp::Sub,
                    t_addr,
                    self.sp(),
                    IrOperand::cst(u64::from(word) / 8, word),
                ));
                self.push(IrInstr::stm(t_addr, v));
                self.push(IrInstr::mov(self.sp(), t_addr));
            }
            Mnemonic::Pop => {
                let [dst] = one(instr)?;
                let t = self.blk.new_tmp(word);
                self.push(IrInstr::ldm(t, self.sp()));
                self.push(IrInstr::arith(
                    IrOp::Add,
                    self.sp(),
                    self.sp(),
                    IrOperand::cst(u64::from(word) / 8, word),
                ));
                self.write_operand(&dst, t)?;
            }
            Mnemonic::Leave => {
                // sp = bp + word; bp = mem[bp]
                let bp = IrOperand::var(reg::BP, word);
                let t = self.blk.new_tmp(word);
                self.push(IrInstr::ldm(t, bp));
                self.push(IrInstr::arith(
                    IrOp::Add,
                    self.sp(),
                    bp,
                    IrOperand::cst(u64::from(word) / 8, word),
                ));
                self.push(IrInstr::mov(bp, t));
            }
            Mnemonic::Ret => {
                // pc = mem[sp]; sp += word (+ n for `ret n`)
                let t = self.blk.new_tmp(word);
                self.push(IrInstr::ldm(t, self.sp()));
                let extra = match instr.operands.first() {
                    Some(Operand::Imm { value, .. }) => *value as u64,
                    _ => 0,
                };
                self.push(IrInstr::arith(
                    IrOp::Add,
                    self.sp(),
                    self.sp(),
                    IrOperand::cst(u64::from(word) / 8 + extra, word),
                ));
                self.push(IrInstr::mov(self.pc(), t));
            }
            Mnemonic::Jmp => {
                let [target] = one(instr)?;
                let v = self.read_operand(&target);
                self.push(IrInstr::mov(self.pc(), v));
            }
            Mnemonic::Call => {
                // Pushes a return address the chain cannot know yet.
                let [target] = one(instr)?;
                let v = self.read_operand(&target);
                let t_addr = self.blk.new_tmp(word);
                self.push(IrInstr::arith(
                    IrOp::Sub,
                    t_addr,
                    self.sp(),
                    IrOperand::cst(u64::from(word) / 8, word),
                ));
                let t_ret = self.blk.new_tmp(word);
                self.push(IrInstr::new(
                    IrOp::Unknown,
                    t_ret,
                    IrOperand::None,
                    IrOperand::None,
                ));
                self.push(IrInstr::stm(t_addr, t_ret));
                self.push(IrInstr::mov(self.sp(), t_addr));
                self.push(IrInstr::mov(self.pc(), v));
                self.blk.ends_with_call = true;
            }
            Mnemonic::Int => {
                let [vector] = one(instr)?;
                let Operand::Imm { value, .. } = vector else {
                    return Err(LiftError::Unsupported);
                };
                self.push(IrInstr::new(
                    IrOp::Int,
                    IrOperand::None,
                    IrOperand::cst(value as u64, 8),
                    IrOperand::None,
                ));
            }
            Mnemonic::Syscall | Mnemonic::Sysenter => {
                self.push(IrInstr::new(
                    IrOp::Syscall,
                    IrOperand::None,
                    IrOperand::None,
                    IrOperand::None,
                ));
            }
            Mnemonic::Cmov(cc) => {
                let [dst, src] = two(instr)?;
                let cond = self.cond_expr(cc);
                let taken = self.blk.new_bblock();
                let not_taken = self.blk.new_bblock();
                let join = self.blk.new_bblock();
                self.push(IrInstr::new(
                    IrOp::Bcc,
                    cond,
                    IrOperand::cst(taken as u64, 64),
                    IrOperand::cst(not_taken as u64, 64),
                ));

                self.bb = taken;
                let v = self.read_operand(&src);
                self.write_operand(&dst, v)?;
                self.goto(join);

                // A 32-bit cmov on x64 zero-extends the destination even
                // when the move is not taken.
                self.bb = not_taken;
                if dst.width() < word {
                    let cur = self.read_operand(&dst);
                    self.write_operand(&dst, cur)?;
                }
                self.goto(join);

                self.bb = join;
            }
        }
        Ok(())
    }

    fn goto(&mut self, target: BasicBlockId) {
        self.push(IrInstr::new(
            IrOp::Bcc,
            IrOperand::cst(1, 1),
            IrOperand::cst(target as u64, 64),
            IrOperand::cst(target as u64, 64),
        ));
    }

    /// One-bit condition operand for a condition code.
    fn cond_expr(&mut self, cc: CondCode) -> IrOperand {
        let cf = self.flag(reg::CF);
        let zf = self.flag(reg::ZF);
        let sf = self.flag(reg::SF);
        let of = self.flag(reg::OF);
        let pf = self.flag(reg::PF);
        match cc {
            CondCode::O => of,
            CondCode::No => self.not1(of),
            CondCode::B => cf,
            CondCode::Ae => self.not1(cf),
            CondCode::E => zf,
            CondCode::Ne => self.not1(zf),
            CondCode::Be => self.or1(cf, zf),
            CondCode::A => {
                let t = self.or1(cf, zf);
                self.not1(t)
            }
            CondCode::S => sf,
            CondCode::Ns => self.not1(sf),
            CondCode::P => pf,
            CondCode::Np => self.not1(pf),
            CondCode::L => self.xor1(sf, of),
            CondCode::Ge => {
                let t = self.xor1(sf, of);
                self.not1(t)
            }
            CondCode::Le => {
                let t = self.xor1(sf, of);
                self.or1(t, zf)
            }
            CondCode::G => {
                let t = self.xor1(sf, of);
                let t = self.or1(t, zf);
                self.not1(t)
            }
        }
    }

    fn not1(&mut self, a: IrOperand) -> IrOperand {
        let t = self.blk.new_tmp(1);
        self.push(IrInstr::new(IrOp::Not, t, a, IrOperand::None));
        t
    }

    fn or1(&mut self, a: IrOperand, b: IrOperand) -> IrOperand {
        let t = self.blk.new_tmp(1);
        self.push(IrInstr::arith(IrOp::Or, t, a, b));
        t
    }

    fn xor1(&mut self, a: IrOperand, b: IrOperand) -> IrOperand {
        let t = self.blk.new_tmp(1);
        self.push(IrInstr::arith(IrOp::Xor, t, a, b));
        t
    }

    /// Standard flag updates after an arithmetic or logic operation.
    fn arith_flags(
        &mut self,
        kind: FlagKind,
        a: IrOperand,
        b: IrOperand,
        res: IrOperand,
        width: Width,
    ) {
        let msb = width - 1;

        // ZF: result is zero.
        self.push(IrInstr::new(
            IrOp::Bisz,
            self.flag(reg::ZF),
            res,
            IrOperand::None,
        ));
        // SF: MSB of the result.
        self.push(IrInstr::mov(self.flag(reg::SF), bit(res, msb)));
        // PF: even parity of the low byte.
        self.parity_flag(res);

        match kind {
            FlagKind::Logic => {
                self.push(IrInstr::mov(self.flag(reg::CF), IrOperand::cst(0, 1)));
                self.push(IrInstr::mov(self.flag(reg::OF), IrOperand::cst(0, 1)));
                // AF is architecturally undefined after logic ops.
                self.push(IrInstr::new(
                    IrOp::Unknown,
                    self.flag(reg::AF),
                    IrOperand::None,
                    IrOperand::None,
                ));
            }
            FlagKind::Add | FlagKind::Sub | FlagKind::IncDec(_) => {
                let sub = matches!(kind, FlagKind::Sub | FlagKind::IncDec(false));
                // Carry/borrow chain: addition uses
                // (a & b) | ((a | b) & ~r); subtraction uses
                // (~a & b) | ((~a | b) & r).
                let lhs = if sub {
                    let t = self.blk.new_tmp(width);
                    self.push(IrInstr::new(IrOp::Not, t, a, IrOperand::None));
                    t
                } else {
                    a
                };
                let r_term = if sub {
                    res
                } else {
                    let t = self.blk.new_tmp(width);
                    self.push(IrInstr::new(IrOp::Not, t, res, IrOperand::None));
                    t
                };
                let t_and = self.blk.new_tmp(width);
                self.push(IrInstr::arith(IrOp::And, t_and, lhs, b));
                let t_or = self.blk.new_tmp(width);
                self.push(IrInstr::arith(IrOp::Or, t_or, lhs, b));
                let t_or_r = self.blk.new_tmp(width);
                self.push(IrInstr::arith(IrOp::And, t_or_r, t_or, r_term));
                let chain = self.blk.new_tmp(width);
                self.push(IrInstr::arith(IrOp::Or, chain, t_and, t_or_r));

                if !matches!(kind, FlagKind::IncDec(_)) {
                    self.push(IrInstr::mov(self.flag(reg::CF), bit(chain, msb)));
                }
                self.push(IrInstr::mov(self.flag(reg::AF), bit(chain, 3)));

                // OF: sign of the operands disagrees with the result.
                let t_ar = self.blk.new_tmp(width);
                self.push(IrInstr::arith(IrOp::Xor, t_ar, a, res));
                let t_ab = self.blk.new_tmp(width);
                self.push(IrInstr::arith(IrOp::Xor, t_ab, a, b));
                let of_src = if sub {
                    let t = self.blk.new_tmp(width);
                    self.push(IrInstr::arith(IrOp::And, t, t_ab, t_ar));
                    t
                } else {
                    let t_nab = self.blk.new_tmp(width);
                    self.push(IrInstr::new(IrOp::Not, t_nab, t_ab, IrOperand::None));
                    let t = self.blk.new_tmp(width);
                    self.push(IrInstr::arith(IrOp::And, t, t_nab, t_ar));
                    t
                };
                self.push(IrInstr::mov(self.flag(reg::OF), bit(of_src, msb)));
            }
        }
    }

    fn parity_flag(&mut self, res: IrOperand) {
        let mut acc = bit(res, 0);
        for i in 1..8 {
            let t = self.blk.new_tmp(1);
            self.push(IrInstr::arith(IrOp::Xor, t, acc, bit(res, i)));
            acc = t;
        }
        // PF is set on even parity.
        let pf = self.blk.new_tmp(1);
        self.push(IrInstr::new(IrOp::Not, pf, acc, IrOperand::None));
        self.push(IrInstr::mov(self.flag(reg::PF), pf));
    }
}

enum FlagKind {
    Add,
    Sub,
    Logic,
    /// `inc`/`dec` leave CF untouched; true for `inc`.
    IncDec(bool),
}

/// Single-bit slice of a register or temporary operand.
fn bit(op: IrOperand, i: u16) -> IrOperand {
    match op {
        IrOperand::Var { reg, low, .. } => IrOperand::Var {
            reg,
            high: low + i,
            low: low + i,
        },
        IrOperand::Tmp { index, low, .. } => IrOperand::Tmp {
            index,
            high: low + i,
            low: low + i,
        },
        IrOperand::Cst { value, .. } => IrOperand::cst((value >> i) & 1, 1),
        IrOperand::None => IrOperand::None,
    }
}

/// Narrow a word-width operand to `width` bits.
fn slice_to(op: IrOperand, width: Width) -> IrOperand {
    match op {
        IrOperand::Var { reg, low, .. } => IrOperand::Var {
            reg,
            high: low + width - 1,
            low,
        },
        IrOperand::Tmp { index, low, .. } => IrOperand::Tmp {
            index,
            high: low + width - 1,
            low,
        },
        IrOperand::Cst { value, .. } => {
            IrOperand::cst(value & crate::expr::width_mask(width), width)
        }
        IrOperand::None => IrOperand::None,
    }
}

fn one(instr: &DecodedInstr) -> Result<[Operand; 1], LiftError> {
    match instr.operands.as_slice() {
        [a] => Ok([*a]),
        _ => Err(LiftError::Unsupported),
    }
}

fn two(instr: &DecodedInstr) -> Result<[Operand; 2], LiftError> {
    match instr.operands.as_slice() {
        [a, b] => Ok([*a, *b]),
        _ => Err(LiftError::Unsupported),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::decode::{decode_gadget, BuiltinDecoder};
    use crate::arch::ArchKind;
    use crate::expr::{Expr, Truth};
    use crate::ir::exec::{execute, ExitKind};

    fn lift_bytes(arch: &Arch, bytes: &[u8]) -> IrBlock {
        let instrs = decode_gadget(&BuiltinDecoder, arch, bytes).unwrap();
        lift_gadget(arch, &instrs).unwrap()
    }

    #[test]
    fn test_pop_rax_ret() {
        let arch = Arch::new(ArchKind::X64);
        let blk = lift_bytes(&arch, &[0x58, 0xc3]);
        assert_eq!(blk.nb_instr, 2);
        let out = execute(&arch, &blk).unwrap();
        let mut sem = out.semantics;
        sem.simplify();
        // rax = mem[rsp], rsp = rsp + 16, pc = mem[rsp + 8]
        assert_eq!(
            sem.single_value(reg::AX),
            Some(&Expr::mem(Expr::reg(reg::SP, 64), 64))
        );
        let sp = sem.single_value(reg::SP).unwrap();
        assert_eq!(
            sp,
            &Expr::cst(16, 64).add(Expr::reg(reg::SP, 64)).simplify()
        );
        let pc = sem.single_value(reg::IP).unwrap();
        assert_eq!(
            pc,
            &Expr::mem(
                Expr::cst(8, 64).add(Expr::reg(reg::SP, 64)).simplify(),
                64
            )
        );
    }

    #[test]
    fn test_xor_eax_eax_ret_zeroes() {
        let arch = Arch::new(ArchKind::X64);
        let blk = lift_bytes(&arch, &[0x31, 0xc0, 0xc3]);
        let out = execute(&arch, &blk).unwrap();
        let mut sem = out.semantics;
        sem.simplify();
        // 32-bit xor zero-extends on x64.
        assert_eq!(sem.single_value(reg::AX), Some(&Expr::cst(0, 64)));
    }

    #[test]
    fn test_mov_store_gadget() {
        // mov [rdi], rax ; ret
        let arch = Arch::new(ArchKind::X64);
        let blk = lift_bytes(&arch, &[0x48, 0x89, 0x07, 0xc3]);
        let out = execute(&arch, &blk).unwrap();
        let mut sem = out.semantics;
        sem.simplify();
        assert_eq!(sem.mem.len(), 1);
        assert_eq!(sem.mem[0].addr, Expr::reg(reg::DI, 64));
        assert_eq!(sem.mem[0].values[0].0, Expr::reg(reg::AX, 64));
    }

    #[test]
    fn test_add_flags_present_when_needed() {
        // add rax, rbx ; ret — flags unread, so pruned by liveness.
        let arch = Arch::new(ArchKind::X64);
        let blk = lift_bytes(&arch, &[0x48, 0x01, 0xd8, 0xc3]);
        let out = execute(&arch, &blk).unwrap();
        let mut sem = out.semantics;
        sem.simplify();
        assert_eq!(
            sem.single_value(reg::AX),
            Some(
                &Expr::reg(reg::AX, 64)
                    .add(Expr::reg(reg::BX, 64))
                    .simplify()
            )
        );
        assert!(sem.reg_value(reg::ZF).is_none());
        assert!(sem.reg_value(reg::CF).is_none());
    }

    #[test]
    fn test_push_pop_roundtrip() {
        // push rax ; pop rbx ; ret  →  rbx = rax via store forwarding.
        let arch = Arch::new(ArchKind::X64);
        let blk = lift_bytes(&arch, &[0x50, 0x5b, 0xc3]);
        let out = execute(&arch, &blk).unwrap();
        let mut sem = out.semantics;
        sem.simplify();
        assert_eq!(sem.single_value(reg::BX), Some(&Expr::reg(reg::AX, 64)));
        // Net SP change is just the ret slot.
        assert_eq!(
            sem.single_value(reg::SP),
            Some(&Expr::cst(8, 64).add(Expr::reg(reg::SP, 64)).simplify())
        );
    }

    #[test]
    fn test_int80_exit() {
        let arch = Arch::new(ArchKind::X86);
        let blk = lift_bytes(&arch, &[0xcd, 0x80]);
        let out = execute(&arch, &blk).unwrap();
        assert_eq!(out.exit, ExitKind::Int(0x80));
    }

    #[test]
    fn test_syscall_exit() {
        let arch = Arch::new(ArchKind::X64);
        let blk = lift_bytes(&arch, &[0x0f, 0x05]);
        let out = execute(&arch, &blk).unwrap();
        assert_eq!(out.exit, ExitKind::Syscall);
    }

    #[test]
    fn test_jmp_reg() {
        let arch = Arch::new(ArchKind::X64);
        let blk = lift_bytes(&arch, &[0xff, 0xe0]);
        let out = execute(&arch, &blk).unwrap();
        let mut sem = out.semantics;
        sem.simplify();
        assert_eq!(sem.single_value(reg::IP), Some(&Expr::reg(reg::AX, 64)));
    }

    #[test]
    fn test_ret_imm_sp_inc() {
        // ret 8: sp += word + 8
        let arch = Arch::new(ArchKind::X86);
        let blk = lift_bytes(&arch, &[0xc2, 0x08, 0x00]);
        let out = execute(&arch, &blk).unwrap();
        let mut sem = out.semantics;
        sem.simplify();
        assert_eq!(
            sem.single_value(reg::SP),
            Some(&Expr::cst(12, 32).add(Expr::reg(reg::SP, 32)).simplify())
        );
    }

    #[test]
    fn test_cmove_produces_conditional_pairs() {
        // cmp rax, rbx ; cmove rcx, rdx ; ret
        let arch = Arch::new(ArchKind::X64);
        let blk = lift_bytes(
            &arch,
            &[0x48, 0x39, 0xd8, 0x48, 0x0f, 0x44, 0xca, 0xc3],
        );
        let out = execute(&arch, &blk).unwrap();
        let mut sem = out.semantics;
        sem.simplify();
        let list = sem.reg_value(reg::CX).unwrap();
        // One pair per branch, both conditionally guarded.
        assert!(list.len() >= 2);
        assert!(list.iter().any(|(e, _)| *e == Expr::reg(reg::DX, 64)));
        assert!(list
            .iter()
            .all(|(_, c)| !matches!(c.eval(), Truth::False)));
        // ZF itself must be live (read by the cmov) and thus modelled.
        assert!(sem.reg_value(reg::ZF).is_some());
    }

    #[test]
    fn test_leave_semantics() {
        let arch = Arch::new(ArchKind::X86);
        let blk = lift_bytes(&arch, &[0xc9, 0xc3]);
        let out = execute(&arch, &blk).unwrap();
        let mut sem = out.semantics;
        sem.simplify();
        assert_eq!(
            sem.single_value(reg::BP),
            Some(&Expr::mem(Expr::reg(reg::BP, 32), 32))
        );
        assert_eq!(
            sem.single_value(reg::SP),
            Some(&Expr::cst(8, 32).add(Expr::reg(reg::BP, 32)).simplify())
        );
    }

    #[test]
    fn test_call_marks_block() {
        let arch = Arch::new(ArchKind::X64);
        let blk = lift_bytes(&arch, &[0xff, 0xd0]);
        assert!(blk.ends_with_call);
    }
}
