//! Expression canonicalisation.
//!
//! `simplify` is a bounded fixed-point iteration of a bottom-up pass.
//! Each pass applies, in order: unknown propagation, shift lowering,
//! constant folding, operand-identity rules, neutral elements, canonical
//! commutation, slice merging, and polynomial factorisation. The result
//! is idempotent: simplifying a simplified expression returns it
//! unchanged.

use super::polynom::Polynom;
use super::{width_mask, Binop, Expr, ExprKind, Unop};

impl Expr {
    /// Canonical, reduced form of this expression. Idempotent.
    pub fn simplify(&self) -> Expr {
        let mut cur = self.clone();
        // Each pass strictly reduces or reorders; O(size) passes suffice.
        let bound = 2 * self.size() + 8;
        for _ in 0..bound {
            let next = pass(&cur);
            if next == cur {
                break;
            }
            cur = next;
        }
        cur
    }
}

/// One bottom-up rewrite pass.
fn pass(e: &Expr) -> Expr {
    let rebuilt = match e.kind() {
        ExprKind::Cst { .. } | ExprKind::Reg { .. } | ExprKind::Unknown { .. } => e.clone(),
        ExprKind::Mem { addr, width } => Expr::mem(pass(addr), *width),
        ExprKind::Unop { op, arg } => Expr::unop(*op, pass(arg)),
        ExprKind::Binop { op, left, right } => Expr::binop(*op, pass(left), pass(right)),
        ExprKind::Extract { arg, high, low } => Expr::extract(pass(arg), *high, *low),
        ExprKind::Concat { upper, lower } => Expr::concat(pass(upper), pass(lower)),
    };
    local(rebuilt)
}

/// Local rules; children are already in pass-normal form.
fn local(e: Expr) -> Expr {
    let w = e.width();

    // 1. Unknown propagation: any opaque operand poisons the node.
    match e.kind() {
        ExprKind::Unknown { .. } | ExprKind::Cst { .. } | ExprKind::Reg { .. } => {}
        _ => {
            if e.has_unknown() {
                return Expr::unknown(w);
            }
        }
    }

    let e = lower_shifts(e);
    let e = fold_constants(e);
    let e = operand_identities(e);
    let e = neutral_elements(e);
    let e = canonical_order(e);
    let e = slice_rules(e);
    factorise(e)
}

/// `SHL` by a constant k becomes `MUL` by `2^k`; `SHR` becomes `DIV`.
fn lower_shifts(e: Expr) -> Expr {
    let w = e.width();
    if let ExprKind::Binop { op, left, right } = e.kind() {
        if let Some(k) = right.as_cst() {
            match op {
                Binop::Shl => {
                    let factor = if k >= u64::from(w) { 0 } else { 1u64 << k };
                    return Expr::binop(Binop::Mul, Expr::cst(factor, w), left.clone());
                }
                Binop::Shr => {
                    if k >= u64::from(w) {
                        return Expr::cst(0, w);
                    }
                    return Expr::binop(Binop::Div, left.clone(), Expr::cst(1u64 << k, w));
                }
                _ => {}
            }
        }
    }
    e
}

fn fold_constants(e: Expr) -> Expr {
    let w = e.width();
    match e.kind() {
        ExprKind::Binop { op, left, right } => {
            let (Some(a), Some(b)) = (left.as_cst(), right.as_cst()) else {
                return e;
            };
            let v = match op {
                Binop::Add => a.wrapping_add(b),
                Binop::Sub => a.wrapping_sub(b),
                Binop::Mul => a.wrapping_mul(b),
                Binop::Div => {
                    if b == 0 {
                        return Expr::unknown(w);
                    }
                    a / b
                }
                Binop::Mod => {
                    if b == 0 {
                        return Expr::unknown(w);
                    }
                    a % b
                }
                Binop::And => a & b,
                Binop::Or => a | b,
                Binop::Xor => a ^ b,
                Binop::Shl => {
                    if b >= u64::from(w) {
                        0
                    } else {
                        a << b
                    }
                }
                Binop::Shr => {
                    if b >= u64::from(w) {
                        0
                    } else {
                        a >> b
                    }
                }
            };
            Expr::cst(v, w)
        }
        ExprKind::Unop { op, arg } => {
            let Some(a) = arg.as_cst() else { return e };
            match op {
                Unop::Not => Expr::cst(!a, w),
                Unop::Neg => Expr::cst(a.wrapping_neg(), w),
            }
        }
        ExprKind::Extract { arg, high, low } => {
            let Some(a) = arg.as_cst() else { return e };
            Expr::cst(a >> low, high - low + 1)
        }
        ExprKind::Concat { upper, lower } => {
            let (Some(u), Some(l)) = (upper.as_cst(), lower.as_cst()) else {
                return e;
            };
            if w > 64 {
                return e;
            }
            Expr::cst((u << lower.width()) | l, w)
        }
        _ => e,
    }
}

/// Rules where both operands are the same subtree.
fn operand_identities(e: Expr) -> Expr {
    let w = e.width();
    if let ExprKind::Binop { op, left, right } = e.kind() {
        if left == right {
            match op {
                Binop::Xor | Binop::Sub => return Expr::cst(0, w),
                Binop::And | Binop::Or => return left.clone(),
                _ => {}
            }
        }
    }
    e
}

fn neutral_elements(e: Expr) -> Expr {
    let w = e.width();
    let ones = width_mask(w);
    if let ExprKind::Binop { op, left, right } = e.kind() {
        let lc = left.as_cst();
        let rc = right.as_cst();
        match op {
            Binop::Add => {
                if lc == Some(0) {
                    return right.clone();
                }
                if rc == Some(0) {
                    return left.clone();
                }
            }
            Binop::Sub => {
                if rc == Some(0) {
                    return left.clone();
                }
            }
            Binop::Mul => {
                if lc == Some(1) {
                    return right.clone();
                }
                if rc == Some(1) {
                    return left.clone();
                }
                if lc == Some(0) || rc == Some(0) {
                    return Expr::cst(0, w);
                }
            }
            Binop::Div => {
                if rc == Some(1) {
                    return left.clone();
                }
            }
            Binop::And => {
                if lc == Some(0) || rc == Some(0) {
                    return Expr::cst(0, w);
                }
                if lc == Some(ones) {
                    return right.clone();
                }
                if rc == Some(ones) {
                    return left.clone();
                }
            }
            Binop::Or => {
                if lc == Some(0) {
                    return right.clone();
                }
                if rc == Some(0) {
                    return left.clone();
                }
                if lc == Some(ones) || rc == Some(ones) {
                    return Expr::cst(ones, w);
                }
            }
            Binop::Xor => {
                if lc == Some(0) {
                    return right.clone();
                }
                if rc == Some(0) {
                    return left.clone();
                }
                if lc == Some(ones) {
                    return Expr::unop(Unop::Not, right.clone());
                }
                if rc == Some(ones) {
                    return Expr::unop(Unop::Not, left.clone());
                }
            }
            _ => {}
        }
    }
    if let ExprKind::Unop { op: Unop::Not, arg } = e.kind() {
        // ~~x = x
        if let ExprKind::Unop { op: Unop::Not, arg: inner } = arg.kind() {
            return inner.clone();
        }
    }
    e
}

/// Rotate commutative operands so the lower-ranked one is on the left;
/// constants migrate left of ADD, MUL, AND, OR, XOR. SUB is never
/// commuted.
fn canonical_order(e: Expr) -> Expr {
    if let ExprKind::Binop { op, left, right } = e.kind() {
        if op.is_commutative() && left.canon_cmp(right) == std::cmp::Ordering::Greater {
            return Expr::binop(*op, right.clone(), left.clone());
        }
    }
    e
}

/// Slice-merge rules over Extract and Concat.
fn slice_rules(e: Expr) -> Expr {
    match e.kind() {
        ExprKind::Extract { arg, high, low } => {
            // Extract(x, W-1, 0) = x
            if *low == 0 && *high == arg.width() - 1 {
                return arg.clone();
            }
            // Extract(Extract(x, h2, l2), h, l) = Extract(x, l2+h, l2+l)
            if let ExprKind::Extract { arg: inner, low: l2, .. } = arg.kind() {
                return Expr::extract(inner.clone(), l2 + high, l2 + low);
            }
            e
        }
        ExprKind::Concat { upper, lower } => {
            // Concat(Extract(x, a, b), Extract(x, b-1, c)) = Extract(x, a, c)
            if let (
                ExprKind::Extract { arg: xa, high: a, low: b },
                ExprKind::Extract { arg: xb, high: b2, low: c },
            ) = (upper.kind(), lower.kind())
            {
                if xa == xb && *b > 0 && *b2 == b - 1 {
                    return Expr::extract(xa.clone(), *a, *c);
                }
            }
            e
        }
        _ => e,
    }
}

/// Polynomial factorisation of ADD/SUB/MUL-by-constant subtrees.
fn factorise(e: Expr) -> Expr {
    let applies = match e.kind() {
        ExprKind::Binop { op: Binop::Add | Binop::Sub, .. } => true,
        ExprKind::Binop { op: Binop::Mul, left, right } => {
            left.is_cst() || right.is_cst()
        }
        ExprKind::Unop { op: Unop::Neg, .. } => true,
        _ => false,
    };
    if !applies {
        return e;
    }
    match Polynom::from_expr(&e) {
        Some(p) => p.to_expr(),
        None => e,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn r(i: u16) -> Expr {
        Expr::reg(i, 64)
    }
    fn c(v: u64) -> Expr {
        Expr::cst(v, 64)
    }

    #[test]
    fn test_idempotence() {
        let cases = vec![
            r(0).add(r(1)).sub(r(0)),
            Expr::binop(Binop::Xor, r(2), r(2)),
            Expr::mem(r(6).add(c(8)), 64),
            Expr::binop(Binop::Shl, r(1), c(3)),
            Expr::concat(
                Expr::extract(r(0), 63, 32),
                Expr::extract(r(0), 31, 0),
            ),
            Expr::binop(Binop::And, r(3), Expr::unknown(64)),
        ];
        for e in cases {
            let s1 = e.simplify();
            let s2 = s1.simplify();
            assert_eq!(s1, s2, "not idempotent for {e}");
        }
    }

    #[test]
    fn test_unknown_propagation() {
        let e = r(0).add(Expr::unknown(64));
        assert_eq!(e.simplify(), Expr::unknown(64));
        let e = Expr::mem(Expr::unknown(64), 32);
        assert_eq!(e.simplify(), Expr::unknown(32));
    }

    #[test]
    fn test_constant_folding() {
        assert_eq!(c(3).add(c(4)).simplify(), c(7));
        assert_eq!(
            Expr::binop(Binop::Mul, c(6), c(7)).simplify(),
            c(42)
        );
        assert_eq!(
            Expr::binop(Binop::Div, c(1), c(0)).simplify(),
            Expr::unknown(64)
        );
        assert_eq!(
            Expr::extract(Expr::cst(0xabcd, 16), 15, 8).simplify(),
            Expr::cst(0xab, 8)
        );
        assert_eq!(
            Expr::concat(Expr::cst(0x12, 8), Expr::cst(0x34, 8)).simplify(),
            Expr::cst(0x1234, 16)
        );
    }

    #[test]
    fn test_xor_self_is_zero() {
        // The executor relies on this to see `xor eax, eax` as eax = 0.
        let e = Expr::binop(Binop::Xor, r(0), r(0));
        assert_eq!(e.simplify(), c(0));
    }

    #[test]
    fn test_neutral_elements() {
        assert_eq!(r(0).add(c(0)).simplify(), r(0));
        assert_eq!(Expr::binop(Binop::Mul, r(0), c(1)).simplify(), r(0));
        assert_eq!(Expr::binop(Binop::And, r(0), c(0)).simplify(), c(0));
        assert_eq!(
            Expr::binop(Binop::Xor, r(0), c(u64::MAX)).simplify(),
            Expr::unop(Unop::Not, r(0))
        );
        assert_eq!(Expr::extract(r(0), 63, 0).simplify(), r(0));
    }

    #[test]
    fn test_polynomial_canonicalisation() {
        // x + y - x  →  y
        let e = r(0).add(r(1)).sub(r(0));
        assert_eq!(e.simplify(), r(1));
        // (x + 4) + (x - 4)  →  2*x
        let e = r(0).add(c(4)).add(r(0).sub(c(4)));
        assert_eq!(
            e.simplify(),
            Expr::binop(Binop::Mul, c(2), r(0))
        );
        // Equal polynomials simplify identically.
        let a = r(0).add(c(8)).add(r(1));
        let b = r(1).add(r(0)).add(c(8));
        assert_eq!(a.simplify(), b.simplify());
    }

    #[test]
    fn test_shift_lowering() {
        let e = Expr::binop(Binop::Shl, r(0), c(3));
        assert_eq!(
            e.simplify(),
            Expr::binop(Binop::Mul, c(8), r(0))
        );
        let e = Expr::binop(Binop::Shr, r(0), c(2));
        assert_eq!(
            e.simplify(),
            Expr::binop(Binop::Div, r(0), c(4))
        );
    }

    #[test]
    fn test_slice_merge() {
        let e = Expr::concat(
            Expr::extract(r(0), 63, 32),
            Expr::extract(r(0), 31, 0),
        );
        assert_eq!(e.simplify(), r(0));
        let e = Expr::concat(
            Expr::extract(r(0), 31, 16),
            Expr::extract(r(0), 15, 8),
        );
        assert_eq!(e.simplify(), Expr::extract(r(0), 31, 8));
    }

    #[test]
    fn test_commutative_ordering() {
        // Constants migrate left.
        let e = Expr::binop(Binop::And, r(0), c(0xff));
        assert_eq!(
            e.simplify(),
            Expr::binop(Binop::And, c(0xff), r(0))
        );
        // Lower register index migrates left.
        let e = Expr::binop(Binop::Xor, r(5), r(1));
        assert_eq!(
            e.simplify(),
            Expr::binop(Binop::Xor, r(1), r(5))
        );
    }
}
