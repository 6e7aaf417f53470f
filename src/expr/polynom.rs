//! Affine polynomial form of an expression.
//!
//! A polynomial is a per-register integer coefficient map plus a
//! constant, all reduced modulo `2^width` into the canonical signed
//! residue range. Two expressions that are equal as affine combinations
//! of registers produce identical polynomials, which is the sole
//! guarantee behind simplifications like `x + y - x → y`.

use super::{Binop, Expr, ExprKind, RegId, Unop, Width};
use std::collections::BTreeMap;

/// Interpret `value` (masked to `width` bits) as a signed integer.
pub fn to_signed(value: u64, width: Width) -> i64 {
    if width >= 64 {
        value as i64
    } else {
        let sign_bit = 1u64 << (width - 1);
        if value & sign_bit != 0 {
            (value | !super::width_mask(width)) as i64
        } else {
            value as i64
        }
    }
}

/// Reduce `v` modulo `2^width` into `[-2^(width-1), 2^(width-1))`.
fn reduce(v: i128, width: Width) -> i64 {
    let m = 1i128 << width.min(64);
    let half = m >> 1;
    let mut r = v % m;
    if r >= half {
        r -= m;
    } else if r < -half {
        r += m;
    }
    r as i64
}

/// Affine polynomial: `cst + Σ coeffs[r] * r`, modulo `2^width`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Polynom {
    /// Non-zero per-register coefficients, keyed by register index.
    pub coeffs: BTreeMap<RegId, i64>,
    /// Constant term, canonical signed residue.
    pub cst: i64,
    /// Bit width of the underlying expression.
    pub width: Width,
}

impl Polynom {
    /// The zero polynomial.
    pub fn zero(width: Width) -> Self {
        Polynom {
            coeffs: BTreeMap::new(),
            cst: 0,
            width,
        }
    }

    /// A single constant.
    pub fn constant(cst: i64, width: Width) -> Self {
        Polynom {
            coeffs: BTreeMap::new(),
            cst: reduce(cst as i128, width),
            width,
        }
    }

    /// A single register with coefficient 1.
    pub fn register(reg: RegId, width: Width) -> Self {
        let mut coeffs = BTreeMap::new();
        coeffs.insert(reg, 1);
        Polynom {
            coeffs,
            cst: 0,
            width,
        }
    }

    fn normalised(mut self) -> Self {
        self.coeffs.retain(|_, c| *c != 0);
        self
    }

    /// Pointwise combination under ADD or SUB.
    pub fn merge(&self, other: &Polynom, op: Binop) -> Option<Polynom> {
        if self.width != other.width {
            return None;
        }
        let sign: i128 = match op {
            Binop::Add => 1,
            Binop::Sub => -1,
            _ => return None,
        };
        let mut coeffs = self.coeffs.clone();
        for (&reg, &c) in &other.coeffs {
            let cur = *coeffs.get(&reg).unwrap_or(&0) as i128;
            coeffs.insert(reg, reduce(cur + sign * c as i128, self.width));
        }
        let cst = reduce(self.cst as i128 + sign * other.cst as i128, self.width);
        Some(
            Polynom {
                coeffs,
                cst,
                width: self.width,
            }
            .normalised(),
        )
    }

    /// Multiply every term by a constant factor.
    pub fn scale(&self, factor: i64) -> Polynom {
        let coeffs = self
            .coeffs
            .iter()
            .map(|(&r, &c)| (r, reduce(c as i128 * factor as i128, self.width)))
            .collect();
        Polynom {
            coeffs,
            cst: reduce(self.cst as i128 * factor as i128, self.width),
            width: self.width,
        }
        .normalised()
    }

    /// True if there are no register terms.
    pub fn is_constant(&self) -> bool {
        self.coeffs.is_empty()
    }

    /// True if both polynomials have the same register part.
    pub fn same_reg_part(&self, other: &Polynom) -> bool {
        self.width == other.width && self.coeffs == other.coeffs
    }

    /// Parse an expression tree into polynomial form. Only ADD, SUB, NEG
    /// and MUL with a constant operand are admitted; anything else (Mem,
    /// Extract, bitwise operators, Unknown) yields `None`.
    pub fn from_expr(e: &Expr) -> Option<Polynom> {
        match e.kind() {
            ExprKind::Cst { value, width } => {
                Some(Polynom::constant(to_signed(*value, *width), *width))
            }
            ExprKind::Reg { index, width } => Some(Polynom::register(*index, *width)),
            ExprKind::Unop { op: Unop::Neg, arg } => {
                Some(Polynom::from_expr(arg)?.scale(-1))
            }
            ExprKind::Binop { op, left, right } => match op {
                Binop::Add | Binop::Sub => {
                    let l = Polynom::from_expr(left)?;
                    let r = Polynom::from_expr(right)?;
                    l.merge(&r, *op)
                }
                Binop::Mul => {
                    if let Some(c) = left.as_signed_cst() {
                        Some(Polynom::from_expr(right)?.scale(c))
                    } else if let Some(c) = right.as_signed_cst() {
                        Some(Polynom::from_expr(left)?.scale(c))
                    } else {
                        None
                    }
                }
                _ => None,
            },
            _ => None,
        }
    }

    /// Lower back to a canonical expression: constant first when
    /// positive, register terms in ascending index order, negative terms
    /// subtracted after the positive ones.
    pub fn to_expr(&self) -> Expr {
        let w = self.width;
        let mut acc: Option<Expr> = None;
        let mut push_add = |acc: &mut Option<Expr>, term: Expr| {
            *acc = Some(match acc.take() {
                Some(a) => a.add(term),
                None => term,
            });
        };

        if self.cst > 0 {
            push_add(&mut acc, Expr::cst(self.cst as u64, w));
        }
        for (&reg, &c) in &self.coeffs {
            if c > 0 {
                let term = if c == 1 {
                    Expr::reg(reg, w)
                } else {
                    Expr::binop(Binop::Mul, Expr::cst(c as u64, w), Expr::reg(reg, w))
                };
                push_add(&mut acc, term);
            }
        }

        // Negative terms.
        let mut neg_terms: Vec<Expr> = Vec::new();
        for (&reg, &c) in &self.coeffs {
            if c < 0 {
                let mag = (-(c as i128)) as u64;
                let term = if mag == 1 {
                    Expr::reg(reg, w)
                } else {
                    Expr::binop(Binop::Mul, Expr::cst(mag, w), Expr::reg(reg, w))
                };
                neg_terms.push(term);
            }
        }
        if self.cst < 0 {
            neg_terms.push(Expr::cst((-(self.cst as i128)) as u64, w));
        }

        let mut expr = match acc {
            Some(a) => a,
            None => {
                if neg_terms.is_empty() {
                    return Expr::cst(0, w);
                }
                // Purely negative: lead with a negation.
                let first = neg_terms.remove(0);
                Expr::unop(Unop::Neg, first)
            }
        };
        for t in neg_terms {
            expr = expr.sub(t);
        }
        expr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_x_plus_y_minus_x() {
        // (x + y) - x  →  y
        let x = Expr::reg(0, 64);
        let y = Expr::reg(1, 64);
        let e = x.add(y.clone()).sub(x.clone());
        let p = Polynom::from_expr(&e).unwrap();
        assert_eq!(p.to_expr(), y);
    }

    #[test]
    fn test_mod_width_constant_equivalence() {
        // x + 0xffffffff (32-bit) and x - 1 are the same polynomial.
        let x = Expr::reg(0, 32);
        let a = x.add(Expr::cst(0xffff_ffff, 32));
        let b = x.sub(Expr::cst(1, 32));
        assert_eq!(Polynom::from_expr(&a), Polynom::from_expr(&b));
    }

    #[test]
    fn test_scale_and_merge() {
        // 2*(x + 3) - x  →  x + 6
        let x = Expr::reg(4, 64);
        let e = Expr::binop(
            Binop::Mul,
            Expr::cst(2, 64),
            x.add(Expr::cst(3, 64)),
        )
        .sub(x.clone());
        let p = Polynom::from_expr(&e).unwrap();
        assert_eq!(p.cst, 6);
        assert_eq!(p.coeffs.get(&4), Some(&1));
    }

    #[test]
    fn test_reject_non_affine() {
        let x = Expr::reg(0, 64);
        let e = Expr::binop(Binop::Mul, x.clone(), x.clone());
        assert!(Polynom::from_expr(&e).is_none());
        let e = Expr::binop(Binop::And, x.clone(), Expr::cst(3, 64));
        assert!(Polynom::from_expr(&e).is_none());
    }

    #[test]
    fn test_pure_negative_lowering() {
        let x = Expr::reg(2, 64);
        let e = Expr::cst(0, 64).sub(x.clone());
        let p = Polynom::from_expr(&e).unwrap();
        assert_eq!(p.to_expr(), Expr::unop(Unop::Neg, x));
    }

    #[test]
    fn test_signed_reduction() {
        assert_eq!(to_signed(0xff, 8), -1);
        assert_eq!(to_signed(0x7f, 8), 127);
        let p = Polynom::constant(200, 8);
        assert_eq!(p.cst, -56);
    }
}
