//! Boolean conditions over expressions.
//!
//! Conditions guard the per-branch values in gadget semantics. Their
//! truth is three-valued: `Unknown` is the default whenever the
//! simplifier cannot decide. Comparisons are signed over the canonical
//! residues of the polynomial form.

use super::polynom::Polynom;
use super::Expr;
use std::fmt;
use std::rc::Rc;

/// Three-valued truth lattice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Truth {
    True,
    False,
    Unknown,
}

impl Truth {
    /// Logical negation; `Unknown` stays `Unknown`.
    pub fn not(self) -> Truth {
        match self {
            Truth::True => Truth::False,
            Truth::False => Truth::True,
            Truth::Unknown => Truth::Unknown,
        }
    }
}

/// A boolean condition over expressions.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Cond {
    True,
    False,
    Unknown,
    /// `left == right`; both sides must have equal width.
    Eq(Expr, Expr),
    /// `left != right`.
    Neq(Expr, Expr),
    /// `left < right`, signed.
    Lt(Expr, Expr),
    /// `left <= right`, signed.
    Le(Expr, Expr),
    And(Rc<Cond>, Rc<Cond>),
    Or(Rc<Cond>, Rc<Cond>),
    Not(Rc<Cond>),
    /// The address is readable in the target process.
    ValidRead(Expr),
    /// The address is writable in the target process.
    ValidWrite(Expr),
}

impl Cond {
    /// Conjunction with short-circuit identities applied at build time.
    pub fn and(a: Cond, b: Cond) -> Cond {
        match (&a, &b) {
            (Cond::True, _) => b,
            (_, Cond::True) => a,
            (Cond::False, _) | (_, Cond::False) => Cond::False,
            _ => Cond::And(Rc::new(a), Rc::new(b)),
        }
    }

    /// Disjunction with short-circuit identities.
    pub fn or(a: Cond, b: Cond) -> Cond {
        match (&a, &b) {
            (Cond::True, _) | (_, Cond::True) => Cond::True,
            (Cond::False, _) => b,
            (_, Cond::False) => a,
            _ => Cond::Or(Rc::new(a), Rc::new(b)),
        }
    }

    /// Negation; `Not(Not(x))` collapses to `x`.
    pub fn negate(c: Cond) -> Cond {
        match c {
            Cond::True => Cond::False,
            Cond::False => Cond::True,
            Cond::Not(inner) => (*inner).clone(),
            Cond::Eq(a, b) => Cond::Neq(a, b),
            Cond::Neq(a, b) => Cond::Eq(a, b),
            other => Cond::Not(Rc::new(other)),
        }
    }

    /// Equality of two expressions of the same width.
    pub fn eq(a: Expr, b: Expr) -> Cond {
        Cond::Eq(a, b)
    }

    /// Evaluate to the three-valued lattice.
    pub fn eval(&self) -> Truth {
        match self {
            Cond::True => Truth::True,
            Cond::False => Truth::False,
            Cond::Unknown => Truth::Unknown,
            Cond::Eq(a, b) => cmp_eq(a, b),
            Cond::Neq(a, b) => cmp_eq(a, b).not(),
            Cond::Lt(a, b) => cmp_lt(a, b, false),
            Cond::Le(a, b) => cmp_lt(a, b, true),
            Cond::And(a, b) => match (a.eval(), b.eval()) {
                (Truth::False, _) | (_, Truth::False) => Truth::False,
                (Truth::True, Truth::True) => Truth::True,
                _ => Truth::Unknown,
            },
            Cond::Or(a, b) => match (a.eval(), b.eval()) {
                (Truth::True, _) | (_, Truth::True) => Truth::True,
                (Truth::False, Truth::False) => Truth::False,
                _ => Truth::Unknown,
            },
            Cond::Not(a) => a.eval().not(),
            // Decided by memory-safety assertions at a higher level.
            Cond::ValidRead(_) | Cond::ValidWrite(_) => Truth::Unknown,
        }
    }

    /// True if `eval` is definitely `False`; such guard pairs are dropped.
    pub fn is_false(&self) -> bool {
        self.eval() == Truth::False
    }
}

fn cmp_eq(a: &Expr, b: &Expr) -> Truth {
    let sa = a.simplify();
    let sb = b.simplify();
    if sa == sb {
        return Truth::True;
    }
    match (sa.as_polynom(), sb.as_polynom()) {
        (Some(pa), Some(pb)) => {
            if pa == pb {
                Truth::True
            } else if pa.same_reg_part(&pb) {
                // Same register part, different constant: never equal.
                Truth::False
            } else {
                Truth::Unknown
            }
        }
        _ => Truth::Unknown,
    }
}

fn cmp_lt(a: &Expr, b: &Expr, or_equal: bool) -> Truth {
    let (Some(pa), Some(pb)) = (a.simplify().as_polynom(), b.simplify().as_polynom()) else {
        return Truth::Unknown;
    };
    if !pa.same_reg_part(&pb) {
        return Truth::Unknown;
    }
    let holds = if or_equal {
        pa.cst <= pb.cst
    } else {
        pa.cst < pb.cst
    };
    if holds {
        Truth::True
    } else {
        Truth::False
    }
}

/// Disjointness of the byte ranges `[a, a + a_bytes)` and
/// `[b, b + b_bytes)`, decided at the polynomial level only. Addresses
/// that are not affine collapse to `Unknown`, which is sound (the caller
/// must then assume a possible overlap).
pub fn ranges_disjoint(a: &Expr, a_bytes: u64, b: &Expr, b_bytes: u64) -> Truth {
    let (Some(pa), Some(pb)) = (a.simplify().as_polynom(), b.simplify().as_polynom()) else {
        return Truth::Unknown;
    };
    if !pa.same_reg_part(&pb) {
        return Truth::Unknown;
    }
    let delta = pa.cst as i128 - pb.cst as i128;
    if delta >= b_bytes as i128 || delta <= -(a_bytes as i128) {
        Truth::True
    } else {
        Truth::False
    }
}

impl fmt::Debug for Cond {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl fmt::Display for Cond {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cond::True => write!(f, "true"),
            Cond::False => write!(f, "false"),
            Cond::Unknown => write!(f, "unknown"),
            Cond::Eq(a, b) => write!(f, "({a} == {b})"),
            Cond::Neq(a, b) => write!(f, "({a} != {b})"),
            Cond::Lt(a, b) => write!(f, "({a} < {b})"),
            Cond::Le(a, b) => write!(f, "({a} <= {b})"),
            Cond::And(a, b) => write!(f, "({a} && {b})"),
            Cond::Or(a, b) => write!(f, "({a} || {b})"),
            Cond::Not(a) => write!(f, "!({a})"),
            Cond::ValidRead(a) => write!(f, "valid_read({a})"),
            Cond::ValidWrite(a) => write!(f, "valid_write({a})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(i: u16) -> Expr {
        Expr::reg(i, 64)
    }
    fn c(v: u64) -> Expr {
        Expr::cst(v, 64)
    }

    #[test]
    fn test_constant_truth() {
        assert_eq!(Cond::True.eval(), Truth::True);
        assert_eq!(Cond::negate(Cond::True).eval(), Truth::False);
        assert_eq!(Cond::Unknown.eval(), Truth::Unknown);
    }

    #[test]
    fn test_eq_via_polynom() {
        // x + 8 == 8 + x
        let cond = Cond::eq(r(0).add(c(8)), c(8).add(r(0)));
        assert_eq!(cond.eval(), Truth::True);
        // x + 8 == x + 16 is decidably false.
        let cond = Cond::eq(r(0).add(c(8)), r(0).add(c(16)));
        assert_eq!(cond.eval(), Truth::False);
        // x == y is unknown.
        let cond = Cond::eq(r(0), r(1));
        assert_eq!(cond.eval(), Truth::Unknown);
    }

    #[test]
    fn test_lt_same_reg_part() {
        let cond = Cond::Lt(r(6).add(c(8)), r(6).add(c(16)));
        assert_eq!(cond.eval(), Truth::True);
        let cond = Cond::Le(r(6).add(c(16)), r(6).add(c(16)));
        assert_eq!(cond.eval(), Truth::True);
        let cond = Cond::Lt(r(6).add(c(16)), r(6).add(c(8)));
        assert_eq!(cond.eval(), Truth::False);
    }

    #[test]
    fn test_short_circuit() {
        let c1 = Cond::and(Cond::True, Cond::Unknown);
        assert_eq!(c1, Cond::Unknown);
        let c2 = Cond::or(Cond::True, Cond::Eq(r(0), r(1)));
        assert_eq!(c2, Cond::True);
        let c3 = Cond::and(Cond::False, Cond::Eq(r(0), r(1)));
        assert_eq!(c3, Cond::False);
        let double = Cond::negate(Cond::negate(Cond::Lt(r(0), r(1))));
        assert_eq!(double, Cond::Lt(r(0), r(1)));
    }

    #[test]
    fn test_disjointness() {
        let sp = r(6);
        // [sp, sp+8) vs [sp+8, sp+16): disjoint.
        assert_eq!(
            ranges_disjoint(&sp, 8, &sp.add(c(8)), 8),
            Truth::True
        );
        // [sp, sp+8) vs [sp+4, sp+12): overlap.
        assert_eq!(
            ranges_disjoint(&sp, 8, &sp.add(c(4)), 8),
            Truth::False
        );
        // Different register parts: unknown.
        assert_eq!(ranges_disjoint(&r(0), 8, &r(1), 8), Truth::Unknown);
    }

    #[test]
    fn test_valid_pointer_predicates_stay_unknown() {
        assert_eq!(Cond::ValidRead(r(0)).eval(), Truth::Unknown);
        assert_eq!(Cond::ValidWrite(r(0)).eval(), Truth::Unknown);
    }
}
