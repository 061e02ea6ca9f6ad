//! Compile-time folding of arithmetic and bitwise expressions.

use tol_types::Uint256;

use crate::lua::ast::{BinOp, Expr, ExprNode, UnOp};

/// Fold an expression to a numeric constant, when every operand is itself
/// a foldable number.
///
/// Division and modulo by a zero divisor are deliberately not folded, so
/// the runtime raises the precise error at the precise line.
pub fn fold(node: &ExprNode) -> Option<Uint256> {
    match &node.expr {
        Expr::Number(n) => Some(*n),
        Expr::UnOp(op, operand) => {
            let v = fold(operand)?;
            match op {
                UnOp::Unm => Some(Uint256::ZERO.wrapping_sub(v)),
                UnOp::BNot => Some(v.bitnot()),
                UnOp::Not | UnOp::Len => None,
            }
        }
        Expr::BinOp(op, lhs, rhs) => {
            let a = fold(lhs)?;
            let b = fold(rhs)?;
            match op {
                BinOp::Add => Some(a.wrapping_add(b)),
                BinOp::Sub => Some(a.wrapping_sub(b)),
                BinOp::Mul => Some(a.wrapping_mul(b)),
                BinOp::Pow => Some(a.wrapping_pow(b)),
                BinOp::Div | BinOp::IDiv => a.checked_div(b),
                BinOp::Mod => a.checked_rem(b),
                BinOp::BAnd => Some(a.bitand(b)),
                BinOp::BOr => Some(a.bitor(b)),
                BinOp::BXor => Some(a.bitxor(b)),
                BinOp::Shl => Some(a.shl(b)),
                BinOp::Shr => Some(a.shr(b)),
                _ => None,
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn num(v: u64) -> ExprNode {
        ExprNode::new(Expr::Number(Uint256::from_u64(v)), 1)
    }

    fn bin(op: BinOp, a: ExprNode, b: ExprNode) -> ExprNode {
        ExprNode::new(Expr::BinOp(op, Box::new(a), Box::new(b)), 1)
    }

    #[test]
    fn folds_nested_arithmetic() {
        // (2 ^ 8) + (240 | 15) == 511
        let e = bin(
            BinOp::Add,
            bin(BinOp::Pow, num(2), num(8)),
            bin(BinOp::BOr, num(240), num(15)),
        );
        assert_eq!(fold(&e), Some(Uint256::from_u64(511)));
    }

    #[test]
    fn zero_divisor_is_left_to_the_runtime() {
        assert_eq!(fold(&bin(BinOp::Div, num(1), num(0))), None);
        assert_eq!(fold(&bin(BinOp::Mod, num(1), num(0))), None);
        assert_eq!(fold(&bin(BinOp::IDiv, num(1), num(0))), None);
    }

    #[test]
    fn comparisons_do_not_fold() {
        assert_eq!(fold(&bin(BinOp::Lt, num(1), num(2))), None);
        assert_eq!(fold(&bin(BinOp::Concat, num(1), num(2))), None);
    }

    #[test]
    fn unary_minus_wraps() {
        let e = ExprNode::new(Expr::UnOp(UnOp::Unm, Box::new(num(1))), 1);
        assert_eq!(fold(&e), Some(Uint256::MAX));
    }
}
