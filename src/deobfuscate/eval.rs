use swc_core::common::Mark;
use swc_core::ecma::ast::{Expr, ExprStmt, Lit, Stmt};
use swc_core::ecma::visit::VisitMutWith;
use swc_ecma_transforms::optimization::simplify::expr_simplifier;

/// Constant-folds an expression to a literal.
///
/// The expression is cloned into a statement and run through
/// `expr_simplifier`; `Some` is returned only if the simplifier reduced
/// the whole expression to a literal node. `None` means the expression
/// depends on something that isn't statically known.
pub fn fold_expr(expr: &Expr) -> Option<Lit> {
    if let Expr::Lit(lit) = expr {
        return Some(lit.clone());
    }

    let mut stmt = Stmt::Expr(ExprStmt {
        span: Default::default(),
        expr: Box::new(expr.clone())
    });
    let mut simplifier = expr_simplifier(
        Mark::new(),
        Default::default()
    );
    stmt.visit_mut_with(&mut simplifier);

    if let Stmt::Expr(expr_stmt) = &stmt {
        if let Expr::Lit(lit) = &*expr_stmt.expr {
            return Some(lit.clone());
        }
    }

    None
}

/// Constant-folds an expression to a number.
pub fn fold_to_number(expr: &Expr) -> Option<f64> {
    match fold_expr(expr)? {
        Lit::Num(n) => Some(n.value),
        _ => None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn folds_arithmetic() {
        testing::with_globals(|| {
            let expr = testing::parse_expr("1 + 2 * 3");
            assert_eq!(fold_to_number(&expr), Some(7.0));
        });
    }

    #[test]
    fn folds_negative_numbers() {
        testing::with_globals(|| {
            let expr = testing::parse_expr("-4");
            assert_eq!(fold_to_number(&expr), Some(-4.0));
        });
    }

    #[test]
    fn folds_string_concatenation() {
        testing::with_globals(|| {
            let expr = testing::parse_expr("\"foo\" + \"bar\"");
            match fold_expr(&expr) {
                Some(Lit::Str(s)) => assert_eq!(s.value.to_string(), "foobar"),
                other => panic!("expected string literal, got {:?}", other)
            }
        });
    }

    #[test]
    fn unknown_for_free_identifiers() {
        testing::with_globals(|| {
            let expr = testing::parse_expr("x + 1");
            assert!(fold_expr(&expr).is_none());
        });
    }
}
