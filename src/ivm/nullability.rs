//! Null-rejection and function-property analysis over expressions.
//!
//! These mirror the planner's `find_nonnullable_vars`,
//! `contain_nonstrict_functions` and `contain_mutable_functions` helpers
//! over our own expression tree. They only look at the current query
//! level; sub-selects are opaque.

use crate::ivm::query::{BoolOp, Expr, Var, Volatility};

/// Variables (of the current query level) that must be non-NULL for
/// `expr` to evaluate to true.
///
/// An AND at the top level is null-rejecting for the union of its
/// arguments' variables. Below the top level (and for OR) only variables
/// rejected by every argument qualify. A strict operator or function is
/// null-rejecting for every variable appearing in its arguments.
pub fn find_nonnullable_vars(expr: &Expr) -> Vec<Var> {
    let mut vars = nonnullable_walk(expr, true);
    dedup_vars(&mut vars);
    vars
}

fn nonnullable_walk(expr: &Expr, top_level: bool) -> Vec<Var> {
    match expr {
        Expr::Var(v) if v.levels_up == 0 => vec![v.clone()],
        Expr::Op { op, args, .. } if op.strict => {
            args.iter().flat_map(|a| nonnullable_walk(a, false)).collect()
        }
        Expr::Func { func, args, .. } if func.strict => {
            args.iter().flat_map(|a| nonnullable_walk(a, false)).collect()
        }
        Expr::Bool {
            op: BoolOp::And,
            args,
        } if top_level => args.iter().flat_map(|a| nonnullable_walk(a, true)).collect(),
        Expr::Bool {
            op: BoolOp::And | BoolOp::Or,
            args,
        } => {
            let mut iter = args.iter();
            let Some(first) = iter.next() else {
                return Vec::new();
            };
            let mut result = nonnullable_walk(first, top_level);
            for arg in iter {
                let sub = nonnullable_walk(arg, top_level);
                result.retain(|v| sub.iter().any(|s| s.same_column(v)));
                if result.is_empty() {
                    break;
                }
            }
            result
        }
        Expr::Bool {
            op: BoolOp::Not,
            args,
        } => args.iter().flat_map(|a| nonnullable_walk(a, false)).collect(),
        Expr::NullTest {
            arg,
            is_null: false,
        } => nonnullable_walk(arg, false),
        _ => Vec::new(),
    }
}

fn dedup_vars(vars: &mut Vec<Var>) {
    let mut seen: Vec<Var> = Vec::with_capacity(vars.len());
    vars.retain(|v| {
        if seen.iter().any(|s| s.same_column(v)) {
            false
        } else {
            seen.push(v.clone());
            true
        }
    });
}

/// Does the expression contain anything that can yield a non-NULL result
/// from a NULL input (or vice versa)?
pub fn contains_nonstrict_functions(expr: &Expr) -> bool {
    expr.any(&|e| match e {
        Expr::Op { op, .. } => !op.strict,
        Expr::Func { func, .. } => !func.strict,
        Expr::Agg(_)
        | Expr::WindowFunc { .. }
        | Expr::Bool { .. }
        | Expr::Case { .. }
        | Expr::Coalesce { .. }
        | Expr::NullTest { .. }
        | Expr::SubLink(_) => true,
        Expr::Var(_) | Expr::Const { .. } => false,
    })
}

/// Does the expression call any function or operator that is not IMMUTABLE?
pub fn contains_mutable_functions(expr: &Expr) -> bool {
    expr.any(&|e| match e {
        Expr::Op { op, .. } => op.volatility != Volatility::Immutable,
        Expr::Func { func, .. } | Expr::WindowFunc { func, .. } => {
            func.volatility != Volatility::Immutable
        }
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ivm::test_helpers::*;

    fn names(vars: &[Var]) -> Vec<(usize, i32)> {
        let mut out: Vec<_> = vars.iter().map(|v| (v.rtindex, v.attno)).collect();
        out.sort();
        out
    }

    #[test]
    fn test_strict_comparison_rejects_both_sides() {
        let e = lt(int_var(0, 1, "a"), int_var(1, 1, "b"));
        assert_eq!(names(&find_nonnullable_vars(&e)), vec![(0, 1), (1, 1)]);
    }

    #[test]
    fn test_top_level_and_is_union() {
        let e = Expr::and(vec![
            lt(int_var(0, 1, "a"), lit("3")),
            Expr::is_not_null(int_var(1, 2, "b")),
        ]);
        assert_eq!(names(&find_nonnullable_vars(&e)), vec![(0, 1), (1, 2)]);
    }

    #[test]
    fn test_or_is_intersection() {
        let e = Expr::or(vec![
            lt(int_var(0, 1, "a"), lit("3")),
            lt(int_var(1, 2, "b"), lit("1")),
        ]);
        assert!(find_nonnullable_vars(&e).is_empty());

        let e = Expr::or(vec![
            lt(int_var(0, 1, "a"), lit("3")),
            Expr::and(vec![
                lt(int_var(0, 1, "a"), lit("9")),
                lt(int_var(1, 2, "b"), lit("1")),
            ]),
        ]);
        assert_eq!(names(&find_nonnullable_vars(&e)), vec![(0, 1)]);

        // Under NOT nothing is top-level any more.
        let e = Expr::not(Expr::and(vec![
            lt(int_var(0, 1, "a"), lit("9")),
            lt(int_var(1, 2, "b"), lit("1")),
        ]));
        assert!(find_nonnullable_vars(&e).is_empty());

        let e = Expr::or(vec![
            lt(int_var(0, 1, "a"), lit("3")),
            lt(plus(int_var(0, 1, "a"), int_var(1, 2, "b")), lit("1")),
        ]);
        assert_eq!(names(&find_nonnullable_vars(&e)), vec![(0, 1)]);
    }

    #[test]
    fn test_is_null_and_coalesce_reject_nothing() {
        let e = Expr::NullTest {
            arg: Box::new(int_var(0, 1, "a")),
            is_null: true,
        };
        assert!(find_nonnullable_vars(&e).is_empty());

        let e = Expr::eq(
            Expr::Coalesce {
                args: vec![int_var(1, 1, "b"), lit("0")],
            },
            lit("0"),
        );
        assert!(find_nonnullable_vars(&e).is_empty());
    }

    #[test]
    fn test_non_strict_function_breaks_rejection() {
        let e = Expr::eq(
            func_with("f", false, Volatility::Immutable, vec![int_var(0, 1, "a")]),
            lit("1"),
        );
        assert!(find_nonnullable_vars(&e).is_empty());
    }

    #[test]
    fn test_duplicates_removed() {
        let e = Expr::and(vec![
            lt(int_var(0, 1, "a"), lit("3")),
            lt(lit("0"), int_var(0, 1, "a")),
        ]);
        assert_eq!(find_nonnullable_vars(&e).len(), 1);
    }

    #[test]
    fn test_contains_nonstrict_functions() {
        assert!(!contains_nonstrict_functions(&plus(
            int_var(0, 1, "a"),
            lit("1")
        )));
        assert!(contains_nonstrict_functions(&Expr::Coalesce {
            args: vec![int_var(0, 1, "a"), lit("0")],
        }));
        assert!(contains_nonstrict_functions(&func_with(
            "g",
            false,
            Volatility::Immutable,
            vec![]
        )));
    }

    #[test]
    fn test_contains_mutable_functions() {
        let abs = func("abs", vec![int_var(0, 1, "a")]);
        assert!(!contains_mutable_functions(&abs));
        assert!(contains_mutable_functions(&func_with(
            "random",
            true,
            Volatility::Volatile,
            vec![]
        )));
        assert!(contains_mutable_functions(&func_with(
            "now",
            true,
            Volatility::Stable,
            vec![]
        )));
    }
}
