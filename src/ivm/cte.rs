//! CTE inlining.
//!
//! Replaces every reference to a (non-recursive) CTE with a copy of its
//! body as a plain FROM sub-select, so later passes only have to deal with
//! sub-selects. The input is not modified.

use crate::error::ImmvError;
use crate::ivm::query::{DefiningQuery, Expr, RangeEntry, SubLink, Var};

/// CTE bodies visible at one query level, already inlined themselves.
type Scope = Vec<(String, DefiningQuery)>;

/// Return a copy of `query` with every CTE reference replaced by its body
/// and every `WITH` list removed.
pub fn inline_ctes(query: &DefiningQuery, max_depth: usize) -> Result<DefiningQuery, ImmvError> {
    let mut scopes: Vec<Scope> = Vec::new();
    inline_level(query, &mut scopes, 0, max_depth)
}

fn inline_level(
    query: &DefiningQuery,
    scopes: &mut Vec<Scope>,
    depth: usize,
    max_depth: usize,
) -> Result<DefiningQuery, ImmvError> {
    if depth > max_depth {
        return Err(ImmvError::NestingTooDeep { limit: max_depth });
    }

    // A CTE body is one level below the query that defines it and can see
    // the siblings defined before it.
    scopes.push(Vec::new());
    for cte in &query.ctes {
        let body = match inline_level(&cte.query, scopes, depth + 1, max_depth) {
            Ok(body) => body,
            Err(e) => {
                scopes.pop();
                return Err(e);
            }
        };
        if let Some(scope) = scopes.last_mut() {
            scope.push((cte.name.clone(), body));
        }
    }

    let result = inline_references(query, scopes, depth, max_depth);
    scopes.pop();
    result
}

fn inline_references(
    query: &DefiningQuery,
    scopes: &mut Vec<Scope>,
    depth: usize,
    max_depth: usize,
) -> Result<DefiningQuery, ImmvError> {
    let mut out = query.clone();
    out.ctes.clear();

    for rte in &mut out.range_table {
        match rte {
            RangeEntry::CteRef { name, levels_up } => {
                let body = lookup(scopes, name, *levels_up)?;
                *rte = RangeEntry::Subquery {
                    query: Box::new(body),
                    alias: name.clone(),
                    lateral: false,
                };
            }
            RangeEntry::Subquery { query: sub, .. }
            | RangeEntry::ExistsLowering { query: sub, .. } => {
                **sub = inline_level(sub, scopes, depth + 1, max_depth)?;
            }
            _ => {}
        }
    }

    out.map_expressions(&mut |e| inline_sublinks(e, scopes, depth, max_depth))?;
    Ok(out)
}

fn inline_sublinks(
    expr: &Expr,
    scopes: &mut Vec<Scope>,
    depth: usize,
    max_depth: usize,
) -> Result<Expr, ImmvError> {
    let mut failure = None;
    let out = expr.transform(&mut |e| {
        let Expr::SubLink(s) = e else {
            return None;
        };
        let test_expr = match &s.test_expr {
            Some(t) => match inline_sublinks(t, scopes, depth, max_depth) {
                Ok(t) => Some(Box::new(t)),
                Err(err) => {
                    failure.get_or_insert(err);
                    return Some(e.clone());
                }
            },
            None => None,
        };
        match inline_level(&s.subselect, scopes, depth + 1, max_depth) {
            Ok(sub) => Some(Expr::SubLink(SubLink {
                kind: s.kind,
                test_expr,
                subselect: Box::new(sub),
            })),
            Err(err) => {
                failure.get_or_insert(err);
                Some(e.clone())
            }
        }
    });
    match failure {
        Some(err) => Err(err),
        None => Ok(out),
    }
}

/// Find the body of CTE `name` defined `levels_up` levels out, adjusted for
/// its new position below the referencing query.
fn lookup(scopes: &[Scope], name: &str, levels_up: u32) -> Result<DefiningQuery, ImmvError> {
    let missing = || ImmvError::InternalError(format!("CTE \"{name}\" not found"));
    let index = scopes
        .len()
        .checked_sub(1 + levels_up as usize)
        .ok_or_else(missing)?;
    let (_, body) = scopes[index]
        .iter()
        .find(|(n, _)| n == name)
        .ok_or_else(missing)?;
    let mut body = body.clone();
    if levels_up > 0 {
        shift_outer_levels(&mut body, levels_up, 1)?;
    }
    Ok(body)
}

/// Add `delta` to every reference from inside `query` that points at a
/// query level at least `min_level` levels above it.
fn shift_outer_levels(
    query: &mut DefiningQuery,
    delta: u32,
    min_level: u32,
) -> Result<(), ImmvError> {
    query.map_expressions(&mut |e| shift_expr(e, delta, min_level))?;
    for rte in &mut query.range_table {
        match rte {
            RangeEntry::Subquery { query: sub, .. }
            | RangeEntry::ExistsLowering { query: sub, .. } => {
                shift_outer_levels(sub, delta, min_level + 1)?;
            }
            RangeEntry::CteRef { levels_up, .. } if *levels_up >= min_level => {
                *levels_up += delta;
            }
            _ => {}
        }
    }
    for cte in &mut query.ctes {
        shift_outer_levels(&mut cte.query, delta, min_level + 1)?;
    }
    Ok(())
}

fn shift_expr(expr: &Expr, delta: u32, min_level: u32) -> Result<Expr, ImmvError> {
    let mut failure = None;
    let shifted = expr.transform(&mut |e| match e {
        Expr::Var(v) if v.levels_up >= min_level => Some(Expr::Var(Var {
            levels_up: v.levels_up + delta,
            ..v.clone()
        })),
        Expr::SubLink(s) => {
            let mut subselect = s.subselect.clone();
            if let Err(err) = shift_outer_levels(&mut subselect, delta, min_level + 1) {
                failure.get_or_insert(err);
            }
            let test_expr = match s
                .test_expr
                .as_deref()
                .map(|t| shift_expr(t, delta, min_level))
                .transpose()
            {
                Ok(t) => t.map(Box::new),
                Err(err) => {
                    failure.get_or_insert(err);
                    None
                }
            };
            Some(Expr::SubLink(SubLink {
                kind: s.kind,
                test_expr,
                subselect,
            }))
        }
        _ => None,
    });
    match failure {
        Some(err) => Err(err),
        None => Ok(shifted),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ivm::query::*;
    use crate::ivm::test_helpers::*;

    fn cte_ref(name: &str, levels_up: u32) -> RangeEntry {
        RangeEntry::CteRef {
            name: name.to_string(),
            levels_up,
        }
    }

    fn body() -> DefiningQuery {
        select(
            vec![te(int_var(0, 1, "id"), "id"), te(int_var(0, 2, "v"), "v")],
            vec![relation(1, "t")],
        )
    }

    #[test]
    fn test_reference_replaced_by_body() {
        let mut q = select(vec![te(int_var(0, 1, "id"), "id")], vec![cte_ref("c", 0)]);
        q.ctes.push(CommonTableExpr {
            name: "c".to_string(),
            query: body(),
        });
        let inlined = inline_ctes(&q, 100).unwrap();
        assert!(inlined.ctes.is_empty());
        match &inlined.range_table[0] {
            RangeEntry::Subquery { query, alias, .. } => {
                assert_eq!(alias, "c");
                assert_eq!(**query, body());
            }
            other => panic!("expected subquery, got {other:?}"),
        }
        // input untouched
        assert_eq!(q.ctes.len(), 1);
    }

    #[test]
    fn test_every_use_site_gets_a_copy() {
        let mut q = select(
            vec![te(int_var(0, 1, "id"), "id")],
            vec![cte_ref("c", 0), cte_ref("c", 0)],
        );
        q.ctes.push(CommonTableExpr {
            name: "c".to_string(),
            query: body(),
        });
        let inlined = inline_ctes(&q, 100).unwrap();
        assert!(
            inlined
                .range_table
                .iter()
                .all(|r| matches!(r, RangeEntry::Subquery { .. }))
        );
    }

    #[test]
    fn test_sibling_reference_inside_cte_body() {
        let mut q = select(vec![te(int_var(0, 1, "id"), "id")], vec![cte_ref("d", 0)]);
        q.ctes.push(CommonTableExpr {
            name: "c".to_string(),
            query: body(),
        });
        q.ctes.push(CommonTableExpr {
            name: "d".to_string(),
            query: select(vec![te(int_var(0, 1, "id"), "id")], vec![cte_ref("c", 1)]),
        });
        let inlined = inline_ctes(&q, 100).unwrap();
        let RangeEntry::Subquery { query: d, .. } = &inlined.range_table[0] else {
            panic!("expected subquery");
        };
        let RangeEntry::Subquery { query: c, .. } = &d.range_table[0] else {
            panic!("expected nested subquery");
        };
        assert_eq!(**c, body());
    }

    #[test]
    fn test_reference_from_nested_subquery_shifts_outer_vars() {
        // The CTE body refers one level up; referenced from a sub-select it
        // ends up one level deeper.
        let correlated = select_where(
            vec![te(int_var(0, 1, "id"), "id")],
            vec![relation(1, "t")],
            Expr::eq(int_var(0, 1, "id"), outer_var(0, 1, "a", 1)),
        );
        let inner = select(vec![te(int_var(0, 1, "id"), "id")], vec![cte_ref("c", 1)]);
        let mut q = select(vec![te(int_var(0, 1, "id"), "id")], vec![subquery("s", inner)]);
        q.ctes.push(CommonTableExpr {
            name: "c".to_string(),
            query: correlated,
        });

        let inlined = inline_ctes(&q, 100).unwrap();
        let RangeEntry::Subquery { query: s, .. } = &inlined.range_table[0] else {
            panic!("expected subquery");
        };
        let RangeEntry::Subquery { query: c, .. } = &s.range_table[0] else {
            panic!("expected inlined CTE");
        };
        let quals = c.jointree.quals.as_ref().unwrap();
        let outer = vars_of_level(quals, 2);
        assert_eq!(outer.len(), 1);
        assert_eq!(outer[0].name, "a");
    }

    #[test]
    fn test_unknown_cte_is_internal_error() {
        let q = select(vec![te(int_var(0, 1, "id"), "id")], vec![cte_ref("nope", 0)]);
        assert!(matches!(inline_ctes(&q, 100), Err(ImmvError::InternalError(_))));
    }

    #[test]
    fn test_depth_guard() {
        let mut q = body();
        for i in 0..4 {
            let name = format!("c{i}");
            let mut outer = select(vec![te(int_var(0, 1, "id"), "id")], vec![cte_ref(&name, 0)]);
            outer.ctes.push(CommonTableExpr { name, query: q });
            q = outer;
        }
        assert!(inline_ctes(&q, 10).is_ok());
        assert_eq!(
            inline_ctes(&q, 2).unwrap_err(),
            ImmvError::NestingTooDeep { limit: 2 }
        );
    }
}
