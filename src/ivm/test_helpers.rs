//! Shared test helpers for IVM unit tests.
//!
//! Provides builders for query-tree nodes and a few canned queries. All
//! helpers are `#[cfg(test)]` and never touch PostgreSQL.

use crate::ivm::query::*;

// ── Expression builders ─────────────────────────────────────────────────

/// Build an int4 `Var` of the current query level.
pub fn int_var(rtindex: usize, attno: i32, name: &str) -> Expr {
    Expr::var(rtindex, attno, name, SqlType::Int4)
}

/// Build a `Var` that refers `levels_up` query levels out.
pub fn outer_var(rtindex: usize, attno: i32, name: &str, levels_up: u32) -> Expr {
    Expr::Var(Var {
        rtindex,
        attno,
        levels_up,
        name: name.to_string(),
        vartype: SqlType::Int4,
    })
}

pub fn lit(value: &str) -> Expr {
    Expr::constant(value, SqlType::Int4)
}

pub fn null_lit() -> Expr {
    Expr::Const {
        value: None,
        consttype: SqlType::Int4,
    }
}

/// `left < right`.
pub fn lt(left: Expr, right: Expr) -> Expr {
    Expr::binary(Operator::plain("<"), left, right, SqlType::Bool)
}

/// `left + right` over int4.
pub fn plus(left: Expr, right: Expr) -> Expr {
    Expr::binary(Operator::plain("+"), left, right, SqlType::Int4)
}

/// A strict, immutable function call returning int4.
pub fn func(name: &str, args: Vec<Expr>) -> Expr {
    Expr::Func {
        func: Function::immutable(name),
        args,
        result_type: SqlType::Int4,
    }
}

/// A function call with explicit strictness and volatility.
pub fn func_with(name: &str, strict: bool, volatility: Volatility, args: Vec<Expr>) -> Expr {
    Expr::Func {
        func: Function {
            name: name.to_string(),
            strict,
            volatility,
        },
        args,
        result_type: SqlType::Int4,
    }
}

// ── Aggregate builders ──────────────────────────────────────────────────

pub fn count_star() -> Expr {
    Expr::Agg(Aggref::count_star())
}

pub fn count_of(arg: Expr) -> Expr {
    let ty = arg.result_type();
    Expr::Agg(Aggref::call(AggFunc::Count, arg, ty, SqlType::Int8))
}

pub fn sum_of(arg: Expr) -> Expr {
    let ty = arg.result_type();
    let result = ty.sum_result();
    Expr::Agg(Aggref::call(AggFunc::Sum, arg, ty, result))
}

pub fn avg_of(arg: Expr) -> Expr {
    let ty = arg.result_type();
    Expr::Agg(Aggref::call(AggFunc::Avg, arg, ty, SqlType::Numeric))
}

pub fn min_of(arg: Expr) -> Expr {
    let ty = arg.result_type();
    Expr::Agg(Aggref::call(AggFunc::Min, arg, ty.clone(), ty))
}

pub fn max_of(arg: Expr) -> Expr {
    let ty = arg.result_type();
    Expr::Agg(Aggref::call(AggFunc::Max, arg, ty.clone(), ty))
}

// ── Range table builders ────────────────────────────────────────────────

/// An ordinary table reference.
pub fn relation(relid: u32, name: &str) -> RangeEntry {
    relation_of_kind(relid, name, RelKind::Ordinary)
}

pub fn relation_of_kind(relid: u32, name: &str, kind: RelKind) -> RangeEntry {
    RangeEntry::Relation(RelationRef {
        relid,
        name: name.to_string(),
        kind,
        tablesample: false,
    })
}

pub fn subquery(alias: &str, query: DefiningQuery) -> RangeEntry {
    RangeEntry::Subquery {
        query: Box::new(query),
        alias: alias.to_string(),
        lateral: false,
    }
}

pub fn te(expr: Expr, name: &str) -> TargetEntry {
    TargetEntry::new(expr, name)
}

// ── Query builders ──────────────────────────────────────────────────────

/// `SELECT targets FROM e0, e1, ...`: every range entry becomes a
/// top-level FROM item.
pub fn select(targets: Vec<TargetEntry>, range_table: Vec<RangeEntry>) -> DefiningQuery {
    let items = (0..range_table.len()).map(JoinNode::RangeRef).collect();
    DefiningQuery {
        target_list: targets,
        range_table,
        jointree: FromExpr { items, quals: None },
        ..Default::default()
    }
}

/// `select(...)` with a WHERE clause.
pub fn select_where(
    targets: Vec<TargetEntry>,
    range_table: Vec<RangeEntry>,
    quals: Expr,
) -> DefiningQuery {
    let mut q = select(targets, range_table);
    q.jointree.quals = Some(quals);
    q
}

/// `SELECT a, sum(x) AS total FROM t GROUP BY a` over relation 1
/// `t(a int4, x int4)`.
pub fn grouped_sum() -> DefiningQuery {
    let mut q = select(
        vec![
            te(int_var(0, 1, "a"), "a"),
            te(sum_of(int_var(0, 2, "x")), "total"),
        ],
        vec![relation(1, "t")],
    );
    q.group_clause = vec![0];
    q
}

/// `SELECT t1.a, t1.k AS k1, t2.k AS k2, t2.b
///  FROM t1 <kind> JOIN t2 ON t1.k = t2.k`
///
/// `t1(a, k)` is relation 1 and `t2(k, b)` is relation 2. Range entry 2
/// is the join result with columns `(a, k, k, b)`.
pub fn two_table_join(kind: JoinKind) -> DefiningQuery {
    let t1_a = int_var(0, 1, "a");
    let t1_k = int_var(0, 2, "k");
    let t2_k = int_var(1, 1, "k");
    let t2_b = int_var(1, 2, "b");
    let join_result = RangeEntry::JoinResult {
        kind,
        alias_vars: vec![t1_a.clone(), t1_k.clone(), t2_k.clone(), t2_b.clone()],
    };
    DefiningQuery {
        target_list: vec![
            te(t1_a, "a"),
            te(t1_k.clone(), "k1"),
            te(t2_k.clone(), "k2"),
            te(t2_b, "b"),
        ],
        range_table: vec![relation(1, "t1"), relation(2, "t2"), join_result],
        jointree: FromExpr {
            items: vec![JoinNode::Join {
                kind,
                left: Box::new(JoinNode::RangeRef(0)),
                right: Box::new(JoinNode::RangeRef(1)),
                quals: Some(Expr::eq(t1_k, t2_k)),
                rtindex: Some(2),
            }],
            quals: None,
        },
        ..Default::default()
    }
}

/// `SELECT count(*) FROM u WHERE u.x = <outer t.a>` for use under EXISTS.
/// The outer reference is range entry 0, attribute 1 of the enclosing query.
pub fn correlated_subselect(relid: u32, name: &str) -> DefiningQuery {
    select_where(
        vec![te(int_var(0, 1, "x"), "x")],
        vec![relation(relid, name)],
        Expr::eq(int_var(0, 1, "x"), outer_var(0, 1, "a", 1)),
    )
}
