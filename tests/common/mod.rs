//! Shared builders for integration tests.
//!
//! Queries are built against a [`MemoryCatalog`] so that range-table
//! entries carry the OIDs the catalog assigned.

#![allow(dead_code)]

use pg_immv::catalog::{MemoryCatalog, Oid};
use pg_immv::error::ImmvError;
use pg_immv::ivm::query::*;
use pg_immv::ivm::rewrite::AugmentedQuery;

// ── Expressions ─────────────────────────────────────────────────────────

/// An int4 column of range entry `rtindex`.
pub fn col(rtindex: usize, attno: i32, name: &str) -> Expr {
    Expr::var(rtindex, attno, name, SqlType::Int4)
}

pub fn outer_col(rtindex: usize, attno: i32, name: &str, levels_up: u32) -> Expr {
    Expr::Var(Var {
        rtindex,
        attno,
        levels_up,
        name: name.to_string(),
        vartype: SqlType::Int4,
    })
}

pub fn int(value: i64) -> Expr {
    Expr::constant(&value.to_string(), SqlType::Int4)
}

pub fn gt(left: Expr, right: Expr) -> Expr {
    Expr::binary(Operator::plain(">"), left, right, SqlType::Bool)
}

pub fn plus(left: Expr, right: Expr) -> Expr {
    Expr::binary(Operator::plain("+"), left, right, SqlType::Int4)
}

pub fn is_null(arg: Expr) -> Expr {
    Expr::NullTest {
        arg: Box::new(arg),
        is_null: true,
    }
}

pub fn count_star() -> Expr {
    Expr::Agg(Aggref::count_star())
}

pub fn sum(arg: Expr) -> Expr {
    Expr::Agg(Aggref::call(AggFunc::Sum, arg, SqlType::Int4, SqlType::Int8))
}

pub fn avg(arg: Expr) -> Expr {
    Expr::Agg(Aggref::call(AggFunc::Avg, arg, SqlType::Int4, SqlType::Numeric))
}

pub fn target(expr: Expr, name: &str) -> TargetEntry {
    TargetEntry::new(expr, name)
}

// ── Range table ─────────────────────────────────────────────────────────

/// Reference to catalog table `name`.
pub fn table(catalog: &MemoryCatalog, name: &str) -> RangeEntry {
    let relid = catalog
        .relation_id(name)
        .unwrap_or_else(|| panic!("no table {name}"));
    RangeEntry::Relation(RelationRef {
        relid,
        name: name.to_string(),
        kind: RelKind::Ordinary,
        tablesample: false,
    })
}

pub fn subselect(alias: &str, query: DefiningQuery) -> RangeEntry {
    RangeEntry::Subquery {
        query: Box::new(query),
        alias: alias.to_string(),
        lateral: false,
    }
}

// ── Queries ─────────────────────────────────────────────────────────────

/// `SELECT targets FROM range_table...` with every entry a FROM item.
pub fn select(targets: Vec<TargetEntry>, range_table: Vec<RangeEntry>) -> DefiningQuery {
    let items = (0..range_table.len()).map(JoinNode::RangeRef).collect();
    DefiningQuery {
        target_list: targets,
        range_table,
        jointree: FromExpr { items, quals: None },
        ..Default::default()
    }
}

/// `SELECT targets FROM left <kind> JOIN right ON cond`.
///
/// Range entries are `[left, right, join]`; `left_cols`/`right_cols` give
/// the column names of each side, which make up the join result.
pub fn join(
    kind: JoinKind,
    left: RangeEntry,
    left_cols: &[&str],
    right: RangeEntry,
    right_cols: &[&str],
    cond: Expr,
    targets: Vec<TargetEntry>,
) -> DefiningQuery {
    let mut alias_vars = Vec::new();
    for (i, name) in left_cols.iter().enumerate() {
        alias_vars.push(col(0, i as i32 + 1, name));
    }
    for (i, name) in right_cols.iter().enumerate() {
        alias_vars.push(col(1, i as i32 + 1, name));
    }
    DefiningQuery {
        target_list: targets,
        range_table: vec![left, right, RangeEntry::JoinResult { kind, alias_vars }],
        jointree: FromExpr {
            items: vec![JoinNode::Join {
                kind,
                left: Box::new(JoinNode::RangeRef(0)),
                right: Box::new(JoinNode::RangeRef(1)),
                quals: Some(cond),
                rtindex: Some(2),
            }],
            quals: None,
        },
        ..Default::default()
    }
}

// ── Populate callbacks ──────────────────────────────────────────────────

pub fn no_rows(_: &mut MemoryCatalog, _: Oid, _: &AugmentedQuery) -> Result<u64, ImmvError> {
    Ok(0)
}

/// Catalog with `t(a, x)` (no key), `orders(id, customer, amount)` keyed
/// by `id`, and `customers(id, name)` keyed by `id`.
pub fn sample_catalog() -> MemoryCatalog {
    let mut catalog = MemoryCatalog::new();
    catalog.add_table("t", &["a", "x"]);
    let orders = catalog.add_table("orders", &["id", "customer", "amount"]);
    catalog
        .set_primary_key(orders, &["id"], false)
        .expect("orders key");
    let customers = catalog.add_table("customers", &["id", "name"]);
    catalog
        .set_primary_key(customers, &["id"], false)
        .expect("customers key");
    catalog
}
