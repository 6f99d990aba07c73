//! Property-based tests using proptest.
//!
//! Validates invariants of IMMV definition:
//! - Exactly six maintenance triggers per distinct base relation
//! - Augmentation only appends; original output columns are untouched
//! - The lock is weak only for a single direct base-relation reference
//! - Unique key selection is idempotent
//! - Derived identifiers fit PostgreSQL's identifier limit

mod common;

use common::*;
use pg_immv::catalog::Oid;
use pg_immv::index::{KeyOutcome, create_index_on_immv};
use pg_immv::ivm::query::*;
use pg_immv::ivm::restrict::check;
use pg_immv::ivm::rewrite::{MAX_IDENTIFIER_LEN, ROW_COUNT_COLUMN, augment, make_object_name};
use pg_immv::triggers::{LockStrength, lock_strength, plan_triggers};
use pg_immv::{CreateImmvStmt, ImmvConfig, MemoryCatalog, create_immv};
use proptest::prelude::*;

const DEPTH: usize = 100;
const TABLES: [&str; 4] = ["t1", "t2", "t3", "t4"];

fn catalog_with_tables() -> MemoryCatalog {
    let mut catalog = MemoryCatalog::new();
    for name in TABLES {
        let relid = catalog.add_table(name, &["id", "v"]);
        catalog
            .set_primary_key(relid, &["id"], false)
            .expect("primary key");
    }
    catalog
}

// ── Strategies ──────────────────────────────────────────────────────────

/// Non-empty FROM list as indexes into `TABLES`, repeats allowed.
fn arb_from_list() -> impl Strategy<Value = Vec<usize>> {
    prop::collection::vec(0..TABLES.len(), 1..6)
}

fn arb_aggregate() -> impl Strategy<Value = Expr> {
    prop_oneof![
        Just(count_star()),
        Just(Expr::Agg(Aggref::call(
            AggFunc::Count,
            col(0, 2, "v"),
            SqlType::Int4,
            SqlType::Int8
        ))),
        Just(sum(col(0, 2, "v"))),
        Just(avg(col(0, 2, "v"))),
        Just(Expr::Agg(Aggref::call(
            AggFunc::Min,
            col(0, 2, "v"),
            SqlType::Int4,
            SqlType::Int4
        ))),
        Just(Expr::Agg(Aggref::call(
            AggFunc::Max,
            col(0, 2, "v"),
            SqlType::Int4,
            SqlType::Int4
        ))),
    ]
}

/// `SELECT id, agg1, agg2, ... FROM t1 GROUP BY id`.
fn arb_grouped_query() -> impl Strategy<Value = DefiningQuery> {
    prop::collection::vec(arb_aggregate(), 1..5).prop_map(|aggs| {
        let catalog = catalog_with_tables();
        let mut targets = vec![target(col(0, 1, "id"), "id")];
        for (i, agg) in aggs.into_iter().enumerate() {
            targets.push(target(agg, &format!("agg{i}")));
        }
        let mut q = select(targets, vec![table(&catalog, "t1")]);
        q.group_clause = vec![0];
        q
    })
}

fn select_from(catalog: &MemoryCatalog, from: &[usize]) -> DefiningQuery {
    let range: Vec<RangeEntry> = from.iter().map(|&i| table(catalog, TABLES[i])).collect();
    let targets = (0..from.len())
        .map(|rt| target(col(rt, 1, "id"), &format!("id{rt}")))
        .collect();
    select(targets, range)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    // ── Trigger properties ──────────────────────────────────────────────

    /// Six triggers per distinct relation, no matter how often it repeats.
    #[test]
    fn prop_six_triggers_per_distinct_relation(from in arb_from_list()) {
        let catalog = catalog_with_tables();
        let q = select_from(&catalog, &from);
        let specs = plan_triggers(&q, 99_999, DEPTH).unwrap();

        let mut distinct = from.clone();
        distinct.sort_unstable();
        distinct.dedup();
        prop_assert_eq!(specs.len(), 6 * distinct.len());

        let mut names: Vec<(Oid, String)> = specs.iter().map(|s| (s.relid, s.name())).collect();
        names.sort();
        names.dedup();
        prop_assert_eq!(names.len(), specs.len());
    }

    /// Weak iff exactly one direct base-relation reference.
    #[test]
    fn prop_lock_rule(from in arb_from_list()) {
        let catalog = catalog_with_tables();
        let q = select_from(&catalog, &from);
        let expected = if from.len() == 1 { LockStrength::Weak } else { LockStrength::Exclusive };
        prop_assert_eq!(lock_strength(&q), expected);

        let specs = plan_triggers(&q, 99_999, DEPTH).unwrap();
        prop_assert!(specs.iter().all(|s| s.lock == expected));
    }

    // ── Augmentation properties ─────────────────────────────────────────

    /// Original entries come first and unchanged; bookkeeping entries
    /// follow in order, end with the row count and are all visible.
    #[test]
    fn prop_augmentation_is_append_only(q in arb_grouped_query()) {
        prop_assert!(check(&q, DEPTH).is_ok());
        let augmented = augment(&q, &[]).unwrap();

        prop_assert_eq!(augmented.original_len, q.target_list.len());
        prop_assert_eq!(&augmented.query.target_list[..q.target_list.len()], &q.target_list[..]);

        let positions: Vec<usize> = augmented.bookkeeping.iter().map(|c| c.position).collect();
        let expected: Vec<usize> = (q.target_list.len()..augmented.query.target_list.len()).collect();
        prop_assert_eq!(positions, expected);

        prop_assert!(augmented.has_row_count());
        prop_assert_eq!(
            augmented.bookkeeping.last().map(|c| c.name.as_str()),
            Some(ROW_COUNT_COLUMN)
        );
        prop_assert!(augmented.query.target_list.iter().all(|t| !t.junk));
    }

    /// Augmenting twice from the same input gives the same result.
    #[test]
    fn prop_augmentation_deterministic(q in arb_grouped_query()) {
        prop_assert_eq!(augment(&q, &[]).unwrap(), augment(&q, &[]).unwrap());
    }

    // ── Key selection properties ────────────────────────────────────────

    /// Running key selection again reuses the index it created.
    #[test]
    fn prop_key_selection_idempotent(from in arb_from_list()) {
        let mut catalog = catalog_with_tables();
        let q = select_from(&catalog, &from);
        let config = ImmvConfig::default();
        let created = create_immv(
            &mut catalog,
            &CreateImmvStmt::new("mv", q.clone()),
            &config,
            no_rows,
        )
        .unwrap();

        let first = match created.key {
            Some(KeyOutcome::Created { index, .. }) => index,
            other => return Err(TestCaseError::fail(format!("expected a new index, got {other:?}"))),
        };
        let before = catalog.index_count();

        let again = create_index_on_immv(&mut catalog, &q, created.view, &config).unwrap();
        prop_assert!(matches!(again, KeyOutcome::Reused { index, .. } if index == first), "expected reused index {first:?}, got {again:?}");
        prop_assert_eq!(catalog.index_count(), before);
    }

    // ── Naming properties ───────────────────────────────────────────────

    /// Derived names never exceed the identifier limit and keep the label.
    #[test]
    fn prop_object_name_fits(name1 in "\\PC{0,80}", name2 in "\\PC{0,80}") {
        let name = make_object_name(&name1, Some(&name2), Some("_"));
        prop_assert!(name.len() <= MAX_IDENTIFIER_LEN);
        prop_assert!(name.ends_with("__"));
    }
}
