//! Unique key selection and the automatic IMMV index.
//!
//! Delta application locates the view row affected by a change through a
//! unique index. The key is chosen from the original (non-augmented)
//! defining query, first applicable rule wins:
//!
//! 1. the GROUP BY columns;
//! 2. all output columns, under DISTINCT;
//! 3. the primary keys of the base relations, when every relation used in
//!    FROM has its whole key among the output columns.
//!
//! Rule 3 recurses through FROM sub-selects (CTEs are inlined first) and
//! fails closed: a relation without a usable primary key, or a key that is
//! only partly selected, yields no key at all. Without a key no index is
//! created and a notice suggests creating one manually.
//!
//! The index is unique, btree and NULLS NOT DISTINCT, so that concurrent
//! inserts of NULL keys cannot produce duplicate group rows.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::catalog::{Catalog, DependencyKind, IndexDef, Notice, ObjectAddress, Oid};
use crate::config::ImmvConfig;
use crate::error::ImmvError;
use crate::ivm::cte::inline_ctes;
use crate::ivm::query::{DefiningQuery, Distinct, Expr, RangeEntry};
use crate::ivm::rewrite::{MAX_IDENTIFIER_LEN, clip_to_char_boundary};

pub const DEFAULT_INDEX_METHOD: &str = "btree";

/// Where a unique key came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeySource {
    GroupBy,
    Distinct,
    InheritedPrimaryKey,
}

/// A set of output columns known to be unique in the view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniqueKeyCandidate {
    pub source: KeySource,
    /// Target-list positions, in index column order.
    pub positions: Vec<usize>,
    /// Primary-key constraints the key relies on (rule 3 only).
    pub constraints: Vec<Oid>,
}

/// Result of [`create_index_on_immv`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyOutcome {
    Created {
        index: Oid,
        name: String,
        candidate: UniqueKeyCandidate,
    },
    /// A compatible index already existed.
    Reused {
        index: Oid,
        candidate: UniqueKeyCandidate,
    },
    NotFound,
}

impl KeyOutcome {
    pub fn candidate(&self) -> Option<&UniqueKeyCandidate> {
        match self {
            KeyOutcome::Created { candidate, .. } | KeyOutcome::Reused { candidate, .. } => {
                Some(candidate)
            }
            KeyOutcome::NotFound => None,
        }
    }
}

/// Choose the unique key of a view defined by `query`.
pub fn find_unique_key<C: Catalog + ?Sized>(
    catalog: &C,
    query: &DefiningQuery,
    max_depth: usize,
) -> Result<Option<UniqueKeyCandidate>, ImmvError> {
    if !query.group_clause.is_empty() {
        return Ok(Some(UniqueKeyCandidate {
            source: KeySource::GroupBy,
            positions: query.group_clause.clone(),
            constraints: Vec::new(),
        }));
    }
    if query.distinct != Distinct::None {
        return Ok(Some(UniqueKeyCandidate {
            source: KeySource::Distinct,
            positions: query.visible_targets().map(|(i, _)| i).collect(),
            constraints: Vec::new(),
        }));
    }

    let inlined = inline_ctes(query, max_depth)?;
    let mut constraints = Vec::new();
    let key = primary_key_positions(catalog, &inlined, 0, max_depth, &mut constraints)?;
    Ok(key.map(|positions| UniqueKeyCandidate {
        source: KeySource::InheritedPrimaryKey,
        positions: positions.into_iter().collect(),
        constraints,
    }))
}

/// Output positions of `query` that together carry the primary keys of
/// every relation in its FROM clause, or `None`.
fn primary_key_positions<C: Catalog + ?Sized>(
    catalog: &C,
    query: &DefiningQuery,
    depth: usize,
    max_depth: usize,
    constraints: &mut Vec<Oid>,
) -> Result<Option<BTreeSet<usize>>, ImmvError> {
    if depth > max_depth {
        return Err(ImmvError::NestingTooDeep { limit: max_depth });
    }

    // Uncovered key attributes, per range entry.
    let mut uncovered: Vec<BTreeSet<i32>> = Vec::with_capacity(query.range_table.len());
    for rte in &query.range_table {
        let attnos = match rte {
            RangeEntry::Relation(rel) => match catalog.primary_key(rel.relid)? {
                Some(pk) if !pk.deferrable => {
                    constraints.push(pk.constraint);
                    pk.attnos.into_iter().collect()
                }
                _ => return Ok(None),
            },
            RangeEntry::Subquery { query: sub, .. } => {
                match primary_key_positions(catalog, sub, depth + 1, max_depth, constraints)? {
                    Some(positions) => positions.into_iter().map(|p| p as i32 + 1).collect(),
                    None => return Ok(None),
                }
            }
            _ => BTreeSet::new(),
        };
        uncovered.push(attnos);
    }

    let mut keys = BTreeSet::new();
    for (pos, target) in query.visible_targets() {
        let flattened = query.flatten_join_alias_vars(&target.expr)?;
        if let Expr::Var(v) = &flattened
            && v.levels_up == 0
            && let Some(attnos) = uncovered.get_mut(v.rtindex)
            && attnos.remove(&v.attno)
        {
            keys.insert(pos);
        }
    }

    for idx in query.jointree_leaves() {
        if matches!(query.rte(idx)?, RangeEntry::ExistsLowering { .. }) {
            continue;
        }
        if uncovered.get(idx).is_some_and(|a| !a.is_empty()) {
            return Ok(None);
        }
    }

    Ok((!keys.is_empty()).then_some(keys))
}

/// `<view><suffix>`, with the view name shortened to fit an identifier.
pub fn index_name(view_name: &str, suffix: &str) -> String {
    let avail = MAX_IDENTIFIER_LEN.saturating_sub(suffix.len());
    format!("{}{suffix}", clip_to_char_boundary(view_name, avail))
}

/// Select the unique key of `view` and make sure a matching unique index
/// exists on it.
pub fn create_index_on_immv<C: Catalog + ?Sized>(
    catalog: &mut C,
    query: &DefiningQuery,
    view: Oid,
    config: &ImmvConfig,
) -> Result<KeyOutcome, ImmvError> {
    let view_name = catalog.relation_name(view)?;

    let Some(candidate) = find_unique_key(catalog, query, config.max_nesting_depth)? else {
        catalog.notice(
            Notice::new(format!(
                "could not create an index on materialized view \"{view_name}\" automatically"
            ))
            .with_detail(
                "This target list does not have all the primary key columns, \
                 or this view does not contain GROUP BY or DISTINCT clause.",
            )
            .with_hint("Create an index on the materialized view for efficient incremental maintenance."),
        );
        return Ok(KeyOutcome::NotFound);
    };

    let view_columns = catalog.relation_columns(view)?;
    let mut attnos = Vec::with_capacity(candidate.positions.len());
    let mut columns = Vec::with_capacity(candidate.positions.len());
    for &pos in &candidate.positions {
        let ordinal = view_ordinal(query, pos)?;
        let name = view_columns.get(ordinal).ok_or_else(|| {
            ImmvError::InternalError(format!(
                "view \"{view_name}\" has no column at position {}",
                ordinal + 1
            ))
        })?;
        attnos.push(ordinal as i32 + 1);
        columns.push(name.clone());
    }

    for existing in catalog.indexes(view)? {
        if existing.unique
            && existing.access_method == DEFAULT_INDEX_METHOD
            && existing.columns == attnos
        {
            tracing::debug!(index = %existing.name, "reusing compatible index on IMMV");
            return Ok(KeyOutcome::Reused {
                index: existing.oid,
                candidate,
            });
        }
    }

    let name = index_name(&view_name, &config.index_name_suffix);
    let index = catalog.create_index(&IndexDef {
        relid: view,
        name: name.clone(),
        access_method: DEFAULT_INDEX_METHOD.to_string(),
        unique: true,
        nulls_not_distinct: true,
        columns,
    })?;
    catalog.notice(Notice::new(format!(
        "created index \"{name}\" on materialized view \"{view_name}\""
    )));

    // Dropping a base table's primary key drops the index with it.
    for &constraint in &candidate.constraints {
        catalog.record_dependency(
            ObjectAddress::index(index),
            ObjectAddress::constraint(constraint),
            DependencyKind::Normal,
        )?;
    }
    catalog.make_visible()?;

    Ok(KeyOutcome::Created {
        index,
        name,
        candidate,
    })
}

/// Column ordinal in the view relation of target-list position `pos`.
fn view_ordinal(query: &DefiningQuery, pos: usize) -> Result<usize, ImmvError> {
    match query.target_list.get(pos) {
        Some(t) if !t.junk => Ok(query.target_list[..pos].iter().filter(|t| !t.junk).count()),
        _ => Err(ImmvError::InternalError(format!(
            "key position {pos} is not an output column"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalog;
    use crate::ivm::query::*;
    use crate::ivm::test_helpers::*;

    /// `t(id, v)` with primary key `id`, and `u(k1, k2, w)` with key `(k1, k2)`.
    fn catalog() -> (MemoryCatalog, Oid, Oid) {
        let mut cat = MemoryCatalog::new();
        let t = cat.add_table("t", &["id", "v"]);
        cat.set_primary_key(t, &["id"], false).unwrap();
        let u = cat.add_table("u", &["k1", "k2", "w"]);
        cat.set_primary_key(u, &["k1", "k2"], false).unwrap();
        (cat, t, u)
    }

    fn view(cat: &mut MemoryCatalog, columns: &[&str]) -> Oid {
        cat.add_table("mv", columns)
    }

    #[test]
    fn test_group_by_wins() {
        let (cat, _, _) = catalog();
        let key = find_unique_key(&cat, &grouped_sum(), 100).unwrap().unwrap();
        assert_eq!(key.source, KeySource::GroupBy);
        assert_eq!(key.positions, vec![0]);
        assert!(key.constraints.is_empty());
    }

    #[test]
    fn test_distinct_uses_all_columns() {
        let (cat, t, _) = catalog();
        let mut q = select(
            vec![te(int_var(0, 2, "v"), "v"), te(int_var(0, 1, "id"), "id")],
            vec![relation(t, "t")],
        );
        q.distinct = Distinct::All;
        let key = find_unique_key(&cat, &q, 100).unwrap().unwrap();
        assert_eq!(key.source, KeySource::Distinct);
        assert_eq!(key.positions, vec![0, 1]);
    }

    #[test]
    fn test_primary_key_inherited() {
        let (cat, t, _) = catalog();
        let q = select(
            vec![te(int_var(0, 2, "v"), "v"), te(int_var(0, 1, "id"), "id")],
            vec![relation(t, "t")],
        );
        let key = find_unique_key(&cat, &q, 100).unwrap().unwrap();
        assert_eq!(key.source, KeySource::InheritedPrimaryKey);
        assert_eq!(key.positions, vec![1]);
        assert_eq!(key.constraints.len(), 1);
    }

    #[test]
    fn test_modified_key_column_is_not_a_key() {
        let (cat, t, _) = catalog();
        let q = select(
            vec![te(plus(int_var(0, 1, "id"), lit("1")), "id1")],
            vec![relation(t, "t")],
        );
        assert_eq!(find_unique_key(&cat, &q, 100).unwrap(), None);
    }

    #[test]
    fn test_partial_composite_key_is_not_a_key() {
        let (cat, _, u) = catalog();
        let q = select(vec![te(int_var(0, 1, "k1"), "k1")], vec![relation(u, "u")]);
        assert_eq!(find_unique_key(&cat, &q, 100).unwrap(), None);
    }

    #[test]
    fn test_relation_without_key_fails_everything() {
        let (mut cat, t, _) = catalog();
        let nokey = cat.add_table("n", &["x"]);
        let q = select(
            vec![te(int_var(0, 1, "id"), "id"), te(int_var(1, 1, "x"), "x")],
            vec![relation(t, "t"), relation(nokey, "n")],
        );
        assert_eq!(find_unique_key(&cat, &q, 100).unwrap(), None);
    }

    #[test]
    fn test_deferrable_key_is_ignored() {
        let mut cat = MemoryCatalog::new();
        let t = cat.add_table("t", &["id"]);
        cat.set_primary_key(t, &["id"], true).unwrap();
        let q = select(vec![te(int_var(0, 1, "id"), "id")], vec![relation(t, "t")]);
        assert_eq!(find_unique_key(&cat, &q, 100).unwrap(), None);
    }

    #[test]
    fn test_join_key_through_alias_vars() {
        let mut cat = MemoryCatalog::new();
        let t1 = cat.add_table("t1", &["a", "k"]);
        cat.set_primary_key(t1, &["a"], false).unwrap();
        let t2 = cat.add_table("t2", &["k", "b"]);
        cat.set_primary_key(t2, &["k"], false).unwrap();

        let mut q = two_table_join(JoinKind::Inner);
        for rte in &mut q.range_table {
            if let RangeEntry::Relation(r) = rte {
                r.relid = if r.relid == 1 { t1 } else { t2 };
            }
        }
        // Output the join-result columns instead of the base columns.
        q.target_list = vec![te(int_var(2, 1, "a"), "a"), te(int_var(2, 3, "k"), "k")];
        let key = find_unique_key(&cat, &q, 100).unwrap().unwrap();
        assert_eq!(key.positions, vec![0, 1]);
        assert_eq!(key.constraints.len(), 2);
    }

    #[test]
    fn test_subquery_key_propagates() {
        let (cat, t, _) = catalog();
        let inner = select(
            vec![te(int_var(0, 2, "v"), "v"), te(int_var(0, 1, "id"), "id")],
            vec![relation(t, "t")],
        );
        let outer = select(
            vec![te(int_var(0, 2, "id"), "id"), te(int_var(0, 1, "v"), "v")],
            vec![subquery("s", inner.clone())],
        );
        let key = find_unique_key(&cat, &outer, 100).unwrap().unwrap();
        assert_eq!(key.positions, vec![0]);

        // The outer query drops the sub-select's key column.
        let outer = select(vec![te(int_var(0, 1, "v"), "v")], vec![subquery("s", inner)]);
        assert_eq!(find_unique_key(&cat, &outer, 100).unwrap(), None);
    }

    #[test]
    fn test_cte_is_inlined_before_resolution() {
        let (cat, t, _) = catalog();
        let mut q = select(
            vec![te(int_var(0, 1, "id"), "id")],
            vec![RangeEntry::CteRef {
                name: "c".to_string(),
                levels_up: 0,
            }],
        );
        q.ctes.push(CommonTableExpr {
            name: "c".to_string(),
            query: select(vec![te(int_var(0, 1, "id"), "id")], vec![relation(t, "t")]),
        });
        let key = find_unique_key(&cat, &q, 100).unwrap().unwrap();
        assert_eq!(key.positions, vec![0]);
    }

    #[test]
    fn test_exists_lowering_entry_is_skipped() {
        let (cat, t, _) = catalog();
        let lowered = select(vec![te(count_star(), "count")], vec![relation(t, "t")]);
        let mut q = select(
            vec![te(int_var(0, 1, "id"), "id")],
            vec![
                relation(t, "t"),
                RangeEntry::ExistsLowering {
                    query: Box::new(lowered),
                    alias: "__ivm_exists_subquery_0".to_string(),
                },
            ],
        );
        q.jointree.items = vec![JoinNode::RangeRef(0), JoinNode::RangeRef(1)];
        let key = find_unique_key(&cat, &q, 100).unwrap().unwrap();
        assert_eq!(key.positions, vec![0]);
    }

    #[test]
    fn test_index_name_truncation() {
        assert_eq!(index_name("mv", "_index"), "mv_index");
        let long = "é".repeat(40);
        let name = index_name(&long, "_index");
        assert!(name.len() <= MAX_IDENTIFIER_LEN);
        assert!(name.ends_with("_index"));
    }

    #[test]
    fn test_create_index_then_reuse() {
        let (mut cat, t, _) = catalog();
        let mv = view(&mut cat, &["id", "v"]);
        let q = select(
            vec![te(int_var(0, 1, "id"), "id"), te(int_var(0, 2, "v"), "v")],
            vec![relation(t, "t")],
        );
        let config = ImmvConfig::default();

        let first = create_index_on_immv(&mut cat, &q, mv, &config).unwrap();
        let KeyOutcome::Created { index, name, .. } = &first else {
            panic!("expected a new index, got {first:?}");
        };
        assert_eq!(name, "mv_index");
        assert_eq!(
            cat.dependencies_of(ObjectAddress::index(*index))[0].kind,
            DependencyKind::Normal
        );
        assert_eq!(
            cat.notices().last().unwrap().message,
            "created index \"mv_index\" on materialized view \"mv\""
        );

        let second = create_index_on_immv(&mut cat, &q, mv, &config).unwrap();
        assert!(matches!(second, KeyOutcome::Reused { index: i, .. } if i == *index));
        assert_eq!(cat.index_count(), 1);
        assert_eq!(first.candidate(), second.candidate());
    }

    #[test]
    fn test_no_key_emits_notice() {
        let mut cat = MemoryCatalog::new();
        let t = cat.add_table("t", &["x"]);
        let mv = view(&mut cat, &["x"]);
        let q = select(vec![te(int_var(0, 1, "x"), "x")], vec![relation(t, "t")]);
        let outcome = create_index_on_immv(&mut cat, &q, mv, &ImmvConfig::default()).unwrap();
        assert_eq!(outcome, KeyOutcome::NotFound);
        assert_eq!(cat.index_count(), 0);
        let notice = cat.notices().last().unwrap();
        assert!(notice.message.starts_with("could not create an index"));
        assert!(notice.hint.is_some());
    }

    #[test]
    fn test_depth_guard() {
        let (cat, t, _) = catalog();
        let mut q = select(vec![te(int_var(0, 1, "id"), "id")], vec![relation(t, "t")]);
        for i in 0..5 {
            q = select(
                vec![te(int_var(0, 1, "id"), "id")],
                vec![subquery(&format!("s{i}"), q)],
            );
        }
        assert!(find_unique_key(&cat, &q, 10).unwrap().is_some());
        assert_eq!(
            find_unique_key(&cat, &q, 3).unwrap_err(),
            ImmvError::NestingTooDeep { limit: 3 }
        );
    }
}
