//! Query augmentation for incremental maintenance.
//!
//! [`augment`] takes a defining query that passed the restriction check
//! and returns a copy with hidden bookkeeping columns appended. The
//! maintenance runtime addresses these columns by position, so the layout
//! is fixed:
//!
//! 1. the original output columns, untouched;
//! 2. one `__ivm_exists_count_N__` per EXISTS predicate;
//! 3. per aggregate, `__ivm_count_<name>__` (all but `count`) and
//!    `__ivm_sum_<name>__` (`avg` only);
//! 4. `__ivm_count__` when the query has DISTINCT or aggregates.

use serde::{Deserialize, Serialize};

use crate::error::ImmvError;
use crate::ivm::query::{
    AggFunc, Aggref, DefiningQuery, Distinct, Expr, JoinNode, Operator, RangeEntry, SqlType,
    SubLinkKind, TargetEntry, Var,
};
use crate::ivm::restrict::top_level_conjuncts;

/// PostgreSQL identifier length limit (`NAMEDATALEN - 1`).
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Name of the trailing row-count column.
pub const ROW_COUNT_COLUMN: &str = "__ivm_count__";

// ── Layout ─────────────────────────────────────────────────────────────────

/// Kind of an appended bookkeeping column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookkeepingKind {
    ExistsCount,
    AggregateCount,
    AggregateSum,
    RowCount,
}

/// One appended column of an [`AugmentedQuery`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookkeepingColumn {
    /// Position in the augmented target list.
    pub position: usize,
    pub name: String,
    pub kind: BookkeepingKind,
}

/// A defining query together with the layout of its hidden columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AugmentedQuery {
    pub query: DefiningQuery,
    /// Number of target entries of the original query.
    pub original_len: usize,
    pub bookkeeping: Vec<BookkeepingColumn>,
}

impl AugmentedQuery {
    pub fn has_row_count(&self) -> bool {
        self.bookkeeping
            .last()
            .is_some_and(|c| c.kind == BookkeepingKind::RowCount)
    }

    fn push(&mut self, entry: TargetEntry, kind: BookkeepingKind) {
        self.bookkeeping.push(BookkeepingColumn {
            position: self.query.target_list.len(),
            name: entry.name.clone(),
            kind,
        });
        self.query.target_list.push(entry);
    }
}

// ── Naming ─────────────────────────────────────────────────────────────────

/// Build `name1[_name2][_label]`, shortening `name1`/`name2` (the longer
/// one first) until the result fits in an identifier. The label is never
/// truncated. Cuts happen on UTF-8 character boundaries.
pub fn make_object_name(name1: &str, name2: Option<&str>, label: Option<&str>) -> String {
    let overhead = name2.map_or(0, |_| 1) + label.map_or(0, |l| l.len() + 1);
    let avail = MAX_IDENTIFIER_LEN.saturating_sub(overhead);

    let mut len1 = name1.len();
    let mut len2 = name2.map_or(0, str::len);
    while len1 + len2 > avail {
        if len1 > len2 {
            len1 -= 1;
        } else {
            len2 -= 1;
        }
    }

    let mut name = clip_to_char_boundary(name1, len1).to_string();
    if let Some(n2) = name2 {
        name.push('_');
        name.push_str(clip_to_char_boundary(n2, len2));
    }
    if let Some(l) = label {
        name.push('_');
        name.push_str(l);
    }
    name
}

/// Longest prefix of `s` of at most `max` bytes ending on a char boundary.
pub fn clip_to_char_boundary(s: &str, max: usize) -> &str {
    let mut n = max.min(s.len());
    while !s.is_char_boundary(n) {
        n -= 1;
    }
    &s[..n]
}

fn aggregate_column_name(prefix: &str, output_name: &str) -> String {
    // Label "_" yields the trailing double underscore.
    make_object_name(prefix, Some(output_name), Some("_"))
}

fn exists_column_name(n: usize) -> String {
    format!("__ivm_exists_count_{n}__")
}

fn exists_alias(n: usize) -> String {
    format!("__ivm_exists_subquery_{n}")
}

// ── Augmentation ───────────────────────────────────────────────────────────

/// Append bookkeeping columns to an accepted defining query.
///
/// `column_names` are the view's declared column names, if any. Aggregate
/// helper columns take their base name from them.
pub fn augment(query: &DefiningQuery, column_names: &[String]) -> Result<AugmentedQuery, ImmvError> {
    let available = query.visible_len();
    if column_names.len() > available {
        return Err(ImmvError::TooManyColumnNames {
            specified: column_names.len(),
            available,
        });
    }

    let mut out = AugmentedQuery {
        query: query.clone(),
        original_len: query.target_list.len(),
        bookkeeping: Vec::new(),
    };

    if query.has_sublinks() {
        lower_exists_sublinks(&mut out)?;
    }

    normalize_distinct(&mut out.query)?;

    let has_aggs = query.has_aggs();
    if has_aggs {
        add_aggregate_columns(&mut out, column_names);
    }

    if has_aggs || out.query.distinct != Distinct::None {
        out.push(
            TargetEntry::bookkeeping(Expr::Agg(Aggref::count_star()), ROW_COUNT_COLUMN.to_string()),
            BookkeepingKind::RowCount,
        );
    }

    tracing::debug!(
        original = out.original_len,
        appended = out.bookkeeping.len(),
        "augmented defining query"
    );
    Ok(out)
}

/// Rewrite each top-level `EXISTS (sub)` of WHERE into a lateral
/// `(SELECT count(*) ... HAVING count(*) > 0)` in FROM, and expose the
/// count as a hidden output column.
fn lower_exists_sublinks(out: &mut AugmentedQuery) -> Result<(), ImmvError> {
    let Some(quals) = out.query.jointree.quals.take() else {
        return Ok(());
    };

    let mut remaining = Vec::new();
    let mut lowered = Vec::new();
    for conjunct in top_level_conjuncts(&quals) {
        match conjunct {
            Expr::SubLink(s) if s.kind == SubLinkKind::Exists => lowered.push(s.subselect.clone()),
            Expr::SubLink(_) => {
                return Err(ImmvError::InternalError(
                    "non-EXISTS sublink reached query augmentation".to_string(),
                ));
            }
            other => remaining.push(other.clone()),
        }
    }

    out.query.jointree.quals = match remaining.len() {
        0 => None,
        1 => remaining.pop(),
        _ => Some(Expr::and(remaining)),
    };

    for (n, mut sub) in lowered.into_iter().enumerate() {
        let column = exists_column_name(n);
        sub.target_list = vec![TargetEntry::new(
            Expr::Agg(Aggref::count_star()),
            &column,
        )];
        sub.having = Some(Expr::binary(
            Operator::plain(">"),
            Expr::Agg(Aggref::count_star()),
            Expr::constant("0", SqlType::Int8),
            SqlType::Bool,
        ));

        let rtindex = out.query.range_table.len();
        out.query.range_table.push(RangeEntry::ExistsLowering {
            query: sub,
            alias: exists_alias(n),
        });
        out.query.jointree.items.push(JoinNode::RangeRef(rtindex));

        let count_var = Expr::Var(Var {
            rtindex,
            attno: 1,
            levels_up: 0,
            name: column.clone(),
            vartype: SqlType::Int8,
        });
        out.push(
            TargetEntry::bookkeeping(count_var, column),
            BookkeepingKind::ExistsCount,
        );
    }
    Ok(())
}

/// `SELECT DISTINCT ...` without GROUP BY and aggregates becomes a GROUP BY
/// over every output column present at this point.
fn normalize_distinct(query: &mut DefiningQuery) -> Result<(), ImmvError> {
    if !query.group_clause.is_empty() {
        for &pos in &query.group_clause {
            match query.target_list.get(pos) {
                Some(t) if !t.junk => {}
                _ => {
                    return Err(ImmvError::InternalError(format!(
                        "GROUP BY item {pos} is not an output column"
                    )));
                }
            }
        }
        return Ok(());
    }
    if query.distinct != Distinct::None && !query.has_aggs() {
        query.group_clause = query.visible_targets().map(|(i, _)| i).collect();
    }
    Ok(())
}

fn add_aggregate_columns(out: &mut AugmentedQuery, column_names: &[String]) {
    let mut appended = Vec::new();
    for (i, entry) in out.query.target_list[..out.original_len].iter().enumerate() {
        let Expr::Agg(agg) = &entry.expr else {
            continue;
        };
        let output_name = column_names.get(i).unwrap_or(&entry.name);

        if !agg.func.is_count() {
            let count = Aggref {
                func: AggFunc::Count,
                result_type: SqlType::Int8,
                ..helper_aggregate(agg)
            };
            appended.push((
                TargetEntry::bookkeeping(
                    Expr::Agg(count),
                    aggregate_column_name("__ivm_count", output_name),
                ),
                BookkeepingKind::AggregateCount,
            ));
        }
        if agg.func == AggFunc::Avg {
            let arg_type = agg.arg_types.first().cloned().unwrap_or(SqlType::Numeric);
            let sum = Aggref {
                func: AggFunc::Sum,
                result_type: arg_type.sum_result(),
                ..helper_aggregate(agg)
            };
            appended.push((
                TargetEntry::bookkeeping(
                    Expr::Agg(sum),
                    aggregate_column_name("__ivm_sum", output_name),
                ),
                BookkeepingKind::AggregateSum,
            ));
        }
    }
    for (entry, kind) in appended {
        out.push(entry, kind);
    }
}

/// Same arguments as `agg`, none of its modifiers.
fn helper_aggregate(agg: &Aggref) -> Aggref {
    Aggref {
        func: agg.func.clone(),
        args: agg.args.clone(),
        arg_types: agg.arg_types.clone(),
        distinct: false,
        filter: None,
        order_by: Vec::new(),
        result_type: agg.result_type.clone(),
    }
}

// ── Stored definition ──────────────────────────────────────────────────────

/// The persisted form of an IMMV definition: the original (non-augmented)
/// query plus the declared column names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredDefinition {
    pub query: DefiningQuery,
    #[serde(default)]
    pub column_names: Vec<String>,
}

impl StoredDefinition {
    pub fn new(query: DefiningQuery, column_names: Vec<String>) -> Self {
        StoredDefinition {
            query,
            column_names,
        }
    }

    /// Re-derive the augmented query from the stored definition.
    pub fn augmented(&self) -> Result<AugmentedQuery, ImmvError> {
        augment(&self.query, &self.column_names)
    }

    pub fn to_json(&self) -> Result<String, ImmvError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, ImmvError> {
        Ok(serde_json::from_str(json)?)
    }
}
