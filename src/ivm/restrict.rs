//! Eligibility check for incrementally maintainable materialized views.
//!
//! [`RestrictionChecker::check`] walks the whole defining query, nested
//! sub-selects and CTE bodies included, and stops at the first construct
//! that cannot be maintained incrementally. It never touches the catalog,
//! so callers run it to completion before creating anything.
//!
//! Per query level the walk goes: clause-level rejections, range table,
//! GROUP BY and target list, join tree, expressions (which descend into
//! EXISTS bodies), nested FROM sub-selects, CTE bodies and finally, at the
//! outermost level only, the EXISTS and outer-join consistency checks that
//! need everything collected below.

use crate::error::ImmvError;
use crate::ivm::nullability::{
    contains_mutable_functions, contains_nonstrict_functions, find_nonnullable_vars,
};
use crate::ivm::query::{
    AggFunc, Aggref, BoolOp, DefiningQuery, Distinct, Expr, JoinNode, RangeEntry, RelKind,
    SqlType, SubLink, SubLinkKind, Var, is_ivm_name, vars_of_level,
};

/// Suffix shared by every eligibility error message.
const NOT_SUPPORTED: &str = "is not supported on incrementally maintainable materialized view";

/// Message used for context-dependent rejections; the hint carries the detail.
const NOT_ALLOWED: &str = "this query is not allowed on incrementally maintainable materialized view";

// ── Restriction categories ──────────────────────────────────────────────────

/// Why a defining query is not eligible for incremental maintenance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Restriction {
    // Clause-level
    Having,
    OrderBy,
    LimitOffset,
    DistinctOn,
    WindowFunction,
    GroupingSets,
    SetOperation,
    EmptyTargetList,
    RowLocking,
    RecursiveCte,
    SystemColumn,
    MutableFunction,
    GroupByNotInTargetList,

    // Range table
    TableSample,
    PartitionedTable,
    Partition,
    InheritanceParent,
    ForeignTable,
    ViewSource,
    ValuesList,

    // Naming
    ReservedCteName(String),
    ReservedColumnName(String),

    // Nesting
    NestedDistinct,
    NestedAggregate,
    NestedSublink,
    NonExistsSublink,
    ExistsPlacement,
    SubqueryInTargetList,
    ExistsVarsNotInTargetList,
    ExistsWithAggregate,

    // Outer joins
    SubqueryWithOuterJoin,
    AggregateWithOuterJoin,
    ExistsWithOuterJoin,
    NonEquijoinWithOuterJoin,
    JoinVarsNotInTargetList,
    NullableWherePredicate,
    NonStrictTargetWithOuterJoin,

    // Aggregates
    UnsupportedAggregate(String),
    AggregateFilter,
    AggregateDistinct,
    AggregateOrderBy,
    AggregateInExpression,
}

impl Restriction {
    /// Human-readable error message.
    pub fn message(&self) -> String {
        let subject = match self {
            Restriction::Having => "HAVING clause",
            Restriction::OrderBy => "ORDER BY clause",
            Restriction::LimitOffset => "LIMIT/OFFSET clause",
            Restriction::DistinctOn => "DISTINCT ON",
            Restriction::WindowFunction => {
                return "window functions are not supported on incrementally maintainable materialized view".to_string();
            }
            Restriction::GroupingSets => "GROUPING SETS, ROLLUP, or CUBE clauses",
            Restriction::SetOperation => {
                return "UNION/INTERSECT/EXCEPT statements are not supported on incrementally maintainable materialized view".to_string();
            }
            Restriction::EmptyTargetList => "empty target list",
            Restriction::RowLocking => "FOR UPDATE/SHARE clause",
            Restriction::RecursiveCte => "recursive CTE",
            Restriction::SystemColumn => "system column",
            Restriction::MutableFunction => "mutable function",
            Restriction::GroupByNotInTargetList => {
                "GROUP BY expression not appearing in select list"
            }
            Restriction::TableSample => "TABLESAMPLE clause",
            Restriction::PartitionedTable => "partitioned table",
            Restriction::Partition => "partitions",
            Restriction::InheritanceParent => "inheritance parent",
            Restriction::ForeignTable => "foreign table",
            Restriction::ViewSource => "VIEW or MATERIALIZED VIEW",
            Restriction::ValuesList => "VALUES",
            Restriction::ReservedCteName(name) => {
                return format!("CTE name {name} {NOT_SUPPORTED}");
            }
            Restriction::ReservedColumnName(name) => {
                return format!("column name {name} {NOT_SUPPORTED}");
            }
            Restriction::NestedDistinct => {
                return "DISTINCT clause in nested query are not supported on incrementally maintainable materialized view".to_string();
            }
            Restriction::NestedAggregate => {
                return "aggregate functions in nested query are not supported on incrementally maintainable materialized view".to_string();
            }
            Restriction::NestedSublink => "nested subquery",
            Restriction::UnsupportedAggregate(name) => {
                return format!("aggregate function {name} {NOT_SUPPORTED}");
            }
            Restriction::AggregateFilter => "aggregate function with FILTER clause",
            Restriction::AggregateDistinct => "aggregate function with DISTINCT arguments",
            Restriction::AggregateOrderBy => "aggregate function with ORDER clause",
            Restriction::AggregateInExpression => "expression containing an aggregate in it",
            Restriction::NonExistsSublink
            | Restriction::ExistsPlacement
            | Restriction::SubqueryInTargetList
            | Restriction::ExistsVarsNotInTargetList
            | Restriction::ExistsWithAggregate
            | Restriction::SubqueryWithOuterJoin
            | Restriction::AggregateWithOuterJoin
            | Restriction::ExistsWithOuterJoin
            | Restriction::NonEquijoinWithOuterJoin
            | Restriction::JoinVarsNotInTargetList
            | Restriction::NullableWherePredicate
            | Restriction::NonStrictTargetWithOuterJoin => return NOT_ALLOWED.to_string(),
        };
        format!("{subject} {NOT_SUPPORTED}")
    }

    /// Remediation hint, if the category has one.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Restriction::MutableFunction => Some("functions must be marked IMMUTABLE"),
            Restriction::NonExistsSublink => {
                Some("subquery in WHERE clause only supports subquery with EXISTS clause")
            }
            Restriction::ExistsPlacement => {
                Some("EXISTS subquery is only supported as a top-level AND condition of WHERE")
            }
            Restriction::SubqueryInTargetList => Some("subquery is not supported in targetlist"),
            Restriction::ExistsVarsNotInTargetList => {
                Some("targetlist must contain vars that are referred to in EXISTS subquery")
            }
            Restriction::ExistsWithAggregate => {
                Some("EXISTS subquery is not supported with aggregate")
            }
            Restriction::SubqueryWithOuterJoin => {
                Some("subquery or CTE is not supported with outer join")
            }
            Restriction::AggregateWithOuterJoin => Some("aggregate is not supported with outer join"),
            Restriction::ExistsWithOuterJoin => Some("subquery with outer join is not supported"),
            Restriction::NonEquijoinWithOuterJoin => {
                Some("Only simple equijoin is supported with outer join")
            }
            Restriction::JoinVarsNotInTargetList => {
                Some("targetlist must contain vars in the join condition with outer join")
            }
            Restriction::NullableWherePredicate => {
                Some("WHERE cannot contain non null-rejecting predicates with outer join")
            }
            Restriction::NonStrictTargetWithOuterJoin => {
                Some("targetlist cannot contain non strict functions with outer join")
            }
            _ => None,
        }
    }
}

// ── Traversal context ───────────────────────────────────────────────────────

/// State threaded through the walk.
///
/// `depth`, `in_exists` and the outer-join state are scoped: they are saved
/// before entering a nested query and restored afterwards. The other flags
/// and lists accumulate over the whole walk.
#[derive(Debug, Clone, Default)]
pub struct RestrictionContext {
    /// Nesting depth of the query being checked (0 = outermost).
    pub depth: usize,
    /// Currently inside an EXISTS body.
    pub in_exists: bool,
    pub has_agg: bool,
    /// The query level being checked has an outer join.
    pub has_outerjoin: bool,
    pub has_subquery: bool,
    /// Conditions of the outer joins of the query level being checked.
    pub join_quals: Vec<Expr>,
    /// Outer-query variables referenced from EXISTS bodies.
    pub exists_vars: Vec<Var>,
}

impl RestrictionContext {
    /// Run `f` one nesting level deeper, restoring the scoped fields after.
    fn nested<T>(
        &mut self,
        in_exists: bool,
        f: impl FnOnce(&mut Self) -> Result<T, ImmvError>,
    ) -> Result<T, ImmvError> {
        let saved = (
            self.depth,
            self.in_exists,
            std::mem::take(&mut self.has_outerjoin),
            std::mem::take(&mut self.join_quals),
        );
        self.depth += 1;
        self.in_exists = in_exists;
        let result = f(self);
        (self.depth, self.in_exists, self.has_outerjoin, self.join_quals) = saved;
        result
    }
}

// ── Checker ─────────────────────────────────────────────────────────────────

/// Validates defining queries. Holds only the depth guard.
#[derive(Debug, Clone, Copy)]
pub struct RestrictionChecker {
    max_depth: usize,
}

impl RestrictionChecker {
    pub fn new(max_depth: usize) -> Self {
        RestrictionChecker { max_depth }
    }

    /// Accept `query` or report the first restriction it violates.
    pub fn check(&self, query: &DefiningQuery) -> Result<(), ImmvError> {
        let mut ctx = RestrictionContext::default();
        self.check_query(query, &mut ctx)?;
        tracing::debug!(
            has_agg = ctx.has_agg,
            has_outerjoin = ctx.has_outerjoin,
            exists_vars = ctx.exists_vars.len(),
            "defining query accepted for incremental maintenance"
        );
        Ok(())
    }

    fn check_query(
        &self,
        query: &DefiningQuery,
        ctx: &mut RestrictionContext,
    ) -> Result<(), ImmvError> {
        if ctx.depth > self.max_depth {
            return Err(ImmvError::NestingTooDeep {
                limit: self.max_depth,
            });
        }
        self.check_tree_height(query, ctx)?;

        check_clauses(query)?;

        if ctx.depth > 0 && query.distinct != Distinct::None {
            return Err(Restriction::NestedDistinct.into());
        }
        let has_aggs = query.has_aggs();
        if ctx.depth > 0 && has_aggs {
            return Err(Restriction::NestedAggregate.into());
        }
        ctx.has_agg |= has_aggs;

        check_range_table(query, ctx)?;
        check_group_clause(query)?;
        check_target_list(query, ctx)?;

        for item in &query.jointree.items {
            self.check_join_node(item, ctx)?;
        }

        for entry in &query.target_list {
            self.check_expr(&entry.expr, ctx, false)?;
        }
        for qual in join_conditions(&query.jointree.items) {
            self.check_expr(qual, ctx, false)?;
        }
        if let Some(quals) = &query.jointree.quals {
            for conjunct in top_level_conjuncts(quals) {
                self.check_expr(conjunct, ctx, true)?;
            }
        }

        for rte in &query.range_table {
            if let RangeEntry::Subquery { query: sub, .. } = rte {
                ctx.nested(ctx.in_exists, |ctx| self.check_query(sub, ctx))?;
            }
        }

        for cte in &query.ctes {
            if is_ivm_name(&cte.name) {
                return Err(Restriction::ReservedCteName(cte.name.clone()).into());
            }
            ctx.nested(ctx.in_exists, |ctx| self.check_query(&cte.query, ctx))?;
        }

        if ctx.depth == 0 {
            check_exists_vars(query, ctx)?;
        }
        if ctx.has_outerjoin {
            check_outer_join(query, ctx)?;
        }
        Ok(())
    }

    /// Reject join trees and expressions nested past the limit before any
    /// recursive walk over them. Join levels add to the query depth, the
    /// same accounting trigger planning uses.
    fn check_tree_height(
        &self,
        query: &DefiningQuery,
        ctx: &RestrictionContext,
    ) -> Result<(), ImmvError> {
        let too_deep = || ImmvError::NestingTooDeep {
            limit: self.max_depth,
        };
        if query
            .jointree
            .items
            .iter()
            .any(|item| ctx.depth + item.height() > self.max_depth)
        {
            return Err(too_deep());
        }
        let join_aliases = query.range_table.iter().filter_map(|rte| match rte {
            RangeEntry::JoinResult { alias_vars, .. } => Some(alias_vars.iter()),
            _ => None,
        });
        if query
            .expressions()
            .into_iter()
            .chain(join_aliases.flatten())
            .any(|e| e.height() > self.max_depth)
        {
            return Err(too_deep());
        }
        Ok(())
    }

    fn check_join_node(&self, node: &JoinNode, ctx: &mut RestrictionContext) -> Result<(), ImmvError> {
        let JoinNode::Join {
            kind,
            left,
            right,
            quals,
            ..
        } = node
        else {
            return Ok(());
        };
        if kind.is_outer() {
            if ctx.in_exists {
                return Err(Restriction::ExistsWithOuterJoin.into());
            }
            if ctx.has_subquery {
                return Err(Restriction::SubqueryWithOuterJoin.into());
            }
            if ctx.has_agg {
                return Err(Restriction::AggregateWithOuterJoin.into());
            }
            ctx.has_outerjoin = true;
            if let Some(q) = quals {
                ctx.join_quals.push(q.clone());
            }
        }
        self.check_join_node(left, ctx)?;
        self.check_join_node(right, ctx)
    }

    /// Walk one expression of the current level. `exists_allowed` is true
    /// only for a top-level AND conjunct of WHERE.
    fn check_expr(
        &self,
        expr: &Expr,
        ctx: &mut RestrictionContext,
        exists_allowed: bool,
    ) -> Result<(), ImmvError> {
        match expr {
            Expr::Var(v) => {
                if ctx.in_exists && v.levels_up > 0 && v.levels_up as usize == ctx.depth {
                    ctx.exists_vars.push(v.clone());
                }
                Ok(())
            }
            Expr::SubLink(sublink) => self.check_sublink(sublink, ctx, exists_allowed),
            Expr::Agg(agg) => {
                check_aggregate(agg)?;
                for child in expr.children() {
                    self.check_expr(child, ctx, false)?;
                }
                Ok(())
            }
            _ => {
                for child in expr.children() {
                    self.check_expr(child, ctx, false)?;
                }
                Ok(())
            }
        }
    }

    fn check_sublink(
        &self,
        sublink: &SubLink,
        ctx: &mut RestrictionContext,
        exists_allowed: bool,
    ) -> Result<(), ImmvError> {
        if sublink.kind != SubLinkKind::Exists {
            return Err(Restriction::NonExistsSublink.into());
        }
        if ctx.depth > 0 {
            return Err(Restriction::NestedSublink.into());
        }
        if ctx.has_outerjoin {
            return Err(Restriction::ExistsWithOuterJoin.into());
        }
        if ctx.has_agg {
            return Err(Restriction::ExistsWithAggregate.into());
        }
        if !exists_allowed {
            return Err(Restriction::ExistsPlacement.into());
        }
        ctx.nested(true, |ctx| self.check_query(&sublink.subselect, ctx))
    }
}

/// Check with the given depth guard.
pub fn check(query: &DefiningQuery, max_depth: usize) -> Result<(), ImmvError> {
    RestrictionChecker::new(max_depth).check(query)
}

// ── Per-level checks ────────────────────────────────────────────────────────

fn check_clauses(query: &DefiningQuery) -> Result<(), ImmvError> {
    let restriction = if query.having.is_some() {
        Some(Restriction::Having)
    } else if !query.sort_clause.is_empty() {
        Some(Restriction::OrderBy)
    } else if query.limit_count.is_some() || query.limit_offset.is_some() {
        Some(Restriction::LimitOffset)
    } else if matches!(query.distinct, Distinct::On(_)) {
        Some(Restriction::DistinctOn)
    } else if query.has_window_funcs() {
        Some(Restriction::WindowFunction)
    } else if query.has_grouping_sets {
        Some(Restriction::GroupingSets)
    } else if query.set_operation.is_some() {
        Some(Restriction::SetOperation)
    } else if query.target_list.is_empty() {
        Some(Restriction::EmptyTargetList)
    } else if query.row_lock.is_some() {
        Some(Restriction::RowLocking)
    } else if query.has_recursive {
        Some(Restriction::RecursiveCte)
    } else if has_system_column(query) {
        Some(Restriction::SystemColumn)
    } else if query
        .expressions()
        .into_iter()
        .any(contains_mutable_functions)
    {
        Some(Restriction::MutableFunction)
    } else {
        None
    };
    match restriction {
        Some(r) => Err(r.into()),
        None => Ok(()),
    }
}

fn has_system_column(query: &DefiningQuery) -> bool {
    let join_aliases = query.range_table.iter().filter_map(|rte| match rte {
        RangeEntry::JoinResult { alias_vars, .. } => Some(alias_vars.iter()),
        _ => None,
    });
    query
        .expressions()
        .into_iter()
        .chain(join_aliases.flatten())
        .flat_map(|e| vars_of_level(e, 0))
        .any(|v| v.is_system_column())
}

fn check_range_table(query: &DefiningQuery, ctx: &mut RestrictionContext) -> Result<(), ImmvError> {
    for rte in &query.range_table {
        match rte {
            RangeEntry::Relation(rel) => {
                if rel.tablesample {
                    return Err(Restriction::TableSample.into());
                }
                let restriction = match rel.kind {
                    RelKind::Ordinary => None,
                    RelKind::Partitioned => Some(Restriction::PartitionedTable),
                    RelKind::Partition => Some(Restriction::Partition),
                    RelKind::InheritanceParent => Some(Restriction::InheritanceParent),
                    RelKind::Foreign => Some(Restriction::ForeignTable),
                    RelKind::View | RelKind::MaterializedView => Some(Restriction::ViewSource),
                };
                if let Some(r) = restriction {
                    return Err(r.into());
                }
            }
            RangeEntry::Values { .. } => return Err(Restriction::ValuesList.into()),
            RangeEntry::Subquery { .. } | RangeEntry::CteRef { .. } => {
                if ctx.has_outerjoin {
                    return Err(Restriction::SubqueryWithOuterJoin.into());
                }
                ctx.has_subquery = true;
            }
            RangeEntry::ExistsLowering { alias, .. } => {
                return Err(ImmvError::InternalError(format!(
                    "unexpected EXISTS lowering entry \"{alias}\" in a defining query"
                )));
            }
            RangeEntry::JoinResult { .. } | RangeEntry::Function { .. } => {}
        }
    }
    Ok(())
}

fn check_group_clause(query: &DefiningQuery) -> Result<(), ImmvError> {
    for &pos in &query.group_clause {
        let entry = query.target_list.get(pos).ok_or_else(|| {
            ImmvError::InternalError(format!("GROUP BY refers to missing target entry {pos}"))
        })?;
        if entry.junk {
            return Err(Restriction::GroupByNotInTargetList.into());
        }
    }
    Ok(())
}

fn check_target_list(query: &DefiningQuery, ctx: &RestrictionContext) -> Result<(), ImmvError> {
    for entry in &query.target_list {
        if is_ivm_name(&entry.name) {
            return Err(Restriction::ReservedColumnName(entry.name.clone()).into());
        }
        if ctx.has_agg && !matches!(entry.expr, Expr::Agg(_)) && entry.expr.contains_agg() {
            return Err(Restriction::AggregateInExpression.into());
        }
        if entry.expr.contains_sublink() {
            return Err(Restriction::SubqueryInTargetList.into());
        }
    }
    Ok(())
}

fn check_aggregate(agg: &Aggref) -> Result<(), ImmvError> {
    if agg.filter.is_some() {
        return Err(Restriction::AggregateFilter.into());
    }
    if agg.distinct {
        return Err(Restriction::AggregateDistinct.into());
    }
    if !agg.order_by.is_empty() {
        return Err(Restriction::AggregateOrderBy.into());
    }
    if !aggregate_supported(agg) {
        let args = agg
            .arg_types
            .iter()
            .map(SqlType::sql_name)
            .collect::<Vec<_>>()
            .join(",");
        return Err(
            Restriction::UnsupportedAggregate(format!("{}({args})", agg.func.sql_name())).into(),
        );
    }
    Ok(())
}

/// Aggregates whose delta can be computed from per-group counts and sums.
fn aggregate_supported(agg: &Aggref) -> bool {
    let arg = agg.arg_types.first();
    match agg.func {
        AggFunc::Count | AggFunc::CountStar => true,
        AggFunc::Sum => matches!(
            arg,
            Some(
                SqlType::Int8
                    | SqlType::Int4
                    | SqlType::Int2
                    | SqlType::Float4
                    | SqlType::Float8
                    | SqlType::Money
                    | SqlType::Interval
                    | SqlType::Numeric
            )
        ),
        AggFunc::Avg => matches!(
            arg,
            Some(
                SqlType::Int8
                    | SqlType::Int4
                    | SqlType::Int2
                    | SqlType::Numeric
                    | SqlType::Float4
                    | SqlType::Float8
                    | SqlType::Interval
            )
        ),
        AggFunc::Min | AggFunc::Max => matches!(
            arg,
            Some(
                SqlType::Array(_)
                    | SqlType::Int8
                    | SqlType::Int4
                    | SqlType::Int2
                    | SqlType::Oid
                    | SqlType::Float4
                    | SqlType::Float8
                    | SqlType::Date
                    | SqlType::Time
                    | SqlType::TimeTz
                    | SqlType::Money
                    | SqlType::Timestamp
                    | SqlType::TimestampTz
                    | SqlType::Interval
                    | SqlType::Text
                    | SqlType::Numeric
                    | SqlType::Bpchar
                    | SqlType::Tid
                    | SqlType::Enum(_)
                    | SqlType::Inet
                    | SqlType::PgLsn
            )
        ),
        AggFunc::Other(_) => false,
    }
}

// ── Outermost-level checks ──────────────────────────────────────────────────

/// Every outer variable an EXISTS body refers to must be a plain output column.
fn check_exists_vars(query: &DefiningQuery, ctx: &RestrictionContext) -> Result<(), ImmvError> {
    for var in &ctx.exists_vars {
        let found = query
            .target_list
            .iter()
            .filter_map(|t| t.expr.as_var())
            .any(|tv| tv.same_column(var));
        if !found {
            return Err(Restriction::ExistsVarsNotInTargetList.into());
        }
    }
    Ok(())
}

fn check_outer_join(query: &DefiningQuery, ctx: &RestrictionContext) -> Result<(), ImmvError> {
    let mut qual_vars: Vec<Var> = Vec::new();
    for qual in &ctx.join_quals {
        let flattened = query.flatten_join_alias_vars(qual)?;
        if !is_equijoin_condition(&flattened) {
            return Err(Restriction::NonEquijoinWithOuterJoin.into());
        }
        qual_vars.extend(vars_of_level(&flattened, 0));
    }

    let mut target_vars: Vec<Var> = Vec::new();
    for entry in &query.target_list {
        if let Expr::Var(_) = entry.expr
            && let Expr::Var(v) = query.flatten_join_alias_vars(&entry.expr)?
        {
            target_vars.push(v);
        }
    }
    if qual_vars
        .iter()
        .any(|qv| !target_vars.iter().any(|tv| tv.same_column(qv)))
    {
        return Err(Restriction::JoinVarsNotInTargetList.into());
    }

    if let Some(quals) = &query.jointree.quals {
        let flattened = query.flatten_join_alias_vars(quals)?;
        let nonnullable = find_nonnullable_vars(&flattened);
        let where_vars = vars_of_level(&flattened, 0);
        if where_vars
            .iter()
            .any(|wv| !nonnullable.iter().any(|nv| nv.same_column(wv)))
        {
            return Err(Restriction::NullableWherePredicate.into());
        }
    }

    if query
        .target_list
        .iter()
        .any(|t| contains_nonstrict_functions(&t.expr))
    {
        return Err(Restriction::NonStrictTargetWithOuterJoin.into());
    }
    Ok(())
}

/// A binary operator whose two sides each reference exactly one (distinct)
/// range entry, and whose operator is a mergejoin or hashjoin equality.
fn is_equijoin_condition(expr: &Expr) -> bool {
    let Expr::Op { op, args, .. } = expr else {
        return false;
    };
    let [left, right] = args.as_slice() else {
        return false;
    };
    let rels = |e: &Expr| {
        let mut out: Vec<usize> = vars_of_level(e, 0).iter().map(|v| v.rtindex).collect();
        out.sort_unstable();
        out.dedup();
        out
    };
    let (l, r) = (rels(left), rels(right));
    if l.len() != 1 || r.len() != 1 || l == r {
        return false;
    }
    op.mergejoinable || op.hashjoinable
}

// ── Helpers ─────────────────────────────────────────────────────────────────

fn join_conditions(items: &[JoinNode]) -> Vec<&Expr> {
    fn walk<'a>(node: &'a JoinNode, out: &mut Vec<&'a Expr>) {
        if let JoinNode::Join {
            left, right, quals, ..
        } = node
        {
            walk(left, out);
            walk(right, out);
            out.extend(quals.iter());
        }
    }
    let mut out = Vec::new();
    for item in items {
        walk(item, &mut out);
    }
    out
}

/// Split a predicate into its top-level AND conjuncts (nested ANDs flattened).
pub fn top_level_conjuncts(expr: &Expr) -> Vec<&Expr> {
    match expr {
        Expr::Bool {
            op: BoolOp::And,
            args,
        } => args.iter().flat_map(top_level_conjuncts).collect(),
        other => vec![other],
    }
}
