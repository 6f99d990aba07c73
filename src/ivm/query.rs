//! Query tree representation for IMMV defining queries.
//!
//! The rewrite service hands us an already parsed and rule-rewritten
//! `SELECT` as a [`DefiningQuery`]: a target list, a range table, a join
//! tree over range-table indexes, and the clause lists that decide
//! eligibility. Every node is a plain sum type; traversals are explicit
//! recursive-descent functions over the variants.
//!
//! Range-table indexes (`Var::rtindex`, [`JoinNode::RangeRef`]) are
//! zero-based positions in [`DefiningQuery::range_table`]. A `Var` with
//! `levels_up = n` refers to the range table of the query `n` levels out.

use serde::{Deserialize, Serialize};

use crate::error::ImmvError;

/// Prefix reserved for bookkeeping columns and names.
pub const IVM_NAME_PREFIX: &str = "__ivm_";

/// Whether `name` collides with the bookkeeping naming convention.
pub fn is_ivm_name(name: &str) -> bool {
    name.starts_with(IVM_NAME_PREFIX)
}

// ── Types and catalog descriptors ──────────────────────────────────────────

/// SQL data type of an expression or column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SqlType {
    Bool,
    Int2,
    Int4,
    Int8,
    Float4,
    Float8,
    Numeric,
    Money,
    Interval,
    Date,
    Time,
    TimeTz,
    Timestamp,
    TimestampTz,
    Text,
    Bpchar,
    Varchar,
    Oid,
    Tid,
    Inet,
    PgLsn,
    /// A user-defined enum type.
    Enum(String),
    Array(Box<SqlType>),
    /// Any other type, by name.
    Other(String),
}

impl SqlType {
    /// Name of the type for SQL generation.
    pub fn sql_name(&self) -> String {
        match self {
            SqlType::Bool => "boolean".to_string(),
            SqlType::Int2 => "smallint".to_string(),
            SqlType::Int4 => "integer".to_string(),
            SqlType::Int8 => "bigint".to_string(),
            SqlType::Float4 => "real".to_string(),
            SqlType::Float8 => "double precision".to_string(),
            SqlType::Numeric => "numeric".to_string(),
            SqlType::Money => "money".to_string(),
            SqlType::Interval => "interval".to_string(),
            SqlType::Date => "date".to_string(),
            SqlType::Time => "time".to_string(),
            SqlType::TimeTz => "timetz".to_string(),
            SqlType::Timestamp => "timestamp".to_string(),
            SqlType::TimestampTz => "timestamptz".to_string(),
            SqlType::Text => "text".to_string(),
            SqlType::Bpchar => "bpchar".to_string(),
            SqlType::Varchar => "varchar".to_string(),
            SqlType::Oid => "oid".to_string(),
            SqlType::Tid => "tid".to_string(),
            SqlType::Inet => "inet".to_string(),
            SqlType::PgLsn => "pg_lsn".to_string(),
            SqlType::Enum(name) | SqlType::Other(name) => name.clone(),
            SqlType::Array(elem) => format!("{}[]", elem.sql_name()),
        }
    }

    /// Result type of `sum()` over this argument type.
    pub fn sum_result(&self) -> SqlType {
        match self {
            SqlType::Int2 | SqlType::Int4 => SqlType::Int8,
            SqlType::Int8 => SqlType::Numeric,
            other => other.clone(),
        }
    }
}

/// Function volatility as recorded in the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Volatility {
    Immutable,
    Stable,
    Volatile,
}

/// A resolved function.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    /// Returns NULL whenever any argument is NULL.
    pub strict: bool,
    pub volatility: Volatility,
}

impl Function {
    /// An immutable, strict function.
    pub fn immutable(name: &str) -> Self {
        Function {
            name: name.to_string(),
            strict: true,
            volatility: Volatility::Immutable,
        }
    }
}

/// A resolved operator together with the planner properties the
/// restriction checker needs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Operator {
    pub name: String,
    pub strict: bool,
    pub volatility: Volatility,
    /// Equality member of a btree (mergejoin) operator family.
    pub mergejoinable: bool,
    /// Equality operator usable for hash joins.
    pub hashjoinable: bool,
}

impl Operator {
    /// The built-in `=` operator: strict, immutable, merge- and hash-joinable.
    pub fn equality() -> Self {
        Operator {
            name: "=".to_string(),
            strict: true,
            volatility: Volatility::Immutable,
            mergejoinable: true,
            hashjoinable: true,
        }
    }

    /// A strict, immutable operator with no join semantics (`<`, `+`, ...).
    pub fn plain(name: &str) -> Self {
        Operator {
            name: name.to_string(),
            strict: true,
            volatility: Volatility::Immutable,
            mergejoinable: false,
            hashjoinable: false,
        }
    }
}

// ── Expressions ────────────────────────────────────────────────────────────

/// A column reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Var {
    /// Zero-based index into the range table of the referenced query level.
    pub rtindex: usize,
    /// One-based attribute number; negative for system columns.
    pub attno: i32,
    /// Number of query levels up the referenced range table lives.
    pub levels_up: u32,
    pub name: String,
    pub vartype: SqlType,
}

impl Var {
    pub fn is_system_column(&self) -> bool {
        self.attno < 0
    }

    /// Same range-table entry and attribute, ignoring level and name.
    pub fn same_column(&self, other: &Var) -> bool {
        self.rtindex == other.rtindex && self.attno == other.attno
    }
}

/// Aggregate function types.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggFunc {
    Count,
    CountStar,
    Sum,
    Avg,
    Min,
    Max,
    /// Any other aggregate, by name.
    Other(String),
}

impl AggFunc {
    /// Name of the aggregate function for SQL generation.
    pub fn sql_name(&self) -> &str {
        match self {
            AggFunc::Count | AggFunc::CountStar => "count",
            AggFunc::Sum => "sum",
            AggFunc::Avg => "avg",
            AggFunc::Min => "min",
            AggFunc::Max => "max",
            AggFunc::Other(name) => name,
        }
    }

    pub fn is_count(&self) -> bool {
        matches!(self, AggFunc::Count | AggFunc::CountStar)
    }
}

/// An aggregate call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Aggref {
    pub func: AggFunc,
    pub args: Vec<Expr>,
    /// Declared argument types, used to resolve the aggregate's signature.
    pub arg_types: Vec<SqlType>,
    /// `agg(DISTINCT ...)`.
    pub distinct: bool,
    /// `agg(...) FILTER (WHERE ...)`.
    pub filter: Option<Box<Expr>>,
    /// `agg(... ORDER BY ...)`.
    pub order_by: Vec<Expr>,
    pub result_type: SqlType,
}

impl Aggref {
    /// `count(*)`.
    pub fn count_star() -> Self {
        Aggref {
            func: AggFunc::CountStar,
            args: Vec::new(),
            arg_types: Vec::new(),
            distinct: false,
            filter: None,
            order_by: Vec::new(),
            result_type: SqlType::Int8,
        }
    }

    /// A plain single-argument aggregate call.
    pub fn call(func: AggFunc, arg: Expr, arg_type: SqlType, result_type: SqlType) -> Self {
        Aggref {
            func,
            args: vec![arg],
            arg_types: vec![arg_type],
            distinct: false,
            filter: None,
            order_by: Vec::new(),
            result_type,
        }
    }
}

/// Kind of sub-select expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubLinkKind {
    Exists,
    Any,
    All,
    Expr,
    Array,
    RowCompare,
}

/// A sub-select appearing inside an expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubLink {
    pub kind: SubLinkKind,
    /// Left-hand side for `ANY`/`ALL`/row comparisons.
    pub test_expr: Option<Box<Expr>>,
    pub subselect: Box<DefiningQuery>,
}

/// Boolean connective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BoolOp {
    And,
    Or,
    Not,
}

/// An expression node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Expr {
    Var(Var),
    /// A literal; `None` is SQL NULL.
    Const {
        value: Option<String>,
        consttype: SqlType,
    },
    /// Operator application (binary or unary).
    Op {
        op: Operator,
        args: Vec<Expr>,
        result_type: SqlType,
    },
    /// Plain function call.
    Func {
        func: Function,
        args: Vec<Expr>,
        result_type: SqlType,
    },
    Agg(Aggref),
    WindowFunc {
        func: Function,
        args: Vec<Expr>,
        result_type: SqlType,
    },
    Bool { op: BoolOp, args: Vec<Expr> },
    /// `arg IS [NOT] NULL`.
    NullTest { arg: Box<Expr>, is_null: bool },
    /// `CASE WHEN c THEN r ... ELSE d END`.
    Case {
        arms: Vec<(Expr, Expr)>,
        default: Option<Box<Expr>>,
    },
    Coalesce { args: Vec<Expr> },
    SubLink(SubLink),
}

impl Expr {
    pub fn var(rtindex: usize, attno: i32, name: &str, vartype: SqlType) -> Expr {
        Expr::Var(Var {
            rtindex,
            attno,
            levels_up: 0,
            name: name.to_string(),
            vartype,
        })
    }

    pub fn constant(value: &str, consttype: SqlType) -> Expr {
        Expr::Const {
            value: Some(value.to_string()),
            consttype,
        }
    }

    pub fn bool_const(value: bool) -> Expr {
        Expr::constant(if value { "true" } else { "false" }, SqlType::Bool)
    }

    /// `left = right` using the built-in equality operator.
    pub fn eq(left: Expr, right: Expr) -> Expr {
        Expr::Op {
            op: Operator::equality(),
            args: vec![left, right],
            result_type: SqlType::Bool,
        }
    }

    /// A binary operator application.
    pub fn binary(op: Operator, left: Expr, right: Expr, result_type: SqlType) -> Expr {
        Expr::Op {
            op,
            args: vec![left, right],
            result_type,
        }
    }

    pub fn and(args: Vec<Expr>) -> Expr {
        Expr::Bool {
            op: BoolOp::And,
            args,
        }
    }

    pub fn or(args: Vec<Expr>) -> Expr {
        Expr::Bool {
            op: BoolOp::Or,
            args,
        }
    }

    pub fn not(arg: Expr) -> Expr {
        Expr::Bool {
            op: BoolOp::Not,
            args: vec![arg],
        }
    }

    pub fn is_not_null(arg: Expr) -> Expr {
        Expr::NullTest {
            arg: Box::new(arg),
            is_null: false,
        }
    }

    pub fn exists(subselect: DefiningQuery) -> Expr {
        Expr::SubLink(SubLink {
            kind: SubLinkKind::Exists,
            test_expr: None,
            subselect: Box::new(subselect),
        })
    }

    pub fn as_var(&self) -> Option<&Var> {
        match self {
            Expr::Var(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_true_const(&self) -> bool {
        matches!(
            self,
            Expr::Const { value: Some(v), consttype: SqlType::Bool } if v == "true"
        )
    }

    /// Direct sub-expressions of this node. Sub-selects are not expressions
    /// of this query level and are not included.
    pub fn children(&self) -> Vec<&Expr> {
        match self {
            Expr::Var(_) | Expr::Const { .. } => Vec::new(),
            Expr::Op { args, .. }
            | Expr::Func { args, .. }
            | Expr::WindowFunc { args, .. }
            | Expr::Bool { args, .. }
            | Expr::Coalesce { args } => args.iter().collect(),
            Expr::Agg(agg) => {
                let mut out: Vec<&Expr> = agg.args.iter().collect();
                out.extend(agg.order_by.iter());
                if let Some(f) = &agg.filter {
                    out.push(f);
                }
                out
            }
            Expr::NullTest { arg, .. } => vec![arg],
            Expr::Case { arms, default } => {
                let mut out = Vec::with_capacity(arms.len() * 2 + 1);
                for (cond, result) in arms {
                    out.push(cond);
                    out.push(result);
                }
                if let Some(d) = default {
                    out.push(d);
                }
                out
            }
            Expr::SubLink(s) => s.test_expr.iter().map(|e| e.as_ref()).collect(),
        }
    }

    /// Longest chain of sub-expressions below this node (a leaf is 0).
    ///
    /// Iterative, so it is safe to call on arbitrarily deep trees before
    /// any recursive walker touches them.
    pub fn height(&self) -> usize {
        let mut max = 0;
        let mut stack = vec![(self, 0usize)];
        while let Some((expr, depth)) = stack.pop() {
            max = max.max(depth);
            stack.extend(expr.children().into_iter().map(|c| (c, depth + 1)));
        }
        max
    }

    /// Pre-order visit of this expression and all sub-expressions of the
    /// same query level.
    pub fn visit<'a>(&'a self, f: &mut dyn FnMut(&'a Expr)) {
        f(self);
        for child in self.children() {
            child.visit(f);
        }
    }

    /// Whether any node of this expression (same query level) satisfies `pred`.
    pub fn any(&self, pred: &dyn Fn(&Expr) -> bool) -> bool {
        if pred(self) {
            return true;
        }
        self.children().into_iter().any(|c| c.any(pred))
    }

    /// Does this expression contain an aggregate call of this query level?
    pub fn contains_agg(&self) -> bool {
        self.any(&|e| matches!(e, Expr::Agg(_)))
    }

    pub fn contains_sublink(&self) -> bool {
        self.any(&|e| matches!(e, Expr::SubLink(_)))
    }

    /// Return a rewritten copy: `f` is offered every node top-down and may
    /// replace it; nodes it declines are rebuilt from rewritten children.
    pub fn transform(&self, f: &mut dyn FnMut(&Expr) -> Option<Expr>) -> Expr {
        fn map(args: &[Expr], f: &mut dyn FnMut(&Expr) -> Option<Expr>) -> Vec<Expr> {
            args.iter().map(|a| a.transform(f)).collect()
        }
        if let Some(replacement) = f(self) {
            return replacement;
        }
        match self {
            Expr::Var(_) | Expr::Const { .. } => self.clone(),
            Expr::Op {
                op,
                args,
                result_type,
            } => Expr::Op {
                op: op.clone(),
                args: map(args, f),
                result_type: result_type.clone(),
            },
            Expr::Func {
                func,
                args,
                result_type,
            } => Expr::Func {
                func: func.clone(),
                args: map(args, f),
                result_type: result_type.clone(),
            },
            Expr::WindowFunc {
                func,
                args,
                result_type,
            } => Expr::WindowFunc {
                func: func.clone(),
                args: map(args, f),
                result_type: result_type.clone(),
            },
            Expr::Agg(agg) => Expr::Agg(Aggref {
                args: map(&agg.args, f),
                order_by: map(&agg.order_by, f),
                filter: agg.filter.as_ref().map(|e| Box::new(e.transform(f))),
                ..agg.clone()
            }),
            Expr::Bool { op, args } => Expr::Bool {
                op: *op,
                args: map(args, f),
            },
            Expr::NullTest { arg, is_null } => Expr::NullTest {
                arg: Box::new(arg.transform(f)),
                is_null: *is_null,
            },
            Expr::Case { arms, default } => Expr::Case {
                arms: arms
                    .iter()
                    .map(|(c, r)| (c.transform(f), r.transform(f)))
                    .collect(),
                default: default.as_ref().map(|d| Box::new(d.transform(f))),
            },
            Expr::Coalesce { args } => Expr::Coalesce { args: map(args, f) },
            Expr::SubLink(s) => Expr::SubLink(SubLink {
                test_expr: s.test_expr.as_ref().map(|e| Box::new(e.transform(f))),
                ..s.clone()
            }),
        }
    }

    /// Result type of the expression.
    pub fn result_type(&self) -> SqlType {
        match self {
            Expr::Var(v) => v.vartype.clone(),
            Expr::Const { consttype, .. } => consttype.clone(),
            Expr::Op { result_type, .. }
            | Expr::Func { result_type, .. }
            | Expr::WindowFunc { result_type, .. } => result_type.clone(),
            Expr::Agg(agg) => agg.result_type.clone(),
            Expr::Bool { .. } | Expr::NullTest { .. } => SqlType::Bool,
            Expr::Case { arms, default } => arms
                .first()
                .map(|(_, r)| r.result_type())
                .or_else(|| default.as_ref().map(|d| d.result_type()))
                .unwrap_or(SqlType::Text),
            Expr::Coalesce { args } => args
                .first()
                .map(|a| a.result_type())
                .unwrap_or(SqlType::Text),
            Expr::SubLink(s) => match s.kind {
                SubLinkKind::Expr => s
                    .subselect
                    .target_list
                    .first()
                    .map(|t| t.expr.result_type())
                    .unwrap_or(SqlType::Text),
                SubLinkKind::Array => SqlType::Array(Box::new(
                    s.subselect
                        .target_list
                        .first()
                        .map(|t| t.expr.result_type())
                        .unwrap_or(SqlType::Text),
                )),
                _ => SqlType::Bool,
            },
        }
    }

    /// Render the expression as SQL text (for diagnostics).
    pub fn to_sql(&self) -> String {
        let list = |args: &[Expr]| -> String {
            args.iter()
                .map(|a| a.to_sql())
                .collect::<Vec<_>>()
                .join(", ")
        };
        match self {
            Expr::Var(v) => v.name.clone(),
            Expr::Const { value: Some(v), .. } => v.clone(),
            Expr::Const { value: None, .. } => "NULL".to_string(),
            Expr::Op { op, args, .. } => match args.as_slice() {
                [l, r] => format!("({} {} {})", l.to_sql(), op.name, r.to_sql()),
                [a] => format!("({} {})", op.name, a.to_sql()),
                _ => format!("{}({})", op.name, list(args)),
            },
            Expr::Func { func, args, .. } => format!("{}({})", func.name, list(args)),
            Expr::WindowFunc { func, args, .. } => {
                format!("{}({}) OVER (...)", func.name, list(args))
            }
            Expr::Agg(agg) => {
                if agg.func == AggFunc::CountStar {
                    "count(*)".to_string()
                } else {
                    let distinct = if agg.distinct { "DISTINCT " } else { "" };
                    format!("{}({distinct}{})", agg.func.sql_name(), list(&agg.args))
                }
            }
            Expr::Bool { op, args } => match op {
                BoolOp::Not => format!("(NOT {})", list(args)),
                BoolOp::And | BoolOp::Or => {
                    let sep = if *op == BoolOp::And { " AND " } else { " OR " };
                    format!(
                        "({})",
                        args.iter()
                            .map(|a| a.to_sql())
                            .collect::<Vec<_>>()
                            .join(sep)
                    )
                }
            },
            Expr::NullTest { arg, is_null } => {
                let test = if *is_null { "IS NULL" } else { "IS NOT NULL" };
                format!("({} {test})", arg.to_sql())
            }
            Expr::Case { arms, default } => {
                let mut sql = "CASE".to_string();
                for (c, r) in arms {
                    sql.push_str(&format!(" WHEN {} THEN {}", c.to_sql(), r.to_sql()));
                }
                if let Some(d) = default {
                    sql.push_str(&format!(" ELSE {}", d.to_sql()));
                }
                sql.push_str(" END");
                sql
            }
            Expr::Coalesce { args } => format!("COALESCE({})", list(args)),
            Expr::SubLink(s) => match s.kind {
                SubLinkKind::Exists => "EXISTS (...)".to_string(),
                _ => "(SELECT ...)".to_string(),
            },
        }
    }
}

// ── Target list ────────────────────────────────────────────────────────────

/// One output item of a query.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetEntry {
    pub expr: Expr,
    pub name: String,
    /// Computed for GROUP BY/ORDER BY only; not part of the output.
    pub junk: bool,
    /// Hidden bookkeeping column appended for incremental maintenance.
    pub bookkeeping: bool,
}

impl TargetEntry {
    pub fn new(expr: Expr, name: &str) -> Self {
        TargetEntry {
            expr,
            name: name.to_string(),
            junk: false,
            bookkeeping: false,
        }
    }

    pub fn bookkeeping(expr: Expr, name: String) -> Self {
        TargetEntry {
            expr,
            name,
            junk: false,
            bookkeeping: true,
        }
    }

    pub fn result_type(&self) -> SqlType {
        self.expr.result_type()
    }
}

// ── Range table ────────────────────────────────────────────────────────────

/// Storage kind of a base relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelKind {
    /// A plain heap table with neither parent nor children.
    Ordinary,
    /// A declaratively partitioned table.
    Partitioned,
    /// A partition or an inheritance child (has a superclass).
    Partition,
    /// A table with inheritance children.
    InheritanceParent,
    Foreign,
    View,
    MaterializedView,
}

/// A base relation referenced from the range table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelationRef {
    pub relid: u32,
    pub name: String,
    pub kind: RelKind,
    /// `TABLESAMPLE` was applied to this reference.
    pub tablesample: bool,
}

/// Join types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JoinKind {
    Inner,
    Left,
    Right,
    Full,
    Cross,
}

impl JoinKind {
    pub fn is_outer(&self) -> bool {
        matches!(self, JoinKind::Left | JoinKind::Right | JoinKind::Full)
    }
}

/// A range-table entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RangeEntry {
    Relation(RelationRef),
    /// A sub-select in FROM (explicit or an inlined CTE).
    Subquery {
        query: Box<DefiningQuery>,
        alias: String,
        lateral: bool,
    },
    /// A lateral counting sub-select produced by EXISTS lowering. Only
    /// present in augmented queries.
    ExistsLowering {
        query: Box<DefiningQuery>,
        alias: String,
    },
    /// The output of a join; `alias_vars[i]` is the expression behind
    /// attribute `i + 1` of the join result.
    JoinResult {
        kind: JoinKind,
        alias_vars: Vec<Expr>,
    },
    /// A reference to a CTE of the query `levels_up` levels out.
    CteRef { name: String, levels_up: u32 },
    Values { columns: usize },
    Function { func: Function },
}

impl RangeEntry {
    /// Short name of the entry kind (for error messages).
    pub fn kind_name(&self) -> &'static str {
        match self {
            RangeEntry::Relation(_) => "relation",
            RangeEntry::Subquery { .. } => "subquery",
            RangeEntry::ExistsLowering { .. } => "exists subquery",
            RangeEntry::JoinResult { .. } => "join",
            RangeEntry::CteRef { .. } => "cte",
            RangeEntry::Values { .. } => "values",
            RangeEntry::Function { .. } => "function",
        }
    }
}

// ── Join tree ──────────────────────────────────────────────────────────────

/// A node of the join tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JoinNode {
    /// Leaf: a range-table index.
    RangeRef(usize),
    Join {
        kind: JoinKind,
        left: Box<JoinNode>,
        right: Box<JoinNode>,
        quals: Option<Expr>,
        /// Range-table index of the corresponding `JoinResult` entry.
        rtindex: Option<usize>,
    },
}

impl JoinNode {
    pub fn join(kind: JoinKind, left: JoinNode, right: JoinNode, quals: Option<Expr>) -> Self {
        JoinNode::Join {
            kind,
            left: Box::new(left),
            right: Box::new(right),
            quals,
            rtindex: None,
        }
    }

    /// Number of join levels above the deepest leaf (a leaf is 0). Iterative.
    pub fn height(&self) -> usize {
        let mut max = 0;
        let mut stack = vec![(self, 0usize)];
        while let Some((node, depth)) = stack.pop() {
            match node {
                JoinNode::RangeRef(_) => max = max.max(depth),
                JoinNode::Join { left, right, .. } => {
                    stack.push((left.as_ref(), depth + 1));
                    stack.push((right.as_ref(), depth + 1));
                }
            }
        }
        max
    }

    /// Collect the range-table indexes of all leaves below this node.
    fn collect_leaves(&self, out: &mut Vec<usize>) {
        match self {
            JoinNode::RangeRef(idx) => out.push(*idx),
            JoinNode::Join { left, right, .. } => {
                left.collect_leaves(out);
                right.collect_leaves(out);
            }
        }
    }

    fn collect_quals<'a>(&'a self, out: &mut Vec<&'a Expr>) {
        if let JoinNode::Join {
            left, right, quals, ..
        } = self
        {
            left.collect_quals(out);
            right.collect_quals(out);
            if let Some(q) = quals {
                out.push(q);
            }
        }
    }

    fn map_quals(
        &mut self,
        f: &mut dyn FnMut(&Expr) -> Result<Expr, ImmvError>,
    ) -> Result<(), ImmvError> {
        if let JoinNode::Join {
            left, right, quals, ..
        } = self
        {
            left.map_quals(f)?;
            right.map_quals(f)?;
            if let Some(q) = quals {
                *q = f(q)?;
            }
        }
        Ok(())
    }
}

/// The FROM list plus the WHERE predicate over it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FromExpr {
    pub items: Vec<JoinNode>,
    pub quals: Option<Expr>,
}

// ── Query ──────────────────────────────────────────────────────────────────

/// `DISTINCT` variants.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Distinct {
    #[default]
    None,
    All,
    /// `DISTINCT ON (...)` over target-list positions.
    On(Vec<usize>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SetOperation {
    Union,
    Intersect,
    Except,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RowLockStrength {
    Update,
    NoKeyUpdate,
    Share,
    KeyShare,
}

/// A `WITH` list entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommonTableExpr {
    pub name: String,
    pub query: DefiningQuery,
}

/// A defining `SELECT`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DefiningQuery {
    pub target_list: Vec<TargetEntry>,
    pub range_table: Vec<RangeEntry>,
    pub jointree: FromExpr,
    /// GROUP BY items, as target-list positions.
    pub group_clause: Vec<usize>,
    pub has_grouping_sets: bool,
    pub having: Option<Expr>,
    /// ORDER BY items, as target-list positions.
    pub sort_clause: Vec<usize>,
    pub limit_count: Option<Expr>,
    pub limit_offset: Option<Expr>,
    pub distinct: Distinct,
    pub set_operation: Option<SetOperation>,
    pub row_lock: Option<RowLockStrength>,
    pub ctes: Vec<CommonTableExpr>,
    pub has_recursive: bool,
}

impl DefiningQuery {
    /// Range-table entry at `rtindex`, or an internal error if the tree
    /// refers to a missing entry.
    pub fn rte(&self, rtindex: usize) -> Result<&RangeEntry, ImmvError> {
        self.range_table.get(rtindex).ok_or_else(|| {
            ImmvError::InternalError(format!(
                "range table index {rtindex} out of range (range table has {} entries)",
                self.range_table.len()
            ))
        })
    }

    /// Expressions of this query level: target list, join conditions,
    /// WHERE, HAVING and LIMIT/OFFSET. Sub-selects are not descended into.
    pub fn expressions(&self) -> Vec<&Expr> {
        let mut out: Vec<&Expr> = self.target_list.iter().map(|t| &t.expr).collect();
        out.extend(self.jointree_quals());
        out.extend(self.having.iter());
        out.extend(self.limit_count.iter());
        out.extend(self.limit_offset.iter());
        out
    }

    /// All join conditions plus the WHERE predicate.
    pub fn jointree_quals(&self) -> Vec<&Expr> {
        let mut out = Vec::new();
        for item in &self.jointree.items {
            item.collect_quals(&mut out);
        }
        out.extend(self.jointree.quals.iter());
        out
    }

    /// Range-table indexes that appear as leaves of the join tree, in
    /// left-to-right order.
    pub fn jointree_leaves(&self) -> Vec<usize> {
        let mut out = Vec::new();
        for item in &self.jointree.items {
            item.collect_leaves(&mut out);
        }
        out
    }

    pub fn has_aggs(&self) -> bool {
        self.target_list.iter().any(|t| t.expr.contains_agg())
            || self.having.as_ref().is_some_and(|h| h.contains_agg())
    }

    pub fn has_window_funcs(&self) -> bool {
        self.expressions()
            .into_iter()
            .any(|e| e.any(&|n| matches!(n, Expr::WindowFunc { .. })))
    }

    pub fn has_sublinks(&self) -> bool {
        self.expressions().into_iter().any(|e| e.contains_sublink())
    }

    /// Output items that are part of the result (not junk).
    pub fn visible_targets(&self) -> impl Iterator<Item = (usize, &TargetEntry)> {
        self.target_list
            .iter()
            .enumerate()
            .filter(|(_, t)| !t.junk)
    }

    pub fn visible_len(&self) -> usize {
        self.target_list.iter().filter(|t| !t.junk).count()
    }

    /// Replace every expression of this query level (target list, join
    /// conditions, WHERE, HAVING, LIMIT/OFFSET and join alias columns) with
    /// `f` applied to it.
    pub fn map_expressions(
        &mut self,
        f: &mut dyn FnMut(&Expr) -> Result<Expr, ImmvError>,
    ) -> Result<(), ImmvError> {
        for entry in &mut self.target_list {
            entry.expr = f(&entry.expr)?;
        }
        for item in &mut self.jointree.items {
            item.map_quals(f)?;
        }
        for slot in [
            &mut self.jointree.quals,
            &mut self.having,
            &mut self.limit_count,
            &mut self.limit_offset,
        ] {
            if let Some(e) = slot {
                *e = f(e)?;
            }
        }
        for rte in &mut self.range_table {
            if let RangeEntry::JoinResult { alias_vars, .. } = rte {
                for v in alias_vars.iter_mut() {
                    *v = f(v)?;
                }
            }
        }
        Ok(())
    }

    /// Replace references to join-result columns by the underlying
    /// expressions, recursively, so that every level-0 `Var` points at a
    /// base relation, subquery or other non-join entry.
    pub fn flatten_join_alias_vars(&self, expr: &Expr) -> Result<Expr, ImmvError> {
        let mut failure = None;
        let flattened = expr.transform(&mut |e| self.flatten_var(e, &mut failure, 0));
        match failure {
            Some(err) => Err(err),
            None => Ok(flattened),
        }
    }

    fn flatten_var(
        &self,
        e: &Expr,
        failure: &mut Option<ImmvError>,
        depth: usize,
    ) -> Option<Expr> {
        let Expr::Var(v) = e else {
            return None;
        };
        if v.levels_up != 0 {
            return None;
        }
        let alias_vars = match self.range_table.get(v.rtindex) {
            Some(RangeEntry::JoinResult { alias_vars, .. }) => alias_vars,
            _ => return None,
        };
        // Join alias chains cannot be longer than the range table.
        if depth > self.range_table.len() {
            failure.get_or_insert(ImmvError::InternalError(
                "cyclic join alias variables".to_string(),
            ));
            return Some(e.clone());
        }
        let target = usize::try_from(v.attno - 1)
            .ok()
            .and_then(|i| alias_vars.get(i));
        match target {
            Some(inner) => Some(
                inner.transform(&mut |n| self.flatten_var(n, failure, depth + 1)),
            ),
            None => {
                failure.get_or_insert(ImmvError::InternalError(format!(
                    "join alias attribute {} out of range for range table entry {}",
                    v.attno, v.rtindex
                )));
                Some(e.clone())
            }
        }
    }
}

/// Collect the variables of `expr` (same query level) whose `levels_up`
/// equals `level`.
pub fn vars_of_level(expr: &Expr, level: u32) -> Vec<Var> {
    let mut out = Vec::new();
    expr.visit(&mut |e| {
        if let Expr::Var(v) = e
            && v.levels_up == level
        {
            out.push(v.clone());
        }
    });
    out
}
