//! Maintenance triggers on base relations.
//!
//! Every base relation an IMMV reads from gets six statement-level
//! triggers: BEFORE and AFTER for each of INSERT, DELETE and UPDATE. The
//! BEFORE triggers call `IVM_immediate_before`, which takes the view lock;
//! the AFTER triggers call `IVM_immediate_maintenance` with the statement's
//! transition tables, from which the runtime computes the net delta.
//!
//! # Lock strength
//!
//! The lock taken on the view is decided once, before any trigger exists,
//! and passed to every trigger as an argument. A view over a single base
//! relation referenced directly, with no CTEs, can be maintained under a
//! weak lock; any other shape, or any traversal that reaches a second
//! relation, needs an exclusive one so that deltas from different sources
//! are applied serially. The decision is never revised later, because
//! upgrading the lock at maintenance time invites deadlocks.
//!
//! # Traversal
//!
//! Depth-first over the join tree (both sides of every join), into FROM
//! sub-selects and EXISTS-lowering sub-selects, and over every CTE body.
//! A relation reached more than once gets its triggers only the first time.
//! Every query level and every join level counts against the nesting limit.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::catalog::{Catalog, DependencyKind, ObjectAddress, Oid, TriggerDef};
use crate::error::ImmvError;
use crate::ivm::query::{DefiningQuery, JoinNode, RangeEntry};

/// Transition table holding the rows a statement inserted.
pub const NEW_TABLE_NAME: &str = "__ivm_newtable";
/// Transition table holding the rows a statement deleted.
pub const OLD_TABLE_NAME: &str = "__ivm_oldtable";

pub const BEFORE_FUNCTION: &str = "IVM_immediate_before";
pub const MAINTENANCE_FUNCTION: &str = "IVM_immediate_maintenance";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TriggerEvent {
    Insert,
    Delete,
    Update,
}

impl TriggerEvent {
    pub const ALL: [TriggerEvent; 3] = [TriggerEvent::Insert, TriggerEvent::Delete, TriggerEvent::Update];

    /// Short tag used in trigger names.
    pub fn tag(&self) -> &'static str {
        match self {
            TriggerEvent::Insert => "ins",
            TriggerEvent::Delete => "del",
            TriggerEvent::Update => "upd",
        }
    }

    pub fn as_sql(&self) -> &'static str {
        match self {
            TriggerEvent::Insert => "INSERT",
            TriggerEvent::Delete => "DELETE",
            TriggerEvent::Update => "UPDATE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TriggerTiming {
    Before,
    After,
}

impl TriggerTiming {
    pub fn tag(&self) -> &'static str {
        match self {
            TriggerTiming::Before => "before",
            TriggerTiming::After => "after",
        }
    }

    pub fn as_sql(&self) -> &'static str {
        match self {
            TriggerTiming::Before => "BEFORE",
            TriggerTiming::After => "AFTER",
        }
    }
}

/// Lock the maintenance runtime takes on the view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockStrength {
    Weak,
    Exclusive,
}

impl LockStrength {
    pub fn is_exclusive(&self) -> bool {
        matches!(self, LockStrength::Exclusive)
    }
}

/// Transition tables an AFTER trigger needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransitionTables {
    None,
    NewRows,
    OldRows,
    Both,
}

impl TransitionTables {
    pub fn for_trigger(event: TriggerEvent, timing: TriggerTiming) -> Self {
        match (timing, event) {
            (TriggerTiming::Before, _) => TransitionTables::None,
            (TriggerTiming::After, TriggerEvent::Insert) => TransitionTables::NewRows,
            (TriggerTiming::After, TriggerEvent::Delete) => TransitionTables::OldRows,
            (TriggerTiming::After, TriggerEvent::Update) => TransitionTables::Both,
        }
    }

    pub fn new_table(&self) -> Option<&'static str> {
        match self {
            TransitionTables::NewRows | TransitionTables::Both => Some(NEW_TABLE_NAME),
            _ => None,
        }
    }

    pub fn old_table(&self) -> Option<&'static str> {
        match self {
            TransitionTables::OldRows | TransitionTables::Both => Some(OLD_TABLE_NAME),
            _ => None,
        }
    }
}

/// One maintenance trigger to create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerSpec {
    /// Base relation the trigger fires on.
    pub relid: Oid,
    pub view: Oid,
    pub event: TriggerEvent,
    pub timing: TriggerTiming,
    pub lock: LockStrength,
    pub transition: TransitionTables,
}

impl TriggerSpec {
    pub fn new(relid: Oid, view: Oid, event: TriggerEvent, timing: TriggerTiming, lock: LockStrength) -> Self {
        TriggerSpec {
            relid,
            view,
            event,
            timing,
            lock,
            transition: TransitionTables::for_trigger(event, timing),
        }
    }

    /// `IVM_trigger_<event>_<timing>_<view oid>`. The view suffix keeps
    /// triggers of different views on the same table apart.
    pub fn name(&self) -> String {
        format!(
            "IVM_trigger_{}_{}_{}",
            self.event.tag(),
            self.timing.tag(),
            self.view
        )
    }

    pub fn function(&self) -> &'static str {
        match self.timing {
            TriggerTiming::Before => BEFORE_FUNCTION,
            TriggerTiming::After => MAINTENANCE_FUNCTION,
        }
    }

    /// Trigger arguments: the view OID and the exclusive-lock flag, in
    /// `oidout`/`boolout` format.
    pub fn args(&self) -> Vec<String> {
        let flag = if self.lock.is_exclusive() { "t" } else { "f" };
        vec![self.view.to_string(), flag.to_string()]
    }

    pub fn to_def(&self) -> TriggerDef {
        TriggerDef {
            name: self.name(),
            relid: self.relid,
            timing: self.timing,
            event: self.event,
            function: self.function().to_string(),
            old_table: self.transition.old_table().map(str::to_string),
            new_table: self.transition.new_table().map(str::to_string),
            args: self.args(),
        }
    }

    /// Equivalent `CREATE TRIGGER` statement.
    pub fn to_sql(&self, table: &str) -> String {
        let mut referencing = Vec::new();
        if let Some(old) = self.transition.old_table() {
            referencing.push(format!("OLD TABLE AS {old}"));
        }
        if let Some(new) = self.transition.new_table() {
            referencing.push(format!("NEW TABLE AS {new}"));
        }
        let referencing = if referencing.is_empty() {
            String::new()
        } else {
            format!(" REFERENCING {}", referencing.join(" "))
        };
        format!(
            "CREATE TRIGGER \"{name}\" {timing} {event} ON {table}{referencing} \
             FOR EACH STATEMENT EXECUTE FUNCTION {function}('{view}', '{flag}')",
            name = self.name(),
            timing = self.timing.as_sql(),
            event = self.event.as_sql(),
            function = self.function(),
            view = self.view,
            flag = if self.lock.is_exclusive() { "t" } else { "f" },
        )
    }
}

/// Lock strength for maintaining a view over `query`.
///
/// Weak only when the range table is a single direct base-relation
/// reference and the query has no CTEs. Joins (including self-joins),
/// sub-selects, CTEs and EXISTS-lowering entries all need the exclusive
/// lock.
pub fn lock_strength(query: &DefiningQuery) -> LockStrength {
    if !query.ctes.is_empty() {
        return LockStrength::Exclusive;
    }
    match query.range_table.as_slice() {
        [RangeEntry::Relation(_)] | [] => LockStrength::Weak,
        _ => LockStrength::Exclusive,
    }
}

/// Compute the triggers needed for `view` defined by `query`, in creation
/// order: six per distinct base relation, BEFORE insert/delete/update
/// followed by AFTER insert/delete/update.
pub fn plan_triggers(
    query: &DefiningQuery,
    view: Oid,
    max_depth: usize,
) -> Result<Vec<TriggerSpec>, ImmvError> {
    let mut visited = BTreeSet::new();
    let mut relations = Vec::new();
    collect_query(query, 0, max_depth, &mut visited, &mut relations)?;
    let lock = if relations.len() > 1 {
        LockStrength::Exclusive
    } else {
        lock_strength(query)
    };

    tracing::debug!(
        view,
        relations = relations.len(),
        exclusive = lock.is_exclusive(),
        "planned IMMV maintenance triggers"
    );

    let mut specs = Vec::with_capacity(relations.len() * 6);
    for relid in relations {
        for timing in [TriggerTiming::Before, TriggerTiming::After] {
            for event in TriggerEvent::ALL {
                specs.push(TriggerSpec::new(relid, view, event, timing, lock));
            }
        }
    }
    Ok(specs)
}

fn collect_query(
    query: &DefiningQuery,
    depth: usize,
    max_depth: usize,
    visited: &mut BTreeSet<Oid>,
    out: &mut Vec<Oid>,
) -> Result<(), ImmvError> {
    if depth > max_depth {
        return Err(ImmvError::NestingTooDeep { limit: max_depth });
    }
    for item in &query.jointree.items {
        collect_node(query, item, depth, depth, max_depth, visited, out)?;
    }
    for cte in &query.ctes {
        collect_query(&cte.query, depth + 1, max_depth, visited, out)?;
    }
    Ok(())
}

/// `level` is the nesting depth of `query`; `depth` adds the join levels
/// above `node`.
fn collect_node(
    query: &DefiningQuery,
    node: &JoinNode,
    level: usize,
    depth: usize,
    max_depth: usize,
    visited: &mut BTreeSet<Oid>,
    out: &mut Vec<Oid>,
) -> Result<(), ImmvError> {
    if depth > max_depth {
        return Err(ImmvError::NestingTooDeep { limit: max_depth });
    }
    match node {
        JoinNode::Join { left, right, .. } => {
            collect_node(query, left, level, depth + 1, max_depth, visited, out)?;
            collect_node(query, right, level, depth + 1, max_depth, visited, out)
        }
        JoinNode::RangeRef(idx) => match query.rte(*idx)? {
            RangeEntry::Relation(rel) => {
                if visited.insert(rel.relid) {
                    out.push(rel.relid);
                }
                Ok(())
            }
            RangeEntry::Subquery { query: sub, .. }
            | RangeEntry::ExistsLowering { query: sub, .. } => {
                collect_query(sub, level + 1, max_depth, visited, out)
            }
            // Reached through the CTE list instead.
            RangeEntry::CteRef { .. } | RangeEntry::Function { .. } => Ok(()),
            other @ (RangeEntry::JoinResult { .. } | RangeEntry::Values { .. }) => {
                Err(ImmvError::InternalError(format!(
                    "unexpected {} range table entry in join tree",
                    other.kind_name()
                )))
            }
        },
    }
}

/// Create the maintenance triggers for `view`.
///
/// Each trigger gets an AUTO dependency on the view, and its creation is
/// made visible before the next one. Returns the specs that were created.
pub fn install<C: Catalog + ?Sized>(
    catalog: &mut C,
    query: &DefiningQuery,
    view: Oid,
    max_depth: usize,
) -> Result<Vec<TriggerSpec>, ImmvError> {
    let specs = plan_triggers(query, view, max_depth)?;
    for spec in &specs {
        let def = spec.to_def();
        let trigger = catalog.create_trigger(&def)?;
        catalog.record_dependency(
            ObjectAddress::trigger(trigger),
            ObjectAddress::relation(view),
            DependencyKind::Auto,
        )?;
        catalog.make_visible()?;
        tracing::debug!(trigger = %def.name, relid = spec.relid, "created IMMV trigger");
    }
    Ok(specs)
}
