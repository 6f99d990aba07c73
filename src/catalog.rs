//! Catalog layer: the external catalog/transaction service.
//!
//! Everything this crate needs from the host database goes through the
//! [`Catalog`] trait: relation metadata lookups, trigger and index
//! creation, dependency edges, command visibility and transaction control.
//!
//! [`MemoryCatalog`] is an in-process implementation used by the test suite
//! and by callers that want to plan an IMMV without a server. The PostgreSQL
//! implementation lives in `spi` (feature `pg18`).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ImmvError;
use crate::ivm::rewrite::StoredDefinition;
use crate::triggers::{TriggerEvent, TriggerTiming};

/// Object identifier, as assigned by the catalog.
pub type Oid = u32;

/// First identifier handed out by [`MemoryCatalog`]. Mirrors
/// `FirstNormalObjectId`.
pub const FIRST_NORMAL_OID: Oid = 16384;

// ── Object addresses and dependencies ──────────────────────────────────

/// Catalog the object lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ObjectClass {
    Relation,
    Trigger,
    Index,
    Constraint,
}

/// A catalog object, addressable as the source or target of a dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectAddress {
    pub class: ObjectClass,
    pub id: Oid,
}

impl ObjectAddress {
    pub fn relation(id: Oid) -> Self {
        ObjectAddress {
            class: ObjectClass::Relation,
            id,
        }
    }

    pub fn trigger(id: Oid) -> Self {
        ObjectAddress {
            class: ObjectClass::Trigger,
            id,
        }
    }

    pub fn index(id: Oid) -> Self {
        ObjectAddress {
            class: ObjectClass::Index,
            id,
        }
    }

    pub fn constraint(id: Oid) -> Self {
        ObjectAddress {
            class: ObjectClass::Constraint,
            id,
        }
    }
}

/// Dependency edge semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DependencyKind {
    /// Dropping the referenced object requires CASCADE.
    Normal,
    /// The dependent object is dropped silently with the referenced one.
    Auto,
}

/// A recorded dependency edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub dependent: ObjectAddress,
    pub referenced: ObjectAddress,
    pub kind: DependencyKind,
}

// ── Relation metadata ───────────────────────────────────────────────────

/// A relation's primary-key constraint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryKey {
    pub constraint: Oid,
    /// Key attribute numbers, in key order.
    pub attnos: Vec<i32>,
    pub deferrable: bool,
}

/// An existing index on a relation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexInfo {
    pub oid: Oid,
    pub name: String,
    pub access_method: String,
    pub unique: bool,
    pub nulls_not_distinct: bool,
    /// Indexed attribute numbers, in index order.
    pub columns: Vec<i32>,
}

/// Request to build a new index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDef {
    pub relid: Oid,
    pub name: String,
    pub access_method: String,
    pub unique: bool,
    pub nulls_not_distinct: bool,
    /// Column names, in index order.
    pub columns: Vec<String>,
}

/// Request to build a statement-level trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerDef {
    pub name: String,
    /// Relation the trigger fires on.
    pub relid: Oid,
    pub timing: TriggerTiming,
    pub event: TriggerEvent,
    pub function: String,
    pub old_table: Option<String>,
    pub new_table: Option<String>,
    pub args: Vec<String>,
}

/// Request to create the storage relation of a view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationDef {
    pub name: String,
    pub namespace: Option<String>,
    pub columns: Vec<String>,
    /// SQL type of each column.
    pub column_types: Vec<String>,
}

/// An informational message for the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
}

impl Notice {
    pub fn new(message: impl Into<String>) -> Self {
        Notice {
            message: message.into(),
            detail: None,
            hint: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

// ── The service interface ──────────────────────────────────────────────

/// Catalog and transaction operations required to define an IMMV.
///
/// Mutations made between [`begin`](Catalog::begin) and
/// [`commit`](Catalog::commit) must be undone entirely by
/// [`rollback`](Catalog::rollback).
pub trait Catalog {
    /// Name of a relation, for messages and derived object names.
    fn relation_name(&self, relid: Oid) -> Result<String, ImmvError>;

    /// Column names of a relation, in attribute order.
    fn relation_columns(&self, relid: Oid) -> Result<Vec<String>, ImmvError>;

    /// The relation's primary key, if it has one.
    fn primary_key(&self, relid: Oid) -> Result<Option<PrimaryKey>, ImmvError>;

    /// Indexes defined on the relation.
    fn indexes(&self, relid: Oid) -> Result<Vec<IndexInfo>, ImmvError>;

    /// Create the (empty) storage relation for a view.
    fn create_relation(&mut self, def: &RelationDef) -> Result<Oid, ImmvError>;

    fn create_trigger(&mut self, def: &TriggerDef) -> Result<Oid, ImmvError>;

    fn create_index(&mut self, def: &IndexDef) -> Result<Oid, ImmvError>;

    fn record_dependency(
        &mut self,
        dependent: ObjectAddress,
        referenced: ObjectAddress,
        kind: DependencyKind,
    ) -> Result<(), ImmvError>;

    /// Make the changes so far visible to later steps of the same
    /// transaction.
    fn make_visible(&mut self) -> Result<(), ImmvError>;

    /// Flag `view` as incrementally maintained and store its definition.
    fn mark_immv(&mut self, view: Oid, definition: &StoredDefinition) -> Result<(), ImmvError>;

    fn begin(&mut self) -> Result<(), ImmvError>;

    fn commit(&mut self) -> Result<(), ImmvError>;

    fn rollback(&mut self) -> Result<(), ImmvError>;

    /// Report a soft diagnostic to the client.
    fn notice(&mut self, notice: Notice) {
        tracing::info!(
            detail = notice.detail.as_deref(),
            hint = notice.hint.as_deref(),
            "{}",
            notice.message
        );
    }
}

// ── In-memory implementation ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
struct MemRelation {
    name: String,
    columns: Vec<String>,
    primary_key: Option<PrimaryKey>,
    /// Serialised definition, for IMMVs.
    immv_definition: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct MemIndex {
    relid: Oid,
    info: IndexInfo,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct MemTrigger {
    def: TriggerDef,
    /// Command id current when the trigger was created.
    command: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CatalogState {
    relations: BTreeMap<Oid, MemRelation>,
    triggers: BTreeMap<Oid, MemTrigger>,
    indexes: BTreeMap<Oid, MemIndex>,
    dependencies: Vec<Dependency>,
    next_oid: Oid,
    command: u32,
}

impl Default for CatalogState {
    fn default() -> Self {
        CatalogState {
            relations: BTreeMap::new(),
            triggers: BTreeMap::new(),
            indexes: BTreeMap::new(),
            dependencies: Vec::new(),
            next_oid: FIRST_NORMAL_OID,
            command: 0,
        }
    }
}

impl CatalogState {
    fn allocate_oid(&mut self) -> Oid {
        let oid = self.next_oid;
        self.next_oid += 1;
        oid
    }

    fn relation(&self, relid: Oid) -> Result<&MemRelation, ImmvError> {
        self.relations
            .get(&relid)
            .ok_or_else(|| ImmvError::NotFound(format!("relation with OID {relid}")))
    }

    fn relation_mut(&mut self, relid: Oid) -> Result<&mut MemRelation, ImmvError> {
        self.relations
            .get_mut(&relid)
            .ok_or_else(|| ImmvError::NotFound(format!("relation with OID {relid}")))
    }

    fn exists(&self, address: ObjectAddress) -> bool {
        match address.class {
            ObjectClass::Relation => self.relations.contains_key(&address.id),
            ObjectClass::Trigger => self.triggers.contains_key(&address.id),
            ObjectClass::Index => self.indexes.contains_key(&address.id),
            ObjectClass::Constraint => self.relations.values().any(|r| {
                r.primary_key
                    .as_ref()
                    .is_some_and(|pk| pk.constraint == address.id)
            }),
        }
    }
}

/// In-process catalog with snapshot-based transactions.
///
/// Notices are kept across rollbacks, the way a server delivers them to
/// the client as they are raised.
#[derive(Debug, Clone, Default)]
pub struct MemoryCatalog {
    state: CatalogState,
    snapshot: Option<CatalogState>,
    notices: Vec<Notice>,
    /// Fail the n-th trigger creation of the current transaction.
    fail_trigger_at: Option<usize>,
    triggers_in_transaction: usize,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a plain table with the given columns.
    pub fn add_table(&mut self, name: &str, columns: &[&str]) -> Oid {
        let oid = self.state.allocate_oid();
        self.state.relations.insert(
            oid,
            MemRelation {
                name: name.to_string(),
                columns: columns.iter().map(|c| c.to_string()).collect(),
                primary_key: None,
                immv_definition: None,
            },
        );
        oid
    }

    /// Declare a primary key over the named columns; returns the
    /// constraint id.
    pub fn set_primary_key(
        &mut self,
        relid: Oid,
        columns: &[&str],
        deferrable: bool,
    ) -> Result<Oid, ImmvError> {
        let rel = self.state.relation(relid)?;
        let mut attnos = Vec::with_capacity(columns.len());
        for col in columns {
            let pos = rel
                .columns
                .iter()
                .position(|c| c == col)
                .ok_or_else(|| ImmvError::NotFound(format!("column \"{col}\" of relation \"{}\"", rel.name)))?;
            attnos.push(pos as i32 + 1);
        }
        let constraint = self.state.allocate_oid();
        self.state.relation_mut(relid)?.primary_key = Some(PrimaryKey {
            constraint,
            attnos,
            deferrable,
        });
        Ok(constraint)
    }

    /// Make the `n`-th trigger creation (1-based) of the next transaction
    /// fail with a catalog error. The failure fires once.
    pub fn fail_trigger_creation_at(&mut self, n: usize) {
        self.fail_trigger_at = Some(n);
    }

    pub fn notices(&self) -> &[Notice] {
        &self.notices
    }

    pub fn in_transaction(&self) -> bool {
        self.snapshot.is_some()
    }

    /// Find a relation by name.
    pub fn relation_id(&self, name: &str) -> Option<Oid> {
        self.state
            .relations
            .iter()
            .find(|(_, r)| r.name == name)
            .map(|(oid, _)| *oid)
    }

    /// Stored definition of an IMMV, if `relid` is one.
    pub fn immv_definition(&self, relid: Oid) -> Option<StoredDefinition> {
        let json = self.state.relations.get(&relid)?.immv_definition.as_ref()?;
        StoredDefinition::from_json(json).ok()
    }

    /// Triggers on `relid`, in creation order.
    pub fn triggers_on(&self, relid: Oid) -> Vec<&TriggerDef> {
        self.state
            .triggers
            .values()
            .filter(|t| t.def.relid == relid)
            .map(|t| &t.def)
            .collect()
    }

    pub fn trigger_count(&self) -> usize {
        self.state.triggers.len()
    }

    /// Command id each trigger was created under, in creation order.
    pub fn trigger_commands(&self) -> Vec<u32> {
        self.state.triggers.values().map(|t| t.command).collect()
    }

    pub fn trigger_id(&self, name: &str, relid: Oid) -> Option<Oid> {
        self.state
            .triggers
            .iter()
            .find(|(_, t)| t.def.name == name && t.def.relid == relid)
            .map(|(oid, _)| *oid)
    }

    pub fn index_count(&self) -> usize {
        self.state.indexes.len()
    }

    pub fn dependencies(&self) -> &[Dependency] {
        &self.state.dependencies
    }

    /// Dependencies recorded with `address` as the dependent object.
    pub fn dependencies_of(&self, address: ObjectAddress) -> Vec<&Dependency> {
        self.state
            .dependencies
            .iter()
            .filter(|d| d.dependent == address)
            .collect()
    }
}

impl Catalog for MemoryCatalog {
    fn relation_name(&self, relid: Oid) -> Result<String, ImmvError> {
        Ok(self.state.relation(relid)?.name.clone())
    }

    fn relation_columns(&self, relid: Oid) -> Result<Vec<String>, ImmvError> {
        Ok(self.state.relation(relid)?.columns.clone())
    }

    fn primary_key(&self, relid: Oid) -> Result<Option<PrimaryKey>, ImmvError> {
        Ok(self.state.relation(relid)?.primary_key.clone())
    }

    fn indexes(&self, relid: Oid) -> Result<Vec<IndexInfo>, ImmvError> {
        self.state.relation(relid)?;
        Ok(self
            .state
            .indexes
            .values()
            .filter(|i| i.relid == relid)
            .map(|i| i.info.clone())
            .collect())
    }

    fn create_relation(&mut self, def: &RelationDef) -> Result<Oid, ImmvError> {
        if self.relation_id(&def.name).is_some() {
            return Err(ImmvError::CatalogError(format!(
                "relation \"{}\" already exists",
                def.name
            )));
        }
        let columns: Vec<&str> = def.columns.iter().map(String::as_str).collect();
        Ok(self.add_table(&def.name, &columns))
    }

    fn create_trigger(&mut self, def: &TriggerDef) -> Result<Oid, ImmvError> {
        self.triggers_in_transaction += 1;
        if self.fail_trigger_at == Some(self.triggers_in_transaction) {
            self.fail_trigger_at = None;
            return Err(ImmvError::CatalogError(format!(
                "could not create trigger \"{}\"",
                def.name
            )));
        }
        self.state.relation(def.relid)?;
        if self.trigger_id(&def.name, def.relid).is_some() {
            return Err(ImmvError::CatalogError(format!(
                "trigger \"{}\" for relation \"{}\" already exists",
                def.name,
                self.relation_name(def.relid)?
            )));
        }
        let oid = self.state.allocate_oid();
        let command = self.state.command;
        self.state.triggers.insert(
            oid,
            MemTrigger {
                def: def.clone(),
                command,
            },
        );
        Ok(oid)
    }

    fn create_index(&mut self, def: &IndexDef) -> Result<Oid, ImmvError> {
        let rel = self.state.relation(def.relid)?;
        let mut columns = Vec::with_capacity(def.columns.len());
        for name in &def.columns {
            let pos = rel
                .columns
                .iter()
                .position(|c| c == name)
                .ok_or_else(|| ImmvError::CatalogError(format!("column \"{name}\" does not exist")))?;
            columns.push(pos as i32 + 1);
        }
        if self.state.indexes.values().any(|i| i.info.name == def.name) {
            return Err(ImmvError::CatalogError(format!(
                "relation \"{}\" already exists",
                def.name
            )));
        }
        let oid = self.state.allocate_oid();
        self.state.indexes.insert(
            oid,
            MemIndex {
                relid: def.relid,
                info: IndexInfo {
                    oid,
                    name: def.name.clone(),
                    access_method: def.access_method.clone(),
                    unique: def.unique,
                    nulls_not_distinct: def.nulls_not_distinct,
                    columns,
                },
            },
        );
        Ok(oid)
    }

    fn record_dependency(
        &mut self,
        dependent: ObjectAddress,
        referenced: ObjectAddress,
        kind: DependencyKind,
    ) -> Result<(), ImmvError> {
        for address in [dependent, referenced] {
            if !self.state.exists(address) {
                return Err(ImmvError::CatalogError(format!(
                    "cannot record dependency on missing {:?} {}",
                    address.class, address.id
                )));
            }
        }
        self.state.dependencies.push(Dependency {
            dependent,
            referenced,
            kind,
        });
        Ok(())
    }

    fn make_visible(&mut self) -> Result<(), ImmvError> {
        self.state.command += 1;
        Ok(())
    }

    fn mark_immv(&mut self, view: Oid, definition: &StoredDefinition) -> Result<(), ImmvError> {
        let json = definition.to_json()?;
        self.state.relation_mut(view)?.immv_definition = Some(json);
        Ok(())
    }

    fn begin(&mut self) -> Result<(), ImmvError> {
        if self.snapshot.is_some() {
            return Err(ImmvError::CatalogError(
                "a transaction is already in progress".to_string(),
            ));
        }
        self.snapshot = Some(self.state.clone());
        self.triggers_in_transaction = 0;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), ImmvError> {
        self.snapshot
            .take()
            .map(|_| ())
            .ok_or_else(|| ImmvError::CatalogError("no transaction in progress".to_string()))
    }

    fn rollback(&mut self) -> Result<(), ImmvError> {
        let snapshot = self
            .snapshot
            .take()
            .ok_or_else(|| ImmvError::CatalogError("no transaction in progress".to_string()))?;
        self.state = snapshot;
        Ok(())
    }

    fn notice(&mut self, notice: Notice) {
        tracing::info!(
            detail = notice.detail.as_deref(),
            hint = notice.hint.as_deref(),
            "{}",
            notice.message
        );
        self.notices.push(notice);
    }
}
