//! IMMV creation command.
//!
//! [`create_immv`] drives the whole definition-time pipeline against a
//! [`Catalog`]:
//!
//! 1. eligibility check (no catalog access);
//! 2. query augmentation;
//! 3. inside one transaction: create the view relation, populate it, store
//!    the definition, then create the unique index and the maintenance
//!    triggers.
//!
//! Any failure in step 3 rolls the transaction back, so a failed CREATE
//! leaves no relation, trigger or index behind.

use crate::catalog::{Catalog, Oid, RelationDef};
use crate::config::ImmvConfig;
use crate::error::ImmvError;
use crate::index::{self, KeyOutcome};
use crate::ivm::query::DefiningQuery;
use crate::ivm::restrict;
use crate::ivm::rewrite::{self, AugmentedQuery, StoredDefinition};
use crate::triggers::{self, TriggerSpec};

/// `CREATE INCREMENTAL MATERIALIZED VIEW name [(column_names)] AS query
/// [WITH [NO] DATA]`, with the query already parsed and rewritten.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateImmvStmt {
    pub name: String,
    pub namespace: Option<String>,
    pub query: DefiningQuery,
    pub column_names: Vec<String>,
    pub with_data: bool,
}

impl CreateImmvStmt {
    pub fn new(name: &str, query: DefiningQuery) -> Self {
        CreateImmvStmt {
            name: name.to_string(),
            namespace: None,
            query,
            column_names: Vec::new(),
            with_data: true,
        }
    }
}

/// What a successful [`create_immv`] produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedImmv {
    pub view: Oid,
    pub augmented: AugmentedQuery,
    /// Rows loaded by the populate step.
    pub rows: u64,
    /// `None` for `WITH NO DATA`.
    pub key: Option<KeyOutcome>,
    pub triggers: Vec<TriggerSpec>,
}

/// Column names of the view relation: declared names first, output names
/// for the rest, bookkeeping columns last.
pub fn view_column_names(augmented: &AugmentedQuery, declared: &[String]) -> Vec<String> {
    augmented
        .query
        .visible_targets()
        .enumerate()
        .map(|(i, (_, t))| declared.get(i).cloned().unwrap_or_else(|| t.name.clone()))
        .collect()
}

/// Create an incrementally maintainable materialized view.
///
/// `populate` fills the new relation from the augmented query and returns
/// the number of rows loaded; it is only called `WITH DATA`.
pub fn create_immv<C, F>(
    catalog: &mut C,
    stmt: &CreateImmvStmt,
    config: &ImmvConfig,
    populate: F,
) -> Result<CreatedImmv, ImmvError>
where
    C: Catalog + ?Sized,
    F: FnOnce(&mut C, Oid, &AugmentedQuery) -> Result<u64, ImmvError>,
{
    if stmt.name.trim().is_empty() {
        return Err(ImmvError::InvalidArgument(
            "view name must not be empty".to_string(),
        ));
    }
    config.validate()?;

    // Reject before touching the catalog.
    restrict::check(&stmt.query, config.max_nesting_depth)?;
    let augmented = rewrite::augment(&stmt.query, &stmt.column_names)?;

    catalog.begin()?;
    match build(catalog, stmt, config, augmented, populate) {
        Ok(created) => {
            catalog.commit()?;
            tracing::info!(
                view = %stmt.name,
                triggers = created.triggers.len(),
                indexed = created.key.as_ref().is_some_and(|k| k.candidate().is_some()),
                "created IMMV"
            );
            Ok(created)
        }
        Err(e) => {
            tracing::debug!(view = %stmt.name, error = %e, "IMMV creation failed, rolling back");
            if let Err(rollback) = catalog.rollback() {
                tracing::warn!(
                    view = %stmt.name,
                    error = %rollback,
                    "rollback after failed IMMV creation also failed"
                );
            }
            Err(e)
        }
    }
}

fn build<C, F>(
    catalog: &mut C,
    stmt: &CreateImmvStmt,
    config: &ImmvConfig,
    augmented: AugmentedQuery,
    populate: F,
) -> Result<CreatedImmv, ImmvError>
where
    C: Catalog + ?Sized,
    F: FnOnce(&mut C, Oid, &AugmentedQuery) -> Result<u64, ImmvError>,
{
    let view = catalog.create_relation(&RelationDef {
        name: stmt.name.clone(),
        namespace: stmt.namespace.clone(),
        columns: view_column_names(&augmented, &stmt.column_names),
        column_types: augmented
            .query
            .visible_targets()
            .map(|(_, t)| t.result_type().sql_name())
            .collect(),
    })?;
    catalog.make_visible()?;

    let rows = if stmt.with_data {
        populate(catalog, view, &augmented)?
    } else {
        0
    };

    let definition = StoredDefinition::new(stmt.query.clone(), stmt.column_names.clone());
    catalog.mark_immv(view, &definition)?;

    if !stmt.with_data {
        return Ok(CreatedImmv {
            view,
            augmented,
            rows,
            key: None,
            triggers: Vec::new(),
        });
    }

    let key = index::create_index_on_immv(catalog, &stmt.query, view, config)?;
    let triggers = triggers::install(catalog, &augmented.query, view, config.max_nesting_depth)?;

    Ok(CreatedImmv {
        view,
        augmented,
        rows,
        key: Some(key),
        triggers,
    })
}
