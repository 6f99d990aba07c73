//! PostgreSQL catalog adapter over SPI.
//!
//! [`SpiCatalog`] implements [`Catalog`] for a backend running the
//! extension. Metadata is read from `pg_class`, `pg_attribute`,
//! `pg_constraint` and `pg_index`; objects are created with plain DDL;
//! dependency edges and command visibility go through the backend
//! functions directly.
//!
//! A CREATE runs inside an internal subtransaction so that a failure can
//! undo every object created so far without aborting the caller.
//!
//! # Safety
//! The `pg_sys` calls below must run in a backend with an active
//! transaction. That holds for every caller of this module, which is only
//! reachable from SQL-callable functions.

use pgrx::pg_sys::panic::ErrorReport;
use pgrx::prelude::*;

use crate::catalog::{
    Catalog, DependencyKind, IndexDef, IndexInfo, Notice, ObjectAddress, ObjectClass, Oid,
    PrimaryKey, RelationDef, TriggerDef,
};
use crate::error::{ImmvError, ImmvErrorKind};
use crate::ivm::rewrite::StoredDefinition;

/// Table storing IMMV definitions. Installed by the host extension.
pub const CATALOG_DDL: &str = r#"
CREATE SCHEMA IF NOT EXISTS pg_immv;

CREATE TABLE IF NOT EXISTS pg_immv.pg_immv_views (
    immvrelid     OID PRIMARY KEY,
    definition    JSONB NOT NULL,
    column_names  TEXT[] NOT NULL DEFAULT '{}',
    created_at    TIMESTAMPTZ NOT NULL DEFAULT now()
);
"#;

fn spi_err(context: &str, e: impl std::fmt::Display) -> ImmvError {
    ImmvError::CatalogError(format!("{context}: {e}"))
}

fn to_oid(id: Oid) -> pg_sys::Oid {
    pg_sys::Oid::from(id)
}

/// Quote an identifier the way `quote_ident()` does for non-trivial names.
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Saved state of an open internal subtransaction.
struct SubTransaction {
    memory_context: pg_sys::MemoryContext,
    resource_owner: pg_sys::ResourceOwner,
}

/// [`Catalog`] over the current backend.
#[derive(Default)]
pub struct SpiCatalog {
    subxact: Option<SubTransaction>,
}

impl SpiCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schema-qualified, quoted name of a relation.
    fn qualified_name(&self, relid: Oid) -> Result<String, ImmvError> {
        Spi::get_one_with_args::<String>(
            "SELECT format('%I.%I', n.nspname, c.relname) \
             FROM pg_class c JOIN pg_namespace n ON n.oid = c.relnamespace \
             WHERE c.oid = $1",
            &[to_oid(relid).into()],
        )
        .map_err(|e| spi_err("failed to look up relation", e))?
        .ok_or_else(|| ImmvError::NotFound(format!("relation with OID {relid}")))
    }

    /// Continue in the caller's memory context after starting a
    /// subtransaction, as PL/pgSQL exception blocks do.
    fn switch_to_saved_context(saved: &SubTransaction) {
        // SAFETY: the saved context belongs to the parent transaction and
        // outlives the subtransaction.
        unsafe {
            pg_sys::MemoryContextSwitchTo(saved.memory_context);
        }
    }

    fn restore_context(saved: &SubTransaction) {
        // SAFETY: both values were captured from the same backend before
        // the subtransaction started and are still valid in the parent.
        unsafe {
            pg_sys::MemoryContextSwitchTo(saved.memory_context);
            pg_sys::CurrentResourceOwner = saved.resource_owner;
        }
    }
}

impl Catalog for SpiCatalog {
    fn relation_name(&self, relid: Oid) -> Result<String, ImmvError> {
        Spi::get_one_with_args::<String>(
            "SELECT relname::text FROM pg_class WHERE oid = $1",
            &[to_oid(relid).into()],
        )
        .map_err(|e| spi_err("failed to look up relation", e))?
        .ok_or_else(|| ImmvError::NotFound(format!("relation with OID {relid}")))
    }

    fn relation_columns(&self, relid: Oid) -> Result<Vec<String>, ImmvError> {
        let sql = format!(
            "SELECT attname::text FROM pg_attribute \
             WHERE attrelid = {} AND attnum > 0 AND NOT attisdropped \
             ORDER BY attnum",
            relid,
        );
        Spi::connect(|client| {
            let result = client
                .select(&sql, None, &[])
                .map_err(|e| spi_err("failed to read columns", e))?;
            let mut columns = Vec::new();
            for row in result {
                let name: String = row
                    .get(1)
                    .map_err(|e| spi_err("failed to read columns", e))?
                    .unwrap_or_default();
                columns.push(name);
            }
            Ok(columns)
        })
    }

    fn primary_key(&self, relid: Oid) -> Result<Option<PrimaryKey>, ImmvError> {
        let sql = format!(
            "SELECT oid, conkey::int4[], condeferrable FROM pg_constraint \
             WHERE conrelid = {} AND contype = 'p'",
            relid,
        );
        Spi::connect(|client| {
            let result = client
                .select(&sql, Some(1), &[])
                .map_err(|e| spi_err("failed to read primary key", e))?;
            for row in result {
                let constraint: pg_sys::Oid = row
                    .get(1)
                    .map_err(|e| spi_err("failed to read primary key", e))?
                    .ok_or_else(|| ImmvError::CatalogError("constraint without OID".into()))?;
                let attnos: Vec<i32> = row
                    .get(2)
                    .map_err(|e| spi_err("failed to read primary key", e))?
                    .unwrap_or_default();
                let deferrable: bool = row
                    .get(3)
                    .map_err(|e| spi_err("failed to read primary key", e))?
                    .unwrap_or(false);
                return Ok(Some(PrimaryKey {
                    constraint: constraint.to_u32(),
                    attnos,
                    deferrable,
                }));
            }
            Ok(None)
        })
    }

    fn indexes(&self, relid: Oid) -> Result<Vec<IndexInfo>, ImmvError> {
        let sql = format!(
            "SELECT i.indexrelid, c.relname::text, am.amname::text, \
                    i.indisunique, i.indnullsnotdistinct, i.indkey::int2[]::int4[] \
             FROM pg_index i \
             JOIN pg_class c ON c.oid = i.indexrelid \
             JOIN pg_am am ON am.oid = c.relam \
             WHERE i.indrelid = {} \
             ORDER BY i.indexrelid",
            relid,
        );
        Spi::connect(|client| {
            let result = client
                .select(&sql, None, &[])
                .map_err(|e| spi_err("failed to read indexes", e))?;
            let mut out = Vec::new();
            for row in result {
                let err = |e: pgrx::spi::SpiError| spi_err("failed to read indexes", e);
                let oid: pg_sys::Oid = row.get(1).map_err(err)?.unwrap_or(pg_sys::InvalidOid);
                out.push(IndexInfo {
                    oid: oid.to_u32(),
                    name: row.get(2).map_err(err)?.unwrap_or_default(),
                    access_method: row.get(3).map_err(err)?.unwrap_or_default(),
                    unique: row.get(4).map_err(err)?.unwrap_or(false),
                    nulls_not_distinct: row.get(5).map_err(err)?.unwrap_or(false),
                    columns: row.get(6).map_err(err)?.unwrap_or_default(),
                });
            }
            Ok(out)
        })
    }

    fn create_relation(&mut self, def: &RelationDef) -> Result<Oid, ImmvError> {
        let qualified = match &def.namespace {
            Some(ns) => format!("{}.{}", quote_ident(ns), quote_ident(&def.name)),
            None => quote_ident(&def.name),
        };
        let columns = def
            .columns
            .iter()
            .zip(&def.column_types)
            .map(|(name, ty)| format!("{} {ty}", quote_ident(name)))
            .collect::<Vec<_>>()
            .join(", ");
        Spi::run(&format!("CREATE TABLE {qualified} ({columns})"))
            .map_err(|e| spi_err(&format!("failed to create {qualified}"), e))?;
        let oid = Spi::get_one_with_args::<pg_sys::Oid>(
            "SELECT $1::regclass::oid",
            &[qualified.as_str().into()],
        )
        .map_err(|e| spi_err("failed to resolve new relation", e))?
        .ok_or_else(|| ImmvError::NotFound(qualified.clone()))?;
        Ok(oid.to_u32())
    }

    fn create_trigger(&mut self, def: &TriggerDef) -> Result<Oid, ImmvError> {
        let table = self.qualified_name(def.relid)?;
        let mut referencing = Vec::new();
        if let Some(old) = &def.old_table {
            referencing.push(format!("OLD TABLE AS {old}"));
        }
        if let Some(new) = &def.new_table {
            referencing.push(format!("NEW TABLE AS {new}"));
        }
        let referencing = if referencing.is_empty() {
            String::new()
        } else {
            format!("REFERENCING {}", referencing.join(" "))
        };
        let args = def
            .args
            .iter()
            .map(|a| quote_literal(a))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "CREATE TRIGGER {name} {timing} {event} ON {table} {referencing} \
             FOR EACH STATEMENT EXECUTE FUNCTION {function}({args})",
            name = quote_ident(&def.name),
            timing = def.timing.as_sql(),
            event = def.event.as_sql(),
            function = quote_ident(&def.function),
        );
        Spi::run(&sql).map_err(|e| spi_err(&format!("failed to create trigger on {table}"), e))?;

        Spi::get_one_with_args::<pg_sys::Oid>(
            "SELECT oid FROM pg_trigger WHERE tgrelid = $1 AND tgname = $2",
            &[to_oid(def.relid).into(), def.name.as_str().into()],
        )
        .map_err(|e| spi_err("failed to resolve new trigger", e))?
        .map(|oid| oid.to_u32())
        .ok_or_else(|| ImmvError::NotFound(format!("trigger \"{}\"", def.name)))
    }

    fn create_index(&mut self, def: &IndexDef) -> Result<Oid, ImmvError> {
        let table = self.qualified_name(def.relid)?;
        let columns = def
            .columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "CREATE {unique}INDEX {name} ON {table} USING {am} ({columns}){nnd}",
            unique = if def.unique { "UNIQUE " } else { "" },
            name = quote_ident(&def.name),
            am = def.access_method,
            nnd = if def.nulls_not_distinct {
                " NULLS NOT DISTINCT"
            } else {
                ""
            },
        );
        Spi::run(&sql).map_err(|e| spi_err(&format!("failed to create index on {table}"), e))?;

        Spi::get_one_with_args::<pg_sys::Oid>(
            "SELECT indexrelid FROM pg_index i JOIN pg_class c ON c.oid = i.indexrelid \
             WHERE i.indrelid = $1 AND c.relname = $2",
            &[to_oid(def.relid).into(), def.name.as_str().into()],
        )
        .map_err(|e| spi_err("failed to resolve new index", e))?
        .map(|oid| oid.to_u32())
        .ok_or_else(|| ImmvError::NotFound(format!("index \"{}\"", def.name)))
    }

    fn record_dependency(
        &mut self,
        dependent: ObjectAddress,
        referenced: ObjectAddress,
        kind: DependencyKind,
    ) -> Result<(), ImmvError> {
        let depender = object_address(dependent);
        let referenced = object_address(referenced);
        let behavior = match kind {
            DependencyKind::Normal => pg_sys::DependencyType::DEPENDENCY_NORMAL,
            DependencyKind::Auto => pg_sys::DependencyType::DEPENDENCY_AUTO,
        };
        // SAFETY: both addresses are fully initialised stack values that
        // outlive the call; recordDependencyOn copies them into pg_depend.
        unsafe {
            pg_sys::recordDependencyOn(&depender, &referenced, behavior);
        }
        Ok(())
    }

    fn make_visible(&mut self) -> Result<(), ImmvError> {
        // SAFETY: advancing the command counter is valid at any point of
        // an open transaction.
        unsafe {
            pg_sys::CommandCounterIncrement();
        }
        Ok(())
    }

    fn mark_immv(&mut self, view: Oid, definition: &StoredDefinition) -> Result<(), ImmvError> {
        let json = definition.to_json()?;
        let names = definition
            .column_names
            .iter()
            .map(|n| quote_literal(n))
            .collect::<Vec<_>>()
            .join(", ");
        Spi::run(&format!(
            "INSERT INTO pg_immv.pg_immv_views (immvrelid, definition, column_names) \
             VALUES ({view}, {json}::jsonb, ARRAY[{names}]::text[])",
            json = quote_literal(&json),
        ))
        .map_err(|e| spi_err("failed to store IMMV definition", e))
    }

    fn begin(&mut self) -> Result<(), ImmvError> {
        if self.subxact.is_some() {
            return Err(ImmvError::CatalogError(
                "a transaction is already in progress".to_string(),
            ));
        }
        // SAFETY: reading the backend's current memory context and
        // resource owner, which are always set inside a transaction.
        let saved = unsafe {
            SubTransaction {
                memory_context: pg_sys::CurrentMemoryContext,
                resource_owner: pg_sys::CurrentResourceOwner,
            }
        };
        // SAFETY: starting an internal subtransaction inside an active
        // transaction; a NULL name is allowed.
        unsafe {
            pg_sys::BeginInternalSubTransaction(std::ptr::null());
        }
        Self::switch_to_saved_context(&saved);
        self.subxact = Some(saved);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), ImmvError> {
        let saved = self
            .subxact
            .take()
            .ok_or_else(|| ImmvError::CatalogError("no transaction in progress".to_string()))?;
        // SAFETY: the subtransaction opened in `begin` is the current one.
        unsafe {
            pg_sys::ReleaseCurrentSubTransaction();
        }
        Self::restore_context(&saved);
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), ImmvError> {
        let saved = self
            .subxact
            .take()
            .ok_or_else(|| ImmvError::CatalogError("no transaction in progress".to_string()))?;
        // SAFETY: the subtransaction opened in `begin` is the current one.
        unsafe {
            pg_sys::RollbackAndReleaseCurrentSubTransaction();
        }
        Self::restore_context(&saved);
        Ok(())
    }

    fn notice(&mut self, notice: Notice) {
        let mut report = ErrorReport::new(
            PgSqlErrorCode::ERRCODE_SUCCESSFUL_COMPLETION,
            notice.message,
            "pg_immv",
        );
        if let Some(detail) = notice.detail {
            report = report.set_detail(detail);
        }
        if let Some(hint) = notice.hint {
            report = report.set_hint(hint);
        }
        report.report(PgLogLevel::NOTICE);
    }
}

fn object_address(address: ObjectAddress) -> pg_sys::ObjectAddress {
    let class_id = match address.class {
        ObjectClass::Relation | ObjectClass::Index => pg_sys::RelationRelationId,
        ObjectClass::Trigger => pg_sys::TriggerRelationId,
        ObjectClass::Constraint => pg_sys::ConstraintRelationId,
    };
    pg_sys::ObjectAddress {
        classId: class_id,
        objectId: to_oid(address.id),
        objectSubId: 0,
    }
}

/// SQLSTATE for an error raised back to the client.
pub fn error_code(e: &ImmvError) -> PgSqlErrorCode {
    match e {
        ImmvError::Unsupported(_) => PgSqlErrorCode::ERRCODE_FEATURE_NOT_SUPPORTED,
        ImmvError::TooManyColumnNames { .. } => PgSqlErrorCode::ERRCODE_SYNTAX_ERROR,
        ImmvError::NestingTooDeep { .. } => PgSqlErrorCode::ERRCODE_STATEMENT_TOO_COMPLEX,
        ImmvError::InvalidArgument(_) => PgSqlErrorCode::ERRCODE_INVALID_PARAMETER_VALUE,
        ImmvError::NotFound(_) => PgSqlErrorCode::ERRCODE_UNDEFINED_TABLE,
        ImmvError::CatalogError(_) | ImmvError::InternalError(_) => {
            PgSqlErrorCode::ERRCODE_INTERNAL_ERROR
        }
    }
}

/// Raise `e` as a PostgreSQL ERROR, with its hint. Does not return.
pub fn raise(e: &ImmvError) {
    let message = match e.kind() {
        ImmvErrorKind::Internal => format!("pg_immv: {e}"),
        _ => e.to_string(),
    };
    let mut report = ErrorReport::new(error_code(e), message, "pg_immv");
    if let Some(hint) = e.hint() {
        report = report.set_hint(hint);
    }
    report.report(PgLogLevel::ERROR);
}
