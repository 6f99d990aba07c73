//! pg_immv: definition-time support for incrementally maintainable
//! materialized views (IMMVs) in PostgreSQL.
//!
//! Given a parsed and rewritten defining query, this crate decides whether
//! the view can be maintained incrementally, derives the augmented query
//! that carries the bookkeeping columns delta maintenance needs, installs
//! the statement-level maintenance triggers on every base relation and
//! picks a unique key for the view's rows.
//!
//! # Theoretical Basis
//!
//! - **Gupta & Mumick (1995)**: "Maintenance of Materialized Views: Problems,
//!   Techniques, and Applications", IEEE Data Engineering Bulletin.
//! - **Larson & Zhou (2007)**: "Efficient Maintenance of Materialized
//!   Outer-Join Views", ICDE 2007.
//! - **PostgreSQL IVM** (pg_ivm, 2022): `CREATE INCREMENTAL MATERIALIZED
//!   VIEW` with immediate, trigger-based maintenance.
//!
//! # Modules
//! - [`ivm`]: query model, eligibility check, augmentation, CTE inlining
//! - [`triggers`]: maintenance trigger planning and installation
//! - [`index`]: unique key selection and the automatic index
//! - [`catalog`]: the catalog/transaction service interface
//! - [`api`]: the `CREATE` command pipeline
//!
//! # Safety
//! The `pg18` feature adds `spi`, which calls PostgreSQL through pgrx FFI.
//! All unsafe blocks are documented with `// SAFETY:` comments.

#![deny(unsafe_op_in_unsafe_fn)]

pub mod api;
pub mod catalog;
pub mod config;
pub mod error;
pub mod index;
pub mod ivm;
#[cfg(feature = "pg18")]
pub mod spi;
pub mod triggers;

pub use api::{CreateImmvStmt, CreatedImmv, create_immv};
pub use catalog::{Catalog, MemoryCatalog};
pub use config::ImmvConfig;
pub use error::{ImmvError, ImmvErrorKind};
