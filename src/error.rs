//! Error types for pg_immv.
//!
//! All errors that can occur while defining an incrementally maintainable
//! materialized view (IMMV) are represented by [`ImmvError`]. Errors are
//! propagated via `Result<T, ImmvError>` throughout the crate and converted
//! to PostgreSQL errors by the command handler (see `spi` under `pg18`).
//!
//! # Error Classification
//!
//! - **User**: the defining query is not eligible for incremental
//!   maintenance, or the statement is inconsistent with it. The whole
//!   CREATE is aborted before any catalog object exists.
//! - **System**: the catalog service failed. The transaction is rolled back.
//! - **Internal**: a traversal reached a tree shape the restriction checker
//!   should have excluded. Indicates a bug.

use std::fmt;

use crate::ivm::restrict::Restriction;

/// Primary error type for the crate.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ImmvError {
    // ── User errors ──────────────────────────────────────────────────────
    /// The defining query uses a construct that cannot be maintained
    /// incrementally.
    #[error("{}", .0.message())]
    Unsupported(Restriction),

    /// More explicit column names were given than the query produces.
    #[error("too many column names were specified: {specified} given, query has {available}")]
    TooManyColumnNames { specified: usize, available: usize },

    /// Join, subquery or CTE nesting exceeded the configured depth guard.
    #[error("query nesting depth exceeds the limit of {limit}")]
    NestingTooDeep { limit: usize },

    /// An invalid argument was provided to an API function.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A referenced catalog object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    // ── System errors ────────────────────────────────────────────────────
    /// The catalog/transaction service reported a failure.
    #[error("catalog error: {0}")]
    CatalogError(String),

    // ── Internal errors: should not happen ──────────────────────────────
    /// An unexpected internal error. Indicates a bug.
    #[error("internal error: {0}")]
    InternalError(String),
}

/// Classification of error severity/kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImmvErrorKind {
    User,
    System,
    Internal,
}

impl fmt::Display for ImmvErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImmvErrorKind::User => write!(f, "USER"),
            ImmvErrorKind::System => write!(f, "SYSTEM"),
            ImmvErrorKind::Internal => write!(f, "INTERNAL"),
        }
    }
}

impl ImmvError {
    /// Classify the error.
    pub fn kind(&self) -> ImmvErrorKind {
        match self {
            ImmvError::Unsupported(_)
            | ImmvError::TooManyColumnNames { .. }
            | ImmvError::NestingTooDeep { .. }
            | ImmvError::InvalidArgument(_)
            | ImmvError::NotFound(_) => ImmvErrorKind::User,

            ImmvError::CatalogError(_) => ImmvErrorKind::System,

            ImmvError::InternalError(_) => ImmvErrorKind::Internal,
        }
    }

    /// Remediation hint shown alongside the error, if any.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            ImmvError::Unsupported(r) => r.hint(),
            _ => None,
        }
    }

    /// The eligibility category, for `Unsupported` errors.
    pub fn restriction(&self) -> Option<&Restriction> {
        match self {
            ImmvError::Unsupported(r) => Some(r),
            _ => None,
        }
    }

    /// SQLSTATE reported to the client.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            ImmvError::Unsupported(_) => "0A000",
            ImmvError::TooManyColumnNames { .. } => "42601",
            ImmvError::NestingTooDeep { .. } => "54001",
            ImmvError::InvalidArgument(_) => "22023",
            ImmvError::NotFound(_) => "42P01",
            ImmvError::CatalogError(_) | ImmvError::InternalError(_) => "XX000",
        }
    }
}

impl From<Restriction> for ImmvError {
    fn from(r: Restriction) -> Self {
        ImmvError::Unsupported(r)
    }
}

impl From<serde_json::Error> for ImmvError {
    fn from(e: serde_json::Error) -> Self {
        ImmvError::InternalError(format!("definition serialization failed: {e}"))
    }
}
