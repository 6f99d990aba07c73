//! Query analysis for incrementally maintainable materialized views.
//!
//! # Theoretical Basis
//!
//! - **Gupta & Mumick (1995)**: "Maintenance of Materialized Views: Problems,
//!   Techniques, and Applications." IEEE Data Engineering Bulletin, 18(2).
//!   Counting-based maintenance: every view row carries the number of
//!   derivations (`__ivm_count__`), aggregates carry the count of
//!   contributing non-NULL inputs.
//! - **Larson & Zhou (2007)**: "Efficient Maintenance of Materialized Outer-Join
//!   Views." ICDE 2007. Restrictions on outer-join views (equijoin
//!   conditions, null-rejecting predicates, join keys in the output).
//!
//! # Submodules
//! - `query`: Defining query tree
//! - `restrict`: Eligibility check
//! - `rewrite`: Bookkeeping-column augmentation and EXISTS lowering
//! - `cte`: CTE inlining
//! - `nullability`: Null-rejection and function-property analysis
//!
//! # Usage
//! ```ignore
//! use pg_immv::ivm::{augment, check};
//!
//! check(&query, config.max_nesting_depth)?;
//! let augmented = augment(&query, &column_names)?;
//! ```

pub mod cte;
pub mod nullability;
pub mod query;
pub mod restrict;
pub mod rewrite;

#[cfg(test)]
pub mod test_helpers;

pub use cte::inline_ctes;
pub use query::{DefiningQuery, Expr, JoinKind, RangeEntry, RelKind, SqlType};
pub use restrict::{Restriction, RestrictionChecker, RestrictionContext, check};
pub use rewrite::{AugmentedQuery, BookkeepingKind, StoredDefinition, augment};
