//! Configuration for IMMV definition.
//!
//! [`ImmvConfig`] is a plain value passed to every entry point. It can be
//! built from JSON, and with the `pg18` feature from the extension's GUC
//! variables. GUC names are prefixed with `pg_immv.`.

use serde::Deserialize;

use crate::error::ImmvError;

/// Default depth guard for recursive traversals.
pub const DEFAULT_MAX_NESTING_DEPTH: usize = 100;

/// Settings that govern IMMV creation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImmvConfig {
    /// Maximum nesting of sub-selects, CTEs and EXISTS bodies walked
    /// before giving up with `NestingTooDeep`.
    pub max_nesting_depth: usize,
    /// Appended to the view name to form the automatic index name.
    pub index_name_suffix: String,
}

impl Default for ImmvConfig {
    fn default() -> Self {
        ImmvConfig {
            max_nesting_depth: DEFAULT_MAX_NESTING_DEPTH,
            index_name_suffix: "_index".to_string(),
        }
    }
}

impl ImmvConfig {
    /// Parse a JSON object; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ImmvError> {
        let config: ImmvConfig = serde_json::from_str(json)
            .map_err(|e| ImmvError::InvalidArgument(format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ImmvError> {
        if self.max_nesting_depth == 0 {
            return Err(ImmvError::InvalidArgument(
                "max_nesting_depth must be at least 1".to_string(),
            ));
        }
        if self.index_name_suffix.is_empty() {
            return Err(ImmvError::InvalidArgument(
                "index_name_suffix must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Current GUC values.
    #[cfg(feature = "pg18")]
    pub fn from_gucs() -> Self {
        ImmvConfig {
            max_nesting_depth: guc::pg_immv_max_nesting_depth(),
            ..ImmvConfig::default()
        }
    }
}

#[cfg(feature = "pg18")]
pub use guc::register_gucs;

#[cfg(feature = "pg18")]
mod guc {
    use pgrx::guc::*;

    /// Depth guard for query-tree traversals.
    pub static IMMV_MAX_NESTING_DEPTH: GucSetting<i32> =
        GucSetting::<i32>::new(super::DEFAULT_MAX_NESTING_DEPTH as i32);

    /// Register all GUC variables. Called from `_PG_init()`.
    pub fn register_gucs() {
        GucRegistry::define_int_guc(
            c"pg_immv.max_nesting_depth",
            c"Maximum query nesting depth analysed when creating an IMMV.",
            c"Deeper sub-select, CTE or EXISTS nesting is rejected instead of recursing further.",
            &IMMV_MAX_NESTING_DEPTH,
            1,      // min
            10_000, // max
            GucContext::Userset,
            GucFlags::default(),
        );
    }

    /// Returns the configured depth guard.
    pub fn pg_immv_max_nesting_depth() -> usize {
        usize::try_from(IMMV_MAX_NESTING_DEPTH.get()).unwrap_or(super::DEFAULT_MAX_NESTING_DEPTH)
    }
}
