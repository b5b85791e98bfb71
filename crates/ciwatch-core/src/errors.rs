//! Typed configuration errors.
//!
//! Invalid configuration is the one error class that must fail fast and
//! propagate unmodified to the pipeline caller (never silently defaulted).
//! Missing remote data is not an error at all; see `source::Absent`.

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unrecognized rerun policy `{0}` (expected none|latest|all)")]
    UnknownRerunPolicy(String),

    #[error("malformed event template: {0}")]
    MalformedTemplate(String),
}
