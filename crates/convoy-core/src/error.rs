//! Error conditions that callers branch on.
//!
//! Everything else travels as `anyhow::Error` with context attached at the
//! failing call site.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The ref (or a fragment key inside it) does not exist.
    #[error("ref not found: {0}")]
    RefNotFound(String),
    #[error("invalid glob pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
    #[error("link cycle while resolving {0}")]
    LinkCycle(String),
    #[error("{0} is a latest-release pointer and can only hold a link")]
    LatestIsLink(String),
}

/// Build a not-found error for `reference`.
pub fn not_found(reference: impl Into<String>) -> anyhow::Error {
    StoreError::RefNotFound(reference.into()).into()
}

/// Whether `err` (or anything in its context chain) is [`StoreError::RefNotFound`].
pub fn is_not_found(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<StoreError>(),
            Some(StoreError::RefNotFound(_))
        )
    })
}
