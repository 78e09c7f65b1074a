//! Error types for the scan pipeline.

use crate::cancel::Cancelled;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ScanError>;

#[derive(Debug, Error)]
pub enum ScanError {
    /// A fatal internal inconsistency, e.g. packages loaded in
    /// distinct lexical coordinate spaces.
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// The package loader or binary extractor failed.
    #[error("{phase} failed")]
    Load {
        phase: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// The advisory database was unreachable or returned malformed
    /// data. Fetch failures abort the scan; an incomplete report is
    /// worse than a visible failure.
    #[error("fetching advisories for {module} failed")]
    Fetch {
        module: String,
        #[source]
        source: anyhow::Error,
    },

    /// A finding rejected by emitter validation.
    #[error("invalid finding: {0}")]
    InvalidFinding(String),

    #[error(transparent)]
    Cancelled(#[from] Cancelled),

    /// An error surfaced by the output handler.
    #[error(transparent)]
    Handler(anyhow::Error),
}
