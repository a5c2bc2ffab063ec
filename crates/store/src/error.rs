//! Engine-wide structured error taxonomy.
//!
//! Propagation policy: ingestion aggregates per-item errors and never fails a
//! batch for one bad item; background workers log and continue; façade query
//! methods return either a result or one of these variants, never partial
//! data.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngramError {
    /// Malformed input — rejected before any state change.
    #[error("invalid input: {0}")]
    InputInvalid(String),

    /// Same `(source_kind, source_id)` already stored. A silent skip at the
    /// batch level; surfaced as a variant so callers can count it.
    #[error("duplicate message: {source_kind}/{source_id}")]
    Duplicate {
        source_kind: String,
        source_id: String,
    },

    /// The identity resolver refused to commit; the probe was quarantined.
    #[error("resolver ambiguous: {0}")]
    ResolverAmbiguous(String),

    /// A collaborator call exceeded its deadline. The source row stays
    /// unprocessed for a later cycle.
    #[error("extractor deadline exceeded: {0}")]
    ExtractorTimeout(String),

    /// A collaborator returned output the engine could not interpret.
    #[error("extractor output malformed: {0}")]
    ExtractorMalformed(String),

    /// Optimistic write retries exhausted.
    #[error("storage conflict after retries: {0}")]
    StorageConflict(String),

    /// A referenced row vanished mid-transaction; the enclosing transaction
    /// is aborted.
    #[error("integrity violated: {0}")]
    IntegrityViolated(String),

    #[error("no {what} with id {id}")]
    NotFound { what: &'static str, id: String },

    #[error("schema migration failed: {0}")]
    Migration(String),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EngramError>;

impl EngramError {
    /// Whether the underlying failure is a lock/busy condition worth
    /// retrying before it becomes a [`EngramError::StorageConflict`].
    pub fn is_busy(&self) -> bool {
        match self {
            EngramError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}
