use thiserror::Error;

use cloudtap_core::CloudtapError;

/// Errors surfaced by [`CheckpointStore`](crate::CheckpointStore) backends.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Network or backend-busy failure; safe to retry with backoff.
    #[error("transient store error: {0}")]
    Transient(String),

    /// Bad request, invalid key, missing record on delete; never retried.
    #[error("permanent store error: {0}")]
    Permanent(String),

    #[error("invalid checkpoint key: {0}")]
    InvalidKey(String),

    #[error("checkpoint store is closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

impl From<CloudtapError> for StoreError {
    fn from(e: CloudtapError) -> Self {
        match e {
            CloudtapError::InvalidKey { .. } => StoreError::InvalidKey(e.to_string()),
            CloudtapError::Io(io) => StoreError::Io(io),
            other => StoreError::Permanent(other.to_string()),
        }
    }
}

/// Outcomes of [`CheckpointMigrator::migrate`](crate::CheckpointMigrator::migrate)
/// other than success.
///
/// `InProgress` and `Stopped` are control-flow signals: the caller carries on
/// with normal ingestion and retries the migration next cycle.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("migration of '{input}' is in progress elsewhere (owner: {owner})")]
    InProgress { input: String, owner: String },

    #[error("migration of '{input}' stopped after {migrated} records")]
    Stopped { input: String, migrated: usize },

    #[error("migration of '{input}' incomplete: {failed} records could not be written")]
    Incomplete { input: String, failed: usize },

    #[error("migration store error: {0}")]
    Store(#[from] StoreError),
}

impl MigrationError {
    /// Whether this is an expected control-flow signal rather than a failure.
    pub fn is_signal(&self) -> bool {
        matches!(self, MigrationError::InProgress { .. } | MigrationError::Stopped { .. })
    }
}
