use thiserror::Error;

use cloudtap_checkpoint::StoreError;
use cloudtap_storage::SourceError;

#[derive(Error, Debug)]
pub enum DispatchError {
    /// Escaped the discovery loop; the whole cycle is cancelled.
    #[error("dispatch failed: {0}")]
    Fatal(String),

    #[error("object source error: {0}")]
    Source(#[from] SourceError),

    #[error("checkpoint store error: {0}")]
    Store(#[from] StoreError),

    #[error("event consumer went away")]
    ConsumerGone,
}

impl DispatchError {
    /// Whether this error ends the dispatch cycle rather than one object.
    pub fn is_fatal(&self) -> bool {
        match self {
            DispatchError::Fatal(_) | DispatchError::ConsumerGone => true,
            DispatchError::Source(e) => e.is_fatal(),
            DispatchError::Store(_) => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("checkpoint store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}
