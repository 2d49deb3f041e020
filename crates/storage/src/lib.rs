//! Object sources for the ingestion dispatcher, backed by `object_store`.

pub mod backend;
pub mod error;
pub mod source;

pub use backend::{LocalBackend, S3Backend, StorageBackend};
pub use error::SourceError;
pub use source::{ObjectDescriptor, ObjectSource, ObjectStoreSource};

/// Build the configured object source (S3 or local directory).
pub fn source_from_config(
    config: &cloudtap_core::Config,
) -> Result<ObjectStoreSource, SourceError> {
    Ok(ObjectStoreSource::new(StorageBackend::from_config(config)?))
}
