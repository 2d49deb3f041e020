//! Checkpoint persistence for cloud-object ingestion.
//!
//! Two [`CheckpointStore`] backends live here: the legacy, process-local
//! [`FileCheckpointStore`] and the shared [`RemoteCheckpointStore`]. The
//! [`CheckpointMigrator`] drains the former into the latter exactly once.

pub mod error;
pub mod file;
pub mod kv;
pub mod marker;
pub mod migrate;
pub mod remote;
pub mod retry;
pub mod store;

pub use error::{MigrationError, StoreError};
pub use file::FileCheckpointStore;
pub use kv::{HttpKvBackend, KvBackend, MemoryKvBackend};
pub use marker::{new_owner_token, ClaimOutcome, FileMarkerStore, MarkerStore, MemoryMarkerStore};
pub use migrate::{CheckpointMigrator, MigrationKind, MigrationOutcome, MigrationPhase};
pub use remote::RemoteCheckpointStore;
pub use retry::RetryPolicy;
pub use store::{BatchSaveReport, CheckpointStore, FailedWrite};
