//! Concurrent ingestion of storage objects with durable checkpoints.
//!
//! A [`StorageDispatcher`] lists and reads objects on a worker pool; an
//! [`IngestionCollector`] pulls the resulting events, acknowledges them and
//! persists their checkpoints in batches.

pub mod batch;
pub mod collector;
pub mod dispatcher;
pub mod error;
pub mod key;
pub mod transform;

pub use batch::PendingCheckpointBatch;
pub use collector::{CheckpointSetup, CollectorSettings, CollectorStats, IngestionCollector};
pub use dispatcher::{
    DispatchHandle, DispatchItem, DispatchSettings, DispatchSummary, DispatchTask, ObjectOutcome,
    Received, StorageDispatcher,
};
pub use error::{DispatchError, IngestError};
pub use key::{resume_point, KeyCondition, KeyLease, KeyLeases, ResumePoint};
pub use transform::{Event, LineTransformer, Transformed, Transformer};
