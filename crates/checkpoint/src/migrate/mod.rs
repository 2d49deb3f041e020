//! One-shot transfer of a legacy checkpoint file into the shared store.
//!
//! The legacy file is never modified before the whole transfer succeeds, so
//! any failed, stopped or crashed run can be repeated from scratch: writes to
//! the target are idempotent per key.

mod kind;

pub use kind::{LegacyEntry, MigrationKind};

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cloudtap_core::CheckpointRecord;

use crate::error::MigrationError;
use crate::file::FileCheckpointStore;
use crate::marker::{new_owner_token, ClaimOutcome, MarkerStore};
use crate::store::CheckpointStore;

/// Partition of the legacy file holding object checkpoints.
pub const DEFAULT_PARTITION: &str = "/MK/";

const DEFAULT_LEASE: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationPhase {
    NotStarted,
    Migrating,
    Completed,
    /// Cancelled mid-transfer; the marker is left `migrating`.
    Stopped,
    /// A chunk could not be written; the marker is left `migrating`.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// This run transferred `migrated` records and removed the legacy file.
    Completed { migrated: usize },
    /// The input was already migrated; nothing was read or written.
    AlreadyDone,
    /// There was no legacy file; the input is now marked migrated.
    NothingToMigrate,
}

pub struct CheckpointMigrator {
    input: String,
    legacy_path: PathBuf,
    partition: String,
    kind: MigrationKind,
    target: Arc<dyn CheckpointStore>,
    markers: Arc<dyn MarkerStore>,
    token: String,
    lease: Duration,
    cancel: CancellationToken,
    phase: Mutex<MigrationPhase>,
}

impl CheckpointMigrator {
    pub fn new(
        input: impl Into<String>,
        legacy_path: impl Into<PathBuf>,
        target: Arc<dyn CheckpointStore>,
        markers: Arc<dyn MarkerStore>,
    ) -> Self {
        Self {
            input: input.into(),
            legacy_path: legacy_path.into(),
            partition: DEFAULT_PARTITION.to_string(),
            kind: MigrationKind::default(),
            target,
            markers,
            token: new_owner_token(),
            lease: DEFAULT_LEASE,
            cancel: CancellationToken::new(),
            phase: Mutex::new(MigrationPhase::NotStarted),
        }
    }

    pub fn with_kind(mut self, kind: MigrationKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = partition.into();
        self
    }

    /// Use a fixed owner token, e.g. to resume a claim held by an earlier instance.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn legacy_path(&self) -> &Path {
        &self.legacy_path
    }

    pub fn partition(&self) -> &str {
        &self.partition
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn phase(&self) -> MigrationPhase {
        *self.phase.lock().unwrap()
    }

    fn set_phase(&self, phase: MigrationPhase) {
        *self.phase.lock().unwrap() = phase;
    }

    /// Run the migration.
    ///
    /// `Err(InProgress)` and `Err(Stopped)` are signals, not failures: the
    /// caller carries on with the legacy store and retries next cycle.
    pub async fn migrate(&self) -> Result<MigrationOutcome, MigrationError> {
        if self.markers.load(&self.input).await?.is_migrated() {
            debug!(input = %self.input, "checkpoints already migrated");
            self.set_phase(MigrationPhase::Completed);
            return Ok(MigrationOutcome::AlreadyDone);
        }
        if self.cancel.is_cancelled() {
            return Err(MigrationError::Stopped {
                input: self.input.clone(),
                migrated: 0,
            });
        }

        match self
            .markers
            .try_claim(&self.input, &self.token, self.lease)
            .await?
        {
            ClaimOutcome::Claimed => {}
            ClaimOutcome::AlreadyDone => {
                self.set_phase(MigrationPhase::Completed);
                return Ok(MigrationOutcome::AlreadyDone);
            }
            ClaimOutcome::AlreadyInProgress { owner } => {
                info!(
                    input = %self.input,
                    owner = %owner,
                    "migration in progress elsewhere, skipping"
                );
                return Err(MigrationError::InProgress {
                    input: self.input.clone(),
                    owner,
                });
            }
        }

        self.set_phase(MigrationPhase::Migrating);
        let result = self.transfer().await;
        self.set_phase(match &result {
            Ok(_) => MigrationPhase::Completed,
            Err(MigrationError::Stopped { .. }) => MigrationPhase::Stopped,
            Err(_) => MigrationPhase::Failed,
        });
        result
    }

    async fn transfer(&self) -> Result<MigrationOutcome, MigrationError> {
        if !FileCheckpointStore::exists(&self.legacy_path) {
            self.markers.complete(&self.input, &self.token).await?;
            info!(
                input = %self.input,
                path = %self.legacy_path.display(),
                "no legacy checkpoint file, marked migrated"
            );
            return Ok(MigrationOutcome::NothingToMigrate);
        }

        let legacy = FileCheckpointStore::open(&self.legacy_path, &self.partition)?;
        let migrated = match self.copy(&legacy).await {
            Ok(n) => n,
            Err(e) => {
                legacy.close().await.ok();
                return Err(e);
            }
        };

        if let Err(e) = self.markers.complete(&self.input, &self.token).await {
            legacy.close().await.ok();
            return Err(e.into());
        }
        // Once marked migrated the file is never read again.
        if let Err(e) = legacy.destroy() {
            warn!(
                input = %self.input,
                path = %self.legacy_path.display(),
                error = %e,
                "failed to remove migrated checkpoint file"
            );
        }
        info!(input = %self.input, migrated, kind = %self.kind, "checkpoint migration completed");
        Ok(MigrationOutcome::Completed { migrated })
    }

    /// Copy every legacy entry to the target, returning the number written.
    async fn copy(&self, legacy: &FileCheckpointStore) -> Result<usize, MigrationError> {
        let entries = legacy.list()?;
        let total = entries.len();
        let records: Vec<CheckpointRecord> = entries
            .into_iter()
            .filter_map(|(key, value)| self.kind.load(&key, value))
            .map(|entry| self.kind.migrate(entry))
            .collect();
        if records.len() < total {
            debug!(
                input = %self.input,
                skipped = total - records.len(),
                "skipped non-checkpoint legacy entries"
            );
        }

        // Leave room in each backend call for concurrent live checkpoint writes.
        let chunk_size = self.target.max_batch_size().saturating_sub(1).max(1);
        let mut migrated = 0usize;

        for chunk in records.chunks(chunk_size) {
            if self.cancel.is_cancelled() {
                warn!(input = %self.input, migrated, "checkpoint migration stopped");
                return Err(MigrationError::Stopped {
                    input: self.input.clone(),
                    migrated,
                });
            }

            let report = self.target.batch_save(chunk.to_vec()).await?;
            migrated += report.saved;
            if !report.is_complete() {
                for failed in &report.failed {
                    warn!(
                        input = %self.input,
                        key = %failed.record.key,
                        error = %failed.error,
                        "checkpoint could not be migrated"
                    );
                }
                return Err(MigrationError::Incomplete {
                    input: self.input.clone(),
                    failed: report.failed.len(),
                });
            }
            debug!(input = %self.input, migrated, total = records.len(), "migrated chunk");
        }
        Ok(migrated)
    }
}
