//! Pull-based consumer side of a dispatch cycle.
//!
//! The caller repeatedly asks for the next batch of events. The checkpoint
//! of a batch is only staged when the batch is handed out, and committed to
//! the pending set on the following call (or on stop): asking for more is
//! the acknowledgement that the previous batch was delivered. Pending
//! checkpoints are flushed to the store by size or by age.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use cloudtap_checkpoint::migrate::DEFAULT_PARTITION;
use cloudtap_checkpoint::{
    CheckpointMigrator, CheckpointStore, FileCheckpointStore, MigrationOutcome, StoreError,
};
use cloudtap_core::config::IngestConfig;
use cloudtap_core::CheckpointRecord;

use crate::batch::PendingCheckpointBatch;
use crate::dispatcher::{DispatchHandle, DispatchItem, DispatchSummary, Received, StorageDispatcher};
use crate::error::IngestError;
use crate::transform::Event;

#[derive(Debug, Clone)]
pub struct CollectorSettings {
    /// How long one wait on the dispatcher lasts before housekeeping runs.
    pub poll_timeout: Duration,
    /// Maximum age of the oldest pending checkpoint.
    pub flush_interval: Duration,
    /// Pending checkpoints that trigger a flush. Defaults to the store's batch limit.
    pub batch_limit: Option<usize>,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(3),
            flush_interval: Duration::from_secs(120),
            batch_limit: None,
        }
    }
}

impl From<&IngestConfig> for CollectorSettings {
    fn from(config: &IngestConfig) -> Self {
        Self {
            poll_timeout: config.poll_timeout(),
            flush_interval: config.flush_interval(),
            batch_limit: config.batch_limit,
        }
    }
}

/// Chooses the checkpoint store for a cycle.
///
/// With a remote store configured, the legacy file is migrated first. If the
/// migration does not complete, the cycle runs against the legacy file and
/// migration is retried next cycle.
pub struct CheckpointSetup {
    legacy_path: PathBuf,
    partition: String,
    remote: Option<(Arc<dyn CheckpointStore>, Arc<CheckpointMigrator>)>,
}

impl CheckpointSetup {
    pub fn legacy(path: impl Into<PathBuf>) -> Self {
        Self {
            legacy_path: path.into(),
            partition: DEFAULT_PARTITION.to_string(),
            remote: None,
        }
    }

    pub fn with_partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = partition.into();
        self
    }

    /// Prefer `store`, once `migrator` has moved the legacy file into it.
    pub fn with_remote(
        mut self,
        store: Arc<dyn CheckpointStore>,
        migrator: Arc<CheckpointMigrator>,
    ) -> Self {
        self.remote = Some((store, migrator));
        self
    }

    pub fn legacy_path(&self) -> &Path {
        &self.legacy_path
    }

    pub async fn select(&self) -> Result<Arc<dyn CheckpointStore>, StoreError> {
        if let Some((store, migrator)) = &self.remote {
            match migrator.migrate().await {
                Ok(outcome) => {
                    if let MigrationOutcome::Completed { migrated } = outcome {
                        info!(input = migrator.input(), migrated, "legacy checkpoints migrated");
                    }
                    return Ok(store.clone());
                }
                Err(e) if e.is_signal() => {
                    info!(
                        input = migrator.input(),
                        reason = %e,
                        "migration not finished, using legacy checkpoints"
                    );
                }
                Err(e) => {
                    warn!(
                        input = migrator.input(),
                        error = %e,
                        "migration failed, using legacy checkpoints"
                    );
                }
            }
        }
        let legacy = FileCheckpointStore::open(&self.legacy_path, self.partition.clone())?;
        Ok(Arc::new(legacy))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectorStats {
    /// Items received from the dispatcher.
    pub items: usize,
    /// Non-empty batches handed to the caller.
    pub batches: usize,
    pub events: usize,
    pub flushes: usize,
    pub checkpoints_saved: usize,
    /// Checkpoints the store rejected permanently.
    pub checkpoints_dropped: usize,
    /// Checkpoints still pending when the cycle closed.
    pub unflushed: usize,
}

pub struct IngestionCollector {
    store: Arc<dyn CheckpointStore>,
    handle: DispatchHandle,
    pending: PendingCheckpointBatch,
    staged: Option<CheckpointRecord>,
    poll_timeout: Duration,
    cancel: CancellationToken,
    stats: CollectorStats,
    summary: Option<DispatchSummary>,
    finished: bool,
}

impl IngestionCollector {
    pub async fn start(
        setup: &CheckpointSetup,
        dispatcher: StorageDispatcher,
        settings: CollectorSettings,
    ) -> Result<Self, IngestError> {
        Self::start_with_parent(setup, dispatcher, settings, &CancellationToken::new()).await
    }

    /// Like [`start`](Self::start), stopping when `parent` is cancelled.
    pub async fn start_with_parent(
        setup: &CheckpointSetup,
        dispatcher: StorageDispatcher,
        settings: CollectorSettings,
        parent: &CancellationToken,
    ) -> Result<Self, IngestError> {
        let store = setup.select().await?;
        let limit = settings.batch_limit.unwrap_or_else(|| store.max_batch_size());
        let cancel = parent.child_token();

        info!(
            task = dispatcher.task(),
            store = store.name(),
            batch_limit = limit,
            prefixes = dispatcher.tasks().len(),
            "starting ingestion cycle"
        );
        let handle = dispatcher.start(store.clone(), cancel.clone());

        Ok(Self {
            store,
            handle,
            pending: PendingCheckpointBatch::new(limit, settings.flush_interval),
            staged: None,
            poll_timeout: settings.poll_timeout,
            cancel,
            stats: CollectorStats::default(),
            summary: None,
            finished: false,
        })
    }

    /// Acknowledge the previous batch and wait for the next one.
    ///
    /// `Ok(None)` once the cycle is over; by then every acknowledged
    /// checkpoint has been flushed (or logged as unflushed) and the store is
    /// closed. A fatal dispatch error is returned once, after the same
    /// teardown.
    pub async fn next_batch(&mut self) -> Result<Option<Vec<Event>>, IngestError> {
        if self.finished {
            return Ok(None);
        }
        self.commit_staged();
        if self.pending.should_flush() {
            self.flush_or_keep().await;
        }

        loop {
            let received = tokio::select! {
                _ = self.cancel.cancelled() => None,
                received = self.handle.recv_timeout(self.poll_timeout) => Some(received),
            };

            let item = match received {
                None | Some(Received::Closed) => {
                    self.finish().await?;
                    return Ok(None);
                }
                Some(Received::Item(item)) => item,
                Some(Received::Timeout) => {
                    if !self.handle.is_alive() {
                        match self.handle.try_recv() {
                            Some(item) => item,
                            None => {
                                self.finish().await?;
                                return Ok(None);
                            }
                        }
                    } else {
                        if self.pending.is_due() {
                            self.flush_or_keep().await;
                        }
                        continue;
                    }
                }
            };

            if let Some(events) = self.accept(item) {
                return Ok(Some(events));
            }
            if self.pending.should_flush() {
                self.flush_or_keep().await;
            }
        }
    }

    /// Acknowledge the last batch, flush, close the store and wait for the
    /// dispatcher to wind down.
    pub async fn stop(&mut self) -> Result<CollectorStats, IngestError> {
        self.cancel.cancel();
        self.finish().await?;
        Ok(self.stats.clone())
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn stats(&self) -> &CollectorStats {
        &self.stats
    }

    /// Dispatcher counters, available once the cycle has finished.
    pub fn summary(&self) -> Option<&DispatchSummary> {
        self.summary.as_ref()
    }

    pub fn store_name(&self) -> &str {
        self.store.name()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Returns the events to hand out; checkpoint-only items go straight to pending.
    fn accept(&mut self, item: DispatchItem) -> Option<Vec<Event>> {
        self.stats.items += 1;
        if item.events.is_empty() {
            if let Some(record) = item.checkpoint {
                self.pending.push(record);
            }
            return None;
        }
        self.stats.batches += 1;
        self.stats.events += item.events.len();
        self.staged = item.checkpoint;
        Some(item.events)
    }

    fn commit_staged(&mut self) {
        if let Some(record) = self.staged.take() {
            self.pending.push(record);
        }
    }

    /// A failed flush keeps its records pending for the next attempt.
    async fn flush_or_keep(&mut self) {
        if let Err(e) = self.flush().await {
            warn!(
                pending = self.pending.len(),
                store = self.store.name(),
                error = %e,
                "checkpoint flush failed, keeping batch for the next attempt"
            );
        }
    }

    /// Write every pending checkpoint. Records that failed transiently stay pending.
    async fn flush(&mut self) -> Result<(), StoreError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let records = self.pending.flush();
        let report = match self.store.batch_save(records.clone()).await {
            Ok(report) => report,
            Err(e) => {
                self.pending.restore(records);
                return Err(e);
            }
        };

        self.stats.flushes += 1;
        self.stats.checkpoints_saved += report.saved;
        let mut retry = Vec::new();
        for failed in report.failed {
            if failed.error.is_retryable() {
                retry.push(failed.record);
            } else {
                warn!(
                    key = %failed.record.key,
                    error = %failed.error,
                    "checkpoint rejected, dropping"
                );
                self.stats.checkpoints_dropped += 1;
            }
        }
        debug!(saved = report.saved, retry = retry.len(), "flushed checkpoints");
        self.pending.restore(retry);
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), IngestError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        let dispatched = self.handle.finish().await;
        self.commit_staged();
        if let Err(e) = self.flush().await {
            warn!(error = %e, "final checkpoint flush failed");
        }
        self.close_store().await;

        match dispatched {
            Ok(summary) => {
                info!(
                    events = self.stats.events,
                    checkpoints_saved = self.stats.checkpoints_saved,
                    ingested = summary.ingested,
                    cancelled = summary.cancelled,
                    "ingestion cycle finished"
                );
                self.summary = Some(summary);
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "dispatch failed");
                Err(e.into())
            }
        }
    }

    async fn close_store(&mut self) {
        if !self.pending.is_empty() {
            self.stats.unflushed = self.pending.len();
            error!(
                unflushed = self.stats.unflushed,
                store = self.store.name(),
                "checkpoints not persisted, their objects will be ingested again"
            );
        }
        if let Err(e) = self.store.close().await {
            warn!(store = self.store.name(), error = %e, "closing checkpoint store failed");
        }
    }
}
