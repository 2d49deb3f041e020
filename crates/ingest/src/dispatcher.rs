//! Concurrent discovery and fetch of storage objects.
//!
//! The dispatcher lists every configured prefix on its own task and fans the
//! listed objects out to a bounded pool of workers. Workers fetch objects in
//! ranges, transform them into events, and push `(events, checkpoint)` items
//! into a bounded channel. A full channel blocks the workers, throttling
//! discovery to the consumer's pace.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use cloudtap_checkpoint::{CheckpointStore, StoreError};
use cloudtap_core::config::IngestConfig;
use cloudtap_core::{CheckpointKey, CheckpointRecord, ObjectProgress};
use cloudtap_storage::{ObjectDescriptor, ObjectSource};

use crate::error::DispatchError;
use crate::key::{resume_point, KeyCondition, KeyLeases, ResumePoint};
use crate::transform::{Event, LineTransformer, Transformer};

/// One prefix to enumerate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchTask {
    pub prefix: String,
}

impl DispatchTask {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

/// Events read from one range of an object, with the checkpoint that
/// records them as ingested.
#[derive(Debug, Clone)]
pub struct DispatchItem {
    pub events: Vec<Event>,
    pub checkpoint: Option<CheckpointRecord>,
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub worker_threads_num: usize,
    pub channel_capacity: usize,
    pub fetch_chunk_bytes: usize,
    /// How long outstanding workers get to finish after cancellation.
    pub shutdown_timeout: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self::from(&IngestConfig::default())
    }
}

impl From<&IngestConfig> for DispatchSettings {
    fn from(config: &IngestConfig) -> Self {
        Self {
            worker_threads_num: config.worker_threads_num.max(1),
            channel_capacity: config.channel_capacity.max(1),
            fetch_chunk_bytes: config.fetch_chunk_bytes.max(1),
            shutdown_timeout: config.shutdown_timeout(),
        }
    }
}

/// Per-object result of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectOutcome {
    Ingested { chunks: usize },
    UpToDate,
    Skipped(KeyCondition),
    Cancelled,
}

/// Counters for one dispatch cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub listed: usize,
    pub dispatched: usize,
    pub ingested: usize,
    pub up_to_date: usize,
    pub skipped: usize,
    pub failed: usize,
    pub failed_tasks: usize,
    pub cancelled: bool,
}

impl DispatchSummary {
    /// Account for one finished worker. Returns the error if it is fatal.
    fn record(
        &mut self,
        joined: Result<Result<ObjectOutcome, DispatchError>, JoinError>,
    ) -> Option<DispatchError> {
        match joined {
            Ok(Ok(ObjectOutcome::Ingested { .. })) => self.ingested += 1,
            Ok(Ok(ObjectOutcome::UpToDate)) => self.up_to_date += 1,
            Ok(Ok(ObjectOutcome::Skipped(_))) => self.skipped += 1,
            Ok(Ok(ObjectOutcome::Cancelled)) => {}
            Ok(Err(e)) if e.is_fatal() => {
                self.failed += 1;
                return Some(e);
            }
            Ok(Err(e)) => {
                warn!(error = %e, "object processing failed, skipping object");
                self.failed += 1;
            }
            Err(e) if e.is_cancelled() => {}
            Err(e) => {
                error!(error = %e, "object worker panicked");
                self.failed += 1;
            }
        }
        None
    }
}

pub struct StorageDispatcher {
    task: String,
    tasks: Vec<DispatchTask>,
    source: Arc<dyn ObjectSource>,
    transformer: Arc<dyn Transformer>,
    leases: KeyLeases,
    settings: DispatchSettings,
}

impl StorageDispatcher {
    /// `task` names the input; it is the first part of every checkpoint key.
    pub fn new(task: impl Into<String>, source: Arc<dyn ObjectSource>) -> Self {
        Self {
            task: task.into(),
            tasks: Vec::new(),
            source,
            transformer: Arc::new(LineTransformer),
            leases: KeyLeases::new(),
            settings: DispatchSettings::default(),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.tasks.push(DispatchTask::new(prefix));
        self
    }

    pub fn with_tasks(mut self, tasks: impl IntoIterator<Item = DispatchTask>) -> Self {
        self.tasks.extend(tasks);
        self
    }

    pub fn with_transformer(mut self, transformer: Arc<dyn Transformer>) -> Self {
        self.transformer = transformer;
        self
    }

    /// Share key ownership with other dispatchers in this process.
    pub fn with_leases(mut self, leases: KeyLeases) -> Self {
        self.leases = leases;
        self
    }

    pub fn with_settings(mut self, settings: DispatchSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn tasks(&self) -> &[DispatchTask] {
        &self.tasks
    }

    /// Spawn the discovery loop. Checkpoints are read from `store`; the
    /// dispatcher stops when `cancel` fires.
    pub fn start(
        self,
        store: Arc<dyn CheckpointStore>,
        cancel: CancellationToken,
    ) -> DispatchHandle {
        let (tx, rx) = mpsc::channel(self.settings.channel_capacity.max(1));
        let alive = Arc::new(AtomicBool::new(true));
        // Fatal errors cancel this child, never the caller's token.
        let cancel = cancel.child_token();

        let ctx = Arc::new(WorkerContext {
            task: self.task,
            source: self.source,
            store,
            transformer: self.transformer,
            leases: self.leases,
            fetch_chunk_bytes: self.settings.fetch_chunk_bytes.max(1) as u64,
        });

        let join = tokio::spawn(run_discovery(
            ctx,
            self.tasks,
            self.settings,
            tx,
            cancel.clone(),
            alive.clone(),
        ));

        DispatchHandle {
            rx,
            alive,
            cancel,
            join: Some(join),
        }
    }
}

/// Result of [`DispatchHandle::recv_timeout`].
#[derive(Debug)]
pub enum Received {
    Item(DispatchItem),
    /// Nothing arrived in time; the dispatcher may still be running.
    Timeout,
    /// Every producer is gone and the channel is drained.
    Closed,
}

/// The consumer's side of a running dispatcher.
pub struct DispatchHandle {
    rx: mpsc::Receiver<DispatchItem>,
    alive: Arc<AtomicBool>,
    cancel: CancellationToken,
    join: Option<JoinHandle<Result<DispatchSummary, DispatchError>>>,
}

impl DispatchHandle {
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Received {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(item)) => Received::Item(item),
            Ok(None) => Received::Closed,
            Err(_) => Received::Timeout,
        }
    }

    pub fn try_recv(&mut self) -> Option<DispatchItem> {
        self.rx.try_recv().ok()
    }

    /// False once the discovery loop and all of its workers have finished.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the discovery loop to end and take its result. Later calls
    /// return an empty summary.
    pub async fn finish(&mut self) -> Result<DispatchSummary, DispatchError> {
        match self.join.take() {
            Some(join) => match join.await {
                Ok(result) => result,
                Err(e) => Err(DispatchError::Fatal(format!("discovery task failed: {e}"))),
            },
            None => Ok(DispatchSummary::default()),
        }
    }
}

impl Drop for DispatchHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct WorkerContext {
    task: String,
    source: Arc<dyn ObjectSource>,
    store: Arc<dyn CheckpointStore>,
    transformer: Arc<dyn Transformer>,
    leases: KeyLeases,
    fetch_chunk_bytes: u64,
}

/// Clears the alive flag however the discovery loop exits.
struct AliveGuard(Arc<AtomicBool>);

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

type Workers = JoinSet<Result<ObjectOutcome, DispatchError>>;

async fn run_discovery(
    ctx: Arc<WorkerContext>,
    tasks: Vec<DispatchTask>,
    settings: DispatchSettings,
    tx: mpsc::Sender<DispatchItem>,
    cancel: CancellationToken,
    alive: Arc<AtomicBool>,
) -> Result<DispatchSummary, DispatchError> {
    let _alive = AliveGuard(alive);
    let semaphore = Arc::new(Semaphore::new(settings.worker_threads_num.max(1)));
    let mut workers: Workers = JoinSet::new();
    let mut summary = DispatchSummary::default();
    let mut seen = HashSet::new();
    let mut fatal: Option<DispatchError> = None;

    'tasks: for task in &tasks {
        let listed = tokio::select! {
            _ = cancel.cancelled() => break,
            listed = ctx.source.list(&task.prefix) => listed,
        };
        let objects = match listed {
            Ok(objects) => objects,
            Err(e) if e.is_fatal() => {
                error!(
                    task = %ctx.task,
                    prefix = %task.prefix,
                    error = %e,
                    "listing failed, aborting dispatch"
                );
                fatal = Some(e.into());
                break;
            }
            Err(e) => {
                warn!(
                    task = %ctx.task,
                    prefix = %task.prefix,
                    error = %e,
                    "listing failed, skipping prefix"
                );
                summary.failed_tasks += 1;
                continue;
            }
        };
        debug!(task = %ctx.task, prefix = %task.prefix, objects = objects.len(), "listed prefix");
        summary.listed += objects.len();

        for object in objects {
            // Overlapping prefixes list the same object more than once.
            if !seen.insert(object.location.clone()) {
                continue;
            }
            let permit = tokio::select! {
                _ = cancel.cancelled() => break 'tasks,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break 'tasks,
                },
            };
            while let Some(done) = workers.try_join_next() {
                if let Some(e) = summary.record(done) {
                    fatal = Some(e);
                    break 'tasks;
                }
            }

            let ctx = ctx.clone();
            let tx = tx.clone();
            let child = cancel.child_token();
            workers.spawn(async move {
                let _permit = permit;
                process_object(&ctx, object, &tx, &child).await
            });
            summary.dispatched += 1;
        }
    }
    drop(tx);

    if fatal.is_none() && !cancel.is_cancelled() {
        while let Some(done) = workers.join_next().await {
            if let Some(e) = summary.record(done) {
                fatal = Some(e);
                break;
            }
        }
    }

    if fatal.is_some() || cancel.is_cancelled() {
        cancel.cancel();
        shutdown_workers(&mut workers, &mut summary, settings.shutdown_timeout).await;
    }

    summary.cancelled = cancel.is_cancelled();
    info!(
        task = %ctx.task,
        listed = summary.listed,
        dispatched = summary.dispatched,
        ingested = summary.ingested,
        up_to_date = summary.up_to_date,
        skipped = summary.skipped,
        failed = summary.failed,
        cancelled = summary.cancelled,
        "dispatch cycle finished"
    );

    match fatal {
        Some(e) => Err(e),
        None => Ok(summary),
    }
}

/// Give outstanding workers `timeout` to wind down, then abort the rest.
async fn shutdown_workers(workers: &mut Workers, summary: &mut DispatchSummary, timeout: Duration) {
    let drained = tokio::time::timeout(timeout, async {
        while let Some(done) = workers.join_next().await {
            summary.record(done);
        }
    })
    .await;

    if drained.is_err() {
        warn!(outstanding = workers.len(), "workers did not stop in time, aborting");
        workers.shutdown().await;
    }
}

/// Ingest one object from its last checkpoint onward.
async fn process_object(
    ctx: &WorkerContext,
    object: ObjectDescriptor,
    tx: &mpsc::Sender<DispatchItem>,
    cancel: &CancellationToken,
) -> Result<ObjectOutcome, DispatchError> {
    let key = CheckpointKey::compose(&ctx.task, ctx.source.account(), &object.location);
    if let Err(e) = key.validate() {
        warn!(object = %object.location, error = %e, "invalid checkpoint key, skipping object");
        return Ok(ObjectOutcome::Skipped(KeyCondition::Invalid));
    }
    let Some(_lease) = ctx.leases.try_acquire(&key) else {
        debug!(key = %key, "key owned elsewhere, skipping for this cycle");
        return Ok(ObjectOutcome::Skipped(KeyCondition::OwnedElsewhere));
    };

    let stored = match ctx.store.get(&key).await {
        Ok(stored) => stored,
        Err(StoreError::InvalidKey(reason)) => {
            warn!(key = %key, reason = %reason, "checkpoint key rejected, skipping object");
            return Ok(ObjectOutcome::Skipped(KeyCondition::Invalid));
        }
        Err(e) => return Err(e.into()),
    };

    let mut offset = match resume_point(stored.as_ref(), &object) {
        ResumePoint::UpToDate => return Ok(ObjectOutcome::UpToDate),
        ResumePoint::Offset(offset) => offset,
        ResumePoint::Restart(condition) => {
            debug!(key = %key, condition = %condition, "reading object from the start");
            0
        }
    };

    if object.size == 0 {
        let record = checkpoint(&key, &object, 0)?;
        let item = DispatchItem {
            events: Vec::new(),
            checkpoint: Some(record),
        };
        return match send(tx, item, cancel).await? {
            true => Ok(ObjectOutcome::Ingested { chunks: 0 }),
            false => Ok(ObjectOutcome::Cancelled),
        };
    }

    let mut chunks = 0usize;
    let mut window = ctx.fetch_chunk_bytes;
    while offset < object.size {
        let end = offset.saturating_add(window).min(object.size);
        let data = tokio::select! {
            _ = cancel.cancelled() => return Ok(ObjectOutcome::Cancelled),
            fetched = ctx.source.fetch(&object, offset..end) => fetched?,
        };
        if data.is_empty() {
            warn!(key = %key, offset, size = object.size, "object shorter than listed, stopping");
            break;
        }

        let out = ctx
            .transformer
            .transform(&object, offset, &data, end == object.size);
        if out.consumed == 0 {
            // A single record spans the whole window; fetch a wider one.
            window = window.saturating_mul(2);
            continue;
        }
        window = ctx.fetch_chunk_bytes;
        offset += out.consumed as u64;

        let record = checkpoint(&key, &object, offset)?;
        let item = DispatchItem {
            events: out.events,
            checkpoint: Some(record),
        };
        if !send(tx, item, cancel).await? {
            return Ok(ObjectOutcome::Cancelled);
        }
        chunks += 1;
    }

    debug!(key = %key, chunks, "object ingested");
    Ok(ObjectOutcome::Ingested { chunks })
}

fn checkpoint(
    key: &CheckpointKey,
    object: &ObjectDescriptor,
    offset: u64,
) -> Result<CheckpointRecord, DispatchError> {
    let progress = ObjectProgress {
        offset,
        size: object.size,
        etag: object.etag.clone(),
        last_modified: object.last_modified,
    };
    CheckpointRecord::from_progress(key.clone(), &progress)
        .map_err(|e| DispatchError::Store(e.into()))
}

/// Push an item, waiting for channel space. `Ok(false)` when cancelled first.
async fn send(
    tx: &mpsc::Sender<DispatchItem>,
    item: DispatchItem,
    cancel: &CancellationToken,
) -> Result<bool, DispatchError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Ok(false),
        sent = tx.send(item) => sent.map(|_| true).map_err(|_| DispatchError::ConsumerGone),
    }
}
