//! Pending checkpoint accumulator.
//!
//! Holds the latest record per checkpoint key between flushes and reports a
//! flush as due when either the size threshold or the time window is
//! reached, whichever comes first.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use cloudtap_core::{CheckpointKey, CheckpointRecord};

pub struct PendingCheckpointBatch {
    entries: BTreeMap<CheckpointKey, CheckpointRecord>,
    max_size: usize,
    max_wait: Duration,
    batch_started: Option<Instant>,
}

impl PendingCheckpointBatch {
    /// - `max_size`: flush once this many distinct keys are pending.
    /// - `max_wait`: flush once this long has passed since the first record
    ///   of the current batch arrived.
    pub fn new(max_size: usize, max_wait: Duration) -> Self {
        Self {
            entries: BTreeMap::new(),
            max_size: max_size.max(1),
            max_wait,
            batch_started: None,
        }
    }

    /// Upsert a record; a later record for the same key replaces the earlier one.
    pub fn push(&mut self, record: CheckpointRecord) {
        if self.batch_started.is_none() {
            self.batch_started = Some(Instant::now());
        }
        self.entries.insert(record.key.clone(), record);
    }

    /// Put back records whose flush failed. Keys updated since then keep
    /// their newer record.
    pub fn restore(&mut self, records: Vec<CheckpointRecord>) {
        if records.is_empty() {
            return;
        }
        if self.batch_started.is_none() {
            self.batch_started = Some(Instant::now());
        }
        for record in records {
            self.entries.entry(record.key.clone()).or_insert(record);
        }
    }

    pub fn should_flush(&self) -> bool {
        self.entries.len() >= self.max_size || self.is_due()
    }

    /// Whether the time window has elapsed for a non-empty batch.
    pub fn is_due(&self) -> bool {
        match self.batch_started {
            Some(started) => !self.entries.is_empty() && started.elapsed() >= self.max_wait,
            None => false,
        }
    }

    /// Take every pending record, ordered by key, and reset the timer.
    pub fn flush(&mut self) -> Vec<CheckpointRecord> {
        self.batch_started = None;
        std::mem::take(&mut self.entries).into_values().collect()
    }

    pub fn try_flush(&mut self) -> Option<Vec<CheckpointRecord>> {
        if self.should_flush() {
            Some(self.flush())
        } else {
            None
        }
    }

    pub fn get(&self, key: &CheckpointKey) -> Option<&CheckpointRecord> {
        self.entries.get(key)
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
