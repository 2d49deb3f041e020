//! Legacy process-local checkpoint file.
//!
//! Layout: one JSON-lines append log per input. Each line is a `put` or
//! `delete` entry; opening the file replays the log into memory. Keys are
//! partitioned by a namespace prefix (e.g. `/MK/`), so a single file can hold
//! several logical key spaces.
//!
//! ```text
//! checkpoints/
//!   my_input.ckpt        <- append log
//!   my_input.ckpt.lock   <- present while a process has the file open
//! ```

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use cloudtap_core::{CheckpointKey, CheckpointRecord};

use crate::error::StoreError;
use crate::store::{BatchSaveReport, CheckpointStore};

/// Records written per append in `batch_save`.
const FILE_BATCH_SIZE: usize = 1000;

/// Logs shorter than this are never compacted.
const COMPACT_MIN_ENTRIES: usize = 64;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum LogEntry {
    Put { key: String, value: serde_json::Value },
    Delete { key: String },
}

struct FileState {
    entries: BTreeMap<String, serde_json::Value>,
    /// Lines currently in the log, live or superseded.
    log_len: usize,
    writer: Option<File>,
}

/// Legacy on-disk checkpoint store.
///
/// Values are stored as the record payload only; the legacy format has no
/// expiration field.
pub struct FileCheckpointStore {
    path: PathBuf,
    lock_path: PathBuf,
    partition: String,
    state: Mutex<FileState>,
    closed: AtomicBool,
}

impl FileCheckpointStore {
    /// Open (or create) the checkpoint file at `path`, scoped to `partition`.
    pub fn open(
        path: impl Into<PathBuf>,
        partition: impl Into<String>,
    ) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let (entries, log_len) = if path.exists() {
            replay(&path)?
        } else {
            (BTreeMap::new(), 0)
        };

        let mut writer = OpenOptions::new().create(true).append(true).open(&path)?;
        if !ends_with_newline(&path)? {
            writer.write_all(b"\n")?;
        }
        let lock_path = Self::lock_path_for(&path);
        std::fs::write(&lock_path, std::process::id().to_string())?;

        debug!(
            path = %path.display(),
            entries = entries.len(),
            "opened checkpoint file"
        );

        Ok(Self {
            path,
            lock_path,
            partition: partition.into(),
            state: Mutex::new(FileState {
                entries,
                log_len,
                writer: Some(writer),
            }),
            closed: AtomicBool::new(false),
        })
    }

    /// Whether a checkpoint file exists at `path`.
    pub fn exists(path: &Path) -> bool {
        path.is_file()
    }

    pub fn lock_path_for(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_os_string();
        name.push(".lock");
        PathBuf::from(name)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn partition(&self) -> &str {
        &self.partition
    }

    /// All `(key, value)` pairs under this store's partition, keys without the prefix.
    pub fn list(&self) -> Result<Vec<(String, serde_json::Value)>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .entries
            .range(self.partition.clone()..)
            .take_while(|(k, _)| k.starts_with(&self.partition))
            .map(|(k, v)| (k[self.partition.len()..].to_string(), v.clone()))
            .collect())
    }

    /// Number of live keys under this store's partition.
    pub fn len(&self) -> usize {
        let state = self.state.lock().unwrap();
        state
            .entries
            .keys()
            .filter(|k| k.starts_with(&self.partition))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close the store and delete the checkpoint file and its lock file.
    pub fn destroy(&self) -> Result<(), StoreError> {
        self.release();
        for p in [&self.path, &self.lock_path] {
            match std::fs::remove_file(p) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        info!(path = %self.path.display(), "removed legacy checkpoint file");
        Ok(())
    }

    fn full_key(&self, key: &CheckpointKey) -> String {
        format!("{}{}", self.partition, key.as_str())
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn append(&self, entries: Vec<LogEntry>) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let mut buf = Vec::new();
        for entry in &entries {
            serde_json::to_writer(&mut buf, entry)?;
            buf.push(b'\n');
        }

        let writer = state.writer.as_mut().ok_or(StoreError::Closed)?;
        writer.write_all(&buf)?;
        writer.sync_data()?;

        for entry in entries {
            match entry {
                LogEntry::Put { key, value } => {
                    state.entries.insert(key, value);
                }
                LogEntry::Delete { key } => {
                    state.entries.remove(&key);
                }
            }
            state.log_len += 1;
        }

        if state.log_len >= COMPACT_MIN_ENTRIES && state.log_len > state.entries.len() * 2 {
            self.compact(&mut state)?;
        }
        Ok(())
    }

    /// Rewrite the log with only live entries (temp file + rename).
    fn compact(&self, state: &mut FileState) -> Result<(), StoreError> {
        let tmp = self.path.with_extension("compact");
        {
            let mut out = File::create(&tmp)?;
            let mut buf = Vec::new();
            for (key, value) in &state.entries {
                serde_json::to_writer(
                    &mut buf,
                    &LogEntry::Put {
                        key: key.clone(),
                        value: value.clone(),
                    },
                )?;
                buf.push(b'\n');
            }
            out.write_all(&buf)?;
            out.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;

        debug!(
            path = %self.path.display(),
            before = state.log_len,
            after = state.entries.len(),
            "compacted checkpoint file"
        );
        state.log_len = state.entries.len();
        state.writer = Some(OpenOptions::new().append(true).open(&self.path)?);
        Ok(())
    }

    fn release(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Ok(mut state) = self.state.lock() {
            state.writer = None;
        }
        std::fs::remove_file(&self.lock_path).ok();
    }
}

fn ends_with_newline(path: &Path) -> Result<bool, StoreError> {
    let data = std::fs::read(path)?;
    Ok(data.last().map_or(true, |b| *b == b'\n'))
}

fn replay(path: &Path) -> Result<(BTreeMap<String, serde_json::Value>, usize), StoreError> {
    let reader = BufReader::new(File::open(path)?);
    let mut entries = BTreeMap::new();
    let mut log_len = 0usize;

    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<LogEntry>(&line) {
            Ok(LogEntry::Put { key, value }) => {
                entries.insert(key, value);
            }
            Ok(LogEntry::Delete { key }) => {
                entries.remove(&key);
            }
            Err(e) => {
                // A torn final line from a crash mid-append.
                warn!(
                    path = %path.display(),
                    line = line_no + 1,
                    error = %e,
                    "skipping unreadable checkpoint log line"
                );
                continue;
            }
        }
        log_len += 1;
    }
    Ok((entries, log_len))
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    fn name(&self) -> &str {
        "file"
    }

    fn max_batch_size(&self) -> usize {
        FILE_BATCH_SIZE
    }

    async fn get(&self, key: &CheckpointKey) -> Result<Option<CheckpointRecord>, StoreError> {
        self.ensure_open()?;
        let full = self.full_key(key);
        let state = self.state.lock().unwrap();
        Ok(state
            .entries
            .get(&full)
            .map(|v| CheckpointRecord::new(key.clone(), v.clone())))
    }

    async fn update(&self, record: CheckpointRecord) -> Result<(), StoreError> {
        self.ensure_open()?;
        record.key.validate()?;
        let key = self.full_key(&record.key);
        self.append(vec![LogEntry::Put {
            key,
            value: record.payload,
        }])
    }

    async fn batch_save(
        &self,
        records: Vec<CheckpointRecord>,
    ) -> Result<BatchSaveReport, StoreError> {
        self.ensure_open()?;
        let mut report = BatchSaveReport::default();
        let mut valid = Vec::with_capacity(records.len());
        for record in records {
            match record.key.validate() {
                Ok(()) => valid.push(record),
                Err(e) => report.failed.push(crate::store::FailedWrite {
                    record,
                    error: e.into(),
                }),
            }
        }

        for chunk in valid.chunks(FILE_BATCH_SIZE) {
            let entries = chunk
                .iter()
                .map(|r| LogEntry::Put {
                    key: self.full_key(&r.key),
                    value: r.payload.clone(),
                })
                .collect();
            self.append(entries)?;
            report.saved += chunk.len();
            report.requests += 1;
        }
        Ok(report)
    }

    async fn delete(&self, key: &CheckpointKey) -> Result<(), StoreError> {
        self.ensure_open()?;
        let full = self.full_key(key);
        let present = self.state.lock().unwrap().entries.contains_key(&full);
        if !present {
            return Err(StoreError::Permanent(format!("no checkpoint for key '{}'", key)));
        }
        self.append(vec![LogEntry::Delete { key: full }])
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.release();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store_in(dir: &Path) -> FileCheckpointStore {
        FileCheckpointStore::open(dir.join("input.ckpt"), "/MK/").unwrap()
    }

    #[tokio::test]
    async fn update_get_roundtrip_and_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        store.update(CheckpointRecord::new("obj1", json!(100))).await.unwrap();
        store.update(CheckpointRecord::new("obj1", json!(150))).await.unwrap();

        let rec = store.get(&"obj1".into()).await.unwrap().unwrap();
        assert_eq!(rec.payload, json!(150));
        store.close().await.unwrap();

        let reopened = store_in(tmp.path());
        let rec = reopened.get(&"obj1".into()).await.unwrap().unwrap();
        assert_eq!(rec.payload, json!(150));
        assert!(reopened.get(&"missing".into()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_is_scoped_to_partition() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("input.ckpt");
        let mk = FileCheckpointStore::open(&path, "/MK/").unwrap();
        mk.update(CheckpointRecord::new("a", json!(1))).await.unwrap();
        mk.update(CheckpointRecord::new("b", json!(2))).await.unwrap();
        mk.close().await.unwrap();

        let other = FileCheckpointStore::open(&path, "/OTHER/").unwrap();
        other.update(CheckpointRecord::new("c", json!(3))).await.unwrap();
        assert_eq!(other.list().unwrap(), vec![("c".to_string(), json!(3))]);
        other.close().await.unwrap();

        let mk = FileCheckpointStore::open(&path, "/MK/").unwrap();
        let listed = mk.list().unwrap();
        assert_eq!(
            listed,
            vec![("a".to_string(), json!(1)), ("b".to_string(), json!(2))]
        );
    }

    #[tokio::test]
    async fn delete_missing_key_is_permanent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        store.update(CheckpointRecord::new("a", json!(1))).await.unwrap();
        store.delete(&"a".into()).await.unwrap();
        assert!(store.get(&"a".into()).await.unwrap().is_none());

        let err = store.delete(&"a".into()).await.unwrap_err();
        assert!(matches!(err, StoreError::Permanent(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn compaction_keeps_live_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        for i in 0..200u64 {
            store.update(CheckpointRecord::new("hot", json!(i))).await.unwrap();
        }
        store.update(CheckpointRecord::new("cold", json!("x"))).await.unwrap();
        store.close().await.unwrap();

        let lines = std::fs::read_to_string(tmp.path().join("input.ckpt"))
            .unwrap()
            .lines()
            .count();
        assert!(lines < 200, "log was not compacted: {lines} lines");

        let reopened = store_in(tmp.path());
        assert_eq!(reopened.get(&"hot".into()).await.unwrap().unwrap().payload, json!(199));
        assert_eq!(reopened.len(), 2);
    }

    #[tokio::test]
    async fn torn_trailing_line_is_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("input.ckpt");
        std::fs::write(
            &path,
            "{\"op\":\"put\",\"key\":\"/MK/a\",\"value\":1}\n{\"op\":\"put\",\"ke",
        )
        .unwrap();
        let store = FileCheckpointStore::open(&path, "/MK/").unwrap();
        assert_eq!(store.list().unwrap(), vec![("a".to_string(), json!(1))]);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_blocks_writes() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        let lock = FileCheckpointStore::lock_path_for(store.path());
        assert!(lock.exists());

        store.close().await.unwrap();
        store.close().await.unwrap();
        assert!(!lock.exists());

        let err = store.update(CheckpointRecord::new("a", json!(1))).await.unwrap_err();
        assert!(matches!(err, StoreError::Closed));
    }

    #[tokio::test]
    async fn destroy_removes_file_and_lock() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        store.update(CheckpointRecord::new("a", json!(1))).await.unwrap();
        let path = store.path().to_path_buf();
        store.destroy().unwrap();
        assert!(!path.exists());
        assert!(!FileCheckpointStore::lock_path_for(&path).exists());
        assert!(!FileCheckpointStore::exists(&path));
    }
}
