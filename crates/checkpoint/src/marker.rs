//! Per-input migration markers and the claim protocol.
//!
//! A claim moves an input from `not_migrated` to `migrating` under an owner
//! token. Only the owner may complete it. A claim whose lease has run out is
//! presumed abandoned by a dead process and may be taken over.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use cloudtap_core::{MigrationMarker, MigrationState};

use crate::error::StoreError;

/// Result of [`MarkerStore::try_claim`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    AlreadyInProgress { owner: String },
    AlreadyDone,
}

/// Generate an owner token identifying this process and migrator instance.
pub fn new_owner_token() -> String {
    format!("{}-{}", std::process::id(), Uuid::new_v4().simple())
}

#[async_trait]
pub trait MarkerStore: Send + Sync {
    async fn load(&self, input: &str) -> Result<MigrationState, StoreError>;

    /// Atomically claim the migration of `input` for `owner`.
    async fn try_claim(
        &self,
        input: &str,
        owner: &str,
        lease: Duration,
    ) -> Result<ClaimOutcome, StoreError>;

    /// Mark `input` migrated. Fails if `owner` no longer holds the claim.
    async fn complete(&self, input: &str, owner: &str) -> Result<(), StoreError>;
}

/// The claim decision, shared by every marker backend.
fn decide(
    state: &MigrationState,
    owner: &str,
    lease: Duration,
    now: DateTime<Utc>,
) -> ClaimOutcome {
    match state {
        MigrationState::Migrated { .. } => ClaimOutcome::AlreadyDone,
        MigrationState::NotMigrated => ClaimOutcome::Claimed,
        MigrationState::Migrating {
            owner: current,
            claimed_at,
        } => {
            let age = now.signed_duration_since(*claimed_at).to_std().unwrap_or_default();
            if current == owner {
                ClaimOutcome::Claimed
            } else if age >= lease {
                warn!(
                    previous_owner = %current,
                    age_secs = age.as_secs(),
                    "taking over expired migration claim"
                );
                ClaimOutcome::Claimed
            } else {
                ClaimOutcome::AlreadyInProgress {
                    owner: current.clone(),
                }
            }
        }
    }
}

fn completed(state: &MigrationState, owner: &str) -> Result<Option<MigrationState>, StoreError> {
    match state {
        MigrationState::Migrated { .. } => Ok(None),
        MigrationState::Migrating { owner: current, .. } if current == owner => {
            Ok(Some(MigrationState::Migrated {
                completed_at: Utc::now(),
            }))
        }
        MigrationState::Migrating { owner: current, .. } => Err(StoreError::Permanent(format!(
            "migration claim lost to '{}'",
            current
        ))),
        MigrationState::NotMigrated => Err(StoreError::Permanent(
            "migration completed without a claim".into(),
        )),
    }
}

// ── In-memory markers ─────────────────────────────────────────

#[derive(Default)]
pub struct MemoryMarkerStore {
    states: Mutex<HashMap<String, MigrationState>>,
}

impl MemoryMarkerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the state of `input`.
    pub fn set(&self, input: &str, state: MigrationState) {
        self.states.lock().unwrap().insert(input.to_string(), state);
    }
}

#[async_trait]
impl MarkerStore for MemoryMarkerStore {
    async fn load(&self, input: &str) -> Result<MigrationState, StoreError> {
        Ok(self
            .states
            .lock()
            .unwrap()
            .get(input)
            .cloned()
            .unwrap_or(MigrationState::NotMigrated))
    }

    async fn try_claim(
        &self,
        input: &str,
        owner: &str,
        lease: Duration,
    ) -> Result<ClaimOutcome, StoreError> {
        let mut states = self.states.lock().unwrap();
        let current = states
            .get(input)
            .cloned()
            .unwrap_or(MigrationState::NotMigrated);
        let outcome = decide(&current, owner, lease, Utc::now());
        if outcome == ClaimOutcome::Claimed {
            states.insert(
                input.to_string(),
                MigrationState::Migrating {
                    owner: owner.to_string(),
                    claimed_at: Utc::now(),
                },
            );
        }
        Ok(outcome)
    }

    async fn complete(&self, input: &str, owner: &str) -> Result<(), StoreError> {
        let mut states = self.states.lock().unwrap();
        let current = states
            .get(input)
            .cloned()
            .unwrap_or(MigrationState::NotMigrated);
        if let Some(next) = completed(&current, owner)? {
            states.insert(input.to_string(), next);
        }
        Ok(())
    }
}

// ── File markers ──────────────────────────────────────────────

/// Attempts to take the per-input critical-section lock before giving up.
const LOCK_ATTEMPTS: u32 = 50;
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(20);
/// A lock older than this was left behind by a process that died holding it.
const LOCK_STALE_AFTER: Duration = Duration::from_secs(10);

/// Contents of a marker lock file.
#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    pid: u32,
    acquired_at: DateTime<Utc>,
}

/// Markers stored as `{input}.migration.json` next to the input's checkpoint file.
///
/// Claims are serialized across processes on one host by an exclusive
/// `{input}.migration.lock` file held only for the read-decide-write step.
pub struct FileMarkerStore {
    dir: PathBuf,
}

/// Removes the lock file when dropped.
struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        std::fs::remove_file(&self.path).ok();
    }
}

impl FileMarkerStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn marker_path(&self, input: &str) -> PathBuf {
        self.dir.join(format!("{}.migration.json", safe_name(input)))
    }

    fn lock_path(&self, input: &str) -> PathBuf {
        self.dir.join(format!("{}.migration.lock", safe_name(input)))
    }

    async fn lock(&self, input: &str) -> Result<LockGuard, StoreError> {
        let path = self.lock_path(input);
        for _ in 0..LOCK_ATTEMPTS {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let guard = LockGuard { path };
                    let info = LockInfo {
                        pid: std::process::id(),
                        acquired_at: Utc::now(),
                    };
                    file.write_all(&serde_json::to_vec(&info)?)?;
                    return Ok(guard);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    match lock_age(&path) {
                        Some(age) if age > LOCK_STALE_AFTER => {
                            warn!(
                                lock = %path.display(),
                                age_secs = age.as_secs(),
                                "breaking stale marker lock"
                            );
                            match std::fs::remove_file(&path) {
                                Ok(()) => {}
                                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                                Err(e) => return Err(e.into()),
                            }
                        }
                        _ => tokio::time::sleep(LOCK_RETRY_DELAY).await,
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(StoreError::Transient(format!(
            "marker lock {} is held",
            path.display()
        )))
    }

    fn read(&self, input: &str) -> Result<MigrationState, StoreError> {
        let path = self.marker_path(input);
        if !path.exists() {
            return Ok(MigrationState::NotMigrated);
        }
        let json = std::fs::read_to_string(&path)?;
        let marker: MigrationMarker = serde_json::from_str(&json)?;
        Ok(marker.into())
    }

    fn write(&self, input: &str, state: &MigrationState) -> Result<(), StoreError> {
        let path = self.marker_path(input);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(&MigrationMarker::from(state))?;
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}

/// How long the lock at `path` has been held. Falls back to the file's
/// mtime while the holder has not written its [`LockInfo`] yet.
fn lock_age(path: &Path) -> Option<Duration> {
    let info = std::fs::read(path)
        .ok()
        .and_then(|bytes| serde_json::from_slice::<LockInfo>(&bytes).ok());
    let acquired_at = match info {
        Some(info) => info.acquired_at,
        None => DateTime::<Utc>::from(std::fs::metadata(path).ok()?.modified().ok()?),
    };
    (Utc::now() - acquired_at).to_std().ok()
}

/// Input names may contain `/`; flatten them to a safe filename.
fn safe_name(input: &str) -> String {
    input.replace('/', "__")
}

#[async_trait]
impl MarkerStore for FileMarkerStore {
    async fn load(&self, input: &str) -> Result<MigrationState, StoreError> {
        self.read(input)
    }

    async fn try_claim(
        &self,
        input: &str,
        owner: &str,
        lease: Duration,
    ) -> Result<ClaimOutcome, StoreError> {
        let _guard = self.lock(input).await?;
        let current = self.read(input)?;
        let outcome = decide(&current, owner, lease, Utc::now());
        if outcome == ClaimOutcome::Claimed {
            self.write(
                input,
                &MigrationState::Migrating {
                    owner: owner.to_string(),
                    claimed_at: Utc::now(),
                },
            )?;
            debug!(input, owner, "migration claimed");
        }
        Ok(outcome)
    }

    async fn complete(&self, input: &str, owner: &str) -> Result<(), StoreError> {
        let _guard = self.lock(input).await?;
        let current = self.read(input)?;
        if let Some(next) = completed(&current, owner)? {
            self.write(input, &next)?;
            info!(input, "migration marked complete");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEASE: Duration = Duration::from_secs(600);

    #[tokio::test]
    async fn first_claim_wins() {
        let store = MemoryMarkerStore::new();
        assert_eq!(
            store.try_claim("in", "a", LEASE).await.unwrap(),
            ClaimOutcome::Claimed
        );
        assert_eq!(
            store.try_claim("in", "b", LEASE).await.unwrap(),
            ClaimOutcome::AlreadyInProgress { owner: "a".into() }
        );
        // The owner may re-claim after its own failed attempt.
        assert_eq!(
            store.try_claim("in", "a", LEASE).await.unwrap(),
            ClaimOutcome::Claimed
        );
    }

    #[tokio::test]
    async fn expired_claim_is_taken_over() {
        let store = MemoryMarkerStore::new();
        store.set(
            "in",
            MigrationState::Migrating {
                owner: "dead".into(),
                claimed_at: Utc::now() - chrono::Duration::seconds(3600),
            },
        );
        assert_eq!(
            store.try_claim("in", "live", LEASE).await.unwrap(),
            ClaimOutcome::Claimed
        );
        assert!(store.complete("in", "dead").await.is_err());
        store.complete("in", "live").await.unwrap();
        assert!(store.load("in").await.unwrap().is_migrated());
    }

    #[tokio::test]
    async fn completed_marker_short_circuits() {
        let store = MemoryMarkerStore::new();
        store.try_claim("in", "a", LEASE).await.unwrap();
        store.complete("in", "a").await.unwrap();
        assert_eq!(
            store.try_claim("in", "b", LEASE).await.unwrap(),
            ClaimOutcome::AlreadyDone
        );
        // Completing twice is harmless.
        store.complete("in", "a").await.unwrap();
    }

    #[tokio::test]
    async fn file_markers_persist_and_release_lock() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileMarkerStore::new(tmp.path()).unwrap();
        assert_eq!(store.load("aws/billing").await.unwrap(), MigrationState::NotMigrated);

        assert_eq!(
            store.try_claim("aws/billing", "a", LEASE).await.unwrap(),
            ClaimOutcome::Claimed
        );
        assert!(!store.lock_path("aws/billing").exists());

        let reopened = FileMarkerStore::new(tmp.path()).unwrap();
        assert_eq!(
            reopened.try_claim("aws/billing", "b", LEASE).await.unwrap(),
            ClaimOutcome::AlreadyInProgress { owner: "a".into() }
        );

        store.complete("aws/billing", "a").await.unwrap();
        let json = std::fs::read_to_string(store.marker_path("aws/billing")).unwrap();
        let marker: MigrationMarker = serde_json::from_str(&json).unwrap();
        assert_eq!(marker.is_migrated, 1);
    }

    #[tokio::test]
    async fn file_claims_are_exclusive_under_contention() {
        let tmp = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(FileMarkerStore::new(tmp.path()).unwrap());
        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.try_claim("in", &format!("owner-{i}"), LEASE).await.unwrap()
            }));
        }
        let mut claimed = 0;
        for h in handles {
            if h.await.unwrap() == ClaimOutcome::Claimed {
                claimed += 1;
            }
        }
        assert_eq!(claimed, 1);
    }

    #[tokio::test]
    async fn stale_lock_from_crashed_process_is_broken() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileMarkerStore::new(tmp.path()).unwrap();
        let leftover = LockInfo {
            pid: 999_999,
            acquired_at: Utc::now() - chrono::Duration::hours(1),
        };
        std::fs::write(store.lock_path("in"), serde_json::to_vec(&leftover).unwrap()).unwrap();

        assert_eq!(
            store.try_claim("in", "a", LEASE).await.unwrap(),
            ClaimOutcome::Claimed
        );
        assert!(!store.lock_path("in").exists());
        store.complete("in", "a").await.unwrap();
        assert!(store.load("in").await.unwrap().is_migrated());
    }

    #[tokio::test]
    async fn live_lock_is_respected() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileMarkerStore::new(tmp.path()).unwrap();
        let held = LockInfo {
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };
        std::fs::write(store.lock_path("in"), serde_json::to_vec(&held).unwrap()).unwrap();

        let err = store.try_claim("in", "a", LEASE).await.unwrap_err();
        assert!(matches!(err, StoreError::Transient(_)));
        assert!(store.lock_path("in").exists());
        assert_eq!(store.load("in").await.unwrap(), MigrationState::NotMigrated);
    }

    #[test]
    fn owner_tokens_are_unique() {
        assert_ne!(new_owner_token(), new_owner_token());
        assert!(new_owner_token().starts_with(&std::process::id().to_string()));
    }
}
