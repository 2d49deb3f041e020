//! Checkpoint data model shared by the stores, the migrator and the dispatcher.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CloudtapError;

/// Separator between the identity parts of a composed key.
const KEY_SEPARATOR: &str = "|";

/// Longest key the checkpoint backends accept.
pub const MAX_KEY_BYTES: usize = 1024;

/// Opaque checkpoint key.
///
/// Keys are derived deterministically from the source object so that
/// re-listing the same object always maps to the same record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckpointKey(String);

impl CheckpointKey {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Compose a key from task/input identity, account identity and object identity.
    pub fn compose(task: &str, account: &str, object: &str) -> Self {
        Self(format!(
            "{}{sep}{}{sep}{}",
            task,
            account,
            object,
            sep = KEY_SEPARATOR
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Object part of a composed key. A key that was not composed is all object.
    pub fn object(&self) -> &str {
        self.0.splitn(3, KEY_SEPARATOR).nth(2).unwrap_or(&self.0)
    }

    /// Check the key against the backend's key rules.
    pub fn validate(&self) -> Result<(), CloudtapError> {
        let reason = if self.0.is_empty() {
            Some("key is empty".to_string())
        } else if self.0.len() > MAX_KEY_BYTES {
            Some(format!("key exceeds {} bytes", MAX_KEY_BYTES))
        } else if self.0.chars().any(char::is_control) {
            Some("key contains control characters".to_string())
        } else {
            None
        };

        match reason {
            Some(reason) => Err(CloudtapError::InvalidKey {
                key: self.0.clone(),
                reason,
            }),
            None => Ok(()),
        }
    }
}

impl fmt::Display for CheckpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CheckpointKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for CheckpointKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// One durable progress record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    #[serde(rename = "_key")]
    pub key: CheckpointKey,
    /// Map or scalar payload; opaque to the stores.
    pub payload: serde_json::Value,
    /// Optional expiration (unix seconds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<i64>,
}

impl CheckpointRecord {
    pub fn new(key: impl Into<CheckpointKey>, payload: serde_json::Value) -> Self {
        Self {
            key: key.into(),
            payload,
            expiration: None,
        }
    }

    pub fn with_expiration(mut self, expiration: i64) -> Self {
        self.expiration = Some(expiration);
        self
    }

    /// Build a record from an object's ingestion progress.
    pub fn from_progress(
        key: CheckpointKey,
        progress: &ObjectProgress,
    ) -> Result<Self, CloudtapError> {
        Ok(Self::new(key, serde_json::to_value(progress)?))
    }

    /// Decode the payload as object progress, if it has that shape.
    pub fn progress(&self) -> Option<ObjectProgress> {
        serde_json::from_value(self.payload.clone()).ok()
    }
}

/// Steady-state payload written for a storage object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectProgress {
    /// Bytes of the object ingested so far.
    pub offset: u64,
    /// Object size at listing time.
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    pub last_modified: DateTime<Utc>,
}

impl ObjectProgress {
    pub fn is_complete(&self) -> bool {
        self.offset >= self.size
    }
}

/// Per-input migration flag.
///
/// Moves `NotMigrated -> Migrating -> Migrated` exactly once and is never reverted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MigrationState {
    NotMigrated,
    Migrating {
        owner: String,
        claimed_at: DateTime<Utc>,
    },
    Migrated {
        completed_at: DateTime<Utc>,
    },
}

impl MigrationState {
    pub fn is_migrated(&self) -> bool {
        matches!(self, MigrationState::Migrated { .. })
    }
}

/// On-disk / on-wire migration marker: `{is_migrated: 0|1}` plus claim details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationMarker {
    pub is_migrated: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&MigrationState> for MigrationMarker {
    fn from(state: &MigrationState) -> Self {
        match state {
            MigrationState::NotMigrated => Self {
                is_migrated: 0,
                owner: None,
                claimed_at: None,
                completed_at: None,
            },
            MigrationState::Migrating { owner, claimed_at } => Self {
                is_migrated: 0,
                owner: Some(owner.clone()),
                claimed_at: Some(*claimed_at),
                completed_at: None,
            },
            MigrationState::Migrated { completed_at } => Self {
                is_migrated: 1,
                owner: None,
                claimed_at: None,
                completed_at: Some(*completed_at),
            },
        }
    }
}

impl From<MigrationMarker> for MigrationState {
    fn from(marker: MigrationMarker) -> Self {
        if marker.is_migrated != 0 {
            return MigrationState::Migrated {
                completed_at: marker.completed_at.unwrap_or_else(Utc::now),
            };
        }
        match (marker.owner, marker.claimed_at) {
            (Some(owner), Some(claimed_at)) => MigrationState::Migrating { owner, claimed_at },
            _ => MigrationState::NotMigrated,
        }
    }
}
