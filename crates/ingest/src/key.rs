//! Checkpoint-key conditions and in-process key ownership.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};

use cloudtap_core::{CheckpointKey, CheckpointRecord};
use cloudtap_storage::ObjectDescriptor;

/// Why an object was skipped or restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyCondition {
    /// The key failed validation; the object is skipped.
    Invalid,
    /// Another worker holds the key; the object is skipped this cycle.
    OwnedElsewhere,
    /// No checkpoint yet, or the backend has not caught up with a recent write.
    NotFound,
    /// The checkpoint does not describe the listed object.
    Stale,
}

impl fmt::Display for KeyCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            KeyCondition::Invalid => "invalid",
            KeyCondition::OwnedElsewhere => "owned_elsewhere",
            KeyCondition::NotFound => "not_found",
            KeyCondition::Stale => "stale",
        })
    }
}

/// Where processing of an object starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumePoint {
    Offset(u64),
    /// Start from the beginning.
    Restart(KeyCondition),
    /// Fully ingested and unchanged.
    UpToDate,
}

/// Compare a stored checkpoint with the freshly listed object.
pub fn resume_point(stored: Option<&CheckpointRecord>, object: &ObjectDescriptor) -> ResumePoint {
    let Some(record) = stored else {
        return ResumePoint::Restart(KeyCondition::NotFound);
    };
    let Some(progress) = record.progress() else {
        return ResumePoint::Restart(KeyCondition::Stale);
    };

    let etag_changed = matches!(
        (&progress.etag, &object.etag),
        (Some(seen), Some(listed)) if seen != listed
    );
    if etag_changed || progress.offset > object.size {
        return ResumePoint::Restart(KeyCondition::Stale);
    }
    if progress.offset == object.size {
        return ResumePoint::UpToDate;
    }
    ResumePoint::Offset(progress.offset)
}

/// Keys currently being processed in this process.
#[derive(Clone, Default)]
pub struct KeyLeases {
    held: Arc<Mutex<HashSet<CheckpointKey>>>,
}

impl KeyLeases {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of `key`, or `None` if someone else holds it.
    pub fn try_acquire(&self, key: &CheckpointKey) -> Option<KeyLease> {
        let mut held = self.held.lock().unwrap();
        if !held.insert(key.clone()) {
            return None;
        }
        Some(KeyLease {
            key: key.clone(),
            held: self.held.clone(),
        })
    }

    pub fn is_held(&self, key: &CheckpointKey) -> bool {
        self.held.lock().unwrap().contains(key)
    }

    pub fn len(&self) -> usize {
        self.held.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Releases its key on drop.
pub struct KeyLease {
    key: CheckpointKey,
    held: Arc<Mutex<HashSet<CheckpointKey>>>,
}

impl KeyLease {
    pub fn key(&self) -> &CheckpointKey {
        &self.key
    }
}

impl Drop for KeyLease {
    fn drop(&mut self) {
        if let Ok(mut held) = self.held.lock() {
            held.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use cloudtap_core::ObjectProgress;

    fn object(size: u64, etag: &str) -> ObjectDescriptor {
        ObjectDescriptor {
            location: "logs/a.log".into(),
            size,
            last_modified: Utc::now(),
            etag: Some(etag.into()),
        }
    }

    fn stored(offset: u64, size: u64, etag: Option<&str>) -> CheckpointRecord {
        let progress = ObjectProgress {
            offset,
            size,
            etag: etag.map(String::from),
            last_modified: Utc::now(),
        };
        CheckpointRecord::from_progress("k".into(), &progress).unwrap()
    }

    #[test]
    fn resume_point_classification() {
        let obj = object(100, "v1");
        assert_eq!(
            resume_point(None, &obj),
            ResumePoint::Restart(KeyCondition::NotFound)
        );
        assert_eq!(
            resume_point(Some(&stored(40, 100, Some("v1"))), &obj),
            ResumePoint::Offset(40)
        );
        assert_eq!(
            resume_point(Some(&stored(100, 100, Some("v1"))), &obj),
            ResumePoint::UpToDate
        );
        assert_eq!(
            resume_point(Some(&stored(40, 100, Some("v0"))), &obj),
            ResumePoint::Restart(KeyCondition::Stale)
        );
        assert_eq!(
            resume_point(Some(&stored(150, 150, None)), &obj),
            ResumePoint::Restart(KeyCondition::Stale)
        );
        let garbage = CheckpointRecord::new("k", serde_json::json!("not progress"));
        assert_eq!(
            resume_point(Some(&garbage), &obj),
            ResumePoint::Restart(KeyCondition::Stale)
        );
    }

    #[test]
    fn leases_are_exclusive_until_dropped() {
        let leases = KeyLeases::new();
        let key = CheckpointKey::new("task|acct|obj");
        let lease = leases.try_acquire(&key).unwrap();
        assert!(leases.try_acquire(&key).is_none());
        assert!(leases.clone().is_held(&key));
        drop(lease);
        assert!(!leases.is_held(&key));
        assert!(leases.try_acquire(&key).is_some());
    }
}
