use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use cloudtap_core::{CheckpointKey, CheckpointRecord};

/// Prefix of legacy bookkeeping entries that are not object checkpoints.
const BOOKKEEPING_PREFIX: &str = "__";

/// One decoded legacy entry.
#[derive(Debug, Clone, PartialEq)]
pub struct LegacyEntry {
    pub key: String,
    pub value: serde_json::Value,
}

/// Per-source-kind migration strategy.
///
/// Every kind copies keys and payloads verbatim, so the dispatcher finds
/// migrated progress under the same composed key it wrote. Kinds differ only
/// in which legacy entries are checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationKind {
    /// Keys and payloads unchanged.
    #[default]
    Verbatim,
    Billing,
    CloudWatch,
    IncrementalS3,
    AzureBlob,
}

impl MigrationKind {
    pub const ALL: [MigrationKind; 5] = [
        MigrationKind::Verbatim,
        MigrationKind::Billing,
        MigrationKind::CloudWatch,
        MigrationKind::IncrementalS3,
        MigrationKind::AzureBlob,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationKind::Verbatim => "verbatim",
            MigrationKind::Billing => "billing",
            MigrationKind::CloudWatch => "cloud_watch",
            MigrationKind::IncrementalS3 => "incremental_s3",
            MigrationKind::AzureBlob => "azure_blob",
        }
    }

    /// Decode one legacy `(key, value)` pair. `None` means the entry is not a
    /// checkpoint and is left behind.
    ///
    /// Kind filters look at the object part of the composed key.
    pub fn load(&self, key: &str, value: serde_json::Value) -> Option<LegacyEntry> {
        if key.is_empty() || key.starts_with(BOOKKEEPING_PREFIX) || value.is_null() {
            return None;
        }
        let parsed = CheckpointKey::new(key);
        let object = parsed.object();
        match self {
            // Prefix listings leave directory placeholders behind.
            MigrationKind::IncrementalS3 if object.ends_with('/') => None,
            // Container-level entries carry no blob name.
            MigrationKind::AzureBlob if object.is_empty() => None,
            _ => Some(LegacyEntry {
                key: key.to_string(),
                value,
            }),
        }
    }

    /// Produce the shared-store record for a legacy entry.
    pub fn migrate(&self, entry: LegacyEntry) -> CheckpointRecord {
        CheckpointRecord::new(entry.key, entry.value)
    }
}

impl fmt::Display for MigrationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigrationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == normalized || k.as_str().replace('_', "") == normalized)
            .ok_or_else(|| format!("unknown migration kind '{}'", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bookkeeping_entries_are_skipped() {
        for kind in MigrationKind::ALL {
            assert!(kind.load("__schema_version", json!(2)).is_none());
            assert!(kind.load("obj", serde_json::Value::Null).is_none());
        }
    }

    #[test]
    fn keys_and_payloads_are_copied_verbatim() {
        let payload = json!({"offset": 10, "etag": "abc"});
        let key = CheckpointKey::compose("billing", "acct", "2024/report.csv");
        for kind in MigrationKind::ALL {
            let entry = kind.load(key.as_str(), payload.clone()).unwrap();
            let record = kind.migrate(entry);
            assert_eq!(record.key, key, "{kind}");
            assert_eq!(record.payload, payload);
        }

        let entry = MigrationKind::Verbatim.load("obj1", json!(100)).unwrap();
        assert_eq!(MigrationKind::Verbatim.migrate(entry).key.as_str(), "obj1");
    }

    #[test]
    fn kind_filters_look_at_the_object_part() {
        let key = |object: &str| CheckpointKey::compose("t", "acct", object).as_str().to_string();

        assert!(MigrationKind::IncrementalS3.load(&key("logs/"), json!(1)).is_none());
        assert!(MigrationKind::IncrementalS3.load(&key("logs/a.gz"), json!(1)).is_some());
        assert!(MigrationKind::AzureBlob.load(&key(""), json!(1)).is_none());
        assert!(MigrationKind::AzureBlob.load(&key("blob"), json!(1)).is_some());
        assert!(MigrationKind::AzureBlob.load(&key("dir/blob"), json!(1)).is_some());
        // Only the object part may trigger a filter.
        assert!(MigrationKind::IncrementalS3.load("t/|acct/|a.gz", json!(1)).is_some());
    }

    #[test]
    fn parses_cli_names() {
        assert_eq!("cloudwatch".parse::<MigrationKind>().unwrap(), MigrationKind::CloudWatch);
        assert_eq!(
            "incremental-s3".parse::<MigrationKind>().unwrap(),
            MigrationKind::IncrementalS3
        );
        assert_eq!("Billing".parse::<MigrationKind>().unwrap(), MigrationKind::Billing);
        assert!("nope".parse::<MigrationKind>().is_err());
    }
}
