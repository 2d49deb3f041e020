use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_u64(profile: &str, key: &str, default: u64) -> u64 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u32(profile: &str, key: &str, default: u32) -> u32 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_usize(profile: &str, key: &str, default: usize) -> usize {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub storage: StorageConfig,
    pub aws: AwsConfig,
    pub checkpoint: CheckpointConfig,
    pub ingest: IngestConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `CLOUDTAP_PROFILE`. When set (e.g. `PROD`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("CLOUDTAP_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            storage: StorageConfig::from_env_profiled(p),
            aws: AwsConfig::from_env_profiled(p),
            checkpoint: CheckpointConfig::from_env_profiled(p),
            ingest: IngestConfig::from_env_profiled(p),
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!(
            "  storage:     data_dir={}, checkpoint_dir={}",
            self.storage.data_dir.display(),
            self.storage.checkpoint_dir.display()
        );
        tracing::info!(
            "  aws:         region={}, bucket={}",
            self.aws.region,
            self.aws.s3_bucket.as_deref().unwrap_or("(none)")
        );
        tracing::info!(
            "  checkpoint:  kv_url={}, collection={}",
            self.checkpoint.kv_url.as_deref().unwrap_or("(none)"),
            self.checkpoint.collection
        );
        tracing::info!(
            "  ingest:      workers={}, channel={}, flush_interval={}s",
            self.ingest.worker_threads_num,
            self.ingest.channel_capacity,
            self.ingest.flush_interval_secs
        );
    }
}

// ── Storage ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    /// Directory holding legacy checkpoint files and migration markers.
    pub checkpoint_dir: PathBuf,
    /// Local object root used when S3 is not configured.
    pub source_dir: PathBuf,
}

impl StorageConfig {
    fn from_env_profiled(p: &str) -> Self {
        let data_dir = PathBuf::from(profiled_env_or(p, "DATA_DIR", "data"));
        let checkpoint_dir = PathBuf::from(profiled_env_or(
            p,
            "CHECKPOINT_DIR",
            data_dir.join("checkpoints").to_str().unwrap_or("data/checkpoints"),
        ));
        let source_dir = PathBuf::from(profiled_env_or(
            p,
            "SOURCE_DIR",
            data_dir.join("objects").to_str().unwrap_or("data/objects"),
        ));
        Self {
            data_dir,
            checkpoint_dir,
            source_dir,
        }
    }
}

// ── AWS / S3 ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwsConfig {
    pub region: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
    pub s3_bucket: Option<String>,
    pub s3_prefix: Option<String>,
    pub endpoint_url: Option<String>,
}

impl AwsConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            region: profiled_env_or(p, "AWS_REGION", "us-east-1"),
            access_key_id: profiled_env_opt(p, "AWS_ACCESS_KEY_ID"),
            secret_access_key: profiled_env_opt(p, "AWS_SECRET_ACCESS_KEY"),
            session_token: profiled_env_opt(p, "AWS_SESSION_TOKEN"),
            s3_bucket: profiled_env_opt(p, "S3_BUCKET"),
            s3_prefix: profiled_env_opt(p, "S3_PREFIX"),
            endpoint_url: profiled_env_opt(p, "AWS_ENDPOINT_URL"),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.access_key_id.is_some() && self.s3_bucket.is_some()
    }
}

// ── Checkpoint backend ────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Base URL of the shared KV checkpoint service.
    pub kv_url: Option<String>,
    pub kv_token: Option<String>,
    pub collection: String,
    pub kv_timeout_secs: u64,
    pub retry_attempts: u32,
    pub retry_initial_ms: u64,
    pub retry_max_ms: u64,
    /// A migration claim older than this is presumed abandoned.
    pub migration_lease_secs: u64,
}

impl CheckpointConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            kv_url: profiled_env_opt(p, "KV_URL"),
            kv_token: profiled_env_opt(p, "KV_TOKEN"),
            collection: profiled_env_or(p, "KV_COLLECTION", "cloudtap_checkpoints"),
            kv_timeout_secs: profiled_env_u64(p, "KV_TIMEOUT_SECS", 10),
            retry_attempts: profiled_env_u32(p, "CHECKPOINT_RETRY_ATTEMPTS", 5),
            retry_initial_ms: profiled_env_u64(p, "CHECKPOINT_RETRY_INITIAL_MS", 200),
            retry_max_ms: profiled_env_u64(p, "CHECKPOINT_RETRY_MAX_MS", 5000),
            migration_lease_secs: profiled_env_u64(p, "MIGRATION_LEASE_SECS", 600),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.kv_url.is_some()
    }

    pub fn migration_lease(&self) -> Duration {
        Duration::from_secs(self.migration_lease_secs)
    }
}

// ── Ingest ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    pub worker_threads_num: usize,
    pub channel_capacity: usize,
    pub poll_timeout_secs: u64,
    pub flush_interval_secs: u64,
    pub shutdown_timeout_secs: u64,
    pub fetch_chunk_bytes: usize,
    /// Overrides the backend's advertised batch limit when set.
    pub batch_limit: Option<usize>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            worker_threads_num: 10,
            channel_capacity: 64,
            poll_timeout_secs: 3,
            flush_interval_secs: 120,
            shutdown_timeout_secs: 10,
            fetch_chunk_bytes: 4 * 1024 * 1024,
            batch_limit: None,
        }
    }
}

impl IngestConfig {
    fn from_env_profiled(p: &str) -> Self {
        let d = Self::default();
        Self {
            worker_threads_num: profiled_env_usize(p, "WORKER_THREADS_NUM", d.worker_threads_num)
                .max(1),
            channel_capacity: profiled_env_usize(p, "CHANNEL_CAPACITY", d.channel_capacity).max(1),
            poll_timeout_secs: profiled_env_u64(p, "POLL_TIMEOUT_SECS", d.poll_timeout_secs),
            flush_interval_secs: profiled_env_u64(p, "FLUSH_INTERVAL_SECS", d.flush_interval_secs),
            shutdown_timeout_secs: profiled_env_u64(
                p,
                "SHUTDOWN_TIMEOUT_SECS",
                d.shutdown_timeout_secs,
            ),
            fetch_chunk_bytes: profiled_env_usize(p, "FETCH_CHUNK_BYTES", d.fetch_chunk_bytes)
                .max(1),
            batch_limit: profiled_env_opt(p, "BATCH_LIMIT")
                .and_then(|v| v.parse().ok())
                .filter(|n: &usize| *n > 0),
        }
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}
