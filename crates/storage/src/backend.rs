use std::path::{Path, PathBuf};
use std::sync::Arc;

use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::ObjectStore;
use tracing::info;

use cloudtap_core::config::AwsConfig;
use cloudtap_core::Config;

use crate::error::SourceError;

/// Where listed objects live.
pub enum StorageBackend {
    Local(LocalBackend),
    S3(S3Backend),
    /// Process-local store, for tests and dry runs.
    Memory(Arc<InMemory>),
}

impl StorageBackend {
    /// S3 when AWS credentials and a bucket are configured, otherwise the local source directory.
    pub fn from_config(config: &Config) -> Result<Self, SourceError> {
        if config.aws.is_configured() {
            Ok(StorageBackend::S3(S3Backend::new(&config.aws)?))
        } else {
            std::fs::create_dir_all(&config.storage.source_dir)?;
            Ok(StorageBackend::Local(LocalBackend::new(&config.storage.source_dir)?))
        }
    }

    pub fn memory() -> Self {
        StorageBackend::Memory(Arc::new(InMemory::new()))
    }

    pub fn store(&self) -> &dyn ObjectStore {
        match self {
            StorageBackend::Local(b) => b.store.as_ref(),
            StorageBackend::S3(b) => b.store.as_ref(),
            StorageBackend::Memory(m) => m.as_ref(),
        }
    }

    pub fn store_arc(&self) -> Arc<dyn ObjectStore> {
        match self {
            StorageBackend::Local(b) => b.store.clone(),
            StorageBackend::S3(b) => b.store.clone(),
            StorageBackend::Memory(m) => m.clone(),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, StorageBackend::S3(_))
    }

    /// Key prefix applied under the bucket (e.g. "production").
    pub fn prefix(&self) -> &str {
        match self {
            StorageBackend::S3(b) => &b.prefix,
            _ => "",
        }
    }

    /// Account identity used in checkpoint keys: the bucket, the local root, or "memory".
    pub fn account(&self) -> String {
        match self {
            StorageBackend::Local(b) => b.root.display().to_string(),
            StorageBackend::S3(b) => b.bucket.clone(),
            StorageBackend::Memory(_) => "memory".to_string(),
        }
    }
}

pub struct LocalBackend {
    pub store: Arc<dyn ObjectStore>,
    pub root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: &Path) -> Result<Self, SourceError> {
        let canonical = std::fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
        let store = LocalFileSystem::new_with_prefix(&canonical)
            .map_err(|e| SourceError::Other(format!("local filesystem error: {e}")))?;
        info!(root = %canonical.display(), "object source: local filesystem");
        Ok(Self {
            store: Arc::new(store),
            root: canonical,
        })
    }
}

pub struct S3Backend {
    pub store: Arc<dyn ObjectStore>,
    pub bucket: String,
    pub prefix: String,
}

impl S3Backend {
    pub fn new(aws: &AwsConfig) -> Result<Self, SourceError> {
        let bucket = aws
            .s3_bucket
            .as_deref()
            .ok_or_else(|| SourceError::NotConfigured("S3_BUCKET not set".into()))?;

        let mut builder = AmazonS3Builder::new().with_region(&aws.region);
        if let Some(ref key) = aws.access_key_id {
            builder = builder.with_access_key_id(key);
        }
        if let Some(ref secret) = aws.secret_access_key {
            builder = builder.with_secret_access_key(secret);
        }
        if let Some(ref token) = aws.session_token {
            builder = builder.with_token(token);
        }

        match aws.endpoint_url.as_deref().filter(|e| !e.is_empty()) {
            Some(endpoint) => {
                // object_store requires an absolute endpoint URL
                let absolute =
                    endpoint.starts_with("http://") || endpoint.starts_with("https://");
                let endpoint = if absolute {
                    endpoint.to_string()
                } else {
                    format!("https://{}", endpoint)
                };
                builder = builder
                    .with_bucket_name(bucket)
                    .with_allow_http(endpoint.starts_with("http://"))
                    .with_endpoint(endpoint);
            }
            None => {
                builder = builder.with_url(format!("s3://{}", bucket));
            }
        }

        let store = builder.build()?;
        let prefix = normalize_prefix(aws.s3_prefix.as_deref().unwrap_or(""));

        info!(
            bucket,
            prefix = %prefix,
            region = %aws.region,
            "object source: S3"
        );

        Ok(Self {
            store: Arc::new(store),
            bucket: bucket.to_string(),
            prefix,
        })
    }
}

/// Strip leading and trailing slashes from a key prefix.
pub fn normalize_prefix(prefix: &str) -> String {
    prefix.trim_matches('/').to_string()
}

/// Join a backend prefix and a task prefix into one listing prefix.
pub fn join_prefix(base: &str, prefix: &str) -> String {
    let prefix = prefix.trim_start_matches('/');
    if base.is_empty() {
        prefix.to_string()
    } else if prefix.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base, prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_backend_is_not_remote() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = StorageBackend::Local(LocalBackend::new(tmp.path()).unwrap());
        assert!(!backend.is_remote());
        assert_eq!(backend.prefix(), "");
    }

    #[test]
    fn s3_requires_bucket() {
        let aws = AwsConfig {
            region: "us-east-1".into(),
            access_key_id: Some("id".into()),
            secret_access_key: Some("secret".into()),
            session_token: None,
            s3_bucket: None,
            s3_prefix: None,
            endpoint_url: None,
        };
        let err = S3Backend::new(&aws).err().unwrap();
        assert!(matches!(err, SourceError::NotConfigured(_)));
    }

    #[test]
    fn prefixes_join_cleanly() {
        assert_eq!(join_prefix("", "/logs/2024"), "logs/2024");
        assert_eq!(join_prefix("prod", "logs"), "prod/logs");
        assert_eq!(join_prefix("prod", ""), "prod");
        assert_eq!(normalize_prefix("/prod/"), "prod");
    }
}
