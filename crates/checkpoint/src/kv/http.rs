//! REST client for a KV-store checkpoint service.
//!
//! Endpoints, relative to the configured base URL:
//!
//! ```text
//! GET    /limits                              -> {"max_documents_per_batch_save": N}
//! GET    /collections/{c}/data/{key}          -> record | 404
//! POST   /collections/{c}/data/{key}          <- record
//! POST   /collections/{c}/batch_save          <- [record, ...] -> ["key", ...]
//! DELETE /collections/{c}/data/{key}
//! ```

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

use cloudtap_core::config::CheckpointConfig;
use cloudtap_core::CheckpointRecord;

use super::KvBackend;
use crate::error::StoreError;

#[derive(Debug, Deserialize)]
struct Limits {
    max_documents_per_batch_save: usize,
}

pub struct HttpKvBackend {
    client: Client,
    base: Url,
    token: Option<String>,
}

impl HttpKvBackend {
    pub fn new(
        base_url: &str,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        let base = Url::parse(base_url)
            .map_err(|e| StoreError::Permanent(format!("invalid KV url '{}': {}", base_url, e)))?;
        if base.cannot_be_a_base() {
            return Err(StoreError::Permanent(format!("KV url '{}' cannot be a base", base_url)));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StoreError::Permanent(format!("failed to build HTTP client: {}", e)))?;

        info!(url = %base, "KV checkpoint backend initialized");
        Ok(Self { client, base, token })
    }

    pub fn from_config(config: &CheckpointConfig) -> Result<Self, StoreError> {
        let url = config
            .kv_url
            .as_deref()
            .ok_or_else(|| StoreError::Permanent("KV_URL not set".into()))?;
        Self::new(
            url,
            config.kv_token.clone(),
            Duration::from_secs(config.kv_timeout_secs),
        )
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        let req = self.client.request(method, url);
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

/// Map a non-success HTTP status onto the store error taxonomy.
pub(crate) fn classify_status(status: StatusCode, context: &str) -> StoreError {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        StoreError::Transient(format!("{}: HTTP {}", context, status))
    } else {
        StoreError::Permanent(format!("{}: HTTP {}", context, status))
    }
}

fn classify_transport(e: reqwest::Error, context: &str) -> StoreError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        StoreError::Transient(format!("{}: {}", context, e))
    } else {
        StoreError::Permanent(format!("{}: {}", context, e))
    }
}

#[async_trait]
impl KvBackend for HttpKvBackend {
    fn name(&self) -> &str {
        "http"
    }

    async fn max_batch_size(&self) -> Result<usize, StoreError> {
        let resp = self
            .request(reqwest::Method::GET, self.url(&["limits"]))
            .send()
            .await
            .map_err(|e| classify_transport(e, "limits"))?;
        if !resp.status().is_success() {
            return Err(classify_status(resp.status(), "limits"));
        }
        let limits: Limits = resp
            .json()
            .await
            .map_err(|e| StoreError::Permanent(format!("limits: {}", e)))?;
        Ok(limits.max_documents_per_batch_save.max(1))
    }

    async fn get(
        &self,
        collection: &str,
        key: &str,
    ) -> Result<Option<CheckpointRecord>, StoreError> {
        let url = self.url(&["collections", collection, "data", key]);
        let resp = self
            .request(reqwest::Method::GET, url)
            .send()
            .await
            .map_err(|e| classify_transport(e, "get"))?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => resp
                .json()
                .await
                .map(Some)
                .map_err(|e| StoreError::Permanent(format!("get '{}': {}", key, e))),
            s => Err(classify_status(s, "get")),
        }
    }

    async fn upsert(&self, collection: &str, record: &CheckpointRecord) -> Result<(), StoreError> {
        let url = self.url(&["collections", collection, "data", record.key.as_str()]);
        let resp = self
            .request(reqwest::Method::POST, url)
            .json(record)
            .send()
            .await
            .map_err(|e| classify_transport(e, "upsert"))?;
        if !resp.status().is_success() {
            return Err(classify_status(resp.status(), "upsert"));
        }
        Ok(())
    }

    async fn batch_save(
        &self,
        collection: &str,
        records: &[CheckpointRecord],
    ) -> Result<Vec<String>, StoreError> {
        debug!(collection, count = records.len(), "KV batch_save");
        let url = self.url(&["collections", collection, "batch_save"]);
        let resp = self
            .request(reqwest::Method::POST, url)
            .json(records)
            .send()
            .await
            .map_err(|e| classify_transport(e, "batch_save"))?;
        if !resp.status().is_success() {
            return Err(classify_status(resp.status(), "batch_save"));
        }
        resp.json()
            .await
            .map_err(|e| StoreError::Permanent(format!("batch_save response: {}", e)))
    }

    async fn delete(&self, collection: &str, key: &str) -> Result<(), StoreError> {
        let url = self.url(&["collections", collection, "data", key]);
        let resp = self
            .request(reqwest::Method::DELETE, url)
            .send()
            .await
            .map_err(|e| classify_transport(e, "delete"))?;
        if !resp.status().is_success() {
            return Err(classify_status(resp.status(), "delete"));
        }
        Ok(())
    }
}
