//! # Target System Adapter
//!
//! Abstract interface to the running geospatial server. The three
//! operations are individually idempotent and retryable, which is what
//! makes crash replay of a deployment safe.
//!
//! The shipped implementation talks to the server's admin REST API over
//! HTTP. Tests use a scripted in-memory adapter.

use crate::config::TargetConfig;
use crate::loader::document::{ConfigurationDocument, Datasource};
use crate::plan::ResourceRef;
use anyhow::{Context, Result};
use async_trait::async_trait;

#[async_trait]
pub trait TargetSystemAdapter: Send + Sync {
    /// Rebind one datasource to a (possibly new) connection spec
    async fn rebind_datasource(&self, id: &str, spec: &Datasource) -> Result<()>;

    /// Push the full service/layer metadata of a document into the server.
    /// The server converges on the document: services absent from it are
    /// unpublished.
    async fn reload_metadata(&self, document: &ConfigurationDocument) -> Result<()>;

    /// Drop cached artifacts for the given resources
    async fn invalidate_cache(&self, refs: &[ResourceRef]) -> Result<()>;
}

/// HTTP implementation against the server's admin REST API
#[derive(Debug, Clone)]
pub struct HttpTargetAdapter {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
}

impl HttpTargetAdapter {
    pub fn new(target: &TargetConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(target.request_timeout_duration())
            .build()
            .context("building HTTP client for target adapter")?;
        Ok(Self {
            client,
            base_url: target.base_url.trim_end_matches('/').to_string(),
            auth_token: target.auth_token.clone(),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}{path}", self.base_url));
        if let Some(token) = &self.auth_token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    async fn expect_success(response: reqwest::Response, operation: &str) -> Result<()> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(anyhow::anyhow!(
            "{operation} returned {status}: {}",
            body.trim()
        ))
    }
}

#[async_trait]
impl TargetSystemAdapter for HttpTargetAdapter {
    async fn rebind_datasource(&self, id: &str, spec: &Datasource) -> Result<()> {
        let response = self
            .request(reqwest::Method::PUT, &format!("/admin/datasources/{id}"))
            .json(spec)
            .send()
            .await
            .with_context(|| format!("rebinding datasource {id}"))?;
        Self::expect_success(response, &format!("rebind datasource {id}")).await
    }

    async fn reload_metadata(&self, document: &ConfigurationDocument) -> Result<()> {
        let response = self
            .request(reqwest::Method::POST, "/admin/metadata/reload")
            .json(document)
            .send()
            .await
            .context("reloading service metadata")?;
        Self::expect_success(response, "reload metadata").await
    }

    async fn invalidate_cache(&self, refs: &[ResourceRef]) -> Result<()> {
        let response = self
            .request(reqwest::Method::POST, "/admin/cache/invalidate")
            .json(refs)
            .send()
            .await
            .context("invalidating cache")?;
        Self::expect_success(response, "invalidate cache").await
    }
}
