/// HTTP transport: four verbs returning parsed JSON.
///
/// Every request carries the same bearer-token / JSON header set. The
/// `Transport` trait is the seam tests use to inject a scripted remote;
/// `HttpTransport` is the reqwest-backed production implementation.
use crate::config::Config;
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Method;
use serde_json::Value;
use std::sync::Arc;

#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: &str) -> Result<Value>;
    async fn post(&self, url: &str, body: Value) -> Result<Value>;
    async fn patch(&self, url: &str, body: Value) -> Result<Value>;
    async fn delete(&self, url: &str) -> Result<Value>;
}

pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(bearer_token: &str) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let auth = HeaderValue::from_str(&format!("Bearer {}", bearer_token))
            .map_err(|e| SyncError::Validation(format!("bearer token: {}", e)))?;
        headers.insert(AUTHORIZATION, auth);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        // Ask the service to echo affected rows on writes
        headers.insert("Prefer", HeaderValue::from_static("return=representation"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| SyncError::Transport(format!("client init: {}", e)))?;

        Ok(Self { client })
    }

    async fn execute(&self, method: Method, url: &str, body: Option<Value>) -> Result<Value> {
        let mut request = self.client.request(method.clone(), url);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SyncError::Transport(format!("'{}' {}: {}", url, method, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::Transport(format!(
                "'{}' {}: {}",
                url, method, status
            )));
        }

        response
            .json()
            .await
            .map_err(|e| SyncError::Decode(format!("'{}' {}: {}", url, method, e)))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, url: &str) -> Result<Value> {
        self.execute(Method::GET, url, None).await
    }

    async fn post(&self, url: &str, body: Value) -> Result<Value> {
        self.execute(Method::POST, url, Some(body)).await
    }

    async fn patch(&self, url: &str, body: Value) -> Result<Value> {
        self.execute(Method::PATCH, url, Some(body)).await
    }

    async fn delete(&self, url: &str) -> Result<Value> {
        self.execute(Method::DELETE, url, None).await
    }
}

/// Handle to the remote store; cheap to clone, shared by every query
#[derive(Clone)]
pub struct Remote {
    transport: Arc<dyn Transport>,
}

impl Remote {
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            transport: Arc::new(HttpTransport::new(&config.bearer_token)?),
        })
    }

    /// Build on any transport; tests pass a scripted one
    pub fn with_transport(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Start a query against a resource endpoint
    pub fn query<T>(&self, resource_url: &str) -> crate::remote::query::Query<T> {
        crate::remote::query::Query::new(self.clone(), resource_url)
    }

    pub(crate) fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }
}
