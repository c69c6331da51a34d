//! API client for replaying actions against a REST backend.
//!
//! Resources map onto collection URLs: create is `POST {base}/{resource}`,
//! update is `PUT {base}/{resource}/{id}`, delete is
//! `DELETE {base}/{resource}/{id}`, and reads are `GET {base}/{resource}`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, Method, Url};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::models::{ActionType, PendingAction};
use crate::retry::RetryPolicy;

/// Maximum number of in-request retries for rate-limited (429) responses.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// The HTTP execution contract the sync engine consumes.
///
/// Implementations report every non-success as a classified `SyncError`:
/// `Network` when no response arrived, `Server` for 5xx, `Client` for 4xx.
#[async_trait]
pub trait RequestExecutor: Send + Sync {
    /// Run the request an action describes; returns the response body.
    async fn execute(&self, action: &PendingAction) -> Result<Value, SyncError>;

    /// Read the current server state of a resource collection.
    async fn fetch(&self, resource: &str) -> Result<Value, SyncError>;
}

/// REST client for the backend.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct RestClient {
    client: Client,
    base_url: Url,
    token: Option<String>,
    policy: RetryPolicy,
}

impl RestClient {
    /// Create a new client rooted at `base_url`
    pub fn new(base_url: &str) -> Result<Self, SyncError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| SyncError::InvalidAction(format!("invalid base URL {}: {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(SyncError::InvalidAction(format!(
                "base URL cannot hold paths: {}",
                base_url
            )));
        }
        let client = Client::builder().build()?;

        Ok(Self {
            client,
            base_url,
            token: None,
            policy: RetryPolicy::default(),
        })
    }

    pub fn from_config(config: &SyncConfig) -> anyhow::Result<Self> {
        let base_url = config
            .base_url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("No base_url configured"))?;
        let client = Self::new(base_url)?;
        Ok(match config.auth_token {
            Some(ref token) => client.with_token(token.clone()),
            None => client,
        })
    }

    /// Same connection pool, different bearer token.
    pub fn with_token(&self, token: String) -> Self {
        Self {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            token: Some(token),
            policy: self.policy,
        }
    }

    /// Override the transport timeout. Without this the reqwest default applies.
    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self, SyncError> {
        self.client = Client::builder().timeout(timeout).build()?;
        Ok(self)
    }

    fn url(&self, resource: &str, id: Option<&str>) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(resource);
            if let Some(id) = id {
                segments.push(id);
            }
        }
        url
    }

    fn auth_headers(&self) -> Result<header::HeaderMap, SyncError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::ACCEPT, header::HeaderValue::from_static("application/json"));
        if let Some(ref token) = self.token {
            let value = header::HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| SyncError::InvalidAction(format!("invalid auth token: {}", e)))?;
            headers.insert(header::AUTHORIZATION, value);
        }
        Ok(headers)
    }

    /// Check if response is successful, returning the parsed body.
    /// Returns Ok(None) for rate limit (should retry).
    async fn check_response(response: reqwest::Response) -> Result<Option<Value>, SyncError> {
        let status = response.status();
        if status.is_success() {
            let text = response.text().await?;
            if text.trim().is_empty() {
                return Ok(Some(Value::Null));
            }
            match serde_json::from_str(&text) {
                Ok(body) => Ok(Some(body)),
                Err(e) => {
                    warn!(status = status.as_u16(), error = %e, "Success response with non-JSON body");
                    Ok(Some(Value::Null))
                }
            }
        } else if status.as_u16() == 429 {
            Ok(None)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(SyncError::from_status(status.as_u16(), &body))
        }
    }

    async fn send(&self, method: Method, url: Url, body: Option<&Value>) -> Result<Value, SyncError> {
        let mut retries = 0;

        loop {
            let mut request = self
                .client
                .request(method.clone(), url.clone())
                .headers(self.auth_headers()?);
            if let Some(body) = body {
                request = request.json(body);
            }

            let response = request.send().await?;

            match Self::check_response(response).await? {
                Some(body) => return Ok(body),
                None => {
                    if retries >= MAX_RATE_LIMIT_RETRIES {
                        return Err(SyncError::RateLimited);
                    }
                    let delay = self.policy.backoff_delay(retries);
                    retries += 1;
                    warn!(url = %url, retry = retries, backoff_ms = delay.as_millis() as u64, "Rate limited, backing off");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[async_trait]
impl RequestExecutor for RestClient {
    async fn execute(&self, action: &PendingAction) -> Result<Value, SyncError> {
        let (method, url, body) = match action.action_type {
            ActionType::Create => (Method::POST, self.url(&action.resource, None), Some(&action.payload)),
            ActionType::Update | ActionType::Delete => {
                let id = action.target_id().ok_or_else(|| {
                    SyncError::InvalidAction(format!("{} on {} has no target id", action.action_type, action.resource))
                })?;
                let url = self.url(&action.resource, Some(&id));
                if action.action_type == ActionType::Update {
                    (Method::PUT, url, Some(&action.payload))
                } else {
                    (Method::DELETE, url, None)
                }
            }
        };

        debug!(id = %action.id, method = %method, url = %url, "Replaying action");
        self.send(method, url, body).await
    }

    async fn fetch(&self, resource: &str) -> Result<Value, SyncError> {
        self.send(Method::GET, self.url(resource, None), None).await
    }
}
