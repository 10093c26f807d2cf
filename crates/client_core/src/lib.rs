//! Client-side dispatcher for the action endpoint: timeout, opt-in retry with
//! exponential backoff, an opt-in response cache and bounded-concurrency
//! batches.

use std::{collections::BTreeMap, time::Duration};

use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use shared::protocol::{
    actions_route, ajax_route, auth_token_route, ActionSummary, ResponseEnvelope, TokenResponse,
    ACTION_FIELD, NONCE_FIELD,
};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

mod cache;
pub mod error;

use cache::ResponseCache;
pub use error::ClientError;

/// Key a non-object payload is sent under.
pub const SCALAR_PAYLOAD_FIELD: &str = "payload";

const MIN_RETRY_MULTIPLIER: u32 = 2;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub cache_ttl: Duration,
    pub cache_capacity: u64,
    /// Requests in flight per batch chunk.
    pub batch_concurrency: usize,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: Duration::from_secs(30),
            cache_ttl: Duration::from_secs(5 * 60),
            cache_capacity: 1_000,
            batch_concurrency: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Backoff factor; values below 2 are treated as 2 so delays keep growing.
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self
            .multiplier
            .max(MIN_RETRY_MULTIPLIER)
            .saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Overrides [`ClientConfig::timeout`] for this call.
    pub timeout: Option<Duration>,
    pub cache: bool,
    pub retry: Option<RetryPolicy>,
}

impl SendOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn cached(mut self) -> Self {
        self.cache = true;
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub action: String,
    #[serde(default)]
    pub payload: Value,
}

impl BatchRequest {
    pub fn new(action: impl Into<String>, payload: Value) -> Self {
        Self {
            action: action.into(),
            payload,
        }
    }
}

pub struct ActionClient {
    http: Client,
    config: ClientConfig,
    auth_token: RwLock<Option<String>>,
    cache: ResponseCache,
}

impl ActionClient {
    pub fn new(config: ClientConfig) -> Self {
        Self::with_http(config, Client::new())
    }

    /// Uses a preconfigured `reqwest` client, e.g. one carrying default headers.
    pub fn with_http(config: ClientConfig, http: Client) -> Self {
        let cache = ResponseCache::new(config.cache_capacity, config.cache_ttl);
        Self {
            http,
            config,
            auth_token: RwLock::new(None),
            cache,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub async fn auth_token(&self) -> Option<String> {
        self.auth_token.read().await.clone()
    }

    pub async fn set_auth_token(&self, token: impl Into<String>) {
        *self.auth_token.write().await = Some(token.into());
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Dispatches `action` and returns the `data` of a success envelope.
    ///
    /// Dropping the returned future cancels the in-flight request.
    pub async fn send(
        &self,
        action: &str,
        payload: Value,
        options: &SendOptions,
    ) -> Result<Value, ClientError> {
        let cache_key = options
            .cache
            .then(|| ResponseCache::key(action, &payload));
        if let Some(key) = cache_key.as_deref() {
            if let Some(data) = self.cache.get(key).await {
                debug!(action, "client: cache hit");
                return Ok(data);
            }
        }

        let body = self.request_body(action, payload).await;
        let timeout = options.timeout.unwrap_or(self.config.timeout);
        let policy = options.retry.unwrap_or(RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::default()
        });

        let mut attempt = 1;
        let data = loop {
            let request = self.http.post(self.url(ajax_route())).json(&body);
            match self.exchange(request, timeout).await {
                Ok(data) => break data,
                Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                    let delay = policy.delay_for(attempt);
                    warn!(action, attempt, ?delay, error = %err, "client: retrying request");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    debug!(action, attempt, code = err.code(), "client: request failed");
                    return Err(err);
                }
            }
        };

        if let Some(key) = cache_key {
            self.cache.insert(key, data.clone()).await;
        }
        Ok(data)
    }

    /// Sends `requests` in chunks of [`ClientConfig::batch_concurrency`]; each
    /// chunk settles fully before the next starts. Results follow input order.
    pub async fn send_batch(
        &self,
        requests: &[BatchRequest],
        options: &SendOptions,
    ) -> Vec<Result<Value, ClientError>> {
        let concurrency = self.config.batch_concurrency.max(1);
        let mut results = Vec::with_capacity(requests.len());
        for chunk in requests.chunks(concurrency) {
            let settled = futures::future::join_all(
                chunk
                    .iter()
                    .map(|request| self.send(&request.action, request.payload.clone(), options)),
            )
            .await;
            results.extend(settled);
        }
        results
    }

    /// Fetches a fresh auth token and stores it for subsequent sends.
    pub async fn refresh_auth_token(&self) -> Result<String, ClientError> {
        let request = self.http.get(self.url(auth_token_route()));
        let data = self.exchange(request, self.config.timeout).await?;
        let token: TokenResponse = decode(data)?;
        info!(purpose = %token.purpose, "client: auth token refreshed");
        self.set_auth_token(token.token.clone()).await;
        Ok(token.token)
    }

    pub async fn list_actions(&self) -> Result<BTreeMap<String, ActionSummary>, ClientError> {
        let request = self.http.get(self.url(actions_route()));
        decode(self.exchange(request, self.config.timeout).await?)
    }

    fn url(&self, route: &str) -> String {
        format!("{}{route}", self.config.base_url.trim_end_matches('/'))
    }

    async fn request_body(&self, action: &str, payload: Value) -> Map<String, Value> {
        let mut body = match payload {
            Value::Object(fields) => fields,
            Value::Null => Map::new(),
            scalar => Map::from_iter([(SCALAR_PAYLOAD_FIELD.to_string(), scalar)]),
        };
        body.insert(ACTION_FIELD.into(), Value::String(action.into()));
        if let Some(token) = self.auth_token().await {
            body.insert(NONCE_FIELD.into(), Value::String(token));
        }
        body
    }

    async fn exchange(&self, request: RequestBuilder, timeout: Duration) -> Result<Value, ClientError> {
        let response = tokio::time::timeout(timeout, async {
            let response = request.send().await?;
            let status = response.status();
            let bytes = response.bytes().await?;
            Ok::<_, reqwest::Error>((status, bytes))
        })
        .await;

        let (status, bytes) = match response {
            Err(_) => return Err(ClientError::Timeout(timeout)),
            Ok(Err(err)) => return Err(ClientError::from_reqwest(err, timeout)),
            Ok(Ok(parts)) => parts,
        };

        match serde_json::from_slice::<ResponseEnvelope>(&bytes) {
            Ok(envelope) if envelope.success && !status.is_success() => Err(
                ClientError::Network(format!("server responded with {status}")),
            ),
            Ok(envelope) => envelope.into_result().map_err(ClientError::from),
            Err(_) if !status.is_success() => Err(ClientError::Network(format!(
                "server responded with {status}"
            ))),
            Err(err) => Err(ClientError::Network(format!(
                "undecodable response body: {err}"
            ))),
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(data: Value) -> Result<T, ClientError> {
    serde_json::from_value(data)
        .map_err(|err| ClientError::Network(format!("unexpected response shape: {err}")))
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
