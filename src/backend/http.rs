//! HTTP provisioning backend.
//!
//! Speaks a small JSON protocol:
//!
//! - `POST {base}/v1/changesets` with a change set, answered by `{"handle"}`
//! - `GET {base}/v1/changesets/{handle}`, answered by a [`BackendStatus`]
//! - `GET {base}/v1/context/{provider}?account=..&region=..`, answered by
//!   `{"value"}`
//!
//! This client makes exactly one request per call; retries are the
//! orchestrator's business.

use async_trait::async_trait;
use reqwest::{header, Client, Response, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, trace};

use crate::error::{BackendError, ConfigError, Result, StackwrightError};
use crate::planner::ChangeSet;
use crate::state::ContextKey;

use super::types::{BackendHandle, BackendStatus};
use super::{ContextResolver, ProvisioningBackend};

/// Environment variable holding the bearer token.
pub const TOKEN_ENV_VAR: &str = "STACKWRIGHT_BACKEND_TOKEN";

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Fallback wait when a 429 carries no usable `Retry-After`.
const DEFAULT_RETRY_AFTER_SECS: u64 = 5;

/// HTTP provisioning backend client.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    /// HTTP client.
    client: Client,
    /// Service root.
    base_url: Url,
    /// Bearer token.
    token: Option<String>,
    /// Request timeout, reported in timeout errors.
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    handle: String,
}

#[derive(Debug, Deserialize)]
struct ContextResponse {
    value: Value,
}

impl HttpBackend {
    /// Creates a client for the service at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the HTTP client cannot be
    /// created.
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self> {
        Self::with_timeout(base_url, token, DEFAULT_TIMEOUT_SECS)
    }

    /// Creates a client with a custom request timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the HTTP client cannot be
    /// created.
    pub fn with_timeout(base_url: &str, token: Option<String>, timeout_secs: u64) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .ok()
            .filter(|url| !url.cannot_be_a_base())
            .ok_or_else(|| ConfigError::validation(format!("Invalid backend URL: {base_url}"), "backend.url"))?;

        let timeout = Duration::from_secs(timeout_secs);
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::network(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url,
            token,
            timeout,
        })
    }

    /// Creates a client, reading the token from [`TOKEN_ENV_VAR`].
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the HTTP client cannot be
    /// created.
    pub fn from_env(base_url: &str, timeout_secs: u64) -> Result<Self> {
        let token = std::env::var(TOKEN_ENV_VAR).ok().filter(|t| !t.is_empty());
        Self::with_timeout(base_url, token, timeout_secs)
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| StackwrightError::internal(format!("Backend URL cannot be a base: {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.header(header::AUTHORIZATION, format!("Bearer {token}")),
            None => request,
        }
    }

    /// Sends a request and decodes a successful JSON body.
    async fn execute<T: DeserializeOwned>(
        &self,
        operation: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<T> {
        let response = self
            .authorize(request)
            .header(header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| self.transport_error(operation, &e))?;

        let response = Self::check_status(response).await?;

        response.json::<T>().await.map_err(|e| {
            BackendError::InvalidResponse {
                message: format!("Failed to parse {operation} response: {e}"),
            }
            .into()
        })
    }

    fn transport_error(&self, operation: &str, error: &reqwest::Error) -> StackwrightError {
        if error.is_timeout() {
            BackendError::Timeout {
                operation: operation.to_string(),
                after_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
            }
            .into()
        } else {
            BackendError::network(format!("{operation} request failed: {error}")).into()
        }
    }

    async fn check_status(response: Response) -> Result<Response> {
        let status = response.status();
        trace!("Backend answered {status}");

        if status.is_success() {
            return Ok(response);
        }

        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(DEFAULT_RETRY_AFTER_SECS);

            return Err(BackendError::Throttled {
                retry_after_secs: retry_after,
            }
            .into());
        }

        let body = response.text().await.unwrap_or_default();
        Err(BackendError::from_status(status.as_u16(), body).into())
    }
}

#[async_trait]
impl ProvisioningBackend for HttpBackend {
    async fn submit(&self, change_set: &ChangeSet) -> Result<BackendHandle> {
        debug!(
            "Submitting {} change set for {} in {}",
            change_set.kind, change_set.unit_id, change_set.environment
        );

        let url = self.endpoint(&["v1", "changesets"])?;
        let response: SubmitResponse = self
            .execute("submit", self.client.post(url).json(change_set))
            .await?;

        Ok(BackendHandle::new(response.handle))
    }

    async fn poll(&self, handle: &BackendHandle) -> Result<BackendStatus> {
        let url = self.endpoint(&["v1", "changesets", handle.as_str()])?;

        match self.execute("poll", self.client.get(url)).await {
            Err(StackwrightError::Backend(BackendError::Rejected { status: 404, .. })) => {
                Err(BackendError::HandleNotFound {
                    handle: handle.to_string(),
                }
                .into())
            }
            other => other,
        }
    }
}

#[async_trait]
impl ContextResolver for HttpBackend {
    async fn resolve(&self, key: &ContextKey) -> Result<Value> {
        let url = self.endpoint(&["v1", "context", key.provider.as_str()])?;

        let mut query: Vec<(&str, &str)> = vec![
            ("account", key.environment.account()),
            ("region", key.environment.region()),
        ];
        query.extend(key.params.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        let response: ContextResponse = self
            .execute("context", self.client.get(url).query(&query))
            .await?;
        Ok(response.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::DiffEngine;
    use crate::unit::{DeployableUnit, EnvironmentKey};
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn change_set() -> ChangeSet {
        let unit = DeployableUnit::new("network", EnvironmentKey::new("acct", "eu-west-1"), json!({"cidr": "10.0.0.0/16"}));
        DiffEngine::new().diff(&unit, None)
    }

    #[tokio::test]
    async fn test_submit_returns_handle() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/changesets"))
            .and(header("authorization", "Bearer secret"))
            .and(body_partial_json(json!({"unit_id": "network", "kind": "create"})))
            .respond_with(ResponseTemplate::new(202).set_body_json(json!({"handle": "cs-1"})))
            .expect(1)
            .mount(&server)
            .await;

        let backend = HttpBackend::new(&server.uri(), Some(String::from("secret"))).expect("client");
        let handle = backend.submit(&change_set()).await.expect("submit");
        assert_eq!(handle.as_str(), "cs-1");
    }

    #[tokio::test]
    async fn test_poll_statuses() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/changesets/cs-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "succeeded",
                "fingerprint": "v7",
                "outputs": {"vpc_id": "vpc-1"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/changesets/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let backend = HttpBackend::new(&server.uri(), None).expect("client");

        let status = backend.poll(&BackendHandle::new("cs-1")).await.expect("poll");
        let BackendStatus::Succeeded { fingerprint, outputs } = status else {
            panic!("expected success");
        };
        assert_eq!(fingerprint, "v7");
        assert_eq!(outputs.get("vpc_id"), Some(&json!("vpc-1")));

        let err = backend
            .poll(&BackendHandle::new("missing"))
            .await
            .expect_err("unknown handle");
        assert!(matches!(err, StackwrightError::Backend(BackendError::HandleNotFound { .. })));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_status_classification() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/changesets/busy"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/changesets/bad"))
            .respond_with(ResponseTemplate::new(422).set_body_string("invalid template"))
            .mount(&server)
            .await;

        let backend = HttpBackend::new(&server.uri(), None).expect("client");

        let throttled = backend.submit(&change_set()).await.expect_err("throttled");
        assert!(throttled.is_retryable());
        assert_eq!(throttled.retry_delay(), Some(Duration::from_secs(7)));

        let busy = backend.poll(&BackendHandle::new("busy")).await.expect_err("busy");
        assert!(busy.is_retryable());

        let bad = backend.poll(&BackendHandle::new("bad")).await.expect_err("bad");
        assert!(!bad.is_retryable());
        assert!(bad.to_string().contains("invalid template"));
    }

    #[tokio::test]
    async fn test_resolve_context() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/context/availability-zones"))
            .and(query_param("account", "acct"))
            .and(query_param("region", "eu-west-1"))
            .and(query_param("tier", "public"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": ["a", "b"]})))
            .mount(&server)
            .await;

        let backend = HttpBackend::new(&server.uri(), None).expect("client");
        let key = ContextKey::new("availability-zones", EnvironmentKey::new("acct", "eu-west-1"))
            .with_param("tier", "public");

        let value = backend.resolve(&key).await.expect("resolve");
        assert_eq!(value, json!(["a", "b"]));
    }

    #[test]
    fn test_rejects_invalid_url() {
        assert!(HttpBackend::new("not a url", None).is_err());
        assert!(HttpBackend::new("mailto:ops@example.com", None).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_transient() {
        let backend = HttpBackend::with_timeout("http://127.0.0.1:9", None, 1).expect("client");
        let err = backend.submit(&change_set()).await.expect_err("unreachable");
        assert!(err.is_retryable());
    }
}
