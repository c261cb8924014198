//! HTTP client for OpenAI-compatible inference servers.
//!
//! [`InferenceClient`] talks to `GET /models` and `POST /completions`,
//! classifies every failure into an [`ErrorKind`], and retries the retryable
//! ones with capped exponential backoff. The engine only sees the
//! [`InferenceBackend`] trait, so tests can substitute a scripted backend.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{RequestBuilder, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{ApiKey, GenerationConfig, RetryPolicy};
use crate::error::{CoreError, ErrorKind, InferenceError};
use crate::wire::{
    Completion, CompletionRequest, CompletionResponse, ModelInfo, ModelList, error_message,
};

/// Characters of a non-JSON error body kept in the error message.
const MAX_BODY_EXCERPT: usize = 200;

/// The operations the engine needs from an inference server.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Models currently loaded on the server.
    async fn list_models(&self) -> Result<Vec<ModelInfo>, InferenceError>;

    /// Request one completion and return the first choice.
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, InferenceError>;

    /// Whether the server answers a model listing right now. Never retried.
    async fn health_check(&self) -> bool;
}

/// Result of a single liveness check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub base_url: String,
    pub models_count: Option<usize>,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
}

/// reqwest-based [`InferenceBackend`].
#[derive(Debug, Clone)]
pub struct InferenceClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<ApiKey>,
    request_timeout: Duration,
    retry: RetryPolicy,
}

impl InferenceClient {
    /// Build a client from the endpoint, timeout and retry settings of `config`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidConfig` if the HTTP client cannot be built.
    pub fn new(config: &GenerationConfig) -> Result<Self, CoreError> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .user_agent(concat!("protogen/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CoreError::InvalidConfig(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: config.base_url().trim_end_matches('/').to_owned(),
            api_key: config.api_key().cloned(),
            request_timeout: config.request_timeout(),
            retry: config.retry().clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Probe the server once and describe the outcome.
    #[instrument(skip(self), fields(base_url = %self.base_url))]
    pub async fn health_report(&self) -> HealthReport {
        let result = self.send_once::<ModelList>(self.get("models")).await;
        let mut report = HealthReport {
            healthy: result.is_ok(),
            base_url: self.base_url.clone(),
            models_count: None,
            error_kind: None,
            error_message: None,
        };
        match result {
            Ok(list) => report.models_count = Some(list.data.len()),
            Err(e) => {
                debug!(error = %e, "health check failed");
                report.error_kind = Some(e.kind());
                report.error_message = Some(e.message().to_owned());
            }
        }
        report
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{endpoint}", self.base_url)
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        let builder = builder.timeout(self.request_timeout);
        match &self.api_key {
            Some(key) => builder.bearer_auth(key.expose()),
            None => builder,
        }
    }

    fn get(&self, endpoint: &str) -> RequestBuilder {
        self.authorize(self.http.get(self.url(endpoint)))
    }

    fn post<B: Serialize + ?Sized>(&self, endpoint: &str, body: &B) -> RequestBuilder {
        self.authorize(self.http.post(self.url(endpoint)).json(body))
    }

    /// Send a request, retrying retryable failures per the retry policy.
    async fn send_with_retry<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        request: RequestBuilder,
    ) -> Result<T, InferenceError> {
        let max_attempts = self.retry.max_attempts();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let this_attempt = request.try_clone().ok_or_else(|| {
                InferenceError::new(ErrorKind::Unknown, "request body cannot be cloned for retry")
            })?;

            debug!(operation, attempt, max_attempts, "sending request");
            match self.send_once(this_attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(operation, attempt, "request succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let backoff = self.retry.backoff_for(attempt);
                    warn!(
                        operation,
                        attempt,
                        max_attempts,
                        kind = %e.kind(),
                        status = ?e.status(),
                        backoff_ms = backoff.as_millis() as u64,
                        "request failed, will retry"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    if e.is_retryable() {
                        error!(operation, attempts = attempt, error = %e, "retries exhausted");
                    } else {
                        warn!(operation, error = %e, "request failed");
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn send_once<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<T, InferenceError> {
        let response = request.send().await.map_err(|e| classify_transport(&e))?;
        let status = response.status();
        let body = response.text().await.map_err(|e| classify_transport(&e))?;

        if !status.is_success() {
            return Err(self.classify_status(status, &body));
        }

        serde_json::from_str(&body).map_err(|e| {
            InferenceError::new(ErrorKind::Unknown, format!("invalid JSON response: {e}"))
        })
    }

    fn classify_status(&self, status: StatusCode, body: &str) -> InferenceError {
        let code = status.as_u16();
        let kind = match code {
            401 => ErrorKind::Authentication,
            429 => ErrorKind::RateLimit,
            400..=499 => ErrorKind::Client,
            500..=599 => ErrorKind::Server,
            _ => ErrorKind::Unknown,
        };
        let message = error_message(body).unwrap_or_else(|| {
            let raw = body.trim();
            if raw.is_empty() {
                format!("HTTP {status}")
            } else {
                let excerpt: String = raw.chars().take(MAX_BODY_EXCERPT).collect();
                format!("HTTP {status}: {excerpt}")
            }
        });

        InferenceError::new(kind, message)
            .with_status(code)
            .with_retryable(self.retry.is_retryable_status(code))
    }
}

fn classify_transport(e: &reqwest::Error) -> InferenceError {
    let kind = if e.is_timeout() {
        ErrorKind::Timeout
    } else if e.is_decode() {
        ErrorKind::Unknown
    } else {
        ErrorKind::Network
    };
    InferenceError::new(kind, e.to_string())
}

#[async_trait]
impl InferenceBackend for InferenceClient {
    #[instrument(skip(self), fields(base_url = %self.base_url))]
    async fn list_models(&self) -> Result<Vec<ModelInfo>, InferenceError> {
        let list: ModelList = self.send_with_retry("list_models", self.get("models")).await?;
        debug!(count = list.data.len(), "listed models");
        Ok(list.data)
    }

    #[instrument(skip_all, fields(model = %request.model, prompt_len = request.prompt.len()))]
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, InferenceError> {
        let response: CompletionResponse = self
            .send_with_retry("complete", self.post("completions", request))
            .await?;

        let Some(choice) = response.choices.into_iter().next() else {
            return Err(InferenceError::new(
                ErrorKind::Unknown,
                "completion response contained no choices",
            ));
        };

        Ok(Completion {
            text: choice.text,
            usage: response.usage,
            finish_reason: choice.finish_reason,
            model: response.model,
        })
    }

    async fn health_check(&self) -> bool {
        self.health_report().await.healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(retry: RetryPolicy) -> InferenceClient {
        let config = GenerationConfig::builder()
            .base_url("http://localhost:1234/v1/")
            .retry(retry)
            .build();
        InferenceClient::new(&config).expect("should build client")
    }

    #[test]
    fn test_should_trim_trailing_slash_from_base_url() {
        let client = client(RetryPolicy::default());
        assert_eq!(client.base_url(), "http://localhost:1234/v1");
        assert_eq!(client.url("models"), "http://localhost:1234/v1/models");
    }

    #[test]
    fn test_should_classify_http_statuses() {
        let client = client(RetryPolicy::default());
        let cases = [
            (401, ErrorKind::Authentication, false),
            (403, ErrorKind::Client, false),
            (404, ErrorKind::Client, false),
            (429, ErrorKind::RateLimit, true),
            (500, ErrorKind::Server, true),
            (501, ErrorKind::Server, false),
            (503, ErrorKind::Server, true),
        ];
        for (code, kind, retryable) in cases {
            let status = StatusCode::from_u16(code).expect("valid status");
            let err = client.classify_status(status, "");
            assert_eq!(err.kind(), kind, "status {code}");
            assert_eq!(err.is_retryable(), retryable, "status {code}");
            assert_eq!(err.status(), Some(code));
        }
    }

    #[test]
    fn test_should_follow_configured_retry_statuses() {
        let client = client(RetryPolicy::builder().retry_on_status(vec![501]).build());
        let err = client.classify_status(StatusCode::NOT_IMPLEMENTED, "");
        assert!(err.is_retryable());
        let err = client.classify_status(StatusCode::SERVICE_UNAVAILABLE, "");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_should_use_server_error_message_when_present() {
        let client = client(RetryPolicy::default());
        let err = client.classify_status(
            StatusCode::BAD_REQUEST,
            r#"{"error":{"message":"context length exceeded"}}"#,
        );
        assert_eq!(err.message(), "context length exceeded");

        let err = client.classify_status(StatusCode::BAD_GATEWAY, "upstream down");
        assert_eq!(err.message(), "HTTP 502 Bad Gateway: upstream down");

        let err = client.classify_status(StatusCode::BAD_GATEWAY, "");
        assert_eq!(err.message(), "HTTP 502 Bad Gateway");

        let long = "x".repeat(500);
        let err = client.classify_status(StatusCode::INTERNAL_SERVER_ERROR, &long);
        assert!(err.message().len() < 260);
    }
}
