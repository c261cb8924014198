use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by the engine itself.
///
/// Stage failures are never reported through this type: they are recorded in
/// the [`StageResult`](crate::StageResult) of the stage. Only programmer
/// errors, configuration problems and cancellation before a run starts surface
/// here.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("no deliverable kinds were requested")]
    NoDeliverables,

    #[error("orchestration cancelled before the first stage started")]
    Cancelled,

    #[error("inference error: {0}")]
    Inference(#[from] InferenceError),

    #[error("prompt error: {0}")]
    Prompt(#[from] protogen_pm::PmError),

    #[error("failed to parse config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Classification attached to every failure at the inference boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// DNS, connect or connection-reset failures.
    #[serde(rename = "network_error")]
    Network,
    /// The request exceeded the configured timeout.
    #[serde(rename = "timeout_error")]
    Timeout,
    /// HTTP 429.
    #[serde(rename = "rate_limit_error")]
    RateLimit,
    /// HTTP 5xx.
    #[serde(rename = "server_error")]
    Server,
    /// HTTP 401.
    #[serde(rename = "authentication_error")]
    Authentication,
    /// Any other HTTP 4xx.
    #[serde(rename = "client_error")]
    Client,
    /// The run was cancelled while the stage was pending or in flight.
    #[serde(rename = "cancelled_error")]
    Cancelled,
    /// The server answered with an empty completion.
    #[serde(rename = "empty_response_error")]
    EmptyResponse,
    /// Anything that could not be classified.
    #[serde(rename = "unknown_error")]
    Unknown,
}

impl ErrorKind {
    /// Default retry eligibility for this classification.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Network | Self::Timeout | Self::RateLimit | Self::Server | Self::EmptyResponse
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network_error",
            Self::Timeout => "timeout_error",
            Self::RateLimit => "rate_limit_error",
            Self::Server => "server_error",
            Self::Authentication => "authentication_error",
            Self::Client => "client_error",
            Self::Cancelled => "cancelled_error",
            Self::EmptyResponse => "empty_response_error",
            Self::Unknown => "unknown_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure from the inference server or the transport.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{kind}: {message}")]
pub struct InferenceError {
    kind: ErrorKind,
    message: String,
    status: Option<u16>,
    retryable: bool,
}

impl InferenceError {
    /// Create an error whose retry eligibility follows [`ErrorKind::is_retryable`].
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            retryable: kind.is_retryable(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "run was cancelled")
    }

    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// HTTP status of the failed response, if there was one.
    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_classify_retryable_kinds() {
        for kind in [
            ErrorKind::Network,
            ErrorKind::Timeout,
            ErrorKind::RateLimit,
            ErrorKind::Server,
        ] {
            assert!(kind.is_retryable(), "{kind} should be retryable");
        }
        for kind in [
            ErrorKind::Authentication,
            ErrorKind::Client,
            ErrorKind::Cancelled,
            ErrorKind::Unknown,
        ] {
            assert!(!kind.is_retryable(), "{kind} should not be retryable");
        }
    }

    #[test]
    fn test_should_serialize_error_kind_with_suffix() {
        let json = serde_json::to_value(ErrorKind::RateLimit).expect("should serialize");
        assert_eq!(json, "rate_limit_error");
        assert_eq!(ErrorKind::Authentication.to_string(), "authentication_error");
    }

    #[test]
    fn test_should_format_inference_error_with_kind_prefix() {
        let err = InferenceError::new(ErrorKind::Server, "bad gateway").with_status(502);
        assert_eq!(err.to_string(), "server_error: bad gateway");
        assert_eq!(err.status(), Some(502));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_should_override_retryable_flag() {
        let err = InferenceError::new(ErrorKind::Server, "not implemented")
            .with_status(501)
            .with_retryable(false);
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), ErrorKind::Server);
    }
}
