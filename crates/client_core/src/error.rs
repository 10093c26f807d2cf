use std::time::Duration;

use serde_json::Value;
use shared::error::ErrorBody;
use thiserror::Error;

/// Terminal failure of one dispatched request.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClientError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    /// Transport failure, or a response that carried no usable envelope.
    #[error("network error: {0}")]
    Network(String),
    /// Failure envelope from the server, passed through verbatim.
    #[error("{code}: {message}")]
    Server {
        code: String,
        message: String,
        data: Option<Value>,
    },
}

impl ClientError {
    pub fn code(&self) -> &str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Network(_) => "network_error",
            Self::Server { code, .. } => code,
        }
    }

    /// Only transport-level failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Network(_))
    }

    pub(crate) fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            Self::Timeout(timeout)
        } else {
            Self::Network(err.to_string())
        }
    }
}

impl From<ErrorBody> for ClientError {
    fn from(body: ErrorBody) -> Self {
        Self::Server {
            code: body.code,
            message: body.message,
            data: body.data,
        }
    }
}
