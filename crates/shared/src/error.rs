use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// HTTP status used for errors returned by a handler as a business-rule rejection.
pub const BUSINESS_RULE_STATUS: u16 = 400;

/// Router-level failure codes. Handlers may use any other code string; those
/// travel verbatim in [`ErrorBody::code`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    ActionNotFound,
    InvalidNonce,
    InsufficientPermissions,
    InvalidParameters,
    ServerError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ActionNotFound => "action_not_found",
            Self::InvalidNonce => "invalid_nonce",
            Self::InsufficientPermissions => "insufficient_permissions",
            Self::InvalidParameters => "invalid_parameters",
            Self::ServerError => "server_error",
        }
    }

    pub fn status(self) -> u16 {
        match self {
            Self::ActionNotFound => 404,
            Self::InvalidNonce | Self::InsufficientPermissions => 403,
            Self::InvalidParameters => 400,
            Self::ServerError => 500,
        }
    }

    pub fn from_wire(code: &str) -> Option<Self> {
        match code {
            "action_not_found" => Some(Self::ActionNotFound),
            "invalid_nonce" => Some(Self::InvalidNonce),
            "insufficient_permissions" => Some(Self::InsufficientPermissions),
            "invalid_parameters" => Some(Self::InvalidParameters),
            "server_error" => Some(Self::ServerError),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `error` member of a failure envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{code}: {message}")]
pub struct ErrorBody {
    pub message: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorBody {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::custom(code.as_str(), message)
    }

    pub fn custom(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: code.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Router-level code, if this error carries one.
    pub fn known_code(&self) -> Option<ErrorCode> {
        ErrorCode::from_wire(&self.code)
    }
}
