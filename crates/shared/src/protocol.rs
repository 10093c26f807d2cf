use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorBody, ErrorCode};

pub const ACTION_FIELD: &str = "action";
pub const NONCE_FIELD: &str = "nonce";
pub const NONCE_HEADER: &str = "x-action-nonce";
pub const ADMIN_KEY_HEADER: &str = "x-admin-key";

pub fn ajax_route() -> &'static str {
    "/ajax"
}

pub fn auth_token_route() -> &'static str {
    "/auth/token"
}

pub fn actions_route() -> &'static str {
    "/actions"
}

/// Uniform outbound contract for every dispatched request.
///
/// Built only through [`ResponseEnvelope::success`] and
/// [`ResponseEnvelope::failure`], so exactly one of `data` and `error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    pub timestamp: i64,
}

impl ResponseEnvelope {
    pub fn success(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            timestamp: Utc::now().timestamp(),
        }
    }

    pub fn failure(error: ErrorBody) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
            timestamp: Utc::now().timestamp(),
        }
    }

    /// Unwraps the envelope. A success whose `data` was `null` on the wire
    /// yields `Value::Null`; a failure without an `error` member is reported
    /// as a server error.
    pub fn into_result(self) -> Result<Value, ErrorBody> {
        if self.success {
            return Ok(self.data.unwrap_or(Value::Null));
        }
        Err(self.error.unwrap_or_else(|| {
            ErrorBody::new(ErrorCode::ServerError, "failure envelope without error")
        }))
    }
}

/// Introspection entry for one registered action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionSummary {
    pub description: String,
    pub require_auth_token: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_capability: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub token: String,
    pub purpose: String,
    pub lifetime_seconds: u64,
}
