use std::future::Future;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

/// One incoming call, as assembled by the transport layer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionRequest {
    pub action: Option<String>,
    pub payload: Map<String, Value>,
    pub auth_token: Option<String>,
}

impl ActionRequest {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: Some(action.into()),
            ..Self::default()
        }
    }

    pub fn with_payload(mut self, payload: Map<String, Value>) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    /// Trimmed, non-empty string field.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.payload
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    /// Integer field given either as a JSON number or a numeric string.
    pub fn i64_field(&self, key: &str) -> Option<i64> {
        match self.payload.get(key)? {
            Value::Number(number) => number.as_i64(),
            Value::String(raw) => raw.trim().parse().ok(),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum HandlerError {
    /// Expected business-rule failure; echoed to the caller verbatim.
    #[error("{code}: {message}")]
    Rejected {
        code: String,
        message: String,
        data: Option<Value>,
    },
    /// Unexpected failure; the caller only sees `server_error`.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn rejected(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Rejected {
            code: code.into(),
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(self, value: Value) -> Self {
        match self {
            Self::Rejected { code, message, .. } => Self::Rejected {
                code,
                message,
                data: Some(value),
            },
            internal => internal,
        }
    }
}

pub type HandlerResult = Result<Value, HandlerError>;

#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn call(&self, request: &ActionRequest) -> HandlerResult;
}

/// Adapts an async closure taking an owned request into an [`ActionHandler`].
pub struct FnHandler<F>(F);

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(ActionRequest) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> ActionHandler for FnHandler<F>
where
    F: Fn(ActionRequest) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    async fn call(&self, request: &ActionRequest) -> HandlerResult {
        (self.0)(request.clone()).await
    }
}

pub trait RequestValidator: Send + Sync {
    fn validate(&self, request: &ActionRequest) -> bool;
}

impl<F> RequestValidator for F
where
    F: Fn(&ActionRequest) -> bool + Send + Sync,
{
    fn validate(&self, request: &ActionRequest) -> bool {
        self(request)
    }
}
