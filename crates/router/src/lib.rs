//! Action router: one entry point multiplexing named actions through a fixed
//! authenticate → authorize → validate → execute pipeline, with every outcome
//! normalized into a [`ResponseEnvelope`].

use std::{any::Any, collections::BTreeMap, panic::AssertUnwindSafe, sync::Arc};

use futures::FutureExt;
use serde_json::{json, Value};
use shared::{
    error::{ErrorBody, ErrorCode, BUSINESS_RULE_STATUS},
    protocol::{ActionSummary, ResponseEnvelope},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub mod auth;
pub mod handler;
pub mod registry;
pub mod sanitize;

pub use auth::{AuthChecker, CapabilitySet, HmacNonceAuth, PermissionChecker};
pub use handler::{
    handler_fn, ActionHandler, ActionRequest, FnHandler, HandlerError, HandlerResult,
    RequestValidator,
};
pub use registry::{ActionDescriptor, ActionOptions, ActionRegistry, RegistryError};

#[derive(Debug, Clone)]
pub struct RouterSettings {
    /// Purpose string every auth token is bound to.
    pub nonce_purpose: String,
    /// Attach handler diagnostics to `server_error` envelopes.
    pub debug: bool,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            nonce_purpose: "ajax_router".into(),
            debug: false,
        }
    }
}

/// Envelope plus the HTTP status it should be sent with.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOutcome {
    pub status: u16,
    pub envelope: ResponseEnvelope,
}

impl DispatchOutcome {
    pub fn success(data: Value) -> Self {
        Self {
            status: 200,
            envelope: ResponseEnvelope::success(data),
        }
    }

    pub fn failure(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::failure_with(code.status(), ErrorBody::new(code, message))
    }

    pub fn failure_with(status: u16, error: ErrorBody) -> Self {
        Self {
            status,
            envelope: ResponseEnvelope::failure(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.envelope.success
    }
}

pub struct ActionRouter {
    registry: ActionRegistry,
    auth: Arc<dyn AuthChecker>,
    settings: RouterSettings,
}

impl ActionRouter {
    pub fn new(
        registry: ActionRegistry,
        auth: Arc<dyn AuthChecker>,
        settings: RouterSettings,
    ) -> Self {
        Self {
            registry,
            auth,
            settings,
        }
    }

    pub fn settings(&self) -> &RouterSettings {
        &self.settings
    }

    /// Token for the router's purpose, as handed to clients.
    pub fn issue_token(&self) -> String {
        self.auth.issue_token(&self.settings.nonce_purpose)
    }

    pub fn list_registered_actions(&self) -> BTreeMap<String, ActionSummary> {
        self.registry.summaries()
    }

    pub async fn dispatch(
        &self,
        mut request: ActionRequest,
        caller: &dyn PermissionChecker,
    ) -> DispatchOutcome {
        let request_id = Uuid::new_v4();
        let Some(descriptor) = request
            .action
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .and_then(|name| self.registry.get(name))
        else {
            debug!(
                %request_id,
                action = request.action.as_deref().unwrap_or_default(),
                "dispatch: unknown action"
            );
            return DispatchOutcome::failure(
                ErrorCode::ActionNotFound,
                "The requested action does not exist",
            );
        };
        let action = descriptor.name();
        if descriptor.log_requests() {
            info!(%request_id, action, "dispatch: request received");
        }

        if descriptor.require_auth_token() {
            let valid = request
                .auth_token
                .as_deref()
                .filter(|token| !token.is_empty())
                .is_some_and(|token| self.auth.verify_token(&self.settings.nonce_purpose, token));
            if !valid {
                warn!(%request_id, action, "dispatch: auth token rejected");
                return DispatchOutcome::failure(ErrorCode::InvalidNonce, "Security check failed");
            }
        }

        if let Some(capability) = descriptor.required_capability() {
            if !caller.has(capability) {
                warn!(%request_id, action, capability, "dispatch: capability missing");
                return DispatchOutcome::failure(
                    ErrorCode::InsufficientPermissions,
                    "You do not have permission to perform this action",
                );
            }
        }

        request.payload = sanitize::sanitize_payload(std::mem::take(&mut request.payload));
        if let Some(validator) = descriptor.validator() {
            if !validator.validate(&request) {
                debug!(%request_id, action, "dispatch: validator rejected payload");
                return DispatchOutcome::failure(
                    ErrorCode::InvalidParameters,
                    "Invalid parameters",
                );
            }
        }

        let result = AssertUnwindSafe(descriptor.handler().call(&request))
            .catch_unwind()
            .await;
        let outcome = match result {
            Ok(Ok(data)) => DispatchOutcome::success(data),
            Ok(Err(HandlerError::Rejected {
                code,
                message,
                data,
            })) => {
                debug!(%request_id, action, %code, "dispatch: handler rejected request");
                let mut body = ErrorBody::custom(code, message);
                body.data = data;
                DispatchOutcome::failure_with(BUSINESS_RULE_STATUS, body)
            }
            Ok(Err(HandlerError::Internal(err))) => {
                let chain = err.chain().skip(1).map(ToString::to_string).collect();
                self.server_error(request_id, action, "error", err.to_string(), chain)
            }
            Err(panic) => self.server_error(
                request_id,
                action,
                "panic",
                panic_message(panic.as_ref()),
                Vec::new(),
            ),
        };

        if descriptor.log_requests() {
            info!(%request_id, action, status = outcome.status, "dispatch: completed");
        }
        outcome
    }

    fn server_error(
        &self,
        request_id: Uuid,
        action: &str,
        kind: &str,
        exception: String,
        chain: Vec<String>,
    ) -> DispatchOutcome {
        let body = ErrorBody::new(ErrorCode::ServerError, "An unexpected error occurred");
        if !self.settings.debug {
            error!(%request_id, action, kind, "dispatch: handler failed");
            return DispatchOutcome::failure_with(ErrorCode::ServerError.status(), body);
        }

        error!(%request_id, action, kind, %exception, "dispatch: handler failed");
        let body = body.with_data(json!({
            "exception": exception,
            "kind": kind,
            "action": action,
            "chain": chain,
        }));
        DispatchOutcome::failure_with(ErrorCode::ServerError.status(), body)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
#[path = "tests/router_tests.rs"]
mod tests;
