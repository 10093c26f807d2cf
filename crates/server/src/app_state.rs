use std::sync::Arc;

use axum::http::HeaderMap;
use router::{ActionRouter, CapabilitySet};
use shared::protocol::ADMIN_KEY_HEADER;
use storage::Storage;
use subtle::ConstantTimeEq;

pub(crate) const MANAGE_OPTIONS: &str = "manage_options";

const ADMIN_CAPABILITIES: [&str; 3] = ["read", "edit_posts", MANAGE_OPTIONS];
const VISITOR_CAPABILITIES: [&str; 1] = ["read"];

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) router: Arc<ActionRouter>,
    pub(crate) storage: Storage,
    pub(crate) admin_key: Option<String>,
    pub(crate) nonce_lifetime_seconds: u64,
}

impl AppState {
    /// Capabilities of the caller: holders of the admin key are
    /// administrators, everyone else is a visitor.
    pub(crate) fn caller(&self, headers: &HeaderMap) -> CapabilitySet {
        let presented = headers
            .get(ADMIN_KEY_HEADER)
            .and_then(|value| value.to_str().ok());
        let is_admin = match (self.admin_key.as_deref(), presented) {
            (Some(expected), Some(presented)) if !expected.is_empty() => {
                expected.as_bytes().ct_eq(presented.as_bytes()).into()
            }
            _ => false,
        };

        if is_admin {
            CapabilitySet::new(ADMIN_CAPABILITIES)
        } else {
            CapabilitySet::new(VISITOR_CAPABILITIES)
        }
    }
}
