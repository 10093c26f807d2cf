//! Translation for the superseded per-action endpoints (`/legacy/{name}`).
//!
//! Older clients post to one endpoint per action, with their own field names
//! and a `security` token field. Requests are rewritten into the canonical
//! field layout and then go through the regular dispatch pipeline.

use serde_json::{Map, Value};
use shared::protocol::{ACTION_FIELD, NONCE_FIELD};

pub(crate) struct LegacyRoute {
    pub(crate) legacy: &'static str,
    pub(crate) action: &'static str,
    pub(crate) token_field: &'static str,
    /// `(legacy field, canonical field)` renames.
    pub(crate) renames: &'static [(&'static str, &'static str)],
}

pub(crate) const LEGACY_ROUTES: &[LegacyRoute] = &[
    LegacyRoute {
        legacy: "theme_contact_form",
        action: "submit_contact_form",
        token_field: "security",
        renames: &[
            ("form", "form_id"),
            ("contact_name", "name"),
            ("contact_email", "email"),
            ("contact_subject", "subject"),
            ("contact_message", "message"),
        ],
    },
    LegacyRoute {
        legacy: "theme_list_submissions",
        action: "list_submissions",
        token_field: "security",
        renames: &[("paged", "page"), ("posts_per_page", "per_page")],
    },
    LegacyRoute {
        legacy: "theme_echo",
        action: "echo",
        token_field: "security",
        renames: &[],
    },
];

pub(crate) fn find_route(legacy_action: &str) -> Option<&'static LegacyRoute> {
    LEGACY_ROUTES
        .iter()
        .find(|route| route.legacy == legacy_action)
}

/// Rewrites `fields` for the canonical endpoint. Unknown legacy names are
/// forwarded as the action name unchanged, so dispatch reports them as not
/// found. Fields without a rename are copied as they are.
pub(crate) fn translate(legacy_action: &str, mut fields: Map<String, Value>) -> Map<String, Value> {
    let Some(route) = find_route(legacy_action) else {
        fields.insert(ACTION_FIELD.into(), Value::String(legacy_action.into()));
        return fields;
    };

    let token = fields.remove(route.token_field);
    fields.remove(ACTION_FIELD);

    let mut canonical = Map::new();
    for (key, value) in fields {
        let key = route
            .renames
            .iter()
            .find(|(legacy, _)| *legacy == key)
            .map_or(key, |(_, renamed)| (*renamed).to_string());
        canonical.insert(key, value);
    }
    if let Some(token) = token {
        canonical.insert(NONCE_FIELD.into(), token);
    }
    canonical.insert(ACTION_FIELD.into(), Value::String(route.action.into()));
    canonical
}
