//! Assembles an [`ActionRequest`] from the query string, a form or JSON body,
//! and headers.

use axum::http::{header, HeaderMap};
use router::ActionRequest;
use serde_json::{Map, Value};
use shared::{
    error::{ErrorBody, ErrorCode},
    protocol::{ACTION_FIELD, NONCE_FIELD, NONCE_HEADER},
};

/// Query fields, then form body fields, then JSON body fields; later sources
/// win on key collision.
pub(crate) fn collect_fields(
    query: Option<&str>,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Map<String, Value>, ErrorBody> {
    let mut fields = Map::new();
    if let Some(query) = query {
        merge_form(&mut fields, query.as_bytes());
    }
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(fields);
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();
    if content_type.starts_with("application/x-www-form-urlencoded") {
        merge_form(&mut fields, body);
    } else if content_type.contains("json") || looks_like_json_object(body) {
        let parsed: Value = serde_json::from_slice(body).map_err(|_| {
            ErrorBody::new(ErrorCode::InvalidParameters, "Malformed JSON body")
        })?;
        let Value::Object(object) = parsed else {
            return Err(ErrorBody::new(
                ErrorCode::InvalidParameters,
                "JSON body must be an object",
            ));
        };
        fields.extend(object);
    }
    Ok(fields)
}

pub(crate) fn into_action_request(
    mut fields: Map<String, Value>,
    headers: &HeaderMap,
) -> ActionRequest {
    let action = fields.remove(ACTION_FIELD).and_then(into_text);
    let auth_token = fields.remove(NONCE_FIELD).and_then(into_text).or_else(|| {
        headers
            .get(NONCE_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    });
    ActionRequest {
        action,
        payload: fields,
        auth_token,
    }
}

fn looks_like_json_object(body: &[u8]) -> bool {
    body.iter().find(|byte| !byte.is_ascii_whitespace()) == Some(&b'{')
}

fn into_text(value: Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn merge_form(fields: &mut Map<String, Value>, encoded: &[u8]) {
    for (key, value) in url::form_urlencoded::parse(encoded) {
        insert_form_pair(fields, &key, value.into_owned());
    }
}

/// Expands bracketed keys (`filters[pa_color][]=red`) into nested values.
fn insert_form_pair(fields: &mut Map<String, Value>, key: &str, value: String) {
    let (base, segments) = split_bracket_key(key);
    let Some(first) = segments.first() else {
        fields.insert(base, Value::String(value));
        return;
    };
    let slot = fields
        .entry(base)
        .or_insert_with(|| container_for(first));
    insert_nested(slot, &segments, value);
}

fn insert_nested(slot: &mut Value, segments: &[String], value: String) {
    let Some((head, rest)) = segments.split_first() else {
        *slot = Value::String(value);
        return;
    };

    if head.is_empty() {
        if !slot.is_array() {
            *slot = Value::Array(Vec::new());
        }
        let Value::Array(items) = slot else {
            return;
        };
        match rest.first() {
            None => items.push(Value::String(value)),
            Some(next) => {
                let mut child = container_for(next);
                insert_nested(&mut child, rest, value);
                items.push(child);
            }
        }
        return;
    }

    if !slot.is_object() {
        *slot = Value::Object(Map::new());
    }
    let Value::Object(map) = slot else {
        return;
    };
    let child = map
        .entry(head.clone())
        .or_insert_with(|| rest.first().map_or(Value::Null, |next| container_for(next)));
    insert_nested(child, rest, value);
}

fn container_for(segment: &str) -> Value {
    if segment.is_empty() {
        Value::Array(Vec::new())
    } else {
        Value::Object(Map::new())
    }
}

fn split_bracket_key(key: &str) -> (String, Vec<String>) {
    let plain = || (key.to_string(), Vec::new());
    let Some(open) = key.find('[').filter(|open| *open > 0) else {
        return plain();
    };

    let mut segments = Vec::new();
    let mut rest = &key[open..];
    while let Some(inner) = rest.strip_prefix('[') {
        let Some(close) = inner.find(']') else {
            return plain();
        };
        segments.push(inner[..close].to_string());
        rest = &inner[close + 1..];
    }
    if !rest.is_empty() {
        return plain();
    }
    (key[..open].to_string(), segments)
}
