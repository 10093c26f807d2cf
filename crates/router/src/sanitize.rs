//! Payload sanitization applied to every request before validation.

use serde_json::{Map, Value};

/// Identifier fields coerced to non-negative integers wherever they appear.
pub const NUMERIC_FIELDS: &[&str] = &["category_id", "product_id", "page", "per_page"];

/// Field rebuilt as `taxonomy -> [term, ...]`.
pub const FILTERS_FIELD: &str = "filters";

pub fn sanitize_payload(payload: Map<String, Value>) -> Map<String, Value> {
    payload
        .into_iter()
        .map(|(key, value)| {
            let value = sanitize_field(&key, value);
            (key, value)
        })
        .collect()
}

fn sanitize_field(key: &str, value: Value) -> Value {
    if NUMERIC_FIELDS.contains(&key) {
        return Value::from(coerce_absint(&value));
    }
    if key == FILTERS_FIELD {
        return sanitize_filters(value);
    }
    sanitize_value(value)
}

fn sanitize_value(value: Value) -> Value {
    match value {
        Value::String(text) => Value::String(sanitize_text(&text)),
        Value::Array(items) => Value::Array(items.into_iter().map(sanitize_value).collect()),
        Value::Object(map) => Value::Object(sanitize_payload(map)),
        other => other,
    }
}

/// Leading-integer parse with the sign dropped; anything unparseable is 0.
pub fn coerce_absint(value: &Value) -> u64 {
    match value {
        Value::Number(number) => number
            .as_i64()
            .map(i64::unsigned_abs)
            .or_else(|| number.as_u64())
            .or_else(|| number.as_f64().map(|float| float.trunc().abs() as u64))
            .unwrap_or_default(),
        Value::String(text) => leading_integer(text.trim()),
        Value::Bool(flag) => u64::from(*flag),
        _ => 0,
    }
}

fn leading_integer(text: &str) -> u64 {
    let unsigned = text
        .strip_prefix('-')
        .or_else(|| text.strip_prefix('+'))
        .unwrap_or(text);
    unsigned
        .chars()
        .map_while(|c| c.to_digit(10))
        .fold(0u64, |acc, digit| {
            acc.saturating_mul(10).saturating_add(u64::from(digit))
        })
}

fn sanitize_filters(value: Value) -> Value {
    let Value::Object(taxonomies) = value else {
        return Value::Object(Map::new());
    };

    let mut filters = Map::new();
    for (taxonomy, terms) in taxonomies {
        let taxonomy = sanitize_key(&taxonomy);
        if taxonomy.is_empty() {
            continue;
        }
        let terms: Vec<Value> = match terms {
            Value::Array(items) => items.into_iter().filter_map(term_text).collect(),
            single => term_text(single).into_iter().collect(),
        };
        if terms.is_empty() {
            continue;
        }
        filters.insert(taxonomy, Value::Array(terms));
    }
    Value::Object(filters)
}

fn term_text(value: Value) -> Option<Value> {
    let text = match value {
        Value::String(text) => sanitize_text(&text),
        Value::Number(number) => number.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(Value::String(text))
}

/// Lowercase ASCII alphanumerics, `_` and `-`; everything else is dropped.
pub fn sanitize_key(raw: &str) -> String {
    raw.chars()
        .map(|c| c.to_ascii_lowercase())
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}

pub fn sanitize_text(raw: &str) -> String {
    escape_html(raw.trim())
}

pub fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#039;"),
            other => escaped.push(other),
        }
    }
    escaped
}

/// Reverses [`escape_html`]; `&amp;` goes last so `&amp;lt;` stays `&lt;`.
pub fn unescape_html(escaped: &str) -> String {
    escaped
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#039;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sanitize(value: Value) -> Value {
        let Value::Object(map) = value else {
            panic!("test payload must be an object");
        };
        Value::Object(sanitize_payload(map))
    }

    #[test]
    fn numeric_identifiers_become_non_negative_integers() {
        let out = sanitize(json!({
            "category_id": "12abc",
            "product_id": -7,
            "page": 2.9,
            "per_page": "nope",
        }));
        assert_eq!(
            out,
            json!({ "category_id": 12, "product_id": 7, "page": 2, "per_page": 0 })
        );
    }

    #[test]
    fn text_is_trimmed_and_escaped_recursively() {
        let out = sanitize(json!({
            "name": "  <b>Ann</b> ",
            "nested": { "note": "Tom & Jerry's", "page": "3" },
            "tags": [" a ", 5, true, null],
        }));
        assert_eq!(
            out,
            json!({
                "name": "&lt;b&gt;Ann&lt;/b&gt;",
                "nested": { "note": "Tom &amp; Jerry&#039;s", "page": 3 },
                "tags": ["a", 5, true, null],
            })
        );
    }

    #[test]
    fn unescape_restores_escaped_text() {
        for raw in ["<b>Tom & Jerry's \"show\"</b>", "&lt; literal", "plain"] {
            assert_eq!(unescape_html(&escape_html(raw)), raw);
        }
        assert_eq!(unescape_html("&amp;lt;"), "&lt;");
    }

    #[test]
    fn filters_are_rebuilt_as_taxonomy_term_lists() {
        let out = sanitize(json!({
            "filters": {
                "PA_Color": ["red", " blue ", { "x": 1 }, 42],
                "pa_size": "large",
                "!!!": ["dropped"],
                "pa_empty": [],
                "pa_bad": { "nested": true },
            }
        }));
        assert_eq!(
            out,
            json!({
                "filters": {
                    "pa_color": ["red", "blue", "42"],
                    "pa_size": ["large"],
                }
            })
        );
    }

    #[test]
    fn non_object_filters_become_empty() {
        let out = sanitize(json!({ "filters": "color=red" }));
        assert_eq!(out, json!({ "filters": {} }));
    }
}
