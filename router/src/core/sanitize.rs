//! Credential redaction and field bounding for log events.
//!
//! Every event passes through here before reaching any sink. Redaction works
//! on two levels: field names that look credential-shaped lose their value
//! entirely, and free-text values are scanned for embedded credentials so a
//! token pasted into an error message is caught too.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

pub const REDACTED: &str = "***REDACTED***";
pub const TRUNCATION_MARK: &str = "...[TRUNCATED]";

/// Max chars for preview/message fields.
pub const MAX_PREVIEW_LEN: usize = 512;
/// Max chars for stack-trace-like fields.
pub const MAX_TRACE_LEN: usize = 4000;
/// Max items for list-valued fields.
pub const MAX_LIST_ITEMS: usize = 10;

const PREVIEW_FIELDS: &[&str] = &[
    "prompt_preview",
    "response_preview",
    "stderr_preview",
    "message",
];
const TRACE_FIELDS: &[&str] = &["traceback"];
const LIST_FIELDS: &[&str] = &["new_files", "modified_files"];

static KEY_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)token|api[_-]?key|secret|authorization|password|bearer")
        .expect("valid key pattern")
});

static EXACT_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)GLM_AUTH_TOKEN['"\s]*[:=]['"\s]*[A-Za-z0-9._-]+"#)
        .expect("valid exact var pattern")
});

static VALUE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)(?:token|api[_-]?key|secret|authorization|password|bearer)['"\s]*[:=]['"\s]*[A-Za-z0-9_-]+"#,
    )
    .expect("valid value pattern")
});

/// Scrubs credential-shaped content from log fields and free text.
#[derive(Debug, Clone)]
pub struct Sanitizer {
    /// The configured credential value itself, scrubbed wherever it appears
    /// verbatim, independent of surrounding shape.
    token: Option<String>,
}

impl Sanitizer {
    pub fn new(token: Option<&str>) -> Self {
        Self {
            token: token.map(str::to_string).filter(|t| !t.is_empty()),
        }
    }

    /// Scrub credential-shaped substrings (and the literal configured token)
    /// from free text.
    pub fn scrub_text(&self, text: &str) -> String {
        let mut out = match &self.token {
            Some(token) => text.replace(token.as_str(), REDACTED),
            None => text.to_string(),
        };
        out = EXACT_VAR_PATTERN
            .replace_all(&out, format!("GLM_AUTH_TOKEN={REDACTED}"))
            .into_owned();
        VALUE_PATTERN.replace_all(&out, REDACTED).into_owned()
    }

    /// Recursively sanitize a JSON value: credential-shaped keys lose their
    /// value entirely; strings are scrubbed in place.
    pub fn sanitize_value(&self, value: Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (key, inner) in map {
                    if KEY_PATTERN.is_match(&key) {
                        out.insert(key, Value::String(REDACTED.to_string()));
                    } else {
                        out.insert(key, self.sanitize_value(inner));
                    }
                }
                Value::Object(out)
            }
            Value::Array(items) => {
                Value::Array(items.into_iter().map(|v| self.sanitize_value(v)).collect())
            }
            Value::String(s) => Value::String(self.scrub_text(&s)),
            other => other,
        }
    }
}

/// Truncate to at most `max` chars, appending the truncation marker when
/// anything was cut. Operates on chars, never splitting a code point.
pub fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max).collect();
    out.push_str(TRUNCATION_MARK);
    out
}

/// Bound well-known long fields in a flat event map: previews to 512 chars,
/// traces to 4000, lists to 10 items with a remainder marker.
pub fn bound_fields(map: &mut Map<String, Value>) {
    for field in PREVIEW_FIELDS {
        bound_text_field(map, field, MAX_PREVIEW_LEN);
    }
    for field in TRACE_FIELDS {
        bound_text_field(map, field, MAX_TRACE_LEN);
    }
    for field in LIST_FIELDS {
        let Some(Value::Array(items)) = map.get_mut(*field) else {
            continue;
        };
        if items.len() > MAX_LIST_ITEMS {
            let rest = items.len() - MAX_LIST_ITEMS;
            items.truncate(MAX_LIST_ITEMS);
            items.push(Value::String(format!("...and {rest} more")));
        }
    }
}

fn bound_text_field(map: &mut Map<String, Value>, field: &str, max: usize) {
    let Some(Value::String(text)) = map.get(field) else {
        return;
    };
    if text.chars().count() > max {
        let bounded = truncate_chars(text, max);
        map.insert(field.to_string(), Value::String(bounded));
    }
}
