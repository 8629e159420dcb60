//! Shared request/response types for the routing core.
//!
//! These types define stable contracts between components. They must remain
//! deterministic and free of I/O.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Model identifiers the router accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Model {
    #[serde(rename = "glm-4.6")]
    Glm46,
    #[serde(rename = "glm-4.5-air")]
    Glm45Air,
}

impl Model {
    pub fn as_str(self) -> &'static str {
        match self {
            Model::Glm46 => "glm-4.6",
            Model::Glm45Air => "glm-4.5-air",
        }
    }

    /// Parse a model identifier. Returns `None` for anything outside the
    /// enumerated set.
    pub fn parse(s: &str) -> Option<Model> {
        match s {
            "glm-4.6" => Some(Model::Glm46),
            "glm-4.5-air" => Some(Model::Glm45Air),
            _ => None,
        }
    }
}

impl Default for Model {
    fn default() -> Self {
        Model::Glm46
    }
}

impl std::fmt::Display for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One inbound routing request.
#[derive(Debug, Clone, Deserialize)]
pub struct RouteRequest {
    pub prompt: String,
    #[serde(default)]
    pub model: Option<Model>,
}

/// Immutable per-request identity, created at request entry.
///
/// Carries correlation data only: the prompt itself appears as a bounded
/// preview and a one-way hash, never in full.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    /// Session identifier inherited from the environment, when present.
    pub session_id: Option<String>,
    /// Identity of the logging pipeline instance that owns this request.
    pub instance_id: String,
    /// Process id of the router itself, not of any child.
    pub pid: u32,
    pub tool: String,
    pub prompt_preview: String,
    /// First 16 hex chars of the prompt's SHA-256, for correlation without
    /// exposing content. `None` for an empty prompt.
    pub prompt_sha256: Option<String>,
}

impl RequestContext {
    /// Context fields attached to every log event for this request.
    pub fn fields(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("request_id".into(), Value::String(self.request_id.clone()));
        if let Some(session) = &self.session_id {
            map.insert("session_id".into(), Value::String(session.clone()));
        }
        map.insert("instance_id".into(), Value::String(self.instance_id.clone()));
        map.insert("pid".into(), Value::from(self.pid));
        map.insert("tool".into(), Value::String(self.tool.clone()));
        map.insert(
            "prompt_preview".into(),
            Value::String(self.prompt_preview.clone()),
        );
        if let Some(hash) = &self.prompt_sha256 {
            map.insert("prompt_sha256".into(), Value::String(hash.clone()));
        }
        map
    }
}

/// Successful outbound result.
///
/// `model_requested` is what the request asked for (or the configured
/// default); `model_configured` is what the router injected into the child
/// environment. Neither is confirmed by the backend.
#[derive(Debug, Clone, Serialize)]
pub struct RouteResponse {
    pub response: String,
    pub success: bool,
    pub model_requested: String,
    pub model_configured: String,
    /// Wall-clock seconds, rounded to centiseconds.
    pub execution_time: f64,
    pub exit_code: Option<i32>,
    pub files_created: usize,
    /// Newly created paths, sorted, bounded to the first 10.
    pub new_files: Vec<String>,
    /// Sanitized stderr, absent when the child wrote none.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    /// RFC 3339 UTC completion time.
    pub timestamp: String,
}

/// Outbound reply: either a full response or an error payload.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum RouteReply {
    Ok(RouteResponse),
    Failure { error: String },
}

impl RouteReply {
    pub fn failure(error: impl Into<String>) -> Self {
        RouteReply::Failure { error: error.into() }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RouteReply::Ok(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_parse_round_trips() {
        assert_eq!(Model::parse("glm-4.6"), Some(Model::Glm46));
        assert_eq!(Model::parse("glm-4.5-air"), Some(Model::Glm45Air));
        assert_eq!(Model::parse("gpt-4"), None);
        assert_eq!(Model::parse("glm-4.6").map(Model::as_str), Some("glm-4.6"));
    }

    #[test]
    fn route_request_accepts_missing_model() {
        let req: RouteRequest = serde_json::from_str(r#"{"prompt": "hi"}"#).expect("parse");
        assert_eq!(req.prompt, "hi");
        assert!(req.model.is_none());

        let req: RouteRequest =
            serde_json::from_str(r#"{"prompt": "hi", "model": "glm-4.5-air"}"#).expect("parse");
        assert_eq!(req.model, Some(Model::Glm45Air));
    }

    #[test]
    fn reply_serializes_flat_error_object() {
        let reply = RouteReply::failure("boom");
        let json = serde_json::to_string(&reply).expect("serialize");
        assert_eq!(json, r#"{"error":"boom"}"#);
    }

    #[test]
    fn context_fields_skip_absent_session() {
        let ctx = RequestContext {
            request_id: "req-1".into(),
            session_id: None,
            instance_id: "inst-1".into(),
            pid: 42,
            tool: "glm_route".into(),
            prompt_preview: "hello".into(),
            prompt_sha256: Some("abcd".into()),
        };
        let fields = ctx.fields();
        assert!(!fields.contains_key("session_id"));
        assert_eq!(fields["request_id"], "req-1");
        assert_eq!(fields["pid"], 42);
    }
}
