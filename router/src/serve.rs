//! Line-oriented stdio request loop.
//!
//! One JSON request object per stdin line, one JSON reply per stdout line.
//! Each inbound object is validated against the embedded request schema
//! before it reaches the router; malformed lines yield an error reply
//! instead of terminating the loop.

use std::io::{self, BufRead, Write};

use anyhow::{Context, Result};
use jsonschema::Draft;
use serde_json::Value;
use tracing::info;

use crate::core::types::{RouteReply, RouteRequest};
use crate::route::Router;

const REQUEST_SCHEMA: &str = include_str!("../../schemas/route_request/v1.schema.json");

/// Serve requests from stdin until it closes.
pub fn serve(router: &Router) -> Result<()> {
    info!("router ready, waiting for requests on stdin");
    let stdin = io::stdin();
    let stdout = io::stdout();
    for line in stdin.lock().lines() {
        let line = line.context("read request line")?;
        if line.trim().is_empty() {
            continue;
        }
        let reply = handle_line(router, &line);
        let payload = serde_json::to_string(&reply).context("serialize reply")?;
        let mut out = stdout.lock();
        writeln!(out, "{payload}").context("write reply")?;
        out.flush().context("flush stdout")?;
    }
    info!("stdin closed, shutting down");
    Ok(())
}

/// Parse, validate, and route one request line.
pub fn handle_line(router: &Router, line: &str) -> RouteReply {
    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(err) => return RouteReply::failure(format!("invalid request: {err}")),
    };
    if let Err(message) = validate_request(&value) {
        return RouteReply::failure(message);
    }
    let request: RouteRequest = match serde_json::from_value(value) {
        Ok(request) => request,
        Err(err) => return RouteReply::failure(format!("invalid request: {err}")),
    };
    router.route(&request)
}

/// Validate a request object against the JSON Schema (Draft 2020-12).
fn validate_request(instance: &Value) -> Result<(), String> {
    let schema: Value = serde_json::from_str(REQUEST_SCHEMA)
        .map_err(|err| format!("parse embedded request schema: {err}"))?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .map_err(|err| format!("compile request schema: {err}"))?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if messages.is_empty() {
        Ok(())
    } else {
        Err(format!("invalid request: {}", messages.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn schema_accepts_minimal_and_full_requests() {
        assert!(validate_request(&json!({"prompt": "hi"})).is_ok());
        assert!(validate_request(&json!({"prompt": "hi", "model": "glm-4.5-air"})).is_ok());
    }

    #[test]
    fn schema_rejects_missing_prompt() {
        let err = validate_request(&json!({"model": "glm-4.6"})).unwrap_err();
        assert!(err.contains("prompt"));
    }

    #[test]
    fn schema_rejects_unknown_models_and_extra_fields() {
        assert!(validate_request(&json!({"prompt": "hi", "model": "gpt-4"})).is_err());
        assert!(validate_request(&json!({"prompt": "hi", "extra": true})).is_err());
        assert!(validate_request(&json!("just a string")).is_err());
    }

    #[cfg(unix)]
    mod with_router {
        use super::*;
        use crate::core::sanitize::Sanitizer;
        use crate::io::config::{Credentials, LogSinkConfig, RouterConfig};
        use crate::io::log_pipeline::LogPipeline;
        use crate::route::Router;

        fn cat_router(temp: &tempfile::TempDir) -> (LogPipeline, Router) {
            let workdir = temp.path().join("work");
            std::fs::create_dir_all(&workdir).expect("create workdir");
            let config = RouterConfig {
                command: vec!["sh".into(), "-c".into(), "cat".into()],
                workdir,
                logging: LogSinkConfig {
                    dir: Some(temp.path().join("logs")),
                    ..LogSinkConfig::default()
                },
                ..RouterConfig::default()
            };
            let creds = Credentials {
                base_url: "http://localhost:9".into(),
                auth_token: "test-token".into(),
            };
            let pipeline = LogPipeline::start(&config.logging, Sanitizer::new(None));
            let router = Router::new(config, creds, pipeline.handle());
            (pipeline, router)
        }

        #[test]
        fn valid_line_round_trips_through_the_router() {
            let temp = tempfile::tempdir().expect("tempdir");
            let (pipeline, router) = cat_router(&temp);

            let reply = handle_line(&router, r#"{"prompt": "echo me"}"#);
            match reply {
                RouteReply::Ok(response) => assert_eq!(response.response, "echo me"),
                RouteReply::Failure { error } => panic!("unexpected failure: {error}"),
            }
            pipeline.shutdown();
        }

        #[test]
        fn malformed_line_yields_an_error_reply() {
            let temp = tempfile::tempdir().expect("tempdir");
            let (pipeline, router) = cat_router(&temp);

            let reply = handle_line(&router, "{not json");
            assert!(matches!(reply, RouteReply::Failure { .. }));

            let reply = handle_line(&router, r#"{"model": "glm-4.6"}"#);
            match reply {
                RouteReply::Failure { error } => assert!(error.contains("invalid request")),
                RouteReply::Ok(_) => panic!("schema violation must not route"),
            }
            pipeline.shutdown();
        }
    }
}
