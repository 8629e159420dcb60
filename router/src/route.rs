//! Per-request orchestration: validate, snapshot, spawn, classify, respond.
//!
//! One [`Router`] is built at startup and shared across requests. Each
//! request owns its child process end-to-end; the only shared mutable
//! structures are the logging pipeline's queue and the snapshot cache.

use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{SecondsFormat, Utc};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::{info, instrument, warn};

use crate::core::classifier::{self, ClassifyPolicy, NewFile, Outcome};
use crate::core::language::{CJK_REJECTION_NOTICE, contains_cjk};
use crate::core::sanitize::{MAX_LIST_ITEMS, MAX_PREVIEW_LEN, Sanitizer, truncate_chars};
use crate::core::types::{RequestContext, RouteReply, RouteRequest, RouteResponse};
use crate::io::config::{Credentials, RouterConfig};
use crate::io::log_pipeline::{Level, LogHandle};
use crate::io::process::{ChildEnv, ChildError, RunSpec, run_child};
use crate::io::snapshot::{Snapshotter, diff};

pub const TOOL_NAME: &str = "glm_route";

/// Request handler: owns the snapshotter and a handle into the logging
/// pipeline, and carries the credentials injected into every child.
pub struct Router {
    config: RouterConfig,
    creds: Credentials,
    log: LogHandle,
    snapshots: Snapshotter,
    sanitizer: Sanitizer,
}

impl Router {
    pub fn new(config: RouterConfig, creds: Credentials, log: LogHandle) -> Self {
        let snapshots = Snapshotter::new(Duration::from_secs(config.snapshot_ttl_secs));
        let sanitizer = Sanitizer::new(Some(&creds.auth_token));
        Self {
            config,
            creds,
            log,
            snapshots,
            sanitizer,
        }
    }

    /// Handle one request end-to-end.
    ///
    /// Process-lifecycle failures surface as explicit error payloads; any
    /// unexpected error is logged with bounded, sanitized detail and
    /// converted into a generic error. Nothing propagates out of here.
    #[instrument(skip_all, fields(tool = TOOL_NAME))]
    pub fn route(&self, request: &RouteRequest) -> RouteReply {
        let started = Instant::now();
        let ctx = self.request_context(request);
        self.log.log_request(&ctx);

        let reply = match self.try_route(request, &ctx) {
            Ok(reply) => reply,
            Err(err) => {
                let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
                self.log.log_error(&ctx, latency_ms, &err);
                let message = self
                    .sanitizer
                    .scrub_text(&truncate_chars(&format!("{err:#}"), MAX_PREVIEW_LEN));
                RouteReply::failure(format!("Unexpected error: {message}"))
            }
        };

        self.log_response(&ctx, &reply, started);
        reply
    }

    fn try_route(&self, request: &RouteRequest, ctx: &RequestContext) -> Result<RouteReply> {
        if request.prompt.trim().is_empty() {
            warn!(request_id = %ctx.request_id, "request rejected: no prompt provided");
            return Ok(RouteReply::failure("No prompt provided"));
        }
        if contains_cjk(&request.prompt) {
            warn!(request_id = %ctx.request_id, "request rejected: unsupported prompt language");
            return Ok(RouteReply::failure(CJK_REJECTION_NOTICE));
        }

        let model = request.model.unwrap_or(self.config.default_model);
        let workdir = self.config.workdir.as_path();
        let before = self.snapshots.capture(workdir);

        let mut fields = Map::new();
        fields.insert(
            "cmd_preview".into(),
            Value::String(self.config.command.join(" ")),
        );
        fields.insert("cwd".into(), Value::String(workdir.display().to_string()));
        fields.insert("model".into(), Value::String(model.as_str().to_string()));
        fields.insert("files_before".into(), Value::from(before.len()));
        self.log.process_event(ctx, Level::Info, "spawn", fields);

        let env = ChildEnv {
            base_url: self.creds.base_url.clone(),
            auth_token: self.creds.auth_token.clone(),
            model: model.as_str().to_string(),
        };
        let spec = RunSpec {
            command: &self.config.command,
            workdir,
            env: &env,
            prompt: &request.prompt,
            timeout: self.config.timeouts.effective(model.as_str()),
            connect_timeout: self.config.timeouts.connect(),
            grace: self.config.timeouts.grace(),
            output_limit_bytes: self.config.output_limit_bytes,
        };

        let exec = match run_child(&spec, &self.log, ctx) {
            Ok(exec) => exec,
            // Spawn- and communication-level failures are part of the
            // request contract: surface them as explicit error payloads.
            Err(
                err @ (ChildError::NotFound { .. }
                | ChildError::SpawnTimeout(_)
                | ChildError::TimedOut { .. }),
            ) => {
                return Ok(RouteReply::failure(err.to_string()));
            }
            Err(ChildError::Spawn(err) | ChildError::Io(err)) => return Err(err),
        };

        let after = self.snapshots.capture_fresh(workdir);
        let new_paths = diff(&before, &after);
        let new_files: Vec<NewFile> = new_paths
            .iter()
            .map(|path| NewFile {
                path: path.display().to_string(),
                size: std::fs::metadata(path).ok().map(|m| m.len()),
            })
            .collect();

        let exit_code = exec.exit_code.unwrap_or(-1);
        let mut fields = Map::new();
        fields.insert("exit_code".into(), Value::from(exit_code));
        fields.insert("stdout_len".into(), Value::from(exec.stdout.len()));
        fields.insert("stderr_len".into(), Value::from(exec.stderr.len()));
        if !exec.stderr.is_empty() {
            fields.insert("stderr_preview".into(), Value::String(exec.stderr.clone()));
        }
        fields.insert("files_after".into(), Value::from(after.len()));
        fields.insert("files_created".into(), Value::from(new_files.len()));
        fields.insert("new_files".into(), file_list(&new_files));
        self.log.process_event(ctx, Level::Info, "exit", fields);

        let sanitized_stderr = if exec.stderr.is_empty() {
            None
        } else {
            Some(self.sanitizer.scrub_text(&exec.stderr))
        };

        let policy = ClassifyPolicy {
            lenient_exit: self.config.lenient_exit,
            ..ClassifyPolicy::default()
        };
        let verdict = classifier::classify(
            exit_code,
            &exec.stdout,
            sanitized_stderr.as_deref().unwrap_or(""),
            &new_files,
            &policy,
        );

        match verdict.outcome {
            Outcome::Failure => {
                let mut fields = Map::new();
                fields.insert("exit_code".into(), Value::from(exit_code));
                if let Some(stderr) = &sanitized_stderr {
                    fields.insert("stderr_preview".into(), Value::String(stderr.clone()));
                }
                self.log.process_event(ctx, Level::Error, "failed", fields);
                return Ok(RouteReply::failure(verdict.response));
            }
            Outcome::SoftSuccess => {
                let mut fields = Map::new();
                fields.insert("exit_code".into(), Value::from(exit_code));
                fields.insert("stdout_len".into(), Value::from(exec.stdout.len()));
                fields.insert("files_created".into(), Value::from(new_files.len()));
                self.log.process_event(ctx, Level::Warning, "soft_success", fields);
            }
            Outcome::Success => {}
        }

        self.log_step(ctx, &exec.stdout, &new_files);

        let response = RouteResponse {
            response: verdict.response,
            success: true,
            model_requested: request
                .model
                .unwrap_or(self.config.default_model)
                .as_str()
                .to_string(),
            model_configured: model.as_str().to_string(),
            execution_time: round2(exec.elapsed.as_secs_f64()),
            exit_code: exec.exit_code,
            files_created: new_files.len(),
            new_files: new_files
                .iter()
                .take(MAX_LIST_ITEMS)
                .map(|f| f.path.clone())
                .collect(),
            stderr: sanitized_stderr,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        };

        let mut fields = Map::new();
        fields.insert("execution_time".into(), Value::from(response.execution_time));
        fields.insert("exit_code".into(), Value::from(exit_code));
        fields.insert("files_created".into(), Value::from(response.files_created));
        fields.insert("response_length".into(), Value::from(response.response.len()));
        self.log.process_event(ctx, Level::Info, "success", fields);
        info!(
            request_id = %ctx.request_id,
            elapsed_secs = response.execution_time,
            "routing completed"
        );

        Ok(RouteReply::Ok(response))
    }

    /// Step event describing what the execution produced.
    fn log_step(&self, ctx: &RequestContext, stdout: &str, new_files: &[NewFile]) {
        if !new_files.is_empty() {
            let summary: Vec<&str> = new_files
                .iter()
                .take(5)
                .map(|f| {
                    f.path
                        .rsplit('/')
                        .next()
                        .unwrap_or(f.path.as_str())
                })
                .collect();
            let mut fields = Map::new();
            fields.insert("files_created".into(), Value::from(new_files.len()));
            fields.insert("new_files".into(), file_list(new_files));
            fields.insert("file_summary".into(), Value::String(summary.join(" ")));
            self.log.process_event(ctx, Level::Info, "file_creation", fields);
        } else if !stdout.trim().is_empty() {
            let mut fields = Map::new();
            fields.insert("output_length".into(), Value::from(stdout.len()));
            fields.insert("response_preview".into(), Value::String(stdout.to_string()));
            self.log.process_event(ctx, Level::Info, "text_output", fields);
        } else {
            let mut fields = Map::new();
            fields.insert(
                "warning".into(),
                Value::String("no output or files created".to_string()),
            );
            self.log.process_event(ctx, Level::Warning, "empty_response", fields);
        }
    }

    fn log_response(&self, ctx: &RequestContext, reply: &RouteReply, started: Instant) {
        let mut extra = Map::new();
        extra.insert(
            "latency_ms".into(),
            Value::from(round2(started.elapsed().as_secs_f64() * 1000.0)),
        );
        match reply {
            RouteReply::Ok(response) => {
                extra.insert(
                    "model".into(),
                    Value::String(response.model_configured.clone()),
                );
                extra.insert(
                    "response_preview".into(),
                    Value::String(response.response.clone()),
                );
                extra.insert("files_created".into(), Value::from(response.files_created));
                extra.insert(
                    "new_files".into(),
                    Value::Array(
                        response
                            .new_files
                            .iter()
                            .map(|p| Value::String(p.clone()))
                            .collect(),
                    ),
                );
            }
            RouteReply::Failure { error } => {
                extra.insert("error_type".into(), Value::String("RouteError".into()));
                extra.insert("error_message".into(), Value::String(error.clone()));
            }
        }
        self.log.log_response(ctx, extra);
    }

    fn request_context(&self, request: &RouteRequest) -> RequestContext {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(12)
            .map(char::from)
            .collect();
        RequestContext {
            request_id: format!("req-{suffix}"),
            session_id: std::env::var("CLAUDE_SESSION")
                .ok()
                .filter(|s| !s.is_empty()),
            instance_id: self.log.instance_id().to_string(),
            pid: self.log.pid(),
            tool: TOOL_NAME.to_string(),
            prompt_preview: truncate_chars(&request.prompt, MAX_PREVIEW_LEN),
            prompt_sha256: hash_prompt(&request.prompt),
        }
    }
}

fn file_list(new_files: &[NewFile]) -> Value {
    Value::Array(
        new_files
            .iter()
            .take(MAX_LIST_ITEMS)
            .map(|f| Value::String(f.path.clone()))
            .collect(),
    )
}

/// First 16 hex chars of the prompt's SHA-256, for correlation without
/// exposing content.
fn hash_prompt(prompt: &str) -> Option<String> {
    if prompt.is_empty() {
        return None;
    }
    let digest = Sha256::digest(prompt.as_bytes());
    Some(hex::encode(digest)[..16].to_string())
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
