//! Non-blocking, sanitizing, dual-sink structured logging.
//!
//! Producers push events into a bounded queue and return immediately; a
//! single listener thread drains the queue in emission order, sanitizes and
//! bounds every event, then fans it out to a rotating JSONL file sink and a
//! human-readable stderr line. The pipeline is an explicit object created
//! once at startup and passed into request handling as a [`LogHandle`];
//! there is no global logger.
//!
//! Failure policy: a full queue drops the event (and counts the drop), an
//! unwritable log directory falls back to `./logs`, and a sink that cannot
//! be opened at all leaves the stderr stream as the only sink. None of
//! these conditions ever fails a request.

use std::env;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use crossbeam::channel::{Receiver, Sender, TrySendError, bounded};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::core::sanitize::{self, Sanitizer};
use crate::core::types::RequestContext;
use crate::io::config::LogSinkConfig;

/// Bounded queue size; producers never wait on a slow sink.
pub const QUEUE_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Warning,
    Error,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Level::Info => "INFO",
            Level::Warning => "WARNING",
            Level::Error => "ERROR",
        }
    }
}

/// One structured event: kind plus a flat field map. Timestamps are
/// assigned by the consumer so they stay monotonic per pipeline instance.
#[derive(Debug)]
pub struct LogEvent {
    pub level: Level,
    pub event: String,
    pub fields: Map<String, Value>,
}

enum Message {
    Event(LogEvent),
    Shutdown,
}

/// Cheap, cloneable producer handle into the pipeline.
#[derive(Clone)]
pub struct LogHandle {
    tx: Sender<Message>,
    dropped: Arc<AtomicU64>,
    instance_id: Arc<str>,
    pid: u32,
}

impl LogHandle {
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Events dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Queue an event. Never blocks: a full queue drops the event and a
    /// disconnected listener (shutdown race) discards it.
    pub fn emit(&self, level: Level, event: &str, fields: Map<String, Value>) {
        let message = Message::Event(LogEvent {
            level,
            event: event.to_string(),
            fields,
        });
        if let Err(TrySendError::Full(_)) = self.tx.try_send(message) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn log_request(&self, ctx: &RequestContext) {
        self.emit(Level::Info, "request", ctx.fields());
    }

    /// Response event: context fields plus caller-provided summary fields
    /// (latency, previews, file counts).
    pub fn log_response(&self, ctx: &RequestContext, extra: Map<String, Value>) {
        let mut fields = ctx.fields();
        fields.extend(extra);
        self.emit(Level::Info, "response", fields);
    }

    /// Unexpected-error event with a bounded, trace-like detail field.
    pub fn log_error(&self, ctx: &RequestContext, latency_ms: f64, error: &anyhow::Error) {
        let mut fields = ctx.fields();
        fields.insert("latency_ms".into(), Value::from(latency_ms));
        fields.insert("error_type".into(), Value::String("UnexpectedError".into()));
        fields.insert("error_message".into(), Value::String(error.to_string()));
        fields.insert("traceback".into(), Value::String(format!("{error:?}")));
        self.emit(Level::Error, "error", fields);
    }

    /// Process lifecycle event (`step` names the stage or transition).
    pub fn process_event(
        &self,
        ctx: &RequestContext,
        level: Level,
        step: &str,
        extra: Map<String, Value>,
    ) {
        let mut fields = ctx.fields();
        fields.insert("step".into(), Value::String(step.to_string()));
        fields.extend(extra);
        self.emit(level, "process", fields);
    }
}

/// Owner of the queue, the listener thread, and the sinks.
pub struct LogPipeline {
    handle: LogHandle,
    listener: Option<JoinHandle<()>>,
    log_path: Option<PathBuf>,
}

impl LogPipeline {
    /// Start the pipeline: resolve the log file location from config and
    /// environment, open the sinks, spawn the listener, and emit the
    /// startup event.
    pub fn start(cfg: &LogSinkConfig, sanitizer: Sanitizer) -> Self {
        let pid = std::process::id();
        let primary = resolve_log_file(cfg, pid, |key| env::var(key).ok());
        let fallback_dir = env::current_dir()
            .map(|d| d.join("logs"))
            .unwrap_or_else(|_| PathBuf::from("logs"));
        Self::start_with_target(cfg, sanitizer, primary, fallback_dir)
    }

    fn start_with_target(
        cfg: &LogSinkConfig,
        sanitizer: Sanitizer,
        primary: PathBuf,
        fallback_dir: PathBuf,
    ) -> Self {
        let pid = std::process::id();
        let instance_id: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(12)
            .map(char::from)
            .collect();

        let sink = open_sink(&primary, &fallback_dir, cfg.max_bytes, cfg.backups);
        let log_path = sink.as_ref().map(|s| s.path.clone());

        let (tx, rx) = bounded(QUEUE_CAPACITY);
        let handle = LogHandle {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
            instance_id: Arc::from(instance_id.as_str()),
            pid,
        };

        let listener = match thread::Builder::new()
            .name("router-log".to_string())
            .spawn(move || listener_loop(rx, sink, sanitizer))
        {
            Ok(join) => Some(join),
            Err(err) => {
                error!(err = %err, "failed to spawn log listener, structured logging disabled");
                None
            }
        };

        let mut fields = Map::new();
        fields.insert("instance_id".into(), Value::String(instance_id));
        fields.insert("pid".into(), Value::from(pid));
        if let Some(path) = &log_path {
            fields.insert("log_file".into(), Value::String(path.display().to_string()));
        }
        handle.emit(Level::Info, "startup", fields);

        Self {
            handle,
            listener,
            log_path,
        }
    }

    pub fn handle(&self) -> LogHandle {
        self.handle.clone()
    }

    /// Path of the structured sink, if one could be opened.
    pub fn log_path(&self) -> Option<&Path> {
        self.log_path.as_deref()
    }

    /// Flush and stop: emits the shutdown event, drains the queue, joins
    /// the listener.
    pub fn shutdown(mut self) {
        let mut fields = Map::new();
        fields.insert("pid".into(), Value::from(self.handle.pid));
        fields.insert("dropped_events".into(), Value::from(self.handle.dropped()));
        self.handle.emit(Level::Info, "shutdown", fields);
        self.stop_listener();
    }

    fn stop_listener(&mut self) {
        if let Some(join) = self.listener.take() {
            let _ = self.handle.tx.send(Message::Shutdown);
            let _ = join.join();
        }
    }
}

impl Drop for LogPipeline {
    fn drop(&mut self) {
        self.stop_listener();
    }
}

/// Resolve the structured log file path. Priority: `ROUTER_LOG_PATH` (exact
/// file), configured dir, `ROUTER_LOG_DIR`, `CLAUDE_LOG_DIR`, then
/// `~/.claude/logs`.
fn resolve_log_file(
    cfg: &LogSinkConfig,
    pid: u32,
    lookup: impl Fn(&str) -> Option<String>,
) -> PathBuf {
    if let Some(path) = lookup("ROUTER_LOG_PATH").filter(|v| !v.trim().is_empty()) {
        return PathBuf::from(path);
    }
    let dir = cfg
        .dir
        .clone()
        .or_else(|| lookup("ROUTER_LOG_DIR").map(PathBuf::from))
        .or_else(|| lookup("CLAUDE_LOG_DIR").map(PathBuf::from))
        .or_else(|| dirs::home_dir().map(|home| home.join(".claude").join("logs")))
        .unwrap_or_else(|| PathBuf::from("logs"));
    let name = if cfg.per_process {
        format!("router-{pid}.jsonl")
    } else {
        "router.jsonl".to_string()
    };
    dir.join(name)
}

fn open_sink(
    primary: &Path,
    fallback_dir: &Path,
    max_bytes: u64,
    backups: usize,
) -> Option<JsonlSink> {
    match JsonlSink::open(primary, max_bytes, backups) {
        Ok(sink) => Some(sink),
        Err(err) => {
            warn!(
                path = %primary.display(),
                err = %format!("{err:#}"),
                "structured sink unavailable, falling back"
            );
            let name = primary
                .file_name()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("router.jsonl"));
            let fallback = fallback_dir.join(name);
            match JsonlSink::open(&fallback, max_bytes, backups) {
                Ok(sink) => Some(sink),
                Err(err) => {
                    error!(
                        path = %fallback.display(),
                        err = %format!("{err:#}"),
                        "structured logging disabled, stderr stream only"
                    );
                    None
                }
            }
        }
    }
}

fn listener_loop(rx: Receiver<Message>, mut sink: Option<JsonlSink>, sanitizer: Sanitizer) {
    let mut last_ts: DateTime<Utc> = Utc::now();
    while let Ok(message) = rx.recv() {
        let event = match message {
            Message::Shutdown => break,
            Message::Event(event) => event,
        };

        // Wall-clock timestamp, clamped so it never moves backwards within
        // this pipeline instance.
        let now = Utc::now();
        let ts = if now > last_ts { now } else { last_ts };
        last_ts = ts;

        let level = event.level;
        let entry = render(event, ts, &sanitizer);
        match serde_json::to_string(&Value::Object(entry.clone())) {
            Ok(line) => {
                if let Some(sink) = sink.as_mut()
                    && let Err(err) = sink.write_line(&line)
                {
                    warn!(err = %format!("{err:#}"), "structured sink write failed");
                }
            }
            Err(err) => warn!(err = %err, "failed to serialize log event"),
        }

        let line = human_line(&entry);
        match level {
            Level::Info => info!(target: "router::event", "{line}"),
            Level::Warning => warn!(target: "router::event", "{line}"),
            Level::Error => error!(target: "router::event", "{line}"),
        }
    }
    if let Some(sink) = sink.as_mut() {
        let _ = sink.flush();
    }
    debug!("log listener stopped");
}

/// Assemble, sanitize, and bound the serialized form of one event.
fn render(event: LogEvent, ts: DateTime<Utc>, sanitizer: &Sanitizer) -> Map<String, Value> {
    let mut entry = Map::new();
    entry.insert(
        "ts".into(),
        Value::String(ts.to_rfc3339_opts(SecondsFormat::Millis, true)),
    );
    entry.insert("level".into(), Value::String(event.level.as_str().into()));
    entry.insert("logger".into(), Value::String("router".into()));
    entry.insert("event".into(), Value::String(event.event));
    entry.extend(event.fields);

    let sanitized = sanitizer.sanitize_value(Value::Object(entry));
    let Value::Object(mut map) = sanitized else {
        return Map::new();
    };
    sanitize::bound_fields(&mut map);
    map
}

/// Compact single-line rendering for the stderr stream.
fn human_line(entry: &Map<String, Value>) -> String {
    const SHOWN: &[&str] = &[
        "event",
        "request_id",
        "step",
        "tool",
        "model",
        "exit_code",
        "latency_ms",
        "files_created",
        "error_message",
        "message",
    ];
    let mut parts = Vec::new();
    for key in SHOWN {
        if let Some(value) = entry.get(*key) {
            let shown = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            parts.push(format!("{key}={shown}"));
        }
    }
    parts.join(" ")
}

/// Append-only JSONL file with size-based rotation.
struct JsonlSink {
    path: PathBuf,
    max_bytes: u64,
    backups: usize,
    file: BufWriter<File>,
    written: u64,
}

impl JsonlSink {
    fn open(path: &Path, max_bytes: u64, backups: usize) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("create log dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open log file {}", path.display()))?;
        let written = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            path: path.to_path_buf(),
            max_bytes,
            backups,
            file: BufWriter::new(file),
            written,
        })
    }

    fn write_line(&mut self, line: &str) -> Result<()> {
        let projected = self.written + line.len() as u64 + 1;
        if projected > self.max_bytes && self.written > 0 {
            self.rotate()?;
        }
        writeln!(self.file, "{line}")
            .with_context(|| format!("write {}", self.path.display()))?;
        // Flush per line: the file must stay tail-able and survive crashes.
        self.file
            .flush()
            .with_context(|| format!("flush {}", self.path.display()))?;
        self.written += line.len() as u64 + 1;
        Ok(())
    }

    /// Shift `path.1 .. path.N` up, dropping the oldest, then reopen.
    fn rotate(&mut self) -> Result<()> {
        self.file.flush().ok();
        let oldest = numbered(&self.path, self.backups);
        if oldest.exists() {
            let _ = fs::remove_file(&oldest);
        }
        for index in (1..self.backups).rev() {
            let from = numbered(&self.path, index);
            if from.exists() {
                let _ = fs::rename(&from, numbered(&self.path, index + 1));
            }
        }
        let _ = fs::rename(&self.path, numbered(&self.path, 1));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("reopen log file {}", self.path.display()))?;
        self.file = BufWriter::new(file);
        self.written = 0;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.file.flush().context("flush log sink")
    }
}

fn numbered(path: &Path, index: usize) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(format!(".{index}"));
    PathBuf::from(os)
}
