//! Child-process orchestration: staged spawn, timed exchange, escalating
//! cancellation.
//!
//! Each request drives exactly one child through an explicit lifecycle:
//!
//! ```text
//! Init -> Connecting -> Communicating -> Completed ------------> Closed
//!                 |                 \-> TimedOut -> Terminating -> Closed
//!                 \-> SpawnFailed --------------------------------> Closed
//! ```
//!
//! Every transition is emitted through the logging pipeline. All exit paths
//! end with the child fully reaped; a timeout escalates from a graceful
//! termination request through a grace period to a hard kill.

use std::io::{ErrorKind, Read, Write};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use crossbeam::channel::{RecvTimeoutError, bounded};
use serde_json::{Map, Value};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

use crate::core::types::RequestContext;
use crate::io::log_pipeline::{Level, LogHandle};

/// Lifecycle states for one request's child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Connecting,
    Communicating,
    Completed,
    TimedOut,
    SpawnFailed,
    Terminating,
    Closed,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Init => "init",
            Phase::Connecting => "connecting",
            Phase::Communicating => "communicating",
            Phase::Completed => "completed",
            Phase::TimedOut => "timed_out",
            Phase::SpawnFailed => "spawn_failed",
            Phase::Terminating => "terminating",
            Phase::Closed => "closed",
        }
    }

    fn level(self) -> Level {
        match self {
            Phase::TimedOut | Phase::Terminating => Level::Warning,
            Phase::SpawnFailed => Level::Error,
            _ => Level::Info,
        }
    }
}

/// Credential overlay written into the child's environment table. The
/// parent environment is never mutated.
#[derive(Clone)]
pub struct ChildEnv {
    pub base_url: String,
    pub auth_token: String,
    pub model: String,
}

impl std::fmt::Debug for ChildEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildEnv")
            .field("base_url", &self.base_url)
            .field("auth_token", &"***REDACTED***")
            .field("model", &self.model)
            .finish()
    }
}

/// Terminal failures of a child run, typed so callers can map each to the
/// right user-facing message.
#[derive(Debug)]
pub enum ChildError {
    /// The executable does not exist. Fatal, not retried.
    NotFound { command: String },
    /// Process creation itself exceeded the connection timeout.
    SpawnTimeout(Duration),
    /// The exchange exceeded the effective timeout; the child has been
    /// reaped before this is returned.
    TimedOut { limit: Duration },
    /// Any other spawn failure.
    Spawn(anyhow::Error),
    /// I/O failure during communication.
    Io(anyhow::Error),
}

impl std::fmt::Display for ChildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChildError::NotFound { command } => {
                write!(f, "{command} command not found; ensure it is installed and in PATH")
            }
            ChildError::SpawnTimeout(limit) => {
                write!(f, "child process failed to start within {}s", limit.as_secs())
            }
            ChildError::TimedOut { limit } => {
                write!(f, "request timed out after {}s", limit.as_secs())
            }
            ChildError::Spawn(err) => write!(f, "failed to start child process: {err:#}"),
            ChildError::Io(err) => write!(f, "child process i/o failed: {err:#}"),
        }
    }
}

impl std::error::Error for ChildError {}

/// Captured result of a completed child process.
#[derive(Debug)]
pub struct RawExecution {
    /// `None` when the child was killed by a signal.
    pub exit_code: Option<i32>,
    /// Lossy-decoded stdout with trailing whitespace stripped.
    pub stdout: String,
    /// Lossy-decoded stderr with trailing whitespace stripped.
    pub stderr: String,
    pub elapsed: Duration,
}

/// Parameters for one child run.
#[derive(Debug)]
pub struct RunSpec<'a> {
    /// Fixed argv; the prompt is never passed as an argument.
    pub command: &'a [String],
    pub workdir: &'a Path,
    pub env: &'a ChildEnv,
    pub prompt: &'a str,
    /// Effective communication timeout (already resolved per model).
    pub timeout: Duration,
    pub connect_timeout: Duration,
    /// Wait after the graceful termination request before the hard kill.
    pub grace: Duration,
    /// Bound on captured stdout/stderr bytes (excess is drained, not kept).
    pub output_limit_bytes: usize,
}

/// Run one child process to a terminal state.
///
/// The prompt goes to stdin, stdout/stderr are drained concurrently with a
/// byte limit, and the wait is bounded by `spec.timeout`. On timeout the
/// child is terminated in two phases and reaped before the error returns.
#[instrument(skip_all, fields(
    timeout_secs = spec.timeout.as_secs(),
    connect_secs = spec.connect_timeout.as_secs(),
))]
pub fn run_child(
    spec: &RunSpec<'_>,
    log: &LogHandle,
    ctx: &RequestContext,
) -> Result<RawExecution, ChildError> {
    let mut phase = PhaseTracker::new(log, ctx);

    let Some(program) = spec.command.first() else {
        return Err(ChildError::Spawn(anyhow!("command must not be empty")));
    };

    // Init: argv plus the credential overlay. `Command::env` only writes
    // the child's table; the parent environment stays untouched.
    let mut cmd = Command::new(program);
    cmd.args(&spec.command[1..])
        .current_dir(spec.workdir)
        .env("ANTHROPIC_BASE_URL", &spec.env.base_url)
        .env("ANTHROPIC_AUTH_TOKEN", &spec.env.auth_token)
        .env("ANTHROPIC_MODEL", &spec.env.model)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    phase.advance(Phase::Connecting, Map::new());
    let started = Instant::now();
    let mut child = match spawn_with_deadline(cmd, program, spec.connect_timeout) {
        Ok(child) => child,
        Err(err) => {
            let mut fields = Map::new();
            fields.insert("error_message".into(), Value::String(err.to_string()));
            phase.advance(Phase::SpawnFailed, fields);
            phase.advance(Phase::Closed, Map::new());
            return Err(err);
        }
    };

    phase.advance(Phase::Communicating, Map::new());

    // Writer thread: the child may exit without reading its stdin, in which
    // case the write ends early with EPIPE. Dropping the handle closes the
    // pipe and signals EOF.
    let stdin = take_stream(child.stdin.take(), "stdin", &mut child, &mut phase, spec.grace)?;
    let prompt_bytes = spec.prompt.as_bytes().to_vec();
    let writer = thread::spawn(move || {
        let mut stdin = stdin;
        if let Err(err) = stdin.write_all(&prompt_bytes) {
            debug!(err = %err, "stdin write ended early");
        }
    });

    let stdout = take_stream(child.stdout.take(), "stdout", &mut child, &mut phase, spec.grace)?;
    let stderr = take_stream(child.stderr.take(), "stderr", &mut child, &mut phase, spec.grace)?;
    let limit = spec.output_limit_bytes;
    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, limit));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, limit));

    let status = match child.wait_timeout(spec.timeout) {
        Ok(Some(status)) => status,
        Ok(None) => {
            let mut fields = Map::new();
            fields.insert("timeout_secs".into(), Value::from(spec.timeout.as_secs()));
            phase.advance(Phase::TimedOut, fields);

            let mut fields = Map::new();
            fields.insert("grace_secs".into(), Value::from(spec.grace.as_secs()));
            phase.advance(Phase::Terminating, fields);
            terminate(&mut child, spec.grace);

            // Do not join the I/O threads here: an orphaned grandchild can
            // keep the pipes open long after the child itself is reaped,
            // and the captured output is discarded on timeout anyway. The
            // threads exit once the last pipe writer dies.
            drop(writer);
            drop(stdout_handle);
            drop(stderr_handle);
            phase.advance(Phase::Closed, Map::new());
            return Err(ChildError::TimedOut { limit: spec.timeout });
        }
        Err(err) => {
            terminate(&mut child, spec.grace);
            drop(writer);
            drop(stdout_handle);
            drop(stderr_handle);
            phase.advance(Phase::Closed, Map::new());
            return Err(ChildError::Io(anyhow!(err).context("wait for child process")));
        }
    };

    let _ = writer.join();
    let joined = join_output(stdout_handle).and_then(|out| {
        join_output(stderr_handle).map(|err| (out, err))
    });
    let ((stdout, stdout_truncated), (stderr, stderr_truncated)) = match joined {
        Ok(outputs) => outputs,
        Err(err) => {
            phase.advance(Phase::Closed, Map::new());
            return Err(err);
        }
    };
    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "child output truncated");
    }

    let mut fields = Map::new();
    fields.insert("exit_code".into(), exit_code_value(status.code()));
    phase.advance(Phase::Completed, fields);
    phase.advance(Phase::Closed, Map::new());

    Ok(RawExecution {
        exit_code: status.code(),
        stdout: decode(&stdout),
        stderr: decode(&stderr),
        elapsed: started.elapsed(),
    })
}

/// Lossy UTF-8 decode with trailing whitespace stripped.
fn decode(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim_end().to_string()
}

fn exit_code_value(code: Option<i32>) -> Value {
    match code {
        Some(code) => Value::from(code),
        None => Value::String("signal".to_string()),
    }
}

/// Spawn on a helper thread bounded by the connection timeout. If the
/// deadline passes, the helper reaps a late-arriving child so nothing
/// leaks, and the caller fails fast without attempting communication.
fn spawn_with_deadline(
    mut cmd: Command,
    program: &str,
    deadline: Duration,
) -> Result<Child, ChildError> {
    let (tx, rx) = bounded(1);
    thread::spawn(move || {
        let result = cmd.spawn();
        if let Err(send_err) = tx.send(result) {
            if let Ok(mut orphan) = send_err.into_inner() {
                warn!("spawn completed after deadline, reaping orphan child");
                let _ = orphan.kill();
                let _ = orphan.wait();
            }
        }
    });
    match rx.recv_timeout(deadline) {
        Ok(Ok(child)) => Ok(child),
        Ok(Err(err)) if err.kind() == ErrorKind::NotFound => Err(ChildError::NotFound {
            command: program.to_string(),
        }),
        Ok(Err(err)) => Err(ChildError::Spawn(anyhow!(err).context("spawn child process"))),
        Err(RecvTimeoutError::Timeout) => Err(ChildError::SpawnTimeout(deadline)),
        Err(RecvTimeoutError::Disconnected) => {
            Err(ChildError::Spawn(anyhow!("spawn thread terminated unexpectedly")))
        }
    }
}

/// Two-phase cancellation: graceful request, grace period, hard kill.
/// Idempotent; a child that already exited is simply reaped.
fn terminate(child: &mut Child, grace: Duration) {
    if let Ok(Some(status)) = child.try_wait() {
        debug!(exit_code = ?status.code(), "child already exited");
        return;
    }
    request_exit(child);
    match child.wait_timeout(grace) {
        Ok(Some(status)) => {
            debug!(exit_code = ?status.code(), "child exited after graceful request");
        }
        _ => {
            warn!("child ignored graceful termination, killing");
            if let Err(err) = child.kill() {
                debug!(err = %err, "kill failed (child already exited?)");
            }
            if let Err(err) = child.wait() {
                warn!(err = %err, "failed to reap child after kill");
            }
        }
    }
}

#[cfg(unix)]
#[allow(unsafe_code)] // std::process has no way to deliver SIGTERM; raw kill(2) is required
fn request_exit(child: &Child) {
    let pid = child.id() as libc::pid_t;
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc != 0 {
        debug!(pid, "SIGTERM delivery failed (child already exited?)");
    }
}

#[cfg(not(unix))]
fn request_exit(_child: &Child) {
    // No graceful signal on this platform; the escalation path kills.
}

fn take_stream<T>(
    stream: Option<T>,
    name: &str,
    child: &mut Child,
    phase: &mut PhaseTracker<'_>,
    grace: Duration,
) -> Result<T, ChildError> {
    match stream {
        Some(stream) => Ok(stream),
        None => {
            terminate(child, grace);
            phase.advance(Phase::Closed, Map::new());
            Err(ChildError::Io(anyhow!("{name} was not piped")))
        }
    }
}

fn join_output(
    handle: thread::JoinHandle<std::io::Result<(Vec<u8>, usize)>>,
) -> Result<(Vec<u8>, usize), ChildError> {
    match handle.join() {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(err)) => Err(ChildError::Io(anyhow!(err).context("read child output"))),
        Err(_) => Err(ChildError::Io(anyhow!("output reader thread panicked"))),
    }
}

/// Read a stream to EOF, keeping at most `limit` bytes. Excess bytes are
/// drained and counted so the child never blocks on a full pipe.
fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> std::io::Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}

/// Emits one pipeline event per state transition, keeping the machine
/// explicit instead of burying it in error-handling branches.
struct PhaseTracker<'a> {
    current: Phase,
    log: &'a LogHandle,
    ctx: &'a RequestContext,
}

impl<'a> PhaseTracker<'a> {
    fn new(log: &'a LogHandle, ctx: &'a RequestContext) -> Self {
        Self {
            current: Phase::Init,
            log,
            ctx,
        }
    }

    fn advance(&mut self, next: Phase, mut fields: Map<String, Value>) {
        debug!(from = self.current.as_str(), to = next.as_str(), "phase transition");
        fields.insert("from".into(), Value::String(self.current.as_str().to_string()));
        self.log.process_event(self.ctx, next.level(), next.as_str(), fields);
        self.current = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::sanitize::Sanitizer;
    use crate::io::config::LogSinkConfig;
    use crate::io::log_pipeline::LogPipeline;
    use std::path::PathBuf;

    struct Harness {
        _temp: tempfile::TempDir,
        pipeline: LogPipeline,
        ctx: RequestContext,
        workdir: PathBuf,
    }

    fn harness() -> Harness {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = LogSinkConfig {
            dir: Some(temp.path().join("logs")),
            ..LogSinkConfig::default()
        };
        let pipeline = LogPipeline::start(&cfg, Sanitizer::new(None));
        let handle = pipeline.handle();
        let ctx = RequestContext {
            request_id: "req-test".into(),
            session_id: None,
            instance_id: handle.instance_id().to_string(),
            pid: handle.pid(),
            tool: "glm_route".into(),
            prompt_preview: "test".into(),
            prompt_sha256: None,
        };
        let workdir = temp.path().to_path_buf();
        Harness {
            _temp: temp,
            pipeline,
            ctx,
            workdir,
        }
    }

    fn test_env() -> ChildEnv {
        ChildEnv {
            base_url: "http://localhost:9".into(),
            auth_token: "test-token".into(),
            model: "glm-4.6".into(),
        }
    }

    fn command(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|p| p.to_string()).collect()
    }

    fn spec<'a>(
        command: &'a [String],
        prompt: &'a str,
        env: &'a ChildEnv,
        workdir: &'a Path,
        timeout: Duration,
        grace: Duration,
    ) -> RunSpec<'a> {
        RunSpec {
            command,
            workdir,
            env,
            prompt,
            timeout,
            connect_timeout: Duration::from_secs(5),
            grace,
            output_limit_bytes: 100_000,
        }
    }

    #[test]
    #[cfg(unix)]
    fn prompt_round_trips_through_stdin() {
        let h = harness();
        let env = test_env();
        let cmd = command(&["sh", "-c", "cat"]);
        let spec = spec(
            &cmd,
            "hello router",
            &env,
            &h.workdir,
            Duration::from_secs(10),
            Duration::from_secs(1),
        );

        let exec = run_child(&spec, &h.pipeline.handle(), &h.ctx).expect("run");
        assert_eq!(exec.exit_code, Some(0));
        assert_eq!(exec.stdout, "hello router");
        assert_eq!(exec.stderr, "");
    }

    #[test]
    #[cfg(unix)]
    fn captures_stderr_and_exit_code() {
        let h = harness();
        let env = test_env();
        let cmd = command(&["sh", "-c", "echo boom >&2; exit 3"]);
        let spec = spec(
            &cmd,
            "",
            &env,
            &h.workdir,
            Duration::from_secs(10),
            Duration::from_secs(1),
        );

        let exec = run_child(&spec, &h.pipeline.handle(), &h.ctx).expect("run");
        assert_eq!(exec.exit_code, Some(3));
        assert_eq!(exec.stderr, "boom");
    }

    #[test]
    #[cfg(unix)]
    fn overlay_reaches_the_child_without_touching_the_parent() {
        let h = harness();
        let env = test_env();
        let cmd = command(&["sh", "-c", "printf '%s' \"$ANTHROPIC_MODEL\""]);
        let spec = spec(
            &cmd,
            "",
            &env,
            &h.workdir,
            Duration::from_secs(10),
            Duration::from_secs(1),
        );

        let parent_before = std::env::var("ANTHROPIC_MODEL").ok();
        let exec = run_child(&spec, &h.pipeline.handle(), &h.ctx).expect("run");
        assert_eq!(exec.stdout, "glm-4.6");
        // The overlay writes the child's table only.
        assert_eq!(std::env::var("ANTHROPIC_MODEL").ok(), parent_before);
    }

    #[test]
    fn missing_executable_is_command_not_found() {
        let h = harness();
        let env = test_env();
        let cmd = command(&["router-test-no-such-binary"]);
        let spec = spec(
            &cmd,
            "",
            &env,
            &h.workdir,
            Duration::from_secs(5),
            Duration::from_secs(1),
        );

        let err = run_child(&spec, &h.pipeline.handle(), &h.ctx).unwrap_err();
        assert!(matches!(err, ChildError::NotFound { .. }));
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    #[cfg(unix)]
    fn timeout_terminates_within_budget() {
        let h = harness();
        let env = test_env();
        let cmd = command(&["sh", "-c", "sleep 30"]);
        let timeout = Duration::from_millis(200);
        let grace = Duration::from_millis(200);
        let spec = spec(&cmd, "", &env, &h.workdir, timeout, grace);

        let started = Instant::now();
        let err = run_child(&spec, &h.pipeline.handle(), &h.ctx).unwrap_err();
        assert!(matches!(err, ChildError::TimedOut { .. }));
        // Effective timeout + grace + scheduling slack, with a wide margin.
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    #[cfg(unix)]
    fn sigterm_ignoring_child_is_force_killed() {
        let h = harness();
        let env = test_env();
        let cmd = command(&["sh", "-c", "trap '' TERM; sleep 30"]);
        let spec = spec(
            &cmd,
            "",
            &env,
            &h.workdir,
            Duration::from_millis(200),
            Duration::from_millis(300),
        );

        let started = Instant::now();
        let err = run_child(&spec, &h.pipeline.handle(), &h.ctx).unwrap_err();
        assert!(matches!(err, ChildError::TimedOut { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    #[cfg(unix)]
    fn output_beyond_the_limit_is_drained_not_kept() {
        let h = harness();
        let env = test_env();
        let cmd = command(&["sh", "-c", "head -c 50000 /dev/zero | tr '\\0' 'a'"]);
        let mut spec = spec(
            &cmd,
            "",
            &env,
            &h.workdir,
            Duration::from_secs(10),
            Duration::from_secs(1),
        );
        spec.output_limit_bytes = 100;

        let exec = run_child(&spec, &h.pipeline.handle(), &h.ctx).expect("run");
        assert_eq!(exec.exit_code, Some(0));
        assert_eq!(exec.stdout.len(), 100);
    }
}
