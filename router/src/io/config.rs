//! Router configuration: TOML tunables plus environment credentials.
//!
//! Operational knobs live in a human-editable TOML file with stable
//! defaults. Credentials are sourced from the process environment only and
//! never appear in the file, in any serialized form of the config, or in
//! debug output.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};

use crate::core::timeouts::TimeoutPolicy;
use crate::core::types::Model;

pub const BASE_URL_VAR: &str = "GLM_BASE_URL";
pub const AUTH_TOKEN_VAR: &str = "GLM_AUTH_TOKEN";
pub const DEFAULT_BASE_URL: &str = "https://api.z.ai/api/anthropic";

/// Router configuration (TOML).
///
/// Missing fields default to sensible values; a missing file yields the
/// full default configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RouterConfig {
    /// Fixed argv for the wrapped CLI. The prompt always goes to stdin.
    pub command: Vec<String>,

    /// Working directory for the child process and root for file tracking.
    pub workdir: PathBuf,

    /// Model injected when a request does not name one.
    pub default_model: Model,

    /// Treat non-zero exits with usable output or new files as successes.
    pub lenient_exit: bool,

    /// Snapshot cache time-to-live in seconds.
    pub snapshot_ttl_secs: u64,

    /// Truncate captured child stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,

    pub timeouts: TimeoutPolicy,

    pub logging: LogSinkConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogSinkConfig {
    /// Structured log directory. When unset, resolved from `ROUTER_LOG_DIR`,
    /// `CLAUDE_LOG_DIR`, or `~/.claude/logs`, in that order.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,

    /// One log file per router process (`router-<pid>.jsonl`).
    pub per_process: bool,

    /// Rotate the structured sink beyond this many bytes.
    pub max_bytes: u64,

    /// Number of rotated segments to retain.
    pub backups: usize,
}

impl Default for LogSinkConfig {
    fn default() -> Self {
        Self {
            dir: None,
            per_process: true,
            max_bytes: 10 * 1024 * 1024,
            backups: 5,
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "claude".to_string(),
                "--dangerously-skip-permissions".to_string(),
                "-c".to_string(),
                "-p".to_string(),
            ],
            workdir: PathBuf::from("."),
            default_model: Model::default(),
            lenient_exit: true,
            snapshot_ttl_secs: 5,
            output_limit_bytes: 100_000,
            timeouts: TimeoutPolicy::default(),
            logging: LogSinkConfig::default(),
        }
    }
}

impl RouterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.command.is_empty() || self.command[0].trim().is_empty() {
            return Err(anyhow!("command must be a non-empty array"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.logging.max_bytes == 0 {
            return Err(anyhow!("logging.max_bytes must be > 0"));
        }
        if self.logging.backups == 0 {
            return Err(anyhow!("logging.backups must be > 0"));
        }
        let problems = self.timeouts.problems();
        if !problems.is_empty() {
            bail!("invalid timeouts:\n- {}", problems.join("\n- "));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RouterConfig::default()`.
pub fn load_config(path: &Path) -> Result<RouterConfig> {
    if !path.exists() {
        let cfg = RouterConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RouterConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// GLM backend credentials, injected into every child's environment.
#[derive(Clone)]
pub struct Credentials {
    pub base_url: String,
    pub auth_token: String,
}

// The token must never leak through `{:?}` formatting of surrounding state.
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("base_url", &self.base_url)
            .field("auth_token", &"***REDACTED***")
            .finish()
    }
}

impl Credentials {
    /// Read credentials from the process environment. The auth token is
    /// required; the base URL defaults to the public endpoint.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let base_url = lookup(BASE_URL_VAR)
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let auth_token = lookup(AUTH_TOKEN_VAR)
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| {
                anyhow!("{AUTH_TOKEN_VAR} is not set; export it before starting the router")
            })?;
        Ok(Self {
            base_url,
            auth_token,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, RouterConfig::default());
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("router.toml");
        fs::write(
            &path,
            "default_model = \"glm-4.5-air\"\n\n[timeouts]\ndefault_secs = 60\n",
        )
        .expect("write config");

        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.default_model, Model::Glm45Air);
        assert_eq!(cfg.timeouts.default_secs, 60);
        // Untouched fields keep their defaults.
        assert_eq!(cfg.command[0], "claude");
        assert_eq!(cfg.timeouts.max_secs, 600);
    }

    #[test]
    fn validate_rejects_empty_command() {
        let cfg = RouterConfig {
            command: vec![],
            ..RouterConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn credentials_require_the_token() {
        let err = Credentials::from_lookup(|_| None).unwrap_err();
        assert!(err.to_string().contains(AUTH_TOKEN_VAR));

        let creds = Credentials::from_lookup(|key| {
            (key == AUTH_TOKEN_VAR).then(|| "tok".to_string())
        })
        .expect("credentials");
        assert_eq!(creds.base_url, DEFAULT_BASE_URL);
        assert_eq!(creds.auth_token, "tok");
    }

    #[test]
    fn credentials_debug_redacts_the_token() {
        let creds = Credentials {
            base_url: DEFAULT_BASE_URL.to_string(),
            auth_token: "very-secret".to_string(),
        };
        let debug = format!("{creds:?}");
        assert!(!debug.contains("very-secret"));
        assert!(debug.contains("***REDACTED***"));
    }
}
