//! Exit-outcome classification for completed child processes.
//!
//! Pure mapping from (exit code, captured output, new files) to a verdict
//! plus the user-facing response text. The priority order is deliberate:
//! a clean exit wins, then usable stdout, then filesystem side effects,
//! and only then is the exit treated as a hard failure. Some backends
//! return partial but valid output alongside non-zero exit codes, and
//! discarding it on the exit code alone produces false negatives.

use serde::Serialize;

/// A file created by the child, with its size when it could be read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFile {
    pub path: String,
    pub size: Option<u64>,
}

/// Classification of one completed execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Exit code 0.
    Success,
    /// Non-zero exit, but usable output or side effects exist.
    SoftSuccess,
    /// Non-zero exit with nothing to show for it.
    Failure,
}

/// Verdict plus the response text handed back to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub outcome: Outcome,
    pub response: String,
}

/// Tunables for classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifyPolicy {
    /// Treat non-zero exits with usable output or new files as soft
    /// successes. Turning this off makes every non-zero exit a failure.
    pub lenient_exit: bool,
    /// Stdout shorter than this is considered noise, not usable output.
    pub min_stdout_chars: usize,
    /// Files listed individually in the response summary; the rest are
    /// folded into a remainder count.
    pub max_listed_files: usize,
}

impl Default for ClassifyPolicy {
    fn default() -> Self {
        Self {
            lenient_exit: true,
            min_stdout_chars: 10,
            max_listed_files: 10,
        }
    }
}

/// Explicit notice for a clean exit that produced nothing observable. This
/// state is valid and must stay distinguishable from a failure.
pub const EMPTY_OUTPUT_NOTICE: &str =
    "GLM execution completed but returned no output and created no files. \
     Check the router logs for details.";

/// Classify one completed execution.
///
/// `stderr` must already be sanitized by the caller; it flows into the
/// failure response verbatim.
pub fn classify(
    exit_code: i32,
    stdout: &str,
    stderr: &str,
    new_files: &[NewFile],
    policy: &ClassifyPolicy,
) -> Verdict {
    if exit_code != 0 {
        let usable_stdout =
            policy.lenient_exit && stdout.chars().count() > policy.min_stdout_chars;
        let usable_files = policy.lenient_exit && !new_files.is_empty();
        if !usable_stdout && !usable_files {
            let reason = if stderr.trim().is_empty() {
                format!("GLM exited with code {exit_code}")
            } else {
                stderr.trim().to_string()
            };
            return Verdict {
                outcome: Outcome::Failure,
                response: format!("GLM failed: {reason}"),
            };
        }
    }

    let outcome = if exit_code == 0 {
        Outcome::Success
    } else {
        Outcome::SoftSuccess
    };
    let response = if new_files.is_empty() {
        if stdout.trim().is_empty() {
            EMPTY_OUTPUT_NOTICE.to_string()
        } else {
            stdout.to_string()
        }
    } else {
        file_summary(new_files, stdout, policy.max_listed_files)
    };
    Verdict { outcome, response }
}

/// Human-readable summary of created files, with the raw stdout appended
/// underneath when present.
fn file_summary(new_files: &[NewFile], stdout: &str, max_listed: usize) -> String {
    let mut lines = vec![
        "GLM execution completed.".to_string(),
        format!(
            "{} file{} created:",
            new_files.len(),
            if new_files.len() == 1 { "" } else { "s" }
        ),
    ];
    for file in new_files.iter().take(max_listed) {
        match file.size {
            Some(size) => lines.push(format!("  - {} ({} bytes)", file.path, size)),
            None => lines.push(format!("  - {}", file.path)),
        }
    }
    if new_files.len() > max_listed {
        lines.push(format!("  ... and {} more files", new_files.len() - max_listed));
    }
    if !stdout.trim().is_empty() {
        lines.push(String::new());
        lines.push("Original output:".to_string());
        lines.push(stdout.to_string());
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files(paths: &[&str]) -> Vec<NewFile> {
        paths
            .iter()
            .map(|p| NewFile {
                path: p.to_string(),
                size: None,
            })
            .collect()
    }

    #[test]
    fn clean_exit_with_stdout_returns_raw_stdout() {
        let verdict = classify(0, "4", "", &[], &ClassifyPolicy::default());
        assert_eq!(verdict.outcome, Outcome::Success);
        assert_eq!(verdict.response, "4");
    }

    #[test]
    fn nonzero_exit_with_new_files_is_soft_success() {
        let verdict = classify(1, "", "", &files(&["a.txt"]), &ClassifyPolicy::default());
        assert_eq!(verdict.outcome, Outcome::SoftSuccess);
        assert!(verdict.response.contains("1 file"));
        assert!(verdict.response.contains("a.txt"));
    }

    #[test]
    fn nonzero_exit_with_nothing_is_failure_carrying_stderr() {
        let verdict = classify(1, "", "boom", &[], &ClassifyPolicy::default());
        assert_eq!(verdict.outcome, Outcome::Failure);
        assert!(verdict.response.contains("boom"));
    }

    #[test]
    fn clean_exit_with_nothing_gets_the_empty_notice() {
        let verdict = classify(0, "", "", &[], &ClassifyPolicy::default());
        assert_eq!(verdict.outcome, Outcome::Success);
        assert_eq!(verdict.response, EMPTY_OUTPUT_NOTICE);
    }

    #[test]
    fn nonzero_exit_with_long_stdout_is_soft_success() {
        let stdout = "a usable answer, longer than the noise floor";
        let verdict = classify(2, stdout, "warning", &[], &ClassifyPolicy::default());
        assert_eq!(verdict.outcome, Outcome::SoftSuccess);
        assert_eq!(verdict.response, stdout);
    }

    #[test]
    fn short_stdout_on_nonzero_exit_is_still_noise() {
        let verdict = classify(1, "ok", "boom", &[], &ClassifyPolicy::default());
        assert_eq!(verdict.outcome, Outcome::Failure);
    }

    #[test]
    fn strict_policy_fails_nonzero_exits_despite_output() {
        let policy = ClassifyPolicy {
            lenient_exit: false,
            ..ClassifyPolicy::default()
        };
        let verdict = classify(1, "a perfectly usable answer", "", &files(&["a.txt"]), &policy);
        assert_eq!(verdict.outcome, Outcome::Failure);
        assert!(verdict.response.contains("exited with code 1"));
    }

    #[test]
    fn generic_message_when_stderr_is_empty() {
        let verdict = classify(7, "", "", &[], &ClassifyPolicy::default());
        assert_eq!(verdict.outcome, Outcome::Failure);
        assert!(verdict.response.contains("exited with code 7"));
    }

    #[test]
    fn file_summary_bounds_listing_and_appends_stdout() {
        let many: Vec<NewFile> = (0..12)
            .map(|i| NewFile {
                path: format!("f{i}.txt"),
                size: Some(i),
            })
            .collect();
        let verdict = classify(0, "done", "", &many, &ClassifyPolicy::default());
        assert_eq!(verdict.outcome, Outcome::Success);
        assert!(verdict.response.contains("12 files created:"));
        assert!(verdict.response.contains("f0.txt (0 bytes)"));
        assert!(verdict.response.contains("f9.txt"));
        assert!(!verdict.response.contains("f10.txt"));
        assert!(verdict.response.contains("... and 2 more files"));
        assert!(verdict.response.contains("Original output:\ndone"));
    }
}
