//! Recognized configuration for the delegation core.
//!
//! Precedence is flag over environment over convention; everything here is
//! resolved once at startup and shared read-only afterwards.

use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_EXEC_TIMEOUT_SECS: u64 = 120;

/// Environment prefix whose variables are forwarded to task subprocesses and
/// consulted for configuration.
pub const ENV_PREFIX: &str = "CONDUCTOR_";

#[derive(Debug, Clone)]
pub struct Config {
    /// Program the executor invokes as `<exec> --profile <profile> <task>`.
    pub task_exec: String,
    /// Hard ceiling on a single task execution.
    pub exec_timeout: Duration,
    /// Explicit agents directory; `None` falls through to env and defaults.
    pub agents_dir: Option<PathBuf>,
    /// Bypasses the sensitive-entry exclusion list when mirroring.
    pub mirror_everything: bool,
    /// Enables diagnostic notifications and pretty-printed tool output.
    pub debug: bool,
    /// Base working directory used when a delegate call omits `cwd`.
    pub base_cwd: PathBuf,
}

impl Config {
    pub fn from_env(base_cwd: PathBuf) -> Self {
        let timeout_secs = std::env::var("CONDUCTOR_EXEC_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(DEFAULT_EXEC_TIMEOUT_SECS);
        let mirror_everything = std::env::var("CONDUCTOR_MIRROR_ALL")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        Self {
            task_exec: std::env::var("CONDUCTOR_EXEC").unwrap_or_else(|_| "codex".to_string()),
            exec_timeout: Duration::from_secs(timeout_secs),
            agents_dir: None,
            mirror_everything,
            debug: false,
            base_cwd,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let base_cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self::from_env(base_cwd)
    }
}
