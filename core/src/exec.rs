//! External executor: spawns the task program with an allow-listed
//! environment and a hard timeout.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::warn;

use crate::config::ENV_PREFIX;

/// OS variables forwarded to every task subprocess. Everything else in the
/// ambient environment is withheld so unrelated secrets never leak into a
/// delegated task.
const ENV_ALLOWLIST: &[&str] = &[
    "HOME", "LANG", "LC_ALL", "PATH", "SHELL", "TERM", "TMPDIR", "USER",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecResult {
    fn failure(code: i32, stderr: String) -> Self {
        Self {
            code,
            stdout: String::new(),
            stderr,
        }
    }
}

fn sanitized_env() -> HashMap<String, String> {
    std::env::vars()
        .filter(|(key, _)| ENV_ALLOWLIST.contains(&key.as_str()) || key.starts_with(ENV_PREFIX))
        .collect()
}

/// Runs `program` with `args` in `cwd`, capturing exit code and output.
///
/// Never returns an error: a missing executable becomes code 127 with an
/// actionable message, a timeout force-kills the subprocess and synthesizes a
/// failure, and any other spawn problem is reported through `stderr`.
pub async fn run_task(
    program: &str,
    args: &[String],
    cwd: &Path,
    timeout: Duration,
) -> ExecResult {
    let mut command = Command::new(program);
    command
        .args(args)
        .current_dir(cwd)
        .env_clear()
        .envs(sanitized_env())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = match command.spawn() {
        Ok(child) => child,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return ExecResult::failure(
                127,
                format!(
                    "{program} binary not found in PATH. Install it and ensure it is on PATH, \
                     or point CONDUCTOR_EXEC at the task executable."
                ),
            );
        }
        Err(e) => {
            return ExecResult::failure(1, format!("Failed to spawn {program}: {e}"));
        }
    };

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => ExecResult {
            code: output.status.code().unwrap_or(1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        },
        Ok(Err(e)) => ExecResult::failure(1, format!("Failed to collect {program} output: {e}")),
        Err(_) => {
            // kill_on_drop reaps the subprocess when the future is dropped.
            warn!(program, timeout_secs = timeout.as_secs(), "task execution timed out");
            ExecResult::failure(
                1,
                format!(
                    "Execution timed out after {}s and the subprocess was killed.",
                    timeout.as_secs()
                ),
            )
        }
    }
}

/// Fast existence probe for the task executable, used to warn at startup
/// before any request arrives.
pub fn task_exec_available(program: &str) -> bool {
    which::which(program).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_executable_is_code_127() {
        let res = run_task(
            "non-existent-command-xyz",
            &[],
            Path::new("."),
            Duration::from_secs(5),
        )
        .await;
        assert_eq!(res.code, 127);
        assert!(res.stderr.contains("not found in PATH"));
    }

    #[tokio::test]
    async fn allowlisted_env_only() {
        let env = sanitized_env();
        for key in env.keys() {
            assert!(
                ENV_ALLOWLIST.contains(&key.as_str()) || key.starts_with(ENV_PREFIX),
                "unexpected env var forwarded: {key}"
            );
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_kills_and_synthesizes_failure() {
        let res = run_task(
            "sleep",
            &["5".to_string()],
            Path::new("."),
            Duration::from_millis(100),
        )
        .await;
        assert_eq!(res.code, 1);
        assert!(res.stderr.contains("timed out"));
    }
}
