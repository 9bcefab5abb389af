//! Command execution primitives with consistent error handling.

use serde::Serialize;
use std::process::{Command, Output};

use crate::error::{Error, Result};

/// Captured result of a shell command.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
    pub exit_code: i32,
}

/// Run a command in a specific directory.
///
/// Returns trimmed stdout if the command succeeds.
/// Returns an error with stderr (or stdout fallback) if it fails.
pub fn run_in(dir: &str, program: &str, args: &[&str], context: &str) -> Result<String> {
    let output = Command::new(program)
        .args(args)
        .current_dir(dir)
        .output()
        .map_err(|e| {
            Error::internal_io(
                format!("Failed to run {}: {}", context, e),
                Some(context.to_string()),
            )
        })?;

    if !output.status.success() {
        return Err(Error::internal_io(
            format!("{} failed: {}", context, error_text(&output)),
            Some(context.to_string()),
        ));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Extract error text from command output.
///
/// Prefers stderr, falls back to stdout if stderr is empty.
pub fn error_text(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        stderr.trim().to_string()
    } else {
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }
}

/// Run `command` through the platform shell.
///
/// `env` is added on top of the inherited environment, then every name in
/// `unset` is removed. Spawn failures are reported as a failed output with
/// exit code -1.
pub fn run_shell(
    command: &str,
    current_dir: Option<&str>,
    env: &[(String, String)],
    unset: &[String],
) -> CommandOutput {
    #[cfg(windows)]
    let mut cmd = {
        let mut cmd = Command::new("cmd");
        cmd.args(["/C", command]);
        cmd
    };

    #[cfg(not(windows))]
    let mut cmd = {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", command]);
        cmd
    };

    if let Some(dir) = current_dir {
        cmd.current_dir(dir);
    }

    cmd.envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    for name in unset {
        cmd.env_remove(name);
    }

    match cmd.output() {
        Ok(out) => CommandOutput {
            stdout: String::from_utf8_lossy(&out.stdout).to_string(),
            stderr: String::from_utf8_lossy(&out.stderr).to_string(),
            success: out.status.success(),
            exit_code: out.status.code().unwrap_or(-1),
        },
        Err(e) => CommandOutput {
            stdout: String::new(),
            stderr: format!("Command error: {}", e),
            success: false,
            exit_code: -1,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_in_returns_trimmed_stdout() {
        assert_eq!(run_in("/tmp", "echo", &["hello"], "echo test").unwrap(), "hello");
    }

    #[test]
    fn run_in_fails_with_invalid_command() {
        assert!(run_in("/tmp", "nonexistent_command_xyz", &[], "test").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn run_shell_applies_env_and_unset() {
        std::env::set_var("CDRUN_TEST_SECRET_SHELL", "leak");
        let out = run_shell(
            "printf '%s|%s' \"$GREETING\" \"$CDRUN_TEST_SECRET_SHELL\"",
            Some("/tmp"),
            &[("GREETING".to_string(), "hi".to_string())],
            &["CDRUN_TEST_SECRET_SHELL".to_string()],
        );
        assert!(out.success);
        assert_eq!(out.stdout, "hi|");
    }

    #[cfg(unix)]
    #[test]
    fn run_shell_reports_exit_code() {
        let out = run_shell("echo boom >&2; exit 3", None, &[], &[]);
        assert!(!out.success);
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stderr.trim(), "boom");
    }
}
