//! Asynchronous utilities for use with Tokio, plus helpers for the external
//! commands we shell out to.

use std::process::Output;

use anyhow::anyhow;

use crate::prelude::*;

pub mod io;

/// Run a CPU-bound closure on Tokio's blocking pool, and re-raise any panic
/// in the caller instead of turning it into a [`tokio::task::JoinError`].
pub async fn spawn_blocking_propagating_panics<F, T>(f: F) -> T
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(value) => value,
        Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
        // The runtime is shutting down. Nothing sensible left to do.
        Err(err) => panic!("blocking task was cancelled: {err}"),
    }
}

/// Report any command failures, and include any error output.
///
/// Standard output and standard error are logged at appropriate levels.
/// Standard error may optionally be checked line by line with `is_error_line`
/// to detect failures that still exit with status 0.
pub fn check_for_command_failure(
    command_name: &str,
    output: &Output,
    is_error_line: Option<&dyn Fn(&str) -> bool>,
) -> Result<()> {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    trace!(
        command_name = command_name,
        output = %stdout,
        "Standard output from command"
    );
    if !stderr.trim().is_empty() {
        debug!(
            command_name = command_name,
            output = %stderr,
            "Standard error from command",
        );
    }

    if output.status.success() {
        if let Some(is_error_line) = is_error_line
            && stderr.lines().any(is_error_line)
        {
            return Err(anyhow!(
                "{} printed error output:\n{}",
                command_name,
                stderr,
            ));
        }
        Ok(())
    } else if let Some(exit_code) = output.status.code() {
        Err(anyhow!(
            "{} failed with exit code {} and error output:\n{}",
            command_name,
            exit_code,
            stderr,
        ))
    } else {
        Err(anyhow!(
            "{} failed with error output:\n{}",
            command_name,
            stderr,
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::process::Command;

    use super::*;

    #[test]
    #[cfg(unix)]
    fn failed_commands_are_reported() {
        let output = Command::new("sh")
            .args(["-c", "echo oops >&2; exit 3"])
            .output()
            .unwrap();
        let err = check_for_command_failure("sh", &output, None).unwrap_err();
        assert!(err.to_string().contains("exit code 3"));
        assert!(err.to_string().contains("oops"));
    }

    #[test]
    #[cfg(unix)]
    fn error_lines_fail_successful_commands() {
        let output = Command::new("sh")
            .args(["-c", "echo 'Error: bad xref' >&2"])
            .output()
            .unwrap();
        let is_error = |line: &str| line.starts_with("Error");
        assert!(check_for_command_failure("sh", &output, Some(&is_error)).is_err());
        assert!(check_for_command_failure("sh", &output, None).is_ok());
    }

    #[tokio::test]
    async fn blocking_tasks_return_values() {
        let value = spawn_blocking_propagating_panics(|| 6 * 7).await;
        assert_eq!(value, 42);
    }
}
