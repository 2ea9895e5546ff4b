//! Asynchronous utilities for use with Tokio.
//!
//! The worker pool and the page rasterizer both lean on these. Keep anything
//! involving `Pin`, `spawn_blocking` or subprocess output here.

use std::{panic, pin::Pin};

use anyhow::anyhow;
use tokio::task::JoinHandle;

use crate::prelude::*;

pub mod io;

/// A type alias for a boxed future. This is used to make it easier to work with
/// with complex futures.
pub type BoxedFuture<Output> = Pin<Box<dyn Future<Output = Output> + Send>>;

/// A handle for one or more background workers. This can be awaited
/// to wait for all workers to complete normally.
pub struct JoinWorker {
    /// The task handle.
    future: BoxedFuture<Result<()>>,
}

impl JoinWorker {
    /// Create a new worker handle from a [`JoinHandle`].
    pub fn from_handle(handle: JoinHandle<Result<()>>) -> Self {
        Self {
            future: Box::pin(async move { handle.await.context("could not join task")? }),
        }
    }

    /// Wait for the worker to complete.
    pub async fn join(self) -> Result<()> {
        self.future.await
    }
}

/// Wrapper around [`tokio::task::spawn_blocking`] that propagates panics from
/// the background task.
pub async fn spawn_blocking_propagating_panics<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(value) => Ok(value),
        Err(err) if err.is_panic() => panic::resume_unwind(err.into_panic()),
        Err(err) => Err(anyhow!("blocking task was cancelled: {}", err)),
    }
}

/// Report any command failures, and include any error output.
///
/// The output of standard error and standard output will be logged at
/// appropriate levels. Lines of standard error may optionally be checked with
/// `is_error_line` to decide whether a "successful" command actually failed.
pub fn check_for_command_failure(
    command_name: &str,
    output: &std::process::Output,
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
        error!(command_name, exit_code, "Command failed");
        Err(anyhow!(
            "{} failed with exit code {} and error output:\n{}",
            command_name,
            exit_code,
            stderr,
        ))
    } else {
        error!(command_name, "Command was killed by a signal");
        Err(anyhow!(
            "{} failed with error output:\n{}",
            command_name,
            stderr,
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::{os::unix::process::ExitStatusExt as _, process::Output};

    use super::*;

    fn output(code: i32, stderr: &str) -> Output {
        Output {
            status: std::process::ExitStatus::from_raw(code << 8),
            stdout: vec![],
            stderr: stderr.as_bytes().to_vec(),
        }
    }

    #[test]
    fn successful_command_passes() {
        assert!(check_for_command_failure("true", &output(0, ""), None).is_ok());
    }

    #[test]
    fn exit_code_is_reported() {
        let err = check_for_command_failure("false", &output(3, "boom"), None)
            .unwrap_err()
            .to_string();
        assert!(err.contains("exit code 3"));
        assert!(err.contains("boom"));
    }

    #[test]
    fn error_lines_fail_successful_commands() {
        let is_error = |line: &str| line.starts_with("Error");
        let out = output(0, "Warning: odd\nError: bad");
        assert!(check_for_command_failure("tool", &out, Some(&is_error)).is_err());
        let out = output(0, "Warning: odd");
        assert!(check_for_command_failure("tool", &out, Some(&is_error)).is_ok());
    }

    #[tokio::test]
    async fn blocking_tasks_return_their_value() -> Result<()> {
        let value = spawn_blocking_propagating_panics(|| 6 * 7).await?;
        assert_eq!(value, 42);
        Ok(())
    }
}
