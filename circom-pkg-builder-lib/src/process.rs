use crate::error::{Error, Result};
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Runs an external tool to completion, killing it if `timeout` elapses.
///
/// A nonzero exit is not an error here; callers decide what the output means.
pub async fn run(mut command: Command, timeout: Duration) -> Result<Output> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    debug!(command = ?command.as_std(), "Running external tool");

    let child = command
        .spawn()
        .map_err(|e| Error::ToolError(format!("failed to start {:?}: {}", command.as_std().get_program(), e)))?;
    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => Ok(output?),
        Err(_) => Err(Error::Timeout(format!(
            "{:?} did not finish within {:?}",
            command.as_std().get_program(),
            timeout
        ))),
    }
}

/// The diagnostic a failed tool left behind: stderr, or stdout when stderr is empty.
pub fn diagnostic(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        return stderr.into_owned();
    }
    String::from_utf8_lossy(&output.stdout).into_owned()
}

/// Fails with the tool's own diagnostic when it exited nonzero.
pub fn check_success(output: Output) -> Result<Output> {
    if output.status.success() {
        Ok(output)
    } else {
        Err(Error::ToolError(diagnostic(&output)))
    }
}
