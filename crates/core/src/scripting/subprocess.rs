//! Subprocess management for external maintenance tools.
//!
//! [`run_command`] spawns a prepared [`Command`], pipes a JSON context to
//! stdin, captures stdout/stderr and enforces the attempt timeout.

use std::process::Stdio;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

/// Maximum stdout or stderr size captured per stream (10 MiB).
pub const MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

/// Input handed to a child process.
#[derive(Debug, Clone)]
pub struct CommandInput {
    /// JSON payload piped to stdin.
    pub data: Value,
    pub env_vars: Vec<(String, String)>,
    /// Working directory (current dir if `None`).
    pub working_directory: Option<String>,
    /// Wall-clock budget before the process is killed.
    pub timeout: Duration,
}

/// Captured output of a finished process.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Process exit code (`-1` if killed by signal).
    pub exit_code: i32,
    pub duration_ms: u64,
    /// Stdout parsed as JSON, `None` when it is not valid JSON.
    pub parsed_output: Option<Value>,
    /// Either stream exceeded [`MAX_OUTPUT_BYTES`] and was cut.
    pub truncated: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("Command timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Bytes kept from one output stream.
#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
}

impl Captured {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// Spawn `cmd`, feed it `input`, and wait for it within the timeout.
///
/// Program and arguments must already be set on `cmd`. A non-zero exit is
/// not an error here; the caller classifies exit codes. Output beyond
/// [`MAX_OUTPUT_BYTES`] per stream is discarded, never left unread.
pub async fn run_command(cmd: &mut Command, input: CommandInput) -> Result<CommandOutput, CommandError> {
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd.envs(input.env_vars.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    if let Some(dir) = &input.working_directory {
        cmd.current_dir(dir);
    }

    let start = Instant::now();
    let mut child = cmd.spawn()?;

    let stdout_task = tokio::spawn(capture(child.stdout.take()));
    let stderr_task = tokio::spawn(capture(child.stderr.take()));

    if let Some(mut stdin) = child.stdin.take() {
        let payload = serde_json::to_vec(&input.data).unwrap_or_default();
        // The tool may exit without reading its context.
        let _ = stdin.write_all(&payload).await;
    }

    let status = match tokio::time::timeout(input.timeout, child.wait()).await {
        Ok(status) => status?,
        Err(_elapsed) => {
            return Err(CommandError::Timeout {
                elapsed_ms: start.elapsed().as_millis() as u64,
            })
        }
    };
    let duration_ms = start.elapsed().as_millis() as u64;

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();
    let stdout_text = stdout.text();

    Ok(CommandOutput {
        parsed_output: if stdout.truncated {
            None
        } else {
            serde_json::from_str(stdout_text.trim()).ok()
        },
        stdout: stdout_text,
        stderr: stderr.text(),
        exit_code: status.code().unwrap_or(-1),
        duration_ms,
        truncated: stdout.truncated || stderr.truncated,
    })
}

/// Keep the first [`MAX_OUTPUT_BYTES`] of a stream and drain the rest, so a
/// verbose child never blocks on a full pipe or dies on a closed one.
async fn capture<R: AsyncRead + Unpin>(stream: Option<R>) -> Captured {
    let Some(mut reader) = stream else {
        return Captured::default();
    };
    let mut captured = Captured::default();
    let _ = (&mut reader)
        .take(MAX_OUTPUT_BYTES as u64)
        .read_to_end(&mut captured.bytes)
        .await;
    if captured.bytes.len() >= MAX_OUTPUT_BYTES {
        let discarded = tokio::io::copy(&mut reader, &mut tokio::io::sink())
            .await
            .unwrap_or_default();
        captured.truncated = discarded > 0;
    }
    captured
}
