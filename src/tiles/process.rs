//! Running external command-line tools with a deadline.

use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

/// Lines of stderr kept for diagnostics.
const DIAGNOSTIC_LINES: usize = 20;

/// `ETXTBSY`: the executable is still open for writing somewhere.
const TEXT_FILE_BUSY: i32 = 26;

/// Failure modes of an external tool invocation.
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("{program} was not found; is it installed and on PATH?")]
    NotFound { program: String },

    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} timed out after {}s", elapsed.as_secs_f64())]
    TimedOut { program: String, elapsed: Duration },

    #[error("{program} exited with {status}")]
    Failed {
        program: String,
        status: String,
        diagnostics: String,
    },
}

impl ToolError {
    /// Short status label for error reports.
    pub fn status(&self) -> String {
        match self {
            ToolError::NotFound { .. } => "not found".to_string(),
            ToolError::Spawn { .. } => "spawn failed".to_string(),
            ToolError::TimedOut { elapsed, .. } => {
                format!("timed out after {}s", elapsed.as_secs_f64())
            }
            ToolError::Failed { status, .. } => status.clone(),
        }
    }

    /// Captured diagnostics, or the error text when there are none.
    pub fn diagnostics(&self) -> String {
        match self {
            ToolError::Failed { diagnostics, .. } if !diagnostics.is_empty() => diagnostics.clone(),
            other => other.to_string(),
        }
    }
}

/// Captured output of a successful run.
#[derive(Debug, Default)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Run `program` with `args`, killing it if it outlives `timeout`.
pub async fn run_tool(
    program: &Path,
    args: &[OsString],
    timeout: Duration,
) -> Result<ToolOutput, ToolError> {
    let name = program.display().to_string();
    tracing::debug!("Running {} {:?}", name, args);

    let child = spawn_with_retry(program, args).await.map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            ToolError::NotFound {
                program: name.clone(),
            }
        } else {
            ToolError::Spawn {
                program: name.clone(),
                source,
            }
        }
    })?;

    // Dropping the child on timeout kills it
    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result.map_err(|source| ToolError::Spawn {
            program: name.clone(),
            source,
        })?,
        Err(_) => {
            return Err(ToolError::TimedOut {
                program: name,
                elapsed: timeout,
            })
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    if !output.status.success() {
        let status = match output.status.code() {
            Some(code) => format!("exit status {}", code),
            None => "terminated by signal".to_string(),
        };
        let source = if stderr.trim().is_empty() { &stdout } else { &stderr };
        return Err(ToolError::Failed {
            program: name,
            status,
            diagnostics: tail_lines(source, DIAGNOSTIC_LINES),
        });
    }

    Ok(ToolOutput { stdout, stderr })
}

async fn spawn_with_retry(program: &Path, args: &[OsString]) -> std::io::Result<tokio::process::Child> {
    let mut attempts = 0;
    loop {
        let result = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        match result {
            Err(e) if e.raw_os_error() == Some(TEXT_FILE_BUSY) && attempts < 5 => {
                attempts += 1;
                tokio::time::sleep(Duration::from_millis(20 * attempts)).await;
            }
            other => return other,
        }
    }
}

/// Last `n` non-empty lines of `text`.
fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}
