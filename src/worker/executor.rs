use std::collections::VecDeque;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use uuid::Uuid;

/// Bytes of stderr kept for the error text. Earlier output is discarded as it streams.
pub const STDERR_TAIL_BYTES: usize = 4096;

/// Result of running one job command.
#[derive(Debug)]
pub struct ExecutionResult {
    pub job_id: Uuid,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub duration: Duration,
}

/// Runs job commands through the platform shell.
///
/// Success means the shell exited with status 0. Anything else, including a
/// shell that could not be spawned or a process killed by a signal, is a
/// failure. Stdout goes to the null device; only the last
/// [`STDERR_TAIL_BYTES`] of stderr are held in memory.
#[derive(Debug, Clone)]
pub struct JobExecutor {
    shell: String,
    flag: String,
}

impl Default for JobExecutor {
    fn default() -> Self {
        if cfg!(windows) {
            Self::with_shell("cmd", "/C")
        } else {
            Self::with_shell("sh", "-c")
        }
    }
}

impl JobExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shell(shell: impl Into<String>, flag: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            flag: flag.into(),
        }
    }

    pub async fn execute(&self, job_id: Uuid, command: &str) -> ExecutionResult {
        tracing::info!(job_id = %job_id, command, "Executing job");

        let started = Instant::now();
        let result = self.run(command).await;

        Self::process_output(job_id, result, started.elapsed())
    }

    async fn run(&self, command: &str) -> std::io::Result<(ExitStatus, Vec<u8>)> {
        let mut child = Command::new(&self.shell)
            .arg(&self.flag)
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stderr = match child.stderr.take() {
            Some(pipe) => read_tail(pipe, STDERR_TAIL_BYTES).await?,
            None => Vec::new(),
        };
        let status = child.wait().await?;

        Ok((status, stderr))
    }

    fn process_output(
        job_id: Uuid,
        result: std::io::Result<(ExitStatus, Vec<u8>)>,
        duration: Duration,
    ) -> ExecutionResult {
        match result {
            Ok((status, stderr)) => {
                let stderr = String::from_utf8_lossy(&stderr);
                let exit_code = status.code();
                let success = status.success();

                let error = (!success).then(|| {
                    if stderr.trim().is_empty() {
                        match exit_code {
                            Some(code) => format!("exit code {}", code),
                            None => "terminated by signal".to_string(),
                        }
                    } else {
                        stderr.trim().to_string()
                    }
                });

                tracing::debug!(
                    job_id = %job_id,
                    success,
                    exit_code = ?exit_code,
                    elapsed_ms = duration.as_millis() as u64,
                    "Command finished"
                );

                ExecutionResult {
                    job_id,
                    success,
                    exit_code,
                    error,
                    duration,
                }
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Failed to run command");
                ExecutionResult {
                    job_id,
                    success: false,
                    exit_code: None,
                    error: Some(e.to_string()),
                    duration,
                }
            }
        }
    }
}

/// Drain `reader` to EOF, keeping at most the last `limit` bytes.
async fn read_tail<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> std::io::Result<Vec<u8>> {
    let mut tail = VecDeque::with_capacity(limit.min(8192));
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let chunk = &buf[n.saturating_sub(limit)..n];
        let overflow = (tail.len() + chunk.len()).saturating_sub(limit);
        tail.drain(..overflow);
        tail.extend(chunk);
    }
    Ok(tail.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_tail_keeps_only_the_end() {
        let input: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let tail = read_tail(&input[..], 100).await.unwrap();
        assert_eq!(tail, input[input.len() - 100..]);

        let short = read_tail(&b"abc"[..], 100).await.unwrap();
        assert_eq!(short, b"abc");
    }
}
