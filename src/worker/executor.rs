use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{ChildStdout, Command};
use tokio::time::MissedTickBehavior;

use super::output::{LogChunker, OutputTail};
use crate::config::{SandboxConfig, TimingConfig};
use crate::logsink::{ship_or_warn, LogScope, LogSink, LogType};
use crate::mailbox::SlotStatus;

/// Result of job execution
#[derive(Debug)]
pub struct ExecutionResult {
    pub status: SlotStatus,
    pub exit_code: Option<i32>,
    /// Tail of stdout, followed by `FAILED` and stderr when the job failed.
    pub output: String,
}

/// Runs job scripts under `sh -c`, or inside a Docker container when a
/// sandbox is configured.
///
/// Stdout is streamed to the log sink in chunks while the job runs. The
/// child is killed if the execution future is dropped.
#[derive(Clone)]
pub struct JobExecutor {
    sandbox: Option<SandboxConfig>,
    sink: Arc<dyn LogSink>,
    flush_lines: usize,
    flush_interval: Duration,
    tail_lines: usize,
}

impl JobExecutor {
    pub fn new(sink: Arc<dyn LogSink>, timing: &TimingConfig) -> Self {
        Self {
            sandbox: None,
            sink,
            flush_lines: timing.log_flush_lines,
            flush_interval: timing.log_flush_interval(),
            tail_lines: timing.output_tail_lines,
        }
    }

    pub fn with_sandbox(mut self, sandbox: Option<SandboxConfig>) -> Self {
        self.sandbox = sandbox;
        self
    }

    fn command_for(&self, script: &str) -> Command {
        let Some(sandbox) = &self.sandbox else {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(script);
            return cmd;
        };

        let mut args = vec!["run".to_string(), "--rm".to_string()];

        // Network isolation
        if sandbox.network_disabled {
            args.push("--network=none".to_string());
        }
        if let Some(ref limit) = sandbox.memory_limit {
            args.push(format!("--memory={}", limit));
        }
        if let Some(ref limit) = sandbox.cpu_limit {
            args.push(format!("--cpus={}", limit));
        }

        args.push("--cap-drop=ALL".to_string());
        args.push("--security-opt=no-new-privileges".to_string());
        args.push("--read-only".to_string());

        args.push(sandbox.image.clone());
        args.push("sh".to_string());
        args.push("-c".to_string());
        args.push(script.to_string());

        let mut cmd = Command::new("docker");
        cmd.args(&args);
        cmd
    }

    /// Execute a job script to completion.
    pub async fn execute(&self, scope: &LogScope, script: &str) -> ExecutionResult {
        tracing::info!(job_id = %scope.id, sandboxed = self.sandbox.is_some(), "Executing job");

        let mut child = match self
            .command_for(script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(job_id = %scope.id, error = %e, "Job execution failed");
                return ExecutionResult {
                    status: SlotStatus::Failed,
                    exit_code: None,
                    output: format!("FAILED\n{e}\n"),
                };
            }
        };

        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut bytes = Vec::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_end(&mut bytes).await;
            }
            String::from_utf8_lossy(&bytes).into_owned()
        });

        let mut tail = self.stream_stdout(scope, child.stdout.take()).await;
        let waited = child.wait().await;
        let stderr = stderr_task.await.unwrap_or_default();

        let (status, exit_code) = match waited {
            Ok(exit) if exit.success() => (SlotStatus::Successful, exit.code()),
            Ok(exit) => (SlotStatus::Failed, exit.code()),
            Err(e) => {
                tracing::error!(job_id = %scope.id, error = %e, "Waiting for job failed");
                tail.push(e.to_string());
                (SlotStatus::Failed, None)
            }
        };
        if status == SlotStatus::Failed {
            tail.push("FAILED");
            tail.push_text(&stderr);
        }

        tracing::info!(
            job_id = %scope.id,
            status = %status,
            exit_code = ?exit_code,
            "Job completed"
        );

        ExecutionResult {
            status,
            exit_code,
            output: tail.render(),
        }
    }

    async fn stream_stdout(&self, scope: &LogScope, stdout: Option<ChildStdout>) -> OutputTail {
        let mut tail = OutputTail::new(self.tail_lines);
        let Some(stdout) = stdout else {
            return tail;
        };

        let mut reader = BufReader::new(stdout);
        let mut buf = Vec::new();
        let mut chunker = LogChunker::new(self.flush_lines);
        let mut flush = tokio::time::interval_at(
            tokio::time::Instant::now() + self.flush_interval,
            self.flush_interval,
        );
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                // Bytes of an interrupted read stay in `buf` until the line ends
                read = reader.read_until(b'\n', &mut buf) => match read {
                    Ok(0) if buf.is_empty() => break,
                    Ok(_) => {
                        let line = take_line(&mut buf);
                        tail.push(line.clone());
                        if let Some(chunk) = chunker.push(line) {
                            self.ship_chunk(scope, chunk).await;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(job_id = %scope.id, error = %e, "Stopped reading job stdout");
                        break;
                    }
                },
                _ = flush.tick() => {
                    if let Some(chunk) = chunker.take() {
                        self.ship_chunk(scope, chunk).await;
                    }
                }
            }
        }
        if let Some(chunk) = chunker.take() {
            self.ship_chunk(scope, chunk).await;
        }
        tail
    }

    async fn ship_chunk(&self, scope: &LogScope, lines: Vec<String>) {
        let record = scope.record(LogType::Stdout, serde_json::json!({ "lines": lines }));
        ship_or_warn(self.sink.as_ref(), vec![record]).await;
    }
}

/// Drain one line out of `buf`, without its line ending. Invalid UTF-8 is
/// replaced rather than rejected.
fn take_line(buf: &mut Vec<u8>) -> String {
    let mut end = buf.len();
    if buf[..end].ends_with(b"\n") {
        end -= 1;
    }
    if buf[..end].ends_with(b"\r") {
        end -= 1;
    }
    let line = String::from_utf8_lossy(&buf[..end]).into_owned();
    buf.clear();
    line
}
