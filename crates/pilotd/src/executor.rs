//! Agent executor: spawns the coding-agent CLI inside a workspace.
//!
//! The executor is deliberately opaque to the rest of the daemon: it
//! receives an instruction and a working directory and reports a
//! structured result. Deriving the patch artifact from the workspace is
//! the coordinator's job, not the executor's.

use async_trait::async_trait;
use pilot_core::config::ExecutorSection;
use pilot_core::ExecutionResult;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Interval between progress log lines for long executions.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Timeout for draining stdout/stderr after the process exits or is
/// killed. Pipes normally close immediately; this is the upper bound.
const IO_CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum bytes of agent output retained in memory per stream.
const MAX_OUTPUT_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("agent binary not found: {0}")]
    BinaryNotFound(String),
    #[error("agent timed out after {0} seconds")]
    Timeout(u64),
    #[error("agent execution canceled")]
    Canceled,
}

pub type Result<T> = std::result::Result<T, ExecutorError>;

/// One executor invocation.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub workspace_path: PathBuf,
    pub instruction: String,
    /// Guardrails appended to the instruction, one line each.
    pub constraints: Vec<String>,
    /// Continue a prior agent session instead of starting fresh.
    pub resume_session_id: Option<String>,
}

/// External coding-agent collaborator.
///
/// `success=false` in the returned result always fails the owning run;
/// `Err` is reserved for infrastructure problems (spawn, timeout,
/// cancellation).
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn execute(
        &self,
        request: ExecutionRequest,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult>;

    /// Short identifier recorded on runs (e.g. binary name).
    fn kind(&self) -> &str;
}

/// Executor backed by a headless coding-agent CLI.
pub struct CliAgentExecutor {
    bin: PathBuf,
    args: Vec<String>,
    timeout: Duration,
    kind: String,
}

impl CliAgentExecutor {
    pub fn new(cfg: &ExecutorSection) -> Self {
        let kind = cfg
            .bin
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("agent")
            .to_string();
        Self {
            bin: cfg.bin.clone(),
            args: cfg.args.clone(),
            timeout: Duration::from_secs(cfg.timeout_sec),
            kind,
        }
    }

    fn build_prompt(request: &ExecutionRequest) -> String {
        if request.constraints.is_empty() {
            return request.instruction.clone();
        }
        let mut prompt = request.instruction.clone();
        prompt.push_str("\n\nConstraints:\n");
        for constraint in &request.constraints {
            prompt.push_str("- ");
            prompt.push_str(constraint);
            prompt.push('\n');
        }
        prompt
    }
}

#[async_trait]
impl AgentExecutor for CliAgentExecutor {
    async fn execute(
        &self,
        request: ExecutionRequest,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult> {
        let prompt = Self::build_prompt(&request);

        let mut cmd = Command::new(&self.bin);
        cmd.args(&self.args);
        if let Some(session) = &request.resume_session_id {
            cmd.arg("--resume").arg(session);
        }
        cmd.arg(&prompt)
            .current_dir(&request.workspace_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so a kill reaches whatever the agent
        // spawned underneath itself.
        #[cfg(unix)]
        cmd.process_group(0);

        debug!(
            bin = %self.bin.display(),
            workspace = %request.workspace_path.display(),
            resume = request.resume_session_id.is_some(),
            "spawning agent process"
        );

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ExecutorError::BinaryNotFound(self.bin.display().to_string())
            } else {
                ExecutorError::Io(e)
            }
        })?;

        let stdout_task = child
            .stdout
            .take()
            .map(|s| tokio::spawn(read_bounded(s, MAX_OUTPUT_BYTES)));
        let stderr_task = child
            .stderr
            .take()
            .map(|s| tokio::spawn(read_bounded(s, MAX_OUTPUT_BYTES)));

        let started = Instant::now();
        let outcome = loop {
            let elapsed = started.elapsed();
            if !self.timeout.is_zero() && elapsed >= self.timeout {
                warn!(elapsed_sec = elapsed.as_secs(), "agent timed out, killing");
                kill_quietly(&mut child).await;
                break ProcessOutcome::TimedOut;
            }

            let remaining = if self.timeout.is_zero() {
                Duration::MAX
            } else {
                self.timeout.saturating_sub(elapsed)
            };

            tokio::select! {
                result = child.wait() => break ProcessOutcome::Exited(result?),
                () = cancel.cancelled() => {
                    info!("cancellation requested, killing agent");
                    kill_quietly(&mut child).await;
                    break ProcessOutcome::Canceled;
                }
                () = tokio::time::sleep(HEARTBEAT_INTERVAL.min(remaining)) => {
                    info!(
                        elapsed_sec = started.elapsed().as_secs(),
                        workspace = %request.workspace_path.display(),
                        "agent still running"
                    );
                }
            }
        };

        let (stdout, stderr) =
            tokio::join!(drain_capture(stdout_task), drain_capture(stderr_task));
        let stdout_text = String::from_utf8_lossy(&stdout).to_string();
        let stderr_text = String::from_utf8_lossy(&stderr).to_string();

        let logs = if stderr_text.is_empty() {
            stdout_text.clone()
        } else {
            format!("{stdout_text}\n--- STDERR ---\n{stderr_text}")
        };

        match outcome {
            ProcessOutcome::TimedOut => Err(ExecutorError::Timeout(self.timeout.as_secs())),
            ProcessOutcome::Canceled => Err(ExecutorError::Canceled),
            ProcessOutcome::Exited(status) => {
                let success = status.success();
                let session_id = parse_session_id(&stdout_text);
                let error = if success {
                    None
                } else {
                    Some(format!(
                        "agent exited with code {}: {}",
                        status.code().unwrap_or(-1),
                        tail_lines(&logs, 20)
                    ))
                };
                info!(
                    success,
                    duration_ms = started.elapsed().as_millis() as u64,
                    output_bytes = logs.len(),
                    "agent finished"
                );
                Ok(ExecutionResult {
                    success,
                    patch: None,
                    files_changed: Vec::new(),
                    logs: Some(logs),
                    session_id,
                    error,
                })
            }
        }
    }

    fn kind(&self) -> &str {
        &self.kind
    }
}

enum ProcessOutcome {
    Exited(std::process::ExitStatus),
    TimedOut,
    Canceled,
}

async fn kill_quietly(child: &mut tokio::process::Child) {
    // Kill the group first: descendants holding the output pipes open
    // would otherwise stall capture until its timeout.
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: plain kill(2) syscall; the negative pid addresses the
        // process group the child was spawned into.
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
    if let Err(e) = child.kill().await {
        warn!(error = %e, "failed to kill agent process");
    }
    let _ = child.wait().await;
}

/// Read a stream to completion, keeping at most `limit` bytes.
async fn read_bounded<R>(mut reader: R, limit: usize) -> std::io::Result<Vec<u8>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        if buf.len() < limit {
            let take = n.min(limit - buf.len());
            buf.extend_from_slice(&chunk[..take]);
        }
        // Keep draining past the limit so the child never blocks on a
        // full pipe.
    }
    Ok(buf)
}

async fn drain_capture(
    task: Option<tokio::task::JoinHandle<std::io::Result<Vec<u8>>>>,
) -> Vec<u8> {
    let Some(task) = task else {
        return Vec::new();
    };
    match tokio::time::timeout(IO_CAPTURE_TIMEOUT, task).await {
        Ok(Ok(Ok(buf))) => buf,
        Ok(Ok(Err(e))) => {
            warn!(error = %e, "agent output capture failed");
            Vec::new()
        }
        Ok(Err(e)) => {
            warn!(error = %e, "agent output task panicked");
            Vec::new()
        }
        Err(_) => {
            warn!("agent output capture timed out");
            Vec::new()
        }
    }
}

/// Pull a session id out of the CLI's JSON result line, if present.
/// Agent CLIs in headless mode emit a final JSON object; anything
/// unparseable simply yields no session.
fn parse_session_id(stdout: &str) -> Option<String> {
    for line in stdout.lines().rev() {
        let trimmed = line.trim();
        if !trimmed.starts_with('{') {
            continue;
        }
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
            if let Some(id) = value.get("session_id").and_then(|v| v.as_str()) {
                return Some(id.to_string());
            }
        }
    }
    None
}

fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::TempDir;

    fn sh_executor(timeout_sec: u64) -> CliAgentExecutor {
        CliAgentExecutor::new(&ExecutorSection {
            bin: PathBuf::from("sh"),
            args: vec!["-c".to_string()],
            timeout_sec,
        })
    }

    fn request(dir: &Path, instruction: &str) -> ExecutionRequest {
        ExecutionRequest {
            workspace_path: dir.to_path_buf(),
            instruction: instruction.to_string(),
            constraints: Vec::new(),
            resume_session_id: None,
        }
    }

    #[tokio::test]
    async fn successful_run_captures_logs() {
        let dir = TempDir::new().unwrap();
        let exec = sh_executor(30);
        let result = exec
            .execute(request(dir.path(), "echo hello"), CancellationToken::new())
            .await
            .unwrap();

        assert!(result.success);
        assert!(result.error.is_none());
        assert!(result.logs.unwrap().contains("hello"));
    }

    #[tokio::test]
    async fn nonzero_exit_fails_with_log_tail() {
        let dir = TempDir::new().unwrap();
        let exec = sh_executor(30);
        let result = exec
            .execute(
                request(dir.path(), "echo broken >&2; exit 3"),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(!result.success);
        let error = result.error.unwrap();
        assert!(error.contains("code 3"));
        assert!(error.contains("broken"));
    }

    #[tokio::test]
    async fn timeout_kills_the_process() {
        let dir = TempDir::new().unwrap();
        let exec = sh_executor(1);
        let started = Instant::now();
        let result = exec
            .execute(request(dir.path(), "sleep 30"), CancellationToken::new())
            .await;

        assert!(matches!(result, Err(ExecutorError::Timeout(1))));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    /// A background child of the shell inherits the output pipes; if it
    /// survives the kill, capture blocks until its own timeout.
    #[tokio::test]
    async fn timeout_kills_descendants_holding_the_pipes() {
        let dir = TempDir::new().unwrap();
        let exec = sh_executor(1);
        let started = Instant::now();
        let result = exec
            .execute(
                request(dir.path(), "sleep 30 & sleep 30"),
                CancellationToken::new(),
            )
            .await;

        assert!(matches!(result, Err(ExecutorError::Timeout(1))));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn cancellation_kills_the_process() {
        let dir = TempDir::new().unwrap();
        let exec = sh_executor(60);
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let result = exec.execute(request(dir.path(), "sleep 30"), cancel).await;
        assert!(matches!(result, Err(ExecutorError::Canceled)));
    }

    #[tokio::test]
    async fn missing_binary_is_reported() {
        let dir = TempDir::new().unwrap();
        let exec = CliAgentExecutor::new(&ExecutorSection {
            bin: PathBuf::from("definitely-not-a-real-binary"),
            args: Vec::new(),
            timeout_sec: 5,
        });
        let result = exec
            .execute(request(dir.path(), "noop"), CancellationToken::new())
            .await;
        assert!(matches!(result, Err(ExecutorError::BinaryNotFound(_))));
    }

    #[tokio::test]
    async fn session_id_parsed_from_json_output() {
        let dir = TempDir::new().unwrap();
        let exec = sh_executor(30);
        let result = exec
            .execute(
                request(
                    dir.path(),
                    r#"echo '{"result":"done","session_id":"sess-42"}'"#,
                ),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.session_id.as_deref(), Some("sess-42"));
    }

    #[test]
    fn constraints_are_appended_to_the_prompt() {
        let req = ExecutionRequest {
            workspace_path: PathBuf::from("/tmp"),
            instruction: "Fix the bug".to_string(),
            constraints: vec!["Do not touch CI config".to_string()],
            resume_session_id: None,
        };
        let prompt = CliAgentExecutor::build_prompt(&req);
        assert!(prompt.starts_with("Fix the bug"));
        assert!(prompt.contains("- Do not touch CI config"));
    }
}
