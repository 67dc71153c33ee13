//! Agent Runtime Adapter (spec §4.5): thin wrapper around the external
//! agent runtime subprocess.
//!
//! Generalizes the donor's `orchestrator/runner.rs` `ClaudeRunner`:
//! spawn via `tokio::process::Command`, write the prompt to stdin,
//! read stdout line-by-line, and track a last-activity timestamp so an
//! idle gap longer than the configured timeout aborts the call. The
//! donor ticks a UI spinner every 10s during the call; here the same
//! interval also re-checks the idle deadline.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::errors::AgentError;
use crate::stream::{parse_stream_line, AgentEvent};

#[derive(Debug, Clone)]
pub struct AgentCall {
    pub prompt: String,
    pub cwd: std::path::PathBuf,
    pub allowed_tools: Vec<String>,
    pub max_turns: u32,
    pub model: String,
}

pub struct AgentCallResult {
    pub output: String,
    pub cost_usd: f64,
    pub success: bool,
}

pub struct AgentRuntime {
    pub agent_cmd: String,
    pub idle_timeout: Duration,
}

impl AgentRuntime {
    pub fn new(agent_cmd: impl Into<String>, idle_timeout: Duration) -> Self {
        AgentRuntime { agent_cmd: agent_cmd.into(), idle_timeout }
    }

    /// Runs one agent call, forwarding normalized events to `on_event`
    /// as they arrive. Returns the accumulated text output (used for
    /// completion-marker detection) and the final cost.
    pub async fn run(
        &self,
        call: &AgentCall,
        mut on_event: impl FnMut(AgentEvent) + Send,
    ) -> Result<AgentCallResult, AgentError> {
        let mut cmd = Command::new(&self.agent_cmd);
        cmd.current_dir(&call.cwd)
            .arg("--print")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg("--max-turns")
            .arg(call.max_turns.to_string())
            .arg("--model")
            .arg(&call.model)
            .arg("--allowed-tools")
            .arg(call.allowed_tools.join(","))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        let mut child = cmd.spawn().map_err(AgentError::SpawnFailed)?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(call.prompt.as_bytes()).await.map_err(AgentError::PromptWriteFailed)?;
            stdin.shutdown().await.map_err(AgentError::PromptWriteFailed)?;
        }

        let stdout = child.stdout.take().expect("piped stdout");
        let mut lines = BufReader::new(stdout).lines();

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let reader_task = tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(line).is_err() {
                    break;
                }
            }
        });

        let mut output = String::new();
        let mut cost_usd = 0.0;
        let mut success = false;
        let mut last_activity = Instant::now();

        loop {
            tokio::select! {
                maybe_line = rx.recv() => {
                    match maybe_line {
                        Some(line) => {
                            last_activity = Instant::now();
                            output.push_str(&line);
                            output.push('\n');
                            if let Some(event) = parse_stream_line(&line) {
                                if let AgentEvent::Final { cost_usd: c, success: s } = &event {
                                    cost_usd = *c;
                                    success = *s;
                                }
                                on_event(event);
                            }
                        }
                        None => break,
                    }
                }
                _ = tokio::time::sleep(Duration::from_secs(30)) => {
                    if last_activity.elapsed() >= self.idle_timeout {
                        let _ = child.start_kill();
                        reader_task.abort();
                        return Err(AgentError::IdleTimeout { seconds: self.idle_timeout.as_secs() });
                    }
                }
            }
        }

        let status = child.wait().await.map_err(AgentError::SpawnFailed)?;
        if !status.success() && !success {
            return Err(AgentError::NonZeroExit(status.code().unwrap_or(-1)));
        }

        Ok(AgentCallResult { output, cost_usd, success })
    }
}

/// True if the target directory at `path` is empty save for ignorable
/// entries. Used by the analyze phase to decide whether to synthesize
/// a greenfield analysis instead of invoking the agent (spec §4.2.1).
pub fn is_empty_project(path: &Path) -> bool {
    let Ok(entries) = std::fs::read_dir(path) else { return true };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with('.') || name.ends_with(".md") {
            continue;
        }
        return false;
    }
    true
}
