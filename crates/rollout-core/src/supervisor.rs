use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::error::{Result, RolloutError};

/// Run state as reported by the process supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Running,
    Starting,
    Stopped,
    Fatal,
    Unknown,
}

impl ProcessState {
    fn parse(word: &str) -> Self {
        match word {
            "RUNNING" => ProcessState::Running,
            "STARTING" | "BACKOFF" => ProcessState::Starting,
            "STOPPED" | "STOPPING" | "EXITED" => ProcessState::Stopped,
            "FATAL" => ProcessState::Fatal,
            _ => ProcessState::Unknown,
        }
    }
}

/// Keeps backend processes alive; the orchestrator only issues commands.
#[async_trait]
pub trait Supervisor: Send + Sync {
    async fn start(&self, program: &str) -> Result<()>;
    async fn stop(&self, program: &str) -> Result<()>;
    async fn restart(&self, program: &str) -> Result<()>;
    async fn status(&self, program: &str) -> Result<ProcessState>;
}

pub struct SupervisorCtl {
    bin: String,
}

impl SupervisorCtl {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    async fn ctl(&self, action: &str, program: &str) -> Result<String> {
        let path =
            which::which(&self.bin).map_err(|_| RolloutError::ToolNotInstalled(self.bin.clone()))?;
        let output = Command::new(path)
            .args([action, program])
            .stdin(Stdio::null())
            .output()
            .await?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        // `status` exits non-zero for stopped programs; its stdout is still valid.
        if output.status.success() || action == "status" {
            return Ok(stdout);
        }
        Err(RolloutError::transient(
            "supervisor",
            format!("{action} {program} failed: {}", stdout.trim()),
        ))
    }
}

#[async_trait]
impl Supervisor for SupervisorCtl {
    async fn start(&self, program: &str) -> Result<()> {
        self.ctl("start", program).await.map(|_| ())
    }

    async fn stop(&self, program: &str) -> Result<()> {
        self.ctl("stop", program).await.map(|_| ())
    }

    async fn restart(&self, program: &str) -> Result<()> {
        tracing::info!(program, "restarting");
        self.ctl("restart", program).await.map(|_| ())
    }

    async fn status(&self, program: &str) -> Result<ProcessState> {
        let out = self.ctl("status", program).await?;
        Ok(parse_status_line(&out))
    }
}

/// Parse `supervisorctl status` output: `<name>  RUNNING  pid 123, uptime …`.
fn parse_status_line(out: &str) -> ProcessState {
    out.lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .map(ProcessState::parse)
        .unwrap_or(ProcessState::Unknown)
}
