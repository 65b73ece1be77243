//! Agent execution service.
//!
//! [`AgentService`] is the seam the executor calls once per attempt.
//! [`ClaudeCli`] implements it by running the Claude CLI headless
//! (`-p` with JSON output) inside the workspace.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;

use crate::config::DEFAULT_AGENT_TIMEOUT_SECS;
use crate::core::task::TaskId;
use crate::{Error, Result};

/// One attempt's input.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub task_id: TaskId,
    pub worker: String,
    pub system_prompt: String,
    pub prompt: String,
    /// MCP server configuration forwarded verbatim, if any.
    pub mcp_servers: Option<serde_json::Value>,
}

/// What the agent reported for one attempt.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentResult {
    pub success: bool,
    pub summary: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

impl AgentResult {
    pub fn succeeded(summary: impl Into<String>) -> Self {
        Self {
            success: true,
            summary: summary.into(),
            ..Self::default()
        }
    }

    pub fn failed(summary: impl Into<String>) -> Self {
        Self {
            success: false,
            summary: summary.into(),
            ..Self::default()
        }
    }

    pub fn with_usage(mut self, input_tokens: u64, output_tokens: u64, cost_usd: f64) -> Self {
        self.input_tokens = input_tokens;
        self.output_tokens = output_tokens;
        self.cost_usd = cost_usd;
        self
    }

    pub fn has_usage(&self) -> bool {
        self.input_tokens > 0 || self.output_tokens > 0 || self.cost_usd > 0.0
    }
}

/// Executes one attempt of a task.
///
/// Returning `Ok` with `success == false` and returning `Err` are treated
/// the same by the retry loop.
#[async_trait]
pub trait AgentService: Send + Sync {
    async fn execute(&self, request: AgentRequest) -> Result<AgentResult>;
}

#[derive(Debug, Default, Deserialize)]
struct RawUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct RawClaudeResponse {
    subtype: Option<String>,
    #[serde(default)]
    is_error: bool,
    result: Option<String>,
    #[serde(default)]
    error: Option<String>,
    total_cost_usd: Option<f64>,
    #[serde(default)]
    usage: Option<RawUsage>,
}

/// Claude CLI running headless in a workspace.
#[derive(Debug, Clone)]
pub struct ClaudeCli {
    binary: PathBuf,
    workspace: PathBuf,
    timeout: Duration,
}

impl ClaudeCli {
    /// Locate `command` on `PATH`.
    pub fn new(command: &str, workspace: &Path) -> Result<Self> {
        let binary =
            which::which(command).map_err(|_| Error::BinaryNotFound(command.to_string()))?;
        Ok(Self::with_binary(binary, workspace))
    }

    pub fn with_binary(binary: PathBuf, workspace: &Path) -> Self {
        Self {
            binary,
            workspace: workspace.to_path_buf(),
            timeout: Duration::from_secs(DEFAULT_AGENT_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    fn command(&self, request: &AgentRequest) -> Result<Command> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-p")
            .arg(&request.prompt)
            .arg("--output-format")
            .arg("json")
            .arg("--append-system-prompt")
            .arg(&request.system_prompt)
            .current_dir(&self.workspace)
            .kill_on_drop(true);
        if let Some(ref servers) = request.mcp_servers {
            cmd.arg("--mcp-config").arg(serde_json::to_string(servers)?);
        }
        Ok(cmd)
    }

    /// Parse the CLI's JSON result object.
    pub fn parse_json_response(json_str: &str) -> Result<AgentResult> {
        let raw: RawClaudeResponse = serde_json::from_str(json_str.trim())?;
        let failed = raw.is_error
            || matches!(raw.subtype.as_deref(), Some(s) if s != "success")
            || (raw.result.is_none() && raw.error.is_some());

        let summary = if failed {
            raw.error
                .or(raw.result)
                .unwrap_or_else(|| format!("agent reported {}", raw.subtype.as_deref().unwrap_or("an error")))
        } else {
            raw.result.unwrap_or_default()
        };
        let usage = raw.usage.unwrap_or_default();

        Ok(AgentResult {
            success: !failed,
            summary,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cost_usd: raw.total_cost_usd.unwrap_or(0.0),
        })
    }
}

#[async_trait]
impl AgentService for ClaudeCli {
    async fn execute(&self, request: AgentRequest) -> Result<AgentResult> {
        tracing::debug!(task_id = %request.task_id, worker = %request.worker, "ClaudeCli::execute");
        tracing::trace!(prompt = %request.prompt, "agent prompt");
        let output = tokio::time::timeout(self.timeout, self.command(&request)?.output())
            .await
            .map_err(|_| Error::Timeout(self.timeout))?
            .map_err(Error::Io)?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if let Ok(result) = Self::parse_json_response(&stdout) {
            return Ok(result);
        }

        if !output.status.success() {
            let message = if stderr.trim().is_empty() {
                format!(
                    "agent exited with code {}",
                    output.status.code().unwrap_or(-1)
                )
            } else {
                stderr.trim().to_string()
            };
            return Ok(AgentResult::failed(message));
        }

        Ok(AgentResult::succeeded(stdout.trim()))
    }
}
