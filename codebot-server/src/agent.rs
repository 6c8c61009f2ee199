//! Code-agent collaborator.
//!
//! The agent is an external command. Long runs (editing code) carry no
//! timeout; short text completions (classification, nitpick analysis,
//! description summaries) are bounded by the caller.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, warn};

const BASE_SYSTEM_PROMPT: &str = "You are a senior engineer responding to review feedback on a \
pull request you authored. Follow the project's existing patterns and conventions, run the \
relevant tests before finishing, and complete the task fully.\n\n\
**NEVER add \"🤖 Generated with Claude Code\" or \"Co-Authored-By:\" to commit messages**";

/// Result of one agent session.
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl AgentOutcome {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }

    /// The agent's final reply, when the run succeeded and produced one.
    pub fn response(&self) -> Option<String> {
        if !self.succeeded() {
            return None;
        }
        extract_result(&self.stdout)
    }
}

#[derive(Deserialize)]
struct StreamRecord {
    #[serde(rename = "type")]
    kind: Option<String>,
    result: Option<String>,
}

/// Scan stream-json output for the final `{"type": "result", "result": ...}` record.
pub fn extract_result(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| serde_json::from_str::<StreamRecord>(line).ok())
        .filter(|record| record.kind.as_deref() == Some("result") && record.result.is_some())
        .last()
        .and_then(|record| record.result)
        .filter(|text| !text.trim().is_empty())
}

#[async_trait]
pub trait CodeAgent: Send + Sync {
    /// Run a full editing session inside `workdir`.
    async fn run(
        &self,
        workdir: &Path,
        task_description: &str,
        extra_instructions: &str,
    ) -> Result<AgentOutcome>;

    /// One-shot text completion bounded by `timeout`.
    async fn ask(&self, prompt: &str, timeout: Duration) -> Result<String>;
}

/// Drives the `claude` CLI (or a compatible executable) in headless mode.
pub struct ClaudeCliAgent {
    command: String,
}

impl ClaudeCliAgent {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl CodeAgent for ClaudeCliAgent {
    async fn run(
        &self,
        workdir: &Path,
        task_description: &str,
        extra_instructions: &str,
    ) -> Result<AgentOutcome> {
        let system_prompt = if extra_instructions.is_empty() {
            BASE_SYSTEM_PROMPT.to_string()
        } else {
            format!(
                "{}\n\nAdditional instructions:\n{}",
                BASE_SYSTEM_PROMPT, extra_instructions
            )
        };
        let prompt = format!("Task: {}", task_description);

        info!("Running code agent in {}", workdir.display());

        let output = tokio::process::Command::new(&self.command)
            .args([
                "-p",
                prompt.as_str(),
                "--append-system-prompt",
                system_prompt.as_str(),
                "--output-format",
                "stream-json",
                "--verbose",
                "--dangerously-skip-permissions",
            ])
            .current_dir(workdir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("Failed to spawn {}", self.command))?;

        let outcome = AgentOutcome {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !outcome.succeeded() {
            warn!(
                "Code agent exited with code {}: {}",
                outcome.exit_code,
                outcome.stderr.trim()
            );
        }

        Ok(outcome)
    }

    async fn ask(&self, prompt: &str, timeout: Duration) -> Result<String> {
        let child = tokio::process::Command::new(&self.command)
            .args(["-p", prompt, "--output-format", "text"])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(timeout, child)
            .await
            .with_context(|| format!("{} timed out after {:?}", self.command, timeout))?
            .with_context(|| format!("Failed to spawn {}", self.command))?;

        if !output.status.success() {
            bail!(
                "{} exited with {}: {}",
                self.command,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Slice out the outermost `{ ... }` of a free-text model response.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}
