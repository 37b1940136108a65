//! The AgentInvoker registry: one value per supported coding-agent CLI,
//! each carrying its own argv conventions and output-classification
//! strategy. Agents are modeled as a data-driven struct rather than one
//! type per agent — the registry is a mapping from identifier to value, as
//! the flag conventions differ only in which flags exist, not in control
//! flow.

use crate::config::Role;
use crate::util::extract_json_object;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Reserved exit code meaning "killed after exceeding its timeout". Agents
/// whose own CLI wrapper already uses this convention (the Cursor timeout
/// wrapper exits 124) are classified as a timeout even when the executor's
/// own timer never fired.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvocationResult {
    pub success: bool,
    pub exit_code: i32,
    pub files_modified: Option<Vec<String>>,
    pub commits_made: Option<u32>,
    pub errors: Option<Vec<String>>,
    pub warnings: Option<Vec<String>>,
    #[serde(skip)]
    pub stdout: String,
    #[serde(skip)]
    pub stderr: String,
    pub duration_seconds: f64,
}

impl InvocationResult {
    pub fn is_timeout(&self) -> bool {
        self.exit_code == TIMEOUT_EXIT_CODE
    }
}

/// Optional JSON payload an agent may emit on its last stdout line.
#[derive(Debug, Deserialize)]
struct StructuredOutput {
    #[serde(default)]
    files_modified: Vec<String>,
    #[serde(default)]
    commits_made: u32,
    #[serde(default)]
    errors: Vec<String>,
    #[serde(default)]
    warnings: Vec<String>,
}

/// An agent CLI's argv and output conventions.
#[derive(Debug, Clone)]
pub struct AgentInvoker {
    pub agent_id: &'static str,
    pub command: &'static str,
    pub uses_stdin: bool,
    pub headless_flag: Option<&'static str>,
    pub json_output_flag: Option<&'static str>,
    pub autonomous_flag: Option<&'static str>,
    /// The Cursor special case: its CLI is prone to hanging, so its argv is
    /// prefixed with a platform timeout wrapper.
    pub timeout_wrapped: bool,
}

impl AgentInvoker {
    pub fn build_command(&self, role: Role, working_dir: &Path, timeout_seconds: u64) -> Vec<String> {
        let mut argv = Vec::new();

        if self.timeout_wrapped {
            argv.push("timeout".to_string());
            argv.push(timeout_seconds.to_string());
        }

        argv.push(self.command.to_string());

        if let Some(flag) = self.headless_flag {
            argv.push(flag.to_string());
        }
        if let Some(flag) = self.json_output_flag {
            argv.push(flag.to_string());
        }
        if let Some(flag) = self.autonomous_flag {
            argv.push(flag.to_string());
        }

        argv.push("--role".to_string());
        argv.push(role.as_str().to_string());
        argv.push("--cwd".to_string());
        argv.push(working_dir.display().to_string());

        argv
    }

    /// Classifies a completed invocation. Robust to JSON-lines output
    /// (the last parseable JSON object on stdout wins) and to agents that
    /// emit only unstructured text plus an exit code.
    pub fn parse_output(&self, stdout: &str, stderr: &str, exit_code: i32, duration: Duration) -> InvocationResult {
        let structured = stdout
            .lines()
            .rev()
            .find_map(|line| extract_json_object(line).and_then(|obj| serde_json::from_str::<StructuredOutput>(&obj).ok()));

        let fatal_in_output = structured
            .as_ref()
            .map(|s| !s.errors.is_empty())
            .unwrap_or(false);

        let success = exit_code == 0 && !fatal_in_output;

        InvocationResult {
            success,
            exit_code,
            files_modified: structured.as_ref().map(|s| s.files_modified.clone()),
            commits_made: structured.as_ref().map(|s| s.commits_made),
            errors: structured.as_ref().map(|s| s.errors.clone()),
            warnings: structured.as_ref().map(|s| s.warnings.clone()),
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            duration_seconds: duration.as_secs_f64(),
        }
    }

    /// Locates `self.command` on `PATH`, the way the rest of the system
    /// locates external collaborator binaries.
    pub fn is_installed(&self) -> bool {
        find_on_path(self.command).is_some()
    }
}

fn find_on_path(command: &str) -> Option<std::path::PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var).find_map(|dir| {
        let candidate = dir.join(command);
        candidate.is_file().then_some(candidate)
    })
}

fn invoker(
    agent_id: &'static str,
    command: &'static str,
    uses_stdin: bool,
    timeout_wrapped: bool,
) -> AgentInvoker {
    AgentInvoker {
        agent_id,
        command,
        uses_stdin,
        headless_flag: Some("--print"),
        json_output_flag: Some("--output-format=json"),
        autonomous_flag: Some("--yes"),
        timeout_wrapped,
    }
}

/// The static registry of every known agent identifier.
pub fn registry() -> Vec<AgentInvoker> {
    vec![
        invoker("claude-code", "claude", true, false),
        invoker("codex", "codex", true, false),
        invoker("copilot", "copilot", true, false),
        invoker("gemini", "gemini", true, false),
        invoker("qwen", "qwen", true, false),
        invoker("opencode", "opencode", true, false),
        invoker("kilocode", "kilocode", true, false),
        invoker("augment", "augment", true, false),
        invoker("cursor", "cursor-agent", true, true),
    ]
}

pub fn get(agent_id: &str) -> Option<AgentInvoker> {
    registry().into_iter().find(|i| i.agent_id == agent_id)
}

/// Agents from the registry that are present on `PATH`, in registry order.
pub fn detect_installed() -> Vec<String> {
    registry()
        .into_iter()
        .filter(|i| i.is_installed())
        .map(|i| i.agent_id.to_string())
        .collect()
}
