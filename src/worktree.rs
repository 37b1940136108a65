//! Thin wrapper over the external VCS worktree manager. The orchestrator
//! never touches git directly: it shells out to `implement <wp_id> [--base
//! <wp_id>]` and trusts the external tool's idempotency contract.

use crate::errors::MonitorError;
use std::path::Path;
use std::process::Stdio;

pub struct WorktreeManager {
    command: &'static str,
}

impl Default for WorktreeManager {
    fn default() -> Self {
        WorktreeManager { command: "implement" }
    }
}

/// The result of selecting a dependency to branch from, plus the
/// dependencies that did not make the cut and may need manual integration.
pub struct BaseSelection {
    pub base: Option<String>,
    pub unmerged: Vec<String>,
}

/// Zero dependencies pass no `--base`; one dependency passes that one;
/// multiple dependencies pass the lexicographically-first, recording the
/// rest as requiring manual integration.
pub fn select_base(dependencies: &[String]) -> BaseSelection {
    if dependencies.is_empty() {
        return BaseSelection {
            base: None,
            unmerged: Vec::new(),
        };
    }
    let mut sorted = dependencies.to_vec();
    sorted.sort();
    let base = sorted.remove(0);
    BaseSelection {
        base: Some(base),
        unmerged: sorted,
    }
}

impl WorktreeManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn ensure(&self, repo_root: &Path, wp_id: &str, base: Option<&str>) -> Result<(), MonitorError> {
        let mut command = tokio::process::Command::new(self.command);
        command
            .arg(wp_id)
            .current_dir(repo_root)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        if let Some(base) = base {
            command.arg("--base").arg(base);
        }

        let output = command.output().await.map_err(|source| MonitorError::WorktreeFailed {
            wp_id: wp_id.to_string(),
            message: source.to_string(),
        })?;

        if !output.status.success() {
            return Err(MonitorError::WorktreeFailed {
                wp_id: wp_id.to_string(),
                message: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(())
    }
}
