//! Durable run state: the `OrchestrationRun`/`WPExecution` records and the
//! atomic JSON store that persists them under `.kittify/`.
//!
//! Every mutation goes through `OrchestrationRun`'s transition methods, which
//! enforce the state-transition rules before returning successfully; a
//! caller that gets `Ok(())` back knows the in-memory record is still valid
//! to persist. Persistence itself is the `StateStore`'s job: back up, write
//! to a temp file in the same directory, then rename over the target so a
//! concurrent reader never observes a partial file.

use crate::errors::StateError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WpStatus {
    Pending,
    Ready,
    Implementation,
    Review,
    Completed,
    Failed,
}

impl WpStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WpStatus::Completed | WpStatus::Failed)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseExecution {
    pub agent_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WPExecution {
    pub wp_id: String,
    pub status: WpStatus,
    pub implementation: PhaseExecution,
    pub review: PhaseExecution,
    pub log_file: Option<PathBuf>,
    pub worktree_path: Option<PathBuf>,
    pub last_error: Option<String>,
    /// Which phase was running when this WP last failed, if it has. Drives
    /// the escalation panel's "failing phase" line.
    #[serde(default)]
    pub failing_phase: Option<String>,
    /// Dependencies beyond the one the worktree was branched from; the spec's
    /// multi-parent open question resolves these as needing manual
    /// integration rather than an automatic merge.
    #[serde(default)]
    pub unmerged_dependencies: Vec<String>,
    #[serde(default)]
    pub fallback_agents_tried: Vec<String>,

    /// Fields present on disk but not modeled here are preserved verbatim so
    /// that a newer orchestrator version's extra keys round-trip through an
    /// older one untouched.
    #[serde(flatten)]
    pub unknown_fields: serde_json::Map<String, serde_json::Value>,
}

impl WPExecution {
    pub fn pending(wp_id: &str) -> Self {
        WPExecution {
            wp_id: wp_id.to_string(),
            status: WpStatus::Pending,
            implementation: PhaseExecution::default(),
            review: PhaseExecution::default(),
            log_file: None,
            worktree_path: None,
            last_error: None,
            failing_phase: None,
            unmerged_dependencies: Vec::new(),
            fallback_agents_tried: Vec::new(),
            unknown_fields: serde_json::Map::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationRun {
    pub run_id: String,
    pub feature_slug: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub config_hash: String,
    pub concurrency_limit: usize,
    pub wps_total: usize,
    pub wps_completed: usize,
    pub wps_failed: usize,
    pub parallel_peak: usize,
    pub total_agent_invocations: u64,
    pub work_packages: HashMap<String, WPExecution>,

    #[serde(flatten)]
    pub unknown_fields: serde_json::Map<String, serde_json::Value>,
}

impl OrchestrationRun {
    pub fn new(feature_slug: &str, config_hash: String, concurrency_limit: usize, wp_ids: &[String]) -> Self {
        let work_packages = wp_ids
            .iter()
            .map(|id| (id.clone(), WPExecution::pending(id)))
            .collect();
        OrchestrationRun {
            run_id: uuid::Uuid::new_v4().to_string(),
            feature_slug: feature_slug.to_string(),
            started_at: Utc::now(),
            completed_at: None,
            status: RunStatus::Pending,
            config_hash,
            concurrency_limit,
            wps_total: wp_ids.len(),
            wps_completed: 0,
            wps_failed: 0,
            parallel_peak: 0,
            total_agent_invocations: 0,
            work_packages,
            unknown_fields: serde_json::Map::new(),
        }
    }

    /// `wps_completed + wps_failed + non-terminal == wps_total` must always hold.
    pub fn check_invariants(&self) -> Result<(), StateError> {
        let non_terminal = self
            .work_packages
            .values()
            .filter(|wp| !wp.status.is_terminal())
            .count();
        if self.wps_completed + self.wps_failed + non_terminal != self.wps_total {
            return Err(StateError::InvalidTransition(format!(
                "wps_completed ({}) + wps_failed ({}) + non_terminal ({}) != wps_total ({})",
                self.wps_completed, self.wps_failed, non_terminal, self.wps_total
            )));
        }
        Ok(())
    }

    fn wp_mut(&mut self, wp_id: &str) -> Result<&mut WPExecution, StateError> {
        self.work_packages
            .get_mut(wp_id)
            .ok_or_else(|| StateError::InvalidTransition(format!("unknown work package '{wp_id}'")))
    }

    pub fn mark_ready(&mut self, wp_id: &str) -> Result<(), StateError> {
        let wp = self.wp_mut(wp_id)?;
        if wp.status != WpStatus::Pending {
            return Err(StateError::InvalidTransition(format!(
                "'{wp_id}' cannot move to ready from {:?}",
                wp.status
            )));
        }
        wp.status = WpStatus::Ready;
        Ok(())
    }

    pub fn mark_implementation_started(&mut self, wp_id: &str, agent_id: &str) -> Result<(), StateError> {
        let wp = self.wp_mut(wp_id)?;
        wp.status = WpStatus::Implementation;
        wp.implementation.agent_id = Some(agent_id.to_string());
        wp.implementation.started_at = Some(Utc::now());
        Ok(())
    }

    pub fn mark_implementation_completed(&mut self, wp_id: &str, exit_code: i32) -> Result<(), StateError> {
        let wp = self.wp_mut(wp_id)?;
        if wp.implementation.started_at.is_none() {
            return Err(StateError::InvalidTransition(format!(
                "'{wp_id}' implementation.completed_at set before started_at"
            )));
        }
        wp.implementation.completed_at = Some(Utc::now());
        wp.implementation.exit_code = Some(exit_code);
        Ok(())
    }

    pub fn mark_review_started(&mut self, wp_id: &str, agent_id: &str) -> Result<(), StateError> {
        let wp = self.wp_mut(wp_id)?;
        if wp.implementation.completed_at.is_none() {
            return Err(StateError::InvalidTransition(format!(
                "'{wp_id}' review started before implementation completed"
            )));
        }
        wp.status = WpStatus::Review;
        wp.review.agent_id = Some(agent_id.to_string());
        wp.review.started_at = Some(Utc::now());
        Ok(())
    }

    pub fn mark_review_completed(&mut self, wp_id: &str, exit_code: i32) -> Result<(), StateError> {
        let wp = self.wp_mut(wp_id)?;
        wp.review.completed_at = Some(Utc::now());
        wp.review.exit_code = Some(exit_code);
        Ok(())
    }

    /// `status = completed` requires `review.completed_at` to be set, unless
    /// `single_agent_review` marks this WP as reviewed by its implementer.
    pub fn mark_completed(&mut self, wp_id: &str, single_agent_review: bool) -> Result<(), StateError> {
        let wp = self.wp_mut(wp_id)?;
        let ok = wp.review.completed_at.is_some()
            || (single_agent_review && wp.implementation.completed_at.is_some());
        if !ok {
            return Err(StateError::InvalidTransition(format!(
                "'{wp_id}' cannot complete without a completed review"
            )));
        }
        wp.status = WpStatus::Completed;
        self.wps_completed += 1;
        Ok(())
    }

    pub fn mark_failed(&mut self, wp_id: &str, last_error: Option<String>) -> Result<(), StateError> {
        let wp = self.wp_mut(wp_id)?;
        if wp.status.is_terminal() {
            return Err(StateError::InvalidTransition(format!(
                "'{wp_id}' is already terminal ({:?})",
                wp.status
            )));
        }
        wp.status = WpStatus::Failed;
        wp.last_error = last_error;
        self.wps_failed += 1;
        Ok(())
    }

    pub fn record_fallback_attempt(&mut self, wp_id: &str, agent_id: &str) -> Result<(), StateError> {
        let wp = self.wp_mut(wp_id)?;
        wp.fallback_agents_tried.push(agent_id.to_string());
        Ok(())
    }

    pub fn bump_parallel_peak(&mut self, in_flight: usize) {
        self.parallel_peak = self.parallel_peak.max(in_flight);
    }

    pub fn all_terminal(&self) -> bool {
        self.work_packages.values().all(|wp| wp.status.is_terminal())
    }
}

/// Single-writer atomic persistence for `OrchestrationRun`, rooted at
/// `<repo>/.kittify/`.
#[derive(Clone)]
pub struct StateStore {
    state_path: PathBuf,
    backup_path: PathBuf,
}

impl StateStore {
    pub fn new(repo_root: &Path) -> Self {
        let dir = repo_root.join(".kittify");
        StateStore {
            state_path: dir.join("orchestration-state.json"),
            backup_path: dir.join("orchestration-state.json.bak"),
        }
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    pub fn load(&self) -> Result<Option<OrchestrationRun>, StateError> {
        if !self.state_path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.state_path).map_err(|source| StateError::ReadFailed {
            path: self.state_path.clone(),
            source,
        })?;
        let run: OrchestrationRun = serde_json::from_str(&content).map_err(|e| StateError::Corrupt {
            path: self.state_path.clone(),
            backup: self.backup_path.clone(),
            reason: e.to_string(),
        })?;
        run.check_invariants().map_err(|e| StateError::Corrupt {
            path: self.state_path.clone(),
            backup: self.backup_path.clone(),
            reason: e.to_string(),
        })?;
        Ok(Some(run))
    }

    pub fn has_active(&self) -> Result<bool, StateError> {
        Ok(self
            .load()?
            .map(|run| matches!(run.status, RunStatus::Running | RunStatus::Paused))
            .unwrap_or(false))
    }

    /// Serializes and writes atomically: backup, write-temp, rename-over-target.
    /// On any failure after the temp file is written, it is removed rather
    /// than left beside the target.
    pub fn save(&self, run: &OrchestrationRun) -> Result<(), StateError> {
        run.check_invariants()?;

        if let Some(parent) = self.state_path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StateError::WriteFailed {
                path: self.state_path.clone(),
                source,
            })?;
        }

        if self.state_path.exists() {
            std::fs::copy(&self.state_path, &self.backup_path).map_err(|source| StateError::WriteFailed {
                path: self.backup_path.clone(),
                source,
            })?;
        }

        let serialized = serde_json::to_string_pretty(run).expect("OrchestrationRun is always serializable");

        let temp_path = self.state_path.with_extension("json.tmp");
        let write_result = std::fs::write(&temp_path, &serialized);
        if let Err(source) = write_result {
            let _ = std::fs::remove_file(&temp_path);
            return Err(StateError::WriteFailed {
                path: temp_path,
                source,
            });
        }

        if let Err(source) = std::fs::rename(&temp_path, &self.state_path) {
            let _ = std::fs::remove_file(&temp_path);
            return Err(StateError::WriteFailed {
                path: self.state_path.clone(),
                source,
            });
        }

        Ok(())
    }

    pub fn clear(&self) -> Result<(), StateError> {
        if self.state_path.exists() {
            std::fs::remove_file(&self.state_path).map_err(|source| StateError::WriteFailed {
                path: self.state_path.clone(),
                source,
            })?;
        }
        Ok(())
    }
}
