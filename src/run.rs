//! Run Lifecycle: the four public entry points (`start`, `status`, `resume`,
//! `abort`) that the CLI front-end wraps directly, with no scheduling logic
//! of their own.

use crate::config::OrchestratorConfig;
use crate::errors::StateError;
use crate::executor::Executor;
use crate::graph::DependencyGraph;
use crate::invoker::detect_installed;
use crate::scheduler::Scheduler;
use crate::state::{OrchestrationRun, RunStatus, StateStore, WpStatus};
use crate::workpackage::load_work_packages;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::info;

pub struct RunSummary {
    pub status: RunStatus,
    pub wps_total: usize,
    pub wps_completed: usize,
    pub wps_failed: usize,
    pub in_flight: Vec<String>,
    pub pending: Vec<String>,
}

pub struct Orchestrator {
    repo_root: PathBuf,
    store: StateStore,
}

impl Orchestrator {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        let repo_root = repo_root.into();
        let store = StateStore::new(&repo_root);
        Orchestrator { repo_root, store }
    }

    fn config_path(&self) -> PathBuf {
        self.repo_root.join(".kittify").join("agents.yaml")
    }

    fn tasks_dir(&self, feature_slug: &str) -> PathBuf {
        self.repo_root.join("specs").join(feature_slug).join("tasks")
    }

    fn load_config(&self) -> anyhow::Result<OrchestratorConfig> {
        let path = self.config_path();
        let (config, warnings) = if path.exists() {
            OrchestratorConfig::load(&path)?
        } else {
            OrchestratorConfig::synthesize(&detect_installed())?
        };
        for warning in warnings {
            tracing::warn!(%warning, "configuration warning");
        }
        Ok(config)
    }

    pub async fn start(&self, feature_slug: &str) -> anyhow::Result<OrchestrationRun> {
        let tasks_dir = self.tasks_dir(feature_slug);
        if !tasks_dir.exists() {
            anyhow::bail!("feature directory not found: {}", tasks_dir.display());
        }
        if self.store.has_active()? {
            anyhow::bail!(StateError::RunAlreadyActive);
        }

        let work_packages = load_work_packages(&tasks_dir)?;
        let graph = DependencyGraph::build(&work_packages)?;
        let config = self.load_config()?;

        for role in [crate::config::Role::Implementation, crate::config::Role::Review] {
            if config.preference_list(role).is_empty() {
                anyhow::bail!("no enabled agent covers required role '{}'", role.as_str());
            }
        }

        let wp_ids: Vec<String> = graph.wp_ids().to_vec();
        let run = OrchestrationRun::new(feature_slug, config.config_hash(), config.global_concurrency(), &wp_ids);
        self.store.save(&run)?;

        info!(feature_slug, wps_total = run.wps_total, "starting orchestration run");

        let executor = Executor::new(self.repo_root.join(".kittify").join("logs"));
        let scheduler = Arc::new(Scheduler::new(
            self.repo_root.clone(),
            feature_slug.to_string(),
            work_packages,
            graph,
            config,
            executor,
        ));
        scheduler.run(run, self.store.clone(), Arc::new(AtomicBool::new(false))).await
    }

    pub fn status(&self) -> anyhow::Result<RunSummary> {
        let run = self.store.load()?.ok_or(StateError::NoActiveRun)?;
        let mut in_flight = Vec::new();
        let mut pending = Vec::new();
        for (id, wp) in &run.work_packages {
            match wp.status {
                WpStatus::Implementation | WpStatus::Review => in_flight.push(id.clone()),
                WpStatus::Pending | WpStatus::Ready => pending.push(id.clone()),
                WpStatus::Completed | WpStatus::Failed => {}
            }
        }
        in_flight.sort();
        pending.sort();
        Ok(RunSummary {
            status: run.status,
            wps_total: run.wps_total,
            wps_completed: run.wps_completed,
            wps_failed: run.wps_failed,
            in_flight,
            pending,
        })
    }

    /// Re-enters the scheduler loop for a paused run. WPs that were mid-phase
    /// when the previous process exited are reset to `pending`: no attempt is
    /// made to recover an in-flight child process across invocations.
    pub async fn resume(&self) -> anyhow::Result<OrchestrationRun> {
        let mut run = self.store.load()?.ok_or(StateError::NoActiveRun)?;
        if run.status != RunStatus::Paused {
            anyhow::bail!(StateError::NotPaused {
                status: format!("{:?}", run.status).to_lowercase(),
            });
        }

        for wp in run.work_packages.values_mut() {
            if !wp.status.is_terminal() {
                wp.status = WpStatus::Pending;
            }
        }

        let feature_slug = run.feature_slug.clone();
        let tasks_dir = self.tasks_dir(&feature_slug);
        let config = self.load_config()?;
        let work_packages = load_work_packages(&tasks_dir)?;
        let graph = DependencyGraph::build(&work_packages)?;

        // Re-verify installed agents still cover both roles: the set of
        // binaries on PATH may have changed since the run was paused, and
        // resuming into a preference list that can no longer schedule
        // anything would just deadlock on the first tick.
        for role in [crate::config::Role::Implementation, crate::config::Role::Review] {
            if config.preference_list(role).is_empty() {
                anyhow::bail!("no enabled agent covers required role '{}'; refusing to resume", role.as_str());
            }
        }

        info!(feature_slug, "resuming orchestration run");

        let executor = Executor::new(self.repo_root.join(".kittify").join("logs"));
        let scheduler = Arc::new(Scheduler::new(
            self.repo_root.clone(),
            feature_slug,
            work_packages,
            graph,
            config,
            executor,
        ));
        scheduler.run(run, self.store.clone(), Arc::new(AtomicBool::new(false))).await
    }

    pub fn abort(&self) -> anyhow::Result<OrchestrationRun> {
        let mut run = self.store.load()?.ok_or(StateError::NoActiveRun)?;
        run.status = RunStatus::Failed;
        run.completed_at = Some(Utc::now());
        self.store.save(&run)?;
        info!(run_id = %run.run_id, "run aborted");
        Ok(run)
    }
}

pub fn repo_root_from_cwd() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

pub fn find_repo_root(start: &Path) -> PathBuf {
    start.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_rejects_missing_feature_directory() {
        let repo = tempfile::tempdir().unwrap();
        let orchestrator = Orchestrator::new(repo.path());
        let err = orchestrator.start("nonexistent-feature").await.unwrap_err();
        assert!(err.to_string().contains("feature directory not found"));
    }

    #[test]
    fn status_errors_when_no_run_exists() {
        let repo = tempfile::tempdir().unwrap();
        let orchestrator = Orchestrator::new(repo.path());
        assert!(orchestrator.status().is_err());
    }

    #[test]
    fn abort_marks_active_run_failed() {
        let repo = tempfile::tempdir().unwrap();
        let orchestrator = Orchestrator::new(repo.path());
        let run = OrchestrationRun::new("f", "hash".to_string(), 4, &["WP01".to_string()]);
        orchestrator.store.save(&run).unwrap();
        let aborted = orchestrator.abort().unwrap();
        assert_eq!(aborted.status, RunStatus::Failed);
    }

    #[test]
    fn resume_rejects_non_paused_run() {
        let repo = tempfile::tempdir().unwrap();
        let orchestrator = Orchestrator::new(repo.path());
        let mut run = OrchestrationRun::new("f", "hash".to_string(), 4, &["WP01".to_string()]);
        run.status = RunStatus::Completed;
        orchestrator.store.save(&run).unwrap();
        let err = tokio_test_block_on(orchestrator.resume());
        assert!(err.is_err());
    }

    fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
    }
}
