//! The core engine: computes the ready set, assigns agents, spawns
//! cooperative per-work-package tasks running implementation then review,
//! and persists the run after every state-level transition.
//!
//! Single-threaded-cooperative in spirit: the only shared mutable state is
//! the run record, guarded by a mutex that every mutation acquires, mutates
//! and persists through before releasing. Parallelism comes entirely from
//! concurrent child processes, not from racing in-memory state.

use crate::config::{OrchestratorConfig, Role};
use crate::errors::MonitorError;
use crate::executor::Executor;
use crate::governor::{ConcurrencyGovernor, GovernorPermit};
use crate::graph::{DependencyGraph, ReadinessStatus};
use crate::lane::LaneNotifier;
use crate::monitor::Monitor;
use crate::state::{OrchestrationRun, RunStatus, StateStore, WpStatus};
use crate::workpackage::WorkPackage;
use crate::worktree::{select_base, WorktreeManager};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{error, info, warn};

enum WpOutcome {
    Completed(String),
    Failed(String, String),
}

impl WpOutcome {
    fn wp_id(&self) -> &str {
        match self {
            WpOutcome::Completed(id) | WpOutcome::Failed(id, _) => id,
        }
    }
}

pub struct Scheduler {
    repo_root: PathBuf,
    feature_slug: String,
    work_packages: HashMap<String, WorkPackage>,
    graph: DependencyGraph,
    config: OrchestratorConfig,
    governor: Arc<ConcurrencyGovernor>,
    executor: Arc<Executor>,
    lane: Arc<LaneNotifier>,
    worktree: Arc<WorktreeManager>,
}

impl Scheduler {
    pub fn new(
        repo_root: PathBuf,
        feature_slug: String,
        work_packages: Vec<WorkPackage>,
        graph: DependencyGraph,
        config: OrchestratorConfig,
        executor: Executor,
    ) -> Self {
        let agent_caps: Vec<(String, usize)> = config
            .file
            .agents
            .iter()
            .map(|(id, entry)| (id.clone(), entry.max_concurrent as usize))
            .collect();
        let governor = Arc::new(ConcurrencyGovernor::new(config.global_concurrency(), &agent_caps));
        let work_packages = work_packages.into_iter().map(|wp| (wp.wp_id.clone(), wp)).collect();
        Scheduler {
            repo_root,
            feature_slug,
            work_packages,
            graph,
            config,
            governor,
            executor: Arc::new(executor),
            lane: Arc::new(LaneNotifier::new()),
            worktree: Arc::new(WorktreeManager::new()),
        }
    }

    fn working_dir(&self, wp_id: &str) -> PathBuf {
        self.repo_root.join(".kittify").join("worktrees").join(&self.feature_slug).join(wp_id)
    }

    /// First agent, in role preference order, that is enabled, declares the
    /// role, is not `exclude`, and currently has spare global and per-agent
    /// capacity. The capacity is reserved on the spot, via a non-blocking
    /// `try_acquire`, rather than merely probed: several work packages can
    /// become ready in the same tick, and a probe-only check would let all of
    /// them target the same agent before any of them actually consumed its
    /// capacity. The caller owns the returned permit and must spend it on
    /// this agent's first attempt.
    fn pick_agent(&self, role: Role, exclude: Option<&str>) -> Option<(String, GovernorPermit)> {
        for id in self.config.preference_list(role) {
            if Some(id.as_str()) == exclude {
                continue;
            }
            match self.config.agent(&id) {
                Some(entry) if entry.enabled && entry.roles.contains(&role) => {
                    if let Some(permit) = self.governor.try_acquire(&id) {
                        return Some((id, permit));
                    }
                }
                _ => {}
            }
        }
        None
    }

    /// Runs the scheduler loop to completion, failure, or cancellation.
    /// Consumes `run`, mutating and persisting it throughout, and returns it.
    pub async fn run(
        self: Arc<Self>,
        run: OrchestrationRun,
        store: StateStore,
        cancel: Arc<AtomicBool>,
    ) -> anyhow::Result<OrchestrationRun> {
        let run = Arc::new(Mutex::new(run));
        {
            let mut guard = run.lock().await;
            guard.status = RunStatus::Running;
            store.save(&guard)?;
        }

        let (tx, mut rx) = mpsc::channel::<WpOutcome>(self.work_packages.len().max(1));
        let mut in_flight: HashSet<String> = HashSet::new();
        let mut handles: HashMap<String, tokio::task::JoinHandle<()>> = HashMap::new();
        let deadline = Instant::now() + Duration::from_secs(self.config.file.global_timeout);

        loop {
            if cancel.load(Ordering::SeqCst) {
                warn!("abort requested; cancelling in-flight work packages");
                for (_, handle) in handles.drain() {
                    handle.abort();
                }
                let mut guard = run.lock().await;
                guard.status = RunStatus::Failed;
                guard.completed_at = Some(Utc::now());
                store.save(&guard)?;
                drop(guard);
                return Ok(Arc::try_unwrap(run).map_err(|_| anyhow::anyhow!("run still shared")).map(|m| m.into_inner())?);
            }

            if Instant::now() >= deadline {
                let timeout_seconds = self.config.file.global_timeout;
                let err = MonitorError::GlobalTimeoutExceeded { timeout_seconds };
                warn!(%err, "global timeout exceeded; cancelling in-flight work packages and pausing for escalation");
                for (_, handle) in handles.drain() {
                    handle.abort();
                }
                let mut guard = run.lock().await;
                for wp_id in &in_flight {
                    if guard.mark_failed(wp_id, Some(err.to_string())).is_ok() {
                        if let Some(w) = guard.work_packages.get_mut(wp_id) {
                            w.failing_phase = Some("global_timeout".to_string());
                        }
                    }
                }
                guard.status = RunStatus::Paused;
                guard.completed_at = Some(Utc::now());
                store.save(&guard)?;
                drop(guard);
                return Ok(Arc::try_unwrap(run).map_err(|_| anyhow::anyhow!("run still shared")).map(|m| m.into_inner())?);
            }

            let statuses = {
                let guard = run.lock().await;
                status_map(&guard)
            };
            let ready: Vec<String> = self
                .graph
                .ready(&statuses)
                .into_iter()
                .filter(|id| !in_flight.contains(id))
                .collect();

            if ready.is_empty() && in_flight.is_empty() {
                let mut guard = run.lock().await;
                if guard.all_terminal() {
                    // Every WP reached a terminal state. If any failed, that
                    // failure had no dependent left stuck on it (otherwise
                    // the dependent would still be non-terminal `pending`
                    // below) — so this is an isolated failure that needs a
                    // human to look at it, not a deadlock.
                    guard.status = if guard.wps_failed == 0 { RunStatus::Completed } else { RunStatus::Paused };
                    guard.completed_at = Some(Utc::now());
                    store.save(&guard)?;
                    info!(run_id = %guard.run_id, status = ?guard.status, "run finished");
                    drop(guard);
                    return Ok(Arc::try_unwrap(run).map_err(|_| anyhow::anyhow!("run still shared")).map(|m| m.into_inner())?);
                } else {
                    guard.status = RunStatus::Failed;
                    guard.completed_at = Some(Utc::now());
                    store.save(&guard)?;
                    error!(run_id = %guard.run_id, "scheduler deadlocked: upstream failures blocked every remaining work package");
                    anyhow::bail!("scheduler deadlock: upstream failures blocked all remaining work packages");
                }
            }

            for wp_id in ready {
                let Some((impl_agent, impl_permit)) = self.pick_agent(Role::Implementation, None) else {
                    continue;
                };

                {
                    let mut guard = run.lock().await;
                    if let Err(e) = guard
                        .mark_ready(&wp_id)
                        .and_then(|_| guard.mark_implementation_started(&wp_id, &impl_agent))
                    {
                        warn!(wp_id, %e, "could not start implementation phase");
                        continue;
                    }
                    store.save(&guard)?;
                }

                in_flight.insert(wp_id.clone());
                let wp = self.work_packages.get(&wp_id).expect("ready wp_id exists").clone();
                let this = Arc::clone(&self);
                let run_clone = Arc::clone(&run);
                let store_clone = store.clone();
                let tx_clone = tx.clone();

                let handle = tokio::spawn(async move {
                    let outcome = this.execute_wp(wp, impl_agent, impl_permit, run_clone, store_clone).await;
                    let _ = tx_clone.send(outcome).await;
                });
                handles.insert(wp_id, handle);
            }

            {
                let mut guard = run.lock().await;
                guard.bump_parallel_peak(in_flight.len());
                store.save(&guard)?;
            }

            if !in_flight.is_empty() {
                tokio::select! {
                    received = rx.recv() => {
                        if let Some(outcome) = received {
                            in_flight.remove(outcome.wp_id());
                            handles.remove(outcome.wp_id());
                        }
                        let guard = run.lock().await;
                        store.save(&guard)?;
                    }
                    _ = tokio::time::sleep_until(deadline) => {
                        // Falls through to the deadline check at the top of
                        // the next iteration.
                    }
                }
            }
        }
    }

    async fn execute_wp(
        &self,
        wp: WorkPackage,
        impl_agent: String,
        impl_permit: GovernorPermit,
        run: Arc<Mutex<OrchestrationRun>>,
        store: StateStore,
    ) -> WpOutcome {
        let working_dir = self.working_dir(&wp.wp_id);
        let selection = select_base(&wp.dependencies);
        if !selection.unmerged.is_empty() {
            warn!(
                wp_id = %wp.wp_id,
                extra_dependencies = ?selection.unmerged,
                "work package has multiple dependencies; only the first was branched from, the rest need manual integration"
            );
            let mut guard = run.lock().await;
            if let Some(w) = guard.work_packages.get_mut(&wp.wp_id) {
                w.unmerged_dependencies = selection.unmerged.clone();
            }
            if let Err(e) = store.save(&guard) {
                error!(wp_id = %wp.wp_id, %e, "failed to persist unmerged dependencies");
            }
        }
        if let Err(e) = self.worktree.ensure(&self.repo_root, &wp.wp_id, selection.base.as_deref()).await {
            return self.fail(&run, &store, &wp.wp_id, "worktree", e.to_string()).await;
        }

        {
            let mut guard = run.lock().await;
            if let Some(w) = guard.work_packages.get_mut(&wp.wp_id) {
                w.worktree_path = Some(working_dir.clone());
            }
            if let Err(e) = store.save(&guard) {
                error!(wp_id = %wp.wp_id, %e, "failed to persist worktree path");
            }
        }

        self.lane.notify(&self.repo_root, &wp.wp_id, "doing", "implementation started").await;

        let prompt = match wp.prompt_body() {
            Ok(p) => p,
            Err(e) => return self.fail(&run, &store, &wp.wp_id, "implementation", e.to_string()).await,
        };

        let monitor = Monitor::new(&self.config, &self.executor, &self.governor);
        let impl_full = self.config.preference_list(Role::Implementation);
        let start_idx = impl_full.iter().position(|a| a == &impl_agent).unwrap_or(0);
        let impl_candidates = impl_full[start_idx..].to_vec();

        let impl_outcome = match monitor
            .run_phase(&wp.wp_id, Role::Implementation, &impl_candidates, &prompt, &working_dir, Some(impl_permit))
            .await
        {
            Ok(o) => o,
            Err(e) => return self.fail(&run, &store, &wp.wp_id, "implementation", e.to_string()).await,
        };

        {
            let mut guard = run.lock().await;
            if let Some(w) = guard.work_packages.get_mut(&wp.wp_id) {
                w.implementation.agent_id = Some(impl_outcome.agent_id.clone());
                w.implementation.retries = impl_outcome.retries;
                w.fallback_agents_tried.extend(impl_outcome.fallback_agents_tried.iter().cloned());
                w.log_file = Some(impl_outcome.log_path.clone());
            }
            if let Err(e) = guard.mark_implementation_completed(&wp.wp_id, impl_outcome.result.exit_code) {
                return self.fail(&run, &store, &wp.wp_id, "implementation", e.to_string()).await;
            }
            if let Err(e) = store.save(&guard) {
                return self.fail(&run, &store, &wp.wp_id, "implementation", e.to_string()).await;
            }
        }

        self.lane.notify(&self.repo_root, &wp.wp_id, "for_review", "implementation complete").await;

        let final_impl_agent = impl_outcome.agent_id.clone();
        let single_agent_mode = self.config.file.single_agent_mode.enabled;
        let review_selection: Option<(String, Option<GovernorPermit>)> = if single_agent_mode {
            let agent = self.config.file.single_agent_mode.agent.clone().unwrap_or_else(|| final_impl_agent.clone());
            Some((agent, None))
        } else {
            self.pick_agent(Role::Review, Some(&final_impl_agent)).map(|(id, permit)| (id, Some(permit)))
        };

        let single_agent_review = match review_selection {
            Some((review_agent, review_permit)) => {
                {
                    let mut guard = run.lock().await;
                    if let Err(e) = guard.mark_review_started(&wp.wp_id, &review_agent) {
                        return self.fail(&run, &store, &wp.wp_id, "review", e.to_string()).await;
                    }
                    if let Err(e) = store.save(&guard) {
                        return self.fail(&run, &store, &wp.wp_id, "review", e.to_string()).await;
                    }
                }

                let review_full = self.config.preference_list(Role::Review);
                let ridx = review_full.iter().position(|a| a == &review_agent).unwrap_or(0);
                let review_candidates = review_full[ridx..].to_vec();
                let review_prompt = format!(
                    "Review the implementation of work package {}.\n\n{}",
                    wp.wp_id, prompt
                );

                let review_outcome = match monitor
                    .run_phase(&wp.wp_id, Role::Review, &review_candidates, &review_prompt, &working_dir, review_permit)
                    .await
                {
                    Ok(o) => o,
                    Err(e) => return self.fail(&run, &store, &wp.wp_id, "review", e.to_string()).await,
                };

                let mut guard = run.lock().await;
                if let Some(w) = guard.work_packages.get_mut(&wp.wp_id) {
                    w.review.agent_id = Some(review_outcome.agent_id.clone());
                    w.review.retries = review_outcome.retries;
                    w.fallback_agents_tried.extend(review_outcome.fallback_agents_tried.iter().cloned());
                    w.log_file = Some(review_outcome.log_path.clone());
                }
                if let Err(e) = guard.mark_review_completed(&wp.wp_id, review_outcome.result.exit_code) {
                    return self.fail(&run, &store, &wp.wp_id, "review", e.to_string()).await;
                }
                if let Err(e) = store.save(&guard) {
                    return self.fail(&run, &store, &wp.wp_id, "review", e.to_string()).await;
                }
                false
            }
            None => true,
        };

        self.lane.notify(&self.repo_root, &wp.wp_id, "done", "review complete").await;

        let mut guard = run.lock().await;
        if let Err(e) = guard.mark_completed(&wp.wp_id, single_agent_review) {
            let msg = e.to_string();
            drop(guard);
            return self.fail(&run, &store, &wp.wp_id, "review", msg).await;
        }
        if let Err(e) = store.save(&guard) {
            let msg = e.to_string();
            drop(guard);
            return self.fail(&run, &store, &wp.wp_id, "review", msg).await;
        }
        WpOutcome::Completed(wp.wp_id)
    }

    /// Marks `wp_id` failed, records which phase it failed in, pauses the run
    /// for human escalation, and persists the result.
    async fn fail(&self, run: &Arc<Mutex<OrchestrationRun>>, store: &StateStore, wp_id: &str, phase: &str, error: String) -> WpOutcome {
        let mut guard = run.lock().await;
        let _ = guard.mark_failed(wp_id, Some(error.clone()));
        if let Some(w) = guard.work_packages.get_mut(wp_id) {
            w.failing_phase = Some(phase.to_string());
            let role = match phase {
                "implementation" => Some(Role::Implementation),
                "review" => Some(Role::Review),
                _ => None,
            };
            if let Some(role) = role {
                w.log_file = Some(self.executor.log_path(wp_id, role));
            }
        }
        guard.status = RunStatus::Paused;
        if let Err(e) = store.save(&guard) {
            error!(wp_id, %e, "failed to persist after work package failure");
        }
        error!(wp_id, phase, %error, "work package failed");
        WpOutcome::Failed(wp_id.to_string(), error)
    }
}

fn status_map(run: &OrchestrationRun) -> HashMap<String, ReadinessStatus> {
    run.work_packages
        .iter()
        .map(|(id, wp)| {
            let status = match wp.status {
                WpStatus::Pending => ReadinessStatus::Pending,
                WpStatus::Completed => ReadinessStatus::Completed,
                _ => ReadinessStatus::Other,
            };
            (id.clone(), status)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgentEntry, AgentsFile, FallbackStrategy, SingleAgentMode};
    use std::io::Write;

    fn write_task(dir: &std::path::Path, filename: &str, id: &str, deps: &[&str]) {
        let deps_yaml = deps.iter().map(|d| format!("{d}")).collect::<Vec<_>>().join(", ");
        let content = format!(
            "---\nwork_package_id: {id}\ntitle: {id}\ndependencies: [{deps_yaml}]\n---\nDo the thing for {id}.\n"
        );
        let path = dir.join(filename);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
    }

    fn test_config(agent_ids: &[&str]) -> OrchestratorConfig {
        let mut agents = HashMap::new();
        let mut order = Vec::new();
        for (i, id) in agent_ids.iter().enumerate() {
            agents.insert(
                id.to_string(),
                AgentEntry {
                    enabled: true,
                    roles: vec![Role::Implementation, Role::Review],
                    priority: i as u32,
                    max_concurrent: 4,
                    timeout_seconds: 5,
                },
            );
            order.push(id.to_string());
        }
        let mut defaults = HashMap::new();
        defaults.insert("implementation".to_string(), order.clone());
        defaults.insert("review".to_string(), order);
        OrchestratorConfig {
            file: AgentsFile {
                version: "1".to_string(),
                defaults,
                agents,
                fallback_strategy: FallbackStrategy::NextInList,
                max_retries: 0,
                single_agent_mode: SingleAgentMode::default(),
                global_concurrency: 4,
                global_timeout: 3600,
            },
        }
    }

    #[tokio::test]
    async fn linear_chain_failure_blocks_its_dependent_and_ends_failed() {
        let repo = tempfile::tempdir().unwrap();
        let tasks_dir = repo.path().join("tasks");
        std::fs::create_dir_all(&tasks_dir).unwrap();
        write_task(&tasks_dir, "wp01.md", "WP01", &[]);
        write_task(&tasks_dir, "wp02.md", "WP02", &["WP01"]);

        let wps = crate::workpackage::load_work_packages(&tasks_dir).unwrap();
        let graph = DependencyGraph::build(&wps).unwrap();
        let config = test_config(&["test-agent"]);
        let executor = Executor::new(repo.path().join(".kittify/logs"));
        let scheduler = Arc::new(Scheduler::new(
            repo.path().to_path_buf(),
            "feature-x".to_string(),
            wps.clone(),
            graph,
            config.clone(),
            executor,
        ));

        let run = OrchestrationRun::new("feature-x", config.config_hash(), 4, &["WP01".to_string(), "WP02".to_string()]);
        let store = StateStore::new(repo.path());

        // No real "test-agent" binary exists, so WP01's implementation phase
        // exhausts immediately. WP02 depends on it and can never become
        // ready, so the scheduler detects the resulting deadlock and the run
        // ends failed rather than hanging.
        let err = scheduler.run(run, store.clone(), Arc::new(AtomicBool::new(false))).await.unwrap_err();
        assert!(err.to_string().contains("deadlock"));
        let persisted = store.load().unwrap().unwrap();
        assert_eq!(persisted.status, RunStatus::Failed);
        assert_eq!(persisted.wps_failed, 1);
    }

    #[tokio::test]
    async fn cycle_rejected_before_scheduling() {
        let repo = tempfile::tempdir().unwrap();
        let tasks_dir = repo.path().join("tasks");
        std::fs::create_dir_all(&tasks_dir).unwrap();
        write_task(&tasks_dir, "wp01.md", "WP01", &["WP02"]);
        write_task(&tasks_dir, "wp02.md", "WP02", &["WP01"]);
        let wps = crate::workpackage::load_work_packages(&tasks_dir).unwrap();
        let err = DependencyGraph::build(&wps).unwrap_err();
        assert!(matches!(err, crate::errors::GraphError::Cycle { .. }));
    }

    #[test]
    fn pick_agent_skips_excluded_and_disabled() {
        let config = test_config(&["a", "b"]);
        let repo = tempfile::tempdir().unwrap();
        let executor = Executor::new(repo.path().join("logs"));
        let graph = DependencyGraph::build(&[]).unwrap();
        let scheduler = Scheduler::new(repo.path().to_path_buf(), "f".to_string(), vec![], graph, config, executor);
        let picked = scheduler.pick_agent(Role::Implementation, Some("a"));
        assert_eq!(picked.map(|(id, _)| id), Some("b".to_string()));
    }

    #[test]
    fn pick_agent_reserves_capacity_so_a_second_call_moves_on() {
        let mut config = test_config(&["a", "b"]);
        for entry in config.file.agents.values_mut() {
            entry.max_concurrent = 1;
        }
        let repo = tempfile::tempdir().unwrap();
        let executor = Executor::new(repo.path().join("logs"));
        let graph = DependencyGraph::build(&[]).unwrap();
        let scheduler = Scheduler::new(repo.path().to_path_buf(), "f".to_string(), vec![], graph, config, executor);

        let (first, _permit) = scheduler.pick_agent(Role::Implementation, None).unwrap();
        assert_eq!(first, "a");
        let (second, _permit2) = scheduler.pick_agent(Role::Implementation, None).unwrap();
        assert_eq!(second, "b");
    }

    #[tokio::test]
    async fn isolated_failure_with_no_dependents_ends_paused() {
        let repo = tempfile::tempdir().unwrap();
        let tasks_dir = repo.path().join("tasks");
        std::fs::create_dir_all(&tasks_dir).unwrap();
        write_task(&tasks_dir, "wp01.md", "WP01", &[]);

        let wps = crate::workpackage::load_work_packages(&tasks_dir).unwrap();
        let graph = DependencyGraph::build(&wps).unwrap();
        let config = test_config(&["test-agent"]);
        let executor = Executor::new(repo.path().join(".kittify/logs"));
        let scheduler = Arc::new(Scheduler::new(
            repo.path().to_path_buf(),
            "feature-x".to_string(),
            wps.clone(),
            graph,
            config.clone(),
            executor,
        ));

        let run = OrchestrationRun::new("feature-x", config.config_hash(), 4, &["WP01".to_string()]);
        let store = StateStore::new(repo.path());

        // WP01 has no dependents, so its failure never blocks another WP —
        // the run pauses for human escalation rather than ending failed.
        let finished = scheduler.run(run, store.clone(), Arc::new(AtomicBool::new(false))).await.unwrap();
        assert_eq!(finished.status, RunStatus::Paused);
        assert_eq!(finished.wps_failed, 1);
        let wp01 = &finished.work_packages["WP01"];
        assert_eq!(wp01.failing_phase.as_deref(), Some("implementation"));
    }
}
