//! The policy layer above the Executor: classifies outcomes, retries the
//! same agent up to a configured limit, and falls back across the role's
//! preference list when retries are exhausted.

use crate::config::{FallbackStrategy, OrchestratorConfig, Role};
use crate::errors::MonitorError;
use crate::executor::Executor;
use crate::governor::{ConcurrencyGovernor, GovernorPermit};
use crate::invoker::InvocationResult;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Transient,
    Auth,
    Generic,
}

fn classify(result: &InvocationResult) -> Outcome {
    if result.success {
        return Outcome::Success;
    }
    if result.is_timeout() {
        return Outcome::Transient;
    }
    let haystack = format!("{} {}", result.stderr, result.stdout).to_lowercase();
    let auth_markers = [
        "401",
        "unauthorized",
        "authentication failed",
        "auth error",
        "invalid api key",
        "permission denied",
    ];
    if auth_markers.iter().any(|m| haystack.contains(m)) {
        return Outcome::Auth;
    }
    let transient_markers = ["rate limit", "429", "timed out", "temporarily unavailable", "connection reset"];
    if transient_markers.iter().any(|m| haystack.contains(m)) {
        return Outcome::Transient;
    }
    Outcome::Generic
}

/// Exponential backoff starting at a small base, used between same-agent retries.
fn retry_delay(attempt: u32) -> Duration {
    let base_ms: u64 = 250;
    Duration::from_millis(base_ms.saturating_mul(1u64 << attempt.min(6)))
}

pub struct MonitorOutcome {
    pub result: InvocationResult,
    pub agent_id: String,
    pub retries: u32,
    pub fallback_agents_tried: Vec<String>,
    pub log_path: PathBuf,
}

pub struct Monitor<'a> {
    pub config: &'a OrchestratorConfig,
    pub executor: &'a Executor,
    pub governor: &'a ConcurrencyGovernor,
}

impl<'a> Monitor<'a> {
    pub fn new(config: &'a OrchestratorConfig, executor: &'a Executor, governor: &'a ConcurrencyGovernor) -> Self {
        Monitor {
            config,
            executor,
            governor,
        }
    }

    /// Runs a single WP phase to success or exhaustion, trying `preference_list`
    /// in order (already filtered for exclusions such as the implementation
    /// agent when selecting a reviewer).
    ///
    /// `initial_permit`, when given, is a governor reservation the caller
    /// already made for `preference_list[0]` before committing to this
    /// assignment (see `Scheduler::pick_agent`); it is spent on that agent's
    /// first attempt instead of acquiring a second one.
    pub async fn run_phase(
        &self,
        wp_id: &str,
        role: Role,
        preference_list: &[String],
        prompt: &str,
        working_dir: &Path,
        initial_permit: Option<GovernorPermit>,
    ) -> Result<MonitorOutcome, MonitorError> {
        let mut candidates: VecDeque<String> = preference_list.iter().cloned().collect();
        let mut fallback_tried = Vec::new();
        let mut initial_permit = initial_permit;
        // The phase's persisted retry count accumulates across fallback
        // candidates (spec scenario 3: exhausting agent A's budget then
        // succeeding on B still reports the retries spent on A). The retry
        // *budget* below is per-agent: each fallback candidate gets its own
        // `max_retries` attempts, same-agent, before the phase moves on.
        let mut total_retries = 0u32;

        loop {
            let Some(agent_id) = candidates.pop_front() else {
                return Err(MonitorError::Exhausted {
                    wp_id: wp_id.to_string(),
                    phase: role.as_str().to_string(),
                });
            };

            let Some(invoker) = crate::invoker::get(&agent_id) else {
                fallback_tried.push(agent_id);
                continue;
            };
            let timeout_seconds = self
                .config
                .agent(&agent_id)
                .map(|a| a.timeout_seconds)
                .unwrap_or(600);
            let max_retries = self.config.max_retries();

            let mut retries_this_agent = 0u32;
            let mut last_result;

            loop {
                let _permit = match initial_permit.take() {
                    Some(p) => p,
                    None => self.governor.acquire(&agent_id).await,
                };
                let invocation = self
                    .executor
                    .run(&invoker, prompt, working_dir, role, timeout_seconds, wp_id)
                    .await;
                drop(_permit);

                let (result, log_path) = match invocation {
                    Ok((r, p)) => (r, p),
                    Err(_spawn_err) => (
                        InvocationResult {
                            success: false,
                            exit_code: -1,
                            stderr: "agent process failed to spawn".to_string(),
                            ..Default::default()
                        },
                        self.executor.log_path(wp_id, role),
                    ),
                };

                let outcome = classify(&result);
                last_result = result;

                match outcome {
                    Outcome::Success => {
                        return Ok(MonitorOutcome {
                            result: last_result,
                            agent_id,
                            retries: total_retries,
                            fallback_agents_tried: fallback_tried,
                            log_path,
                        });
                    }
                    Outcome::Auth => break,
                    Outcome::Transient | Outcome::Generic => {
                        if retries_this_agent < max_retries {
                            retries_this_agent += 1;
                            total_retries += 1;
                            tokio::time::sleep(retry_delay(retries_this_agent)).await;
                            continue;
                        }
                        break;
                    }
                }
            }

            fallback_tried.push(agent_id);
            let _ = last_result;
            match self.config.file.fallback_strategy {
                FallbackStrategy::Fail | FallbackStrategy::SameAgent => {
                    return Err(MonitorError::Exhausted {
                        wp_id: wp_id.to_string(),
                        phase: role.as_str().to_string(),
                    });
                }
                FallbackStrategy::NextInList => continue,
            }
        }
    }
}
