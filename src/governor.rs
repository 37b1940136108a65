//! Two-level concurrency governor: one global semaphore, one per-agent
//! semaphore. Every caller acquires global first, then agent-specific;
//! permits release in the opposite order. That fixed ordering, observed
//! without exception, is what rules out deadlock between tasks contending
//! for distinct agent pools.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

pub struct ConcurrencyGovernor {
    global: Arc<Semaphore>,
    per_agent: HashMap<String, Arc<Semaphore>>,
}

/// Held for the lifetime of a single agent invocation. Dropping it releases
/// the agent-specific slot first, then the global slot — the reverse of
/// acquisition order.
pub struct GovernorPermit {
    _agent: OwnedSemaphorePermit,
    _global: OwnedSemaphorePermit,
}

impl ConcurrencyGovernor {
    pub fn new(global_concurrency: usize, agent_capacities: &[(String, usize)]) -> Self {
        let per_agent = agent_capacities
            .iter()
            .map(|(id, cap)| (id.clone(), Arc::new(Semaphore::new((*cap).max(1)))))
            .collect();
        ConcurrencyGovernor {
            global: Arc::new(Semaphore::new(global_concurrency.max(1))),
            per_agent,
        }
    }

    /// Non-blocking capacity check used by the scheduler before it commits to
    /// assigning `agent_id` to a work package this tick.
    pub fn would_block(&self, agent_id: &str) -> bool {
        if self.global.available_permits() == 0 {
            return true;
        }
        match self.per_agent.get(agent_id) {
            Some(sem) => sem.available_permits() == 0,
            None => true,
        }
    }

    pub fn has_agent(&self, agent_id: &str) -> bool {
        self.per_agent.contains_key(agent_id)
    }

    /// Non-blocking variant of `acquire`: reserves global then agent-specific
    /// capacity immediately, or reserves nothing and returns `None` if either
    /// level is exhausted. Used by the scheduler when it must commit an agent
    /// assignment synchronously, within a single tick, instead of racing a
    /// later blocking `acquire` against other work packages readied the same
    /// tick.
    pub fn try_acquire(&self, agent_id: &str) -> Option<GovernorPermit> {
        let global_permit = self.global.clone().try_acquire_owned().ok()?;

        let agent_sem = self
            .per_agent
            .get(agent_id)
            .cloned()
            .unwrap_or_else(|| Arc::new(Semaphore::new(1)));
        let agent_permit = agent_sem.try_acquire_owned().ok()?;

        Some(GovernorPermit {
            _agent: agent_permit,
            _global: global_permit,
        })
    }

    /// Acquires global capacity, then agent-specific capacity, in that fixed
    /// order. Suspends the caller if either level is at capacity.
    pub async fn acquire(&self, agent_id: &str) -> GovernorPermit {
        let global_permit = self
            .global
            .clone()
            .acquire_owned()
            .await
            .expect("global semaphore is never closed");

        let agent_sem = self
            .per_agent
            .get(agent_id)
            .cloned()
            .unwrap_or_else(|| Arc::new(Semaphore::new(1)));
        let agent_permit = agent_sem
            .acquire_owned()
            .await
            .expect("agent semaphore is never closed");

        GovernorPermit {
            _agent: agent_permit,
            _global: global_permit,
        }
    }

    pub fn global_available(&self) -> usize {
        self.global.available_permits()
    }

    pub fn agent_available(&self, agent_id: &str) -> usize {
        self.per_agent
            .get(agent_id)
            .map(|s| s.available_permits())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_respects_global_capacity() {
        let governor = ConcurrencyGovernor::new(1, &[("a".to_string(), 5)]);
        let _p1 = governor.acquire("a").await;
        assert!(governor.would_block("a"));
    }

    #[tokio::test]
    async fn acquire_respects_per_agent_capacity() {
        let governor = ConcurrencyGovernor::new(5, &[("a".to_string(), 1), ("b".to_string(), 1)]);
        let _p1 = governor.acquire("a").await;
        assert!(governor.would_block("a"));
        assert!(!governor.would_block("b"));
    }

    #[tokio::test]
    async fn release_on_drop_frees_both_levels() {
        let governor = ConcurrencyGovernor::new(1, &[("a".to_string(), 1)]);
        {
            let _permit = governor.acquire("a").await;
            assert_eq!(governor.global_available(), 0);
            assert_eq!(governor.agent_available("a"), 0);
        }
        assert_eq!(governor.global_available(), 1);
        assert_eq!(governor.agent_available("a"), 1);
    }

    #[tokio::test]
    async fn distinct_agent_pools_do_not_block_each_other() {
        let governor = ConcurrencyGovernor::new(10, &[("a".to_string(), 1), ("b".to_string(), 1)]);
        let _pa = governor.acquire("a").await;
        let _pb = governor.acquire("b").await;
        assert!(governor.would_block("a"));
        assert!(governor.would_block("b"));
    }

    #[test]
    fn try_acquire_reserves_capacity_immediately() {
        let governor = ConcurrencyGovernor::new(5, &[("a".to_string(), 1)]);
        let permit = governor.try_acquire("a");
        assert!(permit.is_some());
        assert_eq!(governor.agent_available("a"), 0);
        assert!(governor.try_acquire("a").is_none());
    }

    #[test]
    fn try_acquire_fails_without_blocking_when_exhausted() {
        let governor = ConcurrencyGovernor::new(1, &[("a".to_string(), 5)]);
        let _p1 = governor.try_acquire("a").unwrap();
        assert!(governor.try_acquire("a").is_none());
    }
}
