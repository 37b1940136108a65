//! Typed error hierarchy for the orchestrator.
//!
//! One enum per subsystem boundary, matching the kinds enumerated for the
//! run: configuration, dependency graph, state store, agent invocation,
//! and monitor escalation.

use thiserror::Error;

/// Errors raised while loading and validating `.kittify/agents.yaml`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file at {path}: {source}")]
    ReadFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file at {path}: {source}")]
    ParseFailed {
        path: std::path::PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("default role '{role}' lists unknown agent '{agent_id}'")]
    UnknownDefaultAgent { role: String, agent_id: String },

    #[error("single_agent_mode is enabled but agent '{agent_id}' is not configured or disabled")]
    InvalidSingleAgent { agent_id: String },

    #[error("max_retries must be >= 0, got {value}")]
    InvalidMaxRetries { value: i64 },

    #[error("global_concurrency must be >= 1, got {value}")]
    InvalidGlobalConcurrency { value: i64 },

    #[error("no enabled agent covers required role '{role}'")]
    NoAgentForRole { role: String },

    #[error("no coding agent CLI was found installed on PATH")]
    NoAgentsInstalled,
}

/// Errors raised while building or validating the work package dependency graph.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("failed to read task file at {path}: {source}")]
    ReadFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("task file at {path} is missing a work_package_id")]
    MissingWorkPackageId { path: std::path::PathBuf },

    #[error("task file at {path} has malformed frontmatter: {reason}")]
    MalformedFrontmatter {
        path: std::path::PathBuf,
        reason: String,
    },

    #[error("duplicate work package id '{wp_id}'")]
    DuplicateWorkPackage { wp_id: String },

    #[error("work package '{wp_id}' depends on unknown work package '{dependency}'")]
    UnknownDependency { wp_id: String, dependency: String },

    #[error("work package '{wp_id}' depends on itself")]
    SelfDependency { wp_id: String },

    #[error("dependency cycle detected among work packages: {}", cycle.join(" -> "))]
    Cycle { cycle: Vec<String> },
}

/// Errors raised by the durable state store.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to read state file at {path}: {source}")]
    ReadFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("state file at {path} is corrupt ({reason}); see backup at {backup}")]
    Corrupt {
        path: std::path::PathBuf,
        backup: std::path::PathBuf,
        reason: String,
    },

    #[error("failed to write state file at {path}: {source}")]
    WriteFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("state transition violation: {0}")]
    InvalidTransition(String),

    #[error("a run is already active for this repository")]
    RunAlreadyActive,

    #[error("no run state found for this repository")]
    NoActiveRun,

    #[error("resume requires a paused run, but status is '{status}'")]
    NotPaused { status: String },
}

/// Errors raised by the executor while spawning and supervising an agent process.
#[derive(Debug, Error)]
pub enum InvocationError {
    #[error("failed to spawn agent '{agent_id}': {source}")]
    SpawnFailed {
        agent_id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read prompt file at {path}: {source}")]
    PromptReadFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write log file at {path}: {source}")]
    LogWriteFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write to agent '{agent_id}' stdin: {source}")]
    StdinWriteFailed {
        agent_id: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised when the Monitor has exhausted every recovery option for a WP phase.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("work package '{wp_id}' exhausted retries and fallback agents in phase {phase}")]
    Exhausted { wp_id: String, phase: String },

    #[error("external worktree manager failed for work package '{wp_id}': {message}")]
    WorktreeFailed { wp_id: String, message: String },

    #[error("global timeout of {timeout_seconds}s exceeded")]
    GlobalTimeoutExceeded { timeout_seconds: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_unknown_default_agent_carries_fields() {
        let err = ConfigError::UnknownDefaultAgent {
            role: "implementation".into(),
            agent_id: "ghost".into(),
        };
        assert!(err.to_string().contains("implementation"));
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn graph_error_cycle_message_lists_members() {
        let err = GraphError::Cycle {
            cycle: vec!["WP01".into(), "WP02".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("WP01"));
        assert!(msg.contains("WP02"));
    }

    #[test]
    fn graph_error_self_dependency_is_matchable() {
        let err = GraphError::SelfDependency {
            wp_id: "WP01".into(),
        };
        assert!(matches!(err, GraphError::SelfDependency { .. }));
    }

    #[test]
    fn state_error_not_paused_carries_status() {
        let err = StateError::NotPaused {
            status: "completed".into(),
        };
        assert!(err.to_string().contains("completed"));
    }

    #[test]
    fn monitor_error_exhausted_names_wp_and_phase() {
        let err = MonitorError::Exhausted {
            wp_id: "WP01".into(),
            phase: "implementation".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("WP01"));
        assert!(msg.contains("implementation"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&ConfigError::NoAgentsInstalled);
        assert_std_error(&GraphError::SelfDependency {
            wp_id: "x".into(),
        });
        assert_std_error(&StateError::RunAlreadyActive);
        assert_std_error(&MonitorError::GlobalTimeoutExceeded {
            timeout_seconds: 10,
        });
    }
}
