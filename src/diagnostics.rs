//! Operator-facing diagnostics: the `tracing` subscriber wiring for the
//! orchestrator's own operational log (distinct from the per-invocation
//! agent logs under `.kittify/logs/`), and the escalation panel shown when a
//! work package exhausts retries and fallback agents.

use crate::state::{OrchestrationRun, WpStatus};
use console::style;
use std::path::Path;
use tracing_subscriber::EnvFilter;

/// Installs a stderr-formatted subscriber honoring `RUST_LOG`, plus a
/// rolling daily file appender under `<repo>/.kittify/logs/orchestrator.log`.
/// Returns the appender's guard; dropping it flushes pending writes, so the
/// caller must hold it for the process lifetime.
pub fn init_tracing(repo_root: &Path) -> tracing_appender::non_blocking::WorkerGuard {
    let log_dir = repo_root.join(".kittify").join("logs");
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "orchestrator.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking)
        .with_ansi(false)
        .init();

    guard
}

/// Renders a human escalation panel for a work package that exhausted every
/// recovery option, naming the failing phase, the agents tried, the last
/// recorded error, the log file, and the continuation options available to
/// the operator.
pub fn render_escalation(run: &OrchestrationRun) -> String {
    let mut lines = Vec::new();
    lines.push(style("ESCALATION: human attention required").red().bold().to_string());
    lines.push(format!("run {} ({})", run.run_id, run.feature_slug));

    for (wp_id, wp) in &run.work_packages {
        if wp.status != WpStatus::Failed {
            continue;
        }
        lines.push(String::new());
        lines.push(style(format!("work package {wp_id}")).yellow().to_string());
        if let Some(phase) = &wp.failing_phase {
            lines.push(format!("  failing phase: {phase}"));
        }
        if let Some(agent) = &wp.implementation.agent_id {
            lines.push(format!("  implementation agent: {agent}"));
        }
        if let Some(agent) = &wp.review.agent_id {
            lines.push(format!("  review agent: {agent}"));
        }
        if !wp.fallback_agents_tried.is_empty() {
            lines.push(format!("  fallback agents tried: {}", wp.fallback_agents_tried.join(", ")));
        }
        if !wp.unmerged_dependencies.is_empty() {
            lines.push(format!("  unmerged dependencies: {}", wp.unmerged_dependencies.join(", ")));
        }
        if let Some(err) = &wp.last_error {
            lines.push(format!("  last error: {err}"));
        }
        if let Some(log_file) = &wp.log_file {
            lines.push(format!("  log file: {}", log_file.display()));
        }
        lines.push(String::new());
        lines.push("  continue with one of:".to_string());
        lines.push("    resume    fix the underlying issue, then `orchestrate resume`".to_string());
        lines.push(format!("    skip-wp   mark {wp_id} as manually handled and unblock its dependents"));
        lines.push("    abort     give up on this run".to_string());
    }
    lines.join("\n")
}
