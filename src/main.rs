use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kittify_orchestrator::run::Orchestrator;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "orchestrate")]
#[command(version, about = "Autonomous multi-agent orchestrator for feature work packages")]
pub struct Cli {
    /// Repository root; defaults to the current directory.
    #[arg(long, global = true)]
    pub repo: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a new orchestration run for a feature.
    Start {
        #[arg(long)]
        feature: String,
    },
    /// Report the status of the active or most recent run.
    Status,
    /// Resume a paused run.
    Resume,
    /// Abort the active run.
    Abort,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let repo_root = cli.repo.unwrap_or_else(kittify_orchestrator::run::repo_root_from_cwd);
    let _guard = kittify_orchestrator::diagnostics::init_tracing(&repo_root);

    let orchestrator = Orchestrator::new(repo_root);

    match cli.command {
        Commands::Start { feature } => {
            let run = orchestrator.start(&feature).await.context("orchestration run failed")?;
            print_summary(&run);
            std::process::exit(exit_code_for(run.status));
        }
        Commands::Status => {
            let summary = orchestrator.status().context("failed to read run status")?;
            println!("status: {:?}", summary.status);
            println!("work packages: {} total, {} completed, {} failed", summary.wps_total, summary.wps_completed, summary.wps_failed);
            if !summary.in_flight.is_empty() {
                println!("in flight: {}", summary.in_flight.join(", "));
            }
            if !summary.pending.is_empty() {
                println!("pending: {}", summary.pending.join(", "));
            }
        }
        Commands::Resume => {
            let run = orchestrator.resume().await.context("resume failed")?;
            print_summary(&run);
            std::process::exit(exit_code_for(run.status));
        }
        Commands::Abort => {
            let run = orchestrator.abort().context("abort failed")?;
            println!("run {} aborted", run.run_id);
        }
    }

    Ok(())
}

fn print_summary(run: &kittify_orchestrator::state::OrchestrationRun) {
    println!("run {} ({}): {:?}", run.run_id, run.feature_slug, run.status);
    println!("completed: {}/{}  failed: {}", run.wps_completed, run.wps_total, run.wps_failed);
    if run.status == kittify_orchestrator::state::RunStatus::Failed {
        println!("{}", kittify_orchestrator::diagnostics::render_escalation(run));
    }
}

fn exit_code_for(status: kittify_orchestrator::state::RunStatus) -> i32 {
    use kittify_orchestrator::state::RunStatus;
    match status {
        RunStatus::Completed => 0,
        _ => 1,
    }
}
