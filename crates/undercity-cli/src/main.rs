use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use undercity_core::config::OrchestratorConfig;
use undercity_core::RecoveryStateMachine;
use undercity_scheduler::Scheduler;

/// Parallel multi-agent task orchestrator.
///
/// This binary wires the orchestrator's crates together for operational
/// use (health checks, crash recovery) — dispatching an actual batch
/// requires an `AgentRunner`/`ConflictResolver`/`Verifier` implementation,
/// which is supplied by an embedding application, not this CLI.
#[derive(Parser)]
#[command(name = "undercity")]
#[command(version, about)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to the main repository.
    #[arg(long, global = true, default_value = ".")]
    repo: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check repository and state-directory health.
    Doctor,
    /// Show the most recently persisted batch's recovery status.
    Status,
    /// Resume the most recently persisted, incomplete batch.
    ///
    /// Clears stale `running` workspaces and lists the tasks that are now
    /// ready to be redispatched by the embedding application.
    Resume,
    /// Abandon the most recently persisted, incomplete batch, marking
    /// every non-terminal task `failed`.
    Abandon,
}

fn now_ms() -> i64 {
    i64::try_from(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is before the Unix epoch")
            .as_millis(),
    )
    .unwrap_or(i64::MAX)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config_path = cli.repo.join(".undercity").join("config.toml");
    let config = OrchestratorConfig::load(&config_path).context("loading configuration")?;
    let state_dir = cli.repo.join(&config.repo.state_dir);

    match cli.command {
        Commands::Doctor => run_doctor(&cli.repo, &state_dir),
        Commands::Status => run_status(&state_dir),
        Commands::Resume => run_resume(&cli.repo, &config, &state_dir),
        Commands::Abandon => run_abandon(&cli.repo, &config, &state_dir),
    }
}

fn run_doctor(repo: &Path, state_dir: &Path) -> Result<()> {
    let report = undercity_scheduler::doctor::run(repo, state_dir);
    for check in &report.checks {
        let status = if check.ok { "OK" } else { "FAIL" };
        println!("[{status}] {}: {}", check.name, check.detail);
    }
    if !report.all_ok() {
        anyhow::bail!("one or more checks failed");
    }
    Ok(())
}

fn run_status(state_dir: &Path) -> Result<()> {
    let recovery_path = state_dir.join("parallel-recovery.json");
    match RecoveryStateMachine::load(recovery_path, now_ms).context("loading recovery state")? {
        Some(recovery) => {
            let summary = recovery.info();
            println!("batch {}", summary.batch_id);
            println!("  complete: {}", summary.is_complete);
            println!("  pending:  {}", summary.pending);
            println!("  running:  {}", summary.running);
            println!("  done:     {}", summary.complete);
            println!("  failed:   {}", summary.failed);
            println!("  merged:   {}", summary.merged);
        }
        None => println!("no batch recorded"),
    }
    Ok(())
}

fn run_resume(repo: &Path, config: &OrchestratorConfig, state_dir: &Path) -> Result<()> {
    let scheduler = Scheduler::new(repo, config, state_dir, now_ms).context("opening scheduler")?;
    let pending = scheduler.resume_pending().context("resuming batch")?;
    println!("{} task(s) ready to redispatch", pending.len());
    for task in pending {
        println!("  {} — {}", task.task_id, task.objective);
    }
    Ok(())
}

fn run_abandon(repo: &Path, config: &OrchestratorConfig, state_dir: &Path) -> Result<()> {
    let scheduler = Scheduler::new(repo, config, state_dir, now_ms).context("opening scheduler")?;
    scheduler.abandon_pending().context("abandoning batch")?;
    println!("batch abandoned");
    Ok(())
}
