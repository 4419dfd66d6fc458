use anyhow::{Context, Result, bail};
use clap::Parser;
use cmdtrack::{
    CommandEngine, CommandKind, CommandStatus, EngineConfig, EngineEvent, InMemoryGateway,
    SchedulerState,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cmdtrack-sim")]
#[command(about = "Drive the command tracking engine against a simulated control plane")]
struct Cli {
    /// Number of applications to sync
    #[arg(long, default_value_t = 3)]
    applications: usize,

    /// Number of deployments to cancel
    #[arg(long, default_value_t = 1)]
    cancels: usize,

    /// Dispatch a second cancel for every deployment before the first resolves
    #[arg(long)]
    retry_cancels: bool,

    #[arg(long, default_value_t = 500)]
    poll_interval_ms: u64,

    /// Fetches a command needs before the simulator resolves it
    #[arg(long, default_value_t = 2)]
    resolve_after: u32,

    /// Every n-th command fails instead of succeeding (0 disables)
    #[arg(long, default_value_t = 0)]
    fail_every: usize,

    /// Abandon commands that take longer than this to resolve
    #[arg(long)]
    resolution_timeout_ms: Option<u64>,

    /// Give up waiting for the scheduler to go idle after this long
    #[arg(long, default_value_t = 30_000)]
    deadline_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    run(cli).await
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = EngineConfig::new().poll_interval(Duration::from_millis(cli.poll_interval_ms));
    if let Some(timeout_ms) = cli.resolution_timeout_ms {
        config = config.resolution_timeout(Duration::from_millis(timeout_ms));
    }

    let gateway = InMemoryGateway::new();
    gateway
        .auto_resolve_after(cli.resolve_after, CommandStatus::Succeeded)
        .await;
    let engine = CommandEngine::start(config, Arc::new(gateway.clone()))
        .await
        .context("starting engine")?;

    let mut events = engine.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                EngineEvent::PendingChanged(change) => {
                    println!(
                        "{:<24} {:<40} pending={}",
                        change.kind, change.entity_id, change.pending
                    );
                }
                EngineEvent::CommandResolved(command) => {
                    println!(
                        "{:<24} {:<40} -> {}",
                        command.kind, command.id, command.status
                    );
                }
                EngineEvent::FetchFailed { command_id, error, .. } => {
                    println!("fetch failed for {}: {}", command_id, error);
                }
                EngineEvent::SchedulerStateChanged(SchedulerState::Idle) => break,
                EngineEvent::SchedulerStateChanged(_) | EngineEvent::CommandEvicted(_) => {}
            }
        }
    });

    let mut targets = Vec::new();
    for i in 0..cli.applications {
        targets.push((CommandKind::SyncApplication, format!("app-{}", i + 1)));
    }
    for i in 0..cli.cancels {
        let deployment = format!("dep-{}", i + 1);
        targets.push((CommandKind::CancelDeployment, deployment.clone()));
        if cli.retry_cancels {
            targets.push((CommandKind::CancelDeployment, deployment));
        }
    }
    if targets.is_empty() {
        bail!("nothing to dispatch; pass --applications or --cancels");
    }

    for (n, (kind, entity)) in targets.iter().enumerate() {
        let command = engine
            .dispatch_as(*kind, entity, json!({ "sync_strategy": "AUTO" }), "cmdtrack-sim")
            .await
            .with_context(|| format!("dispatching {} for {}", kind, entity))?;

        if cli.fail_every > 0 && (n + 1) % cli.fail_every == 0 {
            gateway
                .resolve_after(&command.id, cli.resolve_after, CommandStatus::Failed)
                .await?;
        }
    }

    tokio::time::timeout(Duration::from_millis(cli.deadline_ms), printer)
        .await
        .context("scheduler did not go idle before the deadline")?
        .context("event printer task failed")?;

    let stats = engine.stats().await;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    engine.shutdown().await?;
    Ok(())
}
