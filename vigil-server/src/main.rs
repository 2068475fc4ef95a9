//! `vigild`: boots the scan orchestration engine from configuration, seeds
//! assets and recurring schedules, and runs until interrupted.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vigil_config::{ConfigSource, VigilConfig, validate};
use vigil_core::{EngineEventPayload, Orchestrator};

#[derive(Parser, Debug)]
#[command(name = "vigild")]
#[command(about = "Security scan orchestration daemon")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Configuration file (TOML or JSON). Overrides $VIGIL_CONFIG_PATH.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log filter, e.g. `debug,scan::adapter=trace`. Overrides $RUST_LOG.
    #[arg(long, env = "VIGIL_LOG", global = true)]
    log: Option<String>,

    /// Worker pool size override.
    #[arg(short, long, env = "VIGIL_WORKERS")]
    workers: Option<usize>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the engine (default).
    Serve,
    /// Load and validate the configuration, print the effective settings.
    CheckConfig,
}

fn init_tracing(filter: Option<&str>) {
    let filter = match filter {
        Some(directives) => tracing_subscriber::EnvFilter::new(directives),
        None => tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            // Lifecycle and discovery summaries; per-lease churn stays at trace.
            "info,scan::queue=info,scan::worker=info".into()
        }),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(cli: &Cli) -> anyhow::Result<(VigilConfig, ConfigSource)> {
    let (mut config, source) = match &cli.config {
        Some(path) => (
            VigilConfig::load_from_file(path)?,
            ConfigSource::Explicit(path.clone()),
        ),
        None => VigilConfig::load_from_env()?,
    };
    if let Some(workers) = cli.workers {
        config.orchestrator.worker.pool_size = workers;
    }
    Ok((config, source))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log.as_deref());

    let (config, source) = load_config(&cli).context("failed to load configuration")?;
    info!("configuration loaded from {source}");
    let warnings = validate(&config);
    for warning in &warnings {
        warn!("config: {warning}");
    }

    match cli.command.unwrap_or(Command::Serve) {
        Command::CheckConfig => {
            let rendered =
                toml::to_string_pretty(&config).context("failed to render configuration")?;
            println!("{rendered}");
            if warnings.is_empty() {
                info!("configuration OK");
            }
            Ok(())
        }
        Command::Serve => serve(config).await,
    }
}

async fn serve(config: VigilConfig) -> anyhow::Result<()> {
    let orchestrator = Orchestrator::builder(config.orchestrator.clone())
        .with_modules(config.modules.clone())
        .build()
        .await
        .context("failed to build orchestrator")?;

    seed(&orchestrator, &config).await?;
    spawn_event_log(&orchestrator);

    orchestrator
        .start()
        .await
        .context("failed to start orchestrator")?;
    info!(
        workers = config.orchestrator.worker.pool_size,
        modules = config.modules.len(),
        "vigild running; press ctrl-c to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");
    orchestrator.shutdown().await?;
    Ok(())
}

/// Apply the ignore list, register seed assets and recurring schedules.
async fn seed(orchestrator: &Orchestrator, config: &VigilConfig) -> anyhow::Result<()> {
    for name in &config.ignored {
        if let Err(err) = orchestrator.ignore_asset(name) {
            warn!("skipping ignore entry {name}: {err}");
        }
    }

    for seed in &config.assets {
        match orchestrator.register_asset(seed.kind(), seed.value()).await {
            Ok(asset) => info!(asset_id = %asset.id, kind = %asset.kind, "seeded {}", asset.value),
            Err(err) => warn!("skipping seed asset {}: {err}", seed.value()),
        }
    }

    for schedule in &config.schedules {
        let asset = match orchestrator.register_asset(None, &schedule.asset).await {
            Ok(asset) => asset,
            Err(err) => {
                warn!("skipping schedule for {}: {err}", schedule.asset);
                continue;
            }
        };
        if let Err(err) = orchestrator.register_recurring_schedule(
            asset.id,
            schedule.module.clone(),
            schedule.interval(),
            schedule.priority,
        ) {
            warn!(
                "skipping schedule {} on {}: {err}",
                schedule.module, schedule.asset
            );
        }
    }
    Ok(())
}

/// Surface scan outcomes and new findings in the daemon log.
fn spawn_event_log(orchestrator: &Orchestrator) {
    let mut rx = orchestrator.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => match event.payload {
                    EngineEventPayload::FindingRecorded {
                        finding_id,
                        scan_id,
                        severity,
                        created: true,
                    } => info!(
                        target: "scan::summary",
                        finding_id = %finding_id,
                        scan_id = %scan_id,
                        severity = %severity,
                        "new finding"
                    ),
                    EngineEventPayload::ScanFinished {
                        scan_id,
                        status,
                        failure,
                        warnings,
                    } => info!(
                        target: "scan::summary",
                        scan_id = %scan_id,
                        status = %status,
                        failure = ?failure,
                        warnings,
                        "scan finished"
                    ),
                    _ => {}
                },
                Err(RecvError::Lagged(skipped)) => {
                    warn!(target: "scan::summary", skipped, "event log lagging");
                }
                Err(RecvError::Closed) => {
                    error!(target: "scan::summary", "event bus closed");
                    break;
                }
            }
        }
    });
}
