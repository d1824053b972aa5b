use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use stagger::action::CommandAction;
use stagger::config;
use stagger::coordination::redis::create_keydb_pool;
use stagger::coordination::{CoordinationStore, RedisStore};
use stagger::http::{run_http_server, HttpState};
use stagger::metrics::MetricsRegistry;
use stagger::sync::{spawn_staggered, Coordinator, Scheduler};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "stagger", about = "Leaderless staggered job scheduler")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(
        short,
        long,
        env = "STAGGER_CONFIG",
        default_value = "/etc/stagger/config.yaml"
    )]
    config: String,
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

async fn run(cli: Cli) -> Result<()> {
    // ---- Config ----
    let config = config::load_config(&cli.config)?;

    tracing::info!(
        config_path = %cli.config,
        namespace = %config.sync.namespace,
        cadence_secs = config.sync.cadence_secs,
        "starting stagger"
    );

    // ---- Store ----
    let pool = create_keydb_pool(&config.keydb).await?;
    let store: Arc<dyn CoordinationStore> = Arc::new(RedisStore::new(pool));

    // ---- Metrics ----
    let metrics = MetricsRegistry::new();

    // ---- Coordinator + scheduler ----
    let coordinator = Coordinator::new(Arc::clone(&store), config.cadence(), config.sync_config())?
        .with_metrics(metrics.clone());
    tracing::info!(instance = %coordinator.id(), "instance identity established");

    let snapshot = coordinator.snapshot_handle();
    let action = CommandAction::from_config(&config.action)?;
    let scheduler = Scheduler::new(config.cadence(), config.schedule_config(), action)
        .with_metrics(metrics.clone());

    let cancel = CancellationToken::new();

    // ---- HTTP ----
    let http_handle = config.http.as_ref().map(|http| {
        let listen = http.listen.clone();
        let state = HttpState {
            store: Arc::clone(&store),
            snapshot,
            metrics: metrics.clone(),
        };
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = run_http_server(&listen, state, cancel).await {
                tracing::error!(error = %e, "HTTP server failed");
            }
        })
    });

    // ---- Run until shutdown or fatal coordinator error ----
    let mut staggered = spawn_staggered(coordinator, scheduler, cancel.clone());

    let outcome = tokio::select! {
        joined = &mut staggered => joined,
        () = shutdown_signal() => {
            cancel.cancel();
            staggered.await
        }
    };
    cancel.cancel();

    if let Some(handle) = http_handle {
        let _ = handle.await;
    }

    outcome??;
    tracing::info!("stagger shut down cleanly");
    Ok(())
}

#[tokio::main]
async fn main() {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    if let Err(e) = run(cli).await {
        tracing::error!(error = %format!("{e:#}"), "stagger failed");
        std::process::exit(1);
    }
}
