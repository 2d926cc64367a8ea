use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::info;

use ratekeeper::config::{RatekeeperConfig, StoreBackend};
use ratekeeper::grpc::GrpcServer;
use ratekeeper::logging;
use ratekeeper::ratelimit::{CounterStore, MemoryStore, RateLimiter, RedisStore};

#[derive(Parser)]
#[command(name = "ratekeeper", version, about = "Fixed-window rate limiting service")]
struct Cli {
    /// YAML configuration file; RATEKEEPER__* environment variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gRPC rate limit service (default)
    Serve {
        /// Override the configured listen address
        #[arg(long)]
        grpc_addr: Option<std::net::SocketAddr>,
    },
    /// Print the effective rate limit profiles as JSON
    Profiles,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = RatekeeperConfig::load(cli.config.as_deref())?;

    match cli.command.unwrap_or(Command::Serve { grpc_addr: None }) {
        Command::Profiles => {
            let profiles = config.profile_set()?;
            println!("{}", serde_json::to_string_pretty(&profiles)?);
            Ok(())
        }
        Command::Serve { grpc_addr } => {
            if let Some(addr) = grpc_addr {
                config.server.grpc_addr = addr;
            }
            serve(config).await
        }
    }
}

async fn serve(config: RatekeeperConfig) -> anyhow::Result<()> {
    logging::init(&config.logging)?;

    info!("Starting Ratekeeper Rate Limiting Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let profiles = Arc::new(config.profile_set()?);
    info!(
        grpc_addr = %config.server.grpc_addr,
        backend = ?config.store.backend,
        profiles = profiles.len(),
        "Configuration loaded"
    );

    let store: Arc<dyn CounterStore> = match config.store.backend {
        StoreBackend::Redis => Arc::new(RedisStore::connect(&config.store.redis_url).await?),
        StoreBackend::Memory => {
            let store = Arc::new(MemoryStore::new());
            spawn_sweeper(store.clone(), config.store.sweep_interval());
            store as Arc<dyn CounterStore>
        }
    };

    let rate_limiter = Arc::new(
        RateLimiter::new(store)
            .with_identity_policy(config.identity.clone())
            .with_timeout(config.store.timeout()),
    );
    info!("Rate limiter initialized");

    let grpc_server = GrpcServer::new(config.server.grpc_addr, rate_limiter, profiles);

    // Run the server with graceful shutdown on Ctrl+C
    grpc_server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Ratekeeper Rate Limiting Service stopped");
    Ok(())
}

/// Periodically drop expired in-memory counters.
fn spawn_sweeper(store: Arc<MemoryStore>, every: std::time::Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let purged = store.purge_expired();
            if purged > 0 {
                tracing::debug!(purged = purged, remaining = store.len(), "Swept expired counters");
            }
        }
    });
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
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
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
