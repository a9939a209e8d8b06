use anyhow::Result;
use clap::{Parser, Subcommand};
use gatekeeper::{Config, Gatekeeper};
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "gatekeeper", version, about = "Webhook delivery worker and store health check")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sweep pending deliveries and expired entries every SWEEP_INTERVAL_SECS until interrupted
    Run,
    /// Run a single sweep
    Sweep,
    /// Ping the store; exits non-zero when it is unreachable
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let config = Config::from_env()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("gatekeeper={}", config.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let gatekeeper = Gatekeeper::from_config(&config)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start: {}", e))?;

    match cli.command {
        Command::Run => run(&gatekeeper, &config).await,
        Command::Sweep => {
            let report = gatekeeper.sweep().await?;
            tracing::info!(?report, "Sweep complete");
            Ok(())
        }
        Command::Check => {
            let health = gatekeeper.health_check().await;
            tracing::info!(
                backend = %health.backend,
                status = %health.status,
                response_time_ms = health.store.response_time_ms,
                "Store health"
            );
            if !health.is_healthy() {
                anyhow::bail!(
                    "Store is unavailable: {}",
                    health.store.error.unwrap_or_default()
                );
            }
            Ok(())
        }
    }
}

async fn run(gatekeeper: &Gatekeeper, config: &Config) -> Result<()> {
    tracing::info!(
        backend = gatekeeper.backend(),
        interval_secs = config.sweep_interval_secs,
        "Starting delivery worker"
    );

    let mut ticker = tokio::time::interval(config.sweep_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                if let Err(e) = gatekeeper.sweep().await {
                    tracing::error!(error = %e, "Sweep failed");
                }
            }
        }
    }

    tracing::info!("Delivery worker stopped");
    Ok(())
}

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
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        },
    }
}
