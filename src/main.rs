use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use leasegate::config::{self, Config};
use leasegate::coordination::locks::LeaseOutcome;
use leasegate::coordination::memory::{LocalBus, MemoryStore};
use leasegate::coordination::pubsub::{KeyDbBus, MessageBus};
use leasegate::coordination::redis::{create_keydb_pool, KeyDbStore};
use leasegate::coordination::store::SharedStore;
use leasegate::coordination::{node, Coordinator};
use leasegate::health::{self, HealthState};
use leasegate::metrics::MetricsRegistry;
use leasegate::LeaseKey;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "leasegate", about = "Lease-based row coordination over KeyDB")]
struct Cli {
    /// Path to the YAML configuration file.  Defaults apply when omitted.
    #[arg(short, long, env = "LEASEGATE_CONFIG")]
    config: Option<String>,

    /// Use an in-process store and bus instead of KeyDB.
    #[arg(long)]
    in_memory: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Listen for lease timeouts and serve /healthz and /metrics.
    Serve,
    /// Acquire a lease, waiting out contention (force-acquires if stuck).
    Acquire { class: String, id: String },
    /// Release a lease.
    Release { class: String, id: String },
    /// Print the current holder of a lease.
    Holder { class: String, id: String },
}

// ---------------------------------------------------------------------------
// Backends
// ---------------------------------------------------------------------------

async fn build_backends(
    config: &Config,
    in_memory: bool,
) -> Result<(Arc<dyn SharedStore>, Arc<dyn MessageBus>)> {
    if in_memory {
        tracing::warn!("using in-process store and bus; leases are not shared");
        return Ok((Arc::new(MemoryStore::new()), Arc::new(LocalBus::new())));
    }
    let pool = create_keydb_pool(&config.keydb).await?;
    Ok((
        Arc::new(KeyDbStore::new(pool.clone())),
        Arc::new(KeyDbBus::new(pool)),
    ))
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn serve(config: &Config, coordinator: Arc<Coordinator>, metrics: MetricsRegistry) -> Result<()> {
    let listener_handle = coordinator
        .start()
        .await
        .context("failed to subscribe to lease timeout topic")?;

    let app = health::create_router(HealthState {
        coordinator: Arc::clone(&coordinator),
        metrics,
    });

    let listen_addr: std::net::SocketAddr = config
        .server
        .http_listen
        .parse()
        .context("invalid http_listen address")?;

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, node_id = %coordinator.node_id(), "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    listener_handle.abort();
    Ok(())
}

async fn run_command(
    command: Command,
    config: &Config,
    coordinator: Arc<Coordinator>,
    metrics: MetricsRegistry,
) -> Result<()> {
    match command {
        Command::Serve => serve(config, coordinator, metrics).await,
        Command::Acquire { class, id } => {
            let key = LeaseKey::new(class, id);
            let outcome = coordinator.leases.acquire_with_outcome(&key).await?;
            match outcome {
                LeaseOutcome::Granted { attempts } => {
                    println!("acquired {key} after {attempts} attempt(s)")
                }
                LeaseOutcome::Forced => println!("force-acquired {key}: previous holder stuck"),
            }
            Ok(())
        }
        Command::Release { class, id } => {
            let key = LeaseKey::new(class, id);
            coordinator.leases.release(&key).await?;
            println!("released {key}");
            Ok(())
        }
        Command::Holder { class, id } => {
            let key = LeaseKey::new(class, id);
            match coordinator.leases.holder(&key).await? {
                Some(holder) => println!("{key} held by {holder}"),
                None => println!("{key} is free"),
            }
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
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

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match cli.config.as_deref() {
        Some(path) => config::load_config(path)?,
        None => {
            let config = Config::default();
            config::validate_config(&config)?;
            config
        }
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let node_id = node::node_id();
    tracing::info!(config_path = ?cli.config, %node_id, "starting leasegate");

    let metrics = MetricsRegistry::new();
    let (store, bus) = build_backends(&config, cli.in_memory).await?;
    let coordinator = Arc::new(Coordinator::new(
        store,
        bus,
        &config,
        node_id,
        metrics.clone(),
    ));

    run_command(cli.command, &config, coordinator, metrics).await?;

    tracing::info!("leasegate shut down cleanly");
    Ok(())
}
