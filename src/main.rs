//! Switchboard CLI entry point.
//!
//! Subcommands:
//! - `switchboard serve`: run the gateway (HTTP API + tenant sessions)
//! - `switchboard check`: validate config and database, list resumable tenants

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{info, warn};

use switchboard::api::{self, AppState};
use switchboard::config::Config;
use switchboard::events::MediaStore;
use switchboard::protocol::bridge::BridgeProvider;
use switchboard::session::SessionController;
use switchboard::tenants::{TenantCache, TenantStore};
use switchboard::webhook::WebhookDispatcher;

/// How long shutdown waits for sessions to disconnect.
const SHUTDOWN_GRACE_SECS: u64 = 10;

/// Multi-tenant messaging gateway.
#[derive(Parser)]
#[command(name = "switchboard", version, about)]
struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Run the gateway.
    Serve {
        /// Path to config.toml.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Validate configuration and database, then list tenants that would resume.
    Check {
        /// Path to config.toml.
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A .env file is optional.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve { config } => handle_serve(config).await,
        Command::Check { config } => handle_check(config).await,
    }
}

/// Run the gateway until SIGINT/SIGTERM.
async fn handle_serve(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let config = Config::load(config_path.as_deref()).context("failed to load configuration")?;
    let _logging_guard =
        switchboard::logging::init_production(&config.logging.dir, &config.logging.level)?;

    let store = TenantStore::open(&config.storage.database).await?;
    let cache = Arc::new(TenantCache::new(store));
    let dispatcher =
        WebhookDispatcher::new(&config.webhook).context("failed to build webhook client")?;
    let identities = Arc::new(BridgeProvider::new(
        &config.bridge.url,
        Duration::from_secs(config.bridge.poll_timeout_secs),
    ));
    let media = MediaStore::new(&config.storage.files_dir);

    let sessions = Arc::new(SessionController::new(
        cache,
        identities,
        dispatcher,
        media,
        Duration::from_secs(config.session.connect_grace_secs),
    ));

    let resumed = sessions
        .resume_connected()
        .await
        .context("failed to list connected tenants")?;
    info!(resumed, "resumed persisted sessions");

    let app = api::router(AppState::new(Arc::clone(&sessions)));
    let listener = TcpListener::bind(&config.server.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.server.listen))?;
    info!(listen = %config.server.listen, "switchboard ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("shutting down");
    sessions
        .shutdown_all(Duration::from_secs(SHUTDOWN_GRACE_SECS))
        .await;
    Ok(())
}

/// Validate config and database.
async fn handle_check(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    switchboard::logging::init_cli();

    let config = Config::load(config_path.as_deref()).context("failed to load configuration")?;
    info!(
        listen = %config.server.listen,
        database = %config.storage.database.display(),
        files_dir = %config.storage.files_dir.display(),
        bridge = %config.bridge.url,
        "configuration ok"
    );

    let store = TenantStore::open(&config.storage.database).await?;
    let tenants = store
        .connected_tenants()
        .await
        .context("failed to list connected tenants")?;
    info!(count = tenants.len(), "database ok");
    for tenant in tenants {
        info!(
            tenant_id = tenant.id,
            name = %tenant.name,
            events = ?tenant.events,
            paired = tenant.network_identity.is_some(),
            "would resume"
        );
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("received SIGINT"),
                    _ = sigterm.recv() => info!("received SIGTERM"),
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to register SIGTERM handler");
                let _ = ctrl_c.await;
                info!("received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        info!("received SIGINT");
    }
}
