//! shadowd
//!
//! Hosts the shadow comparison runtime and its operator API.
//!
//! Usage:
//!   shadowd --port 9095 --config shadow_compare.toml
//!
//! Environment:
//!   SHADOWD_PORT - HTTP port (default: 9095)
//!   SHADOW_CONFIG_PATH - TOML settings file (default: shadow_compare.toml)
//!   SHADOW_EXPORT_PATH - Final metrics export written on shutdown (optional)
//!   SHADOW_COMPARE_ENABLED - Enable comparison for operations without explicit config

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shadow_compare::api::create_router;
use shadow_compare::shadow::{ShadowRuntime, ShadowSettings};

#[derive(Parser, Debug)]
#[command(name = "shadowd")]
#[command(about = "Shadow comparison runtime with operator metrics API")]
struct Args {
    /// HTTP port for the operator API
    #[arg(long, env = "SHADOWD_PORT", default_value = "9095")]
    port: u16,

    /// Settings file (TOML); falls back to SHADOW_CONFIG_PATH, then shadow_compare.toml
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write the final metrics export here on shutdown
    #[arg(long, env = "SHADOW_EXPORT_PATH")]
    export_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let args = Args::parse();
    let settings = load_settings(&args)?;

    info!("Starting shadowd");
    info!("  Config: {:?}", args.config);
    info!("  Operations configured: {}", settings.operations.len());
    info!("  Export path: {:?}", settings.export_path);

    let runtime = Arc::new(ShadowRuntime::start(settings));
    let app = create_router(runtime.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Operator API listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    if let Err(e) = runtime.shutdown().await {
        warn!("Shutdown export failed: {:#}", e);
    }

    info!("shadowd stopped");
    Ok(())
}

fn load_settings(args: &Args) -> Result<ShadowSettings> {
    // An explicit --config must load; the environment lookup may fall back to defaults
    let mut settings = match &args.config {
        Some(path) => ShadowSettings::load(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => ShadowSettings::from_env(),
    };

    if let Some(path) = &args.export_path {
        settings.export_path = Some(path.clone());
    }

    Ok(settings)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shadow_compare=info,shadowd=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
