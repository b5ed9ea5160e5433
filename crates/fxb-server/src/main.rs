//! Broker core server entry point.

use anyhow::Result;
use clap::Parser;
use fxb_server::{AppConfig, Application};
use fxb_telemetry::LogFormat;
use tracing::{info, warn};

/// FX/CFD broker core: FIX gateway, tick pipeline, WebSocket hub,
/// matching engine, tick store.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (can also be set via FXB_CONFIG env var)
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = args
        .config
        .or_else(|| std::env::var("FXB_CONFIG").ok())
        .unwrap_or_else(|| "config/default.toml".to_string());

    // Config comes first: it carries the logging filter.
    let config_found = std::path::Path::new(&config_path).exists();
    let config = if config_found {
        AppConfig::from_file(&config_path)?
    } else {
        AppConfig::default()
    };

    fxb_telemetry::init_logging(&config.log_filter, LogFormat::from_env())?;
    info!("starting fxb-server v{}", env!("CARGO_PKG_VERSION"));
    if config_found {
        info!(config_path = %config_path, "configuration loaded");
    } else {
        warn!(config_path = %config_path, "config file missing, using defaults");
    }

    let app = Application::start(config).await?;
    app.run().await
}
