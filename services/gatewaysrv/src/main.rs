//! Gateway service binary
//!
//! Thin host layer: argument parsing, configuration loading, logging setup,
//! then the gateway runtime until ctrl-c.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use gatewaysrv::config::AppConfig;
use gatewaysrv::error::{GatewaySrvError, Result};
use gatewaysrv::runtime::Gateway;
use gatewaysrv::storage::{ConfigStore, SqliteHistoryStore};

#[derive(Debug, Parser)]
#[command(name = "gatewaysrv", about = "Industrial data-acquisition gateway")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long, env = "GATEWAYSRV_CONFIG")]
    config: Option<PathBuf>,

    /// Override the SQLite database path from the configuration
    #[arg(long, env = "GATEWAYSRV_DB")]
    db: Option<String>,

    /// Override the log level (trace|debug|info|warn|error)
    #[arg(long)]
    log_level: Option<String>,

    /// Validate the configuration and exit
    #[arg(long)]
    validate: bool,
}

fn init_logging(config: &AppConfig, override_level: Option<&str>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let level = override_level.unwrap_or(&config.service.log_level);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("gatewaysrv={level},info")));

    match &config.service.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "gatewaysrv.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::load(args.config.as_deref())?;
    if let Some(db) = args.db {
        config.database.path = db;
    }
    config.validate()?;

    let _log_guard = init_logging(&config, args.log_level.as_deref());

    if args.validate {
        info!("Configuration is valid");
        return Ok(());
    }

    info!(
        service = %config.service.name,
        database = %config.database.path,
        "Starting gateway service"
    );

    let store = ConfigStore::open(&config.database.path).await?;
    let history_store = Arc::new(SqliteHistoryStore::new(store.pool().clone()));

    let gateway = Gateway::start(&config, history_store);
    gateway.load_from_store(&store).await?;

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| GatewaySrvError::internal(format!("signal handler: {e}")))?;
    info!("Ctrl-c received");

    gateway.shutdown().await;
    Ok(())
}
