use anyhow::Result;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ldk_ledger::config::{Config, LoggingConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let (mut config, source) = load_config().await?;
    config.apply_env_overrides();

    init_tracing(&config.logging);

    match source {
        Some(path) => info!("Loaded configuration from: {}", path.display()),
        None => info!("No configuration file found, using defaults"),
    }

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        std::process::exit(1);
    }

    run(config).await
}

#[cfg(feature = "ldk-server")]
async fn run(config: Config) -> Result<()> {
    info!("Starting LDK-Ledger...");
    let app = ldk_ledger::LedgerApp::new(config).await?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received shutdown signal, initiating graceful shutdown...");
                let _ = shutdown_tx.send(());
            }
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
    });

    app.run_with_shutdown(shutdown_rx).await?;

    info!("LDK-Ledger stopped gracefully");
    Ok(())
}

#[cfg(not(feature = "ldk-server"))]
async fn run(_config: Config) -> Result<()> {
    anyhow::bail!("no payment network client available: rebuild with the `ldk-server` feature")
}

/// RUST_LOG takes precedence over `logging.level`
fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);

    match logging.format.as_str() {
        "json" => builder.json().init(),
        "compact" => builder.compact().init(),
        _ => builder.pretty().with_thread_ids(true).init(),
    }
}

/// Load configuration from the first file found, or use defaults
async fn load_config() -> Result<(Config, Option<PathBuf>)> {
    let mut config_paths = vec![
        PathBuf::from("./ldk-ledger.toml"),
        PathBuf::from("/etc/ldk-ledger/ldk-ledger.toml"),
    ];
    if let Some(dir) = dirs::config_dir() {
        config_paths.push(dir.join("ldk-ledger/ldk-ledger.toml"));
    }

    for path in config_paths {
        if path.exists() {
            let content = tokio::fs::read_to_string(&path).await?;
            let config: Config = toml::from_str(&content)?;
            return Ok((config, Some(path)));
        }
    }

    Ok((Config::default(), None))
}
