//! Switchyard proxy engine.
//!
//! This binary:
//! - Loads the config from a file, base64 text or raw TOML
//! - Starts the mixed and tunnel listeners
//! - Probes proxy groups in the background
//! - Reloads the persisted config on SIGHUP
//! - Optionally prints engine events as JSON lines

use anyhow::{Context, Result};
use clap::Parser;
use switchyard_engine::config::Cli;
use switchyard_engine::persistence::{resolve_source, ConfigStore};
use switchyard_engine::{AdapterRegistry, Engine, EngineConfig, Snapshot};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing (prefer RUST_LOG, fallback to SWITCHYARD_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| cli.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    if cli.check {
        return check(&cli);
    }

    info!(home = %cli.home.display(), "Starting switchyard");

    let engine = Engine::new();
    engine
        .setup(&cli.home, &cli.config)
        .await
        .context("Failed to start engine")?;

    for (tag, addr) in engine.local_addrs().await? {
        info!(inbound = %tag, bind_addr = %addr, "Listening");
    }

    if cli.events {
        let mut rx = engine.subscribe().await?;
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(envelope) => match envelope.to_json() {
                        Ok(line) => println!("{line}"),
                        Err(e) => warn!(error = %e, "Failed to encode event"),
                    },
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event stream lagged"),
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    wait_for_shutdown(&engine).await;
    engine.stop().await;
    Ok(())
}

/// Parse and validate the config without starting anything.
fn check(cli: &Cli) -> Result<()> {
    let (bytes, kind) = resolve_source(&cli.home, &cli.config).context("Failed to read config")?;
    let config = EngineConfig::from_bytes(&bytes).context("Failed to parse config")?;
    let snapshot = Snapshot::build(&config, &AdapterRegistry::with_builtins(), None)
        .context("Config is invalid")?;
    info!(
        source = ?kind,
        nodes = snapshot.registry().len(),
        groups = snapshot.groups().len(),
        rules = snapshot.table().len(),
        "Config is valid"
    );
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown(engine: &Engine) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "SIGHUP handler unavailable, reload on signal disabled");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                return;
            }
            _ = hangup.recv() => {
                info!("SIGHUP received, reloading config");
                if let Err(e) = reload_from_disk(engine).await {
                    error!(error = %e, "Reload failed, previous config still active");
                }
            }
        }
    }
}

/// Re-read `<home>/config.toml` and apply it.
#[cfg(unix)]
async fn reload_from_disk(engine: &Engine) -> Result<()> {
    let home = engine.home_dir().await?;
    match ConfigStore::new(&home).load()? {
        Some(bytes) => engine.reload_with_config(&bytes).await?,
        None => engine.reload().await?,
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_engine: &Engine) {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown requested");
}
