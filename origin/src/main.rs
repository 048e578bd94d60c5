#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use clap::Parser;

use wisp_origin::OriginClient;
use wisp_tunnel::config::{Config, Mode};

#[derive(Parser, Debug)]
#[command(name = "wisp-origin", about = "Tunnel origin node", version)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, env = "WISP_CONFIG")]
    config: PathBuf,

    /// Emit logs as JSON.
    #[arg(long, env = "WISP_LOG_JSON")]
    log_json: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Calling `install_default` only once per process should always succeed");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to create tokio runtime");

    match runtime.block_on(try_main(cli)) {
        Ok(()) => {
            tracing::info!("Goodbye!");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn try_main(cli: Cli) -> Result<()> {
    wisp_logging::setup_global_subscriber(cli.log_json).context("Failed to set up logging")?;

    tracing::info!(
        arch = std::env::consts::ARCH,
        os = std::env::consts::OS,
        version = env!("CARGO_PKG_VERSION"),
        "`wisp-origin` started logging"
    );

    let config = load_config(&cli.config)?;

    if config.mode != Mode::Client {
        bail!("configuration is for mode `{}`, expected `client`", config.mode);
    }

    config.validate().context("Invalid configuration")?;

    if config.psk.is_empty() {
        tracing::warn!(
            "No `psk` configured: the tunnel runs UNENCRYPTED. This is only \
             acceptable for loopback testing."
        );
    }

    let client = Arc::new(OriginClient::new(config)?);

    tokio::select! {
        result = client.run() => result,
        _ = shutdown_signal() => {
            tracing::info!("Received shutdown signal");
            Ok(())
        }
    }
}

fn load_config(path: &PathBuf) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    serde_yaml::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(terminate) => terminate,
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
