//! Gitway node binary.

use anyhow::Context;
use clap::Parser;
use gitway_backend::{serve_sidechannels, ConnectionCache, GrpcConnector, SidechannelRegistry};
use gitway_node::api::{create_router, AppState};
use gitway_node::auth::StaticAuthorizer;
use gitway_node::config::Config;
use gitway_node::observability::{init_logging, LogFormat};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Gitway - git smart protocol proxy
#[derive(Parser, Debug)]
#[command(name = "gitway-node")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// HTTP listen address
    #[arg(long)]
    listen_addr: Option<SocketAddr>,

    /// Side-channel listen address
    #[arg(long)]
    sidechannel_addr: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Log format (pretty, json)
    #[arg(long)]
    log_format: Option<String>,
}

impl Args {
    fn load_config(&self) -> anyhow::Result<Config> {
        let mut config = if self.config.exists() {
            Config::load(&self.config)?
        } else {
            Config::default()
        };

        if let Some(addr) = self.listen_addr {
            config.listen_addr = addr;
        }
        if let Some(addr) = self.sidechannel_addr {
            config.sidechannel_addr = Some(addr);
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
        if let Some(format) = &self.log_format {
            config.log_format = format.clone();
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = args.load_config()?;

    init_logging(&config.log_level, LogFormat::parse(&config.log_format));
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting gitway node");
    tracing::info!(
        listen_addr = %config.listen_addr,
        backend = %config.backend.address,
        sidechannel_addr = ?config.sidechannel_addr,
        read_deadline_secs = config.read_deadline_secs,
        "node configuration"
    );

    let shutdown = CancellationToken::new();
    let sidechannels = Arc::new(SidechannelRegistry::new(config.sidechannel_address()));

    match config.sidechannel_addr {
        Some(addr) => {
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("binding side-channel listener on {}", addr))?;
            tokio::spawn(serve_sidechannels(
                listener,
                sidechannels.clone(),
                shutdown.clone(),
            ));
        }
        None => tracing::warn!("no side-channel listener configured; upload-pack will fail"),
    }

    let state = AppState {
        config: Arc::new(config.clone()),
        authorizer: Arc::new(StaticAuthorizer::from_config(&config)),
        connections: Arc::new(ConnectionCache::new(Arc::new(GrpcConnector::default()))),
        sidechannels,
        shutdown: shutdown.clone(),
    };

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("binding HTTP listener on {}", config.listen_addr))?;
    tracing::info!(addr = %config.listen_addr, "node is ready");

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
            tracing::info!("shutting down");
            shutdown.cancel();
        })
        .await
        .context("HTTP server failed")?;

    Ok(())
}
