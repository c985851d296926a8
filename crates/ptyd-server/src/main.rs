//! ptyd-server: pseudo-terminal login daemon.
//!
//! Listens for TCP connections and, for each one, attaches the remote peer
//! to an interactive login shell running on this machine through a
//! pseudo-terminal. The byte stream is the protocol: everything the peer
//! sends becomes terminal input, everything the shell writes goes back out
//! verbatim.

mod config;
mod relay;
mod server;
mod session;

use clap::Parser;
use config::ServerConfig;
use server::PtydServer;
use std::path::PathBuf;
use tracing::{error, info};

/// ptyd-server — pseudo-terminal login daemon
#[derive(Parser, Debug)]
#[command(name = "ptyd-server", version, about = "Pseudo-terminal login daemon")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address
    #[arg(long)]
    bind: Option<String>,

    /// Shell to launch for each session
    #[arg(long)]
    shell: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.ptyd/config.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    // Load server config (file + CLI overrides)
    let config_path = PathBuf::from(&cli.config);
    let server_config = match ServerConfig::load(
        Some(&config_path),
        cli.port,
        cli.bind.as_deref(),
        cli.shell.as_deref(),
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = server_config.port,
        shell = %server_config.session.shell.display(),
        "starting ptyd-server"
    );

    // Bind the listener; a setup failure here is the one error that exits
    // the process.
    let ptyd_server = match PtydServer::bind(server_config).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to set up listener");
            std::process::exit(1);
        }
    };

    // Run until shutdown signal
    tokio::select! {
        result = ptyd_server.run() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    info!("ptyd-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
