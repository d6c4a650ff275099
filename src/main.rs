#![deny(clippy::all)]
#![warn(clippy::pedantic)]

//! # edgeterm
//!
//! Remote terminal tunnel agent for Linux edge devices.
//!
//! edgeterm dials a single outbound WebSocket to a cloud controller and
//! multiplexes interactive shell sessions over it: the peer starts sessions,
//! streams keystrokes in, receives shell output back, resizes the PTY, and
//! ends sessions — all as JSON envelopes on one tunnel. The connection
//! reconnects automatically with exponential backoff.
//!
//! ## Architecture
//!
//! ```text
//! main.rs              — entry point, CLI, logging init, graceful shutdown
//! config.rs            — JSON config file loading and validation
//! terminal/
//!   mod.rs             — Terminal (PTY spawn, output pump, write/resize, teardown)
//! tunnel/
//!   mod.rs             — module root, reconnect backoff
//!   envelope.rs        — envelope codec with strict validation
//!   registry.rs        — sessionID → Terminal map
//!   socket.rs          — WebSocket transport, socket events
//!   client.rs          — tunnel controller, dispatch, reconnect loop
//! ```

use clap::Parser;
use tracing::info;

use edgeterm::{Config, Tunnel};

/// Remote terminal tunnel agent for Linux edge devices.
#[derive(Parser)]
#[command(name = "edgeterm", version)]
struct Cli {
    /// Path to the JSON config file.
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let Some(config_path) = cli.config else {
        eprintln!("edgeterm: no config file provided, use --config <path>");
        std::process::exit(1);
    };
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("edgeterm: {e}");
            std::process::exit(1);
        }
    };

    // JSON Lines to stdout; RUST_LOG wins over the config level.
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_filter().to_string());
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(log_filter)
        .init();

    info!("edgeterm v{} starting", env!("CARGO_PKG_VERSION"));
    info!(cloud = %config.cloud, command = %config.command, "configuration loaded");

    let tunnel = Tunnel::new(config);
    let runner = tunnel.clone();
    let run_task = tokio::spawn(async move { runner.run().await });

    wait_for_interrupt().await;

    info!("interrupt received, shutting down");
    tunnel.close().await;
    let _ = run_task.await;
    info!("goodbye");
}

/// Wait for SIGINT or SIGTERM.
async fn wait_for_interrupt() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM");
        tokio::select! {
            _ = ctrl_c => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("received SIGINT");
    }
}
