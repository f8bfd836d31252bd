//! torbind demo
//!
//! Bootstraps a daemon, publishes a hidden service, and connects back to
//! it through the SOCKS path once the descriptor has propagated.
//!
//! ```bash
//! torbind -d tor-demo -p 10024
//! torbind -b bridges.txt   # with bridge lines from bridges.torproject.org
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use torbind::{ConnectOptions, HiddenServiceSocket, Tor, TorStream};
use tracing::{error, info};

/// torbind - supervised Tor with onion-socket demo
#[derive(Parser, Debug)]
#[command(name = "torbind")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Working directory for the Tor installation
    #[arg(short = 'd', long, default_value = "tor-demo")]
    dir: PathBuf,

    /// Hidden service port
    #[arg(short = 'p', long, default_value_t = 10024)]
    port: u16,

    /// Path to a file with one bridge line per row, as obtainable from
    /// bridges.torproject.org
    #[arg(short = 'b', long)]
    bridges: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    torbind::logging::init();

    let bridges = match &cli.bridges {
        Some(path) => parse_bridge_lines(path)?,
        None => Vec::new(),
    };

    info!("bootstrapping tor in {} (this takes a while)", cli.dir.display());
    Tor::set_default(Tor::start_with(&cli.dir, bridges).await?);
    info!("tor has been bootstrapped");

    let service = HiddenServiceSocket::open(cli.port, "test").await?;
    info!(
        "published {}; waiting for the descriptor upload (up to ~40s)",
        service.socket_addr()
    );

    // It takes a while for a fresh service to become reachable, so adding
    // the listener after publication loses nothing.
    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    service.add_ready_listener(move |socket| {
        info!("hidden service {} is ready", socket.socket_addr());
        tokio::spawn(async move {
            let _ = done_tx.send(connect_back(&socket).await);
        });
    });

    let (_stream, peer) = service.accept().await?;
    info!("{} accepted a connection from {}", service.socket_addr(), peer);

    match done_rx.await {
        Ok(result) => result?,
        Err(_) => error!("connect-back task vanished"),
    }

    if let Some(tor) = Tor::default_instance() {
        tor.shutdown().await?;
    }
    Ok(())
}

/// Reach our own service through the overlay, then show that a closed
/// service stops accepting and that isolated streams still work.
async fn connect_back(socket: &HiddenServiceSocket) -> Result<()> {
    let name = socket.service_name().to_string();
    let port = socket.service_port();

    let stream = TorStream::connect_with(
        &name,
        port,
        ConnectOptions {
            stream_token: Some("demo".to_string()),
            ..ConnectOptions::default()
        },
    )
    .await?;
    info!("connected to {}; closing the service", stream.remote_addr());
    socket.close().await?;

    match TorStream::connect(&name, port).await {
        Ok(_) => error!("unexpectedly reconnected to the closed service"),
        Err(e) => info!("reconnect failed as expected: {}", e),
    }

    // Distinct tokens must not share a circuit.
    for token in ["FOO", "BAR"] {
        let stream = TorStream::connect_with(
            "www.torproject.org",
            80,
            ConnectOptions {
                stream_token: Some(token.to_string()),
                ..ConnectOptions::default()
            },
        )
        .await?;
        info!("isolated stream {} via {}", token, stream.local_addr()?);
    }
    Ok(())
}

fn parse_bridge_lines(path: &std::path::Path) -> Result<Vec<String>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read bridge file {}", path.display()))?;
    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}
