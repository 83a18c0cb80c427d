/*!
 * Warp Client CLI
 *
 * Command-line front end for the session core: connect to a terminal-control
 * endpoint and stream its events as JSON lines until interrupted.
 */

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::EnvFilter;

use warp_client::{shutdown, SessionConfig, WarpSession};

#[derive(Parser)]
#[command(name = "warp_cli")]
#[command(about = "Warp Client - terminal-control session tool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the endpoint and print events until Ctrl-C
    Connect {
        /// WebSocket endpoint (overrides config and WARP_ENDPOINT)
        #[arg(short, long)]
        endpoint: Option<String>,

        /// Auth token (falls back to WARP_TOKEN)
        #[arg(short, long)]
        token: Option<String>,

        /// Config file to load (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Listener shutdown timeout in milliseconds
        #[arg(long)]
        shutdown_timeout_ms: Option<u64>,
    },

    /// Show version information
    Version,
}

const PRINTED_EVENTS: &[&str] = &[
    "connected",
    "connection_error",
    "command_response",
    "agent_message",
    "file_update",
    "websocket_message",
];

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warp_client=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Connect {
            endpoint,
            token,
            config,
            shutdown_timeout_ms,
        } => run_connect(endpoint, token, config, shutdown_timeout_ms).await,
        Commands::Version => {
            println!("warp_cli v{}", env!("CARGO_PKG_VERSION"));
            println!("Warp Client session tool");
            Ok(())
        }
    }
}

async fn run_connect(
    endpoint: Option<String>,
    token: Option<String>,
    config_path: Option<PathBuf>,
    shutdown_timeout_ms: Option<u64>,
) -> Result<()> {
    let mut config = match config_path {
        Some(path) => SessionConfig::load(&path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => SessionConfig::default(),
    }
    .apply_env();

    if let Some(endpoint) = endpoint {
        config.endpoint = endpoint;
    }
    if let Some(timeout) = shutdown_timeout_ms {
        config.shutdown_timeout_ms = timeout;
    }

    let token = match token.or_else(|| std::env::var("WARP_TOKEN").ok()) {
        Some(token) if !token.is_empty() => token,
        _ => bail!("no token provided; pass --token or set WARP_TOKEN"),
    };

    let session = WarpSession::with_config(config, token);
    shutdown::install_handlers();

    for event in PRINTED_EVENTS {
        let name = *event;
        session.on(name, move |data| {
            println!("{}", json!({ "event": name, "data": data }));
        });
    }

    // Exit when the server drops us, not only on Ctrl-C.
    let (closed_tx, mut closed_rx) = tokio::sync::mpsc::channel::<()>(1);
    session.on("disconnected", move |_data| {
        let _ = closed_tx.try_send(());
    });

    session.connect().await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            shutdown::begin();
        }
        _ = closed_rx.recv() => {}
    }

    session.disconnect().await;
    print_summary(&session);
    Ok(())
}

fn print_summary(session: &Arc<WarpSession>) {
    let status = session.status();
    let summary = json!({
        "event": "summary",
        "state": status.state,
        "metrics": session.metrics(),
    });
    println!("{summary}");
}
