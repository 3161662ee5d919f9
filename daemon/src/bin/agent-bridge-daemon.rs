// agent-bridge-daemon: local bridge between a coding-agent session and the browser
//
// Responsibilities:
// - Accept agent lifecycle hooks over HTTP (start, log, done, cancel)
// - Drive the single active task through its scripted lifecycle
// - Push every lifecycle event to authorized WebSocket clients
// - Serve focus settings for the browser extension

use anyhow::{Context, Result};
use agent_bridge_lib::bridge::{config::Config, server::Bridge};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "agent_bridge=info";

fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;

    config
        .ensure_dirs()
        .context("Failed to create runtime directory")?;

    if config.is_daemon_running() {
        error!(pid = ?config.read_pid(), "daemon already running");
        std::process::exit(1);
    }

    if config.shared_secret.is_none() {
        warn!("AGENT_BRIDGE_SECRET is not set; non-extension clients are not authenticated");
    }

    let listener = TcpListener::bind(config.listen_addr())
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr()))?;

    // Write PID file
    config.write_pid().context("Failed to write PID file")?;

    info!(
        addr = %config.listen_addr(),
        version = %config.version,
        branch = %config.git_branch,
        "daemon listening"
    );

    let bridge = Bridge::new(&config);
    let result = bridge
        .serve(listener, async {
            // SIGINT/Ctrl-C for graceful shutdown
            if let Err(e) = signal::ctrl_c().await {
                error!(error = %e, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await;

    // Cleanup
    config.remove_pid().ok();

    info!("daemon stopped");
    result
}
