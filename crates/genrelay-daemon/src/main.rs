//! genrelay daemon
//!
//! Runs `claude` generations in the background and serves their event logs
//! over HTTP/SSE to browsers and the `genrelay` CLI.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use genrelay_core::config::{self, Config};
use genrelay_daemon::relay::GenerationRelay;
use genrelay_daemon::server;
use genrelay_daemon::storage::Database;

#[derive(Parser, Debug)]
#[command(name = "genrelay-daemon")]
#[command(version, about = "genrelay daemon - streams claude generations over SSE")]
struct Args {
    /// TCP bind address (overrides the config file)
    #[arg(long, env = "GENRELAY_ADDR")]
    addr: Option<SocketAddr>,

    /// Project directory holding `.genrelay/settings.json`
    #[arg(long, env = "GENRELAY_PROJECT_DIR")]
    project_dir: Option<PathBuf>,

    /// Database file path
    #[arg(long, env = "GENRELAY_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Maximum generations running at once
    #[arg(long, env = "GENRELAY_MAX_GENERATIONS")]
    max_generations: Option<usize>,

    /// Path to the `claude` CLI binary
    #[arg(long, env = "GENRELAY_CLAUDE_BIN")]
    claude_bin: Option<PathBuf>,

    /// Seconds to wait for graceful subprocess shutdown before SIGKILL.
    #[arg(long, env = "GENRELAY_TERMINATE_TIMEOUT")]
    terminate_timeout: Option<u64>,

    /// Log level filter for the daemon (e.g. "info", "debug", "warn").
    #[arg(long, env = "GENRELAY_LOG_LEVEL")]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "GENRELAY_LOG_JSON")]
    log_json: bool,
}

impl Args {
    /// Flags given on the command line win over every config layer.
    fn apply(&self, config: &mut Config) {
        let relay = &mut config.relay;
        if let Some(addr) = self.addr {
            relay.addr = addr;
        }
        if let Some(path) = &self.db_path {
            relay.database_path = Some(path.clone());
        }
        if let Some(max) = self.max_generations {
            relay.max_generations = max;
        }
        if let Some(bin) = &self.claude_bin {
            relay.claude_bin.clone_from(bin);
        }
        if let Some(secs) = self.terminate_timeout {
            relay.terminate_timeout_secs = secs;
        }
        if let Some(level) = &self.log_level {
            relay.log_level.clone_from(level);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let project_dir = match &args.project_dir {
        Some(dir) => Some(dir.clone()),
        None => std::env::current_dir().ok(),
    };
    let mut config = config::load_config(project_dir.as_deref())?;
    args.apply(&mut config);

    let log_filter = format!("genrelay_daemon={}", config.relay.log_level);
    genrelay_core::tracing_init::init_tracing(&log_filter, args.log_json);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.relay.addr,
        max_generations = config.relay.max_generations,
        claude_bin = %config.relay.claude_bin.display(),
        "Starting genrelay-daemon"
    );

    let db_path = match &config.relay.database_path {
        Some(path) => path.clone(),
        None => default_db_path()?,
    };
    info!(path = %db_path.display(), "Opening database");
    let db = Database::open(&db_path).await?;

    let addr = config.relay.addr;
    let sweep_interval = config.relay.sweep_interval();
    let relay = Arc::new(GenerationRelay::new(config, Arc::new(db)));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let sweeper = relay
        .registry()
        .spawn_sweeper(sweep_interval, shutdown_rx.clone());
    let mut server_handle = tokio::spawn(server::serve(addr, Arc::clone(&relay), shutdown_rx));

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    // Notify systemd that the daemon is ready to serve (unix only).
    // The `true` parameter unsets $NOTIFY_SOCKET so claude subprocesses
    // don't accidentally notify systemd.
    #[cfg(unix)]
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;

    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    let mut server_done = false;
    tokio::select! {
        result = &mut server_handle => {
            server_done = true;
            result??;
            info!("HTTP server exited");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    // Finish in-flight generations first so open SSE streams can close.
    relay.shutdown().await;
    let _ = shutdown_tx.send(true);
    if !server_done {
        server_handle.await??;
    }
    let _ = sweeper.await;

    info!("Daemon stopped");
    Ok(())
}

/// Default database path: the config home, else ~/.genrelay/transcripts.db
fn default_db_path() -> anyhow::Result<PathBuf> {
    if let Some(path) = config::database_path() {
        return Ok(path);
    }
    let home =
        dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Cannot determine home directory"))?;
    Ok(home.join(".genrelay").join("transcripts.db"))
}
