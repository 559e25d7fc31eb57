//! bgproc-server: background process sessions over MCP.
//!
//! Speaks newline-delimited JSON-RPC on stdin/stdout. Each session runs a
//! shell command under a PTY; clients poll its log, send keys or paste
//! text, and kill it. Diagnostics go to stderr so stdout stays protocol-only.

mod config;
mod mcp;
mod server;
mod service;
mod session;

use clap::Parser;
use config::{CliOverrides, ServerConfig};
use mcp::ToolRouter;
use server::McpServer;
use service::SessionService;
use session::PtyDriver;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// How long shutdown waits for killed processes to exit.
const CHILD_EXIT_GRACE: Duration = Duration::from_secs(1);

/// bgproc-server: background process sessions for MCP clients
#[derive(Parser, Debug)]
#[command(name = "bgproc-server", version, about = "Background process sessions over MCP stdio")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "~/.bgproc/config.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Upper bound on a single process operation, in milliseconds
    #[arg(long)]
    driver_timeout_ms: Option<u64>,

    /// Remove finished sessions after this many seconds (0 = never)
    #[arg(long)]
    reap_after: Option<u64>,

    /// Shell used to run session commands
    #[arg(long)]
    shell: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting bgproc-server");

    let overrides = CliOverrides {
        driver_timeout_ms: cli.driver_timeout_ms,
        reap_after_secs: cli.reap_after,
        shell: cli.shell.clone(),
    };
    let config_path = PathBuf::from(&cli.config);
    let config = match ServerConfig::load(Some(&config_path), &overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    info!(
        shell = %config.pty.shell,
        driver_timeout_ms = config.service.driver_timeout.as_millis() as u64,
        max_limit = config.service.max_limit,
        "configuration loaded"
    );

    let driver = Arc::new(PtyDriver::new(config.pty.clone()));
    let service = Arc::new(SessionService::new(driver.clone(), config.service.clone()));

    let reaper = config
        .reap_after
        .map(|retention| tokio::spawn(run_reaper(service.clone(), retention, config.reap_interval)));

    let server = McpServer::new(ToolRouter::new(service.clone()));

    tokio::select! {
        result = server.serve(tokio::io::stdin(), tokio::io::stdout()) => {
            if let Err(e) = result {
                error!(error = %e, "server error");
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    if let Some(handle) = reaper {
        handle.abort();
    }
    service.shutdown().await;
    wait_for_children(&driver, CHILD_EXIT_GRACE).await;
    info!("bgproc-server stopped");
}

/// Give killed children a moment to be reaped before the runtime goes away.
async fn wait_for_children(driver: &PtyDriver, grace: Duration) {
    let deadline = tokio::time::Instant::now() + grace;
    while driver.live_count() > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let remaining = driver.live_count();
    if remaining > 0 {
        warn!(remaining, "processes still running at exit");
    }
}

/// Periodically drop sessions that ended more than `retention` ago.
async fn run_reaper(service: Arc<SessionService>, retention: Duration, every: Duration) {
    info!(retention_secs = retention.as_secs(), "session reaper enabled");
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let removed = service.reap(retention).await;
        if !removed.is_empty() {
            info!(count = removed.len(), "reaped finished sessions");
        }
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
