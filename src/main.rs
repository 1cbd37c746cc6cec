use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lbd::{Config, Controller};

#[derive(Parser, Debug, Clone)]
#[command(name = "lbd")]
#[command(about = "DNS-based load-balancing daemon")]
#[command(version)]
struct Args {
    /// Set lbd in debug mode.
    #[arg(long)]
    debug: bool,

    /// Start lbd. Accepted for compatibility; lbd always runs to completion
    /// in the foreground once invoked.
    #[arg(long)]
    start: bool,

    /// Stop lbd. Accepted for compatibility; send SIGTERM to actually stop
    /// a running instance.
    #[arg(long)]
    stop: bool,

    /// Reload lbd's configuration. Accepted for compatibility; lbd already
    /// watches its config file and reloads on change.
    #[arg(long)]
    update: bool,

    /// Configuration file path.
    #[arg(long, default_value = "./load-balancing.conf", env = "LBD_CONFIG")]
    config: PathBuf,

    /// Log file path.
    #[arg(long, default_value = "./lbd.log", env = "LBD_LOG")]
    log: PathBuf,

    /// Send log to stdout instead of the log file.
    #[arg(long)]
    stdout: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_tracing(&args);

    tracing::info!("starting lbd");

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, path = %args.config.display(), "failed loading config");
            std::process::exit(1);
        }
    };
    tracing::info!(clusters = config.clusters.len(), "clusters loaded");

    let controller = Controller::new(args.config.clone(), config);
    controller.run(shutdown_signal()).await;

    tracing::info!("lbd stopped");
    Ok(())
}

fn init_tracing(args: &Args) {
    let default_level = if args.debug { "debug" } else { "info" };
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| default_level.to_string());
    let env_filter = tracing_subscriber::EnvFilter::new(log_level);
    let registry = tracing_subscriber::registry().with(env_filter);

    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if args.stdout {
        if log_format == "json" {
            registry.with(tracing_subscriber::fmt::layer().json()).init();
        } else {
            registry.with(tracing_subscriber::fmt::layer()).init();
        }
    } else {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&args.log)
            .expect("unable to open log file");
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::sync::Mutex::new(file)))
            .init();
    }
}

/// Resolves once either Ctrl-C or (on unix) SIGTERM is received. The Go
/// source never actually wired signal handling -- its `main` loop runs an
/// unreachable trailing log line about not being "supposed to stop". Real
/// graceful shutdown is a deliberate improvement here, not a reproduction
/// of that dead code; see DESIGN.md.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed installing Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed installing SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
