//! isorpc reference worker.
//!
//! Started by a controller with `ISORPC_ENDPOINT` and `ISORPC_SESSION` in
//! its environment. Connects back, negotiates a transport and serves the
//! demo registry until the controller is done.

mod demo;

use anyhow::{Context, Result};
use clap::Parser;
use isorpc::config::{active_backend, TransportKind};
use isorpc::platform;
use isorpc::worker::{self, WorkerSettings};
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "isorpc-worker")]
#[command(about = "Reference worker process for isorpc")]
struct Args {
    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Transports to accept, comma separated (overrides ISORPC_TRANSPORTS)
    #[arg(long)]
    transports: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Stdout is left alone; logs go to stderr
    let builder = FmtSubscriber::builder()
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact();
    if std::env::var_os(EnvFilter::DEFAULT_ENV).is_some() && !args.debug {
        builder.with_env_filter(EnvFilter::from_default_env()).init();
    } else {
        let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
        builder.with_max_level(log_level).init();
    }

    let mut settings =
        WorkerSettings::from_env().context("worker must be launched by an isorpc controller")?;
    if let Some(list) = &args.transports {
        settings = settings.with_transports(TransportKind::parse_list(list));
    }

    info!(
        "Starting isorpc worker on {} (backend {}, transports {:?})",
        platform::current_platform(),
        active_backend().unwrap_or_else(|| "unknown".to_string()),
        settings.transports
    );

    let registry = demo::registry()?;
    worker::run(registry, settings).await?;

    info!("Worker exiting");
    Ok(())
}
