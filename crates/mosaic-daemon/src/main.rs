//! mosaicd - the mosaic collaborative pixel canvas daemon.
//!
//! Boot order: parse arguments, initialize logging, load and validate
//! configuration, build the shared state (which loads the canvas from disk
//! and publishes the initial chunk images), spawn the background flush
//! worker and image sweep, then serve HTTP until shutdown. On shutdown the
//! remaining dirty chunks are flushed synchronously so the accepted-write
//! loss window closes with the process.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use mosaic_core::config::ServiceConfig;
use mosaic_daemon::flush;
use mosaic_daemon::routes;
use mosaic_daemon::state::AppState;

#[derive(Parser, Debug)]
#[command(name = "mosaicd", about = "Collaborative pixel canvas daemon", version)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "mosaic.toml")]
    config: PathBuf,

    /// Bind address override (e.g. "0.0.0.0:3024").
    #[arg(long)]
    bind: Option<String>,

    /// Log level filter (e.g. "info" or "mosaic_core=debug").
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Append logs to a file instead of stdout.
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args)?;

    let mut config = if args.config.exists() {
        ServiceConfig::from_file(&args.config)
            .with_context(|| format!("failed to load {}", args.config.display()))?
    } else {
        info!("No config file found at {:?}, using defaults", args.config);
        ServiceConfig::default()
    };
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }

    let now = Utc::now().timestamp();
    let flush_config = config.flush.clone();
    let bind = config.server.bind.clone();

    let (state, worker) = AppState::build(config, now)?;
    info!(version = state.version, "canvas state ready");

    let worker_handle = tokio::spawn(worker.run());
    tokio::spawn(flush::sweep_loop(
        std::sync::Arc::clone(&state.publisher),
        flush_config,
    ));

    let app = routes::router(state.clone());
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    info!(addr = %bind, "listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

    // Dropping the last sender stops the worker; it drains dirty chunks on
    // the way out, and we sweep once more for anything it missed.
    info!("shutting down, flushing dirty chunks");
    let store = std::sync::Arc::clone(&state.store);
    let publisher = std::sync::Arc::clone(&state.publisher);
    drop(state);
    let _ = worker_handle.await;
    flush::flush_all_dirty(&store, &publisher);

    Ok(())
}

fn init_tracing(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(_) => std::future::pending().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
