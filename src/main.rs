//! kvgate: a memcached text protocol front end for a key-value store
//!
//! Supported commands:
//! - set, add
//! - get, gets
//! - delete
//! - ping, quit
//!
//! Features:
//! - Incremental parsing of requests split across any number of reads
//! - Pipelined commands answered in order
//! - Per-command read and write deadlines
//! - Graceful shutdown on SIGINT/SIGTERM
//! - Optional statsd metrics
//! - Configuration via CLI arguments or TOML file

mod config;
mod metrics;
mod protocol;
mod server;
mod store;

use config::Config;
use metrics::{Metrics, NullMetrics, StatsdMetrics};
use server::Server;
use std::error::Error;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use store::MemoryStore;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    // Load configuration
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("kvgate: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Fatal error");
            ExitCode::FAILURE
        }
    }
}

/// Build the worker pool and serve until a shutdown signal arrives.
fn run(config: Config) -> Result<(), Box<dyn Error>> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.threads)
        .thread_name("kvgate-worker")
        .enable_all()
        .build()?;

    runtime.block_on(serve(config))
}

async fn serve(config: Config) -> Result<(), Box<dyn Error>> {
    info!(
        listen = %config.listen,
        threads = config.threads,
        max_memory_mb = config.storage.max_memory / 1024 / 1024,
        ttl = config.storage.ttl,
        statsd = ?config.statsd,
        "Starting kvgate server"
    );

    let metrics: Arc<dyn Metrics> = match config.statsd {
        Some(addr) => {
            let statsd = StatsdMetrics::connect(addr, &config.metrics_prefix)
                .await
                .map_err(|e| format!("failed to open statsd socket for {addr}: {e}"))?;
            tokio::spawn(Arc::clone(&statsd).run(config.metrics_interval));
            statsd
        }
        None => NullMetrics::shared(),
    };

    let store = MemoryStore::new(&config.storage, Arc::clone(&metrics));
    store.register_gauges();
    tokio::spawn(
        Arc::clone(&store).run_cleanup(Duration::from_secs(config.storage.cleanup_interval)),
    );

    let listener = server::bind(config.listen)
        .map_err(|e| format!("failed to bind {}: {e}", config.listen))?;

    Server::new(Some(store), metrics, config.connection)
        .serve(listener, server::shutdown_signal())
        .await;

    Ok(())
}
