//! getput: a line-protocol file transfer server
//!
//! Clients connect over TCP, receive `HELLO`, and then issue:
//! - `GET <file>`: download a file, terminated by a blank line pair
//! - `PUT <file>`: upload a file, ended by the client with a blank line pair
//! - `BYE`: close the session
//!
//! Features:
//! - One isolated task per connection, reclaimed by a background reaper
//! - Address reuse for quick restarts
//! - Configuration via CLI arguments or TOML file

mod config;
mod protocol;
mod reaper;
mod server;
mod session;
mod transfer;
mod worker;

use config::Config;
use server::Server;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration; bad arguments exit here with usage on stderr
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        backlog = config.backlog,
        max_workers = ?config.max_workers,
        threads = ?config.threads,
        shutdown_grace_ms = config.shutdown_grace.as_millis() as u64,
        "Starting getput server"
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(threads) = config.threads {
        builder.worker_threads(threads);
    }
    let runtime = builder.enable_all().build()?;

    runtime.block_on(async {
        let server = Server::bind(&config)?;
        server.run(shutdown_signal()).await
    })?;

    Ok(())
}

/// Resolves on Ctrl-C. If the handler cannot be installed the server runs
/// until killed.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}
