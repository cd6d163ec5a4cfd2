//! pkiadmd - the PKI administration daemon.
//!
//! Exit codes: 0 on clean shutdown, 1 when a signal ended the daemon, 2
//! when startup failed (config, database, socket).

use std::fs;
use std::sync::Arc;

use tokio::net::UnixListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{Mutex, Notify};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use pkiadm::config::Config;
use pkiadm::scheduler;
use pkiadm::server::{self, Handler};
use pkiadm::storage::Storage;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    std::process::exit(run().await);
}

async fn run() -> i32 {
    let config = match Config::load() {
        Ok(config) => config,
        Err(err) => {
            error!("could not load config: {err:#}");
            return 2;
        }
    };

    let storage = match Storage::open(config.storage.clone()) {
        Ok(storage) => storage,
        Err(err) => {
            error!("error when loading database: {err}");
            return 2;
        }
    };

    // A stale socket from a crashed run would block the bind.
    if config.path.exists() {
        if let Err(err) = fs::remove_file(&config.path) {
            error!(
                "could not remove existing socket at '{}': {err}",
                config.path.display()
            );
            return 2;
        }
    }
    let listener = match UnixListener::bind(&config.path) {
        Ok(listener) => listener,
        Err(err) => {
            error!("could not open listen socket '{}': {err}", config.path.display());
            return 2;
        }
    };
    info!("listening on '{}'", config.path.display());

    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(stream) => stream,
        Err(err) => {
            error!("could not install signal handler: {err}");
            return 2;
        }
    };
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(err) => {
            error!("could not install signal handler: {err}");
            return 2;
        }
    };

    let storage = Arc::new(Mutex::new(storage));
    let refresh = Arc::new(Notify::new());
    let handler = Arc::new(Handler::new(storage.clone(), refresh.clone()));
    tokio::spawn(scheduler::run(storage, refresh));

    let code = tokio::select! {
        result = server::serve(listener, handler) => {
            // The accept loop only returns on a fatal listener error.
            if let Err(err) = result {
                error!("listener failed: {err}");
            }
            2
        }
        _ = sigint.recv() => {
            info!("initializing shutdown because of signal: SIGINT");
            1
        }
        _ = sigterm.recv() => {
            info!("initializing shutdown because of signal: SIGTERM");
            1
        }
    };

    if let Err(err) = fs::remove_file(&config.path) {
        warn!("could not remove socket at '{}': {err}", config.path.display());
    }
    code
}
