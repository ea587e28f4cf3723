//! TCP TURN relay server.
//!
//! Accepts control connections on one TCP port and gives each client a
//! relay listener that peers connect to. Peer bytes travel to the client as
//! framed data indications; client sends are written to peers raw.
//!
//! # Usage
//!
//! ```bash
//! # Run on default address 0.0.0.0:3478
//! cargo run --bin tcpturn-server
//!
//! # Custom control address and advertised public IP
//! cargo run --bin tcpturn-server -- --bind 127.0.0.1:3478 --public-ip 203.0.113.9
//!
//! # Or via environment variables
//! TCPTURN_BIND=127.0.0.1:3478 TCPTURN_LOG=debug cargo run --bin tcpturn-server
//! ```

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tcpturn_server::config::{ServerCliArgs, ServerConfig};
use tcpturn_server::manager::SessionManager;
use tcpturn_server::resolver::{AddressResolver, LocalInterfaceResolver, StaticResolver};
use tcpturn_server::server;
use tracing_appender::non_blocking::WorkerGuard;

#[tokio::main]
async fn main() {
    let cli = ServerCliArgs::parse();

    // Load config from CLI args + config file + env vars + defaults.
    let config = match ServerConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    let _log_guard = init_logging(&config.log_level, config.log_file.as_deref());

    tracing::info!(addr = %config.bind_addr, "starting tcpturn server");

    let resolver: Box<dyn AddressResolver> = match config.public_ip {
        Some(ip) => Box::new(StaticResolver(Some(ip))),
        None => Box::new(LocalInterfaceResolver::default()),
    };
    let manager = Arc::new(SessionManager::from_resolver(resolver.as_ref()));

    match server::start_server(&config.bind_addr, manager, config.server_options()).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "control server listening");
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "control server task failed");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start control server");
            std::process::exit(1);
        }
    }
}

/// Initialize logging to stdout, or to `file_path` when given.
///
/// Returns a [`WorkerGuard`] for file logging that must be held until
/// shutdown so buffered entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let Some((log_dir, file_name)) = file_path.and_then(|p| Some((p.parent()?, p.file_name()?)))
    else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
        return None;
    };

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}
