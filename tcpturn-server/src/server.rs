//! Control server: accepts client control connections and drives them.
//!
//! Each control connection gets a reader task that decodes frames and hands
//! them to the [`dispatcher`], and a writer task that drains the
//! connection's [`ControlChannel`]. When either side ends (EOF, read error,
//! oversized frame, idle timeout, or a failed write) the other is aborted
//! and the connection's session is removed from the [`SessionManager`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tcpturn_proto::codec;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

use crate::control::{ControlChannel, ControlReceiver, Outbound};
use crate::dispatcher;
use crate::manager::SessionManager;

/// Default reader inactivity before a control connection is dropped.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Default period of the stats log line.
pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Runtime knobs of the control server.
#[derive(Debug, Clone, Copy)]
pub struct ServerOptions {
    /// Close a control connection after this long without a frame.
    pub idle_timeout: Duration,
    /// Log session statistics this often; `None` disables the log line.
    pub stats_interval: Option<Duration>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            stats_interval: Some(DEFAULT_STATS_INTERVAL),
        }
    }
}

/// Drives one control connection until it ends, then tears down its
/// session.
pub async fn handle_connection(
    stream: TcpStream,
    remote: SocketAddr,
    manager: Arc<SessionManager>,
    idle_timeout: Duration,
) {
    let (control, mut rx) = ControlChannel::new(remote);
    let control_id = control.id();
    tracing::info!(control_id = %control_id, remote = %remote, "control connection opened");

    let (mut reader, writer) = stream.into_split();

    let mut write_task = tokio::spawn(async move {
        write_loop(writer, &mut rx).await;
    });

    let reader_manager = Arc::clone(&manager);
    let mut read_task = tokio::spawn(async move {
        loop {
            let frame = match tokio::time::timeout(idle_timeout, codec::read_frame(&mut reader)).await
            {
                Ok(Ok(Some(frame))) => frame,
                Ok(Ok(None)) => {
                    tracing::debug!(control_id = %control.id(), "control connection closed by client");
                    break;
                }
                Ok(Err(e)) => {
                    tracing::warn!(control_id = %control.id(), error = %e, "control read failed");
                    break;
                }
                Err(_) => {
                    tracing::info!(control_id = %control.id(), "control connection idle, closing");
                    break;
                }
            };
            match codec::decode(&frame) {
                Ok(msg) => dispatcher::dispatch(&control, &reader_manager, msg),
                Err(e) => {
                    tracing::warn!(control_id = %control.id(), error = %e, "skipping undecodable message");
                }
            }
        }
    });

    // Wait for either task to finish, then abort the other.
    tokio::select! {
        _ = &mut read_task => {
            write_task.abort();
        }
        _ = &mut write_task => {
            read_task.abort();
        }
    }

    manager.remove_binding(control_id);
    tracing::info!(control_id = %control_id, "control connection closed");
}

async fn write_loop(
    mut writer: tokio::net::tcp::OwnedWriteHalf,
    rx: &mut ControlReceiver,
) {
    while let Some(out) = rx.recv().await {
        let result = match out {
            Outbound::Message(msg) => codec::write_frame(&mut writer, &msg).await,
            Outbound::Raw(bytes) => writer.write_all(&bytes).await.map_err(Into::into),
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, "control write failed");
            break;
        }
    }
}

/// Starts the control server on `addr` and returns the bound address and a
/// join handle for the accept loop.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
    manager: Arc<SessionManager>,
    options: ServerOptions,
) -> Result<(SocketAddr, tokio::task::JoinHandle<()>), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(accept_loop(listener, manager, options));
    Ok((bound_addr, handle))
}

async fn accept_loop(listener: TcpListener, manager: Arc<SessionManager>, options: ServerOptions) {
    // A zero period would make `interval` panic.
    let mut stats_tick = options
        .stats_interval
        .filter(|d| !d.is_zero())
        .map(tokio::time::interval);

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    tokio::spawn(handle_connection(
                        stream,
                        remote,
                        Arc::clone(&manager),
                        options.idle_timeout,
                    ));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "control accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            _ = tick(stats_tick.as_mut()) => log_stats(&manager),
        }
    }
}

async fn tick(interval: Option<&mut tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn log_stats(manager: &SessionManager) {
    let stats = manager.stats();
    tracing::info!(
        sessions = stats.sessions,
        peak_sessions = stats.peak_sessions,
        connections = stats.connections,
        peak_connections = stats.peak_connections,
        peak_connections_per_session = stats.peak_connections_per_session,
        "relay statistics"
    );
}

/// Starts a control server on `127.0.0.1:0` whose relays bind loopback.
#[cfg(test)]
pub async fn start_test_server() -> (SocketAddr, Arc<SessionManager>, tokio::task::JoinHandle<()>) {
    let manager = Arc::new(SessionManager::new(Some(std::net::IpAddr::from([127, 0, 0, 1]))));
    let (addr, handle) = start_server("127.0.0.1:0", Arc::clone(&manager), ServerOptions::default())
        .await
        .expect("failed to start test server");
    (addr, manager, handle)
}
