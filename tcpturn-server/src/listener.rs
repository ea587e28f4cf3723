//! Per-session relay listener.
//!
//! Every session binds its own listening socket so each client appears to
//! own a distinct public endpoint. Accepted peers are handed to the owning
//! [`RelaySession`]; their bytes are split into protocol-sized chunks and
//! forwarded to the client in arrival order. A peer is not read again until
//! its previous read has been queued, so a client that stops draining its
//! control connection stalls the peers writing to it.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tcpturn_proto::message::{MAX_DATA_CHUNK, MAX_MESSAGE_SIZE};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::peer::PeerReader;
use crate::session::{RelaySession, SessionError};

/// Read buffer per peer connection. Larger than one chunk so a single read
/// can produce several `DataIndication`s.
const READ_BUFFER_SIZE: usize = 2 * MAX_MESSAGE_SIZE;

/// Back-off after a failed `accept` (e.g. file descriptor exhaustion).
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Listening socket allocated on behalf of one session.
#[derive(Debug)]
pub struct RelayListener {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
}

impl RelayListener {
    /// Binds an ephemeral port on `bind_ip` and starts accepting peers for
    /// `session`.
    ///
    /// Binding is synchronous so a caller holding a lock never awaits.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Bind`] if the socket cannot be bound.
    pub fn start(
        session: Weak<RelaySession>,
        bind_ip: IpAddr,
        shutdown: CancellationToken,
    ) -> Result<Self, SessionError> {
        let bind_addr = SocketAddr::new(bind_ip, 0);
        let bind_err = |source| SessionError::Bind {
            addr: bind_addr,
            source,
        };

        let std_listener = std::net::TcpListener::bind(bind_addr).map_err(bind_err)?;
        std_listener.set_nonblocking(true).map_err(bind_err)?;
        let listener = TcpListener::from_std(std_listener).map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;

        tokio::spawn(accept_loop(listener, session, shutdown.clone()));
        tracing::debug!(addr = %local_addr, "relay listener bound");

        Ok(Self {
            local_addr,
            shutdown,
        })
    }

    /// Address the socket is actually bound to.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting. Already accepted peers are closed by the session.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Returns `true` once [`RelayListener::stop`] has been called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

async fn accept_loop(
    listener: TcpListener,
    session: Weak<RelaySession>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let Some(session) = session.upgrade() else {
                        tracing::debug!(peer = %peer, "session gone, dropping accepted peer");
                        break;
                    };
                    on_accept(&session, stream, peer);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "relay accept failed");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            },
        }
    }
    tracing::debug!("relay listener stopped");
}

/// Hands a freshly accepted peer to its session.
fn on_accept(session: &Arc<RelaySession>, stream: TcpStream, peer: SocketAddr) {
    tracing::debug!(control_id = %session.control_id(), peer = %peer, "peer connected to relay");
    session.attach_peer(stream, peer, None);
}

/// Reads from a registered peer until it closes, forwarding every chunk to
/// the session, then reports the closure.
pub(crate) async fn pump_peer(reader: PeerReader, session: Weak<RelaySession>) {
    let PeerReader {
        id,
        peer,
        mut half,
        shutdown,
    } = reader;
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = tokio::select! {
            // Torn down by the session; nothing left to report.
            () = shutdown.cancelled() => return,
            read = half.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!(peer = %peer, error = %e, "peer read failed");
                    break;
                }
            },
        };
        let Some(session) = session.upgrade() else { return };
        tokio::select! {
            () = shutdown.cancelled() => return,
            () = on_data(&session, peer, &buf[..n]) => {}
        }
    }

    on_close(&session, peer, id);
}

/// Splits `bytes` and forwards each chunk in order.
async fn on_data(session: &RelaySession, peer: SocketAddr, bytes: &[u8]) {
    tracing::trace!(peer = %peer, len = bytes.len(), "peer data");
    for chunk in split_chunks(bytes, MAX_DATA_CHUNK) {
        session.forward_inbound(peer, chunk.to_vec()).await;
    }
}

fn on_close(session: &Weak<RelaySession>, peer: SocketAddr, id: u64) {
    match session.upgrade() {
        Some(session) => {
            session.remove_connection(peer, id);
        }
        None => tracing::debug!(peer = %peer, "peer closed after session teardown"),
    }
}

/// Splits `bytes` into consecutive chunks of at most `limit` bytes.
///
/// An empty input yields no chunks.
///
/// # Panics
///
/// Panics if `limit` is zero.
pub fn split_chunks(bytes: &[u8], limit: usize) -> impl Iterator<Item = &[u8]> {
    bytes.chunks(limit)
}
