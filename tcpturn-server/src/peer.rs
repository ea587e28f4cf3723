//! One relayed TCP connection to a remote peer.
//!
//! Opening a stream yields two halves: a [`PeerConnection`] that the session
//! keeps in its connection table and writes through, and a [`PeerReader`]
//! that is handed to the listener's read pump once the connection is
//! registered. Writes are queued to a dedicated writer task so callers never
//! block on the socket.

use std::net::SocketAddr;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Write handle for an open peer connection.
#[derive(Debug)]
pub struct PeerConnection {
    id: u64,
    peer: SocketAddr,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    shutdown: CancellationToken,
}

/// Read half of a peer connection, not yet being pumped.
#[derive(Debug)]
pub struct PeerReader {
    pub(crate) id: u64,
    pub(crate) peer: SocketAddr,
    pub(crate) half: OwnedReadHalf,
    pub(crate) shutdown: CancellationToken,
}

impl PeerConnection {
    /// Splits `stream` and spawns its writer task.
    ///
    /// `id` distinguishes successive connections from the same peer address.
    /// Cancelling `shutdown` (or calling [`PeerConnection::close`]) stops both
    /// halves and closes the socket.
    #[must_use]
    pub fn open(
        stream: TcpStream,
        peer: SocketAddr,
        id: u64,
        shutdown: CancellationToken,
    ) -> (Self, PeerReader) {
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(write_half, rx, peer, shutdown.clone()));

        let conn = Self {
            id,
            peer,
            tx,
            shutdown: shutdown.clone(),
        };
        let reader = PeerReader {
            id,
            peer,
            half: read_half,
            shutdown,
        };
        (conn, reader)
    }

    /// Identifier of this particular connection.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Remote address of the peer.
    #[must_use]
    pub const fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Queues `data` for the peer. Returns `false` if the writer has exited.
    pub fn send(&self, data: Vec<u8>) -> bool {
        if data.is_empty() {
            return !self.tx.is_closed();
        }
        self.tx.send(data).is_ok()
    }

    /// Stops both halves; the socket closes once the tasks observe it.
    /// Writes still queued are discarded.
    pub fn close(self) {
        self.shutdown.cancel();
    }

    /// Writes out everything already queued, then shuts down the write half.
    ///
    /// The read half is left running and ends when the peer closes or the
    /// shutdown token is cancelled.
    pub fn finish(self) {
        drop(self.tx);
    }
}

async fn write_loop(
    mut half: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    peer: SocketAddr,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            next = rx.recv() => {
                let Some(data) = next else { break };
                if let Err(e) = half.write_all(&data).await {
                    tracing::debug!(peer = %peer, error = %e, "peer write failed");
                    break;
                }
            }
        }
    }
    let _ = half.shutdown().await;
}
