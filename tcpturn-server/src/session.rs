//! Per-client relay session.
//!
//! A [`RelaySession`] is created on the first Allocate of a control
//! connection. It owns the relay listener, the table of open peer
//! connections, and the permission set, and it mediates every byte relayed
//! in either direction on the client's behalf.
//!
//! Lifecycle: `Unallocated -> Allocated -> Closed`. Nothing leaves `Closed`;
//! events that reach a closed session (late accepts, late connects, late
//! peer closures) are dropped.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tcpturn_proto::{ConnectionStatus, TransactionId, TurnMessage};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::control::{ControlChannel, ControlId, Outbound};
use crate::listener::{self, RelayListener};
use crate::peer::PeerConnection;
use crate::permissions::PermissionSet;

/// Errors surfaced by session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The relay listener could not be bound.
    #[error("failed to bind relay listener on {addr}: {source}")]
    Bind {
        /// Address the bind was attempted on.
        addr: SocketAddr,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// An earlier bind attempt failed; allocation is not retried.
    #[error("relay listener could not be bound for this session")]
    Unbound,
    /// The session has been closed.
    #[error("session is closed")]
    Closed,
}

/// Allocation state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, no relay address yet.
    Unallocated,
    /// Relay listener bound.
    Allocated,
    /// Torn down.
    Closed,
}

#[derive(Debug)]
struct Tables {
    state: SessionState,
    bind_failed: bool,
    relay_addr: Option<SocketAddr>,
    listener: Option<RelayListener>,
    connections: HashMap<SocketAddr, PeerConnection>,
    permissions: PermissionSet,
}

impl Tables {
    /// Permits `ip` without evicting an address that still has an open
    /// connection.
    fn permit(&mut self, ip: IpAddr) {
        let connections = &self.connections;
        self.permissions
            .permit(ip, |p| connections.keys().any(|addr| addr.ip() == p));
    }
}

/// Relay state for one client.
#[derive(Debug)]
pub struct RelaySession {
    control_id: ControlId,
    mapped_addr: SocketAddr,
    public_ip: Option<IpAddr>,
    control: Mutex<Option<ControlChannel>>,
    tables: Mutex<Tables>,
    active_destination: AtomicBool,
    next_transaction: AtomicU64,
    next_connection: AtomicU64,
    shutdown: CancellationToken,
    this: Weak<Self>,
}

impl RelaySession {
    /// Creates an unallocated session for `control`.
    ///
    /// `public_ip` is both the bind address and the advertised address of
    /// the relay listener; `None` binds the unspecified address.
    #[must_use]
    pub fn new(control: ControlChannel, public_ip: Option<IpAddr>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            control_id: control.id(),
            mapped_addr: control.mapped_addr(),
            public_ip,
            control: Mutex::new(Some(control)),
            tables: Mutex::new(Tables {
                state: SessionState::Unallocated,
                bind_failed: false,
                relay_addr: None,
                listener: None,
                connections: HashMap::new(),
                permissions: PermissionSet::new(),
            }),
            active_destination: AtomicBool::new(false),
            next_transaction: AtomicU64::new(1),
            next_connection: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
            this: this.clone(),
        })
    }

    /// Binds the relay listener and returns the relay address.
    ///
    /// Idempotent: later calls return the address bound by the first. A bind
    /// failure is final for this session.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Bind`] on the failing call,
    /// [`SessionError::Unbound`] on every call after it, and
    /// [`SessionError::Closed`] once the session is closed.
    pub fn allocate(&self) -> Result<SocketAddr, SessionError> {
        let mut tables = self.tables.lock();
        match tables.state {
            SessionState::Closed => return Err(SessionError::Closed),
            SessionState::Allocated => {
                if let Some(addr) = tables.relay_addr {
                    return Ok(addr);
                }
            }
            SessionState::Unallocated if tables.bind_failed => {
                return Err(SessionError::Unbound);
            }
            SessionState::Unallocated => {}
        }

        let bind_ip = self.public_ip.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let listener = match RelayListener::start(
            self.this.clone(),
            bind_ip,
            self.shutdown.child_token(),
        ) {
            Ok(l) => l,
            Err(e) => {
                tables.bind_failed = true;
                drop(tables);
                tracing::error!(control_id = %self.control_id, error = %e, "relay allocation failed");
                return Err(e);
            }
        };

        let relay_addr = SocketAddr::new(bind_ip, listener.local_addr().port());
        tables.relay_addr = Some(relay_addr);
        tables.listener = Some(listener);
        tables.state = SessionState::Allocated;
        drop(tables);

        tracing::info!(
            control_id = %self.control_id,
            relay_addr = %relay_addr,
            mapped_addr = %self.mapped_addr,
            "relay allocated"
        );
        Ok(relay_addr)
    }

    /// Identity of the owning control connection.
    #[must_use]
    pub const fn control_id(&self) -> ControlId {
        self.control_id
    }

    /// The client's address as observed on the control connection.
    #[must_use]
    pub const fn mapped_addr(&self) -> SocketAddr {
        self.mapped_addr
    }

    /// Relay address, once allocated.
    #[must_use]
    pub fn relay_addr(&self) -> Option<SocketAddr> {
        self.tables.lock().relay_addr
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.tables.lock().state
    }

    /// Number of open peer connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.tables.lock().connections.len()
    }

    /// Returns `true` if a connection to `peer` is registered.
    #[must_use]
    pub fn is_connected(&self, peer: SocketAddr) -> bool {
        self.tables.lock().connections.contains_key(&peer)
    }

    /// Returns `true` if `ip` is in the permission set.
    #[must_use]
    pub fn is_permitted(&self, ip: IpAddr) -> bool {
        self.tables.lock().permissions.contains(ip)
    }

    /// Number of permitted peer addresses.
    #[must_use]
    pub fn permission_count(&self) -> usize {
        self.tables.lock().permissions.len()
    }

    /// Whether peer bytes bypass `DataIndication` framing.
    ///
    /// Nothing in the protocol turns this on yet.
    #[must_use]
    pub fn has_active_destination(&self) -> bool {
        self.active_destination.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn set_active_destination(&self, active: bool) {
        self.active_destination.store(active, Ordering::Release);
    }

    /// Sends `data` to `peer`.
    ///
    /// Returns `true` if an open connection was reused. Otherwise permits
    /// the peer, starts an outbound connect in the background carrying
    /// `data` as its first write, and returns `false` without waiting. A
    /// failed connect drops the data silently; the next `write` tries again.
    pub fn write(&self, peer: SocketAddr, data: Vec<u8>) -> bool {
        let mut tables = self.tables.lock();
        if tables.state == SessionState::Closed {
            tracing::debug!(control_id = %self.control_id, peer = %peer, "write on closed session");
            return false;
        }
        if let Some(conn) = tables.connections.get(&peer) {
            if !conn.send(data) {
                // The read pump reports the closure.
                tracing::debug!(control_id = %self.control_id, peer = %peer, "peer writer already gone");
            }
            return true;
        }
        tables.permit(peer.ip());
        drop(tables);

        let pending = if data.is_empty() {
            None
        } else {
            tracing::debug!(
                control_id = %self.control_id,
                peer = %peer,
                len = data.len(),
                "opening peer connection with pending data"
            );
            Some(data)
        };
        tokio::spawn(connect_peer(
            self.this.clone(),
            peer,
            pending,
            self.shutdown.child_token(),
        ));
        false
    }

    /// Pre-authorizes `peer` and tells the client the relay is listening
    /// for it.
    pub fn handle_connect(&self, peer: SocketAddr) {
        {
            let mut tables = self.tables.lock();
            if tables.state == SessionState::Closed {
                return;
            }
            tables.permit(peer.ip());
        }
        tracing::debug!(control_id = %self.control_id, peer = %peer, "peer permitted by connect request");
        self.emit_status(peer, ConnectionStatus::Listen);
    }

    /// Registers an open peer connection and reports it as established.
    ///
    /// Replaces any connection already registered for the same address.
    /// Returns `false` and closes `conn` if the session is closed. Inbound
    /// peers are accepted whether or not they were permitted beforehand.
    pub fn add_connection(&self, conn: PeerConnection) -> bool {
        self.register(conn, None)
    }

    /// Registers `conn`, queueing `pending` on it first while the session is
    /// known to be open.
    fn register(&self, conn: PeerConnection, pending: Option<Vec<u8>>) -> bool {
        let peer = conn.peer();
        let mut tables = self.tables.lock();
        if tables.state == SessionState::Closed {
            drop(tables);
            tracing::debug!(control_id = %self.control_id, peer = %peer, "discarding connection for closed session");
            conn.close();
            return false;
        }
        if let Some(data) = pending {
            conn.send(data);
        }
        let replaced = tables.connections.insert(peer, conn);
        tables.permit(peer.ip());
        let count = tables.connections.len();
        drop(tables);

        // The replaced socket still writes out what was queued on it, then
        // shuts down; its reader keeps forwarding until the peer closes.
        if let Some(old) = replaced {
            old.finish();
        }
        tracing::debug!(control_id = %self.control_id, peer = %peer, connections = count, "peer connection added");
        self.emit_status(peer, ConnectionStatus::Established);
        true
    }

    /// Drops the registration of connection `id` to `peer` after it closed.
    ///
    /// A peer that is not registered, or whose entry now belongs to a newer
    /// connection, is ignored. Returns `true` if an entry was removed.
    pub fn remove_connection(&self, peer: SocketAddr, id: u64) -> bool {
        let removed = {
            let mut tables = self.tables.lock();
            match tables.connections.get(&peer) {
                Some(conn) if conn.id() == id => tables.connections.remove(&peer),
                _ => None,
            }
        };
        let Some(conn) = removed else {
            tracing::debug!(control_id = %self.control_id, peer = %peer, "closed peer was not registered");
            return false;
        };
        conn.close();
        tracing::debug!(control_id = %self.control_id, peer = %peer, "peer connection removed");
        self.emit_status(peer, ConnectionStatus::Closed);
        true
    }

    /// Delivers bytes received from `peer` to the client.
    ///
    /// Waits while the control connection already has its full budget of
    /// peer data queued.
    pub async fn forward_inbound(&self, peer: SocketAddr, data: Vec<u8>) {
        let Some(control) = self.control.lock().clone() else {
            return;
        };
        let len = data.len();
        let out = if self.has_active_destination() {
            Outbound::Raw(data)
        } else {
            Outbound::Message(TurnMessage::DataIndication {
                transaction_id: self.next_transaction_id(),
                peer,
                data,
            })
        };
        if let Err(e) = control.send_data(out, len).await {
            tracing::warn!(peer = %peer, error = %e, "dropping peer data");
        }
    }

    /// Tears the session down: closes every peer connection, stops the
    /// listener, clears all tables, and detaches from the control channel.
    pub fn close(&self) {
        let (connections, listener) = {
            let mut tables = self.tables.lock();
            if tables.state == SessionState::Closed {
                return;
            }
            tables.state = SessionState::Closed;
            tables.permissions.clear();
            (
                std::mem::take(&mut tables.connections),
                tables.listener.take(),
            )
        };

        self.shutdown.cancel();
        if let Some(listener) = listener {
            listener.stop();
        }
        let count = connections.len();
        for conn in connections.into_values() {
            conn.close();
        }
        self.control.lock().take();

        tracing::info!(control_id = %self.control_id, closed_connections = count, "session closed");
    }

    /// Wraps `stream` in a peer connection and registers it, optionally
    /// writing `pending` first.
    pub(crate) fn attach_peer(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        pending: Option<Vec<u8>>,
    ) {
        if self.state() == SessionState::Closed {
            tracing::debug!(control_id = %self.control_id, peer = %peer, "dropping peer stream for closed session");
            return;
        }
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let (conn, reader) = PeerConnection::open(stream, peer, id, self.shutdown.child_token());
        if self.register(conn, pending) {
            tokio::spawn(listener::pump_peer(reader, self.this.clone()));
        }
    }

    fn emit_status(&self, peer: SocketAddr, status: ConnectionStatus) {
        let guard = self.control.lock();
        let Some(control) = guard.as_ref() else {
            return;
        };
        let msg = TurnMessage::ConnectionStatusIndication {
            transaction_id: self.next_transaction_id(),
            peer,
            status,
        };
        if let Err(e) = control.send(msg) {
            tracing::warn!(peer = %peer, status = %status, error = %e, "dropping status update");
        }
    }

    fn next_transaction_id(&self) -> TransactionId {
        let n = self.next_transaction.fetch_add(1, Ordering::Relaxed);
        TransactionId::from_u128((u128::from(self.control_id.get()) << 64) | u128::from(n))
    }
}

/// Background half of [`RelaySession::write`].
async fn connect_peer(
    session: Weak<RelaySession>,
    peer: SocketAddr,
    pending: Option<Vec<u8>>,
    shutdown: CancellationToken,
) {
    let connected = tokio::select! {
        () = shutdown.cancelled() => return,
        res = TcpStream::connect(peer) => res,
    };
    let stream = match connected {
        Ok(s) => s,
        Err(e) => {
            tracing::debug!(peer = %peer, error = %e, "peer connect failed, discarding pending data");
            return;
        }
    };
    let Some(session) = session.upgrade() else {
        tracing::debug!(peer = %peer, "session gone before connect completed");
        return;
    };
    session.attach_peer(stream, peer, pending);
}
