//! Session table keyed by control connection.
//!
//! The [`SessionManager`] maps every control connection to at most one
//! [`RelaySession`], creating it on the first Allocate and tearing it down
//! when the control connection goes away. It also keeps the aggregate
//! statistics reported in the periodic stats log line.

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::control::{ControlChannel, ControlId};
use crate::resolver::AddressResolver;
use crate::session::RelaySession;

/// Snapshot of the manager's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManagerStats {
    /// Live sessions.
    pub sessions: usize,
    /// Most sessions ever live at once.
    pub peak_sessions: usize,
    /// Open peer connections across all sessions.
    pub connections: usize,
    /// Most peer connections seen at any reading.
    pub peak_connections: usize,
    /// Most peer connections seen on a single session at any reading.
    pub peak_connections_per_session: usize,
}

/// Owner of all relay sessions.
#[derive(Debug, Default)]
pub struct SessionManager {
    sessions: DashMap<ControlId, Arc<RelaySession>>,
    public_ip: Option<IpAddr>,
    peak_sessions: AtomicUsize,
    peak_connections: AtomicUsize,
    peak_connections_per_session: AtomicUsize,
}

impl SessionManager {
    /// Creates a manager whose relay listeners bind `public_ip`.
    #[must_use]
    pub fn new(public_ip: Option<IpAddr>) -> Self {
        Self {
            public_ip,
            ..Self::default()
        }
    }

    /// Creates a manager, resolving the public IP once through `resolver`.
    #[must_use]
    pub fn from_resolver(resolver: &dyn AddressResolver) -> Self {
        let public_ip = resolver.resolve();
        match public_ip {
            Some(ip) => tracing::info!(public_ip = %ip, "resolved public address"),
            None => tracing::warn!("public address unresolved, relays bind the unspecified address"),
        }
        Self::new(public_ip)
    }

    /// Public IP used for relay listeners, if resolved.
    #[must_use]
    pub const fn public_ip(&self) -> Option<IpAddr> {
        self.public_ip
    }

    /// Returns the session for `control`, allocating one if needed.
    ///
    /// A repeat call for the same control connection is a keep-alive: the
    /// existing session is returned untouched. Concurrent first calls for
    /// one control connection create exactly one session. A session whose
    /// relay listener failed to bind is still stored; it simply never gets
    /// a relay address.
    pub fn allocate_binding(&self, control: &ControlChannel) -> Arc<RelaySession> {
        let session = match self.sessions.entry(control.id()) {
            Entry::Occupied(entry) => {
                tracing::trace!(control_id = %control.id(), "allocate keep-alive");
                return Arc::clone(entry.get());
            }
            Entry::Vacant(entry) => {
                let session = RelaySession::new(control.clone(), self.public_ip);
                // Failure is logged by the session and leaves it unallocated.
                let _ = session.allocate();
                entry.insert(Arc::clone(&session));
                session
            }
        };

        self.peak_sessions.fetch_max(self.sessions.len(), Ordering::Relaxed);
        session
    }

    /// Looks up the session for a control connection.
    #[must_use]
    pub fn get_session(&self, control_id: ControlId) -> Option<Arc<RelaySession>> {
        self.sessions
            .get(&control_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Removes and closes the session for a control connection.
    pub fn remove_binding(&self, control_id: ControlId) -> Option<Arc<RelaySession>> {
        let (_, session) = self.sessions.remove(&control_id)?;
        tracing::debug!(control_id = %control_id, "removing binding");
        session.close();
        Some(session)
    }

    /// Number of live sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Total open peer connections, summed session by session.
    ///
    /// Sessions keep changing while the sum is taken, so the result can be
    /// slightly stale.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.sessions
            .iter()
            .map(|entry| entry.value().connection_count())
            .sum()
    }

    /// Takes a reading of every counter, raising the peaks as needed.
    pub fn stats(&self) -> ManagerStats {
        let mut sessions = 0;
        let mut connections = 0;
        let mut busiest = 0;
        for entry in &self.sessions {
            let n = entry.value().connection_count();
            sessions += 1;
            connections += n;
            busiest = busiest.max(n);
        }

        let peak_sessions = self
            .peak_sessions
            .fetch_max(sessions, Ordering::Relaxed)
            .max(sessions);
        let peak_connections = self
            .peak_connections
            .fetch_max(connections, Ordering::Relaxed)
            .max(connections);
        let peak_connections_per_session = self
            .peak_connections_per_session
            .fetch_max(busiest, Ordering::Relaxed)
            .max(busiest);

        ManagerStats {
            sessions,
            peak_sessions,
            connections,
            peak_connections,
            peak_connections_per_session,
        }
    }
}
