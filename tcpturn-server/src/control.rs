//! Handle to a client's control connection.
//!
//! The control connection task owns the socket. Everything else talks to the
//! client through a [`ControlChannel`], which queues outbound frames for the
//! connection's writer task.
//!
//! Responses and status updates are queued immediately. Peer data must first
//! take its size out of a per-connection byte budget, which is returned as
//! the writer dequeues it; a client that stops reading therefore stalls the
//! peer reads feeding it instead of growing the queue.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tcpturn_proto::TurnMessage;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};

/// Default bytes of peer data that may wait in one control connection's
/// queue.
pub const DEFAULT_DATA_BUDGET: usize = 1024 * 1024;

/// Process-unique identity of one control connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ControlId(u64);

impl ControlId {
    /// Allocates the next unused identifier.
    #[must_use]
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw counter value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ControlId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ctl-{}", self.0)
    }
}

/// A unit of output for the control connection writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// A protocol message, written as one length-prefixed frame.
    Message(TurnMessage),
    /// Bytes written to the socket as-is, with no framing.
    Raw(Vec<u8>),
}

/// The writer side of a control connection has gone away.
#[derive(Debug, thiserror::Error)]
#[error("control channel {0} is closed")]
pub struct ControlChannelClosed(pub ControlId);

/// Queue entry; the permit returns its bytes to the budget when dequeued.
#[derive(Debug)]
struct Queued {
    out: Outbound,
    _permit: Option<OwnedSemaphorePermit>,
}

/// Cloneable sender half of a control connection.
#[derive(Debug, Clone)]
pub struct ControlChannel {
    id: ControlId,
    mapped_addr: SocketAddr,
    tx: mpsc::UnboundedSender<Queued>,
    budget: Arc<Semaphore>,
    capacity: usize,
}

/// Receiving half of a control connection, drained by its writer task.
#[derive(Debug)]
pub struct ControlReceiver {
    rx: mpsc::UnboundedReceiver<Queued>,
    budget: Arc<Semaphore>,
}

impl ControlChannel {
    /// Creates a channel for a control connection from `mapped_addr` with
    /// [`DEFAULT_DATA_BUDGET`].
    ///
    /// The returned receiver must be drained by the task that writes to the
    /// socket.
    #[must_use]
    pub fn new(mapped_addr: SocketAddr) -> (Self, ControlReceiver) {
        Self::with_budget(mapped_addr, DEFAULT_DATA_BUDGET)
    }

    /// Creates a channel whose queue holds at most `budget` bytes of peer
    /// data.
    #[must_use]
    pub fn with_budget(mapped_addr: SocketAddr, budget: usize) -> (Self, ControlReceiver) {
        let max = Semaphore::MAX_PERMITS.min(usize::try_from(u32::MAX).unwrap_or(usize::MAX));
        let capacity = budget.clamp(1, max);
        let (tx, rx) = mpsc::unbounded_channel();
        let budget = Arc::new(Semaphore::new(capacity));
        let channel = Self {
            id: ControlId::next(),
            mapped_addr,
            tx,
            budget: Arc::clone(&budget),
            capacity,
        };
        (channel, ControlReceiver { rx, budget })
    }

    /// Identity of the control connection.
    #[must_use]
    pub const fn id(&self) -> ControlId {
        self.id
    }

    /// The client's address as observed on the control connection.
    #[must_use]
    pub const fn mapped_addr(&self) -> SocketAddr {
        self.mapped_addr
    }

    /// Queues a protocol message for the client without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`ControlChannelClosed`] if the writer task has exited.
    pub fn send(&self, msg: TurnMessage) -> Result<(), ControlChannelClosed> {
        self.enqueue(Outbound::Message(msg), None)
    }

    /// Queues `out` carrying `len` bytes of peer data, waiting until the
    /// budget has room for it.
    ///
    /// Entries larger than the whole budget wait for an empty queue.
    ///
    /// # Errors
    ///
    /// Returns [`ControlChannelClosed`] if the writer task has exited, also
    /// while waiting.
    pub async fn send_data(&self, out: Outbound, len: usize) -> Result<(), ControlChannelClosed> {
        let cost = u32::try_from(len.clamp(1, self.capacity)).unwrap_or(u32::MAX);
        let permit = Arc::clone(&self.budget)
            .acquire_many_owned(cost)
            .await
            .map_err(|_| ControlChannelClosed(self.id))?;
        self.enqueue(out, Some(permit))
    }

    /// Bytes of peer data currently waiting in the queue.
    #[must_use]
    pub fn queued_data(&self) -> usize {
        self.capacity
            .saturating_sub(self.budget.available_permits())
    }

    /// Returns `true` once the writer task has dropped its receiver.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn enqueue(
        &self,
        out: Outbound,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Result<(), ControlChannelClosed> {
        self.tx
            .send(Queued {
                out,
                _permit: permit,
            })
            .map_err(|_| ControlChannelClosed(self.id))
    }
}

impl ControlReceiver {
    /// Waits for the next entry; `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<Outbound> {
        self.rx.recv().await.map(|queued| queued.out)
    }

    /// Takes the next entry if one is ready.
    ///
    /// # Errors
    ///
    /// Returns the channel's error when it is empty or disconnected.
    pub fn try_recv(&mut self) -> Result<Outbound, mpsc::error::TryRecvError> {
        self.rx.try_recv().map(|queued| queued.out)
    }
}

impl Drop for ControlReceiver {
    fn drop(&mut self) {
        // Wakes senders waiting for budget that will never be returned.
        self.budget.close();
    }
}
