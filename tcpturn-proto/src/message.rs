//! Wire format message types for the `tcpturn` control channel.
//!
//! One enum, [`TurnMessage`], covers every message kind in both directions.
//! The server consumes requests and indications from clients and produces
//! responses and indications for them; a kind that only makes sense in the
//! other direction is a protocol violation when it arrives.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// Upper bound on one encoded control-channel message, in bytes.
pub const MAX_MESSAGE_SIZE: usize = 0xFFFF;

/// Largest peer payload carried by a single [`TurnMessage::DataIndication`].
///
/// Leaves 1000 bytes of the message budget for the header and the
/// remaining attributes.
pub const MAX_DATA_CHUNK: usize = MAX_MESSAGE_SIZE - 1000;

/// 128-bit transaction identifier chosen by the client and echoed back in
/// the matching response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TransactionId([u8; 16]);

impl TransactionId {
    /// Creates a transaction ID from raw bytes.
    #[must_use]
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Creates a transaction ID from a big-endian integer.
    #[must_use]
    pub const fn from_u128(n: u128) -> Self {
        Self(n.to_be_bytes())
    }

    /// Returns the raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// State of a relayed peer connection as reported to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionStatus {
    /// The server is ready to accept a connection from the peer.
    Listen,
    /// A TCP connection with the peer is open.
    Established,
    /// The TCP connection with the peer has closed.
    Closed,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Listen => "LISTEN",
            Self::Established => "ESTABLISHED",
            Self::Closed => "CLOSED",
        };
        f.write_str(s)
    }
}

/// Messages exchanged over a control connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TurnMessage {
    /// Client asks for a relay address. Repeating it on the same control
    /// connection only keeps the existing allocation alive.
    AllocateRequest {
        /// Echoed in the response.
        transaction_id: TransactionId,
    },

    /// Server answer to [`TurnMessage::AllocateRequest`].
    AllocateSuccess {
        /// Transaction ID of the request being answered.
        transaction_id: TransactionId,
        /// Public address peers connect to in order to reach the client.
        relay_address: SocketAddr,
        /// The client's address as the server observed it.
        mapped_address: SocketAddr,
    },

    /// Client asks the server to deliver `data` to `peer` as raw bytes.
    SendIndication {
        /// Client-chosen transaction ID (not answered).
        transaction_id: TransactionId,
        /// Destination peer.
        peer: SocketAddr,
        /// Bytes to write to the peer, possibly empty.
        data: Vec<u8>,
    },

    /// Client pre-authorizes `peer` to connect to its relay address.
    ///
    /// Also serves as the connect indication; there is no separate variant.
    ConnectRequest {
        /// Client-chosen transaction ID (not answered).
        transaction_id: TransactionId,
        /// Peer being authorized.
        peer: SocketAddr,
    },

    /// Server delivers bytes a peer sent to the relay address.
    DataIndication {
        /// Server-chosen transaction ID.
        transaction_id: TransactionId,
        /// Peer the bytes came from.
        peer: SocketAddr,
        /// At most [`MAX_DATA_CHUNK`] bytes of peer data.
        data: Vec<u8>,
    },

    /// Server reports a change in a peer connection.
    ConnectionStatusIndication {
        /// Server-chosen transaction ID.
        transaction_id: TransactionId,
        /// Peer whose connection changed.
        peer: SocketAddr,
        /// New state of the connection.
        status: ConnectionStatus,
    },

    /// Plain binding keep-alive. Needs no answer from this server.
    BindingRequest {
        /// Client-chosen transaction ID.
        transaction_id: TransactionId,
    },
}

impl TurnMessage {
    /// Returns the transaction ID carried by any message kind.
    #[must_use]
    pub const fn transaction_id(&self) -> TransactionId {
        match self {
            Self::AllocateRequest { transaction_id }
            | Self::AllocateSuccess { transaction_id, .. }
            | Self::SendIndication { transaction_id, .. }
            | Self::ConnectRequest { transaction_id, .. }
            | Self::DataIndication { transaction_id, .. }
            | Self::ConnectionStatusIndication { transaction_id, .. }
            | Self::BindingRequest { transaction_id } => *transaction_id,
        }
    }

    /// Short, payload-free name used in log lines.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::AllocateRequest { .. } => "AllocateRequest",
            Self::AllocateSuccess { .. } => "AllocateSuccess",
            Self::SendIndication { .. } => "SendIndication",
            Self::ConnectRequest { .. } => "ConnectRequest",
            Self::DataIndication { .. } => "DataIndication",
            Self::ConnectionStatusIndication { .. } => "ConnectionStatusIndication",
            Self::BindingRequest { .. } => "BindingRequest",
        }
    }
}
