//! Shared protocol definitions for the `tcpturn` control channel.
//!
//! A client holds one TCP control connection to the server. Requests and
//! indications travel over it as postcard-encoded [`message::TurnMessage`]
//! values, each wrapped in a 4-byte length prefix by [`codec`].

pub mod codec;
pub mod message;

pub use message::{ConnectionStatus, TransactionId, TurnMessage};
