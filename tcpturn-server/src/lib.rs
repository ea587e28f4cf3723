//! TCP TURN relay server library.
//!
//! Exposes the relay server for use in tests and embedding. Clients hold a
//! control connection to the server and allocate a relay listener; remote
//! peers connect to that listener and their bytes are forwarded over the
//! control connection, while client sends are written to peers as raw
//! bytes.

pub mod config;
pub mod control;
pub mod dispatcher;
pub mod listener;
pub mod manager;
pub mod peer;
pub mod permissions;
pub mod resolver;
pub mod server;
pub mod session;
