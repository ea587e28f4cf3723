//! Maps decoded control-channel messages onto session operations.
//!
//! Dispatch is stateless: every call works from the control connection it
//! arrived on and the shared [`SessionManager`]. Unexpected message kinds
//! are logged and ignored; they never close the connection.

use std::net::SocketAddr;

use tcpturn_proto::{TransactionId, TurnMessage};

use crate::control::ControlChannel;
use crate::manager::SessionManager;

/// Handles one message received on `control`.
pub fn dispatch(control: &ControlChannel, manager: &SessionManager, msg: TurnMessage) {
    match msg {
        TurnMessage::AllocateRequest { transaction_id } => {
            handle_allocate(control, manager, transaction_id);
        }
        TurnMessage::SendIndication { peer, data, .. } => {
            handle_send(control, manager, peer, data);
        }
        TurnMessage::ConnectRequest { peer, .. } => {
            handle_connect(control, manager, peer);
        }
        TurnMessage::BindingRequest { transaction_id } => {
            tracing::trace!(control_id = %control.id(), tx = %transaction_id, "ignoring binding request");
        }
        other @ (TurnMessage::AllocateSuccess { .. }
        | TurnMessage::DataIndication { .. }
        | TurnMessage::ConnectionStatusIndication { .. }) => {
            tracing::error!(
                control_id = %control.id(),
                kind = other.kind(),
                "protocol violation: server does not accept this message"
            );
        }
    }
}

fn handle_allocate(control: &ControlChannel, manager: &SessionManager, transaction_id: TransactionId) {
    tracing::debug!(control_id = %control.id(), tx = %transaction_id, "allocate request");
    let session = manager.allocate_binding(control);

    // There is no error response for a failed allocation; the client only
    // sees silence.
    let Some(relay_address) = session.relay_addr() else {
        tracing::error!(control_id = %control.id(), "no relay address to report, not responding");
        return;
    };
    let response = TurnMessage::AllocateSuccess {
        transaction_id,
        relay_address,
        mapped_address: session.mapped_addr(),
    };
    if let Err(e) = control.send(response) {
        tracing::warn!(error = %e, "failed to queue allocate response");
    }
}

fn handle_send(control: &ControlChannel, manager: &SessionManager, peer: SocketAddr, data: Vec<u8>) {
    let Some(session) = manager.get_session(control.id()) else {
        tracing::warn!(control_id = %control.id(), peer = %peer, "send indication before allocate");
        return;
    };
    let len = data.len();
    // Fire-and-forget: a failed send is never reported to the client.
    let reused = session.write(peer, data);
    tracing::trace!(control_id = %control.id(), peer = %peer, len, reused, "send indication");
}

fn handle_connect(control: &ControlChannel, manager: &SessionManager, peer: SocketAddr) {
    let Some(session) = manager.get_session(control.id()) else {
        tracing::warn!(control_id = %control.id(), peer = %peer, "connect request before allocate");
        return;
    };
    session.handle_connect(peer);
}
