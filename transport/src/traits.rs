//! collaborator seams.
//!
//! the transport core routes inbound frames and lifecycle events through
//! these traits; session bookkeeping, RPC semantics, and membership policy
//! live behind them. implementations are registered once at runtime
//! construction and called from IO threads, so they must be cheap and
//! must not block.

use crate::buffer::BodyChain;
use crate::machine::ClusterMachine;
use crate::message::InMessage;
use crate::protocol::{MsgHeader, SessionId};
use std::sync::Arc;

/// where an inbound frame should be delivered.
#[derive(Debug, Clone, Copy)]
pub struct SessionRoute {
    /// opaque token the session layer associated with the session.
    pub user_data: u64,
    /// true: invoke the message handler synchronously on the IO worker.
    /// false: push onto the session's inbox for its owner to consume.
    pub call_func: bool,
}

/// session bookkeeping consulted for every non-ping frame.
pub trait SessionLayer: Send + Sync {
    /// resolve the session a response belongs to. `None` drops the frame.
    fn get_response_session(&self, header: &MsgHeader) -> Option<SessionRoute>;

    /// queue a frame on the session's inbox (`call_func == false` routes).
    fn push_in_message(&self, msg: InMessage);

    /// a connection closed; pending sessions pinned to it should fail so
    /// callers can retry through session state.
    fn connection_closed(&self, machine: &Arc<ClusterMachine>);
}

/// synchronous delivery callback (`call_func == true` routes).
pub trait MessageHandler: Send + Sync {
    fn deal_message(
        &self,
        session_id: SessionId,
        user_data: u64,
        func_id: i32,
        body: BodyChain,
        data_len: u32,
    );
}

/// membership notifications.
pub trait ClusterEvents: Send + Sync {
    /// a connection to `machine` completed its handshake and went active.
    fn machine_up(&self, machine: &Arc<ClusterMachine>);

    /// a connection to `machine` closed.
    fn connection_closed(&self, machine: &Arc<ClusterMachine>);
}

// zero-cost forwarding so callers can register Arc-wrapped collaborators.

impl<T: SessionLayer> SessionLayer for Arc<T> {
    #[inline]
    fn get_response_session(&self, header: &MsgHeader) -> Option<SessionRoute> {
        (**self).get_response_session(header)
    }

    #[inline]
    fn push_in_message(&self, msg: InMessage) {
        (**self).push_in_message(msg)
    }

    #[inline]
    fn connection_closed(&self, machine: &Arc<ClusterMachine>) {
        (**self).connection_closed(machine)
    }
}

impl<T: MessageHandler> MessageHandler for Arc<T> {
    #[inline]
    fn deal_message(
        &self,
        session_id: SessionId,
        user_data: u64,
        func_id: i32,
        body: BodyChain,
        data_len: u32,
    ) {
        (**self).deal_message(session_id, user_data, func_id, body, data_len)
    }
}

impl<T: ClusterEvents> ClusterEvents for Arc<T> {
    #[inline]
    fn machine_up(&self, machine: &Arc<ClusterMachine>) {
        (**self).machine_up(machine)
    }

    #[inline]
    fn connection_closed(&self, machine: &Arc<ClusterMachine>) {
        (**self).connection_closed(machine)
    }
}
