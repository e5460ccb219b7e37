//! Message types for actor communication.
//!
//! All inter-actor communication uses strongly-typed message passing via
//! `tokio::sync::mpsc`. Request-reply uses `tokio::sync::oneshot`.

use super::connection::ConnectionActorHandle;
use super::room::RoomActorHandle;
use crate::collaborators::Identity;
use crate::errors::RcError;
use crate::signaling::protocol::{
    ClientMessage, OutboundFrame, ParticipantRole, ParticipantView, ProducerView, ServerEvent,
};
use common::types::SessionStatus;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Messages sent to `RoomRegistryActor`.
#[derive(Debug)]
pub enum RegistryMessage {
    /// Return the room for a session, spawning it if needed.
    EnsureRoom {
        session_id: String,
        respond_to: oneshot::Sender<Result<RoomActorHandle, RcError>>,
    },

    /// Return the room for a session if one is live.
    GetRoom {
        session_id: String,
        respond_to: oneshot::Sender<Option<RoomActorHandle>>,
    },

    GetStatus {
        respond_to: oneshot::Sender<RegistryStatus>,
    },

    /// Stop accepting rooms and cancel every live one.
    Shutdown {
        deadline: Duration,
        respond_to: oneshot::Sender<Result<(), RcError>>,
    },
}

/// Messages sent to `RoomActor`.
#[derive(Debug)]
pub enum RoomMessage {
    /// A verified socket joins the room.
    Join {
        connection_id: String,
        identity: Identity,
        /// Writer side of the socket; the room wraps it in a `ConnectionActor`.
        outbound: mpsc::Sender<OutboundFrame>,
        /// Echoed on the `joined_room` reply.
        request_id: Option<String>,
        respond_to: oneshot::Sender<Result<JoinOutcome, RcError>>,
    },

    /// A client message from a joined socket. `Ok(None)` means no direct reply.
    Signal {
        connection_id: String,
        message: ClientMessage,
        respond_to: oneshot::Sender<Result<Option<ServerEvent>, RcError>>,
    },

    /// The socket closed.
    Disconnect { connection_id: String },

    GetState {
        respond_to: oneshot::Sender<RoomSnapshot>,
    },

    /// Push an `external` event to every socket in the room.
    Emit { name: String, payload: Value },
}

impl RoomMessage {
    /// Whether handling this message can change socket membership.
    #[must_use]
    pub const fn affects_membership(&self) -> bool {
        matches!(
            self,
            RoomMessage::Join { .. } | RoomMessage::Signal { .. } | RoomMessage::Disconnect { .. }
        )
    }
}

/// Messages sent to `ConnectionActor`.
#[derive(Debug)]
pub enum ConnectionMessage {
    /// Forward a frame to the socket writer.
    Deliver { frame: OutboundFrame },

    /// Tell the client it was replaced or removed, then stop.
    Evict { reason: String },

    Ping { respond_to: oneshot::Sender<()> },
}

// ----------------------------------------------------------------------------
// Supporting Types
// ----------------------------------------------------------------------------

/// Successful join.
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    /// Delivery handle for replies to this socket; keeps frame order with
    /// room broadcasts.
    pub connection: ConnectionActorHandle,
    pub user_id: String,
    pub role: ParticipantRole,
}

/// Point-in-time view of one room.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomSnapshot {
    pub session_id: String,
    /// `None` until the first join has loaded the session.
    pub status: Option<SessionStatus>,
    pub streamer_connection_id: Option<String>,
    pub connection_count: usize,
    pub participants: Vec<ParticipantView>,
    pub producers: Vec<ProducerView>,
    pub transport_count: usize,
    pub consumer_count: usize,
    pub router_id: Option<String>,
    pub peak_participants: u32,
    pub recording_active: bool,
    pub screen_sharer: Option<String>,
    pub pending_whiteboard_ops: usize,
    pub whiteboard_version: Option<u64>,
}

impl RoomSnapshot {
    #[must_use]
    pub fn participant(&self, user_id: &str) -> Option<&ParticipantView> {
        self.participants.iter().find(|p| p.user_id == user_id)
    }
}

/// Registry status (for health checks).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryStatus {
    pub instance_id: String,
    pub room_count: usize,
    pub connection_count: usize,
    pub accepting_new: bool,
    pub max_rooms: usize,
}
