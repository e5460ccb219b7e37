//! Per-socket signaling dispatcher.
//!
//! One dispatcher runs per WebSocket. It parses inbound frames, handles
//! `join_room` itself (identity, session resolution, room lookup) and
//! forwards everything else to the joined room actor. Handler errors become
//! `error_message` frames on this socket only; the socket stays open.

use crate::actors::{ConnectionActorHandle, RoomActorHandle, RoomRegistryHandle};
use crate::collaborators::{IdentityVerifier, SessionRepository};
use crate::errors::RcError;
use crate::observability::metrics::record_message_latency;
use crate::signaling::protocol::{
    ClientMessage, JoinRoomRequest, OutboundFrame, RawFrame, ServerEvent,
};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Join attempts that may hit a room in the middle of closing.
const JOIN_ATTEMPTS: usize = 3;

/// Shared collaborators every dispatcher needs.
#[derive(Clone)]
pub struct SignalingContext {
    pub registry: RoomRegistryHandle,
    pub identity: Arc<dyn IdentityVerifier>,
    pub sessions: Arc<dyn SessionRepository>,
}

impl SignalingContext {
    #[must_use]
    pub fn new(
        registry: RoomRegistryHandle,
        identity: Arc<dyn IdentityVerifier>,
        sessions: Arc<dyn SessionRepository>,
    ) -> Self {
        Self {
            registry,
            identity,
            sessions,
        }
    }
}

/// Room membership of a joined socket.
struct Membership {
    room: RoomActorHandle,
    connection: ConnectionActorHandle,
    user_id: String,
}

pub struct SignalingDispatcher {
    connection_id: String,
    context: SignalingContext,
    /// Socket writer; used directly only while not joined.
    outbound: mpsc::Sender<OutboundFrame>,
    membership: Option<Membership>,
}

impl SignalingDispatcher {
    #[must_use]
    pub fn new(
        connection_id: String,
        context: SignalingContext,
        outbound: mpsc::Sender<OutboundFrame>,
    ) -> Self {
        Self {
            connection_id,
            context,
            outbound,
            membership: None,
        }
    }

    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Session this socket is joined to.
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.membership.as_ref().map(|m| m.room.session_id())
    }

    /// Handle one inbound text frame.
    pub async fn handle_text(&mut self, text: &str) {
        let frame = match RawFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                self.send(OutboundFrame::push(ServerEvent::error(&e))).await;
                return;
            }
        };
        let request_id = frame.request_id.clone();

        let message = match ClientMessage::from_frame(frame) {
            Ok(message) => message,
            Err(e) => {
                self.send(OutboundFrame::reply(ServerEvent::error(&e), request_id))
                    .await;
                return;
            }
        };

        let name = message.name();
        let started = Instant::now();
        let result = self.dispatch(message, request_id.clone()).await;
        record_message_latency(name, started.elapsed());

        match result {
            Ok(Some(event)) => self.send(OutboundFrame::reply(event, request_id)).await,
            Ok(None) => {}
            Err(e) => {
                debug!(
                    target: "rc.signaling",
                    connection_id = %self.connection_id,
                    message_type = name,
                    error = %e,
                    "Signaling request failed"
                );
                self.send(OutboundFrame::reply(ServerEvent::error(&e), request_id))
                    .await;
            }
        }
    }

    async fn dispatch(
        &mut self,
        message: ClientMessage,
        request_id: Option<String>,
    ) -> Result<Option<ServerEvent>, RcError> {
        if let ClientMessage::JoinRoom(request) = message {
            return self.join(request, request_id).await.map(|()| None);
        }

        let Some(membership) = &self.membership else {
            return match message {
                ClientMessage::Ping => Ok(Some(ServerEvent::Pong)),
                _ => Err(RcError::NotInRoom),
            };
        };

        let is_leave = matches!(message, ClientMessage::LeaveRoom);
        let result = membership
            .room
            .signal(self.connection_id.clone(), message)
            .await;

        match result {
            Ok(reply) if is_leave => {
                // Ack goes out through the connection actor before it closes.
                if let Some(event) = reply {
                    self.send(OutboundFrame::reply(event, request_id)).await;
                }
                self.membership = None;
                Ok(None)
            }
            Err(e @ (RcError::NotInRoom | RcError::RoomClosing)) => {
                // Evicted, or the room went away underneath us.
                self.membership = None;
                Err(e)
            }
            other => other,
        }
    }

    async fn join(
        &mut self,
        request: JoinRoomRequest,
        request_id: Option<String>,
    ) -> Result<(), RcError> {
        if self.membership.is_some() {
            return Err(RcError::Conflict(
                "Connection already joined a room".to_string(),
            ));
        }

        let identity = self.context.identity.verify(&request.token).await?;
        let session_id = self.resolve_session(&request).await?;

        let mut attempt = 0;
        let outcome = loop {
            attempt += 1;
            let room = self.context.registry.ensure_room(session_id.clone()).await?;
            match room
                .join(
                    self.connection_id.clone(),
                    identity.clone(),
                    self.outbound.clone(),
                    request_id.clone(),
                )
                .await
            {
                Ok(outcome) => break (room, outcome),
                Err(RcError::RoomClosing) if attempt < JOIN_ATTEMPTS => {
                    debug!(
                        target: "rc.signaling",
                        connection_id = %self.connection_id,
                        session_id = %session_id,
                        attempt,
                        "Room closing during join, retrying"
                    );
                }
                Err(e) => return Err(e),
            }
        };

        let (room, joined) = outcome;
        info!(
            target: "rc.signaling",
            connection_id = %self.connection_id,
            session_id = %session_id,
            user_id = %joined.user_id,
            role = ?joined.role,
            "Socket joined room"
        );
        self.membership = Some(Membership {
            room,
            connection: joined.connection,
            user_id: joined.user_id,
        });
        Ok(())
    }

    async fn resolve_session(&self, request: &JoinRoomRequest) -> Result<String, RcError> {
        match (&request.session_id, &request.room_code) {
            (Some(session_id), _) if !session_id.is_empty() => Ok(session_id.clone()),
            (_, Some(room_code)) if !room_code.is_empty() => self
                .context
                .sessions
                .find_by_room_code(room_code)
                .await
                .map(|session| session.id),
            _ => Err(RcError::Validation(
                "sessionId or roomCode is required".to_string(),
            )),
        }
    }

    /// Queue a frame behind the room's pushes when joined, else directly.
    async fn send(&self, frame: OutboundFrame) {
        if let Some(membership) = &self.membership {
            if membership.connection.send(frame.clone()).await.is_ok() {
                return;
            }
        }
        if self.outbound.send(frame).await.is_err() {
            debug!(
                target: "rc.signaling",
                connection_id = %self.connection_id,
                "Socket writer closed, dropping frame"
            );
        }
    }

    /// Socket closed: tell the room.
    pub async fn close(self) {
        if let Some(membership) = self.membership {
            membership.room.disconnect(self.connection_id.clone()).await;
            membership.connection.cancel();
            debug!(
                target: "rc.signaling",
                connection_id = %self.connection_id,
                user_id = %membership.user_id,
                "Socket closed"
            );
        } else if self.outbound.is_closed() {
            warn!(
                target: "rc.signaling",
                connection_id = %self.connection_id,
                "Socket closed before joining"
            );
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::actors::room::testing::{
        session, streamer_identity, viewer_identity, Fixture, STREAMER_ID,
    };
    use crate::actors::RoomRegistryActor;
    use crate::collaborators::memory::StaticIdentities;
    use crate::errors::ErrorKind;
    use common::types::SessionStatus;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct Harness {
        _fx: Fixture,
        context: SignalingContext,
    }

    fn harness() -> Harness {
        let fx = Fixture::new(session("s-1", SessionStatus::Active));
        let deps = fx.deps();
        let (registry, _) =
            RoomRegistryActor::spawn("rc-test".to_string(), deps.clone(), 10, CancellationToken::new());
        let identity = StaticIdentities::new()
            .with("tok-streamer", streamer_identity())
            .with("tok-v1", viewer_identity("v1"));
        let context = SignalingContext::new(
            registry,
            Arc::new(identity),
            deps.collaborators.sessions.clone(),
        );
        Harness { _fx: fx, context }
    }

    fn socket(
        context: &SignalingContext,
        connection_id: &str,
    ) -> (SignalingDispatcher, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(256);
        (
            SignalingDispatcher::new(connection_id.to_string(), context.clone(), tx),
            rx,
        )
    }

    async fn next(rx: &mut mpsc::Receiver<OutboundFrame>) -> OutboundFrame {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    /// Skip pushes until a frame answering `request_id` arrives.
    async fn reply_to(rx: &mut mpsc::Receiver<OutboundFrame>, request_id: &str) -> ServerEvent {
        loop {
            let frame = next(rx).await;
            if frame.request_id.as_deref() == Some(request_id) {
                return frame.event;
            }
        }
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_socket_usable() {
        let h = harness();
        let (mut dispatcher, mut rx) = socket(&h.context, "c-1");

        dispatcher.handle_text("not json").await;
        let frame = next(&mut rx).await;
        assert!(matches!(
            frame.event,
            ServerEvent::Error(ref p) if p.kind == ErrorKind::Validation
        ));

        dispatcher
            .handle_text(r#"{"event":"ping","requestId":"r1"}"#)
            .await;
        assert_eq!(reply_to(&mut rx, "r1").await, ServerEvent::Pong);
    }

    #[tokio::test]
    async fn test_unknown_event_echoes_request_id() {
        let h = harness();
        let (mut dispatcher, mut rx) = socket(&h.context, "c-1");

        dispatcher
            .handle_text(r#"{"event":"teleport","requestId":"r9"}"#)
            .await;
        let event = reply_to(&mut rx, "r9").await;
        assert!(matches!(event, ServerEvent::Error(ref p) if p.code == 8));
    }

    #[tokio::test]
    async fn test_signal_before_join_is_rejected() {
        let h = harness();
        let (mut dispatcher, mut rx) = socket(&h.context, "c-1");

        dispatcher
            .handle_text(r#"{"event":"streamer_start","requestId":"r1"}"#)
            .await;
        let event = reply_to(&mut rx, "r1").await;
        assert!(matches!(
            event,
            ServerEvent::Error(ref p) if p.message == RcError::NotInRoom.client_message()
        ));
    }

    #[tokio::test]
    async fn test_join_by_room_code() {
        let h = harness();
        let (mut dispatcher, mut rx) = socket(&h.context, "c-s");

        dispatcher
            .handle_text(
                r#"{"event":"join_room","data":{"token":"tok-streamer","roomCode":"ROOM-s-1"},"requestId":"j1"}"#,
            )
            .await;
        let event = reply_to(&mut rx, "j1").await;
        assert!(matches!(
            event,
            ServerEvent::JoinedRoom(ref p) if p.session_id == "s-1" && p.user_id == STREAMER_ID
        ));
        assert_eq!(dispatcher.session_id(), Some("s-1"));
    }

    #[tokio::test]
    async fn test_join_rejects_bad_token_and_missing_target() {
        let h = harness();
        let (mut dispatcher, mut rx) = socket(&h.context, "c-1");

        dispatcher
            .handle_text(
                r#"{"event":"join_room","data":{"token":"forged","sessionId":"s-1"},"requestId":"j1"}"#,
            )
            .await;
        assert!(matches!(
            reply_to(&mut rx, "j1").await,
            ServerEvent::Error(ref p) if p.code == 2
        ));

        dispatcher
            .handle_text(r#"{"event":"join_room","data":{"token":"tok-v1"},"requestId":"j2"}"#)
            .await;
        assert!(matches!(
            reply_to(&mut rx, "j2").await,
            ServerEvent::Error(ref p) if p.kind == ErrorKind::Validation
        ));
        assert!(dispatcher.session_id().is_none());
    }

    #[tokio::test]
    async fn test_second_join_conflicts() {
        let h = harness();
        let (mut dispatcher, mut rx) = socket(&h.context, "c-1");
        let join = r#"{"event":"join_room","data":{"token":"tok-v1","sessionId":"s-1"},"requestId":"j1"}"#;

        dispatcher.handle_text(join).await;
        assert!(matches!(
            reply_to(&mut rx, "j1").await,
            ServerEvent::JoinedRoom(_)
        ));

        dispatcher
            .handle_text(
                r#"{"event":"join_room","data":{"token":"tok-v1","sessionId":"s-1"},"requestId":"j2"}"#,
            )
            .await;
        assert!(matches!(
            reply_to(&mut rx, "j2").await,
            ServerEvent::Error(ref p) if p.code == 5
        ));
    }

    #[tokio::test]
    async fn test_leave_then_rejoin() {
        let h = harness();
        let (mut streamer, _streamer_rx) = socket(&h.context, "c-s");
        streamer
            .handle_text(r#"{"event":"join_room","data":{"token":"tok-streamer","sessionId":"s-1"}}"#)
            .await;

        let (mut viewer, mut rx) = socket(&h.context, "c-1");
        viewer
            .handle_text(
                r#"{"event":"join_room","data":{"token":"tok-v1","sessionId":"s-1"},"requestId":"j1"}"#,
            )
            .await;
        reply_to(&mut rx, "j1").await;

        viewer
            .handle_text(r#"{"event":"leave_room","requestId":"l1"}"#)
            .await;
        assert!(matches!(
            reply_to(&mut rx, "l1").await,
            ServerEvent::Ack { action: "leave_room" }
        ));
        assert!(viewer.session_id().is_none());

        viewer
            .handle_text(
                r#"{"event":"join_room","data":{"token":"tok-v1","sessionId":"s-1"},"requestId":"j2"}"#,
            )
            .await;
        assert!(matches!(
            reply_to(&mut rx, "j2").await,
            ServerEvent::JoinedRoom(_)
        ));
    }

    #[tokio::test]
    async fn test_close_disconnects_from_room() {
        let h = harness();
        let (mut streamer, _streamer_rx) = socket(&h.context, "c-s");
        streamer
            .handle_text(r#"{"event":"join_room","data":{"token":"tok-streamer","sessionId":"s-1"}}"#)
            .await;
        let (mut viewer, mut rx) = socket(&h.context, "c-1");
        viewer
            .handle_text(
                r#"{"event":"join_room","data":{"token":"tok-v1","sessionId":"s-1"},"requestId":"j1"}"#,
            )
            .await;
        reply_to(&mut rx, "j1").await;

        viewer.close().await;

        let room = h
            .context
            .registry
            .get_room("s-1".to_string())
            .await
            .unwrap()
            .unwrap();
        let mut connections = usize::MAX;
        for _ in 0..100 {
            connections = room.get_state().await.unwrap().connection_count;
            if connections == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(connections, 1);
    }
}
