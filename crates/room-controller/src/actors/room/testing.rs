//! Room test fixture: a room over the mock engine and in-memory platform,
//! plus a client that reads what the room pushes to one socket.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::{RoomActor, RoomActorHandle, RoomDeps, RoomSettings};
use crate::actors::metrics::ActorMetrics;
use crate::collaborators::memory::InMemoryPlatform;
use crate::collaborators::{Collaborators, Identity, SessionRecord};
use crate::errors::RcError;
use crate::media::mock::MockMediaEngine;
use crate::media::{MediaKind, MediaSource, TransportDirection, WebRtcTransportOptions};
use crate::permissions::Capability;
use crate::recording::transcoder::mock::MockTranscoder;
use crate::recording::{RecordingPipeline, RecordingSettings, RtpPortAllocator};
use crate::redis::presence::mock::InMemoryPresence;
use crate::signaling::protocol::{
    ClientMessage, ConsumeRequest, OutboundFrame, ParticipantRole, ProduceAppData,
    ProduceRequest, ServerEvent,
};
use common::types::{SessionStatus, UserRole};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use super::RoomActorHandle as TestRoom;

pub const STREAMER_ID: &str = "u-streamer";
pub const WHITEBOARD_ID: &str = "wb-1";

const CLIENT_BUFFER: usize = 1024;
const EXPECT_TIMEOUT: Duration = Duration::from_secs(5);

pub fn session(id: &str, status: SessionStatus) -> SessionRecord {
    SessionRecord {
        id: id.to_string(),
        room_code: format!("ROOM-{id}"),
        streamer_id: STREAMER_ID.to_string(),
        status,
        max_participants: 100,
        peak_participants: 0,
        total_joins: 0,
        whiteboard_id: Some(WHITEBOARD_ID.to_string()),
        is_private: false,
        allowed_user_ids: Vec::new(),
        recordings: Vec::new(),
        started_at: None,
        ended_at: None,
    }
}

pub fn identity(user_id: &str, role: UserRole) -> Identity {
    Identity {
        user_id: user_id.to_string(),
        role,
        display_name: Some(format!("User {user_id}")),
    }
}

pub fn streamer_identity() -> Identity {
    identity(STREAMER_ID, UserRole::Streamer)
}

pub fn viewer_identity(user_id: &str) -> Identity {
    identity(user_id, UserRole::Viewer)
}

/// Outbound side of one joined socket.
pub struct TestClient {
    pub role: ParticipantRole,
    rx: mpsc::Receiver<OutboundFrame>,
}

impl TestClient {
    /// Skip frames until one matches `pred`.
    pub async fn expect(&mut self, pred: impl Fn(&ServerEvent) -> bool) -> ServerEvent {
        tokio::time::timeout(EXPECT_TIMEOUT, async {
            loop {
                let frame = self.rx.recv().await.expect("socket writer closed");
                if pred(&frame.event) {
                    return frame.event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }
}

pub struct Fixture {
    pub platform: InMemoryPlatform,
    pub engine: Arc<MockMediaEngine>,
    pub presence: InMemoryPresence,
    pub transcoder: MockTranscoder,
    deps: RoomDeps,
    _dir: tempfile::TempDir,
}

impl Fixture {
    pub fn new(record: SessionRecord) -> Self {
        let platform = InMemoryPlatform::new().with_session(record);
        let engine = Arc::new(MockMediaEngine::new());
        let presence = InMemoryPresence::new();
        let transcoder = MockTranscoder::new();
        let dir = tempfile::tempdir().unwrap();

        let collaborators = Collaborators::from_backend(Arc::new(platform.clone()));
        let recording = RecordingPipeline::new(
            engine.clone(),
            Arc::new(transcoder.clone()),
            collaborators.storage.clone(),
            RtpPortAllocator::new(20000),
            RecordingSettings {
                dir: dir.path().to_path_buf(),
                listen_ip: "127.0.0.1".to_string(),
                stop_grace: Duration::from_millis(100),
            },
        );

        let deps = RoomDeps {
            engine: engine.clone(),
            collaborators,
            recording,
            presence: Some(Arc::new(presence.clone())),
            settings: RoomSettings {
                rtc: WebRtcTransportOptions {
                    listen_ip: "127.0.0.1".to_string(),
                    announced_ip: None,
                    enable_udp: true,
                    enable_tcp: true,
                    prefer_udp: true,
                },
                whiteboard_flush: Duration::from_secs(2),
                whiteboard_undo_limit: 500,
                legacy_delta_updates: true,
            },
            metrics: ActorMetrics::new(),
        };

        Self {
            platform,
            engine,
            presence,
            transcoder,
            deps,
            _dir: dir,
        }
    }

    /// Dependencies the fixture hands to every room it spawns.
    pub fn deps(&self) -> RoomDeps {
        self.deps.clone()
    }

    pub fn spawn_room(&self, session_id: &str) -> RoomActorHandle {
        self.spawn_room_with_task(session_id).0
    }

    pub fn spawn_room_with_task(&self, session_id: &str) -> (RoomActorHandle, JoinHandle<()>) {
        RoomActor::spawn(
            session_id.to_string(),
            1,
            self.deps.clone(),
            CancellationToken::new(),
        )
    }

    pub async fn join(
        &self,
        room: &RoomActorHandle,
        connection_id: &str,
        identity: Identity,
    ) -> Result<TestClient, RcError> {
        let (tx, rx) = mpsc::channel(CLIENT_BUFFER);
        let outcome = room
            .join(connection_id.to_string(), identity, tx, None)
            .await?;
        Ok(TestClient {
            role: outcome.role,
            rx,
        })
    }

    /// Create a send transport for `connection_id`.
    pub async fn transport(&self, room: &RoomActorHandle, connection_id: &str) -> String {
        self.transport_with(room, connection_id, TransportDirection::Send)
            .await
    }

    async fn transport_with(
        &self,
        room: &RoomActorHandle,
        connection_id: &str,
        direction: TransportDirection,
    ) -> String {
        let reply = room
            .signal(
                connection_id.to_string(),
                ClientMessage::CreateTransport { direction },
            )
            .await
            .unwrap();
        match reply {
            Some(ServerEvent::TransportCreated(payload)) => payload.transport.id,
            other => unreachable!("unexpected reply: {other:?}"),
        }
    }

    /// Create a send transport and publish one track on it.
    pub async fn produce(
        &self,
        room: &RoomActorHandle,
        connection_id: &str,
        source: MediaSource,
        kind: MediaKind,
    ) -> Result<String, RcError> {
        let transport_id = self.transport(room, connection_id).await;
        self.produce_on(room, connection_id, &transport_id, source, kind)
            .await
    }

    pub async fn produce_on(
        &self,
        room: &RoomActorHandle,
        connection_id: &str,
        transport_id: &str,
        source: MediaSource,
        kind: MediaKind,
    ) -> Result<String, RcError> {
        let reply = room
            .signal(
                connection_id.to_string(),
                ClientMessage::Produce(ProduceRequest {
                    transport_id: transport_id.to_string(),
                    kind,
                    rtp_parameters: json!({ "codecs": [] }),
                    app_data: ProduceAppData { source },
                }),
            )
            .await?;
        match reply {
            Some(ServerEvent::Produced { producer_id }) => Ok(producer_id),
            other => unreachable!("unexpected reply: {other:?}"),
        }
    }

    /// Create a receive transport and consume `producer_id` on it.
    pub async fn consume(
        &self,
        room: &RoomActorHandle,
        connection_id: &str,
        producer_id: &str,
    ) -> Result<String, RcError> {
        let transport_id = self
            .transport_with(room, connection_id, TransportDirection::Recv)
            .await;
        let reply = room
            .signal(
                connection_id.to_string(),
                ClientMessage::Consume(ConsumeRequest {
                    transport_id,
                    producer_id: producer_id.to_string(),
                    rtp_capabilities: json!({}),
                }),
            )
            .await?;
        match reply {
            Some(ServerEvent::Consumed(payload)) => Ok(payload.consumer_id),
            other => unreachable!("unexpected reply: {other:?}"),
        }
    }

    /// Viewer requests `capability`; the streamer allows it.
    pub async fn grant(
        &self,
        room: &RoomActorHandle,
        streamer_connection: &str,
        viewer_connection: &str,
        viewer_id: &str,
        capability: Capability,
    ) {
        room.signal(
            viewer_connection.to_string(),
            ClientMessage::PermissionRequest(capability),
        )
        .await
        .unwrap();
        room.signal(
            streamer_connection.to_string(),
            ClientMessage::PermissionResponse {
                capability,
                user_id: viewer_id.to_string(),
                allow: true,
            },
        )
        .await
        .unwrap();
    }
}
