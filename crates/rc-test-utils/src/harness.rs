//! In-process room controller for integration tests.
//!
//! `TestRoomController` wires the real registry, rooms and signaling
//! dispatcher to in-memory collaborators. `TestSocket` plays one WebSocket:
//! it feeds JSON text frames to a dispatcher and reads back the serialized
//! frames the socket writer would send.

use crate::tokens::TEST_JWT_SECRET;
use common::secret::SecretString;
use room_controller::actors::{
    ActorMetrics, RoomDeps, RoomRegistryActor, RoomRegistryHandle, RoomSettings, RoomSnapshot,
};
use room_controller::collaborators::identity::JwtIdentityVerifier;
use room_controller::collaborators::memory::InMemoryPlatform;
use room_controller::collaborators::{Collaborators, SessionRecord};
use room_controller::media::mock::MockMediaEngine;
use room_controller::media::WebRtcTransportOptions;
use room_controller::recording::transcoder::mock::MockTranscoder;
use room_controller::recording::{RecordingPipeline, RecordingSettings, RtpPortAllocator};
use room_controller::redis::presence::mock::InMemoryPresence;
use room_controller::signaling::protocol::OutboundFrame;
use room_controller::signaling::{SignalingContext, SignalingDispatcher};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// How long a socket waits for an expected frame.
pub const DEFAULT_EXPECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Knobs for [`TestRoomController::start_with`].
#[derive(Debug, Clone)]
pub struct HarnessOptions {
    pub max_rooms: usize,
    pub whiteboard_flush: Duration,
    pub whiteboard_undo_limit: usize,
    pub legacy_delta_updates: bool,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            max_rooms: 100,
            whiteboard_flush: Duration::from_millis(200),
            whiteboard_undo_limit: 500,
            legacy_delta_updates: true,
        }
    }
}

/// The room controller minus its network listeners.
pub struct TestRoomController {
    pub platform: InMemoryPlatform,
    pub engine: Arc<MockMediaEngine>,
    pub transcoder: MockTranscoder,
    pub presence: InMemoryPresence,
    pub registry: RoomRegistryHandle,
    pub metrics: Arc<ActorMetrics>,
    context: SignalingContext,
    registry_task: JoinHandle<()>,
    _recordings: TempDir,
}

impl TestRoomController {
    /// Start with default options and `sessions` stored in the platform.
    #[must_use]
    pub fn start(sessions: impl IntoIterator<Item = SessionRecord>) -> Self {
        Self::start_with(sessions, HarnessOptions::default())
    }

    #[must_use]
    pub fn start_with(
        sessions: impl IntoIterator<Item = SessionRecord>,
        options: HarnessOptions,
    ) -> Self {
        let platform = InMemoryPlatform::new();
        for session in sessions {
            platform.insert_session(session);
        }
        let engine = Arc::new(MockMediaEngine::new());
        let transcoder = MockTranscoder::new();
        let presence = InMemoryPresence::new();
        let recordings = tempfile::tempdir().expect("create recording dir");
        let metrics = ActorMetrics::new();

        let collaborators = Collaborators::from_backend(Arc::new(platform.clone()));
        let recording = RecordingPipeline::new(
            engine.clone(),
            Arc::new(transcoder.clone()),
            collaborators.storage.clone(),
            RtpPortAllocator::new(30000),
            RecordingSettings {
                dir: recordings.path().to_path_buf(),
                listen_ip: "127.0.0.1".to_string(),
                stop_grace: Duration::from_millis(100),
            },
        );

        let deps = RoomDeps {
            engine: engine.clone(),
            collaborators: collaborators.clone(),
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
                whiteboard_flush: options.whiteboard_flush,
                whiteboard_undo_limit: options.whiteboard_undo_limit,
                legacy_delta_updates: options.legacy_delta_updates,
            },
            metrics: Arc::clone(&metrics),
        };

        let (registry, registry_task) = RoomRegistryActor::spawn(
            format!("rc-test-{}", Uuid::new_v4()),
            deps,
            options.max_rooms,
            CancellationToken::new(),
        );

        let identity = Arc::new(JwtIdentityVerifier::new(SecretString::from(
            TEST_JWT_SECRET.to_string(),
        )));
        let context = SignalingContext::new(registry.clone(), identity, collaborators.sessions);

        Self {
            platform,
            engine,
            transcoder,
            presence,
            registry,
            metrics,
            context,
            registry_task,
            _recordings: recordings,
        }
    }

    /// Open a new socket.
    #[must_use]
    pub fn connect(&self) -> TestSocket {
        let connection_id = format!("conn-{}", Uuid::new_v4());
        let (tx, rx) = mpsc::channel(1024);
        TestSocket {
            dispatcher: Some(SignalingDispatcher::new(
                connection_id,
                self.context.clone(),
                tx,
            )),
            rx,
            backlog: VecDeque::new(),
            next_request: 0,
        }
    }

    /// Signaling context shared by every socket of this controller.
    #[must_use]
    pub fn signaling_context(&self) -> SignalingContext {
        self.context.clone()
    }

    /// Snapshot of a live room.
    pub async fn room_state(&self, session_id: &str) -> Option<RoomSnapshot> {
        let room = self
            .registry
            .get_room(session_id.to_string())
            .await
            .expect("registry is running")?;
        room.get_state().await.ok()
    }

    /// Poll until `check` holds for the room snapshot.
    pub async fn wait_for_room(
        &self,
        session_id: &str,
        check: impl Fn(&RoomSnapshot) -> bool,
    ) -> RoomSnapshot {
        let deadline = tokio::time::Instant::now() + DEFAULT_EXPECT_TIMEOUT;
        loop {
            if let Some(state) = self.room_state(session_id).await {
                if check(&state) {
                    return state;
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "room {session_id} never reached the expected state"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Poll until no live room exists for `session_id`.
    pub async fn wait_for_room_closed(&self, session_id: &str) {
        let deadline = tokio::time::Instant::now() + DEFAULT_EXPECT_TIMEOUT;
        loop {
            let room = self
                .registry
                .get_room(session_id.to_string())
                .await
                .expect("registry is running");
            if room.is_none() {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "room {session_id} never closed"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Drain every room and stop the registry.
    pub async fn shutdown(self) {
        self.registry
            .shutdown(Duration::from_secs(5))
            .await
            .expect("registry shutdown");
        self.registry.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(5), self.registry_task).await;
    }
}

/// One simulated signaling socket.
pub struct TestSocket {
    dispatcher: Option<SignalingDispatcher>,
    rx: mpsc::Receiver<OutboundFrame>,
    /// Frames read while waiting for something else.
    backlog: VecDeque<Value>,
    next_request: u64,
}

impl TestSocket {
    fn dispatcher(&mut self) -> &mut SignalingDispatcher {
        self.dispatcher.as_mut().expect("socket already closed")
    }

    /// Send a frame without a request id.
    pub async fn send(&mut self, event: &str, data: Value) {
        let text = json!({ "event": event, "data": data }).to_string();
        self.dispatcher().handle_text(&text).await;
    }

    /// Send raw text, e.g. a malformed frame.
    pub async fn send_text(&mut self, text: &str) {
        self.dispatcher().handle_text(text).await;
    }

    /// Send a frame with a fresh request id and return the frame that
    /// answers it.
    pub async fn request(&mut self, event: &str, data: Value) -> Value {
        self.next_request += 1;
        let request_id = format!("req-{}", self.next_request);
        let text =
            json!({ "event": event, "data": data, "requestId": request_id }).to_string();
        self.dispatcher().handle_text(&text).await;

        let position = self
            .backlog
            .iter()
            .position(|frame| frame["requestId"] == request_id.as_str());
        if let Some(frame) = position.and_then(|i| self.backlog.remove(i)) {
            return frame;
        }
        loop {
            let frame = self.recv().await;
            if frame["requestId"] == request_id.as_str() {
                return frame;
            }
            self.backlog.push_back(frame);
        }
    }

    /// `join_room` by session id; returns the answering frame.
    pub async fn join(&mut self, token: &str, session_id: &str) -> Value {
        self.request(
            "join_room",
            json!({ "token": token, "sessionId": session_id }),
        )
        .await
    }

    /// Next frame named `event`, skipping others.
    pub async fn expect_event(&mut self, event: &str) -> Value {
        if let Some(i) = self.backlog.iter().position(|f| f["event"] == event) {
            if let Some(frame) = self.backlog.remove(i) {
                return frame;
            }
        }
        loop {
            let frame = self.recv().await;
            if frame["event"] == event {
                return frame;
            }
        }
    }

    /// Assert no frame named `event` arrives within `within`.
    pub async fn expect_no_event(&mut self, event: &str, within: Duration) {
        assert!(
            !self.backlog.iter().any(|f| f["event"] == event),
            "unexpected {event} frame already received"
        );
        let _ = tokio::time::timeout(within, async {
            loop {
                let Some(frame) = self.rx.recv().await else {
                    return;
                };
                let frame = to_value(&frame);
                assert!(frame["event"] != event, "unexpected {event} frame: {frame}");
                self.backlog.push_back(frame);
            }
        })
        .await;
    }

    /// Close the socket, as the WebSocket read loop does on EOF.
    pub async fn close(&mut self) {
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.close().await;
        }
    }

    async fn recv(&mut self) -> Value {
        let frame = tokio::time::timeout(DEFAULT_EXPECT_TIMEOUT, self.rx.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket writer closed");
        to_value(&frame)
    }
}

fn to_value(frame: &OutboundFrame) -> Value {
    let text = frame.to_json().expect("frame serializes");
    serde_json::from_str(&text).expect("frame is JSON")
}
