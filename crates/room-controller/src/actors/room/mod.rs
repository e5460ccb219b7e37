//! `RoomActor` - one per live session.
//!
//! The room actor is the only owner of a session's ephemeral state:
//!
//! - Joined sockets and the authoritative streamer socket
//! - Participant flags (`hasAudio`, `hasVideo`, `isScreenSharing`)
//! - Permission book, media registry and the session router
//! - Recording sub-state and the whiteboard op buffer
//!
//! Every mutation runs on the actor task, so two events for the same
//! session never interleave inside a handler.
//!
//! # Lifecycle
//!
//! 1. Spawned by `RoomRegistryActor` on the first join for a session
//! 2. Runs until its last socket leaves or the registry cancels it
//! 3. Teardown stops any recording, flushes the whiteboard, evicts
//!    remaining sockets and closes the router
//! 4. Messages still queued after teardown are answered with `RoomClosing`

mod lifecycle;
mod media;
mod negotiation;
mod recording;
mod whiteboard;

#[cfg(test)]
pub(crate) mod testing;

use super::connection::ConnectionActorHandle;
use super::messages::{JoinOutcome, RoomMessage, RoomSnapshot};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use crate::collaborators::{Collaborators, Identity, SessionRecord};
use crate::config::Config;
use crate::errors::RcError;
use crate::media::{MediaEngine, MediaRegistry, RouterInfo, WebRtcTransportOptions};
use crate::permissions::PermissionBook;
use crate::recording::{ActiveRecording, RecordingPipeline};
use crate::redis::{PresenceMirror, RoomPresence};
use crate::signaling::protocol::{
    ClientMessage, OutboundFrame, ParticipantRole, ParticipantView, ProducerView, ServerEvent,
};
use crate::whiteboard::{WhiteboardBuffer, WhiteboardDocument};

use chrono::Utc;
use common::types::SessionStatus;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default channel buffer size for the room mailbox.
const ROOM_CHANNEL_BUFFER: usize = 500;

/// How often finished connection actors are reaped while the room is idle.
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Time each connection actor gets to exit during teardown.
const CONNECTION_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-room knobs derived from [`Config`].
#[derive(Debug, Clone)]
pub struct RoomSettings {
    pub rtc: WebRtcTransportOptions,
    pub whiteboard_flush: Duration,
    pub whiteboard_undo_limit: usize,
    /// Emit `participant_updated` deltas before each snapshot.
    pub legacy_delta_updates: bool,
}

impl RoomSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            rtc: WebRtcTransportOptions {
                listen_ip: config.rtc_listen_ip.clone(),
                announced_ip: config.rtc_announced_ip.clone(),
                enable_udp: true,
                enable_tcp: true,
                prefer_udp: true,
            },
            whiteboard_flush: config.whiteboard_flush_interval(),
            whiteboard_undo_limit: config.whiteboard_undo_limit,
            legacy_delta_updates: config.legacy_delta_updates,
        }
    }
}

/// Shared dependencies handed to every room.
#[derive(Clone)]
pub struct RoomDeps {
    pub engine: Arc<dyn MediaEngine>,
    pub collaborators: Collaborators,
    pub recording: RecordingPipeline,
    pub presence: Option<Arc<dyn PresenceMirror>>,
    pub settings: RoomSettings,
    pub metrics: Arc<ActorMetrics>,
}

/// Handle to a `RoomActor`.
#[derive(Clone, Debug)]
pub struct RoomActorHandle {
    sender: mpsc::Sender<RoomMessage>,
    cancel_token: CancellationToken,
    session_id: String,
}

impl RoomActorHandle {
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Join a verified socket to the room.
    ///
    /// On success the room has already queued `joined_room` on the returned
    /// connection handle.
    pub async fn join(
        &self,
        connection_id: String,
        identity: Identity,
        outbound: mpsc::Sender<OutboundFrame>,
        request_id: Option<String>,
    ) -> Result<JoinOutcome, RcError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::Join {
                connection_id,
                identity,
                outbound,
                request_id,
                respond_to: tx,
            })
            .await
            .map_err(|_| RcError::RoomClosing)?;

        rx.await.map_err(|_| RcError::RoomClosing)?
    }

    /// Route a client message from a joined socket.
    pub async fn signal(
        &self,
        connection_id: String,
        message: ClientMessage,
    ) -> Result<Option<ServerEvent>, RcError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::Signal {
                connection_id,
                message,
                respond_to: tx,
            })
            .await
            .map_err(|_| RcError::RoomClosing)?;

        rx.await.map_err(|_| RcError::RoomClosing)?
    }

    /// Report a closed socket. A room that is already gone has nothing to
    /// clean up.
    pub async fn disconnect(&self, connection_id: String) {
        let _ = self
            .sender
            .send(RoomMessage::Disconnect { connection_id })
            .await;
    }

    pub async fn get_state(&self) -> Result<RoomSnapshot, RcError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::GetState { respond_to: tx })
            .await
            .map_err(|_| RcError::RoomClosing)?;

        rx.await.map_err(|_| RcError::RoomClosing)
    }

    /// Push an `external` event to every socket without waiting.
    pub fn emit(&self, name: String, payload: Value) -> Result<(), RcError> {
        self.sender
            .try_send(RoomMessage::Emit { name, payload })
            .map_err(|e| match e {
                TrySendError::Full(_) => {
                    RcError::CapacityExceeded("Room mailbox is full".to_string())
                }
                TrySendError::Closed(_) => RcError::RoomClosing,
            })
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Whether the room stopped taking messages.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// A joined socket.
struct ConnectedSocket {
    user_id: String,
    handle: ConnectionActorHandle,
    task_handle: JoinHandle<()>,
}

/// Participant entry. The streamer entry survives a disconnect with
/// `connected == false`; viewer entries are removed.
#[derive(Debug, Clone)]
struct Participant {
    user_id: String,
    display_name: Option<String>,
    role: ParticipantRole,
    connected: bool,
    has_audio: bool,
    has_video: bool,
    is_screen_sharing: bool,
}

impl Participant {
    fn to_view(&self, permissions: &PermissionBook) -> ParticipantView {
        ParticipantView {
            user_id: self.user_id.clone(),
            display_name: self.display_name.clone(),
            role: self.role,
            connected: self.connected,
            has_audio: self.has_audio,
            has_video: self.has_video,
            is_screen_sharing: self.is_screen_sharing,
            permissions: permissions.states_for(&self.user_id),
        }
    }
}

/// Sender of the message being handled.
#[derive(Debug, Clone)]
struct Caller {
    connection_id: String,
    user_id: String,
    display_name: Option<String>,
    is_streamer: bool,
}

/// The `RoomActor` implementation.
pub struct RoomActor {
    session_id: String,
    /// Incarnation number; fences presence writes against successors.
    generation: u64,
    receiver: mpsc::Receiver<RoomMessage>,
    /// Child of the registry's token.
    cancel_token: CancellationToken,
    deps: RoomDeps,
    mailbox: MailboxMonitor,
    /// Last session record seen; `None` until the first join.
    session: Option<SessionRecord>,
    sockets: HashMap<String, ConnectedSocket>,
    streamer_socket: Option<String>,
    participants: BTreeMap<String, Participant>,
    permissions: PermissionBook,
    media: MediaRegistry,
    router: Option<RouterInfo>,
    /// User with the live viewer screen share.
    screen_sharer: Option<String>,
    recording: Option<ActiveRecording>,
    whiteboard: WhiteboardBuffer,
    /// Cached document, kept in step with every save.
    document: Option<WhiteboardDocument>,
    peak: u32,
    /// Set by the first join attempt; an empty room closes after it.
    seen_join: bool,
}

impl RoomActor {
    /// Spawn a new room actor.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        session_id: String,
        generation: u64,
        deps: RoomDeps,
        cancel_token: CancellationToken,
    ) -> (RoomActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(ROOM_CHANNEL_BUFFER);

        let actor = Self {
            session_id: session_id.clone(),
            generation,
            receiver,
            cancel_token: cancel_token.clone(),
            mailbox: MailboxMonitor::new(ActorType::Room, &session_id),
            whiteboard: WhiteboardBuffer::new(deps.settings.whiteboard_flush),
            deps,
            session: None,
            sockets: HashMap::new(),
            streamer_socket: None,
            participants: BTreeMap::new(),
            permissions: PermissionBook::new(),
            media: MediaRegistry::new(),
            router: None,
            screen_sharer: None,
            recording: None,
            document: None,
            peak: 0,
            seen_join: false,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = RoomActorHandle {
            sender,
            cancel_token,
            session_id,
        };

        (handle, task_handle)
    }

    #[instrument(skip_all, name = "rc.actor.room", fields(session_id = %self.session_id))]
    async fn run(mut self) {
        info!(
            target: "rc.actor.room",
            session_id = %self.session_id,
            generation = self.generation,
            "RoomActor started"
        );

        let mut health_check = tokio::time::interval(HEALTH_CHECK_INTERVAL);
        health_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            self.check_connection_health().await;

            if self.seen_join && self.sockets.is_empty() {
                debug!(
                    target: "rc.actor.room",
                    session_id = %self.session_id,
                    "Last socket left, closing room"
                );
                break;
            }

            let flush_at = self.whiteboard.deadline();

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "rc.actor.room",
                        session_id = %self.session_id,
                        "RoomActor received cancellation signal"
                    );
                    break;
                }

                () = flush_due(flush_at) => {
                    if let Err(e) = self.flush_whiteboard().await {
                        warn!(
                            target: "rc.actor.room",
                            session_id = %self.session_id,
                            error = %e,
                            pending = self.whiteboard.len(),
                            "Whiteboard flush failed, will retry"
                        );
                    }
                }

                _ = health_check.tick() => {}

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_enqueue();
                            self.handle_message(message).await;
                            self.mailbox.record_dequeue();
                            self.deps.metrics.record_message_processed();
                        }
                        None => {
                            info!(
                                target: "rc.actor.room",
                                session_id = %self.session_id,
                                "RoomActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        // Refuse new messages first so the registry sees this room as closed.
        self.receiver.close();
        self.teardown().await;
        self.drain();

        info!(
            target: "rc.actor.room",
            session_id = %self.session_id,
            peak_participants = self.peak,
            messages_processed = self.mailbox.messages_processed(),
            "RoomActor stopped"
        );
    }

    async fn handle_message(&mut self, message: RoomMessage) {
        match message {
            RoomMessage::Join {
                connection_id,
                identity,
                outbound,
                request_id,
                respond_to,
            } => {
                self.seen_join = true;
                let result = self
                    .handle_join(connection_id, identity, outbound, request_id)
                    .await;
                let _ = respond_to.send(result);
            }

            RoomMessage::Signal {
                connection_id,
                message,
                respond_to,
            } => {
                let result = self.handle_signal(&connection_id, message).await;
                let _ = respond_to.send(result);
            }

            RoomMessage::Disconnect { connection_id } => {
                self.handle_disconnect(&connection_id).await;
            }

            RoomMessage::GetState { respond_to } => {
                let _ = respond_to.send(self.snapshot());
            }

            RoomMessage::Emit { name, payload } => {
                debug!(
                    target: "rc.actor.room",
                    session_id = %self.session_id,
                    name = %name,
                    "Emitting external event"
                );
                self.broadcast(&ServerEvent::External { name, payload }, None);
            }
        }
    }

    /// Dispatch one client message. `Ok(None)` means no direct reply.
    async fn handle_signal(
        &mut self,
        connection_id: &str,
        message: ClientMessage,
    ) -> Result<Option<ServerEvent>, RcError> {
        let caller = self.caller(connection_id)?;
        let action = message.name();
        let ack = |result: Result<(), RcError>| result.map(|()| Some(ServerEvent::Ack { action }));

        match message {
            ClientMessage::JoinRoom(_) => Err(RcError::Conflict(
                "Connection already joined a room".to_string(),
            )),
            ClientMessage::LeaveRoom => ack(self.handle_leave(&caller).await),
            ClientMessage::StreamerStart => ack(self.streamer_start(&caller).await),
            ClientMessage::StreamerPause => ack(self.streamer_pause(&caller).await),
            ClientMessage::StreamerResume => ack(self.streamer_resume(&caller).await),
            ClientMessage::StreamerEnd => ack(self.streamer_end(&caller).await),
            ClientMessage::GetRouterRtpCapabilities => {
                let router = self.router()?;
                Ok(Some(ServerEvent::RouterRtpCapabilities {
                    rtp_capabilities: router.rtp_capabilities.clone(),
                }))
            }
            ClientMessage::CreateTransport { direction } => {
                self.create_transport(&caller, direction).await.map(Some)
            }
            ClientMessage::ConnectTransport {
                transport_id,
                dtls_parameters,
            } => self
                .connect_transport(&caller, transport_id, &dtls_parameters)
                .await
                .map(Some),
            ClientMessage::Produce(request) => self.produce(&caller, request).await.map(Some),
            ClientMessage::Consume(request) => self.consume(&caller, request).await.map(Some),
            ClientMessage::ConsumerResume { consumer_id } => {
                self.resume_consumer(&caller, consumer_id).await.map(Some)
            }
            ClientMessage::ProducerPause { producer_id } => {
                ack(self.set_producer_paused(&caller, &producer_id, true).await)
            }
            ClientMessage::ProducerResume { producer_id } => {
                ack(self.set_producer_paused(&caller, &producer_id, false).await)
            }
            ClientMessage::ProducerClose { producer_id } => {
                ack(self.request_producer_close(&caller, &producer_id).await)
            }
            ClientMessage::PermissionRequest(capability) => {
                ack(self.request_permission(&caller, capability))
            }
            ClientMessage::PermissionResponse {
                capability,
                user_id,
                allow,
            } => ack(self.respond_permission(&caller, capability, &user_id, allow)),
            ClientMessage::PermissionRevoke {
                user_id,
                capability,
            } => ack(self.revoke_permission(&caller, &user_id, capability).await),
            ClientMessage::RecordingStart => ack(self.start_recording(&caller).await),
            ClientMessage::RecordingStop => ack(self.stop_recording(&caller).await),
            ClientMessage::WhiteboardDraw(op) => {
                self.whiteboard_draw(&caller, op);
                Ok(None)
            }
            ClientMessage::WhiteboardErase(op) => {
                self.whiteboard_erase(&caller, op);
                Ok(None)
            }
            ClientMessage::WhiteboardUndo => ack(self.whiteboard_history(false).await),
            ClientMessage::WhiteboardRedo => ack(self.whiteboard_history(true).await),
            ClientMessage::WhiteboardSave => self.whiteboard_save().await.map(Some),
            ClientMessage::ChatMessage { text } => {
                self.chat(&caller, &text)?;
                Ok(None)
            }
            ClientMessage::Ping => Ok(Some(ServerEvent::Pong)),
        }
    }

    fn caller(&self, connection_id: &str) -> Result<Caller, RcError> {
        let socket = self.sockets.get(connection_id).ok_or(RcError::NotInRoom)?;
        Ok(Caller {
            connection_id: connection_id.to_string(),
            user_id: socket.user_id.clone(),
            display_name: self
                .participants
                .get(&socket.user_id)
                .and_then(|p| p.display_name.clone()),
            is_streamer: self.streamer_socket.as_deref() == Some(connection_id),
        })
    }

    fn router(&self) -> Result<&RouterInfo, RcError> {
        self.router
            .as_ref()
            .ok_or_else(|| RcError::not_found("router", &self.session_id))
    }

    fn current_status(&self) -> Result<SessionStatus, RcError> {
        self.session
            .as_ref()
            .map(|s| s.status)
            .ok_or_else(|| RcError::Internal("session not loaded".to_string()))
    }

    // ------------------------------------------------------------------------
    // Fan-out
    // ------------------------------------------------------------------------

    /// Queue `event` on every socket except `except`.
    fn broadcast(&self, event: &ServerEvent, except: Option<&str>) {
        for (connection_id, socket) in &self.sockets {
            if except == Some(connection_id.as_str()) {
                continue;
            }
            socket.handle.deliver(OutboundFrame::push(event.clone()));
        }
    }

    fn send_to_connection(&self, connection_id: &str, event: ServerEvent) -> bool {
        self.sockets
            .get(connection_id)
            .is_some_and(|socket| socket.handle.deliver(OutboundFrame::push(event)))
    }

    /// Canonical `participants_list_updated` snapshot to the whole room.
    fn broadcast_participants(&self) {
        self.broadcast(
            &ServerEvent::ParticipantsListUpdated {
                participants: self.participant_views(),
            },
            None,
        );
    }

    fn participant_views(&self) -> Vec<ParticipantView> {
        self.participants
            .values()
            .map(|p| p.to_view(&self.permissions))
            .collect()
    }

    fn producer_views(&self) -> Vec<ProducerView> {
        let mut producers: Vec<ProducerView> = self
            .media
            .producers()
            .map(|p| ProducerView {
                producer_id: p.id.clone(),
                user_id: p.tag.user_id.clone(),
                kind: p.kind,
                source: p.source,
                paused: p.paused,
            })
            .collect();
        producers.sort_by(|a, b| a.producer_id.cmp(&b.producer_id));
        producers
    }

    /// Mirror presence to Redis, if configured. Failures are logged only.
    async fn publish_presence(&self) {
        let Some(mirror) = &self.deps.presence else {
            return;
        };
        let presence = RoomPresence {
            status: self.session.as_ref().map(|s| s.status),
            streamer_connected: self.streamer_socket.is_some(),
            participants: self.participant_views(),
            updated_at: Utc::now(),
        };
        if let Err(e) = mirror
            .publish(&self.session_id, self.generation, &presence)
            .await
        {
            warn!(
                target: "rc.actor.room",
                session_id = %self.session_id,
                error = %e,
                "Failed to publish presence"
            );
        }
    }

    fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            session_id: self.session_id.clone(),
            status: self.session.as_ref().map(|s| s.status),
            streamer_connection_id: self.streamer_socket.clone(),
            connection_count: self.sockets.len(),
            participants: self.participant_views(),
            producers: self.producer_views(),
            transport_count: self.media.transport_count(),
            consumer_count: self.media.consumer_count(),
            router_id: self.router.as_ref().map(|r| r.id.clone()),
            peak_participants: self.peak,
            recording_active: self.recording.is_some(),
            screen_sharer: self.screen_sharer.clone(),
            pending_whiteboard_ops: self.whiteboard.len(),
            whiteboard_version: self.document.as_ref().map(|d| d.version),
        }
    }

    // ------------------------------------------------------------------------
    // Supervision
    // ------------------------------------------------------------------------

    /// Reap connection actors that exited on their own (writer gone,
    /// evicted, panicked) and treat each as a disconnect.
    async fn check_connection_health(&mut self) {
        let finished: Vec<String> = self
            .sockets
            .iter()
            .filter(|(_, socket)| socket.task_handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect();

        for connection_id in finished {
            if let Some(socket) = self.sockets.get_mut(&connection_id) {
                if let Err(join_error) = (&mut socket.task_handle).await {
                    if join_error.is_panic() {
                        error!(
                            target: "rc.actor.room",
                            session_id = %self.session_id,
                            connection_id = %connection_id,
                            error = ?join_error,
                            "Connection actor panicked"
                        );
                        self.deps.metrics.record_panic(ActorType::Connection);
                    }
                }
            }
            self.handle_disconnect(&connection_id).await;
        }
    }

    /// Release everything the room owns. Every step is best effort.
    async fn teardown(&mut self) {
        info!(
            target: "rc.actor.room",
            session_id = %self.session_id,
            connections = self.sockets.len(),
            producers = self.media.producer_count(),
            "Tearing down room"
        );

        if let Some(active) = self.recording.take() {
            self.finish_recording(active).await;
        }

        if let Err(e) = self.flush_whiteboard().await {
            warn!(
                target: "rc.actor.room",
                session_id = %self.session_id,
                error = %e,
                dropped_ops = self.whiteboard.len(),
                "Final whiteboard flush failed"
            );
        }

        for socket in self.sockets.values() {
            socket.handle.evict("Room closed");
        }
        for (connection_id, socket) in self.sockets.drain() {
            match tokio::time::timeout(CONNECTION_SHUTDOWN_TIMEOUT, socket.task_handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(
                        target: "rc.actor.room",
                        session_id = %self.session_id,
                        connection_id = %connection_id,
                        error = ?e,
                        "Connection task panicked during shutdown"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "rc.actor.room",
                        session_id = %self.session_id,
                        connection_id = %connection_id,
                        "Connection shutdown timed out"
                    );
                    socket.handle.cancel();
                }
            }
        }
        self.streamer_socket = None;

        // Closing the router closes every transport, producer and consumer
        // created on it.
        self.media.clear();
        if let Some(router) = self.router.take() {
            if let Err(e) = self.deps.engine.close_router(&router.id).await {
                warn!(
                    target: "rc.actor.room",
                    session_id = %self.session_id,
                    router_id = %router.id,
                    error = %e,
                    "Failed to close router"
                );
            }
        }

        if let Some(mirror) = &self.deps.presence {
            if let Err(e) = mirror.clear(&self.session_id, self.generation).await {
                warn!(
                    target: "rc.actor.room",
                    session_id = %self.session_id,
                    error = %e,
                    "Failed to clear presence"
                );
            }
        }
    }

    /// Answer whatever was queued behind the teardown.
    fn drain(&mut self) {
        while let Ok(message) = self.receiver.try_recv() {
            match message {
                RoomMessage::Join { respond_to, .. } => {
                    let _ = respond_to.send(Err(RcError::RoomClosing));
                }
                RoomMessage::Signal { respond_to, .. } => {
                    let _ = respond_to.send(Err(RcError::RoomClosing));
                }
                RoomMessage::GetState { respond_to } => {
                    let _ = respond_to.send(self.snapshot());
                }
                RoomMessage::Disconnect { .. } | RoomMessage::Emit { .. } => {}
            }
        }
    }
}

/// Resolves at the whiteboard flush deadline, or never when none is armed.
async fn flush_due(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
