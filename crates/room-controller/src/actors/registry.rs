//! `RoomRegistryActor` - singleton owner of the live rooms.
//!
//! - Maps session ids to `RoomActor`s, spawning one on the first join
//! - Retires rooms that closed themselves (last socket left) and detects
//!   panicked rooms via their `JoinHandle`
//! - Owns the root `CancellationToken`; every room gets a child token
//! - Numbers room incarnations; a successor always has a higher generation
//!   than the room it replaces
//!
//! A retired room finishes its teardown on its own task. The registry never
//! waits on one session's teardown while handling another's request.
//!
//! # Graceful Shutdown
//!
//! On SIGTERM the registry:
//! 1. Sets `accepting_new = false` (new joins get `Draining`)
//! 2. Cancels every room, which stops recordings and flushes whiteboards
//! 3. Waits for the rooms up to the deadline

use crate::errors::RcError;

use super::messages::{RegistryMessage, RegistryStatus};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::room::{RoomActor, RoomActorHandle, RoomDeps};

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default channel buffer size for the registry mailbox.
const REGISTRY_CHANNEL_BUFFER: usize = 1000;

/// How often finished rooms are reaped.
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// How long a retired room may take to finish its teardown.
const RETIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline used when the registry is cancelled without an explicit
/// shutdown request.
const DEFAULT_SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

/// Handle to the `RoomRegistryActor`.
#[derive(Clone, Debug)]
pub struct RoomRegistryHandle {
    sender: mpsc::Sender<RegistryMessage>,
    cancel_token: CancellationToken,
}

impl RoomRegistryHandle {
    /// Room for `session_id`, spawned if none is live.
    pub async fn ensure_room(&self, session_id: String) -> Result<RoomActorHandle, RcError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::EnsureRoom {
                session_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| RcError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RcError::Internal(format!("response receive failed: {e}")))?
    }

    /// Live room for `session_id`, if any.
    pub async fn get_room(&self, session_id: String) -> Result<Option<RoomActorHandle>, RcError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::GetRoom {
                session_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| RcError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RcError::Internal(format!("response receive failed: {e}")))
    }

    pub async fn get_status(&self) -> Result<RegistryStatus, RcError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::GetStatus { respond_to: tx })
            .await
            .map_err(|e| RcError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RcError::Internal(format!("response receive failed: {e}")))
    }

    /// Stop taking rooms, cancel the live ones and wait up to `deadline`.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), RcError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::Shutdown {
                deadline,
                respond_to: tx,
            })
            .await
            .map_err(|e| RcError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RcError::Internal(format!("response receive failed: {e}")))?
    }

    /// Push an `external` event into a room. Returns false when no room is
    /// live for the session.
    pub async fn emit(
        &self,
        session_id: String,
        name: String,
        payload: Value,
    ) -> Result<bool, RcError> {
        match self.get_room(session_id).await? {
            Some(room) => {
                room.emit(name, payload)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// A live room and its task.
struct ManagedRoom {
    handle: RoomActorHandle,
    task_handle: JoinHandle<()>,
    generation: u64,
    created_at: DateTime<Utc>,
}

impl ManagedRoom {
    fn is_live(&self) -> bool {
        !self.handle.is_closed() && !self.task_handle.is_finished()
    }
}

/// The `RoomRegistryActor` implementation.
pub struct RoomRegistryActor {
    instance_id: String,
    receiver: mpsc::Receiver<RegistryMessage>,
    /// Root token; rooms get children.
    cancel_token: CancellationToken,
    deps: RoomDeps,
    rooms: HashMap<String, ManagedRoom>,
    /// Teardowns of retired rooms still running.
    retiring: JoinSet<()>,
    next_generation: u64,
    max_rooms: usize,
    accepting_new: bool,
    mailbox: MailboxMonitor,
}

impl RoomRegistryActor {
    /// Spawn the registry.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        instance_id: String,
        deps: RoomDeps,
        max_rooms: usize,
        cancel_token: CancellationToken,
    ) -> (RoomRegistryHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(REGISTRY_CHANNEL_BUFFER);

        let actor = Self {
            mailbox: MailboxMonitor::new(ActorType::Registry, &instance_id),
            instance_id,
            receiver,
            cancel_token: cancel_token.clone(),
            deps,
            rooms: HashMap::new(),
            retiring: JoinSet::new(),
            // Seeded from the clock so generations keep rising across restarts.
            next_generation: u64::try_from(Utc::now().timestamp_millis()).unwrap_or(1),
            max_rooms,
            accepting_new: true,
        };

        let task_handle = tokio::spawn(actor.run());

        (
            RoomRegistryHandle {
                sender,
                cancel_token,
            },
            task_handle,
        )
    }

    fn metrics(&self) -> &Arc<ActorMetrics> {
        &self.deps.metrics
    }

    #[instrument(skip_all, name = "rc.actor.registry", fields(instance_id = %self.instance_id))]
    async fn run(mut self) {
        info!(
            target: "rc.actor.registry",
            instance_id = %self.instance_id,
            max_rooms = self.max_rooms,
            "RoomRegistryActor started"
        );

        let mut health_check = tokio::time::interval(HEALTH_CHECK_INTERVAL);
        health_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "rc.actor.registry",
                        instance_id = %self.instance_id,
                        "RoomRegistryActor received cancellation signal"
                    );
                    self.drain_rooms(DEFAULT_SHUTDOWN_DEADLINE).await;
                    break;
                }

                _ = health_check.tick() => {
                    self.check_room_health();
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_enqueue();
                            self.handle_message(message).await;
                            self.mailbox.record_dequeue();
                            self.metrics().record_message_processed();
                        }
                        None => {
                            info!(
                                target: "rc.actor.registry",
                                instance_id = %self.instance_id,
                                "RoomRegistryActor channel closed, exiting"
                            );
                            self.drain_rooms(DEFAULT_SHUTDOWN_DEADLINE).await;
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "rc.actor.registry",
            instance_id = %self.instance_id,
            rooms_remaining = self.rooms.len(),
            messages_processed = self.mailbox.messages_processed(),
            "RoomRegistryActor stopped"
        );
    }

    async fn handle_message(&mut self, message: RegistryMessage) {
        match message {
            RegistryMessage::EnsureRoom {
                session_id,
                respond_to,
            } => {
                let result = self.ensure_room(session_id).await;
                let _ = respond_to.send(result);
            }

            RegistryMessage::GetRoom {
                session_id,
                respond_to,
            } => {
                let room = self
                    .rooms
                    .get(&session_id)
                    .filter(|managed| managed.is_live())
                    .map(|managed| managed.handle.clone());
                let _ = respond_to.send(room);
            }

            RegistryMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(self.status());
            }

            RegistryMessage::Shutdown {
                deadline,
                respond_to,
            } => {
                self.drain_rooms(deadline).await;
                let _ = respond_to.send(Ok(()));
            }
        }
    }

    async fn ensure_room(&mut self, session_id: String) -> Result<RoomActorHandle, RcError> {
        if !self.accepting_new {
            return Err(RcError::Draining);
        }

        if let Some(managed) = self.rooms.get(&session_id) {
            if managed.is_live() {
                return Ok(managed.handle.clone());
            }
        }
        // A room that closed itself stays in the map until reaped.
        if let Some(managed) = self.rooms.remove(&session_id) {
            self.retire(session_id.clone(), managed);
        }

        if self.rooms.len() >= self.max_rooms {
            warn!(
                target: "rc.actor.registry",
                instance_id = %self.instance_id,
                rooms = self.rooms.len(),
                "Room capacity reached"
            );
            return Err(RcError::CapacityExceeded(
                "No room capacity on this instance".to_string(),
            ));
        }

        let generation = self.next_generation;
        self.next_generation += 1;
        let (handle, task_handle) = RoomActor::spawn(
            session_id.clone(),
            generation,
            self.deps.clone(),
            self.cancel_token.child_token(),
        );
        self.rooms.insert(
            session_id.clone(),
            ManagedRoom {
                handle: handle.clone(),
                task_handle,
                generation,
                created_at: Utc::now(),
            },
        );
        self.metrics().room_created();

        info!(
            target: "rc.actor.registry",
            instance_id = %self.instance_id,
            session_id = %session_id,
            generation,
            total_rooms = self.rooms.len(),
            "Room actor created"
        );
        Ok(handle)
    }

    fn status(&self) -> RegistryStatus {
        RegistryStatus {
            instance_id: self.instance_id.clone(),
            room_count: self.rooms.len(),
            connection_count: self.metrics().connection_count(),
            accepting_new: self.accepting_new,
            max_rooms: self.max_rooms,
        }
    }

    /// Reap rooms whose task finished, and collect finished teardowns.
    fn check_room_health(&mut self) {
        let finished: Vec<String> = self
            .rooms
            .iter()
            .filter(|(_, managed)| managed.task_handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect();

        for session_id in finished {
            if let Some(managed) = self.rooms.remove(&session_id) {
                self.retire(session_id, managed);
            }
        }

        while self.retiring.try_join_next().is_some() {}
    }

    /// Cancel a removed room and await its teardown off the registry task.
    fn retire(&mut self, session_id: String, managed: ManagedRoom) {
        let instance_id = self.instance_id.clone();
        let metrics = Arc::clone(self.metrics());

        managed.handle.cancel();
        self.retiring.spawn(async move {
            let lifetime = Utc::now()
                .signed_duration_since(managed.created_at)
                .num_seconds();
            match tokio::time::timeout(RETIRE_TIMEOUT, managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "rc.actor.registry",
                        instance_id = %instance_id,
                        session_id = %session_id,
                        generation = managed.generation,
                        lifetime_secs = lifetime,
                        "Room actor exited cleanly"
                    );
                }
                Ok(Err(join_error)) => {
                    if join_error.is_panic() {
                        error!(
                            target: "rc.actor.registry",
                            instance_id = %instance_id,
                            session_id = %session_id,
                            generation = managed.generation,
                            error = ?join_error,
                            "Room actor panicked"
                        );
                        metrics.record_panic(ActorType::Room);
                    }
                }
                Err(_) => {
                    warn!(
                        target: "rc.actor.registry",
                        instance_id = %instance_id,
                        session_id = %session_id,
                        generation = managed.generation,
                        "Room actor cleanup timed out"
                    );
                }
            }
            metrics.room_removed();
        });
    }

    /// Stop taking rooms, cancel every live one and wait for each until
    /// `deadline` has passed.
    async fn drain_rooms(&mut self, deadline: Duration) {
        self.accepting_new = false;
        let deadline_at = Instant::now() + deadline;

        info!(
            target: "rc.actor.registry",
            instance_id = %self.instance_id,
            room_count = self.rooms.len(),
            deadline_secs = deadline.as_secs(),
            "Draining rooms"
        );

        for managed in self.rooms.values() {
            managed.handle.cancel();
        }

        let rooms: Vec<(String, ManagedRoom)> = self.rooms.drain().collect();
        for (session_id, managed) in rooms {
            match tokio::time::timeout_at(deadline_at, managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "rc.actor.registry",
                        instance_id = %self.instance_id,
                        session_id = %session_id,
                        "Room actor completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "rc.actor.registry",
                        instance_id = %self.instance_id,
                        session_id = %session_id,
                        error = ?e,
                        "Room actor task panicked during shutdown"
                    );
                    if e.is_panic() {
                        self.metrics().record_panic(ActorType::Room);
                    }
                }
                Err(_) => {
                    warn!(
                        target: "rc.actor.registry",
                        instance_id = %self.instance_id,
                        session_id = %session_id,
                        "Room actor shutdown timed out"
                    );
                }
            }
            self.metrics().room_removed();
        }

        let retiring = self.retiring.len();
        if tokio::time::timeout_at(deadline_at, async {
            while self.retiring.join_next().await.is_some() {}
        })
        .await
        .is_err()
        {
            warn!(
                target: "rc.actor.registry",
                instance_id = %self.instance_id,
                retiring,
                "Retired room teardowns outlived the shutdown deadline"
            );
            self.retiring.abort_all();
        }

        info!(
            target: "rc.actor.registry",
            instance_id = %self.instance_id,
            "Room drain complete"
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::actors::room::testing::{
        session, streamer_identity, viewer_identity, Fixture, WHITEBOARD_ID,
    };
    use common::types::SessionStatus;
    use serde_json::json;

    fn registry(fx: &Fixture, max_rooms: usize) -> RoomRegistryHandle {
        RoomRegistryActor::spawn(
            "rc-test".to_string(),
            fx.deps(),
            max_rooms,
            CancellationToken::new(),
        )
        .0
    }

    #[tokio::test]
    async fn test_ensure_room_reuses_live_room() {
        let fx = Fixture::new(session("s-1", SessionStatus::Active));
        let registry = registry(&fx, 10);

        let first = registry.ensure_room("s-1".to_string()).await.unwrap();
        let _client = fx.join(&first, "c-1", viewer_identity("v1")).await.unwrap();
        let second = registry.ensure_room("s-1".to_string()).await.unwrap();

        assert_eq!(second.get_state().await.unwrap().connection_count, 1);
        assert_eq!(registry.get_status().await.unwrap().room_count, 1);
        registry.cancel();
    }

    #[tokio::test]
    async fn test_closed_room_is_replaced() {
        let fx = Fixture::new(session("s-1", SessionStatus::Active));
        let registry = registry(&fx, 10);

        let first = registry.ensure_room("s-1".to_string()).await.unwrap();
        let _client = fx.join(&first, "c-1", viewer_identity("v1")).await.unwrap();
        first.disconnect("c-1".to_string()).await;
        for _ in 0..100 {
            if first.is_closed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(first.is_closed());

        let second = registry.ensure_room("s-1".to_string()).await.unwrap();
        assert!(!second.is_closed());
        assert!(fx.join(&second, "c-2", viewer_identity("v1")).await.is_ok());
        registry.cancel();
    }

    #[tokio::test]
    async fn test_capacity_limit() {
        let fx = Fixture::new(session("s-1", SessionStatus::Active));
        let registry = registry(&fx, 1);

        registry.ensure_room("s-1".to_string()).await.unwrap();
        let result = registry.ensure_room("s-2".to_string()).await;
        assert!(matches!(result, Err(RcError::CapacityExceeded(_))));
        registry.cancel();
    }

    #[tokio::test]
    async fn test_get_room_and_emit() {
        let fx = Fixture::new(session("s-1", SessionStatus::Active));
        let registry = registry(&fx, 10);

        assert!(registry.get_room("s-1".to_string()).await.unwrap().is_none());
        assert!(!registry
            .emit("s-1".to_string(), "poll".to_string(), json!({}))
            .await
            .unwrap());

        let room = registry.ensure_room("s-1".to_string()).await.unwrap();
        let mut client = fx.join(&room, "c-1", viewer_identity("v1")).await.unwrap();
        assert!(registry
            .emit("s-1".to_string(), "poll".to_string(), json!({ "q": 1 }))
            .await
            .unwrap());

        let event = client
            .expect(|e| matches!(e, crate::signaling::protocol::ServerEvent::External { .. }))
            .await;
        assert!(matches!(
            event,
            crate::signaling::protocol::ServerEvent::External { ref name, .. } if name == "poll"
        ));
        registry.cancel();
    }

    #[tokio::test]
    async fn test_shutdown_drains_rooms() {
        let fx = Fixture::new(session("s-1", SessionStatus::Active));
        let registry = registry(&fx, 10);

        let room = registry.ensure_room("s-1".to_string()).await.unwrap();
        let _streamer = fx.join(&room, "c-s", streamer_identity()).await.unwrap();
        room.signal(
            "c-s".to_string(),
            crate::signaling::protocol::ClientMessage::WhiteboardErase(
                crate::signaling::protocol::EraseOp {
                    element_id: "x".to_string(),
                },
            ),
        )
        .await
        .unwrap();

        registry.shutdown(Duration::from_secs(5)).await.unwrap();

        assert!(room.is_closed());
        assert_eq!(fx.engine.live_router_count(), 0);
        assert_eq!(fx.platform.whiteboard(WHITEBOARD_ID).unwrap().version, 1);

        let status = registry.get_status().await.unwrap();
        assert!(!status.accepting_new);
        assert_eq!(status.room_count, 0);
        let refused = registry.ensure_room("s-1".to_string()).await;
        assert!(matches!(refused, Err(RcError::Draining)));
    }

    #[tokio::test]
    async fn test_slow_teardown_does_not_block_other_sessions() {
        let fx = Fixture::new(session("s-1", SessionStatus::Active));
        let registry = registry(&fx, 10);
        fx.platform
            .set_whiteboard_save_delay(Some(Duration::from_millis(1500)));

        let old = registry.ensure_room("s-1".to_string()).await.unwrap();
        let _streamer = fx.join(&old, "c-s", streamer_identity()).await.unwrap();
        old.signal(
            "c-s".to_string(),
            crate::signaling::protocol::ClientMessage::WhiteboardErase(
                crate::signaling::protocol::EraseOp {
                    element_id: "x".to_string(),
                },
            ),
        )
        .await
        .unwrap();
        old.disconnect("c-s".to_string()).await;
        for _ in 0..100 {
            if old.is_closed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(old.is_closed());

        // The old room is still flushing its whiteboard; nobody waits on it.
        let started = Instant::now();
        let replacement = tokio::time::timeout(
            Duration::from_millis(500),
            registry.ensure_room("s-1".to_string()),
        )
        .await
        .expect("ensure_room blocked behind a closing room")
        .unwrap();
        let unrelated = tokio::time::timeout(Duration::from_millis(500), async {
            registry.ensure_room("s-2".to_string()).await.unwrap();
            registry.get_status().await.unwrap()
        })
        .await
        .expect("registry blocked behind a closing room");
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(unrelated.room_count, 2);
        assert!(!replacement.is_closed());

        // The successor publishes; the old teardown's clear must not undo it.
        let _back = fx
            .join(&replacement, "c-s2", streamer_identity())
            .await
            .unwrap();
        let successor_generation = fx.presence.generation("s-1").unwrap();
        tokio::time::sleep(Duration::from_millis(2000)).await;

        assert_eq!(fx.platform.whiteboard(WHITEBOARD_ID).unwrap().version, 1);
        let presence = fx.presence.get("s-1").expect("successor presence cleared");
        assert!(presence.streamer_connected);
        assert_eq!(fx.presence.generation("s-1"), Some(successor_generation));
        registry.cancel();
    }

    #[tokio::test]
    async fn test_successor_room_gets_higher_generation() {
        let fx = Fixture::new(session("s-1", SessionStatus::Active));
        let registry = registry(&fx, 10);

        let first = registry.ensure_room("s-1".to_string()).await.unwrap();
        let _client = fx.join(&first, "c-1", viewer_identity("v1")).await.unwrap();
        let first_generation = fx.presence.generation("s-1").unwrap();
        first.disconnect("c-1".to_string()).await;
        for _ in 0..100 {
            if first.is_closed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let second = registry.ensure_room("s-1".to_string()).await.unwrap();
        let _client = fx.join(&second, "c-2", viewer_identity("v1")).await.unwrap();
        assert!(fx.presence.generation("s-1").unwrap() > first_generation);
        registry.cancel();
    }
}
