//! Join, leave, disconnect and streamer session control.

use super::{Caller, ConnectedSocket, Participant, RoomActor};
use crate::actors::connection::ConnectionActor;
use crate::actors::messages::JoinOutcome;
use crate::collaborators::Identity;
use crate::errors::RcError;
use crate::media::default_media_codecs;
use crate::signaling::protocol::{JoinedRoomPayload, OutboundFrame, ParticipantRole, ServerEvent};

use chrono::Utc;
use common::types::{SessionStatus, UserRole};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

impl RoomActor {
    #[instrument(skip_all, fields(session_id = %self.session_id, user_id = %identity.user_id))]
    pub(super) async fn handle_join(
        &mut self,
        connection_id: String,
        identity: Identity,
        outbound: mpsc::Sender<OutboundFrame>,
        request_id: Option<String>,
    ) -> Result<JoinOutcome, RcError> {
        if self.sockets.contains_key(&connection_id) {
            return Err(RcError::Conflict("Connection already joined".to_string()));
        }

        // Always re-read: status and allow-list change outside the room.
        let session = self.deps.collaborators.sessions.get(&self.session_id).await?;
        if !session.status.is_joinable() {
            return Err(RcError::SessionNotJoinable(session.status));
        }

        // A streamer token only takes the seat of its own session.
        let is_streamer =
            identity.role == UserRole::Streamer && identity.user_id == session.streamer_id;

        if session.is_private
            && !is_streamer
            && !session.allowed_user_ids.contains(&identity.user_id)
        {
            return Err(RcError::PermissionDenied(
                "This session is private".to_string(),
            ));
        }

        if !is_streamer {
            let viewers = self
                .participants
                .values()
                .filter(|p| {
                    p.role == ParticipantRole::Viewer
                        && p.connected
                        && p.user_id != identity.user_id
                })
                .count();
            let limit = usize::try_from(session.max_participants).unwrap_or(usize::MAX);
            if viewers >= limit {
                return Err(RcError::CapacityExceeded("Session is full".to_string()));
            }
        }

        self.peak = self.peak.max(session.peak_participants);
        self.session = Some(session);

        if is_streamer && self.router.is_none() {
            let router = self.deps.engine.create_router(&default_media_codecs()).await?;
            info!(
                target: "rc.actor.room",
                session_id = %self.session_id,
                router_id = %router.id,
                "Router created"
            );
            self.broadcast(
                &ServerEvent::RouterReady {
                    rtp_capabilities: router.rtp_capabilities.clone(),
                },
                None,
            );
            self.router = Some(router);
        }

        if is_streamer && self.current_status()? == SessionStatus::Scheduled {
            self.set_status(SessionStatus::Active).await?;
            self.broadcast(
                &ServerEvent::SessionStarted {
                    status: SessionStatus::Active,
                },
                None,
            );
        }

        // Last writer wins: a reload must never orphan the seat.
        if let Some(previous) = self.connection_of_user(&identity.user_id) {
            info!(
                target: "rc.actor.room",
                session_id = %self.session_id,
                user_id = %identity.user_id,
                replaced_connection_id = %previous,
                "Replacing existing connection"
            );
            let replaced = if is_streamer {
                self.detach_streamer_socket(&previous).await
            } else {
                self.remove_viewer(&previous).await
            };
            if let Some(socket) = replaced {
                socket.handle.evict("Replaced by a newer connection");
            }
        }

        let (handle, task_handle) = ConnectionActor::spawn(
            connection_id.clone(),
            identity.user_id.clone(),
            self.session_id.clone(),
            outbound,
            self.cancel_token.child_token(),
            Arc::clone(&self.deps.metrics),
        );
        self.sockets.insert(
            connection_id.clone(),
            ConnectedSocket {
                user_id: identity.user_id.clone(),
                handle: handle.clone(),
                task_handle,
            },
        );

        let role = if is_streamer {
            self.streamer_socket = Some(connection_id.clone());
            ParticipantRole::Streamer
        } else {
            let now = Utc::now();
            let collaborators = &self.deps.collaborators;
            if let Err(e) = collaborators
                .participation
                .upsert_joined(&self.session_id, &identity.user_id, now)
                .await
            {
                warn!(target: "rc.actor.room", error = %e, "Failed to record participation");
            }
            if let Err(e) = collaborators
                .sessions
                .increment_total_joins(&self.session_id)
                .await
            {
                warn!(target: "rc.actor.room", error = %e, "Failed to count join");
            }
            ParticipantRole::Viewer
        };

        let participant = self
            .participants
            .entry(identity.user_id.clone())
            .or_insert_with(|| Participant {
                user_id: identity.user_id.clone(),
                display_name: None,
                role,
                connected: true,
                has_audio: false,
                has_video: false,
                is_screen_sharing: false,
            });
        participant.role = role;
        participant.connected = true;
        participant.display_name.clone_from(&identity.display_name);
        let view = participant.to_view(&self.permissions);

        self.update_peak().await;

        let whiteboard = self.whiteboard_view().await;
        let payload = JoinedRoomPayload {
            session_id: self.session_id.clone(),
            user_id: identity.user_id.clone(),
            role,
            status: self.current_status()?,
            participants: self.participant_views(),
            producers: self.producer_views(),
            router_rtp_capabilities: self.router.as_ref().map(|r| r.rtp_capabilities.clone()),
            whiteboard,
            recording: self.recording.is_some(),
        };
        handle.deliver(OutboundFrame::reply(
            ServerEvent::JoinedRoom(Box::new(payload)),
            request_id,
        ));
        if is_streamer {
            self.replay_pending_requests(&connection_id);
        }

        self.broadcast(&ServerEvent::ParticipantJoined(view), Some(&connection_id));
        self.broadcast_participants();
        self.publish_presence().await;

        info!(
            target: "rc.actor.room",
            session_id = %self.session_id,
            connection_id = %connection_id,
            user_id = %identity.user_id,
            role = ?role,
            connections = self.sockets.len(),
            "Participant joined"
        );

        Ok(JoinOutcome {
            connection: handle,
            user_id: identity.user_id,
            role,
        })
    }

    /// Socket closed without `leave_room`.
    ///
    /// The streamer keeps its producers (a blip must not end the class);
    /// a viewer loses everything it owned.
    pub(super) async fn handle_disconnect(&mut self, connection_id: &str) {
        if !self.sockets.contains_key(connection_id) {
            debug!(
                target: "rc.actor.room",
                session_id = %self.session_id,
                connection_id = %connection_id,
                "Disconnect for unknown connection"
            );
            return;
        }

        let socket = if self.streamer_socket.as_deref() == Some(connection_id) {
            let socket = self.detach_streamer_socket(connection_id).await;
            self.streamer_departed().await;
            socket
        } else {
            self.remove_viewer(connection_id).await
        };

        if let Some(socket) = socket {
            socket.handle.cancel();
            info!(
                target: "rc.actor.room",
                session_id = %self.session_id,
                connection_id = %connection_id,
                user_id = %socket.user_id,
                "Participant disconnected"
            );
        }
    }

    /// Explicit `leave_room`. The connection actor stays up until the
    /// dispatcher drops it so the acknowledgement still goes out.
    pub(super) async fn handle_leave(&mut self, caller: &Caller) -> Result<(), RcError> {
        if caller.is_streamer {
            // An explicit leave is a stop: streamer media closes.
            for producer_id in self.media.producer_ids_for_user(&caller.user_id) {
                self.close_producer_settled(&producer_id).await;
            }
            self.detach_streamer_socket(&caller.connection_id).await;
            self.streamer_departed().await;
        } else {
            self.remove_viewer(&caller.connection_id).await;
        }

        info!(
            target: "rc.actor.room",
            session_id = %self.session_id,
            user_id = %caller.user_id,
            "Participant left"
        );
        Ok(())
    }

    /// Drop a viewer socket and everything it owned, then tell the room.
    pub(super) async fn remove_viewer(&mut self, connection_id: &str) -> Option<ConnectedSocket> {
        let socket = self.sockets.remove(connection_id)?;

        for producer_id in self.media.producer_ids_for_socket(connection_id) {
            self.close_producer_settled(&producer_id).await;
        }
        self.release_socket_media(connection_id).await;

        self.permissions.forget_user(&socket.user_id);
        if self.screen_sharer.as_deref() == Some(socket.user_id.as_str()) {
            self.screen_sharer = None;
        }
        self.participants.remove(&socket.user_id);

        if let Err(e) = self
            .deps
            .collaborators
            .participation
            .mark_left(&self.session_id, &socket.user_id, Utc::now())
            .await
        {
            warn!(
                target: "rc.actor.room",
                session_id = %self.session_id,
                user_id = %socket.user_id,
                error = %e,
                "Failed to mark participation left"
            );
        }

        self.broadcast(
            &ServerEvent::ParticipantLeft {
                user_id: socket.user_id.clone(),
            },
            None,
        );
        self.broadcast_participants();
        self.publish_presence().await;

        Some(socket)
    }

    /// Unseat the streamer socket. Producers stay; the dead peer's
    /// consumers and empty transports go.
    async fn detach_streamer_socket(&mut self, connection_id: &str) -> Option<ConnectedSocket> {
        let socket = self.sockets.remove(connection_id)?;
        if self.streamer_socket.as_deref() == Some(connection_id) {
            self.streamer_socket = None;
        }
        self.release_socket_media(connection_id).await;
        Some(socket)
    }

    /// Room-side effects of the streamer seat going empty.
    async fn streamer_departed(&mut self) {
        let streamer_id = self.session.as_ref().map(|s| s.streamer_id.clone());
        if let Some(participant) = streamer_id.and_then(|id| self.participants.get_mut(&id)) {
            participant.connected = false;
        }

        if self.current_status().ok() == Some(SessionStatus::Active) {
            match self.set_status(SessionStatus::Paused).await {
                Ok(()) => self.broadcast(
                    &ServerEvent::SessionPausedOrEndedByStreamer {
                        status: SessionStatus::Paused,
                    },
                    None,
                ),
                Err(e) => warn!(
                    target: "rc.actor.room",
                    session_id = %self.session_id,
                    error = %e,
                    "Failed to pause session"
                ),
            }
        }

        self.broadcast(&ServerEvent::StreamerLeft, None);
        self.broadcast_participants();
        self.publish_presence().await;
    }

    pub(super) async fn streamer_start(&mut self, caller: &Caller) -> Result<(), RcError> {
        require_streamer(caller)?;
        match self.current_status()? {
            SessionStatus::Scheduled | SessionStatus::Paused => {
                self.set_status(SessionStatus::Active).await?;
                self.broadcast(
                    &ServerEvent::SessionStarted {
                        status: SessionStatus::Active,
                    },
                    None,
                );
                self.publish_presence().await;
                Ok(())
            }
            SessionStatus::Active => Ok(()),
            status @ (SessionStatus::Ended | SessionStatus::Cancelled) => {
                Err(RcError::Conflict(format!("Session is {status}")))
            }
        }
    }

    pub(super) async fn streamer_pause(&mut self, caller: &Caller) -> Result<(), RcError> {
        require_streamer(caller)?;
        match self.current_status()? {
            SessionStatus::Active => {
                self.set_status(SessionStatus::Paused).await?;
                self.broadcast(
                    &ServerEvent::SessionPausedOrEndedByStreamer {
                        status: SessionStatus::Paused,
                    },
                    None,
                );
                self.publish_presence().await;
                Ok(())
            }
            SessionStatus::Paused => Ok(()),
            status => Err(RcError::Conflict(format!("Session is {status}"))),
        }
    }

    pub(super) async fn streamer_resume(&mut self, caller: &Caller) -> Result<(), RcError> {
        require_streamer(caller)?;
        match self.current_status()? {
            SessionStatus::Paused => {
                self.set_status(SessionStatus::Active).await?;
                self.broadcast(
                    &ServerEvent::SessionStarted {
                        status: SessionStatus::Active,
                    },
                    None,
                );
                self.publish_presence().await;
                Ok(())
            }
            SessionStatus::Active => Ok(()),
            status => Err(RcError::Conflict(format!("Session is {status}"))),
        }
    }

    /// End the session: stop recording, close all media, remove viewers.
    /// The streamer socket stays until it leaves.
    pub(super) async fn streamer_end(&mut self, caller: &Caller) -> Result<(), RcError> {
        require_streamer(caller)?;
        let status = self.current_status()?;
        if matches!(status, SessionStatus::Ended | SessionStatus::Cancelled) {
            return Err(RcError::Conflict(format!("Session is {status}")));
        }

        self.set_status(SessionStatus::Ended).await?;

        if let Some(active) = self.recording.take() {
            self.finish_recording(active).await;
        }

        let producer_ids: Vec<String> = self.media.producers().map(|p| p.id.clone()).collect();
        for producer_id in producer_ids {
            self.close_producer_settled(&producer_id).await;
        }

        self.broadcast(
            &ServerEvent::SessionPausedOrEndedByStreamer {
                status: SessionStatus::Ended,
            },
            None,
        );

        let viewers: Vec<String> = self
            .sockets
            .keys()
            .filter(|id| **id != caller.connection_id)
            .cloned()
            .collect();
        for connection_id in viewers {
            if let Some(socket) = self.remove_viewer(&connection_id).await {
                socket.handle.evict("Session ended");
            }
        }

        info!(
            target: "rc.actor.room",
            session_id = %self.session_id,
            "Session ended by streamer"
        );
        Ok(())
    }

    /// Persist a status change, then apply it locally.
    pub(super) async fn set_status(&mut self, status: SessionStatus) -> Result<(), RcError> {
        self.deps
            .collaborators
            .sessions
            .update_status(&self.session_id, status)
            .await?;
        if let Some(session) = self.session.as_mut() {
            session.status = status;
        }
        info!(
            target: "rc.actor.room",
            session_id = %self.session_id,
            status = %status,
            "Session status changed"
        );
        Ok(())
    }

    /// Raise the peak to the current connected head count if it grew.
    async fn update_peak(&mut self) {
        let connected = self.participants.values().filter(|p| p.connected).count();
        let connected = u32::try_from(connected).unwrap_or(u32::MAX);
        if connected <= self.peak {
            return;
        }

        self.peak = connected;
        if let Some(session) = self.session.as_mut() {
            session.peak_participants = connected;
        }
        if let Err(e) = self
            .deps
            .collaborators
            .sessions
            .record_peak(&self.session_id, connected)
            .await
        {
            warn!(
                target: "rc.actor.room",
                session_id = %self.session_id,
                peak = connected,
                error = %e,
                "Failed to record peak participants"
            );
        }
    }

    pub(super) fn connection_of_user(&self, user_id: &str) -> Option<String> {
        self.sockets
            .iter()
            .find(|(_, socket)| socket.user_id == user_id)
            .map(|(id, _)| id.clone())
    }
}

pub(super) fn require_streamer(caller: &Caller) -> Result<(), RcError> {
    if caller.is_streamer {
        Ok(())
    } else {
        Err(RcError::PermissionDenied(
            "Only the streamer can do this".to_string(),
        ))
    }
}
