//! Transports, producers and consumers.
//!
//! Every engine resource is tagged with the socket and user that own it.
//! Closing is always "close if present": the registry hands an entry out at
//! most once, so a second close is a no-op.

use super::{Caller, RoomActor};
use crate::errors::RcError;
use crate::media::registry::{TrackedConsumer, TrackedProducer, TrackedTransport};
use crate::media::{ConsumeParams, MediaKind, MediaSource, MediaTag, TransportDirection};
use crate::observability::metrics;
use crate::signaling::protocol::{
    ConsumeRequest, ConsumedPayload, ParticipantDelta, ProduceRequest, ProducerView, ServerEvent,
    TransportCreatedPayload,
};
use serde_json::Value;
use tracing::{debug, info, warn};

impl RoomActor {
    pub(super) async fn create_transport(
        &mut self,
        caller: &Caller,
        direction: TransportDirection,
    ) -> Result<ServerEvent, RcError> {
        let router_id = self.router()?.id.clone();
        let tag = MediaTag {
            socket_id: caller.connection_id.clone(),
            user_id: caller.user_id.clone(),
            source: None,
        };

        let transport = self
            .deps
            .engine
            .create_webrtc_transport(&router_id, &self.deps.settings.rtc, &tag)
            .await?;
        self.media.insert_transport(TrackedTransport {
            id: transport.id.clone(),
            direction: Some(direction),
            tag,
        });

        debug!(
            target: "rc.actor.room",
            session_id = %self.session_id,
            transport_id = %transport.id,
            direction = ?direction,
            "Transport created"
        );
        Ok(ServerEvent::TransportCreated(TransportCreatedPayload {
            transport,
            direction,
        }))
    }

    pub(super) async fn connect_transport(
        &mut self,
        caller: &Caller,
        transport_id: String,
        dtls_parameters: &Value,
    ) -> Result<ServerEvent, RcError> {
        self.owned_transport(caller, &transport_id)?;
        self.deps
            .engine
            .connect_webrtc_transport(&transport_id, dtls_parameters)
            .await?;
        Ok(ServerEvent::TransportConnected { transport_id })
    }

    fn owned_transport(
        &self,
        caller: &Caller,
        transport_id: &str,
    ) -> Result<&TrackedTransport, RcError> {
        self.media
            .transport(transport_id)
            .filter(|t| t.tag.socket_id == caller.connection_id)
            .ok_or_else(|| RcError::not_found("transport", transport_id))
    }

    /// Publish a track after checking who may send `source`.
    pub(super) async fn produce(
        &mut self,
        caller: &Caller,
        request: ProduceRequest,
    ) -> Result<ServerEvent, RcError> {
        let ProduceRequest {
            transport_id,
            kind,
            rtp_parameters,
            app_data,
        } = request;
        let source = app_data.source;

        self.owned_transport(caller, &transport_id)?;
        if !source.accepts(kind) {
            return Err(RcError::Validation(format!(
                "Source {} cannot carry {}",
                source.as_str(),
                kind.as_str()
            )));
        }
        self.authorize_source(caller, source)?;

        // One producer per (user, source, kind). The old one is closed only
        // once its replacement exists, so a failed produce leaves it live.
        let previous = self
            .media
            .producer_for(&caller.user_id, source, kind)
            .map(|p| p.id.clone());

        let tag = MediaTag {
            socket_id: caller.connection_id.clone(),
            user_id: caller.user_id.clone(),
            source: Some(source),
        };
        let producer_id = self
            .deps
            .engine
            .produce(&transport_id, kind, &rtp_parameters, &tag)
            .await?;
        self.media.insert_producer(TrackedProducer {
            id: producer_id.clone(),
            transport_id,
            kind,
            source,
            tag,
            paused: false,
        });

        if let Some(previous) = previous {
            debug!(
                target: "rc.actor.room",
                session_id = %self.session_id,
                producer_id = %previous,
                replacement = %producer_id,
                source = source.as_str(),
                "Replacing producer"
            );
            self.close_producer(&previous).await;
            self.prune_orphan_transports().await;
        }
        metrics::record_producer_created(source.as_str());

        info!(
            target: "rc.actor.room",
            session_id = %self.session_id,
            user_id = %caller.user_id,
            producer_id = %producer_id,
            kind = kind.as_str(),
            source = source.as_str(),
            "Producer created"
        );

        self.broadcast(
            &ServerEvent::NewProducer(ProducerView {
                producer_id: producer_id.clone(),
                user_id: caller.user_id.clone(),
                kind,
                source,
                paused: false,
            }),
            Some(&caller.connection_id),
        );

        if let Some(capability) = source.required_capability() {
            self.permissions.mark_producing(&caller.user_id, capability);
        }
        if source == MediaSource::ViewerScreen {
            self.screen_sharer = Some(caller.user_id.clone());
            self.broadcast(
                &ServerEvent::ScreenShareStarted {
                    user_id: caller.user_id.clone(),
                    producer_id: producer_id.clone(),
                },
                None,
            );
        }
        if self.set_flag(&caller.user_id, source, true) {
            self.publish_presence().await;
        }

        Ok(ServerEvent::Produced { producer_id })
    }

    fn authorize_source(&self, caller: &Caller, source: MediaSource) -> Result<(), RcError> {
        let Some(capability) = source.required_capability() else {
            return if caller.is_streamer {
                Ok(())
            } else {
                Err(RcError::PermissionDenied(format!(
                    "Only the streamer can publish {}",
                    source.as_str()
                )))
            };
        };

        if caller.is_streamer {
            return Err(RcError::PermissionDenied(format!(
                "{} is a viewer source",
                source.as_str()
            )));
        }
        if !self.permissions.may_produce(&caller.user_id, capability) {
            return Err(RcError::PermissionDenied(format!(
                "No {} permission",
                capability.as_str()
            )));
        }
        if source == MediaSource::ViewerScreen
            && self
                .screen_sharer
                .as_ref()
                .is_some_and(|sharer| *sharer != caller.user_id)
        {
            return Err(RcError::Conflict(
                "Another participant is sharing their screen".to_string(),
            ));
        }
        Ok(())
    }

    /// Update the participant flag a source carries. Returns whether it
    /// changed; changes go out as a delta (legacy) and a snapshot.
    pub(super) fn set_flag(&mut self, user_id: &str, source: MediaSource, value: bool) -> bool {
        let Some(participant) = self.participants.get_mut(user_id) else {
            return false;
        };

        let mut delta = ParticipantDelta {
            user_id: user_id.to_string(),
            ..ParticipantDelta::default()
        };
        let flag = match source {
            MediaSource::ViewerMic => {
                delta.has_audio = Some(value);
                &mut participant.has_audio
            }
            MediaSource::ViewerCamera => {
                delta.has_video = Some(value);
                &mut participant.has_video
            }
            MediaSource::ViewerScreen => {
                delta.is_screen_sharing = Some(value);
                &mut participant.is_screen_sharing
            }
            MediaSource::Camera
            | MediaSource::Screen
            | MediaSource::ScreenAudio
            | MediaSource::ViewerScreenAudio => return false,
        };
        if *flag == value {
            return false;
        }
        *flag = value;

        if self.deps.settings.legacy_delta_updates {
            self.broadcast(&ServerEvent::ParticipantUpdated(delta), None);
        }
        self.broadcast_participants();
        true
    }

    /// Close a producer and its consumers. Returns the entry the first time
    /// only.
    pub(super) async fn close_producer(&mut self, producer_id: &str) -> Option<TrackedProducer> {
        let producer = self.media.take_producer(producer_id)?;

        if let Err(e) = self.deps.engine.close_producer(producer_id).await {
            warn!(
                target: "rc.actor.room",
                session_id = %self.session_id,
                producer_id = %producer_id,
                error = %e,
                "Failed to close producer"
            );
        }
        metrics::record_producer_closed(producer.source.as_str());

        for consumer_id in self.media.consumer_ids_for_producer(producer_id) {
            self.close_consumer(&consumer_id).await;
        }

        self.broadcast(
            &ServerEvent::ProducerClosed {
                producer_id: producer_id.to_string(),
            },
            Some(&producer.tag.socket_id),
        );

        debug!(
            target: "rc.actor.room",
            session_id = %self.session_id,
            producer_id = %producer_id,
            source = producer.source.as_str(),
            "Producer closed"
        );
        Some(producer)
    }

    /// Close a producer and settle what it carried: the grant goes back to
    /// `None` and the flag clears. A viewer screen share takes its audio
    /// companion with it.
    pub(super) async fn close_producer_settled(&mut self, producer_id: &str) {
        let Some(producer) = self.close_producer(producer_id).await else {
            return;
        };
        let user_id = producer.tag.user_id.as_str();

        match producer.source {
            MediaSource::Camera
            | MediaSource::Screen
            | MediaSource::ScreenAudio
            | MediaSource::ViewerScreenAudio => {}
            MediaSource::ViewerMic | MediaSource::ViewerCamera => {
                if let Some(capability) = producer.source.required_capability() {
                    self.permissions.revoke(user_id, capability);
                }
                self.set_flag(user_id, producer.source, false);
            }
            MediaSource::ViewerScreen => {
                if let Some(capability) = producer.source.required_capability() {
                    self.permissions.revoke(user_id, capability);
                }
                if self.screen_sharer.as_deref() == Some(user_id) {
                    self.screen_sharer = None;
                }
                let companion = self
                    .media
                    .producer_for(user_id, MediaSource::ViewerScreenAudio, MediaKind::Audio)
                    .map(|p| p.id.clone());
                if let Some(companion) = companion {
                    self.close_producer(&companion).await;
                }
                self.set_flag(user_id, MediaSource::ViewerScreen, false);
                self.broadcast(
                    &ServerEvent::ScreenShareStoppedByViewer {
                        user_id: user_id.to_string(),
                    },
                    None,
                );
            }
        }
    }

    /// `producer-close` from a client. Closing twice is fine.
    pub(super) async fn request_producer_close(
        &mut self,
        caller: &Caller,
        producer_id: &str,
    ) -> Result<(), RcError> {
        let Some(producer) = self.media.producer(producer_id) else {
            return Ok(());
        };
        if producer.tag.user_id != caller.user_id && !caller.is_streamer {
            return Err(RcError::PermissionDenied(
                "Cannot close another participant's producer".to_string(),
            ));
        }

        self.close_producer_settled(producer_id).await;
        self.publish_presence().await;
        Ok(())
    }

    pub(super) async fn set_producer_paused(
        &mut self,
        caller: &Caller,
        producer_id: &str,
        paused: bool,
    ) -> Result<(), RcError> {
        let producer = self
            .media
            .producer(producer_id)
            .ok_or_else(|| RcError::not_found("producer", producer_id))?;
        if producer.tag.user_id != caller.user_id && !caller.is_streamer {
            return Err(RcError::PermissionDenied(
                "Cannot control another participant's producer".to_string(),
            ));
        }

        if paused {
            self.deps.engine.pause_producer(producer_id).await?;
        } else {
            self.deps.engine.resume_producer(producer_id).await?;
        }
        if let Some(producer) = self.media.producer_mut(producer_id) {
            producer.paused = paused;
        }

        let producer_id = producer_id.to_string();
        let event = if paused {
            ServerEvent::ProducerPaused { producer_id }
        } else {
            ServerEvent::ProducerResumed { producer_id }
        };
        self.broadcast(&event, Some(&caller.connection_id));
        Ok(())
    }

    /// Subscribe the caller to a producer. Consumers start paused; the
    /// client resumes once its side is ready.
    pub(super) async fn consume(
        &mut self,
        caller: &Caller,
        request: ConsumeRequest,
    ) -> Result<ServerEvent, RcError> {
        let ConsumeRequest {
            transport_id,
            producer_id,
            rtp_capabilities,
        } = request;

        self.owned_transport(caller, &transport_id)?;
        let (source, owner) = self
            .media
            .producer(&producer_id)
            .map(|p| (p.source, p.tag.user_id.clone()))
            .ok_or_else(|| RcError::not_found("producer", &producer_id))?;
        let router_id = self.router()?.id.clone();

        if !self
            .deps
            .engine
            .can_consume(&router_id, &producer_id, &rtp_capabilities)
            .await?
        {
            return Err(RcError::Provider(format!(
                "Capabilities cannot consume producer {producer_id}"
            )));
        }

        let tag = MediaTag {
            socket_id: caller.connection_id.clone(),
            user_id: caller.user_id.clone(),
            source: Some(source),
        };
        let consumer = self
            .deps
            .engine
            .consume(&ConsumeParams {
                transport_id: &transport_id,
                producer_id: &producer_id,
                rtp_capabilities: &rtp_capabilities,
                paused: true,
                app_data: &tag,
            })
            .await?;
        self.media.insert_consumer(TrackedConsumer {
            id: consumer.id.clone(),
            producer_id: producer_id.clone(),
            transport_id,
            kind: consumer.kind,
            tag,
        });

        Ok(ServerEvent::Consumed(ConsumedPayload {
            consumer_id: consumer.id,
            producer_id,
            kind: consumer.kind,
            rtp_parameters: consumer.rtp_parameters,
            source,
            user_id: owner,
        }))
    }

    pub(super) async fn resume_consumer(
        &mut self,
        caller: &Caller,
        consumer_id: String,
    ) -> Result<ServerEvent, RcError> {
        let owned = self
            .media
            .consumer(&consumer_id)
            .is_some_and(|c| c.tag.socket_id == caller.connection_id);
        if !owned {
            return Err(RcError::not_found("consumer", consumer_id));
        }

        self.deps.engine.resume_consumer(&consumer_id).await?;
        Ok(ServerEvent::ConsumerResumed { consumer_id })
    }

    async fn close_consumer(&mut self, consumer_id: &str) {
        if self.media.take_consumer(consumer_id).is_none() {
            return;
        }
        if let Err(e) = self.deps.engine.close_consumer(consumer_id).await {
            warn!(
                target: "rc.actor.room",
                session_id = %self.session_id,
                consumer_id = %consumer_id,
                error = %e,
                "Failed to close consumer"
            );
        }
    }

    async fn close_transport(&mut self, transport_id: &str) {
        if self.media.take_transport(transport_id).is_none() {
            return;
        }
        if let Err(e) = self.deps.engine.close_transport(transport_id).await {
            warn!(
                target: "rc.actor.room",
                session_id = %self.session_id,
                transport_id = %transport_id,
                error = %e,
                "Failed to close transport"
            );
        }
    }

    /// Close a departed socket's consumers, then every transport left with
    /// no live owner and no media.
    pub(super) async fn release_socket_media(&mut self, connection_id: &str) {
        for consumer_id in self.media.consumer_ids_for_socket(connection_id) {
            self.close_consumer(&consumer_id).await;
        }
        self.prune_orphan_transports().await;
    }

    async fn prune_orphan_transports(&mut self) {
        let live: Vec<&str> = self.sockets.keys().map(String::as_str).collect();
        let orphans = self.media.orphan_transport_ids(&live);
        for transport_id in orphans {
            self.close_transport(&transport_id).await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::super::testing::*;
    use crate::errors::RcError;
    use crate::media::mock::MockOp;
    use crate::media::{MediaKind, MediaSource, TransportDirection};
    use crate::permissions::Capability;
    use crate::signaling::protocol::{ClientMessage, ConsumeRequest, ServerEvent};
    use common::types::SessionStatus;
    use serde_json::json;

    async fn room_with_streamer_and_viewer(fx: &Fixture) -> (TestRoom, TestClient, TestClient) {
        let room = fx.spawn_room("s-1");
        let streamer = fx.join(&room, "c-s", streamer_identity()).await.unwrap();
        let viewer = fx.join(&room, "c-1", viewer_identity("v1")).await.unwrap();
        (room, streamer, viewer)
    }

    #[tokio::test]
    async fn test_transport_requires_router() {
        let fx = Fixture::new(session("s-1", SessionStatus::Active));
        let room = fx.spawn_room("s-1");
        let _viewer = fx.join(&room, "c-1", viewer_identity("v1")).await.unwrap();

        let result = room
            .signal(
                "c-1".to_string(),
                ClientMessage::CreateTransport {
                    direction: TransportDirection::Recv,
                },
            )
            .await;
        assert!(matches!(
            result,
            Err(RcError::ResourceNotFound { resource: "router", .. })
        ));
    }

    #[tokio::test]
    async fn test_new_producer_announced_to_others() {
        let fx = Fixture::new(session("s-1", SessionStatus::Active));
        let (room, _streamer, mut viewer) = room_with_streamer_and_viewer(&fx).await;

        let producer_id = fx
            .produce(&room, "c-s", MediaSource::Camera, MediaKind::Video)
            .await
            .unwrap();

        let event = viewer
            .expect(|e| matches!(e, ServerEvent::NewProducer(_)))
            .await;
        assert!(matches!(
            event,
            ServerEvent::NewProducer(ref view)
                if view.producer_id == producer_id && view.source == MediaSource::Camera
        ));
    }

    #[tokio::test]
    async fn test_viewer_cannot_publish_streamer_source() {
        let fx = Fixture::new(session("s-1", SessionStatus::Active));
        let (room, _streamer, _viewer) = room_with_streamer_and_viewer(&fx).await;

        let result = fx
            .produce(&room, "c-1", MediaSource::Camera, MediaKind::Video)
            .await;
        assert!(matches!(result, Err(RcError::PermissionDenied(_))));
    }

    #[tokio::test]
    async fn test_viewer_mic_requires_grant() {
        let fx = Fixture::new(session("s-1", SessionStatus::Active));
        let (room, _streamer, _viewer) = room_with_streamer_and_viewer(&fx).await;

        let denied = fx
            .produce(&room, "c-1", MediaSource::ViewerMic, MediaKind::Audio)
            .await;
        assert!(matches!(denied, Err(RcError::PermissionDenied(_))));

        fx.grant(&room, "c-s", "c-1", "v1", Capability::Audio).await;
        fx.produce(&room, "c-1", MediaSource::ViewerMic, MediaKind::Audio)
            .await
            .unwrap();

        let state = room.get_state().await.unwrap();
        assert!(state.participant("v1").unwrap().has_audio);
    }

    #[tokio::test]
    async fn test_source_kind_mismatch_rejected() {
        let fx = Fixture::new(session("s-1", SessionStatus::Active));
        let (room, _streamer, _viewer) = room_with_streamer_and_viewer(&fx).await;

        let result = fx
            .produce(&room, "c-s", MediaSource::Screen, MediaKind::Audio)
            .await;
        assert!(matches!(result, Err(RcError::Validation(_))));
    }

    #[tokio::test]
    async fn test_reproduce_same_source_replaces_producer() {
        let fx = Fixture::new(session("s-1", SessionStatus::Active));
        let (room, _streamer, _viewer) = room_with_streamer_and_viewer(&fx).await;

        let first = fx
            .produce(&room, "c-s", MediaSource::Camera, MediaKind::Video)
            .await
            .unwrap();
        let audio = fx
            .produce(&room, "c-s", MediaSource::Camera, MediaKind::Audio)
            .await
            .unwrap();
        let second = fx
            .produce(&room, "c-s", MediaSource::Camera, MediaKind::Video)
            .await
            .unwrap();

        assert!(!fx.engine.is_producer_live(&first));
        assert!(fx.engine.is_producer_live(&audio));
        assert!(fx.engine.is_producer_live(&second));
        assert_eq!(room.get_state().await.unwrap().producers.len(), 2);
    }

    #[tokio::test]
    async fn test_close_producer_is_idempotent() {
        let fx = Fixture::new(session("s-1", SessionStatus::Active));
        let (room, _streamer, _viewer) = room_with_streamer_and_viewer(&fx).await;
        let producer_id = fx
            .produce(&room, "c-s", MediaSource::Camera, MediaKind::Video)
            .await
            .unwrap();

        for _ in 0..2 {
            let reply = room
                .signal(
                    "c-s".to_string(),
                    ClientMessage::ProducerClose {
                        producer_id: producer_id.clone(),
                    },
                )
                .await
                .unwrap();
            assert!(matches!(reply, Some(ServerEvent::Ack { .. })));
        }

        assert_eq!(fx.engine.producer_close_calls(&producer_id), 1);
        assert!(room.get_state().await.unwrap().producers.is_empty());
    }

    #[tokio::test]
    async fn test_viewer_cannot_close_streamer_producer() {
        let fx = Fixture::new(session("s-1", SessionStatus::Active));
        let (room, _streamer, _viewer) = room_with_streamer_and_viewer(&fx).await;
        let producer_id = fx
            .produce(&room, "c-s", MediaSource::Camera, MediaKind::Video)
            .await
            .unwrap();

        let result = room
            .signal("c-1".to_string(), ClientMessage::ProducerClose { producer_id })
            .await;
        assert!(matches!(result, Err(RcError::PermissionDenied(_))));
    }

    #[tokio::test]
    async fn test_producer_close_cascades_to_consumers() {
        let fx = Fixture::new(session("s-1", SessionStatus::Active));
        let (room, _streamer, mut viewer) = room_with_streamer_and_viewer(&fx).await;
        let producer_id = fx
            .produce(&room, "c-s", MediaSource::Camera, MediaKind::Video)
            .await
            .unwrap();
        let consumer_id = fx.consume(&room, "c-1", &producer_id).await.unwrap();
        assert!(fx.engine.is_consumer_paused(&consumer_id));

        room.signal(
            "c-s".to_string(),
            ClientMessage::ProducerClose {
                producer_id: producer_id.clone(),
            },
        )
        .await
        .unwrap();

        viewer
            .expect(|e| matches!(e, ServerEvent::ProducerClosed { .. }))
            .await;
        let state = room.get_state().await.unwrap();
        assert_eq!(state.consumer_count, 0);
        assert_eq!(fx.engine.live_consumer_count(), 0);
    }

    #[tokio::test]
    async fn test_incompatible_consume_fails_alone() {
        let fx = Fixture::new(session("s-1", SessionStatus::Active));
        let (room, _streamer, _viewer) = room_with_streamer_and_viewer(&fx).await;
        let producer_id = fx
            .produce(&room, "c-s", MediaSource::Camera, MediaKind::Video)
            .await
            .unwrap();
        let transport_id = fx.transport(&room, "c-1").await;

        fx.engine.set_incompatible(true);
        let result = room
            .signal(
                "c-1".to_string(),
                ClientMessage::Consume(ConsumeRequest {
                    transport_id: transport_id.clone(),
                    producer_id: producer_id.clone(),
                    rtp_capabilities: json!({}),
                }),
            )
            .await;
        assert!(matches!(result, Err(RcError::Provider(_))));

        fx.engine.set_incompatible(false);
        assert!(fx.consume(&room, "c-1", &producer_id).await.is_ok());
        assert_eq!(room.get_state().await.unwrap().producers.len(), 1);
    }

    #[tokio::test]
    async fn test_consume_on_foreign_transport_not_found() {
        let fx = Fixture::new(session("s-1", SessionStatus::Active));
        let (room, _streamer, _viewer) = room_with_streamer_and_viewer(&fx).await;
        let producer_id = fx
            .produce(&room, "c-s", MediaSource::Camera, MediaKind::Video)
            .await
            .unwrap();
        let streamer_transport = fx.transport(&room, "c-s").await;

        let result = room
            .signal(
                "c-1".to_string(),
                ClientMessage::Consume(ConsumeRequest {
                    transport_id: streamer_transport,
                    producer_id,
                    rtp_capabilities: json!({}),
                }),
            )
            .await;
        assert!(matches!(
            result,
            Err(RcError::ResourceNotFound { resource: "transport", .. })
        ));
    }

    #[tokio::test]
    async fn test_consumer_resume() {
        let fx = Fixture::new(session("s-1", SessionStatus::Active));
        let (room, _streamer, _viewer) = room_with_streamer_and_viewer(&fx).await;
        let producer_id = fx
            .produce(&room, "c-s", MediaSource::Camera, MediaKind::Video)
            .await
            .unwrap();
        let consumer_id = fx.consume(&room, "c-1", &producer_id).await.unwrap();

        let reply = room
            .signal(
                "c-1".to_string(),
                ClientMessage::ConsumerResume {
                    consumer_id: consumer_id.clone(),
                },
            )
            .await
            .unwrap();
        assert!(matches!(reply, Some(ServerEvent::ConsumerResumed { .. })));
        assert!(!fx.engine.is_consumer_paused(&consumer_id));

        let foreign = room
            .signal("c-s".to_string(), ClientMessage::ConsumerResume { consumer_id })
            .await;
        assert!(matches!(foreign, Err(RcError::ResourceNotFound { .. })));
    }

    #[tokio::test]
    async fn test_pause_and_resume_producer() {
        let fx = Fixture::new(session("s-1", SessionStatus::Active));
        let (room, _streamer, mut viewer) = room_with_streamer_and_viewer(&fx).await;
        let producer_id = fx
            .produce(&room, "c-s", MediaSource::Camera, MediaKind::Video)
            .await
            .unwrap();

        room.signal(
            "c-s".to_string(),
            ClientMessage::ProducerPause {
                producer_id: producer_id.clone(),
            },
        )
        .await
        .unwrap();
        viewer
            .expect(|e| matches!(e, ServerEvent::ProducerPaused { .. }))
            .await;
        assert!(fx.engine.is_producer_paused(&producer_id));
        assert!(room.get_state().await.unwrap().producers[0].paused);

        room.signal(
            "c-s".to_string(),
            ClientMessage::ProducerResume {
                producer_id: producer_id.clone(),
            },
        )
        .await
        .unwrap();
        assert!(!fx.engine.is_producer_paused(&producer_id));
    }

    #[tokio::test]
    async fn test_provider_failure_on_produce_reported() {
        let fx = Fixture::new(session("s-1", SessionStatus::Active));
        let (room, _streamer, _viewer) = room_with_streamer_and_viewer(&fx).await;
        let transport_id = fx.transport(&room, "c-s").await;

        fx.engine.set_failing(MockOp::Produce, true);
        let result = fx
            .produce_on(&room, "c-s", &transport_id, MediaSource::Camera, MediaKind::Video)
            .await;
        assert!(matches!(result, Err(RcError::Provider(_))));
        assert!(room.get_state().await.unwrap().producers.is_empty());
    }

    #[tokio::test]
    async fn test_failed_replacement_keeps_previous_producer() {
        let fx = Fixture::new(session("s-1", SessionStatus::Active));
        let (room, _streamer, _viewer) = room_with_streamer_and_viewer(&fx).await;
        fx.grant(&room, "c-s", "c-1", "v1", Capability::Audio).await;
        let first = fx
            .produce(&room, "c-1", MediaSource::ViewerMic, MediaKind::Audio)
            .await
            .unwrap();

        fx.engine.set_failing(MockOp::Produce, true);
        let result = fx
            .produce(&room, "c-1", MediaSource::ViewerMic, MediaKind::Audio)
            .await;
        assert!(matches!(result, Err(RcError::Provider(_))));

        // Flag and producer still agree.
        assert!(fx.engine.is_producer_live(&first));
        let state = room.get_state().await.unwrap();
        assert!(state.participant("v1").unwrap().has_audio);
        let mics: Vec<_> = state
            .producers
            .iter()
            .filter(|p| p.source == MediaSource::ViewerMic)
            .collect();
        assert_eq!(mics.len(), 1);
        assert_eq!(mics.first().unwrap().producer_id, first);

        // The grant survives, so a retry replaces the producer.
        fx.engine.set_failing(MockOp::Produce, false);
        let second = fx
            .produce(&room, "c-1", MediaSource::ViewerMic, MediaKind::Audio)
            .await
            .unwrap();
        assert!(!fx.engine.is_producer_live(&first));
        assert!(fx.engine.is_producer_live(&second));
        assert!(room
            .get_state()
            .await
            .unwrap()
            .participant("v1")
            .unwrap()
            .has_audio);
    }

    #[tokio::test]
    async fn test_viewer_disconnect_closes_its_transports() {
        let fx = Fixture::new(session("s-1", SessionStatus::Active));
        let (room, _streamer, _viewer) = room_with_streamer_and_viewer(&fx).await;
        let producer_id = fx
            .produce(&room, "c-s", MediaSource::Camera, MediaKind::Video)
            .await
            .unwrap();
        fx.consume(&room, "c-1", &producer_id).await.unwrap();
        assert_eq!(room.get_state().await.unwrap().transport_count, 2);

        room.disconnect("c-1".to_string()).await;

        let state = room.get_state().await.unwrap();
        assert_eq!(state.transport_count, 1);
        assert_eq!(state.consumer_count, 0);
        assert_eq!(fx.engine.live_transport_count(), 1);
    }
}
