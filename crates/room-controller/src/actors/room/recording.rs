//! Recording sub-state of the room.

use super::lifecycle::require_streamer;
use super::{Caller, RoomActor};
use crate::errors::RcError;
use crate::recording::ActiveRecording;
use crate::signaling::protocol::{RecordingStoppedPayload, ServerEvent};
use tracing::{info, warn};

impl RoomActor {
    pub(super) async fn start_recording(&mut self, caller: &Caller) -> Result<(), RcError> {
        require_streamer(caller)?;
        if self.recording.is_some() {
            return Err(RcError::Conflict("Recording already active".to_string()));
        }
        let router = self.router()?.clone();

        let active = self
            .deps
            .recording
            .start(
                &self.session_id,
                &router,
                &self.media,
                &caller.user_id,
                &caller.user_id,
            )
            .await?;
        let started_at = active.started_at;

        info!(
            target: "rc.actor.room",
            session_id = %self.session_id,
            file_name = %active.file_name,
            streams = active.stream_count(),
            "Recording started"
        );
        self.recording = Some(active);
        self.broadcast(&ServerEvent::RecordingStarted { started_at }, None);
        Ok(())
    }

    pub(super) async fn stop_recording(&mut self, caller: &Caller) -> Result<(), RcError> {
        let started_by = self
            .recording
            .as_ref()
            .map(|active| active.started_by.clone())
            .ok_or(RcError::RecordingNotActive)?;
        if started_by != caller.user_id {
            return Err(RcError::PermissionDenied(
                "Only the user who started the recording can stop it".to_string(),
            ));
        }

        if let Some(active) = self.recording.take() {
            self.finish_recording(active).await;
        }
        Ok(())
    }

    /// Stop the pipeline, append the artifact and tell the room. A failed
    /// append still announces the artifact, marked degraded.
    pub(super) async fn finish_recording(&mut self, active: ActiveRecording) {
        let stopped = self.deps.recording.stop(&self.session_id, active).await;
        let mut degraded = stopped.degraded;

        match self
            .deps
            .collaborators
            .sessions
            .append_recording(&self.session_id, &stopped.artifact)
            .await
        {
            Ok(()) => {
                if let Some(session) = self.session.as_mut() {
                    session.recordings.push(stopped.artifact.clone());
                }
            }
            Err(e) => {
                warn!(
                    target: "rc.actor.room",
                    session_id = %self.session_id,
                    file_name = %stopped.artifact.file_name,
                    error = %e,
                    "Failed to append recording artifact"
                );
                degraded.get_or_insert_with(|| "artifact could not be saved".to_string());
            }
        }

        self.broadcast(
            &ServerEvent::RecordingStopped(RecordingStoppedPayload {
                artifact: stopped.artifact,
                degraded,
            }),
            None,
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::super::testing::*;
    use crate::collaborators::ArtifactStatus;
    use crate::errors::RcError;
    use crate::media::{MediaKind, MediaSource};
    use crate::signaling::protocol::{ClientMessage, ServerEvent};
    use common::types::SessionStatus;

    #[tokio::test]
    async fn test_start_and_stop_appends_artifact() {
        let fx = Fixture::new(session("s-1", SessionStatus::Active));
        let room = fx.spawn_room("s-1");
        let mut streamer = fx.join(&room, "c-s", streamer_identity()).await.unwrap();
        let mut viewer = fx.join(&room, "c-1", viewer_identity("v1")).await.unwrap();
        fx.produce(&room, "c-s", MediaSource::Camera, MediaKind::Video)
            .await
            .unwrap();
        fx.produce(&room, "c-s", MediaSource::Camera, MediaKind::Audio)
            .await
            .unwrap();

        room.signal("c-s".to_string(), ClientMessage::RecordingStart)
            .await
            .unwrap();
        viewer
            .expect(|e| matches!(e, ServerEvent::RecordingStarted { .. }))
            .await;
        assert!(room.get_state().await.unwrap().recording_active);
        assert_eq!(fx.transcoder.spawned(), 1);

        room.signal("c-s".to_string(), ClientMessage::RecordingStop)
            .await
            .unwrap();
        let stopped = streamer
            .expect(|e| matches!(e, ServerEvent::RecordingStopped(_)))
            .await;
        assert!(matches!(
            stopped,
            ServerEvent::RecordingStopped(ref p)
                if p.degraded.is_none() && p.artifact.status == ArtifactStatus::Completed
        ));

        let record = fx.platform.session("s-1").unwrap();
        assert_eq!(record.recordings.len(), 1);
        assert_eq!(fx.platform.uploads().len(), 1);
        assert!(!room.get_state().await.unwrap().recording_active);
    }

    #[tokio::test]
    async fn test_start_without_video_leaves_room_idle() {
        let fx = Fixture::new(session("s-1", SessionStatus::Active));
        let room = fx.spawn_room("s-1");
        let _streamer = fx.join(&room, "c-s", streamer_identity()).await.unwrap();

        let result = room
            .signal("c-s".to_string(), ClientMessage::RecordingStart)
            .await;
        assert!(matches!(result, Err(RcError::Provider(_))));
        assert!(!room.get_state().await.unwrap().recording_active);
    }

    #[tokio::test]
    async fn test_second_start_conflicts() {
        let fx = Fixture::new(session("s-1", SessionStatus::Active));
        let room = fx.spawn_room("s-1");
        let _streamer = fx.join(&room, "c-s", streamer_identity()).await.unwrap();
        fx.produce(&room, "c-s", MediaSource::Camera, MediaKind::Video)
            .await
            .unwrap();

        room.signal("c-s".to_string(), ClientMessage::RecordingStart)
            .await
            .unwrap();
        let again = room
            .signal("c-s".to_string(), ClientMessage::RecordingStart)
            .await;
        assert!(matches!(again, Err(RcError::Conflict(_))));
        assert_eq!(fx.transcoder.spawned(), 1);
    }

    #[tokio::test]
    async fn test_stop_without_recording() {
        let fx = Fixture::new(session("s-1", SessionStatus::Active));
        let room = fx.spawn_room("s-1");
        let _streamer = fx.join(&room, "c-s", streamer_identity()).await.unwrap();

        let result = room
            .signal("c-s".to_string(), ClientMessage::RecordingStop)
            .await;
        assert!(matches!(result, Err(RcError::RecordingNotActive)));
    }

    #[tokio::test]
    async fn test_viewer_cannot_control_recording() {
        let fx = Fixture::new(session("s-1", SessionStatus::Active));
        let room = fx.spawn_room("s-1");
        let _streamer = fx.join(&room, "c-s", streamer_identity()).await.unwrap();
        let _viewer = fx.join(&room, "c-1", viewer_identity("v1")).await.unwrap();
        fx.produce(&room, "c-s", MediaSource::Camera, MediaKind::Video)
            .await
            .unwrap();

        let start = room
            .signal("c-1".to_string(), ClientMessage::RecordingStart)
            .await;
        assert!(matches!(start, Err(RcError::PermissionDenied(_))));

        room.signal("c-s".to_string(), ClientMessage::RecordingStart)
            .await
            .unwrap();
        let stop = room
            .signal("c-1".to_string(), ClientMessage::RecordingStop)
            .await;
        assert!(matches!(stop, Err(RcError::PermissionDenied(_))));
    }

    #[tokio::test]
    async fn test_failed_append_marks_artifact_degraded() {
        let fx = Fixture::new(session("s-1", SessionStatus::Active));
        let room = fx.spawn_room("s-1");
        let mut streamer = fx.join(&room, "c-s", streamer_identity()).await.unwrap();
        fx.produce(&room, "c-s", MediaSource::Camera, MediaKind::Video)
            .await
            .unwrap();
        room.signal("c-s".to_string(), ClientMessage::RecordingStart)
            .await
            .unwrap();

        fx.platform.set_fail_recording_appends(true);
        room.signal("c-s".to_string(), ClientMessage::RecordingStop)
            .await
            .unwrap();

        let stopped = streamer
            .expect(|e| matches!(e, ServerEvent::RecordingStopped(_)))
            .await;
        assert!(matches!(
            stopped,
            ServerEvent::RecordingStopped(ref p) if p.degraded.is_some()
        ));
        assert!(fx.platform.session("s-1").unwrap().recordings.is_empty());
    }

    #[tokio::test]
    async fn test_session_end_finishes_recording() {
        let fx = Fixture::new(session("s-1", SessionStatus::Active));
        let room = fx.spawn_room("s-1");
        let _streamer = fx.join(&room, "c-s", streamer_identity()).await.unwrap();
        fx.produce(&room, "c-s", MediaSource::Camera, MediaKind::Video)
            .await
            .unwrap();
        room.signal("c-s".to_string(), ClientMessage::RecordingStart)
            .await
            .unwrap();

        room.signal("c-s".to_string(), ClientMessage::StreamerEnd)
            .await
            .unwrap();

        assert_eq!(fx.transcoder.stopped(), 1);
        assert_eq!(fx.platform.session("s-1").unwrap().recordings.len(), 1);
    }
}
