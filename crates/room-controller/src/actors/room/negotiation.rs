//! Viewer upgrade requests and streamer decisions.

use super::lifecycle::require_streamer;
use super::{Caller, RoomActor};
use crate::errors::RcError;
use crate::observability::metrics;
use crate::permissions::{Capability, PermissionState, RequestOutcome};
use crate::signaling::protocol::ServerEvent;
use tracing::{debug, info};

impl RoomActor {
    pub(super) fn request_permission(
        &mut self,
        caller: &Caller,
        capability: Capability,
    ) -> Result<(), RcError> {
        if caller.is_streamer {
            return Err(RcError::Validation(
                "The streamer does not need permission".to_string(),
            ));
        }
        let Some(streamer_connection) = self.streamer_socket.clone() else {
            return Err(RcError::Conflict(
                "The streamer is not connected".to_string(),
            ));
        };
        if capability == Capability::ScreenShare
            && self
                .screen_sharer
                .as_ref()
                .is_some_and(|sharer| *sharer != caller.user_id)
        {
            return Err(RcError::Conflict(
                "Another participant is sharing their screen".to_string(),
            ));
        }

        let outcome = self.permissions.request(&caller.user_id, capability)?;
        if outcome == RequestOutcome::Opened {
            self.broadcast_participants();
        }
        self.send_to_connection(
            &streamer_connection,
            ServerEvent::permission_request(
                capability,
                caller.user_id.clone(),
                caller.display_name.clone(),
            ),
        );

        debug!(
            target: "rc.actor.room",
            session_id = %self.session_id,
            user_id = %caller.user_id,
            capability = capability.as_str(),
            repeated = outcome == RequestOutcome::AlreadyPending,
            "Permission requested"
        );
        Ok(())
    }

    pub(super) fn respond_permission(
        &mut self,
        caller: &Caller,
        capability: Capability,
        user_id: &str,
        allow: bool,
    ) -> Result<(), RcError> {
        require_streamer(caller)?;
        let target = self
            .connection_of_user(user_id)
            .filter(|connection_id| self.streamer_socket.as_ref() != Some(connection_id))
            .ok_or_else(|| RcError::ParticipantNotFound(user_id.to_string()))?;

        if allow
            && capability == Capability::ScreenShare
            && self
                .screen_sharer
                .as_ref()
                .is_some_and(|sharer| sharer != user_id)
        {
            return Err(RcError::Conflict(
                "Another participant is sharing their screen".to_string(),
            ));
        }

        let state = self.permissions.respond(user_id, capability, allow)?;
        let granted = state == PermissionState::Granted;
        metrics::record_permission_decision(
            capability.as_str(),
            if granted { "granted" } else { "denied" },
        );
        self.send_to_connection(
            &target,
            ServerEvent::permission_decision(capability, granted),
        );
        self.broadcast_participants();

        info!(
            target: "rc.actor.room",
            session_id = %self.session_id,
            user_id = %user_id,
            capability = capability.as_str(),
            granted,
            "Permission decided"
        );
        Ok(())
    }

    /// Withdraw a grant. The streamer may revoke anyone; a viewer only
    /// their own. Producers riding on the grant close first.
    pub(super) async fn revoke_permission(
        &mut self,
        caller: &Caller,
        user_id: &str,
        capability: Capability,
    ) -> Result<(), RcError> {
        if !caller.is_streamer && caller.user_id != user_id {
            return Err(RcError::PermissionDenied(
                "Cannot revoke another participant's permission".to_string(),
            ));
        }
        if !self.participants.contains_key(user_id) {
            return Err(RcError::ParticipantNotFound(user_id.to_string()));
        }

        let producer_ids: Vec<String> = self
            .media
            .producers()
            .filter(|p| p.tag.user_id == user_id && p.source.required_capability() == Some(capability))
            .map(|p| p.id.clone())
            .collect();
        for producer_id in producer_ids {
            self.close_producer_settled(&producer_id).await;
        }
        let previous = self.permissions.revoke(user_id, capability);
        metrics::record_permission_decision(capability.as_str(), "revoked");

        if caller.user_id != user_id {
            if let Some(target) = self.connection_of_user(user_id) {
                self.send_to_connection(&target, ServerEvent::PermissionRevoked { capability });
            }
        }
        self.broadcast_participants();
        self.publish_presence().await;

        info!(
            target: "rc.actor.room",
            session_id = %self.session_id,
            user_id = %user_id,
            capability = capability.as_str(),
            previous = ?previous,
            "Permission revoked"
        );
        Ok(())
    }

    /// Re-send requests still awaiting an answer to a streamer socket that
    /// just joined.
    pub(super) fn replay_pending_requests(&self, streamer_connection: &str) {
        for capability in [Capability::Audio, Capability::Video, Capability::ScreenShare] {
            for user_id in self.permissions.pending(capability) {
                let display_name = self
                    .participants
                    .get(&user_id)
                    .and_then(|p| p.display_name.clone());
                self.send_to_connection(
                    streamer_connection,
                    ServerEvent::permission_request(capability, user_id, display_name),
                );
            }
        }
    }
}
