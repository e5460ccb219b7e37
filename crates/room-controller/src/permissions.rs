//! Permission negotiation.
//!
//! One state machine per (user, capability):
//!
//! ```text
//! None -> Requested -> Granted -> Producing
//!             |            \________\____ revoke ___> None
//!             +--> Denied -- request --> Requested
//! ```
//!
//! The book only tracks states; the room actor owns the side effects
//! (notifications, producer teardown, participant flags).

use crate::errors::RcError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Upgrade a viewer can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Capability {
    Audio,
    Video,
    ScreenShare,
}

impl Capability {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Capability::Audio => "audio",
            Capability::Video => "video",
            Capability::ScreenShare => "screen_share",
        }
    }
}

/// Negotiation state of one (user, capability) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PermissionState {
    #[default]
    None,
    Requested,
    Granted,
    Denied,
    Producing,
}

/// Result of a viewer request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// First request (or retry after a denial).
    Opened,
    /// Request already pending; the streamer is notified again.
    AlreadyPending,
}

#[derive(Debug, Default)]
pub struct PermissionBook {
    states: HashMap<(String, Capability), PermissionState>,
}

impl PermissionBook {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn state(&self, user_id: &str, capability: Capability) -> PermissionState {
        self.states
            .get(&(user_id.to_string(), capability))
            .copied()
            .unwrap_or_default()
    }

    fn set(&mut self, user_id: &str, capability: Capability, state: PermissionState) {
        let key = (user_id.to_string(), capability);
        if state == PermissionState::None {
            self.states.remove(&key);
        } else {
            self.states.insert(key, state);
        }
    }

    /// Viewer asks for `capability`.
    ///
    /// # Errors
    ///
    /// `Conflict` if the capability is already granted or in use.
    pub fn request(
        &mut self,
        user_id: &str,
        capability: Capability,
    ) -> Result<RequestOutcome, RcError> {
        match self.state(user_id, capability) {
            PermissionState::None | PermissionState::Denied => {
                self.set(user_id, capability, PermissionState::Requested);
                Ok(RequestOutcome::Opened)
            }
            PermissionState::Requested => Ok(RequestOutcome::AlreadyPending),
            PermissionState::Granted | PermissionState::Producing => Err(RcError::Conflict(
                format!("{} permission already granted", capability.as_str()),
            )),
        }
    }

    /// Streamer answers a pending request.
    ///
    /// # Errors
    ///
    /// `Conflict` if no request is pending for this pair.
    pub fn respond(
        &mut self,
        user_id: &str,
        capability: Capability,
        allow: bool,
    ) -> Result<PermissionState, RcError> {
        if self.state(user_id, capability) != PermissionState::Requested {
            return Err(RcError::Conflict(format!(
                "No pending {} request",
                capability.as_str()
            )));
        }

        let next = if allow {
            PermissionState::Granted
        } else {
            PermissionState::Denied
        };
        self.set(user_id, capability, next);
        Ok(next)
    }

    /// Whether a produce call for `capability` is currently allowed.
    ///
    /// A grant never expires; the client may retry produce at will.
    #[must_use]
    pub fn may_produce(&self, user_id: &str, capability: Capability) -> bool {
        matches!(
            self.state(user_id, capability),
            PermissionState::Granted | PermissionState::Producing
        )
    }

    pub fn mark_producing(&mut self, user_id: &str, capability: Capability) {
        if self.may_produce(user_id, capability) {
            self.set(user_id, capability, PermissionState::Producing);
        }
    }

    /// Drop the pair back to `None`, returning the previous state.
    pub fn revoke(&mut self, user_id: &str, capability: Capability) -> PermissionState {
        let previous = self.state(user_id, capability);
        self.set(user_id, capability, PermissionState::None);
        previous
    }

    /// Every non-`None` state of one user.
    #[must_use]
    pub fn states_for(&self, user_id: &str) -> BTreeMap<Capability, PermissionState> {
        self.states
            .iter()
            .filter(|((user, _), _)| user == user_id)
            .map(|((_, capability), state)| (*capability, *state))
            .collect()
    }

    /// Forget everything about a departed user.
    pub fn forget_user(&mut self, user_id: &str) {
        self.states.retain(|(user, _), _| user != user_id);
    }

    /// Users with a pending request for `capability`, sorted.
    #[must_use]
    pub fn pending(&self, capability: Capability) -> Vec<String> {
        let mut users: Vec<String> = self
            .states
            .iter()
            .filter(|((_, cap), state)| *cap == capability && **state == PermissionState::Requested)
            .map(|((user, _), _)| user.clone())
            .collect();
        users.sort();
        users
    }
}
