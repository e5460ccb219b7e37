//! Pre-configured test data fixtures for RC testing.

use crate::tokens::TestToken;
use common::types::{SessionStatus, UserRole};
use room_controller::collaborators::SessionRecord;
use uuid::Uuid;

/// Streamer that owns every [`TestSession`] unless overridden.
pub const DEFAULT_STREAMER_ID: &str = "streamer-1";

/// Builder for a persisted session record.
#[derive(Debug, Clone)]
pub struct TestSession {
    record: SessionRecord,
}

impl TestSession {
    /// Scheduled session owned by [`DEFAULT_STREAMER_ID`] with a whiteboard.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            record: SessionRecord {
                room_code: format!("ROOM-{id}"),
                whiteboard_id: Some(format!("wb-{id}")),
                id,
                streamer_id: DEFAULT_STREAMER_ID.to_string(),
                status: SessionStatus::Scheduled,
                max_participants: 100,
                peak_participants: 0,
                total_joins: 0,
                is_private: false,
                allowed_user_ids: Vec::new(),
                recordings: Vec::new(),
                started_at: None,
                ended_at: None,
            },
        }
    }

    /// Session with a random id.
    #[must_use]
    pub fn random() -> Self {
        Self::new(format!("session-{}", Uuid::new_v4()))
    }

    #[must_use]
    pub fn with_status(mut self, status: SessionStatus) -> Self {
        self.record.status = status;
        self
    }

    #[must_use]
    pub fn with_streamer(mut self, streamer_id: impl Into<String>) -> Self {
        self.record.streamer_id = streamer_id.into();
        self
    }

    #[must_use]
    pub fn with_max_participants(mut self, max: u32) -> Self {
        self.record.max_participants = max;
        self
    }

    /// Restrict the session to `allowed` viewers.
    #[must_use]
    pub fn private(mut self, allowed: &[&str]) -> Self {
        self.record.is_private = true;
        self.record.allowed_user_ids = allowed.iter().map(ToString::to_string).collect();
        self
    }

    #[must_use]
    pub fn without_whiteboard(mut self) -> Self {
        self.record.whiteboard_id = None;
        self
    }

    #[must_use]
    pub fn build(self) -> SessionRecord {
        self.record
    }
}

/// A platform user that can mint access tokens.
#[derive(Debug, Clone)]
pub struct TestUser {
    pub user_id: String,
    pub role: UserRole,
    pub name: String,
}

impl TestUser {
    /// The default session owner.
    #[must_use]
    pub fn streamer() -> Self {
        Self {
            user_id: DEFAULT_STREAMER_ID.to_string(),
            role: UserRole::Streamer,
            name: "Streamer".to_string(),
        }
    }

    #[must_use]
    pub fn viewer(user_id: impl Into<String>) -> Self {
        let user_id = user_id.into();
        Self {
            name: format!("Viewer {user_id}"),
            user_id,
            role: UserRole::Viewer,
        }
    }

    /// Valid token for this user, signed with the harness secret.
    #[must_use]
    pub fn token(&self) -> String {
        TestToken::for_user(self).sign()
    }
}
