//! Common data types for Classroom Live components.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Role carried in a user access token.
///
/// The token role is a claim, not a room role: a `Streamer` token only
/// takes the streamer seat of the session whose `streamerId` matches the
/// token subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserRole {
    /// Instructor account allowed to broadcast its own sessions.
    Streamer,
    /// Audience account.
    Viewer,
}

impl UserRole {
    /// Returns the role as a string for logs and metric labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            UserRole::Streamer => "streamer",
            UserRole::Viewer => "viewer",
        }
    }
}

impl fmt::Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a streaming session as stored by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Scheduled,
    Active,
    Paused,
    Ended,
    Cancelled,
}

impl SessionStatus {
    /// Whether participants may join a room in this status.
    #[must_use]
    pub const fn is_joinable(&self) -> bool {
        matches!(
            self,
            SessionStatus::Scheduled | SessionStatus::Active | SessionStatus::Paused
        )
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Scheduled => "SCHEDULED",
            SessionStatus::Active => "ACTIVE",
            SessionStatus::Paused => "PAUSED",
            SessionStatus::Ended => "ENDED",
            SessionStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
