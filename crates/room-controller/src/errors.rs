//! Room Controller error types.
//!
//! Every error maps to one client-visible class (`ErrorKind`) and a numeric
//! signaling code. Internal details are logged server-side but not exposed
//! to clients.

use common::jwt::JwtValidationError;
use common::types::SessionStatus;
use serde::Serialize;
use thiserror::Error;

/// Client-visible error class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Missing or invalid input.
    Validation,
    /// Session, participant or media resource absent.
    NotFound,
    /// Role or ownership mismatch.
    Authorization,
    /// Media engine call failed.
    Provider,
    /// Recording or transcode failure.
    Pipeline,
    /// Anything the client cannot act on.
    Internal,
}

impl ErrorKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Authorization => "authorization",
            ErrorKind::Provider => "provider",
            ErrorKind::Pipeline => "pipeline",
            ErrorKind::Internal => "internal",
        }
    }
}

/// Room Controller error type.
///
/// Maps to signaling error codes:
/// - `JwtValidation`: `UNAUTHORIZED` (2)
/// - `PermissionDenied`: `FORBIDDEN` (3)
/// - `*NotFound`, `RecordingNotActive`: `NOT_FOUND` (4)
/// - `Conflict`, `SessionNotJoinable`: `CONFLICT` (5)
/// - Internal, Redis, Config, Platform, `RoomClosing`: `INTERNAL_ERROR` (6)
/// - `CapacityExceeded`, `Draining`: `CAPACITY_EXCEEDED` (7)
/// - `Validation`, `NotInRoom`: `INVALID_REQUEST` (8)
/// - `Provider`: `MEDIA_PROVIDER_ERROR` (9)
/// - `Pipeline`: `RECORDING_PIPELINE_ERROR` (10)
#[derive(Debug, Error)]
pub enum RcError {
    /// Malformed or incomplete client input.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Message requires a joined room.
    #[error("Connection has not joined a room")]
    NotInRoom,

    /// Access token rejected.
    #[error("JWT validation failed: {0}")]
    JwtValidation(#[from] JwtValidationError),

    /// Role or ownership mismatch.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Session not found.
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Session exists but is not in a joinable status.
    #[error("Session is not joinable in status {0}")]
    SessionNotJoinable(SessionStatus),

    /// Participant not found (or no longer connected).
    #[error("Participant not found: {0}")]
    ParticipantNotFound(String),

    /// Router, transport, producer or consumer not found.
    #[error("{resource} not found: {id}")]
    ResourceNotFound { resource: &'static str, id: String },

    /// Stop requested while no recording is running.
    #[error("No active recording")]
    RecordingNotActive,

    /// State conflict (e.g., request already granted).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Room or process capacity exceeded.
    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// Process is shutting down.
    #[error("Room controller is draining")]
    Draining,

    /// Media engine call failed.
    #[error("Media provider error: {0}")]
    Provider(String),

    /// Recording pipeline failure.
    #[error("Recording pipeline error: {0}")]
    Pipeline(String),

    /// Platform API call failed.
    #[error("Platform error: {0}")]
    Platform(String),

    /// Redis operation failed.
    #[error("Redis error: {0}")]
    Redis(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Target room actor is shutting down; callers may retry on a fresh room.
    #[error("Room is closing")]
    RoomClosing,

    /// Internal error with context.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RcError {
    /// Shorthand for [`RcError::ResourceNotFound`].
    pub fn not_found(resource: &'static str, id: impl Into<String>) -> Self {
        RcError::ResourceNotFound {
            resource,
            id: id.into(),
        }
    }

    /// Returns the client-visible error class.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            RcError::Validation(_)
            | RcError::NotInRoom
            | RcError::SessionNotJoinable(_)
            | RcError::Conflict(_)
            | RcError::CapacityExceeded(_) => ErrorKind::Validation,
            RcError::SessionNotFound(_)
            | RcError::ParticipantNotFound(_)
            | RcError::ResourceNotFound { .. }
            | RcError::RecordingNotActive => ErrorKind::NotFound,
            RcError::JwtValidation(_) | RcError::PermissionDenied(_) => ErrorKind::Authorization,
            RcError::Provider(_) => ErrorKind::Provider,
            RcError::Pipeline(_) => ErrorKind::Pipeline,
            RcError::Draining
            | RcError::Platform(_)
            | RcError::Redis(_)
            | RcError::Config(_)
            | RcError::RoomClosing
            | RcError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Returns the signaling error code value for this error.
    #[must_use]
    pub fn error_code(&self) -> i32 {
        match self {
            RcError::Platform(_)
            | RcError::Redis(_)
            | RcError::Config(_)
            | RcError::RoomClosing
            | RcError::Internal(_) => 6, // INTERNAL_ERROR
            RcError::JwtValidation(_) => 2, // UNAUTHORIZED
            RcError::PermissionDenied(_) => 3, // FORBIDDEN
            RcError::SessionNotFound(_)
            | RcError::ParticipantNotFound(_)
            | RcError::ResourceNotFound { .. }
            | RcError::RecordingNotActive => 4, // NOT_FOUND
            RcError::Conflict(_) | RcError::SessionNotJoinable(_) => 5, // CONFLICT
            RcError::CapacityExceeded(_) | RcError::Draining => 7, // CAPACITY_EXCEEDED
            RcError::Validation(_) | RcError::NotInRoom => 8, // INVALID_REQUEST
            RcError::Provider(_) => 9, // MEDIA_PROVIDER_ERROR
            RcError::Pipeline(_) => 10, // RECORDING_PIPELINE_ERROR
        }
    }

    /// Returns a bounded label string for the error variant (for metrics).
    #[must_use]
    pub fn error_type_label(&self) -> &'static str {
        match self {
            RcError::Validation(_) => "validation",
            RcError::NotInRoom => "not_in_room",
            RcError::JwtValidation(_) => "jwt_validation",
            RcError::PermissionDenied(_) => "permission_denied",
            RcError::SessionNotFound(_) => "session_not_found",
            RcError::SessionNotJoinable(_) => "session_not_joinable",
            RcError::ParticipantNotFound(_) => "participant_not_found",
            RcError::ResourceNotFound { .. } => "resource_not_found",
            RcError::RecordingNotActive => "recording_not_active",
            RcError::Conflict(_) => "conflict",
            RcError::CapacityExceeded(_) => "capacity_exceeded",
            RcError::Draining => "draining",
            RcError::Provider(_) => "provider",
            RcError::Pipeline(_) => "pipeline",
            RcError::Platform(_) => "platform",
            RcError::Redis(_) => "redis",
            RcError::Config(_) => "config",
            RcError::RoomClosing => "room_closing",
            RcError::Internal(_) => "internal",
        }
    }

    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            RcError::Platform(_)
            | RcError::Redis(_)
            | RcError::Config(_)
            | RcError::Internal(_) => "An internal error occurred".to_string(),
            RcError::RoomClosing => "Room is restarting, please retry".to_string(),
            RcError::JwtValidation(e) => e.to_string(),
            RcError::NotInRoom => "Join a room first".to_string(),
            RcError::SessionNotFound(_) => "Session not found".to_string(),
            RcError::SessionNotJoinable(status) => {
                format!("Session cannot be joined while {status}")
            }
            RcError::ParticipantNotFound(_) => "Participant not found".to_string(),
            RcError::ResourceNotFound { resource, .. } => format!("{resource} not found"),
            RcError::RecordingNotActive => "No recording is active".to_string(),
            RcError::Draining => "Server is shutting down, please reconnect".to_string(),
            RcError::Provider(_) => "Media operation failed".to_string(),
            RcError::Pipeline(_) => "Recording operation failed".to_string(),
            RcError::Validation(msg)
            | RcError::Conflict(msg)
            | RcError::PermissionDenied(msg)
            | RcError::CapacityExceeded(msg) => msg.clone(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        // Internal errors -> 6
        assert_eq!(RcError::Redis("conn failed".to_string()).error_code(), 6);
        assert_eq!(RcError::Platform("503".to_string()).error_code(), 6);
        assert_eq!(RcError::Internal("test".to_string()).error_code(), 6);
        assert_eq!(RcError::RoomClosing.error_code(), 6);

        // Auth errors -> 2
        assert_eq!(
            RcError::JwtValidation(JwtValidationError::InvalidToken).error_code(),
            2
        );

        // Forbidden -> 3
        assert_eq!(
            RcError::PermissionDenied("not streamer".to_string()).error_code(),
            3
        );

        // Not found -> 4
        assert_eq!(RcError::SessionNotFound("s-1".to_string()).error_code(), 4);
        assert_eq!(RcError::not_found("producer", "p-1").error_code(), 4);
        assert_eq!(RcError::RecordingNotActive.error_code(), 4);

        // Conflict -> 5
        assert_eq!(
            RcError::SessionNotJoinable(SessionStatus::Ended).error_code(),
            5
        );

        // Capacity -> 7
        assert_eq!(
            RcError::CapacityExceeded("room full".to_string()).error_code(),
            7
        );
        assert_eq!(RcError::Draining.error_code(), 7);

        // Validation -> 8, provider -> 9, pipeline -> 10
        assert_eq!(RcError::Validation("bad".to_string()).error_code(), 8);
        assert_eq!(RcError::Provider("sfu down".to_string()).error_code(), 9);
        assert_eq!(RcError::Pipeline("ffmpeg".to_string()).error_code(), 10);
    }

    #[test]
    fn test_kind_mapping() {
        assert_eq!(RcError::NotInRoom.kind(), ErrorKind::Validation);
        assert_eq!(RcError::RecordingNotActive.kind(), ErrorKind::NotFound);
        assert_eq!(
            RcError::PermissionDenied("x".to_string()).kind(),
            ErrorKind::Authorization
        );
        assert_eq!(RcError::Provider("x".to_string()).kind(), ErrorKind::Provider);
        assert_eq!(RcError::Pipeline("x".to_string()).kind(), ErrorKind::Pipeline);
        assert_eq!(RcError::Redis("x".to_string()).kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_client_message_hides_internal_details() {
        let err = RcError::Platform("GET http://platform.internal/x failed".to_string());
        assert_eq!(err.client_message(), "An internal error occurred");

        let err = RcError::Provider("POST http://127.0.0.1:3016/routers: 500".to_string());
        assert!(!err.client_message().contains("127.0.0.1"));

        let err = RcError::Pipeline("/tmp/recordings/s-1.mp4 missing".to_string());
        assert!(!err.client_message().contains("/tmp"));
    }

    #[test]
    fn test_client_message_passes_through_user_errors() {
        let err = RcError::Conflict("Audio already granted".to_string());
        assert_eq!(err.client_message(), "Audio already granted");

        let err = RcError::not_found("transport", "t-9");
        assert_eq!(err.client_message(), "transport not found");
    }

    #[test]
    fn test_error_display() {
        let err = RcError::SessionNotFound("session-123".to_string());
        assert_eq!(format!("{err}"), "Session not found: session-123");

        let err = RcError::SessionNotJoinable(SessionStatus::Cancelled);
        assert_eq!(format!("{err}"), "Session is not joinable in status CANCELLED");
    }

    #[test]
    fn test_error_type_label_bounded() {
        assert_eq!(RcError::Draining.error_type_label(), "draining");
        assert_eq!(
            RcError::not_found("consumer", "c-1").error_type_label(),
            "resource_not_found"
        );
    }
}
