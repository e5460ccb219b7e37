//! External collaborators of the room controller.
//!
//! Sessions, participation records, whiteboard documents and uploaded files
//! live in the platform; identities come from signed access tokens. Each is
//! consumed through a trait so the actors can run against the HTTP platform
//! client in production and the in-memory store in tests.

pub mod identity;
pub mod memory;
pub mod platform;

use crate::errors::RcError;
use crate::whiteboard::WhiteboardDocument;
use chrono::{DateTime, Utc};
use common::types::{SessionStatus, UserRole};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// Persisted streaming session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: String,
    pub room_code: String,
    pub streamer_id: String,
    pub status: SessionStatus,
    pub max_participants: u32,
    #[serde(default)]
    pub peak_participants: u32,
    #[serde(default)]
    pub total_joins: u32,
    #[serde(default)]
    pub whiteboard_id: Option<String>,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default)]
    pub allowed_user_ids: Vec<String>,
    #[serde(default)]
    pub recordings: Vec<RecordingArtifact>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArtifactStatus {
    Completed,
    Failed,
}

/// Append-only record of one captured recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingArtifact {
    pub file_name: String,
    pub file_url: Option<String>,
    /// Seconds.
    pub duration: u64,
    pub recorded_at: DateTime<Utc>,
    pub status: ArtifactStatus,
    /// Bytes.
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParticipationStatus {
    Joined,
    Left,
}

/// Verified caller identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub role: UserRole,
    pub display_name: Option<String>,
}

#[async_trait::async_trait]
pub trait SessionRepository: Send + Sync {
    /// Load a session; `SessionNotFound` if absent.
    async fn get(&self, session_id: &str) -> Result<SessionRecord, RcError>;

    async fn find_by_room_code(&self, room_code: &str) -> Result<SessionRecord, RcError>;

    /// Persist a status change. Stamps `startedAt`/`endedAt` as appropriate.
    async fn update_status(&self, session_id: &str, status: SessionStatus)
        -> Result<(), RcError>;

    /// Max-merge the stored peak with `peak`.
    async fn record_peak(&self, session_id: &str, peak: u32) -> Result<(), RcError>;

    async fn increment_total_joins(&self, session_id: &str) -> Result<(), RcError>;

    async fn append_recording(
        &self,
        session_id: &str,
        artifact: &RecordingArtifact,
    ) -> Result<(), RcError>;
}

#[async_trait::async_trait]
pub trait ParticipationRepository: Send + Sync {
    async fn upsert_joined(
        &self,
        session_id: &str,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), RcError>;

    async fn mark_left(&self, session_id: &str, user_id: &str, at: DateTime<Utc>)
        -> Result<(), RcError>;
}

#[async_trait::async_trait]
pub trait WhiteboardRepository: Send + Sync {
    /// Load a document; a missing document yields an empty one.
    async fn load(&self, whiteboard_id: &str) -> Result<WhiteboardDocument, RcError>;

    async fn save(&self, document: &WhiteboardDocument) -> Result<(), RcError>;
}

#[async_trait::async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Upload a local file under `key`; returns its public URL.
    async fn upload(&self, file: &Path, key: &str, content_type: &str) -> Result<String, RcError>;
}

#[async_trait::async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Identity, RcError>;
}

/// Persistence collaborators shared by every room.
#[derive(Clone)]
pub struct Collaborators {
    pub sessions: Arc<dyn SessionRepository>,
    pub participation: Arc<dyn ParticipationRepository>,
    pub whiteboards: Arc<dyn WhiteboardRepository>,
    pub storage: Arc<dyn ObjectStorage>,
}

impl Collaborators {
    /// Use one backend for every collaborator.
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: SessionRepository
            + ParticipationRepository
            + WhiteboardRepository
            + ObjectStorage
            + 'static,
    {
        Self {
            sessions: backend.clone(),
            participation: backend.clone(),
            whiteboards: backend.clone(),
            storage: backend,
        }
    }
}
