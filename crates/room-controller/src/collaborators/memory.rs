//! In-memory collaborators for tests and local development.
//!
//! [`InMemoryPlatform`] implements every persistence trait against shared
//! maps; [`StaticIdentities`] maps opaque tokens to fixed identities.

use super::{
    Identity, IdentityVerifier, ObjectStorage, ParticipationRepository,
    ParticipationStatus, RecordingArtifact, SessionRecord, SessionRepository,
    WhiteboardRepository,
};
use crate::errors::RcError;
use crate::whiteboard::WhiteboardDocument;
use chrono::{DateTime, Utc};
use common::jwt::JwtValidationError;
use common::types::SessionStatus;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Default)]
struct Inner {
    sessions: HashMap<String, SessionRecord>,
    participation: HashMap<(String, String), ParticipationStatus>,
    whiteboards: HashMap<String, WhiteboardDocument>,
    whiteboard_saves: usize,
    uploads: Vec<String>,
    status_history: Vec<(String, SessionStatus)>,
    fail_uploads: bool,
    fail_recording_appends: bool,
    fail_whiteboard_saves: bool,
    whiteboard_save_delay: Option<Duration>,
}

/// Shared in-memory platform store.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPlatform {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryPlatform {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seed a session.
    #[must_use]
    pub fn with_session(self, record: SessionRecord) -> Self {
        self.insert_session(record);
        self
    }

    /// Seed a whiteboard document.
    #[must_use]
    pub fn with_whiteboard(self, document: WhiteboardDocument) -> Self {
        self.lock()
            .whiteboards
            .insert(document.id.clone(), document);
        self
    }

    pub fn insert_session(&self, record: SessionRecord) {
        self.lock().sessions.insert(record.id.clone(), record);
    }

    pub fn set_fail_uploads(&self, fail: bool) {
        self.lock().fail_uploads = fail;
    }

    pub fn set_fail_recording_appends(&self, fail: bool) {
        self.lock().fail_recording_appends = fail;
    }

    pub fn set_fail_whiteboard_saves(&self, fail: bool) {
        self.lock().fail_whiteboard_saves = fail;
    }

    /// Make every whiteboard save take `delay` before it lands.
    pub fn set_whiteboard_save_delay(&self, delay: Option<Duration>) {
        self.lock().whiteboard_save_delay = delay;
    }

    #[must_use]
    pub fn session(&self, session_id: &str) -> Option<SessionRecord> {
        self.lock().sessions.get(session_id).cloned()
    }

    #[must_use]
    pub fn participation(&self, session_id: &str, user_id: &str) -> Option<ParticipationStatus> {
        self.lock()
            .participation
            .get(&(session_id.to_string(), user_id.to_string()))
            .copied()
    }

    #[must_use]
    pub fn whiteboard(&self, whiteboard_id: &str) -> Option<WhiteboardDocument> {
        self.lock().whiteboards.get(whiteboard_id).cloned()
    }

    /// Number of successful whiteboard saves.
    #[must_use]
    pub fn whiteboard_saves(&self) -> usize {
        self.lock().whiteboard_saves
    }

    /// Keys of uploaded files, in order.
    #[must_use]
    pub fn uploads(&self) -> Vec<String> {
        self.lock().uploads.clone()
    }

    /// Every persisted status change, in order.
    #[must_use]
    pub fn status_history(&self, session_id: &str) -> Vec<SessionStatus> {
        self.lock()
            .status_history
            .iter()
            .filter(|(id, _)| id == session_id)
            .map(|(_, status)| *status)
            .collect()
    }

    fn with_session_mut<T>(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut SessionRecord) -> T,
    ) -> Result<T, RcError> {
        let mut inner = self.lock();
        let record = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| RcError::SessionNotFound(session_id.to_string()))?;
        Ok(f(record))
    }
}

#[async_trait::async_trait]
impl SessionRepository for InMemoryPlatform {
    async fn get(&self, session_id: &str) -> Result<SessionRecord, RcError> {
        self.session(session_id)
            .ok_or_else(|| RcError::SessionNotFound(session_id.to_string()))
    }

    async fn find_by_room_code(&self, room_code: &str) -> Result<SessionRecord, RcError> {
        self.lock()
            .sessions
            .values()
            .find(|s| s.room_code == room_code)
            .cloned()
            .ok_or_else(|| RcError::SessionNotFound(room_code.to_string()))
    }

    async fn update_status(
        &self,
        session_id: &str,
        status: SessionStatus,
    ) -> Result<(), RcError> {
        let now = Utc::now();
        self.with_session_mut(session_id, |record| {
            record.status = status;
            match status {
                SessionStatus::Active if record.started_at.is_none() => {
                    record.started_at = Some(now);
                }
                SessionStatus::Ended | SessionStatus::Cancelled => record.ended_at = Some(now),
                _ => {}
            }
        })?;
        self.lock()
            .status_history
            .push((session_id.to_string(), status));
        Ok(())
    }

    async fn record_peak(&self, session_id: &str, peak: u32) -> Result<(), RcError> {
        self.with_session_mut(session_id, |record| {
            record.peak_participants = record.peak_participants.max(peak);
        })
    }

    async fn increment_total_joins(&self, session_id: &str) -> Result<(), RcError> {
        self.with_session_mut(session_id, |record| {
            record.total_joins = record.total_joins.saturating_add(1);
        })
    }

    async fn append_recording(
        &self,
        session_id: &str,
        artifact: &RecordingArtifact,
    ) -> Result<(), RcError> {
        if self.lock().fail_recording_appends {
            return Err(RcError::Platform("recording append rejected".to_string()));
        }
        self.with_session_mut(session_id, |record| {
            record.recordings.push(artifact.clone());
        })
    }
}

#[async_trait::async_trait]
impl ParticipationRepository for InMemoryPlatform {
    async fn upsert_joined(
        &self,
        session_id: &str,
        user_id: &str,
        _at: DateTime<Utc>,
    ) -> Result<(), RcError> {
        self.lock().participation.insert(
            (session_id.to_string(), user_id.to_string()),
            ParticipationStatus::Joined,
        );
        Ok(())
    }

    async fn mark_left(
        &self,
        session_id: &str,
        user_id: &str,
        _at: DateTime<Utc>,
    ) -> Result<(), RcError> {
        self.lock().participation.insert(
            (session_id.to_string(), user_id.to_string()),
            ParticipationStatus::Left,
        );
        Ok(())
    }
}

#[async_trait::async_trait]
impl WhiteboardRepository for InMemoryPlatform {
    async fn load(&self, whiteboard_id: &str) -> Result<WhiteboardDocument, RcError> {
        Ok(self
            .whiteboard(whiteboard_id)
            .unwrap_or_else(|| WhiteboardDocument::new(whiteboard_id)))
    }

    async fn save(&self, document: &WhiteboardDocument) -> Result<(), RcError> {
        let delay = self.lock().whiteboard_save_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut inner = self.lock();
        if inner.fail_whiteboard_saves {
            return Err(RcError::Platform("whiteboard save rejected".to_string()));
        }
        inner
            .whiteboards
            .insert(document.id.clone(), document.clone());
        inner.whiteboard_saves += 1;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ObjectStorage for InMemoryPlatform {
    async fn upload(&self, _file: &Path, key: &str, _content_type: &str) -> Result<String, RcError> {
        let mut inner = self.lock();
        if inner.fail_uploads {
            return Err(RcError::Platform("upload rejected".to_string()));
        }
        inner.uploads.push(key.to_string());
        Ok(format!("memory://uploads/{key}"))
    }
}

/// Token -> identity table.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentities {
    identities: HashMap<String, Identity>,
}

impl StaticIdentities {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, token: impl Into<String>, identity: Identity) -> Self {
        self.identities.insert(token.into(), identity);
        self
    }
}

#[async_trait::async_trait]
impl IdentityVerifier for StaticIdentities {
    async fn verify(&self, token: &str) -> Result<Identity, RcError> {
        self.identities
            .get(token)
            .cloned()
            .ok_or(RcError::JwtValidation(JwtValidationError::InvalidToken))
    }
}
