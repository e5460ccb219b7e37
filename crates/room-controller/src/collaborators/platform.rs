//! HTTP client for the platform REST API.
//!
//! The platform owns sessions, participation records, whiteboard documents
//! and uploaded files. Every call carries the service bearer token.

use super::{
    ObjectStorage, ParticipationRepository, ParticipationStatus, RecordingArtifact, SessionRecord,
    SessionRepository, WhiteboardRepository,
};
use crate::errors::RcError;
use crate::whiteboard::WhiteboardDocument;
use chrono::{DateTime, Utc};
use common::secret::{ExposeSecret, SecretString};
use common::types::SessionStatus;
use reqwest::{Body, Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::Path;
use std::time::Duration;
use tokio_util::io::ReaderStream;
use tracing::{error, instrument, warn};

/// Default timeout for platform requests in seconds.
const PLATFORM_REQUEST_TIMEOUT_SECS: u64 = 10;

/// Uploads stream whole recordings; give them longer.
const UPLOAD_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ParticipationBody {
    status: ParticipationStatus,
    at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    url: String,
}

/// Platform REST client.
#[derive(Clone)]
pub struct PlatformClient {
    client: Client,
    base_url: String,
    token: SecretString,
}

impl PlatformClient {
    /// Create a new platform client.
    ///
    /// # Errors
    ///
    /// Returns `RcError::Internal` if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, token: SecretString) -> Result<Self, RcError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(PLATFORM_REQUEST_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| {
                error!(target: "rc.platform", error = %e, "Failed to build HTTP client");
                RcError::Internal(format!("platform client: {e}"))
            })?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn send(&self, request: reqwest::RequestBuilder, path: &str) -> Result<Response, RcError> {
        request
            .bearer_auth(self.token.expose_secret())
            .send()
            .await
            .map_err(|e| {
                warn!(target: "rc.platform", path = %path, error = %e, "Platform request failed");
                RcError::Platform(format!("{path}: unavailable"))
            })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, RcError> {
        let response = self.send(self.client.get(self.url(path)), path).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => response.json().await.map(Some).map_err(|e| {
                error!(target: "rc.platform", path = %path, error = %e, "Failed to parse platform response");
                RcError::Platform(format!("{path}: unreadable body"))
            }),
            status => Err(rejected(path, status, response).await),
        }
    }

    async fn write_json<B: Serialize + ?Sized>(
        &self,
        request: reqwest::RequestBuilder,
        path: &str,
        body: &B,
    ) -> Result<StatusCode, RcError> {
        let response = self.send(request.json(body), path).await?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            Ok(status)
        } else {
            Err(rejected(path, status, response).await)
        }
    }

    async fn patch_session(&self, session_id: &str, body: serde_json::Value) -> Result<(), RcError> {
        let path = format!("/internal/sessions/{session_id}");
        let status = self
            .write_json(self.client.patch(self.url(&path)), &path, &body)
            .await?;
        if status == StatusCode::NOT_FOUND {
            return Err(RcError::SessionNotFound(session_id.to_string()));
        }
        Ok(())
    }

    async fn put_participation(
        &self,
        session_id: &str,
        user_id: &str,
        status: ParticipationStatus,
        at: DateTime<Utc>,
    ) -> Result<(), RcError> {
        let path = format!("/internal/sessions/{session_id}/participants/{user_id}");
        let body = ParticipationBody { status, at };
        let code = self
            .write_json(self.client.put(self.url(&path)), &path, &body)
            .await?;
        if code == StatusCode::NOT_FOUND {
            return Err(RcError::SessionNotFound(session_id.to_string()));
        }
        Ok(())
    }
}

async fn rejected(path: &str, status: StatusCode, response: Response) -> RcError {
    let body = response.text().await.unwrap_or_default();
    warn!(target: "rc.platform", path = %path, status = %status, body = %body, "Platform rejected request");
    RcError::Platform(format!("{path} returned {status}"))
}

#[async_trait::async_trait]
impl SessionRepository for PlatformClient {
    #[instrument(skip(self), fields(session_id = %session_id))]
    async fn get(&self, session_id: &str) -> Result<SessionRecord, RcError> {
        self.get_json(&format!("/internal/sessions/{session_id}"))
            .await?
            .ok_or_else(|| RcError::SessionNotFound(session_id.to_string()))
    }

    #[instrument(skip(self))]
    async fn find_by_room_code(&self, room_code: &str) -> Result<SessionRecord, RcError> {
        self.get_json(&format!("/internal/sessions/by-room-code/{room_code}"))
            .await?
            .ok_or_else(|| RcError::SessionNotFound(room_code.to_string()))
    }

    async fn update_status(
        &self,
        session_id: &str,
        status: SessionStatus,
    ) -> Result<(), RcError> {
        self.patch_session(session_id, json!({ "status": status })).await
    }

    async fn record_peak(&self, session_id: &str, peak: u32) -> Result<(), RcError> {
        self.patch_session(session_id, json!({ "peakParticipantsAtLeast": peak }))
            .await
    }

    async fn increment_total_joins(&self, session_id: &str) -> Result<(), RcError> {
        self.patch_session(session_id, json!({ "incrementTotalJoins": 1 }))
            .await
    }

    #[instrument(skip(self, artifact), fields(session_id = %session_id, file_name = %artifact.file_name))]
    async fn append_recording(
        &self,
        session_id: &str,
        artifact: &RecordingArtifact,
    ) -> Result<(), RcError> {
        let path = format!("/internal/sessions/{session_id}/recordings");
        let status = self
            .write_json(self.client.post(self.url(&path)), &path, artifact)
            .await?;
        if status == StatusCode::NOT_FOUND {
            return Err(RcError::SessionNotFound(session_id.to_string()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ParticipationRepository for PlatformClient {
    async fn upsert_joined(
        &self,
        session_id: &str,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), RcError> {
        self.put_participation(session_id, user_id, ParticipationStatus::Joined, at)
            .await
    }

    async fn mark_left(
        &self,
        session_id: &str,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), RcError> {
        self.put_participation(session_id, user_id, ParticipationStatus::Left, at)
            .await
    }
}

#[async_trait::async_trait]
impl WhiteboardRepository for PlatformClient {
    async fn load(&self, whiteboard_id: &str) -> Result<WhiteboardDocument, RcError> {
        Ok(self
            .get_json(&format!("/internal/whiteboards/{whiteboard_id}"))
            .await?
            .unwrap_or_else(|| WhiteboardDocument::new(whiteboard_id)))
    }

    #[instrument(skip_all, fields(whiteboard_id = %document.id, version = document.version))]
    async fn save(&self, document: &WhiteboardDocument) -> Result<(), RcError> {
        let path = format!("/internal/whiteboards/{}", document.id);
        let status = self
            .write_json(self.client.put(self.url(&path)), &path, document)
            .await?;
        if status == StatusCode::NOT_FOUND {
            return Err(RcError::not_found("Whiteboard", document.id.clone()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ObjectStorage for PlatformClient {
    #[instrument(skip(self, file), fields(key = %key))]
    async fn upload(&self, file: &Path, key: &str, content_type: &str) -> Result<String, RcError> {
        let path = "/internal/uploads";
        let handle = tokio::fs::File::open(file).await.map_err(|e| {
            warn!(target: "rc.platform", error = %e, "Recording file unreadable");
            RcError::Pipeline(format!("open {}: {e}", file.display()))
        })?;

        let request = self
            .client
            .post(self.url(path))
            .timeout(Duration::from_secs(UPLOAD_TIMEOUT_SECS))
            .query(&[("key", key)])
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(Body::wrap_stream(ReaderStream::new(handle)));

        let response = self.send(request, path).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(rejected(path, status, response).await);
        }

        let body: UploadResponse = response.json().await.map_err(|e| {
            error!(target: "rc.platform", error = %e, "Failed to parse upload response");
            RcError::Platform("upload returned an unreadable body".to_string())
        })?;
        Ok(body.url)
    }
}
