//! HTTP client for the SFU sidecar.
//!
//! The sidecar exposes the engine primitives as a small REST surface keyed
//! by resource id. Deletes of unknown ids (404) count as success.

use super::engine::MediaEngine;
use super::{
    ConsumeParams, ConsumerInfo, MediaKind, MediaTag, PlainTransportInfo, PlainTransportOptions,
    RouterInfo, RtpCodecCapability, WebRtcTransportInfo, WebRtcTransportOptions,
};
use crate::errors::RcError;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{error, instrument, warn};

/// Default timeout for sidecar requests in seconds.
const ENGINE_REQUEST_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Deserialize)]
struct IdResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CanConsumeResponse {
    can_consume: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateTransportBody<'a, T: Serialize> {
    #[serde(flatten)]
    options: &'a T,
    app_data: &'a MediaTag,
}

/// HTTP client implementing [`MediaEngine`] against the SFU sidecar.
#[derive(Clone)]
pub struct HttpMediaEngine {
    client: Client,
    base_url: String,
}

impl HttpMediaEngine {
    /// Create a new sidecar client.
    ///
    /// # Errors
    ///
    /// Returns `RcError::Internal` if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>) -> Result<Self, RcError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(ENGINE_REQUEST_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| {
                error!(target: "rc.media", error = %e, "Failed to build HTTP client");
                RcError::Internal(format!("media engine client: {e}"))
            })?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn post<B, T>(&self, path: &str, body: &B) -> Result<T, RcError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = format!("{}{path}", self.base_url);
        let response = self.client.post(&url).json(body).send().await.map_err(|e| {
            warn!(target: "rc.media", path = %path, error = %e, "Media engine request failed");
            RcError::Provider("media engine unavailable".to_string())
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(target: "rc.media", path = %path, status = %status, body = %body, "Media engine rejected request");
            return Err(RcError::Provider(format!("{path} returned {status}")));
        }

        response.json().await.map_err(|e| {
            error!(target: "rc.media", path = %path, error = %e, "Failed to parse media engine response");
            RcError::Provider(format!("{path} returned an unreadable body"))
        })
    }

    async fn post_empty<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<(), RcError> {
        let url = format!("{}{path}", self.base_url);
        let response = self.client.post(&url).json(body).send().await.map_err(|e| {
            warn!(target: "rc.media", path = %path, error = %e, "Media engine request failed");
            RcError::Provider("media engine unavailable".to_string())
        })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status == StatusCode::NOT_FOUND {
            Err(RcError::Provider(format!("{path}: unknown resource")))
        } else {
            warn!(target: "rc.media", path = %path, status = %status, "Media engine rejected request");
            Err(RcError::Provider(format!("{path} returned {status}")))
        }
    }

    async fn delete(&self, path: &str) -> Result<(), RcError> {
        let url = format!("{}{path}", self.base_url);
        let response = self.client.delete(&url).send().await.map_err(|e| {
            warn!(target: "rc.media", path = %path, error = %e, "Media engine request failed");
            RcError::Provider("media engine unavailable".to_string())
        })?;

        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            warn!(target: "rc.media", path = %path, status = %status, "Media engine close failed");
            Err(RcError::Provider(format!("{path} returned {status}")))
        }
    }
}

#[async_trait::async_trait]
impl MediaEngine for HttpMediaEngine {
    #[instrument(skip_all)]
    async fn create_router(&self, codecs: &[RtpCodecCapability]) -> Result<RouterInfo, RcError> {
        self.post("/routers", &json!({ "mediaCodecs": codecs })).await
    }

    async fn close_router(&self, router_id: &str) -> Result<(), RcError> {
        self.delete(&format!("/routers/{router_id}")).await
    }

    #[instrument(skip_all, fields(router_id = %router_id, socket_id = %tag.socket_id))]
    async fn create_webrtc_transport(
        &self,
        router_id: &str,
        options: &WebRtcTransportOptions,
        tag: &MediaTag,
    ) -> Result<WebRtcTransportInfo, RcError> {
        let body = CreateTransportBody {
            options,
            app_data: tag,
        };
        self.post(&format!("/routers/{router_id}/webrtc-transports"), &body)
            .await
    }

    #[instrument(skip_all, fields(router_id = %router_id))]
    async fn create_plain_transport(
        &self,
        router_id: &str,
        options: &PlainTransportOptions,
        tag: &MediaTag,
    ) -> Result<PlainTransportInfo, RcError> {
        let body = CreateTransportBody {
            options,
            app_data: tag,
        };
        self.post(&format!("/routers/{router_id}/plain-transports"), &body)
            .await
    }

    async fn connect_webrtc_transport(
        &self,
        transport_id: &str,
        dtls_parameters: &Value,
    ) -> Result<(), RcError> {
        self.post_empty(
            &format!("/transports/{transport_id}/connect"),
            &json!({ "dtlsParameters": dtls_parameters }),
        )
        .await
    }

    async fn connect_plain_transport(
        &self,
        transport_id: &str,
        ip: &str,
        port: u16,
    ) -> Result<(), RcError> {
        self.post_empty(
            &format!("/transports/{transport_id}/connect"),
            &json!({ "ip": ip, "port": port }),
        )
        .await
    }

    async fn close_transport(&self, transport_id: &str) -> Result<(), RcError> {
        self.delete(&format!("/transports/{transport_id}")).await
    }

    #[instrument(skip_all, fields(transport_id = %transport_id, kind = kind.as_str()))]
    async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: &Value,
        tag: &MediaTag,
    ) -> Result<String, RcError> {
        let created: IdResponse = self
            .post(
                &format!("/transports/{transport_id}/producers"),
                &json!({ "kind": kind, "rtpParameters": rtp_parameters, "appData": tag }),
            )
            .await?;
        Ok(created.id)
    }

    async fn pause_producer(&self, producer_id: &str) -> Result<(), RcError> {
        self.post_empty(&format!("/producers/{producer_id}/pause"), &json!({}))
            .await
    }

    async fn resume_producer(&self, producer_id: &str) -> Result<(), RcError> {
        self.post_empty(&format!("/producers/{producer_id}/resume"), &json!({}))
            .await
    }

    async fn close_producer(&self, producer_id: &str) -> Result<(), RcError> {
        self.delete(&format!("/producers/{producer_id}")).await
    }

    async fn can_consume(
        &self,
        router_id: &str,
        producer_id: &str,
        rtp_capabilities: &Value,
    ) -> Result<bool, RcError> {
        let answer: CanConsumeResponse = self
            .post(
                &format!("/routers/{router_id}/can-consume"),
                &json!({ "producerId": producer_id, "rtpCapabilities": rtp_capabilities }),
            )
            .await?;
        Ok(answer.can_consume)
    }

    #[instrument(skip_all, fields(transport_id = %params.transport_id, producer_id = %params.producer_id))]
    async fn consume(&self, params: &ConsumeParams<'_>) -> Result<ConsumerInfo, RcError> {
        self.post(
            &format!("/transports/{}/consumers", params.transport_id),
            params,
        )
        .await
    }

    async fn resume_consumer(&self, consumer_id: &str) -> Result<(), RcError> {
        self.post_empty(&format!("/consumers/{consumer_id}/resume"), &json!({}))
            .await
    }

    async fn close_consumer(&self, consumer_id: &str) -> Result<(), RcError> {
        self.delete(&format!("/consumers/{consumer_id}")).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::media::{default_media_codecs, MediaSource};
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn tag() -> MediaTag {
        MediaTag {
            socket_id: "conn-1".to_string(),
            user_id: "user-1".to_string(),
            source: Some(MediaSource::Camera),
        }
    }

    #[tokio::test]
    async fn test_create_router_posts_codecs() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/routers"))
            .and(body_partial_json(json!({ "mediaCodecs": [{ "mimeType": "audio/opus" }] })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "router-1",
                "rtpCapabilities": { "codecs": [] }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let engine = HttpMediaEngine::new(server.uri()).unwrap();
        let router = engine.create_router(&default_media_codecs()).await.unwrap();

        assert_eq!(router.id, "router-1");
    }

    #[tokio::test]
    async fn test_produce_sends_app_data() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/transports/t-1/producers"))
            .and(body_partial_json(json!({
                "kind": "video",
                "appData": { "socketId": "conn-1", "userId": "user-1", "source": "camera" }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "p-1" })))
            .mount(&server)
            .await;

        let engine = HttpMediaEngine::new(server.uri()).unwrap();
        let id = engine
            .produce("t-1", MediaKind::Video, &json!({ "codecs": [] }), &tag())
            .await
            .unwrap();

        assert_eq!(id, "p-1");
    }

    #[tokio::test]
    async fn test_server_error_maps_to_provider() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/routers/r-1/can-consume"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let engine = HttpMediaEngine::new(server.uri()).unwrap();
        let result = engine.can_consume("r-1", "p-1", &json!({})).await;

        assert!(matches!(result, Err(RcError::Provider(_))));
    }

    #[tokio::test]
    async fn test_close_unknown_producer_is_ok() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/producers/p-gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let engine = HttpMediaEngine::new(server.uri()).unwrap();
        assert!(engine.close_producer("p-gone").await.is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_engine_is_provider_error() {
        // Nothing listens on port 9 (discard) in the test environment
        let engine = HttpMediaEngine::new("http://127.0.0.1:9").unwrap();
        let result = engine.close_router("r-1").await;

        assert!(matches!(result, Err(RcError::Provider(_))));
    }
}
