//! Media engine contract.
//!
//! All calls are id-based so handles never cross the process boundary to
//! the SFU sidecar. Implementations must treat closing an unknown id as a
//! success; the room actors rely on close-if-present semantics.

use super::{
    ConsumeParams, ConsumerInfo, MediaKind, MediaTag, PlainTransportInfo, PlainTransportOptions,
    RouterInfo, RtpCodecCapability, WebRtcTransportInfo, WebRtcTransportOptions,
};
use crate::errors::RcError;
use serde_json::Value;

#[async_trait::async_trait]
pub trait MediaEngine: Send + Sync {
    /// Create a router with the given codec list.
    async fn create_router(&self, codecs: &[RtpCodecCapability]) -> Result<RouterInfo, RcError>;

    /// Close a router and everything created on it.
    async fn close_router(&self, router_id: &str) -> Result<(), RcError>;

    async fn create_webrtc_transport(
        &self,
        router_id: &str,
        options: &WebRtcTransportOptions,
        tag: &MediaTag,
    ) -> Result<WebRtcTransportInfo, RcError>;

    async fn create_plain_transport(
        &self,
        router_id: &str,
        options: &PlainTransportOptions,
        tag: &MediaTag,
    ) -> Result<PlainTransportInfo, RcError>;

    /// Complete the DTLS handshake parameters of a WebRTC transport.
    async fn connect_webrtc_transport(
        &self,
        transport_id: &str,
        dtls_parameters: &Value,
    ) -> Result<(), RcError>;

    /// Point a plain transport at a remote RTP endpoint.
    async fn connect_plain_transport(
        &self,
        transport_id: &str,
        ip: &str,
        port: u16,
    ) -> Result<(), RcError>;

    async fn close_transport(&self, transport_id: &str) -> Result<(), RcError>;

    /// Publish a track; returns the producer id.
    async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: &Value,
        tag: &MediaTag,
    ) -> Result<String, RcError>;

    async fn pause_producer(&self, producer_id: &str) -> Result<(), RcError>;

    async fn resume_producer(&self, producer_id: &str) -> Result<(), RcError>;

    async fn close_producer(&self, producer_id: &str) -> Result<(), RcError>;

    /// Whether a peer with `rtp_capabilities` can receive `producer_id`.
    async fn can_consume(
        &self,
        router_id: &str,
        producer_id: &str,
        rtp_capabilities: &Value,
    ) -> Result<bool, RcError>;

    async fn consume(&self, params: &ConsumeParams<'_>) -> Result<ConsumerInfo, RcError>;

    async fn resume_consumer(&self, consumer_id: &str) -> Result<(), RcError>;

    async fn close_consumer(&self, consumer_id: &str) -> Result<(), RcError>;
}
