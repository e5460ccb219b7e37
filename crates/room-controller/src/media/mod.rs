//! Media capability provider adapter.
//!
//! The SFU itself runs out of process. This module defines the id-based
//! contract the room actors use to drive it ([`MediaEngine`]), the closed
//! set of media sources every permission and cleanup rule keys on, and the
//! per-room registry of tagged resources.

pub mod engine;
pub mod http;
pub mod mock;
pub mod registry;

pub use engine::MediaEngine;
pub use registry::MediaRegistry;

use crate::permissions::Capability;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Track kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

/// Semantic origin of a producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MediaSource {
    /// Streamer camera or microphone.
    Camera,
    /// Streamer screen capture.
    Screen,
    /// Streamer screen-capture audio.
    ScreenAudio,
    /// Viewer microphone, requires the audio grant.
    ViewerMic,
    /// Viewer camera, requires the video grant.
    ViewerCamera,
    /// Viewer screen capture, requires the screen-share grant.
    ViewerScreen,
    /// Viewer screen-capture audio, rides on the screen-share grant.
    ViewerScreenAudio,
}

impl MediaSource {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            MediaSource::Camera => "camera",
            MediaSource::Screen => "screen",
            MediaSource::ScreenAudio => "screen-audio",
            MediaSource::ViewerMic => "viewer-mic",
            MediaSource::ViewerCamera => "viewer-camera",
            MediaSource::ViewerScreen => "viewer-screen",
            MediaSource::ViewerScreenAudio => "viewer-screen-audio",
        }
    }

    /// Sources only the streamer seat may publish.
    #[must_use]
    pub const fn is_streamer_source(&self) -> bool {
        match self {
            MediaSource::Camera | MediaSource::Screen | MediaSource::ScreenAudio => true,
            MediaSource::ViewerMic
            | MediaSource::ViewerCamera
            | MediaSource::ViewerScreen
            | MediaSource::ViewerScreenAudio => false,
        }
    }

    /// Grant a viewer needs before publishing this source.
    #[must_use]
    pub const fn required_capability(&self) -> Option<Capability> {
        match self {
            MediaSource::Camera | MediaSource::Screen | MediaSource::ScreenAudio => None,
            MediaSource::ViewerMic => Some(Capability::Audio),
            MediaSource::ViewerCamera => Some(Capability::Video),
            MediaSource::ViewerScreen | MediaSource::ViewerScreenAudio => {
                Some(Capability::ScreenShare)
            }
        }
    }

    /// Whether a producer of this source carries the grant's participant flag.
    ///
    /// Closing a flag-carrying producer revokes the grant; closing a
    /// companion (`viewer-screen-audio`) does not.
    #[must_use]
    pub const fn carries_flag(&self) -> bool {
        matches!(
            self,
            MediaSource::ViewerMic | MediaSource::ViewerCamera | MediaSource::ViewerScreen
        )
    }

    /// Whether a producer of this source may carry `kind`.
    #[must_use]
    pub const fn accepts(&self, kind: MediaKind) -> bool {
        match self {
            MediaSource::Camera => true,
            MediaSource::Screen | MediaSource::ViewerCamera | MediaSource::ViewerScreen => {
                matches!(kind, MediaKind::Video)
            }
            MediaSource::ScreenAudio | MediaSource::ViewerMic | MediaSource::ViewerScreenAudio => {
                matches!(kind, MediaKind::Audio)
            }
        }
    }
}

/// Ownership tag attached to every engine resource.
///
/// Transports carry no source; recording resources use the synthetic
/// connection id [`RECORDING_CONNECTION_ID`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaTag {
    pub socket_id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<MediaSource>,
}

/// Connection id used to tag recording transports and consumers.
pub const RECORDING_CONNECTION_ID: &str = "recording";

/// Transport direction from the client's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    Send,
    Recv,
}

/// Codec entry of the router's media codec list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub kind: MediaKind,
    pub mime_type: String,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub parameters: Value,
}

/// Router codec list: Opus, VP8 and H264 baseline.
#[must_use]
pub fn default_media_codecs() -> Vec<RtpCodecCapability> {
    vec![
        RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            clock_rate: 48000,
            channels: Some(2),
            parameters: Value::Null,
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            clock_rate: 90000,
            channels: None,
            parameters: serde_json::json!({ "x-google-start-bitrate": 1000 }),
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/H264".to_string(),
            clock_rate: 90000,
            channels: None,
            parameters: serde_json::json!({
                "packetization-mode": 1,
                "profile-level-id": "42e01f",
                "level-asymmetry-allowed": 1,
            }),
        },
    ]
}

/// Router created for a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterInfo {
    pub id: String,
    pub rtp_capabilities: Value,
}

/// Network settings for WebRTC transports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebRtcTransportOptions {
    pub listen_ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub announced_ip: Option<String>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
}

/// Client-facing parameters of a WebRTC transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebRtcTransportInfo {
    pub id: String,
    pub ice_parameters: Value,
    pub ice_candidates: Value,
    pub dtls_parameters: Value,
}

/// Network settings for plain RTP transports (recording).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlainTransportOptions {
    pub listen_ip: String,
    pub rtcp_mux: bool,
    pub comedia: bool,
}

/// Local tuple of a plain RTP transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlainTransportInfo {
    pub id: String,
    pub ip: String,
    pub port: u16,
}

/// Consume call parameters.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeParams<'a> {
    pub transport_id: &'a str,
    pub producer_id: &'a str,
    pub rtp_capabilities: &'a Value,
    pub paused: bool,
    pub app_data: &'a MediaTag,
}

/// Consumer created on a transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerInfo {
    pub id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
}

/// First negotiated codec of an RTP parameter set.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecParameters {
    pub mime_type: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    #[serde(default)]
    pub channels: Option<u8>,
    #[serde(default)]
    pub parameters: Value,
}

impl ConsumerInfo {
    /// Negotiated codec, if the engine reported one.
    #[must_use]
    pub fn primary_codec(&self) -> Option<RtpCodecParameters> {
        let first = self.rtp_parameters.get("codecs")?.as_array()?.first()?;
        serde_json::from_value(first.clone()).ok()
    }
}
