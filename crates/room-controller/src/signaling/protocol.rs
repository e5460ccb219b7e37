//! Signaling wire protocol.
//!
//! Every frame in either direction is a JSON object
//! `{"event": <name>, "data": {...}, "requestId"?: <string>}`. Inbound frames
//! are parsed in two steps: the envelope ([`RawFrame`]) and then the typed
//! payload for the named event ([`ClientMessage::from_frame`]). Outbound
//! events ([`ServerEvent`]) serialize adjacently tagged and get the
//! request id spliced in by [`OutboundFrame::to_json`].

use crate::collaborators::RecordingArtifact;
use crate::errors::{ErrorKind, RcError};
use crate::media::{
    MediaKind, MediaSource, TransportDirection, WebRtcTransportInfo,
};
use crate::permissions::{Capability, PermissionState};
use crate::whiteboard::WhiteboardOp;
use chrono::{DateTime, Utc};
use common::types::SessionStatus;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Inbound envelope.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawFrame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub request_id: Option<String>,
}

impl RawFrame {
    /// Parse a text frame.
    ///
    /// # Errors
    ///
    /// `Validation` if the text is not a JSON envelope.
    pub fn parse(text: &str) -> Result<Self, RcError> {
        serde_json::from_str(text)
            .map_err(|e| RcError::Validation(format!("Malformed frame: {e}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomRequest {
    pub token: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub room_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceRequest {
    pub transport_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
    pub app_data: ProduceAppData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ProduceAppData {
    pub source: MediaSource,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeRequest {
    pub transport_id: String,
    pub producer_id: String,
    pub rtp_capabilities: Value,
}

/// Element body of a draw op as sent by clients; the user id is added
/// server-side.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrawOp {
    pub element_id: String,
    pub element: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EraseOp {
    pub element_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateTransportData {
    #[serde(default)]
    direction: Option<TransportDirection>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectTransportData {
    transport_id: String,
    dtls_parameters: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProducerIdData {
    producer_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConsumerIdData {
    consumer_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PermissionResponseData {
    user_id: String,
    allow: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PermissionRevokeData {
    user_id: String,
    capability: Capability,
}

#[derive(Debug, Deserialize)]
struct DrawData {
    op: DrawOp,
}

#[derive(Debug, Deserialize)]
struct EraseData {
    op: EraseOp,
}

#[derive(Debug, Deserialize)]
struct ChatData {
    text: String,
}

/// Typed inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    JoinRoom(JoinRoomRequest),
    LeaveRoom,
    StreamerStart,
    StreamerPause,
    StreamerResume,
    StreamerEnd,
    GetRouterRtpCapabilities,
    CreateTransport {
        direction: TransportDirection,
    },
    ConnectTransport {
        transport_id: String,
        dtls_parameters: Value,
    },
    Produce(ProduceRequest),
    Consume(ConsumeRequest),
    ConsumerResume {
        consumer_id: String,
    },
    ProducerPause {
        producer_id: String,
    },
    ProducerResume {
        producer_id: String,
    },
    ProducerClose {
        producer_id: String,
    },
    PermissionRequest(Capability),
    PermissionResponse {
        capability: Capability,
        user_id: String,
        allow: bool,
    },
    PermissionRevoke {
        user_id: String,
        capability: Capability,
    },
    RecordingStart,
    RecordingStop,
    WhiteboardDraw(DrawOp),
    WhiteboardErase(EraseOp),
    WhiteboardUndo,
    WhiteboardRedo,
    WhiteboardSave,
    ChatMessage {
        text: String,
    },
    Ping,
}

fn payload<T: DeserializeOwned>(event: &str, data: Value) -> Result<T, RcError> {
    // Unit payloads may arrive as `null`; treat that as an empty object.
    let data = if data.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        data
    };
    serde_json::from_value(data)
        .map_err(|e| RcError::Validation(format!("Invalid {event} payload: {e}")))
}

impl ClientMessage {
    /// Decode the payload of `frame`.
    ///
    /// # Errors
    ///
    /// `Validation` for unknown events and malformed payloads.
    pub fn from_frame(frame: RawFrame) -> Result<Self, RcError> {
        let RawFrame { event, data, .. } = frame;
        let message = match event.as_str() {
            "join_room" => ClientMessage::JoinRoom(payload(&event, data)?),
            "leave_room" => ClientMessage::LeaveRoom,
            "streamer_start" => ClientMessage::StreamerStart,
            "streamer_pause" => ClientMessage::StreamerPause,
            "streamer_resume" => ClientMessage::StreamerResume,
            "streamer_end" => ClientMessage::StreamerEnd,
            "get-router-rtp-capabilities" => ClientMessage::GetRouterRtpCapabilities,
            "create-transport" => {
                let d: CreateTransportData = payload(&event, data)?;
                ClientMessage::CreateTransport {
                    direction: d.direction.unwrap_or(TransportDirection::Send),
                }
            }
            "transport-connect" => {
                let d: ConnectTransportData = payload(&event, data)?;
                ClientMessage::ConnectTransport {
                    transport_id: d.transport_id,
                    dtls_parameters: d.dtls_parameters,
                }
            }
            "transport-produce" => ClientMessage::Produce(payload(&event, data)?),
            "consume" => ClientMessage::Consume(payload(&event, data)?),
            "consumer-resume" => {
                let d: ConsumerIdData = payload(&event, data)?;
                ClientMessage::ConsumerResume {
                    consumer_id: d.consumer_id,
                }
            }
            "producer-pause" | "producer-resume" | "producer-close" => {
                let d: ProducerIdData = payload(&event, data)?;
                let producer_id = d.producer_id;
                match event.as_str() {
                    "producer-pause" => ClientMessage::ProducerPause { producer_id },
                    "producer-resume" => ClientMessage::ProducerResume { producer_id },
                    _ => ClientMessage::ProducerClose { producer_id },
                }
            }
            "viewer-audio-request" => ClientMessage::PermissionRequest(Capability::Audio),
            "viewer-video-request" => ClientMessage::PermissionRequest(Capability::Video),
            "screen-share-request" => ClientMessage::PermissionRequest(Capability::ScreenShare),
            "viewer-audio-response" | "viewer-video-response" | "screen-share-response" => {
                let d: PermissionResponseData = payload(&event, data)?;
                let capability = match event.as_str() {
                    "viewer-audio-response" => Capability::Audio,
                    "viewer-video-response" => Capability::Video,
                    _ => Capability::ScreenShare,
                };
                ClientMessage::PermissionResponse {
                    capability,
                    user_id: d.user_id,
                    allow: d.allow,
                }
            }
            "permission-revoke" => {
                let d: PermissionRevokeData = payload(&event, data)?;
                ClientMessage::PermissionRevoke {
                    user_id: d.user_id,
                    capability: d.capability,
                }
            }
            "recording-start" => ClientMessage::RecordingStart,
            "recording-stop" => ClientMessage::RecordingStop,
            "whiteboard_draw" => {
                let d: DrawData = payload(&event, data)?;
                ClientMessage::WhiteboardDraw(d.op)
            }
            "whiteboard_erase" => {
                let d: EraseData = payload(&event, data)?;
                ClientMessage::WhiteboardErase(d.op)
            }
            "whiteboard_undo" => ClientMessage::WhiteboardUndo,
            "whiteboard_redo" => ClientMessage::WhiteboardRedo,
            "whiteboard_save" => ClientMessage::WhiteboardSave,
            "chat_message" => {
                let d: ChatData = payload(&event, data)?;
                ClientMessage::ChatMessage { text: d.text }
            }
            "ping" => ClientMessage::Ping,
            other => {
                return Err(RcError::Validation(format!("Unknown event: {other}")));
            }
        };
        Ok(message)
    }

    /// Bounded label for metrics and logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            ClientMessage::JoinRoom(_) => "join_room",
            ClientMessage::LeaveRoom => "leave_room",
            ClientMessage::StreamerStart => "streamer_start",
            ClientMessage::StreamerPause => "streamer_pause",
            ClientMessage::StreamerResume => "streamer_resume",
            ClientMessage::StreamerEnd => "streamer_end",
            ClientMessage::GetRouterRtpCapabilities => "get_router_rtp_capabilities",
            ClientMessage::CreateTransport { .. } => "create_transport",
            ClientMessage::ConnectTransport { .. } => "transport_connect",
            ClientMessage::Produce(_) => "transport_produce",
            ClientMessage::Consume(_) => "consume",
            ClientMessage::ConsumerResume { .. } => "consumer_resume",
            ClientMessage::ProducerPause { .. } => "producer_pause",
            ClientMessage::ProducerResume { .. } => "producer_resume",
            ClientMessage::ProducerClose { .. } => "producer_close",
            ClientMessage::PermissionRequest(_) => "permission_request",
            ClientMessage::PermissionResponse { .. } => "permission_response",
            ClientMessage::PermissionRevoke { .. } => "permission_revoke",
            ClientMessage::RecordingStart => "recording_start",
            ClientMessage::RecordingStop => "recording_stop",
            ClientMessage::WhiteboardDraw(_) => "whiteboard_draw",
            ClientMessage::WhiteboardErase(_) => "whiteboard_erase",
            ClientMessage::WhiteboardUndo => "whiteboard_undo",
            ClientMessage::WhiteboardRedo => "whiteboard_redo",
            ClientMessage::WhiteboardSave => "whiteboard_save",
            ClientMessage::ChatMessage { .. } => "chat_message",
            ClientMessage::Ping => "ping",
        }
    }
}

/// Role of a participant inside a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParticipantRole {
    Streamer,
    Viewer,
}

/// Participant entry of snapshots and presence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantView {
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub role: ParticipantRole,
    pub connected: bool,
    pub has_audio: bool,
    pub has_video: bool,
    pub is_screen_sharing: bool,
    /// Upgrade negotiations in progress or settled; idle ones are omitted.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub permissions: BTreeMap<Capability, PermissionState>,
}

/// Partial flag update (`participant_updated`). Absent fields are unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantDelta {
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_audio: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_video: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_screen_sharing: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerView {
    pub producer_id: String,
    pub user_id: String,
    pub kind: MediaKind,
    pub source: MediaSource,
    pub paused: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WhiteboardView {
    pub whiteboard_id: String,
    pub canvas: Value,
    pub version: u64,
    /// Relayed ops not yet folded into `canvas`.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub pending: Vec<WhiteboardOp>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinedRoomPayload {
    pub session_id: String,
    pub user_id: String,
    pub role: ParticipantRole,
    pub status: SessionStatus,
    pub participants: Vec<ParticipantView>,
    pub producers: Vec<ProducerView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub router_rtp_capabilities: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub whiteboard: Option<WhiteboardView>,
    pub recording: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportCreatedPayload {
    #[serde(flatten)]
    pub transport: WebRtcTransportInfo,
    pub direction: TransportDirection,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumedPayload {
    pub consumer_id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
    pub source: MediaSource,
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingStoppedPayload {
    pub artifact: RecordingArtifact,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub code: i32,
    pub kind: ErrorKind,
    pub message: String,
}

/// Outbound event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "joined_room")]
    JoinedRoom(Box<JoinedRoomPayload>),
    #[serde(rename = "participant_joined")]
    ParticipantJoined(ParticipantView),
    #[serde(rename = "participant_left", rename_all = "camelCase")]
    ParticipantLeft { user_id: String },
    #[serde(rename = "participant_updated")]
    ParticipantUpdated(ParticipantDelta),
    #[serde(rename = "participants_list_updated")]
    ParticipantsListUpdated { participants: Vec<ParticipantView> },
    #[serde(rename = "router-ready", rename_all = "camelCase")]
    RouterReady { rtp_capabilities: Value },
    #[serde(rename = "router-rtp-capabilities", rename_all = "camelCase")]
    RouterRtpCapabilities { rtp_capabilities: Value },
    #[serde(rename = "transport-created")]
    TransportCreated(TransportCreatedPayload),
    #[serde(rename = "transport-connected", rename_all = "camelCase")]
    TransportConnected { transport_id: String },
    #[serde(rename = "produced", rename_all = "camelCase")]
    Produced { producer_id: String },
    #[serde(rename = "new-producer")]
    NewProducer(ProducerView),
    #[serde(rename = "producer-closed", rename_all = "camelCase")]
    ProducerClosed { producer_id: String },
    #[serde(rename = "producer-paused", rename_all = "camelCase")]
    ProducerPaused { producer_id: String },
    #[serde(rename = "producer-resumed", rename_all = "camelCase")]
    ProducerResumed { producer_id: String },
    #[serde(rename = "consumed")]
    Consumed(ConsumedPayload),
    #[serde(rename = "consumer-resumed", rename_all = "camelCase")]
    ConsumerResumed { consumer_id: String },
    #[serde(rename = "viewer-audio-request", rename_all = "camelCase")]
    ViewerAudioRequest {
        user_id: String,
        display_name: Option<String>,
    },
    #[serde(rename = "viewer-video-request", rename_all = "camelCase")]
    ViewerVideoRequest {
        user_id: String,
        display_name: Option<String>,
    },
    #[serde(rename = "screen-share-request", rename_all = "camelCase")]
    ScreenShareRequest {
        user_id: String,
        display_name: Option<String>,
    },
    #[serde(rename = "viewer-audio-permission-granted")]
    ViewerAudioPermissionGranted,
    #[serde(rename = "viewer-audio-permission-denied")]
    ViewerAudioPermissionDenied,
    #[serde(rename = "viewer-video-permission-granted")]
    ViewerVideoPermissionGranted,
    #[serde(rename = "viewer-video-permission-denied")]
    ViewerVideoPermissionDenied,
    #[serde(rename = "screen-share-permission-granted")]
    ScreenSharePermissionGranted,
    #[serde(rename = "screen-share-permission-denied")]
    ScreenSharePermissionDenied,
    #[serde(rename = "permission-revoked")]
    PermissionRevoked { capability: Capability },
    #[serde(rename = "screen-share-started", rename_all = "camelCase")]
    ScreenShareStarted { user_id: String, producer_id: String },
    #[serde(rename = "screen-share-stopped-by-viewer", rename_all = "camelCase")]
    ScreenShareStoppedByViewer { user_id: String },
    #[serde(rename = "session_started")]
    SessionStarted { status: SessionStatus },
    #[serde(rename = "session_paused_or_ended_by_streamer")]
    SessionPausedOrEndedByStreamer { status: SessionStatus },
    #[serde(rename = "streamer_left")]
    StreamerLeft,
    #[serde(rename = "recording_started", rename_all = "camelCase")]
    RecordingStarted { started_at: DateTime<Utc> },
    #[serde(rename = "recording_stopped")]
    RecordingStopped(RecordingStoppedPayload),
    #[serde(rename = "whiteboard_draw")]
    WhiteboardDraw { op: WhiteboardOp },
    #[serde(rename = "whiteboard_erase")]
    WhiteboardErase { op: WhiteboardOp },
    #[serde(rename = "whiteboard_undo")]
    WhiteboardUndo(WhiteboardView),
    #[serde(rename = "whiteboard_redo")]
    WhiteboardRedo(WhiteboardView),
    #[serde(rename = "whiteboard_saved")]
    WhiteboardSaved { version: u64 },
    #[serde(rename = "chat_message", rename_all = "camelCase")]
    ChatMessage {
        user_id: String,
        display_name: Option<String>,
        text: String,
        sent_at: DateTime<Utc>,
    },
    #[serde(rename = "evicted")]
    Evicted { reason: String },
    #[serde(rename = "external")]
    External { name: String, payload: Value },
    #[serde(rename = "ack")]
    Ack { action: &'static str },
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "error_message")]
    Error(ErrorPayload),
}

impl ServerEvent {
    /// Client-safe error event for `err`.
    #[must_use]
    pub fn error(err: &RcError) -> Self {
        ServerEvent::Error(ErrorPayload {
            code: err.error_code(),
            kind: err.kind(),
            message: err.client_message(),
        })
    }

    /// Request notice the streamer receives for `capability`.
    #[must_use]
    pub fn permission_request(
        capability: Capability,
        user_id: String,
        display_name: Option<String>,
    ) -> Self {
        match capability {
            Capability::Audio => ServerEvent::ViewerAudioRequest {
                user_id,
                display_name,
            },
            Capability::Video => ServerEvent::ViewerVideoRequest {
                user_id,
                display_name,
            },
            Capability::ScreenShare => ServerEvent::ScreenShareRequest {
                user_id,
                display_name,
            },
        }
    }

    /// Decision notice the requesting viewer receives.
    #[must_use]
    pub const fn permission_decision(capability: Capability, granted: bool) -> Self {
        match (capability, granted) {
            (Capability::Audio, true) => ServerEvent::ViewerAudioPermissionGranted,
            (Capability::Audio, false) => ServerEvent::ViewerAudioPermissionDenied,
            (Capability::Video, true) => ServerEvent::ViewerVideoPermissionGranted,
            (Capability::Video, false) => ServerEvent::ViewerVideoPermissionDenied,
            (Capability::ScreenShare, true) => ServerEvent::ScreenSharePermissionGranted,
            (Capability::ScreenShare, false) => ServerEvent::ScreenSharePermissionDenied,
        }
    }

    /// Whether this event is an [`ServerEvent::Evicted`] notice.
    #[must_use]
    pub const fn is_eviction(&self) -> bool {
        matches!(self, ServerEvent::Evicted { .. })
    }
}

/// Event plus the request id it answers, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundFrame {
    pub event: ServerEvent,
    pub request_id: Option<String>,
}

impl OutboundFrame {
    /// Unsolicited push.
    #[must_use]
    pub fn push(event: ServerEvent) -> Self {
        Self {
            event,
            request_id: None,
        }
    }

    /// Direct reply to `request_id`.
    #[must_use]
    pub fn reply(event: ServerEvent, request_id: Option<String>) -> Self {
        Self { event, request_id }
    }

    /// Serialize to the wire envelope.
    ///
    /// # Errors
    ///
    /// `Internal` if the event cannot be serialized.
    pub fn to_json(&self) -> Result<String, RcError> {
        let mut value = serde_json::to_value(&self.event)
            .map_err(|e| RcError::Internal(format!("serialize event: {e}")))?;
        if let (Some(request_id), Value::Object(map)) = (&self.request_id, &mut value) {
            map.insert("requestId".to_string(), Value::String(request_id.clone()));
        }
        serde_json::to_string(&value)
            .map_err(|e| RcError::Internal(format!("serialize frame: {e}")))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(text: &str) -> Result<ClientMessage, RcError> {
        ClientMessage::from_frame(RawFrame::parse(text)?)
    }

    #[test]
    fn test_parse_join_room() {
        let message =
            parse(r#"{"event":"join_room","data":{"token":"t","roomCode":"ABC"},"requestId":"r1"}"#)
                .unwrap();
        assert_eq!(
            message,
            ClientMessage::JoinRoom(JoinRoomRequest {
                token: "t".to_string(),
                session_id: None,
                room_code: Some("ABC".to_string()),
            })
        );
    }

    #[test]
    fn test_parse_unit_event_without_data() {
        assert_eq!(parse(r#"{"event":"ping"}"#).unwrap(), ClientMessage::Ping);
        assert_eq!(
            parse(r#"{"event":"whiteboard_undo","data":{}}"#).unwrap(),
            ClientMessage::WhiteboardUndo
        );
    }

    #[test]
    fn test_parse_produce_with_source() {
        let message = parse(
            r#"{"event":"transport-produce","data":{"transportId":"t-1","kind":"audio",
                "rtpParameters":{"codecs":[]},"appData":{"source":"viewer-mic"}}}"#,
        )
        .unwrap();

        assert!(matches!(
            message,
            ClientMessage::Produce(ProduceRequest {
                kind: MediaKind::Audio,
                app_data: ProduceAppData {
                    source: MediaSource::ViewerMic
                },
                ..
            })
        ));
    }

    #[test]
    fn test_parse_rejects_unknown_source() {
        let result = parse(
            r#"{"event":"transport-produce","data":{"transportId":"t-1","kind":"audio",
                "rtpParameters":{},"appData":{"source":"webcam"}}}"#,
        );
        assert!(matches!(result, Err(RcError::Validation(_))));
    }

    #[test]
    fn test_parse_permission_response_maps_capability() {
        let message =
            parse(r#"{"event":"screen-share-response","data":{"userId":"v1","allow":false}}"#)
                .unwrap();
        assert_eq!(
            message,
            ClientMessage::PermissionResponse {
                capability: Capability::ScreenShare,
                user_id: "v1".to_string(),
                allow: false,
            }
        );
    }

    #[test]
    fn test_parse_create_transport_defaults_to_send() {
        assert_eq!(
            parse(r#"{"event":"create-transport"}"#).unwrap(),
            ClientMessage::CreateTransport {
                direction: TransportDirection::Send
            }
        );
    }

    #[test]
    fn test_parse_unknown_event() {
        let err = parse(r#"{"event":"teleport","data":{}}"#).unwrap_err();
        assert_eq!(err.error_code(), 8);
    }

    #[test]
    fn test_parse_malformed_json() {
        assert!(matches!(
            RawFrame::parse("{not json"),
            Err(RcError::Validation(_))
        ));
    }

    #[test]
    fn test_reply_carries_request_id() {
        let frame = OutboundFrame::reply(
            ServerEvent::Produced {
                producer_id: "p-1".to_string(),
            },
            Some("r-7".to_string()),
        );
        let value: Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({ "event": "produced", "data": { "producerId": "p-1" }, "requestId": "r-7" })
        );
    }

    #[test]
    fn test_unit_event_serializes_without_data() {
        let frame = OutboundFrame::push(ServerEvent::ViewerAudioPermissionGranted);
        let value: Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();
        assert_eq!(value, json!({ "event": "viewer-audio-permission-granted" }));
    }

    #[test]
    fn test_error_event_hides_details() {
        let event = ServerEvent::error(&RcError::Provider("http://10.0.0.1 refused".to_string()));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "error_message");
        assert_eq!(value["data"]["code"], 9);
        assert_eq!(value["data"]["kind"], "provider");
        assert_eq!(value["data"]["message"], "Media operation failed");
    }

    #[test]
    fn test_delta_omits_unchanged_flags() {
        let event = ServerEvent::ParticipantUpdated(ParticipantDelta {
            user_id: "v1".to_string(),
            has_video: Some(true),
            ..ParticipantDelta::default()
        });
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({ "event": "participant_updated", "data": { "userId": "v1", "hasVideo": true } })
        );
    }
}
