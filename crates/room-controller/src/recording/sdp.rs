//! Session descriptions for recording inputs.
//!
//! Each consumed stream is described to the transcoder as a receive-only
//! RTP session on a local port, using the payload type and codec the SFU
//! negotiated for the recording consumer.

use crate::media::{MediaKind, RtpCodecParameters};
use serde_json::Value;
use std::fmt::Write;

/// One RTP stream the transcoder will listen for.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamDescription {
    pub kind: MediaKind,
    pub codec: RtpCodecParameters,
    pub ip: String,
    pub port: u16,
}

impl StreamDescription {
    /// Render as an SDP document.
    #[must_use]
    pub fn render(&self) -> String {
        let pt = self.codec.payload_type;
        let encoding = self
            .codec
            .mime_type
            .split_once('/')
            .map_or(self.codec.mime_type.as_str(), |(_, name)| name);

        let mut sdp = String::new();
        // Writing into a String cannot fail.
        let _ = writeln!(sdp, "v=0");
        let _ = writeln!(sdp, "o=- 0 0 IN IP4 {}", self.ip);
        let _ = writeln!(sdp, "s=classroom-live recording");
        let _ = writeln!(sdp, "c=IN IP4 {}", self.ip);
        let _ = writeln!(sdp, "t=0 0");
        let _ = writeln!(sdp, "m={} {} RTP/AVP {pt}", self.kind.as_str(), self.port);
        match self.codec.channels {
            Some(channels) if channels > 1 => {
                let _ = writeln!(
                    sdp,
                    "a=rtpmap:{pt} {encoding}/{}/{channels}",
                    self.codec.clock_rate
                );
            }
            _ => {
                let _ = writeln!(sdp, "a=rtpmap:{pt} {encoding}/{}", self.codec.clock_rate);
            }
        }
        if let Some(fmtp) = format_parameters(&self.codec.parameters) {
            let _ = writeln!(sdp, "a=fmtp:{pt} {fmtp}");
        }
        let _ = writeln!(sdp, "a=recvonly");
        sdp
    }
}

/// `key=value;key=value` from a codec parameter object, sorted by key.
fn format_parameters(parameters: &Value) -> Option<String> {
    let map = parameters.as_object()?;
    if map.is_empty() {
        return None;
    }
    let mut pairs: Vec<String> = map
        .iter()
        .map(|(key, value)| match value {
            Value::String(s) => format!("{key}={s}"),
            other => format!("{key}={other}"),
        })
        .collect();
    pairs.sort();
    Some(pairs.join(";"))
}
