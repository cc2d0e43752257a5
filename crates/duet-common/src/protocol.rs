use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};

/// Connection closed on purpose; peers must not reconnect.
pub const CLOSE_NORMAL: u16 = 1000;
/// Server-side eviction (idle, lifetime); a live client reconnects.
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Connection dropped without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;
/// Rejected at upgrade time (bad identity).
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// Relay `error_type` values.
pub mod relay_errors {
    pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
    pub const TARGET_NOT_CONNECTED: &str = "TARGET_NOT_CONNECTED";
    pub const SEND_FAILED: &str = "SEND_FAILED";
    pub const INVALID_MESSAGE: &str = "INVALID_MESSAGE";
}

/// Signaling message kinds exchanged through the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalType {
    Offer,
    Answer,
    IceCandidate,
    CallRequest,
    CallAccepted,
    CallRejected,
    CallEnded,
    Ping,
    Pong,
    Error,
    /// Relay acknowledgement that an offer reached its target.
    OfferSent,
    /// Anything this build does not understand; tolerated and ignored.
    #[serde(other)]
    Unknown,
}

impl SignalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::IceCandidate => "ice-candidate",
            Self::CallRequest => "call-request",
            Self::CallAccepted => "call-accepted",
            Self::CallRejected => "call-rejected",
            Self::CallEnded => "call-ended",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Error => "error",
            Self::OfferSent => "offer-sent",
            Self::Unknown => "unknown",
        }
    }

    /// Heartbeat traffic that is consumed by the channel layer.
    pub fn is_heartbeat(&self) -> bool {
        matches!(self, Self::Ping | Self::Pong)
    }
}

impl std::fmt::Display for SignalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope for everything sent over the signaling relay.
///
/// Clients fill `type`, `target_id` and `payload`; the relay stamps
/// `sender_id` and `timestamp` before forwarding. Relay errors carry
/// `error_type`, `message` and optionally `available_users` at top level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalMessage {
    #[serde(rename = "type")]
    pub kind: SignalType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    #[serde(default, alias = "data", skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_users: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl SignalMessage {
    pub fn new(kind: SignalType) -> Self {
        Self {
            kind,
            sender_id: None,
            target_id: None,
            payload: None,
            timestamp: None,
            error_type: None,
            message: None,
            available_users: None,
            status: None,
        }
    }

    pub fn ping() -> Self {
        Self::new(SignalType::Ping)
    }

    /// Relay-originated error.
    pub fn relay_error(error_type: &str, message: impl Into<String>) -> Self {
        let mut msg = Self::new(SignalType::Error);
        msg.error_type = Some(error_type.to_string());
        msg.message = Some(message.into());
        msg
    }

    pub fn to(mut self, target_id: impl Into<String>) -> Self {
        self.target_id = Some(target_id.into());
        self
    }

    pub fn from_sender(mut self, sender_id: impl Into<String>) -> Self {
        self.sender_id = Some(sender_id.into());
        self
    }

    pub fn with_payload(mut self, payload: Option<Value>) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_timestamp(mut self, timestamp: f64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Decode the payload into a concrete type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        let payload = self
            .payload
            .clone()
            .ok_or_else(|| Error::protocol(format!("{} message without payload", self.kind)))?;
        serde_json::from_value(payload).map_err(Error::from)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(Error::from)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(Error::from)
    }
}

/// Media requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    #[default]
    Audio,
    Video,
}

impl CallType {
    pub fn wants_video(&self) -> bool {
        matches!(self, Self::Video)
    }
}

impl std::fmt::Display for CallType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Audio => f.write_str("audio"),
            Self::Video => f.write_str("video"),
        }
    }
}

impl std::str::FromStr for CallType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "audio" => Ok(Self::Audio),
            "video" => Ok(Self::Video),
            other => Err(Error::protocol(format!("unknown call type {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

impl SdpType {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "offer" => Some(Self::Offer),
            "answer" => Some(Self::Answer),
            "pranswer" => Some(Self::Pranswer),
            "rollback" => Some(Self::Rollback),
            _ => None,
        }
    }
}

/// Offer/answer payload: `{type, sdp, callType?}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub sdp_type: Option<SdpType>,
    pub sdp: String,
    #[serde(rename = "callType", default, skip_serializing_if = "Option::is_none")]
    pub call_type: Option<CallType>,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: Some(SdpType::Offer),
            sdp: sdp.into(),
            call_type: None,
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: Some(SdpType::Answer),
            sdp: sdp.into(),
            call_type: None,
        }
    }

    pub fn with_call_type(mut self, call_type: CallType) -> Self {
        self.call_type = Some(call_type);
        self
    }

    /// Parse a signaling payload leniently and normalize its type.
    ///
    /// Peers and browser libraries have been seen emitting descriptions with a
    /// missing, null, empty or unrecognized `type`, and occasionally the whole
    /// description JSON-encoded inside a string. The type is inferred from the
    /// message kind it arrived in. An explicit type that contradicts the
    /// expected one, or an empty SDP body, is rejected.
    pub fn from_payload(payload: &Value, expected: SdpType) -> Result<Self> {
        let decoded;
        let object = match payload {
            Value::String(raw) => {
                decoded = serde_json::from_str::<Value>(raw)
                    .map_err(|e| Error::protocol(format!("undecodable description: {e}")))?;
                &decoded
            }
            other => other,
        };

        let sdp = object
            .get("sdp")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::protocol("session description without sdp"))?;
        if sdp.trim().is_empty() {
            return Err(Error::protocol("session description with empty sdp"));
        }

        let sdp_type = object
            .get("type")
            .and_then(Value::as_str)
            .and_then(SdpType::parse);
        let call_type = object
            .get("callType")
            .and_then(Value::as_str)
            .and_then(|raw| raw.parse().ok());

        Self {
            sdp_type,
            sdp,
            call_type,
        }
        .normalized(expected)
    }

    /// Fill in a missing type, reject a contradicting one.
    pub fn normalized(mut self, expected: SdpType) -> Result<Self> {
        match self.sdp_type {
            None => {
                debug!("inferring missing description type as {:?}", expected);
                self.sdp_type = Some(expected);
                Ok(self)
            }
            Some(actual) if actual == expected => Ok(self),
            Some(actual) => Err(Error::protocol(format!(
                "expected {expected:?} description, got {actual:?}"
            ))),
        }
    }

    pub fn to_payload(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Native ICE candidate descriptor as browsers serialize it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    /// The ICE username fragment this candidate belongs to, if known.
    pub fn ufrag(&self) -> Option<&str> {
        if let Some(ufrag) = self.username_fragment.as_deref() {
            return Some(ufrag);
        }
        let mut parts = self.candidate.split_whitespace();
        while let Some(part) = parts.next() {
            if part == "ufrag" {
                return parts.next();
            }
        }
        None
    }

    pub fn to_payload(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Extract `a=ice-ufrag:` from an SDP body.
pub fn sdp_ice_ufrag(sdp: &str) -> Option<&str> {
    sdp.lines()
        .find_map(|line| line.trim().strip_prefix("a=ice-ufrag:"))
        .map(str::trim)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_signal_type_wire_names() {
        let msg = SignalMessage::new(SignalType::IceCandidate).to("bob");
        let text = msg.to_json().expect("encode");
        assert_eq!(text, r#"{"type":"ice-candidate","target_id":"bob"}"#);
    }

    #[test]
    fn test_unknown_type_is_tolerated() {
        let msg = SignalMessage::from_json(r#"{"type":"call-sent","target_id":"x"}"#)
            .expect("decode");
        assert_eq!(msg.kind, SignalType::Unknown);
    }

    #[test]
    fn test_relay_error_fields_decode() {
        let msg = SignalMessage::from_json(
            r#"{"type":"error","error_type":"TARGET_NOT_CONNECTED","message":"offline","target_id":"bob","available_users":["carol"],"timestamp":1.5}"#,
        )
        .expect("decode");
        assert_eq!(msg.kind, SignalType::Error);
        assert_eq!(
            msg.error_type.as_deref(),
            Some(relay_errors::TARGET_NOT_CONNECTED)
        );
        assert_eq!(msg.available_users, Some(vec!["carol".to_string()]));
    }

    #[test]
    fn test_legacy_data_key_is_payload() {
        let msg =
            SignalMessage::from_json(r#"{"type":"offer","target_id":"b","data":{"sdp":"v=0"}}"#)
                .expect("decode");
        assert_eq!(msg.payload, Some(json!({"sdp": "v=0"})));
    }

    #[test]
    fn test_description_missing_type_is_inferred() {
        let desc = SessionDescription::from_payload(
            &json!({"sdp": "v=0", "callType": "video"}),
            SdpType::Answer,
        )
        .expect("normalize");
        assert_eq!(desc.sdp_type, Some(SdpType::Answer));
        assert_eq!(desc.call_type, Some(CallType::Video));
    }

    #[test]
    fn test_description_null_and_garbage_type_are_inferred() {
        for payload in [
            json!({"type": null, "sdp": "v=0"}),
            json!({"type": "", "sdp": "v=0"}),
            json!({"type": "Offer ", "sdp": "v=0"}),
        ] {
            let desc =
                SessionDescription::from_payload(&payload, SdpType::Offer).expect("normalize");
            assert_eq!(desc.sdp_type, Some(SdpType::Offer));
        }
    }

    #[test]
    fn test_description_string_encoded_payload() {
        let payload = Value::String(r#"{"type":"offer","sdp":"v=0"}"#.to_string());
        let desc = SessionDescription::from_payload(&payload, SdpType::Offer).expect("decode");
        assert_eq!(desc.sdp, "v=0");
    }

    #[test]
    fn test_description_mismatched_type_rejected() {
        let err = SessionDescription::from_payload(
            &json!({"type": "answer", "sdp": "v=0"}),
            SdpType::Offer,
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_description_empty_sdp_rejected() {
        assert!(SessionDescription::from_payload(&json!({"sdp": "  "}), SdpType::Offer).is_err());
        assert!(SessionDescription::from_payload(&json!({}), SdpType::Offer).is_err());
    }

    #[test]
    fn test_ice_candidate_browser_shape() {
        let payload = json!({
            "candidate": "candidate:1 1 udp 2122260223 10.0.0.2 51000 typ host",
            "sdpMid": "0",
            "sdpMLineIndex": 0
        });
        let candidate: IceCandidate = serde_json::from_value(payload.clone()).expect("decode");
        assert_eq!(candidate.sdp_mline_index, Some(0));
        assert_eq!(candidate.to_payload(), payload);
    }

    #[test]
    fn test_ice_candidate_ufrag_sources() {
        let mut candidate = IceCandidate::new("candidate:1 1 udp 1 10.0.0.2 5 typ host ufrag abcd");
        assert_eq!(candidate.ufrag(), Some("abcd"));
        candidate.username_fragment = Some("wxyz".into());
        assert_eq!(candidate.ufrag(), Some("wxyz"));
        assert_eq!(IceCandidate::new("candidate:1 1 udp").ufrag(), None);
    }

    #[test]
    fn test_sdp_ice_ufrag() {
        let sdp = "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=ice-ufrag:F7gI\r\na=ice-pwd:x\r\n";
        assert_eq!(sdp_ice_ufrag(sdp), Some("F7gI"));
        assert_eq!(sdp_ice_ufrag("v=0"), None);
    }
}
