use anyhow::{anyhow, Result};
use serde::Deserialize;

use crate::api::Violation;

/// Server frame: `{type, data?, message?, timestamp?}`.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Option<serde_json::Value>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
}

/// A violation pushed over the notification socket.
#[derive(Clone, Debug, PartialEq)]
pub struct ViolationEvent {
    pub violation: Violation,
    pub message: Option<String>,
    pub timestamp: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ChannelMessage {
    /// Handshake acknowledgement.
    Connected { message: Option<String> },
    Violation(ViolationEvent),
    Keepalive,
    Pong,
    /// Any other `type`; logged and ignored.
    Unrecognized(String),
}

impl ChannelMessage {
    pub fn parse(text: &str) -> Result<Self> {
        let envelope: Envelope =
            serde_json::from_str(text).map_err(|e| anyhow!("invalid channel frame: {}", e))?;
        match envelope.kind.as_str() {
            "connected" => Ok(ChannelMessage::Connected {
                message: envelope.message,
            }),
            "violation" => {
                let data = envelope
                    .data
                    .ok_or_else(|| anyhow!("violation frame without data"))?;
                let mut violation: Violation = serde_json::from_value(data)
                    .map_err(|e| anyhow!("invalid violation payload: {}", e))?;
                if violation.timestamp.is_none() {
                    violation.timestamp = envelope.timestamp.clone();
                }
                Ok(ChannelMessage::Violation(ViolationEvent {
                    violation,
                    message: envelope.message,
                    timestamp: envelope.timestamp,
                }))
            }
            "keepalive" | "ping" => Ok(ChannelMessage::Keepalive),
            "pong" => Ok(ChannelMessage::Pong),
            other => Ok(ChannelMessage::Unrecognized(other.to_string())),
        }
    }
}

/// Client heartbeat frame; the server answers with `pong`.
pub fn ping_frame() -> String {
    serde_json::json!({ "type": "ping" }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Severity;

    #[test]
    fn parses_message_taxonomy() {
        assert_eq!(
            ChannelMessage::parse(r#"{"type":"connected","message":"hello"}"#).unwrap(),
            ChannelMessage::Connected {
                message: Some("hello".into())
            }
        );
        assert_eq!(
            ChannelMessage::parse(r#"{"type":"keepalive"}"#).unwrap(),
            ChannelMessage::Keepalive
        );
        assert_eq!(
            ChannelMessage::parse(r#"{"type":"pong"}"#).unwrap(),
            ChannelMessage::Pong
        );
        assert_eq!(
            ChannelMessage::parse(r#"{"type":"camera_offline","data":{}}"#).unwrap(),
            ChannelMessage::Unrecognized("camera_offline".into())
        );
    }

    #[test]
    fn violation_takes_envelope_timestamp_when_missing() {
        let frame = r#"{"type":"violation","timestamp":"2024-06-01T12:00:00Z",
            "data":{"id":77,"severity":"critical","camera_name":"Dock 2","violation_type":"no_hardhat"}}"#;
        let ChannelMessage::Violation(event) = ChannelMessage::parse(frame).unwrap() else {
            panic!("expected violation");
        };
        assert_eq!(event.violation.id, "77");
        assert_eq!(event.violation.severity, Severity::Critical);
        assert_eq!(
            event.violation.timestamp.as_deref(),
            Some("2024-06-01T12:00:00Z")
        );
    }

    #[test]
    fn violation_with_created_at_and_timestamp_is_delivered() {
        let frame = r#"{"type":"violation","data":{"id":9,"severity":"high",
            "timestamp":"2024-06-01T12:00:00Z","created_at":"2024-06-01T12:00:00Z"}}"#;
        let ChannelMessage::Violation(event) = ChannelMessage::parse(frame).unwrap() else {
            panic!("expected violation");
        };
        assert_eq!(event.violation.id, "9");
        assert!(event.violation.occurred_at().is_some());
    }

    #[test]
    fn malformed_frames_are_errors() {
        assert!(ChannelMessage::parse("not json").is_err());
        assert!(ChannelMessage::parse(r#"{"data":{}}"#).is_err());
        assert!(ChannelMessage::parse(r#"{"type":"violation"}"#).is_err());
        assert!(ChannelMessage::parse(r#"{"type":"violation","data":{"severity":"low"}}"#).is_err());
    }

    #[test]
    fn ping_frame_is_typed() {
        assert_eq!(ping_frame(), r#"{"type":"ping"}"#);
    }
}
