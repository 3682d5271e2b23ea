//! Signaling message model.
//!
//! When adding a message type, keep the `type` tag unique across the whole
//! enum; the client dispatches on it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;

/// An SDP blob plus its kind (`offer`/`answer`), as the browser emits it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// An ICE candidate as carried in signaling. The `candidate` line keeps the
/// browser's raw format; an empty line means end-of-candidates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidateInit {
    pub candidate: String,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    Offer {
        timestamp: DateTime<Utc>,
        sdp: SessionDescription,
    },
    Answer {
        timestamp: DateTime<Utc>,
        sdp: SessionDescription,
    },
    IceCandidate {
        timestamp: DateTime<Utc>,
        candidate: IceCandidateInit,
    },
    Transcription {
        timestamp: DateTime<Utc>,
        text: String,
    },
    AiResult {
        timestamp: DateTime<Utc>,
        text: String,
    },
    Catchup {
        timestamp: DateTime<Utc>,
        transcript: String,
        insights: Vec<String>,
    },
    ProjectMetadata {
        timestamp: DateTime<Utc>,
        project_id: String,
        project_name: String,
    },
    Ping {
        timestamp: DateTime<Utc>,
    },
    Pong {
        timestamp: DateTime<Utc>,
    },
    DismissAiAnalysis {
        timestamp: DateTime<Utc>,
        analysis_id: String,
    },
    Error {
        timestamp: DateTime<Utc>,
        error_code: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
}

impl WireMessage {
    pub fn answer(sdp: SessionDescription) -> Self {
        Self::Answer {
            timestamp: Utc::now(),
            sdp,
        }
    }

    pub fn ice_candidate(candidate: IceCandidateInit) -> Self {
        Self::IceCandidate {
            timestamp: Utc::now(),
            candidate,
        }
    }

    pub fn transcription(text: impl Into<String>) -> Self {
        Self::Transcription {
            timestamp: Utc::now(),
            text: text.into(),
        }
    }

    pub fn ai_result(text: impl Into<String>) -> Self {
        Self::AiResult {
            timestamp: Utc::now(),
            text: text.into(),
        }
    }

    pub fn catchup(transcript: impl Into<String>, insights: Vec<String>) -> Self {
        Self::Catchup {
            timestamp: Utc::now(),
            transcript: transcript.into(),
            insights,
        }
    }

    pub fn project_metadata(project_id: impl Into<String>, project_name: impl Into<String>) -> Self {
        Self::ProjectMetadata {
            timestamp: Utc::now(),
            project_id: project_id.into(),
            project_name: project_name.into(),
        }
    }

    pub fn pong() -> Self {
        Self::Pong {
            timestamp: Utc::now(),
        }
    }

    pub fn error(
        error_code: impl Into<String>,
        message: impl Into<String>,
        session_id: Option<String>,
    ) -> Self {
        Self::Error {
            timestamp: Utc::now(),
            error_code: error_code.into(),
            message: message.into(),
            session_id,
        }
    }

    /// The wire value of the `type` discriminator, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice_candidate",
            Self::Transcription { .. } => "transcription",
            Self::AiResult { .. } => "ai_result",
            Self::Catchup { .. } => "catchup",
            Self::ProjectMetadata { .. } => "project_metadata",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
            Self::DismissAiAnalysis { .. } => "dismiss_ai_analysis",
            Self::Error { .. } => "error",
        }
    }
}

/// The outermost wire object: `{"message": M}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub message: WireMessage,
}

impl Envelope {
    pub fn new(message: WireMessage) -> Self {
        Self { message }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(message: WireMessage) -> WireMessage {
        let encoded = Envelope::new(message).encode().unwrap();
        Envelope::decode(&encoded).unwrap().message
    }

    #[test]
    fn test_transcription_round_trip() {
        let message = WireMessage::transcription("hello world");
        assert_eq!(round_trip(message.clone()), message);
    }

    #[test]
    fn test_type_tags_on_the_wire() {
        let encoded = Envelope::new(WireMessage::ai_result("q")).encode().unwrap();
        let raw: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(raw["message"]["type"], "ai_result");

        let encoded = Envelope::new(WireMessage::pong()).encode().unwrap();
        let raw: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(raw["message"]["type"], "pong");
    }

    #[test]
    fn test_decodes_client_offer() {
        let text = r#"{"message":{"type":"offer","timestamp":"2026-03-01T10:00:00Z",
            "sdp":{"sdp":"v=0...","type":"offer"}}}"#;
        let envelope = Envelope::decode(text).unwrap();
        match envelope.message {
            WireMessage::Offer { sdp, .. } => {
                assert_eq!(sdp.kind, "offer");
                assert_eq!(sdp.sdp, "v=0...");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_decodes_ice_candidate_with_camel_case_fields() {
        let text = r#"{"message":{"type":"ice_candidate","timestamp":"2026-03-01T10:00:00Z",
            "candidate":{"candidate":"candidate:1 1 udp 2122260223 192.168.1.7 54555 typ host",
            "sdpMid":"0","sdpMLineIndex":0}}}"#;
        let envelope = Envelope::decode(text).unwrap();
        match envelope.message {
            WireMessage::IceCandidate { candidate, .. } => {
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
                assert_eq!(candidate.sdp_mline_index, Some(0));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_error_omits_absent_session_id() {
        let encoded = Envelope::new(WireMessage::error("auth_failed", "bad ticket", None))
            .encode()
            .unwrap();
        assert!(!encoded.contains("session_id"));
    }
}
