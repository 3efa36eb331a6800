//! Wire envelopes for the duplex call streams.
//!
//! One envelope per WebSocket text frame, UTF-8 JSON, discriminated by the
//! `kind` field. Modelling the frame as a closed tagged enum keeps handling
//! exhaustive: a new envelope kind fails to compile until every match site
//! accounts for it.
//!
//! Audio payloads travel as base64 strings inside the JSON envelope.

use crate::coaching::Strategy;
use crate::intel::{Entity, Tactic};
use crate::{EndReason, ErrorCode, Role};
use serde::{Deserialize, Serialize};

/// One framed message on a call stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Envelope {
    /// Codec-framed audio. Ingress from either leg; egress carries the
    /// normalised chunk tagged with its originating role.
    Audio {
        codec: String,
        #[serde(with = "base64_bytes")]
        payload: Vec<u8>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<Role>,
    },
    /// Chat fallback. Relayed to the peer; scammer text also feeds the
    /// analysis pipeline.
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<Role>,
    },
    /// Operator-initiated coaching trigger.
    RequestCoaching,
    /// First envelope on a freshly attached leg.
    Connected {
        role: Role,
        call_id: String,
        peer_present: bool,
    },
    /// A finalised utterance, emitted on both legs.
    Transcript {
        speaker: Role,
        text: String,
        language: String,
        confidence: f32,
        started_at_ms: u64,
        ended_at_ms: u64,
    },
    /// Coaching suggestion for the operator.
    Coaching {
        text: String,
        strategy: Strategy,
        intent: String,
        #[serde(
            default,
            with = "base64_bytes_opt",
            skip_serializing_if = "Option::is_none"
        )]
        audio: Option<Vec<u8>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        audio_codec: Option<String>,
        threat_score: f32,
    },
    /// Incremental intelligence for the operator.
    Intelligence {
        entities_delta: Vec<Entity>,
        tactics_delta: Vec<Tactic>,
        threat_score: f32,
    },
    Ping,
    Pong,
    PeerJoined {
        role: Role,
    },
    PeerLeft {
        role: Role,
    },
    /// Participant-initiated teardown.
    End,
    CallEnded {
        reason: EndReason,
        duration_ms: u64,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
}

impl Envelope {
    /// Audio envelopes are best-effort and may be shed under backpressure;
    /// everything else must be delivered in order.
    pub fn is_droppable(&self) -> bool {
        matches!(self, Envelope::Audio { .. })
    }

    /// Parses one ingress frame, distinguishing an unknown `kind` (report
    /// and carry on) from outright malformed JSON.
    pub fn parse(frame: &str) -> Result<Envelope, EnvelopeParseError> {
        let value: serde_json::Value = serde_json::from_str(frame)
            .map_err(|e| EnvelopeParseError::Malformed(e.to_string()))?;
        let kind = value
            .get("kind")
            .and_then(|k| k.as_str())
            .ok_or_else(|| EnvelopeParseError::Malformed("missing \"kind\" field".to_string()))?
            .to_string();
        match serde_json::from_value::<Envelope>(value) {
            Ok(env) => Ok(env),
            Err(e) if e.to_string().contains("unknown variant") => {
                Err(EnvelopeParseError::UnknownKind(kind))
            }
            Err(e) => Err(EnvelopeParseError::Malformed(e.to_string())),
        }
    }

    /// Serialises the envelope to its wire frame.
    pub fn to_frame(&self) -> String {
        // Envelope is a closed enum of serde-friendly fields; serialisation
        // cannot fail.
        serde_json::to_string(self).expect("envelope serialisation is infallible")
    }
}

/// Ingress framing failures, each mapped to an `error` envelope code.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeParseError {
    #[error("unknown envelope kind: {0:?}")]
    UnknownKind(String),
    #[error("malformed envelope: {0}")]
    Malformed(String),
}

impl EnvelopeParseError {
    pub fn code(&self) -> ErrorCode {
        match self {
            EnvelopeParseError::UnknownKind(_) => ErrorCode::UnknownEnvelope,
            EnvelopeParseError::Malformed(_) => ErrorCode::MalformedEnvelope,
        }
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

mod base64_bytes_opt {
    use base64::{engine::general_purpose, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => serializer.serialize_some(&general_purpose::STANDARD.encode(b)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        match encoded {
            Some(s) => general_purpose::STANDARD
                .decode(s.as_bytes())
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}
