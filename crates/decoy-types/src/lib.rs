//! Shared types, error codes, and constants for the decoy platform.
//!
//! This crate provides the foundational types used across all decoy crates:
//! call and participant identity, the session state machine vocabulary, the
//! wire envelope enum, and the intelligence/coaching data model.
//!
//! No crate in the workspace depends on anything *except* `decoy-types` for
//! cross-cutting type definitions. This keeps the dependency graph clean and
//! prevents circular dependencies.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod coaching;
pub mod envelope;
pub mod intel;

pub use coaching::{CoachingSuggestion, Strategy};
pub use envelope::{Envelope, EnvelopeParseError};
pub use intel::{Entity, EntityKind, IntelligenceSnapshot, Tactic};

/// Opaque, caller-provided call identifier. Unique while the session lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(pub String);

impl CallId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for CallId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// The two participant roles in a call. Exactly one stream per role per
/// session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Operator,
    Scammer,
}

impl Role {
    /// The opposite leg of the call.
    pub fn peer(self) -> Role {
        match self {
            Role::Operator => Role::Scammer,
            Role::Scammer => Role::Operator,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Operator => "operator",
            Role::Scammer => "scammer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ParseRoleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "operator" => Ok(Role::Operator),
            "scammer" => Ok(Role::Scammer),
            other => Err(ParseRoleError(other.to_string())),
        }
    }
}

/// Error returned when a connection URL carries an unrecognised role.
#[derive(Debug, thiserror::Error)]
#[error("invalid role: {0:?} (expected \"operator\" or \"scammer\")")]
pub struct ParseRoleError(pub String);

/// Session lifecycle states.
///
/// `Forming` holds exactly one leg, `Active` both, `Draining` is the grace
/// window after a disconnect, and `Ended` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Forming,
    Active,
    Draining,
    Ended,
}

/// Why a call ended. Carried on the `call_ended` envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// A participant or the control plane requested teardown.
    Requested,
    /// The drain grace period expired without a reattach.
    Timeout,
    /// An egress queue blocked a non-droppable envelope for too long.
    SlowConsumer,
    /// An internal invariant was violated; the session was torn down.
    InternalError,
}

impl EndReason {
    pub fn as_str(self) -> &'static str {
        match self {
            EndReason::Requested => "requested",
            EndReason::Timeout => "timeout",
            EndReason::SlowConsumer => "slow_consumer",
            EndReason::InternalError => "internal_error",
        }
    }
}

/// Machine-readable codes for `error` envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The envelope `kind` is not one the broker understands.
    UnknownEnvelope,
    /// The frame was not a valid JSON envelope.
    MalformedEnvelope,
    /// The audio payload could not be base64-decoded.
    BadAudioPayload,
    /// The audio codec is not on the session allowlist.
    UnsupportedCodec,
    /// A leg for the requested role is already attached.
    RoleOccupied,
    /// The broker is at its session cap.
    ServerBusy,
}

/// Audio codecs accepted on ingress. The canonical wire names match what
/// browser `MediaRecorder` implementations report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AudioCodec {
    #[serde(rename = "webm-opus")]
    WebmOpus,
    #[serde(rename = "ogg-opus")]
    OggOpus,
    #[serde(rename = "wav-pcm")]
    WavPcm,
    #[serde(rename = "mp3")]
    Mp3,
}

impl AudioCodec {
    pub fn as_str(self) -> &'static str {
        match self {
            AudioCodec::WebmOpus => "webm-opus",
            AudioCodec::OggOpus => "ogg-opus",
            AudioCodec::WavPcm => "wav-pcm",
            AudioCodec::Mp3 => "mp3",
        }
    }
}

impl fmt::Display for AudioCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AudioCodec {
    type Err = UnsupportedCodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "webm-opus" => Ok(AudioCodec::WebmOpus),
            "ogg-opus" => Ok(AudioCodec::OggOpus),
            "wav-pcm" => Ok(AudioCodec::WavPcm),
            "mp3" => Ok(AudioCodec::Mp3),
            other => Err(UnsupportedCodecError(other.to_string())),
        }
    }
}

/// Error returned for a codec name outside the recognised set.
#[derive(Debug, thiserror::Error)]
#[error("unsupported audio codec: {0:?}")]
pub struct UnsupportedCodecError(pub String);

/// One finalised utterance from either leg.
///
/// Timestamps are milliseconds since session creation on the monotonic
/// clock. Entries are ordered by `started_at_ms`; ties are broken by the
/// session-wide insertion counter `seq`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub speaker: Role,
    pub text: String,
    pub language: String,
    pub confidence: f32,
    pub started_at_ms: u64,
    pub ended_at_ms: u64,
    pub seq: u64,
}

/// Control-plane snapshot of a session, returned by
/// `GET /api/call/status/{call_id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallStatus {
    pub call_id: CallId,
    pub state: SessionState,
    pub legs_present: Vec<Role>,
    /// Wall-clock session start, RFC 3339.
    pub started_at: String,
    /// Milliseconds since the last ingress activity on any leg.
    pub idle_ms: u64,
}
