//! Coaching output model: the suggestion handed to the operator and the
//! closed strategy vocabulary.

use serde::{Deserialize, Serialize};

/// Operator-facing conversation strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Keep the scammer talking without committing to anything.
    Delay,
    /// Mirror concern to lower the scammer's guard.
    Empathy,
    /// Steer toward payment details, identities, infrastructure.
    InformationExtraction,
    /// Defuse pressure tactics before responding.
    DeEscalation,
    /// End the call now.
    Terminate,
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::Delay => "delay",
            Strategy::Empathy => "empathy",
            Strategy::InformationExtraction => "information_extraction",
            Strategy::DeEscalation => "de_escalation",
            Strategy::Terminate => "terminate",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "delay" => Some(Strategy::Delay),
            "empathy" => Some(Strategy::Empathy),
            "information_extraction" => Some(Strategy::InformationExtraction),
            "de_escalation" => Some(Strategy::DeEscalation),
            "terminate" => Some(Strategy::Terminate),
            _ => None,
        }
    }
}

/// A short coaching utterance for the operator, optionally rendered to
/// audio. Not retained beyond dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoachingSuggestion {
    pub text: String,
    pub strategy: Strategy,
    pub intent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_codec: Option<String>,
    pub created_at_ms: u64,
}
