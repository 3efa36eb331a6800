//! Monotone threat-score updates.
//!
//! `new = min(1.0, max(old, Σ wᵢ·featureᵢ))` over a fixed weight table. The
//! score can only rise within a session; a quiet stretch never launders an
//! earlier credential demand.

use crate::lexicon::Severity;

/// Features of one analysis round that feed the weight table.
#[derive(Debug, Clone, Default)]
pub struct ScoreFeatures {
    /// Highest severity class among this round's keyword hits.
    pub max_severity: Option<Severity>,
    /// A credential_request tactic was detected.
    pub credential_request: bool,
    /// A URL entity is present in this round.
    pub has_url: bool,
    /// The URL scanner has flagged a discovered link as malicious.
    pub malicious_url: bool,
    /// Rounds before this one that produced keyword hits.
    pub repeat_rounds: u32,
}

const W_SEVERITY_HIGH: f32 = 0.5;
const W_SEVERITY_MEDIUM: f32 = 0.3;
const W_SEVERITY_LOW: f32 = 0.15;
const W_CREDENTIAL_REQUEST: f32 = 0.25;
const W_URL_PRESENT: f32 = 0.15;
const W_MALICIOUS_URL: f32 = 0.3;
const W_REPEAT: f32 = 0.05;
const REPEAT_CAP: u32 = 4;

/// Applies the weight table. Monotone: never returns less than `old`.
pub fn threat_score_update(old: f32, features: &ScoreFeatures) -> f32 {
    let mut proposed = 0.0f32;

    proposed += match features.max_severity {
        Some(Severity::High) => W_SEVERITY_HIGH,
        Some(Severity::Medium) => W_SEVERITY_MEDIUM,
        Some(Severity::Low) => W_SEVERITY_LOW,
        None => 0.0,
    };
    if features.credential_request {
        proposed += W_CREDENTIAL_REQUEST;
    }
    if features.has_url {
        proposed += W_URL_PRESENT;
    }
    if features.malicious_url {
        proposed += W_MALICIOUS_URL;
    }
    proposed += W_REPEAT * features.repeat_rounds.min(REPEAT_CAP) as f32;

    old.max(proposed).min(1.0)
}
