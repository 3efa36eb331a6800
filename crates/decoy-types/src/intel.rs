//! Intelligence data model: typed entities, tactic labels, and the monotone
//! per-session snapshot.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// The closed set of entity kinds the extractor produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Phone,
    Url,
    UpiHandle,
    BankAccount,
    IfscCode,
    Email,
    Keyword,
}

/// One extracted entity in canonical form.
///
/// Uniqueness key is `(kind, value)`; the snapshot coalesces duplicates
/// regardless of how the source text was formatted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub kind: EntityKind,
    pub value: String,
    pub first_seen_at_ms: u64,
    pub confidence: f32,
}

impl Entity {
    pub fn new(kind: EntityKind, value: impl Into<String>, confidence: f32) -> Self {
        Self {
            kind,
            value: value.into(),
            first_seen_at_ms: 0,
            confidence,
        }
    }
}

/// Closed social-engineering tactic labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tactic {
    Urgency,
    Authority,
    Fear,
    Greed,
    CredentialRequest,
    Impersonation,
    Isolation,
    /// Added asynchronously when the URL scanner flags a discovered link.
    MaliciousUrl,
}

impl Tactic {
    pub fn as_str(self) -> &'static str {
        match self {
            Tactic::Urgency => "urgency",
            Tactic::Authority => "authority",
            Tactic::Fear => "fear",
            Tactic::Greed => "greed",
            Tactic::CredentialRequest => "credential_request",
            Tactic::Impersonation => "impersonation",
            Tactic::Isolation => "isolation",
            Tactic::MaliciousUrl => "malicious_url",
        }
    }

    /// Parses a label from the closed set. Used to validate model output;
    /// anything outside the set is rejected rather than invented.
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "urgency" => Some(Tactic::Urgency),
            "authority" => Some(Tactic::Authority),
            "fear" => Some(Tactic::Fear),
            "greed" => Some(Tactic::Greed),
            "credential_request" => Some(Tactic::CredentialRequest),
            "impersonation" => Some(Tactic::Impersonation),
            "isolation" => Some(Tactic::Isolation),
            "malicious_url" => Some(Tactic::MaliciousUrl),
            _ => None,
        }
    }
}

/// The per-session intelligence aggregate.
///
/// The entity set is coalesced on `(kind, value)` and `threat_score` is
/// monotone non-decreasing for the life of the session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntelligenceSnapshot {
    pub entities: Vec<Entity>,
    pub tactics: BTreeSet<Tactic>,
    pub threat_score: f32,
    pub updated_at_ms: u64,
}

impl IntelligenceSnapshot {
    /// Merges a batch of candidate entities, returning only those that were
    /// genuinely new. Duplicate `(kind, value)` pairs are dropped and the
    /// first-seen timestamp of the survivor is preserved.
    pub fn merge_entities(&mut self, candidates: Vec<Entity>, now_ms: u64) -> Vec<Entity> {
        let mut added = Vec::new();
        for mut candidate in candidates {
            let exists = self
                .entities
                .iter()
                .any(|e| e.kind == candidate.kind && e.value == candidate.value);
            if exists {
                continue;
            }
            candidate.first_seen_at_ms = now_ms;
            self.entities.push(candidate.clone());
            added.push(candidate);
        }
        if !added.is_empty() {
            self.updated_at_ms = now_ms;
        }
        added
    }

    /// Adds tactic labels, returning the ones not previously present.
    pub fn merge_tactics(&mut self, tactics: impl IntoIterator<Item = Tactic>, now_ms: u64) -> Vec<Tactic> {
        let mut added = Vec::new();
        for tactic in tactics {
            if self.tactics.insert(tactic) {
                added.push(tactic);
            }
        }
        if !added.is_empty() {
            self.updated_at_ms = now_ms;
        }
        added
    }

    /// Raises the threat score. The score never decreases; a lower proposal
    /// is ignored. Returns true when the score actually moved.
    pub fn raise_score(&mut self, proposed: f32, now_ms: u64) -> bool {
        let clamped = proposed.clamp(0.0, 1.0);
        if clamped > self.threat_score {
            self.threat_score = clamped;
            self.updated_at_ms = now_ms;
            true
        } else {
            false
        }
    }
}
