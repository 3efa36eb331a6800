//! Schema validation for model-assisted extraction.
//!
//! The language-model collaborator returns free JSON; it only enters the
//! session snapshot after passing this strict schema and the same
//! canonicalisers stage A uses. Output that fails validation is discarded
//! and the deterministic results stand alone.

use crate::patterns;
use decoy_types::{Entity, EntityKind, Tactic};
use serde::Deserialize;

/// Confidence assigned to model-sourced entities; below the deterministic
/// recognisers by design of the merge.
const LLM_CONFIDENCE: f32 = 0.7;

/// The strict extraction schema the model must produce.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LlmExtraction {
    #[serde(default)]
    pub phone_numbers: Vec<String>,
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default)]
    pub upi_handles: Vec<String>,
    #[serde(default)]
    pub bank_accounts: Vec<String>,
    #[serde(default)]
    pub ifsc_codes: Vec<String>,
    #[serde(default)]
    pub emails: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub tactics: Vec<String>,
}

/// Validation failure; the caller logs it and keeps stage A.
#[derive(Debug, thiserror::Error)]
#[error("llm extraction failed schema validation: {0}")]
pub struct SchemaError(#[from] serde_json::Error);

impl LlmExtraction {
    /// Validates a raw model response against the schema.
    pub fn validate(value: serde_json::Value) -> Result<Self, SchemaError> {
        Ok(serde_json::from_value(value)?)
    }

    /// Converts to typed entities and tactics, dropping anything the
    /// canonicalisers or the closed label set reject.
    pub fn into_typed(self) -> (Vec<Entity>, Vec<Tactic>) {
        let mut entities = Vec::new();

        for raw in &self.phone_numbers {
            if let Some(v) = patterns::canonical_phone(raw) {
                entities.push(Entity::new(EntityKind::Phone, v, LLM_CONFIDENCE));
            }
        }
        for raw in &self.urls {
            if let Some(v) = patterns::canonical_url(raw) {
                entities.push(Entity::new(EntityKind::Url, v, LLM_CONFIDENCE));
            }
        }
        for raw in &self.upi_handles {
            if let Some(v) = patterns::canonical_upi(raw) {
                entities.push(Entity::new(EntityKind::UpiHandle, v, LLM_CONFIDENCE));
            }
        }
        for raw in &self.bank_accounts {
            if let Some(v) = patterns::canonical_account(raw) {
                entities.push(Entity::new(EntityKind::BankAccount, v, LLM_CONFIDENCE));
            }
        }
        for raw in &self.ifsc_codes {
            if raw.len() == 11 {
                entities.push(Entity::new(
                    EntityKind::IfscCode,
                    patterns::canonical_ifsc(raw),
                    LLM_CONFIDENCE,
                ));
            }
        }
        for raw in &self.emails {
            if raw.contains('@') && raw.contains('.') {
                entities.push(Entity::new(
                    EntityKind::Email,
                    patterns::canonical_email(raw),
                    LLM_CONFIDENCE,
                ));
            }
        }
        for raw in &self.keywords {
            let keyword = raw.trim().to_lowercase();
            if !keyword.is_empty() && keyword.len() <= 64 {
                entities.push(Entity::new(EntityKind::Keyword, keyword, LLM_CONFIDENCE));
            }
        }

        let tactics = self
            .tactics
            .iter()
            .filter_map(|label| Tactic::from_label(label))
            .collect();

        (entities, tactics)
    }
}
