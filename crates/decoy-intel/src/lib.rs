//! Intelligence extraction for the decoy platform.
//!
//! Two stages, both always run and their outputs unioned:
//!
//! * **Stage A**: deterministic recognisers over the transcript text:
//!   phones, URLs, UPI handles, bank accounts, IFSC codes, emails, and a
//!   language-tagged scam-keyword lexicon. Every match is canonicalised so
//!   the session entity set coalesces differently formatted repeats.
//! * **Stage B**: model-assisted extraction. The LLM output is validated
//!   against a strict schema ([`llm`]); anything that fails validation is
//!   discarded silently and stage A still stands.
//!
//! Tactic detection and the monotone threat-score update live here too so
//! the broker only ever moves typed values around.

pub mod lexicon;
pub mod llm;
pub mod patterns;
pub mod score;
pub mod tactics;

pub use lexicon::{KeywordHit, Lexicon, Severity};
pub use llm::LlmExtraction;
pub use score::{threat_score_update, ScoreFeatures};

use decoy_types::{Entity, EntityKind, Tactic};

/// Confidence assigned to deterministic pattern matches.
const PATTERN_CONFIDENCE: f32 = 0.95;
/// Confidence assigned to lexicon keyword hits.
const KEYWORD_CONFIDENCE: f32 = 0.9;

/// The result of one extraction pass over a transcript fragment.
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub entities: Vec<Entity>,
    pub tactics: Vec<Tactic>,
    pub keyword_hits: Vec<KeywordHit>,
}

impl Extraction {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.tactics.is_empty()
    }
}

/// Stage A extractor. Cheap enough to run inline on every transcript.
#[derive(Debug, Clone, Default)]
pub struct Extractor {
    lexicon: Lexicon,
}

impl Extractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs the deterministic recognisers and tactic rules.
    pub fn extract(&self, text: &str, language: &str) -> Extraction {
        let mut entities = patterns::recognise(text, PATTERN_CONFIDENCE);

        let hits = self.lexicon.scan(text, language);
        for hit in &hits {
            entities.push(Entity::new(
                EntityKind::Keyword,
                hit.keyword,
                KEYWORD_CONFIDENCE,
            ));
        }

        let tactics = tactics::detect(text, &hits);

        Extraction {
            entities,
            tactics: tactics.into_iter().collect(),
            keyword_hits: hits,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn otp_demand_yields_keyword_and_credential_tactic() {
        let ex = Extractor::new().extract("Please share your OTP now", "en");
        assert!(ex
            .entities
            .iter()
            .any(|e| e.kind == EntityKind::Keyword && e.value == "otp"));
        assert!(ex.tactics.contains(&Tactic::CredentialRequest));
    }

    #[test]
    fn formatted_and_plain_phone_share_one_canonical_value() {
        let extractor = Extractor::new();
        let a = extractor.extract("call me at +91-98765-43210", "en");
        let b = extractor.extract("number is 919876543210", "en");
        let phone_a = a
            .entities
            .iter()
            .find(|e| e.kind == EntityKind::Phone)
            .unwrap();
        let phone_b = b
            .entities
            .iter()
            .find(|e| e.kind == EntityKind::Phone)
            .unwrap();
        assert_eq!(phone_a.value, phone_b.value);
        assert_eq!(phone_a.value, "919876543210");
    }

    #[test]
    fn url_utterance_yields_url_entity() {
        let ex = Extractor::new().extract("visit http://malware.testing.google.test now", "en");
        assert!(ex
            .entities
            .iter()
            .any(|e| e.kind == EntityKind::Url
                && e.value == "http://malware.testing.google.test"));
    }

    #[test]
    fn benign_text_extracts_nothing() {
        let ex = Extractor::new().extract("hello, how are you today", "en");
        assert!(ex.is_empty(), "unexpected extraction: {ex:?}");
    }
}
