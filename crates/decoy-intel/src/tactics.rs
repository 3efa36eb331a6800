//! Social-engineering tactic detection.
//!
//! A rule set over the lexicon hits and phrase features of one utterance,
//! producing zero or more labels from the closed set. Rules only ever add
//! labels; scoring is the threat-score table's job.

use crate::lexicon::{KeywordHit, Severity};
use decoy_types::Tactic;
use std::collections::BTreeSet;

const URGENCY_PHRASES: &[&str] = &[
    "urgent",
    "immediately",
    "right now",
    "last chance",
    "expires",
    "within the hour",
    "jaldi",
    "turant",
];

const AUTHORITY_PHRASES: &[&str] = &[
    "police",
    "officer",
    "court",
    "government",
    "income tax",
    "rbi",
    "cyber cell",
    "legal department",
    "bank manager",
];

const FEAR_PHRASES: &[&str] = &[
    "arrest",
    "blocked",
    "suspended",
    "legal action",
    "lawsuit",
    "penalty",
    "giraftar",
    "case against you",
];

const GREED_PHRASES: &[&str] = &[
    "lottery",
    "winner",
    "prize",
    "refund",
    "cashback",
    "reward",
    "jackpot",
];

const CREDENTIAL_PHRASES: &[&str] = &[
    "otp",
    "one time password",
    "password",
    "pin",
    "cvv",
    "card number",
    "verification code",
];

const IMPERSONATION_PHRASES: &[&str] = &[
    "calling from",
    "i am from",
    "speaking from",
    "on behalf of",
    "this is your bank",
];

const ISOLATION_PHRASES: &[&str] = &[
    "don't tell",
    "do not tell",
    "keep this secret",
    "don't share this call",
    "stay on the line",
    "do not hang up",
    "don't inform",
    "don't call anyone",
];

/// Detects tactic labels in one utterance.
pub fn detect(text: &str, hits: &[KeywordHit]) -> BTreeSet<Tactic> {
    let lowered = text.to_lowercase();
    let mut tactics = BTreeSet::new();

    let rules: &[(&[&str], Tactic)] = &[
        (URGENCY_PHRASES, Tactic::Urgency),
        (AUTHORITY_PHRASES, Tactic::Authority),
        (FEAR_PHRASES, Tactic::Fear),
        (GREED_PHRASES, Tactic::Greed),
        (CREDENTIAL_PHRASES, Tactic::CredentialRequest),
        (IMPERSONATION_PHRASES, Tactic::Impersonation),
        (ISOLATION_PHRASES, Tactic::Isolation),
    ];
    for (phrases, tactic) in rules {
        if phrases.iter().any(|p| lowered.contains(p)) {
            tactics.insert(*tactic);
        }
    }

    // A high-severity credential keyword is a credential request even when
    // phrased outside the table above.
    if hits
        .iter()
        .any(|h| h.severity == Severity::High && CREDENTIAL_PHRASES.contains(&h.keyword))
    {
        tactics.insert(Tactic::CredentialRequest);
    }

    tactics
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexicon::Lexicon;

    fn detect_full(text: &str) -> BTreeSet<Tactic> {
        let hits = Lexicon.scan(text, "en");
        detect(text, &hits)
    }

    #[test]
    fn otp_demand_is_a_credential_request() {
        let tactics = detect_full("Please share your OTP now");
        assert!(tactics.contains(&Tactic::CredentialRequest));
    }

    #[test]
    fn officer_threat_is_authority_plus_fear() {
        let tactics = detect_full("I am calling from the police, you will be arrested today");
        assert!(tactics.contains(&Tactic::Authority));
        assert!(tactics.contains(&Tactic::Fear));
        assert!(tactics.contains(&Tactic::Impersonation));
    }

    #[test]
    fn secrecy_pressure_is_isolation() {
        let tactics = detect_full("do not hang up and don't tell your family");
        assert!(tactics.contains(&Tactic::Isolation));
    }

    #[test]
    fn plain_conversation_has_no_tactics() {
        assert!(detect_full("the weather is lovely today").is_empty());
    }
}
