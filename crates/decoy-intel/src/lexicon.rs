//! Language-tagged lexicon of scam-trigger keywords.
//!
//! Matching is case-insensitive substring containment over whitespace-
//! normalised text, the same discipline the rule engine applies. Each term
//! carries a severity class that feeds the threat-score weight table.

/// Severity class of a keyword hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// One lexicon match in a transcript fragment.
#[derive(Debug, Clone, PartialEq)]
pub struct KeywordHit {
    pub keyword: &'static str,
    pub severity: Severity,
}

struct LexEntry {
    term: &'static str,
    language: &'static str,
    severity: Severity,
}

const ENTRIES: &[LexEntry] = &[
    // English
    LexEntry { term: "otp", language: "en", severity: Severity::High },
    LexEntry { term: "one time password", language: "en", severity: Severity::High },
    LexEntry { term: "password", language: "en", severity: Severity::High },
    LexEntry { term: "cvv", language: "en", severity: Severity::High },
    LexEntry { term: "card number", language: "en", severity: Severity::High },
    LexEntry { term: "debit card", language: "en", severity: Severity::High },
    LexEntry { term: "credit card", language: "en", severity: Severity::High },
    LexEntry { term: "gift card", language: "en", severity: Severity::High },
    LexEntry { term: "arrest", language: "en", severity: Severity::High },
    LexEntry { term: "lottery", language: "en", severity: Severity::High },
    LexEntry { term: "kyc", language: "en", severity: Severity::High },
    LexEntry { term: "anydesk", language: "en", severity: Severity::High },
    LexEntry { term: "remote access", language: "en", severity: Severity::High },
    LexEntry { term: "police", language: "en", severity: Severity::Medium },
    LexEntry { term: "verify", language: "en", severity: Severity::Medium },
    LexEntry { term: "blocked", language: "en", severity: Severity::Medium },
    LexEntry { term: "suspended", language: "en", severity: Severity::Medium },
    LexEntry { term: "urgent", language: "en", severity: Severity::Medium },
    LexEntry { term: "immediately", language: "en", severity: Severity::Medium },
    LexEntry { term: "refund", language: "en", severity: Severity::Medium },
    LexEntry { term: "winner", language: "en", severity: Severity::Medium },
    LexEntry { term: "prize", language: "en", severity: Severity::Medium },
    LexEntry { term: "upi", language: "en", severity: Severity::Medium },
    LexEntry { term: "bank", language: "en", severity: Severity::Low },
    LexEntry { term: "account", language: "en", severity: Severity::Low },
    // Romanised Hindi
    LexEntry { term: "jaldi", language: "hi", severity: Severity::Medium },
    LexEntry { term: "turant", language: "hi", severity: Severity::Medium },
    LexEntry { term: "giraftar", language: "hi", severity: Severity::High },
    LexEntry { term: "bhugtan", language: "hi", severity: Severity::Medium },
    LexEntry { term: "khata", language: "hi", severity: Severity::Low },
];

/// Scam-keyword lexicon. The default carries the built-in entries.
#[derive(Debug, Clone, Default)]
pub struct Lexicon;

impl Lexicon {
    /// Scans normalised text for keywords tagged with the given language.
    /// English entries always apply; scammers code-switch constantly.
    pub fn scan(&self, text: &str, language: &str) -> Vec<KeywordHit> {
        let normalised = normalise(text);
        let mut hits = Vec::new();
        for entry in ENTRIES {
            if entry.language != "en" && entry.language != language {
                continue;
            }
            if contains_term(&normalised, entry.term) {
                hits.push(KeywordHit {
                    keyword: entry.term,
                    severity: entry.severity,
                });
            }
        }
        hits
    }
}

fn normalise(text: &str) -> String {
    let lowered = text.to_lowercase();
    lowered.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Word-bounded containment so "potpourri" does not hit "otp".
fn contains_term(text: &str, term: &str) -> bool {
    let mut start = 0;
    while let Some(idx) = text[start..].find(term) {
        let begin = start + idx;
        let end = begin + term.len();
        let left_ok = begin == 0
            || !text[..begin]
                .chars()
                .next_back()
                .is_some_and(|c| c.is_alphanumeric());
        let right_ok = end == text.len()
            || !text[end..].chars().next().is_some_and(|c| c.is_alphanumeric());
        if left_ok && right_ok {
            return true;
        }
        start = end;
    }
    false
}
