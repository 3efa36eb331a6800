//! Deterministic entity recognisers and canonicalisation.
//!
//! Canonical forms are what the session entity set coalesces on, so every
//! recogniser routes through a `canonical_*` function and model-assisted
//! output is pushed through the same functions before merging.

use decoy_types::{Entity, EntityKind};
use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)\bhttps?://[^\s<>"']+"#).expect("url regex"));

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}\b").expect("email regex")
});

static UPI_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b([a-z0-9._-]{2,})@([a-z]{2,})\b").expect("upi regex"));

static IFSC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[A-Za-z]{4}0[A-Za-z0-9]{6}\b").expect("ifsc regex"));

/// Digit runs with optional `+` prefix and common separators; canonical
/// length decides whether a run is a phone number.
static PHONE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\+?\d[\d .\-]{7,20}\d").expect("phone regex"));

static DIGIT_RUN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b\d{9,18}\b").expect("digit run regex"));

/// Closed list of UPI payment-service-provider suffixes.
const UPI_PROVIDERS: &[&str] = &[
    "upi", "ybl", "ibl", "axl", "apl", "paytm", "okaxis", "oksbi", "okhdfcbank", "okicici",
    "freecharge", "yapl",
];

/// Runs every recogniser over the text and returns canonicalised entities.
pub fn recognise(text: &str, confidence: f32) -> Vec<Entity> {
    let mut entities = Vec::new();
    let mut phone_values: HashSet<String> = HashSet::new();

    for m in PHONE_RE.find_iter(text) {
        if let Some(canonical) = canonical_phone(m.as_str()) {
            if phone_values.insert(canonical.clone()) {
                entities.push(Entity::new(EntityKind::Phone, canonical, confidence));
            }
        }
    }

    for m in URL_RE.find_iter(text) {
        if let Some(canonical) = canonical_url(m.as_str()) {
            entities.push(Entity::new(EntityKind::Url, canonical, confidence));
        }
    }

    let mut email_locals: HashSet<String> = HashSet::new();
    for m in EMAIL_RE.find_iter(text) {
        let canonical = canonical_email(m.as_str());
        email_locals.insert(canonical.clone());
        entities.push(Entity::new(EntityKind::Email, canonical, confidence));
    }

    for caps in UPI_RE.captures_iter(text) {
        let whole = caps.get(0).expect("match").as_str();
        if let Some(canonical) = canonical_upi(whole) {
            entities.push(Entity::new(EntityKind::UpiHandle, canonical, confidence));
        }
    }

    for m in IFSC_RE.find_iter(text) {
        entities.push(Entity::new(
            EntityKind::IfscCode,
            canonical_ifsc(m.as_str()),
            confidence,
        ));
    }

    // Bank accounts are digit runs not already claimed as phone numbers.
    for m in DIGIT_RUN_RE.find_iter(text) {
        let digits = m.as_str().to_string();
        if phone_values.contains(&digits) {
            continue;
        }
        entities.push(Entity::new(EntityKind::BankAccount, digits, confidence));
    }

    entities
}

/// Strips separators; accepts canonical lengths of 10–15 digits.
pub fn canonical_phone(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if (10..=15).contains(&digits.len()) {
        Some(digits)
    } else {
        None
    }
}

/// Lowercases the scheme and host, leaving path and query untouched.
pub fn canonical_url(raw: &str) -> Option<String> {
    let trimmed = raw.trim_end_matches(['.', ',', ';', ')', '!', '?']);
    let scheme_end = trimmed.find("://")?;
    let rest = &trimmed[scheme_end + 3..];
    if rest.is_empty() {
        return None;
    }
    let host_end = rest.find('/').unwrap_or(rest.len());
    let (host, path) = rest.split_at(host_end);
    Some(format!(
        "{}://{}{}",
        trimmed[..scheme_end].to_ascii_lowercase(),
        host.to_ascii_lowercase(),
        path
    ))
}

/// Lowercased `local@psp` when the suffix is a known provider.
pub fn canonical_upi(raw: &str) -> Option<String> {
    let lowered = raw.to_ascii_lowercase();
    let (_, psp) = lowered.rsplit_once('@')?;
    if UPI_PROVIDERS.contains(&psp) {
        Some(lowered)
    } else {
        None
    }
}

pub fn canonical_ifsc(raw: &str) -> String {
    raw.to_ascii_uppercase()
}

pub fn canonical_email(raw: &str) -> String {
    raw.to_ascii_lowercase()
}

/// Digit runs of 9–18 characters qualify as account numbers.
pub fn canonical_account(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if (9..=18).contains(&digits.len()) {
        Some(digits)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(entities: &[Entity], kind: EntityKind) -> Vec<&str> {
        entities
            .iter()
            .filter(|e| e.kind == kind)
            .map(|e| e.value.as_str())
            .collect()
    }

    #[test]
    fn phone_separators_are_stripped() {
        assert_eq!(
            canonical_phone("+91-98765-43210").as_deref(),
            Some("919876543210")
        );
        assert_eq!(canonical_phone("98765 43210").as_deref(), Some("9876543210"));
        assert_eq!(canonical_phone("12345"), None);
        assert_eq!(canonical_phone("1234567890123456"), None);
    }

    #[test]
    fn url_scheme_and_host_are_lowercased() {
        assert_eq!(
            canonical_url("HTTPS://Evil.Example.COM/Payment?id=1").as_deref(),
            Some("https://evil.example.com/Payment?id=1")
        );
        assert_eq!(
            canonical_url("http://bad.test,").as_deref(),
            Some("http://bad.test")
        );
    }

    #[test]
    fn upi_requires_known_provider() {
        assert_eq!(canonical_upi("Victim.Payee@okICICI").as_deref(), Some("victim.payee@okicici"));
        assert_eq!(canonical_upi("someone@gmail"), None);
    }

    #[test]
    fn bank_account_not_claimed_when_phone_matches() {
        let entities = recognise("pay into 9876543210", 0.9);
        assert_eq!(kinds(&entities, EntityKind::Phone), vec!["9876543210"]);
        assert!(kinds(&entities, EntityKind::BankAccount).is_empty());
    }

    #[test]
    fn nine_digit_run_is_a_bank_account() {
        let entities = recognise("account 123456789 please", 0.9);
        assert_eq!(kinds(&entities, EntityKind::BankAccount), vec!["123456789"]);
        assert!(kinds(&entities, EntityKind::Phone).is_empty());
    }

    #[test]
    fn ifsc_is_uppercased() {
        let entities = recognise("ifsc is hdfc0001234", 0.9);
        assert_eq!(kinds(&entities, EntityKind::IfscCode), vec!["HDFC0001234"]);
    }

    #[test]
    fn email_is_recognised_and_not_misread_as_upi() {
        let entities = recognise("send to Fraud.Desk@Example.com", 0.9);
        assert_eq!(kinds(&entities, EntityKind::Email), vec!["fraud.desk@example.com"]);
        assert!(kinds(&entities, EntityKind::UpiHandle).is_empty());
    }
}
