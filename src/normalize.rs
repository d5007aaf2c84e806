//! Field normalization for raw Form ADV values.
//!
//! Everything here is a pure function over strings: contact fields are
//! brought to canonical form (E.164 phone numbers, https URLs), money and
//! count columns are parsed leniently, fund types are classified into a
//! fixed set of categories, and placeholder firm names are detected so the
//! narrative stage can skip or regenerate them.

use sha2::{Digest, Sha256};

/// Values that mean "no data" in the source extracts.
const NULL_MARKERS: &[&str] = &["", "N/A", "NA", "NONE", "NOT AVAILABLE", "NULL", "-"];

/// Treat empty strings and the usual filler values as absent.
pub fn clean_value(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if NULL_MARKERS
        .iter()
        .any(|m| trimmed.eq_ignore_ascii_case(m))
    {
        return None;
    }
    Some(trimmed.to_string())
}

/// Normalize a phone or fax number to E.164.
///
/// Ten-digit numbers are assumed NANP and prefixed `+1`; eleven digits
/// starting with `1` likewise. Numbers already carrying `+` keep their
/// country code. Anything else is unusable and dropped.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let has_plus = trimmed.starts_with('+');
    let digits: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();

    match digits.len() {
        10 => Some(format!("+1{}", digits)),
        11 if digits.starts_with('1') => Some(format!("+{}", digits)),
        8..=15 if has_plus => Some(format!("+{}", digits)),
        _ => None,
    }
}

/// Normalize a website value to `https://host/path` form.
///
/// Adds the scheme when missing, lowercases the scheme and host, and keeps
/// the path as given. Filler values return `None`.
pub fn normalize_website(raw: &str) -> Option<String> {
    let cleaned = clean_value(raw)?;

    let without_scheme = cleaned
        .strip_prefix("https://")
        .or_else(|| cleaned.strip_prefix("http://"))
        .or_else(|| cleaned.strip_prefix("HTTPS://"))
        .or_else(|| cleaned.strip_prefix("HTTP://"))
        .unwrap_or(&cleaned);

    if without_scheme.is_empty() || !without_scheme.contains('.') {
        return None;
    }

    let (host, path) = match without_scheme.find('/') {
        Some(pos) => (&without_scheme[..pos], &without_scheme[pos..]),
        None => (without_scheme, ""),
    };

    Some(format!("https://{}{}", host.to_lowercase(), path))
}

/// Parse a money column into whole dollars.
///
/// Tolerates `$`, thousands separators, and decimal fractions; garbage
/// parses to `None`, never to zero.
pub fn parse_money(raw: &str) -> Option<i64> {
    let cleaned = clean_value(raw)?;
    let stripped: String = cleaned
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    if stripped.is_empty() {
        return None;
    }
    stripped.parse::<f64>().ok().map(|v| v as i64)
}

/// Parse an integer count column.
pub fn parse_count(raw: &str) -> Option<i64> {
    parse_money(raw)
}

/// `Y`/`Yes`/`true` → true, anything else → false.
pub fn parse_flag(raw: &str) -> bool {
    let t = raw.trim();
    t.eq_ignore_ascii_case("y") || t.eq_ignore_ascii_case("yes") || t.eq_ignore_ascii_case("true")
}

/// Fixed fund-type categories used by the classifier.
pub const FUND_TYPES: &[&str] = &[
    "Hedge Fund",
    "Private Equity Fund",
    "Venture Capital Fund",
    "Real Estate Fund",
    "Securitized Asset Fund",
    "Liquidity Fund",
    "Other Private Fund",
];

/// Classify a raw Schedule D fund-type value into one of [`FUND_TYPES`].
pub fn classify_fund_type(raw: &str) -> &'static str {
    let lower = raw.trim().to_lowercase();
    if lower.contains("hedge") {
        "Hedge Fund"
    } else if lower.contains("venture") {
        "Venture Capital Fund"
    } else if lower.contains("private equity") || lower.contains("buyout") {
        "Private Equity Fund"
    } else if lower.contains("real estate") {
        "Real Estate Fund"
    } else if lower.contains("securitized") || lower.contains("structured asset") {
        "Securitized Asset Fund"
    } else if lower.contains("liquidity") || lower.contains("money market") {
        "Liquidity Fund"
    } else {
        "Other Private Fund"
    }
}

/// Detect placeholder/generic firm names that make a narrative useless.
///
/// A narrative generated under a placeholder name becomes eligible for
/// regeneration once the adviser's real name is known.
pub fn is_placeholder_name(name: &str) -> bool {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return true;
    }
    if NULL_MARKERS.iter().any(|m| trimmed.eq_ignore_ascii_case(m)) {
        return true;
    }
    if trimmed.eq_ignore_ascii_case("unknown") {
        return true;
    }
    trimmed.chars().all(|c| c.is_ascii_digit() || c == '.')
}

/// Build the synthetic natural key for an adviser without a CRD number.
///
/// `GEN_` plus the first twelve uppercase hex characters of
/// SHA-256 over `name|city|state`, so the same firm hashes to the same key
/// on every ingestion pass.
pub fn synthetic_key(name: &str, city: &str, state: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.trim().as_bytes());
    hasher.update(b"|");
    hasher.update(city.trim().as_bytes());
    hasher.update(b"|");
    hasher.update(state.trim().as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("GEN_{}", digest[..12].to_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_value_filters_fillers() {
        assert_eq!(clean_value("  Acme Capital "), Some("Acme Capital".into()));
        assert_eq!(clean_value("N/A"), None);
        assert_eq!(clean_value("none"), None);
        assert_eq!(clean_value("   "), None);
    }

    #[test]
    fn phone_nanp_ten_digits() {
        assert_eq!(
            normalize_phone("(314) 555-1234"),
            Some("+13145551234".to_string())
        );
        assert_eq!(
            normalize_phone("314.555.1234"),
            Some("+13145551234".to_string())
        );
    }

    #[test]
    fn phone_eleven_digits_with_country() {
        assert_eq!(
            normalize_phone("1-314-555-1234"),
            Some("+13145551234".to_string())
        );
    }

    #[test]
    fn phone_international_keeps_code() {
        assert_eq!(
            normalize_phone("+44 20 7946 0958"),
            Some("+442079460958".to_string())
        );
    }

    #[test]
    fn phone_garbage_is_none() {
        assert_eq!(normalize_phone("call us"), None);
        assert_eq!(normalize_phone("555-1234"), None);
        assert_eq!(normalize_phone(""), None);
    }

    #[test]
    fn website_adds_scheme_and_lowercases_host() {
        assert_eq!(
            normalize_website("WWW.Acme.COM/Team"),
            Some("https://www.acme.com/Team".to_string())
        );
        assert_eq!(
            normalize_website("http://acme.com"),
            Some("https://acme.com".to_string())
        );
    }

    #[test]
    fn website_rejects_fillers() {
        assert_eq!(normalize_website("N/A"), None);
        assert_eq!(normalize_website("none"), None);
        assert_eq!(normalize_website("notaurl"), None);
    }

    #[test]
    fn money_strips_punctuation() {
        assert_eq!(parse_money("$5,000,000"), Some(5_000_000));
        assert_eq!(parse_money("1234567.00"), Some(1_234_567));
        assert_eq!(parse_money(""), None);
        assert_eq!(parse_money("unknown"), None);
    }

    #[test]
    fn fund_type_classification() {
        assert_eq!(classify_fund_type("Hedge Fund"), "Hedge Fund");
        assert_eq!(classify_fund_type("hedge"), "Hedge Fund");
        assert_eq!(
            classify_fund_type("Private Equity Fund"),
            "Private Equity Fund"
        );
        assert_eq!(classify_fund_type("venture capital"), "Venture Capital Fund");
        assert_eq!(classify_fund_type("Real Estate Fund"), "Real Estate Fund");
        assert_eq!(classify_fund_type("money market"), "Liquidity Fund");
        assert_eq!(classify_fund_type("something else"), "Other Private Fund");
        assert_eq!(classify_fund_type(""), "Other Private Fund");
    }

    #[test]
    fn placeholder_names() {
        assert!(is_placeholder_name(""));
        assert!(is_placeholder_name("N/A"));
        assert!(is_placeholder_name("UNKNOWN"));
        assert!(is_placeholder_name("12345"));
        assert!(!is_placeholder_name("Acme Capital Management LLC"));
    }

    #[test]
    fn synthetic_key_is_stable_and_prefixed() {
        let a = synthetic_key("Acme Capital", "St. Louis", "MO");
        let b = synthetic_key("Acme Capital", "St. Louis", "MO");
        assert_eq!(a, b);
        assert!(a.starts_with("GEN_"));
        assert_eq!(a.len(), 16);

        let c = synthetic_key("Acme Capital", "Chicago", "IL");
        assert_ne!(a, c);
    }
}
