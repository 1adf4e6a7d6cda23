//! Field validators used by the registry.

use std::sync::LazyLock;

use regex::Regex;

use crate::locale::contains_indonesian_month;

static DATE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"\b\d{1,2}/\d{1,2}/\d{4}(?:$|\D)").unwrap(),
        Regex::new(r"\b\d{4}-\d{1,2}-\d{1,2}(?:$|\D)").unwrap(),
        Regex::new(r"\b\d{1,2}-\d{1,2}-\d{4}(?:$|\D)").unwrap(),
    ]
});

static CURRENCY_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?i:rp\.?)?\s*(?:\d{1,3}(?:[.,]\d{3})+|\d+)(?:[.,]\d{1,2}|[.,]-)?$").unwrap()
});

/// Procurement codes are integers of at least eight digits.
pub fn is_rup_code(value: &str) -> bool {
    let value = value.trim();
    value.len() >= 8 && value.bytes().all(|b| b.is_ascii_digit()) && value.parse::<i64>().is_ok()
}

pub fn is_date(value: &str) -> bool {
    DATE_PATTERNS.iter().any(|re| re.is_match(value)) || contains_indonesian_month(value)
}

pub fn is_currency(value: &str) -> bool {
    CURRENCY_PATTERN.is_match(value.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rup_code_needs_eight_digits() {
        assert!(is_rup_code("12345678"));
        assert!(is_rup_code(" 51234567890 "));
        assert!(!is_rup_code("1234567"));
        assert!(!is_rup_code("abc"));
        assert!(!is_rup_code("1234a678"));
        assert!(!is_rup_code("-12345678"));
        assert!(!is_rup_code("99999999999999999999"));
    }

    #[test]
    fn date_accepts_numeric_and_month_names() {
        assert!(is_date("12/01/2025"));
        assert!(is_date("2025-1-12"));
        assert!(is_date("12-01-2025"));
        assert!(is_date("12 Januari 2025"));
        assert!(is_date("Agustus 2025"));
        assert!(is_date("2025-01-12T08:00:00"));
        assert!(is_date("2025-01-12T08:00:00Z"));
        assert!(is_date("2025-01-12 08:00:00"));
        assert!(!is_date("2025-01-123"));
        assert!(!is_date("Renovasi Kantor"));
        assert!(!is_date("12345678"));
    }

    #[test]
    fn currency_accepts_rupiah_formats() {
        assert!(is_currency("Rp. 1.500.000"));
        assert!(is_currency("Rp 250000"));
        assert!(is_currency("1,500,000"));
        assert!(is_currency("1.500.000,50"));
        assert!(is_currency("1500000000.0"));
        assert!(is_currency("Rp 1.500.000,-"));
        assert!(is_currency("Rp. 850.000.000,-"));
        assert!(is_currency("1.500.000,-"));
        assert!(!is_currency("Rp ,-"));
        assert!(!is_currency("Tender"));
        assert!(!is_currency("12 Januari 2025"));
        assert!(!is_currency(""));
    }
}
