//! Indonesian date and rupiah amount handling.

use chrono::NaiveDate;

/// Indonesian month spellings (full and abbreviated) and their English form.
const MONTHS: &[(&str, &str)] = &[
    ("januari", "January"),
    ("februari", "February"),
    ("pebruari", "February"),
    ("maret", "March"),
    ("april", "April"),
    ("mei", "May"),
    ("juni", "June"),
    ("juli", "July"),
    ("agustus", "August"),
    ("september", "September"),
    ("oktober", "October"),
    ("november", "November"),
    ("nopember", "November"),
    ("desember", "December"),
    ("jan", "January"),
    ("feb", "February"),
    ("peb", "February"),
    ("mar", "March"),
    ("apr", "April"),
    ("jun", "June"),
    ("jul", "July"),
    ("agu", "August"),
    ("agt", "August"),
    ("ags", "August"),
    ("sep", "September"),
    ("okt", "October"),
    ("nov", "November"),
    ("nop", "November"),
    ("des", "December"),
];

const FULL_MONTHS: &[&str] = &[
    "januari", "februari", "maret", "april", "mei", "juni", "juli", "agustus", "september",
    "oktober", "november", "desember",
];

const DATE_FORMATS: &[&str] = &[
    "%d %B %Y",
    "%d/%m/%Y",
    "%Y-%m-%d",
    "%d-%m-%Y",
    "%Y/%m/%d",
];

pub fn contains_indonesian_month(value: &str) -> bool {
    let lower = value.to_lowercase();
    FULL_MONTHS.iter().any(|m| lower.contains(m))
}

/// Rewrites every Indonesian month word to its English name, leaving other
/// tokens alone. `"5 Agustus 2025"` becomes `"5 August 2025"`.
pub fn canonical_month_names(value: &str) -> String {
    value
        .split_whitespace()
        .map(|word| {
            let bare = word.trim_matches(|c: char| c == ',' || c == '.').to_lowercase();
            MONTHS
                .iter()
                .find(|(id, _)| *id == bare)
                .map(|(_, en)| (*en).to_string())
                .unwrap_or_else(|| word.to_string())
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parses a date written the way the portal writes it. A bare `Month Year`
/// resolves to the first day of that month.
pub fn parse_indonesian_date(value: &str) -> Option<NaiveDate> {
    let canonical = canonical_month_names(value.trim());
    if canonical.is_empty() {
        return None;
    }
    // Detail pages often append a time or weekday; only the date part matters.
    let candidates = [
        canonical.clone(),
        canonical.split_whitespace().take(3).collect::<Vec<_>>().join(" "),
        format!("1 {}", canonical.split_whitespace().take(2).collect::<Vec<_>>().join(" ")),
    ];
    candidates.iter().find_map(|candidate| {
        DATE_FORMATS
            .iter()
            .find_map(|fmt| NaiveDate::parse_from_str(candidate, fmt).ok())
    })
}

/// Parses a rupiah amount such as `"Rp. 1.500.000,50"` into a number.
///
/// Dots are thousands separators and a comma marks decimals, unless the
/// string only makes sense the other way round (`"1500000.00"`, `"1,500,000"`).
pub fn parse_rupiah(value: &str) -> Option<f64> {
    let trimmed = value.trim();
    let without_prefix = trimmed
        .strip_prefix("Rp.")
        .or_else(|| trimmed.strip_prefix("Rp"))
        .or_else(|| trimmed.strip_prefix("RP"))
        .or_else(|| trimmed.strip_prefix("rp"))
        .unwrap_or(trimmed);
    let digits: String = without_prefix
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == ',')
        .collect();
    if !digits.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }

    let dots = digits.matches('.').count();
    let commas = digits.matches(',').count();
    let canonical = match (dots, commas) {
        (0, 0) => digits,
        (_, 0) if dots == 1 && !has_thousands_tail(&digits, '.') => digits,
        (_, 0) => digits.replace('.', ""),
        (0, _) if commas == 1 && !has_thousands_tail(&digits, ',') => digits.replace(',', "."),
        (0, _) => digits.replace(',', ""),
        _ => {
            let last_dot = digits.rfind('.').unwrap_or(0);
            let last_comma = digits.rfind(',').unwrap_or(0);
            if last_comma > last_dot {
                digits.replace('.', "").replace(',', ".")
            } else {
                digits.replace(',', "")
            }
        }
    };
    canonical.parse::<f64>().ok()
}

fn has_thousands_tail(digits: &str, sep: char) -> bool {
    digits
        .rsplit(sep)
        .next()
        .map(|tail| tail.len() == 3)
        .unwrap_or(false)
}
