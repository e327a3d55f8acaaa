//! Parsing helpers shared across specialized factories: name splitting,
//! phone/SSN normalization, gender mapping, and lenient date parsing.

use chrono::NaiveDate;

/// Splits a free-text patient name into `(family, given)`. "Last, First
/// Mid" splits on the comma; otherwise the last whitespace-separated token
/// is treated as family and the rest as given names.
pub fn split_name(raw: &str) -> (String, Vec<String>) {
    let raw = raw.trim();
    if let Some((last, first)) = raw.split_once(',') {
        let given: Vec<String> =
            first.split_whitespace().map(str::to_string).filter(|s| !s.is_empty()).collect();
        return (last.trim().to_string(), given);
    }
    let mut parts: Vec<&str> = raw.split_whitespace().collect();
    if parts.is_empty() {
        return (String::new(), Vec::new());
    }
    let family = parts.pop().unwrap().to_string();
    (family, parts.into_iter().map(str::to_string).collect())
}

/// Maps free-text gender input to FHIR's `male|female|other|unknown`.
pub fn normalize_gender(raw: &str) -> &'static str {
    match raw.trim().to_lowercase().as_str() {
        "m" | "male" | "man" => "male",
        "f" | "female" | "woman" => "female",
        "o" | "other" => "other",
        _ => "unknown",
    }
}

/// Extracts digits from an SSN-like string and reformats as `XXX-XX-XXXX`.
/// Returns `None` (logged, not fatal) when fewer than 9 digits are found.
pub fn normalize_ssn(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if digits.len() != 9 {
        tracing::warn!(raw, "could not normalize SSN: expected 9 digits");
        return None;
    }
    Some(format!("{}-{}-{}", &digits[0..3], &digits[3..5], &digits[5..9]))
}

/// Normalizes a phone number to US conventions based on digit count.
pub fn normalize_phone(raw: &str) -> String {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    match digits.len() {
        10 => format!(
            "({}) {}-{}",
            &digits[0..3],
            &digits[3..6],
            &digits[6..10]
        ),
        11 if digits.starts_with('1') => format!(
            "+1 ({}) {}-{}",
            &digits[1..4],
            &digits[4..7],
            &digits[7..11]
        ),
        _ => format!("+{digits}"),
    }
}

const DATE_FORMATS: &[&str] =
    &["%Y-%m-%d", "%m/%d/%Y", "%m-%d-%Y", "%d/%m/%Y", "%B %d, %Y", "%b %d, %Y", "%Y/%m/%d"];

/// Parses a birth date through an explicit list of accepted input
/// patterns, always normalizing to `YYYY-MM-DD`.
pub fn parse_flexible_date(raw: &str) -> Option<String> {
    let raw = raw.trim();
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(raw, format) {
            return Some(date.format("%Y-%m-%d").to_string());
        }
    }
    None
}

/// Keyword-based classification: returns the first table entry whose
/// keyword appears (case-insensitive) in `haystack`, else `default`.
pub fn classify_by_keyword<'a>(haystack: &str, table: &[(&'a str, &'a str)], default: &'a str) -> &'a str {
    let haystack = haystack.to_lowercase();
    for (keyword, value) in table {
        if haystack.contains(&keyword.to_lowercase()) {
            return value;
        }
    }
    default
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_last_first_on_comma() {
        assert_eq!(split_name("Doe, John Michael"), ("Doe".to_string(), vec!["John".to_string(), "Michael".to_string()]));
    }

    #[test]
    fn splits_plain_name_on_last_token() {
        assert_eq!(split_name("John Michael Doe"), ("Doe".to_string(), vec!["John".to_string(), "Michael".to_string()]));
    }

    #[test]
    fn normalizes_ten_digit_phone() {
        assert_eq!(normalize_phone("5551234567"), "(555) 123-4567");
    }

    #[test]
    fn normalizes_eleven_digit_phone_with_leading_one() {
        assert_eq!(normalize_phone("15551234567"), "+1 (555) 123-4567");
    }

    #[test]
    fn normalizes_ssn_to_dashed_form() {
        assert_eq!(normalize_ssn("123-45-6789"), Some("123-45-6789".to_string()));
        assert_eq!(normalize_ssn("123456789"), Some("123-45-6789".to_string()));
    }

    #[test]
    fn rejects_short_ssn() {
        assert_eq!(normalize_ssn("123"), None);
    }

    #[test]
    fn parses_several_date_formats() {
        assert_eq!(parse_flexible_date("1990-05-02"), Some("1990-05-02".to_string()));
        assert_eq!(parse_flexible_date("05/02/1990"), Some("1990-05-02".to_string()));
    }
}
