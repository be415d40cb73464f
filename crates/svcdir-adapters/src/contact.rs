//! Contact detail pattern matching shared by extractors and ingestion.

use std::sync::LazyLock;

use regex::Regex;

static RE_PHONE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        (?:\+61\s*4|04)\d{2}[\s-]*\d{3}[\s-]*\d{3}           # mobile
        | (?:\(0[2378]\)|\+61\s*\(?[2378]\)?|0[2378])[\s-]*\d{4}[\s-]*\d{4}   # landline
        | 1[38]00[\s-]*\d{3}[\s-]*\d{3}                      # 1300 / 1800
        | \b13[\s-]*\d{2}[\s-]*\d{2}\b                       # 13 xx xx
        ",
    )
    .unwrap()
});

static RE_EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").unwrap()
});

static RE_POSTCODE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b\d{4}\b").unwrap());

/// First national-format phone number in `text`, rewritten to its canonical form.
pub fn find_phone(text: &str) -> Option<String> {
    RE_PHONE
        .find_iter(text)
        .find_map(|m| canonical_phone(m.as_str()))
}

/// Canonical spacing: `(07) 4747 3200`, `0412 345 678`, `1800 123 456`, `13 22 11`.
pub fn canonical_phone(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    let digits = match digits.strip_prefix("61") {
        Some(rest) if raw.trim_start().starts_with('+') => format!("0{rest}"),
        _ => digits,
    };

    match digits.len() {
        10 if digits.starts_with("04") => Some(format!(
            "{} {} {}",
            &digits[0..4],
            &digits[4..7],
            &digits[7..10]
        )),
        10 if digits.starts_with("1300") || digits.starts_with("1800") => Some(format!(
            "{} {} {}",
            &digits[0..4],
            &digits[4..7],
            &digits[7..10]
        )),
        10 if matches!(&digits[0..2], "02" | "03" | "07" | "08") => Some(format!(
            "({}) {} {}",
            &digits[0..2],
            &digits[2..6],
            &digits[6..10]
        )),
        6 if digits.starts_with("13") => Some(format!(
            "{} {} {}",
            &digits[0..2],
            &digits[2..4],
            &digits[4..6]
        )),
        _ => None,
    }
}

/// First RFC-plausible email address in `text`.
pub fn find_email(text: &str) -> Option<String> {
    RE_EMAIL.find(text).map(|m| m.as_str().to_string())
}

/// First four-digit postcode in `text`.
pub fn find_postcode(text: &str) -> Option<String> {
    RE_POSTCODE.find(text).map(|m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phones_are_found_and_canonicalized() {
        assert_eq!(
            find_phone("Call (07) 4747-3200 today").as_deref(),
            Some("(07) 4747 3200")
        );
        assert_eq!(
            find_phone("ph: 07 47473200").as_deref(),
            Some("(07) 4747 3200")
        );
        assert_eq!(
            find_phone("+61 7 4747 3200").as_deref(),
            Some("(07) 4747 3200")
        );
        assert_eq!(
            find_phone("mobile 0412 345 678").as_deref(),
            Some("0412 345 678")
        );
        assert_eq!(
            find_phone("Freecall 1800 020 080").as_deref(),
            Some("1800 020 080")
        );
        assert_eq!(find_phone("Centrelink 13 24 68").as_deref(), Some("13 24 68"));
        assert_eq!(find_phone("open 9 to 5, 4825"), None);
    }

    #[test]
    fn email_and_postcode_extraction() {
        assert_eq!(
            find_email("write to Info.Desk@health.qld.gov.au or visit").as_deref(),
            Some("Info.Desk@health.qld.gov.au")
        );
        assert_eq!(find_email("no address here"), None);
        assert_eq!(
            find_postcode("23 Miles St, Mount Isa QLD 4825").as_deref(),
            Some("4825")
        );
    }
}
