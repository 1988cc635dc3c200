//! Identity normalization helpers shared by registration, login and profile updates.

use rand::prelude::RngExt;
use rand::rng;

/// Country code stripped from stored phone numbers.
const COUNTRY_CODE: &str = "237";

/// Usernames are case-insensitive and stored lower-cased.
pub fn normalize_username(username: &str) -> String {
    username.trim().to_lowercase()
}

/// Strips the country code from 12-digit numbers so that phones are stored in their 9-digit
/// national form. Spaces, dashes and a leading `+` are dropped.
pub fn normalize_phone(phone: &str) -> String {
    let digits: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() == 12 && digits.starts_with(COUNTRY_CODE) {
        digits[COUNTRY_CODE.len()..].to_string()
    } else {
        digits
    }
}

/// Shallow email check: one `@`, a non-empty local part and a dotted domain.
pub fn looks_like_email(value: &str) -> bool {
    let Some((local, domain)) = value.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !value.contains(char::is_whitespace)
}

/// Address stored for members who registered without an email.
pub fn placeholder_email(username: &str) -> String {
    format!("__{username}__@ikwen.com")
}

/// First token of the first name followed by the first token of the last name.
pub fn compose_full_name(first_name: &str, last_name: &str) -> String {
    let first = first_name.split_whitespace().next().unwrap_or_default();
    let last = last_name.split_whitespace().next().unwrap_or_default();
    format!("{first} {last}").trim().to_string()
}

/// Six-digit code sent by SMS for password recovery.
pub fn generate_sms_code() -> String {
    let code: u32 = rng().random_range(0..1_000_000);
    format!("{code:06}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_phone() {
        assert_eq!(normalize_phone("237677000001"), "677000001");
        assert_eq!(normalize_phone("+237 677-00-00-01"), "677000001");
        assert_eq!(normalize_phone("677000001"), "677000001");
        // Only 12-digit numbers carry the country code
        assert_eq!(normalize_phone("23767700000"), "23767700000");
    }

    #[test]
    fn test_full_name_keeps_first_tokens() {
        assert_eq!(compose_full_name("Jean Pierre", "Mbarga Essomba"), "Jean Mbarga");
        assert_eq!(compose_full_name("Roger", ""), "Roger");
    }

    #[test]
    fn test_email_detection() {
        assert!(looks_like_email("roger@ikwen.com"));
        assert!(!looks_like_email("roger"));
        assert!(!looks_like_email("roger@localhost"));
        assert!(!looks_like_email("ro ger@ikwen.com"));
    }

    #[test]
    fn test_username_lowercased() {
        assert_eq!(normalize_username("  Roger@Ikwen.com "), "roger@ikwen.com");
        assert_eq!(placeholder_email("roger"), "__roger__@ikwen.com");
    }

    #[test]
    fn test_sms_code_has_six_digits() {
        for _ in 0..20 {
            let code = generate_sms_code();
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }
}
