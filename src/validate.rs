use crate::error::{CoreError, CoreResult};
use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde_json::Value;

pub const MIN_PASSWORD_LEN: usize = 8;
pub const MAX_PASSWORD_LEN: usize = 128;

/// Local mobile numbers: `01` followed by an operator digit (0, 1, 2 or 5)
/// and eight more digits, e.g. `01012345678`.
pub fn phone(raw: &str) -> CoreResult<String> {
    let p: String = raw.chars().filter(|c| !c.is_whitespace() && *c != '-').collect();
    let digits_only = p.chars().all(|c| c.is_ascii_digit());
    let operator_ok = matches!(p.as_bytes().get(2), Some(b'0' | b'1' | b'2' | b'5'));
    if p.len() != 11 || !digits_only || !p.starts_with("01") || !operator_ok {
        return Err(CoreError::validation(
            "phone must be an 11-digit mobile number such as 01012345678",
        ));
    }
    Ok(p)
}

pub fn password(raw: &str) -> CoreResult<()> {
    let len = raw.chars().count();
    if len < MIN_PASSWORD_LEN {
        return Err(CoreError::validation(format!(
            "password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }
    if len > MAX_PASSWORD_LEN {
        return Err(CoreError::validation(format!(
            "password must be at most {} characters",
            MAX_PASSWORD_LEN
        )));
    }
    let has_letter = raw.chars().any(|c| c.is_alphabetic());
    let has_digit = raw.chars().any(|c| c.is_ascii_digit());
    if !has_letter || !has_digit {
        return Err(CoreError::validation(
            "password must contain at least one letter and one digit",
        ));
    }
    Ok(())
}

/// 14-digit national id whose last digit is a check digit over the first
/// thirteen with weights 1,2,1,2,...
pub fn national_id(raw: &str) -> CoreResult<String> {
    let id = raw.trim();
    if id.len() != 14 || !id.chars().all(|c| c.is_ascii_digit()) {
        return Err(CoreError::validation("national id must be exactly 14 digits"));
    }
    let digits: Vec<u32> = id.bytes().map(|b| u32::from(b - b'0')).collect();
    if digits[13] != national_id_check_digit(&digits[..13]) {
        return Err(CoreError::validation("national id check digit does not match"));
    }
    Ok(id.to_string())
}

pub fn national_id_check_digit(first13: &[u32]) -> u32 {
    let sum: u32 = first13
        .iter()
        .enumerate()
        .map(|(i, d)| d * if i % 2 == 0 { 1 } else { 2 })
        .sum();
    (10 - sum % 10) % 10
}

pub fn required_text(raw: &str, field: &str, max_len: usize) -> CoreResult<String> {
    let t = raw.trim();
    if t.is_empty() {
        return Err(CoreError::validation(format!("{} must not be empty", field)));
    }
    if t.chars().count() > max_len {
        return Err(CoreError::validation(format!(
            "{} length must be <= {}",
            field, max_len
        )));
    }
    Ok(t.to_string())
}

pub fn optional_text(raw: Option<&str>, field: &str, max_len: usize) -> CoreResult<Option<String>> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(t) => required_text(t, field, max_len).map(Some),
    }
}

pub fn date(raw: &str, field: &str) -> CoreResult<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| CoreError::validation(format!("{} must be YYYY-MM-DD", field)))
}

pub fn money(value: f64, field: &str) -> CoreResult<f64> {
    if !value.is_finite() || value < 0.0 {
        return Err(CoreError::validation(format!(
            "{} must be a non-negative amount",
            field
        )));
    }
    Ok(round_cents(value))
}

pub fn round_cents(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Deserialize request parameters into a typed, allow-listed struct. A
/// missing params object reads as `{}`.
pub fn from_json<T: DeserializeOwned>(value: &Value) -> CoreResult<T> {
    let empty = Value::Object(Default::default());
    let source = if value.is_null() { &empty } else { value };
    T::deserialize(source).map_err(|e| CoreError::validation(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    fn with_check_digit(first13: &str) -> String {
        let digits: Vec<u32> = first13.bytes().map(|b| u32::from(b - b'0')).collect();
        format!("{}{}", first13, national_id_check_digit(&digits))
    }

    #[test]
    fn national_id_check_digit_uses_alternating_weights() {
        // 2,9,0,0,1,0,1,0,1,2,3,4,5 weighted 1,2,1,2,...
        // 2+18+0+0+1+0+1+0+1+4+3+8+5 = 43 -> (10 - 3) % 10 = 7
        assert_eq!(national_id("29001010123457").expect("valid"), "29001010123457");
        assert!(national_id("29001010123450").is_err());
        // Sum divisible by ten yields a zero check digit.
        assert_eq!(national_id_check_digit(&[1, 2, 3, 0, 0, 0, 0, 0, 0, 0, 0, 0, 2]), 0);
        assert!(national_id("1230000000001").is_err());
        assert!(national_id("2900101012345a").is_err());
    }

    #[test]
    fn every_generated_id_round_trips() {
        for prefix in ["3000101012345", "2991231999999", "0000000000000"] {
            let id = with_check_digit(prefix);
            assert!(national_id(&id).is_ok(), "{}", id);
        }
    }

    #[test]
    fn phone_accepts_local_mobile_numbers() {
        assert_eq!(phone("01012345678").expect("valid"), "01012345678");
        assert_eq!(phone("0155 123-4567").expect("valid"), "01551234567");
        assert!(phone("01312345678").is_err());
        assert!(phone("0101234567").is_err());
        assert!(phone("+201012345678").is_err());
    }

    #[test]
    fn weak_passwords_are_rejected() {
        assert!(password("abc123").is_err());
        assert!(password("onlyletters").is_err());
        assert!(password("1234567890").is_err());
        assert!(password("lesson2024").is_ok());
    }

    #[test]
    fn unknown_fields_are_validation_errors() {
        #[derive(Debug, Deserialize)]
        #[serde(deny_unknown_fields)]
        struct Patch {
            #[allow(dead_code)]
            grade: Option<String>,
        }
        let e = from_json::<Patch>(&serde_json::json!({ "balance": 0 })).expect_err("rejected");
        assert_eq!(e.code(), "validation_error");
        assert!(e.to_string().contains("balance"), "{}", e);
        assert!(from_json::<Patch>(&Value::Null).is_ok());
    }

    #[test]
    fn money_rejects_negative_and_rounds_to_cents() {
        assert!(money(-1.0, "amount").is_err());
        assert!(money(f64::NAN, "amount").is_err());
        assert_eq!(money(10.006, "amount").expect("ok"), 10.01);
    }
}
