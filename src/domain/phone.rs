use super::errors::DomainError;

pub const COUNTRY_CODE: &str = "254";
const NATIONAL_LEN: usize = 9;

/// Normalizes a Kenyan mobile number to its international form, `2547XXXXXXXX`
/// or `2541XXXXXXXX`.
///
/// Accepts `0712 345 678`, `+254 712 345 678`, `712345678` and friends. Every
/// non-digit is dropped before the prefix is inspected.
pub fn normalize_msisdn(raw: &str) -> Result<String, DomainError> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    let national = if let Some(rest) = digits.strip_prefix(COUNTRY_CODE) {
        rest
    } else if let Some(rest) = digits.strip_prefix('0') {
        rest
    } else {
        digits.as_str()
    };
    let valid = national.len() == NATIONAL_LEN && matches!(national.chars().next(), Some('7' | '1'));
    if !valid {
        return Err(DomainError::InvalidPhoneNumber(raw.to_string()));
    }
    Ok(format!("{COUNTRY_CODE}{national}"))
}

/// The national part of an already-normalized number.
pub fn national_number(msisdn: &str) -> &str {
    msisdn.strip_prefix(COUNTRY_CODE).unwrap_or(msisdn)
}
