use chrono::NaiveDate;

use crate::errors::DomainError;

const PERSONAL_ID_CHECK_CHARS: &[u8; 31] = b"0123456789ABCDEFHJKLMNPRSTUVWXY";

pub fn require_text(field: &str, value: &str) -> Result<(), DomainError> {
    if value.trim().is_empty() {
        return Err(DomainError::validation(format!("{field} must not be blank")));
    }
    Ok(())
}

/// Strips every whitespace character, the form used to compare payee identities.
pub fn normalize_identity(value: &str) -> String {
    value.chars().filter(|ch| !ch.is_whitespace()).collect()
}

/// ISO 13616 check: country code, two check digits, and a mod-97 remainder of 1.
pub fn validate_iban(raw: &str) -> Result<(), DomainError> {
    let iban = normalize_identity(raw).to_ascii_uppercase();
    let invalid = || DomainError::validation(format!("iban `{raw}` is not valid"));

    if !(15..=34).contains(&iban.len()) || !iban.is_ascii() {
        return Err(invalid());
    }
    let bytes = iban.as_bytes();
    if !bytes[..2].iter().all(u8::is_ascii_uppercase) || !bytes[2..4].iter().all(u8::is_ascii_digit)
    {
        return Err(invalid());
    }

    let mut remainder: u32 = 0;
    for &byte in bytes[4..].iter().chain(&bytes[..4]) {
        let value = match byte {
            b'0'..=b'9' => u32::from(byte - b'0'),
            b'A'..=b'Z' => u32::from(byte - b'A') + 10,
            _ => return Err(invalid()),
        };
        remainder = if value >= 10 {
            (remainder * 100 + value) % 97
        } else {
            (remainder * 10 + value) % 97
        };
    }

    if remainder == 1 {
        Ok(())
    } else {
        Err(invalid())
    }
}

/// Finnish personal identity code `DDMMYYCNNNQ`.
pub fn validate_personal_id(raw: &str) -> Result<(), DomainError> {
    let code = raw.trim().to_ascii_uppercase();
    let invalid = || DomainError::validation(format!("government id `{raw}` is not valid"));

    let bytes = code.as_bytes();
    if bytes.len() != 11 || !code.is_ascii() {
        return Err(invalid());
    }

    let digits = |range: std::ops::Range<usize>| -> Option<u32> {
        let part = &code[range];
        if part.bytes().all(|b| b.is_ascii_digit()) {
            part.parse().ok()
        } else {
            None
        }
    };

    let century = match bytes[6] {
        b'+' => 1800,
        b'-' | b'Y' | b'X' | b'W' | b'V' | b'U' => 1900,
        b'A' | b'B' | b'C' | b'D' | b'E' | b'F' => 2000,
        _ => return Err(invalid()),
    };

    let (Some(day), Some(month), Some(year), Some(individual)) =
        (digits(0..2), digits(2..4), digits(4..6), digits(7..10))
    else {
        return Err(invalid());
    };

    let year = century + year as i32;
    if NaiveDate::from_ymd_opt(year, month, day).is_none() {
        return Err(invalid());
    }
    if !(2..=899).contains(&individual) {
        return Err(invalid());
    }

    let number = day * 10_000_000 + month * 100_000 + (year as u32 % 100) * 1000 + individual;
    let expected = PERSONAL_ID_CHECK_CHARS[(number % 31) as usize];
    if bytes[10] != expected {
        return Err(invalid());
    }
    Ok(())
}
