//! # Utilities Module
//!
//! This module contains helper functions and utilities used
//! across the backend service: identifier and secret generation,
//! money formatting, hashing, QR rendering and input checks.

use std::io::Cursor;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use image::{ImageFormat, Luma};
use qrcode::{EcLevel, QrCode};
use rand::distributions::Alphanumeric;
use rand::{Rng, RngCore};
use sha2::{Digest, Sha256};

// ============================================
// MONEY
// ============================================

/// Format paise as human-readable rupees.
///
/// ## Examples
///
/// ```rust,ignore
/// assert_eq!(format_inr(75_000), "₹750.00");
/// assert_eq!(format_inr(123_456_789), "₹1,234,567.89");
/// ```
pub fn format_inr(paise: i64) -> String {
    let sign = if paise < 0 { "-" } else { "" };
    let abs = paise.unsigned_abs();
    let whole = (abs / 100).to_string();

    // Add commas
    let mut grouped = String::new();
    for (i, c) in whole.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    let grouped: String = grouped.chars().rev().collect();

    format!("{}₹{}.{:02}", sign, grouped, abs % 100)
}

/// Amount field of a UPI payment reference: plain rupees with two decimals.
pub fn format_upi_amount(paise: i64) -> String {
    format!("{}.{:02}", paise / 100, (paise % 100).abs())
}

// ============================================
// IDENTIFIERS AND SECRETS
// ============================================

/// `TXN` + unix seconds + 8 random characters, uppercased.
///
/// The random suffix makes ids unique across concurrent creations within
/// the same second; the column is also `UNIQUE`.
pub fn generate_transaction_id(now: DateTime<Utc>) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    format!("TXN{}{}", now.timestamp(), suffix).to_uppercase()
}

/// 128-bit URL-safe opaque token.
pub fn generate_security_token() -> String {
    random_urlsafe(16)
}

/// 256-bit URL-safe bearer credential.
pub fn generate_session_token() -> String {
    random_urlsafe(32)
}

fn random_urlsafe(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Six-digit numeric login code.
pub fn generate_otp_code() -> String {
    rand::thread_rng().gen_range(100_000..=999_999).to_string()
}

// ============================================
// HASHING
// ============================================

/// Lowercase hex SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Constant-time string comparison.
///
/// Both inputs are padded to the same length with different fill bytes so
/// neither the content nor the length difference leaks through timing.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    use subtle::ConstantTimeEq;

    let max_len = a.len().max(b.len());
    let mut a_padded = vec![0u8; max_len];
    let mut b_padded = vec![0xFFu8; max_len];
    a_padded[..a.len()].copy_from_slice(a.as_bytes());
    b_padded[..b.len()].copy_from_slice(b.as_bytes());

    let lengths_equal = a.len().ct_eq(&b.len());
    let contents_equal = a_padded.ct_eq(&b_padded);
    (lengths_equal & contents_equal).into()
}

// ============================================
// QR CODES
// ============================================

/// Pixels per QR module.
const QR_MODULE_PX: u32 = 10;

/// Render `data` as a black-on-white PNG QR code.
///
/// Error correction level M with a 4-module quiet zone. The output is
/// deterministic for a given input.
pub fn render_qr_png(data: &str) -> Result<Vec<u8>, String> {
    let code = QrCode::with_error_correction_level(data.as_bytes(), EcLevel::M)
        .map_err(|e| format!("QR encoding failed: {}", e))?;
    let image = code
        .render::<Luma<u8>>()
        .module_dimensions(QR_MODULE_PX, QR_MODULE_PX)
        .quiet_zone(true)
        .build();

    let mut png = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .map_err(|e| format!("PNG encoding failed: {}", e))?;
    Ok(png)
}

// ============================================
// INPUT CHECKS
// ============================================

/// E.164 phone number: `+` then 8 to 15 digits, first digit non-zero.
pub fn validate_phone_number(phone: &str) -> Result<(), String> {
    let digits = phone
        .strip_prefix('+')
        .ok_or_else(|| "Phone number must start with '+' and a country code".to_string())?;

    if !(8..=15).contains(&digits.len()) {
        return Err(format!(
            "Phone number must have 8 to 15 digits, got {}",
            digits.len()
        ));
    }
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err("Phone number may only contain digits after '+'".to_string());
    }
    if digits.starts_with('0') {
        return Err("Country code cannot start with 0".to_string());
    }
    Ok(())
}

/// Keep the country prefix and last two digits for log lines.
pub fn mask_phone(phone: &str) -> String {
    let chars: Vec<char> = phone.chars().collect();
    if chars.len() <= 5 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..3].iter().collect();
    let tail: String = chars[chars.len() - 2..].iter().collect();
    format!("{}{}{}", head, "*".repeat(chars.len() - 5), tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_inr() {
        assert_eq!(format_inr(0), "₹0.00");
        assert_eq!(format_inr(75_000), "₹750.00");
        assert_eq!(format_inr(123_456_789), "₹1,234,567.89");
        assert_eq!(format_inr(-5), "-₹0.05");
    }

    #[test]
    fn test_format_upi_amount() {
        assert_eq!(format_upi_amount(75_050), "750.50");
        assert_eq!(format_upi_amount(9), "0.09");
    }

    #[test]
    fn test_render_qr_png() {
        let payload = "upi://pay?pa=sportsclub@upi&pn=SportsClub&am=750.00&cu=INR";
        let png = render_qr_png(payload).unwrap();
        assert_eq!(&png[..8], b"\x89PNG\r\n\x1a\n");
        assert_eq!(png, render_qr_png(payload).unwrap());
        assert_ne!(png, render_qr_png("upi://pay?pa=other@upi").unwrap());
    }

    #[test]
    fn test_transaction_id_shape() {
        let now: DateTime<Utc> = "2030-01-01T00:00:00Z".parse().unwrap();
        let id = generate_transaction_id(now);
        assert!(id.starts_with(&format!("TXN{}", now.timestamp())));
        assert_eq!(id.len(), 3 + 10 + 8);
        assert_eq!(id, id.to_uppercase());
        assert_ne!(id, generate_transaction_id(now));
    }

    #[test]
    fn test_tokens_are_urlsafe_and_distinct() {
        let a = generate_security_token();
        let b = generate_security_token();
        assert_ne!(a, b);
        assert_eq!(a.len(), 22);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn test_otp_code_is_six_digits() {
        for _ in 0..50 {
            let code = generate_otp_code();
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("token", "token"));
        assert!(!constant_time_eq("token", "tokem"));
        assert!(!constant_time_eq("token", "token2"));
        assert!(!constant_time_eq("", "a"));
        assert!(constant_time_eq("", ""));
    }

    #[test]
    fn test_validate_phone_number() {
        assert!(validate_phone_number("+919876543210").is_ok());
        assert!(validate_phone_number("919876543210").is_err());
        assert!(validate_phone_number("+91 98765").is_err());
        assert!(validate_phone_number("+0123456789").is_err());
        assert!(validate_phone_number("+1234567").is_err());
    }

    #[test]
    fn test_mask_phone() {
        assert_eq!(mask_phone("+919876543210"), "+91********10");
        assert_eq!(mask_phone("+12"), "***");
    }
}
