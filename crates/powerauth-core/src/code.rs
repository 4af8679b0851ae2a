//! Activation & recovery code parsing and validation.
//!
//! A code has the form `XXXXX-XXXXX-XXXXX-XXXXX` where `X` is a character of
//! the RFC 4648 Base32 alphabet (`A–Z`, `2–7`). The 20 alphabet characters
//! decode to 12 bytes; the last two bytes are a CRC-16/ARC checksum over the
//! first ten. An activation code may carry a detached ECDSA signature after
//! a `#` separator; a recovery code may be prefixed with `R:` and must never
//! carry a signature.

use crate::error::{Error, Result};
use data_encoding::{BASE32_NOPAD, BASE64};

/// Length of a formatted code including dashes.
const CODE_LEN: usize = 23;

/// Number of Base32 characters in a code (dashes stripped).
const CODE_BASE32_LEN: usize = 20;

/// Decoded code length: 10 payload bytes + 2 checksum bytes.
const CODE_BYTES_LEN: usize = 12;

/// Recovery codes scanned from a QR carry this prefix.
const RECOVERY_PREFIX: &str = "R:";

/// Required PUK length in digits.
const PUK_LEN: usize = 10;

/// A parsed activation or recovery code.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActivationCode {
    /// The validated `XXXXX-XXXXX-XXXXX-XXXXX` code.
    pub activation_code: String,
    /// Optional detached ECDSA signature (Base64), present only when the
    /// input contained a `#` separator.
    pub activation_signature: Option<String>,
}

impl ActivationCode {
    /// `true` when the code carries a detached signature.
    #[must_use]
    pub fn has_signature(&self) -> bool {
        self.activation_signature.is_some()
    }
}

/// Parse an activation code, optionally followed by `#<Base64 signature>`.
pub fn parse_activation_code(input: &str) -> Result<ActivationCode> {
    let (code, signature) = match input.split_once('#') {
        Some((code, signature)) => {
            if !is_valid_signature(signature) {
                return Err(Error::WrongCode);
            }
            (code, Some(signature.to_owned()))
        }
        None => (input, None),
    };
    if !validate_activation_code(code) {
        return Err(Error::WrongCode);
    }
    Ok(ActivationCode {
        activation_code: code.to_owned(),
        activation_signature: signature,
    })
}

/// Parse a recovery code, optionally prefixed with `R:`.
///
/// A recovery code must not carry a signature; the `R:` marker is accepted
/// only at the very beginning of the input.
pub fn parse_recovery_code(input: &str) -> Result<ActivationCode> {
    let code = match input.find(RECOVERY_PREFIX) {
        Some(0) => &input[RECOVERY_PREFIX.len()..],
        Some(_) => return Err(Error::WrongCode),
        None => input,
    };
    let parsed = parse_activation_code(code)?;
    if parsed.has_signature() {
        return Err(Error::WrongCode);
    }
    Ok(parsed)
}

/// Validate the `XXXXX-XXXXX-XXXXX-XXXXX` shape, the Base32 alphabet and the
/// CRC-16 checksum.
#[must_use]
pub fn validate_activation_code(code: &str) -> bool {
    if code.len() != CODE_LEN || !code.is_ascii() {
        return false;
    }
    let mut base32 = String::with_capacity(CODE_BASE32_LEN);
    for (i, c) in code.bytes().enumerate() {
        if i % 6 == 5 {
            if c != b'-' {
                return false;
            }
        } else if validate_typed_character(u32::from(c)) {
            base32.push(char::from(c));
        } else {
            return false;
        }
    }
    let Ok(bytes) = BASE32_NOPAD.decode(base32.as_bytes()) else {
        return false;
    };
    validate_code_bytes(&bytes)
}

/// Validate a recovery code without parsing it. The `R:` prefix is accepted
/// only when `allow_r_prefix` is set.
#[must_use]
pub fn validate_recovery_code(code: &str, allow_r_prefix: bool) -> bool {
    match code.find(RECOVERY_PREFIX) {
        None => validate_activation_code(code),
        Some(0) => allow_r_prefix && validate_activation_code(&code[RECOVERY_PREFIX.len()..]),
        Some(_) => false,
    }
}

/// Validate a recovery PUK: exactly ten ASCII digits.
#[must_use]
pub fn validate_recovery_puk(puk: &str) -> bool {
    puk.len() == PUK_LEN && puk.bytes().all(|c| c.is_ascii_digit())
}

/// `true` when `c` belongs to the code alphabet (`A–Z`, `2–7`).
#[must_use]
pub fn validate_typed_character(c: u32) -> bool {
    (c >= u32::from(b'A') && c <= u32::from(b'Z'))
        || (c >= u32::from(b'2') && c <= u32::from(b'7'))
}

/// Validate and auto-correct a manually typed character.
///
/// Lowercase letters are uppercased, `0` becomes `O` and `1` becomes `I` to
/// smooth over the most common typing mistakes. Returns `0` for characters
/// that cannot be corrected, so an entry widget can reject the keystroke.
#[must_use]
pub fn validate_and_correct_typed_character(c: u32) -> u32 {
    if validate_typed_character(c) {
        return c;
    }
    if c >= u32::from(b'a') && c <= u32::from(b'z') {
        return c - (u32::from(b'a') - u32::from(b'A'));
    }
    if c == u32::from(b'0') {
        return u32::from(b'O');
    }
    if c == u32::from(b'1') {
        return u32::from(b'I');
    }
    0
}

/// A detached signature must be non-empty Base64 decoding to non-empty bytes.
fn is_valid_signature(signature: &str) -> bool {
    match BASE64.decode(signature.as_bytes()) {
        Ok(bytes) => !bytes.is_empty(),
        Err(_) => false,
    }
}

/// Check that decoded code bytes carry a valid CRC-16 trailer.
fn validate_code_bytes(bytes: &[u8]) -> bool {
    if bytes.len() != CODE_BYTES_LEN {
        return false;
    }
    let expected = u16::from_be_bytes([bytes[10], bytes[11]]);
    crc16_arc(&bytes[..10]) == expected
}

/// CRC-16/ARC: reflected polynomial `0xA001`, zero initial value.
#[must_use]
pub fn crc16_arc(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 1 == 1 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Format ten payload bytes as an activation code, appending the CRC-16
/// trailer. The inverse of decoding a valid code.
#[must_use]
pub fn format_code_bytes(payload: &[u8; 10]) -> String {
    let mut bytes = [0u8; CODE_BYTES_LEN];
    bytes[..10].copy_from_slice(payload);
    bytes[10..].copy_from_slice(&crc16_arc(payload).to_be_bytes());
    let base32 = BASE32_NOPAD.encode(&bytes);
    let mut out = String::with_capacity(CODE_LEN);
    for (i, c) in base32.chars().enumerate() {
        if i > 0 && i % 5 == 0 {
            out.push('-');
        }
        out.push(c);
    }
    out
}
