//! Multi-factor signature computation and the authorization header.
//!
//! For every factor included in a signature the engine derives a one-shot
//! signing key from the factor's signature key and the current counter
//! value, MACs the normalized request data with it and reduces the result
//! to an 8-digit decimal code. Codes are joined with `-` in the fixed
//! factor order: possession, knowledge, biometry.

use crate::error::{Error, Result};
use crate::memory::SecretKey;
use crate::{counter::CTR_DATA_LEN, crypto};
use data_encoding::{BASE64, BASE64_NOPAD};

/// Name of the HTTP authorization header carrying a signature.
pub const AUTH_HEADER_NAME: &str = "X-PowerAuth-Authorization";

/// Nonce length in bytes.
pub const NONCE_LEN: usize = 16;

// ---------------------------------------------------------------------------
// Request data
// ---------------------------------------------------------------------------

/// Data identifying one HTTP request to sign.
#[derive(Clone, Debug, Default)]
pub struct HttpRequestData {
    /// HTTP method; normalized to uppercase before signing.
    pub method: String,
    /// Server-assigned URI identifier for the endpoint.
    pub uri_identifier: String,
    /// Request body bytes, or the output of key-value normalization for GET
    /// requests. May be empty.
    pub body: Vec<u8>,
    /// Base64 nonce supplied by the caller for offline (QR code) signatures.
    /// When absent a fresh random nonce is generated.
    pub offline_nonce: Option<String>,
}

/// A computed request signature with everything needed to build the
/// authorization header.
#[derive(Clone, Debug)]
pub struct HttpRequestDataSignature {
    /// Activation identifier.
    pub activation_id: String,
    /// Application key from the session setup.
    pub application_key: String,
    /// Base64 of the nonce the signature was computed over.
    pub nonce: String,
    /// Factor combination string, e.g. `possession_knowledge`.
    pub factor: String,
    /// Decimal signature, 8 digits per factor joined by `-`.
    pub signature: String,
    /// Protocol version string, e.g. `3.1`.
    pub version: String,
}

impl HttpRequestDataSignature {
    /// Compose the full `X-PowerAuth-Authorization` header value. Field
    /// order is fixed by the protocol.
    #[must_use]
    pub fn auth_header_value(&self) -> String {
        format!(
            "PowerAuth pa_activation_id=\"{}\", pa_application_key=\"{}\", \
             pa_nonce=\"{}\", pa_signature_type=\"{}\", pa_signature=\"{}\", \
             pa_version=\"{}\"",
            self.activation_id,
            self.application_key,
            self.nonce,
            self.factor,
            self.signature,
            self.version
        )
    }
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Build the normalized byte sequence that gets signed.
///
/// Each component is Base64-encoded without padding and the components are
/// joined with `&`: uppercased method, URI identifier, nonce, body and the
/// application secret.
#[must_use]
pub fn normalize_signed_data(
    method: &str,
    uri_identifier: &str,
    nonce: &[u8; NONCE_LEN],
    body: &[u8],
    application_secret: &str,
) -> Vec<u8> {
    let components = [
        BASE64_NOPAD.encode(method.to_uppercase().as_bytes()),
        BASE64_NOPAD.encode(uri_identifier.as_bytes()),
        BASE64_NOPAD.encode(nonce),
        BASE64_NOPAD.encode(body),
        BASE64_NOPAD.encode(application_secret.as_bytes()),
    ];
    components.join("&").into_bytes()
}

/// Normalize GET parameters into a signable byte sequence.
///
/// Keys sort by their UTF-16 code units; keys and values are percent-encoded
/// with the RFC 3986 unreserved set preserved. Duplicate keys are not
/// supported and yield [`Error::WrongParam`].
pub fn normalize_key_value_map(pairs: &[(String, String)]) -> Result<Vec<u8>> {
    let mut sorted: Vec<&(String, String)> = pairs.iter().collect();
    sorted.sort_by(|a, b| a.0.encode_utf16().cmp(b.0.encode_utf16()));
    for window in sorted.windows(2) {
        if window[0].0 == window[1].0 {
            return Err(Error::WrongParam(format!(
                "duplicate GET parameter key: {}",
                window[0].0
            )));
        }
    }
    let encoded: Vec<String> = sorted
        .iter()
        .map(|(key, value)| format!("{}={}", url_encode(key), url_encode(value)))
        .collect();
    Ok(encoded.join("&").into_bytes())
}

/// Percent-encode with the RFC 3986 unreserved set preserved.
fn url_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(char::from(byte));
            }
            _ => {
                out.push('%');
                out.push_str(&format!("{byte:02X}"));
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Signature computation
// ---------------------------------------------------------------------------

/// Derive the one-shot signing key for a factor from its signature key and
/// the current counter value.
#[must_use]
pub fn derive_signature_key(factor_key: &SecretKey, ctr_data: &[u8; CTR_DATA_LEN]) -> SecretKey {
    let derived = crypto::hmac_sha256(factor_key.expose(), ctr_data);
    let mut truncated = [0u8; 16];
    truncated.copy_from_slice(&derived[..16]);
    SecretKey::new(truncated)
}

/// Reduce a MAC (or digest) to an 8-digit decimal code.
///
/// Takes the 4-byte chunk ending the input, masks the top bit and reduces
/// modulo 10^8; the result is zero-padded to 8 digits.
pub fn decimal_code(data: &[u8]) -> Result<String> {
    if data.len() < 4 {
        return Err(Error::WrongParam("decimal code needs at least 4 bytes".into()));
    }
    let offset = data.len() - 4;
    let chunk = u32::from_be_bytes([
        data[offset] & 0x7F,
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ]);
    Ok(format!("{:08}", chunk % 100_000_000))
}

/// Compute the decimal signature over normalized data.
///
/// `factor_keys` holds the unwrapped signature keys of the included factors
/// in the fixed order possession, knowledge, biometry.
pub fn compute_signature(
    factor_keys: &[SecretKey],
    ctr_data: &[u8; CTR_DATA_LEN],
    normalized_data: &[u8],
) -> Result<String> {
    if factor_keys.is_empty() {
        return Err(Error::WrongParam("no signature factor keys".into()));
    }
    let mut codes = Vec::with_capacity(factor_keys.len());
    for factor_key in factor_keys {
        let signature_key = derive_signature_key(factor_key, ctr_data);
        let component = crypto::hmac_sha256(signature_key.expose(), normalized_data);
        codes.push(decimal_code(&component)?);
    }
    Ok(codes.join("-"))
}

/// Base64-encode a nonce for the header and offline payloads.
#[must_use]
pub fn encode_nonce(nonce: &[u8; NONCE_LEN]) -> String {
    BASE64.encode(nonce)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CTR: [u8; CTR_DATA_LEN] = [0u8; CTR_DATA_LEN];

    fn factor_key(byte: u8) -> SecretKey {
        SecretKey::new([byte; 16])
    }

    #[test]
    fn normalized_data_has_five_nopad_components() {
        let nonce = [0xA5u8; NONCE_LEN];
        let data = normalize_signed_data("post", "/pa/signature/validate", &nonce, b"{}", "SECRET");
        let text = String::from_utf8(data).expect("ascii");
        let components: Vec<&str> = text.split('&').collect();
        assert_eq!(components.len(), 5);
        // Method was uppercased before encoding.
        assert_eq!(components[0], BASE64_NOPAD.encode(b"POST"));
        assert_eq!(components[2], BASE64_NOPAD.encode(&nonce));
        assert!(!text.contains('='), "components must not carry padding");
    }

    #[test]
    fn normalized_data_differs_per_nonce() {
        let a = normalize_signed_data("POST", "/x", &[1u8; 16], b"{}", "S");
        let b = normalize_signed_data("POST", "/x", &[2u8; 16], b"{}", "S");
        assert_ne!(a, b);
    }

    #[test]
    fn signature_is_deterministic() {
        let keys = [factor_key(1), factor_key(2)];
        let data = b"normalized";
        let a = compute_signature(&keys, &CTR, data).expect("sign");
        let b = compute_signature(&keys, &CTR, data).expect("sign");
        assert_eq!(a, b);
    }

    #[test]
    fn signature_shape_matches_factor_count() {
        let one = compute_signature(&[factor_key(1)], &CTR, b"data").expect("sign");
        let three = compute_signature(
            &[factor_key(1), factor_key(2), factor_key(3)],
            &CTR,
            b"data",
        )
        .expect("sign");
        assert_eq!(one.len(), 8);
        assert!(one.bytes().all(|c| c.is_ascii_digit()));
        assert_eq!(three.len(), 26);
        assert_eq!(three.matches('-').count(), 2);
    }

    #[test]
    fn signature_depends_on_data_counter_and_keys() {
        let keys = [factor_key(1)];
        let base = compute_signature(&keys, &CTR, b"data").expect("sign");
        assert_ne!(
            base,
            compute_signature(&keys, &CTR, b"datb").expect("sign"),
            "data must affect the signature"
        );
        assert_ne!(
            base,
            compute_signature(&keys, &[1u8; 16], b"data").expect("sign"),
            "counter must affect the signature"
        );
        assert_ne!(
            base,
            compute_signature(&[factor_key(9)], &CTR, b"data").expect("sign"),
            "factor key must affect the signature"
        );
    }

    #[test]
    fn signature_matches_manual_derivation() {
        // Recompute the single-factor path step by step through the facade.
        let key = factor_key(0x42);
        let data = b"normalized request";
        let signature_key = {
            let derived = crypto::hmac_sha256(key.expose(), &CTR);
            SecretKey::from_slice(&derived[..16]).expect("16 bytes")
        };
        let component = crypto::hmac_sha256(signature_key.expose(), data);
        let expected = decimal_code(&component).expect("code");
        let actual = compute_signature(&[key], &CTR, data).expect("sign");
        assert_eq!(actual, expected);
    }

    #[test]
    fn decimal_code_masks_high_bit() {
        // 0xFFFFFFFF → masked to 0x7FFFFFFF = 2147483647 → mod 1e8.
        let code = decimal_code(&[0xFF, 0xFF, 0xFF, 0xFF]).expect("code");
        assert_eq!(code, "47483647");
    }

    #[test]
    fn decimal_code_zero_pads() {
        let code = decimal_code(&[0, 0, 0, 42]).expect("code");
        assert_eq!(code, "00000042");
    }

    #[test]
    fn decimal_code_uses_trailing_chunk() {
        let code = decimal_code(&[9, 9, 9, 9, 0, 0, 0, 7]).expect("code");
        assert_eq!(code, "00000007");
    }

    #[test]
    fn decimal_code_rejects_short_input() {
        assert!(decimal_code(&[1, 2, 3]).is_err());
    }

    #[test]
    fn key_value_normalization_sorts_and_encodes() {
        let pairs = vec![
            ("zeta".to_owned(), "1".to_owned()),
            ("alpha".to_owned(), "hello world".to_owned()),
            ("beta".to_owned(), "a/b&c=d".to_owned()),
        ];
        let normalized = normalize_key_value_map(&pairs).expect("normalize");
        assert_eq!(
            String::from_utf8(normalized).expect("ascii"),
            "alpha=hello%20world&beta=a%2Fb%26c%3Dd&zeta=1"
        );
    }

    #[test]
    fn key_value_normalization_preserves_unreserved() {
        let pairs = vec![("k".to_owned(), "A-z_0.9~".to_owned())];
        let normalized = normalize_key_value_map(&pairs).expect("normalize");
        assert_eq!(normalized, b"k=A-z_0.9~");
    }

    #[test]
    fn key_value_normalization_rejects_duplicates() {
        let pairs = vec![
            ("key".to_owned(), "1".to_owned()),
            ("key".to_owned(), "2".to_owned()),
        ];
        assert!(matches!(
            normalize_key_value_map(&pairs),
            Err(Error::WrongParam(_))
        ));
    }

    #[test]
    fn key_value_normalization_encodes_utf8() {
        let pairs = vec![("k".to_owned(), "é".to_owned())];
        let normalized = normalize_key_value_map(&pairs).expect("normalize");
        assert_eq!(normalized, b"k=%C3%A9");
    }

    #[test]
    fn auth_header_field_order_is_fixed() {
        let signature = HttpRequestDataSignature {
            activation_id: "ID".into(),
            application_key: "APPKEY".into(),
            nonce: "Tk9OQ0U=".into(),
            factor: "possession_knowledge".into(),
            signature: "12345678-23456789".into(),
            version: "3.1".into(),
        };
        let header = signature.auth_header_value();
        assert!(header.starts_with("PowerAuth pa_activation_id=\"ID\""));
        let order = [
            "pa_activation_id",
            "pa_application_key",
            "pa_nonce",
            "pa_signature_type",
            "pa_signature",
            "pa_version",
        ];
        let mut last = 0;
        for field in order {
            let position = header.find(field).expect("field present");
            assert!(position > last || last == 0, "field {field} out of order");
            last = position;
        }
        assert!(header.ends_with("pa_version=\"3.1\""));
    }
}
