//! Secret byte containers.
//!
//! Every unwrapped factor key, vault key, shared secret and password byte
//! sequence in this crate travels inside one of these wrappers:
//! - [`SecretBytes`] — variable-length, zeroized on drop, masked `Debug`
//! - [`SecretKey`] — fixed 16-byte protocol key, zeroized on drop
//!
//! Both mask their content in `Debug`/`Display` output and compare in
//! constant time.

use secrecy::{ExposeSecret, SecretSlice};
use std::fmt;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of every symmetric protocol key (signature keys, KEKs, EEK, vault key).
pub const KEY_LEN: usize = 16;

// ---------------------------------------------------------------------------
// SecretBytes — variable-length
// ---------------------------------------------------------------------------

/// Variable-length buffer for sensitive data, zeroized on drop.
pub struct SecretBytes {
    inner: SecretSlice<u8>,
}

impl SecretBytes {
    /// Copy `data` into a new secret buffer. The caller should zeroize the
    /// source afterwards.
    #[must_use]
    pub fn new(data: &[u8]) -> Self {
        Self {
            inner: data.to_vec().into(),
        }
    }

    /// Take ownership of an existing buffer without copying.
    #[must_use]
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { inner: data.into() }
    }

    /// Expose the underlying bytes for a cryptographic operation. Keep the
    /// borrow short-lived.
    #[must_use]
    pub fn expose(&self) -> &[u8] {
        self.inner.expose_secret()
    }

    /// Number of bytes in the buffer.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.expose_secret().len()
    }

    /// `true` if the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Constant-time equality. Buffers of different length compare unequal
    /// without inspecting content.
    #[must_use]
    pub fn ct_eq(&self, other: &Self) -> bool {
        let a = self.expose();
        let b = other.expose();
        a.len() == b.len() && bool::from(a.ct_eq(b))
    }
}

impl Clone for SecretBytes {
    fn clone(&self) -> Self {
        Self::new(self.expose())
    }
}

impl fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretBytes(***)")
    }
}

impl fmt::Display for SecretBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretBytes(***)")
    }
}

// ---------------------------------------------------------------------------
// SecretKey — fixed 16 bytes
// ---------------------------------------------------------------------------

/// A 16-byte symmetric protocol key, zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey {
    bytes: [u8; KEY_LEN],
}

impl SecretKey {
    /// Wrap a fixed-size array. The input is moved, no copy remains.
    #[must_use]
    pub fn new(bytes: [u8; KEY_LEN]) -> Self {
        Self { bytes }
    }

    /// Build a key from a slice.
    ///
    /// Returns `None` when the slice is not exactly 16 bytes.
    #[must_use]
    pub fn from_slice(data: &[u8]) -> Option<Self> {
        let bytes: [u8; KEY_LEN] = data.try_into().ok()?;
        Some(Self { bytes })
    }

    /// Expose the key bytes for a cryptographic operation.
    #[must_use]
    pub fn expose(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }

    /// `true` when every byte is zero. Zero-filled keys are rejected as
    /// factor unlock keys.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        // Not constant-time on purpose: this guards against a caller bug
        // (an uninitialized buffer), not against an attacker.
        self.bytes.iter().all(|&b| b == 0)
    }

    /// Constant-time equality.
    #[must_use]
    pub fn ct_eq(&self, other: &Self) -> bool {
        bool::from(self.bytes.ct_eq(&other.bytes))
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(***)")
    }
}

impl From<[u8; KEY_LEN]> for SecretKey {
    fn from(bytes: [u8; KEY_LEN]) -> Self {
        Self::new(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_bytes_roundtrip_and_len() {
        let buf = SecretBytes::new(b"factor key material");
        assert_eq!(buf.expose(), b"factor key material");
        assert_eq!(buf.len(), 19);
        assert!(!buf.is_empty());
    }

    #[test]
    fn secret_bytes_debug_is_masked() {
        let buf = SecretBytes::new(b"top secret");
        assert_eq!(format!("{buf:?}"), "SecretBytes(***)");
        assert_eq!(format!("{buf}"), "SecretBytes(***)");
    }

    #[test]
    fn secret_bytes_ct_eq() {
        let a = SecretBytes::new(b"same");
        let b = SecretBytes::new(b"same");
        let c = SecretBytes::new(b"different");
        assert!(a.ct_eq(&b));
        assert!(!a.ct_eq(&c));
    }

    #[test]
    fn secret_bytes_different_lengths_unequal() {
        let a = SecretBytes::new(b"abc");
        let b = SecretBytes::new(b"abcd");
        assert!(!a.ct_eq(&b));
    }

    #[test]
    fn secret_key_from_slice_enforces_length() {
        assert!(SecretKey::from_slice(&[0x42; 16]).is_some());
        assert!(SecretKey::from_slice(&[0x42; 15]).is_none());
        assert!(SecretKey::from_slice(&[0x42; 17]).is_none());
    }

    #[test]
    fn secret_key_zero_detection() {
        assert!(SecretKey::new([0; 16]).is_zero());
        assert!(!SecretKey::new([1; 16]).is_zero());
    }

    #[test]
    fn secret_key_debug_is_masked() {
        let key = SecretKey::new([0xFF; 16]);
        let debug = format!("{key:?}");
        assert_eq!(debug, "SecretKey(***)");
        assert!(!debug.contains("255"));
    }

    #[test]
    fn secret_key_ct_eq() {
        let a = SecretKey::new([0xAB; 16]);
        let b = SecretKey::new([0xAB; 16]);
        let c = SecretKey::new([0xAC; 16]);
        assert!(a.ct_eq(&b));
        assert!(!a.ct_eq(&c));
    }
}
