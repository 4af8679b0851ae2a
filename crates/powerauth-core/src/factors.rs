//! Signature factors and the protected signature-key bundle.
//!
//! Each authentication factor owns a 16-byte key-encryption key (KEK):
//! - possession — caller supplied, bound to the device
//! - knowledge — PBKDF2-HMAC-SHA1 of the user password with a per-session salt
//! - biometry — caller supplied, created at biometry enrollment
//!
//! The signature keys themselves are stored wrapped: AES-CBC under the
//! factor KEK with a zero IV, optionally enclosed in one more AES-CBC layer
//! under the external encryption key (EEK). Transport and the signature
//! key-encryption key ride under the possession KEK, which is why possession
//! is required for nearly every stateful operation.

use crate::crypto::{self, ZERO_IV};
use crate::error::{Error, Result};
use crate::memory::{SecretKey, KEY_LEN};
use crate::password::{Password, MIN_PASSWORD_LEN};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

/// PBKDF2 iteration count for the knowledge KEK.
pub const PBKDF2_ITERATIONS: u32 = 10_000;

/// Length of the per-session PBKDF2 salt.
pub const PBKDF2_SALT_LEN: usize = 16;

// ---------------------------------------------------------------------------
// Factor bitmask
// ---------------------------------------------------------------------------

/// A combination of signature factors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SignatureFactor(u8);

impl SignatureFactor {
    /// Device possession.
    pub const POSSESSION: Self = Self(1);
    /// User knowledge (password or PIN).
    pub const KNOWLEDGE: Self = Self(2);
    /// Biometry.
    pub const BIOMETRY: Self = Self(4);

    /// Combine with another factor.
    #[must_use]
    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// `true` when `other` is included in this combination.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// The wire representation of the factor combination.
    ///
    /// Order is fixed: possession, knowledge, biometry. Combinations without
    /// the possession factor are not valid signature types.
    pub fn factor_string(self) -> Result<&'static str> {
        match self.0 {
            1 => Ok("possession"),
            3 => Ok("possession_knowledge"),
            5 => Ok("possession_biometry"),
            7 => Ok("possession_knowledge_biometry"),
            _ => Err(Error::WrongParam("invalid signature factor combination".into())),
        }
    }
}

// ---------------------------------------------------------------------------
// Unlock keys
// ---------------------------------------------------------------------------

/// Factor unlock material provided by the caller for a single operation.
///
/// The keys are borrowed for the duration of the operation and never
/// retained by the session.
#[derive(Default)]
pub struct SignatureUnlockKeys {
    /// Device-bound possession unlock key (16 bytes, non-zero).
    pub possession_unlock_key: Option<SecretKey>,
    /// User password for the knowledge factor.
    pub user_password: Option<Password>,
    /// Biometry unlock key (16 bytes, non-zero).
    pub biometry_unlock_key: Option<SecretKey>,
}

impl SignatureUnlockKeys {
    /// Possession-only unlock keys, the common case for status decoding and
    /// vault operations.
    #[must_use]
    pub fn possession(key: SecretKey) -> Self {
        Self {
            possession_unlock_key: Some(key),
            user_password: None,
            biometry_unlock_key: None,
        }
    }

    /// Possession plus knowledge, the usual signing combination.
    #[must_use]
    pub fn possession_with_password(key: SecretKey, password: Password) -> Self {
        Self {
            possession_unlock_key: Some(key),
            user_password: Some(password),
            biometry_unlock_key: None,
        }
    }
}

/// Derive the possession KEK from caller-supplied material.
pub fn possession_kek(keys: &SignatureUnlockKeys) -> Result<SecretKey> {
    external_kek(keys.possession_unlock_key.as_ref(), "possession unlock key")
}

/// Derive the biometry KEK from caller-supplied material.
pub fn biometry_kek(keys: &SignatureUnlockKeys) -> Result<SecretKey> {
    external_kek(keys.biometry_unlock_key.as_ref(), "biometry unlock key")
}

/// Derive the knowledge KEK from the user password and the per-session salt.
///
/// The password must hold at least [`MIN_PASSWORD_LEN`] bytes.
pub fn knowledge_kek(password: &Password, salt: &[u8]) -> Result<SecretKey> {
    if password.as_bytes().len() < MIN_PASSWORD_LEN {
        return Err(Error::WrongParam("password is too short".into()));
    }
    let mut derived = crypto::pbkdf2_sha1(password.as_bytes(), salt, PBKDF2_ITERATIONS, KEY_LEN)?;
    let key = SecretKey::from_slice(&derived).ok_or(Error::Encryption);
    derived.zeroize();
    key
}

fn external_kek(key: Option<&SecretKey>, what: &str) -> Result<SecretKey> {
    let key = key.ok_or_else(|| Error::WrongParam(format!("missing {what}")))?;
    if key.is_zero() {
        return Err(Error::WrongParam(format!("zero-filled {what}")));
    }
    Ok(key.clone())
}

// ---------------------------------------------------------------------------
// Key wrapping
// ---------------------------------------------------------------------------

/// Wrap a 16-byte signature key under a factor KEK, adding the EEK layer
/// when one is in use.
pub fn wrap_key(key: &SecretKey, kek: &SecretKey, eek: Option<&SecretKey>) -> Result<Vec<u8>> {
    let inner = crypto::aes_cbc_encrypt(kek.expose(), &ZERO_IV, key.expose())?;
    match eek {
        Some(eek) => crypto::aes_cbc_encrypt(eek.expose(), &ZERO_IV, &inner),
        None => Ok(inner),
    }
}

/// Unwrap a signature key: peel the EEK layer first, then the factor KEK.
/// Any padding error surfaces as the opaque [`Error::Encryption`].
pub fn unwrap_key(wrapped: &[u8], kek: &SecretKey, eek: Option<&SecretKey>) -> Result<SecretKey> {
    let mut inner = match eek {
        Some(eek) => crypto::aes_cbc_decrypt(eek.expose(), &ZERO_IV, wrapped)?,
        None => wrapped.to_vec(),
    };
    let plain = crypto::aes_cbc_decrypt(kek.expose(), &ZERO_IV, &inner);
    inner.zeroize();
    let mut plain = plain?;
    let key = SecretKey::from_slice(&plain).ok_or(Error::Encryption);
    plain.zeroize();
    key
}

// ---------------------------------------------------------------------------
// Persistent bundle
// ---------------------------------------------------------------------------

/// The wrapped signature-key bundle stored in persistent data.
///
/// Slot contents (all wrapped, see module docs):
/// - `possession`, `knowledge`, `biometry` — per-factor signature keys
/// - `transport` — key protecting status blobs and the vault key transport,
///   wrapped under the possession KEK
/// - `signature_key_encryption` — reserved re-keying key, wrapped under the
///   possession KEK
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureKeysBlob {
    pub possession: Vec<u8>,
    pub knowledge: Vec<u8>,
    pub biometry: Option<Vec<u8>>,
    pub transport: Vec<u8>,
    pub signature_key_encryption: Vec<u8>,
}

impl SignatureKeysBlob {
    /// `true` when a biometry slot is present.
    #[must_use]
    pub fn has_biometry(&self) -> bool {
        self.biometry.is_some()
    }
}
