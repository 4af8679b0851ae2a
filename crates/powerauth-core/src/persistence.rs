//! Versioned binary codec for the session's persistent state.
//!
//! # Blob layout
//!
//! ```text
//! Magic (4 B) | Schema (1 B) | Payload Len (u32 LE) | Payload JSON | HMAC-SHA-256 (32 B)
//! ```
//!
//! The payload is the JSON serialization of `Option<PersistentData>` — only
//! structs with a fixed field order, so identical inputs always produce a
//! byte-identical blob. The trailer authenticates the schema byte, the
//! length prefix and the payload under a key derived from the application
//! secret; a mismatch means the blob was corrupted or belongs to a different
//! application and decodes to [`Error::WrongData`].

use crate::counter::{ProtocolVersion, SignatureCounter, CTR_DATA_LEN};
use crate::crypto;
use crate::error::{Error, Result};
use crate::factors::{SignatureKeysBlob, PBKDF2_SALT_LEN};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

/// Magic bytes identifying a serialized session state.
pub const MAGIC: &[u8; 4] = b"PAPD";

/// Current schema version. Older schemas remain readable two majors back.
pub const SCHEMA_VERSION: u8 = 1;

/// Oldest schema this build still decodes, two majors behind the current
/// one. With the schema history starting at 1 there is nothing older yet.
const OLDEST_SCHEMA_VERSION: u8 = 1;

/// Domain separation label for the integrity key.
const INTEGRITY_LABEL: &[u8] = b"persistent-data-mac";

/// HMAC-SHA-256 trailer length.
const MAC_LEN: usize = 32;

/// Fixed envelope overhead: magic + schema + length prefix + trailer.
const ENVELOPE_LEN: usize = 4 + 1 + 4 + MAC_LEN;

// ---------------------------------------------------------------------------
// Persistent data
// ---------------------------------------------------------------------------

/// Recovery credentials stored encrypted under a vault-derived key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryData {
    /// Recovery code in `XXXXX-XXXXX-XXXXX-XXXXX` form.
    pub recovery_code: String,
    /// Ten-digit PUK.
    pub puk: String,
}

/// The serialized heart of an activated session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentData {
    /// Server-assigned activation identifier.
    pub activation_id: String,
    /// Server public key, SEC1 compressed.
    pub server_public_key: Vec<u8>,
    /// Device public key, SEC1 uncompressed. Kept for fingerprint
    /// recomputation.
    pub device_public_key: Vec<u8>,
    /// Device private key, AES-CBC under the vault key.
    pub device_private_key_encrypted: Vec<u8>,
    /// Wrapped signature-key bundle.
    pub signature_keys: SignatureKeysBlob,
    /// Signature counter (numeric in V2, hash chain in V3).
    pub counter: SignatureCounter,
    /// Low byte of the number of counter advances, compared against the
    /// server-reported value during status decoding.
    pub counter_byte: u8,
    /// Per-session salt for the knowledge KEK.
    pub pbkdf2_salt: Vec<u8>,
    /// Protocol version the activation currently operates in.
    pub protocol_version: ProtocolVersion,
    /// Target version of an upgrade in progress.
    pub pending_upgrade_version: Option<ProtocolVersion>,
    /// Optional recovery credentials, AES-CBC under a vault-derived key.
    pub recovery_data_encrypted: Option<Vec<u8>>,
    /// When set, every factor-key wrap carries an additional EEK layer.
    pub eek_used: bool,
    /// Mirror of the last decoded status.
    pub failed_attempts: u8,
    /// Mirror of the last decoded status.
    pub max_failed_attempts: u8,
}

impl PersistentData {
    /// Structural invariants that hold for every activated session.
    fn validate(&self) -> Result<()> {
        if self.server_public_key.is_empty() != self.device_private_key_encrypted.is_empty() {
            return Err(Error::WrongData(
                "server key and device key must coexist".into(),
            ));
        }
        if self.pbkdf2_salt.len() != PBKDF2_SALT_LEN {
            return Err(Error::WrongData("invalid PBKDF2 salt length".into()));
        }
        match (&self.counter, self.protocol_version) {
            (SignatureCounter::Hash(data), ProtocolVersion::V3) => {
                // The type guarantees the length; keep the check close to the
                // invariant it documents.
                if data.len() != CTR_DATA_LEN {
                    return Err(Error::WrongData("invalid counter length".into()));
                }
            }
            (SignatureCounter::Numeric(_), ProtocolVersion::V2) => {}
            _ => {
                return Err(Error::WrongData(
                    "counter representation does not match protocol version".into(),
                ))
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Derive the blob integrity key from the decoded application secret.
#[must_use]
pub fn integrity_key(application_secret: &[u8]) -> [u8; 32] {
    crypto::hmac_sha256(application_secret, INTEGRITY_LABEL)
}

/// Serialize session state. `None` encodes the empty, not-yet-activated
/// session. Output is byte-identical for identical inputs.
pub fn serialize(data: Option<&PersistentData>, integrity_key: &[u8; 32]) -> Result<Vec<u8>> {
    let payload =
        serde_json::to_vec(&data).map_err(|e| Error::WrongData(format!("state encoding: {e}")))?;
    let payload_len = u32::try_from(payload.len())
        .map_err(|_| Error::WrongData("state payload too large".into()))?;

    let mut out = Vec::with_capacity(ENVELOPE_LEN.saturating_add(payload.len()));
    out.extend_from_slice(MAGIC);
    out.push(SCHEMA_VERSION);
    out.extend_from_slice(&payload_len.to_le_bytes());
    out.extend_from_slice(&payload);
    let mac = crypto::hmac_sha256(integrity_key, &out[MAGIC.len()..]);
    out.extend_from_slice(&mac);
    Ok(out)
}

/// Deserialize a previously saved state blob.
pub fn deserialize(blob: &[u8], integrity_key: &[u8; 32]) -> Result<Option<PersistentData>> {
    if blob.len() < ENVELOPE_LEN {
        return Err(Error::WrongData("state blob too short".into()));
    }
    if &blob[..MAGIC.len()] != MAGIC {
        return Err(Error::WrongData("invalid state magic".into()));
    }
    let schema = blob[MAGIC.len()];
    if schema > SCHEMA_VERSION || schema < OLDEST_SCHEMA_VERSION {
        return Err(Error::WrongData(format!(
            "unsupported state schema {schema}"
        )));
    }

    let mac_start = blob.len() - MAC_LEN;
    let expected = crypto::hmac_sha256(integrity_key, &blob[MAGIC.len()..mac_start]);
    if !bool::from(expected.as_slice().ct_eq(&blob[mac_start..])) {
        return Err(Error::WrongData("state integrity check failed".into()));
    }

    let len_start = MAGIC.len() + 1;
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&blob[len_start..len_start + 4]);
    let payload_len = u32::from_le_bytes(len_bytes) as usize;
    let payload_start = len_start + 4;
    let payload_end = payload_start
        .checked_add(payload_len)
        .ok_or_else(|| Error::WrongData("state length overflow".into()))?;
    if payload_end != mac_start {
        return Err(Error::WrongData("state length mismatch".into()));
    }

    let data: Option<PersistentData> = serde_json::from_slice(&blob[payload_start..payload_end])
        .map_err(|e| Error::WrongData(format!("state decoding: {e}")))?;
    if let Some(ref data) = data {
        data.validate()?;
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample_data() -> PersistentData {
        PersistentData {
            activation_id: "6A2E40BB-5B64-4F5F-A388-0C172D4DD7A1".into(),
            server_public_key: vec![0x02; 33],
            device_public_key: vec![0x04; 65],
            device_private_key_encrypted: vec![0x11; 48],
            signature_keys: SignatureKeysBlob {
                possession: vec![1; 32],
                knowledge: vec![2; 32],
                biometry: Some(vec![3; 32]),
                transport: vec![4; 32],
                signature_key_encryption: vec![5; 32],
            },
            counter: SignatureCounter::Hash([0xC7; 16]),
            counter_byte: 0,
            pbkdf2_salt: vec![0x5A; PBKDF2_SALT_LEN],
            protocol_version: ProtocolVersion::V3,
            pending_upgrade_version: None,
            recovery_data_encrypted: None,
            eek_used: false,
            failed_attempts: 0,
            max_failed_attempts: 5,
        }
    }

    fn key() -> [u8; 32] {
        integrity_key(&[0xAB; 16])
    }

    #[test]
    fn roundtrip_activated_state() {
        let data = sample_data();
        let blob = serialize(Some(&data), &key()).expect("serialize");
        let decoded = deserialize(&blob, &key()).expect("deserialize");
        assert_eq!(decoded, Some(data));
    }

    #[test]
    fn roundtrip_empty_state() {
        let blob = serialize(None, &key()).expect("serialize");
        let decoded = deserialize(&blob, &key()).expect("deserialize");
        assert_eq!(decoded, None);
    }

    #[test]
    fn serialization_is_byte_deterministic() {
        let data = sample_data();
        let a = serialize(Some(&data), &key()).expect("serialize");
        let b = serialize(Some(&data), &key()).expect("serialize");
        assert_eq!(a, b);
    }

    #[test]
    fn blob_starts_with_magic_and_schema() {
        let blob = serialize(None, &key()).expect("serialize");
        assert_eq!(&blob[..4], MAGIC);
        assert_eq!(blob[4], SCHEMA_VERSION);
    }

    #[test]
    fn rejects_wrong_magic() {
        let mut blob = serialize(None, &key()).expect("serialize");
        blob[0] = b'X';
        assert!(matches!(
            deserialize(&blob, &key()),
            Err(Error::WrongData(_))
        ));
    }

    #[test]
    fn rejects_unknown_schema() {
        let mut blob = serialize(None, &key()).expect("serialize");
        blob[4] = SCHEMA_VERSION + 1;
        assert!(matches!(
            deserialize(&blob, &key()),
            Err(Error::WrongData(_))
        ));
    }

    #[test]
    fn rejects_tampered_payload() {
        let mut blob = serialize(Some(&sample_data()), &key()).expect("serialize");
        let mid = blob.len() / 2;
        blob[mid] ^= 0xFF;
        assert!(matches!(
            deserialize(&blob, &key()),
            Err(Error::WrongData(_))
        ));
    }

    #[test]
    fn rejects_tampered_trailer() {
        let mut blob = serialize(Some(&sample_data()), &key()).expect("serialize");
        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        assert!(matches!(
            deserialize(&blob, &key()),
            Err(Error::WrongData(_))
        ));
    }

    #[test]
    fn rejects_wrong_integrity_key() {
        let blob = serialize(Some(&sample_data()), &key()).expect("serialize");
        let other = integrity_key(&[0xCD; 16]);
        assert!(matches!(
            deserialize(&blob, &other),
            Err(Error::WrongData(_))
        ));
    }

    #[test]
    fn rejects_truncated_blob() {
        let blob = serialize(Some(&sample_data()), &key()).expect("serialize");
        assert!(deserialize(&blob[..blob.len() - 1], &key()).is_err());
        assert!(deserialize(&[], &key()).is_err());
    }

    #[test]
    fn rejects_version_counter_mismatch() {
        let mut data = sample_data();
        data.counter = SignatureCounter::Numeric(7);
        // Still claims V3 — the counter representation contradicts it.
        let blob = serialize(Some(&data), &key()).expect("serialize");
        assert!(matches!(
            deserialize(&blob, &key()),
            Err(Error::WrongData(_))
        ));
    }

    #[test]
    fn rejects_orphaned_device_key() {
        let mut data = sample_data();
        data.server_public_key.clear();
        let blob = serialize(Some(&data), &key()).expect("serialize");
        assert!(matches!(
            deserialize(&blob, &key()),
            Err(Error::WrongData(_))
        ));
    }

    #[test]
    fn v2_state_roundtrip() {
        let mut data = sample_data();
        data.counter = SignatureCounter::Numeric(42);
        data.protocol_version = ProtocolVersion::V2;
        let blob = serialize(Some(&data), &key()).expect("serialize");
        let decoded = deserialize(&blob, &key()).expect("deserialize");
        assert_eq!(decoded, Some(data));
    }

    #[test]
    fn integrity_key_is_stable_per_secret() {
        assert_eq!(integrity_key(&[1; 16]), integrity_key(&[1; 16]));
        assert_ne!(integrity_key(&[1; 16]), integrity_key(&[2; 16]));
    }
}
