//! Vault-key transport and the derivations it unlocks.
//!
//! The vault key is established during activation but never stored on the
//! device. The server re-issues it on demand, double-wrapped: an outer
//! AES-CBC layer under a key derived from the transport key and an inner
//! layer under a key derived from the knowledge signature key, so
//! recovering it takes the possession factor and the user password. Once
//! unwrapped it unlocks the secondary operations: device private key
//! signatures, biometry provisioning, deterministic key derivation and
//! recovery-data access.

use crate::crypto::{self, ZERO_IV};
use crate::error::{Error, Result};
use crate::memory::{SecretBytes, SecretKey};
use crate::persistence::RecoveryData;
use data_encoding::BASE64;
use zeroize::Zeroize;

/// Label deriving the outer (transport) vault wrap key.
const VAULT_UNWRAP_TRANSPORT_LABEL: &[u8] = b"vault-unwrap-transport";

/// Label deriving the inner (knowledge) vault wrap key.
const VAULT_UNWRAP_KNOWLEDGE_LABEL: &[u8] = b"vault-unwrap-knowledge";

/// Label deriving the recovery-data protection key from the vault key.
const RECOVERY_LABEL: &[u8] = b"recovery";

/// IV domain for the sealed device private key.
const DEVICE_KEY_IV_LABEL: &[u8] = b"device-key-iv";

/// IV domain for the sealed recovery data.
const RECOVERY_IV_LABEL: &[u8] = b"recovery-iv";

/// Decrypt a server-issued vault key.
///
/// The blob carries two AES-CBC layers: the outer under a key derived from
/// the transport key, the inner under a key derived from the knowledge
/// signature key. Both factor keys must already be unwrapped by the caller.
pub(crate) fn unwrap_vault_key(
    encrypted_vault_key: &str,
    transport_key: &SecretKey,
    knowledge_key: &SecretKey,
) -> Result<SecretKey> {
    let wrapped = BASE64
        .decode(encrypted_vault_key.as_bytes())
        .map_err(|_| Error::WrongData("encrypted vault key is not valid Base64".into()))?;
    let mut outer_key =
        crypto::kdf_x963(transport_key.expose(), VAULT_UNWRAP_TRANSPORT_LABEL, 32);
    let inner = crypto::aes_cbc_decrypt(&outer_key, &ZERO_IV, &wrapped);
    outer_key.zeroize();
    let mut inner = inner?;
    let mut inner_key =
        crypto::kdf_x963(knowledge_key.expose(), VAULT_UNWRAP_KNOWLEDGE_LABEL, 32);
    let plain = crypto::aes_cbc_decrypt(&inner_key, &ZERO_IV, &inner);
    inner_key.zeroize();
    inner.zeroize();
    let mut plain = plain?;
    let key = SecretKey::from_slice(&plain).ok_or(Error::Encryption);
    plain.zeroize();
    key
}

/// Derive an application key from the vault key and a caller-chosen index.
pub(crate) fn derive_cryptographic_key(vault_key: &SecretKey, index: u64) -> Result<SecretKey> {
    let mut derived = crypto::kdf_x963(vault_key.expose(), &index.to_be_bytes(), 16);
    let key = SecretKey::from_slice(&derived).ok_or(Error::Encryption);
    derived.zeroize();
    key
}

/// Seal the device private key under the vault key.
pub(crate) fn seal_device_private_key(
    vault_key: &SecretKey,
    activation_id: &str,
    private_key: &SecretBytes,
) -> Result<Vec<u8>> {
    let iv = derive_iv(DEVICE_KEY_IV_LABEL, activation_id);
    crypto::aes_cbc_encrypt(vault_key.expose(), &iv, private_key.expose())
}

/// Recover the device private key. The caller must wipe the plaintext as
/// soon as the signature is computed; the returned buffer zeroizes on drop.
pub(crate) fn open_device_private_key(
    vault_key: &SecretKey,
    activation_id: &str,
    sealed: &[u8],
) -> Result<SecretBytes> {
    let iv = derive_iv(DEVICE_KEY_IV_LABEL, activation_id);
    let plain = crypto::aes_cbc_decrypt(vault_key.expose(), &iv, sealed)?;
    Ok(SecretBytes::from_vec(plain))
}

/// Seal recovery credentials under a vault-derived key.
pub(crate) fn seal_recovery_data(
    vault_key: &SecretKey,
    activation_id: &str,
    recovery: &RecoveryData,
) -> Result<Vec<u8>> {
    let mut payload = serde_json::to_vec(recovery)
        .map_err(|e| Error::WrongData(format!("recovery encoding: {e}")))?;
    let key = recovery_key(vault_key)?;
    let iv = derive_iv(RECOVERY_IV_LABEL, activation_id);
    let sealed = crypto::aes_cbc_encrypt(key.expose(), &iv, &payload);
    payload.zeroize();
    sealed
}

/// Open sealed recovery credentials.
pub(crate) fn open_recovery_data(
    vault_key: &SecretKey,
    activation_id: &str,
    sealed: &[u8],
) -> Result<RecoveryData> {
    let key = recovery_key(vault_key)?;
    let iv = derive_iv(RECOVERY_IV_LABEL, activation_id);
    let mut payload = crypto::aes_cbc_decrypt(key.expose(), &iv, sealed)?;
    let recovery = serde_json::from_slice(&payload)
        .map_err(|e| Error::WrongData(format!("recovery decoding: {e}")));
    payload.zeroize();
    recovery
}

fn recovery_key(vault_key: &SecretKey) -> Result<SecretKey> {
    let mut derived = crypto::kdf_x963(vault_key.expose(), RECOVERY_LABEL, 16);
    let key = SecretKey::from_slice(&derived).ok_or(Error::Encryption);
    derived.zeroize();
    key
}

/// Deterministic IV bound to the activation identifier.
fn derive_iv(label: &[u8], activation_id: &str) -> [u8; 16] {
    let mut input = Vec::with_capacity(label.len() + activation_id.len());
    input.extend_from_slice(label);
    input.extend_from_slice(activation_id.as_bytes());
    let digest = crypto::sha256(&input);
    let mut iv = [0u8; 16];
    iv.copy_from_slice(&digest[..16]);
    iv
}
