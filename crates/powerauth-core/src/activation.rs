//! Activation handshake types, the derived key family and the visual
//! fingerprint.
//!
//! The handshake has three phases: `start` generates the device keypair,
//! `validate` consumes the server response and computes the shared key
//! family, `complete` protects everything under the caller's factor keys.
//! Everything in between lives in the ephemeral [`PendingActivation`] and
//! never touches persistent state.

use crate::code::ActivationCode;
use crate::crypto::{self, EcKeyPair};
use crate::error::{Error, Result};
use crate::memory::{SecretBytes, SecretKey};
use crate::persistence::RecoveryData;
use crate::signature;
use zeroize::Zeroize;

// Key family derivation labels, fixed by the protocol.
const LABEL_SIGNATURE_POSSESSION: &[u8] = b"signature-possession";
const LABEL_SIGNATURE_KNOWLEDGE: &[u8] = b"signature-knowledge";
const LABEL_SIGNATURE_BIOMETRY: &[u8] = b"signature-biometry";
const LABEL_TRANSPORT: &[u8] = b"transport";
const LABEL_SIGNATURE_KEY_ENCRYPTION: &[u8] = b"signature-key-encryption";
const LABEL_VAULT: &[u8] = b"vault";

// ---------------------------------------------------------------------------
// Public parameters & results
// ---------------------------------------------------------------------------

/// Input to the first activation step.
#[derive(Clone, Debug, Default)]
pub struct StartActivationParam {
    /// Parsed activation code. Absent for custom activations where identity
    /// proof travels in the (opaque) outer request payload.
    pub activation_code: Option<ActivationCode>,
}

/// Output of the first activation step.
#[derive(Clone, Debug)]
pub struct StartActivationResult {
    /// Device public key, Base64 of the SEC1 uncompressed point. The outer
    /// layer wraps it in an application-scope ECIES request.
    pub device_public_key: String,
}

/// Server response consumed by the second activation step.
#[derive(Clone, Debug)]
pub struct ValidateActivationResponseParam {
    /// Server-assigned activation identifier.
    pub activation_id: String,
    /// Server public key, Base64 SEC1.
    pub server_public_key: String,
    /// Initial counter value, Base64 of 16 bytes.
    pub ctr_data: String,
    /// Optional recovery credentials issued with the activation.
    pub activation_recovery: Option<RecoveryData>,
}

/// Output of the second activation step.
#[derive(Clone, Debug)]
pub struct ValidateActivationResponseResult {
    /// Decimal fingerprint displayed to the user for visual confirmation.
    pub activation_fingerprint: String,
}

// ---------------------------------------------------------------------------
// Ephemeral activation state
// ---------------------------------------------------------------------------

/// The key family shared between client and server after the handshake.
pub(crate) struct ActivationKeys {
    pub possession: SecretKey,
    pub knowledge: SecretKey,
    pub transport: SecretKey,
    pub signature_key_encryption: SecretKey,
    pub vault: SecretKey,
}

/// Ephemeral state alive between activation steps; dropped on completion,
/// failure or reset.
pub(crate) enum PendingActivation {
    /// After `start_activation`.
    Step1 { device_keypair: EcKeyPair },
    /// After `validate_activation_response`.
    Step2 {
        device_keypair: EcKeyPair,
        activation_id: String,
        server_public_key: Vec<u8>,
        ctr_data: [u8; 16],
        recovery: Option<RecoveryData>,
        keys: ActivationKeys,
    },
}

/// Derive the shared key family from the raw ECDH master secret.
///
/// The vault key does not come from the master secret directly: it folds
/// the transport key and the knowledge signature key together, so vault
/// operations are reachable only with both factors in hand.
pub(crate) fn derive_activation_keys(master_secret: &SecretBytes) -> Result<ActivationKeys> {
    let possession = derive_key(master_secret, LABEL_SIGNATURE_POSSESSION)?;
    let knowledge = derive_key(master_secret, LABEL_SIGNATURE_KNOWLEDGE)?;
    let transport = derive_key(master_secret, LABEL_TRANSPORT)?;
    let signature_key_encryption = derive_key(master_secret, LABEL_SIGNATURE_KEY_ENCRYPTION)?;
    let vault = derive_vault_key(&transport, &knowledge)?;
    Ok(ActivationKeys {
        possession,
        knowledge,
        transport,
        signature_key_encryption,
        vault,
    })
}

/// `K_VAULT = KDF-X9.63(K_TRANSPORT || K_KNOWLEDGE, "vault", 16)`.
pub(crate) fn derive_vault_key(transport: &SecretKey, knowledge: &SecretKey) -> Result<SecretKey> {
    let mut input = Vec::with_capacity(32);
    input.extend_from_slice(transport.expose());
    input.extend_from_slice(knowledge.expose());
    let mut derived = crypto::kdf_x963(&input, LABEL_VAULT, 16);
    input.zeroize();
    let key = SecretKey::from_slice(&derived).ok_or(Error::Encryption);
    derived.zeroize();
    key
}

/// The biometry signature key is anchored to the vault key so that biometry
/// enrollment can re-create it from the server-issued vault key later.
pub(crate) fn derive_biometry_key(vault_key: &SecretKey) -> Result<SecretKey> {
    let mut derived = crypto::kdf_x963(vault_key.expose(), LABEL_SIGNATURE_BIOMETRY, 16);
    let key = SecretKey::from_slice(&derived).ok_or(Error::Encryption);
    derived.zeroize();
    key
}

fn derive_key(master_secret: &SecretBytes, label: &[u8]) -> Result<SecretKey> {
    let mut derived = crypto::kdf_x963(master_secret.expose(), label, 16);
    let key = SecretKey::from_slice(&derived).ok_or(Error::Encryption);
    derived.zeroize();
    key
}

// ---------------------------------------------------------------------------
// Fingerprint
// ---------------------------------------------------------------------------

/// Compute the decimal activation fingerprint.
///
/// `SHA-256(device_public || activation_id || server_public)` over the SEC1
/// uncompressed points, reduced to three 8-digit groups joined by `-`.
pub fn activation_fingerprint(
    device_public_key: &[u8],
    activation_id: &str,
    server_public_key: &[u8],
) -> Result<String> {
    let device = crypto::uncompress_public_key(device_public_key)?;
    let server = crypto::uncompress_public_key(server_public_key)?;
    let mut input = Vec::with_capacity(device.len() + activation_id.len() + server.len());
    input.extend_from_slice(&device);
    input.extend_from_slice(activation_id.as_bytes());
    input.extend_from_slice(&server);
    let digest = crypto::sha256(&input);

    let mut groups = Vec::with_capacity(3);
    for end in [20usize, 24, 28] {
        groups.push(signature::decimal_code(&digest[..end])?);
    }
    Ok(groups.join("-"))
}
