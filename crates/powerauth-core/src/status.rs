//! Encrypted activation status decoding.
//!
//! The server returns activation status as an AES-CBC blob with an HMAC
//! trailer, keyed from the transport key and the challenge/nonce pair of
//! the exchange. Besides the activation state the blob carries the server's
//! view of the signature counter, which the client uses to detect and heal
//! counter drift.

use crate::counter::{ProtocolVersion, CTR_DATA_LEN};
use crate::crypto;
use crate::error::{Error, Result};
use crate::memory::SecretKey;
use data_encoding::BASE64;
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

/// Label prefixing the status-key derivation.
const STATUS_LABEL: &[u8] = b"status";

/// Fixed plaintext layout: 7 header bytes followed by the counter value.
const STATUS_PLAINTEXT_LEN: usize = 7 + CTR_DATA_LEN;

/// HMAC-SHA-256 trailer length.
const MAC_LEN: usize = 32;

/// Challenge and nonce length.
const CHALLENGE_LEN: usize = 16;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Encrypted status as received from the server, all fields Base64.
#[derive(Clone, Debug)]
pub struct EncryptedActivationStatus {
    /// Random 16-byte challenge sent by the client.
    pub challenge: String,
    /// Ciphertext with HMAC trailer.
    pub encrypted_status_blob: String,
    /// Random 16-byte nonce chosen by the server.
    pub nonce: String,
}

/// Activation state reported by the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActivationState {
    /// Created on the server, not yet committed.
    Created,
    /// Waiting for the server-side commit.
    PendingCommit,
    /// Fully operational.
    Active,
    /// Temporarily blocked; can be unblocked server-side.
    Blocked,
    /// Removed; the activation no longer exists.
    Removed,
    /// Irrecoverable local state, signing is permanently disabled.
    Deadlock,
}

impl ActivationState {
    fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            1 => Ok(Self::Created),
            2 => Ok(Self::PendingCommit),
            3 => Ok(Self::Active),
            4 => Ok(Self::Blocked),
            5 => Ok(Self::Removed),
            128 => Ok(Self::Deadlock),
            _ => Err(Error::WrongData(format!("unknown activation state {byte}"))),
        }
    }

    /// `true` when the state still allows signature computation.
    #[must_use]
    pub fn allows_signatures(self) -> bool {
        matches!(self, Self::Active)
    }
}

/// Decoded activation status.
#[derive(Clone, Debug)]
pub struct ActivationStatus {
    /// Activation state.
    pub state: ActivationState,
    /// Protocol version the server runs the activation in.
    pub current_version: u8,
    /// Highest protocol version the server offers for this activation.
    pub upgrade_version: u8,
    /// Failed authentication attempts so far.
    pub fail_count: u8,
    /// Maximum failed attempts before the activation blocks.
    pub max_fail_count: u8,
    /// Size of the server's counter look-ahead window.
    pub ctr_look_ahead: u8,
    /// The server offers a newer protocol version than the session runs.
    pub is_protocol_upgrade_available: bool,
    /// Counter drift is still inside the look-ahead window; computing one
    /// signature will let the server catch up.
    pub is_signature_calculation_recommended: bool,
    /// The local counter was rewritten from the server value and the session
    /// state must be persisted.
    pub needs_serialize_session_state: bool,
}

impl ActivationStatus {
    /// Authentication attempts left before the activation blocks.
    #[must_use]
    pub fn remaining_attempts(&self) -> u8 {
        self.max_fail_count.saturating_sub(self.fail_count)
    }
}

/// Internal decode result: the public status plus the counter adopted from
/// the server when drift exceeded the look-ahead window.
pub(crate) struct DecodedStatus {
    pub status: ActivationStatus,
    pub resync_counter: Option<([u8; CTR_DATA_LEN], u8)>,
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Decrypt and interpret an encrypted status blob.
///
/// `transport_key` is the unwrapped transport key, `session_version` the
/// protocol version the session operates in and `counter_byte` the low byte
/// of the local counter-advance count.
pub(crate) fn decode_status(
    status: &EncryptedActivationStatus,
    transport_key: &SecretKey,
    session_version: ProtocolVersion,
    counter_byte: u8,
) -> Result<DecodedStatus> {
    let challenge = decode_fixed::<CHALLENGE_LEN>(&status.challenge, "status challenge")?;
    let nonce = decode_fixed::<CHALLENGE_LEN>(&status.nonce, "status nonce")?;
    let blob = BASE64
        .decode(status.encrypted_status_blob.as_bytes())
        .map_err(|_| Error::WrongData("status blob is not valid Base64".into()))?;
    if blob.len() <= MAC_LEN {
        return Err(Error::WrongData("status blob too short".into()));
    }

    // K_STATUS = KDF-X9.63(K_TRANSPORT, "status" || challenge || nonce).
    let mut info = Vec::with_capacity(STATUS_LABEL.len() + CHALLENGE_LEN * 2);
    info.extend_from_slice(STATUS_LABEL);
    info.extend_from_slice(&challenge);
    info.extend_from_slice(&nonce);
    let mut derived = crypto::kdf_x963(transport_key.expose(), &info, 32);
    let mac_start = blob.len() - MAC_LEN;
    let expected_mac = crypto::hmac_sha256(&derived[16..], &blob[..mac_start]);
    if !bool::from(expected_mac.as_slice().ct_eq(&blob[mac_start..])) {
        derived.zeroize();
        return Err(Error::Encryption);
    }

    let plaintext = crypto::aes_cbc_decrypt(&derived[..16], &nonce, &blob[..mac_start]);
    derived.zeroize();
    let plaintext = plaintext?;
    if plaintext.len() != STATUS_PLAINTEXT_LEN {
        return Err(Error::WrongData("unexpected status plaintext length".into()));
    }

    let current_version = plaintext[0];
    let upgrade_version = plaintext[1];
    let state = ActivationState::from_byte(plaintext[2])?;
    let server_counter_byte = plaintext[3];
    let fail_count = plaintext[4];
    let max_fail_count = plaintext[5];
    let ctr_look_ahead = plaintext[6];
    let mut server_counter = [0u8; CTR_DATA_LEN];
    server_counter.copy_from_slice(&plaintext[7..]);

    // Distance the local counter ran ahead of the server, modulo 256.
    let drift = counter_byte.wrapping_sub(server_counter_byte);
    let in_window = u32::from(drift) <= u32::from(ctr_look_ahead);
    let resync_counter = if drift != 0 && !in_window {
        Some((server_counter, server_counter_byte))
    } else {
        None
    };

    let status = ActivationStatus {
        state,
        current_version,
        upgrade_version,
        fail_count,
        max_fail_count,
        ctr_look_ahead,
        is_protocol_upgrade_available: upgrade_version > session_version.byte_value(),
        is_signature_calculation_recommended: drift != 0 && in_window,
        needs_serialize_session_state: resync_counter.is_some(),
    };
    Ok(DecodedStatus {
        status,
        resync_counter,
    })
}

fn decode_fixed<const N: usize>(input: &str, what: &str) -> Result<[u8; N]> {
    let bytes = BASE64
        .decode(input.as_bytes())
        .map_err(|_| Error::WrongData(format!("{what} is not valid Base64")))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| Error::WrongData(format!("{what} has invalid length")))
}
