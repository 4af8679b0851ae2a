//! ECIES envelope for confidential request/response payloads.
//!
//! Scheme: ephemeral ECDH on secp256r1, KDF-X9.63 with SHA-256, AES-CBC
//! with PKCS#7 and HMAC-SHA-256. The encryptor is primed by encrypting a
//! request — that fixes the envelope keys — and may then decrypt exactly one
//! response. Reuse in either direction is a state error.

use crate::crypto::{self, EcKeyPair, SessionRng};
use crate::error::{Error, Result};
use crate::memory::SecretKey;
use crate::signature::NONCE_LEN;
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

/// SHA-256 block size; longer `sharedInfo2` values are pre-hashed.
const MAC_BLOCK_LEN: usize = 64;

/// Label mixed into the IV derivation.
const IV_LABEL: &[u8] = b"IV";

/// Scope the encryptor operates in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EciesEncryptorScope {
    /// Keyed by the master server public key; available before activation.
    Application,
    /// Keyed by the activation server public key with the transport key
    /// mixed into `sharedInfo2`; requires an activated session.
    Activation,
}

/// One ECIES envelope on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EciesCryptogram {
    /// Ephemeral public key, SEC1 encoded. Empty in response cryptograms.
    pub ephemeral_public_key: Vec<u8>,
    /// AES-CBC ciphertext.
    pub encrypted_data: Vec<u8>,
    /// HMAC-SHA-256 over ciphertext and `sharedInfo2`.
    pub mac: Vec<u8>,
    /// Unique nonce the IV is derived from.
    pub nonce: [u8; NONCE_LEN],
    /// Milliseconds since the epoch, supplied by the caller.
    pub timestamp: u64,
}

struct EnvelopeKeys {
    enc: SecretKey,
    mac: SecretKey,
}

/// Client-side ECIES encryptor bound to one server public key.
pub struct EciesEncryptor {
    server_public_key: Vec<u8>,
    shared_info1: Vec<u8>,
    shared_info2: Vec<u8>,
    envelope: Option<EnvelopeKeys>,
    response_consumed: bool,
}

impl EciesEncryptor {
    /// Create an encryptor for `server_public_key` (SEC1 bytes) with the
    /// pre-agreed `sharedInfo1`/`sharedInfo2` strings.
    pub fn new(server_public_key: &[u8], shared_info1: &[u8], shared_info2: &[u8]) -> Result<Self> {
        crypto::validate_public_key(server_public_key)?;
        Ok(Self {
            server_public_key: server_public_key.to_vec(),
            shared_info1: shared_info1.to_vec(),
            shared_info2: shared_info2.to_vec(),
            envelope: None,
            response_consumed: false,
        })
    }

    /// `true` once a request has been encrypted and a response can be
    /// decrypted.
    #[must_use]
    pub fn can_decrypt_response(&self) -> bool {
        self.envelope.is_some() && !self.response_consumed
    }

    /// Encrypt a request payload.
    ///
    /// Generates the ephemeral keypair and nonce from `rng`; `timestamp` is
    /// the caller's clock in milliseconds. A second call on the same
    /// encryptor yields [`Error::WrongState`].
    pub fn encrypt_request(
        &mut self,
        data: &[u8],
        timestamp: u64,
        rng: &mut dyn SessionRng,
    ) -> Result<EciesCryptogram> {
        if self.envelope.is_some() {
            return Err(Error::WrongState);
        }
        let ephemeral = EcKeyPair::generate(rng)?;
        let ephemeral_public = ephemeral.public_key_bytes(false);
        let shared_secret = ephemeral.ecdh(&self.server_public_key)?;

        // KDF info binds the ephemeral key into the envelope keys.
        let mut info = Vec::with_capacity(self.shared_info1.len() + ephemeral_public.len());
        info.extend_from_slice(&self.shared_info1);
        info.extend_from_slice(&ephemeral_public);
        let mut derived = crypto::kdf_x963(shared_secret.expose(), &info, 32);
        let enc = SecretKey::from_slice(&derived[..16]).ok_or(Error::Encryption);
        let mac_key = SecretKey::from_slice(&derived[16..]).ok_or(Error::Encryption);
        derived.zeroize();
        let (enc, mac_key) = (enc?, mac_key?);

        let nonce: [u8; NONCE_LEN] = crypto::random_array(rng)?;
        let iv = derive_iv(&nonce);
        let encrypted_data = crypto::aes_cbc_encrypt(enc.expose(), &iv, data)?;
        let mac = compute_mac(&mac_key, &encrypted_data, &self.shared_info2);

        self.envelope = Some(EnvelopeKeys { enc, mac: mac_key });
        Ok(EciesCryptogram {
            ephemeral_public_key: ephemeral_public,
            encrypted_data,
            mac,
            nonce,
            timestamp,
        })
    }

    /// Decrypt a response cryptogram with the envelope keys established by
    /// [`Self::encrypt_request`].
    ///
    /// MAC verification runs in constant time; any failure is the opaque
    /// [`Error::Encryption`]. Decrypting a second response yields
    /// [`Error::WrongState`].
    pub fn decrypt_response(&mut self, cryptogram: &EciesCryptogram) -> Result<Vec<u8>> {
        if self.response_consumed {
            return Err(Error::WrongState);
        }
        let envelope = self.envelope.as_ref().ok_or(Error::WrongState)?;

        let expected = compute_mac(&envelope.mac, &cryptogram.encrypted_data, &self.shared_info2);
        if expected.len() != cryptogram.mac.len()
            || !bool::from(expected.as_slice().ct_eq(&cryptogram.mac))
        {
            return Err(Error::Encryption);
        }
        let iv = derive_iv(&cryptogram.nonce);
        let plaintext = crypto::aes_cbc_decrypt(envelope.enc.expose(), &iv, &cryptogram.encrypted_data)?;
        self.response_consumed = true;
        Ok(plaintext)
    }
}

/// `iv = SHA-256(nonce || "IV")[0..16]`, stable across client and server.
fn derive_iv(nonce: &[u8; NONCE_LEN]) -> [u8; 16] {
    let mut input = Vec::with_capacity(NONCE_LEN + IV_LABEL.len());
    input.extend_from_slice(nonce);
    input.extend_from_slice(IV_LABEL);
    let digest = crypto::sha256(&input);
    let mut iv = [0u8; 16];
    iv.copy_from_slice(&digest[..16]);
    iv
}

/// `HMAC-SHA-256(K_MAC, ciphertext || sharedInfo2')` where `sharedInfo2` is
/// pre-hashed when it exceeds the MAC block size.
fn compute_mac(mac_key: &SecretKey, ciphertext: &[u8], shared_info2: &[u8]) -> Vec<u8> {
    let mut input = ciphertext.to_vec();
    if shared_info2.len() > MAC_BLOCK_LEN {
        input.extend_from_slice(&crypto::sha256(shared_info2));
    } else {
        input.extend_from_slice(shared_info2);
    }
    crypto::hmac_sha256(mac_key.expose(), &input).to_vec()
}
