//! Primitives facade.
//!
//! Thin adapters over the primitive cryptography used by the protocol:
//! SHA-256, HMAC-SHA-256, AES-CBC/PKCS#7, PBKDF2-HMAC-SHA1, KDF-X9.63,
//! ECDH and ECDSA on secp256r1, and a pluggable random generator.
//!
//! Everything above this module speaks in terms of these functions; no other
//! module touches a cryptography crate directly. Failures surface as the
//! opaque [`Error::Encryption`].

use crate::error::{Error, Result};
use crate::memory::SecretBytes;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use p256::ecdh::diffie_hellman;
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand::{CryptoRng, RngCore};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// AES block size and IV length in bytes.
pub const AES_BLOCK_LEN: usize = 16;

/// An all-zero IV, used where each wrapped block is a single-use key under a
/// dedicated wrapping key.
pub const ZERO_IV: [u8; AES_BLOCK_LEN] = [0; AES_BLOCK_LEN];

// ---------------------------------------------------------------------------
// Random generator capability
// ---------------------------------------------------------------------------

/// Random generator injected at session construction.
///
/// Production callers pass [`rand::rngs::OsRng`]; tests inject a seeded
/// `StdRng` so that every output of the core is byte-deterministic.
pub trait SessionRng: RngCore + Send {}

impl<T: RngCore + CryptoRng + Send> SessionRng for T {}

/// Fill a fresh buffer with `len` random bytes.
pub fn random_bytes(rng: &mut dyn SessionRng, len: usize) -> Result<Vec<u8>> {
    let mut out = vec![0u8; len];
    rng.try_fill_bytes(&mut out).map_err(|_| Error::Encryption)?;
    Ok(out)
}

/// Fill a fixed-size array with random bytes.
pub fn random_array<const N: usize>(rng: &mut dyn SessionRng) -> Result<[u8; N]> {
    let mut out = [0u8; N];
    rng.try_fill_bytes(&mut out).map_err(|_| Error::Encryption)?;
    Ok(out)
}

// ---------------------------------------------------------------------------
// Hashing & MAC
// ---------------------------------------------------------------------------

/// SHA-256 digest.
#[must_use]
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// HMAC-SHA-256 over `data` with `key`.
#[must_use]
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    // HMAC accepts keys of any length, new_from_slice cannot fail.
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC-SHA256 accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// XOR-fold a 32-byte digest into 16 bytes.
#[must_use]
pub fn xor_fold(digest: &[u8; 32]) -> [u8; 16] {
    let mut out = [0u8; 16];
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = digest[i] ^ digest[i + 16];
    }
    out
}

// ---------------------------------------------------------------------------
// Key derivation
// ---------------------------------------------------------------------------

/// ANSI X9.63 KDF with SHA-256.
///
/// Produces `out_len` bytes from the shared secret `z` and the optional
/// `shared_info` string: `H(z || counter_be32 || shared_info)` blocks,
/// counter starting at 1, concatenated and truncated.
#[must_use]
pub fn kdf_x963(z: &[u8], shared_info: &[u8], out_len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(out_len.div_ceil(32).saturating_mul(32));
    let mut counter: u32 = 1;
    while out.len() < out_len {
        let mut hasher = Sha256::new();
        hasher.update(z);
        hasher.update(counter.to_be_bytes());
        hasher.update(shared_info);
        out.extend_from_slice(&hasher.finalize());
        counter = counter.wrapping_add(1);
    }
    out.truncate(out_len);
    out
}

/// PBKDF2-HMAC-SHA1.
pub fn pbkdf2_sha1(password: &[u8], salt: &[u8], iterations: u32, out_len: usize) -> Result<Vec<u8>> {
    let mut out = vec![0u8; out_len];
    pbkdf2::pbkdf2::<Hmac<sha1::Sha1>>(password, salt, iterations, &mut out)
        .map_err(|_| Error::Encryption)?;
    Ok(out)
}

// ---------------------------------------------------------------------------
// AES-CBC with PKCS#7
// ---------------------------------------------------------------------------

/// AES-CBC/PKCS#7 encryption. The key must be 16 or 32 bytes, the IV 16 bytes.
pub fn aes_cbc_encrypt(key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    match key.len() {
        16 => Ok(Aes128CbcEnc::new_from_slices(key, iv)
            .map_err(|_| Error::Encryption)?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext)),
        32 => Ok(Aes256CbcEnc::new_from_slices(key, iv)
            .map_err(|_| Error::Encryption)?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext)),
        _ => Err(Error::Encryption),
    }
}

/// AES-CBC/PKCS#7 decryption. A padding error surfaces as the opaque
/// [`Error::Encryption`].
pub fn aes_cbc_decrypt(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    match key.len() {
        16 => Aes128CbcDec::new_from_slices(key, iv)
            .map_err(|_| Error::Encryption)?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| Error::Encryption),
        32 => Aes256CbcDec::new_from_slices(key, iv)
            .map_err(|_| Error::Encryption)?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| Error::Encryption),
        _ => Err(Error::Encryption),
    }
}

// ---------------------------------------------------------------------------
// secp256r1 — key agreement & signatures
// ---------------------------------------------------------------------------

/// A secp256r1 keypair. The private scalar is wiped when the value drops.
pub struct EcKeyPair {
    secret: p256::SecretKey,
}

impl EcKeyPair {
    /// Generate a keypair from the injected random generator.
    pub fn generate(rng: &mut dyn SessionRng) -> Result<Self> {
        // Rejection-sample the scalar so that a seeded test RNG stays on a
        // deterministic path. Failure here is astronomically unlikely with
        // a healthy generator.
        for _ in 0..8 {
            let mut candidate = [0u8; 32];
            rng.try_fill_bytes(&mut candidate)
                .map_err(|_| Error::Encryption)?;
            let parsed = p256::SecretKey::from_slice(&candidate);
            candidate.zeroize();
            if let Ok(secret) = parsed {
                return Ok(Self { secret });
            }
        }
        Err(Error::Encryption)
    }

    /// Restore a keypair from a 32-byte private scalar.
    pub fn from_private_bytes(private: &[u8]) -> Result<Self> {
        let secret = p256::SecretKey::from_slice(private).map_err(|_| Error::Encryption)?;
        Ok(Self { secret })
    }

    /// SEC1 public key bytes; uncompressed (65 B) or compressed (33 B).
    #[must_use]
    pub fn public_key_bytes(&self, compressed: bool) -> Vec<u8> {
        self.secret
            .public_key()
            .to_encoded_point(compressed)
            .as_bytes()
            .to_vec()
    }

    /// Export the private scalar. Used only to seal the device key under the
    /// vault key; the returned buffer zeroizes on drop.
    #[must_use]
    pub fn private_key_bytes(&self) -> SecretBytes {
        SecretBytes::new(self.secret.to_bytes().as_slice())
    }

    /// ECDH with a peer SEC1 public key (compressed or uncompressed).
    /// Returns the raw 32-byte x-coordinate.
    pub fn ecdh(&self, peer_public: &[u8]) -> Result<SecretBytes> {
        let peer = p256::PublicKey::from_sec1_bytes(peer_public).map_err(|_| Error::Encryption)?;
        let shared = diffie_hellman(self.secret.to_nonzero_scalar(), peer.as_affine());
        Ok(SecretBytes::new(shared.raw_secret_bytes().as_slice()))
    }

    /// ECDSA-SHA256 signature of `data`, DER encoded.
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        let signing_key = SigningKey::from(&self.secret);
        let signature: Signature = signing_key
            .try_sign(data)
            .map_err(|_| Error::Encryption)?;
        Ok(signature.to_der().as_bytes().to_vec())
    }
}

/// Verify an ECDSA-SHA256 DER signature against a SEC1 public key.
///
/// Returns `Ok(())` on success and [`Error::WrongSignature`] on mismatch;
/// malformed keys or signatures yield [`Error::WrongData`].
pub fn ecdsa_verify(public_key: &[u8], data: &[u8], signature_der: &[u8]) -> Result<()> {
    let key = VerifyingKey::from_sec1_bytes(public_key)
        .map_err(|_| Error::WrongData("invalid EC public key".into()))?;
    let signature = Signature::from_der(signature_der)
        .map_err(|_| Error::WrongData("invalid ECDSA signature encoding".into()))?;
    key.verify(data, &signature).map_err(|_| Error::WrongSignature)
}

/// Validate that `bytes` parse as a secp256r1 point in SEC1 encoding.
pub fn validate_public_key(bytes: &[u8]) -> Result<()> {
    p256::PublicKey::from_sec1_bytes(bytes)
        .map(|_| ())
        .map_err(|_| Error::WrongData("invalid EC public key".into()))
}

/// Re-encode a SEC1 public key into its compressed form.
pub fn compress_public_key(bytes: &[u8]) -> Result<Vec<u8>> {
    let key = p256::PublicKey::from_sec1_bytes(bytes)
        .map_err(|_| Error::WrongData("invalid EC public key".into()))?;
    Ok(key.to_encoded_point(true).as_bytes().to_vec())
}

/// Re-encode a SEC1 public key into its uncompressed form.
pub fn uncompress_public_key(bytes: &[u8]) -> Result<Vec<u8>> {
    let key = p256::PublicKey::from_sec1_bytes(bytes)
        .map_err(|_| Error::WrongData("invalid EC public key".into()))?;
    Ok(key.to_encoded_point(false).as_bytes().to_vec())
}
