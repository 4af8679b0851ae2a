//! `powerauth-core` — client-side cryptographic core of the PowerAuth
//! mobile authentication protocol.
//!
//! The crate maintains a long-lived secure session between a device and an
//! authentication server: the activation handshake, multi-factor request
//! signatures with a hash-chain counter, ECIES envelopes for confidential
//! payloads, encrypted status decoding, vault-key derivations, protocol
//! upgrades and recovery data.
//!
//! Zero network, zero async, zero I/O: the caller owns transport and
//! persistence, the [`Session`] owns the cryptography and the state
//! machine. All randomness flows through an injected generator, so outputs
//! are byte-deterministic under a seeded RNG.

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod activation;
pub mod code;
pub mod counter;
pub mod crypto;
pub mod ecies;
pub mod error;
pub mod factors;
pub mod memory;
pub mod password;
pub mod persistence;
pub mod session;
pub mod signature;
pub mod status;
pub mod vault;

pub use activation::{
    activation_fingerprint, StartActivationParam, StartActivationResult,
    ValidateActivationResponseParam, ValidateActivationResponseResult,
};
pub use code::{
    parse_activation_code, parse_recovery_code, validate_activation_code,
    validate_and_correct_typed_character, validate_recovery_code, validate_recovery_puk,
    validate_typed_character, ActivationCode,
};
pub use counter::{ProtocolVersion, SignatureCounter, CTR_DATA_LEN};
pub use crypto::SessionRng;
pub use ecies::{EciesCryptogram, EciesEncryptor, EciesEncryptorScope};
pub use error::{Error, Result};
pub use factors::{SignatureFactor, SignatureUnlockKeys};
pub use memory::{SecretBytes, SecretKey, KEY_LEN};
pub use password::{Password, MIN_PASSWORD_LEN};
pub use persistence::RecoveryData;
pub use session::{Session, SessionSetup, SigningKey};
pub use signature::{
    HttpRequestData, HttpRequestDataSignature, AUTH_HEADER_NAME, NONCE_LEN,
};
pub use status::{ActivationState, ActivationStatus, EncryptedActivationStatus};
