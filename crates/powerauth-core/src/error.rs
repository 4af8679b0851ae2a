//! Error type shared by all fallible operations in `powerauth-core`.

use thiserror::Error;

/// Errors produced by session and cryptographic operations.
///
/// The taxonomy is intentionally flat. In particular, [`Error::Encryption`]
/// carries no detail about which step of a cryptographic envelope failed, so
/// a caller relaying errors to a server cannot be used as a padding oracle.
#[derive(Debug, Error)]
pub enum Error {
    /// Session setup is missing required fields or a field has an invalid length.
    #[error("invalid session setup: {0}")]
    WrongSetup(String),

    /// Operation is not allowed in the current session state.
    #[error("operation not allowed in current session state")]
    WrongState,

    /// A provided argument is malformed.
    #[error("invalid parameter: {0}")]
    WrongParam(String),

    /// Activation code, recovery code or PUK failed validation.
    #[error("invalid activation or recovery code")]
    WrongCode,

    /// ECDSA verification failed, or a required signature is absent.
    #[error("signature verification failed")]
    WrongSignature,

    /// Base64/Base32 decode failure, unknown schema or corrupt persistent blob.
    #[error("invalid data: {0}")]
    WrongData(String),

    /// Opaque cryptographic failure (cipher, MAC, KDF, ECDH or RNG).
    #[error("cryptographic operation failed")]
    Encryption,
}

/// Convenience alias used across the crate.
pub type Result<T> = core::result::Result<T, Error>;
