//! Protocol version and the signature counter.
//!
//! Protocol V3 replaced the integer request counter with a 16-byte hash
//! chain: every signature consumes the current value and advances it by one
//! SHA-256 step. The server tolerates a bounded look-ahead, so a crash
//! between signing and persisting costs at most one step of drift.

use crate::crypto;
use serde::{Deserialize, Serialize};

/// Length of the V3 hash-based counter state.
pub const CTR_DATA_LEN: usize = 16;

/// Protocol version the session operates in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProtocolVersion {
    /// Legacy protocol with an integer counter.
    V2,
    /// Current protocol with a hash-based counter.
    V3,
}

impl ProtocolVersion {
    /// The version string used on the wire (`X-PowerAuth-Authorization`,
    /// ECIES metadata).
    #[must_use]
    pub const fn http_version(self) -> &'static str {
        match self {
            Self::V2 => "2.1",
            Self::V3 => "3.1",
        }
    }

    /// The byte value used in the encrypted status blob.
    #[must_use]
    pub const fn byte_value(self) -> u8 {
        match self {
            Self::V2 => 2,
            Self::V3 => 3,
        }
    }

    /// Newest version this client implements.
    #[must_use]
    pub const fn latest() -> Self {
        Self::V3
    }
}

/// Signature counter state, one variant per protocol generation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignatureCounter {
    /// V2 integer counter.
    Numeric(u64),
    /// V3 hash-based counter.
    Hash([u8; CTR_DATA_LEN]),
}

impl SignatureCounter {
    /// The 16-byte value mixed into per-factor signature keys. The numeric
    /// counter is encoded big-endian into the low-order bytes.
    #[must_use]
    pub fn signature_bytes(&self) -> [u8; CTR_DATA_LEN] {
        match self {
            Self::Numeric(value) => {
                let mut out = [0u8; CTR_DATA_LEN];
                out[8..].copy_from_slice(&value.to_be_bytes());
                out
            }
            Self::Hash(data) => *data,
        }
    }

    /// Advance to the next state: one SHA-256 step for the hash counter, an
    /// increment for the numeric one.
    #[must_use]
    pub fn next(&self) -> Self {
        match self {
            Self::Numeric(value) => Self::Numeric(value.wrapping_add(1)),
            Self::Hash(data) => {
                let digest = crypto::sha256(data);
                let mut out = [0u8; CTR_DATA_LEN];
                out.copy_from_slice(&digest[..CTR_DATA_LEN]);
                Self::Hash(out)
            }
        }
    }

    /// Protocol version implied by the counter representation.
    #[must_use]
    pub const fn version(&self) -> ProtocolVersion {
        match self {
            Self::Numeric(_) => ProtocolVersion::V2,
            Self::Hash(_) => ProtocolVersion::V3,
        }
    }
}
