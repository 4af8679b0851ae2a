//! Password box for secure PIN and passphrase entry.
//!
//! The box stores the secret as UTF-8 bytes together with a parallel index of
//! codepoint boundaries, so an entry widget can edit the secret one Unicode
//! scalar at a time without ever materializing it as a `String`. The buffer
//! is zeroized on [`Password::clear`] and on drop.

use std::fmt;
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

/// Minimum password length in bytes accepted for signature computation.
///
/// Enforced at signature time, not at construction, so an entry widget can
/// hold partial input.
pub const MIN_PASSWORD_LEN: usize = 4;

/// A mutable secret owned by the user.
#[derive(Default)]
pub struct Password {
    /// UTF-8 bytes of the secret.
    bytes: Vec<u8>,
    /// Byte offset where each codepoint starts. `offsets.len()` equals the
    /// number of codepoints; `bytes.len()` is the implicit final boundary.
    offsets: Vec<usize>,
}

impl Password {
    /// An empty password.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a password from a complete string.
    #[must_use]
    pub fn from_string(value: &str) -> Self {
        let mut password = Self::new();
        password.set_from_bytes(value.as_bytes());
        password
    }

    /// Replace the content with raw bytes.
    ///
    /// When the bytes are valid UTF-8 the codepoint index follows the UTF-8
    /// boundaries; otherwise every byte counts as one editing unit, so opaque
    /// binary passwords remain editable and measurable.
    pub fn set_from_bytes(&mut self, data: &[u8]) {
        self.clear();
        self.bytes.extend_from_slice(data);
        match core::str::from_utf8(data) {
            Ok(text) => self.offsets.extend(text.char_indices().map(|(i, _)| i)),
            Err(_) => self.offsets.extend(0..data.len()),
        }
    }

    /// Append a Unicode scalar at the end.
    pub fn append_codepoint(&mut self, codepoint: char) {
        self.offsets.push(self.bytes.len());
        let mut buf = [0u8; 4];
        self.bytes
            .extend_from_slice(codepoint.encode_utf8(&mut buf).as_bytes());
        buf.zeroize();
    }

    /// Insert a Unicode scalar before the codepoint at `index`.
    ///
    /// Returns `false` when `index` is out of bounds (greater than the
    /// current codepoint count).
    #[must_use]
    pub fn insert_codepoint_at(&mut self, index: usize, codepoint: char) -> bool {
        if index > self.offsets.len() {
            return false;
        }
        if index == self.offsets.len() {
            self.append_codepoint(codepoint);
            return true;
        }
        let at = self.offsets[index];
        let mut buf = [0u8; 4];
        let encoded = codepoint.encode_utf8(&mut buf).as_bytes();
        // Splice in place; the shifted tail keeps its relative order.
        let tail: Vec<u8> = self.bytes.split_off(at);
        self.bytes.extend_from_slice(encoded);
        self.bytes.extend_from_slice(&tail);
        drop_zeroized(tail);
        let encoded_len = encoded.len();
        buf.zeroize();
        self.rebuild_offsets_from(index, at, encoded_len);
        true
    }

    /// Remove the codepoint at `index`. Returns `false` when out of bounds.
    #[must_use]
    pub fn remove_codepoint_at(&mut self, index: usize) -> bool {
        if index >= self.offsets.len() {
            return false;
        }
        let start = self.offsets[index];
        let end = self
            .offsets
            .get(index + 1)
            .copied()
            .unwrap_or(self.bytes.len());
        let removed_len = end - start;
        let mut tail: Vec<u8> = self.bytes.split_off(end);
        self.bytes.truncate(start);
        self.bytes.extend_from_slice(&tail);
        tail.zeroize();
        self.offsets.remove(index);
        for offset in self.offsets.iter_mut().skip(index) {
            *offset -= removed_len;
        }
        true
    }

    /// Remove the last codepoint. Returns `false` when the box is empty.
    #[must_use]
    pub fn remove_last_codepoint(&mut self) -> bool {
        if self.offsets.is_empty() {
            return false;
        }
        self.remove_codepoint_at(self.offsets.len() - 1)
    }

    /// Number of codepoints currently stored.
    #[must_use]
    pub fn length_codepoints(&self) -> usize {
        self.offsets.len()
    }

    /// `true` when the box holds no secret.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The normalized byte form of the secret.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Constant-time equality with another password. Length differences are
    /// reported without inspecting content.
    #[must_use]
    pub fn equals_constant_time(&self, other: &Self) -> bool {
        self.bytes.len() == other.bytes.len()
            && bool::from(self.bytes.as_slice().ct_eq(other.bytes.as_slice()))
    }

    /// Wipe the secret and reset the box to empty.
    pub fn clear(&mut self) {
        self.bytes.zeroize();
        self.bytes.clear();
        self.offsets.clear();
    }

    fn rebuild_offsets_from(&mut self, index: usize, at: usize, inserted_len: usize) {
        self.offsets.insert(index, at);
        for offset in self.offsets.iter_mut().skip(index + 1) {
            *offset += inserted_len;
        }
    }
}

impl Drop for Password {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl Clone for Password {
    fn clone(&self) -> Self {
        Self {
            bytes: self.bytes.clone(),
            offsets: self.offsets.clone(),
        }
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Password(***)")
    }
}

fn drop_zeroized(mut data: Vec<u8>) {
    data.zeroize();
}
