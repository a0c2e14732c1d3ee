//! Content digests, the only cross component reference inside the store.

use crate::utils;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A content digest: the SHA-256 of a byte string together with its length.
///
/// Two digests are equal iff the byte strings they reference are equal; the
/// size rides along so that transfer layers can budget without fetching.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Digest {
    /// Lowercase hex SHA-256 of the referenced bytes.
    pub hash: String,
    /// Length of the referenced bytes.
    pub size_bytes: u64,
}

impl Digest {
    /// Computes the digest of an in-memory buffer.
    pub fn of_bytes(bytes: impl AsRef<[u8]>) -> Self {
        let bytes = bytes.as_ref();
        Self { hash: utils::sha256_hex(bytes), size_bytes: bytes.len() as u64 }
    }

    /// Returns the `(prefix, rest)` pair used for the two level object
    /// directory layout.
    pub fn split_hash(&self) -> (&str, &str) {
        self.hash.split_at(2)
    }

    /// A shortened digest for log output.
    pub fn brief(&self) -> &str {
        &self.hash[..self.hash.len().min(8)]
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.hash, self.size_bytes)
    }
}
