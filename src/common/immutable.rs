//! Content hash blocks.

use bytes::Bytes;

use super::{ChkKey, Id, VerifyError};

#[derive(Debug, Clone, PartialEq, Eq)]
/// An immutable block, addressed by the hash of its headers and data.
pub struct ChkBlock {
    key: ChkKey,
    headers: Bytes,
    data: Bytes,
}

impl ChkBlock {
    pub fn new(headers: impl Into<Bytes>, data: impl Into<Bytes>) -> Self {
        let headers = headers.into();
        let data = data.into();

        Self {
            key: ChkKey(hash_chk(&headers, &data)),
            headers,
            data,
        }
    }

    /// Rebuild a block received from a peer, checking it against the requested key.
    pub fn verify(key: &ChkKey, headers: Bytes, data: Bytes) -> Result<Self, VerifyError> {
        if !validate_chk(&headers, &data, key) {
            return Err(VerifyError::HashMismatch);
        }

        Ok(Self {
            key: *key,
            headers,
            data,
        })
    }

    // === Getters ===

    pub fn key(&self) -> &ChkKey {
        &self.key
    }

    pub fn headers(&self) -> &Bytes {
        &self.headers
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }
}

pub fn validate_chk(headers: &[u8], data: &[u8], key: &ChkKey) -> bool {
    hash_chk(headers, data) == key.0
}

pub fn hash_chk(headers: &[u8], data: &[u8]) -> Id {
    Id::hash(&[
        format!("{}:", headers.len()).as_bytes(),
        headers,
        format!("{}:", data.len()).as_bytes(),
        data,
    ])
}
