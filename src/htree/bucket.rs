//! Bucket Page
//!
//! ## Encoding
//! ```text
//! ┌──────────┬─────────────┬──────────────────────────────────────────────┐
//! │ kind=0   │ count (u32) │ (keyLen u32, valLen u32, key, value) * count │
//! └──────────┴─────────────┴──────────────────────────────────────────────┘
//! ```

use bytes::{Buf, BufMut};

use super::{hash_key, HASH_BITS, KIND_BUCKET};
use crate::error::{KeelError, Result};

/// Key/value pairs whose hashes share a prefix
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BucketPage {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
}

impl BucketPage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[(Vec<u8>, Vec<u8>)] {
        &self.entries
    }

    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(k, _)| k.as_slice() == key)
            .map(|(_, v)| v.as_slice())
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    /// Insert or replace; returns the previous value
    pub fn insert(&mut self, key: Vec<u8>, value: Vec<u8>) -> Option<Vec<u8>> {
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, v)) => Some(std::mem::replace(v, value)),
            None => {
                self.entries.push((key, value));
                None
            }
        }
    }

    pub fn remove(&mut self, key: &[u8]) -> Option<Vec<u8>> {
        let pos = self.entries.iter().position(|(k, _)| k.as_slice() == key)?;
        Some(self.entries.remove(pos).1)
    }

    /// Partition by hash bit `bit` (0 = most significant)
    ///
    /// Returns (bit clear, bit set).
    pub fn split(self, bit: u32) -> (BucketPage, BucketPage) {
        debug_assert!(bit < HASH_BITS);
        let (high, low): (Vec<_>, Vec<_>) = self
            .entries
            .into_iter()
            .partition(|(k, _)| (hash_key(k) >> (HASH_BITS - 1 - bit)) & 1 == 1);
        (BucketPage { entries: low }, BucketPage { entries: high })
    }

    pub fn encode(&self) -> Vec<u8> {
        let size: usize = self.entries.iter().map(|(k, v)| 8 + k.len() + v.len()).sum();
        let mut buf = Vec::with_capacity(5 + size);
        buf.put_u8(KIND_BUCKET);
        buf.put_u32_le(self.entries.len() as u32);
        for (key, value) in &self.entries {
            buf.put_u32_le(key.len() as u32);
            buf.put_u32_le(value.len() as u32);
            buf.put_slice(key);
            buf.put_slice(value);
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 5 || bytes[0] != KIND_BUCKET {
            return Err(corrupt("not a bucket page"));
        }
        let mut buf = &bytes[1..];
        let count = buf.get_u32_le() as usize;

        let mut entries = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            if buf.remaining() < 8 {
                return Err(corrupt("truncated bucket entry header"));
            }
            let klen = buf.get_u32_le() as usize;
            let vlen = buf.get_u32_le() as usize;
            if buf.remaining() < klen + vlen {
                return Err(corrupt("truncated bucket entry"));
            }
            let key = buf[..klen].to_vec();
            buf.advance(klen);
            let value = buf[..vlen].to_vec();
            buf.advance(vlen);
            entries.push((key, value));
        }
        if buf.has_remaining() {
            return Err(corrupt("trailing bytes after bucket entries"));
        }
        Ok(Self { entries })
    }
}

fn corrupt(msg: &str) -> KeelError {
    KeelError::StructuralInvariantViolation(msg.to_string())
}
