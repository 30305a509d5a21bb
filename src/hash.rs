//! Content hashing for task identity and cache fingerprints.

use std::fmt::Debug;

use serde::Serialize;

/// 32 bytes length generic hash
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    pub fn hash_file(path: impl AsRef<std::path::Path>) -> std::io::Result<Self> {
        Ok(blake3::Hasher::new()
            .update_mmap_rayon(path)?
            .finalize()
            .into())
    }

    /// Structural hash of any serializable value. Used to derive task
    /// identity from tagged operation descriptors, so that a changed kernel
    /// parameter (or a bumped formula revision) yields a different identity.
    pub fn hash_value<T: Serialize>(value: &T) -> Self {
        let mut buffer = Vec::new();
        ciborium::into_writer(value, &mut buffer)
            .expect("in-memory CBOR encoding cannot fail for plain data");
        Self::hash(buffer)
    }

    /// Fold several hashes into one, order-sensitive.
    pub fn combine<I>(parts: I) -> Self
    where
        I: IntoIterator<Item = Hash32>,
    {
        let mut hasher = blake3::Hasher::new();
        for part in parts {
            hasher.update(&part.0);
        }
        hasher.finalize().into()
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = vec![0u8; 64];

        for (i, &byte) in self.0.iter().enumerate() {
            acc[i * 2] = HEX[(byte >> 4) as usize];
            acc[i * 2 + 1] = HEX[(byte & 0xF) as usize];
        }

        String::from_utf8(acc).unwrap()
    }
}

impl Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_roundtrip_is_stable() {
        let a = Hash32::hash(b"landcover");
        let b = Hash32::hash(b"landcover");
        assert_eq!(a, b);
        assert_eq!(a.to_hex().len(), 64);
    }

    #[test]
    fn structural_hash_tracks_content() {
        #[derive(Serialize)]
        struct Params {
            scalar: f64,
        }

        let a = Hash32::hash_value(&Params { scalar: 0.5 });
        let b = Hash32::hash_value(&Params { scalar: 0.5 });
        let c = Hash32::hash_value(&Params { scalar: 0.75 });
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn combine_is_order_sensitive() {
        let a = Hash32::hash(b"a");
        let b = Hash32::hash(b"b");
        assert_ne!(Hash32::combine([a, b]), Hash32::combine([b, a]));
    }
}
