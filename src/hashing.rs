//! Content hashing.
//!
//! Every file in the VFS is identified by the blake3 digest of its bytes.
//! Hashing always streams through a fixed buffer so that multi-gigabyte
//! archives never have to fit in memory.

use std::fmt;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::VfsError;

/// Read buffer for streaming hashes.
const HASH_BUF_SIZE: usize = 64 * 1024;

/// A 256-bit blake3 content digest.
///
/// `ContentHash` is the *content identity* of a file: two files with equal
/// hashes are treated as the same bytes everywhere in the VFS, independent of
/// where they live.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(#[serde(with = "hex_bytes")] pub [u8; 32]);

impl ContentHash {
    /// Placeholder hash for synthesized nodes whose bytes have never been
    /// observed (intermediate containers created by manifest backfill).
    pub const UNKNOWN: ContentHash = ContentHash([0u8; 32]);

    /// Hash a byte slice.
    pub fn of_bytes(bytes: &[u8]) -> ContentHash {
        ContentHash(*blake3::hash(bytes).as_bytes())
    }

    /// True if this is the all-zero placeholder.
    pub fn is_unknown(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Lowercase hex rendering of the digest.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

/// Stream a reader to completion and return its digest and byte count.
pub fn hash_reader<R: Read>(mut reader: R) -> std::io::Result<(ContentHash, u64)> {
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; HASH_BUF_SIZE];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((ContentHash(*hasher.finalize().as_bytes()), total))
}

/// Hash a file on disk without blocking the async runtime.
pub async fn hash_file(path: &Path) -> Result<(ContentHash, u64), VfsError> {
    let path_buf = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let file = std::fs::File::open(&path_buf).map_err(|e| VfsError::io(e, &path_buf))?;
        hash_reader(std::io::BufReader::new(file)).map_err(|e| VfsError::io(e, &path_buf))
    })
    .await
    .map_err(|e| VfsError::Other(Box::new(e)))?
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], ser: S) -> Result<S::Ok, S::Error> {
        let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
        ser.serialize_str(&hex)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<[u8; 32], D::Error> {
        let hex = String::deserialize(de)?;
        if hex.len() != 64 {
            return Err(serde::de::Error::custom(format!(
                "invalid hash length: {}",
                hex.len()
            )));
        }
        let mut out = [0u8; 32];
        for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
            let byte_str = std::str::from_utf8(chunk).map_err(serde::de::Error::custom)?;
            out[i] = u8::from_str_radix(byte_str, 16).map_err(serde::de::Error::custom)?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn bytes_and_reader_agree() {
        let data = b"the quick brown fox";
        let from_bytes = ContentHash::of_bytes(data);
        let (from_reader, len) = hash_reader(&data[..]).unwrap();
        assert_eq!(from_bytes, from_reader);
        assert_eq!(len, data.len() as u64);
    }

    #[test]
    fn hex_round_trip() {
        let hash = ContentHash::of_bytes(b"abc");
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json.len(), 66); // 64 hex chars + quotes
        let back: ContentHash = serde_json::from_str(&json).unwrap();
        assert_eq!(hash, back);
    }

    #[test]
    fn unknown_is_all_zeros() {
        assert!(ContentHash::UNKNOWN.is_unknown());
        assert!(!ContentHash::of_bytes(b"x").is_unknown());
    }

    #[tokio::test]
    async fn hash_file_matches_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(&[7u8; 100_000]).unwrap();
        drop(f);

        let (h, len) = hash_file(&path).await.unwrap();
        assert_eq!(len, 100_000);
        assert_eq!(h, ContentHash::of_bytes(&[7u8; 100_000]));
    }
}
