//! Content hashing.
//!
//! Files are hashed with SHA-256 over the full byte stream, read in fixed
//! chunks to bound memory on large files.

use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::{NodeError, NodeResult};

/// Read chunk size for streaming hashes.
pub const HASH_CHUNK_SIZE: usize = 64 * 1024;

/// Hash a byte slice, returning lowercase hex.
pub fn hash_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Hash a file's contents, returning lowercase hex.
///
/// Fails with an IO error if the file disappears or becomes unreadable
/// mid-hash; callers treat that as transient and retry on the next scan.
pub fn hash_file(path: &Path) -> NodeResult<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// [`hash_file`] on the blocking pool.
pub async fn hash_file_async(path: impl Into<PathBuf>) -> NodeResult<String> {
    let path = path.into();
    tokio::task::spawn_blocking(move || hash_file(&path))
        .await
        .map_err(|e| NodeError::Io(std::io::Error::other(e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_hash_bytes_known_vector() {
        // SHA-256("abc")
        assert_eq!(
            hash_bytes(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_hash_file_matches_hash_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        // Larger than one chunk so the streaming path is exercised
        let data: Vec<u8> = (0..(HASH_CHUNK_SIZE * 2 + 17)).map(|i| (i % 251) as u8).collect();
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&data)
            .unwrap();

        assert_eq!(hash_file(&path).unwrap(), hash_bytes(&data));
    }

    #[test]
    fn test_hash_missing_file_is_io_error() {
        let err = hash_file(Path::new("/definitely/not/here")).unwrap_err();
        assert!(matches!(err, NodeError::Io(_)));
    }

    #[tokio::test]
    async fn test_hash_file_async() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(
            hash_file_async(&path).await.unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
