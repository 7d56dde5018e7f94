//! SHA-256 verification of finished artifacts.
//!
//! Runs once after the last byte is written, off the transfer path, in a
//! blocking task so large files do not stall the runtime.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use super::StorageError;

const BUF_SIZE: usize = 64 * 1024;

/// Compute SHA-256 of a file as lowercase hex. Memory use is bounded by the buffer.
pub fn sha256_path(path: &Path) -> Result<String, StorageError> {
    let mut f = File::open(path).map_err(|e| StorageError::io("open", path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; BUF_SIZE];
    loop {
        let n = f.read(&mut buf).map_err(|e| StorageError::io("read", path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Hash `path` on the blocking pool and compare with `expected` (case-insensitive hex).
pub async fn verify(path: PathBuf, expected: &str) -> Result<(), StorageError> {
    let hash_path = path.clone();
    let actual = tokio::task::spawn_blocking(move || sha256_path(&hash_path))
        .await
        .map_err(|e| StorageError::io("hash", &path, std::io::Error::other(e)))??;
    if actual.eq_ignore_ascii_case(expected.trim()) {
        Ok(())
    } else {
        Err(StorageError::ChecksumMismatch {
            path,
            expected: expected.trim().to_ascii_lowercase(),
            actual,
        })
    }
}
