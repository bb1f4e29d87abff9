//! Shared SHA-256 hex digest utilities.
//!
//! Used for provenance input hashes and registry lockfile entries.

use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

/// Read buffer size for streaming file digests.
const HASH_CHUNK_BYTES: usize = 64 * 1024;

/// Compute a SHA-256 hex digest of the given bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    let hash = Sha256::digest(data);
    format!("{hash:x}")
}

/// Compute the SHA-256 hex digest of a file without loading it into memory.
///
/// Returns the digest together with the number of bytes hashed. Volumes can
/// be several hundred megabytes, so callers on an async runtime should run
/// this inside `spawn_blocking`.
pub fn sha256_file(path: &Path) -> std::io::Result<(String, u64)> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_CHUNK_BYTES];
    let mut total: u64 = 0;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((format!("{:x}", hasher.finalize()), total))
}

/// Whether `s` looks like a lowercase SHA-256 hex digest.
pub fn is_sha256_hex(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
