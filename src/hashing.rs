//! Content identification.
//!
//! A book's identity is the BLAKE3 digest of its bytes, read in fixed-size chunks so
//! large files are never held in memory.

use crate::error::Result;
use std::fs::File;
use std::io::Read;
use std::path::Path;

const CHUNK_SIZE: usize = 64 * 1024;

/// Digest and length of a file's contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentId {
    /// Lowercase hex digest.
    pub hash: String,
    /// Number of bytes hashed.
    pub size: u64,
}

/// Hash everything a reader yields.
pub fn identify(mut reader: impl Read) -> Result<ContentId> {
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut size = 0u64;

    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        hasher.update(&buf[..n]);
        size += n as u64;
    }

    Ok(ContentId {
        hash: hasher.finalize().to_hex().to_string(),
        size,
    })
}

/// Hash a file on disk. Blocking; call from `spawn_blocking` in async code.
pub fn identify_file(path: &Path) -> Result<ContentId> {
    identify(File::open(path)?)
}
