//! Content hashing.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Hash a file's bytes with BLAKE2b-256, reading `chunk_size` bytes at a time.
///
/// Returns the lowercase hex digest. Used for equality and deduplication
/// only.
pub fn content_hash(path: &Path, chunk_size: usize) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Blake2b::<U32>::new();
    let mut buffer = vec![0u8; chunk_size.max(1)];

    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Hash an in-memory buffer; equal to [`content_hash`] of a file with the same bytes.
pub fn bytes_hash(data: &[u8]) -> String {
    let mut hasher = Blake2b::<U32>::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}
