//! SHA-256 chunk verification of downloaded payloads.

use crate::protocol::models::Chunks;
use crate::PatchflowError;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Largest chunk size accepted from a manifest.
pub const MAX_CHUNK_SIZE: u64 = 64 * 1024 * 1024;

/// Reject a manifest whose chunk size is zero or implausibly large.
pub fn validate_chunks(chunks: &Chunks) -> Result<(), PatchflowError> {
    if chunks.size == 0 || chunks.size > MAX_CHUNK_SIZE {
        return Err(PatchflowError::ProtocolError(format!(
            "chunk size {} outside 1..={}",
            chunks.size, MAX_CHUNK_SIZE
        )));
    }
    Ok(())
}

fn chunk_buffer(chunks: &Chunks) -> io::Result<Vec<u8>> {
    validate_chunks(chunks)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    Ok(vec![0u8; chunks.size as usize])
}

/// Compute SHA-256 of `data` as lowercase hex.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Read up to `buf.len()` bytes, stopping early only at end of file.
fn read_block(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

/// Bytes at the start of `path` covered by full chunks whose hashes match.
///
/// Used to decide where a partial download can resume.
pub fn verified_prefix(path: &Path, chunks: &Chunks) -> io::Result<u64> {
    let mut buf = chunk_buffer(chunks)?;
    let mut file = File::open(path)?;
    let mut verified = 0u64;

    for expected in &chunks.hashes {
        let n = read_block(&mut file, &mut buf)?;
        if n < buf.len() || !sha256_hex(&buf[..n]).eq_ignore_ascii_case(expected) {
            break;
        }
        verified += n as u64;
    }
    Ok(verified)
}

/// Index of the first chunk of `path` that does not match its hash.
///
/// The final chunk may be shorter than `chunks.size`. Extra data after the
/// last hashed chunk counts as a mismatch at index `hashes.len()`.
pub fn first_corrupt_chunk(path: &Path, chunks: &Chunks) -> io::Result<Option<usize>> {
    if chunks.hashes.is_empty() {
        return Ok(None);
    }
    let mut buf = chunk_buffer(chunks)?;
    let mut file = File::open(path)?;

    for (index, expected) in chunks.hashes.iter().enumerate() {
        let n = read_block(&mut file, &mut buf)?;
        if n == 0 || !sha256_hex(&buf[..n]).eq_ignore_ascii_case(expected) {
            return Ok(Some(index));
        }
    }
    if read_block(&mut file, &mut buf[..1])? > 0 {
        return Ok(Some(chunks.hashes.len()));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn chunks_for(data: &[u8], size: usize) -> Chunks {
        Chunks {
            size: size as u64,
            hashes: data.chunks(size).map(sha256_hex).collect(),
        }
    }

    #[test]
    fn test_sha256_empty() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_intact_file_has_no_corrupt_chunk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("payload.bin");
        let data: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        let chunks = chunks_for(&data, 1000);
        assert_eq!(first_corrupt_chunk(&path, &chunks).unwrap(), None);
        assert_eq!(verified_prefix(&path, &chunks).unwrap(), 2000);
    }

    #[test]
    fn test_detects_corrupt_chunk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("payload.bin");
        let data = vec![7u8; 3000];
        let chunks = chunks_for(&data, 1000);

        let mut corrupted = data.clone();
        corrupted[1500] = 8;
        std::fs::write(&path, &corrupted).unwrap();

        assert_eq!(first_corrupt_chunk(&path, &chunks).unwrap(), Some(1));
        assert_eq!(verified_prefix(&path, &chunks).unwrap(), 1000);
    }

    #[test]
    fn test_truncated_and_oversized_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("payload.bin");
        let data = vec![1u8; 2000];
        let chunks = chunks_for(&data, 1000);

        std::fs::write(&path, &data[..1000]).unwrap();
        assert_eq!(first_corrupt_chunk(&path, &chunks).unwrap(), Some(1));

        let mut longer = data.clone();
        longer.push(0);
        std::fs::write(&path, &longer).unwrap();
        assert_eq!(first_corrupt_chunk(&path, &chunks).unwrap(), Some(2));
    }

    #[test]
    fn test_hash_comparison_ignores_case() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("payload.bin");
        std::fs::write(&path, b"abc").unwrap();

        let chunks = Chunks {
            size: 3,
            hashes: vec![sha256_hex(b"abc").to_uppercase()],
        };
        assert_eq!(first_corrupt_chunk(&path, &chunks).unwrap(), None);
    }

    #[test]
    fn test_oversized_chunk_size_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("payload.bin");
        std::fs::write(&path, b"abc").unwrap();

        let chunks = Chunks {
            size: u64::MAX,
            hashes: vec!["aa".to_string()],
        };
        assert!(matches!(
            validate_chunks(&chunks),
            Err(PatchflowError::ProtocolError(_))
        ));
        let err = first_corrupt_chunk(&path, &chunks).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(verified_prefix(&path, &chunks).is_err());
    }

    #[test]
    fn test_zero_chunk_size_is_rejected() {
        let chunks = Chunks {
            size: 0,
            hashes: vec!["aa".to_string()],
        };
        assert!(validate_chunks(&chunks).is_err());
        assert!(validate_chunks(&Chunks {
            size: MAX_CHUNK_SIZE,
            hashes: Vec::new(),
        })
        .is_ok());
    }
}
