//! Content fingerprints for change detection.
//!
//! The fingerprint is the hex SHA-256 of the file bytes. It keys the vector
//! store, so an edited or replaced file is always treated as a new image.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::errors::EngineError;

/// Read buffer size; bounds memory use on very large images.
const CHUNK_SIZE: usize = 64 * 1024;

/// Compute the fingerprint of a file, reading it in fixed-size chunks.
pub fn file_fingerprint(path: &Path) -> Result<String, EngineError> {
    let hash_err = |source| EngineError::FileHash {
        path: path.to_path_buf(),
        source,
    };

    let mut file = File::open(path).map_err(hash_err)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];

    loop {
        let read = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(hash_err(e)),
        };
        hasher.update(&buf[..read]);
    }

    log::debug!("fingerprinted {}", path.display());
    Ok(format!("{:x}", hasher.finalize()))
}

/// Fingerprint of bytes already in memory. Matches `file_fingerprint` for
/// a file holding the same bytes.
pub fn bytes_fingerprint(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_bytes_same_fingerprint_across_paths() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.png");
        let b = dir.path().join("nested-b.jpg");
        std::fs::write(&a, b"identical content").unwrap();
        std::fs::write(&b, b"identical content").unwrap();

        let fa = file_fingerprint(&a).unwrap();
        assert_eq!(fa, file_fingerprint(&a).unwrap());
        assert_eq!(fa, file_fingerprint(&b).unwrap());
        assert_eq!(fa, bytes_fingerprint(b"identical content"));
        assert_eq!(fa.len(), 64);
    }

    #[test]
    fn test_changed_byte_changes_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img.png");
        std::fs::write(&path, b"version one").unwrap();
        let before = file_fingerprint(&path).unwrap();

        std::fs::write(&path, b"version two").unwrap();
        assert_ne!(before, file_fingerprint(&path).unwrap());
    }

    #[test]
    fn test_multi_chunk_file_matches_in_memory_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bmp");
        let data: Vec<u8> = (0..(CHUNK_SIZE * 3 + 17)).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        assert_eq!(file_fingerprint(&path).unwrap(), bytes_fingerprint(&data));
    }

    #[test]
    fn test_missing_file_is_hash_error() {
        let result = file_fingerprint(Path::new("/nonexistent/dir/missing.png"));
        assert!(matches!(result, Err(EngineError::FileHash { .. })));
    }
}
