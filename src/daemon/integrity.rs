//! Self-integrity check: SHA-256 of the running binary against a
//! configured digest.

use std::io;
use std::path::Path;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

pub fn file_sha256(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("open {} for digest", path.display()))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).context("digest file")?;
    Ok(hex::encode(hasher.finalize()))
}

pub fn binary_sha256() -> Result<String> {
    let exe = std::env::current_exe().context("locate current executable")?;
    file_sha256(&exe)
}

/// Fatal on mismatch; the supervisor calls this before anything else.
pub fn verify_self_integrity(expected: &str) -> Result<()> {
    let expected = expected.trim();
    if expected.is_empty() {
        anyhow::bail!("expected digest is empty");
    }
    let actual = binary_sha256()?;
    if !actual.eq_ignore_ascii_case(expected) {
        anyhow::bail!("binary digest mismatch: expected {expected}, got {actual}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn digest_matches_known_vector() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"abc").unwrap();
        assert_eq!(
            file_sha256(file.path()).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn mismatch_is_fatal() {
        assert!(verify_self_integrity("").is_err());
        assert!(verify_self_integrity("deadbeef").is_err());
    }

    #[test]
    fn self_digest_verifies() {
        let digest = binary_sha256().unwrap();
        verify_self_integrity(&digest).unwrap();
        verify_self_integrity(&digest.to_uppercase()).unwrap();
    }
}
