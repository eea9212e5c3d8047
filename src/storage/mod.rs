//! Durable storage layer -- bucketed key-value store backed by sled.
//!
//! Buckets map to sled trees; single-key writes are atomic and the tree is
//! flushed to disk on a short interval plus on close. An optional 32-byte
//! key enables at-rest encryption of values.

pub mod results;

use std::path::Path;
use std::sync::Arc;

use base64::Engine as _;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use thiserror::Error;

const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("not found")]
    NotFound,

    #[error("bucket and key are required")]
    EmptyKey,

    #[error("storage backend: {0}")]
    Backend(#[from] sled::Error),

    #[error("encode/decode: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("encryption: {0}")]
    Crypto(String),
}

/// Bucketed durable map. Iteration order within a bucket is unspecified.
pub trait Store: Send + Sync {
    fn put(&self, bucket: &str, key: &str, value: &[u8]) -> Result<(), StorageError>;
    fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError>;
    fn for_each(
        &self,
        bucket: &str,
        visit: &mut dyn FnMut(&str, &[u8]) -> Result<(), StorageError>,
    ) -> Result<(), StorageError>;
    fn delete(&self, bucket: &str, key: &str) -> Result<(), StorageError>;
    fn close(&self) -> Result<(), StorageError>;
}

pub struct SledStore {
    db: sled::Db,
    cipher: Option<ChaCha20Poly1305>,
}

/// Open (or create) the store at `path`. `key_base64`, when non-empty, must
/// decode to exactly 32 bytes.
pub fn open(path: &Path, key_base64: &str) -> Result<Arc<SledStore>, StorageError> {
    let cipher = if key_base64.is_empty() {
        None
    } else {
        let key = base64::engine::general_purpose::STANDARD
            .decode(key_base64)
            .map_err(|e| StorageError::Crypto(format!("decode encryption key: {e}")))?;
        if key.len() != 32 {
            return Err(StorageError::Crypto(
                "encryption key must be 32 bytes".to_string(),
            ));
        }
        Some(ChaCha20Poly1305::new(Key::from_slice(&key)))
    };

    let db = sled::Config::new()
        .path(path)
        .flush_every_ms(Some(500))
        .open()?;

    Ok(Arc::new(SledStore { db, cipher }))
}

impl SledStore {
    fn seal(&self, plain: &[u8]) -> Result<Vec<u8>, StorageError> {
        let Some(cipher) = &self.cipher else {
            return Ok(plain.to_vec());
        };
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce), plain)
            .map_err(|_| StorageError::Crypto("encrypt value".to_string()))?;
        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn unseal(&self, raw: &[u8]) -> Result<Vec<u8>, StorageError> {
        let Some(cipher) = &self.cipher else {
            return Ok(raw.to_vec());
        };
        if raw.len() < NONCE_LEN {
            return Err(StorageError::Crypto("value too short".to_string()));
        }
        let (nonce, sealed) = raw.split_at(NONCE_LEN);
        cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| StorageError::Crypto("decrypt value".to_string()))
    }
}

impl Store for SledStore {
    fn put(&self, bucket: &str, key: &str, value: &[u8]) -> Result<(), StorageError> {
        if bucket.is_empty() || key.is_empty() {
            return Err(StorageError::EmptyKey);
        }
        let tree = self.db.open_tree(bucket)?;
        tree.insert(key.as_bytes(), self.seal(value)?)?;
        Ok(())
    }

    fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        if bucket.is_empty() || key.is_empty() {
            return Err(StorageError::EmptyKey);
        }
        let tree = self.db.open_tree(bucket)?;
        match tree.get(key.as_bytes())? {
            Some(raw) => self.unseal(&raw),
            None => Err(StorageError::NotFound),
        }
    }

    fn for_each(
        &self,
        bucket: &str,
        visit: &mut dyn FnMut(&str, &[u8]) -> Result<(), StorageError>,
    ) -> Result<(), StorageError> {
        if bucket.is_empty() {
            return Err(StorageError::EmptyKey);
        }
        let tree = self.db.open_tree(bucket)?;
        for entry in tree.iter() {
            let (key, raw) = entry?;
            let key = String::from_utf8_lossy(&key).into_owned();
            let value = self.unseal(&raw)?;
            visit(&key, &value)?;
        }
        Ok(())
    }

    fn delete(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        if bucket.is_empty() || key.is_empty() {
            return Err(StorageError::EmptyKey);
        }
        let tree = self.db.open_tree(bucket)?;
        tree.remove(key.as_bytes())?;
        Ok(())
    }

    fn close(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, Arc<SledStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir.path().join("kv"), "").unwrap();
        (dir, store)
    }

    #[test]
    fn put_get_roundtrip() {
        let (_dir, store) = open_temp();
        store.put("bucket", "key", b"value").unwrap();
        assert_eq!(store.get("bucket", "key").unwrap(), b"value");
    }

    #[test]
    fn get_missing_is_not_found() {
        let (_dir, store) = open_temp();
        assert!(matches!(
            store.get("bucket", "missing"),
            Err(StorageError::NotFound)
        ));
    }

    #[test]
    fn empty_bucket_or_key_rejected() {
        let (_dir, store) = open_temp();
        assert!(matches!(
            store.put("", "key", b"v"),
            Err(StorageError::EmptyKey)
        ));
        assert!(matches!(
            store.get("bucket", ""),
            Err(StorageError::EmptyKey)
        ));
    }

    #[test]
    fn for_each_visits_bucket_only() {
        let (_dir, store) = open_temp();
        store.put("bucket", "key1", b"value1").unwrap();
        store.put("bucket", "key2", b"value2").unwrap();
        store.put("other", "key3", b"value3").unwrap();

        let mut seen = 0;
        store
            .for_each("bucket", &mut |_key, _value| {
                seen += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, 2);
    }

    #[test]
    fn delete_removes_key() {
        let (_dir, store) = open_temp();
        store.put("bucket", "key", b"value").unwrap();
        store.delete("bucket", "key").unwrap();
        assert!(matches!(
            store.get("bucket", "key"),
            Err(StorageError::NotFound)
        ));
    }

    #[test]
    fn encryption_key_length_validated() {
        let dir = tempfile::tempdir().unwrap();
        let short = base64::engine::general_purpose::STANDARD.encode([1u8; 16]);
        assert!(open(&dir.path().join("kv"), &short).is_err());
        assert!(open(&dir.path().join("kv2"), "not base64!").is_err());
    }

    #[test]
    fn encrypted_values_roundtrip_and_differ_at_rest() {
        let dir = tempfile::tempdir().unwrap();
        let key = base64::engine::general_purpose::STANDARD.encode([7u8; 32]);
        let store = open(&dir.path().join("kv"), &key).unwrap();
        store.put("bucket", "key", b"secret").unwrap();
        assert_eq!(store.get("bucket", "key").unwrap(), b"secret");

        // The raw tree value must not contain the plaintext.
        let tree = store.db.open_tree("bucket").unwrap();
        let raw = tree.get(b"key").unwrap().unwrap();
        assert!(!raw.windows(6).any(|w| w == b"secret"));
    }
}
