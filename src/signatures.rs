//! Signature feed status persisted in the `signatures` bucket.
//!
//! Feed downloading happens outside the daemon; this store only records
//! and serves what the last update run reported.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::{StorageError, Store};

const SIGNATURES_BUCKET: &str = "signatures";
const STATUS_KEY: &str = "status";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Status {
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub airgap_mode: bool,
    #[serde(default)]
    pub airgap_import_path: String,
    #[serde(default)]
    pub sources: HashMap<String, SourceStatus>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceStatus {
    pub source: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub bytes: u64,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: String,
}

pub struct SignatureStore {
    store: Arc<dyn Store>,
}

impl SignatureStore {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn save_status(&self, status: &Status) -> Result<(), StorageError> {
        let raw = serde_json::to_vec(status)?;
        self.store.put(SIGNATURES_BUCKET, STATUS_KEY, &raw)
    }

    /// Missing status decodes to the empty default.
    pub fn load_status(&self) -> Result<Status, StorageError> {
        match self.store.get(SIGNATURES_BUCKET, STATUS_KEY) {
            Ok(raw) => Ok(serde_json::from_slice(&raw)?),
            Err(StorageError::NotFound) => Ok(Status::default()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrip_and_empty_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = crate::storage::open(&dir.path().join("kv"), "").unwrap();
        let signatures = SignatureStore::new(store);

        let empty = signatures.load_status().unwrap();
        assert!(empty.last_run.is_none());
        assert!(empty.sources.is_empty());

        let mut status = Status {
            last_run: Some(Utc::now()),
            airgap_mode: true,
            ..Status::default()
        };
        status.sources.insert(
            "custom:feed".to_string(),
            SourceStatus {
                source: "custom:feed".to_string(),
                bytes: 1024,
                ..SourceStatus::default()
            },
        );
        signatures.save_status(&status).unwrap();

        let loaded = signatures.load_status().unwrap();
        assert!(loaded.airgap_mode);
        assert_eq!(loaded.sources.len(), 1);
    }
}
