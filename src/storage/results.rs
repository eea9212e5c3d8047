//! Durable append-only store of full scan results.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::RngCore;

use crate::scanner::ScanResult;
use crate::storage::{StorageError, Store};

const RESULTS_BUCKET: &str = "results";

pub struct ResultsStore {
    store: Arc<dyn Store>,
}

impl ResultsStore {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Appends a result under a `unix_nanos-scanner-randhex` key. The random
    /// suffix keeps keys unique under concurrent writes in the same
    /// nanosecond.
    pub fn save(&self, result: &ScanResult) -> Result<(), StorageError> {
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
        let key = format!("{}-{}-{}", nanos, result.scanner_name, rand_suffix());
        let raw = serde_json::to_vec(result)?;
        self.store.put(RESULTS_BUCKET, &key, &raw)
    }

    /// Decodes every stored result. Order follows KV iteration and is not
    /// chronological; callers that need order must sort.
    pub fn list(&self) -> Result<Vec<ScanResult>, StorageError> {
        let mut results = Vec::new();
        let walk = self.store.for_each(RESULTS_BUCKET, &mut |_key, value| {
            let result: ScanResult = serde_json::from_slice(value)?;
            results.push(result);
            Ok(())
        });
        match walk {
            Ok(()) | Err(StorageError::NotFound) => Ok(results),
            Err(e) => Err(e),
        }
    }

    /// Deletes results finished before `cutoff`. Entries with no finish
    /// timestamp (interrupted writes) are kept.
    pub fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<(), StorageError> {
        let mut stale = Vec::new();
        self.store.for_each(RESULTS_BUCKET, &mut |key, value| {
            let Ok(result) = serde_json::from_slice::<ScanResult>(value) else {
                return Ok(());
            };
            if matches!(result.finished_at, Some(at) if at < cutoff) {
                stale.push(key.to_string());
            }
            Ok(())
        })?;
        for key in stale {
            self.store.delete(RESULTS_BUCKET, &key)?;
        }
        Ok(())
    }
}

fn rand_suffix() -> String {
    let mut buf = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::Status;

    #[test]
    fn save_list_prune() {
        let dir = tempfile::tempdir().unwrap();
        let store = crate::storage::open(&dir.path().join("kv"), "").unwrap();
        let results = ResultsStore::new(store);

        let now = Utc::now();
        let mut old = ScanResult::new("test", Status::Success);
        old.finished_at = Some(now - chrono::Duration::hours(48));
        results.save(&old).unwrap();

        let mut fresh = ScanResult::new("test", Status::Success);
        fresh.finished_at = Some(now);
        results.save(&fresh).unwrap();

        assert_eq!(results.list().unwrap().len(), 2);

        results
            .prune_older_than(now - chrono::Duration::hours(24))
            .unwrap();
        assert_eq!(results.list().unwrap().len(), 1);
    }

    #[test]
    fn list_on_empty_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let store = crate::storage::open(&dir.path().join("kv"), "").unwrap();
        let results = ResultsStore::new(store);
        assert!(results.list().unwrap().is_empty());
    }
}
