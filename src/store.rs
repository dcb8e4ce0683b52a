//! Persistence collaborator interface.
//!
//! The core only needs three operations, all keyed by (partition, year):
//! which sequence numbers exist, where the sequence currently ends, and an
//! upsert. `save_record` must tolerate being called twice with the same
//! record; re-running a search and re-persisting its result is the
//! idempotency anchor of the whole system.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{HarvestError, Result};
use crate::identifier::parse_case_number;
use crate::parse::Record;

/// Upsert outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveStatus {
    Saved,
    Updated,
}

/// Persistence collaborator.
#[async_trait]
pub trait CaseStore: Send + Sync {
    async fn existing_sequence_numbers(&self, partition: &str, year: &str)
        -> Result<BTreeSet<u32>>;

    /// Highest persisted sequence number, 0 when nothing is persisted.
    async fn last_sequence_number(&self, partition: &str, year: &str) -> Result<u32>;

    async fn save_record(&self, partition: &str, year: &str, record: &Record)
        -> Result<SaveStatus>;
}

fn sequence_of(record: &Record) -> Result<u32> {
    parse_case_number(&record.case_number)
        .map(|parsed| parsed.sequence)
        .ok_or_else(|| {
            HarvestError::Store(format!(
                "unparseable identifier in record: {}",
                record.case_number
            ))
        })
}

/// In-memory store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<HashMap<(String, String), BTreeMap<u32, Record>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate a partition with placeholder records.
    pub async fn seed(&self, partition: &str, year: &str, sequences: &[u32]) {
        let mut inner = self.inner.lock().await;
        let cases = inner
            .entry((partition.to_string(), year.to_string()))
            .or_default();
        for &seq in sequences {
            cases.insert(
                seq,
                Record {
                    case_number: format!("seed/{seq}"),
                    result_index: 0,
                },
            );
        }
    }

    pub async fn record_count(&self, partition: &str, year: &str) -> usize {
        let inner = self.inner.lock().await;
        inner
            .get(&(partition.to_string(), year.to_string()))
            .map(BTreeMap::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl CaseStore for MemoryStore {
    async fn existing_sequence_numbers(
        &self,
        partition: &str,
        year: &str,
    ) -> Result<BTreeSet<u32>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .get(&(partition.to_string(), year.to_string()))
            .map(|cases| cases.keys().copied().collect())
            .unwrap_or_default())
    }

    async fn last_sequence_number(&self, partition: &str, year: &str) -> Result<u32> {
        let inner = self.inner.lock().await;
        Ok(inner
            .get(&(partition.to_string(), year.to_string()))
            .and_then(|cases| cases.keys().next_back().copied())
            .unwrap_or(0))
    }

    async fn save_record(
        &self,
        partition: &str,
        year: &str,
        record: &Record,
    ) -> Result<SaveStatus> {
        let sequence = sequence_of(record)?;
        let mut inner = self.inner.lock().await;
        let cases = inner
            .entry((partition.to_string(), year.to_string()))
            .or_default();
        let status = if cases.insert(sequence, record.clone()).is_some() {
            SaveStatus::Updated
        } else {
            SaveStatus::Saved
        };
        Ok(status)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    /// Keyed `"{partition}/{year}"`.
    cases: HashMap<String, BTreeMap<u32, Record>>,
}

/// File-backed store: the whole state is a JSON snapshot rewritten after
/// every upsert. Suited to the request rates this crawler runs at.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    state: Mutex<Snapshot>,
}

impl JsonFileStore {
    /// Open the snapshot, creating an empty state when the file is absent.
    pub async fn open(path: PathBuf) -> Result<Self> {
        let snapshot = match fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                HarvestError::Store(format!("corrupt snapshot {}: {e}", path.display()))
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Snapshot::default(),
            Err(err) => {
                return Err(HarvestError::Store(format!(
                    "cannot read snapshot {}: {err}",
                    path.display()
                )))
            }
        };
        debug!(path = %path.display(), groups = snapshot.cases.len(), "store snapshot opened");
        Ok(Self {
            path,
            state: Mutex::new(snapshot),
        })
    }

    fn group_key(partition: &str, year: &str) -> String {
        format!("{partition}/{year}")
    }

    async fn persist(&self, snapshot: &Snapshot) -> Result<()> {
        let content = serde_json::to_string_pretty(snapshot)
            .map_err(|e| HarvestError::Store(format!("snapshot serialization failed: {e}")))?;
        fs::write(&self.path, content).await.map_err(|e| {
            HarvestError::Store(format!("cannot write snapshot {}: {e}", self.path.display()))
        })
    }
}

#[async_trait]
impl CaseStore for JsonFileStore {
    async fn existing_sequence_numbers(
        &self,
        partition: &str,
        year: &str,
    ) -> Result<BTreeSet<u32>> {
        let state = self.state.lock().await;
        Ok(state
            .cases
            .get(&Self::group_key(partition, year))
            .map(|cases| cases.keys().copied().collect())
            .unwrap_or_default())
    }

    async fn last_sequence_number(&self, partition: &str, year: &str) -> Result<u32> {
        let state = self.state.lock().await;
        Ok(state
            .cases
            .get(&Self::group_key(partition, year))
            .and_then(|cases| cases.keys().next_back().copied())
            .unwrap_or(0))
    }

    async fn save_record(
        &self,
        partition: &str,
        year: &str,
        record: &Record,
    ) -> Result<SaveStatus> {
        let sequence = sequence_of(record)?;
        let mut state = self.state.lock().await;
        let status = if state
            .cases
            .entry(Self::group_key(partition, year))
            .or_default()
            .insert(sequence, record.clone())
            .is_some()
        {
            SaveStatus::Updated
        } else {
            SaveStatus::Saved
        };
        self.persist(&state).await?;
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(case_number: &str) -> Record {
        Record {
            case_number: case_number.to_string(),
            result_index: 0,
        }
    }

    #[tokio::test]
    async fn memory_store_upsert_is_idempotent() {
        let store = MemoryStore::new();
        let rec = record("7194-25-00-4/215");

        assert_eq!(
            store.save_record("central", "2025", &rec).await.unwrap(),
            SaveStatus::Saved
        );
        assert_eq!(
            store.save_record("central", "2025", &rec).await.unwrap(),
            SaveStatus::Updated
        );
        assert_eq!(store.record_count("central", "2025").await, 1);
    }

    #[tokio::test]
    async fn memory_store_tracks_sequence_bounds() {
        let store = MemoryStore::new();
        store.seed("central", "2025", &[1, 2, 5, 7]).await;

        let existing = store
            .existing_sequence_numbers("central", "2025")
            .await
            .unwrap();
        assert_eq!(existing, BTreeSet::from([1, 2, 5, 7]));
        assert_eq!(store.last_sequence_number("central", "2025").await.unwrap(), 7);
        assert_eq!(store.last_sequence_number("other", "2025").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn rejects_unparseable_record_identifiers() {
        let store = MemoryStore::new();
        let result = store
            .save_record("central", "2025", &record("garbage"))
            .await;
        assert!(matches!(result, Err(HarvestError::Store(_))));
    }

    #[tokio::test]
    async fn json_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        {
            let store = JsonFileStore::open(path.clone()).await.unwrap();
            store
                .save_record("central", "2025", &record("7194-25-00-4/215"))
                .await
                .unwrap();
            store
                .save_record("central", "2025", &record("7194-25-00-4/7"))
                .await
                .unwrap();
        }

        let reopened = JsonFileStore::open(path).await.unwrap();
        let existing = reopened
            .existing_sequence_numbers("central", "2025")
            .await
            .unwrap();
        assert_eq!(existing, BTreeSet::from([7, 215]));
        assert_eq!(
            reopened.last_sequence_number("central", "2025").await.unwrap(),
            215
        );
    }
}
