use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Another instance claimed the index between read and insert.
    #[error("instance index {0} is already taken")]
    IndexTaken(u32),
    #[error("instance id {0} is already registered")]
    DuplicateId(String),
    /// The store rejected the write due to concurrent access; retry.
    #[error("store is busy")]
    Busy,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    /// Conflicts resolved by retrying the registration.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::IndexTaken(_) | StoreError::Busy)
    }
}

/// One row of the shared instances table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: String,
    pub index: u32,
    pub created_at: DateTime<Utc>,
    pub active_at: DateTime<Utc>,
}

/// Shared table of live load-generator instances.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Atomically insert `id` under the smallest free index.
    async fn insert_with_next_index(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<InstanceRecord, StoreError>;

    /// Set `active_at` for `id`; false when the row no longer exists.
    async fn touch(&self, id: &str, now: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Delete rows whose `active_at` is strictly before `cutoff`.
    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn delete(&self, id: &str) -> Result<bool, StoreError>;

    /// `created_at` of the instance holding index 0.
    async fn leader_created_at(&self) -> Result<Option<DateTime<Utc>>, StoreError>;

    async fn list(&self) -> Result<Vec<InstanceRecord>, StoreError>;
}

/// Smallest non-negative index not present in `live`.
pub fn allocate_index<I>(live: I) -> u32
where
    I: IntoIterator<Item = u32>,
{
    let taken: BTreeSet<u32> = live.into_iter().collect();
    let mut candidate = 0u32;
    for index in taken {
        if index != candidate {
            break;
        }
        candidate += 1;
    }
    candidate
}

/// Process-local store, for single-process runs and tests.
#[derive(Default)]
pub struct MemoryInstanceStore {
    rows: Mutex<HashMap<String, InstanceRecord>>,
}

impl MemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InstanceStore for MemoryInstanceStore {
    async fn insert_with_next_index(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<InstanceRecord, StoreError> {
        let mut rows = self.rows.lock().await;
        if rows.contains_key(id) {
            return Err(StoreError::DuplicateId(id.to_string()));
        }
        let index = allocate_index(rows.values().map(|r| r.index));
        let record = InstanceRecord {
            id: id.to_string(),
            index,
            created_at: now,
            active_at: now,
        };
        rows.insert(id.to_string(), record.clone());
        Ok(record)
    }

    async fn touch(&self, id: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut rows = self.rows.lock().await;
        match rows.get_mut(id) {
            Some(row) => {
                row.active_at = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut rows = self.rows.lock().await;
        let before = rows.len();
        rows.retain(|_, row| row.active_at >= cutoff);
        Ok((before - rows.len()) as u64)
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.rows.lock().await.remove(id).is_some())
    }

    async fn leader_created_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let rows = self.rows.lock().await;
        Ok(rows.values().find(|r| r.index == 0).map(|r| r.created_at))
    }

    async fn list(&self) -> Result<Vec<InstanceRecord>, StoreError> {
        let rows = self.rows.lock().await;
        let mut out: Vec<InstanceRecord> = rows.values().cloned().collect();
        out.sort_by_key(|r| r.index);
        Ok(out)
    }
}
