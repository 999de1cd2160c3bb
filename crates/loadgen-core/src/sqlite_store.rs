use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

use crate::store::{allocate_index, InstanceRecord, InstanceStore, StoreError};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS instances (
    id TEXT PRIMARY KEY,
    created_at INTEGER NOT NULL,
    active_at INTEGER NOT NULL,
    idx INTEGER NOT NULL UNIQUE
)
"#;

// SQLITE_BUSY, SQLITE_LOCKED and SQLITE_BUSY_SNAPSHOT
const BUSY_CODES: &[&str] = &["5", "6", "517"];

/// Instances table in a sqlite database, shared by workers on one host or
/// volume. Timestamps are stored as unix milliseconds.
#[derive(Clone)]
pub struct SqliteInstanceStore {
    pool: SqlitePool,
}

impl SqliteInstanceStore {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init().await?;
        debug!(url, "connected to instance store");
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// Insert `id` under the smallest free index inside an open transaction.
async fn claim_index(conn: &mut SqliteConnection, id: &str, now_ms: i64) -> Result<u32, StoreError> {
    let live: Vec<i64> = sqlx::query_scalar("SELECT idx FROM instances")
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| classify(e, None, id))?;
    let index = allocate_index(live.into_iter().filter_map(|i| u32::try_from(i).ok()));

    sqlx::query("INSERT INTO instances (id, created_at, active_at, idx) VALUES (?, ?, ?, ?)")
        .bind(id)
        .bind(now_ms)
        .bind(now_ms)
        .bind(i64::from(index))
        .execute(&mut *conn)
        .await
        .map_err(|e| classify(e, Some(index), id))?;
    Ok(index)
}

fn classify(err: sqlx::Error, index: Option<u32>, id: &str) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return match index {
                Some(index) if db.message().contains("instances.idx") => {
                    StoreError::IndexTaken(index)
                }
                _ => StoreError::DuplicateId(id.to_string()),
            };
        }
        if let Some(code) = db.code() {
            if BUSY_CODES.contains(&&*code) {
                return StoreError::Busy;
            }
        }
    }
    StoreError::Database(err)
}

#[async_trait]
impl InstanceStore for SqliteInstanceStore {
    async fn insert_with_next_index(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<InstanceRecord, StoreError> {
        let now_ms = now.timestamp_millis();
        let mut conn = self.pool.acquire().await.map_err(|e| classify(e, None, id))?;

        // Take the write lock up front so concurrent registrations queue on
        // busy_timeout instead of failing to upgrade a read lock.
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *conn)
            .await
            .map_err(|e| classify(e, None, id))?;

        let claimed = match claim_index(&mut conn, id, now_ms).await {
            Ok(index) => sqlx::query("COMMIT")
                .execute(&mut *conn)
                .await
                .map(|_| index)
                .map_err(|e| classify(e, Some(index), id)),
            Err(e) => Err(e),
        };
        let index = match claimed {
            Ok(index) => index,
            Err(e) => {
                if let Err(rollback) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                    warn!(instance_id = %id, "rollback after failed registration: {rollback}");
                }
                return Err(e);
            }
        };

        Ok(InstanceRecord {
            id: id.to_string(),
            index,
            created_at: from_millis(now_ms),
            active_at: from_millis(now_ms),
        })
    }

    async fn touch(&self, id: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE instances SET active_at = ? WHERE id = ?")
            .bind(now.timestamp_millis())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| classify(e, None, id))?;
        Ok(result.rows_affected() > 0)
    }

    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM instances WHERE active_at < ?")
            .bind(cutoff.timestamp_millis())
            .execute(&self.pool)
            .await
            .map_err(|e| classify(e, None, ""))?;
        Ok(result.rows_affected())
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM instances WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| classify(e, None, id))?;
        Ok(result.rows_affected() > 0)
    }

    async fn leader_created_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let created: Option<i64> =
            sqlx::query_scalar("SELECT created_at FROM instances WHERE idx = 0")
                .fetch_optional(&self.pool)
                .await?;
        Ok(created.map(from_millis))
    }

    async fn list(&self) -> Result<Vec<InstanceRecord>, StoreError> {
        let rows: Vec<(String, i64, i64, i64)> = sqlx::query_as(
            "SELECT id, created_at, active_at, idx FROM instances ORDER BY idx",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(id, created_at, active_at, idx)| {
                Some(InstanceRecord {
                    id,
                    index: u32::try_from(idx).ok()?,
                    created_at: from_millis(created_at),
                    active_at: from_millis(active_at),
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_store() -> SqliteInstanceStore {
        SqliteInstanceStore::connect("sqlite::memory:", 1).await.unwrap()
    }

    #[tokio::test]
    async fn test_insert_allocates_dense_indices() {
        let store = memory_store().await;
        let now = from_millis(1_700_000_000_000);

        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            let rec = store.insert_with_next_index(id, now).await.unwrap();
            assert_eq!(rec.index, i as u32);
        }
        assert!(store.delete("a").await.unwrap());
        assert!(!store.delete("a").await.unwrap());

        let rec = store.insert_with_next_index("d", now).await.unwrap();
        assert_eq!(rec.index, 0);
        let indices: Vec<u32> = store.list().await.unwrap().iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let store = memory_store().await;
        let now = from_millis(1_700_000_000_000);
        store.insert_with_next_index("a", now).await.unwrap();
        let err = store.insert_with_next_index("a", now).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateId(_)), "{err:?}");
    }

    #[tokio::test]
    async fn test_taken_index_is_conflict() {
        let store = memory_store().await;
        sqlx::query("INSERT INTO instances (id, created_at, active_at, idx) VALUES ('x', 1, 1, 0)")
            .execute(store.pool())
            .await
            .unwrap();
        let err = sqlx::query(
            "INSERT INTO instances (id, created_at, active_at, idx) VALUES ('y', 1, 1, 0)",
        )
        .execute(store.pool())
        .await
        .map_err(|e| classify(e, Some(0), "y"))
        .unwrap_err();
        assert!(matches!(err, StoreError::IndexTaken(0)), "{err:?}");
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_concurrent_pools_on_one_file_all_register() {
        let path = std::env::temp_dir().join(format!("loadgen-store-{}.db", uuid::Uuid::new_v4()));
        let url = format!("sqlite://{}", path.display());

        let mut stores = Vec::new();
        for _ in 0..12 {
            stores.push(SqliteInstanceStore::connect(&url, 2).await.unwrap());
        }

        let now = from_millis(1_700_000_000_000);
        let inserts = stores.iter().enumerate().map(|(i, store)| {
            let id = format!("worker-{i}");
            async move { store.insert_with_next_index(&id, now).await }
        });
        let results = futures::future::join_all(inserts).await;

        // every writer waits for the lock rather than failing with BUSY
        let mut indices: Vec<u32> = results.into_iter().map(|r| r.unwrap().index).collect();
        indices.sort_unstable();
        assert_eq!(indices, (0..12).collect::<Vec<u32>>());
        assert_eq!(stores[0].list().await.unwrap().len(), 12);

        for store in &stores {
            store.pool().close().await;
        }
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{suffix}", path.display()));
        }
    }

    #[tokio::test]
    async fn test_prune_and_leader() {
        let store = memory_store().await;
        let t0 = from_millis(1_700_000_000_000);

        store.insert_with_next_index("leader", t0).await.unwrap();
        store.insert_with_next_index("peer", t0).await.unwrap();
        assert_eq!(store.leader_created_at().await.unwrap(), Some(t0));

        let later = from_millis(1_700_000_120_000);
        assert!(store.touch("peer", later).await.unwrap());
        assert!(!store.touch("ghost", later).await.unwrap());

        // leader's active_at equals t0: only rows strictly older are removed
        assert_eq!(store.prune_older_than(t0).await.unwrap(), 0);
        assert_eq!(store.prune_older_than(later).await.unwrap(), 1);

        let rows = store.list().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "peer");
        assert_eq!(rows[0].active_at, later);
        assert_eq!(store.leader_created_at().await.unwrap(), None);
    }
}
