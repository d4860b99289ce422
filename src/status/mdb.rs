//! MDB: the outbound-message cache.

use sqlx::SqlitePool;
use tracing::instrument;

use super::StatusError;
use super::store::{self, Epoch, EpochTable};

/// A single cached outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MdbRecord {
    pub pos: i64,
    pub message_name: String,
    pub data: Vec<u8>,
}

/// Store wrapping the `mdb_entries`/`mdb_epoch` tables.
#[derive(Debug, Clone)]
pub struct MdbStore {
    pool: SqlitePool,
}

impl MdbStore {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn epoch(&self) -> Result<(Epoch, i64), StatusError> {
        store::read_epoch(&self.pool, EpochTable::Mdb).await
    }

    /// `no_msg_cached`: row count.
    pub async fn record_count(&self) -> Result<i64, StatusError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM mdb_entries")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    #[instrument(skip(self, data))]
    pub async fn cache(&self, message_name: &str, data: Vec<u8>) -> Result<i64, StatusError> {
        if let Some(row) =
            sqlx::query_as::<_, (i64,)>("SELECT pos FROM mdb_entries WHERE message_name = ?")
                .bind(message_name)
                .fetch_optional(&self.pool)
                .await?
        {
            sqlx::query("UPDATE mdb_entries SET data = ? WHERE pos = ?")
                .bind(&data)
                .bind(row.0)
                .execute(&self.pool)
                .await?;
            return Ok(row.0);
        }

        let (next_pos,): (i64,) = sqlx::query_as("SELECT COALESCE(MAX(pos) + 1, 0) FROM mdb_entries")
            .fetch_one(&self.pool)
            .await?;

        sqlx::query("INSERT INTO mdb_entries (pos, message_name, data) VALUES (?, ?, ?)")
            .bind(next_pos)
            .bind(message_name)
            .bind(&data)
            .execute(&self.pool)
            .await?;

        Ok(next_pos)
    }

    pub async fn attach_for_read(&self, pos: i64) -> Result<MdbRecord, StatusError> {
        let row: Option<(i64, String, Vec<u8>)> =
            sqlx::query_as("SELECT pos, message_name, data FROM mdb_entries WHERE pos = ?")
                .bind(pos)
                .fetch_optional(&self.pool)
                .await?;

        let (pos, message_name, data) = row.ok_or(StatusError::WrongTable { pos })?;
        Ok(MdbRecord { pos, message_name, data })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::db::AfdDb;

    #[tokio::test]
    async fn cache_then_read_round_trips() {
        let db = AfdDb::new_in_memory().await.unwrap();
        let store = MdbStore::new(db.pool().clone());

        let pos = store.cache("msg-a", b"hello".to_vec()).await.unwrap();
        let record = store.attach_for_read(pos).await.unwrap();

        assert_eq!(record.message_name, "msg-a");
        assert_eq!(record.data, b"hello");
    }

    #[tokio::test]
    async fn caching_same_name_updates_in_place() {
        let db = AfdDb::new_in_memory().await.unwrap();
        let store = MdbStore::new(db.pool().clone());

        let pos1 = store.cache("msg-a", b"first".to_vec()).await.unwrap();
        let pos2 = store.cache("msg-a", b"second".to_vec()).await.unwrap();

        assert_eq!(pos1, pos2);
        assert_eq!(store.record_count().await.unwrap(), 1);
        assert_eq!(store.attach_for_read(pos1).await.unwrap().data, b"second");
    }
}
