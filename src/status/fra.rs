//! FRA: the directory (file-retrieve) status table.

use bitflags::bitflags;
use sqlx::SqlitePool;
use tracing::instrument;

use super::StatusError;
use super::store::{self, Epoch, EpochTable};

bitflags! {
    /// `dir_flag`/`dir_options` bitmask (§3).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DirFlags: u32 {
        const MAX_COPIED         = 1 << 0;
        const FILES_IN_QUEUE      = 1 << 1;
        const LINK_NO_EXEC        = 1 << 2;
        const DIR_DISABLED        = 1 << 3;
        const DIR_ERROR_SET       = 1 << 4;
        const WARN_TIME_REACHED   = 1 << 5;
        const ALL_DISABLED        = 1 << 6;
        const ACCEPT_DOT_FILES    = 1 << 7;
        const DONT_GET_DIR_LIST   = 1 << 8;
        const INOTIFY_ACTIVE      = 1 << 9;
    }
}

/// A `crontab`-shaped poll schedule entry (`te[]`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeEntry {
    pub minute: i64,
    pub hour: i64,
    pub day_of_month: i64,
    pub month: i64,
    pub day_of_week: i64,
}

/// A single FRA record: directory state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FraRecord {
    pub pos: i64,
    pub dir_alias: String,
    pub url: String,
    pub retrieve_work_dir: String,
    pub ls_data_alias: String,
    pub protocol: i64,
    pub dir_flag: DirFlags,
    pub files_in_dir: i64,
    pub bytes_in_dir: i64,
    pub files_queued: i64,
    pub bytes_in_queue: i64,
    pub error_counter: i64,
    pub keep_connected: i64,
    pub next_check_time: i64,
    pub remote_file_check_interval: i64,
    pub timezone: Option<String>,
    pub stupid_mode: bool,
    pub remove_flag: bool,
    pub time_entries: Vec<TimeEntry>,
}

/// Store wrapping the `fra_dirs`/`fra_time_entries`/`fra_epoch` tables.
#[derive(Debug, Clone)]
pub struct FraStore {
    pool: SqlitePool,
}

impl FraStore {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn epoch(&self) -> Result<(Epoch, i64), StatusError> {
        store::read_epoch(&self.pool, EpochTable::Fra).await
    }

    pub async fn record_count(&self) -> Result<i64, StatusError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM fra_dirs")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    #[instrument(skip(self))]
    pub async fn create_if_absent(&self, dir_alias: &str) -> Result<i64, StatusError> {
        if let Some(row) =
            sqlx::query_as::<_, (i64,)>("SELECT pos FROM fra_dirs WHERE dir_alias = ?")
                .bind(dir_alias)
                .fetch_optional(&self.pool)
                .await?
        {
            return Ok(row.0);
        }

        let (next_pos,): (i64,) = sqlx::query_as("SELECT COALESCE(MAX(pos) + 1, 0) FROM fra_dirs")
            .fetch_one(&self.pool)
            .await?;

        sqlx::query("INSERT INTO fra_dirs (pos, dir_alias) VALUES (?, ?)")
            .bind(next_pos)
            .bind(dir_alias)
            .execute(&self.pool)
            .await?;

        Ok(next_pos)
    }

    #[instrument(skip(self))]
    pub async fn attach_for_read(&self, pos: i64) -> Result<FraRecord, StatusError> {
        fetch(&self.pool, pos).await
    }

    pub async fn swap_generation(&self) -> Result<Epoch, StatusError> {
        store::bump_epoch(&self.pool, EpochTable::Fra).await
    }

    /// Updates the files/bytes-queued counters, the fetch-side analogue of
    /// `update_tfc` for the retrieve direction.
    #[instrument(skip(self))]
    pub async fn update_queue_counters(
        &self,
        pos: i64,
        files_delta: i64,
        bytes_delta: i64,
    ) -> Result<FraRecord, StatusError> {
        let mut tx = self.pool.begin().await?;
        let mut record = fetch(&mut *tx, pos).await?;

        record.files_queued = (record.files_queued + files_delta).max(0);
        record.bytes_in_queue = (record.bytes_in_queue + bytes_delta).max(0);

        sqlx::query("UPDATE fra_dirs SET files_queued = ?, bytes_in_queue = ? WHERE pos = ?")
            .bind(record.files_queued)
            .bind(record.bytes_in_queue)
            .bind(pos)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(record)
    }
}

async fn fetch<'c, E>(executor: E, pos: i64) -> Result<FraRecord, StatusError>
where
    E: sqlx::Executor<'c, Database = sqlx::Sqlite>,
{
    #[derive(sqlx::FromRow)]
    struct Row {
        pos: i64,
        dir_alias: String,
        url: String,
        retrieve_work_dir: String,
        ls_data_alias: String,
        protocol: i64,
        dir_flag: i64,
        files_in_dir: i64,
        bytes_in_dir: i64,
        files_queued: i64,
        bytes_in_queue: i64,
        error_counter: i64,
        keep_connected: i64,
        next_check_time: i64,
        remote_file_check_interval: i64,
        timezone: Option<String>,
        stupid_mode: i64,
        remove_flag: i64,
    }

    let row: Row = sqlx::query_as("SELECT * FROM fra_dirs WHERE pos = ?")
        .bind(pos)
        .fetch_optional(executor)
        .await?
        .ok_or(StatusError::WrongTable { pos })?;

    Ok(FraRecord {
        pos: row.pos,
        dir_alias: row.dir_alias,
        url: row.url,
        retrieve_work_dir: row.retrieve_work_dir,
        ls_data_alias: row.ls_data_alias,
        protocol: row.protocol,
        dir_flag: DirFlags::from_bits_truncate(row.dir_flag as u32),
        files_in_dir: row.files_in_dir,
        bytes_in_dir: row.bytes_in_dir,
        files_queued: row.files_queued,
        bytes_in_queue: row.bytes_in_queue,
        error_counter: row.error_counter,
        keep_connected: row.keep_connected,
        next_check_time: row.next_check_time,
        remote_file_check_interval: row.remote_file_check_interval,
        timezone: row.timezone,
        stupid_mode: row.stupid_mode != 0,
        remove_flag: row.remove_flag != 0,
        time_entries: Vec::new(),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::db::AfdDb;

    async fn store() -> FraStore {
        let db = AfdDb::new_in_memory().await.unwrap();
        FraStore::new(db.pool().clone())
    }

    #[tokio::test]
    async fn create_if_absent_is_idempotent() {
        let store = store().await;
        let a = store.create_if_absent("dir-a").await.unwrap();
        let b = store.create_if_absent("dir-a").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn update_queue_counters_never_goes_negative() {
        let store = store().await;
        let pos = store.create_if_absent("dir-a").await.unwrap();
        let record = store.update_queue_counters(pos, -5, -500).await.unwrap();
        assert_eq!(record.files_queued, 0);
        assert_eq!(record.bytes_in_queue, 0);
    }

    #[tokio::test]
    async fn attach_out_of_range_returns_wrong_table() {
        let store = store().await;
        let err = store.attach_for_read(0).await.unwrap_err();
        assert!(matches!(err, StatusError::WrongTable { pos: 0 }));
    }
}
