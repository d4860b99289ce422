//! FSA: the host (file-transfer) status table.

use bitflags::bitflags;
use sqlx::SqlitePool;
use tracing::{debug, instrument};

use super::StatusError;
use super::store::{self, Epoch, EpochTable};

bitflags! {
    /// `host_status` bitmask (§3).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HostStatus: u32 {
        const PAUSED               = 1 << 0;
        const STOPPED               = 1 << 1;
        const DISABLED               = 1 << 2;
        const ERRORS_PENDING         = 1 << 3;
        const ACK                   = 1 << 4;
        const OFFLINE               = 1 << 5;
        const ACK_TIMED              = 1 << 6;
        const OFFLINE_TIMED           = 1 << 7;
        const OFFLINE_STATIC          = 1 << 8;
        const ERROR_QUEUE_SET         = 1 << 9;
        const CONFIG_DISABLED         = 1 << 10;
    }

    /// `protocol` bitmask: which wire protocols a host is configured for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Protocol: u32 {
        const FTP   = 1 << 0;
        const SFTP  = 1 << 1;
        const HTTP  = 1 << 2;
        const SMTP  = 1 << 3;
        const POP3  = 1 << 4;
        const WMO   = 1 << 5;
        const LOC   = 1 << 6;
        const EXEC  = 1 << 7;
    }
}

/// One of `MAX_NO_PARALLEL_JOBS` per-host job slots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobStatus {
    pub job_no: i64,
    pub connect_status: i64,
    pub no_of_files: i64,
    pub no_of_files_done: i64,
    pub file_size: i64,
    pub file_size_done: i64,
    pub file_size_in_use: i64,
    pub file_size_in_use_done: i64,
    pub file_name_in_use: String,
    /// Mini-state bytes: `[0]==0` or (`[1]==0 && [2]<6`) marks a
    /// keep-connected idle slot for TRL net-active-transfer accounting.
    pub unique_name: [u8; 3],
    pub proc_id: i64,
    pub job_id: i64,
}

impl JobStatus {
    /// True when this slot is alive but idling in the keep-connected
    /// sub-state (§4.D's net-active-transfers exclusion).
    #[must_use]
    pub fn is_keep_connected_idle(&self) -> bool {
        self.proc_id != -1
            && (self.unique_name[0] == 0 || (self.unique_name[1] == 0 && self.unique_name[2] < 6))
    }
}

/// A single FSA record: host state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsaRecord {
    pub pos: i64,
    pub host_alias: String,
    pub real_hostname: [String; 2],
    pub host_toggle: i64,
    pub auto_toggle: bool,
    pub original_toggle_pos: i64,
    pub host_dsp_name: String,
    pub protocol: Protocol,
    pub host_status: HostStatus,
    pub error_counter: i64,
    pub max_errors: i64,
    pub total_file_counter: i64,
    pub total_file_size: i64,
    pub file_counter_done: i64,
    pub bytes_send: i64,
    pub connections: i64,
    pub active_transfers: i64,
    pub allowed_transfers: i64,
    pub transfer_rate_limit: i64,
    pub trl_per_process: i64,
    pub block_size: i64,
    pub transfer_timeout: i64,
    pub keep_connected: i64,
    pub last_connection: i64,
    pub jobs_queued: i64,
    pub job_status: Vec<JobStatus>,
}

impl FsaRecord {
    /// Resolves the *current real hostname* using `toggle_host` semantics
    /// (§4.F step 2): slot 1 or 2 of `real_hostname[]` by `host_toggle`.
    #[must_use]
    pub fn current_real_hostname(&self) -> &str {
        let idx = if self.host_toggle == 2 { 1 } else { 0 };
        &self.real_hostname[idx]
    }

    fn clamp_invariants(&mut self) {
        if self.total_file_counter < 0 {
            debug!(pos = self.pos, "total_file_counter went negative, clamping to 0");
            self.total_file_counter = 0;
        }
        if self.total_file_size < 0 {
            debug!(pos = self.pos, "total_file_size went negative, clamping to 0");
            self.total_file_size = 0;
        }
        if self.total_file_counter == 0 {
            self.total_file_size = 0;
        }
    }
}

/// Store wrapping the `fsa_hosts`/`fsa_job_status`/`fsa_epoch` tables.
#[derive(Debug, Clone)]
pub struct FsaStore {
    pool: SqlitePool,
}

impl FsaStore {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Current epoch and version (the header's generation word and version
    /// byte, per §4.A).
    pub async fn epoch(&self) -> Result<(Epoch, i64), StatusError> {
        store::read_epoch(&self.pool, EpochTable::Fsa).await
    }

    /// `no_of_records`: row count of the table.
    pub async fn record_count(&self) -> Result<i64, StatusError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM fsa_hosts")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// *create-if-absent*: inserts a host row at the next free position if
    /// `host_alias` is not already known.
    #[instrument(skip(self))]
    pub async fn create_if_absent(&self, host_alias: &str) -> Result<i64, StatusError> {
        if let Some(row) = sqlx::query_as::<_, (i64,)>(
            "SELECT pos FROM fsa_hosts WHERE host_alias = ?",
        )
        .bind(host_alias)
        .fetch_optional(&self.pool)
        .await?
        {
            return Ok(row.0);
        }

        let (next_pos,): (i64,) =
            sqlx::query_as("SELECT COALESCE(MAX(pos) + 1, 0) FROM fsa_hosts")
                .fetch_one(&self.pool)
                .await?;

        sqlx::query("INSERT INTO fsa_hosts (pos, host_alias) VALUES (?, ?)")
            .bind(next_pos)
            .bind(host_alias)
            .execute(&self.pool)
            .await?;

        Ok(next_pos)
    }

    /// *attach-for-read*: fetches the record at `pos` without locking.
    #[instrument(skip(self))]
    pub async fn attach_for_read(&self, pos: i64) -> Result<FsaRecord, StatusError> {
        self.fetch(pos).await
    }

    /// *swap-generation*: bumps the epoch, the SQL stand-in for writing the
    /// `STALE` marker into the old table.
    pub async fn swap_generation(&self) -> Result<Epoch, StatusError> {
        store::bump_epoch(&self.pool, EpochTable::Fsa).await
    }

    /// *lock-region(`LOCK_TFC`)*: `update_tfc` under the counter lock
    /// (§4.F). Subtracts `n_done` files and `bytes_done` bytes from the
    /// pending totals, advances `file_counter_done`/`bytes_send`, and
    /// stamps `last_connection`. Runs in a single immediate transaction,
    /// which is this store's equivalent of the byte-range advisory lock.
    #[instrument(skip(self))]
    pub async fn update_tfc(
        &self,
        pos: i64,
        n_done: i64,
        bytes_done: i64,
        now: i64,
    ) -> Result<FsaRecord, StatusError> {
        let mut tx = self.pool.begin().await?;
        let mut record = fetch_with(&mut *tx, pos).await?;

        record.total_file_counter -= n_done;
        record.total_file_size -= bytes_done;
        record.file_counter_done += n_done;
        record.bytes_send += bytes_done;
        record.last_connection = now;
        record.clamp_invariants();

        sqlx::query(
            "UPDATE fsa_hosts SET total_file_counter = ?, total_file_size = ?,
             file_counter_done = ?, bytes_send = ?, last_connection = ? WHERE pos = ?",
        )
        .bind(record.total_file_counter)
        .bind(record.total_file_size)
        .bind(record.file_counter_done)
        .bind(record.bytes_send)
        .bind(record.last_connection)
        .bind(pos)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(record)
    }

    /// *lock-region(`LOCK_HS`)*: mutates `host_status`/`connect_status`
    /// under the status lock.
    #[instrument(skip(self, mutate))]
    pub async fn update_host_status<F>(&self, pos: i64, mutate: F) -> Result<FsaRecord, StatusError>
    where
        F: FnOnce(&mut HostStatus),
    {
        let mut tx = self.pool.begin().await?;
        let mut record = fetch_with(&mut *tx, pos).await?;
        mutate(&mut record.host_status);

        sqlx::query("UPDATE fsa_hosts SET host_status = ? WHERE pos = ?")
            .bind(record.host_status.bits() as i64)
            .bind(pos)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(record)
    }

    /// Burst-start update (§4.F step 4, send flavour): under the same
    /// region lock `update_tfc` uses, sets `job_status[job_no].connect_status`
    /// to the protocol's active marker and adds this burst's file/byte
    /// counts to both the slot and the host's outstanding totals.
    #[instrument(skip(self))]
    pub async fn start_burst(
        &self,
        pos: i64,
        job_no: i64,
        connect_status: i64,
        file_total: i64,
        file_size_total: i64,
    ) -> Result<FsaRecord, StatusError> {
        let mut tx = self.pool.begin().await?;
        let mut record = fetch_with(&mut *tx, pos).await?;

        sqlx::query(
            "INSERT INTO fsa_job_status (pos, job_no, connect_status, no_of_files, file_size)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(pos, job_no) DO UPDATE SET
                 connect_status = excluded.connect_status,
                 no_of_files = fsa_job_status.no_of_files + excluded.no_of_files,
                 file_size = fsa_job_status.file_size + excluded.file_size",
        )
        .bind(pos)
        .bind(job_no)
        .bind(connect_status)
        .bind(file_total)
        .bind(file_size_total)
        .execute(&mut *tx)
        .await?;

        record.total_file_counter += file_total;
        record.total_file_size += file_size_total;

        sqlx::query("UPDATE fsa_hosts SET total_file_counter = ?, total_file_size = ? WHERE pos = ?")
            .bind(record.total_file_counter)
            .bind(record.total_file_size)
            .bind(pos)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        self.fetch(pos).await
    }

    /// Publishes a freshly computed `trl_per_process` share (§4.D) — the
    /// write side the redistribution algorithm was missing.
    #[instrument(skip(self))]
    pub async fn set_trl_per_process(&self, pos: i64, trl_per_process: i64) -> Result<FsaRecord, StatusError> {
        sqlx::query("UPDATE fsa_hosts SET trl_per_process = ? WHERE pos = ?")
            .bind(trl_per_process)
            .bind(pos)
            .execute(&self.pool)
            .await?;
        self.fetch(pos).await
    }

    /// All host records, for the TRL engine's per-group recompute pass.
    pub async fn all_hosts(&self) -> Result<Vec<FsaRecord>, StatusError> {
        let rows: Vec<(i64,)> = sqlx::query_as("SELECT pos FROM fsa_hosts ORDER BY pos")
            .fetch_all(&self.pool)
            .await?;
        let mut records = Vec::with_capacity(rows.len());
        for (pos,) in rows {
            records.push(self.fetch(pos).await?);
        }
        Ok(records)
    }

    /// `reset_fsa(mode, ...)` (§4.F): sets `connect_status`, zeroes the
    /// per-slot counters for `job_no`, and — if the caller is still showing
    /// pending totals — subtracts them under the counter lock.
    #[instrument(skip(self))]
    pub async fn reset_fsa(
        &self,
        pos: i64,
        job_no: i64,
        faulty: bool,
        file_total_shown: i64,
        file_size_total_shown: i64,
    ) -> Result<FsaRecord, StatusError> {
        const NOT_WORKING: i64 = -1;
        const DISCONNECT: i64 = 0;

        let mut tx = self.pool.begin().await?;
        let mut record = fetch_with(&mut *tx, pos).await?;

        let connect_status = if faulty { NOT_WORKING } else { DISCONNECT };
        sqlx::query(
            "UPDATE fsa_job_status SET connect_status = ?, no_of_files = 0, no_of_files_done = 0,
             file_size = 0, file_size_done = 0, file_size_in_use = 0, file_size_in_use_done = 0,
             file_name_in_use = '' WHERE pos = ? AND job_no = ?",
        )
        .bind(connect_status)
        .bind(pos)
        .bind(job_no)
        .execute(&mut *tx)
        .await?;

        if file_total_shown > 0 || file_size_total_shown > 0 {
            record.total_file_counter -= file_total_shown;
            record.total_file_size -= file_size_total_shown;
            record.clamp_invariants();

            sqlx::query("UPDATE fsa_hosts SET total_file_counter = ?, total_file_size = ? WHERE pos = ?")
                .bind(record.total_file_counter)
                .bind(record.total_file_size)
                .bind(pos)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        self.fetch(pos).await
    }

    async fn fetch(&self, pos: i64) -> Result<FsaRecord, StatusError> {
        let mut conn = self.pool.acquire().await?;
        fetch_with(&mut *conn, pos).await
    }
}

async fn fetch_with<'c, E>(executor: E, pos: i64) -> Result<FsaRecord, StatusError>
where
    E: sqlx::Executor<'c, Database = sqlx::Sqlite>,
{
    #[derive(sqlx::FromRow)]
    struct Row {
        pos: i64,
        host_alias: String,
        real_hostname_1: String,
        real_hostname_2: String,
        host_toggle: i64,
        auto_toggle: i64,
        original_toggle_pos: i64,
        host_dsp_name: String,
        protocol: i64,
        host_status: i64,
        error_counter: i64,
        max_errors: i64,
        total_file_counter: i64,
        total_file_size: i64,
        file_counter_done: i64,
        bytes_send: i64,
        connections: i64,
        active_transfers: i64,
        allowed_transfers: i64,
        transfer_rate_limit: i64,
        trl_per_process: i64,
        block_size: i64,
        transfer_timeout: i64,
        keep_connected: i64,
        last_connection: i64,
        jobs_queued: i64,
    }

    let row: Row = sqlx::query_as("SELECT * FROM fsa_hosts WHERE pos = ?")
        .bind(pos)
        .fetch_optional(executor)
        .await?
        .ok_or(StatusError::WrongTable { pos })?;

    Ok(FsaRecord {
        pos: row.pos,
        host_alias: row.host_alias,
        real_hostname: [row.real_hostname_1, row.real_hostname_2],
        host_toggle: row.host_toggle,
        auto_toggle: row.auto_toggle != 0,
        original_toggle_pos: row.original_toggle_pos,
        host_dsp_name: row.host_dsp_name,
        protocol: Protocol::from_bits_truncate(row.protocol as u32),
        host_status: HostStatus::from_bits_truncate(row.host_status as u32),
        error_counter: row.error_counter,
        max_errors: row.max_errors,
        total_file_counter: row.total_file_counter,
        total_file_size: row.total_file_size,
        file_counter_done: row.file_counter_done,
        bytes_send: row.bytes_send,
        connections: row.connections,
        active_transfers: row.active_transfers,
        allowed_transfers: row.allowed_transfers,
        transfer_rate_limit: row.transfer_rate_limit,
        trl_per_process: row.trl_per_process,
        block_size: row.block_size,
        transfer_timeout: row.transfer_timeout,
        keep_connected: row.keep_connected,
        last_connection: row.last_connection,
        jobs_queued: row.jobs_queued,
        job_status: Vec::new(),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::db::AfdDb;

    async fn store() -> FsaStore {
        let db = AfdDb::new_in_memory().await.unwrap();
        FsaStore::new(db.pool().clone())
    }

    #[tokio::test]
    async fn create_if_absent_is_idempotent() {
        let store = store().await;
        let pos1 = store.create_if_absent("host-a").await.unwrap();
        let pos2 = store.create_if_absent("host-a").await.unwrap();
        assert_eq!(pos1, pos2);
        assert_eq!(store.record_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn attach_out_of_range_returns_wrong_table() {
        let store = store().await;
        store.create_if_absent("host-a").await.unwrap();
        let err = store.attach_for_read(1).await.unwrap_err();
        assert!(matches!(err, StatusError::WrongTable { pos: 1 }));
    }

    #[tokio::test]
    async fn update_tfc_matches_scenario_1() {
        let store = store().await;
        let pos = store.create_if_absent("host-a").await.unwrap();
        sqlx::query("UPDATE fsa_hosts SET total_file_counter = 3, total_file_size = 300 WHERE pos = ?")
            .bind(pos)
            .execute(&store.pool)
            .await
            .unwrap();

        let record = store.update_tfc(pos, 1, 100, 1_700_000_000).await.unwrap();

        assert_eq!(record.total_file_counter, 2);
        assert_eq!(record.total_file_size, 200);
        assert_eq!(record.file_counter_done, 1);
        assert_eq!(record.bytes_send, 100);
        assert_eq!(record.last_connection, 1_700_000_000);
    }

    #[tokio::test]
    async fn update_tfc_clamps_negative_counters() {
        let store = store().await;
        let pos = store.create_if_absent("host-a").await.unwrap();

        let record = store.update_tfc(pos, 5, 500, 1).await.unwrap();

        assert_eq!(record.total_file_counter, 0);
        assert_eq!(record.total_file_size, 0);
    }

    #[tokio::test]
    async fn swap_generation_bumps_epoch() {
        let store = store().await;
        let (epoch0, _) = store.epoch().await.unwrap();
        let epoch1 = store.swap_generation().await.unwrap();
        assert_eq!(epoch1, epoch0 + 1);
    }

    #[tokio::test]
    async fn reset_fsa_subtracts_pending_totals() {
        let store = store().await;
        let pos = store.create_if_absent("host-a").await.unwrap();
        sqlx::query("UPDATE fsa_hosts SET total_file_counter = 10, total_file_size = 1000 WHERE pos = ?")
            .bind(pos)
            .execute(&store.pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO fsa_job_status (pos, job_no, connect_status) VALUES (?, 0, 5)")
            .bind(pos)
            .execute(&store.pool)
            .await
            .unwrap();

        let record = store.reset_fsa(pos, 0, true, 4, 400).await.unwrap();

        assert_eq!(record.total_file_counter, 6);
        assert_eq!(record.total_file_size, 600);
    }

    #[tokio::test]
    async fn start_burst_sets_connect_status_and_grows_totals() {
        let store = store().await;
        let pos = store.create_if_absent("host-a").await.unwrap();

        let record = store.start_burst(pos, 0, 7, 3, 300).await.unwrap();
        assert_eq!(record.total_file_counter, 3);
        assert_eq!(record.total_file_size, 300);

        let (connect_status,): (i64,) =
            sqlx::query_as("SELECT connect_status FROM fsa_job_status WHERE pos = ? AND job_no = 0")
                .bind(pos)
                .fetch_one(&store.pool)
                .await
                .unwrap();
        assert_eq!(connect_status, 7);
    }

    #[tokio::test]
    async fn start_burst_accumulates_across_calls() {
        let store = store().await;
        let pos = store.create_if_absent("host-a").await.unwrap();
        store.start_burst(pos, 0, 7, 2, 200).await.unwrap();
        let record = store.start_burst(pos, 0, 7, 1, 100).await.unwrap();
        assert_eq!(record.total_file_counter, 3);
        assert_eq!(record.total_file_size, 300);
    }

    #[tokio::test]
    async fn set_trl_per_process_persists() {
        let store = store().await;
        let pos = store.create_if_absent("host-a").await.unwrap();
        let record = store.set_trl_per_process(pos, 512).await.unwrap();
        assert_eq!(record.trl_per_process, 512);
    }

    #[tokio::test]
    async fn all_hosts_returns_every_record() {
        let store = store().await;
        store.create_if_absent("host-a").await.unwrap();
        store.create_if_absent("host-b").await.unwrap();
        let hosts = store.all_hosts().await.unwrap();
        assert_eq!(hosts.len(), 2);
    }

    #[test]
    fn keep_connected_idle_detection() {
        let mut job = JobStatus {
            proc_id: 123,
            unique_name: [0, 0, 0],
            ..Default::default()
        };
        assert!(job.is_keep_connected_idle());

        job.unique_name = [1, 0, 5];
        assert!(job.is_keep_connected_idle());

        job.unique_name = [1, 1, 0];
        assert!(!job.is_keep_connected_idle());

        job.proc_id = -1;
        job.unique_name = [0, 0, 0];
        assert!(!job.is_keep_connected_idle());
    }
}
