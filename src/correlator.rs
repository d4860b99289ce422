//! Confirmation correlator (§4.G): a single process matching inbound
//! confirmation lines against a persistent queue, growing by step the same
//! way [`crate::lsdata`] grows its retrieve list.
//!
//! The donor's memory-mapped queue file becomes the `demcd_queue` table
//! (§9's versioned-store redesign); `log_time`/`state` columns carry the
//! state machine directly instead of word-offset header arithmetic.

use std::time::Duration;

use sqlx::SqlitePool;
use thiserror::Error;
use tracing::{event, instrument, Level};

/// Correlator errors.
#[derive(Debug, Error)]
pub enum CorrelatorError {
    #[error("queue storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

/// `Queued → Matched(Ack/Nack) → Logged → Removed` or
/// `Queued → TimedUp → Logged → Removed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum QueueState {
    Queued = 0,
    MatchedAck = 1,
    MatchedNack = 2,
    TimedUp = 3,
    Logged = 4,
}

impl QueueState {
    #[must_use]
    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(Self::Queued),
            1 => Some(Self::MatchedAck),
            2 => Some(Self::MatchedNack),
            3 => Some(Self::TimedUp),
            4 => Some(Self::Logged),
            _ => None,
        }
    }
}

/// One confirmation record, the fixed-layout shape a FIFO read delivers
/// atomically (partial records are buffered by the caller for the next
/// read).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmationRecord {
    pub de_mail_privat_id: String,
    pub file_name: String,
    pub alias_name: String,
    pub file_size: i64,
    pub jid: i64,
}

/// A queued confirmation with its bookkeeping columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub id: i64,
    pub record: ConfirmationRecord,
    pub log_time: i64,
    pub state: QueueState,
}

/// How long a `Queued` entry may wait before it is timed out (§4.G).
pub const DEFAULT_TIME_UP: Duration = Duration::from_secs(300);

pub struct Correlator {
    pool: SqlitePool,
    time_up: Duration,
}

impl Correlator {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool, time_up: DEFAULT_TIME_UP }
    }

    #[must_use]
    pub fn with_time_up(mut self, time_up: Duration) -> Self {
        self.time_up = time_up;
        self
    }

    /// Appends one or more newly-arrived records to the queue in
    /// `Queued` state.
    #[instrument(skip(self, records))]
    pub async fn enqueue(&self, records: &[ConfirmationRecord], now: i64) -> Result<(), CorrelatorError> {
        let mut tx = self.pool.begin().await?;
        for record in records {
            sqlx::query(
                "INSERT INTO demcd_queue (de_mail_privat_id, file_name, alias_name, log_time, file_size, jid, confirmation_type, state) \
                 VALUES (?, ?, ?, ?, ?, ?, 0, ?)",
            )
            .bind(&record.de_mail_privat_id)
            .bind(&record.file_name)
            .bind(&record.alias_name)
            .bind(now)
            .bind(record.file_size)
            .bind(record.jid)
            .bind(QueueState::Queued as i64)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// The oldest still-`Queued` entry: `check_line`'s match target.
    pub async fn head(&self) -> Result<Option<QueueEntry>, CorrelatorError> {
        let row: Option<(i64, String, String, String, i64, i64, i64, i64)> = sqlx::query_as(
            "SELECT id, de_mail_privat_id, file_name, alias_name, log_time, file_size, jid, state \
             FROM demcd_queue WHERE state = ? ORDER BY id ASC LIMIT 1",
        )
        .bind(QueueState::Queued as i64)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id, de_mail_privat_id, file_name, alias_name, log_time, file_size, jid, state)| QueueEntry {
            id,
            record: ConfirmationRecord { de_mail_privat_id, file_name, alias_name, file_size, jid },
            log_time,
            state: QueueState::from_i64(state).unwrap_or(QueueState::Queued),
        }))
    }

    /// `check_line`: attempts to match an inbound confirmation line's file
    /// name against the head of the queue. On match, marks it
    /// `Matched(Ack/Nack)`.
    #[instrument(skip(self))]
    pub async fn check_line(&self, file_name: &str, acknowledged: bool) -> Result<bool, CorrelatorError> {
        let Some(head) = self.head().await? else {
            return Ok(false);
        };
        if head.record.file_name != file_name {
            return Ok(false);
        }

        let new_state = if acknowledged { QueueState::MatchedAck } else { QueueState::MatchedNack };
        sqlx::query("UPDATE demcd_queue SET state = ? WHERE id = ?")
            .bind(new_state as i64)
            .bind(head.id)
            .execute(&self.pool)
            .await?;

        event!(target: "afd::correlator", Level::DEBUG, file_name, acknowledged, "confirmation matched");
        Ok(true)
    }

    /// Walks the queue and times out any `Queued` entry whose
    /// `now - log_time >= time_up`, logging `CL_TIMEUP`.
    #[instrument(skip(self))]
    pub async fn expire_timed_up(&self, now: i64) -> Result<u64, CorrelatorError> {
        let cutoff = now - i64::try_from(self.time_up.as_secs()).unwrap_or(i64::MAX);
        let result = sqlx::query(
            "UPDATE demcd_queue SET state = ? WHERE state = ? AND log_time <= ?",
        )
        .bind(QueueState::TimedUp as i64)
        .bind(QueueState::Queued as i64)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            event!(target: "afd::correlator", Level::WARN, count = result.rows_affected(), "CL_TIMEUP");
        }
        Ok(result.rows_affected())
    }

    /// Removes every `Logged` entry, the terminal transition both state
    /// machine branches share.
    #[instrument(skip(self))]
    pub async fn remove_logged(&self) -> Result<u64, CorrelatorError> {
        let result = sqlx::query("DELETE FROM demcd_queue WHERE state IN (?, ?)")
            .bind(QueueState::MatchedAck as i64)
            .bind(QueueState::MatchedNack as i64)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Marks every `TimedUp` entry `Logged`, ready for removal on the next
    /// tick — mirrors the donor's two-phase `TimedUp -> Logged -> Removed`
    /// path so a crash between logging and removal cannot silently drop
    /// the CL_TIMEUP record.
    #[instrument(skip(self))]
    pub async fn mark_timed_up_logged(&self) -> Result<u64, CorrelatorError> {
        let result = sqlx::query("UPDATE demcd_queue SET state = ? WHERE state = ?")
            .bind(QueueState::Logged as i64)
            .bind(QueueState::TimedUp as i64)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// One 100ms tick (§4.G): match inbound lines, expire stale entries,
    /// and reap anything already logged.
    #[instrument(skip(self, inbound_lines))]
    pub async fn tick(&self, inbound_lines: &[(String, bool)], now: i64) -> Result<(), CorrelatorError> {
        for (file_name, acknowledged) in inbound_lines {
            self.check_line(file_name, *acknowledged).await?;
        }
        self.expire_timed_up(now).await?;
        self.mark_timed_up_logged().await?;
        self.remove_logged().await?;
        Ok(())
    }
}

/// The fixed tick cadence §4.G specifies.
pub const TICK_INTERVAL: Duration = Duration::from_millis(100);

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::db::AfdDb;

    async fn correlator() -> Correlator {
        let db = AfdDb::new_in_memory().await.unwrap();
        Correlator::new(db.pool().clone())
    }

    fn record(name: &str) -> ConfirmationRecord {
        ConfirmationRecord {
            de_mail_privat_id: "pid-1".to_string(),
            file_name: name.to_string(),
            alias_name: "alias-a".to_string(),
            file_size: 100,
            jid: 1,
        }
    }

    #[tokio::test]
    async fn enqueue_then_head_returns_oldest_queued() {
        let c = correlator().await;
        c.enqueue(&[record("a.txt"), record("b.txt")], 1_000).await.unwrap();
        let head = c.head().await.unwrap().unwrap();
        assert_eq!(head.record.file_name, "a.txt");
        assert_eq!(head.state, QueueState::Queued);
    }

    #[tokio::test]
    async fn check_line_matches_head_and_advances_state() {
        let c = correlator().await;
        c.enqueue(&[record("a.txt")], 1_000).await.unwrap();

        assert!(c.check_line("a.txt", true).await.unwrap());
        assert!(c.head().await.unwrap().is_none()); // no longer Queued
    }

    #[tokio::test]
    async fn check_line_does_not_match_non_head_file() {
        let c = correlator().await;
        c.enqueue(&[record("a.txt"), record("b.txt")], 1_000).await.unwrap();

        assert!(!c.check_line("b.txt", true).await.unwrap());
    }

    #[tokio::test]
    async fn expire_timed_up_marks_stale_entries() {
        let c = Correlator::new(AfdDb::new_in_memory().await.unwrap().pool().clone())
            .with_time_up(Duration::from_secs(60));
        c.enqueue(&[record("a.txt")], 0).await.unwrap();

        let expired = c.expire_timed_up(120).await.unwrap();
        assert_eq!(expired, 1);
    }

    #[tokio::test]
    async fn full_tick_drains_matched_and_timed_up_entries() {
        let c = Correlator::new(AfdDb::new_in_memory().await.unwrap().pool().clone())
            .with_time_up(Duration::from_secs(60));
        c.enqueue(&[record("a.txt"), record("b.txt")], 0).await.unwrap();

        c.tick(&[("a.txt".to_string(), true)], 120).await.unwrap();

        // a.txt matched and removed; b.txt timed out, logged, and removed.
        assert!(c.head().await.unwrap().is_none());
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM demcd_queue")
            .fetch_one(&c.pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
