//! Content-CRC de-duplication (§4.F "De-duplication"): `isdup`/`rm_dupcheck_crc`
//! against the `dup_check_crc` table.

use sqlx::SqlitePool;
use thiserror::Error;
use tracing::instrument;

#[derive(Debug, Error)]
pub enum DedupError {
    #[error("dup-check storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

/// Computes the CRC-32C of `data`, the same checksum [`crate::worker::fetch`]
/// uses to name exec scratch directories.
#[must_use]
pub fn content_crc(data: &[u8]) -> u32 {
    crc32c::crc32c(data)
}

/// `isdup(fullname, name, size, crc_id, ...)`: true if a file with this
/// name/size/crc combination was already recorded under `crc_id`
/// (typically the job or host identity partitioning the check).
#[instrument(skip(pool))]
pub async fn isdup(pool: &SqlitePool, crc_id: i64, file_name: &str, file_size: i64, crc: i64) -> Result<bool, DedupError> {
    let existing: Option<(i64,)> = sqlx::query_as(
        "SELECT 1 FROM dup_check_crc WHERE crc_id = ? AND crc = ? AND file_name = ? AND file_size = ?",
    )
    .bind(crc_id)
    .bind(crc)
    .bind(file_name)
    .bind(file_size)
    .fetch_optional(pool)
    .await?;

    if existing.is_some() {
        return Ok(true);
    }

    sqlx::query(
        "INSERT INTO dup_check_crc (crc_id, crc, file_name, file_size, created_at) VALUES (?, ?, ?, ?, strftime('%s','now'))",
    )
    .bind(crc_id)
    .bind(crc)
    .bind(file_name)
    .bind(file_size)
    .execute(pool)
    .await?;

    Ok(false)
}

/// `rm_dupcheck_crc`: clears a job's dup-check entries on completion, so a
/// future re-send of the same content is not permanently blocked.
#[instrument(skip(pool))]
pub async fn rm_dupcheck_crc(pool: &SqlitePool, crc_id: i64) -> Result<u64, DedupError> {
    let result = sqlx::query("DELETE FROM dup_check_crc WHERE crc_id = ?")
        .bind(crc_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
