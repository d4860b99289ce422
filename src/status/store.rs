//! Epoch bookkeeping shared by the FSA, FRA and MDB tables.

use sqlx::SqlitePool;

use super::StatusError;

/// A table generation number. Bumping it is the SQL equivalent of writing
/// the `STALE` marker into the old table's header word.
pub type Epoch = i64;

/// Which `*_epoch` row a caller wants (`fsa_epoch`, `fra_epoch`, `mdb_epoch`).
#[derive(Debug, Clone, Copy)]
pub(super) enum EpochTable {
    Fsa,
    Fra,
    Mdb,
}

impl EpochTable {
    fn table_name(self) -> &'static str {
        match self {
            Self::Fsa => "fsa_epoch",
            Self::Fra => "fra_epoch",
            Self::Mdb => "mdb_epoch",
        }
    }
}

/// Reads `(epoch, version)` for the given table.
pub(super) async fn read_epoch(
    pool: &SqlitePool,
    table: EpochTable,
) -> Result<(Epoch, i64), StatusError> {
    let query = format!("SELECT epoch, version FROM {} WHERE id = 0", table.table_name());
    let row: (i64, i64) = sqlx::query_as(&query).fetch_one(pool).await?;
    Ok(row)
}

/// Bumps the epoch, the generational-swap operation of §4.A.
pub(super) async fn bump_epoch(pool: &SqlitePool, table: EpochTable) -> Result<Epoch, StatusError> {
    let query = format!(
        "UPDATE {} SET epoch = epoch + 1 WHERE id = 0 RETURNING epoch",
        table.table_name()
    );
    let row: (i64,) = sqlx::query_as(&query).fetch_one(pool).await?;
    Ok(row.0)
}
