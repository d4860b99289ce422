//! Position attacher (§4.B).
//!
//! `attach_pos(pos)` maps exactly one record of a shared table. The design
//! notes sanction replacing the literal page-aligned `mmap` with a versioned
//! record store; this module keeps the *descriptive* page-alignment
//! arithmetic the spec's boundary tests check (`word_offset`, `pagesize`,
//! `page_offset`), but the actual bytes move through [`crate::status`]
//! rather than a raw memory map. Boundary behaviour (`pos == no_of_records`
//! => `WrongTable`) is enforced by the store's own row-count check.

use async_trait::async_trait;

use crate::status::{Epoch, FraRecord, FraStore, FsaRecord, FsaStore, StatusError};

/// A record-shaped, page-aligned table a [`PositionAttacher`] can map.
#[async_trait]
pub trait PositionedTable {
    /// The record type this table stores.
    type Record: Send + 'static;

    /// Fixed size, in bytes, of one on-disk record — used only to compute
    /// the descriptive `page_offset` metadata.
    fn record_size(&self) -> usize;

    /// Header size, in bytes, before the first record (the "word offset").
    fn word_offset(&self) -> usize;

    /// The page size the original mmap-based implementation would have
    /// rounded against.
    fn pagesize(&self) -> usize {
        4096
    }

    /// Current generation number.
    async fn epoch(&self) -> Result<Epoch, StatusError>;

    /// `no_of_records`.
    async fn record_count(&self) -> Result<i64, StatusError>;

    /// Reads the record at `pos`.
    async fn read_at(&self, pos: i64) -> Result<Self::Record, StatusError>;
}

#[async_trait]
impl PositionedTable for FsaStore {
    type Record = FsaRecord;

    fn record_size(&self) -> usize {
        std::mem::size_of::<FsaRecord>()
    }

    fn word_offset(&self) -> usize {
        32
    }

    async fn epoch(&self) -> Result<Epoch, StatusError> {
        Ok(FsaStore::epoch(self).await?.0)
    }

    async fn record_count(&self) -> Result<i64, StatusError> {
        FsaStore::record_count(self).await
    }

    async fn read_at(&self, pos: i64) -> Result<Self::Record, StatusError> {
        FsaStore::attach_for_read(self, pos).await
    }
}

#[async_trait]
impl PositionedTable for FraStore {
    type Record = FraRecord;

    fn record_size(&self) -> usize {
        std::mem::size_of::<FraRecord>()
    }

    fn word_offset(&self) -> usize {
        32
    }

    async fn epoch(&self) -> Result<Epoch, StatusError> {
        Ok(FraStore::epoch(self).await?.0)
    }

    async fn record_count(&self) -> Result<i64, StatusError> {
        FraStore::record_count(self).await
    }

    async fn read_at(&self, pos: i64) -> Result<Self::Record, StatusError> {
        FraStore::attach_for_read(self, pos).await
    }
}

/// Describes the page-aligned window an `attach_pos` would have mapped, for
/// parity with the original contract's tested boundary behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordMapping {
    pub pos: i64,
    pub epoch: Epoch,
    pub start: usize,
    pub page_offset: usize,
    pub mapped_len: usize,
}

/// A weak, position-scoped handle: `fsa_pos`/`fra_pos` plus the "safe
/// pointer" flag from §3 (`fsa_pos_save`), made explicit per the design
/// notes' `Option<HandleGuarded>` recommendation.
pub struct PositionAttacher<'t, T: PositionedTable> {
    table: &'t T,
}

impl<'t, T: PositionedTable> PositionAttacher<'t, T> {
    #[must_use]
    pub fn new(table: &'t T) -> Self {
        Self { table }
    }

    /// `attach_pos(pos) -> Result<RecordMapping, AttachError>`.
    pub async fn attach_pos(&self, pos: i64) -> Result<(RecordMapping, T::Record), StatusError> {
        let count = self.table.record_count().await?;
        if count <= 0 {
            return Err(StatusError::WrongTable { pos });
        }
        if pos < 0 || pos >= count {
            return Err(StatusError::WrongTable { pos });
        }

        let epoch = self.table.epoch().await?;
        let record_size = self.table.record_size();
        let word_offset = self.table.word_offset();
        let pagesize = self.table.pagesize();

        let start = word_offset + (pos as usize) * record_size;
        let page_offset = (start / pagesize) * pagesize;
        let mapped_len = record_size + (start - page_offset);

        let record = self.table.read_at(pos).await?;

        // Re-check the epoch after the read; a swap mid-flight means the
        // caller observed a generation that is no longer current and must
        // detach and re-attach (§4.B "stale handling").
        let epoch_after = self.table.epoch().await?;
        if epoch_after != epoch {
            return Err(StatusError::StaleGeneration {
                expected: epoch,
                observed: epoch_after,
            });
        }

        Ok((
            RecordMapping {
                pos,
                epoch,
                start,
                page_offset,
                mapped_len,
            },
            record,
        ))
    }

    /// `detach()`: releases the weak handle. The versioned store holds no
    /// file descriptor per attach, so this is a documented no-op kept for
    /// contract symmetry with callers that track attach/detach pairs.
    pub fn detach(&self) {}
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::db::AfdDb;

    async fn fsa_store() -> FsaStore {
        let db = AfdDb::new_in_memory().await.unwrap();
        FsaStore::new(db.pool().clone())
    }

    #[tokio::test]
    async fn attach_at_zero_and_last_succeed() {
        let store = fsa_store().await;
        store.create_if_absent("host-a").await.unwrap();
        store.create_if_absent("host-b").await.unwrap();

        let attacher = PositionAttacher::new(&store);
        assert!(attacher.attach_pos(0).await.is_ok());
        assert!(attacher.attach_pos(1).await.is_ok());
    }

    #[tokio::test]
    async fn attach_at_record_count_is_wrong_table() {
        let store = fsa_store().await;
        store.create_if_absent("host-a").await.unwrap();

        let attacher = PositionAttacher::new(&store);
        let err = attacher.attach_pos(1).await.unwrap_err();
        assert!(matches!(err, StatusError::WrongTable { pos: 1 }));
    }

    #[tokio::test]
    async fn empty_table_is_never_valid() {
        let store = fsa_store().await;
        let attacher = PositionAttacher::new(&store);
        let err = attacher.attach_pos(0).await.unwrap_err();
        assert!(matches!(err, StatusError::WrongTable { pos: 0 }));
    }

    #[tokio::test]
    async fn page_offset_rounds_down_to_pagesize_boundary() {
        let store = fsa_store().await;
        store.create_if_absent("host-a").await.unwrap();

        let attacher = PositionAttacher::new(&store);
        let (mapping, _) = attacher.attach_pos(0).await.unwrap();
        assert_eq!(mapping.page_offset % 4096, 0);
        assert!(mapping.page_offset <= mapping.start);
    }
}
