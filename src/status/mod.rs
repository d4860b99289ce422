//! Shared-status store: FSA (hosts), FRA (directories), MDB (message cache).
//!
//! This replaces the original generational-mmap-plus-advisory-locks design
//! with the versioned record store the design notes sanction: each table
//! has an `epoch` that stands in for the `STALE` marker word, and a mutation
//! is a single `BEGIN IMMEDIATE` transaction that re-reads the epoch,
//! applies the change and commits — SQLite's own page locking takes the
//! place of the byte-range advisory locks.

mod fra;
mod fsa;
mod mdb;
mod store;

pub use fra::{DirFlags, FraRecord, FraStore, TimeEntry};
pub use fsa::{FsaRecord, FsaStore, HostStatus, JobStatus, Protocol};
pub use mdb::{MdbRecord, MdbStore};
pub use store::Epoch;

use thiserror::Error;

/// Failures from any shared-status table operation.
#[derive(Debug, Error)]
pub enum StatusError {
    /// The table's stored version byte does not match what this build
    /// expects.
    #[error("version mismatch: table has {found}, expected {expected}")]
    WrongVersion {
        /// Version found in the table.
        found: i64,
        /// Version this build requires.
        expected: i64,
    },

    /// `no_of_records <= 0`, or the requested position is out of range.
    #[error("invalid table or out-of-range position {pos}")]
    WrongTable {
        /// The position that was requested.
        pos: i64,
    },

    /// The epoch observed before the mutation no longer matches the epoch
    /// observed after re-reading inside the transaction — the table was
    /// swapped to a new generation mid-flight.
    #[error("stale generation: expected epoch {expected}, observed {observed}")]
    StaleGeneration {
        /// Epoch the caller believed was current.
        expected: Epoch,
        /// Epoch actually found when the mutation ran.
        observed: Epoch,
    },

    /// No record exists at the given alias.
    #[error("no record for alias {0:?}")]
    UnknownAlias(String),

    /// Underlying storage failure.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}
