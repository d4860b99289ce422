//! Thin tracing-instrumented wrappers around [`crate::status::FsaStore`]'s
//! `update_tfc`/`reset_fsa`, giving the worker loop the exact call names
//! §4.F uses (`update_tfc`, `reset_fsa`) and the `afd::tfc`/`afd::status`
//! event targets §10 specifies.

use tracing::{event, instrument, Level};

use crate::status::{FsaRecord, FsaStore, StatusError};

/// `update_tfc`: subtracts `n`/`bytes` from the pending totals and credits
/// them to the done counters, under the store's own `BEGIN IMMEDIATE`
/// transaction (the `LOCK_TFC` analogue).
#[instrument(skip(store))]
pub async fn update_tfc(store: &FsaStore, pos: i64, n_done: i64, bytes_done: i64, now: i64) -> Result<FsaRecord, StatusError> {
    let record = store.update_tfc(pos, n_done, bytes_done, now).await?;
    event!(
        target: "afd::tfc",
        Level::INFO,
        pos,
        n_done,
        bytes_done,
        file_counter_done = record.file_counter_done,
        bytes_send = record.bytes_send,
        "transfer counters updated"
    );
    Ok(record)
}

/// `reset_fsa`: marks the job faulty or cleanly disconnected and rolls back
/// any pending totals the job was still showing.
#[instrument(skip(store))]
pub async fn reset_fsa(
    store: &FsaStore,
    pos: i64,
    job_no: i64,
    faulty: bool,
    file_total_shown: i64,
    file_size_total_shown: i64,
) -> Result<FsaRecord, StatusError> {
    let record = store.reset_fsa(pos, job_no, faulty, file_total_shown, file_size_total_shown).await?;
    event!(
        target: "afd::status",
        Level::INFO,
        pos,
        job_no,
        faulty,
        "connect_status reset"
    );
    Ok(record)
}
