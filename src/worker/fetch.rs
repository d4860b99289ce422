//! `gf_xxx` fetch flavour (§4.F step 4, exec variant): CRC-named scratch
//! directory, env-prelude exec, drain into the incoming directory.

use std::time::Duration;

use tracing::{info, instrument};

use crate::error::AfdError;
use crate::protocol::ExecClient;
use crate::status::FraRecord;

use super::{dedup, WorkerContext};

/// Runs the exec-flavour fetch for one job: resolve the directory's FRA
/// record, build the scratch directory from the CRC-32C of its configured
/// command, run it with the `AFD_HC_*` prelude, then move every
/// regular-file result into the retrieve directory.
#[instrument(skip(ctx))]
pub async fn run_fetch(ctx: &WorkerContext) -> Result<(), AfdError> {
    let dir = ctx.fra.attach_for_read(ctx.decoded.msg_or_dir_id).await.map_err(AfdError::AttachFailed)?;

    let command = fetch_command(&dir);
    let crc = dedup::content_crc(command.as_bytes());

    let scratch_dir = ctx.scratch_dir(&dir.retrieve_work_dir, crc);
    let incoming_dir = ctx.incoming_dir(&dir.retrieve_work_dir, crc);

    let mut exec = ExecClient::new();
    exec.run(
        &command,
        &scratch_dir,
        Duration::from_secs(u64::from(ctx.config.default_transfer_timeout_secs)),
        u64::from(ctx.config.default_transfer_timeout_secs),
        ctx.config.default_block_size as usize,
        "localhost",
    )
    .await
    .map_err(AfdError::Transient)?;

    let moved = exec.drain_scratch(&scratch_dir, &incoming_dir).await.map_err(AfdError::Transient)?;
    info!(count = moved.len(), "fetched files moved into incoming directory");

    let bytes_moved = futures_util::future::join_all(moved.iter().map(tokio::fs::metadata))
        .await
        .into_iter()
        .filter_map(Result::ok)
        .map(|m| m.len() as i64)
        .sum();

    ctx.fra
        .update_queue_counters(ctx.decoded.msg_or_dir_id, moved.len() as i64, bytes_moved)
        .await
        .map_err(AfdError::AttachFailed)?;

    Ok(())
}

/// The job's configured exec command, taken from the directory's `url`
/// field — an `exec://<command>` URL for exec-protocol directories, or the
/// bare command for one that was entered without a scheme.
fn fetch_command(dir: &FraRecord) -> String {
    dir.url.strip_prefix("exec://").unwrap_or(&dir.url).to_string()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::AfdConfig;
    use crate::status::{FraStore, FsaStore};
    use crate::worker::{DecodedArgs, WorkerArgs};
    use clap::Parser;

    async fn ctx(retrieve_work_dir: &str, command: &str) -> WorkerContext {
        let db = crate::db::AfdDb::new_in_memory().await.unwrap();
        let fsa = FsaStore::new(db.pool().clone());
        fsa.create_if_absent("host-a").await.unwrap();

        let fra = FraStore::new(db.pool().clone());
        let pos = fra.create_if_absent("dir-a").await.unwrap();
        sqlx::query("UPDATE fra_dirs SET retrieve_work_dir = ?, url = ? WHERE pos = ?")
            .bind(retrieve_work_dir)
            .bind(command)
            .bind(pos)
            .execute(db.pool())
            .await
            .unwrap();

        let args = WorkerArgs::try_parse_from(["afd-worker", "/work", "1", "0", "0", "0"]).unwrap();
        WorkerContext {
            config: AfdConfig::new("/work".into()),
            fsa,
            fra,
            args,
            decoded: DecodedArgs { job_no: 1, fsa_id: 0, fsa_pos: 0, msg_or_dir_id: pos },
        }
    }

    #[tokio::test]
    async fn run_fetch_moves_nothing_for_a_silent_command() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path().to_str().unwrap(), "exec://true").await;
        let result = run_fetch(&ctx).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn run_fetch_resolves_command_from_fra_url_not_a_literal() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path().to_str().unwrap(), "exec://echo hi > produced.txt").await;
        run_fetch(&ctx).await.unwrap();

        let record = ctx.fra.attach_for_read(ctx.decoded.msg_or_dir_id).await.unwrap();
        assert_eq!(record.files_queued, 1);
    }
}
