//! `afd-sf`: send-flavour transfer worker (§4.F, §6).

use std::process::ExitCode as ProcessExitCode;

use afd_core::config::AfdConfig;
use afd_core::db::AfdDb;
use afd_core::error::AfdError;
use afd_core::status::{FraStore, FsaStore};
use afd_core::worker::{WorkerArgs, WorkerContext, WorkerKind};
use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Maps an attach-time failure onto the process exit code a scheduler
/// should observe, negating the value (per §6) when the failure is a
/// malformed invocation rather than a runtime attach failure.
fn attach_error_code(err: &AfdError) -> u8 {
    let code = err.exit_code();
    if matches!(err, AfdError::Syntax(_)) {
        code.negated_raw() as u8
    } else {
        code.raw() as u8
    }
}

#[tokio::main]
async fn main() -> ProcessExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = WorkerArgs::parse();
    let config = AfdConfig::new(args.work_dir.clone().into());

    let db = match AfdDb::new(&config.status_db_path()).await {
        Ok(db) => db,
        Err(e) => {
            tracing::error!(error = %e, "failed to open status database");
            return ProcessExitCode::from(5);
        }
    };
    let fsa = FsaStore::new(db.pool().clone());
    let fra = FraStore::new(db.pool().clone());

    let ctx = match WorkerContext::attach(config, fsa, fra, args).await {
        Ok(ctx) => ctx,
        Err(e) => {
            tracing::error!(error = %e, "failed to attach worker position");
            return ProcessExitCode::from(attach_error_code(&e));
        }
    };

    let code = ctx.run(WorkerKind::Send).await;
    ProcessExitCode::from(code.raw() as u8)
}
