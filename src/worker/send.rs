//! `sf_xxx` send flavour (§4.F step 4): `init_sf_burst2` plus the burst
//! work loop.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{info, instrument, warn};

use crate::error::AfdError;
use crate::protocol::{
    ConnectOptions, FtpClient, HttpAdapter, LocalClient, Pop3Client, ProtocolClient, ProtocolError,
    SftpClient, SmtpClient, WmoClient,
};
use crate::status::{FsaRecord, HostStatus, Protocol};

use super::{counters, WorkerContext};

/// Conventional port for this hand-rolled protocol; no registry assigns it
/// one, so it is this adapter's own default the way `ftp`'s 21 and `smtp`'s
/// 25 are theirs.
const DEFAULT_WMO_PORT: u16 = 9348;

/// `connect_status` markers `start_burst` writes into the job slot while a
/// burst is in flight (§4.F), one per protocol family.
const FTP_BURST_TRANSFER_ACTIVE: i64 = 1;
const SFTP_BURST_TRANSFER_ACTIVE: i64 = 2;
const HTTP_BURST_TRANSFER_ACTIVE: i64 = 3;
const SMTP_BURST_TRANSFER_ACTIVE: i64 = 4;
const POP3_BURST_TRANSFER_ACTIVE: i64 = 5;
const WMO_BURST_TRANSFER_ACTIVE: i64 = 6;
const LOC_BURST_TRANSFER_ACTIVE: i64 = 7;

/// Per-burst mutable copy of job configuration (rename rules, trans-exec
/// command, duplicate-check), populated fresh for every burst so a
/// config-reload mid-job cannot corrupt an in-flight burst.
#[derive(Debug, Clone, Default)]
pub struct BurstConfig {
    pub rename_rule_positions: Vec<i64>,
    pub trans_exec_command: Option<String>,
    pub dup_check_enabled: bool,
}

/// `init_sf_burst2`: reads any newly provided per-job config before a new
/// burst starts.
#[instrument]
pub fn init_sf_burst2(dup_check_enabled: bool, trans_exec_command: Option<String>) -> BurstConfig {
    BurstConfig { rename_rule_positions: Vec::new(), trans_exec_command, dup_check_enabled }
}

pub struct PendingFile {
    pub name: String,
    pub size: i64,
    pub path: PathBuf,
}

/// One send job's work loop: lists the host's outgoing spool, marks it
/// actively transferring, drives the configured protocol adapter through
/// the burst, then re-lists — `init_sf_burst2` starting a fresh burst each
/// time — for as long as the spool keeps producing work.
#[instrument(skip(ctx))]
pub async fn run_send(ctx: &WorkerContext) -> Result<(), AfdError> {
    loop {
        let burst = init_sf_burst2(false, None);
        info!(dup_check = burst.dup_check_enabled, "burst initialised");

        let record = ctx.fsa.attach_for_read(ctx.decoded.fsa_pos).await.map_err(AfdError::AttachFailed)?;
        let files = list_files_to_send(ctx, &record.host_alias).await?;
        if files.is_empty() {
            return Ok(());
        }

        ctx.fsa
            .update_host_status(ctx.decoded.fsa_pos, |status| {
                status.remove(HostStatus::OFFLINE);
            })
            .await
            .map_err(AfdError::AttachFailed)?;

        let outcome = drive_burst(ctx, &record, &files).await;
        let remaining_files = outcome.added_files - outcome.done_files;
        let remaining_bytes = outcome.added_bytes - outcome.done_bytes;

        if let Err(err) = outcome.result {
            counters::reset_fsa(
                &ctx.fsa,
                ctx.decoded.fsa_pos,
                ctx.decoded.job_no,
                true,
                remaining_files,
                remaining_bytes,
            )
            .await
            .map_err(AfdError::AttachFailed)?;
            return Err(err);
        }

        counters::reset_fsa(&ctx.fsa, ctx.decoded.fsa_pos, ctx.decoded.job_no, false, 0, 0)
            .await
            .map_err(AfdError::AttachFailed)?;
    }
}

/// Lists the files queued in the host's outgoing spool directory
/// (`$AFD_WORK_DIR/file_dir/<host_alias>`), sorted by name. A spool that
/// doesn't exist yet is "nothing to send", not an error.
async fn list_files_to_send(ctx: &WorkerContext, host_alias: &str) -> Result<Vec<PendingFile>, AfdError> {
    let dir = ctx.config.file_dir().join(host_alias);

    let mut entries = match tokio::fs::read_dir(&dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(AfdError::ResourceExhausted(format!("cannot open spool dir {}: {e}", dir.display()))),
    };

    let mut files = Vec::new();
    while let Some(entry) =
        entries.next_entry().await.map_err(|e| AfdError::ResourceExhausted(e.to_string()))?
    {
        let file_type = entry.file_type().await.map_err(|e| AfdError::ResourceExhausted(e.to_string()))?;
        if !file_type.is_file() {
            continue;
        }
        let metadata = entry.metadata().await.map_err(|e| AfdError::ResourceExhausted(e.to_string()))?;
        files.push(PendingFile {
            name: entry.file_name().to_string_lossy().into_owned(),
            size: metadata.len() as i64,
            path: entry.path(),
        });
    }
    files.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(files)
}

/// What a burst actually moved, independent of whether it ended in success
/// or failure — `added_*` is what [`FsaStore::start_burst`] put onto the
/// host's pending totals (zero if the burst never got that far), `done_*`
/// is what [`counters::update_tfc`] has since taken back off. The
/// difference is exactly what the caller must roll back through
/// `reset_fsa` on failure.
struct BurstOutcome {
    result: Result<(), AfdError>,
    added_files: i64,
    added_bytes: i64,
    done_files: i64,
    done_bytes: i64,
}

/// Drives one burst end to end: marks the host's job slot active with the
/// protocol's burst marker, connects/authenticates, pushes every file, then
/// disconnects.
#[instrument(skip(ctx, record, files))]
async fn drive_burst(ctx: &WorkerContext, record: &FsaRecord, files: &[PendingFile]) -> BurstOutcome {
    let total_bytes: i64 = files.iter().map(|f| f.size).sum();
    let timeout = Duration::from_secs(u64::from(ctx.config.default_transfer_timeout_secs));

    let (mut adapter, connect_status, port) = match build_client(record.protocol, timeout) {
        Ok(built) => built,
        Err(e) => {
            return BurstOutcome {
                result: Err(AfdError::PermanentRemote(e.to_string())),
                added_files: 0,
                added_bytes: 0,
                done_files: 0,
                done_bytes: 0,
            }
        }
    };

    if let Err(e) = ctx
        .fsa
        .start_burst(ctx.decoded.fsa_pos, ctx.decoded.job_no, connect_status, files.len() as i64, total_bytes)
        .await
    {
        return BurstOutcome {
            result: Err(AfdError::AttachFailed(e)),
            added_files: 0,
            added_bytes: 0,
            done_files: 0,
            done_bytes: 0,
        };
    }
    let (added_files, added_bytes) = (files.len() as i64, total_bytes);
    let mut done_files = 0;
    let mut done_bytes = 0;

    let host = record.current_real_hostname();
    let opts = ConnectOptions::new(port, timeout);

    let result = async {
        adapter.connect(host, &opts).await.map_err(protocol_error_to_afd)?;
        adapter.auth("", "").await.map_err(protocol_error_to_afd)?;

        for file in files {
            send_one_file(&mut adapter, file, host).await?;
            counters::update_tfc(&ctx.fsa, ctx.decoded.fsa_pos, 1, file.size, now())
                .await
                .map_err(AfdError::AttachFailed)?;
            done_files += 1;
            done_bytes += file.size;

            if let Err(e) = tokio::fs::remove_file(&file.path).await {
                warn!(path = %file.path.display(), error = %e, "sent file could not be removed from the spool");
            }
        }

        adapter.quit().await.map_err(protocol_error_to_afd)?;
        Ok(())
    }
    .await;

    BurstOutcome { result, added_files, added_bytes, done_files, done_bytes }
}

/// Pushes one file through the adapter: `LOC` copies the file directly
/// (its only real write semantics), every other protocol pushes the whole
/// file through the common [`ProtocolClient::write`] in one call, and a
/// short write — the generic stubs that silently return `Ok(0)` — is
/// treated as a protocol failure rather than a disguised success.
async fn send_one_file(adapter: &mut SendAdapter, file: &PendingFile, host: &str) -> Result<(), AfdError> {
    if let SendAdapter::Local(client) = adapter {
        client.copy_into(&file.path, Path::new(host)).await.map_err(protocol_error_to_afd)?;
        return Ok(());
    }

    let bytes = tokio::fs::read(&file.path).await.map_err(|e| AfdError::ResourceExhausted(e.to_string()))?;
    let written = adapter.write(&bytes).await.map_err(protocol_error_to_afd)?;
    if written != bytes.len() {
        return Err(protocol_error_to_afd(ProtocolError::Command(format!(
            "short write for {}: wrote {written} of {} bytes",
            file.name,
            bytes.len()
        ))));
    }
    Ok(())
}

/// Maps a protocol failure onto the worker's error taxonomy: authentication
/// and permanent-remote failures will not clear on retry, everything else
/// might.
fn protocol_error_to_afd(err: ProtocolError) -> AfdError {
    match err {
        ProtocolError::Auth { .. } | ProtocolError::Permanent(_) => AfdError::PermanentRemote(err.to_string()),
        other => AfdError::Transient(other),
    }
}

/// The protocol adapter a send burst drives, selected from the host's
/// configured [`Protocol`] bits. Preference order mirrors the donor's own
/// precedence when a host is (mis)configured for more than one protocol:
/// local copy and the hand-rolled wire protocols before the ecosystem ones.
enum SendAdapter {
    Local(LocalClient),
    Wmo(WmoClient),
    Ftp(FtpClient),
    Sftp(SftpClient),
    Http(HttpAdapter),
    Smtp(SmtpClient),
    Pop3(Pop3Client),
}

impl SendAdapter {
    async fn connect(&mut self, host: &str, opts: &ConnectOptions) -> Result<(), ProtocolError> {
        match self {
            Self::Local(c) => c.connect(host, opts).await,
            Self::Wmo(c) => c.connect(host, opts).await,
            Self::Ftp(c) => c.connect(host, opts).await,
            Self::Sftp(c) => c.connect(host, opts).await,
            Self::Http(c) => c.connect(host, opts).await,
            Self::Smtp(c) => c.connect(host, opts).await,
            Self::Pop3(c) => c.connect(host, opts).await,
        }
    }

    async fn auth(&mut self, user: &str, pass: &str) -> Result<(), ProtocolError> {
        match self {
            Self::Local(c) => c.auth(user, pass).await,
            Self::Wmo(c) => c.auth(user, pass).await,
            Self::Ftp(c) => c.auth(user, pass).await,
            Self::Sftp(c) => c.auth(user, pass).await,
            Self::Http(c) => c.auth(user, pass).await,
            Self::Smtp(c) => c.auth(user, pass).await,
            Self::Pop3(c) => c.auth(user, pass).await,
        }
    }

    async fn write(&mut self, buf: &[u8]) -> Result<usize, ProtocolError> {
        match self {
            Self::Local(c) => c.write(buf).await,
            Self::Wmo(c) => c.write(buf).await,
            Self::Ftp(c) => c.write(buf).await,
            Self::Sftp(c) => c.write(buf).await,
            Self::Http(c) => c.write(buf).await,
            Self::Smtp(c) => c.write(buf).await,
            Self::Pop3(c) => c.write(buf).await,
        }
    }

    async fn quit(&mut self) -> Result<(), ProtocolError> {
        match self {
            Self::Local(c) => c.quit().await,
            Self::Wmo(c) => c.quit().await,
            Self::Ftp(c) => c.quit().await,
            Self::Sftp(c) => c.quit().await,
            Self::Http(c) => c.quit().await,
            Self::Smtp(c) => c.quit().await,
            Self::Pop3(c) => c.quit().await,
        }
    }
}

/// Picks the adapter, burst-active marker and default port for a host's
/// configured protocol bits. A host with no sendable protocol configured is
/// a permanent misconfiguration, not something a retry will fix.
fn build_client(protocol: Protocol, _timeout: Duration) -> Result<(SendAdapter, i64, u16), ProtocolError> {
    if protocol.contains(Protocol::LOC) {
        Ok((SendAdapter::Local(LocalClient::new()), LOC_BURST_TRANSFER_ACTIVE, 0))
    } else if protocol.contains(Protocol::WMO) {
        Ok((SendAdapter::Wmo(WmoClient::new()), WMO_BURST_TRANSFER_ACTIVE, DEFAULT_WMO_PORT))
    } else if protocol.contains(Protocol::FTP) {
        Ok((SendAdapter::Ftp(FtpClient::new()), FTP_BURST_TRANSFER_ACTIVE, 21))
    } else if protocol.contains(Protocol::SFTP) {
        Ok((SendAdapter::Sftp(SftpClient::new()), SFTP_BURST_TRANSFER_ACTIVE, 22))
    } else if protocol.contains(Protocol::HTTP) {
        Ok((SendAdapter::Http(HttpAdapter::new(_timeout)), HTTP_BURST_TRANSFER_ACTIVE, 80))
    } else if protocol.contains(Protocol::SMTP) {
        Ok((SendAdapter::Smtp(SmtpClient::new()), SMTP_BURST_TRANSFER_ACTIVE, 25))
    } else if protocol.contains(Protocol::POP3) {
        Ok((SendAdapter::Pop3(Pop3Client::new()), POP3_BURST_TRANSFER_ACTIVE, 110))
    } else {
        Err(ProtocolError::Command(format!("host has no sendable protocol configured: {protocol:?}")))
    }
}

fn now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
