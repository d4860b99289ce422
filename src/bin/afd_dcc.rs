//! `afd-dcc`: `udc`/`uhc` config-reload tool (§6).
//!
//! Writes a one-byte opcode plus the caller's PID into the `db_update`
//! FIFO, creates a per-PID reply FIFO, waits on it with a bounded
//! `select()`, and exits `0` (no change/ok), `2` (warnings), `3` (errors)
//! or `255` (internal failure / timeout).

use std::ffi::CString;
use std::fs::File;
use std::io::Read;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use afd_core::config::{AfdConfig, AFD_WORK_DIR_VAR};
use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Opcode {
    /// `udc`: reload DIR_CONFIG.
    Udc,
    /// `uhc`: reload HOST_CONFIG.
    Uhc,
}

impl Opcode {
    fn byte(self) -> u8 {
        match self {
            Self::Udc => b'D',
            Self::Uhc => b'H',
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "afd-dcc")]
struct Args {
    #[arg(value_enum)]
    opcode: Opcode,

    work_dir: Option<String>,

    /// How long to wait for the daemon's reply before giving up.
    #[arg(long, default_value_t = 10)]
    timeout_secs: u32,
}

const REPLY_OK: u8 = 0;
const REPLY_WARN: u8 = 1;
const REPLY_ERROR: u8 = 2;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match run() {
        Ok(code) => code,
        Err(e) => {
            warn!(error = %e, "afd-dcc failed");
            ExitCode::from(255)
        }
    }
}

fn run() -> Result<ExitCode> {
    let args = Args::parse();
    let work_dir = match args.work_dir {
        Some(dir) => dir,
        None => std::env::var(AFD_WORK_DIR_VAR).context("AFD_WORK_DIR is not set and no work directory was given")?,
    };
    let config = AfdConfig::new(work_dir.into());
    let pid = std::process::id();

    let db_update_fifo = config.fifo_dir().join("db_update");
    let reply_fifo_path = config.fifo_dir().join(format!("db_update_reply.{pid}"));

    ensure_fifo(&reply_fifo_path)?;
    let _cleanup = FifoCleanup(reply_fifo_path.clone());

    write_request(&db_update_fifo, args.opcode, pid)?;
    info!(opcode = ?args.opcode, pid, "wrote config-reload request");

    match wait_for_reply(&reply_fifo_path, args.timeout_secs)? {
        Some(REPLY_OK) => {
            println!("config reload: ok, no change");
            Ok(ExitCode::from(0))
        }
        Some(REPLY_WARN) => {
            println!("config reload: completed with warnings");
            Ok(ExitCode::from(2))
        }
        Some(REPLY_ERROR) => {
            println!("config reload: completed with errors");
            Ok(ExitCode::from(3))
        }
        Some(other) => {
            warn!(reply_byte = other, "unrecognised reply byte");
            Ok(ExitCode::from(255))
        }
        None => {
            warn!(timeout_secs = args.timeout_secs, "timed out waiting for db_update reply");
            Ok(ExitCode::from(255))
        }
    }
}

fn ensure_fifo(path: &Path) -> Result<()> {
    let c_path = CString::new(path.as_os_str().to_string_lossy().as_bytes()).context("path has interior NUL")?;
    // Mode 0o600: only this tool's own invocation and the daemon need access.
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::AlreadyExists {
            bail!("mkfifo({}) failed: {err}", path.display());
        }
    }
    Ok(())
}

fn write_request(fifo: &Path, opcode: Opcode, pid: u32) -> Result<()> {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(fifo)
        .with_context(|| format!("opening {} for write (is the daemon running?)", fifo.display()))?;

    let mut payload = Vec::with_capacity(5);
    payload.push(opcode.byte());
    payload.extend_from_slice(&pid.to_le_bytes());
    file.write_all(&payload).context("writing to db_update FIFO")?;
    Ok(())
}

/// Blocks, via `select()`, until the reply FIFO has a byte ready or
/// `timeout_secs` elapses.
fn wait_for_reply(path: &Path, timeout_secs: u32) -> Result<Option<u8>> {
    let file = File::open(path).with_context(|| format!("opening reply FIFO {}", path.display()))?;
    let fd = file.as_raw_fd();

    let mut read_fds: libc::fd_set = unsafe { std::mem::zeroed() };
    unsafe {
        libc::FD_ZERO(&mut read_fds);
        libc::FD_SET(fd, &mut read_fds);
    }
    let mut timeout = libc::timeval { tv_sec: libc::time_t::from(timeout_secs), tv_usec: 0 };

    let rc = unsafe { libc::select(fd + 1, &mut read_fds, std::ptr::null_mut(), std::ptr::null_mut(), &mut timeout) };
    if rc < 0 {
        bail!("select() on reply FIFO failed: {}", std::io::Error::last_os_error());
    }
    if rc == 0 {
        return Ok(None); // timed out
    }

    let mut buf = [0_u8; 1];
    let mut file = file;
    let n = file.read(&mut buf).context("reading reply FIFO")?;
    Ok(if n == 1 { Some(buf[0]) } else { None })
}

struct FifoCleanup(PathBuf);

impl Drop for FifoCleanup {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}
