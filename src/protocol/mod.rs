//! Protocol adapters (§4.E): a uniform client interface over FTP, SFTP,
//! HTTP, SMTP, POP3, WMO, local copy and exec, each behind [`ProtocolClient`].

mod exec;
mod ftp;
mod http;
mod local;
mod pop3;
mod smtp;
mod sftp;
mod wmo;

pub use exec::ExecClient;
pub use ftp::FtpClient;
pub use http::HttpAdapter;
pub use local::LocalClient;
pub use pop3::{Pop3Client, Pop3State};
pub use smtp::SmtpClient;
pub use sftp::SftpClient;
pub use wmo::{WmoClient, WmoReply};

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Protocol adapter errors. Narrower than [`crate::error::AfdError`]; callers
/// convert via `#[from]` at the worker boundary.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("connect to {host}:{port} failed: {message}")]
    Connect { host: String, port: u16, message: String },

    #[error("authentication failed for {user}@{host}: {message}")]
    Auth { host: String, user: String, message: String },

    #[error("timed out after {0:?} with no bytes transferred")]
    Timeout(Duration),

    #[error("protocol command failed: {0}")]
    Command(String),

    #[error("remote reported a permanent failure: {0}")]
    Permanent(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// The process-global "why did the last call return early" flag, consulted
/// by the worker to decide whether a graceful `quit()` is worth attempting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeoutFlag {
    #[default]
    Off,
    On,
    ConReset,
    ConRefused,
    Neither,
}

/// Adapter connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connected,
    Authenticated,
}

/// Options shared by every `connect()` call.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub port: u16,
    pub transfer_timeout: Duration,
    pub use_tls: bool,
}

impl ConnectOptions {
    #[must_use]
    pub fn new(port: u16, transfer_timeout: Duration) -> Self {
        Self { port, transfer_timeout, use_tls: false }
    }

    #[must_use]
    pub fn with_tls(mut self) -> Self {
        self.use_tls = true;
        self
    }
}

/// Common contract every protocol adapter implements (§4.E): `connect`,
/// `auth`, `read`/`write`, `quit`. Adapters that have no meaningful
/// byte-stream (`exec`, `local`) implement `read`/`write` as no-ops
/// returning zero.
#[async_trait]
pub trait ProtocolClient: Send {
    fn state(&self) -> ConnState;

    fn timeout_flag(&self) -> TimeoutFlag;

    async fn connect(&mut self, host: &str, opts: &ConnectOptions) -> Result<(), ProtocolError>;

    async fn auth(&mut self, user: &str, pass: &str) -> Result<(), ProtocolError>;

    async fn write(&mut self, buf: &[u8]) -> Result<usize, ProtocolError>;

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, ProtocolError>;

    async fn quit(&mut self) -> Result<(), ProtocolError>;
}

/// Bounded-retry connect helper shared by every adapter's `connect`: eight
/// rapid retries with a one-second backoff before giving up (§4.E).
pub async fn connect_with_retry<F, Fut>(mut attempt: F) -> Result<(), ProtocolError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<(), ProtocolError>>,
{
    const MAX_RETRIES: u32 = 8;
    const BACKOFF: Duration = Duration::from_secs(1);

    let mut last_err = None;
    for try_no in 0..=MAX_RETRIES {
        match attempt().await {
            Ok(()) => return Ok(()),
            Err(e @ (ProtocolError::Auth { .. } | ProtocolError::Permanent(_))) => {
                return Err(e); // non-retryable, surface immediately
            }
            Err(e) => {
                debug!(try_no, error = %e, "connect attempt failed, retrying");
                last_err = Some(e);
                if try_no < MAX_RETRIES {
                    sleep(BACKOFF).await;
                }
            }
        }
    }
    warn!("exhausted connect retries");
    Err(last_err.expect("loop always sets last_err before exhausting retries"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retry_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result = connect_with_retry(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ProtocolError::Connect { host: "h".into(), port: 1, message: "refused".into() }) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 9);
    }

    #[tokio::test]
    async fn retry_succeeds_immediately() {
        let result = connect_with_retry(|| async { Ok(()) }).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn auth_failure_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result = connect_with_retry(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(ProtocolError::Auth {
                    host: "h".into(),
                    user: "u".into(),
                    message: "bad password".into(),
                })
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
