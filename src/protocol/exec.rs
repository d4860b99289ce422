//! Exec adapter (§4.E, §9). A spawned subprocess gets the `AFD_HC_TIMEOUT`
//! / `AFD_HC_BLOCKSIZE` / `AFD_CURRENT_HOSTNAME` prelude via an explicit
//! environment map and a `current_dir`, never a shell string concatenation
//! — the redesign this spec's §9 mandates over the donor's historical
//! `sh -c "<env>; cd <dir>; <cmd>"` shape.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::instrument;

use super::{ConnState, ConnectOptions, ProtocolClient, ProtocolError, TimeoutFlag};

pub struct ExecClient {
    state: ConnState,
    timeout_flag: TimeoutFlag,
}

impl Default for ExecClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecClient {
    #[must_use]
    pub fn new() -> Self {
        Self { state: ConnState::Disconnected, timeout_flag: TimeoutFlag::Off }
    }

    /// Runs `cmd` (passed to `sh -c`, but with no variable interpolation —
    /// the caller's own argument, not an assembled string) in `scratch_dir`
    /// with the prelude exported as real environment variables.
    #[instrument(skip(self, cmd))]
    pub async fn run(
        &mut self,
        cmd: &str,
        scratch_dir: &Path,
        timeout: Duration,
        hc_timeout_secs: u64,
        hc_blocksize: usize,
        current_hostname: &str,
    ) -> Result<std::process::Output, ProtocolError> {
        tokio::fs::create_dir_all(scratch_dir).await?;

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(cmd)
            .current_dir(scratch_dir)
            .env("AFD_HC_TIMEOUT", hc_timeout_secs.to_string())
            .env("AFD_HC_BLOCKSIZE", hc_blocksize.to_string())
            .env("AFD_CURRENT_HOSTNAME", current_hostname);

        let output = tokio::time::timeout(timeout, command.output())
            .await
            .map_err(|_| {
                self.timeout_flag = TimeoutFlag::On;
                ProtocolError::Timeout(timeout)
            })?
            .map_err(ProtocolError::Io)?;

        if !output.status.success() {
            return Err(ProtocolError::Permanent(format!(
                "exec command exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(output)
    }

    /// Moves every regular file out of `scratch_dir` into `incoming_dir`,
    /// the step that follows a successful `run()` for the fetch flavour.
    #[instrument(skip(self))]
    pub async fn drain_scratch(&self, scratch_dir: &Path, incoming_dir: &Path) -> Result<Vec<PathBuf>, ProtocolError> {
        tokio::fs::create_dir_all(incoming_dir).await?;
        let mut moved = Vec::new();
        let mut entries = tokio::fs::read_dir(scratch_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if !file_type.is_file() {
                continue;
            }
            let dest = incoming_dir.join(entry.file_name());
            tokio::fs::rename(entry.path(), &dest).await?;
            moved.push(dest);
        }
        Ok(moved)
    }
}

#[async_trait]
impl ProtocolClient for ExecClient {
    fn state(&self) -> ConnState {
        self.state
    }

    fn timeout_flag(&self) -> TimeoutFlag {
        self.timeout_flag
    }

    async fn connect(&mut self, _host: &str, _opts: &ConnectOptions) -> Result<(), ProtocolError> {
        self.state = ConnState::Connected;
        Ok(())
    }

    async fn auth(&mut self, _user: &str, _pass: &str) -> Result<(), ProtocolError> {
        self.state = ConnState::Authenticated;
        Ok(())
    }

    async fn write(&mut self, _buf: &[u8]) -> Result<usize, ProtocolError> {
        Ok(0)
    }

    async fn read(&mut self, _buf: &mut [u8]) -> Result<usize, ProtocolError> {
        Ok(0)
    }

    async fn quit(&mut self) -> Result<(), ProtocolError> {
        self.state = ConnState::Disconnected;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_exports_prelude_as_real_env_vars() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = ExecClient::new();
        let output = client
            .run(
                "echo \"$AFD_HC_TIMEOUT:$AFD_HC_BLOCKSIZE:$AFD_CURRENT_HOSTNAME\"",
                dir.path(),
                Duration::from_secs(5),
                30,
                4096,
                "host-a",
            )
            .await
            .unwrap();
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "30:4096:host-a");
    }

    #[tokio::test]
    async fn run_uses_scratch_dir_as_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = ExecClient::new();
        let output = client
            .run("pwd", dir.path(), Duration::from_secs(5), 30, 4096, "host-a")
            .await
            .unwrap();
        let printed = String::from_utf8_lossy(&output.stdout);
        assert_eq!(printed.trim(), dir.path().to_string_lossy());
    }

    #[tokio::test]
    async fn drain_scratch_moves_regular_files_only() {
        let scratch = tempfile::tempdir().unwrap();
        let incoming = tempfile::tempdir().unwrap();
        tokio::fs::write(scratch.path().join("a.dat"), b"x").await.unwrap();
        tokio::fs::create_dir(scratch.path().join("subdir")).await.unwrap();

        let client = ExecClient::new();
        let moved = client.drain_scratch(scratch.path(), incoming.path()).await.unwrap();

        assert_eq!(moved.len(), 1);
        assert!(incoming.path().join("a.dat").exists());
        assert!(!scratch.path().join("a.dat").exists());
    }

    #[tokio::test]
    async fn failing_command_is_a_permanent_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = ExecClient::new();
        let err = client
            .run("exit 7", dir.path(), Duration::from_secs(5), 30, 4096, "host-a")
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Permanent(_)));
    }
}
