//! Local/LOC adapter (§4.E, §9): filesystem copy with `rename`, the same
//! crash-safe hidden-sibling-then-rename pattern [`crate::lsdata`] uses for
//! its own persistence.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::instrument;

use super::{ConnState, ConnectOptions, ProtocolClient, ProtocolError, TimeoutFlag};

pub struct LocalClient {
    root: Option<PathBuf>,
    state: ConnState,
    timeout_flag: TimeoutFlag,
}

impl Default for LocalClient {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalClient {
    #[must_use]
    pub fn new() -> Self {
        Self { root: None, state: ConnState::Disconnected, timeout_flag: TimeoutFlag::Off }
    }

    /// Copies `source` into `dest_dir` by writing to a hidden sibling and
    /// renaming over the final name, so a crash mid-copy never leaves a
    /// partially-written file at the visible path.
    #[instrument(skip(self))]
    pub async fn copy_into(&self, source: &Path, dest_dir: &Path) -> Result<PathBuf, ProtocolError> {
        let file_name = source
            .file_name()
            .ok_or_else(|| ProtocolError::Command(format!("source has no file name: {}", source.display())))?;

        fs::create_dir_all(dest_dir).await?;
        let dest = dest_dir.join(file_name);
        let staging = dest_dir.join(format!(".{}", file_name.to_string_lossy()));

        fs::copy(source, &staging).await?;
        fs::rename(&staging, &dest).await?;
        Ok(dest)
    }
}

#[async_trait]
impl ProtocolClient for LocalClient {
    fn state(&self) -> ConnState {
        self.state
    }

    fn timeout_flag(&self) -> TimeoutFlag {
        self.timeout_flag
    }

    async fn connect(&mut self, host: &str, _opts: &ConnectOptions) -> Result<(), ProtocolError> {
        self.root = Some(PathBuf::from(host));
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
    async fn copy_into_produces_readable_file_at_dest() {
        let src_dir = tempfile::tempdir().unwrap();
        let dest_dir = tempfile::tempdir().unwrap();

        let source = src_dir.path().join("report.txt");
        tokio::fs::write(&source, b"payload").await.unwrap();

        let client = LocalClient::new();
        let dest = client.copy_into(&source, dest_dir.path()).await.unwrap();

        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"payload");
        assert!(!dest_dir.path().join(".report.txt").exists());
    }
}
