//! SFTP adapter over `ssh2`, the same SSH transport crate
//! `NitronPlus-hostpilot` uses. `ssh2::Session` is synchronous; every call
//! runs on a blocking thread.

use std::io::Read;
use std::net::TcpStream;

use async_trait::async_trait;
use ssh2::Session;
use tracing::instrument;

use super::TimeoutFlag;
use super::{ConnState, ConnectOptions, ProtocolClient, ProtocolError};

pub struct SftpClient {
    session: Option<Session>,
    state: ConnState,
    timeout_flag: TimeoutFlag,
}

impl Default for SftpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl SftpClient {
    #[must_use]
    pub fn new() -> Self {
        Self { session: None, state: ConnState::Disconnected, timeout_flag: TimeoutFlag::Off }
    }

    /// Retrieves `remote_path` in full.
    #[instrument(skip(self))]
    pub async fn retrieve(&mut self, remote_path: &str) -> Result<Vec<u8>, ProtocolError> {
        let session = self
            .session
            .clone()
            .ok_or_else(|| ProtocolError::Command("retrieve() called before connect()".to_string()))?;
        let remote_path = remote_path.to_string();

        tokio::task::spawn_blocking(move || {
            let sftp = session.sftp().map_err(|e| ProtocolError::Command(e.to_string()))?;
            let mut file = sftp
                .open(std::path::Path::new(&remote_path))
                .map_err(|e| ProtocolError::Command(e.to_string()))?;
            let mut buf = Vec::new();
            file.read_to_end(&mut buf).map_err(ProtocolError::Io)?;
            Ok(buf)
        })
        .await
        .map_err(|e| ProtocolError::Command(format!("blocking task panicked: {e}")))?
    }
}

#[async_trait]
impl ProtocolClient for SftpClient {
    fn state(&self) -> ConnState {
        self.state
    }

    fn timeout_flag(&self) -> TimeoutFlag {
        self.timeout_flag
    }

    #[instrument(skip(self, opts))]
    async fn connect(&mut self, host: &str, opts: &ConnectOptions) -> Result<(), ProtocolError> {
        let addr = format!("{host}:{}", opts.port);
        let timeout_ms = u32::try_from(opts.transfer_timeout.as_millis()).unwrap_or(u32::MAX);

        let session = tokio::task::spawn_blocking(move || -> Result<Session, ProtocolError> {
            let tcp = TcpStream::connect(&addr).map_err(|e| ProtocolError::Connect {
                host: addr.clone(),
                port: 0,
                message: e.to_string(),
            })?;
            let mut session = Session::new().map_err(|e| ProtocolError::Connect {
                host: addr.clone(),
                port: 0,
                message: e.to_string(),
            })?;
            session.set_tcp_stream(tcp);
            session.set_timeout(timeout_ms);
            session.handshake().map_err(|e| ProtocolError::Connect {
                host: addr,
                port: 0,
                message: e.to_string(),
            })?;
            Ok(session)
        })
        .await
        .map_err(|e| ProtocolError::Command(format!("blocking task panicked: {e}")))??;

        self.session = Some(session);
        self.state = ConnState::Connected;
        Ok(())
    }

    #[instrument(skip(self, pass))]
    async fn auth(&mut self, user: &str, pass: &str) -> Result<(), ProtocolError> {
        let session = self
            .session
            .clone()
            .ok_or_else(|| ProtocolError::Command("auth() called before connect()".to_string()))?;
        let user_owned = user.to_string();
        let pass_owned = pass.to_string();

        tokio::task::spawn_blocking(move || {
            session.userauth_password(&user_owned, &pass_owned).map_err(|e| ProtocolError::Auth {
                host: String::new(),
                user: user_owned,
                message: e.to_string(),
            })
        })
        .await
        .map_err(|e| ProtocolError::Command(format!("blocking task panicked: {e}")))??;

        self.state = ConnState::Authenticated;
        Ok(())
    }

    async fn write(&mut self, _buf: &[u8]) -> Result<usize, ProtocolError> {
        Err(ProtocolError::Command("use retrieve()/store() for SFTP transfers".to_string()))
    }

    async fn read(&mut self, _buf: &mut [u8]) -> Result<usize, ProtocolError> {
        Err(ProtocolError::Command("use retrieve()/store() for SFTP transfers".to_string()))
    }

    async fn quit(&mut self) -> Result<(), ProtocolError> {
        self.session = None;
        self.state = ConnState::Disconnected;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_client_starts_disconnected() {
        let client = SftpClient::new();
        assert_eq!(client.state(), ConnState::Disconnected);
    }
}
