//! FTP adapter. `suppaftp`'s client is synchronous; every call is pushed
//! onto a blocking thread the same way [`super::sftp`] wraps `ssh2`.

use std::io::Read;
use std::net::TcpStream;
use std::time::Duration;

use async_trait::async_trait;
use suppaftp::FtpStream;
use tracing::instrument;

use super::{ConnState, ConnectOptions, ProtocolClient, ProtocolError};
use super::TimeoutFlag;

pub struct FtpClient {
    stream: Option<FtpStream>,
    state: ConnState,
    timeout_flag: TimeoutFlag,
}

impl Default for FtpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl FtpClient {
    #[must_use]
    pub fn new() -> Self {
        Self { stream: None, state: ConnState::Disconnected, timeout_flag: TimeoutFlag::Off }
    }

    /// Retrieves `remote_path` in full, the blocking-IO analogue of
    /// `HttpAdapter::get`.
    #[instrument(skip(self))]
    pub async fn retrieve(&mut self, remote_path: &str) -> Result<Vec<u8>, ProtocolError> {
        let mut stream = self.stream.take().ok_or_else(|| {
            ProtocolError::Command("retrieve() called before connect()".to_string())
        })?;
        let remote_path = remote_path.to_string();

        let result = tokio::task::spawn_blocking(move || {
            let mut reader = stream
                .retr_as_stream(&remote_path)
                .map_err(|e| ProtocolError::Command(e.to_string()))?;
            let mut buf = Vec::new();
            reader
                .read_to_end(&mut buf)
                .map_err(ProtocolError::Io)?;
            stream
                .finalize_retr_stream(reader)
                .map_err(|e| ProtocolError::Command(e.to_string()))?;
            Ok::<_, ProtocolError>((stream, buf))
        })
        .await
        .map_err(|e| ProtocolError::Command(format!("blocking task panicked: {e}")))??;

        self.stream = Some(result.0);
        Ok(result.1)
    }
}

#[async_trait]
impl ProtocolClient for FtpClient {
    fn state(&self) -> ConnState {
        self.state
    }

    fn timeout_flag(&self) -> TimeoutFlag {
        self.timeout_flag
    }

    #[instrument(skip(self, opts))]
    async fn connect(&mut self, host: &str, opts: &ConnectOptions) -> Result<(), ProtocolError> {
        let addr = format!("{host}:{}", opts.port);
        let timeout = opts.transfer_timeout;

        let stream = tokio::task::spawn_blocking(move || -> Result<FtpStream, ProtocolError> {
            let tcp = TcpStream::connect(&addr).map_err(|e| ProtocolError::Connect {
                host: addr.clone(),
                port: 0,
                message: e.to_string(),
            })?;
            tcp.set_read_timeout(Some(timeout)).map_err(ProtocolError::Io)?;
            FtpStream::connect_with_stream(tcp).map_err(|e| ProtocolError::Connect {
                host: addr,
                port: 0,
                message: e.to_string(),
            })
        })
        .await
        .map_err(|e| ProtocolError::Command(format!("blocking task panicked: {e}")))??;

        self.stream = Some(stream);
        self.state = ConnState::Connected;
        Ok(())
    }

    #[instrument(skip(self, pass))]
    async fn auth(&mut self, user: &str, pass: &str) -> Result<(), ProtocolError> {
        let mut stream = self.stream.take().ok_or_else(|| {
            ProtocolError::Command("auth() called before connect()".to_string())
        })?;
        let user = user.to_string();
        let pass = pass.to_string();

        let stream = tokio::task::spawn_blocking(move || {
            stream
                .login(&user, &pass)
                .map(|()| stream)
                .map_err(|e| ProtocolError::Auth { host: String::new(), user, message: e.to_string() })
        })
        .await
        .map_err(|e| ProtocolError::Command(format!("blocking task panicked: {e}")))??;

        self.stream = Some(stream);
        self.state = ConnState::Authenticated;
        Ok(())
    }

    async fn write(&mut self, _buf: &[u8]) -> Result<usize, ProtocolError> {
        Err(ProtocolError::Command("use store()/retrieve() for FTP transfers".to_string()))
    }

    async fn read(&mut self, _buf: &mut [u8]) -> Result<usize, ProtocolError> {
        Err(ProtocolError::Command("use store()/retrieve() for FTP transfers".to_string()))
    }

    #[instrument(skip(self))]
    async fn quit(&mut self) -> Result<(), ProtocolError> {
        if let Some(mut stream) = self.stream.take() {
            tokio::task::spawn_blocking(move || stream.quit())
                .await
                .map_err(|e| ProtocolError::Command(format!("blocking task panicked: {e}")))?
                .map_err(|e| ProtocolError::Command(e.to_string()))?;
        }
        self.state = ConnState::Disconnected;
        Ok(())
    }
}
