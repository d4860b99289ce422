//! SMTP adapter over `lettre`'s async tokio transport.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::instrument;

use super::{ConnState, ConnectOptions, ProtocolClient, ProtocolError, TimeoutFlag};

pub struct SmtpClient {
    transport: Option<AsyncSmtpTransport<Tokio1Executor>>,
    host: String,
    state: ConnState,
    timeout_flag: TimeoutFlag,
}

impl Default for SmtpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl SmtpClient {
    #[must_use]
    pub fn new() -> Self {
        Self {
            transport: None,
            host: String::new(),
            state: ConnState::Disconnected,
            timeout_flag: TimeoutFlag::Off,
        }
    }

    /// Sends a single message, the shape a cached [`crate::status::MdbRecord`]
    /// is rendered into before dispatch.
    #[instrument(skip(self, body))]
    pub async fn send(&mut self, from: &str, to: &str, subject: &str, body: Vec<u8>) -> Result<(), ProtocolError> {
        let transport = self
            .transport
            .as_ref()
            .ok_or_else(|| ProtocolError::Command("send() called before connect()".to_string()))?;

        let message = Message::builder()
            .from(from.parse().map_err(|e: lettre::address::AddressError| ProtocolError::Command(e.to_string()))?)
            .to(to.parse().map_err(|e: lettre::address::AddressError| ProtocolError::Command(e.to_string()))?)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body)
            .map_err(|e| ProtocolError::Command(e.to_string()))?;

        transport
            .send(message)
            .await
            .map_err(|e| ProtocolError::Command(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl ProtocolClient for SmtpClient {
    fn state(&self) -> ConnState {
        self.state
    }

    fn timeout_flag(&self) -> TimeoutFlag {
        self.timeout_flag
    }

    #[instrument(skip(self, opts))]
    async fn connect(&mut self, host: &str, opts: &ConnectOptions) -> Result<(), ProtocolError> {
        let builder = if opts.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::relay(host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host).port(opts.port).into()
        };
        let builder = builder.map_err(|e| ProtocolError::Connect {
            host: host.to_string(),
            port: opts.port,
            message: e.to_string(),
        })?;

        self.transport = Some(builder.port(opts.port).timeout(Some(opts.transfer_timeout)).build());
        self.host = host.to_string();
        self.state = ConnState::Connected;
        Ok(())
    }

    #[instrument(skip(self, pass))]
    async fn auth(&mut self, user: &str, pass: &str) -> Result<(), ProtocolError> {
        let transport = self
            .transport
            .take()
            .ok_or_else(|| ProtocolError::Command("auth() called before connect()".to_string()))?;

        let rebuilt = AsyncSmtpTransport::<Tokio1Executor>::relay(&self.host)
            .map_err(|e| ProtocolError::Auth { host: self.host.clone(), user: user.to_string(), message: e.to_string() })?
            .credentials(Credentials::new(user.to_string(), pass.to_string()))
            .build();

        drop(transport);
        self.transport = Some(rebuilt);
        self.state = ConnState::Authenticated;
        Ok(())
    }

    async fn write(&mut self, _buf: &[u8]) -> Result<usize, ProtocolError> {
        Err(ProtocolError::Command("use send() for SMTP messages".to_string()))
    }

    async fn read(&mut self, _buf: &mut [u8]) -> Result<usize, ProtocolError> {
        Err(ProtocolError::Command("use send() for SMTP messages".to_string()))
    }

    async fn quit(&mut self) -> Result<(), ProtocolError> {
        self.transport = None;
        self.state = ConnState::Disconnected;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_client_starts_disconnected() {
        let client = SmtpClient::new();
        assert_eq!(client.state(), ConnState::Disconnected);
    }
}
