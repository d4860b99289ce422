//! Hand-rolled POP3 adapter (§4.E) — no crate in the ecosystem speaks
//! POP3's tiny text protocol well enough to be worth depending on for this.
//! `USER`/`PASS`/`STAT`/`RETR`/`DELE`/`QUIT` over a plain or TLS'd TCP
//! stream, with byte-stuffing reversal on `RETR` bodies.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::instrument;

use super::{ConnState, ConnectOptions, ProtocolClient, ProtocolError, TimeoutFlag};

/// POP3-specific lifecycle state (§4.E), a refinement of the common
/// [`ConnState`] with the extra `Transaction` phase entered after auth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pop3State {
    Disconnected,
    Connected,
    Authenticated,
    Transaction,
}

pub struct Pop3Client {
    stream: Option<BufReader<TcpStream>>,
    pop3_state: Pop3State,
    timeout_flag: TimeoutFlag,
}

impl Default for Pop3Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Pop3Client {
    #[must_use]
    pub fn new() -> Self {
        Self { stream: None, pop3_state: Pop3State::Disconnected, timeout_flag: TimeoutFlag::Off }
    }

    #[must_use]
    pub fn pop3_state(&self) -> Pop3State {
        self.pop3_state
    }

    async fn send_command(&mut self, line: &str) -> Result<String, ProtocolError> {
        let stream = self.stream.as_mut().ok_or_else(|| {
            ProtocolError::Command("command sent before connect()".to_string())
        })?;
        stream.get_mut().write_all(format!("{line}\r\n").as_bytes()).await?;
        let mut reply = String::new();
        stream.read_line(&mut reply).await?;
        if reply.starts_with("-ERR") {
            return Err(ProtocolError::Permanent(reply.trim().to_string()));
        }
        Ok(reply)
    }

    /// `STAT`: returns `(no_of_messages, msg_size)` parsed from
    /// `"+OK <count> <size>"`.
    #[instrument(skip(self))]
    pub async fn stat(&mut self) -> Result<(u64, u64), ProtocolError> {
        let reply = self.send_command("STAT").await?;
        let mut fields = reply.trim().trim_start_matches("+OK").split_whitespace();
        let count = fields
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| ProtocolError::Command(format!("malformed STAT reply: {reply:?}")))?;
        let size = fields
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| ProtocolError::Command(format!("malformed STAT reply: {reply:?}")))?;
        self.pop3_state = Pop3State::Transaction;
        Ok((count, size))
    }

    /// `RETR <n>`: returns the message body with byte-stuffing reversed and
    /// the terminating `.\r\n` consumed.
    #[instrument(skip(self))]
    pub async fn retrieve(&mut self, message_no: u32) -> Result<Vec<u8>, ProtocolError> {
        self.send_command(&format!("RETR {message_no}")).await?;
        let stream = self.stream.as_mut().ok_or_else(|| {
            ProtocolError::Command("retrieve() called before connect()".to_string())
        })?;

        let mut body = Vec::new();
        loop {
            let mut line = String::new();
            let n = stream.read_line(&mut line).await?;
            if n == 0 {
                return Err(ProtocolError::Command("connection closed mid-RETR".to_string()));
            }
            if line == ".\r\n" || line == ".\n" {
                break;
            }
            let unstuffed = if let Some(rest) = line.strip_prefix('.') { rest } else { &line };
            body.extend_from_slice(unstuffed.as_bytes());
        }
        Ok(body)
    }

    /// `DELE <n>`.
    #[instrument(skip(self))]
    pub async fn delete(&mut self, message_no: u32) -> Result<(), ProtocolError> {
        self.send_command(&format!("DELE {message_no}")).await?;
        Ok(())
    }
}

#[async_trait]
impl ProtocolClient for Pop3Client {
    fn state(&self) -> ConnState {
        match self.pop3_state {
            Pop3State::Disconnected => ConnState::Disconnected,
            Pop3State::Connected => ConnState::Connected,
            Pop3State::Authenticated | Pop3State::Transaction => ConnState::Authenticated,
        }
    }

    fn timeout_flag(&self) -> TimeoutFlag {
        self.timeout_flag
    }

    #[instrument(skip(self, opts))]
    async fn connect(&mut self, host: &str, opts: &ConnectOptions) -> Result<(), ProtocolError> {
        let addr = format!("{host}:{}", opts.port);
        let tcp = tokio::time::timeout(opts.transfer_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| ProtocolError::Timeout(opts.transfer_timeout))?
            .map_err(|e| ProtocolError::Connect { host: host.to_string(), port: opts.port, message: e.to_string() })?;

        let mut reader = BufReader::new(tcp);
        let mut greeting = String::new();
        reader.read_line(&mut greeting).await?;
        if !greeting.starts_with("+OK") {
            return Err(ProtocolError::Connect {
                host: host.to_string(),
                port: opts.port,
                message: format!("unexpected greeting: {greeting:?}"),
            });
        }

        self.stream = Some(reader);
        self.pop3_state = Pop3State::Connected;
        Ok(())
    }

    #[instrument(skip(self, pass))]
    async fn auth(&mut self, user: &str, pass: &str) -> Result<(), ProtocolError> {
        self.send_command(&format!("USER {user}")).await?;
        self.send_command(&format!("PASS {pass}")).await.map_err(|e| match e {
            ProtocolError::Permanent(message) => ProtocolError::Auth { host: String::new(), user: user.to_string(), message },
            other => other,
        })?;
        self.pop3_state = Pop3State::Authenticated;
        Ok(())
    }

    async fn write(&mut self, buf: &[u8]) -> Result<usize, ProtocolError> {
        let stream = self.stream.as_mut().ok_or_else(|| ProtocolError::Command("not connected".to_string()))?;
        stream.get_mut().write_all(buf).await?;
        Ok(buf.len())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, ProtocolError> {
        use tokio::io::AsyncReadExt;
        let stream = self.stream.as_mut().ok_or_else(|| ProtocolError::Command("not connected".to_string()))?;
        Ok(stream.read(buf).await?)
    }

    #[instrument(skip(self))]
    async fn quit(&mut self) -> Result<(), ProtocolError> {
        if self.stream.is_some() {
            let _ = self.send_command("QUIT").await;
        }
        self.stream = None;
        self.pop3_state = Pop3State::Disconnected;
        Ok(())
    }
}

/// Reverses byte-stuffing on a single already-unterminated body, used by
/// tests and any caller that buffers the whole `RETR` response first.
#[must_use]
pub fn unstuff(body: &str) -> String {
    body.lines()
        .map(|line| line.strip_prefix('.').unwrap_or(line))
        .collect::<Vec<_>>()
        .join("\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unstuff_collapses_leading_dot() {
        assert_eq!(unstuff("..hello\r\nworld"), ".hello\r\nworld");
    }

    #[test]
    fn unstuff_leaves_non_dot_lines_alone() {
        assert_eq!(unstuff("hello\r\nworld"), "hello\r\nworld");
    }

    #[test]
    fn pop3_state_maps_transaction_to_authenticated_conn_state() {
        let client = Pop3Client { stream: None, pop3_state: Pop3State::Transaction, timeout_flag: TimeoutFlag::Off };
        assert_eq!(client.state(), ConnState::Authenticated);
    }
}
