//! Hand-rolled WMO adapter (§4.E/§9): a ten-byte acknowledgement frame,
//! `"00000000AK"` or `"00000000NA"`, over a plain TCP socket. No ecosystem
//! crate speaks this; it is eight header bytes plus a two-letter verdict.

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::instrument;

use super::{ConnState, ConnectOptions, ProtocolClient, ProtocolError, TimeoutFlag};

const FRAME_LEN: usize = 10;
const ACK_SUFFIX: &[u8; 2] = b"AK";
const NACK_SUFFIX: &[u8; 2] = b"NA";

/// Outcome of [`WmoClient::check_reply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WmoReply {
    Acknowledge,
    NegativeAcknowledge,
}

pub struct WmoClient {
    stream: Option<TcpStream>,
    state: ConnState,
    timeout_flag: TimeoutFlag,
}

impl Default for WmoClient {
    fn default() -> Self {
        Self::new()
    }
}

impl WmoClient {
    #[must_use]
    pub fn new() -> Self {
        Self { stream: None, state: ConnState::Disconnected, timeout_flag: TimeoutFlag::Off }
    }

    /// Sends the eight-byte message-length header followed by the payload.
    #[instrument(skip(self, payload))]
    pub async fn send_frame(&mut self, payload: &[u8]) -> Result<(), ProtocolError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| ProtocolError::Command("send_frame() called before connect()".to_string()))?;
        let header = format!("{:08}", payload.len());
        stream.write_all(header.as_bytes()).await?;
        stream.write_all(payload).await?;
        Ok(())
    }

    /// Reads the fixed ten-byte reply frame and classifies it.
    #[instrument(skip(self))]
    pub async fn check_reply(&mut self) -> Result<WmoReply, ProtocolError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| ProtocolError::Command("check_reply() called before connect()".to_string()))?;

        let mut frame = [0u8; FRAME_LEN];
        stream.read_exact(&mut frame).await?;
        classify_frame(&frame)
    }
}

fn classify_frame(frame: &[u8; FRAME_LEN]) -> Result<WmoReply, ProtocolError> {
    let suffix = &frame[FRAME_LEN - 2..];
    if suffix == ACK_SUFFIX {
        Ok(WmoReply::Acknowledge)
    } else if suffix == NACK_SUFFIX {
        Ok(WmoReply::NegativeAcknowledge)
    } else {
        Err(ProtocolError::Command(format!(
            "unrecognised WMO reply frame: {:?}",
            String::from_utf8_lossy(frame)
        )))
    }
}

#[async_trait]
impl ProtocolClient for WmoClient {
    fn state(&self) -> ConnState {
        self.state
    }

    fn timeout_flag(&self) -> TimeoutFlag {
        self.timeout_flag
    }

    #[instrument(skip(self, opts))]
    async fn connect(&mut self, host: &str, opts: &ConnectOptions) -> Result<(), ProtocolError> {
        let addr = format!("{host}:{}", opts.port);
        let stream = tokio::time::timeout(opts.transfer_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| ProtocolError::Timeout(opts.transfer_timeout))?
            .map_err(|e| ProtocolError::Connect { host: host.to_string(), port: opts.port, message: e.to_string() })?;

        self.stream = Some(stream);
        self.state = ConnState::Connected;
        Ok(())
    }

    async fn auth(&mut self, _user: &str, _pass: &str) -> Result<(), ProtocolError> {
        // WMO has no login step; the peer identifies itself at the
        // application layer via the message payload instead.
        self.state = ConnState::Authenticated;
        Ok(())
    }

    async fn write(&mut self, buf: &[u8]) -> Result<usize, ProtocolError> {
        self.send_frame(buf).await?;
        Ok(buf.len())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, ProtocolError> {
        let stream = self.stream.as_mut().ok_or_else(|| ProtocolError::Command("not connected".to_string()))?;
        Ok(stream.read(buf).await?)
    }

    async fn quit(&mut self) -> Result<(), ProtocolError> {
        self.stream = None;
        self.state = ConnState::Disconnected;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_ack_frame() {
        assert_eq!(classify_frame(b"00000000AK").unwrap(), WmoReply::Acknowledge);
    }

    #[test]
    fn classifies_nack_frame() {
        assert_eq!(classify_frame(b"00000000NA").unwrap(), WmoReply::NegativeAcknowledge);
    }

    #[test]
    fn rejects_unrecognised_suffix() {
        assert!(classify_frame(b"00000000XX").is_err());
    }
}
