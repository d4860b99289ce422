//! HTTP adapter, built on the same `reqwest` client configuration the
//! donor's `HttpClient` uses (connect/read timeouts, gzip).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::instrument;

use super::{ConnState, ConnectOptions, ProtocolClient, ProtocolError, TimeoutFlag};

/// Adapter wrapping a pooled `reqwest::Client`. `connect`/`auth` are no-ops
/// beyond recording target state — HTTP's per-request model has no
/// persistent session the way FTP/SFTP do.
pub struct HttpAdapter {
    client: Client,
    base_url: Option<String>,
    state: ConnState,
    timeout_flag: TimeoutFlag,
}

impl HttpAdapter {
    /// Builds the client once; errors here are a static-configuration bug,
    /// never a runtime condition, so construction itself cannot fail.
    #[must_use]
    pub fn new(transfer_timeout: Duration) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(transfer_timeout)
            .gzip(true)
            .build()
            .unwrap_or_default();
        Self { client, base_url: None, state: ConnState::Disconnected, timeout_flag: TimeoutFlag::Off }
    }

    /// Issues a GET against `path` relative to the connected base URL and
    /// returns the full response body. Streaming to disk is the worker's
    /// job (`tokio::fs` + `BufWriter`, as the donor's `download_to_file`
    /// does); this adapter only speaks the wire protocol.
    #[instrument(skip(self))]
    pub async fn get(&mut self, path: &str) -> Result<Vec<u8>, ProtocolError> {
        let base = self.base_url.as_ref().ok_or_else(|| {
            ProtocolError::Command("get() called before connect()".to_string())
        })?;
        let url = format!("{base}{path}");
        let resp = self.client.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                self.timeout_flag = TimeoutFlag::On;
                ProtocolError::Timeout(Duration::from_secs(0))
            } else {
                ProtocolError::Command(e.to_string())
            }
        })?;

        if resp.status().is_client_error() || resp.status().is_server_error() {
            return Err(ProtocolError::Permanent(format!("HTTP {}", resp.status())));
        }

        resp.bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| ProtocolError::Command(e.to_string()))
    }
}

#[async_trait]
impl ProtocolClient for HttpAdapter {
    fn state(&self) -> ConnState {
        self.state
    }

    fn timeout_flag(&self) -> TimeoutFlag {
        self.timeout_flag
    }

    async fn connect(&mut self, host: &str, opts: &ConnectOptions) -> Result<(), ProtocolError> {
        let scheme = if opts.use_tls { "https" } else { "http" };
        self.base_url = Some(format!("{scheme}://{host}:{}", opts.port));
        self.state = ConnState::Connected;
        Ok(())
    }

    async fn auth(&mut self, _user: &str, _pass: &str) -> Result<(), ProtocolError> {
        // Basic-auth credentials are attached per-request by the caller via
        // RequestBuilder; there is no separate handshake to perform here.
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
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn get_returns_body_on_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/file.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello".to_vec()))
            .mount(&server)
            .await;

        let mut adapter = HttpAdapter::new(Duration::from_secs(5));
        adapter.base_url = Some(server.uri());
        adapter.state = ConnState::Connected;

        let body = adapter.get("/file.txt").await.unwrap();
        assert_eq!(body, b"hello");
    }

    #[tokio::test]
    async fn get_maps_5xx_to_permanent_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/broken"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let mut adapter = HttpAdapter::new(Duration::from_secs(5));
        adapter.base_url = Some(server.uri());

        let err = adapter.get("/broken").await.unwrap_err();
        assert!(matches!(err, ProtocolError::Permanent(_)));
    }

    #[tokio::test]
    async fn get_without_connect_is_a_command_error() {
        let mut adapter = HttpAdapter::new(Duration::from_secs(5));
        let err = adapter.get("/x").await.unwrap_err();
        assert!(matches!(err, ProtocolError::Command(_)));
    }
}
