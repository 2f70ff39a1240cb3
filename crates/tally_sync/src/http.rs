//! HTTP transport implementation.
//!
//! The actual HTTP client is abstracted via a trait so tests can inject
//! a fake and the connector stays independent of the HTTP library.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::transport::{RawResponse, TallyTransport};
use std::time::Duration;
use tracing::debug;

/// HTTP client abstraction.
///
/// Implement this trait to provide the actual HTTP layer. The default
/// implementation is [`UreqClient`].
pub trait HttpClient: Send + Sync {
    /// Sends a POST with a `text/xml` body and returns status and body.
    ///
    /// Non-2xx responses are returned as `Ok` so the transport can
    /// classify them; `Err` means the exchange itself failed (refused,
    /// timed out).
    fn post(&self, url: &str, body: &str, timeout: Duration) -> Result<RawResponse, String>;

    /// Issues a lightweight GET and reports whether the endpoint
    /// answered with a 2xx.
    fn probe(&self, url: &str, timeout: Duration) -> bool;
}

/// HTTP-based transport to a local Tally instance.
pub struct HttpTransport<C: HttpClient> {
    base_url: String,
    request_timeout: Duration,
    probe_timeout: Duration,
    client: C,
}

impl<C: HttpClient> HttpTransport<C> {
    /// Creates a transport for the given configuration.
    pub fn new(config: &SyncConfig, client: C) -> Self {
        Self {
            base_url: config.tally_url.clone(),
            request_timeout: config.request_timeout,
            probe_timeout: config.probe_timeout,
            client,
        }
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl<C: HttpClient> TallyTransport for HttpTransport<C> {
    fn send(&self, envelope: &str) -> SyncResult<RawResponse> {
        let response = self
            .client
            .post(&self.base_url, envelope, self.request_timeout)
            .map_err(SyncError::Connection)?;

        if !(200..300).contains(&response.status) {
            return Err(SyncError::Protocol(format!(
                "tally answered HTTP {}",
                response.status
            )));
        }
        debug!(status = response.status, bytes = response.body.len(), "tally response");
        Ok(response)
    }

    fn is_running(&self) -> bool {
        self.client.probe(&self.base_url, self.probe_timeout)
    }
}

/// Blocking HTTP client backed by `ureq`.
pub struct UreqClient {
    agent: ureq::Agent,
}

impl UreqClient {
    /// Creates a client with a fresh agent.
    pub fn new() -> Self {
        Self {
            agent: ureq::AgentBuilder::new().build(),
        }
    }
}

impl Default for UreqClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient for UreqClient {
    fn post(&self, url: &str, body: &str, timeout: Duration) -> Result<RawResponse, String> {
        let request = self
            .agent
            .post(url)
            .set("Content-Type", "text/xml")
            .timeout(timeout);

        match request.send_string(body) {
            Ok(response) => {
                let status = response.status();
                let body = response.into_string().map_err(|e| e.to_string())?;
                Ok(RawResponse { status, body })
            }
            // Non-2xx still carries a body; hand it up for classification.
            Err(ureq::Error::Status(status, response)) => Ok(RawResponse {
                status,
                body: response.into_string().unwrap_or_default(),
            }),
            Err(e) => Err(e.to_string()),
        }
    }

    fn probe(&self, url: &str, timeout: Duration) -> bool {
        self.agent.get(url).timeout(timeout).call().is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct ScriptedClient {
        result: Mutex<Option<Result<RawResponse, String>>>,
        reachable: bool,
    }

    impl ScriptedClient {
        fn replying(status: u16, body: &str) -> Self {
            Self {
                result: Mutex::new(Some(Ok(RawResponse {
                    status,
                    body: body.into(),
                }))),
                reachable: true,
            }
        }

        fn unreachable() -> Self {
            Self {
                result: Mutex::new(Some(Err("connection refused".into()))),
                reachable: false,
            }
        }
    }

    impl HttpClient for ScriptedClient {
        fn post(&self, _url: &str, _body: &str, _timeout: Duration) -> Result<RawResponse, String> {
            self.result
                .lock()
                .take()
                .unwrap_or_else(|| Err("no scripted result".into()))
        }

        fn probe(&self, _url: &str, _timeout: Duration) -> bool {
            self.reachable
        }
    }

    fn transport_with(client: ScriptedClient) -> HttpTransport<ScriptedClient> {
        HttpTransport::new(&SyncConfig::new("http://localhost:9000"), client)
    }

    #[test]
    fn ok_response_passes_through() {
        let transport = transport_with(ScriptedClient::replying(200, "<ENVELOPE/>"));
        let response = transport.send("<ENVELOPE/>").unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, "<ENVELOPE/>");
    }

    #[test]
    fn refused_connection_is_connection_error() {
        let transport = transport_with(ScriptedClient::unreachable());
        let err = transport.send("<ENVELOPE/>").unwrap_err();
        assert!(matches!(err, SyncError::Connection(_)));
        assert!(!transport.is_running());
    }

    #[test]
    fn non_2xx_is_protocol_error() {
        let transport = transport_with(ScriptedClient::replying(500, "boom"));
        let err = transport.send("<ENVELOPE/>").unwrap_err();
        match err {
            SyncError::Protocol(message) => assert!(message.contains("500")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn probe_reflects_reachability() {
        let transport = transport_with(ScriptedClient::replying(200, ""));
        assert!(transport.is_running());
        assert_eq!(transport.base_url(), "http://localhost:9000");
    }
}
