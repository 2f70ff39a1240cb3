//! Transport layer abstraction for talking to Tally.

use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// A raw HTTP response from Tally.
///
/// Tally signals application errors inside a 200-OK body, so the body is
/// kept verbatim for the parser; only transport-level problems are
/// classified here.
#[derive(Debug, Clone)]
pub struct RawResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body.
    pub body: String,
}

/// A transport handles network communication with the local Tally
/// instance.
///
/// This trait abstracts the network layer, allowing different
/// implementations (HTTP, mock for testing). Retries are the connector's
/// responsibility, never the transport's.
pub trait TallyTransport: Send + Sync {
    /// Issues a single synchronous POST with the given envelope.
    ///
    /// Fails with [`SyncError::Connection`] if the endpoint refuses or
    /// times out, [`SyncError::Protocol`] if the HTTP status is non-2xx.
    fn send(&self, envelope: &str) -> SyncResult<RawResponse>;

    /// Lightweight liveness probe. Returns false (never errors) on any
    /// failure, so callers can decide whether to attempt a sync at all.
    fn is_running(&self) -> bool;
}

/// A mock transport for testing.
///
/// Responses are scripted in order; each `send` consumes one. An empty
/// script yields a connection error.
#[derive(Debug, Default)]
pub struct MockTransport {
    running: AtomicBool,
    responses: Mutex<VecDeque<SyncResult<RawResponse>>>,
    sends: AtomicU64,
    probes: AtomicU64,
}

impl MockTransport {
    /// Creates a new mock transport that reports Tally as running.
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(true),
            responses: Mutex::new(VecDeque::new()),
            sends: AtomicU64::new(0),
            probes: AtomicU64::new(0),
        }
    }

    /// Scripts a successful 200 response with the given body.
    pub fn push_body(&self, body: impl Into<String>) {
        self.responses.lock().push_back(Ok(RawResponse {
            status: 200,
            body: body.into(),
        }));
    }

    /// Scripts an error for the next send.
    pub fn push_error(&self, error: SyncError) {
        self.responses.lock().push_back(Err(error));
    }

    /// Sets the liveness probe result.
    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    /// Number of `send` calls so far.
    pub fn sends(&self) -> u64 {
        self.sends.load(Ordering::SeqCst)
    }

    /// Number of `is_running` calls so far.
    pub fn probes(&self) -> u64 {
        self.probes.load(Ordering::SeqCst)
    }
}

impl TallyTransport for MockTransport {
    fn send(&self, _envelope: &str) -> SyncResult<RawResponse> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        self.responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(SyncError::Connection("no scripted response".into())))
    }

    fn is_running(&self) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_scripted_responses_in_order() {
        let transport = MockTransport::new();
        transport.push_body("first");
        transport.push_body("second");

        assert_eq!(transport.send("<ENVELOPE/>").unwrap().body, "first");
        assert_eq!(transport.send("<ENVELOPE/>").unwrap().body, "second");
        assert_eq!(transport.sends(), 2);
    }

    #[test]
    fn mock_empty_script_is_connection_error() {
        let transport = MockTransport::new();
        let err = transport.send("<ENVELOPE/>").unwrap_err();
        assert!(matches!(err, SyncError::Connection(_)));
    }

    #[test]
    fn mock_probe_never_errors() {
        let transport = MockTransport::new();
        assert!(transport.is_running());
        transport.set_running(false);
        assert!(!transport.is_running());
        assert_eq!(transport.probes(), 2);
    }

    #[test]
    fn mock_scripted_error() {
        let transport = MockTransport::new();
        transport.push_error(SyncError::Protocol("HTTP 500".into()));
        let err = transport.send("<ENVELOPE/>").unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));
    }
}
