//! HTTP transport implementation.
//!
//! This module provides an HTTP-based transport for the sync engine.
//! The actual HTTP client is abstracted via a trait to allow different
//! implementations (reqwest, hyper, etc.).

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::transport::SyncTransport;
use growsync_protocol::{
    ConflictCheckRequest, ConflictCheckResponse, ErrorBody, PullRequest, PullResponse,
    PushRequest, PushResponse, CONFLICT_PATH, PULL_PATH, PUSH_PATH,
};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

/// Status and body of an HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Creates a new response.
    pub fn new(status: u16, body: Vec<u8>) -> Self {
        Self { status, body }
    }

    /// Creates a 200 response.
    pub fn ok(body: Vec<u8>) -> Self {
        Self::new(200, body)
    }
}

/// HTTP client abstraction.
///
/// Implement this trait to provide the actual HTTP transport.
/// This allows using different HTTP libraries (reqwest, hyper, ureq, etc.).
/// An `Err` means the request never produced a response.
pub trait HttpClient: Send + Sync {
    /// Sends a POST request with an optional bearer token.
    fn post(&self, url: &str, token: Option<&[u8]>, body: Vec<u8>) -> Result<HttpResponse, String>;

    /// Checks if the client is connected/healthy.
    fn is_healthy(&self) -> bool;
}

/// HTTP-based sync transport.
///
/// Uses CBOR encoding for request/response bodies.
pub struct HttpTransport<C: HttpClient> {
    /// Base URL of the sync server (e.g., "https://sync.example.com").
    base_url: String,
    /// HTTP client implementation.
    client: C,
    /// Token sent with every request.
    token: Option<Vec<u8>>,
    /// Cleared by [`SyncTransport::close`].
    connected: AtomicBool,
    /// Last error message.
    last_error: RwLock<Option<String>>,
}

impl<C: HttpClient> HttpTransport<C> {
    /// Creates a new HTTP transport.
    pub fn new(base_url: impl Into<String>, client: C) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            token: None,
            connected: AtomicBool::new(true),
            last_error: RwLock::new(None),
        }
    }

    /// Creates a transport for the server and token of `config`.
    pub fn from_config(config: &SyncConfig, client: C) -> Self {
        let transport = Self::new(config.server_url.clone(), client);
        match &config.auth_token {
            Some(token) => transport.with_token(token.clone()),
            None => transport,
        }
    }

    /// Sets the token sent with every request.
    pub fn with_token(mut self, token: Vec<u8>) -> Self {
        self.token = Some(token);
        self
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the HTTP client.
    pub fn client(&self) -> &C {
        &self.client
    }

    /// Returns the last error message.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    fn set_error(&self, err: &str) {
        *self.last_error.write() = Some(err.to_string());
    }

    fn clear_error(&self) {
        *self.last_error.write() = None;
    }

    fn post_cbor<Req, Res>(&self, endpoint: &str, request: &Req) -> SyncResult<Res>
    where
        Req: CborEncode,
        Res: CborDecode,
    {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }

        let body = request
            .encode_cbor()
            .map_err(|e| SyncError::Protocol(format!("Failed to encode request: {}", e)))?;

        let url = format!("{}{}", self.base_url, endpoint);
        let response = self
            .client
            .post(&url, self.token.as_deref(), body)
            .map_err(|e| {
                self.set_error(&e);
                tracing::debug!(url = %url, error = %e, "request failed");
                SyncError::transport_retryable(e)
            })?;

        if response.status != 200 {
            let err = status_error(response.status, &response.body);
            self.set_error(&err.to_string());
            return Err(err);
        }

        self.clear_error();

        Res::decode_cbor(&response.body)
            .map_err(|e| SyncError::Protocol(format!("Failed to decode response: {}", e)))
    }
}

/// Maps a non-200 status to the matching error.
fn status_error(status: u16, body: &[u8]) -> SyncError {
    let message = ErrorBody::decode(body)
        .map(|b| b.error)
        .unwrap_or_else(|_| format!("HTTP {}", status));
    match status {
        401 | 403 => SyncError::Unauthorized(message),
        400 | 404 => SyncError::Rejected(message),
        408 | 429 => SyncError::transport_retryable(message),
        500..=599 => SyncError::ServerError(message),
        _ => SyncError::transport_fatal(format!("HTTP {}: {}", status, message)),
    }
}

impl<C: HttpClient> SyncTransport for HttpTransport<C> {
    fn pull(&self, request: &PullRequest) -> SyncResult<PullResponse> {
        self.post_cbor(PULL_PATH, request)
    }

    fn push(&self, request: &PushRequest) -> SyncResult<PushResponse> {
        self.post_cbor(PUSH_PATH, request)
    }

    fn check_conflict(&self, request: &ConflictCheckRequest) -> SyncResult<ConflictCheckResponse> {
        self.post_cbor(CONFLICT_PATH, request)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.client.is_healthy()
    }

    fn close(&self) -> SyncResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Trait for CBOR encoding.
pub trait CborEncode {
    /// Encodes self to CBOR bytes.
    fn encode_cbor(&self) -> Result<Vec<u8>, String>;
}

/// Trait for CBOR decoding.
pub trait CborDecode: Sized {
    /// Decodes self from CBOR bytes.
    fn decode_cbor(bytes: &[u8]) -> Result<Self, String>;
}

macro_rules! cbor_encode {
    ($($message:ty),*) => {
        $(
            impl CborEncode for $message {
                fn encode_cbor(&self) -> Result<Vec<u8>, String> {
                    self.encode().map_err(|e| e.to_string())
                }
            }
        )*
    };
}

macro_rules! cbor_decode {
    ($($message:ty),*) => {
        $(
            impl CborDecode for $message {
                fn decode_cbor(bytes: &[u8]) -> Result<Self, String> {
                    Self::decode(bytes).map_err(|e| e.to_string())
                }
            }
        )*
    };
}

cbor_encode!(PullRequest, PushRequest, ConflictCheckRequest);
cbor_decode!(PullResponse, PushResponse, ConflictCheckResponse);

/// A loopback HTTP client that routes requests directly to a sync server.
///
/// Useful for testing without actual network overhead.
pub struct LoopbackClient<S: LoopbackServer> {
    server: S,
    healthy: AtomicBool,
}

impl<S: LoopbackServer + Send + Sync> LoopbackClient<S> {
    /// Creates a new loopback client connected to the given server.
    pub fn new(server: S) -> Self {
        Self {
            server,
            healthy: AtomicBool::new(true),
        }
    }

    /// Simulates losing or regaining the network.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Returns the wrapped server.
    pub fn server(&self) -> &S {
        &self.server
    }
}

/// Trait for servers that can handle loopback requests.
pub trait LoopbackServer {
    /// Handles a POST request and returns the response.
    fn handle_post(&self, path: &str, token: Option<&[u8]>, body: &[u8]) -> HttpResponse;
}

impl<S: LoopbackServer + Send + Sync> HttpClient for LoopbackClient<S> {
    fn post(&self, url: &str, token: Option<&[u8]>, body: Vec<u8>) -> Result<HttpResponse, String> {
        if !self.is_healthy() {
            return Err("network unreachable".into());
        }
        let path = url.find("/sync/").map(|i| &url[i..]).unwrap_or(url);

        Ok(self.server.handle_post(path, token, &body))
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use growsync_protocol::{Changeset, EntityKind, Timestamp};
    use growsync_server::{ServerConfig, SyncServer};
    use std::sync::Arc;
    use uuid::Uuid;

    struct TestClient {
        response: RwLock<Option<HttpResponse>>,
        urls: RwLock<Vec<String>>,
        tokens: RwLock<Vec<Option<Vec<u8>>>>,
        healthy: AtomicBool,
    }

    impl TestClient {
        fn new() -> Self {
            Self {
                response: RwLock::new(None),
                urls: RwLock::new(Vec::new()),
                tokens: RwLock::new(Vec::new()),
                healthy: AtomicBool::new(true),
            }
        }

        fn set_response(&self, resp: HttpResponse) {
            *self.response.write() = Some(resp);
        }

        fn set_healthy(&self, healthy: bool) {
            self.healthy.store(healthy, Ordering::SeqCst);
        }
    }

    impl HttpClient for TestClient {
        fn post(
            &self,
            url: &str,
            token: Option<&[u8]>,
            _body: Vec<u8>,
        ) -> Result<HttpResponse, String> {
            self.urls.write().push(url.to_string());
            self.tokens.write().push(token.map(<[u8]>::to_vec));
            self.response
                .read()
                .clone()
                .ok_or_else(|| "No response set".into())
        }

        fn is_healthy(&self) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }
    }

    fn pull_request() -> PullRequest {
        PullRequest::new(Uuid::from_u128(1), Some(Timestamp::from_millis(5)))
    }

    fn error_response(status: u16, message: &str) -> HttpResponse {
        HttpResponse::new(status, ErrorBody::new(message).encode().unwrap())
    }

    #[test]
    fn transport_creation() {
        let client = TestClient::new();
        let transport = HttpTransport::new("https://sync.example.com/", client);
        assert_eq!(transport.base_url(), "https://sync.example.com");
        assert!(transport.is_connected());
    }

    #[test]
    fn transport_disconnect() {
        let client = TestClient::new();
        let transport = HttpTransport::new("https://sync.example.com", client);
        transport.close().unwrap();
        assert!(!transport.is_connected());

        let result = transport.pull(&pull_request());
        assert!(matches!(result, Err(SyncError::NotConnected)));
    }

    #[test]
    fn transport_unhealthy_client() {
        let client = TestClient::new();
        client.set_healthy(false);
        let transport = HttpTransport::new("https://sync.example.com", client);
        assert!(!transport.is_connected());
    }

    #[test]
    fn transport_pull_sends_token_to_path() {
        let client = TestClient::new();
        let response = PullResponse::new(Changeset::new(), Timestamp::from_millis(42));
        client.set_response(HttpResponse::ok(response.encode().unwrap()));

        let config = SyncConfig::new(Uuid::from_u128(1), Uuid::from_u128(2), "https://s.example")
            .with_auth_token(vec![9, 9, 9]);
        let transport = HttpTransport::from_config(&config, client);
        let result = transport.pull(&pull_request()).unwrap();

        assert_eq!(result.timestamp, Timestamp::from_millis(42));
        assert_eq!(
            transport.client.urls.read().as_slice(),
            ["https://s.example/sync/pull".to_string()]
        );
        assert_eq!(transport.client.tokens.read()[0], Some(vec![9, 9, 9]));
        assert!(transport.last_error().is_none());
    }

    #[test]
    fn transport_maps_status_codes() {
        let cases = [
            (401, "Unauthorized"),
            (403, "Unauthorized"),
            (400, "Rejected"),
            (404, "Rejected"),
            (429, "retryable"),
            (503, "ServerError"),
            (418, "fatal"),
        ];
        for (status, expected) in cases {
            let client = TestClient::new();
            client.set_response(error_response(status, "nope"));
            let transport = HttpTransport::new("https://s.example", client);

            let err = transport.pull(&pull_request()).unwrap_err();
            let matched = match (&err, expected) {
                (SyncError::Unauthorized(m), "Unauthorized") => m == "nope",
                (SyncError::Rejected(m), "Rejected") => m == "nope",
                (SyncError::ServerError(m), "ServerError") => m == "nope",
                (SyncError::Transport { retryable, .. }, "retryable") => *retryable,
                (SyncError::Transport { retryable, .. }, "fatal") => !*retryable,
                _ => false,
            };
            assert!(matched, "status {status} gave {err:?}");
            assert!(transport.last_error().is_some());
        }
    }

    #[test]
    fn transport_failure_is_retryable() {
        let client = TestClient::new();
        let transport = HttpTransport::new("https://s.example", client);

        let err = transport.pull(&pull_request()).unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(transport.last_error().as_deref(), Some("No response set"));
        // a failed request does not close the transport
        assert!(transport.is_connected());
    }

    #[test]
    fn transport_garbage_body_is_protocol_error() {
        let client = TestClient::new();
        client.set_response(HttpResponse::ok(vec![0xff, 0x00]));
        let transport = HttpTransport::new("https://s.example", client);

        let err = transport.pull(&pull_request()).unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));
    }

    struct Loopback(Arc<SyncServer>);

    impl LoopbackServer for Loopback {
        fn handle_post(&self, path: &str, token: Option<&[u8]>, body: &[u8]) -> HttpResponse {
            let (status, body) = self.0.handle_post(path, token, body);
            HttpResponse::new(status, body)
        }
    }

    #[test]
    fn loopback_round_trip() {
        let server = Arc::new(SyncServer::new(ServerConfig::default()));
        let client = LoopbackClient::new(Loopback(Arc::clone(&server)));
        let transport = HttpTransport::new("http://localhost:8080", client);

        let request = PullRequest::new(Uuid::from_u128(1), None).with_entities(&[EntityKind::Plants]);
        let response = transport.pull(&request).unwrap();
        assert!(response.changes.is_empty());

        transport.client.set_healthy(false);
        assert!(!transport.is_connected());
    }

    #[test]
    fn loopback_surfaces_server_refusal() {
        let config = ServerConfig::default().with_auth(b"secret-key".to_vec());
        let server = Arc::new(SyncServer::new(config));
        let client = LoopbackClient::new(Loopback(server));
        let transport = HttpTransport::new("http://localhost:8080", client);

        let err = transport.pull(&pull_request()).unwrap_err();
        assert!(matches!(err, SyncError::Unauthorized(_)));
    }
}
