//! In-process transport.
//!
//! Calls the server's typed handlers directly, skipping the CBOR routing
//! that [`growsync_engine::HttpTransport`] goes through. Server errors are
//! mapped by status code the same way the HTTP transport maps them.

use growsync_engine::{HttpResponse, LoopbackServer, SyncError, SyncResult, SyncTransport};
use growsync_protocol::{
    ConflictCheckRequest, ConflictCheckResponse, PullRequest, PullResponse, PushRequest,
    PushResponse,
};
use growsync_server::{ServerError, SyncServer};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// A transport wired straight into a [`SyncServer`].
pub struct InProcessTransport {
    server: Arc<SyncServer>,
    token: Option<Vec<u8>>,
    online: AtomicBool,
    requests: AtomicUsize,
}

impl InProcessTransport {
    /// Creates a transport to `server`.
    pub fn new(server: Arc<SyncServer>) -> Self {
        Self {
            server,
            token: None,
            online: AtomicBool::new(true),
            requests: AtomicUsize::new(0),
        }
    }

    /// Sends `token` with every request.
    pub fn with_token(mut self, token: Vec<u8>) -> Self {
        self.token = Some(token);
        self
    }

    /// Simulates losing or regaining the network.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Returns the number of requests that reached the server.
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Returns the server.
    pub fn server(&self) -> &Arc<SyncServer> {
        &self.server
    }

    fn call<T>(
        &self,
        f: impl FnOnce(&SyncServer, Option<&[u8]>) -> Result<T, ServerError>,
    ) -> SyncResult<T> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        self.requests.fetch_add(1, Ordering::SeqCst);
        f(&self.server, self.token.as_deref()).map_err(server_error)
    }
}

/// Maps a server error onto the error the HTTP transport would report.
pub fn server_error(err: ServerError) -> SyncError {
    let message = err.to_string();
    match err.status_code() {
        401 | 403 => SyncError::Unauthorized(message),
        400 | 404 => SyncError::Rejected(message),
        500..=599 => SyncError::ServerError(message),
        status => SyncError::transport_fatal(format!("HTTP {status}: {message}")),
    }
}

impl SyncTransport for InProcessTransport {
    fn pull(&self, request: &PullRequest) -> SyncResult<PullResponse> {
        self.call(|server, token| server.handle_pull(token, request))
    }

    fn push(&self, request: &PushRequest) -> SyncResult<PushResponse> {
        self.call(|server, token| server.handle_push(token, request))
    }

    fn check_conflict(&self, request: &ConflictCheckRequest) -> SyncResult<ConflictCheckResponse> {
        self.call(|server, token| server.handle_conflict_check(token, request))
    }

    fn is_connected(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn close(&self) -> SyncResult<()> {
        self.set_online(false);
        Ok(())
    }
}

/// Routes loopback HTTP requests into a shared server.
///
/// Use with [`growsync_engine::LoopbackClient`] to exercise the wire format.
pub struct WireServer(pub Arc<SyncServer>);

impl LoopbackServer for WireServer {
    fn handle_post(&self, path: &str, token: Option<&[u8]>, body: &[u8]) -> HttpResponse {
        let (status, body) = self.0.handle_post(path, token, body);
        HttpResponse::new(status, body)
    }
}
