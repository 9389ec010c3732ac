//! Transport layer abstraction for sync operations.

use crate::error::{SyncError, SyncResult};
use growsync_protocol::{
    ConflictCheckRequest, ConflictCheckResponse, PullRequest, PullResponse, PushRequest,
    PushResponse,
};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

type Hook = Box<dyn Fn() + Send + Sync>;

/// A sync transport handles network communication with the sync server.
///
/// This trait abstracts the network layer, allowing for different implementations
/// (HTTP, in-process, mock for testing, etc.).
pub trait SyncTransport: Send + Sync {
    /// Pulls changes from the server.
    fn pull(&self, request: &PullRequest) -> SyncResult<PullResponse>;

    /// Pushes changes to the server.
    fn push(&self, request: &PushRequest) -> SyncResult<PushResponse>;

    /// Asks the server to settle a delete-vs-modify conflict on one row.
    fn check_conflict(&self, request: &ConflictCheckRequest) -> SyncResult<ConflictCheckResponse>;

    /// Checks if the transport is connected.
    fn is_connected(&self) -> bool;

    /// Closes the transport connection.
    fn close(&self) -> SyncResult<()>;
}

/// A mock transport for testing.
///
/// Responses are canned; every request is recorded so tests can assert on
/// what the engine sent.
#[derive(Default)]
pub struct MockTransport {
    connected: AtomicBool,
    pull_response: Mutex<Option<PullResponse>>,
    push_response: Mutex<Option<PushResponse>>,
    conflict_response: Mutex<Option<ConflictCheckResponse>>,
    fail_next_pull: Mutex<Option<SyncError>>,
    fail_next_push: Mutex<Option<SyncError>>,
    pulls: Mutex<Vec<PullRequest>>,
    pushes: Mutex<Vec<PushRequest>>,
    on_pull: Mutex<Option<Hook>>,
    on_push: Mutex<Option<Hook>>,
}

impl fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockTransport")
            .field("connected", &self.connected)
            .field("pulls", &self.pulls.lock().len())
            .field("pushes", &self.pushes.lock().len())
            .finish_non_exhaustive()
    }
}

impl MockTransport {
    /// Creates a new mock transport.
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            ..Self::default()
        }
    }

    /// Sets the pull response.
    pub fn set_pull_response(&self, response: PullResponse) {
        *self.pull_response.lock() = Some(response);
    }

    /// Sets the push response.
    pub fn set_push_response(&self, response: PushResponse) {
        *self.push_response.lock() = Some(response);
    }

    /// Sets the conflict check response.
    pub fn set_conflict_response(&self, response: ConflictCheckResponse) {
        *self.conflict_response.lock() = Some(response);
    }

    /// Makes the next pull fail with `error`.
    pub fn fail_next_pull(&self, error: SyncError) {
        *self.fail_next_pull.lock() = Some(error);
    }

    /// Makes the next push fail with `error`.
    pub fn fail_next_push(&self, error: SyncError) {
        *self.fail_next_push.lock() = Some(error);
    }

    /// Runs `hook` while serving every later pull, before it answers.
    pub fn on_pull(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.on_pull.lock() = Some(Box::new(hook));
    }

    /// Runs `hook` while serving every later push, before it answers.
    pub fn on_push(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.on_push.lock() = Some(Box::new(hook));
    }

    /// Sets the connected state.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Returns the pull requests received so far.
    pub fn pull_requests(&self) -> Vec<PullRequest> {
        self.pulls.lock().clone()
    }

    /// Returns the push requests received so far.
    pub fn push_requests(&self) -> Vec<PushRequest> {
        self.pushes.lock().clone()
    }
}

impl SyncTransport for MockTransport {
    fn pull(&self, request: &PullRequest) -> SyncResult<PullResponse> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        self.pulls.lock().push(request.clone());
        if let Some(hook) = self.on_pull.lock().as_ref() {
            hook();
        }
        if let Some(err) = self.fail_next_pull.lock().take() {
            return Err(err);
        }
        self.pull_response
            .lock()
            .clone()
            .ok_or_else(|| SyncError::Protocol("No mock pull response set".into()))
    }

    fn push(&self, request: &PushRequest) -> SyncResult<PushResponse> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        self.pushes.lock().push(request.clone());
        if let Some(hook) = self.on_push.lock().as_ref() {
            hook();
        }
        if let Some(err) = self.fail_next_push.lock().take() {
            return Err(err);
        }
        self.push_response
            .lock()
            .clone()
            .ok_or_else(|| SyncError::Protocol("No mock push response set".into()))
    }

    fn check_conflict(&self, _request: &ConflictCheckRequest) -> SyncResult<ConflictCheckResponse> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        self.conflict_response
            .lock()
            .clone()
            .ok_or_else(|| SyncError::Protocol("No mock conflict response set".into()))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn close(&self) -> SyncResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use growsync_protocol::{Changeset, Timestamp};
    use uuid::Uuid;

    #[test]
    fn mock_transport_connection() {
        let transport = MockTransport::new();
        assert!(transport.is_connected());

        transport.set_connected(false);
        assert!(!transport.is_connected());

        transport.set_connected(true);
        transport.close().unwrap();
        assert!(!transport.is_connected());
    }

    #[test]
    fn mock_transport_not_connected_error() {
        let transport = MockTransport::new();
        transport.set_connected(false);

        let request = PullRequest::new(Uuid::from_u128(1), None);
        let result = transport.pull(&request);
        assert!(matches!(result, Err(SyncError::NotConnected)));
        assert!(transport.pull_requests().is_empty());
    }

    #[test]
    fn mock_transport_records_and_fails_once() {
        let transport = MockTransport::new();
        transport.set_pull_response(PullResponse::new(
            Changeset::new(),
            Timestamp::from_millis(10),
        ));
        transport.fail_next_pull(SyncError::Timeout);

        let request = PullRequest::new(Uuid::from_u128(1), Some(Timestamp::from_millis(5)));
        assert!(matches!(transport.pull(&request), Err(SyncError::Timeout)));

        let response = transport.pull(&request).unwrap();
        assert_eq!(response.timestamp, Timestamp::from_millis(10));
        assert_eq!(transport.pull_requests().len(), 2);
    }

    #[test]
    fn mock_transport_missing_response() {
        let transport = MockTransport::new();
        let request =
            PushRequest::new(&Changeset::new(), None, Uuid::from_u128(1)).unwrap();
        assert!(matches!(
            transport.push(&request),
            Err(SyncError::Protocol(_))
        ));
        assert_eq!(transport.push_requests().len(), 1);
    }
}
