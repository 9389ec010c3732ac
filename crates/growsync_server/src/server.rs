//! Main sync server.

use crate::config::ServerConfig;
use crate::error::ServerResult;
use crate::handler::{HandlerContext, RequestHandler};
use crate::retention::RetentionJob;
use crate::store::ServerStore;
use growsync_protocol::{
    ConflictCheckRequest, ConflictCheckResponse, ErrorBody, PullRequest, PullResponse,
    PushRequest, PushResponse,
};
use std::sync::Arc;

/// The sync server.
///
/// Handles pull, push and conflict check requests against one
/// [`ServerStore`]. Transport is left to the embedding application, which
/// forwards request bodies to [`SyncServer::handle_post`].
///
/// # Example
///
/// ```
/// use growsync_server::{ServerConfig, SyncServer};
///
/// let server = SyncServer::new(ServerConfig::default());
///
/// // In a real application, an HTTP route would call
/// // server.handle_post(path, token, body)
/// ```
pub struct SyncServer {
    handler: RequestHandler,
    context: Arc<HandlerContext>,
}

impl SyncServer {
    /// Creates a new sync server with an empty store.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_store(config, Arc::new(ServerStore::new()))
    }

    /// Creates a sync server over an existing store.
    pub fn with_store(config: ServerConfig, store: Arc<ServerStore>) -> Self {
        let context = Arc::new(HandlerContext::new(config, store));
        let handler = RequestHandler::new(Arc::clone(&context));

        Self { handler, context }
    }

    /// Handles a pull request.
    pub fn handle_pull(
        &self,
        token: Option<&[u8]>,
        request: &PullRequest,
    ) -> ServerResult<PullResponse> {
        self.handler.handle_pull(token, request)
    }

    /// Handles a push request.
    pub fn handle_push(
        &self,
        token: Option<&[u8]>,
        request: &PushRequest,
    ) -> ServerResult<PushResponse> {
        self.handler.handle_push(token, request)
    }

    /// Handles a conflict check request.
    pub fn handle_conflict_check(
        &self,
        token: Option<&[u8]>,
        request: &ConflictCheckRequest,
    ) -> ServerResult<ConflictCheckResponse> {
        self.handler.handle_conflict_check(token, request)
    }

    /// Handles a POST body and returns `(status, body)`.
    ///
    /// Errors are reported as a CBOR [`ErrorBody`] with the matching status.
    pub fn handle_post(&self, path: &str, token: Option<&[u8]>, body: &[u8]) -> (u16, Vec<u8>) {
        match self.handler.handle_request(path, token, body) {
            Ok(reply) => (200, reply),
            Err(e) => {
                if e.is_server_error() {
                    tracing::error!(path, error = %e, "request failed");
                } else {
                    tracing::debug!(path, error = %e, "request refused");
                }
                let body = ErrorBody::new(e.to_string()).encode().unwrap_or_default();
                (e.status_code(), body)
            }
        }
    }

    /// Returns the server store.
    pub fn store(&self) -> &Arc<ServerStore> {
        &self.context.store
    }

    /// Returns the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.context.config
    }

    /// Starts the tombstone retention job on the current tokio runtime.
    pub fn spawn_retention(&self) -> RetentionJob {
        RetentionJob::spawn(
            Arc::clone(&self.context.store),
            self.context.config.tombstone_retention,
            self.context.config.retention_interval,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use growsync_protocol::{Changeset, EntityKind, PlantRow, PULL_PATH, PUSH_PATH};
    use uuid::Uuid;

    const USER: Uuid = Uuid::from_u128(9);

    #[test]
    fn server_lifecycle() {
        let server = SyncServer::new(ServerConfig::default());
        assert!(server.store().stats().iter().all(|s| s.rows == 0));
        assert!(!server.config().require_auth);
    }

    #[test]
    fn full_sync_flow() {
        let server = SyncServer::new(ServerConfig::default());

        let response = server
            .handle_pull(None, &PullRequest::new(USER, None))
            .unwrap();
        assert!(response.changes.is_empty());
        let watermark = response.timestamp;

        let mut changes = Changeset::new();
        changes.push_created(PlantRow::new(Uuid::from_u128(1), USER, "basil").into());
        let push = PushRequest::new(&changes, Some(watermark), USER).unwrap();
        let response = server.handle_push(None, &push).unwrap();
        assert!(response.success);
        assert_eq!(response.applied, 1);

        let response = server
            .handle_pull(None, &PullRequest::new(USER, Some(watermark)))
            .unwrap();
        assert_eq!(response.changes.get(EntityKind::Plants).unwrap().created.len(), 1);
    }

    #[test]
    fn post_maps_errors_to_status() {
        let server = SyncServer::new(ServerConfig::default().with_auth(b"secret".to_vec()));
        let body = PullRequest::new(USER, None).encode().unwrap();

        let (status, reply) = server.handle_post(PULL_PATH, None, &body);
        assert_eq!(status, 401);
        assert!(ErrorBody::decode(&reply).unwrap().error.contains("missing token"));

        let (status, _) = server.handle_post(PUSH_PATH, None, b"\x01");
        assert_eq!(status, 400);
    }

    #[tokio::test]
    async fn retention_job_starts_and_stops() {
        let server = SyncServer::new(ServerConfig::default());
        let job = server.spawn_retention();
        job.shutdown().await;
    }
}
