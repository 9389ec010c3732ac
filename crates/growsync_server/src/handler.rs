//! Request handlers for sync endpoints.

use crate::auth::{AuthConfig, Principal, TokenValidator};
use crate::config::ServerConfig;
use crate::conflict::check_conflict;
use crate::error::{ServerError, ServerResult};
use crate::pull::pull;
use crate::push::push;
use crate::store::ServerStore;
use growsync_protocol::{
    ConflictCheckRequest, ConflictCheckResponse, PullRequest, PullResponse, PushRequest,
    PushResponse, CONFLICT_PATH, PULL_PATH, PUSH_PATH,
};
use std::sync::Arc;
use uuid::Uuid;

/// Context for request handling.
pub struct HandlerContext {
    /// Server configuration.
    pub config: ServerConfig,
    /// Server store (shared across all handlers).
    pub store: Arc<ServerStore>,
    validator: Option<TokenValidator>,
}

impl HandlerContext {
    /// Creates a new handler context.
    pub fn new(config: ServerConfig, store: Arc<ServerStore>) -> Self {
        let validator = config.auth_secret.as_ref().map(|secret| {
            TokenValidator::new(AuthConfig::new(secret.clone()).with_expiry(config.token_expiry))
        });
        Self {
            config,
            store,
            validator,
        }
    }

    /// Resolves the caller of a request.
    ///
    /// Without authentication the caller is whoever the request claims to
    /// be; a request that claims no user acts as the service.
    pub fn authenticate(
        &self,
        token: Option<&[u8]>,
        claimed_user: Option<Uuid>,
    ) -> ServerResult<Principal> {
        if !self.config.require_auth {
            return Ok(claimed_user.map_or(Principal::Service, Principal::User));
        }
        let validator = self.validator.as_ref().ok_or_else(|| {
            ServerError::Internal("authentication required but no secret configured".into())
        })?;
        let token =
            token.ok_or_else(|| ServerError::AuthenticationFailed("missing token".into()))?;
        validator.validate_token(token)
    }
}

/// Handler for sync requests.
pub struct RequestHandler {
    context: Arc<HandlerContext>,
}

impl RequestHandler {
    /// Creates a new request handler.
    pub fn new(context: Arc<HandlerContext>) -> Self {
        Self { context }
    }

    /// Handles a pull request.
    pub fn handle_pull(
        &self,
        token: Option<&[u8]>,
        request: &PullRequest,
    ) -> ServerResult<PullResponse> {
        let principal = self.context.authenticate(token, Some(request.user_id))?;
        pull(&self.context.store, &self.context.config, &principal, request)
    }

    /// Handles a push request.
    pub fn handle_push(
        &self,
        token: Option<&[u8]>,
        request: &PushRequest,
    ) -> ServerResult<PushResponse> {
        let principal = self.context.authenticate(token, Some(request.user_id))?;
        push(&self.context.store, &self.context.config, &principal, request)
    }

    /// Handles a conflict check request.
    pub fn handle_conflict_check(
        &self,
        token: Option<&[u8]>,
        request: &ConflictCheckRequest,
    ) -> ServerResult<ConflictCheckResponse> {
        let principal = self.context.authenticate(token, request.user_id)?;
        check_conflict(&self.context.store, &principal, request)
    }

    /// Decodes a CBOR request body, dispatches it by path and encodes the reply.
    pub fn handle_request(
        &self,
        path: &str,
        token: Option<&[u8]>,
        body: &[u8],
    ) -> ServerResult<Vec<u8>> {
        let encoded = match path {
            PULL_PATH => self.handle_pull(token, &PullRequest::decode(body)?)?.encode(),
            PUSH_PATH => self.handle_push(token, &PushRequest::decode(body)?)?.encode(),
            CONFLICT_PATH => self
                .handle_conflict_check(token, &ConflictCheckRequest::decode(body)?)?
                .encode(),
            other => return Err(ServerError::NotFound(other.to_string())),
        };
        encoded.map_err(|e| ServerError::Internal(e.to_string()))
    }
}
