//! Error types for the sync server.

use growsync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the sync server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Entity name or payload failed validation.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Invalid request format.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Authentication failed.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Authorization failed.
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    /// Unknown endpoint.
    #[error("no such endpoint: {0}")]
    NotFound(String),

    /// Snapshot could not be read or written.
    #[error("snapshot error: {0}")]
    Snapshot(String),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// Returns true if this is a client error (4xx).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ServerError::Validation(_)
                | ServerError::InvalidRequest(_)
                | ServerError::AuthenticationFailed(_)
                | ServerError::NotAuthorized(_)
                | ServerError::NotFound(_)
        )
    }

    /// Returns true if this is a server error (5xx).
    pub fn is_server_error(&self) -> bool {
        matches!(
            self,
            ServerError::Snapshot(_) | ServerError::Internal(_) | ServerError::Io(_)
        )
    }

    /// Returns the HTTP status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            ServerError::Validation(_) | ServerError::InvalidRequest(_) => 400,
            ServerError::AuthenticationFailed(_) => 401,
            ServerError::NotAuthorized(_) => 403,
            ServerError::NotFound(_) => 404,
            ServerError::Snapshot(_) | ServerError::Internal(_) | ServerError::Io(_) => 500,
        }
    }
}

impl From<ProtocolError> for ServerError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Codec(msg) => ServerError::InvalidRequest(msg),
            other => ServerError::Validation(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification() {
        assert!(ServerError::Validation("bad".into()).is_client_error());
        assert!(ServerError::Internal("oops".into()).is_server_error());
        assert!(!ServerError::InvalidRequest("bad".into()).is_server_error());
    }

    #[test]
    fn status_codes() {
        assert_eq!(ServerError::Validation("x".into()).status_code(), 400);
        assert_eq!(ServerError::AuthenticationFailed("x".into()).status_code(), 401);
        assert_eq!(ServerError::NotAuthorized("x".into()).status_code(), 403);
        assert_eq!(ServerError::Internal("x".into()).status_code(), 500);
    }

    #[test]
    fn protocol_errors_map_to_validation() {
        let err: ServerError = ProtocolError::InvalidEntityName("a;b".into()).into();
        assert!(matches!(err, ServerError::Validation(_)));

        let err: ServerError = ProtocolError::Codec("eof".into()).into();
        assert!(matches!(err, ServerError::InvalidRequest(_)));
    }
}
