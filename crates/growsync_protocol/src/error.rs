//! Error types for the sync protocol.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while validating or decoding protocol data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Entity name contains characters outside `[a-zA-Z0-9_]` or has a bad length.
    #[error("invalid entity name: {0:?}")]
    InvalidEntityName(String),

    /// Entity name is well-formed but not part of the registry.
    #[error("unknown entity: {0}")]
    UnknownEntity(String),

    /// A row payload could not be decoded into the entity's schema.
    #[error("malformed {entity} row: {reason}")]
    MalformedRow {
        /// Entity table name.
        entity: &'static str,
        /// Decoder message.
        reason: String,
    },

    /// CBOR encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(String),
}

impl ProtocolError {
    /// Returns true if the error came from validating an entity name.
    pub fn is_entity_name_error(&self) -> bool {
        matches!(
            self,
            ProtocolError::InvalidEntityName(_) | ProtocolError::UnknownEntity(_)
        )
    }
}
