//! Authentication support for the sync server.
//!
//! This module provides token-based authentication using HMAC-SHA256.
//! Tokens include a timestamp for expiration checking.
//!
//! ## Token Format
//!
//! Tokens are composed of:
//! - 16 bytes: user id (nil for service tokens)
//! - 1 byte: role (0 = user, 1 = service)
//! - 8 bytes: timestamp (Unix millis, big-endian)
//! - 32 bytes: HMAC-SHA256 signature
//!
//! Total: 57 bytes.

use crate::error::{ServerError, ServerResult};
use growsync_protocol::Timestamp;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Duration;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

const TOKEN_LEN: usize = 57;
const SIGNED_LEN: usize = 25;
const ROLE_USER: u8 = 0;
const ROLE_SERVICE: u8 = 1;

/// The authenticated caller of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Principal {
    /// An end user; may only touch rows they own.
    User(Uuid),
    /// An elevated backend caller; may act for any user.
    Service,
}

impl Principal {
    /// Returns true if this principal may read or write rows owned by `owner`.
    pub fn can_act_for(&self, owner: Uuid) -> bool {
        match self {
            Principal::User(user_id) => *user_id == owner,
            Principal::Service => true,
        }
    }

    /// Returns a short label for logs.
    pub fn label(&self) -> String {
        match self {
            Principal::User(user_id) => user_id.to_string(),
            Principal::Service => "service".to_string(),
        }
    }
}

/// Authentication configuration.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Secret key for HMAC.
    pub secret: Vec<u8>,
    /// Token expiration duration.
    pub token_expiry: Duration,
}

impl AuthConfig {
    /// Creates a new auth configuration.
    pub fn new(secret: Vec<u8>) -> Self {
        Self {
            secret,
            token_expiry: Duration::from_secs(24 * 60 * 60),
        }
    }

    /// Sets the token expiration duration.
    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.token_expiry = expiry;
        self
    }
}

/// Token validator for incoming requests.
#[derive(Clone)]
pub struct TokenValidator {
    config: AuthConfig,
}

impl TokenValidator {
    /// Creates a new token validator.
    pub fn new(config: AuthConfig) -> Self {
        Self { config }
    }

    /// Creates a token for `principal`, issued now.
    pub fn create_token(&self, principal: &Principal) -> ServerResult<Vec<u8>> {
        self.create_token_at(principal, Timestamp::now())
    }

    /// Creates a token for `principal` with an explicit issue time.
    pub fn create_token_at(
        &self,
        principal: &Principal,
        issued_at: Timestamp,
    ) -> ServerResult<Vec<u8>> {
        let (subject, role) = match principal {
            Principal::User(user_id) => (*user_id, ROLE_USER),
            Principal::Service => (Uuid::nil(), ROLE_SERVICE),
        };

        let mut token = Vec::with_capacity(TOKEN_LEN);
        token.extend_from_slice(subject.as_bytes());
        token.push(role);
        token.extend_from_slice(&issued_at.as_millis().to_be_bytes());

        let signature = self.mac(&token)?.finalize().into_bytes();
        token.extend_from_slice(&signature);
        Ok(token)
    }

    /// Validates a token and returns the principal it was issued to.
    pub fn validate_token(&self, token: &[u8]) -> ServerResult<Principal> {
        if token.len() != TOKEN_LEN {
            return Err(ServerError::AuthenticationFailed(
                "invalid token length".into(),
            ));
        }

        let (signed, signature) = token.split_at(SIGNED_LEN);
        self.mac(signed)?
            .verify_slice(signature)
            .map_err(|_| ServerError::AuthenticationFailed("invalid signature".into()))?;

        let subject = Uuid::from_slice(&signed[0..16])
            .map_err(|e| ServerError::AuthenticationFailed(e.to_string()))?;
        let issued_bytes: [u8; 8] = signed[17..25]
            .try_into()
            .map_err(|_| ServerError::AuthenticationFailed("invalid timestamp".into()))?;
        let issued_at = Timestamp::from_millis(i64::from_be_bytes(issued_bytes));

        if Timestamp::now() > issued_at.saturating_add(self.config.token_expiry) {
            return Err(ServerError::AuthenticationFailed("token expired".into()));
        }

        match signed[16] {
            ROLE_USER => Ok(Principal::User(subject)),
            ROLE_SERVICE => Ok(Principal::Service),
            other => Err(ServerError::AuthenticationFailed(format!(
                "unknown role {other}"
            ))),
        }
    }

    fn mac(&self, data: &[u8]) -> ServerResult<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.config.secret)
            .map_err(|e| ServerError::Internal(e.to_string()))?;
        mac.update(data);
        Ok(mac)
    }
}
