//! # growsync sync server
//!
//! Reference sync server for growsync.
//!
//! This crate provides:
//! - A server store with one live table and one tombstone table per entity
//! - The pull, push and conflict check endpoints
//! - Authentication (HMAC-SHA256 tokens)
//! - A tombstone retention job
//!
//! # Architecture
//!
//! The server is the clock of record. Every row written through push is
//! stamped with server time, so watermarks returned by pull and the
//! `updated_at` values compared by the push guard come from one clock.
//!
//! # Authentication
//!
//! Authentication is optional but recommended for production:
//!
//! ```rust,ignore
//! use growsync_server::{AuthConfig, Principal, ServerConfig, TokenValidator};
//!
//! let secret = b"my-secure-secret-32-bytes-long!".to_vec();
//! let config = ServerConfig::default().with_auth(secret.clone());
//!
//! let validator = TokenValidator::new(AuthConfig::new(secret));
//! let token = validator.create_token(&Principal::User(user_id))?;
//! ```
//!
//! # Protocol
//!
//! Clients run pull-then-push cycles:
//! 1. Pull every change since the client watermark
//! 2. Push local changes guarded by the same watermark
//! 3. Adopt the pull timestamp as the new watermark

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod auth;
mod clock;
mod config;
mod conflict;
mod error;
mod handler;
mod pull;
mod push;
mod retention;
mod server;
mod store;

pub use auth::{AuthConfig, Principal, TokenValidator};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use handler::{HandlerContext, RequestHandler};
pub use retention::RetentionJob;
pub use server::SyncServer;
pub use store::{ServerStore, TableStats, Tombstone};
