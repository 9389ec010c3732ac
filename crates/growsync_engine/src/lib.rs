//! # growsync sync engine
//!
//! Client sync driver for growsync.
//!
//! This crate provides:
//! - Sync state machine (idle → pulling → pushing → synced)
//! - Watermark management
//! - The local replica contract and an in-memory/file-backed replica
//! - Retry with exponential backoff
//! - HTTP transport abstraction
//! - A background scheduler owned by the host application
//!
//! ## Architecture
//!
//! One cycle is pull, merge, collect, push, acknowledge:
//! 1. Pull server changes since the stored watermark
//! 2. Merge them into the replica in one transaction
//! 3. Collect locally dirty rows
//! 4. Push them guarded by the *pre-pull* watermark
//! 5. Clear the pushed dirty flags and adopt the pull timestamp
//!
//! ## Key Invariants
//!
//! - At most one cycle runs per engine
//! - The watermark never regresses and only moves after a successful push
//! - A failed cycle leaves dirty flags and watermark untouched
//! - Push is idempotent, so re-pushing after a lost response is harmless

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod http;
mod replica;
mod scheduler;
mod state;
mod transport;

pub use config::{RetryConfig, SyncConfig, SyncOptions, DEFAULT_SYNC_INTERVAL};
pub use error::{ReplicaError, ReplicaResult, SyncError, SyncResult};
pub use http::{
    CborDecode, CborEncode, HttpClient, HttpResponse, HttpTransport, LoopbackClient,
    LoopbackServer,
};
pub use replica::{ApplyStats, MemoryReplica, PendingChanges, ReplicaStore, RowStatus};
pub use scheduler::{SyncScheduler, SyncStatus};
pub use state::{SyncCycleResult, SyncEngine, SyncState, SyncStats};
pub use transport::{MockTransport, SyncTransport};
