//! # growsync protocol
//!
//! Sync protocol types and CBOR codecs for growsync.
//!
//! This crate provides:
//! - `Timestamp` for watermarks and row stamps
//! - `EntityKind` and the entity registry (the only way an entity name
//!   coming from a client is turned into something the server acts on)
//! - Typed rows (`Record`) for every synced entity
//! - `Changeset` and its wire form `RawChangeset`
//! - Protocol messages (Pull, Push, ConflictCheck)
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod changeset;
mod codec;
mod entity;
mod error;
mod messages;
mod row;
mod timestamp;

pub use changeset::{
    Changeset, DecodedEntityChanges, DeletedRef, EntityChanges, RawChangeset, RawEntityChanges,
};
pub use codec::{from_cbor, to_cbor};
pub use entity::{EntityKind, EntitySpec, ENTITY_REGISTRY};
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{
    ConflictCheckRequest, ConflictCheckResponse, ErrorBody, PullRequest, PullResponse,
    PushRequest, PushResponse, ResolutionAction, RowRejection, CONFLICT_PATH, PULL_PATH,
    PUSH_PATH,
};
pub use row::{
    DiaryEntryRow, GrowJournalRow, GrowLocationRow, JournalEntryRow, PlantRow, PlantTaskRow,
    PostCommentRow, PostLikeRow, PostRow, ProfileRow, Record,
};
pub use timestamp::Timestamp;
