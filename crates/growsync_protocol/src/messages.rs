//! Protocol messages for sync.

use crate::changeset::{Changeset, DeletedRef, RawChangeset};
use crate::codec::{from_cbor, to_cbor};
use crate::entity::EntityKind;
use crate::error::ProtocolResult;
use crate::timestamp::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Path of the pull endpoint.
pub const PULL_PATH: &str = "/sync/pull";
/// Path of the push endpoint.
pub const PUSH_PATH: &str = "/sync/push";
/// Path of the conflict check endpoint.
pub const CONFLICT_PATH: &str = "/sync/conflict";

macro_rules! cbor_message {
    ($($message:ident),* $(,)?) => {
        $(
            impl $message {
                /// Encodes to CBOR.
                pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
                    to_cbor(self)
                }

                /// Decodes from CBOR.
                pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
                    from_cbor(bytes)
                }
            }
        )*
    };
}

cbor_message!(
    PullRequest,
    PullResponse,
    PushRequest,
    PushResponse,
    ConflictCheckRequest,
    ConflictCheckResponse,
    ErrorBody,
);

fn default_true() -> bool {
    true
}

/// Pull request from client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    /// Watermark of the last successful sync; `None` requests a full dump.
    #[serde(default)]
    pub last_pulled_at: Option<Timestamp>,
    /// The user whose rows are pulled.
    pub user_id: Uuid,
    /// Restricts the pull to these entity names.
    #[serde(default)]
    pub entities: Option<Vec<String>>,
    /// When false, media columns are blanked in the response.
    #[serde(default = "default_true")]
    pub include_media: bool,
    /// The pulling device. Incremental pulls leave out rows whose latest
    /// write came from this device.
    #[serde(default)]
    pub device_id: Option<Uuid>,
}

impl PullRequest {
    /// Creates a new pull request over all entities.
    pub fn new(user_id: Uuid, last_pulled_at: Option<Timestamp>) -> Self {
        Self {
            last_pulled_at,
            user_id,
            entities: None,
            include_media: true,
            device_id: None,
        }
    }

    /// Sets the pulling device.
    pub fn with_device(mut self, device_id: Uuid) -> Self {
        self.device_id = Some(device_id);
        self
    }

    /// Restricts the pull to the given entities.
    pub fn with_entities(mut self, kinds: &[EntityKind]) -> Self {
        self.entities = Some(kinds.iter().map(|k| k.table_name().to_string()).collect());
        self
    }

    /// Sets whether media columns are included.
    pub fn with_include_media(mut self, include_media: bool) -> Self {
        self.include_media = include_media;
        self
    }

    /// Returns true if this is a first sync (full dump).
    pub fn is_full_dump(&self) -> bool {
        self.last_pulled_at.is_none()
    }
}

/// Pull response from server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullResponse {
    /// Changes since the requested watermark.
    pub changes: Changeset,
    /// Server time the changes were read at; the client's next watermark.
    pub timestamp: Timestamp,
}

impl PullResponse {
    /// Creates a new pull response.
    pub fn new(changes: Changeset, timestamp: Timestamp) -> Self {
        Self { changes, timestamp }
    }
}

/// Push request from client.
///
/// The changeset stays in wire form so the server can validate entity
/// names before decoding any row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushRequest {
    /// Local changes to apply.
    pub changes: RawChangeset,
    /// Watermark the local changes were made against.
    #[serde(default)]
    pub last_pulled_at: Option<Timestamp>,
    /// The pushing user.
    pub user_id: Uuid,
    /// The pushing device.
    #[serde(default)]
    pub device_id: Option<Uuid>,
    /// Ids, by entity name, of pushed rows whose media columns the device
    /// never received. The server keeps its own media for them.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub media_omitted: BTreeMap<String, Vec<Uuid>>,
}

impl PushRequest {
    /// Creates a new push request from a typed changeset.
    pub fn new(
        changes: &Changeset,
        last_pulled_at: Option<Timestamp>,
        user_id: Uuid,
    ) -> ProtocolResult<Self> {
        Ok(Self {
            changes: changes.to_raw(DeletedRef::Object)?,
            last_pulled_at,
            user_id,
            device_id: None,
            media_omitted: BTreeMap::new(),
        })
    }

    /// Sets the pushing device.
    pub fn with_device(mut self, device_id: Uuid) -> Self {
        self.device_id = Some(device_id);
        self
    }

    /// Marks rows whose media columns the device never received.
    pub fn with_media_omitted(mut self, rows: &[(EntityKind, Uuid)]) -> Self {
        for (kind, id) in rows {
            self.media_omitted
                .entry(kind.table_name().to_string())
                .or_default()
                .push(*id);
        }
        self
    }

    /// Returns the rows marked by [`with_media_omitted`](Self::with_media_omitted).
    ///
    /// Fails on the first invalid or unknown entity name.
    pub fn media_omitted_rows(&self) -> ProtocolResult<BTreeSet<(EntityKind, Uuid)>> {
        let mut rows = BTreeSet::new();
        for (name, ids) in &self.media_omitted {
            let kind = EntityKind::from_name(name)?;
            rows.extend(ids.iter().map(|id| (kind, *id)));
        }
        Ok(rows)
    }

    /// Returns the number of raw entries across all entities.
    pub fn row_count(&self) -> usize {
        self.changes
            .0
            .values()
            .map(|c| c.created.len() + c.updated.len() + c.deleted.len())
            .sum()
    }
}

/// A row the server refused to apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowRejection {
    /// Entity name.
    pub entity: String,
    /// Row id, when it could be decoded.
    #[serde(default)]
    pub id: Option<Uuid>,
    /// Why the row was refused.
    pub reason: String,
}

/// Push response from server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushResponse {
    /// Whether the push was accepted.
    pub success: bool,
    /// Server time of the push.
    pub timestamp: Timestamp,
    /// Error message if not accepted.
    #[serde(default)]
    pub error: Option<String>,
    /// Rows written.
    #[serde(default)]
    pub applied: u32,
    /// Rows not written because the server held a newer version.
    #[serde(default)]
    pub skipped: u32,
    /// Rows refused individually.
    #[serde(default)]
    pub rejected: Vec<RowRejection>,
}

impl PushResponse {
    /// Creates a successful response.
    pub fn success(timestamp: Timestamp) -> Self {
        Self {
            success: true,
            timestamp,
            error: None,
            applied: 0,
            skipped: 0,
            rejected: Vec::new(),
        }
    }

    /// Creates an error response.
    pub fn error(timestamp: Timestamp, message: impl Into<String>) -> Self {
        Self {
            success: false,
            timestamp,
            error: Some(message.into()),
            applied: 0,
            skipped: 0,
            rejected: Vec::new(),
        }
    }
}

/// Outcome of a delete-vs-modify check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionAction {
    /// The row was modified after the watermark; the tombstone was dropped.
    KeepModified,
    /// The row was untouched since the watermark; it was deleted.
    ConfirmDeletion,
    /// Row and tombstone never coexisted.
    NoConflict,
    /// Only a tombstone exists.
    AlreadyDeleted,
    /// Neither row nor tombstone exists.
    NotFound,
}

impl ResolutionAction {
    /// Returns the wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            ResolutionAction::KeepModified => "keep_modified",
            ResolutionAction::ConfirmDeletion => "confirm_deletion",
            ResolutionAction::NoConflict => "no_conflict",
            ResolutionAction::AlreadyDeleted => "already_deleted",
            ResolutionAction::NotFound => "not_found",
        }
    }
}

impl std::fmt::Display for ResolutionAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Conflict check request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictCheckRequest {
    /// Entity name.
    pub table_name: String,
    /// Row id.
    pub record_id: Uuid,
    /// Watermark the caller last synced at.
    pub last_pulled_at: Timestamp,
    /// The calling user, when the server runs without tokens.
    #[serde(default)]
    pub user_id: Option<Uuid>,
}

impl ConflictCheckRequest {
    /// Creates a new conflict check request.
    pub fn new(kind: EntityKind, record_id: Uuid, last_pulled_at: Timestamp) -> Self {
        Self {
            table_name: kind.table_name().to_string(),
            record_id,
            last_pulled_at,
            user_id: None,
        }
    }

    /// Sets the calling user.
    pub fn with_user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }
}

/// Conflict check response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictCheckResponse {
    /// Entity name.
    pub table_name: String,
    /// Row id.
    pub record_id: Uuid,
    /// What the server decided.
    pub resolution_action: ResolutionAction,
    /// Server time of the decision.
    pub resolved_at: Timestamp,
}

/// Body of a non-2xx response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Human-readable message.
    pub error: String,
}

impl ErrorBody {
    /// Creates a new error body.
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::PlantRow;

    #[test]
    fn pull_request_defaults() {
        let req = PullRequest::new(Uuid::from_u128(1), None);
        let decoded = PullRequest::decode(&req.encode().unwrap()).unwrap();

        assert!(decoded.is_full_dump());
        assert!(decoded.include_media);
        assert!(decoded.entities.is_none());
        assert!(decoded.device_id.is_none());
    }

    #[test]
    fn pull_request_with_filters() {
        let req = PullRequest::new(Uuid::from_u128(1), Some(Timestamp::from_millis(50)))
            .with_entities(&[EntityKind::Plants, EntityKind::Posts])
            .with_include_media(false);
        let decoded = PullRequest::decode(&req.encode().unwrap()).unwrap();

        assert_eq!(decoded.last_pulled_at, Some(Timestamp::from_millis(50)));
        assert_eq!(
            decoded.entities,
            Some(vec!["plants".to_string(), "posts".to_string()])
        );
        assert!(!decoded.include_media);
    }

    #[test]
    fn pull_response_with_changes() {
        let mut changes = Changeset::new();
        changes.push_created(
            PlantRow::new(Uuid::from_u128(1), Uuid::from_u128(9), "basil").into(),
        );
        changes.push_deleted(EntityKind::Plants, Uuid::from_u128(2));

        let resp = PullResponse::new(changes.clone(), Timestamp::from_millis(77));
        let decoded = PullResponse::decode(&resp.encode().unwrap()).unwrap();

        assert_eq!(decoded.changes, changes);
        assert_eq!(decoded.timestamp, Timestamp::from_millis(77));
    }

    #[test]
    fn push_request_carries_typed_changes() {
        let mut changes = Changeset::new();
        changes.push_updated(
            PlantRow::new(Uuid::from_u128(1), Uuid::from_u128(9), "basil").into(),
        );
        let req = PushRequest::new(&changes, Some(Timestamp::from_millis(10)), Uuid::from_u128(9))
            .unwrap();
        let decoded = PushRequest::decode(&req.encode().unwrap()).unwrap();

        assert_eq!(decoded.user_id, Uuid::from_u128(9));
        assert_eq!(decoded.row_count(), 1);
        assert_eq!(decoded.changes.into_changeset().unwrap(), changes);
        assert!(decoded.media_omitted.is_empty());
    }

    #[test]
    fn push_request_media_omitted() {
        let req = PushRequest::new(&Changeset::new(), None, Uuid::from_u128(9))
            .unwrap()
            .with_media_omitted(&[
                (EntityKind::Plants, Uuid::from_u128(1)),
                (EntityKind::Posts, Uuid::from_u128(2)),
                (EntityKind::Plants, Uuid::from_u128(3)),
            ]);
        let decoded = PushRequest::decode(&req.encode().unwrap()).unwrap();

        assert_eq!(decoded.media_omitted["plants"].len(), 2);
        let rows = decoded.media_omitted_rows().unwrap();
        assert!(rows.contains(&(EntityKind::Posts, Uuid::from_u128(2))));
        assert_eq!(rows.len(), 3);

        let mut bad = decoded;
        bad.media_omitted.insert("plants;--".into(), vec![Uuid::from_u128(4)]);
        assert!(bad.media_omitted_rows().is_err());
    }

    #[test]
    fn push_response_success() {
        let mut resp = PushResponse::success(Timestamp::from_millis(5));
        resp.applied = 3;
        resp.rejected.push(RowRejection {
            entity: "profiles".into(),
            id: Some(Uuid::from_u128(4)),
            reason: "entity has no tombstones".into(),
        });
        let decoded = PushResponse::decode(&resp.encode().unwrap()).unwrap();

        assert!(decoded.success);
        assert_eq!(decoded.applied, 3);
        assert_eq!(decoded.rejected.len(), 1);
    }

    #[test]
    fn push_response_error() {
        let resp = PushResponse::error(Timestamp::from_millis(5), "invalid entity name");
        let decoded = PushResponse::decode(&resp.encode().unwrap()).unwrap();

        assert!(!decoded.success);
        assert_eq!(decoded.error.as_deref(), Some("invalid entity name"));
    }

    #[test]
    fn conflict_check_roundtrip() {
        let req = ConflictCheckRequest::new(
            EntityKind::PlantTasks,
            Uuid::from_u128(3),
            Timestamp::from_millis(1000),
        );
        let decoded = ConflictCheckRequest::decode(&req.encode().unwrap()).unwrap();
        assert_eq!(decoded.table_name, "plant_tasks");

        let resp = ConflictCheckResponse {
            table_name: decoded.table_name,
            record_id: decoded.record_id,
            resolution_action: ResolutionAction::KeepModified,
            resolved_at: Timestamp::from_millis(1001),
        };
        let decoded = ConflictCheckResponse::decode(&resp.encode().unwrap()).unwrap();
        assert_eq!(decoded.resolution_action, ResolutionAction::KeepModified);
    }

    #[test]
    fn resolution_action_wire_names() {
        for action in [
            ResolutionAction::KeepModified,
            ResolutionAction::ConfirmDeletion,
            ResolutionAction::NoConflict,
            ResolutionAction::AlreadyDeleted,
            ResolutionAction::NotFound,
        ] {
            let value = ciborium::Value::serialized(&action).unwrap();
            assert_eq!(value.as_text(), Some(action.as_str()));
        }
    }
}
