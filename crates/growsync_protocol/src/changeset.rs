//! Changesets: the unit of transfer in both sync directions.

use crate::entity::EntityKind;
use crate::error::{ProtocolError, ProtocolResult};
use crate::row::Record;
use ciborium::Value;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Created, updated and deleted rows of one entity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityChanges {
    /// Rows the receiver has never seen.
    pub created: Vec<Record>,
    /// Rows the receiver has seen an older version of.
    pub updated: Vec<Record>,
    /// Ids of deleted rows.
    pub deleted: Vec<Uuid>,
}

impl EntityChanges {
    /// Returns true if all three buckets are empty.
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    /// Returns the number of entries across all buckets.
    pub fn len(&self) -> usize {
        self.created.len() + self.updated.len() + self.deleted.len()
    }

    /// Returns ids that appear in more than one bucket (or twice in one).
    pub fn duplicate_ids(&self) -> Vec<Uuid> {
        let mut seen = BTreeSet::new();
        let mut duplicates = BTreeSet::new();
        let ids = self
            .created
            .iter()
            .chain(self.updated.iter())
            .map(Record::id)
            .chain(self.deleted.iter().copied());
        for id in ids {
            if !seen.insert(id) {
                duplicates.insert(id);
            }
        }
        duplicates.into_iter().collect()
    }
}

/// How deleted ids are written on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletedRef {
    /// A bare id (pull responses).
    Bare,
    /// An `{id}` object (push requests).
    Object,
}

/// A typed changeset keyed by entity.
///
/// Iteration follows registry order, so processing order across entities
/// is stable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Changeset {
    entities: BTreeMap<EntityKind, EntityChanges>,
}

impl Changeset {
    /// Creates an empty changeset.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the changes of one entity, creating the entry if needed.
    pub fn entry(&mut self, kind: EntityKind) -> &mut EntityChanges {
        self.entities.entry(kind).or_default()
    }

    /// Returns the changes of one entity.
    pub fn get(&self, kind: EntityKind) -> Option<&EntityChanges> {
        self.entities.get(&kind)
    }

    /// Iterates over entities in registry order.
    pub fn iter(&self) -> impl Iterator<Item = (EntityKind, &EntityChanges)> {
        self.entities.iter().map(|(kind, changes)| (*kind, changes))
    }

    /// Returns the entities present in the changeset.
    pub fn kinds(&self) -> impl Iterator<Item = EntityKind> + '_ {
        self.entities.keys().copied()
    }

    /// Adds a row to the `created` bucket of its entity.
    pub fn push_created(&mut self, record: Record) {
        self.entry(record.kind()).created.push(record);
    }

    /// Adds a row to the `updated` bucket of its entity.
    pub fn push_updated(&mut self, record: Record) {
        self.entry(record.kind()).updated.push(record);
    }

    /// Adds an id to the `deleted` bucket of `kind`.
    pub fn push_deleted(&mut self, kind: EntityKind, id: Uuid) {
        self.entry(kind).deleted.push(id);
    }

    /// Returns true if no entity carries any change.
    pub fn is_empty(&self) -> bool {
        self.entities.values().all(EntityChanges::is_empty)
    }

    /// Returns the total number of entries.
    pub fn len(&self) -> usize {
        self.entities.values().map(EntityChanges::len).sum()
    }

    /// Returns `(entity, id)` pairs that appear in more than one bucket.
    pub fn bucket_overlaps(&self) -> Vec<(EntityKind, Uuid)> {
        self.iter()
            .flat_map(|(kind, changes)| {
                changes
                    .duplicate_ids()
                    .into_iter()
                    .map(move |id| (kind, id))
            })
            .collect()
    }

    /// Converts to the wire form.
    pub fn to_raw(&self, deleted_form: DeletedRef) -> ProtocolResult<RawChangeset> {
        let mut raw = BTreeMap::new();
        for (kind, changes) in self.iter() {
            let entry = RawEntityChanges {
                created: encode_rows(&changes.created)?,
                updated: encode_rows(&changes.updated)?,
                deleted: changes
                    .deleted
                    .iter()
                    .map(|id| encode_deleted(*id, deleted_form))
                    .collect::<ProtocolResult<_>>()?,
            };
            raw.insert(kind.table_name().to_string(), entry);
        }
        Ok(RawChangeset(raw))
    }
}

fn encode_rows(rows: &[Record]) -> ProtocolResult<Vec<Value>> {
    rows.iter().map(Record::to_value).collect()
}

fn encode_deleted(id: Uuid, form: DeletedRef) -> ProtocolResult<Value> {
    let id_value = Value::serialized(&id).map_err(|e| ProtocolError::Codec(e.to_string()))?;
    Ok(match form {
        DeletedRef::Bare => id_value,
        DeletedRef::Object => Value::Map(vec![(Value::Text("id".into()), id_value)]),
    })
}

/// Extracts the id of one raw `deleted` entry (bare id or `{id}` object).
pub(crate) fn decode_deleted(kind: EntityKind, value: &Value) -> ProtocolResult<Uuid> {
    let id_value = match value {
        Value::Map(pairs) => pairs
            .iter()
            .find(|(key, _)| key.as_text() == Some("id"))
            .map(|(_, v)| v)
            .ok_or_else(|| ProtocolError::MalformedRow {
                entity: kind.table_name(),
                reason: "deleted entry without id".into(),
            })?,
        other => other,
    };
    id_value
        .deserialized::<Uuid>()
        .map_err(|e| ProtocolError::MalformedRow {
            entity: kind.table_name(),
            reason: format!("bad deleted id: {e}"),
        })
}

impl Serialize for Changeset {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_raw(DeletedRef::Bare)
            .map_err(serde::ser::Error::custom)?
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Changeset {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        RawChangeset::deserialize(deserializer)?
            .into_changeset()
            .map_err(serde::de::Error::custom)
    }
}

/// Raw changes of one entity as they travel on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawEntityChanges {
    /// Raw created rows.
    #[serde(default)]
    pub created: Vec<Value>,
    /// Raw updated rows.
    #[serde(default)]
    pub updated: Vec<Value>,
    /// Raw deleted entries.
    #[serde(default)]
    pub deleted: Vec<Value>,
}

impl RawEntityChanges {
    /// Decodes every entry of every bucket; each entry succeeds or fails alone.
    pub fn decode(&self, kind: EntityKind) -> DecodedEntityChanges {
        DecodedEntityChanges {
            created: self
                .created
                .iter()
                .map(|v| Record::from_value(kind, v).and_then(|r| check_kind(kind, r)))
                .collect(),
            updated: self
                .updated
                .iter()
                .map(|v| Record::from_value(kind, v).and_then(|r| check_kind(kind, r)))
                .collect(),
            deleted: self
                .deleted
                .iter()
                .map(|v| decode_deleted(kind, v))
                .collect(),
        }
    }
}

fn check_kind(kind: EntityKind, record: Record) -> ProtocolResult<Record> {
    if record.kind() == kind {
        Ok(record)
    } else {
        Err(ProtocolError::MalformedRow {
            entity: kind.table_name(),
            reason: format!("row decoded as {}", record.kind()),
        })
    }
}

/// Per-entry decode results of one entity.
#[derive(Debug, Clone)]
pub struct DecodedEntityChanges {
    /// Created rows.
    pub created: Vec<ProtocolResult<Record>>,
    /// Updated rows.
    pub updated: Vec<ProtocolResult<Record>>,
    /// Deleted ids.
    pub deleted: Vec<ProtocolResult<Uuid>>,
}

/// Wire form of a changeset, keyed by untrusted entity name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawChangeset(pub BTreeMap<String, RawEntityChanges>);

impl RawChangeset {
    /// Validates every entity name.
    ///
    /// Fails on the first invalid or unknown name; nothing is decoded in
    /// that case.
    pub fn validated(&self) -> ProtocolResult<Vec<(EntityKind, &RawEntityChanges)>> {
        let mut entities = self
            .0
            .iter()
            .map(|(name, changes)| EntityKind::from_name(name).map(|kind| (kind, changes)))
            .collect::<ProtocolResult<Vec<_>>>()?;
        entities.sort_by_key(|(kind, _)| *kind);
        Ok(entities)
    }

    /// Decodes into a typed changeset.
    ///
    /// Entity names the registry does not know are skipped so that newer
    /// servers can add entities; any malformed row is an error.
    pub fn into_changeset(self) -> ProtocolResult<Changeset> {
        let mut changeset = Changeset::new();
        for (name, raw) in &self.0 {
            let kind = match EntityKind::from_name(name) {
                Ok(kind) => kind,
                Err(_) => continue,
            };
            let decoded = raw.decode(kind);
            let entry = changeset.entry(kind);
            for record in decoded.created {
                entry.created.push(record?);
            }
            for record in decoded.updated {
                entry.updated.push(record?);
            }
            for id in decoded.deleted {
                entry.deleted.push(id?);
            }
        }
        Ok(changeset)
    }

    /// Returns true if no entity is present.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
