//! Property-based test generators using proptest.
//!
//! Ids are drawn from a small pool so that generated pushes collide with
//! seeded rows, tombstones and each other often enough to matter.

use crate::fixtures::TEST_USER;
use growsync_protocol::{Changeset, EntityKind, PlantRow, PostRow, Record, Timestamp};
use growsync_server::{ServerStore, Tombstone};
use proptest::prelude::*;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Number of distinct row ids the generators draw from.
pub const ID_POOL: u128 = 12;

/// Entities the generators produce rows for.
pub const GENERATED_KINDS: [EntityKind; 2] = [EntityKind::Plants, EntityKind::Posts];

/// Strategy for row ids from the shared pool.
pub fn row_id_strategy() -> impl Strategy<Value = Uuid> {
    (1..=ID_POOL).prop_map(Uuid::from_u128)
}

/// Strategy for one of the generated entities.
pub fn kind_strategy() -> impl Strategy<Value = EntityKind> {
    prop::sample::select(GENERATED_KINDS.to_vec())
}

/// Strategy for short human-readable text.
pub fn text_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[A-Za-z][a-z ]{0,15}").expect("Invalid regex")
}

/// Strategy for an optional media location.
pub fn media_strategy() -> impl Strategy<Value = Option<String>> {
    prop::option::of((1u32..100).prop_map(|n| format!("https://cdn.growsync.test/{n}.jpg")))
}

/// Strategy for a row of `kind` with the given id, owned by [`TEST_USER`].
pub fn record_strategy(kind: EntityKind, id: Uuid) -> BoxedStrategy<Record> {
    match kind {
        EntityKind::Posts => (text_strategy(), media_strategy())
            .prop_map(move |(content, image_url)| {
                let mut row = PostRow::new(id, TEST_USER, content);
                row.image_url = image_url;
                Record::from(row)
            })
            .boxed(),
        _ => (text_strategy(), prop::option::of(text_strategy()), media_strategy())
            .prop_map(move |(name, notes, image_url)| {
                let mut row = PlantRow::new(id, TEST_USER, name);
                row.notes = notes;
                row.image_url = image_url;
                Record::from(row)
            })
            .boxed(),
    }
}

/// Strategy for any generated row.
pub fn any_record_strategy() -> impl Strategy<Value = Record> {
    (kind_strategy(), row_id_strategy()).prop_flat_map(|(kind, id)| record_strategy(kind, id))
}

/// One entry of a push changeset.
#[derive(Debug, Clone)]
pub enum ChangeOp {
    /// Goes into `created`.
    Create(Record),
    /// Goes into `updated`.
    Update(Record),
    /// Goes into `deleted`.
    Delete(EntityKind, Uuid),
}

impl ChangeOp {
    fn key(&self) -> (EntityKind, Uuid) {
        match self {
            ChangeOp::Create(r) | ChangeOp::Update(r) => (r.kind(), r.id()),
            ChangeOp::Delete(kind, id) => (*kind, *id),
        }
    }
}

/// Strategy for one change entry.
pub fn change_op_strategy() -> impl Strategy<Value = ChangeOp> {
    prop_oneof![
        any_record_strategy().prop_map(ChangeOp::Create),
        any_record_strategy().prop_map(ChangeOp::Update),
        (kind_strategy(), row_id_strategy()).prop_map(|(kind, id)| ChangeOp::Delete(kind, id)),
    ]
}

/// Builds a changeset, keeping the first entry per `(entity, id)` so the
/// buckets stay disjoint.
pub fn changeset_from(ops: &[ChangeOp]) -> Changeset {
    let mut first: BTreeMap<(EntityKind, Uuid), &ChangeOp> = BTreeMap::new();
    for op in ops {
        first.entry(op.key()).or_insert(op);
    }
    let mut changes = Changeset::new();
    for op in first.into_values() {
        match op {
            ChangeOp::Create(record) => changes.push_created(record.clone()),
            ChangeOp::Update(record) => changes.push_updated(record.clone()),
            ChangeOp::Delete(kind, id) => changes.push_deleted(*kind, *id),
        }
    }
    changes
}

/// Strategy for a push changeset with disjoint buckets.
pub fn changeset_strategy() -> impl Strategy<Value = Changeset> {
    prop::collection::vec(change_op_strategy(), 0..10).prop_map(|ops| changeset_from(&ops))
}

/// Pre-existing server state for one id.
#[derive(Debug, Clone)]
pub enum Seed {
    /// A live row last written at `updated_at`.
    Row(Record, Timestamp),
    /// A tombstone written at `deleted_at`.
    Tombstone(EntityKind, Uuid, Timestamp),
}

/// Strategy for seeded server state: at most one live row or one tombstone
/// per `(entity, id)`, stamped between 1 and 100 ms.
pub fn seed_strategy() -> impl Strategy<Value = Vec<Seed>> {
    let seed = prop_oneof![
        (any_record_strategy(), 1i64..=100)
            .prop_map(|(record, at)| Seed::Row(record, Timestamp::from_millis(at))),
        (kind_strategy(), row_id_strategy(), 1i64..=100).prop_map(|(kind, id, at)| {
            Seed::Tombstone(kind, id, Timestamp::from_millis(at))
        }),
    ];
    prop::collection::vec(seed, 0..12).prop_map(|seeds| {
        let mut unique: BTreeMap<(EntityKind, Uuid), Seed> = BTreeMap::new();
        for seed in seeds {
            let key = match &seed {
                Seed::Row(record, _) => (record.kind(), record.id()),
                Seed::Tombstone(kind, id, _) => (*kind, *id),
            };
            unique.entry(key).or_insert(seed);
        }
        unique.into_values().collect()
    })
}

/// Writes seeds into `store`, keeping their stamps.
pub fn apply_seeds(store: &ServerStore, seeds: &[Seed]) {
    for seed in seeds {
        match seed {
            Seed::Row(record, at) => {
                let mut record = record.clone();
                record.stamp(*at, *at);
                store.put_row(record);
            }
            Seed::Tombstone(kind, id, at) => {
                let tombstone = Tombstone {
                    id: *id,
                    user_id: TEST_USER,
                    deleted_at: *at,
                };
                store
                    .put_tombstone(*kind, tombstone)
                    .expect("generated kinds have tombstones");
            }
        }
    }
}

/// Strategy for a push watermark: absent, or somewhere in the seeded range.
pub fn watermark_strategy() -> impl Strategy<Value = Option<Timestamp>> {
    prop::option::of((0i64..=120).prop_map(Timestamp::from_millis))
}

/// Strategy for entity names that must never reach a table: names with
/// characters outside `[a-zA-Z0-9_]`, overlong names and well-formed names
/// the registry does not know.
pub fn invalid_entity_name_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        prop::string::string_regex("[a-z_]{0,10}[^a-zA-Z0-9_][a-z_ ;'()*-]{0,10}")
            .expect("Invalid regex"),
        prop::string::string_regex("[a-z][a-z0-9_]{0,20}")
            .expect("Invalid regex")
            .prop_filter("must not be a registered entity", |name| {
                EntityKind::from_name(name).is_err()
            }),
        prop::string::string_regex("[a-z_]{64,80}").expect("Invalid regex"),
        Just(String::new()),
        Just("plants; DROP TABLE plants".to_string()),
        Just("plants_deleted".to_string()),
        Just("pg_catalog.pg_user".to_string()),
    ]
}

/// One step of a multi-device session.
#[derive(Debug, Clone)]
pub enum DeviceOp {
    /// Create a fresh plant on a device.
    Create {
        /// Device index.
        device: usize,
        /// Plant name.
        name: String,
    },
    /// Rename one of the device's live plants.
    Rename {
        /// Device index.
        device: usize,
        /// Picks a live plant by position, modulo the count.
        pick: usize,
        /// New name.
        name: String,
    },
    /// Delete one of the device's live plants.
    Delete {
        /// Device index.
        device: usize,
        /// Picks a live plant by position, modulo the count.
        pick: usize,
    },
    /// Run a sync cycle on a device.
    Sync {
        /// Device index.
        device: usize,
    },
}

/// Strategy for a session of up to `max_len` steps across `devices` devices.
pub fn device_ops_strategy(
    devices: usize,
    max_len: usize,
) -> impl Strategy<Value = Vec<DeviceOp>> {
    let op = prop_oneof![
        (0..devices, text_strategy()).prop_map(|(device, name)| DeviceOp::Create { device, name }),
        (0..devices, any::<usize>(), text_strategy())
            .prop_map(|(device, pick, name)| DeviceOp::Rename { device, pick, name }),
        (0..devices, any::<usize>()).prop_map(|(device, pick)| DeviceOp::Delete { device, pick }),
        (0..devices).prop_map(|device| DeviceOp::Sync { device }),
    ];
    prop::collection::vec(op, 0..max_len)
}
