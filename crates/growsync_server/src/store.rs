//! Server-side row and tombstone storage.

use crate::clock::{Clock, SystemClock};
use crate::error::{ServerError, ServerResult};
use growsync_protocol::{from_cbor, to_cbor, EntityKind, Record, Timestamp};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

const SNAPSHOT_VERSION: u32 = 1;

/// Marker that a row was deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    /// Id of the deleted row.
    pub id: Uuid,
    /// Owner of the deleted row.
    pub user_id: Uuid,
    /// Server time of the deletion.
    pub deleted_at: Timestamp,
}

/// A live row plus the device that last wrote it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StoredRow {
    pub(crate) record: Record,
    pub(crate) written_by: Option<Uuid>,
}

/// Live rows and tombstones of one entity.
#[derive(Debug, Clone, Default)]
pub(crate) struct Table {
    pub(crate) rows: BTreeMap<Uuid, StoredRow>,
    pub(crate) tombstones: BTreeMap<Uuid, Tombstone>,
}

pub(crate) type Tables = BTreeMap<EntityKind, Table>;

/// Row and tombstone counts of one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableStats {
    /// Entity.
    pub entity: EntityKind,
    /// Live rows.
    pub rows: usize,
    /// Tombstones.
    pub tombstones: usize,
    /// Ids present both live and tombstoned.
    pub overlaps: usize,
    /// Oldest tombstone, if any.
    pub oldest_tombstone: Option<Timestamp>,
}

/// The server's store of record.
///
/// One lock guards every table so that a pull sees a consistent cut and a
/// push applies against one.
pub struct ServerStore {
    tables: RwLock<Tables>,
    clock: Arc<dyn Clock>,
}

impl ServerStore {
    /// Creates an empty store on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Creates an empty store on the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let tables = EntityKind::ALL
            .iter()
            .map(|kind| (*kind, Table::default()))
            .collect();
        Self {
            tables: RwLock::new(tables),
            clock,
        }
    }

    /// Returns the current server time.
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write()
    }

    /// Stores a row exactly as given, keeping its stamps.
    ///
    /// Meant for seeding and migration; sync writes go through push.
    pub fn put_row(&self, record: Record) {
        self.clock.observe(record.updated_at());
        self.clock.observe(record.created_at());
        let mut tables = self.tables.write();
        table_mut(&mut tables, record.kind()).rows.insert(
            record.id(),
            StoredRow {
                record,
                written_by: None,
            },
        );
    }

    /// Stores a tombstone exactly as given.
    pub fn put_tombstone(&self, kind: EntityKind, tombstone: Tombstone) -> ServerResult<()> {
        if !kind.has_tombstones() {
            return Err(ServerError::Validation(format!(
                "{kind} has no tombstone table"
            )));
        }
        self.clock.observe(tombstone.deleted_at);
        let mut tables = self.tables.write();
        table_mut(&mut tables, kind)
            .tombstones
            .insert(tombstone.id, tombstone);
        Ok(())
    }

    /// Returns a live row.
    pub fn row(&self, kind: EntityKind, id: Uuid) -> Option<Record> {
        self.tables
            .read()
            .get(&kind)
            .and_then(|t| t.rows.get(&id))
            .map(|r| r.record.clone())
    }

    /// Returns a tombstone.
    pub fn tombstone(&self, kind: EntityKind, id: Uuid) -> Option<Tombstone> {
        self.tables
            .read()
            .get(&kind)
            .and_then(|t| t.tombstones.get(&id))
            .copied()
    }

    /// Returns every live row of `kind` owned by `user_id`.
    pub fn rows_owned_by(&self, kind: EntityKind, user_id: Uuid) -> Vec<Record> {
        self.tables
            .read()
            .get(&kind)
            .map(|t| {
                t.rows
                    .values()
                    .filter(|r| r.record.user_id() == user_id)
                    .map(|r| r.record.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Returns counts per entity, in registry order.
    pub fn stats(&self) -> Vec<TableStats> {
        let tables = self.tables.read();
        EntityKind::ALL
            .iter()
            .map(|kind| {
                let table = tables.get(kind);
                TableStats {
                    entity: *kind,
                    rows: table.map_or(0, |t| t.rows.len()),
                    tombstones: table.map_or(0, |t| t.tombstones.len()),
                    overlaps: table.map_or(0, |t| {
                        t.tombstones
                            .keys()
                            .filter(|id| t.rows.contains_key(id))
                            .count()
                    }),
                    oldest_tombstone: table
                        .and_then(|t| t.tombstones.values().map(|ts| ts.deleted_at).min()),
                }
            })
            .collect()
    }

    /// Counts tombstones deleted before `cutoff`.
    pub fn count_tombstones_before(&self, cutoff: Timestamp) -> usize {
        self.tables
            .read()
            .values()
            .flat_map(|t| t.tombstones.values())
            .filter(|t| t.deleted_at < cutoff)
            .count()
    }

    /// Deletes tombstones deleted before `cutoff` and returns how many went.
    pub fn prune_tombstones(&self, cutoff: Timestamp) -> usize {
        let mut tables = self.tables.write();
        let mut removed = 0;
        for (kind, table) in tables.iter_mut() {
            let before = table.tombstones.len();
            table.tombstones.retain(|_, t| t.deleted_at >= cutoff);
            let pruned = before - table.tombstones.len();
            if pruned > 0 {
                tracing::debug!(entity = %kind, pruned, "pruned tombstones");
            }
            removed += pruned;
        }
        removed
    }

    /// Writes the store to a CBOR snapshot.
    ///
    /// The file is written next to `path` and renamed into place.
    pub fn save_snapshot(&self, path: &Path) -> ServerResult<()> {
        let snapshot = {
            let tables = self.tables.read();
            let mut out = BTreeMap::new();
            for (kind, table) in tables.iter() {
                let rows = table
                    .rows
                    .values()
                    .map(|r| {
                        Ok(RowSnapshot {
                            row: r.record.to_value()?,
                            written_by: r.written_by,
                        })
                    })
                    .collect::<ServerResult<Vec<_>>>()?;
                out.insert(
                    kind.table_name().to_string(),
                    TableSnapshot {
                        rows,
                        tombstones: table.tombstones.values().copied().collect(),
                    },
                );
            }
            Snapshot {
                version: SNAPSHOT_VERSION,
                tables: out,
            }
        };

        let bytes = to_cbor(&snapshot).map_err(|e| ServerError::Snapshot(e.to_string()))?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Loads a store from a snapshot, on the system clock.
    pub fn load_snapshot(path: &Path) -> ServerResult<Self> {
        Self::load_snapshot_with_clock(path, Arc::new(SystemClock::new()))
    }

    /// Loads a store from a snapshot, on the given clock.
    ///
    /// The clock is moved past every stamp in the snapshot.
    pub fn load_snapshot_with_clock(path: &Path, clock: Arc<dyn Clock>) -> ServerResult<Self> {
        let bytes = fs::read(path)?;
        let snapshot: Snapshot =
            from_cbor(&bytes).map_err(|e| ServerError::Snapshot(e.to_string()))?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(ServerError::Snapshot(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }

        let store = Self::with_clock(clock);
        {
            let mut tables = store.tables.write();
            for (name, table_snapshot) in snapshot.tables {
                let kind = EntityKind::from_name(&name)
                    .map_err(|e| ServerError::Snapshot(e.to_string()))?;
                let table = table_mut(&mut tables, kind);
                for row in table_snapshot.rows {
                    let record = Record::from_value(kind, &row.row)
                        .map_err(|e| ServerError::Snapshot(e.to_string()))?;
                    store.clock.observe(record.updated_at());
                    store.clock.observe(record.created_at());
                    table.rows.insert(
                        record.id(),
                        StoredRow {
                            record,
                            written_by: row.written_by,
                        },
                    );
                }
                for tombstone in table_snapshot.tombstones {
                    store.clock.observe(tombstone.deleted_at);
                    table.tombstones.insert(tombstone.id, tombstone);
                }
            }
        }
        Ok(store)
    }
}

impl Default for ServerStore {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn table_mut(tables: &mut Tables, kind: EntityKind) -> &mut Table {
    tables.entry(kind).or_default()
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    tables: BTreeMap<String, TableSnapshot>,
}

#[derive(Serialize, Deserialize)]
struct TableSnapshot {
    rows: Vec<RowSnapshot>,
    tombstones: Vec<Tombstone>,
}

#[derive(Serialize, Deserialize)]
struct RowSnapshot {
    row: ciborium::Value,
    #[serde(default)]
    written_by: Option<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use growsync_protocol::PlantRow;

    fn plant(id: u128, user: u128, stamp: i64) -> Record {
        let mut record: Record =
            PlantRow::new(Uuid::from_u128(id), Uuid::from_u128(user), "basil").into();
        record.stamp(Timestamp::from_millis(stamp), Timestamp::from_millis(stamp));
        record
    }

    fn tombstone(id: u128, user: u128, at: i64) -> Tombstone {
        Tombstone {
            id: Uuid::from_u128(id),
            user_id: Uuid::from_u128(user),
            deleted_at: Timestamp::from_millis(at),
        }
    }

    #[test]
    fn empty_store() {
        let store = ServerStore::new();
        assert!(store.stats().iter().all(|s| s.rows == 0 && s.tombstones == 0));
        assert_eq!(store.stats().len(), EntityKind::ALL.len());
    }

    #[test]
    fn put_and_get() {
        let store = ServerStore::new();
        store.put_row(plant(1, 9, 10));
        store
            .put_tombstone(EntityKind::Plants, tombstone(2, 9, 20))
            .unwrap();

        assert!(store.row(EntityKind::Plants, Uuid::from_u128(1)).is_some());
        assert!(store.row(EntityKind::Posts, Uuid::from_u128(1)).is_none());
        assert_eq!(
            store.tombstone(EntityKind::Plants, Uuid::from_u128(2)),
            Some(tombstone(2, 9, 20))
        );
        assert_eq!(store.rows_owned_by(EntityKind::Plants, Uuid::from_u128(9)).len(), 1);
        assert!(store.rows_owned_by(EntityKind::Plants, Uuid::from_u128(8)).is_empty());
    }

    #[test]
    fn profiles_reject_tombstones() {
        let store = ServerStore::new();
        let err = store
            .put_tombstone(EntityKind::Profiles, tombstone(1, 9, 10))
            .unwrap_err();
        assert!(matches!(err, ServerError::Validation(_)));
    }

    #[test]
    fn seeding_moves_the_clock() {
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(0)));
        let store = ServerStore::with_clock(clock);
        store.put_row(plant(1, 9, 5_000));
        assert!(store.now() > Timestamp::from_millis(5_000));
    }

    #[test]
    fn prune_old_tombstones() {
        let store = ServerStore::new();
        store.put_tombstone(EntityKind::Plants, tombstone(1, 9, 10)).unwrap();
        store.put_tombstone(EntityKind::Posts, tombstone(2, 9, 20)).unwrap();
        store.put_tombstone(EntityKind::Posts, tombstone(3, 9, 30)).unwrap();

        let cutoff = Timestamp::from_millis(25);
        assert_eq!(store.count_tombstones_before(cutoff), 2);
        assert_eq!(store.prune_tombstones(cutoff), 2);
        assert_eq!(store.count_tombstones_before(cutoff), 0);
        assert!(store.tombstone(EntityKind::Posts, Uuid::from_u128(3)).is_some());
    }

    #[test]
    fn stats_report_overlaps() {
        let store = ServerStore::new();
        store.put_row(plant(1, 9, 10));
        store.put_tombstone(EntityKind::Plants, tombstone(1, 9, 5)).unwrap();

        let plants = store
            .stats()
            .into_iter()
            .find(|s| s.entity == EntityKind::Plants)
            .unwrap();
        assert_eq!(plants.rows, 1);
        assert_eq!(plants.tombstones, 1);
        assert_eq!(plants.overlaps, 1);
        assert_eq!(plants.oldest_tombstone, Some(Timestamp::from_millis(5)));
    }

    #[test]
    fn snapshot_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.cbor");

        let store = ServerStore::new();
        store.put_row(plant(1, 9, 10));
        store.put_tombstone(EntityKind::Plants, tombstone(2, 9, 20)).unwrap();
        store.save_snapshot(&path).unwrap();
        assert!(!path.with_extension("tmp").exists());

        let loaded = ServerStore::load_snapshot(&path).unwrap();
        assert_eq!(
            loaded.row(EntityKind::Plants, Uuid::from_u128(1)),
            Some(plant(1, 9, 10))
        );
        assert_eq!(
            loaded.tombstone(EntityKind::Plants, Uuid::from_u128(2)),
            Some(tombstone(2, 9, 20))
        );
    }

    #[test]
    fn load_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.cbor");
        fs::write(&path, b"not cbor at all").unwrap();
        assert!(matches!(
            ServerStore::load_snapshot(&path),
            Err(ServerError::Snapshot(_))
        ));
    }
}
