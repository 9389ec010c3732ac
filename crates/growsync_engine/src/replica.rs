//! The local replica.
//!
//! [`ReplicaStore`] is what the engine needs from the on-device database:
//! a watermark, a transactional merge of pulled changes, an enumerator of
//! dirty rows and a way to acknowledge a successful push. [`MemoryReplica`]
//! implements it in memory, optionally persisted to a CBOR file.

use crate::error::{ReplicaError, ReplicaResult};
use growsync_protocol::{from_cbor, to_cbor, Changeset, EntityKind, Record, Timestamp};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

const SNAPSHOT_VERSION: u32 = 1;

/// Sync status of a local row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowStatus {
    /// Matches what the server last sent or accepted.
    Synced,
    /// Created locally, never pushed.
    Created,
    /// Modified locally since the last push.
    Updated,
    /// Deleted locally; the deletion is waiting to be pushed.
    Deleted,
}

impl RowStatus {
    /// Returns true if the row has local changes to push.
    pub fn is_dirty(self) -> bool {
        self != RowStatus::Synced
    }
}

/// Local changes collected for one push.
///
/// Carries the revision of every collected entry so that
/// [`ReplicaStore::acknowledge`] leaves rows edited during the push dirty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingChanges {
    /// The outgoing changeset.
    pub changes: Changeset,
    /// `(entity, id, revision)` of every collected entry.
    pub revisions: Vec<(EntityKind, Uuid, u64)>,
    /// Collected rows whose media columns were never pulled.
    pub media_omitted: Vec<(EntityKind, Uuid)>,
}

impl PendingChanges {
    /// Returns true if there is nothing to push.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Returns the number of collected entries.
    pub fn len(&self) -> usize {
        self.revisions.len()
    }

    /// Splits into batches of at most `size` entries, in changeset order.
    pub fn batches(&self, size: usize) -> Vec<PendingChanges> {
        let size = size.max(1);
        if self.changes.len() <= size {
            return vec![self.clone()];
        }

        let revisions: BTreeMap<(EntityKind, Uuid), u64> = self
            .revisions
            .iter()
            .map(|&(kind, id, revision)| ((kind, id), revision))
            .collect();
        let omitted: BTreeSet<(EntityKind, Uuid)> = self.media_omitted.iter().copied().collect();

        let mut batches = Vec::new();
        let mut batch = PendingChanges::default();
        for (kind, entity) in self.changes.iter() {
            for record in &entity.created {
                batch.changes.push_created(record.clone());
                batch.track(kind, record.id(), &revisions, &omitted);
                seal_if_full(&mut batch, size, &mut batches);
            }
            for record in &entity.updated {
                batch.changes.push_updated(record.clone());
                batch.track(kind, record.id(), &revisions, &omitted);
                seal_if_full(&mut batch, size, &mut batches);
            }
            for &id in &entity.deleted {
                batch.changes.push_deleted(kind, id);
                batch.track(kind, id, &revisions, &omitted);
                seal_if_full(&mut batch, size, &mut batches);
            }
        }
        if !batch.is_empty() {
            batches.push(batch);
        }
        batches
    }

    fn track(
        &mut self,
        kind: EntityKind,
        id: Uuid,
        revisions: &BTreeMap<(EntityKind, Uuid), u64>,
        omitted: &BTreeSet<(EntityKind, Uuid)>,
    ) {
        if let Some(revision) = revisions.get(&(kind, id)) {
            self.revisions.push((kind, id, *revision));
        }
        if omitted.contains(&(kind, id)) {
            self.media_omitted.push((kind, id));
        }
    }
}

fn seal_if_full(batch: &mut PendingChanges, size: usize, batches: &mut Vec<PendingChanges>) {
    if batch.changes.len() >= size {
        batches.push(std::mem::take(batch));
    }
}

/// Counts from merging one pull.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyStats {
    /// Rows inserted or replaced.
    pub upserted: usize,
    /// Rows removed.
    pub deleted: usize,
    /// Pulled rows ignored because the local change is newer.
    pub kept_local: usize,
}

/// The local replica store used by the sync engine.
pub trait ReplicaStore: Send + Sync {
    /// Returns the watermark, `None` if never synced.
    fn watermark(&self) -> Option<Timestamp>;

    /// Merges pulled changes in one transaction.
    ///
    /// `baseline` is the watermark the pull was made against. A dirty local
    /// row is replaced only by a pulled row newer than the baseline. When the
    /// pull excluded media, local media columns are kept.
    fn apply_remote(
        &self,
        changes: &Changeset,
        baseline: Option<Timestamp>,
        include_media: bool,
    ) -> ReplicaResult<ApplyStats>;

    /// Collects dirty rows and pending deletions, optionally for some entities only.
    fn pending_changes(&self, entities: Option<&[EntityKind]>) -> ReplicaResult<PendingChanges>;

    /// Marks pushed entries clean and advances the watermark.
    ///
    /// Entries modified since they were collected stay dirty. A `watermark`
    /// of `None` keeps the stored one.
    fn acknowledge(
        &self,
        pushed: &PendingChanges,
        watermark: Option<Timestamp>,
    ) -> ReplicaResult<()>;
}

#[derive(Debug, Clone)]
struct LocalRow {
    record: Record,
    status: RowStatus,
    revision: u64,
    /// Media columns were blanked by the server and never pulled since.
    media_omitted: bool,
}

#[derive(Debug, Clone, Default)]
struct ReplicaState {
    tables: BTreeMap<EntityKind, BTreeMap<Uuid, LocalRow>>,
    deletes: BTreeMap<EntityKind, BTreeMap<Uuid, u64>>,
    watermark: Option<Timestamp>,
    next_revision: u64,
}

impl ReplicaState {
    fn bump(&mut self) -> u64 {
        self.next_revision += 1;
        self.next_revision
    }

    fn row(&self, kind: EntityKind, id: Uuid) -> Option<&LocalRow> {
        self.tables.get(&kind).and_then(|t| t.get(&id))
    }

    fn pending_delete(&self, kind: EntityKind, id: Uuid) -> Option<u64> {
        self.deletes.get(&kind).and_then(|d| d.get(&id)).copied()
    }

    fn insert(&mut self, record: Record, status: RowStatus, media_omitted: bool) {
        let revision = self.bump();
        let kind = record.kind();
        self.tables.entry(kind).or_default().insert(
            record.id(),
            LocalRow {
                record,
                status,
                revision,
                media_omitted,
            },
        );
    }

    fn remove_delete(&mut self, kind: EntityKind, id: Uuid) -> bool {
        self.deletes
            .get_mut(&kind)
            .is_some_and(|d| d.remove(&id).is_some())
    }

    fn merge_row(
        &mut self,
        mut record: Record,
        baseline: Option<Timestamp>,
        include_media: bool,
        stats: &mut ApplyStats,
    ) {
        let kind = record.kind();
        let id = record.id();
        let dirty = self.row(kind, id).is_some_and(|r| r.status.is_dirty())
            || self.pending_delete(kind, id).is_some();
        let newer = baseline.map_or(true, |b| record.updated_at() > b);

        if dirty && !newer {
            stats.kept_local += 1;
            return;
        }
        let media_omitted = match self.row(kind, id) {
            _ if include_media => false,
            Some(local) => {
                record.copy_media_from(&local.record);
                local.media_omitted
            }
            None => !kind.spec().media_columns.is_empty(),
        };
        self.remove_delete(kind, id);
        self.insert(record, RowStatus::Synced, media_omitted);
        stats.upserted += 1;
    }

    fn merge_delete(&mut self, kind: EntityKind, id: Uuid, stats: &mut ApplyStats) {
        let removed = self
            .tables
            .get_mut(&kind)
            .is_some_and(|t| t.remove(&id).is_some());
        let cancelled = self.remove_delete(kind, id);
        if removed || cancelled {
            stats.deleted += 1;
        }
    }
}

/// An in-memory replica, optionally persisted to a CBOR file.
///
/// Every mutation runs on a copy of the state that replaces the live one
/// only after it has been written to disk, so a failed write leaves the
/// replica as it was.
#[derive(Debug, Default)]
pub struct MemoryReplica {
    state: RwLock<ReplicaState>,
    path: Option<PathBuf>,
}

impl MemoryReplica {
    /// Creates an empty replica that is never persisted.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Opens the replica stored at `path`, or creates an empty one.
    pub fn open(path: impl Into<PathBuf>) -> ReplicaResult<Self> {
        let path = path.into();
        let state = if path.exists() {
            load(&path)?
        } else {
            ReplicaState::default()
        };
        Ok(Self {
            state: RwLock::new(state),
            path: Some(path),
        })
    }

    fn transact<T>(
        &self,
        f: impl FnOnce(&mut ReplicaState) -> ReplicaResult<T>,
    ) -> ReplicaResult<T> {
        let mut state = self.state.write();
        let mut next = state.clone();
        let out = f(&mut next)?;
        if let Some(path) = &self.path {
            save(path, &next)?;
        }
        *state = next;
        Ok(out)
    }

    /// Inserts a new local row.
    pub fn create(&self, mut record: Record) -> ReplicaResult<()> {
        let now = Timestamp::now();
        record.stamp(now, now);
        self.transact(|state| {
            let (kind, id) = (record.kind(), record.id());
            if state.row(kind, id).is_some() {
                return Err(ReplicaError::AlreadyExists { entity: kind, id });
            }
            state.remove_delete(kind, id);
            state.insert(record, RowStatus::Created, false);
            Ok(())
        })
    }

    /// Replaces an existing local row.
    pub fn update(&self, mut record: Record) -> ReplicaResult<()> {
        self.transact(|state| {
            let (kind, id) = (record.kind(), record.id());
            let existing = state
                .row(kind, id)
                .ok_or(ReplicaError::NotFound { entity: kind, id })?;
            let status = match existing.status {
                RowStatus::Created => RowStatus::Created,
                _ => RowStatus::Updated,
            };
            // Setting media on a row pulled without it makes the media real.
            let mut same_media = record.clone();
            same_media.copy_media_from(&existing.record);
            let media_omitted = existing.media_omitted && same_media == record;
            record.stamp(existing.record.created_at(), Timestamp::now());
            state.insert(record, status, media_omitted);
            Ok(())
        })
    }

    /// Deletes a local row and queues the deletion for the next push.
    ///
    /// The deletion is queued even if the row is unknown locally.
    pub fn delete(&self, kind: EntityKind, id: Uuid) -> ReplicaResult<()> {
        if !kind.has_tombstones() {
            return Err(ReplicaError::NotDeletable(kind));
        }
        self.transact(|state| {
            if let Some(table) = state.tables.get_mut(&kind) {
                table.remove(&id);
            }
            let revision = state.bump();
            state.deletes.entry(kind).or_default().insert(id, revision);
            Ok(())
        })
    }

    /// Returns a live row.
    pub fn get(&self, kind: EntityKind, id: Uuid) -> Option<Record> {
        self.state.read().row(kind, id).map(|r| r.record.clone())
    }

    /// Returns every live row of an entity, ordered by id.
    pub fn list(&self, kind: EntityKind) -> Vec<Record> {
        self.state
            .read()
            .tables
            .get(&kind)
            .map(|t| t.values().map(|r| r.record.clone()).collect())
            .unwrap_or_default()
    }

    /// Returns the sync status of a row, `None` if unknown.
    pub fn status(&self, kind: EntityKind, id: Uuid) -> Option<RowStatus> {
        let state = self.state.read();
        if state.pending_delete(kind, id).is_some() {
            return Some(RowStatus::Deleted);
        }
        state.row(kind, id).map(|r| r.status)
    }

    /// Returns the number of entries waiting to be pushed.
    pub fn pending_count(&self) -> usize {
        let state = self.state.read();
        let rows: usize = state
            .tables
            .values()
            .map(|t| t.values().filter(|r| r.status.is_dirty()).count())
            .sum();
        let deletes: usize = state.deletes.values().map(BTreeMap::len).sum();
        rows + deletes
    }
}

impl ReplicaStore for MemoryReplica {
    fn watermark(&self) -> Option<Timestamp> {
        self.state.read().watermark
    }

    fn apply_remote(
        &self,
        changes: &Changeset,
        baseline: Option<Timestamp>,
        include_media: bool,
    ) -> ReplicaResult<ApplyStats> {
        if changes.is_empty() {
            return Ok(ApplyStats::default());
        }
        self.transact(|state| {
            let mut stats = ApplyStats::default();
            for (kind, entity) in changes.iter() {
                for record in entity.created.iter().chain(&entity.updated) {
                    state.merge_row(record.clone(), baseline, include_media, &mut stats);
                }
                for &id in &entity.deleted {
                    state.merge_delete(kind, id, &mut stats);
                }
            }
            Ok(stats)
        })
    }

    fn pending_changes(&self, entities: Option<&[EntityKind]>) -> ReplicaResult<PendingChanges> {
        let state = self.state.read();
        let wanted = |kind: EntityKind| entities.map_or(true, |e| e.contains(&kind));
        let mut pending = PendingChanges::default();

        for (kind, table) in state.tables.iter().filter(|(k, _)| wanted(**k)) {
            for (id, row) in table {
                match row.status {
                    RowStatus::Created => pending.changes.push_created(row.record.clone()),
                    RowStatus::Updated => pending.changes.push_updated(row.record.clone()),
                    RowStatus::Synced | RowStatus::Deleted => continue,
                }
                pending.revisions.push((*kind, *id, row.revision));
                if row.media_omitted {
                    pending.media_omitted.push((*kind, *id));
                }
            }
        }
        for (kind, deletes) in state.deletes.iter().filter(|(k, _)| wanted(**k)) {
            for (id, revision) in deletes {
                pending.changes.push_deleted(*kind, *id);
                pending.revisions.push((*kind, *id, *revision));
            }
        }
        Ok(pending)
    }

    fn acknowledge(
        &self,
        pushed: &PendingChanges,
        watermark: Option<Timestamp>,
    ) -> ReplicaResult<()> {
        self.transact(|state| {
            for &(kind, id, revision) in &pushed.revisions {
                if state.pending_delete(kind, id) == Some(revision) {
                    state.remove_delete(kind, id);
                    continue;
                }
                if let Some(row) = state.tables.get_mut(&kind).and_then(|t| t.get_mut(&id)) {
                    if row.revision == revision {
                        row.status = RowStatus::Synced;
                    }
                }
            }
            if let Some(watermark) = watermark {
                state.watermark = Some(state.watermark.map_or(watermark, |w| w.max(watermark)));
            }
            Ok(())
        })
    }
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    watermark: Option<Timestamp>,
    next_revision: u64,
    tables: BTreeMap<String, TableSnapshot>,
}

#[derive(Serialize, Deserialize, Default)]
struct TableSnapshot {
    rows: Vec<RowSnapshot>,
    deletes: Vec<(Uuid, u64)>,
}

#[derive(Serialize, Deserialize)]
struct RowSnapshot {
    row: ciborium::Value,
    status: RowStatus,
    revision: u64,
    #[serde(default)]
    media_omitted: bool,
}

fn save(path: &Path, state: &ReplicaState) -> ReplicaResult<()> {
    let mut tables: BTreeMap<String, TableSnapshot> = BTreeMap::new();
    for (kind, rows) in &state.tables {
        let entry = tables.entry(kind.table_name().to_string()).or_default();
        for row in rows.values() {
            entry.rows.push(RowSnapshot {
                row: row.record.to_value()?,
                status: row.status,
                revision: row.revision,
                media_omitted: row.media_omitted,
            });
        }
    }
    for (kind, deletes) in &state.deletes {
        let entry = tables.entry(kind.table_name().to_string()).or_default();
        entry.deletes.extend(deletes.iter().map(|(id, rev)| (*id, *rev)));
    }
    let snapshot = Snapshot {
        version: SNAPSHOT_VERSION,
        watermark: state.watermark,
        next_revision: state.next_revision,
        tables,
    };

    let bytes = to_cbor(&snapshot)?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn load(path: &Path) -> ReplicaResult<ReplicaState> {
    let bytes = fs::read(path)?;
    let snapshot: Snapshot = from_cbor(&bytes)?;
    if snapshot.version != SNAPSHOT_VERSION {
        return Err(ReplicaError::Codec(format!(
            "unsupported replica version {}",
            snapshot.version
        )));
    }

    let mut state = ReplicaState {
        watermark: snapshot.watermark,
        next_revision: snapshot.next_revision,
        ..ReplicaState::default()
    };
    for (name, table) in snapshot.tables {
        let kind = EntityKind::from_name(&name)?;
        for row in table.rows {
            let record = Record::from_value(kind, &row.row)?;
            state.tables.entry(kind).or_default().insert(
                record.id(),
                LocalRow {
                    record,
                    status: row.status,
                    revision: row.revision,
                    media_omitted: row.media_omitted,
                },
            );
        }
        if !table.deletes.is_empty() {
            state.deletes.entry(kind).or_default().extend(table.deletes);
        }
    }
    Ok(state)
}
