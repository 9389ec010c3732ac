//! Push: apply a client changeset under the last-writer-wins guard.

use crate::auth::Principal;
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::store::{table_mut, ServerStore, StoredRow, Table, Tables, Tombstone};
use growsync_protocol::{
    DecodedEntityChanges, EntityKind, PushRequest, PushResponse, Record, RowRejection, Timestamp,
};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Result of applying one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Outcome {
    Applied,
    Skipped(&'static str),
    Rejected(String),
}

/// Per-call state shared by every entry.
struct Apply<'a> {
    store: &'a ServerStore,
    since: Timestamp,
    device: Option<Uuid>,
    owner: Uuid,
    media_omitted: BTreeSet<(EntityKind, Uuid)>,
}

impl Apply<'_> {
    /// True if the server row is newer than what the client last pulled.
    ///
    /// The pushing device's own latest write never blocks it: its local row
    /// already descends from that write.
    fn blocks(&self, existing: &StoredRow) -> bool {
        existing.record.updated_at() > self.since
            && !(self.device.is_some() && existing.written_by == self.device)
    }

    fn overwrite(&self, existing: &mut StoredRow, mut record: Record) -> Outcome {
        if self.blocks(existing) {
            return Outcome::Skipped("server has a newer version");
        }
        if self.media_omitted.contains(&(record.kind(), record.id())) {
            record.copy_media_from(&existing.record);
        }
        record.stamp(existing.record.created_at(), existing.record.updated_at());
        if record == existing.record {
            return Outcome::Skipped("unchanged");
        }
        record.stamp(existing.record.created_at(), self.store.now());
        existing.record = record;
        existing.written_by = self.device;
        Outcome::Applied
    }

    fn created(&self, table: &mut Table, mut record: Record) -> Outcome {
        let id = record.id();
        if let Some(tombstone) = table.tombstones.get(&id) {
            if tombstone.deleted_at > self.since {
                return Outcome::Skipped("deleted on server");
            }
        }
        if let Some(existing) = table.rows.get(&id) {
            if self.blocks(existing) {
                return Outcome::Skipped("server has a newer version");
            }
        }

        table.tombstones.remove(&id);
        match table.rows.get_mut(&id) {
            Some(existing) => self.overwrite(existing, record),
            None => {
                let now = self.store.now();
                record.stamp(now, now);
                table.rows.insert(
                    id,
                    StoredRow {
                        record,
                        written_by: self.device,
                    },
                );
                Outcome::Applied
            }
        }
    }

    fn updated(&self, table: &mut Table, record: Record) -> Outcome {
        let id = record.id();
        if table.tombstones.contains_key(&id) {
            return Outcome::Skipped("deleted on server");
        }
        match table.rows.get_mut(&id) {
            Some(existing) => self.overwrite(existing, record),
            None => Outcome::Skipped("no such row"),
        }
    }

    fn deleted(&self, table: &mut Table, kind: EntityKind, id: Uuid) -> Outcome {
        if !kind.has_tombstones() {
            return Outcome::Rejected(format!("{kind} rows cannot be deleted through sync"));
        }
        let owner = match table.rows.get(&id) {
            Some(existing) if self.blocks(existing) => {
                return Outcome::Skipped("server has a newer version");
            }
            Some(existing) => existing.record.user_id(),
            None if table.tombstones.contains_key(&id) => {
                return Outcome::Skipped("already deleted");
            }
            None => self.owner,
        };

        table.rows.remove(&id);
        let deleted_at = self.store.now();
        table.tombstones.entry(id).or_insert(Tombstone {
            id,
            user_id: owner,
            deleted_at,
        });
        Outcome::Applied
    }
}

/// Handles a push.
///
/// Entity names and ownership are checked for the whole call before anything
/// is written. After that, each entry is applied on its own: a rejected or
/// skipped entry never stops its siblings.
pub(crate) fn push(
    store: &ServerStore,
    config: &ServerConfig,
    principal: &Principal,
    request: &PushRequest,
) -> ServerResult<PushResponse> {
    if !principal.can_act_for(request.user_id) {
        return Err(ServerError::NotAuthorized(format!(
            "{} may not push for {}",
            principal.label(),
            request.user_id
        )));
    }

    let rows = request.row_count();
    if rows > config.max_push_rows {
        return Err(ServerError::InvalidRequest(format!(
            "too many rows: {rows} > {}",
            config.max_push_rows
        )));
    }

    let decoded: Vec<(EntityKind, DecodedEntityChanges)> = request
        .changes
        .validated()?
        .into_iter()
        .map(|(kind, raw)| (kind, raw.decode(kind)))
        .collect();
    let media_omitted = request.media_omitted_rows()?;

    let mut tables = store.write();
    authorize(&tables, principal, &decoded)?;

    let apply = Apply {
        store,
        since: request.last_pulled_at.unwrap_or(Timestamp::MIN),
        device: request.device_id,
        owner: request.user_id,
        media_omitted,
    };
    let mut response = PushResponse::success(Timestamp::MIN);

    for (kind, changes) in decoded {
        let duplicates = duplicate_ids(&changes);
        let table = table_mut(&mut tables, kind);

        for record in changes.created {
            let (id, outcome) = match record {
                Ok(r) if duplicates.contains_key(&r.id()) => (Some(r.id()), duplicate()),
                Ok(r) => (Some(r.id()), apply.created(table, r)),
                Err(e) => (None, Outcome::Rejected(e.to_string())),
            };
            tally(&mut response, kind, id, outcome);
        }
        for record in changes.updated {
            let (id, outcome) = match record {
                Ok(r) if duplicates.contains_key(&r.id()) => (Some(r.id()), duplicate()),
                Ok(r) => (Some(r.id()), apply.updated(table, r)),
                Err(e) => (None, Outcome::Rejected(e.to_string())),
            };
            tally(&mut response, kind, id, outcome);
        }
        for id in changes.deleted {
            let (id, outcome) = match id {
                Ok(id) if duplicates.contains_key(&id) => (Some(id), duplicate()),
                Ok(id) => (Some(id), apply.deleted(table, kind, id)),
                Err(e) => (None, Outcome::Rejected(e.to_string())),
            };
            tally(&mut response, kind, id, outcome);
        }
    }

    response.timestamp = store.now();
    tracing::info!(
        user = %request.user_id,
        applied = response.applied,
        skipped = response.skipped,
        rejected = response.rejected.len(),
        "push"
    );
    Ok(response)
}

/// Checks every decodable entry against the caller, including the owners of
/// server rows and tombstones the entry would touch.
fn authorize(
    tables: &Tables,
    principal: &Principal,
    decoded: &[(EntityKind, DecodedEntityChanges)],
) -> ServerResult<()> {
    let deny = |kind: EntityKind, id: Uuid| {
        ServerError::NotAuthorized(format!("{} may not write {kind} {id}", principal.label()))
    };

    for (kind, changes) in decoded {
        let table = tables.get(kind);
        let existing_owner = |id: &Uuid| {
            table.and_then(|t| {
                t.rows
                    .get(id)
                    .map(|r| r.record.user_id())
                    .or_else(|| t.tombstones.get(id).map(|t| t.user_id))
            })
        };

        let records = changes
            .created
            .iter()
            .chain(changes.updated.iter())
            .filter_map(|r| r.as_ref().ok());
        for record in records {
            if !principal.can_act_for(record.user_id()) {
                return Err(deny(*kind, record.id()));
            }
            if let Some(owner) = existing_owner(&record.id()) {
                if !principal.can_act_for(owner) {
                    return Err(deny(*kind, record.id()));
                }
            }
        }

        for id in changes.deleted.iter().filter_map(|id| id.as_ref().ok()) {
            if let Some(owner) = existing_owner(id) {
                if !principal.can_act_for(owner) {
                    return Err(deny(*kind, *id));
                }
            }
        }
    }
    Ok(())
}

/// Returns ids that occur more than once across the buckets of one entity.
fn duplicate_ids(changes: &DecodedEntityChanges) -> BTreeMap<Uuid, usize> {
    let mut counts: BTreeMap<Uuid, usize> = BTreeMap::new();
    let ids = changes
        .created
        .iter()
        .chain(changes.updated.iter())
        .filter_map(|r| r.as_ref().ok().map(Record::id))
        .chain(changes.deleted.iter().filter_map(|id| id.as_ref().ok().copied()));
    for id in ids {
        *counts.entry(id).or_default() += 1;
    }
    counts.retain(|_, count| *count > 1);
    counts
}

fn duplicate() -> Outcome {
    Outcome::Rejected("id appears more than once in the changeset".into())
}

fn tally(response: &mut PushResponse, kind: EntityKind, id: Option<Uuid>, outcome: Outcome) {
    match outcome {
        Outcome::Applied => response.applied += 1,
        Outcome::Skipped(reason) => {
            tracing::debug!(entity = %kind, id = ?id, reason, "push row skipped");
            response.skipped += 1;
        }
        Outcome::Rejected(reason) => {
            tracing::warn!(entity = %kind, id = ?id, %reason, "push row rejected");
            response.rejected.push(RowRejection {
                entity: kind.table_name().to_string(),
                id,
                reason,
            });
        }
    }
}
