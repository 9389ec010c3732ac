//! Delete-vs-modify conflict resolution.
//!
//! A row and its tombstone may briefly coexist when a delete and an update
//! race. The later of `updated_at` and `deleted_at` wins.

use crate::auth::Principal;
use crate::error::{ServerError, ServerResult};
use crate::store::{table_mut, ServerStore, Table, Tables};
use growsync_protocol::{ConflictCheckRequest, ConflictCheckResponse, EntityKind, ResolutionAction};
use uuid::Uuid;

/// Resolves one id in place and reports what was done.
pub(crate) fn resolve(table: &mut Table, id: Uuid) -> ResolutionAction {
    let row_updated_at = table.rows.get(&id).map(|r| r.record.updated_at());
    let deleted_at = table.tombstones.get(&id).map(|t| t.deleted_at);

    match (row_updated_at, deleted_at) {
        (Some(updated_at), Some(deleted_at)) if updated_at > deleted_at => {
            table.tombstones.remove(&id);
            ResolutionAction::KeepModified
        }
        (Some(_), Some(_)) => {
            table.rows.remove(&id);
            ResolutionAction::ConfirmDeletion
        }
        (Some(_), None) => ResolutionAction::NoConflict,
        (None, Some(_)) => ResolutionAction::AlreadyDeleted,
        (None, None) => ResolutionAction::NotFound,
    }
}

/// Returns ids of `kind` that are both live and tombstoned, optionally
/// limited to one owner.
pub(crate) fn scan_overlaps(table: &Table, owner: Option<Uuid>) -> Vec<Uuid> {
    table
        .tombstones
        .values()
        .filter(|t| table.rows.contains_key(&t.id))
        .filter(|t| owner.map_or(true, |owner| t.user_id == owner))
        .map(|t| t.id)
        .collect()
}

/// Resolves every overlap of the given entities. Returns the number resolved.
pub(crate) fn resolve_overlaps(
    tables: &mut Tables,
    kinds: &[EntityKind],
    owner: Option<Uuid>,
) -> usize {
    let mut resolved = 0;
    for kind in kinds {
        let table = table_mut(tables, *kind);
        for id in scan_overlaps(table, owner) {
            let action = resolve(table, id);
            tracing::debug!(entity = %kind, %id, %action, "resolved overlap");
            resolved += 1;
        }
    }
    resolved
}

/// Handles a conflict check for one `(entity, id)` pair.
pub(crate) fn check_conflict(
    store: &ServerStore,
    principal: &Principal,
    request: &ConflictCheckRequest,
) -> ServerResult<ConflictCheckResponse> {
    let kind = EntityKind::from_name(&request.table_name)?;

    let mut tables = store.write();
    let table = table_mut(&mut tables, kind);

    let owner = table
        .rows
        .get(&request.record_id)
        .map(|r| r.record.user_id())
        .or_else(|| table.tombstones.get(&request.record_id).map(|t| t.user_id));
    if let Some(owner) = owner {
        if !principal.can_act_for(owner) {
            return Err(ServerError::NotAuthorized(format!(
                "{} may not resolve {kind} {}",
                principal.label(),
                request.record_id
            )));
        }
    }

    let action = resolve(table, request.record_id);
    let resolved_at = store.now();
    tracing::info!(
        entity = %kind,
        id = %request.record_id,
        last_pulled_at = %request.last_pulled_at,
        %action,
        "conflict check"
    );

    Ok(ConflictCheckResponse {
        table_name: kind.table_name().to_string(),
        record_id: request.record_id,
        resolution_action: action,
        resolved_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::Tombstone;
    use growsync_protocol::{PlantRow, Record, Timestamp};
    use std::sync::Arc;

    const USER: Uuid = Uuid::from_u128(9);

    fn store() -> ServerStore {
        ServerStore::with_clock(Arc::new(ManualClock::new(Timestamp::from_millis(1))))
    }

    fn seed_row(store: &ServerStore, id: u128, updated_at: i64) {
        let mut record: Record = PlantRow::new(Uuid::from_u128(id), USER, "basil").into();
        record.stamp(Timestamp::from_millis(0), Timestamp::from_millis(updated_at));
        store.put_row(record);
    }

    fn seed_tombstone(store: &ServerStore, id: u128, deleted_at: i64) {
        store
            .put_tombstone(
                EntityKind::Plants,
                Tombstone {
                    id: Uuid::from_u128(id),
                    user_id: USER,
                    deleted_at: Timestamp::from_millis(deleted_at),
                },
            )
            .unwrap();
    }

    fn check(store: &ServerStore, id: u128) -> ResolutionAction {
        let request =
            ConflictCheckRequest::new(EntityKind::Plants, Uuid::from_u128(id), Timestamp::MIN);
        check_conflict(store, &Principal::User(USER), &request)
            .unwrap()
            .resolution_action
    }

    #[test]
    fn modification_after_deletion_wins() {
        let store = store();
        seed_row(&store, 1, 1000);
        seed_tombstone(&store, 1, 900);

        assert_eq!(check(&store, 1), ResolutionAction::KeepModified);
        assert!(store.row(EntityKind::Plants, Uuid::from_u128(1)).is_some());
        assert!(store.tombstone(EntityKind::Plants, Uuid::from_u128(1)).is_none());
    }

    #[test]
    fn deletion_after_modification_wins() {
        let store = store();
        seed_row(&store, 1, 1000);
        seed_tombstone(&store, 1, 1100);

        assert_eq!(check(&store, 1), ResolutionAction::ConfirmDeletion);
        assert!(store.row(EntityKind::Plants, Uuid::from_u128(1)).is_none());
        assert!(store.tombstone(EntityKind::Plants, Uuid::from_u128(1)).is_some());
    }

    #[test]
    fn equal_stamps_favor_deletion() {
        let store = store();
        seed_row(&store, 1, 1000);
        seed_tombstone(&store, 1, 1000);
        assert_eq!(check(&store, 1), ResolutionAction::ConfirmDeletion);
    }

    #[test]
    fn single_sided_cases() {
        let store = store();
        seed_row(&store, 1, 1000);
        seed_tombstone(&store, 2, 1000);

        assert_eq!(check(&store, 1), ResolutionAction::NoConflict);
        assert_eq!(check(&store, 2), ResolutionAction::AlreadyDeleted);
        assert_eq!(check(&store, 3), ResolutionAction::NotFound);
    }

    #[test]
    fn check_is_idempotent() {
        let store = store();
        seed_row(&store, 1, 1000);
        seed_tombstone(&store, 1, 1100);

        assert_eq!(check(&store, 1), ResolutionAction::ConfirmDeletion);
        assert_eq!(check(&store, 1), ResolutionAction::AlreadyDeleted);
    }

    #[test]
    fn rejects_unknown_table() {
        let store = store();
        let mut request =
            ConflictCheckRequest::new(EntityKind::Plants, Uuid::from_u128(1), Timestamp::MIN);
        request.table_name = "plants_deleted; DROP TABLE plants".into();

        let err = check_conflict(&store, &Principal::Service, &request).unwrap_err();
        assert!(matches!(err, ServerError::Validation(_)));
    }

    #[test]
    fn rejects_other_owner() {
        let store = store();
        seed_row(&store, 1, 1000);
        let request =
            ConflictCheckRequest::new(EntityKind::Plants, Uuid::from_u128(1), Timestamp::MIN);

        let err = check_conflict(&store, &Principal::User(Uuid::from_u128(2)), &request)
            .unwrap_err();
        assert!(matches!(err, ServerError::NotAuthorized(_)));
    }

    #[test]
    fn overlap_scan_filters_by_owner() {
        let store = store();
        seed_row(&store, 1, 1000);
        seed_tombstone(&store, 1, 900);
        seed_tombstone(&store, 2, 900);

        let mut tables = store.write();
        let table = table_mut(&mut tables, EntityKind::Plants);
        assert_eq!(scan_overlaps(table, Some(USER)), vec![Uuid::from_u128(1)]);
        assert!(scan_overlaps(table, Some(Uuid::from_u128(3))).is_empty());

        assert_eq!(resolve_overlaps(&mut tables, &[EntityKind::Plants], None), 1);
        assert!(scan_overlaps(table_mut(&mut tables, EntityKind::Plants), None).is_empty());
    }
}
