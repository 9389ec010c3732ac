//! Pull: everything a user's replica is missing since its watermark.

use crate::auth::Principal;
use crate::config::ServerConfig;
use crate::conflict::resolve_overlaps;
use crate::error::{ServerError, ServerResult};
use crate::store::{ServerStore, Tables};
use growsync_protocol::{Changeset, EntityKind, PullRequest, PullResponse, Timestamp};
use std::collections::BTreeSet;

/// Resolves requested entity names. Unknown or malformed names are skipped.
fn requested_kinds(entities: Option<&[String]>) -> Vec<EntityKind> {
    let Some(names) = entities else {
        return EntityKind::ALL.to_vec();
    };
    let mut kinds = BTreeSet::new();
    for name in names {
        match EntityKind::from_name(name) {
            Ok(kind) => {
                kinds.insert(kind);
            }
            Err(e) => tracing::debug!(error = %e, "skipping entity in pull"),
        }
    }
    kinds.into_iter().collect()
}

/// Handles a pull.
///
/// A missing watermark is a full dump: the same query with `since` at
/// -infinity, which places every live row in `created` and reports no
/// deletions.
pub(crate) fn pull(
    store: &ServerStore,
    config: &ServerConfig,
    principal: &Principal,
    request: &PullRequest,
) -> ServerResult<PullResponse> {
    if !principal.can_act_for(request.user_id) {
        return Err(ServerError::NotAuthorized(format!(
            "{} may not pull for {}",
            principal.label(),
            request.user_id
        )));
    }

    let kinds = requested_kinds(request.entities.as_deref());

    let (changes, timestamp) = if config.resolve_conflicts_on_pull {
        let mut tables = store.write();
        let resolved = resolve_overlaps(&mut tables, &kinds, Some(request.user_id));
        if resolved > 0 {
            tracing::info!(user = %request.user_id, resolved, "resolved overlaps before pull");
        }
        let timestamp = store.now();
        (collect_changes(&tables, &kinds, request), timestamp)
    } else {
        let tables = store.read();
        let timestamp = store.now();
        (collect_changes(&tables, &kinds, request), timestamp)
    };

    tracing::debug!(
        user = %request.user_id,
        since = ?request.last_pulled_at,
        rows = changes.len(),
        %timestamp,
        "pull"
    );
    Ok(PullResponse::new(changes, timestamp))
}

fn collect_changes(tables: &Tables, kinds: &[EntityKind], request: &PullRequest) -> Changeset {
    let since = request.last_pulled_at.unwrap_or(Timestamp::MIN);
    let own_device = request.last_pulled_at.and(request.device_id);
    let user_id = request.user_id;

    let mut changes = Changeset::new();
    for kind in kinds {
        let entry = changes.entry(*kind);
        let Some(table) = tables.get(kind) else {
            continue;
        };

        for stored in table.rows.values() {
            let record = &stored.record;
            if record.user_id() != user_id || table.tombstones.contains_key(&record.id()) {
                continue;
            }
            if own_device.is_some() && stored.written_by == own_device {
                continue;
            }

            let bucket = if record.created_at() > since {
                &mut entry.created
            } else if record.updated_at() > since {
                &mut entry.updated
            } else {
                continue;
            };
            let mut record = record.clone();
            if !request.include_media {
                record.strip_media();
            }
            bucket.push(record);
        }

        if request.last_pulled_at.is_some() {
            entry.deleted.extend(
                table
                    .tombstones
                    .values()
                    .filter(|t| t.user_id == user_id && t.deleted_at > since)
                    .map(|t| t.id),
            );
        }
    }
    changes
}
