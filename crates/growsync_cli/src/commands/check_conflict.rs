//! Check-conflict command implementation.

use growsync_protocol::{
    ConflictCheckRequest, ConflictCheckResponse, EntityKind, ResolutionAction, Timestamp,
};
use growsync_server::{ServerConfig, ServerStore, SyncServer};
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

/// Settles a delete-vs-modify conflict on one row of the snapshot at `path`.
///
/// Runs as the service principal. The snapshot is rewritten when the check
/// removed a row or a tombstone.
pub fn check(
    path: &Path,
    table: &str,
    id: Uuid,
    last_pulled_at: i64,
) -> Result<ConflictCheckResponse, Box<dyn std::error::Error>> {
    let kind = EntityKind::from_name(table)?;
    if !path.exists() {
        return Err(format!("No snapshot found at {:?}", path).into());
    }
    let store = Arc::new(ServerStore::load_snapshot(path)?);
    let server = SyncServer::with_store(ServerConfig::default(), Arc::clone(&store));

    let request = ConflictCheckRequest::new(kind, id, Timestamp::from_millis(last_pulled_at));
    let response = server.handle_conflict_check(None, &request)?;
    if matches!(
        response.resolution_action,
        ResolutionAction::KeepModified | ResolutionAction::ConfirmDeletion
    ) {
        store.save_snapshot(path)?;
    }
    Ok(response)
}

/// Runs the check-conflict command.
pub fn run(
    path: &Path,
    table: &str,
    id: Uuid,
    last_pulled_at: i64,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = check(path, table, id, last_pulled_at)?;

    match format {
        "json" => {
            let json = serde_json::json!({
                "table_name": response.table_name,
                "record_id": response.record_id,
                "resolution_action": response.resolution_action.as_str(),
                "resolved_at": response.resolved_at.as_millis(),
            });
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        _ => {
            println!(
                "{} {}: {}",
                response.table_name, response.record_id, response.resolution_action
            );
        }
    }

    Ok(())
}
