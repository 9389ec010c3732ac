//! Inspect command implementation.

use growsync_server::{ServerStore, TableStats};
use serde::Serialize;
use std::path::Path;

/// Snapshot inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Snapshot path.
    pub path: String,
    /// Snapshot file size in bytes.
    pub file_size: u64,
    /// Live rows across all entities.
    pub total_rows: usize,
    /// Tombstones across all entities.
    pub total_tombstones: usize,
    /// Ids both live and tombstoned, waiting for a conflict check.
    pub total_overlaps: usize,
    /// Per-entity statistics.
    pub entities: Vec<TableStats>,
}

/// Collects statistics for the snapshot at `path`.
pub fn inspect(path: &Path) -> Result<InspectResult, Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("No snapshot found at {:?}", path).into());
    }
    let store = ServerStore::load_snapshot(path)?;
    let entities = store.stats();

    Ok(InspectResult {
        path: path.display().to_string(),
        file_size: std::fs::metadata(path)?.len(),
        total_rows: entities.iter().map(|s| s.rows).sum(),
        total_tombstones: entities.iter().map(|s| s.tombstones).sum(),
        total_overlaps: entities.iter().map(|s| s.overlaps).sum(),
        entities,
    })
}

/// Runs the inspect command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let result = inspect(path)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

fn print_text_output(result: &InspectResult) {
    println!("growsync Snapshot Inspection");
    println!("============================");
    println!();
    println!("Path: {}", result.path);
    println!("Size: {} bytes", result.file_size);
    println!();
    println!(
        "{:<18} {:>8} {:>11} {:>9}  oldest tombstone",
        "entity", "rows", "tombstones", "overlaps"
    );
    for stats in &result.entities {
        let oldest = stats
            .oldest_tombstone
            .map(|t| t.as_millis().to_string())
            .unwrap_or_else(|| "-".into());
        println!(
            "{:<18} {:>8} {:>11} {:>9}  {}",
            stats.entity.table_name(),
            stats.rows,
            stats.tombstones,
            stats.overlaps,
            oldest
        );
    }
    println!();
    println!("Total rows:       {}", result.total_rows);
    println!("Total tombstones: {}", result.total_tombstones);
    if result.total_overlaps > 0 {
        println!(
            "Overlaps:         {} (run check-conflict or pull to resolve)",
            result.total_overlaps
        );
    }
}
