//! Prune command implementation.

use growsync_server::{RetentionJob, ServerStore};
use std::path::Path;
use std::time::Duration;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Prune statistics.
#[derive(Debug, PartialEq, Eq)]
pub struct PruneStats {
    /// Tombstones before pruning.
    pub tombstones_before: usize,
    /// Tombstones past the retention window.
    pub expired: usize,
    /// Whether the snapshot was rewritten.
    pub written: bool,
}

/// Drops tombstones older than `days` from the snapshot at `path`.
pub fn prune(path: &Path, days: u64, dry_run: bool) -> Result<PruneStats, Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("No snapshot found at {:?}", path).into());
    }
    let store = ServerStore::load_snapshot(path)?;
    let retention = DAY * u32::try_from(days)?;
    let tombstones_before = store.stats().iter().map(|s| s.tombstones).sum();

    if dry_run {
        let cutoff = store.now().saturating_sub(retention);
        return Ok(PruneStats {
            tombstones_before,
            expired: store.count_tombstones_before(cutoff),
            written: false,
        });
    }

    let expired = RetentionJob::run_once(&store, retention);
    if expired > 0 {
        store.save_snapshot(path)?;
    }
    Ok(PruneStats {
        tombstones_before,
        expired,
        written: expired > 0,
    })
}

/// Runs the prune command.
pub fn run(path: &Path, days: u64, dry_run: bool) -> Result<(), Box<dyn std::error::Error>> {
    println!("Pruning tombstones older than {} days in {:?}", days, path);
    if dry_run {
        println!("(dry run - no changes will be made)");
    }
    println!();

    let stats = prune(path, days, dry_run)?;

    println!("  Tombstones: {}", stats.tombstones_before);
    println!(
        "  Expired:    {} (will be {})",
        stats.expired,
        if dry_run { "kept" } else { "removed" }
    );
    if stats.written {
        println!();
        println!("✓ Snapshot rewritten");
    }

    Ok(())
}
