//! Test fixtures: servers, devices, rows and temporary snapshots.

use crate::transport::InProcessTransport;
use growsync_engine::{MemoryReplica, SyncConfig, SyncEngine};
use growsync_protocol::{EntityKind, PlantRow, PostRow, Record, Timestamp};
use growsync_server::{ManualClock, ServerConfig, ServerStore, SyncServer};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use uuid::Uuid;

/// A device engine wired in-process to a shared server.
pub type TestDevice = SyncEngine<InProcessTransport, MemoryReplica>;

/// The account every fixture row belongs to unless stated otherwise.
pub const TEST_USER: Uuid = Uuid::from_u128(0x00a1_1ce0);

/// Creates a server with the default configuration.
pub fn test_server() -> Arc<SyncServer> {
    Arc::new(SyncServer::new(ServerConfig::default()))
}

/// Creates a server whose clock only moves when the test moves it.
pub fn manual_server(start: Timestamp) -> (Arc<SyncServer>, Arc<ManualClock>) {
    manual_server_with(ServerConfig::default(), start)
}

/// Creates a server with `config` on a manual clock.
pub fn manual_server_with(
    config: ServerConfig,
    start: Timestamp,
) -> (Arc<SyncServer>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(start));
    let store = Arc::new(ServerStore::with_clock(clock.clone()));
    (Arc::new(SyncServer::with_store(config, store)), clock)
}

/// Creates device number `n` of [`TEST_USER`] on `server`.
pub fn test_device(server: &Arc<SyncServer>, n: u128) -> TestDevice {
    device_for(server, TEST_USER, n)
}

/// Creates device number `n` of `user` on `server`.
pub fn device_for(server: &Arc<SyncServer>, user: Uuid, n: u128) -> TestDevice {
    let config = SyncConfig::new(user, Uuid::from_u128(n), "inproc://growsync");
    let transport = InProcessTransport::new(Arc::clone(server));
    SyncEngine::new(config, transport, MemoryReplica::in_memory())
}

/// Builds a plant row of [`TEST_USER`].
pub fn plant(id: u128, name: &str) -> Record {
    PlantRow::new(Uuid::from_u128(id), TEST_USER, name).into()
}

/// Builds a plant row stamped with `updated_at` (and created at the same time).
pub fn plant_at(id: u128, name: &str, updated_at: Timestamp) -> Record {
    let mut record = plant(id, name);
    record.stamp(updated_at, updated_at);
    record
}

/// Builds a post row of [`TEST_USER`].
pub fn post(id: u128, content: &str) -> Record {
    PostRow::new(Uuid::from_u128(id), TEST_USER, content).into()
}

/// Returns `record` with both stamps cleared, for comparing content only.
pub fn unstamped(record: &Record) -> Record {
    let mut record = record.clone();
    record.stamp(Timestamp::MIN, Timestamp::MIN);
    record
}

/// A temporary directory holding one server snapshot path.
///
/// The directory is removed when the fixture is dropped.
pub struct TempSnapshot {
    _dir: TempDir,
    path: PathBuf,
}

impl TempSnapshot {
    /// Creates a fixture; nothing is written until [`TempSnapshot::save`].
    pub fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("server.snapshot");
        Self { _dir: dir, path }
    }

    /// Writes `store` to the snapshot path.
    pub fn save(&self, store: &ServerStore) {
        store
            .save_snapshot(&self.path)
            .expect("Failed to save snapshot");
    }

    /// Loads the snapshot back into a fresh store.
    pub fn load(&self) -> ServerStore {
        ServerStore::load_snapshot(&self.path).expect("Failed to load snapshot")
    }

    /// Returns the snapshot path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Default for TempSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

/// Seeds `store` with `count` plants of [`TEST_USER`], one millisecond apart
/// starting at `start`.
pub fn seed_plants(store: &ServerStore, count: u128, start: Timestamp) -> Vec<Uuid> {
    (1..=count)
        .map(|n| {
            let at = Timestamp::from_millis(start.as_millis() + n as i64);
            let record = plant_at(n, &format!("plant {n}"), at);
            let id = record.id();
            store.put_row(record);
            id
        })
        .collect()
}

/// Returns every live row of [`TEST_USER`] on the server, across entities.
pub fn server_rows(server: &SyncServer) -> Vec<Record> {
    EntityKind::ALL
        .iter()
        .flat_map(|kind| server.store().rows_owned_by(*kind, TEST_USER))
        .collect()
}
