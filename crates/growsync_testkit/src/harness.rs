//! Multi-device test harness.
//!
//! Drives several devices of one account against a shared in-process
//! server and checks the replicas against the server afterwards.

use crate::fixtures::{test_device, test_server, unstamped, TestDevice, TEST_USER};
use crate::generators::DeviceOp;
use growsync_engine::{ReplicaStore, SyncCycleResult, SyncOptions};
use growsync_protocol::{EntityKind, PlantRow, Record, Timestamp};
use growsync_server::SyncServer;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// First id handed out by [`SyncHarness::create_plant`].
const FIRST_FRESH_ID: u128 = 0x1_0000;

/// Several devices of [`TEST_USER`] sharing one server.
pub struct SyncHarness {
    /// The shared server.
    pub server: Arc<SyncServer>,
    devices: Vec<TestDevice>,
    watermarks: Vec<Option<Timestamp>>,
    next_id: u128,
}

impl SyncHarness {
    /// Creates a harness with `devices` fresh devices.
    pub fn new(devices: usize) -> Self {
        let server = test_server();
        let devices: Vec<TestDevice> = (1..=devices)
            .map(|n| test_device(&server, n as u128))
            .collect();
        Self {
            watermarks: vec![None; devices.len()],
            server,
            devices,
            next_id: FIRST_FRESH_ID,
        }
    }

    /// Returns device `index`.
    pub fn device(&self, index: usize) -> &TestDevice {
        &self.devices[index]
    }

    /// Returns the number of devices.
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Creates a plant with an id no device has used yet.
    pub fn create_plant(&mut self, device: usize, name: &str) -> Uuid {
        let id = Uuid::from_u128(self.next_id);
        self.next_id += 1;
        self.devices[device]
            .replica()
            .create(PlantRow::new(id, TEST_USER, name).into())
            .expect("Failed to create plant");
        id
    }

    /// Renames a live plant on `device`.
    pub fn rename_plant(&self, device: usize, id: Uuid, name: &str) {
        let replica = self.devices[device].replica();
        let Some(Record::Plants(mut row)) = replica.get(EntityKind::Plants, id) else {
            panic!("device {device} has no plant {id}");
        };
        row.name = name.to_string();
        replica.update(row.into()).expect("Failed to update plant");
    }

    /// Deletes a plant on `device`.
    pub fn delete_plant(&self, device: usize, id: Uuid) {
        self.devices[device]
            .replica()
            .delete(EntityKind::Plants, id)
            .expect("Failed to delete plant");
    }

    /// Returns the ids of the plants live on `device`.
    pub fn plant_ids(&self, device: usize) -> Vec<Uuid> {
        self.devices[device]
            .replica()
            .list(EntityKind::Plants)
            .iter()
            .map(Record::id)
            .collect()
    }

    /// Runs one sync cycle on `device` and checks that its watermark did
    /// not move backwards.
    pub fn sync(&mut self, device: usize) -> SyncCycleResult {
        let result = self.devices[device]
            .sync(&SyncOptions::default())
            .expect("Sync cycle failed");
        let watermark = self.devices[device].replica().watermark();
        assert!(
            watermark >= self.watermarks[device],
            "watermark of device {device} went from {:?} to {:?}",
            self.watermarks[device],
            watermark
        );
        assert_eq!(watermark, result.watermark);
        self.watermarks[device] = watermark;
        result
    }

    /// Syncs every device in turn, twice, so each one sees every other
    /// device's pushes.
    pub fn sync_all(&mut self) {
        for _ in 0..2 {
            for device in 0..self.devices.len() {
                self.sync(device);
            }
        }
    }

    /// Applies one session step.
    pub fn apply(&mut self, op: &DeviceOp) {
        match op {
            DeviceOp::Create { device, name } => {
                self.create_plant(*device, name);
            }
            DeviceOp::Rename { device, pick, name } => {
                let ids = self.plant_ids(*device);
                if !ids.is_empty() {
                    self.rename_plant(*device, ids[pick % ids.len()], name);
                }
            }
            DeviceOp::Delete { device, pick } => {
                let ids = self.plant_ids(*device);
                if !ids.is_empty() {
                    self.delete_plant(*device, ids[pick % ids.len()]);
                }
            }
            DeviceOp::Sync { device } => {
                self.sync(*device);
            }
        }
    }

    /// Applies every step in order.
    pub fn run(&mut self, ops: &[DeviceOp]) {
        for op in ops {
            self.apply(op);
        }
    }

    /// Returns the content of every row live on `device`, stamps cleared.
    pub fn replica_contents(&self, device: usize) -> BTreeMap<(EntityKind, Uuid), Record> {
        let replica = self.devices[device].replica();
        EntityKind::ALL
            .iter()
            .flat_map(|kind| replica.list(*kind))
            .map(|r| ((r.kind(), r.id()), unstamped(&r)))
            .collect()
    }

    /// Returns the content of every live server row, stamps cleared.
    pub fn server_contents(&self) -> BTreeMap<(EntityKind, Uuid), Record> {
        EntityKind::ALL
            .iter()
            .flat_map(|kind| self.server.store().rows_owned_by(*kind, TEST_USER))
            .map(|r| ((r.kind(), r.id()), unstamped(&r)))
            .collect()
    }

    /// Asserts every device holds exactly the server's rows with nothing
    /// left to push.
    pub fn assert_converged(&self) {
        let expected = self.server_contents();
        for device in 0..self.devices.len() {
            assert_eq!(
                self.devices[device].replica().pending_count(),
                0,
                "device {device} still has pending changes"
            );
            assert_eq!(
                self.replica_contents(device),
                expected,
                "device {device} diverged from the server"
            );
        }
    }
}
