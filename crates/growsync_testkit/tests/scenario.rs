//! End-to-end scenarios: several devices of one account against one server.

use growsync_engine::{
    HttpTransport, LoopbackClient, MemoryReplica, RowStatus, SyncConfig, SyncEngine, SyncError,
    SyncOptions, SyncTransport,
};
use growsync_protocol::{
    Changeset, EntityKind, PlantRow, PullRequest, PushRequest, Record, Timestamp,
};
use growsync_server::{RetentionJob, SyncServer};
use growsync_testkit::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const PHONE: Uuid = Uuid::from_u128(0xa);
const TABLET: Uuid = Uuid::from_u128(0xb);

fn plant_row(record: Option<Record>) -> PlantRow {
    match record {
        Some(Record::Plants(row)) => row,
        other => panic!("expected a plant, got {other:?}"),
    }
}

#[test]
fn racing_edits_on_the_same_watermark() {
    let (server, _clock) = manual_server(Timestamp::from_millis(10_000));
    let phone = InProcessTransport::new(Arc::clone(&server));
    let tablet = InProcessTransport::new(Arc::clone(&server));
    let id = Uuid::from_u128(1);

    // The phone created P1 while offline and pushes it on its first sync.
    let mut changes = Changeset::new();
    changes.push_created(PlantRow::new(id, TEST_USER, "Blue Dream").into());
    let created = phone
        .push(&PushRequest::new(&changes, None, TEST_USER).unwrap().with_device(PHONE))
        .unwrap();
    assert_eq!(created.applied, 1);

    // The tablet's first pull lists P1 as created.
    let pulled = tablet
        .pull(&PullRequest::new(TEST_USER, None).with_device(TABLET))
        .unwrap();
    let plants = pulled.changes.get(EntityKind::Plants).unwrap();
    assert_eq!(plants.created.len(), 1);
    assert!(plants.updated.is_empty());
    let watermark = pulled.timestamp;

    // Both devices edit P1 against the same watermark; the phone lands first.
    let mut renamed = PlantRow::new(id, TEST_USER, "Blue Dream #2");
    let mut annotated = PlantRow::new(id, TEST_USER, "Blue Dream");
    annotated.notes = Some("topped on day 30".into());

    let mut changes = Changeset::new();
    changes.push_updated(renamed.clone().into());
    let first = phone
        .push(
            &PushRequest::new(&changes, Some(watermark), TEST_USER)
                .unwrap()
                .with_device(PHONE),
        )
        .unwrap();
    assert_eq!(first.applied, 1);

    let mut changes = Changeset::new();
    changes.push_updated(annotated.into());
    let second = tablet
        .push(
            &PushRequest::new(&changes, Some(watermark), TEST_USER)
                .unwrap()
                .with_device(TABLET),
        )
        .unwrap();
    assert!(second.success);
    assert_eq!(second.applied, 0);
    assert_eq!(second.skipped, 1);

    let stored = plant_row(server.store().row(EntityKind::Plants, id));
    assert_eq!(stored.name, "Blue Dream #2");
    assert_eq!(stored.notes, None);

    // The tablet learns the authoritative value on its next pull.
    let pulled = tablet
        .pull(&PullRequest::new(TEST_USER, Some(watermark)).with_device(TABLET))
        .unwrap();
    let plants = pulled.changes.get(EntityKind::Plants).unwrap();
    assert!(plants.created.is_empty());
    renamed.created_at = stored.created_at;
    renamed.updated_at = stored.updated_at;
    assert_eq!(plants.updated, vec![Record::from(renamed)]);
}

#[test]
fn losing_device_converges_through_the_engine() {
    let mut harness = SyncHarness::new(2);
    let id = harness.create_plant(0, "Blue Dream");
    harness.sync(0);

    let first = harness.sync(1);
    assert_eq!(first.pulled, 1);
    assert_eq!(first.merged.upserted, 1);

    harness.rename_plant(0, id, "Blue Dream #2");
    let tablet = harness.device(1).replica();
    let mut annotated = plant_row(tablet.get(EntityKind::Plants, id));
    annotated.notes = Some("topped on day 30".into());
    tablet.update(annotated.into()).unwrap();

    harness.sync(0);
    let lost = harness.sync(1);
    assert_eq!(lost.pulled, 1);
    assert_eq!(lost.pushed, 0);

    harness.sync_all();
    harness.assert_converged();
    let row = plant_row(harness.device(1).replica().get(EntityKind::Plants, id));
    assert_eq!(row.name, "Blue Dream #2");
    assert_eq!(row.notes, None);
}

#[test]
fn deletion_beats_a_stale_edit() {
    let mut harness = SyncHarness::new(2);
    let id = harness.create_plant(0, "Gorilla Glue");
    harness.sync_all();

    harness.delete_plant(0, id);
    harness.rename_plant(1, id, "GG4");
    harness.sync(0);
    harness.sync(1);
    harness.sync_all();

    harness.assert_converged();
    assert!(harness.server_contents().is_empty());
    assert!(server_rows(&harness.server).is_empty());
    assert!(harness
        .server
        .store()
        .tombstone(EntityKind::Plants, id)
        .is_some());
}

#[test]
fn offline_edits_wait_for_the_network() {
    let server = test_server();
    let phone = test_device(&server, 1);
    phone.transport().set_online(false);

    phone.replica().create(plant(7, "Northern Lights")).unwrap();
    let err = phone.sync(&SyncOptions::default()).unwrap_err();
    assert!(matches!(err, SyncError::NotConnected));
    assert_eq!(phone.transport().request_count(), 0);
    assert_eq!(
        phone.replica().status(EntityKind::Plants, Uuid::from_u128(7)),
        Some(RowStatus::Created)
    );

    phone.transport().set_online(true);
    let result = phone.sync(&SyncOptions::default()).unwrap();
    assert_eq!(result.pushed, 1);
    assert_eq!(server_rows(&server).len(), 1);
    assert_eq!(phone.replica().pending_count(), 0);
}

#[test]
fn wire_and_in_process_devices_agree() {
    let server = test_server();
    let config = SyncConfig::new(TEST_USER, PHONE, "http://sync.growsync.test/");
    let client = LoopbackClient::new(WireServer(Arc::clone(&server)));
    let transport = HttpTransport::from_config(&config, client);
    let phone = SyncEngine::new(config, transport, MemoryReplica::in_memory());
    let tablet = test_device(&server, 2);

    phone.replica().create(post(3, "first harvest")).unwrap();
    phone.sync(&SyncOptions::default()).unwrap();

    let result = tablet.sync(&SyncOptions::default()).unwrap();
    assert_eq!(result.pulled, 1);
    assert!(tablet
        .replica()
        .get(EntityKind::Posts, Uuid::from_u128(3))
        .is_some());
}

#[test]
fn server_restart_from_snapshot_keeps_history() {
    let server = test_server();
    let phone = test_device(&server, 1);
    phone.replica().create(plant(1, "Basil")).unwrap();
    phone.replica().create(plant(2, "Mint")).unwrap();
    phone.sync(&SyncOptions::default()).unwrap();
    phone
        .replica()
        .delete(EntityKind::Plants, Uuid::from_u128(2))
        .unwrap();
    phone.sync(&SyncOptions::default()).unwrap();

    let snapshot = TempSnapshot::new();
    snapshot.save(server.store());
    let restarted = Arc::new(SyncServer::with_store(
        server.config().clone(),
        Arc::new(snapshot.load()),
    ));

    let tablet = test_device(&restarted, 2);
    tablet.sync(&SyncOptions::default()).unwrap();
    let ids: Vec<Uuid> = tablet
        .replica()
        .list(EntityKind::Plants)
        .iter()
        .map(Record::id)
        .collect();
    assert_eq!(ids, vec![Uuid::from_u128(1)]);
    let tombstone = restarted
        .store()
        .tombstone(EntityKind::Plants, Uuid::from_u128(2))
        .unwrap();

    // Writes after the restart are stamped after everything restored.
    assert!(restarted.store().now() > tombstone.deleted_at);
}

#[test]
fn pruned_tombstones_do_not_disturb_fresh_devices() {
    let server = test_server();
    let phone = test_device(&server, 1);
    phone.replica().create(plant(1, "Basil")).unwrap();
    phone.sync(&SyncOptions::default()).unwrap();
    phone
        .replica()
        .delete(EntityKind::Plants, Uuid::from_u128(1))
        .unwrap();
    phone.sync(&SyncOptions::default()).unwrap();

    std::thread::sleep(Duration::from_millis(5));
    let pruned = RetentionJob::run_once(server.store(), Duration::from_millis(1));
    assert_eq!(pruned, 1);

    let tablet = test_device(&server, 2);
    let result = tablet.sync(&SyncOptions::default()).unwrap();
    assert_eq!(result.pulled, 0);
    assert!(tablet.replica().list(EntityKind::Plants).is_empty());
}

#[test]
fn forced_resync_repairs_a_lost_replica() {
    let mut harness = SyncHarness::new(1);
    harness.create_plant(0, "Basil");
    harness.create_plant(0, "Mint");
    harness.sync(0);

    let fresh = test_device(&harness.server, 1);
    let result = fresh.sync(&SyncOptions::full_resync()).unwrap();
    assert_eq!(result.pulled, 2);
    assert_eq!(fresh.replica().list(EntityKind::Plants).len(), 2);
    assert_eq!(fresh.replica().pending_count(), 0);
}
