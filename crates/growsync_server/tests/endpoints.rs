//! End-to-end tests of the sync endpoints over CBOR bodies.

use growsync_protocol::{
    Changeset, ConflictCheckRequest, ConflictCheckResponse, EntityKind, ErrorBody, PlantRow,
    PullRequest, PullResponse, PushRequest, PushResponse, Record, ResolutionAction, Timestamp,
    CONFLICT_PATH, PULL_PATH, PUSH_PATH,
};
use growsync_server::{
    AuthConfig, ManualClock, Principal, ServerConfig, ServerStore, SyncServer, TokenValidator,
    Tombstone,
};
use std::sync::Arc;
use uuid::Uuid;

const USER: Uuid = Uuid::from_u128(0x42);
const HOUR: i64 = 3_600_000;

fn server_at(start: i64) -> SyncServer {
    let clock = Arc::new(ManualClock::new(Timestamp::from_millis(start)));
    SyncServer::with_store(
        ServerConfig::default(),
        Arc::new(ServerStore::with_clock(clock)),
    )
}

fn post_pull(server: &SyncServer, request: &PullRequest) -> PullResponse {
    let (status, body) = server.handle_post(PULL_PATH, None, &request.encode().unwrap());
    assert_eq!(status, 200);
    PullResponse::decode(&body).unwrap()
}

fn post_push(server: &SyncServer, request: &PushRequest) -> PushResponse {
    let (status, body) = server.handle_post(PUSH_PATH, None, &request.encode().unwrap());
    assert_eq!(status, 200);
    PushResponse::decode(&body).unwrap()
}

fn post_conflict(server: &SyncServer, id: Uuid) -> ConflictCheckResponse {
    let request = ConflictCheckRequest::new(EntityKind::Plants, id, Timestamp::MIN).with_user(USER);
    let (status, body) = server.handle_post(CONFLICT_PATH, None, &request.encode().unwrap());
    assert_eq!(status, 200);
    ConflictCheckResponse::decode(&body).unwrap()
}

fn seed_overlap(server: &SyncServer, updated_at: i64, deleted_at: i64) -> Uuid {
    let id = Uuid::from_u128(7);
    let mut record: Record = PlantRow::new(id, USER, "R").into();
    record.stamp(Timestamp::from_millis(0), Timestamp::from_millis(updated_at));
    server.store().put_row(record);
    server
        .store()
        .put_tombstone(
            EntityKind::Plants,
            Tombstone {
                id,
                user_id: USER,
                deleted_at: Timestamp::from_millis(deleted_at),
            },
        )
        .unwrap();
    id
}

#[test]
fn modification_newer_than_deletion_is_kept() {
    let server = server_at(20 * HOUR);
    let id = seed_overlap(&server, 10 * HOUR, 9 * HOUR + HOUR / 2);

    let response = post_conflict(&server, id);
    assert_eq!(response.resolution_action, ResolutionAction::KeepModified);
    assert!(server.store().row(EntityKind::Plants, id).is_some());
    assert!(server.store().tombstone(EntityKind::Plants, id).is_none());
}

#[test]
fn deletion_newer_than_modification_wins() {
    let server = server_at(20 * HOUR);
    let id = seed_overlap(&server, 10 * HOUR, 10 * HOUR + HOUR / 2);

    let response = post_conflict(&server, id);
    assert_eq!(response.resolution_action, ResolutionAction::ConfirmDeletion);
    assert!(server.store().row(EntityKind::Plants, id).is_none());
    assert!(server.store().tombstone(EntityKind::Plants, id).is_some());
}

#[test]
fn deleted_row_is_not_resurrected_by_pull() {
    let server = server_at(HOUR);
    let id = Uuid::from_u128(1);

    let mut created = Changeset::new();
    created.push_created(PlantRow::new(id, USER, "basil").into());
    post_push(&server, &PushRequest::new(&created, None, USER).unwrap());

    let first = post_pull(&server, &PullRequest::new(USER, None));

    let mut deleted = Changeset::new();
    deleted.push_deleted(EntityKind::Plants, id);
    let response = post_push(
        &server,
        &PushRequest::new(&deleted, Some(first.timestamp), USER).unwrap(),
    );
    assert_eq!(response.applied, 1);

    for since in [None, Some(Timestamp::MIN), Some(first.timestamp)] {
        let pulled = post_pull(&server, &PullRequest::new(USER, since));
        let plants = pulled.changes.get(EntityKind::Plants).unwrap();
        assert!(plants.created.iter().chain(&plants.updated).all(|r| r.id() != id));
    }

    let pulled = post_pull(&server, &PullRequest::new(USER, Some(first.timestamp)));
    assert_eq!(pulled.changes.get(EntityKind::Plants).unwrap().deleted, vec![id]);
}

#[test]
fn injected_entity_name_is_a_validation_error() {
    let server = server_at(HOUR);
    let mut changes = Changeset::new();
    changes.push_created(PlantRow::new(Uuid::from_u128(1), USER, "basil").into());
    let mut request = PushRequest::new(&changes, None, USER).unwrap();
    let rows = request.changes.0.remove("plants").unwrap();
    request
        .changes
        .0
        .insert("plants\"; DELETE FROM plants; --".into(), rows);

    let (status, body) = server.handle_post(PUSH_PATH, None, &request.encode().unwrap());
    assert_eq!(status, 400);
    assert!(ErrorBody::decode(&body).unwrap().error.contains("validation"));
    assert!(server
        .store()
        .rows_owned_by(EntityKind::Plants, USER)
        .is_empty());
}

#[test]
fn tokens_gate_every_endpoint() {
    let secret = b"integration-secret".to_vec();
    let server = SyncServer::new(ServerConfig::default().with_auth(secret.clone()));
    let validator = TokenValidator::new(AuthConfig::new(secret));
    let token = validator.create_token(&Principal::User(USER)).unwrap();
    let body = PullRequest::new(USER, None).encode().unwrap();

    assert_eq!(server.handle_post(PULL_PATH, None, &body).0, 401);
    assert_eq!(server.handle_post(PULL_PATH, Some(b"forged"), &body).0, 401);
    assert_eq!(server.handle_post(PULL_PATH, Some(&token), &body).0, 200);

    let other = PullRequest::new(Uuid::from_u128(1), None).encode().unwrap();
    assert_eq!(server.handle_post(PULL_PATH, Some(&token), &other).0, 403);
}
