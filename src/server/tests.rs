//! Server-core tests: routing, attribute operations, events, eviction

use super::core::{Action, ServerCore};
use super::{Category, ServerConfig, ServerEvent};
use crate::accessory::{catalog, Accessory, CharacteristicChange, Database, Service, ServiceHandler, Value};
use crate::clock::ManualClock;
use crate::protocol::http::{Headers, HttpRequest, Method};
use crate::protocol::pairing::{states, TransportKeys};
use crate::protocol::tlv::{error_codes, methods, TlvDecoder, TlvEncoder, TlvType};
use crate::storage::{provision_setup_code, ControllerRecord, MemoryStore};
use crate::transport::SecureSession;
use bytes::BytesMut;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const LAMP_ON: (u32, u32) = (2, 9);
const LAMP_BRIGHTNESS: (u32, u32) = (2, 10);

fn test_config() -> ServerConfig {
    ServerConfig {
        name: "Test Bridge".into(),
        model: "T-1000".into(),
        category: Category::Bridge,
        port: 0,
        max_connections: 8,
        advertise: false,
    }
}

fn test_database() -> Database {
    let mut db = Database::new();

    let mut bridge = Accessory::new();
    bridge.add_service(catalog::accessory_information(
        "Bridge", "Acme", "B100", "0001", "1.0.0",
    ));
    bridge.add_service(catalog::protocol_information());
    db.add_accessory(bridge);

    let mut lamp = Accessory::new();
    lamp.add_service(catalog::accessory_information(
        "Lamp", "Acme", "L200", "0002", "1.0.0",
    ));
    lamp.add_service(
        Service::new(catalog::LIGHT_BULB)
            .with(catalog::on(false))
            .with(catalog::brightness(100))
            .primary(),
    );
    db.add_accessory(lamp);

    db
}

async fn test_core() -> (ServerCore, ManualClock) {
    test_core_with_db(test_database()).await
}

async fn test_core_with_db(db: Database) -> (ServerCore, ManualClock) {
    let clock = ManualClock::new();
    let mut store = Box::new(MemoryStore::new());
    provision_setup_code(store.as_mut(), "46637726")
        .await
        .unwrap();
    let core = ServerCore::new(test_config(), db, store, Box::new(clock.clone()))
        .await
        .unwrap();
    (core, clock)
}

fn remote(n: u16) -> SocketAddr {
    format!("192.168.1.{}:5100", 10 + n).parse().unwrap()
}

fn request(method: Method, uri: &str, body: Vec<u8>) -> HttpRequest {
    HttpRequest {
        method,
        uri: uri.to_string(),
        headers: Headers::new(),
        body,
    }
}

/// Split an HTTP response into status code and body.
fn parse_response(bytes: &[u8]) -> (u16, Vec<u8>) {
    let text = String::from_utf8_lossy(bytes);
    let head_end = text.find("\r\n\r\n").expect("complete head");
    let status: u16 = text
        .split_whitespace()
        .nth(1)
        .expect("status code")
        .parse()
        .unwrap();
    (status, bytes[head_end + 4..].to_vec())
}

fn json_body(bytes: &[u8]) -> serde_json::Value {
    let (_, body) = parse_response(bytes);
    serde_json::from_slice(&body).unwrap()
}

/// Mark a slot as a verified session so attribute endpoints open up.
fn force_verify(core: &mut ServerCore, slot: usize, controller_id: &[u8]) {
    let conn = core.slots[slot].as_mut().unwrap();
    conn.verified = Some(controller_id.to_vec());
}

/// Give a slot a secure session and return the controller's mirror of it.
fn force_secure(core: &mut ServerCore, slot: usize) -> SecureSession {
    let conn = core.slots[slot].as_mut().unwrap();
    conn.secure = Some(SecureSession::new(&TransportKeys {
        tx_key: [3u8; 32],
        rx_key: [4u8; 32],
    }));
    SecureSession::new(&TransportKeys {
        tx_key: [4u8; 32],
        rx_key: [3u8; 32],
    })
}

fn enroll_admin(core: &mut ServerCore, id: &[u8]) {
    core.controllers
        .add(ControllerRecord {
            pairing_id: id.to_vec(),
            ltpk: [7u8; 32],
            admin: true,
        })
        .unwrap();
}

// ---- connection pool behavior ----

#[tokio::test]
async fn accept_assigns_lowest_free_slot() {
    let (mut core, _) = test_core().await;
    let (slot_a, _) = core.accept(remote(0));
    let (slot_b, _) = core.accept(remote(1));
    assert_eq!((slot_a, slot_b), (0, 1));

    core.connection_closed(0);
    let (slot_c, _) = core.accept(remote(2));
    assert_eq!(slot_c, 0);
}

#[tokio::test]
async fn full_table_evicts_one_and_clears_its_state() {
    let (mut core, _) = test_core().await;
    for n in 0..8 {
        core.accept(remote(n));
    }
    // Every slot subscribes to the lamp's On characteristic.
    for slot in 0..8 {
        core.db
            .find_mut(LAMP_ON.0, LAMP_ON.1)
            .unwrap()
            .load_update(None, Some(&json!(true)), slot, 0);
    }

    let (new_slot, actions) = core.accept(remote(9));
    let victims: Vec<usize> = actions
        .iter()
        .filter_map(|a| match a {
            Action::Close { slot } => Some(*slot),
            _ => None,
        })
        .collect();

    assert_eq!(victims, vec![new_slot]);
    assert!(core.slots[new_slot].is_some());
    // The evicted slot's subscriptions are gone; the rest survive.
    for slot in 0..8 {
        let subscribed = core
            .db
            .find(LAMP_ON.0, LAMP_ON.1)
            .unwrap()
            .subscribed(slot);
        assert_eq!(subscribed, slot != new_slot);
    }
}

// ---- attribute reads ----

#[tokio::test]
async fn unverified_attribute_access_is_refused() {
    let (mut core, _) = test_core().await;
    let (slot, _) = core.accept(remote(0));

    let outcome = core
        .route(slot, &request(Method::Get, "/accessories", vec![]))
        .await;
    let (status, _) = parse_response(&outcome.response);
    assert_eq!(status, 470);
    assert!(outcome.close);
}

#[tokio::test]
async fn get_accessories_returns_tree() {
    let (mut core, _) = test_core().await;
    let (slot, _) = core.accept(remote(0));
    force_verify(&mut core, slot, b"ctrl-1");

    let outcome = core
        .route(slot, &request(Method::Get, "/accessories", vec![]))
        .await;
    let (status, _) = parse_response(&outcome.response);
    assert_eq!(status, 200);

    let tree = json_body(&outcome.response);
    let accessories = tree["accessories"].as_array().unwrap();
    assert_eq!(accessories.len(), 2);
    assert_eq!(accessories[0]["aid"], json!(1));
    assert_eq!(accessories[1]["aid"], json!(2));

    // Repeated reads are byte-identical.
    let again = core
        .route(slot, &request(Method::Get, "/accessories", vec![]))
        .await;
    assert_eq!(outcome.response, again.response);
}

#[tokio::test]
async fn get_characteristics_mixed_statuses() {
    let (mut core, _) = test_core().await;
    let (slot, _) = core.accept(remote(0));
    force_verify(&mut core, slot, b"ctrl-1");

    // 2.9 exists; 2.2 is the lamp's write-only Identify; 9.9 is unknown.
    let outcome = core
        .route(
            slot,
            &request(Method::Get, "/characteristics?id=2.9,2.2,9.9", vec![]),
        )
        .await;
    let (status, _) = parse_response(&outcome.response);
    assert_eq!(status, 207);

    let body = json_body(&outcome.response);
    let objects = body["characteristics"].as_array().unwrap();
    assert_eq!(objects[0]["status"], json!(0));
    assert_eq!(objects[0]["value"], json!(false));
    assert_eq!(objects[1]["status"], json!(-70_405));
    assert_eq!(objects[2]["status"], json!(-70_409));
}

#[tokio::test]
async fn get_characteristics_projection_flags() {
    let (mut core, _) = test_core().await;
    let (slot, _) = core.accept(remote(0));
    force_verify(&mut core, slot, b"ctrl-1");

    let outcome = core
        .route(
            slot,
            &request(
                Method::Get,
                "/characteristics?id=2.9&meta=1&type=1&perms=1&ev=1",
                vec![],
            ),
        )
        .await;
    let body = json_body(&outcome.response);
    let object = &body["characteristics"][0];

    assert_eq!(object["aid"], json!(2));
    assert_eq!(object["type"], json!("25"));
    assert_eq!(object["format"], json!("bool"));
    assert_eq!(object["perms"], json!(["pr", "pw", "ev"]));
    assert_eq!(object["ev"], json!(false));
}

// ---- attribute writes ----

struct CountingHandler {
    calls: Arc<AtomicUsize>,
    accept: bool,
}

impl ServiceHandler for CountingHandler {
    fn update(&mut self, changes: &[CharacteristicChange]) -> bool {
        assert!(!changes.is_empty());
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.accept
    }
}

fn database_with_handler(accept: bool, calls: Arc<AtomicUsize>) -> Database {
    let mut db = Database::new();

    let mut bridge = Accessory::new();
    bridge.add_service(catalog::accessory_information(
        "Bridge", "Acme", "B100", "0001", "1.0.0",
    ));
    bridge.add_service(catalog::protocol_information());
    db.add_accessory(bridge);

    let mut lamp = Accessory::new();
    lamp.add_service(catalog::accessory_information(
        "Lamp", "Acme", "L200", "0002", "1.0.0",
    ));
    lamp.add_service(
        Service::new(catalog::LIGHT_BULB)
            .with(catalog::on(false))
            .with(catalog::brightness(100))
            .primary()
            .with_handler(Box::new(CountingHandler { calls, accept })),
    );
    db.add_accessory(lamp);
    db
}

#[tokio::test]
async fn put_characteristics_commits_and_calls_handler_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let (mut core, _) = test_core_with_db(database_with_handler(true, calls.clone())).await;
    let (slot, _) = core.accept(remote(0));
    force_verify(&mut core, slot, b"ctrl-1");

    let body = json!({ "characteristics": [
        { "aid": 2, "iid": 9, "value": true },
        { "aid": 2, "iid": 10, "value": 25 },
    ]})
    .to_string()
    .into_bytes();

    let outcome = core
        .route(slot, &request(Method::Put, "/characteristics", body))
        .await;
    let (status, response_body) = parse_response(&outcome.response);
    assert_eq!(status, 204);
    assert!(response_body.is_empty());

    // Both writes hit one service: exactly one update() call.
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        core.db.find(2, 9).unwrap().value(),
        &Value::Bool(true)
    );
    assert_eq!(
        core.db.find(2, 10).unwrap().value(),
        &Value::Int(25)
    );
    assert_eq!(outcome.notify, vec![LAMP_ON, LAMP_BRIGHTNESS]);
}

#[tokio::test]
async fn put_characteristics_rolls_back_when_handler_refuses() {
    let calls = Arc::new(AtomicUsize::new(0));
    let (mut core, _) = test_core_with_db(database_with_handler(false, calls)).await;
    let (slot, _) = core.accept(remote(0));
    force_verify(&mut core, slot, b"ctrl-1");

    let body = json!({ "characteristics": [{ "aid": 2, "iid": 9, "value": true }]})
        .to_string()
        .into_bytes();
    let outcome = core
        .route(slot, &request(Method::Put, "/characteristics", body))
        .await;

    let (status, _) = parse_response(&outcome.response);
    assert_eq!(status, 207);
    let report = json_body(&outcome.response);
    assert_eq!(report["characteristics"][0]["status"], json!(-70_402));

    assert_eq!(core.db.find(2, 9).unwrap().value(), &Value::Bool(false));
    assert!(outcome.notify.is_empty());
}

#[tokio::test]
async fn put_characteristics_reports_per_object_status() {
    let (mut core, _) = test_core().await;
    let (slot, _) = core.accept(remote(0));
    force_verify(&mut core, slot, b"ctrl-1");

    // One good write, one read-only target, one unknown.
    let body = json!({ "characteristics": [
        { "aid": 2, "iid": 9, "value": true },
        { "aid": 1, "iid": 3, "value": "Evil" },
        { "aid": 9, "iid": 9, "value": 1 },
    ]})
    .to_string()
    .into_bytes();

    let outcome = core
        .route(slot, &request(Method::Put, "/characteristics", body))
        .await;
    let (status, _) = parse_response(&outcome.response);
    assert_eq!(status, 207);

    let report = json_body(&outcome.response);
    let objects = report["characteristics"].as_array().unwrap();
    assert_eq!(objects[0]["status"], json!(0));
    assert_eq!(objects[1]["status"], json!(-70_404));
    assert_eq!(objects[2]["status"], json!(-70_409));

    // The good write still committed.
    assert_eq!(core.db.find(2, 9).unwrap().value(), &Value::Bool(true));
}

#[tokio::test]
async fn double_put_same_value_is_idempotent() {
    let (mut core, _) = test_core().await;
    let (slot, _) = core.accept(remote(0));
    force_verify(&mut core, slot, b"ctrl-1");

    let body = json!({ "characteristics": [{ "aid": 2, "iid": 9, "value": true }]})
        .to_string()
        .into_bytes();

    for _ in 0..2 {
        let outcome = core
            .route(slot, &request(Method::Put, "/characteristics", body.clone()))
            .await;
        let (status, _) = parse_response(&outcome.response);
        assert_eq!(status, 204);
        assert_eq!(core.db.find(2, 9).unwrap().value(), &Value::Bool(true));
    }
}

#[tokio::test]
async fn put_requires_value_or_ev() {
    let (mut core, _) = test_core().await;
    let (slot, _) = core.accept(remote(0));
    force_verify(&mut core, slot, b"ctrl-1");

    let body = json!({ "characteristics": [{ "aid": 2, "iid": 9 }]})
        .to_string()
        .into_bytes();
    let outcome = core
        .route(slot, &request(Method::Put, "/characteristics", body))
        .await;
    let (status, _) = parse_response(&outcome.response);
    assert_eq!(status, 400);
}

// ---- events ----

#[tokio::test]
async fn subscribed_connection_receives_event_frames() {
    let (mut core, _) = test_core().await;
    let (subscriber, _) = core.accept(remote(0));
    let (writer, _) = core.accept(remote(1));
    force_verify(&mut core, subscriber, b"ctrl-1");
    force_verify(&mut core, writer, b"ctrl-2");
    let mut subscriber_session = force_secure(&mut core, subscriber);
    force_secure(&mut core, writer);

    // Subscribe slot 0 to the lamp's On characteristic.
    let body = json!({ "characteristics": [{ "aid": 2, "iid": 9, "ev": true }]})
        .to_string()
        .into_bytes();
    let outcome = core
        .route(subscriber, &request(Method::Put, "/characteristics", body))
        .await;
    let (status, _) = parse_response(&outcome.response);
    assert_eq!(status, 204);

    // Controller on the other slot writes the value.
    let body = json!({ "characteristics": [{ "aid": 2, "iid": 9, "value": true }]})
        .to_string()
        .into_bytes();
    let outcome = core
        .route(writer, &request(Method::Put, "/characteristics", body))
        .await;
    let frames = core.notify_subscribers(&outcome.notify, Some(writer));

    let sends: Vec<(usize, Vec<u8>)> = frames
        .into_iter()
        .filter_map(|a| match a {
            Action::Send { slot, bytes } => Some((slot, bytes)),
            _ => None,
        })
        .collect();
    assert_eq!(sends.len(), 1);
    assert_eq!(sends[0].0, subscriber);

    let mut wire = BytesMut::from(&sends[0].1[..]);
    let plain = subscriber_session.decrypt(&mut wire).unwrap();
    let text = String::from_utf8(plain).unwrap();
    assert!(text.starts_with("EVENT/1.0 200 OK\r\n"));
    assert!(text.contains(r#"{"characteristics":[{"aid":2,"iid":9,"value":true}]}"#));
}

#[tokio::test]
async fn set_value_notifies_all_subscribers() {
    let (mut core, _) = test_core().await;
    let (subscriber, _) = core.accept(remote(0));
    force_verify(&mut core, subscriber, b"ctrl-1");
    let mut mirror = force_secure(&mut core, subscriber);

    core.db
        .find_mut(LAMP_ON.0, LAMP_ON.1)
        .unwrap()
        .load_update(None, Some(&json!(true)), subscriber, 0);

    let actions = core.set_value(LAMP_ON.0, LAMP_ON.1, Value::Bool(true));
    let send = actions.iter().find_map(|a| match a {
        Action::Send { bytes, .. } => Some(bytes.clone()),
        _ => None,
    });

    let mut wire = BytesMut::from(&send.unwrap()[..]);
    let plain = mirror.decrypt(&mut wire).unwrap();
    assert!(String::from_utf8(plain)
        .unwrap()
        .contains(r#""value":true"#));

    assert!(actions.iter().any(|a| matches!(
        a,
        Action::Emit(ServerEvent::CharacteristicChanged { aid: 2, iid: 9 })
    )));
}

#[tokio::test]
async fn unsubscribed_connections_get_no_events() {
    let (mut core, _) = test_core().await;
    let (bystander, _) = core.accept(remote(0));
    force_verify(&mut core, bystander, b"ctrl-1");
    force_secure(&mut core, bystander);

    let actions = core.set_value(LAMP_ON.0, LAMP_ON.1, Value::Bool(true));
    assert!(!actions
        .iter()
        .any(|a| matches!(a, Action::Send { .. })));
}

// ---- timed writes ----

#[tokio::test]
async fn timed_write_inside_ttl_succeeds() {
    let (mut core, clock) = test_core().await;
    let (slot, _) = core.accept(remote(0));
    force_verify(&mut core, slot, b"ctrl-1");

    let prepare = json!({ "ttl": 1000, "pid": 42 }).to_string().into_bytes();
    let outcome = core
        .route(slot, &request(Method::Put, "/prepare", prepare))
        .await;
    assert_eq!(json_body(&outcome.response), json!({ "status": 0 }));

    clock.advance(500);
    let body = json!({ "characteristics": [{ "aid": 2, "iid": 9, "value": true, "pid": 42 }]})
        .to_string()
        .into_bytes();
    let outcome = core
        .route(slot, &request(Method::Put, "/characteristics", body))
        .await;
    let (status, _) = parse_response(&outcome.response);
    assert_eq!(status, 204);
}

#[tokio::test]
async fn expired_timed_write_rejected() {
    let (mut core, clock) = test_core().await;
    let (slot, _) = core.accept(remote(0));
    force_verify(&mut core, slot, b"ctrl-1");

    let prepare = json!({ "ttl": 1000, "pid": 42 }).to_string().into_bytes();
    core.route(slot, &request(Method::Put, "/prepare", prepare))
        .await;

    clock.advance(1500);
    let body = json!({ "characteristics": [{ "aid": 2, "iid": 9, "value": true, "pid": 42 }]})
        .to_string()
        .into_bytes();
    let outcome = core
        .route(slot, &request(Method::Put, "/characteristics", body))
        .await;

    let (status, _) = parse_response(&outcome.response);
    assert_eq!(status, 207);
    let report = json_body(&outcome.response);
    assert_eq!(report["characteristics"][0]["status"], json!(-70_410));
    assert_eq!(core.db.find(2, 9).unwrap().value(), &Value::Bool(false));
}

#[tokio::test]
async fn unknown_pid_rejected() {
    let (mut core, _) = test_core().await;
    let (slot, _) = core.accept(remote(0));
    force_verify(&mut core, slot, b"ctrl-1");

    let body = json!({ "characteristics": [{ "aid": 2, "iid": 9, "value": true, "pid": 7 }]})
        .to_string()
        .into_bytes();
    let outcome = core
        .route(slot, &request(Method::Put, "/characteristics", body))
        .await;
    let report = json_body(&outcome.response);
    assert_eq!(report["characteristics"][0]["status"], json!(-70_410));
}

// ---- pairing management ----

#[tokio::test]
async fn identify_only_while_unpaired() {
    let (mut core, _) = test_core().await;
    let (slot, _) = core.accept(remote(0));

    let outcome = core
        .route(slot, &request(Method::Post, "/identify", vec![]))
        .await;
    let (status, _) = parse_response(&outcome.response);
    assert_eq!(status, 204);
    assert!(outcome
        .emit
        .iter()
        .any(|e| matches!(e, ServerEvent::IdentifyRequested)));

    enroll_admin(&mut core, b"ctrl-1");
    let outcome = core
        .route(slot, &request(Method::Post, "/identify", vec![]))
        .await;
    let (status, _) = parse_response(&outcome.response);
    assert_eq!(status, 400);
    assert_eq!(json_body(&outcome.response), json!({ "status": -70_401 }));
}

#[tokio::test]
async fn pairings_require_admin() {
    let (mut core, _) = test_core().await;
    enroll_admin(&mut core, b"admin-1");
    core.controllers
        .add(ControllerRecord {
            pairing_id: b"peon-1".to_vec(),
            ltpk: [8u8; 32],
            admin: false,
        })
        .unwrap();

    let (slot, _) = core.accept(remote(0));
    force_verify(&mut core, slot, b"peon-1");

    let body = TlvEncoder::new()
        .add_state(states::M1)
        .add_u8(TlvType::Method, methods::LIST_PAIRINGS)
        .build();
    let outcome = core
        .route(slot, &request(Method::Post, "/pairings", body))
        .await;

    let (_, tlv_bytes) = parse_response(&outcome.response);
    let tlv = TlvDecoder::decode(&tlv_bytes).unwrap();
    assert_eq!(tlv.get_u8(TlvType::Error), Some(error_codes::AUTHENTICATION));
}

#[tokio::test]
async fn add_and_list_pairings() {
    let (mut core, _) = test_core().await;
    enroll_admin(&mut core, b"admin-1");
    let (slot, _) = core.accept(remote(0));
    force_verify(&mut core, slot, b"admin-1");

    let body = TlvEncoder::new()
        .add_state(states::M1)
        .add_u8(TlvType::Method, methods::ADD_PAIRING)
        .add(TlvType::Identifier, b"second-controller")
        .add(TlvType::PublicKey, &[9u8; 32])
        .add_u8(TlvType::Permissions, 0)
        .build();
    let outcome = core
        .route(slot, &request(Method::Post, "/pairings", body))
        .await;
    let (_, tlv_bytes) = parse_response(&outcome.response);
    let tlv = TlvDecoder::decode(&tlv_bytes).unwrap();
    assert_eq!(tlv.get_state().unwrap(), states::M2);
    assert_eq!(tlv.get_u8(TlvType::Error), None);
    assert_eq!(core.controllers.iter().count(), 2);

    let body = TlvEncoder::new()
        .add_state(states::M1)
        .add_u8(TlvType::Method, methods::LIST_PAIRINGS)
        .build();
    let outcome = core
        .route(slot, &request(Method::Post, "/pairings", body))
        .await;
    let (_, tlv_bytes) = parse_response(&outcome.response);
    // Two identifiers separated by 0xFF.
    assert_eq!(
        tlv_bytes
            .iter()
            .filter(|&&b| b == 0xFF)
            .count(),
        1
    );
}

#[tokio::test]
async fn add_pairing_with_conflicting_key_rejected() {
    let (mut core, _) = test_core().await;
    enroll_admin(&mut core, b"admin-1");
    let (slot, _) = core.accept(remote(0));
    force_verify(&mut core, slot, b"admin-1");

    let body = TlvEncoder::new()
        .add_state(states::M1)
        .add_u8(TlvType::Method, methods::ADD_PAIRING)
        .add(TlvType::Identifier, b"admin-1")
        .add(TlvType::PublicKey, &[9u8; 32]) // admin-1's real key is [7; 32]
        .add_u8(TlvType::Permissions, 1)
        .build();
    let outcome = core
        .route(slot, &request(Method::Post, "/pairings", body))
        .await;
    let (_, tlv_bytes) = parse_response(&outcome.response);
    let tlv = TlvDecoder::decode(&tlv_bytes).unwrap();
    assert_eq!(tlv.get_u8(TlvType::Error), Some(error_codes::UNKNOWN));
}

#[tokio::test]
async fn removing_last_admin_unpairs_device() {
    let (mut core, _) = test_core().await;
    enroll_admin(&mut core, b"admin-1");
    core.controllers
        .add(ControllerRecord {
            pairing_id: b"peon-1".to_vec(),
            ltpk: [8u8; 32],
            admin: false,
        })
        .unwrap();

    let (admin_slot, _) = core.accept(remote(0));
    let (other_slot, _) = core.accept(remote(1));
    force_verify(&mut core, admin_slot, b"admin-1");
    force_verify(&mut core, other_slot, b"peon-1");

    let body = TlvEncoder::new()
        .add_state(states::M1)
        .add_u8(TlvType::Method, methods::REMOVE_PAIRING)
        .add(TlvType::Identifier, b"admin-1")
        .build();
    let outcome = core
        .route(admin_slot, &request(Method::Post, "/pairings", body))
        .await;

    assert!(outcome.close_all);
    assert!(outcome.txt_refresh);
    assert!(outcome.emit.iter().any(|e| matches!(e, ServerEvent::Unpaired)));
    // The whole table is gone, not just the admin.
    assert_eq!(core.controllers.iter().count(), 0);
    assert!(!core.controllers.is_paired());
}

#[tokio::test]
async fn removing_secondary_controller_keeps_pairing() {
    let (mut core, _) = test_core().await;
    enroll_admin(&mut core, b"admin-1");
    core.controllers
        .add(ControllerRecord {
            pairing_id: b"peon-1".to_vec(),
            ltpk: [8u8; 32],
            admin: false,
        })
        .unwrap();

    let (slot, _) = core.accept(remote(0));
    force_verify(&mut core, slot, b"admin-1");

    let body = TlvEncoder::new()
        .add_state(states::M1)
        .add_u8(TlvType::Method, methods::REMOVE_PAIRING)
        .add(TlvType::Identifier, b"peon-1")
        .build();
    let outcome = core
        .route(slot, &request(Method::Post, "/pairings", body))
        .await;

    assert!(!outcome.close_all);
    assert_eq!(core.controllers.iter().count(), 1);
    assert!(core.controllers.is_paired());
}

// ---- pair-setup concurrency ----

#[tokio::test]
async fn concurrent_pair_setup_gets_busy() {
    let (mut core, _) = test_core().await;
    let (first, _) = core.accept(remote(0));
    let (second, _) = core.accept(remote(1));

    let m1 = TlvEncoder::new()
        .add_state(states::M1)
        .add_u8(TlvType::Method, methods::PAIR_SETUP)
        .build();

    let outcome = core
        .route(first, &request(Method::Post, "/pair-setup", m1.clone()))
        .await;
    let (_, tlv_bytes) = parse_response(&outcome.response);
    let tlv = TlvDecoder::decode(&tlv_bytes).unwrap();
    assert_eq!(tlv.get_u8(TlvType::Error), None);
    assert!(tlv.get(TlvType::Salt).is_some());

    let outcome = core
        .route(second, &request(Method::Post, "/pair-setup", m1))
        .await;
    let (_, tlv_bytes) = parse_response(&outcome.response);
    let tlv = TlvDecoder::decode(&tlv_bytes).unwrap();
    assert_eq!(tlv.get_state().unwrap(), states::M2);
    assert_eq!(tlv.get_u8(TlvType::Error), Some(error_codes::BUSY));
}

// ---- service polling ----

struct Thermometer {
    reported: bool,
}

impl ServiceHandler for Thermometer {
    fn poll(&mut self, _now_ms: u64) -> Vec<(String, Value)> {
        if self.reported {
            return Vec::new();
        }
        self.reported = true;
        vec![("11".to_string(), Value::Float(21.5))]
    }
}

#[tokio::test]
async fn poll_applies_handler_pushed_values() {
    let mut db = test_database();
    let mut sensor = Accessory::new();
    sensor.add_service(catalog::accessory_information(
        "Thermo", "Acme", "T300", "0003", "1.0.0",
    ));
    sensor.add_service(
        Service::new(catalog::TEMPERATURE_SENSOR)
            .with(catalog::current_temperature(0.0))
            .primary()
            .with_handler(Box::new(Thermometer { reported: false })),
    );
    db.add_accessory(sensor);

    let (mut core, _) = test_core_with_db(db).await;
    let actions = core.poll();

    assert!(actions.iter().any(|a| matches!(
        a,
        Action::Emit(ServerEvent::CharacteristicChanged { aid: 3, .. })
    )));
    // The pushed value is committed; a second poll pushes nothing.
    let temperature = core
        .db
        .accessories()[2]
        .services()[1]
        .characteristic("11")
        .unwrap();
    assert_eq!(temperature.value(), &Value::Float(21.5));
    assert!(core.poll().is_empty());
}

// ---- configuration number ----

#[tokio::test]
async fn config_number_persists_and_bumps_on_change() {
    let clock = ManualClock::new();
    let mut store = Box::new(MemoryStore::new());
    provision_setup_code(store.as_mut(), "46637726")
        .await
        .unwrap();

    let core = ServerCore::new(
        test_config(),
        test_database(),
        store,
        Box::new(clock.clone()),
    )
    .await
    .unwrap();
    assert_eq!(core.config_number, 1);
    assert_eq!(core.txt_records().config_number, 1);
    let store = core.store;

    // Same database on reboot: unchanged.
    let core = ServerCore::new(
        test_config(),
        test_database(),
        store,
        Box::new(clock.clone()),
    )
    .await
    .unwrap();
    assert_eq!(core.config_number, 1);
    let store = core.store;

    // A grown database bumps the number.
    let mut db = test_database();
    let mut sensor = Accessory::new();
    sensor.add_service(catalog::accessory_information(
        "Thermo", "Acme", "T300", "0003", "1.0.0",
    ));
    sensor.add_service(
        Service::new(catalog::TEMPERATURE_SENSOR)
            .with(catalog::current_temperature(0.0)),
    );
    db.add_accessory(sensor);

    let core = ServerCore::new(test_config(), db, store, Box::new(clock))
        .await
        .unwrap();
    assert_eq!(core.config_number, 2);
}

// ---- boot validation ----

#[tokio::test]
async fn invalid_database_aborts_boot() {
    let clock = ManualClock::new();
    let store = Box::new(MemoryStore::new());

    let mut db = Database::new();
    let mut accessory = Accessory::new();
    accessory.add_service(Service::new(catalog::SWITCH).with(catalog::on(false)));
    db.add_accessory(accessory);

    let result = ServerCore::new(test_config(), db, store, Box::new(clock)).await;
    assert!(matches!(
        result,
        Err(crate::error::HapError::Config(errors)) if !errors.is_empty()
    ));
}
