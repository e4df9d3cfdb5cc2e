//! Exercises the relay's handshake + initial snapshot path directly against
//! a `TreeStore`, without going through a live upstream `PipboyClient`.

use pipboy_net::codec::record::{decode_records, Record, RecordPayload};
use pipboy_net::frame::{self, MessageType};
use pipboy_net::relay::RelayController;
use pipboy_net::tree::TreeStore;
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[test]
fn downstream_client_receives_accept_and_initial_snapshot() {
    let tree = Arc::new(TreeStore::new());
    tree.apply_record(Record {
        id: 1,
        payload: RecordPayload::UInt32(7),
    })
    .unwrap();
    tree.apply_record(Record {
        id: 0,
        payload: RecordPayload::Object {
            added: vec![("a".into(), 1)],
            removed: vec![],
        },
    })
    .unwrap();

    let relay = RelayController::new(tree);
    relay.set_upstream_info("en".into(), "1.1.30.0".into());
    let port = 27611;
    relay.start_relay_service("127.0.0.1", Some(port)).unwrap();

    thread::sleep(Duration::from_millis(100));

    let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let accepted = frame::read_frame(&mut client).unwrap();
    assert_eq!(accepted.message_type, MessageType::ConnectionAccepted);

    let update = frame::read_frame(&mut client).unwrap();
    assert_eq!(update.message_type, MessageType::DataUpdate);

    let mut seen = Vec::new();
    decode_records(&update.payload, |r| seen.push(r)).unwrap();
    assert!(seen.iter().any(|r| r.id == 0));
    assert!(seen.iter().any(|r| r.id == 1));

    relay.stop_relay_service();
}

#[test]
fn upstream_info_update_after_start_reaches_new_clients() {
    let tree = Arc::new(TreeStore::new());
    let relay = RelayController::new(tree);
    let port = 27612;
    relay.start_relay_service("127.0.0.1", Some(port)).unwrap();

    relay.set_upstream_info("fr".into(), "2.0.0.0".into());
    thread::sleep(Duration::from_millis(100));

    let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let accepted = frame::read_frame(&mut client).unwrap();
    assert_eq!(accepted.message_type, MessageType::ConnectionAccepted);

    let body: serde_json::Value = serde_json::from_slice(&accepted.payload).unwrap();
    assert_eq!(body["lang"], "fr");
    assert_eq!(body["version"], "2.0.0.0");

    relay.stop_relay_service();
}
