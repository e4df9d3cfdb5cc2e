//! Full handshake/update/command cycle over a loopback socket, played
//! against a hand-rolled fake host, exercising the client facade end to end.

use pipboy_net::codec::record::{encode_records, Record, RecordPayload};
use pipboy_net::frame::{self, Frame, MessageType};
use pipboy_net::tree::PrimitiveValue;
use pipboy_net::PipboyClient;
use serde_json::{json, Value};
use std::net::TcpListener;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

#[test]
fn connect_receives_initial_tree_and_round_trips_a_command() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let host = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut stream = stream;

        let accepted = json!({"lang": "en", "version": "1.1.30.0"});
        frame::write_frame(
            &mut stream,
            &Frame::new(MessageType::ConnectionAccepted, serde_json::to_vec(&accepted).unwrap()),
        )
        .unwrap();

        let records = vec![
            Record {
                id: 1,
                payload: RecordPayload::UInt32(42),
            },
            Record {
                id: 0,
                payload: RecordPayload::Object {
                    added: vec![("a".into(), 1)],
                    removed: vec![],
                },
            },
        ];
        frame::write_frame(
            &mut stream,
            &Frame::new(MessageType::DataUpdate, encode_records(&records)),
        )
        .unwrap();

        let command = frame::read_frame(&mut stream).unwrap();
        assert_eq!(command.message_type, MessageType::Command);
        let request: Value = serde_json::from_slice(&command.payload).unwrap();
        let id = request["id"].clone();

        frame::write_frame(
            &mut stream,
            &Frame::new(MessageType::CommandResult, serde_json::to_vec(&json!({"id": id})).unwrap()),
        )
        .unwrap();
    });

    let client = PipboyClient::new();

    let (tx, rx) = mpsc::channel();
    let (conn_tx, conn_rx) = mpsc::channel();
    client.register_connection_listener(move |connected, status, _msg| {
        let _ = conn_tx.send((connected, status));
    });
    client.connect("127.0.0.1", Some(port), Some(Duration::from_secs(5))).unwrap();

    assert_eq!(conn_rx.recv_timeout(Duration::from_secs(2)).unwrap(), (true, 0));

    let root_tx = tx.clone();
    client.register_root_object_listener(move |id| {
        let _ = root_tx.send(id);
    });

    // The root may already have arrived before the listener was registered
    // on a slow scheduler; poll briefly either way.
    let mut root_seen = client.tree().root_id().is_some();
    if !root_seen {
        root_seen = rx.recv_timeout(Duration::from_secs(2)).is_ok();
    }
    assert!(root_seen, "root object was never established");

    let root = client.get_pip_value_by_id(0).unwrap();
    assert_eq!(root.child_id("a"), Some(1));
    let value = client.get_pip_value_by_id(1).unwrap();
    assert_eq!(value.as_primitive(), Some(&PrimitiveValue::UInt32(42)));

    let _req_id = client.rpc_sort_inventory(0).unwrap();

    host.join().unwrap();
    client.disconnect();

    assert_eq!(conn_rx.recv_timeout(Duration::from_secs(2)).unwrap(), (false, 0));
}
