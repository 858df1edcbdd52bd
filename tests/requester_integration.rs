//! End-to-end exercises of `Requester` over an in-memory duplex pipe: no
//! TLS, no real bridge, just the framing/dispatch code talking to a fake
//! peer that reads and writes newline-delimited JSON by hand. Mirrors the
//! shape of a relay crate's own `tests/integration_test.rs` (spawn a fake
//! peer, drive real client code against it) without depending on its stack.

use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::time::timeout;

use lutron_leap::connection::Connection;
use lutron_leap::requester::Requester;

/// Install a `tracing` subscriber so `cargo test -- --nocapture` shows the
/// router's debug/trace output for these end-to-end exercises. Installing a
/// subscriber is an application concern the library itself never takes on
/// (see `bridge`'s module docs); tests are exactly that application.
fn init_test_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Read one newline-delimited JSON line off the fake peer's half of the pipe.
async fn read_peer_line<R: tokio::io::AsyncRead + Unpin>(reader: &mut BufReader<R>) -> serde_json::Value {
    let mut line = String::new();
    reader.read_line(&mut line).await.unwrap();
    serde_json::from_str(line.trim()).unwrap()
}

async fn write_peer_line<W: tokio::io::AsyncWrite + Unpin>(writer: &mut W, value: &serde_json::Value) {
    let mut line = serde_json::to_string(value).unwrap();
    line.push_str("\r\n");
    writer.write_all(line.as_bytes()).await.unwrap();
    writer.flush().await.unwrap();
}

#[tokio::test]
async fn request_resolves_by_matching_client_tag() {
    init_test_tracing();
    let (client_half, peer_half) = tokio::io::duplex(64 * 1024);
    let (peer_read, mut peer_write) = tokio::io::split(peer_half);
    let mut peer_reader = BufReader::new(peer_read);

    let conn = Connection::from_duplex(client_half);
    let (requester, _io) = Requester::spawn(conn, Duration::from_secs(5));

    let peer_task = tokio::spawn(async move {
        let req = read_peer_line(&mut peer_reader).await;
        let tag = req["Header"]["ClientTag"].as_str().unwrap().to_string();
        assert_eq!(req["Header"]["Url"], "/zone/1/commandprocessor");
        write_peer_line(
            &mut peer_write,
            &json!({
                "CommuniqueType": "CreateResponse",
                "Header": {"Url": "/zone/1/commandprocessor", "StatusCode": "201 Created", "ClientTag": tag},
                "Body": {}
            }),
        )
        .await;
    });

    let response = requester
        .execute(
            "/zone/1/commandprocessor",
            json!({"Command": {"CommandType": "GoToLevel", "Parameter": [{"Type": "Level", "Value": 100}]}}),
        )
        .await
        .unwrap();
    assert!(response.is_success());

    peer_task.await.unwrap();
}

#[tokio::test]
async fn subscribe_response_and_later_notification_share_the_handler() {
    init_test_tracing();
    let (client_half, peer_half) = tokio::io::duplex(64 * 1024);
    let (peer_read, mut peer_write) = tokio::io::split(peer_half);
    let mut peer_reader = BufReader::new(peer_read);

    let conn = Connection::from_duplex(client_half);
    let (requester, _io) = Requester::spawn(conn, Duration::from_secs(5));

    let peer_task = tokio::spawn(async move {
        let req = read_peer_line(&mut peer_reader).await;
        let tag = req["Header"]["ClientTag"].as_str().unwrap().to_string();
        assert_eq!(req["CommuniqueType"], "SubscribeRequest");

        write_peer_line(
            &mut peer_write,
            &json!({
                "CommuniqueType": "SubscribeResponse",
                "Header": {"Url": "/zone/status", "StatusCode": "200 OK", "ClientTag": tag},
                "Body": {"ZoneStatuses": []}
            }),
        )
        .await;

        // A later, unsolicited push on the per-zone URL a real bridge uses,
        // not the `/zone/status` subscription URL itself, with no
        // ClientTag at all.
        write_peer_line(
            &mut peer_write,
            &json!({
                "CommuniqueType": "ReadResponse",
                "Header": {"Url": "/zone/1/status"},
                "Body": {"ZoneStatus": {"Level": 42, "Zone": {"href": "/zone/1"}}}
            }),
        )
        .await;
    });

    let (initial, mut rx) = requester.subscribe("/zone/status").await.unwrap();
    assert_eq!(initial.body["ZoneStatuses"], json!([]));

    let notification = timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(notification.body["ZoneStatus"]["Level"], 42);

    peer_task.await.unwrap();
}

#[tokio::test]
async fn large_response_body_is_decoded_without_truncation() {
    init_test_tracing();
    let (client_half, peer_half) = tokio::io::duplex(512 * 1024);
    let (peer_read, mut peer_write) = tokio::io::split(peer_half);
    let mut peer_reader = BufReader::new(peer_read);

    let conn = Connection::from_duplex(client_half);
    let (requester, _io) = Requester::spawn(conn, Duration::from_secs(5));

    let big_name: String = "x".repeat(200 * 1024);
    let big_name_for_peer = big_name.clone();
    let peer_task = tokio::spawn(async move {
        let req = read_peer_line(&mut peer_reader).await;
        let tag = req["Header"]["ClientTag"].as_str().unwrap().to_string();
        write_peer_line(
            &mut peer_write,
            &json!({
                "CommuniqueType": "ReadResponse",
                "Header": {"Url": "/device", "StatusCode": "200 OK", "ClientTag": tag},
                "Body": {"Devices": [{"href": "/device/1", "Name": big_name_for_peer}]}
            }),
        )
        .await;
    });

    let response = requester.read("/device").await.unwrap();
    let devices = response.body["Devices"].as_array().unwrap();
    assert_eq!(devices[0]["Name"].as_str().unwrap().len(), big_name.len());

    peer_task.await.unwrap();
}
