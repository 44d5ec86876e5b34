use std::time::Duration;

use tokio::net::UdpSocket;

use ridge_core::wire::{Packet, RECV_BUFFER_SIZE};
use ridge_services::{TransferError, TransferStatus};

use crate::fault::{DropRule, LossyRelay};
use crate::*;

async fn request(socket: &UdpSocket, server: std::net::SocketAddr, packet: &Packet) -> Packet {
    socket.send_to(&packet.encode().unwrap(), server).await.unwrap();
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];
    let (len, from) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
        .await
        .expect("server did not reply")
        .unwrap();
    assert_eq!(from, server);
    Packet::decode(&buf[..len]).unwrap()
}

#[tokio::test]
async fn unknown_file_gets_error_and_no_transfer() {
    let dir = TestDir::new("not-found");
    let config = test_config(dir.path());
    let server = TestServer::start(&config, &[("ten.bin", b"0123456789")]).await.unwrap();

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let download = Packet::Download {
        file_name: "missing.bin".into(),
        offset: 0,
        length: 10,
        client_port: None,
    };
    match request(&socket, server.addr, &download).await {
        Packet::Error { file_name, reason, .. } => {
            assert_eq!(file_name.as_deref(), Some("missing.bin"));
            assert_eq!(reason, "file not found: missing.bin");
        }
        other => panic!("expected ERROR, got {other:?}"),
    }
    assert!(server.snapshot().await.is_empty());

    server.stop().await.unwrap();
}

#[tokio::test]
async fn listed_file_missing_on_disk_is_not_found() {
    let dir = TestDir::new("ghost");
    let config = test_config(dir.path());
    let server = TestServer::start(&config, &[("ghost.bin", b"0123456789")]).await.unwrap();
    // The catalog was loaded with the file present; take it away.
    std::fs::remove_file(config.server.files_dir.join("ghost.bin")).unwrap();

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let download = Packet::Download {
        file_name: "ghost.bin".into(),
        offset: 0,
        length: 10,
        client_port: None,
    };
    match request(&socket, server.addr, &download).await {
        Packet::Error { reason, transfer_id, .. } => {
            assert_eq!(reason, "file not found: ghost.bin");
            assert_eq!(transfer_id, None);
        }
        other => panic!("expected ERROR, got {other:?}"),
    }
    assert!(server.snapshot().await.is_empty());

    let client = test_client(&config, server.addr);
    let err = client.download_file("ghost.bin", 10).await.unwrap_err();
    assert!(matches!(err, TransferError::NotFound(ref name) if name == "ghost.bin"), "{err:?}");
    assert!(!config.client.output_dir.join("ghost.bin.part").exists());

    // The watcher treats the refusal like an unlisted name: reported once.
    std::fs::write(&config.client.input_file, "ghost.bin\n").unwrap();
    let mut watcher = ridge_fetch::InputWatcher::new(client, &config.client.input_file);
    let report = watcher.scan_once().await.unwrap();
    assert_eq!(report.unavailable, vec!["ghost.bin".to_string()]);
    assert!(report.failed.is_empty());
    assert_eq!(watcher.scan_once().await.unwrap(), ridge_fetch::ScanReport::default());

    assert!(server.snapshot().await.is_empty());
    server.stop().await.unwrap();
}

#[tokio::test]
async fn server_survives_malformed_datagrams() {
    let dir = TestDir::new("malformed");
    let config = test_config(dir.path());
    let server = TestServer::start(&config, &[("ten.bin", b"0123456789")]).await.unwrap();

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.send_to(b"not json at all", server.addr).await.unwrap();
    socket.send_to(br#"{"type":"BOGUS"}"#, server.addr).await.unwrap();

    let client = test_client(&config, server.addr);
    let catalog = client.fetch_catalog().await.unwrap();
    assert_eq!(catalog.get("ten.bin"), Some(&10));
    assert!(server.snapshot().await.is_empty());

    server.stop().await.unwrap();
}

#[tokio::test]
async fn silent_server_fails_catalog_fetch() {
    let dir = TestDir::new("silent");
    let mut config = test_config(dir.path());
    config.transfer.max_retries = 1;
    config.transfer.ack_timeout_ms = 50;

    // Bound but never read: requests vanish.
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let client = test_client(&config, silent.local_addr().unwrap());

    let err = client.fetch_catalog().await.unwrap_err();
    assert!(err.to_string().contains("no catalog reply"), "{err:#}");
}

#[tokio::test]
async fn lost_data_fails_the_part_and_leaves_no_file() {
    let dir = TestDir::new("all-lost");
    let mut config = test_config(dir.path());
    config.client.max_parts = 1;
    config.transfer.max_retries = 2;

    let server = TestServer::start(&config, &[("ten.bin", b"0123456789")]).await.unwrap();
    let relay = LossyRelay::start(server.addr, DropRule::AllData).await.unwrap();
    let client = test_client(&config, relay.addr);

    let err = client.download_file("ten.bin", 10).await.unwrap_err();
    assert!(
        matches!(err, TransferError::Aborted(_) | TransferError::Timeout { .. }),
        "{err:?}"
    );
    // One send plus two retries, all dropped.
    assert_eq!(relay.dropped(), 3);
    assert!(!config.client.output_dir.join("ten.bin").exists());
    assert!(!config.client.output_dir.join("ten.bin.part").exists());

    let snap = server
        .wait_for(Duration::from_secs(2), |s| {
            s.iter().all(|t| t.status == TransferStatus::Error)
        })
        .await;
    assert_eq!(snap.len(), 1);
    assert_eq!(snap[0].status, TransferStatus::Error);
    assert_eq!(snap[0].retransmissions, 2);

    server.stop().await.unwrap();
}
