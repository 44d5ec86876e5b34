use std::time::Duration;

use ridge_services::TransferStatus;

use crate::fault::{DropRule, LossyRelay};
use crate::*;

fn all_completed(expected: usize) -> impl Fn(&[TransferSnapshot]) -> bool {
    move |snap| snap.len() == expected && snap.iter().all(|t| t.status == TransferStatus::Completed)
}

#[tokio::test]
async fn ten_byte_file_in_two_parts_survives_a_dropped_chunk() {
    let dir = TestDir::new("ten-bytes");
    let mut config = test_config(dir.path());
    config.client.max_parts = 2;

    let server = TestServer::start(&config, &[("ten.bin", b"0123456789")]).await.unwrap();
    let relay = LossyRelay::start(server.addr, DropRule::FirstChunkOnce).await.unwrap();
    let client = test_client(&config, relay.addr);

    let path = client.download_file("ten.bin", 10).await.unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), b"0123456789");
    assert!(!config.client.output_dir.join("ten.bin.part").exists());

    // Part 0's only chunk was dropped once and resent exactly once.
    assert_eq!(relay.dropped(), 1);
    assert_eq!(relay.first_chunk_data(), 2);

    let snap = server.wait_for(Duration::from_secs(2), all_completed(2)).await;
    assert_eq!(snap.len(), 2, "one transfer per part: {snap:?}");
    let first = snap.iter().find(|t| t.offset == 0).unwrap();
    let second = snap.iter().find(|t| t.offset == 5).unwrap();
    assert_eq!(first.length, 5);
    assert_eq!(second.length, 5);
    assert_eq!(first.retransmissions, 1);
    assert_eq!(second.retransmissions, 0);
    assert!(snap.iter().all(|t| t.status == TransferStatus::Completed));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn multi_chunk_file_in_four_parts() {
    let dir = TestDir::new("multi-chunk");
    let config = test_config(dir.path());
    let contents = pattern(100_003);

    let server = TestServer::start(&config, &[("big.bin", &contents)]).await.unwrap();
    let client = test_client(&config, server.addr);

    let catalog = client.fetch_catalog().await.unwrap();
    assert_eq!(catalog.get("big.bin"), Some(&100_003));

    let path = client.download_file("big.bin", 100_003).await.unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), contents);

    let snap = server.wait_for(Duration::from_secs(2), all_completed(4)).await;
    assert_eq!(snap.len(), 4);
    let total: u64 = snap.iter().map(|t| t.length).sum();
    assert_eq!(total, 100_003);
    // 25_000 to 25_003 bytes per part at 4 KiB per chunk.
    assert!(snap.iter().all(|t| t.total_chunks == 7 && t.chunks_sent == 7));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn empty_file_needs_no_transfer() {
    let dir = TestDir::new("empty");
    let config = test_config(dir.path());

    let server = TestServer::start(&config, &[("empty.bin", b"")]).await.unwrap();
    let client = test_client(&config, server.addr);

    let path = client.download_file("empty.bin", 0).await.unwrap();
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    assert!(server.snapshot().await.is_empty());

    server.stop().await.unwrap();
}

#[tokio::test]
async fn watcher_downloads_new_names_once() {
    let dir = TestDir::new("watch");
    let config = test_config(dir.path());
    let server = TestServer::start(&config, &[("a.bin", b"aaaa"), ("b.bin", b"bbbbbbbb")])
        .await
        .unwrap();
    let client = test_client(&config, server.addr);

    std::fs::write(&config.client.input_file, "# wanted\na.bin\nnope.bin\n").unwrap();
    let mut watcher = ridge_fetch::InputWatcher::new(client, &config.client.input_file);

    let report = watcher.scan_once().await.unwrap();
    assert_eq!(report.downloaded, vec!["a.bin".to_string()]);
    assert_eq!(report.unavailable, vec!["nope.bin".to_string()]);
    assert!(report.failed.is_empty());

    // Nothing new: already downloaded, and the missing name is reported once.
    let report = watcher.scan_once().await.unwrap();
    assert_eq!(report, ridge_fetch::ScanReport::default());

    std::fs::write(&config.client.input_file, "a.bin\nnope.bin\nb.bin\n").unwrap();
    let report = watcher.scan_once().await.unwrap();
    assert_eq!(report.downloaded, vec!["b.bin".to_string()]);
    assert!(watcher.processed().contains("a.bin"));
    assert_eq!(
        std::fs::read(config.client.output_dir.join("b.bin")).unwrap(),
        b"bbbbbbbb"
    );

    server.stop().await.unwrap();
}
