//! Loopback end-to-end scenarios: an in-process tracker plus real engines
//! exchanging real bytes over TCP.

use std::{path::Path, time::Duration};

use rand::{rngs::StdRng, RngCore, SeedableRng};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};

use lantorrent::{
    conf::{Config, TrackerConfig},
    engine::Engine,
    metainfo::Metainfo,
    tracker::service::{self, RunningTracker},
};

fn random_payload(len: usize, seed: u64) -> Vec<u8> {
    let mut payload = vec![0; len];
    StdRng::seed_from_u64(seed).fill_bytes(&mut payload);
    payload
}

/// A tracker with a short announce cadence so peers find each other fast.
fn test_tracker() -> RunningTracker {
    service::serve(
        "127.0.0.1:0".parse().unwrap(),
        TrackerConfig {
            announce_interval: Duration::from_secs(1),
            ..TrackerConfig::default()
        },
    )
    .unwrap()
}

/// An engine configuration that reconciles dials quickly.
fn fast_config(data_dir: &Path) -> Config {
    let mut conf = Config::new(data_dir);
    conf.reconcile_interval = Duration::from_millis(200);
    conf
}

#[tokio::test(flavor = "multi_thread")]
async fn two_node_transfer() {
    let tracker = test_tracker();
    let announce = format!("http://{}/announce", tracker.local_addr);

    // 2 pieces: 262144 bytes and a 37856 byte tail
    let payload = random_payload(300_000, 7);
    let metainfo =
        Metainfo::for_payload(&announce, "payload.bin", 262_144, &payload)
            .unwrap();
    assert_eq!(metainfo.piece_count(), 2);

    let seeder_dir = tempfile::tempdir().unwrap();
    std::fs::write(seeder_dir.path().join("payload.bin"), &payload).unwrap();
    let seeder = Engine::spawn(fast_config(seeder_dir.path()), metainfo.clone())
        .await
        .unwrap();
    assert!(
        seeder.store().is_complete(),
        "rehash must recognize the full file"
    );
    // let the seeder's started announce land first
    tokio::time::sleep(Duration::from_millis(300)).await;

    let leecher_dir = tempfile::tempdir().unwrap();
    let leecher =
        Engine::spawn(fast_config(leecher_dir.path()), metainfo.clone())
            .await
            .unwrap();

    timeout(Duration::from_secs(10), leecher.wait_complete())
        .await
        .expect("transfer timed out");

    let downloaded = std::fs::read(leecher_dir.path().join("payload.bin"))
        .unwrap();
    assert!(downloaded == payload, "leecher file must match the seeder's");
    assert_eq!(leecher.store().left(), 0);
    assert_eq!(leecher.downloaded(), payload.len() as u64);

    // once the completed announce lands, the tracker counts two seeders
    let mut seeders = 0;
    for _ in 0..50 {
        if let Some(stats) = tracker.table().stats().first() {
            seeders = stats.seeders;
            if seeders == 2 {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(seeders, 2, "both peers should report left == 0");

    leecher.shutdown().await.unwrap();
    seeder.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn resume_skips_pieces_already_on_disk() {
    let tracker = test_tracker();
    let announce = format!("http://{}/announce", tracker.local_addr);

    // 2 pieces of 32 KiB and 16 KiB
    let payload = random_payload(49_152, 11);
    let metainfo =
        Metainfo::for_payload(&announce, "payload.bin", 32_768, &payload)
            .unwrap();
    assert_eq!(metainfo.piece_count(), 2);

    let seeder_dir = tempfile::tempdir().unwrap();
    std::fs::write(seeder_dir.path().join("payload.bin"), &payload).unwrap();
    let seeder = Engine::spawn(fast_config(seeder_dir.path()), metainfo.clone())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    // the leecher was killed mid-download: piece 0 is on disk, piece 1
    // never arrived
    let leecher_dir = tempfile::tempdir().unwrap();
    let mut partial = payload.clone();
    for byte in partial[32_768..].iter_mut() {
        *byte = 0;
    }
    std::fs::write(leecher_dir.path().join("payload.bin"), &partial).unwrap();

    let leecher =
        Engine::spawn(fast_config(leecher_dir.path()), metainfo.clone())
            .await
            .unwrap();
    assert!(leecher.store().have(0), "rehash must find piece 0 intact");
    assert!(!leecher.store().have(1));

    timeout(Duration::from_secs(10), leecher.wait_complete())
        .await
        .expect("transfer timed out");

    let restored = std::fs::read(leecher_dir.path().join("payload.bin"))
        .unwrap();
    assert!(restored == payload, "final file must match the seeder's");
    // only the missing piece crossed the wire
    assert_eq!(leecher.downloaded(), 16_384);

    leecher.shutdown().await.unwrap();
    seeder.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_handshake_is_contained() {
    let tracker = test_tracker();
    let announce = format!("http://{}/announce", tracker.local_addr);

    let payload = random_payload(65_536, 13);
    let metainfo =
        Metainfo::for_payload(&announce, "payload.bin", 32_768, &payload)
            .unwrap();

    let seeder_dir = tempfile::tempdir().unwrap();
    std::fs::write(seeder_dir.path().join("payload.bin"), &payload).unwrap();
    let seeder = Engine::spawn(fast_config(seeder_dir.path()), metainfo.clone())
        .await
        .unwrap();
    let addr = format!("127.0.0.1:{}", seeder.listen_port());

    // a probe advertising pstrlen = 20 is closed without a reply
    let mut probe = TcpStream::connect(&addr).await.unwrap();
    probe.write_all(&[20u8; 68]).await.unwrap();
    let mut buf = [0u8; 1];
    let read = timeout(Duration::from_secs(5), probe.read(&mut buf))
        .await
        .expect("engine should close a bad handshake promptly")
        .unwrap();
    assert_eq!(read, 0, "no bytes may follow a bad handshake");

    // a handshake for a torrent the engine doesn't serve is also cut off
    let mut foreign = TcpStream::connect(&addr).await.unwrap();
    foreign.write_all(&handshake(&[0xee; 20])).await.unwrap();
    let read = timeout(Duration::from_secs(5), foreign.read(&mut buf))
        .await
        .expect("engine should close a foreign handshake promptly")
        .unwrap();
    assert_eq!(read, 0, "no bytes may follow a foreign info hash");

    // the engine is still live: a well-formed handshake gets a reply
    let mut peer = TcpStream::connect(&addr).await.unwrap();
    peer.write_all(&handshake(&metainfo.info_hash)).await.unwrap();
    let mut reply = [0u8; 68];
    timeout(Duration::from_secs(5), peer.read_exact(&mut reply))
        .await
        .expect("engine should reply to a valid handshake")
        .unwrap();
    assert_eq!(reply[0], 19);
    assert_eq!(&reply[1..20], b"BitTorrent protocol");
    assert_eq!(&reply[28..48], &metainfo.info_hash);

    seeder.shutdown().await.unwrap();
}

fn handshake(info_hash: &[u8; 20]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(68);
    buf.push(19u8);
    buf.extend_from_slice(b"BitTorrent protocol");
    buf.extend_from_slice(&[0u8; 8]);
    buf.extend_from_slice(info_hash);
    buf.extend_from_slice(b"-xx0001-cccccccccccc");
    buf
}
