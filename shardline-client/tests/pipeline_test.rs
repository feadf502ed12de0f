//! End-to-end tests for the Shardline client
//!
//! Drives uploads and range downloads against an in-memory authority and
//! storage nodes with injected faults.
//!
//! Run with: cargo test -p shardline-client --test pipeline_test

use futures::StreamExt;
use proptest::prelude::*;
use shardline_client::memory::{MemoryAuthority, MemoryCluster, NodeFault};
use shardline_client::{
    BlockId, ByteRange, ClientConfig, NodeId, ObjectLocator, ObjectReceipt, ShardlineClient,
    UserCredentials, UserId,
};
use shardline_core::{BlockKey, ContentHash, RedundancyMode, ShardlineError, SizeThresholdPolicy};
use std::collections::HashSet;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

/// Deterministic, non-repeating test data
fn generate_file(size: usize, seed: u64) -> Vec<u8> {
    let mut state = seed | 1;
    (0..size)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state as u8
        })
        .collect()
}

fn user(id: u64) -> Arc<UserCredentials> {
    Arc::new(UserCredentials::new(UserId(id), BlockKey::generate()))
}

/// Erasure coding everywhere, short timeouts
fn fast_config(data: u8, parity: u8, block_size: usize) -> ClientConfig {
    let mut config = ClientConfig::default();
    config.chunking.block_size = block_size;
    config.redundancy = SizeThresholdPolicy::erasure_only(data, parity);
    config.scheduler.node_wait_timeout_ms = 200;
    config.scheduler.wait_backoff_ms = 10;
    config.transport.admission_retry_delay_ms = 1;
    config.transport.shard_timeout_ms = 2_000;
    config.coordinator.backup_delay_ms = 50;
    config.coordinator.block_timeout_ms = 5_000;
    config.authority.retry_delay_ms = 1;
    config
}

fn placements_of(cluster: &MemoryCluster, receipt: &ObjectReceipt, user: UserId) -> Vec<Vec<NodeId>> {
    let authority = cluster.authority();
    let references = authority.references(user, receipt.vhw).unwrap();
    references
        .iter()
        .map(|r| {
            authority
                .block(r.vbi)
                .unwrap()
                .placements
                .iter()
                .map(|p| p.node.clone())
                .collect()
        })
        .collect()
}

async fn run_round_trip(client: &ShardlineClient, data: &[u8]) -> ObjectReceipt {
    let owner = user(1);
    let receipt = client.upload_bytes(owner.clone(), data.to_vec()).await.unwrap();
    assert_eq!(receipt.length, data.len() as u64);
    assert_eq!(receipt.vhw, ContentHash::compute(data));

    let downloaded = client
        .download(&owner, ObjectLocator::hash(receipt.vhw))
        .await
        .unwrap();
    assert_eq!(downloaded, data);
    receipt
}

#[tokio::test]
async fn test_threshold_reached_despite_hung_node() {
    let cluster = MemoryCluster::new(6);
    cluster.node(0).set_fault(NodeFault::Hang);

    let mut config = fast_config(3, 1, 4096);
    config.coordinator.erasure_min_success = 3;
    config.coordinator.extra_percent = 25;
    let client = cluster.client(config).unwrap();

    let data = generate_file(1000, 7);
    let receipt = run_round_trip(&client, &data).await;

    let placements = placements_of(&cluster, &receipt, UserId(1));
    assert_eq!(placements.len(), 1);
    assert!(placements[0].len() >= 3);
    assert!(!placements[0].contains(cluster.node(0).id()));
    assert_eq!(cluster.node(0).shard_count(), 0);
}

#[tokio::test]
async fn test_backup_wave_replaces_hung_primary() {
    let cluster = MemoryCluster::new(6);
    cluster.node(0).set_fault(NodeFault::Hang);

    // Every shard is required, so the hung primary must be covered by a backup
    let mut config = fast_config(3, 1, 4096);
    config.coordinator.extra_percent = 25;
    let client = cluster.client(config).unwrap();

    let data = generate_file(1000, 8);
    let receipt = run_round_trip(&client, &data).await;

    let placements = placements_of(&cluster, &receipt, UserId(1));
    assert_eq!(placements[0].len(), 4);
    let distinct: HashSet<&NodeId> = placements[0].iter().collect();
    assert_eq!(distinct.len(), 4);
    assert!(!distinct.contains(cluster.node(0).id()));
}

#[tokio::test]
async fn test_cross_user_deduplication() {
    let cluster = MemoryCluster::new(5);
    let client = cluster.client(fast_config(3, 1, 2048)).unwrap();
    let authority = cluster.authority();
    let data = generate_file(5000, 11);

    let alice = user(1);
    let bob = user(2);

    let first = client.upload_bytes(alice.clone(), data.clone()).await.unwrap();
    assert_eq!(first.committed, 3);
    assert_eq!(first.deduplicated, 0);
    let puts_after_first = cluster.total_puts();
    let blocks_after_first = authority.block_count();

    let second = client.upload_bytes(bob.clone(), data.clone()).await.unwrap();
    assert_eq!(second.deduplicated, 3);
    assert_eq!(cluster.total_puts(), puts_after_first);
    assert_eq!(authority.block_count(), blocks_after_first);

    let alice_refs = authority.references(alice.user_id, first.vhw).unwrap();
    let bob_refs = authority.references(bob.user_id, second.vhw).unwrap();
    for (a, b) in alice_refs.iter().zip(&bob_refs) {
        assert_eq!(a.vbi, b.vbi);
        assert_ne!(a.keu, b.keu);
        assert_eq!(authority.block(a.vbi).unwrap().nlink, 2);
    }

    // Each user decrypts with their own key
    let downloaded = client
        .download(&bob, ObjectLocator::hash(second.vhw))
        .await
        .unwrap();
    assert_eq!(downloaded, data);
}

#[tokio::test]
async fn test_range_fetches_only_intersecting_blocks() {
    let cluster = MemoryCluster::new(5);
    let client = cluster.client(fast_config(3, 1, 800)).unwrap();
    let authority = cluster.authority();
    let owner = user(1);

    let data = generate_file(2400, 21);
    let receipt = client.upload_bytes(owner.clone(), data.clone()).await.unwrap();
    let mut references = authority.references(owner.user_id, receipt.vhw).unwrap();
    references.sort_by_key(|r| r.ordinal);
    let vbis: Vec<BlockId> = references.iter().map(|r| r.vbi).collect();

    let reader = client
        .open(&owner, ObjectLocator::hash(receipt.vhw), ByteRange::new(500, 1500))
        .await
        .unwrap();
    assert_eq!(reader.remaining(), 1000);
    let bytes = reader.read_to_end().await.unwrap();
    assert_eq!(bytes, &data[500..1500]);
    assert_eq!(authority.block_requests(), vec![vbis[0], vbis[1]]);

    let untouched: HashSet<ContentHash> = authority
        .block(vbis[2])
        .unwrap()
        .placements
        .iter()
        .map(|p| p.hash)
        .collect();
    assert!(cluster.requested().is_disjoint(&untouched));
}

#[tokio::test]
async fn test_range_skips_leading_blocks() {
    let cluster = MemoryCluster::new(5);
    let client = cluster.client(fast_config(3, 1, 800)).unwrap();
    let authority = cluster.authority();
    let owner = user(1);

    let data = generate_file(2400, 22);
    let receipt = client.upload_bytes(owner.clone(), data.clone()).await.unwrap();
    let mut references = authority.references(owner.user_id, receipt.vhw).unwrap();
    references.sort_by_key(|r| r.ordinal);

    let bytes = client
        .open(&owner, ObjectLocator::hash(receipt.vhw), ByteRange::new(900, 2000))
        .await
        .unwrap()
        .read_to_end()
        .await
        .unwrap();
    assert_eq!(bytes, &data[900..2000]);
    assert_eq!(
        authority.block_requests(),
        vec![references[1].vbi, references[2].vbi]
    );
}

#[tokio::test]
async fn test_insufficient_redundancy_never_commits() {
    let cluster = MemoryCluster::new(4);
    cluster.node(2).set_fault(NodeFault::FailPuts);
    cluster.node(3).set_fault(NodeFault::FailPuts);

    let mut config = fast_config(3, 1, 4096);
    config.coordinator.erasure_min_success = 3;
    let client = cluster.client(config).unwrap();

    let err = client
        .upload_bytes(user(1), generate_file(1000, 31))
        .await
        .unwrap_err();
    assert!(
        matches!(err, ShardlineError::InsufficientRedundancy { required: 3, .. }),
        "unexpected error: {}",
        err
    );
    assert_eq!(cluster.authority().commit_calls(), 0);
    assert_eq!(cluster.authority().finalizations(), 0);
}

#[tokio::test]
async fn test_authority_blacklist_triggers_replacement() {
    let cluster = MemoryCluster::new(5);
    let banned = cluster.node(0).id().clone();
    cluster.authority().blacklist_node(&banned);

    let client = cluster.client(fast_config(3, 1, 4096)).unwrap();
    let data = generate_file(1500, 41);
    let receipt = run_round_trip(&client, &data).await;

    let placements = placements_of(&cluster, &receipt, UserId(1));
    assert_eq!(placements[0].len(), 4);
    assert!(!placements[0].contains(&banned));
    let distinct: HashSet<&NodeId> = placements[0].iter().collect();
    assert_eq!(distinct.len(), 4);
    assert!(client.scheduler().blacklist().contains(&banned));

    // Later blocks never go near the node again
    let puts = cluster.node(0).puts();
    client
        .upload_bytes(user(1), generate_file(1500, 42))
        .await
        .unwrap();
    assert_eq!(cluster.node(0).puts(), puts);
}

#[tokio::test]
async fn test_download_falls_back_past_corrupt_shard() {
    let cluster = MemoryCluster::new(4);
    let client = cluster.client(fast_config(3, 1, 4096)).unwrap();
    let owner = user(1);
    let data = generate_file(3000, 51);
    let receipt = client.upload_bytes(owner.clone(), data.clone()).await.unwrap();

    let placements = placements_of(&cluster, &receipt, owner.user_id);
    let first = cluster.find(&placements[0][0]).unwrap();
    first.set_fault(NodeFault::Corrupt);

    let downloaded = client
        .download(&owner, ObjectLocator::hash(receipt.vhw))
        .await
        .unwrap();
    assert_eq!(downloaded, data);

    // Two bad shards out of four leave too few for a 3-of-4 block
    let second = cluster.find(&placements[0][1]).unwrap();
    second.set_fault(NodeFault::Offline);
    let err = client
        .download(&owner, ObjectLocator::hash(receipt.vhw))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ShardlineError::Reconstruction {
            available: 2,
            required: 3
        }
    ));
}

#[tokio::test]
async fn test_interrupted_upload_resumes() {
    let cluster = MemoryCluster::new(5);
    let authority = cluster.authority();
    let mut config = fast_config(3, 1, 800);
    config.concurrency.max_blocks = 1;
    let client = cluster.client(config).unwrap();
    let owner = user(1);
    let data = generate_file(2400, 61);

    authority.reject_ordinal_once(1);
    let err = client
        .upload_bytes(owner.clone(), data.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, ShardlineError::Argument(_)));
    assert_eq!(authority.finalizations(), 0);

    let receipt = client.upload_bytes(owner.clone(), data.clone()).await.unwrap();
    assert!(receipt.resumed);
    assert_eq!(receipt.skipped, 1);
    assert_eq!(receipt.committed, 2);

    let downloaded = client
        .download(&owner, ObjectLocator::hash(receipt.vhw))
        .await
        .unwrap();
    assert_eq!(downloaded, data);
}

#[tokio::test]
async fn test_session_expires_without_keepalive() {
    let authority = Arc::new(MemoryAuthority::new(Duration::from_millis(100)));
    let cluster = MemoryCluster::with_authority(authority.clone(), 4);
    for node in cluster.nodes() {
        node.set_fault(NodeFault::Delay(300));
    }

    let mut config = fast_config(3, 1, 4096);
    config.coordinator.backup_delay_ms = 10_000;
    let client = cluster.client(config).unwrap();

    let err = client
        .upload_bytes(user(1), generate_file(1000, 71))
        .await
        .unwrap_err();
    assert!(matches!(err, ShardlineError::SessionExpired(_)));
    assert_eq!(authority.keep_alives(), 0);
}

#[tokio::test]
async fn test_keepalive_holds_session_open() {
    let authority = Arc::new(MemoryAuthority::new(Duration::from_millis(100)));
    let cluster = MemoryCluster::with_authority(authority.clone(), 4);
    for node in cluster.nodes() {
        node.set_fault(NodeFault::Delay(300));
    }

    let mut config = fast_config(3, 1, 4096);
    config.coordinator.backup_delay_ms = 10_000;
    config.session.keepalive_window_ms = 20;
    let client = cluster.client(config).unwrap();

    let data = generate_file(1000, 72);
    run_round_trip(&client, &data).await;
    assert!(authority.keep_alives() > 0);
}

#[tokio::test]
async fn test_mixed_redundancy_modes() {
    let cluster = MemoryCluster::new(4);
    let mut config = fast_config(3, 1, 8192);
    config.redundancy = SizeThresholdPolicy::default();
    let client = cluster.client(config).unwrap();
    let authority = cluster.authority();

    let data = generate_file(20_000, 81);
    let receipt = run_round_trip(&client, &data).await;

    let mut references = authority.references(UserId(1), receipt.vhw).unwrap();
    references.sort_by_key(|r| r.ordinal);
    let modes: Vec<RedundancyMode> = references
        .iter()
        .map(|r| authority.block(r.vbi).unwrap().mode)
        .collect();
    assert_eq!(
        modes,
        vec![
            RedundancyMode::Copy { copies: 3 },
            RedundancyMode::Copy { copies: 3 },
            RedundancyMode::Stored,
        ]
    );

    let stored = authority.block(references[2].vbi).unwrap();
    assert!(stored.placements.is_empty());
    assert!(stored.stored.is_some());
}

#[tokio::test]
async fn test_copy_mode_records_every_replica() {
    let cluster = MemoryCluster::new(6);
    let mut config = fast_config(3, 1, 16 * 1024);
    config.redundancy = SizeThresholdPolicy::default();
    let client = cluster.client(config).unwrap();
    let owner = user(1);

    let data = generate_file(10_000, 91);
    let receipt = client.upload_bytes(owner.clone(), data.clone()).await.unwrap();

    let authority = cluster.authority();
    let references = authority.references(UserId(1), receipt.vhw).unwrap();
    assert_eq!(references.len(), 1);
    let meta = authority.block(references[0].vbi).unwrap();
    assert_eq!(meta.mode, RedundancyMode::Copy { copies: 3 });
    assert_eq!(meta.placements.len(), 3);

    let holders: HashSet<NodeId> = meta.placements.iter().map(|p| p.node.clone()).collect();
    assert_eq!(holders.len(), 3);
    let stored = cluster.nodes().iter().filter(|n| n.shard_count() > 0).count();
    assert_eq!(stored, 3);

    // Losing all but one holder still leaves the block readable
    for placement in &meta.placements[..2] {
        cluster.find(&placement.node).unwrap().set_fault(NodeFault::Offline);
    }
    let downloaded = client
        .download(&owner, ObjectLocator::hash(receipt.vhw))
        .await
        .unwrap();
    assert_eq!(downloaded, data);
}

/// Reads cleanly until rewound, then fails past `fail_at`
struct FlakySource {
    inner: std::io::Cursor<Vec<u8>>,
    rewound: bool,
    fail_at: u64,
}

impl std::io::Read for FlakySource {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.rewound && self.inner.position() >= self.fail_at {
            return Err(std::io::Error::new(std::io::ErrorKind::Other, "disk went away"));
        }
        std::io::Read::read(&mut self.inner, buf)
    }
}

impl std::io::Seek for FlakySource {
    fn seek(&mut self, pos: std::io::SeekFrom) -> std::io::Result<u64> {
        self.rewound = true;
        std::io::Seek::seek(&mut self.inner, pos)
    }
}

#[tokio::test]
async fn test_source_read_error_fails_upload() {
    let cluster = MemoryCluster::new(5);
    let client = cluster.client(fast_config(3, 1, 800)).unwrap();

    let source = FlakySource {
        inner: std::io::Cursor::new(generate_file(4000, 111)),
        rewound: false,
        fail_at: 1600,
    };
    let err = client.upload(user(1), source).await.unwrap_err();
    assert!(matches!(err, ShardlineError::Codec(_)));
    assert_eq!(cluster.authority().finalizations(), 0);
}

#[tokio::test]
async fn test_zero_length_object() {
    let cluster = MemoryCluster::new(4);
    let client = cluster.client(fast_config(3, 1, 4096)).unwrap();

    let receipt = run_round_trip(&client, &[]).await;
    assert_eq!(receipt.committed, 0);
    assert_eq!(cluster.total_puts(), 0);
    assert!(cluster
        .authority()
        .references(UserId(1), receipt.vhw)
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_upload_file_and_read_by_key() {
    let cluster = MemoryCluster::new(5);
    let client = cluster.client(fast_config(3, 1, 1024)).unwrap();
    let owner = user(1);
    let data = generate_file(5000, 91);

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&data).unwrap();
    file.flush().unwrap();

    let receipt = client.upload_file(owner.clone(), file.path()).await.unwrap();
    assert_eq!(receipt.committed, 5);

    let version = cluster
        .authority()
        .bind_key(owner.user_id, "photos", "2024/beach.jpg", receipt.vhw)
        .unwrap();

    let mut stream = client
        .open(
            &owner,
            ObjectLocator::Key {
                bucket: "photos".to_string(),
                key: "2024/beach.jpg".to_string(),
                version: Some(version),
            },
            ByteRange::starting_at(1000),
        )
        .await
        .unwrap()
        .into_stream()
        .boxed();

    let mut collected = Vec::new();
    while let Some(chunk) = stream.next().await {
        collected.extend_from_slice(&chunk.unwrap());
    }
    assert_eq!(collected, &data[1000..]);
}

#[tokio::test]
async fn test_small_reads_cross_block_boundaries() {
    let cluster = MemoryCluster::new(5);
    let client = cluster.client(fast_config(3, 1, 512)).unwrap();
    let owner = user(1);
    let data = generate_file(2000, 101);
    let receipt = client.upload_bytes(owner.clone(), data.clone()).await.unwrap();

    let mut reader = client
        .open(&owner, ObjectLocator::hash(receipt.vhw), ByteRange::new(100, 1900))
        .await
        .unwrap();
    let mut collected = Vec::new();
    let mut buf = [0u8; 77];
    loop {
        let n = reader.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        collected.extend_from_slice(&buf[..n]);
    }
    assert_eq!(collected, &data[100..1900]);
    assert_eq!(reader.remaining(), 0);
}

#[tokio::test]
async fn test_unknown_object_is_not_found() {
    let cluster = MemoryCluster::new(4);
    let client = cluster.client(fast_config(3, 1, 4096)).unwrap();

    let err = client
        .download(&user(1), ObjectLocator::hash(ContentHash::compute(b"missing")))
        .await
        .unwrap_err();
    assert!(matches!(err, ShardlineError::NotFound(_)));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn prop_references_tile_the_object(size in 0usize..3000, seed in any::<u64>()) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let cluster = MemoryCluster::new(5);
            let client = cluster.client(fast_config(3, 1, 700)).unwrap();
            let data = generate_file(size, seed);
            let receipt = run_round_trip(&client, &data).await;

            let mut references = cluster
                .authority()
                .references(UserId(1), receipt.vhw)
                .unwrap();
            references.sort_by_key(|r| r.ordinal);
            let covered: u64 = references.iter().map(|r| r.original_size).sum();
            assert_eq!(covered, size as u64);
            for (i, reference) in references.iter().enumerate() {
                assert_eq!(reference.ordinal as usize, i);
            }
        });
    }
}
