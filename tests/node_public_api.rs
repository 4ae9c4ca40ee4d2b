//! Integration tests for the FsNode public API.
//!
//! A single node runs against in-memory collaborators and a recording
//! transport, so every message the node emits can be inspected.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use korium_fs::{
    content_hash, on_demand_placeholder, BlockType, ClientRequest, ClientResponse, Collaborators, Datastore,
    DatastorePut, FsConfig, FsNode, GetMessage, Identity, IndexStart, Keypair, LocationClaim, MemoryCadet,
    MemoryDatastore, MemoryDht, MemoryIndex, MemoryPeerstore, MigrationStop, PeerMessage, PutMessage, PutOutcome,
    Reservation, StartSearch, Telemetry, Transport, Violation, LOC_SIGNATURE_PURPOSE, SEARCH_OPTION_CONTINUED, SEARCH_OPTION_LOOPBACK_ONLY,
};
use tokio::sync::Mutex;
use tokio::time::timeout;

/// Allow time for async operations
const TEST_TIMEOUT: Duration = Duration::from_secs(5);
const QUIET_PERIOD: Duration = Duration::from_millis(300);

#[derive(Default)]
struct RecordingTransport {
    sent: Mutex<Vec<(Identity, Vec<u8>)>>,
}

impl RecordingTransport {
    async fn messages_to(&self, peer: &Identity) -> Vec<PeerMessage> {
        self.sent
            .lock()
            .await
            .iter()
            .filter(|(to, _)| to == peer)
            .map(|(_, bytes)| PeerMessage::decode(bytes).expect("node sent a malformed message"))
            .collect()
    }

    /// Poll until a message to `peer` matches `pred`.
    async fn wait_for(&self, peer: &Identity, pred: impl Fn(&PeerMessage) -> bool) -> Option<PeerMessage> {
        timeout(TEST_TIMEOUT, async {
            loop {
                if let Some(m) = self.messages_to(peer).await.into_iter().find(|m| pred(m)) {
                    return m;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .ok()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, to: &Identity, message: Vec<u8>) -> Result<()> {
        self.sent.lock().await.push((*to, message));
        Ok(())
    }

    async fn reserve(&self, _to: &Identity, amount: u32) -> Result<Reservation> {
        Ok(Reservation { granted: amount, retry_after: Duration::ZERO })
    }

    async fn change_preference(&self, _to: &Identity, _amount: f64) -> Result<()> {
        Ok(())
    }
}

struct TestNode {
    node: FsNode,
    datastore: Arc<MemoryDatastore>,
    transport: Arc<RecordingTransport>,
}

fn spawn_with(config: FsConfig) -> TestNode {
    let datastore = Arc::new(MemoryDatastore::new(64));
    let transport = Arc::new(RecordingTransport::default());
    let collaborators = Collaborators {
        datastore: datastore.clone(),
        dht: Arc::new(MemoryDht::new()),
        cadet: Arc::new(MemoryCadet::new()),
        transport: transport.clone(),
        peerstore: Arc::new(MemoryPeerstore::new()),
        indexing: Arc::new(MemoryIndex::new()),
    };
    let node = FsNode::spawn(Keypair::generate(), config, collaborators);
    TestNode { node, datastore, transport }
}

fn spawn() -> TestNode {
    spawn_with(FsConfig::default())
}

fn peer(byte: u8) -> Identity {
    Keypair::from_secret_key_bytes(&[byte; 32]).identity()
}

fn search(block_type: BlockType, query: [u8; 32], anonymity: u32, options: u32) -> StartSearch {
    StartSearch { block_type, anonymity, options, target: None, query, known_replies: Vec::new() }
}

fn get(query: [u8; 32], ttl: i32) -> Vec<u8> {
    GetMessage {
        block_type: BlockType::DBlock,
        priority: 0,
        ttl,
        filter_mutator: 0,
        query,
        return_to: None,
        transmit_to: None,
        bloom: Vec::new(),
    }
    .encode()
    .expect("encode get")
}

/// Store a data block carrying the given anonymity level.
async fn store_with_anonymity(datastore: &MemoryDatastore, data: Vec<u8>, anonymity: u32) -> [u8; 32] {
    let key = content_hash(&data);
    let outcome = datastore
        .put(DatastorePut {
            key,
            data,
            block_type: BlockType::DBlock,
            priority: 0,
            anonymity,
            replication: 0,
            expiration: u64::MAX,
            queue_priority: 0,
            max_queue_size: 0,
        })
        .await
        .expect("store block");
    assert_eq!(outcome, PutOutcome::Stored);
    key
}

/// Poll telemetry until `pred` holds.
async fn telemetry_until(node: &FsNode, pred: impl Fn(&Telemetry) -> bool) -> Telemetry {
    timeout(TEST_TIMEOUT, async {
        loop {
            let snapshot = node.telemetry().await.unwrap();
            if pred(&snapshot) {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("telemetry condition within timeout")
}

#[tokio::test]
async fn identity_matches_keypair() {
    let keypair = Keypair::from_secret_key_bytes(&[42; 32]);
    let expected = keypair.identity();
    let datastore = Arc::new(MemoryDatastore::new(8));
    let node = FsNode::spawn(
        keypair,
        FsConfig::default(),
        Collaborators {
            datastore,
            dht: Arc::new(MemoryDht::new()),
            cadet: Arc::new(MemoryCadet::new()),
            transport: Arc::new(RecordingTransport::default()),
            peerstore: Arc::new(MemoryPeerstore::new()),
            indexing: Arc::new(MemoryIndex::new()),
        },
    );
    assert_eq!(node.identity(), expected);
    assert_eq!(node.identity(), peer(42));
    assert_ne!(spawn().node.identity(), expected);
}

#[tokio::test]
async fn local_search_returns_stored_block() {
    let t = spawn();
    let data = b"a block that lives in the local datastore".to_vec();
    let query = t.datastore.insert_block(BlockType::DBlock, data.clone()).await.unwrap();

    let mut session = t.node.connect_client().await.unwrap();
    t.node
        .start_search(session.id, search(BlockType::DBlock, query, 1, 0))
        .await
        .unwrap();

    let result = timeout(TEST_TIMEOUT, session.results.recv()).await.unwrap().unwrap();
    assert_eq!(result.data, data);
    assert_eq!(result.block_type, BlockType::DBlock);
    assert_eq!(result.last_transmission, None);

    let telemetry = t.node.telemetry().await.unwrap();
    assert_eq!(telemetry.counters.replies_to_clients, 1);
    assert_eq!(telemetry.pending_requests, 0, "a final answer ends the request");
}

#[tokio::test]
async fn on_demand_record_served_from_indexed_file() {
    let t = spawn();
    let path = std::env::temp_dir().join(format!("korium-fs-api-{}", rand::random::<u64>()));
    let contents = b"contents of an indexed file".to_vec();
    tokio::fs::write(&path, &contents).await.unwrap();
    let filename = path.to_string_lossy().to_string();
    let file_id = content_hash(&contents);

    let response = t
        .node
        .index_start(IndexStart { filename, file_id, device: 0, inode: 0 })
        .await
        .unwrap();
    assert_eq!(response, ClientResponse::IndexStartOk);

    let query = content_hash(&contents);
    t.datastore
        .insert_record(query, BlockType::OnDemand, on_demand_placeholder(file_id, 0))
        .await;

    let mut session = t.node.connect_client().await.unwrap();
    t.node
        .start_search(session.id, search(BlockType::DBlock, query, 1, 0))
        .await
        .unwrap();
    let result = timeout(TEST_TIMEOUT, session.results.recv()).await.unwrap().unwrap();
    assert_eq!(result.data, contents);
    let _ = tokio::fs::remove_file(&path).await;
}

#[tokio::test]
async fn loopback_search_stays_local() {
    let t = spawn();
    let p = peer(1);
    t.node.peer_connected(p).await.unwrap();

    let mut session = t.node.connect_client().await.unwrap();
    t.node
        .start_search(session.id, search(BlockType::DBlock, [9; 32], 1, SEARCH_OPTION_LOOPBACK_ONLY))
        .await
        .unwrap();

    tokio::time::sleep(QUIET_PERIOD).await;
    let queries = t
        .transport
        .messages_to(&p)
        .await
        .into_iter()
        .filter(|m| matches!(m, PeerMessage::Get(_)))
        .count();
    assert_eq!(queries, 0);
    assert!(session.results.try_recv().is_err(), "nothing found means nothing delivered");

    let telemetry = t.node.telemetry().await.unwrap();
    assert_eq!(telemetry.pending_requests, 0, "a loopback search ends after the local lookup");
    assert_eq!(telemetry.plans, 0);
}

#[tokio::test]
async fn missing_block_forwarded_to_peer() {
    let t = spawn();
    let p = peer(1);
    t.node.peer_connected(p).await.unwrap();

    let session = t.node.connect_client().await.unwrap();
    let query = [3; 32];
    t.node
        .start_search(session.id, search(BlockType::DBlock, query, 1, 0))
        .await
        .unwrap();

    let sent = t
        .transport
        .wait_for(&p, |m| matches!(m, PeerMessage::Get(g) if g.query == query))
        .await
        .expect("query forwarded");
    let PeerMessage::Get(get) = sent else { unreachable!() };
    assert_eq!(get.block_type, BlockType::DBlock);
    assert_eq!(get.return_to, None);

    let telemetry = t.node.telemetry().await.unwrap();
    assert_eq!(telemetry.pending_requests, 1);
    assert_eq!(telemetry.counters.queries_sent, 1);
}

#[tokio::test]
async fn continued_keyword_search_merges_on_equal_query() {
    let t = spawn();
    let session = t.node.connect_client().await.unwrap();
    let query = [11; 32];

    t.node
        .start_search(session.id, search(BlockType::UBlock, query, 1, SEARCH_OPTION_CONTINUED))
        .await
        .unwrap();
    t.node
        .start_search(session.id, search(BlockType::UBlock, query, 1, 0))
        .await
        .unwrap();
    assert_eq!(t.node.telemetry().await.unwrap().pending_requests, 1);

    t.node
        .start_search(session.id, search(BlockType::UBlock, [12; 32], 1, 0))
        .await
        .unwrap();
    assert_eq!(t.node.telemetry().await.unwrap().pending_requests, 2);
}

#[tokio::test]
async fn client_disconnect_cancels_requests() {
    let t = spawn();
    t.node.peer_connected(peer(1)).await.unwrap();
    let session = t.node.connect_client().await.unwrap();
    t.node
        .start_search(session.id, search(BlockType::UBlock, [4; 32], 1, 0))
        .await
        .unwrap();
    assert_eq!(t.node.telemetry().await.unwrap().pending_requests, 1);

    t.node.disconnect_client(session.id).await.unwrap();
    let telemetry = t.node.telemetry().await.unwrap();
    assert_eq!(telemetry.pending_requests, 0);
    assert_eq!(telemetry.plans, 0);
}

#[tokio::test]
async fn peer_query_answered_from_datastore() {
    let t = spawn();
    let data = b"content a peer asks for".to_vec();
    let query = t.datastore.insert_block(BlockType::DBlock, data.clone()).await.unwrap();
    let p = peer(2);
    t.node.peer_connected(p).await.unwrap();

    t.node.handle_peer_message(p, get(query, 30)).await.unwrap();

    let reply = t
        .transport
        .wait_for(&p, |m| matches!(m, PeerMessage::Put(_)))
        .await
        .expect("reply sent");
    let PeerMessage::Put(put) = reply else { unreachable!() };
    assert_eq!(put.data, data);
    assert_eq!(put.block_type, BlockType::DBlock);

    let telemetry = t.node.telemetry().await.unwrap();
    assert_eq!(telemetry.counters.queries_received, 1);
    assert_eq!(telemetry.counters.replies_to_peers, 1);
}

#[tokio::test]
async fn repeated_peer_query_keeps_one_request() {
    let t = spawn();
    let p = peer(2);
    t.node.peer_connected(p).await.unwrap();

    t.node.handle_peer_message(p, get([5; 32], 30)).await.unwrap();
    t.node.handle_peer_message(p, get([5; 32], 30)).await.unwrap();

    let telemetry = t.node.telemetry().await.unwrap();
    assert_eq!(telemetry.counters.queries_received, 2);
    assert_eq!(telemetry.pending_requests, 1);
}

#[tokio::test]
async fn query_from_unknown_peer_dropped() {
    let t = spawn();
    t.node.handle_peer_message(peer(7), get([5; 32], 30)).await.unwrap();

    let telemetry = t.node.telemetry().await.unwrap();
    assert_eq!(telemetry.counters.queries_dropped_unknown_peer, 1);
    assert_eq!(telemetry.pending_requests, 0);
}

#[tokio::test]
async fn query_ttl_underflow_dropped() {
    let t = spawn();
    let p = peer(2);
    t.node.peer_connected(p).await.unwrap();

    t.node.handle_peer_message(p, get([5; 32], i32::MIN + 3)).await.unwrap();

    let telemetry = t.node.telemetry().await.unwrap();
    assert_eq!(telemetry.counters.queries_dropped_ttl, 1);
    assert_eq!(telemetry.pending_requests, 0);
}

#[tokio::test]
async fn malformed_message_is_a_violation() {
    let t = spawn();
    let p = peer(3);
    t.node.peer_connected(p).await.unwrap();

    let err = t.node.handle_peer_message(p, vec![0, 3, 1]).await.unwrap_err();
    assert!(matches!(err.downcast_ref::<Violation>(), Some(Violation::Malformed(_))));
    assert_eq!(t.node.telemetry().await.unwrap().counters.protocol_violations, 1);
}

#[tokio::test]
async fn on_demand_content_from_peer_rejected() {
    let t = spawn();
    let p = peer(3);
    t.node.peer_connected(p).await.unwrap();

    let put = PutMessage { block_type: BlockType::OnDemand, expiration: u64::MAX, data: vec![0; 40] };
    let err = t.node.handle_peer_message(p, put.encode().unwrap()).await.unwrap_err();
    assert_eq!(err.downcast_ref::<Violation>(), Some(&Violation::OnDemandContent));
}

#[tokio::test]
async fn unsolicited_content_blocks_migration() {
    let t = spawn_with(FsConfig { content_caching: false, ..FsConfig::default() });
    let p = peer(4);
    t.node.peer_connected(p).await.unwrap();

    let put = PutMessage { block_type: BlockType::DBlock, expiration: u64::MAX, data: b"pushed".to_vec() };
    t.node.handle_peer_message(p, put.encode().unwrap()).await.unwrap();

    let stop = t
        .transport
        .wait_for(&p, |m| matches!(m, PeerMessage::MigrationStop(_)))
        .await
        .expect("migration stop sent");
    let PeerMessage::MigrationStop(stop) = stop else { unreachable!() };
    assert!(stop.duration >= Duration::from_secs(4));

    assert_eq!(t.node.telemetry().await.unwrap().counters.migration_stops_sent, 1);
    assert!(!t.datastore.contains(&content_hash(b"pushed")).await);
}

#[tokio::test]
async fn migration_stop_suspends_pushes() {
    let t = spawn();
    let p = peer(4);
    t.node.peer_connected(p).await.unwrap();

    let stop = MigrationStop { duration: Duration::from_secs(30) };
    t.node.handle_peer_message(p, stop.encode()).await.unwrap();

    let peers = t.node.peers().await.unwrap();
    assert!(peers[0].migration_blocked_until.is_some());
    assert!(peers[0].push_suspended);
    assert_eq!(t.node.telemetry().await.unwrap().counters.migration_stops_received, 1);
}

#[tokio::test(start_paused = true)]
async fn migration_revives_after_stop_expires() {
    let t = spawn();
    let p = peer(5);
    t.node.peer_connected(p).await.unwrap();

    let stop = MigrationStop { duration: Duration::from_secs(30) };
    t.node.handle_peer_message(p, stop.encode()).await.unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(t.node.peers().await.unwrap()[0].push_suspended);

    tokio::time::sleep(Duration::from_secs(25)).await;
    let peers = t.node.peers().await.unwrap();
    assert_eq!(peers[0].migration_blocked_until, None);
    assert!(!peers[0].push_suspended);
}

#[tokio::test]
async fn pushed_content_cached_when_enabled() {
    let t = spawn();
    let p = peer(4);
    t.node.peer_connected(p).await.unwrap();

    let data = b"cache me".to_vec();
    let put = PutMessage { block_type: BlockType::DBlock, expiration: u64::MAX, data: data.clone() };
    t.node.handle_peer_message(p, put.encode().unwrap()).await.unwrap();

    let key = content_hash(&data);
    let cached = timeout(TEST_TIMEOUT, async {
        while !t.datastore.contains(&key).await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(cached.is_ok(), "content should reach the datastore");
}

#[tokio::test]
async fn anonymous_search_waits_for_cover_traffic() {
    let t = spawn();
    let (first, late) = (peer(1), peer(2));
    t.node.peer_connected(first).await.unwrap();

    let session = t.node.connect_client().await.unwrap();
    let query = [21; 32];
    t.node
        .start_search(session.id, search(BlockType::DBlock, query, 3, 0))
        .await
        .unwrap();
    let is_search = |m: &PeerMessage| matches!(m, PeerMessage::Get(g) if g.query == query);

    tokio::time::sleep(QUIET_PERIOD).await;
    assert!(!t.transport.messages_to(&first).await.iter().any(is_search));

    // A peer connecting later gets nothing either.
    t.node.peer_connected(late).await.unwrap();
    tokio::time::sleep(QUIET_PERIOD).await;
    assert!(!t.transport.messages_to(&late).await.iter().any(is_search));
    let telemetry = t.node.telemetry().await.unwrap();
    assert_eq!(telemetry.cover_query_count, 0);
    assert_eq!(telemetry.pending_requests, 1);
    assert_eq!(telemetry.counters.queries_sent, 0);

    // Queries from other peers build up cover; the next connection
    // picks the held-back search up and pays for it.
    t.node.handle_peer_message(first, get([22; 32], 30)).await.unwrap();
    t.node.handle_peer_message(late, get([23; 32], 30)).await.unwrap();
    assert_eq!(t.node.telemetry().await.unwrap().cover_query_count, 2);

    let third = peer(3);
    t.node.peer_connected(third).await.unwrap();
    t.transport
        .wait_for(&third, is_search)
        .await
        .expect("search forwarded once cover is available");
    assert_eq!(t.node.telemetry().await.unwrap().cover_query_count, 0);
}

#[tokio::test]
async fn forwarding_debits_cover_by_anonymity_minus_one() {
    let t = spawn();
    let p = peer(1);
    t.node.peer_connected(p).await.unwrap();
    for query in [[31; 32], [32; 32], [33; 32]] {
        t.node.handle_peer_message(p, get(query, 30)).await.unwrap();
    }
    assert_eq!(t.node.telemetry().await.unwrap().cover_query_count, 3);

    let session = t.node.connect_client().await.unwrap();
    let query = [34; 32];
    t.node
        .start_search(session.id, search(BlockType::DBlock, query, 3, 0))
        .await
        .unwrap();
    t.transport
        .wait_for(&p, |m| matches!(m, PeerMessage::Get(g) if g.query == query))
        .await
        .expect("query forwarded");
    assert_eq!(t.node.telemetry().await.unwrap().cover_query_count, 1);
}

#[tokio::test]
async fn anonymous_reply_needs_content_cover() {
    let t = spawn_with(FsConfig { content_caching: false, ..FsConfig::default() });
    let p = peer(5);
    t.node.peer_connected(p).await.unwrap();
    let data = b"published with anonymity three".to_vec();
    let query = store_with_anonymity(&t.datastore, data.clone(), 3).await;

    t.node.handle_peer_message(p, get(query, 30)).await.unwrap();
    let telemetry = telemetry_until(&t.node, |s| s.counters.replies_dropped_cover == 1).await;
    assert_eq!(telemetry.counters.replies_delayed, 0);
    assert_eq!(telemetry.counters.replies_to_peers, 0);
    assert!(!t.transport.messages_to(&p).await.iter().any(|m| matches!(m, PeerMessage::Put(_))));

    // Content pushed by peers covers the next reply.
    for body in [b"cover one".to_vec(), b"cover two".to_vec()] {
        let put = PutMessage { block_type: BlockType::DBlock, expiration: u64::MAX, data: body };
        t.node.handle_peer_message(p, put.encode().unwrap()).await.unwrap();
    }
    assert_eq!(t.node.telemetry().await.unwrap().cover_content_count, 2);

    t.node.handle_peer_message(p, get(query, 30)).await.unwrap();
    t.transport
        .wait_for(&p, |m| matches!(m, PeerMessage::Put(put) if put.data == data))
        .await
        .expect("reply released after its delay");
    let telemetry = t.node.telemetry().await.unwrap();
    assert_eq!(telemetry.cover_content_count, 0);
    assert_eq!(telemetry.counters.replies_dropped_cover, 1);
    assert_eq!(telemetry.counters.replies_delayed, 1);
}

#[tokio::test]
async fn reply_delay_follows_config() {
    let t = spawn_with(FsConfig { randomized_delays: false, ..FsConfig::default() });
    let p = peer(6);
    t.node.peer_connected(p).await.unwrap();
    let data = b"anonymity one, no delay".to_vec();
    let query = store_with_anonymity(&t.datastore, data.clone(), 1).await;

    t.node.handle_peer_message(p, get(query, 30)).await.unwrap();
    t.transport
        .wait_for(&p, |m| matches!(m, PeerMessage::Put(put) if put.data == data))
        .await
        .expect("reply sent");
    let telemetry = t.node.telemetry().await.unwrap();
    assert_eq!(telemetry.counters.replies_delayed, 0);
    assert_eq!(telemetry.counters.replies_dropped_cover, 0);
    assert_eq!(telemetry.counters.replies_to_peers, 1);
}

#[tokio::test]
async fn request_ceiling_evicts_peer_requests() {
    let t = spawn_with(FsConfig { max_pending_requests: 1, ..FsConfig::default() });
    let p = peer(8);
    t.node.peer_connected(p).await.unwrap();

    t.node.handle_peer_message(p, get([41; 32], 30)).await.unwrap();
    t.node.handle_peer_message(p, get([42; 32], 30)).await.unwrap();

    let telemetry = t.node.telemetry().await.unwrap();
    assert_eq!(telemetry.counters.requests_evicted, 1);
    assert_eq!(telemetry.pending_requests, 1);
}

#[tokio::test]
async fn self_connection_rejected() {
    let t = spawn();
    assert!(t.node.peer_connected(t.node.identity()).await.is_err());
    assert!(t.node.peer_connected(peer(1)).await.is_ok());
    assert!(t.node.peer_connected(peer(1)).await.is_err(), "already connected");
    assert_eq!(t.node.peers().await.unwrap().len(), 1);
}

#[tokio::test]
async fn index_lifecycle() {
    let t = spawn();
    let path = std::env::temp_dir().join(format!("korium-fs-index-{}", rand::random::<u64>()));
    tokio::fs::write(&path, b"indexed bytes").await.unwrap();
    let filename = path.to_string_lossy().to_string();
    let file_id = content_hash(b"indexed bytes");

    let wrong = t
        .node
        .index_start(IndexStart { filename: filename.clone(), file_id: [0; 32], device: 0, inode: 0 })
        .await
        .unwrap();
    assert!(matches!(wrong, ClientResponse::IndexStartFailed { .. }));

    let client = t.node.connect_client().await.unwrap();
    let request = IndexStart { filename, file_id, device: 0, inode: 0 };
    let ok = t.node.handle_client(client.id, ClientRequest::IndexStart(request)).await.unwrap();
    assert_eq!(ok, Some(ClientResponse::IndexStartOk));

    let files = t.node.index_list().await.unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].file_id, file_id);

    t.node.unindex(file_id).await.unwrap();
    t.node.unindex(file_id).await.unwrap();
    assert!(t.node.index_list().await.unwrap().is_empty());
    let _ = tokio::fs::remove_file(&path).await;
}

#[tokio::test]
async fn loc_sign_verifies() {
    let t = spawn();
    let claim = LocationClaim {
        purpose: LOC_SIGNATURE_PURPOSE,
        expiration: 1_700_000_000_000_000,
        content_key: [1; 32],
        content_query: [2; 32],
        file_length: 4096,
    };
    let response = t.node.loc_sign(claim.clone()).await.unwrap();
    assert_eq!(response.peer, t.node.identity());
    assert_eq!(response.expiration, claim.expiration);
    let signature: [u8; 64] = response.signature.as_slice().try_into().unwrap();
    assert!(claim.verify(&t.node.identity(), &signature));

    let bad = LocationClaim { purpose: LOC_SIGNATURE_PURPOSE + 1, ..claim };
    assert!(t.node.loc_sign(bad).await.is_err());
}

#[tokio::test]
async fn latency_reports_move_average() {
    let t = spawn();
    let before = t.node.telemetry().await.unwrap().avg_latency;
    t.node.latency_report(peer(1), Duration::from_secs(60)).await.unwrap();
    let after = t.node.telemetry().await.unwrap().avg_latency;
    assert!(after > before);
    assert!(after < Duration::from_secs(1), "samples are capped and folded slowly");
}

#[tokio::test]
async fn shutdown_closes_actor() {
    let t = spawn();
    t.node.shutdown().await;
    let result = timeout(TEST_TIMEOUT, async {
        loop {
            if t.node.telemetry().await.is_err() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "handle should report the closed actor");
}
