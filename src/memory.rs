//! In-memory collaborators.
//!
//! Everything here implements the traits of [`crate::protocols`] without
//! touching the network: a bounded datastore with a UID cursor, a shared
//! DHT, a direct-peer channel that reads other nodes' datastores, a
//! reputation store, file indexing over the local filesystem, and a
//! [`MemoryNetwork`] that wires several [`FsNode`]s together.

use std::collections::{BTreeMap, HashMap};
use std::io::SeekFrom;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, trace};

use crate::block::{self, content_hash, BlockType, Key, DBLOCK_SIZE};
use crate::config::FsConfig;
use crate::dispatch::Collaborators;
use crate::identity::{Identity, Keypair};
use crate::messages::{IndexedFile, FOREVER_ABS};
use crate::node::FsNode;
use crate::protocols::{
    Cadet, CadetReply, Datastore, DatastorePut, DatastoreQuery, DatastoreRecord, Dht, DhtGet, DhtLookup,
    DhtResult, Indexing, Peerstore, PutOutcome, Reservation, Transport,
};

/// Size of an on-demand placeholder: file id then big-endian offset.
pub const ON_DEMAND_SIZE: usize = 32 + 8;

/// Encode the placeholder stored for block `offset` of an indexed file.
pub fn on_demand_placeholder(file_id: Key, offset: u64) -> Vec<u8> {
    let mut data = Vec::with_capacity(ON_DEMAND_SIZE);
    data.extend_from_slice(&file_id);
    data.extend_from_slice(&offset.to_be_bytes());
    data
}

fn parse_on_demand(data: &[u8]) -> Option<(Key, u64)> {
    if data.len() != ON_DEMAND_SIZE {
        return None;
    }
    let file_id: Key = data[..32].try_into().ok()?;
    let offset = u64::from_be_bytes(data[32..].try_into().ok()?);
    Some((file_id, offset))
}

// ============================================================================
// Datastore
// ============================================================================

#[derive(Default)]
struct DatastoreState {
    records: BTreeMap<u64, DatastoreRecord>,
    next_uid: u64,
}

/// Bounded datastore keyed by insertion UID.
pub struct MemoryDatastore {
    state: Mutex<DatastoreState>,
    capacity: usize,
}

impl MemoryDatastore {
    pub fn new(capacity: usize) -> Self {
        Self { state: Mutex::new(DatastoreState::default()), capacity }
    }

    /// Store a block under its derived key. Returns the key.
    pub async fn insert_block(&self, block_type: BlockType, data: Vec<u8>) -> Result<Key> {
        let key = block::get_key(block_type, &data).ok_or_else(|| anyhow!("cannot derive key for {block_type:?}"))?;
        self.insert_record(key, block_type, data).await;
        Ok(key)
    }

    /// Store raw data under `key` without checking it.
    pub async fn insert_record(&self, key: Key, block_type: BlockType, data: Vec<u8>) -> u64 {
        let mut state = self.state.lock().await;
        state.next_uid += 1;
        let uid = state.next_uid;
        state.records.insert(uid, DatastoreRecord {
            key,
            data,
            block_type,
            priority: 0,
            anonymity: 0,
            replication: 0,
            expiration: FOREVER_ABS,
            uid,
        });
        uid
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn contains(&self, key: &Key) -> bool {
        self.state.lock().await.records.values().any(|r| r.key == *key)
    }
}

#[async_trait]
impl Datastore for MemoryDatastore {
    async fn get_key(&self, query: DatastoreQuery) -> Result<Option<DatastoreRecord>> {
        let state = self.state.lock().await;
        let matches = |r: &&DatastoreRecord| {
            r.key == query.key && (query.block_type == BlockType::Any || r.block_type == query.block_type)
        };
        if query.random {
            let candidates: Vec<_> = state.records.range(query.next_uid..).map(|(_, r)| r).filter(matches).collect();
            if candidates.is_empty() {
                return Ok(None);
            }
            let pick = rand::thread_rng().gen_range(0..candidates.len());
            return Ok(Some(candidates[pick].clone()));
        }
        Ok(state.records.range(query.next_uid..).map(|(_, r)| r).find(matches).cloned())
    }

    async fn put(&self, put: DatastorePut) -> Result<PutOutcome> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.records.values_mut().find(|r| r.key == put.key && r.data == put.data) {
            existing.priority = existing.priority.saturating_add(put.priority);
            existing.expiration = existing.expiration.max(put.expiration);
            return Ok(PutOutcome::Exists);
        }
        if state.records.len() >= self.capacity {
            let min_expiration = state.records.values().map(|r| r.expiration).min();
            return Ok(PutOutcome::Full { min_expiration });
        }
        state.next_uid += 1;
        let uid = state.next_uid;
        state.records.insert(uid, DatastoreRecord {
            key: put.key,
            data: put.data,
            block_type: put.block_type,
            priority: put.priority,
            anonymity: put.anonymity,
            replication: put.replication,
            expiration: put.expiration,
            uid,
        });
        Ok(PutOutcome::Stored)
    }

    async fn remove(&self, key: Key, data: Vec<u8>) -> Result<()> {
        let mut state = self.state.lock().await;
        state.records.retain(|_, r| !(r.key == key && r.data == data));
        Ok(())
    }
}

// ============================================================================
// Peerstore
// ============================================================================

#[derive(Default)]
pub struct MemoryPeerstore {
    values: Mutex<HashMap<(String, Identity, String), Vec<u8>>>,
}

impl MemoryPeerstore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Peerstore for MemoryPeerstore {
    async fn get(&self, namespace: &str, peer: &Identity, key: &str) -> Result<Vec<Vec<u8>>> {
        let values = self.values.lock().await;
        Ok(values
            .get(&(namespace.to_string(), *peer, key.to_string()))
            .cloned()
            .into_iter()
            .collect())
    }

    async fn store(&self, namespace: &str, peer: &Identity, key: &str, value: Vec<u8>) -> Result<()> {
        self.values
            .lock()
            .await
            .insert((namespace.to_string(), *peer, key.to_string()), value);
        Ok(())
    }
}

// ============================================================================
// Indexing
// ============================================================================

/// Indexed files on the local filesystem.
#[derive(Default)]
pub struct MemoryIndex {
    files: RwLock<HashMap<Key, String>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Indexing for MemoryIndex {
    async fn add_to_index(&self, filename: &str, file_id: Key) -> Result<()> {
        self.files.write().await.insert(file_id, filename.to_string());
        debug!(file = %filename, "file indexed");
        Ok(())
    }

    async fn unindex(&self, file_id: Key) -> Result<bool> {
        Ok(self.files.write().await.remove(&file_id).is_some())
    }

    async fn list(&self) -> Result<Vec<IndexedFile>> {
        let files = self.files.read().await;
        let mut list: Vec<_> = files
            .iter()
            .map(|(file_id, filename)| IndexedFile { filename: filename.clone(), file_id: *file_id })
            .collect();
        list.sort_by(|a, b| a.filename.cmp(&b.filename));
        Ok(list)
    }

    async fn file_identity(&self, filename: &str) -> Result<Option<(u64, u64)>> {
        let meta = tokio::fs::metadata(filename).await.with_context(|| format!("stat {filename}"))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            Ok(Some((meta.dev(), meta.ino())))
        }
        #[cfg(not(unix))]
        {
            let _ = meta;
            Ok(None)
        }
    }

    async fn hash_file(&self, filename: &str) -> Result<Key> {
        let data = tokio::fs::read(filename).await.with_context(|| format!("read {filename}"))?;
        Ok(content_hash(&data))
    }

    async fn resolve_on_demand(&self, record: DatastoreRecord) -> Result<DatastoreRecord> {
        let (file_id, offset) = parse_on_demand(&record.data).context("malformed on-demand placeholder")?;
        let filename = self
            .files
            .read()
            .await
            .get(&file_id)
            .cloned()
            .ok_or_else(|| anyhow!("file {} is not indexed", hex::encode(file_id)))?;
        let mut file = tokio::fs::File::open(&filename).await.with_context(|| format!("open {filename}"))?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut block = Vec::with_capacity(DBLOCK_SIZE);
        file.take(DBLOCK_SIZE as u64).read_to_end(&mut block).await?;
        if block.is_empty() {
            bail!("offset {offset} is past the end of {filename}");
        }
        Ok(DatastoreRecord {
            key: content_hash(&block),
            data: block,
            block_type: BlockType::DBlock,
            ..record
        })
    }
}

// ============================================================================
// DHT
// ============================================================================

/// A single shared table standing in for the whole DHT.
#[derive(Default)]
pub struct MemoryDht {
    values: RwLock<HashMap<Key, Vec<DhtResult>>>,
}

impl MemoryDht {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put(&self, block_type: BlockType, data: Vec<u8>, expiration: u64) -> Result<Key> {
        let key = block::get_key(block_type, &data).ok_or_else(|| anyhow!("cannot derive key for {block_type:?}"))?;
        self.values
            .write()
            .await
            .entry(key)
            .or_default()
            .push(DhtResult { key, block_type, expiration, data });
        Ok(key)
    }
}

#[async_trait]
impl Dht for MemoryDht {
    async fn get_start(&self, get: DhtGet) -> Result<DhtLookup> {
        let found: Vec<DhtResult> = self
            .values
            .read()
            .await
            .get(&get.key)
            .map(|results| {
                results
                    .iter()
                    .filter(|r| get.block_type.accepts(r.block_type))
                    .filter(|r| !get.known_results.contains(&content_hash(&r.data)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        let (results_tx, results) = mpsc::channel(found.len().max(1));
        let (known_results, mut known_rx) = mpsc::unbounded_channel::<Vec<Key>>();
        tokio::spawn(async move {
            for result in found {
                if results_tx.send(result).await.is_err() {
                    return;
                }
            }
            drop(results_tx);
            while let Some(known) = known_rx.recv().await {
                trace!(count = known.len(), "dht lookup learned known results");
            }
        });
        Ok(DhtLookup { results, known_results })
    }
}

// ============================================================================
// Direct-peer channel
// ============================================================================

/// Answers direct-peer queries from the target's own datastore.
#[derive(Default)]
pub struct MemoryCadet {
    stores: RwLock<HashMap<Identity, Arc<MemoryDatastore>>>,
}

impl MemoryCadet {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, peer: Identity, datastore: Arc<MemoryDatastore>) {
        self.stores.write().await.insert(peer, datastore);
    }
}

#[async_trait]
impl Cadet for MemoryCadet {
    async fn query(&self, target: Identity, key: Key, block_type: BlockType) -> Result<CadetReply> {
        let store = self
            .stores
            .read()
            .await
            .get(&target)
            .cloned()
            .ok_or_else(|| anyhow!("no channel to {target}"))?;
        let query = DatastoreQuery {
            key,
            block_type,
            next_uid: 0,
            random: false,
            queue_priority: 1,
            max_queue_size: u32::MAX,
        };
        let record = store
            .get_key(query)
            .await?
            .filter(|r| r.block_type != BlockType::OnDemand)
            .ok_or_else(|| anyhow!("{target} does not have the block"))?;
        Ok(CadetReply { block_type: record.block_type, expiration: record.expiration, data: record.data })
    }
}

// ============================================================================
// Network
// ============================================================================

/// Routes messages between nodes living in the same process.
#[derive(Default)]
pub struct MemoryNetwork {
    nodes: RwLock<HashMap<Identity, FsNode>>,
    dht: Arc<MemoryDht>,
    cadet: Arc<MemoryCadet>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn dht(&self) -> &Arc<MemoryDht> {
        &self.dht
    }

    /// Spawn a node backed by `datastore` and attach it to the network.
    pub async fn spawn_node(
        self: &Arc<Self>,
        keypair: Keypair,
        config: FsConfig,
        datastore: Arc<MemoryDatastore>,
    ) -> FsNode {
        let identity = keypair.identity();
        let collaborators = Collaborators {
            datastore: datastore.clone(),
            dht: self.dht.clone(),
            cadet: self.cadet.clone(),
            transport: Arc::new(MemoryTransport { local: identity, network: self.clone() }),
            peerstore: Arc::new(MemoryPeerstore::new()),
            indexing: Arc::new(MemoryIndex::new()),
        };
        let node = FsNode::spawn(keypair, config, collaborators);
        self.cadet.register(identity, datastore).await;
        self.nodes.write().await.insert(identity, node.clone());
        node
    }

    pub async fn node(&self, identity: &Identity) -> Option<FsNode> {
        self.nodes.read().await.get(identity).cloned()
    }

    /// Connect two nodes in both directions.
    pub async fn link(&self, a: &Identity, b: &Identity) -> Result<()> {
        let (na, nb) = self.pair(a, b).await?;
        na.peer_connected(*b).await?;
        nb.peer_connected(*a).await?;
        Ok(())
    }

    pub async fn unlink(&self, a: &Identity, b: &Identity) -> Result<()> {
        let (na, nb) = self.pair(a, b).await?;
        na.peer_disconnected(*b).await?;
        nb.peer_disconnected(*a).await?;
        Ok(())
    }

    async fn pair(&self, a: &Identity, b: &Identity) -> Result<(FsNode, FsNode)> {
        let nodes = self.nodes.read().await;
        let na = nodes.get(a).cloned().ok_or_else(|| anyhow!("unknown node {a}"))?;
        let nb = nodes.get(b).cloned().ok_or_else(|| anyhow!("unknown node {b}"))?;
        Ok((na, nb))
    }

    pub async fn shutdown(&self) {
        for node in self.nodes.write().await.drain().map(|(_, n)| n) {
            node.shutdown().await;
        }
    }
}

/// Transport of one node on a [`MemoryNetwork`].
pub struct MemoryTransport {
    local: Identity,
    network: Arc<MemoryNetwork>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, to: &Identity, message: Vec<u8>) -> Result<()> {
        let node = self.network.node(to).await.ok_or_else(|| anyhow!("peer {to} unreachable"))?;
        if let Err(e) = node.handle_peer_message(self.local, message).await {
            debug!(from = %self.local, to = %to, error = %e, "peer rejected message");
            node.peer_disconnected(self.local).await?;
        }
        Ok(())
    }

    async fn reserve(&self, _to: &Identity, amount: u32) -> Result<Reservation> {
        Ok(Reservation { granted: amount, retry_after: Duration::ZERO })
    }

    async fn change_preference(&self, _to: &Identity, _amount: f64) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(key: Key, next_uid: u64) -> DatastoreQuery {
        DatastoreQuery { key, block_type: BlockType::Any, next_uid, random: false, queue_priority: 1, max_queue_size: 16 }
    }

    fn put(data: &[u8]) -> DatastorePut {
        DatastorePut {
            key: content_hash(data),
            data: data.to_vec(),
            block_type: BlockType::DBlock,
            priority: 1,
            anonymity: 1,
            replication: 0,
            expiration: 1_000,
            queue_priority: 1,
            max_queue_size: 16,
        }
    }

    #[tokio::test]
    async fn datastore_cursor_walks_uids() {
        let ds = MemoryDatastore::new(16);
        let key = [7u8; 32];
        let first = ds.insert_record(key, BlockType::UBlock, b"one".to_vec()).await;
        ds.insert_record([8u8; 32], BlockType::UBlock, b"other".to_vec()).await;
        let third = ds.insert_record(key, BlockType::UBlock, b"two".to_vec()).await;

        let r = ds.get_key(query(key, 0)).await.unwrap().unwrap();
        assert_eq!(r.uid, first);
        let r = ds.get_key(query(key, first + 1)).await.unwrap().unwrap();
        assert_eq!(r.uid, third);
        assert!(ds.get_key(query(key, third + 1)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn datastore_put_outcomes() {
        let ds = MemoryDatastore::new(1);
        assert_eq!(ds.put(put(b"a")).await.unwrap(), PutOutcome::Stored);
        assert_eq!(ds.put(put(b"a")).await.unwrap(), PutOutcome::Exists);
        assert_eq!(
            ds.put(put(b"b")).await.unwrap(),
            PutOutcome::Full { min_expiration: Some(1_000) }
        );
        ds.remove(content_hash(b"a"), b"a".to_vec()).await.unwrap();
        assert!(ds.is_empty().await);
    }

    #[tokio::test]
    async fn on_demand_block_read_from_indexed_file() {
        let path = std::env::temp_dir().join(format!("korium-fs-index-{}", rand::random::<u64>()));
        let contents: Vec<u8> = (0..(DBLOCK_SIZE + 100)).map(|i| (i % 251) as u8).collect();
        tokio::fs::write(&path, &contents).await.unwrap();
        let filename = path.to_string_lossy().to_string();

        let index = MemoryIndex::new();
        let file_id = index.hash_file(&filename).await.unwrap();
        index.add_to_index(&filename, file_id).await.unwrap();

        let tail = &contents[DBLOCK_SIZE..];
        let record = DatastoreRecord {
            key: content_hash(tail),
            data: on_demand_placeholder(file_id, DBLOCK_SIZE as u64),
            block_type: BlockType::OnDemand,
            priority: 0,
            anonymity: 0,
            replication: 0,
            expiration: FOREVER_ABS,
            uid: 9,
        };
        let block = index.resolve_on_demand(record.clone()).await.unwrap();
        assert_eq!(block.data, tail);
        assert_eq!(block.key, content_hash(tail));
        assert_eq!(block.uid, 9);

        assert!(index.unindex(file_id).await.unwrap());
        assert!(index.resolve_on_demand(record).await.is_err());
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn dht_skips_known_results() {
        let dht = MemoryDht::new();
        let mut data = vec![1u8; 32];
        data.extend_from_slice(b"first");
        let key = dht.put(BlockType::UBlock, data.clone(), 10).await.unwrap();
        let mut second = vec![1u8; 32];
        second.extend_from_slice(b"second");
        dht.put(BlockType::UBlock, second.clone(), 10).await.unwrap();

        let get = DhtGet {
            block_type: BlockType::UBlock,
            key,
            replication: 5,
            xquery: None,
            known_results: vec![content_hash(&data)],
        };
        let mut lookup = dht.get_start(get).await.unwrap();
        let result = lookup.results.recv().await.unwrap();
        assert_eq!(result.data, second);
    }
}
