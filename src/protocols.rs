//! Collaborator trait definitions for the request-routing core.
//!
//! The core never touches storage, the DHT or the network directly. Each
//! external service is reached through one of the traits below, and every
//! call is made from a task spawned by the dispatch actor so that a slow
//! collaborator never stalls request processing.
//!
//! | Collaborator | Trait | Purpose |
//! |--------------|-------|---------|
//! | Datastore | [`Datastore`] | Content-addressed local storage with a UID cursor |
//! | DHT | [`Dht`] | Zero-anonymity distributed lookups |
//! | Direct-peer channel | [`Cadet`] | Fetch a block from a known peer |
//! | Messaging | [`Transport`] | Deliver encoded messages, bandwidth reservation |
//! | Reputation store | [`Peerstore`] | Persist per-peer respect |
//! | Indexing | [`Indexing`] | Indexed-file bookkeeping and on-demand blocks |
//!
//! Implementations used by the binary and the tests live in
//! [`crate::memory`].

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::block::{BlockType, Key};
use crate::identity::Identity;
use crate::messages::IndexedFile;

/// One record returned by a datastore key lookup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatastoreRecord {
    pub key: Key,
    pub data: Vec<u8>,
    pub block_type: BlockType,
    pub priority: u32,
    pub anonymity: u32,
    pub replication: u32,
    /// Absolute expiration in microseconds since the UNIX epoch.
    pub expiration: u64,
    /// Position of this record in the datastore's iteration order.
    pub uid: u64,
}

/// Parameters of a single-record datastore lookup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatastoreQuery {
    pub key: Key,
    /// `BlockType::Any` matches every type.
    pub block_type: BlockType,
    /// Return the first record whose uid is at least this value.
    pub next_uid: u64,
    /// Start at a random position instead of `next_uid`.
    pub random: bool,
    pub queue_priority: u32,
    pub max_queue_size: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatastorePut {
    pub key: Key,
    pub data: Vec<u8>,
    pub block_type: BlockType,
    pub priority: u32,
    pub anonymity: u32,
    pub replication: u32,
    pub expiration: u64,
    pub queue_priority: u32,
    pub max_queue_size: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PutOutcome {
    Stored,
    /// The block is already present.
    Exists,
    /// Not stored for lack of space. The hint, if any, is the smallest
    /// expiration (µs since epoch) the datastore would still accept.
    Full { min_expiration: Option<u64> },
}

/// Content-addressed local storage.
#[async_trait]
pub trait Datastore: Send + Sync + 'static {
    /// Fetch one record stored under `query.key`, or `None` past the last one.
    async fn get_key(&self, query: DatastoreQuery) -> Result<Option<DatastoreRecord>>;

    async fn put(&self, put: DatastorePut) -> Result<PutOutcome>;

    /// Remove the record with exactly this key and data.
    async fn remove(&self, key: Key, data: Vec<u8>) -> Result<()>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DhtGet {
    pub block_type: BlockType,
    pub key: Key,
    pub replication: u32,
    /// Extra query scoping (reverse-route hint for forward-only requests).
    pub xquery: Option<Identity>,
    pub known_results: Vec<Key>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DhtResult {
    pub key: Key,
    pub block_type: BlockType,
    pub expiration: u64,
    pub data: Vec<u8>,
}

/// A running DHT lookup. Dropping `results` stops the lookup.
pub struct DhtLookup {
    pub results: mpsc::Receiver<DhtResult>,
    /// Content hashes the lookup should stop returning.
    pub known_results: mpsc::UnboundedSender<Vec<Key>>,
}

/// Distributed hash table.
#[async_trait]
pub trait Dht: Send + Sync + 'static {
    async fn get_start(&self, get: DhtGet) -> Result<DhtLookup>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CadetReply {
    pub block_type: BlockType,
    pub expiration: u64,
    pub data: Vec<u8>,
}

/// Direct-peer content channel.
#[async_trait]
pub trait Cadet: Send + Sync + 'static {
    /// Ask `target` for the block stored under `key`.
    async fn query(&self, target: Identity, key: Key, block_type: BlockType) -> Result<CadetReply>;
}

/// Outcome of a bandwidth reservation request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Reservation {
    /// Bytes granted; zero when the caller must retry.
    pub granted: u32,
    pub retry_after: Duration,
}

/// Peer-to-peer messaging layer.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Hand an encoded message to `to`'s queue. Completion means the message
    /// has left our queue, not that the peer processed it.
    async fn send(&self, to: &Identity, message: Vec<u8>) -> Result<()>;

    async fn reserve(&self, to: &Identity, amount: u32) -> Result<Reservation>;

    async fn change_preference(&self, to: &Identity, amount: f64) -> Result<()>;
}

/// Persistent per-peer key-value store.
#[async_trait]
pub trait Peerstore: Send + Sync + 'static {
    async fn get(&self, namespace: &str, peer: &Identity, key: &str) -> Result<Vec<Vec<u8>>>;

    /// Store `value`, replacing earlier values under the same key.
    async fn store(&self, namespace: &str, peer: &Identity, key: &str, value: Vec<u8>) -> Result<()>;
}

/// Indexed (externally stored) files.
#[async_trait]
pub trait Indexing: Send + Sync + 'static {
    async fn add_to_index(&self, filename: &str, file_id: Key) -> Result<()>;

    /// Returns whether the file was indexed.
    async fn unindex(&self, file_id: Key) -> Result<bool>;

    async fn list(&self) -> Result<Vec<IndexedFile>>;

    /// Device and inode of `filename`, if the platform reports them.
    async fn file_identity(&self, filename: &str) -> Result<Option<(u64, u64)>>;

    async fn hash_file(&self, filename: &str) -> Result<Key>;

    /// Materialize an on-demand placeholder record into the block it stands for.
    async fn resolve_on_demand(&self, record: DatastoreRecord) -> Result<DatastoreRecord>;
}
