//! # Korium FS - Anonymous File-Sharing Request Routing
//!
//! The routing core of an anonymous peer-to-peer file-sharing service:
//!
//! - **Admission**: load estimators decide whether a query is worth a
//!   datastore lookup at the priority it pays
//! - **Peers**: per-peer queues, reservations, respect and performance data
//! - **Pending requests**: one record per outstanding query, duplicate-reply
//!   filters, reply evaluation and fan-out
//! - **Planning**: per-peer retransmission schedules with exponential
//!   back-off, shared between compatible requests
//! - **Dispatch**: the single actor tying everything to the datastore, the
//!   DHT, the direct-peer channel and the transport
//!
//! ## Architecture
//!
//! All routing state is owned by one actor (see [`dispatch`]) and mutated
//! only from its command loop. Collaborators are async traits ([`protocols`])
//! called from spawned tasks that post their completions back to the actor.
//! [`FsNode`] is the cheap, cloneable handle in front of it.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | Public handle for clients, transports and operators |
//! | `dispatch` | The actor: message handling and collaborator plumbing |
//! | `pending` | Pending request table and local lookups |
//! | `planner` | Per-peer query scheduling |
//! | `peers` | Connected-peer registry and send queues |
//! | `load` | Load estimators |
//! | `context` | Process-wide routing state and counters |
//! | `block` | Block types, key derivation, reply evaluation |
//! | `bloom` | Duplicate-reply filters |
//! | `messages` | Wire codec for peer and client messages |
//! | `protocols` | Collaborator trait definitions |
//! | `memory` | In-memory collaborators |
//! | `identity` | Ed25519 identities and location signatures |
//! | `config` | Tunables |

mod block;
mod bloom;
mod config;
mod context;
mod dispatch;
mod identity;
mod load;
mod memory;
mod messages;
mod node;
mod peers;
mod pending;
mod planner;
mod protocols;

pub use block::{content_hash, get_key, BlockType, Evaluation, Key, DBLOCK_SIZE};
pub use bloom::ReplyFilter;
pub use config::FsConfig;
pub use context::{Counters, Telemetry};
pub use dispatch::{Collaborators, Violation, MAX_CONTENT_EXPIRATION, TTL_DECREMENT};
pub use identity::{Identity, Keypair, LocationClaim, LOC_SIGNATURE_PURPOSE};
pub use load::{LoadValue, LoadVerdict};
pub use memory::{
    on_demand_placeholder, MemoryCadet, MemoryDatastore, MemoryDht, MemoryIndex, MemoryNetwork, MemoryPeerstore,
    MemoryTransport,
};
pub use messages::{
    ClientRequest, ClientResponse, ClientResult, GetMessage, IndexStart, IndexedFile, LocSignResponse, MigrationStop,
    PeerMessage, PutMessage, StartSearch, WireError, SEARCH_OPTION_CONTINUED, SEARCH_OPTION_LOOPBACK_ONLY,
};
pub use node::{ClientSession, FsNode};
pub use peers::PeerSnapshot;
pub use pending::ClientId;
pub use protocols::{
    Cadet, CadetReply, Datastore, DatastorePut, DatastoreQuery, DatastoreRecord, Dht, DhtGet, DhtLookup, DhtResult,
    Indexing, Peerstore, PutOutcome, Reservation, Transport,
};
