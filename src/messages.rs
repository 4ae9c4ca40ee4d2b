//! # Wire Protocol Messages
//!
//! Two families of messages live here:
//!
//! | Family | Encoding | Types |
//! |--------|----------|-------|
//! | Peer protocol | bit-exact, big-endian, `size:u16 type:u16` header | GET, PUT, MIGRATION_STOP |
//! | Client protocol | bincode with size limits | [`ClientRequest`], [`ClientResponse`] |
//!
//! ## GET layout
//!
//! ```text
//! header | type u32 | priority u32 | ttl i32 (s) | filter_mutator u32 | hash_bitmap u32 | query [32]
//!        | return-to peer [32] (bit 0) | transmit-to peer [32] (bit 1) | bloom filter bytes
//! ```
//!
//! The bloom filter fills the rest of the message; its length must be zero
//! or a power of two.

use std::time::Duration;

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::block::{BlockType, Key};
use crate::identity::{Identity, LocationClaim};

pub const MESSAGE_TYPE_FS_GET: u16 = 137;
pub const MESSAGE_TYPE_FS_PUT: u16 = 138;
pub const MESSAGE_TYPE_FS_MIGRATION_STOP: u16 = 139;

/// Largest message the 16-bit size field can describe.
pub const MAX_MESSAGE_SIZE: usize = u16::MAX as usize;

pub const HEADER_SIZE: usize = 4;
pub const GET_FIXED_SIZE: usize = HEADER_SIZE + 5 * 4 + 32;
pub const PUT_FIXED_SIZE: usize = HEADER_SIZE + 4 + 8;
pub const MIGRATION_STOP_SIZE: usize = HEADER_SIZE + 4 + 8;

/// GET carries a "return replies to this peer" identity.
pub const GET_BIT_RETURN_TO: u32 = 1;
/// GET carries a "forward to this peer" identity.
pub const GET_BIT_TRANSMIT_TO: u32 = 2;

/// Absolute time meaning "never expires".
pub const FOREVER_ABS: u64 = u64::MAX;

/// Maximum buffer size for client message deserialization.
pub const MAX_DESERIALIZE_SIZE: u64 = (MAX_MESSAGE_SIZE as u64) * 4;

/// Client search option: more known-reply fragments follow, do not start yet.
pub const SEARCH_OPTION_CONTINUED: u32 = 1;
/// Client search option: answer from the local datastore only.
pub const SEARCH_OPTION_LOOPBACK_ONLY: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Fewer bytes than the fixed part of the message.
    Truncated { needed: usize, got: usize },
    /// Header size field disagrees with the buffer length.
    SizeMismatch { declared: usize, actual: usize },
    UnknownMessageType(u16),
    UnknownBlockType(u32),
    /// The hash bitmap announces more peer identities than the message holds.
    MissingPeerIdentities { bits: u32 },
    /// Bloom filter length is not a power of two.
    BadFilterSize(usize),
    NonZeroReserved(u32),
    TooLarge(usize),
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncated { needed, got } => write!(f, "message truncated: need {needed} bytes, got {got}"),
            Self::SizeMismatch { declared, actual } => {
                write!(f, "header declares {declared} bytes but message has {actual}")
            }
            Self::UnknownMessageType(t) => write!(f, "unknown message type {t}"),
            Self::UnknownBlockType(t) => write!(f, "unknown block type {t}"),
            Self::MissingPeerIdentities { bits } => {
                write!(f, "hash bitmap {bits:#x} announces missing peer identities")
            }
            Self::BadFilterSize(len) => write!(f, "bloom filter size {len} is not a power of two"),
            Self::NonZeroReserved(v) => write!(f, "reserved field must be zero, got {v}"),
            Self::TooLarge(len) => write!(f, "message of {len} bytes exceeds maximum"),
        }
    }
}

impl std::error::Error for WireError {}

/// Content query sent between peers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetMessage {
    pub block_type: BlockType,
    pub priority: u32,
    /// Relative time-to-live in seconds; negative values are already past.
    pub ttl: i32,
    pub filter_mutator: u32,
    pub query: Key,
    pub return_to: Option<Identity>,
    pub transmit_to: Option<Identity>,
    pub bloom: Vec<u8>,
}

/// Content reply sent between peers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PutMessage {
    pub block_type: BlockType,
    /// Absolute expiration in microseconds since the UNIX epoch.
    pub expiration: u64,
    pub data: Vec<u8>,
}

/// Request to stop pushing unsolicited content for a while.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MigrationStop {
    pub duration: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerMessage {
    Get(GetMessage),
    Put(PutMessage),
    MigrationStop(MigrationStop),
}

fn put_header(out: &mut Vec<u8>, size: usize, message_type: u16) {
    out.extend_from_slice(&(size as u16).to_be_bytes());
    out.extend_from_slice(&message_type.to_be_bytes());
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&bytes[at..at + 8]);
    u64::from_be_bytes(arr)
}

fn read_key(bytes: &[u8], at: usize) -> Key {
    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes[at..at + 32]);
    key
}

fn block_type(raw: u32) -> Result<BlockType, WireError> {
    BlockType::from_u32(raw).ok_or(WireError::UnknownBlockType(raw))
}

impl GetMessage {
    pub fn hash_bitmap(&self) -> u32 {
        let mut bm = 0;
        if self.return_to.is_some() {
            bm |= GET_BIT_RETURN_TO;
        }
        if self.transmit_to.is_some() {
            bm |= GET_BIT_TRANSMIT_TO;
        }
        bm
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let peers = self.return_to.iter().chain(self.transmit_to.iter());
        let size = GET_FIXED_SIZE + 32 * peers.clone().count() + self.bloom.len();
        if size > MAX_MESSAGE_SIZE {
            return Err(WireError::TooLarge(size));
        }
        let mut out = Vec::with_capacity(size);
        put_header(&mut out, size, MESSAGE_TYPE_FS_GET);
        out.extend_from_slice(&self.block_type.to_u32().to_be_bytes());
        out.extend_from_slice(&self.priority.to_be_bytes());
        out.extend_from_slice(&self.ttl.to_be_bytes());
        out.extend_from_slice(&self.filter_mutator.to_be_bytes());
        out.extend_from_slice(&self.hash_bitmap().to_be_bytes());
        out.extend_from_slice(&self.query);
        for peer in peers {
            out.extend_from_slice(peer.as_bytes());
        }
        out.extend_from_slice(&self.bloom);
        Ok(out)
    }

    fn decode_body(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < GET_FIXED_SIZE {
            return Err(WireError::Truncated { needed: GET_FIXED_SIZE, got: bytes.len() });
        }
        let block_type = block_type(read_u32(bytes, 4))?;
        let priority = read_u32(bytes, 8);
        let ttl = read_u32(bytes, 12) as i32;
        let filter_mutator = read_u32(bytes, 16);
        let bitmap = read_u32(bytes, 20);
        let query = read_key(bytes, 24);

        let announced = bitmap.count_ones() as usize;
        let peers_end = GET_FIXED_SIZE + 32 * announced;
        if bytes.len() < peers_end {
            return Err(WireError::MissingPeerIdentities { bits: bitmap });
        }
        let mut offset = GET_FIXED_SIZE;
        let mut next_peer = || {
            let id = Identity::from_bytes(read_key(bytes, offset));
            offset += 32;
            id
        };
        let return_to = (bitmap & GET_BIT_RETURN_TO != 0).then(&mut next_peer);
        let transmit_to = (bitmap & GET_BIT_TRANSMIT_TO != 0).then(&mut next_peer);

        let bloom = bytes[peers_end..].to_vec();
        if !bloom.is_empty() && !bloom.len().is_power_of_two() {
            return Err(WireError::BadFilterSize(bloom.len()));
        }
        Ok(Self { block_type, priority, ttl, filter_mutator, query, return_to, transmit_to, bloom })
    }
}

impl PutMessage {
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let size = PUT_FIXED_SIZE + self.data.len();
        if size > MAX_MESSAGE_SIZE {
            return Err(WireError::TooLarge(size));
        }
        let mut out = Vec::with_capacity(size);
        put_header(&mut out, size, MESSAGE_TYPE_FS_PUT);
        out.extend_from_slice(&self.block_type.to_u32().to_be_bytes());
        out.extend_from_slice(&self.expiration.to_be_bytes());
        out.extend_from_slice(&self.data);
        Ok(out)
    }

    fn decode_body(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < PUT_FIXED_SIZE {
            return Err(WireError::Truncated { needed: PUT_FIXED_SIZE, got: bytes.len() });
        }
        Ok(Self {
            block_type: block_type(read_u32(bytes, 4))?,
            expiration: read_u64(bytes, 8),
            data: bytes[PUT_FIXED_SIZE..].to_vec(),
        })
    }
}

impl MigrationStop {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MIGRATION_STOP_SIZE);
        put_header(&mut out, MIGRATION_STOP_SIZE, MESSAGE_TYPE_FS_MIGRATION_STOP);
        out.extend_from_slice(&0u32.to_be_bytes());
        let micros = u64::try_from(self.duration.as_micros()).unwrap_or(u64::MAX);
        out.extend_from_slice(&micros.to_be_bytes());
        out
    }

    fn decode_body(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() != MIGRATION_STOP_SIZE {
            return Err(WireError::SizeMismatch { declared: MIGRATION_STOP_SIZE, actual: bytes.len() });
        }
        let reserved = read_u32(bytes, 4);
        if reserved != 0 {
            return Err(WireError::NonZeroReserved(reserved));
        }
        Ok(Self { duration: Duration::from_micros(read_u64(bytes, 8)) })
    }
}

impl PeerMessage {
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < HEADER_SIZE {
            return Err(WireError::Truncated { needed: HEADER_SIZE, got: bytes.len() });
        }
        let declared = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
        if declared != bytes.len() {
            return Err(WireError::SizeMismatch { declared, actual: bytes.len() });
        }
        match u16::from_be_bytes([bytes[2], bytes[3]]) {
            MESSAGE_TYPE_FS_GET => GetMessage::decode_body(bytes).map(Self::Get),
            MESSAGE_TYPE_FS_PUT => PutMessage::decode_body(bytes).map(Self::Put),
            MESSAGE_TYPE_FS_MIGRATION_STOP => MigrationStop::decode_body(bytes).map(Self::MigrationStop),
            other => Err(WireError::UnknownMessageType(other)),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        match self {
            Self::Get(m) => m.encode(),
            Self::Put(m) => m.encode(),
            Self::MigrationStop(m) => Ok(m.encode()),
        }
    }
}

// ============================================================================
// Client protocol
// ============================================================================

/// Start (or extend) a search on behalf of a local client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartSearch {
    pub block_type: BlockType,
    pub anonymity: u32,
    /// Bitmask of `SEARCH_OPTION_*`.
    pub options: u32,
    /// Peer known to have the content (enables direct-peer lookups).
    pub target: Option<Identity>,
    pub query: Key,
    /// Content hashes of results the client already has.
    pub known_replies: Vec<Key>,
}

/// A result delivered to a local client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientResult {
    pub block_type: BlockType,
    pub expiration: u64,
    /// When the request was last sent to the peer that answered (µs since
    /// epoch); `None` for local answers or if it was never sent there.
    pub last_transmission: Option<u64>,
    pub num_transmissions: u32,
    pub respect_offered: u32,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStart {
    pub filename: String,
    pub file_id: Key,
    /// Device and inode observed by the client; `0` when unknown.
    pub device: u64,
    pub inode: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedFile {
    pub filename: String,
    pub file_id: Key,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocSignResponse {
    pub peer: Identity,
    pub signature: Vec<u8>,
    pub expiration: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientRequest {
    StartSearch(StartSearch),
    IndexStart(IndexStart),
    IndexList,
    Unindex { file_id: Key },
    LocSign(LocationClaim),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientResponse {
    Result(ClientResult),
    IndexStartOk,
    IndexStartFailed { reason: String },
    IndexList(Vec<IndexedFile>),
    UnindexOk,
    LocSign(LocSignResponse),
}

/// Returns bincode options with size limits enforced.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn serialize_client<T: Serialize>(message: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(byte: u8) -> Identity {
        Identity::from_bytes([byte; 32])
    }

    fn sample_get() -> GetMessage {
        GetMessage {
            block_type: BlockType::UBlock,
            priority: 17,
            ttl: -30,
            filter_mutator: 0xcafe_babe,
            query: [9u8; 32],
            return_to: Some(peer(1)),
            transmit_to: Some(peer(2)),
            bloom: vec![0xaa; 16],
        }
    }

    #[test]
    fn get_layout_is_bit_exact() {
        let bytes = sample_get().encode().unwrap();
        assert_eq!(bytes.len(), GET_FIXED_SIZE + 64 + 16);
        assert_eq!(&bytes[0..2], &(bytes.len() as u16).to_be_bytes());
        assert_eq!(&bytes[2..4], &MESSAGE_TYPE_FS_GET.to_be_bytes());
        assert_eq!(&bytes[4..8], &9u32.to_be_bytes());
        assert_eq!(&bytes[8..12], &17u32.to_be_bytes());
        assert_eq!(&bytes[12..16], &(-30i32).to_be_bytes());
        assert_eq!(&bytes[20..24], &3u32.to_be_bytes());
        assert_eq!(&bytes[56..88], peer(1).as_bytes());
        assert_eq!(&bytes[88..120], peer(2).as_bytes());
        assert_eq!(PeerMessage::decode(&bytes).unwrap(), PeerMessage::Get(sample_get()));
    }

    #[test]
    fn get_transmit_to_only_uses_first_slot() {
        let mut get = sample_get();
        get.return_to = None;
        get.bloom.clear();
        let bytes = get.encode().unwrap();
        assert_eq!(bytes.len(), GET_FIXED_SIZE + 32);
        assert_eq!(PeerMessage::decode(&bytes).unwrap(), PeerMessage::Get(get));
    }

    #[test]
    fn get_with_bad_filter_size_rejected() {
        let mut get = sample_get();
        get.bloom = vec![0; 12];
        let bytes = get.encode().unwrap();
        assert_eq!(PeerMessage::decode(&bytes), Err(WireError::BadFilterSize(12)));
    }

    #[test]
    fn get_bitmap_without_identities_rejected() {
        let mut get = sample_get();
        get.return_to = None;
        get.transmit_to = None;
        get.bloom.clear();
        let mut bytes = get.encode().unwrap();
        bytes[20..24].copy_from_slice(&3u32.to_be_bytes());
        assert!(matches!(PeerMessage::decode(&bytes), Err(WireError::MissingPeerIdentities { .. })));
    }

    #[test]
    fn put_and_migration_stop_layouts() {
        let put = PutMessage { block_type: BlockType::DBlock, expiration: 1234, data: b"abc".to_vec() };
        let bytes = put.encode().unwrap();
        assert_eq!(bytes.len(), PUT_FIXED_SIZE + 3);
        assert_eq!(&bytes[8..16], &1234u64.to_be_bytes());
        assert_eq!(PeerMessage::decode(&bytes).unwrap(), PeerMessage::Put(put));

        let stop = MigrationStop { duration: Duration::from_secs(3) };
        let bytes = stop.encode();
        assert_eq!(bytes.len(), MIGRATION_STOP_SIZE);
        assert_eq!(&bytes[8..16], &3_000_000u64.to_be_bytes());
        assert_eq!(PeerMessage::decode(&bytes).unwrap(), PeerMessage::MigrationStop(stop));
    }

    #[test]
    fn migration_stop_reserved_must_be_zero() {
        let mut bytes = MigrationStop { duration: Duration::from_secs(1) }.encode();
        bytes[7] = 1;
        assert_eq!(PeerMessage::decode(&bytes), Err(WireError::NonZeroReserved(1)));
    }

    #[test]
    fn header_mismatch_and_unknown_types_rejected() {
        let mut bytes = MigrationStop { duration: Duration::ZERO }.encode();
        bytes.push(0);
        assert!(matches!(PeerMessage::decode(&bytes), Err(WireError::SizeMismatch { .. })));
        assert!(matches!(PeerMessage::decode(&[0, 4, 0, 1]), Err(WireError::UnknownMessageType(1))));
        assert!(matches!(PeerMessage::decode(&[0, 1]), Err(WireError::Truncated { .. })));
    }

    #[test]
    fn oversized_put_refused() {
        let put = PutMessage { block_type: BlockType::DBlock, expiration: 0, data: vec![0; MAX_MESSAGE_SIZE] };
        assert!(matches!(put.encode(), Err(WireError::TooLarge(_))));
    }

    #[test]
    fn client_messages_use_bounded_bincode() {
        let request = ClientRequest::StartSearch(StartSearch {
            block_type: BlockType::UBlock,
            anonymity: 1,
            options: SEARCH_OPTION_LOOPBACK_ONLY,
            target: None,
            query: [4u8; 32],
            known_replies: vec![[5u8; 32]],
        });
        let bytes = serialize_client(&request).unwrap();
        assert_eq!(deserialize_bounded::<ClientRequest>(&bytes).unwrap(), request);
        assert!(deserialize_bounded::<ClientRequest>(&bytes[..bytes.len() / 2]).is_err());
        assert!(deserialize_bounded::<ClientResponse>(&[0xff, 0xfe, 0xfd]).is_err());
    }
}
