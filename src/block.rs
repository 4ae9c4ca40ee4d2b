//! # Blocks and Reply Evaluation
//!
//! Content is addressed by 32-byte BLAKE3 keys. How a key is derived and how
//! a reply is judged depends on the [`BlockType`]:
//!
//! | Type | Key | Possible matches per query |
//! |------|-----|----------------------------|
//! | `DBlock` / `IBlock` | `blake3(data)` | exactly one |
//! | `UBlock` | `blake3(verification_key)` (first 32 bytes) | many |
//! | `OnDemand` | none (local placeholder for indexed files) | - |
//! | `Any` | none (wildcard used in queries only) | - |

use serde::{Deserialize, Serialize};

use crate::bloom::ReplyFilter;

/// Content hash used for queries, datastore keys and duplicate filters.
pub type Key = [u8; 32];

/// Size of the UBLOCK verification key prefix.
pub const UBLOCK_VERIFICATION_KEY_SIZE: usize = 32;

/// Maximum size of a data block.
pub const DBLOCK_SIZE: usize = 32 * 1024;

/// Hash a block's bytes; this is the value recorded in duplicate filters.
#[inline]
pub fn content_hash(data: &[u8]) -> Key {
    *blake3::hash(data).as_bytes()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockType {
    Any,
    DBlock,
    IBlock,
    OnDemand,
    UBlock,
}

impl BlockType {
    pub fn to_u32(self) -> u32 {
        match self {
            Self::Any => 0,
            Self::DBlock => 1,
            Self::IBlock => 2,
            Self::OnDemand => 6,
            Self::UBlock => 9,
        }
    }

    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Any),
            1 => Some(Self::DBlock),
            2 => Some(Self::IBlock),
            6 => Some(Self::OnDemand),
            9 => Some(Self::UBlock),
            _ => None,
        }
    }

    /// Whether requests of this type carry a duplicate-reply filter.
    pub fn supports_filter(self) -> bool {
        matches!(self, Self::UBlock | Self::Any)
    }

    /// Whether a reply of type `reply` can answer a request of this type.
    pub fn accepts(self, reply: BlockType) -> bool {
        self == Self::Any || self == reply
    }
}

/// Derive the key a block is stored and queried under.
pub fn get_key(block_type: BlockType, data: &[u8]) -> Option<Key> {
    match block_type {
        BlockType::DBlock | BlockType::IBlock => Some(content_hash(data)),
        BlockType::UBlock => {
            if data.len() < UBLOCK_VERIFICATION_KEY_SIZE {
                return None;
            }
            Some(content_hash(&data[..UBLOCK_VERIFICATION_KEY_SIZE]))
        }
        BlockType::OnDemand | BlockType::Any => None,
    }
}

/// Outcome of judging a reply against a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Evaluation {
    /// Valid new result; more may follow.
    OkMore,
    /// Valid result and provably the last one possible.
    OkLast,
    /// Already seen according to the duplicate filter.
    Duplicate,
    /// Malformed or inconsistent reply.
    Invalid,
    /// Well-formed but does not answer this query.
    Irrelevant,
    /// The block type has no evaluation rules.
    Unsupported,
}

impl Evaluation {
    /// Whether the reply should be delivered to the request's handler.
    pub fn is_match(self) -> bool {
        matches!(self, Self::OkMore | Self::OkLast)
    }
}

/// Judge `data` (of type `reply_type`) as an answer to `query`.
///
/// UBLOCK evaluation marks the reply as seen in `filter` (test-and-set), so a
/// second identical reply evaluates as [`Evaluation::Duplicate`].
pub fn evaluate(
    reply_type: BlockType,
    query: &Key,
    filter: Option<&mut ReplyFilter>,
    data: &[u8],
) -> Evaluation {
    match reply_type {
        BlockType::DBlock | BlockType::IBlock => {
            if content_hash(data) != *query {
                return Evaluation::Irrelevant;
            }
            Evaluation::OkLast
        }
        BlockType::UBlock => {
            let Some(key) = get_key(reply_type, data) else {
                return Evaluation::Invalid;
            };
            if key != *query {
                return Evaluation::Irrelevant;
            }
            let hash = content_hash(data);
            if let Some(filter) = filter {
                if filter.test_and_set(&hash) {
                    return Evaluation::Duplicate;
                }
            }
            Evaluation::OkMore
        }
        BlockType::OnDemand | BlockType::Any => Evaluation::Unsupported,
    }
}
