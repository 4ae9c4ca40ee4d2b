//! # Duplicate-Reply Filter
//!
//! A Bloom filter over content hashes of replies a requester already has.
//! Hashes are "mingled" with a per-filter 32-bit mutator before insertion so
//! that the same reply maps to different bits in different filters; the
//! mutator travels next to the filter bytes on the wire.
//!
//! False positives (a new reply treated as known) are tolerated. False
//! negatives are impossible: a hash that was added always tests positive.

use crate::block::Key;

/// Number of bit positions set per hash.
pub const BLOOMFILTER_K: usize = 16;

/// Smallest filter size in bytes.
pub const MIN_FILTER_SIZE: usize = 8;

/// Largest filter size in bytes.
pub const MAX_FILTER_SIZE: usize = 1 << 15;

/// Filter size (bytes) for `entry_count` known replies: the smallest power of
/// two that is at least [`MIN_FILTER_SIZE`] and `entry_count * K / 4`.
pub fn compute_filter_size(entry_count: usize) -> usize {
    let ideal = entry_count.saturating_mul(BLOOMFILTER_K) / 4;
    if entry_count > MAX_FILTER_SIZE {
        return MAX_FILTER_SIZE;
    }
    let mut size = MIN_FILTER_SIZE;
    while size < MAX_FILTER_SIZE && size < ideal {
        size *= 2;
    }
    size.min(MAX_FILTER_SIZE)
}

/// Combine `hash` with a filter mutator.
pub fn mingle(hash: &Key, mutator: u32) -> Key {
    let pad = blake3::hash(&mutator.to_be_bytes());
    let mut out = *hash;
    for (byte, m) in out.iter_mut().zip(pad.as_bytes()) {
        *byte ^= m;
    }
    out
}

#[derive(Clone, PartialEq, Eq)]
pub struct ReplyFilter {
    bits: Vec<u8>,
    mutator: u32,
}

impl ReplyFilter {
    /// Empty filter of `size` bytes (rounded up to a power of two, at least 1).
    pub fn with_size(size: usize, mutator: u32) -> Self {
        let size = size.max(1).next_power_of_two();
        Self { bits: vec![0u8; size], mutator }
    }

    /// Adopt filter bytes received from a peer. Returns `None` unless the
    /// length is a non-zero power of two.
    pub fn from_bytes(bytes: &[u8], mutator: u32) -> Option<Self> {
        if bytes.is_empty() || !bytes.len().is_power_of_two() {
            return None;
        }
        Some(Self { bits: bytes.to_vec(), mutator })
    }

    /// Fresh filter sized for `hashes` containing all of them.
    pub fn for_replies(hashes: &[Key], mutator: u32) -> Self {
        let mut filter = Self::with_size(compute_filter_size(hashes.len()), mutator);
        for hash in hashes {
            filter.insert(hash);
        }
        filter
    }

    fn positions(&self, hash: &Key) -> [usize; BLOOMFILTER_K] {
        let mingled = mingle(hash, self.mutator);
        let mut stream = [0u8; BLOOMFILTER_K * 4];
        blake3::Hasher::new()
            .update(&mingled)
            .finalize_xof()
            .fill(&mut stream);
        let bit_count = self.bits.len() * 8;
        let mut out = [0usize; BLOOMFILTER_K];
        for (slot, chunk) in out.iter_mut().zip(stream.chunks_exact(4)) {
            let word = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            *slot = word as usize % bit_count;
        }
        out
    }

    pub fn insert(&mut self, hash: &Key) {
        for pos in self.positions(hash) {
            self.bits[pos / 8] |= 1 << (pos % 8);
        }
    }

    pub fn contains(&self, hash: &Key) -> bool {
        self.positions(hash)
            .iter()
            .all(|&pos| self.bits[pos / 8] & (1 << (pos % 8)) != 0)
    }

    /// Report whether `hash` was present, inserting it either way.
    pub fn test_and_set(&mut self, hash: &Key) -> bool {
        let present = self.contains(hash);
        if !present {
            self.insert(hash);
        }
        present
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn mutator(&self) -> u32 {
        self.mutator
    }

    pub fn size(&self) -> usize {
        self.bits.len()
    }
}

impl std::fmt::Debug for ReplyFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplyFilter")
            .field("size", &self.bits.len())
            .field("mutator", &self.mutator)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::content_hash;

    #[test]
    fn sizes_are_bounded_powers_of_two() {
        assert_eq!(compute_filter_size(0), MIN_FILTER_SIZE);
        assert_eq!(compute_filter_size(2), MIN_FILTER_SIZE);
        assert_eq!(compute_filter_size(3), 16);
        assert_eq!(compute_filter_size(100), 512);
        assert_eq!(compute_filter_size(1_000_000), MAX_FILTER_SIZE);
        for n in [1, 7, 33, 900, 9000] {
            assert!(compute_filter_size(n).is_power_of_two());
        }
    }

    #[test]
    fn no_false_negatives() {
        let hashes: Vec<Key> = (0..200u32).map(|i| content_hash(&i.to_be_bytes())).collect();
        let filter = ReplyFilter::for_replies(&hashes, 0xdead_beef);
        for hash in &hashes {
            assert!(filter.contains(hash));
        }
    }

    #[test]
    fn mutator_changes_bit_layout() {
        let hash = content_hash(b"reply");
        let mut a = ReplyFilter::with_size(64, 1);
        let mut b = ReplyFilter::with_size(64, 2);
        a.insert(&hash);
        b.insert(&hash);
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn received_bytes_must_be_power_of_two() {
        assert!(ReplyFilter::from_bytes(&[0u8; 24], 0).is_none());
        assert!(ReplyFilter::from_bytes(&[], 0).is_none());
        let filter = ReplyFilter::from_bytes(&[0u8; 32], 5).unwrap();
        assert_eq!(filter.size(), 32);
        assert_eq!(filter.mutator(), 5);
    }

    #[test]
    fn test_and_set_reports_prior_presence() {
        let hash = content_hash(b"x");
        let mut filter = ReplyFilter::with_size(128, 77);
        assert!(!filter.test_and_set(&hash));
        assert!(filter.test_and_set(&hash));
    }

    #[test]
    fn filter_survives_wire_transfer() {
        let hash = content_hash(b"known");
        let filter = ReplyFilter::for_replies(&[hash], 12345);
        let received = ReplyFilter::from_bytes(filter.as_bytes(), filter.mutator()).unwrap();
        assert!(received.contains(&hash));
    }
}
