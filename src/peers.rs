//! # Peer Registry
//!
//! One [`ConnectedPeer`] per connected remote peer. The registry owns:
//!
//! - the outbound send queue, priority-descending with stable ties, plus an
//!   artificial-delay tier for anonymous replies
//! - bandwidth reservation state (one reserved block covers one query)
//! - performance statistics and the respect score
//! - migration blocks in both directions
//! - the map of requests this peer originated, keyed by query
//!
//! The registry performs no I/O. Its methods return what must happen next
//! (a message to hand off, a reservation to request, a value to persist) and
//! the dispatch actor carries it out.
//!
//! ## Migration blocks
//!
//! | Direction | Operation | Effect |
//! |-----------|-----------|--------|
//! | we ask the peer | [`PeerRegistry::block_migration`] | MIGRATION_STOP queued for the peer |
//! | the peer asks us | [`PeerRegistry::suspend_migration`] | content push suspended until revival |

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace};

use crate::block::{Key, DBLOCK_SIZE};
use crate::identity::Identity;
use crate::load::LoadValue;
use crate::pending::{ClientId, RequestId};

/// Entries in each successful-responder ring.
pub const RESPONDER_RING_SIZE: usize = 8;

/// Bandwidth reserved ahead of each outbound query.
pub const RESERVATION_SIZE: u32 = DBLOCK_SIZE as u32;

/// Longest wait before a failed reservation is retried.
pub const MAX_RESERVATION_RETRY: Duration = Duration::from_secs(5);

/// Shortest wait before a failed reservation is retried.
pub const MIN_RESERVATION_RETRY: Duration = Duration::from_millis(10);

/// Peerstore namespace and key under which respect is persisted.
pub const RESPECT_NAMESPACE: &str = "fs";
pub const RESPECT_KEY: &str = "respect";

/// Weight of the previous value in the reply-delay and priority averages.
const PERFORMANCE_WEIGHT: u32 = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransmissionKind {
    /// Needs a bandwidth reservation before hand-off.
    Query,
    Content,
    Neither,
}

#[derive(Clone, Debug)]
pub struct PendingTransmission {
    pub kind: TransmissionKind,
    pub priority: u32,
    pub message: Vec<u8>,
    pub queued_at: Instant,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerError {
    /// The local identity cannot be a connected peer.
    SelfConnect,
    AlreadyConnected(Identity),
}

impl std::fmt::Display for PeerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SelfConnect => write!(f, "refusing connection from the local identity"),
            Self::AlreadyConnected(id) => write!(f, "peer {id} is already connected"),
        }
    }
}

impl std::error::Error for PeerError {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransmitError {
    UnknownPeer,
    /// Too many queries already queued towards this peer.
    QueueFull,
}

impl std::fmt::Display for TransmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownPeer => write!(f, "peer is not connected"),
            Self::QueueFull => write!(f, "query queue towards peer is full"),
        }
    }
}

impl std::error::Error for TransmitError {}

/// Who initiated a request that a peer answered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Responder {
    Peer(Identity),
    Client(ClientId),
}

/// What the send queue wants next.
#[derive(Debug)]
pub enum NextTransmission {
    /// Nothing queued, or a previous message is still being handed off.
    Idle,
    /// The head is a query and a reservation must be requested first.
    Reserve { amount: u32 },
    /// Hand this message to the transport.
    Send(PendingTransmission),
}

/// Resources released by a disconnect.
#[derive(Debug, Default)]
pub struct Disconnected {
    pub session: u64,
    /// Respect to persist, if it changed since the last flush.
    pub flush_respect: Option<u32>,
    /// Requests this peer originated; the caller must hard-cancel them.
    pub requests: Vec<RequestId>,
    /// Queued messages discarded without being sent.
    pub discarded: usize,
}

/// Read-only view of one peer.
#[derive(Clone, Debug)]
pub struct PeerSnapshot {
    pub identity: Identity,
    pub avg_reply_delay: Duration,
    pub avg_priority: f64,
    pub pending_queries: u32,
    pub pending_replies: u32,
    pub delayed_replies: u32,
    pub respect: u32,
    pub transmission_load: f64,
    pub migration_blocked_until: Option<Instant>,
    pub push_suspended: bool,
    pub requests: usize,
    pub last_p2p_replies: Vec<Identity>,
    pub last_client_replies: Vec<ClientId>,
}

#[derive(Debug)]
pub struct ConnectedPeer {
    pub identity: Identity,
    /// Distinguishes this connection from earlier ones of the same peer.
    pub session: u64,

    avg_reply_delay: Duration,
    avg_priority: f64,
    last_p2p_replies: [Option<Identity>; RESPONDER_RING_SIZE],
    last_p2p_offset: usize,
    last_client_replies: [Option<ClientId>; RESPONDER_RING_SIZE],
    last_client_offset: usize,
    transmission_delay: LoadValue,

    pending_queries: u32,
    pending_replies: u32,
    delay_queue_size: u32,
    queue: VecDeque<PendingTransmission>,
    delayed: HashMap<u64, PendingTransmission>,
    next_delay_token: u64,
    in_flight: bool,

    did_reserve: bool,
    reserving: bool,
    inc_preference: f64,

    respect: u32,
    disk_respect: u32,
    respect_loaded: bool,

    /// Latest MIGRATION_STOP deadline we sent to this peer.
    last_migration_block: Option<Instant>,
    /// Deadline this peer asked us to honour.
    migration_blocked_until: Option<Instant>,
    push_suspended: bool,
    revive_armed: bool,
    /// Current pause length for unsolicited content that could not be cached.
    pub migration_delay: Duration,

    requests: HashMap<Key, Vec<RequestId>>,
}

impl ConnectedPeer {
    fn new(identity: Identity, session: u64) -> Self {
        Self {
            identity,
            session,
            avg_reply_delay: Duration::ZERO,
            avg_priority: 0.0,
            last_p2p_replies: [None; RESPONDER_RING_SIZE],
            last_p2p_offset: 0,
            last_client_replies: [None; RESPONDER_RING_SIZE],
            last_client_offset: 0,
            transmission_delay: LoadValue::new(),
            pending_queries: 0,
            pending_replies: 0,
            delay_queue_size: 0,
            queue: VecDeque::new(),
            delayed: HashMap::new(),
            next_delay_token: 0,
            in_flight: false,
            did_reserve: false,
            reserving: false,
            inc_preference: 0.0,
            respect: 0,
            disk_respect: 0,
            respect_loaded: false,
            last_migration_block: None,
            migration_blocked_until: None,
            // Push stays off until respect has been loaded.
            push_suspended: true,
            revive_armed: false,
            migration_delay: Duration::ZERO,
            requests: HashMap::new(),
        }
    }

    pub fn respect(&self) -> u32 {
        self.respect
    }

    pub fn pending_replies(&self) -> u32 {
        self.pending_replies
    }

    pub fn pending_queries(&self) -> u32 {
        self.pending_queries
    }

    pub fn delay_queue_size(&self) -> u32 {
        self.delay_queue_size
    }

    pub fn transmission_load(&self) -> f64 {
        self.transmission_delay.load()
    }

    /// Average hand-off delay in milliseconds.
    pub fn transmission_average(&self) -> f64 {
        self.transmission_delay.average()
    }

    pub fn push_suspended(&self) -> bool {
        self.push_suspended
    }

    pub fn migration_blocked_until(&self) -> Option<Instant> {
        self.migration_blocked_until
    }

    /// Saturating respect change; returns the delta actually applied.
    pub fn adjust_respect(&mut self, delta: i64) -> i64 {
        let before = self.respect as i64;
        let after = (before + delta).clamp(0, u32::MAX as i64);
        self.respect = after as u32;
        after - before
    }

    /// Requests this peer originated for `query`.
    pub fn requests_for(&self, query: &Key) -> &[RequestId] {
        self.requests.get(query).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn add_request(&mut self, query: Key, id: RequestId) {
        self.requests.entry(query).or_default().push(id);
    }

    /// Returns whether the request was in the map.
    pub fn remove_request(&mut self, query: &Key, id: RequestId) -> bool {
        let Some(ids) = self.requests.get_mut(query) else {
            return false;
        };
        let before = ids.len();
        ids.retain(|r| *r != id);
        let removed = ids.len() != before;
        if ids.is_empty() {
            self.requests.remove(query);
        }
        removed
    }

    pub fn request_count(&self) -> usize {
        self.requests.values().map(Vec::len).sum()
    }

    fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            identity: self.identity,
            avg_reply_delay: self.avg_reply_delay,
            avg_priority: self.avg_priority,
            pending_queries: self.pending_queries,
            pending_replies: self.pending_replies,
            delayed_replies: self.delay_queue_size,
            respect: self.respect,
            transmission_load: self.transmission_delay.load(),
            migration_blocked_until: self.migration_blocked_until,
            push_suspended: self.push_suspended,
            requests: self.request_count(),
            last_p2p_replies: self.last_p2p_replies.iter().flatten().copied().collect(),
            last_client_replies: self.last_client_replies.iter().flatten().copied().collect(),
        }
    }

    fn enqueue(&mut self, entry: PendingTransmission) {
        match entry.kind {
            TransmissionKind::Query => self.pending_queries += 1,
            _ => self.pending_replies += 1,
        }
        let at = self
            .queue
            .iter()
            .position(|queued| queued.priority < entry.priority)
            .unwrap_or(self.queue.len());
        self.queue.insert(at, entry);
    }

    fn release_counter(&mut self, kind: TransmissionKind) {
        match kind {
            TransmissionKind::Query => self.pending_queries -= 1,
            _ => self.pending_replies -= 1,
        }
    }
}

/// Registry of connected peers.
#[derive(Debug)]
pub struct PeerRegistry {
    local: Identity,
    peers: HashMap<Identity, ConnectedPeer>,
    next_session: u64,
    max_pending_queries: u32,
}

impl PeerRegistry {
    pub fn new(local: Identity, max_pending_queries: u32) -> Self {
        Self {
            local,
            peers: HashMap::new(),
            next_session: 1,
            max_pending_queries,
        }
    }

    /// Register a newly connected peer. The caller must then request the
    /// initial reservation and start loading respect.
    pub fn connect(&mut self, identity: Identity) -> Result<&mut ConnectedPeer, PeerError> {
        if identity == self.local {
            return Err(PeerError::SelfConnect);
        }
        if self.peers.contains_key(&identity) {
            return Err(PeerError::AlreadyConnected(identity));
        }
        let session = self.next_session;
        self.next_session += 1;
        let mut peer = ConnectedPeer::new(identity, session);
        peer.reserving = true;
        debug!(peer = %identity, session, "peer connected");
        Ok(self.peers.entry(identity).or_insert(peer))
    }

    /// Remove a peer, discarding everything still queued towards it.
    pub fn disconnect(&mut self, identity: &Identity) -> Option<Disconnected> {
        let mut peer = self.peers.remove(identity)?;
        let flush_respect = (peer.respect != peer.disk_respect).then_some(peer.respect);
        let mut discarded = 0;
        while let Some(entry) = peer.queue.pop_front() {
            peer.release_counter(entry.kind);
            discarded += 1;
        }
        discarded += peer.delayed.len();
        peer.delayed.clear();
        peer.delay_queue_size = 0;
        debug_assert_eq!(peer.pending_queries, 0);
        debug_assert_eq!(peer.pending_replies, 0);
        let requests = peer.requests.drain().flat_map(|(_, ids)| ids).collect();
        debug!(peer = %identity, discarded, "peer disconnected");
        Some(Disconnected { session: peer.session, flush_respect, requests, discarded })
    }

    pub fn get(&self, identity: &Identity) -> Option<&ConnectedPeer> {
        self.peers.get(identity)
    }

    pub fn get_mut(&mut self, identity: &Identity) -> Option<&mut ConnectedPeer> {
        self.peers.get_mut(identity)
    }

    /// The peer with `identity`, only if it is still the connection `session`.
    pub fn session_mut(&mut self, identity: &Identity, session: u64) -> Option<&mut ConnectedPeer> {
        self.peers.get_mut(identity).filter(|p| p.session == session)
    }

    pub fn is_connected(&self, identity: &Identity) -> bool {
        self.peers.contains_key(identity)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn identities(&self) -> Vec<Identity> {
        self.peers.keys().copied().collect()
    }

    /// Call `visitor` once per connected peer.
    pub fn iterate(&self, mut visitor: impl FnMut(&PeerSnapshot)) {
        for peer in self.peers.values() {
            visitor(&peer.snapshot());
        }
    }

    pub fn snapshots(&self) -> Vec<PeerSnapshot> {
        let mut out = Vec::with_capacity(self.peers.len());
        self.iterate(|s| out.push(s.clone()));
        out
    }

    /// Queue a message towards `to`.
    pub fn transmit(
        &mut self,
        to: &Identity,
        kind: TransmissionKind,
        priority: u32,
        message: Vec<u8>,
        now: Instant,
    ) -> Result<(), TransmitError> {
        let max_pending_queries = self.max_pending_queries;
        let peer = self.peers.get_mut(to).ok_or(TransmitError::UnknownPeer)?;
        if kind == TransmissionKind::Query && peer.pending_queries >= max_pending_queries {
            return Err(TransmitError::QueueFull);
        }
        trace!(peer = %to, ?kind, priority, len = message.len(), "queued transmission");
        peer.enqueue(PendingTransmission { kind, priority, message, queued_at: now });
        Ok(())
    }

    /// Park a reply in the artificial-delay tier. Returns the token to
    /// release it with once the delay has elapsed.
    pub fn transmit_delayed(
        &mut self,
        to: &Identity,
        priority: u32,
        message: Vec<u8>,
        now: Instant,
    ) -> Result<u64, TransmitError> {
        let peer = self.peers.get_mut(to).ok_or(TransmitError::UnknownPeer)?;
        let token = peer.next_delay_token;
        peer.next_delay_token += 1;
        peer.delay_queue_size += 1;
        peer.delayed.insert(
            token,
            PendingTransmission { kind: TransmissionKind::Content, priority, message, queued_at: now },
        );
        Ok(token)
    }

    /// Move a delayed reply into the send queue. Returns false if the peer
    /// or the entry is gone.
    pub fn release_delayed(&mut self, to: &Identity, session: u64, token: u64, now: Instant) -> bool {
        let Some(peer) = self.session_mut(to, session) else {
            return false;
        };
        let Some(mut entry) = peer.delayed.remove(&token) else {
            return false;
        };
        peer.delay_queue_size -= 1;
        entry.queued_at = now;
        peer.enqueue(entry);
        true
    }

    /// Accumulated bandwidth preference to submit before the next attempt.
    pub fn take_preference(&mut self, to: &Identity) -> Option<f64> {
        let peer = self.peers.get_mut(to)?;
        if peer.inc_preference == 0.0 {
            return None;
        }
        Some(std::mem::take(&mut peer.inc_preference))
    }

    /// Decide what the send queue towards `to` does next.
    pub fn next_transmission(&mut self, to: &Identity, now: Instant) -> NextTransmission {
        let Some(peer) = self.peers.get_mut(to) else {
            return NextTransmission::Idle;
        };
        if peer.in_flight {
            return NextTransmission::Idle;
        }
        let Some(head) = peer.queue.front() else {
            return NextTransmission::Idle;
        };
        if head.kind == TransmissionKind::Query && !peer.did_reserve {
            if peer.reserving {
                return NextTransmission::Idle;
            }
            peer.reserving = true;
            return NextTransmission::Reserve { amount: RESERVATION_SIZE };
        }
        let Some(entry) = peer.queue.pop_front() else {
            return NextTransmission::Idle;
        };
        peer.release_counter(entry.kind);
        if entry.kind == TransmissionKind::Query {
            peer.did_reserve = false;
        }
        let delay = now.saturating_duration_since(entry.queued_at).as_millis();
        peer.transmission_delay.update(u64::try_from(delay).unwrap_or(u64::MAX));
        peer.in_flight = true;
        NextTransmission::Send(entry)
    }

    /// Whether a reservation should be requested now that a query was handed
    /// off. Reservations are renewed eagerly after each query.
    pub fn wants_reservation(&mut self, to: &Identity) -> bool {
        let Some(peer) = self.peers.get_mut(to) else {
            return false;
        };
        if peer.did_reserve || peer.reserving {
            return false;
        }
        peer.reserving = true;
        true
    }

    /// The transport finished handing off the in-flight message.
    pub fn transmit_done(&mut self, to: &Identity, session: u64) {
        if let Some(peer) = self.session_mut(to, session) {
            peer.in_flight = false;
        }
    }

    /// Apply a reservation answer. Returns the retry delay if nothing was granted.
    pub fn reservation_result(
        &mut self,
        to: &Identity,
        session: u64,
        granted: u32,
        retry_after: Duration,
    ) -> Option<Duration> {
        let peer = self.session_mut(to, session)?;
        if granted == 0 {
            return Some(retry_after.clamp(MIN_RESERVATION_RETRY, MAX_RESERVATION_RETRY));
        }
        peer.reserving = false;
        peer.did_reserve = true;
        None
    }

    /// Fold a reply into the peer's delay and priority averages.
    pub fn update_performance_on_reply(
        &mut self,
        peer: &Identity,
        request_start: Instant,
        priority: u32,
        now: Instant,
    ) {
        let Some(peer) = self.peers.get_mut(peer) else {
            return;
        };
        let delay = now.saturating_duration_since(request_start);
        peer.avg_reply_delay =
            (peer.avg_reply_delay * (PERFORMANCE_WEIGHT - 1) + delay) / PERFORMANCE_WEIGHT;
        let w = PERFORMANCE_WEIGHT as f64;
        peer.avg_priority = (peer.avg_priority * (w - 1.0) + priority as f64) / w;
    }

    /// Remember who initiated a request that `peer` answered.
    pub fn note_successful_responder(&mut self, peer: &Identity, initiator: Responder) {
        let Some(peer) = self.peers.get_mut(peer) else {
            return;
        };
        match initiator {
            Responder::Peer(id) => {
                peer.last_p2p_replies[peer.last_p2p_offset] = Some(id);
                peer.last_p2p_offset = (peer.last_p2p_offset + 1) % RESPONDER_RING_SIZE;
            }
            Responder::Client(id) => {
                peer.last_client_replies[peer.last_client_offset] = Some(id);
                peer.last_client_offset = (peer.last_client_offset + 1) % RESPONDER_RING_SIZE;
            }
        }
    }

    /// Ask `peer` to stop pushing content until `until`. Returns the
    /// duration to put in the MIGRATION_STOP message, or `None` when an
    /// equal or later block is already in force.
    pub fn block_migration(&mut self, peer: &Identity, until: Instant, now: Instant) -> Option<Duration> {
        let peer = self.peers.get_mut(peer)?;
        if peer.last_migration_block.is_some_and(|block| block >= until) {
            trace!(peer = %peer.identity, "migration already blocked");
            return None;
        }
        peer.last_migration_block = Some(until);
        Some(until.saturating_duration_since(now))
    }

    /// Honour a MIGRATION_STOP received from `peer`. Returns the delay after
    /// which [`Self::revive_migration`] must run, if no revival is armed yet.
    pub fn suspend_migration(&mut self, peer: &Identity, duration: Duration, now: Instant) -> Option<Duration> {
        let peer = self.peers.get_mut(peer)?;
        peer.migration_blocked_until = Some(now + duration);
        peer.push_suspended = true;
        if peer.revive_armed {
            return None;
        }
        peer.revive_armed = true;
        Some(duration)
    }

    /// Revival check. Returns the remaining delay if the block was extended.
    pub fn revive_migration(&mut self, peer: &Identity, session: u64, now: Instant) -> Option<Duration> {
        let peer = self.session_mut(peer, session)?;
        if let Some(until) = peer.migration_blocked_until {
            if until > now {
                return Some(until - now);
            }
        }
        peer.revive_armed = false;
        peer.migration_blocked_until = None;
        peer.push_suspended = !peer.respect_loaded;
        debug!(peer = %peer.identity, "content migration revived");
        None
    }

    /// Accumulate a bandwidth preference, submitted at the next attempt.
    pub fn change_bandwidth_preference(&mut self, peer: &Identity, delta: f64) {
        if let Some(peer) = self.peers.get_mut(peer) {
            peer.inc_preference += delta;
        }
    }

    /// Saturating respect change; returns the delta actually applied.
    pub fn adjust_respect(&mut self, peer: &Identity, delta: i64) -> i64 {
        self.peers.get_mut(peer).map_or(0, |p| p.adjust_respect(delta))
    }

    /// Add respect loaded from the peerstore and allow content push.
    pub fn respect_loaded(&mut self, peer: &Identity, session: u64, stored: Option<u32>) {
        let Some(peer) = self.session_mut(peer, session) else {
            return;
        };
        if let Some(value) = stored {
            peer.disk_respect = value;
            peer.respect = peer.respect.saturating_add(value);
        }
        peer.respect_loaded = true;
        if peer.migration_blocked_until.is_none() {
            peer.push_suspended = false;
        }
    }

    /// Respect values that changed since their last flush.
    pub fn respect_to_flush(&mut self) -> Vec<(Identity, u32)> {
        let mut out = Vec::new();
        for peer in self.peers.values_mut() {
            if peer.respect != peer.disk_respect {
                peer.disk_respect = peer.respect;
                out.push((peer.identity, peer.respect));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(byte: u8) -> Identity {
        Identity::from_bytes([byte; 32])
    }

    fn registry() -> PeerRegistry {
        PeerRegistry::new(id(0), 4)
    }

    fn send_priorities(reg: &mut PeerRegistry, peer: &Identity, now: Instant) -> Vec<u32> {
        let mut out = Vec::new();
        let session = reg.get(peer).unwrap().session;
        while let NextTransmission::Send(entry) = reg.next_transmission(peer, now) {
            out.push(entry.priority);
            reg.transmit_done(peer, session);
        }
        out
    }

    #[test]
    fn rejects_self_and_duplicate_connects() {
        let mut reg = registry();
        assert_eq!(reg.connect(id(0)).unwrap_err(), PeerError::SelfConnect);
        reg.connect(id(1)).unwrap();
        assert_eq!(reg.connect(id(1)).unwrap_err(), PeerError::AlreadyConnected(id(1)));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn queue_is_priority_ordered_and_stable() {
        let mut reg = registry();
        let now = Instant::now();
        reg.connect(id(1)).unwrap();
        for (prio, tag) in [(5, 1u8), (9, 2), (5, 3), (1, 4), (9, 5)] {
            reg.transmit(&id(1), TransmissionKind::Content, prio, vec![tag], now).unwrap();
        }
        let session = reg.get(&id(1)).unwrap().session;
        let mut tags = Vec::new();
        while let NextTransmission::Send(entry) = reg.next_transmission(&id(1), now) {
            tags.push(entry.message[0]);
            reg.transmit_done(&id(1), session);
        }
        assert_eq!(tags, vec![2, 5, 1, 3, 4]);
        assert_eq!(reg.get(&id(1)).unwrap().pending_replies(), 0);
    }

    #[test]
    fn one_message_in_flight_at_a_time() {
        let mut reg = registry();
        let now = Instant::now();
        reg.connect(id(1)).unwrap();
        reg.transmit(&id(1), TransmissionKind::Content, 1, vec![1], now).unwrap();
        reg.transmit(&id(1), TransmissionKind::Content, 1, vec![2], now).unwrap();
        assert!(matches!(reg.next_transmission(&id(1), now), NextTransmission::Send(_)));
        assert!(matches!(reg.next_transmission(&id(1), now), NextTransmission::Idle));
    }

    #[test]
    fn queries_wait_for_reservation() {
        let mut reg = registry();
        let now = Instant::now();
        let session = reg.connect(id(1)).unwrap().session;
        reg.transmit(&id(1), TransmissionKind::Query, 3, vec![1], now).unwrap();
        // Initial reservation is still outstanding.
        assert!(matches!(reg.next_transmission(&id(1), now), NextTransmission::Idle));

        let retry = reg.reservation_result(&id(1), session, 0, Duration::ZERO);
        assert_eq!(retry, Some(MIN_RESERVATION_RETRY));
        assert_eq!(reg.reservation_result(&id(1), session, RESERVATION_SIZE, Duration::ZERO), None);

        assert!(matches!(reg.next_transmission(&id(1), now), NextTransmission::Send(_)));
        assert!(reg.wants_reservation(&id(1)));
        assert!(!reg.wants_reservation(&id(1)));
        reg.transmit_done(&id(1), session);

        reg.transmit(&id(1), TransmissionKind::Query, 3, vec![2], now).unwrap();
        assert!(matches!(reg.next_transmission(&id(1), now), NextTransmission::Idle));
    }

    #[test]
    fn content_skips_reservation() {
        let mut reg = registry();
        let now = Instant::now();
        reg.connect(id(1)).unwrap();
        reg.transmit(&id(1), TransmissionKind::Neither, u32::MAX, vec![1], now).unwrap();
        assert!(matches!(reg.next_transmission(&id(1), now), NextTransmission::Send(_)));
    }

    #[test]
    fn query_queue_is_bounded() {
        let mut reg = registry();
        let now = Instant::now();
        reg.connect(id(1)).unwrap();
        for _ in 0..4 {
            reg.transmit(&id(1), TransmissionKind::Query, 0, vec![], now).unwrap();
        }
        assert_eq!(
            reg.transmit(&id(1), TransmissionKind::Query, 0, vec![], now),
            Err(TransmitError::QueueFull)
        );
        assert_eq!(
            reg.transmit(&id(2), TransmissionKind::Content, 0, vec![], now),
            Err(TransmitError::UnknownPeer)
        );
    }

    #[test]
    fn delayed_tier_releases_into_queue() {
        let mut reg = registry();
        let now = Instant::now();
        let session = reg.connect(id(1)).unwrap().session;
        let token = reg.transmit_delayed(&id(1), u32::MAX, vec![7], now).unwrap();
        assert_eq!(reg.get(&id(1)).unwrap().delay_queue_size(), 1);
        assert!(matches!(reg.next_transmission(&id(1), now), NextTransmission::Idle));
        assert!(reg.release_delayed(&id(1), session, token, now));
        assert!(!reg.release_delayed(&id(1), session, token, now));
        assert_eq!(send_priorities(&mut reg, &id(1), now), vec![u32::MAX]);
    }

    #[test]
    fn respect_saturates_both_ways() {
        let mut reg = registry();
        reg.connect(id(1)).unwrap();
        assert_eq!(reg.adjust_respect(&id(1), -50), 0);
        assert_eq!(reg.adjust_respect(&id(1), 10), 10);
        assert_eq!(reg.adjust_respect(&id(1), -50), -10);
        assert_eq!(reg.adjust_respect(&id(1), i64::MAX), u32::MAX as i64);
        assert_eq!(reg.adjust_respect(&id(1), 1), 0);
        assert_eq!(reg.get(&id(1)).unwrap().respect(), u32::MAX);
        assert_eq!(reg.adjust_respect(&id(9), 5), 0);
    }

    #[test]
    fn respect_flush_only_when_changed() {
        let mut reg = registry();
        let session = reg.connect(id(1)).unwrap().session;
        reg.respect_loaded(&id(1), session, Some(40));
        assert!(reg.respect_to_flush().is_empty());
        reg.adjust_respect(&id(1), 2);
        assert_eq!(reg.respect_to_flush(), vec![(id(1), 42)]);
        assert!(reg.respect_to_flush().is_empty());
        reg.adjust_respect(&id(1), 1);
        assert_eq!(reg.disconnect(&id(1)).unwrap().flush_respect, Some(43));
    }

    #[test]
    fn block_migration_ignores_earlier_deadlines() {
        let mut reg = registry();
        let now = Instant::now();
        reg.connect(id(1)).unwrap();
        let later = now + Duration::from_secs(10);
        assert_eq!(reg.block_migration(&id(1), later, now), Some(Duration::from_secs(10)));
        assert_eq!(reg.block_migration(&id(1), now + Duration::from_secs(5), now), None);
        assert_eq!(
            reg.block_migration(&id(1), now + Duration::from_secs(20), now),
            Some(Duration::from_secs(20))
        );
    }

    #[test]
    fn suspension_revives_after_extension() {
        let mut reg = registry();
        let now = Instant::now();
        let session = reg.connect(id(1)).unwrap().session;
        reg.respect_loaded(&id(1), session, None);
        assert!(!reg.get(&id(1)).unwrap().push_suspended());

        assert_eq!(reg.suspend_migration(&id(1), Duration::from_secs(2), now), Some(Duration::from_secs(2)));
        assert_eq!(reg.suspend_migration(&id(1), Duration::from_secs(5), now), None);
        assert!(reg.get(&id(1)).unwrap().push_suspended());

        let at = now + Duration::from_secs(2);
        assert_eq!(reg.revive_migration(&id(1), session, at), Some(Duration::from_secs(3)));
        assert_eq!(reg.revive_migration(&id(1), session, now + Duration::from_secs(5)), None);
        assert!(!reg.get(&id(1)).unwrap().push_suspended());
    }

    #[test]
    fn responder_rings_wrap_round_robin() {
        let mut reg = registry();
        reg.connect(id(1)).unwrap();
        for i in 0..10u8 {
            reg.note_successful_responder(&id(1), Responder::Peer(id(100 + i)));
        }
        reg.note_successful_responder(&id(1), Responder::Client(ClientId(3)));
        let snap = &reg.snapshots()[0];
        assert_eq!(snap.last_p2p_replies.len(), RESPONDER_RING_SIZE);
        assert_eq!(snap.last_p2p_replies[0], id(108));
        assert_eq!(snap.last_p2p_replies[1], id(109));
        assert_eq!(snap.last_client_replies, vec![ClientId(3)]);
    }

    #[test]
    fn performance_averages_are_sixteen_to_one() {
        let mut reg = registry();
        let start = Instant::now();
        reg.connect(id(1)).unwrap();
        reg.update_performance_on_reply(&id(1), start, 160, start + Duration::from_millis(1600));
        let snap = &reg.snapshots()[0];
        assert_eq!(snap.avg_reply_delay, Duration::from_millis(100));
        assert_eq!(snap.avg_priority, 10.0);
    }

    #[test]
    fn disconnect_discards_queue_and_returns_requests() {
        let mut reg = registry();
        let now = Instant::now();
        reg.connect(id(1)).unwrap();
        reg.transmit(&id(1), TransmissionKind::Query, 1, vec![], now).unwrap();
        reg.transmit(&id(1), TransmissionKind::Content, 1, vec![], now).unwrap();
        reg.transmit_delayed(&id(1), 1, vec![], now).unwrap();
        let peer = reg.get_mut(&id(1)).unwrap();
        peer.add_request([1; 32], RequestId(7));
        peer.add_request([1; 32], RequestId(8));
        peer.add_request([2; 32], RequestId(9));
        assert!(peer.remove_request(&[1; 32], RequestId(8)));
        assert!(!peer.remove_request(&[3; 32], RequestId(8)));

        let gone = reg.disconnect(&id(1)).unwrap();
        assert_eq!(gone.discarded, 3);
        let mut requests = gone.requests;
        requests.sort();
        assert_eq!(requests, vec![RequestId(7), RequestId(9)]);
        assert!(!reg.is_connected(&id(1)));
        assert!(reg.disconnect(&id(1)).is_none());
    }

    #[test]
    fn stale_session_is_ignored() {
        let mut reg = registry();
        let old = reg.connect(id(1)).unwrap().session;
        reg.disconnect(&id(1));
        let new = reg.connect(id(1)).unwrap().session;
        assert_ne!(old, new);
        assert!(reg.session_mut(&id(1), old).is_none());
        assert_eq!(reg.reservation_result(&id(1), old, 0, Duration::ZERO), None);
    }

    #[test]
    fn preference_is_taken_once() {
        let mut reg = registry();
        reg.connect(id(1)).unwrap();
        assert_eq!(reg.take_preference(&id(1)), None);
        reg.change_bandwidth_preference(&id(1), 0.8);
        reg.change_bandwidth_preference(&id(1), 1.2);
        assert_eq!(reg.take_preference(&id(1)), Some(2.0));
        assert_eq!(reg.take_preference(&id(1)), None);
    }
}
