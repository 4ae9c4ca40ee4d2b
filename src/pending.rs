//! # Pending Request Table
//!
//! Every in-flight query, whether it came from a local client or a remote
//! peer, lives here as a [`PendingRequest`]. The table owns:
//!
//! - the request arena and the query-key multimap (several requests may
//!   share a key)
//! - the expiration index used to enforce the request ceiling
//! - each request's duplicate-reply filter and known-reply set
//! - the local datastore lookup state machine
//! - the shared reply evaluation algorithm
//!
//! ## Lifecycle
//!
//! ```text
//! create ─► local lookup ─┬─► done, forwarding ─┐
//!                         └─► done, terminal ───┴─► cancel (soft │ hard)
//! ```
//!
//! A soft cancel detaches the reply handler but keeps the entry indexed so
//! the query key is still recognised (loop suppression). A hard cancel
//! removes it everywhere. Neither form ever delivers afterwards.
//!
//! The table performs no I/O. Lookup steps return the next datastore query
//! to issue; evaluation returns the deliveries to make.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::block::{self, content_hash, BlockType, Evaluation, Key};
use crate::bloom::{compute_filter_size, ReplyFilter};
use crate::context::CoreContext;
use crate::identity::Identity;
use crate::load::LoadVerdict;
use crate::messages::GetMessage;
use crate::peers::{ConnectedPeer, PeerRegistry, Responder};
use crate::planner::{LastTransmission, Planner};
use crate::protocols::{DatastoreQuery, DatastoreRecord};

/// Hard cap on records examined by one local lookup.
pub const MAX_LOCAL_RESULTS: u64 = 100 * 1024;

/// Anonymity level of replies whose origin is not known (DHT, peers).
pub const ANONYMITY_UNKNOWN: u32 = u32::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "r{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u64);

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Request option bits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RequestOptions(u32);

impl RequestOptions {
    pub const NONE: Self = Self(0);
    /// Answer from the local datastore only.
    pub const LOCAL_ONLY: Self = Self(1);
    /// Forward without routing replies through us (indirection disabled).
    pub const FORWARD_ONLY: Self = Self(2);
    /// Not subject to the expiring-request ceiling.
    pub const NEVER_EXPIRES: Self = Self(4);
    /// We own the known-reply set and rebuild the filter from it.
    pub const FULL_REFRESH: Self = Self(8);
    /// No priority budget; exempt from load-based early termination.
    pub const UNLIMITED_PRIORITY: Self = Self(16);
    /// Options for requests issued by local clients.
    pub const LOCAL_REQUEST: Self = Self(4 | 8 | 16);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl std::ops::BitOr for RequestOptions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Where replies for a request go.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplyHandler {
    Client(ClientId),
    Peer(Identity),
}

impl ReplyHandler {
    fn initiator(self) -> Responder {
        match self {
            Self::Client(c) => Responder::Client(c),
            Self::Peer(p) => Responder::Peer(p),
        }
    }
}

/// What runs once local processing of a request concludes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LocalContinuation {
    /// Release the client, try the direct-peer or DHT path, then forward.
    ClientSearch(ClientId),
    /// Offer the request to every suitable connected peer.
    ConsiderForwarding,
}

/// Content delivered to a reply handler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    pub block_type: BlockType,
    pub expiration: u64,
    pub data: Vec<u8>,
}

/// A reply entering evaluation, from any source.
#[derive(Clone, Debug)]
pub struct IncomingReply {
    pub key: Key,
    pub block_type: BlockType,
    pub data: Vec<u8>,
    pub expiration: u64,
    pub anonymity: u32,
    /// Remote peer that sent the reply; `None` for local, DHT and cadet.
    pub sender: Option<Identity>,
}

/// One delivery to make to a request's handler.
#[derive(Clone, Debug)]
pub struct Delivery {
    pub request: RequestId,
    pub handler: ReplyHandler,
    pub eval: Evaluation,
    /// `None` for the synthetic "no more results" delivery.
    pub reply: Option<Reply>,
    pub anonymity: u32,
    pub last_transmission: LastTransmission,
    pub num_transmissions: u32,
    pub respect_offered: u32,
}

impl Delivery {
    pub fn is_terminal(&self) -> bool {
        self.eval == Evaluation::OkLast
    }
}

/// Result of evaluating a reply against every request for its key.
#[derive(Debug, Default)]
pub struct ReplyOutcome {
    pub deliveries: Vec<Delivery>,
    pub evaluations: Vec<(RequestId, Evaluation)>,
    /// At least one request matched.
    pub request_found: bool,
    /// Priority credited by the matched requests.
    pub priority: u32,
}

impl ReplyOutcome {
    pub fn eval_of(&self, id: RequestId) -> Option<Evaluation> {
        self.evaluations.iter().find(|(r, _)| *r == id).map(|(_, e)| *e)
    }
}

/// Parameters of a new request.
#[derive(Clone, Debug)]
pub struct NewRequest {
    pub options: RequestOptions,
    pub block_type: BlockType,
    pub query: Key,
    pub target: Option<Identity>,
    /// Filter bytes and mutator received with a GET.
    pub bloom: Option<(Vec<u8>, u32)>,
    pub anonymity: u32,
    pub priority: u32,
    /// Relative TTL in seconds; negative values lie in the past.
    pub ttl: i32,
    /// Peer replies are routed back through when forward-only.
    pub sender: Option<Identity>,
    /// Peer the request came from (never forwarded back to it).
    pub origin: Option<Identity>,
    pub known_replies: Vec<Key>,
    pub handler: ReplyHandler,
}

#[derive(Clone, Debug, Default)]
struct LocalLookup {
    token: u64,
    active: bool,
    continuation: Option<LocalContinuation>,
    random: bool,
    first_uid: Option<u64>,
    seen_null: bool,
    result_count: u64,
    fed_load: bool,
    operation_started: Option<Instant>,
    last_warning: Option<Instant>,
}

#[derive(Debug)]
pub struct PendingRequest {
    pub id: RequestId,
    pub query: Key,
    pub target: Option<Identity>,
    pub block_type: BlockType,
    pub anonymity: u32,
    pub priority: u32,
    pub original_priority: u32,
    /// Absolute deadline.
    pub ttl: Instant,
    pub start_time: Instant,
    pub options: RequestOptions,
    pub sender: Option<Identity>,
    pub origin: Option<Identity>,
    pub results_found: u32,
    pub num_transmissions: u32,
    pub respect_offered: u32,
    /// Whether local processing has begun.
    pub has_started: bool,
    /// Evaluation of the last local result for this request.
    pub local_result: Option<Evaluation>,
    pub dht_active: bool,
    pub cadet_active: bool,
    pub cadet_retries: u32,
    /// Handler the request was created with; kept after detaching.
    pub owner: ReplyHandler,
    filter: Option<ReplyFilter>,
    replies_seen: Vec<Key>,
    handler: Option<ReplyHandler>,
    local: LocalLookup,
    expires: bool,
}

impl PendingRequest {
    pub fn handler(&self) -> Option<ReplyHandler> {
        self.handler
    }

    pub fn is_active(&self) -> bool {
        self.handler.is_some()
    }

    pub fn filter(&self) -> Option<&ReplyFilter> {
        self.filter.as_ref()
    }

    pub fn replies_seen(&self) -> &[Key] {
        &self.replies_seen
    }

    /// Hashes the DHT should stop returning for this request.
    pub fn known_results(&self) -> Vec<Key> {
        self.replies_seen.clone()
    }

    pub fn local_lookup_active(&self) -> bool {
        self.local.active
    }

    /// Relative TTL in whole seconds, negative once the deadline has passed.
    pub fn relative_ttl(&self, now: Instant) -> i32 {
        let secs = if self.ttl >= now {
            (self.ttl - now).as_secs() as i64
        } else {
            -((now - self.ttl).as_secs() as i64)
        };
        secs.clamp(i32::MIN as i64, i32::MAX as i64) as i32
    }

    fn refresh_filter<R: Rng + ?Sized>(&mut self, rng: &mut R) -> bool {
        let size = compute_filter_size(self.replies_seen.len());
        if self.filter.as_ref().is_some_and(|f| f.size() == size) {
            return false;
        }
        let mut filter = ReplyFilter::with_size(size, rng.gen());
        for hash in &self.replies_seen {
            filter.insert(hash);
        }
        self.filter = Some(filter);
        true
    }

    fn datastore_query(&self, next_uid: u64, random: bool, queue_size: u32) -> DatastoreQuery {
        let unlimited = self.options.contains(RequestOptions::UNLIMITED_PRIORITY);
        DatastoreQuery {
            key: self.query,
            // Data blocks may be stored as on-demand placeholders.
            block_type: if self.block_type == BlockType::DBlock { BlockType::Any } else { self.block_type },
            next_uid,
            random,
            queue_priority: if unlimited { u32::MAX } else { 1 },
            max_queue_size: if unlimited { u32::MAX } else { queue_size },
        }
    }
}

/// Absolute deadline of a relative TTL (seconds) taken at `now`.
pub fn deadline(now: Instant, ttl: i32) -> Instant {
    let secs = Duration::from_secs(ttl.unsigned_abs() as u64);
    if ttl >= 0 {
        now + secs
    } else {
        now.checked_sub(secs).unwrap_or(now)
    }
}

/// Requests that share type and query are interchangeable for merging.
pub fn is_compatible(a: &PendingRequest, b: &PendingRequest) -> bool {
    a.block_type == b.block_type && a.query == b.query
}

/// Local results a priority-limited request may collect before its
/// datastore walk stops.
fn result_allowance(priority: u32) -> u32 {
    priority.saturating_mul(2).saturating_add(5)
}

/// Admission charge for a peer query. Returns the priority to use, or
/// `None` when the query must be dropped (the charge is refunded).
pub fn bound_priority(ctx: &mut CoreContext, peer: &mut ConnectedPeer, priority: u32) -> Option<u32> {
    let mut verdict = ctx.test_get_load(0);
    if verdict == LoadVerdict::Free {
        trace!(peer = %peer.identity, "request served for free");
        return Some(0);
    }
    let priority = priority.min(i32::MAX as u32);
    let charge = (-peer.adjust_respect(-(priority as i64))) as u32;
    if charge > 0 {
        ctx.fold_typical_priority(charge);
        if verdict == LoadVerdict::TooHigh {
            verdict = ctx.test_get_load(charge);
        }
    }
    if verdict == LoadVerdict::TooHigh {
        peer.adjust_respect(charge as i64);
        debug!(peer = %peer.identity, charge, "request dropped, priority insufficient");
        return None;
    }
    Some(charge)
}

/// Outcome of a create.
#[derive(Debug)]
pub struct Created {
    pub id: RequestId,
    /// Evicted to respect the ceiling; the caller delivers the synthetic end
    /// to its handler and hard-cancels it.
    pub evicted: Option<(RequestId, Option<ReplyHandler>)>,
}

/// What a cancel released.
#[derive(Debug)]
pub struct Cancelled {
    pub owner: ReplyHandler,
    /// Handler that was still attached.
    pub handler: Option<ReplyHandler>,
    /// Local-lookup continuation still owed; run it exactly once.
    pub continuation: Option<LocalContinuation>,
    pub local_result: Option<Evaluation>,
    pub query: Key,
    pub origin: Option<Identity>,
}

/// Next action of a local lookup.
#[derive(Debug)]
pub enum LocalNext {
    /// The lookup was cancelled or superseded.
    Stale,
    Query { token: u64, query: DatastoreQuery },
    Resolve { token: u64, record: DatastoreRecord },
    /// Local processing is over; call [`PendingTable::finish_local_lookup`].
    Finish,
}

#[derive(Debug)]
pub struct LocalStep {
    /// Corrupt record to delete from the datastore.
    pub remove: Option<(Key, Vec<u8>)>,
    pub deliveries: Vec<Delivery>,
    pub next: LocalNext,
}

impl LocalStep {
    fn next(next: LocalNext) -> Self {
        Self { remove: None, deliveries: Vec::new(), next }
    }
}

/// Local processing concluded.
#[derive(Debug)]
pub struct LocalDone {
    pub continuation: Option<LocalContinuation>,
    pub result: Option<Evaluation>,
    /// Terminal delivery for local-only requests that found no final answer.
    pub synthetic: Option<Delivery>,
}

#[derive(Debug)]
pub struct PendingTable {
    requests: HashMap<RequestId, PendingRequest>,
    by_query: HashMap<Key, Vec<RequestId>>,
    expiration: BTreeSet<(Instant, RequestId)>,
    next_id: u64,
    max_pending: usize,
}

impl PendingTable {
    pub fn new(max_pending: usize) -> Self {
        Self {
            requests: HashMap::new(),
            by_query: HashMap::new(),
            expiration: BTreeSet::new(),
            next_id: 1,
            max_pending,
        }
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Requests counted against the ceiling.
    pub fn expiring_len(&self) -> usize {
        self.expiration.len()
    }

    pub fn get(&self, id: RequestId) -> Option<&PendingRequest> {
        self.requests.get(&id)
    }

    pub fn get_mut(&mut self, id: RequestId) -> Option<&mut PendingRequest> {
        self.requests.get_mut(&id)
    }

    pub fn ids_for_query(&self, query: &Key) -> &[RequestId] {
        self.by_query.get(query).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Visit every request (order unspecified).
    pub fn iterate(&self, mut visitor: impl FnMut(&PendingRequest)) {
        for request in self.requests.values() {
            visitor(request);
        }
    }

    pub fn create<R: Rng + ?Sized>(&mut self, new: NewRequest, now: Instant, rng: &mut R) -> Created {
        let id = RequestId(self.next_id);
        self.next_id += 1;

        let ttl = deadline(now, new.ttl);

        let mut request = PendingRequest {
            id,
            query: new.query,
            target: new.target,
            block_type: new.block_type,
            anonymity: new.anonymity,
            priority: new.priority,
            original_priority: new.priority,
            ttl,
            start_time: now,
            options: new.options,
            sender: new.sender,
            origin: new.origin,
            results_found: 0,
            num_transmissions: 0,
            respect_offered: 0,
            has_started: false,
            local_result: None,
            dht_active: false,
            cadet_active: false,
            cadet_retries: 0,
            owner: new.handler,
            filter: None,
            replies_seen: new.known_replies,
            handler: Some(new.handler),
            local: LocalLookup::default(),
            expires: !new.options.contains(RequestOptions::NEVER_EXPIRES),
        };

        match new.bloom {
            Some((bytes, mutator)) if new.block_type.supports_filter() => {
                request.filter = ReplyFilter::from_bytes(&bytes, mutator);
            }
            _ => {
                if !request.replies_seen.is_empty() && new.options.contains(RequestOptions::FULL_REFRESH) {
                    request.refresh_filter(rng);
                }
            }
        }

        self.by_query.entry(request.query).or_default().push(id);
        let expires = request.expires;
        trace!(request = %id, query = %hex::encode(&request.query[..8]), "request created");
        self.requests.insert(id, request);

        let mut evicted = None;
        if expires {
            self.expiration.insert((ttl, id));
            if self.expiration.len() > self.max_pending {
                let victim = self.expiration.iter().map(|(_, r)| *r).find(|r| *r != id);
                if let Some(victim) = victim {
                    let handler = self.requests.get(&victim).and_then(|r| r.handler);
                    debug!(request = %victim, "evicting request to respect ceiling");
                    evicted = Some((victim, handler));
                }
            }
        }
        Created { id, evicted }
    }

    /// Add known replies to a request's filter. Returns the hashes to pass
    /// to an active DHT lookup.
    pub fn update<R: Rng + ?Sized>(&mut self, id: RequestId, known: &[Key], rng: &mut R) -> Vec<Key> {
        let Some(request) = self.requests.get_mut(&id) else {
            return Vec::new();
        };
        if request.options.contains(RequestOptions::FULL_REFRESH) {
            request.replies_seen.extend_from_slice(known);
            if !request.refresh_filter(rng) {
                if let Some(filter) = request.filter.as_mut() {
                    for hash in known {
                        filter.insert(hash);
                    }
                }
            }
        } else {
            let filter = request
                .filter
                .get_or_insert_with(|| ReplyFilter::with_size(compute_filter_size(known.len()), rng.gen()));
            for hash in known {
                filter.insert(hash);
            }
        }
        if request.dht_active {
            known.to_vec()
        } else {
            Vec::new()
        }
    }

    /// False iff `candidate` is the peer the request came from.
    pub fn test_target(&self, id: RequestId, candidate: &Identity) -> bool {
        self.requests
            .get(&id)
            .is_some_and(|r| r.origin.as_ref() != Some(candidate))
    }

    pub fn test_active(&self, id: RequestId) -> bool {
        self.requests.get(&id).is_some_and(PendingRequest::is_active)
    }

    /// Cancel a request. Soft cancels detach the handler and stop all lookups;
    /// hard cancels also remove the entry and its plans.
    pub fn cancel(&mut self, id: RequestId, full: bool, planner: &mut Planner) -> Option<Cancelled> {
        let request = self.requests.get_mut(&id)?;
        let out = Cancelled {
            owner: request.owner,
            handler: request.handler.take(),
            continuation: request.local.continuation.take(),
            local_result: request.local_result,
            query: request.query,
            origin: request.origin,
        };
        request.local.active = false;
        request.local.token += 1;
        request.dht_active = false;
        request.cadet_active = false;
        planner.notify_request_done(id);
        if full {
            self.remove(id);
        }
        Some(out)
    }

    fn remove(&mut self, id: RequestId) -> Option<PendingRequest> {
        let request = self.requests.remove(&id)?;
        if let Some(ids) = self.by_query.get_mut(&request.query) {
            ids.retain(|r| *r != id);
            if ids.is_empty() {
                self.by_query.remove(&request.query);
            }
        }
        if request.expires {
            self.expiration.remove(&(request.ttl, id));
        }
        Some(request)
    }

    /// Begin local processing. Returns the first datastore query.
    pub fn start_local_lookup(
        &mut self,
        id: RequestId,
        continuation: LocalContinuation,
        queue_size: u32,
        now: Instant,
    ) -> Option<(u64, DatastoreQuery)> {
        let request = self.requests.get_mut(&id)?;
        request.has_started = true;
        request.local = LocalLookup {
            token: request.local.token + 1,
            active: true,
            continuation: Some(continuation),
            random: true,
            operation_started: Some(now),
            ..LocalLookup::default()
        };
        Some((request.local.token, request.datastore_query(0, true, queue_size)))
    }

    fn lookup_request(&mut self, id: RequestId, token: u64) -> Option<&mut PendingRequest> {
        self.requests
            .get_mut(&id)
            .filter(|r| r.local.active && r.local.token == token)
    }

    fn query_next(&mut self, id: RequestId, next_uid: u64, random: bool, queue_size: u32, now: Instant) -> LocalNext {
        let Some(request) = self.requests.get_mut(&id) else {
            return LocalNext::Stale;
        };
        request.local.token += 1;
        request.local.random = random;
        request.local.operation_started = Some(now);
        LocalNext::Query { token: request.local.token, query: request.datastore_query(next_uid, random, queue_size) }
    }

    /// Feed the next datastore answer into the lookup.
    #[allow(clippy::too_many_arguments)]
    pub fn local_lookup_record<R: Rng + ?Sized>(
        &mut self,
        id: RequestId,
        token: u64,
        record: Option<DatastoreRecord>,
        ctx: &mut CoreContext,
        peers: &mut PeerRegistry,
        planner: &Planner,
        now: Instant,
        rng: &mut R,
    ) -> LocalStep {
        let queue_size = ctx.config.datastore_queue_size;
        let Some(request) = self.lookup_request(id, token) else {
            return LocalStep::next(LocalNext::Stale);
        };
        let Some(record) = record else {
            if request.local.first_uid.is_none() || request.local.seen_null {
                return LocalStep::next(LocalNext::Finish);
            }
            request.local.seen_null = true;
            return LocalStep::next(self.query_next(id, 0, false, queue_size, now));
        };

        match request.local.first_uid {
            None => request.local.first_uid = Some(record.uid),
            Some(first) if request.local.seen_null && record.uid >= first => {
                return LocalStep::next(LocalNext::Finish);
            }
            Some(_) => {}
        }
        request.local.result_count += 1;
        if request.local.result_count > MAX_LOCAL_RESULTS {
            warn!(request = %id, "local lookup result cap reached");
            return LocalStep::next(LocalNext::Finish);
        }
        if record.block_type == BlockType::OnDemand {
            return LocalStep::next(LocalNext::Resolve { token, record });
        }
        self.process_local_record(id, record, ctx, peers, planner, now, rng)
    }

    /// Continue a lookup after an on-demand record was resolved.
    #[allow(clippy::too_many_arguments)]
    pub fn local_lookup_resolved<R: Rng + ?Sized>(
        &mut self,
        id: RequestId,
        token: u64,
        original: DatastoreRecord,
        resolved: Option<DatastoreRecord>,
        ctx: &mut CoreContext,
        peers: &mut PeerRegistry,
        planner: &Planner,
        now: Instant,
        rng: &mut R,
    ) -> LocalStep {
        if self.lookup_request(id, token).is_none() {
            return LocalStep::next(LocalNext::Stale);
        }
        match resolved {
            Some(mut block) => {
                block.uid = original.uid;
                self.process_local_record(id, block, ctx, peers, planner, now, rng)
            }
            None => {
                let queue_size = ctx.config.datastore_queue_size;
                let next = self.query_next(id, original.uid.wrapping_add(1), false, queue_size, now);
                LocalStep { remove: Some((original.key, original.data)), deliveries: Vec::new(), next }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn process_local_record<R: Rng + ?Sized>(
        &mut self,
        id: RequestId,
        record: DatastoreRecord,
        ctx: &mut CoreContext,
        peers: &mut PeerRegistry,
        planner: &Planner,
        now: Instant,
        rng: &mut R,
    ) -> LocalStep {
        let queue_size = ctx.config.datastore_queue_size;
        let uid = record.uid;
        let key = block::get_key(record.block_type, &record.data);
        if key != Some(record.key) {
            warn!(request = %id, uid, "datastore record key mismatch, removing");
            let next = self.query_next(id, uid.wrapping_add(1), false, queue_size, now);
            return LocalStep { remove: Some((record.key, record.data)), deliveries: Vec::new(), next };
        }

        let Some(request) = self.requests.get_mut(&id) else {
            return LocalStep::next(LocalNext::Stale);
        };
        if !request.local.fed_load {
            request.local.fed_load = true;
            let start = request.start_time;
            ctx.record_get_duration(start, now);
        }
        ctx.counters.local_results += 1;

        let reply = IncomingReply {
            key: record.key,
            block_type: record.block_type,
            data: record.data,
            expiration: record.expiration,
            anonymity: record.anonymity,
            sender: None,
        };
        let outcome = self.process_reply(&reply, 0, ctx, peers, planner, now, rng);
        let Some(request) = self.requests.get_mut(&id) else {
            return LocalStep { remove: None, deliveries: outcome.deliveries, next: LocalNext::Stale };
        };
        if let Some(eval) = outcome.eval_of(id) {
            request.local_result = Some(eval);
        }

        let unlimited = request.options.contains(RequestOptions::UNLIMITED_PRIORITY);
        let done = request.local_result == Some(Evaluation::OkLast)
            || (!unlimited
                && (ctx.test_get_load(0) == LoadVerdict::TooHigh
                    || request.results_found > result_allowance(request.priority)));
        let next = if done {
            LocalNext::Finish
        } else {
            self.query_next(id, uid.wrapping_add(1), false, queue_size, now)
        };
        LocalStep { remove: None, deliveries: outcome.deliveries, next }
    }

    /// Conclude local processing: hand back the continuation (once).
    pub fn finish_local_lookup(&mut self, id: RequestId) -> Option<LocalDone> {
        let request = self.requests.get_mut(&id)?;
        request.local.active = false;
        request.local.token += 1;
        let continuation = request.local.continuation.take()?;
        let mut synthetic = None;
        if request.options.contains(RequestOptions::LOCAL_ONLY)
            && request.local_result != Some(Evaluation::OkLast)
        {
            if let Some(handler) = request.handler.take() {
                synthetic = Some(Delivery {
                    request: id,
                    handler,
                    eval: Evaluation::OkLast,
                    reply: None,
                    anonymity: ANONYMITY_UNKNOWN,
                    last_transmission: LastTransmission::NoRecord,
                    num_transmissions: request.num_transmissions,
                    respect_offered: request.respect_offered,
                });
            }
        }
        Some(LocalDone { continuation: Some(continuation), result: request.local_result, synthetic })
    }

    /// Evaluate `reply` against every request for its key and collect the
    /// deliveries. `priority` is credit the reply already carries.
    #[allow(clippy::too_many_arguments)]
    pub fn process_reply<R: Rng + ?Sized>(
        &mut self,
        reply: &IncomingReply,
        priority: u32,
        ctx: &mut CoreContext,
        peers: &mut PeerRegistry,
        planner: &Planner,
        now: Instant,
        rng: &mut R,
    ) -> ReplyOutcome {
        let mut outcome = ReplyOutcome { priority, ..ReplyOutcome::default() };
        let ids = self.ids_for_query(&reply.key).to_vec();
        for id in ids {
            let Some(request) = self.requests.get_mut(&id) else {
                continue;
            };
            let Some(handler) = request.handler else {
                continue;
            };
            let eval = if request.block_type.accepts(reply.block_type) {
                block::evaluate(reply.block_type, &request.query, request.filter.as_mut(), &reply.data)
            } else {
                Evaluation::Irrelevant
            };
            outcome.evaluations.push((id, eval));
            match eval {
                Evaluation::OkMore | Evaluation::OkLast => {}
                Evaluation::Duplicate => {
                    ctx.counters.content_duplicate += 1;
                    continue;
                }
                Evaluation::Irrelevant => {
                    ctx.counters.content_irrelevant += 1;
                    continue;
                }
                Evaluation::Invalid => {
                    ctx.counters.content_invalid += 1;
                    continue;
                }
                Evaluation::Unsupported => {
                    warn!(block_type = ?reply.block_type, "unsupported block type in reply");
                    continue;
                }
            }

            if let Some(sender) = reply.sender {
                peers.update_performance_on_reply(&sender, request.start_time, outcome.priority, now);
                peers.note_successful_responder(&sender, handler.initiator());
            }
            if eval == Evaluation::OkLast {
                ctx.record_request_lifetime(request.start_time, now);
            }
            if request.options.contains(RequestOptions::FULL_REFRESH) {
                request.replies_seen.push(content_hash(&reply.data));
                request.refresh_filter(rng);
            }
            outcome.priority = outcome.priority.saturating_add(request.original_priority);
            request.priority = 0;
            request.original_priority = 0;
            request.results_found += 1;
            outcome.request_found = true;

            let last_transmission = match reply.sender {
                Some(sender) => planner.get_last_transmission_to(id, &sender),
                None => LastTransmission::NoRecord,
            };
            if eval == Evaluation::OkLast {
                request.handler = None;
            }
            outcome.deliveries.push(Delivery {
                request: id,
                handler,
                eval,
                reply: Some(Reply {
                    block_type: reply.block_type,
                    expiration: reply.expiration,
                    data: reply.data.clone(),
                }),
                anonymity: reply.anonymity,
                last_transmission,
                num_transmissions: request.num_transmissions,
                respect_offered: request.respect_offered,
            });
        }
        outcome
    }

    /// Build the GET sent to a peer for this request. `bid` is the plan's
    /// priority; requests without a budget offer from it instead.
    pub fn build_get_message<R: Rng + ?Sized>(
        &mut self,
        id: RequestId,
        bid: u32,
        now: Instant,
        rng: &mut R,
    ) -> Option<GetMessage> {
        let request = self.requests.get_mut(&id)?;
        let do_route = !request.options.contains(RequestOptions::FORWARD_ONLY);
        let unlimited = request.options.contains(RequestOptions::UNLIMITED_PRIORITY);
        let budget = if unlimited { bid } else { request.priority };
        let priority = if do_route { rng.gen_range(0..=budget) } else { 0 };
        if !unlimited {
            request.priority -= priority;
        }
        request.num_transmissions += 1;
        request.respect_offered = request.respect_offered.saturating_add(priority);
        let (bloom, filter_mutator) = match &request.filter {
            Some(filter) => (filter.as_bytes().to_vec(), filter.mutator()),
            None => (Vec::new(), 0),
        };
        Some(GetMessage {
            block_type: request.block_type,
            priority,
            ttl: request.relative_ttl(now),
            filter_mutator,
            query: request.query,
            return_to: if do_route { None } else { request.sender },
            transmit_to: request.target,
            bloom,
        })
    }

    /// Detached requests whose TTL has passed and may be freed. Also warns
    /// about slow local lookups.
    pub fn sweep(&mut self, warn_after: Duration, now: Instant) -> Vec<RequestId> {
        let mut free = Vec::new();
        for request in self.requests.values_mut() {
            if request.local.active {
                if let Some(started) = request.local.operation_started {
                    let running = now.saturating_duration_since(started);
                    let due = request
                        .local
                        .last_warning
                        .map_or(true, |at| now.saturating_duration_since(at) >= warn_after);
                    if running >= warn_after && due {
                        request.local.last_warning = Some(now);
                        warn!(request = %request.id, running = ?running, "datastore lookup is taking long");
                    }
                }
            }
            if request.ttl < now && request.handler.is_none() && !request.local.active {
                free.push(request.id);
            }
        }
        free
    }
}
