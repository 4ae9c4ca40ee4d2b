//! # Dispatch Actor
//!
//! The actor owns every routing component and is the only place that talks
//! to collaborators. Handlers are synchronous: they mutate state, then spawn
//! whatever async work follows. Each spawned task posts its completion back
//! as a [`Command`] carrying the target's id plus an operation token (or the
//! peer's session). Completions whose token no longer matches are ignored,
//! so nothing is delivered after a cancellation even if the task already
//! finished.
//!
//! ```text
//!  FsNode ──cmd──►  FsActor ──spawn──► Datastore / Dht / Cadet / Transport
//!                      ▲                         │
//!                      └────── completion ───────┘
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::block::{self, BlockType, Evaluation, Key};
use crate::config::FsConfig;
use crate::context::{CoreContext, Telemetry};
use crate::identity::{now_us, Identity, Keypair, LocationClaim, LOC_SIGNATURE_PURPOSE};
use crate::messages::{
    ClientResponse, ClientResult, GetMessage, IndexStart, LocSignResponse, MigrationStop, PeerMessage,
    PutMessage, StartSearch, WireError, SEARCH_OPTION_CONTINUED, SEARCH_OPTION_LOOPBACK_ONLY,
};
use crate::peers::{
    NextTransmission, PeerError, PeerRegistry, PeerSnapshot, TransmissionKind, MAX_RESERVATION_RETRY,
    RESERVATION_SIZE, RESPECT_KEY, RESPECT_NAMESPACE,
};
use crate::pending::{
    bound_priority, deadline, ClientId, Delivery, IncomingReply, LocalContinuation, LocalNext, LocalStep,
    NewRequest, PendingRequest, PendingTable, ReplyHandler, RequestId, RequestOptions, ANONYMITY_UNKNOWN,
};
use crate::planner::{LastTransmission, PlanRequest, Planner, Submission};
use crate::protocols::{
    Cadet, CadetReply, Datastore, DatastorePut, DatastoreQuery, DatastoreRecord, Dht, DhtGet, DhtResult,
    Indexing, Peerstore, PutOutcome, Reservation, Transport,
};

// ============================================================================
// Constants
// ============================================================================

/// Base TTL decrement (seconds); each hop removes twice this plus jitter.
pub const TTL_DECREMENT: i32 = 5;

/// Transport cork delay (ms) used in the indirection test.
const CORK_DELAY_MS: f64 = 1000.0;

/// Content expirations are capped this far into the future.
pub const MAX_CONTENT_EXPIRATION: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Bandwidth preference added per received content message.
const CONTENT_BANDWIDTH_VALUE: f64 = 0.8;

/// Bounds of the per-peer migration back-off.
const MIN_MIGRATION_DELAY: Duration = Duration::from_secs(1);
const MAX_MIGRATION_DELAY: Duration = Duration::from_secs(60 * 60);

/// Minimum migration block for unsolicited content (ms).
const MIGRATION_BLOCK_BASE_MS: u64 = 5_000;

/// Results buffered per client before further results are dropped.
pub const CLIENT_RESULT_CAPACITY: usize = 256;

// ============================================================================
// Errors
// ============================================================================

/// Protocol violation committed by a peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Violation {
    Malformed(WireError),
    /// On-demand placeholders never travel between peers.
    OnDemandContent,
    /// No key can be derived from the content.
    UnderivableKey(BlockType),
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed(e) => write!(f, "malformed message: {e}"),
            Self::OnDemandContent => write!(f, "on-demand placeholder sent as content"),
            Self::UnderivableKey(t) => write!(f, "cannot derive key for {t:?} content"),
        }
    }
}

impl std::error::Error for Violation {}

// ============================================================================
// Collaborators and commands
// ============================================================================

/// External services the node runs against.
#[derive(Clone)]
pub struct Collaborators {
    pub datastore: Arc<dyn Datastore>,
    pub dht: Arc<dyn Dht>,
    pub cadet: Arc<dyn Cadet>,
    pub transport: Arc<dyn Transport>,
    pub peerstore: Arc<dyn Peerstore>,
    pub indexing: Arc<dyn Indexing>,
}

pub(crate) enum Command {
    // Clients
    ConnectClient(oneshot::Sender<(ClientId, mpsc::Receiver<ClientResult>)>),
    DisconnectClient(ClientId),
    StartSearch(ClientId, StartSearch, oneshot::Sender<()>),
    IndexStart(IndexStart, oneshot::Sender<ClientResponse>),
    IndexList(oneshot::Sender<ClientResponse>),
    Unindex(Key, oneshot::Sender<ClientResponse>),
    LocSign(LocationClaim, oneshot::Sender<ClientResponse>),

    // Peers
    PeerConnected(Identity, oneshot::Sender<Result<(), PeerError>>),
    PeerDisconnected(Identity),
    PeerMessage(Identity, Vec<u8>, oneshot::Sender<Result<(), Violation>>),
    LatencyReport(Identity, Duration),

    // Completions
    LocalRecord { request: RequestId, token: u64, result: Result<Option<DatastoreRecord>> },
    OnDemandResolved { request: RequestId, token: u64, original: DatastoreRecord, result: Result<DatastoreRecord> },
    DhtStarted { request: RequestId, token: u64, known_results: mpsc::UnboundedSender<Vec<Key>> },
    DhtReply { request: RequestId, token: u64, result: DhtResult },
    CadetReply { request: RequestId, token: u64, result: Result<CadetReply> },
    PutDone { peer: Option<(Identity, u64)>, started: Instant, requested: bool, result: Result<PutOutcome> },
    Transmitted { peer: Identity, session: u64, kind: TransmissionKind, result: Result<()> },
    Reserved { peer: Identity, session: u64, result: Result<Reservation> },
    ReserveRetry { peer: Identity, session: u64 },
    DelayedRelease { peer: Identity, session: u64, token: u64 },
    RespectLoaded { peer: Identity, session: u64, result: Result<Vec<Vec<u8>>> },
    MigrationRevive { peer: Identity, session: u64 },

    // Queries
    Telemetry(oneshot::Sender<Telemetry>),
    Peers(oneshot::Sender<Vec<PeerSnapshot>>),

    Quit,
}

struct ClientState {
    results: mpsc::Sender<ClientResult>,
    requests: Vec<RequestId>,
}

struct DhtTask {
    token: u64,
    abort: AbortHandle,
    known_results: Option<mpsc::UnboundedSender<Vec<Key>>>,
}

pub(crate) struct FsActor {
    keypair: Keypair,
    ctx: CoreContext,
    peers: PeerRegistry,
    requests: PendingTable,
    planner: Planner,
    collab: Collaborators,
    cmd_tx: mpsc::Sender<Command>,
    clients: HashMap<ClientId, ClientState>,
    acks: HashMap<RequestId, oneshot::Sender<()>>,
    local_tasks: HashMap<RequestId, AbortHandle>,
    dht_tasks: HashMap<RequestId, DhtTask>,
    cadet_tasks: HashMap<RequestId, (u64, AbortHandle)>,
    next_token: u64,
    next_client: u64,
    rng: StdRng,
}

/// Absolute expiration (µs since epoch) capped at one year from now.
fn cap_expiration(expiration: u64) -> u64 {
    expiration.min(now_us().saturating_add(MAX_CONTENT_EXPIRATION.as_micros() as u64))
}

/// Wall-clock time (µs since epoch) of a monotonic instant in the past.
fn wall_clock(at: Instant, now: Instant) -> u64 {
    now_us().saturating_sub(now.saturating_duration_since(at).as_micros() as u64)
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl FsActor {
    pub(crate) fn new(
        keypair: Keypair,
        config: FsConfig,
        collab: Collaborators,
        cmd_tx: mpsc::Sender<Command>,
    ) -> Self {
        let local = keypair.identity();
        let peers = PeerRegistry::new(local, config.max_pending_queries_per_peer);
        let requests = PendingTable::new(config.max_pending_requests);
        Self {
            keypair,
            ctx: CoreContext::new(config, local),
            peers,
            requests,
            planner: Planner::new(),
            collab,
            cmd_tx,
            clients: HashMap::new(),
            acks: HashMap::new(),
            local_tasks: HashMap::new(),
            dht_tasks: HashMap::new(),
            cadet_tasks: HashMap::new(),
            next_token: 1,
            next_client: 1,
            rng: StdRng::from_entropy(),
        }
    }

    pub(crate) async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        let mut cover_aging = tokio::time::interval(self.ctx.config.cover_age_frequency);
        let mut maintenance = tokio::time::interval(self.ctx.config.maintenance_interval);
        let mut respect_flush = tokio::time::interval(self.ctx.config.respect_flush_interval);
        cover_aging.tick().await;
        maintenance.tick().await;
        respect_flush.tick().await;

        info!(local = %self.ctx.local, "fs actor started");
        loop {
            let wakeup = self.planner.next_wakeup();
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Quit) | None => break,
                        Some(cmd) => self.handle(cmd),
                    }
                }
                _ = cover_aging.tick() => self.ctx.age_cover_counters(),
                _ = maintenance.tick() => self.maintenance(),
                _ = respect_flush.tick() => self.flush_respect(),
                _ = sleep_until_opt(wakeup) => self.pump_ready_plans(),
            }
        }

        self.flush_respect();
        for handle in self.local_tasks.values() {
            handle.abort();
        }
        for task in self.dht_tasks.values() {
            task.abort.abort();
        }
        for (_, handle) in self.cadet_tasks.values() {
            handle.abort();
        }
        info!(local = %self.ctx.local, "fs actor stopped");
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::ConnectClient(reply) => {
                let id = ClientId(self.next_client);
                self.next_client += 1;
                let (tx, rx) = mpsc::channel(CLIENT_RESULT_CAPACITY);
                self.clients.insert(id, ClientState { results: tx, requests: Vec::new() });
                debug!(client = %id, "client connected");
                let _ = reply.send((id, rx));
            }
            Command::DisconnectClient(client) => self.on_client_disconnected(client),
            Command::StartSearch(client, search, ack) => self.on_start_search(client, search, ack),
            Command::IndexStart(request, reply) => self.on_index_start(request, reply),
            Command::IndexList(reply) => self.on_index_list(reply),
            Command::Unindex(file_id, reply) => self.on_unindex(file_id, reply),
            Command::LocSign(claim, reply) => self.on_loc_sign(claim, reply),

            Command::PeerConnected(peer, reply) => {
                let _ = reply.send(self.on_peer_connected(peer));
            }
            Command::PeerDisconnected(peer) => self.on_peer_disconnected(peer),
            Command::PeerMessage(from, bytes, reply) => {
                let _ = reply.send(self.on_peer_message(from, &bytes));
            }
            Command::LatencyReport(peer, latency) => {
                trace!(peer = %peer, latency = ?latency, "latency report");
                self.ctx.update_latency(latency);
            }

            Command::LocalRecord { request, token, result } => self.on_local_record(request, token, result),
            Command::OnDemandResolved { request, token, original, result } => {
                self.on_demand_resolved(request, token, original, result)
            }
            Command::DhtStarted { request, token, known_results } => {
                if let Some(task) = self.dht_tasks.get_mut(&request).filter(|t| t.token == token) {
                    task.known_results = Some(known_results);
                }
            }
            Command::DhtReply { request, token, result } => self.on_dht_reply(request, token, result),
            Command::CadetReply { request, token, result } => self.on_cadet_reply(request, token, result),
            Command::PutDone { peer, started, requested, result } => {
                self.on_put_done(peer, started, requested, result)
            }
            Command::Transmitted { peer, session, kind, result } => {
                self.on_transmitted(peer, session, kind, result)
            }
            Command::Reserved { peer, session, result } => self.on_reserved(peer, session, result),
            Command::ReserveRetry { peer, session } => {
                if self.peers.session_mut(&peer, session).is_some() {
                    self.spawn_reserve(peer, session, RESERVATION_SIZE);
                }
            }
            Command::DelayedRelease { peer, session, token } => {
                if self.peers.release_delayed(&peer, session, token, Instant::now()) {
                    self.ctx.counters.replies_to_peers += 1;
                    self.pump(peer);
                }
            }
            Command::RespectLoaded { peer, session, result } => {
                let stored = match result {
                    Ok(values) => values
                        .first()
                        .and_then(|v| <[u8; 4]>::try_from(v.as_slice()).ok())
                        .map(u32::from_be_bytes),
                    Err(e) => {
                        warn!(peer = %peer, error = %e, "failed to load respect");
                        None
                    }
                };
                self.peers.respect_loaded(&peer, session, stored);
            }
            Command::MigrationRevive { peer, session } => {
                if let Some(delay) = self.peers.revive_migration(&peer, session, Instant::now()) {
                    self.spawn_command(async move {
                        tokio::time::sleep(delay).await;
                        Command::MigrationRevive { peer, session }
                    });
                }
            }

            Command::Telemetry(reply) => {
                let _ = reply.send(self.telemetry());
            }
            Command::Peers(reply) => {
                let _ = reply.send(self.peers.snapshots());
            }
            Command::Quit => {}
        }
    }

    fn spawn_command<F>(&self, fut: F) -> AbortHandle
    where
        F: Future<Output = Command> + Send + 'static,
    {
        let tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            let cmd = fut.await;
            let _ = tx.send(cmd).await;
        })
        .abort_handle()
    }

    fn next_token(&mut self) -> u64 {
        let token = self.next_token;
        self.next_token += 1;
        token
    }

    fn telemetry(&self) -> Telemetry {
        Telemetry {
            local: self.ctx.local,
            connected_peers: self.peers.len(),
            pending_requests: self.requests.len(),
            expiring_requests: self.requests.expiring_len(),
            plans: self.planner.len(),
            typical_priority: self.ctx.typical_priority,
            cover_query_count: self.ctx.cover_query_count,
            cover_content_count: self.ctx.cover_content_count,
            avg_latency: self.ctx.avg_latency,
            datastore_get_load: self.ctx.datastore_get_load.load(),
            datastore_put_load: self.ctx.datastore_put_load.load(),
            counters: self.ctx.counters.clone(),
        }
    }

    // ========================================================================
    // Request lifecycle
    // ========================================================================

    /// Cancel a request and release everything attached to it.
    fn cancel_request(&mut self, id: RequestId, full: bool) {
        let Some(cancelled) = self.requests.cancel(id, full, &mut self.planner) else {
            return;
        };
        if let Some(handle) = self.local_tasks.remove(&id) {
            handle.abort();
        }
        if let Some(task) = self.dht_tasks.remove(&id) {
            task.abort.abort();
        }
        if let Some((_, handle)) = self.cadet_tasks.remove(&id) {
            handle.abort();
        }
        match cancelled.owner {
            ReplyHandler::Peer(peer) => {
                if let Some(cp) = self.peers.get_mut(&peer) {
                    cp.remove_request(&cancelled.query, id);
                }
            }
            ReplyHandler::Client(client) => {
                if full {
                    if let Some(state) = self.clients.get_mut(&client) {
                        state.requests.retain(|r| *r != id);
                    }
                }
            }
        }
        trace!(request = %id, full, "request cancelled");
        match cancelled.continuation {
            Some(continuation) => self.run_continuation(id, continuation, cancelled.local_result),
            None => {
                if let Some(ack) = self.acks.remove(&id) {
                    let _ = ack.send(());
                }
            }
        }
    }

    fn handle_eviction(&mut self, evicted: Option<(RequestId, Option<ReplyHandler>)>) {
        if let Some((victim, handler)) = evicted {
            self.ctx.counters.requests_evicted += 1;
            match handler {
                Some(ReplyHandler::Client(client)) => {
                    debug!(request = %victim, client = %client, "client request evicted")
                }
                Some(ReplyHandler::Peer(peer)) => debug!(request = %victim, peer = %peer, "peer request evicted"),
                None => debug!(request = %victim, "request evicted"),
            }
            self.cancel_request(victim, true);
        }
    }

    fn maintenance(&mut self) {
        let free = self
            .requests
            .sweep(self.ctx.config.lookup_warning_interval, Instant::now());
        for id in free {
            self.ctx.counters.requests_expired += 1;
            self.cancel_request(id, true);
        }
    }

    // ========================================================================
    // Local lookup
    // ========================================================================

    fn start_local(&mut self, id: RequestId, continuation: LocalContinuation) {
        let queue_size = self.ctx.config.datastore_queue_size;
        if let Some((token, query)) = self
            .requests
            .start_local_lookup(id, continuation, queue_size, Instant::now())
        {
            self.spawn_datastore_get(id, token, query);
        }
    }

    fn spawn_datastore_get(&mut self, id: RequestId, token: u64, query: DatastoreQuery) {
        let datastore = self.collab.datastore.clone();
        let handle = self.spawn_command(async move {
            let result = datastore.get_key(query).await;
            Command::LocalRecord { request: id, token, result }
        });
        self.local_tasks.insert(id, handle);
    }

    fn spawn_remove(&self, key: Key, data: Vec<u8>) {
        let datastore = self.collab.datastore.clone();
        tokio::spawn(async move {
            if let Err(e) = datastore.remove(key, data).await {
                debug!(error = %e, "failed to remove corrupt record");
            }
        });
    }

    fn on_local_record(&mut self, id: RequestId, token: u64, result: Result<Option<DatastoreRecord>>) {
        let record = match result {
            Ok(record) => record,
            Err(e) => {
                warn!(request = %id, error = %e, "datastore lookup failed");
                self.finish_local(id);
                return;
            }
        };
        let step = self.requests.local_lookup_record(
            id,
            token,
            record,
            &mut self.ctx,
            &mut self.peers,
            &self.planner,
            Instant::now(),
            &mut self.rng,
        );
        self.apply_local_step(id, step);
    }

    fn on_demand_resolved(
        &mut self,
        id: RequestId,
        token: u64,
        original: DatastoreRecord,
        result: Result<DatastoreRecord>,
    ) {
        let resolved = match result {
            Ok(block) => Some(block),
            Err(e) => {
                warn!(request = %id, error = %e, "on-demand block unavailable");
                None
            }
        };
        let step = self.requests.local_lookup_resolved(
            id,
            token,
            original,
            resolved,
            &mut self.ctx,
            &mut self.peers,
            &self.planner,
            Instant::now(),
            &mut self.rng,
        );
        self.apply_local_step(id, step);
    }

    fn apply_local_step(&mut self, id: RequestId, step: LocalStep) {
        if let Some((key, data)) = step.remove {
            self.spawn_remove(key, data);
        }
        self.deliver(step.deliveries);
        let still_running = self
            .requests
            .get(id)
            .is_some_and(PendingRequest::local_lookup_active);
        match step.next {
            LocalNext::Stale => {}
            LocalNext::Query { token, query } if still_running => self.spawn_datastore_get(id, token, query),
            LocalNext::Resolve { token, record } if still_running => {
                let indexing = self.collab.indexing.clone();
                let handle = self.spawn_command(async move {
                    let result = indexing.resolve_on_demand(record.clone()).await;
                    Command::OnDemandResolved { request: id, token, original: record, result }
                });
                self.local_tasks.insert(id, handle);
            }
            LocalNext::Query { .. } | LocalNext::Resolve { .. } => {}
            LocalNext::Finish => self.finish_local(id),
        }
    }

    fn finish_local(&mut self, id: RequestId) {
        self.local_tasks.remove(&id);
        let Some(done) = self.requests.finish_local_lookup(id) else {
            return;
        };
        if let Some(synthetic) = done.synthetic {
            self.deliver(vec![synthetic]);
        }
        if let Some(continuation) = done.continuation {
            self.run_continuation(id, continuation, done.result);
        }
    }

    fn run_continuation(&mut self, id: RequestId, continuation: LocalContinuation, result: Option<Evaluation>) {
        match continuation {
            LocalContinuation::ClientSearch(client) => {
                if let Some(ack) = self.acks.remove(&id) {
                    let _ = ack.send(());
                }
                trace!(client = %client, request = %id, ?result, "local processing done");
                if result == Some(Evaluation::OkLast) {
                    return;
                }
                let Some(request) = self.requests.get(id).filter(|r| r.is_active()) else {
                    return;
                };
                if request.options.contains(RequestOptions::LOCAL_ONLY) {
                    return;
                }
                if request.anonymity == 0 {
                    match request.block_type {
                        BlockType::DBlock | BlockType::IBlock if request.target.is_some() => self.start_cadet(id),
                        BlockType::UBlock => self.start_dht(id),
                        _ => {}
                    }
                }
                self.consider_forwarding(id, result);
            }
            LocalContinuation::ConsiderForwarding => self.consider_forwarding(id, result),
        }
    }

    /// Offer a request to every connected peer it may be sent to.
    fn consider_forwarding(&mut self, id: RequestId, result: Option<Evaluation>) {
        if result == Some(Evaluation::OkLast) {
            return;
        }
        let Some(request) = self.requests.get(id) else {
            return;
        };
        if !request.is_active() || request.options.contains(RequestOptions::LOCAL_ONLY) {
            return;
        }
        let plan = PlanRequest { id, query: request.query, block_type: request.block_type, ttl: request.ttl };
        let anonymity = request.anonymity;
        if !self.charge_cover(id, anonymity) {
            return;
        }
        let now = Instant::now();
        for peer in self.peers.identities() {
            if !self.requests.test_target(id, &peer) {
                continue;
            }
            self.planner.add(peer, plan, &mut self.ctx, now, &mut self.rng);
            self.pump(peer);
        }
    }

    /// Debit `anonymity - 1` units of query cover traffic before a request
    /// is offered to peers. Requests with anonymity 0 or 1 are never gated.
    fn charge_cover(&mut self, id: RequestId, anonymity: u32) -> bool {
        if anonymity <= 1 {
            return true;
        }
        let needed = anonymity - 1;
        if self.ctx.cover_query_count < needed {
            debug!(request = %id, needed, available = self.ctx.cover_query_count, "not enough cover traffic to forward");
            return false;
        }
        self.ctx.cover_query_count -= needed;
        true
    }

    // ========================================================================
    // DHT and direct-peer lookups
    // ========================================================================

    fn start_dht(&mut self, id: RequestId) {
        let token = self.next_token();
        let replication = self.ctx.config.dht_replication;
        let Some(request) = self.requests.get_mut(id) else {
            return;
        };
        if request.anonymity != 0 {
            return;
        }
        request.dht_active = true;
        let get = DhtGet {
            block_type: request.block_type,
            key: request.query,
            replication,
            xquery: if request.options.contains(RequestOptions::FORWARD_ONLY) { request.sender } else { None },
            known_results: request.known_results(),
        };
        let dht = self.collab.dht.clone();
        let tx = self.cmd_tx.clone();
        let abort = tokio::spawn(async move {
            let mut lookup = match dht.get_start(get).await {
                Ok(lookup) => lookup,
                Err(e) => {
                    debug!(request = %id, error = %e, "dht lookup failed to start");
                    return;
                }
            };
            let known_results = lookup.known_results.clone();
            if tx.send(Command::DhtStarted { request: id, token, known_results }).await.is_err() {
                return;
            }
            while let Some(result) = lookup.results.recv().await {
                if tx.send(Command::DhtReply { request: id, token, result }).await.is_err() {
                    break;
                }
            }
        })
        .abort_handle();
        self.dht_tasks.insert(id, DhtTask { token, abort, known_results: None });
    }

    fn forward_known_results(&self, id: RequestId, hashes: Vec<Key>) {
        if hashes.is_empty() {
            return;
        }
        if let Some(tx) = self.dht_tasks.get(&id).and_then(|t| t.known_results.as_ref()) {
            let _ = tx.send(hashes);
        }
    }

    fn on_dht_reply(&mut self, id: RequestId, token: u64, result: DhtResult) {
        if !self.dht_tasks.get(&id).is_some_and(|t| t.token == token) {
            return;
        }
        self.ctx.counters.dht_results += 1;
        let reply = IncomingReply {
            key: result.key,
            block_type: result.block_type,
            data: result.data,
            expiration: cap_expiration(result.expiration),
            anonymity: ANONYMITY_UNKNOWN,
            sender: None,
        };
        self.process_external_reply(reply);
    }

    fn start_cadet(&mut self, id: RequestId) {
        let token = self.next_token();
        let Some(request) = self.requests.get_mut(id) else {
            return;
        };
        let Some(target) = request.target else {
            return;
        };
        if request.anonymity != 0 {
            return;
        }
        request.cadet_active = true;
        let (key, block_type) = (request.query, request.block_type);
        let cadet = self.collab.cadet.clone();
        let handle = self.spawn_command(async move {
            let result = cadet.query(target, key, block_type).await;
            Command::CadetReply { request: id, token, result }
        });
        self.cadet_tasks.insert(id, (token, handle));
    }

    fn on_cadet_reply(&mut self, id: RequestId, token: u64, result: Result<CadetReply>) {
        if !self.cadet_tasks.get(&id).is_some_and(|(t, _)| *t == token) {
            return;
        }
        self.cadet_tasks.remove(&id);
        let retry_max = self.ctx.config.cadet_retry_max;
        let Some(request) = self.requests.get_mut(id) else {
            return;
        };
        let reply = match result {
            Ok(reply) => reply,
            Err(e) => {
                if request.cadet_retries < retry_max {
                    request.cadet_retries += 1;
                    debug!(request = %id, attempt = request.cadet_retries, error = %e, "retrying direct-peer lookup");
                    self.start_cadet(id);
                } else {
                    request.cadet_active = false;
                    debug!(request = %id, error = %e, "direct-peer lookup failed");
                }
                return;
            }
        };
        request.cadet_active = false;
        let query = request.query;
        match block::get_key(reply.block_type, &reply.data) {
            Some(key) if key == query => {}
            _ => {
                warn!(request = %id, "direct-peer reply does not match query");
                return;
            }
        }
        self.ctx.counters.cadet_results += 1;
        self.process_external_reply(IncomingReply {
            key: query,
            block_type: reply.block_type,
            data: reply.data,
            expiration: cap_expiration(reply.expiration),
            anonymity: ANONYMITY_UNKNOWN,
            sender: None,
        });
    }

    /// Evaluate a DHT or direct-peer reply and cache it.
    fn process_external_reply(&mut self, reply: IncomingReply) {
        let outcome = self.requests.process_reply(
            &reply,
            0,
            &mut self.ctx,
            &mut self.peers,
            &self.planner,
            Instant::now(),
            &mut self.rng,
        );
        let (found, priority) = (outcome.request_found, outcome.priority);
        self.deliver(outcome.deliveries);
        if self.ctx.config.content_caching && !self.ctx.put_load_too_high(priority) {
            self.cache_content(None, &reply, priority, found);
        }
    }

    // ========================================================================
    // Deliveries
    // ========================================================================

    fn deliver(&mut self, deliveries: Vec<Delivery>) {
        for delivery in deliveries {
            match delivery.handler {
                ReplyHandler::Client(client) => self.deliver_to_client(client, delivery),
                ReplyHandler::Peer(peer) => self.deliver_to_peer(peer, delivery),
            }
        }
    }

    fn deliver_to_client(&mut self, client: ClientId, delivery: Delivery) {
        if let Some(reply) = &delivery.reply {
            let last_transmission = match delivery.last_transmission {
                LastTransmission::At(at) => Some(wall_clock(at, Instant::now())),
                LastTransmission::NeverSent | LastTransmission::NoRecord => None,
            };
            let result = ClientResult {
                block_type: reply.block_type,
                expiration: reply.expiration,
                last_transmission,
                num_transmissions: delivery.num_transmissions,
                respect_offered: delivery.respect_offered,
                data: reply.data.clone(),
            };
            if let Some(state) = self.clients.get(&client) {
                match state.results.try_send(result) {
                    Ok(()) => self.ctx.counters.replies_to_clients += 1,
                    Err(e) => debug!(client = %client, error = %e, "client result dropped"),
                }
            }
        }
        if delivery.is_terminal() {
            self.cancel_request(delivery.request, true);
        }
    }

    fn deliver_to_peer(&mut self, peer: Identity, delivery: Delivery) {
        let Some(reply) = delivery.reply else {
            self.cancel_request(delivery.request, true);
            return;
        };
        let terminal = delivery.eval == Evaluation::OkLast;
        self.send_reply(peer, delivery.anonymity, PutMessage {
            block_type: reply.block_type,
            expiration: reply.expiration,
            data: reply.data,
        });
        if terminal {
            self.cancel_request(delivery.request, false);
        }
    }

    fn send_reply(&mut self, peer: Identity, anonymity: u32, put: PutMessage) {
        if anonymity != ANONYMITY_UNKNOWN && anonymity > 1 {
            let needed = anonymity - 1;
            if self.ctx.cover_content_count < needed {
                self.ctx.counters.replies_dropped_cover += 1;
                debug!(peer = %peer, needed, "reply dropped for lack of cover traffic");
                return;
            }
            self.ctx.cover_content_count -= needed;
        }
        let bytes = match put.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(peer = %peer, error = %e, "cannot encode reply");
                return;
            }
        };
        let now = Instant::now();
        let delayed = self.ctx.config.randomized_delays && anonymity != ANONYMITY_UNKNOWN && anonymity != 0;
        if !delayed {
            match self.peers.transmit(&peer, TransmissionKind::Content, u32::MAX, bytes, now) {
                Ok(()) => {
                    self.ctx.counters.replies_to_peers += 1;
                    self.pump(peer);
                }
                Err(e) => debug!(peer = %peer, error = %e, "reply not queued"),
            }
            return;
        }
        let Some(session) = self.peers.get(&peer).map(|p| p.session) else {
            return;
        };
        let max = (self.ctx.avg_latency * 2).as_micros() as u64;
        let delay = Duration::from_micros(self.rng.gen_range(0..=max));
        match self.peers.transmit_delayed(&peer, u32::MAX, bytes, now) {
            Ok(token) => {
                self.ctx.counters.replies_delayed += 1;
                self.spawn_command(async move {
                    tokio::time::sleep(delay).await;
                    Command::DelayedRelease { peer, session, token }
                });
            }
            Err(e) => debug!(peer = %peer, error = %e, "reply not queued"),
        }
    }

    // ========================================================================
    // Send queues
    // ========================================================================

    fn pump_ready_plans(&mut self) {
        for peer in self.planner.peers_with_work(Instant::now()) {
            self.pump(peer);
        }
    }

    /// Submit the best ready plan and drive the send queue towards `peer`.
    fn pump(&mut self, peer: Identity) {
        let now = Instant::now();
        if let Some(submission) = self.planner.next_ready(&peer, now) {
            self.submit_plan(peer, submission, now);
        }
        self.drive_queue(peer, now);
    }

    fn submit_plan(&mut self, peer: Identity, submission: Submission, now: Instant) {
        let full = self
            .peers
            .get(&peer)
            .map_or(true, |p| p.pending_queries() >= self.ctx.config.max_pending_queries_per_peer);
        if full {
            return;
        }
        let Some(message) = self
            .requests
            .build_get_message(submission.request, submission.priority, now, &mut self.rng)
        else {
            return;
        };
        let bytes = match message.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(request = %submission.request, error = %e, "cannot encode query");
                return;
            }
        };
        match self
            .peers
            .transmit(&peer, TransmissionKind::Query, submission.priority, bytes, now)
        {
            Ok(()) => {
                self.planner.submitted(&peer, submission.plan);
                self.ctx.counters.queries_sent += 1;
                trace!(peer = %peer, request = %submission.request, priority = submission.priority, "query queued");
            }
            Err(e) => debug!(peer = %peer, error = %e, "query not queued"),
        }
    }

    fn drive_queue(&mut self, peer: Identity, now: Instant) {
        let Some(session) = self.peers.get(&peer).map(|p| p.session) else {
            return;
        };
        match self.peers.next_transmission(&peer, now) {
            NextTransmission::Idle => {}
            NextTransmission::Reserve { amount } => self.spawn_reserve(peer, session, amount),
            NextTransmission::Send(entry) => {
                if let Some(amount) = self.peers.take_preference(&peer) {
                    let transport = self.collab.transport.clone();
                    tokio::spawn(async move {
                        if let Err(e) = transport.change_preference(&peer, amount).await {
                            debug!(peer = %peer, error = %e, "preference change failed");
                        }
                    });
                }
                let kind = entry.kind;
                let transport = self.collab.transport.clone();
                self.spawn_command(async move {
                    let result = transport.send(&peer, entry.message).await;
                    Command::Transmitted { peer, session, kind, result }
                });
                if kind == TransmissionKind::Query && self.peers.wants_reservation(&peer) {
                    self.spawn_reserve(peer, session, RESERVATION_SIZE);
                }
            }
        }
    }

    fn spawn_reserve(&self, peer: Identity, session: u64, amount: u32) {
        let transport = self.collab.transport.clone();
        self.spawn_command(async move {
            let result = transport.reserve(&peer, amount).await;
            Command::Reserved { peer, session, result }
        });
    }

    fn on_reserved(&mut self, peer: Identity, session: u64, result: Result<Reservation>) {
        let (granted, retry_after) = match result {
            Ok(r) => (r.granted, r.retry_after),
            Err(e) => {
                debug!(peer = %peer, error = %e, "reservation failed");
                (0, MAX_RESERVATION_RETRY)
            }
        };
        match self.peers.reservation_result(&peer, session, granted, retry_after) {
            Some(delay) => {
                self.spawn_command(async move {
                    tokio::time::sleep(delay).await;
                    Command::ReserveRetry { peer, session }
                });
            }
            None => self.pump(peer),
        }
    }

    fn on_transmitted(&mut self, peer: Identity, session: u64, kind: TransmissionKind, result: Result<()>) {
        if let Err(e) = result {
            debug!(peer = %peer, error = %e, "transmission failed");
        }
        if self.peers.session_mut(&peer, session).is_none() {
            return;
        }
        self.peers.transmit_done(&peer, session);
        if kind == TransmissionKind::Query {
            self.planner
                .transmitted(&peer, &mut self.ctx, Instant::now(), &mut self.rng);
        }
        self.pump(peer);
    }

    // ========================================================================
    // Peers
    // ========================================================================

    fn on_peer_connected(&mut self, peer: Identity) -> Result<(), PeerError> {
        let session = self.peers.connect(peer)?.session;
        info!(peer = %peer, "peer connected");
        self.spawn_reserve(peer, session, RESERVATION_SIZE);
        let peerstore = self.collab.peerstore.clone();
        self.spawn_command(async move {
            let result = peerstore.get(RESPECT_NAMESPACE, &peer, RESPECT_KEY).await;
            Command::RespectLoaded { peer, session, result }
        });

        let mut offers = Vec::new();
        self.requests.iterate(|r| {
            if r.is_active() && !r.local_lookup_active() && !r.options.contains(RequestOptions::LOCAL_ONLY) {
                let plan = PlanRequest { id: r.id, query: r.query, block_type: r.block_type, ttl: r.ttl };
                offers.push((plan, r.anonymity));
            }
        });
        let now = Instant::now();
        for (plan, anonymity) in offers {
            if !self.requests.test_target(plan.id, &peer) {
                continue;
            }
            // Requests held back for lack of cover get another chance here.
            if !self.charge_cover(plan.id, anonymity) {
                continue;
            }
            self.planner.add(peer, plan, &mut self.ctx, now, &mut self.rng);
        }
        self.pump(peer);
        Ok(())
    }

    fn on_peer_disconnected(&mut self, peer: Identity) {
        let Some(gone) = self.peers.disconnect(&peer) else {
            return;
        };
        if let Some(respect) = gone.flush_respect {
            self.store_respect(peer, respect);
        }
        self.planner.notify_peer_disconnect(&peer);
        for id in gone.requests {
            self.cancel_request(id, true);
        }
        info!(peer = %peer, discarded = gone.discarded, "peer disconnected");
    }

    fn store_respect(&self, peer: Identity, respect: u32) {
        let peerstore = self.collab.peerstore.clone();
        tokio::spawn(async move {
            let value = respect.to_be_bytes().to_vec();
            if let Err(e) = peerstore.store(RESPECT_NAMESPACE, &peer, RESPECT_KEY, value).await {
                warn!(peer = %peer, error = %e, "failed to store respect");
            }
        });
    }

    fn flush_respect(&mut self) {
        for (peer, respect) in self.peers.respect_to_flush() {
            self.store_respect(peer, respect);
        }
    }

    fn on_peer_message(&mut self, from: Identity, bytes: &[u8]) -> Result<(), Violation> {
        let message = match PeerMessage::decode(bytes) {
            Ok(message) => message,
            Err(e) => {
                self.ctx.counters.protocol_violations += 1;
                warn!(peer = %from, error = %e, "malformed peer message");
                return Err(Violation::Malformed(e));
            }
        };
        match message {
            PeerMessage::Get(get) => {
                self.on_get(from, get);
                Ok(())
            }
            PeerMessage::Put(put) => self.on_put(from, put).inspect_err(|v| {
                self.ctx.counters.protocol_violations += 1;
                warn!(peer = %from, violation = %v, "protocol violation");
            }),
            PeerMessage::MigrationStop(stop) => {
                self.on_migration_stop(from, stop);
                Ok(())
            }
        }
    }

    fn on_get(&mut self, from: Identity, get: GetMessage) {
        self.ctx.counters.queries_received += 1;
        self.ctx.cover_query_count = self.ctx.cover_query_count.saturating_add(1);
        if !self.peers.is_connected(&from) {
            self.ctx.counters.queries_dropped_unknown_peer += 1;
            return;
        }
        let reply_to = match get.return_to {
            Some(peer) if !self.peers.is_connected(&peer) => {
                self.ctx.counters.queries_dropped_unknown_peer += 1;
                debug!(peer = %from, return_to = %peer, "query asks for replies to an unknown peer");
                return;
            }
            Some(peer) => peer,
            None => from,
        };
        let Some(target) = self.peers.get(&reply_to) else {
            return;
        };
        if target.pending_replies() + target.delay_queue_size() > self.ctx.config.max_queue_per_peer {
            self.ctx.counters.queries_dropped_queue += 1;
            debug!(peer = %reply_to, "reply queue full, query dropped");
            return;
        }

        let charged = match self.peers.get_mut(&from) {
            Some(sender) => bound_priority(&mut self.ctx, sender, get.priority),
            None => None,
        };
        let Some(mut priority) = charged else {
            self.ctx.counters.queries_dropped_load += 1;
            return;
        };

        let mut options = RequestOptions::NONE;
        let mut sender = None;
        if let Some(cp) = self.peers.get(&reply_to) {
            let lifetime = self.ctx.request_lifetime.average();
            if cp.transmission_load() > 3.0 * (1.0 + priority as f64)
                || cp.transmission_average() > 2.0 * CORK_DELAY_MS + lifetime
            {
                priority = 0;
                options.insert(RequestOptions::FORWARD_ONLY);
                sender = Some(from);
                self.ctx.counters.queries_indirected += 1;
            }
        }

        let ttl = CoreContext::bound_ttl(get.ttl, priority);
        let decrement = 2 * TTL_DECREMENT + self.rng.gen_range(0..TTL_DECREMENT);
        let Some(ttl) = ttl.checked_sub(decrement) else {
            self.ctx.counters.queries_dropped_ttl += 1;
            debug!(peer = %from, "query TTL underflow");
            return;
        };

        let now = Instant::now();
        let existing = self
            .peers
            .get(&reply_to)
            .map(|p| p.requests_for(&get.query).to_vec())
            .unwrap_or_default();
        for id in existing {
            let Some(request) = self.requests.get_mut(id) else {
                continue;
            };
            if request.block_type != get.block_type {
                continue;
            }
            if request.ttl >= deadline(now, ttl) {
                request.priority = request.priority.saturating_add(priority);
                self.ctx.counters.queries_merged += 1;
                trace!(peer = %from, request = %id, "query merged into existing request");
                return;
            }
            priority = priority.saturating_add(request.priority);
            self.cancel_request(id, true);
            break;
        }

        let bloom = (!get.bloom.is_empty()).then(|| (get.bloom, get.filter_mutator));
        let created = self.requests.create(
            NewRequest {
                options,
                block_type: get.block_type,
                query: get.query,
                target: get.transmit_to,
                bloom,
                anonymity: 1,
                priority,
                ttl,
                sender,
                origin: Some(from),
                known_replies: Vec::new(),
                handler: ReplyHandler::Peer(reply_to),
            },
            now,
            &mut self.rng,
        );
        if let Some(cp) = self.peers.get_mut(&reply_to) {
            cp.add_request(get.query, created.id);
        }
        trace!(peer = %from, request = %created.id, priority, ttl, "peer query accepted");
        self.handle_eviction(created.evicted);
        self.start_local(created.id, LocalContinuation::ConsiderForwarding);
    }

    fn on_put(&mut self, from: Identity, put: PutMessage) -> Result<(), Violation> {
        self.ctx.counters.content_received += 1;
        self.ctx.cover_content_count = self.ctx.cover_content_count.saturating_add(1);
        if put.block_type == BlockType::OnDemand {
            return Err(Violation::OnDemandContent);
        }
        let Some(key) = block::get_key(put.block_type, &put.data) else {
            return Err(Violation::UnderivableKey(put.block_type));
        };
        let reply = IncomingReply {
            key,
            block_type: put.block_type,
            data: put.data,
            expiration: cap_expiration(put.expiration),
            anonymity: ANONYMITY_UNKNOWN,
            sender: Some(from),
        };
        let outcome = self.requests.process_reply(
            &reply,
            0,
            &mut self.ctx,
            &mut self.peers,
            &self.planner,
            Instant::now(),
            &mut self.rng,
        );
        let (found, priority) = (outcome.request_found, outcome.priority);
        self.deliver(outcome.deliveries);

        if !self.peers.is_connected(&from) {
            return Ok(());
        }
        self.peers
            .change_bandwidth_preference(&from, CONTENT_BANDWIDTH_VALUE + 1000.0 * priority as f64);
        self.peers.adjust_respect(&from, priority as i64);

        let caching = self.ctx.config.content_caching;
        if caching && !self.ctx.put_load_too_high(priority) {
            self.cache_content(Some(from), &reply, priority, found);
        } else {
            trace!(peer = %from, "not caching pushed content");
        }

        let mut put_load = self.ctx.datastore_put_load.load();
        if !found && (!caching || put_load > 2.5 * (1.0 + priority as f64)) {
            if !caching {
                put_load = 1.0 + self.rng.gen_range(0..5) as f64;
            }
            let spread = (60_000.0 * put_load * put_load).min(u32::MAX as f64) as u64;
            let block = Duration::from_millis(MIGRATION_BLOCK_BASE_MS + self.rng.gen_range(0..=spread));
            self.block_migration(from, Instant::now() + block);
        }
        Ok(())
    }

    fn cache_content(&mut self, peer: Option<Identity>, reply: &IncomingReply, priority: u32, requested: bool) {
        let put = DatastorePut {
            key: reply.key,
            data: reply.data.clone(),
            block_type: reply.block_type,
            priority,
            anonymity: 1,
            replication: 0,
            expiration: reply.expiration,
            queue_priority: priority.saturating_add(1),
            max_queue_size: self.ctx.config.datastore_queue_size,
        };
        let peer = peer.and_then(|p| self.peers.get(&p).map(|cp| (p, cp.session)));
        self.ctx.counters.content_cached += 1;
        let datastore = self.collab.datastore.clone();
        let started = Instant::now();
        self.spawn_command(async move {
            let result = datastore.put(put).await;
            Command::PutDone { peer, started, requested, result }
        });
    }

    fn on_put_done(&mut self, peer: Option<(Identity, u64)>, started: Instant, requested: bool, result: Result<PutOutcome>) {
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                debug!(error = %e, "caching content failed");
                return;
            }
        };
        let now = Instant::now();
        self.ctx.record_put_duration(started, now);
        let Some((peer, session)) = peer else {
            return;
        };
        let Some(cp) = self.peers.session_mut(&peer, session) else {
            return;
        };
        if outcome == PutOutcome::Stored {
            cp.migration_delay /= 2;
            return;
        }
        if requested {
            return;
        }
        if let PutOutcome::Full { min_expiration: Some(min) } = outcome {
            let wall = now_us();
            if min > wall {
                self.block_migration(peer, now + Duration::from_micros(min - wall));
                return;
            }
        }
        cp.migration_delay = cp.migration_delay.clamp(MIN_MIGRATION_DELAY, MAX_MIGRATION_DELAY);
        let pause = Duration::from_micros(self.rng.gen_range(0..=cp.migration_delay.as_micros() as u64));
        cp.migration_delay *= 2;
        self.block_migration(peer, now + pause);
    }

    /// Ask `peer` to stop pushing content until `until`.
    fn block_migration(&mut self, peer: Identity, until: Instant) {
        let now = Instant::now();
        let Some(duration) = self.peers.block_migration(&peer, until, now) else {
            return;
        };
        let bytes = MigrationStop { duration }.encode();
        match self.peers.transmit(&peer, TransmissionKind::Neither, u32::MAX, bytes, now) {
            Ok(()) => {
                self.ctx.counters.migration_stops_sent += 1;
                debug!(peer = %peer, duration = ?duration, "asked peer to stop migration");
                self.pump(peer);
            }
            Err(e) => debug!(peer = %peer, error = %e, "migration stop not queued"),
        }
    }

    fn on_migration_stop(&mut self, from: Identity, stop: MigrationStop) {
        self.ctx.counters.migration_stops_received += 1;
        let Some(session) = self.peers.get(&from).map(|p| p.session) else {
            return;
        };
        debug!(peer = %from, duration = ?stop.duration, "peer asked us to stop migration");
        if let Some(delay) = self.peers.suspend_migration(&from, stop.duration, Instant::now()) {
            self.spawn_command(async move {
                tokio::time::sleep(delay).await;
                Command::MigrationRevive { peer: from, session }
            });
        }
    }

    // ========================================================================
    // Clients
    // ========================================================================

    fn on_client_disconnected(&mut self, client: ClientId) {
        let Some(state) = self.clients.remove(&client) else {
            return;
        };
        debug!(client = %client, requests = state.requests.len(), "client disconnected");
        for id in state.requests {
            self.cancel_request(id, true);
        }
    }

    fn on_start_search(&mut self, client: ClientId, search: StartSearch, ack: oneshot::Sender<()>) {
        let Some(state) = self.clients.get(&client) else {
            debug!(client = %client, "search from unknown client");
            return;
        };
        if search.block_type == BlockType::OnDemand {
            warn!(client = %client, "client searched for on-demand placeholders");
            return;
        }
        let continued = search.options & SEARCH_OPTION_CONTINUED != 0;

        if matches!(search.block_type, BlockType::UBlock | BlockType::Any) {
            let existing = state.requests.iter().copied().find(|id| {
                self.requests.get(*id).is_some_and(|r| {
                    r.query == search.query && r.block_type == search.block_type && !r.has_started
                })
            });
            if let Some(id) = existing {
                let forward = self.requests.update(id, &search.known_replies, &mut self.rng);
                self.forward_known_results(id, forward);
                trace!(client = %client, request = %id, "search merged into pending request");
                if continued {
                    let _ = ack.send(());
                } else {
                    self.acks.insert(id, ack);
                    self.start_local(id, LocalContinuation::ClientSearch(client));
                }
                return;
            }
        }

        let mut options = RequestOptions::LOCAL_REQUEST;
        if search.options & SEARCH_OPTION_LOOPBACK_ONLY != 0 {
            options.insert(RequestOptions::LOCAL_ONLY);
        }
        let created = self.requests.create(
            NewRequest {
                options,
                block_type: search.block_type,
                query: search.query,
                target: search.target,
                bloom: None,
                anonymity: search.anonymity,
                priority: 0,
                ttl: 0,
                sender: None,
                origin: None,
                known_replies: search.known_replies,
                handler: ReplyHandler::Client(client),
            },
            Instant::now(),
            &mut self.rng,
        );
        if let Some(state) = self.clients.get_mut(&client) {
            state.requests.push(created.id);
        }
        debug!(client = %client, request = %created.id, query = %hex::encode(&search.query[..8]), "client search started");
        self.handle_eviction(created.evicted);
        if continued {
            let _ = ack.send(());
        } else {
            self.acks.insert(created.id, ack);
            self.start_local(created.id, LocalContinuation::ClientSearch(client));
        }
    }

    fn on_index_start(&self, request: IndexStart, reply: oneshot::Sender<ClientResponse>) {
        let indexing = self.collab.indexing.clone();
        tokio::spawn(async move {
            let response = index_start(indexing, request).await;
            let _ = reply.send(response);
        });
    }

    fn on_index_list(&self, reply: oneshot::Sender<ClientResponse>) {
        let indexing = self.collab.indexing.clone();
        tokio::spawn(async move {
            let files = indexing.list().await.unwrap_or_else(|e| {
                warn!(error = %e, "failed to list indexed files");
                Vec::new()
            });
            let _ = reply.send(ClientResponse::IndexList(files));
        });
    }

    fn on_unindex(&self, file_id: Key, reply: oneshot::Sender<ClientResponse>) {
        let indexing = self.collab.indexing.clone();
        tokio::spawn(async move {
            match indexing.unindex(file_id).await {
                Ok(true) => debug!(file = %hex::encode(file_id), "file unindexed"),
                Ok(false) => debug!(file = %hex::encode(file_id), "unindex for unknown file"),
                Err(e) => warn!(error = %e, "unindex failed"),
            }
            let _ = reply.send(ClientResponse::UnindexOk);
        });
    }

    fn on_loc_sign(&self, claim: LocationClaim, reply: oneshot::Sender<ClientResponse>) {
        if claim.purpose != LOC_SIGNATURE_PURPOSE {
            warn!(purpose = claim.purpose, "location signing request with wrong purpose");
            return;
        }
        let signature = self.keypair.sign_location(&claim);
        let _ = reply.send(ClientResponse::LocSign(LocSignResponse {
            peer: self.keypair.identity(),
            signature: signature.to_vec(),
            expiration: claim.expiration,
        }));
    }
}

async fn index_start(indexing: Arc<dyn Indexing>, request: IndexStart) -> ClientResponse {
    if request.device != 0 || request.inode != 0 {
        if let Ok(Some((device, inode))) = indexing.file_identity(&request.filename).await {
            if device == request.device && inode == request.inode {
                return add_to_index(indexing, request).await;
            }
        }
    }
    match indexing.hash_file(&request.filename).await {
        Ok(hash) if hash == request.file_id => add_to_index(indexing, request).await,
        Ok(hash) => {
            warn!(
                file = %request.filename,
                expected = %hex::encode(request.file_id),
                actual = %hex::encode(hash),
                "indexed file hash mismatch"
            );
            ClientResponse::IndexStartFailed { reason: "file hash does not match".to_string() }
        }
        Err(e) => ClientResponse::IndexStartFailed { reason: format!("cannot hash file: {e}") },
    }
}

async fn add_to_index(indexing: Arc<dyn Indexing>, request: IndexStart) -> ClientResponse {
    match indexing.add_to_index(&request.filename, request.file_id).await {
        Ok(()) => ClientResponse::IndexStartOk,
        Err(e) => ClientResponse::IndexStartFailed { reason: e.to_string() },
    }
}
