//! # Forwarding Planner
//!
//! Decides when each request is (re)sent to each connected peer.
//!
//! Per peer, a *plan* groups every compatible request (same query and type)
//! that should go to that peer. A plan sits in exactly one of two ordered
//! sets:
//!
//! | Set | Order | Meaning |
//! |-----|-------|---------|
//! | ready | priority descending, then insertion | may be sent now |
//! | delayed | earliest transmission ascending | backing off |
//!
//! Only one planned query per peer is in flight at a time. The dispatch
//! actor asks for the best ready plan, builds and queues the GET, and calls
//! [`Planner::transmitted`] once the transport took it, which reschedules
//! the plan with exponential back-off.
//!
//! A request may be linked to plans of many peers and a plan may carry many
//! requests. Links are dropped when the request finishes or the peer leaves.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};
use std::f64::consts::FRAC_PI_4;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::trace;

use crate::block::{BlockType, Key};
use crate::context::CoreContext;
use crate::identity::Identity;
use crate::pending::RequestId;

/// Extra back-off applied to every retransmission.
pub const RETRANSMISSION_GRACE: Duration = Duration::from_secs(5);

/// Counter value from which back-off stops growing.
const BACKOFF_CAP_COUNTER: u32 = 32;

/// Weight of the previous value in the shared average plan delay.
const AVG_DELAY_WEIGHT: f64 = 128.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlanId(pub u64);

/// When a request was last sent to a given peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LastTransmission {
    /// The request was never planned for that peer.
    NoRecord,
    /// Planned but not sent yet.
    NeverSent,
    At(Instant),
}

/// What the planner needs to know about a request.
#[derive(Clone, Copy, Debug)]
pub struct PlanRequest {
    pub id: RequestId,
    pub query: Key,
    pub block_type: BlockType,
    pub ttl: Instant,
}

/// A plan ready to go out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Submission {
    pub plan: PlanId,
    /// Request with the latest deadline; the GET is built from it.
    pub request: RequestId,
    /// Transmission priority and bid.
    pub priority: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Slot {
    Ready((Reverse<u32>, u64, PlanId)),
    Delayed((Instant, u64, PlanId)),
}

#[derive(Debug)]
struct RequestPlan {
    query: Key,
    block_type: BlockType,
    requests: Vec<(RequestId, Instant)>,
    priority: u32,
    transmission_counter: u32,
    last_transmission: Option<Instant>,
    earliest_transmission: Instant,
    slot: Slot,
}

impl RequestPlan {
    fn latest(&self) -> Option<(RequestId, Instant)> {
        self.requests.iter().copied().max_by_key(|(_, ttl)| *ttl)
    }
}

#[derive(Debug, Default)]
struct PeerPlans {
    plans: HashMap<PlanId, RequestPlan>,
    ready: BTreeSet<(Reverse<u32>, u64, PlanId)>,
    delayed: BTreeSet<(Instant, u64, PlanId)>,
    by_query: HashMap<Key, Vec<PlanId>>,
    in_flight: Option<PlanId>,
}

impl PeerPlans {
    fn unslot(&mut self, slot: Slot) {
        match slot {
            Slot::Ready(k) => {
                self.ready.remove(&k);
            }
            Slot::Delayed(k) => {
                self.delayed.remove(&k);
            }
        }
    }

    fn promote_due(&mut self, now: Instant) {
        while let Some(&first) = self.delayed.first() {
            if first.0 > now {
                break;
            }
            self.delayed.remove(&first);
            let (_, seq, id) = first;
            if let Some(plan) = self.plans.get_mut(&id) {
                let key = (Reverse(plan.priority), seq, id);
                plan.slot = Slot::Ready(key);
                self.ready.insert(key);
            }
        }
    }

    fn remove_plan(&mut self, id: PlanId) -> Option<RequestPlan> {
        let plan = self.plans.remove(&id)?;
        self.unslot(plan.slot);
        if let Some(ids) = self.by_query.get_mut(&plan.query) {
            ids.retain(|p| *p != id);
            if ids.is_empty() {
                self.by_query.remove(&plan.query);
            }
        }
        Some(plan)
    }
}

/// Back-off before the `counter`-th retransmission, before jitter.
pub fn retransmission_delay(counter: u32) -> Duration {
    if counter < 8 {
        Duration::from_secs(counter as u64)
    } else if counter < BACKOFF_CAP_COUNTER {
        Duration::from_secs(8 + (1u64 << (counter - 8)))
    } else {
        Duration::from_secs(8 + (1u64 << (BACKOFF_CAP_COUNTER - 8)))
    }
}

#[derive(Debug, Default)]
pub struct Planner {
    peers: HashMap<Identity, PeerPlans>,
    links: HashMap<RequestId, Vec<(Identity, PlanId)>>,
    next_plan: u64,
    next_seq: u64,
}

impl Planner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of plans over all peers.
    pub fn len(&self) -> usize {
        self.peers.values().map(|p| p.plans.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn plans_for(&self, peer: &Identity) -> usize {
        self.peers.get(peer).map_or(0, |p| p.plans.len())
    }

    /// Plan `request` for transmission to `peer`, merging it into a
    /// compatible plan when one exists.
    pub fn add<R: Rng + ?Sized>(
        &mut self,
        peer: Identity,
        request: PlanRequest,
        ctx: &mut CoreContext,
        now: Instant,
        rng: &mut R,
    ) -> PlanId {
        let pp = self.peers.entry(peer).or_default();
        let candidates = pp.by_query.get(&request.query).cloned().unwrap_or_default();
        for id in candidates {
            let Some(plan) = pp.plans.get_mut(&id) else {
                continue;
            };
            if plan.block_type != request.block_type {
                continue;
            }
            if plan.requests.iter().any(|(r, _)| *r == request.id) {
                return id;
            }
            let newer = plan.latest().map_or(true, |(_, ttl)| request.ttl > ttl);
            plan.requests.push((request.id, request.ttl));
            self.links.entry(request.id).or_default().push((peer, id));
            trace!(peer = %peer, request = %request.id, "merged into existing plan");
            if newer {
                plan.transmission_counter = 0;
                if pp.in_flight != Some(id) {
                    Self::schedule(&mut self.next_seq, pp, id, ctx, now, rng);
                }
            }
            return id;
        }

        let id = PlanId(self.next_plan);
        self.next_plan += 1;
        pp.plans.insert(
            id,
            RequestPlan {
                query: request.query,
                block_type: request.block_type,
                requests: vec![(request.id, request.ttl)],
                priority: 0,
                transmission_counter: 0,
                last_transmission: None,
                earliest_transmission: now,
                slot: Slot::Delayed((now, u64::MAX, id)),
            },
        );
        pp.by_query.entry(request.query).or_default().push(id);
        self.links.entry(request.id).or_default().push((peer, id));
        Self::schedule(&mut self.next_seq, pp, id, ctx, now, rng);
        id
    }

    fn schedule<R: Rng + ?Sized>(
        next_seq: &mut u64,
        pp: &mut PeerPlans,
        id: PlanId,
        ctx: &mut CoreContext,
        now: Instant,
        rng: &mut R,
    ) {
        let Some(plan) = pp.plans.get(&id) else {
            return;
        };
        let old = plan.slot;
        let counter = plan.transmission_counter;

        let max = retransmission_delay(counter).as_micros() as u64;
        let jitter = Duration::from_micros(rng.gen_range(0..=max));
        let delay_us = jitter.as_micros() as f64;
        ctx.planner_avg_delay =
            (ctx.planner_avg_delay * (AVG_DELAY_WEIGHT - 1.0) + delay_us) / AVG_DELAY_WEIGHT + 0.01;
        let priority = ((ctx.typical_priority + 1.0) * (delay_us / ctx.planner_avg_delay).atan()).round()
            / FRAC_PI_4;
        let priority = priority.clamp(0.0, u32::MAX as f64) as u32;
        let delay = if counter == 0 { jitter } else { jitter + RETRANSMISSION_GRACE };

        pp.unslot(old);
        let seq = *next_seq;
        *next_seq += 1;
        let Some(plan) = pp.plans.get_mut(&id) else {
            return;
        };
        plan.priority = priority;
        plan.earliest_transmission = plan.last_transmission.unwrap_or(now) + delay;
        if plan.earliest_transmission <= now {
            let key = (Reverse(priority), seq, id);
            plan.slot = Slot::Ready(key);
            pp.ready.insert(key);
        } else {
            let key = (plan.earliest_transmission, seq, id);
            plan.slot = Slot::Delayed(key);
            pp.delayed.insert(key);
        }
    }

    /// Best ready plan for `peer`, if no planned query is in flight. The
    /// plan stays in place until [`Planner::submitted`] is called.
    pub fn next_ready(&mut self, peer: &Identity, now: Instant) -> Option<Submission> {
        let pp = self.peers.get_mut(peer)?;
        if pp.in_flight.is_some() {
            return None;
        }
        pp.promote_due(now);
        let &(Reverse(priority), _, plan) = pp.ready.first()?;
        let (request, _) = pp.plans.get(&plan)?.latest()?;
        Some(Submission { plan, request, priority })
    }

    /// The GET for `plan` was queued towards `peer`.
    pub fn submitted(&mut self, peer: &Identity, plan: PlanId) {
        let Some(pp) = self.peers.get_mut(peer) else {
            return;
        };
        if let Some(p) = pp.plans.get(&plan) {
            let slot = p.slot;
            pp.unslot(slot);
            pp.in_flight = Some(plan);
        }
    }

    /// The in-flight query to `peer` was handed to the transport.
    pub fn transmitted<R: Rng + ?Sized>(
        &mut self,
        peer: &Identity,
        ctx: &mut CoreContext,
        now: Instant,
        rng: &mut R,
    ) {
        let Some(pp) = self.peers.get_mut(peer) else {
            return;
        };
        let Some(id) = pp.in_flight.take() else {
            return;
        };
        let Some(plan) = pp.plans.get_mut(&id) else {
            return;
        };
        plan.transmission_counter += 1;
        plan.last_transmission = Some(now);
        Self::schedule(&mut self.next_seq, pp, id, ctx, now, rng);
    }

    /// Earliest instant at which a delayed plan becomes ready.
    pub fn next_wakeup(&self) -> Option<Instant> {
        self.peers
            .values()
            .filter(|pp| pp.in_flight.is_none())
            .filter_map(|pp| pp.delayed.first().map(|(at, _, _)| *at))
            .min()
    }

    /// Peers that have a plan ready to submit.
    pub fn peers_with_work(&mut self, now: Instant) -> Vec<Identity> {
        let mut out = Vec::new();
        for (peer, pp) in self.peers.iter_mut() {
            if pp.in_flight.is_some() {
                continue;
            }
            pp.promote_due(now);
            if !pp.ready.is_empty() {
                out.push(*peer);
            }
        }
        out
    }

    pub fn get_last_transmission_to(&self, request: RequestId, peer: &Identity) -> LastTransmission {
        let Some(links) = self.links.get(&request) else {
            return LastTransmission::NoRecord;
        };
        for (p, plan) in links {
            if p != peer {
                continue;
            }
            return match self.peers.get(p).and_then(|pp| pp.plans.get(plan)) {
                Some(RequestPlan { last_transmission: Some(at), .. }) => LastTransmission::At(*at),
                Some(_) => LastTransmission::NeverSent,
                None => LastTransmission::NoRecord,
            };
        }
        LastTransmission::NoRecord
    }

    /// Drop every link of `request`; plans left without requests go too.
    pub fn notify_request_done(&mut self, request: RequestId) {
        let Some(links) = self.links.remove(&request) else {
            return;
        };
        for (peer, id) in links {
            let Some(pp) = self.peers.get_mut(&peer) else {
                continue;
            };
            let Some(plan) = pp.plans.get_mut(&id) else {
                continue;
            };
            plan.requests.retain(|(r, _)| *r != request);
            if plan.requests.is_empty() {
                pp.remove_plan(id);
            }
        }
    }

    /// Forget every plan towards `peer`.
    pub fn notify_peer_disconnect(&mut self, peer: &Identity) {
        let Some(pp) = self.peers.remove(peer) else {
            return;
        };
        for plan in pp.plans.values() {
            for (request, _) in &plan.requests {
                if let Some(links) = self.links.get_mut(request) {
                    links.retain(|(p, _)| p != peer);
                    if links.is_empty() {
                        self.links.remove(request);
                    }
                }
            }
        }
    }
}
