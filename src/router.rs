//! Per-router protocol engine.
//!
//! A `Router` owns its neighbor, topology, DUAL and routing tables and turns
//! inbound packets and timer fires into outbound packets, timer re-arms and
//! subscription events. It never talks to the network itself: every handler
//! returns the [`Action`]s the scheduler should carry out, with the current
//! simulated time passed in.

use crate::bandit::TieBreaker;
use crate::config::TimerConfig;
use crate::dual::{Chooser, DualState, Intent, QueryOrigin};
use crate::error::{DualInvariantViolation, TopologyError};
use crate::event::EventKind;
use crate::metric::{compose, LinkMetrics, MetricWeights, INFINITY};
use crate::neighbor::{NeighborEntry, NeighborTable};
use crate::packet::{EntryKind, Hello, Packet, RouteEntry, Update, MAX_ENTRIES_PER_UPDATE};
use crate::topology::TopologyTable;
use crate::{Prefix, RouterId, SimTime};
use log::{debug, info, warn};
use rand::RngCore;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// An installed forwarding entry. `next_hop` is empty for directly connected
/// prefixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RoutingEntry {
    pub prefix: Prefix,
    pub next_hop: Option<RouterId>,
    pub metric: u32,
    pub installed_at: SimTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Hello,
    MabSample,
    Hold { neighbor: RouterId },
    ActiveTimeout { prefix: Prefix },
}

/// One input to a per-prefix DUAL instance.
#[derive(Debug, Clone, Copy)]
enum DualInput {
    Reconsider(QueryOrigin),
    Reselect,
    Query(RouterId),
    Reply(RouterId),
    NeighborLost(RouterId),
    ActiveTimeout,
}

/// What a handler wants the scheduler to do on the router's behalf.
#[derive(Debug, Clone)]
pub enum Action {
    Unicast {
        to: RouterId,
        packet: Packet,
    },
    Arm {
        timer: TimerKind,
        generation: u64,
        delay: SimTime,
    },
    Notify(EventKind),
}

pub struct Router {
    id: RouterId,
    weights: MetricWeights,
    timers: TimerConfig,
    mtu: usize,
    running: bool,
    neighbors: NeighborTable,
    topology: TopologyTable,
    dual: BTreeMap<Prefix, DualState>,
    routes: BTreeMap<Prefix, RoutingEntry>,
    bandit: TieBreaker,
    /// Our side of each adjacency: the metrics our Hellos advertise per peer.
    outbound: BTreeMap<RouterId, LinkMetrics>,
}

impl Router {
    pub fn new(
        id: RouterId,
        connected: &[Prefix],
        weights: MetricWeights,
        timers: TimerConfig,
        mtu: usize,
    ) -> Self {
        let mut dual = BTreeMap::new();
        let mut routes = BTreeMap::new();
        for &prefix in connected {
            dual.insert(prefix, DualState::connected(prefix));
            routes.insert(
                prefix,
                RoutingEntry {
                    prefix,
                    next_hop: None,
                    metric: 0,
                    installed_at: 0,
                },
            );
        }
        Self {
            id,
            weights,
            timers,
            mtu,
            running: false,
            neighbors: NeighborTable::default(),
            topology: TopologyTable::default(),
            dual,
            routes,
            bandit: TieBreaker::default(),
            outbound: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> RouterId {
        self.id
    }

    /// Wire up an adjacency: `metrics` describe our outbound side of the
    /// link and ride in every Hello toward `peer`.
    pub fn register_peer(&mut self, peer: RouterId, metrics: LinkMetrics) {
        self.neighbors.register(peer);
        self.outbound.insert(peer, metrics);
    }

    pub fn start(&mut self, _now: SimTime) -> Vec<Action> {
        self.running = true;
        vec![
            Action::Arm {
                timer: TimerKind::Hello,
                generation: 0,
                delay: 0,
            },
            Action::Arm {
                timer: TimerKind::MabSample,
                generation: 0,
                delay: self.timers.mab_sample(),
            },
        ]
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    pub fn routing_table(&self) -> Vec<RoutingEntry> {
        self.routes.values().copied().collect()
    }

    pub fn route(&self, prefix: Prefix) -> Option<RoutingEntry> {
        self.routes.get(&prefix).copied()
    }

    pub fn neighbor_table(&self) -> Vec<NeighborEntry> {
        self.neighbors.snapshot()
    }

    pub fn active_prefixes(&self) -> Vec<Prefix> {
        self.dual
            .iter()
            .filter(|(_, st)| st.is_active())
            .map(|(prefix, _)| *prefix)
            .collect()
    }

    pub fn bandit(&self) -> &TieBreaker {
        &self.bandit
    }

    pub fn on_timer(
        &mut self,
        timer: TimerKind,
        generation: u64,
        now: SimTime,
        rng: &mut dyn RngCore,
    ) -> Result<Vec<Action>, DualInvariantViolation> {
        if !self.running {
            return Ok(Vec::new());
        }
        match timer {
            TimerKind::Hello => Ok(self.send_hellos()),
            TimerKind::MabSample => self.sample_paths(now, rng),
            TimerKind::Hold { neighbor } => {
                if self.neighbors.hold_generation(neighbor) != Some(generation) {
                    return Ok(Vec::new());
                }
                warn!(
                    "router {}: hold time expired for neighbor {}",
                    self.id, neighbor
                );
                self.lose_neighbor(neighbor, now, rng)
            }
            TimerKind::ActiveTimeout { prefix } => {
                self.active_timeout(prefix, generation, now, rng)
            }
        }
    }

    pub fn on_packet(
        &mut self,
        from: RouterId,
        bytes: &[u8],
        now: SimTime,
        rng: &mut dyn RngCore,
    ) -> Result<Vec<Action>, DualInvariantViolation> {
        if !self.running {
            return Ok(Vec::new());
        }
        let packet = match Packet::decode_with_mtu(bytes, self.mtu) {
            Ok(packet) => packet,
            Err(error) => {
                warn!("router {}: dropping frame from {}: {}", self.id, from, error);
                return Ok(Vec::new());
            }
        };
        match packet {
            Packet::Hello(hello) => self.on_hello(from, hello, now, rng),
            Packet::Update(update) => self.on_update(from, update, now, rng),
        }
    }

    pub fn on_link_down(
        &mut self,
        peer: RouterId,
        now: SimTime,
        rng: &mut dyn RngCore,
    ) -> Result<Vec<Action>, DualInvariantViolation> {
        if !self.running {
            return Ok(Vec::new());
        }
        self.lose_neighbor(peer, now, rng)
    }

    /// The link toward `peer` came up, or its metrics were re-provisioned.
    /// The adjacency itself recovers through the regular Hello exchange.
    pub fn on_link_up(&mut self, peer: RouterId, metrics: LinkMetrics) {
        self.neighbors.register(peer);
        self.outbound.insert(peer, metrics);
    }

    /// Tear a directly connected prefix out of the origin: the route is
    /// dropped and an infinity update propagates the withdrawal.
    pub fn withdraw_connected(&mut self, prefix: Prefix, _now: SimTime) -> Vec<Action> {
        match self.dual.get_mut(&prefix) {
            Some(state) if state.is_connected() => *state = DualState::new(prefix),
            _ => return Vec::new(),
        }
        // every advertised path for an origin prefix leads back here, so any
        // echoed topology entries die with it
        for neighbor in self.neighbors.up_neighbors() {
            self.topology.remove(prefix, neighbor);
        }
        info!("router {}: withdrawing connected prefix {}", self.id, prefix);
        let mut actions = Vec::new();
        if self.routes.remove(&prefix).is_some() {
            actions.push(Action::Notify(EventKind::RouteWithdrawn { prefix }));
        }
        let entry = RouteEntry {
            kind: EntryKind::Update,
            prefix,
            metrics: LinkMetrics::default(),
            reported_distance: INFINITY,
        };
        for peer in self.neighbors.up_neighbors() {
            actions.extend(self.send_update(peer, vec![entry]));
        }
        actions
    }

    fn send_hellos(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        for (&peer, &metrics) in &self.outbound {
            actions.push(Action::Unicast {
                to: peer,
                packet: Packet::Hello(Hello { metrics }),
            });
            actions.push(Action::Notify(EventKind::HelloSent { peer }));
        }
        actions.push(Action::Arm {
            timer: TimerKind::Hello,
            generation: 0,
            delay: self.timers.hello_interval(),
        });
        actions
    }

    /// MAB cadence: feed the observed cost of every installed path back into
    /// the learner, then let it re-pick where several feasible successors
    /// compete.
    fn sample_paths(
        &mut self,
        now: SimTime,
        rng: &mut dyn RngCore,
    ) -> Result<Vec<Action>, DualInvariantViolation> {
        for entry in self.routes.values() {
            if let Some(next_hop) = entry.next_hop {
                if let Some(cost) = self.topology.computed(entry.prefix, next_hop) {
                    if cost != INFINITY {
                        self.bandit.observe(entry.prefix, next_hop, -(cost as f64));
                    }
                }
            }
        }
        let mut actions = Vec::new();
        let prefixes: Vec<Prefix> = self.dual.keys().copied().collect();
        for prefix in prefixes {
            actions.extend(self.drive(prefix, now, rng, DualInput::Reselect)?);
        }
        actions.push(Action::Arm {
            timer: TimerKind::MabSample,
            generation: 0,
            delay: self.timers.mab_sample(),
        });
        Ok(actions)
    }

    fn on_hello(
        &mut self,
        from: RouterId,
        hello: Hello,
        now: SimTime,
        rng: &mut dyn RngCore,
    ) -> Result<Vec<Action>, DualInvariantViolation> {
        let cost = compose(&hello.metrics, &self.weights);
        let (came_up, cost_changed) =
            self.neighbors
                .record_hello(from, now, hello.metrics, cost, self.timers.hold_time());
        let mut actions = vec![Action::Notify(EventKind::HelloRecv {
            from,
            metrics: hello.metrics,
        })];
        if let Some(generation) = self.neighbors.hold_generation(from) {
            actions.push(Action::Arm {
                timer: TimerKind::Hold { neighbor: from },
                generation,
                delay: self.timers.hold_time(),
            });
        }
        if came_up {
            info!("router {}: neighbor {} up", self.id, from);
            actions.push(Action::Notify(EventKind::NeighborUp { neighbor: from }));
            let dump = self.full_dump();
            actions.extend(self.send_update(from, dump));
        }
        if cost_changed {
            debug!(
                "router {}: link cost toward {} is now {}",
                self.id, from, cost
            );
            let affected = self.topology.relink(from, cost);
            for prefix in affected {
                actions.extend(self.drive(
                    prefix,
                    now,
                    rng,
                    DualInput::Reconsider(QueryOrigin::Local),
                )?);
            }
        }
        Ok(actions)
    }

    fn on_update(
        &mut self,
        from: RouterId,
        update: Update,
        now: SimTime,
        rng: &mut dyn RngCore,
    ) -> Result<Vec<Action>, DualInvariantViolation> {
        let mut actions = vec![Action::Notify(EventKind::UpdateRecv {
            from,
            entries: update.entries.len(),
        })];
        let link_cost = match self.neighbors.link_cost(from) {
            Some(cost) => cost,
            None => {
                debug!(
                    "router {}: {}, update dropped",
                    self.id,
                    TopologyError::UnknownNeighbor(from)
                );
                return Ok(actions);
            }
        };
        for entry in update.entries {
            let prefix = entry.prefix;
            // A querying neighbor is mid-diffusion and offers no usable path:
            // its entry is poisoned no matter what distance the query quotes.
            if entry.kind == EntryKind::Query || entry.reported_distance == INFINITY {
                self.topology.remove(prefix, from);
            } else {
                self.topology
                    .insert(prefix, from, entry.reported_distance, link_cost);
            }
            self.dual
                .entry(prefix)
                .or_insert_with(|| DualState::new(prefix));
            let input = match entry.kind {
                EntryKind::Update => DualInput::Reconsider(QueryOrigin::Neighbor(from)),
                EntryKind::Query => DualInput::Query(from),
                EntryKind::Reply => DualInput::Reply(from),
            };
            let handled = self.drive(prefix, now, rng, input)?;
            actions.extend(handled);
        }
        Ok(actions)
    }

    fn lose_neighbor(
        &mut self,
        peer: RouterId,
        now: SimTime,
        rng: &mut dyn RngCore,
    ) -> Result<Vec<Action>, DualInvariantViolation> {
        let was_up = self.neighbors.mark_down(peer);
        let mut actions = Vec::new();
        if was_up {
            info!("router {}: neighbor {} down", self.id, peer);
            actions.push(Action::Notify(EventKind::NeighborDown { neighbor: peer }));
        }
        let mut prefixes: BTreeSet<Prefix> =
            self.topology.remove_neighbor(peer).into_iter().collect();
        // diffusing computations waiting on this neighbor get their implicit
        // infinity reply even when it advertised nothing
        prefixes.extend(
            self.dual
                .iter()
                .filter(|(_, st)| st.is_active() && st.outstanding().contains(&peer))
                .map(|(prefix, _)| *prefix),
        );
        for prefix in prefixes {
            actions.extend(self.drive(prefix, now, rng, DualInput::NeighborLost(peer))?);
        }
        Ok(actions)
    }

    fn active_timeout(
        &mut self,
        prefix: Prefix,
        generation: u64,
        now: SimTime,
        rng: &mut dyn RngCore,
    ) -> Result<Vec<Action>, DualInvariantViolation> {
        let stale = match self.dual.get(&prefix) {
            Some(st) if st.is_active() && st.generation() == generation => st.outstanding().clone(),
            _ => return Ok(Vec::new()),
        };
        warn!(
            "router {}: active timeout for {}, giving up on {} neighbors",
            self.id,
            prefix,
            stale.len()
        );
        for neighbor in stale {
            self.topology.remove(prefix, neighbor);
        }
        self.drive(prefix, now, rng, DualInput::ActiveTimeout)
    }

    /// Run one DUAL input for `prefix` and apply the resulting intents.
    fn drive(
        &mut self,
        prefix: Prefix,
        now: SimTime,
        rng: &mut dyn RngCore,
        input: DualInput,
    ) -> Result<Vec<Action>, DualInvariantViolation> {
        let up = self.neighbors.up_neighbors();
        let intents = {
            let topology = &self.topology;
            let bandit = &mut self.bandit;
            let state = match self.dual.get_mut(&prefix) {
                Some(state) => state,
                None => return Ok(Vec::new()),
            };
            let mut chooser = |candidates: &[(RouterId, u32)]| {
                let ids: Vec<RouterId> = candidates.iter().map(|(id, _)| *id).collect();
                bandit.select(rng, prefix, &ids)
            };
            let choose: Chooser = &mut chooser;
            match input {
                DualInput::Reconsider(trigger) => state.reconsider(topology, &up, trigger, choose)?,
                DualInput::Reselect => state.reselect(topology, &up, choose)?,
                DualInput::Query(from) => state.on_query(from, topology, &up, choose)?,
                DualInput::Reply(from) => state.on_reply(from, topology, &up, choose)?,
                DualInput::NeighborLost(peer) => {
                    state.on_neighbor_lost(peer, topology, &up, choose)?
                }
                DualInput::ActiveTimeout => state.on_active_timeout(topology, &up, choose)?,
            }
        };
        Ok(self.apply_intents(intents, now))
    }

    fn apply_intents(&mut self, intents: Vec<Intent>, now: SimTime) -> Vec<Action> {
        let mut actions = Vec::new();
        for intent in intents {
            match intent {
                Intent::Install {
                    prefix,
                    next_hop,
                    metric,
                } => {
                    let changed = self
                        .routes
                        .get(&prefix)
                        .map(|e| e.next_hop != Some(next_hop) || e.metric != metric)
                        .unwrap_or(true);
                    if changed {
                        info!(
                            "router {}: route {} via {} metric {}",
                            self.id, prefix, next_hop, metric
                        );
                        self.routes.insert(
                            prefix,
                            RoutingEntry {
                                prefix,
                                next_hop: Some(next_hop),
                                metric,
                                installed_at: now,
                            },
                        );
                        actions.push(Action::Notify(EventKind::RouteInstalled {
                            prefix,
                            next_hop,
                            metric,
                        }));
                    }
                }
                Intent::Withdraw { prefix } => {
                    if self.routes.remove(&prefix).is_some() {
                        info!("router {}: route {} withdrawn", self.id, prefix);
                        actions.push(Action::Notify(EventKind::RouteWithdrawn { prefix }));
                    }
                }
                Intent::AdvertiseUpdate {
                    prefix,
                    distance,
                    exclude,
                } => {
                    let entry = self.route_entry(EntryKind::Update, prefix, distance);
                    for peer in self.neighbors.up_neighbors() {
                        if Some(peer) == exclude {
                            continue;
                        }
                        actions.extend(self.send_update(peer, vec![entry]));
                    }
                }
                Intent::SendQuery { prefix, distance } => {
                    let entry = self.route_entry(EntryKind::Query, prefix, distance);
                    for peer in self.neighbors.up_neighbors() {
                        actions.extend(self.send_update(peer, vec![entry]));
                    }
                    if let Some(state) = self.dual.get(&prefix) {
                        actions.push(Action::Arm {
                            timer: TimerKind::ActiveTimeout { prefix },
                            generation: state.generation(),
                            delay: self.timers.active_timeout(),
                        });
                    }
                }
                Intent::SendReply {
                    prefix,
                    distance,
                    to,
                } => {
                    let entry = self.route_entry(EntryKind::Reply, prefix, distance);
                    actions.extend(self.send_update(to, vec![entry]));
                }
                Intent::EnteredActive { prefix } => {
                    actions.push(Action::Notify(EventKind::DualActive { prefix }));
                }
                Intent::EnteredPassive { prefix } => {
                    actions.push(Action::Notify(EventKind::DualPassive { prefix }));
                }
            }
        }
        actions
    }

    /// Everything this router stands behind, for the initial dump toward a
    /// fresh adjacency.
    fn full_dump(&self) -> Vec<RouteEntry> {
        self.dual
            .iter()
            .filter(|(_, st)| st.advertised_distance() != INFINITY)
            .map(|(&prefix, st)| {
                self.route_entry(EntryKind::Update, prefix, st.advertised_distance())
            })
            .collect()
    }

    fn route_entry(&self, kind: EntryKind, prefix: Prefix, distance: u32) -> RouteEntry {
        // the metric snapshot rides along for observers; receivers price the
        // path from the reported distance and their own link cost
        let metrics = self
            .routes
            .get(&prefix)
            .and_then(|r| r.next_hop)
            .and_then(|n| self.neighbors.get(n))
            .map(|n| n.link_metrics)
            .unwrap_or_default();
        RouteEntry {
            kind,
            prefix,
            metrics,
            reported_distance: distance,
        }
    }

    fn send_update(&self, to: RouterId, entries: Vec<RouteEntry>) -> Vec<Action> {
        let mut actions = Vec::new();
        for chunk in entries.chunks(MAX_ENTRIES_PER_UPDATE) {
            actions.push(Action::Unicast {
                to,
                packet: Packet::Update(Update {
                    entries: chunk.to_vec(),
                }),
            });
            actions.push(Action::Notify(EventKind::UpdateSent {
                to,
                entries: chunk.len(),
            }));
        }
        actions
    }
}
