//! Discrete-event simulation of the routed network.
//!
//! A single `Simulation` owns the authoritative clock, the event queue, the
//! links and every router. Events are ordered by `(time, sequence)` where the
//! sequence is a monotonic tiebreaker, so frames on one link stay FIFO and
//! same-instant timers fire in scheduling order. All randomness (bandit
//! exploration, link loss) flows from one seeded generator, making runs
//! reproducible.

use crate::config::SimulationConfig;
use crate::error::{ConfigError, FatalError, SchedulerError, TopologyError};
use crate::event::ProtocolEvent;
use crate::metric::LinkMetrics;
use crate::router::{Action, Router, TimerKind};
use crate::{Prefix, RouterId, SimTime};
use log::{debug, error, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::sync::mpsc;

pub type LinkId = usize;

#[derive(Debug, Clone)]
pub struct Link {
    pub a: RouterId,
    pub b: RouterId,
    pub metrics: LinkMetrics,
    pub prop_delay: SimTime,
    pub loss: f64,
    pub up: bool,
    /// Bumped on every down transition; frames in flight from an older epoch
    /// are dropped on delivery.
    epoch: u64,
}

#[derive(Debug, Clone)]
enum EventPayload {
    Deliver {
        link: LinkId,
        epoch: u64,
        from: RouterId,
        to: RouterId,
        frame: Vec<u8>,
    },
    TimerFire {
        router: RouterId,
        timer: TimerKind,
        generation: u64,
    },
    LinkDown {
        link: LinkId,
    },
    LinkUp {
        link: LinkId,
        metrics: LinkMetrics,
    },
}

#[derive(Debug)]
struct Scheduled {
    time: SimTime,
    seq: u64,
    payload: EventPayload,
}

impl Eq for Scheduled {}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.seq == other.seq
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for a min-heap
        (other.time, other.seq).cmp(&(self.time, self.seq))
    }
}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub struct Simulation {
    now: SimTime,
    seq: u64,
    queue: BinaryHeap<Scheduled>,
    routers: BTreeMap<RouterId, Router>,
    links: Vec<Link>,
    by_pair: HashMap<(RouterId, RouterId), LinkId>,
    rng: StdRng,
    subscribers: Vec<mpsc::Sender<ProtocolEvent>>,
    started: bool,
    stopped: bool,
}

impl Simulation {
    pub fn configure(config: &SimulationConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut routers = BTreeMap::new();
        for spec in &config.routers {
            routers.insert(
                spec.id,
                Router::new(spec.id, &spec.prefixes, config.weights, config.timers, config.mtu),
            );
        }
        let mut links = Vec::new();
        let mut by_pair = HashMap::new();
        for spec in &config.links {
            let id = links.len();
            links.push(Link {
                a: spec.a,
                b: spec.b,
                metrics: spec.metrics,
                prop_delay: spec.prop_delay_us,
                loss: spec.loss,
                up: true,
                epoch: 0,
            });
            by_pair.insert(pair(spec.a, spec.b), id);
            for (this, peer) in [(spec.a, spec.b), (spec.b, spec.a)] {
                if let Some(router) = routers.get_mut(&this) {
                    router.register_peer(peer, spec.metrics);
                }
            }
        }
        info!(
            "configured {} routers, {} links, seed {}",
            routers.len(),
            links.len(),
            config.seed
        );
        Ok(Self {
            now: 0,
            seq: 0,
            queue: BinaryHeap::new(),
            routers,
            links,
            by_pair,
            rng: StdRng::seed_from_u64(config.seed),
            subscribers: Vec::new(),
            started: false,
            stopped: false,
        })
    }

    pub fn now(&self) -> SimTime {
        self.now
    }

    pub fn router(&self, id: RouterId) -> Option<&Router> {
        self.routers.get(&id)
    }

    pub fn routers(&self) -> impl Iterator<Item = &Router> {
        self.routers.values()
    }

    /// Subscribe to the protocol event stream. Events are sent as they are
    /// produced and drained by the subscriber between events.
    pub fn subscribe(&mut self) -> mpsc::Receiver<ProtocolEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.push(tx);
        rx
    }

    /// Run until the queue drains or the clock passes `until`.
    pub fn run_until(&mut self, until: SimTime) -> Result<(), FatalError> {
        if !self.started {
            self.started = true;
            let ids: Vec<RouterId> = self.routers.keys().copied().collect();
            for id in ids {
                let actions = match self.routers.get_mut(&id) {
                    Some(router) => router.start(self.now),
                    None => continue,
                };
                self.apply_actions(id, actions);
            }
        }
        while !self.stopped {
            match self.queue.peek() {
                Some(head) if head.time <= until => {}
                _ => break,
            }
            let event = match self.queue.pop() {
                Some(event) => event,
                None => break,
            };
            self.dispatch(event)?;
        }
        if until > self.now {
            self.now = until;
        }
        Ok(())
    }

    /// Drain the event queue without executing further handlers.
    pub fn stop(&mut self) {
        self.stopped = true;
        self.queue.clear();
        for router in self.routers.values_mut() {
            router.stop();
        }
        info!("simulation stopped at {}", self.now);
    }

    pub fn inject_link_down(&mut self, a: RouterId, b: RouterId) -> Result<(), TopologyError> {
        self.schedule_link_down(self.now, a, b)
    }

    pub fn schedule_link_down(
        &mut self,
        at: SimTime,
        a: RouterId,
        b: RouterId,
    ) -> Result<(), TopologyError> {
        let link = self.lookup_link(a, b)?;
        self.schedule(at, EventPayload::LinkDown { link });
        Ok(())
    }

    pub fn inject_link_up(
        &mut self,
        a: RouterId,
        b: RouterId,
        metrics: LinkMetrics,
    ) -> Result<(), TopologyError> {
        self.schedule_link_up(self.now, a, b, metrics)
    }

    pub fn schedule_link_up(
        &mut self,
        at: SimTime,
        a: RouterId,
        b: RouterId,
        metrics: LinkMetrics,
    ) -> Result<(), TopologyError> {
        let link = self.lookup_link(a, b)?;
        self.schedule(at, EventPayload::LinkUp { link, metrics });
        Ok(())
    }

    /// Make `router` withdraw one of its directly connected prefixes.
    pub fn inject_withdraw(&mut self, router: RouterId, prefix: Prefix) {
        let actions = match self.routers.get_mut(&router) {
            Some(r) => r.withdraw_connected(prefix, self.now),
            None => return,
        };
        self.apply_actions(router, actions);
    }

    /// Walk `next_hop` pointers for `prefix` from every router; true when no
    /// walk revisits a router.
    pub fn is_loop_free(&self, prefix: Prefix) -> bool {
        for start in self.routers.keys() {
            let mut visited = vec![*start];
            let mut current = *start;
            loop {
                let next = self
                    .routers
                    .get(&current)
                    .and_then(|r| r.route(prefix))
                    .and_then(|entry| entry.next_hop);
                match next {
                    // reached the origin or a dead end
                    None => break,
                    Some(hop) => {
                        if visited.contains(&hop) {
                            return false;
                        }
                        visited.push(hop);
                        current = hop;
                    }
                }
            }
        }
        true
    }

    fn lookup_link(&self, a: RouterId, b: RouterId) -> Result<LinkId, TopologyError> {
        self.by_pair
            .get(&pair(a, b))
            .copied()
            .ok_or(TopologyError::UnknownNeighbor(b))
    }

    fn schedule(&mut self, at: SimTime, payload: EventPayload) {
        let time = at.max(self.now);
        self.queue.push(Scheduled {
            time,
            seq: self.seq,
            payload,
        });
        self.seq += 1;
    }

    fn dispatch(&mut self, event: Scheduled) -> Result<(), FatalError> {
        if event.time < self.now {
            return Err(SchedulerError::PastDatedEvent {
                event: event.time,
                now: self.now,
            }
            .into());
        }
        self.now = event.time;
        match event.payload {
            EventPayload::Deliver {
                link,
                epoch,
                from,
                to,
                frame,
            } => {
                let alive = self
                    .links
                    .get(link)
                    .map(|l| l.up && l.epoch == epoch)
                    .unwrap_or(false);
                if !alive {
                    debug!("frame {} -> {} dropped with its link", from, to);
                    return Ok(());
                }
                let result = {
                    let rng = &mut self.rng;
                    match self.routers.get_mut(&to) {
                        Some(router) => router.on_packet(from, &frame, event.time, rng),
                        None => return Ok(()),
                    }
                };
                let actions = self.handle_fatal(to, result)?;
                self.apply_actions(to, actions);
            }
            EventPayload::TimerFire {
                router,
                timer,
                generation,
            } => {
                let result = {
                    let rng = &mut self.rng;
                    match self.routers.get_mut(&router) {
                        Some(r) => r.on_timer(timer, generation, event.time, rng),
                        None => return Ok(()),
                    }
                };
                let actions = self.handle_fatal(router, result)?;
                self.apply_actions(router, actions);
            }
            EventPayload::LinkDown { link } => {
                let (a, b) = match self.links.get_mut(link) {
                    Some(l) if l.up => {
                        l.up = false;
                        l.epoch += 1;
                        (l.a, l.b)
                    }
                    _ => return Ok(()),
                };
                info!("link {} <-> {} down at {}", a, b, self.now);
                for (this, peer) in [(a, b), (b, a)] {
                    let result = {
                        let rng = &mut self.rng;
                        match self.routers.get_mut(&this) {
                            Some(router) => router.on_link_down(peer, event.time, rng),
                            None => continue,
                        }
                    };
                    let actions = self.handle_fatal(this, result)?;
                    self.apply_actions(this, actions);
                }
            }
            EventPayload::LinkUp { link, metrics } => {
                let (a, b) = match self.links.get_mut(link) {
                    Some(l) => {
                        l.up = true;
                        l.metrics = metrics;
                        (l.a, l.b)
                    }
                    None => return Ok(()),
                };
                info!("link {} <-> {} up at {}", a, b, self.now);
                for (this, peer) in [(a, b), (b, a)] {
                    if let Some(router) = self.routers.get_mut(&this) {
                        router.on_link_up(peer, metrics);
                    }
                }
            }
        }
        Ok(())
    }

    fn handle_fatal<T>(
        &self,
        router: RouterId,
        result: Result<T, crate::error::DualInvariantViolation>,
    ) -> Result<T, FatalError> {
        result.map_err(|violation| {
            error!("router {}: invariant violated: {}", router, violation);
            if let Some(r) = self.routers.get(&router) {
                if let Ok(snapshot) = serde_json::to_string(&r.routing_table()) {
                    error!("router {} routing table at failure: {}", router, snapshot);
                }
            }
            FatalError::Dual(violation)
        })
    }

    fn apply_actions(&mut self, from: RouterId, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Unicast { to, packet } => {
                    let link_id = match self.by_pair.get(&pair(from, to)) {
                        Some(id) => *id,
                        None => {
                            warn!("router {} has no link toward {}", from, to);
                            continue;
                        }
                    };
                    let (up, loss, delay, epoch) = {
                        let link = &self.links[link_id];
                        (link.up, link.loss, link.prop_delay, link.epoch)
                    };
                    if !up {
                        debug!("frame {} -> {} dropped, link down", from, to);
                        continue;
                    }
                    if loss > 0.0 && self.rng.gen::<f64>() < loss {
                        debug!("frame {} -> {} lost", from, to);
                        continue;
                    }
                    let frame = packet.encode();
                    let at = self.now + delay;
                    self.schedule(
                        at,
                        EventPayload::Deliver {
                            link: link_id,
                            epoch,
                            from,
                            to,
                            frame,
                        },
                    );
                }
                Action::Arm {
                    timer,
                    generation,
                    delay,
                } => {
                    let at = self.now + delay;
                    self.schedule(
                        at,
                        EventPayload::TimerFire {
                            router: from,
                            timer,
                            generation,
                        },
                    );
                }
                Action::Notify(kind) => {
                    let event = ProtocolEvent {
                        time: self.now,
                        router: from,
                        kind,
                    };
                    self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
                }
            }
        }
    }
}

fn pair(a: RouterId, b: RouterId) -> (RouterId, RouterId) {
    (a.min(b), a.max(b))
}
