use crate::metric::LinkMetrics;
use crate::{RouterId, SimTime};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// A neighbor is Up iff a Hello arrived within the hold time; adjacencies
/// start Pending and fall back to Down on hold expiry or link failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NeighborState {
    Pending,
    Up,
    Down,
}

#[derive(Debug, Clone, Serialize)]
pub struct NeighborEntry {
    pub neighbor_id: RouterId,
    pub state: NeighborState,
    pub last_hello: SimTime,
    pub hold_deadline: SimTime,
    pub link_metrics: LinkMetrics,
    pub link_cost: u32,
    #[serde(skip)]
    pub hold_generation: u64,
}

#[derive(Debug, Default)]
pub struct NeighborTable {
    neighbors: BTreeMap<RouterId, NeighborEntry>,
}

impl NeighborTable {
    /// Register an adjacency discovered from the link wiring. It stays
    /// Pending until the first Hello arrives.
    pub fn register(&mut self, neighbor_id: RouterId) {
        self.neighbors.entry(neighbor_id).or_insert(NeighborEntry {
            neighbor_id,
            state: NeighborState::Pending,
            last_hello: 0,
            hold_deadline: 0,
            link_metrics: LinkMetrics::default(),
            link_cost: crate::metric::INFINITY,
            hold_generation: 0,
        });
    }

    /// Record a received Hello. Returns `(came_up, cost_changed)`:
    /// `came_up` when the adjacency transitioned to Up, `cost_changed` when
    /// an already-Up neighbor's link cost moved.
    pub fn record_hello(
        &mut self,
        neighbor_id: RouterId,
        now: SimTime,
        metrics: LinkMetrics,
        link_cost: u32,
        hold_time: SimTime,
    ) -> (bool, bool) {
        let entry = self.neighbors.entry(neighbor_id).or_insert(NeighborEntry {
            neighbor_id,
            state: NeighborState::Pending,
            last_hello: 0,
            hold_deadline: 0,
            link_metrics: LinkMetrics::default(),
            link_cost: crate::metric::INFINITY,
            hold_generation: 0,
        });
        let came_up = entry.state != NeighborState::Up;
        let cost_changed = !came_up && entry.link_cost != link_cost;
        entry.state = NeighborState::Up;
        entry.last_hello = now;
        entry.hold_deadline = now + hold_time;
        entry.link_metrics = metrics;
        entry.link_cost = link_cost;
        entry.hold_generation += 1;
        (came_up, cost_changed)
    }

    /// Mark a neighbor Down (hold expiry or link failure). Returns whether it
    /// was Up.
    pub fn mark_down(&mut self, neighbor_id: RouterId) -> bool {
        match self.neighbors.get_mut(&neighbor_id) {
            Some(entry) => {
                let was_up = entry.state == NeighborState::Up;
                entry.state = NeighborState::Down;
                entry.link_cost = crate::metric::INFINITY;
                entry.hold_generation += 1;
                was_up
            }
            None => false,
        }
    }

    pub fn is_up(&self, neighbor_id: RouterId) -> bool {
        self.neighbors
            .get(&neighbor_id)
            .map(|n| n.state == NeighborState::Up)
            .unwrap_or(false)
    }

    pub fn link_cost(&self, neighbor_id: RouterId) -> Option<u32> {
        self.neighbors
            .get(&neighbor_id)
            .filter(|n| n.state == NeighborState::Up)
            .map(|n| n.link_cost)
    }

    pub fn hold_generation(&self, neighbor_id: RouterId) -> Option<u64> {
        self.neighbors.get(&neighbor_id).map(|n| n.hold_generation)
    }

    pub fn up_neighbors(&self) -> BTreeSet<RouterId> {
        self.neighbors
            .values()
            .filter(|n| n.state == NeighborState::Up)
            .map(|n| n.neighbor_id)
            .collect()
    }

    pub fn get(&self, neighbor_id: RouterId) -> Option<&NeighborEntry> {
        self.neighbors.get(&neighbor_id)
    }

    pub fn snapshot(&self) -> Vec<NeighborEntry> {
        self.neighbors.values().cloned().collect()
    }
}
