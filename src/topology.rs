use crate::metric::{add, INFINITY};
use crate::{Prefix, RouterId};
use std::collections::{BTreeMap, BTreeSet};

/// What one neighbor told us about one prefix, plus what it costs to reach
/// that neighbor. Withdrawn prefixes and dead links are removed outright, so
/// stored distances are always finite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathEntry {
    pub reported_distance: u32,
    pub link_cost: u32,
}

impl PathEntry {
    pub fn computed(&self) -> u32 {
        add(self.reported_distance, self.link_cost)
    }
}

/// Per-destination set of candidate paths, one per advertising neighbor.
#[derive(Debug, Default)]
pub struct TopologyTable {
    paths: BTreeMap<Prefix, BTreeMap<RouterId, PathEntry>>,
}

impl TopologyTable {
    /// Insert or replace the entry for `(prefix, neighbor)`.
    pub fn insert(
        &mut self,
        prefix: Prefix,
        neighbor: RouterId,
        reported_distance: u32,
        link_cost: u32,
    ) {
        self.paths.entry(prefix).or_default().insert(
            neighbor,
            PathEntry {
                reported_distance,
                link_cost,
            },
        );
    }

    pub fn remove(&mut self, prefix: Prefix, neighbor: RouterId) -> bool {
        match self.paths.get_mut(&prefix) {
            Some(entries) => {
                let removed = entries.remove(&neighbor).is_some();
                if entries.is_empty() {
                    self.paths.remove(&prefix);
                }
                removed
            }
            None => false,
        }
    }

    /// Drop every path through `neighbor`, returning the prefixes that lost
    /// an entry.
    pub fn remove_neighbor(&mut self, neighbor: RouterId) -> Vec<Prefix> {
        let mut affected = Vec::new();
        self.paths.retain(|prefix, entries| {
            if entries.remove(&neighbor).is_some() {
                affected.push(*prefix);
            }
            !entries.is_empty()
        });
        affected
    }

    /// Re-price every path through `neighbor` after its link cost moved,
    /// returning the prefixes affected.
    pub fn relink(&mut self, neighbor: RouterId, link_cost: u32) -> Vec<Prefix> {
        let mut affected = Vec::new();
        for (prefix, entries) in &mut self.paths {
            if let Some(entry) = entries.get_mut(&neighbor) {
                if entry.link_cost != link_cost {
                    entry.link_cost = link_cost;
                    affected.push(*prefix);
                }
            }
        }
        affected
    }

    pub fn reported(&self, prefix: Prefix, neighbor: RouterId) -> Option<u32> {
        self.paths
            .get(&prefix)?
            .get(&neighbor)
            .map(|e| e.reported_distance)
    }

    pub fn computed(&self, prefix: Prefix, neighbor: RouterId) -> Option<u32> {
        self.paths
            .get(&prefix)?
            .get(&neighbor)
            .map(PathEntry::computed)
    }

    /// Feasible successors for `prefix` under the Feasibility Condition
    /// (reported distance strictly below `fd`), restricted to `up` neighbors.
    /// Returns them with their computed distances, ascending by neighbor id,
    /// along with the best computed distance among them.
    pub fn feasible_successors(
        &self,
        prefix: Prefix,
        fd: u32,
        up: &BTreeSet<RouterId>,
    ) -> (Vec<(RouterId, u32)>, u32) {
        let mut feasible = Vec::new();
        let mut best = INFINITY;
        if let Some(entries) = self.paths.get(&prefix) {
            for (&neighbor, entry) in entries {
                if !up.contains(&neighbor) || entry.reported_distance >= fd {
                    continue;
                }
                let computed = entry.computed();
                best = best.min(computed);
                feasible.push((neighbor, computed));
            }
        }
        (feasible, best)
    }

    /// Minimum computed distance over `up` neighbors regardless of
    /// feasibility; infinity when nobody advertises the prefix.
    pub fn best_computed(&self, prefix: Prefix, up: &BTreeSet<RouterId>) -> u32 {
        self.paths
            .get(&prefix)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|(neighbor, _)| up.contains(neighbor))
                    .map(|(_, entry)| entry.computed())
                    .min()
                    .unwrap_or(INFINITY)
            })
            .unwrap_or(INFINITY)
    }

    pub fn prefixes(&self) -> Vec<Prefix> {
        self.paths.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prefix() -> Prefix {
        "192.168.3.0/24".parse().unwrap()
    }

    fn up(ids: &[RouterId]) -> BTreeSet<RouterId> {
        ids.iter().copied().collect()
    }

    #[test]
    fn insert_replaces_duplicates() {
        let mut table = TopologyTable::default();
        table.insert(prefix(), 2, 100, 50);
        table.insert(prefix(), 2, 200, 50);
        assert_eq!(table.reported(prefix(), 2), Some(200));
        assert_eq!(table.computed(prefix(), 2), Some(250));
    }

    #[test]
    fn feasibility_is_strict() {
        let mut table = TopologyTable::default();
        table.insert(prefix(), 2, 100, 10);
        table.insert(prefix(), 3, 99, 10);
        let (feasible, best) = table.feasible_successors(prefix(), 100, &up(&[2, 3]));
        assert_eq!(feasible, vec![(3, 109)]);
        assert_eq!(best, 109);
    }

    #[test]
    fn down_neighbors_are_ignored() {
        let mut table = TopologyTable::default();
        table.insert(prefix(), 2, 0, 10);
        let (feasible, best) = table.feasible_successors(prefix(), INFINITY, &up(&[]));
        assert!(feasible.is_empty());
        assert_eq!(best, INFINITY);
        assert_eq!(table.best_computed(prefix(), &up(&[])), INFINITY);
    }

    #[test]
    fn equal_minimum_candidates_are_all_returned() {
        let mut table = TopologyTable::default();
        table.insert(prefix(), 2, 0, 995);
        table.insert(prefix(), 3, 0, 995);
        let (feasible, best) = table.feasible_successors(prefix(), INFINITY, &up(&[2, 3]));
        assert_eq!(feasible, vec![(2, 995), (3, 995)]);
        assert_eq!(best, 995);
    }

    #[test]
    fn remove_neighbor_reports_affected_prefixes() {
        let mut table = TopologyTable::default();
        let other: Prefix = "10.0.7.0/24".parse().unwrap();
        table.insert(prefix(), 2, 0, 10);
        table.insert(other, 2, 0, 10);
        table.insert(other, 3, 5, 10);
        let affected = table.remove_neighbor(2);
        assert_eq!(affected, vec![other, prefix()]);
        assert_eq!(table.reported(prefix(), 2), None);
        assert_eq!(table.reported(other, 3), Some(5));
    }

    #[test]
    fn relink_reprices_paths() {
        let mut table = TopologyTable::default();
        table.insert(prefix(), 2, 100, 10);
        assert_eq!(table.relink(2, 20), vec![prefix()]);
        assert_eq!(table.relink(2, 20), Vec::<Prefix>::new());
        assert_eq!(table.computed(prefix(), 2), Some(120));
    }
}
