//! Per-prefix diffusing update automaton.
//!
//! Each destination prefix owns one `DualState`, Passive while the installed
//! route is trusted and Active while a diffusing computation is collecting
//! replies. The machine never touches router tables itself: every decision
//! comes back as an [`Intent`] the router applies, which keeps the state
//! machine free of back-pointers.

use crate::error::DualInvariantViolation;
use crate::metric::INFINITY;
use crate::topology::TopologyTable;
use crate::{Prefix, RouterId};
use log::debug;
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DualPhase {
    Passive,
    Active,
}

/// Who pushed the prefix into Active: a neighbor's packet (owed a reply at
/// collapse) or a local event such as a link failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOrigin {
    Local,
    Neighbor(RouterId),
}

/// Selector over feasible successors; handed in by the router so the bandit
/// and its generator stay outside the state machine.
pub type Chooser<'a> = &'a mut dyn FnMut(&[(RouterId, u32)]) -> RouterId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    Install {
        prefix: Prefix,
        next_hop: RouterId,
        metric: u32,
    },
    Withdraw {
        prefix: Prefix,
    },
    /// Triggered update to every Up neighbor except `exclude`.
    AdvertiseUpdate {
        prefix: Prefix,
        distance: u32,
        exclude: Option<RouterId>,
    },
    /// Open a diffusing computation: query every Up neighbor.
    SendQuery {
        prefix: Prefix,
        distance: u32,
    },
    SendReply {
        prefix: Prefix,
        distance: u32,
        to: RouterId,
    },
    EnteredActive {
        prefix: Prefix,
    },
    EnteredPassive {
        prefix: Prefix,
    },
}

#[derive(Debug, Clone)]
pub struct DualState {
    prefix: Prefix,
    phase: DualPhase,
    /// Directly connected prefixes are always advertised at distance zero and
    /// never diffuse.
    connected: bool,
    fd: u32,
    metric: u32,
    successor: Option<RouterId>,
    query_origin: QueryOrigin,
    replies_outstanding: BTreeSet<RouterId>,
    /// Bumped on every Active entry and exit so stale Active-timeout events
    /// can be discarded on dispatch.
    generation: u64,
}

impl DualState {
    pub fn new(prefix: Prefix) -> Self {
        Self {
            prefix,
            phase: DualPhase::Passive,
            connected: false,
            fd: INFINITY,
            metric: INFINITY,
            successor: None,
            query_origin: QueryOrigin::Local,
            replies_outstanding: BTreeSet::new(),
            generation: 0,
        }
    }

    pub fn connected(prefix: Prefix) -> Self {
        Self {
            connected: true,
            fd: 0,
            metric: 0,
            ..Self::new(prefix)
        }
    }

    pub fn phase(&self) -> DualPhase {
        self.phase
    }

    pub fn is_active(&self) -> bool {
        self.phase == DualPhase::Active
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn fd(&self) -> u32 {
        self.fd
    }

    pub fn metric(&self) -> u32 {
        self.metric
    }

    pub fn successor(&self) -> Option<RouterId> {
        self.successor
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn outstanding(&self) -> &BTreeSet<RouterId> {
        &self.replies_outstanding
    }

    /// Distance this router currently stands behind. A prefix in diffusion
    /// offers nothing; a connected prefix is free.
    pub fn advertised_distance(&self) -> u32 {
        if self.connected {
            0
        } else if self.phase == DualPhase::Active {
            INFINITY
        } else {
            self.metric
        }
    }

    /// Passive-state recomputation after any topology input: a received
    /// update, a link cost change, or a neighbor loss.
    pub fn reconsider(
        &mut self,
        topology: &TopologyTable,
        up: &BTreeSet<RouterId>,
        trigger: QueryOrigin,
        choose: Chooser,
    ) -> Result<Vec<Intent>, DualInvariantViolation> {
        if self.connected || self.phase == DualPhase::Active {
            return Ok(Vec::new());
        }
        let (feasible, min_cost) = topology.feasible_successors(self.prefix, self.fd, up);
        if !feasible.is_empty() {
            return self.install_feasible(&feasible, min_cost, choose);
        }

        let best = topology.best_computed(self.prefix, up);
        if best != INFINITY {
            // Reachable but nobody passes the Feasibility Condition: diffuse.
            if up.is_empty() {
                return Err(DualInvariantViolation::ActiveWithoutNeighbors {
                    prefix: self.prefix,
                });
            }
            self.phase = DualPhase::Active;
            self.generation += 1;
            self.query_origin = trigger;
            self.replies_outstanding = up.clone();
            debug!(
                "{} active, querying {} neighbors at distance {}",
                self.prefix,
                self.replies_outstanding.len(),
                best
            );
            return Ok(vec![
                Intent::EnteredActive {
                    prefix: self.prefix,
                },
                Intent::SendQuery {
                    prefix: self.prefix,
                    distance: best,
                },
            ]);
        }

        // Nobody advertises the prefix any more.
        if self.successor.is_some() || self.fd != INFINITY {
            self.successor = None;
            self.metric = INFINITY;
            self.fd = INFINITY;
            return Ok(vec![
                Intent::Withdraw {
                    prefix: self.prefix,
                },
                Intent::AdvertiseUpdate {
                    prefix: self.prefix,
                    distance: INFINITY,
                    exclude: None,
                },
            ]);
        }
        Ok(Vec::new())
    }

    fn install_feasible(
        &mut self,
        feasible: &[(RouterId, u32)],
        min_cost: u32,
        choose: Chooser,
    ) -> Result<Vec<Intent>, DualInvariantViolation> {
        // unreachable by construction of the feasible set; checked anyway so
        // a regression halts the simulation instead of looping packets
        let new_fd = self.fd.min(min_cost);
        if new_fd > self.fd {
            return Err(DualInvariantViolation::FdIncreasedInPassive {
                prefix: self.prefix,
                old: self.fd,
                new: new_fd,
            });
        }
        self.fd = new_fd;
        let (chosen, metric) = pick(feasible, min_cost, self.successor, Some(choose));
        if self.successor == Some(chosen) && self.metric == metric {
            return Ok(Vec::new());
        }
        self.successor = Some(chosen);
        self.metric = metric;
        Ok(vec![
            Intent::Install {
                prefix: self.prefix,
                next_hop: chosen,
                metric,
            },
            Intent::AdvertiseUpdate {
                prefix: self.prefix,
                distance: metric,
                exclude: None,
            },
        ])
    }

    /// Like [`reconsider`], but lets the bandit pick among several feasible
    /// successors instead of keeping the incumbent.
    pub fn reselect(
        &mut self,
        topology: &TopologyTable,
        up: &BTreeSet<RouterId>,
        choose: Chooser,
    ) -> Result<Vec<Intent>, DualInvariantViolation> {
        if self.connected || self.phase == DualPhase::Active {
            return Ok(Vec::new());
        }
        let (feasible, min_cost) = topology.feasible_successors(self.prefix, self.fd, up);
        if feasible.len() < 2 {
            return self.reconsider(topology, up, QueryOrigin::Local, choose);
        }
        let new_fd = self.fd.min(min_cost);
        self.fd = new_fd;
        let (chosen, metric) = pick(&feasible, min_cost, None, Some(choose));
        if self.successor == Some(chosen) && self.metric == metric {
            return Ok(Vec::new());
        }
        self.successor = Some(chosen);
        self.metric = metric;
        Ok(vec![
            Intent::Install {
                prefix: self.prefix,
                next_hop: chosen,
                metric,
            },
            Intent::AdvertiseUpdate {
                prefix: self.prefix,
                distance: metric,
                exclude: None,
            },
        ])
    }

    /// A query arrived (its reported distance is already in the topology
    /// table). Passive routers answer from their own state, going Active
    /// first if the query destroyed their last feasible successor; Active
    /// routers answer with infinity without collapsing their own diffusion.
    pub fn on_query(
        &mut self,
        from: RouterId,
        topology: &TopologyTable,
        up: &BTreeSet<RouterId>,
        choose: Chooser,
    ) -> Result<Vec<Intent>, DualInvariantViolation> {
        if self.connected {
            return Ok(vec![Intent::SendReply {
                prefix: self.prefix,
                distance: 0,
                to: from,
            }]);
        }
        match self.phase {
            DualPhase::Active => Ok(vec![Intent::SendReply {
                prefix: self.prefix,
                distance: INFINITY,
                to: from,
            }]),
            DualPhase::Passive => {
                let mut intents =
                    self.reconsider(topology, up, QueryOrigin::Neighbor(from), choose)?;
                if self.phase == DualPhase::Passive {
                    // still passive: answer right away; if the query pushed
                    // us Active the reply is owed at collapse instead
                    intents.push(Intent::SendReply {
                        prefix: self.prefix,
                        distance: self.metric,
                        to: from,
                    });
                }
                Ok(intents)
            }
        }
    }

    /// A reply arrived (topology already updated). Replies from a neighbor
    /// we are not waiting on while Passive are plain topology input.
    pub fn on_reply(
        &mut self,
        from: RouterId,
        topology: &TopologyTable,
        up: &BTreeSet<RouterId>,
        choose: Chooser,
    ) -> Result<Vec<Intent>, DualInvariantViolation> {
        if self.connected {
            return Ok(Vec::new());
        }
        match self.phase {
            DualPhase::Passive => self.reconsider(topology, up, QueryOrigin::Neighbor(from), choose),
            DualPhase::Active => {
                if !self.replies_outstanding.remove(&from) {
                    return Err(DualInvariantViolation::RepliesUnderflow {
                        prefix: self.prefix,
                        neighbor: from,
                    });
                }
                if self.replies_outstanding.is_empty() {
                    self.collapse(topology, up, choose)
                } else {
                    Ok(Vec::new())
                }
            }
        }
    }

    /// A neighbor went down. While Active this is an implicit infinity
    /// reply; while Passive it is plain topology input.
    pub fn on_neighbor_lost(
        &mut self,
        neighbor: RouterId,
        topology: &TopologyTable,
        up: &BTreeSet<RouterId>,
        choose: Chooser,
    ) -> Result<Vec<Intent>, DualInvariantViolation> {
        if self.connected {
            return Ok(Vec::new());
        }
        match self.phase {
            DualPhase::Passive => self.reconsider(topology, up, QueryOrigin::Local, choose),
            DualPhase::Active => {
                self.replies_outstanding.remove(&neighbor);
                if self.replies_outstanding.is_empty() {
                    self.collapse(topology, up, choose)
                } else {
                    Ok(Vec::new())
                }
            }
        }
    }

    /// The Active timeout fired: whoever still owes a reply is treated as
    /// down. The router drops their stale topology entries before calling.
    pub fn on_active_timeout(
        &mut self,
        topology: &TopologyTable,
        up: &BTreeSet<RouterId>,
        choose: Chooser,
    ) -> Result<Vec<Intent>, DualInvariantViolation> {
        if self.phase != DualPhase::Active {
            return Ok(Vec::new());
        }
        self.replies_outstanding.clear();
        self.collapse(topology, up, choose)
    }

    /// All replies are in: pick the best surviving path with the feasibility
    /// baseline relaxed to infinity, reset FD, return to Passive and settle
    /// the debt to the query origin.
    fn collapse(
        &mut self,
        topology: &TopologyTable,
        up: &BTreeSet<RouterId>,
        choose: Chooser,
    ) -> Result<Vec<Intent>, DualInvariantViolation> {
        let (survivors, best) = topology.feasible_successors(self.prefix, INFINITY, up);
        self.phase = DualPhase::Passive;
        self.generation += 1;
        let origin = std::mem::replace(&mut self.query_origin, QueryOrigin::Local);

        let mut intents = vec![Intent::EnteredPassive {
            prefix: self.prefix,
        }];
        if survivors.is_empty() {
            self.successor = None;
            self.metric = INFINITY;
            self.fd = INFINITY;
            intents.push(Intent::Withdraw {
                prefix: self.prefix,
            });
        } else {
            let (chosen, metric) = pick(&survivors, best, None, Some(choose));
            self.successor = Some(chosen);
            self.metric = metric;
            self.fd = metric;
            intents.push(Intent::Install {
                prefix: self.prefix,
                next_hop: chosen,
                metric,
            });
        }
        debug!(
            "{} passive again via {:?} at distance {}",
            self.prefix, self.successor, self.metric
        );

        let exclude = match origin {
            QueryOrigin::Neighbor(neighbor) => {
                intents.push(Intent::SendReply {
                    prefix: self.prefix,
                    distance: self.metric,
                    to: neighbor,
                });
                Some(neighbor)
            }
            QueryOrigin::Local => None,
        };
        intents.push(Intent::AdvertiseUpdate {
            prefix: self.prefix,
            distance: self.metric,
            exclude,
        });
        Ok(intents)
    }
}

/// Successor choice among a non-empty feasible set. The incumbent is kept
/// when it still achieves the minimum; otherwise ties and multi-candidate
/// sets go through the chooser when one is supplied, else to the cheapest
/// (lowest id first, since the set arrives sorted).
fn pick(
    feasible: &[(RouterId, u32)],
    min_cost: u32,
    incumbent: Option<RouterId>,
    choose: Option<Chooser>,
) -> (RouterId, u32) {
    if let Some(id) = incumbent {
        if let Some(&(found, cost)) = feasible.iter().find(|(n, _)| *n == id) {
            if cost == min_cost {
                return (found, cost);
            }
        }
    }
    if feasible.len() > 1 {
        if let Some(choose) = choose {
            let chosen = choose(feasible);
            if let Some(&(found, cost)) = feasible.iter().find(|(n, _)| *n == chosen) {
                return (found, cost);
            }
        }
    }
    feasible
        .iter()
        .copied()
        .find(|(_, cost)| *cost == min_cost)
        .unwrap_or(feasible[0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::INFINITY;

    fn prefix() -> Prefix {
        "192.168.3.0/24".parse().unwrap()
    }

    fn up(ids: &[RouterId]) -> BTreeSet<RouterId> {
        ids.iter().copied().collect()
    }

    fn cheapest(feasible: &[(RouterId, u32)]) -> RouterId {
        feasible
            .iter()
            .min_by_key(|(id, cost)| (*cost, *id))
            .map(|(id, _)| *id)
            .unwrap()
    }

    #[test]
    fn first_advertisement_installs() {
        let mut topology = TopologyTable::default();
        topology.insert(prefix(), 3, 0, 995);
        let mut state = DualState::new(prefix());

        let intents = state
            .reconsider(&topology, &up(&[3]), QueryOrigin::Neighbor(3), &mut cheapest)
            .unwrap();
        assert_eq!(
            intents,
            vec![
                Intent::Install {
                    prefix: prefix(),
                    next_hop: 3,
                    metric: 995
                },
                Intent::AdvertiseUpdate {
                    prefix: prefix(),
                    distance: 995,
                    exclude: None
                },
            ]
        );
        assert_eq!(state.fd(), 995);
        assert_eq!(state.phase(), DualPhase::Passive);
    }

    #[test]
    fn unchanged_state_emits_nothing() {
        let mut topology = TopologyTable::default();
        topology.insert(prefix(), 3, 0, 995);
        let mut state = DualState::new(prefix());
        state
            .reconsider(&topology, &up(&[3]), QueryOrigin::Neighbor(3), &mut cheapest)
            .unwrap();
        let intents = state
            .reconsider(&topology, &up(&[3]), QueryOrigin::Neighbor(3), &mut cheapest)
            .unwrap();
        assert!(intents.is_empty());
    }

    #[test]
    fn worsening_with_feasible_successor_stays_passive_and_keeps_fd() {
        let mut topology = TopologyTable::default();
        topology.insert(prefix(), 3, 0, 995);
        let mut state = DualState::new(prefix());
        state
            .reconsider(&topology, &up(&[3]), QueryOrigin::Neighbor(3), &mut cheapest)
            .unwrap();

        // the link to the successor degrades but its reported distance is
        // still zero, so it stays feasible
        topology.relink(3, 1500);
        let intents = state
            .reconsider(&topology, &up(&[3]), QueryOrigin::Local, &mut cheapest)
            .unwrap();
        assert_eq!(state.phase(), DualPhase::Passive);
        assert_eq!(state.metric(), 1500);
        assert_eq!(state.fd(), 995, "fd must not rise while passive");
        assert!(matches!(intents[0], Intent::Install { metric: 1500, .. }));
    }

    #[test]
    fn losing_all_feasible_successors_goes_active() {
        let mut topology = TopologyTable::default();
        topology.insert(prefix(), 3, 0, 995);
        topology.insert(prefix(), 2, 1990, 995);
        let mut state = DualState::new(prefix());
        state
            .reconsider(&topology, &up(&[2, 3]), QueryOrigin::Neighbor(3), &mut cheapest)
            .unwrap();
        assert_eq!(state.successor(), Some(3));

        // successor withdraws; the survivor's reported distance 1990 fails
        // the feasibility condition against fd 995
        topology.remove(prefix(), 3);
        let intents = state
            .reconsider(&topology, &up(&[2, 3]), QueryOrigin::Local, &mut cheapest)
            .unwrap();
        assert_eq!(state.phase(), DualPhase::Active);
        assert_eq!(state.outstanding(), &up(&[2, 3]));
        assert_eq!(
            intents,
            vec![
                Intent::EnteredActive { prefix: prefix() },
                Intent::SendQuery {
                    prefix: prefix(),
                    distance: 2985
                },
            ]
        );
    }

    #[test]
    fn replies_collapse_to_new_successor() {
        let mut topology = TopologyTable::default();
        topology.insert(prefix(), 3, 0, 995);
        topology.insert(prefix(), 2, 1990, 995);
        let mut state = DualState::new(prefix());
        state
            .reconsider(&topology, &up(&[2, 3]), QueryOrigin::Neighbor(3), &mut cheapest)
            .unwrap();
        topology.remove(prefix(), 3);
        state
            .reconsider(&topology, &up(&[2, 3]), QueryOrigin::Local, &mut cheapest)
            .unwrap();

        // neighbor 3 answers with infinity (nothing inserted), neighbor 2
        // confirms its path
        let intents = state.on_reply(3, &topology, &up(&[2, 3]), &mut cheapest).unwrap();
        assert!(intents.is_empty());
        let intents = state.on_reply(2, &topology, &up(&[2, 3]), &mut cheapest).unwrap();
        assert_eq!(state.phase(), DualPhase::Passive);
        assert_eq!(state.successor(), Some(2));
        assert_eq!(state.fd(), 2985);
        assert_eq!(
            intents,
            vec![
                Intent::EnteredPassive { prefix: prefix() },
                Intent::Install {
                    prefix: prefix(),
                    next_hop: 2,
                    metric: 2985
                },
                Intent::AdvertiseUpdate {
                    prefix: prefix(),
                    distance: 2985,
                    exclude: None
                },
            ]
        );
    }

    #[test]
    fn collapse_answers_the_query_origin() {
        let mut topology = TopologyTable::default();
        topology.insert(prefix(), 2, 1990, 995);
        let mut state = DualState::new(prefix());
        state.fd = 995; // as if a now-withdrawn path had been installed
        state.successor = Some(3);
        state.metric = 995;

        let intents = state
            .on_query(2, &topology, &up(&[2]), &mut cheapest)
            .unwrap();
        assert_eq!(state.phase(), DualPhase::Active);
        assert!(intents.iter().all(|i| !matches!(i, Intent::SendReply { .. })));

        let intents = state.on_reply(2, &topology, &up(&[2]), &mut cheapest).unwrap();
        assert!(intents.contains(&Intent::SendReply {
            prefix: prefix(),
            distance: 2985,
            to: 2
        }));
        assert!(intents.contains(&Intent::AdvertiseUpdate {
            prefix: prefix(),
            distance: 2985,
            exclude: Some(2)
        }));
    }

    #[test]
    fn unreachable_prefix_withdraws() {
        let mut topology = TopologyTable::default();
        topology.insert(prefix(), 3, 0, 995);
        let mut state = DualState::new(prefix());
        state
            .reconsider(&topology, &up(&[3]), QueryOrigin::Neighbor(3), &mut cheapest)
            .unwrap();

        topology.remove_neighbor(3);
        let intents = state
            .on_neighbor_lost(3, &topology, &up(&[]), &mut cheapest)
            .unwrap();
        assert_eq!(state.phase(), DualPhase::Passive);
        assert_eq!(state.fd(), INFINITY);
        assert_eq!(
            intents,
            vec![
                Intent::Withdraw { prefix: prefix() },
                Intent::AdvertiseUpdate {
                    prefix: prefix(),
                    distance: INFINITY,
                    exclude: None
                },
            ]
        );
    }

    #[test]
    fn neighbor_loss_acts_as_implicit_reply() {
        let mut topology = TopologyTable::default();
        topology.insert(prefix(), 3, 0, 995);
        topology.insert(prefix(), 2, 1990, 995);
        let mut state = DualState::new(prefix());
        state
            .reconsider(&topology, &up(&[2, 3]), QueryOrigin::Neighbor(3), &mut cheapest)
            .unwrap();
        topology.remove(prefix(), 3);
        state
            .reconsider(&topology, &up(&[2, 3]), QueryOrigin::Local, &mut cheapest)
            .unwrap();

        state.on_reply(2, &topology, &up(&[2, 3]), &mut cheapest).unwrap();
        assert!(state.is_active());
        topology.remove_neighbor(3);
        let intents = state
            .on_neighbor_lost(3, &topology, &up(&[2]), &mut cheapest)
            .unwrap();
        assert!(!state.is_active());
        assert!(intents.contains(&Intent::Install {
            prefix: prefix(),
            next_hop: 2,
            metric: 2985
        }));
    }

    #[test]
    fn active_answers_queries_with_infinity() {
        let mut topology = TopologyTable::default();
        topology.insert(prefix(), 2, 1990, 995);
        let mut state = DualState::new(prefix());
        state.fd = 995;
        state
            .reconsider(&topology, &up(&[2, 4]), QueryOrigin::Local, &mut cheapest)
            .unwrap();
        assert!(state.is_active());

        let intents = state.on_query(4, &topology, &up(&[2, 4]), &mut cheapest).unwrap();
        assert_eq!(
            intents,
            vec![Intent::SendReply {
                prefix: prefix(),
                distance: INFINITY,
                to: 4
            }]
        );
        assert!(state.is_active(), "foreign queries must not collapse the diffusion");
    }

    #[test]
    fn active_timeout_collapses_on_survivors() {
        let mut topology = TopologyTable::default();
        topology.insert(prefix(), 2, 1990, 995);
        let mut state = DualState::new(prefix());
        state.fd = 995;
        state
            .reconsider(&topology, &up(&[2, 4]), QueryOrigin::Local, &mut cheapest)
            .unwrap();
        assert!(state.is_active());

        let intents = state
            .on_active_timeout(&topology, &up(&[2, 4]), &mut cheapest)
            .unwrap();
        assert!(!state.is_active());
        assert!(intents.contains(&Intent::Install {
            prefix: prefix(),
            next_hop: 2,
            metric: 2985
        }));
    }

    #[test]
    fn connected_prefix_answers_queries_at_zero() {
        let topology = TopologyTable::default();
        let mut state = DualState::connected(prefix());
        let intents = state.on_query(2, &topology, &up(&[2]), &mut cheapest).unwrap();
        assert_eq!(
            intents,
            vec![Intent::SendReply {
                prefix: prefix(),
                distance: 0,
                to: 2
            }]
        );
        assert_eq!(state.advertised_distance(), 0);
    }

    #[test]
    fn unexpected_reply_is_an_invariant_violation() {
        let mut topology = TopologyTable::default();
        topology.insert(prefix(), 2, 1990, 995);
        let mut state = DualState::new(prefix());
        state.fd = 995;
        state
            .reconsider(&topology, &up(&[2]), QueryOrigin::Local, &mut cheapest)
            .unwrap();
        assert!(state.is_active());
        let err = state.on_reply(9, &topology, &up(&[2]), &mut cheapest).unwrap_err();
        assert_eq!(
            err,
            DualInvariantViolation::RepliesUnderflow {
                prefix: prefix(),
                neighbor: 9
            }
        );
    }
}
