//! Epsilon-greedy learner choosing among feasible next-hops.
//!
//! One arm per candidate neighbor, one learner state per prefix. Rewards are
//! negated composite path costs, so the greedy arm is the cheapest observed
//! path; untried arms start at zero and therefore win against any arm that
//! has only produced negative rewards.

use crate::{Prefix, RouterId};
use rand::Rng;
use std::collections::BTreeMap;

pub const DEFAULT_EPSILON: f64 = 0.1;

#[derive(Debug, Clone, Copy, Default)]
struct Arm {
    pulls: u64,
    estimate: f64,
}

#[derive(Debug)]
pub struct TieBreaker {
    epsilon: f64,
    arms: BTreeMap<Prefix, BTreeMap<RouterId, Arm>>,
}

impl Default for TieBreaker {
    fn default() -> Self {
        Self::new(DEFAULT_EPSILON)
    }
}

impl TieBreaker {
    pub fn new(epsilon: f64) -> Self {
        Self {
            epsilon,
            arms: BTreeMap::new(),
        }
    }

    /// Pick a next-hop among `candidates`. Explores uniformly with
    /// probability epsilon, otherwise plays the highest estimate; ties go to
    /// the lowest neighbor id, so pass candidates in ascending order.
    pub fn select<R: Rng + ?Sized>(
        &mut self,
        rng: &mut R,
        prefix: Prefix,
        candidates: &[RouterId],
    ) -> RouterId {
        if candidates.len() <= 1 {
            return candidates[0];
        }
        if rng.gen::<f64>() < self.epsilon {
            return candidates[rng.gen_range(0..candidates.len())];
        }
        let arms = self.arms.entry(prefix).or_default();
        let mut best = candidates[0];
        let mut best_estimate = arms.get(&best).map(|a| a.estimate).unwrap_or(0.0);
        for &candidate in &candidates[1..] {
            let estimate = arms.get(&candidate).map(|a| a.estimate).unwrap_or(0.0);
            if estimate > best_estimate {
                best = candidate;
                best_estimate = estimate;
            }
        }
        best
    }

    /// Feed back an observed reward for a path; incremental mean update.
    pub fn observe(&mut self, prefix: Prefix, neighbor: RouterId, reward: f64) {
        let arm = self
            .arms
            .entry(prefix)
            .or_default()
            .entry(neighbor)
            .or_default();
        arm.pulls += 1;
        arm.estimate += (reward - arm.estimate) / arm.pulls as f64;
    }

    pub fn estimate(&self, prefix: Prefix, neighbor: RouterId) -> Option<f64> {
        self.arms.get(&prefix)?.get(&neighbor).map(|a| a.estimate)
    }

    pub fn pulls(&self, prefix: Prefix, neighbor: RouterId) -> u64 {
        self.arms
            .get(&prefix)
            .and_then(|arms| arms.get(&neighbor))
            .map(|a| a.pulls)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn prefix() -> Prefix {
        "192.168.3.0/24".parse().unwrap()
    }

    #[test]
    fn single_candidate_needs_no_learning() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut bandit = TieBreaker::default();
        assert_eq!(bandit.select(&mut rng, prefix(), &[7]), 7);
    }

    #[test]
    fn greedy_plays_best_estimate() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut bandit = TieBreaker::new(0.0);
        bandit.observe(prefix(), 2, -1990.0);
        bandit.observe(prefix(), 3, -995.0);
        for _ in 0..100 {
            assert_eq!(bandit.select(&mut rng, prefix(), &[2, 3]), 3);
        }
    }

    #[test]
    fn ties_go_to_lowest_id() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut bandit = TieBreaker::new(0.0);
        assert_eq!(bandit.select(&mut rng, prefix(), &[4, 9]), 4);
    }

    #[test]
    fn unknown_arm_beats_negative_history() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut bandit = TieBreaker::new(0.0);
        bandit.observe(prefix(), 2, -100.0);
        assert_eq!(bandit.select(&mut rng, prefix(), &[2, 3]), 3);
    }

    #[test]
    fn estimate_is_incremental_mean() {
        let mut bandit = TieBreaker::default();
        bandit.observe(prefix(), 2, -10.0);
        bandit.observe(prefix(), 2, -20.0);
        bandit.observe(prefix(), 2, -30.0);
        assert_eq!(bandit.pulls(prefix(), 2), 3);
        let estimate = bandit.estimate(prefix(), 2).unwrap();
        assert!((estimate + 20.0).abs() < 1e-9);
    }

    #[test]
    fn exploration_frequency_tracks_epsilon() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut bandit = TieBreaker::new(0.1);
        // make arm 3 clearly best so greedy never plays the others
        bandit.observe(prefix(), 2, -500.0);
        bandit.observe(prefix(), 3, -1.0);
        bandit.observe(prefix(), 4, -500.0);
        let pulls = 10_000;
        let mut non_best = 0;
        for _ in 0..pulls {
            if bandit.select(&mut rng, prefix(), &[2, 3, 4]) != 3 {
                non_best += 1;
            }
        }
        // exploration picks a non-best arm 2 times out of 3; expect about
        // pulls * epsilon * 2/3 = 667
        let expected = pulls as f64 * 0.1 * (2.0 / 3.0);
        assert!(
            (non_best as f64) > expected * 0.7 && (non_best as f64) < expected * 1.3,
            "non-best arm frequency {} outside tolerance of {}",
            non_best,
            expected
        );
    }
}
