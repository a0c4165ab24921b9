use crate::error::{ConfigError, TopologyError};
use crate::metric::{LinkMetrics, MetricWeights};
use crate::{Prefix, RouterId, SimTime, MICROS_PER_MILLI, MICROS_PER_SEC};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::net::Ipv4Addr;

/// Protocol timer intervals in whole seconds of simulated time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimerConfig {
    pub hello_interval_s: u64,
    pub hold_time_s: u64,
    pub active_timeout_s: u64,
    pub mab_sample_s: u64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            hello_interval_s: 5,
            hold_time_s: 15,
            active_timeout_s: 16,
            mab_sample_s: 2,
        }
    }
}

impl TimerConfig {
    pub fn hello_interval(&self) -> SimTime {
        self.hello_interval_s * MICROS_PER_SEC
    }

    pub fn hold_time(&self) -> SimTime {
        self.hold_time_s * MICROS_PER_SEC
    }

    pub fn active_timeout(&self) -> SimTime {
        self.active_timeout_s * MICROS_PER_SEC
    }

    pub fn mab_sample(&self) -> SimTime {
        self.mab_sample_s * MICROS_PER_SEC
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterSpec {
    pub id: RouterId,
    /// Directly connected prefixes the router originates.
    #[serde(default)]
    pub prefixes: Vec<Prefix>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkSpec {
    pub a: RouterId,
    pub b: RouterId,
    pub metrics: LinkMetrics,
    #[serde(default = "default_prop_delay")]
    pub prop_delay_us: SimTime,
    /// Probability that a frame on this link is dropped.
    #[serde(default)]
    pub loss: f64,
}

fn default_prop_delay() -> SimTime {
    10 * MICROS_PER_MILLI
}

fn default_seed() -> u64 {
    42
}

fn default_mtu() -> usize {
    crate::packet::DEFAULT_MTU
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub routers: Vec<RouterSpec>,
    pub links: Vec<LinkSpec>,
    #[serde(default)]
    pub weights: MetricWeights,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub timers: TimerConfig,
    #[serde(default = "default_mtu")]
    pub mtu: usize,
}

impl SimulationConfig {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config: SimulationConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &str) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut ids = BTreeSet::new();
        for router in &self.routers {
            if router.id == 0 {
                return Err(ConfigError::ZeroRouterId);
            }
            if !ids.insert(router.id) {
                return Err(ConfigError::DuplicateRouter(router.id));
            }
        }
        let mut pairs = BTreeSet::new();
        for link in &self.links {
            if link.a == link.b {
                return Err(ConfigError::SelfLink(link.a));
            }
            for end in [link.a, link.b] {
                if !ids.contains(&end) {
                    return Err(ConfigError::UnknownRouter(end));
                }
            }
            let pair = (link.a.min(link.b), link.a.max(link.b));
            if !pairs.insert(pair) {
                return Err(TopologyError::DuplicateLink(pair.0, pair.1).into());
            }
            if !(0.0..=1.0).contains(&link.loss) {
                return Err(ConfigError::BadLossProbability(link.loss));
            }
        }
        Ok(())
    }

    /// Uniform metrics used by the built-in topologies.
    pub fn default_link_metrics() -> LinkMetrics {
        LinkMetrics::new(1000, 10, 0, 0, 100)
    }

    /// R1 - R2 - ... - Rn.
    pub fn line(n: u32) -> Self {
        let links = (1..n)
            .map(|i| Self::uniform_link(i, i + 1))
            .collect();
        Self::with_topology(n, links)
    }

    /// Line topology closed into a cycle.
    pub fn ring(n: u32) -> Self {
        let mut links: Vec<LinkSpec> = (1..n).map(|i| Self::uniform_link(i, i + 1)).collect();
        if n > 2 {
            links.push(Self::uniform_link(n, 1));
        }
        Self::with_topology(n, links)
    }

    /// R1 as the hub, every other router a spoke.
    pub fn star(n: u32) -> Self {
        let links = (2..=n).map(|i| Self::uniform_link(1, i)).collect();
        Self::with_topology(n, links)
    }

    /// Every pair of routers directly connected.
    pub fn mesh(n: u32) -> Self {
        let mut links = Vec::new();
        for a in 1..=n {
            for b in (a + 1)..=n {
                links.push(Self::uniform_link(a, b));
            }
        }
        Self::with_topology(n, links)
    }

    fn uniform_link(a: RouterId, b: RouterId) -> LinkSpec {
        LinkSpec {
            a,
            b,
            metrics: Self::default_link_metrics(),
            prop_delay_us: default_prop_delay(),
            loss: 0.0,
        }
    }

    fn with_topology(n: u32, links: Vec<LinkSpec>) -> Self {
        let routers = (1..=n)
            .map(|id| RouterSpec {
                id,
                // each router originates 10.0.<id>.0/24
                prefixes: vec![Prefix::new(Ipv4Addr::new(10, 0, id as u8, 0), 24).unwrap()],
            })
            .collect();
        Self {
            routers,
            links,
            weights: MetricWeights::default(),
            seed: default_seed(),
            timers: TimerConfig::default(),
            mtu: default_mtu(),
        }
    }
}
