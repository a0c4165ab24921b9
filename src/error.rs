use crate::{Prefix, RouterId, SimTime};
use thiserror::Error;

/// Frame-level decode failures. The offending packet is dropped and the
/// simulation continues.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    #[error("checksum mismatch")]
    BadChecksum,
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown opcode {0}")]
    UnknownOpCode(u8),
    #[error("truncated or malformed frame")]
    Truncated,
    #[error("frame of {0} bytes exceeds the configured mtu")]
    MtuExceeded(usize),
}

/// Structural problems with the configured or learned topology.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TopologyError {
    #[error("router {0} is not a known neighbor")]
    UnknownNeighbor(RouterId),
    #[error("duplicate link between {0} and {1}")]
    DuplicateLink(RouterId, RouterId),
}

/// Violations of the DUAL correctness invariants. These are implementation
/// bugs, never recoverable conditions: the simulation halts with a diagnostic
/// so tests fail loudly.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DualInvariantViolation {
    #[error("feasible distance for {prefix} rose from {old} to {new} while passive")]
    FdIncreasedInPassive { prefix: Prefix, old: u32, new: u32 },
    #[error("{prefix} entered active with no up neighbors")]
    ActiveWithoutNeighbors { prefix: Prefix },
    #[error("reply from {neighbor} for {prefix} was never outstanding")]
    RepliesUnderflow { prefix: Prefix, neighbor: RouterId },
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("event stamped {event} dispatched at {now}: clock would run backwards")]
    PastDatedEvent { event: SimTime, now: SimTime },
}

/// Errors that halt the simulation (CLI exit code 3).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FatalError {
    #[error(transparent)]
    Dual(#[from] DualInvariantViolation),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

/// Errors surfaced by the configuration layer (CLI exit code 2).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed configuration: {0}")]
    Json(#[from] serde_json::Error),
    #[error("router id 0 is reserved")]
    ZeroRouterId,
    #[error("duplicate router id {0}")]
    DuplicateRouter(RouterId),
    #[error("link references unknown router {0}")]
    UnknownRouter(RouterId),
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error("link loss probability {0} outside [0, 1]")]
    BadLossProbability(f64),
    #[error("link from {0} to itself")]
    SelfLink(RouterId),
}
