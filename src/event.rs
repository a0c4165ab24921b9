use crate::metric::LinkMetrics;
use crate::{Prefix, RouterId, SimTime};
use serde::Serialize;

/// One record of the append-only stream handed to subscribers. Everything is
/// serializable so visualization front-ends can consume it as JSON lines.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProtocolEvent {
    pub time: SimTime,
    pub router: RouterId,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    HelloSent {
        peer: RouterId,
    },
    HelloRecv {
        from: RouterId,
        metrics: LinkMetrics,
    },
    UpdateSent {
        to: RouterId,
        entries: usize,
    },
    UpdateRecv {
        from: RouterId,
        entries: usize,
    },
    NeighborUp {
        neighbor: RouterId,
    },
    NeighborDown {
        neighbor: RouterId,
    },
    RouteInstalled {
        prefix: Prefix,
        next_hop: RouterId,
        metric: u32,
    },
    RouteWithdrawn {
        prefix: Prefix,
    },
    DualActive {
        prefix: Prefix,
    },
    DualPassive {
        prefix: Prefix,
    },
}
