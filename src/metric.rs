use serde::{Deserialize, Serialize};

/// Composite distances are 32-bit; the all-ones encoding is reserved to mean
/// unreachable. Finite arithmetic saturates just below it.
pub const INFINITY: u32 = u32::MAX;

/// Raw per-link measurements carried in Hello frames and route entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkMetrics {
    pub delay_us: u16,
    pub jitter_us: u16,
    pub loss_permille: u8,
    pub congestion_pct: u8,
    pub stability: u16,
}

impl LinkMetrics {
    pub fn new(
        delay_us: u16,
        jitter_us: u16,
        loss_permille: u8,
        congestion_pct: u8,
        stability: u16,
    ) -> Self {
        Self {
            delay_us,
            jitter_us,
            loss_permille,
            congestion_pct,
            stability,
        }
    }
}

/// Weighting of the individual measurements in the composite cost.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricWeights {
    pub delay: f64,
    pub jitter: f64,
    pub loss: f64,
    pub congestion: f64,
    pub stability: f64,
}

impl Default for MetricWeights {
    fn default() -> Self {
        Self {
            delay: 1.0,
            jitter: 0.5,
            loss: 10.0,
            congestion: 1.0,
            stability: 0.1,
        }
    }
}

/// Scalar composite cost of a link. Stability is a credit, so the weighted
/// sum is clamped at zero; finite results stay below [`INFINITY`].
pub fn compose(metrics: &LinkMetrics, weights: &MetricWeights) -> u32 {
    let raw = weights.delay * f64::from(metrics.delay_us)
        + weights.jitter * f64::from(metrics.jitter_us)
        + weights.loss * f64::from(metrics.loss_permille)
        + weights.congestion * f64::from(metrics.congestion_pct)
        - weights.stability * f64::from(metrics.stability);
    if raw <= 0.0 {
        0
    } else if raw >= f64::from(INFINITY - 1) {
        INFINITY - 1
    } else {
        raw.round() as u32
    }
}

/// Distance addition: infinity absorbs, finite sums saturate below it.
pub fn add(a: u32, b: u32) -> u32 {
    if a == INFINITY || b == INFINITY {
        INFINITY
    } else {
        a.saturating_add(b).min(INFINITY - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compose_with_default_weights() {
        let m = LinkMetrics::new(1000, 10, 0, 0, 100);
        // 1000 + 5 + 0 + 0 - 10
        assert_eq!(compose(&m, &MetricWeights::default()), 995);
    }

    #[test]
    fn compose_clamps_at_zero() {
        let m = LinkMetrics::new(1, 0, 0, 0, 65535);
        assert_eq!(compose(&m, &MetricWeights::default()), 0);
    }

    #[test]
    fn loss_dominates_under_default_weights() {
        let clean = LinkMetrics::new(1000, 10, 0, 0, 100);
        let lossy = LinkMetrics::new(1000, 10, 50, 0, 100);
        let w = MetricWeights::default();
        assert_eq!(compose(&lossy, &w), compose(&clean, &w) + 500);
    }

    #[test]
    fn add_saturates_below_infinity() {
        assert_eq!(add(INFINITY - 2, INFINITY - 2), INFINITY - 1);
        assert_eq!(add(3, 4), 7);
    }

    #[test]
    fn add_absorbs_infinity() {
        assert_eq!(add(INFINITY, 0), INFINITY);
        assert_eq!(add(42, INFINITY), INFINITY);
    }
}
