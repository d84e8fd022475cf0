//! Round-trip time and transfer rate estimates.

use tokio::time::Instant;

use crate::config::schema::StatsConfig;

/// Fold `sample` into a running estimate, weighting history 3:1.
pub(crate) fn fold(old: Option<u64>, sample: u64) -> u64 {
    match old {
        Some(old) if old > 0 => (3 * old + sample + 2) / 4,
        _ => sample,
    }
}

/// Timestamps and size of one completed reply.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Sample {
    pub(crate) dispatched: Option<Instant>,
    pub(crate) headers: Option<Instant>,
    pub(crate) finished: Instant,
    pub(crate) size: Option<u64>,
}

impl Sample {
    /// Microseconds from write to reply head.
    pub(crate) fn rtt_us(&self) -> Option<u64> {
        let (t0, t1) = (self.dispatched?, self.headers?);
        let us = t1.saturating_duration_since(t0).as_micros() as u64;
        (us > 0).then_some(us)
    }

    /// Bytes per second over the body, when the sample is large enough.
    pub(crate) fn rate(&self, config: &StatsConfig) -> Option<u64> {
        self.dispatched?;
        let t1 = self.headers?;
        let size = self.size?;
        let elapsed = self.finished.saturating_duration_since(t1);
        let us = elapsed.as_micros() as u64;
        if size < config.rate_sample_min_bytes || us <= config.rate_sample_min_elapsed_ms * 1000 {
            return None;
        }
        let rate = (size as f64 / us as f64 * 1_000_000.0 + 0.5) as u64;
        (rate > 0).then_some(rate)
    }
}
