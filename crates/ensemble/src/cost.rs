//! Per-branch cost tracking
//!
//! Completed branches report precise usage. Cancelled branches only
//! ever saw a prefix of their stream, so the tracker produces an
//! "overcount" estimate: an upper bound on what the branch would have
//! cost, derived from the chunks observed before the cancel landed.

use meridian_core::{MicroUsd, PricingEntry, Usage};
use parking_lot::Mutex;

/// Tokens assumed per observed chunk when the provider never reported
/// usage. Deliberately generous: the estimate must overcount.
const TOKENS_PER_CHUNK_UPPER: u64 = 16;

#[derive(Debug, Default)]
struct Observed {
    chunks: u64,
    content_chars: u64,
    reported_usage: Option<Usage>,
}

#[derive(Debug, Default)]
pub struct BranchCostTracker {
    observed: Mutex<Observed>,
}

impl BranchCostTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_chunk(&self, content_chars: usize) {
        let mut observed = self.observed.lock();
        observed.chunks += 1;
        observed.content_chars += content_chars as u64;
    }

    pub fn record_usage(&self, usage: &Usage) {
        self.observed.lock().reported_usage = Some(usage.clone());
    }

    /// Precise cost when the provider reported usage.
    pub fn precise_cost(&self, pricing: &PricingEntry) -> Option<MicroUsd> {
        let observed = self.observed.lock();
        observed
            .reported_usage
            .as_ref()
            .and_then(|usage| pricing.cost(usage).ok())
    }

    /// Upper-bound cost for a branch cancelled mid-stream: whichever is
    /// larger of the chars-derived and chunk-derived token estimates.
    pub fn overcount_estimate(&self, pricing: &PricingEntry) -> MicroUsd {
        let observed = self.observed.lock();
        if let Some(usage) = &observed.reported_usage {
            return pricing.cost(usage).unwrap_or(MicroUsd::ZERO);
        }
        let by_chars = observed.content_chars / 4;
        let by_chunks = observed.chunks * TOKENS_PER_CHUNK_UPPER;
        let usage = Usage::new(0, by_chars.max(by_chunks));
        pricing.cost(&usage).unwrap_or(MicroUsd::ZERO)
    }
}
