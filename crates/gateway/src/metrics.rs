//! Request and policy counters
//!
//! Plain atomic counters rendered as Prometheus text exposition.
//! Cancellations count separately from errors so race losers never
//! inflate failure rates.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Metrics {
    counters: DashMap<String, AtomicU64>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&self, name: &str) {
        self.counters
            .entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_by(&self, name: &str, delta: u64) {
        self.counters
            .entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self, name: &str) -> u64 {
        self.counters
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Prometheus text exposition, names sorted for stable scrapes.
    pub fn render(&self) -> String {
        let mut lines: Vec<String> = self
            .counters
            .iter()
            .map(|entry| format!("meridian_{} {}", entry.key(), entry.value().load(Ordering::Relaxed)))
            .collect();
        lines.sort();
        let mut out = lines.join("\n");
        out.push('\n');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate_and_render() {
        let metrics = Metrics::new();
        metrics.incr("dispatch_total");
        metrics.incr("dispatch_total");
        metrics.incr_by("dispatch_cancelled", 3);
        assert_eq!(metrics.get("dispatch_total"), 2);

        let text = metrics.render();
        assert!(text.contains("meridian_dispatch_total 2"));
        assert!(text.contains("meridian_dispatch_cancelled 3"));
    }
}
