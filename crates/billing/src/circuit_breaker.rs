use dashmap::DashMap;
use serde::Serialize;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Clone, Debug)]
struct Circuit {
    state: CircuitState,
    failures: u32,
    window_start: Instant,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl Circuit {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            window_start: Instant::now(),
            opened_at: None,
            probe_in_flight: false,
        }
    }
}

/// Status of one downstream's circuit
#[derive(Debug, Serialize)]
pub struct CircuitStatus {
    pub downstream: String,
    pub is_open: bool,
    pub state: String,
    pub failures: u32,
}

/// Circuit breaker for failure-prone downstreams (settlement client,
/// provider pools), keyed by downstream name.
pub struct CircuitBreaker {
    circuits: DashMap<String, Circuit>,
    /// Failures within the window before opening
    failure_threshold: u32,
    /// Sliding window for failure counting
    window: Duration,
    /// How long the circuit stays open before probing
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self {
            circuits: DashMap::new(),
            failure_threshold: 3,
            window: Duration::from_secs(30),
            cooldown: Duration::from_secs(300), // 5 minutes
        }
    }

    /// Set custom thresholds (mostly for testing)
    pub fn with_thresholds(mut self, failures: u32, window: Duration, cooldown: Duration) -> Self {
        self.failure_threshold = failures;
        self.window = window;
        self.cooldown = cooldown;
        self
    }

    /// Current state, applying the OPEN → HALF_OPEN timer on read.
    pub fn state(&self, downstream: &str) -> CircuitState {
        let mut circuit = self
            .circuits
            .entry(downstream.to_string())
            .or_insert_with(Circuit::new);
        if circuit.state == CircuitState::Open {
            if let Some(opened_at) = circuit.opened_at {
                if opened_at.elapsed() >= self.cooldown {
                    circuit.state = CircuitState::HalfOpen;
                    circuit.probe_in_flight = false;
                    tracing::info!(downstream = %downstream, "Circuit HALF-OPEN, probe permitted");
                }
            }
        }
        circuit.state
    }

    /// May a request go out right now?
    ///
    /// HALF_OPEN admits exactly one probe; callers racing for the slot
    /// after the first get false until the probe reports back.
    pub fn allow_request(&self, downstream: &str) -> bool {
        let state = self.state(downstream);
        let mut circuit = self
            .circuits
            .entry(downstream.to_string())
            .or_insert_with(Circuit::new);
        match state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if circuit.probe_in_flight {
                    false
                } else {
                    circuit.probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// Count a failure into the sliding window.
    pub fn record_failure(&self, downstream: &str) {
        let mut circuit = self
            .circuits
            .entry(downstream.to_string())
            .or_insert_with(Circuit::new);

        match circuit.state {
            CircuitState::HalfOpen => {
                // Probe failed, back to open.
                circuit.state = CircuitState::Open;
                circuit.opened_at = Some(Instant::now());
                circuit.failures = self.failure_threshold;
                circuit.probe_in_flight = false;
                tracing::warn!(downstream = %downstream, "Probe failed, circuit re-OPENED");
            }
            CircuitState::Open => {
                circuit.opened_at = Some(Instant::now());
            }
            CircuitState::Closed => {
                if circuit.window_start.elapsed() > self.window {
                    circuit.failures = 0;
                    circuit.window_start = Instant::now();
                }
                circuit.failures += 1;
                if circuit.failures >= self.failure_threshold {
                    circuit.state = CircuitState::Open;
                    circuit.opened_at = Some(Instant::now());
                    tracing::warn!(downstream = %downstream, failures = circuit.failures, "Circuit OPENED");
                }
            }
        }
    }

    /// Probe or regular call succeeded; close and reset.
    pub fn record_success(&self, downstream: &str) {
        if let Some(mut circuit) = self.circuits.get_mut(downstream) {
            if circuit.state != CircuitState::Closed {
                tracing::info!(downstream = %downstream, "Circuit CLOSED");
            }
            circuit.state = CircuitState::Closed;
            circuit.failures = 0;
            circuit.window_start = Instant::now();
            circuit.opened_at = None;
            circuit.probe_in_flight = false;
        }
    }

    /// Backstop: too many entries stuck pending reconciliation forces
    /// the circuit open regardless of the failure window.
    pub fn is_pending_reconciliation_exceeded(
        &self,
        downstream: &str,
        pending: usize,
        max_pending: usize,
    ) -> bool {
        if pending <= max_pending {
            return false;
        }
        let mut circuit = self
            .circuits
            .entry(downstream.to_string())
            .or_insert_with(Circuit::new);
        if circuit.state == CircuitState::Closed {
            circuit.state = CircuitState::Open;
            circuit.opened_at = Some(Instant::now());
            tracing::warn!(
                downstream = %downstream,
                pending = pending,
                max = max_pending,
                "Pending reconciliation backlog opened the circuit"
            );
        }
        true
    }

    pub fn status(&self) -> Vec<CircuitStatus> {
        self.circuits
            .iter()
            .map(|kv| {
                let (downstream, circuit) = kv.pair();
                CircuitStatus {
                    downstream: downstream.clone(),
                    is_open: circuit.state != CircuitState::Closed,
                    state: format!("{:?}", circuit.state),
                    failures: circuit.failures,
                }
            })
            .collect()
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks the health of the ledger write path for the router's
/// pre-dispatch gate.
pub struct LedgerWriteMonitor {
    failing_since: parking_lot::Mutex<Option<Instant>>,
}

impl LedgerWriteMonitor {
    pub fn new() -> Self {
        Self {
            failing_since: parking_lot::Mutex::new(None),
        }
    }

    pub fn record_write_ok(&self) {
        *self.failing_since.lock() = None;
    }

    pub fn record_write_failure(&self) {
        let mut failing = self.failing_since.lock();
        if failing.is_none() {
            *failing = Some(Instant::now());
        }
    }

    /// True when ledger writes have been failing continuously for
    /// longer than the caller's tolerance window. Fail-closed: new
    /// dispatches must be refused while this holds.
    pub fn is_budget_circuit_open(&self, max_unknown_window: Duration) -> bool {
        self.failing_since
            .lock()
            .map(|since| since.elapsed() > max_unknown_window)
            .unwrap_or(false)
    }
}

impl Default for LedgerWriteMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_breaker() -> CircuitBreaker {
        CircuitBreaker::new().with_thresholds(
            3,
            Duration::from_secs(30),
            Duration::from_millis(50),
        )
    }

    #[test]
    fn test_opens_after_threshold() {
        let breaker = fast_breaker();
        assert!(breaker.allow_request("settlement"));
        breaker.record_failure("settlement");
        breaker.record_failure("settlement");
        assert_eq!(breaker.state("settlement"), CircuitState::Closed);
        breaker.record_failure("settlement");
        assert_eq!(breaker.state("settlement"), CircuitState::Open);
        assert!(!breaker.allow_request("settlement"));
    }

    #[test]
    fn test_half_open_admits_exactly_one_probe() {
        let breaker = fast_breaker();
        for _ in 0..3 {
            breaker.record_failure("settlement");
        }
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(breaker.state("settlement"), CircuitState::HalfOpen);
        assert!(breaker.allow_request("settlement"));
        assert!(!breaker.allow_request("settlement"));
        assert!(!breaker.allow_request("settlement"));
    }

    #[test]
    fn test_probe_success_closes() {
        let breaker = fast_breaker();
        for _ in 0..3 {
            breaker.record_failure("settlement");
        }
        std::thread::sleep(Duration::from_millis(60));
        assert!(breaker.allow_request("settlement"));
        breaker.record_success("settlement");
        assert_eq!(breaker.state("settlement"), CircuitState::Closed);
        assert!(breaker.allow_request("settlement"));
    }

    #[test]
    fn test_probe_failure_reopens() {
        let breaker = fast_breaker();
        for _ in 0..3 {
            breaker.record_failure("settlement");
        }
        std::thread::sleep(Duration::from_millis(60));
        assert!(breaker.allow_request("settlement"));
        breaker.record_failure("settlement");
        assert_eq!(breaker.state("settlement"), CircuitState::Open);
        assert!(!breaker.allow_request("settlement"));
    }

    #[test]
    fn test_pending_reconciliation_guard() {
        let breaker = fast_breaker();
        assert!(!breaker.is_pending_reconciliation_exceeded("settlement", 5, 10));
        assert!(breaker.is_pending_reconciliation_exceeded("settlement", 11, 10));
        assert_eq!(breaker.state("settlement"), CircuitState::Open);
    }

    #[test]
    fn test_ledger_write_monitor_window() {
        let monitor = LedgerWriteMonitor::new();
        assert!(!monitor.is_budget_circuit_open(Duration::from_millis(10)));
        monitor.record_write_failure();
        assert!(!monitor.is_budget_circuit_open(Duration::from_millis(50)));
        std::thread::sleep(Duration::from_millis(60));
        assert!(monitor.is_budget_circuit_open(Duration::from_millis(50)));
        monitor.record_write_ok();
        assert!(!monitor.is_budget_circuit_open(Duration::from_millis(50)));
    }
}
