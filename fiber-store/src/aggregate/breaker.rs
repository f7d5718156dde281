// fiber-store: Per-table circuit breakers for the aggregate layer

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Breaker states. HALF-OPEN admits exactly one test query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half-open",
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failure_count: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Circuit breaker guarding one aggregate table.
#[derive(Debug)]
pub struct TableBreaker {
    inner: Mutex<BreakerInner>,
    failure_threshold: u32,
    reset_timeout: Duration,
}

impl TableBreaker {
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failure_count: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
            failure_threshold,
            reset_timeout,
        }
    }

    /// Whether a query may proceed. An open breaker past its reset timeout
    /// moves to half-open and admits a single probe.
    pub fn allow(&self) -> bool {
        let Ok(mut inner) = self.inner.lock() else {
            return true;
        };
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.reset_timeout {
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    false
                } else {
                    inner.probe_in_flight = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.state = BreakerState::Closed;
            inner.failure_count = 0;
            inner.opened_at = None;
            inner.probe_in_flight = false;
        }
    }

    pub fn record_failure(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.failure_count += 1;
            inner.probe_in_flight = false;
            if inner.state == BreakerState::HalfOpen
                || inner.failure_count >= self.failure_threshold
            {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
            }
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner
            .lock()
            .map(|i| i.state)
            .unwrap_or(BreakerState::Closed)
    }
}

/// One breaker per aggregate table, created on first use.
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<TableBreaker>>,
    failure_threshold: u32,
    reset_timeout: Duration,
}

impl BreakerRegistry {
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            breakers: DashMap::new(),
            failure_threshold,
            reset_timeout,
        }
    }

    pub fn get(&self, table: &str) -> Arc<TableBreaker> {
        self.breakers
            .entry(table.to_string())
            .or_insert_with(|| {
                Arc::new(TableBreaker::new(self.failure_threshold, self.reset_timeout))
            })
            .clone()
    }

    pub fn open_count(&self) -> usize {
        self.breakers
            .iter()
            .filter(|e| e.value().state() == BreakerState::Open)
            .count()
    }

    pub fn states(&self) -> Vec<(String, BreakerState)> {
        self.breakers
            .iter()
            .map(|e| (e.key().clone(), e.value().state()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opens_after_threshold() {
        let b = TableBreaker::new(5, Duration::from_secs(60));
        for _ in 0..4 {
            b.record_failure();
        }
        assert_eq!(b.state(), BreakerState::Closed);
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert!(!b.allow());
    }

    #[test]
    fn test_half_open_admits_single_probe() {
        let b = TableBreaker::new(1, Duration::ZERO);
        b.record_failure();
        // Timeout elapsed immediately (zero reset): first allow is the probe.
        assert!(b.allow());
        assert_eq!(b.state(), BreakerState::HalfOpen);
        // Second caller is held back while the probe is in flight.
        assert!(!b.allow());
    }

    #[test]
    fn test_probe_success_closes() {
        let b = TableBreaker::new(1, Duration::ZERO);
        b.record_failure();
        assert!(b.allow());
        b.record_success();
        assert_eq!(b.state(), BreakerState::Closed);
        assert!(b.allow());
    }

    #[test]
    fn test_probe_failure_reopens() {
        let b = TableBreaker::new(1, Duration::ZERO);
        b.record_failure();
        assert!(b.allow());
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
    }

    #[test]
    fn test_registry_counts_open_breakers() {
        let reg = BreakerRegistry::new(1, Duration::from_secs(60));
        reg.get("aggregates_1m").record_failure();
        reg.get("aggregates_hourly").record_failure();
        reg.get("aggregates_daily").record_success();
        assert_eq!(reg.open_count(), 2);
    }
}
