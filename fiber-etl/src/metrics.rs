// fiber-etl: Per-batch counters

use std::time::Instant;

use serde::Serialize;

/// Batch summary written to the status hash and the batch-complete log line.
#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub duration_ms: u64,
    pub rows_processed: u64,
    pub rows_failed: u64,
    pub duplicate_count: u64,
    pub active_probes: usize,
    pub error_rate: f64,
}

/// Counters for the batch in flight. Reset at batch start.
#[derive(Debug)]
pub struct BatchMetrics {
    started: Instant,
    rows_processed: u64,
    rows_failed: u64,
    duplicate_count: u64,
    active_probes: usize,
}

impl BatchMetrics {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            rows_processed: 0,
            rows_failed: 0,
            duplicate_count: 0,
            active_probes: 0,
        }
    }

    pub fn start_batch(&mut self) {
        self.started = Instant::now();
        self.rows_processed = 0;
        self.rows_failed = 0;
        self.duplicate_count = 0;
        self.active_probes = 0;
    }

    pub fn record_row(&mut self, success: bool) {
        if success {
            self.rows_processed += 1;
        } else {
            self.rows_failed += 1;
        }
    }

    pub fn record_rows(&mut self, count: u64) {
        self.rows_processed += count;
    }

    pub fn record_duplicate(&mut self) {
        self.duplicate_count += 1;
    }

    pub fn set_active_probes(&mut self, count: usize) {
        self.active_probes = count;
    }

    pub fn summary(&self) -> BatchSummary {
        let total = self.rows_processed + self.rows_failed;
        let error_rate = if total == 0 {
            0.0
        } else {
            (self.rows_failed as f64 / total as f64 * 10_000.0).round() / 10_000.0
        };
        BatchSummary {
            duration_ms: self.started.elapsed().as_millis() as u64,
            rows_processed: self.rows_processed,
            rows_failed: self.rows_failed,
            duplicate_count: self.duplicate_count,
            active_probes: self.active_probes,
            error_rate,
        }
    }
}

impl Default for BatchMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_rate_rounds_to_four_decimals() {
        let mut m = BatchMetrics::new();
        for _ in 0..2 {
            m.record_row(true);
        }
        m.record_row(false);
        let s = m.summary();
        assert_eq!(s.rows_processed, 2);
        assert_eq!(s.rows_failed, 1);
        assert_eq!(s.error_rate, 0.3333);
    }

    #[test]
    fn test_empty_batch_has_zero_error_rate() {
        let m = BatchMetrics::new();
        assert_eq!(m.summary().error_rate, 0.0);
    }

    #[test]
    fn test_start_batch_resets() {
        let mut m = BatchMetrics::new();
        m.record_row(true);
        m.record_duplicate();
        m.start_batch();
        let s = m.summary();
        assert_eq!(s.rows_processed, 0);
        assert_eq!(s.duplicate_count, 0);
    }
}
