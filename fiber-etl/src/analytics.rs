// fiber-etl: Analytics engine
// Sliding latency window per node (kept in the kv-store so worker replicas
// share state) with z-score anomaly mapping.

use fiber_core::NormalizedMetric;
use fiber_store::Kv;
use serde::Serialize;

use crate::EtlResult;

/// Samples kept per node.
const WINDOW_SIZE: usize = 20;
/// Minimum samples before stdev is meaningful.
const COMPUTE_MIN_SAMPLES: usize = 5;
/// Loss above this percentage counts as a spike.
const LOSS_SPIKE_THRESHOLD: f64 = 1.0;

/// Derived analytics for one metric point.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ComputedMetric {
    pub latency_avg_window: Option<f64>,
    pub latency_std_window: Option<f64>,
    pub packet_loss_spike: bool,
    pub anomaly_score: f64,
}

/// Stateful analytics over the shared kv-store.
pub struct AnalyticsEngine {
    kv: Kv,
    window_size: usize,
}

impl AnalyticsEngine {
    pub fn new(kv: Kv) -> Self {
        Self {
            kv,
            window_size: WINDOW_SIZE,
        }
    }

    /// Update the node's window and compute window stats plus the anomaly
    /// score for this point.
    pub async fn compute(&self, metric: &NormalizedMetric) -> EtlResult<ComputedMetric> {
        let samples = self
            .kv
            .latency_window_push(&metric.node_id, metric.latency_ms, self.window_size)
            .await?;

        let mut computed = ComputedMetric {
            packet_loss_spike: metric.packet_loss > LOSS_SPIKE_THRESHOLD,
            ..Default::default()
        };

        if samples.len() >= COMPUTE_MIN_SAMPLES {
            let mean = mean(&samples);
            let stdev = sample_stdev(&samples, mean);
            computed.latency_avg_window = Some((mean * 100.0).round() / 100.0);
            computed.latency_std_window = Some((stdev * 100.0).round() / 100.0);

            if stdev > 0.001 {
                let z = (metric.latency_ms - mean).abs() / stdev;
                computed.anomaly_score = normalize_z_score(z);
            } else {
                // Zero variance: any real deviation is itself the anomaly.
                computed.anomaly_score = if (metric.latency_ms - mean).abs() > 1.0 {
                    1.0
                } else {
                    0.0
                };
            }
        }

        Ok(computed)
    }
}

fn mean(samples: &[f64]) -> f64 {
    samples.iter().sum::<f64>() / samples.len() as f64
}

fn sample_stdev(samples: &[f64], mean: f64) -> f64 {
    if samples.len() < 2 {
        return 0.0;
    }
    let variance = samples
        .iter()
        .map(|x| (x - mean).powi(2))
        .sum::<f64>()
        / (samples.len() - 1) as f64;
    variance.sqrt()
}

/// Map |z| to [0, 1]: below 1.5 sigma is noise, above 3.0 is critical,
/// linear ramp in between.
fn normalize_z_score(z: f64) -> f64 {
    if z < 1.5 {
        0.0
    } else if z >= 3.0 {
        1.0
    } else {
        ((z - 1.5) / 1.5 * 10_000.0).round() / 10_000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_z_score_ramp() {
        assert_eq!(normalize_z_score(0.0), 0.0);
        assert_eq!(normalize_z_score(1.49), 0.0);
        assert_eq!(normalize_z_score(3.0), 1.0);
        assert_eq!(normalize_z_score(5.0), 1.0);
        let mid = normalize_z_score(2.25);
        assert!((mid - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_mean_and_sample_stdev() {
        let samples = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        let m = mean(&samples);
        assert!((m - 5.0).abs() < 1e-9);
        let sd = sample_stdev(&samples, m);
        // Sample (n-1) stdev of this classic set is ~2.138.
        assert!((sd - 2.138).abs() < 0.01);
    }

    #[test]
    fn test_stdev_of_single_sample_is_zero() {
        assert_eq!(sample_stdev(&[42.0], 42.0), 0.0);
    }
}
