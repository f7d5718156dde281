// fiber-store: Window-aware aggregate table selection

use serde::Deserialize;

/// Grouping dimension for aggregate queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dimension {
    Node,
    Region,
}

impl Dimension {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::Node => "node",
            Dimension::Region => "region",
        }
    }
}

/// Query sources, raw metrics plus the continuous aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateTable {
    Metrics,
    Agg1m,
    Agg5mNode,
    Agg5mRegion,
    AggHourly,
    AggDaily,
}

impl AggregateTable {
    pub fn name(&self) -> &'static str {
        match self {
            AggregateTable::Metrics => "metrics",
            AggregateTable::Agg1m => "aggregates_1m",
            AggregateTable::Agg5mNode => "aggregates_5m_node",
            AggregateTable::Agg5mRegion => "aggregates_5m_region",
            AggregateTable::AggHourly => "aggregates_hourly",
            AggregateTable::AggDaily => "aggregates_daily",
        }
    }

    pub fn is_aggregate(&self) -> bool {
        !matches!(self, AggregateTable::Metrics)
    }

    /// Time-bucket column name; the 5m-region and daily views predate the
    /// `bucket` naming convention.
    pub fn bucket_col(&self) -> &'static str {
        match self {
            AggregateTable::Metrics | AggregateTable::Agg5mRegion | AggregateTable::AggDaily => {
                "time"
            }
            _ => "bucket",
        }
    }

    pub fn avg_latency_col(&self) -> &'static str {
        match self {
            AggregateTable::AggDaily => "avg_latency_ms",
            _ => "avg_latency",
        }
    }

    pub fn min_latency_col(&self) -> &'static str {
        match self {
            AggregateTable::AggDaily => "min_latency_ms",
            // The region view stores only bucket averages.
            AggregateTable::Agg5mRegion => "avg_latency",
            _ => "min_latency",
        }
    }

    pub fn max_latency_col(&self) -> &'static str {
        match self {
            AggregateTable::AggDaily => "max_latency_ms",
            AggregateTable::Agg5mRegion => "avg_latency",
            _ => "max_latency",
        }
    }

    pub fn avg_loss_col(&self) -> &'static str {
        match self {
            AggregateTable::AggDaily => "avg_packet_loss",
            _ => "avg_loss",
        }
    }

    pub fn avg_uptime_col(&self) -> &'static str {
        match self {
            AggregateTable::AggDaily => "avg_uptime_pct",
            _ => "avg_uptime",
        }
    }

    pub fn samples_col(&self) -> &'static str {
        match self {
            AggregateTable::AggDaily => "sample_count",
            _ => "samples",
        }
    }

    /// Freshness gate per view: beyond this lag the view is stale and the
    /// query falls back to raw metrics.
    pub fn max_lag_sec(&self) -> i64 {
        match self {
            AggregateTable::Metrics => i64::MAX,
            AggregateTable::Agg1m => 120,
            AggregateTable::Agg5mNode | AggregateTable::Agg5mRegion => 600,
            AggregateTable::AggHourly => 7200,
            AggregateTable::AggDaily => 86400,
        }
    }
}

/// Pick a source table for a query window.
///
/// Returns the table and whether the freshness gate applies.
pub fn select_table(
    window_seconds: i64,
    dimension: Dimension,
    prefer_freshness: bool,
) -> (AggregateTable, bool) {
    if prefer_freshness && window_seconds < 600 {
        return (AggregateTable::Metrics, false);
    }
    if window_seconds < 120 {
        (AggregateTable::Metrics, false)
    } else if window_seconds < 900 {
        (AggregateTable::Agg1m, true)
    } else if window_seconds < 7200 {
        match dimension {
            Dimension::Node => (AggregateTable::Agg5mNode, true),
            Dimension::Region => (AggregateTable::Agg5mRegion, true),
        }
    } else if window_seconds < 172_800 {
        (AggregateTable::AggHourly, true)
    } else {
        (AggregateTable::AggDaily, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_realtime_window_uses_raw() {
        let (t, gate) = select_table(60, Dimension::Node, false);
        assert_eq!(t, AggregateTable::Metrics);
        assert!(!gate);
    }

    #[test]
    fn test_prefer_freshness_forces_raw_under_10m() {
        let (t, _) = select_table(599, Dimension::Node, true);
        assert_eq!(t, AggregateTable::Metrics);
        // Beyond 10 minutes the preference no longer applies.
        let (t, _) = select_table(601, Dimension::Node, true);
        assert_eq!(t, AggregateTable::Agg1m);
    }

    #[test]
    fn test_window_ladder() {
        assert_eq!(select_table(600, Dimension::Node, false).0, AggregateTable::Agg1m);
        assert_eq!(
            select_table(3600, Dimension::Node, false).0,
            AggregateTable::Agg5mNode
        );
        assert_eq!(
            select_table(3600, Dimension::Region, false).0,
            AggregateTable::Agg5mRegion
        );
        assert_eq!(
            select_table(86_400, Dimension::Node, false).0,
            AggregateTable::AggHourly
        );
        assert_eq!(
            select_table(172_800, Dimension::Node, false).0,
            AggregateTable::AggDaily
        );
    }

    #[test]
    fn test_aggregates_require_health_gate() {
        let (_, gate) = select_table(86_400, Dimension::Node, false);
        assert!(gate);
    }
}
