// fiber-probe: Probe agent entrypoint
// Producer (collect -> buffer), consumer (buffer -> failover push),
// self-monitor, and federation heartbeat, all under one shutdown signal.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fiber_core::secrets::get_secret;
use fiber_probe::{
    buffer::BufferConfig, collector, heartbeat, monitor::SystemMonitor, DurableBuffer,
    FailoverConfig, FailoverController, FederationClient, ProbeConfig, StatsTracker,
};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if std::env::var("ENV").as_deref() == Ok("dev") {
        builder.init();
    } else {
        builder.json().init();
    }
}

#[tokio::main]
async fn main() {
    init_tracing();

    let secret = match get_secret("FEDERATION_SECRET", None, true) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "missing required secret");
            std::process::exit(1);
        }
    };

    let config = match ProbeConfig::load() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "failed to load configuration");
            std::process::exit(1);
        }
    };
    tracing::info!(node_id = %config.node_id, "starting fiber-probe");

    let buffer = match DurableBuffer::open(&BufferConfig {
        path: config.buffer_path.clone(),
        max_bytes: config.buffer_max_bytes,
        evict_fraction: 0.10,
    })
    .await
    {
        Ok(b) => Arc::new(b),
        Err(e) => {
            tracing::error!(error = %e, "failed to open durable buffer");
            std::process::exit(1);
        }
    };

    let stats = Arc::new(StatsTracker::new());
    let clients: Vec<Arc<FederationClient>> = config
        .targets
        .iter()
        .map(|t| Arc::new(FederationClient::new(t, secret.clone(), Arc::clone(&stats))))
        .collect();
    if clients.is_empty() {
        tracing::warn!("no targets configured, probe will buffer but not push");
    }
    let controller = Arc::new(FailoverController::new(clients, FailoverConfig::default()));
    let http = reqwest::Client::new();

    // Collection interval, shared so the consumer can apply backpressure.
    let interval_ms = Arc::new(AtomicU64::new(config.interval_sec * 1000));

    let producer = {
        let buffer = Arc::clone(&buffer);
        let interval_ms = Arc::clone(&interval_ms);
        let (node_id, country, region) = (
            config.node_id.clone(),
            config.country.clone(),
            config.region.clone(),
        );
        tokio::spawn(async move {
            loop {
                let start = Instant::now();
                let metric = collector::collect_metric(&node_id, &country, &region).await;
                if !buffer.push(&metric).await {
                    tracing::warn!("buffer rejected metric");
                }
                let interval = Duration::from_millis(interval_ms.load(Ordering::Relaxed));
                tokio::time::sleep(interval.saturating_sub(start.elapsed())).await;
            }
        })
    };

    let consumer = {
        let buffer = Arc::clone(&buffer);
        let controller = Arc::clone(&controller);
        let interval_ms = Arc::clone(&interval_ms);
        let http = http.clone();
        let secret = secret.clone();
        let config = config.clone();
        tokio::spawn(async move {
            let base_interval_ms = config.interval_sec * 1000;
            let mut last_heartbeat = Instant::now() - Duration::from_secs(3600);
            loop {
                // Backpressure: above 80% of the byte quota, halve the batch
                // and double the collection interval until pressure clears.
                let pressured = buffer
                    .size_bytes()
                    .await
                    .map(|b| b as f64 > config.buffer_max_bytes as f64 * 0.8)
                    .unwrap_or(false);
                let batch_size = if pressured {
                    interval_ms.store(base_interval_ms * 2, Ordering::Relaxed);
                    (config.batch_size / 2).max(1)
                } else {
                    interval_ms.store(base_interval_ms, Ordering::Relaxed);
                    config.batch_size
                };

                match buffer.peek_batch(batch_size).await {
                    Ok(items) if items.is_empty() => {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                    Ok(items) => {
                        let ids: Vec<i64> = items.iter().map(|i| i.id).collect();
                        let payloads: Vec<serde_json::Value> =
                            items.into_iter().map(|i| i.data).collect();

                        let (success, _active) =
                            controller.push(&http, &payloads, &config.node_id).await;
                        if success {
                            if let Err(e) = buffer.acknowledge(&ids).await {
                                tracing::error!(error = %e, "ack failed");
                            } else {
                                tracing::debug!(count = ids.len(), "acked metrics");
                            }
                        } else {
                            tracing::warn!("push failed, items remain buffered");
                            tokio::time::sleep(Duration::from_secs(5)).await;
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "buffer peek failed");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }

                if last_heartbeat.elapsed() >= Duration::from_secs(config.heartbeat_interval_sec) {
                    let active = controller
                        .active_target()
                        .await
                        .unwrap_or_else(|| "unknown".to_string());
                    heartbeat::emit_heartbeat(
                        &http,
                        &config.api_base,
                        &secret,
                        &config.node_id,
                        &active,
                    )
                    .await;
                    last_heartbeat = Instant::now();
                }
            }
        })
    };

    let monitor_task = tokio::spawn(
        SystemMonitor::new(
            Arc::clone(&buffer),
            Arc::clone(&stats),
            config.node_id.clone(),
            Duration::from_secs(config.monitor_interval_sec),
        )
        .run(),
    );

    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("shutdown signal received"),
        Err(e) => tracing::error!(error = %e, "failed to listen for shutdown signal"),
    }

    producer.abort();
    consumer.abort();
    monitor_task.abort();
    tracing::info!("probe stopped");
}
