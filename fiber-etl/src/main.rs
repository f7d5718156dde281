// fiber-etl: Worker entrypoint

use fiber_etl::alerts::{AlertConfig, AlertEngine, LogDispatcher, WebhookDispatcher};
use fiber_etl::worker::{heartbeat_loop, EtlWorker};
use fiber_etl::{AnalyticsEngine, EtlConfig};
use fiber_store::{Db, DbConfig, Kv};
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
    tracing::info!("starting fiber-etl worker");

    let config = EtlConfig::from_env();

    let kv = match Kv::connect(&config.redis_url).await {
        Ok(kv) => kv,
        Err(e) => {
            tracing::error!(error = %e, "failed to connect to kv-store");
            std::process::exit(1);
        }
    };

    let db = match Db::connect(&DbConfig::from_env()).await {
        Ok(db) => db,
        Err(e) => {
            tracing::error!(error = %e, "failed to connect to store");
            std::process::exit(1);
        }
    };

    let alert_config = AlertConfig::from_env();
    let dispatcher: Box<dyn fiber_etl::AlertDispatcher> = match &alert_config.webhook_url {
        Some(url) => Box::new(WebhookDispatcher::new(url.clone())),
        None => Box::new(LogDispatcher),
    };
    let alert_engine = AlertEngine::new(kv.clone(), dispatcher, alert_config);
    let analytics = AnalyticsEngine::new(kv.clone());

    let heartbeat = tokio::spawn(heartbeat_loop(kv.clone()));
    let worker = tokio::spawn(EtlWorker::new(kv, db, alert_engine, analytics, config).run());

    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("shutdown signal received"),
        Err(e) => tracing::error!(error = %e, "failed to listen for shutdown signal"),
    }

    worker.abort();
    heartbeat.abort();
    tracing::info!("ETL worker stopped");
}
