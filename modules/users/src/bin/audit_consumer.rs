use event_bus::{EventBus, NatsBus};
use std::sync::Arc;
use users_rs::config::Config;
use users_rs::db::{init_pool, run_migrations, PgStore};
use users_rs::metrics::Metrics;
use users_rs::{shutdown, topology, AuditRecorder, DurableConsumer};

#[tokio::main]
async fn main() {
    // Load environment variables from .env file (if present)
    dotenvy::dotenv().ok();
    users_rs::init_tracing();

    tracing::info!("Starting audit consumer...");

    let config = Config::from_env().expect("Failed to load configuration from environment");

    let pool = init_pool(
        &config.database_url,
        config.db_max_connections,
        config.db_acquire_timeout,
    )
    .await
    .expect("Failed to connect to database");

    tracing::info!("Running migrations...");
    run_migrations(&pool).await.expect("Failed to run migrations");
    let store = PgStore::new(pool);

    tracing::info!(nats_url = %config.nats_url, "Connecting to NATS");
    let client = async_nats::connect(&config.nats_url)
        .await
        .expect("Failed to connect to NATS");
    let bus = NatsBus::new(client);

    topology::ensure_consumer_topology(&bus, &config)
        .await
        .expect("Failed to reconcile stream and consumer");

    let subscription = bus
        .pull_subscription(&config.stream, &config.consumer_durable)
        .await
        .expect("Failed to bind durable consumer");

    let metrics = Metrics::new().expect("Failed to register metrics");
    let bus: Arc<dyn EventBus> = Arc::new(bus);
    let consumer = DurableConsumer::new(
        Box::new(subscription),
        bus,
        AuditRecorder::new(store),
        config.consumer_config(),
        metrics.clone(),
    );

    let shutdown_rx = shutdown::on_ctrl_c();
    if !config.metrics_log_interval.is_zero() {
        let metrics = metrics.clone();
        let interval = config.metrics_log_interval;
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move { metrics.log_periodically(interval, shutdown_rx).await });
    }

    consumer.run(shutdown_rx).await;

    if let Ok(text) = metrics.render() {
        tracing::info!(metrics = %text, "Final consumer metrics");
    }
}
