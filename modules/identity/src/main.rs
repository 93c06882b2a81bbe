use std::sync::Arc;

use audit::{AuditLogRepository, PostgresAuditRepository};
use event_bus::backoff::{retry_with_backoff, RetryConfig};
use event_bus::{
    ensure_streams, DeliveryPolicy, DurableSubscriber, InMemoryBroker, JetStreamBroker,
    StreamBroker, StreamRouter,
};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use identity_rs::config::{BusType, Config, LogFormat};
use identity_rs::register_subscriptions;

fn init_tracing(format: LogFormat) {
    let registry = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()));

    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables from .env file (if present)
    dotenvy::dotenv().ok();

    let config = Config::from_env()?;
    init_tracing(config.log_format);

    tracing::info!(
        service = %config.service_name,
        bus_type = %config.bus_type,
        "Starting identity service"
    );

    let broker: Arc<dyn StreamBroker> = match config.bus_type {
        BusType::InMemory => {
            tracing::info!("Using InMemory event broker");
            Arc::new(InMemoryBroker::new())
        }
        BusType::Nats => {
            tracing::info!("Connecting to NATS at {}", config.nats_url);
            let url = config.nats_url.clone();
            let broker = retry_with_backoff(
                || {
                    let url = url.clone();
                    async move { JetStreamBroker::connect(&url).await }
                },
                &RetryConfig::default(),
                "nats_connect",
            )
            .await?;
            Arc::new(broker)
        }
    };

    let router = Arc::new(StreamRouter::with_default_streams()?);
    ensure_streams(broker.as_ref(), &router).await;

    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect(&config.database_url)
        .await?;

    tracing::info!("Running migrations...");
    audit::MIGRATOR.run(&pool).await?;

    let audit_repository: Arc<dyn AuditLogRepository> =
        Arc::new(PostgresAuditRepository::new(pool.clone()));
    let subscriber = DurableSubscriber::new(broker, router, DeliveryPolicy::default());
    register_subscriptions(&subscriber, audit_repository).await?;

    tracing::info!("Identity service ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!(
        grace_secs = config.shutdown_grace.as_secs(),
        "Shutdown signal received, draining consumers"
    );

    subscriber.shutdown(config.shutdown_grace).await;
    pool.close().await;

    tracing::info!("Identity service stopped");
    Ok(())
}
