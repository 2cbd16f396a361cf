use std::path::Path;
use std::sync::Arc;

use redis::aio::ConnectionManager;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use parley_notify::config::Config;
use parley_notify::gateway::consumer::{Broker, Consumer, RedisQueue};
use parley_notify::gateway::presence::PresenceFilter;
use parley_notify::gateway::publisher::EventPublisher;
use parley_notify::gateway::transport::{RealtimeTransport, RedisTransport};
use parley_notify::worker::MutationHandler;
use parley_notify::FanoutDispatcher;

#[tokio::main]
async fn main() {
    // Load .env file (silently skip if missing, env vars may be set externally)
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();

    let db = parley_notify::db::pool::connect(&config.database_url)
        .expect("failed to create database pool");

    let redis = redis::Client::open(config.redis_url.as_str()).expect("invalid REDIS_URL");
    let conn = ConnectionManager::new(redis.clone())
        .await
        .expect("failed to connect to redis");

    let transport: Arc<dyn RealtimeTransport> = Arc::new(RedisTransport::new(conn));
    let publisher = EventPublisher::new(transport.clone());
    let presence = PresenceFilter::new(transport, config.presence_timeout());
    let dispatcher = FanoutDispatcher::new(presence, publisher, config.fanout());
    let handler = Arc::new(MutationHandler::new(db, dispatcher));

    let broker: Arc<dyn Broker> = Arc::new(
        RedisQueue::connect(&redis)
            .await
            .expect("failed to connect mutation queue"),
    );

    let shutdown = CancellationToken::new();
    let consumer = Consumer::spawn(
        broker,
        config.mutation_queue.clone(),
        handler,
        config.retry_policy(),
        shutdown.clone(),
    );

    tracing::info!(
        queue = %config.mutation_queue,
        max_attempts = config.max_delivery_attempts,
        "parley-notify running"
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(?e, "failed to listen for shutdown signal");
    }
    tracing::info!("shutting down");
    shutdown.cancel();

    if let Err(e) = consumer.await {
        tracing::error!(?e, "consumer task panicked");
    }
}
