use anyhow::Result;
use dotenv::dotenv;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rerum::cache::{CacheStore, ClusterBus, LocalBus, RedisBus};
use rerum::config;
use rerum::routes::build_router;
use rerum::state::AppState;
use rerum::store::{DocumentStore, MemoryStore, MongoStore};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rerum=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::load()?;
    config::log_config(&config);

    // Document store: the shared MongoDB collection, or the in-process
    // store for standalone runs.
    let store: Arc<dyn DocumentStore> = match &config.mongodb_uri {
        Some(uri) => Arc::new(
            MongoStore::connect(uri, &config.mongodb_db, &config.mongodb_collection).await?,
        ),
        None => {
            tracing::warn!(
                "MONGODB_URI is unset; running standalone with the in-memory store"
            );
            Arc::new(MemoryStore::new())
        }
    };

    let cache = Arc::new(CacheStore::new(
        config.cache_max_length,
        config.cache_max_bytes,
        config.cache_ttl,
    ));

    // Cluster bus: acknowledged pub/sub when a pool shares state through
    // Redis, otherwise the trivially-coherent single-process bus.
    let bus: Arc<dyn ClusterBus> = match &config.redis_url {
        Some(url) => Arc::new(
            RedisBus::connect(url, Arc::clone(&cache), config.cluster_sync_budget).await?,
        ),
        None => {
            tracing::warn!(
                "REDIS_URL is unset; cache coherence is scoped to this single process"
            );
            Arc::new(LocalBus::new(Arc::clone(&cache)))
        }
    };

    let addr = format!("{}:{}", config.host, config.port);
    let app = build_router(AppState::new(config, store, cache, bus));

    tracing::info!("RERUM v1 listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
