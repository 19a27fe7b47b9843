use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use relay_api::config::Config;
use relay_api::db::kv::{KeyValueStore, MemoryStore, RedisStore};
use relay_api::gateway::fanout::{BroadcastMedium, MemoryMedium, RedisMedium};
use relay_api::registry::UserRegistry;
use relay_api::AppState;

#[tokio::main]
async fn main() {
    // .env is optional; env vars may be set externally.
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    let port = config.port;

    // Phase 1: the registry is fully loaded before anything is accepted.
    let registry = UserRegistry::load_or_empty(&config.users_db_path).await;

    let kv: Arc<dyn KeyValueStore>;
    let medium: Arc<dyn BroadcastMedium>;
    match &config.redis_url {
        Some(url) => {
            kv = Arc::new(
                RedisStore::connect(url)
                    .await
                    .expect("failed to connect to Redis session store"),
            );
            medium = Arc::new(
                RedisMedium::connect(url)
                    .await
                    .expect("failed to connect to Redis pub/sub"),
            );
            tracing::info!("using Redis for sessions and broadcast");
        }
        None => {
            tracing::warn!("REDIS_URL not set, running in single-process mode");
            kv = Arc::new(MemoryStore::new());
            medium = Arc::new(MemoryMedium::new());
        }
    }

    tracing::info!(
        channel = %config.chat_channel,
        session_ttl_secs = config.session_ttl_secs,
        "relay configured"
    );

    let state = AppState::build(config, registry, kv, medium)
        .await
        .expect("failed to subscribe to broadcast channel");

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Phase 2: accept connections.
    let app = Router::new()
        .merge(relay_api::routes::router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "relay listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");
    axum::serve(listener, app).await.expect("server error");
}
