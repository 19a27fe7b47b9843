use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;

use relay_api::config::Config;
use relay_api::db::kv::{KeyValueStore, MemoryStore};
use relay_api::gateway::fanout::{BroadcastMedium, MemoryMedium};
use relay_api::registry::{Role, UserRecord, UserRegistry};
use relay_api::AppState;

/// Configuration for an in-memory relay.
pub fn test_config() -> Config {
    Config {
        port: 0,
        redis_url: None,
        users_db_path: PathBuf::from("users_db.json"),
        chat_channel: "chat-channel".to_string(),
        session_ttl_secs: 60,
    }
}

/// alice is a teacher, bob a student; everyone else is unknown.
pub fn classroom() -> UserRegistry {
    UserRegistry::from_records(vec![
        UserRecord::new("alice", Role::Teacher),
        UserRecord::new("bob", Role::Student),
    ])
}

/// Build one relay process over the given shared backends.
pub async fn process_state(
    kv: Arc<dyn KeyValueStore>,
    medium: Arc<dyn BroadcastMedium>,
) -> AppState {
    AppState::build(test_config(), classroom(), kv, medium)
        .await
        .expect("build state")
}

/// Build a standalone relay with its own in-memory backends.
pub async fn test_state() -> AppState {
    process_state(Arc::new(MemoryStore::new()), Arc::new(MemoryMedium::new())).await
}

/// Build the full application router wired to a fresh test state.
pub async fn test_app() -> (Router, AppState) {
    let state = test_state().await;
    let app = relay_api::routes::router().with_state(state.clone());
    (app, state)
}

/// Serve `state` on an ephemeral port in the background.
pub async fn start_server(state: AppState) -> SocketAddr {
    let app = relay_api::routes::router().with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    addr
}
