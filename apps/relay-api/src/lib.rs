pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod permissions;
pub mod registry;
pub mod routes;
pub mod session;

use std::sync::Arc;

use config::Config;
use db::kv::KeyValueStore;
use error::ApiError;
use gateway::fanout::{BroadcastMedium, Broadcaster};
use gateway::router::MessageRouter;
use registry::UserRegistry;
use session::SessionStore;

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<UserRegistry>,
    pub sessions: SessionStore,
    pub broadcaster: Arc<Broadcaster>,
    pub router: Arc<MessageRouter>,
}

impl AppState {
    /// Wire up a relay process. Subscribes to the broadcast channel, so the
    /// returned state is ready to accept connections.
    pub async fn build(
        config: Config,
        registry: UserRegistry,
        kv: Arc<dyn KeyValueStore>,
        medium: Arc<dyn BroadcastMedium>,
    ) -> Result<Self, ApiError> {
        let router = Arc::new(MessageRouter::new());
        let broadcaster = Broadcaster::start(medium, config.chat_channel.clone(), router.clone()).await?;
        Ok(Self {
            sessions: SessionStore::new(kv, config.session_ttl_secs),
            registry: Arc::new(registry),
            broadcaster,
            router,
            config: Arc::new(config),
        })
    }
}
