use std::path::PathBuf;

/// Default session lifetime: 24 hours.
pub const DEFAULT_SESSION_TTL_SECS: u64 = 86_400;

/// Relay configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the HTTP server binds to.
    pub port: u16,
    /// Redis connection string. When unset, sessions and the broadcast
    /// channel live in process memory and only a single process can serve.
    pub redis_url: Option<String>,
    /// Path of the JSON user registry loaded at startup.
    pub users_db_path: PathBuf,
    /// Pub/sub channel every process publishes to and subscribes on.
    pub chat_channel: String,
    /// Session expiry, refreshed on every session write.
    pub session_ttl_secs: u64,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Every variable is optional; unparsable numbers fall back to defaults.
    pub fn from_env() -> Self {
        Self {
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3000),
            redis_url: std::env::var("REDIS_URL").ok().filter(|s| !s.is_empty()),
            users_db_path: std::env::var("USERS_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("users_db.json")),
            chat_channel: std::env::var("CHAT_CHANNEL")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "chat-channel".to_string()),
            session_ttl_secs: std::env::var("SESSION_TTL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|secs| *secs > 0)
                .unwrap_or(DEFAULT_SESSION_TTL_SECS),
        }
    }
}
