//! Durable client sessions, keyed by an opaque session id.
//!
//! A session outlives any single connection: a client that reconnects with
//! the same id gets its username and send permission back without
//! registering again. Sessions are never deleted here; the backing store
//! expires them.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use relay_common::id::{self, prefix};
use relay_common::PrefixedId;
use serde::{Deserialize, Serialize};

use crate::db::kv::KeyValueStore;
use crate::error::ApiError;

/// A stored session record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub can_send: Option<bool>,
    pub created_at: DateTime<Utc>,
}

impl PrefixedId for Session {
    const PREFIX: &'static str = prefix::SESSION;
}

impl Session {
    fn empty(session_id: String) -> Self {
        Self {
            session_id,
            username: None,
            can_send: None,
            created_at: Utc::now(),
        }
    }

    /// Whether a registration has already succeeded on this session.
    pub fn logged_in(&self) -> bool {
        self.username.is_some()
    }

    /// Stored send permission; absent means no.
    pub fn can_send(&self) -> bool {
        self.can_send.unwrap_or(false)
    }
}

/// Fields written by a successful registration.
#[derive(Debug, Clone)]
pub struct SessionFields {
    pub username: String,
    pub can_send: bool,
}

/// Session storage over a [`KeyValueStore`].
#[derive(Clone)]
pub struct SessionStore {
    kv: Arc<dyn KeyValueStore>,
    ttl_secs: u64,
}

impl SessionStore {
    pub fn new(kv: Arc<dyn KeyValueStore>, ttl_secs: u64) -> Self {
        Self { kv, ttl_secs }
    }

    fn key(session_id: &str) -> String {
        format!("relay:sess:{}", session_id)
    }

    /// Fetch a session. Ids that were not issued by [`SessionStore::create`]
    /// are treated as unknown without touching the store.
    pub async fn get(&self, session_id: &str) -> Result<Option<Session>, ApiError> {
        if !id::has_prefix(session_id, Session::PREFIX) {
            return Ok(None);
        }
        match self.kv.get(&Self::key(session_id)).await? {
            Some(v) => {
                let session: Session = serde_json::from_str(&v)
                    .map_err(|_| ApiError::internal("corrupt session data"))?;
                Ok(Some(session))
            }
            None => Ok(None),
        }
    }

    /// Create and persist a fresh, empty session.
    pub async fn create(&self) -> Result<Session, ApiError> {
        let session = Session::empty(Session::generate());
        self.write(&session).await?;
        Ok(session)
    }

    /// Write registration fields into a session and return the stored record.
    ///
    /// If the session expired in the meantime it is recreated under the same
    /// id, so the client's id stays valid.
    pub async fn set(&self, session_id: &str, fields: SessionFields) -> Result<Session, ApiError> {
        let mut session = match self.get(session_id).await? {
            Some(session) => session,
            None => Session::empty(session_id.to_string()),
        };
        session.username = Some(fields.username);
        session.can_send = Some(fields.can_send);
        self.write(&session).await?;
        Ok(session)
    }

    async fn write(&self, session: &Session) -> Result<(), ApiError> {
        let value =
            serde_json::to_string(session).map_err(|_| ApiError::internal("serialization"))?;
        self.kv
            .set_ex(&Self::key(&session.session_id), &value, self.ttl_secs)
            .await
    }
}
