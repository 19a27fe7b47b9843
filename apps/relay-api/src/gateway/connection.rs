//! Per-connection state machine: `Connected` → `Registered` → `Closed`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::ApiError;
use crate::permissions::{self, Capabilities};
use crate::registry::UserRegistry;
use crate::session::{Session, SessionFields, SessionStore};
use crate::AppState;

use super::events::{LoginConfirmed, ServerEvent, SessionStatus};
use super::fanout::Broadcaster;
use super::router::Outbox;

/// Label used for a sender without a username.
///
/// Registration is the only way into the send path and it always sets a
/// username, so this is unused today; it stays so anonymous sending can be
/// enabled without changing the wire format.
pub const ANONYMOUS_LABEL: &str = "Anonymous";

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Registered,
    Closed,
}

/// State for a single live connection.
///
/// Holds its own copy of the bound session, refreshed on bind, on every
/// send, and after every successful write. The copy is only a cache: the
/// store decides whether a send goes out.
pub struct ConnectionManager {
    id: u64,
    state: ConnectionState,
    session: Option<Session>,
    sessions: SessionStore,
    registry: Arc<UserRegistry>,
    broadcaster: Arc<Broadcaster>,
    outbox: Outbox,
}

impl ConnectionManager {
    pub fn new(
        sessions: SessionStore,
        registry: Arc<UserRegistry>,
        broadcaster: Arc<Broadcaster>,
        outbox: Outbox,
    ) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            state: ConnectionState::Connected,
            session: None,
            sessions,
            registry,
            broadcaster,
            outbox,
        }
    }

    pub fn from_state(state: &AppState, outbox: Outbox) -> Self {
        Self::new(
            state.sessions.clone(),
            state.registry.clone(),
            state.broadcaster.clone(),
            outbox,
        )
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn outbox(&self) -> Outbox {
        self.outbox.clone()
    }

    pub fn is_registered(&self) -> bool {
        self.state == ConnectionState::Registered
    }

    /// Bind to the session `session_id`, or to a new one if the id is
    /// missing, unknown, or expired. Emits `sessionStatus`.
    ///
    /// A session that already holds a username restores the registered state
    /// without a new registration.
    pub async fn bind_session(&mut self, session_id: Option<&str>) -> Result<&Session, ApiError> {
        if self.state == ConnectionState::Closed {
            return Err(ApiError::bad_request("connection closed"));
        }

        let existing = match session_id {
            Some(id) => self.sessions.get(id).await?,
            None => None,
        };
        let session = match existing {
            Some(session) => session,
            None => self.sessions.create().await?,
        };

        if session.logged_in() {
            self.state = ConnectionState::Registered;
        }

        self.emit(ServerEvent::SessionStatus(SessionStatus {
            logged_in: session.logged_in(),
            can_send: session.can_send(),
        }));

        tracing::debug!(
            connection_id = self.id,
            session_id = %session.session_id,
            restored = session.logged_in(),
            "session bound"
        );

        Ok(self.session.insert(session))
    }

    /// Register `username`. Always emits `permissionStatus`; on success the
    /// session is persisted before `loginConfirmed` is emitted.
    ///
    /// A username without receive rights is refused silently: the session is
    /// left as is and only the capability notification tells the client.
    pub async fn register(&mut self, username: &str) -> Result<Capabilities, ApiError> {
        if self.state == ConnectionState::Closed {
            return Err(ApiError::bad_request("connection closed"));
        }
        if username.is_empty() {
            return Err(ApiError::bad_request("username must not be empty"));
        }
        let session_id = self
            .session
            .as_ref()
            .map(|s| s.session_id.clone())
            .ok_or_else(|| ApiError::bad_request("no session bound"))?;

        let caps = permissions::resolve(&self.registry, username);
        self.emit(ServerEvent::PermissionStatus(caps));

        if !caps.can_receive {
            tracing::info!(
                connection_id = self.id,
                %session_id,
                %username,
                "registration refused: no permission to receive messages"
            );
            return Ok(caps);
        }

        let fields = SessionFields {
            username: username.to_string(),
            can_send: caps.can_send,
        };
        let session = self.sessions.set(&session_id, fields).await.map_err(|err| {
            tracing::warn!(connection_id = self.id, %session_id, %err, "registration not persisted");
            err
        })?;

        self.session = Some(session);
        self.state = ConnectionState::Registered;
        self.emit(ServerEvent::LoginConfirmed(LoginConfirmed {
            username: username.to_string(),
        }));

        tracing::info!(
            connection_id = self.id,
            %session_id,
            %username,
            can_send = caps.can_send,
            "user registered"
        );
        Ok(caps)
    }

    /// Publish `text` under this connection's label. Returns whether it was
    /// handed to the broadcaster; sends without permission are dropped.
    ///
    /// Permission comes from the stored session, not the local copy: another
    /// connection on the same session may have re-registered, or the session
    /// may have expired. An expired session drops the connection back to
    /// `Connected`.
    pub async fn send(&mut self, text: &str) -> Result<bool, ApiError> {
        if !self.is_registered() {
            tracing::debug!(connection_id = self.id, state = ?self.state, "send dropped");
            return Ok(false);
        }
        let Some(session_id) = self.session.as_ref().map(|s| s.session_id.clone()) else {
            return Ok(false);
        };

        match self.sessions.get(&session_id).await? {
            Some(current) if current.logged_in() => self.session = Some(current),
            _ => {
                tracing::info!(connection_id = self.id, %session_id, "session expired, registration required");
                self.state = ConnectionState::Connected;
                return Ok(false);
            }
        }

        if !self.session.as_ref().is_some_and(Session::can_send) {
            tracing::debug!(connection_id = self.id, %session_id, "send dropped: no permission");
            return Ok(false);
        }
        self.broadcaster.publish(format!("{}: {}", self.label(), text));
        Ok(true)
    }

    /// Tear down. The shared subscription belongs to the process, so there is
    /// nothing to unsubscribe.
    pub fn on_disconnect(&mut self) {
        self.state = ConnectionState::Closed;
        if let Some(session) = &self.session {
            tracing::debug!(connection_id = self.id, session_id = %session.session_id, "connection closed");
        }
    }

    fn label(&self) -> &str {
        self.session
            .as_ref()
            .and_then(|s| s.username.as_deref())
            .unwrap_or(ANONYMOUS_LABEL)
    }

    fn emit(&self, event: ServerEvent) {
        // Fails only once the socket task has gone away.
        let _ = self.outbox.send(event);
    }
}
