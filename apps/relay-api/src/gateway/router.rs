//! Event wiring between sockets, connections, and the broadcaster.

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::error::ApiError;

use super::connection::ConnectionManager;
use super::events::{ClientEvent, ServerEvent};

/// Sending half of a connection's outbound event queue.
pub type Outbox = mpsc::UnboundedSender<ServerEvent>;

/// Dispatches inbound connection events and fans publications out to the
/// registered connections of this process.
///
/// The only state it keeps is the set of registered local connections.
pub struct MessageRouter {
    connections: DashMap<u64, Outbox>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    /// A socket connected: bind it to its session. A session that already
    /// carries a username puts the connection straight into the fan-out set.
    pub async fn connect(
        &self,
        conn: &mut ConnectionManager,
        session_id: Option<&str>,
    ) -> Result<(), ApiError> {
        conn.bind_session(session_id).await?;
        self.sync_membership(conn);
        Ok(())
    }

    /// Route one inbound client event to the connection.
    pub async fn dispatch(
        &self,
        conn: &mut ConnectionManager,
        event: ClientEvent,
    ) -> Result<(), ApiError> {
        match event {
            ClientEvent::Register { username } => {
                conn.register(&username).await?;
                self.sync_membership(conn);
            }
            ClientEvent::SendMessage { text } => {
                conn.send(&text).await?;
                self.sync_membership(conn);
            }
        }
        Ok(())
    }

    /// The socket went away.
    pub fn disconnect(&self, conn: &mut ConnectionManager) {
        conn.on_disconnect();
        self.remove(conn.id());
    }

    /// Keep the fan-out set in line with the connection's state. A connection
    /// whose session expired leaves the set until it registers again.
    fn sync_membership(&self, conn: &ConnectionManager) {
        let enrolled = self.is_enrolled(conn.id());
        if conn.is_registered() && !enrolled {
            self.enroll(conn.id(), conn.outbox());
        } else if !conn.is_registered() && enrolled {
            self.remove(conn.id());
        }
    }

    pub fn enroll(&self, connection_id: u64, outbox: Outbox) {
        self.connections.insert(connection_id, outbox);
    }

    pub fn remove(&self, connection_id: u64) {
        self.connections.remove(&connection_id);
    }

    pub fn is_enrolled(&self, connection_id: u64) -> bool {
        self.connections.contains_key(&connection_id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Push `text` to every registered connection, unconditionally.
    /// Connections whose queue has closed are pruned. Returns the number of
    /// connections the message was handed to.
    pub fn fan_out(&self, text: &str) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();
        for entry in self.connections.iter() {
            if entry
                .value()
                .send(ServerEvent::IncomingMessage(text.to_string()))
                .is_ok()
            {
                delivered += 1;
            } else {
                closed.push(*entry.key());
            }
        }
        // Removing while iterating would deadlock the shard.
        for id in closed {
            self.connections.remove(&id);
        }
        delivered
    }
}

impl Default for MessageRouter {
    fn default() -> Self {
        Self::new()
    }
}
