//! Client-facing event names and wire-format messages.
//!
//! Every frame is a JSON object `{"t": <event name>, "d": <payload>}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::permissions::Capabilities;

/// Event names used on the wire.
pub struct EventName;

impl EventName {
    // Client → Server
    pub const REGISTER: &'static str = "register";
    pub const SEND_MESSAGE: &'static str = "sendMessage";

    // Server → Client
    pub const SESSION_STATUS: &'static str = "sessionStatus";
    pub const PERMISSION_STATUS: &'static str = "permissionStatus";
    pub const LOGIN_CONFIRMED: &'static str = "loginConfirmed";
    pub const INCOMING_MESSAGE: &'static str = "incomingMessage";
}

// ---------------------------------------------------------------------------
// Client → Server
// ---------------------------------------------------------------------------

/// Raw frame received from the client.
#[derive(Debug, Deserialize)]
pub struct ClientFrame {
    pub t: String,
    #[serde(default)]
    pub d: Value,
}

/// A validated inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Register { username: String },
    SendMessage { text: String },
}

impl ClientEvent {
    /// Parse a text frame. Anything that is not a known event carrying a
    /// string payload is rejected with a short reason for logging.
    pub fn parse(text: &str) -> Result<Self, &'static str> {
        let frame: ClientFrame = serde_json::from_str(text).map_err(|_| "invalid json")?;
        match frame.t.as_str() {
            EventName::REGISTER => match frame.d {
                Value::String(username) => Ok(Self::Register { username }),
                _ => Err("username must be a string"),
            },
            EventName::SEND_MESSAGE => match frame.d {
                Value::String(text) => Ok(Self::SendMessage { text }),
                _ => Err("message must be a string"),
            },
            _ => Err("unknown event"),
        }
    }
}

// ---------------------------------------------------------------------------
// Server → Client
// ---------------------------------------------------------------------------

/// Payload of `sessionStatus`, sent once a connection is bound to a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub logged_in: bool,
    pub can_send: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoginConfirmed {
    pub username: String,
}

/// An outbound event queued for one connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "t", content = "d", rename_all = "camelCase")]
pub enum ServerEvent {
    SessionStatus(SessionStatus),
    PermissionStatus(Capabilities),
    LoginConfirmed(LoginConfirmed),
    IncomingMessage(String),
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SessionStatus(_) => EventName::SESSION_STATUS,
            Self::PermissionStatus(_) => EventName::PERMISSION_STATUS,
            Self::LoginConfirmed(_) => EventName::LOGIN_CONFIRMED,
            Self::IncomingMessage(_) => EventName::INCOMING_MESSAGE,
        }
    }
}
