use std::ops::BitOr;

use serde::Serialize;

use crate::registry::{Role, UserRegistry};

/// What a username may do on the relay.
///
/// `can_send` is only ever granted together with `can_receive`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub can_receive: bool,
    pub can_send: bool,
}

impl Capabilities {
    pub const NONE: Self = Self {
        can_receive: false,
        can_send: false,
    };
    pub const RECEIVE_ONLY: Self = Self {
        can_receive: true,
        can_send: false,
    };
    pub const FULL: Self = Self {
        can_receive: true,
        can_send: true,
    };

    pub fn for_role(role: Role) -> Self {
        match role {
            Role::Teacher => Self::FULL,
            Role::Student => Self::RECEIVE_ONLY,
            Role::Other => Self::NONE,
        }
    }
}

impl BitOr for Capabilities {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self {
            can_receive: self.can_receive || rhs.can_receive,
            can_send: self.can_send || rhs.can_send,
        }
    }
}

/// Resolve the capabilities of `username`.
///
/// The result is the union over every record carrying that name, so a later
/// record never takes away what an earlier one granted. Unknown names, and a
/// registry that is still loading, resolve to [`Capabilities::NONE`].
pub fn resolve(registry: &UserRegistry, username: &str) -> Capabilities {
    registry
        .matching(username)
        .map(|record| Capabilities::for_role(record.role))
        .fold(Capabilities::NONE, |acc, caps| acc | caps)
}
