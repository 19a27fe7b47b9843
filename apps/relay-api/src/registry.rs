//! Process-wide user registry: the ordered list of `{name, role}` records
//! that permission resolution scans.

use std::path::Path;

use serde::Deserialize;

/// Role a user holds in the classroom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Teacher,
    Student,
    #[default]
    #[serde(other)]
    Other,
}

/// A single registry entry.
///
/// The on-disk key is `status`; `role` is accepted as well.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UserRecord {
    pub name: String,
    #[serde(rename = "status", alias = "role", default)]
    pub role: Role,
}

impl UserRecord {
    pub fn new(name: impl Into<String>, role: Role) -> Self {
        Self {
            name: name.into(),
            role,
        }
    }
}

#[derive(Debug, Deserialize)]
struct UsersFile {
    #[serde(default)]
    users: Vec<UserRecord>,
}

/// Failure to load the registry file.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("failed to read user registry: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse user registry: {0}")]
    Parse(#[from] serde_json::Error),
}

/// The user registry.
///
/// `Loading` exists so a registry that has not finished loading can never be
/// mistaken for a partially populated one: it resolves every name to nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserRegistry {
    Loading,
    Ready(Vec<UserRecord>),
}

impl UserRegistry {
    pub fn from_records(records: Vec<UserRecord>) -> Self {
        Self::Ready(records)
    }

    pub fn empty() -> Self {
        Self::Ready(Vec::new())
    }

    /// Parse the `{"users": [...]}` document.
    pub fn parse(json: &str) -> Result<Self, RegistryError> {
        let file: UsersFile = serde_json::from_str(json)?;
        Ok(Self::Ready(file.users))
    }

    pub async fn load(path: &Path) -> Result<Self, RegistryError> {
        let data = tokio::fs::read_to_string(path).await?;
        Self::parse(&data)
    }

    /// Load the registry, degrading to an empty one on failure.
    ///
    /// An empty registry denies everyone, so the relay keeps serving but no
    /// client can register until the file is fixed.
    pub async fn load_or_empty(path: &Path) -> Self {
        match Self::load(path).await {
            Ok(registry) => {
                tracing::info!(path = %path.display(), users = registry.len(), "user registry loaded");
                registry
            }
            Err(err) => {
                tracing::error!(path = %path.display(), %err, "user registry unavailable, denying all registrations");
                Self::empty()
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Loading => 0,
            Self::Ready(records) => records.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every record whose name equals `username` exactly, in file order.
    pub fn matching<'a>(&'a self, username: &'a str) -> impl Iterator<Item = &'a UserRecord> + 'a {
        let records: &[UserRecord] = match self {
            Self::Loading => &[],
            Self::Ready(records) => records,
        };
        records.iter().filter(move |r| r.name == username)
    }
}
