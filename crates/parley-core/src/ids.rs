use parley_api::types::{ClientId, QualifiedId};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// A user identity, optionally qualified by a federation domain.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserId {
    pub id: String,
    pub domain: Option<String>,
}

/// Opaque per-device identifier, scoped to a UserId.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceId {
    pub value: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConversationId {
    pub value: String,
}

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            domain: None,
        }
    }

    pub fn qualified(id: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            domain: Some(domain.into()),
        }
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.domain {
            Some(domain) => write!(f, "{}@{}", self.id, domain),
            None => write!(f, "{}", self.id),
        }
    }
}

impl From<&QualifiedId> for UserId {
    fn from(value: &QualifiedId) -> Self {
        Self {
            id: value.id.clone(),
            domain: value.domain.clone(),
        }
    }
}

impl From<&UserId> for QualifiedId {
    fn from(value: &UserId) -> Self {
        Self {
            id: value.id.clone(),
            domain: value.domain.clone(),
        }
    }
}

impl DeviceId {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }
}

impl Display for DeviceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.value)
    }
}

impl From<&ClientId> for DeviceId {
    fn from(value: &ClientId) -> Self {
        Self {
            value: value.value.clone(),
        }
    }
}

impl From<&DeviceId> for ClientId {
    fn from(value: &DeviceId) -> Self {
        Self {
            value: value.value.clone(),
        }
    }
}

impl ConversationId {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }
}

/// Storage key for one (user, device) session slot.
pub fn session_key(user: &UserId, device: &DeviceId) -> String {
    format!("{}/{}", user, device)
}
