use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("tenant id is empty")]
    EmptyTenant,
    #[error("conversation id is empty")]
    EmptyConversation,
    #[error("tenant id must not contain ':' (got {0:?})")]
    SeparatorInTenant(String),
    #[error("malformed correlation key {0:?}")]
    Malformed(String),
}

/// Correlation key for one (tenant, conversation) pair.
///
/// Persisted and compared in its string form `tenant:conversation`. The tenant
/// part never contains the separator, so the first `:` splits the two halves.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConversationKey {
    tenant_id: String,
    conversation_id: String,
}

impl ConversationKey {
    pub const SEPARATOR: char = ':';

    pub fn new(
        tenant_id: impl Into<String>,
        conversation_id: impl Into<String>,
    ) -> Result<Self, KeyError> {
        let tenant_id = tenant_id.into();
        let conversation_id = conversation_id.into();
        if tenant_id.is_empty() {
            return Err(KeyError::EmptyTenant);
        }
        if conversation_id.is_empty() {
            return Err(KeyError::EmptyConversation);
        }
        if tenant_id.contains(Self::SEPARATOR) {
            return Err(KeyError::SeparatorInTenant(tenant_id));
        }
        Ok(Self {
            tenant_id,
            conversation_id,
        })
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.tenant_id, Self::SEPARATOR, self.conversation_id)
    }
}

impl FromStr for ConversationKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (tenant, conversation) = s
            .split_once(Self::SEPARATOR)
            .ok_or_else(|| KeyError::Malformed(s.to_string()))?;
        Self::new(tenant, conversation)
    }
}

impl Serialize for ConversationKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ConversationKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
