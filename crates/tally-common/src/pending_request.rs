use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::conversation_key::{ConversationKey, KeyError};

/// A tool the client declared in its outgoing completion payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolDeclaration {
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// JSON text of the tool's input schema (`{}` when none was sent).
    #[serde(default = "empty_schema")]
    pub schema_text: String,
}

fn empty_schema() -> String {
    "{}".to_string()
}

/// An outgoing completion exchange still waiting for its conversation fetch.
///
/// Stored in the correlation cache under `tenant_id:conversation_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingRequest {
    pub tenant_id: String,
    pub conversation_id: String,

    /// Origin context (tab, window, client) that issued the request.
    pub origin_id: String,

    pub declared_model: String,

    /// Style/preset identifier attached to the message, if any.
    #[serde(default)]
    pub auxiliary_id: Option<String>,

    pub created_at: DateTime<Utc>,

    #[serde(default)]
    pub tool_declarations: Vec<ToolDeclaration>,
}

impl PendingRequest {
    pub fn key(&self) -> Result<ConversationKey, KeyError> {
        ConversationKey::new(self.tenant_id.clone(), self.conversation_id.clone())
    }
}
