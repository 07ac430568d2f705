pub mod conversation_key;
pub mod model;
pub mod pending_request;
pub mod usage_result;

pub use conversation_key::{ConversationKey, KeyError};
pub use model::{resolve_declared_model, DEFAULT_MODEL, KNOWN_MODELS};
pub use pending_request::{PendingRequest, ToolDeclaration};
pub use usage_result::{CacheCountdown, UsageResult, LONG_CONVERSATION_TOKENS};

pub mod telemetry;
