use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Conversations at or above this many tokens are flagged as long.
pub const LONG_CONVERSATION_TOKENS: u64 = 50_000;

/// Usage metrics derived for one conversation after a completed exchange.
///
/// Serialized in camelCase since it is handed to the display layer verbatim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UsageResult {
    pub conversation_id: String,

    /// Base conversation length plus profile overhead.
    pub total_length_tokens: u64,

    pub model: String,

    /// Prompt cache for this conversation is warm until this instant.
    #[serde(default)]
    pub cache_expires_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub associated_project_id: Option<String>,

    #[serde(default)]
    pub auxiliary_id: Option<String>,

    #[serde(default)]
    pub settings: serde_json::Map<String, serde_json::Value>,

    #[serde(default)]
    pub last_message_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheCountdown {
    pub expired: bool,
    /// Whole minutes left, rounded up.
    pub minutes: i64,
}

impl UsageResult {
    pub fn is_currently_cached(&self, now: DateTime<Utc>) -> bool {
        self.cache_expires_at.is_some_and(|until| until > now)
    }

    pub fn time_until_cache_expires(&self, now: DateTime<Utc>) -> Option<CacheCountdown> {
        let until = self.cache_expires_at?;
        let diff_ms = (until - now).num_milliseconds();
        if diff_ms <= 0 {
            return Some(CacheCountdown {
                expired: true,
                minutes: 0,
            });
        }
        Some(CacheCountdown {
            expired: false,
            minutes: (diff_ms + 59_999) / 60_000,
        })
    }

    pub fn is_long(&self, threshold: u64) -> bool {
        self.total_length_tokens >= threshold
    }
}
