use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

/// A destination that announced it is listening.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DestinationInfo {
    pub id: String,
    /// Where an HTTP sink posts updates for this destination.
    pub callback_url: Option<String>,
    pub ready_at: DateTime<Utc>,
}

/// Process-wide set of ready destinations.
///
/// Populated by each destination's ready signal and cleared on teardown.
/// A repeated announcement replaces the earlier one.
#[derive(Debug, Default)]
pub struct ReadyRegistry {
    destinations: DashMap<String, DestinationInfo>,
}

impl ReadyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_ready(&self, id: &str, callback_url: Option<String>) -> DestinationInfo {
        let info = DestinationInfo {
            id: id.to_string(),
            callback_url,
            ready_at: Utc::now(),
        };
        if self.destinations.insert(id.to_string(), info.clone()).is_none() {
            tracing::info!(destination = id, "destination ready");
        } else {
            tracing::debug!(destination = id, "destination re-announced");
        }
        info
    }

    /// Returns `true` if `id` was registered.
    pub fn unmark(&self, id: &str) -> bool {
        let removed = self.destinations.remove(id).is_some();
        if removed {
            tracing::info!(destination = id, "destination torn down");
        }
        removed
    }

    pub fn is_ready(&self, id: &str) -> bool {
        self.destinations.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<DestinationInfo> {
        self.destinations.get(id).map(|entry| entry.value().clone())
    }

    /// Snapshot sorted by id.
    pub fn list(&self) -> Vec<DestinationInfo> {
        let mut out: Vec<DestinationInfo> = self
            .destinations
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }
}
