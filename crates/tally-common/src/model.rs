/// Model families recognised in outgoing payloads, in match priority order.
pub const KNOWN_MODELS: &[&str] = &["Opus", "Sonnet", "Haiku"];

/// Family reported when neither the request nor the usage source names one.
pub const DEFAULT_MODEL: &str = "Sonnet";

/// Map a raw model identifier (e.g. `claude-sonnet-4-5-20250929`) to its family.
///
/// Matching is a case-insensitive substring test against `catalogue`; the first
/// hit wins. Falls back to `default` when nothing matches or `raw` is absent.
pub fn resolve_declared_model(raw: Option<&str>, catalogue: &[String], default: &str) -> String {
    let Some(raw) = raw else {
        return default.to_string();
    };
    let lowered = raw.to_lowercase();
    catalogue
        .iter()
        .find(|family| lowered.contains(&family.to_lowercase()))
        .cloned()
        .unwrap_or_else(|| default.to_string())
}
