//! Classification of host network events and extraction of pending-request
//! data from outgoing completion payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;

use tally_common::{
    resolve_declared_model, ConversationKey, PendingRequest, ToolDeclaration, DEFAULT_MODEL,
    KNOWN_MODELS,
};

use crate::error::InterceptError;

/// Tool types the chat client injects itself; never user-declared.
pub const RESERVED_TOOL_TYPES: &[&str] = &["artifacts_v0", "repl_v0"];

/// An outgoing request observed before it leaves the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutgoingExchange {
    pub url: String,
    pub method: String,
    /// Raw request body as captured by the host (JSON or form-encoded).
    #[serde(default)]
    pub body: Option<String>,
    pub origin_id: String,
}

/// A request whose response has fully arrived.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedExchange {
    pub url: String,
    pub method: String,
    /// Response body, when the host was able to capture it.
    #[serde(default)]
    pub body: Option<Value>,
    pub origin_id: String,
}

#[derive(Debug, Clone)]
pub struct InterceptConfig {
    pub known_models: Vec<String>,
    pub default_model: String,
    pub reserved_tool_types: Vec<String>,
    /// Query pair a conversation fetch must carry to count as post-completion.
    pub fetch_marker: (String, String),
}

impl Default for InterceptConfig {
    fn default() -> Self {
        Self {
            known_models: KNOWN_MODELS.iter().map(|m| m.to_string()).collect(),
            default_model: DEFAULT_MODEL.to_string(),
            reserved_tool_types: RESERVED_TOOL_TYPES.iter().map(|t| t.to_string()).collect(),
            fetch_marker: ("tree".to_string(), "True".to_string()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Interceptor {
    config: InterceptConfig,
}

impl Interceptor {
    pub fn new(config: InterceptConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &InterceptConfig {
        &self.config
    }

    /// Key of a `POST .../chat_conversations/{id}/completion` (or `retry_completion`).
    pub fn classify_outgoing(
        &self,
        url: &str,
        method: &str,
    ) -> Result<Option<ConversationKey>, InterceptError> {
        if !method.eq_ignore_ascii_case("POST") {
            return Ok(None);
        }
        let parsed = parse_url(url)?;
        let Some((key, rest)) = conversation_path(&parsed)? else {
            return Ok(None);
        };
        match rest.as_slice() {
            ["completion"] | ["retry_completion"] => Ok(Some(key)),
            _ => Ok(None),
        }
    }

    /// Key of a `GET .../chat_conversations/{id}?tree=True` conversation fetch.
    pub fn classify_completed(
        &self,
        url: &str,
        method: &str,
    ) -> Result<Option<ConversationKey>, InterceptError> {
        if !method.eq_ignore_ascii_case("GET") {
            return Ok(None);
        }
        let parsed = parse_url(url)?;
        let (marker_key, marker_value) = &self.config.fetch_marker;
        let marked = parsed
            .query_pairs()
            .any(|(k, v)| k == marker_key.as_str() && v == marker_value.as_str());
        if !marked {
            return Ok(None);
        }
        match conversation_path(&parsed)? {
            Some((key, rest)) if rest.is_empty() => Ok(Some(key)),
            _ => Ok(None),
        }
    }

    /// Build the pending record for an outgoing completion to `key`.
    pub fn pending_request(
        &self,
        key: &ConversationKey,
        origin_id: &str,
        body: Option<&Value>,
        now: DateTime<Utc>,
    ) -> PendingRequest {
        let declared_model = resolve_declared_model(
            body.and_then(|b| b.get("model")).and_then(Value::as_str),
            &self.config.known_models,
            &self.config.default_model,
        );

        PendingRequest {
            tenant_id: key.tenant_id().to_string(),
            conversation_id: key.conversation_id().to_string(),
            origin_id: origin_id.to_string(),
            declared_model,
            auxiliary_id: body.and_then(style_id),
            created_at: now,
            tool_declarations: body
                .map(|b| self.tool_declarations(b))
                .unwrap_or_default(),
        }
    }

    fn tool_declarations(&self, body: &Value) -> Vec<ToolDeclaration> {
        let Some(tools) = body.get("tools").and_then(Value::as_array) else {
            return Vec::new();
        };
        tools
            .iter()
            .filter(|tool| {
                let reserved = tool
                    .get("type")
                    .and_then(Value::as_str)
                    .is_some_and(|t| self.config.reserved_tool_types.iter().any(|r| r == t));
                !reserved
            })
            .filter_map(|tool| {
                let name = tool.get("name").and_then(Value::as_str)?;
                if name.is_empty() {
                    return None;
                }
                let schema = tool
                    .get("input_schema")
                    .cloned()
                    .unwrap_or_else(|| Value::Object(Map::new()));
                Some(ToolDeclaration {
                    name: name.to_string(),
                    description: tool
                        .get("description")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    schema_text: schema.to_string(),
                })
            })
            .collect()
    }
}

/// Decode a captured request body: JSON first, then form encoding.
pub fn parse_request_body(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(json) = serde_json::from_str::<Value>(trimmed) {
        return Some(json);
    }
    let form: Map<String, Value> = url::form_urlencoded::parse(trimmed.as_bytes())
        .map(|(k, v)| (k.into_owned(), Value::String(v.into_owned())))
        .collect();
    if form.is_empty() {
        None
    } else {
        Some(Value::Object(form))
    }
}

fn style_id(body: &Value) -> Option<String> {
    let style = body.get("personalized_styles")?.get(0)?;
    ["key", "uuid"]
        .iter()
        .filter_map(|field| style.get(*field).and_then(Value::as_str))
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

fn parse_url(url: &str) -> Result<Url, InterceptError> {
    Url::parse(url).map_err(|reason| InterceptError::InvalidUrl {
        url: url.to_string(),
        reason,
    })
}

/// Split `/…/organizations/{tenant}/chat_conversations/{conversation}/rest…`.
fn conversation_path(url: &Url) -> Result<Option<(ConversationKey, Vec<&str>)>, InterceptError> {
    let Some(segments) = url.path_segments() else {
        return Ok(None);
    };
    let segments: Vec<&str> = segments.collect();
    let Some(org_idx) = segments.iter().position(|s| *s == "organizations") else {
        return Ok(None);
    };
    match segments.get(org_idx + 1..org_idx + 4) {
        Some([tenant, "chat_conversations", conversation])
            if !tenant.is_empty() && !conversation.is_empty() =>
        {
            let key = ConversationKey::new(*tenant, *conversation)?;
            Ok(Some((key, segments[org_idx + 4..].to_vec())))
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const BASE: &str = "https://claude.ai/api/organizations/org1/chat_conversations/conv1";

    #[test]
    fn test_classify_outgoing() {
        let i = Interceptor::default();
        let key = i
            .classify_outgoing(&format!("{BASE}/completion"), "POST")
            .unwrap()
            .unwrap();
        assert_eq!(key.to_string(), "org1:conv1");

        assert!(i
            .classify_outgoing(&format!("{BASE}/retry_completion"), "post")
            .unwrap()
            .is_some());
        assert!(i
            .classify_outgoing(&format!("{BASE}/completion"), "GET")
            .unwrap()
            .is_none());
        assert!(i
            .classify_outgoing(&format!("{BASE}/title"), "POST")
            .unwrap()
            .is_none());
        assert!(i
            .classify_outgoing("https://claude.ai/api/settings/billing", "POST")
            .unwrap()
            .is_none());
        assert!(i.classify_outgoing("not a url", "POST").is_err());
    }

    #[test]
    fn test_classify_completed() {
        let i = Interceptor::default();
        let key = i
            .classify_completed(&format!("{BASE}?tree=True&rendering_mode=messages"), "GET")
            .unwrap()
            .unwrap();
        assert_eq!(key.conversation_id(), "conv1");

        assert!(i.classify_completed(BASE, "GET").unwrap().is_none());
        assert!(i
            .classify_completed(&format!("{BASE}?tree=False"), "GET")
            .unwrap()
            .is_none());
        assert!(i
            .classify_completed(&format!("{BASE}/completion?tree=True"), "GET")
            .unwrap()
            .is_none());
        assert!(i
            .classify_completed(&format!("{BASE}?tree=True"), "POST")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_pending_request_extraction() {
        let i = Interceptor::default();
        let key = ConversationKey::new("org1", "conv1").unwrap();
        let body = json!({
            "model": "claude-opus-4-1-20250805",
            "personalized_styles": [{"key": "", "uuid": "style-uuid"}],
            "tools": [
                {"type": "artifacts_v0", "name": "artifacts"},
                {"type": "repl_v0", "name": "repl"},
                {"name": "web_search", "description": "Search the web", "input_schema": {"type": "object"}},
                {"name": "bare"},
                {"description": "nameless"}
            ]
        });
        let now = Utc::now();
        let req = i.pending_request(&key, "tab-3", Some(&body), now);

        assert_eq!(req.declared_model, "Opus");
        assert_eq!(req.auxiliary_id.as_deref(), Some("style-uuid"));
        assert_eq!(req.origin_id, "tab-3");
        assert_eq!(req.created_at, now);
        assert_eq!(
            req.tool_declarations,
            vec![
                ToolDeclaration {
                    name: "web_search".to_string(),
                    description: "Search the web".to_string(),
                    schema_text: r#"{"type":"object"}"#.to_string(),
                },
                ToolDeclaration {
                    name: "bare".to_string(),
                    description: String::new(),
                    schema_text: "{}".to_string(),
                },
            ]
        );
    }

    #[test]
    fn test_pending_request_defaults() {
        let i = Interceptor::default();
        let key = ConversationKey::new("org1", "conv1").unwrap();
        let req = i.pending_request(&key, "tab-1", None, Utc::now());
        assert_eq!(req.declared_model, DEFAULT_MODEL);
        assert_eq!(req.auxiliary_id, None);
        assert!(req.tool_declarations.is_empty());
    }

    #[test]
    fn test_parse_request_body() {
        assert_eq!(parse_request_body("  "), None);
        assert_eq!(
            parse_request_body(r#"{"model":"claude-haiku"}"#),
            Some(json!({"model": "claude-haiku"}))
        );
        assert_eq!(
            parse_request_body("model=claude-sonnet&prompt=hi+there"),
            Some(json!({"model": "claude-sonnet", "prompt": "hi there"}))
        );
    }
}
