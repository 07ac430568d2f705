use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use tally_common::ConversationKey;
use tally_relay::{CompletedExchange, OutgoingExchange, RelayError};

use crate::state::AppState;

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn err(status: StatusCode, msg: impl Into<String>) -> Response {
    (status, Json(ErrorBody { error: msg.into() })).into_response()
}

fn relay_err(e: RelayError) -> Response {
    let status = match &e {
        RelayError::Intercept(_) => StatusCode::BAD_REQUEST,
        RelayError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        RelayError::Executor(_) => StatusCode::SERVICE_UNAVAILABLE,
    };
    if status.is_server_error() {
        tracing::error!(error=%e, "relay request failed");
    }
    err(status, e.to_string())
}

#[derive(Debug, Serialize)]
struct Observed {
    tracked: bool,
    key: Option<String>,
}

impl Observed {
    fn from_key(key: Option<ConversationKey>) -> Self {
        Self {
            tracked: key.is_some(),
            key: key.map(|k| k.to_string()),
        }
    }
}

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

pub async fn outgoing(State(st): State<AppState>, Json(ev): Json<OutgoingExchange>) -> Response {
    match st.relay.on_outgoing(&ev).await {
        Ok(key) => (StatusCode::OK, Json(Observed::from_key(key))).into_response(),
        Err(e) => relay_err(e),
    }
}

pub async fn completed(State(st): State<AppState>, Json(ev): Json<CompletedExchange>) -> Response {
    match st.relay.on_completed(ev).await {
        Ok(Some(key)) => (
            StatusCode::ACCEPTED,
            Json(Observed::from_key(Some(key))),
        )
            .into_response(),
        Ok(None) => (StatusCode::OK, Json(Observed::from_key(None))).into_response(),
        Err(e) => relay_err(e),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ReadyRequest {
    #[serde(default)]
    pub callback_url: Option<String>,
}

pub async fn ready(
    State(st): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ReadyRequest>,
) -> Response {
    if let Some(url) = req.callback_url.as_deref() {
        if let Err(e) = url::Url::parse(url) {
            return err(StatusCode::BAD_REQUEST, format!("invalid callback_url: {e}"));
        }
    }
    let info = st.registry.mark_ready(&id, req.callback_url);
    (StatusCode::OK, Json(info)).into_response()
}

pub async fn teardown(State(st): State<AppState>, Path(id): Path<String>) -> Response {
    if st.registry.unmark(&id) {
        StatusCode::NO_CONTENT.into_response()
    } else {
        err(StatusCode::NOT_FOUND, "destination not registered")
    }
}

pub async fn destinations(State(st): State<AppState>) -> Response {
    (StatusCode::OK, Json(st.registry.list())).into_response()
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub origin_id: String,
}

pub async fn refresh(
    State(st): State<AppState>,
    Path((tenant_id, conversation_id)): Path<(String, String)>,
    Json(req): Json<RefreshRequest>,
) -> Response {
    let key = match ConversationKey::new(tenant_id, conversation_id) {
        Ok(key) => key,
        Err(e) => return err(StatusCode::BAD_REQUEST, e.to_string()),
    };
    match st.relay.request_refresh(key, req.origin_id) {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => relay_err(e),
    }
}

#[derive(Debug, Serialize)]
struct TenantView {
    tenant_id: String,
    first_seen: chrono::DateTime<chrono::Utc>,
}

pub async fn tenants(State(st): State<AppState>) -> Response {
    match st.relay.known_tenants().await {
        Ok(list) => {
            let body: Vec<TenantView> = list
                .into_iter()
                .map(|(tenant_id, first_seen)| TenantView {
                    tenant_id,
                    first_seen,
                })
                .collect();
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(e) => relay_err(e),
    }
}

pub async fn pending(State(st): State<AppState>) -> Response {
    match st.relay.pending().await {
        Ok(list) => {
            let body: Vec<_> = list.into_iter().map(|(_, request)| request).collect();
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(e) => relay_err(e),
    }
}
