use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::Instrument;

use crate::state::AppState;

/// HTTP-level counters for the event endpoints.
#[derive(Debug, Default)]
pub struct Metrics {
    pub requests_total: AtomicU64,
    pub requests_inflight: AtomicU64,
    pub status_2xx: AtomicU64,
    pub status_4xx: AtomicU64,
    pub status_5xx: AtomicU64,
}

impl Metrics {
    fn observe(&self, status: StatusCode) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        let bucket = match status.as_u16() {
            500..=u16::MAX => &self.status_5xx,
            400..=499 => &self.status_4xx,
            200..=299 => &self.status_2xx,
            _ => return,
        };
        bucket.fetch_add(1, Ordering::Relaxed);
    }

    fn render(&self, out: &mut String) {
        let rows = [
            ("requests_total", &self.requests_total),
            ("requests_inflight", &self.requests_inflight),
            ("responses_2xx", &self.status_2xx),
            ("responses_4xx", &self.status_4xx),
            ("responses_5xx", &self.status_5xx),
        ];
        for (name, value) in rows {
            let _ = writeln!(out, "tally_relay_{name} {}", value.load(Ordering::Relaxed));
        }
    }
}

pub async fn metrics_handler(State(st): State<AppState>) -> impl IntoResponse {
    let mut body = String::new();
    st.metrics.render(&mut body);
    body.push_str(&st.relay.stats().render("tally_relay"));
    let _ = writeln!(body, "tally_relay_ready_destinations {}", st.registry.list().len());
    (StatusCode::OK, body)
}

/// Counts every request and runs it inside a span carrying a fresh request id.
pub async fn track_requests(
    State(st): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, std::convert::Infallible> {
    let span = tracing::info_span!(
        "http",
        request_id = %format!("req_{}", uuid::Uuid::new_v4()),
        method = %req.method(),
        path = %req.uri().path(),
    );
    st.metrics.requests_inflight.fetch_add(1, Ordering::Relaxed);
    let resp = next.run(req).instrument(span).await;
    st.metrics.requests_inflight.fetch_sub(1, Ordering::Relaxed);
    st.metrics.observe(resp.status());
    Ok(resp)
}
