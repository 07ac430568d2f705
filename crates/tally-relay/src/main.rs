mod args;
mod handlers;
mod metrics;
mod state;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};
use clap::Parser;

use tally_common::telemetry::{init_tracing, shutdown_tracing, OtlpExport};
use tally_meta::{EtcdMetaStore, FileMetaStore, MemoryMetaStore, MetaStore};
use tally_relay::{
    ExecutorConfig, HttpSink, HttpUsageSource, NotifierConfig, ReadyRegistry, Relay, RelayConfig,
};

use crate::args::{Args, StoreBackend};
use crate::handlers::{
    completed, destinations, healthz, outgoing, pending, ready, refresh, teardown, tenants,
};
use crate::metrics::{metrics_handler, track_requests};
use crate::state::AppState;

async fn open_store(args: &Args) -> anyhow::Result<Arc<dyn MetaStore>> {
    let store: Arc<dyn MetaStore> = match args.store {
        StoreBackend::Memory => Arc::new(MemoryMetaStore::new()),
        StoreBackend::File => Arc::new(FileMetaStore::open(&args.store_path).await?),
        StoreBackend::Etcd => Arc::new(
            EtcdMetaStore::connect(std::slice::from_ref(&args.etcd_endpoint), &args.etcd_namespace)
                .await?,
        ),
    };
    tracing::info!(kind = store.kind(), "backing store ready");
    Ok(store)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let otel = init_tracing(
        "tally-relay",
        &OtlpExport {
            endpoint: args.otlp_endpoint.clone(),
            token: args.otlp_token.clone(),
        },
    );

    let result = run(args).await;
    if let Err(e) = &result {
        tracing::error!(error=%format!("{e:#}"), "tally-relay exited");
    }
    shutdown_tracing(otel);
    result
}

async fn run(args: Args) -> anyhow::Result<()> {
    let store = open_store(&args).await?;

    let usage = Arc::new(HttpUsageSource::new(
        &args.usage_url,
        Duration::from_millis(args.usage_timeout_ms),
    )?);
    let registry = Arc::new(ReadyRegistry::new());
    let sink = Arc::new(HttpSink::new(registry.clone(), Duration::from_secs(5))?);

    let config = RelayConfig {
        executor: ExecutorConfig {
            lock_timeout: Duration::from_millis(args.lock_timeout_ms),
        },
        notifier: NotifierConfig {
            max_attempts: args.notify_max_attempts.max(1),
            delay: Duration::from_millis(args.notify_delay_ms),
        },
        pending_ttl: args.pending_ttl(),
        ..Default::default()
    };
    let relay = Relay::new(config, store, usage, sink);

    let st = AppState {
        relay,
        registry,
        metrics: Arc::new(metrics::Metrics::default()),
    };

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/events/outgoing", post(outgoing))
        .route("/events/completed", post(completed))
        .route("/destinations", get(destinations))
        .route("/destinations/:id/ready", post(ready))
        .route("/destinations/:id", delete(teardown))
        .route("/conversations/:tenant/:conversation/refresh", post(refresh))
        .route("/tenants", get(tenants))
        .route("/pending", get(pending))
        .layer(middleware::from_fn_with_state(st.clone(), track_requests))
        .with_state(st);

    let listener = tokio::net::TcpListener::bind(&args.listen_addr).await?;
    tracing::info!(addr = %args.listen_addr, usage = %args.usage_url, "tally-relay listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await?;
    Ok(())
}
