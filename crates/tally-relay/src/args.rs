use std::time::Duration;

use clap::{Parser, ValueEnum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreBackend {
    Memory,
    File,
    Etcd,
}

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Args {
    #[arg(long, env = "TALLY_RELAY_ADDR", default_value = "0.0.0.0:18090")]
    pub listen_addr: String,

    #[arg(long, env = "TALLY_STORE", value_enum, default_value_t = StoreBackend::File)]
    pub store: StoreBackend,

    #[arg(long, env = "TALLY_STORE_PATH", default_value = "/tmp/tally-relay/store.json")]
    pub store_path: String,

    #[arg(long, env = "ETCD_ENDPOINT", default_value = "http://127.0.0.1:2379")]
    pub etcd_endpoint: String,

    #[arg(long, env = "TALLY_ETCD_NAMESPACE", default_value = "/tally")]
    pub etcd_namespace: String,

    /// Base URL of the usage service.
    #[arg(long, env = "TALLY_USAGE_URL", default_value = "http://127.0.0.1:18091")]
    pub usage_url: String,

    #[arg(long, env = "TALLY_USAGE_TIMEOUT_MS", default_value_t = 10_000)]
    pub usage_timeout_ms: u64,

    /// Opt-in leak guard: drop pending requests never matched within this
    /// many seconds. 0 keeps them until their response arrives.
    #[arg(long, env = "TALLY_PENDING_TTL_SECS", default_value_t = 0)]
    pub pending_ttl_secs: u64,

    #[arg(long, env = "TALLY_LOCK_TIMEOUT_MS", default_value_t = 30_000)]
    pub lock_timeout_ms: u64,

    #[arg(long, env = "TALLY_NOTIFY_MAX_ATTEMPTS", default_value_t = 10)]
    pub notify_max_attempts: u32,

    #[arg(long, env = "TALLY_NOTIFY_DELAY_MS", default_value_t = 100)]
    pub notify_delay_ms: u64,

    /// OTLP/HTTP collector for exporting traces.
    #[arg(long, env = "OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,

    /// Bearer token for the OTLP collector.
    #[arg(long, env = "OTLP_TOKEN")]
    pub otlp_token: Option<String>,
}

impl Args {
    pub fn pending_ttl(&self) -> Option<Duration> {
        (self.pending_ttl_secs > 0).then(|| Duration::from_secs(self.pending_ttl_secs))
    }
}
