use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for the relay pipeline, rendered in Prometheus text format.
#[derive(Debug, Default)]
pub struct RelayStats {
    pub outgoing_observed: AtomicU64,
    pub completed_observed: AtomicU64,
    pub tasks_enqueued: AtomicU64,
    pub tasks_succeeded: AtomicU64,
    pub tasks_failed: AtomicU64,
    pub stale_lock_overrides: AtomicU64,
    pub no_data: AtomicU64,
    pub deliveries_ok: AtomicU64,
    pub deliveries_exhausted: AtomicU64,
    pub deliveries_failed: AtomicU64,
    pub delivery_retries: AtomicU64,
}

impl RelayStats {
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn render(&self, prefix: &str) -> String {
        let rows: [(&str, &AtomicU64); 11] = [
            ("outgoing_observed_total", &self.outgoing_observed),
            ("completed_observed_total", &self.completed_observed),
            ("tasks_enqueued_total", &self.tasks_enqueued),
            ("tasks_succeeded_total", &self.tasks_succeeded),
            ("tasks_failed_total", &self.tasks_failed),
            ("stale_lock_overrides_total", &self.stale_lock_overrides),
            ("no_data_total", &self.no_data),
            ("deliveries_ok_total", &self.deliveries_ok),
            ("deliveries_exhausted_total", &self.deliveries_exhausted),
            ("deliveries_failed_total", &self.deliveries_failed),
            ("delivery_retries_total", &self.delivery_retries),
        ];
        let mut out = String::new();
        for (name, value) in rows {
            let _ = writeln!(out, "{prefix}_{name} {}", value.load(Ordering::Relaxed));
        }
        out
    }
}
