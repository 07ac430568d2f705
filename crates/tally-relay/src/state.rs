use std::sync::Arc;

use tally_relay::{ReadyRegistry, Relay};

use crate::metrics::Metrics;

#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<Relay>,
    pub registry: Arc<ReadyRegistry>,
    pub metrics: Arc<Metrics>,
}
