use std::sync::Arc;

use crate::cache::{CacheStore, ClusterBus};
use crate::config::Config;
use crate::store::DocumentStore;

/// Shared application state for handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn DocumentStore>,
    pub cache: Arc<CacheStore>,
    pub bus: Arc<dyn ClusterBus>,
}

impl AppState {
    pub fn new(
        config: Config,
        store: Arc<dyn DocumentStore>,
        cache: Arc<CacheStore>,
        bus: Arc<dyn ClusterBus>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            store,
            cache,
            bus,
        }
    }
}
