use std::sync::Arc;
use std::time::Instant;

use llmux_common::GlobalConfig;
use llmux_keypool::KeyPool;
use llmux_queue::AdmissionQueue;

use crate::stats::ProxyStats;
use crate::upstream::UpstreamClient;
use crate::user_store::UserStore;

/// Process-wide shared state, built once at startup and threaded through the
/// request handlers.
pub struct AppState {
    pub config: GlobalConfig,
    pub keypool: Arc<KeyPool>,
    pub queue: Arc<AdmissionQueue>,
    pub client: Arc<dyn UpstreamClient>,
    pub user_store: Arc<dyn UserStore>,
    pub stats: ProxyStats,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        config: GlobalConfig,
        keypool: Arc<KeyPool>,
        queue: Arc<AdmissionQueue>,
        client: Arc<dyn UpstreamClient>,
        user_store: Arc<dyn UserStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            keypool,
            queue,
            client,
            user_store,
            stats: ProxyStats::new(),
            started_at: Instant::now(),
        })
    }
}
