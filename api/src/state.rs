use std::sync::Arc;

use host_evals_core::features::FeatureRegistry;
use host_evals_mcp_runtime::HarnessConfig;

use crate::session::SessionStore;

#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionStore,
    pub registry: Arc<FeatureRegistry>,
    pub harness: HarnessConfig,
}

impl AppState {
    pub fn new(registry: Arc<FeatureRegistry>, harness: HarnessConfig) -> Self {
        Self {
            sessions: SessionStore::default(),
            registry,
            harness,
        }
    }
}
