use std::sync::Arc;
use decklift_core::{Config, InstallOrchestrator, SanitizedConfig};

/// Shared application state
pub struct AppState {
    config: Config,
    orchestrator: Arc<InstallOrchestrator>,
}

impl AppState {
    pub fn new(config: Config, orchestrator: Arc<InstallOrchestrator>) -> Self {
        Self {
            config,
            orchestrator,
        }
    }

    pub fn sanitized_config(&self) -> SanitizedConfig {
        SanitizedConfig::from(&self.config)
    }

    pub fn orchestrator(&self) -> &InstallOrchestrator {
        self.orchestrator.as_ref()
    }
}
