use relay_core::{Config, RelayService, SanitizedConfig};

/// Shared application state
pub struct AppState {
    config: Config,
    service: RelayService,
}

impl AppState {
    pub fn new(config: Config, service: RelayService) -> Self {
        Self { config, service }
    }

    pub fn sanitized_config(&self) -> SanitizedConfig {
        SanitizedConfig::from(&self.config)
    }

    pub fn service(&self) -> &RelayService {
        &self.service
    }
}
