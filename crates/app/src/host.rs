use thiserror::Error;

use hostmap_core::{hostname::normalize_host, SiteId};
use hostmap_util::{config::PLATFORM_MODULE, HostSettings};

#[derive(Debug, Error)]
pub enum HostError {
    #[error("host framework state unavailable: {0}")]
    Unavailable(String),
}

/// The multi-tenant host framework this subsystem plugs into.
pub trait HostFramework: Send + Sync {
    /// Whether the framework finished its own installation.
    fn setup_finished(&self) -> Result<bool, HostError>;

    /// The framework's authoritative answer to "is domain mapping loaded".
    fn is_module_loaded(&self) -> Result<bool, HostError>;

    /// Site the framework itself would serve for a normalized host.
    fn resolve_site(&self, host: &str) -> Option<SiteId>;

    /// Extensions registered with the framework, the platform's own included.
    fn extensions(&self) -> Vec<String>;
}

/// Host framework state taken from configuration.
#[derive(Debug, Clone)]
pub struct ConfiguredHost {
    settings: HostSettings,
}

impl ConfiguredHost {
    pub fn new(settings: HostSettings) -> Self {
        Self { settings }
    }
}

impl HostFramework for ConfiguredHost {
    fn setup_finished(&self) -> Result<bool, HostError> {
        Ok(self.settings.setup_finished)
    }

    fn is_module_loaded(&self) -> Result<bool, HostError> {
        Ok(self
            .settings
            .loaded_modules
            .iter()
            .any(|module| module == PLATFORM_MODULE))
    }

    fn resolve_site(&self, host: &str) -> Option<SiteId> {
        (normalize_host(host) == self.settings.network_domain)
            .then_some(SiteId(self.settings.main_site_id))
    }

    fn extensions(&self) -> Vec<String> {
        self.settings.extensions.clone()
    }
}
