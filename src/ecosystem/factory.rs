//! Adapter factory

use crate::config::SiteConfig;
use crate::ecosystem::{
    AdapterSet, ApptainerAdapter, EcosystemAdapter, MicromambaAdapter, SpackAdapter, UvAdapter,
    VenvAdapter,
};
use std::sync::Arc;

/// Create the adapter for every ecosystem the site configures
pub fn create_adapters(config: &SiteConfig) -> AdapterSet {
    let ecosystems = &config.ecosystems;
    let adapters: Vec<Arc<dyn EcosystemAdapter>> = vec![
        Arc::new(SpackAdapter::new(ecosystems.base.clone())),
        Arc::new(UvAdapter::new(ecosystems.index.clone())),
        Arc::new(MicromambaAdapter::new(ecosystems.app.clone())),
        Arc::new(VenvAdapter::new(ecosystems.venv.clone())),
        Arc::new(ApptainerAdapter::new(ecosystems.apptainer.clone())),
    ];
    AdapterSet::new(adapters)
}
