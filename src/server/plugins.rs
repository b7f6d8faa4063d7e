use std::collections::HashMap;
use std::sync::Arc;

use crate::server::auth::Authenticator;
use crate::server::auxiliary::{AuxiliaryServerFactory, LocatorServerFactory, LOCATOR_SERVER};
use crate::server::core::ConnectionHandler;
use crate::server::filter::{
    AllowListFilterFactory, DryRunFilterFactory, ObjectInputFilterFactory, PatternFilterFactory,
    ALLOWLIST_FILTER, DRYRUN_FILTER, PATTERN_FILTER,
};
use crate::utils::error::ServerError;

type AuthenticatorFactory = Arc<dyn Fn() -> Arc<dyn Authenticator> + Send + Sync>;

/// Explicit plugin registry: a mapping from string identifier to factory,
/// populated at process startup. The server resolves authenticators, object
/// input filter factories and auxiliary server factories through it;
/// absence of a requested plugin is a hard startup failure.
pub struct PluginRegistry<H: ConnectionHandler> {
    authenticators: HashMap<String, AuthenticatorFactory>,
    filter_factories: HashMap<String, Arc<dyn ObjectInputFilterFactory>>,
    auxiliary_factories: HashMap<String, Arc<dyn AuxiliaryServerFactory<H>>>,
}

impl<H: ConnectionHandler> Default for PluginRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: ConnectionHandler> PluginRegistry<H> {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            authenticators: HashMap::new(),
            filter_factories: HashMap::new(),
            auxiliary_factories: HashMap::new(),
        }
    }

    /// A registry with the built-in plugins: the three filter factories and
    /// the locator auxiliary server.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register_filter_factory(PATTERN_FILTER, Arc::new(PatternFilterFactory));
        registry.register_filter_factory(ALLOWLIST_FILTER, Arc::new(AllowListFilterFactory));
        registry.register_filter_factory(DRYRUN_FILTER, Arc::new(DryRunFilterFactory));
        registry.register_auxiliary_factory(LOCATOR_SERVER, Arc::new(LocatorServerFactory));

        registry
    }

    pub fn register_authenticator(
        &mut self,
        id: impl Into<String>,
        factory: impl Fn() -> Arc<dyn Authenticator> + Send + Sync + 'static,
    ) {
        self.authenticators.insert(id.into(), Arc::new(factory));
    }

    pub fn register_filter_factory(
        &mut self,
        id: impl Into<String>,
        factory: Arc<dyn ObjectInputFilterFactory>,
    ) {
        self.filter_factories.insert(id.into(), factory);
    }

    pub fn register_auxiliary_factory(
        &mut self,
        id: impl Into<String>,
        factory: Arc<dyn AuxiliaryServerFactory<H>>,
    ) {
        self.auxiliary_factories.insert(id.into(), factory);
    }

    pub fn resolve_authenticator(&self, id: &str) -> Result<Arc<dyn Authenticator>, ServerError> {
        self.authenticators
            .get(id)
            .map(|factory| factory())
            .ok_or_else(|| {
                ServerError::Configuration(format!("Authenticator plugin not found: '{id}'"))
            })
    }

    pub fn resolve_filter_factory(
        &self,
        id: &str,
    ) -> Result<Arc<dyn ObjectInputFilterFactory>, ServerError> {
        self.filter_factories.get(id).cloned().ok_or_else(|| {
            ServerError::Configuration(format!("Object input filter plugin not found: '{id}'"))
        })
    }

    pub fn resolve_auxiliary_factory(
        &self,
        id: &str,
    ) -> Result<Arc<dyn AuxiliaryServerFactory<H>>, ServerError> {
        self.auxiliary_factories.get(id).cloned().ok_or_else(|| {
            ServerError::Configuration(format!("Auxiliary server plugin not found: '{id}'"))
        })
    }
}
