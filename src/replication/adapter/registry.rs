use std::collections::HashMap;
use std::sync::Arc;

use super::{dockerhub, harbor, huawei, native, Adapter, AdapterError, ClientOptions};
use crate::replication::model::{
    Registry, REGISTRY_TYPE_DOCKER_HUB, REGISTRY_TYPE_HARBOR, REGISTRY_TYPE_HUAWEI,
    REGISTRY_TYPE_NATIVE,
};

/// Constructor for adapters of one registry type
pub type AdapterFactory =
    Arc<dyn Fn(&Registry) -> Result<Arc<dyn Adapter>, AdapterError> + Send + Sync>;

/// Registry of adapter factories keyed by registry type
pub struct AdapterRegistry {
    factories: HashMap<String, AdapterFactory>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with the built-in vendor adapters
    pub fn with_defaults(options: ClientOptions) -> Self {
        let mut registry = Self::new();

        let opts = options.clone();
        registry.register(
            REGISTRY_TYPE_NATIVE,
            Arc::new(move |r: &Registry| {
                Ok(Arc::new(native::NativeAdapter::new(r, &opts)?) as Arc<dyn Adapter>)
            }),
        );
        let opts = options.clone();
        registry.register(
            REGISTRY_TYPE_HARBOR,
            Arc::new(move |r: &Registry| {
                Ok(Arc::new(harbor::HarborAdapter::new(r, &opts)?) as Arc<dyn Adapter>)
            }),
        );
        let opts = options.clone();
        registry.register(
            REGISTRY_TYPE_DOCKER_HUB,
            Arc::new(move |r: &Registry| {
                Ok(Arc::new(dockerhub::DockerHubAdapter::new(r, &opts)?) as Arc<dyn Adapter>)
            }),
        );
        let opts = options;
        registry.register(
            REGISTRY_TYPE_HUAWEI,
            Arc::new(move |r: &Registry| {
                Ok(Arc::new(huawei::HuaweiAdapter::new(r, &opts)?) as Arc<dyn Adapter>)
            }),
        );

        registry
    }

    /// Register a factory, replacing any previous one for the same type
    pub fn register(&mut self, registry_type: &str, factory: AdapterFactory) {
        self.factories.insert(registry_type.to_string(), factory);
    }

    pub fn get(&self, registry_type: &str) -> Result<AdapterFactory, AdapterError> {
        self.factories
            .get(registry_type)
            .cloned()
            .ok_or_else(|| AdapterError::NoFactory(registry_type.to_string()))
    }

    /// Build an adapter for `registry` with the factory for its type
    pub fn create(&self, registry: &Registry) -> Result<Arc<dyn Adapter>, AdapterError> {
        let factory = self.get(&registry.registry_type)?;
        factory(registry)
    }

    /// Registered registry types, sorted
    pub fn list(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}
