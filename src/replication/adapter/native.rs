use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

use super::client::{ClientOptions, RegistryClient};
use super::image_registry::DefaultImageRegistry;
use super::{fold_namespace, Adapter, AdapterError, ImageRegistry};
use crate::replication::model::{
    FilterStyle, HealthStatus, Registry, RegistryInfo, ResourceMetadata, ResourceType,
    REGISTRY_TYPE_NATIVE,
};
use crate::replication::policy::TriggerType;

/// Plain distribution registry without namespaces
pub struct NativeAdapter {
    registry: Registry,
    images: DefaultImageRegistry,
}

impl NativeAdapter {
    pub fn new(registry: &Registry, options: &ClientOptions) -> Result<Self, AdapterError> {
        let client = Arc::new(RegistryClient::new(registry, options)?);
        Ok(Self {
            registry: registry.clone(),
            images: DefaultImageRegistry::new(client),
        })
    }
}

pub(crate) fn pattern_filters() -> Vec<FilterStyle> {
    ["name", "tag"]
        .into_iter()
        .map(|t| FilterStyle {
            filter_type: t.to_string(),
            style: "input".to_string(),
            values: vec![],
        })
        .collect()
}

#[async_trait]
impl Adapter for NativeAdapter {
    async fn info(&self) -> Result<RegistryInfo, AdapterError> {
        Ok(RegistryInfo {
            registry_type: REGISTRY_TYPE_NATIVE.to_string(),
            description: "Docker registry speaking the distribution API".to_string(),
            supported_resource_types: vec![ResourceType::Repository],
            supported_resource_filters: pattern_filters(),
            supported_triggers: vec![TriggerType::Manual, TriggerType::Scheduled],
        })
    }

    async fn health_check(&self) -> Result<HealthStatus, AdapterError> {
        match self.images.client().ping().await {
            Ok(()) => Ok(HealthStatus::Healthy),
            Err(e) => {
                warn!(registry = %self.registry.url, "Registry health check failed: {}", e);
                Ok(HealthStatus::Unhealthy)
            }
        }
    }

    fn convert_resource_metadata(
        &self,
        metadata: &ResourceMetadata,
        namespace: Option<&str>,
    ) -> Result<ResourceMetadata, AdapterError> {
        Ok(fold_namespace(metadata, namespace))
    }

    fn image_registry(&self) -> Option<&dyn ImageRegistry> {
        Some(&self.images)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::model::Namespace;

    fn adapter() -> NativeAdapter {
        let registry = Registry {
            id: 1,
            name: "native".to_string(),
            registry_type: REGISTRY_TYPE_NATIVE.to_string(),
            url: "http://127.0.0.1:1".to_string(),
            core_url: None,
            credential: None,
            insecure: false,
            status: HealthStatus::Unknown,
        };
        NativeAdapter::new(&registry, &ClientOptions::default()).unwrap()
    }

    #[test]
    fn test_convert_strips_namespace() {
        let adapter = adapter();
        let mut source = ResourceMetadata::from_repository_path("library/hello");
        source.vtags = vec!["latest".to_string()];

        let converted = adapter.convert_resource_metadata(&source, None).unwrap();
        assert!(converted.namespace.is_none());
        assert_eq!(converted.resource_name(), "library/hello");
        assert_eq!(converted.vtags, source.vtags);

        let converted = adapter
            .convert_resource_metadata(&source, Some("mirror"))
            .unwrap();
        assert_eq!(converted.resource_name(), "mirror/hello");
    }

    #[tokio::test]
    async fn test_namespace_operations_are_noops() {
        let adapter = adapter();
        adapter
            .create_namespace(&Namespace::new("library"))
            .await
            .unwrap();
        assert!(adapter
            .list_namespaces(&Default::default())
            .await
            .unwrap()
            .is_empty());
        assert!(adapter.chart_registry().is_none());
        assert!(adapter.image_registry().is_some());
    }

    #[tokio::test]
    async fn test_unreachable_registry_is_unhealthy() {
        assert_eq!(adapter().health_check().await.unwrap(), HealthStatus::Unhealthy);
    }
}
