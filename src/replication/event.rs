use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::controller::ReplicationController;
use super::filter::FilterChain;
use super::model::{Namespace, Resource, ResourceMetadata, ResourceType};
use super::policy::{Policy, TriggerType};

/// Envelope of a distribution registry notification
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryNotification {
    #[serde(default)]
    pub events: Vec<RegistryEvent>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryEvent {
    pub action: String,
    pub target: EventTarget,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventTarget {
    pub repository: String,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub digest: Option<String>,
    #[serde(default)]
    pub media_type: Option<String>,
}

/// Chart repository upload or delete
#[derive(Debug, Clone, Deserialize)]
pub struct ChartEvent {
    pub action: String,
    pub project: String,
    pub name: String,
    pub version: String,
}

/// A pushed or deleted artifact, as seen by the replication policies
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicationEvent {
    pub resource: Resource,
}

impl ReplicationEvent {
    pub fn is_deletion(&self) -> bool {
        self.resource.deleted
    }

    /// Events of tagged pushes and deletes. Pulls and blob events are dropped.
    pub fn from_registry_notification(notification: &RegistryNotification) -> Vec<Self> {
        notification
            .events
            .iter()
            .filter_map(|event| {
                let deleted = match event.action.as_str() {
                    "push" => false,
                    "delete" => true,
                    _ => return None,
                };
                let Some(tag) = event.target.tag.as_deref().filter(|t| !t.is_empty()) else {
                    debug!(
                        repository = %event.target.repository,
                        digest = ?event.target.digest,
                        "Skipping untagged registry event"
                    );
                    return None;
                };
                let mut resource = Resource::repository(&event.target.repository, &[tag]);
                resource.deleted = deleted;
                Some(Self { resource })
            })
            .collect()
    }

    pub fn from_chart_event(event: &ChartEvent) -> Option<Self> {
        let deleted = match event.action.as_str() {
            "upload" => false,
            "delete" => true,
            _ => return None,
        };
        let metadata = ResourceMetadata {
            namespace: Some(Namespace::new(event.project.as_str())),
            name: event.name.clone(),
            vtags: vec![event.version.clone()],
            labels: vec![],
        };
        let mut resource = Resource::new(ResourceType::Chart, metadata);
        resource.deleted = deleted;
        Some(Self { resource })
    }
}

/// Whether an event-based policy should replicate this event
pub fn policy_matches(policy: &Policy, event: &ReplicationEvent) -> bool {
    if !policy.enabled
        || policy.trigger_type() != TriggerType::EventBased
        || !policy.is_push_based()
    {
        return false;
    }
    if event.is_deletion() && !policy.deletion {
        return false;
    }
    if !policy.src_namespaces.is_empty() {
        let namespace = event.resource.metadata.namespace_name().unwrap_or_default();
        if !policy.src_namespaces.iter().any(|ns| ns == namespace) {
            return false;
        }
    }
    match FilterChain::new(&policy.filters) {
        Ok(chain) => chain.matches(&mut event.resource.clone()),
        Err(e) => {
            warn!(policy_id = policy.id, "Skipping policy with invalid filters: {}", e);
            false
        }
    }
}

/// Starts event-based replications for incoming notifications
pub struct EventHandler {
    controller: Arc<ReplicationController>,
}

impl EventHandler {
    pub fn new(controller: Arc<ReplicationController>) -> Self {
        Self { controller }
    }

    /// Start one execution per matching policy and return their ids
    pub async fn handle(&self, event: &ReplicationEvent) -> anyhow::Result<Vec<i64>> {
        let policies = self.controller.policies().list().await?;
        let mut executions = Vec::new();
        for policy in policies.iter().filter(|p| policy_matches(p, event)) {
            match self
                .controller
                .start_replication(policy, Some(event.resource.clone()), TriggerType::EventBased)
                .await
            {
                Ok(id) => {
                    info!(
                        policy_id = policy.id,
                        execution_id = id,
                        resource = %event.resource.display_name(),
                        "Replication triggered by event"
                    );
                    executions.push(id);
                }
                Err(e) => warn!(
                    policy_id = policy.id,
                    resource = %event.resource.display_name(),
                    "Failed to start event replication: {}",
                    e
                ),
            }
        }
        Ok(executions)
    }
}
