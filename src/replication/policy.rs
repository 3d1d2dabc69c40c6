use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::filter::{FilterChain, FilterError};
use super::model::Registry;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FilterType {
    Resource,
    Name,
    Tag,
    Label,
    /// Anything not recognized; rejected when a filter chain is built
    Unknown(String),
}

impl From<String> for FilterType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "resource" => FilterType::Resource,
            "name" => FilterType::Name,
            "tag" => FilterType::Tag,
            "label" => FilterType::Label,
            _ => FilterType::Unknown(value),
        }
    }
}

impl From<FilterType> for String {
    fn from(value: FilterType) -> Self {
        value.to_string()
    }
}

impl fmt::Display for FilterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterType::Resource => f.write_str("resource"),
            FilterType::Name => f.write_str("name"),
            FilterType::Tag => f.write_str("tag"),
            FilterType::Label => f.write_str("label"),
            FilterType::Unknown(other) => f.write_str(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(rename = "type")]
    pub filter_type: FilterType,
    pub value: serde_json::Value,
}

impl Filter {
    pub fn new(filter_type: FilterType, value: impl Into<serde_json::Value>) -> Self {
        Self {
            filter_type,
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Manual,
    Scheduled,
    EventBased,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Manual => "manual",
            TriggerType::Scheduled => "scheduled",
            TriggerType::EventBased => "event_based",
        }
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(TriggerType::Manual),
            "scheduled" => Ok(TriggerType::Scheduled),
            "event_based" => Ok(TriggerType::EventBased),
            other => Err(format!("unknown trigger type '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerSettings {
    #[serde(default)]
    pub cron: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    #[serde(rename = "type")]
    pub trigger_type: TriggerType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<TriggerSettings>,
}

impl Trigger {
    pub fn manual() -> Self {
        Self {
            trigger_type: TriggerType::Manual,
            settings: None,
        }
    }

    /// Cron expression of a scheduled trigger, normalized to include seconds
    pub fn cron(&self) -> Option<String> {
        self.settings
            .as_ref()
            .map(|s| s.cron.trim())
            .filter(|c| !c.is_empty())
            .map(normalize_cron)
    }

    fn validate(&self) -> Result<(), PolicyError> {
        if self.trigger_type != TriggerType::Scheduled {
            return Ok(());
        }
        let cron = self.cron().ok_or(PolicyError::MissingCron)?;
        cron::Schedule::from_str(&cron).map_err(|e| PolicyError::InvalidCron {
            cron: cron.clone(),
            reason: e.to_string(),
        })?;
        Ok(())
    }
}

/// Accept classic five-field expressions by prepending a seconds field
pub fn normalize_cron(expr: &str) -> String {
    let expr = expr.trim();
    if expr.split_whitespace().count() == 5 {
        format!("0 {}", expr)
    } else {
        expr.to_string()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("policy name must not be empty")]
    EmptyName,
    #[error("either the source or the destination registry must be the local registry")]
    BothRemote,
    #[error("source and destination registries cannot both be local")]
    BothLocal,
    #[error("scheduled trigger requires a cron expression")]
    MissingCron,
    #[error("invalid cron expression '{cron}': {reason}")]
    InvalidCron { cron: String, reason: String },
    #[error("invalid filter: {0}")]
    Filter(#[from] FilterError),
}

/// Replication policy: direction, selection and trigger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// `None` means the local registry
    #[serde(default)]
    pub src_registry: Option<Registry>,
    /// `None` means the local registry
    #[serde(default)]
    pub dest_registry: Option<Registry>,
    #[serde(default)]
    pub src_namespaces: Vec<String>,
    /// Empty keeps the source namespace
    #[serde(default)]
    pub dest_namespace: String,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub trigger: Option<Trigger>,
    #[serde(default)]
    pub deletion: bool,
    #[serde(default, rename = "override")]
    pub override_existing: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "Utc::now")]
    pub creation_time: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub update_time: DateTime<Utc>,
}

fn default_enabled() -> bool {
    true
}

impl Policy {
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.name.trim().is_empty() {
            return Err(PolicyError::EmptyName);
        }
        match (&self.src_registry, &self.dest_registry) {
            (Some(_), Some(_)) => return Err(PolicyError::BothRemote),
            (None, None) => return Err(PolicyError::BothLocal),
            _ => {}
        }
        FilterChain::new(&self.filters)?;
        if let Some(trigger) = &self.trigger {
            trigger.validate()?;
        }
        Ok(())
    }

    pub fn trigger_type(&self) -> TriggerType {
        self.trigger
            .as_ref()
            .map(|t| t.trigger_type)
            .unwrap_or(TriggerType::Manual)
    }

    /// True when the local registry is the source side
    pub fn is_push_based(&self) -> bool {
        self.src_registry.is_none()
    }
}

/// Read access to the configured replication policies
#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn get(&self, id: i64) -> Result<Option<Policy>>;
    async fn list(&self) -> Result<Vec<Policy>>;
}

/// Policies loaded once from configuration
pub struct StaticPolicyStore {
    policies: Vec<Policy>,
}

impl StaticPolicyStore {
    pub fn new(policies: Vec<Policy>) -> Self {
        Self { policies }
    }
}

#[async_trait]
impl PolicyStore for StaticPolicyStore {
    async fn get(&self, id: i64) -> Result<Option<Policy>> {
        Ok(self.policies.iter().find(|p| p.id == id).cloned())
    }

    async fn list(&self) -> Result<Vec<Policy>> {
        Ok(self.policies.clone())
    }
}
