use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

pub const REGISTRY_TYPE_HARBOR: &str = "harbor";
pub const REGISTRY_TYPE_DOCKER_HUB: &str = "docker-hub";
pub const REGISTRY_TYPE_HUAWEI: &str = "huawei-SWR";
pub const REGISTRY_TYPE_NATIVE: &str = "native";

/// Kind of credential presented to a registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialType {
    Basic,
    Secret,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    #[serde(rename = "type")]
    pub credential_type: CredentialType,
    #[serde(default)]
    pub access_key: String,
    #[serde(default)]
    pub access_secret: String,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("credential_type", &self.credential_type)
            .field("access_key", &self.access_key)
            .field("access_secret", &"***")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    #[default]
    Unknown,
}

/// A registry endpoint taking part in replication
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registry {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub registry_type: String,
    pub url: String,
    /// Harbor core URL, used for API calls and the token service when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub core_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<Credential>,
    #[serde(default)]
    pub insecure: bool,
    #[serde(default)]
    pub status: HealthStatus,
}

impl Registry {
    /// Base URL used for vendor API calls
    pub fn api_url(&self) -> &str {
        self.core_url
            .as_deref()
            .filter(|u| !u.is_empty())
            .unwrap_or(&self.url)
            .trim_end_matches('/')
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Repository,
    Chart,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Repository => "repository",
            ResourceType::Chart => "chart",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "repository" => Ok(ResourceType::Repository),
            "chart" => Ok(ResourceType::Chart),
            other => Err(format!("unknown resource type '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Namespace {
    pub name: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Namespace {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            metadata: HashMap::new(),
        }
    }
}

/// Query used when listing namespaces on an adapter
#[derive(Debug, Clone, Default)]
pub struct NamespaceQuery {
    /// Substring/exact name match, vendor dependent
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<Namespace>,
    /// Repository or chart name relative to the namespace
    pub name: String,
    #[serde(default)]
    pub vtags: Vec<String>,
    #[serde(default)]
    pub labels: Vec<String>,
}

impl ResourceMetadata {
    /// Namespace-qualified name of the resource
    pub fn resource_name(&self) -> String {
        match &self.namespace {
            Some(ns) if !ns.name.is_empty() => {
                if self.name.is_empty() {
                    ns.name.clone()
                } else {
                    format!("{}/{}", ns.name, self.name)
                }
            }
            _ => self.name.clone(),
        }
    }

    pub fn namespace_name(&self) -> Option<&str> {
        self.namespace
            .as_ref()
            .map(|ns| ns.name.as_str())
            .filter(|n| !n.is_empty())
    }

    /// Build metadata from a full repository path, treating the first
    /// segment as the namespace.
    pub fn from_repository_path(path: &str) -> Self {
        match path.split_once('/') {
            Some((ns, rest)) => Self {
                namespace: Some(Namespace::new(ns)),
                name: rest.to_string(),
                ..Default::default()
            },
            None => Self {
                namespace: None,
                name: path.to_string(),
                ..Default::default()
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    #[serde(rename = "type")]
    pub resource_type: ResourceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<Registry>,
    pub metadata: ResourceMetadata,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extended_info: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default, rename = "override")]
    pub override_existing: bool,
    /// Reason this resource cannot be scheduled
    #[serde(skip)]
    pub invalid: Option<String>,
}

impl Resource {
    pub fn new(resource_type: ResourceType, metadata: ResourceMetadata) -> Self {
        Self {
            resource_type,
            registry: None,
            metadata,
            extended_info: HashMap::new(),
            deleted: false,
            override_existing: false,
            invalid: None,
        }
    }

    pub fn repository(path: &str, vtags: &[&str]) -> Self {
        let mut metadata = ResourceMetadata::from_repository_path(path);
        metadata.vtags = vtags.iter().map(|t| t.to_string()).collect();
        Self::new(ResourceType::Repository, metadata)
    }

    pub fn name(&self) -> String {
        self.metadata.resource_name()
    }

    pub fn is_invalid(&self) -> bool {
        self.invalid.is_some()
    }

    /// Render as `name:[t1,t2]`, abbreviating long tag lists
    pub fn display_name(&self) -> String {
        const MAX_TAGS: usize = 5;
        let name = self.name();
        let tags = &self.metadata.vtags;
        if tags.len() > MAX_TAGS {
            format!(
                "{}:[{} ... {} in total]",
                name,
                tags[..MAX_TAGS].join(","),
                tags.len()
            )
        } else {
            format!("{}:[{}]", name, tags.join(","))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterStyle {
    #[serde(rename = "type")]
    pub filter_type: String,
    pub style: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

/// Static description of an adapter's capabilities
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryInfo {
    #[serde(rename = "type")]
    pub registry_type: String,
    pub description: String,
    pub supported_resource_types: Vec<ResourceType>,
    pub supported_resource_filters: Vec<FilterStyle>,
    pub supported_triggers: Vec<super::policy::TriggerType>,
}
