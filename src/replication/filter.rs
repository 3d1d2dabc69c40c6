use glob::{MatchOptions, Pattern};
use std::collections::HashSet;

use super::model::{Resource, ResourceType};
use super::policy::{Filter, FilterType};

#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("unsupported filter type '{0}'")]
    UnknownType(String),
    #[error("invalid value for {filter_type} filter: {reason}")]
    InvalidValue {
        filter_type: FilterType,
        reason: String,
    },
}

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Match `value` against a doublestar-style glob: `*` stays inside one path
/// segment, `**` crosses segments.
pub fn glob_match(pattern: &str, value: &str) -> Result<bool, glob::PatternError> {
    Ok(Pattern::new(pattern)?.matches_with(value, MATCH_OPTIONS))
}

#[derive(Debug, Clone)]
enum ResourceFilter {
    Resource(ResourceType),
    Name(Pattern),
    Tag(Pattern),
    Label(Vec<String>),
}

impl ResourceFilter {
    fn from_filter(filter: &Filter) -> Result<Option<Self>, FilterError> {
        let invalid = |reason: String| FilterError::InvalidValue {
            filter_type: filter.filter_type.clone(),
            reason,
        };
        let pattern = || -> Result<Option<Pattern>, FilterError> {
            let value = filter
                .value
                .as_str()
                .ok_or_else(|| invalid("expected a string pattern".to_string()))?;
            if value.is_empty() {
                return Ok(None);
            }
            Pattern::new(value)
                .map(Some)
                .map_err(|e| invalid(format!("'{}': {}", value, e)))
        };

        let built = match &filter.filter_type {
            FilterType::Resource => {
                let value = filter
                    .value
                    .as_str()
                    .ok_or_else(|| invalid("expected a resource type string".to_string()))?;
                Some(ResourceFilter::Resource(
                    value.parse::<ResourceType>().map_err(invalid)?,
                ))
            }
            FilterType::Name => pattern()?.map(ResourceFilter::Name),
            FilterType::Tag => pattern()?.map(ResourceFilter::Tag),
            FilterType::Label => {
                let labels = match &filter.value {
                    serde_json::Value::String(s) if s.is_empty() => vec![],
                    serde_json::Value::String(s) => vec![s.clone()],
                    serde_json::Value::Array(items) => items
                        .iter()
                        .map(|v| {
                            v.as_str()
                                .map(str::to_string)
                                .ok_or_else(|| invalid("labels must be strings".to_string()))
                        })
                        .collect::<Result<Vec<_>, _>>()?,
                    _ => return Err(invalid("expected a label or a list of labels".to_string())),
                };
                if labels.is_empty() {
                    None
                } else {
                    Some(ResourceFilter::Label(labels))
                }
            }
            FilterType::Unknown(other) => return Err(FilterError::UnknownType(other.clone())),
        };
        Ok(built)
    }

    /// Returns false to drop the resource. The tag filter narrows `vtags`.
    fn apply(&self, resource: &mut Resource) -> bool {
        match self {
            ResourceFilter::Resource(t) => resource.resource_type == *t,
            ResourceFilter::Name(pattern) => pattern.matches_with(&resource.name(), MATCH_OPTIONS),
            ResourceFilter::Tag(pattern) => {
                resource
                    .metadata
                    .vtags
                    .retain(|tag| pattern.matches_with(tag, MATCH_OPTIONS));
                !resource.metadata.vtags.is_empty()
            }
            ResourceFilter::Label(required) => {
                let present: HashSet<&str> =
                    resource.metadata.labels.iter().map(String::as_str).collect();
                required.iter().all(|l| present.contains(l.as_str()))
            }
        }
    }
}

/// Ordered conjunction of resource filters built from policy filters
#[derive(Debug, Clone, Default)]
pub struct FilterChain {
    filters: Vec<ResourceFilter>,
}

impl FilterChain {
    pub fn new(filters: &[Filter]) -> Result<Self, FilterError> {
        let mut built = Vec::with_capacity(filters.len());
        for filter in filters {
            if let Some(f) = ResourceFilter::from_filter(filter)? {
                built.push(f);
            }
        }
        Ok(Self { filters: built })
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Resource types named by `resource` filters, if any
    pub fn resource_types(&self) -> Vec<ResourceType> {
        let mut types = Vec::new();
        for f in &self.filters {
            if let ResourceFilter::Resource(t) = f {
                if !types.contains(t) {
                    types.push(*t);
                }
            }
        }
        types
    }

    pub fn matches(&self, resource: &mut Resource) -> bool {
        self.filters.iter().all(|f| f.apply(resource))
    }

    pub fn apply(&self, resources: Vec<Resource>) -> Vec<Resource> {
        resources
            .into_iter()
            .filter_map(|mut r| self.matches(&mut r).then_some(r))
            .collect()
    }
}

/// Name pattern from the first non-empty `name` filter, used by adapters to
/// narrow listings before the chain runs.
pub fn name_pattern(filters: &[Filter]) -> Option<&str> {
    filters
        .iter()
        .filter(|f| f.filter_type == FilterType::Name)
        .filter_map(|f| f.value.as_str())
        .find(|v| !v.is_empty())
}

/// True when the repository path could match the name filters in `filters`
pub fn name_allowed(filters: &[Filter], name: &str) -> bool {
    match name_pattern(filters) {
        Some(pattern) => glob_match(pattern, name).unwrap_or(true),
        None => true,
    }
}
