use config::{Config, ConfigError};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::time::Duration;

use crate::replication::adapter::ClientOptions;
use crate::replication::jobservice::LocalJobServiceConfig;
use crate::replication::model::{Credential, HealthStatus, Registry, REGISTRY_TYPE_NATIVE};
use crate::replication::policy::{Filter, Policy, Trigger};

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    /// Without a database the in-memory execution store is used
    #[serde(default)]
    pub database: Option<DatabaseSettings>,
    #[serde(default)]
    pub replication: ReplicationSettings,
    #[serde(default)]
    pub jobservice: JobServiceSettings,
    #[serde(default)]
    pub registries: Vec<RegistrySettings>,
    #[serde(default)]
    pub policies: Vec<PolicySettings>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// URL the job backend uses to reach the status hooks
    pub public_url: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseSettings {
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReplicationSettings {
    #[serde(default = "default_local_registry")]
    pub local_registry: RegistrySettings,
    /// Job submissions running in parallel within one flow
    #[serde(default = "default_submit_concurrency")]
    pub submit_concurrency: usize,
    #[serde(default = "default_token_latency_secs")]
    pub token_latency_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
    /// Shared secret expected on job status hooks
    #[serde(default)]
    pub hook_secret: Option<String>,
}

fn default_local_registry() -> RegistrySettings {
    RegistrySettings {
        id: 0,
        name: "local".to_string(),
        registry_type: REGISTRY_TYPE_NATIVE.to_string(),
        url: "http://localhost:5000".to_string(),
        core_url: None,
        credential: None,
        insecure: false,
    }
}

fn default_submit_concurrency() -> usize {
    8
}

fn default_token_latency_secs() -> u64 {
    10
}

fn default_connect_timeout_secs() -> u64 {
    30
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            local_registry: default_local_registry(),
            submit_concurrency: default_submit_concurrency(),
            token_latency_secs: default_token_latency_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: None,
            hook_secret: None,
        }
    }
}

/// Where replication jobs run
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum JobServiceSettings {
    /// Jobs run inside the backend process
    Local {
        #[serde(default = "default_max_workers")]
        max_workers: usize,
        #[serde(default = "default_max_retries")]
        max_retries: u32,
        #[serde(default = "default_retry_backoff_ms")]
        retry_backoff_ms: u64,
        #[serde(default)]
        timeout_secs: Option<u64>,
        /// How long logs of finished jobs stay readable
        #[serde(default = "default_finished_ttl_secs")]
        finished_ttl_secs: u64,
        #[serde(default = "default_max_finished")]
        max_finished: u64,
    },
    /// Jobs are submitted to an external job service
    Remote { endpoint: String, secret: String },
}

fn default_max_workers() -> usize {
    10
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_finished_ttl_secs() -> u64 {
    3600
}

fn default_max_finished() -> u64 {
    1000
}

impl Default for JobServiceSettings {
    fn default() -> Self {
        JobServiceSettings::Local {
            max_workers: default_max_workers(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            timeout_secs: None,
            finished_ttl_secs: default_finished_ttl_secs(),
            max_finished: default_max_finished(),
        }
    }
}

impl JobServiceSettings {
    pub fn local_config(&self) -> Option<LocalJobServiceConfig> {
        match self {
            JobServiceSettings::Local {
                max_workers,
                max_retries,
                retry_backoff_ms,
                timeout_secs,
                finished_ttl_secs,
                max_finished,
            } => Some(LocalJobServiceConfig {
                max_workers: *max_workers,
                max_retries: *max_retries,
                retry_backoff: Duration::from_millis(*retry_backoff_ms),
                timeout: timeout_secs.map(Duration::from_secs),
                finished_ttl: Duration::from_secs(*finished_ttl_secs),
                max_finished: *max_finished,
            }),
            JobServiceSettings::Remote { .. } => None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RegistrySettings {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub registry_type: String,
    pub url: String,
    #[serde(default)]
    pub core_url: Option<String>,
    #[serde(default)]
    pub credential: Option<Credential>,
    #[serde(default)]
    pub insecure: bool,
}

impl RegistrySettings {
    pub fn to_registry(&self) -> Registry {
        Registry {
            id: self.id,
            name: self.name.clone(),
            registry_type: self.registry_type.clone(),
            url: self.url.clone(),
            core_url: self.core_url.clone(),
            credential: self.credential.clone(),
            insecure: self.insecure,
            status: HealthStatus::Unknown,
        }
    }
}

/// Policy as configured, with registries referenced by name
#[derive(Debug, Deserialize, Clone)]
pub struct PolicySettings {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Registry name; absent means the local registry
    #[serde(default)]
    pub src_registry: Option<String>,
    #[serde(default)]
    pub dest_registry: Option<String>,
    #[serde(default)]
    pub src_namespaces: Vec<String>,
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
}

fn default_enabled() -> bool {
    true
}

impl Settings {
    /// Substitute environment variables in a string value
    /// Replaces ${VAR_NAME} or ${VAR_NAME:-default} with environment variable values
    fn substitute_env_vars_in_string(s: &str) -> String {
        lazy_static::lazy_static! {
            static ref ENV_VAR: regex::Regex =
                regex::Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").unwrap();
        }

        ENV_VAR
            .replace_all(s, |caps: &regex::Captures| {
                let var_name = &caps[1];
                let default_value = caps.get(2).map(|m| m.as_str());

                match env::var(var_name) {
                    Ok(val) => val,
                    Err(_) => default_value.unwrap_or("").to_string(),
                }
            })
            .to_string()
    }

    /// Convert a config::Value to a serde_json::Value, performing environment variable substitution
    fn config_value_to_json(value: &config::Value) -> serde_json::Value {
        use config::ValueKind;

        match &value.kind {
            ValueKind::Nil => serde_json::Value::Null,
            ValueKind::Boolean(b) => serde_json::Value::Bool(*b),
            ValueKind::I64(i) => serde_json::Value::Number((*i).into()),
            ValueKind::I128(i) => serde_json::Value::Number((*i as i64).into()),
            ValueKind::U64(u) => serde_json::Value::Number((*u).into()),
            ValueKind::U128(u) => serde_json::Value::Number((*u as u64).into()),
            ValueKind::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            ValueKind::String(s) => {
                serde_json::Value::String(Self::substitute_env_vars_in_string(s))
            }
            ValueKind::Table(table) => {
                let map = table
                    .iter()
                    .map(|(k, v)| (k.clone(), Self::config_value_to_json(v)))
                    .collect();
                serde_json::Value::Object(map)
            }
            ValueKind::Array(arr) => {
                serde_json::Value::Array(arr.iter().map(Self::config_value_to_json).collect())
            }
        }
    }

    /// Add `{dir}/{name}.{toml,yaml,yml}` to the builder.
    /// Returns Ok(false) when no such file exists and it is not required.
    fn try_add_config_file(
        builder: &mut config::ConfigBuilder<config::builder::DefaultState>,
        config_dir: &str,
        name: &str,
        required: bool,
    ) -> Result<bool, ConfigError> {
        for ext in ["toml", "yaml", "yml"] {
            let path = format!("{}/{}.{}", config_dir, name, ext);
            if std::path::Path::new(&path).exists() {
                tracing::info!("Loading config file: {}", path);
                *builder = builder
                    .clone()
                    .add_source(config::File::with_name(&format!("{}/{}", config_dir, name)));
                return Ok(true);
            }
        }

        if required {
            Err(ConfigError::Message(format!(
                "Required config file not found: {}/{}.{{toml,yaml,yml}}",
                config_dir, name
            )))
        } else {
            tracing::debug!(
                "Optional config file not found: {}/{}.{{toml,yaml,yml}}",
                config_dir,
                name
            );
            Ok(false)
        }
    }

    /// Load from `REPLICATOR_CONFIG_DIR` (default `config`) using
    /// `REPLICATOR_CONFIG_RUN_MODE` (default `development`)
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode =
            env::var("REPLICATOR_CONFIG_RUN_MODE").unwrap_or_else(|_| "development".into());
        let config_dir = env::var("REPLICATOR_CONFIG_DIR").unwrap_or_else(|_| "config".into());
        Self::load(&config_dir, &run_mode)
    }

    /// Load `default`, then `{run_mode}`, then `local` from `config_dir`
    pub fn load(config_dir: &str, run_mode: &str) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        Self::try_add_config_file(&mut builder, config_dir, "default", true)?;
        Self::try_add_config_file(&mut builder, config_dir, run_mode, false)?;
        Self::try_add_config_file(&mut builder, config_dir, "local", false)?;

        let config = builder.build()?;
        let root_value = config
            .cache
            .into_table()
            .map_err(|e| ConfigError::Message(format!("Failed to get config table: {}", e)))?;
        let json_value = serde_json::Value::Object(
            root_value
                .iter()
                .map(|(k, v)| (k.clone(), Self::config_value_to_json(v)))
                .collect(),
        );

        let mut unused_fields = Vec::new();
        let mut settings: Settings = serde_ignored::deserialize(json_value, |path| {
            unused_fields.push(path.to_string());
        })
        .map_err(|e| ConfigError::Message(format!("Failed to deserialize settings: {}", e)))?;

        for field in &unused_fields {
            tracing::warn!("Unknown configuration field in backend config: {}", field);
        }

        // DATABASE_URL takes precedence over the config files
        if let Ok(database_url) = env::var("DATABASE_URL") {
            if !database_url.is_empty() {
                let database = settings.database.get_or_insert(DatabaseSettings {
                    url: String::new(),
                    max_connections: default_max_connections(),
                });
                database.url = database_url;
            }
        }
        if settings
            .database
            .as_ref()
            .is_some_and(|db| db.url.is_empty())
        {
            return Err(ConfigError::Message(
                "Database URL not configured. Set DATABASE_URL or [database] url, or remove the [database] section".to_string(),
            ));
        }
        if settings.server.public_url.trim().is_empty() {
            return Err(ConfigError::Message(
                "server.public_url must be set so job status hooks can reach the backend"
                    .to_string(),
            ));
        }

        settings.policies()?;
        Ok(settings)
    }

    pub fn local_registry(&self) -> Registry {
        self.replication.local_registry.to_registry()
    }

    /// HTTP client tuning for the registry adapters
    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            connect_timeout: Duration::from_secs(self.replication.connect_timeout_secs),
            request_timeout: self.replication.request_timeout_secs.map(Duration::from_secs),
            token_latency: Duration::from_secs(self.replication.token_latency_secs),
            ..ClientOptions::default()
        }
    }

    /// Configured policies with registry references resolved and validated
    pub fn policies(&self) -> Result<Vec<Policy>, ConfigError> {
        let mut registries: HashMap<&str, Registry> = HashMap::new();
        for (index, r) in self.registries.iter().enumerate() {
            let mut registry = r.to_registry();
            if registry.id == 0 {
                registry.id = index as i64 + 1;
            }
            if registries.insert(r.name.as_str(), registry).is_some() {
                return Err(ConfigError::Message(format!(
                    "Duplicate registry name '{}'",
                    r.name
                )));
            }
        }
        let resolve = |policy: &str,
                       name: &Option<String>|
         -> Result<Option<Registry>, ConfigError> {
            match name {
                None => Ok(None),
                Some(name) => registries.get(name.as_str()).cloned().map(Some).ok_or_else(|| {
                    ConfigError::Message(format!(
                        "Policy '{}' references unknown registry '{}'",
                        policy, name
                    ))
                }),
            }
        };

        let mut policies = Vec::with_capacity(self.policies.len());
        for p in &self.policies {
            if policies.iter().any(|existing: &Policy| existing.id == p.id) {
                return Err(ConfigError::Message(format!("Duplicate policy id {}", p.id)));
            }
            let now = chrono::Utc::now();
            let policy = Policy {
                id: p.id,
                name: p.name.clone(),
                description: p.description.clone(),
                src_registry: resolve(&p.name, &p.src_registry)?,
                dest_registry: resolve(&p.name, &p.dest_registry)?,
                src_namespaces: p.src_namespaces.clone(),
                dest_namespace: p.dest_namespace.clone(),
                filters: p.filters.clone(),
                trigger: p.trigger.clone(),
                deletion: p.deletion,
                override_existing: p.override_existing,
                enabled: p.enabled,
                creation_time: now,
                update_time: now,
            };
            policy.validate().map_err(|e| {
                ConfigError::Message(format!("Policy '{}' is invalid: {}", p.name, e))
            })?;
            policies.push(policy);
        }
        Ok(policies)
    }
}
