use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::RelayError;

/// Environment variables carrying the two connectivity values.
pub const ENDPOINT_ENV: &str = "COSMOS_ENDPOINT";
pub const KEY_ENV: &str = "COSMOS_KEY";
pub const CONNECTION_STRING_ENV: &str = "COSMOS_CONNECTION_STRING";

/// Paths the host adapter serves itself; the invocation route may not take them.
pub const RESERVED_ROUTES: [&str; 3] = ["messages", "health", "version"];

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RelayConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServiceConfig {
    pub log_level: String,
    /// Route the functions host posts queue-trigger invocations to.
    pub function_name: String,
    /// Name of the queue-trigger binding inside the invocation `Data` object.
    pub binding: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            function_name: "QueueMessage".to_string(),
            binding: "message".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Cosmos,
    Postgres,
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Account endpoint (Cosmos) or connection URL (Postgres).
    pub endpoint: String,
    /// Account master key (Cosmos) or password (Postgres).
    pub key: String,
    pub database: String,
    /// Document field whose value is sent as the partition key.
    pub partition_key: String,
    pub max_connections: u32,
    pub containers: ContainersConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Cosmos,
            endpoint: String::new(),
            key: String::new(),
            database: "openmw_conv".to_string(),
            partition_key: "id".to_string(),
            max_connections: 5,
            containers: ContainersConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ContainersConfig {
    pub api_output: String,
    pub input: String,
    pub output: String,
}

impl Default for ContainersConfig {
    fn default() -> Self {
        Self {
            api_output: "api_output".to_string(),
            input: "js_input".to_string(),
            output: "js_output".to_string(),
        }
    }
}

impl ContainersConfig {
    pub fn names(&self) -> [&str; 3] {
        [
            self.api_output.as_str(),
            self.input.as_str(),
            self.output.as_str(),
        ]
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7071,
        }
    }
}

impl RelayConfig {
    /// Load from an optional TOML file layered under `RELAY_*` environment
    /// variables, then resolve the connectivity values and validate them.
    pub fn load(path: Option<&str>) -> Result<Self, RelayError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path).required(false));
        }
        let s = builder
            .add_source(
                Environment::with_prefix("RELAY")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let mut config: RelayConfig = s.try_deserialize()?;

        config.store.apply_connection_settings(
            std::env::var(ENDPOINT_ENV).ok(),
            std::env::var(KEY_ENV).ok(),
            std::env::var(CONNECTION_STRING_ENV).ok(),
        );
        config.validate()?;
        Ok(config)
    }

    /// The invocation route must be a single free path segment; endpoint and
    /// key are required for every networked backend.
    pub fn validate(&self) -> Result<(), RelayError> {
        self.service.validate()?;
        if self.store.backend == StoreBackend::Memory {
            return Ok(());
        }
        if self.store.endpoint.trim().is_empty() {
            return Err(RelayError::MissingSetting("store.endpoint (COSMOS_ENDPOINT)"));
        }
        if self.store.key.trim().is_empty() {
            return Err(RelayError::MissingSetting("store.key (COSMOS_KEY)"));
        }
        Ok(())
    }
}

impl ServiceConfig {
    pub fn validate(&self) -> Result<(), RelayError> {
        let name = self.function_name.as_str();
        let invalid = |reason: String| RelayError::InvalidSetting {
            setting: "service.function_name",
            reason,
        };

        if name.is_empty() {
            return Err(invalid("must not be empty".to_string()));
        }
        if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
            return Err(invalid(format!("'{}' is not a single path segment", name)));
        }
        if RESERVED_ROUTES.iter().any(|r| r.eq_ignore_ascii_case(name)) {
            return Err(invalid(format!("'{}' collides with a built-in route", name)));
        }
        Ok(())
    }
}

impl StoreConfig {
    /// Explicit endpoint/key variables win over a connection string, which
    /// wins over values from the config file.
    pub fn apply_connection_settings(
        &mut self,
        endpoint: Option<String>,
        key: Option<String>,
        connection_string: Option<String>,
    ) {
        if let Some((cs_endpoint, cs_key)) =
            connection_string.as_deref().and_then(parse_connection_string)
        {
            self.endpoint = cs_endpoint;
            self.key = cs_key;
        }
        if let Some(endpoint) = endpoint.filter(|v| !v.trim().is_empty()) {
            self.endpoint = endpoint;
        }
        if let Some(key) = key.filter(|v| !v.trim().is_empty()) {
            self.key = key;
        }
    }
}

/// Parse `AccountEndpoint=...;AccountKey=...;` into `(endpoint, key)`.
pub fn parse_connection_string(raw: &str) -> Option<(String, String)> {
    let mut endpoint = None;
    let mut key = None;
    for part in raw.split(';') {
        let Some((name, value)) = part.trim().split_once('=') else {
            continue;
        };
        if name.eq_ignore_ascii_case("AccountEndpoint") {
            endpoint = Some(value.trim().to_string());
        } else if name.eq_ignore_ascii_case("AccountKey") {
            key = Some(value.trim().to_string());
        }
    }
    Some((endpoint?, key?))
}
