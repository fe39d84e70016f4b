use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub protocol: ProtocolConfig,
    pub session: SessionConfig,
    pub authorization: AuthorizationConfig,
    pub tasks: TaskConfig,
    pub elicitation: ElicitationConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub enable_cors: bool,
    pub enable_sse: bool,
    #[serde(with = "duration_string")]
    pub request_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            enable_cors: true,
            enable_sse: true,
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProtocolConfig {
    pub protocol_version: String,
    pub supported_versions: Vec<String>,
    pub server_name: String,
    pub server_version: String,
    pub instructions: Option<String>,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            protocol_version: "2025-06-18".to_string(),
            supported_versions: vec![
                "2025-06-18".to_string(),
                "2025-03-26".to_string(),
                "2024-11-05".to_string(),
                "draft".to_string(),
            ],
            server_name: "portico".to_string(),
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            instructions: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Sessions idle past this are swept.
    #[serde(with = "duration_string")]
    pub idle_ttl: Duration,
    /// Interval between sweeper passes.
    #[serde(with = "duration_string")]
    pub sweep_interval: Duration,
    /// SSE comment-frame heartbeat.
    #[serde(with = "duration_string")]
    pub heartbeat_interval: Duration,
    /// Outbound queue size per stream; saturation detaches the stream.
    pub stream_queue_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_ttl: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(30),
            stream_queue_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthorizationConfig {
    pub enabled: bool,
    /// Canonical resource URI; audience checks and discovery metadata use it.
    pub resource_uri: String,
    pub realm: String,
    pub jwks_uri: Option<String>,
    pub introspection_endpoint: Option<String>,
    pub validate_audience: bool,
    /// Scopes every request must carry; empty disables scope enforcement.
    pub required_scopes: Vec<String>,
    /// Tokens expiring within this window trigger a refresh attempt.
    #[serde(with = "duration_string")]
    pub refresh_window: Duration,
    pub max_refresh_attempts: u32,
}

impl Default for AuthorizationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            resource_uri: "http://localhost:3000".to_string(),
            realm: "MCP Server".to_string(),
            jwks_uri: None,
            introspection_endpoint: None,
            validate_audience: false,
            required_scopes: Vec::new(),
            refresh_window: Duration::from_secs(120),
            max_refresh_attempts: 3,
        }
    }
}

impl AuthorizationConfig {
    /// Discovery URL advertised in `WWW-Authenticate` challenges.
    pub fn resource_metadata_url(&self) -> String {
        format!(
            "{}/.well-known/oauth-protected-resource",
            self.resource_uri.trim_end_matches('/')
        )
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TaskConfig {
    pub enabled: bool,
    #[serde(with = "duration_string")]
    pub default_ttl: Duration,
    #[serde(with = "duration_string")]
    pub max_ttl: Duration,
    /// Suggested client polling cadence, milliseconds.
    pub poll_interval_ms: Option<u64>,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl: Duration::from_secs(5 * 60),
            max_ttl: Duration::from_secs(24 * 60 * 60),
            poll_interval_ms: Some(1000),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ElicitationConfig {
    #[serde(with = "duration_string")]
    pub record_ttl: Duration,
}

impl Default for ElicitationConfig {
    fn default() -> Self {
        Self {
            record_ttl: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Defaults overridden by environment variables.
    pub fn load() -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Ok(host) = std::env::var("PORTICO_HOST") {
            config.server.host = host;
        }
        if let Ok(port) = std::env::var("PORTICO_PORT") {
            config.server.port = port.parse()?;
        }
        if let Ok(uri) = std::env::var("PORTICO_RESOURCE_URI") {
            config.authorization.resource_uri = uri;
        }
        if let Ok(jwks) = std::env::var("PORTICO_JWKS_URI") {
            config.authorization.jwks_uri = Some(jwks);
            config.authorization.enabled = true;
        }
        if let Ok(endpoint) = std::env::var("PORTICO_INTROSPECTION_ENDPOINT") {
            config.authorization.introspection_endpoint = Some(endpoint);
            config.authorization.enabled = true;
        }

        Ok(config)
    }
}

// Helper module for duration serialization ("30s" style strings).
mod duration_string {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = format!("{}s", duration.as_secs());
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        if let Some(stripped) = s.strip_suffix('s') {
            let secs: u64 = stripped.parse().map_err(serde::de::Error::custom)?;
            Ok(Duration::from_secs(secs))
        } else {
            Err(serde::de::Error::custom(
                "Expected duration string ending with 's'",
            ))
        }
    }
}
