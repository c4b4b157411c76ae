//! Transport configuration.
//!
//! Configurations can be built in code or loaded from JSON, YAML, or TOML
//! files. Durations use humantime notation (`"30s"`, `"1m"`) in files.
//!
//! # Examples
//!
//! ```rust
//! use mcp_duplex::transport::{AuthConfig, SseClientConfig, SseServerConfig, TransportConfig};
//! use std::time::Duration;
//!
//! let client = TransportConfig::SseClient(
//!     SseClientConfig::new("http://localhost:3000/sse".parse().unwrap())
//!         .timeout(Duration::from_secs(10))
//!         .auth(AuthConfig::bearer("secret")),
//! );
//! assert_eq!(client.transport_type(), "sse-client");
//!
//! let server = TransportConfig::SseServer(SseServerConfig::default());
//! assert!(server.validate().is_ok());
//! ```

use crate::error::{ConfigError, McpResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use url::Url;

/// Configuration for one of the HTTP+SSE transport halves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportConfig {
    /// Client half: opens the event stream and POSTs messages
    SseClient(SseClientConfig),

    /// Server half: serves the event stream and accepts POSTs
    SseServer(SseServerConfig),
}

impl TransportConfig {
    /// Create a client configuration from a stream URL.
    ///
    /// ```rust
    /// use mcp_duplex::transport::TransportConfig;
    ///
    /// let config = TransportConfig::sse_client("http://localhost:3000/sse").unwrap();
    /// assert!(TransportConfig::sse_client("not a url").is_err());
    /// ```
    pub fn sse_client(url: impl AsRef<str>) -> McpResult<Self> {
        let url = url
            .as_ref()
            .parse()
            .map_err(|e| ConfigError::InvalidValue {
                parameter: "url".to_string(),
                value: url.as_ref().to_string(),
                reason: format!("Invalid URL: {}", e),
            })?;

        Ok(Self::SseClient(SseClientConfig::new(url)))
    }

    /// Create a server configuration bound to `bind`.
    pub fn sse_server(bind: SocketAddr) -> Self {
        Self::SseServer(SseServerConfig {
            bind,
            ..Default::default()
        })
    }

    /// Get a human-readable name for this transport type.
    pub fn transport_type(&self) -> &'static str {
        match self {
            Self::SseClient(_) => "sse-client",
            Self::SseServer(_) => "sse-server",
        }
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> McpResult<()> {
        match self {
            Self::SseClient(config) => config.validate(),
            Self::SseServer(config) => config.validate(),
        }
    }

    /// Load configuration from a file.
    ///
    /// The format follows the file extension: `.json`, `.yaml`/`.yml`, or
    /// `.toml`. The loaded configuration is validated before it is returned.
    pub fn from_file(path: impl AsRef<Path>) -> McpResult<Self> {
        let config: Self = read_config_file(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a file, picking the format from the extension.
    pub fn to_file(&self, path: impl AsRef<Path>) -> McpResult<()> {
        let path = path.as_ref();
        let invalid = |reason: String| ConfigError::InvalidFormat {
            path: path.display().to_string(),
            reason,
        };

        let content = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::to_string_pretty(self).map_err(|e| invalid(e.to_string()))?,
            Some("yaml") | Some("yml") => {
                serde_yaml::to_string(self).map_err(|e| invalid(e.to_string()))?
            }
            Some("toml") => toml::to_string(self).map_err(|e| invalid(e.to_string()))?,
            _ => return Err(invalid(unsupported_format()).into()),
        };

        std::fs::write(path, content)?;

        Ok(())
    }
}

/// Parse a config file, picking the format from its extension.
pub(crate) fn read_config_file<T: DeserializeOwned>(path: &Path) -> McpResult<T> {
    let content = std::fs::read_to_string(path).map_err(|_e| ConfigError::FileNotFound {
        path: path.display().to_string(),
    })?;

    let invalid = |reason: String| ConfigError::InvalidFormat {
        path: path.display().to_string(),
        reason,
    };

    let config = match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => serde_json::from_str(&content).map_err(|e| invalid(e.to_string()))?,
        Some("yaml") | Some("yml") => {
            serde_yaml::from_str(&content).map_err(|e| invalid(e.to_string()))?
        }
        Some("toml") => toml::from_str(&content).map_err(|e| invalid(e.to_string()))?,
        _ => return Err(invalid(unsupported_format()).into()),
    };
    Ok(config)
}

fn unsupported_format() -> String {
    "Unsupported file format. Use .json, .yaml, or .toml".to_string()
}

/// Configuration for the client half of the HTTP+SSE transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SseClientConfig {
    /// URL of the server's event stream
    pub url: Url,

    /// Timeout applied to each outbound POST
    #[serde(with = "humantime_serde", default = "default_client_timeout")]
    pub timeout: Duration,

    /// Extra headers sent with the stream GET and every POST
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Authentication applied to both the GET and the POSTs
    #[serde(default)]
    pub auth: Option<AuthConfig>,
}

fn default_client_timeout() -> Duration {
    Duration::from_secs(60)
}

impl SseClientConfig {
    /// Create a configuration for the stream at `url`.
    pub fn new(url: Url) -> Self {
        Self {
            url,
            timeout: default_client_timeout(),
            headers: HashMap::new(),
            auth: None,
        }
    }

    /// Set the POST timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Add an HTTP header.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Set authentication configuration.
    pub fn auth(mut self, auth: AuthConfig) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Validate the client configuration.
    pub fn validate(&self) -> McpResult<()> {
        if self.url.scheme() != "http" && self.url.scheme() != "https" {
            return Err(ConfigError::InvalidValue {
                parameter: "url".to_string(),
                value: self.url.to_string(),
                reason: "URL must use http or https scheme".to_string(),
            }
            .into());
        }

        if self.timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                parameter: "timeout".to_string(),
                value: "0s".to_string(),
                reason: "Timeout must be greater than 0".to_string(),
            }
            .into());
        }

        if let Some(ref auth) = self.auth {
            auth.validate()?;
        }

        Ok(())
    }
}

/// Configuration for the server half of the HTTP+SSE transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SseServerConfig {
    /// Address the HTTP server listens on
    pub bind: SocketAddr,

    /// Path serving the event stream
    pub sse_path: String,

    /// Path accepting POSTed messages; announced to clients in the endpoint
    /// event
    pub message_path: String,

    /// Largest accepted POST body in bytes
    pub max_body_bytes: usize,

    /// Interval between keep-alive comments on idle streams
    #[serde(with = "humantime_serde")]
    pub keep_alive: Duration,
}

impl Default for SseServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 3000)),
            sse_path: "/sse".to_string(),
            message_path: "/messages".to_string(),
            max_body_bytes: 4 * 1024 * 1024,
            keep_alive: Duration::from_secs(15),
        }
    }
}

impl SseServerConfig {
    /// Validate the server configuration.
    pub fn validate(&self) -> McpResult<()> {
        for (parameter, path) in [("sse_path", &self.sse_path), ("message_path", &self.message_path)] {
            if !path.starts_with('/') {
                return Err(ConfigError::InvalidValue {
                    parameter: parameter.to_string(),
                    value: path.clone(),
                    reason: "Path must start with '/'".to_string(),
                }
                .into());
            }
        }

        if self.sse_path == self.message_path {
            return Err(ConfigError::InvalidValue {
                parameter: "message_path".to_string(),
                value: self.message_path.clone(),
                reason: "Stream and message paths must differ".to_string(),
            }
            .into());
        }

        if self.max_body_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                parameter: "max_body_bytes".to_string(),
                value: "0".to_string(),
                reason: "Body limit must be greater than 0".to_string(),
            }
            .into());
        }

        Ok(())
    }
}

/// Authentication for the client half.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum AuthConfig {
    /// `Authorization: Bearer <token>`
    Bearer { token: String },

    /// Arbitrary header carrying a credential
    Header { name: String, value: String },
}

impl AuthConfig {
    /// Create a bearer token authentication configuration.
    pub fn bearer(token: impl Into<String>) -> Self {
        Self::Bearer {
            token: token.into(),
        }
    }

    /// Create a custom header authentication configuration.
    pub fn header(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Header {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Validate the authentication configuration.
    pub fn validate(&self) -> McpResult<()> {
        match self {
            Self::Bearer { token } => {
                if token.is_empty() {
                    return Err(ConfigError::InvalidValue {
                        parameter: "auth".to_string(),
                        value: "bearer".to_string(),
                        reason: "Token cannot be empty".to_string(),
                    }
                    .into());
                }
            }
            Self::Header { name, value } => {
                if name.is_empty() || value.is_empty() {
                    return Err(ConfigError::InvalidValue {
                        parameter: "auth".to_string(),
                        value: "header".to_string(),
                        reason: "Header name and value cannot be empty".to_string(),
                    }
                    .into());
                }
            }
        }
        Ok(())
    }
}
