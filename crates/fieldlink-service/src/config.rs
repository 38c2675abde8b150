//! Server configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP server settings.
    pub server: ServerConfig,
    /// Storage settings.
    pub storage: StorageConfig,
    /// Account token settings.
    pub auth: AuthConfig,
    /// Device session settings.
    pub session: SessionConfig,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = default_config_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Save configuration to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Write {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Validate the configuration and return any errors.
    ///
    /// This checks:
    /// - Bind addresses are in host:port format with a non-zero port
    /// - Storage path is not empty
    /// - A configured JWT secret is at least [`MIN_JWT_SECRET_LEN`] characters
    /// - Token lifetime, auth timeout and frame limit are within bounds
    ///
    /// # Example
    ///
    /// ```
    /// use fieldlink_service::Config;
    ///
    /// let config = Config::default();
    /// config.validate().expect("Default config should be valid");
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        errors.extend(self.server.validate());
        errors.extend(self.storage.validate());
        errors.extend(self.auth.validate());
        errors.extend(self.session.validate());

        if let Some(tcp_bind) = &self.session.tcp_bind
            && tcp_bind == &self.server.bind
        {
            errors.push(ValidationError {
                field: "session.tcp_bind".to_string(),
                message: format!("'{}' is already used by server.bind", tcp_bind),
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Load and validate configuration from a file.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }
}

/// Check a `host:port` bind address.
fn validate_bind(field: &str, bind: &str) -> Option<ValidationError> {
    let error = |message: String| {
        Some(ValidationError {
            field: field.to_string(),
            message,
        })
    };

    if bind.is_empty() {
        return error("bind address cannot be empty".to_string());
    }

    let Some((_, port)) = bind.rsplit_once(':') else {
        return error(format!(
            "invalid bind address '{}': expected format 'host:port'",
            bind
        ));
    };

    match port.parse::<u16>() {
        Ok(0) => error("port cannot be 0".to_string()),
        Ok(_) => None,
        Err(_) => error(format!("invalid port '{}': must be a number 1-65535", port)),
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address for the REST API and the `/ws` device endpoint.
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:3000".to_string(),
        }
    }
}

impl ServerConfig {
    /// Validate server configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        validate_bind("server.bind", &self.bind).into_iter().collect()
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Database file path.
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: fieldlink_store::default_db_path(),
        }
    }
}

impl StorageConfig {
    /// Validate storage configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.path.as_os_str().is_empty() {
            errors.push(ValidationError {
                field: "storage.path".to_string(),
                message: "database path cannot be empty".to_string(),
            });
        }

        errors
    }
}

/// Minimum JWT secret length in characters.
pub const MIN_JWT_SECRET_LEN: usize = 16;
/// Maximum bearer token lifetime in seconds (30 days).
pub const MAX_TOKEN_TTL_SECS: u64 = 30 * 24 * 3600;

/// Account token configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HMAC secret for signing bearer tokens.
    ///
    /// When unset an ephemeral secret is generated at startup and tokens do
    /// not survive a restart.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwt_secret: Option<String>,
    /// Bearer token lifetime in seconds.
    pub token_ttl_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            token_ttl_secs: 3600,
        }
    }
}

impl AuthConfig {
    /// Validate auth configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if let Some(secret) = &self.jwt_secret
            && secret.chars().count() < MIN_JWT_SECRET_LEN
        {
            errors.push(ValidationError {
                field: "auth.jwt_secret".to_string(),
                message: format!(
                    "secret is too short (minimum {} characters)",
                    MIN_JWT_SECRET_LEN
                ),
            });
        }

        if self.token_ttl_secs == 0 {
            errors.push(ValidationError {
                field: "auth.token_ttl_secs".to_string(),
                message: "token lifetime cannot be 0".to_string(),
            });
        } else if self.token_ttl_secs > MAX_TOKEN_TTL_SECS {
            errors.push(ValidationError {
                field: "auth.token_ttl_secs".to_string(),
                message: format!(
                    "token lifetime {} is too long (maximum {} seconds / 30 days)",
                    self.token_ttl_secs, MAX_TOKEN_TTL_SECS
                ),
            });
        }

        errors
    }
}

/// Minimum accepted frame size in bytes.
pub const MIN_FRAME_BYTES: usize = 256;
/// Maximum accepted frame size in bytes.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;
/// Maximum auth timeout in seconds (10 minutes).
pub const MAX_AUTH_TIMEOUT_SECS: u64 = 600;

/// Device session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Seconds a connection may stay unauthenticated before it is closed.
    pub auth_timeout_secs: u64,
    /// Bind address for the raw TCP (newline-delimited JSON) listener.
    /// Disabled when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_bind: Option<String>,
    /// Longest accepted line or text frame in bytes.
    pub max_frame_bytes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auth_timeout_secs: 30,
            tcp_bind: None,
            max_frame_bytes: 8192,
        }
    }
}

impl SessionConfig {
    /// Validate session configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.auth_timeout_secs == 0 {
            errors.push(ValidationError {
                field: "session.auth_timeout_secs".to_string(),
                message: "auth timeout cannot be 0".to_string(),
            });
        } else if self.auth_timeout_secs > MAX_AUTH_TIMEOUT_SECS {
            errors.push(ValidationError {
                field: "session.auth_timeout_secs".to_string(),
                message: format!(
                    "auth timeout {} is too long (maximum {} seconds)",
                    self.auth_timeout_secs, MAX_AUTH_TIMEOUT_SECS
                ),
            });
        }

        if let Some(tcp_bind) = &self.tcp_bind {
            errors.extend(validate_bind("session.tcp_bind", tcp_bind));
        }

        if !(MIN_FRAME_BYTES..=MAX_FRAME_BYTES).contains(&self.max_frame_bytes) {
            errors.push(ValidationError {
                field: "session.max_frame_bytes".to_string(),
                message: format!(
                    "frame limit {} is out of range ({}-{} bytes)",
                    self.max_frame_bytes, MIN_FRAME_BYTES, MAX_FRAME_BYTES
                ),
            });
        }

        errors
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),
    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation error with context.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The field path (e.g., `server.bind` or `session.tcp_bind`).
    pub field: String,
    /// Description of the validation failure.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fieldlink")
        .join("server.toml")
}
