//! TOML Configuration File Support
//!
//! Client configuration for the coaching backend, with a TOML file at
//! `~/.config/coach-chat/client.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments (via [`ConfigOverrides`])
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # XDG Base Directory Compliance
//!
//! - `$XDG_CONFIG_HOME/coach-chat/client.toml` (typically `~/.config/coach-chat/client.toml`)
//!
//! # Example Configuration
//!
//! ```toml
//! [backend]
//! base_url = "https://coach.example.org"
//! connect_timeout_ms = 5000
//! bearer_token = "..."
//!
//! [chat]
//! default_agent = "classroom_curriculum"
//!
//! [stream]
//! idle_timeout_secs = 90
//! max_frame_bytes = 1048576
//! update_buffer = 256
//! ```
//!
//! # Environment Variables
//!
//! | Variable | Field |
//! |---|---|
//! | `COACH_BACKEND_URL` | `base_url` |
//! | `COACH_CONNECT_TIMEOUT_MS` | `connect_timeout` |
//! | `COACH_API_TOKEN` | `bearer_token` |
//! | `COACH_AGENT` | `default_agent` |
//! | `COACH_IDLE_TIMEOUT_SECS` | `idle_timeout` (0 disables) |
//! | `COACH_MAX_FRAME_BYTES` | `max_frame_bytes` |

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::messages::AgentId;
use crate::session::StreamOptions;
use crate::streaming::DEFAULT_MAX_FRAME_BYTES;

/// Default backend address
pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Backend section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendToml {
    /// Backend base URL
    pub base_url: Option<String>,

    /// Connection timeout in milliseconds
    pub connect_timeout_ms: Option<u64>,

    /// Bearer token sent with every request
    pub bearer_token: Option<String>,
}

/// Chat section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatToml {
    /// Agent selected at startup
    pub default_agent: Option<String>,
}

/// Stream section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamToml {
    /// Seconds without bytes before a request is cancelled (0 = never)
    pub idle_timeout_secs: Option<u64>,

    /// Maximum size of a single frame in bytes
    pub max_frame_bytes: Option<usize>,

    /// Capacity of the streaming update channel
    pub update_buffer: Option<usize>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientToml {
    /// Backend configuration section
    pub backend: BackendToml,

    /// Chat configuration section
    pub chat: ChatToml,

    /// Stream configuration section
    pub stream: StreamToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Client configuration
///
/// Use [`load_config`] to load configuration with proper priority handling.
#[derive(Clone)]
pub struct ClientConfig {
    /// Backend base URL
    pub base_url: String,

    /// Connect timeout for HTTP requests
    pub connect_timeout: Duration,

    /// Bearer token (optional)
    pub bearer_token: Option<String>,

    /// Agent selected at startup
    pub default_agent: AgentId,

    /// Cancel a request when no bytes arrive for this long
    pub idle_timeout: Option<Duration>,

    /// Maximum size of a single frame
    pub max_frame_bytes: usize,

    /// Capacity of the streaming update channel
    pub update_buffer: usize,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    /// Source of configuration values
    source: ConfigSource,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            connect_timeout: Duration::from_secs(10),
            bearer_token: None,
            default_agent: AgentId::default(),
            idle_timeout: Some(Duration::from_secs(60)),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            update_buffer: 256,
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("base_url", &self.base_url)
            .field("connect_timeout", &self.connect_timeout)
            .field("bearer_token", &self.bearer_token.as_ref().map(|_| "***"))
            .field("default_agent", &self.default_agent)
            .field("idle_timeout", &self.idle_timeout)
            .field("max_frame_bytes", &self.max_frame_bytes)
            .field("update_buffer", &self.update_buffer)
            .field("config_file_path", &self.config_file_path)
            .field("source", &self.source)
            .finish()
    }
}

impl ClientConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Per-request limits for [`StreamSession`](crate::StreamSession)
    #[must_use]
    pub fn stream_options(&self) -> StreamOptions {
        StreamOptions {
            max_frame_bytes: self.max_frame_bytes,
            idle_timeout: self.idle_timeout,
        }
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` naming the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(ConfigError::ValidationError(format!(
                "base_url must start with http:// or https:// (got '{}')",
                self.base_url
            )));
        }
        if self.max_frame_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "max_frame_bytes must be greater than 0".to_string(),
            ));
        }
        if self.update_buffer == 0 {
            return Err(ConfigError::ValidationError(
                "update_buffer must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/coach-chat/client.toml` or
/// `~/.config/coach-chat/client.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("coach-chat").join("client.toml"))
}

/// Load configuration from all sources with proper priority
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or if
/// the resulting configuration is invalid. A missing config file is not an
/// error (defaults are used).
pub fn load_config() -> Result<ClientConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed,
/// or if the resulting configuration is invalid.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<ClientConfig, ConfigError> {
    load_config_with_env(path, |key| std::env::var(key).ok())
}

/// Load configuration reading environment values through `env`
fn load_config_with_env<F>(path: Option<PathBuf>, env: F) -> Result<ClientConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    // Start with defaults
    let mut config = ClientConfig::default();

    // Try to load from file
    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: ClientToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config)?;
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    // Apply environment variables (overrides file values)
    apply_env_config(&mut config, env)?;

    config.validate()?;
    Ok(config)
}

fn parse_agent(name: &str) -> Result<AgentId, ConfigError> {
    name.parse::<AgentId>().map_err(ConfigError::ValidationError)
}

fn idle_timeout_from_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut ClientConfig, toml: &ClientToml) -> Result<(), ConfigError> {
    // Backend settings
    if let Some(ref url) = toml.backend.base_url {
        config.base_url = url.trim_end_matches('/').to_string();
    }
    if let Some(timeout) = toml.backend.connect_timeout_ms {
        config.connect_timeout = Duration::from_millis(timeout);
    }
    if toml.backend.bearer_token.is_some() {
        config.bearer_token = toml.backend.bearer_token.clone();
    }

    // Chat settings
    if let Some(ref agent) = toml.chat.default_agent {
        config.default_agent = parse_agent(agent)?;
    }

    // Stream settings
    if let Some(secs) = toml.stream.idle_timeout_secs {
        config.idle_timeout = idle_timeout_from_secs(secs);
    }
    if let Some(size) = toml.stream.max_frame_bytes {
        config.max_frame_bytes = size;
    }
    if let Some(size) = toml.stream.update_buffer {
        config.update_buffer = size;
    }
    Ok(())
}

/// Apply environment variable overrides to the config
fn apply_env_config<F>(config: &mut ClientConfig, env: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(url) = env("COACH_BACKEND_URL") {
        config.base_url = url.trim_end_matches('/').to_string();
        config.source = ConfigSource::Env;
    }
    if let Some(timeout) = env("COACH_CONNECT_TIMEOUT_MS") {
        match timeout.parse::<u64>() {
            Ok(ms) => {
                config.connect_timeout = Duration::from_millis(ms);
                config.source = ConfigSource::Env;
            }
            Err(_) => tracing::warn!(value = %timeout, "Ignoring invalid COACH_CONNECT_TIMEOUT_MS"),
        }
    }
    if let Some(token) = env("COACH_API_TOKEN") {
        config.bearer_token = Some(token);
        config.source = ConfigSource::Env;
    }
    if let Some(agent) = env("COACH_AGENT") {
        config.default_agent = parse_agent(&agent)?;
        config.source = ConfigSource::Env;
    }
    if let Some(timeout) = env("COACH_IDLE_TIMEOUT_SECS") {
        match timeout.parse::<u64>() {
            Ok(secs) => {
                config.idle_timeout = idle_timeout_from_secs(secs);
                config.source = ConfigSource::Env;
            }
            Err(_) => tracing::warn!(value = %timeout, "Ignoring invalid COACH_IDLE_TIMEOUT_SECS"),
        }
    }
    if let Some(size) = env("COACH_MAX_FRAME_BYTES") {
        match size.parse::<usize>() {
            Ok(bytes) => {
                config.max_frame_bytes = bytes;
                config.source = ConfigSource::Env;
            }
            Err(_) => tracing::warn!(value = %size, "Ignoring invalid COACH_MAX_FRAME_BYTES"),
        }
    }
    Ok(())
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Backend URL override
    pub base_url: Option<String>,

    /// Bearer token override
    pub bearer_token: Option<String>,

    /// Agent override
    pub agent: Option<AgentId>,

    /// Idle timeout override (seconds, 0 disables)
    pub idle_timeout_secs: Option<u64>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set backend URL override
    #[must_use]
    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = Some(url);
        self
    }

    /// Set bearer token override
    #[must_use]
    pub fn with_bearer_token(mut self, token: String) -> Self {
        self.bearer_token = Some(token);
        self
    }

    /// Set agent override
    #[must_use]
    pub fn with_agent(mut self, agent: AgentId) -> Self {
        self.agent = Some(agent);
        self
    }

    /// Set idle timeout override
    #[must_use]
    pub fn with_idle_timeout_secs(mut self, secs: u64) -> Self {
        self.idle_timeout_secs = Some(secs);
        self
    }

    /// Apply overrides to a configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if the result is invalid.
    pub fn apply(&self, config: &mut ClientConfig) -> Result<(), ConfigError> {
        if self.base_url.is_some()
            || self.bearer_token.is_some()
            || self.agent.is_some()
            || self.idle_timeout_secs.is_some()
        {
            config.source = ConfigSource::Cli;
        }

        if let Some(ref url) = self.base_url {
            config.base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(ref token) = self.bearer_token {
            config.bearer_token = Some(token.clone());
        }
        if let Some(agent) = self.agent {
            config.default_agent = agent;
        }
        if let Some(secs) = self.idle_timeout_secs {
            config.idle_timeout = idle_timeout_from_secs(secs);
        }

        config.validate()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn env_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn write_toml(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    // =========================================================================
    // Default Configuration Tests
    // =========================================================================

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();

        assert_eq!(config.base_url, "http://localhost:8000");
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.bearer_token, None);
        assert_eq!(config.default_agent, AgentId::ProfessionalLearning);
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(60)));
        assert_eq!(config.max_frame_bytes, 1024 * 1024);
        assert_eq!(config.update_buffer, 256);
        assert_eq!(config.source(), ConfigSource::Default);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_config_path() {
        if let Some(path) = default_config_path() {
            assert!(path.ends_with("coach-chat/client.toml"));
        }
    }

    // =========================================================================
    // TOML Parsing Tests
    // =========================================================================

    #[test]
    fn test_parse_valid_toml() {
        let file = write_toml(
            r#"
[backend]
base_url = "https://coach.example.org/"
connect_timeout_ms = 2500
bearer_token = "file-token"

[chat]
default_agent = "classroom_curriculum"

[stream]
idle_timeout_secs = 0
max_frame_bytes = 4096
update_buffer = 16
"#,
        );

        let config = load_config_with_env(Some(file.path().to_path_buf()), no_env).unwrap();
        assert_eq!(config.base_url, "https://coach.example.org");
        assert_eq!(config.connect_timeout, Duration::from_millis(2500));
        assert_eq!(config.bearer_token.as_deref(), Some("file-token"));
        assert_eq!(config.default_agent, AgentId::ClassroomCurriculum);
        assert_eq!(config.idle_timeout, None);
        assert_eq!(config.max_frame_bytes, 4096);
        assert_eq!(config.update_buffer, 16);
        assert_eq!(config.source(), ConfigSource::File);
        assert_eq!(config.config_file_path.as_deref(), Some(file.path()));
    }

    #[test]
    fn test_parse_partial_toml() {
        let file = write_toml("[stream]\nidle_timeout_secs = 5\n");
        let config = load_config_with_env(Some(file.path().to_path_buf()), no_env).unwrap();
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
    }

    #[test]
    fn test_missing_file_graceful() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_with_env(Some(dir.path().join("absent.toml")), no_env).unwrap();
        assert_eq!(config.source(), ConfigSource::Default);
        assert!(config.config_file_path.is_none());
    }

    #[test]
    fn test_malformed_toml_error() {
        let file = write_toml("[backend\nbase_url = ");
        let result = load_config_with_env(Some(file.path().to_path_buf()), no_env);
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_unknown_agent_in_file_rejected() {
        let file = write_toml("[chat]\ndefault_agent = \"life_coach\"\n");
        let result = load_config_with_env(Some(file.path().to_path_buf()), no_env);
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    // =========================================================================
    // Priority Tests
    // =========================================================================

    #[test]
    fn test_env_overrides_file() {
        let file = write_toml("[backend]\nbase_url = \"http://file:8000\"\nconnect_timeout_ms = 5000\n");
        let env = env_from(&[
            ("COACH_BACKEND_URL", "http://env:9000"),
            ("COACH_IDLE_TIMEOUT_SECS", "0"),
            ("COACH_AGENT", "classroom_curriculum"),
        ]);

        let config = load_config_with_env(Some(file.path().to_path_buf()), env).unwrap();
        assert_eq!(config.base_url, "http://env:9000");
        assert_eq!(config.connect_timeout, Duration::from_millis(5000));
        assert_eq!(config.idle_timeout, None);
        assert_eq!(config.default_agent, AgentId::ClassroomCurriculum);
        assert_eq!(config.source(), ConfigSource::Env);
    }

    #[test]
    fn test_invalid_env_number_is_ignored() {
        let env = env_from(&[("COACH_MAX_FRAME_BYTES", "lots")]);
        let config = load_config_with_env(None, env).unwrap();
        assert_eq!(config.max_frame_bytes, DEFAULT_MAX_FRAME_BYTES);
        assert_eq!(config.source(), ConfigSource::Default);
    }

    #[test]
    fn test_cli_overrides_env() {
        let env = env_from(&[("COACH_BACKEND_URL", "http://env:9000")]);
        let mut config = load_config_with_env(None, env).unwrap();

        ConfigOverrides::new()
            .with_base_url("https://cli.example.org".to_string())
            .with_agent(AgentId::ClassroomCurriculum)
            .apply(&mut config)
            .unwrap();

        assert_eq!(config.base_url, "https://cli.example.org");
        assert_eq!(config.default_agent, AgentId::ClassroomCurriculum);
        assert_eq!(config.source(), ConfigSource::Cli);
    }

    #[test]
    fn test_empty_overrides_keep_source() {
        let mut config = ClientConfig::default();
        ConfigOverrides::new().apply(&mut config).unwrap();
        assert_eq!(config.source(), ConfigSource::Default);
    }

    // =========================================================================
    // Validation Tests
    // =========================================================================

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = ClientConfig {
            base_url: "localhost:8000".to_string(),
            ..ClientConfig::default()
        };
        assert!(config.validate().is_err());

        config.base_url = DEFAULT_BASE_URL.to_string();
        config.max_frame_bytes = 0;
        assert!(config.validate().is_err());

        config.max_frame_bytes = 1;
        config.update_buffer = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_debug_redacts_token() {
        let config = ClientConfig {
            bearer_token: Some("secret".to_string()),
            ..ClientConfig::default()
        };
        assert!(!format!("{config:?}").contains("secret"));
    }

    #[test]
    fn test_stream_options_follow_config() {
        let config = ClientConfig {
            max_frame_bytes: 512,
            idle_timeout: None,
            ..ClientConfig::default()
        };
        let options = config.stream_options();
        assert_eq!(options.max_frame_bytes, 512);
        assert_eq!(options.idle_timeout, None);
    }
}
