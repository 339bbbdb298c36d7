use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs;

use serde::Deserialize;
use thiserror::Error;

// ============================================================================
// Config (root)
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub assistant: AssistantConfig,
    #[serde(default)]
    pub bridge: RoutingConfig,
}

impl Config {
    /// The per-run part of the config handed to the bridge engine.
    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            gateway: self.gateway.clone(),
            assistant: self.assistant.clone(),
            bridge: self.bridge.clone(),
        }
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = match fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(ConfigError::Io(e)),
        };
        Ok(serde_saphyr::from_str(&contents)?)
    }
}

// ============================================================================
// BridgeConfig
// ============================================================================

/// Everything [`crate::bridge::BridgeEngine::start`] needs for one run.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub assistant: AssistantConfig,
    #[serde(default)]
    pub bridge: RoutingConfig,
}

impl BridgeConfig {
    /// Check that credentials and the assistant working directory are present.
    ///
    /// Returns a human-readable description of the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        if self.gateway.app_id.trim().is_empty() {
            return Err("gateway.app_id is required".to_string());
        }
        if self.gateway.app_secret.trim().is_empty() {
            return Err("gateway.app_secret is required".to_string());
        }
        match &self.assistant.work_dir {
            None => return Err("assistant.work_dir is required".to_string()),
            Some(dir) if dir.as_os_str().is_empty() => {
                return Err("assistant.work_dir is required".to_string());
            }
            Some(_) => {}
        }
        if self.assistant.command.trim().is_empty() {
            return Err("assistant.command must not be empty".to_string());
        }
        if self.bridge.retry_capacity == 0 {
            return Err("bridge.retry_capacity must be greater than zero".to_string());
        }
        if self.bridge.dedup_capacity == 0 {
            return Err("bridge.dedup_capacity must be greater than zero".to_string());
        }
        Ok(())
    }
}

// ============================================================================
// GatewayConfig
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Gateway program speaking the JSON Lines gateway protocol.
    #[serde(default = "default_gateway_command")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub app_secret: String,
    #[serde(default = "default_gateway_ready_timeout")]
    pub ready_timeout_seconds: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            command: default_gateway_command(),
            args: Vec::new(),
            app_id: String::new(),
            app_secret: String::new(),
            ready_timeout_seconds: default_gateway_ready_timeout(),
        }
    }
}

fn default_gateway_command() -> String {
    "chatbridge-gateway".to_string()
}

fn default_gateway_ready_timeout() -> u64 {
    30
}

// ============================================================================
// AssistantConfig
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct AssistantConfig {
    /// Assistant binary. `--hostname` and `--port` are appended to `args`.
    #[serde(default = "default_assistant_command")]
    pub command: String,
    #[serde(default = "default_assistant_args")]
    pub args: Vec<String>,
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    #[serde(default = "default_assistant_host")]
    pub host: String,
    #[serde(default = "default_assistant_port")]
    pub port: u16,
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_seconds: u64,
    #[serde(default = "default_health_interval")]
    pub health_interval_seconds: u64,
    #[serde(default = "default_stop_grace")]
    pub stop_grace_seconds: u64,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            command: default_assistant_command(),
            args: default_assistant_args(),
            work_dir: None,
            host: default_assistant_host(),
            port: default_assistant_port(),
            startup_timeout_seconds: default_startup_timeout(),
            health_interval_seconds: default_health_interval(),
            stop_grace_seconds: default_stop_grace(),
        }
    }
}

impl AssistantConfig {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_seconds)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_seconds.max(1))
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_seconds)
    }
}

fn default_assistant_command() -> String {
    "opencode".to_string()
}

fn default_assistant_args() -> Vec<String> {
    vec!["serve".to_string()]
}

fn default_assistant_host() -> String {
    "127.0.0.1".to_string()
}

fn default_assistant_port() -> u16 {
    4096
}

fn default_startup_timeout() -> u64 {
    30
}

fn default_health_interval() -> u64 {
    5
}

fn default_stop_grace() -> u64 {
    5
}

// ============================================================================
// RoutingConfig
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct RoutingConfig {
    #[serde(default = "default_retry_interval")]
    pub retry_interval_seconds: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_capacity")]
    pub retry_capacity: usize,
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            retry_interval_seconds: default_retry_interval(),
            max_retries: default_max_retries(),
            retry_capacity: default_retry_capacity(),
            dedup_capacity: default_dedup_capacity(),
        }
    }
}

impl RoutingConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_seconds.max(1))
    }
}

fn default_retry_interval() -> u64 {
    5
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_capacity() -> usize {
    100
}

fn default_dedup_capacity() -> usize {
    1000
}

// ============================================================================
// ServerConfig
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_seconds: default_request_timeout(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3300
}

fn default_request_timeout() -> u64 {
    60
}

// ============================================================================
// ConfigError
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Yaml(#[from] serde_saphyr::Error),
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    fn valid_config() -> BridgeConfig {
        let mut config = BridgeConfig::default();
        config.gateway.app_id = "cli_a1".to_string();
        config.gateway.app_secret = "secret".to_string();
        config.assistant.work_dir = Some(PathBuf::from("/tmp"));
        config
    }

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 3300);
        assert_eq!(config.assistant.command, "opencode");
        assert_eq!(config.assistant.args, vec!["serve".to_string()]);
        assert_eq!(config.assistant.port, 4096);
        assert_eq!(config.assistant.startup_timeout_seconds, 30);
        assert_eq!(config.assistant.health_interval_seconds, 5);
        assert_eq!(config.bridge.max_retries, 3);
        assert_eq!(config.bridge.retry_capacity, 100);
    }

    #[tokio::test]
    async fn load_missing_file_returns_defaults() {
        let tmp_dir = TempDir::new().unwrap();
        let missing_path = tmp_dir.path().join("missing-config.yaml");
        let config = Config::load(&missing_path).await.unwrap();
        assert_eq!(config.server.port, 3300);
        assert!(config.assistant.work_dir.is_none());
    }

    #[tokio::test]
    async fn load_valid_yaml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
server:
  port: 8080
gateway:
  command: "lark-gateway"
  app_id: "cli_a1"
  app_secret: "s3cret"
assistant:
  work_dir: "/srv/project"
  port: 5000
  startup_timeout_seconds: 10
bridge:
  retry_capacity: 20
"#
        )
        .unwrap();

        let config = Config::load(file.path()).await.unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.gateway.command, "lark-gateway");
        assert_eq!(config.gateway.app_id, "cli_a1");
        assert_eq!(
            config.assistant.work_dir,
            Some(PathBuf::from("/srv/project"))
        );
        assert_eq!(config.assistant.port, 5000);
        assert_eq!(config.assistant.host, "127.0.0.1"); // default
        assert_eq!(config.assistant.startup_timeout_seconds, 10);
        assert_eq!(config.bridge.retry_capacity, 20);
        assert_eq!(config.bridge.max_retries, 3); // default
        assert!(config.bridge_config().validate().is_ok());
    }

    #[tokio::test]
    async fn load_invalid_yaml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "invalid: yaml: content: [").unwrap();

        let result = Config::load(file.path()).await;
        assert!(result.is_err());
    }

    #[test]
    fn validate_requires_credentials() {
        let mut config = valid_config();
        config.gateway.app_secret = "  ".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.contains("app_secret"));
    }

    #[test]
    fn validate_requires_work_dir() {
        let mut config = valid_config();
        config.assistant.work_dir = None;
        let err = config.validate().unwrap_err();
        assert!(err.contains("work_dir"));
    }

    #[test]
    fn validate_accepts_complete_config() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn base_url_uses_host_and_port() {
        let config = valid_config();
        assert_eq!(config.assistant.base_url(), "http://127.0.0.1:4096");
    }
}
