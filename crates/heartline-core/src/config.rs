//! Configuration for hubs and members.
//!
//! Every level has explicit defaults; a JSON file only needs the keys it
//! wants to override.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Hub configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    #[serde(default)]
    pub auth: AuthConfig,
}

/// Hub heartbeat policy. Immutable once the hub is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Milliseconds between heartbeat cycles (default: 30s)
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Missed cycles tolerated before a forced close (default: 2)
    #[serde(default = "default_max_strikes")]
    pub max_strikes: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            max_strikes: default_max_strikes(),
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Upgrade-time authentication.
///
/// The async predicate is not serializable; it is attached to the hub in code.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Query parameters every upgrade request must carry with equal values
    #[serde(default)]
    pub parameters: Option<HashMap<String, String>>,
}

/// Member configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberConfig {
    /// Hub URL (`ws://` or `wss://`)
    pub url: String,

    /// Query parameters appended to the URL on every attempt
    #[serde(default)]
    pub parameters: HashMap<String, String>,

    #[serde(default)]
    pub reconnect: ReconnectConfig,

    #[serde(default)]
    pub heartbeat: WatchdogConfig,
}

/// Member reconnect policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Delay before each reconnect attempt (default: 1s)
    #[serde(default = "default_retry_interval")]
    pub interval_ms: u64,

    /// Maximum reconnect attempts (default: 10, None = unlimited)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_retry_interval(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl ReconnectConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Member heartbeat watchdog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchdogConfig {
    /// Heartbeat duration assumed until the hub announces its own (default: 30s)
    #[serde(default = "default_heartbeat_interval")]
    pub default_duration_ms: u64,

    /// Silence tolerated, as a multiple of the heartbeat duration (default: 2)
    #[serde(default = "default_margin")]
    pub margin: u32,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            default_duration_ms: default_heartbeat_interval(),
            margin: default_margin(),
        }
    }
}

fn default_heartbeat_interval() -> u64 {
    30_000
}

fn default_max_strikes() -> u32 {
    2
}

fn default_retry_interval() -> u64 {
    1_000
}

fn default_max_attempts() -> Option<u32> {
    Some(10)
}

fn default_margin() -> u32 {
    2
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let parsed = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })?;
    tracing::info!("Loaded configuration from {:?}", path);
    Ok(Some(parsed))
}

impl HubConfig {
    /// Load from a JSON file, using defaults when the file does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let config = match read_json(path)? {
            Some(config) => config,
            None => {
                tracing::info!("No config file found at {:?}, using defaults", path);
                Self::default()
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat.interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat.interval_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

impl MemberConfig {
    /// Member config pointing at `url` with every other option defaulted.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            parameters: HashMap::new(),
            reconnect: ReconnectConfig::default(),
            heartbeat: WatchdogConfig::default(),
        }
    }

    /// Load from a JSON file. Unlike the hub, a member needs at least a URL,
    /// so a missing file is an error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let config: Self = read_json(path)?.ok_or_else(|| ConfigError::Read {
            path: path.display().to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "file not found"),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            return Err(ConfigError::Invalid(format!(
                "url must use ws:// or wss://, got {}",
                self.url
            )));
        }
        if self.reconnect.interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "reconnect.interval_ms must be greater than zero".into(),
            ));
        }
        if self.heartbeat.default_duration_ms == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat.default_duration_ms must be greater than zero".into(),
            ));
        }
        if self.heartbeat.margin == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat.margin must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_hub_defaults() {
        let config = HubConfig::default();
        assert_eq!(config.heartbeat.interval_ms, 30_000);
        assert_eq!(config.heartbeat.max_strikes, 2);
        assert!(config.auth.parameters.is_none());
    }

    #[test]
    fn test_member_defaults() {
        let config = MemberConfig::new("ws://localhost:8080");
        assert_eq!(config.reconnect.interval_ms, 1_000);
        assert_eq!(config.reconnect.max_attempts, Some(10));
        assert_eq!(config.heartbeat.default_duration_ms, 30_000);
        assert_eq!(config.heartbeat.margin, 2);
    }

    #[test]
    fn test_partial_override_keeps_nested_defaults() {
        let json = r#"{ "heartbeat": { "max_strikes": 5 } }"#;
        let config: HubConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.heartbeat.max_strikes, 5);
        assert_eq!(config.heartbeat.interval_ms, 30_000);
    }

    #[test]
    fn test_null_max_attempts_is_unbounded() {
        let json = r#"{ "url": "ws://hub", "reconnect": { "max_attempts": null } }"#;
        let config: MemberConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.reconnect.max_attempts, None);
        assert_eq!(config.reconnect.interval_ms, 1_000);
    }

    #[test]
    fn test_auth_parameters() {
        let json = r#"{ "auth": { "parameters": { "key": "secret" } } }"#;
        let config: HubConfig = serde_json::from_str(json).unwrap();
        let params = config.auth.parameters.unwrap();
        assert_eq!(params.get("key").map(String::as_str), Some("secret"));
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let mut config = HubConfig::default();
        config.heartbeat.interval_ms = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_non_ws_url() {
        let config = MemberConfig::new("http://localhost:8080");
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = MemberConfig::new("wss://hub.example.com/");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_hub_load_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = HubConfig::load(dir.path().join("hub.json")).unwrap();
        assert_eq!(config.heartbeat.interval_ms, 30_000);
    }

    #[test]
    fn test_member_load_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("member.json");
        std::fs::write(
            &path,
            r#"{ "url": "ws://127.0.0.1:9000", "parameters": { "key": "secret" } }"#,
        )
        .unwrap();

        let config = MemberConfig::load(&path).unwrap();
        assert_eq!(config.url, "ws://127.0.0.1:9000");
        assert_eq!(config.parameters.get("key").map(String::as_str), Some("secret"));
    }

    #[test]
    fn test_member_load_missing_file_fails() {
        let dir = TempDir::new().unwrap();
        let result = MemberConfig::load(dir.path().join("nope.json"));
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_load_invalid_json_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hub.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(HubConfig::load(&path), Err(ConfigError::Parse { .. })));
    }
}
