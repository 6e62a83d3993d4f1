//! Panel configuration
//!
//! ```yaml
//! home_assistant:
//!   url: http://homeassistant.local:8123
//!   token: !secret ha_token
//! reconciler:
//!   confirm_timeout_ms: 2000
//!   cooldown_ms: 50
//! client:
//!   request_timeout_secs: 30
//!   auth_timeout_secs: 15
//!   max_reconnect_attempts: 5
//! log_level: info
//! ```

use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{ConfigError, ConfigResult};
use crate::loader::{config_dir, YamlLoader};

/// Overrides `home_assistant.url`
pub const ENV_URL: &str = "HA_URL";

/// Overrides `home_assistant.token`
pub const ENV_TOKEN: &str = "HA_TOKEN";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PanelConfig {
    #[serde(default)]
    pub home_assistant: HomeAssistantSettings,

    #[serde(default)]
    pub reconciler: ReconcilerSettings,

    #[serde(default)]
    pub client: ClientSettings,

    /// `tracing` filter directive used when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HomeAssistantSettings {
    #[serde(default = "default_url")]
    pub url: String,

    /// Long-lived access token
    #[serde(default)]
    pub token: String,
}

/// Timing of optimistic commands
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerSettings {
    #[serde(default = "default_confirm_timeout_ms")]
    pub confirm_timeout_ms: u64,

    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSettings {
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_auth_timeout_secs")]
    pub auth_timeout_secs: u64,

    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_url() -> String {
    "http://homeassistant.local:8123".to_string()
}

fn default_confirm_timeout_ms() -> u64 {
    2000
}

fn default_cooldown_ms() -> u64 {
    50
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_auth_timeout_secs() -> u64 {
    15
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            home_assistant: HomeAssistantSettings::default(),
            reconciler: ReconcilerSettings::default(),
            client: ClientSettings::default(),
            log_level: default_log_level(),
        }
    }
}

impl Default for HomeAssistantSettings {
    fn default() -> Self {
        Self {
            url: default_url(),
            token: String::new(),
        }
    }
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            confirm_timeout_ms: default_confirm_timeout_ms(),
            cooldown_ms: default_cooldown_ms(),
        }
    }
}

impl ReconcilerSettings {
    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.confirm_timeout_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
            auth_timeout_secs: default_auth_timeout_secs(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
        }
    }
}

impl ClientSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }
}

impl PanelConfig {
    /// Load, apply `HA_URL`/`HA_TOKEN` and validate
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let yaml = YamlLoader::new(&config_dir(path))?.load_file(path)?;
        let mut config = Self::from_yaml(yaml)?;
        config.apply_overrides(|var| std::env::var(var).ok());
        config.validate()?;
        info!(path = %path.display(), url = %config.home_assistant.url, "Loaded configuration");
        Ok(config)
    }

    /// Deserialize an already resolved YAML document
    pub fn from_yaml(yaml: Value) -> ConfigResult<Self> {
        if yaml.is_null() {
            return Ok(Self::default());
        }
        if !yaml.is_mapping() {
            return Err(ConfigError::InvalidValue {
                key: "root".to_string(),
                reason: "configuration must be a mapping".to_string(),
            });
        }

        serde_yaml::from_value(yaml).map_err(|e| ConfigError::InvalidValue {
            key: "root".to_string(),
            reason: e.to_string(),
        })
    }

    /// Take the connection settings from `env` where set and non-empty
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        let non_empty = |var: &str| env(var).filter(|v| !v.trim().is_empty());

        if let Some(url) = non_empty(ENV_URL) {
            debug!(var = ENV_URL, "Overriding Home Assistant URL");
            self.home_assistant.url = url;
        }
        if let Some(token) = non_empty(ENV_TOKEN) {
            debug!(var = ENV_TOKEN, "Overriding Home Assistant token");
            self.home_assistant.token = token;
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let url = self.home_assistant.url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::ValidationFailed {
                message: format!(
                    "home_assistant.url must start with http:// or https://, got '{url}'"
                ),
            });
        }
        if self.home_assistant.token.trim().is_empty() {
            return Err(ConfigError::ValidationFailed {
                message: format!("home_assistant.token is empty (set it or {ENV_TOKEN})"),
            });
        }
        if self.reconciler.confirm_timeout_ms <= self.reconciler.cooldown_ms {
            return Err(ConfigError::ValidationFailed {
                message: "reconciler.confirm_timeout_ms must be greater than cooldown_ms"
                    .to_string(),
            });
        }
        if self.client.request_timeout_secs == 0 || self.client.auth_timeout_secs == 0 {
            return Err(ConfigError::ValidationFailed {
                message: "client timeouts must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn parse(yaml: &str) -> PanelConfig {
        PanelConfig::from_yaml(serde_yaml::from_str(yaml).unwrap()).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = parse("home_assistant:\n  token: abc\n");
        assert_eq!(config.home_assistant.url, "http://homeassistant.local:8123");
        assert_eq!(config.reconciler.confirm_timeout(), Duration::from_millis(2000));
        assert_eq!(config.reconciler.cooldown(), Duration::from_millis(50));
        assert_eq!(config.client.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.client.auth_timeout(), Duration::from_secs(15));
        assert_eq!(config.client.max_reconnect_attempts, 5);
        assert_eq!(config.log_level, "info");
        config.validate().unwrap();
    }

    #[test]
    fn test_empty_document() {
        let config = PanelConfig::from_yaml(Value::Null).unwrap();
        assert_eq!(config.log_level, "info");
        assert!(config.home_assistant.token.is_empty());
    }

    #[test]
    fn test_full_document() {
        let config = parse(
            r#"
home_assistant:
  url: https://ha.example.com
  token: abc
reconciler:
  confirm_timeout_ms: 5000
  cooldown_ms: 200
client:
  request_timeout_secs: 10
  auth_timeout_secs: 5
  max_reconnect_attempts: 2
log_level: ha_reconciler=debug,info
"#,
        );
        assert_eq!(config.reconciler.confirm_timeout_ms, 5000);
        assert_eq!(config.reconciler.cooldown_ms, 200);
        assert_eq!(config.client.max_reconnect_attempts, 2);
        assert_eq!(config.log_level, "ha_reconciler=debug,info");
    }

    #[test]
    fn test_env_overrides() {
        let mut config = parse("home_assistant:\n  url: http://old:8123\n  token: old\n");
        config.apply_overrides(|var| match var {
            ENV_URL => Some("https://new.example.com".to_string()),
            ENV_TOKEN => Some("  ".to_string()),
            _ => None,
        });

        assert_eq!(config.home_assistant.url, "https://new.example.com");
        assert_eq!(config.home_assistant.token, "old");
    }

    #[test]
    fn test_validation() {
        let bad_url = parse("home_assistant:\n  url: homeassistant.local\n  token: abc\n");
        assert!(matches!(
            bad_url.validate(),
            Err(ConfigError::ValidationFailed { .. })
        ));

        let no_token = parse("home_assistant:\n  url: http://ha:8123\n");
        assert!(no_token.validate().is_err());

        let inverted = parse(
            "home_assistant:\n  token: abc\nreconciler:\n  confirm_timeout_ms: 50\n  cooldown_ms: 50\n",
        );
        assert!(inverted.validate().is_err());

        let zero = parse("home_assistant:\n  token: abc\nclient:\n  auth_timeout_secs: 0\n");
        assert!(zero.validate().is_err());
    }

    #[test]
    fn test_not_a_mapping() {
        assert!(matches!(
            PanelConfig::from_yaml(serde_yaml::from_str("- a\n- b\n").unwrap()),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_load_with_secret() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("secrets.yaml"), "ha_token: from-secrets\n").unwrap();
        let path = dir.path().join("panel.yaml");
        fs::write(
            &path,
            "home_assistant:\n  url: http://10.0.0.2:8123\n  token: !secret ha_token\n",
        )
        .unwrap();

        let yaml = YamlLoader::new(dir.path()).unwrap().load_file(&path).unwrap();
        let config = PanelConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.home_assistant.token, "from-secrets");
        config.validate().unwrap();
    }

    #[test]
    fn test_load_missing_file() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            PanelConfig::load(dir.path().join("absent.yaml")),
            Err(ConfigError::ReadFile { .. })
        ));
    }
}
