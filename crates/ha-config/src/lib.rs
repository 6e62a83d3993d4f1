//! Configuration for the Home Assistant panel
//!
//! The panel reads a single YAML file. Two custom tags are understood:
//!
//! - `!secret key` - Substitute from `secrets.yaml` next to the config file
//! - `!env_var VAR [default]` - Environment variable substitution
//!
//! `HA_URL` and `HA_TOKEN` override the connection settings after loading.
//!
//! # Example
//!
//! ```ignore
//! use ha_config::PanelConfig;
//!
//! let config = PanelConfig::load("panel.yaml")?;
//! println!("{}", config.home_assistant.url);
//! ```

mod error;
mod loader;
mod panel;
mod secrets;

pub use error::{ConfigError, ConfigResult};
pub use loader::{load_yaml, YamlLoader};
pub use panel::{ClientSettings, HomeAssistantSettings, PanelConfig, ReconcilerSettings};
pub use secrets::Secrets;

pub use serde_yaml::Value;
