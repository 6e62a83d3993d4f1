//! YAML loading with `!secret` and `!env_var` tags

use crate::error::{ConfigError, ConfigResult};
use crate::secrets::Secrets;
use serde_yaml::value::TaggedValue;
use serde_yaml::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Loads YAML files, resolving custom tags against one config directory
pub struct YamlLoader {
    secrets: Secrets,
    env: Box<dyn Fn(&str) -> Option<String>>,
}

impl YamlLoader {
    /// Loader reading `secrets.yaml` from `config_dir` and the process environment
    pub fn new(config_dir: &Path) -> ConfigResult<Self> {
        Ok(Self::with_secrets(Secrets::load(config_dir)?))
    }

    pub fn with_secrets(secrets: Secrets) -> Self {
        Self {
            secrets,
            env: Box::new(|var| std::env::var(var).ok()),
        }
    }

    /// Replace the environment lookup used by `!env_var`
    pub fn with_env(mut self, env: impl Fn(&str) -> Option<String> + 'static) -> Self {
        self.env = Box::new(env);
        self
    }

    pub fn load_file(&self, path: &Path) -> ConfigResult<Value> {
        debug!(path = %path.display(), "Loading YAML file");
        let content = fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        self.load_str(&content, path)
    }

    /// `source` is only used in error messages
    pub fn load_str(&self, content: &str, source: &Path) -> ConfigResult<Value> {
        let value: Value =
            serde_yaml::from_str(content).map_err(|e| ConfigError::ParseYaml {
                path: source.to_path_buf(),
                source: e,
            })?;
        self.resolve(value)
    }

    fn resolve(&self, value: Value) -> ConfigResult<Value> {
        match value {
            Value::Tagged(tagged) => self.resolve_tagged(*tagged),
            Value::Mapping(map) => {
                let mut resolved = serde_yaml::Mapping::with_capacity(map.len());
                for (k, v) in map {
                    resolved.insert(k, self.resolve(v)?);
                }
                Ok(Value::Mapping(resolved))
            }
            Value::Sequence(seq) => seq
                .into_iter()
                .map(|v| self.resolve(v))
                .collect::<ConfigResult<Vec<_>>>()
                .map(Value::Sequence),
            _ => Ok(value),
        }
    }

    fn resolve_tagged(&self, tagged: TaggedValue) -> ConfigResult<Value> {
        let tag = tagged.tag.to_string();
        trace!(%tag, "Resolving tag");

        match tag.as_str() {
            "!secret" => {
                let key = tag_argument(&tag, tagged.value)?;
                let secret = self.secrets.get(&key)?;
                debug!(%key, "Substituted secret");
                Ok(Value::String(secret.to_string()))
            }
            "!env_var" => {
                let argument = tag_argument(&tag, tagged.value)?;
                let (var, default) = match argument.split_once(char::is_whitespace) {
                    Some((var, default)) => (var, Some(default.trim())),
                    None => (argument.as_str(), None),
                };
                let value = (self.env)(var)
                    .or_else(|| default.map(String::from))
                    .ok_or_else(|| ConfigError::EnvVarNotFound {
                        var: var.to_string(),
                    })?;
                debug!(%var, "Substituted environment variable");
                Ok(Value::String(value))
            }
            _ => Err(ConfigError::InvalidValue {
                key: tag,
                reason: "unsupported tag".to_string(),
            }),
        }
    }
}

fn tag_argument(tag: &str, value: Value) -> ConfigResult<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        other => Err(ConfigError::InvalidValue {
            key: tag.to_string(),
            reason: format!("expected a name, got {:?}", other),
        }),
    }
}

/// Load `path` with secrets from its own directory
pub fn load_yaml(path: impl AsRef<Path>) -> ConfigResult<Value> {
    let path = path.as_ref();
    YamlLoader::new(&config_dir(path))?.load_file(path)
}

pub(crate) fn config_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    }
}
