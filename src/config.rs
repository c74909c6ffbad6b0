//! Service configuration
//!
//! Values come from a YAML file, then `AGENTGUARD__SECTION__KEY` overlays,
//! then the dedicated secret and database variables.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use agentguard_gateway::GatewayOptions;
use agentguard_policy::{EngineOptions, PolicySet};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const ENV_PREFIX: &str = "AGENTGUARD__";
pub const BEARER_TOKEN_ENV: &str = "AGENTGUARD_BEARER_TOKEN";
pub const DATABASE_HOST_ENV: &str = "AGENTGUARD_DATABASE_HOST";
pub const DATABASE_PORT_ENV: &str = "AGENTGUARD_DATABASE_PORT";

const LOCAL_CONFIG: &str = "config/agentguard.yaml";
const REDACTED: &str = "[redacted]";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file {0} not found")]
    Missing(PathBuf),
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("invalid override {key}: {message}")]
    Override { key: String, message: String },
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub rate_limit: RateLimitConfig,
    pub policy: PolicyConfig,
    pub database: DatabaseConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub shutdown_timeout_secs: u64,
    pub max_body_bytes: usize,
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            shutdown_timeout_secs: 30,
            max_body_bytes: 1 << 20,
            cors_origins: vec!["*".to_string()],
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuthConfig {
    pub bearer_token: Option<String>,
    /// Lets every authenticated caller through scope checks. Local use only.
    pub scope_bypass: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Admissions per key per window. Zero disables limiting.
    pub requests: usize,
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests: 100,
            window_secs: 60,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PolicyConfig {
    pub paths: Vec<PathBuf>,
    pub bundle: Option<PathBuf>,
    pub builtin: bool,
    pub decision_query: String,
    pub max_input_bytes: usize,
    pub eval_timeout_ms: u64,
    pub max_concurrent_evaluations: usize,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        let engine = EngineOptions::default();
        Self {
            paths: Vec::new(),
            bundle: None,
            builtin: false,
            decision_query: engine.decision_query,
            max_input_bytes: engine.max_input_bytes,
            eval_timeout_ms: engine.eval_timeout.as_millis() as u64,
            max_concurrent_evaluations: engine.max_concurrent_evaluations,
        }
    }
}

impl PolicyConfig {
    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            decision_query: self.decision_query.clone(),
            max_input_bytes: self.max_input_bytes,
            eval_timeout: Duration::from_millis(self.eval_timeout_ms),
            max_concurrent_evaluations: self.max_concurrent_evaluations,
        }
    }

    pub fn policy_set(&self) -> PolicySet {
        PolicySet {
            paths: self.paths.clone(),
            bundle: self.bundle.clone(),
            builtin: self.builtin,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Readiness reports the database as unavailable while this is unset.
    pub host: Option<String>,
    pub port: u16,
    pub connect_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: 5432,
            connect_timeout_ms: 1_000,
        }
    }
}

impl Config {
    pub fn gateway_options(&self) -> GatewayOptions {
        GatewayOptions {
            max_body_bytes: self.server.max_body_bytes,
            cors_origins: self.server.cors_origins.clone(),
            scope_bypass: self.auth.scope_bypass,
            policy_set: self.policy.policy_set(),
        }
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit.window_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_timeout_secs)
    }

    /// Copy that is safe to print.
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        if config.auth.bearer_token.is_some() {
            config.auth.bearer_token = Some(REDACTED.to_string());
        }
        config
    }

    pub fn from_yaml(raw: &str, path: &Path) -> Result<Self, ConfigError> {
        serde_yaml::from_str(raw).map_err(|err| ConfigError::Parse {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
    }

    /// Applies environment overrides taken from `vars`.
    pub fn with_overrides<I>(self, vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut tree = serde_json::to_value(&self).map_err(|err| ConfigError::Override {
            key: ENV_PREFIX.to_string(),
            message: err.to_string(),
        })?;
        let mut applied = Vec::new();
        let mut vars: Vec<(String, String)> = vars.into_iter().collect();
        vars.sort();
        for (key, raw) in vars {
            let path = if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                let segments: Vec<String> = stripped
                    .split("__")
                    .filter(|segment| !segment.is_empty())
                    .map(|segment| segment.to_ascii_lowercase())
                    .collect();
                if segments.is_empty() {
                    continue;
                }
                set_path(&mut tree, &segments, parse_env_value(&raw));
                segments
            } else if key == BEARER_TOKEN_ENV {
                let segments = vec!["auth".to_string(), "bearer_token".to_string()];
                set_path(&mut tree, &segments, Value::String(raw));
                segments
            } else if key == DATABASE_HOST_ENV {
                let segments = vec!["database".to_string(), "host".to_string()];
                set_path(&mut tree, &segments, Value::String(raw));
                segments
            } else if key == DATABASE_PORT_ENV {
                let segments = vec!["database".to_string(), "port".to_string()];
                set_path(&mut tree, &segments, parse_env_value(&raw));
                segments
            } else {
                continue;
            };
            applied.push((key, path.join(".")));
        }
        serde_json::from_value(tree).map_err(|err| ConfigError::Override {
            key: applied
                .iter()
                .map(|(key, _)| key.as_str())
                .collect::<Vec<_>>()
                .join(","),
            message: err.to_string(),
        })
    }
}

fn set_path(tree: &mut Value, segments: &[String], value: Value) {
    let Some((last, parents)) = segments.split_last() else {
        return;
    };
    let mut cursor = tree;
    for segment in parents {
        if !cursor.is_object() {
            *cursor = Value::Object(Map::new());
        }
        let Value::Object(map) = cursor else {
            return;
        };
        cursor = map
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !cursor.is_object() {
        *cursor = Value::Object(Map::new());
    }
    if let Value::Object(map) = cursor {
        map.insert(last.clone(), value);
    }
}

fn parse_env_value(raw: &str) -> Value {
    if raw.is_empty() {
        return Value::Null;
    }
    if let Ok(parsed) = serde_json::from_str::<Value>(raw) {
        return parsed;
    }
    if let Ok(boolean) = raw.parse::<bool>() {
        return Value::Bool(boolean);
    }
    if let Ok(int_val) = raw.parse::<i64>() {
        return Value::Number(int_val.into());
    }
    Value::String(raw.to_string())
}

/// `explicit` if given, else `./config/agentguard.yaml`, else the user config dir.
pub fn resolve_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    let local = PathBuf::from(LOCAL_CONFIG);
    if local.exists() {
        return Some(local);
    }
    let user = dirs::config_dir()?.join("agentguard").join("config.yaml");
    user.exists().then_some(user)
}

#[derive(Clone, Debug)]
pub struct LoadedConfig {
    pub config: Config,
    pub path: Option<PathBuf>,
}

pub fn load(explicit: Option<&Path>) -> Result<LoadedConfig, ConfigError> {
    let path = resolve_path(explicit);
    let config = match &path {
        Some(path) => {
            if !path.exists() {
                return Err(ConfigError::Missing(path.clone()));
            }
            let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;
            Config::from_yaml(&raw, path)?
        }
        None => Config::default(),
    };
    let config = config.with_overrides(env::vars())?;
    Ok(LoadedConfig { config, path })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.rate_limit.requests, 100);
        assert_eq!(config.rate_limit_window(), Duration::from_secs(60));
        assert_eq!(config.policy.max_input_bytes, 1 << 20);
        assert_eq!(config.policy.eval_timeout_ms, 2_000);
        assert_eq!(config.policy.max_concurrent_evaluations, 64);
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(30));
        assert!(!config.auth.scope_bypass);
        assert!(config.database.host.is_none());
    }

    #[test]
    fn yaml_sections_are_optional() {
        let raw = "server:\n  port: 9000\npolicy:\n  builtin: true\n";
        let config = Config::from_yaml(raw, Path::new("test.yaml")).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert!(config.policy.builtin);
        assert_eq!(config.rate_limit, RateLimitConfig::default());
    }

    #[test]
    fn overlays_replace_nested_values() {
        let config = Config::default()
            .with_overrides(vars(&[
                ("AGENTGUARD__SERVER__PORT", "9443"),
                ("AGENTGUARD__RATE_LIMIT__REQUESTS", "5"),
                ("AGENTGUARD__AUTH__SCOPE_BYPASS", "true"),
                ("AGENTGUARD__SERVER__CORS_ORIGINS", r#"["https://a.example"]"#),
                ("AGENTGUARD_BEARER_TOKEN", "0123456789"),
                ("AGENTGUARD_DATABASE_HOST", "db.internal"),
                ("UNRELATED", "ignored"),
            ]))
            .unwrap();
        assert_eq!(config.server.port, 9443);
        assert_eq!(config.rate_limit.requests, 5);
        assert!(config.auth.scope_bypass);
        assert_eq!(config.server.cors_origins, vec!["https://a.example"]);
        assert_eq!(config.auth.bearer_token.as_deref(), Some("0123456789"));
        assert_eq!(config.database.host.as_deref(), Some("db.internal"));
    }

    #[test]
    fn mistyped_overlay_is_reported() {
        let err = Config::default()
            .with_overrides(vars(&[("AGENTGUARD__SERVER__PORT", "not-a-port")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Override { key, .. } if key.contains("SERVER__PORT")));
    }

    #[test]
    fn redaction_hides_the_secret() {
        let mut config = Config::default();
        config.auth.bearer_token = Some("super-secret".into());
        let printed = serde_yaml::to_string(&config.redacted()).unwrap();
        assert!(!printed.contains("super-secret"));
        assert!(printed.contains(REDACTED));
    }

    #[test]
    #[serial]
    fn load_reads_file_and_environment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agentguard.yaml");
        fs::write(&path, "rate_limit:\n  requests: 7\n  window_secs: 10\n").unwrap();
        env::set_var(BEARER_TOKEN_ENV, "token-from-environment-0123456789");
        let loaded = load(Some(&path));
        env::remove_var(BEARER_TOKEN_ENV);
        let loaded = loaded.unwrap();
        assert_eq!(loaded.path.as_deref(), Some(path.as_path()));
        assert_eq!(loaded.config.rate_limit.requests, 7);
        assert_eq!(
            loaded.config.auth.bearer_token.as_deref(),
            Some("token-from-environment-0123456789")
        );
    }

    #[test]
    #[serial]
    fn explicit_missing_file_is_an_error() {
        let err = load(Some(Path::new("/definitely/not/here.yaml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Missing(_)));
    }
}
