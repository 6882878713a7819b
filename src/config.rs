//! Layered configuration: optional TOML file, then `KEYROTOR_*` environment
//! variables (`__` separates nested keys, e.g. `KEYROTOR_ENGINE__MAX_ATTEMPTS`).

use crate::error::ConfigError;
use crate::keys::classifier::DEFAULT_QUOTA_PATTERNS;
use crate::keys::record::{Provider, Secret};
use crate::keys::selector::FallbackCredential;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable consulted for the default provider's fallback key.
pub const FALLBACK_ENV_VAR: &str = "API_KEY";

const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const DEFAULT_MODEL: &str = "gemini-2.5-flash";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    /// JSON file holding the local override key and its usage counter.
    pub override_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            database: DatabaseConfig::default(),
            llm: LlmConfig::default(),
            override_path: data_dir().join("override.json"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub cache_ttl_secs: u64,
    pub max_attempts: u32,
    pub default_provider: Provider,
    pub quota_patterns: Vec<String>,
    /// Used only when the credential store cannot be reached.
    pub fallback: Option<FallbackConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 300,
            max_attempts: 5,
            default_provider: Provider::Google,
            quota_patterns: DEFAULT_QUOTA_PATTERNS.iter().map(|p| p.to_string()).collect(),
            fallback: None,
        }
    }
}

impl EngineConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn fallback_credential(&self) -> Option<FallbackCredential> {
        self.fallback.as_ref().map(|fallback| FallbackCredential {
            provider: fallback.provider.unwrap_or(self.default_provider),
            secret: fallback.secret.clone(),
        })
    }

    /// Fill in the fallback from `API_KEY` when none is configured explicitly.
    pub fn apply_env_fallback(&mut self, env_key: Option<String>) {
        if self.fallback.is_some() {
            return;
        }
        if let Some(secret) = env_key.map(Secret::new).filter(|s| !s.is_empty()) {
            self.fallback = Some(FallbackConfig {
                provider: Some(self.default_provider),
                secret,
            });
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FallbackConfig {
    /// Defaults to `engine.default_provider`.
    pub provider: Option<Provider>,
    pub secret: Secret,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: format!("sqlite://{}", data_dir().join("keys.db").display()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub gemini_base_url: String,
    pub model: String,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            gemini_base_url: DEFAULT_GEMINI_BASE_URL.into(),
            model: DEFAULT_MODEL.into(),
            timeout_secs: 120,
        }
    }
}

impl Config {
    /// Load from `path` (or the default config location) and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.map(Path::to_path_buf).or_else(default_config_path);
        let mut config = Self::load_sources(path.as_deref(), true)?;
        config.engine.apply_env_fallback(std::env::var(FALLBACK_ENV_VAR).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load a single file without consulting the environment.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let config = Self::load_sources(Some(path), false)?;
        config.validate()?;
        Ok(config)
    }

    fn load_sources(path: Option<&Path>, with_env: bool) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        if with_env {
            builder = builder.add_source(
                config::Environment::with_prefix("KEYROTOR")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("engine.quota_patterns")
                    .try_parsing(true),
            );
        }
        Ok(builder.build()?.try_deserialize()?)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "engine.max_attempts".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.llm.timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "llm.timeout_secs".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.engine.quota_patterns.is_empty() {
            tracing::warn!("engine.quota_patterns is empty, keys will never rotate");
        }
        Ok(())
    }
}

pub fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("keyrotor")
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("keyrotor").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, contents).unwrap();
        (dir, path)
    }

    #[test]
    fn defaults_match_engine_constants() {
        let config = Config::default();
        assert_eq!(config.engine.cache_ttl(), Duration::from_secs(300));
        assert_eq!(config.engine.max_attempts, 5);
        assert_eq!(config.engine.default_provider, Provider::Google);
        assert!(config.engine.quota_patterns.iter().any(|p| p == "429"));
        assert!(config.database.url.starts_with("sqlite://"));
    }

    #[test]
    fn file_values_override_defaults() {
        let (_dir, path) = write_config(
            r#"
            override_path = "/tmp/override.json"

            [engine]
            cache_ttl_secs = 60
            max_attempts = 3
            default_provider = "OPENAI"

            [engine.fallback]
            secret = "sk-fallback"

            [llm]
            model = "gemini-2.5-pro"
            "#,
        );

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.engine.cache_ttl_secs, 60);
        assert_eq!(config.engine.max_attempts, 3);
        assert_eq!(config.llm.model, "gemini-2.5-pro");
        assert_eq!(config.llm.timeout_secs, 120);
        assert_eq!(config.override_path, PathBuf::from("/tmp/override.json"));

        let fallback = config.engine.fallback_credential().unwrap();
        assert_eq!(fallback.provider, Provider::OpenAi);
        assert_eq!(fallback.secret.expose(), "sk-fallback");
    }

    #[test]
    fn zero_attempts_is_rejected() {
        let (_dir, path) = write_config("[engine]\nmax_attempts = 0\n");
        assert!(matches!(
            Config::from_file(&path),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn env_fallback_only_fills_gaps() {
        let mut engine = EngineConfig::default();
        engine.apply_env_fallback(Some("   ".into()));
        assert!(engine.fallback.is_none());

        engine.apply_env_fallback(Some("AIza-env".into()));
        let fallback = engine.fallback_credential().unwrap();
        assert_eq!(fallback.provider, Provider::Google);
        assert_eq!(fallback.secret.expose(), "AIza-env");

        engine.apply_env_fallback(Some("AIza-other".into()));
        assert_eq!(engine.fallback_credential().unwrap().secret.expose(), "AIza-env");
    }
}
