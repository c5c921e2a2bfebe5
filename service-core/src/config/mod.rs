use crate::error::AppError;
use config::{Config as Cfg, File};
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};

/// Deployment profile selected by the `ENV` variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Development,
    Production,
}

impl Environment {
    /// Read the profile from `ENV`. Anything other than `prod`/`production` is development.
    pub fn from_env() -> Self {
        Self::parse(&env::var("ENV").unwrap_or_default())
    }

    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" => Environment::Production,
            _ => Environment::Development,
        }
    }

    pub fn is_prod(self) -> bool {
        self == Environment::Production
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(skip)]
    pub environment: Environment,
    #[serde(skip)]
    pub is_https: bool,
}

fn default_port() -> u16 {
    5000
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            environment: Environment::Development,
            is_https: false,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();

        let config = Cfg::builder()
            .add_source(File::with_name("configuration").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        let mut config: Config = config.try_deserialize()?;
        config.environment = Environment::from_env();
        config.is_https = env::var("IS_HTTPS").map(|v| is_truthy(&v)).unwrap_or(false);

        Ok(config)
    }

    /// Scheme the service is reachable under. TLS itself is terminated in front of us.
    pub fn scheme(&self) -> &'static str {
        if self.is_https { "https" } else { "http" }
    }
}

/// Load `.env` from the working directory or one of its parents.
///
/// A missing or unreadable file is an error; binaries treat it as fatal.
pub fn load_env_file() -> Result<PathBuf, AppError> {
    dotenvy::dotenv()
        .map_err(|e| AppError::ConfigError(anyhow::anyhow!("Failed to load .env file: {}", e)))
}

/// Load a specific env file into the process environment.
pub fn load_env_file_from(path: &Path) -> Result<PathBuf, AppError> {
    dotenvy::from_path(path).map_err(|e| {
        AppError::ConfigError(anyhow::anyhow!(
            "Failed to load env file {}: {}",
            path.display(),
            e
        ))
    })?;
    Ok(path.to_path_buf())
}

/// Interpret common boolean spellings used in `.env` files.
pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_parse() {
        assert_eq!(Environment::parse("prod"), Environment::Production);
        assert_eq!(Environment::parse(" PRODUCTION "), Environment::Production);
        assert_eq!(Environment::parse("dev"), Environment::Development);
        assert_eq!(Environment::parse(""), Environment::Development);
    }

    #[test]
    fn test_is_truthy() {
        assert!(is_truthy("true"));
        assert!(is_truthy("1"));
        assert!(is_truthy("Yes"));
        assert!(!is_truthy("false"));
        assert!(!is_truthy("0"));
        assert!(!is_truthy(""));
    }

    #[test]
    fn test_scheme() {
        let mut config = Config::default();
        assert_eq!(config.scheme(), "http");
        config.is_https = true;
        assert_eq!(config.scheme(), "https");
    }

    #[test]
    fn test_missing_env_file_is_an_error() {
        let path = env::temp_dir().join(format!("missing-{}.env", uuid::Uuid::new_v4()));

        let result = load_env_file_from(&path);

        assert!(matches!(result, Err(AppError::ConfigError(_))));
    }

    #[test]
    fn test_env_file_sets_variables() {
        let key = format!("ENV_FILE_TEST_{}", uuid::Uuid::new_v4().simple());
        let path = env::temp_dir().join(format!("{}.env", key));
        std::fs::write(&path, format!("{}=loaded\n", key)).unwrap();

        let loaded = load_env_file_from(&path).unwrap();

        assert_eq!(loaded, path);
        assert_eq!(env::var(&key).unwrap(), "loaded");
        std::fs::remove_file(&path).ok();
    }
}
