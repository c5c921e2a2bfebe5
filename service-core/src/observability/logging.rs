//! Tracing subscriber bootstrap.
//!
//! Filter precedence is `RUST_LOG`, then the file named by `LOG_CFG`, then the
//! default level. The filter sits behind a reload layer so the file can be
//! re-read while the process runs.

use crate::config::Environment;
use crate::error::AppError;
use notify::{EventKind, RecursiveMode, Watcher};
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{Resource, runtime, trace as sdktrace};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing_subscriber::{
    EnvFilter, Layer, Registry, layer::SubscriberExt, reload, util::SubscriberInitExt,
};

/// Output format of the fmt layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    pub fn for_environment(environment: Environment) -> Self {
        if environment.is_prod() {
            LogFormat::Json
        } else {
            LogFormat::Pretty
        }
    }
}

/// Contents of the logging config file (YAML, TOML or JSON).
#[derive(Debug, Clone, Deserialize)]
pub struct LogFileConfig {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub directives: Vec<String>,
    #[serde(default)]
    pub format: Option<LogFormat>,
}

fn default_level() -> String {
    "info".to_string()
}

impl LogFileConfig {
    pub fn load(path: &Path) -> Result<Self, AppError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.to_path_buf()).required(true))
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Build the filter string, e.g. `info,hyper=warn`.
    pub fn filter_directives(&self) -> String {
        std::iter::once(self.level.as_str())
            .chain(self.directives.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[derive(Debug, Clone)]
pub struct LoggingOptions {
    pub service_name: String,
    pub default_level: String,
    pub environment: Environment,
    /// Path of the logging config file (`LOG_CFG`).
    pub config_path: Option<PathBuf>,
    pub otlp_endpoint: Option<String>,
}

impl LoggingOptions {
    /// Options from `ENV`, `LOG_CFG` and `OTLP_ENDPOINT`.
    pub fn from_env(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            default_level: "info".to_string(),
            environment: Environment::from_env(),
            config_path: std::env::var("LOG_CFG").ok().map(PathBuf::from),
            otlp_endpoint: std::env::var("OTLP_ENDPOINT").ok(),
        }
    }
}

/// Handle to the installed subscriber's filter.
pub struct LogHandle {
    filter: reload::Handle<EnvFilter, Registry>,
    config_path: Option<PathBuf>,
}

impl LogHandle {
    /// Replace the active filter with new directives.
    pub fn reload(&self, directives: &str) -> Result<(), AppError> {
        let filter = EnvFilter::try_new(directives)
            .map_err(|e| AppError::ConfigError(anyhow::anyhow!("Invalid log filter: {}", e)))?;
        self.filter
            .reload(filter)
            .map_err(|e| AppError::InternalError(anyhow::anyhow!("Failed to reload filter: {}", e)))
    }

    /// Re-read the config file and apply its directives.
    pub fn reload_from_file(&self) -> Result<(), AppError> {
        let Some(path) = &self.config_path else {
            return Ok(());
        };
        let file_config = LogFileConfig::load(path)?;
        self.reload(&file_config.filter_directives())?;
        tracing::info!(path = %path.display(), "Reloaded logging configuration");
        Ok(())
    }

    /// Watch the config file and reload on modification.
    ///
    /// The returned watcher must be kept alive for as long as reloading is wanted.
    pub fn watch(self) -> Result<Option<notify::RecommendedWatcher>, AppError> {
        let Some(path) = self.config_path.clone() else {
            return Ok(None);
        };

        let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
            match event {
                Ok(event) if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) => {
                    if let Err(e) = self.reload_from_file() {
                        tracing::warn!(error = %e, "Failed to reload logging configuration");
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "Logging config watcher error"),
            }
        })
        .map_err(|e| AppError::InternalError(anyhow::Error::new(e)))?;

        watcher
            .watch(&path, RecursiveMode::NonRecursive)
            .map_err(|e| AppError::InternalError(anyhow::Error::new(e)))?;

        tracing::info!(path = %path.display(), "Watching logging configuration for changes");
        Ok(Some(watcher))
    }
}

fn initial_filter(options: &LoggingOptions, file_config: Option<&LogFileConfig>) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    file_config
        .and_then(|c| EnvFilter::try_new(c.filter_directives()).ok())
        .unwrap_or_else(|| EnvFilter::new(&options.default_level))
}

fn otlp_tracer(service_name: &str, endpoint: &str) -> Result<sdktrace::Tracer, AppError> {
    let otlp_exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint);

    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(otlp_exporter)
        .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![
            KeyValue::new("service.name", service_name.to_string()),
        ])))
        .install_batch(runtime::Tokio)
        .map_err(|e| {
            AppError::ConfigError(anyhow::anyhow!(
                "Failed to initialize OTLP tracer for service '{}' at endpoint '{}': {}",
                service_name,
                endpoint,
                e
            ))
        })
}

/// Install the global subscriber.
///
/// A missing or unreadable `LOG_CFG` file is reported and the default level is
/// used instead. The OTLP layer is only installed when an endpoint is given and
/// must be called from within a Tokio runtime in that case.
pub fn init_tracing(options: LoggingOptions) -> Result<LogHandle, AppError> {
    let file_config = match &options.config_path {
        Some(path) => match LogFileConfig::load(path) {
            Ok(c) => Some(c),
            Err(e) => {
                eprintln!(
                    "Failed to load logging config from {}: {}",
                    path.display(),
                    e
                );
                None
            }
        },
        None => None,
    };

    let (filter_layer, filter_handle) =
        reload::Layer::new(initial_filter(&options, file_config.as_ref()));

    let format = file_config
        .as_ref()
        .and_then(|c| c.format)
        .unwrap_or_else(|| LogFormat::for_environment(options.environment));

    let fmt_layer = match format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .with_file(true)
            .with_line_number(true)
            .json()
            .flatten_event(true)
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer().pretty().boxed(),
    };

    let telemetry = match &options.otlp_endpoint {
        Some(endpoint) => {
            let tracer = otlp_tracer(&options.service_name, endpoint)?;
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(telemetry)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("Failed to install subscriber: {}", e)))?;

    Ok(LogHandle {
        filter: filter_handle,
        config_path: options.config_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_filter_directives() {
        let config = LogFileConfig {
            level: "debug".to_string(),
            directives: vec!["hyper=warn".to_string(), "reqwest=info".to_string()],
            format: None,
        };
        assert_eq!(config.filter_directives(), "debug,hyper=warn,reqwest=info");
    }

    #[test]
    fn test_format_for_environment() {
        assert_eq!(
            LogFormat::for_environment(Environment::Production),
            LogFormat::Json
        );
        assert_eq!(
            LogFormat::for_environment(Environment::Development),
            LogFormat::Pretty
        );
    }

    #[test]
    fn test_load_yaml_file() {
        let path = std::env::temp_dir().join(format!("logging-{}.yaml", uuid::Uuid::new_v4()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "level: warn\ndirectives:\n  - chat_service=debug\nformat: json").unwrap();

        let config = LogFileConfig::load(&path).unwrap();
        assert_eq!(config.level, "warn");
        assert_eq!(config.directives, vec!["chat_service=debug".to_string()]);
        assert_eq!(config.format, Some(LogFormat::Json));

        std::fs::remove_file(path).ok();
    }

    /// A handle over a live (not globally installed) registry.
    fn handle_with_subscriber(
        initial: &str,
        config_path: Option<PathBuf>,
    ) -> (LogHandle, impl tracing::Subscriber) {
        let (layer, filter) = reload::Layer::new(EnvFilter::new(initial));
        let subscriber = tracing_subscriber::registry().with(layer);
        (
            LogHandle {
                filter,
                config_path,
            },
            subscriber,
        )
    }

    fn current_filter(handle: &LogHandle) -> String {
        handle
            .filter
            .with_current(|f| f.to_string().to_ascii_lowercase())
            .unwrap()
    }

    #[test]
    fn test_reload_replaces_filter() {
        let (handle, _subscriber) = handle_with_subscriber("info", None);
        assert_eq!(current_filter(&handle), "info");

        handle.reload("warn").unwrap();
        assert_eq!(current_filter(&handle), "warn");

        handle.reload("warn,chat_service=debug").unwrap();
        assert!(current_filter(&handle).contains("chat_service=debug"));
    }

    #[test]
    fn test_reload_from_file() {
        let path = std::env::temp_dir().join(format!("logging-{}.yaml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "level: error\ndirectives:\n  - chat_service=debug\n").unwrap();

        let (handle, _subscriber) = handle_with_subscriber("info", Some(path.clone()));
        handle.reload_from_file().unwrap();

        let filter = current_filter(&handle);
        assert!(filter.contains("error"));
        assert!(filter.contains("chat_service=debug"));

        std::fs::write(&path, "level: trace\n").unwrap();
        handle.reload_from_file().unwrap();
        assert_eq!(current_filter(&handle), "trace");

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_reload_from_file_without_path_is_noop() {
        let (handle, _subscriber) = handle_with_subscriber("debug", None);
        handle.reload_from_file().unwrap();
        assert_eq!(current_filter(&handle), "debug");
    }

    #[test]
    fn test_reload_fails_once_subscriber_is_gone() {
        let (handle, subscriber) = handle_with_subscriber("info", None);
        drop(subscriber);
        assert!(handle.reload("warn").is_err());
    }

    #[test]
    fn test_watch_without_path_returns_none() {
        let (handle, _subscriber) = handle_with_subscriber("info", None);
        assert!(handle.watch().unwrap().is_none());
    }

    #[test]
    fn test_watch_reloads_on_modification() {
        let path = std::env::temp_dir().join(format!("logging-{}.yaml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "level: info\n").unwrap();

        let (handle, _subscriber) = handle_with_subscriber("info", Some(path.clone()));
        let probe = handle.filter.clone();
        let watcher = handle.watch().unwrap();
        assert!(watcher.is_some());

        std::fs::write(&path, "level: error\n").unwrap();

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        let mut reloaded = false;
        while std::time::Instant::now() < deadline {
            if probe.with_current(|f| f.to_string().to_ascii_lowercase()).unwrap() == "error" {
                reloaded = true;
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(50));
        }
        assert!(reloaded, "filter was not reloaded after the file changed");

        drop(watcher);
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_load_missing_file_fails() {
        let path = std::env::temp_dir().join("does-not-exist-logging.yaml");
        assert!(LogFileConfig::load(&path).is_err());
    }
}
