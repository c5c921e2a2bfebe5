use serde::Deserialize;
use service_core::config::{self as core_config, is_truthy};
use service_core::error::AppError;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Persona prepended to every conversation unless overridden.
pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are a virtual assistant. Your purpose is to \
provide technical assistance and training to the people who write to you. Answer concisely \
and in the language of the question.";

#[derive(Debug, Clone, Deserialize)]
pub struct ChatConfig {
    #[serde(flatten)]
    pub common: core_config::Config,
    pub provider: ProviderKind,
    pub gemini: GeminiSettings,
    pub generation: GenerationSettings,
    pub sessions: SessionSettings,
    pub streaming: StreamingSettings,
    pub validation: ValidationSettings,
}

/// Which upstream backend answers prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Gemini,
    Mock,
}

impl FromStr for ProviderKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gemini" => Ok(ProviderKind::Gemini),
            "mock" => Ok(ProviderKind::Mock),
            other => Err(config_error(format!("Unknown GENAI_PROVIDER '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeminiSettings {
    pub api_key: String,
    pub model: String,
    pub request_timeout_secs: u64,
}

impl GeminiSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Fixed decoding policy applied to every upstream call.
#[derive(Debug, Clone, Deserialize)]
pub struct GenerationSettings {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: i32,
    pub max_output_tokens: i32,
    pub system_instruction: String,
}

/// How chat sessions relate to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPolicy {
    /// Every call starts from an empty history.
    Stateless,
    /// One history per user id, reused across calls.
    PerUser,
}

impl FromStr for SessionPolicy {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stateless" => Ok(SessionPolicy::Stateless),
            "per_user" | "per-user" => Ok(SessionPolicy::PerUser),
            other => Err(config_error(format!("Unknown CHAT_SESSION_POLICY '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionSettings {
    pub policy: SessionPolicy,
    pub max_history_turns: usize,
    /// Most sessions kept at once under `per_user`.
    pub max_sessions: usize,
    pub idle_ttl_secs: u64,
}

impl SessionSettings {
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }
}

/// How `/receive-data/stream` produces chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    /// One upstream call, then fixed-size slices with a delay between them.
    Rechunk,
    /// Forward the upstream SSE stream as it arrives.
    Native,
}

impl FromStr for StreamMode {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rechunk" => Ok(StreamMode::Rechunk),
            "native" => Ok(StreamMode::Native),
            other => Err(config_error(format!("Unknown STREAM_MODE '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamingSettings {
    pub mode: StreamMode,
    pub chunk_size: usize,
    pub chunk_delay_ms: u64,
}

impl StreamingSettings {
    pub fn chunk_delay(&self) -> Duration {
        Duration::from_millis(self.chunk_delay_ms)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ValidationSettings {
    /// Require the `user_data.browserData` envelope.
    pub require_client_metadata: bool,
    /// Return the field error list to clients instead of only logging it.
    pub expose_details: bool,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_p: 0.95,
            top_k: 40,
            max_output_tokens: 8192,
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.to_string(),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            policy: SessionPolicy::Stateless,
            max_history_turns: 20,
            max_sessions: 10_000,
            idle_ttl_secs: 3600,
        }
    }
}

impl Default for StreamingSettings {
    fn default() -> Self {
        Self {
            mode: StreamMode::Rechunk,
            chunk_size: 50,
            chunk_delay_ms: 150,
        }
    }
}

impl ChatConfig {
    pub fn load() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;
        let is_prod = common_config.environment.is_prod();

        let provider: ProviderKind = get_env("GENAI_PROVIDER", Some("gemini"), is_prod)?.parse()?;
        // The mock backend needs no credentials.
        let api_key = match provider {
            ProviderKind::Gemini => get_env("GEMINI_API_KEY", None, is_prod)?,
            ProviderKind::Mock => env::var("GEMINI_API_KEY").unwrap_or_default(),
        };

        let generation_defaults = GenerationSettings::default();
        let session_defaults = SessionSettings::default();
        let streaming_defaults = StreamingSettings::default();

        Ok(ChatConfig {
            common: common_config,
            provider,
            gemini: GeminiSettings {
                api_key,
                model: get_env("GENAI_TEXT_MODEL", Some("gemini-1.5-flash"), is_prod)?,
                request_timeout_secs: get_parsed("GENAI_REQUEST_TIMEOUT_SECS", 120, is_prod)?,
            },
            generation: GenerationSettings {
                temperature: get_parsed(
                    "GENAI_TEMPERATURE",
                    generation_defaults.temperature,
                    is_prod,
                )?,
                top_p: get_parsed("GENAI_TOP_P", generation_defaults.top_p, is_prod)?,
                top_k: get_parsed("GENAI_TOP_K", generation_defaults.top_k, is_prod)?,
                max_output_tokens: get_parsed(
                    "GENAI_MAX_OUTPUT_TOKENS",
                    generation_defaults.max_output_tokens,
                    is_prod,
                )?,
                system_instruction: get_env(
                    "GENAI_SYSTEM_INSTRUCTION",
                    Some(DEFAULT_SYSTEM_INSTRUCTION),
                    is_prod,
                )?,
            },
            sessions: SessionSettings {
                policy: get_env("CHAT_SESSION_POLICY", Some("stateless"), is_prod)?.parse()?,
                max_history_turns: get_parsed(
                    "CHAT_MAX_HISTORY_TURNS",
                    session_defaults.max_history_turns,
                    is_prod,
                )?,
                max_sessions: get_parsed(
                    "CHAT_MAX_SESSIONS",
                    session_defaults.max_sessions,
                    is_prod,
                )?,
                idle_ttl_secs: get_parsed(
                    "CHAT_SESSION_IDLE_SECS",
                    session_defaults.idle_ttl_secs,
                    is_prod,
                )?,
            },
            streaming: StreamingSettings {
                mode: get_env("STREAM_MODE", Some("rechunk"), is_prod)?.parse()?,
                chunk_size: get_parsed(
                    "STREAM_CHUNK_SIZE",
                    streaming_defaults.chunk_size,
                    is_prod,
                )?,
                chunk_delay_ms: get_parsed(
                    "STREAM_CHUNK_DELAY_MS",
                    streaming_defaults.chunk_delay_ms,
                    is_prod,
                )?,
            },
            validation: ValidationSettings {
                require_client_metadata: is_truthy(&get_env(
                    "REQUIRE_CLIENT_METADATA",
                    Some("false"),
                    is_prod,
                )?),
                expose_details: is_truthy(&get_env(
                    "EXPOSE_VALIDATION_DETAILS",
                    Some("false"),
                    is_prod,
                )?),
            },
        })
    }
}

fn config_error(message: String) -> AppError {
    AppError::ConfigError(anyhow::anyhow!(message))
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(config_error(format!(
                    "{} is required in production but not set",
                    key
                )))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(config_error(format!("{} is required but not set", key)))
            }
        }
    }
}

fn get_parsed<T>(key: &str, default: T, is_prod: bool) -> Result<T, AppError>
where
    T: FromStr + ToString,
    T::Err: std::fmt::Display,
{
    let raw = get_env(key, Some(&default.to_string()), is_prod)?;
    raw.trim()
        .parse()
        .map_err(|e| config_error(format!("{} has invalid value '{}': {}", key, raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_enums() {
        assert_eq!("gemini".parse::<ProviderKind>().unwrap(), ProviderKind::Gemini);
        assert_eq!("MOCK".parse::<ProviderKind>().unwrap(), ProviderKind::Mock);
        assert!("openai".parse::<ProviderKind>().is_err());

        assert_eq!(
            "per_user".parse::<SessionPolicy>().unwrap(),
            SessionPolicy::PerUser
        );
        assert_eq!(
            "stateless".parse::<SessionPolicy>().unwrap(),
            SessionPolicy::Stateless
        );
        assert!("global".parse::<SessionPolicy>().is_err());

        assert_eq!("native".parse::<StreamMode>().unwrap(), StreamMode::Native);
        assert_eq!("rechunk".parse::<StreamMode>().unwrap(), StreamMode::Rechunk);
    }

    #[test]
    fn test_get_env_defaults_outside_prod() {
        let value = get_env("CHAT_SERVICE_TEST_UNSET_VARIABLE", Some("fallback"), false).unwrap();
        assert_eq!(value, "fallback");
        assert!(get_env("CHAT_SERVICE_TEST_UNSET_VARIABLE", None, false).is_err());
    }

    #[test]
    fn test_get_env_strict_in_prod() {
        assert!(get_env("CHAT_SERVICE_TEST_UNSET_VARIABLE", Some("fallback"), true).is_err());
    }

    #[test]
    fn test_get_parsed_default() {
        let value: u64 = get_parsed("CHAT_SERVICE_TEST_UNSET_NUMBER", 150, false).unwrap();
        assert_eq!(value, 150);
    }

    #[test]
    fn test_session_defaults() {
        let defaults = SessionSettings::default();
        assert_eq!(defaults.policy, SessionPolicy::Stateless);
        assert_eq!(defaults.max_sessions, 10_000);
        assert_eq!(defaults.idle_ttl(), Duration::from_secs(3600));
    }

    #[test]
    fn test_generation_defaults() {
        let defaults = GenerationSettings::default();
        assert_eq!(defaults.temperature, 1.0);
        assert_eq!(defaults.top_p, 0.95);
        assert_eq!(defaults.top_k, 40);
        assert_eq!(defaults.max_output_tokens, 8192);
    }
}
