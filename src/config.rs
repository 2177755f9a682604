//! Process settings read from the environment (optionally a `.env` file).

use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tracing_subscriber::EnvFilter;

use crate::pipeline::ollama::DEFAULT_OLLAMA_URL;

/// Application-level constants
pub const APP_NAME: &str = "multimodal-inspection";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: '{value}' ({reason})")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: &'static str,
    },
}

/// Which backend serves a model role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Mock,
    Ollama,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Mock => "mock",
            Provider::Ollama => "ollama",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub app_name: String,
    pub log_level: String,
    pub max_image_mb: u64,
    pub max_document_mb: u64,
    pub max_pdf_pages: usize,
    pub vlm_provider: Provider,
    pub llm_provider: Provider,
    pub ollama_url: String,
    pub vlm_model_id: String,
    pub document_model_id: String,
    pub llm_model_id: String,
    pub vlm_timeout: Duration,
    pub vlm_max_retries: u32,
    pub llm_timeout: Duration,
    pub llm_max_attempts: u32,
    pub worker_pool_size: usize,
    pub request_deadline: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            app_name: "multimodal-visual-inspection-api".into(),
            log_level: "INFO".into(),
            max_image_mb: 10,
            max_document_mb: 20,
            max_pdf_pages: 10,
            vlm_provider: Provider::Mock,
            llm_provider: Provider::Mock,
            ollama_url: DEFAULT_OLLAMA_URL.into(),
            vlm_model_id: "llava:7b".into(),
            document_model_id: "llava:7b".into(),
            llm_model_id: "llama3.1:8b".into(),
            vlm_timeout: Duration::from_secs(60),
            vlm_max_retries: 2,
            llm_timeout: Duration::from_secs(30),
            llm_max_attempts: 3,
            worker_pool_size: 4,
            request_deadline: Duration::from_secs(180),
        }
    }
}

impl Settings {
    /// Load `.env` if present, then read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!(path = %path.display(), "Loaded .env file");
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from any key lookup; unset or blank keys keep defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        Ok(Self {
            app_name: get("APP_NAME").unwrap_or(defaults.app_name),
            log_level: get("LOG_LEVEL").unwrap_or(defaults.log_level),
            max_image_mb: parse_positive(get("MAX_IMAGE_MB"), "MAX_IMAGE_MB", defaults.max_image_mb)?,
            max_document_mb: parse_positive(
                get("MAX_DOCUMENT_MB"),
                "MAX_DOCUMENT_MB",
                defaults.max_document_mb,
            )?,
            max_pdf_pages: parse_positive(get("MAX_PDF_PAGES"), "MAX_PDF_PAGES", defaults.max_pdf_pages)?,
            vlm_provider: parse_provider(get("VLM_PROVIDER"), "VLM_PROVIDER")?,
            llm_provider: parse_provider(get("LLM_PROVIDER"), "LLM_PROVIDER")?,
            ollama_url: get("OLLAMA_URL").unwrap_or(defaults.ollama_url),
            vlm_model_id: get("VLM_MODEL_ID").unwrap_or(defaults.vlm_model_id),
            document_model_id: get("DOCUMENT_MODEL_ID").unwrap_or(defaults.document_model_id),
            llm_model_id: get("LLM_MODEL_ID").unwrap_or(defaults.llm_model_id),
            vlm_timeout: Duration::from_secs(parse_positive(
                get("VLM_TIMEOUT_SECONDS"),
                "VLM_TIMEOUT_SECONDS",
                defaults.vlm_timeout.as_secs(),
            )?),
            vlm_max_retries: parse_number(
                get("VLM_MAX_RETRIES"),
                "VLM_MAX_RETRIES",
                defaults.vlm_max_retries,
            )?,
            llm_timeout: Duration::from_secs(parse_positive(
                get("LLM_TIMEOUT_SECONDS"),
                "LLM_TIMEOUT_SECONDS",
                defaults.llm_timeout.as_secs(),
            )?),
            llm_max_attempts: parse_positive(
                get("LLM_MAX_ATTEMPTS"),
                "LLM_MAX_ATTEMPTS",
                defaults.llm_max_attempts,
            )?,
            worker_pool_size: parse_positive(
                get("WORKER_POOL_SIZE"),
                "WORKER_POOL_SIZE",
                defaults.worker_pool_size,
            )?,
            request_deadline: Duration::from_secs(parse_positive(
                get("REQUEST_DEADLINE_SECONDS"),
                "REQUEST_DEADLINE_SECONDS",
                defaults.request_deadline.as_secs(),
            )?),
        })
    }
}

fn parse_number<T: std::str::FromStr>(
    raw: Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match raw {
        None => Ok(default),
        Some(value) => value.parse().map_err(|_| ConfigError::InvalidValue {
            key,
            value,
            reason: "expected a non-negative integer",
        }),
    }
}

fn parse_positive<T>(raw: Option<String>, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    let value = parse_number(raw.clone(), key, default)?;
    if value <= T::default() {
        return Err(ConfigError::InvalidValue {
            key,
            value: raw.unwrap_or_default(),
            reason: "must be greater than zero",
        });
    }
    Ok(value)
}

fn parse_provider(raw: Option<String>, key: &'static str) -> Result<Provider, ConfigError> {
    match raw.as_deref().map(str::to_ascii_lowercase).as_deref() {
        None | Some("mock") => Ok(Provider::Mock),
        Some("ollama") => Ok(Provider::Ollama),
        Some(_) => Err(ConfigError::InvalidValue {
            key,
            value: raw.unwrap_or_default(),
            reason: "expected 'mock' or 'ollama'",
        }),
    }
}

/// Filter used when `RUST_LOG` is unset, built from a `LOG_LEVEL` value.
pub fn default_log_filter(log_level: &str) -> String {
    let level = match log_level.trim().to_ascii_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" | "warning" => "warn",
        "error" | "critical" => "error",
        _ => "info",
    };
    format!("multimodal_inspection={level},warn")
}

/// Install the global fmt subscriber. A second call is a no-op.
pub fn init_tracing(settings: &Settings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_log_filter(&settings.log_level)));
    if tracing_subscriber::fmt().with_env_filter(filter).try_init().is_ok() {
        tracing::info!(app = %settings.app_name, version = APP_VERSION, "Tracing initialized");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let settings = Settings::from_lookup(lookup(&[])).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.vlm_provider, Provider::Mock);
        assert_eq!(settings.request_deadline, Duration::from_secs(180));
    }

    #[test]
    fn values_are_read_and_trimmed() {
        let settings = Settings::from_lookup(lookup(&[
            ("VLM_PROVIDER", " Ollama "),
            ("LLM_PROVIDER", "ollama"),
            ("VLM_TIMEOUT_SECONDS", "90"),
            ("VLM_MAX_RETRIES", "0"),
            ("WORKER_POOL_SIZE", "8"),
            ("LLM_MODEL_ID", "qwen2.5:7b"),
            ("OLLAMA_URL", ""),
        ]))
        .unwrap();
        assert_eq!(settings.vlm_provider, Provider::Ollama);
        assert_eq!(settings.llm_provider, Provider::Ollama);
        assert_eq!(settings.vlm_timeout, Duration::from_secs(90));
        assert_eq!(settings.vlm_max_retries, 0);
        assert_eq!(settings.worker_pool_size, 8);
        assert_eq!(settings.llm_model_id, "qwen2.5:7b");
        assert_eq!(settings.ollama_url, DEFAULT_OLLAMA_URL);
    }

    #[test]
    fn invalid_values_are_errors() {
        let err = Settings::from_lookup(lookup(&[("MAX_IMAGE_MB", "ten")])).unwrap_err();
        assert!(err.to_string().contains("MAX_IMAGE_MB"));

        let err = Settings::from_lookup(lookup(&[("WORKER_POOL_SIZE", "0")])).unwrap_err();
        assert!(err.to_string().contains("greater than zero"));

        let err = Settings::from_lookup(lookup(&[("LLM_PROVIDER", "openai")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                key: "LLM_PROVIDER",
                value: "openai".into(),
                reason: "expected 'mock' or 'ollama'",
            }
        );
    }

    #[test]
    fn log_filter_accepts_uppercase_levels() {
        assert_eq!(default_log_filter("INFO"), "multimodal_inspection=info,warn");
        assert_eq!(default_log_filter("WARNING"), "multimodal_inspection=warn,warn");
        assert_eq!(default_log_filter("nonsense"), "multimodal_inspection=info,warn");
    }

    #[test]
    fn init_tracing_twice_is_harmless() {
        let settings = Settings::default();
        init_tracing(&settings);
        init_tracing(&settings);
    }

    #[test]
    fn app_version_matches_cargo() {
        assert_eq!(APP_VERSION, "0.1.0");
    }
}
