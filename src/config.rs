//! Runtime settings.
//!
//! Everything tunable lives in one [`Settings`] value that is built once at
//! startup (defaults, then an optional JSON file, then CLI flags and
//! environment variables) and handed to constructors explicitly.

use std::path::Path;
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::pricing::PricingWeights;
use crate::prompts;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub pricing: PricingWeights,
    pub oracle: OracleSettings,
    pub retry: RetrySettings,
    pub prompts: PromptSettings,
    pub server: ServerSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleSettings {
    pub base_url: String,
    pub model: String,
    /// Never read from or written to the settings file.
    #[serde(skip)]
    pub api_key: Option<SecretString>,
    pub chat_temperature: f32,
    pub chat_max_tokens: u32,
    pub extraction_temperature: f32,
    pub extraction_max_tokens: u32,
    pub request_timeout_secs: u64,
}

impl Default for OracleSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key: None,
            chat_temperature: 0.7,
            chat_max_tokens: 500,
            extraction_temperature: 0.5,
            extraction_max_tokens: 1000,
            request_timeout_secs: 30,
        }
    }
}

impl OracleSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Chat sessions untouched for this long are dropped by the web server.
    pub session_idle_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            session_idle_timeout_secs: 30 * 60,
        }
    }
}

impl ServerSettings {
    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_timeout_secs)
    }
}

/// Prompt templates, rendered with minijinja (see [`crate::prompts`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptSettings {
    pub advisor: String,
    pub extraction: String,
}

impl Default for PromptSettings {
    fn default() -> Self {
        Self {
            advisor: prompts::ADVISOR_TEMPLATE.to_string(),
            extraction: prompts::EXTRACTION_TEMPLATE.to_string(),
        }
    }
}

impl Settings {
    /// Reads a JSON settings file. Sections and keys left out keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
        let settings: Settings = serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("failed to parse {}: {}", path.display(), e)))?;
        settings.validate()?;
        info!(path = %path.display(), "Loaded settings file");
        debug!(?settings, "Effective settings");
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        self.pricing.validate()?;
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(Error::Config(
                "retry.initial_backoff_ms must not exceed retry.max_backoff_ms".into(),
            ));
        }
        if self.oracle.request_timeout_secs == 0 {
            return Err(Error::Config(
                "oracle.request_timeout_secs must be at least 1".into(),
            ));
        }
        if self.server.session_idle_timeout_secs == 0 {
            return Err(Error::Config(
                "server.session_idle_timeout_secs must be at least 1".into(),
            ));
        }
        if self.oracle.base_url.trim().is_empty() || self.oracle.model.trim().is_empty() {
            return Err(Error::Config("oracle.base_url and oracle.model must be set".into()));
        }
        // Template syntax errors surface at startup.
        prompts::render_advisor(&self.prompts.advisor)?;
        prompts::render_extraction(&self.prompts.extraction)?;
        Ok(())
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.oracle.api_key = Some(SecretString::new(api_key.into()));
        self
    }

    /// The credential is mandatory for anything that talks to the oracle.
    pub fn require_api_key(&self) -> Result<&SecretString> {
        self.oracle.api_key.as_ref().ok_or_else(|| {
            Error::Config("no API key configured; set OPENAI_API_KEY or pass --api-key".into())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.pricing.economy_modifier, 0.85);
        assert_eq!(settings.pricing.premium_modifier, 1.25);
        assert_eq!(settings.oracle.model, DEFAULT_MODEL);
        assert_eq!(settings.retry.max_attempts, 3);
    }

    #[test]
    fn test_load_partial_file_keeps_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"pricing": {{"demand_weight": 0.03}}, "retry": {{"max_attempts": 5}}}}"#
        )
        .unwrap();

        let settings = Settings::load(file.path()).unwrap();
        assert_eq!(settings.pricing.demand_weight, 0.03);
        assert_eq!(settings.pricing.uniqueness_weight, 0.05);
        assert_eq!(settings.retry.max_attempts, 5);
        assert_eq!(settings.retry.initial_backoff_ms, 500);
        assert!(settings.oracle.api_key.is_none());
    }

    #[test]
    fn test_load_rejects_bad_values() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"retry": {{"max_attempts": 0}}}}"#).unwrap();
        assert!(matches!(Settings::load(file.path()), Err(Error::Config(_))));
    }

    #[test]
    fn test_session_idle_timeout_must_be_positive() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"server": {{"session_idle_timeout_secs": 0}}}}"#).unwrap();
        assert!(matches!(Settings::load(file.path()), Err(Error::Config(_))));
        assert_eq!(
            Settings::default().server.session_idle_timeout(),
            Duration::from_secs(1800)
        );
    }

    #[test]
    fn test_load_rejects_broken_template() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"prompts": {{"advisor": "{{% if %}}"}}}}"#).unwrap();
        assert!(Settings::load(file.path()).is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let err = Settings::load("/definitely/not/here.json").unwrap_err();
        assert!(err.to_string().contains("failed to read"));
    }

    #[test]
    fn test_api_key_is_required_and_redacted() {
        let settings = Settings::default();
        assert!(matches!(settings.require_api_key(), Err(Error::Config(_))));

        let settings = settings.with_api_key("sk-test");
        assert_eq!(settings.require_api_key().unwrap().expose_secret(), "sk-test");
        assert!(!format!("{:?}", settings).contains("sk-test"));
    }
}
