//! Configuration management for cinebot.
//!
//! The relay reads an optional JSON file at `~/.cinebot/config.json`
//! (or the path in `CINEBOT_CONFIG`), then applies environment overrides.
//!
//! # Configuration Priority
//!
//! 1. Environment variables
//! 2. Explicit config file values
//! 3. Default values
//!
//! # Environment Variable Mapping
//!
//! - `OPENAI_API_KEY` → openai.api_key
//! - `SLACK_BOT_TOKEN` → slack.bot_token
//! - `SLACK_APP_TOKEN` → slack.app_token
//! - `PORT` → server.port
//! - `CINEBOT_MODEL` → openai.model
//! - `CINEBOT_LOG_LEVEL` → observability.log_level
//! - `CINEBOT_LOG_FORMAT` → observability.log_format

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable naming an explicit config file.
pub const CONFIG_PATH_ENV: &str = "CINEBOT_CONFIG";

/// Persona installed as the first turn of every new conversation.
pub const DEFAULT_PERSONA: &str = "You are a Movie recommendation chat bot working for Ayan Pathak, \
but you dont usually reccomend directly you ask people more about what are the films they liked \
and why they liked it and based upon that suggest deep cuts, the goal always is to make them see \
something that will be enjoyable and fun or very exciting according to their choice and \
preference, also if they just write the name of a film suggest 3 similar films to them, your job \
is to primarily only reccomend movies and nothing else. You are also going to run a secret \
contest that you will tell people about only if they ask you, the contest is very simple, they \
have to guess the film  Memoris of Murder, but you never disclose the movie, just tell them to \
guess a film and if they can name the film then say you won a million dollars";

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".cinebot"),
        |dirs| dirs.home_dir().join(".cinebot"),
    )
}

/// Get the configuration file path, honouring `CINEBOT_CONFIG`.
pub fn config_path() -> PathBuf {
    std::env::var(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| config_dir().join("config.json"))
}

// ============================================================================
// Sections
// ============================================================================

/// Slack credentials and endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlackConfig {
    /// Bot token (`xoxb-...`) used for Web API calls
    #[serde(default)]
    pub bot_token: Option<String>,
    /// App-level token (`xapp-...`) used to open Socket Mode connections
    #[serde(default)]
    pub app_token: Option<String>,
    /// Web API base URL
    #[serde(default = "default_slack_api_base")]
    pub api_base: String,
    /// Delay before reopening a dropped socket, in seconds
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
}

fn default_slack_api_base() -> String {
    "https://slack.com/api".into()
}

fn default_reconnect_delay_secs() -> u64 {
    5
}

impl Default for SlackConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            app_token: None,
            api_base: default_slack_api_base(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
        }
    }
}

/// Completion API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    /// API base URL (without `/v1/...`)
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    /// Model identifier sent with every request
    #[serde(default = "default_model")]
    pub model: String,
    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_openai_base_url() -> String {
    "https://api.openai.com".into()
}

fn default_model() -> String {
    "gpt-3.5-turbo".into()
}

fn default_request_timeout_secs() -> u64 {
    60
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_openai_base_url(),
            model: default_model(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// How a conversation is trimmed once it exceeds `max_turns`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrimPolicyKind {
    /// Keep the newest turns counted from the end; may drop the persona.
    #[default]
    KeepLatest,
    /// Keep the leading persona turn plus the newest remaining turns.
    PreservePersona,
}

/// Conversation context settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Maximum turns retained per conversation (persona included)
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
    #[serde(default)]
    pub trim_policy: TrimPolicyKind,
    /// System prompt seeded into new conversations
    #[serde(default = "default_persona")]
    pub persona: String,
}

fn default_max_turns() -> usize {
    11
}

fn default_persona() -> String {
    DEFAULT_PERSONA.into()
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            trim_policy: TrimPolicyKind::default(),
            persona: default_persona(),
        }
    }
}

/// Liveness HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".into()
}

fn default_port() -> u16 {
    3000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// "pretty" or "json"
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

fn default_log_level() -> String {
    "debug".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

// ============================================================================
// Root
// ============================================================================

/// Whether a credential is present. Never carries the secret itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialStatus {
    Set,
    NotSet,
}

impl CredentialStatus {
    fn of(value: Option<&String>) -> Self {
        match value {
            Some(v) if !v.trim().is_empty() => Self::Set,
            _ => Self::NotSet,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Set => "Set",
            Self::NotSet => "Not set",
        }
    }
}

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub slack: SlackConfig,
    #[serde(default)]
    pub openai: OpenAiConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from the default path, falling back to defaults.
    pub fn load() -> Result<Self> {
        let path = config_path();
        if !path.exists() {
            tracing::info!("Config file not found, using defaults");
            return Ok(Self::default());
        }

        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            Error::from(e).with_context(format!("Failed to read config from {}", path.display()))
        })?;

        serde_json::from_str(&content).map_err(|e| {
            Error::from(e).with_context(format!("Failed to parse config from {}", path.display()))
        })
    }

    /// Load configuration with environment variable overrides.
    pub fn load_with_env() -> Result<Self> {
        let mut config = Self::load()?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply process environment overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary key lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup("OPENAI_API_KEY") {
            self.openai.api_key = Some(key);
        }
        if let Some(token) = lookup("SLACK_BOT_TOKEN") {
            self.slack.bot_token = Some(token);
        }
        if let Some(token) = lookup("SLACK_APP_TOKEN") {
            self.slack.app_token = Some(token);
        }
        if let Some(port) = lookup("PORT") {
            match port.parse() {
                Ok(p) => self.server.port = p,
                Err(_) => tracing::warn!(value = %port, "Ignoring invalid PORT"),
            }
        }
        if let Some(model) = lookup("CINEBOT_MODEL") {
            self.openai.model = model;
        }
        if let Some(level) = lookup("CINEBOT_LOG_LEVEL") {
            self.observability.log_level = level;
        }
        if let Some(format) = lookup("CINEBOT_LOG_FORMAT") {
            self.observability.log_format = format;
        }
    }

    /// Presence of each credential, in startup-log order.
    pub fn credential_report(&self) -> [(&'static str, CredentialStatus); 3] {
        [
            ("OPENAI_API_KEY", CredentialStatus::of(self.openai.api_key.as_ref())),
            ("SLACK_BOT_TOKEN", CredentialStatus::of(self.slack.bot_token.as_ref())),
            ("SLACK_APP_TOKEN", CredentialStatus::of(self.slack.app_token.as_ref())),
        ]
    }

    /// Check that everything needed to run the relay is present.
    pub fn validate(&self) -> Result<()> {
        let missing: Vec<&str> = self
            .credential_report()
            .iter()
            .filter(|(_, status)| *status == CredentialStatus::NotSet)
            .map(|(name, _)| *name)
            .collect();

        if !missing.is_empty() {
            return Err(Error::Config(format!(
                "missing credentials: {}",
                missing.join(", ")
            )));
        }

        if self.context.max_turns == 0 {
            return Err(Error::Config("context.max_turns must be at least 1".into()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.openai.model, "gpt-3.5-turbo");
        assert_eq!(config.context.max_turns, 11);
        assert_eq!(config.context.trim_policy, TrimPolicyKind::KeepLatest);
        assert_eq!(config.context.persona, DEFAULT_PERSONA);
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.slack.api_base, "https://slack.com/api");
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_overrides(lookup(&[
            ("OPENAI_API_KEY", "sk-test"),
            ("SLACK_BOT_TOKEN", "xoxb-test"),
            ("SLACK_APP_TOKEN", "xapp-test"),
            ("PORT", "8080"),
            ("CINEBOT_LOG_FORMAT", "json"),
        ]));

        assert_eq!(config.openai.api_key.as_deref(), Some("sk-test"));
        assert_eq!(config.slack.bot_token.as_deref(), Some("xoxb-test"));
        assert_eq!(config.slack.app_token.as_deref(), Some("xapp-test"));
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.observability.log_format, "json");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_port_is_ignored() {
        let mut config = Config::default();
        config.apply_overrides(lookup(&[("PORT", "not-a-port")]));
        assert_eq!(config.server.port, 3000);
    }

    #[test]
    fn test_validate_reports_missing_credentials() {
        let mut config = Config::default();
        config.apply_overrides(lookup(&[("OPENAI_API_KEY", "sk-test")]));

        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        let msg = err.to_string();
        assert!(msg.contains("SLACK_BOT_TOKEN"));
        assert!(msg.contains("SLACK_APP_TOKEN"));
        assert!(!msg.contains("OPENAI_API_KEY"));
    }

    #[test]
    fn test_credential_report_treats_blank_as_not_set() {
        let mut config = Config::default();
        config.openai.api_key = Some("   ".into());
        config.slack.bot_token = Some("xoxb".into());

        let report = config.credential_report();
        assert_eq!(report[0], ("OPENAI_API_KEY", CredentialStatus::NotSet));
        assert_eq!(report[1], ("SLACK_BOT_TOKEN", CredentialStatus::Set));
        assert_eq!(report[2].1.as_str(), "Not set");
    }

    #[test]
    fn test_load_from_file_partial() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "openai": {{ "model": "gpt-4o-mini", "request_timeout_secs": 5 }},
                "context": {{ "max_turns": 7, "trim_policy": "preserve_persona" }}
            }}"#
        )
        .unwrap();

        let config = Config::load_from(file.path()).unwrap();
        assert_eq!(config.openai.model, "gpt-4o-mini");
        assert_eq!(config.openai.request_timeout_secs, 5);
        assert_eq!(config.openai.base_url, "https://api.openai.com");
        assert_eq!(config.context.max_turns, 7);
        assert_eq!(config.context.trim_policy, TrimPolicyKind::PreservePersona);
        assert_eq!(config.context.persona, DEFAULT_PERSONA);
    }

    #[test]
    fn test_load_from_invalid_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();

        let err = Config::load_from(file.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config"));
    }
}
