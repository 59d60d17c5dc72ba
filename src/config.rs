//! Configuration file parser for ~/.config/quill/config.toml.
//!
//! The config file is optional: a missing file yields `Config::default()`.
//! Unknown keys are silently ignored by serde (with `deny_unknown_fields`
//! off), though we log a warning when the file contains potential typos.
use secrecy::SecretString;
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level application configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
/// Missing keys fall back to `Default::default()`.
///
/// The custom Debug impl masks `fever_api_key` to keep the credential out of
/// logs and error messages.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Account kind: "local" or "fever".
    pub account: String,

    /// Fever API endpoint, e.g. `https://reader.example.com/fever/`.
    /// Required when `account = "fever"`.
    pub fever_endpoint: Option<String>,

    /// Fever API key (MD5 of `user:password`, per the protocol).
    /// The QUILL_FEVER_API_KEY env var takes precedence over this key.
    pub fever_api_key: Option<String>,

    /// Minutes before foreground data counts as stale. 0 keeps the built-in
    /// 5-minute window.
    pub refresh_stale_minutes: u64,

    /// Background refresh interval in minutes (clamped to a 30-minute
    /// minimum at registration).
    pub background_interval_minutes: u64,

    /// Whether the background refresh loop runs at all.
    pub background_refresh: bool,

    /// Seed the bundled starter subscriptions when the store is empty.
    pub seed_default_feeds: bool,

    /// Database file path; defaults to `quill.db` in the config directory.
    pub db_path: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            account: "local".to_string(),
            fever_endpoint: None,
            fever_api_key: None,
            refresh_stale_minutes: 0,
            background_interval_minutes: 30,
            background_refresh: true,
            seed_default_feeds: true,
            db_path: None,
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("account", &self.account)
            .field("fever_endpoint", &self.fever_endpoint)
            .field(
                "fever_api_key",
                &self.fever_api_key.as_ref().map(|_| "[REDACTED]"),
            )
            .field("refresh_stale_minutes", &self.refresh_stale_minutes)
            .field(
                "background_interval_minutes",
                &self.background_interval_minutes,
            )
            .field("background_refresh", &self.background_refresh)
            .field("seed_default_feeds", &self.seed_default_feeds)
            .field("db_path", &self.db_path)
            .finish()
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        // Check file size before reading to bound memory use on a corrupted
        // config file.
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Race condition: file deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            let known_keys = [
                "account",
                "fever_endpoint",
                "fever_api_key",
                "refresh_stale_minutes",
                "background_interval_minutes",
                "background_refresh",
                "seed_default_feeds",
                "db_path",
            ];
            for key in raw.keys() {
                if !known_keys.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(&content)?;
        tracing::info!(path = %path.display(), account = %config.account, "Loaded configuration");
        Ok(config)
    }

    /// The Fever credential, environment taking precedence over the file.
    pub fn fever_api_key(&self) -> Option<SecretString> {
        std::env::var("QUILL_FEVER_API_KEY")
            .ok()
            .or_else(|| self.fever_api_key.clone())
            .map(SecretString::from)
    }
}

// ============================================================================
// Tests
// ============================================================================
