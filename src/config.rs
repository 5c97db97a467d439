//! Configuration loading for OkAimy Connect.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `OKAIMY_`, producing a typed [`AppConfig`].

use std::{collections::BTreeMap, env, path::PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application configuration derived from `OKAIMY_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub google_client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub google_client_secret: Option<String>,
    #[serde(default = "default_google_redirect_uri")]
    pub google_redirect_uri: String,
    /// Authorization endpoint. Overridable for tests.
    #[serde(default = "default_google_auth_url")]
    pub google_auth_url: String,
    /// Token endpoint. Overridable for tests.
    #[serde(default = "default_google_token_url")]
    pub google_token_url: String,
    /// Userinfo endpoint. Overridable for tests.
    #[serde(default = "default_google_userinfo_url")]
    pub google_userinfo_url: String,
    #[serde(default)]
    pub token_refresh: TokenRefreshConfig,
}

/// On-demand token refresh configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct TokenRefreshConfig {
    /// Request timeout for calls to the provider token endpoint in seconds
    /// (default: 10)
    #[serde(default = "default_refresh_http_timeout_seconds")]
    pub http_timeout_seconds: u64,

    /// Number of additional attempts after a transient network failure
    /// (default: 2)
    #[serde(default = "default_refresh_max_retries")]
    pub max_retries: u32,

    /// Base delay between retry attempts in milliseconds, doubled per attempt
    /// with jitter (default: 250)
    #[serde(default = "default_refresh_retry_base_ms")]
    pub retry_base_ms: u64,
}

impl TokenRefreshConfig {
    /// Validate refresh configuration bounds
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.http_timeout_seconds == 0 || self.http_timeout_seconds > 60 {
            return Err(ConfigError::InvalidRefreshTimeout {
                value: self.http_timeout_seconds,
            });
        }

        if self.max_retries > 5 {
            return Err(ConfigError::InvalidRefreshRetries {
                value: self.max_retries,
            });
        }

        if self.retry_base_ms == 0 || self.retry_base_ms > 10_000 {
            return Err(ConfigError::InvalidRefreshRetryBase {
                value: self.retry_base_ms,
            });
        }

        Ok(())
    }
}

impl Default for TokenRefreshConfig {
    fn default() -> Self {
        Self {
            http_timeout_seconds: default_refresh_http_timeout_seconds(),
            max_retries: default_refresh_max_retries(),
            retry_base_ms: default_refresh_retry_base_ms(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            google_client_id: None,
            google_client_secret: None,
            google_redirect_uri: default_google_redirect_uri(),
            google_auth_url: default_google_auth_url(),
            google_token_url: default_google_token_url(),
            google_userinfo_url: default_google_userinfo_url(),
            token_refresh: TokenRefreshConfig::default(),
        }
    }
}

impl AppConfig {
    /// Returns a redacted JSON representation (secrets are redacted).
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut config = self.clone();
        if config.google_client_id.is_some() {
            config.google_client_id = Some("[REDACTED]".to_string());
        }
        if config.google_client_secret.is_some() {
            config.google_client_secret = Some("[REDACTED]".to_string());
        }
        serde_json::to_string_pretty(&config)
    }

    /// Validates the configuration, returning an error if required settings
    /// are missing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Google credentials are only required outside local/test profiles so
        // the status and store paths stay usable in development.
        if !matches!(self.profile.as_str(), "local" | "test") {
            if self.google_client_id.is_none() {
                return Err(ConfigError::MissingGoogleClientId);
            }
            if self.google_client_secret.is_none() {
                return Err(ConfigError::MissingGoogleClientSecret);
            }
        }

        self.token_refresh.validate()?;

        Ok(())
    }
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_google_redirect_uri() -> String {
    "https://okaimy.com/api/gmail/callback".to_string()
}

fn default_google_auth_url() -> String {
    "https://accounts.google.com/o/oauth2/v2/auth".to_string()
}

fn default_google_token_url() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

fn default_google_userinfo_url() -> String {
    "https://www.googleapis.com/oauth2/v2/userinfo".to_string()
}

fn default_refresh_http_timeout_seconds() -> u64 {
    10
}

fn default_refresh_max_retries() -> u32 {
    2
}

fn default_refresh_retry_base_ms() -> u64 {
    250
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("Google client ID is missing; set OKAIMY_GOOGLE_CLIENT_ID environment variable")]
    MissingGoogleClientId,
    #[error(
        "Google client secret is missing; set OKAIMY_GOOGLE_CLIENT_SECRET environment variable"
    )]
    MissingGoogleClientSecret,
    #[error("refresh HTTP timeout must be between 1 and 60 seconds, got {value}")]
    InvalidRefreshTimeout { value: u64 },
    #[error("refresh retry count must not exceed 5, got {value}")]
    InvalidRefreshRetries { value: u32 },
    #[error("refresh retry base delay must be between 1 and 10000 ms, got {value}")]
    InvalidRefreshRetryBase { value: u64 },
}

/// Loads configuration using layered `.env` files and `OKAIMY_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Loads configuration, layering `.env`, `.env.local`, profile files and
    /// finally the process environment.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        // Overlay process environment last so it wins.
        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix("OKAIMY_") {
                layered.insert(stripped.to_string(), value);
            }
        }

        let profile = layered
            .remove("PROFILE")
            .filter(|v| !v.is_empty())
            .unwrap_or(profile_hint);
        let log_level = layered
            .remove("LOG_LEVEL")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_log_level);
        let log_format = layered
            .remove("LOG_FORMAT")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_log_format);

        let google_client_id = layered.remove("GOOGLE_CLIENT_ID").and_then(non_empty);
        let google_client_secret = layered.remove("GOOGLE_CLIENT_SECRET").and_then(non_empty);
        let google_redirect_uri = layered
            .remove("GOOGLE_REDIRECT_URI")
            .and_then(non_empty)
            .unwrap_or_else(default_google_redirect_uri);
        let google_auth_url = layered
            .remove("GOOGLE_AUTH_URL")
            .and_then(non_empty)
            .unwrap_or_else(default_google_auth_url);
        let google_token_url = layered
            .remove("GOOGLE_TOKEN_URL")
            .and_then(non_empty)
            .unwrap_or_else(default_google_token_url);
        let google_userinfo_url = layered
            .remove("GOOGLE_USERINFO_URL")
            .and_then(non_empty)
            .unwrap_or_else(default_google_userinfo_url);

        let token_refresh = TokenRefreshConfig {
            http_timeout_seconds: layered
                .remove("TOKEN_REFRESH_HTTP_TIMEOUT_SECONDS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_refresh_http_timeout_seconds),
            max_retries: layered
                .remove("TOKEN_REFRESH_MAX_RETRIES")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_refresh_max_retries),
            retry_base_ms: layered
                .remove("TOKEN_REFRESH_RETRY_BASE_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_refresh_retry_base_ms),
        };

        let config = AppConfig {
            profile,
            log_level,
            log_format,
            google_client_id,
            google_client_secret,
            google_redirect_uri,
            google_auth_url,
            google_token_url,
            google_userinfo_url,
            token_refresh,
        };

        config.validate()?;

        Ok(config)
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        let profile = env::var("OKAIMY_PROFILE")
            .ok()
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}", &profile)),
            &mut values,
        )?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}.local", &profile)),
            &mut values,
        )?;

        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix("OKAIMY_") {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
