use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::auth::{TokenStore, DEFAULT_BROKER_BASE};

pub const DEFAULT_GRAPH_API_BASE: &str = "https://graph.facebook.com/";
pub const DEFAULT_GRAPH_API_VERSION: &str = "v22.0";
pub const DEFAULT_CALLBACK_HOST: &str = "localhost";
pub const DEFAULT_CALLBACK_PORT: u16 = 8888;
pub const DEFAULT_LOGIN_TIMEOUT_SECS: u64 = 300;

const APP_DIR: &str = "meta-ads-mcp";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse configuration file: {0}")]
    ParseError(String),

    #[error("Invalid encryption key: {0}")]
    InvalidEncryptionKey(String),

    #[error("Invalid URL for {name}: {source}")]
    InvalidUrl {
        name: &'static str,
        source: url::ParseError,
    },

    #[error("Invalid value for {name}: {reason}")]
    InvalidValue { name: &'static str, reason: String },

    #[error("Failed to build HTTP client: {0}")]
    HttpClient(String),

    #[error("Could not determine the user config directory")]
    NoConfigDir,

    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),
}

/// Optional JSON config file; every field can be overridden by environment
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub pipeboard_api_token: Option<String>,
    pub pipeboard_api_base: Option<String>,
    pub app_id: Option<String>,
    pub app_secret: Option<String>,
    pub access_token: Option<String>,
    pub graph_api_base: Option<String>,
    pub graph_api_version: Option<String>,
    pub callback_host: Option<String>,
    pub callback_port: Option<u16>,
    pub token_path: Option<PathBuf>,
    /// 32-byte hex string
    pub token_key: Option<String>,
    pub login_timeout_secs: Option<u64>,
    pub open_browser: Option<bool>,
}

/// Which way tokens are obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    Broker,
    Direct,
    Unconfigured,
}

/// Runtime configuration
#[derive(Clone)]
pub struct Config {
    /// Long-lived credential for the delegated token broker
    pub broker_token: Option<String>,
    pub broker_base: Url,

    /// Direct OAuth application id
    pub app_id: Option<String>,
    pub app_secret: Option<String>,

    /// Token used as-is, bypassing both providers
    pub access_token: Option<String>,

    pub graph_api_base: Url,
    pub graph_api_version: String,

    pub callback_host: String,
    /// 0 binds an ephemeral port
    pub callback_port: u16,

    pub token_path: PathBuf,
    /// AES-256-GCM key for the token file
    pub token_key: Option<[u8; 32]>,

    pub login_timeout: Duration,
    pub open_browser: bool,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "[REDACTED]");
        f.debug_struct("Config")
            .field("broker_token", &redact(&self.broker_token))
            .field("broker_base", &self.broker_base.as_str())
            .field("app_id", &self.app_id)
            .field("app_secret", &redact(&self.app_secret))
            .field("access_token", &redact(&self.access_token))
            .field("graph_api_base", &self.graph_api_base.as_str())
            .field("graph_api_version", &self.graph_api_version)
            .field("callback_host", &self.callback_host)
            .field("callback_port", &self.callback_port)
            .field("token_path", &self.token_path)
            .field("token_key", &self.token_key.map(|_| "[REDACTED]"))
            .field("login_timeout", &self.login_timeout)
            .field("open_browser", &self.open_browser)
            .finish()
    }
}

impl Config {
    /// Load `.env`, then the config file (if any), then environment overrides
    pub fn from_env_or_file() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let file = match Self::config_path() {
            Ok(path) if path.exists() => Self::read_file(&path)?,
            _ => ConfigFile::default(),
        };

        Self::from_sources(file, |name| std::env::var(name).ok())
    }

    /// Merge `file` with values from `env`. Empty environment values count
    /// as unset.
    pub fn from_sources<F>(file: ConfigFile, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| env(name).filter(|v| !v.trim().is_empty());

        let broker_base = var("PIPEBOARD_API_BASE")
            .or(file.pipeboard_api_base)
            .unwrap_or_else(|| DEFAULT_BROKER_BASE.to_string());
        let graph_api_base = var("META_GRAPH_API_BASE")
            .or(file.graph_api_base)
            .unwrap_or_else(|| DEFAULT_GRAPH_API_BASE.to_string());

        let callback_port = match var("META_ADS_CALLBACK_PORT") {
            Some(raw) => parse_value("META_ADS_CALLBACK_PORT", &raw)?,
            None => file.callback_port.unwrap_or(DEFAULT_CALLBACK_PORT),
        };
        let login_timeout_secs = match var("META_ADS_LOGIN_TIMEOUT_SECS") {
            Some(raw) => parse_value("META_ADS_LOGIN_TIMEOUT_SECS", &raw)?,
            None => file.login_timeout_secs.unwrap_or(DEFAULT_LOGIN_TIMEOUT_SECS),
        };
        let open_browser = match var("META_ADS_OPEN_BROWSER") {
            Some(raw) => parse_bool("META_ADS_OPEN_BROWSER", &raw)?,
            None => file.open_browser.unwrap_or(true),
        };

        let token_path = match var("META_ADS_TOKEN_PATH").map(PathBuf::from).or(file.token_path) {
            Some(path) => path,
            None => TokenStore::default_path().map_err(|_| ConfigError::NoConfigDir)?,
        };
        let token_key = var("META_ADS_TOKEN_KEY")
            .or(file.token_key)
            .map(|hex| Self::parse_encryption_key(&hex))
            .transpose()?;

        Ok(Config {
            broker_token: var("PIPEBOARD_API_TOKEN").or(file.pipeboard_api_token),
            broker_base: parse_base_url("PIPEBOARD_API_BASE", &broker_base)?,
            app_id: var("META_APP_ID").or(file.app_id),
            app_secret: var("META_APP_SECRET").or(file.app_secret),
            access_token: var("META_ACCESS_TOKEN").or(file.access_token),
            graph_api_base: parse_base_url("META_GRAPH_API_BASE", &graph_api_base)?,
            graph_api_version: var("META_GRAPH_API_VERSION")
                .or(file.graph_api_version)
                .unwrap_or_else(|| DEFAULT_GRAPH_API_VERSION.to_string()),
            callback_host: var("META_ADS_CALLBACK_HOST")
                .or(file.callback_host)
                .unwrap_or_else(|| DEFAULT_CALLBACK_HOST.to_string()),
            callback_port,
            token_path,
            token_key,
            login_timeout: Duration::from_secs(login_timeout_secs),
            open_browser,
        })
    }

    /// Broker wins when both are configured
    pub fn auth_mode(&self) -> AuthMode {
        if self.broker_token.is_some() {
            AuthMode::Broker
        } else if self.app_id.is_some() {
            AuthMode::Direct
        } else {
            AuthMode::Unconfigured
        }
    }

    /// Versioned Graph API root, e.g. `https://graph.facebook.com/v22.0/`
    pub fn graph_api_url(&self) -> Result<Url, ConfigError> {
        let version = self.graph_api_version.trim_matches('/');
        self.graph_api_base
            .join(&format!("{}/", version))
            .map_err(|source| ConfigError::InvalidUrl {
                name: "META_GRAPH_API_VERSION",
                source,
            })
    }

    /// `dirs::config_dir()/meta-ads-mcp/config.json`
    pub fn config_path() -> Result<PathBuf, ConfigError> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    fn config_dir() -> Result<PathBuf, ConfigError> {
        dirs::config_dir()
            .map(|dir| dir.join(APP_DIR))
            .ok_or(ConfigError::NoConfigDir)
    }

    fn read_file(path: &Path) -> Result<ConfigFile, ConfigError> {
        let contents = fs::read_to_string(path)?;
        serde_json::from_str(&contents)
            .map_err(|e| ConfigError::ParseError(format!("{}: {}", path.display(), e)))
    }

    /// Parse encryption key from hex string (must be 32 bytes)
    fn parse_encryption_key(hex_str: &str) -> Result<[u8; 32], ConfigError> {
        let bytes = hex::decode(hex_str.trim())
            .map_err(|e| ConfigError::InvalidEncryptionKey(format!("Invalid hex: {}", e)))?;

        if bytes.len() != 32 {
            return Err(ConfigError::InvalidEncryptionKey(format!(
                "Expected 32 bytes, got {}",
                bytes.len()
            )));
        }

        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        Ok(key)
    }
}

/// Parse a base URL, making sure relative joins append to its path
fn parse_base_url(name: &'static str, raw: &str) -> Result<Url, ConfigError> {
    let normalized = if raw.ends_with('/') {
        raw.to_string()
    } else {
        format!("{}/", raw)
    };
    Url::parse(&normalized).map_err(|source| ConfigError::InvalidUrl { name, source })
}

fn parse_value<T>(name: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        name,
        reason: e.to_string(),
    })
}

fn parse_bool(name: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            name,
            reason: format!("expected a boolean, got {:?}", other),
        }),
    }
}
