//! Application configuration management.
//!
//! Two layers:
//! - `ClientConfig`: what the `ApiClient` needs (base URL, timeouts, routes),
//!   resolved from defaults, the config file and the environment.
//! - `Config`: the persisted user config at
//!   `~/.config/storefront/config.json` (base URL override, last email,
//!   session backend).

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Application name used for config/data directory paths
const APP_NAME: &str = "storefront";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Used when neither the config file nor the environment names a backend.
const DEFAULT_BASE_URL: &str = "http://localhost:8080";

/// HTTP request timeout in seconds.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Upper bound on a refresh handshake. Every request waiting on a refresh
/// is blocked for at most this long.
const DEFAULT_REFRESH_TIMEOUT_SECS: u64 = 15;

const DEFAULT_CORRELATION_HEADER: &str = "X-Correlation-ID";

pub const ENV_API_URL: &str = "STOREFRONT_API_URL";
pub const ENV_API_TIMEOUT_SECS: &str = "STOREFRONT_API_TIMEOUT_SECS";
pub const ENV_REFRESH_TIMEOUT_SECS: &str = "STOREFRONT_REFRESH_TIMEOUT_SECS";

/// BFF routes used by the auth flows. Paths are relative to the base URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoints {
    pub login: String,
    pub register: String,
    pub refresh: String,
    pub logout: String,
    pub profile: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            login: "/api/auth/login".to_string(),
            register: "/api/auth/register".to_string(),
            refresh: "/api/auth/refresh".to_string(),
            logout: "/api/auth/logout".to_string(),
            profile: "/api/user/profile".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub request_timeout: Duration,
    pub refresh_timeout: Duration,
    pub correlation_header: String,
    pub endpoints: Endpoints,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            refresh_timeout: Duration::from_secs(DEFAULT_REFRESH_TIMEOUT_SECS),
            correlation_header: DEFAULT_CORRELATION_HEADER.to_string(),
            endpoints: Endpoints::default(),
        }
    }
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    /// Defaults overridden by the process environment
    pub fn from_env() -> Self {
        Self::default().apply_env()
    }

    pub fn apply_env(self) -> Self {
        self.apply_vars(|key| std::env::var(key).ok())
    }

    /// Override fields from a variable lookup. Unparseable values are
    /// ignored with a warning.
    pub fn apply_vars<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_API_URL).filter(|v| !v.trim().is_empty()) {
            debug!(base_url = %url, "Base URL from environment");
            self.base_url = url.trim().to_string();
        }
        if let Some(secs) = parse_secs(&lookup, ENV_API_TIMEOUT_SECS) {
            self.request_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_secs(&lookup, ENV_REFRESH_TIMEOUT_SECS) {
            self.refresh_timeout = Duration::from_secs(secs);
        }
        self
    }

    pub fn with_refresh_timeout(mut self, timeout: Duration) -> Self {
        self.refresh_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

fn parse_secs<F>(lookup: &F, key: &str) -> Option<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(0) => {
            warn!(key, "Timeout must be positive, using default");
            None
        }
        Ok(secs) => Some(secs),
        Err(e) => {
            warn!(key, value = %raw, error = %e, "Invalid timeout, using default");
            None
        }
    }
}

/// Where the session is persisted between runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionBackendKind {
    #[default]
    File,
    Keyring,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub api_base_url: Option<String>,
    pub last_email: Option<String>,
    #[serde(default)]
    pub session_backend: SessionBackendKind,
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            Ok(serde_json::from_str(&contents).context("Failed to parse config file")?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Directory holding the persisted session
    pub fn data_dir(&self) -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }

    /// Client settings: defaults, then this file, then the environment
    pub fn client_config(&self) -> ClientConfig {
        let mut client = ClientConfig::default();
        if let Some(ref url) = self.api_base_url {
            client.base_url = url.clone();
        }
        client.apply_env()
    }
}
