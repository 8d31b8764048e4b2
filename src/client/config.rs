use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_BASE_URL: &str = "https://urbanvital-backend.onrender.com/api";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoints {
    pub login: String,
    pub refresh: String,
    pub logout: String,
    pub profile: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            login: "/auth/login/".to_string(),
            refresh: "/auth/token/refresh/".to_string(),
            logout: "/auth/logout/".to_string(),
            profile: "/auth/profile/".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub base_url: String,

    /// Session file; defaults to `~/.urbanvital/session.json`.
    #[serde(default)]
    pub storage_path: Option<PathBuf>,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Bound on a single renewal round-trip.
    #[serde(default = "default_renewal_timeout")]
    pub renewal_timeout_secs: u64,

    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,

    #[serde(default = "default_renewal_margin")]
    pub renewal_margin_secs: u64,

    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,

    #[serde(default)]
    pub endpoints: Endpoints,
}

fn default_request_timeout() -> u64 {
    10
}
fn default_renewal_timeout() -> u64 {
    15
}
fn default_cache_ttl() -> u64 {
    300
}
fn default_renewal_margin() -> u64 {
    60
}
fn default_stale_after() -> u64 {
    55 * 60
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL)
    }
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            storage_path: None,
            request_timeout_secs: default_request_timeout(),
            renewal_timeout_secs: default_renewal_timeout(),
            cache_ttl_secs: default_cache_ttl(),
            renewal_margin_secs: default_renewal_margin(),
            stale_after_secs: default_stale_after(),
            endpoints: Endpoints::default(),
        }
    }

    pub fn from_file(path: &str) -> Result<Self> {
        let raw = fs::read_to_string(path).context("reading config file")?;
        let cfg: ClientConfig = serde_json::from_str(&raw).context("parsing config JSON")?;
        Ok(cfg)
    }

    /// File if present, defaults otherwise, then environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let cfg = match path {
            Some(p) if std::path::Path::new(p).exists() => Self::from_file(p)?,
            Some(p) => {
                debug!(path = p, "config file not found, using defaults");
                Self::default()
            }
            None => Self::default(),
        };
        cfg.with_env_overrides()
    }

    /// Environment variables:
    /// - `URBANVITAL_BASE_URL`
    /// - `URBANVITAL_STORAGE_PATH`
    /// - `URBANVITAL_RENEWAL_TIMEOUT_SECS`
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(url) = std::env::var("URBANVITAL_BASE_URL") {
            self.base_url = url;
        }
        if let Ok(path) = std::env::var("URBANVITAL_STORAGE_PATH") {
            self.storage_path = Some(PathBuf::from(path));
        }
        if let Ok(secs) = std::env::var("URBANVITAL_RENEWAL_TIMEOUT_SECS") {
            self.renewal_timeout_secs = secs
                .parse()
                .context("URBANVITAL_RENEWAL_TIMEOUT_SECS must be a number of seconds")?;
        }
        Ok(self)
    }

    pub fn storage_path(&self) -> PathBuf {
        self.storage_path.clone().unwrap_or_else(|| {
            std::env::var_os("HOME")
                .map(PathBuf::from)
                .unwrap_or_default()
                .join(".urbanvital")
                .join("session.json")
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn renewal_timeout(&self) -> Duration {
        Duration::from_secs(self.renewal_timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::{Mutex, OnceLock};
    use tempfile::NamedTempFile;

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    fn lock_env() -> std::sync::MutexGuard<'static, ()> {
        match ENV_LOCK.get_or_init(|| Mutex::new(())).lock() {
            Ok(g) => g,
            Err(e) => e.into_inner(),
        }
    }

    #[test]
    fn test_config_parsing_with_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{
                "base_url": "http://127.0.0.1:8000/api",
                "renewal_timeout_secs": 5,
                "endpoints": {{"logout": "/auth/signout/"}}
            }}"#
        )
        .unwrap();

        let config = ClientConfig::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.base_url, "http://127.0.0.1:8000/api");
        assert_eq!(config.renewal_timeout(), Duration::from_secs(5));
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.cache_ttl(), Duration::from_secs(300));
        assert_eq!(config.stale_after_secs, 3300);
        assert_eq!(config.endpoints.logout, "/auth/signout/");
        assert_eq!(config.endpoints.refresh, "/auth/token/refresh/");
    }

    #[test]
    fn test_config_missing_file() {
        let result = ClientConfig::from_file("/nonexistent/path/client.json");
        assert!(result.is_err());
    }

    #[test]
    fn test_config_invalid_json() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{{invalid json").unwrap();

        let result = ClientConfig::from_file(file.path().to_str().unwrap());
        assert!(result.is_err());
    }

    #[test]
    fn test_env_overrides() {
        let _g = lock_env();
        std::env::set_var("URBANVITAL_BASE_URL", "http://localhost:9000/api");
        std::env::set_var("URBANVITAL_STORAGE_PATH", "/tmp/uv-session.json");
        std::env::set_var("URBANVITAL_RENEWAL_TIMEOUT_SECS", "7");

        let config = ClientConfig::load(None).unwrap();
        assert_eq!(config.base_url, "http://localhost:9000/api");
        assert_eq!(config.storage_path(), PathBuf::from("/tmp/uv-session.json"));
        assert_eq!(config.renewal_timeout(), Duration::from_secs(7));

        std::env::set_var("URBANVITAL_RENEWAL_TIMEOUT_SECS", "soon");
        assert!(ClientConfig::load(None).is_err());

        std::env::remove_var("URBANVITAL_BASE_URL");
        std::env::remove_var("URBANVITAL_STORAGE_PATH");
        std::env::remove_var("URBANVITAL_RENEWAL_TIMEOUT_SECS");
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let _g = lock_env();
        let config = ClientConfig::load(Some("/nonexistent/client.json")).unwrap();
        assert_eq!(config.renewal_timeout(), Duration::from_secs(15));
    }
}
