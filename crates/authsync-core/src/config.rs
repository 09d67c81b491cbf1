//! Application configuration management.
//!
//! This module handles loading and saving the application configuration:
//! provider endpoint and key, which cache backend holds the session mirror,
//! navigation targets, and the guard and confirmation timings.
//!
//! Configuration is stored at `~/.config/authsync/config.json`. The provider
//! settings and guard timeout can be overridden from the environment.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::auth::actions::{DEFAULT_LOGIN_PATH, DEFAULT_PROTECTED_HOME, DEFAULT_PUBLIC_PATH};
use crate::auth::{ActionOptions, GuardOptions};
use crate::cache::{FileCache, KeyringCache, MemoryCache, PersistentCache};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "authsync";

/// Config file name
const CONFIG_FILE: &str = "config.json";

const DEFAULT_GUARD_TIMEOUT_MS: u64 = 3000;
const DEFAULT_CONFIRM_REFRESH_DELAY_MS: u64 = 300;

pub const ENV_PROVIDER_URL: &str = "SUPABASE_URL";
pub const ENV_PROVIDER_ANON_KEY: &str = "SUPABASE_ANON_KEY";
pub const ENV_GUARD_TIMEOUT_MS: &str = "AUTHSYNC_GUARD_TIMEOUT_MS";

/// Where the session mirror (and the provider's own tokens) are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CacheBackend {
    /// One JSON file per key under the platform cache directory.
    #[default]
    File,
    /// OS credential store.
    Keyring,
    /// Process memory only; nothing survives a restart.
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub provider_url: Option<String>,
    pub provider_anon_key: Option<String>,
    pub cache_backend: CacheBackend,
    pub guard_timeout_ms: u64,
    pub confirm_refresh_delay_ms: u64,
    pub protected_home: String,
    pub public_path: String,
    pub login_path: String,
    pub last_email: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            provider_url: None,
            provider_anon_key: None,
            cache_backend: CacheBackend::default(),
            guard_timeout_ms: DEFAULT_GUARD_TIMEOUT_MS,
            confirm_refresh_delay_ms: DEFAULT_CONFIRM_REFRESH_DELAY_MS,
            protected_home: DEFAULT_PROTECTED_HOME.to_string(),
            public_path: DEFAULT_PUBLIC_PATH.to_string(),
            login_path: DEFAULT_LOGIN_PATH.to_string(),
            last_email: None,
        }
    }
}

impl Config {
    /// Load from the config file, then apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    /// Override provider settings and guard timeout from `lookup`.
    /// Blank values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = lookup(ENV_PROVIDER_URL) {
            self.provider_url = Some(url);
        }
        if let Some(key) = lookup(ENV_PROVIDER_ANON_KEY) {
            self.provider_anon_key = Some(key);
        }
        if let Some(raw) = lookup(ENV_GUARD_TIMEOUT_MS) {
            match raw.trim().parse::<u64>() {
                Ok(ms) => self.guard_timeout_ms = ms,
                Err(_) => warn!(value = %raw, "Ignoring invalid {}", ENV_GUARD_TIMEOUT_MS),
            }
        }
    }

    /// Provider URL and anon key, if both are set.
    pub fn provider(&self) -> Option<(&str, &str)> {
        let url = self.provider_url.as_deref().filter(|s| !s.is_empty())?;
        let key = self.provider_anon_key.as_deref().filter(|s| !s.is_empty())?;
        Some((url, key))
    }

    pub fn guard_options(&self) -> GuardOptions {
        GuardOptions {
            timeout: Duration::from_millis(self.guard_timeout_ms),
            login_path: self.login_path.clone(),
        }
    }

    pub fn action_options(&self) -> ActionOptions {
        ActionOptions {
            confirm_refresh_delay: Duration::from_millis(self.confirm_refresh_delay_ms),
            protected_home: self.protected_home.clone(),
            public_path: self.public_path.clone(),
            login_path: self.login_path.clone(),
        }
    }

    /// Open the configured cache backend.
    pub fn open_cache(&self) -> Result<Arc<dyn PersistentCache>> {
        let cache: Arc<dyn PersistentCache> = match self.cache_backend {
            CacheBackend::File => Arc::new(FileCache::new(self.cache_dir()?)?),
            CacheBackend::Keyring => Arc::new(KeyringCache::new(APP_NAME)),
            CacheBackend::Memory => Arc::new(MemoryCache::new()),
        };
        Ok(cache)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load_from(&dir.path().join("config.json")).unwrap();
        assert_eq!(config.guard_timeout_ms, 3000);
        assert_eq!(config.confirm_refresh_delay_ms, 300);
        assert_eq!(config.login_path, "/login");
        assert_eq!(config.cache_backend, CacheBackend::File);
        assert!(config.provider().is_none());
    }

    #[test]
    fn test_save_and_load_roundtrip_with_partial_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let config = Config {
            last_email: Some("a@b.com".to_string()),
            cache_backend: CacheBackend::Keyring,
            ..Config::default()
        };
        config.save_to(&path).unwrap();
        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.last_email.as_deref(), Some("a@b.com"));
        assert_eq!(loaded.cache_backend, CacheBackend::Keyring);

        // Older files without the newer fields still load
        std::fs::write(&path, r#"{"provider_url":"https://x.supabase.co"}"#).unwrap();
        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.provider_url.as_deref(), Some("https://x.supabase.co"));
        assert_eq!(loaded.protected_home, "/dashboard");
    }

    #[test]
    fn test_unparsable_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{").unwrap();
        assert!(Config::load_from(&path).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_PROVIDER_URL, "https://env.supabase.co"),
            (ENV_PROVIDER_ANON_KEY, "anon"),
            (ENV_GUARD_TIMEOUT_MS, "1500"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_env(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.provider(), Some(("https://env.supabase.co", "anon")));
        assert_eq!(config.guard_options().timeout, Duration::from_millis(1500));
    }

    #[test]
    fn test_blank_and_invalid_env_values_are_ignored() {
        let mut config = Config {
            provider_url: Some("https://file.supabase.co".to_string()),
            ..Config::default()
        };
        config.apply_env(|key| match key {
            ENV_PROVIDER_URL => Some("  ".to_string()),
            ENV_GUARD_TIMEOUT_MS => Some("soon".to_string()),
            _ => None,
        });

        assert_eq!(config.provider_url.as_deref(), Some("https://file.supabase.co"));
        assert_eq!(config.guard_timeout_ms, 3000);
        // Key still missing
        assert!(config.provider().is_none());
    }

    #[test]
    fn test_action_options_follow_config() {
        let config = Config {
            protected_home: "/rules".to_string(),
            confirm_refresh_delay_ms: 50,
            ..Config::default()
        };
        let options = config.action_options();
        assert_eq!(options.protected_home, "/rules");
        assert_eq!(options.confirm_refresh_delay, Duration::from_millis(50));
        assert_eq!(options.public_path, "/");
    }
}
