//! Console configuration.
//!
//! Configuration is read from `~/.config/backoffice/config.json` when present,
//! then overridden by `BACKOFFICE_*` environment variables so each deployment
//! (local, staging, production) can point at its own backend and realm.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::storage::{FileStore, KeyringStore, TokenStore};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "backoffice";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Callback page used by the provider's silent SSO check
pub const SILENT_CHECK_SSO_PATH: &str = "/silent-check-sso.html";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    File,
    Keyring,
}

impl FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "file" => Ok(StorageBackend::File),
            "keyring" => Ok(StorageBackend::Keyring),
            other => Err(anyhow::anyhow!("Unknown storage backend: {}", other)),
        }
    }
}

/// Identity-provider realm and client. These differ per environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityConfig {
    pub url: String,
    pub realm: String,
    pub client_id: String,
    #[serde(default)]
    pub post_logout_redirect_uri: Option<String>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:9090/".to_string(),
            realm: "e-commerce".to_string(),
            client_id: "e-commerce".to_string(),
            post_logout_redirect_uri: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    /// Origin the console is served from; redirect URIs hang off it
    pub app_origin: String,
    pub storage: StorageBackend,
    /// Fetch the profile from the backend when none is cached
    pub profile_fetch: bool,
    pub identity: IdentityConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8080/".to_string(),
            app_origin: "http://localhost:5173".to_string(),
            storage: StorageBackend::File,
            profile_fetch: false,
            identity: IdentityConfig::default(),
        }
    }
}

impl Config {
    /// Load the config file (if any) and apply environment overrides
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents).context("Failed to parse config file")?
        } else {
            Self::default()
        };
        config.apply_overrides(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Override fields from `BACKOFFICE_*` variables looked up through `var`
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = var("BACKOFFICE_API_URL") {
            self.api_base_url = v;
        }
        if let Some(v) = var("BACKOFFICE_APP_ORIGIN") {
            self.app_origin = v;
        }
        if let Some(v) = var("BACKOFFICE_STORAGE") {
            self.storage = v.parse()?;
        }
        if let Some(v) = var("BACKOFFICE_PROFILE_FETCH") {
            self.profile_fetch = matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Some(v) = var("BACKOFFICE_IDP_URL") {
            self.identity.url = v;
        }
        if let Some(v) = var("BACKOFFICE_IDP_REALM") {
            self.identity.realm = v;
        }
        if let Some(v) = var("BACKOFFICE_IDP_CLIENT_ID") {
            self.identity.client_id = v;
        }
        if let Some(v) = var("BACKOFFICE_IDP_LOGOUT_REDIRECT") {
            self.identity.post_logout_redirect_uri = Some(v);
        }
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    fn origin(&self) -> &str {
        self.app_origin.trim_end_matches('/')
    }

    pub fn silent_check_sso_redirect_uri(&self) -> String {
        format!("{}{}", self.origin(), SILENT_CHECK_SSO_PATH)
    }

    /// Where the provider sends the operator after an interactive login
    pub fn login_redirect_uri(&self) -> String {
        format!("{}/", self.origin())
    }

    /// Identity config with the logout redirect defaulted to the app origin
    pub fn identity(&self) -> IdentityConfig {
        let mut identity = self.identity.clone();
        if identity.post_logout_redirect_uri.is_none() {
            identity.post_logout_redirect_uri = Some(self.login_redirect_uri());
        }
        identity
    }

    /// Open the configured credential storage
    pub fn open_store(&self) -> Result<Arc<dyn TokenStore>> {
        match self.storage {
            StorageBackend::File => {
                let dir = self.cache_dir()?;
                debug!(dir = %dir.display(), "Using file credential storage");
                let store = FileStore::open(&dir).context("Failed to open session storage")?;
                Ok(Arc::new(store))
            }
            StorageBackend::Keyring => {
                debug!("Using keychain credential storage");
                Ok(Arc::new(KeyringStore::new()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_match_local_environment() {
        let config = Config::default();
        assert_eq!(config.api_base_url, "http://localhost:8080/");
        assert_eq!(config.identity.realm, "e-commerce");
        assert_eq!(
            config.silent_check_sso_redirect_uri(),
            "http://localhost:5173/silent-check-sso.html"
        );
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("BACKOFFICE_API_URL", "https://api.shop.example/"),
            ("BACKOFFICE_APP_ORIGIN", "https://admin.shop.example/"),
            ("BACKOFFICE_STORAGE", "Keyring"),
            ("BACKOFFICE_PROFILE_FETCH", "true"),
            ("BACKOFFICE_IDP_REALM", "shop-prod"),
            ("BACKOFFICE_IDP_CLIENT_ID", "admin-console"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config
            .apply_overrides(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.api_base_url, "https://api.shop.example/");
        assert_eq!(config.storage, StorageBackend::Keyring);
        assert!(config.profile_fetch);
        assert_eq!(config.identity.realm, "shop-prod");
        assert_eq!(config.identity.client_id, "admin-console");
        // Trailing slash on the origin is not doubled
        assert_eq!(config.login_redirect_uri(), "https://admin.shop.example/");
        assert_eq!(
            config.identity().post_logout_redirect_uri.as_deref(),
            Some("https://admin.shop.example/")
        );
    }

    #[test]
    fn test_unknown_storage_backend_is_rejected() {
        let mut config = Config::default();
        let result = config.apply_overrides(|name| {
            (name == "BACKOFFICE_STORAGE").then(|| "floppy".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_partial_config_file_uses_defaults() {
        let config: Config = serde_json::from_str(r#"{"api_base_url":"https://api.test/"}"#).unwrap();
        assert_eq!(config.api_base_url, "https://api.test/");
        assert_eq!(config.storage, StorageBackend::File);
        assert_eq!(config.identity, IdentityConfig::default());
    }
}
