//! Agent configuration management.
//!
//! This module handles loading the agent configuration, which
//! names the running build, the origin whose responses may be cached, the
//! asset manifest, the hosts that bypass the agent entirely and the
//! auxiliary store limits.
//!
//! Configuration is stored at `~/.config/skycache/config.json`. Selected
//! fields can be overridden through `SKYCACHE_*` environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

/// Application name used for config/data directory paths
const APP_NAME: &str = "skycache";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Hard cap on a serialized auxiliary payload (1 MiB)
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

/// Auxiliary records live for 30 minutes by default.
const DEFAULT_AUX_TTL_SECS: u64 = 30 * 60;

/// A lifecycle guard older than this is considered abandoned.
const DEFAULT_SINGLE_FLIGHT_TIMEOUT_SECS: u64 = 120;

/// HTTP request timeout in seconds.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentConfig {
    pub app_version: String,
    pub build_id: String,
    pub cache_prefix: String,
    pub origin: Url,
    pub manifest: Vec<String>,
    pub bypass_hosts: Vec<String>,
    pub favorites: Vec<String>,
    pub auxiliary: AuxiliaryConfig,
    /// Bound tier-3 lookups to this many of the newest namespaces.
    pub stale_namespace_limit: Option<usize>,
    pub single_flight_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub sync: SyncConfig,
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuxiliaryConfig {
    pub schema_version: u32,
    pub ttl_secs: u64,
    pub max_payload_bytes: usize,
}

/// Minimum intervals for the periodic sync signals.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    pub weather_secs: u64,
    pub favorites_secs: u64,
    pub health_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            build_id: "dev".to_string(),
            cache_prefix: APP_NAME.to_string(),
            origin: default_origin(),
            manifest: [
                "/",
                "/index.html",
                "/app.js",
                "/styles.css",
                "/manifest.json",
                "/icons/icon-192.png",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            bypass_hosts: [
                "api.weather.gov",
                "api.open-meteo.com",
                "api.rainviewer.com",
                "tilecache.rainviewer.com",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            favorites: Vec::new(),
            auxiliary: AuxiliaryConfig::default(),
            stale_namespace_limit: None,
            single_flight_timeout_secs: DEFAULT_SINGLE_FLIGHT_TIMEOUT_SECS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            sync: SyncConfig::default(),
            data_dir: None,
        }
    }
}

impl Default for AuxiliaryConfig {
    fn default() -> Self {
        Self {
            schema_version: 1,
            ttl_secs: DEFAULT_AUX_TTL_SECS,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            weather_secs: 15 * 60,
            favorites_secs: 60 * 60,
            health_secs: 6 * 60 * 60,
        }
    }
}

fn default_origin() -> Url {
    Url::parse("http://localhost:8080/").unwrap_or_else(|_| unreachable!("literal URL parses"))
}

impl AgentConfig {
    /// Load from the default location, falling back to defaults if absent.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    /// Apply `SKYCACHE_*` environment overrides.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(build_id) = std::env::var("SKYCACHE_BUILD_ID") {
            self.build_id = build_id;
        }
        if let Ok(version) = std::env::var("SKYCACHE_APP_VERSION") {
            self.app_version = version;
        }
        if let Ok(origin) = std::env::var("SKYCACHE_ORIGIN") {
            self.origin = Url::parse(&origin)
                .with_context(|| format!("Invalid SKYCACHE_ORIGIN: {}", origin))?;
        }
        if let Ok(dir) = std::env::var("SKYCACHE_DATA_DIR") {
            self.data_dir = Some(PathBuf::from(dir));
        }
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Directory holding persisted namespaces, the retry queue and logs.
    pub fn data_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.data_dir {
            return Ok(dir.clone());
        }
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    /// Name of the namespace owned by the running build.
    pub fn active_namespace(&self) -> String {
        format!("{}-{}", self.cache_prefix, self.build_id)
    }

    /// Name of the auxiliary namespace, versioned by its own schema.
    pub fn auxiliary_namespace(&self) -> String {
        format!("{}-health-v{}", self.cache_prefix, self.auxiliary.schema_version)
    }

    pub fn single_flight_timeout(&self) -> Duration {
        Duration::from_secs(self.single_flight_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_names() {
        let config = AgentConfig {
            build_id: "20240301-abc".to_string(),
            ..Default::default()
        };
        assert_eq!(config.active_namespace(), "skycache-20240301-abc");
        assert_eq!(config.auxiliary_namespace(), "skycache-health-v1");
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: AgentConfig =
            serde_json::from_str(r#"{"buildId": "b7", "manifest": ["/"]}"#).unwrap();
        assert_eq!(config.build_id, "b7");
        assert_eq!(config.manifest, vec!["/".to_string()]);
        assert_eq!(config.auxiliary.max_payload_bytes, DEFAULT_MAX_PAYLOAD_BYTES);
        assert!(config.bypass_hosts.contains(&"api.weather.gov".to_string()));
    }

    #[test]
    fn test_load_from_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig::load_from(&dir.path().join("nope.json")).unwrap();
        assert_eq!(config.cache_prefix, "skycache");
    }

    #[test]
    fn test_explicit_data_dir() {
        let config = AgentConfig {
            data_dir: Some(PathBuf::from("/tmp/skycache-test")),
            ..Default::default()
        };
        assert_eq!(config.data_dir().unwrap(), PathBuf::from("/tmp/skycache-test"));
    }
}
