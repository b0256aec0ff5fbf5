// ⚙️ Configuration - registry, cache, matching, hierarchy and server settings
//
// Defaults work against the public GLEIF API. A JSON file named by
// LEI_EXPLORER_CONFIG can override any subset; env vars win over both.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_ENV: &str = "LEI_EXPLORER_CONFIG";
pub const API_BASE_ENV: &str = "LEI_API_BASE";
pub const FIXTURE_ENV: &str = "LEI_FIXTURE";
pub const BIND_ADDR_ENV: &str = "LEI_BIND_ADDR";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub registry: RegistryConfig,
    pub cache: CacheConfig,
    pub matching: MatchingConfig,
    pub hierarchy: HierarchyConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub base_url: String,
    pub request_timeout_secs: u64,
    pub max_retries: usize,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub rate_limit_per_minute: usize,
    /// Max LEIs materialized per free-text search
    pub search_limit: usize,
    pub page_size: usize,
    pub max_pages: usize,
    pub shape_max_nodes: usize,
    pub shape_concurrency: usize,
    /// Serve from a JSON fixture instead of HTTP
    pub fixture_path: Option<PathBuf>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            base_url: "https://api.gleif.org/api/v1".to_string(),
            request_timeout_secs: 20,
            max_retries: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 8000,
            rate_limit_per_minute: 58,
            search_limit: 25,
            page_size: 200,
            max_pages: 10,
            shape_max_nodes: 20_000,
            shape_concurrency: 4,
            fixture_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_secs: u64,
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            enabled: true,
            ttl_secs: 600,
            max_entries: 2048,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    pub child_count_concurrency: usize,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        MatchingConfig {
            child_count_concurrency: 6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HierarchyConfig {
    pub count_prefetch_concurrency: usize,
    pub call_timeout_secs: u64,
}

impl Default for HierarchyConfig {
    fn default() -> Self {
        HierarchyConfig {
            count_prefetch_concurrency: 6,
            call_timeout_secs: 60,
        }
    }
}

impl HierarchyConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_addr: "0.0.0.0:3000".to_string(),
        }
    }
}

impl AppConfig {
    /// Defaults, then the optional config file, then env overrides.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var(CONFIG_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::from_file(Path::new(path.trim()))?,
            _ => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(base) = lookup(API_BASE_ENV) {
            self.registry.base_url = base.trim().to_string();
        }
        if let Some(fixture) = lookup(FIXTURE_ENV) {
            self.registry.fixture_path = Some(PathBuf::from(fixture.trim()));
        }
        if let Some(addr) = lookup(BIND_ADDR_ENV) {
            self.server.bind_addr = addr.trim().to_string();
        }
    }
}
