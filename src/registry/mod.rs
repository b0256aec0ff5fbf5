// 🗂️ LEI Registry - the external source of truth for entities and relationships
//
// Everything above this layer talks to `dyn LeiRegistry`; the GLEIF HTTP
// client, the TTL cache and the in-memory fixture registry all plug in here.

pub mod cache;
pub mod gleif;
pub mod memory;

use crate::config::AppConfig;
use crate::entity::{EntityDetails, EntityRecord, HierarchyShape};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

pub use cache::CachedRegistry;
pub use gleif::GleifClient;
pub use memory::InMemoryRegistry;

// ============================================================================
// ERRORS
// ============================================================================

/// Failure talking to the registry. "Not found" is not an error: lookups
/// return `Ok(None)` or an empty list instead.
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    #[error("registry unreachable: {0}")]
    Unreachable(String),

    #[error("registry returned HTTP {0}")]
    Status(u16),

    #[error("malformed registry response: {0}")]
    Malformed(String),

    #[error("registry call timed out after {0:?}")]
    Timeout(Duration),
}

impl From<reqwest::Error> for RegistryError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            RegistryError::Malformed(err.to_string())
        } else if let Some(status) = err.status() {
            RegistryError::Status(status.as_u16())
        } else {
            RegistryError::Unreachable(err.to_string())
        }
    }
}

impl From<serde_json::Error> for RegistryError {
    fn from(err: serde_json::Error) -> Self {
        RegistryError::Malformed(err.to_string())
    }
}

// ============================================================================
// REGISTRY CONTRACT
// ============================================================================

#[async_trait]
pub trait LeiRegistry: Send + Sync {
    /// Free-text (or LEI) search; returns summary records in registry order.
    async fn search_entities(&self, query: &str) -> Result<Vec<EntityRecord>, RegistryError>;

    async fn get_entity(&self, lei: &str) -> Result<Option<EntityRecord>, RegistryError>;

    /// Top of the ownership chain. An entity without a parent is its own
    /// ultimate parent; None only when the entity itself does not exist.
    async fn get_ultimate_parent(&self, lei: &str) -> Result<Option<EntityRecord>, RegistryError>;

    async fn get_direct_children(&self, lei: &str) -> Result<Vec<EntityRecord>, RegistryError>;

    async fn get_direct_children_count(&self, lei: &str) -> Result<u64, RegistryError>;

    async fn get_hierarchy_shape(&self, lei: &str) -> Result<HierarchyShape, RegistryError>;

    /// Full company profile. Registries that only hold summary records
    /// answer with the summary mapped into details.
    async fn get_entity_details(&self, lei: &str) -> Result<Option<EntityDetails>, RegistryError> {
        Ok(self.get_entity(lei).await?.map(EntityDetails::from))
    }

    /// Most records one `get_direct_children` call can return. A listing
    /// that reaches this size may have been cut short upstream.
    fn listing_cap(&self) -> Option<usize> {
        None
    }
}

/// Build the registry the config asks for: a fixture-backed in-memory
/// registry when `fixture_path` is set, otherwise the GLEIF client.
/// Either one is wrapped in the TTL cache unless caching is disabled.
pub fn from_config(config: &AppConfig) -> anyhow::Result<Arc<dyn LeiRegistry>> {
    let registry: Arc<dyn LeiRegistry> = match &config.registry.fixture_path {
        Some(path) => {
            let memory = InMemoryRegistry::from_json_path(path)?
                .with_search_limit(config.registry.search_limit);
            info!(fixture = %path.display(), entities = memory.len(), "Using in-memory registry");
            if config.cache.enabled {
                Arc::new(CachedRegistry::from_config(memory, &config.cache))
            } else {
                Arc::new(memory)
            }
        }
        None => {
            let client = GleifClient::new(&config.registry);
            info!(base_url = %config.registry.base_url, "Using GLEIF registry");
            if config.cache.enabled {
                Arc::new(CachedRegistry::from_config(client, &config.cache))
            } else {
                Arc::new(client)
            }
        }
    };
    Ok(registry)
}

/// Run one registry call under a deadline; expiry becomes `RegistryError::Timeout`.
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, RegistryError>
where
    F: Future<Output = Result<T, RegistryError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(RegistryError::Timeout(limit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_expires() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<u64, RegistryError>(7)
        };
        let result = with_timeout(Duration::from_secs(5), slow).await;
        assert!(matches!(result, Err(RegistryError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_with_timeout_passes_through() {
        let fast = async { Ok::<u64, RegistryError>(7) };
        assert_eq!(with_timeout(Duration::from_secs(5), fast).await.unwrap(), 7);

        let failing = async { Err::<u64, RegistryError>(RegistryError::Status(503)) };
        assert!(matches!(
            with_timeout(Duration::from_secs(5), failing).await,
            Err(RegistryError::Status(503))
        ));
    }
}
