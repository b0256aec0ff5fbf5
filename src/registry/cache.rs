// 🧊 Registry Cache - TTL decorator over any LeiRegistry
//
// Successful answers (including "not found") are kept for `ttl`;
// errors are never cached so the next call retries upstream.

use super::{LeiRegistry, RegistryError};
use crate::config::CacheConfig;
use crate::entity::{lei_key, EntityDetails, EntityRecord, HierarchyShape};
use crate::normalize::normalize_name;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

struct TtlMap<V> {
    entries: DashMap<String, (Instant, V)>,
    ttl: Duration,
    max_entries: usize,
}

impl<V: Clone> TtlMap<V> {
    fn new(ttl: Duration, max_entries: usize) -> Self {
        TtlMap {
            entries: DashMap::new(),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    fn get(&self, key: &str) -> Option<V> {
        let hit = self.entries.get(key).map(|entry| {
            let (stored_at, value) = entry.value();
            (stored_at.elapsed() <= self.ttl, value.clone())
        });
        match hit {
            Some((true, value)) => Some(value),
            Some((false, _)) => {
                self.entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn put(&self, key: String, value: V) {
        if self.entries.len() >= self.max_entries {
            self.evict();
        }
        self.entries.insert(key, (Instant::now(), value));
    }

    /// Drop expired entries; if still full, drop a quarter of the rest.
    fn evict(&self) {
        let ttl = self.ttl;
        self.entries.retain(|_, (stored_at, _)| stored_at.elapsed() <= ttl);

        if self.entries.len() >= self.max_entries {
            let to_remove: Vec<String> = self
                .entries
                .iter()
                .take((self.max_entries / 4).max(1))
                .map(|r| r.key().clone())
                .collect();
            for key in to_remove {
                self.entries.remove(&key);
            }
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn clear(&self) {
        self.entries.clear();
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entities: usize,
    pub details: usize,
    pub searches: usize,
    pub ultimate_parents: usize,
    pub children: usize,
    pub child_counts: usize,
    pub shapes: usize,
}

pub struct CachedRegistry<R> {
    inner: R,
    entities: TtlMap<Option<EntityRecord>>,
    details: TtlMap<Option<EntityDetails>>,
    searches: TtlMap<Vec<EntityRecord>>,
    ultimate_parents: TtlMap<Option<EntityRecord>>,
    children: TtlMap<Vec<EntityRecord>>,
    child_counts: TtlMap<u64>,
    shapes: TtlMap<HierarchyShape>,
}

impl<R: LeiRegistry> CachedRegistry<R> {
    pub fn new(inner: R, ttl: Duration, max_entries: usize) -> Self {
        CachedRegistry {
            inner,
            entities: TtlMap::new(ttl, max_entries),
            details: TtlMap::new(ttl, max_entries),
            searches: TtlMap::new(ttl, max_entries),
            ultimate_parents: TtlMap::new(ttl, max_entries),
            children: TtlMap::new(ttl, max_entries),
            child_counts: TtlMap::new(ttl, max_entries),
            shapes: TtlMap::new(ttl, max_entries),
        }
    }

    pub fn from_config(inner: R, config: &CacheConfig) -> Self {
        Self::new(inner, Duration::from_secs(config.ttl_secs), config.max_entries)
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entities: self.entities.len(),
            details: self.details.len(),
            searches: self.searches.len(),
            ultimate_parents: self.ultimate_parents.len(),
            children: self.children.len(),
            child_counts: self.child_counts.len(),
            shapes: self.shapes.len(),
        }
    }

    pub fn clear(&self) {
        self.entities.clear();
        self.details.clear();
        self.searches.clear();
        self.ultimate_parents.clear();
        self.children.clear();
        self.child_counts.clear();
        self.shapes.clear();
    }
}

#[async_trait]
impl<R: LeiRegistry> LeiRegistry for CachedRegistry<R> {
    async fn search_entities(&self, query: &str) -> Result<Vec<EntityRecord>, RegistryError> {
        // Raw text keeps LEI queries distinct from name queries
        let key = format!("{}|{}", query.trim().to_lowercase(), normalize_name(query));
        if let Some(hit) = self.searches.get(&key) {
            return Ok(hit);
        }
        let records = self.inner.search_entities(query).await?;
        self.searches.put(key, records.clone());
        Ok(records)
    }

    async fn get_entity(&self, lei: &str) -> Result<Option<EntityRecord>, RegistryError> {
        let key = lei_key(lei);
        if let Some(hit) = self.entities.get(&key) {
            return Ok(hit);
        }
        let record = self.inner.get_entity(lei).await?;
        self.entities.put(key, record.clone());
        Ok(record)
    }

    async fn get_entity_details(&self, lei: &str) -> Result<Option<EntityDetails>, RegistryError> {
        let key = lei_key(lei);
        if let Some(hit) = self.details.get(&key) {
            return Ok(hit);
        }
        let details = self.inner.get_entity_details(lei).await?;
        self.details.put(key, details.clone());
        Ok(details)
    }

    async fn get_ultimate_parent(&self, lei: &str) -> Result<Option<EntityRecord>, RegistryError> {
        let key = lei_key(lei);
        if let Some(hit) = self.ultimate_parents.get(&key) {
            return Ok(hit);
        }
        let record = self.inner.get_ultimate_parent(lei).await?;
        self.ultimate_parents.put(key, record.clone());
        Ok(record)
    }

    async fn get_direct_children(&self, lei: &str) -> Result<Vec<EntityRecord>, RegistryError> {
        let key = lei_key(lei);
        if let Some(hit) = self.children.get(&key) {
            return Ok(hit);
        }
        let records = self.inner.get_direct_children(lei).await?;
        // Only a listing shorter than the upstream cap is known to be complete
        let complete = self
            .inner
            .listing_cap()
            .map_or(true, |cap| records.len() < cap);
        if complete {
            self.child_counts.put(key.clone(), records.len() as u64);
        }
        self.children.put(key, records.clone());
        Ok(records)
    }

    async fn get_direct_children_count(&self, lei: &str) -> Result<u64, RegistryError> {
        let key = lei_key(lei);
        if let Some(hit) = self.child_counts.get(&key) {
            return Ok(hit);
        }
        let count = self.inner.get_direct_children_count(lei).await?;
        self.child_counts.put(key, count);
        Ok(count)
    }

    async fn get_hierarchy_shape(&self, lei: &str) -> Result<HierarchyShape, RegistryError> {
        let key = lei_key(lei);
        if let Some(hit) = self.shapes.get(&key) {
            return Ok(hit);
        }
        let shape = self.inner.get_hierarchy_shape(lei).await?;
        self.shapes.put(key, shape);
        Ok(shape)
    }

    fn listing_cap(&self) -> Option<usize> {
        self.inner.listing_cap()
    }
}

// ============================================================================
// TESTS
// ============================================================================
