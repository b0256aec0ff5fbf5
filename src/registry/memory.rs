// 🧪 In-memory registry - fixtures for offline runs and tests
//
// Holds entities plus parent → child edges. Loadable from a JSON fixture:
//
//   { "entities": [ { "lei": "...", "legal_name": "...", ... } ],
//     "relationships": [ { "parent": "LEI1", "child": "LEI2" } ] }

use super::{LeiRegistry, RegistryError};
use crate::entity::{is_lei, lei_key, EntityRecord, HierarchyShape};
use crate::normalize::{normalize_name, tokenize};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryFixture {
    pub entities: Vec<EntityRecord>,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub parent: String,
    pub child: String,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryRegistry {
    /// Insertion order doubles as search result order
    entities: Vec<EntityRecord>,
    index: HashMap<String, usize>,
    children: HashMap<String, Vec<String>>,
    parents: HashMap<String, String>,
    search_limit: Option<usize>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fixture(fixture: RegistryFixture) -> Self {
        let mut registry = Self::new();
        for entity in fixture.entities {
            registry.insert(entity);
        }
        for rel in fixture.relationships {
            registry.link(&rel.parent, &rel.child);
        }
        registry
    }

    pub fn from_json_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read registry fixture {}", path.display()))?;
        let fixture: RegistryFixture = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid registry fixture {}", path.display()))?;
        Ok(Self::from_fixture(fixture))
    }

    pub fn with_search_limit(mut self, limit: usize) -> Self {
        self.search_limit = Some(limit);
        self
    }

    /// Add an entity; a later insert of the same LEI replaces the record.
    pub fn insert(&mut self, entity: EntityRecord) {
        let key = lei_key(&entity.lei);
        match self.index.get(&key) {
            Some(&idx) => self.entities[idx] = entity,
            None => {
                self.index.insert(key, self.entities.len());
                self.entities.push(entity);
            }
        }
    }

    /// Record `child` as a direct child of `parent` (child keeps one direct parent).
    pub fn link(&mut self, parent: &str, child: &str) {
        let parent_key = lei_key(parent);
        let child_key = lei_key(child);

        if let Some(previous) = self.parents.insert(child_key.clone(), parent_key.clone()) {
            if let Some(siblings) = self.children.get_mut(&previous) {
                siblings.retain(|c| *c != child_key);
            }
        }
        let siblings = self.children.entry(parent_key).or_default();
        if !siblings.contains(&child_key) {
            siblings.push(child_key);
        }
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    fn lookup(&self, lei: &str) -> Option<&EntityRecord> {
        self.index.get(&lei_key(lei)).map(|&idx| &self.entities[idx])
    }

    fn child_keys(&self, lei: &str) -> &[String] {
        self.children
            .get(&lei_key(lei))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn search_sync(&self, query: &str) -> Vec<EntityRecord> {
        let query = query.trim();
        if query.is_empty() {
            return Vec::new();
        }
        if is_lei(query) {
            return self.lookup(query).cloned().into_iter().collect();
        }

        let normalized_query = normalize_name(query);
        let query_tokens: HashSet<String> = tokenize(query).into_iter().collect();
        if normalized_query.is_empty() {
            return Vec::new();
        }

        let hits = self.entities.iter().filter(|entity| {
            let name = normalize_name(entity.display_name());
            name.contains(&normalized_query)
                || tokenize(&name).iter().any(|t| query_tokens.contains(t))
        });

        match self.search_limit {
            Some(limit) => hits.take(limit).cloned().collect(),
            None => hits.cloned().collect(),
        }
    }

    fn ultimate_parent_sync(&self, lei: &str) -> Option<EntityRecord> {
        let mut current = lei_key(lei);
        self.lookup(&current)?;

        let mut seen = HashSet::new();
        seen.insert(current.clone());
        while let Some(parent) = self.parents.get(&current) {
            // Registry data is not guaranteed acyclic
            if !seen.insert(parent.clone()) || self.lookup(parent).is_none() {
                break;
            }
            current = parent.clone();
        }
        self.lookup(&current).cloned()
    }

    fn shape_sync(&self, lei: &str) -> HierarchyShape {
        let root = lei_key(lei);
        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(root.clone());

        let mut frontier: VecDeque<String> = VecDeque::from(vec![root.clone()]);
        let mut depth = 0;

        loop {
            let mut next_level = VecDeque::new();
            while let Some(node) = frontier.pop_front() {
                for child in self.child_keys(&node) {
                    if visited.insert(child.clone()) {
                        next_level.push_back(child.clone());
                    }
                }
            }
            if next_level.is_empty() {
                break;
            }
            depth += 1;
            frontier = next_level;
        }

        let descendants = visited.len().saturating_sub(1) as u64;
        HierarchyShape {
            max_depth: depth,
            direct_children_count: self.child_keys(&root).len() as u64,
            descendants_count: descendants,
            ultimate_children_count: descendants,
            visited_count: visited.len() as u64,
        }
    }
}

#[async_trait]
impl LeiRegistry for InMemoryRegistry {
    async fn search_entities(&self, query: &str) -> Result<Vec<EntityRecord>, RegistryError> {
        Ok(self.search_sync(query))
    }

    async fn get_entity(&self, lei: &str) -> Result<Option<EntityRecord>, RegistryError> {
        Ok(self.lookup(lei).cloned())
    }

    async fn get_ultimate_parent(&self, lei: &str) -> Result<Option<EntityRecord>, RegistryError> {
        Ok(self.ultimate_parent_sync(lei))
    }

    async fn get_direct_children(&self, lei: &str) -> Result<Vec<EntityRecord>, RegistryError> {
        Ok(self
            .child_keys(lei)
            .iter()
            .filter_map(|child| self.lookup(child).cloned())
            .collect())
    }

    async fn get_direct_children_count(&self, lei: &str) -> Result<u64, RegistryError> {
        Ok(self.child_keys(lei).len() as u64)
    }

    async fn get_hierarchy_shape(&self, lei: &str) -> Result<HierarchyShape, RegistryError> {
        Ok(self.shape_sync(lei))
    }
}

// ============================================================================
// TESTS
// ============================================================================
