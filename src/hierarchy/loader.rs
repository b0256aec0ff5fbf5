// 🔄 Hierarchy Loader - lazy + background expansion of an ownership tree
//
// One "run" per seed LEI, numbered by a generation counter:
//   1. resolve the ultimate parent (root)
//   2. size it (direct-children count, best effort)
//   3. fetch the first level eagerly
//   4. walk the rest breadth-first in a background task
//
// Starting a new run bumps the generation under the tree write lock.
// Every mutation re-checks the generation under that same lock, so once a
// new run has started nothing from an older run can touch the tree.

use super::analysis::{HierarchyAnalysis, HierarchyAnalyzer};
use super::{HierarchyNode, NodePath};
use crate::config::AppConfig;
use crate::entity::{lei_key, EntityRecord, HierarchyShape};
use crate::registry::{with_timeout, LeiRegistry};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 256;

// ============================================================================
// OUTCOMES & EVENTS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LoadOutcome {
    /// Seed unknown to the registry (or the lookup failed)
    NoData,
    /// A newer run started before this one finished resolving
    Superseded,
    Loaded {
        generation: u64,
        root_lei: String,
        /// None when the first-level fetch failed (root stays unfetched)
        first_level: Option<usize>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum ExpandOutcome {
    Attached(usize),
    AlreadyFetched,
    Failed(String),
    Superseded,
    NotFound,
}

/// Progress notifications, tagged with the run that produced them.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LoadEvent {
    RootResolved { generation: u64, lei: String },
    NoData { generation: u64, seed: String },
    NodeExpanded { generation: u64, path: NodePath, lei: String, children: usize },
    NodeFailed { generation: u64, path: NodePath, lei: String, error: String },
    Completed { generation: u64, total: usize },
}

impl LoadEvent {
    pub fn generation(&self) -> u64 {
        match self {
            LoadEvent::RootResolved { generation, .. }
            | LoadEvent::NoData { generation, .. }
            | LoadEvent::NodeExpanded { generation, .. }
            | LoadEvent::NodeFailed { generation, .. }
            | LoadEvent::Completed { generation, .. } => *generation,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadStatus {
    pub generation: u64,
    pub root_lei: Option<String>,
    /// Nodes loaded below the root
    pub loaded: usize,
    /// Direct-children count of the root, replaced by the registry's
    /// descendant total once the shape is known
    pub expected_total: Option<u64>,
    pub in_progress: bool,
    pub shape: Option<HierarchyShape>,
}

// ============================================================================
// LOADER STATE
// ============================================================================

#[derive(Default)]
struct RunState {
    generation: u64,
    seed: Option<String>,
    tree: Option<HierarchyNode>,
    expected_total: Option<u64>,
    shape: Option<HierarchyShape>,
    in_progress: bool,
    /// Direct-children counts by LEI key (affordance prefetch)
    child_counts: HashMap<String, u64>,
}

struct LoaderInner {
    registry: Arc<dyn LeiRegistry>,
    analyzer: HierarchyAnalyzer,
    call_timeout: Duration,
    prefetch_concurrency: usize,
    generation: AtomicU64,
    state: RwLock<RunState>,
    node_locks: Mutex<HashMap<NodePath, Arc<tokio::sync::Mutex<()>>>>,
    background: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<LoadEvent>,
}

#[derive(Clone)]
pub struct HierarchyLoader {
    inner: Arc<LoaderInner>,
}

impl HierarchyLoader {
    pub fn new(registry: Arc<dyn LeiRegistry>) -> Self {
        Self::with_settings(registry, Duration::from_secs(60), 6)
    }

    pub fn from_config(registry: Arc<dyn LeiRegistry>, config: &AppConfig) -> Self {
        Self::with_settings(
            registry,
            config.hierarchy.call_timeout(),
            config.hierarchy.count_prefetch_concurrency,
        )
    }

    pub fn with_settings(
        registry: Arc<dyn LeiRegistry>,
        call_timeout: Duration,
        prefetch_concurrency: usize,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        HierarchyLoader {
            inner: Arc::new(LoaderInner {
                registry,
                analyzer: HierarchyAnalyzer::default(),
                call_timeout,
                prefetch_concurrency: prefetch_concurrency.max(1),
                generation: AtomicU64::new(0),
                state: RwLock::new(RunState::default()),
                node_locks: Mutex::new(HashMap::new()),
                background: Mutex::new(None),
                events,
            }),
        }
    }

    fn read_state(&self) -> RwLockReadGuard<'_, RunState> {
        self.inner.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, RunState> {
        self.inner.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: LoadEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LoadEvent> {
        self.inner.events.subscribe()
    }

    pub fn current_generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.current_generation() == generation
    }

    fn node_lock(&self, path: &NodePath) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .inner
            .node_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(path.clone()).or_default())
    }

    /// Start a new run: bump the generation and reset the tree.
    fn begin_run(&self, seed: &str) -> u64 {
        let mut state = self.write_state();
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *state = RunState {
            generation,
            seed: Some(seed.to_string()),
            in_progress: true,
            ..RunState::default()
        };

        // Cleared under the state lock so a later run's entries survive
        self.inner
            .node_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        drop(state);
        generation
    }

    // ========================================================================
    // RUN
    // ========================================================================

    /// Resolve the root for `seed`, load the first level and start the
    /// background walk. Supersedes any run in progress.
    pub async fn load_hierarchy(&self, seed: &str) -> LoadOutcome {
        let seed = seed.trim().to_string();
        let generation = self.begin_run(&seed);
        info!(seed = %seed, generation, "Loading hierarchy");

        let lookup = self.inner.registry.get_ultimate_parent(&seed);
        let root = match with_timeout(self.inner.call_timeout, lookup).await {
            Ok(root) => root,
            Err(e) => {
                warn!(seed = %seed, error = %e, "Ultimate parent lookup failed");
                None
            }
        };

        let Some(root) = root else {
            return self.finish_without_data(generation, &seed);
        };
        let root_lei = root.lei.clone();

        {
            let mut state = self.write_state();
            if state.generation != generation {
                return LoadOutcome::Superseded;
            }
            state.tree = Some(HierarchyNode::new(root));
        }
        self.emit(LoadEvent::RootResolved {
            generation,
            lei: root_lei.clone(),
        });

        if !self.is_current(generation) {
            return LoadOutcome::Superseded;
        }

        // Sizing is best effort
        let count = self.inner.registry.get_direct_children_count(&root_lei);
        match with_timeout(self.inner.call_timeout, count).await {
            Ok(count) => {
                let mut state = self.write_state();
                if state.generation == generation {
                    state.expected_total = Some(count);
                    state.child_counts.insert(lei_key(&root_lei), count);
                }
            }
            Err(e) => debug!(lei = %root_lei, error = %e, "Root sizing failed"),
        }

        let first_level = match self.fetch_and_attach(generation, &NodePath::root()).await {
            ExpandOutcome::Attached(n) => Some(n),
            ExpandOutcome::AlreadyFetched => Some(self.children_at(generation, &NodePath::root()).len()),
            ExpandOutcome::Superseded => return LoadOutcome::Superseded,
            ExpandOutcome::Failed(_) | ExpandOutcome::NotFound => None,
        };

        let queue: VecDeque<NodePath> = self.children_at(generation, &NodePath::root()).into();
        if queue.is_empty() {
            self.finish_run(generation);
        } else {
            let loader = self.clone();
            let handle = tokio::spawn(async move { loader.run_background(generation, queue).await });
            let previous = self
                .inner
                .background
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .replace(handle);
            // Older walks stop on their own at the next generation check
            drop(previous);
        }

        LoadOutcome::Loaded {
            generation,
            root_lei,
            first_level,
        }
    }

    fn finish_without_data(&self, generation: u64, seed: &str) -> LoadOutcome {
        {
            let mut state = self.write_state();
            if state.generation != generation {
                return LoadOutcome::Superseded;
            }
            state.in_progress = false;
        }
        info!(seed, generation, "No hierarchy data for seed");
        self.emit(LoadEvent::NoData {
            generation,
            seed: seed.to_string(),
        });
        LoadOutcome::NoData
    }

    fn finish_run(&self, generation: u64) {
        let total = {
            let mut state = self.write_state();
            if state.generation != generation {
                return;
            }
            state.in_progress = false;
            state.tree.as_ref().map(HierarchyNode::node_count).unwrap_or(0)
        };
        info!(generation, total, "Hierarchy fully loaded");
        self.emit(LoadEvent::Completed { generation, total });
    }

    /// Paths of the children of `path`, if the run is still current.
    fn children_at(&self, generation: u64, path: &NodePath) -> Vec<NodePath> {
        let state = self.read_state();
        if state.generation != generation {
            return Vec::new();
        }
        state
            .tree
            .as_ref()
            .and_then(|tree| tree.node_at(path))
            .map(|node| (0..node.children().len()).map(|i| path.child(i)).collect())
            .unwrap_or_default()
    }

    async fn run_background(&self, generation: u64, mut queue: VecDeque<NodePath>) {
        while let Some(path) = queue.pop_front() {
            if !self.is_current(generation) {
                debug!(generation, "Background walk superseded");
                return;
            }

            match self.fetch_and_attach(generation, &path).await {
                ExpandOutcome::Attached(_) | ExpandOutcome::AlreadyFetched => {
                    queue.extend(self.children_at(generation, &path));
                }
                ExpandOutcome::Superseded => {
                    debug!(generation, "Background walk superseded");
                    return;
                }
                // Node stays unfetched; an explicit expand can retry it
                ExpandOutcome::Failed(_) | ExpandOutcome::NotFound => {}
            }

            tokio::task::yield_now().await;
        }

        self.finish_run(generation);
    }

    /// Fetch children for the node at `path` and attach them.
    ///
    /// Calls for the same node are serialized; a node already fetched is left alone.
    async fn fetch_and_attach(&self, generation: u64, path: &NodePath) -> ExpandOutcome {
        let node_lock = self.node_lock(path);
        let _guard = node_lock.lock().await;

        let (lei, lineage) = {
            let state = self.read_state();
            if state.generation != generation {
                return ExpandOutcome::Superseded;
            }
            let Some(tree) = state.tree.as_ref() else {
                return ExpandOutcome::NotFound;
            };
            match (tree.node_at(path), tree.lineage(path)) {
                (Some(node), _) if node.is_fetched() => return ExpandOutcome::AlreadyFetched,
                (Some(node), Some(lineage)) => (node.lei().to_string(), lineage),
                _ => return ExpandOutcome::NotFound,
            }
        };

        let fetch = self.inner.registry.get_direct_children(&lei);
        let children: Vec<EntityRecord> = match with_timeout(self.inner.call_timeout, fetch).await {
            Ok(children) => children,
            Err(e) => {
                if !self.is_current(generation) {
                    return ExpandOutcome::Superseded;
                }
                warn!(lei = %lei, path = %path, generation, error = %e, "Children fetch failed");
                self.emit(LoadEvent::NodeFailed {
                    generation,
                    path: path.clone(),
                    lei,
                    error: e.to_string(),
                });
                return ExpandOutcome::Failed(e.to_string());
            }
        };

        // A child that is also one of its own ancestors would loop forever
        let (children, looped): (Vec<EntityRecord>, Vec<EntityRecord>) = children
            .into_iter()
            .partition(|child| !lineage.contains(&lei_key(&child.lei)));
        if !looped.is_empty() {
            let leis: Vec<&str> = looped.iter().map(|c| c.lei.as_str()).collect();
            warn!(lei = %lei, path = %path, generation, ?leis, "Dropped children that cycle back to an ancestor");
        }

        let attached = {
            let mut state = self.write_state();
            if state.generation != generation {
                return ExpandOutcome::Superseded;
            }
            let count = children.len();
            match state.tree.as_mut().and_then(|tree| tree.node_at_mut(path)) {
                None => return ExpandOutcome::NotFound,
                Some(node) => {
                    if !node.attach_children(children) {
                        return ExpandOutcome::AlreadyFetched;
                    }
                }
            }
            state.child_counts.insert(lei_key(&lei), count as u64);
            count
        };

        debug!(lei = %lei, path = %path, generation, children = attached, "Attached children");
        self.emit(LoadEvent::NodeExpanded {
            generation,
            path: path.clone(),
            lei,
            children: attached,
        });
        ExpandOutcome::Attached(attached)
    }

    // ========================================================================
    // ON-DEMAND OPERATIONS
    // ========================================================================

    /// Explicit expand of one node in the current run.
    pub async fn expand(&self, path: &NodePath) -> ExpandOutcome {
        let generation = self.current_generation();
        self.fetch_and_attach(generation, path).await
    }

    /// Expand the first node (BFS order) holding `lei`.
    pub async fn expand_lei(&self, lei: &str) -> ExpandOutcome {
        let path = {
            let state = self.read_state();
            state.tree.as_ref().and_then(|tree| tree.find_path(lei))
        };
        match path {
            Some(path) => self.expand(&path).await,
            None => ExpandOutcome::NotFound,
        }
    }

    /// Copy of the current tree; safe to analyze while loading continues.
    pub fn snapshot(&self) -> Option<HierarchyNode> {
        self.read_state().tree.clone()
    }

    pub fn status(&self) -> LoadStatus {
        let state = self.read_state();
        LoadStatus {
            generation: state.generation,
            root_lei: state.tree.as_ref().map(|t| t.lei().to_string()),
            loaded: state
                .tree
                .as_ref()
                .map(|t| t.node_count().saturating_sub(1))
                .unwrap_or(0),
            expected_total: state.expected_total,
            in_progress: state.in_progress,
            shape: state.shape,
        }
    }

    pub fn seed(&self) -> Option<String> {
        self.read_state().seed.clone()
    }

    /// Direct-children counts for `leis`, skipping ones already known.
    /// A failed lookup is recorded as 0.
    pub async fn prefetch_child_counts(&self, leis: Vec<String>) -> HashMap<String, u64> {
        let generation = self.current_generation();
        let missing: Vec<String> = {
            let state = self.read_state();
            let mut seen = HashSet::new();
            leis.into_iter()
                .map(|lei| lei_key(&lei))
                .filter(|key| !state.child_counts.contains_key(key) && seen.insert(key.clone()))
                .collect()
        };

        let fetched: Vec<(String, u64)> = stream::iter(missing)
            .map(|lei| async move {
                let lookup = self.inner.registry.get_direct_children_count(&lei);
                let count = match with_timeout(self.inner.call_timeout, lookup).await {
                    Ok(count) => count,
                    Err(e) => {
                        debug!(lei = %lei, error = %e, "Child count failed, treating as 0");
                        0
                    }
                };
                (lei, count)
            })
            .buffer_unordered(self.inner.prefetch_concurrency)
            .collect()
            .await;

        let mut state = self.write_state();
        if state.generation == generation {
            for (lei, count) in &fetched {
                state.child_counts.entry(lei.clone()).or_insert(*count);
            }
        }
        fetched.into_iter().collect()
    }

    /// Prefetch counts for every node a UI with `expanded` open would render.
    pub async fn prefetch_visible(&self, expanded: &HashSet<String>) -> HashMap<String, u64> {
        let visible: Vec<String> = match self.snapshot() {
            Some(tree) => tree
                .visible_nodes(expanded)
                .into_iter()
                .map(|(_, node)| node.lei().to_string())
                .collect(),
            None => Vec::new(),
        };
        self.prefetch_child_counts(visible).await
    }

    pub fn known_child_count(&self, lei: &str) -> Option<u64> {
        self.read_state().child_counts.get(&lei_key(lei)).copied()
    }

    /// Whether to draw an "expandable" arrow for `lei`: known children, or a
    /// known positive count. Unknown means no arrow (yet).
    pub fn shows_expand_affordance(&self, lei: &str) -> bool {
        let state = self.read_state();
        let fetched_children = state.tree.as_ref().and_then(|tree| {
            let node = tree.node_at(&tree.find_path(lei)?)?;
            node.is_fetched().then(|| node.children().len())
        });

        match fetched_children {
            Some(n) => n > 0,
            None => state.child_counts.get(&lei_key(lei)).copied().unwrap_or(0) > 0,
        }
    }

    /// Ask the registry for authoritative totals of the current root.
    pub async fn refresh_shape(&self) -> Option<HierarchyShape> {
        let (generation, root_lei) = {
            let state = self.read_state();
            (state.generation, state.tree.as_ref()?.lei().to_string())
        };

        let lookup = self.inner.registry.get_hierarchy_shape(&root_lei);
        let shape = match with_timeout(self.inner.call_timeout, lookup).await {
            Ok(shape) => shape,
            Err(e) => {
                warn!(lei = %root_lei, error = %e, "Shape lookup failed");
                return None;
            }
        };

        let mut state = self.write_state();
        if state.generation != generation {
            return None;
        }
        state.shape = Some(shape);
        state.expected_total = Some(shape.descendants_count);
        Some(shape)
    }

    pub fn analyze(&self) -> Option<HierarchyAnalysis> {
        self.snapshot().map(|tree| self.inner.analyzer.analyze(&tree))
    }

    /// Wait for the latest background walk to end (finished or superseded).
    pub async fn wait_for_background(&self) {
        let handle = self
            .inner
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background walk ended abnormally");
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{InMemoryRegistry, RegistryError};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    const ROOT: &str = "ROOT0000000000000001";
    const SUB_A: &str = "SUBA0000000000000002";
    const SUB_B: &str = "SUBB0000000000000003";
    const LEAF: &str = "LEAF0000000000000004";
    const OTHER_ROOT: &str = "OTHR0000000000000005";
    const OTHER_SUB: &str = "OTHS0000000000000006";
    const LOOP_A: &str = "LOPA0000000000000007";
    const LOOP_B: &str = "LOPB0000000000000008";

    /// In-memory registry with per-LEI delays and switchable failures.
    struct FakeRegistry {
        inner: InMemoryRegistry,
        delays: HashMap<String, Duration>,
        parent_delays: HashMap<String, Duration>,
        failing_children: Mutex<HashSet<String>>,
        fail_counts: bool,
        children_calls: Mutex<HashMap<String, usize>>,
        count_calls: AtomicUsize,
    }

    impl FakeRegistry {
        fn new() -> Self {
            let mut inner = InMemoryRegistry::new();
            inner.insert(EntityRecord::new(ROOT, "Acme Holdings plc").with_country("GB"));
            inner.insert(EntityRecord::new(SUB_A, "Acme Europe GmbH").with_country("DE"));
            inner.insert(EntityRecord::new(SUB_B, "Acme Americas Inc.").with_country("US"));
            inner.insert(EntityRecord::new(LEAF, "Widget Works Ltd").with_country("GB"));
            inner.insert(EntityRecord::new(OTHER_ROOT, "Other Group AG").with_country("CH"));
            inner.insert(EntityRecord::new(OTHER_SUB, "Other Sub AG").with_country("CH"));
            inner.link(ROOT, SUB_A);
            inner.link(ROOT, SUB_B);
            inner.link(SUB_A, LEAF);
            inner.link(OTHER_ROOT, OTHER_SUB);
            FakeRegistry {
                inner,
                delays: HashMap::new(),
                parent_delays: HashMap::new(),
                failing_children: Mutex::new(HashSet::new()),
                fail_counts: false,
                children_calls: Mutex::new(HashMap::new()),
                count_calls: AtomicUsize::new(0),
            }
        }

        fn delay(mut self, lei: &str, delay: Duration) -> Self {
            self.delays.insert(lei.to_string(), delay);
            self
        }

        fn delay_parent(mut self, lei: &str, delay: Duration) -> Self {
            self.parent_delays.insert(lei.to_string(), delay);
            self
        }

        fn fail_children_of(&self, lei: &str, fail: bool) {
            let mut failing = self.failing_children.lock().unwrap();
            if fail {
                failing.insert(lei.to_string());
            } else {
                failing.remove(lei);
            }
        }

        fn children_calls(&self, lei: &str) -> usize {
            self.children_calls.lock().unwrap().get(lei).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl LeiRegistry for FakeRegistry {
        async fn search_entities(&self, query: &str) -> Result<Vec<EntityRecord>, RegistryError> {
            self.inner.search_entities(query).await
        }
        async fn get_entity(&self, lei: &str) -> Result<Option<EntityRecord>, RegistryError> {
            self.inner.get_entity(lei).await
        }
        async fn get_ultimate_parent(&self, lei: &str) -> Result<Option<EntityRecord>, RegistryError> {
            if let Some(delay) = self.parent_delays.get(lei) {
                tokio::time::sleep(*delay).await;
            }
            self.inner.get_ultimate_parent(lei).await
        }
        async fn get_direct_children(&self, lei: &str) -> Result<Vec<EntityRecord>, RegistryError> {
            *self.children_calls.lock().unwrap().entry(lei.to_string()).or_default() += 1;
            if let Some(delay) = self.delays.get(lei) {
                tokio::time::sleep(*delay).await;
            }
            if self.failing_children.lock().unwrap().contains(lei) {
                return Err(RegistryError::Status(503));
            }
            self.inner.get_direct_children(lei).await
        }
        async fn get_direct_children_count(&self, lei: &str) -> Result<u64, RegistryError> {
            self.count_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_counts {
                return Err(RegistryError::Unreachable("down".into()));
            }
            self.inner.get_direct_children_count(lei).await
        }
        async fn get_hierarchy_shape(&self, lei: &str) -> Result<HierarchyShape, RegistryError> {
            self.inner.get_hierarchy_shape(lei).await
        }
    }

    #[tokio::test]
    async fn test_loads_full_tree_from_any_member() {
        let loader = HierarchyLoader::new(Arc::new(FakeRegistry::new()));

        let outcome = loader.load_hierarchy(LEAF).await;
        assert_eq!(
            outcome,
            LoadOutcome::Loaded {
                generation: 1,
                root_lei: ROOT.to_string(),
                first_level: Some(2),
            }
        );
        loader.wait_for_background().await;

        let tree = loader.snapshot().unwrap();
        assert_eq!(tree.lei(), ROOT);
        assert_eq!(tree.node_count(), 4);
        assert!(tree.walk().iter().all(|(_, node)| node.is_fetched()));

        let status = loader.status();
        assert_eq!(status.loaded, 3);
        assert_eq!(status.expected_total, Some(2));
        assert!(!status.in_progress);
    }

    #[tokio::test]
    async fn test_unknown_seed_is_no_data() {
        let loader = HierarchyLoader::new(Arc::new(FakeRegistry::new()));
        let mut events = loader.subscribe();

        assert_eq!(loader.load_hierarchy("NOPE0000000000000000").await, LoadOutcome::NoData);
        assert!(loader.snapshot().is_none());
        assert!(loader.analyze().is_none());
        assert!(matches!(events.recv().await.unwrap(), LoadEvent::NoData { generation: 1, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_run_discards_stale_responses() {
        let registry = Arc::new(FakeRegistry::new().delay(SUB_A, Duration::from_secs(10)));
        let loader = HierarchyLoader::new(registry.clone());
        let mut events = loader.subscribe();

        // Run 1: background walk parks on SUB_A for 10s
        assert!(matches!(loader.load_hierarchy(ROOT).await, LoadOutcome::Loaded { generation: 1, .. }));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(registry.children_calls(SUB_A), 1);

        // Run 2 starts while run 1 is still waiting
        assert!(matches!(
            loader.load_hierarchy(OTHER_ROOT).await,
            LoadOutcome::Loaded { generation: 2, .. }
        ));
        loader.wait_for_background().await;
        tokio::time::sleep(Duration::from_secs(30)).await;

        // The stale response did arrive, but never reached the tree
        assert_eq!(registry.children_calls(SUB_A), 1);
        let tree = loader.snapshot().unwrap();
        assert_eq!(tree.lei(), OTHER_ROOT);
        assert_eq!(tree.node_count(), 2);
        assert!(tree.find_path(LEAF).is_none());

        let mut seen_run_two = false;
        while let Ok(event) = events.try_recv() {
            if event.generation() == 2 {
                seen_run_two = true;
            } else {
                assert!(!seen_run_two, "run 1 event after run 2 began: {:?}", event);
            }
        }
        assert!(seen_run_two);
        assert_eq!(loader.status().generation, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_expands_fetch_once() {
        let registry = Arc::new(FakeRegistry::new().delay(SUB_A, Duration::from_secs(5)));
        let loader = HierarchyLoader::new(registry.clone());
        loader.load_hierarchy(ROOT).await;

        let path = NodePath::from(vec![0]);
        let (first, second) = tokio::join!(loader.expand(&path), loader.expand(&path));
        loader.wait_for_background().await;

        let attached = [&first, &second]
            .iter()
            .filter(|o| matches!(o, ExpandOutcome::Attached(_)))
            .count();
        assert!(attached <= 1);
        assert_eq!(registry.children_calls(SUB_A), 1);
        assert_eq!(loader.snapshot().unwrap().node_count(), 4);
    }

    #[tokio::test]
    async fn test_failed_fetch_leaves_node_retryable() {
        let registry = Arc::new(FakeRegistry::new());
        registry.fail_children_of(SUB_A, true);
        let loader = HierarchyLoader::new(registry.clone());

        loader.load_hierarchy(ROOT).await;
        loader.wait_for_background().await;

        let tree = loader.snapshot().unwrap();
        let sub_a = tree.node_at(&NodePath::from(vec![0])).unwrap();
        assert!(!sub_a.is_fetched());
        assert!(sub_a.children().is_empty());
        assert!(matches!(loader.expand_lei(SUB_A).await, ExpandOutcome::Failed(_)));

        registry.fail_children_of(SUB_A, false);
        assert_eq!(loader.expand_lei(SUB_A).await, ExpandOutcome::Attached(1));
        assert_eq!(loader.expand_lei(SUB_A).await, ExpandOutcome::AlreadyFetched);
        assert_eq!(loader.snapshot().unwrap().node_count(), 4);
    }

    #[tokio::test]
    async fn test_count_failures_hide_affordance() {
        let mut fake = FakeRegistry::new();
        fake.fail_counts = true;
        fake.fail_children_of(ROOT, true);
        let loader = HierarchyLoader::new(Arc::new(fake));

        let outcome = loader.load_hierarchy(ROOT).await;
        assert!(matches!(outcome, LoadOutcome::Loaded { first_level: None, .. }));
        assert!(!loader.shows_expand_affordance(ROOT));

        let counts = loader.prefetch_child_counts(vec![ROOT.to_string()]).await;
        assert_eq!(counts.get(ROOT), Some(&0));
        assert!(!loader.shows_expand_affordance(ROOT));
        assert!(!loader.status().in_progress);
    }

    #[tokio::test]
    async fn test_prefetch_visible_counts() {
        let loader = HierarchyLoader::new(Arc::new(FakeRegistry::new()));
        loader.load_hierarchy(ROOT).await;
        loader.wait_for_background().await;

        let counts = loader.prefetch_visible(&HashSet::new()).await;
        // Everything visible was already counted while loading
        assert!(counts.is_empty());
        assert_eq!(loader.known_child_count(SUB_A), Some(1));
        assert!(loader.shows_expand_affordance(SUB_A));
        assert!(!loader.shows_expand_affordance(SUB_B));
        assert!(!loader.shows_expand_affordance("UNKN0000000000000000"));
    }

    #[tokio::test]
    async fn test_shape_and_analysis() {
        let loader = HierarchyLoader::new(Arc::new(FakeRegistry::new()));
        loader.load_hierarchy(ROOT).await;
        loader.wait_for_background().await;

        let shape = loader.refresh_shape().await.unwrap();
        assert_eq!(shape.descendants_count, 3);
        assert_eq!(loader.status().expected_total, Some(3));

        let analysis = loader.analyze().unwrap();
        assert_eq!(analysis.total, 4);
        assert_eq!(analysis.max_depth, 2);
        assert_eq!(analysis.num_countries, 3);
    }

    fn lock_count(loader: &HierarchyLoader) -> usize {
        loader.inner.node_locks.lock().unwrap().len()
    }

    #[tokio::test]
    async fn test_cyclic_relationships_still_finish() {
        let mut registry = InMemoryRegistry::new();
        registry.insert(EntityRecord::new(LOOP_A, "Loop A Ltd"));
        registry.insert(EntityRecord::new(LOOP_B, "Loop B Ltd"));
        registry.link(LOOP_A, LOOP_B);
        registry.link(LOOP_B, LOOP_A);
        let loader = HierarchyLoader::new(Arc::new(registry));
        let mut events = loader.subscribe();

        let outcome = loader.load_hierarchy(LOOP_A).await;
        assert!(matches!(
            outcome,
            LoadOutcome::Loaded { ref root_lei, first_level: Some(1), .. } if root_lei == LOOP_B
        ));
        tokio::time::timeout(Duration::from_secs(5), loader.wait_for_background())
            .await
            .expect("background walk did not finish");

        assert!(!loader.status().in_progress);
        let tree = loader.snapshot().unwrap();
        assert_eq!(tree.node_count(), 2);
        let child = tree.node_at(&NodePath::from(vec![0])).unwrap();
        assert_eq!(child.lei(), LOOP_A);
        assert!(child.is_fetched());
        assert!(child.children().is_empty());

        let mut completed = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, LoadEvent::Completed { total: 2, .. }) {
                completed = true;
            }
        }
        assert!(completed);
    }

    #[tokio::test]
    async fn test_self_parent_is_a_leaf() {
        let mut registry = InMemoryRegistry::new();
        registry.insert(EntityRecord::new(LOOP_A, "Loop A Ltd"));
        registry.link(LOOP_A, LOOP_A);
        let loader = HierarchyLoader::new(Arc::new(registry));

        let outcome = loader.load_hierarchy(LOOP_A).await;
        assert!(matches!(outcome, LoadOutcome::Loaded { first_level: Some(0), .. }));
        loader.wait_for_background().await;

        let tree = loader.snapshot().unwrap();
        assert_eq!(tree.node_count(), 1);
        assert!(tree.is_fetched());
        assert!(!loader.status().in_progress);
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_run_skips_sizing() {
        let registry = Arc::new(FakeRegistry::new().delay_parent(ROOT, Duration::from_secs(10)));
        let loader = HierarchyLoader::new(registry.clone());

        let slow = tokio::spawn({
            let loader = loader.clone();
            async move { loader.load_hierarchy(ROOT).await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(matches!(
            loader.load_hierarchy(OTHER_ROOT).await,
            LoadOutcome::Loaded { generation: 2, .. }
        ));
        loader.wait_for_background().await;

        assert_eq!(slow.await.unwrap(), LoadOutcome::Superseded);
        // Only run 2 sized its root; run 1 made no call after resolving
        assert_eq!(registry.count_calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.children_calls(ROOT), 0);
        assert_eq!(loader.snapshot().unwrap().lei(), OTHER_ROOT);
    }

    #[tokio::test]
    async fn test_new_run_resets_node_locks() {
        let loader = HierarchyLoader::new(Arc::new(FakeRegistry::new()));
        loader.load_hierarchy(ROOT).await;
        loader.wait_for_background().await;
        assert!(lock_count(&loader) > 0);

        assert_eq!(loader.begin_run(OTHER_ROOT), 2);
        assert_eq!(lock_count(&loader), 0);

        // Entries created after the reset are the ones later calls share
        let first = loader.node_lock(&NodePath::root());
        assert!(Arc::ptr_eq(&first, &loader.node_lock(&NodePath::root())));
        assert_eq!(lock_count(&loader), 1);
    }
}
