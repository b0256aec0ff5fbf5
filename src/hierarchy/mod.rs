// 🌳 Corporate Hierarchy - ownership tree rooted at an ultimate parent
//
// Each node owns its children outright. The same LEI reached through two
// branches is two independent nodes; nothing is shared or collapsed.

pub mod analysis;
pub mod loader;

use crate::entity::{lei_key, EntityRecord};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::fmt;

pub use analysis::{HierarchyAnalysis, HierarchyAnalyzer, RiskDimension, RiskLevel};
pub use loader::{ExpandOutcome, HierarchyLoader, LoadEvent, LoadOutcome, LoadStatus};

// ============================================================================
// NODE PATH
// ============================================================================

/// Address of a node: child indices from the root. The root is `[]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodePath(Vec<usize>);

impl NodePath {
    pub fn root() -> Self {
        NodePath(Vec::new())
    }

    pub fn child(&self, index: usize) -> Self {
        let mut steps = self.0.clone();
        steps.push(index);
        NodePath(steps)
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn steps(&self) -> &[usize] {
        &self.0
    }

    /// Parse "0.2.1" (empty string or "root" = root).
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() || raw.eq_ignore_ascii_case("root") {
            return Some(NodePath::root());
        }
        raw.split('.')
            .map(|step| step.trim().parse::<usize>().ok())
            .collect::<Option<Vec<_>>>()
            .map(NodePath)
    }
}

impl From<Vec<usize>> for NodePath {
    fn from(steps: Vec<usize>) -> Self {
        NodePath(steps)
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("root");
        }
        let parts: Vec<String> = self.0.iter().map(|i| i.to_string()).collect();
        f.write_str(&parts.join("."))
    }
}

// ============================================================================
// HIERARCHY NODE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HierarchyNode {
    pub entity: EntityRecord,

    /// Registry order; always empty while `fetched` is false
    children: Vec<HierarchyNode>,

    /// Children known (possibly none) vs. not asked yet
    fetched: bool,
}

impl HierarchyNode {
    pub fn new(entity: EntityRecord) -> Self {
        HierarchyNode {
            entity,
            children: Vec::new(),
            fetched: false,
        }
    }

    pub fn lei(&self) -> &str {
        &self.entity.lei
    }

    pub fn children(&self) -> &[HierarchyNode] {
        &self.children
    }

    pub fn is_fetched(&self) -> bool {
        self.fetched
    }

    /// Attach a fetched child list and mark the node fetched.
    ///
    /// Returns false (and changes nothing) if the node was already fetched.
    pub fn attach_children(&mut self, children: Vec<EntityRecord>) -> bool {
        if self.fetched {
            return false;
        }
        self.children = children.into_iter().map(HierarchyNode::new).collect();
        self.fetched = true;
        true
    }

    pub fn node_at(&self, path: &NodePath) -> Option<&HierarchyNode> {
        let mut node = self;
        for &step in path.steps() {
            node = node.children.get(step)?;
        }
        Some(node)
    }

    pub fn node_at_mut(&mut self, path: &NodePath) -> Option<&mut HierarchyNode> {
        let mut node = self;
        for &step in path.steps() {
            node = node.children.get_mut(step)?;
        }
        Some(node)
    }

    /// LEI keys on the chain from this node down to `path`, both ends included.
    pub fn lineage(&self, path: &NodePath) -> Option<HashSet<String>> {
        let mut node = self;
        let mut keys = HashSet::from([lei_key(node.lei())]);
        for &step in path.steps() {
            node = node.children.get(step)?;
            keys.insert(lei_key(node.lei()));
        }
        Some(keys)
    }

    /// Number of nodes in this subtree (including self).
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(HierarchyNode::node_count).sum::<usize>()
    }

    pub fn max_depth(&self) -> usize {
        self.children
            .iter()
            .map(|c| 1 + c.max_depth())
            .max()
            .unwrap_or(0)
    }

    /// Breadth-first visit of every node with its path, depth = path length.
    pub fn walk(&self) -> Vec<(NodePath, &HierarchyNode)> {
        let mut out = Vec::new();
        let mut queue: VecDeque<(NodePath, &HierarchyNode)> = VecDeque::new();
        queue.push_back((NodePath::root(), self));

        while let Some((path, node)) = queue.pop_front() {
            for (i, child) in node.children.iter().enumerate() {
                queue.push_back((path.child(i), child));
            }
            out.push((path, node));
        }
        out
    }

    /// Path of the first node (BFS order) holding `lei`.
    pub fn find_path(&self, lei: &str) -> Option<NodePath> {
        let key = lei_key(lei);
        self.walk()
            .into_iter()
            .find(|(_, node)| lei_key(node.lei()) == key)
            .map(|(path, _)| path)
    }

    /// Paths still waiting for their children, BFS order.
    pub fn unfetched_paths(&self) -> Vec<NodePath> {
        self.walk()
            .into_iter()
            .filter(|(_, node)| !node.fetched)
            .map(|(path, _)| path)
            .collect()
    }

    /// Nodes a UI would render: the root, plus children of every expanded
    /// node (by LEI) whose own ancestors are expanded too.
    pub fn visible_nodes(&self, expanded: &HashSet<String>) -> Vec<(NodePath, &HierarchyNode)> {
        let expanded: HashSet<String> = expanded.iter().map(|l| lei_key(l)).collect();
        let mut out = vec![(NodePath::root(), self)];
        let mut stack: Vec<(NodePath, &HierarchyNode)> = vec![(NodePath::root(), self)];

        while let Some((path, node)) = stack.pop() {
            if !path.is_root() && !expanded.contains(&lei_key(node.lei())) {
                continue;
            }
            for (i, child) in node.children.iter().enumerate() {
                out.push((path.child(i), child));
                stack.push((path.child(i), child));
            }
        }
        out
    }

    /// (depth, parent LEI, node) rows in depth-first pre-order.
    pub fn flatten(&self) -> Vec<(usize, Option<&str>, &HierarchyNode)> {
        let mut rows = Vec::new();
        self.flatten_into(0, None, &mut rows);
        rows
    }

    fn flatten_into<'a>(
        &'a self,
        depth: usize,
        parent: Option<&'a str>,
        rows: &mut Vec<(usize, Option<&'a str>, &'a HierarchyNode)>,
    ) {
        rows.push((depth, parent, self));
        for child in &self.children {
            child.flatten_into(depth + 1, Some(self.lei()), rows);
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_tree() -> HierarchyNode {
        let mut root = HierarchyNode::new(EntityRecord::new("ROOT0000000000000001", "Acme Holdings plc"));
        root.attach_children(vec![
            EntityRecord::new("SUBA0000000000000002", "Acme Europe GmbH"),
            EntityRecord::new("SUBB0000000000000003", "Acme Americas Inc."),
        ]);
        let sub_a = root.node_at_mut(&NodePath::from(vec![0])).unwrap();
        sub_a.attach_children(vec![EntityRecord::new("LEAF0000000000000004", "Widget Works Ltd")]);
        root
    }

    #[test]
    fn test_attach_marks_fetched_once() {
        let mut node = HierarchyNode::new(EntityRecord::new("ROOT0000000000000001", "Acme"));
        assert!(!node.is_fetched());
        assert!(node.children().is_empty());

        assert!(node.attach_children(vec![]));
        assert!(node.is_fetched());
        assert!(node.children().is_empty());

        // Second attach is refused
        assert!(!node.attach_children(vec![EntityRecord::new("SUBA0000000000000002", "Sub")]));
        assert!(node.children().is_empty());
    }

    #[test]
    fn test_paths_and_lookup() {
        let tree = sample_tree();
        assert_eq!(tree.node_count(), 4);
        assert_eq!(tree.max_depth(), 2);

        let leaf = tree.find_path("leaf0000000000000004").unwrap();
        assert_eq!(leaf, NodePath::from(vec![0, 0]));
        assert_eq!(leaf.to_string(), "0.0");
        assert_eq!(tree.node_at(&leaf).unwrap().lei(), "LEAF0000000000000004");
        assert!(tree.node_at(&NodePath::from(vec![5])).is_none());
        assert!(tree.find_path("MISSING0000000000000").is_none());
    }

    #[test]
    fn test_lineage_follows_one_branch() {
        let tree = sample_tree();

        let leaf = tree.lineage(&NodePath::from(vec![0, 0])).unwrap();
        assert_eq!(leaf.len(), 3);
        assert!(leaf.contains("ROOT0000000000000001"));
        assert!(leaf.contains("SUBA0000000000000002"));
        assert!(!leaf.contains("SUBB0000000000000003"));

        assert_eq!(tree.lineage(&NodePath::root()).unwrap().len(), 1);
        assert!(tree.lineage(&NodePath::from(vec![3])).is_none());
    }

    #[test]
    fn test_node_path_parse() {
        assert_eq!(NodePath::parse("root"), Some(NodePath::root()));
        assert_eq!(NodePath::parse(""), Some(NodePath::root()));
        assert_eq!(NodePath::parse("0.2.1"), Some(NodePath::from(vec![0, 2, 1])));
        assert_eq!(NodePath::parse("0.x"), None);
        assert_eq!(NodePath::root().to_string(), "root");
    }

    #[test]
    fn test_walk_is_breadth_first() {
        let tree = sample_tree();
        let order: Vec<&str> = tree.walk().into_iter().map(|(_, n)| n.lei()).collect();
        assert_eq!(
            order,
            vec![
                "ROOT0000000000000001",
                "SUBA0000000000000002",
                "SUBB0000000000000003",
                "LEAF0000000000000004"
            ]
        );
    }

    #[test]
    fn test_unfetched_and_visible() {
        let tree = sample_tree();
        let pending: Vec<String> = tree.unfetched_paths().iter().map(|p| p.to_string()).collect();
        assert_eq!(pending, vec!["1", "0.0"]);

        let visible = tree.visible_nodes(&HashSet::new());
        assert_eq!(visible.len(), 3);

        let expanded: HashSet<String> = ["SUBA0000000000000002".to_string()].into_iter().collect();
        assert_eq!(tree.visible_nodes(&expanded).len(), 4);
    }

    #[test]
    fn test_flatten_rows() {
        let tree = sample_tree();
        let rows = tree.flatten();
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0].0, 0);
        assert_eq!(rows[0].1, None);
        assert_eq!(rows[2].0, 2);
        assert_eq!(rows[2].1, Some("SUBA0000000000000002"));
    }
}
