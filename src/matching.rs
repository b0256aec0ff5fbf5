// 🎯 Match Ranker - confidence scoring and ranking of registry candidates
//
// Score = 60·edit + 35·jaccard + prefix/contains bonus + coverage bonus,
// then a children bonus that favors holding entities among lookalikes.

use crate::config::AppConfig;
use crate::entity::{lei_key, EntityRecord};
use crate::normalize::normalize_name;
use crate::registry::{with_timeout, LeiRegistry};
use crate::similarity::{jaccard_similarity, levenshtein_similarity};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

// ============================================================================
// MATCH KIND & CONFIDENCE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MatchKind {
    None,
    Weak,
    Partial,
    Strong,
    Exact,
}

impl MatchKind {
    pub fn from_score(score: u8) -> Self {
        match score {
            95..=u8::MAX => MatchKind::Exact,
            85..=94 => MatchKind::Strong,
            70..=84 => MatchKind::Partial,
            _ => MatchKind::Weak,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MatchKind::None => "None",
            MatchKind::Weak => "Weak",
            MatchKind::Partial => "Partial",
            MatchKind::Strong => "Strong",
            MatchKind::Exact => "Exact",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "None" => Some(MatchKind::None),
            "Weak" => Some(MatchKind::Weak),
            "Partial" => Some(MatchKind::Partial),
            "Strong" => Some(MatchKind::Strong),
            "Exact" => Some(MatchKind::Exact),
            _ => None,
        }
    }
}

impl fmt::Display for MatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confidence {
    pub score: u8,
    pub kind: MatchKind,
}

/// Score how well `candidate_name` answers `query` (0-100 plus a kind).
pub fn compute_confidence(query: &str, candidate_name: &str) -> Confidence {
    let norm_q = normalize_name(query);
    let norm_c = normalize_name(candidate_name);

    if norm_q.is_empty() || norm_c.is_empty() {
        return Confidence {
            score: 0,
            kind: MatchKind::None,
        };
    }
    if norm_q == norm_c {
        return Confidence {
            score: 100,
            kind: MatchKind::Exact,
        };
    }

    let tokens_q: Vec<&str> = norm_q.split_whitespace().collect();
    let tokens_c: Vec<&str> = norm_c.split_whitespace().collect();

    let token_sim = jaccard_similarity(&tokens_q, &tokens_c);
    let edit_sim = levenshtein_similarity(&norm_q, &norm_c);

    let mut score = 60.0 * edit_sim + 35.0 * token_sim;

    if norm_c.starts_with(&norm_q) {
        score += 5.0;
    } else if norm_c.contains(&norm_q) {
        score += 3.0;
    }

    if tokens_q.iter().all(|t| tokens_c.contains(t)) {
        score += 2.0;
    }

    let score = score.round().clamp(0.0, 100.0) as u8;
    Confidence {
        score,
        kind: MatchKind::from_score(score),
    }
}

/// 0 for childless candidates, else up to 10 relative to the largest family.
pub fn children_bonus(count: u64, max_children: u64) -> u8 {
    if count == 0 {
        return 0;
    }
    let max_children = max_children.max(1);
    let bonus = (10.0 * count as f64 / max_children as f64).round();
    bonus.min(10.0) as u8
}

// ============================================================================
// MATCH RESULTS
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub entity: EntityRecord,

    /// Boosted score (name score + children bonus), what ranking uses
    pub confidence: u8,

    /// Kind of the name match itself, before the children bonus
    pub match_kind: MatchKind,

    pub name_score: u8,
    pub direct_children: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchResult {
    pub input_entity: String,
    pub matches: Vec<MatchCandidate>,
}

impl MatchResult {
    pub fn empty(input_entity: &str) -> Self {
        MatchResult {
            input_entity: input_entity.to_string(),
            matches: Vec::new(),
        }
    }

    pub fn best(&self) -> Option<&MatchCandidate> {
        self.matches.first()
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }
}

/// Rank candidates given their direct-child counts (same order as `candidates`).
///
/// Missing counts are treated as 0. Ties keep registry order.
pub fn rank_with_counts(query: &str, candidates: Vec<EntityRecord>, counts: &[u64]) -> MatchResult {
    let max_children = counts.iter().copied().max().unwrap_or(0).max(1);

    let mut matches: Vec<MatchCandidate> = candidates
        .into_iter()
        .enumerate()
        .map(|(i, entity)| {
            let count = counts.get(i).copied().unwrap_or(0);
            let base = compute_confidence(query, entity.display_name());
            let boosted = (base.score as u16 + children_bonus(count, max_children) as u16).min(100) as u8;
            MatchCandidate {
                entity,
                confidence: boosted,
                match_kind: base.kind,
                name_score: base.score,
                direct_children: count,
            }
        })
        .collect();

    // Stable: equal scores stay in registry order
    matches.sort_by(|a, b| b.confidence.cmp(&a.confidence));

    MatchResult {
        input_entity: query.to_string(),
        matches,
    }
}

/// Split bulk input (one entity per line, or comma separated) into queries.
pub fn parse_entity_list(text: &str) -> Vec<String> {
    text.split(|c| c == '\n' || c == ',' || c == '\r')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Best match for one input plus the top of its ownership chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityResolution {
    pub input_entity: String,
    pub selected: Option<EntityRecord>,
    pub confidence: Option<u8>,
    pub ultimate_parent: Option<EntityRecord>,
}

// ============================================================================
// MATCH RANKER
// ============================================================================

pub struct MatchRanker {
    registry: Arc<dyn LeiRegistry>,
    concurrency: usize,
    call_timeout: Duration,
}

impl MatchRanker {
    pub fn new(registry: Arc<dyn LeiRegistry>) -> Self {
        MatchRanker {
            registry,
            concurrency: 6,
            call_timeout: Duration::from_secs(60),
        }
    }

    pub fn from_config(registry: Arc<dyn LeiRegistry>, config: &AppConfig) -> Self {
        Self::new(registry)
            .with_concurrency(config.matching.child_count_concurrency)
            .with_call_timeout(config.hierarchy.call_timeout())
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_call_timeout(mut self, limit: Duration) -> Self {
        self.call_timeout = limit;
        self
    }

    /// Direct-child count per candidate; a failed lookup counts as 0.
    async fn child_counts(&self, candidates: &[EntityRecord]) -> Vec<u64> {
        stream::iter(candidates.iter())
            .map(|candidate| async move {
                let lookup = self.registry.get_direct_children_count(&candidate.lei);
                match with_timeout(self.call_timeout, lookup).await {
                    Ok(count) => count,
                    Err(e) => {
                        debug!(lei = %candidate.lei, error = %e, "Child count unavailable, using 0");
                        0
                    }
                }
            })
            .buffered(self.concurrency)
            .collect()
            .await
    }

    pub async fn rank_matches(&self, query: &str, candidates: Vec<EntityRecord>) -> MatchResult {
        let counts = self.child_counts(&candidates).await;
        rank_with_counts(query, candidates, &counts)
    }

    /// Search the registry and rank what comes back. Failures give no matches.
    pub async fn search_and_rank(&self, query: &str) -> MatchResult {
        let query = query.trim();
        if query.is_empty() {
            return MatchResult::empty(query);
        }

        let search = self.registry.search_entities(query);
        let candidates = match with_timeout(self.call_timeout, search).await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(query, error = %e, "Registry search failed");
                return MatchResult::empty(query);
            }
        };

        let result = self.rank_matches(query, candidates).await;
        debug!(query, matches = result.matches.len(), "Ranked candidates");
        result
    }

    /// One result per non-blank query, in input order.
    pub async fn match_batch(&self, queries: &[String]) -> Vec<MatchResult> {
        let mut results = Vec::with_capacity(queries.len());
        for query in queries.iter().map(|q| q.trim()).filter(|q| !q.is_empty()) {
            results.push(self.search_and_rank(query).await);
        }
        info!(queries = results.len(), "Batch matching complete");
        results
    }

    pub async fn resolve_entities(&self, queries: &[String]) -> Vec<EntityResolution> {
        let mut rows = Vec::with_capacity(queries.len());

        for result in self.match_batch(queries).await {
            let Some(best) = result.best() else {
                rows.push(EntityResolution {
                    input_entity: result.input_entity.clone(),
                    selected: None,
                    confidence: None,
                    ultimate_parent: None,
                });
                continue;
            };

            let lookup = self.registry.get_ultimate_parent(&best.entity.lei);
            let ultimate_parent = match with_timeout(self.call_timeout, lookup).await {
                Ok(parent) => parent,
                Err(e) => {
                    warn!(lei = %best.entity.lei, error = %e, "Ultimate parent lookup failed");
                    None
                }
            };

            rows.push(EntityResolution {
                input_entity: result.input_entity.clone(),
                selected: Some(best.entity.clone()),
                confidence: Some(best.confidence),
                ultimate_parent,
            });
        }
        rows
    }

    /// Position of `lei` in a ranked result, if present.
    pub fn rank_of(result: &MatchResult, lei: &str) -> Option<usize> {
        let key = lei_key(lei);
        result.matches.iter().position(|m| lei_key(&m.entity.lei) == key)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::HierarchyShape;
    use crate::registry::{InMemoryRegistry, RegistryError};
    use async_trait::async_trait;

    #[test]
    fn test_identical_names_are_exact() {
        let c = compute_confidence("Apple Inc.", "Apple Inc.");
        assert_eq!(c, Confidence { score: 100, kind: MatchKind::Exact });

        // Suffix stripping makes these identical
        let c = compute_confidence("Apple", "Apple Inc.");
        assert_eq!(c, Confidence { score: 100, kind: MatchKind::Exact });
    }

    #[test]
    fn test_empty_side_is_none() {
        assert_eq!(compute_confidence("", "Apple").kind, MatchKind::None);
        assert_eq!(compute_confidence("Apple", "Inc.").score, 0);
    }

    #[test]
    fn test_amazon_is_not_exact() {
        // edit 0.6 → 36, jaccard 0, prefix +5
        let c = compute_confidence("Amazon", "Amazon.com, Inc.");
        assert_eq!(c.score, 41);
        assert_ne!(c.kind, MatchKind::Exact);
    }

    #[test]
    fn test_prefix_and_coverage_bonuses() {
        // "deutsche bank" vs "deutsche bank europe"
        // edit = 1 - 7/20 = 0.65 → 39, jaccard 2/3 → 23.33, +5 prefix, +2 coverage
        let c = compute_confidence("Deutsche Bank", "Deutsche Bank Europe GmbH");
        assert_eq!(c.score, 69);
        assert_eq!(c.kind, MatchKind::Weak);

        // Contained but not a prefix: +3 instead of +5
        let c = compute_confidence("Goldman Sachs Group", "The Goldman Sachs Group, Inc.");
        assert_eq!(c.score, 81);
        assert_eq!(c.kind, MatchKind::Partial);
    }

    #[test]
    fn test_kind_thresholds() {
        assert_eq!(MatchKind::from_score(95), MatchKind::Exact);
        assert_eq!(MatchKind::from_score(94), MatchKind::Strong);
        assert_eq!(MatchKind::from_score(85), MatchKind::Strong);
        assert_eq!(MatchKind::from_score(84), MatchKind::Partial);
        assert_eq!(MatchKind::from_score(70), MatchKind::Partial);
        assert_eq!(MatchKind::from_score(69), MatchKind::Weak);
        assert_eq!(MatchKind::from_score(0), MatchKind::Weak);
        assert_eq!(MatchKind::parse("Strong"), Some(MatchKind::Strong));
        assert_eq!(MatchKind::parse("great"), None);
    }

    #[test]
    fn test_children_bonus() {
        assert_eq!(children_bonus(0, 50), 0);
        assert_eq!(children_bonus(50, 50), 10);
        assert_eq!(children_bonus(5, 50), 1);
        assert_eq!(children_bonus(1, 0), 10);
        assert_eq!(children_bonus(3, 40), 1);
    }

    #[test]
    fn test_children_bonus_breaks_name_ties() {
        let candidates = vec![
            EntityRecord::new("AAAA0000000000000001", "Acme Holdings"),
            EntityRecord::new("BBBB0000000000000002", "Acme Holdings"),
        ];
        let result = rank_with_counts("Acme", candidates.clone(), &[0, 0]);
        assert_eq!(result.matches[0].entity.lei, "AAAA0000000000000001");

        let result = rank_with_counts("Acme", candidates, &[0, 12]);
        assert_eq!(result.matches[0].entity.lei, "BBBB0000000000000002");
        assert_eq!(result.matches[0].confidence, result.matches[0].name_score + 10);
        // Kind is about the name, not the bonus
        assert_eq!(result.matches[0].match_kind, result.matches[1].match_kind);
    }

    #[test]
    fn test_more_children_never_lowers_rank() {
        let candidates = vec![
            EntityRecord::new("AAAA0000000000000001", "Nordic Bank"),
            EntityRecord::new("BBBB0000000000000002", "Nordic Bank"),
            EntityRecord::new("CCCC0000000000000003", "Nordic Banking Group"),
        ];
        let mut previous = usize::MAX;
        for count in [0u64, 1, 5, 20, 100] {
            let result = rank_with_counts("Nordic", candidates.clone(), &[3, count, 2]);
            let position = MatchRanker::rank_of(&result, "BBBB0000000000000002").unwrap();
            assert!(position <= previous);
            previous = position;
        }
        assert_eq!(previous, 0);
    }

    #[test]
    fn test_nameless_candidate_scores_its_lei() {
        let mut nameless = EntityRecord::new("5493001KJTIIGC8Y1R12", "");
        nameless.legal_name = None;
        let named = EntityRecord::new("AAAA0000000000000001", "Bloomberg Finance L.P.");

        let result = rank_with_counts("5493001KJTIIGC8Y1R12", vec![named, nameless], &[0, 0]);
        assert_eq!(result.matches[0].entity.lei, "5493001KJTIIGC8Y1R12");
        assert_eq!(result.matches[0].confidence, 100);
        assert_eq!(result.matches[0].match_kind, MatchKind::Exact);
    }

    #[test]
    fn test_boost_is_capped() {
        let candidates = vec![EntityRecord::new("AAAA0000000000000001", "Apple Inc.")];
        let result = rank_with_counts("Apple", candidates, &[400]);
        assert_eq!(result.matches[0].confidence, 100);
    }

    #[test]
    fn test_parse_entity_list() {
        let parsed = parse_entity_list("Apple Inc.\nMicrosoft Corporation, Tesla\r\n\n  ,Amazon ");
        assert_eq!(parsed, vec!["Apple Inc.", "Microsoft Corporation", "Tesla", "Amazon"]);
        assert!(parse_entity_list(" \n , ").is_empty());
    }

    fn registry() -> Arc<dyn LeiRegistry> {
        let mut registry = InMemoryRegistry::new();
        registry.insert(EntityRecord::new("ACME0000000000000001", "Acme Holdings plc"));
        registry.insert(EntityRecord::new("ACME0000000000000002", "Acme Holdings Ltd"));
        registry.insert(EntityRecord::new("ACME0000000000000003", "Acme Europe GmbH"));
        registry.link("ACME0000000000000002", "ACME0000000000000003");
        Arc::new(registry)
    }

    #[tokio::test]
    async fn test_search_and_rank_prefers_parent() {
        let ranker = MatchRanker::new(registry());
        let result = ranker.search_and_rank("Acme").await;
        assert_eq!(result.matches.len(), 3);
        // Same name as ACME..01, but it owns a subsidiary
        assert_eq!(result.matches[0].entity.lei, "ACME0000000000000002");
        assert_eq!(result.matches[0].direct_children, 1);
        assert_eq!(result.matches[0].match_kind, MatchKind::Weak);
        assert_eq!(result.matches[2].entity.lei, "ACME0000000000000001");
    }

    struct Unreachable;

    #[async_trait]
    impl LeiRegistry for Unreachable {
        async fn search_entities(&self, _: &str) -> Result<Vec<EntityRecord>, RegistryError> {
            Err(RegistryError::Unreachable("offline".into()))
        }
        async fn get_entity(&self, _: &str) -> Result<Option<EntityRecord>, RegistryError> {
            Err(RegistryError::Unreachable("offline".into()))
        }
        async fn get_ultimate_parent(&self, _: &str) -> Result<Option<EntityRecord>, RegistryError> {
            Err(RegistryError::Unreachable("offline".into()))
        }
        async fn get_direct_children(&self, _: &str) -> Result<Vec<EntityRecord>, RegistryError> {
            Err(RegistryError::Unreachable("offline".into()))
        }
        async fn get_direct_children_count(&self, _: &str) -> Result<u64, RegistryError> {
            Err(RegistryError::Unreachable("offline".into()))
        }
        async fn get_hierarchy_shape(&self, _: &str) -> Result<HierarchyShape, RegistryError> {
            Err(RegistryError::Unreachable("offline".into()))
        }
    }

    #[tokio::test]
    async fn test_failures_degrade_to_empty() {
        let ranker = MatchRanker::new(Arc::new(Unreachable));
        let result = ranker.search_and_rank("Apple").await;
        assert_eq!(result.input_entity, "Apple");
        assert!(result.is_empty());

        // Count failures only cost the bonus
        let ranked = ranker
            .rank_matches("Apple", vec![EntityRecord::new("AAAA0000000000000001", "Apple Inc.")])
            .await;
        assert_eq!(ranked.matches[0].direct_children, 0);
        assert_eq!(ranked.matches[0].confidence, 100);
    }

    #[tokio::test]
    async fn test_batch_and_resolution() {
        let ranker = MatchRanker::new(registry());
        let queries = parse_entity_list("Acme Europe\n\nZebra Corp");
        let results = ranker.match_batch(&queries).await;
        assert_eq!(results.len(), 2);
        assert!(results[1].is_empty());

        let rows = ranker.resolve_entities(&queries).await;
        assert_eq!(rows[0].selected.as_ref().unwrap().lei, "ACME0000000000000003");
        assert_eq!(rows[0].ultimate_parent.as_ref().unwrap().lei, "ACME0000000000000002");
        assert!(rows[1].selected.is_none());
    }
}
