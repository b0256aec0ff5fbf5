// LEI Explorer - Core Library
// Entity matching + corporate hierarchy exploration over an LEI registry.
// Exposes all modules for use in the CLI, the API server, and tests

pub mod entity;      // Entity records, statuses, LEI format
pub mod normalize;   // Name normalization
pub mod similarity;  // Jaccard + Levenshtein
pub mod country;     // ISO-3166 resolution
pub mod matching;    // Confidence scoring, ranking, batch + resolution
pub mod registry;    // LeiRegistry trait + GLEIF / cache / in-memory
pub mod hierarchy;   // Tree model, loader, analyzer
pub mod export;      // CSV exports
pub mod config;      // AppConfig

// Re-export commonly used types
pub use entity::{
    EntityRecord, EntityStatus, HierarchyShape, EntityDetails, PostalAddress, RegistrationAuthority,
    is_lei, lei_key,
};
pub use normalize::{normalize_name, tokenize};
pub use similarity::{jaccard_similarity, levenshtein_distance, levenshtein_similarity};
pub use country::{Country, CountryResolver};
pub use matching::{
    MatchRanker, MatchResult, MatchCandidate, MatchKind, Confidence, EntityResolution,
    compute_confidence, children_bonus, rank_with_counts, parse_entity_list,
};
pub use registry::{
    LeiRegistry, RegistryError,
    GleifClient, CachedRegistry, InMemoryRegistry,
};
pub use hierarchy::{
    HierarchyNode, NodePath,
    HierarchyLoader, LoadOutcome, ExpandOutcome, LoadEvent, LoadStatus,
    HierarchyAnalyzer, HierarchyAnalysis, RiskDimension, RiskLevel,
};
pub use export::{
    MatchRow, ResolutionRow, HierarchyRow,
    write_match_csv, read_match_csv, write_resolution_csv, write_hierarchy_csv, to_csv_string,
};
pub use config::AppConfig;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// TESTS - search → rank → export → hierarchy → analysis over one fixture
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::memory::{RegistryFixture, Relationship};
    use chrono::NaiveDate;
    use std::sync::Arc;

    const ROOT: &str = "ACMEHOLD000000000001";
    const EUROPE: &str = "ACMEEURO000000000002";
    const BRITAIN: &str = "ACMEBRIT000000000003";
    const FRANCE: &str = "ACMEFRAN000000000004";
    const GLOBEX: &str = "GLOBEXCO000000000005";

    fn fixture() -> RegistryFixture {
        let date = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        RegistryFixture {
            entities: vec![
                EntityRecord::new(ROOT, "Acme Holdings Inc")
                    .with_jurisdiction("US-DE")
                    .with_status(EntityStatus::Active)
                    .with_last_update(date),
                EntityRecord::new(EUROPE, "Acme Europe GmbH")
                    .with_jurisdiction("DE")
                    .with_status(EntityStatus::Active),
                EntityRecord::new(BRITAIN, "Acme Britain Ltd")
                    .with_jurisdiction("GB")
                    .with_status(EntityStatus::Lapsed),
                EntityRecord::new(FRANCE, "Acme France SAS")
                    .with_jurisdiction("FR")
                    .with_status(EntityStatus::Active),
                EntityRecord::new(GLOBEX, "Globex Corporation").with_jurisdiction("US-CA"),
            ],
            relationships: vec![
                Relationship { parent: ROOT.to_string(), child: EUROPE.to_string() },
                Relationship { parent: ROOT.to_string(), child: BRITAIN.to_string() },
                Relationship { parent: EUROPE.to_string(), child: FRANCE.to_string() },
            ],
        }
    }

    fn registry() -> Arc<dyn LeiRegistry> {
        Arc::new(CachedRegistry::from_config(
            InMemoryRegistry::from_fixture(fixture()),
            &config::CacheConfig::default(),
        ))
    }

    #[tokio::test]
    async fn test_batch_match_and_resolution_export() {
        let ranker = MatchRanker::new(registry());
        let queries = parse_entity_list("Acme Holdings\nAcme France SAS, Nothing Here");
        let results = ranker.match_batch(&queries).await;

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].best().unwrap().entity.lei, ROOT);
        assert_eq!(results[0].best().unwrap().match_kind, MatchKind::Exact);
        assert_eq!(results[1].best().unwrap().entity.lei, FRANCE);
        assert!(results[2].is_empty());

        let csv_text = to_csv_string(|buf| write_match_csv(buf, &results)).unwrap();
        let rows = read_match_csv(csv_text.as_bytes()).unwrap();
        let candidates: usize = results.iter().map(|r| r.matches.len()).sum();
        assert_eq!(rows.len(), candidates);
        assert!(rows.iter().all(|r| r.input_entity != "Nothing Here"));

        let resolutions = ranker.resolve_entities(&queries).await;
        assert_eq!(resolutions[1].selected.as_ref().unwrap().lei, FRANCE);
        assert_eq!(resolutions[1].ultimate_parent.as_ref().unwrap().lei, ROOT);
        assert!(resolutions[2].selected.is_none());
    }

    #[tokio::test]
    async fn test_load_export_and_analyze_hierarchy() {
        let loader = HierarchyLoader::new(registry());

        // Seeding from a grandchild still roots the tree at the ultimate parent
        let outcome = loader.load_hierarchy(FRANCE).await;
        assert!(matches!(outcome, LoadOutcome::Loaded { ref root_lei, first_level: Some(2), .. } if root_lei == ROOT));
        loader.wait_for_background().await;

        let tree = loader.snapshot().unwrap();
        assert_eq!(tree.node_count(), 4);
        assert!(tree.unfetched_paths().is_empty());
        assert_eq!(tree.find_path(FRANCE), Some(NodePath::from(vec![0, 0])));

        let csv_text = to_csv_string(|buf| write_hierarchy_csv(buf, &tree)).unwrap();
        let leis: Vec<&str> = csv_text
            .lines()
            .skip(1)
            .filter_map(|line| line.split(',').nth(1))
            .collect();
        assert_eq!(leis, vec![ROOT, EUROPE, FRANCE, BRITAIN]);

        let shape = loader.refresh_shape().await.unwrap();
        assert_eq!(shape.descendants_count, 3);
        assert_eq!(shape.max_depth, 2);
        assert_eq!(loader.status().expected_total, Some(3));

        let analysis = loader.analyze().unwrap();
        assert_eq!(analysis.total, 4);
        assert_eq!(analysis.max_depth, 2);
        assert_eq!(analysis.num_countries, 4);
        assert_eq!(analysis.non_active_pct, 25);
    }
}
