// 📊 Hierarchy Analyzer - structure, data quality and risk over a loaded tree
//
// Works on whatever part of the tree has loaded so far. Callers pass a
// snapshot; the analyzer never sees a tree that is still being mutated.

use super::HierarchyNode;
use crate::country::CountryResolver;
use crate::entity::EntityStatus;
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

// ============================================================================
// RISK LEVELS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    /// High above `hi`, Medium above `lo`, else Low.
    pub fn from_thresholds(value: f64, lo: f64, hi: f64) -> Self {
        if value > hi {
            RiskLevel::High
        } else if value > lo {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "Low",
            RiskLevel::Medium => "Medium",
            RiskLevel::High => "High",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RiskDimension {
    Concentration,
    Depth,
    Opacity,
    Staleness,
    Status,
    FanOut,
}

impl RiskDimension {
    pub fn label(&self) -> &'static str {
        match self {
            RiskDimension::Concentration => "Concentration (Geography)",
            RiskDimension::Depth => "Depth",
            RiskDimension::Opacity => "Opacity (Missing Data)",
            RiskDimension::Staleness => "Staleness",
            RiskDimension::Status => "Status",
            RiskDimension::FanOut => "Fan-out",
        }
    }
}

// ============================================================================
// ANALYSIS RESULT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountryCount {
    pub code: String,
    pub name: String,
    pub count: usize,
}

/// Read-only metrics for one snapshot of the tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HierarchyAnalysis {
    pub total: usize,
    pub max_depth: usize,
    pub depth_counts: BTreeMap<usize, usize>,

    /// Count descending, then ISO2 code
    pub countries: Vec<CountryCount>,
    pub num_countries: usize,
    pub hhi: u32,
    /// Percent, rounded
    pub top_country_share: u32,

    pub status_counts: BTreeMap<EntityStatus, usize>,
    pub non_active_pct: u32,

    pub missing_country_pct: u32,
    pub missing_name_pct: u32,
    pub missing_update_pct: u32,

    pub avg_children: f64,
    pub p75_children: usize,
    pub max_fan_out: usize,

    /// Median days since last update; None when no node carries a date
    pub median_staleness: Option<i64>,

    pub complexity_score: u32,
    pub risks: BTreeMap<RiskDimension, RiskLevel>,
}

impl HierarchyAnalysis {
    pub fn risk(&self, dimension: RiskDimension) -> RiskLevel {
        self.risks.get(&dimension).copied().unwrap_or(RiskLevel::Low)
    }
}

/// Value at index floor(p/100 · n) of the sorted sample (clamped).
fn percentile<T: Copy + Ord + Default>(values: &[T], p: f64) -> T {
    if values.is_empty() {
        return T::default();
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let idx = ((p / 100.0) * sorted.len() as f64).floor() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn pct(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        100.0 * part as f64 / total as f64
    }
}

// ============================================================================
// ANALYZER
// ============================================================================

pub struct HierarchyAnalyzer {
    countries: CountryResolver,
}

impl HierarchyAnalyzer {
    pub fn new(countries: CountryResolver) -> Self {
        HierarchyAnalyzer { countries }
    }

    pub fn analyze(&self, tree: &HierarchyNode) -> HierarchyAnalysis {
        self.analyze_at(tree, Utc::now().date_naive())
    }

    /// Same as `analyze`, with staleness measured against `today`.
    pub fn analyze_at(&self, tree: &HierarchyNode, today: NaiveDate) -> HierarchyAnalysis {
        let mut total = 0usize;
        let mut max_depth = 0usize;
        let mut depth_counts: BTreeMap<usize, usize> = BTreeMap::new();
        let mut breadth: Vec<usize> = Vec::new();
        let mut country_counts: HashMap<String, usize> = HashMap::new();
        let mut status_counts: BTreeMap<EntityStatus, usize> = BTreeMap::new();
        let mut staleness: Vec<i64> = Vec::new();
        let mut missing_country = 0usize;
        let mut missing_name = 0usize;
        let mut missing_update = 0usize;

        let mut stack: Vec<(&HierarchyNode, usize)> = vec![(tree, 0)];
        while let Some((node, depth)) = stack.pop() {
            total += 1;
            max_depth = max_depth.max(depth);
            *depth_counts.entry(depth).or_default() += 1;
            breadth.push(node.children().len());

            let entity = &node.entity;
            match entity.country_hint().and_then(|hint| self.countries.resolve(hint)) {
                Some(iso2) => *country_counts.entry(iso2).or_default() += 1,
                None => missing_country += 1,
            }

            *status_counts.entry(entity.status).or_default() += 1;

            if !entity.has_name() {
                missing_name += 1;
            }

            match entity.last_update {
                Some(date) => staleness.push((today - date).num_days()),
                None => missing_update += 1,
            }

            for child in node.children().iter().rev() {
                stack.push((child, depth + 1));
            }
        }

        let mut countries: Vec<CountryCount> = country_counts
            .into_iter()
            .map(|(code, count)| CountryCount {
                name: self.countries.country_name(&code),
                code,
                count,
            })
            .collect();
        countries.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.code.cmp(&b.code)));

        let top_share = match countries.first() {
            Some(top) if total > 0 => top.count as f64 / total as f64,
            _ => 0.0,
        };
        let hhi = if total > 0 {
            countries
                .iter()
                .map(|c| (100.0 * c.count as f64 / total as f64).powi(2))
                .sum::<f64>()
                .round() as u32
        } else {
            0
        };

        let avg_children = if breadth.is_empty() {
            0.0
        } else {
            breadth.iter().sum::<usize>() as f64 / breadth.len() as f64
        };
        let p75_children = percentile(&breadth, 75.0);
        let max_fan_out = breadth.iter().copied().max().unwrap_or(0);
        let median_staleness = if staleness.is_empty() {
            None
        } else {
            Some(percentile(&staleness, 50.0))
        };

        let active = status_counts.get(&EntityStatus::Active).copied().unwrap_or(0);
        let non_active_pct = pct(total - active, total);
        let missing_country_pct = pct(missing_country, total);
        let missing_name_pct = pct(missing_name, total);
        let missing_update_pct = pct(missing_update, total);

        let complexity = 15.0 * (max_depth as f64).ln_1p()
            + 20.0 * avg_children.ln_1p()
            + 10.0 * (total as f64 / 25.0).ln_1p();
        let complexity_score = complexity.round().min(100.0) as u32;

        let concentration = if hhi > 2500 || top_share > 0.6 {
            RiskLevel::High
        } else if hhi > 1800 || top_share > 0.4 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        };

        let opacity = missing_country_pct.max(missing_name_pct).max(missing_update_pct);

        let mut risks = BTreeMap::new();
        risks.insert(RiskDimension::Concentration, concentration);
        risks.insert(RiskDimension::Depth, RiskLevel::from_thresholds(max_depth as f64, 2.0, 4.0));
        risks.insert(RiskDimension::Opacity, RiskLevel::from_thresholds(opacity, 5.0, 20.0));
        risks.insert(
            RiskDimension::Staleness,
            RiskLevel::from_thresholds(median_staleness.unwrap_or(0) as f64, 180.0, 365.0),
        );
        risks.insert(RiskDimension::Status, RiskLevel::from_thresholds(non_active_pct, 5.0, 20.0));
        risks.insert(RiskDimension::FanOut, RiskLevel::from_thresholds(max_fan_out as f64, 20.0, 100.0));

        HierarchyAnalysis {
            total,
            max_depth,
            depth_counts,
            num_countries: countries.len(),
            countries,
            hhi,
            top_country_share: (top_share * 100.0).round() as u32,
            status_counts,
            non_active_pct: non_active_pct.round() as u32,
            missing_country_pct: missing_country_pct.round() as u32,
            missing_name_pct: missing_name_pct.round() as u32,
            missing_update_pct: missing_update_pct.round() as u32,
            avg_children: (avg_children * 100.0).round() / 100.0,
            p75_children,
            max_fan_out,
            median_staleness,
            complexity_score,
            risks,
        }
    }
}

impl Default for HierarchyAnalyzer {
    fn default() -> Self {
        Self::new(CountryResolver::new())
    }
}

// ============================================================================
// TESTS
// ============================================================================
