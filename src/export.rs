// 📤 CSV Export - flat rows for match, resolution and hierarchy results

use crate::country::CountryResolver;
use crate::hierarchy::HierarchyNode;
use crate::matching::{EntityResolution, MatchResult};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

// ============================================================================
// MATCH EXPORT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRow {
    #[serde(rename = "Input Entity")]
    pub input_entity: String,
    #[serde(rename = "LEI")]
    pub lei: String,
    #[serde(rename = "Legal Name")]
    pub legal_name: String,
    #[serde(rename = "Jurisdiction")]
    pub jurisdiction: String,
    #[serde(rename = "Status")]
    pub status: String,
    #[serde(rename = "Confidence")]
    pub confidence: u8,
    #[serde(rename = "Match Type")]
    pub match_type: String,
}

/// One row per candidate; inputs without candidates produce no rows.
pub fn match_rows(results: &[MatchResult]) -> Vec<MatchRow> {
    results
        .iter()
        .flat_map(|result| {
            result.matches.iter().map(move |m| MatchRow {
                input_entity: result.input_entity.clone(),
                lei: m.entity.lei.clone(),
                legal_name: m.entity.legal_name.clone().unwrap_or_default(),
                jurisdiction: m.entity.jurisdiction.clone().unwrap_or_default(),
                status: m.entity.status.as_str().to_string(),
                confidence: m.confidence,
                match_type: m.match_kind.as_str().to_string(),
            })
        })
        .collect()
}

pub fn write_match_csv<W: Write>(writer: W, results: &[MatchResult]) -> Result<()> {
    write_rows(writer, &match_rows(results)).context("Failed to write match CSV")
}

pub fn read_match_csv<R: Read>(reader: R) -> Result<Vec<MatchRow>> {
    let mut rdr = csv::Reader::from_reader(reader);
    let mut rows = Vec::new();
    for (line, result) in rdr.deserialize().enumerate() {
        let row: MatchRow = result.with_context(|| format!("Failed to parse match CSV line {}", line + 2))?;
        rows.push(row);
    }
    Ok(rows)
}

// ============================================================================
// ENTITY RESOLUTION EXPORT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionRow {
    #[serde(rename = "Input Entity")]
    pub input_entity: String,
    #[serde(rename = "Selected Match LEI")]
    pub selected_lei: String,
    #[serde(rename = "Selected Match Name")]
    pub selected_name: String,
    #[serde(rename = "Ultimate Parent LEI")]
    pub ultimate_parent_lei: String,
    #[serde(rename = "Ultimate Parent Name")]
    pub ultimate_parent_name: String,
}

impl From<&EntityResolution> for ResolutionRow {
    fn from(resolution: &EntityResolution) -> Self {
        let selected = resolution.selected.as_ref();
        let parent = resolution.ultimate_parent.as_ref();
        ResolutionRow {
            input_entity: resolution.input_entity.clone(),
            selected_lei: selected.map(|e| e.lei.clone()).unwrap_or_default(),
            selected_name: selected.and_then(|e| e.legal_name.clone()).unwrap_or_default(),
            ultimate_parent_lei: parent.map(|e| e.lei.clone()).unwrap_or_default(),
            ultimate_parent_name: parent.and_then(|e| e.legal_name.clone()).unwrap_or_default(),
        }
    }
}

pub fn write_resolution_csv<W: Write>(writer: W, resolutions: &[EntityResolution]) -> Result<()> {
    let rows: Vec<ResolutionRow> = resolutions.iter().map(ResolutionRow::from).collect();
    write_rows(writer, &rows).context("Failed to write resolution CSV")
}

// ============================================================================
// HIERARCHY EXPORT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HierarchyRow {
    #[serde(rename = "Depth")]
    pub depth: usize,
    #[serde(rename = "LEI")]
    pub lei: String,
    #[serde(rename = "Legal Name")]
    pub legal_name: String,
    #[serde(rename = "Parent LEI")]
    pub parent_lei: String,
    #[serde(rename = "Jurisdiction")]
    pub jurisdiction: String,
    #[serde(rename = "Country")]
    pub country: String,
    #[serde(rename = "Status")]
    pub status: String,
    #[serde(rename = "Last Update")]
    pub last_update: String,
}

/// Depth-first rows, parents before their children.
pub fn hierarchy_rows(tree: &HierarchyNode, countries: &CountryResolver) -> Vec<HierarchyRow> {
    tree.flatten()
        .into_iter()
        .map(|(depth, parent, node)| {
            let entity = &node.entity;
            HierarchyRow {
                depth,
                lei: entity.lei.clone(),
                legal_name: entity.legal_name.clone().unwrap_or_default(),
                parent_lei: parent.unwrap_or_default().to_string(),
                jurisdiction: entity.jurisdiction.clone().unwrap_or_default(),
                country: entity
                    .country_hint()
                    .and_then(|hint| countries.resolve(hint))
                    .unwrap_or_default(),
                status: entity.status.as_str().to_string(),
                last_update: entity
                    .last_update
                    .map(|d| d.format("%Y-%m-%d").to_string())
                    .unwrap_or_default(),
            }
        })
        .collect()
}

pub fn write_hierarchy_csv<W: Write>(writer: W, tree: &HierarchyNode) -> Result<()> {
    let rows = hierarchy_rows(tree, &CountryResolver::new());
    write_rows(writer, &rows).context("Failed to write hierarchy CSV")
}

// ============================================================================
// SHARED
// ============================================================================

fn write_rows<W: Write, T: Serialize>(writer: W, rows: &[T]) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(writer);
    for row in rows {
        wtr.serialize(row)?;
    }
    wtr.flush()?;
    Ok(())
}

/// Render any of the exports above into a String (HTTP bodies, stdout).
pub fn to_csv_string<F>(write: F) -> Result<String>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    let mut buffer = Vec::new();
    write(&mut buffer)?;
    String::from_utf8(buffer).context("CSV output was not UTF-8")
}

// ============================================================================
// TESTS
// ============================================================================
