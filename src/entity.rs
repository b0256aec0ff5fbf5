// 🪪 Entity Records - what the LEI registry tells us about a legal entity
//
// EntityRecord is a VALUE: fetched once, never patched in place.
// A fresher view of the same LEI only arrives through a new fetch.

use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

fn lei_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9]{20}$").expect("static LEI pattern"))
}

/// True if `value` looks like a Legal Entity Identifier (20 alphanumerics).
pub fn is_lei(value: &str) -> bool {
    lei_pattern().is_match(value.trim())
}

/// Canonical match key for an LEI (codes are case-insensitive).
pub fn lei_key(value: &str) -> String {
    value.trim().to_ascii_uppercase()
}

// ============================================================================
// ENTITY STATUS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "Option<String>", into = "String")]
pub enum EntityStatus {
    Active,
    Lapsed,
    Retired,
    Pending,
    Unknown,
}

impl EntityStatus {
    /// Map a raw registry status (entity or registration status) to a display status.
    pub fn parse(raw: &str) -> Self {
        let upper = raw.trim().to_ascii_uppercase();
        match upper.as_str() {
            "ACTIVE" | "ISSUED" => EntityStatus::Active,
            "LAPSED" => EntityStatus::Lapsed,
            "RETIRED" | "INACTIVE" | "MERGED" | "ANNULLED" | "DUPLICATE" => EntityStatus::Retired,
            s if s.starts_with("PENDING") => EntityStatus::Pending,
            _ => EntityStatus::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityStatus::Active => "Active",
            EntityStatus::Lapsed => "Lapsed",
            EntityStatus::Retired => "Retired",
            EntityStatus::Pending => "Pending",
            EntityStatus::Unknown => "Unknown",
        }
    }

    pub fn is_active(&self) -> bool {
        *self == EntityStatus::Active
    }
}

impl Default for EntityStatus {
    fn default() -> Self {
        EntityStatus::Unknown
    }
}

impl From<Option<String>> for EntityStatus {
    fn from(raw: Option<String>) -> Self {
        raw.as_deref().map(EntityStatus::parse).unwrap_or_default()
    }
}

impl From<EntityStatus> for String {
    fn from(status: EntityStatus) -> Self {
        status.as_str().to_string()
    }
}

impl fmt::Display for EntityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// ENTITY RECORD
// ============================================================================

/// One LEI record as returned by the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    /// 20-character LEI code (stable identity)
    pub lei: String,

    /// Registered legal name (some records omit it)
    #[serde(default)]
    pub legal_name: Option<String>,

    /// Legal jurisdiction, may carry a region suffix ("US-DE")
    #[serde(default)]
    pub jurisdiction: Option<String>,

    /// Country code from the legal/HQ address; wins over jurisdiction
    #[serde(default)]
    pub country_code: Option<String>,

    #[serde(default)]
    pub status: EntityStatus,

    #[serde(default)]
    pub last_update: Option<NaiveDate>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub managing_lou: Option<String>,

    /// Flattened legal address ("line 1, city, region, postcode, country")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl EntityRecord {
    pub fn new(lei: impl Into<String>, legal_name: impl Into<String>) -> Self {
        EntityRecord {
            lei: lei.into(),
            legal_name: Some(legal_name.into()),
            jurisdiction: None,
            country_code: None,
            status: EntityStatus::Unknown,
            last_update: None,
            managing_lou: None,
            address: None,
        }
    }

    pub fn with_jurisdiction(mut self, jurisdiction: &str) -> Self {
        self.jurisdiction = Some(jurisdiction.to_string());
        self
    }

    pub fn with_country(mut self, country_code: &str) -> Self {
        self.country_code = Some(country_code.to_string());
        self
    }

    pub fn with_status(mut self, status: EntityStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_last_update(mut self, date: NaiveDate) -> Self {
        self.last_update = Some(date);
        self
    }

    /// Name shown to users: legal name, or the LEI when the name is missing.
    pub fn display_name(&self) -> &str {
        match self.legal_name.as_deref() {
            Some(name) if !name.trim().is_empty() => name,
            _ => &self.lei,
        }
    }

    pub fn has_name(&self) -> bool {
        self.legal_name
            .as_deref()
            .map(|n| !n.trim().is_empty())
            .unwrap_or(false)
    }

    /// The raw token used for country inference (`countryCode` overrides jurisdiction).
    pub fn country_hint(&self) -> Option<&str> {
        self.country_code
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .or_else(|| self.jurisdiction.as_deref())
    }

    pub fn same_lei(&self, lei: &str) -> bool {
        self.lei.eq_ignore_ascii_case(lei.trim())
    }
}

// ============================================================================
// HIERARCHY SHAPE (authoritative totals from the registry)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HierarchyShape {
    pub max_depth: usize,
    pub direct_children_count: u64,
    /// All levels below the root
    pub descendants_count: u64,
    pub ultimate_children_count: u64,
    pub visited_count: u64,
}

// ============================================================================
// ENTITY DETAILS (full company profile for one LEI)
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostalAddress {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default)]
    pub address_lines: Vec<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub postal_code: Option<String>,
}

impl PostalAddress {
    pub fn is_empty(&self) -> bool {
        self.address_lines.is_empty()
            && self.city.is_none()
            && self.region.is_none()
            && self.country.is_none()
            && self.postal_code.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationAuthority {
    /// RA code from the GLEIF RA list ("RA000665")
    #[serde(default)]
    pub authority_id: Option<String>,
    /// The entity's identifier at that authority (company number)
    #[serde(default)]
    pub entity_id: Option<String>,
}

/// Everything the registry publishes about one entity, beyond the summary
/// record used for matching and hierarchy work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityDetails {
    pub lei: String,
    #[serde(default)]
    pub legal_name: Option<String>,
    #[serde(default)]
    pub legal_address: Option<PostalAddress>,
    #[serde(default)]
    pub headquarters_address: Option<PostalAddress>,
    #[serde(default)]
    pub registration_authority: Option<RegistrationAuthority>,
    #[serde(default)]
    pub legal_jurisdiction: Option<String>,
    #[serde(default)]
    pub entity_category: Option<String>,
    #[serde(default)]
    pub entity_sub_category: Option<String>,
    #[serde(default)]
    pub entity_status: EntityStatus,
    #[serde(default)]
    pub entity_creation_date: Option<NaiveDate>,
    #[serde(default)]
    pub entity_expiration_date: Option<NaiveDate>,
    #[serde(default)]
    pub last_update_date: Option<NaiveDate>,
    #[serde(default)]
    pub next_renewal_date: Option<NaiveDate>,
    #[serde(default)]
    pub managing_lou: Option<String>,
    /// Corroboration level of the registration ("FULLY_CORROBORATED")
    #[serde(default)]
    pub validation_sources: Option<String>,
}

impl EntityDetails {
    /// Registration authority code, if the registry published one.
    pub fn registration_authority_id(&self) -> Option<&str> {
        self.registration_authority
            .as_ref()
            .and_then(|ra| ra.authority_id.as_deref())
    }
}

/// Details reduced to what a summary record carries. Registries that only
/// hold summaries answer detail lookups this way.
impl From<EntityRecord> for EntityDetails {
    fn from(record: EntityRecord) -> Self {
        EntityDetails {
            legal_address: record.address.map(|line| PostalAddress {
                address_lines: vec![line],
                country: record.country_code.clone(),
                ..PostalAddress::default()
            }),
            lei: record.lei,
            legal_name: record.legal_name,
            headquarters_address: None,
            registration_authority: None,
            legal_jurisdiction: record.jurisdiction,
            entity_category: None,
            entity_sub_category: None,
            entity_status: record.status,
            entity_creation_date: None,
            entity_expiration_date: None,
            last_update_date: record.last_update,
            next_renewal_date: None,
            managing_lou: record.managing_lou,
            validation_sources: None,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lei_format() {
        assert!(is_lei("5493001KJTIIGC8Y1R12"));
        assert!(is_lei(" 5493001kjtiigc8y1r12 "));
        assert!(!is_lei("5493001KJTIIGC8Y1R1"));
        assert!(!is_lei("5493001KJTIIGC8Y1R12X"));
        assert!(!is_lei("5493001KJTIIGC8Y1R1-"));
        assert_eq!(lei_key(" 5493001kjtiigc8y1r12"), "5493001KJTIIGC8Y1R12");
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(EntityStatus::parse("ACTIVE"), EntityStatus::Active);
        assert_eq!(EntityStatus::parse("issued"), EntityStatus::Active);
        assert_eq!(EntityStatus::parse("LAPSED"), EntityStatus::Lapsed);
        assert_eq!(EntityStatus::parse("MERGED"), EntityStatus::Retired);
        assert_eq!(EntityStatus::parse("PENDING_TRANSFER"), EntityStatus::Pending);
        assert_eq!(EntityStatus::parse("Active"), EntityStatus::Active);
        assert_eq!(EntityStatus::parse("whatever"), EntityStatus::Unknown);
        assert_eq!(EntityStatus::from(None), EntityStatus::Unknown);
    }

    #[test]
    fn test_status_serde() {
        let json = serde_json::to_string(&EntityStatus::Lapsed).unwrap();
        assert_eq!(json, "\"Lapsed\"");
        let back: EntityStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, EntityStatus::Lapsed);
        let null: EntityStatus = serde_json::from_str("null").unwrap();
        assert_eq!(null, EntityStatus::Unknown);
    }

    #[test]
    fn test_display_name_falls_back_to_lei() {
        let mut record = EntityRecord::new("5493001KJTIIGC8Y1R12", "Apple Inc.");
        assert_eq!(record.display_name(), "Apple Inc.");
        record.legal_name = Some("  ".to_string());
        assert_eq!(record.display_name(), "5493001KJTIIGC8Y1R12");
        assert!(!record.has_name());
    }

    #[test]
    fn test_country_hint_prefers_country_code() {
        let record = EntityRecord::new("5493001KJTIIGC8Y1R12", "Apple Inc.")
            .with_jurisdiction("US-CA")
            .with_country("IE");
        assert_eq!(record.country_hint(), Some("IE"));

        let record = EntityRecord::new("5493001KJTIIGC8Y1R12", "Apple Inc.").with_jurisdiction("US-CA");
        assert_eq!(record.country_hint(), Some("US-CA"));
    }

    #[test]
    fn test_record_deserializes_with_missing_fields() {
        let record: EntityRecord =
            serde_json::from_str(r#"{"lei":"5493001KJTIIGC8Y1R12","status":"ACTIVE"}"#).unwrap();
        assert_eq!(record.status, EntityStatus::Active);
        assert!(record.legal_name.is_none());
        assert!(record.last_update.is_none());
    }

    #[test]
    fn test_details_from_summary_record() {
        let mut record = EntityRecord::new("5493001KJTIIGC8Y1R12", "Bloomberg Finance L.P.")
            .with_jurisdiction("US-DE")
            .with_country("US")
            .with_status(EntityStatus::Active);
        record.address = Some("731 Lexington Avenue, New York, 10022, US".to_string());

        let details = EntityDetails::from(record);
        assert_eq!(details.legal_jurisdiction.as_deref(), Some("US-DE"));
        assert_eq!(details.entity_status, EntityStatus::Active);
        let address = details.legal_address.as_ref().expect("address carried over");
        assert_eq!(address.address_lines.len(), 1);
        assert_eq!(address.country.as_deref(), Some("US"));
        assert!(details.headquarters_address.is_none());
        assert!(details.registration_authority_id().is_none());
    }
}
