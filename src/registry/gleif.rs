// 🌐 GLEIF client - LeiRegistry over the public GLEIF JSON:API
//
// Responses are deserialized into strict structs right here at the
// boundary; list items that do not fit the schema are skipped, not trusted.
//
// Upstream allows ~60 requests/minute, so every call goes through a
// sliding-window limiter, and 429/5xx answers are retried with backoff.

use super::{LeiRegistry, RegistryError};
use crate::config::RegistryConfig;
use crate::entity::{
    is_lei, lei_key, EntityDetails, EntityRecord, EntityStatus, HierarchyShape, PostalAddress,
    RegistrationAuthority,
};
use async_trait::async_trait;
use chrono::NaiveDate;
use futures::stream::{self, StreamExt};
use regex::Regex;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

const RETRYABLE_STATUS: [u16; 5] = [429, 500, 502, 503, 504];

/// Records fetched in parallel when materializing search hits
const SEARCH_FETCH_CONCURRENCY: usize = 8;

/// Safety cap when paging through ultimate-children listings
const MAX_COUNT_PAGES: usize = 50;

fn embedded_lei() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[A-Z0-9]{20}").expect("static LEI pattern"))
}

// ============================================================================
// JSON:API DOCUMENTS
// ============================================================================

#[derive(Debug, Deserialize)]
struct Document<T> {
    data: Option<T>,
    #[serde(default)]
    links: Links,
    #[serde(default)]
    meta: Option<Meta>,
}

#[derive(Debug, Default, Deserialize)]
struct Links {
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Meta {
    pagination: Option<Pagination>,
}

#[derive(Debug, Deserialize)]
struct Pagination {
    total: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct LeiRecordData {
    id: Option<String>,
    #[serde(default)]
    attributes: RecordAttributes,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecordAttributes {
    lei: Option<String>,
    #[serde(default)]
    entity: EntityAttributes,
    #[serde(default)]
    registration: RegistrationAttributes,
    #[serde(alias = "managingLOU")]
    managing_lou: Option<String>,
    last_update_date: Option<String>,
    validation_sources: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntityAttributes {
    legal_name: Option<LegalName>,
    status: Option<String>,
    jurisdiction: Option<String>,
    legal_address: Option<Address>,
    headquarters_address: Option<Address>,
    registration_authority: Option<AuthorityAttributes>,
    category: Option<String>,
    sub_category: Option<String>,
    creation_date: Option<String>,
    expiration_date: Option<String>,
    expiration: Option<Expiration>,
}

#[derive(Debug, Default, Deserialize)]
struct AuthorityAttributes {
    #[serde(rename = "registrationAuthorityID")]
    authority_id: Option<String>,
    #[serde(rename = "registrationAuthorityEntityID")]
    entity_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Expiration {
    date: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LegalName {
    Named { name: Option<String> },
    Plain(String),
}

impl LegalName {
    fn into_name(self) -> Option<String> {
        match self {
            LegalName::Named { name } => name,
            LegalName::Plain(name) => Some(name),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Address {
    language: Option<String>,
    #[serde(default)]
    address_lines: Vec<String>,
    city: Option<String>,
    region: Option<String>,
    country: Option<String>,
    postal_code: Option<String>,
}

impl Address {
    fn flatten(&self) -> Option<String> {
        let locality: Vec<&str> = [&self.city, &self.region, &self.postal_code]
            .into_iter()
            .filter_map(|part| part.as_deref())
            .filter(|part| !part.trim().is_empty())
            .collect();
        let locality = locality.join(", ");

        let parts: Vec<&str> = self
            .address_lines
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(locality.as_str()))
            .chain(self.country.as_deref())
            .filter(|part| !part.trim().is_empty())
            .collect();

        if parts.is_empty() {
            None
        } else {
            Some(parts.join(", "))
        }
    }

    fn into_postal(self) -> Option<PostalAddress> {
        let address = PostalAddress {
            language: non_blank(self.language),
            address_lines: self
                .address_lines
                .into_iter()
                .map(|line| line.trim().to_string())
                .filter(|line| !line.is_empty())
                .collect(),
            city: non_blank(self.city),
            region: non_blank(self.region),
            country: non_blank(self.country).map(|c| c.to_uppercase()),
            postal_code: non_blank(self.postal_code),
        };
        (!address.is_empty()).then_some(address)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistrationAttributes {
    registration_status: Option<String>,
    last_update_date: Option<String>,
    next_renewal_date: Option<String>,
    corroboration_level: Option<String>,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_update_date(raw: &str) -> Option<NaiveDate> {
    let day = raw.get(..10)?;
    NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
}

impl LeiRecordData {
    fn into_record(self) -> Option<EntityRecord> {
        let attrs = self.attributes;
        let lei = non_blank(attrs.lei).or(non_blank(self.id))?;
        let entity = attrs.entity;

        let status = entity
            .status
            .as_deref()
            .or(attrs.registration.registration_status.as_deref())
            .map(EntityStatus::parse)
            .unwrap_or_default();

        let last_update = attrs
            .registration
            .last_update_date
            .as_deref()
            .or(attrs.last_update_date.as_deref())
            .and_then(parse_update_date);

        let country_code = entity
            .legal_address
            .as_ref()
            .and_then(|a| a.country.clone())
            .or_else(|| entity.headquarters_address.as_ref().and_then(|a| a.country.clone()))
            .or_else(|| entity.jurisdiction.clone());

        Some(EntityRecord {
            lei,
            legal_name: non_blank(entity.legal_name.and_then(LegalName::into_name)),
            jurisdiction: non_blank(entity.jurisdiction),
            country_code: non_blank(country_code).map(|c| c.to_uppercase()),
            status,
            last_update,
            managing_lou: non_blank(attrs.managing_lou),
            address: entity.legal_address.as_ref().and_then(Address::flatten),
        })
    }

    fn into_details(self) -> Option<EntityDetails> {
        let attrs = self.attributes;
        let lei = non_blank(attrs.lei).or(non_blank(self.id))?;
        let entity = attrs.entity;
        let registration = attrs.registration;

        let entity_status = entity
            .status
            .as_deref()
            .or(registration.registration_status.as_deref())
            .map(EntityStatus::parse)
            .unwrap_or_default();

        let registration_authority = entity.registration_authority.and_then(|ra| {
            let authority = RegistrationAuthority {
                authority_id: non_blank(ra.authority_id),
                entity_id: non_blank(ra.entity_id),
            };
            (authority.authority_id.is_some() || authority.entity_id.is_some()).then_some(authority)
        });

        let expiration = entity
            .expiration_date
            .or(entity.expiration.and_then(|e| e.date));

        Some(EntityDetails {
            lei,
            legal_name: non_blank(entity.legal_name.and_then(LegalName::into_name)),
            legal_address: entity.legal_address.and_then(Address::into_postal),
            headquarters_address: entity.headquarters_address.and_then(Address::into_postal),
            registration_authority,
            legal_jurisdiction: non_blank(entity.jurisdiction),
            entity_category: non_blank(entity.category),
            entity_sub_category: non_blank(entity.sub_category),
            entity_status,
            entity_creation_date: entity.creation_date.as_deref().and_then(parse_update_date),
            entity_expiration_date: expiration.as_deref().and_then(parse_update_date),
            last_update_date: registration
                .last_update_date
                .or(attrs.last_update_date)
                .as_deref()
                .and_then(parse_update_date),
            next_renewal_date: registration.next_renewal_date.as_deref().and_then(parse_update_date),
            managing_lou: non_blank(attrs.managing_lou),
            validation_sources: non_blank(attrs.validation_sources.or(registration.corroboration_level)),
        })
    }
}

/// Pull every well-formed record out of a list payload.
fn records_from_items(items: Vec<serde_json::Value>) -> Vec<EntityRecord> {
    items
        .into_iter()
        .filter_map(|item| match serde_json::from_value::<LeiRecordData>(item) {
            Ok(data) => data.into_record(),
            Err(e) => {
                debug!(error = %e, "Skipping malformed registry item");
                None
            }
        })
        .collect()
}

fn lei_from_item(item: &serde_json::Value) -> Option<String> {
    item.pointer("/attributes/lei")
        .or_else(|| item.get("id"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

/// An autocompletion hit either links the record or mentions the LEI in its text.
fn lei_from_completion(item: &serde_json::Value) -> Option<String> {
    if let Some(id) = item
        .pointer("/relationships/lei-records/data/id")
        .and_then(|v| v.as_str())
    {
        return Some(id.to_string());
    }

    let text = ["lei", "value", "label"]
        .iter()
        .find_map(|field| item.pointer(&format!("/attributes/{}", field)).and_then(|v| v.as_str()))?;
    embedded_lei()
        .find(&text.to_uppercase())
        .map(|m| m.as_str().to_string())
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?;
    let seconds: f64 = raw.trim().parse().ok()?;
    if seconds.is_finite() && seconds >= 0.0 {
        Some(Duration::from_secs_f64(seconds))
    } else {
        None
    }
}

// ============================================================================
// RATE LIMITER
// ============================================================================

/// Sliding-window limiter: at most `max_calls` starts per `period`.
pub struct RateLimiter {
    max_calls: usize,
    period: Duration,
    calls: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_calls: usize, period: Duration) -> Self {
        RateLimiter {
            max_calls: max_calls.max(1),
            period,
            calls: Mutex::new(VecDeque::new()),
        }
    }

    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut calls = self.calls.lock().await;
                let now = Instant::now();
                while let Some(&oldest) = calls.front() {
                    if now.duration_since(oldest) > self.period {
                        calls.pop_front();
                    } else {
                        break;
                    }
                }
                if calls.len() < self.max_calls {
                    calls.push_back(now);
                    return;
                }
                match calls.front() {
                    Some(&oldest) => self.period.saturating_sub(now.duration_since(oldest)),
                    None => Duration::ZERO,
                }
            };
            debug!(wait_ms = wait.as_millis() as u64, "Rate limit reached, waiting");
            // Sleep outside the lock
            sleep(wait.max(Duration::from_millis(10))).await;
        }
    }
}

// ============================================================================
// GLEIF CLIENT
// ============================================================================

pub struct GleifClient {
    http: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
    max_retries: usize,
    initial_backoff: Duration,
    max_backoff: Duration,
    search_limit: usize,
    page_size: usize,
    max_pages: usize,
    shape_max_nodes: usize,
    shape_concurrency: usize,
    limiter: RateLimiter,
}

impl GleifClient {
    pub fn new(config: &RegistryConfig) -> Self {
        GleifClient {
            http: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            max_retries: config.max_retries,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            search_limit: config.search_limit,
            page_size: config.page_size.max(1),
            max_pages: config.max_pages.max(1),
            shape_max_nodes: config.shape_max_nodes,
            shape_concurrency: config.shape_concurrency.max(1),
            limiter: RateLimiter::new(config.rate_limit_per_minute, Duration::from_secs(60)),
        }
    }

    fn record_url(&self, lei: &str) -> String {
        format!("{}/lei-records/{}", self.base_url, urlencoding::encode(lei.trim()))
    }

    /// GET with rate limiting and retries. `Ok(None)` means HTTP 404.
    async fn get(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<Option<reqwest::Response>, RegistryError> {
        let mut backoff = self.initial_backoff;

        for attempt in 0..=self.max_retries {
            self.limiter.acquire().await;

            let sent = self
                .http
                .get(url)
                .query(query)
                .timeout(self.request_timeout)
                .send()
                .await;

            let response = match sent {
                Ok(response) => response,
                Err(e) => {
                    if attempt >= self.max_retries {
                        warn!(url, attempts = attempt + 1, error = %e, "Registry request failed after max retries");
                        return Err(e.into());
                    }
                    warn!(url, attempt = attempt + 1, backoff_ms = backoff.as_millis() as u64, error = %e, "Registry request failed, retrying");
                    sleep(backoff).await;
                    backoff = (backoff * 2).min(self.max_backoff);
                    continue;
                }
            };

            let status = response.status();
            if status == StatusCode::NOT_FOUND {
                return Ok(None);
            }

            if RETRYABLE_STATUS.contains(&status.as_u16()) {
                if attempt >= self.max_retries {
                    warn!(url, status = status.as_u16(), "Registry kept failing, giving up");
                    return Err(RegistryError::Status(status.as_u16()));
                }
                let wait = retry_after(response.headers()).unwrap_or(backoff);
                warn!(url, status = status.as_u16(), wait_ms = wait.as_millis() as u64, "Registry busy, retrying");
                sleep(wait).await;
                backoff = (backoff * 2).min(self.max_backoff);
                continue;
            }

            if !status.is_success() {
                return Err(RegistryError::Status(status.as_u16()));
            }

            return Ok(Some(response));
        }

        Err(RegistryError::Unreachable(format!("retries exhausted for {}", url)))
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<Option<T>, RegistryError> {
        match self.get(url, query).await? {
            Some(response) => Ok(Some(response.json::<T>().await?)),
            None => Ok(None),
        }
    }

    /// Walk a paginated listing. Returns all items plus the advertised total, if any.
    async fn list_pages(
        &self,
        first_url: String,
        max_pages: usize,
    ) -> Result<(Vec<serde_json::Value>, Option<u64>), RegistryError> {
        let page_size = self.page_size.to_string();
        let mut url = first_url;
        let mut query: Vec<(&str, &str)> = vec![("page[size]", page_size.as_str())];
        let mut items = Vec::new();
        let mut total = None;

        for _ in 0..max_pages {
            let doc: Option<Document<Vec<serde_json::Value>>> = self.get_json(&url, &query).await?;
            let Some(doc) = doc else { break };

            if total.is_none() {
                total = doc.meta.and_then(|m| m.pagination).and_then(|p| p.total);
            }
            items.extend(doc.data.unwrap_or_default());

            match doc.links.next {
                Some(next) if next != url => {
                    url = next;
                    // The next link already carries the paging parameters
                    query.clear();
                }
                _ => break,
            }
        }

        Ok((items, total))
    }

    async fn direct_children_leis(&self, lei: &str) -> Result<Vec<String>, RegistryError> {
        let (items, _) = self
            .list_pages(format!("{}/direct-children", self.record_url(lei)), self.max_pages)
            .await?;
        Ok(items.iter().filter_map(lei_from_item).collect())
    }

    async fn count_listing(&self, url: String) -> Result<u64, RegistryError> {
        let (items, total) = self.list_pages(url, MAX_COUNT_PAGES).await?;
        Ok(total.unwrap_or(items.len() as u64))
    }

    pub async fn ultimate_children_count(&self, lei: &str) -> Result<u64, RegistryError> {
        self.count_listing(format!("{}/ultimate-children", self.record_url(lei)))
            .await
    }

    async fn ultimate_parent_lei(&self, lei: &str) -> Result<Option<String>, RegistryError> {
        let doc: Option<Document<LeiRecordData>> = self
            .get_json(&format!("{}/ultimate-parent", self.record_url(lei)), &[])
            .await?;
        Ok(doc
            .and_then(|d| d.data)
            .and_then(|data| non_blank(data.attributes.lei.clone()).or(non_blank(data.id))))
    }

    async fn autocomplete_leis(&self, query: &str) -> Result<Vec<String>, RegistryError> {
        let doc: Option<Document<Vec<serde_json::Value>>> = self
            .get_json(
                &format!("{}/autocompletions", self.base_url),
                &[("field", "fulltext"), ("q", query)],
            )
            .await?;

        let mut leis: Vec<String> = Vec::new();
        for item in doc.and_then(|d| d.data).unwrap_or_default() {
            if let Some(lei) = lei_from_completion(&item) {
                if !leis.iter().any(|l| l.eq_ignore_ascii_case(&lei)) {
                    leis.push(lei);
                }
            }
        }
        leis.truncate(self.search_limit);
        Ok(leis)
    }
}

#[async_trait]
impl LeiRegistry for GleifClient {
    async fn search_entities(&self, query: &str) -> Result<Vec<EntityRecord>, RegistryError> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        if is_lei(query) {
            return Ok(self.get_entity(query).await?.into_iter().collect());
        }

        let leis = self.autocomplete_leis(query).await?;
        debug!(query, hits = leis.len(), "Autocompletion resolved");

        let records: Vec<Option<EntityRecord>> = stream::iter(leis)
            .map(|lei| async move {
                match self.get_entity(&lei).await {
                    Ok(record) => record,
                    Err(e) => {
                        warn!(lei = %lei, error = %e, "Dropping search hit");
                        None
                    }
                }
            })
            .buffered(SEARCH_FETCH_CONCURRENCY)
            .collect()
            .await;

        Ok(records.into_iter().flatten().collect())
    }

    async fn get_entity(&self, lei: &str) -> Result<Option<EntityRecord>, RegistryError> {
        let doc: Option<Document<LeiRecordData>> = self.get_json(&self.record_url(lei), &[]).await?;
        Ok(doc.and_then(|d| d.data).and_then(LeiRecordData::into_record))
    }

    async fn get_entity_details(&self, lei: &str) -> Result<Option<EntityDetails>, RegistryError> {
        let doc: Option<Document<LeiRecordData>> = self.get_json(&self.record_url(lei), &[]).await?;
        Ok(doc.and_then(|d| d.data).and_then(LeiRecordData::into_details))
    }

    async fn get_ultimate_parent(&self, lei: &str) -> Result<Option<EntityRecord>, RegistryError> {
        // 404 on the relationship: the entity is its own ultimate parent
        let root = self
            .ultimate_parent_lei(lei)
            .await?
            .unwrap_or_else(|| lei.trim().to_string());
        self.get_entity(&root).await
    }

    async fn get_direct_children(&self, lei: &str) -> Result<Vec<EntityRecord>, RegistryError> {
        let (items, _) = self
            .list_pages(format!("{}/direct-children", self.record_url(lei)), self.max_pages)
            .await?;
        Ok(records_from_items(items))
    }

    async fn get_direct_children_count(&self, lei: &str) -> Result<u64, RegistryError> {
        self.count_listing(format!("{}/direct-children", self.record_url(lei)))
            .await
    }

    fn listing_cap(&self) -> Option<usize> {
        Some(self.page_size.saturating_mul(self.max_pages))
    }

    async fn get_hierarchy_shape(&self, lei: &str) -> Result<HierarchyShape, RegistryError> {
        let root_children = self.direct_children_leis(lei).await?;

        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(lei_key(lei));
        let mut frontier: Vec<String> = Vec::new();
        for child in &root_children {
            if visited.insert(lei_key(child)) {
                frontier.push(child.clone());
            }
        }

        let mut depth = 0;
        let semaphore = Arc::new(Semaphore::new(self.shape_concurrency));

        while !frontier.is_empty() && visited.len() < self.shape_max_nodes {
            depth += 1;
            let level: Vec<Vec<String>> = futures::future::join_all(frontier.iter().map(|child| {
                let semaphore = Arc::clone(&semaphore);
                async move {
                    let _permit = semaphore.acquire_owned().await.ok();
                    self.direct_children_leis(child).await.unwrap_or_else(|e| {
                        debug!(lei = %child, error = %e, "Shape walk skipped a node");
                        Vec::new()
                    })
                }
            }))
            .await;

            let mut next_level = Vec::new();
            'level: for ids in level {
                for id in ids {
                    if visited.insert(lei_key(&id)) {
                        next_level.push(id);
                        if visited.len() >= self.shape_max_nodes {
                            break 'level;
                        }
                    }
                }
            }
            frontier = next_level;
        }

        let ultimate_children_count = self.ultimate_children_count(lei).await?;
        Ok(HierarchyShape {
            max_depth: depth,
            direct_children_count: root_children.len() as u64,
            descendants_count: visited.len().saturating_sub(1) as u64,
            ultimate_children_count,
            visited_count: visited.len() as u64,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================
