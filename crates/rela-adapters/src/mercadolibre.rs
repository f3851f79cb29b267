//! Marketplace API client (MercadoLibre-shaped search + item endpoints).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rela_core::{OperationType, PropertyType};
use rela_storage::{HttpFetcher, HttpRequest};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::credentials::CredentialProvider;
use crate::{
    json_f64, json_str, AdapterError, ClientStats, DetailRecord, ListingPage, ListingSummary,
    PageCursor, SearchFilters, SourceClient, SourceKind,
};

pub const DEFAULT_BASE_URL: &str = "https://api.mercadolibre.com";
/// Real-estate root category on the Argentine site.
pub const REAL_ESTATE_CATEGORY: &str = "MLA1459";
pub const MAX_PAGE_SIZE: u32 = 50;
pub const MAX_OFFSET: u32 = 1000;

pub fn category_for(property_type: PropertyType) -> Option<&'static str> {
    match property_type {
        PropertyType::Apartment => Some("MLA1472"),
        PropertyType::House => Some("MLA1466"),
        PropertyType::Ph => Some("MLA1474"),
        PropertyType::Land => Some("MLA1468"),
        PropertyType::Commercial => Some("MLA50538"),
        PropertyType::Office | PropertyType::Other => None,
    }
}

pub fn property_type_for_category(category_id: &str) -> PropertyType {
    match category_id {
        "MLA1472" => PropertyType::Apartment,
        "MLA1466" => PropertyType::House,
        "MLA1474" => PropertyType::Ph,
        "MLA1468" => PropertyType::Land,
        "MLA50538" => PropertyType::Commercial,
        _ => PropertyType::Other,
    }
}

fn operation_code(operation: OperationType) -> Option<&'static str> {
    match operation {
        OperationType::Sale => Some("242073"),
        OperationType::Rent => Some("242074"),
        OperationType::TempRent => None,
    }
}

fn format_amount(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}

/// Query parameters for a search call, filters included.
pub fn search_query(filters: &SearchFilters, cursor: &PageCursor) -> Vec<(String, String)> {
    let mut params = vec![
        ("category".to_string(), REAL_ESTATE_CATEGORY.to_string()),
        ("limit".to_string(), cursor.limit.to_string()),
        ("offset".to_string(), cursor.offset.to_string()),
        ("sort".to_string(), "relevance".to_string()),
    ];
    let mut push = |key: &str, value: String| params.push((key.to_string(), value));

    if let Some(state) = &filters.state {
        push("state", state.clone());
    }
    if let Some(city) = &filters.city {
        push("city", city.clone());
    }
    if let Some(neighborhood) = &filters.neighborhood {
        push("neighborhood", neighborhood.clone());
    }
    if let Some(category) = filters.property_type.and_then(category_for) {
        push("property_type", category.to_string());
    }
    if let Some(code) = filters.operation.and_then(operation_code) {
        push("operation", code.to_string());
    }
    match (filters.min_price, filters.max_price) {
        (Some(min), Some(max)) => push("price", format!("{}-{}", format_amount(min), format_amount(max))),
        (Some(min), None) => push("price", format!("{}-*", format_amount(min))),
        (None, Some(max)) => push("price", format!("*-{}", format_amount(max))),
        (None, None) => {}
    }
    if let Some(rooms) = filters.min_rooms {
        push("rooms", format!("{rooms}-*"));
    }
    if let Some(bedrooms) = filters.min_bedrooms {
        push("bedrooms", format!("{bedrooms}-*"));
    }
    params
}

#[derive(Debug, Clone)]
pub struct MercadoLibreConfig {
    pub source_id: String,
    pub base_url: String,
    pub site_id: String,
    pub filters: SearchFilters,
    pub page_size: u32,
    pub max_offset: u32,
    pub fetch_description: bool,
}

impl Default for MercadoLibreConfig {
    fn default() -> Self {
        Self {
            source_id: "mercadolibre".to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            site_id: "MLA".to_string(),
            filters: SearchFilters::default(),
            page_size: MAX_PAGE_SIZE,
            max_offset: MAX_OFFSET,
            fetch_description: true,
        }
    }
}

pub struct MercadoLibreClient {
    config: MercadoLibreConfig,
    http: HttpFetcher,
    credentials: Arc<dyn CredentialProvider>,
    refreshes: AtomicU64,
}

impl MercadoLibreClient {
    pub fn new(config: MercadoLibreConfig, http: HttpFetcher, credentials: Arc<dyn CredentialProvider>) -> Self {
        Self {
            config,
            http,
            credentials,
            refreshes: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &MercadoLibreConfig {
        &self.config
    }

    /// One logical call: a 401 triggers exactly one refresh and one retry.
    async fn get_json(&self, request: HttpRequest) -> Result<JsonValue, AdapterError> {
        let credential = self.credentials.current().await?;
        let first = self
            .http
            .fetch(&request.clone().bearer(credential.access_token))
            .await;

        let response = match first {
            Ok(response) => response,
            Err(err) if err.is_unauthorized() => {
                warn!(source = %self.config.source_id, url = %request.url, "access token rejected; refreshing");
                let fresh = self.credentials.refresh().await?;
                self.refreshes.fetch_add(1, Ordering::Relaxed);
                self.http.fetch(&request.bearer(fresh.access_token)).await?
            }
            Err(err) => return Err(err.into()),
        };
        Ok(response.json::<JsonValue>()?)
    }

    fn api_request(&self, path: &str) -> HttpRequest {
        HttpRequest::get(format!("{}{}", self.config.base_url.trim_end_matches('/'), path))
            .header("Accept", "application/json")
    }
}

#[async_trait]
impl SourceClient for MercadoLibreClient {
    fn source_id(&self) -> &str {
        &self.config.source_id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Api
    }

    fn first_page(&self) -> PageCursor {
        PageCursor::new(0, self.config.page_size.clamp(1, MAX_PAGE_SIZE))
    }

    async fn fetch_page(&self, cursor: &PageCursor) -> Result<ListingPage, AdapterError> {
        let mut request = self.api_request(&format!("/sites/{}/search", self.config.site_id));
        request.query = search_query(&self.config.filters, cursor);
        let body = self.get_json(request).await?;

        let results = body
            .get("results")
            .and_then(JsonValue::as_array)
            .ok_or_else(|| AdapterError::Parse("search response without results".to_string()))?;
        let total = body
            .get("paging")
            .and_then(|p| p.get("total"))
            .and_then(JsonValue::as_u64)
            .unwrap_or(0);

        let mut skipped = 0;
        let items: Vec<ListingSummary> = results
            .iter()
            .filter_map(|item| {
                let Some(id) = json_str(item, &["id"]) else {
                    skipped += 1;
                    return None;
                };
                Some(ListingSummary {
                    external_id: id.to_string(),
                    url: json_str(item, &["permalink"]).map(ToString::to_string),
                    raw: item.clone(),
                })
            })
            .collect();

        let next = cursor.next();
        let page_full = results.len() as u32 == cursor.limit;
        let has_more =
            total > u64::from(next.offset) && page_full && next.offset < self.config.max_offset;
        debug!(offset = cursor.offset, total, returned = results.len(), has_more, "search page");

        Ok(ListingPage {
            items,
            next,
            has_more,
            total: Some(total),
            skipped,
        })
    }

    async fn fetch_detail(&self, summary: &ListingSummary) -> Result<DetailRecord, AdapterError> {
        let id = &summary.external_id;
        let mut item = self.get_json(self.api_request(&format!("/items/{id}"))).await?;

        if self.config.fetch_description {
            match self.get_json(self.api_request(&format!("/items/{id}/description"))).await {
                Ok(description) => {
                    let text = json_str(&description, &["plain_text"])
                        .filter(|t| !t.trim().is_empty())
                        .or_else(|| json_str(&description, &["text"]));
                    if let (Some(text), Some(obj)) = (text, item.as_object_mut()) {
                        obj.insert("full_description".to_string(), JsonValue::String(text.to_string()));
                    }
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => debug!(external_id = %id, error = %err, "no description available"),
            }
        }

        let url = json_str(&item, &["permalink"])
            .map(ToString::to_string)
            .or_else(|| summary.url.clone());
        Ok(DetailRecord {
            external_id: id.clone(),
            url,
            payload: item,
            partial: false,
        })
    }

    fn stats(&self) -> ClientStats {
        let http = self.http.stats();
        ClientStats {
            total_requests: http.total_requests,
            successful_requests: http.successful_requests,
            failed_requests: http.failed_requests,
            rate_limited: http.rate_limited,
            credential_refreshes: self.refreshes.load(Ordering::Relaxed),
        }
    }
}

/// Attribute value by id: `value_struct.number`, else the parsed leading number
/// of `value_name`.
pub fn attribute_number(item: &JsonValue, attribute_id: &str) -> Option<f64> {
    let attribute = attribute(item, attribute_id)?;
    json_f64(attribute, &["value_struct", "number"]).or_else(|| {
        let name = json_str(attribute, &["value_name"])?;
        leading_number(name)
    })
}

pub fn attribute_text<'a>(item: &'a JsonValue, attribute_id: &str) -> Option<&'a str> {
    json_str(attribute(item, attribute_id)?, &["value_name"])
}

fn attribute<'a>(item: &'a JsonValue, attribute_id: &str) -> Option<&'a JsonValue> {
    item.get("attributes")?
        .as_array()?
        .iter()
        .find(|a| a.get("id").and_then(JsonValue::as_str) == Some(attribute_id))
}

/// `"54 m²"` → 54.0, `"2"` → 2.0, `"n/a"` → None.
fn leading_number(text: &str) -> Option<f64> {
    let trimmed = text.trim_start();
    let end = trimmed
        .char_indices()
        .find(|(i, c)| !(c.is_ascii_digit() || (*c == '.' && *i > 0) || (*c == '-' && *i == 0)))
        .map(|(i, _)| i)
        .unwrap_or(trimmed.len());
    trimmed[..end].parse::<f64>().ok().filter(|n| n.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::Credential;
    use rela_storage::http::testing::{instant_config, respond, respond_json, ScriptedTransport};
    use serde_json::json;
    use std::path::{Path, PathBuf};
    use tokio::sync::Mutex;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
    }

    fn fixture(name: &str) -> JsonValue {
        let path = workspace_root().join("fixtures/mercadolibre").join(name);
        let text = std::fs::read_to_string(&path).unwrap();
        serde_json::from_str(&text).unwrap()
    }

    struct CountingCredentials {
        token: Mutex<String>,
        refreshes: AtomicU64,
        fail_refresh: bool,
    }

    impl CountingCredentials {
        fn new(fail_refresh: bool) -> Self {
            Self {
                token: Mutex::new("stale".into()),
                refreshes: AtomicU64::new(0),
                fail_refresh,
            }
        }
    }

    #[async_trait]
    impl CredentialProvider for CountingCredentials {
        async fn current(&self) -> Result<Credential, AdapterError> {
            Ok(Credential {
                access_token: self.token.lock().await.clone(),
                refresh_token: Some("r".into()),
                expires_at: None,
            })
        }

        async fn refresh(&self) -> Result<Credential, AdapterError> {
            self.refreshes.fetch_add(1, Ordering::Relaxed);
            if self.fail_refresh {
                return Err(AdapterError::CredentialRefresh("invalid_grant".into()));
            }
            *self.token.lock().await = "fresh".into();
            self.current().await
        }
    }

    fn client(
        transport: Arc<ScriptedTransport>,
        credentials: Arc<CountingCredentials>,
        fetch_description: bool,
    ) -> MercadoLibreClient {
        let config = MercadoLibreConfig {
            base_url: "https://api.test".into(),
            fetch_description,
            ..Default::default()
        };
        MercadoLibreClient::new(
            config,
            HttpFetcher::with_transport("mercadolibre", transport, &instant_config()),
            credentials,
        )
    }

    #[test]
    fn search_query_encodes_filters() {
        let filters = SearchFilters {
            state: Some("TUxBUENPUmRvYmE".into()),
            property_type: Some(PropertyType::Apartment),
            operation: Some(OperationType::Rent),
            min_price: Some(50_000.0),
            max_price: Some(120_000.0),
            min_rooms: Some(2),
            ..Default::default()
        };
        let params = search_query(&filters, &PageCursor::new(100, 50));
        let get = |k: &str| params.iter().find(|(key, _)| key == k).map(|(_, v)| v.as_str());

        assert_eq!(get("category"), Some("MLA1459"));
        assert_eq!(get("offset"), Some("100"));
        assert_eq!(get("state"), Some("TUxBUENPUmRvYmE"));
        assert_eq!(get("property_type"), Some("MLA1472"));
        assert_eq!(get("operation"), Some("242074"));
        assert_eq!(get("price"), Some("50000-120000"));
        assert_eq!(get("rooms"), Some("2-*"));
        assert_eq!(get("bedrooms"), None);

        let only_max = SearchFilters {
            max_price: Some(90_000.0),
            ..Default::default()
        };
        let params = search_query(&only_max, &PageCursor::new(0, 50));
        assert!(params.contains(&("price".to_string(), "*-90000".to_string())));
    }

    #[tokio::test]
    async fn search_page_reports_has_more_from_paging() {
        let transport = Arc::new(ScriptedTransport::new([respond_json(200, &fixture("search_page.json"))]));
        let ml = client(transport.clone(), Arc::new(CountingCredentials::new(false)), false);

        let page = ml.fetch_page(&PageCursor::new(0, 2)).await.unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0].external_id, "MLA1100000001");
        assert!(page.has_more);
        assert_eq!(page.next, PageCursor::new(2, 2));
        assert_eq!(transport.requests()[0].bearer.as_deref(), Some("stale"));
    }

    #[tokio::test]
    async fn short_page_or_offset_ceiling_ends_pagination() {
        let body = fixture("search_page.json");
        let transport = Arc::new(ScriptedTransport::new([
            respond_json(200, &body),
            respond_json(200, &body),
        ]));
        let ml = client(transport, Arc::new(CountingCredentials::new(false)), false);

        let short = ml.fetch_page(&PageCursor::new(0, 3)).await.unwrap();
        assert!(!short.has_more);

        let near_ceiling = ml.fetch_page(&PageCursor::new(998, 2)).await.unwrap();
        assert!(!near_ceiling.has_more);
    }

    #[tokio::test]
    async fn unauthorized_refreshes_once_and_retries() {
        let transport = Arc::new(ScriptedTransport::new([
            respond(401, ""),
            respond_json(200, &fixture("item_MLA1100000001.json")),
        ]));
        let credentials = Arc::new(CountingCredentials::new(false));
        let ml = client(transport.clone(), credentials.clone(), false);

        let summary = ListingSummary {
            external_id: "MLA1100000001".into(),
            url: None,
            raw: json!({"id": "MLA1100000001"}),
        };
        let detail = ml.fetch_detail(&summary).await.unwrap();
        assert_eq!(detail.payload["id"], json!("MLA1100000001"));
        assert!(!detail.partial);

        let sent = transport.requests();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].bearer.as_deref(), Some("fresh"));
        assert_eq!(credentials.refreshes.load(Ordering::Relaxed), 1);
        assert_eq!(ml.stats().credential_refreshes, 1);
    }

    #[tokio::test]
    async fn second_unauthorized_is_not_refreshed_again() {
        let transport = Arc::new(ScriptedTransport::new([respond(401, ""), respond(401, "")]));
        let credentials = Arc::new(CountingCredentials::new(false));
        let ml = client(transport, credentials.clone(), false);

        let err = ml.fetch_page(&PageCursor::new(0, 50)).await.unwrap_err();
        assert!(!err.is_fatal());
        assert_eq!(credentials.refreshes.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn failed_refresh_surfaces_as_fatal() {
        let transport = Arc::new(ScriptedTransport::new([respond(401, "")]));
        let ml = client(transport, Arc::new(CountingCredentials::new(true)), false);

        let err = ml.fetch_page(&PageCursor::new(0, 50)).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn detail_merges_description_and_tolerates_its_absence() {
        let transport = Arc::new(ScriptedTransport::new([
            respond_json(200, &fixture("item_MLA1100000001.json")),
            respond_json(200, &json!({"plain_text": "Luminoso, balcón al frente."})),
            respond_json(200, &fixture("item_MLA1100000001.json")),
            respond(404, ""),
        ]));
        let ml = client(transport, Arc::new(CountingCredentials::new(false)), true);
        let summary = ListingSummary {
            external_id: "MLA1100000001".into(),
            url: None,
            raw: json!({}),
        };

        let with_text = ml.fetch_detail(&summary).await.unwrap();
        assert_eq!(with_text.payload["full_description"], json!("Luminoso, balcón al frente."));

        let without = ml.fetch_detail(&summary).await.unwrap();
        assert!(without.payload.get("full_description").is_none());
        assert_eq!(ml.stats().failed_requests, 1);
    }

    #[test]
    fn attributes_prefer_struct_number_then_value_name() {
        let item = json!({"attributes": [
            {"id": "TOTAL_AREA", "value_name": "54 m²", "value_struct": {"number": 54.0, "unit": "m²"}},
            {"id": "ROOMS", "value_name": "2"},
            {"id": "BEDROOMS", "value_name": "sin dato"},
            {"id": "OPERATION", "value_name": "Alquiler"}
        ]});
        assert_eq!(attribute_number(&item, "TOTAL_AREA"), Some(54.0));
        assert_eq!(attribute_number(&item, "ROOMS"), Some(2.0));
        assert_eq!(attribute_number(&item, "BEDROOMS"), None);
        assert_eq!(attribute_number(&item, "PARKING_LOTS"), None);
        assert_eq!(attribute_text(&item, "OPERATION"), Some("Alquiler"));
    }
}
