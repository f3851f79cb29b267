//! Source client contracts, source implementations and per-source normalizers.

use std::sync::Arc;

use async_trait::async_trait;
use rela_core::{NormalizedCandidate, OperationType, PropertyType};
use rela_storage::FetchError;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub mod credentials;
pub mod mercadolibre;
pub mod normalize;
pub mod properati;
pub mod stream;

pub use credentials::{Credential, CredentialProvider, FileCredentialStore, OAuthClientConfig};
pub use mercadolibre::{MercadoLibreClient, MercadoLibreConfig};
pub use normalize::{normalize_address, quality_score, Normalizer, NormalizerRegistry};
pub use properati::{ProperatiConfig, ProperatiScraper};
pub use stream::{DetailFailurePolicy, ListingStream, StreamCounters};

pub const CRATE_NAME: &str = "rela-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Api,
    PublicHtml,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Api => "api",
            Self::PublicHtml => "public_html",
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("no credential available for {0}")]
    MissingCredential(String),
    #[error("credential refresh failed: {0}")]
    CredentialRefresh(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl AdapterError {
    /// Fatal errors abort the whole run; everything else is scoped to one item
    /// or one page.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::MissingCredential(_) | Self::CredentialRefresh(_))
    }
}

/// Explicit pagination state. Restarting a listing from a checkpoint is
/// just constructing a cursor with the saved offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageCursor {
    pub offset: u32,
    pub limit: u32,
}

impl PageCursor {
    pub fn new(offset: u32, limit: u32) -> Self {
        Self {
            offset,
            limit: limit.max(1),
        }
    }

    pub fn next(&self) -> Self {
        Self {
            offset: self.offset.saturating_add(self.limit),
            limit: self.limit,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListingSummary {
    pub external_id: String,
    pub url: Option<String>,
    /// Fields available from the listing page alone.
    pub raw: JsonValue,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListingPage {
    pub items: Vec<ListingSummary>,
    pub next: PageCursor,
    pub has_more: bool,
    pub total: Option<u64>,
    /// Entries on the page that could not be identified and were dropped.
    pub skipped: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetailRecord {
    pub external_id: String,
    pub url: Option<String>,
    pub payload: JsonValue,
    /// True when the detail call failed and `payload` only holds summary fields.
    pub partial: bool,
}

impl DetailRecord {
    pub fn from_summary(summary: ListingSummary) -> Self {
        Self {
            external_id: summary.external_id,
            url: summary.url,
            payload: summary.raw,
            partial: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClientStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub rate_limited: u64,
    pub credential_refreshes: u64,
}

/// Optional narrowing of what a source returns. Sources ignore filters they
/// cannot express.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchFilters {
    pub state: Option<String>,
    pub city: Option<String>,
    pub neighborhood: Option<String>,
    pub property_type: Option<PropertyType>,
    pub operation: Option<OperationType>,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    pub min_rooms: Option<u32>,
    pub min_bedrooms: Option<u32>,
}

impl SearchFilters {
    /// Fields set in `overrides` win.
    pub fn merged_with(&self, overrides: &SearchFilters) -> SearchFilters {
        SearchFilters {
            state: overrides.state.clone().or_else(|| self.state.clone()),
            city: overrides.city.clone().or_else(|| self.city.clone()),
            neighborhood: overrides.neighborhood.clone().or_else(|| self.neighborhood.clone()),
            property_type: overrides.property_type.or(self.property_type),
            operation: overrides.operation.or(self.operation),
            min_price: overrides.min_price.or(self.min_price),
            max_price: overrides.max_price.or(self.max_price),
            min_rooms: overrides.min_rooms.or(self.min_rooms),
            min_bedrooms: overrides.min_bedrooms.or(self.min_bedrooms),
        }
    }
}

#[async_trait]
pub trait SourceClient: Send + Sync {
    fn source_id(&self) -> &str;
    fn kind(&self) -> SourceKind;

    /// Cursor for the first page.
    fn first_page(&self) -> PageCursor;

    async fn fetch_page(&self, cursor: &PageCursor) -> Result<ListingPage, AdapterError>;

    async fn fetch_detail(&self, summary: &ListingSummary) -> Result<DetailRecord, AdapterError>;

    fn stats(&self) -> ClientStats;

    fn parse(&self, detail: &DetailRecord, normalizers: &NormalizerRegistry) -> NormalizedCandidate {
        normalizers.normalize(self.source_id(), &detail.payload)
    }
}

pub type SharedSourceClient = Arc<dyn SourceClient>;

pub(crate) fn json_path<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    if cur.is_null() {
        None
    } else {
        Some(cur)
    }
}

pub(crate) fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    json_path(value, path)?.as_str()
}

/// Numbers or numeric strings; anything else (including non-finite) is `None`.
pub(crate) fn json_f64(value: &JsonValue, path: &[&str]) -> Option<f64> {
    coerce_f64(json_path(value, path)?)
}

pub(crate) fn coerce_f64(value: &JsonValue) -> Option<f64> {
    let parsed = match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    parsed.is_finite().then_some(parsed)
}

pub(crate) fn text_or_none(value: impl AsRef<str>) -> Option<String> {
    let trimmed = value.as_ref().trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cursor_advances_by_limit() {
        let cursor = PageCursor::new(0, 50);
        assert_eq!(cursor.next(), PageCursor::new(50, 50));
        assert_eq!(PageCursor::new(10, 0).limit, 1);
    }

    #[test]
    fn numeric_coercion_is_strict() {
        let v = json!({"a": 12, "b": "3.5", "c": "n/a", "d": null, "e": true});
        assert_eq!(json_f64(&v, &["a"]), Some(12.0));
        assert_eq!(json_f64(&v, &["b"]), Some(3.5));
        assert_eq!(json_f64(&v, &["c"]), None);
        assert_eq!(json_f64(&v, &["d"]), None);
        assert_eq!(json_f64(&v, &["e"]), None);
        assert_eq!(json_f64(&v, &["missing"]), None);
    }

    #[test]
    fn filter_overrides_take_precedence() {
        let defaults = SearchFilters {
            state: Some("TUxBUENPUmRvYmE".into()),
            operation: Some(OperationType::Sale),
            ..Default::default()
        };
        let overrides = SearchFilters {
            operation: Some(OperationType::Rent),
            ..Default::default()
        };
        let merged = defaults.merged_with(&overrides);
        assert_eq!(merged.state.as_deref(), Some("TUxBUENPUmRvYmE"));
        assert_eq!(merged.operation, Some(OperationType::Rent));
    }

    #[test]
    fn only_credential_failures_are_fatal() {
        assert!(AdapterError::CredentialRefresh("denied".into()).is_fatal());
        assert!(AdapterError::MissingCredential("mercadolibre".into()).is_fatal());
        assert!(!AdapterError::Parse("bad html".into()).is_fatal());
    }
}
