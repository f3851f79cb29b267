//! The storage seam shared by the Raw Listing Store and the Canonical Store.
//!
//! [`PipelineStore`] is implemented by [`crate::PgStore`] for production and by
//! [`crate::MemoryStore`] for tests. Both must honour the same contract:
//!
//! - staging is idempotent on `(source_id, external_id)` and only a checksum
//!   change reopens a listing to `pending`;
//! - a reconciliation commit writes the property, its cross-reference, its
//!   images and the raw listing checkpoint atomically.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rela_core::{
    CanonicalProperty, ExtractedFields, GeoPoint, NormalizedCandidate, PropertyType, RawListing,
};
use serde::Serialize;
use serde_json::Value as JsonValue;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct StageRequest {
    pub source_id: String,
    pub external_id: String,
    pub payload: JsonValue,
    pub fields: ExtractedFields,
    pub seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// First sighting; the row starts `pending`.
    Inserted,
    /// Same checksum as before; processing status untouched.
    Unchanged,
    /// Checksum differs; the row was reopened to `pending`.
    Changed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageOutcome {
    pub raw_listing_id: Uuid,
    pub status: StageStatus,
    pub checksum: String,
}

impl StageOutcome {
    pub(crate) fn classify(previous: Option<&str>, current: &str) -> StageStatus {
        match previous {
            None => StageStatus::Inserted,
            Some(prev) if prev == current => StageStatus::Unchanged,
            Some(_) => StageStatus::Changed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoHit {
    pub property_id: Uuid,
    pub distance_m: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AddressCandidate {
    pub property_id: Uuid,
    pub address: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyWrite {
    Insert { property_id: Uuid },
    Update { property_id: Uuid },
}

impl PropertyWrite {
    pub fn property_id(&self) -> Uuid {
        match self {
            Self::Insert { property_id } | Self::Update { property_id } => *property_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRecord {
    pub original_url: String,
    pub stored_url: String,
    pub position: i32,
}

/// Everything one reconciliation writes, committed in a single transaction.
#[derive(Debug, Clone)]
pub struct ReconcileWrite {
    pub raw_listing_id: Uuid,
    pub source_id: String,
    pub external_id: String,
    pub external_url: Option<String>,
    pub property: PropertyWrite,
    pub candidate: NormalizedCandidate,
    pub images: Vec<ImageRecord>,
    pub seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRecord {
    pub source_id: String,
    pub display_name: String,
    pub kind: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SourceStatusRow {
    pub source_id: String,
    pub pending: i64,
    pub processed: i64,
    pub error: i64,
    pub last_scrape_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub total_scraped: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreTotals {
    pub properties: i64,
    pub active: i64,
    pub geocoded: i64,
    pub images: i64,
    pub property_sources: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UngeocodedProperty {
    pub id: Uuid,
    pub address: String,
    pub city: Option<String>,
}

#[async_trait]
pub trait PipelineStore: Send + Sync {
    /// Registers a source, keeping its bookkeeping columns when it already exists.
    async fn upsert_source(&self, source: &SourceRecord) -> Result<()>;

    async fn stage_raw(&self, request: &StageRequest) -> Result<StageOutcome>;

    /// Pending listings, oldest `scraped_at` first.
    async fn pending_raw_listings(&self, source_id: Option<&str>, limit: usize) -> Result<Vec<RawListing>>;

    async fn raw_listing(&self, source_id: &str, external_id: &str) -> Result<Option<RawListing>>;

    /// Nearest property of `property_type` with `distance <= radius_m`.
    async fn nearest_property(
        &self,
        point: GeoPoint,
        property_type: PropertyType,
        radius_m: f64,
    ) -> Result<Option<GeoHit>>;

    /// Properties with an address in `city` (case-insensitive) of `property_type`.
    async fn address_candidates(
        &self,
        city: &str,
        property_type: PropertyType,
        limit: usize,
    ) -> Result<Vec<AddressCandidate>>;

    /// Returns the id of the written property.
    async fn commit_reconciliation(&self, write: &ReconcileWrite) -> Result<Uuid>;

    /// Marks the listing `error`, records the message and bumps its attempt count.
    async fn mark_raw_error(&self, raw_listing_id: Uuid, message: &str) -> Result<()>;

    /// Updates run bookkeeping for a source registered with [`Self::upsert_source`];
    /// an unknown source is an error.
    async fn record_source_run(&self, source_id: &str, scraped: u64, at: DateTime<Utc>) -> Result<()>;

    async fn property(&self, id: Uuid) -> Result<Option<CanonicalProperty>>;

    async fn properties_missing_location(&self, limit: usize) -> Result<Vec<UngeocodedProperty>>;

    async fn set_property_location(&self, id: Uuid, point: GeoPoint) -> Result<()>;

    /// Reopens `error` listings with fewer than `max_attempts` attempts. Returns the count.
    async fn requeue_errors(&self, source_id: Option<&str>, max_attempts: i32) -> Result<u64>;

    async fn source_status(&self) -> Result<Vec<SourceStatusRow>>;

    async fn totals(&self) -> Result<StoreTotals>;
}
