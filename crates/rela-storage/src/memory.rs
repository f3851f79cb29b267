//! In-memory [`PipelineStore`] for tests and dry runs.
//!
//! All tables sit behind one `Mutex`, so a reconciliation commit is atomic the
//! same way the Postgres transaction is. Geo lookups are a linear haversine scan.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rela_core::{
    CanonicalProperty, GeoPoint, ProcessingStatus, PropertyImage, PropertySource, PropertyStatus,
    PropertyType, RawListing,
};
use uuid::Uuid;

use crate::payload_checksum;
use crate::store::{
    AddressCandidate, GeoHit, PipelineStore, PropertyWrite, ReconcileWrite, SourceRecord,
    SourceStatusRow, StageOutcome, StageRequest, StoreTotals, UngeocodedProperty,
};

#[derive(Debug, Clone)]
struct SourceEntry {
    record: SourceRecord,
    last_scrape_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
    total_scraped: i64,
}

#[derive(Debug, Default)]
struct Tables {
    sources: BTreeMap<String, SourceEntry>,
    raw: Vec<RawListing>,
    raw_index: HashMap<(String, String), usize>,
    properties: HashMap<Uuid, CanonicalProperty>,
    property_sources: Vec<PropertySource>,
    images: Vec<PropertyImage>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| anyhow!("memory store mutex poisoned"))
    }

    pub fn properties_snapshot(&self) -> Result<Vec<CanonicalProperty>> {
        let tables = self.lock()?;
        let mut rows: Vec<_> = tables.properties.values().cloned().collect();
        rows.sort_by_key(|p| p.first_seen_at);
        Ok(rows)
    }

    pub fn sources_for(&self, property_id: Uuid) -> Result<Vec<PropertySource>> {
        let tables = self.lock()?;
        Ok(tables
            .property_sources
            .iter()
            .filter(|ps| ps.property_id == property_id)
            .cloned()
            .collect())
    }

    pub fn images_for(&self, property_id: Uuid) -> Result<Vec<PropertyImage>> {
        let tables = self.lock()?;
        let mut rows: Vec<_> = tables
            .images
            .iter()
            .filter(|img| img.property_id == property_id)
            .cloned()
            .collect();
        rows.sort_by_key(|img| img.position);
        Ok(rows)
    }

    pub fn raw_listings(&self) -> Result<Vec<RawListing>> {
        Ok(self.lock()?.raw.clone())
    }

    /// Inserts a property directly, bypassing reconciliation. Used to seed
    /// fixtures for matching tests.
    pub fn seed_property(&self, property: CanonicalProperty) -> Result<()> {
        self.lock()?.properties.insert(property.id, property);
        Ok(())
    }
}

#[async_trait]
impl PipelineStore for MemoryStore {
    async fn upsert_source(&self, source: &SourceRecord) -> Result<()> {
        let mut tables = self.lock()?;
        tables
            .sources
            .entry(source.source_id.clone())
            .and_modify(|entry| entry.record = source.clone())
            .or_insert_with(|| SourceEntry {
                record: source.clone(),
                last_scrape_at: None,
                last_success_at: None,
                total_scraped: 0,
            });
        Ok(())
    }

    async fn stage_raw(&self, request: &StageRequest) -> Result<StageOutcome> {
        let checksum = payload_checksum(&request.payload);
        let mut tables = self.lock()?;
        let key = (request.source_id.clone(), request.external_id.clone());

        if let Some(&idx) = tables.raw_index.get(&key) {
            let row = &mut tables.raw[idx];
            let status = StageOutcome::classify(Some(&row.checksum), &checksum);
            if row.checksum != checksum {
                row.processing_status = ProcessingStatus::Pending;
                row.error_message = None;
            }
            row.payload = request.payload.clone();
            row.checksum = checksum.clone();
            row.fields = request.fields.clone();
            row.last_seen_at = request.seen_at;
            row.times_seen += 1;
            return Ok(StageOutcome {
                raw_listing_id: row.id,
                status,
                checksum,
            });
        }

        let row = RawListing {
            id: Uuid::new_v4(),
            source_id: request.source_id.clone(),
            external_id: request.external_id.clone(),
            payload: request.payload.clone(),
            checksum: checksum.clone(),
            fields: request.fields.clone(),
            scraped_at: request.seen_at,
            last_seen_at: request.seen_at,
            times_seen: 1,
            processing_status: ProcessingStatus::Pending,
            processing_attempts: 0,
            error_message: None,
            processed_at: None,
            property_id: None,
        };
        let id = row.id;
        let idx = tables.raw.len();
        tables.raw.push(row);
        tables.raw_index.insert(key, idx);
        Ok(StageOutcome {
            raw_listing_id: id,
            status: StageOutcome::classify(None, &checksum),
            checksum,
        })
    }

    async fn pending_raw_listings(&self, source_id: Option<&str>, limit: usize) -> Result<Vec<RawListing>> {
        let tables = self.lock()?;
        let mut rows: Vec<RawListing> = tables
            .raw
            .iter()
            .filter(|r| r.processing_status == ProcessingStatus::Pending)
            .filter(|r| source_id.map_or(true, |s| r.source_id == s))
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.scraped_at);
        rows.truncate(limit);
        Ok(rows)
    }

    async fn raw_listing(&self, source_id: &str, external_id: &str) -> Result<Option<RawListing>> {
        let tables = self.lock()?;
        let key = (source_id.to_string(), external_id.to_string());
        Ok(tables.raw_index.get(&key).map(|&idx| tables.raw[idx].clone()))
    }

    async fn nearest_property(
        &self,
        point: GeoPoint,
        property_type: PropertyType,
        radius_m: f64,
    ) -> Result<Option<GeoHit>> {
        let tables = self.lock()?;
        let hit = tables
            .properties
            .values()
            .filter(|p| p.property_type == property_type)
            .filter_map(|p| {
                let location = p.location?;
                Some(GeoHit {
                    property_id: p.id,
                    distance_m: location.distance_m(&point),
                })
            })
            .filter(|hit| hit.distance_m <= radius_m)
            .min_by(|a, b| a.distance_m.total_cmp(&b.distance_m));
        Ok(hit)
    }

    async fn address_candidates(
        &self,
        city: &str,
        property_type: PropertyType,
        limit: usize,
    ) -> Result<Vec<AddressCandidate>> {
        let tables = self.lock()?;
        let city = city.to_lowercase();
        let mut rows: Vec<(DateTime<Utc>, AddressCandidate)> = tables
            .properties
            .values()
            .filter(|p| p.property_type == property_type)
            .filter(|p| p.city.as_deref().is_some_and(|c| c.to_lowercase() == city))
            .filter_map(|p| {
                let address = p.address.as_ref().filter(|a| !a.trim().is_empty())?;
                Some((
                    p.last_seen_at,
                    AddressCandidate {
                        property_id: p.id,
                        address: address.clone(),
                    },
                ))
            })
            .collect();
        rows.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(rows.into_iter().take(limit).map(|(_, c)| c).collect())
    }

    async fn commit_reconciliation(&self, write: &ReconcileWrite) -> Result<Uuid> {
        let mut tables = self.lock()?;
        let raw_idx = tables
            .raw
            .iter()
            .position(|r| r.id == write.raw_listing_id)
            .ok_or_else(|| anyhow!("raw listing {} not found", write.raw_listing_id))?;

        let property_id = match write.property {
            PropertyWrite::Insert { property_id } => {
                let property = CanonicalProperty::from_candidate(property_id, &write.candidate, write.seen_at);
                tables.properties.insert(property_id, property);
                property_id
            }
            PropertyWrite::Update { property_id } => {
                let Some(existing) = tables.properties.get_mut(&property_id) else {
                    bail!("property {property_id} vanished before update");
                };
                existing.apply_sighting(&write.candidate, write.seen_at);
                property_id
            }
        };

        let link_idx = tables.property_sources.iter().position(|ps| {
            ps.property_id == property_id
                && ps.source_id == write.source_id
                && ps.external_id == write.external_id
        });
        match link_idx {
            Some(idx) => {
                let link = &mut tables.property_sources[idx];
                if write.external_url.is_some() {
                    link.external_url = write.external_url.clone();
                }
                link.last_seen_at = write.seen_at;
                link.times_seen += 1;
            }
            None => tables.property_sources.push(PropertySource {
                property_id,
                source_id: write.source_id.clone(),
                external_id: write.external_id.clone(),
                external_url: write.external_url.clone(),
                first_seen_at: write.seen_at,
                last_seen_at: write.seen_at,
                times_seen: 1,
            }),
        }

        for image in &write.images {
            let exists = tables
                .images
                .iter()
                .any(|img| img.property_id == property_id && img.original_url == image.original_url);
            if !exists {
                tables.images.push(PropertyImage {
                    property_id,
                    original_url: image.original_url.clone(),
                    stored_url: image.stored_url.clone(),
                    position: image.position,
                });
            }
        }

        let raw = &mut tables.raw[raw_idx];
        raw.processing_status = ProcessingStatus::Processed;
        raw.processed_at = Some(write.seen_at);
        raw.property_id = Some(property_id);
        raw.error_message = None;
        Ok(property_id)
    }

    async fn mark_raw_error(&self, raw_listing_id: Uuid, message: &str) -> Result<()> {
        let mut tables = self.lock()?;
        let raw = tables
            .raw
            .iter_mut()
            .find(|r| r.id == raw_listing_id)
            .ok_or_else(|| anyhow!("raw listing {raw_listing_id} not found"))?;
        raw.processing_status = ProcessingStatus::Error;
        raw.processing_attempts += 1;
        raw.error_message = Some(message.to_string());
        Ok(())
    }

    async fn record_source_run(&self, source_id: &str, scraped: u64, at: DateTime<Utc>) -> Result<()> {
        let mut tables = self.lock()?;
        let entry = tables
            .sources
            .get_mut(source_id)
            .ok_or_else(|| anyhow!("source {source_id} is not registered"))?;
        entry.last_scrape_at = Some(at);
        entry.last_success_at = Some(at);
        entry.total_scraped += scraped as i64;
        Ok(())
    }

    async fn property(&self, id: Uuid) -> Result<Option<CanonicalProperty>> {
        Ok(self.lock()?.properties.get(&id).cloned())
    }

    async fn properties_missing_location(&self, limit: usize) -> Result<Vec<UngeocodedProperty>> {
        let tables = self.lock()?;
        let mut rows: Vec<&CanonicalProperty> = tables
            .properties
            .values()
            .filter(|p| p.location.is_none() && p.status == PropertyStatus::Active)
            .filter(|p| p.address.as_deref().is_some_and(|a| !a.trim().is_empty()))
            .collect();
        rows.sort_by_key(|p| p.first_seen_at);
        Ok(rows
            .into_iter()
            .take(limit)
            .map(|p| UngeocodedProperty {
                id: p.id,
                address: p.address.clone().unwrap_or_default(),
                city: p.city.clone(),
            })
            .collect())
    }

    async fn set_property_location(&self, id: Uuid, point: GeoPoint) -> Result<()> {
        let mut tables = self.lock()?;
        let property = tables
            .properties
            .get_mut(&id)
            .ok_or_else(|| anyhow!("property {id} not found"))?;
        property.location = Some(point);
        property.last_updated_at = Utc::now();
        Ok(())
    }

    async fn requeue_errors(&self, source_id: Option<&str>, max_attempts: i32) -> Result<u64> {
        let mut tables = self.lock()?;
        let mut count = 0;
        for raw in tables.raw.iter_mut().filter(|r| {
            r.processing_status == ProcessingStatus::Error
                && r.processing_attempts < max_attempts
                && source_id.map_or(true, |s| r.source_id == s)
        }) {
            raw.processing_status = ProcessingStatus::Pending;
            count += 1;
        }
        Ok(count)
    }

    async fn source_status(&self) -> Result<Vec<SourceStatusRow>> {
        let tables = self.lock()?;
        let mut rows: BTreeMap<String, SourceStatusRow> = tables
            .sources
            .values()
            .map(|entry| {
                (
                    entry.record.source_id.clone(),
                    SourceStatusRow {
                        source_id: entry.record.source_id.clone(),
                        last_scrape_at: entry.last_scrape_at,
                        last_success_at: entry.last_success_at,
                        total_scraped: entry.total_scraped,
                        ..Default::default()
                    },
                )
            })
            .collect();
        for raw in &tables.raw {
            let row = rows.entry(raw.source_id.clone()).or_insert_with(|| SourceStatusRow {
                source_id: raw.source_id.clone(),
                ..Default::default()
            });
            match raw.processing_status {
                ProcessingStatus::Pending => row.pending += 1,
                ProcessingStatus::Processed => row.processed += 1,
                ProcessingStatus::Error => row.error += 1,
            }
        }
        Ok(rows.into_values().collect())
    }

    async fn totals(&self) -> Result<StoreTotals> {
        let tables = self.lock()?;
        Ok(StoreTotals {
            properties: tables.properties.len() as i64,
            active: tables
                .properties
                .values()
                .filter(|p| p.status == PropertyStatus::Active)
                .count() as i64,
            geocoded: tables.properties.values().filter(|p| p.location.is_some()).count() as i64,
            images: tables.images.len() as i64,
            property_sources: tables.property_sources.len() as i64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ImageRecord, StageStatus};
    use rela_core::{Currency, ExtractedFields, NormalizedCandidate};
    use serde_json::json;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn stage(external_id: &str, payload: serde_json::Value, seen_at: DateTime<Utc>) -> StageRequest {
        StageRequest {
            source_id: "mercadolibre".into(),
            external_id: external_id.into(),
            payload,
            fields: ExtractedFields::default(),
            seen_at,
        }
    }

    fn candidate(address: &str) -> NormalizedCandidate {
        let mut c = NormalizedCandidate::empty("mercadolibre");
        c.title = Some("Depto 2 amb".into());
        c.price = Some(50_000.0);
        c.currency = Some(Currency::Usd);
        c.price_usd = Some(50_000.0);
        c.property_type = PropertyType::Apartment;
        c.city = Some("Palermo".into());
        c.address = Some(address.into());
        c
    }

    #[tokio::test]
    async fn restaging_only_reopens_on_checksum_change() {
        let store = MemoryStore::new();
        let t0 = ts("2026-02-24T12:00:00Z");
        let first = store.stage_raw(&stage("ML1", json!({"price": 1}), t0)).await.unwrap();
        assert_eq!(first.status, StageStatus::Inserted);

        let write = ReconcileWrite {
            raw_listing_id: first.raw_listing_id,
            source_id: "mercadolibre".into(),
            external_id: "ML1".into(),
            external_url: None,
            property: PropertyWrite::Insert {
                property_id: Uuid::new_v4(),
            },
            candidate: candidate("avenida santa fe 1234"),
            images: vec![],
            seen_at: t0,
        };
        store.commit_reconciliation(&write).await.unwrap();

        let again = store.stage_raw(&stage("ML1", json!({"price": 1}), t0)).await.unwrap();
        assert_eq!(again.status, StageStatus::Unchanged);
        assert_eq!(again.raw_listing_id, first.raw_listing_id);
        let raw = store.raw_listing("mercadolibre", "ML1").await.unwrap().unwrap();
        assert_eq!(raw.processing_status, ProcessingStatus::Processed);
        assert_eq!(raw.times_seen, 2);

        let changed = store.stage_raw(&stage("ML1", json!({"price": 2}), t0)).await.unwrap();
        assert_eq!(changed.status, StageStatus::Changed);
        let raw = store.raw_listing("mercadolibre", "ML1").await.unwrap().unwrap();
        assert_eq!(raw.processing_status, ProcessingStatus::Pending);
        assert_eq!(raw.times_seen, 3);
    }

    #[tokio::test]
    async fn run_bookkeeping_needs_a_registered_source() {
        let store = MemoryStore::new();
        let t0 = ts("2026-02-24T12:00:00Z");
        let err = store.record_source_run("properati", 3, t0).await.unwrap_err();
        assert!(err.to_string().contains("not registered"));
        assert!(store.source_status().await.unwrap().is_empty());

        store
            .upsert_source(&SourceRecord {
                source_id: "properati".into(),
                display_name: "Properati".into(),
                kind: "public_html".into(),
            })
            .await
            .unwrap();
        store.record_source_run("properati", 3, t0).await.unwrap();
        store.record_source_run("properati", 2, t0).await.unwrap();
        let status = store.source_status().await.unwrap();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].total_scraped, 5);
        assert_eq!(status[0].last_success_at, Some(t0));
    }

    #[tokio::test]
    async fn pending_listings_drain_oldest_first() {
        let store = MemoryStore::new();
        store.stage_raw(&stage("B", json!({}), ts("2026-02-24T12:05:00Z"))).await.unwrap();
        store.stage_raw(&stage("A", json!({}), ts("2026-02-24T12:00:00Z"))).await.unwrap();
        store.stage_raw(&stage("C", json!({}), ts("2026-02-24T12:10:00Z"))).await.unwrap();

        let pending = store.pending_raw_listings(None, 2).await.unwrap();
        let ids: Vec<_> = pending.iter().map(|r| r.external_id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn images_are_not_duplicated_on_reprocessing() {
        let store = MemoryStore::new();
        let t0 = ts("2026-02-24T12:00:00Z");
        let staged = store.stage_raw(&stage("ML1", json!({}), t0)).await.unwrap();
        let property_id = Uuid::new_v4();
        let images = vec![ImageRecord {
            original_url: "https://img.test/1.jpg".into(),
            stored_url: "https://img.test/1.jpg".into(),
            position: 0,
        }];
        let mut write = ReconcileWrite {
            raw_listing_id: staged.raw_listing_id,
            source_id: "mercadolibre".into(),
            external_id: "ML1".into(),
            external_url: Some("https://listing.test/ML1".into()),
            property: PropertyWrite::Insert { property_id },
            candidate: candidate("avenida santa fe 1234"),
            images,
            seen_at: t0,
        };
        store.commit_reconciliation(&write).await.unwrap();
        write.property = PropertyWrite::Update { property_id };
        store.commit_reconciliation(&write).await.unwrap();

        assert_eq!(store.images_for(property_id).unwrap().len(), 1);
        let links = store.sources_for(property_id).unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].times_seen, 2);
        assert_eq!(store.property(property_id).await.unwrap().unwrap().times_seen, 2);
    }

    #[tokio::test]
    async fn requeue_respects_attempt_ceiling() {
        let store = MemoryStore::new();
        let t0 = ts("2026-02-24T12:00:00Z");
        let a = store.stage_raw(&stage("A", json!({}), t0)).await.unwrap();
        let b = store.stage_raw(&stage("B", json!({}), t0)).await.unwrap();
        store.mark_raw_error(a.raw_listing_id, "boom").await.unwrap();
        for _ in 0..3 {
            store.mark_raw_error(b.raw_listing_id, "boom").await.unwrap();
        }

        assert_eq!(store.requeue_errors(None, 3).await.unwrap(), 1);
        let a = store.raw_listing("mercadolibre", "A").await.unwrap().unwrap();
        assert_eq!(a.processing_status, ProcessingStatus::Pending);
        assert_eq!(a.processing_attempts, 1);
    }

    #[tokio::test]
    async fn geo_lookup_is_type_scoped_and_radius_inclusive() {
        let store = MemoryStore::new();
        let t0 = ts("2026-02-24T12:00:00Z");
        let mut apartment = candidate("a");
        apartment.location = Some(GeoPoint::new(-34.60, -58.38));
        let id = Uuid::new_v4();
        store.seed_property(CanonicalProperty::from_candidate(id, &apartment, t0)).unwrap();

        let nearby = GeoPoint::new(-34.6004, -58.38);
        let hit = store
            .nearest_property(nearby, PropertyType::Apartment, 50.0)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.property_id, id);

        let exact = hit.distance_m;
        assert!(store
            .nearest_property(nearby, PropertyType::Apartment, exact)
            .await
            .unwrap()
            .is_some());
        assert!(store
            .nearest_property(nearby, PropertyType::House, 50.0)
            .await
            .unwrap()
            .is_none());
    }
}
