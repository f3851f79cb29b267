//! Per-listing reconciliation: normalize, deduplicate, geocode, commit.
//!
//! Every pending raw listing gets its own failure boundary. A listing that
//! fails is marked `error` with its message and the batch moves on; only a
//! failure to read the backlog itself ends the run.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use rela_adapters::NormalizerRegistry;
use rela_core::RawListing;
use rela_storage::{ImageRecord, PipelineStore, PropertyWrite, ReconcileWrite};
use serde::Serialize;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::dedup::{DedupMatch, Deduplicator, MatchMethod};
use crate::geocode::{geocode_query, Geocoder};
use crate::images::ImageUploader;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Inserted { property_id: Uuid, geocoded: bool },
    Updated {
        property_id: Uuid,
        matched_by: MatchedBy,
        geocoded: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchedBy {
    /// The raw listing was already linked to this property by an earlier pass.
    PriorLink,
    Geo,
    Address,
}

impl ReconcileOutcome {
    pub fn property_id(&self) -> Uuid {
        match self {
            Self::Inserted { property_id, .. } | Self::Updated { property_id, .. } => *property_id,
        }
    }

    fn geocoded(&self) -> bool {
        match self {
            Self::Inserted { geocoded, .. } | Self::Updated { geocoded, .. } => *geocoded,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileStats {
    pub processed: u64,
    pub inserted: u64,
    pub updated: u64,
    pub geo_matches: u64,
    pub address_matches: u64,
    pub geocoded: u64,
    pub errors: u64,
}

impl ReconcileStats {
    fn record(&mut self, outcome: &ReconcileOutcome) {
        self.processed += 1;
        match outcome {
            ReconcileOutcome::Inserted { .. } => self.inserted += 1,
            ReconcileOutcome::Updated { matched_by, .. } => {
                self.updated += 1;
                match matched_by {
                    MatchedBy::Geo => self.geo_matches += 1,
                    MatchedBy::Address => self.address_matches += 1,
                    MatchedBy::PriorLink => {}
                }
            }
        }
        if outcome.geocoded() {
            self.geocoded += 1;
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReconcileOptions {
    pub skip_images: bool,
    pub batch_size: usize,
    /// Caps listings taken from the backlog in one pass.
    pub limit: Option<usize>,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            skip_images: false,
            batch_size: 100,
            limit: None,
        }
    }
}

const PROGRESS_EVERY: u64 = 25;

pub struct Reconciler {
    store: Arc<dyn PipelineStore>,
    normalizers: Arc<NormalizerRegistry>,
    dedup: Deduplicator,
    geocoder: Arc<dyn Geocoder>,
    images: Arc<dyn ImageUploader>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        normalizers: Arc<NormalizerRegistry>,
        dedup: Deduplicator,
        geocoder: Arc<dyn Geocoder>,
        images: Arc<dyn ImageUploader>,
    ) -> Self {
        Self {
            store,
            normalizers,
            dedup,
            geocoder,
            images,
        }
    }

    /// Drains the pending backlog (optionally for one source) in FIFO batches.
    pub async fn process_pending(
        &self,
        source_id: Option<&str>,
        options: ReconcileOptions,
    ) -> Result<ReconcileStats> {
        let mut stats = ReconcileStats::default();
        let batch_size = options.batch_size.max(1);

        loop {
            let taken = stats.processed + stats.errors;
            let remaining = match options.limit {
                Some(limit) => limit.saturating_sub(taken as usize),
                None => batch_size,
            };
            if remaining == 0 {
                break;
            }

            let batch = self
                .store
                .pending_raw_listings(source_id, remaining.min(batch_size))
                .await
                .context("loading pending raw listings")?;
            if batch.is_empty() {
                break;
            }

            let mut progressed = false;
            for listing in &batch {
                let span = info_span!(
                    "reconcile",
                    raw_listing_id = %listing.id,
                    source = %listing.source_id,
                    external_id = %listing.external_id
                );
                match self.reconcile_one(listing, options).instrument(span).await {
                    Ok(outcome) => {
                        stats.record(&outcome);
                        progressed = true;
                    }
                    Err(err) => {
                        stats.errors += 1;
                        let message = format!("{err:#}");
                        error!(
                            raw_listing_id = %listing.id,
                            external_id = %listing.external_id,
                            error = %message,
                            "reconciliation failed"
                        );
                        match self.store.mark_raw_error(listing.id, &message).await {
                            Ok(()) => progressed = true,
                            Err(mark_err) => warn!(
                                raw_listing_id = %listing.id,
                                error = %mark_err,
                                "could not record reconciliation error"
                            ),
                        }
                    }
                }

                let done = stats.processed + stats.errors;
                if done % PROGRESS_EVERY == 0 {
                    info!(
                        done,
                        inserted = stats.inserted,
                        updated = stats.updated,
                        errors = stats.errors,
                        "reconciliation progress"
                    );
                }
            }

            // Nothing could be written back; re-reading would return the same rows.
            if !progressed {
                warn!("no listing in batch could be checkpointed; stopping");
                break;
            }
        }

        info!(
            processed = stats.processed,
            inserted = stats.inserted,
            updated = stats.updated,
            geocoded = stats.geocoded,
            errors = stats.errors,
            "reconciliation finished"
        );
        Ok(stats)
    }

    pub async fn reconcile_one(&self, listing: &RawListing, options: ReconcileOptions) -> Result<ReconcileOutcome> {
        let mut candidate = self.normalizers.normalize(&listing.source_id, &listing.payload);

        let matched = match self.prior_link(listing).await? {
            Some(property_id) => Some((property_id, MatchedBy::PriorLink)),
            None => self
                .dedup
                .find_match(&candidate)
                .await?
                .map(|DedupMatch { property_id, method }| {
                    let by = match method {
                        MatchMethod::Geo { .. } => MatchedBy::Geo,
                        MatchMethod::Address { .. } => MatchedBy::Address,
                    };
                    (property_id, by)
                }),
        };

        let mut geocoded = false;
        if candidate.location.is_none() {
            if let Some(address) = candidate.address.as_deref().filter(|a| !a.trim().is_empty()) {
                let query = geocode_query(address, candidate.city.as_deref(), candidate.state.as_deref());
                if let Some(point) = self.geocoder.geocode(&query).await {
                    candidate.location = Some(point);
                    geocoded = true;
                } else {
                    warn!(query = %query, "address could not be geocoded; storing without coordinates");
                }
            }
        }

        let property = match matched {
            Some((property_id, _)) => PropertyWrite::Update { property_id },
            None => PropertyWrite::Insert {
                property_id: Uuid::new_v4(),
            },
        };

        let images = if options.skip_images {
            Vec::new()
        } else {
            self.upload_images(property.property_id(), &candidate.images).await
        };

        let write = ReconcileWrite {
            raw_listing_id: listing.id,
            source_id: listing.source_id.clone(),
            external_id: listing.external_id.clone(),
            external_url: candidate.external_url.clone().or_else(|| listing.fields.url.clone()),
            property,
            candidate,
            images,
            seen_at: Utc::now(),
        };
        let property_id = self
            .store
            .commit_reconciliation(&write)
            .await
            .context("committing reconciliation")?;

        Ok(match matched {
            Some((_, matched_by)) => ReconcileOutcome::Updated {
                property_id,
                matched_by,
                geocoded,
            },
            None => ReconcileOutcome::Inserted { property_id, geocoded },
        })
    }

    async fn prior_link(&self, listing: &RawListing) -> Result<Option<Uuid>> {
        let Some(property_id) = listing.property_id else {
            return Ok(None);
        };
        let exists = self
            .store
            .property(property_id)
            .await
            .context("loading linked property")?
            .is_some();
        Ok(exists.then_some(property_id))
    }

    async fn upload_images(&self, property_id: Uuid, urls: &[String]) -> Vec<ImageRecord> {
        let mut records = Vec::with_capacity(urls.len());
        for (position, url) in urls.iter().enumerate() {
            match self.images.upload(property_id, url, position).await {
                Ok(stored_url) => records.push(ImageRecord {
                    original_url: url.clone(),
                    stored_url,
                    position: position as i32,
                }),
                Err(err) => warn!(url = %url, error = %err, "image upload failed; skipping image"),
            }
        }
        records
    }
}
