use std::sync::Arc;

use anyhow::{Context, Result};
use rela_core::NormalizedCandidate;
use rela_storage::PipelineStore;
use serde::Serialize;
use strsim::sorensen_dice;
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
pub struct DedupConfig {
    /// Inclusive.
    pub radius_m: f64,
    /// Exclusive lower bound on address similarity.
    pub similarity_threshold: f64,
    /// How many same-city properties are scored per candidate.
    pub address_scan_limit: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            radius_m: 50.0,
            similarity_threshold: 0.7,
            address_scan_limit: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum MatchMethod {
    Geo { distance_m: f64 },
    Address { score: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DedupMatch {
    pub property_id: Uuid,
    #[serde(flatten)]
    pub method: MatchMethod,
}

pub struct Deduplicator {
    store: Arc<dyn PipelineStore>,
    config: DedupConfig,
}

impl Deduplicator {
    pub fn new(store: Arc<dyn PipelineStore>, config: DedupConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> DedupConfig {
        self.config
    }

    /// Address similarity in `[0, 1]` on already-normalized addresses.
    pub fn similarity(a: &str, b: &str) -> f64 {
        sorensen_dice(a, b)
    }

    /// Geo proximity first, then fuzzy address; both scoped to the candidate's
    /// property type.
    pub async fn find_match(&self, candidate: &NormalizedCandidate) -> Result<Option<DedupMatch>> {
        if let Some(point) = candidate.location {
            let hit = self
                .store
                .nearest_property(point, candidate.property_type, self.config.radius_m)
                .await
                .context("geo duplicate lookup")?;
            if let Some(hit) = hit {
                return Ok(Some(DedupMatch {
                    property_id: hit.property_id,
                    method: MatchMethod::Geo {
                        distance_m: hit.distance_m,
                    },
                }));
            }
        }

        let (Some(address), Some(city)) = (candidate.address.as_deref(), candidate.city.as_deref()) else {
            return Ok(None);
        };
        if address.trim().is_empty() || city.trim().is_empty() {
            return Ok(None);
        }

        let candidates = self
            .store
            .address_candidates(city, candidate.property_type, self.config.address_scan_limit)
            .await
            .context("address duplicate lookup")?;

        let best = candidates
            .into_iter()
            .map(|c| (Self::similarity(address, &c.address.to_lowercase()), c.property_id))
            .filter(|(score, _)| *score > self.config.similarity_threshold)
            .max_by(|a, b| a.0.total_cmp(&b.0));

        Ok(best.map(|(score, property_id)| DedupMatch {
            property_id,
            method: MatchMethod::Address { score },
        }))
    }
}
