//! Best-effort address geocoding.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use rela_core::GeoPoint;
use rela_storage::{HttpFetcher, HttpRequest};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

#[async_trait]
pub trait Geocoder: Send + Sync {
    /// `None` on any failure; callers store the property without coordinates.
    async fn geocode(&self, query: &str) -> Option<GeoPoint>;
}

/// Never resolves anything. Used when geocoding is switched off.
pub struct DisabledGeocoder;

#[async_trait]
impl Geocoder for DisabledGeocoder {
    async fn geocode(&self, _query: &str) -> Option<GeoPoint> {
        None
    }
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    lat: JsonValue,
    lon: JsonValue,
}

/// Nominatim `/search` client. The fetcher it owns carries its own 1 req/s limit,
/// independent from the source clients.
pub struct NominatimGeocoder {
    base_url: String,
    country_codes: String,
    http: HttpFetcher,
    lookups: AtomicU64,
    hits: AtomicU64,
}

impl NominatimGeocoder {
    pub fn new(base_url: impl Into<String>, country_codes: impl Into<String>, http: HttpFetcher) -> Self {
        Self {
            base_url: base_url.into(),
            country_codes: country_codes.into(),
            http,
            lookups: AtomicU64::new(0),
            hits: AtomicU64::new(0),
        }
    }

    /// `(lookups, hits)` since construction.
    pub fn counters(&self) -> (u64, u64) {
        (self.lookups.load(Ordering::Relaxed), self.hits.load(Ordering::Relaxed))
    }
}

fn coordinate(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::String(s) => s.trim().parse().ok(),
        JsonValue::Number(n) => n.as_f64(),
        _ => None,
    }
}

#[async_trait]
impl Geocoder for NominatimGeocoder {
    async fn geocode(&self, query: &str) -> Option<GeoPoint> {
        let query = query.trim();
        if query.is_empty() {
            return None;
        }
        self.lookups.fetch_add(1, Ordering::Relaxed);

        let request = HttpRequest::get(format!("{}/search", self.base_url.trim_end_matches('/')))
            .query("q", query)
            .query("format", "json")
            .query("limit", 1)
            .query("countrycodes", &self.country_codes);

        let hits: Vec<SearchHit> = match self.http.fetch(&request).await.and_then(|r| r.json()) {
            Ok(hits) => hits,
            Err(err) => {
                warn!(query, error = %err, "geocoding request failed");
                return None;
            }
        };
        let point = hits
            .first()
            .and_then(|hit| GeoPoint::checked(coordinate(&hit.lat)?, coordinate(&hit.lon)?));
        match point {
            Some(point) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(query, lat = point.lat, lng = point.lng, "geocoded");
            }
            None => debug!(query, "no geocoding result"),
        }
        point
    }
}

/// Free-text query for an address, adding the city when the address does not
/// already mention it.
pub fn geocode_query(address: &str, city: Option<&str>, state: Option<&str>) -> String {
    let mut parts = vec![address.trim().to_string()];
    let lower = address.to_lowercase();
    for extra in [city, state].into_iter().flatten() {
        let extra = extra.trim();
        if !extra.is_empty() && !lower.contains(&extra.to_lowercase()) {
            parts.push(extra.to_string());
        }
    }
    parts.join(", ")
}
