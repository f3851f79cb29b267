//! Per-source mapping from raw payloads to [`NormalizedCandidate`]s, plus the
//! shared finishing steps (address canonicalization, USD price, quality score).

use std::collections::HashMap;
use std::sync::Arc;

use rela_core::fx::{to_usd, RateProvider};
use rela_core::geo::GeoPoint;
use rela_core::{Currency, NormalizedCandidate, OperationType, PropertyType};
use serde_json::Value as JsonValue;
use tracing::warn;

use crate::mercadolibre::{attribute_number, attribute_text, property_type_for_category};
use crate::{coerce_f64, json_f64, json_path, json_str, text_or_none};

pub const DEFAULT_COUNTRY: &str = "AR";

/// A pure mapping from one source's payload shape. Fields that are absent or do
/// not parse stay `None`.
pub trait Normalizer: Send + Sync {
    fn source_id(&self) -> &str;
    fn map(&self, payload: &JsonValue) -> NormalizedCandidate;
}

pub struct NormalizerRegistry {
    normalizers: HashMap<String, Arc<dyn Normalizer>>,
    rates: Arc<dyn RateProvider>,
}

impl NormalizerRegistry {
    pub fn new(rates: Arc<dyn RateProvider>) -> Self {
        Self {
            normalizers: HashMap::new(),
            rates,
        }
    }

    /// Registry with the built-in sources under their default ids.
    pub fn with_defaults(rates: Arc<dyn RateProvider>) -> Self {
        let mut registry = Self::new(rates);
        registry.register(Arc::new(MercadoLibreNormalizer::new("mercadolibre")));
        registry.register(Arc::new(ProperatiNormalizer::new("properati")));
        registry
    }

    pub fn register(&mut self, normalizer: Arc<dyn Normalizer>) {
        self.normalizers
            .insert(normalizer.source_id().to_string(), normalizer);
    }

    pub fn contains(&self, source_id: &str) -> bool {
        self.normalizers.contains_key(source_id)
    }

    /// Never fails: an unknown source yields an empty candidate.
    pub fn normalize(&self, source_id: &str, payload: &JsonValue) -> NormalizedCandidate {
        let mut candidate = match self.normalizers.get(source_id) {
            Some(normalizer) => normalizer.map(payload),
            None => {
                warn!(source = source_id, "no normalizer registered; keeping empty candidate");
                NormalizedCandidate::empty(source_id)
            }
        };
        candidate.source_id = source_id.to_string();
        self.finish(&mut candidate);
        candidate
    }

    fn finish(&self, candidate: &mut NormalizedCandidate) {
        candidate.address = candidate
            .address
            .as_deref()
            .map(normalize_address)
            .filter(|a| !a.is_empty());
        candidate.price_usd = to_usd(self.rates.as_ref(), candidate.price, candidate.currency);
        candidate.quality_score = quality_score(candidate);
    }
}

/// Canonical address form used for fuzzy matching.
pub fn normalize_address(address: &str) -> String {
    let lower = collapse_whitespace(&address.to_lowercase());
    let expanded = lower
        .replace("av.", "avenida ")
        .replace("bv.", "boulevard ")
        .replace("n°", "")
        .replace("nº", "")
        .replace("nro.", "");
    collapse_whitespace(&expanded)
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Weighted completeness over a fixed checklist, in `[0, 1]`.
pub fn quality_score(candidate: &NormalizedCandidate) -> f64 {
    fn filled(text: &Option<String>) -> bool {
        text.as_deref().is_some_and(|t| !t.trim().is_empty())
    }

    let checks = [
        (2.0, filled(&candidate.title)),
        (2.0, candidate.price.is_some_and(|p| p > 0.0)),
        (2.0, filled(&candidate.address)),
        (1.0, candidate.location.is_some()),
        (1.0, candidate.location.is_some()),
        (1.0, candidate.total_surface.is_some()),
        (1.0, candidate.rooms.is_some()),
        (1.0, filled(&candidate.description)),
        (1.0, filled(&candidate.neighborhood)),
    ];
    let total: f64 = checks.iter().map(|(w, _)| w).sum();
    let earned: f64 = checks.iter().filter(|(_, ok)| *ok).map(|(w, _)| w).sum();
    earned / total
}

fn count(value: Option<f64>) -> Option<i32> {
    value
        .filter(|v| v.is_finite() && *v >= 0.0 && *v <= f64::from(i32::MAX))
        .map(|v| v.round() as i32)
}

fn owned_text(value: Option<&str>) -> Option<String> {
    value.and_then(text_or_none)
}

pub struct MercadoLibreNormalizer {
    source_id: String,
}

impl MercadoLibreNormalizer {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
        }
    }
}

impl Normalizer for MercadoLibreNormalizer {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn map(&self, item: &JsonValue) -> NormalizedCandidate {
        let state = owned_text(
            json_str(item, &["address", "state_name"])
                .or_else(|| json_str(item, &["location", "state", "name"])),
        );
        let city = owned_text(
            json_str(item, &["address", "city_name"])
                .or_else(|| json_str(item, &["location", "city", "name"])),
        );
        let neighborhood = owned_text(json_str(item, &["location", "neighborhood", "name"]));

        let street = owned_text(json_str(item, &["location", "address_line"])).or_else(|| {
            let name = json_str(item, &["location", "street_name"])?;
            let number = json_str(item, &["location", "street_number"]).unwrap_or_default();
            text_or_none(format!("{name} {number}"))
        });
        let address_parts: Vec<String> = [street, neighborhood.clone(), city.clone()]
            .into_iter()
            .flatten()
            .collect();

        let location = match (
            json_f64(item, &["location", "latitude"]),
            json_f64(item, &["location", "longitude"]),
        ) {
            (Some(lat), Some(lng)) => GeoPoint::checked(lat, lng),
            _ => None,
        };

        let images = item
            .get("pictures")
            .and_then(JsonValue::as_array)
            .map(|pictures| {
                pictures
                    .iter()
                    .filter_map(|p| json_str(p, &["secure_url"]).or_else(|| json_str(p, &["url"])))
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let description = ["full_description", "plain_text", "description"]
            .iter()
            .find_map(|key| owned_text(json_str(item, &[*key])));

        NormalizedCandidate {
            source_id: self.source_id.clone(),
            external_id: owned_text(json_str(item, &["id"])),
            external_url: owned_text(json_str(item, &["permalink"])),
            title: owned_text(json_str(item, &["title"])),
            description,
            price: json_f64(item, &["price"]),
            currency: json_str(item, &["currency_id"]).and_then(Currency::from_code),
            price_usd: None,
            property_type: json_str(item, &["category_id"])
                .map(property_type_for_category)
                .unwrap_or_default(),
            operation_type: attribute_text(item, "OPERATION")
                .map(OperationType::from_text)
                .unwrap_or_default(),
            country: Some(
                json_str(item, &["location", "country", "id"])
                    .unwrap_or(DEFAULT_COUNTRY)
                    .to_string(),
            ),
            state,
            city,
            neighborhood,
            address: text_or_none(address_parts.join(", ")),
            location,
            total_surface: attribute_number(item, "TOTAL_AREA"),
            covered_surface: attribute_number(item, "COVERED_AREA"),
            rooms: count(attribute_number(item, "ROOMS")),
            bedrooms: count(attribute_number(item, "BEDROOMS")),
            bathrooms: count(attribute_number(item, "FULL_BATHROOMS")),
            garage_spaces: count(attribute_number(item, "PARKING_LOTS")),
            images,
            quality_score: 0.0,
        }
    }
}

pub fn properati_property_type(raw: &str) -> PropertyType {
    match raw.trim().to_lowercase().as_str() {
        "departamento" | "apartment" => PropertyType::Apartment,
        "casa" | "house" => PropertyType::House,
        "ph" => PropertyType::Ph,
        "terreno" | "lote" | "land" => PropertyType::Land,
        "local" | "comercial" | "commercial" | "store" => PropertyType::Commercial,
        "oficina" | "office" => PropertyType::Office,
        _ => PropertyType::Other,
    }
}

/// `|AR|Buenos Aires|Capital Federal|Palermo|` → `["AR", "Buenos Aires", ...]`.
fn place_parts(place: &str) -> Vec<&str> {
    place
        .split('|')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect()
}

pub struct ProperatiNormalizer {
    source_id: String,
}

impl ProperatiNormalizer {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
        }
    }
}

impl Normalizer for ProperatiNormalizer {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn map(&self, data: &JsonValue) -> NormalizedCandidate {
        let place = json_str(data, &["place_with_parent_names"])
            .map(place_parts)
            .unwrap_or_default();
        let place_at = |index: usize| place.get(index).map(|p| p.to_string());

        let location = match (json_f64(data, &["lat"]), json_f64(data, &["lon"])) {
            (Some(lat), Some(lng)) => GeoPoint::checked(lat, lng),
            _ => None,
        };

        let images = json_path(data, &["images"])
            .and_then(JsonValue::as_array)
            .map(|urls| {
                urls.iter()
                    .filter_map(JsonValue::as_str)
                    .filter(|u| !u.is_empty())
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let external_id = json_path(data, &["id"]).and_then(|id| match id {
            JsonValue::String(s) => text_or_none(s),
            JsonValue::Number(n) => Some(n.to_string()),
            _ => None,
        });

        NormalizedCandidate {
            source_id: self.source_id.clone(),
            external_id,
            external_url: owned_text(json_str(data, &["properati_url"])),
            title: owned_text(json_str(data, &["title"])),
            description: owned_text(json_str(data, &["description"])),
            price: json_path(data, &["price"]).and_then(coerce_f64),
            currency: json_str(data, &["currency"]).and_then(Currency::from_code),
            price_usd: None,
            property_type: json_str(data, &["property_type"])
                .map(properati_property_type)
                .unwrap_or_default(),
            operation_type: json_str(data, &["operation_type"])
                .map(OperationType::from_text)
                .unwrap_or_default(),
            country: place_at(0).or_else(|| Some(DEFAULT_COUNTRY.to_string())),
            state: place_at(1),
            city: place_at(2),
            neighborhood: place_at(3),
            address: owned_text(json_str(data, &["address"])),
            location,
            total_surface: json_f64(data, &["surface_total_in_m2"]),
            covered_surface: json_f64(data, &["surface_covered_in_m2"]),
            rooms: count(json_f64(data, &["rooms"])),
            bedrooms: count(json_f64(data, &["bedrooms"])),
            bathrooms: count(json_f64(data, &["bathrooms"])),
            garage_spaces: count(json_f64(data, &["parking_lots"])),
            images,
            quality_score: 0.0,
        }
    }
}
