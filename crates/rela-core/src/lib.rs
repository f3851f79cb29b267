//! Core domain model for the listing ingestion pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub mod fx;
pub mod geo;

pub use fx::{to_usd, ConversionRule, FixedRates, RateProvider};
pub use geo::GeoPoint;

pub const CRATE_NAME: &str = "rela-core";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} value: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! string_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($text => Ok(Self::$variant),)+
                    other => Err(ParseEnumError {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Ars,
    Usd,
    Eur,
    Uyu,
    Brl,
}

impl Currency {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Ars => "ARS",
            Self::Usd => "USD",
            Self::Eur => "EUR",
            Self::Uyu => "UYU",
            Self::Brl => "BRL",
        }
    }

    /// Accepts ISO codes plus the symbols used on Argentine listing sites.
    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim().to_ascii_uppercase().as_str() {
            "ARS" | "$" => Some(Self::Ars),
            "USD" | "US$" | "U$S" | "U$D" => Some(Self::Usd),
            "EUR" | "€" => Some(Self::Eur),
            "UYU" => Some(Self::Uyu),
            "BRL" | "R$" => Some(Self::Brl),
            _ => None,
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PropertyType {
    Apartment,
    House,
    Ph,
    Land,
    Commercial,
    Office,
    #[default]
    Other,
}

string_enum!(PropertyType, "property_type", {
    Apartment => "apartment",
    House => "house",
    Ph => "ph",
    Land => "land",
    Commercial => "commercial",
    Office => "office",
    Other => "other",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    #[default]
    Sale,
    Rent,
    TempRent,
}

string_enum!(OperationType, "operation_type", {
    Sale => "sale",
    Rent => "rent",
    TempRent => "temp_rent",
});

impl OperationType {
    /// Classifies free text in Spanish ("Venta", "Alquiler temporal", ...).
    /// Ambiguous or empty text is a sale.
    pub fn from_text(text: &str) -> Self {
        let lower = text.to_lowercase();
        if lower.contains("temporal") || lower.contains("temporario") {
            Self::TempRent
        } else if lower.contains("alquiler") || lower.contains("rent") {
            Self::Rent
        } else {
            Self::Sale
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Pending,
    Processed,
    Error,
}

string_enum!(ProcessingStatus, "processing_status", {
    Pending => "pending",
    Processed => "processed",
    Error => "error",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PropertyStatus {
    #[default]
    Active,
    Inactive,
}

string_enum!(PropertyStatus, "property_status", {
    Active => "active",
    Inactive => "inactive",
});

/// Every canonical attribute in raw, pre-validation form. Produced by a source
/// normalizer, completed (FX, address, quality) by the normalizer registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct NormalizedCandidate {
    pub source_id: String,
    pub external_id: Option<String>,
    pub external_url: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub price: Option<f64>,
    pub currency: Option<Currency>,
    pub price_usd: Option<f64>,
    pub property_type: PropertyType,
    pub operation_type: OperationType,
    pub country: Option<String>,
    pub state: Option<String>,
    pub city: Option<String>,
    pub neighborhood: Option<String>,
    pub address: Option<String>,
    pub location: Option<GeoPoint>,
    pub total_surface: Option<f64>,
    pub covered_surface: Option<f64>,
    pub rooms: Option<i32>,
    pub bedrooms: Option<i32>,
    pub bathrooms: Option<i32>,
    pub garage_spaces: Option<i32>,
    pub images: Vec<String>,
    pub quality_score: f64,
}

impl NormalizedCandidate {
    pub fn empty(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            ..Default::default()
        }
    }

    pub fn has_address(&self) -> bool {
        self.address.as_deref().is_some_and(|a| !a.trim().is_empty())
    }
}

/// Fields pulled out of a raw payload at staging time for quick inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ExtractedFields {
    pub url: Option<String>,
    pub title: Option<String>,
    pub price_raw: Option<String>,
    pub location_raw: Option<String>,
}

/// One ingestion snapshot from a source, keyed by (source_id, external_id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawListing {
    pub id: Uuid,
    pub source_id: String,
    pub external_id: String,
    pub payload: JsonValue,
    pub checksum: String,
    pub fields: ExtractedFields,
    pub scraped_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub times_seen: i32,
    pub processing_status: ProcessingStatus,
    pub processing_attempts: i32,
    pub error_message: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub property_id: Option<Uuid>,
}

/// One real-world listing, deduplicated across sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalProperty {
    pub id: Uuid,
    pub title: Option<String>,
    pub description: Option<String>,
    pub price: Option<f64>,
    pub currency: Option<Currency>,
    pub price_usd: Option<f64>,
    pub property_type: PropertyType,
    pub operation_type: OperationType,
    pub country: Option<String>,
    pub state: Option<String>,
    pub city: Option<String>,
    pub neighborhood: Option<String>,
    pub address: Option<String>,
    pub location: Option<GeoPoint>,
    pub total_surface: Option<f64>,
    pub covered_surface: Option<f64>,
    pub rooms: Option<i32>,
    pub bedrooms: Option<i32>,
    pub bathrooms: Option<i32>,
    pub garage_spaces: Option<i32>,
    pub data_quality_score: f64,
    pub status: PropertyStatus,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub times_seen: i32,
}

impl CanonicalProperty {
    /// Fresh row built from a finalized candidate.
    pub fn from_candidate(id: Uuid, candidate: &NormalizedCandidate, seen_at: DateTime<Utc>) -> Self {
        Self {
            id,
            title: candidate.title.clone(),
            description: candidate.description.clone(),
            price: candidate.price,
            currency: candidate.currency,
            price_usd: candidate.price_usd,
            property_type: candidate.property_type,
            operation_type: candidate.operation_type,
            country: candidate.country.clone(),
            state: candidate.state.clone(),
            city: candidate.city.clone(),
            neighborhood: candidate.neighborhood.clone(),
            address: candidate.address.clone(),
            location: candidate.location,
            total_surface: candidate.total_surface,
            covered_surface: candidate.covered_surface,
            rooms: candidate.rooms,
            bedrooms: candidate.bedrooms,
            bathrooms: candidate.bathrooms,
            garage_spaces: candidate.garage_spaces,
            data_quality_score: candidate.quality_score,
            status: PropertyStatus::Active,
            first_seen_at: seen_at,
            last_seen_at: seen_at,
            last_updated_at: seen_at,
            times_seen: 1,
        }
    }

    /// Applies a repeat sighting. Identity fields (type, operation, geography) are
    /// left untouched; coordinates are only filled when still missing.
    ///
    /// `times_seen` here counts reconciliations of changed payloads. Every fetch,
    /// unchanged ones included, is counted on [`RawListing::times_seen`] instead.
    pub fn apply_sighting(&mut self, candidate: &NormalizedCandidate, seen_at: DateTime<Utc>) {
        if candidate.title.is_some() {
            self.title = candidate.title.clone();
        }
        if candidate.description.is_some() {
            self.description = candidate.description.clone();
        }
        if candidate.price.is_some() {
            self.price = candidate.price;
            self.currency = candidate.currency;
            self.price_usd = candidate.price_usd;
        }
        if self.location.is_none() {
            self.location = candidate.location;
        }
        self.last_seen_at = seen_at;
        self.last_updated_at = seen_at;
        self.times_seen += 1;
    }
}

/// Cross-reference from a canonical property to one (source, external id).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertySource {
    pub property_id: Uuid,
    pub source_id: String,
    pub external_id: String,
    pub external_url: Option<String>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub times_seen: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyImage {
    pub property_id: Uuid,
    pub original_url: String,
    pub stored_url: String,
    pub position: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enums_round_trip_through_text() {
        for ty in [
            PropertyType::Apartment,
            PropertyType::House,
            PropertyType::Ph,
            PropertyType::Land,
            PropertyType::Commercial,
            PropertyType::Office,
            PropertyType::Other,
        ] {
            assert_eq!(ty.as_str().parse::<PropertyType>().unwrap(), ty);
        }
        assert_eq!("TEMP_RENT".parse::<OperationType>().unwrap(), OperationType::TempRent);
        assert!("castle".parse::<PropertyType>().is_err());
    }

    #[test]
    fn operation_text_heuristic_defaults_to_sale() {
        assert_eq!(OperationType::from_text("Alquiler"), OperationType::Rent);
        assert_eq!(OperationType::from_text("Alquiler temporal"), OperationType::TempRent);
        assert_eq!(OperationType::from_text("Venta"), OperationType::Sale);
        assert_eq!(OperationType::from_text("Permuta"), OperationType::Sale);
        assert_eq!(OperationType::from_text(""), OperationType::Sale);
    }

    #[test]
    fn currency_codes_accept_local_symbols() {
        assert_eq!(Currency::from_code("usd"), Some(Currency::Usd));
        assert_eq!(Currency::from_code("U$S"), Some(Currency::Usd));
        assert_eq!(Currency::from_code("ARS"), Some(Currency::Ars));
        assert_eq!(Currency::from_code("XYZ"), None);
    }

    #[test]
    fn repeat_sighting_keeps_identity_and_fills_missing_location() {
        let seen = DateTime::parse_from_rfc3339("2026-02-24T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let mut first = NormalizedCandidate::empty("mercadolibre");
        first.title = Some("Depto 2 amb".into());
        first.price = Some(50_000.0);
        first.currency = Some(Currency::Usd);
        first.price_usd = Some(50_000.0);
        first.property_type = PropertyType::Apartment;
        first.city = Some("Córdoba".into());
        let mut property = CanonicalProperty::from_candidate(Uuid::new_v4(), &first, seen);

        let mut again = first.clone();
        again.price = Some(55_000.0);
        again.price_usd = Some(55_000.0);
        again.property_type = PropertyType::House;
        again.city = Some("Rosario".into());
        again.location = Some(GeoPoint::new(-31.42, -64.18));
        property.apply_sighting(&again, seen + chrono::Duration::hours(1));

        assert_eq!(property.price, Some(55_000.0));
        assert_eq!(property.price_usd, Some(55_000.0));
        assert_eq!(property.property_type, PropertyType::Apartment);
        assert_eq!(property.city.as_deref(), Some("Córdoba"));
        assert_eq!(property.location, Some(GeoPoint::new(-31.42, -64.18)));
        assert_eq!(property.times_seen, 2);
        assert_eq!(property.first_seen_at, seen);
    }
}
