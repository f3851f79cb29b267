use std::path::{Path, PathBuf};
use std::sync::Arc;

use rela_adapters::{
    DetailFailurePolicy, ListingStream, NormalizerRegistry, ProperatiConfig, ProperatiScraper,
    SourceClient,
};
use rela_core::fx::FixedRates;
use rela_core::{Currency, OperationType, PropertyType};
use rela_storage::http::testing::{instant_config, respond, ScriptedTransport};
use rela_storage::HttpFetcher;
use serde_json::Value as JsonValue;

fn fixtures() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures")
}

fn registry() -> NormalizerRegistry {
    NormalizerRegistry::with_defaults(Arc::new(FixedRates::default()))
}

#[test]
fn search_results_normalize_without_detail_enrichment() {
    let text = std::fs::read_to_string(fixtures().join("mercadolibre/search_page.json")).unwrap();
    let page: JsonValue = serde_json::from_str(&text).unwrap();
    let results = page["results"].as_array().unwrap();

    let candidates: Vec<_> = results
        .iter()
        .map(|item| registry().normalize("mercadolibre", item))
        .collect();

    assert_eq!(candidates[0].property_type, PropertyType::Apartment);
    assert!(candidates[0].location.is_some());
    assert_eq!(candidates[1].property_type, PropertyType::House);
    assert_eq!(candidates[1].currency, Some(Currency::Ars));
    assert_eq!(candidates[1].price_usd, Some(98_000.0));
    assert_eq!(candidates[1].location, None);
    assert_eq!(candidates[1].address.as_deref(), Some("belgrano 1450, ramos mejía"));
    assert!(candidates[1].quality_score < candidates[0].quality_score);
}

#[tokio::test]
async fn scraped_cards_stream_into_normalized_candidates() {
    let listing = std::fs::read_to_string(fixtures().join("properati/listing.html")).unwrap();
    let detail = std::fs::read_to_string(fixtures().join("properati/detail.html")).unwrap();
    let transport = Arc::new(ScriptedTransport::new([
        respond(200, listing),
        respond(200, detail),
        respond(503, ""),
        respond(503, ""),
        respond(503, ""),
        respond(503, ""),
    ]));
    let config = ProperatiConfig {
        listing_urls: vec!["https://www.properati.com.ar/s/capital-federal/departamento/alquiler".into()],
        ..Default::default()
    };
    let scraper = ProperatiScraper::new(
        config,
        HttpFetcher::with_transport("properati", transport, &instant_config()),
    );

    let mut stream = ListingStream::new(&scraper, scraper.first_page(), DetailFailurePolicy::Fallback);
    let mut records = Vec::new();
    while let Some(record) = stream.next().await.unwrap() {
        records.push(record);
    }
    assert_eq!(records.len(), 2);
    assert!(records[1].partial);
    assert_eq!(stream.counters().skipped, 1);

    let registry = registry();
    let enriched = scraper.parse(&records[0], &registry);
    assert_eq!(enriched.operation_type, OperationType::Rent);
    assert_eq!(enriched.currency, Some(Currency::Usd));
    assert_eq!(enriched.city.as_deref(), Some("Capital Federal"));
    assert_eq!(enriched.neighborhood.as_deref(), Some("Palermo"));
    assert_eq!(enriched.images.len(), 2);

    let card_only = scraper.parse(&records[1], &registry);
    assert_eq!(card_only.images, vec!["https://img.properati.com/card-2.jpg".to_string()]);
    assert_eq!(card_only.price_usd, Some(68_500.0));
}
