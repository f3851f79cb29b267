//! Public HTML listing scraper (Properati-shaped search result pages).
//!
//! Each configured listing URL is one page of the stream. Cards are mapped to a
//! payload in the shape the Properati normalizer reads, so card-only records
//! (detail page unavailable) normalize the same way as enriched ones.

use async_trait::async_trait;
use rela_core::PropertyType;
use rela_storage::{HttpFetcher, HttpRequest};
use scraper::{ElementRef, Html, Selector};
use serde_json::{json, Value as JsonValue};
use tracing::{debug, warn};

use crate::{
    text_or_none, AdapterError, ClientStats, DetailRecord, ListingPage, ListingSummary, PageCursor,
    SourceClient, SourceKind,
};

pub const DEFAULT_BASE_URL: &str = "https://www.properati.com.ar";
const IMAGE_HOST: &str = "img.properati.com";

#[derive(Debug, Clone)]
pub struct ProperatiConfig {
    pub source_id: String,
    pub base_url: String,
    pub listing_urls: Vec<String>,
    /// Cards taken from each listing page.
    pub max_cards_per_page: usize,
    pub default_state: String,
    pub default_city: String,
    pub fetch_detail_images: bool,
}

impl Default for ProperatiConfig {
    fn default() -> Self {
        Self {
            source_id: "properati".to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            listing_urls: vec![format!("{DEFAULT_BASE_URL}/s/capital-federal/departamento/venta")],
            max_cards_per_page: 50,
            default_state: "Buenos Aires".to_string(),
            default_city: "Capital Federal".to_string(),
            fetch_detail_images: true,
        }
    }
}

pub struct ProperatiScraper {
    config: ProperatiConfig,
    http: HttpFetcher,
}

impl ProperatiScraper {
    pub fn new(config: ProperatiConfig, http: HttpFetcher) -> Self {
        Self { config, http }
    }

    pub fn config(&self) -> &ProperatiConfig {
        &self.config
    }

    fn page_request(&self, url: &str, referer: Option<&str>) -> HttpRequest {
        let mut request = HttpRequest::get(url)
            .header("Accept", "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8")
            .header("Accept-Language", "es-AR,es;q=0.9,en;q=0.8")
            .header("Cache-Control", "max-age=0")
            .header("Sec-Fetch-Dest", "document")
            .header("Sec-Fetch-Mode", "navigate");
        request = match referer {
            Some(referer) => request
                .header("Referer", referer)
                .header("Sec-Fetch-Site", "same-origin"),
            None => request.header("Sec-Fetch-Site", "none"),
        };
        request
    }

    fn absolute_url(&self, href: &str) -> String {
        if href.starts_with("http://") || href.starts_with("https://") {
            href.to_string()
        } else {
            format!(
                "{}/{}",
                self.config.base_url.trim_end_matches('/'),
                href.trim_start_matches('/')
            )
        }
    }
}

#[async_trait]
impl SourceClient for ProperatiScraper {
    fn source_id(&self) -> &str {
        &self.config.source_id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::PublicHtml
    }

    fn first_page(&self) -> PageCursor {
        PageCursor::new(0, 1)
    }

    async fn fetch_page(&self, cursor: &PageCursor) -> Result<ListingPage, AdapterError> {
        let index = cursor.offset as usize;
        let next = PageCursor::new(cursor.offset.saturating_add(1), 1);
        let Some(listing_url) = self.config.listing_urls.get(index) else {
            return Ok(ListingPage {
                items: Vec::new(),
                next,
                has_more: false,
                total: Some(0),
                skipped: 0,
            });
        };

        let body = self.http.fetch(&self.page_request(listing_url, None)).await?.text();
        let (cards, skipped) = parse_listing_page(&body, listing_url, &self.config)?;

        let items: Vec<ListingSummary> = cards
            .into_iter()
            .map(|card| ListingSummary {
                external_id: card.external_id.clone(),
                url: Some(self.absolute_url(&card.href)),
                raw: card.into_payload(&self.config, |href| self.absolute_url(href)),
            })
            .collect();
        debug!(url = %listing_url, cards = items.len(), skipped, "parsed listing page");

        Ok(ListingPage {
            total: Some(items.len() as u64),
            items,
            next,
            has_more: index + 1 < self.config.listing_urls.len(),
            skipped,
        })
    }

    async fn fetch_detail(&self, summary: &ListingSummary) -> Result<DetailRecord, AdapterError> {
        let mut payload = summary.raw.clone();
        let Some(url) = summary.url.clone() else {
            return Ok(DetailRecord::from_summary(summary.clone()));
        };
        if !self.config.fetch_detail_images {
            return Ok(DetailRecord {
                external_id: summary.external_id.clone(),
                url: Some(url),
                payload,
                partial: false,
            });
        }

        let referer = format!("{}/", self.config.base_url.trim_end_matches('/'));
        let body = self.http.fetch(&self.page_request(&url, Some(&referer))).await?.text();
        let images = parse_detail_images(&body)?;
        if images.is_empty() {
            warn!(external_id = %summary.external_id, "detail page without gallery images; keeping card image");
        } else if let Some(obj) = payload.as_object_mut() {
            obj.insert("images".to_string(), json!(images));
        }

        Ok(DetailRecord {
            external_id: summary.external_id.clone(),
            url: Some(url),
            payload,
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
            credential_refreshes: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListingCard {
    pub external_id: String,
    pub href: String,
    pub title: Option<String>,
    pub price: Option<f64>,
    pub currency: &'static str,
    pub location: Option<String>,
    pub description: Option<String>,
    pub bedrooms: Option<f64>,
    pub bathrooms: Option<f64>,
    pub area: Option<f64>,
    pub image: Option<String>,
    pub property_type: PropertyType,
    pub operation: &'static str,
}

impl ListingCard {
    fn into_payload(self, config: &ProperatiConfig, absolute: impl Fn(&str) -> String) -> JsonValue {
        let mut parts = self
            .location
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty());
        let city = parts
            .next()
            .map(ToString::to_string)
            .unwrap_or_else(|| config.default_city.clone());
        let neighborhood = parts.next().unwrap_or_default().to_string();

        json!({
            "id": self.external_id,
            "title": self.title,
            "price": self.price,
            "currency": self.currency,
            "property_type": self.property_type.as_str(),
            "operation_type": self.operation,
            "place_with_parent_names": format!("|AR|{}|{}|{}|", config.default_state, city, neighborhood),
            "address": self.location,
            "surface_total_in_m2": self.area,
            "bedrooms": self.bedrooms,
            "bathrooms": self.bathrooms,
            "description": self.description,
            "properati_url": absolute(&self.href),
            "images": self.image.into_iter().collect::<Vec<_>>(),
        })
    }
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Parse(format!("selector {css:?}: {e}")))
}

fn first_text(scope: ElementRef<'_>, sel: &Selector) -> Option<String> {
    scope
        .select(sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

fn first_attr(scope: ElementRef<'_>, sel: &Selector, attr: &str) -> Option<String> {
    scope
        .select(sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(text_or_none)
}

/// First number in `text`. A `.` or `,` followed by exactly three digits groups
/// thousands; any other separator is the decimal point and ends the number:
/// `"USD 145.000"` → 145000, `"45,5 m²"` → 45.5.
pub fn extract_number(text: &str) -> Option<f64> {
    let start = text.find(|c: char| c.is_ascii_digit())?;
    let run = text[start..]
        .split(|c: char| !(c.is_ascii_digit() || c == '.' || c == ','))
        .next()?;
    let mut groups = run.split(['.', ',']);
    let mut number = groups.next()?.to_string();
    for group in groups {
        if group.len() == 3 {
            number.push_str(group);
        } else {
            if !group.is_empty() {
                number.push('.');
                number.push_str(group);
            }
            break;
        }
    }
    number.parse::<f64>().ok()
}

pub fn price_currency(text: &str) -> &'static str {
    if ["USD", "US$", "U$S"].iter().any(|marker| text.contains(marker)) {
        "USD"
    } else {
        "ARS"
    }
}

pub fn operation_from_url(url: &str) -> &'static str {
    if url.contains("/alquiler") {
        "rent"
    } else {
        "sale"
    }
}

pub fn property_type_from_url(url: &str) -> PropertyType {
    if url.contains("/departamento") {
        PropertyType::Apartment
    } else if url.contains("/casa") {
        PropertyType::House
    } else if url.contains("/terreno") {
        PropertyType::Land
    } else if url.contains("/local") {
        PropertyType::Commercial
    } else {
        PropertyType::Other
    }
}

fn external_id_for(href: &str) -> Option<String> {
    let path = href.split(['?', '#']).next().unwrap_or_default();
    let last = path.trim_end_matches('/').rsplit('/').next()?;
    text_or_none(last).map(|segment| format!("properati_{segment}"))
}

/// Cards on one listing page plus the number dropped for lacking a link.
pub fn parse_listing_page(
    html: &str,
    listing_url: &str,
    config: &ProperatiConfig,
) -> Result<(Vec<ListingCard>, u32), AdapterError> {
    let document = Html::parse_document(html);
    let snippet = selector(".snippet")?;
    let title = selector(".information2__top .title")?;
    let price = selector(".information2__top .price")?;
    let location = selector(".information2__top .location")?;
    let description = selector(".information2 .description")?;
    let bedrooms = selector(".properties__bedrooms")?;
    let bathrooms = selector(".properties__bathrooms")?;
    let area = selector(".properties__area")?;
    let link = selector("a[href]")?;
    let image = selector(".snippet__image img")?;

    let operation = operation_from_url(listing_url);
    let property_type = property_type_from_url(listing_url);

    let mut cards = Vec::new();
    let mut skipped = 0u32;
    for card in document.select(&snippet).take(config.max_cards_per_page) {
        let Some((href, external_id)) = first_attr(card, &link, "href")
            .and_then(|href| external_id_for(&href).map(|id| (href, id)))
        else {
            warn!(listing = listing_url, "card without link; skipping");
            skipped += 1;
            continue;
        };
        let price_text = first_text(card, &price).unwrap_or_default();

        cards.push(ListingCard {
            external_id,
            href,
            title: first_text(card, &title),
            price: extract_number(&price_text),
            currency: price_currency(&price_text),
            location: first_text(card, &location),
            description: first_text(card, &description),
            bedrooms: first_text(card, &bedrooms).as_deref().and_then(extract_number),
            bathrooms: first_text(card, &bathrooms).as_deref().and_then(extract_number),
            area: first_text(card, &area).as_deref().and_then(extract_number),
            image: first_attr(card, &image, "src"),
            property_type,
            operation,
        });
    }
    Ok((cards, skipped))
}

/// Gallery image URLs from a detail page, hosted on the listing CDN, first
/// occurrence order, no duplicates.
pub fn parse_detail_images(html: &str) -> Result<Vec<String>, AdapterError> {
    let document = Html::parse_document(html);
    let primary = selector(r#"img[alt^="place photo"]"#)?;
    let fallback = selector(r#".carousel img, .gallery img, [class*="photo"] img"#)?;

    let collect = |sel: &Selector| {
        let mut urls: Vec<String> = Vec::new();
        for src in document
            .select(sel)
            .filter_map(|img| img.value().attr("src"))
            .filter(|src| src.contains(IMAGE_HOST))
        {
            if !urls.iter().any(|u| u == src) {
                urls.push(src.to_string());
            }
        }
        urls
    };

    let images = collect(&primary);
    if images.is_empty() {
        Ok(collect(&fallback))
    } else {
        Ok(images)
    }
}
