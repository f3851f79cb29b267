use anyhow::{Context, Result};
use chrono::Utc;
use rela_adapters::{DetailFailurePolicy, DetailRecord, ListingStream, PageCursor, SourceClient};
use rela_core::ExtractedFields;
use rela_storage::{PipelineStore, StageRequest, StageStatus};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default)]
pub struct IngestOptions {
    /// Caps the number of listings fetched in this run.
    pub limit: Option<u64>,
    /// Resume from a saved page cursor instead of the source's first page.
    pub start: Option<PageCursor>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IngestStats {
    pub fetched: u64,
    pub staged_new: u64,
    pub staged_changed: u64,
    pub unchanged: u64,
    pub partial: u64,
    /// Listings lost to detail or page failures.
    pub errors: u64,
    pub pages: u32,
    pub checkpoint: Option<PageCursor>,
    /// Set when a fatal source error ended the run early.
    pub aborted: Option<String>,
}

/// Streams a source and stages every record it yields. Source bookkeeping is
/// only updated when the run was not aborted.
pub async fn ingest_source(
    store: &dyn PipelineStore,
    client: &dyn SourceClient,
    policy: DetailFailurePolicy,
    options: IngestOptions,
) -> Result<IngestStats> {
    let source_id = client.source_id().to_string();
    let start = options.start.unwrap_or_else(|| client.first_page());
    let mut stream = ListingStream::new(client, start, policy).with_limit(options.limit);
    let mut stats = IngestStats::default();

    loop {
        let record = match stream.next().await {
            Ok(Some(record)) => record,
            Ok(None) => break,
            Err(err) if err.is_fatal() => {
                warn!(source = %source_id, error = %err, "source run aborted");
                stats.aborted = Some(err.to_string());
                break;
            }
            Err(err) => {
                // A failed listing page ends pagination; what was staged stays staged.
                warn!(source = %source_id, error = %err, "listing page failed; stopping pagination");
                stats.errors += 1;
                break;
            }
        };

        stats.fetched += 1;
        if record.partial {
            stats.partial += 1;
        }
        let request = StageRequest {
            source_id: source_id.clone(),
            external_id: record.external_id.clone(),
            fields: extract_fields(&record),
            payload: record.payload,
            seen_at: Utc::now(),
        };
        let outcome = store
            .stage_raw(&request)
            .await
            .with_context(|| format!("staging {source_id}/{}", request.external_id))?;
        match outcome.status {
            StageStatus::Inserted => stats.staged_new += 1,
            StageStatus::Changed => stats.staged_changed += 1,
            StageStatus::Unchanged => stats.unchanged += 1,
        }
    }

    let counters = stream.counters();
    stats.pages = counters.pages;
    stats.errors += counters.errors();
    stats.checkpoint = Some(stream.checkpoint());

    if stats.aborted.is_none() {
        store
            .record_source_run(&source_id, stats.fetched, Utc::now())
            .await
            .context("recording source run")?;
    }

    info!(
        source = %source_id,
        fetched = stats.fetched,
        new = stats.staged_new,
        changed = stats.staged_changed,
        unchanged = stats.unchanged,
        errors = stats.errors,
        pages = stats.pages,
        "ingestion finished"
    );
    Ok(stats)
}

fn text_at<'a>(payload: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = payload;
    for key in path {
        cur = cur.get(*key)?;
    }
    cur.as_str().map(str::trim).filter(|s| !s.is_empty())
}

/// Quick-look columns stored beside the raw payload.
pub fn extract_fields(record: &DetailRecord) -> ExtractedFields {
    let payload = &record.payload;
    let url = record
        .url
        .clone()
        .or_else(|| text_at(payload, &["permalink"]).map(String::from))
        .or_else(|| text_at(payload, &["properati_url"]).map(String::from));

    let price_raw = payload.get("price").filter(|p| !p.is_null()).map(|price| {
        let amount = match price {
            JsonValue::String(s) => s.clone(),
            other => other.to_string(),
        };
        match text_at(payload, &["currency_id"]).or_else(|| text_at(payload, &["currency"])) {
            Some(currency) => format!("{currency} {amount}"),
            None => amount,
        }
    });

    let location_raw = text_at(payload, &["location", "address_line"])
        .or_else(|| text_at(payload, &["place_with_parent_names"]))
        .or_else(|| text_at(payload, &["address"]))
        .map(String::from);

    ExtractedFields {
        url,
        title: text_at(payload, &["title"]).map(String::from),
        price_raw,
        location_raw,
    }
}
