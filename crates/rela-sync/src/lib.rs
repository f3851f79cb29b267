//! Pipeline orchestration: configuration, ingestion runs, reconciliation,
//! geocoding passes and scheduling.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use rela_adapters::{
    ClientStats, Credential, FileCredentialStore, MercadoLibreClient, MercadoLibreConfig,
    NormalizerRegistry, OAuthClientConfig, PageCursor, ProperatiConfig, ProperatiScraper,
    SearchFilters, SourceClient, SourceKind,
};
use rela_storage::{HttpFetcher, PgStore, PipelineStore, SourceStatusRow, StoreTotals};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, Instrument};

pub mod config;
pub mod dedup;
pub mod geocode;
pub mod images;
pub mod ingest;
pub mod reconcile;

pub use config::{PipelineConfig, SourceConfig, SourceRegistry};
pub use dedup::{DedupConfig, DedupMatch, Deduplicator, MatchMethod};
pub use geocode::{geocode_query, DisabledGeocoder, Geocoder, NominatimGeocoder};
pub use images::{ImageUploader, PassthroughUploader};
pub use ingest::{ingest_source, IngestOptions, IngestStats};
pub use reconcile::{ReconcileOptions, ReconcileOutcome, ReconcileStats, Reconciler};

pub const CRATE_NAME: &str = "rela-sync";

/// On-demand invocation parameters shared by every source.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub source_id: String,
    /// Merged over the registry's default filters.
    pub filters: SearchFilters,
    /// Caps listings fetched in this run.
    pub limit: Option<u64>,
    pub skip_images: bool,
    pub start_offset: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub source_id: String,
    pub fetched: u64,
    pub staged_new: u64,
    pub staged_changed: u64,
    pub inserted: u64,
    pub updated: u64,
    pub geocoded: u64,
    pub errors: u64,
    pub elapsed_ms: u128,
    pub aborted: Option<String>,
    pub client: ClientStats,
}

impl RunSummary {
    pub fn succeeded(&self) -> bool {
        self.aborted.is_none()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GeocodePassStats {
    pub attempted: u64,
    pub geocoded: u64,
    pub missed: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineStats {
    pub sources: Vec<SourceStatusRow>,
    pub totals: StoreTotals,
}

/// Everything a pipeline stage needs, passed explicitly instead of living in globals.
pub struct PipelineContext {
    config: PipelineConfig,
    registry: SourceRegistry,
    store: Arc<dyn PipelineStore>,
    normalizers: Arc<NormalizerRegistry>,
    geocoder: Arc<dyn Geocoder>,
    images: Arc<dyn ImageUploader>,
}

impl PipelineContext {
    pub fn new(
        config: PipelineConfig,
        registry: SourceRegistry,
        store: Arc<dyn PipelineStore>,
        geocoder: Arc<dyn Geocoder>,
        images: Arc<dyn ImageUploader>,
    ) -> Self {
        let normalizers = Arc::new(NormalizerRegistry::with_defaults(Arc::new(config.rates())));
        Self {
            config,
            registry,
            store,
            normalizers,
            geocoder,
            images,
        }
    }

    /// Production wiring: the given store, the workspace registry and Nominatim.
    pub fn with_store(config: PipelineConfig, store: Arc<dyn PipelineStore>) -> Result<Self> {
        let registry = config.load_source_registry()?;
        let http = HttpFetcher::new("geocoder", config.geocoder_http_config())
            .context("building geocoder http client")?;
        let geocoder = Arc::new(NominatimGeocoder::new(
            config.geocoder_url.clone(),
            config.geocoder_country.clone(),
            http,
        ));
        Ok(Self::new(config, registry, store, geocoder, Arc::new(PassthroughUploader)))
    }

    pub async fn connect(config: PipelineConfig) -> Result<Self> {
        let store = PgStore::connect(&config.database_url, config.database_max_connections).await?;
        Self::with_store(config, Arc::new(store))
    }

    pub async fn from_env() -> Result<Self> {
        Self::connect(PipelineConfig::from_env()).await
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn PipelineStore> {
        &self.store
    }

    pub fn reconciler(&self) -> Reconciler {
        let dedup = Deduplicator::new(
            self.store.clone(),
            DedupConfig {
                radius_m: self.config.dedup_radius_m,
                similarity_threshold: self.config.dedup_similarity,
                ..DedupConfig::default()
            },
        );
        Reconciler::new(
            self.store.clone(),
            self.normalizers.clone(),
            dedup,
            self.geocoder.clone(),
            self.images.clone(),
        )
    }

    /// Registers every source of the registry in the store.
    pub async fn seed_sources(&self) -> Result<usize> {
        for source in &self.registry.sources {
            self.store
                .upsert_source(&source.record())
                .await
                .with_context(|| format!("registering source {}", source.source_id))?;
        }
        Ok(self.registry.sources.len())
    }

    fn source(&self, source_id: &str) -> Result<&SourceConfig> {
        self.registry
            .get(source_id)
            .ok_or_else(|| anyhow!("unknown source {source_id}"))
    }

    /// Builds the live client for a registered source.
    pub async fn build_client(&self, source_id: &str, overrides: &SearchFilters) -> Result<Box<dyn SourceClient>> {
        let source = self.source(source_id)?;
        let http = HttpFetcher::new(source.source_id.clone(), self.config.source_http_config())
            .with_context(|| format!("building http client for {source_id}"))?;

        let client: Box<dyn SourceClient> = match source.kind {
            SourceKind::Api => {
                let defaults = MercadoLibreConfig::default();
                let config = MercadoLibreConfig {
                    source_id: source.source_id.clone(),
                    base_url: source.base_url.clone().unwrap_or(defaults.base_url),
                    filters: source.filters.merged_with(overrides),
                    page_size: source.page_size.unwrap_or(defaults.page_size),
                    max_offset: source.max_offset.unwrap_or(defaults.max_offset),
                    ..defaults
                };
                let credentials = self.open_credentials().await?;
                Box::new(MercadoLibreClient::new(config, http, credentials))
            }
            SourceKind::PublicHtml => {
                if source.listing_urls.is_empty() {
                    anyhow::bail!("source {source_id} has no listing_urls");
                }
                let defaults = ProperatiConfig::default();
                let config = ProperatiConfig {
                    source_id: source.source_id.clone(),
                    base_url: source.base_url.clone().unwrap_or(defaults.base_url),
                    listing_urls: source.listing_urls.clone(),
                    max_cards_per_page: source
                        .page_size
                        .map(|n| n as usize)
                        .unwrap_or(defaults.max_cards_per_page),
                    ..defaults
                };
                Box::new(ProperatiScraper::new(config, http))
            }
        };
        Ok(client)
    }

    async fn open_credentials(&self) -> Result<Arc<FileCredentialStore>> {
        let oauth = match (&self.config.ml_client_id, &self.config.ml_client_secret) {
            (Some(client_id), Some(client_secret)) => Some(OAuthClientConfig {
                token_url: self.config.oauth_token_url.clone(),
                client_id: client_id.clone(),
                client_secret: client_secret.clone(),
            }),
            _ => None,
        };
        let initial = self.config.ml_access_token.clone().map(|access_token| Credential {
            access_token,
            refresh_token: self.config.ml_refresh_token.clone(),
            expires_at: None,
        });
        let http = HttpFetcher::new("oauth", self.config.source_http_config())
            .context("building oauth http client")?;
        let store = FileCredentialStore::open(&self.config.credentials_path, oauth, Arc::new(http), initial)
            .await
            .with_context(|| format!("opening credentials {}", self.config.credentials_path.display()))?;
        Ok(Arc::new(store))
    }

    /// Fetch, stage and reconcile one source.
    pub async fn run(&self, request: &RunRequest) -> Result<RunSummary> {
        let client = self.build_client(&request.source_id, &request.filters).await?;
        self.run_with_client(request, client.as_ref()).await
    }

    pub async fn run_with_client(&self, request: &RunRequest, client: &dyn SourceClient) -> Result<RunSummary> {
        let started = Instant::now();
        let source = self.source(&request.source_id)?;
        let span = info_span!("pipeline_run", source = %source.source_id);

        async {
            info!(limit = ?request.limit, skip_images = request.skip_images, "pipeline run started");
            let ingest = self.ingest_with_client(request, client, source).await?;

            let mut summary = RunSummary {
                source_id: source.source_id.clone(),
                fetched: ingest.fetched,
                staged_new: ingest.staged_new,
                staged_changed: ingest.staged_changed,
                errors: ingest.errors,
                aborted: ingest.aborted.clone(),
                ..RunSummary::default()
            };

            // Whatever was staged before an abort is still reconciled.
            let reconciled = self.process(Some(&source.source_id), request.skip_images, None).await?;
            summary.inserted = reconciled.inserted;
            summary.updated = reconciled.updated;
            summary.geocoded = reconciled.geocoded;
            summary.errors += reconciled.errors;
            summary.client = client.stats();
            summary.elapsed_ms = started.elapsed().as_millis();

            info!(
                fetched = summary.fetched,
                inserted = summary.inserted,
                updated = summary.updated,
                geocoded = summary.geocoded,
                errors = summary.errors,
                elapsed_ms = summary.elapsed_ms as u64,
                aborted = summary.aborted.is_some(),
                "pipeline run finished"
            );
            Ok(summary)
        }
        .instrument(span)
        .await
    }

    /// Fetch and stage only.
    pub async fn ingest(&self, request: &RunRequest) -> Result<IngestStats> {
        let source = self.source(&request.source_id)?;
        let client = self.build_client(&request.source_id, &request.filters).await?;
        self.ingest_with_client(request, client.as_ref(), source).await
    }

    async fn ingest_with_client(
        &self,
        request: &RunRequest,
        client: &dyn SourceClient,
        source: &SourceConfig,
    ) -> Result<IngestStats> {
        self.store
            .upsert_source(&source.record())
            .await
            .with_context(|| format!("registering source {}", source.source_id))?;
        let start = request
            .start_offset
            .map(|offset| PageCursor::new(offset, client.first_page().limit));
        ingest_source(
            self.store.as_ref(),
            client,
            source.detail_failure,
            IngestOptions {
                limit: request.limit,
                start,
            },
        )
        .await
    }

    /// Reconciles the pending backlog, optionally for one source.
    pub async fn process(&self, source_id: Option<&str>, skip_images: bool, limit: Option<usize>) -> Result<ReconcileStats> {
        self.reconciler()
            .process_pending(
                source_id,
                ReconcileOptions {
                    skip_images,
                    batch_size: self.config.batch_size,
                    limit,
                },
            )
            .await
    }

    /// Retries geocoding for properties that have an address but no coordinates.
    pub async fn geocode_missing(&self, limit: usize) -> Result<GeocodePassStats> {
        let pending = self
            .store
            .properties_missing_location(limit)
            .await
            .context("loading properties without coordinates")?;
        let mut stats = GeocodePassStats::default();

        for property in pending {
            stats.attempted += 1;
            let query = geocode_query(&property.address, property.city.as_deref(), None);
            match self.geocoder.geocode(&query).await {
                Some(point) => {
                    self.store
                        .set_property_location(property.id, point)
                        .await
                        .with_context(|| format!("storing coordinates for {}", property.id))?;
                    stats.geocoded += 1;
                }
                None => stats.missed += 1,
            }
        }

        info!(
            attempted = stats.attempted,
            geocoded = stats.geocoded,
            missed = stats.missed,
            "geocode pass finished"
        );
        Ok(stats)
    }

    pub async fn requeue(&self, source_id: Option<&str>, max_attempts: i32) -> Result<u64> {
        let count = self
            .store
            .requeue_errors(source_id, max_attempts)
            .await
            .context("requeueing errored listings")?;
        info!(count, max_attempts, "errored listings reopened");
        Ok(count)
    }

    pub async fn stats(&self) -> Result<PipelineStats> {
        Ok(PipelineStats {
            sources: self.store.source_status().await.context("loading source status")?,
            totals: self.store.totals().await.context("loading store totals")?,
        })
    }

    /// Runs every enabled source in turn. A failing source does not stop the others.
    pub async fn run_enabled(&self) -> Vec<RunSummary> {
        let mut summaries = Vec::new();
        for source in self.registry.enabled() {
            let request = RunRequest {
                source_id: source.source_id.clone(),
                ..RunRequest::default()
            };
            match self.run(&request).await {
                Ok(summary) => summaries.push(summary),
                Err(err) => error!(source = %source.source_id, error = %format!("{err:#}"), "scheduled run failed"),
            }
        }
        summaries
    }

    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.sync_cron.as_str();
        let context = Arc::clone(self);
        let job = Job::new_async(cron, move |_uuid, _l| {
            let context = Arc::clone(&context);
            Box::pin(async move {
                info!("scheduled sync triggered");
                let summaries = context.run_enabled().await;
                info!(runs = summaries.len(), "scheduled sync finished");
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rela_adapters::{AdapterError, DetailRecord, ListingPage, ListingSummary};
    use rela_core::{GeoPoint, ProcessingStatus};
    use rela_storage::MemoryStore;
    use serde_json::json;

    const REGISTRY: &str = r#"
sources:
  - source_id: mercadolibre
    display_name: MercadoLibre
    enabled: true
    kind: api
    page_size: 50
  - source_id: properati
    display_name: Properati
    enabled: false
    kind: public_html
    listing_urls:
      - https://www.properati.com.ar/s/capital-federal/departamento/venta
"#;

    struct FixedGeocoder;

    #[async_trait]
    impl Geocoder for FixedGeocoder {
        async fn geocode(&self, query: &str) -> Option<GeoPoint> {
            query.contains("rivadavia").then(|| GeoPoint::new(-34.615, -58.43))
        }
    }

    fn context(store: Arc<MemoryStore>, config: PipelineConfig) -> PipelineContext {
        PipelineContext::new(
            config,
            SourceRegistry::from_yaml_str(REGISTRY).unwrap(),
            store,
            Arc::new(FixedGeocoder),
            Arc::new(PassthroughUploader),
        )
    }

    fn test_config() -> PipelineConfig {
        PipelineConfig::from_lookup(|_| None)
    }

    /// One page of marketplace items. Items without coordinates carry a street address.
    struct Marketplace {
        items: Vec<(&'static str, f64, Option<(f64, f64)>)>,
    }

    #[async_trait]
    impl SourceClient for Marketplace {
        fn source_id(&self) -> &str {
            "mercadolibre"
        }

        fn kind(&self) -> SourceKind {
            SourceKind::Api
        }

        fn first_page(&self) -> PageCursor {
            PageCursor::new(0, 50)
        }

        async fn fetch_page(&self, cursor: &PageCursor) -> Result<ListingPage, AdapterError> {
            let items = self
                .items
                .iter()
                .skip(cursor.offset as usize)
                .map(|(id, _, _)| ListingSummary {
                    external_id: id.to_string(),
                    url: None,
                    raw: json!({"id": id}),
                })
                .collect();
            Ok(ListingPage {
                items,
                next: cursor.next(),
                has_more: false,
                total: Some(self.items.len() as u64),
                skipped: 0,
            })
        }

        async fn fetch_detail(&self, summary: &ListingSummary) -> Result<DetailRecord, AdapterError> {
            let (id, price, coords) = self
                .items
                .iter()
                .find(|(id, _, _)| *id == summary.external_id)
                .copied()
                .ok_or_else(|| AdapterError::Parse("unknown item".into()))?;
            let location = match coords {
                Some((lat, lng)) => json!({"latitude": lat, "longitude": lng, "city": {"name": "Capital Federal"}}),
                None => json!({"address_line": "Av. Rivadavia 5000", "city": {"name": "Capital Federal"}}),
            };
            Ok(DetailRecord {
                external_id: id.to_string(),
                url: Some(format!("https://articulo.mercadolibre.com.ar/{id}")),
                payload: json!({
                    "id": id,
                    "title": "Depto 2 amb",
                    "price": price,
                    "currency_id": "USD",
                    "category_id": "MLA1472",
                    "location": location,
                    "attributes": [{"id": "OPERATION", "value_name": "Venta"}]
                }),
                partial: false,
            })
        }

        fn stats(&self) -> ClientStats {
            ClientStats {
                total_requests: 1 + self.items.len() as u64,
                successful_requests: 1 + self.items.len() as u64,
                ..ClientStats::default()
            }
        }
    }

    fn request() -> RunRequest {
        RunRequest {
            source_id: "mercadolibre".into(),
            ..RunRequest::default()
        }
    }

    #[tokio::test]
    async fn run_reports_uniform_counts() {
        let store = Arc::new(MemoryStore::new());
        let ctx = context(store.clone(), test_config());
        assert_eq!(ctx.seed_sources().await.unwrap(), 2);

        let client = Marketplace {
            items: vec![
                ("ML1", 50_000.0, Some((-34.60, -58.38))),
                ("ML2", 80_000.0, None),
                // ~20 m from ML1; same property seen twice on the marketplace.
                ("ML3", 51_000.0, Some((-34.60018, -58.38))),
            ],
        };
        let summary = ctx.run_with_client(&request(), &client).await.unwrap();
        assert!(summary.succeeded());
        assert_eq!(summary.fetched, 3);
        assert_eq!(summary.staged_new, 3);
        assert_eq!((summary.inserted, summary.updated), (2, 1));
        assert_eq!(summary.geocoded, 1);
        assert_eq!(summary.errors, 0);
        assert_eq!(summary.client.total_requests, 4);

        let stats = ctx.stats().await.unwrap();
        assert_eq!(stats.totals.properties, 2);
        assert_eq!(stats.totals.geocoded, 2);
        assert_eq!(stats.totals.property_sources, 3);
        let ml = stats.sources.iter().find(|s| s.source_id == "mercadolibre").unwrap();
        assert_eq!((ml.processed, ml.pending, ml.total_scraped), (3, 0, 3));

        let rerun = ctx.run_with_client(&request(), &client).await.unwrap();
        assert_eq!(rerun.fetched, 3);
        assert_eq!((rerun.staged_new, rerun.staged_changed), (0, 0));
        assert_eq!((rerun.inserted, rerun.updated), (0, 0));
    }

    #[tokio::test]
    async fn geocode_pass_and_requeue() {
        let store = Arc::new(MemoryStore::new());
        let ctx = context(store.clone(), test_config());
        let client = Marketplace {
            items: vec![("ML9", 70_000.0, None)],
        };
        // No geocoding at reconcile time: store the property without coordinates.
        let no_geo = PipelineContext::new(
            test_config(),
            SourceRegistry::from_yaml_str(REGISTRY).unwrap(),
            store.clone(),
            Arc::new(DisabledGeocoder),
            Arc::new(PassthroughUploader),
        );
        let summary = no_geo.run_with_client(&request(), &client).await.unwrap();
        assert_eq!((summary.inserted, summary.geocoded), (1, 0));
        // The run registers its source itself; bookkeeping lands without a prior migrate.
        let sources = ctx.stats().await.unwrap().sources;
        assert_eq!(sources.len(), 1);
        assert_eq!((sources[0].source_id.as_str(), sources[0].total_scraped), ("mercadolibre", 1));

        let pass = ctx.geocode_missing(10).await.unwrap();
        assert_eq!(pass, GeocodePassStats { attempted: 1, geocoded: 1, missed: 0 });
        assert_eq!(ctx.stats().await.unwrap().totals.geocoded, 1);
        assert_eq!(ctx.geocode_missing(10).await.unwrap().attempted, 0);

        let raw = store.raw_listing("mercadolibre", "ML9").await.unwrap().unwrap();
        store.mark_raw_error(raw.id, "boom").await.unwrap();
        assert_eq!(ctx.requeue(Some("mercadolibre"), 1).await.unwrap(), 0);
        assert_eq!(ctx.requeue(Some("mercadolibre"), 3).await.unwrap(), 1);
        let raw = store.raw_listing("mercadolibre", "ML9").await.unwrap().unwrap();
        assert_eq!(raw.processing_status, ProcessingStatus::Pending);
    }

    #[tokio::test]
    async fn unknown_source_is_an_error_before_any_fetch() {
        let ctx = context(Arc::new(MemoryStore::new()), test_config());
        let err = ctx
            .run(&RunRequest {
                source_id: "zonaprop".into(),
                ..RunRequest::default()
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown source zonaprop"));
    }

    #[tokio::test]
    async fn builds_clients_for_both_source_kinds() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config();
        config.credentials_path = dir.path().join("credentials.json");
        config.ml_access_token = Some("APP_USR-token".into());
        let ctx = context(Arc::new(MemoryStore::new()), config);

        let ml = ctx.build_client("mercadolibre", &SearchFilters::default()).await.unwrap();
        assert_eq!(ml.kind(), SourceKind::Api);
        assert_eq!(ml.first_page().limit, 50);

        let properati = ctx.build_client("properati", &SearchFilters::default()).await.unwrap();
        assert_eq!(properati.kind(), SourceKind::PublicHtml);
        assert_eq!(properati.source_id(), "properati");
    }

    #[tokio::test]
    async fn scheduler_is_off_unless_enabled() {
        let ctx = Arc::new(context(Arc::new(MemoryStore::new()), test_config()));
        assert!(ctx.maybe_build_scheduler().await.unwrap().is_none());
    }
}
