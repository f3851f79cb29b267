//! PostgreSQL + PostGIS implementation of [`PipelineStore`].

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rela_core::{
    CanonicalProperty, Currency, ExtractedFields, GeoPoint, NormalizedCandidate, OperationType,
    ProcessingStatus, PropertyStatus, PropertyType, RawListing,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tracing::info;
use uuid::Uuid;

use crate::payload_checksum;
use crate::store::{
    AddressCandidate, GeoHit, PipelineStore, PropertyWrite, ReconcileWrite, SourceRecord,
    SourceStatusRow, StageOutcome, StageRequest, StoreTotals, UngeocodedProperty,
};

const RAW_COLUMNS: &str = r#"
    id, source_id, external_id, url, raw_data, title, price_raw, location_raw, checksum,
    scraped_at, last_seen_at, times_seen, processing_status, processing_attempts,
    error_message, processed_at, property_id
"#;

const PROPERTY_COLUMNS: &str = r#"
    id, title, description, price, currency, price_usd, property_type, operation_type,
    country, state, city, neighborhood, address,
    ST_Y(location::geometry) AS lat, ST_X(location::geometry) AS lng,
    total_surface, covered_surface, rooms, bedrooms, bathrooms, garage_spaces,
    data_quality_score, status, first_seen_at, last_seen_at, last_updated_at, times_seen
"#;

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("running database migrations")?;
        info!("database migrations applied");
        Ok(())
    }
}

fn raw_from_row(row: &PgRow) -> Result<RawListing> {
    let status: String = row.try_get("processing_status")?;
    Ok(RawListing {
        id: row.try_get("id")?,
        source_id: row.try_get("source_id")?,
        external_id: row.try_get("external_id")?,
        payload: row.try_get("raw_data")?,
        checksum: row.try_get("checksum")?,
        fields: ExtractedFields {
            url: row.try_get("url")?,
            title: row.try_get("title")?,
            price_raw: row.try_get("price_raw")?,
            location_raw: row.try_get("location_raw")?,
        },
        scraped_at: row.try_get("scraped_at")?,
        last_seen_at: row.try_get("last_seen_at")?,
        times_seen: row.try_get("times_seen")?,
        processing_status: status.parse::<ProcessingStatus>()?,
        processing_attempts: row.try_get("processing_attempts")?,
        error_message: row.try_get("error_message")?,
        processed_at: row.try_get("processed_at")?,
        property_id: row.try_get("property_id")?,
    })
}

fn property_from_row(row: &PgRow) -> Result<CanonicalProperty> {
    let currency: Option<String> = row.try_get("currency")?;
    let property_type: String = row.try_get("property_type")?;
    let operation_type: String = row.try_get("operation_type")?;
    let status: String = row.try_get("status")?;
    let lat: Option<f64> = row.try_get("lat")?;
    let lng: Option<f64> = row.try_get("lng")?;

    Ok(CanonicalProperty {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        price: row.try_get("price")?,
        currency: currency.as_deref().and_then(Currency::from_code),
        price_usd: row.try_get("price_usd")?,
        property_type: property_type.parse::<PropertyType>()?,
        operation_type: operation_type.parse::<OperationType>()?,
        country: row.try_get("country")?,
        state: row.try_get("state")?,
        city: row.try_get("city")?,
        neighborhood: row.try_get("neighborhood")?,
        address: row.try_get("address")?,
        location: lat.zip(lng).map(|(lat, lng)| GeoPoint::new(lat, lng)),
        total_surface: row.try_get("total_surface")?,
        covered_surface: row.try_get("covered_surface")?,
        rooms: row.try_get("rooms")?,
        bedrooms: row.try_get("bedrooms")?,
        bathrooms: row.try_get("bathrooms")?,
        garage_spaces: row.try_get("garage_spaces")?,
        data_quality_score: row.try_get("data_quality_score")?,
        status: status.parse::<PropertyStatus>()?,
        first_seen_at: row.try_get("first_seen_at")?,
        last_seen_at: row.try_get("last_seen_at")?,
        last_updated_at: row.try_get("last_updated_at")?,
        times_seen: row.try_get("times_seen")?,
    })
}

async fn insert_property(
    tx: &mut Transaction<'_, Postgres>,
    id: Uuid,
    c: &NormalizedCandidate,
    seen_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO properties (
            id, title, description, price, currency, price_usd, property_type, operation_type,
            country, state, city, neighborhood, address, location,
            total_surface, covered_surface, rooms, bedrooms, bathrooms, garage_spaces,
            data_quality_score, status, first_seen_at, last_seen_at, last_updated_at, times_seen
        ) VALUES (
            $1, $2, $3, $4, $5, $6, $7, $8,
            $9, $10, $11, $12, $13,
            CASE WHEN $14::float8 IS NULL OR $15::float8 IS NULL THEN NULL
                 ELSE ST_SetSRID(ST_MakePoint($15, $14), 4326)::geography END,
            $16, $17, $18, $19, $20, $21,
            $22, 'active', $23, $23, $23, 1
        )
        "#,
    )
    .bind(id)
    .bind(&c.title)
    .bind(&c.description)
    .bind(c.price)
    .bind(c.currency.map(|cur| cur.code()))
    .bind(c.price_usd)
    .bind(c.property_type.as_str())
    .bind(c.operation_type.as_str())
    .bind(&c.country)
    .bind(&c.state)
    .bind(&c.city)
    .bind(&c.neighborhood)
    .bind(&c.address)
    .bind(c.location.map(|p| p.lat))
    .bind(c.location.map(|p| p.lng))
    .bind(c.total_surface)
    .bind(c.covered_surface)
    .bind(c.rooms)
    .bind(c.bedrooms)
    .bind(c.bathrooms)
    .bind(c.garage_spaces)
    .bind(c.quality_score)
    .bind(seen_at)
    .execute(&mut **tx)
    .await
    .with_context(|| format!("inserting property {id}"))?;
    Ok(())
}

/// Mirrors `CanonicalProperty::apply_sighting`: mutable fields only, coordinates
/// filled when still missing.
async fn update_property(
    tx: &mut Transaction<'_, Postgres>,
    id: Uuid,
    c: &NormalizedCandidate,
    seen_at: DateTime<Utc>,
) -> Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE properties
           SET title = COALESCE($2, title),
               description = COALESCE($3, description),
               price = CASE WHEN $4::float8 IS NULL THEN price ELSE $4 END,
               currency = CASE WHEN $4::float8 IS NULL THEN currency ELSE $5 END,
               price_usd = CASE WHEN $4::float8 IS NULL THEN price_usd ELSE $6 END,
               location = COALESCE(
                   location,
                   CASE WHEN $7::float8 IS NULL OR $8::float8 IS NULL THEN NULL
                        ELSE ST_SetSRID(ST_MakePoint($8, $7), 4326)::geography END
               ),
               last_seen_at = $9,
               last_updated_at = $9,
               times_seen = times_seen + 1
         WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(&c.title)
    .bind(&c.description)
    .bind(c.price)
    .bind(c.currency.map(|cur| cur.code()))
    .bind(c.price_usd)
    .bind(c.location.map(|p| p.lat))
    .bind(c.location.map(|p| p.lng))
    .bind(seen_at)
    .execute(&mut **tx)
    .await
    .with_context(|| format!("updating property {id}"))?;

    if result.rows_affected() == 0 {
        bail!("property {id} vanished before update");
    }
    Ok(())
}

#[async_trait]
impl PipelineStore for PgStore {
    async fn upsert_source(&self, source: &SourceRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sources (source_id, display_name, kind)
            VALUES ($1, $2, $3)
            ON CONFLICT (source_id) DO UPDATE
               SET display_name = EXCLUDED.display_name,
                   kind = EXCLUDED.kind
            "#,
        )
        .bind(&source.source_id)
        .bind(&source.display_name)
        .bind(&source.kind)
        .execute(&self.pool)
        .await
        .with_context(|| format!("upserting source {}", source.source_id))?;
        Ok(())
    }

    async fn stage_raw(&self, request: &StageRequest) -> Result<StageOutcome> {
        let checksum = payload_checksum(&request.payload);
        let row = sqlx::query(
            r#"
            WITH prev AS (
                SELECT checksum FROM raw_listings WHERE source_id = $1 AND external_id = $2
            )
            INSERT INTO raw_listings (
                source_id, external_id, url, raw_data, title, price_raw, location_raw,
                checksum, scraped_at, last_seen_at, processing_status
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9, 'pending')
            ON CONFLICT (source_id, external_id) DO UPDATE SET
                url = EXCLUDED.url,
                raw_data = EXCLUDED.raw_data,
                title = EXCLUDED.title,
                price_raw = EXCLUDED.price_raw,
                location_raw = EXCLUDED.location_raw,
                checksum = EXCLUDED.checksum,
                last_seen_at = EXCLUDED.last_seen_at,
                times_seen = raw_listings.times_seen + 1,
                processing_status = CASE
                    WHEN raw_listings.checksum <> EXCLUDED.checksum THEN 'pending'
                    ELSE raw_listings.processing_status
                END,
                error_message = CASE
                    WHEN raw_listings.checksum <> EXCLUDED.checksum THEN NULL
                    ELSE raw_listings.error_message
                END
            RETURNING id, (SELECT checksum FROM prev) AS previous_checksum
            "#,
        )
        .bind(&request.source_id)
        .bind(&request.external_id)
        .bind(&request.fields.url)
        .bind(&request.payload)
        .bind(&request.fields.title)
        .bind(&request.fields.price_raw)
        .bind(&request.fields.location_raw)
        .bind(&checksum)
        .bind(request.seen_at)
        .fetch_one(&self.pool)
        .await
        .with_context(|| {
            format!(
                "staging raw listing {}/{}",
                request.source_id, request.external_id
            )
        })?;

        let previous: Option<String> = row.try_get("previous_checksum")?;
        Ok(StageOutcome {
            raw_listing_id: row.try_get("id")?,
            status: StageOutcome::classify(previous.as_deref(), &checksum),
            checksum,
        })
    }

    async fn pending_raw_listings(&self, source_id: Option<&str>, limit: usize) -> Result<Vec<RawListing>> {
        let sql = format!(
            r#"
            SELECT {RAW_COLUMNS}
              FROM raw_listings
             WHERE processing_status = 'pending'
               AND ($1::text IS NULL OR source_id = $1)
             ORDER BY scraped_at ASC
             LIMIT $2
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(source_id)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .context("loading pending raw listings")?;
        rows.iter().map(raw_from_row).collect()
    }

    async fn raw_listing(&self, source_id: &str, external_id: &str) -> Result<Option<RawListing>> {
        let sql = format!(
            "SELECT {RAW_COLUMNS} FROM raw_listings WHERE source_id = $1 AND external_id = $2"
        );
        let row = sqlx::query(&sql)
            .bind(source_id)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("loading raw listing {source_id}/{external_id}"))?;
        row.as_ref().map(raw_from_row).transpose()
    }

    async fn nearest_property(
        &self,
        point: GeoPoint,
        property_type: PropertyType,
        radius_m: f64,
    ) -> Result<Option<GeoHit>> {
        let row = sqlx::query(
            r#"
            SELECT id,
                   ST_Distance(location, ST_SetSRID(ST_MakePoint($2, $1), 4326)::geography) AS distance
              FROM properties
             WHERE location IS NOT NULL
               AND property_type = $3
               AND ST_DWithin(location, ST_SetSRID(ST_MakePoint($2, $1), 4326)::geography, $4)
             ORDER BY distance ASC
             LIMIT 1
            "#,
        )
        .bind(point.lat)
        .bind(point.lng)
        .bind(property_type.as_str())
        .bind(radius_m)
        .fetch_optional(&self.pool)
        .await
        .context("querying nearest property")?;

        row.map(|row| {
            Ok::<_, anyhow::Error>(GeoHit {
                property_id: row.try_get("id")?,
                distance_m: row.try_get("distance")?,
            })
        })
        .transpose()
    }

    async fn address_candidates(
        &self,
        city: &str,
        property_type: PropertyType,
        limit: usize,
    ) -> Result<Vec<AddressCandidate>> {
        let rows = sqlx::query(
            r#"
            SELECT id, address
              FROM properties
             WHERE LOWER(city) = LOWER($1)
               AND property_type = $2
               AND address IS NOT NULL
               AND address <> ''
             ORDER BY last_seen_at DESC
             LIMIT $3
            "#,
        )
        .bind(city)
        .bind(property_type.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("loading address candidates in {city}"))?;

        rows.iter()
            .map(|row| {
                Ok(AddressCandidate {
                    property_id: row.try_get("id")?,
                    address: row.try_get("address")?,
                })
            })
            .collect()
    }

    async fn commit_reconciliation(&self, write: &ReconcileWrite) -> Result<Uuid> {
        let mut tx = self.pool.begin().await.context("opening reconcile transaction")?;

        let property_id = write.property.property_id();
        match write.property {
            PropertyWrite::Insert { .. } => {
                insert_property(&mut tx, property_id, &write.candidate, write.seen_at).await?
            }
            PropertyWrite::Update { .. } => {
                update_property(&mut tx, property_id, &write.candidate, write.seen_at).await?
            }
        }

        sqlx::query(
            r#"
            INSERT INTO property_sources (
                property_id, source_id, external_id, external_url, first_seen_at, last_seen_at
            ) VALUES ($1, $2, $3, $4, $5, $5)
            ON CONFLICT (property_id, source_id, external_id) DO UPDATE
               SET external_url = COALESCE(EXCLUDED.external_url, property_sources.external_url),
                   last_seen_at = EXCLUDED.last_seen_at,
                   times_seen = property_sources.times_seen + 1
            "#,
        )
        .bind(property_id)
        .bind(&write.source_id)
        .bind(&write.external_id)
        .bind(&write.external_url)
        .bind(write.seen_at)
        .execute(&mut *tx)
        .await
        .context("upserting property source link")?;

        for image in &write.images {
            sqlx::query(
                r#"
                INSERT INTO property_images (property_id, original_url, stored_url, position)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (property_id, original_url) DO NOTHING
                "#,
            )
            .bind(property_id)
            .bind(&image.original_url)
            .bind(&image.stored_url)
            .bind(image.position)
            .execute(&mut *tx)
            .await
            .context("inserting property image")?;
        }

        sqlx::query(
            r#"
            UPDATE raw_listings
               SET processing_status = 'processed',
                   processed_at = $2,
                   property_id = $3,
                   error_message = NULL
             WHERE id = $1
            "#,
        )
        .bind(write.raw_listing_id)
        .bind(write.seen_at)
        .bind(property_id)
        .execute(&mut *tx)
        .await
        .context("marking raw listing processed")?;

        tx.commit().await.context("committing reconcile transaction")?;
        Ok(property_id)
    }

    async fn mark_raw_error(&self, raw_listing_id: Uuid, message: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE raw_listings
               SET processing_status = 'error',
                   error_message = $2,
                   processing_attempts = processing_attempts + 1
             WHERE id = $1
            "#,
        )
        .bind(raw_listing_id)
        .bind(message)
        .execute(&self.pool)
        .await
        .with_context(|| format!("marking raw listing {raw_listing_id} as error"))?;
        Ok(())
    }

    async fn record_source_run(&self, source_id: &str, scraped: u64, at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE sources
               SET last_scrape_at = $2,
                   last_success_at = $2,
                   total_scraped = total_scraped + $3
             WHERE source_id = $1
            "#,
        )
        .bind(source_id)
        .bind(at)
        .bind(scraped as i64)
        .execute(&self.pool)
        .await
        .with_context(|| format!("recording run bookkeeping for {source_id}"))?;
        if result.rows_affected() == 0 {
            bail!("source {source_id} is not registered");
        }
        Ok(())
    }

    async fn property(&self, id: Uuid) -> Result<Option<CanonicalProperty>> {
        let sql = format!("SELECT {PROPERTY_COLUMNS} FROM properties WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("loading property {id}"))?;
        row.as_ref().map(property_from_row).transpose()
    }

    async fn properties_missing_location(&self, limit: usize) -> Result<Vec<UngeocodedProperty>> {
        let rows = sqlx::query(
            r#"
            SELECT id, address, city
              FROM properties
             WHERE location IS NULL
               AND status = 'active'
               AND address IS NOT NULL
               AND address <> ''
             ORDER BY first_seen_at ASC
             LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("loading properties without coordinates")?;

        rows.iter()
            .map(|row| {
                Ok(UngeocodedProperty {
                    id: row.try_get("id")?,
                    address: row.try_get("address")?,
                    city: row.try_get("city")?,
                })
            })
            .collect()
    }

    async fn set_property_location(&self, id: Uuid, point: GeoPoint) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE properties
               SET location = ST_SetSRID(ST_MakePoint($3, $2), 4326)::geography,
                   last_updated_at = NOW()
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(point.lat)
        .bind(point.lng)
        .execute(&self.pool)
        .await
        .with_context(|| format!("setting location of property {id}"))?;
        Ok(())
    }

    async fn requeue_errors(&self, source_id: Option<&str>, max_attempts: i32) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE raw_listings
               SET processing_status = 'pending'
             WHERE processing_status = 'error'
               AND processing_attempts < $1
               AND ($2::text IS NULL OR source_id = $2)
            "#,
        )
        .bind(max_attempts)
        .bind(source_id)
        .execute(&self.pool)
        .await
        .context("requeueing errored raw listings")?;
        Ok(result.rows_affected())
    }

    async fn source_status(&self) -> Result<Vec<SourceStatusRow>> {
        let rows = sqlx::query(
            r#"
            SELECT s.source_id,
                   COUNT(r.id) FILTER (WHERE r.processing_status = 'pending') AS pending,
                   COUNT(r.id) FILTER (WHERE r.processing_status = 'processed') AS processed,
                   COUNT(r.id) FILTER (WHERE r.processing_status = 'error') AS error,
                   s.last_scrape_at,
                   s.last_success_at,
                   s.total_scraped
              FROM sources s
              LEFT JOIN raw_listings r ON r.source_id = s.source_id
             GROUP BY s.source_id, s.last_scrape_at, s.last_success_at, s.total_scraped
             ORDER BY s.source_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("loading source status")?;

        rows.iter()
            .map(|row| {
                Ok(SourceStatusRow {
                    source_id: row.try_get("source_id")?,
                    pending: row.try_get("pending")?,
                    processed: row.try_get("processed")?,
                    error: row.try_get("error")?,
                    last_scrape_at: row.try_get("last_scrape_at")?,
                    last_success_at: row.try_get("last_success_at")?,
                    total_scraped: row.try_get("total_scraped")?,
                })
            })
            .collect()
    }

    async fn totals(&self) -> Result<StoreTotals> {
        let row = sqlx::query(
            r#"
            SELECT (SELECT COUNT(*) FROM properties) AS properties,
                   (SELECT COUNT(*) FROM properties WHERE status = 'active') AS active,
                   (SELECT COUNT(*) FROM properties WHERE location IS NOT NULL) AS geocoded,
                   (SELECT COUNT(*) FROM property_images) AS images,
                   (SELECT COUNT(*) FROM property_sources) AS property_sources
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .context("loading store totals")?;

        Ok(StoreTotals {
            properties: row.try_get("properties")?,
            active: row.try_get("active")?,
            geocoded: row.try_get("geocoded")?,
            images: row.try_get("images")?,
            property_sources: row.try_get("property_sources")?,
        })
    }
}
