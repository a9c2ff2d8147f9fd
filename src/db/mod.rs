//! # Database — PostgreSQL Storage Layer
//!
//! All writes flow through a [`uow::UnitOfWork`] (one transaction, commit on
//! success, rollback on drop); reads that back the HTTP/WS query side run
//! directly against the pool. No component touches storage any other way.
//!
//! ## Schema
//!
//! - `campaigns`: the aggregate root, counters and status included
//! - `place_extraction_tasks`: one row per city, FK to its campaign
//! - `extracted_places`: deduplicated by fingerprint; survives campaign
//!   archival (no cascade from campaigns)
//! - `extracted_place_reviews`: cascade with their place
//!
//! ## Module Structure
//!
//! - [`schema`] — table creation, run once at startup
//! - [`uow`] — the transactional boundary and repository accessors
//! - [`campaigns`] / [`tasks`] / [`places`] — per-aggregate SQL

pub mod campaigns;
pub mod places;
pub mod schema;
pub mod tasks;
pub mod uow;

use crate::domain::{
    Campaign, CampaignStatus, Coordinates, ExtractedPlace, PlaceExtractionTask, PlaceReview,
    TaskStatus,
};
use crate::error::{Error, Result};
use anyhow::Context;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};

// ── Row types ───────────────────────────────────────────────────

#[derive(sqlx::FromRow)]
pub struct CampaignRow {
    pub id: String,
    pub title: String,
    pub activity: String,
    pub country_code: String,
    pub admin1_code: Option<String>,
    pub admin2_code: Option<String>,
    pub city_geoname_id: Option<i64>,
    pub location_name: String,
    pub iso_language: String,
    pub locale: String,
    pub max_results: i32,
    pub min_rating: Option<f64>,
    pub min_population: i64,
    pub max_bots: i32,
    pub total_tasks: i64,
    pub completed_tasks: i64,
    pub failed_tasks: i64,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub status: String,
}

impl CampaignRow {
    pub fn into_domain(self) -> Result<Campaign> {
        Ok(Campaign {
            id: self
                .id
                .parse()
                .map_err(|e| Error::Fatal(format!("bad campaign id in storage: {e}")))?,
            title: self.title,
            activity: self.activity,
            country_code: self.country_code,
            admin1_code: self.admin1_code,
            admin2_code: self.admin2_code,
            city_geoname_id: self.city_geoname_id,
            location_name: self.location_name,
            iso_language: self.iso_language,
            locale: self.locale,
            max_results: self.max_results,
            min_rating: self.min_rating,
            min_population: self.min_population,
            max_bots: self.max_bots,
            total_tasks: self.total_tasks,
            completed_tasks: self.completed_tasks,
            failed_tasks: self.failed_tasks,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            status: CampaignStatus::parse(&self.status)?,
        })
    }
}

#[derive(sqlx::FromRow)]
pub struct TaskRow {
    pub id: String,
    pub campaign_id: String,
    pub geoname_id: i64,
    pub geoname_name: String,
    pub search_seed: String,
    pub status: String,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl TaskRow {
    pub fn into_domain(self) -> Result<PlaceExtractionTask> {
        Ok(PlaceExtractionTask {
            id: self
                .id
                .parse()
                .map_err(|e| Error::Fatal(format!("bad task id in storage: {e}")))?,
            campaign_id: self
                .campaign_id
                .parse()
                .map_err(|e| Error::Fatal(format!("bad campaign id in storage: {e}")))?,
            geoname_id: self.geoname_id,
            geoname_name: self.geoname_name,
            search_seed: self.search_seed,
            status: TaskStatus::parse(&self.status)?,
            attempts: self.attempts,
            last_error: self.last_error,
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }
}

#[derive(sqlx::FromRow)]
pub struct PlaceRow {
    pub id: String,
    pub source_task_id: String,
    pub fingerprint: String,
    pub name: String,
    pub address: String,
    pub city: String,
    pub category: String,
    pub rating: Option<f64>,
    pub review_count: Option<i64>,
    pub phone: Option<String>,
    pub website: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub extracted_at: chrono::DateTime<chrono::Utc>,
}

impl PlaceRow {
    pub fn into_domain(self, reviews: Vec<PlaceReview>) -> Result<ExtractedPlace> {
        let coordinates = match (self.latitude, self.longitude) {
            (Some(latitude), Some(longitude)) => Some(Coordinates { latitude, longitude }),
            _ => None,
        };
        Ok(ExtractedPlace {
            id: self
                .id
                .parse()
                .map_err(|e| Error::Fatal(format!("bad place id in storage: {e}")))?,
            source_task_id: self
                .source_task_id
                .parse()
                .map_err(|e| Error::Fatal(format!("bad task id in storage: {e}")))?,
            fingerprint: self.fingerprint,
            name: self.name,
            address: self.address,
            city: self.city,
            category: self.category,
            rating: self.rating,
            review_count: self.review_count,
            phone: self.phone,
            website: self.website,
            coordinates,
            extracted_at: self.extracted_at,
            reviews,
        })
    }
}

#[derive(sqlx::FromRow)]
pub struct ReviewRow {
    pub place_id: String,
    pub author: String,
    pub rating: f64,
    pub text: String,
    pub posted_at: chrono::DateTime<chrono::Utc>,
}

/// Per-campaign aggregate counts served by `get_statistics`.
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct CampaignStatistics {
    pub total_tasks: i64,
    pub pending_tasks: i64,
    pub in_progress_tasks: i64,
    pub completed_tasks: i64,
    pub failed_tasks: i64,
    pub skipped_tasks: i64,
    pub places_extracted: i64,
}

// ── Database struct and connection ──────────────────────────────

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect to PostgreSQL using the provided database URL.
    ///
    /// Parses the URL manually so user names with dots and percent-encoded
    /// passwords survive intact.
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let url = url::Url::parse(database_url).context("DATABASE_URL is not a valid URL")?;
        let username = urlencoding::decode(url.username())?.into_owned();
        let password = url
            .password()
            .map(|p| urlencoding::decode(p).map(|s| s.into_owned()))
            .transpose()?;
        let mut opts = PgConnectOptions::new()
            .host(url.host_str().unwrap_or("localhost"))
            .port(url.port().unwrap_or(5432))
            .database(url.path().trim_start_matches('/'))
            .username(&username);
        if let Some(ref pw) = password {
            opts = opts.password(pw);
        }
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await
            .context("could not connect to PostgreSQL")?;
        Ok(Database { pool })
    }

    /// Get a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Health check: execute `SELECT 1` to verify database connectivity.
    /// Backs the `/readyz` probe.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }

    /// Create tables and indexes if they do not exist yet.
    pub async fn run_migrations(&self) -> Result<()> {
        schema::run_migrations(&self.pool).await
    }

    /// Open a unit of work: one transaction, commit on success, rollback on
    /// drop.
    pub async fn begin(&self) -> Result<uow::UnitOfWork> {
        let tx = self.pool.begin().await?;
        Ok(uow::UnitOfWork::new(tx))
    }
}
