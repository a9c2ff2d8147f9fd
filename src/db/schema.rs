//! Table definitions, applied idempotently at startup.

use crate::error::Result;
use sqlx::PgPool;

const MIGRATIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS campaigns (
        id              CHAR(26) PRIMARY KEY,
        title           TEXT NOT NULL,
        activity        TEXT NOT NULL,
        country_code    TEXT NOT NULL,
        admin1_code     TEXT,
        admin2_code     TEXT,
        city_geoname_id BIGINT,
        location_name   TEXT NOT NULL,
        iso_language    TEXT NOT NULL,
        locale          TEXT NOT NULL,
        max_results     INTEGER NOT NULL,
        min_rating      DOUBLE PRECISION,
        min_population  BIGINT NOT NULL DEFAULT 0,
        max_bots        INTEGER NOT NULL,
        total_tasks     BIGINT NOT NULL DEFAULT 0,
        completed_tasks BIGINT NOT NULL DEFAULT 0,
        failed_tasks    BIGINT NOT NULL DEFAULT 0,
        created_at      TIMESTAMPTZ NOT NULL,
        started_at      TIMESTAMPTZ,
        completed_at    TIMESTAMPTZ,
        status          TEXT NOT NULL,
        CONSTRAINT campaigns_counter_bound
            CHECK (completed_tasks + failed_tasks <= total_tasks)
    )",
    "CREATE TABLE IF NOT EXISTS place_extraction_tasks (
        id           CHAR(26) PRIMARY KEY,
        campaign_id  CHAR(26) NOT NULL REFERENCES campaigns(id),
        geoname_id   BIGINT NOT NULL,
        geoname_name TEXT NOT NULL,
        search_seed  TEXT NOT NULL,
        status       TEXT NOT NULL,
        attempts     INTEGER NOT NULL DEFAULT 0,
        last_error   TEXT,
        started_at   TIMESTAMPTZ,
        completed_at TIMESTAMPTZ
    )",
    "CREATE INDEX IF NOT EXISTS idx_tasks_campaign_status
        ON place_extraction_tasks (campaign_id, status)",
    // Places deliberately carry no FK to campaigns: they outlive archival.
    "CREATE TABLE IF NOT EXISTS extracted_places (
        id             CHAR(26) PRIMARY KEY,
        source_task_id CHAR(26) NOT NULL,
        fingerprint    CHAR(64) NOT NULL UNIQUE,
        name           TEXT NOT NULL,
        address        TEXT NOT NULL,
        city           TEXT NOT NULL,
        category       TEXT NOT NULL,
        rating         DOUBLE PRECISION,
        review_count   BIGINT,
        phone          TEXT,
        website        TEXT,
        latitude       DOUBLE PRECISION,
        longitude      DOUBLE PRECISION,
        extracted_at   TIMESTAMPTZ NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_places_source_task
        ON extracted_places (source_task_id)",
    "CREATE TABLE IF NOT EXISTS extracted_place_reviews (
        id        BIGSERIAL PRIMARY KEY,
        place_id  CHAR(26) NOT NULL REFERENCES extracted_places(id) ON DELETE CASCADE,
        author    TEXT NOT NULL,
        rating    DOUBLE PRECISION NOT NULL,
        text      TEXT NOT NULL,
        posted_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_reviews_place
        ON extracted_place_reviews (place_id)",
];

pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    for statement in MIGRATIONS {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
