//! Campaign rows: the write-side repository plus the read-side queries.

use super::{CampaignRow, CampaignStatistics, Database};
use crate::domain::Campaign;
use crate::error::{Error, Result};
use crate::ids::CampaignId;
use sqlx::{Postgres, Transaction};

const CAMPAIGN_COLUMNS: &str = "id, title, activity, country_code, admin1_code, admin2_code, \
     city_geoname_id, location_name, iso_language, locale, max_results, min_rating, \
     min_population, max_bots, total_tasks, completed_tasks, failed_tasks, \
     created_at, started_at, completed_at, status";

pub struct CampaignRepo<'a> {
    tx: &'a mut Transaction<'static, Postgres>,
}

impl<'a> CampaignRepo<'a> {
    pub(super) fn new(tx: &'a mut Transaction<'static, Postgres>) -> Self {
        CampaignRepo { tx }
    }

    /// Load a campaign for update within this transaction.
    pub async fn get(&mut self, id: &CampaignId) -> Result<Campaign> {
        let query = format!(
            "SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE id = $1 FOR UPDATE"
        );
        let row = sqlx::query_as::<_, CampaignRow>(&query)
            .bind(id.to_text())
            .fetch_optional(&mut **self.tx)
            .await?
            .ok_or_else(|| Error::NotFound(format!("campaign {id}")))?;
        row.into_domain()
    }

    /// Upsert by id.
    pub async fn save(&mut self, campaign: &Campaign) -> Result<()> {
        sqlx::query(
            "INSERT INTO campaigns (id, title, activity, country_code, admin1_code, admin2_code,
                 city_geoname_id, location_name, iso_language, locale, max_results, min_rating,
                 min_population, max_bots, total_tasks, completed_tasks, failed_tasks,
                 created_at, started_at, completed_at, status)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                 $18, $19, $20, $21)
             ON CONFLICT (id) DO UPDATE SET
                 title = EXCLUDED.title,
                 total_tasks = EXCLUDED.total_tasks,
                 completed_tasks = EXCLUDED.completed_tasks,
                 failed_tasks = EXCLUDED.failed_tasks,
                 started_at = EXCLUDED.started_at,
                 completed_at = EXCLUDED.completed_at,
                 status = EXCLUDED.status",
        )
        .bind(campaign.id.to_text())
        .bind(&campaign.title)
        .bind(&campaign.activity)
        .bind(&campaign.country_code)
        .bind(&campaign.admin1_code)
        .bind(&campaign.admin2_code)
        .bind(campaign.city_geoname_id)
        .bind(&campaign.location_name)
        .bind(&campaign.iso_language)
        .bind(&campaign.locale)
        .bind(campaign.max_results)
        .bind(campaign.min_rating)
        .bind(campaign.min_population)
        .bind(campaign.max_bots)
        .bind(campaign.total_tasks)
        .bind(campaign.completed_tasks)
        .bind(campaign.failed_tasks)
        .bind(campaign.created_at)
        .bind(campaign.started_at)
        .bind(campaign.completed_at)
        .bind(campaign.status.as_str())
        .execute(&mut **self.tx)
        .await?;
        Ok(())
    }
}

// ── Read side ───────────────────────────────────────────────────

impl Database {
    pub async fn get_campaign(&self, id: &CampaignId) -> Result<Option<Campaign>> {
        let query = format!("SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE id = $1");
        let row = sqlx::query_as::<_, CampaignRow>(&query)
            .bind(id.to_text())
            .fetch_optional(self.pool())
            .await?;
        row.map(CampaignRow::into_domain).transpose()
    }

    /// All campaigns, newest first (ids are time-ordered).
    pub async fn list_campaigns(&self) -> Result<Vec<Campaign>> {
        let query = format!("SELECT {CAMPAIGN_COLUMNS} FROM campaigns ORDER BY id DESC");
        let rows = sqlx::query_as::<_, CampaignRow>(&query)
            .fetch_all(self.pool())
            .await?;
        rows.into_iter().map(CampaignRow::into_domain).collect()
    }

    /// Aggregate task and place counts for one campaign.
    pub async fn campaign_statistics(&self, id: &CampaignId) -> Result<CampaignStatistics> {
        let stats = sqlx::query_as::<_, CampaignStatistics>(
            "SELECT
                COUNT(*) AS total_tasks,
                COUNT(*) FILTER (WHERE status = 'PENDING') AS pending_tasks,
                COUNT(*) FILTER (WHERE status = 'IN_PROGRESS') AS in_progress_tasks,
                COUNT(*) FILTER (WHERE status = 'COMPLETED') AS completed_tasks,
                COUNT(*) FILTER (WHERE status = 'FAILED') AS failed_tasks,
                COUNT(*) FILTER (WHERE status = 'SKIPPED') AS skipped_tasks,
                (SELECT COUNT(*) FROM extracted_places p
                  WHERE p.source_task_id IN
                    (SELECT t.id FROM place_extraction_tasks t WHERE t.campaign_id = $1)
                ) AS places_extracted
             FROM place_extraction_tasks WHERE campaign_id = $1",
        )
        .bind(id.to_text())
        .fetch_one(self.pool())
        .await?;
        Ok(stats)
    }
}
