//! Place-extraction task rows.

use super::{Database, TaskRow};
use crate::domain::{PlaceExtractionTask, TaskStatus};
use crate::error::{Error, Result};
use crate::ids::{CampaignId, TaskId};
use sqlx::{Postgres, Transaction};

const TASK_COLUMNS: &str = "id, campaign_id, geoname_id, geoname_name, search_seed, status, \
     attempts, last_error, started_at, completed_at";

pub struct TaskRepo<'a> {
    tx: &'a mut Transaction<'static, Postgres>,
}

impl<'a> TaskRepo<'a> {
    pub(super) fn new(tx: &'a mut Transaction<'static, Postgres>) -> Self {
        TaskRepo { tx }
    }

    /// Load a task for update within this transaction.
    pub async fn get(&mut self, id: &TaskId) -> Result<PlaceExtractionTask> {
        let query = format!(
            "SELECT {TASK_COLUMNS} FROM place_extraction_tasks WHERE id = $1 FOR UPDATE"
        );
        let row = sqlx::query_as::<_, TaskRow>(&query)
            .bind(id.to_text())
            .fetch_optional(&mut **self.tx)
            .await?
            .ok_or_else(|| Error::NotFound(format!("task {id}")))?;
        row.into_domain()
    }

    /// Upsert by id.
    pub async fn save(&mut self, task: &PlaceExtractionTask) -> Result<()> {
        sqlx::query(
            "INSERT INTO place_extraction_tasks
                 (id, campaign_id, geoname_id, geoname_name, search_seed, status,
                  attempts, last_error, started_at, completed_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             ON CONFLICT (id) DO UPDATE SET
                 status = EXCLUDED.status,
                 attempts = EXCLUDED.attempts,
                 last_error = EXCLUDED.last_error,
                 started_at = EXCLUDED.started_at,
                 completed_at = EXCLUDED.completed_at",
        )
        .bind(task.id.to_text())
        .bind(task.campaign_id.to_text())
        .bind(task.geoname_id)
        .bind(&task.geoname_name)
        .bind(&task.search_seed)
        .bind(task.status.as_str())
        .bind(task.attempts)
        .bind(&task.last_error)
        .bind(task.started_at)
        .bind(task.completed_at)
        .execute(&mut **self.tx)
        .await?;
        Ok(())
    }

    /// Ids of every task the orchestrator still has to run, in id (creation)
    /// order. FAILED tasks are included only when a resume re-runs them.
    pub async fn pending_tasks_of(&mut self, campaign_id: &CampaignId) -> Result<Vec<TaskId>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT id FROM place_extraction_tasks
             WHERE campaign_id = $1 AND status IN ('PENDING', 'FAILED')
             ORDER BY id",
        )
        .bind(campaign_id.to_text())
        .fetch_all(&mut **self.tx)
        .await?;
        rows.into_iter()
            .map(|(id,)| {
                id.parse()
                    .map_err(|e| Error::Fatal(format!("bad task id in storage: {e}")))
            })
            .collect()
    }

    /// Every task of the campaign, loaded for reconciliation on resume.
    pub async fn all_of(&mut self, campaign_id: &CampaignId) -> Result<Vec<PlaceExtractionTask>> {
        let query = format!(
            "SELECT {TASK_COLUMNS} FROM place_extraction_tasks
             WHERE campaign_id = $1 ORDER BY id FOR UPDATE"
        );
        let rows = sqlx::query_as::<_, TaskRow>(&query)
            .bind(campaign_id.to_text())
            .fetch_all(&mut **self.tx)
            .await?;
        rows.into_iter().map(TaskRow::into_domain).collect()
    }

    /// The status census the final campaign state is computed from.
    pub async fn statuses_of(&mut self, campaign_id: &CampaignId) -> Result<Vec<TaskStatus>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT status FROM place_extraction_tasks WHERE campaign_id = $1",
        )
        .bind(campaign_id.to_text())
        .fetch_all(&mut **self.tx)
        .await?;
        rows.into_iter()
            .map(|(status,)| TaskStatus::parse(&status))
            .collect()
    }
}

// ── Read side ───────────────────────────────────────────────────

impl Database {
    pub async fn tasks_of_campaign(
        &self,
        campaign_id: &CampaignId,
    ) -> Result<Vec<PlaceExtractionTask>> {
        let query = format!(
            "SELECT {TASK_COLUMNS} FROM place_extraction_tasks
             WHERE campaign_id = $1 ORDER BY id"
        );
        let rows = sqlx::query_as::<_, TaskRow>(&query)
            .bind(campaign_id.to_text())
            .fetch_all(self.pool())
            .await?;
        rows.into_iter().map(TaskRow::into_domain).collect()
    }
}
