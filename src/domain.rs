//! Campaign, task, and place aggregates.
//!
//! State transitions are guarded here so that illegal ones surface as
//! `Conflict` errors at the boundary instead of corrupting counters or
//! status rows. Value-typed attributes (ids, coordinates) are immutable;
//! mutation of an aggregate happens through its transition methods only.

use crate::error::{Error, Result};
use crate::ids::{CampaignId, PlaceId, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ── Statuses ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CampaignStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Archived,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Pending => "PENDING",
            CampaignStatus::InProgress => "IN_PROGRESS",
            CampaignStatus::Completed => "COMPLETED",
            CampaignStatus::Failed => "FAILED",
            CampaignStatus::Archived => "ARCHIVED",
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        match text {
            "PENDING" => Ok(CampaignStatus::Pending),
            "IN_PROGRESS" => Ok(CampaignStatus::InProgress),
            "COMPLETED" => Ok(CampaignStatus::Completed),
            "FAILED" => Ok(CampaignStatus::Failed),
            "ARCHIVED" => Ok(CampaignStatus::Archived),
            other => Err(Error::Validation(format!("unknown campaign status {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::InProgress => "IN_PROGRESS",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Skipped => "SKIPPED",
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        match text {
            "PENDING" => Ok(TaskStatus::Pending),
            "IN_PROGRESS" => Ok(TaskStatus::InProgress),
            "COMPLETED" => Ok(TaskStatus::Completed),
            "FAILED" => Ok(TaskStatus::Failed),
            "SKIPPED" => Ok(TaskStatus::Skipped),
            other => Err(Error::Validation(format!("unknown task status {other:?}"))),
        }
    }

    /// Terminal states never transition again within a run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Skipped
        )
    }
}

// ── Campaign ────────────────────────────────────────────────────

/// A user-defined extraction job scoped by activity and geography.
#[derive(Debug, Clone)]
pub struct Campaign {
    pub id: CampaignId,
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
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: CampaignStatus,
}

/// Parameters for creating a campaign, already validated at the boundary.
#[derive(Debug, Clone)]
pub struct NewCampaign {
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
}

/// Title snapshot: "Restaurants in Madrid".
pub fn campaign_title(activity: &str, location_name: &str) -> String {
    let mut chars = activity.trim().chars();
    let capitalized = match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    };
    format!("{} in {}", capitalized, location_name.trim())
}

impl Campaign {
    pub fn create(spec: NewCampaign) -> Result<Self> {
        if spec.activity.trim().is_empty() {
            return Err(Error::Validation("activity must not be empty".into()));
        }
        if spec.country_code.trim().len() != 2 {
            return Err(Error::Validation(format!(
                "country_code must be a 2-letter ISO code, got {:?}",
                spec.country_code
            )));
        }
        if spec.max_bots < 1 {
            return Err(Error::Validation("max_bots must be at least 1".into()));
        }
        if spec.max_results < 1 {
            return Err(Error::Validation("max_results must be at least 1".into()));
        }
        Ok(Campaign {
            id: CampaignId::generate(),
            title: campaign_title(&spec.activity, &spec.location_name),
            activity: spec.activity,
            country_code: spec.country_code.to_uppercase(),
            admin1_code: spec.admin1_code,
            admin2_code: spec.admin2_code,
            city_geoname_id: spec.city_geoname_id,
            location_name: spec.location_name,
            iso_language: spec.iso_language,
            locale: spec.locale,
            max_results: spec.max_results,
            min_rating: spec.min_rating,
            min_population: spec.min_population,
            max_bots: spec.max_bots,
            total_tasks: 0,
            completed_tasks: 0,
            failed_tasks: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            status: CampaignStatus::Pending,
        })
    }

    /// Transition to IN_PROGRESS. Legal from PENDING (start) and from
    /// FAILED or a stale IN_PROGRESS (resume).
    pub fn begin(&mut self) -> Result<()> {
        match self.status {
            CampaignStatus::Pending | CampaignStatus::Failed | CampaignStatus::InProgress => {
                self.status = CampaignStatus::InProgress;
                if self.started_at.is_none() {
                    self.started_at = Some(Utc::now());
                }
                self.completed_at = None;
                Ok(())
            }
            other => Err(Error::Conflict(format!(
                "campaign {} cannot start from {}",
                self.id,
                other.as_str()
            ))),
        }
    }

    pub fn record_task_completed(&mut self) {
        self.completed_tasks += 1;
        debug_assert!(self.completed_tasks + self.failed_tasks <= self.total_tasks);
    }

    pub fn record_task_failed(&mut self) {
        self.failed_tasks += 1;
        debug_assert!(self.completed_tasks + self.failed_tasks <= self.total_tasks);
    }

    /// Compute the terminal status from the final task census: COMPLETED iff
    /// every task is COMPLETED or SKIPPED, FAILED iff any task is FAILED and
    /// none are still in flight.
    pub fn finalize(&mut self, statuses: &[TaskStatus]) {
        let any_failed = statuses.iter().any(|s| *s == TaskStatus::Failed);
        let all_settled = statuses
            .iter()
            .all(|s| matches!(s, TaskStatus::Completed | TaskStatus::Skipped));
        if all_settled {
            self.status = CampaignStatus::Completed;
            self.completed_at = Some(Utc::now());
        } else if any_failed {
            let any_in_flight = statuses
                .iter()
                .any(|s| matches!(s, TaskStatus::InProgress));
            if !any_in_flight {
                self.status = CampaignStatus::Failed;
                self.completed_at = Some(Utc::now());
            }
        }
    }

    /// Archive. Legal from COMPLETED and FAILED; idempotent on ARCHIVED.
    pub fn archive(&mut self) -> Result<()> {
        match self.status {
            CampaignStatus::Completed | CampaignStatus::Failed => {
                self.status = CampaignStatus::Archived;
                Ok(())
            }
            CampaignStatus::Archived => Ok(()),
            other => Err(Error::Conflict(format!(
                "campaign {} cannot be archived from {}",
                self.id,
                other.as_str()
            ))),
        }
    }
}

// ── Place extraction task ───────────────────────────────────────

/// One unit of extraction for one city under one campaign.
#[derive(Debug, Clone)]
pub struct PlaceExtractionTask {
    pub id: TaskId,
    pub campaign_id: CampaignId,
    pub geoname_id: i64,
    pub geoname_name: String,
    pub search_seed: String,
    pub status: TaskStatus,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PlaceExtractionTask {
    pub fn new(campaign_id: CampaignId, geoname_id: i64, geoname_name: String, search_seed: String) -> Self {
        PlaceExtractionTask {
            id: TaskId::generate(),
            campaign_id,
            geoname_id,
            geoname_name,
            search_seed,
            status: TaskStatus::Pending,
            attempts: 0,
            last_error: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// Claim the task for execution. Legal from PENDING, and from FAILED when
    /// a resume re-runs it.
    pub fn begin(&mut self) -> Result<()> {
        match self.status {
            TaskStatus::Pending | TaskStatus::Failed => {
                self.status = TaskStatus::InProgress;
                self.attempts += 1;
                if self.started_at.is_none() {
                    self.started_at = Some(Utc::now());
                }
                Ok(())
            }
            other => Err(Error::Conflict(format!(
                "task {} cannot start from {}",
                self.id,
                other.as_str()
            ))),
        }
    }

    pub fn complete(&mut self) -> Result<()> {
        if self.status != TaskStatus::InProgress {
            return Err(Error::Conflict(format!(
                "task {} cannot complete from {}",
                self.id,
                self.status.as_str()
            )));
        }
        self.status = TaskStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.last_error = None;
        Ok(())
    }

    pub fn fail(&mut self, error: &str) -> Result<()> {
        if self.status != TaskStatus::InProgress {
            return Err(Error::Conflict(format!(
                "task {} cannot fail from {}",
                self.id,
                self.status.as_str()
            )));
        }
        self.status = TaskStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.last_error = Some(error.to_string());
        Ok(())
    }

    /// Put a retriable task back in line without losing its attempt count.
    pub fn requeue(&mut self, error: &str) -> Result<()> {
        if self.status != TaskStatus::InProgress {
            return Err(Error::Conflict(format!(
                "task {} cannot requeue from {}",
                self.id,
                self.status.as_str()
            )));
        }
        self.status = TaskStatus::Pending;
        self.last_error = Some(error.to_string());
        Ok(())
    }

    /// Reconcile a task left IN_PROGRESS by a crash or cancellation back to
    /// PENDING; a FAILED task re-enters with a fresh attempt budget.
    pub fn reset_for_resume(&mut self) {
        match self.status {
            TaskStatus::InProgress => {
                self.status = TaskStatus::Pending;
            }
            TaskStatus::Failed => {
                self.attempts = 0;
                self.last_error = None;
            }
            _ => {}
        }
    }
}

// ── Extracted place ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

/// An extracted business record. Uniqueness is the fingerprint over
/// (source task, name, address); duplicates fold on write.
#[derive(Debug, Clone)]
pub struct ExtractedPlace {
    pub id: PlaceId,
    pub source_task_id: TaskId,
    pub fingerprint: String,
    pub name: String,
    pub address: String,
    pub city: String,
    pub category: String,
    pub rating: Option<f64>,
    pub review_count: Option<i64>,
    pub phone: Option<String>,
    pub website: Option<String>,
    pub coordinates: Option<Coordinates>,
    pub extracted_at: DateTime<Utc>,
    pub reviews: Vec<PlaceReview>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlaceReview {
    pub author: String,
    pub rating: f64,
    pub text: String,
    pub posted_at: DateTime<Utc>,
}

/// Deterministic dedup key: SHA-256 over the source task id and the
/// whitespace-trimmed, lowercased name and address.
pub fn place_fingerprint(source_task_id: &TaskId, name: &str, address: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_task_id.to_text().as_bytes());
    hasher.update(b"\n");
    hasher.update(name.trim().to_lowercase().as_bytes());
    hasher.update(b"\n");
    hasher.update(address.trim().to_lowercase().as_bytes());
    hex_string(&hasher.finalize())
}

fn hex_string(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn campaign() -> Campaign {
        Campaign::create(NewCampaign {
            activity: "restaurants".into(),
            country_code: "es".into(),
            admin1_code: Some("MD".into()),
            admin2_code: None,
            city_geoname_id: None,
            location_name: "Madrid".into(),
            iso_language: "es".into(),
            locale: "es-ES".into(),
            max_results: 20,
            min_rating: None,
            min_population: 15_000,
            max_bots: 2,
        })
        .unwrap()
    }

    fn task(campaign_id: CampaignId) -> PlaceExtractionTask {
        PlaceExtractionTask::new(campaign_id, 3117735, "Madrid".into(), "restaurants".into())
    }

    #[test]
    fn title_capitalizes_activity() {
        assert_eq!(campaign_title("restaurants", "Madrid"), "Restaurants in Madrid");
        assert_eq!(campaign_title("  cafés ", " Lyon "), "Cafés in Lyon");
    }

    #[test]
    fn create_normalizes_country_code() {
        let c = campaign();
        assert_eq!(c.country_code, "ES");
        assert_eq!(c.status, CampaignStatus::Pending);
        assert!(c.started_at.is_none());
    }

    #[test]
    fn create_rejects_empty_activity() {
        let err = Campaign::create(NewCampaign {
            activity: "  ".into(),
            ..new_campaign_fixture()
        })
        .unwrap_err();
        assert_eq!(err.code(), "validation_error");
    }

    #[test]
    fn create_rejects_zero_bots() {
        let err = Campaign::create(NewCampaign {
            max_bots: 0,
            ..new_campaign_fixture()
        })
        .unwrap_err();
        assert_eq!(err.code(), "validation_error");
    }

    fn new_campaign_fixture() -> NewCampaign {
        NewCampaign {
            activity: "restaurants".into(),
            country_code: "ES".into(),
            admin1_code: None,
            admin2_code: None,
            city_geoname_id: None,
            location_name: "Madrid".into(),
            iso_language: "es".into(),
            locale: "es-ES".into(),
            max_results: 20,
            min_rating: None,
            min_population: 0,
            max_bots: 3,
        }
    }

    #[test]
    fn campaign_start_is_conflict_when_running() {
        let mut c = campaign();
        c.begin().unwrap();
        assert_eq!(c.status, CampaignStatus::InProgress);
        // begin() itself allows a resume from IN_PROGRESS; the service layer
        // distinguishes start (PENDING only) from resume.
        c.status = CampaignStatus::Completed;
        assert_eq!(c.begin().unwrap_err().code(), "conflict");
    }

    #[test]
    fn campaign_finalize_completed_when_all_settled() {
        let mut c = campaign();
        c.total_tasks = 2;
        c.begin().unwrap();
        c.finalize(&[TaskStatus::Completed, TaskStatus::Skipped]);
        assert_eq!(c.status, CampaignStatus::Completed);
        assert!(c.completed_at.is_some());
    }

    #[test]
    fn campaign_finalize_failed_when_any_failed_and_none_running() {
        let mut c = campaign();
        c.total_tasks = 2;
        c.begin().unwrap();
        c.finalize(&[TaskStatus::Completed, TaskStatus::Failed]);
        assert_eq!(c.status, CampaignStatus::Failed);
    }

    #[test]
    fn campaign_finalize_holds_while_tasks_in_flight() {
        let mut c = campaign();
        c.total_tasks = 2;
        c.begin().unwrap();
        c.finalize(&[TaskStatus::Failed, TaskStatus::InProgress]);
        assert_eq!(c.status, CampaignStatus::InProgress);
    }

    #[test]
    fn archive_is_idempotent() {
        let mut c = campaign();
        c.status = CampaignStatus::Completed;
        c.archive().unwrap();
        assert_eq!(c.status, CampaignStatus::Archived);
        c.archive().unwrap();
        assert_eq!(c.status, CampaignStatus::Archived);
    }

    #[test]
    fn archive_rejects_running_campaign() {
        let mut c = campaign();
        c.begin().unwrap();
        assert_eq!(c.archive().unwrap_err().code(), "conflict");
    }

    #[test]
    fn task_lifecycle_happy_path() {
        let c = campaign();
        let mut t = task(c.id.clone());
        t.begin().unwrap();
        assert_eq!(t.status, TaskStatus::InProgress);
        assert_eq!(t.attempts, 1);
        assert!(t.started_at.is_some());
        t.complete().unwrap();
        assert_eq!(t.status, TaskStatus::Completed);
        assert!(t.completed_at.is_some());
        assert!(t.last_error.is_none());
    }

    #[test]
    fn task_requeue_preserves_attempts() {
        let c = campaign();
        let mut t = task(c.id.clone());
        t.begin().unwrap();
        t.requeue("navigation timed out").unwrap();
        assert_eq!(t.status, TaskStatus::Pending);
        assert_eq!(t.attempts, 1);
        t.begin().unwrap();
        assert_eq!(t.attempts, 2);
    }

    #[test]
    fn task_cannot_complete_twice() {
        let c = campaign();
        let mut t = task(c.id.clone());
        t.begin().unwrap();
        t.complete().unwrap();
        assert_eq!(t.complete().unwrap_err().code(), "conflict");
    }

    #[test]
    fn task_failed_can_begin_again_on_resume() {
        let c = campaign();
        let mut t = task(c.id.clone());
        t.begin().unwrap();
        t.fail("selector missing").unwrap();
        t.reset_for_resume();
        assert_eq!(t.status, TaskStatus::Failed);
        assert_eq!(t.attempts, 0);
        t.begin().unwrap();
        assert_eq!(t.status, TaskStatus::InProgress);
    }

    #[test]
    fn reset_for_resume_reconciles_in_progress_to_pending() {
        let c = campaign();
        let mut t = task(c.id.clone());
        t.begin().unwrap();
        t.reset_for_resume();
        assert_eq!(t.status, TaskStatus::Pending);
    }

    #[test]
    fn reset_for_resume_leaves_completed_alone() {
        let c = campaign();
        let mut t = task(c.id.clone());
        t.begin().unwrap();
        t.complete().unwrap();
        t.reset_for_resume();
        assert_eq!(t.status, TaskStatus::Completed);
    }

    #[test]
    fn fingerprint_is_deterministic_and_normalized() {
        let tid = TaskId::generate();
        let a = place_fingerprint(&tid, "Casa Lucio", "Calle Cava Baja 35");
        let b = place_fingerprint(&tid, "  casa lucio ", "CALLE CAVA BAJA 35  ");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn fingerprint_differs_across_tasks() {
        let a = place_fingerprint(&TaskId::generate(), "Casa Lucio", "Calle Cava Baja 35");
        let b = place_fingerprint(&TaskId::generate(), "Casa Lucio", "Calle Cava Baja 35");
        assert_ne!(a, b);
    }

    #[test]
    fn counters_track_task_outcomes() {
        let mut c = campaign();
        c.total_tasks = 3;
        c.record_task_completed();
        c.record_task_completed();
        c.record_task_failed();
        assert_eq!(c.completed_tasks, 2);
        assert_eq!(c.failed_tasks, 1);
        assert!(c.completed_tasks + c.failed_tasks <= c.total_tasks);
    }
}
