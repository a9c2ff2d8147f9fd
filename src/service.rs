//! # Campaign Service — Lifecycle and Run Registry
//!
//! Creation resolves the geographic scope into a concrete city list and
//! materializes the campaign plus its per-city tasks under one unit of work.
//! `start`, `pause`, `cancel`, and `resume` manage live orchestrator runs
//! through an in-process registry keyed by campaign id; the read side
//! delegates straight to storage.

use crate::config::Settings;
use crate::db::{CampaignStatistics, Database};
use crate::domain::{Campaign, CampaignStatus, ExtractedPlace, NewCampaign, PlaceExtractionTask};
use crate::driver::Driver;
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::geonames::GeonamesClient;
use crate::ids::CampaignId;
use crate::license::LicenseValidator;
use crate::orchestrator::{CancelFlag, Orchestrator};
use crate::pool::{BotPool, PoolStats};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{error, info};

/// Campaign creation payload, shared by the HTTP route and the WebSocket
/// `start_extraction {spec}` command. `extraction_bots` is the canonical bot
/// count key; `num_bots` is accepted as a legacy alias.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateCampaignRequest {
    pub activity: String,
    pub country_code: String,
    #[serde(default)]
    pub admin1_code: Option<String>,
    #[serde(default)]
    pub admin2_code: Option<String>,
    #[serde(default)]
    pub city_geoname_id: Option<i64>,
    #[serde(default)]
    pub iso_language: Option<String>,
    pub location_name: String,
    #[serde(default)]
    pub min_population: Option<i64>,
    #[serde(default)]
    pub locale: Option<String>,
    #[serde(default)]
    pub max_results: Option<i32>,
    #[serde(default)]
    pub min_rating: Option<f64>,
    #[serde(default, alias = "num_bots")]
    pub extraction_bots: Option<i32>,
}

/// Map a request onto validated campaign parameters, filling defaults.
fn new_campaign_from_request(request: &CreateCampaignRequest, defaults: &Settings) -> NewCampaign {
    let iso_language = request
        .iso_language
        .clone()
        .unwrap_or_else(|| "en".to_string());
    let locale = request.locale.clone().unwrap_or_else(|| {
        format!("{}-{}", iso_language, request.country_code.to_uppercase())
    });
    NewCampaign {
        activity: request.activity.clone(),
        country_code: request.country_code.clone(),
        admin1_code: request.admin1_code.clone(),
        admin2_code: request.admin2_code.clone(),
        city_geoname_id: request.city_geoname_id,
        location_name: request.location_name.clone(),
        iso_language,
        locale,
        max_results: request.max_results.unwrap_or(20),
        min_rating: request.min_rating,
        min_population: request.min_population.unwrap_or(0),
        max_bots: request.extraction_bots.unwrap_or(defaults.max_bots_default),
    }
}

/// How a cooperative stop should settle the campaign row once the workers
/// have exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopMode {
    Pause,
    Cancel,
}

struct RunState {
    cancel: CancelFlag,
    pool: Arc<BotPool>,
    stop_mode: Mutex<Option<StopMode>>,
}

pub struct CampaignService {
    db: Database,
    bus: Arc<EventBus>,
    geonames: Arc<GeonamesClient>,
    driver: Arc<dyn Driver>,
    license: Arc<dyn LicenseValidator>,
    settings: Settings,
    runs: Mutex<HashMap<String, Arc<RunState>>>,
}

impl CampaignService {
    pub fn new(
        db: Database,
        bus: Arc<EventBus>,
        geonames: Arc<GeonamesClient>,
        driver: Arc<dyn Driver>,
        license: Arc<dyn LicenseValidator>,
        settings: Settings,
    ) -> Arc<Self> {
        Arc::new(CampaignService {
            db,
            bus,
            geonames,
            driver,
            license,
            settings,
            runs: Mutex::new(HashMap::new()),
        })
    }

    // ── Creation ────────────────────────────────────────────────

    /// Resolve the scope, auto-title the campaign, and materialize it with
    /// its task set atomically. Returns the persisted campaign.
    pub async fn create(&self, request: CreateCampaignRequest) -> Result<Campaign> {
        if matches!(request.extraction_bots, Some(bots) if bots < 1) {
            return Err(Error::Validation("extraction_bots must be at least 1".into()));
        }
        let spec = new_campaign_from_request(&request, &self.settings);
        let mut campaign = Campaign::create(spec)?;
        let cities = self
            .geonames
            .resolve_scope(
                &campaign.country_code,
                campaign.admin1_code.as_deref(),
                campaign.admin2_code.as_deref(),
                campaign.city_geoname_id,
                campaign.min_population,
            )
            .await?;
        campaign.total_tasks = cities.len() as i64;

        let tasks: Vec<PlaceExtractionTask> = cities
            .into_iter()
            .map(|city| {
                PlaceExtractionTask::new(
                    campaign.id.clone(),
                    city.geoname_id,
                    city.name,
                    campaign.activity.clone(),
                )
            })
            .collect();

        let mut uow = self.db.begin().await?;
        uow.campaigns().save(&campaign).await?;
        for task in &tasks {
            uow.tasks().save(task).await?;
        }
        uow.commit().await?;
        info!(campaign = %campaign.id, tasks = tasks.len(), "campaign created");
        Ok(campaign)
    }

    // ── Lifecycle ───────────────────────────────────────────────

    /// Spawn an orchestrator run. Legal only from PENDING.
    pub async fn start(self: &Arc<Self>, id: &CampaignId) -> Result<()> {
        self.license.validate()?;
        let campaign = self.require_campaign(id).await?;
        if campaign.status != CampaignStatus::Pending {
            return Err(Error::Conflict(format!(
                "campaign {id} cannot start from {}",
                campaign.status.as_str()
            )));
        }
        self.spawn_run(id)
    }

    /// Reconcile tasks left behind by a crash, pause, or failure, then start
    /// the remainder. Legal unless the campaign is COMPLETED or ARCHIVED.
    pub async fn resume(self: &Arc<Self>, id: &CampaignId) -> Result<()> {
        self.license.validate()?;
        let campaign = self.require_campaign(id).await?;
        if matches!(
            campaign.status,
            CampaignStatus::Completed | CampaignStatus::Archived
        ) {
            return Err(Error::Conflict(format!(
                "campaign {id} cannot resume from {}",
                campaign.status.as_str()
            )));
        }
        if self.run_state(id).is_some() {
            return Err(Error::Conflict(format!("campaign {id} is already running")));
        }

        let mut uow = self.db.begin().await?;
        let tasks = uow.tasks().all_of(id).await?;
        for mut task in tasks {
            let before = (task.status, task.attempts);
            task.reset_for_resume();
            if before != (task.status, task.attempts) {
                uow.tasks().save(&task).await?;
            }
        }
        uow.commit().await?;
        self.spawn_run(id)
    }

    /// Cooperative stop that settles the campaign back to PENDING.
    pub fn pause(&self, id: &CampaignId) -> Result<()> {
        self.request_stop(id, StopMode::Pause)
    }

    /// Cooperative stop that settles the campaign as FAILED.
    pub fn cancel(&self, id: &CampaignId) -> Result<()> {
        self.request_stop(id, StopMode::Cancel)
    }

    /// Archive a settled campaign. Idempotent on ARCHIVED; places and tasks
    /// remain queryable.
    pub async fn archive(&self, id: &CampaignId) -> Result<()> {
        let mut uow = self.db.begin().await?;
        let mut campaign = uow.campaigns().get(id).await?;
        campaign.archive()?;
        uow.campaigns().save(&campaign).await?;
        uow.commit().await?;
        Ok(())
    }

    // ── Read side ───────────────────────────────────────────────

    pub async fn list(&self) -> Result<Vec<Campaign>> {
        self.db.list_campaigns().await
    }

    pub async fn get(&self, id: &CampaignId) -> Result<Campaign> {
        self.require_campaign(id).await
    }

    pub async fn places_of(&self, id: &CampaignId) -> Result<Vec<ExtractedPlace>> {
        self.require_campaign(id).await?;
        self.db.places_of_campaign(id).await
    }

    pub async fn tasks_of(&self, id: &CampaignId) -> Result<Vec<PlaceExtractionTask>> {
        self.require_campaign(id).await?;
        self.db.tasks_of_campaign(id).await
    }

    pub async fn statistics_of(&self, id: &CampaignId) -> Result<CampaignStatistics> {
        self.require_campaign(id).await?;
        self.db.campaign_statistics(id).await
    }

    pub fn is_running(&self, id: &CampaignId) -> bool {
        self.run_state(id).is_some()
    }

    /// Pool census per live run, for `get_bot_info`.
    pub fn bot_info(&self) -> Vec<(CampaignId, PoolStats)> {
        let runs = self.runs.lock().unwrap_or_else(|p| p.into_inner());
        runs.iter()
            .filter_map(|(id, state)| {
                id.parse()
                    .ok()
                    .map(|campaign_id| (campaign_id, state.pool.stats()))
            })
            .collect()
    }

    // ── Internals ───────────────────────────────────────────────

    async fn require_campaign(&self, id: &CampaignId) -> Result<Campaign> {
        self.db
            .get_campaign(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("campaign {id}")))
    }

    fn run_state(&self, id: &CampaignId) -> Option<Arc<RunState>> {
        self.runs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&id.to_text())
            .cloned()
    }

    fn request_stop(&self, id: &CampaignId, mode: StopMode) -> Result<()> {
        let state = self
            .run_state(id)
            .ok_or_else(|| Error::Conflict(format!("campaign {id} is not running")))?;
        *state.stop_mode.lock().unwrap_or_else(|p| p.into_inner()) = Some(mode);
        state.cancel.cancel();
        Ok(())
    }

    fn spawn_run(self: &Arc<Self>, id: &CampaignId) -> Result<()> {
        let mut runs = self.runs.lock().unwrap_or_else(|p| p.into_inner());
        if runs.contains_key(&id.to_text()) {
            return Err(Error::Conflict(format!("campaign {id} is already running")));
        }
        let cancel = CancelFlag::new();
        let pool = Arc::new(BotPool::new(
            Arc::clone(&self.driver),
            Arc::clone(&self.bus),
            id.clone(),
        ));
        let state = Arc::new(RunState {
            cancel: cancel.clone(),
            pool: Arc::clone(&pool),
            stop_mode: Mutex::new(None),
        });
        runs.insert(id.to_text(), Arc::clone(&state));
        drop(runs);

        let service = Arc::clone(self);
        let campaign_id = id.clone();
        tokio::spawn(async move {
            let orchestrator = Orchestrator::new(
                service.db.clone(),
                Arc::clone(&service.bus),
                service.settings.snapshot_interval,
            );
            let result = orchestrator.run(&campaign_id, pool, cancel.clone()).await;
            match result {
                Ok(()) => {
                    if cancel.is_cancelled() {
                        let mode = state
                            .stop_mode
                            .lock()
                            .unwrap_or_else(|p| p.into_inner())
                            .unwrap_or(StopMode::Cancel);
                        if let Err(err) = service.settle_stopped(&campaign_id, mode).await {
                            error!(campaign = %campaign_id, error = %err, "could not settle stopped campaign");
                        }
                    }
                }
                Err(err) => {
                    error!(campaign = %campaign_id, error = %err, "extraction run failed");
                }
            }
            service
                .runs
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .remove(&campaign_id.to_text());
        });
        Ok(())
    }

    /// Apply the requested stop mode once the workers have exited.
    async fn settle_stopped(&self, id: &CampaignId, mode: StopMode) -> Result<()> {
        let mut uow = self.db.begin().await?;
        let mut campaign = uow.campaigns().get(id).await?;
        match mode {
            StopMode::Pause => {
                campaign.status = CampaignStatus::Pending;
            }
            StopMode::Cancel => {
                campaign.status = CampaignStatus::Failed;
                campaign.completed_at = Some(chrono::Utc::now());
            }
        }
        uow.campaigns().save(&campaign).await?;
        uow.commit().await?;
        info!(campaign = %id, mode = ?mode, "stopped campaign settled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> CreateCampaignRequest {
        serde_json::from_value(serde_json::json!({
            "activity": "restaurants",
            "country_code": "ES",
            "admin1_code": "MD",
            "location_name": "Madrid",
            "min_population": 15000
        }))
        .unwrap()
    }

    #[test]
    fn defaults_fill_in_from_settings() {
        let spec = new_campaign_from_request(&request(), &Settings::default());
        assert_eq!(spec.iso_language, "en");
        assert_eq!(spec.locale, "en-ES");
        assert_eq!(spec.max_results, 20);
        assert_eq!(spec.max_bots, 3);
        assert_eq!(spec.min_population, 15_000);
    }

    #[test]
    fn explicit_locale_wins_over_derived() {
        let mut req = request();
        req.iso_language = Some("es".into());
        req.locale = Some("es-ES".into());
        let spec = new_campaign_from_request(&req, &Settings::default());
        assert_eq!(spec.locale, "es-ES");
    }

    #[test]
    fn num_bots_alias_is_accepted() {
        let req: CreateCampaignRequest = serde_json::from_value(serde_json::json!({
            "activity": "cafes",
            "country_code": "FR",
            "location_name": "Lyon",
            "num_bots": 5
        }))
        .unwrap();
        assert_eq!(req.extraction_bots, Some(5));
    }

    #[test]
    fn extraction_bots_is_the_canonical_key() {
        let req: CreateCampaignRequest = serde_json::from_value(serde_json::json!({
            "activity": "cafes",
            "country_code": "FR",
            "location_name": "Lyon",
            "extraction_bots": 2
        }))
        .unwrap();
        assert_eq!(req.extraction_bots, Some(2));
    }
}
