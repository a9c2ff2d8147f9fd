//! Shared test helpers for integration tests.

#![allow(dead_code)]

use placehound::config::Settings;
use placehound::db::Database;
use placehound::driver::{Driver, ScriptedDriver};
use placehound::events::EventBus;
use placehound::geonames::GeonamesClient;
use placehound::ids::CampaignId;
use placehound::license::StaticLicense;
use placehound::server::AppState;
use placehound::service::{CampaignService, CreateCampaignRequest};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

/// Returns the test database URL from the `TEST_DATABASE_URL` environment
/// variable, if configured. Storage-backed tests skip themselves otherwise.
pub fn test_db_url() -> Option<String> {
    std::env::var("TEST_DATABASE_URL").ok().filter(|v| !v.is_empty())
}

pub fn has_test_db() -> bool {
    test_db_url().is_some()
}

static SCHEMA_INIT: OnceCell<()> = OnceCell::const_new();

/// Connect to the test database, applying the schema once per test binary.
/// Tests isolate by campaign id instead of truncating shared tables.
pub async fn setup_test_db() -> Database {
    let url = test_db_url().expect("TEST_DATABASE_URL must be set for integration tests");
    let db = Database::connect(&url)
        .await
        .expect("failed to connect to test database");
    let schema_db = db.clone();
    SCHEMA_INIT
        .get_or_init(|| async move {
            schema_db
                .run_migrations()
                .await
                .expect("failed to apply schema");
        })
        .await;
    db
}

/// Spawn a stub geonames service with a fixed Madrid-area city list and
/// return its base URL.
pub async fn mock_geonames() -> String {
    mock_geonames_with(vec![
        (3117735, "Madrid", 3_223_334),
        (3128760, "Alcalá de Henares", 196_888),
    ])
    .await
}

pub async fn mock_geonames_with(cities: Vec<(i64, &str, i64)>) -> String {
    use axum::extract::{Query, State};
    use axum::routing::get;
    use axum::{Json, Router};
    use std::collections::HashMap;

    let cities: Vec<serde_json::Value> = cities
        .into_iter()
        .map(|(geoname_id, name, population)| {
            serde_json::json!({
                "geoname_id": geoname_id,
                "code": name.chars().take(3).collect::<String>().to_uppercase(),
                "name": name,
                "population": population,
            })
        })
        .collect();

    let handler = get(
        move |State(cities): State<Vec<serde_json::Value>>,
              Query(params): Query<HashMap<String, String>>| async move {
            let min_population: i64 = params
                .get("min_population")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            let filtered: Vec<_> = cities
                .into_iter()
                .filter(|c| c["population"].as_i64().unwrap_or(0) >= min_population)
                .collect();
            Json(serde_json::Value::Array(filtered))
        },
    );
    let app = Router::new()
        .route("/countries/{cc}/cities", handler)
        .with_state(cities);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

pub struct TestHarness {
    pub db: Database,
    pub bus: Arc<EventBus>,
    pub service: Arc<CampaignService>,
    pub driver: ScriptedDriver,
}

/// Full service wired to the scripted driver and a stub geonames service.
pub async fn build_harness(driver: ScriptedDriver) -> TestHarness {
    let db = setup_test_db().await;
    let bus = EventBus::new();
    let geonames_url = mock_geonames().await;
    let geonames = Arc::new(GeonamesClient::new(&geonames_url));
    let mut settings = Settings::default();
    settings.snapshot_interval = Duration::from_millis(50);
    let service = CampaignService::new(
        db.clone(),
        Arc::clone(&bus),
        geonames,
        Arc::new(driver.clone()) as Arc<dyn Driver>,
        Arc::new(StaticLicense::allow_all()),
        settings,
    );
    TestHarness {
        db,
        bus,
        service,
        driver,
    }
}

/// Router over the harness, for HTTP-level tests.
pub async fn build_test_app(driver: ScriptedDriver) -> (axum::Router, TestHarness) {
    let harness = build_harness(driver.clone()).await;
    let geonames_url = mock_geonames().await;
    let state = AppState::new(
        harness.db.clone(),
        Arc::clone(&harness.bus),
        Arc::clone(&harness.service),
        Arc::new(GeonamesClient::new(&geonames_url)),
    );
    (placehound::server::build_router(state), harness)
}

pub fn madrid_request() -> CreateCampaignRequest {
    serde_json::from_value(serde_json::json!({
        "activity": "restaurants",
        "country_code": "ES",
        "admin1_code": "MD",
        "location_name": "Comunidad de Madrid",
        "min_population": 15000,
        "extraction_bots": 2
    }))
    .unwrap()
}

/// Poll until the campaign reaches a terminal status (or panic after 15 s).
pub async fn wait_for_settled(db: &Database, id: &CampaignId) -> placehound::domain::Campaign {
    use placehound::domain::CampaignStatus;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        let campaign = db
            .get_campaign(id)
            .await
            .expect("storage readable")
            .expect("campaign exists");
        match campaign.status {
            CampaignStatus::Completed | CampaignStatus::Failed => return campaign,
            _ if tokio::time::Instant::now() > deadline => {
                panic!("campaign {id} never settled, stuck at {:?}", campaign.status)
            }
            _ => tokio::time::sleep(Duration::from_millis(25)).await,
        }
    }
}
