//! # Server — HTTP API and the Extraction Stream
//!
//! Runs the Axum server: campaign CRUD and lifecycle verbs, geonames read
//! endpoints, health probes, and the `/ws/extraction/stream` gateway.

mod routes_campaigns;
mod routes_geonames;
mod routes_health;
pub mod outbound;
mod websocket;

use crate::db::Database;
use crate::error::Error;
use crate::events::EventBus;
use crate::geonames::GeonamesClient;
use crate::service::CampaignService;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;
use std::time::Duration;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const BODY_LIMIT_BYTES: usize = 256 * 1024;

pub struct AppState {
    pub db: Database,
    pub bus: Arc<EventBus>,
    pub service: Arc<CampaignService>,
    pub geonames: Arc<GeonamesClient>,
}

impl AppState {
    pub fn new(
        db: Database,
        bus: Arc<EventBus>,
        service: Arc<CampaignService>,
        geonames: Arc<GeonamesClient>,
    ) -> Arc<Self> {
        Arc::new(AppState {
            db,
            bus,
            service,
            geonames,
        })
    }
}

/// Stable HTTP rendering for the error taxonomy: `{detail, code}` and a
/// status that matches the class. Stack traces never cross here.
pub(crate) fn error_response(err: &Error) -> Response {
    let status = match err {
        Error::Validation(_) | Error::Protocol(_) => StatusCode::BAD_REQUEST,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Conflict(_) => StatusCode::CONFLICT,
        Error::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
        Error::Permanent(_) | Error::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(serde_json::json!({ "detail": err.to_string(), "code": err.code() })),
    )
        .into_response()
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws/extraction/stream", get(websocket::handler_ws))
        .route("/healthz", get(routes_health::handler_healthz))
        .route("/readyz", get(routes_health::handler_readyz))
        .route(
            "/api/geonames/countries",
            get(routes_geonames::handler_countries),
        )
        .route(
            "/api/geonames/countries/{cc}/regions",
            get(routes_geonames::handler_regions),
        )
        .route(
            "/api/geonames/countries/{cc}/provinces",
            get(routes_geonames::handler_provinces),
        )
        .route(
            "/api/geonames/countries/{cc}/cities",
            get(routes_geonames::handler_cities),
        )
        .route(
            "/api/campaigns",
            get(routes_campaigns::handler_list).post(routes_campaigns::handler_create),
        )
        .route(
            "/api/campaigns/{id}",
            get(routes_campaigns::handler_get),
        )
        .route(
            "/api/campaigns/{id}/places",
            get(routes_campaigns::handler_places),
        )
        .route(
            "/api/campaigns/{id}/tasks",
            get(routes_campaigns::handler_tasks),
        )
        .route(
            "/api/campaigns/{id}/start",
            post(routes_campaigns::handler_start),
        )
        .route(
            "/api/campaigns/{id}/resume",
            post(routes_campaigns::handler_resume),
        )
        .route(
            "/api/campaigns/{id}/archive",
            post(routes_campaigns::handler_archive),
        )
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT_BYTES))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
