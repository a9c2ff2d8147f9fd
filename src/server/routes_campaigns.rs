//! Campaign CRUD and lifecycle verbs.

use super::{error_response, AppState};
use crate::error::Error;
use crate::ids::CampaignId;
use crate::service::CreateCampaignRequest;
use crate::wire;
use axum::extract::{Path as AxumPath, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use std::sync::Arc;

fn parse_id(raw: &str) -> Result<CampaignId, Error> {
    raw.parse()
        .map_err(|e| Error::Validation(format!("bad campaign id {raw:?}: {e}")))
}

pub(super) async fn handler_list(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.service.list().await {
        Ok(campaigns) => {
            let wires: Vec<_> = campaigns.iter().map(wire::campaign_to_wire).collect();
            Json(serde_json::json!({ "campaigns": wires })).into_response()
        }
        Err(e) => error_response(&e),
    }
}

pub(super) async fn handler_create(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateCampaignRequest>,
) -> impl IntoResponse {
    match state.service.create(payload).await {
        Ok(campaign) => (
            StatusCode::CREATED,
            Json(serde_json::json!({
                "campaign_id": campaign.id.to_text(),
                "title": campaign.title,
                "status": campaign.status.as_str(),
                "total_tasks": campaign.total_tasks,
                "created_at": wire::format_timestamp(&campaign.created_at),
            })),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

pub(super) async fn handler_get(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> impl IntoResponse {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(e) => return error_response(&e),
    };
    match state.service.get(&id).await {
        Ok(campaign) => Json(wire::campaign_to_wire(&campaign)).into_response(),
        Err(e) => error_response(&e),
    }
}

pub(super) async fn handler_places(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> impl IntoResponse {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(e) => return error_response(&e),
    };
    match state.service.places_of(&id).await {
        Ok(places) => {
            let wires: Vec<_> = places.iter().map(wire::place_to_wire).collect();
            Json(serde_json::json!({ "places": wires })).into_response()
        }
        Err(e) => error_response(&e),
    }
}

pub(super) async fn handler_tasks(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> impl IntoResponse {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(e) => return error_response(&e),
    };
    match state.service.tasks_of(&id).await {
        Ok(tasks) => {
            let wires: Vec<_> = tasks.iter().map(wire::task_to_wire).collect();
            Json(serde_json::json!({ "tasks": wires })).into_response()
        }
        Err(e) => error_response(&e),
    }
}

pub(super) async fn handler_start(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> impl IntoResponse {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(e) => return error_response(&e),
    };
    match state.service.start(&id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(&e),
    }
}

pub(super) async fn handler_resume(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> impl IntoResponse {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(e) => return error_response(&e),
    };
    match state.service.resume(&id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(&e),
    }
}

pub(super) async fn handler_archive(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> impl IntoResponse {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(e) => return error_response(&e),
    };
    match state.service.archive(&id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(&e),
    }
}
