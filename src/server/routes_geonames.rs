//! Geonames read endpoints, a thin pass-through over the cached adapter.

use super::{error_response, AppState};
use axum::extract::{Path as AxumPath, Query, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;

pub(super) async fn handler_countries(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.geonames.countries().await {
        Ok(countries) => Json(serde_json::json!({ "countries": countries })).into_response(),
        Err(e) => error_response(&e),
    }
}

pub(super) async fn handler_regions(
    State(state): State<Arc<AppState>>,
    AxumPath(cc): AxumPath<String>,
) -> impl IntoResponse {
    match state.geonames.regions(&cc).await {
        Ok(regions) => Json(serde_json::json!({ "regions": regions })).into_response(),
        Err(e) => error_response(&e),
    }
}

#[derive(Deserialize)]
pub(super) struct ProvincesQuery {
    admin1_code: String,
}

pub(super) async fn handler_provinces(
    State(state): State<Arc<AppState>>,
    AxumPath(cc): AxumPath<String>,
    Query(query): Query<ProvincesQuery>,
) -> impl IntoResponse {
    match state.geonames.provinces(&cc, &query.admin1_code).await {
        Ok(provinces) => Json(serde_json::json!({ "provinces": provinces })).into_response(),
        Err(e) => error_response(&e),
    }
}

#[derive(Deserialize)]
pub(super) struct CitiesQuery {
    admin1_code: Option<String>,
    admin2_code: Option<String>,
    #[serde(default)]
    min_population: i64,
}

pub(super) async fn handler_cities(
    State(state): State<Arc<AppState>>,
    AxumPath(cc): AxumPath<String>,
    Query(query): Query<CitiesQuery>,
) -> impl IntoResponse {
    match state
        .geonames
        .cities(
            &cc,
            query.admin1_code.as_deref(),
            query.admin2_code.as_deref(),
            query.min_population,
        )
        .await
    {
        Ok(cities) => Json(serde_json::json!({ "cities": cities })).into_response(),
        Err(e) => error_response(&e),
    }
}
