use super::models::{FeatureRecord, GeoQuery, Location, TimeWindow};
use crate::common::state::AppState;
use crate::error::{ErrorBody, PipelineError};
use axum::{
    Json,
    extract::{Query, State},
};
use chrono::NaiveDate;
use serde::Deserialize;
use tracing::{error, info};
use utoipa::IntoParams;
use utoipa_axum::{router::OpenApiRouter, routes};

pub fn router(state: &AppState) -> OpenApiRouter {
    OpenApiRouter::new()
        .routes(routes!(get_features))
        .with_state(state.clone())
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct FeatureParams {
    /// Latitude in degrees, [-90, 90]
    lat: f64,
    /// Longitude in degrees, [-180, 180]
    lon: f64,
    start_date: NaiveDate,
    end_date: NaiveDate,
    collection: Option<String>,
    /// Comma-separated asset keys, e.g. `red,nir08`
    bands: Option<String>,
    cloud_cover_max: Option<f64>,
    limit: Option<usize>,
    patch_size: Option<usize>,
}

impl FeatureParams {
    fn bands(&self) -> Vec<String> {
        self.bands
            .as_deref()
            .map(|bands| {
                bands
                    .split(',')
                    .map(|band| band.trim().to_string())
                    .filter(|band| !band.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[utoipa::path(
    get,
    path = "/",
    params(FeatureParams),
    responses(
        (status = 200, description = "Feature record for the location and window", body = Object),
        (status = 400, description = "Invalid query", body = ErrorBody),
        (status = 404, description = "No scenes match the query", body = ErrorBody),
        (status = 422, description = "No scene could be assembled", body = ErrorBody),
        (status = 503, description = "Scene catalog unavailable", body = ErrorBody),
        (status = 500, description = "Internal server error", body = ErrorBody)
    ),
    summary = "Get features for a location",
    description = "Returns spectral indices and environmental covariates for the best scene in the window, served from the feature cache when available."
)]
pub async fn get_features(
    State(state): State<AppState>,
    Query(params): Query<FeatureParams>,
) -> Result<Json<FeatureRecord>, PipelineError> {
    let settings = state.pipeline.settings();
    let collection = params
        .collection
        .clone()
        .unwrap_or_else(|| state.config.default_collection.clone());
    let query = GeoQuery::new(
        Location {
            latitude: params.lat,
            longitude: params.lon,
        },
        TimeWindow::new(params.start_date, params.end_date),
        &collection,
    )
    .with_cloud_cover_max(params.cloud_cover_max.unwrap_or(settings.cloud_cover_max))
    .with_result_limit(params.limit.unwrap_or(settings.result_limit));
    let patch_size = params.patch_size.unwrap_or(settings.patch_size);

    match state.pipeline.prepare(&query, &params.bands(), patch_size).await {
        Ok(record) => {
            info!(
                endpoint = "features",
                scene_id = %record.scene_id,
                cache_key = %record.cache_key,
                "Served feature record"
            );
            Ok(Json(record))
        }
        Err(e) => {
            error!(
                endpoint = "features",
                component = e.component(),
                status = e.status_code().as_u16(),
                error = %e,
                "Feature request failed"
            );
            Err(e)
        }
    }
}
