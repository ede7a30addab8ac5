//! Error taxonomy for the feature-extraction pipeline.
//!
//! Every variant names the component it originates from and the key fields
//! (band, scene id or query parameter) needed to act on it.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("SceneCatalogClient: invalid query, {field}: {reason}")]
    InvalidQuery { field: &'static str, reason: String },

    #[error("SceneCatalogClient: catalog unavailable after {attempts} attempt(s): {reason}")]
    CatalogUnavailable { attempts: usize, reason: String },

    #[error("BandStackAssembler: scene {scene_id} has no asset for band {band}")]
    MissingBand { scene_id: String, band: String },

    #[error(
        "BandStackAssembler: scene {scene_id} band {band} is in {found}, expected {expected}"
    )]
    BandMismatch {
        scene_id: String,
        band: String,
        expected: String,
        found: String,
    },

    #[error("BandStackAssembler: scene {scene_id} band {band} could not be assembled: {reason}")]
    PartialStackFailure {
        scene_id: String,
        band: String,
        reason: String,
    },

    #[error("IndexCalculator: {index} inputs differ in shape ({expected:?} vs {found:?})")]
    ShapeMismatch {
        index: &'static str,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error(
        "EnvironmentalFeatureFetcher: no covariates for ({latitude}, {longitude}): {reason}"
    )]
    EnvironmentalDataUnavailable {
        latitude: f64,
        longitude: f64,
        reason: String,
    },

    #[error(
        "FeaturePipeline: no scenes in {collection} at ({latitude}, {longitude}) between {start_date} and {end_date} with cloud cover <= {cloud_cover_max}%"
    )]
    NoScenesFound {
        collection: String,
        latitude: f64,
        longitude: f64,
        start_date: String,
        end_date: String,
        cloud_cover_max: f64,
    },

    #[error("FeaturePipeline: no usable scene among [{}], last error: {last_error}", .attempted.join(", "))]
    NoUsableScene {
        attempted: Vec<String>,
        last_error: String,
    },

    #[error("FeatureCache: {key}: {reason}")]
    Cache { key: String, reason: String },
}

pub type PipelineResult<T> = Result<T, PipelineError>;

impl PipelineError {
    /// Name of the component that raised the error.
    pub fn component(&self) -> &'static str {
        match self {
            Self::InvalidQuery { .. } | Self::CatalogUnavailable { .. } => "SceneCatalogClient",
            Self::MissingBand { .. }
            | Self::BandMismatch { .. }
            | Self::PartialStackFailure { .. } => "BandStackAssembler",
            Self::ShapeMismatch { .. } => "IndexCalculator",
            Self::EnvironmentalDataUnavailable { .. } => "EnvironmentalFeatureFetcher",
            Self::NoScenesFound { .. } | Self::NoUsableScene { .. } => "FeaturePipeline",
            Self::Cache { .. } => "FeatureCache",
        }
    }

    /// Whether repeating the identical request may succeed.
    ///
    /// Caller errors, contract errors and exhausted scene lists need different
    /// parameters; transient network and storage failures do not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::CatalogUnavailable { .. }
                | Self::PartialStackFailure { .. }
                | Self::EnvironmentalDataUnavailable { .. }
                | Self::Cache { .. }
        )
    }

    /// Data-quality errors that make the orchestrator move on to the next scene.
    pub fn triggers_scene_fallback(&self) -> bool {
        matches!(
            self,
            Self::MissingBand { .. } | Self::BandMismatch { .. } | Self::PartialStackFailure { .. }
        )
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidQuery { .. } => StatusCode::BAD_REQUEST,
            Self::NoScenesFound { .. } => StatusCode::NOT_FOUND,
            Self::NoUsableScene { .. }
            | Self::MissingBand { .. }
            | Self::BandMismatch { .. }
            | Self::PartialStackFailure { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::CatalogUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::ShapeMismatch { .. }
            | Self::EnvironmentalDataUnavailable { .. }
            | Self::Cache { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct ErrorBody {
    pub component: String,
    pub message: String,
    pub retryable: bool,
}

impl From<&PipelineError> for ErrorBody {
    fn from(err: &PipelineError) -> Self {
        ErrorBody {
            component: err.component().to_string(),
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(ErrorBody::from(&self))).into_response()
    }
}
