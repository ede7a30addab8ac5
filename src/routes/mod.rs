pub mod features;

use crate::common::state::AppState;
use axum::{Router, http::Method};
use tower_http::cors::{Any, CorsLayer};
use utoipa::OpenApi;
use utoipa_axum::router::OpenApiRouter;
use utoipa_scalar::{Scalar, Servable};

pub fn build_router(state: &AppState) -> Router {
    #[derive(OpenApi)]
    #[openapi(info(
        title = "canopy-features",
        description = "Per-location spectral index and environmental feature extraction"
    ))]
    struct ApiDoc;

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET])
        .allow_headers(Any);

    let (router, api) = OpenApiRouter::with_openapi(ApiDoc::openapi())
        .merge(crate::common::views::router(state)) // Root routes
        .nest("/api/features", features::views::router(state))
        .layer(cors)
        .split_for_parts();

    router.merge(Scalar::with_url("/api/docs", api))
}
