use crate::config::Config;
use crate::routes::features::pipeline::{FeatureService, ServicePipeline};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub pipeline: Arc<dyn FeatureService>,
}

impl AppState {
    pub fn new(config: Config, pipeline: Arc<dyn FeatureService>) -> Self {
        AppState { config, pipeline }
    }

    /// Production state: STAC, HTTP assets, Open-Meteo and Redis from `config`.
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let pipeline = ServicePipeline::from_config(&config)?;
        Ok(AppState::new(config, Arc::new(pipeline)))
    }
}
