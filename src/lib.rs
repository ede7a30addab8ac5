pub mod common;
pub mod config;
pub mod error;
pub mod routes;

pub use error::{PipelineError, PipelineResult};
pub use routes::features::models::{FeatureRecord, Location, TimeWindow};
pub use routes::features::pipeline::{FeaturePipeline, ServicePipeline};
