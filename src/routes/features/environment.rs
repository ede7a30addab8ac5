//! Supplementary environmental covariates for a location.

use super::models::{EnvironmentalFeatures, Location, TimeWindow};
use crate::config::Config;
use crate::error::{PipelineError, PipelineResult};
use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};

pub const ELEVATION: &str = "elevation";
pub const PRECIPITATION: &str = "precipitation";

pub trait EnvironmentSource: Send + Sync {
    /// Terrain height in metres.
    fn elevation(&self, location: Location) -> impl Future<Output = Result<f64>> + Send;

    /// Total precipitation in mm over the window.
    fn precipitation(
        &self,
        location: Location,
        window: &TimeWindow,
    ) -> impl Future<Output = Result<f64>> + Send;
}

#[derive(Deserialize)]
struct ElevationResponse {
    elevation: Vec<f64>,
}

#[derive(Deserialize)]
struct ArchiveResponse {
    daily: DailySeries,
}

#[derive(Deserialize)]
struct DailySeries {
    precipitation_sum: Vec<Option<f64>>,
}

/// Open-Meteo elevation and historical weather APIs.
#[derive(Clone)]
pub struct OpenMeteoSource {
    client: reqwest::Client,
    elevation_url: String,
    archive_url: String,
}

impl OpenMeteoSource {
    pub fn new(elevation_url: &str, archive_url: &str, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("failed to build environment HTTP client")?;
        Ok(OpenMeteoSource {
            client,
            elevation_url: elevation_url.to_string(),
            archive_url: archive_url.to_string(),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        OpenMeteoSource::new(
            &config.environment_url,
            &config.precipitation_url,
            config.request_timeout(),
        )
    }
}

impl EnvironmentSource for OpenMeteoSource {
    async fn elevation(&self, location: Location) -> Result<f64> {
        let response: ElevationResponse = self
            .client
            .get(&self.elevation_url)
            .query(&[
                ("latitude", location.latitude),
                ("longitude", location.longitude),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        response
            .elevation
            .first()
            .copied()
            .ok_or_else(|| anyhow!("elevation response is empty"))
    }

    async fn precipitation(&self, location: Location, window: &TimeWindow) -> Result<f64> {
        let response: ArchiveResponse = self
            .client
            .get(&self.archive_url)
            .query(&[
                ("latitude", location.latitude.to_string()),
                ("longitude", location.longitude.to_string()),
                ("start_date", window.start_date.to_string()),
                ("end_date", window.end_date.to_string()),
                ("daily", "precipitation_sum".to_string()),
                ("timezone", "UTC".to_string()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        total_precipitation(&response.daily.precipitation_sum)
    }
}

fn total_precipitation(daily: &[Option<f64>]) -> Result<f64> {
    let days: Vec<f64> = daily.iter().flatten().copied().collect();
    if days.is_empty() {
        return Err(anyhow!("no daily precipitation values in window"));
    }
    Ok(days.iter().sum())
}

pub struct EnvironmentalFeatureFetcher<S> {
    source: S,
    request_timeout: Duration,
}

impl<S: EnvironmentSource> EnvironmentalFeatureFetcher<S> {
    pub fn new(source: S, config: &Config) -> Self {
        EnvironmentalFeatureFetcher {
            source,
            request_timeout: config.request_timeout(),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Looks up every covariate concurrently. Missing ones are listed in the
    /// result; only a complete miss is an error.
    pub async fn fetch(
        &self,
        latitude: f64,
        longitude: f64,
        window: &TimeWindow,
    ) -> PipelineResult<EnvironmentalFeatures> {
        let location = Location {
            latitude,
            longitude,
        };
        let (elevation, precipitation) = tokio::join!(
            self.bounded(ELEVATION, self.source.elevation(location)),
            self.bounded(PRECIPITATION, self.source.precipitation(location, window)),
        );

        let mut features = EnvironmentalFeatures::default();
        let mut reasons = Vec::new();
        for (name, result) in [(ELEVATION, elevation), (PRECIPITATION, precipitation)] {
            match result {
                Ok(value) => {
                    features.values.insert(name.to_string(), value);
                }
                Err(e) => {
                    warn!(covariate = name, latitude, longitude, error = %e, "Covariate unavailable");
                    features.missing.push(name.to_string());
                    reasons.push(format!("{}: {:#}", name, e));
                }
            }
        }

        if features.values.is_empty() {
            return Err(PipelineError::EnvironmentalDataUnavailable {
                latitude,
                longitude,
                reason: reasons.join("; "),
            });
        }
        info!(
            latitude,
            longitude,
            covariates = features.values.len(),
            missing = features.missing.len(),
            "Fetched environmental features"
        );
        Ok(features)
    }

    async fn bounded(&self, name: &str, call: impl Future<Output = Result<f64>>) -> Result<f64> {
        match timeout(self.request_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(anyhow!("{} lookup timed out after {:?}", name, self.request_timeout)),
        }
    }
}
