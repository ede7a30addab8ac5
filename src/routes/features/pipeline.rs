use super::assembler::{AssetFetcher, BandStackAssembler, HttpAssetFetcher};
use super::cache::{CacheStore, FeatureCache, PopulationClaim, RedisCacheStore};
use super::catalog::{CatalogBackend, CatalogSession, SceneCatalogClient, StacCatalog};
use super::environment::{
    ELEVATION, EnvironmentSource, EnvironmentalFeatureFetcher, OpenMeteoSource, PRECIPITATION,
};
use super::indices::compute_indices;
use super::models::{
    BandRoles, BandStack, EnvironmentalFeatures, FeatureRecord, GeoQuery, Location,
    SceneDescriptor, TimeWindow,
};
use crate::config::Config;
use crate::error::{PipelineError, PipelineResult};
use chrono::Utc;
use futures::FutureExt;
use futures::future::BoxFuture;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Request defaults and orchestration bounds.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub patch_size: usize,
    pub max_patch_size: usize,
    pub cloud_cover_max: f64,
    pub result_limit: usize,
    pub max_scene_fallback: usize,
    pub include_full_stack: bool,
    pub poll_interval: Duration,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        PipelineSettings {
            patch_size: config.patch_size,
            max_patch_size: config.max_patch_size.max(1),
            cloud_cover_max: config.cloud_cover_max,
            result_limit: config.result_limit,
            max_scene_fallback: config.max_scene_fallback.max(1),
            include_full_stack: config.include_full_stack,
            poll_interval: Duration::from_millis(config.population_poll_ms.max(1)),
        }
    }
}

/// Location + time window + bands in, cached feature record out.
pub struct FeaturePipeline<B, F, E, S> {
    catalog: SceneCatalogClient<B>,
    assembler: BandStackAssembler<F>,
    environment: EnvironmentalFeatureFetcher<E>,
    cache: FeatureCache<S>,
    settings: PipelineSettings,
}

/// Production wiring: STAC over HTTP, GeoTIFF assets over HTTP, Open-Meteo
/// covariates, Redis feature store.
pub type ServicePipeline =
    FeaturePipeline<StacCatalog, HttpAssetFetcher, OpenMeteoSource, RedisCacheStore>;

impl ServicePipeline {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Ok(FeaturePipeline::new(
            SceneCatalogClient::new(
                StacCatalog::from_config(config)?,
                CatalogSession::from_config(config),
                config,
            ),
            BandStackAssembler::new(HttpAssetFetcher::new(config.request_timeout())?, config),
            EnvironmentalFeatureFetcher::new(OpenMeteoSource::from_config(config)?, config),
            FeatureCache::new(RedisCacheStore::new(&config.feature_cache_uri)?, config),
            config,
        ))
    }
}

impl<B, F, E, S> FeaturePipeline<B, F, E, S>
where
    B: CatalogBackend,
    F: AssetFetcher,
    E: EnvironmentSource,
    S: CacheStore,
{
    pub fn new(
        catalog: SceneCatalogClient<B>,
        assembler: BandStackAssembler<F>,
        environment: EnvironmentalFeatureFetcher<E>,
        cache: FeatureCache<S>,
        config: &Config,
    ) -> Self {
        FeaturePipeline {
            catalog,
            assembler,
            environment,
            cache,
            settings: PipelineSettings::from_config(config),
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn catalog(&self) -> &SceneCatalogClient<B> {
        &self.catalog
    }

    pub fn assembler(&self) -> &BandStackAssembler<F> {
        &self.assembler
    }

    pub fn environment(&self) -> &EnvironmentalFeatureFetcher<E> {
        &self.environment
    }

    pub fn cache(&self) -> &FeatureCache<S> {
        &self.cache
    }

    /// Feature record for `location` over `window` using the configured
    /// cloud ceiling, result limit and patch size. An empty band list selects
    /// the collection's red, nir, blue and swir2 bands.
    pub async fn prepare_features(
        &self,
        location: Location,
        window: TimeWindow,
        bands: &[String],
        collection: &str,
    ) -> PipelineResult<FeatureRecord> {
        let query = GeoQuery::new(location, window, collection)
            .with_cloud_cover_max(self.settings.cloud_cover_max)
            .with_result_limit(self.settings.result_limit);
        self.prepare_features_for(&query, bands, self.settings.patch_size)
            .await
    }

    /// As [`prepare_features`](Self::prepare_features) with every query
    /// parameter explicit.
    pub async fn prepare_features_for(
        &self,
        query: &GeoQuery,
        bands: &[String],
        patch_size: usize,
    ) -> PipelineResult<FeatureRecord> {
        query.validate()?;
        if patch_size == 0 || patch_size > self.settings.max_patch_size {
            return Err(PipelineError::InvalidQuery {
                field: "patch_size",
                reason: format!(
                    "must be between 1 and {}, got {}",
                    self.settings.max_patch_size, patch_size
                ),
            });
        }
        let bands = normalize_bands(bands, &query.collection_id)?;
        let key = self.cache.cache_key(
            query.location(),
            &query.time_window(),
            &bands,
            &query.collection_id,
            patch_size,
        );

        loop {
            if let Some(record) = self.cache.get(&key).await? {
                info!(cache_key = %key, scene_id = %record.scene_id, "Feature cache hit");
                return Ok(record);
            }

            if let Some(claim) = self.cache.claim(&key).await? {
                // The previous holder may have stored the record just before releasing
                if let Some(record) = self.cache.get(&key).await? {
                    self.release(&claim).await;
                    return Ok(record);
                }
                info!(cache_key = %key, "Feature cache miss, populating");
                let result = self
                    .populate_holding(&claim, query, &bands, patch_size, &key)
                    .await;
                self.release(&claim).await;
                return result;
            }

            debug!(cache_key = %key, "Population in progress elsewhere, waiting");
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }

    async fn release(&self, claim: &PopulationClaim) {
        if let Err(e) = self.cache.release(claim).await {
            // The claim still expires on its own
            warn!(claim_key = %claim.key(), error = %e, "Failed to release population claim");
        }
    }

    /// Runs the population while renewing `claim`, so slow catalogs and
    /// downloads do not let the claim lapse to a waiter.
    async fn populate_holding(
        &self,
        claim: &PopulationClaim,
        query: &GeoQuery,
        bands: &[String],
        patch_size: usize,
        key: &str,
    ) -> PipelineResult<FeatureRecord> {
        let populate = self.populate(query, bands, patch_size, key);
        tokio::pin!(populate);

        let mut renewal = tokio::time::interval(self.cache.renew_interval());
        renewal.tick().await;
        let mut held = true;
        loop {
            tokio::select! {
                result = &mut populate => return result,
                _ = renewal.tick(), if held => match self.cache.renew(claim).await {
                    Ok(true) => debug!(cache_key = %key, "Renewed population claim"),
                    Ok(false) => {
                        warn!(cache_key = %key, "Population claim lost, another caller may populate concurrently");
                        held = false;
                    }
                    Err(e) => warn!(cache_key = %key, error = %e, "Failed to renew population claim"),
                },
            }
        }
    }

    async fn populate(
        &self,
        query: &GeoQuery,
        bands: &[String],
        patch_size: usize,
        key: &str,
    ) -> PipelineResult<FeatureRecord> {
        let scenes = self.catalog.search(query).await?;
        if scenes.is_empty() {
            return Err(PipelineError::NoScenesFound {
                collection: query.collection_id.clone(),
                latitude: query.latitude,
                longitude: query.longitude,
                start_date: query.start_date.to_string(),
                end_date: query.end_date.to_string(),
                cloud_cover_max: query.cloud_cover_max,
            });
        }

        let mut attempted = Vec::new();
        let mut last_error = None;
        for scene in scenes.iter().take(self.settings.max_scene_fallback) {
            attempted.push(scene.scene_id.clone());
            match self
                .assembler
                .assemble(scene, bands, patch_size, query.location())
                .await
            {
                Ok(stack) => return self.finish(query, bands, scene, stack, key).await,
                Err(e) if e.triggers_scene_fallback() => {
                    warn!(scene_id = %scene.scene_id, error = %e, "Scene unusable, trying next");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        let err = PipelineError::NoUsableScene {
            attempted,
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no scene attempted".to_string()),
        };
        error!(cache_key = %key, error = %err, "Scene fallback exhausted");
        Err(err)
    }

    async fn finish(
        &self,
        query: &GeoQuery,
        bands: &[String],
        scene: &SceneDescriptor,
        stack: BandStack,
        key: &str,
    ) -> PipelineResult<FeatureRecord> {
        let roles = BandRoles::for_collection(&query.collection_id);
        let indices = compute_indices(&stack, &roles)?;

        let environmental_features = match self
            .environment
            .fetch(query.latitude, query.longitude, &query.time_window())
            .await
        {
            Ok(features) => features,
            Err(e) => {
                warn!(error = %e, "Continuing without environmental features");
                EnvironmentalFeatures::unavailable(&[ELEVATION, PRECIPITATION])
            }
        };

        let low_confidence_indices = indices.out_of_range();
        if !low_confidence_indices.is_empty() {
            warn!(scene_id = %scene.scene_id, indices = ?low_confidence_indices, "Index values outside [-1, 1]");
        }

        let record = FeatureRecord {
            location: query.location(),
            time_window: query.time_window(),
            collection: query.collection_id.clone(),
            bands: bands.to_vec(),
            patch_size: stack.patch_size,
            scene_id: scene.scene_id.clone(),
            acquisition_datetime: scene.acquisition_datetime,
            cloud_cover_percent: scene.cloud_cover_percent,
            band_summaries: stack.summary(),
            index_summaries: indices.summary(),
            indices,
            low_confidence_indices,
            degraded: !environmental_features.is_complete(),
            environmental_features,
            stack: self.settings.include_full_stack.then_some(stack),
            cache_key: key.to_string(),
            created_at: Utc::now(),
        };

        // A failed write costs a recomputation later, not this response
        if let Err(e) = self.cache.put(key, &record).await {
            error!(cache_key = %key, error = %e, "Failed to store feature record");
        }
        info!(
            cache_key = %key,
            scene_id = %record.scene_id,
            degraded = record.degraded,
            "Feature record ready"
        );
        Ok(record)
    }
}

/// Object-safe view of a pipeline for the HTTP layer, whatever its backends.
pub trait FeatureService: Send + Sync {
    fn prepare<'a>(
        &'a self,
        query: &'a GeoQuery,
        bands: &'a [String],
        patch_size: usize,
    ) -> BoxFuture<'a, PipelineResult<FeatureRecord>>;

    /// Whether the feature store answers.
    fn cache_healthy(&self) -> BoxFuture<'_, bool>;

    fn settings(&self) -> &PipelineSettings;
}

impl<B, F, E, S> FeatureService for FeaturePipeline<B, F, E, S>
where
    B: CatalogBackend,
    F: AssetFetcher,
    E: EnvironmentSource,
    S: CacheStore,
{
    fn prepare<'a>(
        &'a self,
        query: &'a GeoQuery,
        bands: &'a [String],
        patch_size: usize,
    ) -> BoxFuture<'a, PipelineResult<FeatureRecord>> {
        self.prepare_features_for(query, bands, patch_size).boxed()
    }

    fn cache_healthy(&self) -> BoxFuture<'_, bool> {
        async move { self.cache.store().ping().await.is_ok() }.boxed()
    }

    fn settings(&self) -> &PipelineSettings {
        &self.settings
    }
}

/// Requested bands in request order without duplicates; the collection
/// defaults when none are given.
fn normalize_bands(bands: &[String], collection: &str) -> PipelineResult<Vec<String>> {
    let mut normalized: Vec<String> = Vec::with_capacity(bands.len());
    for band in bands.iter().map(|b| b.trim()) {
        if band.is_empty() {
            return Err(PipelineError::InvalidQuery {
                field: "bands",
                reason: "band names must not be empty".to_string(),
            });
        }
        if !normalized.iter().any(|b| b == band) {
            normalized.push(band.to_string());
        }
    }
    if normalized.is_empty() {
        normalized = BandRoles::for_collection(collection).default_bands();
    }
    Ok(normalized)
}
