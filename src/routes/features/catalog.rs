//! Scene discovery against a STAC item-search endpoint.

use super::models::{GeoQuery, SceneDescriptor};
use super::retry::RetryPolicy;
use crate::config::Config;
use crate::error::{PipelineError, PipelineResult};
use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use stac_api::ItemCollection;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeMap;
use futures::{StreamExt, stream};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Half-width in degrees of the search box drawn around the query point.
pub const POINT_BUFFER_DEG: f64 = 0.01;

/// Credentials for one catalog, created once and handed to the client.
#[derive(Debug, Clone, Default)]
pub struct CatalogSession {
    token: Option<String>,
    sign_url: Option<String>,
}

impl CatalogSession {
    pub fn new(token: Option<String>, sign_url: Option<String>) -> Self {
        CatalogSession { token, sign_url }
    }

    pub fn anonymous() -> Self {
        CatalogSession::default()
    }

    pub fn from_config(config: &Config) -> Self {
        CatalogSession::new(config.catalog_token.clone(), config.catalog_sign_url.clone())
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn sign_url(&self) -> Option<&str> {
        self.sign_url.as_deref()
    }
}

/// A remote imagery catalog.
pub trait CatalogBackend: Send + Sync {
    /// One search round trip. Retries and ranking are the caller's concern.
    fn search(
        &self,
        session: &CatalogSession,
        query: &GeoQuery,
    ) -> impl Future<Output = Result<Vec<SceneDescriptor>>> + Send;

    /// Authorizes one asset reference for download. Open catalogs hand it
    /// back unchanged.
    fn sign(
        &self,
        _session: &CatalogSession,
        href: &str,
    ) -> impl Future<Output = Result<String>> + Send {
        let href = href.to_string();
        async move { Ok(href) }
    }
}

/// Signing requests in flight per search.
const SIGN_CONCURRENCY: usize = 16;

pub struct SceneCatalogClient<B> {
    backend: B,
    session: CatalogSession,
    retry: RetryPolicy,
}

impl<B: CatalogBackend> SceneCatalogClient<B> {
    pub fn new(backend: B, session: CatalogSession, config: &Config) -> Self {
        SceneCatalogClient {
            backend,
            session,
            retry: RetryPolicy::new(
                config.catalog_max_retries,
                config.retry_base_delay(),
                config.request_timeout(),
            ),
        }
    }

    pub fn with_retry_policy(mut self, max_retries: usize, base_delay: Duration) -> Self {
        self.retry.max_retries = max_retries;
        self.retry.base_delay = base_delay;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Scenes matching `query`, best first: lowest cloud cover, then most
    /// recent. Asset references of the scenes kept are signed. An empty
    /// result is not an error.
    pub async fn search(&self, query: &GeoQuery) -> PipelineResult<Vec<SceneDescriptor>> {
        query.validate()?;

        debug!(
            collection = %query.collection_id,
            latitude = query.latitude,
            longitude = query.longitude,
            "Searching scene catalog"
        );
        let (result, attempts) = self
            .retry
            .run("catalog search", || self.backend.search(&self.session, query))
            .await;

        let scenes = result.map_err(|e| {
            error!(attempts, error = %e, "Scene catalog unavailable");
            PipelineError::CatalogUnavailable {
                attempts,
                reason: format!("{:#}", e),
            }
        })?;

        let ranked = self.sign_assets(rank_scenes(scenes, query)).await;
        info!(
            collection = %query.collection_id,
            scenes = ranked.len(),
            "Catalog search complete"
        );
        Ok(ranked)
    }

    /// Signs every asset reference concurrently, each call with its own
    /// timeout and retries. Assets that cannot be signed are dropped, so a
    /// scene that needed one fails band resolution later.
    async fn sign_assets(&self, mut scenes: Vec<SceneDescriptor>) -> Vec<SceneDescriptor> {
        let jobs: Vec<(usize, String, String)> = scenes
            .iter()
            .enumerate()
            .flat_map(|(index, scene)| {
                scene
                    .asset_refs
                    .iter()
                    .map(move |(band, href)| (index, band.clone(), href.clone()))
            })
            .collect();

        let signed: Vec<(usize, String, Result<String>)> = stream::iter(jobs)
            .map(|(index, band, href)| async move {
                let (result, _) = self
                    .retry
                    .run("asset signing", || self.backend.sign(&self.session, &href))
                    .await;
                (index, band, result)
            })
            .buffer_unordered(SIGN_CONCURRENCY)
            .collect()
            .await;

        for (index, band, result) in signed {
            let scene = &mut scenes[index];
            match result {
                Ok(href) => {
                    scene.asset_refs.insert(band, href);
                }
                Err(e) => {
                    warn!(scene_id = %scene.scene_id, band, error = %e, "Dropping unsigned asset");
                    scene.asset_refs.remove(&band);
                }
            }
        }
        scenes
    }
}

/// Drops scenes the catalog should not have returned, then orders by cloud
/// cover ascending, acquisition time descending and truncates to the limit.
pub fn rank_scenes(mut scenes: Vec<SceneDescriptor>, query: &GeoQuery) -> Vec<SceneDescriptor> {
    let window = query.time_window();
    scenes.retain(|scene| {
        scene.cloud_cover_percent <= query.cloud_cover_max
            && window.contains(&scene.acquisition_datetime)
    });
    scenes.sort_by(|a, b| {
        a.cloud_cover_percent
            .partial_cmp(&b.cloud_cover_percent)
            .unwrap_or(CmpOrdering::Equal)
            .then_with(|| b.acquisition_datetime.cmp(&a.acquisition_datetime))
            .then_with(|| a.scene_id.cmp(&b.scene_id))
    });
    scenes.truncate(query.result_limit);
    scenes
}

#[derive(Serialize)]
struct SearchBody {
    bbox: [f64; 4],
    datetime: String,
    collections: Vec<String>,
    limit: usize,
    query: Value,
}

impl SearchBody {
    fn from_query(query: &GeoQuery) -> Self {
        SearchBody {
            bbox: [
                query.longitude - POINT_BUFFER_DEG,
                query.latitude - POINT_BUFFER_DEG,
                query.longitude + POINT_BUFFER_DEG,
                query.latitude + POINT_BUFFER_DEG,
            ],
            datetime: query.time_window().to_interval(),
            collections: vec![query.collection_id.clone()],
            limit: query.result_limit,
            query: json!({"eo:cloud_cover": {"gte": 0, "lte": query.cloud_cover_max}}),
        }
    }
}

#[derive(Deserialize)]
struct CatalogItem {
    id: String,
    #[serde(default)]
    bbox: Option<Vec<f64>>,
    properties: ItemProperties,
    #[serde(default)]
    assets: BTreeMap<String, ItemAsset>,
}

#[derive(Deserialize)]
struct ItemProperties {
    datetime: Option<DateTime<Utc>>,
    start_datetime: Option<DateTime<Utc>>,
    // Items without a cloud estimate rank last
    #[serde(rename = "eo:cloud_cover", default = "unknown_cloud_cover")]
    cloud_cover: f64,
}

fn unknown_cloud_cover() -> f64 {
    100.0
}

#[derive(Deserialize)]
struct ItemAsset {
    href: String,
    #[serde(rename = "type", default)]
    media_type: Option<String>,
}

impl ItemAsset {
    /// Untyped assets are kept; typed ones only when they are TIFFs.
    fn is_raster(&self) -> bool {
        self.media_type
            .as_deref()
            .is_none_or(|media_type| media_type.contains("tiff"))
    }
}

#[derive(Deserialize)]
struct SignedHref {
    href: String,
}

/// STAC API item search over HTTP.
#[derive(Clone)]
pub struct StacCatalog {
    client: reqwest::Client,
    search_url: String,
}

impl StacCatalog {
    pub fn new(search_url: &str, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("failed to build catalog HTTP client")?;
        Ok(StacCatalog {
            client,
            search_url: search_url.to_string(),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        StacCatalog::new(&config.catalog_url, config.request_timeout())
    }

    fn to_descriptor(item: CatalogItem) -> Result<SceneDescriptor> {
        let acquisition_datetime = item
            .properties
            .datetime
            .or(item.properties.start_datetime)
            .ok_or_else(|| anyhow!("item {} has no acquisition time", item.id))?;

        let asset_refs: BTreeMap<String, String> = item
            .assets
            .into_iter()
            .filter(|(_, asset)| asset.is_raster())
            .map(|(band, asset)| (band, asset.href))
            .collect();

        let footprint = item
            .bbox
            .filter(|bbox| bbox.len() >= 4)
            .map(|bbox| match bbox.len() {
                // 3D boxes: [w, s, zmin, e, n, zmax]
                6 => [bbox[0], bbox[1], bbox[3], bbox[4]],
                _ => [bbox[0], bbox[1], bbox[2], bbox[3]],
            });

        Ok(SceneDescriptor {
            scene_id: item.id,
            acquisition_datetime,
            cloud_cover_percent: item.properties.cloud_cover,
            asset_refs,
            footprint,
        })
    }
}

impl CatalogBackend for StacCatalog {
    async fn search(
        &self,
        session: &CatalogSession,
        query: &GeoQuery,
    ) -> Result<Vec<SceneDescriptor>> {
        let mut request = self
            .client
            .post(&self.search_url)
            .json(&SearchBody::from_query(query));
        if let Some(token) = session.token() {
            request = request.bearer_auth(token);
        }

        let items: ItemCollection = request.send().await?.error_for_status()?.json().await?;

        let mut scenes = Vec::with_capacity(items.items.len());
        for feature in items.items {
            let item: CatalogItem = match serde_json::from_value(Value::Object(feature)) {
                Ok(item) => item,
                Err(e) => {
                    warn!(error = %e, "Skipping malformed catalog item");
                    continue;
                }
            };
            scenes.push(StacCatalog::to_descriptor(item)?);
        }
        Ok(scenes)
    }

    async fn sign(&self, session: &CatalogSession, href: &str) -> Result<String> {
        let Some(sign_url) = session.sign_url() else {
            return Ok(href.to_string());
        };
        let mut request = self.client.get(sign_url).query(&[("href", href)]);
        if let Some(token) = session.token() {
            request = request.bearer_auth(token);
        }
        let signed: SignedHref = request
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .with_context(|| format!("unexpected signing response for {}", href))?;
        Ok(signed.href)
    }
}
