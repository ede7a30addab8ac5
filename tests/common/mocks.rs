// In-memory stand-ins for the catalog, asset store and covariate services

use anyhow::{Result, anyhow};
use canopy_features::config::Config;
use canopy_features::routes::features::assembler::{AssetFetcher, BandStackAssembler, PatchArea};
use canopy_features::routes::features::cache::{FeatureCache, MemoryCacheStore};
use canopy_features::routes::features::catalog::{
    CatalogBackend, CatalogSession, SceneCatalogClient,
};
use canopy_features::routes::features::environment::{
    EnvironmentSource, EnvironmentalFeatureFetcher,
};
use canopy_features::routes::features::geotiff::RasterBand;
use canopy_features::routes::features::models::{
    GeoQuery, GeoTransform, Location, SceneDescriptor, TimeWindow,
};
use canopy_features::routes::features::pipeline::FeaturePipeline;
use chrono::NaiveDate;
use ndarray::Array2;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub type MockPipeline = FeaturePipeline<MockCatalog, MockFetcher, MockEnvironment, MemoryCacheStore>;

pub const LATITUDE: f64 = -9.3;
pub const LONGITUDE: f64 = -60.3;
pub const COLLECTION: &str = "LANDSAT_8_C2_L2";

pub fn location() -> Location {
    Location {
        latitude: LATITUDE,
        longitude: LONGITUDE,
    }
}

pub fn window() -> TimeWindow {
    TimeWindow::new(
        NaiveDate::from_ymd_opt(2023, 6, 1).unwrap(),
        NaiveDate::from_ymd_opt(2023, 8, 31).unwrap(),
    )
}

pub fn bands(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

/// Scene whose assets are `mem://{scene_id}/{band}`.
pub fn scene(scene_id: &str, cloud_cover: f64, datetime: &str, band_names: &[&str]) -> SceneDescriptor {
    SceneDescriptor {
        scene_id: scene_id.to_string(),
        acquisition_datetime: datetime.parse().unwrap(),
        cloud_cover_percent: cloud_cover,
        asset_refs: band_names
            .iter()
            .map(|band| (band.to_string(), format!("mem://{}/{}", scene_id, band)))
            .collect::<BTreeMap<_, _>>(),
        footprint: None,
    }
}

/// Constant-valued geographic raster of `size × size` 30 m-ish cells centred on the test point.
pub fn constant_band(value: f32, size: usize) -> RasterBand {
    let pixel = 0.0003;
    RasterBand {
        data: Array2::from_elem((size, size), value),
        crs: "EPSG:4326".to_string(),
        transform: GeoTransform {
            top_left_x: LONGITUDE - pixel * size as f64 / 2.0,
            pixel_width: pixel,
            top_left_y: LATITUDE + pixel * size as f64 / 2.0,
            pixel_height: -pixel,
        },
    }
}

pub struct MockCatalog {
    pub scenes: Vec<SceneDescriptor>,
    pub failures: AtomicUsize,
    pub calls: AtomicUsize,
}

impl MockCatalog {
    pub fn new(scenes: Vec<SceneDescriptor>) -> Self {
        MockCatalog {
            scenes,
            failures: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    /// Fails the next `n` searches.
    pub fn failing(self, n: usize) -> Self {
        self.failures.store(n, Ordering::SeqCst);
        self
    }
}

impl CatalogBackend for MockCatalog {
    async fn search(&self, _session: &CatalogSession, _query: &GeoQuery) -> Result<Vec<SceneDescriptor>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(anyhow!("catalog returned 502 Bad Gateway"));
        }
        Ok(self.scenes.clone())
    }
}

pub struct MockFetcher {
    pub assets: HashMap<String, RasterBand>,
    pub delay: Duration,
    pub calls: AtomicUsize,
}

impl MockFetcher {
    pub fn new() -> Self {
        MockFetcher {
            assets: HashMap::new(),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_asset(mut self, uri: &str, band: RasterBand) -> Self {
        self.assets.insert(uri.to_string(), band);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl AssetFetcher for MockFetcher {
    async fn fetch(&self, uri: &str, _area: &PatchArea) -> Result<RasterBand> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.assets
            .get(uri)
            .cloned()
            .ok_or_else(|| anyhow!("asset {} unreachable", uri))
    }
}

pub struct MockEnvironment {
    pub elevation: Option<f64>,
    pub precipitation: Option<f64>,
    pub calls: AtomicUsize,
}

impl MockEnvironment {
    pub fn new(elevation: Option<f64>, precipitation: Option<f64>) -> Self {
        MockEnvironment {
            elevation,
            precipitation,
            calls: AtomicUsize::new(0),
        }
    }
}

impl EnvironmentSource for MockEnvironment {
    async fn elevation(&self, _location: Location) -> Result<f64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.elevation.ok_or_else(|| anyhow!("elevation service unavailable"))
    }

    async fn precipitation(&self, _location: Location, _window: &TimeWindow) -> Result<f64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.precipitation
            .ok_or_else(|| anyhow!("precipitation service unavailable"))
    }
}

pub fn pipeline_with(
    config: &Config,
    catalog: MockCatalog,
    fetcher: MockFetcher,
    environment: MockEnvironment,
) -> MockPipeline {
    FeaturePipeline::new(
        SceneCatalogClient::new(catalog, CatalogSession::anonymous(), config),
        BandStackAssembler::new(fetcher, config),
        EnvironmentalFeatureFetcher::new(environment, config),
        FeatureCache::new(MemoryCacheStore::new(), config),
        config,
    )
}

/// One clear scene with RED = 0.2 and NIR = 0.5 everywhere.
pub fn reference_pipeline(config: &Config) -> MockPipeline {
    let scene = scene("LC08_L2SP_231067_20230715", 0.4, "2023-07-15T14:02:11Z", &["red", "nir08"]);
    let fetcher = MockFetcher::new()
        .with_asset("mem://LC08_L2SP_231067_20230715/red", constant_band(0.2, 3))
        .with_asset("mem://LC08_L2SP_231067_20230715/nir08", constant_band(0.5, 3));
    pipeline_with(
        config,
        MockCatalog::new(vec![scene]),
        fetcher,
        MockEnvironment::new(Some(142.0), Some(87.5)),
    )
}
