use crate::error::{PipelineError, PipelineResult};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use ndarray::Array2;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

/// Inclusive date range of acquisitions considered for one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct TimeWindow {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

impl TimeWindow {
    pub fn new(start_date: NaiveDate, end_date: NaiveDate) -> Self {
        TimeWindow {
            start_date,
            end_date,
        }
    }

    /// ISO 8601 interval as used by STAC `datetime`, e.g.
    /// `2023-06-01T00:00:00Z/2023-08-31T23:59:59Z`.
    pub fn to_interval(&self) -> String {
        format!(
            "{}T00:00:00Z/{}T23:59:59Z",
            self.start_date.format("%Y-%m-%d"),
            self.end_date.format("%Y-%m-%d")
        )
    }

    pub fn contains(&self, datetime: &DateTime<Utc>) -> bool {
        let start = self.start_date.and_time(NaiveTime::MIN).and_utc();
        let end = self
            .end_date
            .succ_opt()
            .unwrap_or(self.end_date)
            .and_time(NaiveTime::MIN)
            .and_utc();
        *datetime >= start && *datetime < end
    }
}

/// One catalog request. Built per call and discarded afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoQuery {
    pub latitude: f64,
    pub longitude: f64,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub collection_id: String,
    pub cloud_cover_max: f64,
    pub result_limit: usize,
}

impl GeoQuery {
    pub fn new(location: Location, window: TimeWindow, collection_id: &str) -> Self {
        GeoQuery {
            latitude: location.latitude,
            longitude: location.longitude,
            start_date: window.start_date,
            end_date: window.end_date,
            collection_id: collection_id.to_string(),
            cloud_cover_max: 10.0,
            result_limit: 5,
        }
    }

    pub fn with_cloud_cover_max(mut self, cloud_cover_max: f64) -> Self {
        self.cloud_cover_max = cloud_cover_max;
        self
    }

    pub fn with_result_limit(mut self, result_limit: usize) -> Self {
        self.result_limit = result_limit;
        self
    }

    pub fn location(&self) -> Location {
        Location {
            latitude: self.latitude,
            longitude: self.longitude,
        }
    }

    pub fn time_window(&self) -> TimeWindow {
        TimeWindow::new(self.start_date, self.end_date)
    }

    /// Checks the query invariants. NaN coordinates fail the range checks.
    pub fn validate(&self) -> PipelineResult<()> {
        if !(-90.0..=90.0).contains(&self.latitude) {
            return Err(invalid("latitude", format!("{} is outside [-90, 90]", self.latitude)));
        }
        if !(-180.0..=180.0).contains(&self.longitude) {
            return Err(invalid(
                "longitude",
                format!("{} is outside [-180, 180]", self.longitude),
            ));
        }
        if self.start_date > self.end_date {
            return Err(invalid(
                "start_date",
                format!("{} is after end_date {}", self.start_date, self.end_date),
            ));
        }
        if !(0.0..=100.0).contains(&self.cloud_cover_max) {
            return Err(invalid(
                "cloud_cover_max",
                format!("{} is outside [0, 100]", self.cloud_cover_max),
            ));
        }
        if self.result_limit == 0 {
            return Err(invalid("result_limit", "must be at least 1".to_string()));
        }
        if self.collection_id.trim().is_empty() {
            return Err(invalid("collection_id", "must not be empty".to_string()));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: String) -> PipelineError {
    PipelineError::InvalidQuery { field, reason }
}

/// A scene as returned by the catalog. Asset URIs are signed and only valid
/// for the request that fetched them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneDescriptor {
    pub scene_id: String,
    pub acquisition_datetime: DateTime<Utc>,
    pub cloud_cover_percent: f64,
    pub asset_refs: BTreeMap<String, String>,
    /// `[west, south, east, north]` in degrees
    pub footprint: Option<[f64; 4]>,
}

/// North-up affine transform: `x = top_left_x + col * pixel_width`,
/// `y = top_left_y + row * pixel_height` (pixel_height is negative).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub top_left_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    /// Fractional (col, row) of a map coordinate.
    pub fn to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        (
            (x - self.top_left_x) / self.pixel_width,
            (y - self.top_left_y) / self.pixel_height,
        )
    }

    /// Map coordinate of the centre of cell (row, col).
    pub fn cell_center(&self, row: usize, col: usize) -> (f64, f64) {
        (
            self.top_left_x + (col as f64 + 0.5) * self.pixel_width,
            self.top_left_y + (row as f64 + 0.5) * self.pixel_height,
        )
    }
}

/// 2D `f32` raster. Non-finite cells are nodata; they serialize as `null`
/// and compare equal to each other.
#[derive(Debug, Clone)]
pub struct Raster(pub Array2<f32>);

impl Raster {
    pub fn shape(&self) -> (usize, usize) {
        self.0.dim()
    }

    pub fn summarize(&self, name: &str) -> RasterSummary {
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut sum = 0.0;
        let mut valid_pixels = 0;
        for value in self.0.iter().copied().filter(|v| v.is_finite()) {
            let value = value as f64;
            min = min.min(value);
            max = max.max(value);
            sum += value;
            valid_pixels += 1;
        }
        let (min, max, mean) = if valid_pixels == 0 {
            (None, None, None)
        } else {
            (Some(min), Some(max), Some(sum / valid_pixels as f64))
        };
        RasterSummary {
            name: name.to_string(),
            min,
            max,
            mean,
            valid_pixels,
        }
    }
}

impl From<Array2<f32>> for Raster {
    fn from(array: Array2<f32>) -> Self {
        Raster(array)
    }
}

impl PartialEq for Raster {
    fn eq(&self, other: &Self) -> bool {
        self.0.dim() == other.0.dim()
            && self
                .0
                .iter()
                .zip(other.0.iter())
                .all(|(a, b)| a == b || (!a.is_finite() && !b.is_finite()))
    }
}

#[derive(Serialize, Deserialize)]
struct RasterRepr {
    rows: usize,
    cols: usize,
    data: Vec<Option<f32>>,
}

impl Serialize for Raster {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let (rows, cols) = self.0.dim();
        RasterRepr {
            rows,
            cols,
            data: self
                .0
                .iter()
                .map(|v| if v.is_finite() { Some(*v) } else { None })
                .collect(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Raster {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let repr = RasterRepr::deserialize(deserializer)?;
        let data = repr
            .data
            .into_iter()
            .map(|v| v.unwrap_or(f32::NAN))
            .collect();
        Array2::from_shape_vec((repr.rows, repr.cols), data)
            .map(Raster)
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct RasterSummary {
    pub name: String,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub mean: Option<f64>,
    pub valid_pixels: usize,
}

/// Co-registered patch cube for one scene, band order as requested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandStack {
    pub scene_id: String,
    pub bands: Vec<(String, Raster)>,
    pub patch_size: usize,
    pub coordinate_reference: String,
    pub affine_transform: GeoTransform,
}

impl BandStack {
    pub fn band(&self, name: &str) -> Option<&Array2<f32>> {
        self.bands
            .iter()
            .find(|(band, _)| band == name)
            .map(|(_, raster)| &raster.0)
    }

    pub fn band_names(&self) -> Vec<String> {
        self.bands.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn summary(&self) -> Vec<RasterSummary> {
        self.bands
            .iter()
            .map(|(name, raster)| raster.summarize(name))
            .collect()
    }
}

/// Derived indices; an index is absent when its input bands were not requested.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SpectralIndices {
    pub ndvi: Option<Raster>,
    pub evi: Option<Raster>,
    pub nbr: Option<Raster>,
}

impl SpectralIndices {
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &Raster)> {
        [("ndvi", &self.ndvi), ("evi", &self.evi), ("nbr", &self.nbr)]
            .into_iter()
            .filter_map(|(name, raster)| raster.as_ref().map(|r| (name, r)))
    }

    pub fn summary(&self) -> Vec<RasterSummary> {
        self.iter()
            .map(|(name, raster)| raster.summarize(name))
            .collect()
    }

    /// Names of indices with finite values outside [-1, 1]. Such values come
    /// from sensor noise and mark the index as low-confidence, not invalid.
    pub fn out_of_range(&self) -> Vec<String> {
        self.iter()
            .filter(|(_, raster)| {
                raster
                    .0
                    .iter()
                    .any(|v| v.is_finite() && !(-1.0..=1.0).contains(v))
            })
            .map(|(name, _)| name.to_string())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, ToSchema)]
pub struct EnvironmentalFeatures {
    pub values: BTreeMap<String, f64>,
    /// Requested covariates that could not be retrieved
    pub missing: Vec<String>,
}

impl EnvironmentalFeatures {
    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    pub fn unavailable(names: &[&str]) -> Self {
        EnvironmentalFeatures {
            values: BTreeMap::new(),
            missing: names.iter().map(|n| n.to_string()).collect(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

/// The unit persisted by the feature cache and returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRecord {
    pub location: Location,
    pub time_window: TimeWindow,
    pub collection: String,
    pub bands: Vec<String>,
    pub patch_size: usize,
    pub scene_id: String,
    pub acquisition_datetime: DateTime<Utc>,
    pub cloud_cover_percent: f64,
    pub band_summaries: Vec<RasterSummary>,
    pub stack: Option<BandStack>,
    pub indices: SpectralIndices,
    pub index_summaries: Vec<RasterSummary>,
    pub low_confidence_indices: Vec<String>,
    pub environmental_features: EnvironmentalFeatures,
    pub degraded: bool,
    pub cache_key: String,
    pub created_at: DateTime<Utc>,
}

/// Which asset key carries each spectral role for a collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BandRoles {
    pub red: String,
    pub nir: String,
    pub blue: String,
    pub swir2: String,
}

impl BandRoles {
    pub fn for_collection(collection: &str) -> Self {
        match collection.to_lowercase().as_str() {
            "sentinel-2-l2a" | "sentinel-2-l1c" | "sentinel_2_l2a" => BandRoles {
                red: "B04".to_string(),
                nir: "B08".to_string(),
                blue: "B02".to_string(),
                swir2: "B12".to_string(),
            },
            // Landsat Collection 2 naming, also used for unknown collections
            _ => BandRoles {
                red: "red".to_string(),
                nir: "nir08".to_string(),
                blue: "blue".to_string(),
                swir2: "swir22".to_string(),
            },
        }
    }

    pub fn default_bands(&self) -> Vec<String> {
        vec![
            self.red.clone(),
            self.nir.clone(),
            self.blue.clone(),
            self.swir2.clone(),
        ]
    }
}
