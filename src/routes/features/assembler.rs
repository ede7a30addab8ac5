//! Fetches the requested bands of one scene and cuts a common patch around
//! the query point.

use super::geotiff::{
    FetchedRange, GeoTiffError, GeoTiffLayout, GeoTiffReader, HEADER_PREFETCH, PixelWindow,
    RangeSource, RasterBand,
};
use super::models::{BandStack, GeoTransform, Location, Raster, SceneDescriptor};
use super::retry::RetryPolicy;
use crate::config::Config;
use crate::error::{PipelineError, PipelineResult};
use anyhow::{Context, Result};
use futures::future::try_join_all;
use ndarray::Array2;
use proj4rs::proj::Proj;
use proj4rs::transform::transform;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_RANGE, RANGE};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, info};

/// Part of a raster the assembler needs around the query point.
#[derive(Debug, Clone, Copy)]
pub struct PatchArea {
    pub location: Location,
    pub patch_size: usize,
    /// Half side of the patch in CRS units. `None` means `patch_size` pixels
    /// at the raster's own resolution.
    pub half_extent: Option<f64>,
}

impl PatchArea {
    /// Pixels of `layout` the patch touches, padded by one pixel. `None` when
    /// the patch misses the raster.
    pub fn window(&self, layout: &GeoTiffLayout) -> Result<Option<PixelWindow>, GeoTiffError> {
        let (x, y) = project_point(self.location, &layout.crs)?;
        let pixel_width = layout.transform.pixel_width.abs();
        let pixel_height = layout.transform.pixel_height.abs();
        let (half_x, half_y) = match self.half_extent {
            Some(half) => (half + pixel_width, half + pixel_height),
            None => {
                let half = (self.patch_size / 2 + 1) as f64;
                (half * pixel_width, half * pixel_height)
            }
        };
        Ok(layout.window_for(x - half_x, y - half_y, x + half_x, y + half_y))
    }
}

/// Boundary to wherever pixel data lives.
pub trait AssetFetcher: Send + Sync {
    /// The part of the asset at `uri` covering `area`. Pixels outside it may
    /// be left out.
    fn fetch(&self, uri: &str, area: &PatchArea) -> impl Future<Output = Result<RasterBand>> + Send;
}

/// Reads the window of a GeoTIFF covering `area`, loading only the header
/// and the chunks the window overlaps.
pub async fn read_patch<S: RangeSource>(source: &S, area: &PatchArea) -> Result<RasterBand> {
    let mut reader = GeoTiffReader::open(source, HEADER_PREFETCH).await?;
    let Some(window) = area.window(reader.layout())? else {
        debug!(crs = %reader.layout().crs, "Patch does not overlap the raster");
        return Ok(reader.layout().empty_band());
    };
    let band = reader.read_window(window).await?;
    debug!(
        rows = window.rows,
        cols = window.cols,
        loaded = reader.loaded_bytes(),
        "Read band window"
    );
    Ok(band)
}

/// Reads GeoTIFF assets over HTTP(S) with range requests.
#[derive(Clone)]
pub struct HttpAssetFetcher {
    client: reqwest::Client,
}

impl HttpAssetFetcher {
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("failed to build asset HTTP client")?;
        Ok(HttpAssetFetcher { client })
    }
}

impl AssetFetcher for HttpAssetFetcher {
    async fn fetch(&self, uri: &str, area: &PatchArea) -> Result<RasterBand> {
        let source = HttpRange {
            client: &self.client,
            uri,
        };
        read_patch(&source, area).await
    }
}

struct HttpRange<'a> {
    client: &'a reqwest::Client,
    uri: &'a str,
}

impl RangeSource for HttpRange<'_> {
    async fn read_range(&self, offset: u64, len: u64) -> Result<FetchedRange> {
        let end = offset + len.max(1) - 1;
        let response = self
            .client
            .get(self.uri)
            .header(RANGE, format!("bytes={}-{}", offset, end))
            .send()
            .await?
            .error_for_status()?;

        if response.status() == StatusCode::PARTIAL_CONTENT {
            let total_len = response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|value| value.to_str().ok())
                .and_then(content_range_total);
            let bytes = response.bytes().await?.to_vec();
            return Ok(FetchedRange {
                offset,
                bytes,
                total_len,
            });
        }

        let bytes = response.bytes().await?.to_vec();
        debug!(uri = self.uri, bytes = bytes.len(), "Range ignored, got the whole object");
        Ok(FetchedRange {
            offset: 0,
            total_len: Some(bytes.len() as u64),
            bytes,
        })
    }
}

/// Object size from `Content-Range: bytes <first>-<last>/<size>`.
fn content_range_total(value: &str) -> Option<u64> {
    value
        .strip_prefix("bytes ")?
        .rsplit_once('/')?
        .1
        .trim()
        .parse()
        .ok()
}

pub struct BandStackAssembler<F> {
    fetcher: F,
    retry: RetryPolicy,
}

impl<F: AssetFetcher> BandStackAssembler<F> {
    pub fn new(fetcher: F, config: &Config) -> Self {
        BandStackAssembler {
            fetcher,
            retry: RetryPolicy::new(
                config.asset_max_retries,
                config.retry_base_delay(),
                config.request_timeout(),
            ),
        }
    }

    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    /// Builds a `patch_size × patch_size` stack centred on `location`, bands
    /// in the order requested. All bands must resolve, download and share one
    /// CRS or the whole assembly fails.
    ///
    /// The first band fixes the grid. The others are then read concurrently,
    /// limited to the same ground extent.
    pub async fn assemble(
        &self,
        scene: &SceneDescriptor,
        bands: &[String],
        patch_size: usize,
        location: Location,
    ) -> PipelineResult<BandStack> {
        let mut resolved = Vec::with_capacity(bands.len());
        for band in bands {
            let uri = scene
                .asset_refs
                .get(band)
                .ok_or_else(|| PipelineError::MissingBand {
                    scene_id: scene.scene_id.clone(),
                    band: band.clone(),
                })?;
            resolved.push((band.as_str(), uri.as_str()));
        }
        let Some(&(first_band, first_uri)) = resolved.first() else {
            return Err(PipelineError::MissingBand {
                scene_id: scene.scene_id.clone(),
                band: "<none requested>".to_string(),
            });
        };

        let native = PatchArea {
            location,
            patch_size,
            half_extent: None,
        };
        let first = self
            .fetch_band(&scene.scene_id, first_band, first_uri, &native)
            .await?;
        let (x, y) = project_point(location, &first.crs).map_err(|e| {
            PipelineError::PartialStackFailure {
                scene_id: scene.scene_id.clone(),
                band: first_band.to_string(),
                reason: e.to_string(),
            }
        })?;
        let target = patch_transform(x, y, &first.transform, patch_size);

        let shared = PatchArea {
            half_extent: Some(
                patch_size as f64 / 2.0 * target.pixel_width.max(target.pixel_height.abs()),
            ),
            ..native
        };
        let rest = try_join_all(
            resolved[1..]
                .iter()
                .map(|(band, uri)| self.fetch_band(&scene.scene_id, band, uri, &shared)),
        )
        .await?;

        for ((band, _), raster) in resolved[1..].iter().zip(&rest) {
            if raster.crs != first.crs {
                return Err(PipelineError::BandMismatch {
                    scene_id: scene.scene_id.clone(),
                    band: band.to_string(),
                    expected: first.crs.clone(),
                    found: raster.crs.clone(),
                });
            }
        }

        let stacked: Vec<(String, Raster)> = bands
            .iter()
            .zip(std::iter::once(&first).chain(&rest))
            .map(|(band, raster)| (band.clone(), Raster(resample(raster, &target, patch_size))))
            .collect();

        info!(
            scene_id = %scene.scene_id,
            bands = bands.len(),
            patch_size,
            crs = %first.crs,
            "Assembled band stack"
        );

        Ok(BandStack {
            scene_id: scene.scene_id.clone(),
            bands: stacked,
            patch_size,
            coordinate_reference: first.crs.clone(),
            affine_transform: target,
        })
    }

    async fn fetch_band(
        &self,
        scene_id: &str,
        band: &str,
        uri: &str,
        area: &PatchArea,
    ) -> PipelineResult<RasterBand> {
        debug!(scene_id, band, "Fetching band");
        let (result, attempts) = self
            .retry
            .run("band fetch", || self.fetcher.fetch(uri, area))
            .await;

        result.map_err(|e| {
            error!(scene_id, band, attempts, error = %e, "Giving up on band");
            PipelineError::PartialStackFailure {
                scene_id: scene_id.to_string(),
                band: band.to_string(),
                reason: format!("{:#}", e),
            }
        })
    }
}

/// Query point in the raster's CRS. Supports geographic WGS84 and the WGS84
/// UTM zones.
pub fn project_point(location: Location, crs: &str) -> Result<(f64, f64), GeoTiffError> {
    let unsupported = || GeoTiffError::UnsupportedCrs(crs.to_string());
    let code: u32 = crs
        .strip_prefix("EPSG:")
        .and_then(|c| c.parse().ok())
        .ok_or_else(unsupported)?;

    let target = match code {
        4326 => return Ok((location.longitude, location.latitude)),
        32601..=32660 => format!(
            "+proj=utm +zone={} +datum=WGS84 +units=m +no_defs",
            code - 32600
        ),
        32701..=32760 => format!(
            "+proj=utm +zone={} +south +datum=WGS84 +units=m +no_defs",
            code - 32700
        ),
        _ => return Err(unsupported()),
    };

    let source =
        Proj::from_proj_string("+proj=longlat +datum=WGS84 +no_defs").map_err(|_| unsupported())?;
    let target = Proj::from_proj_string(&target).map_err(|_| unsupported())?;

    let mut point = (
        location.longitude.to_radians(),
        location.latitude.to_radians(),
        0.0,
    );
    transform(&source, &target, &mut point).map_err(|_| unsupported())?;
    Ok((point.0, point.1))
}

/// North-up grid of `patch_size` cells per side centred on (x, y), using the
/// reference band's pixel size.
fn patch_transform(x: f64, y: f64, reference: &GeoTransform, patch_size: usize) -> GeoTransform {
    let pixel_width = reference.pixel_width.abs();
    let pixel_height = reference.pixel_height.abs();
    let half = patch_size as f64 / 2.0;
    GeoTransform {
        top_left_x: x - half * pixel_width,
        pixel_width,
        top_left_y: y + half * pixel_height,
        pixel_height: -pixel_height,
    }
}

/// Nearest-neighbour sample of `band` on the target grid; cells that fall
/// outside the band, or that a degenerate transform cannot place, are NaN.
fn resample(band: &RasterBand, target: &GeoTransform, patch_size: usize) -> Array2<f32> {
    let (rows, cols) = band.data.dim();
    Array2::from_shape_fn((patch_size, patch_size), |(row, col)| {
        let (x, y) = target.cell_center(row, col);
        let (c, r) = band.transform.to_pixel(x, y);
        if !(c.is_finite() && r.is_finite()) || c < 0.0 || r < 0.0 {
            return f32::NAN;
        }
        let (c, r) = (c.floor() as usize, r.floor() as usize);
        if r < rows && c < cols {
            band.data[[r, c]]
        } else {
            f32::NAN
        }
    })
}
