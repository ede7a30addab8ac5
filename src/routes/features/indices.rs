//! Spectral index math over co-registered bands.
//!
//! Denominators of NDVI and NBR carry an additive epsilon instead of per-pixel
//! masking, so a pixel with both inputs at zero yields 0 rather than NaN.
//! EVI keeps its canonical `+ 1` term and no epsilon.

use super::models::{BandRoles, BandStack, Raster, SpectralIndices};
use crate::error::{PipelineError, PipelineResult};
use ndarray::{Array2, Zip};

pub const EPSILON: f32 = 1e-6;

// MODIS EVI coefficients
const EVI_GAIN: f32 = 2.5;
const EVI_C1: f32 = 6.0;
const EVI_C2: f32 = 7.5;
const EVI_L: f32 = 1.0;

fn ensure_same_shape(index: &'static str, first: &Array2<f32>, other: &Array2<f32>) -> PipelineResult<()> {
    if first.shape() != other.shape() {
        return Err(PipelineError::ShapeMismatch {
            index,
            expected: first.shape().to_vec(),
            found: other.shape().to_vec(),
        });
    }
    Ok(())
}

/// NDVI = (NIR - RED) / (NIR + RED + ε)
pub fn ndvi(red: &Array2<f32>, nir: &Array2<f32>) -> PipelineResult<Array2<f32>> {
    ensure_same_shape("NDVI", red, nir)?;
    Ok(Zip::from(nir)
        .and(red)
        .map_collect(|&n, &r| (n - r) / (n + r + EPSILON)))
}

/// EVI = 2.5 × (NIR - RED) / (NIR + 6·RED - 7.5·BLUE + 1)
pub fn evi(red: &Array2<f32>, nir: &Array2<f32>, blue: &Array2<f32>) -> PipelineResult<Array2<f32>> {
    ensure_same_shape("EVI", red, nir)?;
    ensure_same_shape("EVI", red, blue)?;
    Ok(Zip::from(nir)
        .and(red)
        .and(blue)
        .map_collect(|&n, &r, &b| EVI_GAIN * (n - r) / (n + EVI_C1 * r - EVI_C2 * b + EVI_L)))
}

/// NBR = (NIR - SWIR2) / (NIR + SWIR2 + ε)
pub fn nbr(nir: &Array2<f32>, swir2: &Array2<f32>) -> PipelineResult<Array2<f32>> {
    ensure_same_shape("NBR", nir, swir2)?;
    Ok(Zip::from(nir)
        .and(swir2)
        .map_collect(|&n, &s| (n - s) / (n + s + EPSILON)))
}

/// Computes every index whose input bands are present in the stack.
pub fn compute_indices(stack: &BandStack, roles: &BandRoles) -> PipelineResult<SpectralIndices> {
    let red = stack.band(&roles.red);
    let nir = stack.band(&roles.nir);
    let blue = stack.band(&roles.blue);
    let swir2 = stack.band(&roles.swir2);

    let ndvi = match (red, nir) {
        (Some(red), Some(nir)) => Some(Raster(ndvi(red, nir)?)),
        _ => None,
    };
    let evi = match (red, nir, blue) {
        (Some(red), Some(nir), Some(blue)) => Some(Raster(evi(red, nir, blue)?)),
        _ => None,
    };
    let nbr = match (nir, swir2) {
        (Some(nir), Some(swir2)) => Some(Raster(nbr(nir, swir2)?)),
        _ => None,
    };

    Ok(SpectralIndices { ndvi, evi, nbr })
}
