//! Windowed GeoTIFF reads. Only the header and the chunks (tiles or strips)
//! overlapping the requested pixel window are loaded from the source.
//!
//! Reads tags 33550 (ModelPixelScale), 33922 (ModelTiepoint),
//! 34735 (GeoKeyDirectory) and 42113 (GDAL_NODATA).

use super::models::GeoTransform;
use anyhow::{Result, bail};
use futures::future::try_join_all;
use ndarray::Array2;
use std::collections::BTreeMap;
use std::future::Future;
use std::io::{self, Read, Seek, SeekFrom};
use thiserror::Error;
use tiff::decoder::{ChunkType, Decoder, DecodingResult};
use tiff::tags::Tag;
use tiff::{ColorType, TiffError};
use tracing::debug;

pub const MODEL_PIXEL_SCALE: u16 = 33550;
pub const MODEL_TIEPOINT: u16 = 33922;
pub const GEO_KEY_DIRECTORY: u16 = 34735;
pub const GDAL_NODATA: u16 = 42113;

const GEOGRAPHIC_TYPE_GEO_KEY: u16 = 2048;
const PROJECTED_CS_TYPE_GEO_KEY: u16 = 3072;

/// First read of a remote file. Cloud-optimized GeoTIFFs keep every IFD
/// and tag array within it.
pub const HEADER_PREFETCH: u64 = 64 * 1024;
const MAX_HEADER_READS: usize = 8;

/// One decoded band with its georeferencing.
#[derive(Debug, Clone)]
pub struct RasterBand {
    pub data: Array2<f32>,
    /// `EPSG:<code>`
    pub crs: String,
    pub transform: GeoTransform,
}

#[derive(Debug, Error)]
pub enum GeoTiffError {
    #[error("bytes {offset}..{} are not loaded", .offset + .len)]
    NeedsBytes { offset: u64, len: u64 },

    #[error("invalid GeoTIFF: {0}")]
    Invalid(String),

    #[error("raster CRS {0} is not supported")]
    UnsupportedCrs(String),

    #[error("GeoTIFF decoding failed: {0}")]
    Decode(TiffError),
}

impl From<TiffError> for GeoTiffError {
    fn from(e: TiffError) -> Self {
        if let TiffError::IoError(io) = &e {
            if let Some(gap) = io.get_ref().and_then(|inner| inner.downcast_ref::<Gap>()) {
                return GeoTiffError::NeedsBytes {
                    offset: gap.offset,
                    len: gap.len,
                };
            }
        }
        GeoTiffError::Decode(e)
    }
}

#[derive(Debug, Error)]
#[error("read of {len} bytes at {offset} is outside the loaded ranges")]
struct Gap {
    offset: u64,
    len: u64,
}

/// Byte ranges of one file loaded so far.
#[derive(Debug, Default, Clone)]
pub struct ByteRanges {
    segments: BTreeMap<u64, Vec<u8>>,
    file_len: Option<u64>,
}

impl ByteRanges {
    pub fn new() -> Self {
        ByteRanges::default()
    }

    pub fn complete(bytes: Vec<u8>) -> Self {
        let mut ranges = ByteRanges::new();
        ranges.file_len = Some(bytes.len() as u64);
        ranges.insert(0, bytes);
        ranges
    }

    pub fn insert(&mut self, offset: u64, bytes: Vec<u8>) {
        if bytes.is_empty() {
            return;
        }
        let slot = self.segments.entry(offset).or_default();
        if bytes.len() > slot.len() {
            *slot = bytes;
        }
    }

    pub fn set_file_len(&mut self, len: u64) {
        self.file_len = Some(len);
    }

    /// Whether `offset..offset + len` lies within a single loaded segment.
    pub fn covers(&self, offset: u64, len: u64) -> bool {
        self.segment_at(offset)
            .is_some_and(|(start, data)| start + data.len() as u64 >= offset + len)
    }

    pub fn loaded_bytes(&self) -> usize {
        self.segments.values().map(Vec::len).sum()
    }

    fn segment_at(&self, pos: u64) -> Option<(u64, &[u8])> {
        self.segments
            .range(..=pos)
            .rev()
            .find(|(start, data)| **start + data.len() as u64 > pos)
            .map(|(start, data)| (*start, data.as_slice()))
    }

    fn reader(&self) -> RangeReader<'_> {
        RangeReader {
            ranges: self,
            pos: 0,
        }
    }
}

/// `Read + Seek` over [`ByteRanges`]. Reading an unloaded byte fails with a
/// [`Gap`] naming it.
struct RangeReader<'a> {
    ranges: &'a ByteRanges,
    pos: u64,
}

impl Read for RangeReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || self.ranges.file_len.is_some_and(|len| self.pos >= len) {
            return Ok(0);
        }
        match self.ranges.segment_at(self.pos) {
            Some((start, data)) => {
                let from = (self.pos - start) as usize;
                let n = buf.len().min(data.len() - from);
                buf[..n].copy_from_slice(&data[from..from + n]);
                self.pos += n as u64;
                Ok(n)
            }
            None => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                Gap {
                    offset: self.pos,
                    len: buf.len() as u64,
                },
            )),
        }
    }
}

impl Seek for RangeReader<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
            SeekFrom::End(delta) => self
                .ranges
                .file_len
                .and_then(|len| len.checked_add_signed(delta)),
        };
        self.pos = target
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "seek outside the file"))?;
        Ok(self.pos)
    }
}

/// Rows and columns of a raster, half-open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelWindow {
    pub row: u32,
    pub col: u32,
    pub rows: u32,
    pub cols: u32,
}

/// Everything needed to locate pixels, read from the first IFD.
#[derive(Debug, Clone)]
pub struct GeoTiffLayout {
    pub width: u32,
    pub height: u32,
    pub chunk_width: u32,
    pub chunk_height: u32,
    chunk_offsets: Vec<u64>,
    chunk_byte_counts: Vec<u64>,
    pub crs: String,
    pub transform: GeoTransform,
    pub nodata: Option<f64>,
}

impl GeoTiffLayout {
    pub fn read(ranges: &ByteRanges) -> Result<Self, GeoTiffError> {
        let mut decoder = Decoder::new(ranges.reader())?;

        let colortype = decoder.colortype()?;
        if !matches!(colortype, ColorType::Gray(_)) {
            return Err(GeoTiffError::Invalid(format!(
                "expected a single-band raster, got {:?}",
                colortype
            )));
        }
        let (width, height) = decoder.dimensions()?;
        let (chunk_width, chunk_height) = decoder.chunk_dimensions();
        let (offsets_tag, counts_tag) = match decoder.get_chunk_type() {
            ChunkType::Tile => (Tag::TileOffsets, Tag::TileByteCounts),
            ChunkType::Strip => (Tag::StripOffsets, Tag::StripByteCounts),
        };
        let chunk_offsets = decoder.get_tag_u64_vec(offsets_tag)?;
        let chunk_byte_counts = decoder.get_tag_u64_vec(counts_tag)?;
        if chunk_width == 0 || chunk_height == 0 || chunk_offsets.len() != chunk_byte_counts.len() {
            return Err(GeoTiffError::Invalid("inconsistent chunk layout".to_string()));
        }

        let scale = decoder.get_tag_f64_vec(Tag::from_u16_exhaustive(MODEL_PIXEL_SCALE))?;
        let tiepoint = decoder.get_tag_f64_vec(Tag::from_u16_exhaustive(MODEL_TIEPOINT))?;
        if scale.len() < 2 || tiepoint.len() < 6 {
            return Err(GeoTiffError::Invalid(
                "malformed ModelPixelScale/ModelTiepoint tags".to_string(),
            ));
        }
        if !scale[..2].iter().all(|s| s.is_finite() && *s > 0.0) {
            return Err(GeoTiffError::Invalid(format!(
                "pixel scale must be positive, got {:?}",
                &scale[..2]
            )));
        }
        let transform = GeoTransform {
            top_left_x: tiepoint[3] - tiepoint[0] * scale[0],
            pixel_width: scale[0],
            top_left_y: tiepoint[4] + tiepoint[1] * scale[1],
            pixel_height: -scale[1],
        };

        let geo_keys = decoder.get_tag_u16_vec(Tag::from_u16_exhaustive(GEO_KEY_DIRECTORY))?;
        let epsg = epsg_from_geo_keys(&geo_keys)
            .ok_or_else(|| GeoTiffError::Invalid("GeoKeyDirectory has no EPSG code".to_string()))?;

        let nodata = decoder
            .find_tag(Tag::from_u16_exhaustive(GDAL_NODATA))?
            .and_then(|value| value.into_string().ok())
            .and_then(|s| s.trim_end_matches('\0').trim().parse::<f64>().ok());

        Ok(GeoTiffLayout {
            width,
            height,
            chunk_width,
            chunk_height,
            chunk_offsets,
            chunk_byte_counts,
            crs: format!("EPSG:{}", epsg),
            transform,
            nodata,
        })
    }

    pub fn full_window(&self) -> PixelWindow {
        PixelWindow {
            row: 0,
            col: 0,
            rows: self.height,
            cols: self.width,
        }
    }

    /// Pixels touching the map box `[min_x, max_x] × [min_y, max_y]`, clipped
    /// to the raster. `None` when the box misses the raster.
    pub fn window_for(&self, min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Option<PixelWindow> {
        let (c0, r0) = self.transform.to_pixel(min_x, max_y);
        let (c1, r1) = self.transform.to_pixel(max_x, min_y);
        let clip = |a: f64, b: f64, limit: u32| -> Option<(u32, u32)> {
            let lo = a.min(b).floor().max(0.0);
            let hi = a.max(b).ceil().min(limit as f64);
            (lo.is_finite() && hi.is_finite() && lo < hi).then(|| (lo as u32, hi as u32))
        };
        let (col, col_end) = clip(c0, c1, self.width)?;
        let (row, row_end) = clip(r0, r1, self.height)?;
        Some(PixelWindow {
            row,
            col,
            rows: row_end - row,
            cols: col_end - col,
        })
    }

    fn chunks_across(&self) -> u32 {
        self.width.div_ceil(self.chunk_width)
    }

    /// Indices of the chunks overlapping `window`.
    pub fn chunks_in(&self, window: &PixelWindow) -> Vec<u32> {
        if window.rows == 0 || window.cols == 0 {
            return Vec::new();
        }
        let across = self.chunks_across();
        let rows = window.row / self.chunk_height..=(window.row + window.rows - 1) / self.chunk_height;
        let cols = window.col / self.chunk_width..=(window.col + window.cols - 1) / self.chunk_width;
        rows.flat_map(|chunk_row| cols.clone().map(move |chunk_col| chunk_row * across + chunk_col))
            .filter(|index| (*index as usize) < self.chunk_offsets.len())
            .collect()
    }

    /// File offset and length of one chunk.
    pub fn chunk_range(&self, index: u32) -> Option<(u64, u64)> {
        let index = index as usize;
        Some((*self.chunk_offsets.get(index)?, *self.chunk_byte_counts.get(index)?))
    }

    /// Zero-sized band carrying this raster's georeferencing.
    pub fn empty_band(&self) -> RasterBand {
        RasterBand {
            data: Array2::zeros((0, 0)),
            crs: self.crs.clone(),
            transform: self.transform.clone(),
        }
    }
}

/// Decodes `window` from `ranges`, which must hold every chunk it overlaps.
pub fn decode_window(
    ranges: &ByteRanges,
    layout: &GeoTiffLayout,
    window: PixelWindow,
) -> Result<RasterBand, GeoTiffError> {
    let mut decoder = Decoder::new(ranges.reader())?;
    let mut data = Array2::from_elem((window.rows as usize, window.cols as usize), f32::NAN);
    let across = layout.chunks_across();

    for index in layout.chunks_in(&window) {
        let values = samples(decoder.read_chunk(index)?)?;
        let (chunk_cols, chunk_rows) = decoder.chunk_data_dimensions(index);
        let origin_row = (index / across) * layout.chunk_height;
        let origin_col = (index % across) * layout.chunk_width;

        for r in 0..chunk_rows {
            let row = origin_row + r;
            if row < window.row || row >= window.row + window.rows {
                continue;
            }
            for c in 0..chunk_cols {
                let col = origin_col + c;
                if col < window.col || col >= window.col + window.cols {
                    continue;
                }
                if let Some(value) = values.get((r * chunk_cols + c) as usize) {
                    data[[(row - window.row) as usize, (col - window.col) as usize]] = *value;
                }
            }
        }
    }

    if let Some(nodata) = layout.nodata {
        let nodata = nodata as f32;
        data.mapv_inplace(|v| if v == nodata { f32::NAN } else { v });
    }

    let t = &layout.transform;
    Ok(RasterBand {
        data,
        crs: layout.crs.clone(),
        transform: GeoTransform {
            top_left_x: t.top_left_x + window.col as f64 * t.pixel_width,
            pixel_width: t.pixel_width,
            top_left_y: t.top_left_y + window.row as f64 * t.pixel_height,
            pixel_height: t.pixel_height,
        },
    })
}

fn samples(result: DecodingResult) -> Result<Vec<f32>, GeoTiffError> {
    Ok(match result {
        DecodingResult::U8(buf) => buf.into_iter().map(|v| v as f32).collect(),
        DecodingResult::U16(buf) => buf.into_iter().map(|v| v as f32).collect(),
        DecodingResult::U32(buf) => buf.into_iter().map(|v| v as f32).collect(),
        DecodingResult::I8(buf) => buf.into_iter().map(|v| v as f32).collect(),
        DecodingResult::I16(buf) => buf.into_iter().map(|v| v as f32).collect(),
        DecodingResult::I32(buf) => buf.into_iter().map(|v| v as f32).collect(),
        DecodingResult::F32(buf) => buf,
        DecodingResult::F64(buf) => buf.into_iter().map(|v| v as f32).collect(),
        _ => return Err(GeoTiffError::Invalid("unsupported sample format".to_string())),
    })
}

/// Projected CRS code if present, else the geographic one.
///
/// Layout: a 4-short header (version, revision, minor, key count) followed by
/// `(key id, tag location, count, value)` entries. Only inline values
/// (location 0) are considered.
pub fn epsg_from_geo_keys(keys: &[u16]) -> Option<u16> {
    if keys.len() < 4 {
        return None;
    }
    let count = keys[3] as usize;
    let entries: Vec<&[u16]> = keys[4..]
        .chunks_exact(4)
        .take(count)
        .collect();
    let lookup = |wanted: u16| {
        entries
            .iter()
            .find(|entry| entry[0] == wanted && entry[1] == 0)
            .map(|entry| entry[3])
            .filter(|code| *code != 0 && *code != 32767)
    };
    lookup(PROJECTED_CS_TYPE_GEO_KEY).or_else(|| lookup(GEOGRAPHIC_TYPE_GEO_KEY))
}

/// Bytes of one remote object.
pub struct FetchedRange {
    pub offset: u64,
    pub bytes: Vec<u8>,
    /// Size of the whole object when the source reports it.
    pub total_len: Option<u64>,
}

/// Random access to one remote object.
pub trait RangeSource: Send + Sync {
    /// Up to `len` bytes from `offset`. A source that cannot serve ranges may
    /// answer with the whole object at offset 0.
    fn read_range(&self, offset: u64, len: u64) -> impl Future<Output = Result<FetchedRange>> + Send;
}

/// Reads pixel windows out of a GeoTIFF behind a [`RangeSource`].
pub struct GeoTiffReader<'a, S> {
    source: &'a S,
    ranges: ByteRanges,
    layout: GeoTiffLayout,
}

impl<'a, S: RangeSource> GeoTiffReader<'a, S> {
    /// Loads `prefetch` bytes, then whatever else the IFD and its tag arrays
    /// turn out to need.
    pub async fn open(source: &'a S, prefetch: u64) -> Result<Self> {
        let mut ranges = ByteRanges::new();
        load(source, &mut ranges, 0, prefetch).await?;
        for _ in 0..MAX_HEADER_READS {
            match GeoTiffLayout::read(&ranges) {
                Ok(layout) => {
                    return Ok(GeoTiffReader {
                        source,
                        ranges,
                        layout,
                    });
                }
                Err(GeoTiffError::NeedsBytes { offset, len }) => {
                    debug!(offset, len, "GeoTIFF header continues beyond loaded bytes");
                    load(source, &mut ranges, offset, len.max(prefetch)).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(GeoTiffError::Invalid(format!(
            "header still incomplete after {} reads",
            MAX_HEADER_READS
        ))
        .into())
    }

    pub fn layout(&self) -> &GeoTiffLayout {
        &self.layout
    }

    pub fn loaded_bytes(&self) -> usize {
        self.ranges.loaded_bytes()
    }

    /// Fetches the chunks `window` overlaps, concurrently, and decodes it.
    pub async fn read_window(&mut self, window: PixelWindow) -> Result<RasterBand> {
        let missing: Vec<(u64, u64)> = self
            .layout
            .chunks_in(&window)
            .into_iter()
            .filter_map(|index| self.layout.chunk_range(index))
            .filter(|(offset, len)| *len > 0 && !self.ranges.covers(*offset, *len))
            .collect();
        let source = self.source;
        let fetched = try_join_all(
            missing
                .iter()
                .map(|(offset, len)| source.read_range(*offset, *len)),
        )
        .await?;
        for range in fetched {
            self.ranges.insert(range.offset, range.bytes);
        }
        debug!(chunks = missing.len(), loaded = self.ranges.loaded_bytes(), "Loaded window chunks");
        Ok(decode_window(&self.ranges, &self.layout, window)?)
    }
}

async fn load<S: RangeSource>(source: &S, ranges: &mut ByteRanges, offset: u64, len: u64) -> Result<()> {
    let fetched = source.read_range(offset, len).await?;
    if fetched.bytes.is_empty() {
        bail!(GeoTiffError::Invalid(format!("no bytes at offset {}", offset)));
    }
    if let Some(total) = fetched.total_len {
        ranges.set_file_len(total);
    }
    ranges.insert(fetched.offset, fetched.bytes);
    Ok(())
}
