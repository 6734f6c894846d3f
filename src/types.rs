use chrono::{DateTime, Utc};
use ndarray::{Array2, Array3};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Reflectance or derived value of a single pixel
pub type Pixel = f32;

/// 2D raster band (y x x)
pub type Band2 = Array2<Pixel>;

/// 3D time stack of one band (time x y x x)
pub type Band3 = Array3<Pixel>;

/// Name of the compositing score band
pub const SCORE_BAND: &str = "score";

/// Name of the day-of-year band
pub const DATE_BAND: &str = "date";

/// Names of the imaging geometry cosine bands
pub const COS_SZA_BAND: &str = "cosSZA";
pub const COS_VZA_BAND: &str = "cosVZA";
pub const COS_RAA_BAND: &str = "cosRAA";

/// Name of the NDVI extra band
pub const NDVI_BAND: &str = "ndvi";

/// Name of the sensor code extra band
pub const SENSOR_CODE_BAND: &str = "ssr_code";

/// Default nodata sentinel, distinct from a legitimate zero reflectance
pub const DEFAULT_NODATA: Pixel = -10000.0;

/// Geographic polygon (lon/lat ring, WGS84)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    /// Outer ring as `[lon, lat]` pairs; closed or open
    pub coordinates: Vec<[f64; 2]>,
}

impl Region {
    pub fn new(coordinates: Vec<[f64; 2]>) -> Self {
        Self { coordinates }
    }

    /// Axis-aligned rectangle helper
    pub fn from_bounds(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Self {
        Self {
            coordinates: vec![
                [min_lon, min_lat],
                [max_lon, min_lat],
                [max_lon, max_lat],
                [min_lon, max_lat],
                [min_lon, min_lat],
            ],
        }
    }

    pub fn bounding_box(&self) -> Option<BoundingBox> {
        let first = self.coordinates.first()?;
        let mut bbox = BoundingBox {
            min_lon: first[0],
            max_lon: first[0],
            min_lat: first[1],
            max_lat: first[1],
        };
        for [lon, lat] in &self.coordinates {
            bbox.min_lon = bbox.min_lon.min(*lon);
            bbox.max_lon = bbox.max_lon.max(*lon);
            bbox.min_lat = bbox.min_lat.min(*lat);
            bbox.max_lat = bbox.max_lat.max(*lat);
        }
        Some(bbox)
    }

    /// Centre of the bounding box as (lon, lat)
    pub fn centre(&self) -> Option<(f64, f64)> {
        self.bounding_box()
            .map(|b| ((b.min_lon + b.max_lon) / 2.0, (b.min_lat + b.max_lat) / 2.0))
    }

    /// GeoJSON geometry object for catalog queries
    pub fn to_geojson(&self) -> serde_json::Value {
        let mut ring: Vec<[f64; 2]> = self.coordinates.clone();
        if let (Some(first), Some(last)) = (ring.first().copied(), ring.last().copied()) {
            if first != last {
                ring.push(first);
            }
        }
        serde_json::json!({
            "type": "Polygon",
            "coordinates": [ring],
        })
    }
}

/// Geospatial bounding box
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub max_lon: f64,
    pub min_lat: f64,
    pub max_lat: f64,
}

/// Affine placement of a north-up raster
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub top_left_y: f64,
    /// Negative for north-up rasters
    pub pixel_height: f64,
}

impl GeoTransform {
    pub fn north_up(top_left_x: f64, top_left_y: f64, resolution: f64) -> Self {
        Self {
            top_left_x,
            pixel_width: resolution,
            top_left_y,
            pixel_height: -resolution,
        }
    }

    /// Map coordinate of a pixel centre
    pub fn pixel_centre(&self, row: usize, col: usize) -> (f64, f64) {
        (
            self.top_left_x + (col as f64 + 0.5) * self.pixel_width,
            self.top_left_y + (row as f64 + 0.5) * self.pixel_height,
        )
    }
}

/// Spatial grid shared by every band of a raster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RasterGrid {
    /// Projection string, e.g. `EPSG:3979`
    pub crs: String,
    pub transform: GeoTransform,
    pub width: usize,
    pub height: usize,
}

impl RasterGrid {
    pub fn new(crs: impl Into<String>, transform: GeoTransform, width: usize, height: usize) -> Self {
        Self {
            crs: crs.into(),
            transform,
            width,
            height,
        }
    }

    /// Array shape as (rows, cols)
    pub fn shape(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    pub fn pixel_count(&self) -> usize {
        self.width * self.height
    }

    /// Integer (row, col) offset of `other`'s top-left pixel inside this grid.
    ///
    /// Fails when the two grids do not share CRS and pixel size, or when
    /// `other` is not snapped to this grid's pixel lattice.
    pub fn offset_of(&self, other: &RasterGrid) -> MosaicResult<(isize, isize)> {
        if !self.crs.eq_ignore_ascii_case(&other.crs) {
            return Err(MosaicError::Processing(format!(
                "Grid CRS mismatch: {} vs {}",
                self.crs, other.crs
            )));
        }

        let a = &self.transform;
        let b = &other.transform;
        let tol = 1e-6 * a.pixel_width.abs().max(1e-12);
        if (a.pixel_width - b.pixel_width).abs() > tol || (a.pixel_height - b.pixel_height).abs() > tol {
            return Err(MosaicError::Processing(format!(
                "Grid resolution mismatch: ({}, {}) vs ({}, {})",
                a.pixel_width, a.pixel_height, b.pixel_width, b.pixel_height
            )));
        }

        let col = (b.top_left_x - a.top_left_x) / a.pixel_width;
        let row = (b.top_left_y - a.top_left_y) / a.pixel_height;
        let (col_r, row_r) = (col.round(), row.round());
        if (col - col_r).abs() > 1e-3 || (row - row_r).abs() > 1e-3 {
            return Err(MosaicError::Processing(format!(
                "Grid is not aligned to the canvas lattice (offset {:.4}, {:.4} pixels)",
                row, col
            )));
        }

        Ok((row_r as isize, col_r as isize))
    }
}

/// One satellite observation after curation. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneItem {
    pub id: String,
    pub datetime: DateTime<Utc>,
    /// Spatial grid code (granule identifier), e.g. `MGRS-17WMU`
    pub grid_code: String,
    pub platform: String,
    pub sensor_code: u16,
    /// Degrees
    pub sun_zenith: f64,
    pub sun_azimuth: f64,
    pub view_zenith: f64,
    pub view_azimuth: f64,
    /// Asset name -> href
    pub assets: BTreeMap<String, String>,
}

impl SceneItem {
    /// Acquisition identifier shared by reprocessed copies of one pass
    pub fn core_id(&self) -> String {
        core_id_of(&self.id)
    }

    /// Cosines of sun zenith, view zenith and relative azimuth
    pub fn angle_cosines(&self) -> (f32, f32, f32) {
        (
            self.sun_zenith.to_radians().cos() as f32,
            self.view_zenith.to_radians().cos() as f32,
            (self.sun_azimuth - self.view_azimuth).to_radians().cos() as f32,
        )
    }
}

/// Core acquisition identifier (sensor, grid cell, acquisition date) of an
/// item id, dropping processing-version parts:
///
/// - Landsat Collection-2 `LC08_L2SP_015028_20230720_02_T1` -> `LC08_015028_20230720`
/// - Sentinel-2 `S2A_17WMU_20230727_0_L2A` -> `S2A_17WMU_20230727`
/// - HLS `HLS.L30.T17WMU.2023207T160831.v2.0` -> `HLS.L30.T17WMU.2023207T160831`
pub fn core_id_of(id: &str) -> String {
    let tokens: Vec<&str> = id.split('_').collect();
    if tokens.len() >= 4 && is_landsat_sensor(tokens[0]) && is_yyyymmdd(tokens[3]) {
        return format!("{}_{}_{}", tokens[0], tokens[2], tokens[3]);
    }
    if tokens.len() > 1 {
        return tokens.iter().take(3).copied().collect::<Vec<_>>().join("_");
    }
    strip_version_suffix(id).to_string()
}

/// `LXSS`: Landsat sensor letter, platform letter and two-digit mission
fn is_landsat_sensor(token: &str) -> bool {
    let b = token.as_bytes();
    b.len() == 4 && b[0] == b'L' && b[1].is_ascii_alphabetic() && b[2..].iter().all(u8::is_ascii_digit)
}

fn is_yyyymmdd(token: &str) -> bool {
    token.len() == 8 && token.bytes().all(|c| c.is_ascii_digit())
}

/// Drop a trailing `.vN[.N...]` collection version
fn strip_version_suffix(id: &str) -> &str {
    match id.rfind(".v") {
        Some(pos) => {
            let version = &id[pos + 2..];
            let numeric = !version.is_empty()
                && version.starts_with(|c: char| c.is_ascii_digit())
                && version.chars().all(|c| c.is_ascii_digit() || c == '.');
            if numeric {
                &id[..pos]
            } else {
                id
            }
        }
        None => id,
    }
}

/// Scene items sharing one spatial grid code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GranuleGroup {
    pub grid_code: String,
    pub items: Vec<SceneItem>,
}

/// Which extra bands are attached to composites
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExtraBands {
    #[default]
    None,
    /// cosSZA, cosVZA, cosRAA
    Angles,
    Ndvi,
    SensorCode,
}

impl ExtraBands {
    pub fn band_names(&self) -> &'static [&'static str] {
        match self {
            ExtraBands::None => &[],
            ExtraBands::Angles => &[COS_SZA_BAND, COS_VZA_BAND, COS_RAA_BAND],
            ExtraBands::Ndvi => &[NDVI_BAND],
            ExtraBands::SensorCode => &[SENSOR_CODE_BAND],
        }
    }
}

impl std::fmt::Display for ExtraBands {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtraBands::None => write!(f, "none"),
            ExtraBands::Angles => write!(f, "angles"),
            ExtraBands::Ndvi => write!(f, "ndvi"),
            ExtraBands::SensorCode => write!(f, "sensor_code"),
        }
    }
}

/// Error types for mosaic processing
#[derive(Debug, thiserror::Error)]
pub enum MosaicError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeouts, connection resets, throttling; safe to retry
    #[error("Transient network error: {0}")]
    Transient(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Invalid data format: {0}")]
    InvalidFormat(String),

    #[error("XML parsing error: {0}")]
    XmlParsing(String),

    #[error("Metadata error: {0}")]
    Metadata(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("No usable catalog items were found")]
    NoItems,

    #[error("Could not read a base image after {attempts} attempts")]
    CanvasUnavailable { attempts: usize },

    #[error("Cluster bring-up timed out: {ready}/{required} workers after {waited_secs}s")]
    ClusterTimeout {
        ready: usize,
        required: usize,
        waited_secs: u64,
    },

    #[error("Worker failed: {0}")]
    WorkerFailed(String),
}

impl MosaicError {
    /// Whether retrying the same operation may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            MosaicError::Transient(_) => true,
            MosaicError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }

    /// Whether the error aborts the whole run
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MosaicError::Config(_)
                | MosaicError::NoItems
                | MosaicError::CanvasUnavailable { .. }
                | MosaicError::ClusterTimeout { .. }
        )
    }
}

impl From<serde_json::Error> for MosaicError {
    fn from(e: serde_json::Error) -> Self {
        MosaicError::InvalidFormat(format!("JSON: {}", e))
    }
}

impl From<quick_xml::Error> for MosaicError {
    fn from(e: quick_xml::Error) -> Self {
        MosaicError::XmlParsing(e.to_string())
    }
}

/// Result type for mosaic operations
pub type MosaicResult<T> = Result<T, MosaicError>;
