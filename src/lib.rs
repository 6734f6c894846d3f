//! eomosaic: best-pixel compositing of optical satellite scenes
//!
//! Builds a cloud-free mosaic for a region and time window from many
//! partially cloudy Sentinel-2, Landsat or HLS scenes. Every output pixel
//! takes the observation with the highest temporal x spectral score; granule
//! composites are produced in parallel and merged into one canvas.

pub mod core;
pub mod io;
pub mod params;
pub mod sensors;
pub mod types;

#[cfg(feature = "python")]
mod python;

// Re-export main types and functions for easier access
pub use types::{
    ExtraBands, GeoTransform, GranuleGroup, MosaicError, MosaicResult, RasterGrid, Region, SceneItem, DEFAULT_NODATA,
};

pub use crate::core::{GranuleComposite, Mosaic, MosaicEngine, MosaicStats, RasterCanvas};
pub use io::{HttpClient, PixelCube, PixelLoader, SceneCatalog, ViewAngleSource};
pub use params::{ClusterConfig, MosaicParams, NetworkConfig, PoolConfig, ValidatedParams};
pub use sensors::{sensor_meta, SensorFamily, SensorMeta};
