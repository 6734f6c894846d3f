//! Pixel loader seam and the in-memory time cube it produces

use crate::types::{Band3, MosaicError, MosaicResult, RasterGrid, Region, SceneItem};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Target grid parameters for a load
#[derive(Debug, Clone, PartialEq)]
pub struct LoadRequest {
    pub crs: String,
    pub resolution: f64,
    /// Clip to this region; `None` loads each granule's full footprint
    pub region: Option<Region>,
}

/// Raster stack of one granule: every band is (time, y, x) over `grid`
#[derive(Debug, Clone)]
pub struct PixelCube {
    pub grid: RasterGrid,
    /// Scene id per time slice
    pub scene_ids: Vec<String>,
    /// Acquisition time per time slice
    pub times: Vec<DateTime<Utc>>,
    pub bands: HashMap<String, Band3>,
}

impl PixelCube {
    /// Build a cube, checking that every band matches the time axis and grid
    pub fn new(
        grid: RasterGrid,
        scene_ids: Vec<String>,
        times: Vec<DateTime<Utc>>,
        bands: HashMap<String, Band3>,
    ) -> MosaicResult<Self> {
        if scene_ids.len() != times.len() {
            return Err(MosaicError::InvalidFormat(format!(
                "Cube has {} scene ids but {} timestamps",
                scene_ids.len(),
                times.len()
            )));
        }
        let expected = (times.len(), grid.height, grid.width);
        for (name, band) in &bands {
            if band.dim() != expected {
                return Err(MosaicError::InvalidFormat(format!(
                    "Band {} has shape {:?}, expected {:?}",
                    name,
                    band.dim(),
                    expected
                )));
            }
        }
        Ok(Self {
            grid,
            scene_ids,
            times,
            bands,
        })
    }

    pub fn time_len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty() || self.grid.pixel_count() == 0
    }

    pub fn band(&self, name: &str) -> Option<&Band3> {
        self.bands.get(name)
    }
}

/// Loads pixel values for a set of scenes into a [`PixelCube`].
///
/// Implementations own reprojection and clipping. Bands that cannot be found
/// may be left out of the cube rather than failing the load; network trouble
/// should surface as [`MosaicError::Transient`] so callers can retry.
pub trait PixelLoader: Send + Sync {
    fn load(&self, items: &[SceneItem], bands: &[String], request: &LoadRequest) -> MosaicResult<PixelCube>;
}
