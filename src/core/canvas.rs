//! Raster canvas: the shared merge target and the shape of every composite

use crate::io::loader::{LoadRequest, PixelLoader};
use crate::sensors::SensorMeta;
use crate::types::{
    Band2, ExtraBands, GeoTransform, MosaicError, MosaicResult, Pixel, RasterGrid, Region, SceneItem, DATE_BAND,
    SCORE_BAND,
};
use ndarray::{s, Array2, Zip};
use std::ops::Range;

/// Output band set: spectral bands, `date`, `score`, the sensor's quality
/// band, then any extras
pub fn canvas_band_names(sensor: &SensorMeta, extras: ExtraBands) -> Vec<String> {
    let mut names = sensor.spectral_bands.clone();
    names.push(DATE_BAND.to_string());
    names.push(SCORE_BAND.to_string());
    names.push(sensor.mask.band().to_string());
    names.extend(extras.band_names().iter().map(|s| s.to_string()));
    names
}

/// Ordered, named 2D bands over one grid
#[derive(Debug, Clone, PartialEq)]
pub struct RasterCanvas {
    pub grid: RasterGrid,
    pub nodata: Pixel,
    bands: Vec<(String, Band2)>,
}

impl RasterCanvas {
    /// Canvas with every band filled with `nodata`
    pub fn filled(grid: RasterGrid, nodata: Pixel, band_names: &[String]) -> Self {
        let shape = grid.shape();
        let bands = band_names
            .iter()
            .map(|name| (name.clone(), Array2::from_elem(shape, nodata)))
            .collect();
        Self { grid, nodata, bands }
    }

    pub fn shape(&self) -> (usize, usize) {
        self.grid.shape()
    }

    pub fn band_names(&self) -> Vec<&str> {
        self.bands.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn has_band(&self, name: &str) -> bool {
        self.bands.iter().any(|(n, _)| n == name)
    }

    pub fn band(&self, name: &str) -> Option<&Band2> {
        self.bands.iter().find(|(n, _)| n == name).map(|(_, b)| b)
    }

    pub fn band_mut(&mut self, name: &str) -> Option<&mut Band2> {
        self.bands.iter_mut().find(|(n, _)| n == name).map(|(_, b)| b)
    }

    pub fn bands(&self) -> impl Iterator<Item = (&str, &Band2)> {
        self.bands.iter().map(|(n, b)| (n.as_str(), b))
    }

    pub(crate) fn bands_mut(&mut self) -> impl Iterator<Item = (&str, &mut Band2)> {
        self.bands.iter_mut().map(|(n, b)| (n.as_str(), b))
    }

    /// Add or replace a band; its shape must match the grid
    pub fn insert_band(&mut self, name: &str, data: Band2) -> MosaicResult<()> {
        if data.dim() != self.shape() {
            return Err(MosaicError::Processing(format!(
                "Band {} has shape {:?}, canvas is {:?}",
                name,
                data.dim(),
                self.shape()
            )));
        }
        match self.band_mut(name) {
            Some(existing) => *existing = data,
            None => self.bands.push((name.to_string(), data)),
        }
        Ok(())
    }

    pub fn into_bands(self) -> Vec<(String, Band2)> {
        self.bands
    }

    /// Sub-raster over `rows x cols`, with its grid origin moved to match
    pub fn crop(&self, rows: Range<usize>, cols: Range<usize>) -> RasterCanvas {
        let t = &self.grid.transform;
        let transform = GeoTransform {
            top_left_x: t.top_left_x + cols.start as f64 * t.pixel_width,
            top_left_y: t.top_left_y + rows.start as f64 * t.pixel_height,
            ..*t
        };
        let grid = RasterGrid::new(self.grid.crs.clone(), transform, cols.len(), rows.len());
        let bands = self
            .bands
            .iter()
            .map(|(name, band)| (name.clone(), band.slice(s![rows.clone(), cols.clone()]).to_owned()))
            .collect();
        RasterCanvas {
            grid,
            nodata: self.nodata,
            bands,
        }
    }

    /// Reset every band to nodata where `date` is not positive; returns the
    /// number of undated pixels
    pub fn mask_undated(&mut self) -> usize {
        let nodata = self.nodata;
        let undated: Array2<bool> = match self.band(DATE_BAND) {
            Some(date) => date.mapv(|d| !(d > 0.0) || d == nodata),
            None => return 0,
        };
        for (_, band) in self.bands.iter_mut() {
            Zip::from(band).and(&undated).for_each(|v, &masked| {
                if masked {
                    *v = nodata;
                }
            });
        }
        undated.iter().filter(|&&m| m).count()
    }

    /// Pixels holding an observation, judged by the score band
    pub fn covered_pixels(&self) -> usize {
        let nodata = self.nodata;
        self.band(SCORE_BAND)
            .map(|score| score.iter().filter(|&&v| v.is_finite() && v != nodata).count())
            .unwrap_or(0)
    }

    pub fn coverage_fraction(&self) -> f64 {
        let total = self.grid.pixel_count();
        if total == 0 {
            return 0.0;
        }
        self.covered_pixels() as f64 / total as f64
    }
}

/// Allocates the base canvas from the first readable catalog item
pub struct CanvasBuilder<'a> {
    loader: &'a dyn PixelLoader,
    sensor: &'a SensorMeta,
    crs: String,
    resolution: f64,
    nodata: Pixel,
    extras: ExtraBands,
    max_attempts: usize,
}

impl<'a> CanvasBuilder<'a> {
    pub fn new(loader: &'a dyn PixelLoader, sensor: &'a SensorMeta, crs: &str, resolution: f64) -> Self {
        Self {
            loader,
            sensor,
            crs: crs.to_string(),
            resolution,
            nodata: crate::types::DEFAULT_NODATA,
            extras: ExtraBands::None,
            max_attempts: 20,
        }
    }

    pub fn with_nodata(mut self, nodata: Pixel) -> Self {
        self.nodata = nodata;
        self
    }

    pub fn with_extras(mut self, extras: ExtraBands) -> Self {
        self.extras = extras;
        self
    }

    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Read candidate items in order until one yields a grid over `region`
    pub fn build(&self, items: &[SceneItem], region: &Region) -> MosaicResult<RasterCanvas> {
        let request = LoadRequest {
            crs: self.crs.clone(),
            resolution: self.resolution,
            region: Some(region.clone()),
        };
        let bands = self.sensor.load_bands();

        let mut attempts = 0;
        for item in items.iter().take(self.max_attempts) {
            attempts += 1;
            match self.loader.load(std::slice::from_ref(item), &bands, &request) {
                Ok(cube) if cube.grid.pixel_count() > 0 => {
                    let names = canvas_band_names(self.sensor, self.extras);
                    log::info!(
                        "Base canvas {}x{} ({} bands) from {} after {} attempt(s)",
                        cube.grid.height,
                        cube.grid.width,
                        names.len(),
                        item.id,
                        attempts
                    );
                    return Ok(RasterCanvas::filled(cube.grid, self.nodata, &names));
                }
                Ok(_) => log::warn!("Base image candidate {} returned an empty grid", item.id),
                Err(e) => log::warn!("Base image candidate {} unreadable: {}", item.id, e),
            }
        }

        Err(MosaicError::CanvasUnavailable { attempts })
    }
}
