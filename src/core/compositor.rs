//! Granule compositing: load a granule's time series, score every
//! observation and keep the best one per pixel.

use crate::core::canvas::{canvas_band_names, RasterCanvas};
use crate::core::scoring::{
    best_time_index, day_of_year, day_offset, nan_median, period_centre, spectral_score, temporal_score,
    ScoreReference, SpectralPixel,
};
use crate::core::tiling::{Block, BlockLayout};
use crate::io::loader::{LoadRequest, PixelCube, PixelLoader};
use crate::io::retry::RetryPolicy;
use crate::params::ValidatedParams;
use crate::sensors::{QualityMask, SensorMeta};
use crate::types::{
    Band2, Band3, ExtraBands, GranuleGroup, MosaicResult, Pixel, RasterGrid, SceneItem, COS_RAA_BAND, COS_SZA_BAND,
    COS_VZA_BAND, DATE_BAND, NDVI_BAND, SCORE_BAND, SENSOR_CODE_BAND,
};
use chrono::NaiveDate;
use ndarray::{s, Array2};
use std::collections::HashMap;
use std::sync::Arc;

/// Everything a compositor needs besides the loader and the canvas grid
#[derive(Debug, Clone)]
pub struct CompositeSettings {
    pub load_bands: Vec<String>,
    pub canvas_bands: Vec<String>,
    pub request: LoadRequest,
    pub mid_date: NaiveDate,
    pub extras: ExtraBands,
    pub nodata: Pixel,
    pub block_size: usize,
    pub retry: RetryPolicy,
}

impl CompositeSettings {
    pub fn from_params(params: &ValidatedParams) -> Self {
        Self {
            load_bands: params.sensor.load_bands(),
            canvas_bands: canvas_band_names(&params.sensor, params.extra_bands),
            request: LoadRequest {
                crs: params.projection.clone(),
                resolution: params.resolution,
                region: None,
            },
            mid_date: period_centre(params.start, params.end),
            extras: params.extra_bands,
            nodata: params.nodata,
            block_size: params.block_size,
            retry: params.load_retry,
        }
    }
}

/// Time-collapsed raster of one granule, cropped to the canvas
#[derive(Debug, Clone)]
pub struct GranuleComposite {
    pub grid_code: String,
    /// Placement of the raster's top-left pixel in the canvas
    pub row_offset: usize,
    pub col_offset: usize,
    pub raster: RasterCanvas,
    /// Time slices in the loaded cube
    pub scenes_loaded: usize,
}

/// Produces one composite per granule. Cheap to clone; holds no mutable state.
#[derive(Clone)]
pub struct GranuleCompositor {
    loader: Arc<dyn PixelLoader>,
    sensor: SensorMeta,
    canvas_grid: RasterGrid,
    settings: CompositeSettings,
}

impl GranuleCompositor {
    pub fn new(
        loader: Arc<dyn PixelLoader>,
        sensor: SensorMeta,
        canvas_grid: RasterGrid,
        settings: CompositeSettings,
    ) -> Self {
        Self {
            loader,
            sensor,
            canvas_grid,
            settings,
        }
    }

    /// Composite one granule.
    ///
    /// Returns `Ok(None)` when the pixel load gives up, when the cube lacks
    /// the bands needed for scoring, or when nothing lands on the canvas.
    /// Misaligned grids are reported as errors.
    pub fn composite(&self, granule: &GranuleGroup) -> MosaicResult<Option<GranuleComposite>> {
        log::debug!(
            "Compositing granule {} from {} scenes",
            granule.grid_code,
            granule.items.len()
        );

        let label = format!("load granule {}", granule.grid_code);
        let load = self.settings.retry.run(&label, || {
            self.loader
                .load(&granule.items, &self.settings.load_bands, &self.settings.request)
        });
        let cube = match load {
            Ok(cube) => cube,
            Err(e) => {
                log::warn!("Granule {}: pixel load abandoned ({})", granule.grid_code, e);
                return Ok(None);
            }
        };
        if cube.is_empty() {
            log::warn!("Granule {}: loader returned no pixels", granule.grid_code);
            return Ok(None);
        }

        let Some(stack) = ObservationStack::new(&cube, granule, &self.sensor, &self.settings) else {
            return Ok(None);
        };

        let layout = BlockLayout::new(cube.grid.height, cube.grid.width, self.settings.block_size);
        let blocks = layout.blocks();
        let results = composite_blocks(&stack, &blocks);

        let mut raster = RasterCanvas::filled(cube.grid.clone(), self.settings.nodata, &self.settings.canvas_bands);
        for (block, arrays) in blocks.iter().zip(results) {
            for ((_, band), values) in raster.bands_mut().zip(arrays) {
                band.slice_mut(s![block.rows.clone(), block.cols.clone()]).assign(&values);
            }
        }
        raster.mask_undated();

        self.place_on_canvas(granule, raster, cube.time_len())
    }

    fn place_on_canvas(
        &self,
        granule: &GranuleGroup,
        raster: RasterCanvas,
        scenes_loaded: usize,
    ) -> MosaicResult<Option<GranuleComposite>> {
        let (row_off, col_off) = self.canvas_grid.offset_of(&raster.grid)?;
        let (height, width) = raster.shape();

        let rows = clip(row_off, height, self.canvas_grid.height);
        let cols = clip(col_off, width, self.canvas_grid.width);
        let (Some((r0, r1)), Some((c0, c1))) = (rows, cols) else {
            log::debug!("Granule {} does not intersect the canvas", granule.grid_code);
            return Ok(None);
        };

        let local_rows = (r0 as isize - row_off) as usize..(r1 as isize - row_off) as usize;
        let local_cols = (c0 as isize - col_off) as usize..(c1 as isize - col_off) as usize;
        let cropped = raster.crop(local_rows, local_cols);

        let covered = cropped.covered_pixels();
        if covered == 0 {
            log::debug!("Granule {} has no valid observation on the canvas", granule.grid_code);
            return Ok(None);
        }

        log::info!(
            "Granule {} composited: {} pixels from {} scenes",
            granule.grid_code,
            covered,
            scenes_loaded
        );

        Ok(Some(GranuleComposite {
            grid_code: granule.grid_code.clone(),
            row_offset: r0,
            col_offset: c0,
            raster: cropped,
            scenes_loaded,
        }))
    }
}

/// Canvas index range covered by `len` pixels starting at `offset`
fn clip(offset: isize, len: usize, canvas_len: usize) -> Option<(usize, usize)> {
    let start = offset.max(0);
    let end = (offset + len as isize).min(canvas_len as isize);
    if start < end {
        Some((start as usize, end as usize))
    } else {
        None
    }
}

#[cfg(feature = "parallel")]
fn composite_blocks(stack: &ObservationStack<'_>, blocks: &[Block]) -> Vec<Vec<Band2>> {
    use rayon::prelude::*;
    blocks.par_iter().map(|block| stack.composite_block(block)).collect()
}

#[cfg(not(feature = "parallel"))]
fn composite_blocks(stack: &ObservationStack<'_>, blocks: &[Block]) -> Vec<Vec<Band2>> {
    blocks.iter().map(|block| stack.composite_block(block)).collect()
}

/// Source of each output band
#[derive(Debug, Clone, Copy)]
enum Output {
    Spectral(usize),
    Date,
    Score,
    Quality,
    CosSza,
    CosVza,
    CosRaa,
    Ndvi,
    SensorCode,
}

/// Per-slice values that do not vary across pixels
struct SliceInfo {
    temporal: f32,
    doy: f32,
    cosines: (f32, f32, f32),
    sensor_code: f32,
}

/// Borrowed view of a cube prepared for per-pixel selection
struct ObservationStack<'c> {
    roles: [&'c Band3; 6],
    quality: &'c Band3,
    spectral: Vec<Option<&'c Band3>>,
    mask: &'c QualityMask,
    gain: f32,
    offset: f32,
    slices: Vec<SliceInfo>,
    outputs: Vec<Output>,
    nodata: Pixel,
}

const BLUE: usize = 0;
const GREEN: usize = 1;
const RED: usize = 2;
const NIR: usize = 3;
const SWIR1: usize = 4;
const SWIR2: usize = 5;

impl<'c> ObservationStack<'c> {
    fn new(
        cube: &'c PixelCube,
        granule: &GranuleGroup,
        sensor: &'c SensorMeta,
        settings: &CompositeSettings,
    ) -> Option<Self> {
        let require = |name: &str| {
            let band = cube.band(name);
            if band.is_none() {
                log::warn!("Granule {}: band {} missing from load", granule.grid_code, name);
            }
            band
        };
        let r = &sensor.roles;
        let roles = [
            require(&r.blue)?,
            require(&r.green)?,
            require(&r.red)?,
            require(&r.nir)?,
            require(&r.swir1)?,
            require(&r.swir2)?,
        ];
        let quality = require(sensor.mask.band())?;

        let spectral = sensor.spectral_bands.iter().map(|b| cube.band(b)).collect();

        let (gain, offset) = sensor.gain_offset(100.0);
        let scenes: HashMap<&str, &SceneItem> = granule.items.iter().map(|i| (i.id.as_str(), i)).collect();
        let slices = cube
            .scene_ids
            .iter()
            .zip(&cube.times)
            .map(|(id, time)| {
                let scene = scenes.get(id.as_str());
                SliceInfo {
                    temporal: temporal_score(day_offset(*time, settings.mid_date), sensor.family) as f32,
                    doy: day_of_year(*time),
                    cosines: scene.map(|s| s.angle_cosines()).unwrap_or((1.0, 1.0, 1.0)),
                    sensor_code: scene.map(|s| s.sensor_code).unwrap_or(sensor.code) as f32,
                }
            })
            .collect();

        let outputs = settings
            .canvas_bands
            .iter()
            .map(|name| match name.as_str() {
                DATE_BAND => Output::Date,
                SCORE_BAND => Output::Score,
                COS_SZA_BAND => Output::CosSza,
                COS_VZA_BAND => Output::CosVza,
                COS_RAA_BAND => Output::CosRaa,
                NDVI_BAND => Output::Ndvi,
                SENSOR_CODE_BAND => Output::SensorCode,
                band if band == sensor.mask.band() => Output::Quality,
                other => Output::Spectral(sensor.spectral_bands.iter().position(|b| b == other).unwrap_or(usize::MAX)),
            })
            .collect();

        Some(Self {
            roles,
            quality,
            spectral,
            mask: &sensor.mask,
            gain: gain as f32,
            offset: offset as f32,
            slices,
            outputs,
            nodata: settings.nodata,
        })
    }

    /// Masked, rescaled value; NaN for unusable observations
    fn rescaled(&self, band: &Band3, t: usize, y: usize, x: usize) -> f32 {
        let q = self.quality[[t, y, x]];
        let v = band[[t, y, x]];
        if self.mask.is_valid(q) && v.is_finite() {
            v * self.gain + self.offset
        } else {
            f32::NAN
        }
    }

    /// Best time slice and its score at one pixel
    fn select(&self, y: usize, x: usize, scratch: &mut Scratch) -> Option<(usize, f32)> {
        let n = self.slices.len();
        scratch.reset(n);

        for t in 0..n {
            let mut values = [0.0f32; 6];
            for (k, band) in self.roles.iter().enumerate() {
                values[k] = self.rescaled(band, t, y, x);
            }
            if values.iter().any(|v| v.is_nan()) {
                continue;
            }
            scratch.pixels[t] = Some(SpectralPixel {
                blue: values[BLUE],
                green: values[GREEN],
                nir: values[NIR],
                swir1: values[SWIR1],
                swir2: values[SWIR2],
            });
            scratch.blue[t] = values[BLUE];
            scratch.red[t] = values[RED];
            scratch.nir[t] = values[NIR];
            scratch.swir2[t] = values[SWIR2];
        }

        let reference = ScoreReference::from_medians(
            nan_median(&mut scratch.blue)?,
            nan_median(&mut scratch.red)?,
            nan_median(&mut scratch.nir)?,
            nan_median(&mut scratch.swir2)?,
        );

        for ((score, pixel), slice) in scratch.scores.iter_mut().zip(&scratch.pixels).zip(&self.slices) {
            if let Some(p) = pixel {
                *score = spectral_score(p, &reference) * slice.temporal;
            }
        }
        let best = best_time_index(scratch.scores.iter().copied())?;
        Some((best, scratch.scores[best]))
    }

    fn output_value(&self, output: Output, t: usize, y: usize, x: usize, score: f32) -> f32 {
        let slice = &self.slices[t];
        let value = match output {
            Output::Spectral(i) => match self.spectral.get(i).copied().flatten() {
                Some(band) => self.rescaled(band, t, y, x),
                None => f32::NAN,
            },
            Output::Date => slice.doy,
            Output::Score => score,
            // raw flag value of the selected observation
            Output::Quality => self.quality[[t, y, x]],
            Output::CosSza => slice.cosines.0,
            Output::CosVza => slice.cosines.1,
            Output::CosRaa => slice.cosines.2,
            Output::Ndvi => {
                let nir = self.rescaled(self.roles[NIR], t, y, x);
                let red = self.rescaled(self.roles[RED], t, y, x);
                let sum = nir + red;
                if sum == 0.0 {
                    0.0
                } else {
                    (nir - red) / sum
                }
            }
            Output::SensorCode => slice.sensor_code,
        };
        if value.is_finite() {
            value
        } else {
            self.nodata
        }
    }

    fn composite_block(&self, block: &Block) -> Vec<Band2> {
        let shape = (block.height(), block.width());
        let mut arrays: Vec<Band2> = self.outputs.iter().map(|_| Array2::from_elem(shape, self.nodata)).collect();
        let mut scratch = Scratch::default();

        for (by, y) in block.rows.clone().enumerate() {
            for (bx, x) in block.cols.clone().enumerate() {
                let Some((t, score)) = self.select(y, x, &mut scratch) else {
                    continue;
                };
                for (array, output) in arrays.iter_mut().zip(&self.outputs) {
                    array[[by, bx]] = self.output_value(*output, t, y, x, score);
                }
            }
        }
        arrays
    }
}

/// Per-block working buffers reused across pixels
#[derive(Default)]
struct Scratch {
    pixels: Vec<Option<SpectralPixel>>,
    blue: Vec<f32>,
    red: Vec<f32>,
    nir: Vec<f32>,
    swir2: Vec<f32>,
    scores: Vec<f32>,
}

impl Scratch {
    fn reset(&mut self, n: usize) {
        self.pixels.clear();
        self.pixels.resize(n, None);
        for buf in [&mut self.blue, &mut self.red, &mut self.nir, &mut self.swir2, &mut self.scores] {
            buf.clear();
            buf.resize(n, f32::NAN);
        }
    }
}
