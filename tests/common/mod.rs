//! Shared in-memory collaborators for integration tests
#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use eomosaic::io::catalog::{CatalogItem, CatalogQuery, SceneCatalog};
use eomosaic::io::granule_meta::{ViewAngleSource, ViewAngles};
use eomosaic::io::loader::{LoadRequest, PixelCube, PixelLoader};
use eomosaic::io::retry::RetryPolicy;
use eomosaic::types::{GeoTransform, MosaicError, MosaicResult, RasterGrid, Region, SceneItem};
use eomosaic::{MosaicParams, PoolConfig};
use ndarray::Array3;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub const CRS: &str = "EPSG:3979";
pub const RES: f64 = 20.0;

/// Sentinel-2 SCL classes
pub const SCL_VEGETATION: f32 = 4.0;
pub const SCL_CLOUD_HIGH: f32 = 9.0;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn grid(top_left_x: f64, top_left_y: f64, width: usize, height: usize) -> RasterGrid {
    RasterGrid::new(CRS, GeoTransform::north_up(top_left_x, top_left_y, RES), width, height)
}

pub fn at(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2023, 7, day, hour, 0, 0).unwrap()
}

pub fn catalog_item(id: &str, grid_code: &str, datetime: DateTime<Utc>) -> CatalogItem {
    CatalogItem {
        id: id.into(),
        datetime,
        grid_code: grid_code.into(),
        platform: "sentinel-2a".into(),
        cloud_cover: Some(10.0),
        sun_elevation: Some(60.0),
        sun_azimuth: Some(150.0),
        assets: BTreeMap::new(),
    }
}

pub fn scene_item(id: &str, grid_code: &str, datetime: DateTime<Utc>) -> SceneItem {
    SceneItem {
        id: id.into(),
        datetime,
        grid_code: grid_code.into(),
        platform: "sentinel-2a".into(),
        sensor_code: 21,
        sun_zenith: 30.0,
        sun_azimuth: 150.0,
        view_zenith: 0.0,
        view_azimuth: 150.0,
        assets: BTreeMap::new(),
    }
}

/// S2 surface-reflectance parameters for a July 2023 run over a small tile
pub fn s2_params(workers: usize) -> MosaicParams {
    let mut params = MosaicParams::new("S2_SR", Region::from_bounds(-76.0, 45.0, -75.9, 45.1), "2023-07-01", "2023-07-31");
    params.block_size = 2;
    params.load_retry = RetryPolicy::new(2, Duration::ZERO);
    params.catalog_retry = RetryPolicy::none();
    params.metadata_retry = RetryPolicy::none();
    params.pool = PoolConfig::Local { workers };
    params
}

/// Catalog returning a fixed item list
pub struct FixedCatalog {
    pub items: Vec<CatalogItem>,
    pub searches: AtomicUsize,
}

impl FixedCatalog {
    pub fn new(items: Vec<CatalogItem>) -> Self {
        Self {
            items,
            searches: AtomicUsize::new(0),
        }
    }
}

impl SceneCatalog for FixedCatalog {
    fn search(&self, _query: &CatalogQuery) -> MosaicResult<Vec<CatalogItem>> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        Ok(self.items.clone())
    }
}

/// View-angle source that is always unreachable
pub struct NoViewAngles;

impl ViewAngleSource for NoViewAngles {
    fn view_angles(&self, item: &CatalogItem) -> MosaicResult<ViewAngles> {
        Err(MosaicError::Metadata(format!("no metadata for {}", item.id)))
    }
}

/// Reflectance (0-100) of every band of one scene, plus where it is clear
#[derive(Debug, Clone)]
pub struct SceneValues {
    pub bands: HashMap<String, f32>,
    /// Clear pixels in granule coordinates; `None` means all
    pub clear: Option<Vec<(usize, usize)>>,
}

impl SceneValues {
    /// Vegetated land with the given blue reflectance
    pub fn land(blue: f32) -> Self {
        let bands = [
            ("blue", blue),
            ("green", 5.0),
            ("red", 4.0),
            ("rededge1", 12.0),
            ("rededge2", 20.0),
            ("rededge3", 25.0),
            ("nir08", 30.0),
            ("swir16", 20.0),
            ("swir22", 10.0),
        ]
        .iter()
        .map(|(n, v)| (n.to_string(), *v))
        .collect();
        Self { bands, clear: None }
    }

    pub fn clear_only(mut self, pixels: &[(usize, usize)]) -> Self {
        self.clear = Some(pixels.to_vec());
        self
    }
}

/// Loader synthesising S2 cubes: canvas loads return `canvas`, granule loads
/// return the granule footprint filled with each scene's values
pub struct SyntheticLoader {
    pub canvas: RasterGrid,
    pub footprints: HashMap<String, RasterGrid>,
    pub scenes: HashMap<String, SceneValues>,
    /// Granules whose loads always time out
    pub unreachable: Vec<String>,
    /// Granules whose loads panic
    pub poisoned: Vec<String>,
    pub granule_loads: Mutex<Vec<String>>,
}

impl SyntheticLoader {
    pub fn new(canvas: RasterGrid) -> Self {
        Self {
            canvas,
            footprints: HashMap::new(),
            scenes: HashMap::new(),
            unreachable: Vec::new(),
            poisoned: Vec::new(),
            granule_loads: Mutex::new(Vec::new()),
        }
    }

    pub fn footprint(mut self, grid_code: &str, grid: RasterGrid) -> Self {
        self.footprints.insert(grid_code.into(), grid);
        self
    }

    pub fn scene(mut self, id: &str, values: SceneValues) -> Self {
        self.scenes.insert(id.into(), values);
        self
    }
}

impl PixelLoader for SyntheticLoader {
    fn load(&self, items: &[SceneItem], bands: &[String], request: &LoadRequest) -> MosaicResult<PixelCube> {
        if request.region.is_some() {
            return PixelCube::new(self.canvas.clone(), vec![], vec![], HashMap::new());
        }

        let code = items
            .first()
            .map(|i| i.grid_code.clone())
            .ok_or_else(|| MosaicError::Processing("empty load".into()))?;
        self.granule_loads.lock().unwrap().push(code.clone());
        if self.unreachable.contains(&code) {
            return Err(MosaicError::Transient(format!("timeout loading {}", code)));
        }
        if self.poisoned.contains(&code) {
            panic!("decoder crashed on {}", code);
        }

        let grid = self
            .footprints
            .get(&code)
            .cloned()
            .ok_or_else(|| MosaicError::Processing(format!("unknown granule {}", code)))?;
        let (h, w) = grid.shape();
        let n = items.len();

        let mut cube = HashMap::new();
        for band in bands {
            let mut data = Array3::<f32>::zeros((n, h, w));
            for (t, item) in items.iter().enumerate() {
                let values = &self.scenes[&item.id];
                for y in 0..h {
                    for x in 0..w {
                        let clear = values.clear.as_ref().map_or(true, |c| c.contains(&(y, x)));
                        data[[t, y, x]] = if band == "scl" {
                            if clear {
                                SCL_VEGETATION
                            } else {
                                SCL_CLOUD_HIGH
                            }
                        } else {
                            // raw S2 digital numbers: reflectance / (100 * 0.0001)
                            values.bands.get(band).copied().unwrap_or(0.0) * 100.0
                        };
                    }
                }
            }
            cube.insert(band.clone(), data);
        }

        PixelCube::new(
            grid,
            items.iter().map(|i| i.id.clone()).collect(),
            items.iter().map(|i| i.datetime).collect(),
            cube,
        )
    }
}
