//! Sensor metadata: band roles, rescaling coefficients, quality masks and
//! the catalog collection each sensor is searched in.

use crate::types::{MosaicError, MosaicResult};
use serde::{Deserialize, Serialize};

/// Sensor family, which selects the temporal score width
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SensorFamily {
    Sentinel2,
    Landsat,
    /// Harmonized Landsat and Sentinel-2
    Hls,
}

impl SensorFamily {
    /// Gaussian width (days) of the temporal score
    pub fn temporal_sigma(&self) -> f64 {
        match self {
            SensorFamily::Landsat => 16.0,
            SensorFamily::Sentinel2 | SensorFamily::Hls => 12.0,
        }
    }
}

/// Data unit of the delivered pixel values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataUnit {
    TopOfAtmosphere,
    SurfaceReflectance,
}

/// Per-sensor rule deciding which pixels are valid observations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum QualityMask {
    /// Sentinel-2 scene classification layer; listed classes are kept
    SceneClassification { band: String, keep: Vec<u8> },
    /// Bit-packed QA layer; any set bit in `reject_bits` invalidates the pixel
    QaBits { band: String, reject_bits: u16 },
}

impl QualityMask {
    pub fn band(&self) -> &str {
        match self {
            QualityMask::SceneClassification { band, .. } | QualityMask::QaBits { band, .. } => band,
        }
    }

    /// Whether a quality value marks a usable observation
    pub fn is_valid(&self, value: f32) -> bool {
        if !value.is_finite() || value < 0.0 {
            return false;
        }
        match self {
            QualityMask::SceneClassification { keep, .. } => {
                let class = value as u32;
                class <= u8::MAX as u32 && keep.contains(&(class as u8))
            }
            QualityMask::QaBits { reject_bits, .. } => (value as u32 as u16) & reject_bits == 0,
        }
    }
}

/// Names of the bands used by the spectral score
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandRoles {
    pub blue: String,
    pub green: String,
    pub red: String,
    pub nir: String,
    pub swir1: String,
    pub swir2: String,
}

/// Catalog location of a sensor's scenes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogSource {
    pub endpoint: String,
    pub collection: String,
}

/// Complete description of one sensor/data-unit combination
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorMeta {
    /// Lookup key, e.g. `S2_SR`
    pub key: String,
    pub name: String,
    pub code: u16,
    pub family: SensorFamily,
    pub unit: DataUnit,
    pub gain: f64,
    pub offset: f64,
    /// Optical band asset names, in output order
    pub spectral_bands: Vec<String>,
    pub roles: BandRoles,
    pub mask: QualityMask,
    pub catalog: CatalogSource,
}

/// Sensor codes
pub const LS5_CODE: u16 = 5;
pub const LS7_CODE: u16 = 7;
pub const LS8_CODE: u16 = 8;
pub const LS9_CODE: u16 = 9;
pub const S2A_CODE: u16 = 21;
pub const S2B_CODE: u16 = 22;
pub const S2C_CODE: u16 = 23;
pub const HLS_CODE: u16 = 100;

const EARTH_SEARCH: &str = "https://earth-search.aws.element84.com/v1";
const LP_CLOUD: &str = "https://cmr.earthdata.nasa.gov/stac/LPCLOUD";

/// Sentinel-2 SCL classes kept: vegetation, bare soil, water, unclassified,
/// dark area pixels and thin cirrus
const S2_SCL_KEEP: [u8; 6] = [2, 4, 5, 6, 7, 10];

/// Landsat Collection-2 QA_PIXEL: fill, dilated cloud, cloud, cloud shadow
const LANDSAT_QA_REJECT: u16 = 0b1_1011;

/// HLS Fmask: cloud, adjacent cloud/shadow, cloud shadow
const HLS_FMASK_REJECT: u16 = 0b1110;

fn strings(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

fn roles(blue: &str, green: &str, red: &str, nir: &str, swir1: &str, swir2: &str) -> BandRoles {
    BandRoles {
        blue: blue.into(),
        green: green.into(),
        red: red.into(),
        nir: nir.into(),
        swir1: swir1.into(),
        swir2: swir2.into(),
    }
}

fn landsat_sr(key: &str, code: u16) -> SensorMeta {
    SensorMeta {
        key: key.into(),
        name: key.into(),
        code,
        family: SensorFamily::Landsat,
        unit: DataUnit::SurfaceReflectance,
        gain: 0.0000275,
        offset: -0.2,
        spectral_bands: strings(&["blue", "green", "red", "nir08", "swir16", "swir22"]),
        roles: roles("blue", "green", "red", "nir08", "swir16", "swir22"),
        mask: QualityMask::QaBits {
            band: "qa_pixel".into(),
            reject_bits: LANDSAT_QA_REJECT,
        },
        catalog: CatalogSource {
            endpoint: EARTH_SEARCH.into(),
            collection: "landsat-c2-l2".into(),
        },
    }
}

/// Look up a sensor by key (case-insensitive)
pub fn sensor_meta(key: &str) -> MosaicResult<SensorMeta> {
    let meta = match key.to_uppercase().as_str() {
        "S2_SR" => SensorMeta {
            key: "S2_SR".into(),
            name: "S2_SR".into(),
            code: S2A_CODE,
            family: SensorFamily::Sentinel2,
            unit: DataUnit::SurfaceReflectance,
            gain: 0.0001,
            offset: 0.0,
            spectral_bands: strings(&[
                "blue", "green", "red", "rededge1", "rededge2", "rededge3", "nir08", "swir16", "swir22",
            ]),
            roles: roles("blue", "green", "red", "nir08", "swir16", "swir22"),
            mask: QualityMask::SceneClassification {
                band: "scl".into(),
                keep: S2_SCL_KEEP.to_vec(),
            },
            catalog: CatalogSource {
                endpoint: EARTH_SEARCH.into(),
                collection: "sentinel-2-l2a".into(),
            },
        },
        "L5_SR" => landsat_sr("L5_SR", LS5_CODE),
        "L7_SR" => landsat_sr("L7_SR", LS7_CODE),
        "L8_SR" => landsat_sr("L8_SR", LS8_CODE),
        "L9_SR" => landsat_sr("L9_SR", LS9_CODE),
        "HLS_SR" => SensorMeta {
            key: "HLS_SR".into(),
            name: "HLS_SR".into(),
            code: HLS_CODE,
            family: SensorFamily::Hls,
            unit: DataUnit::SurfaceReflectance,
            gain: 1.0,
            offset: 0.0,
            spectral_bands: strings(&["B02", "B03", "B04", "B05", "B06", "B07"]),
            roles: roles("B02", "B03", "B04", "B05", "B06", "B07"),
            mask: QualityMask::QaBits {
                band: "Fmask".into(),
                reject_bits: HLS_FMASK_REJECT,
            },
            catalog: CatalogSource {
                endpoint: LP_CLOUD.into(),
                collection: "HLSL30.v2.0".into(),
            },
        },
        _ => {
            return Err(MosaicError::Config(format!("Unknown sensor key: {}", key)));
        }
    };
    Ok(meta)
}

impl SensorMeta {
    /// Bands requested from the pixel loader: optical bands then the quality band
    pub fn load_bands(&self) -> Vec<String> {
        let mut bands = self.spectral_bands.clone();
        bands.push(self.mask.band().to_string());
        bands
    }

    /// Gain and offset mapping raw values onto a `[0, max_ref]` reflectance range
    pub fn gain_offset(&self, max_ref: f64) -> (f64, f64) {
        (max_ref * self.gain, max_ref * self.offset)
    }

    /// Cloud-cover bound used when the caller sets none
    pub fn default_cloud_cover(&self, centre_lat: f64) -> f64 {
        match self.family {
            SensorFamily::Sentinel2 => {
                if centre_lat < 55.0 {
                    85.0
                } else {
                    70.0
                }
            }
            SensorFamily::Landsat | SensorFamily::Hls => 90.0,
        }
    }

    /// Sensor code for a STAC `platform` string, falling back to this sensor's code
    pub fn code_for_platform(&self, platform: &str) -> u16 {
        match platform.to_lowercase().as_str() {
            "sentinel-2a" => S2A_CODE,
            "sentinel-2b" => S2B_CODE,
            "sentinel-2c" => S2C_CODE,
            "landsat-5" => LS5_CODE,
            "landsat-7" => LS7_CODE,
            "landsat-8" => LS8_CODE,
            "landsat-9" => LS9_CODE,
            _ => self.code,
        }
    }
}
