//! Run configuration: a serde-loadable parameter record validated once into
//! an immutable [`ValidatedParams`].

use crate::io::retry::RetryPolicy;
use crate::sensors::{sensor_meta, SensorMeta};
use crate::types::{ExtraBands, MosaicError, MosaicResult, Pixel, Region, DEFAULT_NODATA};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// HTTP settings handed to network clients and forwarded to cluster nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Proxy for both http and https, e.g. `http://proxy.example:8888/`
    pub proxy: Option<String>,
    pub timeout: Duration,
    pub user_agent: String,
    /// Accept self-signed certificates (needed behind some inspecting proxies)
    pub accept_invalid_certs: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            proxy: None,
            timeout: Duration::from_secs(120),
            user_agent: format!("eomosaic/{}", env!("CARGO_PKG_VERSION")),
            accept_invalid_certs: false,
        }
    }
}

impl NetworkConfig {
    /// Environment exports a batch worker needs to reach the network
    pub fn worker_environment(&self) -> Vec<(String, String)> {
        match &self.proxy {
            Some(proxy) => vec![
                ("http_proxy".to_string(), proxy.clone()),
                ("https_proxy".to_string(), proxy.clone()),
            ],
            None => Vec::new(),
        }
    }
}

/// Multi-node batch-queue cluster settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Explicit node count; derived from the workload when unset
    pub nodes: Option<usize>,
    /// Explicit worker processes per node
    pub processes_per_node: Option<usize>,
    /// Memory per node, scheduler syntax (e.g. `480G`)
    pub memory: String,
    pub walltime: String,
    pub account: Option<String>,
    pub queue: String,
    /// Worker spill directory root; platform cache dir when unset
    pub scratch_dir: Option<PathBuf>,
    pub poll_interval: Duration,
    /// Maximum time to wait for the requested workers
    pub max_wait: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            nodes: None,
            processes_per_node: None,
            memory: "480G".to_string(),
            walltime: "06:00:00".to_string(),
            account: None,
            queue: "standard".to_string(),
            scratch_dir: None,
            poll_interval: Duration::from_secs(5),
            max_wait: Duration::from_secs(30 * 60),
        }
    }
}

/// Worker pool backend selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PoolConfig {
    /// In-process thread pool; `workers == 0` sizes from the host or allocation
    Local { workers: usize },
    Cluster(ClusterConfig),
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig::Local { workers: 0 }
    }
}

/// Raw run parameters, as supplied by the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MosaicParams {
    /// Sensor key, e.g. `S2_SR`
    pub sensor: String,
    pub region: Region,
    /// `YYYY-MM-DD`
    pub start_date: String,
    pub end_date: String,
    #[serde(default = "default_projection")]
    pub projection: String,
    /// Output pixel size in projection units
    #[serde(default = "default_resolution")]
    pub resolution: f64,
    /// Scene cloud-cover upper bound in percent
    #[serde(default)]
    pub cloud_cover: Option<f64>,
    #[serde(default)]
    pub extra_bands: ExtraBands,
    /// Catalog result cap
    #[serde(default = "default_max_items")]
    pub max_items: usize,
    /// Items tried before base-canvas construction gives up
    #[serde(default = "default_canvas_attempts")]
    pub canvas_attempts: usize,
    #[serde(default = "default_nodata")]
    pub nodata: Pixel,
    /// Edge length of processing blocks, in pixels
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    #[serde(default = "RetryPolicy::pixel_load")]
    pub load_retry: RetryPolicy,
    #[serde(default = "RetryPolicy::catalog_search")]
    pub catalog_retry: RetryPolicy,
    #[serde(default = "RetryPolicy::metadata_fetch")]
    pub metadata_retry: RetryPolicy,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub pool: PoolConfig,
}

fn default_projection() -> String {
    "EPSG:3979".to_string()
}

fn default_resolution() -> f64 {
    20.0
}

fn default_max_items() -> usize {
    100
}

fn default_canvas_attempts() -> usize {
    20
}

fn default_nodata() -> Pixel {
    DEFAULT_NODATA
}

fn default_block_size() -> usize {
    2000
}

impl MosaicParams {
    /// Parameters with defaults for everything but sensor, region and dates
    pub fn new(
        sensor: impl Into<String>,
        region: Region,
        start_date: impl Into<String>,
        end_date: impl Into<String>,
    ) -> Self {
        Self {
            sensor: sensor.into(),
            region,
            start_date: start_date.into(),
            end_date: end_date.into(),
            projection: default_projection(),
            resolution: default_resolution(),
            cloud_cover: None,
            extra_bands: ExtraBands::None,
            max_items: default_max_items(),
            canvas_attempts: default_canvas_attempts(),
            nodata: default_nodata(),
            block_size: default_block_size(),
            load_retry: RetryPolicy::pixel_load(),
            catalog_retry: RetryPolicy::catalog_search(),
            metadata_retry: RetryPolicy::metadata_fetch(),
            network: NetworkConfig::default(),
            pool: PoolConfig::default(),
        }
    }

    pub fn from_json_str(json: &str) -> MosaicResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Check every field once and resolve derived values
    pub fn validate(&self) -> MosaicResult<ValidatedParams> {
        let sensor = sensor_meta(&self.sensor)?;
        validate_region(&self.region)?;

        let start = parse_date(&self.start_date, "start")?;
        let end = parse_date(&self.end_date, "end")?;
        if end < start {
            return Err(MosaicError::Config(format!(
                "Time window ends ({}) before it starts ({})",
                end, start
            )));
        }

        if self.projection.trim().is_empty() {
            return Err(MosaicError::Config("Projection must not be empty".to_string()));
        }
        if !self.resolution.is_finite() || self.resolution <= 0.0 {
            return Err(MosaicError::Config(format!(
                "Resolution must be positive, got {}",
                self.resolution
            )));
        }

        let cloud_cover = match self.cloud_cover {
            Some(cc) if !(0.0..=100.0).contains(&cc) => {
                return Err(MosaicError::Config(format!(
                    "Cloud cover must be within [0, 100], got {}",
                    cc
                )));
            }
            Some(cc) => cc,
            None => {
                let (_, lat) = self.region.centre().unwrap_or((0.0, 0.0));
                sensor.default_cloud_cover(lat)
            }
        };

        if !self.nodata.is_finite() || self.nodata == 0.0 {
            return Err(MosaicError::Config(
                "Nodata sentinel must be finite and distinct from zero".to_string(),
            ));
        }
        if self.max_items == 0 || self.canvas_attempts == 0 || self.block_size == 0 {
            return Err(MosaicError::Config(
                "max_items, canvas_attempts and block_size must be at least 1".to_string(),
            ));
        }
        for (name, policy) in [
            ("load_retry", &self.load_retry),
            ("catalog_retry", &self.catalog_retry),
            ("metadata_retry", &self.metadata_retry),
        ] {
            if policy.max_attempts == 0 {
                return Err(MosaicError::Config(format!("{} needs at least one attempt", name)));
            }
        }
        if let PoolConfig::Cluster(cluster) = &self.pool {
            if cluster.nodes == Some(0) || cluster.processes_per_node == Some(0) {
                return Err(MosaicError::Config(
                    "Cluster node and process counts must be at least 1".to_string(),
                ));
            }
            if cluster.poll_interval.is_zero() {
                return Err(MosaicError::Config("Cluster poll interval must be non-zero".to_string()));
            }
        }

        Ok(ValidatedParams {
            sensor,
            region: self.region.clone(),
            start,
            end,
            projection: self.projection.trim().to_string(),
            resolution: self.resolution,
            cloud_cover,
            extra_bands: self.extra_bands,
            max_items: self.max_items,
            canvas_attempts: self.canvas_attempts,
            nodata: self.nodata,
            block_size: self.block_size,
            load_retry: self.load_retry,
            catalog_retry: self.catalog_retry,
            metadata_retry: self.metadata_retry,
            network: self.network.clone(),
            pool: self.pool.clone(),
        })
    }
}

/// Immutable, checked run configuration
#[derive(Debug, Clone)]
pub struct ValidatedParams {
    pub sensor: SensorMeta,
    pub region: Region,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub projection: String,
    pub resolution: f64,
    pub cloud_cover: f64,
    pub extra_bands: ExtraBands,
    pub max_items: usize,
    pub canvas_attempts: usize,
    pub nodata: Pixel,
    pub block_size: usize,
    pub load_retry: RetryPolicy,
    pub catalog_retry: RetryPolicy,
    pub metadata_retry: RetryPolicy,
    pub network: NetworkConfig,
    pub pool: PoolConfig,
}

impl ValidatedParams {
    /// `start_end` label used in log lines and output names
    pub fn time_label(&self) -> String {
        format!("{}_{}", self.start.format("%Y-%m-%d"), self.end.format("%Y-%m-%d"))
    }
}

fn parse_date(value: &str, which: &str) -> MosaicResult<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").map_err(|e| {
        MosaicError::Config(format!("Invalid {} date '{}': {}", which, value, e))
    })
}

fn validate_region(region: &Region) -> MosaicResult<()> {
    let mut distinct: Vec<[f64; 2]> = Vec::new();
    for point in &region.coordinates {
        let [lon, lat] = *point;
        if !lon.is_finite() || !lat.is_finite() || !(-180.0..=180.0).contains(&lon) || !(-90.0..=90.0).contains(&lat) {
            return Err(MosaicError::Config(format!(
                "Region vertex out of range: [{}, {}]",
                lon, lat
            )));
        }
        if !distinct.contains(point) {
            distinct.push(*point);
        }
    }
    if distinct.len() < 3 {
        return Err(MosaicError::Config(format!(
            "Region needs at least 3 distinct vertices, got {}",
            distinct.len()
        )));
    }
    Ok(())
}
