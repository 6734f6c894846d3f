//! End-to-end mosaic run: curate, plan, build the canvas, dispatch granule
//! composites and merge them as they complete.

use crate::core::canvas::{canvas_band_names, CanvasBuilder, RasterCanvas};
use crate::core::compositor::{CompositeSettings, GranuleCompositor};
use crate::core::curator::{CatalogCurator, CuratedCatalog};
use crate::core::dispatch::{BatchQueue, ClusterPool, ClusterSizing, GranuleTask, LocalPool, WorkerPool};
use crate::core::merge::{MergeOutcome, MergeReducer};
use crate::core::scoring::period_centre;
use crate::io::catalog::{CatalogQuery, SceneCatalog, StacCatalog};
use crate::io::granule_meta::ViewAngleSource;
use crate::io::http::ReqwestClient;
use crate::io::loader::PixelLoader;
use crate::io::slurm;
use crate::params::{NetworkConfig, PoolConfig, ValidatedParams};
use crate::types::{GranuleGroup, MosaicError, MosaicResult};
use chrono::NaiveDate;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What a run will execute, fixed before any unit starts
#[derive(Debug, Clone)]
pub struct MosaicPlan {
    /// Dispatch order: largest granules first
    pub granules: Vec<GranuleGroup>,
    pub load_bands: Vec<String>,
    pub canvas_bands: Vec<String>,
    pub mid_date: NaiveDate,
    pub item_count: usize,
}

impl MosaicPlan {
    pub fn new(params: &ValidatedParams, curated: &CuratedCatalog) -> Self {
        Self {
            granules: curated.granules.clone(),
            load_bands: params.sensor.load_bands(),
            canvas_bands: canvas_band_names(&params.sensor, params.extra_bands),
            mid_date: period_centre(params.start, params.end),
            item_count: curated.items.len(),
        }
    }
}

/// Run summary
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MosaicStats {
    pub items: usize,
    pub granules_submitted: usize,
    pub merged: usize,
    /// Units that produced no composite
    pub empty: usize,
    pub failed: usize,
    pub covered_pixels: usize,
    pub coverage: f64,
    pub elapsed: Duration,
}

/// Final merged raster and its run summary
#[derive(Debug, Clone)]
pub struct Mosaic {
    pub canvas: RasterCanvas,
    pub stats: MosaicStats,
    /// `start_end` label of the compositing window
    pub time_label: String,
}

/// Owns the external collaborators for a run
pub struct MosaicEngine {
    catalog: Arc<dyn SceneCatalog>,
    angles: Arc<dyn ViewAngleSource>,
    loader: Arc<dyn PixelLoader>,
    queue: Option<Box<dyn BatchQueue>>,
}

impl MosaicEngine {
    pub fn new(
        catalog: Arc<dyn SceneCatalog>,
        angles: Arc<dyn ViewAngleSource>,
        loader: Arc<dyn PixelLoader>,
    ) -> Self {
        Self {
            catalog,
            angles,
            loader,
            queue: None,
        }
    }

    /// Engine searching STAC over HTTP with the given network settings
    pub fn with_stac(network: &NetworkConfig, loader: Arc<dyn PixelLoader>) -> MosaicResult<Self> {
        let stac = Arc::new(StacCatalog::new(ReqwestClient::new(network)?));
        Ok(Self::new(stac.clone(), stac, loader))
    }

    /// Batch queue used when the pool config selects a cluster
    pub fn with_batch_queue(mut self, queue: Box<dyn BatchQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn run(&mut self, params: &ValidatedParams) -> MosaicResult<Mosaic> {
        let started = Instant::now();
        log::info!(
            "Mosaic {} over {} at {} m in {}",
            params.sensor.key,
            params.time_label(),
            params.resolution,
            params.projection
        );

        let query = CatalogQuery {
            endpoint: params.sensor.catalog.endpoint.clone(),
            collection: params.sensor.catalog.collection.clone(),
            region: params.region.clone(),
            start: params.start,
            end: params.end,
            cloud_cover: params.cloud_cover,
            max_items: params.max_items,
        };
        let curated = CatalogCurator::new(self.catalog.as_ref(), self.angles.as_ref(), &params.sensor)
            .with_retry(params.catalog_retry, params.metadata_retry)
            .curate(&query)?;
        if curated.is_empty() {
            return Err(MosaicError::NoItems);
        }

        let (plan, canvas) = plan_and_canvas(self.loader.as_ref(), params, &curated);
        let mut canvas = canvas?;

        let compositor = GranuleCompositor::new(
            self.loader.clone(),
            params.sensor.clone(),
            canvas.grid.clone(),
            CompositeSettings::from_params(params),
        );

        let mut stats = MosaicStats {
            items: plan.item_count,
            ..MosaicStats::default()
        };

        let queue = self.queue.as_deref_mut();
        let mut pool = open_pool(params, &plan, queue)?;

        for granule in &plan.granules {
            let unit = compositor.clone();
            let group = granule.clone();
            pool.submit(GranuleTask::new(granule.grid_code.clone(), move || unit.composite(&group)))?;
            stats.granules_submitted += 1;
        }
        log::info!(
            "Submitted {} granules to {} workers",
            stats.granules_submitted,
            pool.worker_count()
        );

        for completion in pool.completions() {
            match completion.result {
                Ok(composite) => match MergeReducer::merge(&mut canvas, composite.as_ref()) {
                    Ok(MergeOutcome::Merged { pixels_updated }) => {
                        stats.merged += 1;
                        log::info!(
                            "Merged granule {} ({} pixels updated, {}/{} done)",
                            completion.granule,
                            pixels_updated,
                            stats.merged + stats.empty + stats.failed,
                            stats.granules_submitted
                        );
                    }
                    Ok(MergeOutcome::Skipped) => stats.empty += 1,
                    Err(e) => {
                        log::error!("Merging granule {} failed: {}", completion.granule, e);
                        stats.failed += 1;
                    }
                },
                Err(e) => {
                    log::error!("Granule {} failed: {}", completion.granule, e);
                    stats.failed += 1;
                }
            }
            pool.release(completion.job);
        }
        pool.shutdown();
        drop(pool);

        let masked = MergeReducer::finalize(&mut canvas);
        stats.covered_pixels = canvas.covered_pixels();
        stats.coverage = canvas.coverage_fraction();
        stats.elapsed = started.elapsed();

        log::debug!("{} canvas pixels left without an observation", masked);
        log::info!(
            "✅ Mosaic complete: {} merged, {} empty, {} failed; coverage {:.1}% in {:.1}s",
            stats.merged,
            stats.empty,
            stats.failed,
            stats.coverage * 100.0,
            stats.elapsed.as_secs_f64()
        );

        Ok(Mosaic {
            canvas,
            stats,
            time_label: params.time_label(),
        })
    }
}

#[cfg(feature = "parallel")]
fn plan_and_canvas(
    loader: &dyn PixelLoader,
    params: &ValidatedParams,
    curated: &CuratedCatalog,
) -> (MosaicPlan, MosaicResult<RasterCanvas>) {
    rayon::join(
        || MosaicPlan::new(params, curated),
        || build_canvas(loader, params, curated),
    )
}

#[cfg(not(feature = "parallel"))]
fn plan_and_canvas(
    loader: &dyn PixelLoader,
    params: &ValidatedParams,
    curated: &CuratedCatalog,
) -> (MosaicPlan, MosaicResult<RasterCanvas>) {
    (MosaicPlan::new(params, curated), build_canvas(loader, params, curated))
}

fn build_canvas(loader: &dyn PixelLoader, params: &ValidatedParams, curated: &CuratedCatalog) -> MosaicResult<RasterCanvas> {
    CanvasBuilder::new(loader, &params.sensor, &params.projection, params.resolution)
        .with_nodata(params.nodata)
        .with_extras(params.extra_bands)
        .with_max_attempts(params.canvas_attempts)
        .build(&curated.items, &params.region)
}

fn open_pool<'q>(
    params: &ValidatedParams,
    plan: &MosaicPlan,
    queue: Option<&'q mut (dyn BatchQueue + 'static)>,
) -> MosaicResult<Box<dyn WorkerPool + 'q>> {
    match &params.pool {
        PoolConfig::Local { workers } => {
            let workers = if *workers == 0 {
                slurm::local_worker_count()
            } else {
                *workers
            };
            Ok(Box::new(LocalPool::new(workers)?))
        }
        PoolConfig::Cluster(config) => {
            let queue = queue.ok_or_else(|| {
                MosaicError::Config("Cluster pool selected but no batch queue was provided".to_string())
            })?;
            let sizing = ClusterSizing::resolve(config, plan.item_count, plan.granules.len(), params.resolution);
            let spec = sizing.node_spec(config, &params.network);
            let pool = ClusterPool::start(queue, sizing, &spec, config.poll_interval, config.max_wait)?;
            Ok(Box::new(pool))
        }
    }
}
