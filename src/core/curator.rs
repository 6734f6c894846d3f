//! Catalog curation: search, deduplicate, attach imaging geometry and group
//! scenes into granules.

use crate::io::catalog::{CatalogItem, CatalogQuery, SceneCatalog};
use crate::io::granule_meta::{ViewAngleSource, ViewAngles};
use crate::io::retry::RetryPolicy;
use crate::sensors::SensorMeta;
use crate::types::{core_id_of, GranuleGroup, MosaicResult, SceneItem};
use std::collections::{HashMap, HashSet};

/// Curated scenes and their granule grouping
#[derive(Debug, Clone, Default)]
pub struct CuratedCatalog {
    /// Deduplicated items in catalog order
    pub items: Vec<SceneItem>,
    /// Granules ordered by descending item count
    pub granules: Vec<GranuleGroup>,
}

impl CuratedCatalog {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

pub struct CatalogCurator<'a> {
    catalog: &'a dyn SceneCatalog,
    angles: &'a dyn ViewAngleSource,
    sensor: &'a SensorMeta,
    search_retry: RetryPolicy,
    metadata_retry: RetryPolicy,
}

impl<'a> CatalogCurator<'a> {
    pub fn new(catalog: &'a dyn SceneCatalog, angles: &'a dyn ViewAngleSource, sensor: &'a SensorMeta) -> Self {
        Self {
            catalog,
            angles,
            sensor,
            search_retry: RetryPolicy::catalog_search(),
            metadata_retry: RetryPolicy::metadata_fetch(),
        }
    }

    pub fn with_retry(mut self, search_retry: RetryPolicy, metadata_retry: RetryPolicy) -> Self {
        self.search_retry = search_retry;
        self.metadata_retry = metadata_retry;
        self
    }

    pub fn curate(&self, query: &CatalogQuery) -> MosaicResult<CuratedCatalog> {
        let raw = self
            .search_retry
            .run("catalog search", || self.catalog.search(query))?;
        let found = raw.len();

        let unique = dedupe_by_core_id(raw);
        if unique.len() < found {
            log::info!("Dropped {} duplicate items (same acquisition)", found - unique.len());
        }

        let items = self.enrich_all(&unique);
        let granules = group_by_grid_code(&items);

        log::info!(
            "Curated {} items into {} granules for {}",
            items.len(),
            granules.len(),
            self.sensor.key
        );
        for granule in &granules {
            log::debug!("Granule {}: {} items", granule.grid_code, granule.items.len());
        }

        Ok(CuratedCatalog { items, granules })
    }

    #[cfg(feature = "parallel")]
    fn enrich_all(&self, items: &[CatalogItem]) -> Vec<SceneItem> {
        use rayon::prelude::*;
        items.par_iter().map(|item| self.enrich(item)).collect()
    }

    #[cfg(not(feature = "parallel"))]
    fn enrich_all(&self, items: &[CatalogItem]) -> Vec<SceneItem> {
        items.iter().map(|item| self.enrich(item)).collect()
    }

    /// Attach sun and view geometry; any missing angle falls back to 0
    fn enrich(&self, item: &CatalogItem) -> SceneItem {
        let view = self
            .metadata_retry
            .run(&format!("view angles for {}", item.id), || self.angles.view_angles(item))
            .unwrap_or_else(|e| {
                log::warn!("View angles unavailable for {} ({}); using 0", item.id, e);
                ViewAngles::default()
            });

        let sun_zenith = match item.sun_elevation {
            Some(elevation) => 90.0 - elevation,
            None => {
                log::warn!("Item {} has no sun elevation; using zenith 0", item.id);
                0.0
            }
        };

        SceneItem {
            id: item.id.clone(),
            datetime: item.datetime,
            grid_code: item.grid_code.clone(),
            platform: item.platform.clone(),
            sensor_code: self.sensor.code_for_platform(&item.platform),
            sun_zenith,
            sun_azimuth: item.sun_azimuth.unwrap_or(0.0),
            view_zenith: view.zenith,
            view_azimuth: view.azimuth,
            assets: item.assets.clone(),
        }
    }
}

/// Keep the first item of every core acquisition id
pub fn dedupe_by_core_id(items: Vec<CatalogItem>) -> Vec<CatalogItem> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| {
            let keep = seen.insert(core_id_of(&item.id));
            if !keep {
                log::debug!("Duplicate acquisition {}", item.id);
            }
            keep
        })
        .collect()
}

/// Group by grid code, larger groups first; equal sizes keep first-seen order
pub fn group_by_grid_code(items: &[SceneItem]) -> Vec<GranuleGroup> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut groups: Vec<GranuleGroup> = Vec::new();

    for item in items {
        let slot = *index.entry(item.grid_code.as_str()).or_insert_with(|| {
            groups.push(GranuleGroup {
                grid_code: item.grid_code.clone(),
                items: Vec::new(),
            });
            groups.len() - 1
        });
        groups[slot].items.push(item.clone());
    }

    // stable sort keeps first-seen order among equal counts
    groups.sort_by(|a, b| b.items.len().cmp(&a.items.len()));
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensors::sensor_meta;
    use crate::types::{MosaicError, Region};
    use chrono::{NaiveDate, TimeZone, Utc};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn item(id: &str, grid: &str, day: u32) -> CatalogItem {
        CatalogItem {
            id: id.into(),
            datetime: Utc.with_ymd_and_hms(2023, 7, day, 16, 0, 0).unwrap(),
            grid_code: grid.into(),
            platform: "sentinel-2b".into(),
            cloud_cover: Some(5.0),
            sun_elevation: Some(40.0),
            sun_azimuth: Some(160.0),
            assets: BTreeMap::new(),
        }
    }

    struct FixedCatalog(Vec<CatalogItem>);

    impl SceneCatalog for FixedCatalog {
        fn search(&self, _query: &CatalogQuery) -> MosaicResult<Vec<CatalogItem>> {
            Ok(self.0.clone())
        }
    }

    struct FlakyAngles {
        calls: AtomicUsize,
    }

    impl ViewAngleSource for FlakyAngles {
        fn view_angles(&self, item: &CatalogItem) -> MosaicResult<ViewAngles> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if item.id.starts_with("S2A_B") {
                Err(MosaicError::Transient("connection reset".into()))
            } else {
                Ok(ViewAngles { zenith: 5.0, azimuth: 100.0 })
            }
        }
    }

    fn query() -> CatalogQuery {
        CatalogQuery {
            endpoint: "mock".into(),
            collection: "sentinel-2-l2a".into(),
            region: Region::from_bounds(0.0, 0.0, 1.0, 1.0),
            start: NaiveDate::from_ymd_opt(2023, 7, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2023, 7, 31).unwrap(),
            cloud_cover: 85.0,
            max_items: 100,
        }
    }

    #[test]
    fn test_curate_dedupes_groups_and_fails_open() {
        let catalog = FixedCatalog(vec![
            item("S2A_A_20230701_0_L2A", "MGRS-A", 1),
            item("S2A_B_20230702_0_L2A", "MGRS-B", 2),
            item("S2A_B_20230703_0_L2A", "MGRS-B", 3),
            item("S2A_B_20230703_1_L2A", "MGRS-B", 3),
            item("S2A_C_20230704_0_L2A", "MGRS-C", 4),
        ]);
        let angles = FlakyAngles { calls: AtomicUsize::new(0) };
        let sensor = sensor_meta("S2_SR").unwrap();
        let curator = CatalogCurator::new(&catalog, &angles, &sensor)
            .with_retry(RetryPolicy::none(), RetryPolicy::new(2, Duration::ZERO));

        let curated = curator.curate(&query()).unwrap();
        assert_eq!(curated.items.len(), 4);

        let codes: Vec<&str> = curated.granules.iter().map(|g| g.grid_code.as_str()).collect();
        assert_eq!(codes, vec!["MGRS-B", "MGRS-A", "MGRS-C"]);

        let a = &curated.items[0];
        assert_eq!(a.sun_zenith, 50.0);
        assert_eq!(a.view_zenith, 5.0);
        assert_eq!(a.sensor_code, 22);

        let b = &curated.items[1];
        assert_eq!(b.view_zenith, 0.0);
        assert_eq!(b.view_azimuth, 0.0);

        // 2 failing items x 2 attempts + 2 healthy items
        assert_eq!(angles.calls.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_missing_sun_angles_default_to_zero() {
        let mut bare = item("L8_X_20230701", "WRS2-015028", 1);
        bare.sun_elevation = None;
        bare.sun_azimuth = None;
        let catalog = FixedCatalog(vec![bare]);
        let angles = FlakyAngles { calls: AtomicUsize::new(0) };
        let sensor = sensor_meta("L8_SR").unwrap();
        let curated = CatalogCurator::new(&catalog, &angles, &sensor)
            .with_retry(RetryPolicy::none(), RetryPolicy::none())
            .curate(&query())
            .unwrap();
        assert_eq!(curated.items[0].sun_zenith, 0.0);
        assert_eq!(curated.items[0].sun_azimuth, 0.0);
    }

    #[test]
    fn test_dedupe_keeps_every_landsat_date() {
        let kept = dedupe_by_core_id(vec![
            item("LC08_L2SP_015028_20230704_02_T1", "WRS2-015028", 4),
            item("LC08_L2SP_015028_20230720_02_T1", "WRS2-015028", 20),
            item("LC09_L2SP_015028_20230712_02_T1", "WRS2-015028", 12),
            // reprocessed copy of the 20 July pass
            item("LC08_L2SP_015028_20230720_20230805_02_T2", "WRS2-015028", 20),
        ]);
        let ids: Vec<&str> = kept.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "LC08_L2SP_015028_20230704_02_T1",
                "LC08_L2SP_015028_20230720_02_T1",
                "LC09_L2SP_015028_20230712_02_T1",
            ]
        );
    }

    #[test]
    fn test_dedupe_hls_versions() {
        let kept = dedupe_by_core_id(vec![
            item("HLS.L30.T17WMU.2023207T160831.v2.0", "MGRS-17WMU", 26),
            item("HLS.L30.T17WMU.2023207T160831.v1.4", "MGRS-17WMU", 26),
            item("HLS.S30.T17WMU.2023208T161829.v2.0", "MGRS-17WMU", 27),
        ]);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].id, "HLS.L30.T17WMU.2023207T160831.v2.0");
    }
}
