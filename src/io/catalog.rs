//! STAC catalog search

use crate::io::http::HttpClient;
use crate::types::{MosaicError, MosaicResult, Region};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;

/// Largest page requested from a STAC endpoint
const MAX_PAGE_SIZE: usize = 100;

/// One catalog search request
#[derive(Debug, Clone)]
pub struct CatalogQuery {
    /// STAC API root, e.g. `https://earth-search.aws.element84.com/v1`
    pub endpoint: String,
    pub collection: String,
    pub region: Region,
    pub start: NaiveDate,
    /// Inclusive
    pub end: NaiveDate,
    /// Upper bound on `eo:cloud_cover`, percent
    pub cloud_cover: f64,
    /// Result cap
    pub max_items: usize,
}

impl CatalogQuery {
    /// ISO-8601 interval covering whole start and end days
    pub fn datetime_range(&self) -> String {
        format!(
            "{}T00:00:00Z/{}T23:59:59Z",
            self.start.format("%Y-%m-%d"),
            self.end.format("%Y-%m-%d")
        )
    }

    /// STAC item-search request body
    pub fn to_search_body(&self) -> serde_json::Value {
        serde_json::json!({
            "collections": [self.collection],
            "intersects": self.region.to_geojson(),
            "datetime": self.datetime_range(),
            "query": { "eo:cloud_cover": { "lt": self.cloud_cover } },
            "limit": self.max_items.min(MAX_PAGE_SIZE),
        })
    }
}

/// Scene descriptor as returned by the catalog, before enrichment
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogItem {
    pub id: String,
    pub datetime: DateTime<Utc>,
    pub grid_code: String,
    pub platform: String,
    pub cloud_cover: Option<f64>,
    /// Degrees above the horizon
    pub sun_elevation: Option<f64>,
    pub sun_azimuth: Option<f64>,
    /// Asset name -> href
    pub assets: BTreeMap<String, String>,
}

/// Source of scene descriptors
pub trait SceneCatalog: Send + Sync {
    fn search(&self, query: &CatalogQuery) -> MosaicResult<Vec<CatalogItem>>;
}

#[derive(Debug, Deserialize)]
struct FeatureCollection {
    #[serde(default)]
    features: Vec<Feature>,
    #[serde(default)]
    links: Vec<Link>,
}

#[derive(Debug, Deserialize)]
struct Feature {
    id: String,
    properties: Properties,
    #[serde(default)]
    assets: BTreeMap<String, Asset>,
}

#[derive(Debug, Deserialize)]
struct Properties {
    datetime: Option<DateTime<Utc>>,
    #[serde(default)]
    platform: Option<String>,
    #[serde(rename = "grid:code", default)]
    grid_code: Option<String>,
    #[serde(rename = "eo:cloud_cover", default)]
    cloud_cover: Option<f64>,
    #[serde(rename = "view:sun_elevation", default)]
    sun_elevation: Option<f64>,
    #[serde(rename = "view:sun_azimuth", default)]
    sun_azimuth: Option<f64>,
    #[serde(rename = "landsat:wrs_path", default)]
    wrs_path: Option<serde_json::Value>,
    #[serde(rename = "landsat:wrs_row", default)]
    wrs_row: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct Asset {
    href: String,
}

#[derive(Debug, Deserialize)]
struct Link {
    rel: String,
    href: String,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    body: Option<serde_json::Value>,
    #[serde(default)]
    merge: bool,
}

/// STAC API catalog reached through an [`HttpClient`]
pub struct StacCatalog<C: HttpClient> {
    client: C,
}

impl<C: HttpClient> StacCatalog<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &C {
        &self.client
    }
}

impl<C: HttpClient> SceneCatalog for StacCatalog<C> {
    fn search(&self, query: &CatalogQuery) -> MosaicResult<Vec<CatalogItem>> {
        let search_url = format!("{}/search", query.endpoint.trim_end_matches('/'));
        let base_body = query.to_search_body();

        log::info!(
            "Searching {} for {} items in {}",
            query.collection,
            query.datetime_range(),
            query.endpoint
        );

        let mut items = Vec::new();
        let mut page = self.client.post_json(&search_url, &base_body.to_string())?;
        let mut page_count = 1;

        loop {
            let collection: FeatureCollection = serde_json::from_slice(&page)?;
            let returned = collection.features.len();
            log::debug!("Catalog page {}: {} features", page_count, returned);

            for feature in collection.features {
                if items.len() >= query.max_items {
                    break;
                }
                if let Some(item) = convert_feature(feature) {
                    items.push(item);
                }
            }

            if items.len() >= query.max_items || returned == 0 {
                break;
            }

            let next = collection.links.into_iter().find(|l| l.rel == "next");
            let Some(next) = next else { break };

            page = match next.method.as_deref() {
                Some(m) if m.eq_ignore_ascii_case("POST") => {
                    let body = match next.body {
                        Some(body) if next.merge => merge_body(&base_body, &body),
                        Some(body) => body,
                        None => base_body.clone(),
                    };
                    self.client.post_json(&next.href, &body.to_string())?
                }
                _ => self.client.get(&next.href)?,
            };
            page_count += 1;
        }

        log::info!("Catalog returned {} items for {}", items.len(), query.collection);
        Ok(items)
    }
}

fn merge_body(base: &serde_json::Value, overlay: &serde_json::Value) -> serde_json::Value {
    let mut merged = base.clone();
    if let (Some(target), Some(source)) = (merged.as_object_mut(), overlay.as_object()) {
        for (key, value) in source {
            target.insert(key.clone(), value.clone());
        }
    }
    merged
}

fn convert_feature(feature: Feature) -> Option<CatalogItem> {
    let props = feature.properties;

    let Some(datetime) = props.datetime else {
        log::warn!("Skipping item {}: no acquisition datetime", feature.id);
        return None;
    };

    let grid_code = match props.grid_code {
        Some(code) => code,
        None => match wrs_grid_code(props.wrs_path.as_ref(), props.wrs_row.as_ref()) {
            Some(code) => code,
            None => {
                log::warn!("Skipping item {}: no grid code", feature.id);
                return None;
            }
        },
    };

    Some(CatalogItem {
        id: feature.id,
        datetime,
        grid_code,
        platform: props.platform.unwrap_or_default(),
        cloud_cover: props.cloud_cover,
        sun_elevation: props.sun_elevation,
        sun_azimuth: props.sun_azimuth,
        assets: feature
            .assets
            .into_iter()
            .map(|(name, asset)| (name, asset.href))
            .collect(),
    })
}

fn wrs_number(value: &serde_json::Value) -> Option<u32> {
    match value {
        serde_json::Value::Number(n) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// `WRS2-PPPRRR` from Landsat path/row properties
fn wrs_grid_code(path: Option<&serde_json::Value>, row: Option<&serde_json::Value>) -> Option<String> {
    let path = wrs_number(path?)?;
    let row = wrs_number(row?)?;
    Some(format!("WRS2-{:03}{:03}", path, row))
}

/// Parse a catalog page without a network round trip
pub fn parse_items(page: &[u8]) -> MosaicResult<Vec<CatalogItem>> {
    let collection: FeatureCollection = serde_json::from_slice(page)
        .map_err(|e| MosaicError::InvalidFormat(format!("STAC item collection: {}", e)))?;
    Ok(collection.features.into_iter().filter_map(convert_feature).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"{
        "type": "FeatureCollection",
        "features": [
            {
                "id": "S2A_17WMU_20230727_0_L2A",
                "properties": {
                    "datetime": "2023-07-27T16:58:21.024000Z",
                    "platform": "sentinel-2a",
                    "grid:code": "MGRS-17WMU",
                    "eo:cloud_cover": 12.5,
                    "view:sun_elevation": 40.0,
                    "view:sun_azimuth": 170.0
                },
                "assets": {
                    "blue": {"href": "https://example.com/B02.tif"},
                    "granule_metadata": {"href": "https://example.com/metadata.xml"}
                }
            },
            {
                "id": "LC08_L2SP_015028_20230720_02_T1",
                "properties": {
                    "datetime": "2023-07-20T15:40:00Z",
                    "platform": "landsat-8",
                    "landsat:wrs_path": "015",
                    "landsat:wrs_row": "028"
                },
                "assets": {}
            },
            {
                "id": "no_grid",
                "properties": {"datetime": "2023-07-21T00:00:00Z"},
                "assets": {}
            }
        ],
        "links": []
    }"#;

    #[test]
    fn test_parse_items() {
        let items = parse_items(PAGE.as_bytes()).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].grid_code, "MGRS-17WMU");
        assert_eq!(items[0].sun_elevation, Some(40.0));
        assert_eq!(items[0].assets["granule_metadata"], "https://example.com/metadata.xml");
        assert_eq!(items[1].grid_code, "WRS2-015028");
        assert_eq!(items[1].sun_azimuth, None);
    }

    #[test]
    fn test_search_body() {
        let query = CatalogQuery {
            endpoint: "https://stac.example".into(),
            collection: "sentinel-2-l2a".into(),
            region: Region::from_bounds(-76.0, 45.0, -75.0, 46.0),
            start: NaiveDate::from_ymd_opt(2023, 6, 15).unwrap(),
            end: NaiveDate::from_ymd_opt(2023, 9, 15).unwrap(),
            cloud_cover: 85.0,
            max_items: 250,
        };
        let body = query.to_search_body();
        assert_eq!(body["collections"][0], "sentinel-2-l2a");
        assert_eq!(body["datetime"], "2023-06-15T00:00:00Z/2023-09-15T23:59:59Z");
        assert_eq!(body["query"]["eo:cloud_cover"]["lt"], 85.0);
        assert_eq!(body["limit"], 100);
        assert_eq!(body["intersects"]["type"], "Polygon");
    }

    #[test]
    fn test_merge_body_overrides_keys() {
        let base = serde_json::json!({"limit": 100, "collections": ["a"]});
        let overlay = serde_json::json!({"token": "next:abc"});
        let merged = merge_body(&base, &overlay);
        assert_eq!(merged["limit"], 100);
        assert_eq!(merged["token"], "next:abc");
    }
}
