pub mod catalog;
pub mod granule_meta;
pub mod http;
pub mod loader;
pub mod retry;
pub mod slurm;

pub use catalog::{CatalogItem, CatalogQuery, SceneCatalog, StacCatalog};
pub use granule_meta::{ViewAngleSource, ViewAngles};
pub use http::{HttpClient, ReqwestClient};
pub use loader::{LoadRequest, PixelCube, PixelLoader};
pub use retry::RetryPolicy;
