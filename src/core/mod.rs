//! Mosaic compositing engine

pub mod canvas;
pub mod compositor;
pub mod curator;
pub mod dispatch;
pub mod merge;
pub mod mosaic;
pub mod scoring;
pub mod tiling;

// Re-export main types
pub use canvas::{canvas_band_names, CanvasBuilder, RasterCanvas};
pub use compositor::{CompositeSettings, GranuleComposite, GranuleCompositor};
pub use curator::{CatalogCurator, CuratedCatalog};
pub use dispatch::{
    BatchQueue, ClusterPool, ClusterSizing, Completion, CompletionStream, GranuleTask, JobId, LocalPool, NodeSpec,
    TaskResult, WorkerPool,
};
pub use merge::{MergeOutcome, MergeReducer};
pub use mosaic::{Mosaic, MosaicEngine, MosaicPlan, MosaicStats};
pub use scoring::{ScoreReference, SpectralBranch, SpectralPixel};
pub use tiling::{Block, BlockLayout};
