//! Page rendering pipeline
//!
//! - `types`: requests, cache keys, rendered pages and image streams
//! - `strategy`: resident vs file-backed rendering and selection
//! - `cache`: bounded LRU of rendered pages
//! - `coordinator`: dedup, admission, cancellation and timeouts

mod cache;
mod coordinator;
mod strategy;
mod types;

pub use cache::{BitmapCache, CacheStats, DEFAULT_CACHE_CAPACITY};
pub use coordinator::{
    AdmissionGate, CoordinatorBuilder, CoordinatorConfig, CoordinatorStats, RenderCoordinator,
};
pub use strategy::{
    select_strategy, FixedMemoryProbe, MemoryProbe, RenderStrategy, SelectionInputs,
    SystemMemoryProbe, DEFAULT_LOW_MEMORY_THRESHOLD_MB,
};
pub use types::{
    CacheKey, CancelSignal, ImageStream, PageImage, PageRenderRequest, RenderContext, RenderState,
    RenderedPage, StrategyKind,
};
