//! Lightweight performance telemetry
//!
//! Fixed-capacity sample history, health classification, and export to JSON
//! or CSV. The collector is shared by the render-owner thread (render times,
//! native memory) and the host (frame rate, managed memory).

mod collector;
mod export;

pub use collector::{
    MetricsCollector, PerformanceLevel, PerformanceSample, RingBuffer, DEFAULT_METRICS_CAPACITY,
    NOMINAL_FPS,
};
pub use export::{export_to_path, to_json, write_csv, ExportFormat};
