//! Display density and effective resolution
//!
//! - `resolution`: pure calculation from (display, zoom, quality) to dpi
//! - `monitor`: debounced, significance-filtered display change stream

mod monitor;
mod resolution;

pub use monitor::{
    debounce, DisplayMonitor, DisplaySignalSource, HostDisplayContext, DEFAULT_DEBOUNCE_WINDOW,
};
pub use resolution::{
    calculate_effective_resolution, relative_change, DisplayInfo, RenderingQuality,
    SignificanceFilter, BASE_DPI, DEFAULT_SIGNIFICANCE_THRESHOLD, MAX_RESOLUTION, MIN_RESOLUTION,
};
