//! Effective resolution calculation
//!
//! Combines display scale, zoom and quality preference into the sampling
//! density handed to the rasterizer.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reference density of a 1.0-scale display
pub const BASE_DPI: f64 = 96.0;
/// Lowest resolution ever requested from the rasterizer
pub const MIN_RESOLUTION: f64 = 50.0;
/// Highest resolution ever requested from the rasterizer
pub const MAX_RESOLUTION: f64 = 576.0;
/// Default relative change needed before a display change propagates
pub const DEFAULT_SIGNIFICANCE_THRESHOLD: f64 = 0.10;

/// Snapshot of the host display's density
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayInfo {
    /// Pixel density multiplier relative to 96 dpi
    pub rasterization_scale: f64,
    /// 96 × scale
    pub base_resolution: f64,
    /// scale > 1.0
    pub high_density: bool,
    pub detected_at: DateTime<Utc>,
}

impl DisplayInfo {
    /// Build from a raw scale signal. Non-finite or non-positive scales are
    /// treated as 1.0.
    pub fn new(rasterization_scale: f64) -> Self {
        let scale = if rasterization_scale.is_finite() && rasterization_scale > 0.0 {
            rasterization_scale
        } else {
            tracing::warn!(scale = rasterization_scale, "Ignoring invalid display scale");
            1.0
        };

        Self {
            rasterization_scale: scale,
            base_resolution: BASE_DPI * scale,
            high_density: scale > 1.0,
            detected_at: Utc::now(),
        }
    }
}

impl Default for DisplayInfo {
    fn default() -> Self {
        Self::new(1.0)
    }
}

/// Rendering quality preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderingQuality {
    /// Follow the display density
    #[default]
    Auto,
    Low,
    Medium,
    High,
    Ultra,
}

impl RenderingQuality {
    /// Base resolution before zoom is applied
    pub fn base_resolution(self, display: &DisplayInfo) -> f64 {
        match self {
            RenderingQuality::Auto => BASE_DPI * display.rasterization_scale,
            RenderingQuality::Low => 96.0,
            RenderingQuality::Medium => 144.0,
            RenderingQuality::High => 192.0,
            RenderingQuality::Ultra => 288.0,
        }
    }

    /// One notch lower. `Auto` steps to `Medium` since its absolute level
    /// depends on the display.
    pub fn step_down(self) -> Self {
        match self {
            RenderingQuality::Ultra => RenderingQuality::High,
            RenderingQuality::High | RenderingQuality::Auto => RenderingQuality::Medium,
            RenderingQuality::Medium => RenderingQuality::Low,
            RenderingQuality::Low => RenderingQuality::Low,
        }
    }
}

impl fmt::Display for RenderingQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RenderingQuality::Auto => "auto",
            RenderingQuality::Low => "low",
            RenderingQuality::Medium => "medium",
            RenderingQuality::High => "high",
            RenderingQuality::Ultra => "ultra",
        };
        f.write_str(name)
    }
}

impl FromStr for RenderingQuality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(RenderingQuality::Auto),
            "low" => Ok(RenderingQuality::Low),
            "medium" => Ok(RenderingQuality::Medium),
            "high" => Ok(RenderingQuality::High),
            "ultra" => Ok(RenderingQuality::Ultra),
            other => Err(format!("unknown rendering quality '{}'", other)),
        }
    }
}

/// Effective sampling resolution, always within
/// [`MIN_RESOLUTION`, `MAX_RESOLUTION`].
pub fn calculate_effective_resolution(
    display: &DisplayInfo,
    zoom: f64,
    quality: RenderingQuality,
) -> f64 {
    let zoom = if zoom.is_finite() && zoom > 0.0 { zoom } else { 1.0 };
    (quality.base_resolution(display) * zoom).clamp(MIN_RESOLUTION, MAX_RESOLUTION)
}

/// Relative difference between two resolutions
pub fn relative_change(previous: f64, next: f64) -> f64 {
    if previous <= 0.0 {
        return f64::INFINITY;
    }
    ((next - previous) / previous).abs()
}

/// Passes a resolution only when it moved more than `threshold` (relative)
/// away from the last value it passed.
#[derive(Debug, Clone)]
pub struct SignificanceFilter {
    threshold: f64,
    last: Option<f64>,
}

impl SignificanceFilter {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            last: None,
        }
    }

    /// Start from a known resolution instead of passing the first value
    pub fn with_baseline(mut self, resolution: f64) -> Self {
        self.last = Some(resolution);
        self
    }

    /// Last resolution that passed
    pub fn last(&self) -> Option<f64> {
        self.last
    }

    /// Feed a resolution; returns whether it should propagate
    pub fn observe(&mut self, resolution: f64) -> bool {
        let significant = match self.last {
            None => true,
            Some(previous) => relative_change(previous, resolution) > self.threshold,
        };
        if significant {
            self.last = Some(resolution);
        }
        significant
    }
}

impl Default for SignificanceFilter {
    fn default() -> Self {
        Self::new(DEFAULT_SIGNIFICANCE_THRESHOLD)
    }
}
