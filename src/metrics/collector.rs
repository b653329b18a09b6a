//! Performance sample collection
//!
//! Samples land in a fixed-capacity ring buffer; the oldest sample is
//! overwritten once it is full. The lock is held only for the push or copy.

use std::collections::VecDeque;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::display::RenderingQuality;
use crate::error::ExportError;
use crate::settings::SettingsProvider;

use super::export::{self, ExportFormat};

/// Default number of retained samples
pub const DEFAULT_METRICS_CAPACITY: usize = 1000;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Frame rate assumed for render samples before the host reports one
pub const NOMINAL_FPS: f64 = 60.0;

/// Coarse health classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PerformanceLevel {
    Good,
    Warning,
    Critical,
}

impl PerformanceLevel {
    /// Critical if `fps < 15` or memory above 1000 MB; Warning if `fps < 30`
    /// or memory above 500 MB; Good otherwise.
    pub fn classify(fps: f64, total_memory_mb: f64) -> Self {
        if fps < 15.0 || total_memory_mb > 1000.0 {
            PerformanceLevel::Critical
        } else if fps < 30.0 || total_memory_mb > 500.0 {
            PerformanceLevel::Warning
        } else {
            PerformanceLevel::Good
        }
    }
}

impl fmt::Display for PerformanceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PerformanceLevel::Good => f.write_str("good"),
            PerformanceLevel::Warning => f.write_str("warning"),
            PerformanceLevel::Critical => f.write_str("critical"),
        }
    }
}

/// One telemetry sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSample {
    pub timestamp: DateTime<Utc>,
    pub fps: f64,
    #[serde(rename = "managedMemoryMB")]
    pub managed_memory_mb: f64,
    #[serde(rename = "nativeMemoryMB")]
    pub native_memory_mb: f64,
    #[serde(rename = "lastRenderTimeMs")]
    pub last_render_time_ms: f64,
    pub level: PerformanceLevel,
}

impl PerformanceSample {
    pub fn new(fps: f64, managed_memory_mb: f64, native_memory_mb: f64, last_render_time_ms: f64) -> Self {
        Self {
            timestamp: Utc::now(),
            fps,
            managed_memory_mb,
            native_memory_mb,
            last_render_time_ms,
            level: PerformanceLevel::classify(fps, managed_memory_mb + native_memory_mb),
        }
    }

    pub fn total_memory_mb(&self) -> f64 {
        self.managed_memory_mb + self.native_memory_mb
    }
}

/// Fixed-capacity FIFO that overwrites its oldest entry
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Push, returning the overwritten item when full
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.items.len() == self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        evicted
    }

    pub fn latest(&self) -> Option<&T> {
        self.items.back()
    }

    /// Oldest first
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Collects performance samples from any thread
pub struct MetricsCollector {
    samples: Mutex<RingBuffer<PerformanceSample>>,
    last_render_micros: AtomicU64,
    native_memory_bytes: AtomicU64,
    dropped: AtomicU64,
    settings: Option<Arc<dyn SettingsProvider>>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(DEFAULT_METRICS_CAPACITY)
    }
}

impl MetricsCollector {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: Mutex::new(RingBuffer::new(capacity)),
            last_render_micros: AtomicU64::new(0),
            native_memory_bytes: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            settings: None,
        }
    }

    /// Follow the provider's observability switch
    pub fn with_settings(mut self, settings: Arc<dyn SettingsProvider>) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.settings
            .as_ref()
            .map_or(true, |settings| settings.metrics_enabled())
    }

    /// Record a sample; `None` when collection is disabled
    pub fn record_sample(
        &self,
        fps: f64,
        managed_memory_mb: f64,
        native_memory_mb: f64,
    ) -> Option<PerformanceSample> {
        let sample = PerformanceSample::new(
            fps,
            managed_memory_mb,
            native_memory_mb,
            self.last_render_micros.load(Ordering::Relaxed) as f64 / 1000.0,
        );
        self.push_sample(sample.clone()).then_some(sample)
    }

    /// Record a frame; native memory comes from the coordinator's gauge
    pub fn record_frame(&self, fps: f64, managed_memory_mb: f64) -> Option<PerformanceSample> {
        self.record_sample(fps, managed_memory_mb, self.native_memory_mb())
    }

    /// Store a prebuilt sample. Returns false when collection is disabled.
    pub fn push_sample(&self, sample: PerformanceSample) -> bool {
        if !self.is_enabled() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        if sample.level != PerformanceLevel::Good {
            tracing::debug!(
                level = %sample.level,
                fps = sample.fps,
                total_memory_mb = sample.total_memory_mb(),
                "Degraded performance sample"
            );
        }
        self.samples.lock().push(sample);
        true
    }

    pub fn record_render_time(&self, duration: Duration) {
        let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        self.last_render_micros.store(micros, Ordering::Relaxed);
    }

    /// Record a completed render as a sample.
    ///
    /// Frame rate and managed memory carry over from the latest sample
    /// (`NOMINAL_FPS` and 0 before the host reported any); native memory
    /// comes from the gauge.
    pub fn record_render(&self, duration: Duration) -> Option<PerformanceSample> {
        self.record_render_time(duration);
        let (fps, managed_memory_mb) = self
            .samples
            .lock()
            .latest()
            .map_or((NOMINAL_FPS, 0.0), |sample| (sample.fps, sample.managed_memory_mb));
        self.record_sample(fps, managed_memory_mb, self.native_memory_mb())
    }

    pub fn last_render_time(&self) -> Duration {
        Duration::from_micros(self.last_render_micros.load(Ordering::Relaxed))
    }

    pub fn set_native_memory_bytes(&self, bytes: u64) {
        self.native_memory_bytes.store(bytes, Ordering::Relaxed);
    }

    pub fn native_memory_mb(&self) -> f64 {
        self.native_memory_bytes.load(Ordering::Relaxed) as f64 / BYTES_PER_MB
    }

    /// Most recent sample
    pub fn current_snapshot(&self) -> Option<PerformanceSample> {
        self.samples.lock().latest().cloned()
    }

    /// Samples no older than `window`, oldest first
    pub fn history(&self, window: Duration) -> Vec<PerformanceSample> {
        let cutoff = chrono::Duration::from_std(window)
            .ok()
            .and_then(|window| Utc::now().checked_sub_signed(window));

        let samples = self.samples.lock();
        samples
            .iter()
            .filter(|sample| cutoff.map_or(true, |cutoff| sample.timestamp >= cutoff))
            .cloned()
            .collect()
    }

    /// All retained samples, oldest first
    pub fn samples(&self) -> Vec<PerformanceSample> {
        self.samples.lock().iter().cloned().collect()
    }

    /// Level of the latest sample; Good when nothing was recorded
    pub fn current_level(&self) -> PerformanceLevel {
        self.samples
            .lock()
            .latest()
            .map_or(PerformanceLevel::Good, |sample| sample.level)
    }

    /// Warning steps quality down one level, Critical pins Low
    pub fn suggest_quality(&self, requested: RenderingQuality) -> RenderingQuality {
        match self.current_level() {
            PerformanceLevel::Good => requested,
            PerformanceLevel::Warning => requested.step_down(),
            PerformanceLevel::Critical => RenderingQuality::Low,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.samples.lock().capacity()
    }

    /// Samples discarded while collection was disabled
    pub fn dropped_samples(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Write all retained samples; returns the number written
    pub fn export(&self, path: &Path, format: ExportFormat) -> Result<usize, ExportError> {
        let samples = self.samples();
        export::export_to_path(&samples, path, format)?;
        tracing::info!(path = %path.display(), %format, samples = samples.len(), "Exported metrics");
        Ok(samples.len())
    }
}
